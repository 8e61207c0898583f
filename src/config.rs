use clap::Parser;
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Entity selectors (`database.table.column`, `*` allowed) hidden from every prompt
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Optional JSON data dictionary with column descriptions
    #[serde(default)]
    pub data_dictionary: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,   // Model name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub table_selection: String,  // "decider", "per_table" or "off"
    pub column_selection: String, // "per_table", "batched", "few_shot" or "off"
    #[serde(default = "default_join_selection")]
    pub join_selection: String, // "zero_shot", "few_shot" or "off"
    pub sql_generation: String, // "zero_shot", "few_shot", "raw" or "react"
    /// Turn limit for the `react` generator
    #[serde(default = "default_agent_iterations")]
    pub agent_max_iterations: usize,
    pub repair: bool,
    pub repair_attempts: usize,
    pub max_rows_limit: usize,
    pub enum_limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AnalyticsConfig {
    pub output_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Answer a single question against this database and exit
    #[arg(short, long, requires = "question")]
    pub database: Option<String>,

    /// Natural language question for one-shot mode
    #[arg(short, long, requires = "database")]
    pub question: Option<String>,
}

fn default_pool_size() -> usize {
    4
}

fn default_join_selection() -> String {
    "off".to_string()
}

fn default_agent_iterations() -> usize {
    crate::tasks::react::DEFAULT_MAX_ITERATIONS
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> usize {
    2000
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Start with default configuration
        let mut config_builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl2sql/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }

        Ok(config)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|db| db.name == name)
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "ollama".to_string(),
                model: "sqlcoder".to_string(),
                api_key: None,
                api_url: None,
                temperature: default_temperature(),
                max_tokens: default_max_tokens(),
            },
            pipeline: PipelineConfig {
                table_selection: "decider".to_string(),
                column_selection: "per_table".to_string(),
                join_selection: default_join_selection(),
                sql_generation: "zero_shot".to_string(),
                agent_max_iterations: default_agent_iterations(),
                repair: true,
                repair_attempts: 10,
                max_rows_limit: 1000,
                enum_limit: 10,
            },
            databases: Vec::new(),
            analytics: AnalyticsConfig {
                output_dir: "logs".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let args = CliArgs {
            config: Some(PathBuf::from("does-not-exist.toml")),
            host: None,
            port: Some(8080),
            database: None,
            question: None,
        };
        // A missing explicit file is an error, defaults alone are not
        assert!(AppConfig::new(&args).is_err());

        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.web.port, 3000);
        assert_eq!(config.pipeline.repair_attempts, 10);
        assert!(config.databases.is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let toml = r#"
            [pipeline]
            table_selection = "off"
            column_selection = "off"
            join_selection = "few_shot"
            sql_generation = "react"
            repair = false
            repair_attempts = 2
            max_rows_limit = 50
            enum_limit = 5

            [[databases]]
            name = "pets"
            path = "pets.duckdb"
            exclude = ["pets.owners.ssn"]
        "#;
        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default()).unwrap())
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.sql_generation, "react");
        assert_eq!(config.pipeline.join_selection, "few_shot");
        assert_eq!(config.pipeline.agent_max_iterations, 15);
        assert!(!config.pipeline.repair);
        assert_eq!(config.llm.backend, "ollama");
        let pets = config.database("pets").unwrap();
        assert_eq!(pets.pool_size, 4);
        assert_eq!(pets.exclude, vec!["pets.owners.ssn".to_string()]);
    }
}
