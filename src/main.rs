use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod db;
mod error;
mod llm;
mod pipeline;
mod prompts;
mod reporting;
mod schema;
mod tasks;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::schema_manager::SchemaCache;
use crate::llm::{LlmManager, TextGenerator};
use crate::pipeline::LinearExecutor;
use crate::prompts::PromptRegistry;
use crate::reporting::{ArtifactSink, FileSink};
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(config.logging.json);

    // Initialize LLM manager
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm: Arc<dyn TextGenerator> = Arc::new(LlmManager::new(&config.llm)?);

    info!("Opening {} configured databases", config.databases.len());
    let cache = SchemaCache::from_config(
        &config.databases,
        config.pipeline.enum_limit,
        config.pipeline.max_rows_limit,
    )?;

    let registry = Arc::new(PromptRegistry::new()?);
    let sink = FileSink::from_env(&config.analytics).map(|sink| {
        info!("Recording pipeline artifacts under {}", config.analytics.output_dir);
        Arc::new(sink) as Arc<dyn ArtifactSink>
    });
    let pipeline = LinearExecutor::from_config(&config.pipeline, llm, registry, sink)?;

    // One-shot mode
    if let (Some(database), Some(question)) = (&args.database, &args.question) {
        let database = cache.get(database).await?;
        let result = pipeline.run(&database, question).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config, cache, pipeline));

    // Initialize schema cache
    info!("Initializing schema cache");
    app_state.warm_cache().await;

    // Start the web server
    info!("Starting nl2sql server on {}:{}", web_config.host, web_config.port);
    match web::run_server(web_config, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
