pub mod descriptor;
pub mod entity;
pub mod view;
