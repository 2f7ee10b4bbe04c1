pub mod args;
pub mod artifact;
pub mod commands;
pub mod config;
pub mod error;
pub mod helper;
pub mod image_config;
pub mod orchestrator;
pub mod rt;
pub mod teardown;
