pub mod chain;
pub mod chunker;
pub mod classify;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod http_server;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pdf_parser;
pub mod pipeline;
pub mod search;
pub mod watcher;

pub use config::AppConfig;
pub use pipeline::{Components, Pipeline, ReloadOutcome};
