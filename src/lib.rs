pub mod config;
pub mod error;
pub mod health;
pub mod ingestor;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod producer;
pub mod sender;
pub mod state_machine;
pub mod store;
