pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod journal;
pub mod metrics;
pub mod orchestrator;
pub mod strategy;
pub mod ui;
