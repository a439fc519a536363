pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod reload;
pub mod steps;
pub mod worker;
