pub mod config;
pub mod suite;
pub mod types;
