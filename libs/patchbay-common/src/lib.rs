pub mod config;
pub mod spec;
pub mod types;
