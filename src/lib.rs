pub mod agent;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod provider;
pub mod tasks;
pub mod tools;
