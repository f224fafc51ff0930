//! Generates batches of synthetic files and uploads them to object storage.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
