pub mod artifact;
pub mod containers;
pub mod content;
pub mod digest;
pub mod maker;
pub mod progress;
pub mod scheduler;
pub mod storage_service;
pub mod upload;
