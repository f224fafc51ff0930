//! Core data models for the batch generator.
//!
//! Persisted entities (containers, objects, metadata, staged parts) map to
//! database tables via `sqlx::FromRow`; run-scoped values describe a batch
//! and its per-file work.

pub mod container;
pub mod metadata;
pub mod multipart;
pub mod object;
pub mod run;
pub mod task;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
