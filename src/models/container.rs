//! Represents a storage container (a top-level namespace for uploaded objects)
//! and the configured description of which containers a run targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Number of containers generated when `BlobContainers` is not configured.
pub const DEFAULT_CONTAINER_COUNT: usize = 5;

/// A storage container known to the backend.
///
/// Containers are resolved once per run and shared read-only by every file
/// task, so this type only carries identity, not contents.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Container {
    /// Unique identifier for this container (UUID for internal DB use).
    pub id: Uuid,

    /// Container name, unique within the backend.
    pub name: String,

    /// When this container was first created.
    pub created_at: DateTime<Utc>,
}

/// Which containers a run should upload into.
///
/// Parsed from the `BlobContainers` setting, which is either a count of
/// randomly named containers or a comma separated list of explicit names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerSpec {
    /// Generate this many uuid-named containers.
    Generated(usize),
    /// Use these names, trimmed and de-duplicated in first-seen order.
    Named(Vec<String>),
}

impl ContainerSpec {
    /// Interpret a raw `BlobContainers` value.
    ///
    /// Missing or blank values fall back to `default_count` generated
    /// containers. Negative counts resolve to zero containers, which the
    /// run rejects as a fatal misconfiguration.
    pub fn parse(raw: Option<&str>, default_count: usize) -> Self {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Self::Generated(default_count),
            Some(raw) => raw,
        };

        if let Ok(count) = raw.parse::<i64>() {
            return Self::Generated(count.max(0) as usize);
        }

        let mut names: Vec<String> = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        Self::Named(names)
    }

    /// Concrete container names for this spec. Generated names are fresh on
    /// every call.
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::Generated(count) => (0..*count).map(|_| Uuid::new_v4().to_string()).collect(),
            Self::Named(names) => names.clone(),
        }
    }
}
