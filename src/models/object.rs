//! Represents an object (file) stored in a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a single committed object within a container.
///
/// The struct stores the object's bookkeeping, not the content bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent container.
    pub container_id: Uuid,

    /// Object name within the container.
    pub name: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the committed payload.
    pub etag: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}
