//! Identifier generation.
//!
//! All entities use ULID string identifiers: lexicographically sortable
//! by creation time, globally unique without coordination.

use ulid::Ulid;

/// Generate a new unique object identifier.
pub fn new_id() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}
