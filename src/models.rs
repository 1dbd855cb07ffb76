//! Core data model: the items, failures, and batches that flow through
//! the sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One addressable section of an item's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub text: String,
    pub link: Option<String>,
}

/// Access-control metadata attached to an item, carried through to the
/// downstream index. The framework treats this as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccessDescriptor {
    /// Whether the item is visible to everyone in the organization.
    pub is_public: bool,
    /// External user/group identifiers with access.
    pub allowed: Vec<String>,
}

/// A fully-materialized item produced by a connector.
///
/// `id` is always a pure function of stable source identifiers (see
/// [`stable_item_id`]) — never randomly generated — which is what makes
/// downstream upsert-by-id idempotent and at-least-once delivery safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub sections: Vec<Section>,
    /// Source instance label, `"{type}:{name}"`.
    pub source: String,
    /// Human-readable identifier (title, filename, call subject).
    pub semantic_identifier: String,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub access: Option<AccessDescriptor>,
}

/// Id-and-access-only record used by deletion/permission sweeps.
/// Never carries content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlimItem {
    pub id: String,
    #[serde(default)]
    pub access: Option<AccessDescriptor>,
}

/// A non-fatal, per-item outcome. Distinct from a run-aborting error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub item_id: String,
    pub message: String,
    /// Debug rendering of the underlying error, when one exists.
    pub cause: Option<String>,
}

/// What one slot of a batch holds.
#[derive(Debug, Clone)]
pub enum ItemOrFailure {
    Item(Item),
    Failure(Failure),
}

impl ItemOrFailure {
    pub fn item_id(&self) -> &str {
        match self {
            ItemOrFailure::Item(item) => &item.id,
            ItemOrFailure::Failure(failure) => &failure.item_id,
        }
    }
}

/// The unit handed to the caller between network round-trips. Bounded by
/// the configured batch size.
pub type Batch = Vec<ItemOrFailure>;

/// Derive a stable item id from a source label and the ordered stable
/// identifiers of the underlying record.
///
/// The same logical source item always hashes to the same id across runs,
/// regardless of fetch order or process restarts.
pub fn stable_item_id(source_label: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_label.as_bytes());
    for part in parts {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_item_id_is_deterministic() {
        let a = stable_item_id("feed:calls", &["ws-1", "call-42"]);
        let b = stable_item_id("feed:calls", &["ws-1", "call-42"]);
        assert_eq!(a, b);
    }

    #[test]
    fn stable_item_id_separates_parts() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = stable_item_id("feed:calls", &["ab", "c"]);
        let b = stable_item_id("feed:calls", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn stable_item_id_varies_by_source() {
        let a = stable_item_id("feed:calls", &["call-42"]);
        let b = stable_item_id("feed:tickets", &["call-42"]);
        assert_ne!(a, b);
    }
}
