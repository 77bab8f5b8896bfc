#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Core data model shared across the storage-node lifecycle engine.
//!
//! The obligations snapshot is supplied by an external source and consumed
//! read-only; nothing in this crate mutates it after construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error produced when parsing a data object identifier from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid data object id")]
pub struct InvalidDataObjectId {
    /// The rejected input.
    pub raw: String,
}

/// Identifier of a single content-addressed data object.
///
/// Identifiers are numeric but rendered as strings at every external boundary
/// (file names, trackfile lines, remote APIs). The total order is numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataObjectId(u64);

impl DataObjectId {
    /// Wrap a raw numeric identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of the identifier.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DataObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataObjectId {
    type Err = InvalidDataObjectId;

    /// Parses the canonical decimal rendering of an identifier.
    ///
    /// Only the exact round-trippable form is accepted so that directory-scan
    /// classification (`"42"` is an object, `"042"` and `"42.tar"` are not)
    /// stays unambiguous.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = s.parse::<u64>().map_err(|_| InvalidDataObjectId {
            raw: s.to_string(),
        })?;
        if parsed.to_string() != s {
            return Err(InvalidDataObjectId { raw: s.to_string() });
        }
        Ok(Self(parsed))
    }
}

impl TryFrom<String> for DataObjectId {
    type Error = InvalidDataObjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataObjectId> for String {
    fn from(id: DataObjectId) -> Self {
        id.to_string()
    }
}

/// Identifier of a bag (a unit of data objects assigned to buckets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BagId(String);

impl BagId {
    /// Wrap a raw bag identifier.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// String form of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    /// Wrap a raw bucket identifier.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// String form of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A data object the node is obligated to store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataObjectInfo {
    /// Object identifier.
    pub id: DataObjectId,
    /// Object size in bytes.
    pub size: u64,
    /// Hex-encoded content hash used to verify downloads.
    pub content_hash: String,
    /// Bag the object belongs to.
    pub bag_id: BagId,
}

/// A bag and the buckets it is currently assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bag {
    /// Bag identifier.
    pub id: BagId,
    /// Buckets currently holding the bag.
    pub bucket_ids: Vec<BucketId>,
}

/// A storage bucket and the endpoint of the node operating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBucket {
    /// Bucket identifier.
    pub id: BucketId,
    /// Root URL of the operator's storage-node API, when known.
    pub operator_url: Option<String>,
}

/// Read-only snapshot of what this node must currently store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObligationsModel {
    /// Objects assigned to the node's buckets.
    pub data_objects: Vec<DataObjectInfo>,
    /// Bags referenced by the assigned objects.
    pub bags: Vec<Bag>,
    /// Buckets referenced by the bags.
    pub storage_buckets: Vec<StorageBucket>,
}

impl ObligationsModel {
    /// Look up a bag by id.
    #[must_use]
    pub fn bag(&self, id: &BagId) -> Option<&Bag> {
        self.bags.iter().find(|bag| &bag.id == id)
    }

    /// Look up a bucket by id.
    #[must_use]
    pub fn bucket(&self, id: &BucketId) -> Option<&StorageBucket> {
        self.storage_buckets.iter().find(|bucket| &bucket.id == id)
    }

    /// Operator URLs of the given buckets, skipping buckets without one.
    #[must_use]
    pub fn operator_urls(&self, bucket_ids: &[BucketId]) -> Vec<String> {
        bucket_ids
            .iter()
            .filter_map(|id| self.bucket(id))
            .filter_map(|bucket| bucket.operator_url.clone())
            .collect()
    }
}

/// Durable record of an archive that was built and confirmed uploaded.
///
/// Written once per archive, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    /// Remote key of the archive (hash of the sorted member id list).
    pub name: String,
    /// Objects the archive contains.
    pub data_object_ids: Vec<DataObjectId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_object_ids_order_numerically() {
        let small: DataObjectId = "9".parse().expect("parse");
        let large: DataObjectId = "10".parse().expect("parse");
        assert!(small < large);
        assert_eq!(small.to_string(), "9");
    }

    #[test]
    fn non_canonical_ids_are_rejected() {
        assert!("042".parse::<DataObjectId>().is_err());
        assert!("1.5".parse::<DataObjectId>().is_err());
        assert!("abc".parse::<DataObjectId>().is_err());
        assert!("".parse::<DataObjectId>().is_err());
        assert!("-1".parse::<DataObjectId>().is_err());
    }

    #[test]
    fn manifest_serializes_with_string_ids() {
        let manifest = ArchiveManifest {
            name: "abc".to_string(),
            data_object_ids: vec![DataObjectId::new(1), DataObjectId::new(2)],
        };
        let json = serde_json::to_string(&manifest).expect("serialize");
        assert_eq!(json, r#"{"name":"abc","dataObjectIds":["1","2"]}"#);
        let back: ArchiveManifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, manifest);
    }

    #[test]
    fn model_lookups_resolve_operator_urls() {
        let model = ObligationsModel {
            data_objects: vec![],
            bags: vec![Bag {
                id: BagId::new("bag:1"),
                bucket_ids: vec![BucketId::new("1"), BucketId::new("2")],
            }],
            storage_buckets: vec![
                StorageBucket {
                    id: BucketId::new("1"),
                    operator_url: Some("http://one.example".to_string()),
                },
                StorageBucket {
                    id: BucketId::new("2"),
                    operator_url: None,
                },
            ],
        };
        let bag = model.bag(&BagId::new("bag:1")).expect("bag");
        let urls = model.operator_urls(&bag.bucket_ids);
        assert_eq!(urls, vec!["http://one.example".to_string()]);
    }
}
