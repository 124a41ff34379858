//! Point-in-time image of the object store and membership
//!
//! A snapshot replaces every log entry up to `last_included_index`. Followers
//! that fall behind the compacted prefix receive one instead of entries.

use serde::{Deserialize, Serialize};

use super::membership::Membership;

/// Position and configuration a snapshot was taken at
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Committed configuration as of `last_included_index`
    pub membership: Membership,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Encoded object store contents
    #[serde(with = "blob")]
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(index: u64, term: u64, membership: Membership, data: Vec<u8>) -> Self {
        Self {
            metadata: SnapshotMetadata {
                last_included_index: index,
                last_included_term: term,
                membership,
            },
            data,
        }
    }

    pub fn index(&self) -> u64 {
        self.metadata.last_included_index
    }

    pub fn term(&self) -> u64 {
        self.metadata.last_included_term
    }

    /// Whether log position `index` is folded into this snapshot
    pub fn covers(&self, index: u64) -> bool {
        index <= self.metadata.last_included_index
    }
}

/// Serde adapter carrying store images as one base64 string
pub(crate) mod blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
