use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::model::{SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter without a usable bloom filter disagreed with the cache.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter could not explain a count mismatch.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

impl TargetPurpose {
    /// Value of the `goog-listen-tags` label sent with the target, if any.
    pub fn listen_label(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// A query being listened to plus the resume state that lets watch pick up where it left off.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target_id: TargetId,
    pub query: Query,
    pub purpose: TargetPurpose,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the target matched when `resume_token` was issued.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(query: Query, target_id: TargetId, purpose: TargetPurpose) -> Self {
        Self {
            target_id,
            query,
            purpose,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
