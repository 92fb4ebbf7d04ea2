use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Everything the watch stream delivered up to one consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose local membership can no longer be trusted and must be re-listened.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Limbo documents the backend has answered for, whether found or deleted.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// Event for a single-document target answered outside the watch stream, such as a limbo
    /// resolution the backend refused.
    pub fn synthesized_limbo_resolution(
        target_id: TargetId,
        document: Document,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        let key = document.key().clone();
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, TargetChange::empty(true));
        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: BTreeMap::new(),
            document_updates: [(key.clone(), document)].into_iter().collect(),
            resolved_limbo_documents: [key].into_iter().collect(),
        }
    }
}

/// Membership changes of one target inside a `RemoteEvent`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn empty(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }
}
