use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::decode_bytes;
use crate::firestore::remote::structured_query::document_target_key;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// Read access to the state the aggregator reconciles watch changes against.
pub trait TargetMetadataProvider {
    /// Keys the local store last persisted as matching the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for targets the client is still listening to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Outcome of checking an existence filter's bloom filter against the cached membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplication {
    /// The filter explained the count mismatch; the excluded documents were removed.
    Success,
    /// Removing the excluded documents still left the counts apart.
    FalsePositive,
    /// No usable filter was sent.
    Skipped,
}

#[derive(Debug, Clone)]
struct TargetState {
    pending_responses: u32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    // Starts dirty so the first snapshot for a target is raised even if it is empty.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }
}

/// Buffers watch changes until the stream reaches a consistent snapshot, then hands them out as
/// one `RemoteEvent`.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentWatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata);
                }
                other => self.remove_document_from_target(
                    *target_id,
                    change.key.clone(),
                    other.clone(),
                    metadata,
                ),
            }
        }

        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                change.key.clone(),
                change.document.clone(),
                metadata,
            );
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A fresh add replaces whatever a previous incarnation had buffered.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(
        &self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect()
    }

    /// Reconciles a server-declared match count with the local membership of the target.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<BloomFilterApplication> {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let target_data = self.target_data_for_active_target(target_id, metadata)?;

        if let Some(key) = document_target_key(&target_data.query) {
            if expected_count == 0 {
                // The single document is gone; record the delete so other views stop showing it.
                let tombstone = Document::no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
            } else if expected_count != 1 {
                log::debug!(
                    "ignoring existence filter with count {expected_count} for document target {target_id}"
                );
            }
            return None;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == i64::from(expected_count) {
            return None;
        }

        let status = match self.parse_bloom_filter(change) {
            Some(bloom_filter) => {
                let removed = self.filter_removed_documents(&bloom_filter, target_id, metadata);
                if i64::from(expected_count) == current_count - removed as i64 {
                    BloomFilterApplication::Success
                } else {
                    BloomFilterApplication::FalsePositive
                }
            }
            None => BloomFilterApplication::Skipped,
        };

        log::debug!(
            "existence filter mismatch for target {target_id}: local {current_count}, server {expected_count}, bloom filter {status:?}"
        );

        if status != BloomFilterApplication::Success {
            self.reset_target(target_id, metadata);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
        Some(status)
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let payload = change.filter.unchanged_names.as_ref()?;
        let bitmap = match decode_bytes(&payload.bitmap) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::debug!("ignoring undecodable bloom filter, falling back to a full re-query: {err}");
                return None;
            }
        };
        match BloomFilter::new(bitmap, payload.padding, payload.hash_count) {
            Ok(filter) if filter.bit_count() > 0 => Some(filter),
            Ok(_) => None,
            Err(err) => {
                log::debug!("ignoring invalid bloom filter: {err}");
                None
            }
        }
    }

    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id) {
            let name = format!(
                "{}/documents/{}",
                self.database_id.canonical_name(),
                key.path().canonical_string()
            );
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Drains everything buffered so far into one event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);

            if current {
                if let Some(key) = document_target_key(&target_data.query) {
                    // A current document target that never saw its document proves the document
                    // does not exist.
                    if !self.pending_document_updates.contains_key(&key)
                        && !target_contains_document(metadata, target_id, &key)
                    {
                        let tombstone = Document::no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map(|target_data| target_data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents: {
                self.pending_document_target_mapping.clear();
                resolved_limbo_documents
            },
        }
    }

    /// Records that a watch or unwatch request was sent and its acknowledgement is outstanding.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Forgets all buffered state, as when the stream is torn down.
    pub fn clear(&mut self) {
        self.target_states.clear();
        self.pending_document_updates.clear();
        self.pending_document_target_mapping.clear();
        self.pending_target_resets.clear();
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: Document,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }

        let key = document.key().clone();
        let change_type = if target_contains_document(metadata, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<Document>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }

        let contained = target_contains_document(metadata, target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left the target between two snapshots.
            state.remove_document_change(&key);
        }

        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .remove(&target_id);

        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());

        // Watch re-adds whatever still matches before the next consistent snapshot.
        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        let active = self
            .target_data_for_active_target(target_id, metadata)
            .is_some();
        if !active {
            log::debug!("ignoring change for inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.target_data_for_target(target_id),
        }
    }
}

fn target_contains_document(
    metadata: &dyn TargetMetadataProvider,
    target_id: TargetId,
    key: &DocumentKey,
) -> bool {
    metadata.remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::{ResourcePath, Timestamp};
    use crate::firestore::remote::serializer::encode_bytes;
    use crate::firestore::remote::watch_change::{BloomFilterPayload, ExistenceFilter};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap();
            self.targets
                .insert(target_id, TargetData::new(query, target_id, TargetPurpose::Listen));
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            let query = Query::document(&key(path));
            self.targets.insert(
                target_id,
                TargetData::new(query, target_id, TargetPurpose::LimboResolution),
            );
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str) -> Document {
        Document::found(key(path), Timestamp::new(1, 0), MapValue::empty())
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::default("project"))
    }

    fn added(target_id: TargetId, document: Document) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        }
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<TargetId>) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids,
            resume_token: vec![9],
            read_time: Timestamp::min(),
            cause: None,
        }
    }

    fn filter(target_id: TargetId, count: i32, bloom: Option<BloomFilterPayload>) -> ExistenceFilterChange {
        ExistenceFilterChange {
            target_id,
            filter: ExistenceFilter {
                count,
                unchanged_names: bloom,
            },
        }
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(added(2, doc("rooms/a")), &metadata);
        aggregator.handle_document_change(added(2, doc("rooms/b")), &metadata);
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![2]), &metadata);

        let event = aggregator.create_remote_event(Timestamp::new(3, 0), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(change.modified_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event.resolved_limbo_documents.is_empty());

        let next = aggregator.create_remote_event(Timestamp::new(4, 0), &metadata);
        assert!(next.is_empty());
    }

    #[test]
    fn ignores_changes_for_targets_awaiting_acknowledgement() {
        let metadata = TestMetadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(added(2, doc("rooms/a")), &metadata);
        assert!(aggregator
            .create_remote_event(Timestamp::new(1, 0), &metadata)
            .document_updates
            .is_empty());

        aggregator.handle_target_change(&target_change(TargetChangeState::Add, vec![2]), &metadata);
        aggregator.handle_document_change(added(2, doc("rooms/a")), &metadata);
        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        assert!(event.document_updates.contains_key(&key("rooms/a")));
    }

    #[test]
    fn reset_removes_cached_documents() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&target_change(TargetChangeState::Reset, vec![2]), &metadata);
        aggregator.handle_document_change(added(2, doc("rooms/a")), &metadata);
        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents, [key("rooms/b")].into_iter().collect());
        assert!(change.modified_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn existence_filter_without_bloom_resets_target() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        let status = aggregator.handle_existence_filter(&filter(2, 1, None), &metadata);
        assert_eq!(status, Some(BloomFilterApplication::Skipped));

        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn matching_counts_need_no_repair() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        assert_eq!(aggregator.handle_existence_filter(&filter(2, 1, None), &metadata), None);
        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn undecodable_bloom_filter_falls_back_to_reset() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        let bloom = BloomFilterPayload {
            bitmap: "not base64!".to_string(),
            padding: 0,
            hash_count: 1,
        };
        let status = aggregator.handle_existence_filter(&filter(2, 1, Some(bloom)), &metadata);
        assert_eq!(status, Some(BloomFilterApplication::Skipped));
    }

    #[test]
    fn full_bloom_filter_is_a_false_positive() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        // Every bit set: the filter claims to contain everything.
        let bloom = BloomFilterPayload {
            bitmap: encode_bytes(&[0xff; 4]),
            padding: 0,
            hash_count: 3,
        };
        let status = aggregator.handle_existence_filter(&filter(2, 1, Some(bloom)), &metadata);
        assert_eq!(status, Some(BloomFilterApplication::FalsePositive));
        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn empty_bloom_filter_removes_every_document() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        // No bits set: none of the cached documents survive.
        let bloom = BloomFilterPayload {
            bitmap: encode_bytes(&[0; 4]),
            padding: 0,
            hash_count: 3,
        };
        let status = aggregator.handle_existence_filter(&filter(2, 0, Some(bloom)), &metadata);
        assert_eq!(status, Some(BloomFilterApplication::Success));
        let event = aggregator.create_remote_event(Timestamp::new(2, 0), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let metadata = TestMetadata::default().with_limbo_target(1, "rooms/a");
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![1]), &metadata);
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &metadata);
        let tombstone = &event.document_updates[&key("rooms/a")];
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), Timestamp::new(5, 0));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn document_target_with_zero_count_is_deleted() {
        let metadata = TestMetadata::default().with_limbo_target(1, "rooms/a");
        let mut aggregator = aggregator();
        assert_eq!(aggregator.handle_existence_filter(&filter(1, 0, None), &metadata), None);
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &metadata);
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
    }
}
