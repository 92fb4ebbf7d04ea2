use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::core::TargetIdGenerator;
use crate::firestore::error::{
    data_loss, internal_error, invalid_argument, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_serializer::{
    decode_stream_token, encode_stream_token, from_bytes, mutation_key, mutation_queue_key,
    mutations_prefix, remote_document_key, target_document_key, target_documents_prefix,
    target_key, to_bytes, DbMutationBatch, DbMutationGlobals, DbMutationQueue, DbTarget,
    DbTargetGlobal, LocalSerializer, MUTATIONS, MUTATION_GLOBALS, REMOTE_DOCUMENTS, TARGETS,
    TARGET_DOCUMENTS, TARGET_GLOBALS,
};
use crate::firestore::local::storage::{StorageBackend, StorageTransaction};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId, Timestamp, User,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::RemoteEvent;

/// Local views keyed by document. Absent documents are reported as a tombstone at the minimum
/// version.
pub type DocumentMap = BTreeMap<DocumentKey, Document>;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Durable cache of remote documents, the current user's mutation queue and listen targets.
///
/// All mutating operations stage their writes in a [`StorageTransaction`] and commit it once.
/// In-memory indexes are only updated after the commit succeeded. A failed commit leaves the
/// store unusable: every later call fails with the `DataLoss` error that poisoned it.
pub struct LocalStore {
    storage: Arc<dyn StorageBackend>,
    serializer: LocalSerializer,
    user: User,
    mutation_queue: Vec<MutationBatch>,
    queue_metadata: DbMutationQueue,
    mutation_globals: DbMutationGlobals,
    target_globals: DbTargetGlobal,
    targets: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: HashMap<String, TargetId>,
    target_remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    active_targets: BTreeSet<TargetId>,
    failure: Option<FirestoreError>,
}

impl Debug for LocalStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("user", &self.user)
            .field("pending_batches", &self.mutation_queue.len())
            .field("targets", &self.targets.len())
            .field("failure", &self.failure)
            .finish()
    }
}

impl LocalStore {
    /// Loads the persisted state of `storage` for `user`.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        serializer: JsonProtoSerializer,
        user: User,
    ) -> FirestoreResult<Self> {
        let serializer = LocalSerializer::new(serializer);
        let target_globals: DbTargetGlobal = match storage.get(TARGET_GLOBALS)? {
            Some(bytes) => from_bytes(&bytes)?,
            None => DbTargetGlobal::default(),
        };
        let mutation_globals: DbMutationGlobals = match storage.get(MUTATION_GLOBALS)? {
            Some(bytes) => from_bytes(&bytes)?,
            None => DbMutationGlobals::default(),
        };

        let mut targets = BTreeMap::new();
        let mut target_ids_by_canonical_id = HashMap::new();
        for (_, bytes) in storage.scan(TARGETS)? {
            let record: DbTarget = from_bytes(&bytes)?;
            let target = serializer.decode_target(record)?;
            target_ids_by_canonical_id.insert(target.query.canonical_id(), target.target_id);
            targets.insert(target.target_id, target);
        }

        let mut target_remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for (storage_key, _) in storage.scan(TARGET_DOCUMENTS)? {
            let (target_id, key) = parse_target_document_key(&storage_key)?;
            target_remote_keys.entry(target_id).or_default().insert(key);
        }

        let mut store = Self {
            storage,
            serializer,
            user: user.clone(),
            mutation_queue: Vec::new(),
            queue_metadata: DbMutationQueue::default(),
            mutation_globals,
            target_globals,
            targets,
            target_ids_by_canonical_id,
            target_remote_keys,
            active_targets: BTreeSet::new(),
            failure: None,
        };
        store.load_mutation_queue()?;
        log::debug!(
            "opened local store for {user}: {} pending batches, {} targets",
            store.mutation_queue.len(),
            store.targets.len()
        );
        Ok(store)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// The error that poisoned the store, if any.
    pub fn failure(&self) -> Option<&FirestoreError> {
        self.failure.as_ref()
    }

    fn ensure_usable(&self) -> FirestoreResult<()> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn commit(&mut self, txn: StorageTransaction<'_>) -> FirestoreResult<()> {
        txn.commit().map_err(|err| {
            let error = data_loss(format!("Failed to commit local changes: {}", err.message()));
            log::warn!("local store is unusable until persistence is cleared: {error}");
            self.failure = Some(error.clone());
            error
        })
    }

    fn load_mutation_queue(&mut self) -> FirestoreResult<()> {
        let queue_metadata = match self.storage.get(&mutation_queue_key(&self.user))? {
            Some(bytes) => from_bytes(&bytes)?,
            None => DbMutationQueue {
                user_id: self.user.storage_key(),
                ..DbMutationQueue::default()
            },
        };
        let mut queue = Vec::new();
        for (_, bytes) in self.storage.scan(&mutations_prefix(&self.user))? {
            let record: DbMutationBatch = from_bytes(&bytes)?;
            queue.push(self.serializer.decode_batch(record)?);
        }
        if let Some(last) = queue.last() {
            self.mutation_globals.highest_batch_id =
                self.mutation_globals.highest_batch_id.max(last.batch_id);
        }
        self.queue_metadata = queue_metadata;
        self.mutation_queue = queue;
        Ok(())
    }

    fn remote_document(
        &self,
        txn: &StorageTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Document>> {
        match txn.get(&remote_document_key(key))? {
            Some(bytes) => self.serializer.decode_remote_document(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn overlay(&self, key: &DocumentKey, base: Option<Document>) -> Option<Document> {
        self.mutation_queue
            .iter()
            .fold(base, |document, batch| batch.apply_to_local_view(key, document))
    }

    fn local_view(&self, txn: &StorageTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Document> {
        let base = self.remote_document(txn, key)?;
        Ok(self
            .overlay(key, base)
            .unwrap_or_else(|| Document::no_document(key.clone(), SnapshotVersion::min())))
    }

    fn local_views(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<DocumentMap> {
        let txn = StorageTransaction::new(self.storage.as_ref());
        keys.iter()
            .map(|key| Ok((key.clone(), self.local_view(&txn, key)?)))
            .collect()
    }

    fn pending_keys(&self) -> BTreeSet<DocumentKey> {
        self.mutation_queue.iter().flat_map(MutationBatch::keys).collect()
    }

    /// Persists one snapshot's worth of watch changes and returns the new local views of every
    /// document it changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        self.ensure_usable()?;
        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());

        let mut updated_targets = Vec::new();
        let mut membership = Vec::new();
        let touched: BTreeSet<TargetId> = event
            .target_changes
            .keys()
            .chain(event.target_mismatches.keys())
            .copied()
            .collect();
        for target_id in touched {
            // Limbo targets and released targets have nothing persisted.
            let Some(previous) = self
                .targets
                .get(&target_id)
                .filter(|_| self.active_targets.contains(&target_id))
            else {
                continue;
            };
            let mut target = previous.clone();
            let change = event.target_changes.get(&target_id);

            if let Some(change) = change {
                let added: BTreeSet<DocumentKey> = change
                    .added_documents
                    .iter()
                    .chain(&change.modified_documents)
                    .cloned()
                    .collect();
                for key in &change.removed_documents {
                    txn.delete(target_document_key(target_id, key));
                }
                for key in &added {
                    txn.put(target_document_key(target_id, key), Vec::new());
                }
                membership.push((target_id, added, change.removed_documents.clone()));
            }

            if event.target_mismatches.contains_key(&target_id) {
                target = target
                    .with_resume_token(Vec::new(), SnapshotVersion::min())
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
            } else if let Some(change) = change.filter(|change| change.current && !change.resume_token.is_empty()) {
                target = target.with_resume_token(change.resume_token.clone(), event.snapshot_version);
            }

            if target != *previous {
                txn.put(target_key(target_id), to_bytes(&self.serializer.encode_target(&target))?);
                updated_targets.push(target);
            }
        }

        let mut changed_keys = BTreeSet::new();
        for (key, document) in &event.document_updates {
            let existing = self.remote_document(&txn, key)?;
            if document.is_no_document() && document.version().is_min() {
                // Synthesized when access to the document was lost.
                txn.delete(remote_document_key(key));
                changed_keys.insert(key.clone());
            } else if should_apply(existing.as_ref(), document) {
                txn.put(
                    remote_document_key(key),
                    self.serializer.encode_remote_document(document)?,
                );
                changed_keys.insert(key.clone());
            } else {
                log::debug!(
                    "ignoring outdated watch update for {key}: cached {:?}, received {:?}",
                    existing.map(|doc| doc.version()),
                    document.version()
                );
            }
        }

        let mut target_globals = self.target_globals.clone();
        let last_remote_version: SnapshotVersion = target_globals.last_remote_snapshot_version.into();
        if event.snapshot_version > last_remote_version {
            target_globals.last_remote_snapshot_version = event.snapshot_version.into();
            txn.put(TARGET_GLOBALS, to_bytes(&target_globals)?);
        }

        self.commit(txn)?;

        self.target_globals = target_globals;
        for target in updated_targets {
            self.targets.insert(target.target_id, target);
        }
        for (target_id, added, removed) in membership {
            let keys = self.target_remote_keys.entry(target_id).or_default();
            for key in &removed {
                keys.remove(key);
            }
            keys.extend(added);
        }
        self.local_views(&changed_keys)
    }

    /// Queues `mutations` as a new batch of the current user and returns the affected local views.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        self.ensure_usable()?;
        if mutations.is_empty() {
            return Err(invalid_argument("A write batch needs at least one mutation"));
        }
        let batch_id = self.mutation_globals.highest_batch_id + 1;
        let batch = MutationBatch::new(batch_id, Timestamp::now(), mutations);
        let globals = DbMutationGlobals {
            highest_batch_id: batch_id,
        };

        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());
        txn.put(
            mutation_key(&self.user, batch_id),
            to_bytes(&self.serializer.encode_batch(&self.user, &batch))?,
        );
        txn.put(mutation_queue_key(&self.user), to_bytes(&self.queue_metadata)?);
        txn.put(MUTATION_GLOBALS, to_bytes(&globals)?);
        self.commit(txn)?;

        self.mutation_globals = globals;
        let keys = batch.keys();
        self.mutation_queue.push(batch);
        Ok(LocalWriteResult {
            batch_id,
            changes: self.local_views(&keys)?,
        })
    }

    /// Removes an acknowledged batch and folds its committed result into the remote documents.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.ensure_usable()?;
        let batch_id = result.batch.batch_id;
        let position = self.batch_position(batch_id)?;
        let batch = self.mutation_queue[position].clone();

        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());
        let keys = batch.keys();
        for key in &keys {
            let ack_version = batch
                .mutations
                .iter()
                .zip(&result.mutation_results)
                .filter(|(mutation, _)| mutation.key() == key)
                .map(|(_, mutation_result)| mutation_result.version)
                .max()
                .unwrap_or(result.commit_version);
            let existing = self.remote_document(&txn, key)?;
            if existing.as_ref().is_some_and(|doc| doc.version() >= ack_version) {
                continue;
            }
            if let Some(document) = batch.apply_to_remote_document(key, existing, &result.mutation_results) {
                txn.put(
                    remote_document_key(key),
                    self.serializer.encode_remote_document(&document)?,
                );
            }
        }

        let queue_metadata = DbMutationQueue {
            user_id: self.user.storage_key(),
            last_acknowledged_batch_id: batch_id,
            last_stream_token: encode_stream_token(&result.stream_token),
        };
        txn.delete(mutation_key(&self.user, batch_id));
        txn.put(mutation_queue_key(&self.user), to_bytes(&queue_metadata)?);
        self.commit(txn)?;

        self.queue_metadata = queue_metadata;
        self.mutation_queue.remove(position);
        self.local_views(&keys)
    }

    /// Drops a batch the backend refused and returns the restored local views.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.ensure_usable()?;
        let position = self.batch_position(batch_id)?;
        let keys = self.mutation_queue[position].keys();

        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());
        txn.delete(mutation_key(&self.user, batch_id));
        self.commit(txn)?;

        self.mutation_queue.remove(position);
        self.local_views(&keys)
    }

    fn batch_position(&self, batch_id: BatchId) -> FirestoreResult<usize> {
        self.mutation_queue
            .iter()
            .position(|batch| batch.batch_id == batch_id)
            .ok_or_else(|| internal_error(format!("Batch {batch_id} is not in the mutation queue")))
    }

    /// Switches to `user`'s mutation queue. The previous user's batches stay persisted untouched.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<DocumentMap> {
        self.ensure_usable()?;
        let mut affected = self.pending_keys();
        self.user = user;
        self.load_mutation_queue()?;
        affected.extend(self.pending_keys());
        self.local_views(&affected)
    }

    /// Returns the persisted target for an equivalent query, or creates one with a new even id.
    pub fn allocate_target(&mut self, query: Query) -> FirestoreResult<TargetData> {
        self.ensure_usable()?;
        let canonical_id = query.canonical_id();
        if let Some(target) = self
            .target_ids_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| self.targets.get(target_id))
        {
            let target = target.clone();
            self.active_targets.insert(target.target_id);
            return Ok(target);
        }

        let target_id = TargetIdGenerator::for_target_cache(self.target_globals.highest_target_id).next_id();
        let target = TargetData::new(query, target_id, TargetPurpose::Listen);
        let mut target_globals = self.target_globals.clone();
        target_globals.highest_target_id = target_id;

        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());
        txn.put(target_key(target_id), to_bytes(&self.serializer.encode_target(&target))?);
        txn.put(TARGET_GLOBALS, to_bytes(&target_globals)?);
        self.commit(txn)?;

        self.target_globals = target_globals;
        self.target_ids_by_canonical_id.insert(canonical_id, target_id);
        self.targets.insert(target_id, target.clone());
        self.active_targets.insert(target_id);
        Ok(target)
    }

    /// Marks the target inactive. Its metadata stays until the next garbage collection.
    pub fn release_target(&mut self, target_id: TargetId) {
        self.active_targets.remove(&target_id);
    }

    pub fn target_data(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }

    pub fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.target_remote_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Cached documents matching `query`, with the pending writes of the current user applied.
    pub fn execute_query(&self, query: &Query) -> FirestoreResult<DocumentMap> {
        self.ensure_usable()?;
        let txn = StorageTransaction::new(self.storage.as_ref());
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.local_view(&txn, &key)?;
            return Ok(if query.matches(&document) {
                [(key, document)].into_iter().collect()
            } else {
                DocumentMap::new()
            });
        }

        let prefix = format!("{REMOTE_DOCUMENTS}{}/", query.path().canonical_string());
        let mut documents = DocumentMap::new();
        for (_, bytes) in txn.scan(&prefix)? {
            let document = self.serializer.decode_remote_document(&bytes)?;
            if query.path().is_immediate_parent_of(document.key().path()) {
                documents.insert(document.key().clone(), document);
            }
        }
        let overlaid: BTreeSet<DocumentKey> = self
            .pending_keys()
            .into_iter()
            .filter(|key| query.path().is_immediate_parent_of(key.path()))
            .collect();
        for key in overlaid {
            let base = documents.remove(&key);
            if let Some(document) = self.overlay(&key, base) {
                documents.insert(key, document);
            }
        }
        documents.retain(|_, document| query.matches(document));
        Ok(documents)
    }

    /// Local view of a single document, if anything is known about it.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        self.ensure_usable()?;
        let txn = StorageTransaction::new(self.storage.as_ref());
        let base = self.remote_document(&txn, key)?;
        Ok(self.overlay(key, base))
    }

    /// First pending batch of the current user with an id greater than `after`.
    pub fn next_mutation_batch(&self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.ensure_usable()?;
        Ok(self
            .mutation_queue
            .iter()
            .find(|batch| after.map_or(true, |after| batch.batch_id > after))
            .cloned())
    }

    pub fn pending_batch_count(&self) -> usize {
        self.mutation_queue.len()
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        decode_stream_token(&self.queue_metadata.last_stream_token)
    }

    pub fn set_last_stream_token(&mut self, token: &[u8]) -> FirestoreResult<()> {
        self.ensure_usable()?;
        let mut queue_metadata = self.queue_metadata.clone();
        queue_metadata.last_stream_token = encode_stream_token(token);
        if queue_metadata == self.queue_metadata {
            return Ok(());
        }
        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());
        txn.put(mutation_queue_key(&self.user), to_bytes(&queue_metadata)?);
        self.commit(txn)?;
        self.queue_metadata = queue_metadata;
        Ok(())
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_globals.last_remote_snapshot_version.into()
    }

    /// Drops released targets and evicts every cached document that no active target, pending
    /// batch (of any user) or `pinned` key still references. Returns the number of evictions.
    pub fn collect_garbage(&mut self, pinned: &BTreeSet<DocumentKey>) -> FirestoreResult<usize> {
        self.ensure_usable()?;
        let storage = Arc::clone(&self.storage);
        let mut txn = StorageTransaction::new(storage.as_ref());

        let released: Vec<TargetId> = self
            .targets
            .keys()
            .filter(|target_id| !self.active_targets.contains(target_id))
            .copied()
            .collect();
        for target_id in &released {
            txn.delete(target_key(*target_id));
            for (storage_key, _) in storage.scan(&target_documents_prefix(*target_id))? {
                txn.delete(storage_key);
            }
        }

        let mut referenced = pinned.clone();
        for target_id in &self.active_targets {
            if let Some(keys) = self.target_remote_keys.get(target_id) {
                referenced.extend(keys.iter().cloned());
            }
        }
        for (_, bytes) in storage.scan(MUTATIONS)? {
            let record: DbMutationBatch = from_bytes(&bytes)?;
            referenced.extend(self.serializer.decode_batch(record)?.keys());
        }

        let mut evicted = 0;
        for (storage_key, _) in storage.scan(REMOTE_DOCUMENTS)? {
            let key = DocumentKey::from_string(&storage_key[REMOTE_DOCUMENTS.len()..])
                .map_err(|err| data_loss(format!("Corrupt document key: {}", err.message())))?;
            if !referenced.contains(&key) {
                txn.delete(storage_key);
                evicted += 1;
            }
        }
        self.commit(txn)?;

        for target_id in released {
            if let Some(target) = self.targets.remove(&target_id) {
                self.target_ids_by_canonical_id.remove(&target.query.canonical_id());
            }
            self.target_remote_keys.remove(&target_id);
        }
        if evicted > 0 {
            log::debug!("garbage collection evicted {evicted} documents");
        }
        Ok(evicted)
    }
}

fn should_apply(existing: Option<&Document>, incoming: &Document) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            incoming.version() > existing.version()
                || (incoming.version() == existing.version() && existing.has_committed_mutations())
        }
    }
}

fn parse_target_document_key(storage_key: &str) -> FirestoreResult<(TargetId, DocumentKey)> {
    let corrupt = || data_loss(format!("Corrupt target document entry '{storage_key}'"));
    let (target_id, path) = storage_key
        .strip_prefix(TARGET_DOCUMENTS)
        .and_then(|rest| rest.split_once('/'))
        .ok_or_else(corrupt)?;
    let target_id = target_id.parse().map_err(|_| corrupt())?;
    let key = DocumentKey::from_string(path).map_err(|_| corrupt())?;
    Ok((target_id, key))
}
