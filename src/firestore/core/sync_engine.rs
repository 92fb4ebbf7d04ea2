use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_channel::Sender;
use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::view::{LimboDocumentChange, View, ViewSnapshot};
use crate::firestore::core::TargetIdGenerator;
use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};
use crate::firestore::local::{DocumentMap, LocalStore, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId, User,
};
use crate::firestore::remote::{
    OnlineState, RemoteEvent, RemoteStore, RemoteStoreEvent, RemoteSyncer, StreamEvent,
    TargetChange,
};

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Identifies one listener across every query the engine serves. Assigned by the caller.
pub type ListenerId = u64;

/// Where a listener's snapshots go. An `Err` is terminal and is followed by the channel closing.
pub type SnapshotSender = Sender<FirestoreResult<ViewSnapshot>>;

/// Resolved once the backend accepted or refused a batch.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncEngineSettings {
    pub max_concurrent_limbo_resolutions: usize,
    pub eager_garbage_collection: bool,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            eager_garbage_collection: false,
        }
    }
}

struct QueryView {
    target_id: TargetId,
    view: View,
    listeners: BTreeMap<ListenerId, SnapshotSender>,
}

impl QueryView {
    fn deliver(&self, snapshot: &ViewSnapshot) {
        for listener in self.listeners.values() {
            // A closed receiver means the subscription is being dropped; its unlisten follows.
            let _ = listener.try_send(Ok(snapshot.clone()));
        }
    }

    fn fail(&self, error: &FirestoreError) {
        for listener in self.listeners.values() {
            let _ = listener.try_send(Err(error.clone()));
            listener.close();
        }
    }
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target has reported the document as existing since it was opened.
    received_document: bool,
}

#[derive(Default)]
struct LimboTracker {
    /// Query targets whose views hold the key in limbo.
    document_refs: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    enqueued: VecDeque<DocumentKey>,
    targets_by_key: BTreeMap<DocumentKey, TargetId>,
    resolutions: BTreeMap<TargetId, LimboResolution>,
}

impl LimboTracker {
    fn pinned_keys(&self) -> BTreeSet<DocumentKey> {
        self.document_refs
            .keys()
            .chain(self.targets_by_key.keys())
            .cloned()
            .collect()
    }
}

/// Everything the remote store reads back through [`RemoteSyncer`]. Kept apart from the remote
/// store itself so both can be borrowed at once.
struct EngineState {
    local: LocalStore,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, String>,
    limbo: LimboTracker,
}

impl RemoteSyncer for EngineState {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.limbo.resolutions.get(&target_id) {
            return if resolution.received_document {
                [resolution.key.clone()].into_iter().collect()
            } else {
                BTreeSet::new()
            };
        }
        match self
            .queries_by_target
            .get(&target_id)
            .and_then(|canonical_id| self.query_views.get(canonical_id))
        {
            Some(query_view) => query_view.view.synced_documents().clone(),
            None => self.local.remote_keys_for_target(target_id),
        }
    }

    fn next_mutation_batch(&self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local.next_mutation_batch(after)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local.last_remote_snapshot_version()
    }
}

/// Ties the local store, the remote store and the per-query views together.
///
/// Owned by a single worker: every method runs to completion, and whatever the remote store
/// reports back while handling a call is processed before the call returns. An `Err` from any
/// method means persistence failed; the caller is expected to [`fail`](Self::fail) the engine.
pub struct SyncEngine {
    remote: RemoteStore,
    state: EngineState,
    limbo_target_ids: TargetIdGenerator,
    settings: SyncEngineSettings,
    write_callbacks: BTreeMap<(User, BatchId), WriteCallback>,
    online_state: OnlineState,
}

impl SyncEngine {
    pub fn new(local: LocalStore, remote: RemoteStore, settings: SyncEngineSettings) -> Self {
        Self {
            remote,
            state: EngineState {
                local,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                limbo: LimboTracker::default(),
            },
            limbo_target_ids: TargetIdGenerator::for_sync_engine(),
            settings,
            write_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
        }
    }

    /// Starts sending batches persisted by an earlier session.
    pub fn start(&mut self) -> FirestoreResult<()> {
        self.remote.fill_write_pipeline(&self.state)
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.state.local
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Keys currently being resolved through a dedicated limbo target.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state.limbo.targets_by_key.clone()
    }

    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.state.limbo.enqueued.iter().cloned().collect()
    }

    /// Target backing `query`, if anyone listens to it.
    pub fn target_for_query(&self, query: &Query) -> Option<TargetId> {
        self.state
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    /// Registers a listener for `query`. The first listener of a query allocates its target and
    /// starts watching it; later ones join the existing view and get its current state.
    pub fn listen(
        &mut self,
        listener_id: ListenerId,
        query: Query,
        listener: SnapshotSender,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();

        if let Some(query_view) = self.state.query_views.get_mut(&canonical_id) {
            if let Some(snapshot) = query_view.view.current_snapshot() {
                let _ = listener.try_send(Ok(snapshot));
            }
            query_view.listeners.insert(listener_id, listener);
            return Ok(());
        }

        let target = self.state.local.allocate_target(query.clone())?;
        let target_id = target.target_id;
        log::debug!("listening to {canonical_id} as target {target_id}");

        let documents = self.state.local.execute_query(&query)?;
        let mut view = View::new(query, self.state.local.remote_keys_for_target(target_id));
        let doc_changes = view.compute_doc_changes(&documents, None);
        let change = view.apply_changes(doc_changes, Some(&TargetChange::empty(false)), false);

        let query_view = QueryView {
            target_id,
            view,
            listeners: [(listener_id, listener)].into_iter().collect(),
        };
        if let Some(snapshot) = &change.snapshot {
            query_view.deliver(snapshot);
        }
        self.state.queries_by_target.insert(target_id, canonical_id.clone());
        self.state.query_views.insert(canonical_id, query_view);

        let events = self.update_tracked_limbos(target_id, change.limbo_changes);
        self.remote.listen(target, &self.state);
        self.process(events)
    }

    /// Detaches a listener; the last listener of a query releases its target.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> FirestoreResult<()> {
        let Some(canonical_id) = self
            .state
            .query_views
            .iter()
            .find(|(_, query_view)| query_view.listeners.contains_key(&listener_id))
            .map(|(canonical_id, _)| canonical_id.clone())
        else {
            return Ok(());
        };
        let Some(query_view) = self.state.query_views.get_mut(&canonical_id) else {
            return Ok(());
        };
        query_view.listeners.remove(&listener_id);
        if !query_view.listeners.is_empty() {
            return Ok(());
        }

        let target_id = query_view.target_id;
        log::debug!("releasing target {target_id} for {canonical_id}");
        let mut events = self.remove_and_cleanup_query(target_id);
        events.extend(self.remote.unlisten(target_id));
        self.process(events)?;
        self.collect_garbage()
    }

    /// Queues `mutations` locally and hands the batch to the write pipeline.
    ///
    /// `callback` always resolves: with the backend's verdict, or right away when the batch could
    /// not be queued. Only persistence failures are returned as `Err`.
    pub fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.state.local.write_locally(mutations) {
            Ok(result) => result,
            Err(error) => {
                let _ = callback.send(Err(error.clone()));
                return if error.is_fatal() { Err(error) } else { Ok(()) };
            }
        };
        let user = self.state.local.user().clone();
        self.write_callbacks.insert((user, result.batch_id), callback);

        let events = self.emit_new_snapshots(&result.changes, None)?;
        self.process(events)?;
        self.remote.fill_write_pipeline(&self.state)
    }

    pub fn enable_network(&mut self) -> FirestoreResult<()> {
        let events = self.remote.enable_network(&self.state)?;
        self.process(events)
    }

    pub fn disable_network(&mut self) -> FirestoreResult<()> {
        let events = self.remote.disable_network();
        self.process(events)
    }

    pub fn notify_network_available(&mut self) -> FirestoreResult<()> {
        let events = self.remote.notify_network_available(&self.state)?;
        self.process(events)
    }

    /// Feeds a stream task's report into the remote store.
    pub fn handle_stream_event(&mut self, event: StreamEvent) -> FirestoreResult<()> {
        let events = self.remote.handle_stream_event(event, &self.state)?;
        self.process(events)
    }

    /// Restarts the streams under new credentials, first switching the active mutation queue
    /// when `user` differs from the current one.
    pub fn change_user(&mut self, user: User) -> FirestoreResult<()> {
        if *self.state.local.user() != user {
            log::debug!("user changed from {} to {user}", self.state.local.user());
            let changes = self.state.local.handle_user_change(user)?;
            let events = self.emit_new_snapshots(&changes, None)?;
            self.process(events)?;
        }
        let events = self.remote.handle_credential_change(&self.state)?;
        self.process(events)
    }

    pub fn pending_write_count(&self) -> usize {
        self.state.local.pending_batch_count()
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        self.state.local.read_document(key)
    }

    /// Stops both streams and ends every subscription and pending write with `Cancelled`.
    pub fn shutdown(&mut self) {
        self.remote.shutdown();
        self.fail_outstanding(&cancelled("The client has been terminated"));
    }

    /// Takes the engine out of service after an unrecoverable error, reporting it to every
    /// listener and pending write.
    pub fn fail(&mut self, error: &FirestoreError) {
        log::warn!("sync engine failed: {error}");
        self.remote.shutdown();
        self.fail_outstanding(error);
    }

    fn fail_outstanding(&mut self, error: &FirestoreError) {
        for query_view in self.state.query_views.values() {
            query_view.fail(error);
        }
        self.state.query_views.clear();
        self.state.queries_by_target.clear();
        self.state.limbo = LimboTracker::default();
        for (_, callback) in std::mem::take(&mut self.write_callbacks) {
            let _ = callback.send(Err(error.clone()));
        }
    }

    /// Drains the remote store's outcomes, including the ones produced while handling them.
    fn process(&mut self, events: Vec<RemoteStoreEvent>) -> FirestoreResult<()> {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            let follow_up = match event {
                RemoteStoreEvent::RemoteEvent(event) => self.apply_remote_event(event)?,
                RemoteStoreEvent::TargetRejected { target_id, error } => {
                    self.reject_listen(target_id, error)?
                }
                RemoteStoreEvent::WriteAcknowledged(result) => self.apply_successful_write(result)?,
                RemoteStoreEvent::WriteRejected { batch_id, error } => {
                    self.reject_failed_write(batch_id, error)?
                }
                RemoteStoreEvent::StreamTokenChanged(token) => {
                    self.state.local.set_last_stream_token(&token)?;
                    Vec::new()
                }
                RemoteStoreEvent::OnlineStateChanged(online_state) => {
                    self.apply_online_state_change(online_state)
                }
            };
            queue.extend(follow_up);
        }
        Ok(())
    }

    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.state.limbo.resolutions.get_mut(target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                log::warn!("limbo target {target_id} reported {touched} documents");
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.state.local.apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        if let Some(resolution) = self.state.limbo.resolutions.remove(&target_id) {
            log::debug!(
                "limbo resolution for {} rejected ({error}); treating it as deleted",
                resolution.key
            );
            self.state.limbo.targets_by_key.remove(&resolution.key);
            self.pump_enqueued_limbo_resolutions();
            let event = RemoteEvent::synthesized_limbo_resolution(
                target_id,
                Document::no_document(resolution.key, SnapshotVersion::min()),
                SnapshotVersion::min(),
            );
            return self.apply_remote_event(event);
        }

        let Some(canonical_id) = self.state.queries_by_target.get(&target_id).cloned() else {
            return Ok(Vec::new());
        };
        if let Some(query_view) = self.state.query_views.get(&canonical_id) {
            log::debug!("listen for {canonical_id} failed: {error}");
            query_view.fail(&error);
        }
        let events = self.remove_and_cleanup_query(target_id);
        self.collect_garbage()?;
        Ok(events)
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let changes = self.state.local.acknowledge_batch(&result)?;
        self.resolve_write_callback(result.batch.batch_id, Ok(()));
        let events = self.emit_new_snapshots(&changes, None)?;
        self.remote.fill_write_pipeline(&self.state)?;
        Ok(events)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        log::debug!("batch {batch_id} rejected: {error}");
        self.resolve_write_callback(batch_id, Err(error));
        let changes = self.state.local.reject_batch(batch_id)?;
        let events = self.emit_new_snapshots(&changes, None)?;
        self.remote.fill_write_pipeline(&self.state)?;
        Ok(events)
    }

    fn resolve_write_callback(&mut self, batch_id: BatchId, outcome: FirestoreResult<()>) {
        let user = self.state.local.user().clone();
        if let Some(callback) = self.write_callbacks.remove(&(user, batch_id)) {
            let _ = callback.send(outcome);
        }
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> Vec<RemoteStoreEvent> {
        self.online_state = online_state;
        let mut limbo_updates = Vec::new();
        for query_view in self.state.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state);
            if let Some(snapshot) = &change.snapshot {
                query_view.deliver(snapshot);
            }
            limbo_updates.push((query_view.target_id, change.limbo_changes));
        }
        limbo_updates
            .into_iter()
            .flat_map(|(target_id, changes)| self.update_tracked_limbos(target_id, changes))
            .collect()
    }

    /// Runs `changes` through every view and hands the resulting snapshots to the listeners.
    fn emit_new_snapshots(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let mut limbo_updates = Vec::new();
        for query_view in self.state.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let refreshed = self.state.local.execute_query(query_view.view.query())?;
                doc_changes = query_view.view.compute_doc_changes(&refreshed, Some(doc_changes));
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let change = query_view.view.apply_changes(doc_changes, target_change, pending_reset);
            if let Some(snapshot) = &change.snapshot {
                query_view.deliver(snapshot);
            }
            limbo_updates.push((target_id, change.limbo_changes));
        }

        let mut events = Vec::new();
        for (target_id, changes) in limbo_updates {
            events.extend(self.update_tracked_limbos(target_id, changes));
        }
        Ok(events)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
    ) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.state
                        .limbo
                        .document_refs
                        .entry(key.clone())
                        .or_default()
                        .insert(target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    events.extend(self.release_limbo_reference(target_id, &key));
                }
            }
        }
        events
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        let limbo = &mut self.state.limbo;
        if limbo.targets_by_key.contains_key(&key) || limbo.enqueued.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        limbo.enqueued.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Opens limbo targets for queued keys while fewer than the configured maximum are active.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.state.limbo.targets_by_key.len() < self.settings.max_concurrent_limbo_resolutions {
            let Some(key) = self.state.limbo.enqueued.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_ids.next_id();
            self.state.limbo.resolutions.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.state.limbo.targets_by_key.insert(key.clone(), target_id);
            let target = TargetData::new(Query::document(&key), target_id, TargetPurpose::LimboResolution);
            self.remote.listen(target, &self.state);
        }
    }

    fn release_limbo_reference(&mut self, target_id: TargetId, key: &DocumentKey) -> Vec<RemoteStoreEvent> {
        let limbo = &mut self.state.limbo;
        if let Some(refs) = limbo.document_refs.get_mut(key) {
            refs.remove(&target_id);
            if !refs.is_empty() {
                return Vec::new();
            }
            limbo.document_refs.remove(key);
        }
        self.remove_limbo_target(key)
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) -> Vec<RemoteStoreEvent> {
        self.state.limbo.enqueued.retain(|queued| queued != key);
        let Some(limbo_target_id) = self.state.limbo.targets_by_key.remove(key) else {
            return Vec::new();
        };
        self.state.limbo.resolutions.remove(&limbo_target_id);
        let events = self.remote.unlisten(limbo_target_id);
        self.pump_enqueued_limbo_resolutions();
        events
    }

    /// Forgets the view of `target_id` and every limbo reference it held.
    fn remove_and_cleanup_query(&mut self, target_id: TargetId) -> Vec<RemoteStoreEvent> {
        if let Some(canonical_id) = self.state.queries_by_target.remove(&target_id) {
            self.state.query_views.remove(&canonical_id);
        }
        self.state.local.release_target(target_id);

        let referenced: Vec<DocumentKey> = self
            .state
            .limbo
            .document_refs
            .iter()
            .filter(|(_, refs)| refs.contains(&target_id))
            .map(|(key, _)| key.clone())
            .collect();
        referenced
            .iter()
            .flat_map(|key| self.release_limbo_reference(target_id, key))
            .collect()
    }

    fn collect_garbage(&mut self) -> FirestoreResult<()> {
        if !self.settings.eager_garbage_collection {
            return Ok(());
        }
        let pinned = self.state.limbo.pinned_keys();
        let evicted = self.state.local.collect_garbage(&pinned)?;
        if evicted > 0 {
            log::debug!("garbage collection evicted {evicted} documents");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{invalid_argument, FirestoreErrorCode};
    use crate::firestore::local::MemoryStorage;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::datastore::{loopback, LoopbackServer, ServerStream, StaticCredentials};
    use crate::firestore::remote::remote_store::DEFAULT_MAX_PENDING_WRITES;
    use crate::firestore::remote::streams::StreamEventSink;
    use crate::firestore::remote::{JsonProtoSerializer, StreamState};
    use crate::firestore::value::MapValue;
    use crate::util::BackoffConfig;
    use async_channel::Receiver;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Arc;

    type Snapshots = Receiver<FirestoreResult<ViewSnapshot>>;

    struct Harness {
        engine: SyncEngine,
        events: Receiver<StreamEvent>,
        server: LoopbackServer,
        next_listener_id: ListenerId,
    }

    impl Harness {
        fn new(settings: SyncEngineSettings) -> Self {
            let (datastore, server) = loopback();
            let (sender, events) = async_channel::unbounded();
            let sink: StreamEventSink = Arc::new(move |event| {
                let _ = sender.try_send(event);
            });
            let serializer = JsonProtoSerializer::new(DatabaseId::default("project"));
            let local = LocalStore::open(
                Arc::new(MemoryStorage::new()),
                serializer.clone(),
                User::unauthenticated(),
            )
            .unwrap();
            let remote = RemoteStore::new(
                serializer,
                Arc::new(datastore),
                Arc::new(StaticCredentials::unauthenticated()),
                sink,
                BackoffConfig {
                    interval_millis: 1,
                    backoff_factor: 1.5,
                    max_backoff_millis: 5,
                },
                DEFAULT_MAX_PENDING_WRITES,
            );
            Self {
                engine: SyncEngine::new(local, remote, settings),
                events,
                server,
                next_listener_id: 0,
            }
        }

        async fn pump(&mut self) {
            let event = self.events.recv().await.unwrap();
            self.engine.handle_stream_event(event).unwrap();
        }

        async fn pump_until_snapshot(
            &mut self,
            snapshots: &Snapshots,
            done: impl Fn(&ViewSnapshot) -> bool,
        ) -> ViewSnapshot {
            loop {
                while let Ok(next) = snapshots.try_recv() {
                    let snapshot = next.unwrap();
                    if done(&snapshot) {
                        return snapshot;
                    }
                }
                self.pump().await;
            }
        }

        async fn open_watch(&mut self) -> ServerStream {
            let stream = self.server.next_listen_stream().await.unwrap();
            while self.engine.remote_store().watch_state() != StreamState::Open {
                self.pump().await;
            }
            stream
        }

        fn listen(&mut self, query: Query) -> (ListenerId, Snapshots) {
            let (sender, receiver) = async_channel::unbounded();
            let listener_id = self.next_listener_id;
            self.next_listener_id += 1;
            self.engine.listen(listener_id, query, sender).unwrap();
            (listener_id, receiver)
        }
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_name(path: &str) -> String {
        format!("projects/project/databases/(default)/documents/{path}")
    }

    fn doc_change(path: &str, second: u32, target_id: TargetId) -> JsonValue {
        json!({
            "documentChange": {
                "document": {
                    "name": doc_name(path),
                    "fields": {},
                    "updateTime": format!("1970-01-01T00:00:{second:02}Z")
                },
                "targetIds": [target_id]
            }
        })
    }

    fn read_time(second: u32) -> JsonValue {
        json!({ "targetChange": { "readTime": format!("1970-01-01T00:00:{second:02}Z") } })
    }

    async fn send_all(stream: &ServerStream, messages: &[JsonValue]) {
        for message in messages {
            stream.send_json(message).await.unwrap();
        }
    }

    fn keys_of(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
        snapshot.docs.iter().map(|doc| doc.key().clone()).collect()
    }

    /// Listens to `rooms`, lets the server deliver `paths` as a current snapshot at second 2 and
    /// returns the watch stream.
    async fn synced_rooms(harness: &mut Harness, paths: &[&str]) -> (Snapshots, ServerStream) {
        let (_, snapshots) = harness.listen(rooms());
        let stream = harness.open_watch().await;
        assert_eq!(stream.recv_json().await.unwrap()["addTarget"]["targetId"], json!(2));

        let mut messages = vec![json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } })];
        messages.extend(paths.iter().map(|path| doc_change(path, 2, 2)));
        messages.push(json!({
            "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ==" }
        }));
        messages.push(read_time(2));
        send_all(&stream, &messages).await;

        harness
            .pump_until_snapshot(&snapshots, |snapshot| !snapshot.from_cache)
            .await;
        (snapshots, stream)
    }

    async fn remove_from_target(harness: &mut Harness, stream: &ServerStream, paths: &[&str], second: u32) {
        let mut messages: Vec<JsonValue> = paths
            .iter()
            .map(|path| json!({ "documentRemove": { "document": doc_name(path), "removedTargetIds": [2] } }))
            .collect();
        messages.push(read_time(second));
        send_all(stream, &messages).await;
        let expected = paths.len().min(harness.engine.settings.max_concurrent_limbo_resolutions);
        while harness.engine.active_limbo_resolutions().len() < expected {
            harness.pump().await;
        }
    }

    #[tokio::test]
    async fn first_snapshot_comes_from_the_cache() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (_, snapshots) = harness.listen(rooms());

        let initial = snapshots.try_recv().unwrap().unwrap();
        assert!(initial.docs.is_empty());
        assert!(initial.from_cache);
        assert!(initial.sync_state_changed);
        assert_eq!(harness.engine.target_for_query(&rooms()), Some(2));

        let (callback, _pending) = oneshot::channel();
        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .unwrap();
        let local = snapshots.try_recv().unwrap().unwrap();
        assert_eq!(keys_of(&local), vec![key("rooms/a")]);
        assert!(local.has_pending_writes);
        assert_eq!(harness.engine.pending_write_count(), 1);
    }

    #[tokio::test]
    async fn second_listener_joins_the_existing_view() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (first, _) = harness.listen(rooms());
        let (second, snapshots) = harness.listen(rooms());
        assert_ne!(first, second);
        assert_eq!(snapshots.try_recv().unwrap().unwrap().docs.len(), 0);

        harness.engine.unlisten(first).unwrap();
        assert_eq!(harness.engine.target_for_query(&rooms()), Some(2));
        harness.engine.unlisten(second).unwrap();
        assert_eq!(harness.engine.target_for_query(&rooms()), None);
    }

    #[tokio::test]
    async fn server_snapshot_marks_the_view_synced() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (snapshots, _stream) = synced_rooms(&mut harness, &["rooms/a", "rooms/b"]).await;
        assert!(snapshots.try_recv().is_err());
        assert_eq!(harness.engine.online_state(), OnlineState::Online);

        let cached = harness.engine.read_document(&key("rooms/a")).unwrap().unwrap();
        assert!(cached.is_found());
        assert_eq!(harness.engine.local_store().remote_keys_for_target(2).len(), 2);
    }

    #[tokio::test]
    async fn limbo_document_deleted_on_the_server_is_removed() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (snapshots, stream) = synced_rooms(&mut harness, &["rooms/a", "rooms/b"]).await;

        remove_from_target(&mut harness, &stream, &["rooms/b"], 3).await;
        assert_eq!(
            harness.engine.active_limbo_resolutions(),
            [(key("rooms/b"), 1)].into_iter().collect()
        );
        let limbo_listen = stream.recv_json().await.unwrap();
        assert_eq!(limbo_listen["addTarget"]["targetId"], json!(1));
        assert_eq!(limbo_listen["labels"]["goog-listen-tags"], json!("limbo-document"));

        send_all(
            &stream,
            &[
                json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [1] } }),
                json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [1] } }),
                read_time(4),
            ],
        )
        .await;
        let resolved = harness
            .pump_until_snapshot(&snapshots, |snapshot| !snapshot.changes.is_empty())
            .await;
        assert_eq!(keys_of(&resolved), vec![key("rooms/a")]);
        assert_eq!(resolved.changes.len(), 1);
        assert_eq!(resolved.changes[0].change_type, crate::firestore::core::ChangeType::Removed);
        assert!(!resolved.from_cache);
        assert!(harness.engine.active_limbo_resolutions().is_empty());
        assert_eq!(stream.recv_json().await.unwrap()["removeTarget"], json!(1));
    }

    #[tokio::test]
    async fn rejected_limbo_resolution_counts_as_deleted() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (snapshots, stream) = synced_rooms(&mut harness, &["rooms/a", "rooms/b"]).await;
        remove_from_target(&mut harness, &stream, &["rooms/b"], 3).await;

        stream
            .send_json(&json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [1],
                    "cause": { "code": 7, "message": "denied" }
                }
            }))
            .await
            .unwrap();
        let resolved = harness
            .pump_until_snapshot(&snapshots, |snapshot| !snapshot.changes.is_empty())
            .await;
        assert_eq!(keys_of(&resolved), vec![key("rooms/a")]);
        assert!(harness.engine.active_limbo_resolutions().is_empty());
        assert_eq!(harness.engine.read_document(&key("rooms/b")).unwrap(), None);
    }

    #[tokio::test]
    async fn limbo_resolutions_are_throttled() {
        let settings = SyncEngineSettings {
            max_concurrent_limbo_resolutions: 1,
            ..SyncEngineSettings::default()
        };
        let mut harness = Harness::new(settings);
        let (_snapshots, stream) =
            synced_rooms(&mut harness, &["rooms/a", "rooms/b", "rooms/c"]).await;
        remove_from_target(&mut harness, &stream, &["rooms/b", "rooms/c"], 3).await;

        assert_eq!(
            harness.engine.active_limbo_resolutions(),
            [(key("rooms/b"), 1)].into_iter().collect()
        );
        assert_eq!(harness.engine.enqueued_limbo_resolutions(), vec![key("rooms/c")]);

        stream
            .send_json(&json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [1],
                    "cause": { "code": 7, "message": "denied" }
                }
            }))
            .await
            .unwrap();
        while harness.engine.active_limbo_resolutions().get(&key("rooms/c")).is_none() {
            harness.pump().await;
        }
        assert_eq!(harness.engine.active_limbo_resolutions()[&key("rooms/c")], 3);
        assert!(harness.engine.enqueued_limbo_resolutions().is_empty());
    }

    #[tokio::test]
    async fn target_cause_ends_the_subscription() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (_, snapshots) = harness.listen(rooms());
        snapshots.try_recv().unwrap().unwrap();
        let stream = harness.open_watch().await;
        stream
            .send_json(&json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "cause": { "code": 7, "message": "denied" }
                }
            }))
            .await
            .unwrap();

        let error = loop {
            if let Ok(next) = snapshots.try_recv() {
                break next.unwrap_err();
            }
            harness.pump().await;
        };
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert!(snapshots.recv().await.is_err());
        assert_eq!(harness.engine.target_for_query(&rooms()), None);
    }

    async fn open_write_stream(harness: &mut Harness) -> ServerStream {
        let stream = harness.server.next_write_stream().await.unwrap();
        while harness.engine.remote_store().write_state() != StreamState::Open {
            harness.pump().await;
        }
        stream.recv_json().await.unwrap();
        stream.send_json(&json!({ "streamToken": "AQ==" })).await.unwrap();
        while harness.engine.local_store().last_stream_token().unwrap() != vec![1] {
            harness.pump().await;
        }
        assert!(stream.recv_json().await.unwrap()["writes"].is_array());
        stream
    }

    async fn pump_until_resolved(
        harness: &mut Harness,
        pending: &mut oneshot::Receiver<FirestoreResult<()>>,
    ) -> FirestoreResult<()> {
        loop {
            if let Ok(Some(outcome)) = pending.try_recv() {
                return outcome;
            }
            harness.pump().await;
        }
    }

    #[tokio::test]
    async fn acknowledged_write_resolves_its_callback() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (_, _snapshots) = harness.listen(rooms());
        let (callback, mut pending) = oneshot::channel();
        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .unwrap();

        let stream = open_write_stream(&mut harness).await;
        stream
            .send_json(&json!({
                "streamToken": "Ag==",
                "commitTime": "1970-01-01T00:00:07Z",
                "writeResults": [{ "updateTime": "1970-01-01T00:00:07Z" }]
            }))
            .await
            .unwrap();

        pump_until_resolved(&mut harness, &mut pending).await.unwrap();
        assert_eq!(harness.engine.pending_write_count(), 0);
        assert_eq!(harness.engine.local_store().last_stream_token().unwrap(), vec![2]);
        // Still pending for listeners until watch catches up with the committed version.
        let committed = harness.engine.read_document(&key("rooms/a")).unwrap().unwrap();
        assert!(committed.has_committed_mutations());
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_and_reverts() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (_, snapshots) = harness.listen(rooms());
        let (callback, mut pending) = oneshot::channel();
        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .unwrap();

        let stream = open_write_stream(&mut harness).await;
        stream.fail(invalid_argument("bad write")).await;

        let error = pump_until_resolved(&mut harness, &mut pending).await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(harness.engine.pending_write_count(), 0);
        let reverted = harness
            .pump_until_snapshot(&snapshots, |snapshot| snapshot.docs.is_empty() && !snapshot.changes.is_empty())
            .await;
        assert!(!reverted.has_pending_writes);
    }

    #[tokio::test]
    async fn empty_writes_are_rejected_without_queueing() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (callback, mut pending) = oneshot::channel();
        harness.engine.write(Vec::new(), callback).unwrap();
        let outcome = pending.try_recv().unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(harness.engine.pending_write_count(), 0);
    }

    #[tokio::test]
    async fn user_switch_keeps_each_queue() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (callback, _pending) = oneshot::channel();
        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .unwrap();
        assert_eq!(harness.engine.pending_write_count(), 1);

        harness.engine.change_user(User::new("alice")).unwrap();
        assert_eq!(harness.engine.pending_write_count(), 0);
        assert_eq!(harness.engine.read_document(&key("rooms/a")).unwrap(), None);

        harness.engine.change_user(User::unauthenticated()).unwrap();
        assert_eq!(harness.engine.pending_write_count(), 1);
        assert!(harness
            .engine
            .read_document(&key("rooms/a"))
            .unwrap()
            .is_some_and(|doc| doc.has_local_mutations()));
    }

    #[tokio::test]
    async fn shutdown_cancels_listeners_and_writes() {
        let mut harness = Harness::new(SyncEngineSettings::default());
        let (_, snapshots) = harness.listen(rooms());
        snapshots.try_recv().unwrap().unwrap();
        let (callback, mut pending) = oneshot::channel();
        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .unwrap();
        snapshots.try_recv().unwrap().unwrap();

        harness.engine.shutdown();
        assert_eq!(
            snapshots.try_recv().unwrap().unwrap_err().code,
            FirestoreErrorCode::Cancelled
        );
        let outcome = pending.try_recv().unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::Cancelled);
    }
}
