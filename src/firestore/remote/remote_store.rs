use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::datastore::{CredentialsProvider, StreamingDatastore};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::listen::{
    decode_listen_response, encode_unwatch_request, encode_watch_request,
};
use crate::firestore::remote::streams::write::{
    decode_write_response, encode_handshake, encode_write_request,
};
use crate::firestore::remote::streams::{
    spawn_backoff, spawn_open, OpenStream, StreamEvent, StreamEventSink, StreamKind,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::util::{BackoffConfig, ExponentialBackoff};

pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Outcomes the remote store hands to the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStoreEvent {
    RemoteEvent(RemoteEvent),
    TargetRejected {
        target_id: TargetId,
        error: FirestoreError,
    },
    WriteAcknowledged(MutationBatchResult),
    WriteRejected {
        batch_id: BatchId,
        error: FirestoreError,
    },
    StreamTokenChanged(Vec<u8>),
    OnlineStateChanged(OnlineState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
}

struct StreamSlot {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    stream: Option<OpenStream>,
}

impl StreamSlot {
    fn new(kind: StreamKind, backoff: BackoffConfig) -> Self {
        Self {
            kind,
            state: StreamState::Disconnected,
            generation: 0,
            backoff: ExponentialBackoff::new(backoff),
            stream: None,
        }
    }

    fn is_started(&self) -> bool {
        self.state != StreamState::Disconnected
    }

    fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    fn send(&self, payload: &serde_json::Value) {
        match (&self.stream, serde_json::to_vec(payload)) {
            (Some(stream), Ok(bytes)) => stream.send(bytes),
            (None, _) => log::debug!("{} stream is not open; dropping request", self.kind.label()),
            (_, Err(err)) => log::warn!("failed to encode {} request: {err}", self.kind.label()),
        }
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }
}

/// Adapts the store's target table plus the syncer into what the aggregator reads.
struct StoreMetadata<'a> {
    targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for StoreMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }
}

/// Watch and write stream state machines.
///
/// Every method runs to completion on the worker; anything that suspends is delegated to a
/// detached task that answers through the event sink with a [`StreamEvent`].
pub struct RemoteStore {
    serializer: JsonProtoSerializer,
    datastore: Arc<dyn StreamingDatastore>,
    credentials: Arc<dyn CredentialsProvider>,
    sink: StreamEventSink,
    max_pending_writes: usize,
    offline_causes: BTreeSet<OfflineCause>,
    listen_targets: BTreeMap<TargetId, TargetData>,
    next_generation: u64,
    watch: StreamSlot,
    write: StreamSlot,
    aggregator: WatchChangeAggregator,
    write_pipeline: VecDeque<MutationBatch>,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
    online_state: OnlineState,
}

impl RemoteStore {
    pub fn new(
        serializer: JsonProtoSerializer,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: Arc<dyn CredentialsProvider>,
        sink: StreamEventSink,
        backoff: BackoffConfig,
        max_pending_writes: usize,
    ) -> Self {
        let aggregator = WatchChangeAggregator::new(serializer.database_id().clone());
        Self {
            serializer,
            datastore,
            credentials,
            sink,
            max_pending_writes: max_pending_writes.max(1),
            offline_causes: BTreeSet::new(),
            listen_targets: BTreeMap::new(),
            next_generation: 0,
            watch: StreamSlot::new(StreamKind::Listen, backoff),
            write: StreamSlot::new(StreamKind::Write, backoff),
            aggregator,
            write_pipeline: VecDeque::new(),
            handshake_complete: false,
            last_stream_token: Vec::new(),
            online_state: OnlineState::Unknown,
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn watch_state(&self) -> StreamState {
        self.watch.state
    }

    pub fn write_state(&self) -> StreamState {
        self.write.state
    }

    pub fn pending_write_pipeline(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    /// Starts watching `target`; it is sent now if the watch stream is open, otherwise on open.
    pub fn listen(&mut self, target: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target.clone());

        if self.should_start_watch_stream() {
            self.start_stream(StreamKind::Listen);
        } else if self.watch.is_open() {
            self.send_watch_request(target, syncer);
        }
    }

    pub fn unlisten(&mut self, target_id: TargetId) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        if self.listen_targets.remove(&target_id).is_none() {
            return events;
        }
        if self.watch.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            self.stop_stream(StreamKind::Listen);
            self.aggregator.clear();
            if self.can_use_network() {
                self.set_online_state(OnlineState::Unknown, &mut events);
            }
        }
        events
    }

    pub fn enable_network(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer)
    }

    pub fn disable_network(&mut self) -> Vec<RemoteStoreEvent> {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        let mut events = Vec::new();
        self.disable_network_internal();
        self.set_online_state(OnlineState::Offline, &mut events);
        events
    }

    /// Tears both streams down for good.
    pub fn shutdown(&mut self) {
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
    }

    /// Skips any pending backoff, as when the host reports that connectivity returned.
    pub fn notify_network_available(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        if !self.can_use_network() {
            return Ok(Vec::new());
        }
        for kind in [StreamKind::Listen, StreamKind::Write] {
            if self.slot(kind).state == StreamState::Backoff {
                self.slot_mut(kind).backoff.reset();
                self.start_stream(kind);
            }
        }
        self.enable_network_internal(syncer)
    }

    /// Reopens both streams under the new credentials, re-sending every target with its token.
    pub fn handle_credential_change(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        if !self.can_use_network() {
            self.write_pipeline.clear();
            self.last_stream_token.clear();
            return Ok(Vec::new());
        }
        log::debug!("restarting streams for new credentials");
        let mut events = Vec::new();
        self.disable_network_internal();
        self.last_stream_token.clear();
        self.set_online_state(OnlineState::Unknown, &mut events);
        events.extend(self.enable_network_internal(syncer)?);
        Ok(events)
    }

    /// Pulls pending batches from the syncer until the pipeline is full, starting the write
    /// stream when there is something to send.
    pub fn fill_write_pipeline(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = syncer.next_mutation_batch(last_batch_id)? else {
                break;
            };
            last_batch_id = Some(batch.batch_id);
            self.add_to_write_pipeline(batch);
        }

        if self.should_start_write_stream() {
            self.start_stream(StreamKind::Write);
        }
        Ok(())
    }

    pub fn handle_stream_event(
        &mut self,
        event: StreamEvent,
        syncer: &dyn RemoteSyncer,
    ) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let kind = event.kind();
        if event.generation() != self.slot(kind).generation {
            log::debug!("ignoring stale {} stream event {event:?}", kind.label());
            if let StreamEvent::Opened { handle, .. } = event {
                OpenStream::new(kind, handle).close();
            }
            return Ok(Vec::new());
        }

        match event {
            StreamEvent::Opened { handle, .. } => {
                let slot = self.slot_mut(kind);
                slot.stream = Some(OpenStream::new(kind, handle));
                slot.state = StreamState::Open;
                slot.backoff.reset();
                match kind {
                    StreamKind::Listen => self.on_watch_stream_open(syncer),
                    StreamKind::Write => self.on_write_stream_open(),
                }
                Ok(Vec::new())
            }
            StreamEvent::OpenFailed { error, .. } => {
                log::debug!("{} stream failed to open: {error}", kind.label());
                self.on_stream_close(kind, error)
            }
            StreamEvent::Closed { error, .. } => {
                let error = error.unwrap_or_else(|| unavailable("stream closed by the server"));
                log::debug!("{} stream closed: {error}", kind.label());
                self.on_stream_close(kind, error)
            }
            StreamEvent::Message { payload, .. } => match kind {
                StreamKind::Listen => self.on_watch_message(&payload, syncer),
                StreamKind::Write => self.on_write_message(&payload),
            },
            StreamEvent::BackoffElapsed { .. } => {
                let should_restart = match kind {
                    StreamKind::Listen => !self.listen_targets.is_empty(),
                    StreamKind::Write => !self.write_pipeline.is_empty(),
                };
                if self.slot(kind).state == StreamState::Backoff {
                    if should_restart {
                        self.start_stream(kind);
                    } else {
                        self.slot_mut(kind).state = StreamState::Disconnected;
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    fn enable_network_internal(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let mut events = Vec::new();
        if !self.can_use_network() {
            return Ok(events);
        }
        if self.should_start_watch_stream() {
            self.start_stream(StreamKind::Listen);
        } else if self.listen_targets.is_empty() {
            self.set_online_state(OnlineState::Unknown, &mut events);
        }
        self.fill_write_pipeline(syncer)?;
        Ok(events)
    }

    fn disable_network_internal(&mut self) {
        self.stop_stream(StreamKind::Listen);
        self.stop_stream(StreamKind::Write);
        self.aggregator.clear();
        self.handshake_complete = false;
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "dropping {} batches from the write pipeline; they stay queued locally",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch.is_started() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write.is_started() && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn slot(&self, kind: StreamKind) -> &StreamSlot {
        match kind {
            StreamKind::Listen => &self.watch,
            StreamKind::Write => &self.write,
        }
    }

    fn slot_mut(&mut self, kind: StreamKind) -> &mut StreamSlot {
        match kind {
            StreamKind::Listen => &mut self.watch,
            StreamKind::Write => &mut self.write,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn start_stream(&mut self, kind: StreamKind) {
        let generation = self.next_generation();
        let slot = self.slot_mut(kind);
        slot.drop_stream();
        slot.generation = generation;
        slot.state = StreamState::Connecting;
        if kind == StreamKind::Write {
            self.handshake_complete = false;
        }
        spawn_open(
            Arc::clone(&self.datastore),
            Arc::clone(&self.credentials),
            kind,
            generation,
            Arc::clone(&self.sink),
        );
    }

    fn stop_stream(&mut self, kind: StreamKind) {
        // A new generation orphans the stream's reader and any pending backoff timer.
        let generation = self.next_generation();
        let slot = self.slot_mut(kind);
        slot.drop_stream();
        slot.generation = generation;
        slot.state = StreamState::Disconnected;
        slot.backoff.reset();
    }

    fn schedule_restart(&mut self, kind: StreamKind) {
        let generation = self.next_generation();
        let sink = Arc::clone(&self.sink);
        let slot = self.slot_mut(kind);
        slot.generation = generation;
        slot.state = StreamState::Backoff;
        let delay = slot.backoff.next_delay();
        spawn_backoff(kind, generation, delay, sink);
    }

    fn set_online_state(&mut self, state: OnlineState, events: &mut Vec<RemoteStoreEvent>) {
        if self.online_state != state {
            log::debug!("online state changed to {state:?}");
            self.online_state = state;
            events.push(RemoteStoreEvent::OnlineStateChanged(state));
        }
    }

    fn handle_watch_stream_failure(&mut self, events: &mut Vec<RemoteStoreEvent>) {
        if self.online_state == OnlineState::Online {
            // One failure after being online is not proof of being offline.
            self.set_online_state(OnlineState::Unknown, events);
        } else {
            self.set_online_state(OnlineState::Offline, events);
        }
    }

    fn on_stream_close(&mut self, kind: StreamKind, error: FirestoreError) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let mut events = Vec::new();
        self.slot_mut(kind).drop_stream();
        self.slot_mut(kind).state = StreamState::Disconnected;

        match error.code {
            FirestoreErrorCode::Unauthenticated => self.credentials.invalidate_token(),
            FirestoreErrorCode::ResourceExhausted => {
                log::debug!("{} stream exhausted backend resources; using maximum backoff", kind.label());
                self.slot_mut(kind).backoff.reset_to_max();
            }
            _ => {}
        }

        match kind {
            StreamKind::Listen => {
                self.aggregator.clear();
                if self.should_start_watch_stream() {
                    self.handle_watch_stream_failure(&mut events);
                    self.schedule_restart(StreamKind::Listen);
                } else {
                    self.set_online_state(OnlineState::Unknown, &mut events);
                }
            }
            StreamKind::Write => {
                let mut skip_backoff = false;
                if !self.write_pipeline.is_empty() {
                    if self.handshake_complete {
                        if error.code.is_permanent_write_error() {
                            if let Some(batch) = self.write_pipeline.pop_front() {
                                log::debug!("write batch {} rejected: {error}", batch.batch_id);
                                events.push(RemoteStoreEvent::WriteRejected {
                                    batch_id: batch.batch_id,
                                    error: error.clone(),
                                });
                                skip_backoff = true;
                            }
                        }
                    } else if !error.code.is_transient() {
                        log::debug!("write stream failed before the handshake; resetting stream token");
                        self.last_stream_token.clear();
                        events.push(RemoteStoreEvent::StreamTokenChanged(Vec::new()));
                    }
                }
                self.handshake_complete = false;

                if self.should_start_write_stream() {
                    if skip_backoff {
                        self.start_stream(StreamKind::Write);
                    } else {
                        self.schedule_restart(StreamKind::Write);
                    }
                }
            }
        }
        Ok(events)
    }

    fn on_watch_stream_open(&mut self, syncer: &dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target in targets {
            self.send_watch_request(target, syncer);
        }
    }

    fn send_watch_request(&mut self, target: TargetData, syncer: &dyn RemoteSyncer) {
        self.aggregator.record_pending_target_request(target.target_id);
        let target = if !target.resume_token.is_empty() || !target.snapshot_version.is_min() {
            let expected = syncer.remote_keys_for_target(target.target_id).len();
            target.with_expected_count(expected as i32)
        } else {
            target
        };
        let request = encode_watch_request(&self.serializer, &target);
        self.watch.send(&request);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        self.aggregator.record_pending_target_request(target_id);
        let request = encode_unwatch_request(&self.serializer, target_id);
        self.watch.send(&request);
    }

    fn on_watch_message(&mut self, payload: &[u8], syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let mut events = Vec::new();
        self.set_online_state(OnlineState::Online, &mut events);

        let change = match decode_listen_response(&self.serializer, payload) {
            Ok(Some(change)) => change,
            Ok(None) => return Ok(events),
            Err(err) => {
                log::warn!("closing listen stream after an undecodable message: {err}");
                events.extend(self.on_stream_close(StreamKind::Listen, err)?);
                return Ok(events);
            }
        };

        let snapshot_version = boundary_version(&change);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    for target_id in &target_change.target_ids {
                        if self.listen_targets.remove(target_id).is_some() {
                            log::debug!("target {target_id} rejected: {cause}");
                            self.aggregator.remove_target(*target_id);
                            events.push(RemoteStoreEvent::TargetRejected {
                                target_id: *target_id,
                                error: cause.clone(),
                            });
                        }
                    }
                    return Ok(events);
                }
            }
        }

        {
            let metadata = StoreMetadata {
                targets: &self.listen_targets,
                syncer,
            };
            match change {
                WatchChange::TargetChange(change) => {
                    self.aggregator.handle_target_change(&change, &metadata)
                }
                WatchChange::DocumentChange(change) => {
                    self.aggregator.handle_document_change(change, &metadata)
                }
                WatchChange::ExistenceFilter(change) => {
                    self.aggregator.handle_existence_filter(&change, &metadata);
                }
            }
        }

        if let Some(version) = snapshot_version {
            let last = syncer.last_remote_snapshot_version();
            if version >= last {
                events.push(self.raise_watch_snapshot(version, syncer));
            } else {
                log::debug!("ignoring snapshot at {version:?}, older than {last:?}");
            }
        }
        Ok(events)
    }

    fn raise_watch_snapshot(&mut self, version: SnapshotVersion, syncer: &dyn RemoteSyncer) -> RemoteStoreEvent {
        let event = {
            let metadata = StoreMetadata {
                targets: &self.listen_targets,
                syncer,
            };
            self.aggregator.create_remote_event(version, &metadata)
        };

        for (target_id, change) in &event.target_changes {
            if !change.current || change.resume_token.is_empty() {
                continue;
            }
            if let Some(target) = self.listen_targets.get_mut(target_id) {
                *target = target.clone().with_resume_token(change.resume_token.clone(), version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Drop the token but keep the version; a reconnect re-adds the target with its
            // last consistent `readTime` instead of a resume token.
            let snapshot_version = target.snapshot_version;
            self.listen_targets.insert(
                *target_id,
                target.clone().with_resume_token(Vec::new(), snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let fresh = TargetData::new(target.query, *target_id, *purpose);
            self.send_watch_request(fresh, syncer);
        }

        RemoteStoreEvent::RemoteEvent(event)
    }

    fn on_write_stream_open(&mut self) {
        self.handshake_complete = false;
        let request = encode_handshake(&self.serializer);
        self.write.send(&request);
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write.is_open() && self.handshake_complete {
            self.send_write_request(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn send_write_request(&self, batch: &MutationBatch) {
        let request = encode_write_request(&self.serializer, &self.last_stream_token, &batch.mutations);
        self.write.send(&request);
    }

    fn on_write_message(&mut self, payload: &[u8]) -> FirestoreResult<Vec<RemoteStoreEvent>> {
        let mut events = Vec::new();
        let response = match decode_write_response(&self.serializer, payload) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("closing write stream after an undecodable message: {err}");
                events.extend(self.on_stream_close(StreamKind::Write, internal_error(err.message()))?);
                return Ok(events);
            }
        };

        self.last_stream_token = response.stream_token.clone();
        events.push(RemoteStoreEvent::StreamTokenChanged(response.stream_token.clone()));

        if !self.handshake_complete {
            self.handshake_complete = true;
            for batch in &self.write_pipeline {
                self.send_write_request(batch);
            }
            return Ok(events);
        }

        let Some(batch) = self.write_pipeline.pop_front() else {
            log::warn!("write response without an outstanding batch");
            return Ok(events);
        };
        if batch.mutations.len() != response.write_results.len() {
            log::warn!(
                "batch {} has {} mutations but {} write results",
                batch.batch_id,
                batch.mutations.len(),
                response.write_results.len()
            );
        }
        events.push(RemoteStoreEvent::WriteAcknowledged(MutationBatchResult {
            batch,
            commit_version: response.commit_version,
            mutation_results: response.write_results,
            stream_token: response.stream_token,
        }));
        Ok(events)
    }
}

/// Read time of a message that closes a consistent snapshot: a global no-change marker or a
/// `CURRENT` change, either carrying a read time.
fn boundary_version(change: &WatchChange) -> Option<SnapshotVersion> {
    match change {
        WatchChange::TargetChange(change)
            if !change.read_time.is_min()
                && (change.target_ids.is_empty() || change.state == TargetChangeState::Current)
                && change.cause.is_none() =>
        {
            Some(change.read_time)
        }
        _ => None,
    }
}
