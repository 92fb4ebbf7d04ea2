use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;

use crate::firestore::core::{ListenerId, Query, SnapshotSender, SyncEngine, WriteCallback};
use crate::firestore::error::{
    cancelled, failed_precondition, internal_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::LocalStore;
use crate::firestore::model::{DatabaseId, Document, DocumentKey, Mutation, User};
use crate::firestore::remote::streams::{OpenStream, StreamEventSink};
use crate::firestore::remote::{JsonProtoSerializer, RemoteStore, StreamEvent};
use crate::platform::runtime;

use super::settings::{ClientComponents, ClientSettings};
use super::subscription::{PendingWrite, QuerySubscription};

type Reply<T> = oneshot::Sender<FirestoreResult<T>>;

/// Work handed to the client's worker. Processed strictly in arrival order.
pub(crate) enum Command {
    Listen {
        listener_id: ListenerId,
        query: Query,
        sender: SnapshotSender,
    },
    Unlisten(ListenerId),
    Write {
        mutations: Vec<Mutation>,
        callback: WriteCallback,
    },
    EnableNetwork(Reply<()>),
    DisableNetwork(Reply<()>),
    NetworkAvailable,
    ChangeUser(User),
    ClearPersistence(Reply<()>),
    PendingWriteCount(Reply<usize>),
    ReadDocument {
        key: DocumentKey,
        reply: Reply<Option<Document>>,
    },
    /// Report from a stream task of the engine started as `epoch`.
    Stream {
        epoch: u64,
        event: StreamEvent,
    },
    Terminate(Option<oneshot::Sender<()>>),
}

fn terminated() -> FirestoreError {
    cancelled("The client has been terminated")
}

/// Closes the stream behind an event nobody will handle.
fn discard_stream_event(event: StreamEvent) {
    if let StreamEvent::Opened { kind, handle, .. } = event {
        OpenStream::new(kind, handle).close();
    }
}

/// Answers `command` with `error` instead of running it.
fn reject(command: Command, error: &FirestoreError) {
    match command {
        Command::Listen { sender, .. } => {
            let _ = sender.try_send(Err(error.clone()));
            sender.close();
        }
        Command::Write { callback, .. } => {
            let _ = callback.send(Err(error.clone()));
        }
        Command::EnableNetwork(reply)
        | Command::DisableNetwork(reply)
        | Command::ClearPersistence(reply) => {
            let _ = reply.send(Err(error.clone()));
        }
        Command::PendingWriteCount(reply) => {
            let _ = reply.send(Err(error.clone()));
        }
        Command::ReadDocument { reply, .. } => {
            let _ = reply.send(Err(error.clone()));
        }
        Command::Stream { event, .. } => discard_stream_event(event),
        Command::Terminate(Some(reply)) => {
            let _ = reply.send(());
        }
        Command::Terminate(None)
        | Command::Unlisten(_)
        | Command::NetworkAvailable
        | Command::ChangeUser(_) => {}
    }
}

enum EngineSlot {
    /// Not used yet in this session; persistence may still be cleared.
    Pending,
    Running(Box<SyncEngine>),
    /// Stopped by an unrecoverable error, which every later command receives.
    Failed(FirestoreError),
}

struct Worker {
    components: ClientComponents,
    settings: ClientSettings,
    serializer: JsonProtoSerializer,
    user: User,
    commands: Sender<Command>,
    epoch: u64,
    slot: EngineSlot,
}

impl Worker {
    fn new(components: ClientComponents, settings: ClientSettings, commands: Sender<Command>) -> Self {
        let serializer = JsonProtoSerializer::new(components.database_id.clone());
        let user = components.credentials.current_user();
        Self {
            components,
            settings,
            serializer,
            user,
            commands,
            epoch: 0,
            slot: EngineSlot::Pending,
        }
    }

    fn open_engine(&mut self) -> FirestoreResult<SyncEngine> {
        self.epoch += 1;
        let epoch = self.epoch;
        let commands = self.commands.clone();
        let sink: StreamEventSink = Arc::new(move |event| {
            if let Err(err) = commands.try_send(Command::Stream { epoch, event }) {
                reject(err.into_inner(), &terminated());
            }
        });

        let local = LocalStore::open(
            Arc::clone(&self.components.storage),
            self.serializer.clone(),
            self.user.clone(),
        )?;
        let remote = RemoteStore::new(
            self.serializer.clone(),
            Arc::clone(&self.components.datastore),
            Arc::clone(&self.components.credentials),
            sink,
            self.settings.backoff,
            self.settings.max_pending_writes,
        );
        let mut engine = SyncEngine::new(local, remote, self.settings.engine_settings());
        engine.start()?;
        log::debug!("sync engine started for {}", self.user);
        Ok(engine)
    }

    /// The running engine, started on first use.
    fn engine(&mut self) -> FirestoreResult<&mut SyncEngine> {
        if matches!(self.slot, EngineSlot::Pending) {
            self.slot = match self.open_engine() {
                Ok(engine) => EngineSlot::Running(Box::new(engine)),
                Err(error) => {
                    log::warn!("failed to start the sync engine: {error}");
                    EngineSlot::Failed(error)
                }
            };
        }
        match &mut self.slot {
            EngineSlot::Running(engine) => Ok(&mut **engine),
            EngineSlot::Failed(error) => Err(error.clone()),
            EngineSlot::Pending => Err(internal_error("Sync engine did not start")),
        }
    }

    /// Runs `operation` on the engine, failing the engine if it reports a fatal error.
    fn with_engine<T>(
        &mut self,
        operation: impl FnOnce(&mut SyncEngine) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        let result = operation(self.engine()?);
        if let Err(error) = &result {
            self.settle(error);
        }
        result
    }

    fn settle(&mut self, error: &FirestoreError) {
        if !error.is_fatal() {
            log::warn!("sync engine operation failed: {error}");
            return;
        }
        if let EngineSlot::Running(engine) = &mut self.slot {
            engine.fail(error);
        }
        self.slot = EngineSlot::Failed(error.clone());
    }

    fn running_engine(&mut self) -> Option<&mut SyncEngine> {
        match &mut self.slot {
            EngineSlot::Running(engine) => Some(&mut **engine),
            _ => None,
        }
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Listen {
                listener_id,
                query,
                sender,
            } => {
                let registered = sender.clone();
                if let Err(error) = self.with_engine(|engine| engine.listen(listener_id, query, registered)) {
                    let _ = sender.try_send(Err(error));
                    sender.close();
                }
            }
            Command::Unlisten(listener_id) => {
                if let Some(Err(error)) = self.running_engine().map(|engine| engine.unlisten(listener_id)) {
                    self.settle(&error);
                }
            }
            Command::Write {
                mutations,
                callback,
            } => match self.engine() {
                Ok(engine) => {
                    if let Err(error) = engine.write(mutations, callback) {
                        self.settle(&error);
                    }
                }
                Err(error) => {
                    let _ = callback.send(Err(error));
                }
            },
            Command::EnableNetwork(reply) => {
                let _ = reply.send(self.with_engine(SyncEngine::enable_network));
            }
            Command::DisableNetwork(reply) => {
                let _ = reply.send(self.with_engine(SyncEngine::disable_network));
            }
            Command::NetworkAvailable => {
                let _ = self.with_engine(SyncEngine::notify_network_available);
            }
            Command::ChangeUser(user) => {
                self.user = user.clone();
                if let Some(Err(error)) = self.running_engine().map(|engine| engine.change_user(user)) {
                    self.settle(&error);
                }
            }
            Command::ClearPersistence(reply) => {
                let _ = reply.send(self.clear_persistence());
            }
            Command::PendingWriteCount(reply) => {
                let _ = reply.send(self.with_engine(|engine| Ok(engine.pending_write_count())));
            }
            Command::ReadDocument { key, reply } => {
                let _ = reply.send(self.with_engine(|engine| engine.read_document(&key)));
            }
            Command::Stream { epoch, event } => {
                let current = epoch == self.epoch;
                match self.running_engine() {
                    Some(engine) if current => {
                        if let Err(error) = engine.handle_stream_event(event) {
                            self.settle(&error);
                        }
                    }
                    _ => discard_stream_event(event),
                }
            }
            Command::Terminate(reply) => {
                if let Some(engine) = self.running_engine() {
                    engine.shutdown();
                }
                self.slot = EngineSlot::Failed(terminated());
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn clear_persistence(&mut self) -> FirestoreResult<()> {
        if matches!(self.slot, EngineSlot::Running(_)) {
            return Err(failed_precondition(
                "Persistence can only be cleared before the client is used or after it failed",
            ));
        }
        self.components.storage.clear()?;
        log::debug!("cleared persisted state");
        self.slot = EngineSlot::Pending;
        Ok(())
    }
}

async fn run_worker(mut worker: Worker, commands: Receiver<Command>) {
    while let Ok(command) = commands.recv().await {
        if worker.handle(command).is_break() {
            break;
        }
    }
    commands.close();
    while let Ok(command) = commands.try_recv() {
        reject(command, &terminated());
    }
    log::debug!("client worker stopped");
}

struct ClientInner {
    commands: Sender<Command>,
    components: ClientComponents,
    next_listener_id: AtomicU64,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.components.credentials.set_change_listener(None);
        let _ = self.commands.try_send(Command::Terminate(None));
    }
}

/// Offline-first handle on one database.
///
/// Every call is queued to a single worker task that owns the local cache and the network
/// streams, so reads, writes and server updates are applied in the order they were issued.
/// Clones share the same worker; dropping the last clone terminates it.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    /// Starts a client on the ambient tokio runtime (or a background thread without one).
    pub fn new(components: ClientComponents, settings: ClientSettings) -> Self {
        let (commands, receiver) = async_channel::unbounded();
        let worker = Worker::new(components.clone(), settings, commands.clone());
        runtime::spawn_detached(run_worker(worker, receiver));

        let listener_commands = commands.clone();
        components
            .credentials
            .set_change_listener(Some(Arc::new(move |user| {
                let _ = listener_commands.try_send(Command::ChangeUser(user));
            })));

        Self {
            inner: Arc::new(ClientInner {
                commands,
                components,
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.components.database_id
    }

    fn send(&self, command: Command) {
        if let Err(err) = self.inner.commands.try_send(command) {
            reject(err.into_inner(), &terminated());
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> FirestoreResult<T> {
        let (reply, receiver) = oneshot::channel();
        self.send(command(reply));
        receiver.await.unwrap_or_else(|_| Err(terminated()))
    }

    /// Subscribes to `query`. The first snapshot reflects the local cache; later ones follow
    /// local writes and server updates.
    pub fn listen(&self, query: Query) -> QuerySubscription {
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (sender, snapshots) = async_channel::unbounded();
        self.send(Command::Listen {
            listener_id,
            query,
            sender,
        });
        QuerySubscription::new(listener_id, snapshots, self.inner.commands.clone())
    }

    /// Applies `mutations` locally as one atomic batch and queues it for the backend.
    pub fn write(&self, mutations: Vec<Mutation>) -> PendingWrite {
        let (callback, receiver) = oneshot::channel();
        self.send(Command::Write {
            mutations,
            callback,
        });
        PendingWrite::new(receiver)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.request(Command::EnableNetwork).await
    }

    /// Stops both streams; listeners see `from_cache` snapshots and writes stay queued.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.request(Command::DisableNetwork).await
    }

    /// Skips any reconnect backoff, for hosts that learn connectivity came back.
    pub fn notify_network_available(&self) {
        self.send(Command::NetworkAvailable);
    }

    /// Restarts the streams with fresh credentials. A different `user` also switches to their
    /// pending writes; the previous user's stay queued for later.
    pub fn change_user(&self, user: User) {
        self.send(Command::ChangeUser(user));
    }

    /// Deletes everything persisted. Only allowed before the client was first used in this
    /// session or after persistence failed; otherwise fails with `FailedPrecondition`.
    pub async fn clear_persistence(&self) -> FirestoreResult<()> {
        self.request(Command::ClearPersistence).await
    }

    /// Batches of the current user not yet acknowledged by the backend.
    pub async fn pending_write_count(&self) -> FirestoreResult<usize> {
        self.request(Command::PendingWriteCount).await
    }

    /// Local view of one document, pending writes included. `None` when nothing is cached.
    pub async fn document_from_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let key = key.clone();
        self.request(|reply| Command::ReadDocument { key, reply }).await
    }

    /// Shuts the worker down. Subscriptions and pending writes end with `Cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Terminate(Some(reply)));
        let _ = receiver.await;
        self.inner.components.credentials.set_change_listener(None);
        Ok(())
    }
}
