use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;

use crate::firestore::core::{ListenerId, ViewSnapshot};
use crate::firestore::error::{cancelled, FirestoreResult};

use super::client::Command;

/// Live query results. Snapshots arrive in order through [`next`](Self::next).
///
/// Dropping the subscription (or calling [`detach`](Self::detach)) removes the listener; the
/// query's target is released once its last listener is gone.
pub struct QuerySubscription {
    listener_id: ListenerId,
    snapshots: Receiver<FirestoreResult<ViewSnapshot>>,
    commands: Sender<Command>,
    detached: bool,
}

impl QuerySubscription {
    pub(crate) fn new(
        listener_id: ListenerId,
        snapshots: Receiver<FirestoreResult<ViewSnapshot>>,
        commands: Sender<Command>,
    ) -> Self {
        Self {
            listener_id,
            snapshots,
            commands,
            detached: false,
        }
    }

    /// Next snapshot, an error that ended the subscription, or `None` once it is over.
    pub async fn next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.snapshots.recv().await.ok()
    }

    /// Snapshot already delivered but not yet consumed, without waiting.
    pub fn try_next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.snapshots.try_recv().ok()
    }

    pub fn detach(&mut self) {
        if !self.detached {
            let _ = self.commands.try_send(Command::Unlisten(self.listener_id));
            self.detached = true;
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Outcome of a write: resolves once the backend acknowledged the batch, or with the error that
/// made it give up.
#[must_use = "a write is applied locally either way; await it to learn the server's verdict"]
pub struct PendingWrite {
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    pub(crate) fn new(receiver: oneshot::Receiver<FirestoreResult<()>>) -> Self {
        Self { receiver }
    }
}

impl Future for PendingWrite {
    type Output = FirestoreResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| Err(cancelled("The client was terminated before the write completed")))
        })
    }
}
