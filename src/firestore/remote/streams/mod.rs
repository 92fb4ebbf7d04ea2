//! Stream I/O that runs outside the worker.
//!
//! Opening a stream, reading from it and waiting out a backoff all suspend, so each runs as a
//! detached task that reports back through a [`StreamEventSink`]. Events carry the generation of
//! the stream they belong to; the remote store drops events from streams it already tore down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::datastore::{
    CredentialsProvider, StreamCredentials, StreamHandle, StreamingDatastore,
};
use crate::platform::runtime;

pub mod listen;
pub mod write;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

pub enum StreamEvent {
    Opened {
        kind: StreamKind,
        generation: u64,
        handle: Arc<dyn StreamHandle>,
    },
    OpenFailed {
        kind: StreamKind,
        generation: u64,
        error: FirestoreError,
    },
    Message {
        kind: StreamKind,
        generation: u64,
        payload: Vec<u8>,
    },
    /// The server ended the stream; `error` is `None` for a clean close.
    Closed {
        kind: StreamKind,
        generation: u64,
        error: Option<FirestoreError>,
    },
    BackoffElapsed {
        kind: StreamKind,
        generation: u64,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamEvent::Opened { kind, .. }
            | StreamEvent::OpenFailed { kind, .. }
            | StreamEvent::Message { kind, .. }
            | StreamEvent::Closed { kind, .. }
            | StreamEvent::BackoffElapsed { kind, .. } => *kind,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            StreamEvent::Opened { generation, .. }
            | StreamEvent::OpenFailed { generation, .. }
            | StreamEvent::Message { generation, .. }
            | StreamEvent::Closed { generation, .. }
            | StreamEvent::BackoffElapsed { generation, .. } => *generation,
        }
    }
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamEvent::Opened { .. } => "Opened",
            StreamEvent::OpenFailed { .. } => "OpenFailed",
            StreamEvent::Message { .. } => "Message",
            StreamEvent::Closed { .. } => "Closed",
            StreamEvent::BackoffElapsed { .. } => "BackoffElapsed",
        };
        f.debug_struct(name)
            .field("kind", &self.kind())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Where detached stream tasks deliver their events.
pub type StreamEventSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// A stream that finished opening, plus the ordered queue feeding its sends.
pub struct OpenStream {
    handle: Arc<dyn StreamHandle>,
    outgoing: Sender<Vec<u8>>,
}

impl OpenStream {
    /// Starts the writer task; sends are delivered in the order they are queued.
    pub fn new(kind: StreamKind, handle: Arc<dyn StreamHandle>) -> Self {
        let (outgoing, queued) = async_channel::unbounded::<Vec<u8>>();
        let writer = Arc::clone(&handle);
        runtime::spawn_detached(async move {
            while let Ok(payload) = queued.recv().await {
                if let Err(err) = writer.send(payload).await {
                    log::debug!("{} stream send failed: {err}", kind.label());
                    break;
                }
            }
        });
        Self { handle, outgoing }
    }

    pub fn send(&self, payload: Vec<u8>) {
        if self.outgoing.try_send(payload).is_err() {
            log::debug!("dropping message for a closed stream");
        }
    }

    pub fn close(self) {
        self.outgoing.close();
        let handle = self.handle;
        runtime::spawn_detached(async move {
            if let Err(err) = handle.close().await {
                log::debug!("error while closing stream: {err}");
            }
        });
    }
}

/// Fetches a token, opens a stream of `kind` and then pumps its messages into `sink`.
pub fn spawn_open(
    datastore: Arc<dyn StreamingDatastore>,
    credentials: Arc<dyn CredentialsProvider>,
    kind: StreamKind,
    generation: u64,
    sink: StreamEventSink,
) {
    runtime::spawn_detached(async move {
        let auth_token = match credentials.get_token().await {
            Ok(token) => token,
            Err(error) => {
                sink(StreamEvent::OpenFailed {
                    kind,
                    generation,
                    error,
                });
                return;
            }
        };
        let stream_credentials = StreamCredentials { auth_token };
        let opened = match kind {
            StreamKind::Listen => datastore.open_listen_stream(stream_credentials).await,
            StreamKind::Write => datastore.open_write_stream(stream_credentials).await,
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(error) => {
                sink(StreamEvent::OpenFailed {
                    kind,
                    generation,
                    error,
                });
                return;
            }
        };

        sink(StreamEvent::Opened {
            kind,
            generation,
            handle: Arc::clone(&handle),
        });

        loop {
            match handle.next().await {
                Some(Ok(payload)) => sink(StreamEvent::Message {
                    kind,
                    generation,
                    payload,
                }),
                Some(Err(error)) => {
                    sink(StreamEvent::Closed {
                        kind,
                        generation,
                        error: Some(error),
                    });
                    break;
                }
                None => {
                    sink(StreamEvent::Closed {
                        kind,
                        generation,
                        error: None,
                    });
                    break;
                }
            }
        }
    });
}

/// Reports `BackoffElapsed` after `delay`.
pub fn spawn_backoff(kind: StreamKind, generation: u64, delay: Duration, sink: StreamEventSink) {
    log::debug!(
        "{} stream retrying in {} ms",
        kind.label(),
        delay.as_millis()
    );
    runtime::spawn_detached(async move {
        runtime::sleep(delay).await;
        sink(StreamEvent::BackoffElapsed { kind, generation });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{unavailable, FirestoreErrorCode};
    use crate::firestore::remote::datastore::{loopback, StaticCredentials};
    use serde_json::json;

    fn channel_sink() -> (StreamEventSink, async_channel::Receiver<StreamEvent>) {
        let (sender, receiver) = async_channel::unbounded();
        let sink: StreamEventSink = Arc::new(move |event| {
            let _ = sender.try_send(event);
        });
        (sink, receiver)
    }

    #[tokio::test]
    async fn open_then_pump_messages_until_close() {
        let (datastore, server) = loopback();
        let (sink, events) = channel_sink();
        let credentials = StaticCredentials::new(Default::default(), Some("secret".into()));
        spawn_open(Arc::new(datastore), Arc::new(credentials), StreamKind::Listen, 3, sink);

        let stream = server.next_listen_stream().await.unwrap();
        assert_eq!(stream.credentials().auth_token.as_deref(), Some("secret"));

        let StreamEvent::Opened { generation, handle, .. } = events.recv().await.unwrap() else {
            panic!("expected open");
        };
        assert_eq!(generation, 3);

        let open = OpenStream::new(StreamKind::Listen, handle);
        open.send(b"{\"a\":1}".to_vec());
        assert_eq!(stream.recv_json().await, Some(json!({ "a": 1 })));

        stream.send_json(&json!({ "b": 2 })).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            StreamEvent::Message { generation: 3, .. }
        ));

        stream.fail(unavailable("gone")).await;
        match events.recv().await.unwrap() {
            StreamEvent::Closed { error: Some(error), .. } => {
                assert_eq!(error.code, FirestoreErrorCode::Unavailable)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_failures_are_reported() {
        let (datastore, server) = loopback();
        server.reject_next_write(unavailable("no"));
        let (sink, events) = channel_sink();
        spawn_open(
            Arc::new(datastore),
            Arc::new(StaticCredentials::unauthenticated()),
            StreamKind::Write,
            1,
            sink,
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            StreamEvent::OpenFailed { kind: StreamKind::Write, .. }
        ));
    }

    #[tokio::test]
    async fn backoff_reports_when_elapsed() {
        let (sink, events) = channel_sink();
        spawn_backoff(StreamKind::Listen, 9, Duration::from_millis(1), sink);
        let event = events.recv().await.unwrap();
        assert_eq!(event.generation(), 9);
        assert!(matches!(event, StreamEvent::BackoffElapsed { .. }));
    }
}
