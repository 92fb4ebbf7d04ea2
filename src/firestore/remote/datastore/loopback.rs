use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use serde_json::Value as JsonValue;

use super::{box_stream_future, StreamCredentials, StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};

#[derive(Clone, Debug)]
enum ServerFrame {
    Data(Vec<u8>),
    Error(FirestoreError),
}

#[derive(Default)]
struct OpenFailures {
    listen: VecDeque<FirestoreError>,
    write: VecDeque<FirestoreError>,
}

/// Creates an in-process datastore together with the server side of every stream it opens.
pub fn loopback() -> (LoopbackDatastore, LoopbackServer) {
    let (listen_tx, listen_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded();
    let failures = Arc::new(Mutex::new(OpenFailures::default()));
    (
        LoopbackDatastore {
            listen_tx,
            write_tx,
            failures: Arc::clone(&failures),
        },
        LoopbackServer {
            listen_rx,
            write_rx,
            failures,
        },
    )
}

/// Client half of the loopback pair.
pub struct LoopbackDatastore {
    listen_tx: Sender<ServerStream>,
    write_tx: Sender<ServerStream>,
    failures: Arc<Mutex<OpenFailures>>,
}

impl LoopbackDatastore {
    fn open(
        &self,
        credentials: StreamCredentials,
        accepted: &Sender<ServerStream>,
        failure: Option<FirestoreError>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let accepted = accepted.clone();
        box_stream_future(async move {
            if let Some(error) = failure {
                return Err(error);
            }
            let (to_server_tx, to_server_rx) = async_channel::unbounded();
            let (to_client_tx, to_client_rx) = async_channel::unbounded();
            let server_stream = ServerStream {
                incoming: to_server_rx,
                outgoing: to_client_tx,
                credentials,
            };
            accepted
                .send(server_stream)
                .await
                .map_err(|err| internal_error(format!("loopback server is gone: {err}")))?;
            Ok(Arc::new(LoopbackStreamHandle {
                outgoing: to_server_tx,
                incoming: to_client_rx,
            }) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for LoopbackDatastore {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.listen.pop_front());
        self.open(credentials, &self.listen_tx, failure)
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.write.pop_front());
        self.open(credentials, &self.write_tx, failure)
    }
}

struct LoopbackStreamHandle {
    outgoing: Sender<Vec<u8>>,
    incoming: Receiver<ServerFrame>,
}

impl StreamHandle for LoopbackStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.outgoing
                .send(payload)
                .await
                .map_err(|err| internal_error(format!("loopback stream closed: {err}")))
        })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        box_stream_future(async move {
            match self.incoming.recv().await {
                Ok(ServerFrame::Data(payload)) => Some(Ok(payload)),
                Ok(ServerFrame::Error(error)) => Some(Err(error)),
                Err(_) => None,
            }
        })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.outgoing.close();
            self.incoming.close();
            Ok(())
        })
    }
}

/// Server half of the loopback pair: hands out each stream the client opens.
pub struct LoopbackServer {
    listen_rx: Receiver<ServerStream>,
    write_rx: Receiver<ServerStream>,
    failures: Arc<Mutex<OpenFailures>>,
}

impl LoopbackServer {
    pub async fn next_listen_stream(&self) -> Option<ServerStream> {
        self.listen_rx.recv().await.ok()
    }

    pub async fn next_write_stream(&self) -> Option<ServerStream> {
        self.write_rx.recv().await.ok()
    }

    /// Makes the next listen-stream open fail with `error`.
    pub fn reject_next_listen(&self, error: FirestoreError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.listen.push_back(error);
        }
    }

    /// Makes the next write-stream open fail with `error`.
    pub fn reject_next_write(&self, error: FirestoreError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.write.push_back(error);
        }
    }
}

/// Server end of one stream.
pub struct ServerStream {
    incoming: Receiver<Vec<u8>>,
    outgoing: Sender<ServerFrame>,
    credentials: StreamCredentials,
}

impl ServerStream {
    /// Credentials the client opened this stream with.
    pub fn credentials(&self) -> &StreamCredentials {
        &self.credentials
    }

    /// Next request from the client, or `None` once the client closed the stream.
    pub async fn recv_json(&self) -> Option<JsonValue> {
        loop {
            let payload = self.incoming.recv().await.ok()?;
            match serde_json::from_slice(&payload) {
                Ok(value) => return Some(value),
                Err(err) => log::warn!("loopback server dropped a malformed request: {err}"),
            }
        }
    }

    pub async fn send_json(&self, value: &JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| internal_error(format!("failed to encode response: {err}")))?;
        self.outgoing
            .send(ServerFrame::Data(payload))
            .await
            .map_err(|err| internal_error(format!("loopback client is gone: {err}")))
    }

    /// Ends the stream with an error on the client side.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.outgoing.send(ServerFrame::Error(error)).await;
        self.outgoing.close();
    }

    /// Ends the stream cleanly.
    pub fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }

    pub fn is_closed(&self) -> bool {
        self.incoming.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{unavailable, FirestoreErrorCode};
    use serde_json::json;

    #[tokio::test]
    async fn exchanges_messages_both_ways() {
        let (datastore, server) = loopback();
        let credentials = StreamCredentials {
            auth_token: Some("token".into()),
        };
        let handle = datastore.open_listen_stream(credentials).await.unwrap();
        let stream = server.next_listen_stream().await.unwrap();
        assert_eq!(stream.credentials().auth_token.as_deref(), Some("token"));

        handle.send(br#"{"ping":1}"#.to_vec()).await.unwrap();
        assert_eq!(stream.recv_json().await, Some(json!({ "ping": 1 })));

        stream.send_json(&json!({ "pong": 2 })).await.unwrap();
        let payload = handle.next().await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<JsonValue>(&payload).unwrap(), json!({ "pong": 2 }));

        stream.close();
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn failures_reach_the_client() {
        let (datastore, server) = loopback();
        server.reject_next_write(unavailable("down"));
        let Err(error) = datastore.open_write_stream(StreamCredentials::default()).await else {
            panic!("open should fail");
        };
        assert_eq!(error.code, FirestoreErrorCode::Unavailable);

        let handle = datastore
            .open_write_stream(StreamCredentials::default())
            .await
            .unwrap();
        let stream = server.next_write_stream().await.unwrap();
        stream.fail(unavailable("reset")).await;
        assert!(handle.next().await.unwrap().is_err());
        assert!(handle.next().await.is_none());

        handle.close().await.unwrap();
        assert!(stream.recv_json().await.is_none());
    }
}
