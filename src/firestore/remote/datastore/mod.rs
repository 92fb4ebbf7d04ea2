use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::FirestoreResult;

mod credentials;
mod loopback;

pub use credentials::{CredentialChangeListener, CredentialsProvider, StaticCredentials};
pub use loopback::{loopback, LoopbackDatastore, LoopbackServer, ServerStream};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Credentials a stream is opened with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
}

/// One bidirectional message stream to the backend.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next message from the server. `None` once the server closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the listen and write streams.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}
