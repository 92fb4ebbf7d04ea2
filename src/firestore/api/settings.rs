use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::sync_engine::{SyncEngineSettings, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
use crate::firestore::local::StorageBackend;
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::remote_store::DEFAULT_MAX_PENDING_WRITES;
use crate::firestore::remote::{CredentialsProvider, StreamingDatastore};
use crate::util::BackoffConfig;

/// Tuning knobs of a [`FirestoreClient`](super::FirestoreClient).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientSettings {
    /// Limbo documents resolved in parallel; the rest wait in a queue.
    pub max_concurrent_limbo_resolutions: usize,
    /// Batches in flight on the write stream.
    pub max_pending_writes: usize,
    pub backoff: BackoffConfig,
    /// Evict cached documents as soon as no target or pending write references them.
    pub eager_garbage_collection: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            backoff: BackoffConfig::default(),
            eager_garbage_collection: false,
        }
    }
}

impl ClientSettings {
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_eager_garbage_collection(mut self, enabled: bool) -> Self {
        self.eager_garbage_collection = enabled;
        self
    }

    pub(crate) fn engine_settings(&self) -> SyncEngineSettings {
        SyncEngineSettings {
            max_concurrent_limbo_resolutions: self.max_concurrent_limbo_resolutions,
            eager_garbage_collection: self.eager_garbage_collection,
        }
    }
}

/// The collaborators a client is assembled from.
#[derive(Clone)]
pub struct ClientComponents {
    pub database_id: DatabaseId,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub datastore: Arc<dyn StreamingDatastore>,
    pub storage: Arc<dyn StorageBackend>,
}

impl Debug for ClientComponents {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientComponents")
            .field("database_id", &self.database_id)
            .finish_non_exhaustive()
    }
}
