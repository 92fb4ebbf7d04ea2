pub mod bloom_filter;
pub mod datastore;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod streams;
pub(crate) mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterError};
pub use datastore::{
    loopback, CredentialChangeListener, CredentialsProvider, LoopbackDatastore, LoopbackServer,
    ServerStream, StaticCredentials, StreamCredentials, StreamHandle, StreamingDatastore,
    StreamingFuture,
};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OnlineState, RemoteStore, RemoteStoreEvent, StreamState};
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use streams::{StreamEvent, StreamKind};
pub use watch_change::{ExistenceFilter, WatchChange};
pub use watch_change_aggregator::{
    BloomFilterApplication, TargetMetadataProvider, WatchChangeAggregator,
};
