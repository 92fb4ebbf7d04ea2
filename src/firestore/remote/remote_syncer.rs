use std::collections::BTreeSet;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, SnapshotVersion, TargetId};

/// What the remote store needs to read from the layers above it.
///
/// The remote store never mutates local state itself; it reports outcomes as
/// [`RemoteStoreEvent`](super::RemoteStoreEvent)s and reads through this trait.
pub trait RemoteSyncer {
    /// Keys the target is known to match, as of the last applied snapshot.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First pending batch with an id greater than `after`, for the current user.
    fn next_mutation_batch(&self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}
