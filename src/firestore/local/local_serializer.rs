//! Persistence records of the local store and their storage keys.
//!
//! Documents and writes reuse the wire JSON produced by [`JsonProtoSerializer`]; the records
//! around them are plain serde structs. Numeric ids are zero-padded so that key order matches
//! numeric order.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::firestore::core::query::LimitType;
use crate::firestore::error::{data_loss, FirestoreError, FirestoreResult};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, DocumentState, MutationBatch, SnapshotVersion, TargetId,
    Timestamp, User,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::structured_query::{
    as_limit_to_last, decode_query_target, encode_query_target,
};

pub(crate) const REMOTE_DOCUMENTS: &str = "remote_documents/";
pub(crate) const TARGETS: &str = "targets/";
pub(crate) const TARGET_DOCUMENTS: &str = "target_documents/";
pub(crate) const TARGET_GLOBALS: &str = "target_globals";
pub(crate) const MUTATION_QUEUES: &str = "mutation_queues/";
pub(crate) const MUTATIONS: &str = "mutations/";
pub(crate) const MUTATION_GLOBALS: &str = "mutation_globals";

pub(crate) fn remote_document_key(key: &DocumentKey) -> String {
    format!("{REMOTE_DOCUMENTS}{}", key.path().canonical_string())
}

pub(crate) fn target_key(target_id: TargetId) -> String {
    format!("{TARGETS}{target_id:010}")
}

pub(crate) fn target_documents_prefix(target_id: TargetId) -> String {
    format!("{TARGET_DOCUMENTS}{target_id:010}/")
}

pub(crate) fn target_document_key(target_id: TargetId, key: &DocumentKey) -> String {
    format!(
        "{}{}",
        target_documents_prefix(target_id),
        key.path().canonical_string()
    )
}

fn user_segment(user: &User) -> String {
    utf8_percent_encode(&user.storage_key(), NON_ALPHANUMERIC).to_string()
}

pub(crate) fn mutation_queue_key(user: &User) -> String {
    format!("{MUTATION_QUEUES}{}", user_segment(user))
}

pub(crate) fn mutations_prefix(user: &User) -> String {
    format!("{MUTATIONS}{}/", user_segment(user))
}

pub(crate) fn mutation_key(user: &User, batch_id: BatchId) -> String {
    format!("{}{batch_id:010}", mutations_prefix(user))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DbTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl From<Timestamp> for DbTimestamp {
    fn from(value: Timestamp) -> Self {
        Self {
            seconds: value.seconds,
            nanos: value.nanos,
        }
    }
}

impl From<DbTimestamp> for Timestamp {
    fn from(value: DbTimestamp) -> Self {
        Timestamp::new(value.seconds, value.nanos)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbRemoteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    no_document: Option<DbNoDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unknown_document: Option<DbNoDocument>,
    #[serde(default)]
    has_committed_mutations: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbNoDocument {
    path: String,
    read_time: DbTimestamp,
}

/// Persisted form of a [`TargetData`]. Only listen targets are persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbTarget {
    pub target_id: TargetId,
    pub canonical_id: String,
    pub purpose: TargetPurpose,
    pub resume_token: String,
    pub snapshot_version: DbTimestamp,
    pub last_limbo_free_snapshot_version: DbTimestamp,
    pub query: JsonValue,
    #[serde(default)]
    pub limit_to_last: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub last_remote_snapshot_version: DbTimestamp,
}

/// Per-user queue metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    pub last_stream_token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbMutationBatch {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time: DbTimestamp,
    pub mutations: Vec<JsonValue>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DbMutationGlobals {
    pub highest_batch_id: BatchId,
}

pub(crate) fn to_bytes<T: Serialize>(record: &T) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|err| data_loss(format!("Failed to encode record: {err}")))
}

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes).map_err(|err| data_loss(format!("Corrupt local record: {err}")))
}

fn corrupt(err: FirestoreError) -> FirestoreError {
    data_loss(format!("Corrupt local record: {}", err.message()))
}

/// Converts between model types and their persisted records.
#[derive(Clone, Debug)]
pub(crate) struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn encode_remote_document(&self, document: &Document) -> FirestoreResult<Vec<u8>> {
        let read_time = DbTimestamp::from(document.version());
        let path = document.key().path().canonical_string();
        let mut record = DbRemoteDocument {
            document: None,
            no_document: None,
            unknown_document: None,
            has_committed_mutations: document.has_committed_mutations(),
        };
        match document.state() {
            DocumentState::Found => record.document = Some(self.remote.encode_document(document)),
            DocumentState::NoDocument => record.no_document = Some(DbNoDocument { path, read_time }),
            DocumentState::Unknown => {
                record.unknown_document = Some(DbNoDocument { path, read_time })
            }
        }
        to_bytes(&record)
    }

    pub fn decode_remote_document(&self, bytes: &[u8]) -> FirestoreResult<Document> {
        let record: DbRemoteDocument = from_bytes(bytes)?;
        let document = if let Some(document) = &record.document {
            self.remote.decode_document(document).map_err(corrupt)?
        } else if let Some(missing) = &record.no_document {
            let key = DocumentKey::from_string(&missing.path).map_err(corrupt)?;
            Document::no_document(key, missing.read_time.into())
        } else if let Some(unknown) = &record.unknown_document {
            let key = DocumentKey::from_string(&unknown.path).map_err(corrupt)?;
            return Ok(Document::unknown(key, unknown.read_time.into()));
        } else {
            return Err(data_loss("Remote document record without a document"));
        };
        Ok(if record.has_committed_mutations {
            document.with_committed_mutations()
        } else {
            document
        })
    }

    pub fn encode_target(&self, target: &TargetData) -> DbTarget {
        DbTarget {
            target_id: target.target_id,
            canonical_id: target.query.canonical_id(),
            purpose: target.purpose,
            resume_token: STANDARD.encode(&target.resume_token),
            snapshot_version: target.snapshot_version.into(),
            last_limbo_free_snapshot_version: target.last_limbo_free_snapshot_version.into(),
            query: encode_query_target(&self.remote, &target.query),
            limit_to_last: target.query.limit_type() == LimitType::Last,
        }
    }

    pub fn decode_target(&self, record: DbTarget) -> FirestoreResult<TargetData> {
        let mut query = decode_query_target(&self.remote, &record.query).map_err(corrupt)?;
        if record.limit_to_last {
            query = as_limit_to_last(query);
        }
        let resume_token = STANDARD
            .decode(&record.resume_token)
            .map_err(|err| data_loss(format!("Corrupt resume token: {err}")))?;
        let snapshot_version: SnapshotVersion = record.snapshot_version.into();
        Ok(TargetData::new(query, record.target_id, record.purpose)
            .with_resume_token(resume_token, snapshot_version)
            .with_last_limbo_free_snapshot_version(record.last_limbo_free_snapshot_version.into()))
    }

    pub fn encode_batch(&self, user: &User, batch: &MutationBatch) -> DbMutationBatch {
        DbMutationBatch {
            user_id: user.storage_key(),
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time.into(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        }
    }

    pub fn decode_batch(&self, record: DbMutationBatch) -> FirestoreResult<MutationBatch> {
        let mutations = record
            .mutations
            .iter()
            .map(|mutation| self.remote.decode_mutation(mutation).map_err(corrupt))
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(MutationBatch::new(
            record.batch_id,
            record.local_write_time.into(),
            mutations,
        ))
    }
}

pub(crate) fn encode_stream_token(token: &[u8]) -> String {
    STANDARD.encode(token)
}

pub(crate) fn decode_stream_token(token: &str) -> FirestoreResult<Vec<u8>> {
    STANDARD
        .decode(token)
        .map_err(|err| data_loss(format!("Corrupt stream token: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Direction, Query};
    use crate::firestore::model::{DatabaseId, Mutation, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("project")))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn ids_sort_numerically() {
        assert!(target_key(4) < target_key(10));
        assert!(mutation_key(&User::new("a"), 9) < mutation_key(&User::new("a"), 10));
        assert_eq!(mutations_prefix(&User::new("a/b")), "mutations/uid%3Aa%2Fb/");
        assert_eq!(mutation_queue_key(&User::unauthenticated()), "mutation_queues/anonymous");
    }

    #[test]
    fn committed_tombstones_keep_their_flag() {
        let tombstone = Document::no_document(key("rooms/a"), Timestamp::new(3, 0)).with_committed_mutations();
        let bytes = serializer().encode_remote_document(&tombstone).unwrap();
        assert_eq!(serializer().decode_remote_document(&bytes).unwrap(), tombstone);

        let unknown = Document::unknown(key("rooms/b"), Timestamp::new(4, 0));
        let bytes = serializer().encode_remote_document(&unknown).unwrap();
        assert_eq!(serializer().decode_remote_document(&bytes).unwrap(), unknown);
    }

    #[test]
    fn limit_to_last_targets_reload_with_their_canonical_id() {
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .unwrap()
            .order_by("n", Direction::Ascending)
            .unwrap()
            .limit_to_last(2);
        let target = TargetData::new(query.clone(), 6, TargetPurpose::Listen)
            .with_resume_token(vec![9], Timestamp::new(5, 0));
        let record = serializer().encode_target(&target);
        assert!(record.limit_to_last);
        let decoded = serializer().decode_target(record).unwrap();
        assert_eq!(decoded.query.canonical_id(), query.canonical_id());
        assert_eq!(decoded.resume_token, vec![9]);
        assert_eq!(decoded.snapshot_version, Timestamp::new(5, 0));
    }

    #[test]
    fn batches_reload_with_their_mutations() {
        let data: MapValue = [("n".to_string(), FirestoreValue::from_integer(1))]
            .into_iter()
            .collect();
        let batch = MutationBatch::new(
            3,
            Timestamp::new(7, 0),
            vec![Mutation::set(key("rooms/a"), data), Mutation::delete(key("rooms/b"))],
        );
        let record = serializer().encode_batch(&User::new("alice"), &batch);
        let bytes = to_bytes(&record).unwrap();
        let decoded = serializer().decode_batch(from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn garbage_records_are_data_loss() {
        let error = serializer().decode_remote_document(b"{}").unwrap_err();
        assert_eq!(error.code, crate::firestore::error::FirestoreErrorCode::DataLoss);
    }
}
