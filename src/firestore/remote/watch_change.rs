use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    internal_error, invalid_argument, map_grpc_status, FirestoreError, FirestoreResult,
};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// One decoded message of the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "all targets".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// `documentChange`, `documentDelete` and `documentRemove` messages.
///
/// A delete carries a `NoDocument` at its read time; a remove carries no document at all.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub filter: ExistenceFilter,
}

/// Server-declared count of documents matching a target, optionally with a bloom filter of
/// their names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Undecoded bloom filter as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBloomFilter {
    #[serde(default)]
    bits: WireBitSequence,
    #[serde(default)]
    hash_count: i32,
}

#[derive(Debug, Default, Deserialize)]
struct WireBitSequence {
    #[serde(default)]
    bitmap: String,
    #[serde(default)]
    padding: i32,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => decode_bytes(token)?,
        None => Vec::new(),
    };

    let read_time = serializer.decode_version(value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            map_grpc_status(
                cause.code,
                cause
                    .message
                    .unwrap_or_else(|| "target rejected by the backend".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let updated_target_ids = numeric_array(value.get("targetIds"));
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids,
        removed_target_ids,
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.decode_document_key(name)?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        document: Some(Document::no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.decode_document_key(name)?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        key,
        document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    // A malformed bloom payload only costs the optimization; the count still applies.
    let unchanged_names = value
        .get("unchangedNames")
        .and_then(|names| serde_json::from_value::<WireBloomFilter>(names.clone()).ok())
        .map(|bloom| BloomFilterPayload {
            bitmap: bloom.bits.bitmap,
            padding: bloom.bits.padding,
            hash_count: bloom.hash_count,
        });

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "NO_CHANGE" => TargetChangeState::NoChange,
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::remote::serializer::encode_bytes;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": encode_bytes(&[1u8, 2, 3]),
                "targetChangeType": "CURRENT",
                "readTime": "1970-01-01T00:00:05Z"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert_eq!(change.read_time, Timestamp::new(5, 0));
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn deletes_carry_tombstones_and_removes_do_not() {
        let name = "projects/project/databases/(default)/documents/rooms/a";
        let delete = json!({
            "documentDelete": { "document": name, "readTime": "1970-01-01T00:00:09Z", "removedTargetIds": [2] }
        });
        let Some(WatchChange::DocumentChange(delete)) =
            decode_watch_change(&serializer(), &delete).unwrap()
        else {
            panic!("expected document change");
        };
        let tombstone = delete.document.unwrap();
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), Timestamp::new(9, 0));

        let remove = json!({ "documentRemove": { "document": name, "removedTargetIds": [2] } });
        let Some(WatchChange::DocumentChange(remove)) =
            decode_watch_change(&serializer(), &remove).unwrap()
        else {
            panic!("expected document change");
        };
        assert!(remove.document.is_none());
        assert_eq!(remove.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_existence_filter_with_bloom() {
        let filter = json!({
            "filter": {
                "targetId": 2,
                "count": 1,
                "unchangedNames": {
                    "bits": { "bitmap": "l5nsdAc=", "padding": 3 },
                    "hashCount": 13
                }
            }
        });
        let Some(WatchChange::ExistenceFilter(change)) =
            decode_watch_change(&serializer(), &filter).unwrap()
        else {
            panic!("expected existence filter");
        };
        assert_eq!(change.target_id, 2);
        assert_eq!(change.filter.count, 1);
        let bloom = change.filter.unchanged_names.unwrap();
        assert_eq!(bloom.padding, 3);
        assert_eq!(bloom.hash_count, 13);
        assert_eq!(decode_bytes(&bloom.bitmap).unwrap(), vec![151, 153, 236, 116, 7]);
    }

    #[test]
    fn unknown_messages_are_skipped() {
        assert!(decode_watch_change(&serializer(), &json!({ "heartbeat": {} }))
            .unwrap()
            .is_none());
    }
}
