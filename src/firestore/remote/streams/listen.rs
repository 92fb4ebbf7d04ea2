use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::TargetId;
use crate::firestore::remote::serializer::{encode_bytes, JsonProtoSerializer};
use crate::firestore::remote::structured_query::encode_query_target;
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};

/// `addTarget` request for `target`, resuming from its token or snapshot version.
pub fn encode_watch_request(serializer: &JsonProtoSerializer, target: &TargetData) -> JsonValue {
    let mut add_target = match encode_query_target(serializer, &target.query) {
        JsonValue::Object(fields) => fields,
        _ => serde_json::Map::new(),
    };
    add_target.insert("targetId".to_string(), json!(target.target_id));

    if !target.resume_token.is_empty() {
        add_target.insert(
            "resumeToken".to_string(),
            json!(encode_bytes(&target.resume_token)),
        );
    } else if !target.snapshot_version.is_min() {
        add_target.insert(
            "readTime".to_string(),
            serializer.encode_version(target.snapshot_version),
        );
    }
    let resuming = !target.resume_token.is_empty() || !target.snapshot_version.is_min();
    if let (true, Some(count)) = (resuming, target.expected_count) {
        add_target.insert("expectedCount".to_string(), json!(count));
    }

    let mut request = json!({
        "database": serializer.database_name(),
        "addTarget": JsonValue::Object(add_target),
    });
    if let Some(label) = target.purpose.listen_label() {
        request["labels"] = json!({ "goog-listen-tags": label });
    }
    request
}

pub fn encode_unwatch_request(serializer: &JsonProtoSerializer, target_id: TargetId) -> JsonValue {
    json!({
        "database": serializer.database_name(),
        "removeTarget": target_id,
    })
}

/// Parses one listen-stream payload. Unknown message kinds decode to `None`.
pub fn decode_listen_response(
    serializer: &JsonProtoSerializer,
    payload: &[u8],
) -> FirestoreResult<Option<WatchChange>> {
    let value: JsonValue = serde_json::from_slice(payload)
        .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))?;
    decode_watch_change(serializer, &value)
}
