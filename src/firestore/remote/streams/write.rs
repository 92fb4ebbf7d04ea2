use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::serializer::{decode_bytes, encode_bytes, JsonProtoSerializer};

/// Decoded write-stream response. The handshake response carries no results.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

pub fn encode_handshake(serializer: &JsonProtoSerializer) -> JsonValue {
    json!({ "database": serializer.database_name() })
}

pub fn encode_write_request(
    serializer: &JsonProtoSerializer,
    stream_token: &[u8],
    mutations: &[Mutation],
) -> JsonValue {
    let writes: Vec<_> = mutations
        .iter()
        .map(|mutation| serializer.encode_mutation(mutation))
        .collect();
    json!({
        "streamToken": encode_bytes(stream_token),
        "writes": writes,
    })
}

pub fn decode_write_response(
    serializer: &JsonProtoSerializer,
    payload: &[u8],
) -> FirestoreResult<WriteResponse> {
    let value: JsonValue = serde_json::from_slice(payload)
        .map_err(|err| internal_error(format!("Failed to decode write response: {err}")))?;
    let stream_token = value
        .get("streamToken")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Write response missing streamToken"))
        .and_then(decode_bytes)?;
    let commit_version = serializer.decode_version(value.get("commitTime"))?;
    let write_results = match value.get("writeResults").and_then(JsonValue::as_array) {
        Some(entries) => entries
            .iter()
            .map(|entry| serializer.decode_write_result(entry, commit_version))
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(WriteResponse {
        stream_token,
        commit_version,
        write_results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, DocumentKey, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    #[test]
    fn write_requests_carry_the_latest_token() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let data: MapValue = [("n".to_string(), FirestoreValue::from_integer(1))]
            .into_iter()
            .collect();
        let request = encode_write_request(&serializer(), &[7, 7], &[Mutation::set(key, data)]);
        assert_eq!(request["streamToken"], json!("Bwc="));
        assert_eq!(
            request["writes"][0]["update"]["name"],
            json!("projects/project/databases/(default)/documents/rooms/a")
        );
    }

    #[test]
    fn results_default_to_the_commit_time() {
        let payload = serde_json::to_vec(&json!({
            "streamToken": "AQ==",
            "commitTime": "1970-01-01T00:00:10Z",
            "writeResults": [{}, { "updateTime": "1970-01-01T00:00:04Z" }]
        }))
        .unwrap();
        let response = decode_write_response(&serializer(), &payload).unwrap();
        assert_eq!(response.stream_token, vec![1]);
        assert_eq!(response.commit_version, Timestamp::new(10, 0));
        assert_eq!(response.write_results[0].version, Timestamp::new(10, 0));
        assert_eq!(response.write_results[1].version, Timestamp::new(4, 0));
    }

    #[test]
    fn handshake_response_has_no_results() {
        let payload = br#"{"streamToken":"AA=="}"#;
        let response = decode_write_response(&serializer(), payload).unwrap();
        assert!(response.write_results.is_empty());
        assert!(response.commit_version.is_min());
        assert!(decode_write_response(&serializer(), b"{}").is_err());
    }
}
