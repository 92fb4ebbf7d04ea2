use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldPath, FieldTransform, Mutation, MutationKind,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts model types to and from the JSON form of the Firestore protos.
///
/// The same encoding is used on the wire and for documents and writes persisted by the local
/// store.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.canonical_name()
    }

    /// Resource name of the root under which documents live.
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            return self.documents_root();
        }
        format!("{}/{}", self.documents_root(), path.canonical_string())
    }

    pub fn decode_resource_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in {root}")))?;
        if relative.is_empty() {
            return Ok(ResourcePath::root());
        }
        let relative = relative
            .strip_prefix('/')
            .ok_or_else(|| invalid_argument(format!("Malformed resource name '{name}'")))?;
        ResourcePath::from_string(relative)
    }

    pub fn decode_document_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    /// Decodes a `fields` object. A missing object is a document without user fields.
    pub fn decode_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        match fields {
            Some(fields) => decode_fields_object(fields),
            None => Ok(MapValue::empty()),
        }
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(encode_timestamp(&version))
    }

    /// Absent versions decode to the zero version.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            None | Some(JsonValue::Null) => Ok(SnapshotVersion::min()),
            Some(JsonValue::String(text)) => parse_timestamp(text),
            Some(_) => Err(invalid_argument("Timestamps must be RFC 3339 strings")),
        }
    }

    /// Encodes a found document as the proto `Document` message.
    pub fn encode_document(&self, document: &Document) -> JsonValue {
        json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": encode_timestamp(&document.version()),
        })
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.decode_document_key(name)?;
        let fields = self.decode_fields(value.get("fields"))?;
        let version = self.decode_version(value.get("updateTime"))?;
        Ok(Document::found(key, version, fields))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        let name = self.document_name(mutation.key());
        match mutation.kind() {
            MutationKind::Set { data } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(data) }),
                );
            }
            MutationKind::Patch { data, mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(data) }),
                );
                let mask: Vec<String> = mask.iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), JsonValue::String(name));
            }
            MutationKind::Transform { transforms } => {
                write.insert(
                    "transform".to_string(),
                    json!({
                        "document": name,
                        "fieldTransforms": self.encode_field_transforms(transforms),
                    }),
                );
            }
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": encode_timestamp(version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            None => Precondition::None,
            Some(current) => {
                if let Some(exists) = current.get("exists").and_then(JsonValue::as_bool) {
                    Precondition::Exists(exists)
                } else if current.get("updateTime").is_some() {
                    Precondition::UpdateTime(self.decode_version(current.get("updateTime"))?)
                } else {
                    return Err(invalid_argument("Unknown precondition"));
                }
            }
        };

        if let Some(update) = value.get("update") {
            let document = self.decode_document(update)?;
            let key = document.key().clone();
            let data = document.data().clone();
            let kind = match value.get("updateMask") {
                Some(mask) => MutationKind::Patch {
                    data,
                    mask: decode_field_mask(mask)?,
                },
                None => MutationKind::Set { data },
            };
            return Ok(Mutation::new(key, kind, precondition));
        }

        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            let key = self.decode_document_key(name)?;
            return Ok(Mutation::new(key, MutationKind::Delete, precondition));
        }

        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Transform missing document"))?;
            let key = self.decode_document_key(name)?;
            let transforms = match transform.get("fieldTransforms").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_field_transform(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(Mutation::new(
                key,
                MutationKind::Transform { transforms },
                precondition,
            ));
        }

        Err(invalid_argument("Unknown write operation"))
    }

    /// Decodes one entry of `writeResults`. Results without `updateTime` take the commit version.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime") {
            Some(update_time) => self.decode_version(Some(update_time))?,
            None => commit_version,
        };
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    fn encode_field_transforms(&self, transforms: &[FieldTransform]) -> Vec<JsonValue> {
        transforms
            .iter()
            .map(|transform| {
                let field_path = transform.field().canonical_string();
                match transform.operation() {
                    TransformOperation::ServerTimestamp => json!({
                        "fieldPath": field_path,
                        "setToServerValue": "REQUEST_TIME"
                    }),
                    TransformOperation::ArrayUnion(elements) => json!({
                        "fieldPath": field_path,
                        "appendMissingElements": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        }
                    }),
                    TransformOperation::ArrayRemove(elements) => json!({
                        "fieldPath": field_path,
                        "removeAllFromArray": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        }
                    }),
                    TransformOperation::NumericIncrement(operand) => json!({
                        "fieldPath": field_path,
                        "increment": encode_value(operand)
                    }),
                }
            })
            .collect()
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform missing fieldPath"))?;
        let field = FieldPath::from_dot_separated(field)?;

        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else if let Some(elements) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(elements)?)
        } else if let Some(elements) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(elements)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn decode_bytes(value: &str) -> FirestoreResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
}

fn decode_field_mask(mask: &JsonValue) -> FirestoreResult<Vec<FieldPath>> {
    match mask.get("fieldPaths").and_then(JsonValue::as_array) {
        Some(paths) => paths
            .iter()
            .map(|path| {
                path.as_str()
                    .ok_or_else(|| invalid_argument("fieldPaths entries must be strings"))
                    .and_then(FieldPath::from_dot_separated)
            })
            .collect(),
        None => Ok(Vec::new()),
    }
}

fn decode_array_values(value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
    match value.get("values").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            // JSON has no NaN or infinity literals.
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else if double.is_nan() {
                json!({ "doubleValue": "NaN" })
            } else if *double > 0.0 {
                json!({ "doubleValue": "Infinity" })
            } else {
                json!({ "doubleValue": "-Infinity" })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_fields_object(value: &JsonValue) -> FirestoreResult<MapValue> {
    let fields_object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(FirestoreValue::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = match map_value.get("fields") {
            Some(fields) => decode_fields_object(fields)?,
            None => MapValue::empty(),
        };
        return Ok(FirestoreValue::from(map));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

pub fn encode_timestamp(timestamp: &Timestamp) -> String {
    DateTime::<Utc>::from_timestamp(timestamp.seconds, timestamp.nanos as u32)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn document_names_use_database_root() {
        let serializer = serializer();
        let name = serializer.document_name(&key("rooms/a"));
        assert_eq!(name, "projects/project/databases/(default)/documents/rooms/a");
        assert_eq!(serializer.decode_document_key(&name).unwrap(), key("rooms/a"));
        assert!(serializer
            .decode_document_key("projects/other/databases/(default)/documents/rooms/a")
            .is_err());
    }

    #[test]
    fn decodes_documents_with_versions() {
        let document = serializer()
            .decode_document(&json!({
                "name": "projects/project/databases/(default)/documents/rooms/a",
                "fields": {
                    "name": { "stringValue": "Ada" },
                    "age": { "integerValue": "42" },
                    "tags": { "arrayValue": { "values": [{ "booleanValue": true }] } }
                },
                "updateTime": "2024-01-02T03:04:05.000000006Z"
            }))
            .unwrap();
        assert!(document.is_found());
        assert_eq!(document.version(), Timestamp::new(1_704_164_645, 6));
        assert_eq!(
            document.field(&FieldPath::from_dot_separated("age").unwrap()),
            Some(&FirestoreValue::from_integer(42))
        );
    }

    #[test]
    fn encodes_patch_with_mask_and_precondition() {
        let data: MapValue = [("title".to_string(), FirestoreValue::from_string("x"))]
            .into_iter()
            .collect();
        let mutation = Mutation::patch(
            key("rooms/a"),
            data,
            vec![FieldPath::from_dot_separated("title").unwrap()],
        );
        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["title"]));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(serializer().decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn decodes_transforms_and_deletes() {
        let serializer = serializer();
        let transform = Mutation::transform(
            key("rooms/a"),
            vec![FieldTransform::new(
                FieldPath::from_dot_separated("count").unwrap(),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            )],
        );
        let delete = Mutation::delete(key("rooms/b"));
        for mutation in [transform, delete] {
            let decoded = serializer.decode_mutation(&serializer.encode_mutation(&mutation)).unwrap();
            assert_eq!(decoded, mutation);
        }
        assert!(serializer.decode_mutation(&json!({ "verify": {} })).is_err());
    }

    #[test]
    fn write_results_default_to_commit_version() {
        let commit = Timestamp::new(10, 0);
        let result = serializer()
            .decode_write_result(
                &json!({ "transformResults": [{ "integerValue": "3" }] }),
                commit,
            )
            .unwrap();
        assert_eq!(result.version, commit);
        assert_eq!(result.transform_results, vec![FirestoreValue::from_integer(3)]);
    }

    #[test]
    fn non_finite_doubles_survive_json() {
        let encoded = encode_value(&FirestoreValue::from_double(f64::INFINITY));
        assert_eq!(encoded, json!({ "doubleValue": "Infinity" }));
        let decoded = decode_value(&json!({ "doubleValue": "NaN" })).unwrap();
        assert!(matches!(decoded.kind(), ValueKind::Double(value) if value.is_nan()));
    }
}
