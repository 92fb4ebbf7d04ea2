use std::collections::BTreeSet;

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

pub type BatchId = i32;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    /// Checks the precondition against the current view of a document; `None` means no document.
    pub fn is_valid_for(&self, document: Option<&Document>) -> bool {
        let found = document.map(Document::is_found).unwrap_or(false);
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == found,
            Precondition::UpdateTime(version) => {
                found && document.map(Document::version) == Some(*version)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    NumericIncrement(FirestoreValue),
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Latency-compensated value computed before the server has seen the write.
    fn apply_locally(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::NumericIncrement(operand) => increment(previous, operand),
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(as_array(previous).union(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_array(as_array(previous).remove_all(elements).values().to_vec())
            }
        }
    }
}

fn as_array(value: Option<&FirestoreValue>) -> ArrayValue {
    match value.map(FirestoreValue::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => ArrayValue::default(),
    }
}

fn increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = previous.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(a)), ValueKind::Integer(b)) => {
            FirestoreValue::from_integer(a.saturating_add(*b))
        }
        (Some(ValueKind::Integer(a)), ValueKind::Double(b)) => FirestoreValue::from_double(*a as f64 + b),
        (Some(ValueKind::Double(a)), ValueKind::Integer(b)) => FirestoreValue::from_double(a + *b as f64),
        (Some(ValueKind::Double(a)), ValueKind::Double(b)) => FirestoreValue::from_double(a + b),
        _ => operand.clone(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { data: MapValue },
    /// Writes the masked fields; masked fields absent from `data` are deleted.
    Patch { data: MapValue, mask: Vec<FieldPath> },
    Delete,
    Transform { transforms: Vec<FieldTransform> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
}

impl Mutation {
    pub fn new(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
        }
    }

    pub fn set(key: DocumentKey, data: MapValue) -> Self {
        Self::new(key, MutationKind::Set { data }, Precondition::None)
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: Vec<FieldPath>) -> Self {
        Self::new(
            key,
            MutationKind::Patch { data, mask },
            Precondition::Exists(true),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None)
    }

    pub fn transform(key: DocumentKey, transforms: Vec<FieldTransform>) -> Self {
        Self::new(
            key,
            MutationKind::Transform { transforms },
            Precondition::Exists(true),
        )
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    /// Applies the mutation on top of the current local view of the document.
    pub fn apply_to_local_view(
        &self,
        base: Option<Document>,
        local_write_time: Timestamp,
    ) -> Option<Document> {
        if !self.precondition.is_valid_for(base.as_ref()) {
            return base;
        }
        let version = base.as_ref().map(Document::version).unwrap_or_default();
        let document = match &self.kind {
            MutationKind::Set { data } => Document::found(self.key.clone(), version, data.clone()),
            MutationKind::Patch { data, mask } => {
                let mut fields = existing_fields(base.as_ref());
                apply_mask(&mut fields, data, mask);
                Document::found(self.key.clone(), version, fields)
            }
            MutationKind::Delete => Document::no_document(self.key.clone(), version),
            MutationKind::Transform { transforms } => {
                let mut fields = existing_fields(base.as_ref());
                for transform in transforms {
                    let value = transform.apply_locally(fields.get(transform.field()), local_write_time);
                    fields.set(transform.field(), value);
                }
                Document::found(self.key.clone(), version, fields)
            }
        };
        Some(document.with_local_mutations())
    }

    /// Applies the server's verdict for this mutation to the remote document.
    pub fn apply_to_remote_document(&self, base: Option<Document>, result: &MutationResult) -> Document {
        let version = result.version;
        if !matches!(self.kind, MutationKind::Set { .. } | MutationKind::Delete)
            && !self.precondition.is_valid_for(base.as_ref())
        {
            // The server applied a write whose base we never saw.
            return Document::unknown(self.key.clone(), version);
        }
        let document = match &self.kind {
            MutationKind::Set { data } => Document::found(self.key.clone(), version, data.clone()),
            MutationKind::Patch { data, mask } => {
                let mut fields = existing_fields(base.as_ref());
                apply_mask(&mut fields, data, mask);
                Document::found(self.key.clone(), version, fields)
            }
            MutationKind::Delete => Document::no_document(self.key.clone(), version),
            MutationKind::Transform { transforms } => {
                let mut fields = existing_fields(base.as_ref());
                for (index, transform) in transforms.iter().enumerate() {
                    let value = match result.transform_results.get(index) {
                        Some(server_value) => server_value.clone(),
                        None => transform.apply_locally(fields.get(transform.field()), version),
                    };
                    fields.set(transform.field(), value);
                }
                Document::found(self.key.clone(), version, fields)
            }
        };
        document.with_committed_mutations()
    }
}

fn existing_fields(base: Option<&Document>) -> MapValue {
    base.filter(|document| document.is_found())
        .map(|document| document.data().clone())
        .unwrap_or_default()
}

fn apply_mask(fields: &mut MapValue, data: &MapValue, mask: &[FieldPath]) {
    for path in mask {
        match data.get(path) {
            Some(value) => fields.set(path, value.clone()),
            None => fields.delete(path),
        }
    }
}

/// Server outcome for one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn apply_to_local_view(&self, key: &DocumentKey, base: Option<Document>) -> Option<Document> {
        self.mutations
            .iter()
            .filter(|mutation| mutation.key() == key)
            .fold(base, |document, mutation| {
                mutation.apply_to_local_view(document, self.local_write_time)
            })
    }

    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        base: Option<Document>,
        results: &[MutationResult],
    ) -> Option<Document> {
        let mut document = base;
        for (mutation, result) in self.mutations.iter().zip(results.iter()) {
            if mutation.key() == key {
                document = Some(mutation.apply_to_remote_document(document, result));
            }
        }
        document
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
}
