use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// The document exists with the contained fields.
    Found,
    /// Known to be absent at `version`.
    NoDocument,
    /// A committed write touched the document but its contents are not known locally.
    Unknown,
}

/// Cached or locally computed state of a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self {
            key,
            version,
            data,
            state: DocumentState::Found,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            data: MapValue::empty(),
            state: DocumentState::NoDocument,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            data: MapValue::empty(),
            state: DocumentState::Unknown,
            has_local_mutations: false,
            has_committed_mutations: true,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn is_found(&self) -> bool {
        self.state == DocumentState::Found
    }

    pub fn is_no_document(&self) -> bool {
        self.state == DocumentState::NoDocument
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.has_local_mutations = true;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub(crate) fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    #[test]
    fn flags_feed_pending_writes() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let doc = Document::found(key.clone(), Timestamp::new(1, 0), MapValue::empty());
        assert!(doc.is_found());
        assert!(!doc.has_pending_writes());
        assert!(doc.clone().with_local_mutations().has_pending_writes());
        assert!(Document::unknown(key, Timestamp::new(2, 0)).has_committed_mutations());
    }
}
