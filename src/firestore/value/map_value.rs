use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves a nested field; `None` when any segment is missing or not a map.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating or replacing intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_segments(&mut self.fields, path.segments());
    }
}

impl FromIterator<(String, FirestoreValue)> for MapValue {
    fn from_iter<T: IntoIterator<Item = (String, FirestoreValue)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn set_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child = match fields.remove(first).map(|existing| existing.kind().clone()) {
        Some(ValueKind::Map(map)) => map.fields,
        _ => BTreeMap::new(),
    };
    set_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(existing) = fields.get(first) {
        if let ValueKind::Map(map) = existing.kind() {
            let mut child = map.fields.clone();
            delete_segments(&mut child, rest);
            fields.insert(first.clone(), FirestoreValue::from_map(child));
        }
    }
}
