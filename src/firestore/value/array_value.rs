use std::cmp::Ordering;

use crate::firestore::value::{compare_values, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    /// Membership using query equality, so `1` and `1.0` match.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values
            .iter()
            .any(|candidate| compare_values(candidate, needle) == Ordering::Equal)
    }

    pub fn union(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !ArrayValue::new(values.clone()).contains(element) {
                values.push(element.clone());
            }
        }
        Self { values }
    }

    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        let removal = ArrayValue::new(elements.to_vec());
        Self {
            values: self
                .values
                .iter()
                .filter(|value| !removal.contains(value))
                .cloned()
                .collect(),
        }
    }
}
