use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    /// Rank of the value's type in the cross-type sort order used by queries.
    pub fn type_order(&self) -> u8 {
        match self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::String(_) => 4,
            ValueKind::Bytes(_) => 5,
            ValueKind::Reference(_) => 6,
            ValueKind::Array(_) => 8,
            ValueKind::Map(_) => 9,
        }
    }
}

impl From<MapValue> for FirestoreValue {
    fn from(value: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(value),
        }
    }
}

/// Total order across all value types: null < bool < number < timestamp < string < bytes <
/// reference < array < map. Integers and doubles compare numerically and NaN sorts first.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = left.type_order().cmp(&right.type_order());
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.cmp(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}
