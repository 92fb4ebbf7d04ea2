use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        let operator = match value {
            "LESS_THAN" => FilterOperator::LessThan,
            "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
            "EQUAL" => FilterOperator::Equal,
            "NOT_EQUAL" => FilterOperator::NotEqual,
            "GREATER_THAN" => FilterOperator::GreaterThan,
            "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
            "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
            "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
            "IN" => FilterOperator::In,
            "NOT_IN" => FilterOperator::NotIn,
            _ => return None,
        };
        Some(operator)
    }

    fn symbol(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let needs_array = matches!(
            operator,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && !matches!(value.kind(), ValueKind::Array(_)) {
            return Err(invalid_argument(format!(
                "'{}' filters require an array value",
                operator.symbol()
            )));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        match field_value(document, &self.field) {
            Some(value) => self.matches_value(&value),
            None => false,
        }
    }

    fn matches_value(&self, value: &FirestoreValue) -> bool {
        let same_type = value.type_order() == self.value.type_order();
        let ordering = compare_values(value, &self.value);
        match self.operator {
            FilterOperator::Equal => same_type && ordering == Ordering::Equal,
            FilterOperator::NotEqual => !value.is_null() && ordering != Ordering::Equal,
            FilterOperator::LessThan => same_type && ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => same_type && ordering != Ordering::Greater,
            FilterOperator::GreaterThan => same_type && ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => same_type && ordering != Ordering::Less,
            FilterOperator::ArrayContains => match value.kind() {
                ValueKind::Array(array) => array.contains(&self.value),
                _ => false,
            },
            FilterOperator::ArrayContainsAny => match (value.kind(), self.value.kind()) {
                (ValueKind::Array(array), ValueKind::Array(needles)) => {
                    needles.values().iter().any(|needle| array.contains(needle))
                }
                _ => false,
            },
            FilterOperator::In => match self.value.kind() {
                ValueKind::Array(candidates) => candidates.contains(value),
                _ => false,
            },
            FilterOperator::NotIn => match self.value.kind() {
                ValueKind::Array(candidates) => !value.is_null() && !candidates.contains(value),
                _ => false,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// Collection query (or single-document lookup) evaluated against cached documents.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    pub fn collection(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Queries must reference a collection (odd number of path segments), got '{path}'"
            )));
        }
        Ok(Self::at(path))
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at(key.path().clone())
    }

    pub(crate) fn at(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filter(
        self,
        field: &str,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        Ok(self.with_filter(FieldFilter::new(field, operator, value)?))
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn order_by(self, field: &str, direction: Direction) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        Ok(self.with_order_by(OrderBy::new(field, direction)))
    }

    pub fn with_limit(mut self, limit: Option<u32>, limit_type: LimitType) -> Self {
        self.limit = limit;
        self.limit_type = limit_type;
        self
    }

    pub fn limit_to_first(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::First)
    }

    pub fn limit_to_last(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::Last)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.filters.is_empty()
    }

    /// Explicit ordering plus the implicit inequality and key orderings every query carries.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();

        let inequality = self
            .filters
            .iter()
            .find(|filter| filter.operator().is_inequality())
            .map(|filter| filter.field().clone());
        if let Some(field) = inequality {
            if !order_by.iter().any(|order| order.field() == &field) {
                order_by.insert(0, OrderBy::new(field, Direction::Ascending));
            }
        }

        if !order_by.iter().any(|order| order.field().is_document_id()) {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches(&self, document: &Document) -> bool {
        if !document.is_found() {
            return false;
        }
        let path = document.key().path();
        let in_scope = if self.is_document_query() {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        };
        in_scope
            && self
                .explicit_order_by
                .iter()
                .all(|order| order.field().is_document_id() || document.field(order.field()).is_some())
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    /// Sort order of the query's results; the document key breaks every tie.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field().is_document_id() {
                left.key().cmp(right.key())
            } else {
                let null = FirestoreValue::null();
                let l = left.field(order.field()).unwrap_or(&null);
                let r = right.field(order.field()).unwrap_or(&null);
                compare_values(l, r)
            };
            let ordering = match order.direction() {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Identifies queries that share a target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if !self.filters.is_empty() {
            id.push_str("|f:");
            for filter in &self.filters {
                let _ = write!(
                    id,
                    "{}{}{}",
                    filter.field(),
                    filter.operator().symbol(),
                    canonical_value(filter.value())
                );
            }
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            let suffix = match order.direction() {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            };
            let _ = write!(id, "{}{}", order.field(), suffix);
        }
        if let Some(limit) = self.limit {
            let kind = match self.limit_type {
                LimitType::First => 'f',
                LimitType::Last => 'l',
            };
            let _ = write!(id, "|l:{limit}|lt:{kind}");
        }
        id
    }
}

fn field_value(document: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(value) => value.to_base64(),
        ValueKind::Reference(value) => value.clone(),
        ValueKind::Array(array) => {
            let items: Vec<String> = array.values().iter().map(canonical_value).collect();
            format!("[{}]", items.join(","))
        }
        ValueKind::Map(map) => {
            let items: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_value(value)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}
