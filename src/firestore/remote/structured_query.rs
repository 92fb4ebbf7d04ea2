use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::{
    Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// Encodes the target body of an `addTarget` request: `documents` for single-document lookups,
/// `query` otherwise.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, query: &Query) -> JsonValue {
    if query.is_document_query() {
        return json!({
            "documents": { "documents": [serializer.resource_name(query.path())] }
        });
    }
    json!({
        "query": {
            "parent": serializer.resource_name(&query.path().without_last()),
            "structuredQuery": encode_structured_query(serializer, query),
        }
    })
}

pub(crate) fn decode_query_target(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Query> {
    if let Some(documents) = value.get("documents") {
        let name = documents
            .get("documents")
            .and_then(JsonValue::as_array)
            .and_then(|names| names.first())
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document target without a document name"))?;
        return Ok(Query::document(&serializer.decode_document_key(name)?));
    }

    let query = value
        .get("query")
        .ok_or_else(|| invalid_argument("Target has neither query nor documents"))?;
    let parent = query
        .get("parent")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Query target missing parent"))?;
    let structured = query
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("Query target missing structuredQuery"))?;
    decode_structured_query(serializer, parent, structured)
}

fn encode_structured_query(serializer: &JsonProtoSerializer, query: &Query) -> JsonValue {
    let mut structured = serde_json::Map::new();
    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": query.path().last_segment().unwrap_or_default() }]),
    );

    if !query.filters().is_empty() {
        structured.insert("where".to_string(), encode_filters(serializer, query.filters()));
    }

    // Limit-to-last queries run reversed on the backend.
    let reverse = query.limit_type() == LimitType::Last;
    let orders: Vec<_> = query
        .normalized_order_by()
        .iter()
        .map(|order| {
            let direction = match (order.direction(), reverse) {
                (Direction::Ascending, false) | (Direction::Descending, true) => {
                    Direction::Ascending
                }
                _ => Direction::Descending,
            };
            json!({
                "field": { "fieldPath": order.field().canonical_string() },
                "direction": direction.as_str(),
            })
        })
        .collect();
    structured.insert("orderBy".to_string(), JsonValue::Array(orders));

    if let Some(limit) = query.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }
    JsonValue::Object(structured)
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[FieldFilter]) -> JsonValue {
    if filters.len() == 1 {
        return encode_field_filter(serializer, &filters[0]);
    }

    let nested: Vec<_> = filters
        .iter()
        .map(|filter| encode_field_filter(serializer, filter))
        .collect();

    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": nested
        }
    })
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field().canonical_string() },
            "op": filter.operator().as_str(),
            "value": serializer.encode_value(filter.value())
        }
    })
}

fn decode_structured_query(
    serializer: &JsonProtoSerializer,
    parent: &str,
    structured: &JsonValue,
) -> FirestoreResult<Query> {
    let collection_id = structured
        .get("from")
        .and_then(JsonValue::as_array)
        .and_then(|from| from.first())
        .and_then(|entry| entry.get("collectionId"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Structured query missing collectionId"))?;
    let path = serializer.decode_resource_path(parent)?.child(collection_id);
    let mut query = Query::collection(path)?;

    if let Some(filter) = structured.get("where") {
        for decoded in decode_filters(serializer, filter)? {
            query = query.with_filter(decoded);
        }
    }

    let mut orders = Vec::new();
    if let Some(entries) = structured.get("orderBy").and_then(JsonValue::as_array) {
        for entry in entries {
            let field = entry
                .get("field")
                .and_then(|field| field.get("fieldPath"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("orderBy entry missing fieldPath"))?;
            let direction = match entry.get("direction").and_then(JsonValue::as_str) {
                Some("DESCENDING") => Direction::Descending,
                _ => Direction::Ascending,
            };
            orders.push(OrderBy::new(FieldPath::from_dot_separated(field)?, direction));
        }
    }
    for order in orders {
        query = query.with_order_by(order);
    }

    let limit = match structured.get("limit") {
        Some(JsonValue::Number(number)) => number.as_u64(),
        Some(JsonValue::Object(wrapper)) => wrapper.get("value").and_then(JsonValue::as_u64),
        _ => None,
    };
    let limit = limit.map(|value| value.min(u64::from(u32::MAX)) as u32);
    Ok(query.with_limit(limit, LimitType::First))
}

fn decode_filters(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Vec<FieldFilter>> {
    if let Some(composite) = value.get("compositeFilter") {
        let mut filters = Vec::new();
        if let Some(entries) = composite.get("filters").and_then(JsonValue::as_array) {
            for entry in entries {
                filters.extend(decode_filters(serializer, entry)?);
            }
        }
        return Ok(filters);
    }

    let field_filter = value
        .get("fieldFilter")
        .ok_or_else(|| invalid_argument("Unsupported filter"))?;
    let field = field_filter
        .get("field")
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("fieldFilter missing fieldPath"))?;
    let operator = field_filter
        .get("op")
        .and_then(JsonValue::as_str)
        .and_then(FilterOperator::from_wire)
        .ok_or_else(|| invalid_argument("fieldFilter has an unknown operator"))?;
    let value = field_filter
        .get("value")
        .ok_or_else(|| invalid_argument("fieldFilter missing value"))?;
    Ok(vec![FieldFilter::new(
        FieldPath::from_dot_separated(field)?,
        operator,
        serializer.decode_value(value)?,
    )?])
}

/// Reverses the backend ordering of a persisted limit-to-last target.
pub(crate) fn as_limit_to_last(query: Query) -> Query {
    let mut reversed = Query::at(query.path().clone());
    for filter in query.filters() {
        reversed = reversed.with_filter(filter.clone());
    }
    for order in query.explicit_order_by() {
        let direction = match order.direction() {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        };
        reversed = reversed.with_order_by(OrderBy::new(order.field().clone(), direction));
    }
    reversed.with_limit(query.limit(), LimitType::Last)
}

/// Name of the document a single-document target watches.
pub(crate) fn document_target_key(query: &Query) -> Option<DocumentKey> {
    if query.is_document_query() {
        DocumentKey::from_path(query.path().clone()).ok()
    } else {
        None
    }
}
