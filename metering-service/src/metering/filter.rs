//! Meter filter interpreter.

use crate::models::{
    Event, Filter, FilterClause, FilterConjunction, FilterNode, FilterOperator, FilterValue,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

const METADATA_PREFIX: &str = "metadata.";

/// Scalar read off an event.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Owned(String),
    Number(Decimal),
    Boolean(bool),
}

impl FieldValue<'_> {
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(*s),
            FieldValue::Owned(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Stable key for distinct counting.
    pub fn distinct_key(&self) -> String {
        match self {
            FieldValue::Text(s) => format!("s:{}", s),
            FieldValue::Owned(s) => format!("s:{}", s),
            FieldValue::Number(n) => format!("n:{}", n.normalize()),
            FieldValue::Boolean(b) => format!("b:{}", b),
        }
    }
}

pub(crate) fn json_number_to_decimal(n: &serde_json::Number) -> Option<Decimal> {
    let repr = n.to_string();
    Decimal::from_str(&repr)
        .or_else(|_| Decimal::from_scientific(&repr))
        .ok()
}

fn metadata_value(value: &Value) -> Option<FieldValue<'_>> {
    match value {
        Value::String(s) => Some(FieldValue::Text(s)),
        Value::Number(n) => json_number_to_decimal(n).map(FieldValue::Number),
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        _ => None,
    }
}

/// Resolve `property` on `event`.
///
/// Direct fields win; `metadata.<key>` and any other bare key are read from
/// the event metadata. `None` when the field is absent.
pub fn lookup<'a>(event: &'a Event, property: &str) -> Option<FieldValue<'a>> {
    if let Some(key) = property.strip_prefix(METADATA_PREFIX) {
        return event.user_metadata.get(key).and_then(metadata_value);
    }
    match property {
        "name" => Some(FieldValue::Text(&event.name)),
        "external_id" => event.external_id.as_deref().map(FieldValue::Text),
        "external_customer_id" => event.external_customer_id.as_deref().map(FieldValue::Text),
        "customer_id" => event.customer_id.map(|id| FieldValue::Owned(id.to_string())),
        "organization_id" => Some(FieldValue::Owned(event.organization_id.to_string())),
        key => event.user_metadata.get(key).and_then(metadata_value),
    }
}

fn compare(field: &FieldValue<'_>, literal: &FilterValue) -> Option<Ordering> {
    match literal {
        FilterValue::Number(expected) => field.as_number().map(|n| n.cmp(expected)),
        FilterValue::Text(expected) => field.as_text().map(|s| s.cmp(expected.as_str())),
        FilterValue::Boolean(expected) => match field {
            FieldValue::Boolean(b) => Some(b.cmp(expected)),
            _ => None,
        },
    }
}

/// Evaluate one clause. A missing field or a type mismatch never matches,
/// whatever the operator.
pub fn clause_matches(event: &Event, clause: &FilterClause) -> bool {
    let Some(field) = lookup(event, &clause.property) else {
        return false;
    };
    let Some(ordering) = compare(&field, &clause.value) else {
        return false;
    };
    if matches!(clause.value, FilterValue::Boolean(_))
        && !matches!(clause.operator, FilterOperator::Eq | FilterOperator::Ne)
    {
        return false;
    }
    match clause.operator {
        FilterOperator::Eq => ordering == Ordering::Equal,
        FilterOperator::Ne => ordering != Ordering::Equal,
        FilterOperator::Gt => ordering == Ordering::Greater,
        FilterOperator::Gte => ordering != Ordering::Less,
        FilterOperator::Lt => ordering == Ordering::Less,
        FilterOperator::Lte => ordering != Ordering::Greater,
    }
}

/// Evaluate a filter. An empty `and` group matches everything, an empty `or`
/// group nothing.
pub fn matches(event: &Event, filter: &Filter) -> bool {
    let mut nodes = filter.clauses.iter().map(|node| match node {
        FilterNode::Clause(clause) => clause_matches(event, clause),
        FilterNode::Group(group) => matches(event, group),
    });
    match filter.conjunction {
        FilterConjunction::And => nodes.all(|m| m),
        FilterConjunction::Or => nodes.any(|m| m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(metadata: Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Some(Uuid::new_v4()),
            external_customer_id: Some("cus_42".into()),
            name: "api.call".into(),
            timestamp: Utc::now(),
            ingested_at: Utc::now(),
            external_id: None,
            user_metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn direct_fields_and_metadata() {
        let e = event(json!({"region": "eu", "tokens": 120}));
        assert!(clause_matches(
            &e,
            &FilterClause::new("name", FilterOperator::Eq, "api.call")
        ));
        assert!(clause_matches(
            &e,
            &FilterClause::new("metadata.region", FilterOperator::Eq, "eu")
        ));
        assert!(clause_matches(
            &e,
            &FilterClause::new("tokens", FilterOperator::Gt, 100)
        ));
        assert!(clause_matches(
            &e,
            &FilterClause::new("external_customer_id", FilterOperator::Eq, "cus_42")
        ));
    }

    #[test]
    fn missing_key_never_matches() {
        let e = event(json!({}));
        for op in [
            FilterOperator::Eq,
            FilterOperator::Ne,
            FilterOperator::Gt,
            FilterOperator::Lte,
        ] {
            assert!(!clause_matches(
                &e,
                &FilterClause::new("metadata.region", op, "eu")
            ));
        }
        assert!(!clause_matches(
            &e,
            &FilterClause::new("external_id", FilterOperator::Ne, "x")
        ));
    }

    #[test]
    fn type_mismatch_never_matches() {
        let e = event(json!({"tokens": "120"}));
        assert!(!clause_matches(
            &e,
            &FilterClause::new("metadata.tokens", FilterOperator::Eq, 120)
        ));
        assert!(!clause_matches(
            &e,
            &FilterClause::new("metadata.tokens", FilterOperator::Ne, 120)
        ));
    }

    #[test]
    fn nested_groups_combine() {
        let e = event(json!({"region": "us", "tier": "pro"}));
        let filter = Filter::and(vec![FilterClause::new(
            "name",
            FilterOperator::Eq,
            "api.call",
        )])
        .with_group(Filter::or(vec![
            FilterClause::new("metadata.region", FilterOperator::Eq, "eu"),
            FilterClause::new("metadata.region", FilterOperator::Eq, "us"),
        ]));
        assert!(matches(&e, &filter));

        let other = event(json!({"region": "apac"}));
        assert!(!matches(&other, &filter));
    }

    #[test]
    fn empty_groups() {
        let e = event(json!({}));
        assert!(matches(&e, &Filter::and(vec![])));
        assert!(!matches(&e, &Filter::or(vec![])));
    }
}
