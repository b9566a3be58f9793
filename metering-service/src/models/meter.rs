//! Meter model: a named filter plus aggregation over the event stream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterConjunction {
    #[default]
    And,
    Or,
}

/// Literal on the right-hand side of a clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum FilterValue {
    Text(String),
    Number(Decimal),
    Boolean(bool),
}

impl From<FilterValue> for Value {
    fn from(value: FilterValue) -> Self {
        match value {
            FilterValue::Text(s) => Value::String(s),
            FilterValue::Boolean(b) => Value::Bool(b),
            FilterValue::Number(n) => serde_json::Number::from_str(&n.normalize().to_string())
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(n.to_string())),
        }
    }
}

impl TryFrom<Value> for FilterValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(FilterValue::Text(s)),
            Value::Bool(b) => Ok(FilterValue::Boolean(b)),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(FilterValue::Number)
                .map_err(|e| format!("unsupported numeric literal {}: {}", n, e)),
            other => Err(format!("unsupported filter literal: {}", other)),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        FilterValue::Number(Decimal::from(n))
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        FilterValue::Boolean(b)
    }
}

/// `property <operator> value`. The property is a direct event field
/// (`name`, `external_id`, ...) or a `metadata.<key>` path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub property: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl FilterClause {
    pub fn new(
        property: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<FilterValue>,
    ) -> Self {
        Self {
            property: property.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Clause(FilterClause),
    Group(Filter),
}

/// Boolean combination of clauses and nested groups.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    #[serde(default)]
    pub conjunction: FilterConjunction,
    #[serde(default)]
    pub clauses: Vec<FilterNode>,
}

impl Filter {
    pub fn and(clauses: Vec<FilterClause>) -> Self {
        Self {
            conjunction: FilterConjunction::And,
            clauses: clauses.into_iter().map(FilterNode::Clause).collect(),
        }
    }

    pub fn or(clauses: Vec<FilterClause>) -> Self {
        Self {
            conjunction: FilterConjunction::Or,
            clauses: clauses.into_iter().map(FilterNode::Clause).collect(),
        }
    }

    pub fn with_group(mut self, group: Filter) -> Self {
        self.clauses.push(FilterNode::Group(group));
        self
    }
}

/// Aggregation function applied to the matched events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "func", rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum { property: String },
    Min { property: String },
    Max { property: String },
    Avg { property: String },
    Unique { property: String },
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum { .. } => "sum",
            Aggregation::Min { .. } => "min",
            Aggregation::Max { .. } => "max",
            Aggregation::Avg { .. } => "avg",
            Aggregation::Unique { .. } => "unique",
        }
    }

    pub fn property(&self) -> Option<&str> {
        match self {
            Aggregation::Count => None,
            Aggregation::Sum { property }
            | Aggregation::Min { property }
            | Aggregation::Max { property }
            | Aggregation::Avg { property }
            | Aggregation::Unique { property } => Some(property),
        }
    }
}

/// Meter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Meter {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    #[sqlx(json)]
    pub filter: Filter,
    #[sqlx(json)]
    pub aggregation: Aggregation,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Meter {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Input for creating a meter.
#[derive(Debug, Clone)]
pub struct CreateMeter {
    pub organization_id: Uuid,
    pub name: String,
    pub filter: Filter,
    pub aggregation: Aggregation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_literals_survive_json() {
        let clause = FilterClause::new("metadata.tokens", FilterOperator::Gte, 10);
        let encoded = serde_json::to_value(&clause).unwrap();
        assert_eq!(encoded["value"], json!(10));

        let decoded: FilterClause = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, clause);
    }

    #[test]
    fn numeric_looking_strings_stay_text() {
        let value: FilterValue = serde_json::from_value(json!("42")).unwrap();
        assert_eq!(value, FilterValue::Text("42".to_string()));
    }

    #[test]
    fn nested_groups_deserialize() {
        let filter: Filter = serde_json::from_value(json!({
            "conjunction": "and",
            "clauses": [
                {"property": "name", "operator": "eq", "value": "api.call"},
                {"conjunction": "or", "clauses": [
                    {"property": "metadata.region", "operator": "eq", "value": "eu"},
                    {"property": "metadata.region", "operator": "eq", "value": "us"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(filter.clauses.len(), 2);
        assert!(matches!(filter.clauses[1], FilterNode::Group(_)));
    }

    #[test]
    fn aggregation_is_tagged_by_func() {
        let agg: Aggregation =
            serde_json::from_value(json!({"func": "sum", "property": "metadata.tokens"})).unwrap();
        assert_eq!(agg.property(), Some("metadata.tokens"));
        assert_eq!(agg.as_str(), "sum");
    }
}
