//! Usage event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Free-form event properties. Values are JSON scalars; numeric values feed
/// the sum/min/max/avg aggregations.
pub type EventMetadata = serde_json::Map<String, serde_json::Value>;

/// Immutable usage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub external_customer_id: Option<String>,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub external_id: Option<String>,
    #[sqlx(json)]
    pub user_metadata: EventMetadata,
}

/// Reference to the customer an event belongs to.
///
/// Events may arrive carrying only the merchant's own customer key, so a
/// reference matches on either identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerRef {
    pub customer_id: Option<Uuid>,
    pub external_customer_id: Option<String>,
}

impl CustomerRef {
    pub fn by_id(customer_id: Uuid) -> Self {
        Self {
            customer_id: Some(customer_id),
            external_customer_id: None,
        }
    }

    pub fn by_external_id(external_customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: None,
            external_customer_id: Some(external_customer_id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.external_customer_id.is_none()
    }

    pub fn matches(&self, event: &Event) -> bool {
        let by_id = self.customer_id.is_some() && event.customer_id == self.customer_id;
        let by_external = self.external_customer_id.is_some()
            && event.external_customer_id == self.external_customer_id;
        by_id || by_external
    }
}

/// Input for ingesting a single event.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub organization_id: Uuid,
    pub name: String,
    pub customer: CustomerRef,
    pub timestamp: DateTime<Utc>,
    pub external_id: Option<String>,
    pub metadata: EventMetadata,
}

/// Result of an ingest call. A repeated external id is a successful no-op
/// that hands back the event stored the first time.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Created(Event),
    DuplicateExternalId(Event),
}

impl IngestOutcome {
    pub fn event(&self) -> &Event {
        match self {
            IngestOutcome::Created(event) | IngestOutcome::DuplicateExternalId(event) => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            IngestOutcome::Created(event) | IngestOutcome::DuplicateExternalId(event) => event,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::DuplicateExternalId(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Created(_) => "created",
            IngestOutcome::DuplicateExternalId(_) => "duplicate",
        }
    }
}
