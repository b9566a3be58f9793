//! Append-only event store with idempotent ingestion and paginated scans.

use crate::context::MeteringContext;
use crate::error::{MeteringError, MeteringResult};
use crate::metering::filter;
use crate::models::{CustomerRef, Event, Filter, IngestEvent, IngestOutcome, TimeWindow};
use crate::services::metrics::record_event_ingested;
use crate::services::{EventCursor, EventRepository, EventScan};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct EventStore {
    repo: Arc<dyn EventRepository>,
    page_size: usize,
}

impl EventStore {
    pub fn new(ctx: &MeteringContext) -> Self {
        Self {
            repo: ctx.events.clone(),
            page_size: ctx.settings.event_page_size.max(1),
        }
    }

    /// Ingest one event stamped with the current time.
    pub async fn ingest(&self, input: IngestEvent) -> MeteringResult<IngestOutcome> {
        self.ingest_at(input, Utc::now()).await
    }

    /// Ingest one event with an explicit `ingested_at`, for replays of
    /// exported event logs.
    #[instrument(skip(self, input), fields(organization_id = %input.organization_id, name = %input.name))]
    pub async fn ingest_at(
        &self,
        input: IngestEvent,
        ingested_at: DateTime<Utc>,
    ) -> MeteringResult<IngestOutcome> {
        let event = build_event(input, ingested_at)?;
        let outcome = self.repo.insert_event(&event).await?;

        record_event_ingested(&event.organization_id.to_string(), outcome.as_str());
        if outcome.is_duplicate() {
            info!(
                event_id = %outcome.event().id,
                external_id = ?event.external_id,
                "Duplicate external id, returning stored event"
            );
        } else {
            debug!(event_id = %event.id, "Event ingested");
        }
        Ok(outcome)
    }

    /// Ingest many events; each gets its own outcome and one bad event does
    /// not stop the rest.
    #[instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn ingest_batch(
        &self,
        inputs: Vec<IngestEvent>,
    ) -> Vec<MeteringResult<IngestOutcome>> {
        let ingested_at = Utc::now();
        let mut outcomes = Vec::with_capacity(inputs.len());
        for input in inputs {
            outcomes.push(self.ingest_at(input, ingested_at).await);
        }
        outcomes
    }

    /// Lazily stream the events of an organization ingested inside `window`,
    /// ascending by `(ingested_at, id)`.
    ///
    /// Pages are fetched on demand with a keyset cursor, so the full result
    /// is never held in memory. Dropping the stream stops the scan.
    pub fn query(
        &self,
        organization_id: Uuid,
        filter: Option<Filter>,
        customer: Option<CustomerRef>,
        window: TimeWindow,
    ) -> BoxStream<'static, MeteringResult<Event>> {
        let scan = EventScan {
            organization_id,
            customer,
            ingested: window,
        };
        let pages = page_stream(self.repo.clone(), scan, self.page_size);

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Event, MeteringError>)))
            .try_flatten()
            .try_filter(move |event| {
                let keep = filter
                    .as_ref()
                    .is_none_or(|f| filter::matches(event, f));
                futures::future::ready(keep)
            })
            .boxed()
    }

    pub async fn get_events(
        &self,
        organization_id: Uuid,
        ids: &[Uuid],
    ) -> MeteringResult<Vec<Event>> {
        Ok(self.repo.get_events(organization_id, ids).await?)
    }

    /// Delete events whose own timestamp is before `cutoff`.
    #[instrument(skip(self))]
    pub async fn purge_before(
        &self,
        organization_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> MeteringResult<u64> {
        let purged = self.repo.purge_events_before(organization_id, cutoff).await?;
        info!(purged = purged, "Event retention purge completed");
        Ok(purged)
    }
}

fn build_event(input: IngestEvent, ingested_at: DateTime<Utc>) -> MeteringResult<Event> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(MeteringError::InvalidInput(
            "event name must not be empty".to_string(),
        ));
    }

    let external_id = input.external_id.filter(|id| !id.trim().is_empty());
    let external_customer_id = input
        .customer
        .external_customer_id
        .filter(|id| !id.trim().is_empty());

    Ok(Event {
        id: Uuid::new_v4(),
        organization_id: input.organization_id,
        customer_id: input.customer.customer_id,
        external_customer_id,
        name: name.to_string(),
        timestamp: input.timestamp,
        ingested_at,
        external_id,
        user_metadata: input.metadata,
    })
}

struct PageState {
    repo: Arc<dyn EventRepository>,
    scan: EventScan,
    cursor: Option<EventCursor>,
    exhausted: bool,
}

fn page_stream(
    repo: Arc<dyn EventRepository>,
    scan: EventScan,
    page_size: usize,
) -> BoxStream<'static, MeteringResult<Vec<Event>>> {
    let state = PageState {
        repo,
        scan,
        cursor: None,
        exhausted: false,
    };

    stream::try_unfold(state, move |mut state| async move {
        if state.exhausted {
            return Ok(None);
        }
        let page = state
            .repo
            .scan_events(&state.scan, state.cursor, page_size)
            .await
            .map_err(MeteringError::from)?;

        if page.len() < page_size {
            state.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                state.cursor = Some(EventCursor::from(last));
                Ok(Some((page, state)))
            }
            None => Ok(None),
        }
    })
    .boxed()
}
