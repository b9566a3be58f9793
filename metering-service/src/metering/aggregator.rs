use super::MeterAccumulator;
use crate::context::MeteringContext;
use crate::error::{MeteringError, MeteringResult};
use crate::events::EventStore;
use crate::models::{CreateMeter, CustomerRef, Meter, TimeWindow};
use crate::services::MeterRepository;
use chrono::Utc;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Scalar usage per (meter, customer, window).
#[derive(Clone)]
pub struct MeterAggregator {
    meters: Arc<dyn MeterRepository>,
    events: EventStore,
}

impl MeterAggregator {
    pub fn new(ctx: &MeteringContext) -> Self {
        Self {
            meters: ctx.meters.clone(),
            events: EventStore::new(ctx),
        }
    }

    pub async fn create_meter(&self, input: CreateMeter) -> MeteringResult<Meter> {
        if input.name.trim().is_empty() {
            return Err(MeteringError::InvalidInput(
                "meter name must not be empty".to_string(),
            ));
        }
        let meter = Meter {
            id: Uuid::new_v4(),
            organization_id: input.organization_id,
            name: input.name.trim().to_string(),
            filter: input.filter,
            aggregation: input.aggregation,
            archived_at: None,
            created_at: Utc::now(),
        };
        Ok(self.meters.insert_meter(&meter).await?)
    }

    pub async fn get_meter(&self, organization_id: Uuid, meter_id: Uuid) -> MeteringResult<Meter> {
        self.meters
            .get_meter(organization_id, meter_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("meter", meter_id))
    }

    /// Archive a meter. Accrual stops; past aggregates stay computable.
    pub async fn archive_meter(&self, organization_id: Uuid, meter_id: Uuid) -> MeteringResult<Meter> {
        self.meters
            .archive_meter(organization_id, meter_id, Utc::now())
            .await?
            .ok_or_else(|| MeteringError::not_found("meter", meter_id))
    }

    /// Usage of `customer` on `meter` over events ingested in `window`.
    #[instrument(skip(self, meter, customer), fields(meter_id = %meter.id, organization_id = %meter.organization_id))]
    pub async fn aggregate(
        &self,
        meter: &Meter,
        customer: &CustomerRef,
        window: TimeWindow,
    ) -> MeteringResult<Decimal> {
        if window.is_empty() {
            return Ok(Decimal::ZERO);
        }
        let mut stream = self.events.query(
            meter.organization_id,
            Some(meter.filter.clone()),
            Some(customer.clone()),
            window,
        );
        let mut acc = MeterAccumulator::new(&meter.aggregation);
        while let Some(event) = stream.try_next().await? {
            acc.push(&event);
        }
        Ok(acc.finish())
    }
}
