use crate::metering::MeterAccumulator;
use crate::models::{Aggregation, Event, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

/// Usage of one metered price over its effective window, seen three ways so
/// the reconciler can tell timing drift from real discrepancies.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageBreakdown {
    /// Events ingested inside the effective window.
    pub quantity: Decimal,
    /// Excludes events ingested in the grace window before the end.
    pub settled: Decimal,
    /// Includes events ingested in the grace window before the start.
    pub carried: Decimal,
    /// Events stamped inside the billing period but ingested after it ended.
    pub late_events: u64,
}

pub(crate) struct UsageSplitter {
    effective: TimeWindow,
    period: TimeWindow,
    grace: Duration,
    main: MeterAccumulator,
    settled: MeterAccumulator,
    carried: MeterAccumulator,
    late_events: u64,
}

impl UsageSplitter {
    pub(crate) fn new(
        aggregation: &Aggregation,
        period: TimeWindow,
        effective: TimeWindow,
        grace: Duration,
    ) -> Self {
        Self {
            effective,
            period,
            grace,
            main: MeterAccumulator::new(aggregation),
            settled: MeterAccumulator::new(aggregation),
            carried: MeterAccumulator::new(aggregation),
            late_events: 0,
        }
    }

    /// Window an event scan must cover to feed every view.
    pub(crate) fn scan_window(&self) -> TimeWindow {
        self.effective.extend(self.grace, self.grace)
    }

    pub(crate) fn push(&mut self, event: &Event) {
        let ingested = event.ingested_at;
        if self.effective.contains(ingested) {
            self.main.push(event);
        }
        if in_range(ingested, self.effective.start, self.effective.end - self.grace) {
            self.settled.push(event);
        }
        if in_range(ingested, self.effective.start - self.grace, self.effective.end) {
            self.carried.push(event);
        }
        if self.period.contains(event.timestamp) && ingested >= self.period.end {
            self.late_events += 1;
        }
    }

    pub(crate) fn finish(self) -> UsageBreakdown {
        UsageBreakdown {
            quantity: self.main.finish(),
            settled: self.settled.finish(),
            carried: self.carried.finish(),
            late_events: self.late_events,
        }
    }
}

fn in_range(instant: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    instant >= start && instant < end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventMetadata;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event(timestamp: DateTime<Utc>, ingested_at: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            customer_id: None,
            external_customer_id: Some("cus_1".to_string()),
            name: "api_call".to_string(),
            timestamp,
            ingested_at,
            external_id: None,
            user_metadata: EventMetadata::default(),
        }
    }

    #[test]
    fn views_split_on_ingestion_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, end);
        let mut splitter =
            UsageSplitter::new(&Aggregation::Count, window, window, Duration::hours(24));

        // carried in from the previous period
        splitter.push(&event(start - Duration::hours(2), start - Duration::hours(1)));
        // ordinary
        splitter.push(&event(start + Duration::days(3), start + Duration::days(3)));
        // inside the closing grace window
        splitter.push(&event(end - Duration::hours(3), end - Duration::hours(2)));
        // late: stamped in the period, ingested after it
        splitter.push(&event(end - Duration::hours(1), end + Duration::hours(1)));

        let usage = splitter.finish();
        assert_eq!(usage.quantity, Decimal::from(2));
        assert_eq!(usage.settled, Decimal::from(1));
        assert_eq!(usage.carried, Decimal::from(3));
        assert_eq!(usage.late_events, 1);
    }
}
