use super::filter::lookup;
use crate::models::{Aggregation, Event};
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Incremental meter aggregation.
///
/// Events are pushed one at a time so a single scan can feed several
/// accumulators (one per window of interest).
#[derive(Debug, Clone)]
pub struct MeterAccumulator {
    aggregation: Aggregation,
    count: u64,
    numeric: u64,
    sum: Decimal,
    min: Option<Decimal>,
    max: Option<Decimal>,
    distinct: HashSet<String>,
}

impl MeterAccumulator {
    pub fn new(aggregation: &Aggregation) -> Self {
        Self {
            aggregation: aggregation.clone(),
            count: 0,
            numeric: 0,
            sum: Decimal::ZERO,
            min: None,
            max: None,
            distinct: HashSet::new(),
        }
    }

    pub fn push(&mut self, event: &Event) {
        self.count += 1;
        let Some(property) = self.aggregation.property() else {
            return;
        };
        let Some(value) = lookup(event, property) else {
            return;
        };

        if let Aggregation::Unique { .. } = self.aggregation {
            self.distinct.insert(value.distinct_key());
            return;
        }

        // sum/min/max/avg skip non-numeric values
        if let Some(n) = value.as_number() {
            self.numeric += 1;
            self.sum = self.sum.saturating_add(n);
            self.min = Some(self.min.map_or(n, |m| m.min(n)));
            self.max = Some(self.max.map_or(n, |m| m.max(n)));
        }
    }

    /// Events pushed, matched or not by the aggregated property.
    pub fn events_seen(&self) -> u64 {
        self.count
    }

    pub fn finish(&self) -> Decimal {
        match self.aggregation {
            Aggregation::Count => Decimal::from(self.count),
            Aggregation::Sum { .. } => self.sum,
            Aggregation::Min { .. } => self.min.unwrap_or(Decimal::ZERO),
            Aggregation::Max { .. } => self.max.unwrap_or(Decimal::ZERO),
            Aggregation::Avg { .. } => {
                if self.numeric == 0 {
                    Decimal::ZERO
                } else {
                    self.sum / Decimal::from(self.numeric)
                }
            }
            Aggregation::Unique { .. } => Decimal::from(self.distinct.len() as u64),
        }
    }
}

/// Aggregate an in-memory slice of events that already passed the filter.
pub fn aggregate_events<'a, I>(aggregation: &Aggregation, events: I) -> Decimal
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut acc = MeterAccumulator::new(aggregation);
    for event in events {
        acc.push(event);
    }
    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    fn event(metadata: serde_json::Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            customer_id: None,
            external_customer_id: Some("cus_1".into()),
            name: "tokens".into(),
            timestamp: Utc::now(),
            ingested_at: Utc::now(),
            external_id: None,
            user_metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    fn sample() -> Vec<Event> {
        vec![
            event(json!({"tokens": 10, "model": "a"})),
            event(json!({"tokens": 2.5, "model": "b"})),
            event(json!({"tokens": "n/a", "model": "a"})),
            event(json!({})),
        ]
    }

    fn agg(aggregation: Aggregation) -> Decimal {
        aggregate_events(&aggregation, &sample())
    }

    fn prop(name: &str) -> String {
        format!("metadata.{}", name)
    }

    #[test]
    fn every_function_over_the_same_events() {
        assert_eq!(agg(Aggregation::Count), dec!(4));
        assert_eq!(agg(Aggregation::Sum { property: prop("tokens") }), dec!(12.5));
        assert_eq!(agg(Aggregation::Min { property: prop("tokens") }), dec!(2.5));
        assert_eq!(agg(Aggregation::Max { property: prop("tokens") }), dec!(10));
        assert_eq!(agg(Aggregation::Avg { property: prop("tokens") }), dec!(6.25));
        assert_eq!(agg(Aggregation::Unique { property: prop("model") }), dec!(2));
    }

    #[test]
    fn empty_input_is_zero() {
        let none: Vec<Event> = Vec::new();
        for aggregation in [
            Aggregation::Count,
            Aggregation::Sum { property: prop("tokens") },
            Aggregation::Avg { property: prop("tokens") },
            Aggregation::Max { property: prop("tokens") },
        ] {
            assert_eq!(aggregate_events(&aggregation, &none), Decimal::ZERO);
        }
    }

    #[test]
    fn aggregation_is_order_independent() {
        let mut events = sample();
        let forward = aggregate_events(&Aggregation::Sum { property: prop("tokens") }, &events);
        events.reverse();
        let backward = aggregate_events(&Aggregation::Sum { property: prop("tokens") }, &events);
        assert_eq!(forward, backward);
    }
}
