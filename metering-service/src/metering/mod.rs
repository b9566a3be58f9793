//! Meter aggregation: filter interpretation and aggregation functions.

mod accumulator;
mod aggregator;
pub mod filter;

pub use accumulator::{aggregate_events, MeterAccumulator};
pub use aggregator::MeterAggregator;
