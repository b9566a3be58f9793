//! Domain models for metering-service.

mod billing_entry;
mod event;
mod expected;
mod meter;
mod mismatch;
mod order;
mod period;
mod price;
mod subscription;
mod window;

pub use billing_entry::{BillingEntry, Direction, NewBillingEntry};
pub use event::{CustomerRef, Event, EventMetadata, IngestEvent, IngestOutcome};
pub use expected::{ExpectedLineItem, ExpectedOrder, SimulationTarget};
pub use meter::{
    Aggregation, CreateMeter, Filter, FilterClause, FilterConjunction, FilterNode,
    FilterOperator, FilterValue, Meter,
};
pub use mismatch::{MismatchClassification, OracleMismatch, ReconciliationResult, Severity};
pub use order::{
    CreditTransaction, OrderDraft, OrderItemDraft, PersistedOrderItem, PersistedOrderSnapshot,
    TaxCalculation,
};
pub use period::{BillingPeriod, OrderItemRef, PeriodState, PricedLine};
pub use price::{PriceSpec, ProductPrice, SeatTier};
pub use subscription::{
    Address, BillingInterval, Discount, DiscountDuration, DiscountKind, SubscriptionPrice,
    SubscriptionStatus, SubscriptionTerms,
};
pub use window::TimeWindow;
