//! Common test utilities for metering-service integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use metering_service::config::{
    DatabaseConfig, MeteringConfig, MeteringSettings, SchedulerConfig, StorageBackend,
};
use metering_service::models::{
    Aggregation, BillingInterval, CreateMeter, CustomerRef, Filter, FilterClause, FilterOperator,
    IngestEvent, Meter, PriceSpec, ProductPrice, SubscriptionPrice, SubscriptionStatus,
    SubscriptionTerms,
};
use metering_service::services::InMemoryStore;
use metering_service::startup::Application;
use metering_service::{MeteringApi, MeteringContext};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use service_core::config::Config as CommonConfig;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,metering_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const UNIT_AMOUNT: Decimal = dec!(50);
pub const INCLUDED_UNITS: Decimal = dec!(100);

/// One organization with a metered `api.call` meter and a subscription
/// billing it at 50 per unit above 100 included units.
pub struct TestMetering {
    pub api: MeteringApi,
    pub store: Arc<InMemoryStore>,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub meter: Meter,
    pub terms: SubscriptionTerms,
}

impl TestMetering {
    pub async fn spawn() -> Self {
        Self::spawn_with(MeteringSettings::default()).await
    }

    pub async fn spawn_with(settings: MeteringSettings) -> Self {
        Self::spawn_with_context(settings, |ctx| ctx).await
    }

    /// Like [`TestMetering::spawn_with`], letting the test swap pieces of the
    /// context before the api is built.
    pub async fn spawn_with_context(
        settings: MeteringSettings,
        customize: impl FnOnce(MeteringContext) -> MeteringContext,
    ) -> Self {
        init_tracing();
        let (ctx, store) = MeteringContext::in_memory_with(settings);
        let api = MeteringApi::new(customize(ctx));

        let organization_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();

        let meter = api
            .create_meter(CreateMeter {
                organization_id,
                name: "API calls".to_string(),
                filter: Filter::and(vec![FilterClause::new(
                    "name",
                    FilterOperator::Eq,
                    "api.call",
                )]),
                aggregation: Aggregation::Sum {
                    property: "metadata.units".to_string(),
                },
            })
            .await
            .expect("Failed to create meter");

        let now = Utc::now();
        let terms = SubscriptionTerms {
            id: Uuid::new_v4(),
            organization_id,
            customer_id,
            external_customer_id: Some(format!("cus_{}", customer_id.simple())),
            status: SubscriptionStatus::Active,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
            interval_count: 1,
            current_period_start: now - Duration::hours(1),
            current_period_end: now + Duration::hours(1),
            prices: vec![SubscriptionPrice::new(metered_price(meter.id))],
            discounts: Vec::new(),
            billing_address: None,
            tax_ids: Vec::new(),
        };
        api.register_subscription(&terms)
            .await
            .expect("Failed to register subscription");

        Self {
            api,
            store,
            organization_id,
            customer_id,
            meter,
            terms,
        }
    }

    pub fn customer(&self) -> CustomerRef {
        CustomerRef::by_id(self.customer_id)
    }

    pub fn usage_event(&self, units: i64, external_id: Option<&str>) -> IngestEvent {
        IngestEvent {
            organization_id: self.organization_id,
            name: "api.call".to_string(),
            customer: self.customer(),
            timestamp: Utc::now(),
            external_id: external_id.map(str::to_string),
            metadata: json!({ "units": units })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Ingest `events` usage events carrying `units` each.
    pub async fn ingest_usage(&self, events: usize, units: i64) {
        for _ in 0..events {
            self.api
                .ingest_event(self.usage_event(units, None))
                .await
                .expect("Failed to ingest event");
        }
    }

    pub async fn current_period_id(&self) -> Uuid {
        self.api
            .current_period(self.terms.id)
            .await
            .expect("Failed to load current period")
            .id
    }

    /// Close, price and materialize the current period; returns its order id.
    pub async fn bill_current_period(&self) -> Uuid {
        let subscription_id = self.terms.id;
        self.api.close_period(subscription_id).await.expect("close failed");
        self.api.price_period(subscription_id).await.expect("price failed");
        let refs = self
            .api
            .materialize_period(subscription_id)
            .await
            .expect("materialize failed");
        refs.first().expect("order has no items").order_id
    }
}

pub fn metered_price(meter_id: Uuid) -> ProductPrice {
    ProductPrice {
        id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        currency: "usd".to_string(),
        spec: PriceSpec::MeteredUnit {
            meter_id,
            unit_amount: UNIT_AMOUNT,
            included_units: INCLUDED_UNITS,
            cap_amount: None,
        },
    }
}

pub fn fixed_price(amount: i64) -> ProductPrice {
    ProductPrice {
        id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        currency: "usd".to_string(),
        spec: PriceSpec::Fixed {
            price_amount: amount,
        },
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

/// Configuration for a fully in-process application on a random port.
pub fn test_config() -> MeteringConfig {
    MeteringConfig {
        common: CommonConfig {
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "metering-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        storage: StorageBackend::Memory,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: None,
        metering: MeteringSettings::default(),
        scheduler: SchedulerConfig::default(),
    }
}

/// Test application wrapper.
pub struct TestApp {
    pub http_address: String,
    pub api: MeteringApi,
}

impl TestApp {
    pub async fn spawn() -> Self {
        init_tracing();

        let app = Application::build_without_migrations(test_config())
            .await
            .expect("Failed to build application");

        let http_address = format!("http://127.0.0.1:{}", app.http_port());
        let api = app.api().clone();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self { http_address, api }
    }
}
