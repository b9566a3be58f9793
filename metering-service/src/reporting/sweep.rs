use crate::context::MeteringContext;
use crate::error::{MeteringError, MeteringResult};
use crate::models::{
    ExpectedOrder, PersistedOrderSnapshot, ReconciliationResult, Severity, SimulationTarget,
    TimeWindow,
};
use crate::oracle::BillingOracle;
use crate::reconciler::reconcile;
use crate::services::metrics::{
    record_error, record_mismatch, record_reconciliation, record_sweep_run,
};
use crate::services::SweepCheckpoint;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const MAX_RESUMED_SWEEPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub order_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub window: TimeWindow,
    pub results: Vec<ReconciliationResult>,
    pub failures: Vec<SweepFailure>,
    pub checkpoint: SweepCheckpoint,
    /// Stopped by the cancellation token before every subscription ran.
    pub cancelled: bool,
}

impl SweepReport {
    pub fn inconsistent(&self) -> impl Iterator<Item = &ReconciliationResult> {
        self.results.iter().filter(|r| !r.is_consistent)
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.results.iter().all(|r| r.is_consistent)
    }
}

enum SubscriptionOutcome {
    Completed {
        subscription_id: Uuid,
        results: Vec<ReconciliationResult>,
        failures: Vec<SweepFailure>,
    },
    Skipped,
}

/// Runs oracle-vs-order reconciliations, one order or a whole window at a
/// time.
#[derive(Clone)]
pub struct ReconciliationService {
    ctx: MeteringContext,
    oracle: BillingOracle,
    shutdown: CancellationToken,
}

impl ReconciliationService {
    pub fn new(ctx: &MeteringContext) -> Self {
        Self::with_shutdown(ctx, CancellationToken::new())
    }

    pub fn with_shutdown(ctx: &MeteringContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx: ctx.clone(),
            oracle: BillingOracle::new(ctx),
            shutdown,
        }
    }

    /// Token that aborts running sweeps between subscriptions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Diff an expected order against a persisted one and report mismatches.
    pub fn reconcile(
        &self,
        expected: &ExpectedOrder,
        actual: &PersistedOrderSnapshot,
    ) -> MeteringResult<ReconciliationResult> {
        let result = reconcile(expected, actual, self.ctx.settings.rounding_tolerance_cents)
            .map_err(|e| {
                MeteringError::InvalidInput(format!("order {} cannot be reconciled: {}", actual.id, e))
            })?;
        report_result(&result);
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn reconcile_order(&self, order_id: Uuid) -> MeteringResult<ReconciliationResult> {
        let order = self
            .ctx
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("order", order_id))?;
        self.reconcile_snapshot(&order).await
    }

    async fn reconcile_snapshot(
        &self,
        order: &PersistedOrderSnapshot,
    ) -> MeteringResult<ReconciliationResult> {
        let expected = self
            .oracle
            .simulate(
                order.organization_id,
                SimulationTarget::Order { order_id: order.id },
            )
            .await?;
        self.reconcile(&expected, order)
    }

    /// Reconcile every order created in the last `hours`.
    #[instrument(skip(self))]
    pub async fn run_sweep(&self, hours: i64) -> MeteringResult<SweepReport> {
        if hours <= 0 {
            return Err(MeteringError::InvalidInput(format!(
                "sweep window must be positive, got {} hours",
                hours
            )));
        }
        let now = Utc::now();
        let checkpoint = SweepCheckpoint {
            sweep_id: Uuid::new_v4(),
            window: TimeWindow::new(now - Duration::hours(hours), now),
            completed_subscriptions: Vec::new(),
            finished: false,
            updated_at: now,
        };
        self.ctx.checkpoints.save_checkpoint(&checkpoint).await?;
        self.sweep(checkpoint).await
    }

    /// Continue an interrupted sweep, skipping subscriptions it completed.
    #[instrument(skip(self))]
    pub async fn resume_sweep(&self, sweep_id: Uuid) -> MeteringResult<SweepReport> {
        let checkpoint = self
            .ctx
            .checkpoints
            .get_checkpoint(sweep_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("sweep checkpoint", sweep_id))?;
        self.sweep(checkpoint).await
    }

    /// Resume sweeps left unfinished by a cancellation or crash, oldest first.
    #[instrument(skip(self))]
    pub async fn resume_unfinished(&self) -> MeteringResult<Vec<SweepReport>> {
        let pending = self
            .ctx
            .checkpoints
            .list_unfinished_checkpoints(MAX_RESUMED_SWEEPS)
            .await?;
        let mut reports = Vec::with_capacity(pending.len());
        for checkpoint in pending {
            if self.shutdown.is_cancelled() {
                break;
            }
            info!(sweep_id = %checkpoint.sweep_id, "Resuming unfinished sweep");
            reports.push(self.sweep(checkpoint).await?);
        }
        Ok(reports)
    }

    async fn sweep(&self, mut checkpoint: SweepCheckpoint) -> MeteringResult<SweepReport> {
        let sweep_id = checkpoint.sweep_id;
        let window = checkpoint.window;
        let done: HashSet<Uuid> = checkpoint.completed_subscriptions.iter().copied().collect();

        let mut failures = Vec::new();
        let mut groups: BTreeMap<Uuid, Vec<PersistedOrderSnapshot>> = BTreeMap::new();
        for order in self.ctx.orders.list_orders_created_in(&window).await? {
            match order.subscription_id {
                Some(subscription_id) if done.contains(&subscription_id) => {}
                Some(subscription_id) => groups.entry(subscription_id).or_default().push(order),
                None => failures.push(SweepFailure {
                    order_id: order.id,
                    subscription_id: None,
                    error: "order is not attached to a subscription".to_string(),
                }),
            }
        }

        info!(
            sweep_id = %sweep_id,
            subscriptions = groups.len(),
            skipped = done.len(),
            "Reconciliation sweep started"
        );

        let concurrency = self.ctx.settings.sweep_concurrency.max(1);
        let outcomes = stream::iter(groups)
            .map(|(subscription_id, orders)| self.sweep_subscription(subscription_id, orders))
            .buffer_unordered(concurrency);
        futures::pin_mut!(outcomes);

        let mut results = Vec::new();
        let mut cancelled = false;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                SubscriptionOutcome::Completed {
                    subscription_id,
                    results: done_results,
                    failures: done_failures,
                } => {
                    results.extend(done_results);
                    failures.extend(done_failures);
                    checkpoint.completed_subscriptions.push(subscription_id);
                    checkpoint.updated_at = Utc::now();
                    if let Err(e) = self.ctx.checkpoints.save_checkpoint(&checkpoint).await {
                        warn!(sweep_id = %sweep_id, error = %e, "Failed to save sweep checkpoint");
                    }
                }
                SubscriptionOutcome::Skipped => cancelled = true,
            }
        }

        checkpoint.finished = !cancelled;
        checkpoint.updated_at = Utc::now();
        self.ctx.checkpoints.save_checkpoint(&checkpoint).await?;

        let status = if cancelled {
            "cancelled"
        } else if failures.is_empty() {
            "completed"
        } else {
            "completed_with_failures"
        };
        record_sweep_run(status);
        info!(
            sweep_id = %sweep_id,
            status,
            reconciled = results.len(),
            inconsistent = results.iter().filter(|r| !r.is_consistent).count(),
            failures = failures.len(),
            "Reconciliation sweep finished"
        );

        Ok(SweepReport {
            sweep_id,
            window,
            results,
            failures,
            checkpoint,
            cancelled,
        })
    }

    /// One subscription's orders, sequentially. A failing order does not
    /// stop the rest.
    async fn sweep_subscription(
        &self,
        subscription_id: Uuid,
        orders: Vec<PersistedOrderSnapshot>,
    ) -> SubscriptionOutcome {
        if self.shutdown.is_cancelled() {
            return SubscriptionOutcome::Skipped;
        }

        let mut results = Vec::with_capacity(orders.len());
        let mut failures = Vec::new();
        for order in &orders {
            match self.reconcile_snapshot(order).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    record_error(e.kind(), "reconcile_order");
                    match &e {
                        MeteringError::IncompleteSimulationInput(reason) => {
                            record_reconciliation("incomplete");
                            warn!(
                                order_id = %order.id,
                                subscription_id = %subscription_id,
                                reason = %reason,
                                "Data gap, order not reconciled"
                            );
                        }
                        other => error!(
                            order_id = %order.id,
                            subscription_id = %subscription_id,
                            error = %other,
                            "Order reconciliation failed"
                        ),
                    }
                    failures.push(SweepFailure {
                        order_id: order.id,
                        subscription_id: Some(subscription_id),
                        error: e.to_string(),
                    });
                }
            }
        }

        SubscriptionOutcome::Completed {
            subscription_id,
            results,
            failures,
        }
    }
}

/// Alert on a reconciliation outcome through logs and counters.
fn report_result(result: &ReconciliationResult) {
    for mismatch in &result.mismatches {
        record_mismatch(mismatch.classification.as_str(), mismatch.severity.as_str());
    }

    if result.is_consistent {
        record_reconciliation("consistent");
        return;
    }

    record_reconciliation("inconsistent");
    for mismatch in result.mismatches.iter().filter(|m| m.severity > Severity::Info) {
        warn!(
            order_id = ?result.order_id,
            subscription_id = %result.subscription_id,
            classification = mismatch.classification.as_str(),
            severity = mismatch.severity.as_str(),
            expected = ?mismatch.expected_value,
            actual = ?mismatch.actual_value,
            entity = %mismatch.entity_reference,
            "Billing mismatch"
        );
    }
}
