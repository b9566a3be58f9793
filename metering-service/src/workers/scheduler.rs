use crate::api::MeteringApi;
use crate::config::SchedulerConfig;
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drives the ledger tick and the periodic reconciliation sweep.
pub struct Scheduler {
    api: MeteringApi,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(api: MeteringApi, config: SchedulerConfig, shutdown_token: CancellationToken) -> Self {
        Self {
            api,
            config,
            shutdown_token,
        }
    }

    /// Spawn both loops. A zero interval disables its loop.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.ledger_tick.is_zero() {
            tracing::info!("Ledger tick disabled by configuration");
        } else {
            handles.push(tokio::spawn(ledger_loop(
                self.api.clone(),
                self.config.ledger_tick,
                self.shutdown_token.clone(),
            )));
        }

        if self.config.sweep_interval.is_zero() {
            tracing::info!("Reconciliation sweep disabled by configuration");
        } else {
            handles.push(tokio::spawn(sweep_loop(
                self.api,
                self.config.sweep_interval,
                self.config.sweep_window_hours,
                self.shutdown_token,
            )));
        }

        handles
    }
}

async fn ledger_loop(api: MeteringApi, period: Duration, shutdown: CancellationToken) {
    tracing::info!(interval_secs = period.as_secs(), "Starting ledger tick");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Ledger tick shutting down");
                break;
            }
            _ = ticker.tick() => {
                match api.process_due_periods(Utc::now()).await {
                    Ok(report) if report.failures.is_empty() => {
                        tracing::debug!(
                            closed = report.closed,
                            priced = report.priced,
                            materialized = report.materialized,
                            "Ledger tick finished"
                        );
                    }
                    Ok(report) => {
                        tracing::warn!(
                            closed = report.closed,
                            priced = report.priced,
                            materialized = report.materialized,
                            failures = report.failures.len(),
                            "Ledger tick finished with failures"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Ledger tick failed"),
                }
            }
        }
    }
}

async fn sweep_loop(
    api: MeteringApi,
    period: Duration,
    window_hours: i64,
    shutdown: CancellationToken,
) {
    tracing::info!(
        interval_secs = period.as_secs(),
        window_hours,
        "Starting reconciliation sweep schedule"
    );
    resume_unfinished(&api).await;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; wait a full period before sweeping.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Sweep schedule shutting down");
                break;
            }
            _ = ticker.tick() => {
                resume_unfinished(&api).await;
                match api.run_sweep(window_hours).await {
                    Ok(report) => tracing::info!(
                        sweep_id = %report.sweep_id,
                        clean = report.is_clean(),
                        cancelled = report.cancelled,
                        "Scheduled sweep finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "Scheduled sweep failed"),
                }
            }
        }
    }
}

async fn resume_unfinished(api: &MeteringApi) {
    match api.resume_unfinished_sweeps().await {
        Ok(reports) if reports.is_empty() => {}
        Ok(reports) => {
            for report in reports {
                tracing::info!(
                    sweep_id = %report.sweep_id,
                    clean = report.is_clean(),
                    cancelled = report.cancelled,
                    "Resumed sweep finished"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "Resuming unfinished sweeps failed"),
    }
}
