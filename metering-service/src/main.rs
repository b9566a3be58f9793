//! Metering Service entry point.

use metering_service::config::MeteringConfig;
use metering_service::services::init_metrics;
use metering_service::startup::Application;
use metering_service::workers::Scheduler;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = MeteringConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = %config.service_version,
        otlp_endpoint = ?config.otlp_endpoint,
        "Starting metering-service"
    );

    init_metrics();

    // Log configuration (mask sensitive values)
    tracing::info!(
        service_name = %config.service_name,
        http_port = %config.common.port,
        storage = config.storage.as_str(),
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        distributed_locks = config.redis.is_some(),
        rounding_tolerance_cents = config.metering.rounding_tolerance_cents,
        sweep_concurrency = config.metering.sweep_concurrency,
        sweep_window_hours = config.scheduler.sweep_window_hours,
        ledger_tick_secs = config.scheduler.ledger_tick.as_secs(),
        "Configuration loaded"
    );

    let app = Application::build(config.clone()).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let shutdown = app.shutdown_token();
    let workers = Scheduler::new(app.api().clone(), config.scheduler.clone(), shutdown.clone()).start();

    let mut server = tokio::spawn(app.run_until_stopped());

    let result = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
            shutdown.cancel();
            server.await
        }
    };
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    match result {
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Application error");
            return Err(e);
        }
        Err(e) => tracing::error!(error = %e, "Server task failed"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
