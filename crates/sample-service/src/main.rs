//! `sample-service`: reference binary for the telemetry bootstrap.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Connect to the collector (canceled by Ctrl-C or SIGTERM).
//! 4. Build the metrics pipeline.
//! 5. Build the trace pipeline, or the no-op one when tracing is disabled.
//! 6. Run the heartbeat until Ctrl-C or SIGTERM.
//! 7. Shut down pipelines, then close the connection.

mod config;
mod heartbeat;
mod telemetry;

use anyhow::{Context, Result};
use bootstrap::{
    build_metrics_pipeline, build_noop_trace_pipeline, build_trace_pipeline, shutdown_all,
    TelemetryRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Logging is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Logging
    // -----------------------------------------------------------------------
    let logs = telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %cfg.service_name,
        instance = %cfg.service_instance_id,
        "sample-service starting"
    );

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match shutdown_signal().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => warn!(error = %e, "cannot listen for shutdown signals; stopping"),
            }
            stop.cancel();
        }
    });

    // -----------------------------------------------------------------------
    // 3. Collector connection
    // -----------------------------------------------------------------------
    let tls = cfg.tls_settings()?;
    let connection =
        match bootstrap::connect(&stop, &cfg.otel_collector_endpoint, &tls, cfg.backoff_policy())
            .await
        {
            Ok(connection) => connection,
            Err(e) if e.is_canceled() => {
                info!("stopped before the collector connection was established");
                return Ok(());
            }
            Err(e) => return Err(e).context("failed to connect to the collector"),
        };

    // -----------------------------------------------------------------------
    // 4. Metrics
    // -----------------------------------------------------------------------
    let registry = TelemetryRegistry::new();
    let metrics = build_metrics_pipeline(&connection, &cfg.metrics_config()?, &registry)
        .context("failed to build metrics pipeline")?;

    // -----------------------------------------------------------------------
    // 5. Traces
    // -----------------------------------------------------------------------
    let traces = if cfg.tracing_enabled {
        build_trace_pipeline(&connection, &cfg.trace_config()?, &registry)
            .context("failed to build trace pipeline")?
    } else {
        info!("tracing disabled; installing no-op trace pipeline");
        build_noop_trace_pipeline(&registry)
    };
    logs.attach_tracer(registry.tracer("sample-service"))?;

    // -----------------------------------------------------------------------
    // 6. Workload
    // -----------------------------------------------------------------------
    let beats = heartbeat::run(registry.clone(), stop.clone(), cfg.heartbeat_interval()).await;
    info!(beats, "heartbeat finished");

    // -----------------------------------------------------------------------
    // 7. Teardown
    // -----------------------------------------------------------------------
    logs.detach_tracer()?;
    shutdown_all(&[&metrics, &traces], connection, cfg.shutdown_timeout())
        .await
        .context("telemetry shutdown incomplete")?;
    info!("sample-service stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
