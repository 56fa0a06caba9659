use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use trace_vulture::http::HttpBackend;
use trace_vulture::validation::{RealClock, ValidationConfig, ValidationService};
use trace_vulture::{Vulture, VultureConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
        return ExitCode::FAILURE;
    }

    let config = VultureConfig::from_env();
    if let Err(err) = config.validate() {
        error!(%err, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let mut backend = match HttpBackend::new(&config.push_endpoint, &config.query_endpoint) {
        Ok(backend) => backend,
        Err(err) => {
            error!(%err, "failed to build http client");
            return ExitCode::FAILURE;
        }
    };
    if let Some(token) = &config.auth_token {
        backend = backend.with_auth_token(token);
    }
    let backend = Arc::new(backend);

    if config.validation_cycles > 0 {
        run_validation(&config, backend).await
    } else {
        run_soak(config, backend).await
    }
}

/// Bounded write/read/search run, result reported through the exit code.
async fn run_validation(config: &VultureConfig, backend: Arc<HttpBackend>) -> ExitCode {
    info!(
        cycles = config.validation_cycles,
        tenant = %config.tenant,
        "starting validation run"
    );
    let service = ValidationService::new(ValidationConfig::from_config(config), RealClock);
    let result = service
        .run(backend.clone(), backend.as_ref(), backend.as_ref())
        .await;

    for failure in &result.failures {
        warn!(
            trace_id = %failure.trace_id,
            cycle = failure.cycle,
            phase = failure.phase.as_str(),
            error = %failure.error,
            "validation failure"
        );
    }
    info!(
        total = result.total_traces,
        succeeded = result.success_count,
        failed = result.failures.len(),
        elapsed = ?result.duration,
        "validation run finished"
    );
    if result.exit_code() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Continuous probe loops until SIGINT, counters logged on the way out.
async fn run_soak(config: VultureConfig, backend: Arc<HttpBackend>) -> ExitCode {
    info!(
        push = %config.push_endpoint,
        query = %config.query_endpoint,
        tenant = %config.tenant,
        "starting soak loops"
    );
    let vulture = Vulture::new(config, backend.clone(), backend.clone(), backend);
    let metrics = vulture.metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(vulture.run(shutdown_rx));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested, draining loops");
    let _ = shutdown_tx.send(true);
    if let Err(err) = runner.await {
        error!(%err, "probe loops aborted");
    }

    let snapshot = metrics.snapshot();
    info!(
        traces_inspected = snapshot.traces_inspected,
        errors = snapshot.error_total,
        "final counters"
    );
    for (label, count) in snapshot.labeled_counts() {
        info!(category = label, count, "error counter");
    }
    ExitCode::SUCCESS
}
