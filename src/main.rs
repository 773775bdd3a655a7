//! Tracker-pattern auto-update service: binary entrypoint.
//! Boots the Axum HTTP server, the per-source poll tasks and the orchestrator.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pixeltrace_autoupdate::api::{self, AppState};
use pixeltrace_autoupdate::metrics::Metrics;
use pixeltrace_autoupdate::{assemble, start, AutoUpdateConfig};

/// Component targets at info, everything else at warn.
const DEFAULT_LOG_FILTER: &str =
    "monitor=info,validate=info,ledger=info,engine=info,health=info,orchestrator=info,api=info,warn";

/// Compact logs by default; `AUTOUPDATE_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("AUTOUPDATE_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    // the runtime may already have installed a subscriber
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        let _ = registry.with(fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(fmt::layer().compact()).try_init();
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AutoUpdateConfig::load_default()?;
    let metrics = Metrics::init().map_err(anyhow::Error::from)?;

    let parts = assemble(&cfg, None)?;
    let running = start(parts);
    tracing::info!(
        target: "orchestrator",
        sources = cfg.sources.len(),
        auto_update = cfg.auto_update_enabled,
        emergency_stop = cfg.emergency_stop,
        "auto-update pipeline started"
    );

    let state = AppState::new(running.handle.clone());
    let router = api::router(state).merge(metrics.router());

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        running.shutdown().await;
    });

    Ok(router.into())
}
