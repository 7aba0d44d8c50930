mod cdp;
mod config;
mod driver;
mod pool;
mod router;
mod session;
mod stream;
#[cfg(test)]
mod testing;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cdp::CdpDriver;
use crate::web::AppState;

/// How often the pool is scanned for idle browsers.
const BROWSER_REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How often expired sessions are collected.
const SESSION_REAP_INTERVAL: Duration = Duration::from_secs(15 * 60);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/periscope.json");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    // Load configuration (JSON file + environment overrides)
    let mut config = config::load_config(&config_path)?;
    if let Some(port) = port_override {
        config.server.port = port;
    }

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    // First boot: persist the effective config so operators have a file to edit
    if config.storage.write_back && !config_path.exists() {
        match config::write_back(&config_path, &config) {
            Ok(()) => tracing::info!("Wrote effective config to {}", config_path.display()),
            Err(e) => tracing::warn!("Failed to write config back: {e}"),
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let state = Arc::new(AppState::new(config, CdpDriver::default()));

    // Background task: reap idle browsers (configurable timeout)
    let idle_timeout_ms = state.config.browser.idle_timeout_ms;
    if idle_timeout_ms > 0 {
        let idle_timeout = Duration::from_millis(idle_timeout_ms);
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(BROWSER_REAP_INTERVAL).await;
                let reaped = reaper_state.pool.reap_idle(idle_timeout).await;
                if reaped > 0 {
                    tracing::info!(reaped, "Idle browser reap pass complete");
                }
            }
        });
    } else {
        tracing::info!("Browser idle reaping disabled (idle_timeout_ms = 0)");
    }

    // Background task: reap expired sessions
    let session_reaper_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SESSION_REAP_INTERVAL).await;
            let reaped = session_reaper_state.sessions.reap_expired().await;
            if reaped > 0 {
                tracing::info!(reaped, "Session reap pass complete");
            }
        }
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!(
        "  Periscope Remote Browser Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // Graceful shutdown: every pooled browser is an external process
    tracing::info!("Closing browser pool...");
    state.pool.shutdown().await;
    tracing::info!("Periscope shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
