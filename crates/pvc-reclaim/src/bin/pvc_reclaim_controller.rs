/*
 * 5D Labs PVC Reclaim - Kubernetes Controller for PersistentVolumeClaim Recovery
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! PVC Reclaim Controller - Kubernetes controller for `PVCReclaim` records
//!
//! This service:
//! - Mirrors every Bound `PersistentVolumeClaim` into a `PVCReclaim`
//! - Restores a deleted claim onto its Released volume when `restore` is set
//! - Serves `/health` and `/ready` for the kubelet probes

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use pvc_reclaim::tasks::config::LogFormat;
use pvc_reclaim::tasks::run_reclaim_controllers;
use pvc_reclaim::tasks::simulate::{run_rejected_restore_scenario, run_restore_scenario};
use pvc_reclaim::{ControllerConfig, PVCReclaim};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "pvc-reclaim-controller",
    version,
    about = "Recover deleted PersistentVolumeClaims onto their Released PersistentVolumes"
)]
struct Cli {
    /// Controller configuration file
    #[arg(
        long,
        global = true,
        env = "RECLAIM_CONFIG_PATH",
        default_value = "/config/config.yaml"
    )]
    config: PathBuf,

    /// Restrict claims and records to a single namespace
    #[arg(long, global = true, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the controllers and the health server (default)
    Run,
    /// Print the PVCReclaim CustomResourceDefinition as YAML
    Crd,
    /// Run the reclaim lifecycle against an in-memory store and print the report
    Simulate,
}

#[derive(Clone)]
struct AppState {
    controllers_running: Arc<AtomicBool>,
    config: Arc<ControllerConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&PVCReclaim::crd())?);
            Ok(())
        }
        Command::Simulate => {
            load_controller_config(&cli);
            let reports = vec![
                run_restore_scenario().await?,
                run_rejected_restore_scenario().await?,
            ];
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Command::Run => run(load_controller_config(&cli)).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    // stdout is reserved for `crd` and `simulate` output
    // try_init: tests load config more than once per process
    let _ = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
}

/// Read the mounted config, falling back to defaults when it is missing,
/// unreadable or invalid. Tracing is initialised here since its format is
/// part of the config.
fn load_controller_config(cli: &Cli) -> ControllerConfig {
    let loaded = ControllerConfig::from_mounted_file(&cli.config);
    let mut config = loaded.as_ref().map_or_else(|_| ControllerConfig::default(), Clone::clone);
    if cli.namespace.is_some() {
        config.namespace.clone_from(&cli.namespace);
    }
    init_tracing(config.logging.format);

    match loaded {
        Ok(_) => info!("Loaded controller configuration from {}", cli.config.display()),
        Err(err) => warn!(
            "Failed to load configuration from {}: {err:#}. Using defaults.",
            cli.config.display()
        ),
    }

    if let Err(err) = config.validate() {
        warn!("Invalid controller configuration: {err:#}. Using defaults.");
        config = ControllerConfig {
            namespace: config.namespace.filter(|ns| !ns.trim().is_empty()),
            ..ControllerConfig::default()
        };
    }
    config
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    info!(
        "Starting PVC Reclaim Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "Connected to Kubernetes cluster"
    );

    let controllers_running = Arc::new(AtomicBool::new(true));
    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        let running = controllers_running.clone();
        tokio::spawn(async move {
            if let Err(e) = run_reclaim_controllers(client, config).await {
                error!("Controller error: {}", e);
            }
            running.store(false, Ordering::SeqCst);
        })
    };

    let state = AppState {
        controllers_running,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            ),
        )
        .with_state(state);

    let bind_address = &config.server.bind_address;
    let listener = tokio::net::TcpListener::bind(bind_address.as_str())
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Controller HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("PVC Reclaim Controller stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "pvc-reclaim-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.controllers_running.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "pvc-reclaim-controller",
        "namespace": state.config.namespace,
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_mounted_config_path() {
        let cli = Cli::try_parse_from(["pvc-reclaim-controller"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/config/config.yaml"));
        assert_eq!(cli.command, None);
    }

    #[test]
    fn namespace_flag_overrides_config() {
        let cli = Cli::try_parse_from([
            "pvc-reclaim-controller",
            "--config",
            "/nonexistent/config.yaml",
            "run",
            "--namespace",
            "storage",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Command::Run));
        let config = load_controller_config(&cli);
        assert_eq!(config.namespace.as_deref(), Some("storage"));
        assert_eq!(config.backoff, ControllerConfig::default().backoff);
    }
}
