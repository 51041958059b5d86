//! Cycle orchestration
//!
//! One cycle is: connect, build the inventory, compile constraints, plan,
//! and (unless dry-running) execute. The scheduler wraps that in either a
//! one-shot run or a daemon loop with an interval, an optional startup
//! delay, SIGHUP-triggered config reload between cycles, and graceful
//! shutdown on SIGINT/SIGTERM.
//!
//! Nothing is persisted between cycles; every tick rediscovers the cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ProxmoxApi, ProxmoxClient};
use crate::cli;
use crate::config::{self, Settings};
use crate::constraints;
use crate::engine::plan::Plan;
use crate::engine::Planner;
use crate::executor::{ExecutionOptions, Executor, MoveResult};
use crate::inventory::{self, InventoryError};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("API request failed: {0}")]
    Api(#[from] ApiError),

    #[error("inventory failed: {0}")]
    Inventory(#[from] InventoryError),
}

impl CycleError {
    fn is_auth(&self) -> bool {
        matches!(
            self,
            CycleError::Api(ApiError::Auth(_))
                | CycleError::Inventory(InventoryError::Api(ApiError::Auth(_)))
        )
    }

    /// Process exit code for a one-shot run that failed with this error.
    pub fn exit_code(&self) -> i32 {
        if self.is_auth() {
            3
        } else {
            1
        }
    }
}

/// What one cycle produced.
pub struct CycleReport {
    pub plan: Plan,
    /// Per-move outcomes; empty when the plan was not executed.
    pub results: Vec<MoveResult>,
    pub executed: bool,
}

/// Run one cycle against a freshly connected client.
pub async fn run_cycle(
    settings: &Settings,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<CycleReport, CycleError> {
    let client = ProxmoxClient::connect(&settings.proxmox_api).await?;
    run_cycle_with(Arc::new(client), settings, dry_run, shutdown).await
}

/// Cycle body, generic over the API implementation so tests can drive it
/// with an in-memory cluster.
pub async fn run_cycle_with(
    api: Arc<dyn ProxmoxApi>,
    settings: &Settings,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<CycleReport, CycleError> {
    let cluster = inventory::build_cluster(api.as_ref(), settings).await?;
    for line in cli::node_metrics_lines(&cluster, None) {
        debug!("Node usage before: {line}");
    }

    let compiled = constraints::compile(&cluster, &settings.balancing);
    let planner = Planner::new(
        &cluster,
        &compiled,
        &settings.balancing,
        settings.proxmox_cluster.overprovisioning,
    );
    let plan = planner.plan();

    for warning in &plan.warnings {
        match warning.vmid {
            Some(vmid) => warn!("Placement: guest {vmid}: {}", warning.message),
            None => warn!("Placement: {}", warning.message),
        }
    }
    for line in cli::node_metrics_lines(&cluster, Some(&plan)) {
        debug!("Node usage after plan: {line}");
    }
    info!(
        "Planned {} move(s); spread {:.2}% -> {:.2}%",
        plan.moves.len(),
        plan.spread_before,
        plan.spread_after
    );

    if dry_run || !settings.balancing.enable || plan.is_empty() {
        if !settings.balancing.enable {
            info!("Balancing is disabled; not executing the plan");
        }
        return Ok(CycleReport { plan, results: vec![], executed: false });
    }

    let executor = Executor::new(api, ExecutionOptions::from_settings(&settings.balancing));
    let results = executor.execute(&plan, &cluster, shutdown).await;
    Ok(CycleReport { plan, results, executed: true })
}

/// Resolve the best destination node for a new guest (`--best-node`).
pub async fn best_node(settings: &Settings) -> Result<Option<String>, CycleError> {
    let client = ProxmoxClient::connect(&settings.proxmox_api).await?;
    best_node_with(Arc::new(client), settings).await
}

pub async fn best_node_with(
    api: Arc<dyn ProxmoxApi>,
    settings: &Settings,
) -> Result<Option<String>, CycleError> {
    let cluster = inventory::build_cluster(api.as_ref(), settings).await?;
    let compiled = constraints::compile(&cluster, &settings.balancing);
    let planner = Planner::new(
        &cluster,
        &compiled,
        &settings.balancing,
        settings.proxmox_cluster.overprovisioning,
    );
    Ok(planner.best_node())
}

/// Top-level run loop.
pub struct Scheduler {
    config_path: PathBuf,
    dry_run: bool,
    json: bool,
}

impl Scheduler {
    pub fn new(config_path: PathBuf, dry_run: bool, json: bool) -> Self {
        Self { config_path, dry_run, json }
    }

    /// Run until done (one-shot) or until a shutdown signal (daemon).
    /// Returns the process exit code.
    pub async fn run(&self, mut settings: Settings) -> i32 {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_shutdown_listener(shutdown_tx.clone());

        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot install SIGHUP handler: {e}");
                return 1;
            }
        };

        if let Some(delay) = &settings.service.delay {
            if delay.enable {
                info!("Delaying first cycle by {} seconds", delay.as_secs());
                let mut rx = shutdown_rx.clone();
                tokio::select! {
                    _ = sleep(Duration::from_secs(delay.as_secs())) => {}
                    _ = rx.changed() => {
                        info!("Shutdown requested during startup delay");
                        return 0;
                    }
                }
            }
        }

        loop {
            match run_cycle(&settings, self.dry_run, shutdown_rx.clone()).await {
                Ok(report) => self.emit(&report),
                Err(e) => {
                    error!("Cycle failed: {e}");
                    if !settings.service.daemon {
                        return e.exit_code();
                    }
                }
            }

            if !settings.service.daemon {
                debug!("Daemon mode not active, stopping");
                return 0;
            }
            if *shutdown_rx.borrow() {
                info!("Shutdown requested, stopping");
                return 0;
            }

            let interval_secs = settings.service.schedule.as_secs();
            let next_run = Utc::now() + chrono::Duration::seconds(interval_secs as i64);
            info!(
                "Daemon mode active: next cycle in {} {} (around {})",
                settings.service.schedule.interval,
                match settings.service.schedule.format {
                    config::ScheduleFormat::Hours => "hour(s)",
                    config::ScheduleFormat::Minutes => "minute(s)",
                },
                next_run.format("%Y-%m-%d %H:%M:%S UTC")
            );
            let deadline = Instant::now() + Duration::from_secs(interval_secs);
            let mut reload_requested = false;
            let mut rx = shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    _ = sighup.recv() => {
                        info!("Received SIGHUP; configuration reloads before the next cycle");
                        reload_requested = true;
                    }
                    _ = rx.changed() => {
                        info!("Shutdown requested, stopping");
                        return 0;
                    }
                }
            }

            if reload_requested {
                match config::load(&self.config_path) {
                    Ok(fresh) => {
                        info!("Configuration reloaded");
                        settings = fresh;
                    }
                    Err(e) => warn!("Reload failed, keeping previous configuration: {e}"),
                }
            }
        }
    }

    fn emit(&self, report: &CycleReport) {
        if self.json {
            match serde_json::to_string_pretty(&report.plan.to_json()) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Cannot serialize plan: {e}"),
            }
        } else if self.dry_run {
            print!("{}", cli::format_plan(&report.plan));
        } else {
            for line in cli::format_plan(&report.plan).lines() {
                info!("{}", line.trim_start());
            }
        }
        if report.executed && !self.json {
            for line in cli::format_results(&report.results).lines() {
                info!("{}", line.trim_start());
            }
        }
    }
}

/// SIGINT and SIGTERM both request a graceful stop: no new dispatch, wait
/// for in-flight migrations within their deadline, then exit.
fn spawn_shutdown_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        }
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_map_to_exit_code_3() {
        let auth = CycleError::Api(ApiError::Auth("rejected".to_string()));
        assert_eq!(auth.exit_code(), 3);

        let wrapped =
            CycleError::Inventory(InventoryError::Api(ApiError::Auth("rejected".to_string())));
        assert_eq!(wrapped.exit_code(), 3);
    }

    #[test]
    fn test_other_errors_map_to_exit_code_1() {
        let transport = CycleError::Api(ApiError::Transport("connection reset".to_string()));
        assert_eq!(transport.exit_code(), 1);

        let inventory = CycleError::Inventory(InventoryError::DuplicateGuest(100));
        assert_eq!(inventory.exit_code(), 1);
    }
}
