//! Migration executor
//!
//! Takes the engine's [`Plan`] and drives it against the hypervisor:
//! dispatch a migration, watch its task until a terminal state or the
//! per-job deadline, report the outcome. Sequential mode runs one job at a
//! time; parallel mode keeps a bounded number in flight, always dispatching
//! in plan order. Plans never contain dependent moves, so completion order
//! does not matter.
//!
//! A per-move failure never aborts the rest of the plan; cancellation stops
//! new dispatch and lets in-flight jobs finish within their deadline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::api::types::{MigrateOptions, Upid};
use crate::api::ProxmoxApi;
use crate::config::BalancingSettings;
use crate::engine::plan::{Move, Plan};
use crate::inventory::model::{Cluster, GuestKind};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Carried in failure outcomes; the upstream message is preserved for
/// debug output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MigrationError(pub String);

/// Terminal state of one move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Succeeded,
    Failed(MigrationError),
    /// The job outlived `max_job_validation`; it keeps running on the
    /// hypervisor but is no longer watched.
    TimedOut,
    /// Never dispatched because the executor was cancelled.
    Cancelled,
    /// Never dispatched for a non-cancellation reason.
    Skipped(String),
}

/// Outcome of one plan entry, in plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    pub vmid: u32,
    pub outcome: MoveOutcome,
}

/// A migration task id, possibly wrapped by an HA parent task whose real
/// worker is a child task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobHandle {
    Direct(String),
    HaWrapped { parent: String, child: Option<String> },
}

impl JobHandle {
    pub fn from_upid(upid: String) -> Self {
        match Upid::parse(&upid) {
            Some(parsed) if parsed.is_ha_task() => {
                JobHandle::HaWrapped { parent: upid, child: None }
            }
            _ => JobHandle::Direct(upid),
        }
    }

    /// The task currently worth polling: the resolved child when there is
    /// one, the parent otherwise.
    pub fn worker(&self) -> &str {
        match self {
            JobHandle::Direct(upid) => upid,
            JobHandle::HaWrapped { parent, child } => child.as_deref().unwrap_or(parent),
        }
    }
}

/// Execution policy, lifted from the balancing configuration.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub parallel: bool,
    pub parallel_jobs: usize,
    pub live: bool,
    pub with_local_disks: bool,
    pub with_conntrack_state: bool,
    pub max_job_validation: Duration,
}

impl ExecutionOptions {
    pub fn from_settings(balancing: &BalancingSettings) -> Self {
        Self {
            parallel: balancing.parallel,
            parallel_jobs: balancing.parallel_jobs.max(1),
            live: balancing.live,
            with_local_disks: balancing.with_local_disks,
            with_conntrack_state: balancing.with_conntrack_state,
            max_job_validation: Duration::from_secs(balancing.max_job_validation),
        }
    }

    fn in_flight_limit(&self) -> usize {
        if self.parallel {
            self.parallel_jobs
        } else {
            1
        }
    }
}

/// Drives one plan to completion.
pub struct Executor {
    api: Arc<dyn ProxmoxApi>,
    options: ExecutionOptions,
}

impl Executor {
    pub fn new(api: Arc<dyn ProxmoxApi>, options: ExecutionOptions) -> Self {
        Self { api, options }
    }

    /// Execute the plan. Returns one result per move, in plan order.
    /// Flipping `shutdown` to `true` stops new dispatch; in-flight jobs
    /// are still awaited up to their deadline.
    pub async fn execute(
        &self,
        plan: &Plan,
        cluster: &Cluster,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<MoveResult> {
        let mut results: Vec<MoveResult> = plan
            .moves
            .iter()
            .map(|m| MoveResult { vmid: m.vmid, outcome: MoveOutcome::Cancelled })
            .collect();
        if plan.is_empty() {
            return results;
        }

        // Conntrack state transfer needs every node on PVE 9; otherwise
        // the flag is stripped for the whole cycle, with a single warning.
        let conntrack_ok = cluster.min_pve_major() >= 9;
        if self.options.with_conntrack_state && !conntrack_ok {
            warn!(
                "with_conntrack_state requires PVE 9 on all nodes (cluster minimum is {}); \
                 dropping the flag for this cycle",
                cluster.min_pve_major()
            );
        }

        let limit = self.options.in_flight_limit();
        debug!(
            "Executing {} move(s), {} mode, at most {limit} in flight",
            plan.moves.len(),
            if self.options.parallel { "parallel" } else { "sequential" },
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut jobs: JoinSet<(usize, MoveOutcome)> = JoinSet::new();
        let mut shutdown_rx = shutdown;

        for (index, mv) in plan.moves.iter().enumerate() {
            if *shutdown_rx.borrow() {
                info!("Cancellation requested, not dispatching remaining moves");
                break;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => {
                    info!("Cancellation requested, not dispatching remaining moves");
                    break;
                }
            };

            let api = Arc::clone(&self.api);
            let options = self.options.clone();
            let mv = mv.clone();
            let running = cluster.guest(mv.vmid).map(|g| g.running).unwrap_or(false);
            jobs.spawn(async move {
                let outcome = run_move(api, &mv, running, &options, conntrack_ok).await;
                drop(permit);
                (index, outcome)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index].outcome = outcome,
                Err(e) => error!("Migration worker task panicked: {e}"),
            }
        }

        for result in &results {
            match &result.outcome {
                MoveOutcome::Succeeded => info!("Guest {}: migration succeeded", result.vmid),
                MoveOutcome::Failed(e) => info!("Guest {}: migration failed: {e}", result.vmid),
                MoveOutcome::TimedOut => {
                    info!("Guest {}: migration timed out, job left running", result.vmid)
                }
                MoveOutcome::Cancelled => info!("Guest {}: migration cancelled", result.vmid),
                MoveOutcome::Skipped(reason) => {
                    info!("Guest {}: migration skipped: {reason}", result.vmid)
                }
            }
        }
        results
    }
}

/// Dispatch one move and watch it to a terminal state.
async fn run_move(
    api: Arc<dyn ProxmoxApi>,
    mv: &Move,
    running: bool,
    options: &ExecutionOptions,
    conntrack_ok: bool,
) -> MoveOutcome {
    if mv.from == mv.to {
        return MoveOutcome::Skipped("guest is already on the target node".to_string());
    }

    let online = running && options.live;
    let migrate_options = match mv.kind {
        GuestKind::Vm => MigrateOptions {
            online,
            with_local_disks: online && options.with_local_disks,
            with_conntrack_state: online && options.with_conntrack_state && conntrack_ok,
            restart: false,
        },
        // The API performs shutdown-move-start for containers.
        GuestKind::Ct => MigrateOptions { restart: true, ..Default::default() },
    };

    info!(
        "Migrating {} {} from {} to {}{}",
        mv.kind,
        mv.vmid,
        mv.from,
        mv.to,
        if online { " (live)" } else { "" }
    );

    let upid = match api
        .migrate(mv.kind, &mv.from, mv.vmid, &mv.to, &migrate_options)
        .await
    {
        Ok(upid) => upid,
        Err(e) => {
            error!(
                "Failed to start migration of guest {}; the resource may be locked",
                mv.vmid
            );
            debug!("Migration dispatch error for guest {}: {e}", mv.vmid);
            return MoveOutcome::Failed(MigrationError(e.to_string()));
        }
    };

    poll_job(api.as_ref(), &mv.from, upid, options.max_job_validation).await
}

/// Poll a task at 1 Hz until it stops or the deadline passes. HA-wrapped
/// parents are resolved to their child worker as soon as it appears.
async fn poll_job(
    api: &dyn ProxmoxApi,
    node: &str,
    upid: String,
    deadline: Duration,
) -> MoveOutcome {
    let started = Instant::now();
    let mut handle = JobHandle::from_upid(upid);

    loop {
        if started.elapsed() >= deadline {
            warn!(
                "Job {} exceeded max_job_validation ({}s); leaving it running unwatched",
                handle.worker(),
                deadline.as_secs()
            );
            return MoveOutcome::TimedOut;
        }

        if let JobHandle::HaWrapped { parent, child } = &mut handle {
            if child.is_none() {
                match api.task_children(node, parent).await {
                    Ok(children) => {
                        if let Some(worker) = children.first() {
                            debug!("Resolved HA task {parent} to worker {}", worker.upid);
                            *child = Some(worker.upid.clone());
                        }
                    }
                    Err(e) => debug!("Could not resolve HA child of {parent} yet: {e}"),
                }
            }
        }

        match api.task_status(node, handle.worker()).await {
            Ok(status) if status.is_stopped() => {
                return if status.succeeded() {
                    MoveOutcome::Succeeded
                } else {
                    let reason = status
                        .exitstatus
                        .unwrap_or_else(|| "unknown error".to_string());
                    MoveOutcome::Failed(MigrationError(reason))
                };
            }
            Ok(_) => debug!("Job {} still running", handle.worker()),
            // Transient poll failures are absorbed; the deadline bounds us.
            Err(e) => debug!("Status poll for {} failed: {e}", handle.worker()),
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::GuestListing;
    use crate::api::types::{
        ApiNode, GuestConfig, HaStatusEntry, RrdSample, TaskRef, TaskStatusInfo, VersionInfo,
    };
    use crate::api::ApiError;
    use crate::engine::plan::MoveReason;
    use crate::inventory::model::{Dimension, Guest, Mode, Node};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Mock hypervisor: migrations complete after a fixed number of polls.
    struct MockApi {
        polls_until_done: usize,
        fail_dispatch: AtomicBool,
        exitstatus: Mutex<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        dispatched: Mutex<Vec<u32>>,
        poll_counts: Mutex<HashMap<String, usize>>,
        ha_wrap: AtomicBool,
    }

    impl MockApi {
        fn new(polls_until_done: usize) -> Self {
            Self {
                polls_until_done,
                fail_dispatch: AtomicBool::new(false),
                exitstatus: Mutex::new("OK".to_string()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                dispatched: Mutex::new(vec![]),
                poll_counts: Mutex::new(HashMap::new()),
                ha_wrap: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ProxmoxApi for MockApi {
        async fn version(&self) -> Result<VersionInfo, ApiError> {
            Ok(VersionInfo { version: "8.2.4".to_string(), release: None })
        }

        async fn list_nodes(&self) -> Result<Vec<ApiNode>, ApiError> {
            Ok(vec![])
        }

        async fn list_guests(&self, _node: &str) -> Result<Vec<GuestListing>, ApiError> {
            Ok(vec![])
        }

        async fn guest_config(
            &self,
            _kind: GuestKind,
            _node: &str,
            _vmid: u32,
        ) -> Result<GuestConfig, ApiError> {
            Err(ApiError::Api { status: 500, message: "unused".to_string() })
        }

        async fn guest_rrd(
            &self,
            _kind: GuestKind,
            _node: &str,
            _vmid: u32,
        ) -> Result<Vec<RrdSample>, ApiError> {
            Ok(vec![])
        }

        async fn ha_status(&self) -> Result<Vec<HaStatusEntry>, ApiError> {
            Ok(vec![])
        }

        async fn pool_members(&self, _pool: &str) -> Result<Vec<u32>, ApiError> {
            Ok(vec![])
        }

        async fn migrate(
            &self,
            kind: GuestKind,
            node: &str,
            vmid: u32,
            _target: &str,
            _options: &MigrateOptions,
        ) -> Result<String, ApiError> {
            if self.fail_dispatch.load(Ordering::SeqCst) {
                return Err(ApiError::Api {
                    status: 500,
                    message: "guest is locked".to_string(),
                });
            }
            self.dispatched.lock().unwrap().push(vmid);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let task_type = if self.ha_wrap.load(Ordering::SeqCst) {
                "hamigrate"
            } else if kind == GuestKind::Vm {
                "qmigrate"
            } else {
                "vzmigrate"
            };
            Ok(format!(
                "UPID:{node}:0000{vmid:04X}:00000001:00000001:{task_type}:{vmid}:root@pam:"
            ))
        }

        async fn task_status(&self, _node: &str, upid: &str) -> Result<TaskStatusInfo, ApiError> {
            let mut counts = self.poll_counts.lock().unwrap();
            let seen = counts.entry(upid.to_string()).or_insert(0);
            *seen += 1;
            if *seen >= self.polls_until_done {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskStatusInfo {
                    status: "stopped".to_string(),
                    exitstatus: Some(self.exitstatus.lock().unwrap().clone()),
                })
            } else {
                Ok(TaskStatusInfo { status: "running".to_string(), exitstatus: None })
            }
        }

        async fn task_children(&self, _node: &str, upid: &str) -> Result<Vec<TaskRef>, ApiError> {
            let parent = Upid::parse(upid).unwrap();
            Ok(vec![TaskRef {
                upid: format!(
                    "UPID:{}:00000002:00000002:00000002:qmigrate:{}:root@pam:",
                    parent.node, parent.id
                ),
                task_type: "qmigrate".to_string(),
                id: Some(parent.id),
                starttime: Some(2),
            }])
        }
    }

    fn node(name: &str, pve_major: u32) -> Node {
        Node {
            name: name.to_string(),
            pve_major,
            maintenance: false,
            cpu_total: 16.0,
            cpu_used: 2.0,
            cpu_assigned: 8.0,
            memory_total: 64 * GIB,
            memory_used: 16 * GIB,
            memory_assigned: 32 * GIB,
            disk_total: 500 * GIB,
            disk_used: 50 * GIB,
            disk_assigned: 100 * GIB,
            reserved_memory: 0,
            psi: None,
        }
    }

    fn guest(vmid: u32, on: &str, running: bool) -> Guest {
        Guest {
            vmid,
            name: format!("guest{vmid}"),
            kind: GuestKind::Vm,
            node: on.to_string(),
            running,
            cpu_cores: 2,
            cpu_used: 0.5,
            memory_assigned: 4 * GIB,
            memory_used: 2 * GIB,
            disk_assigned: 16 * GIB,
            disk_used: 4 * GIB,
            tags: vec![],
            pool: None,
            disks: vec![],
            locked: false,
            ignored: false,
            psi: None,
        }
    }

    fn test_cluster(vmids: &[u32]) -> Cluster {
        Cluster::new(
            vec![node("pve01", 8), node("pve02", 8)],
            vmids.iter().map(|&v| guest(v, "pve01", true)).collect(),
        )
    }

    fn plan_of(vmids: &[u32]) -> Plan {
        Plan {
            moves: vmids
                .iter()
                .map(|&vmid| Move {
                    vmid,
                    kind: GuestKind::Vm,
                    from: "pve01".to_string(),
                    to: "pve02".to_string(),
                    weight: 2 * GIB,
                    dimension: Dimension::Memory,
                    reason: MoveReason::Rebalance,
                })
                .collect(),
            spread_before: 30.0,
            spread_after: 5.0,
            method: Dimension::Memory,
            mode: Mode::Used,
            warnings: vec![],
        }
    }

    fn options(parallel: bool, jobs: usize) -> ExecutionOptions {
        ExecutionOptions {
            parallel,
            parallel_jobs: jobs,
            live: true,
            with_local_disks: true,
            with_conntrack_state: false,
            max_job_validation: Duration::from_secs(600),
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_execution_succeeds_in_order() {
        let api = Arc::new(MockApi::new(3));
        let executor = Executor::new(api.clone(), options(false, 5));
        let plan = plan_of(&[100, 101, 102]);
        let cluster = test_cluster(&[100, 101, 102]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;

        assert!(results.iter().all(|r| r.outcome == MoveOutcome::Succeeded));
        assert_eq!(*api.dispatched.lock().unwrap(), vec![100, 101, 102]);
        // Sequential mode never overlaps jobs.
        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_bound_is_respected() {
        let api = Arc::new(MockApi::new(4));
        let executor = Executor::new(api.clone(), options(true, 3));
        let plan = plan_of(&[1, 2, 3, 4, 5, 6, 7]);
        let cluster = test_cluster(&[1, 2, 3, 4, 5, 6, 7]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;

        assert!(results.iter().all(|r| r.outcome == MoveOutcome::Succeeded));
        assert!(api.max_in_flight.load(Ordering::SeqCst) <= 3);
        // Dispatch order still follows the plan.
        assert_eq!(*api.dispatched.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_does_not_abort_plan() {
        let api = Arc::new(MockApi::new(1));
        api.fail_dispatch.store(true, Ordering::SeqCst);
        let executor = Executor::new(api.clone(), options(false, 1));
        let plan = plan_of(&[100, 101]);
        let cluster = test_cluster(&[100, 101]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;

        // Both moves were attempted and both report the upstream failure.
        assert_eq!(results.len(), 2);
        for r in &results {
            match &r.outcome {
                MoveOutcome::Failed(e) => assert!(e.0.contains("locked")),
                other => panic!("expected Failed, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_exitstatus_reported() {
        let api = Arc::new(MockApi::new(2));
        *api.exitstatus.lock().unwrap() = "migration aborted".to_string();
        let executor = Executor::new(api.clone(), options(false, 1));
        let plan = plan_of(&[100]);
        let cluster = test_cluster(&[100]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;
        assert_eq!(
            results[0].outcome,
            MoveOutcome::Failed(MigrationError("migration aborted".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout() {
        // Job "finishes" only after 10_000 polls; deadline is 5 seconds.
        let api = Arc::new(MockApi::new(10_000));
        let mut opts = options(false, 1);
        opts.max_job_validation = Duration::from_secs(5);
        let executor = Executor::new(api.clone(), opts);
        let plan = plan_of(&[100]);
        let cluster = test_cluster(&[100]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;
        assert_eq!(results[0].outcome, MoveOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_new_dispatch() {
        let api = Arc::new(MockApi::new(5));
        let executor = Executor::new(api.clone(), options(false, 1));
        let plan = plan_of(&[100, 101, 102]);
        let cluster = test_cluster(&[100, 101, 102]);

        let (tx, rx) = watch::channel(false);
        let exec = async { executor.execute(&plan, &cluster, rx).await };
        let cancel = async {
            // Let the first job start, then cancel.
            sleep(Duration::from_millis(1500)).await;
            let _ = tx.send(true);
            tx
        };
        let (results, _tx) = tokio::join!(exec, cancel);

        // First move ran to completion; later moves were never dispatched.
        assert_eq!(results[0].outcome, MoveOutcome::Succeeded);
        assert!(results[1..]
            .iter()
            .all(|r| r.outcome == MoveOutcome::Cancelled));
        assert_eq!(api.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ha_wrapped_job_resolves_child() {
        let api = Arc::new(MockApi::new(2));
        api.ha_wrap.store(true, Ordering::SeqCst);
        let executor = Executor::new(api.clone(), options(false, 1));
        let plan = plan_of(&[100]);
        let cluster = test_cluster(&[100]);

        let results = executor.execute(&plan, &cluster, no_shutdown()).await;
        assert_eq!(results[0].outcome, MoveOutcome::Succeeded);

        // The polled task is the child worker, not the HA parent.
        let counts = api.poll_counts.lock().unwrap();
        assert!(counts.keys().all(|upid| upid.contains("qmigrate")));
    }

    #[test]
    fn test_job_handle_classification() {
        let direct = JobHandle::from_upid(
            "UPID:pve01:00000001:00000001:00000001:qmigrate:100:root@pam:".to_string(),
        );
        assert!(matches!(direct, JobHandle::Direct(_)));

        let wrapped = JobHandle::from_upid(
            "UPID:pve01:00000001:00000001:00000001:hamigrate:100:root@pam:".to_string(),
        );
        match &wrapped {
            JobHandle::HaWrapped { parent, child } => {
                assert!(child.is_none());
                assert_eq!(wrapped.worker(), parent);
            }
            JobHandle::Direct(_) => panic!("expected HA wrap"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_returns_no_results() {
        let api = Arc::new(MockApi::new(1));
        let executor = Executor::new(api, options(true, 3));
        let plan = plan_of(&[]);
        let cluster = test_cluster(&[]);
        let results = executor.execute(&plan, &cluster, no_shutdown()).await;
        assert!(results.is_empty());
    }
}
