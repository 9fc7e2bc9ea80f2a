//! Cluster Controller - sole authority over one cluster's state
//!
//! The controller is responsible for:
//! - Bootstrapping the scheduler and initial workers from templates
//! - Serializing manual and adaptive resizes behind one mutation lock
//! - Starting, replacing and stopping the adaptive loop
//! - Publishing a lock-free status snapshot after every mutation
//! - Tearing every unit down on close
//!
//! Lock order is always adaptive slot, then state. The adaptive loop only
//! ever takes the state lock, so stopping it while holding the slot is safe.

use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adaptive::{
    evaluate_scaling, spawn_adaptive, AdaptiveHandle, AdaptivePolicy, AdaptiveState,
    ScalingDecision,
};
use super::state::{AdaptiveBounds, ClusterState, ClusterStatus, StatusSnapshot};
use crate::config::{ClusterConfig, ConfigError, TemplateError, UnitKind, WorkloadTemplate};
use crate::orchestrator::{OrchestratorError, SharedOrchestrator, UnitHandle, UnitOverrides};
use crate::scheduler::{PluginRegistration, SchedulerError, SchedulerLoad, SharedSchedulerClient};

/// Environment variable carrying the scheduler address into worker units
pub const SCHEDULER_ADDRESS_ENV: &str = "DASK_SCHEDULER_ADDRESS";

/// Errors that can occur in the cluster controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Cluster is closed")]
    Closed,
}

impl ControllerError {
    /// Stable tag reported to control-surface callers
    pub fn tag(&self) -> &'static str {
        match self {
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::Template(_) => "TemplateError",
            ControllerError::NotReady(_) => "NotReady",
            ControllerError::Orchestrator(_) => "OrchestratorError",
            ControllerError::Scheduler(_) => "SchedulerError",
            ControllerError::Closed => "Closed",
        }
    }
}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::TemplateError(e) => ControllerError::Template(e),
            other => ControllerError::InvalidConfig(other.to_string()),
        }
    }
}

/// The scheduler and worker templates of one cluster
#[derive(Debug, Clone)]
pub struct TemplatePair {
    pub scheduler: WorkloadTemplate,
    pub worker: WorkloadTemplate,
}

impl TemplatePair {
    pub fn new(scheduler: WorkloadTemplate, worker: WorkloadTemplate) -> Self {
        Self { scheduler, worker }
    }

    fn validate(&self) -> Result<(), TemplateError> {
        for (template, expected) in [
            (&self.scheduler, UnitKind::Scheduler),
            (&self.worker, UnitKind::Worker),
        ] {
            if template.kind() != expected {
                return Err(TemplateError::InvalidField {
                    field: "kind".to_string(),
                    reason: format!("expected a {} template, got {}", expected, template.kind()),
                });
            }
        }
        Ok(())
    }
}

/// Lifecycle controller for one elastic cluster
#[derive(Clone)]
pub struct ClusterController {
    config: Arc<ClusterConfig>,
    templates: Arc<TemplatePair>,
    orchestrator: SharedOrchestrator,
    scheduler: SharedSchedulerClient,

    /// The mutation lock and the state it guards
    state: Arc<Mutex<ClusterState>>,

    /// Latest published snapshot, read without the lock
    snapshot: Arc<watch::Sender<StatusSnapshot>>,

    /// The adaptive loop, if one is active
    adaptive: Arc<Mutex<Option<AdaptiveHandle>>>,

    /// Background bootstrap and readiness tasks
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl ClusterController {
    /// Create a cluster.
    ///
    /// With a non-zero initial worker count the scheduler unit is created
    /// before returning; otherwise its creation waits for the first scale.
    /// Worker creation, scheduler readiness and start-time adaptive mode
    /// continue in supervised background tasks whose failures surface as
    /// [`ClusterStatus::Failed`].
    pub async fn create(
        config: ClusterConfig,
        templates: TemplatePair,
        orchestrator: SharedOrchestrator,
        scheduler: SharedSchedulerClient,
    ) -> Result<Self, ControllerError> {
        if config.name.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "cluster name must not be empty".to_string(),
            ));
        }
        config.validate()?;
        templates.validate()?;

        let state = ClusterState::new(
            config.name.clone(),
            config.namespace.clone(),
            config.dashboard_link.clone(),
        );
        let (snapshot, _) = watch::channel(state.snapshot());

        let controller = Self {
            config: Arc::new(config),
            templates: Arc::new(templates),
            orchestrator,
            scheduler,
            state: Arc::new(Mutex::new(state)),
            snapshot: Arc::new(snapshot),
            adaptive: Arc::new(Mutex::new(None)),
            tasks: Arc::new(StdMutex::new(Vec::new())),
        };

        info!(
            "Creating cluster {} in namespace {} on {} (initial workers: {}, scheduler: {})",
            controller.config.name,
            controller.config.namespace,
            controller.orchestrator.name(),
            controller.config.initial_workers,
            controller.config.scheduler_address()
        );

        let start_generation = {
            let mut state = controller.state.lock().await;
            state.status = ClusterStatus::Starting;
            if controller.config.initial_workers > 0 {
                controller.ensure_scheduler(&mut state).await?;
            }
            controller.publish(&state);
            state.adaptive_generation
        };

        if controller.config.initial_workers > 0 || controller.config.max_workers.is_some() {
            let ctrl = controller.clone();
            controller.supervise(tokio::spawn(async move {
                if let Err(e) = ctrl.bootstrap(start_generation).await {
                    ctrl.mark_failed("bootstrap", &e).await;
                }
            }));
        }

        Ok(controller)
    }

    /// Request the initial workers, then enter start-time adaptive mode.
    ///
    /// Every scale, adapt and close bumps the adaptive generation, so a
    /// generation other than `start_generation` means a caller already took
    /// over and bootstrap steps aside.
    async fn bootstrap(&self, start_generation: u64) -> Result<(), ControllerError> {
        let initial = self.config.initial_workers;
        if initial > 0 {
            let mut state = self.state.lock().await;
            if state.adaptive_generation != start_generation {
                info!("Skipping bootstrap of {}, cluster already resized", self.config.name);
                return Ok(());
            }
            Self::ensure_usable(&state)?;
            let result = self.resize_locked(&mut state, initial).await;
            self.publish(&state);
            result?;
        }

        if let Some(max) = self.config.max_workers {
            let bounds = AdaptiveBounds {
                minimum: initial,
                maximum: max,
            };
            let mut adaptive = self.adaptive.lock().await;
            {
                let state = self.state.lock().await;
                if state.adaptive_generation != start_generation {
                    info!(
                        "Skipping start-time adaptive mode of {}, cluster already resized",
                        self.config.name
                    );
                    return Ok(());
                }
                Self::ensure_usable(&state)?;
            }
            self.replace_adaptive(&mut adaptive, bounds).await?;
        }
        Ok(())
    }

    /// Current status, read without taking the mutation lock.
    ///
    /// May trail an in-flight mutation by at most that mutation.
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Resize the cluster to `target` workers, leaving adaptive mode.
    ///
    /// Not atomic: on an orchestrator failure the worker set reflects exactly
    /// the creates/destroys that succeeded.
    pub async fn scale(&self, target: i64) -> Result<StatusSnapshot, ControllerError> {
        if target < 0 {
            return Err(ControllerError::InvalidConfig(format!(
                "worker count must not be negative, got {}",
                target
            )));
        }
        let target = u32::try_from(target)
            .map_err(|_| ControllerError::InvalidConfig(format!("worker count {} too large", target)))?;
        if target > self.config.worker_limit {
            return Err(ControllerError::InvalidConfig(format!(
                "worker count {} exceeds the worker limit ({})",
                target, self.config.worker_limit
            )));
        }
        Self::ensure_usable_snapshot(&self.status())?;

        let mut adaptive = self.adaptive.lock().await;
        if let Some(handle) = adaptive.take() {
            info!(
                "Manual scale of {} overrides adaptive bounds {}",
                self.config.name,
                handle.bounds()
            );
            handle.stop().await;
        }

        let mut state = self.state.lock().await;
        Self::ensure_usable(&state)?;

        state.adaptive_bounds = None;
        state.adaptive_generation += 1;
        state.status = state.manual_status();

        let result = self.resize_locked(&mut state, target).await;
        if let Err(e) = &result {
            state.last_error = Some(e.to_string());
        }
        self.publish(&state);
        drop(adaptive);

        result.map(|_| state.snapshot())
    }

    /// Enter adaptive mode with the given bounds, replacing any active loop
    pub async fn adapt(&self, minimum: i64, maximum: i64) -> Result<StatusSnapshot, ControllerError> {
        if minimum < 0 || maximum < 0 {
            return Err(ControllerError::InvalidConfig(format!(
                "adaptive bounds must not be negative, got [{}, {}]",
                minimum, maximum
            )));
        }
        if minimum > maximum {
            return Err(ControllerError::InvalidConfig(format!(
                "minimum ({}) exceeds maximum ({})",
                minimum, maximum
            )));
        }
        let bounds = AdaptiveBounds {
            minimum: u32::try_from(minimum)
                .map_err(|_| ControllerError::InvalidConfig("minimum too large".to_string()))?,
            maximum: u32::try_from(maximum)
                .map_err(|_| ControllerError::InvalidConfig("maximum too large".to_string()))?,
        };
        if bounds.maximum > self.config.worker_limit {
            return Err(ControllerError::InvalidConfig(format!(
                "maximum ({}) exceeds the worker limit ({})",
                bounds.maximum, self.config.worker_limit
            )));
        }
        Self::ensure_usable_snapshot(&self.status())?;

        let mut adaptive = self.adaptive.lock().await;
        self.replace_adaptive(&mut adaptive, bounds).await
    }

    /// Stop the loop held in `slot` and start one for `bounds`.
    /// Caller holds the adaptive slot.
    async fn replace_adaptive(
        &self,
        slot: &mut Option<AdaptiveHandle>,
        bounds: AdaptiveBounds,
    ) -> Result<StatusSnapshot, ControllerError> {
        if let Some(previous) = slot.take() {
            debug!(
                "Replacing adaptive bounds {} with {}",
                previous.bounds(),
                bounds
            );
            previous.stop().await;
        }

        let mut state = self.state.lock().await;
        Self::ensure_usable(&state)?;

        state.adaptive_generation += 1;
        state.adaptive_bounds = Some(bounds);
        state.status = ClusterStatus::Adapting;
        let generation = state.adaptive_generation;
        self.publish(&state);
        let snapshot = state.snapshot();
        drop(state);

        info!("Cluster {} adapting within {}", self.config.name, bounds);
        *slot = Some(spawn_adaptive(
            self.clone(),
            generation,
            bounds,
            AdaptivePolicy::from(self.config.as_ref()),
        ));

        Ok(snapshot)
    }

    /// One reconciliation tick of the adaptive loop.
    ///
    /// Returns `false` once the loop has been superseded and should exit.
    pub(crate) async fn adaptive_tick(
        &self,
        generation: u64,
        bounds: AdaptiveBounds,
        policy: &AdaptivePolicy,
        adaptive_state: &mut AdaptiveState,
    ) -> bool {
        let load = match self.status().scheduler_address {
            Some(address) => match self.scheduler.load(&address).await {
                Ok(load) => load,
                Err(e) => {
                    warn!("Skipping adaptive tick, scheduler load unavailable: {}", e);
                    return true;
                }
            },
            // Nothing can be pending before the scheduler is up; hold the minimum.
            None => SchedulerLoad::default(),
        };

        let mut state = self.state.lock().await;
        if state.adaptive_generation != generation || state.status != ClusterStatus::Adapting {
            return false;
        }

        let current = state.worker_count();
        let target = match evaluate_scaling(policy, bounds, current, &load, adaptive_state) {
            ScalingDecision::NoChange => return true,
            ScalingDecision::ScaleUp {
                target_workers,
                reason,
            }
            | ScalingDecision::ScaleDown {
                target_workers,
                reason,
            } => {
                info!(
                    "Adaptive: {} -> {} workers ({})",
                    current, target_workers, reason
                );
                target_workers
            }
        };

        if let Err(e) = self.resize_locked(&mut state, target).await {
            warn!("Adaptive resize to {} failed: {}", target, e);
            state.last_error = Some(e.to_string());
        }
        self.publish(&state);
        true
    }

    /// Register a plugin with the scheduler over a transient session.
    ///
    /// The session is closed on every path, including a failed registration.
    pub async fn register_plugin(&self, name: &str) -> Result<String, ControllerError> {
        if name.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "plugin name must not be empty".to_string(),
            ));
        }
        let address = self.ready_scheduler_address()?;

        let registration = PluginRegistration {
            name: name.to_string(),
            target_scheduler_address: address.clone(),
        };

        let mut session = self.scheduler.connect(&address).await?;
        let result = session.register_plugin(&registration).await;
        session.close().await;

        match &result {
            Ok(_) => info!("Registered plugin {} with {}", name, address),
            Err(e) => warn!("Plugin {} registration failed: {}", name, e),
        }
        Ok(result?)
    }

    /// Metadata snapshot from the scheduler
    pub async fn scheduler_info(&self) -> Result<Value, ControllerError> {
        let address = self.ready_scheduler_address()?;
        Ok(self.scheduler.info(&address).await?)
    }

    /// Tear the cluster down.
    ///
    /// Stops the adaptive loop, waits for any in-flight mutation, then
    /// destroys every known unit on a best-effort basis.
    pub async fn close(&self) -> Result<StatusSnapshot, ControllerError> {
        let mut adaptive = self.adaptive.lock().await;
        if let Some(handle) = adaptive.take() {
            handle.stop().await;
        }

        let mut state = self.state.lock().await;
        if state.is_closed() {
            return Err(ControllerError::Closed);
        }

        info!("Closing cluster {}", self.config.name);
        state.status = ClusterStatus::Closed;
        state.adaptive_bounds = None;
        state.adaptive_generation += 1;
        self.publish(&state);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }

        let mut units = std::mem::take(&mut state.workers);
        units.extend(state.scheduler.take());
        let results = join_all(units.iter().map(|unit| self.orchestrator.destroy_unit(unit))).await;
        for (unit, result) in units.iter().zip(results) {
            match result {
                Ok(()) | Err(OrchestratorError::UnitNotFound(_)) => {}
                Err(e) => warn!("Failed to destroy {} unit {}: {}", unit.kind, unit.name, e),
            }
        }

        self.publish(&state);
        drop(adaptive);
        info!("Cluster {} closed", self.config.name);
        Ok(state.snapshot())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn publish(&self, state: &ClusterState) {
        self.snapshot.send_replace(state.snapshot());
    }

    fn supervise(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn ensure_usable(state: &ClusterState) -> Result<(), ControllerError> {
        match state.status {
            ClusterStatus::Closed => Err(ControllerError::Closed),
            ClusterStatus::Failed => Err(ControllerError::NotReady(format!(
                "cluster failed: {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_usable_snapshot(snapshot: &StatusSnapshot) -> Result<(), ControllerError> {
        match snapshot.status {
            ClusterStatus::Closed => Err(ControllerError::Closed),
            ClusterStatus::Failed => Err(ControllerError::NotReady(format!(
                "cluster failed: {}",
                snapshot.last_error.as_deref().unwrap_or("unknown error")
            ))),
            _ => Ok(()),
        }
    }

    fn ready_scheduler_address(&self) -> Result<String, ControllerError> {
        let snapshot = self.status();
        if snapshot.status == ClusterStatus::Closed {
            return Err(ControllerError::Closed);
        }
        snapshot.scheduler_address.ok_or_else(|| {
            ControllerError::NotReady("scheduler address not yet known".to_string())
        })
    }

    async fn mark_failed(&self, stage: &str, err: &ControllerError) {
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return;
        }
        error!("Cluster {} {} failed: {}", self.config.name, stage, err);
        state.status = ClusterStatus::Failed;
        state.last_error = Some(err.to_string());
        self.publish(&state);
    }

    /// Create the scheduler unit if it does not exist yet and watch for it to
    /// become ready
    async fn ensure_scheduler(&self, state: &mut ClusterState) -> Result<(), ControllerError> {
        if state.scheduler.is_some() {
            return Ok(());
        }

        let overrides = self
            .unit_overrides(UnitKind::Scheduler, format!("{}-scheduler", self.config.name))
            .with_hostname(self.config.scheduler_host());
        let handle = self
            .orchestrator
            .create_unit(&self.templates.scheduler, &overrides)
            .await?;
        info!("Scheduler unit {} requested", handle.name);
        state.scheduler = Some(handle.clone());

        let ctrl = self.clone();
        self.supervise(tokio::spawn(async move {
            ctrl.await_scheduler(handle).await;
        }));
        Ok(())
    }

    async fn await_scheduler(&self, handle: UnitHandle) {
        let result = self
            .orchestrator
            .wait_until_ready(&handle, self.config.ready_timeout)
            .await;

        match result {
            Ok(host) => {
                let mut state = self.state.lock().await;
                if state.is_closed() {
                    return;
                }
                let address = format!("tcp://{}:{}", host, self.config.scheduler_port);
                info!("Scheduler ready at {}", address);
                state.scheduler_address = Some(address);
                if matches!(state.status, ClusterStatus::Created | ClusterStatus::Starting) {
                    state.status = ClusterStatus::Running;
                }
                self.publish(&state);
            }
            Err(e) => self.mark_failed("scheduler startup", &e.into()).await,
        }
    }

    fn unit_overrides(&self, kind: UnitKind, name: String) -> UnitOverrides {
        UnitOverrides::new(name, self.config.namespace.clone())
            .with_label("cluster", self.config.name.clone())
            .with_label("component", kind.as_str())
            .with_label("namespace", self.config.namespace.clone())
    }

    fn worker_overrides(&self) -> UnitOverrides {
        let suffix = Uuid::new_v4().simple().to_string();
        self.unit_overrides(
            UnitKind::Worker,
            format!("{}-worker-{}", self.config.name, &suffix[..8]),
        )
        .with_env(SCHEDULER_ADDRESS_ENV, self.config.scheduler_address())
    }

    /// Bring the worker set to `target`. Caller holds the mutation lock.
    async fn resize_locked(
        &self,
        state: &mut ClusterState,
        target: u32,
    ) -> Result<(), ControllerError> {
        self.ensure_scheduler(state).await?;

        let current = state.worker_count();
        let mut first_error = None;

        if target > current {
            let orchestrator = &self.orchestrator;
            let template = &self.templates.worker;
            let creates = (current..target).map(|_| {
                let overrides = self.worker_overrides();
                async move { orchestrator.create_unit(template, &overrides).await }
            });

            for result in join_all(creates).await {
                match result {
                    Ok(handle) => state.workers.push(handle),
                    Err(e) => {
                        warn!("Worker creation failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        } else if target < current {
            // Newest workers go first
            let victims = state.workers.split_off(target as usize);
            let results =
                join_all(victims.iter().map(|unit| self.orchestrator.destroy_unit(unit))).await;

            for (unit, result) in victims.into_iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(OrchestratorError::UnitNotFound(name)) => {
                        debug!("Worker {} already gone", name);
                    }
                    Err(e) => {
                        warn!("Worker removal failed: {}", e);
                        state.workers.push(unit);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if current != state.worker_count() {
            info!(
                "Cluster {} workers: {} -> {} (target {})",
                self.config.name,
                current,
                state.worker_count(),
                target
            );
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::InMemoryOrchestrator;
    use crate::scheduler::mock::MockSchedulerClient;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn templates() -> TemplatePair {
        let worker = WorkloadTemplate::from_str(
            UnitKind::Worker,
            "spec:\n  containers:\n    - image: daskdev/dask\n      args: [dask-worker]\n",
        )
        .unwrap();
        let scheduler = WorkloadTemplate::scheduler_from_worker(&worker, 8786, None).unwrap();
        TemplatePair::new(scheduler, worker)
    }

    fn config(name: &str) -> ClusterConfig {
        ClusterConfig::new(name)
            .with_adapt_interval(Duration::from_secs(1))
            .with_scale_down_wait_count(1)
    }

    struct Harness {
        controller: ClusterController,
        orchestrator: InMemoryOrchestrator,
        scheduler: Arc<MockSchedulerClient>,
    }

    async fn harness_with(
        config: ClusterConfig,
        orchestrator: InMemoryOrchestrator,
        scheduler: MockSchedulerClient,
    ) -> Harness {
        let scheduler = Arc::new(scheduler);
        let controller = ClusterController::create(
            config,
            templates(),
            Arc::new(orchestrator.clone()),
            scheduler.clone(),
        )
        .await
        .unwrap();
        Harness {
            controller,
            orchestrator,
            scheduler,
        }
    }

    async fn harness(config: ClusterConfig) -> Harness {
        harness_with(config, InMemoryOrchestrator::new(), MockSchedulerClient::new()).await
    }

    /// Poll the snapshot until `check` holds (paused clock advances on sleep)
    async fn wait_for(controller: &ClusterController, check: impl Fn(&StatusSnapshot) -> bool) {
        for _ in 0..2000 {
            if check(&controller.status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, last status: {:?}", controller.status());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_name() {
        let result = ClusterController::create(
            ClusterConfig::default(),
            templates(),
            Arc::new(InMemoryOrchestrator::new()),
            Arc::new(MockSchedulerClient::new()),
        )
        .await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_swapped_templates() {
        let pair = templates();
        let swapped = TemplatePair::new(pair.worker.clone(), pair.scheduler.clone());
        let result = ClusterController::create(
            config("c1"),
            swapped,
            Arc::new(InMemoryOrchestrator::new()),
            Arc::new(MockSchedulerClient::new()),
        )
        .await;
        assert!(matches!(result, Err(ControllerError::Template(_))));
    }

    #[tokio::test]
    async fn test_create_without_workers_defers_scheduler() {
        let h = harness(config("c1")).await;

        let status = h.controller.status();
        assert_eq!(status.status, ClusterStatus::Starting);
        assert_eq!(status.workers, 0);
        assert!(status.scheduler_address.is_none());
        assert_eq!(h.orchestrator.count(UnitKind::Scheduler), 0);
    }

    #[tokio::test]
    async fn test_create_with_initial_workers() {
        let h = harness(config("c1").with_initial_workers(2)).await;

        // the scheduler unit exists as soon as create returns
        assert_eq!(h.orchestrator.count(UnitKind::Scheduler), 1);

        wait_for(&h.controller, |s| {
            s.status == ClusterStatus::Running && s.workers == 2
        })
        .await;
        assert_eq!(
            h.controller.status().scheduler_address.as_deref(),
            Some("tcp://c1-scheduler.default:8786")
        );

        let workers: Vec<_> = h
            .orchestrator
            .units()
            .into_iter()
            .filter(|u| u.handle.kind == UnitKind::Worker)
            .collect();
        assert_eq!(workers.len(), 2);
        for worker in workers {
            assert_eq!(
                worker.overrides.env.get(SCHEDULER_ADDRESS_ENV).map(String::as_str),
                Some("tcp://c1-scheduler.default:8786")
            );
            assert!(worker.handle.name.starts_with("c1-worker-"));
            assert_eq!(worker.overrides.labels.get("cluster").map(String::as_str), Some("c1"));
        }
    }

    #[tokio::test]
    async fn test_create_scheduler_failure_propagates() {
        let orchestrator = InMemoryOrchestrator::new().failing_after(0);
        let result = ClusterController::create(
            config("c1").with_initial_workers(1),
            templates(),
            Arc::new(orchestrator),
            Arc::new(MockSchedulerClient::new()),
        )
        .await;
        assert!(matches!(result, Err(ControllerError::Orchestrator(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_worker_failure_marks_failed() {
        // scheduler + one worker succeed, the second worker fails
        let h = harness_with(
            config("c1").with_initial_workers(2),
            InMemoryOrchestrator::new().failing_after(2),
            MockSchedulerClient::new(),
        )
        .await;

        wait_for(&h.controller, |s| s.status == ClusterStatus::Failed).await;
        let status = h.controller.status();
        assert_eq!(status.workers, 1);
        assert!(status.last_error.is_some());

        let result = h.controller.scale(3).await;
        assert!(matches!(result, Err(ControllerError::NotReady(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ready_timeout_marks_failed() {
        let mut cfg = config("c1").with_initial_workers(1);
        cfg.ready_timeout = Duration::from_secs(1);
        let h = harness_with(
            cfg,
            InMemoryOrchestrator::new().with_ready_delay(Duration::from_secs(60)),
            MockSchedulerClient::new(),
        )
        .await;

        wait_for(&h.controller, |s| s.status == ClusterStatus::Failed).await;
        assert!(h.controller.status().scheduler_address.is_none());
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let h = harness(config("c1")).await;

        let status = h.controller.scale(3).await.unwrap();
        assert_eq!(status.workers, 3);
        assert_eq!(h.orchestrator.count(UnitKind::Scheduler), 1);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 3);

        let status = h.controller.scale(1).await.unwrap();
        assert_eq!(status.workers, 1);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 1);
        assert_eq!(h.orchestrator.destroy_count(), 2);
    }

    #[tokio::test]
    async fn test_scale_negative_leaves_state_untouched() {
        let h = harness(config("c1")).await;
        h.controller.scale(2).await.unwrap();
        let before = h.controller.status();

        let result = h.controller.scale(-1).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));

        let after = h.controller.status();
        assert_eq!(after.workers, before.workers);
        assert_eq!(after.status, before.status);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 2);
    }

    #[tokio::test]
    async fn test_scale_partial_failure_keeps_successes() {
        // scheduler + 2 workers succeed, the remaining 2 fail
        let h = harness_with(
            config("c1"),
            InMemoryOrchestrator::new().failing_after(3),
            MockSchedulerClient::new(),
        )
        .await;

        let result = h.controller.scale(4).await;
        assert!(matches!(result, Err(ControllerError::Orchestrator(_))));

        let status = h.controller.status();
        assert_eq!(status.workers, 2);
        assert!(status.last_error.is_some());
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 2);
    }

    #[tokio::test]
    async fn test_scale_down_destroy_failure_keeps_units() {
        let h = harness_with(
            config("c1"),
            InMemoryOrchestrator::new().failing_destroys(),
            MockSchedulerClient::new(),
        )
        .await;
        h.controller.scale(2).await.unwrap();

        let result = h.controller.scale(0).await;
        assert!(matches!(result, Err(ControllerError::Orchestrator(_))));
        assert_eq!(h.controller.status().workers, 2);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapt_sets_bounds_and_status() {
        let h = harness(config("c1")).await;
        let status = h.controller.adapt(1, 5).await.unwrap();

        assert_eq!(status.status, ClusterStatus::Adapting);
        assert_eq!(
            status.adaptive_bounds,
            Some(AdaptiveBounds {
                minimum: 1,
                maximum: 5
            })
        );
        // the loop holds the minimum while there is no load
        wait_for(&h.controller, |s| s.workers == 1).await;
    }

    #[tokio::test]
    async fn test_adapt_invalid_bounds_unchanged() {
        let h = harness(config("c1")).await;
        let before = h.controller.status();

        let result = h.controller.adapt(5, 2).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
        let result = h.controller.adapt(-1, 2).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));

        let after = h.controller.status();
        assert_eq!(after.status, before.status);
        assert_eq!(after.adaptive_bounds, before.adaptive_bounds);
        assert!(h.controller.adaptive.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapt_follows_load_within_bounds() {
        let h = harness(config("c1")).await;
        h.controller.adapt(1, 5).await.unwrap();
        wait_for(&h.controller, |s| s.workers == 1).await;

        // 20 pending tasks at 2 per worker wants 10, capped at 5
        h.scheduler.set_pending(20);
        wait_for(&h.controller, |s| s.workers == 5).await;

        h.scheduler.set_pending(6);
        wait_for(&h.controller, |s| s.workers == 3).await;

        h.scheduler.set_pending(0);
        wait_for(&h.controller, |s| s.workers == 1).await;
        assert_eq!(h.controller.status().status, ClusterStatus::Adapting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_stops_adaptive_loop() {
        let h = harness(config("c1")).await;
        h.controller.adapt(1, 5).await.unwrap();
        wait_for(&h.controller, |s| s.workers == 1).await;

        let status = h.controller.scale(2).await.unwrap();
        assert_eq!(status.workers, 2);
        assert!(status.adaptive_bounds.is_none());
        assert_ne!(status.status, ClusterStatus::Adapting);
        assert!(h.controller.adaptive.lock().await.is_none());

        // load no longer moves the worker count
        h.scheduler.set_pending(100);
        let calls = h.scheduler.load_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.controller.status().workers, 2);
        assert_eq!(h.scheduler.load_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_scale_without_adaptive_loop_is_fine() {
        let h = harness(config("c1")).await;
        // no loop was ever started; stopping it is a no-op
        h.controller.scale(1).await.unwrap();
        h.controller.scale(1).await.unwrap();
        assert_eq!(h.controller.status().workers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_adapt_replaces_first() {
        let h = harness(config("c1")).await;
        h.controller.adapt(1, 5).await.unwrap();
        let first_generation = h.controller.adaptive.lock().await.as_ref().unwrap().generation();

        h.controller.adapt(2, 3).await.unwrap();
        {
            let adaptive = h.controller.adaptive.lock().await;
            let handle = adaptive.as_ref().unwrap();
            assert!(handle.generation() > first_generation);
            assert_eq!(handle.bounds().minimum, 2);
        }

        h.scheduler.set_pending(100);
        wait_for(&h.controller, |s| s.workers == 3).await;
        // the superseded loop (max 5) never pushes past the new maximum
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(h.controller.status().workers <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_create_scale_adapt_scale() {
        let h = harness(config("c1")).await;
        let status = h.controller.status();
        assert_eq!(status.status, ClusterStatus::Starting);
        assert_eq!(status.workers, 0);

        h.controller.scale(3).await.unwrap();
        wait_for(&h.controller, |s| s.workers == 3).await;

        h.controller.adapt(1, 5).await.unwrap();
        assert_eq!(h.controller.status().status, ClusterStatus::Adapting);

        h.controller.scale(2).await.unwrap();
        wait_for(&h.controller, |s| s.status == ClusterStatus::Running).await;
        assert_eq!(h.controller.status().workers, 2);
        assert!(h.controller.adaptive.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_time_adaptive_mode() {
        let h = harness(config("c1").with_initial_workers(2).with_max_workers(4)).await;

        wait_for(&h.controller, |s| s.status == ClusterStatus::Adapting).await;
        assert_eq!(
            h.controller.status().adaptive_bounds,
            Some(AdaptiveBounds {
                minimum: 2,
                maximum: 4
            })
        );
        h.scheduler.set_pending(100);
        wait_for(&h.controller, |s| s.workers == 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_scale_before_bootstrap_wins() {
        let h = harness(config("c1").with_initial_workers(2)).await;

        // the bootstrap task has not run yet
        let status = h.controller.scale(5).await.unwrap();
        assert_eq!(status.workers, 5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = h.controller.status();
        assert_eq!(status.workers, 5);
        assert_ne!(status.status, ClusterStatus::Failed);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_scale_cancels_start_time_adapt() {
        let h = harness(config("c1").with_initial_workers(2).with_max_workers(4)).await;

        h.controller.scale(3).await.unwrap();
        h.scheduler.set_pending(100);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = h.controller.status();
        assert_eq!(status.workers, 3);
        assert_ne!(status.status, ClusterStatus::Adapting);
        assert!(status.adaptive_bounds.is_none());
        assert!(h.controller.adaptive.lock().await.is_none());
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_adapt_replaces_start_time_adapt() {
        let h = harness(config("c1").with_initial_workers(2).with_max_workers(4)).await;

        h.controller.adapt(1, 2).await.unwrap();
        h.scheduler.set_pending(100);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = h.controller.status();
        assert_eq!(
            status.adaptive_bounds,
            Some(AdaptiveBounds {
                minimum: 1,
                maximum: 2
            })
        );
        assert_eq!(status.workers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scales_serialize() {
        let h = harness_with(
            config("c1"),
            InMemoryOrchestrator::new().with_create_delay(Duration::from_secs(1)),
            MockSchedulerClient::new(),
        )
        .await;

        let (first, second) = tokio::join!(h.controller.scale(2), h.controller.scale(4));
        first.unwrap();
        second.unwrap();

        let workers = h.controller.status().workers;
        assert!(workers == 2 || workers == 4);
        assert_eq!(h.orchestrator.count(UnitKind::Worker), workers as usize);
        assert_eq!(h.orchestrator.count(UnitKind::Scheduler), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_inflight_scale() {
        let h = harness_with(
            config("c1"),
            InMemoryOrchestrator::new().with_create_delay(Duration::from_secs(5)),
            MockSchedulerClient::new(),
        )
        .await;

        let controller = h.controller.clone();
        let scale = tokio::spawn(async move { controller.scale(3).await });
        // let the scale take the locks and start creating units
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = h.controller.close().await.unwrap();
        assert_eq!(status.status, ClusterStatus::Closed);
        assert_eq!(status.workers, 0);

        let scaled = scale.await.unwrap().unwrap();
        assert_eq!(scaled.workers, 3);
        assert!(h.orchestrator.units().is_empty());
        assert_eq!(h.orchestrator.create_count(), h.orchestrator.destroy_count());
    }

    #[tokio::test]
    async fn test_scale_above_worker_limit_rejected() {
        let h = harness(config("c1").with_worker_limit(10)).await;

        let result = h.controller.scale(11).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
        let result = h.controller.scale(i64::from(u32::MAX) + 1).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
        assert_eq!(h.controller.status().workers, 0);
        assert_eq!(h.orchestrator.create_count(), 0);

        h.controller.scale(10).await.unwrap();
        assert_eq!(h.orchestrator.count(UnitKind::Worker), 10);
    }

    #[tokio::test]
    async fn test_adapt_above_worker_limit_rejected() {
        let h = harness(config("c1").with_worker_limit(10)).await;

        let result = h.controller.adapt(1, 11).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
        assert!(h.controller.status().adaptive_bounds.is_none());
        assert!(h.controller.adaptive.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_register_plugin_before_ready() {
        let h = harness(config("c1")).await;
        let result = h.controller.register_plugin("upload").await;
        assert!(matches!(result, Err(ControllerError::NotReady(_))));
        assert_eq!(h.scheduler.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_plugin_after_ready() {
        let h = harness(config("c1").with_initial_workers(1)).await;
        wait_for(&h.controller, |s| s.scheduler_address.is_some()).await;

        let output = h.controller.register_plugin("upload").await.unwrap();
        assert_eq!(output, "registered upload");
        assert_eq!(h.scheduler.sessions_closed.load(Ordering::SeqCst), 1);

        let registrations = h.scheduler.registrations.lock().unwrap();
        assert_eq!(
            registrations[0].target_scheduler_address,
            "tcp://c1-scheduler.default:8786"
        );
    }

    #[tokio::test]
    async fn test_register_plugin_failure_releases_session() {
        let h = harness_with(
            config("c1").with_initial_workers(1),
            InMemoryOrchestrator::new(),
            MockSchedulerClient::failing_registration(),
        )
        .await;
        wait_for(&h.controller, |s| s.scheduler_address.is_some()).await;

        let result = h.controller.register_plugin("upload").await;
        assert!(matches!(result, Err(ControllerError::Scheduler(_))));
        assert_eq!(h.scheduler.sessions_opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.sessions_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_plugin_rejects_empty_name() {
        let h = harness(config("c1")).await;
        let result = h.controller.register_plugin("  ").await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_tears_everything_down() {
        let h = harness(config("c1")).await;
        h.controller.scale(3).await.unwrap();
        h.controller.adapt(2, 4).await.unwrap();

        let status = h.controller.close().await.unwrap();
        assert_eq!(status.status, ClusterStatus::Closed);
        assert_eq!(status.workers, 0);
        assert!(h.orchestrator.units().is_empty());
        assert!(h.controller.adaptive.lock().await.is_none());

        assert!(matches!(h.controller.scale(1).await, Err(ControllerError::Closed)));
        assert!(matches!(h.controller.adapt(1, 2).await, Err(ControllerError::Closed)));
        assert!(matches!(
            h.controller.register_plugin("p").await,
            Err(ControllerError::Closed)
        ));
        assert!(matches!(h.controller.close().await, Err(ControllerError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_best_effort() {
        let h = harness_with(
            config("c1"),
            InMemoryOrchestrator::new().failing_destroys(),
            MockSchedulerClient::new(),
        )
        .await;
        h.controller.scale(2).await.unwrap();

        let status = h.controller.close().await.unwrap();
        assert_eq!(status.status, ClusterStatus::Closed);
        assert_eq!(status.workers, 0);
    }

    #[tokio::test]
    async fn test_error_tags() {
        assert_eq!(ControllerError::Closed.tag(), "Closed");
        assert_eq!(ControllerError::NotReady("x".into()).tag(), "NotReady");
        assert_eq!(ControllerError::InvalidConfig("x".into()).tag(), "InvalidConfig");
        assert_eq!(
            ControllerError::from(OrchestratorError::Unavailable("x".into())).tag(),
            "OrchestratorError"
        );
    }
}
