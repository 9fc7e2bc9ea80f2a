//! Adaptive scaling - keeps the worker count in step with scheduler load
//!
//! The decision logic is a pure function over the observed load, the current
//! worker count and the configured bounds. The loop around it runs as a
//! background task owned through an [`AdaptiveHandle`]; at most one handle is
//! alive per cluster.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::controller::ClusterController;
use super::state::AdaptiveBounds;
use crate::config::ClusterConfig;
use crate::scheduler::SchedulerLoad;

/// Tuning of the adaptive loop
#[derive(Debug, Clone)]
pub struct AdaptivePolicy {
    /// Time between reconciliation ticks
    pub interval: Duration,
    /// Outstanding tasks a single worker is expected to absorb
    pub target_tasks_per_worker: u32,
    /// Consecutive scale-down recommendations before acting on one
    pub scale_down_wait_count: u32,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self::from(&ClusterConfig::default())
    }
}

impl From<&ClusterConfig> for AdaptivePolicy {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            interval: config.adapt_interval,
            target_tasks_per_worker: config.target_tasks_per_worker,
            scale_down_wait_count: config.scale_down_wait_count,
        }
    }
}

/// Per-loop memory between ticks
///
/// Tracks how many ticks in a row asked for fewer workers, so a single quiet
/// moment does not tear workers down (thrashing).
#[derive(Debug, Clone, Default)]
pub struct AdaptiveState {
    pub low_streak: u32,
}

impl AdaptiveState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scaling decision from one reconciliation tick
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    /// No change needed
    NoChange,
    /// Add workers up to the target
    ScaleUp { target_workers: u32, reason: String },
    /// Remove workers down to the target
    ScaleDown { target_workers: u32, reason: String },
}

/// Workers wanted for the observed load, clamped to the bounds
pub fn desired_workers(
    policy: &AdaptivePolicy,
    bounds: AdaptiveBounds,
    load: &SchedulerLoad,
) -> u32 {
    let per_worker = u64::from(policy.target_tasks_per_worker.max(1));
    let wanted = load.pending().div_ceil(per_worker);
    bounds.clamp(u32::try_from(wanted).unwrap_or(u32::MAX))
}

/// Evaluate the scaling decision for one tick.
///
/// A worker count outside the bounds is corrected immediately. Inside the
/// bounds, scale-up is immediate and scale-down waits for
/// `scale_down_wait_count` consecutive low recommendations.
pub fn evaluate_scaling(
    policy: &AdaptivePolicy,
    bounds: AdaptiveBounds,
    current_workers: u32,
    load: &SchedulerLoad,
    state: &mut AdaptiveState,
) -> ScalingDecision {
    let target = desired_workers(policy, bounds, load);

    if !bounds.contains(current_workers) {
        state.low_streak = 0;
        let reason = format!("{} workers outside bounds {}", current_workers, bounds);
        return if target > current_workers {
            ScalingDecision::ScaleUp {
                target_workers: target,
                reason,
            }
        } else {
            ScalingDecision::ScaleDown {
                target_workers: target,
                reason,
            }
        };
    }

    if target > current_workers {
        state.low_streak = 0;
        ScalingDecision::ScaleUp {
            target_workers: target,
            reason: format!(
                "{} pending tasks need {} workers",
                load.pending(),
                target
            ),
        }
    } else if target < current_workers {
        state.low_streak += 1;
        if state.low_streak < policy.scale_down_wait_count {
            debug!(
                "Scale-down to {} deferred ({}/{})",
                target, state.low_streak, policy.scale_down_wait_count
            );
            return ScalingDecision::NoChange;
        }
        state.low_streak = 0;
        ScalingDecision::ScaleDown {
            target_workers: target,
            reason: format!(
                "{} pending tasks need only {} workers",
                load.pending(),
                target
            ),
        }
    } else {
        state.low_streak = 0;
        ScalingDecision::NoChange
    }
}

/// Owner of a running adaptive loop
#[derive(Debug)]
pub struct AdaptiveHandle {
    generation: u64,
    bounds: AdaptiveBounds,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AdaptiveHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bounds(&self) -> AdaptiveBounds {
        self.bounds
    }

    /// Signal the loop and wait until it has exited.
    ///
    /// The loop only observes the signal between ticks, so an in-progress
    /// scale always completes.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => debug!("Adaptive loop {} stopped", self.generation),
            Err(e) if e.is_panic() => error!("Adaptive loop {} panicked", self.generation),
            Err(_) => debug!("Adaptive loop {} cancelled", self.generation),
        }
    }
}

/// Spawn the adaptive loop for one generation of bounds
pub(crate) fn spawn_adaptive(
    controller: ClusterController,
    generation: u64,
    bounds: AdaptiveBounds,
    policy: AdaptivePolicy,
) -> AdaptiveHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = AdaptiveState::new();

        info!(
            "Adaptive loop {} started: bounds {}, every {:?}",
            generation, bounds, policy.interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    debug!("Adaptive loop {} received stop", generation);
                    break;
                }
                _ = ticker.tick() => {
                    if !controller.adaptive_tick(generation, bounds, &policy, &mut state).await {
                        info!("Adaptive loop {} superseded, exiting", generation);
                        break;
                    }
                }
            }
        }
    });

    AdaptiveHandle {
        generation,
        bounds,
        shutdown: shutdown_tx,
        task,
    }
}
