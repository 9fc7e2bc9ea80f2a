//! # Elastic Cluster Lifecycle
//!
//! One controller owns one cluster: a scheduler unit plus a pool of worker
//! units created from workload templates through an orchestrator.
//!
//! ## Modes
//!
//! 1. **Manual**: the worker count is whatever the last `scale` asked for
//! 2. **Adaptive**: a background loop keeps the worker count within
//!    `[minimum, maximum]`, following the scheduler's pending work
//!
//! Switching modes always stops the previous adaptive loop before the new
//! mode takes effect.
//!
//! ## Architecture
//!
//! ```text
//!   Control surface (HTTP)
//!            │
//!            ▼
//! ┌─────────────────────────────────────────────┐
//! │            ClusterController                │
//! │  ┌──────────────┐   ┌────────────────────┐  │
//! │  │ ClusterState │◄──│ Adaptive loop      │  │
//! │  │ (mutex)      │   │ (one per cluster)  │  │
//! │  └──────┬───────┘   └─────────┬──────────┘  │
//! │         │ snapshot (watch)    │ load        │
//! └─────────┼─────────────────────┼─────────────┘
//!           ▼                     ▼
//!     Orchestrator          Scheduler
//!   (scheduler/worker     (counts, identity,
//!    units)                plugins)
//! ```
//!
//! ## Status transitions
//!
//! ```text
//! created ─► starting ─► running ◄──► adapting
//!               │           │            │
//!               └─► failed  └────────────┴─► closed
//! ```

pub mod adaptive;
pub mod controller;
pub mod state;

pub use adaptive::{
    desired_workers, evaluate_scaling, AdaptiveHandle, AdaptivePolicy, AdaptiveState,
    ScalingDecision,
};
pub use controller::{ClusterController, ControllerError, TemplatePair, SCHEDULER_ADDRESS_ENV};
pub use state::{AdaptiveBounds, ClusterState, ClusterStatus, StatusSnapshot};
