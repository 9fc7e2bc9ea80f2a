//! Cluster state - the mutable record owned by the controller

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::UnitHandle;

/// Lifecycle status of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Constructed, no units requested yet
    Created,
    /// Scheduler requested, not yet reported ready
    Starting,
    /// Scheduler ready, manual mode
    Running,
    /// Scheduler ready or starting, worker count owned by the adaptive loop
    Adapting,
    /// Bootstrap failed; see `last_error`
    Failed,
    /// Torn down (terminal)
    Closed,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Created => "created",
            ClusterStatus::Starting => "starting",
            ClusterStatus::Running => "running",
            ClusterStatus::Adapting => "adapting",
            ClusterStatus::Failed => "failed",
            ClusterStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-count bounds of adaptive mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveBounds {
    pub minimum: u32,
    pub maximum: u32,
}

impl AdaptiveBounds {
    pub fn clamp(&self, workers: u32) -> u32 {
        workers.clamp(self.minimum, self.maximum)
    }

    pub fn contains(&self, workers: u32) -> bool {
        (self.minimum..=self.maximum).contains(&workers)
    }
}

impl fmt::Display for AdaptiveBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.minimum, self.maximum)
    }
}

/// The mutable state of one cluster.
///
/// Only touched while holding the controller's mutation lock.
#[derive(Debug)]
pub struct ClusterState {
    pub name: String,
    pub namespace: String,
    /// Set once the scheduler unit reports ready
    pub scheduler_address: Option<String>,
    pub dashboard_link: Option<String>,
    pub scheduler: Option<UnitHandle>,
    /// Workers believed running, oldest first
    pub workers: Vec<UnitHandle>,
    pub status: ClusterStatus,
    pub adaptive_bounds: Option<AdaptiveBounds>,
    /// Identifies the adaptive loop currently allowed to mutate this state
    pub adaptive_generation: u64,
    pub last_error: Option<String>,
}

impl ClusterState {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        dashboard_link: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            scheduler_address: None,
            dashboard_link,
            scheduler: None,
            workers: Vec::new(),
            status: ClusterStatus::Created,
            adaptive_bounds: None,
            adaptive_generation: 0,
            last_error: None,
        }
    }

    pub fn worker_count(&self) -> u32 {
        self.workers.len() as u32
    }

    pub fn is_closed(&self) -> bool {
        self.status == ClusterStatus::Closed
    }

    /// Status to settle on when no adaptive loop owns the cluster
    pub fn manual_status(&self) -> ClusterStatus {
        match self.status {
            ClusterStatus::Closed | ClusterStatus::Failed => self.status,
            _ if self.scheduler_address.is_some() => ClusterStatus::Running,
            _ => ClusterStatus::Starting,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            status: self.status,
            workers: self.workers.len(),
            scheduler_address: self.scheduler_address.clone(),
            dashboard_link: self.dashboard_link.clone(),
            adaptive_bounds: self.adaptive_bounds,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Read-only view of the cluster published after every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub namespace: String,
    pub status: ClusterStatus,
    pub workers: usize,
    #[serde(rename = "schedulerAddress")]
    pub scheduler_address: Option<String>,
    #[serde(rename = "dashboardLink")]
    pub dashboard_link: Option<String>,
    #[serde(rename = "adaptiveBounds")]
    pub adaptive_bounds: Option<AdaptiveBounds>,
    #[serde(rename = "lastError")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterController(name={}, namespace={}, scheduler={}, workers={}, status={})",
            self.name,
            self.namespace,
            self.scheduler_address.as_deref().unwrap_or("pending"),
            self.workers,
            self.status
        )
    }
}
