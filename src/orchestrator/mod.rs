//! Orchestrator boundary - the capabilities the cluster controller needs from
//! the underlying container platform.
//!
//! The controller only ever talks to [`OrchestratorClient`]; backends live in
//! submodules.

pub mod docker;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{UnitKind, WorkloadTemplate};

pub use docker::DockerOrchestrator;
pub use memory::InMemoryOrchestrator;

/// Errors reported by an orchestrator backend
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Failed to create unit '{name}': {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to destroy unit '{name}': {reason}")]
    DestroyFailed { name: String, reason: String },

    #[error("Unit '{0}' not found")]
    UnitNotFound(String),

    #[error("Unit '{name}' not ready after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// Handle to a unit created on the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitHandle {
    /// Backend-assigned identifier
    pub id: String,
    /// Unit name
    pub name: String,
    /// Host name the unit is reachable under on the cluster network
    pub host: String,
    pub kind: UnitKind,
}

/// Per-unit values layered on top of a template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOverrides {
    /// Unit name
    pub name: String,
    /// Namespace the unit is grouped under
    pub namespace: String,
    /// Additional network alias (host name) for the unit
    pub hostname: Option<String>,
    /// Extra environment variables, taking precedence over the template's
    pub env: BTreeMap<String, String>,
    /// Labels attached to the unit
    pub labels: BTreeMap<String, String>,
}

impl UnitOverrides {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Host name the unit will be reachable under
    pub fn host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows swapping the platform and mocking)
// ============================================================================

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Create a unit from a template
    async fn create_unit(
        &self,
        template: &WorkloadTemplate,
        overrides: &UnitOverrides,
    ) -> Result<UnitHandle, OrchestratorError>;

    /// Destroy a unit
    async fn destroy_unit(&self, handle: &UnitHandle) -> Result<(), OrchestratorError>;

    /// Wait until a unit reports ready and return the host it is reachable at
    async fn wait_until_ready(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<String, OrchestratorError>;

    /// Backend name (for logging)
    fn name(&self) -> &str;
}

pub type SharedOrchestrator = Arc<dyn OrchestratorClient>;
