//! Scheduler collaborator - load signal, metadata and plugin registration
//!
//! The controller never speaks the scheduler's wire protocol itself. It asks
//! a [`SchedulerClient`] for the current load (the adaptive demand signal), a
//! metadata snapshot, and for short-lived sessions used to register plugins.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpSchedulerClient;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid scheduler address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to reach scheduler: {0}")]
    Connection(String),

    #[error("Scheduler error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse scheduler response: {0}")]
    Parse(String),
}

/// Task counts reported by the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLoad {
    /// Tasks ready to run but not yet assigned
    #[serde(default)]
    pub waiting: u64,
    /// Tasks currently assigned to workers
    #[serde(default)]
    pub processing: u64,
    /// Workers connected to the scheduler
    #[serde(default)]
    pub workers: u64,
}

impl SchedulerLoad {
    /// Outstanding units of work
    pub fn pending(&self) -> u64 {
        self.waiting + self.processing
    }
}

/// A plugin registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub name: String,
    /// Scheduler the plugin's worker-side behaviour binds back to
    #[serde(rename = "targetSchedulerAddress")]
    pub target_scheduler_address: String,
}

// ============================================================================
// SBIO: Traits for abstraction (allows mocking in tests)
// ============================================================================

/// A transient connection to one scheduler
#[async_trait]
pub trait SchedulerSession: Send {
    /// Register a plugin, returning the scheduler-reported output
    async fn register_plugin(
        &mut self,
        registration: &PluginRegistration,
    ) -> Result<String, SchedulerError>;

    /// Release the connection
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Current load of the scheduler at `address`
    async fn load(&self, address: &str) -> Result<SchedulerLoad, SchedulerError>;

    /// Metadata snapshot of the scheduler at `address`
    async fn info(&self, address: &str) -> Result<Value, SchedulerError>;

    /// Open a session against the scheduler at `address`
    async fn connect(&self, address: &str) -> Result<Box<dyn SchedulerSession>, SchedulerError>;
}

pub type SharedSchedulerClient = Arc<dyn SchedulerClient>;

/// Split `tcp://host:port` (scheme optional) into host and port
pub fn parse_address(address: &str) -> Result<(String, u16), SchedulerError> {
    let rest = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| SchedulerError::InvalidAddress(address.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| SchedulerError::InvalidAddress(address.to_string()))?;
    if host.is_empty() {
        return Err(SchedulerError::InvalidAddress(address.to_string()));
    }
    Ok((host.to_string(), port))
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
