//! In-process orchestrator
//!
//! Units exist only as entries in a map and are ready as soon as they are
//! created. Used for local experimentation (`--orchestrator memory`) and as
//! the test double for the controller, with optional failure injection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{OrchestratorClient, OrchestratorError, UnitHandle, UnitOverrides};
use crate::config::{UnitKind, WorkloadTemplate};

/// A unit tracked by the in-memory orchestrator
#[derive(Debug, Clone)]
pub struct MemoryUnit {
    pub handle: UnitHandle,
    pub image: String,
    pub overrides: UnitOverrides,
}

#[derive(Debug, Default)]
struct Counters {
    creates: AtomicUsize,
    destroys: AtomicUsize,
}

/// Orchestrator keeping units in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrchestrator {
    units: Arc<DashMap<String, MemoryUnit>>,
    counters: Arc<Counters>,
    /// Successful creates allowed before every further create fails
    create_budget: Option<usize>,
    fail_destroys: bool,
    create_delay: Option<Duration>,
    ready_delay: Option<Duration>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every create after `successes` successful ones
    pub fn failing_after(mut self, successes: usize) -> Self {
        self.create_budget = Some(successes);
        self
    }

    /// Fail every destroy
    pub fn failing_destroys(mut self) -> Self {
        self.fail_destroys = true;
        self
    }

    /// Hold every create for `delay` before the unit exists
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Delay readiness reports
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = Some(delay);
        self
    }

    /// Units currently alive
    pub fn units(&self) -> Vec<MemoryUnit> {
        self.units.iter().map(|r| r.value().clone()).collect()
    }

    /// Units of one kind currently alive
    pub fn count(&self, kind: UnitKind) -> usize {
        self.units.iter().filter(|r| r.handle.kind == kind).count()
    }

    /// Successful creates so far
    pub fn create_count(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Successful destroys so far
    pub fn destroy_count(&self) -> usize {
        self.counters.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrchestratorClient for InMemoryOrchestrator {
    async fn create_unit(
        &self,
        template: &WorkloadTemplate,
        overrides: &UnitOverrides,
    ) -> Result<UnitHandle, OrchestratorError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = self.counters.creates.fetch_add(1, Ordering::SeqCst);
        if self.create_budget.is_some_and(|budget| attempt >= budget) {
            self.counters.creates.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestratorError::CreateFailed {
                name: overrides.name.clone(),
                reason: "quota exceeded".to_string(),
            });
        }

        let handle = UnitHandle {
            id: Uuid::new_v4().to_string(),
            name: overrides.name.clone(),
            host: overrides.host().to_string(),
            kind: template.kind(),
        };
        debug!("Created in-memory {} unit {}", handle.kind, handle.name);

        self.units.insert(
            handle.id.clone(),
            MemoryUnit {
                handle: handle.clone(),
                image: template.image().to_string(),
                overrides: overrides.clone(),
            },
        );
        Ok(handle)
    }

    async fn destroy_unit(&self, handle: &UnitHandle) -> Result<(), OrchestratorError> {
        if self.fail_destroys {
            return Err(OrchestratorError::DestroyFailed {
                name: handle.name.clone(),
                reason: "destroy rejected".to_string(),
            });
        }
        self.units
            .remove(&handle.id)
            .ok_or_else(|| OrchestratorError::UnitNotFound(handle.name.clone()))?;
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        if let Some(delay) = self.ready_delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(OrchestratorError::Timeout {
                    name: handle.name.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        if !self.units.contains_key(&handle.id) {
            return Err(OrchestratorError::UnitNotFound(handle.name.clone()));
        }
        Ok(handle.host.clone())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
