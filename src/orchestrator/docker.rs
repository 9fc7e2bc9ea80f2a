//! Docker-backed orchestrator
//!
//! Units are plain containers started with the `docker` CLI. Every container
//! joins one network; the scheduler is additionally reachable under its
//! cluster host name through a network alias, so workers can be handed the
//! scheduler address before the scheduler container is up.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::{OrchestratorClient, OrchestratorError, UnitHandle, UnitOverrides};
use crate::config::WorkloadTemplate;

/// Orchestrator that drives the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerOrchestrator {
    /// Docker network every unit joins
    network: String,
    /// Delay between readiness probes
    poll_interval: Duration,
}

impl DockerOrchestrator {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn docker(&self, args: &[String]) -> Result<String, String> {
        debug!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("Failed to run docker: {}", e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl OrchestratorClient for DockerOrchestrator {
    async fn create_unit(
        &self,
        template: &WorkloadTemplate,
        overrides: &UnitOverrides,
    ) -> Result<UnitHandle, OrchestratorError> {
        let name = generate_container_name(&overrides.name);
        let args = generate_run_args(template, overrides, &name, &self.network);

        let id = self
            .docker(&args)
            .await
            .map_err(|reason| OrchestratorError::CreateFailed {
                name: name.clone(),
                reason,
            })?;

        info!("Started {} container {} ({})", template.kind(), name, short_id(&id));

        Ok(UnitHandle {
            id,
            host: overrides.host().to_string(),
            name,
            kind: template.kind(),
        })
    }

    async fn destroy_unit(&self, handle: &UnitHandle) -> Result<(), OrchestratorError> {
        self.docker(&generate_rm_args(&handle.name))
            .await
            .map_err(|reason| OrchestratorError::DestroyFailed {
                name: handle.name.clone(),
                reason,
            })?;
        info!("Removed {} container {}", handle.kind, handle.name);
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.docker(&generate_inspect_args(&handle.name)).await {
                Ok(state) if is_running(&state) => return Ok(handle.host.clone()),
                Ok(state) => debug!("Container {} not running yet: {}", handle.name, state),
                Err(e) if e.contains("No such") => {
                    return Err(OrchestratorError::UnitNotFound(handle.name.clone()))
                }
                Err(e) => debug!("Inspect of {} failed: {}", handle.name, e),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(OrchestratorError::Timeout {
                    name: handle.name.clone(),
                    timeout,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    fn name(&self) -> &str {
        "docker"
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate Docker run arguments for a unit.
///
/// Template environment comes first; overrides replace entries with the same
/// name. `resources.limits.cpu` / `resources.limits.memory` of the primary
/// container map onto `--cpus` / `--memory`.
pub fn generate_run_args(
    template: &WorkloadTemplate,
    overrides: &UnitOverrides,
    container_name: &str,
    network: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        network.to_string(),
    ];

    if let Some(hostname) = &overrides.hostname {
        args.push("--network-alias".to_string());
        args.push(hostname.clone());
    }

    for (key, value) in &overrides.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(limits) = template.spec().pointer("/spec/containers/0/resources/limits") {
        if let Some(cpu) = limits.get("cpu").and_then(limit_value) {
            args.push("--cpus".to_string());
            args.push(cpu);
        }
        if let Some(memory) = limits.get("memory").and_then(limit_value) {
            args.push("--memory".to_string());
            args.push(docker_memory(&memory));
        }
    }

    let mut env: BTreeMap<String, String> = template
        .env()
        .into_iter()
        .map(|(k, v)| (k, expand_env_vars(&v)))
        .collect();
    env.extend(overrides.env.clone());
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(template.image().to_string());
    args.extend(template.args());

    args
}

/// Generate Docker rm arguments
pub fn generate_rm_args(container_name: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), container_name.to_string()]
}

/// Generate Docker inspect arguments that print the running flag
pub fn generate_inspect_args(container_name: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "-f".to_string(),
        "{{.State.Running}}".to_string(),
        container_name.to_string(),
    ]
}

/// Sanitize a unit name into a valid container name
pub fn generate_container_name(unit_name: &str) -> String {
    unit_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '-',
        })
        .collect::<String>()
        .to_lowercase()
}

/// Expand `$VAR` / `${VAR}` references from the controller's environment.
/// Unset variables expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    shellexpand::env_with_context_no_errors(input, |var| {
        Some(std::env::var(var).unwrap_or_default())
    })
    .into_owned()
}

fn is_running(inspect_output: &str) -> bool {
    inspect_output.trim() == "true"
}

fn limit_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Kubernetes-style quantities ("4G", "512Mi") to Docker's ("4g", "512m")
fn docker_memory(quantity: &str) -> String {
    quantity.trim_end_matches('i').to_lowercase()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
