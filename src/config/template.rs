//! Workload templates - declarative descriptions of scheduler and worker units
//!
//! A template is a pod-like document:
//!
//! ```yaml
//! metadata:
//!   labels: {team: analytics}
//! spec:
//!   containers:
//!     - image: daskdev/dask:latest
//!       args: [dask-worker, --nthreads, "2"]
//!       env:
//!         - {name: EXTRA_PIP_PACKAGES, value: s3fs}
//!       resources:
//!         limits: {cpu: "2", memory: 4G}
//! ```
//!
//! Only the fields needed to start a unit are validated (`spec.containers[*].image`).
//! Everything else is carried through to the orchestrator untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors raised while parsing or validating a workload template
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to parse template: {0}")]
    Parse(String),

    #[error("Template is missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid template field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

/// Which role a unit plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Scheduler,
    Worker,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Scheduler => "scheduler",
            UnitKind::Worker => "worker",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of how to construct one kind of unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadTemplate {
    kind: UnitKind,
    spec: Value,
}

impl WorkloadTemplate {
    /// Build a template from an already-parsed document, validating it
    pub fn new(kind: UnitKind, spec: Value) -> Result<Self, TemplateError> {
        let template = Self { kind, spec };
        template.validate()?;
        Ok(template)
    }

    /// Parse a YAML or JSON document into a template
    pub fn from_str(kind: UnitKind, content: &str) -> Result<Self, TemplateError> {
        let spec: Value =
            serde_yaml::from_str(content).map_err(|e| TemplateError::Parse(e.to_string()))?;
        Self::new(kind, spec)
    }

    /// Derive a scheduler template from a worker template.
    ///
    /// The first container keeps its image, resources and environment; its
    /// command line is replaced by the scheduler start command.
    pub fn scheduler_from_worker(
        worker: &WorkloadTemplate,
        port: u16,
        idle_timeout_mins: Option<u64>,
    ) -> Result<Self, TemplateError> {
        let mut spec = worker.spec.clone();

        let mut args = vec![
            "dask-scheduler".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(mins) = idle_timeout_mins {
            args.push("--idle-timeout".to_string());
            args.push(format!("{}m", mins));
        }

        let containers = spec
            .pointer_mut("/spec/containers")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| TemplateError::MissingField("spec.containers".to_string()))?;
        containers.truncate(1);
        if let Some(container) = containers.first_mut().and_then(Value::as_object_mut) {
            container.insert("args".to_string(), json!(args));
            container.remove("command");
        }

        Self::new(UnitKind::Scheduler, spec)
    }

    fn validate(&self) -> Result<(), TemplateError> {
        let containers = self
            .spec
            .pointer("/spec/containers")
            .ok_or_else(|| TemplateError::MissingField("spec.containers".to_string()))?;

        let containers = containers
            .as_array()
            .ok_or_else(|| TemplateError::InvalidField {
                field: "spec.containers".to_string(),
                reason: "must be a list".to_string(),
            })?;

        if containers.is_empty() {
            return Err(TemplateError::InvalidField {
                field: "spec.containers".to_string(),
                reason: "must contain at least one container".to_string(),
            });
        }

        for (i, container) in containers.iter().enumerate() {
            match container.get("image").and_then(Value::as_str) {
                Some(image) if !image.trim().is_empty() => {}
                Some(_) => {
                    return Err(TemplateError::InvalidField {
                        field: format!("spec.containers[{}].image", i),
                        reason: "must not be empty".to_string(),
                    })
                }
                None => {
                    return Err(TemplateError::MissingField(format!(
                        "spec.containers[{}].image",
                        i
                    )))
                }
            }
        }

        Ok(())
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// The raw document
    pub fn spec(&self) -> &Value {
        &self.spec
    }

    /// Image of the primary container
    pub fn image(&self) -> &str {
        self.primary_container()
            .and_then(|c| c.get("image"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Command-line arguments of the primary container
    pub fn args(&self) -> Vec<String> {
        self.primary_container()
            .and_then(|c| c.get("args"))
            .and_then(Value::as_array)
            .map(|args| args.iter().map(value_to_string).collect())
            .unwrap_or_default()
    }

    /// Environment of the primary container as (name, value) pairs
    pub fn env(&self) -> Vec<(String, String)> {
        self.primary_container()
            .and_then(|c| c.get("env"))
            .and_then(Value::as_array)
            .map(|vars| {
                vars.iter()
                    .filter_map(|var| {
                        let name = var.get("name")?.as_str()?;
                        let value = var.get("value").map(value_to_string).unwrap_or_default();
                        Some((name.to_string(), value))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn primary_container(&self) -> Option<&Value> {
        self.spec
            .pointer("/spec/containers")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
