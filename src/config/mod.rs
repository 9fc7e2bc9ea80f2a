pub mod template;

pub use template::{TemplateError, UnitKind, WorkloadTemplate};

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Default namespace for created units
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default location of the worker template inside a deployed controller
pub const DEFAULT_WORKER_TEMPLATE: &str = "/etc/config/worker_spec.yaml";

/// Well-known scheduler port
pub const DEFAULT_SCHEDULER_PORT: u16 = 8786;

/// Well-known scheduler dashboard port
pub const DEFAULT_DASHBOARD_PORT: u16 = 8787;

/// Default ceiling on the worker count a single request may ask for
pub const DEFAULT_WORKER_LIMIT: u32 = 1000;

/// Errors for configuration and file I/O (separate from pure template parsing)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("Template file not found: {0}")]
    TemplateNotFound(PathBuf),

    #[error("Template error: {0}")]
    TemplateError(#[from] TemplateError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration consumed by the cluster controller at construction
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique cluster name, used as a prefix for every unit
    pub name: String,

    /// Logical grouping scope for created units
    pub namespace: String,

    /// Path to the worker template
    pub worker_template_path: PathBuf,

    /// Path to the scheduler template (derived from the worker template if absent)
    pub scheduler_template_path: Option<PathBuf>,

    /// Workers requested at creation
    pub initial_workers: u32,

    /// Upper bound for start-time adaptive mode; manual mode when absent
    pub max_workers: Option<u32>,

    /// Informational dashboard URL
    pub dashboard_link: Option<String>,

    /// Scheduler idle timeout passed to a derived scheduler template (minutes)
    pub scheduler_idle_timeout_mins: Option<u64>,

    /// Port the scheduler listens on
    pub scheduler_port: u16,

    /// Port of the scheduler's HTTP dashboard
    pub dashboard_port: u16,

    /// How long to wait for the scheduler unit to report ready
    pub ready_timeout: Duration,

    /// Adaptive reconciliation cadence
    pub adapt_interval: Duration,

    /// Outstanding tasks a single worker is expected to absorb
    pub target_tasks_per_worker: u32,

    /// Consecutive scale-down recommendations required before removing workers
    pub scale_down_wait_count: u32,

    /// Largest worker count Scale or Adapt may request
    pub worker_limit: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            worker_template_path: PathBuf::from(DEFAULT_WORKER_TEMPLATE),
            scheduler_template_path: None,
            initial_workers: 0,
            max_workers: None,
            dashboard_link: None,
            scheduler_idle_timeout_mins: None,
            scheduler_port: DEFAULT_SCHEDULER_PORT,
            dashboard_port: DEFAULT_DASHBOARD_PORT,
            ready_timeout: Duration::from_secs(300),
            adapt_interval: Duration::from_secs(30),
            target_tasks_per_worker: 2,
            scale_down_wait_count: 3,
            worker_limit: DEFAULT_WORKER_LIMIT,
        }
    }
}

impl ClusterConfig {
    /// Create a config with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_initial_workers(mut self, workers: u32) -> Self {
        self.initial_workers = workers;
        self
    }

    pub fn with_max_workers(mut self, max: u32) -> Self {
        self.max_workers = Some(max);
        self
    }

    pub fn with_dashboard_link(mut self, link: impl Into<String>) -> Self {
        self.dashboard_link = Some(link.into());
        self
    }

    pub fn with_adapt_interval(mut self, interval: Duration) -> Self {
        self.adapt_interval = interval;
        self
    }

    pub fn with_scale_down_wait_count(mut self, count: u32) -> Self {
        self.scale_down_wait_count = count;
        self
    }

    pub fn with_worker_limit(mut self, limit: u32) -> Self {
        self.worker_limit = limit;
        self
    }

    /// Check values that do not require touching the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("name", &self.name)?;
        validate_name("namespace", &self.namespace)?;

        if let Some(max) = self.max_workers {
            if max < self.initial_workers {
                return Err(ConfigError::Invalid(format!(
                    "max workers ({}) is below initial workers ({})",
                    max, self.initial_workers
                )));
            }
        }
        let requested = self.max_workers.unwrap_or(self.initial_workers).max(self.initial_workers);
        if requested > self.worker_limit {
            return Err(ConfigError::Invalid(format!(
                "requested workers ({}) exceed the worker limit ({})",
                requested, self.worker_limit
            )));
        }
        if self.target_tasks_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "target tasks per worker must be at least 1".to_string(),
            ));
        }
        if self.adapt_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "adapt interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduler address derived from name, namespace and port.
    ///
    /// Known before the scheduler unit exists so workers can be pointed at it.
    pub fn scheduler_address(&self) -> String {
        format!("tcp://{}:{}", self.scheduler_host(), self.scheduler_port)
    }

    /// Host name the scheduler unit is reachable under
    pub fn scheduler_host(&self) -> String {
        format!("{}-scheduler.{}", self.name, self.namespace)
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("name pattern is valid")
    })
}

fn validate_name(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
    }
    if value.len() > 63 || !name_pattern().is_match(value) {
        return Err(ConfigError::Invalid(format!(
            "{} '{}' must be a lowercase DNS label (a-z, 0-9, '-')",
            field, value
        )));
    }
    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a template file from disk.
///
/// `~` is expanded. This is the I/O boundary; parsing is delegated to
/// [`WorkloadTemplate::from_str`].
pub fn load_template_file(path: &Path, kind: UnitKind) -> Result<WorkloadTemplate, ConfigError> {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
    if !expanded.exists() {
        return Err(ConfigError::TemplateNotFound(expanded));
    }
    let content =
        std::fs::read_to_string(&expanded).map_err(|e| ConfigError::IoError(expanded.clone(), e))?;
    Ok(WorkloadTemplate::from_str(kind, &content)?)
}

/// Load the scheduler/worker template pair described by a config
pub fn load_templates(
    config: &ClusterConfig,
) -> Result<(WorkloadTemplate, WorkloadTemplate), ConfigError> {
    let worker = load_template_file(&config.worker_template_path, UnitKind::Worker)?;
    let scheduler = match &config.scheduler_template_path {
        Some(path) => load_template_file(path, UnitKind::Scheduler)?,
        None => WorkloadTemplate::scheduler_from_worker(
            &worker,
            config.scheduler_port,
            config.scheduler_idle_timeout_mins,
        )?,
    };
    Ok((scheduler, worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const WORKER: &str = "spec:\n  containers:\n    - image: daskdev/dask\n      args: [dask-worker]\n";

    #[test]
    fn test_load_template_file() {
        let file = create_temp_file(WORKER);
        let template = load_template_file(file.path(), UnitKind::Worker).unwrap();
        assert_eq!(template.image(), "daskdev/dask");
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_template_file(Path::new("/nonexistent/worker.yaml"), UnitKind::Worker);
        assert!(matches!(result, Err(ConfigError::TemplateNotFound(_))));
    }

    #[test]
    fn test_load_invalid_template_file() {
        let file = create_temp_file("spec: {}");
        let result = load_template_file(file.path(), UnitKind::Worker);
        assert!(matches!(result, Err(ConfigError::TemplateError(_))));
    }

    #[test]
    fn test_load_templates_derives_scheduler() {
        let file = create_temp_file(WORKER);
        let mut config = ClusterConfig::new("c1");
        config.worker_template_path = file.path().to_path_buf();

        let (scheduler, worker) = load_templates(&config).unwrap();
        assert_eq!(scheduler.kind(), UnitKind::Scheduler);
        assert_eq!(scheduler.args()[0], "dask-scheduler");
        assert_eq!(worker.kind(), UnitKind::Worker);
    }

    #[test]
    fn test_load_templates_explicit_scheduler() {
        let worker = create_temp_file(WORKER);
        let scheduler =
            create_temp_file("spec:\n  containers:\n    - image: custom/scheduler\n");
        let mut config = ClusterConfig::new("c1");
        config.worker_template_path = worker.path().to_path_buf();
        config.scheduler_template_path = Some(scheduler.path().to_path_buf());

        let (scheduler, _) = load_templates(&config).unwrap();
        assert_eq!(scheduler.image(), "custom/scheduler");
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.initial_workers, 0);
        assert_eq!(config.scheduler_port, 8786);
        assert!(config.max_workers.is_none());
        assert!(config.dashboard_link.is_none());
        assert_eq!(config.worker_limit, 1000);
    }

    #[test]
    fn test_validate_empty_name() {
        let config = ClusterConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_name_format() {
        assert!(ClusterConfig::new("my-cluster").validate().is_ok());
        assert!(ClusterConfig::new("My_Cluster").validate().is_err());
        assert!(ClusterConfig::new("-leading").validate().is_err());
    }

    #[test]
    fn test_validate_max_below_initial() {
        let config = ClusterConfig::new("c1")
            .with_initial_workers(5)
            .with_max_workers(2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_worker_limit() {
        let config = ClusterConfig::new("c1").with_worker_limit(10);
        assert!(config.clone().with_max_workers(10).validate().is_ok());
        assert!(matches!(
            config.clone().with_max_workers(11).validate(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            config.with_initial_workers(11).validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_scheduler_address() {
        let config = ClusterConfig::new("c1").with_namespace("team-a");
        assert_eq!(config.scheduler_address(), "tcp://c1-scheduler.team-a:8786");
    }
}
