use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    ClusterConfig, WorkloadTemplate, DEFAULT_DASHBOARD_PORT, DEFAULT_SCHEDULER_PORT,
    DEFAULT_WORKER_LIMIT,
};

/// Default port of the control surface
pub const DEFAULT_PORT: u16 = 8892;

/// Orchestrator backend selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrchestratorKind {
    /// Containers on the local Docker daemon
    Docker,
    /// In-process units, for local experimentation
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "elastic-cluster")]
#[command(about = "Run and resize an elastic scheduler/worker compute cluster")]
#[command(version)]
pub struct Args {
    /// Cluster name, used as the prefix of every unit
    #[arg(long, env = "CLUSTER_NAME")]
    pub name: String,

    /// Namespace the units are grouped under
    #[arg(long, env = "CLUSTER_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Path to the worker template (YAML or JSON)
    #[arg(
        long,
        env = "WORKER_TEMPLATE",
        value_name = "FILE",
        default_value = "/etc/config/worker_spec.yaml"
    )]
    pub worker_template: PathBuf,

    /// Path to the scheduler template; derived from the worker template if omitted
    #[arg(long, env = "SCHEDULER_TEMPLATE", value_name = "FILE")]
    pub scheduler_template: Option<PathBuf>,

    /// Workers requested at creation
    #[arg(long, env = "INITIAL_WORKERS", default_value = "0")]
    pub initial_workers: u32,

    /// Start in adaptive mode with this upper bound
    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<u32>,

    /// Dashboard URL reported by /info
    #[arg(long, env = "DASHBOARD_LINK")]
    pub dashboard_link: Option<String>,

    /// Scheduler idle timeout in minutes (derived scheduler template only)
    #[arg(long, env = "SCHEDULER_IDLE_TIMEOUT_MIN", value_name = "MINUTES")]
    pub scheduler_idle_timeout: Option<u64>,

    /// Largest worker count a scale or adapt request may ask for
    #[arg(long, env = "WORKER_LIMIT", default_value_t = DEFAULT_WORKER_LIMIT)]
    pub worker_limit: u32,

    /// Seconds between adaptive reconciliation ticks
    #[arg(long, env = "ADAPT_INTERVAL_SECS", default_value = "30")]
    pub adapt_interval: u64,

    /// Seconds to wait for the scheduler unit to report ready
    #[arg(long, env = "READY_TIMEOUT_SECS", default_value = "300")]
    pub ready_timeout: u64,

    /// Orchestrator backend
    #[arg(long, env = "ORCHESTRATOR", value_enum, default_value = "docker")]
    pub orchestrator: OrchestratorKind,

    /// Docker network the units join
    #[arg(long, env = "DOCKER_NETWORK", default_value = "bridge")]
    pub docker_network: String,

    /// Bind address of the control surface
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port of the control surface
    #[arg(short, long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and templates without creating anything
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    /// Controller configuration described by these arguments
    pub fn to_config(&self) -> ClusterConfig {
        ClusterConfig {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            worker_template_path: self.worker_template.clone(),
            scheduler_template_path: self.scheduler_template.clone(),
            initial_workers: self.initial_workers,
            max_workers: self.max_workers,
            dashboard_link: self.dashboard_link.clone(),
            scheduler_idle_timeout_mins: self.scheduler_idle_timeout,
            scheduler_port: DEFAULT_SCHEDULER_PORT,
            dashboard_port: DEFAULT_DASHBOARD_PORT,
            ready_timeout: Duration::from_secs(self.ready_timeout),
            adapt_interval: Duration::from_secs(self.adapt_interval),
            worker_limit: self.worker_limit,
            ..ClusterConfig::default()
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run summary of the cluster that would be created.
/// Pure function - returns a formatted string.
pub fn format_dry_run(
    config: &ClusterConfig,
    scheduler: &WorkloadTemplate,
    worker: &WorkloadTemplate,
    args: &Args,
) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "elastic-cluster v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));

    output.push_str(&format!("Cluster: {}\n", config.name));
    output.push_str(&format!("Namespace: {}\n", config.namespace));
    output.push_str(&format!("Orchestrator: {:?}\n", args.orchestrator).to_lowercase());
    output.push_str(&format!("Scheduler address: {}\n", config.scheduler_address()));
    if let Some(ref link) = config.dashboard_link {
        output.push_str(&format!("Dashboard: {}\n", link));
    }
    output.push('\n');

    output.push_str("Scheduler:\n");
    output.push_str(&format!("  Image: {}\n", scheduler.image()));
    let source = config
        .scheduler_template_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "derived from worker template".to_string());
    output.push_str(&format!("  Template: {}\n", source));
    if !scheduler.args().is_empty() {
        output.push_str(&format!("  Args: {}\n", scheduler.args().join(" ")));
    }

    output.push_str("\nWorkers:\n");
    output.push_str(&format!("  Image: {}\n", worker.image()));
    output.push_str(&format!(
        "  Template: {}\n",
        config.worker_template_path.display()
    ));
    output.push_str(&format!("  Initial: {}\n", config.initial_workers));
    match config.max_workers {
        Some(max) => output.push_str(&format!(
            "  Mode: adaptive [{}, {}] every {:?}\n",
            config.initial_workers, max, config.adapt_interval
        )),
        None => output.push_str("  Mode: manual\n"),
    }

    output.push_str(&format!("\nControl surface: {}\n", args.listen_addr()));
    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start cluster. Remove --dry-run to execute.\n");

    output
}
