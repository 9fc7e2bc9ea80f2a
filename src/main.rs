use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use elastic_cluster::cli::{format_dry_run, Args, OrchestratorKind};
use elastic_cluster::cluster::{ClusterController, TemplatePair};
use elastic_cluster::config::load_templates;
use elastic_cluster::orchestrator::{DockerOrchestrator, InMemoryOrchestrator, SharedOrchestrator};
use elastic_cluster::scheduler::HttpSchedulerClient;
use elastic_cluster::server::{create_router, shutdown_signal, AppState};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.to_config();
    config.validate().context("Invalid configuration")?;

    let (scheduler_template, worker_template) = load_templates(&config).with_context(|| {
        format!(
            "Failed to load templates from {}",
            config.worker_template_path.display()
        )
    })?;

    // Dry-run mode: print cluster info and exit
    if args.dry_run {
        let output = format_dry_run(&config, &scheduler_template, &worker_template, &args);
        println!("{}", output);
        return Ok(());
    }

    let orchestrator: SharedOrchestrator = match args.orchestrator {
        OrchestratorKind::Docker => Arc::new(DockerOrchestrator::new(&args.docker_network)),
        OrchestratorKind::Memory => Arc::new(InMemoryOrchestrator::new()),
    };
    let scheduler = Arc::new(HttpSchedulerClient::new(config.dashboard_port));

    let controller = ClusterController::create(
        config,
        TemplatePair::new(scheduler_template, worker_template),
        orchestrator,
        scheduler,
    )
    .await
    .context("Failed to create cluster")?;

    let state = AppState::new(controller);
    let controller = state.controller.clone();
    let app = create_router(state);

    let addr = args.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Control surface listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /               - Cluster descriptor");
    info!("  GET  /health         - Health check");
    info!("  GET  /status         - Cluster status");
    info!("  GET  /info           - Scheduler address and dashboard link");
    info!("  GET  /scheduler_info - Scheduler metadata");
    info!("  POST /scale          - Set a fixed worker count");
    info!("  POST /adapt          - Enter adaptive mode");
    info!("  POST /register       - Register a scheduler plugin");
    info!("  POST /close          - Tear the cluster down");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, closing cluster");
    if let Err(e) = controller.close().await {
        warn!("Close on shutdown: {}", e);
    }
    Ok(())
}
