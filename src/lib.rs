//! elastic-cluster - lifecycle controller for an elastic scheduler/worker
//! compute cluster.
//!
//! A [`cluster::ClusterController`] creates a scheduler unit and a pool of
//! worker units from [`config::WorkloadTemplate`]s through an
//! [`orchestrator::OrchestratorClient`], resizes the pool manually or
//! adaptively from the scheduler's load, and tears everything down on close.
//! The [`server`] module exposes it over HTTP.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
