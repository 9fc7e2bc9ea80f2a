use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cluster::ClusterController;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ClusterController>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: ClusterController) -> Self {
        Self {
            controller: Arc::new(controller),
            started_at: Utc::now(),
        }
    }

    /// Seconds since the control surface came up
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
