use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{
    parse_address, PluginRegistration, SchedulerClient, SchedulerError, SchedulerLoad,
    SchedulerSession,
};

/// Scheduler client speaking to the scheduler's HTTP dashboard
#[derive(Clone)]
pub struct HttpSchedulerClient {
    client: Client,
    dashboard_port: u16,
    timeout: Duration,
}

impl HttpSchedulerClient {
    pub fn new(dashboard_port: u16) -> Self {
        let timeout = Duration::from_secs(10);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            dashboard_port,
            timeout,
        }
    }

    /// Dashboard base URL for a scheduler address
    pub fn dashboard_url(&self, address: &str) -> Result<String, SchedulerError> {
        let (host, _) = parse_address(address)?;
        Ok(format!("http://{}:{}", host, self.dashboard_port))
    }

    async fn get_json(&self, url: &str) -> Result<Value, SchedulerError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, SchedulerError> {
    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(SchedulerError::Api {
            status: status.as_u16(),
            message: text,
        });
    }
    response
        .json()
        .await
        .map_err(|e| SchedulerError::Parse(e.to_string()))
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn load(&self, address: &str) -> Result<SchedulerLoad, SchedulerError> {
        let url = format!("{}/json/counts.json", self.dashboard_url(address)?);
        let counts = self.get_json(&url).await?;
        serde_json::from_value(counts).map_err(|e| SchedulerError::Parse(e.to_string()))
    }

    async fn info(&self, address: &str) -> Result<Value, SchedulerError> {
        let url = format!("{}/json/identity.json", self.dashboard_url(address)?);
        self.get_json(&url).await
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn SchedulerSession>, SchedulerError> {
        let base_url = self.dashboard_url(address)?;
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;
        debug!("Opened scheduler session to {}", base_url);

        Ok(Box::new(HttpSchedulerSession { client, base_url }))
    }
}

/// One short-lived connection to a scheduler
struct HttpSchedulerSession {
    client: Client,
    base_url: String,
}

#[async_trait]
impl SchedulerSession for HttpSchedulerSession {
    async fn register_plugin(
        &mut self,
        registration: &PluginRegistration,
    ) -> Result<String, SchedulerError> {
        let url = format!("{}/api/v1/plugins", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(registration)
            .send()
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SchedulerError::Parse(e.to_string()))?;
        if !status.is_success() {
            return Err(SchedulerError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(text)
    }

    async fn close(self: Box<Self>) {
        debug!("Closed scheduler session to {}", self.base_url);
    }
}
