//! Coordinator view of the registry service.
//!
//! The coordinator consults the registry to authenticate engines that
//! register over the control channel and periodically reconciles its live
//! fleet against the registry's list of onboarded stations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evc_core::registry::{Credentials, Registry, RegistryEntry};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::Coordinator;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("registry error: {0}")]
    Registry(#[from] evc_core::CoreError),
}

/// Source of truth for which stations may exist.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<RegistryEntry>, DirectoryError>;

    async fn verify(&self, credentials: &Credentials) -> Result<bool, DirectoryError>;
}

/// HTTP client for a registry service running in another process.
pub struct RegistryClient {
    base_url: String,
    http: Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(RegistryClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl StationDirectory for RegistryClient {
    async fn list(&self) -> Result<Vec<RegistryEntry>, DirectoryError> {
        let response = self.http.get(self.url("/list")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn verify(&self, credentials: &Credentials) -> Result<bool, DirectoryError> {
        let response = self
            .http
            .post(self.url("/verify"))
            .json(credentials)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DirectoryError::Status { status, body })
            }
        }
    }
}

/// Registry living in the same process as the coordinator.
pub struct LocalDirectory {
    registry: Arc<Registry>,
}

impl LocalDirectory {
    pub fn new(registry: Arc<Registry>) -> Self {
        LocalDirectory { registry }
    }
}

#[async_trait]
impl StationDirectory for LocalDirectory {
    async fn list(&self) -> Result<Vec<RegistryEntry>, DirectoryError> {
        Ok(self.registry.list()?)
    }

    async fn verify(&self, credentials: &Credentials) -> Result<bool, DirectoryError> {
        Ok(self.registry.verify(
            &credentials.station_id,
            &credentials.username,
            &credentials.password,
        )?)
    }
}

/// Reconciles the coordinator with `directory` every `interval` until
/// `shutdown` flips. An unreachable registry leaves the fleet untouched.
pub fn spawn_registry_poller(
    coordinator: Arc<Coordinator>,
    directory: Arc<dyn StationDirectory>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match directory.list().await {
                Ok(entries) => {
                    let report = coordinator.reconcile_registry(&entries).await;
                    tracing::debug!(
                        registered = entries.len(),
                        admitted = report.admitted.len(),
                        removed = report.removed.len(),
                        "registry poll"
                    );
                }
                Err(error) => tracing::warn!(error = %error, "registry poll failed"),
            }
        }
        tracing::debug!("registry poller stopped");
    })
}
