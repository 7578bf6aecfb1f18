use std::{
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use anyhow::Context;
use hearth_process::RuntimeConfiguration;
use tokio::task::JoinHandle;

use crate::{
    error::format_error_chain,
    retry::{self, RetryPolicy},
    transport::{self, OutboundMessage, Transport, TransportError},
};

/// Where the desired fleet layout for this compute comes from.
#[async_trait::async_trait]
pub trait RuntimeConfigSource: Send + Sync {
    async fn runtime_configuration(&self) -> anyhow::Result<RuntimeConfiguration>;
}

/// A layout fixed at boot, usually read from a file.
pub struct StaticRuntimeConfig {
    config: RuntimeConfiguration,
}

impl StaticRuntimeConfig {
    pub fn new(config: RuntimeConfiguration) -> Self {
        Self { config }
    }

    /// Parses TOML, YAML or JSON depending on the file extension.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read runtime configuration {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let config: RuntimeConfiguration = match ext.as_str() {
            "toml" => toml::from_str(&raw).context("parse toml runtime configuration")?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&raw).context("parse yaml runtime configuration")?
            }
            "json" => serde_json::from_str(&raw).context("parse json runtime configuration")?,
            other => anyhow::bail!("unsupported runtime configuration format: {other:?}"),
        };
        tracing::info!(
            path = %path.display(),
            configurations = config.server_processes.len(),
            desired_total = config.desired_total(),
            "runtime configuration loaded"
        );
        Ok(Self::new(config))
    }
}

#[async_trait::async_trait]
impl RuntimeConfigSource for StaticRuntimeConfig {
    async fn runtime_configuration(&self) -> anyhow::Result<RuntimeConfiguration> {
        Ok(self.config.clone())
    }
}

/// Layout fetched from the control plane and cached.
///
/// Reads never block on the network: they return the last good value, or
/// an empty layout before the first successful fetch.
pub struct RemoteRuntimeConfig {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    retry: RetryPolicy,
    cached: RwLock<RuntimeConfiguration>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteRuntimeConfig {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
            retry: RetryPolicy::default(),
            cached: RwLock::new(RuntimeConfiguration::default()),
            refresher: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn refresh(&self) -> Result<(), TransportError> {
        let conn: &dyn Transport = self.transport.as_ref();
        let timeout = self.request_timeout;
        let fetched: RuntimeConfiguration = retry::with_backoff(
            self.retry,
            "get runtime configuration",
            TransportError::is_transient,
            move || transport::request(conn, OutboundMessage::GetRuntimeConfiguration, timeout),
        )
        .await?;

        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        if *cached != fetched {
            tracing::info!(
                configurations = fetched.server_processes.len(),
                desired_total = fetched.desired_total(),
                max_concurrent_activations = ?fetched.max_concurrent_game_session_activations,
                activation_timeout_sec = ?fetched.game_session_activation_timeout_seconds,
                "runtime configuration changed"
            );
            *cached = fetched;
        }
        Ok(())
    }

    pub fn start(self: &Arc<Self>, every: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = this.refresh().await {
                    tracing::warn!(
                        error = %format_error_chain(&anyhow::Error::new(err)),
                        "runtime configuration refresh failed"
                    );
                }
            }
        });
        if let Some(old) = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl RuntimeConfigSource for RemoteRuntimeConfig {
    async fn runtime_configuration(&self) -> anyhow::Result<RuntimeConfiguration> {
        Ok(self
            .cached
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
