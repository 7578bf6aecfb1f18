use std::time::Duration;

use reqwest::StatusCode;

use crate::{
    config::AgentConfig,
    retry::{self, RetryPolicy},
};

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("control plane internal error: {0}")]
    InternalService(String),
}

impl ControlPlaneError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlPlaneError::InternalService(_))
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        let detail = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{status}: {}", body.trim())
        };
        match status {
            StatusCode::NOT_FOUND => ControlPlaneError::NotFound(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ControlPlaneError::Unauthorized(detail)
            }
            s if s.is_client_error() => ControlPlaneError::InvalidRequest(detail),
            _ => ControlPlaneError::InternalService(detail),
        }
    }
}

/// Registers this compute with the fleet and removes it again at shutdown.
#[async_trait::async_trait]
pub trait ComputeRegistrar: Send + Sync {
    async fn register_compute(&self) -> Result<(), ControlPlaneError>;

    async fn deregister_compute(&self) -> Result<(), ControlPlaneError>;
}

#[derive(Debug, Clone, serde::Serialize)]
struct ComputeIdentity {
    compute_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fleet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
}

pub struct HttpComputeRegistrar {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    identity: ComputeIdentity,
    retry: RetryPolicy,
}

impl HttpComputeRegistrar {
    pub fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let Some(endpoint) = cfg.control_plane_endpoint.clone() else {
            anyhow::bail!("HEARTH_CONTROL_PLANE_ENDPOINT is required to register the compute");
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("hearth-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: cfg.auth_token.clone(),
            identity: ComputeIdentity {
                compute_name: cfg.compute_name.clone(),
                fleet_id: cfg.fleet_id.clone(),
                location: cfg.location.clone(),
                ip_address: cfg.ip_address.clone(),
            },
            retry: RetryPolicy::default(),
        })
    }

    async fn post_once(&self, path: &str) -> Result<(), ControlPlaneError> {
        let url = format!("{}/computes/{path}", self.endpoint);
        let mut req = self.client.post(&url).json(&self.identity);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ControlPlaneError::InternalService(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ControlPlaneError::from_status(status, body))
    }

    async fn post(&self, path: &str) -> Result<(), ControlPlaneError> {
        retry::with_backoff(
            self.retry,
            path,
            ControlPlaneError::is_transient,
            move || self.post_once(path),
        )
        .await
    }
}

#[async_trait::async_trait]
impl ComputeRegistrar for HttpComputeRegistrar {
    async fn register_compute(&self) -> Result<(), ControlPlaneError> {
        self.post("register").await?;
        tracing::info!(compute = %self.identity.compute_name, "compute registered");
        Ok(())
    }

    async fn deregister_compute(&self) -> Result<(), ControlPlaneError> {
        self.post("deregister").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_taxonomy() {
        assert!(matches!(
            ControlPlaneError::from_status(StatusCode::NOT_FOUND, String::new()),
            ControlPlaneError::NotFound(_)
        ));
        assert!(matches!(
            ControlPlaneError::from_status(StatusCode::FORBIDDEN, String::new()),
            ControlPlaneError::Unauthorized(_)
        ));
        assert!(matches!(
            ControlPlaneError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad fleet".into()),
            ControlPlaneError::InvalidRequest(msg) if msg.contains("bad fleet")
        ));
        let err = ControlPlaneError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new());
        assert!(err.is_transient());
        assert!(!ControlPlaneError::Unauthorized("x".into()).is_transient());
    }

    #[test]
    fn registrar_requires_an_endpoint() {
        let cfg = AgentConfig::from_lookup(|_| None);
        assert!(HttpComputeRegistrar::new(&cfg).is_err());
    }

    #[test]
    fn identity_omits_unknown_fields() {
        let cfg = AgentConfig::from_lookup(|name| match name {
            "HEARTH_CONTROL_PLANE_ENDPOINT" => Some("http://cp.local/".to_string()),
            "HEARTH_COMPUTE_NAME" => Some("c-1".to_string()),
            "HEARTH_FLEET_ID" => Some("fleet-9".to_string()),
            _ => None,
        });
        let registrar = HttpComputeRegistrar::new(&cfg).unwrap();
        assert_eq!(registrar.endpoint, "http://cp.local");
        let body = serde_json::to_value(&registrar.identity).unwrap();
        assert_eq!(body, serde_json::json!({"compute_name": "c-1", "fleet_id": "fleet-9"}));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_internal_service() {
        let cfg = AgentConfig::from_lookup(|name| match name {
            "HEARTH_CONTROL_PLANE_ENDPOINT" => Some("http://127.0.0.1:1".to_string()),
            _ => None,
        });
        let mut registrar = HttpComputeRegistrar::new(&cfg).unwrap();
        registrar.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let err = registrar.register_compute().await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::InternalService(_)));
    }
}
