use std::time::Duration;

use chrono::{DateTime, Utc};
use hearth_process::{ComputeStatus, ProcessId, ProcessSnapshot, TerminationReason};
use serde::de::DeserializeOwned;

/// Messages the agent sends to the control plane.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Heartbeat {
        compute_status: ComputeStatus,
        processes: Vec<ProcessSnapshot>,
    },
    ProcessTerminated {
        process_id: ProcessId,
        launch_path: String,
        event_code: u32,
        termination_reason: TerminationReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    GetRuntimeConfiguration,
}

impl OutboundMessage {
    pub fn process_terminated(
        process_id: ProcessId,
        launch_path: impl Into<String>,
        reason: TerminationReason,
        exit_code: Option<i32>,
    ) -> Self {
        OutboundMessage::ProcessTerminated {
            process_id,
            launch_path: launch_path.into(),
            event_code: reason.event_code(),
            termination_reason: reason,
            exit_code,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Heartbeat { .. } => "heartbeat",
            OutboundMessage::ProcessTerminated { .. } => "process_terminated",
            OutboundMessage::GetRuntimeConfiguration => "get_runtime_configuration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("control plane is not connected")]
    NotConnected,
    #[error("connection lost before a response arrived")]
    Disconnected,
    #[error("transport is closed")]
    Closed,
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("control plane rejected request ({code}): {message}")]
    Remote { code: String, message: String },
    #[error("encode message")]
    Encode(#[source] serde_json::Error),
    #[error("decode response")]
    Decode(#[source] serde_json::Error),
}

impl TransportError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::Disconnected | TransportError::Timeout(_)
        )
    }
}

/// Connection to the control plane.
///
/// Callers must not cache `current_connection()`; it changes across
/// reconnects.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget. Dropped silently when there is no open connection.
    fn send_async(&self, message: OutboundMessage);

    async fn send_request(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    fn current_connection(&self) -> Option<ConnectionInfo>;

    async fn close(&self);
}

/// `send_request` with the response decoded into `T`.
pub async fn request<T: DeserializeOwned>(
    transport: &dyn Transport,
    message: OutboundMessage,
    timeout: Duration,
) -> Result<T, TransportError> {
    let value = transport.send_request(message, timeout).await?;
    serde_json::from_value(value).map_err(TransportError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use hearth_process::RuntimeConfiguration;

    #[test]
    fn process_terminated_carries_event_code() {
        let id = ProcessId::new();
        let msg = OutboundMessage::process_terminated(id, "/srv/game", TerminationReason::Crashed, Some(17));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "process_terminated");
        assert_eq!(v["event_code"], 1001);
        assert_eq!(v["termination_reason"], "CRASHED");
        assert_eq!(v["exit_code"], 17);
        assert_eq!(v["process_id"], id.to_string());
    }

    #[test]
    fn launch_failures_omit_exit_code() {
        let msg = OutboundMessage::process_terminated(
            ProcessId::new(),
            "/missing",
            TerminationReason::InvalidLaunchPath,
            None,
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("exit_code").is_none());
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::NotConnected.is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(
            !TransportError::Remote {
                code: "INVALID".to_string(),
                message: "bad".to_string()
            }
            .is_transient()
        );
    }

    #[tokio::test]
    async fn typed_request_decodes_response() {
        let transport = RecordingTransport::connected();
        transport.push_response(Ok(serde_json::json!({
            "server_processes": [{"launch_path": "/srv/game", "concurrent_executions": 2}]
        })));

        let cfg: RuntimeConfiguration = request(
            &transport,
            OutboundMessage::GetRuntimeConfiguration,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(cfg.desired_total(), 2);
    }

    #[tokio::test]
    async fn typed_request_reports_decode_errors() {
        let transport = RecordingTransport::connected();
        transport.push_response(Ok(serde_json::json!({"server_processes": 7})));

        let err = request::<RuntimeConfiguration>(
            &transport,
            OutboundMessage::GetRuntimeConfiguration,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }
}
