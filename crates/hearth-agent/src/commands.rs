use std::sync::Arc;

use chrono::{DateTime, Utc};
use hearth_process::{ProcessId, TerminationReason};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::{RegistryError, format_error_chain},
    process_registry::ProcessRegistry,
    shutdown::ShutdownCoordinator,
};

/// Instructions pushed by the control plane.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlCommand {
    /// The worker's SDK finished registering.
    ProcessReady {
        process_id: ProcessId,
        #[serde(default)]
        log_paths: Vec<String>,
    },
    SessionActivated {
        process_id: ProcessId,
        session_id: String,
    },
    TerminateProcess {
        process_id: ProcessId,
    },
    ProcessUnhealthy {
        process_id: ProcessId,
    },
    StartTermination {
        deadline_unix_ms: i64,
    },
}

pub struct CommandDispatcher {
    registry: ProcessRegistry,
    shutdown: Arc<ShutdownCoordinator>,
}

impl CommandDispatcher {
    pub fn new(registry: ProcessRegistry, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self { registry, shutdown }
    }

    pub fn handle(&self, command: ControlCommand) -> anyhow::Result<()> {
        tracing::debug!(?command, "control command");
        let res = match command {
            ControlCommand::ProcessReady {
                process_id,
                log_paths,
            } => self.registry.update_on_registration(process_id, log_paths),
            ControlCommand::SessionActivated {
                process_id,
                session_id,
            } => self
                .registry
                .update_on_session_activation(process_id, session_id),
            ControlCommand::TerminateProcess { process_id } => {
                return self
                    .registry
                    .terminate_by_uuid(process_id, Some(TerminationReason::ForciblyTerminated));
            }
            ControlCommand::ProcessUnhealthy { process_id } => {
                return self
                    .registry
                    .terminate_by_uuid(process_id, Some(TerminationReason::Unhealthy));
            }
            ControlCommand::StartTermination { deadline_unix_ms } => {
                let Some(deadline) = DateTime::<Utc>::from_timestamp_millis(deadline_unix_ms)
                else {
                    anyhow::bail!("deadline out of range: {deadline_unix_ms}");
                };
                self.shutdown.start_termination(deadline, false);
                return Ok(());
            }
        };

        match res {
            Err(RegistryError::NotFound(id)) => {
                tracing::warn!(process_id = %id, "command for unknown worker ignored");
                Ok(())
            }
            other => other.map_err(anyhow::Error::from),
        }
    }

    pub fn spawn(self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                if let Err(err) = self.handle(command) {
                    tracing::warn!(error = %format_error_chain(&err), "control command failed");
                }
            }
        })
    }
}
