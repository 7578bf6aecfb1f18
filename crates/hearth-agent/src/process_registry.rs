use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hearth_process::{
    ProcessConfiguration, ProcessId, ProcessSnapshot, ProcessStatus, TerminationReason,
};

use crate::{
    error::{RegistryError, format_error_chain},
    log_upload::{LogUploadQueue, LogUploadRequest},
    os_process::{ProcessHandle, ProcessLauncher},
    transport::{OutboundMessage, Transport},
};

/// One worker owned by this agent.
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    id: ProcessId,
    configuration: ProcessConfiguration,
    status: ProcessStatus,
    termination_reason: Option<TerminationReason>,
    log_paths: Vec<String>,
    session_id: Option<String>,
    launched_at: DateTime<Utc>,
    started: Instant,
    handle: Arc<dyn ProcessHandle>,
}

impl ManagedProcess {
    fn has_timed_out_for_initialization(&self, timeout: Duration) -> bool {
        self.status == ProcessStatus::Initializing && self.started.elapsed() > timeout
    }

    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            process_id: self.id,
            status: self.status,
            launch_path: self.configuration.launch_path.clone(),
            parameters: self.configuration.parameters.clone(),
            launched_at: self.launched_at,
            session_id: self.session_id.clone(),
        }
    }
}

/// The set of workers this agent currently owns.
///
/// An entry is inserted right after a successful launch and removed only by
/// that worker's exit continuation, after the termination notice and log
/// upload have been queued.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    processes: DashMap<ProcessId, ManagedProcess>,
    launcher: Arc<dyn ProcessLauncher>,
    transport: Arc<dyn Transport>,
    log_uploads: LogUploadQueue,
    registration_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        transport: Arc<dyn Transport>,
        log_uploads: LogUploadQueue,
        registration_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                processes: DashMap::new(),
                launcher,
                transport,
                log_uploads,
                registration_timeout,
            }),
        }
    }

    pub fn start_from_configuration(
        &self,
        config: &ProcessConfiguration,
    ) -> Result<ProcessId, RegistryError> {
        let id = ProcessId::new();
        let launched = match self.inner.launcher.launch(id, config) {
            Ok(launched) => launched,
            Err(err @ RegistryError::BadExecutablePath { .. }) => {
                tracing::warn!(process_id = %id, error = %err, "worker launch rejected");
                self.inner.transport.send_async(OutboundMessage::process_terminated(
                    id,
                    config.launch_path.clone(),
                    TerminationReason::InvalidLaunchPath,
                    None,
                ));
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.inner.processes.insert(
            id,
            ManagedProcess {
                id,
                configuration: config.clone(),
                status: ProcessStatus::Initializing,
                termination_reason: None,
                log_paths: Vec::new(),
                session_id: None,
                launched_at: Utc::now(),
                started: Instant::now(),
                handle: launched.handle,
            },
        );

        let registry = self.clone();
        let exit = launched.exit;
        tokio::spawn(async move {
            let exit_code = match exit.await {
                Ok(code) => code,
                Err(_) => {
                    tracing::warn!(process_id = %id, "exit notification lost; assuming crash");
                    -1
                }
            };
            registry.on_process_exit(id, exit_code);
        });

        Ok(id)
    }

    fn on_process_exit(&self, id: ProcessId, exit_code: i32) {
        let Some(details) = self.inner.processes.get(&id).map(|p| {
            (
                p.configuration.launch_path.clone(),
                p.termination_reason
                    .unwrap_or_else(|| TerminationReason::from_exit_code(exit_code)),
                p.log_paths.clone(),
                p.session_id.clone(),
            )
        }) else {
            tracing::warn!(process_id = %id, "exit for an untracked worker");
            return;
        };
        let (launch_path, reason, log_paths, session_id) = details;

        tracing::info!(
            process_id = %id,
            exit_code,
            reason = %reason,
            event_code = reason.event_code(),
            "worker exited"
        );

        self.inner.transport.send_async(OutboundMessage::process_terminated(
            id,
            launch_path.clone(),
            reason,
            Some(exit_code),
        ));

        if let Err(err) = self.inner.log_uploads.submit(LogUploadRequest {
            process_id: id,
            launch_path,
            log_paths,
            session_id,
        }) {
            tracing::warn!(
                process_id = %id,
                error = %format_error_chain(&err),
                "queue worker log upload failed"
            );
        }

        self.inner.processes.remove(&id);
    }

    /// Requests termination of one worker. Unknown ids are ignored; the entry
    /// disappears later, when the exit continuation runs.
    pub fn terminate_by_uuid(
        &self,
        id: ProcessId,
        reason: Option<TerminationReason>,
    ) -> anyhow::Result<()> {
        let handle = {
            let Some(mut process) = self.inner.processes.get_mut(&id) else {
                tracing::debug!(process_id = %id, "terminate for untracked worker ignored");
                return Ok(());
            };
            if let Some(reason) = reason {
                process.termination_reason = Some(reason);
            }
            process.handle.clone()
        };

        tracing::info!(process_id = %id, reason = ?reason, "terminating worker");
        handle
            .terminate()
            .with_context(|| format!("terminate worker {id}"))
    }

    pub async fn terminate_all_for_shutdown(
        &self,
        total_wait: Duration,
        poll_wait: Duration,
    ) -> Result<(), RegistryError> {
        for id in self.all_uuids() {
            if let Err(err) = self.terminate_by_uuid(id, Some(TerminationReason::ComputeShuttingDown))
            {
                tracing::warn!(
                    process_id = %id,
                    error = %format_error_chain(&err),
                    "terminate during shutdown failed"
                );
            }
        }

        let deadline = tokio::time::Instant::now() + total_wait;
        loop {
            if self.is_empty() {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_wait.min(deadline - now)).await;
        }

        Err(RegistryError::NotFinished {
            remaining: self.len(),
            waited: total_wait,
        })
    }

    pub fn initialization_timed_out_uuids(&self) -> Vec<ProcessId> {
        self.inner
            .processes
            .iter()
            .filter(|p| p.has_timed_out_for_initialization(self.inner.registration_timeout))
            .map(|p| p.id)
            .collect()
    }

    pub fn counts_by_configuration(&self) -> HashMap<ProcessConfiguration, u32> {
        let mut counts = HashMap::new();
        for p in self.inner.processes.iter() {
            *counts.entry(p.configuration.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn update_on_registration(
        &self,
        id: ProcessId,
        log_paths: Vec<String>,
    ) -> Result<(), RegistryError> {
        let mut process = self
            .inner
            .processes
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        process.log_paths = log_paths;
        process.status = ProcessStatus::Active;
        drop(process);
        tracing::info!(process_id = %id, "worker registered");
        Ok(())
    }

    pub fn update_on_session_activation(
        &self,
        id: ProcessId,
        session_id: String,
    ) -> Result<(), RegistryError> {
        let mut process = self
            .inner
            .processes
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        tracing::info!(process_id = %id, %session_id, "game session activated");
        process.session_id = Some(session_id);
        Ok(())
    }

    pub fn all_uuids(&self) -> Vec<ProcessId> {
        self.inner.processes.iter().map(|p| *p.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.processes.is_empty()
    }

    pub fn has_active_process(&self) -> bool {
        self.inner
            .processes
            .iter()
            .any(|p| p.status == ProcessStatus::Active)
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        let mut out: Vec<ProcessSnapshot> =
            self.inner.processes.iter().map(|p| p.snapshot()).collect();
        out.sort_by_key(|s| s.launched_at);
        out
    }

    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.inner
            .processes
            .get(&id)
            .map(|p| p.handle.is_alive())
            .unwrap_or(false)
    }
}
