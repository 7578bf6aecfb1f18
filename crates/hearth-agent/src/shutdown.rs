use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use hearth_process::ComputeStatus;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    compute_state::ComputeState,
    config::AgentConfig,
    control_plane::ComputeRegistrar,
    error::format_error_chain,
    heartbeat::HeartbeatMonitor,
    launch_scheduler::LaunchScheduler,
    log_upload::LogUploadQueue,
    process_registry::ProcessRegistry,
    transport::Transport,
};

#[derive(Debug, Clone, Copy)]
pub struct ShutdownSettings {
    pub check_interval: Duration,
    pub process_wait: Duration,
    pub poll_interval: Duration,
    pub log_upload_wait: Duration,
    pub transport_close_wait: Duration,
}

impl ShutdownSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            check_interval: cfg.shutdown_check_interval,
            process_wait: cfg.shutdown_process_wait,
            poll_interval: cfg.shutdown_poll_interval,
            log_upload_wait: cfg.log_upload_wait,
            transport_close_wait: Duration::from_secs(5),
        }
    }
}

/// Drives the compute from "asked to stop" to fully torn down.
///
/// Two triggers race to finish the job: a repeating check that completes as
/// soon as no workers are left, and a one-shot timer at the hard deadline.
/// Both end in [`ShutdownCoordinator::complete_termination`], which runs its
/// side effects at most once.
pub struct ShutdownCoordinator {
    state: Arc<ComputeState>,
    registry: ProcessRegistry,
    scheduler: Arc<LaunchScheduler>,
    heartbeat: Arc<HeartbeatMonitor>,
    transport: Arc<dyn Transport>,
    log_uploads: LogUploadQueue,
    registrar: Option<Arc<dyn ComputeRegistrar>>,
    settings: ShutdownSettings,

    completion: tokio::sync::Mutex<()>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    early_check_armed: AtomicBool,
    hard_deadline: Mutex<Option<HardDeadline>>,
    terminated: watch::Sender<bool>,
}

/// The pending forced completion; only the earliest requested deadline is
/// kept.
struct HardDeadline {
    at: DateTime<Utc>,
    task: JoinHandle<()>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ComputeState>,
        registry: ProcessRegistry,
        scheduler: Arc<LaunchScheduler>,
        heartbeat: Arc<HeartbeatMonitor>,
        transport: Arc<dyn Transport>,
        log_uploads: LogUploadQueue,
        registrar: Option<Arc<dyn ComputeRegistrar>>,
        settings: ShutdownSettings,
    ) -> Arc<Self> {
        let (terminated, _) = watch::channel(false);
        Arc::new(Self {
            state,
            registry,
            scheduler,
            heartbeat,
            transport,
            log_uploads,
            registrar,
            settings,
            completion: tokio::sync::Mutex::new(()),
            timers: Mutex::new(Vec::new()),
            early_check_armed: AtomicBool::new(false),
            hard_deadline: Mutex::new(None),
            terminated,
        })
    }

    pub fn start_termination(self: &Arc<Self>, deadline: DateTime<Utc>, is_interruption: bool) {
        if self.state.status() == ComputeStatus::Terminated {
            tracing::debug!("termination requested after completion; ignoring");
            return;
        }

        tracing::info!(%deadline, is_interruption, "termination requested");
        if is_interruption {
            self.state.report_interrupted();
            self.heartbeat.send_now();
        } else {
            self.state.report_terminating();
        }
        self.scheduler.stop();

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            tracing::info!("termination deadline already passed; completing now");
            self.request_completion();
            return;
        }

        self.arm_early_check();
        self.arm_hard_deadline(deadline, remaining);
    }

    fn arm_early_check(self: &Arc<Self>) {
        if self.early_check_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let early = tokio::spawn({
            let this = self.clone();
            async move {
                let mut ticker = tokio::time::interval(this.settings.check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if this.is_terminated() {
                        break;
                    }
                    if this.registry.is_empty() {
                        this.complete_termination().await;
                        break;
                    }
                    tracing::info!(
                        remaining_processes = this.registry.len(),
                        "waiting for workers to exit before shutdown"
                    );
                }
            }
        });
        self.track(early);
    }

    /// Schedules forced completion at `deadline` unless an earlier one is
    /// already pending. A later request never postpones completion.
    fn arm_hard_deadline(self: &Arc<Self>, deadline: DateTime<Utc>, remaining: Duration) {
        let mut slot = self.hard_deadline.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref() {
            if current.at <= deadline {
                tracing::debug!(
                    pending = %current.at,
                    %deadline,
                    "keeping earlier termination deadline"
                );
                return;
            }
            tracing::info!(
                previous = %current.at,
                %deadline,
                "termination deadline moved earlier"
            );
            current.task.abort();
        }
        let task = tokio::spawn({
            let this = self.clone();
            async move {
                tokio::time::sleep(remaining).await;
                tracing::warn!("termination deadline reached");
                this.complete_termination().await;
            }
        });
        *slot = Some(HardDeadline { at: deadline, task });
    }

    fn request_completion(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.complete_termination().await });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub async fn complete_termination(&self) {
        let _serialized = self.completion.lock().await;
        if self.state.status() == ComputeStatus::Terminated {
            return;
        }
        tracing::info!("completing termination");

        if let Some(registrar) = &self.registrar {
            match registrar.deregister_compute().await {
                Ok(()) => tracing::info!("compute deregistered"),
                Err(err) => tracing::warn!(
                    error = %format_error_chain(&anyhow::Error::new(err)),
                    "deregister compute failed"
                ),
            }
        }

        if !self.state.report_terminated() {
            return;
        }
        self.scheduler.stop();

        if let Err(err) = self
            .registry
            .terminate_all_for_shutdown(self.settings.process_wait, self.settings.poll_interval)
            .await
        {
            tracing::warn!(error = %err, "workers still running at shutdown");
        }

        self.heartbeat.send_now();
        self.heartbeat.stop();

        self.log_uploads.shutdown(self.settings.log_upload_wait).await;

        match tokio::time::timeout(
            self.settings.log_upload_wait,
            self.log_uploads.upload_agent_logs(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                error = %format_error_chain(&err),
                "agent log upload failed"
            ),
            Err(_) => tracing::warn!("agent log upload timed out"),
        }

        if tokio::time::timeout(self.settings.transport_close_wait, self.transport.close())
            .await
            .is_err()
        {
            tracing::warn!("transport did not close in time");
        }

        let timers = std::mem::take(&mut *self.timers.lock().unwrap_or_else(|e| e.into_inner()));
        for timer in timers {
            timer.abort();
        }
        if let Some(hard) = self
            .hard_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            hard.task.abort();
        }

        tracing::info!("termination complete");
        self.terminated.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub async fn wait_terminated(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}
