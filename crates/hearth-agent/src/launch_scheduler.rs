use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hearth_process::{ProcessConfiguration, TerminationReason};
use tokio::task::JoinHandle;

use crate::{
    compute_state::ComputeState, error::format_error_chain, process_registry::ProcessRegistry,
    runtime_config::RuntimeConfigSource,
};

/// Pause applied after every launch attempt.
///
/// Starts at `max`. Each launch that comes up alive shortens it by `step`
/// down to `min`; anything else puts it back to `max`.
#[derive(Debug, Clone, Copy)]
pub struct LaunchThrottle {
    max: Duration,
    min: Duration,
    step: Duration,
    current: Duration,
}

impl LaunchThrottle {
    pub fn new(max: Duration, min: Duration, step: Duration) -> Self {
        let min = min.min(max);
        Self {
            max,
            min,
            step,
            current: max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn record_success(&mut self) {
        self.current = self.current.saturating_sub(self.step).max(self.min);
    }

    pub fn record_failure(&mut self) {
        self.current = self.max;
    }
}

/// Periodically launches workers until the live set matches the desired
/// layout.
pub struct LaunchScheduler {
    state: Arc<ComputeState>,
    registry: ProcessRegistry,
    config_source: Arc<dyn RuntimeConfigSource>,
    interval: Duration,
    throttle: Mutex<LaunchThrottle>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LaunchScheduler {
    pub fn new(
        state: Arc<ComputeState>,
        registry: ProcessRegistry,
        config_source: Arc<dyn RuntimeConfigSource>,
        interval: Duration,
        throttle: LaunchThrottle,
    ) -> Self {
        Self {
            state,
            registry,
            config_source,
            interval,
            throttle: Mutex::new(throttle),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.tick().await;
            }
        });
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "launch scheduler started");
    }

    /// Cancels the loop. A launch already handed to the OS is not undone.
    pub fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("launch scheduler stopped");
        }
    }

    pub fn throttle_delay(&self) -> Duration {
        self.throttle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current()
    }

    pub async fn tick(&self) {
        if let Err(err) = self.run_once().await {
            tracing::warn!(error = %format_error_chain(&err), "launch tick failed");
        }
    }

    /// One reconciliation pass. Returns how many launches were attempted.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        if self.state.is_terminating_or_terminated() || self.state.is_initializing() {
            return Ok(0);
        }

        for id in self.registry.initialization_timed_out_uuids() {
            tracing::warn!(process_id = %id, "worker never registered; terminating");
            if let Err(err) = self
                .registry
                .terminate_by_uuid(id, Some(TerminationReason::SdkRegistrationTimeout))
            {
                tracing::warn!(
                    process_id = %id,
                    error = %format_error_chain(&err),
                    "terminate unregistered worker failed"
                );
            }
        }

        let desired = self.config_source.runtime_configuration().await?;
        let desired_total = desired.desired_total();
        if desired_total == 0 {
            tracing::debug!("runtime configuration not available yet");
            return Ok(0);
        }

        let live = self.registry.counts_by_configuration();
        let live_total: u64 = live.values().map(|n| u64::from(*n)).sum();
        let mut vacancy = desired_total.saturating_sub(live_total);
        if vacancy == 0 {
            return Ok(0);
        }

        tracing::debug!(desired_total, live_total, vacancy, "reconciling workers");
        let mut attempted = 0usize;
        for config in &desired.server_processes {
            if vacancy == 0 {
                break;
            }
            let running = live.get(config).copied().unwrap_or(0);
            let needed = u64::from(config.concurrent_executions.saturating_sub(running));
            let launches = needed.min(vacancy);
            for _ in 0..launches {
                if self.state.is_terminating_or_terminated() {
                    return Ok(attempted);
                }
                self.launch_one(config).await;
                attempted += 1;
                vacancy -= 1;
            }
        }
        Ok(attempted)
    }

    async fn launch_one(&self, config: &ProcessConfiguration) {
        let came_up = match self.registry.start_from_configuration(config) {
            Ok(id) => {
                let alive = self.registry.is_alive(id);
                if !alive {
                    tracing::warn!(process_id = %id, "worker died right after launch");
                }
                alive
            }
            Err(err) => {
                tracing::warn!(
                    launch_path = %config.launch_path,
                    error = %format_error_chain(&anyhow::Error::new(err)),
                    "worker launch failed"
                );
                false
            }
        };

        let delay = {
            let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
            if came_up {
                throttle.record_success();
            } else {
                throttle.record_failure();
            }
            throttle.current()
        };
        tokio::time::sleep(delay).await;
    }
}
