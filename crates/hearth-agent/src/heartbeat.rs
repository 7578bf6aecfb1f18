use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hearth_process::ComputeStatus;
use tokio::task::JoinHandle;

use crate::{
    compute_state::ComputeState,
    process_registry::ProcessRegistry,
    transport::{OutboundMessage, Transport},
};

/// Advances the compute through activation and reports liveness.
pub struct HeartbeatMonitor {
    state: Arc<ComputeState>,
    registry: ProcessRegistry,
    transport: Arc<dyn Transport>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        state: Arc<ComputeState>,
        registry: ProcessRegistry,
        transport: Arc<dyn Transport>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            transport,
            interval,
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.tick();
            }
        });
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    pub fn tick(&self) {
        match self.state.status() {
            ComputeStatus::Initializing if self.transport.current_connection().is_some() => {
                self.state.report_activating();
            }
            ComputeStatus::Activating if self.registry.has_active_process() => {
                self.state.report_active();
            }
            _ => {}
        }
        self.send_now();
    }

    /// Sends a heartbeat outside the regular cadence.
    pub fn send_now(&self) {
        let compute_status = self.state.status();
        let processes = self.registry.snapshots();
        tracing::debug!(%compute_status, processes = processes.len(), "heartbeat");
        self.transport.send_async(OutboundMessage::Heartbeat {
            compute_status,
            processes,
        });
    }
}
