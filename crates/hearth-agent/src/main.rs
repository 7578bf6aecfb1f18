use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

mod commands;
mod compute_state;
mod config;
mod control_plane;
mod error;
mod heartbeat;
mod interruption;
mod launch_scheduler;
mod log_upload;
mod logging;
mod os_process;
mod process_registry;
mod retry;
mod runtime_config;
mod shutdown;
#[cfg(test)]
mod testing;
mod transport;
mod ws_transport;

use crate::{
    commands::CommandDispatcher,
    compute_state::ComputeState,
    config::AgentConfig,
    control_plane::{ComputeRegistrar, HttpComputeRegistrar},
    heartbeat::HeartbeatMonitor,
    interruption::InterruptionMonitor,
    launch_scheduler::{LaunchScheduler, LaunchThrottle},
    log_upload::{LogUploadQueue, ZipLogArchiver},
    os_process::OsProcessLauncher,
    process_registry::ProcessRegistry,
    runtime_config::{RemoteRuntimeConfig, RuntimeConfigSource, StaticRuntimeConfig},
    shutdown::{ShutdownCoordinator, ShutdownSettings},
    transport::Transport,
    ws_transport::{WsSettings, WsTransport},
};

fn worker_env(cfg: &AgentConfig) -> Vec<(String, String)> {
    let mut env = vec![("HEARTH_COMPUTE_NAME".to_string(), cfg.compute_name.clone())];
    if let Some(fleet) = &cfg.fleet_id {
        env.push(("HEARTH_FLEET_ID".to_string(), fleet.clone()));
    }
    if let Some(location) = &cfg.location {
        env.push(("HEARTH_LOCATION".to_string(), location.clone()));
    }
    env
}

fn spawn_signal_handlers(shutdown: Arc<ShutdownCoordinator>, grace: std::time::Duration) {
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));

    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C; terminating");
            on_ctrl_c.start_termination(chrono::Utc::now() + grace, false);
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                tracing::info!("received SIGTERM; terminating");
                shutdown.start_termination(chrono::Utc::now() + grace, false);
            }
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    logging::init(&cfg.log_dir)?;
    tracing::info!(
        compute = %cfg.compute_name,
        agent_version = env!("CARGO_PKG_VERSION"),
        "hearth-agent starting"
    );

    let Some(control_url) = cfg.control_url.clone() else {
        anyhow::bail!("HEARTH_CONTROL_WS_URL is required");
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = WsTransport::spawn(
        WsSettings {
            url: control_url,
            token: cfg.auth_token.clone(),
            compute_name: cfg.compute_name.clone(),
            fleet_id: cfg.fleet_id.clone(),
            location: cfg.location.clone(),
        },
        command_tx,
    )?;

    let archiver = ZipLogArchiver::new(
        cfg.log_archive_dir.clone(),
        cfg.log_dir.clone(),
        cfg.log_upload_url.clone(),
    )?;
    let log_uploads = LogUploadQueue::start(Arc::new(archiver));

    let launcher = OsProcessLauncher::new(worker_env(&cfg)).with_stop_grace(cfg.worker_stop_grace);
    let registry = ProcessRegistry::new(
        Arc::new(launcher),
        transport.clone(),
        log_uploads.clone(),
        cfg.registration_timeout,
    );
    let state = Arc::new(ComputeState::new());

    let config_source: Arc<dyn RuntimeConfigSource> = match &cfg.runtime_config_path {
        Some(path) => Arc::new(StaticRuntimeConfig::load(path)?),
        None => {
            let remote = Arc::new(RemoteRuntimeConfig::new(
                transport.clone(),
                cfg.request_timeout,
            ));
            remote.start(cfg.runtime_config_refresh);
            remote
        }
    };

    let scheduler = Arc::new(LaunchScheduler::new(
        state.clone(),
        registry.clone(),
        config_source,
        cfg.launch_interval,
        LaunchThrottle::new(
            cfg.launch_delay_max,
            cfg.launch_delay_min,
            cfg.launch_delay_step,
        ),
    ));
    let heartbeat = Arc::new(HeartbeatMonitor::new(
        state.clone(),
        registry.clone(),
        transport.clone(),
        cfg.heartbeat_interval,
    ));

    let registrar: Option<Arc<dyn ComputeRegistrar>> = if cfg.register_compute_via_agent {
        let registrar = HttpComputeRegistrar::new(&cfg)?;
        registrar
            .register_compute()
            .await
            .context("register compute")?;
        Some(Arc::new(registrar))
    } else {
        None
    };

    let shutdown = ShutdownCoordinator::new(
        state.clone(),
        registry.clone(),
        scheduler.clone(),
        heartbeat.clone(),
        transport.clone(),
        log_uploads,
        registrar,
        ShutdownSettings::from_config(&cfg),
    );

    CommandDispatcher::new(registry, shutdown.clone()).spawn(command_rx);
    if let Some(url) = &cfg.interruption_notice_url {
        InterruptionMonitor::new(url.clone(), cfg.interruption_poll_interval)?
            .spawn(shutdown.clone());
    }
    spawn_signal_handlers(shutdown.clone(), cfg.termination_grace);

    heartbeat.start();
    scheduler.start();

    shutdown.wait_terminated().await;
    tracing::info!("hearth-agent exiting");
    Ok(())
}
