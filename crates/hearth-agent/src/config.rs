use std::{path::PathBuf, time::Duration};

const DEFAULT_LAUNCH_DELAY_MAX_MS: u64 = 5_000;
const DEFAULT_LAUNCH_DELAY_MIN_MS: u64 = 100;
const DEFAULT_LAUNCH_DELAY_STEP_MS: u64 = 1_000;
const DEFAULT_REGISTRATION_TIMEOUT_SEC: u64 = 5 * 60;

/// Everything the agent reads from its environment at boot.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub control_url: Option<String>,
    pub auth_token: Option<String>,
    pub compute_name: String,
    pub fleet_id: Option<String>,
    pub location: Option<String>,
    pub ip_address: Option<String>,
    pub control_plane_endpoint: Option<String>,
    pub register_compute_via_agent: bool,

    pub runtime_config_path: Option<PathBuf>,
    pub runtime_config_refresh: Duration,
    pub request_timeout: Duration,

    pub heartbeat_interval: Duration,
    pub launch_interval: Duration,
    pub launch_delay_max: Duration,
    pub launch_delay_min: Duration,
    pub launch_delay_step: Duration,
    pub registration_timeout: Duration,
    pub worker_stop_grace: Duration,

    pub shutdown_check_interval: Duration,
    pub shutdown_process_wait: Duration,
    pub shutdown_poll_interval: Duration,
    pub log_upload_wait: Duration,
    pub termination_grace: Duration,

    pub log_dir: PathBuf,
    pub log_archive_dir: PathBuf,
    pub log_upload_url: Option<String>,

    pub interruption_notice_url: Option<String>,
    pub interruption_poll_interval: Duration,
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn u64_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    string_var(lookup, name).and_then(|v| v.parse::<u64>().ok())
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    string_var(lookup, name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn millis_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Duration {
    Duration::from_millis(
        u64_var(lookup, name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default),
    )
}

fn secs_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Duration {
    Duration::from_secs(
        u64_var(lookup, name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default),
    )
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let compute_name = string_var(&lookup, "HEARTH_COMPUTE_NAME")
            .or_else(|| string_var(&lookup, "HOSTNAME"))
            .unwrap_or_else(|| "default".to_string());

        let log_dir = string_var(&lookup, "HEARTH_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));
        let log_archive_dir = string_var(&lookup, "HEARTH_LOG_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| log_dir.join("archives"));

        let launch_delay_max = millis_var(
            &lookup,
            "HEARTH_LAUNCH_DELAY_MAX_MS",
            DEFAULT_LAUNCH_DELAY_MAX_MS,
            0,
            10 * 60 * 1000,
        );
        // The floor can never sit above the ceiling.
        let launch_delay_min = millis_var(
            &lookup,
            "HEARTH_LAUNCH_DELAY_MIN_MS",
            DEFAULT_LAUNCH_DELAY_MIN_MS,
            0,
            10 * 60 * 1000,
        )
        .min(launch_delay_max);

        Self {
            control_url: string_var(&lookup, "HEARTH_CONTROL_WS_URL"),
            auth_token: string_var(&lookup, "HEARTH_AUTH_TOKEN"),
            compute_name,
            fleet_id: string_var(&lookup, "HEARTH_FLEET_ID"),
            location: string_var(&lookup, "HEARTH_LOCATION"),
            ip_address: string_var(&lookup, "HEARTH_IP_ADDRESS"),
            control_plane_endpoint: string_var(&lookup, "HEARTH_CONTROL_PLANE_ENDPOINT"),
            register_compute_via_agent: bool_var(&lookup, "HEARTH_REGISTER_COMPUTE")
                .unwrap_or(false),

            runtime_config_path: string_var(&lookup, "HEARTH_RUNTIME_CONFIG").map(PathBuf::from),
            runtime_config_refresh: secs_var(
                &lookup,
                "HEARTH_RUNTIME_CONFIG_REFRESH_SEC",
                60,
                5,
                60 * 60,
            ),
            request_timeout: millis_var(
                &lookup,
                "HEARTH_REQUEST_TIMEOUT_MS",
                10_000,
                500,
                5 * 60 * 1000,
            ),

            heartbeat_interval: secs_var(&lookup, "HEARTH_HEARTBEAT_INTERVAL_SEC", 10, 1, 300),
            launch_interval: millis_var(
                &lookup,
                "HEARTH_LAUNCH_INTERVAL_MS",
                5_000,
                250,
                5 * 60 * 1000,
            ),
            launch_delay_max,
            launch_delay_min,
            launch_delay_step: millis_var(
                &lookup,
                "HEARTH_LAUNCH_DELAY_STEP_MS",
                DEFAULT_LAUNCH_DELAY_STEP_MS,
                1,
                10 * 60 * 1000,
            ),
            registration_timeout: secs_var(
                &lookup,
                "HEARTH_REGISTRATION_TIMEOUT_SEC",
                DEFAULT_REGISTRATION_TIMEOUT_SEC,
                10,
                60 * 60,
            ),
            worker_stop_grace: millis_var(
                &lookup,
                "HEARTH_WORKER_STOP_GRACE_MS",
                10_000,
                0,
                5 * 60 * 1000,
            ),

            shutdown_check_interval: millis_var(
                &lookup,
                "HEARTH_SHUTDOWN_CHECK_MS",
                2_000,
                100,
                60_000,
            ),
            shutdown_process_wait: secs_var(&lookup, "HEARTH_SHUTDOWN_PROCESS_WAIT_SEC", 30, 0, 600),
            shutdown_poll_interval: millis_var(
                &lookup,
                "HEARTH_SHUTDOWN_POLL_MS",
                500,
                10,
                10_000,
            ),
            log_upload_wait: secs_var(&lookup, "HEARTH_LOG_UPLOAD_WAIT_SEC", 30, 0, 600),
            termination_grace: secs_var(&lookup, "HEARTH_TERMINATION_GRACE_SEC", 60, 0, 3600),

            log_dir,
            log_archive_dir,
            log_upload_url: string_var(&lookup, "HEARTH_LOG_UPLOAD_URL"),

            interruption_notice_url: string_var(&lookup, "HEARTH_INTERRUPTION_NOTICE_URL"),
            interruption_poll_interval: secs_var(
                &lookup,
                "HEARTH_INTERRUPTION_POLL_SEC",
                5,
                1,
                300,
            ),
        }
    }
}
