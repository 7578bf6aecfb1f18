use std::fmt;

use chrono::{DateTime, Utc};

/// Opaque identifier assigned to a worker process at launch.
///
/// The worker receives it through its environment and echoes it back when it
/// registers with the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub uuid::Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ProcessId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim()).map(Self)
    }
}

/// One kind of worker: what to run and how many copies.
///
/// Compared by value. Two entries with the same path, parameters and count
/// are the same kind of worker even when they came from different documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProcessConfiguration {
    pub launch_path: String,
    #[serde(default)]
    pub parameters: String,
    pub concurrent_executions: u32,
}

impl ProcessConfiguration {
    pub fn new(
        launch_path: impl Into<String>,
        parameters: impl Into<String>,
        concurrent_executions: u32,
    ) -> Self {
        Self {
            launch_path: launch_path.into(),
            parameters: parameters.into(),
            concurrent_executions,
        }
    }

    pub fn arguments(&self) -> Vec<String> {
        self.parameters
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }
}

/// Desired state for this compute.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfiguration {
    #[serde(default)]
    pub server_processes: Vec<ProcessConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_game_session_activations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_session_activation_timeout_seconds: Option<u32>,
}

impl RuntimeConfiguration {
    pub fn desired_total(&self) -> u64 {
        self.server_processes
            .iter()
            .map(|p| u64::from(p.concurrent_executions))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Initializing,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeStatus {
    Initializing,
    Activating,
    Active,
    Interrupted,
    Terminating,
    Terminated,
}

impl ComputeStatus {
    pub fn is_terminating_or_terminated(self) -> bool {
        matches!(
            self,
            ComputeStatus::Interrupted | ComputeStatus::Terminating | ComputeStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComputeStatus::Initializing => "INITIALIZING",
            ComputeStatus::Activating => "ACTIVATING",
            ComputeStatus::Active => "ACTIVE",
            ComputeStatus::Interrupted => "INTERRUPTED",
            ComputeStatus::Terminating => "TERMINATING",
            ComputeStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ComputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker stopped, as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    Normal,
    Crashed,
    InvalidLaunchPath,
    ForciblyTerminated,
    Unhealthy,
    SdkRegistrationTimeout,
    ComputeShuttingDown,
}

impl TerminationReason {
    pub fn event_code(self) -> u32 {
        match self {
            TerminationReason::Normal => 1000,
            TerminationReason::Crashed => 1001,
            TerminationReason::InvalidLaunchPath => 1002,
            TerminationReason::ForciblyTerminated => 1003,
            TerminationReason::Unhealthy => 1004,
            TerminationReason::SdkRegistrationTimeout => 1005,
            TerminationReason::ComputeShuttingDown => 1006,
        }
    }

    /// Reason to report when nothing was recorded before the process exited.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            TerminationReason::Normal
        } else {
            TerminationReason::Crashed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Normal => "NORMAL",
            TerminationReason::Crashed => "CRASHED",
            TerminationReason::InvalidLaunchPath => "INVALID_LAUNCH_PATH",
            TerminationReason::ForciblyTerminated => "FORCIBLY_TERMINATED",
            TerminationReason::Unhealthy => "UNHEALTHY",
            TerminationReason::SdkRegistrationTimeout => "SDK_REGISTRATION_TIMEOUT",
            TerminationReason::ComputeShuttingDown => "COMPUTE_SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one managed process, carried in heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessSnapshot {
    pub process_id: ProcessId,
    pub status: ProcessStatus,
    pub launch_path: String,
    pub parameters: String,
    pub launched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
