//! Fakes shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use hearth_process::{
    ComputeStatus, ProcessConfiguration, ProcessId, RuntimeConfiguration, TerminationReason,
};
use tokio::sync::oneshot;

use crate::{
    compute_state::ComputeState,
    control_plane::{ComputeRegistrar, ControlPlaneError},
    error::RegistryError,
    log_upload::{LogUploadQueue, LogUploadRequest, LogUploader},
    os_process::{LaunchedProcess, ProcessHandle, ProcessLauncher},
    process_registry::ProcessRegistry,
    runtime_config::RuntimeConfigSource,
    transport::{ConnectionInfo, OutboundMessage, Transport, TransportError},
};

/// Polls `cond` for up to five seconds.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn desired(entries: &[(&str, u32)]) -> RuntimeConfiguration {
    RuntimeConfiguration {
        server_processes: entries
            .iter()
            .map(|(path, n)| ProcessConfiguration::new(*path, "", *n))
            .collect(),
        ..Default::default()
    }
}

#[derive(Debug)]
pub struct FakeHandle {
    alive: AtomicBool,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    exit_on_terminate: Option<i32>,
    fail_terminate: AtomicBool,
    terminations: AtomicUsize,
}

impl FakeHandle {
    pub fn exit(&self, code: i32) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn fail_terminate(&self) {
        self.fail_terminate.store(true, Ordering::SeqCst);
    }
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> std::io::Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("operation not permitted"));
        }
        if let Some(code) = self.exit_on_terminate {
            self.exit(code);
        }
        Ok(())
    }
}

/// Launcher whose workers live until a test tells them to exit.
pub struct FakeLauncher {
    launches: Mutex<Vec<(ProcessId, ProcessConfiguration, Instant)>>,
    handles: Mutex<HashMap<ProcessId, Arc<FakeHandle>>>,
    rejected: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    dead_on_arrival: AtomicBool,
    exit_on_terminate: Mutex<Option<i32>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            handles: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashSet::new()),
            dead_on_arrival: AtomicBool::new(false),
            exit_on_terminate: Mutex::new(Some(137)),
        }
    }
}

impl FakeLauncher {
    /// Launches of `path` fail with `BadExecutablePath`.
    pub fn reject_path(&self, path: &str) {
        self.rejected.lock().unwrap().insert(path.to_string());
    }

    /// Launches of `path` fail with a spawn error.
    pub fn break_path(&self, path: &str) {
        self.broken.lock().unwrap().insert(path.to_string());
    }

    /// New workers exit with code 1 right after launch.
    pub fn dead_on_arrival(&self, dead: bool) {
        self.dead_on_arrival.store(dead, Ordering::SeqCst);
    }

    /// Exit code produced by `terminate()`; `None` leaves the worker running.
    pub fn exit_on_terminate(&self, code: Option<i32>) {
        *self.exit_on_terminate.lock().unwrap() = code;
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn launched_paths(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c, _)| c.launch_path.clone())
            .collect()
    }

    pub fn launch_times(&self) -> Vec<Instant> {
        self.launches.lock().unwrap().iter().map(|(_, _, t)| *t).collect()
    }

    pub fn handle(&self, id: ProcessId) -> Option<Arc<FakeHandle>> {
        self.handles.lock().unwrap().get(&id).cloned()
    }

    pub fn exit(&self, id: ProcessId, code: i32) {
        if let Some(handle) = self.handle(id) {
            handle.exit(code);
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(
        &self,
        process_id: ProcessId,
        config: &ProcessConfiguration,
    ) -> Result<LaunchedProcess, RegistryError> {
        self.launches
            .lock()
            .unwrap()
            .push((process_id, config.clone(), Instant::now()));

        if self.rejected.lock().unwrap().contains(&config.launch_path) {
            return Err(RegistryError::BadExecutablePath {
                path: config.launch_path.clone(),
                reason: "No such file or directory".to_string(),
            });
        }
        if self.broken.lock().unwrap().contains(&config.launch_path) {
            return Err(RegistryError::Launch {
                path: config.launch_path.clone(),
                source: std::io::Error::other("resource temporarily unavailable"),
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = Arc::new(FakeHandle {
            alive: AtomicBool::new(true),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_on_terminate: *self.exit_on_terminate.lock().unwrap(),
            fail_terminate: AtomicBool::new(false),
            terminations: AtomicUsize::new(0),
        });
        if self.dead_on_arrival.load(Ordering::SeqCst) {
            handle.exit(1);
        }
        self.handles.lock().unwrap().insert(process_id, handle.clone());

        Ok(LaunchedProcess {
            handle,
            exit: exit_rx,
        })
    }
}

/// Transport that records outbound traffic and replays canned responses.
pub struct RecordingTransport {
    connected: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<OutboundMessage>>,
    requests: AtomicUsize,
    responses: Mutex<VecDeque<Result<serde_json::Value, TransportError>>>,
}

impl RecordingTransport {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn disconnected() -> Self {
        let t = Self::connected();
        t.set_connected(false);
        t
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn push_response(&self, response: Result<serde_json::Value, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> Vec<(ProcessId, TerminationReason, Option<i32>)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::ProcessTerminated {
                    process_id,
                    termination_reason,
                    exit_code,
                    ..
                } => Some((process_id, termination_reason, exit_code)),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<ComputeStatus> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Heartbeat { compute_status, .. } => Some(compute_status),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    fn send_async(&self, message: OutboundMessage) {
        if self.connected.load(Ordering::SeqCst) && !self.is_closed() {
            self.sent.lock().unwrap().push(message);
        }
    }

    async fn send_request(
        &self,
        _message: OutboundMessage,
        _timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout(Duration::from_millis(1))))
    }

    fn current_connection(&self) -> Option<ConnectionInfo> {
        if self.connected.load(Ordering::SeqCst) && !self.is_closed() {
            Some(ConnectionInfo {
                id: 1,
                connected_at: chrono::Utc::now(),
            })
        } else {
            None
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    delay: Option<Duration>,
    process: Mutex<Vec<LogUploadRequest>>,
    agent: AtomicUsize,
}

impl RecordingUploader {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn process_uploads(&self) -> Vec<LogUploadRequest> {
        self.process.lock().unwrap().clone()
    }

    pub fn agent_uploads(&self) -> usize {
        self.agent.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LogUploader for RecordingUploader {
    async fn upload_process_logs(&self, request: LogUploadRequest) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.process.lock().unwrap().push(request);
        Ok(())
    }

    async fn upload_agent_logs(&self) -> anyhow::Result<()> {
        self.agent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Desired state that tests can swap between ticks.
#[derive(Default)]
pub struct SharedConfig {
    current: Mutex<RuntimeConfiguration>,
    fail: AtomicBool,
}

impl SharedConfig {
    pub fn set(&self, config: RuntimeConfiguration) {
        *self.current.lock().unwrap() = config;
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RuntimeConfigSource for SharedConfig {
    async fn runtime_configuration(&self) -> anyhow::Result<RuntimeConfiguration> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("runtime configuration unavailable");
        }
        Ok(self.current.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeRegistrar {
    failing: AtomicBool,
    registers: AtomicUsize,
    deregisters: AtomicUsize,
}

impl FakeRegistrar {
    pub fn failing() -> Self {
        let r = Self::default();
        r.failing.store(true, Ordering::SeqCst);
        r
    }

    pub fn registers(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn deregisters(&self) -> usize {
        self.deregisters.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ComputeRegistrar for FakeRegistrar {
    async fn register_compute(&self) -> Result<(), ControlPlaneError> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::InternalService("503".to_string()));
        }
        Ok(())
    }

    async fn deregister_compute(&self) -> Result<(), ControlPlaneError> {
        self.deregisters.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::InternalService("503".to_string()));
        }
        Ok(())
    }
}

/// A registry wired to fakes, plus handles on every fake.
pub struct TestRig {
    pub launcher: Arc<FakeLauncher>,
    pub transport: Arc<RecordingTransport>,
    pub uploader: Arc<RecordingUploader>,
    pub uploads: LogUploadQueue,
    pub registry: ProcessRegistry,
    pub state: Arc<ComputeState>,
    pub config: Arc<SharedConfig>,
}

pub struct TestRigBuilder {
    registration_timeout: Duration,
    uploader: RecordingUploader,
}

impl TestRigBuilder {
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn upload_delay(mut self, delay: Duration) -> Self {
        self.uploader = RecordingUploader::with_delay(delay);
        self
    }

    pub fn build(self) -> TestRig {
        let launcher = Arc::new(FakeLauncher::default());
        let transport = Arc::new(RecordingTransport::connected());
        let uploader = Arc::new(self.uploader);
        let uploads = LogUploadQueue::start(uploader.clone());
        let registry = ProcessRegistry::new(
            launcher.clone(),
            transport.clone(),
            uploads.clone(),
            self.registration_timeout,
        );
        TestRig {
            launcher,
            transport,
            uploader,
            uploads,
            registry,
            state: Arc::new(ComputeState::new()),
            config: Arc::new(SharedConfig::default()),
        }
    }
}

impl TestRig {
    pub fn builder() -> TestRigBuilder {
        TestRigBuilder {
            registration_timeout: Duration::from_secs(300),
            uploader: RecordingUploader::default(),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }
}
