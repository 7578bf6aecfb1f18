use std::{
    fmt,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hearth_process::{ProcessConfiguration, ProcessId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::oneshot,
};

use crate::error::RegistryError;

/// OS-level handle to one launched worker.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Asks the worker and everything it spawned to stop, escalating to a
    /// kill if it outlives its grace period. Safe to call repeatedly and
    /// after the worker already exited.
    fn terminate(&self) -> std::io::Result<()>;
}

/// Result of a successful launch.
///
/// `exit` resolves exactly once with the exit code when the OS reports the
/// worker gone.
pub struct LaunchedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    pub exit: oneshot::Receiver<i32>,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        process_id: ProcessId,
        config: &ProcessConfiguration,
    ) -> Result<LaunchedProcess, RegistryError>;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the kernel takes the worker down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn bad_path(path: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::BadExecutablePath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn validate_launch_path(raw: &str) -> Result<&Path, RegistryError> {
    if raw.trim().is_empty() {
        return Err(bad_path(raw, "launch path is empty"));
    }
    let path = Path::new(raw);
    let meta = std::fs::metadata(path).map_err(|e| bad_path(raw, e.to_string()))?;
    if !meta.is_file() {
        return Err(bad_path(raw, "not a regular file"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(bad_path(raw, "file is not executable"));
        }
    }
    Ok(path)
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // Workers are session leaders: the pid is also the group id.
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Spawns workers as session leaders so one signal reaches the whole tree.
///
/// Termination sends SIGTERM to the group and escalates to SIGKILL once
/// `stop_grace` has passed without an exit.
#[derive(Debug, Clone)]
pub struct OsProcessLauncher {
    worker_env: Vec<(String, String)>,
    stop_grace: Duration,
}

impl Default for OsProcessLauncher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl OsProcessLauncher {
    pub fn new(worker_env: Vec<(String, String)>) -> Self {
        Self {
            worker_env,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }
}

impl ProcessLauncher for OsProcessLauncher {
    fn launch(
        &self,
        process_id: ProcessId,
        config: &ProcessConfiguration,
    ) -> Result<LaunchedProcess, RegistryError> {
        let path = validate_launch_path(&config.launch_path)?;

        let mut cmd = Command::new(path);
        cmd.args(config.arguments())
            .envs(self.worker_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("HEARTH_PROCESS_ID", process_id.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                bad_path(&config.launch_path, e.to_string())
            }
            _ => RegistryError::Launch {
                path: config.launch_path.clone(),
                source: e,
            },
        })?;
        let pid = child.id();

        if let Some(out) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%process_id, "[stdout] {line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%process_id, "[stderr] {line}");
                }
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();

        let stop_grace = self.stop_grace;
        tokio::spawn({
            let alive = alive.clone();
            async move {
                let mut kill_rx = kill_rx;
                let res = tokio::select! {
                    res = child.wait() => res,
                    Ok(()) = &mut kill_rx => {
                        match tokio::time::timeout(stop_grace, child.wait()).await {
                            Ok(res) => res,
                            Err(_) => {
                                tracing::warn!(
                                    %process_id,
                                    grace_ms = stop_grace.as_millis() as u64,
                                    "worker ignored SIGTERM; killing"
                                );
                                #[cfg(unix)]
                                if let Some(pid) = pid
                                    && let Err(err) = signal_group(pid, libc::SIGKILL)
                                {
                                    tracing::warn!(%process_id, error = %err, "SIGKILL failed");
                                }
                                let _ = child.start_kill();
                                child.wait().await
                            }
                        }
                    }
                };
                let code = match res {
                    Ok(status) => exit_code_of(status),
                    Err(err) => {
                        tracing::warn!(%process_id, error = %err, "wait for worker failed");
                        -1
                    }
                };
                alive.store(false, Ordering::SeqCst);
                let _ = exit_tx.send(code);
            }
        });

        tracing::info!(
            %process_id,
            pid = ?pid,
            launch_path = %config.launch_path,
            parameters = %config.parameters,
            "worker spawned"
        );

        Ok(LaunchedProcess {
            handle: Arc::new(OsProcessHandle {
                pid,
                alive,
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
            exit: exit_rx,
        })
    }
}

#[derive(Debug)]
struct OsProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> std::io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM)?;
        }

        if let Some(tx) = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    // Scripts run through /bin/sh so the freshly written file is never
    // exec'd directly.
    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("{body}\n")).unwrap();
        path.display().to_string()
    }

    fn sh(script: &str, args: &str) -> ProcessConfiguration {
        ProcessConfiguration::new("/bin/sh", format!("{script} {args}"), 1)
    }

    #[test]
    fn rejects_missing_and_non_executable_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").display().to_string();
        assert!(matches!(
            validate_launch_path(&missing),
            Err(RegistryError::BadExecutablePath { .. })
        ));

        let plain = dir.path().join("plain.txt");
        std::fs::write(&plain, "hi").unwrap();
        assert!(matches!(
            validate_launch_path(&plain.display().to_string()),
            Err(RegistryError::BadExecutablePath { .. })
        ));

        assert!(matches!(
            validate_launch_path(&dir.path().display().to_string()),
            Err(RegistryError::BadExecutablePath { .. })
        ));
        assert!(matches!(
            validate_launch_path("  "),
            Err(RegistryError::BadExecutablePath { .. })
        ));
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "exit17.sh", "exit 17");
        let launcher = OsProcessLauncher::default();

        let launched = launcher.launch(ProcessId::new(), &sh(&path, "")).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(10), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 17);
        assert!(!launched.handle.is_alive());
    }

    #[tokio::test]
    async fn passes_process_id_and_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let path = script(
            dir.path(),
            "echo.sh",
            &format!("echo \"$HEARTH_PROCESS_ID $1 $2\" > {}", out.display()),
        );
        let launcher = OsProcessLauncher::default();
        let id = ProcessId::new();

        let launched = launcher.launch(id, &sh(&path, "-port 7777")).unwrap();
        tokio::time::timeout(Duration::from_secs(10), launched.exit)
            .await
            .unwrap()
            .unwrap();

        let written = std::fs::read_to_string(out).unwrap();
        assert_eq!(written.trim(), format!("{id} -port 7777"));
    }

    #[tokio::test]
    async fn terminate_sends_sigterm_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleep.sh", "sleep 60");
        let launcher = OsProcessLauncher::default();

        let launched = launcher.launch(ProcessId::new(), &sh(&path, "")).unwrap();
        assert!(launched.handle.is_alive());

        launched.handle.terminate().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);

        // A second terminate after exit is a no-op.
        launched.handle.terminate().unwrap();
    }

    #[tokio::test]
    async fn worker_gets_to_clean_up_on_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("flushed");
        let path = script(
            dir.path(),
            "graceful.sh",
            &format!(
                "trap 'echo bye > {}; exit 3' TERM\nwhile :; do sleep 0.05; done",
                marker.display()
            ),
        );
        let launcher = OsProcessLauncher::default();

        let launched = launcher.launch(ProcessId::new(), &sh(&path, "")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        launched.handle.terminate().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 3);
        assert_eq!(std::fs::read_to_string(marker).unwrap().trim(), "bye");
    }

    #[tokio::test]
    async fn escalates_to_sigkill_after_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "stubborn.sh",
            "trap '' TERM\nwhile :; do sleep 0.05; done",
        );
        let launcher = OsProcessLauncher::default().with_stop_grace(Duration::from_millis(200));

        let launched = launcher.launch(ProcessId::new(), &sh(&path, "")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        launched.handle.terminate().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }
}
