use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use hearth_process::ProcessId;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::error::format_error_chain;

/// One worker's logs, queued after it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogUploadRequest {
    pub process_id: ProcessId,
    pub launch_path: String,
    pub log_paths: Vec<String>,
    pub session_id: Option<String>,
}

#[async_trait::async_trait]
pub trait LogUploader: Send + Sync {
    async fn upload_process_logs(&self, request: LogUploadRequest) -> anyhow::Result<()>;

    async fn upload_agent_logs(&self) -> anyhow::Result<()>;
}

/// Background worker that runs uploads without blocking the submitter.
#[derive(Clone)]
pub struct LogUploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    uploader: Arc<dyn LogUploader>,
    tx: Mutex<Option<mpsc::UnboundedSender<LogUploadRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogUploadQueue {
    pub fn start(uploader: Arc<dyn LogUploader>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogUploadRequest>();
        let worker = tokio::spawn({
            let uploader = uploader.clone();
            async move {
                while let Some(req) = rx.recv().await {
                    let process_id = req.process_id;
                    match uploader.upload_process_logs(req).await {
                        Ok(()) => tracing::debug!(%process_id, "worker logs uploaded"),
                        Err(err) => tracing::warn!(
                            %process_id,
                            error = %format_error_chain(&err),
                            "worker log upload failed"
                        ),
                    }
                }
            }
        });

        Self {
            inner: Arc::new(QueueInner {
                uploader,
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn submit(&self, request: LogUploadRequest) -> anyhow::Result<()> {
        let guard = self.inner.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            anyhow::bail!("log upload queue is shut down");
        };
        tx.send(request)
            .map_err(|_| anyhow::anyhow!("log upload worker is gone"))
    }

    /// Stops accepting work and waits up to `wait` for queued uploads.
    /// Returns false when the wait expired and the rest was abandoned.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut worker) = worker else {
            return true;
        };

        match tokio::time::timeout(wait, &mut worker).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    wait_ms = wait.as_millis() as u64,
                    "log uploads did not drain in time; abandoning the rest"
                );
                worker.abort();
                false
            }
        }
    }

    pub async fn upload_agent_logs(&self) -> anyhow::Result<()> {
        self.inner.uploader.upload_agent_logs().await
    }
}

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("hearth-agent/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(5 * 60))
        .build()
        .context("build http client")
}

/// Zips log files into a local archive directory and, when configured,
/// PUTs each archive to `{upload_url}/{archive name}`.
pub struct ZipLogArchiver {
    archive_dir: PathBuf,
    agent_log_dir: PathBuf,
    upload_url: Option<String>,
    client: reqwest::Client,
}

impl ZipLogArchiver {
    pub fn new(
        archive_dir: PathBuf,
        agent_log_dir: PathBuf,
        upload_url: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            archive_dir,
            agent_log_dir,
            upload_url,
            client: http_client()?,
        })
    }

    async fn archive(&self, name: String, sources: Vec<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
        let archive = self.archive_dir.join(&name);
        let skip = self.archive_dir.clone();
        tokio::task::spawn_blocking(move || write_zip(&archive, &sources, &skip))
            .await
            .context("join archive task")?
    }

    async fn upload(&self, archive: &Path) -> anyhow::Result<()> {
        let Some(base) = &self.upload_url else {
            return Ok(());
        };
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let url = format!("{}/{}", base.trim_end_matches('/'), name);
        let file = tokio::fs::File::open(archive)
            .await
            .with_context(|| format!("open {}", archive.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", archive.display()))?
            .len();

        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .with_context(|| format!("upload {url}"))?
            .error_for_status()
            .with_context(|| format!("upload {url} (status)"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogUploader for ZipLogArchiver {
    async fn upload_process_logs(&self, request: LogUploadRequest) -> anyhow::Result<()> {
        if request.log_paths.is_empty() {
            tracing::debug!(process_id = %request.process_id, "worker reported no log paths");
            return Ok(());
        }

        let sources = request.log_paths.iter().map(PathBuf::from).collect();
        let name = match &request.session_id {
            Some(session) => format!("{}-{}.zip", request.process_id, sanitize(session)),
            None => format!("{}.zip", request.process_id),
        };
        let Some(archive) = self.archive(name, sources).await? else {
            return Ok(());
        };
        tracing::info!(
            process_id = %request.process_id,
            launch_path = %request.launch_path,
            archive = %archive.display(),
            "worker logs archived"
        );
        self.upload(&archive).await
    }

    async fn upload_agent_logs(&self) -> anyhow::Result<()> {
        let name = format!("agent-{}.zip", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"));
        let Some(archive) = self
            .archive(name, vec![self.agent_log_dir.clone()])
            .await?
        else {
            return Ok(());
        };
        self.upload(&archive).await
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn collect_files(root: &Path, skip: &Path, out: &mut Vec<PathBuf>) {
    if root.starts_with(skip) {
        return;
    }
    if root.is_file() {
        out.push(root.to_path_buf());
        return;
    }
    let Ok(entries) = std::fs::read_dir(root) else {
        tracing::warn!(path = %root.display(), "log path is missing");
        return;
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    children.sort();
    for child in children {
        collect_files(&child, skip, out);
    }
}

/// Returns `None` when none of `sources` exist.
fn write_zip(archive: &Path, sources: &[PathBuf], skip: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut files = Vec::new();
    for src in sources {
        collect_files(src, skip, &mut files);
    }
    if files.is_empty() {
        return Ok(None);
    }

    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = archive.with_extension("zip.tmp");
    let f = std::fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    let mut zip = zip::ZipWriter::new(f);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for (i, file) in files.iter().enumerate() {
        let leaf = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "log".to_string());
        // Prefix with the index so same-named files from different dirs don't collide.
        zip.start_file(format!("{i:03}-{leaf}"), options)
            .with_context(|| format!("add {}", file.display()))?;
        let mut src =
            std::fs::File::open(file).with_context(|| format!("open {}", file.display()))?;
        std::io::copy(&mut src, &mut zip).with_context(|| format!("copy {}", file.display()))?;
    }
    zip.finish().context("finish zip")?;
    std::fs::rename(&tmp, archive).with_context(|| format!("persist {}", archive.display()))?;
    Ok(Some(archive.to_path_buf()))
}
