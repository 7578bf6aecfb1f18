use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const AGENT_LOG_FILE: &str = "hearth-agent.log";
const MAX_BYTES: u64 = 32 * 1024 * 1024;
const MAX_FILES: usize = 5;

/// Size-capped append-only log file with numbered rotations (`.1` newest).
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: File,
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let file = open_append(&path)?;
        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, i: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), i))
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush();
        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if from.exists() {
                let _ = std::fs::rename(&from, self.rotated(i + 1));
            }
        }
        if self.path.exists() {
            let _ = std::fs::rename(&self.path, self.rotated(1));
        }
        self.file = open_append(&self.path)?;
        self.bytes = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let len = buf.len() as u64;
        if self.max_bytes > 0 && self.bytes > 0 && self.bytes.saturating_add(len) > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.bytes = self.bytes.saturating_add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Installs the global subscriber: human-readable stderr plus a rotating
/// file in `log_dir`. `RUST_LOG` overrides the default `info` filter.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    let file = RotatingFile::open(log_dir.join(AGENT_LOG_FILE), MAX_BYTES, MAX_FILES)
        .with_context(|| format!("open agent log in {}", log_dir.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
