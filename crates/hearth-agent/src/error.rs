use std::time::Duration;

use hearth_process::ProcessId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown process_id: {0}")]
    NotFound(ProcessId),
    #[error("invalid launch path {path}: {reason}")]
    BadExecutablePath { path: String, reason: String },
    #[error("{remaining} process(es) still running after {}ms", .waited.as_millis())]
    NotFinished { remaining: usize, waited: Duration },
    #[error("spawn {path}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
