use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, serde::Deserialize)]
struct InterruptionNotice {
    action: String,
    time: String,
}

/// Parses an instance-action document (`{"action":"terminate","time":"..."}`).
/// Returns `None` for anything that is not a stop or terminate notice.
fn parse_notice(body: &str) -> Option<DateTime<Utc>> {
    let notice: InterruptionNotice = serde_json::from_str(body).ok()?;
    match notice.action.to_ascii_lowercase().as_str() {
        "terminate" | "stop" | "hibernate" => {}
        _ => return None,
    }
    DateTime::parse_from_rfc3339(notice.time.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Polls the host's spot interruption endpoint. A 404 means no notice.
pub struct InterruptionMonitor {
    url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl InterruptionMonitor {
    pub fn new(url: String, interval: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            url,
            interval,
            client,
        })
    }

    async fn poll_once(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let resp = self.client.get(&self.url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text().await?;
        Ok(parse_notice(&body))
    }

    pub fn spawn(self, shutdown: Arc<ShutdownCoordinator>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if shutdown.is_terminated() {
                    return;
                }
                match self.poll_once().await {
                    Ok(Some(deadline)) => {
                        tracing::warn!(%deadline, "spot interruption notice received");
                        shutdown.start_termination(deadline, true);
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => tracing::debug!(error = %err, "interruption poll failed"),
                }
            }
        })
    }
}
