use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowline_core::event::EventBus;
use flowline_core::types::EngineEvent;

/// JSONL event logger.
///
/// Subscribes to the engine's EventBus and appends one JSON object per
/// event to `{log_dir}/{YYYY-MM-DD}.jsonl`, rolling over at midnight UTC.
/// Each line is flushed as it is written, so a crash loses nothing that
/// was already logged.
pub struct RunLogger {
    log_dir: PathBuf,
    rx: Receiver<EngineEvent>,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

struct DayFile {
    date: NaiveDate,
    writer: BufWriter<tokio::fs::File>,
}

impl RunLogger {
    /// Subscribe now, so no event published after this call is missed.
    pub fn new(log_dir: PathBuf, event_bus: &EventBus) -> Self {
        Self {
            log_dir,
            rx: event_bus.subscribe(),
        }
    }

    /// Write events until cancelled or the bus closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut current: Option<DayFile> = None;

        loop {
            tokio::select! {
                // Drain what is already queued before honouring shutdown
                biased;
                result = self.rx.recv() => match result {
                    Ok(event) => {
                        let today = Utc::now().date_naive();
                        if current.as_ref().map_or(true, |f| f.date != today) {
                            if let Some(mut old) = current.take() {
                                old.writer.flush().await.ok();
                            }
                            match open_day(&self.log_dir, today).await {
                                Ok(file) => current = Some(file),
                                Err(e) => {
                                    error!(error = %e, "Failed to open log file");
                                    break;
                                }
                            }
                        }
                        let Some(file) = current.as_mut() else { break };

                        let entry = to_entry(&event);
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = file.writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = file.writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        if let Some(mut file) = current {
            file.writer.flush().await.ok();
        }
    }
}

async fn open_day(dir: &Path, date: NaiveDate) -> std::io::Result<DayFile> {
    let path = dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")));
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    debug!(path = %path.display(), "Opened event log");
    Ok(DayFile {
        date,
        writer: BufWriter::new(file),
    })
}

fn to_entry(event: &EngineEvent) -> LogEntry {
    let mut detail = serde_json::to_value(event).unwrap_or(Value::Null);
    let event_type = detail
        .as_object_mut()
        .and_then(|obj| {
            obj.remove("run_id");
            obj.remove("event")
        })
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string());

    let detail = match detail {
        Value::Object(obj) if obj.is_empty() => None,
        Value::Null => None,
        other => Some(other),
    };

    LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        run_id: event.run_id().to_string(),
        event_type,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::run::{RunId, RunStatus, StepStatus};

    #[test]
    fn test_entry_shape() {
        let entry = to_entry(&EngineEvent::StepFinished {
            run_id: RunId::from_string("r1"),
            node_id: "welcome".into(),
            status: StepStatus::Failed,
            error: Some("smtp refused".into()),
        });
        assert_eq!(entry.run_id, "r1");
        assert_eq!(entry.event_type, "step_finished");
        let detail = entry.detail.unwrap();
        assert_eq!(detail["node_id"], "welcome");
        assert_eq!(detail["status"], "failed");
        assert!(detail.get("run_id").is_none());
    }

    #[test]
    fn test_entry_without_detail() {
        let entry = to_entry(&EngineEvent::RunStarted {
            run_id: RunId::from_string("r2"),
            workflow_id: "wf".into(),
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run_started\""));
        assert!(json.contains("workflow_id"));
    }

    #[tokio::test]
    async fn test_writes_daily_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let logger = RunLogger::new(dir.path().join("logs"), &bus);
        let cancel = CancellationToken::new();

        bus.publish(EngineEvent::RunStarted {
            run_id: RunId::from_string("r1"),
            workflow_id: "wf".into(),
        });
        bus.publish(EngineEvent::RunFinished {
            run_id: RunId::from_string("r1"),
            workflow_id: "wf".into(),
            status: RunStatus::Completed,
            error: None,
        });
        cancel.cancel();
        logger.run(cancel).await;

        let path = dir
            .path()
            .join("logs")
            .join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "run_started");
        assert_eq!(lines[1]["event_type"], "run_finished");
        assert_eq!(lines[1]["detail"]["status"], "completed");
    }
}
