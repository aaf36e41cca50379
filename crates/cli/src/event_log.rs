//! JSONL event log: tails the event bus into a file, best-effort.

use std::path::PathBuf;

use ferrule_core::event::EventBus;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Append every published event to `path`, one JSON object per line.
///
/// The task ends when the bus is dropped. Write failures are logged and
/// never reach the request loop.
pub fn spawn(events: &EventBus, path: PathBuf) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(path = %path.display(), error = %e, "Cannot create event log directory");
            return;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open event log");
                return;
            }
        };
        debug!(path = %path.display(), "Event log started");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(mut line) = serde_json::to_string(event.as_ref()) else {
                        continue;
                    };
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(error = %e, "Event log write failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        let _ = file.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_core::event::DomainEvent;

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let bus = EventBus::new(16);
        let task = spawn(&bus, path.clone());

        bus.publish(DomainEvent::RequestCancelled {
            job_id: "j1".into(),
            iterations: 1,
            timestamp: chrono::Utc::now(),
        });
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "boom".into(),
            timestamp: chrono::Utc::now(),
        });
        drop(bus);
        task.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event\":\"request_cancelled\""));
        assert!(lines[1].contains("boom"));
    }
}
