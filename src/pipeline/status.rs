//! Status reducer.
//!
//! The only task that touches the session and the reported totals. Every
//! status event is folded here, one at a time, in arrival order.

use crate::error::{MirrorError, Result};
use crate::output::{ErrorMessage, MirrorMessage, RemoveMessage, StatusMessage};
use crate::pipeline::channel::{Action, StatusEvent, StatusReceiver, WorkItem};
use crate::progress::Progress;
use crate::session::Session;
use crate::shutdown::Shutdown;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// Outcome of a mirror run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorSummary {
    pub copied: u64,
    pub removed: u64,
    /// Completed by an earlier run of the same session
    pub replayed: u64,
    pub failed: u64,
    /// Bytes copied in this run
    pub bytes: u64,
    pub interrupted: bool,
    /// A transient failure means the session should be kept for a retry
    pub session_retained: bool,
    /// Where the kept session lives, when one was kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
}

impl MirrorSummary {
    pub fn objects(&self) -> u64 {
        self.copied + self.removed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

pub struct StatusReducer {
    progress: Arc<dyn Progress>,
    session: Option<Session>,
    summary: MirrorSummary,
    shutdown: Option<Shutdown>,
}

impl StatusReducer {
    pub fn new(progress: Arc<dyn Progress>, session: Option<Session>) -> Self {
        Self {
            progress,
            session,
            summary: MirrorSummary::default(),
            shutdown: None,
        }
    }

    /// Stop the whole run if the session can no longer be written.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Fold events until every sender is gone. Hands the session back so the
    /// caller can decide whether to keep or delete it.
    pub async fn run(mut self, mut events: StatusReceiver) -> Result<(MirrorSummary, Option<Session>)> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply(event) {
                error!("Cannot record progress, stopping: {}", e);
                if let Some(shutdown) = &self.shutdown {
                    shutdown.trigger();
                }
                return Err(e);
            }
        }
        Ok((self.summary, self.session))
    }

    pub fn apply(&mut self, event: StatusEvent) -> Result<()> {
        match event {
            StatusEvent::Planned(item) => {
                self.progress.set_total(item.total_bytes);
                self.progress.planned(item.total_count);
                if let Some(session) = self.session.as_mut() {
                    session.append(&item)?;
                }
            }
            StatusEvent::Completed(item) => {
                self.count_success(&item);
                if let Some(session) = self.session.as_mut() {
                    session.complete(&item)?;
                }
            }
            StatusEvent::Simulated(item) => {
                self.progress.add(item.size());
                self.count_success(&item);
            }
            StatusEvent::Replayed(item) => {
                self.progress.set_total(item.total_bytes);
                self.progress.add(item.size());
                self.summary.replayed += 1;
            }
            StatusEvent::Dropped(item) => {
                debug!("Dropped {}", item.key());
                if let Some(session) = self.session.as_mut() {
                    session.complete(&item)?;
                }
            }
            StatusEvent::Failed(item) => {
                self.summary.failed += 1;
                let transient = item.error.as_deref().map(MirrorError::is_transient).unwrap_or(false);
                if transient && self.session.is_some() {
                    self.summary.session_retained = true;
                }
                self.progress.report(&StatusMessage::Error(error_message(&item)));
                if let Some(session) = self.session.as_mut() {
                    session.save()?;
                }
            }
        }
        Ok(())
    }

    fn count_success(&mut self, item: &WorkItem) {
        match item.action() {
            Some(Action::Copy) => {
                self.summary.copied += 1;
                self.summary.bytes += item.size();
                if let (Some(source), Some(target)) = (&item.source, &item.target) {
                    self.progress.report(&StatusMessage::Mirror(MirrorMessage::new(
                        source.url.clone(),
                        target.url.clone(),
                        source.entry.size,
                        item.total_count,
                        item.total_bytes,
                    )));
                }
            }
            Some(Action::Delete) => {
                self.summary.removed += 1;
                if let Some(target) = &item.target {
                    self.progress
                        .report(&StatusMessage::Remove(RemoveMessage::new(target.url.clone())));
                }
            }
            None => {}
        }
    }
}

fn error_message(item: &WorkItem) -> ErrorMessage {
    let cause = item
        .error
        .as_deref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string());
    let message = match (&item.source, &item.target) {
        (Some(source), _) => format!("Failed to copy '{}'", source.url),
        (None, Some(target)) => format!("Failed to remove '{}'", target.url),
        (None, None) => "Unable to prepare URL for copying".to_string(),
    };
    ErrorMessage::new(message, cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::{status_channel, Endpoint};
    use crate::policy::Policy;
    use crate::progress::QuietProgress;
    use crate::storage::Entry;
    use std::io;
    use tempfile::TempDir;

    fn copy(seq: u64, key: &str, size: u64, total: u64) -> WorkItem {
        let endpoint = |root: &str| Endpoint {
            url: format!("{}/{}", root, key),
            entry: Entry::file(key, size),
        };
        WorkItem::copy(endpoint("/src"), endpoint("/dst"), 0, (seq, total))
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let quiet = Arc::new(QuietProgress::new(false));
        let reducer = StatusReducer::new(quiet.clone(), None);
        let (tx, rx) = status_channel();

        let a = copy(1, "a/1.txt", 10, 10);
        let b = copy(2, "b/2.txt", 20, 30);
        let delete = WorkItem::delete(
            Endpoint {
                url: "/dst/c/old.txt".into(),
                entry: Entry::file("c/old.txt", 5),
            },
            0,
            (3, 30),
        );
        for item in [a.clone(), b.clone(), delete.clone()] {
            tx.send(StatusEvent::Planned(item)).unwrap();
        }
        tx.send(StatusEvent::Completed(a)).unwrap();
        tx.send(StatusEvent::Completed(b)).unwrap();
        tx.send(StatusEvent::Completed(delete)).unwrap();
        tx.send(StatusEvent::Failed(WorkItem::failed(
            None,
            None,
            0,
            MirrorError::OverwriteNotAllowed("/src/x".into()),
        )))
        .unwrap();
        drop(tx);

        let (summary, session) = reducer.run(rx).await.unwrap();
        assert!(session.is_none());
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.bytes, 30);
        assert_eq!(summary.objects(), 3);
        assert_eq!(summary.failed, 1);
        assert!(!summary.session_retained);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn test_session_write_failure_triggers_shutdown() {
        let tmp = TempDir::new().unwrap();
        let session = Session::open(tmp.path(), "/src", &["/dst".to_string()], Policy::default())
            .unwrap();
        std::fs::remove_dir_all(session.dir()).unwrap();

        let shutdown = Shutdown::new();
        let reducer = StatusReducer::new(Arc::new(QuietProgress::new(false)), Some(session))
            .with_shutdown(shutdown.clone());
        let (tx, rx) = status_channel();
        tx.send(StatusEvent::Planned(copy(1, "a", 10, 10))).unwrap();
        tx.send(StatusEvent::Planned(copy(2, "b", 10, 20))).unwrap();

        assert!(reducer.run(rx).await.is_err());
        assert!(shutdown.is_triggered());
        // The receiver is gone, so producers see further sends fail
        assert!(tx.send(StatusEvent::Planned(copy(3, "c", 10, 30))).is_err());
    }

    #[tokio::test]
    async fn test_replayed_items_count_as_progress() {
        let quiet = Arc::new(QuietProgress::new(false));
        let mut reducer = StatusReducer::new(quiet.clone(), None);
        reducer.apply(StatusEvent::Replayed(copy(1, "a", 10, 10))).unwrap();
        assert_eq!(quiet.transferred(), 10);
        assert_eq!(reducer.summary.replayed, 1);
        assert_eq!(reducer.summary.copied, 0);
    }

    #[tokio::test]
    async fn test_session_tracks_plan_and_completion() {
        let tmp = TempDir::new().unwrap();
        let session = Session::open(tmp.path(), "/src", &["/dst".to_string()], Policy::default()).unwrap();
        let mut reducer = StatusReducer::new(Arc::new(QuietProgress::new(false)), Some(session));

        let a = copy(1, "a", 10, 10);
        let b = copy(2, "b", 5, 15);
        reducer.apply(StatusEvent::Planned(a.clone())).unwrap();
        reducer.apply(StatusEvent::Planned(b.clone())).unwrap();
        reducer.apply(StatusEvent::Completed(a)).unwrap();
        reducer
            .apply(StatusEvent::Failed(
                b.with_error(MirrorError::Io(io::Error::from(io::ErrorKind::ConnectionReset))),
            ))
            .unwrap();

        assert!(reducer.summary.session_retained);
        let session = reducer.session.take().unwrap();
        assert_eq!(session.header().watermark, 1);
        assert_eq!(session.load_items().unwrap().len(), 2);
    }

    #[test]
    fn test_error_message_context() {
        let item = copy(1, "x.bin", 1, 1).with_error(MirrorError::OverwriteNotAllowed("/src/x.bin".into()));
        let msg = error_message(&item);
        assert_eq!(msg.message, "Failed to copy '/src/x.bin'");
        assert!(msg.cause.contains("overwrite not allowed"));
    }
}
