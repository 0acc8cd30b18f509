//! Scheduler task for the mirror pipeline.
//!
//! Pulls work items, admits them through a semaphore and runs each transfer
//! on its own task. Every item ends as exactly one status event.

use crate::error::MirrorError;
use crate::pipeline::channel::{Action, StatusEvent, StatusSender, WorkItem, WorkReceiver};
use crate::progress::{Progress, ProgressReader};
use crate::session::ResumeFilter;
use crate::shutdown::Shutdown;
use crate::storage::{ByteStream, Clients};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default admission limit: one core left for listing and bookkeeping.
pub fn default_jobs() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Scheduler configuration
pub struct SchedulerConfig {
    /// Concurrent transfers
    pub jobs: usize,
    /// Report items as done without touching the target
    pub fake: bool,
}

pub struct Scheduler {
    clients: Arc<Clients>,
    gate: Arc<Semaphore>,
    progress: Arc<dyn Progress>,
    fake: bool,
    resume: Arc<ResumeFilter>,
}

impl Scheduler {
    pub fn new(
        clients: Arc<Clients>,
        config: SchedulerConfig,
        progress: Arc<dyn Progress>,
        resume: ResumeFilter,
    ) -> Self {
        Self {
            clients,
            gate: Arc::new(Semaphore::new(config.jobs.max(1))),
            progress,
            fake: config.fake,
            resume: Arc::new(resume),
        }
    }

    /// Run until the work channel closes or shutdown fires.
    ///
    /// Returns true if the channel was drained to the end. In-flight transfers
    /// always finish before this returns.
    pub async fn run(self, mut work: WorkReceiver, status: StatusSender, shutdown: Shutdown) -> bool {
        let mut tasks = JoinSet::new();

        let drained = loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break false,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Transfer task failed: {}", e);
                    }
                }
                next = work.recv() => {
                    let Some(item) = next else { break true };
                    if status.is_closed() {
                        warn!("Status reducer is gone, not starting more transfers");
                        break false;
                    }
                    let Some(item) = self.admit(item, &status) else { continue };

                    let permit = tokio::select! {
                        biased;
                        _ = shutdown.wait() => None,
                        permit = self.gate.clone().acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else { break false };

                    let worker = Worker {
                        clients: self.clients.clone(),
                        progress: self.progress.clone(),
                    };
                    let status = status.clone();
                    tasks.spawn(async move {
                        let event = worker.execute(item).await;
                        drop(permit);
                        let _ = status.send(event);
                    });
                }
            }
        };

        if !drained {
            debug!("Scheduler stopping, waiting for {} in-flight transfers", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Transfer task failed: {}", e);
            }
        }
        drained
    }

    /// Settle everything that needs no I/O. Returns the item if it still has
    /// to be executed.
    fn admit(&self, item: WorkItem, status: &StatusSender) -> Option<WorkItem> {
        if item.error.is_some() {
            let _ = status.send(StatusEvent::Failed(item));
            return None;
        }
        if self.resume.is_completed(item.seq) {
            let _ = status.send(StatusEvent::Replayed(item));
            return None;
        }
        if !self.resume.is_logged(item.seq) {
            let _ = status.send(StatusEvent::Planned(item.clone()));
        }
        if self.fake {
            let _ = status.send(StatusEvent::Simulated(item));
            return None;
        }
        Some(item)
    }
}

struct Worker {
    clients: Arc<Clients>,
    progress: Arc<dyn Progress>,
}

impl Worker {
    async fn execute(&self, item: WorkItem) -> StatusEvent {
        match item.action() {
            Some(Action::Copy) => self.copy(item).await,
            Some(Action::Delete) => self.delete(item).await,
            None => {
                let err = MirrorError::InvalidArgument("work item has neither source nor target".to_string());
                StatusEvent::Failed(item.with_error(err))
            }
        }
    }

    async fn copy(&self, item: WorkItem) -> StatusEvent {
        let (source, target) = match (&item.source, &item.target) {
            (Some(s), Some(t)) => (s.clone(), t.clone()),
            _ => return StatusEvent::Failed(item),
        };
        let target_client = match self.clients.target(item.target_slot) {
            Ok(client) => client.clone(),
            Err(e) => return StatusEvent::Failed(item.with_error(e)),
        };

        let reader = match self.clients.source.get(&source.entry.key).await {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => {
                debug!("Source vanished before copy: {}", source.url);
                return StatusEvent::Dropped(item);
            }
            Err(e) => return StatusEvent::Failed(item.with_error(e)),
        };

        self.progress.set_caption(&source.url);
        let reader = ProgressReader::new(reader, self.progress.clone());
        let counted = reader.counter();
        let body: ByteStream = Box::pin(reader);

        match target_client.put(&target.entry.key, source.entry.size, body).await {
            Ok(written) => {
                debug!("Copied {} -> {} ({} bytes)", source.url, target.url, written);
                StatusEvent::Completed(item)
            }
            Err(e) => {
                self.progress.retract(counted.load(Ordering::Relaxed));
                StatusEvent::Failed(item.with_error(e))
            }
        }
    }

    async fn delete(&self, item: WorkItem) -> StatusEvent {
        let Some(target) = item.target.clone() else {
            return StatusEvent::Failed(item);
        };
        let target_client = match self.clients.target(item.target_slot) {
            Ok(client) => client.clone(),
            Err(e) => return StatusEvent::Failed(item.with_error(e)),
        };

        match target_client.remove(&target.entry.key).await {
            Ok(()) => StatusEvent::Completed(item),
            Err(e) if e.is_not_found() => {
                debug!("Already gone: {}", target.url);
                StatusEvent::Completed(item)
            }
            Err(e) => StatusEvent::Failed(item.with_error(e)),
        }
    }
}
