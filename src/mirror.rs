//! Mirror orchestration.
//!
//! Wires producers, the scheduler and the status reducer together, and
//! decides at the end whether the session is kept or thrown away.

use crate::error::{MirrorError, Result};
use crate::location::Backend;
use crate::pipeline::{
    status_channel, work_channel, Generator, MirrorSummary, RunningTotals, Scheduler,
    SchedulerConfig, StatusReducer, WatchAdapter,
};
use crate::policy::Policy;
use crate::progress::Progress;
use crate::session::{ResumeFilter, Session};
use crate::shutdown::Shutdown;
use crate::storage::{Clients, StorageClient};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MirrorOptions {
    pub policy: Policy,
    /// Keep running on live source notifications after the initial pass
    pub watch: bool,
    /// Concurrent transfers
    pub jobs: usize,
}

pub struct MirrorJob {
    clients: Arc<Clients>,
    options: MirrorOptions,
    progress: Arc<dyn Progress>,
    session_base: Option<PathBuf>,
}

impl MirrorJob {
    pub fn new(clients: Arc<Clients>, options: MirrorOptions, progress: Arc<dyn Progress>) -> Self {
        Self {
            clients,
            options,
            progress,
            session_base: None,
        }
    }

    /// Persist one-shot runs under `base` so an interrupted run can resume.
    /// Ignored in watch and fake mode.
    pub fn with_sessions(mut self, base: PathBuf) -> Self {
        self.session_base = Some(base);
        self
    }

    fn session_base(&self) -> Option<&PathBuf> {
        if self.options.watch || self.options.policy.fake {
            return None;
        }
        self.session_base.as_ref()
    }

    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<MirrorSummary> {
        let policy = self.options.policy;
        policy.validate()?;

        // Session: open (or resume) before anything is planned
        let session = match self.session_base() {
            Some(base) => {
                let targets: Vec<String> = self
                    .clients
                    .targets
                    .iter()
                    .map(|t| t.location().to_string())
                    .collect();
                let source = self.clients.source.location().to_string();
                Some(
                    Session::open(base, &source, &targets, policy)
                        .context("cannot open mirror session")?,
                )
            }
            None => None,
        };

        let logged = match &session {
            Some(s) if s.is_resumed() => s.load_items().context("cannot read mirror session")?,
            _ => Vec::new(),
        };
        let prepared_before = session.as_ref().map(|s| s.header().prepared).unwrap_or(false);
        let resume = session
            .as_ref()
            .map(|s| s.resume_filter(&logged))
            .unwrap_or_else(ResumeFilter::empty);
        let (count, bytes) = session
            .as_ref()
            .map(|s| s.resume_totals(&logged))
            .unwrap_or((0, 0));
        if let Some(s) = &session {
            if s.is_resumed() {
                info!(
                    "Resuming session {} ({} items planned, {} completed)",
                    s.dir().display(),
                    count,
                    s.header().watermark + s.header().completed_above.len() as u64
                );
            }
        }
        let totals = Arc::new(RunningTotals::starting_at(count, bytes));
        self.progress.set_total(bytes);

        // Subscribe before comparing so no change slips between the two
        let subscription = if self.options.watch {
            match self.clients.source.subscribe(true).await {
                Ok(subscription) => Some(subscription),
                Err(e) if e.is_unsupported() => {
                    info!("Continuous mirroring unavailable: {}", e);
                    None
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "failed to start monitoring '{}'",
                        self.clients.source.location()
                    )))
                }
            }
        } else {
            None
        };

        let (work_tx, work_rx) = work_channel();
        let (status_tx, status_rx) = status_channel();

        let reducer = tokio::spawn(
            StatusReducer::new(self.progress.clone(), session)
                .with_shutdown(shutdown.clone())
                .run(status_rx),
        );
        let scheduler = tokio::spawn(
            Scheduler::new(
                self.clients.clone(),
                SchedulerConfig {
                    jobs: self.options.jobs,
                    fake: policy.fake,
                },
                self.progress.clone(),
                resume,
            )
            .run(work_rx, status_tx, shutdown.clone()),
        );

        // Producers: replay, then a fresh comparison, then live events
        let planned = Session::planned_pairs(&logged);
        for item in logged {
            if work_tx.send(item).is_err() {
                break;
            }
        }

        let generator = (!prepared_before).then(|| {
            tokio::spawn(
                Generator::new(self.clients.clone(), policy, totals.clone())
                    .with_planned(planned)
                    .run(work_tx.clone(), shutdown.clone()),
            )
        });

        let watcher = subscription.map(|subscription| {
            tokio::spawn(
                WatchAdapter::new(self.clients.clone(), policy, totals.clone()).run(
                    subscription,
                    work_tx.clone(),
                    shutdown.clone(),
                ),
            )
        });
        drop(work_tx);

        let prepared = match generator {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!("Preparation task failed: {}", e);
                false
            }),
            None => prepared_before,
        };
        let drained = scheduler.await.context("scheduler task failed")?;
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                warn!("Watch task failed: {}", e);
            }
        }

        let (mut summary, session) = reducer.await.context("status task failed")??;
        summary.interrupted = !drained;

        if let Some(mut session) = session {
            let complete = prepared && drained;
            if complete {
                session.mark_prepared();
            }
            if !complete || summary.session_retained {
                session.save().context("cannot save mirror session")?;
                summary.session_retained = true;
                summary.session_dir = Some(session.dir().to_path_buf());
            } else {
                debug!("Removing finished session {}", session.dir().display());
                session.delete().context("cannot remove mirror session")?;
            }
        }

        Ok(summary)
    }
}

/// Reject argument combinations that can never work, before any I/O-heavy
/// phase starts.
pub async fn check_locations(clients: &Clients) -> Result<()> {
    if clients.targets.is_empty() {
        return Err(MirrorError::InvalidArgument("at least one target is required".to_string()));
    }

    let source = clients.source.as_ref();
    check_source(source).await?;

    for target in &clients.targets {
        if overlaps(&source.location().backend, &target.location().backend) {
            return Err(MirrorError::InvalidArgument(format!(
                "source '{}' and target '{}' overlap",
                source.location(),
                target.location()
            )));
        }
        check_target(target.as_ref()).await?;
    }
    Ok(())
}

/// One location is the other or lies inside it. Mirroring either way would
/// feed its own writes back into the run.
fn overlaps(a: &Backend, b: &Backend) -> bool {
    let nested = |x: &Path, y: &Path| x.starts_with(y) || y.starts_with(x);
    match (a, b) {
        (Backend::Local { root: a }, Backend::Local { root: b }) => nested(a, b),
        (
            Backend::S3 {
                bucket: a_bucket,
                prefix: a_prefix,
                endpoint: a_endpoint,
            },
            Backend::S3 {
                bucket: b_bucket,
                prefix: b_prefix,
                endpoint: b_endpoint,
            },
        ) => {
            a_bucket == b_bucket
                && a_endpoint == b_endpoint
                && nested(Path::new(a_prefix), Path::new(b_prefix))
        }
        _ => false,
    }
}

async fn check_source(source: &dyn StorageClient) -> Result<()> {
    match source.stat("").await {
        Ok(entry) if entry.is_dir => Ok(()),
        Ok(_) => Err(MirrorError::InvalidArgument(format!(
            "source '{}' is not a folder",
            source.location()
        ))),
        Err(e) if e.is_not_found() => Err(MirrorError::NotFound(source.location().to_string())),
        Err(e) => Err(e),
    }
}

async fn check_target(target: &dyn StorageClient) -> Result<()> {
    match target.stat("").await {
        Ok(entry) if entry.is_dir => Ok(()),
        Ok(_) => Err(MirrorError::InvalidArgument(format!(
            "target '{}' is not a folder",
            target.location()
        ))),
        // Created on first write
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::progress::QuietProgress;
    use crate::storage::local::LocalClient;
    use std::fs;
    use tempfile::TempDir;

    fn clients(src: &std::path::Path, dst: &std::path::Path) -> Arc<Clients> {
        Arc::new(Clients::new(
            Arc::new(LocalClient::new(Location::local(src))),
            vec![Arc::new(LocalClient::new(Location::local(dst))) as Arc<dyn StorageClient>],
        ))
    }

    #[tokio::test]
    async fn test_check_locations() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("file"), b"x").unwrap();

        assert!(check_locations(&clients(src.path(), &dst.path().join("new"))).await.is_ok());
        assert!(check_locations(&clients(&src.path().join("file"), dst.path())).await.is_err());
        assert!(check_locations(&clients(&src.path().join("missing"), dst.path()))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(check_locations(&clients(src.path(), src.path())).await.is_err());
        assert!(check_locations(&clients(src.path(), &src.path().join("mirror"))).await.is_err());

        let inner = dst.path().join("inner");
        fs::create_dir_all(&inner).unwrap();
        assert!(check_locations(&clients(&inner, dst.path())).await.is_err());
        // A sibling whose name merely extends the source's is fine
        let sibling = format!("{}-copy", src.path().display());
        assert!(check_locations(&clients(src.path(), Path::new(&sibling))).await.is_ok());
    }

    #[test]
    fn test_overlapping_buckets() {
        let s3 = |bucket: &str, prefix: &str| Backend::S3 {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            endpoint: None,
        };
        assert!(overlaps(&s3("b", "data"), &s3("b", "data/backup")));
        assert!(overlaps(&s3("b", ""), &s3("b", "x")));
        assert!(!overlaps(&s3("b", "data"), &s3("b", "database")));
        assert!(!overlaps(&s3("b", "data"), &s3("c", "data")));
        assert!(!overlaps(&s3("b", "data"), &Backend::Local { root: "/data".into() }));
    }

    #[tokio::test]
    async fn test_clean_run_removes_session() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"abc").unwrap();

        let options = MirrorOptions {
            policy: Policy::default(),
            watch: false,
            jobs: 2,
        };
        let summary = MirrorJob::new(clients(src.path(), dst.path()), options, Arc::new(QuietProgress::new(false)))
            .with_sessions(cache.path().to_path_buf())
            .run(Shutdown::new())
            .await
            .unwrap();

        assert_eq!(summary.copied, 1);
        assert!(!summary.interrupted);
        assert!(summary.session_dir.is_none());
        assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_without_force_rejected() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let options = MirrorOptions {
            policy: Policy::new(false, false, true),
            watch: false,
            jobs: 1,
        };
        let result = MirrorJob::new(clients(src.path(), dst.path()), options, Arc::new(QuietProgress::new(false)))
            .run(Shutdown::new())
            .await;
        assert!(result.is_err());
    }
}
