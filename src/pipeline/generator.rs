//! Generator task for the mirror pipeline.
//!
//! Runs one differencer pass per target and turns classifications into work
//! items according to the policy.

use crate::diff::{diff, Difference};
use crate::error::MirrorError;
use crate::pipeline::channel::{work_channel, Endpoint, RunningTotals, WorkItem, WorkReceiver, WorkSender};
use crate::policy::{decide, Decision, Policy};
use crate::shutdown::Shutdown;
use crate::storage::{Clients, Entry, StorageClient};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Generator state
pub struct Generator {
    clients: Arc<Clients>,
    policy: Policy,
    recursive: bool,
    totals: Arc<RunningTotals>,
    /// `(target_slot, key)` pairs already in a resumed session's log
    planned: HashSet<(usize, String)>,
}

impl Generator {
    pub fn new(clients: Arc<Clients>, policy: Policy, totals: Arc<RunningTotals>) -> Self {
        Self {
            clients,
            policy,
            recursive: true,
            totals,
            planned: HashSet::new(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Skip items a previous, interrupted preparation already logged.
    pub fn with_planned(mut self, planned: HashSet<(usize, String)>) -> Self {
        self.planned = planned;
        self
    }

    /// Spawn the generator on its own task and return the item stream.
    pub fn prepare(self, shutdown: Shutdown) -> WorkReceiver {
        let (tx, rx) = work_channel();
        tokio::spawn(async move { self.run(tx, shutdown).await });
        rx
    }

    /// Feed items into `tx` until every target has been compared.
    /// Returns false if shutdown cut preparation short.
    pub async fn run(self, tx: WorkSender, shutdown: Shutdown) -> bool {
        for (slot, target) in self.clients.targets.iter().enumerate() {
            info!(
                "Comparing {} with {}",
                self.clients.source.location(),
                target.location()
            );
            let mut diffs = diff(self.clients.source.as_ref(), target.as_ref(), self.recursive);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.wait() => {
                        info!("Preparation interrupted");
                        return false;
                    }
                    next = diffs.next() => next,
                };
                let Some(result) = next else { break };

                let item = match result {
                    Ok(difference) => self.plan(slot, target.as_ref(), difference),
                    Err(e) => Some(WorkItem::failed(None, None, slot, e)),
                };
                if let Some(item) = item {
                    if tx.send(item).is_err() {
                        debug!("Work channel closed, stopping preparation");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn plan(&self, slot: usize, target: &dyn StorageClient, difference: Difference) -> Option<WorkItem> {
        let source_location = self.clients.source.location();
        let key = difference.key().to_string();
        let source_endpoint = |entry: Entry| Endpoint {
            url: source_location.display_join(&entry.key),
            entry,
        };
        let target_endpoint = |entry: Entry| Endpoint {
            url: target.location().display_join(&entry.key),
            entry,
        };

        match decide(difference.classification, &self.policy) {
            Decision::Skip => None,
            Decision::Copy => {
                let source = difference.source?;
                if source.is_dir {
                    // Parents are created on write
                    return None;
                }
                if self.planned.contains(&(slot, key)) {
                    return None;
                }
                let target_entry = difference
                    .target
                    .unwrap_or_else(|| Entry::file(source.key.clone(), source.size));
                let totals = self.totals.record(source.size);
                Some(WorkItem::copy(
                    source_endpoint(source),
                    target_endpoint(target_entry),
                    slot,
                    totals,
                ))
            }
            Decision::Delete => {
                let target_entry = difference.target?;
                if target_entry.is_dir || self.planned.contains(&(slot, key)) {
                    return None;
                }
                let totals = self.totals.record(0);
                Some(WorkItem::delete(target_endpoint(target_entry), slot, totals))
            }
            Decision::RejectOverwrite => {
                let source = difference.source.map(source_endpoint);
                let target = difference.target.map(target_endpoint);
                let url = source.as_ref().map(|s| s.url.clone()).unwrap_or_default();
                Some(WorkItem::failed(
                    source,
                    target,
                    slot,
                    MirrorError::OverwriteNotAllowed(url),
                ))
            }
            Decision::RejectType => {
                let source = difference.source.map(source_endpoint);
                let target = difference.target.map(target_endpoint);
                let error = MirrorError::TypeMismatch {
                    source_url: source.as_ref().map(|s| s.url.clone()).unwrap_or_default(),
                    target: target.as_ref().map(|t| t.url.clone()).unwrap_or_default(),
                };
                Some(WorkItem::failed(source, target, slot, error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::pipeline::channel::Action;
    use crate::storage::local::LocalClient;
    use std::fs;
    use tempfile::TempDir;

    fn clients(src: &TempDir, dsts: &[&TempDir]) -> Arc<Clients> {
        Arc::new(Clients::new(
            Arc::new(LocalClient::new(Location::local(src.path()))),
            dsts.iter()
                .map(|d| Arc::new(LocalClient::new(Location::local(d.path()))) as Arc<dyn StorageClient>)
                .collect(),
        ))
    }

    async fn drain(mut rx: WorkReceiver) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_copies_with_running_totals() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a")).unwrap();
        fs::create_dir_all(src.path().join("b")).unwrap();
        fs::write(src.path().join("a/1.txt"), vec![0u8; 10]).unwrap();
        fs::write(src.path().join("b/2.txt"), vec![0u8; 20]).unwrap();

        let totals = Arc::new(RunningTotals::new());
        let items = drain(
            Generator::new(clients(&src, &[&dst]), Policy::default(), totals.clone())
                .prepare(Shutdown::new()),
        )
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key(), "a/1.txt");
        assert_eq!((items[0].seq, items[0].total_count, items[0].total_bytes), (1, 1, 10));
        assert_eq!(items[1].key(), "b/2.txt");
        assert_eq!((items[1].seq, items[1].total_count, items[1].total_bytes), (2, 2, 30));
        assert!(items.iter().all(|i| i.action() == Some(Action::Copy)));
        assert_eq!(totals.snapshot(), (2, 30));
    }

    #[tokio::test]
    async fn test_remove_with_force_deletes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("keep.txt"), b"k").unwrap();
        fs::write(dst.path().join("keep.txt"), b"k").unwrap();
        fs::create_dir_all(dst.path().join("c")).unwrap();
        fs::write(dst.path().join("c/old.txt"), b"old").unwrap();

        let items = drain(
            Generator::new(
                clients(&src, &[&dst]),
                Policy::new(true, false, true),
                Arc::new(RunningTotals::new()),
            )
            .prepare(Shutdown::new()),
        )
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action(), Some(Action::Delete));
        assert_eq!(items[0].key(), "c/old.txt");
        assert_eq!((items[0].total_count, items[0].total_bytes), (1, 0));
    }

    #[tokio::test]
    async fn test_size_conflict_without_force_is_error() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("x.bin"), vec![0u8; 100]).unwrap();
        fs::write(dst.path().join("x.bin"), vec![0u8; 50]).unwrap();

        let items = drain(
            Generator::new(clients(&src, &[&dst]), Policy::default(), Arc::new(RunningTotals::new()))
                .prepare(Shutdown::new()),
        )
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seq, 0);
        assert!(matches!(
            items[0].error.as_deref(),
            Some(MirrorError::OverwriteNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_multiple_targets_get_own_slots() {
        let src = TempDir::new().unwrap();
        let dst1 = TempDir::new().unwrap();
        let dst2 = TempDir::new().unwrap();
        fs::write(src.path().join("f"), b"abc").unwrap();
        fs::write(dst2.path().join("f"), b"abc").unwrap();

        let items = drain(
            Generator::new(clients(&src, &[&dst1, &dst2]), Policy::default(), Arc::new(RunningTotals::new()))
                .prepare(Shutdown::new()),
        )
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].target_slot, 0);
    }

    #[tokio::test]
    async fn test_planned_pairs_are_skipped() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("one"), b"1").unwrap();
        fs::write(src.path().join("two"), b"22").unwrap();

        let planned: HashSet<(usize, String)> = [(0, "one".to_string())].into_iter().collect();
        let items = drain(
            Generator::new(
                clients(&src, &[&dst]),
                Policy::default(),
                Arc::new(RunningTotals::starting_at(1, 1)),
            )
            .with_planned(planned)
            .prepare(Shutdown::new()),
        )
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key(), "two");
        assert_eq!((items[0].seq, items[0].total_bytes), (2, 3));
    }

    #[tokio::test]
    async fn test_shutdown_stops_preparation() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("one"), b"1").unwrap();

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let (tx, mut rx) = work_channel();
        let completed = Generator::new(clients(&src, &[&dst]), Policy::default(), Arc::new(RunningTotals::new()))
            .run(tx, shutdown)
            .await;

        assert!(!completed);
        assert!(rx.recv().await.is_none());
    }
}
