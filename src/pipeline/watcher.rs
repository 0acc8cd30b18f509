//! Turns live source notifications into work items.

use crate::pipeline::channel::{Endpoint, RunningTotals, WorkItem, WorkSender};
use crate::policy::Policy;
use crate::shutdown::Shutdown;
use crate::error::Result;
use crate::storage::{Clients, Entry, Subscription, WatchEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Re-stats before a still-growing file is copied anyway
const MAX_SETTLE_ROUNDS: usize = 20;

pub struct WatchAdapter {
    clients: Arc<Clients>,
    policy: Policy,
    totals: Arc<RunningTotals>,
    settle: Option<Duration>,
}

impl WatchAdapter {
    pub fn new(clients: Arc<Clients>, policy: Policy, totals: Arc<RunningTotals>) -> Self {
        Self {
            clients,
            policy,
            totals,
            settle: None,
        }
    }

    /// Consume the subscription until shutdown, until its event stream ends,
    /// or until the backend reports notifications as unsupported.
    pub async fn run(mut self, mut subscription: Subscription, tx: WorkSender, shutdown: Shutdown) {
        self.settle = subscription.settle;
        let mut errors_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                event = subscription.events.recv() => {
                    let Some(event) = event else {
                        debug!("Watch event stream closed");
                        break;
                    };
                    for item in self.handle(event).await {
                        if tx.send(item).is_err() {
                            return;
                        }
                    }
                }
                error = subscription.errors.recv(), if errors_open => match error {
                    None => errors_open = false,
                    Some(e) if e.is_unsupported() => {
                        info!("Continuous mirroring unavailable: {}", e);
                        break;
                    }
                    Some(e) => warn!("Watch error: {}", e),
                },
            }
        }
    }

    /// Items for one event, one per affected target.
    pub async fn handle(&self, event: WatchEvent) -> Vec<WorkItem> {
        match event {
            WatchEvent::Create { key, size } => self.on_create(key, size).await,
            WatchEvent::Remove { key } => self.on_remove(key),
        }
    }

    async fn on_create(&self, key: String, size: u64) -> Vec<WorkItem> {
        let source_entry = if size == 0 {
            match self.settled_stat(&key).await {
                Ok(entry) if entry.is_dir => return Vec::new(),
                Ok(entry) => entry,
                Err(e) => {
                    // Created and removed again before we got here
                    debug!("Dropping create of {}: {}", key, e);
                    return Vec::new();
                }
            }
        } else {
            Entry::file(key.clone(), size)
        };

        let source_url = self.clients.source.location().display_join(&key);
        let mut items = Vec::new();
        for (slot, target) in self.clients.targets.iter().enumerate() {
            let target_url = target.location().display_join(&key);
            if !self.policy.force {
                match target.stat(&key).await {
                    Ok(_) => {
                        debug!("Not overwriting {}", target_url);
                        continue;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        items.push(WorkItem::failed(
                            Some(Endpoint {
                                url: source_url.clone(),
                                entry: source_entry.clone(),
                            }),
                            None,
                            slot,
                            e,
                        ));
                        continue;
                    }
                }
            }

            let totals = self.totals.record(source_entry.size);
            items.push(WorkItem::copy(
                Endpoint {
                    url: source_url.clone(),
                    entry: source_entry.clone(),
                },
                Endpoint {
                    url: target_url,
                    entry: Entry::file(key.clone(), source_entry.size),
                },
                slot,
                totals,
            ));
        }
        items
    }

    /// Stat the source, waiting for its size and modification time to stop
    /// changing when the subscription announces creates early.
    async fn settled_stat(&self, key: &str) -> Result<Entry> {
        let mut entry = self.clients.source.stat(key).await?;
        let Some(settle) = self.settle else {
            return Ok(entry);
        };
        for _ in 0..MAX_SETTLE_ROUNDS {
            tokio::time::sleep(settle).await;
            let again = self.clients.source.stat(key).await?;
            if again.size == entry.size && again.modified == entry.modified {
                return Ok(again);
            }
            entry = again;
        }
        debug!("{} still changing, copying it as is", key);
        Ok(entry)
    }

    fn on_remove(&self, key: String) -> Vec<WorkItem> {
        if !self.policy.deletes() {
            return Vec::new();
        }
        self.clients
            .targets
            .iter()
            .enumerate()
            .map(|(slot, target)| {
                let totals = self.totals.record(0);
                WorkItem::delete(
                    Endpoint {
                        url: target.location().display_join(&key),
                        entry: Entry::file(key.clone(), 0),
                    },
                    slot,
                    totals,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::location::Location;
    use crate::pipeline::channel::{work_channel, Action};
    use crate::storage::local::LocalClient;
    use crate::storage::StorageClient;
    use std::fs;
    use tempfile::TempDir;

    fn adapter(src: &TempDir, dst: &TempDir, policy: Policy) -> WatchAdapter {
        let clients = Arc::new(Clients::new(
            Arc::new(LocalClient::new(Location::local(src.path()))),
            vec![Arc::new(LocalClient::new(Location::local(dst.path()))) as Arc<dyn StorageClient>],
        ));
        WatchAdapter::new(clients, policy, Arc::new(RunningTotals::new()))
    }

    #[tokio::test]
    async fn test_create_with_unknown_size_stats_source() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("new.txt"), b"12345").unwrap();

        let items = adapter(&src, &dst, Policy::default())
            .handle(WatchEvent::Create {
                key: "new.txt".into(),
                size: 0,
            })
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action(), Some(Action::Copy));
        assert_eq!(items[0].size(), 5);
        assert_eq!((items[0].total_count, items[0].total_bytes), (1, 5));
    }

    #[tokio::test]
    async fn test_settle_waits_for_growing_file() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("growing.bin");
        fs::write(&path, vec![1u8; 10]).unwrap();

        let mut watch = adapter(&src, &dst, Policy::default());
        watch.settle = Some(Duration::from_millis(200));
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
            std::io::Write::write_all(&mut file, &[2u8; 10]).unwrap();
        });

        let items = watch
            .handle(WatchEvent::Create {
                key: "growing.bin".into(),
                size: 0,
            })
            .await;
        writer.join().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size(), 20);
    }

    #[tokio::test]
    async fn test_vanished_create_is_dropped() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let items = adapter(&src, &dst, Policy::default())
            .handle(WatchEvent::Create {
                key: "ghost".into(),
                size: 0,
            })
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_existing_target_not_overwritten_without_force() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("f"), b"new").unwrap();
        fs::write(dst.path().join("f"), b"old!").unwrap();

        let event = WatchEvent::Create {
            key: "f".into(),
            size: 3,
        };
        assert!(adapter(&src, &dst, Policy::default()).handle(event.clone()).await.is_empty());
        assert_eq!(
            adapter(&src, &dst, Policy::new(true, false, false)).handle(event).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_requires_remove_and_force() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let event = WatchEvent::Remove { key: "f".into() };

        assert!(adapter(&src, &dst, Policy::new(true, false, false)).handle(event.clone()).await.is_empty());
        let items = adapter(&src, &dst, Policy::new(true, false, true)).handle(event).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action(), Some(Action::Delete));
    }

    #[tokio::test]
    async fn test_unsupported_error_ends_loop() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let (sender, subscription) = Subscription::channel();
        sender
            .errors
            .send(MirrorError::Unsupported("bucket notifications".into()))
            .unwrap();

        let (tx, mut rx) = work_channel();
        // Returns even though the event sender is still alive
        adapter(&src, &dst, Policy::default())
            .run(subscription, tx, Shutdown::new())
            .await;
        assert!(rx.recv().await.is_none());
        drop(sender);
    }

    #[tokio::test]
    async fn test_events_flow_until_stream_closes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"x").unwrap();
        let (sender, subscription) = Subscription::channel();
        sender
            .events
            .send(WatchEvent::Create {
                key: "a".into(),
                size: 0,
            })
            .unwrap();
        sender
            .errors
            .send(MirrorError::NotFound("transient".into()))
            .unwrap();
        drop(sender);

        let (tx, mut rx) = work_channel();
        adapter(&src, &dst, Policy::default())
            .run(subscription, tx, Shutdown::new())
            .await;
        let item = rx.recv().await.unwrap();
        assert_eq!(item.key(), "a");
        assert!(rx.recv().await.is_none());
    }
}
