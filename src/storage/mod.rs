//! Storage client abstraction.
//!
//! Every backend exposes the same capability over keys relative to the
//! location it was opened on: list, stat, get, put, remove and a change-event
//! subscription. Listings are delivered in path order (see [`key_cmp`]) so two
//! backends can be compared in lock-step.

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use crate::error::{MirrorError, Result};
use crate::location::{Backend, Location};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Channel size between a blocking/background walker and the listing stream
pub const LIST_CHANNEL_SIZE: usize = 1024;

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;
pub type EntryStream = BoxStream<'static, Result<Entry>>;

/// One object or file under a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Path relative to the location root, '/'-separated
    pub key: String,

    /// Size in bytes (0 for directories)
    pub size: u64,

    pub is_dir: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    /// Version or ETag on versioned backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Entry {
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            is_dir: false,
            modified: None,
            version: None,
        }
    }

    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            is_dir: true,
            modified: None,
            version: None,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// Path order: keys compared component by component.
///
/// This is the order a depth-first walk with name-sorted children yields, so
/// `a` < `a/x` < `a.txt`. A file and a directory with the same name compare
/// equal, which is what lets the differencer see type mismatches.
pub fn key_cmp(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// Live change notification, keyed relative to the subscribed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// `size == 0` means unknown: the receiver must stat the object.
    Create { key: String, size: u64 },
    Remove { key: String },
}

/// Event and error streams of one subscription.
///
/// The optional guard keeps the backend watcher alive for as long as the
/// subscription is held.
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<WatchEvent>,
    pub errors: mpsc::UnboundedReceiver<MirrorError>,
    /// Set when a create may be announced while the object is still being
    /// written; its size must hold still for this long before it is copied.
    pub settle: Option<Duration>,
    _guard: Option<Box<dyn Send>>,
}

/// Producer half of a [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionSender {
    pub events: mpsc::UnboundedSender<WatchEvent>,
    pub errors: mpsc::UnboundedSender<MirrorError>,
}

impl Subscription {
    pub fn channel() -> (SubscriptionSender, Subscription) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        (
            SubscriptionSender {
                events: event_tx,
                errors: error_tx,
            },
            Subscription {
                events: event_rx,
                errors: error_rx,
                settle: None,
                _guard: None,
            },
        )
    }

    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Location this client is rooted at
    fn location(&self) -> &Location;

    /// Entries under the root in path order. Errors are yielded inline and
    /// the listing continues past them. A root that does not exist lists as
    /// empty.
    fn list(&self, recursive: bool, include_dirs: bool) -> EntryStream;

    /// Metadata of `key`. The empty key is the root itself.
    async fn stat(&self, key: &str) -> Result<Entry>;

    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Write `reader` to `key`, returning the number of bytes written.
    async fn put(&self, key: &str, size_hint: u64, reader: ByteStream) -> Result<u64>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to create/remove notifications under the root.
    /// Backends without notifications return [`MirrorError::Unsupported`].
    async fn subscribe(&self, recursive: bool) -> Result<Subscription>;
}

/// Source client plus one client per target, addressed by slot index.
pub struct Clients {
    pub source: Arc<dyn StorageClient>,
    pub targets: Vec<Arc<dyn StorageClient>>,
}

impl Clients {
    pub fn new(source: Arc<dyn StorageClient>, targets: Vec<Arc<dyn StorageClient>>) -> Self {
        Self { source, targets }
    }

    pub fn target(&self, slot: usize) -> Result<&Arc<dyn StorageClient>> {
        self.targets
            .get(slot)
            .ok_or_else(|| MirrorError::InvalidArgument(format!("no target in slot {}", slot)))
    }
}

/// Open the client for a resolved location.
pub fn open_client(location: &Location) -> Result<Arc<dyn StorageClient>> {
    match &location.backend {
        Backend::Local { .. } => Ok(Arc::new(local::LocalClient::new(location.clone()))),
        #[cfg(feature = "s3")]
        Backend::S3 { .. } => Ok(Arc::new(s3::ObjectStoreClient::open(location.clone())?)),
        #[cfg(not(feature = "s3"))]
        Backend::S3 { .. } => Err(MirrorError::Unsupported(format!(
            "'{}' is object storage; rebuild with the `s3` feature",
            location
        ))),
    }
}

/// Adapt a walker's receiving channel into a listing stream.
pub(crate) fn receiver_stream(rx: mpsc::Receiver<Result<Entry>>) -> EntryStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_cmp_path_order() {
        let mut keys = vec!["a.txt", "a/x", "a", "b", "a/x/y", "a-b", "ab"];
        keys.sort_by(|a, b| key_cmp(a, b));
        assert_eq!(keys, vec!["a", "a/x", "a/x/y", "a-b", "a.txt", "ab", "b"]);
    }

    #[test]
    fn test_key_cmp_equal_names() {
        assert_eq!(key_cmp("dir/file", "dir/file"), Ordering::Equal);
        assert_eq!(key_cmp("dir", "dir/file"), Ordering::Less);
    }

    #[test]
    fn test_entry_serde_roundtrip_skips_none() {
        let entry = Entry::file("a/1.txt", 10);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("modified"));
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[tokio::test]
    async fn test_subscription_channel() {
        let (tx, mut sub) = Subscription::channel();
        tx.events
            .send(WatchEvent::Remove {
                key: "gone.txt".to_string(),
            })
            .unwrap();
        drop(tx);
        assert_eq!(
            sub.events.recv().await,
            Some(WatchEvent::Remove {
                key: "gone.txt".to_string()
            })
        );
        assert!(sub.events.recv().await.is_none());
        assert!(sub.errors.recv().await.is_none());
    }
}
