//! Local filesystem backend.
//!
//! Directory walks run on the blocking pool and feed the listing stream
//! through a bounded channel. Writes land in a temp file beside the
//! destination and are renamed into place, so a reader never observes a
//! partially written file.

use super::{
    receiver_stream, ByteStream, Entry, EntryStream, StorageClient, Subscription,
    LIST_CHANNEL_SIZE,
};
use crate::error::{MirrorError, Result};
use crate::location::{normalize_path, Backend, Location};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self as std_fs, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Suffix of in-flight writes; never listed or reported by the watcher
pub(crate) const TEMP_SUFFIX: &str = ".mirror.tmp";

pub struct LocalClient {
    location: Location,
    root: PathBuf,
}

impl LocalClient {
    pub fn new(location: Location) -> Self {
        let root = match &location.backend {
            Backend::Local { root } => root.clone(),
            // Only reachable through a programming error in open_client
            Backend::S3 { .. } => PathBuf::new(),
        };
        Self { location, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Ok(self.root.clone());
        }
        validate_key(&self.root, key)
    }
}

/// Validate that a relative key is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_key(root: &Path, key: &str) -> Result<PathBuf> {
    let rel_path = Path::new(key);
    if rel_path.is_absolute() {
        return Err(MirrorError::PathEscape(key.to_string()));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MirrorError::PathEscape(key.to_string()));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(MirrorError::PathEscape(key.to_string()));
    }

    Ok(full)
}

/// Key of `path` relative to `root`, '/'-separated.
pub(crate) fn key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn entry_from_metadata(key: String, metadata: &Metadata) -> Entry {
    let mut entry = if metadata.is_dir() {
        Entry::dir(key)
    } else {
        Entry::file(key, metadata.len())
    };
    if let Ok(modified) = metadata.modified() {
        entry = entry.with_modified(DateTime::<Utc>::from(modified));
    }
    entry
}

fn not_found_or_io(e: io::Error, display: String) -> MirrorError {
    if e.kind() == io::ErrorKind::NotFound {
        MirrorError::NotFound(display)
    } else {
        MirrorError::Io(e)
    }
}

struct Child {
    name: String,
    path: PathBuf,
    metadata: Metadata,
}

/// Read one directory level, sorted by name. Symlinks to files are followed;
/// symlinks to directories are skipped so a walk cannot loop.
fn read_sorted(dir: &Path) -> io::Result<Vec<Child>> {
    let mut children = Vec::new();
    for dirent in std_fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        let path = dirent.path();
        let file_type = dirent.file_type()?;
        let metadata = if file_type.is_symlink() {
            match std_fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    debug!("Skipping directory symlink {}", path.display());
                    continue;
                }
                Err(e) => {
                    debug!("Skipping dangling symlink {}: {}", path.display(), e);
                    continue;
                }
            }
        } else {
            dirent.metadata()?
        };
        children.push(Child {
            name,
            path,
            metadata,
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

/// Depth-first walk with name-sorted children, which yields path order.
fn walk(
    root: PathBuf,
    recursive: bool,
    include_dirs: bool,
    tx: mpsc::Sender<Result<Entry>>,
) {
    let top = match read_sorted(&root) {
        Ok(children) => children,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            let _ = tx.blocking_send(Err(MirrorError::Io(e)));
            return;
        }
    };

    // (key prefix, remaining children) per open directory
    let mut stack: Vec<(String, std::vec::IntoIter<Child>)> = vec![(String::new(), top.into_iter())];

    while let Some((prefix, children)) = stack.last_mut() {
        let Some(child) = children.next() else {
            stack.pop();
            continue;
        };
        let key = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{}/{}", prefix, child.name)
        };

        if child.metadata.is_dir() {
            if include_dirs && tx.blocking_send(Ok(entry_from_metadata(key.clone(), &child.metadata))).is_err() {
                return;
            }
            if recursive {
                match read_sorted(&child.path) {
                    Ok(grandchildren) => stack.push((key, grandchildren.into_iter())),
                    Err(e) => {
                        warn!("Cannot read directory {}: {}", child.path.display(), e);
                        if tx.blocking_send(Err(MirrorError::Io(e))).is_err() {
                            return;
                        }
                    }
                }
            }
        } else if tx.blocking_send(Ok(entry_from_metadata(key, &child.metadata))).is_err() {
            // Listing consumer went away
            return;
        }
    }
}

#[async_trait]
impl StorageClient for LocalClient {
    fn location(&self) -> &Location {
        &self.location
    }

    fn list(&self, recursive: bool, include_dirs: bool) -> EntryStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_SIZE);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk(root, recursive, include_dirs, tx));
        receiver_stream(rx)
    }

    async fn stat(&self, key: &str) -> Result<Entry> {
        let path = self.path_for(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(e, self.location.display_join(key)))?;
        Ok(entry_from_metadata(key.to_string(), &metadata))
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let path = self.path_for(key)?;
        let file = File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, self.location.display_join(key)))?;
        Ok(Box::pin(file))
    }

    async fn put(&self, key: &str, _size_hint: u64, mut reader: ByteStream) -> Result<u64> {
        if key.is_empty() {
            return Err(MirrorError::InvalidArgument("cannot write to the location root".to_string()));
        }
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique per write so concurrent copies of one key never share a temp file
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let prefix = format!(
            ".{}.",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&parent)
        })
        .await
        .map_err(io::Error::other)??;
        // Dropping the temp path removes the file on any early return
        let (std_file, temp_path) = temp.into_parts();

        let mut file = File::from_std(std_file);
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp_path.persist(&path).map_err(|e| MirrorError::Io(e.error))?;
        Ok(written)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(MirrorError::InvalidArgument("cannot remove the location root".to_string()));
        }
        let path = self.path_for(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(e, self.location.display_join(key)))?;

        // Prune directories the removal left empty, stopping at the root
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    #[cfg(feature = "watch")]
    async fn subscribe(&self, recursive: bool) -> Result<Subscription> {
        watcher::subscribe(&self.root, recursive)
    }

    #[cfg(not(feature = "watch"))]
    async fn subscribe(&self, _recursive: bool) -> Result<Subscription> {
        Err(MirrorError::Unsupported(
            "filesystem notifications require the `watch` feature".to_string(),
        ))
    }
}

#[cfg(feature = "watch")]
mod watcher {
    use super::{key_for, TEMP_SUFFIX};
    use crate::error::{MirrorError, Result};
    use crate::storage::{Subscription, SubscriptionSender, WatchEvent};
    use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
    use notify::{Event, EventKind, RecursiveMode, Watcher};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// inotify reports close-write; other backends only see opens and writes.
    pub(super) const REPORTS_CLOSE_WRITE: bool = cfg!(target_os = "linux");

    /// How long a file's size must hold still before it is copied, on
    /// backends without close-write.
    const SETTLE_INTERVAL: Duration = Duration::from_millis(300);

    pub(super) fn subscribe(root: &Path, recursive: bool) -> Result<Subscription> {
        if !root.is_dir() {
            return Err(MirrorError::NotFound(root.display().to_string()));
        }

        let (sender, subscription) = Subscription::channel();
        let event_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            forward(&event_root, res, &sender);
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;

        let subscription = subscription.with_guard(watcher);
        if REPORTS_CLOSE_WRITE {
            Ok(subscription)
        } else {
            Ok(subscription.with_settle(SETTLE_INTERVAL))
        }
    }

    fn forward(root: &Path, res: notify::Result<Event>, sender: &SubscriptionSender) {
        match res {
            Ok(event) => {
                for translated in translate(root, &event) {
                    let _ = sender.events.send(translated);
                }
            }
            Err(e) => {
                let _ = sender.errors.send(MirrorError::Notify(e));
            }
        }
    }

    /// Map a notify event to create/remove events. Sizes are never known at
    /// this point, so creations carry 0 and the consumer stats.
    ///
    /// Where close-write is reported a file is only announced once its writer
    /// closes it. Elsewhere it is announced on every open or write, and the
    /// subscription carries a settle interval instead.
    pub(super) fn translate(root: &Path, event: &Event) -> Vec<WatchEvent> {
        let create = |p: &PathBuf| {
            keyed(root, p).map(|key| WatchEvent::Create { key, size: 0 })
        };
        let remove = |p: &PathBuf| keyed(root, p).map(|key| WatchEvent::Remove { key });

        match &event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                event.paths.iter().filter_map(create).collect()
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                event.paths.iter().filter_map(remove).collect()
            }
            EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
                if !REPORTS_CLOSE_WRITE =>
            {
                event.paths.iter().filter_map(create).collect()
            }
            // inotify also reports both halves of a rename on their own
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if !REPORTS_CLOSE_WRITE => {
                let mut out = Vec::new();
                if let Some(from) = event.paths.first().and_then(remove) {
                    out.push(from);
                }
                if let Some(to) = event.paths.get(1).and_then(create) {
                    out.push(to);
                }
                out
            }
            _ => Vec::new(),
        }
    }

    fn keyed(root: &Path, path: &Path) -> Option<String> {
        let key = key_for(root, path)?;
        if key.ends_with(TEMP_SUFFIX) {
            return None;
        }
        Some(key)
    }
}
