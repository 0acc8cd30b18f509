//! S3-compatible object storage via `object_store`.
//!
//! Object stores have no directories, only common prefixes. The listing is
//! a depth-first walk over `list_with_delimiter`, one level at a time with
//! children sorted by name, which yields the same path order the local
//! backend produces.

use super::{
    receiver_stream, ByteStream, Entry, EntryStream, StorageClient, Subscription,
    LIST_CHANNEL_SIZE,
};
use crate::error::{chain_is_transient, MirrorError, Result};
use crate::location::{Backend, Location};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::debug;

pub struct ObjectStoreClient {
    location: Location,
    store: Arc<dyn ObjectStore>,
    /// Key prefix inside the bucket, no leading or trailing '/'
    prefix: String,
}

impl ObjectStoreClient {
    /// Build an S3 client from the location's bucket and alias settings.
    /// Unset settings fall back to the standard `AWS_*` environment.
    pub fn open(location: Location) -> Result<Self> {
        let (bucket, prefix, endpoint) = match &location.backend {
            Backend::S3 {
                bucket,
                prefix,
                endpoint,
            } => (bucket.clone(), prefix.clone(), endpoint.clone()),
            Backend::Local { .. } => {
                return Err(MirrorError::InvalidArgument(format!(
                    "'{}' is not an object storage location",
                    location
                )))
            }
        };

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
        if let Some(alias) = endpoint {
            if let Some(url) = alias.endpoint {
                builder = builder.with_endpoint(url);
            }
            if let Some(region) = alias.region {
                builder = builder.with_region(region);
            }
            if let Some(key) = alias.access_key {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = alias.secret_key {
                builder = builder.with_secret_access_key(secret);
            }
            builder = builder.with_allow_http(alias.allow_http);
        }

        let store = builder.build().map_err(|e| {
            MirrorError::Config(format!("cannot configure bucket '{}': {}", bucket, e))
        })?;

        Ok(Self::with_store(location, Arc::new(store), prefix))
    }

    /// Wrap an existing store, e.g. `object_store::memory::InMemory`.
    pub fn with_store(location: Location, store: Arc<dyn ObjectStore>, prefix: String) -> Self {
        Self {
            location,
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn object_path(&self, key: &str) -> ObjectPath {
        match (self.prefix.is_empty(), key.is_empty()) {
            (true, _) => ObjectPath::from(key),
            (false, true) => ObjectPath::from(self.prefix.as_str()),
            (false, false) => ObjectPath::from(format!("{}/{}", self.prefix, key)),
        }
    }

    fn map_error(&self, key: &str, e: object_store::Error) -> MirrorError {
        match e {
            object_store::Error::NotFound { .. } => {
                MirrorError::NotFound(self.location.display_join(key))
            }
            other => {
                let transient = chain_is_transient(&other);
                MirrorError::Storage {
                    path: self.location.display_join(key),
                    message: other.to_string(),
                    transient,
                }
            }
        }
    }
}

/// Key of `path` relative to `base` ('' for the bucket root).
fn relative_key(base: &str, path: &ObjectPath) -> String {
    let full = path.as_ref();
    if base.is_empty() {
        return full.to_string();
    }
    full.strip_prefix(base)
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or_else(|| full.to_string())
}

fn entry_from_meta(key: String, meta: &ObjectMeta) -> Entry {
    let mut entry = Entry::file(key, meta.size as u64).with_modified(meta.last_modified);
    entry.version = meta.version.clone().or_else(|| meta.e_tag.clone());
    entry
}

enum Node {
    Dir(ObjectPath),
    Object(ObjectMeta),
}

impl Node {
    fn name(&self) -> &str {
        let path = match self {
            Node::Dir(p) => p,
            Node::Object(meta) => &meta.location,
        };
        path.filename().unwrap_or_default()
    }
}

async fn read_level(store: &dyn ObjectStore, prefix: Option<&ObjectPath>) -> object_store::Result<Vec<Node>> {
    let result = store.list_with_delimiter(prefix).await?;
    let mut nodes: Vec<Node> = result
        .common_prefixes
        .into_iter()
        .map(Node::Dir)
        .chain(result.objects.into_iter().map(Node::Object))
        .collect();
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(nodes)
}

async fn walk(
    store: Arc<dyn ObjectStore>,
    base: String,
    recursive: bool,
    include_dirs: bool,
    tx: mpsc::Sender<Result<Entry>>,
) {
    let base_path = (!base.is_empty()).then(|| ObjectPath::from(base.as_str()));
    let top = match read_level(store.as_ref(), base_path.as_ref()).await {
        Ok(nodes) => nodes,
        Err(object_store::Error::NotFound { .. }) => return,
        Err(e) => {
            let transient = chain_is_transient(&e);
            let _ = tx
                .send(Err(MirrorError::Storage {
                    path: base.clone(),
                    message: e.to_string(),
                    transient,
                }))
                .await;
            return;
        }
    };

    let mut stack: Vec<std::vec::IntoIter<Node>> = vec![top.into_iter()];
    while let Some(level) = stack.last_mut() {
        let Some(node) = level.next() else {
            stack.pop();
            continue;
        };
        match node {
            Node::Object(meta) => {
                let key = relative_key(&base, &meta.location);
                if key.is_empty() {
                    continue;
                }
                if tx.send(Ok(entry_from_meta(key, &meta))).await.is_err() {
                    return;
                }
            }
            Node::Dir(path) => {
                let key = relative_key(&base, &path);
                if include_dirs && tx.send(Ok(Entry::dir(key.clone()))).await.is_err() {
                    return;
                }
                if recursive {
                    match read_level(store.as_ref(), Some(&path)).await {
                        Ok(nodes) => stack.push(nodes.into_iter()),
                        Err(e) => {
                            let transient = chain_is_transient(&e);
                            let err = MirrorError::Storage {
                                path: key,
                                message: e.to_string(),
                                transient,
                            };
                            if tx.send(Err(err)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StorageClient for ObjectStoreClient {
    fn location(&self) -> &Location {
        &self.location
    }

    fn list(&self, recursive: bool, include_dirs: bool) -> EntryStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_SIZE);
        tokio::spawn(walk(
            self.store.clone(),
            self.prefix.clone(),
            recursive,
            include_dirs,
            tx,
        ));
        receiver_stream(rx)
    }

    async fn stat(&self, key: &str) -> Result<Entry> {
        let path = self.object_path(key);
        if !key.is_empty() {
            match self.store.head(&path).await {
                Ok(meta) => return Ok(entry_from_meta(key.to_string(), &meta)),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(self.map_error(key, e)),
            }
        }

        // No object: a non-empty common prefix still counts as a directory
        let prefix = (!path.as_ref().is_empty()).then_some(&path);
        let listing = self
            .store
            .list_with_delimiter(prefix)
            .await
            .map_err(|e| self.map_error(key, e))?;
        if key.is_empty() || !listing.objects.is_empty() || !listing.common_prefixes.is_empty() {
            Ok(Entry::dir(key))
        } else {
            Err(MirrorError::NotFound(self.location.display_join(key)))
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let result = self
            .store
            .get(&self.object_path(key))
            .await
            .map_err(|e| self.map_error(key, e))?;
        let stream = result
            .into_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put(&self, key: &str, size_hint: u64, mut reader: ByteStream) -> Result<u64> {
        let path = self.object_path(key);
        debug!("Uploading {} ({} bytes expected)", path, size_hint);

        let mut writer = BufWriter::new(self.store.clone(), path);
        let copied = match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(MirrorError::Io(e));
            }
        };
        writer.shutdown().await?;
        Ok(copied)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store
            .delete(&self.object_path(key))
            .await
            .map_err(|e| self.map_error(key, e))
    }

    async fn subscribe(&self, _recursive: bool) -> Result<Subscription> {
        Err(MirrorError::Unsupported(format!(
            "bucket notifications for '{}'",
            self.location
        )))
    }
}
