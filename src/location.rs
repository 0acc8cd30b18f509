//! Location descriptors.
//!
//! A raw command-line argument resolves to either a local directory or an
//! object-storage prefix. Resolution is purely lexical: it never touches the
//! filesystem or the network, so two descriptors can be compared as soon as
//! they are resolved.

use crate::config::{AliasConfig, Config};
use crate::error::{MirrorError, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};

const S3_SCHEME: &str = "s3://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        /// Key prefix without leading or trailing '/'
        prefix: String,
        endpoint: Option<AliasConfig>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Registered alias this location was reached through, if any
    pub alias: Option<String>,
    /// The argument as typed
    pub raw: String,
    pub backend: Backend,
}

impl Location {
    /// Resolve a raw argument against the alias registry.
    ///
    /// Relative local paths are made absolute against `cwd`.
    pub fn resolve(raw: &str, config: &Config, cwd: &Path) -> Result<Self> {
        if raw.is_empty() {
            return Err(MirrorError::InvalidArgument("empty location".to_string()));
        }

        if let Some(rest) = raw.strip_prefix(S3_SCHEME) {
            let (bucket, prefix) = split_bucket(rest, raw)?;
            return Ok(Self {
                alias: None,
                raw: raw.to_string(),
                backend: Backend::S3 {
                    bucket,
                    prefix,
                    endpoint: None,
                },
            });
        }

        if let Some((first, rest)) = split_first_component(raw) {
            if let Some(alias_config) = config.alias(first) {
                let (bucket, prefix) = split_bucket(rest, raw)?;
                return Ok(Self {
                    alias: Some(first.to_string()),
                    raw: raw.to_string(),
                    backend: Backend::S3 {
                        bucket,
                        prefix,
                        endpoint: Some(alias_config.clone()),
                    },
                });
            }
        }

        let path = Path::new(raw);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };

        Ok(Self {
            alias: None,
            raw: raw.to_string(),
            backend: Backend::Local {
                root: normalize_path(&absolute),
            },
        })
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        let root = normalize_path(&root.into());
        Self {
            alias: None,
            raw: root.to_string_lossy().into_owned(),
            backend: Backend::Local { root },
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local { .. })
    }

    /// User-facing URL of `key` under this location.
    pub fn display_join(&self, key: &str) -> String {
        let base = self.to_string();
        if key.is_empty() {
            return base;
        }
        if base.ends_with('/') {
            format!("{}{}", base, key)
        } else {
            format!("{}/{}", base, key)
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::Local { root } => write!(f, "{}", root.display()),
            Backend::S3 { bucket, prefix, .. } => {
                match &self.alias {
                    Some(alias) => write!(f, "{}/{}", alias, bucket)?,
                    None => write!(f, "{}{}", S3_SCHEME, bucket)?,
                }
                if !prefix.is_empty() {
                    write!(f, "/{}", prefix)?;
                }
                Ok(())
            }
        }
    }
}

fn split_first_component(raw: &str) -> Option<(&str, &str)> {
    let (first, rest) = raw.split_once('/')?;
    if first.is_empty() {
        None
    } else {
        Some((first, rest))
    }
}

fn split_bucket(rest: &str, raw: &str) -> Result<(String, String)> {
    let rest = rest.trim_matches('/');
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(MirrorError::InvalidArgument(format!(
            "target '{}' does not contain bucket name",
            raw
        )));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}
