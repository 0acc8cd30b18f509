use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("'{0}' does not exist")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("overwrite not allowed for '{0}', use --force to override")]
    OverwriteNotAllowed(String),

    #[error("invalid target '{target}': type differs from source '{source_url}'")]
    TypeMismatch { source_url: String, target: String },

    #[error("path '{0}' escapes the location root")]
    PathEscape(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("storage error on '{path}': {message}")]
    Storage {
        path: String,
        message: String,
        transient: bool,
    },

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

impl MirrorError {
    /// The object vanished or never existed. Expected during watch races.
    pub fn is_not_found(&self) -> bool {
        match self {
            MirrorError::NotFound(_) => true,
            MirrorError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Network-class failures that warrant keeping the session for a later resume.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::Io(e) => is_transient_io(e),
            MirrorError::Storage { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, MirrorError::Unsupported(_))
    }
}

pub(crate) fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Walks an error's source chain looking for a transient `io::Error`.
#[cfg_attr(not(feature = "s3"), allow(dead_code))]
pub(crate) fn chain_is_transient(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_transient_io(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
