//! Alias registry and display settings.
//!
//! Both are built once at startup and passed by reference; nothing in the
//! engine reads process-global state to decide how to behave.

use crate::error::{MirrorError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A named object-storage endpoint, e.g. `play` in `play/photos/2014`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AliasConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aliases: BTreeMap<String, AliasConfig>,
}

impl Config {
    /// Default location: `<config dir>/mirror/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mirror").join("config.toml"))
    }

    /// Load the registry. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(MirrorError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        for name in config.aliases.keys() {
            if name.is_empty() || name.contains(&['/', '\\', ':'][..]) {
                return Err(MirrorError::Config(format!("invalid alias name '{}'", name)));
            }
        }
        Ok(config)
    }

    pub fn alias(&self, name: &str) -> Option<&AliasConfig> {
        self.aliases.get(name)
    }
}

/// How status is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Progress bar plus colorized per-item lines
    Plain,
    /// One JSON record per item, no bar
    Json,
    /// Errors and final summary only
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct DisplayConfig {
    pub mode: OutputMode,
    pub color: bool,
    pub debug: bool,
}

impl DisplayConfig {
    pub fn new(json: bool, quiet: bool, color: bool, debug: bool) -> Self {
        let mode = if json {
            OutputMode::Json
        } else if quiet {
            OutputMode::Quiet
        } else {
            OutputMode::Plain
        };
        Self {
            mode,
            color: color && mode != OutputMode::Json,
            debug,
        }
    }

    pub fn quiet() -> Self {
        Self::new(false, true, false, false)
    }
}
