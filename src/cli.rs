use crate::config::DisplayConfig;
use crate::policy::Policy;
use clap::Parser;
use std::path::PathBuf;

const EXAMPLES: &str = "\
EXAMPLES:
  Mirror a local folder to a bucket prefix:
    mirror backup/ play/photos/2014

  Preview what would change, deleting stale objects on the target:
    mirror --force --remove --fake ~/photos play/photos

  Keep a target in sync continuously:
    mirror --watch ~/photos play/photos

  Mirror to several targets at once:
    mirror ~/photos play/photos s3://archive/photos";

#[derive(Parser, Debug)]
#[command(name = "mirror")]
#[command(about = "Mirror directories and object-store prefixes, once or continuously", long_about = None)]
#[command(version)]
#[command(after_help = EXAMPLES)]
pub struct Cli {
    /// Source folder or prefix (local path, s3://bucket/prefix, or alias/bucket/prefix)
    pub source: String,

    /// One or more targets
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,

    /// Overwrite target objects whose size differs from the source
    #[arg(long)]
    pub force: bool,

    /// Show what would be transferred without changing anything
    #[arg(long, visible_alias = "dry-run")]
    pub fake: bool,

    /// Keep mirroring changes as they happen on the source
    #[arg(short, long)]
    pub watch: bool,

    /// Delete target objects that are absent from the source (requires --force)
    #[arg(long)]
    pub remove: bool,

    /// Concurrent transfers (default: CPU count - 1)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// One JSON record per line instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Only print errors and the final summary
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Debug logging on stderr
    #[arg(long)]
    pub debug: bool,

    /// Alias registry (TOML)
    #[arg(long, env = "MIRROR_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.remove && !self.force {
            return Err("--remove is only supported with --force".to_string());
        }
        if self.jobs == Some(0) {
            return Err("--jobs must be at least 1".to_string());
        }
        if self.targets.iter().any(|t| t == &self.source) {
            return Err(format!("source and target are the same: '{}'", self.source));
        }
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy::new(self.force, self.fake, self.remove)
    }

    pub fn display(&self, stdout_is_tty: bool) -> DisplayConfig {
        DisplayConfig::new(self.json, self.quiet, !self.no_color && stdout_is_tty, self.debug)
    }
}
