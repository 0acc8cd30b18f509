//! mirror - keep a target folder or object-store prefix in step with a source.
//!
//! A one-shot run compares the two trees and copies or removes the
//! difference; watch mode keeps following source notifications afterwards.
//! Interrupted one-shot runs leave a session behind and pick up where they
//! stopped when the same command is run again.

pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod location;
pub mod mirror;
pub mod output;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod session;
pub mod shutdown;
pub mod storage;

pub use config::{Config, DisplayConfig, OutputMode};
pub use error::{MirrorError, Result};
pub use location::Location;
pub use mirror::{check_locations, MirrorJob, MirrorOptions};
pub use pipeline::{default_jobs, MirrorSummary};
pub use policy::Policy;
pub use progress::{progress_for, Progress, ProgressSummary};
pub use session::Session;
pub use shutdown::{install_signal_handler, Shutdown, INTERRUPTED_EXIT_CODE};
pub use storage::{open_client, Clients, StorageClient};
