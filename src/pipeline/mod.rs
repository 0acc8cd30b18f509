//! Mirror pipeline.
//!
//! Producers feed one work channel; a single scheduler admits items and runs
//! transfers; a single reducer folds the results.
//!
//! # Architecture
//!
//! ```text
//! +--------------+
//! |  Generator   | --+
//! | (differ)     |   |     +--------------+     +--------------+
//! +--------------+   +---> |  Scheduler   | --> |   Status     |
//! |  Watcher     | --+     | (semaphore)  |     |   reducer    |
//! | (notify)     |   |     +--------------+     | (session,    |
//! +--------------+   |                          |  progress)   |
//! |  Replay      | --+                          +--------------+
//! | (session)    |
//! +--------------+
//! ```

pub mod channel;
pub mod generator;
pub mod scheduler;
pub mod status;
pub mod watcher;

pub use channel::{
    status_channel, work_channel, Action, Endpoint, RunningTotals, StatusEvent, StatusReceiver,
    StatusSender, WorkItem, WorkReceiver, WorkSender,
};
pub use generator::Generator;
pub use scheduler::{default_jobs, Scheduler, SchedulerConfig};
pub use status::{MirrorSummary, StatusReducer};
pub use watcher::WatchAdapter;
