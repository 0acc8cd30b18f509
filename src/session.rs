// Resumable session state for one-shot mirrors
//
// A session is a directory under ~/.cache/mirror/sessions/<id>/ holding:
//   data.jsonl   append-only log of planned work items, one JSON object per line
//   header.json  checkpoint, rewritten atomically (temp file + rename)
//   lock         held exclusively while a run uses the session

use crate::error::{MirrorError, Result};
use crate::pipeline::channel::WorkItem;
use crate::policy::Policy;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DATA_FILE: &str = "data.jsonl";
const HEADER_FILE: &str = "header.json";
const LOCK_FILE: &str = "lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub version: u32,
    pub source: String,
    pub targets: Vec<String>,
    pub flags: Policy,

    /// Items and bytes planned so far
    pub total_objects: u64,
    pub total_bytes: u64,

    /// Source URL of the item at the watermark
    pub last_completed: Option<String>,

    /// Every seq up to and including this one has completed
    pub watermark: u64,

    /// Completed seqs above the watermark
    #[serde(default)]
    pub completed_above: BTreeSet<u64>,

    /// Preparation ran to the end; the log holds the whole plan
    pub prepared: bool,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl SessionHeader {
    fn new(source: &str, targets: &[String], flags: Policy) -> Self {
        let now = Utc::now();
        Self {
            version: Session::FORMAT_VERSION,
            source: source.to_string(),
            targets: targets.to_vec(),
            flags,
            total_objects: 0,
            total_bytes: 0,
            last_completed: None,
            watermark: 0,
            completed_above: BTreeSet::new(),
            prepared: false,
            created: now,
            updated: now,
        }
    }
}

/// Which seqs an earlier run already handled.
#[derive(Debug, Clone, Default)]
pub struct ResumeFilter {
    watermark: u64,
    completed_above: BTreeSet<u64>,
    logged: u64,
}

impl ResumeFilter {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Finished in an earlier run
    pub fn is_completed(&self, seq: u64) -> bool {
        seq != 0 && (seq <= self.watermark || self.completed_above.contains(&seq))
    }

    /// Already present in the session log
    pub fn is_logged(&self, seq: u64) -> bool {
        seq != 0 && seq <= self.logged
    }
}

pub struct Session {
    dir: PathBuf,
    header: SessionHeader,
    data: File,
    /// Held for the lifetime of the session; dropping it releases the lock
    _lock: File,
    /// Source URLs of completed items above the watermark
    pending_urls: HashMap<u64, String>,
    /// The data log already held items when the session was opened
    logged_before: bool,
}

impl Session {
    /// Format version
    pub const FORMAT_VERSION: u32 = 1;

    /// Unique id for a (source, targets, flags) combination
    pub fn session_id(source: &str, targets: &[String], flags: &Policy) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        targets.hash(&mut hasher);
        flags.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Session root (~/.cache/mirror/sessions/)
    pub fn state_dir() -> Result<PathBuf> {
        let cache_dir = if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
            PathBuf::from(xdg_cache)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".cache")
        } else {
            return Err(MirrorError::Session(
                "Cannot determine cache directory (HOME not set)".to_string(),
            ));
        };

        Ok(cache_dir.join("mirror").join("sessions"))
    }

    /// Open the session for this command under `base`, creating it if needed.
    pub fn open(base: &Path, source: &str, targets: &[String], flags: Policy) -> Result<Self> {
        let dir = base.join(Self::session_id(source, targets, &flags));
        fs::create_dir_all(&dir).map_err(|e| {
            MirrorError::Session(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| {
            MirrorError::Session(format!(
                "session {} is in use by another mirror",
                dir.display()
            ))
        })?;

        let header_path = dir.join(HEADER_FILE);
        let header = if header_path.exists() {
            let header: SessionHeader = serde_json::from_str(&fs::read_to_string(&header_path)?)?;
            if header.version != Self::FORMAT_VERSION {
                return Err(MirrorError::Session(format!(
                    "unsupported session format {} in {}",
                    header.version,
                    dir.display()
                )));
            }
            debug!("Resuming session {}", dir.display());
            header
        } else {
            SessionHeader::new(source, targets, flags)
        };

        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(DATA_FILE))?;
        let logged_before = data.metadata()?.len() > 0;

        let mut session = Self {
            dir,
            header,
            data,
            _lock: lock,
            pending_urls: HashMap::new(),
            logged_before,
        };
        if !header_path.exists() {
            session.save()?;
        }
        Ok(session)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    /// Anything planned by an earlier run? The log counts even when the
    /// header never caught up with it.
    pub fn is_resumed(&self) -> bool {
        self.logged_before || self.header.total_objects > 0 || self.header.prepared
    }

    /// Items logged by earlier runs, in log order. A torn final line from a
    /// crash is skipped.
    pub fn load_items(&self) -> Result<Vec<WorkItem>> {
        let file = File::open(self.dir.join(DATA_FILE))?;
        let mut items = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkItem>(&line) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping malformed session line {}: {}", n + 1, e),
            }
        }
        Ok(items)
    }

    pub fn resume_filter(&self, logged: &[WorkItem]) -> ResumeFilter {
        ResumeFilter {
            watermark: self.header.watermark,
            completed_above: self.header.completed_above.clone(),
            logged: logged.iter().map(|i| i.seq).max().unwrap_or(0),
        }
    }

    /// Totals to continue planning from. The log wins over the header, which
    /// may lag behind it after a crash.
    pub fn resume_totals(&self, logged: &[WorkItem]) -> (u64, u64) {
        logged.iter().fold(
            (self.header.total_objects, self.header.total_bytes),
            |(count, bytes), item| (count.max(item.total_count), bytes.max(item.total_bytes)),
        )
    }

    /// `(target_slot, key)` of every logged item
    pub fn planned_pairs(logged: &[WorkItem]) -> HashSet<(usize, String)> {
        logged
            .iter()
            .map(|i| (i.target_slot, i.key().to_string()))
            .collect()
    }

    /// Log a newly planned item. The header is checkpointed after the first
    /// one so a crash before any completion still leaves a resumable session.
    pub fn append(&mut self, item: &WorkItem) -> Result<()> {
        let mut line = serde_json::to_string(item)?;
        line.push('\n');
        self.data.write_all(line.as_bytes())?;
        let first = self.header.total_objects == 0;
        self.header.total_objects = self.header.total_objects.max(item.total_count);
        self.header.total_bytes = self.header.total_bytes.max(item.total_bytes);
        if first {
            self.save()?;
        }
        Ok(())
    }

    /// Record a completed item and checkpoint the header.
    pub fn complete(&mut self, item: &WorkItem) -> Result<()> {
        if item.seq == 0 || item.seq <= self.header.watermark {
            return Ok(());
        }
        let url = item
            .source
            .as_ref()
            .or(item.target.as_ref())
            .map(|e| e.url.clone())
            .unwrap_or_default();

        if item.seq == self.header.watermark + 1 {
            self.header.watermark = item.seq;
            self.header.last_completed = Some(url);
            while self.header.completed_above.remove(&(self.header.watermark + 1)) {
                self.header.watermark += 1;
                if let Some(url) = self.pending_urls.remove(&self.header.watermark) {
                    self.header.last_completed = Some(url);
                }
            }
        } else {
            self.header.completed_above.insert(item.seq);
            self.pending_urls.insert(item.seq, url);
        }
        self.save()
    }

    pub fn mark_prepared(&mut self) {
        self.header.prepared = true;
    }

    /// Flush the log and rewrite the header atomically.
    pub fn save(&mut self) -> Result<()> {
        self.data.flush()?;
        self.data.sync_data()?;

        self.header.updated = Utc::now();
        let header_path = self.dir.join(HEADER_FILE);
        let temp_file = header_path.with_extension("tmp");
        {
            let mut file = File::create(&temp_file)?;
            file.write_all(serde_json::to_string_pretty(&self.header)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_file, &header_path)?;
        Ok(())
    }

    /// Remove the session after a clean run.
    pub fn delete(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
