//! Progress sinks.
//!
//! One trait, three renderings picked once at startup: an interactive bar, a
//! JSON-lines stream, and a silent accounter that only keeps totals. Workers
//! feed byte counts through [`ProgressReader`]; everything else is driven by
//! the status reducer.

use crate::config::{DisplayConfig, OutputMode};
use crate::output::StatusMessage;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};

pub trait Progress: Send + Sync {
    /// Expected bytes for the whole run. Only ever grows.
    fn set_total(&self, bytes: u64);

    /// Bytes moved (or accounted for)
    fn add(&self, bytes: u64);

    /// Take back bytes counted for a transfer that then failed
    fn retract(&self, bytes: u64);

    /// Name of the object currently being transferred
    fn set_caption(&self, caption: &str);

    /// Items planned so far, for feedback while the trees are compared
    fn planned(&self, count: u64);

    fn report(&self, message: &StatusMessage);

    fn finish(&self) -> ProgressSummary;
}

/// Totals shared by every sink.
#[derive(Debug)]
pub struct Accounter {
    total: AtomicU64,
    transferred: AtomicU64,
    started: Instant,
}

impl Default for Accounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn set_total(&self, bytes: u64) -> u64 {
        self.total.fetch_max(bytes, Ordering::SeqCst).max(bytes)
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn retract(&self, bytes: u64) {
        let _ = self
            .transferred
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total: self.total.load(Ordering::SeqCst),
            transferred: self.transferred.load(Ordering::SeqCst),
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub total: u64,
    pub transferred: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl ProgressSummary {
    /// Bytes per second over the whole run
    pub fn speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return self.transferred;
        }
        (self.transferred as f64 / secs) as u64
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}, Transferred: {}, Speed: {}/s",
            HumanBytes(self.total),
            HumanBytes(self.transferred),
            HumanBytes(self.speed())
        )
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Interactive bar on stderr; item lines go to stdout above it.
pub struct BarProgress {
    bar: ProgressBar,
    accounter: Accounter,
    color: bool,
}

impl BarProgress {
    pub fn new(color: bool) -> Self {
        let style = ProgressStyle::with_template(
            "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {wide_msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        let bar = ProgressBar::new(0);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            accounter: Accounter::new(),
            color,
        }
    }
}

impl Progress for BarProgress {
    fn set_total(&self, bytes: u64) {
        let total = self.accounter.set_total(bytes);
        self.bar.set_length(total);
    }

    fn add(&self, bytes: u64) {
        self.accounter.add(bytes);
        self.bar.inc(bytes);
    }

    fn retract(&self, bytes: u64) {
        self.accounter.retract(bytes);
        self.bar.set_position(self.bar.position().saturating_sub(bytes));
    }

    fn set_caption(&self, caption: &str) {
        self.bar.set_message(caption.to_string());
    }

    fn planned(&self, count: u64) {
        self.bar.set_prefix(format!("[{} planned]", count));
    }

    fn report(&self, message: &StatusMessage) {
        let line = message.render(self.color);
        self.bar.suspend(|| {
            if message.is_error() {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
        });
    }

    fn finish(&self) -> ProgressSummary {
        self.bar.finish_and_clear();
        self.accounter.summary()
    }
}

/// One JSON record per item on stdout, errors on stderr.
#[derive(Default)]
pub struct JsonProgress {
    accounter: Accounter,
}

impl Progress for JsonProgress {
    fn set_total(&self, bytes: u64) {
        self.accounter.set_total(bytes);
    }

    fn add(&self, bytes: u64) {
        self.accounter.add(bytes);
    }

    fn retract(&self, bytes: u64) {
        self.accounter.retract(bytes);
    }

    fn set_caption(&self, _caption: &str) {}

    fn planned(&self, _count: u64) {}

    fn report(&self, message: &StatusMessage) {
        if message.is_error() {
            eprintln!("{}", message.json());
        } else {
            println!("{}", message.json());
        }
    }

    fn finish(&self) -> ProgressSummary {
        self.accounter.summary()
    }
}

/// Keeps totals; prints nothing but errors.
#[derive(Default)]
pub struct QuietProgress {
    accounter: Accounter,
    color: bool,
}

impl QuietProgress {
    pub fn new(color: bool) -> Self {
        Self {
            accounter: Accounter::new(),
            color,
        }
    }

    /// Bytes accounted so far
    pub fn transferred(&self) -> u64 {
        self.accounter.summary().transferred
    }
}

impl Progress for QuietProgress {
    fn set_total(&self, bytes: u64) {
        self.accounter.set_total(bytes);
    }

    fn add(&self, bytes: u64) {
        self.accounter.add(bytes);
    }

    fn retract(&self, bytes: u64) {
        self.accounter.retract(bytes);
    }

    fn set_caption(&self, _caption: &str) {}

    fn planned(&self, _count: u64) {}

    fn report(&self, message: &StatusMessage) {
        if message.is_error() {
            eprintln!("{}", message.render(self.color));
        }
    }

    fn finish(&self) -> ProgressSummary {
        self.accounter.summary()
    }
}

pub fn progress_for(display: &DisplayConfig) -> Arc<dyn Progress> {
    match display.mode {
        OutputMode::Plain => Arc::new(BarProgress::new(display.color)),
        OutputMode::Json => Arc::new(JsonProgress::default()),
        OutputMode::Quiet => Arc::new(QuietProgress::new(display.color)),
    }
}

// =============================================================================
// ProgressReader
// =============================================================================

/// Reader wrapper that reports every chunk read to a progress sink.
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<dyn Progress>,
    read: Arc<AtomicU64>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Arc<dyn Progress>) -> Self {
        Self {
            inner,
            progress,
            read: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes reported so far. The handle outlives the reader, so a caller
    /// can retract them after handing the reader off.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.read.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                this.read.fetch_add(n, Ordering::Relaxed);
                this.progress.add(n);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_accounter_total_only_grows() {
        let acc = Accounter::new();
        assert_eq!(acc.set_total(100), 100);
        assert_eq!(acc.set_total(50), 100);
        acc.add(40);
        acc.retract(60);
        assert_eq!(acc.summary().transferred, 0);
        assert_eq!(acc.summary().total, 100);
    }

    #[test]
    fn test_summary_display() {
        let summary = ProgressSummary {
            total: 2048,
            transferred: 1024,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(
            summary.to_string(),
            "Total: 2.00 KiB, Transferred: 1.00 KiB, Speed: 1.00 KiB/s"
        );
    }

    #[tokio::test]
    async fn test_progress_reader_counts_bytes() {
        let quiet = Arc::new(QuietProgress::new(false));
        let progress: Arc<dyn Progress> = quiet.clone();
        let mut reader = ProgressReader::new(io::Cursor::new(vec![7u8; 5000]), progress);
        let counter = reader.counter();

        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 5000);
        assert_eq!(counter.load(Ordering::Relaxed), 5000);
        assert_eq!(quiet.transferred(), 5000);
    }
}
