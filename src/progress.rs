//! Background progress indicator.
//!
//! Workload threads bump their own `AtomicU64` counters; the aggregator owns a
//! poll thread that periodically sums every registered counter and redraws a
//! single-line bar. The poll thread owns clones of the shared state and is
//! always joined before the aggregator goes away.
use crate::config::ProgressConfig;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// An externally owned, monotonically increasing counter.
pub type ProgressSource = Arc<AtomicU64>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Columns in the rendered bar.
pub const BAR_WIDTH: u64 = 100;

/// A computed percentage above this stops the poller without rendering.
pub const OVERSHOOT_LIMIT: u64 = 100;

type Sources = Arc<Mutex<Vec<ProgressSource>>>;
type Output = Box<dyn Write + Send>;

/// `floor(sum * 100 / total)`, or 0 when `total` is 0.
pub fn percent(sum: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    let pct = u128::from(sum) * 100 / u128::from(total);
    u64::try_from(pct).unwrap_or(u64::MAX)
}

/// Carriage-return redraw of the bar for `pct` (clamped to 100).
pub fn render_bar(pct: u64) -> String {
    let filled = pct.min(BAR_WIDTH) as usize;
    let empty = BAR_WIDTH as usize - filled;
    format!("\r[{}=>{}] {}%", "=".repeat(filled), " ".repeat(empty), filled)
}

fn sum_sources(sources: &Sources) -> u64 {
    sources
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .fold(0u64, |acc, s| acc.saturating_add(s.load(Ordering::Relaxed)))
}

fn poll_loop(
    sources: Sources,
    total: u64,
    interval: Duration,
    stop: mpsc::Receiver<()>,
    mut out: Output,
) -> Output {
    tracing::debug!(total, interval_ms = interval.as_millis() as u64, "progress poller started");
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let pct = percent(sum_sources(&sources), total);
        if pct > OVERSHOOT_LIMIT {
            tracing::debug!(pct, "progress overshoot, stopping poller");
            break;
        }
        if let Err(e) = out
            .write_all(render_bar(pct).as_bytes())
            .and_then(|_| out.flush())
        {
            tracing::debug!(error = %e, "failed to render progress");
        }
    }
    tracing::debug!("progress poller stopped");
    out
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<Output>,
}

/// Sums registered [`ProgressSource`]s against a fixed target and renders a
/// percentage bar from a background thread.
pub struct ProgressAggregator {
    sources: Sources,
    total: u64,
    worker: Mutex<Option<Worker>>,
}

impl ProgressAggregator {
    /// Start a poller rendering to stderr every [`DEFAULT_POLL_INTERVAL`].
    pub fn new(total: u64) -> Self {
        Self::with_output(total, DEFAULT_POLL_INTERVAL, Box::new(std::io::stderr()))
    }

    pub fn with_interval(total: u64, interval: Duration) -> Self {
        Self::with_output(total, interval, Box::new(std::io::stderr()))
    }

    pub fn from_config(total: u64, config: &ProgressConfig) -> Self {
        Self::with_interval(total, config.interval())
    }

    pub fn with_output(total: u64, interval: Duration, out: Box<dyn Write + Send>) -> Self {
        let sources: Sources = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker_sources = Arc::clone(&sources);
        let handle =
            std::thread::spawn(move || poll_loop(worker_sources, total, interval, stop_rx, out));

        Self {
            sources,
            total,
            worker: Mutex::new(Some(Worker {
                stop: stop_tx,
                handle,
            })),
        }
    }

    /// Add a source. Safe to call from any thread, including while a poll is
    /// in flight.
    pub fn register(&self, source: ProgressSource) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source);
    }

    /// Create, register and return a fresh counter starting at zero.
    pub fn source(&self) -> ProgressSource {
        let source = Arc::new(AtomicU64::new(0));
        self.register(Arc::clone(&source));
        source
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn sources(&self) -> usize {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Percentage right now, computed the same way the poller does.
    pub fn current_percent(&self) -> u64 {
        percent(sum_sources(&self.sources), self.total)
    }

    /// Whether the poll thread is still running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Stop the poller and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Worker { stop, handle }) = worker else {
            return;
        };
        // The poller may already have exited on overshoot.
        let _ = stop.send(());
        match handle.join() {
            Ok(mut out) => {
                let _ = out.write_all(b"\n").and_then(|_| out.flush());
            }
            Err(_) => tracing::error!("progress poller panicked"),
        }
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
