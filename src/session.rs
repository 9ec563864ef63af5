/// Measurement session lifecycle: capture a start snapshot on creation,
/// capture the end snapshot on finalization (explicitly or on drop), diff the
/// pair, publish bound outputs and print the report.
use crate::counters::Snapshot;
use crate::diff::{diff, DerivedMetrics, DiffError, ModuleMetrics};
use crate::report::write_report;
use crate::source::{CaptureError, SnapshotSource};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A caller-owned output cell, written once when the session finalizes.
#[derive(Debug)]
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot(Arc::clone(&self.0))
    }
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        Slot(Arc::new(Mutex::new(None)))
    }

    /// Value published by the session, or `None` before finalization.
    pub fn get(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }
}

/// Where a finalized session publishes one of its results.
#[derive(Debug, Clone)]
pub enum OutputBinding {
    /// Aggregate controller (iMC) read volume in MB.
    ControllerRead(Slot<f64>),
    /// Aggregate controller (iMC) write volume in MB.
    ControllerWrite(Slot<f64>),
    /// Aggregate media read volume in MB, after write correction.
    MediaRead(Slot<f64>),
    /// Aggregate media write volume in MB.
    MediaWrite(Slot<f64>),
    /// Per-module results, in dump order.
    Modules(Slot<Vec<ModuleMetrics>>),
}

impl OutputBinding {
    fn publish(&self, metrics: &DerivedMetrics) {
        match self {
            OutputBinding::ControllerRead(slot) => slot.set(metrics.total.controller_read_mb),
            OutputBinding::ControllerWrite(slot) => slot.set(metrics.total.controller_write_mb),
            OutputBinding::MediaRead(slot) => slot.set(metrics.total.media_read_mb),
            OutputBinding::MediaWrite(slot) => slot.set(metrics.total.media_write_mb),
            OutputBinding::Modules(slot) => slot.set(metrics.modules.clone()),
        }
    }
}

/// Session construction options.
pub struct SessionOptions {
    name: String,
    report: bool,
    report_elapsed: bool,
    bindings: Vec<OutputBinding>,
    report_writer: Option<Box<dyn Write + Send>>,
}

impl SessionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            report: true,
            report_elapsed: true,
            bindings: Vec::new(),
            report_writer: None,
        }
    }

    /// Suppress the report; bound outputs are still published.
    pub fn quiet(mut self) -> Self {
        self.report = false;
        self
    }

    pub fn with_report(mut self, enabled: bool) -> Self {
        self.report = enabled;
        self
    }

    /// Leave the elapsed time out of the report, for sessions whose captures
    /// do not bracket a real run (replayed dumps).
    pub fn without_elapsed(mut self) -> Self {
        self.report_elapsed = false;
        self
    }

    pub fn bind(mut self, binding: OutputBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Send the report somewhere other than stderr.
    pub fn report_to(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.report_writer = Some(writer);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transient: only exists while [`MeasurementSession::begin`] captures the
    /// start snapshot. `begin` returns a session already `Measuring`, or an
    /// error, so `state()` never reports it.
    Created,
    Measuring,
    Finalized,
}

/// Errors that can occur during a measurement session.
#[derive(Debug)]
pub enum SessionError {
    /// Capturing the start or end snapshot failed.
    Capture(CaptureError),
    /// The snapshot pair could not be differenced.
    Diff(DiffError),
    /// `finalize` was called on a session that already finalized.
    AlreadyFinalized,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Capture(e) => write!(f, "snapshot capture failed: {}", e),
            SessionError::Diff(e) => write!(f, "snapshot diff failed: {}", e),
            SessionError::AlreadyFinalized => write!(f, "measurement session already finalized"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Capture(e) => Some(e),
            SessionError::Diff(e) => Some(e),
            SessionError::AlreadyFinalized => None,
        }
    }
}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        SessionError::Capture(e)
    }
}

impl From<DiffError> for SessionError {
    fn from(e: DiffError) -> Self {
        SessionError::Diff(e)
    }
}

/// A measured region. Finalizes exactly once: either through
/// [`MeasurementSession::finalize`] or when dropped while still measuring.
pub struct MeasurementSession<S: SnapshotSource> {
    source: S,
    name: String,
    report: bool,
    report_elapsed: bool,
    bindings: Vec<OutputBinding>,
    report_writer: Option<Box<dyn Write + Send>>,
    state: SessionState,
    start: Snapshot,
    started_at: DateTime<Utc>,
    started: Instant,
    end: Option<Snapshot>,
    finished_at: Option<DateTime<Utc>>,
    elapsed: Option<Duration>,
    metrics: Option<DerivedMetrics>,
}

impl<S: SnapshotSource> MeasurementSession<S> {
    /// Capture the start snapshot and begin measuring.
    pub fn begin(mut source: S, options: SessionOptions) -> Result<Self, SessionError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let start = source.capture()?;
        tracing::debug!(name = %options.name, modules = start.len(), "start snapshot captured");

        Ok(Self {
            source,
            name: options.name,
            report: options.report,
            report_elapsed: options.report_elapsed,
            bindings: options.bindings,
            report_writer: options.report_writer,
            state: SessionState::Measuring,
            start,
            started_at,
            started,
            end: None,
            finished_at: None,
            elapsed: None,
            metrics: None,
        })
    }

    /// Capture the end snapshot, diff, publish bound outputs and report.
    ///
    /// Only the first call does any work; later calls return
    /// [`SessionError::AlreadyFinalized`]. A failed finalization still
    /// consumes the session.
    pub fn finalize(&mut self) -> Result<&DerivedMetrics, SessionError> {
        if self.state != SessionState::Measuring {
            return Err(SessionError::AlreadyFinalized);
        }
        self.state = SessionState::Finalized;

        let end = self.source.capture()?;
        let elapsed = self.started.elapsed();
        self.finished_at = Some(Utc::now());
        self.elapsed = Some(elapsed);

        let metrics = diff(&self.start, &end)?;
        self.end = Some(end);

        for binding in &self.bindings {
            binding.publish(&metrics);
        }

        tracing::info!(
            name = %self.name,
            modules = metrics.modules.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            read_amplification = ?metrics.total.read_amplification.value(),
            write_amplification = ?metrics.total.write_amplification.value(),
            "measurement finalized"
        );

        if self.report {
            let shown = self.report_elapsed.then_some(elapsed);
            let result = match self.report_writer.as_mut() {
                Some(w) => write_report(w.as_mut(), &self.name, shown, &metrics),
                None => write_report(&mut std::io::stderr().lock(), &self.name, shown, &metrics),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to write measurement report");
            }
        }

        let metrics = self.metrics.insert(metrics);
        Ok(&*metrics)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> Option<&DerivedMetrics> {
        self.metrics.as_ref()
    }

    pub fn start_snapshot(&self) -> &Snapshot {
        &self.start
    }

    pub fn end_snapshot(&self) -> Option<&Snapshot> {
        self.end.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Wall-clock time between the two captures, once finalized.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }
}

impl<S: SnapshotSource> Drop for MeasurementSession<S> {
    fn drop(&mut self) {
        if self.state == SessionState::Measuring {
            let result = self.finalize().map(|_| ());
            if let Err(e) = result {
                tracing::error!(name = %self.name, error = %e, "measurement failed at scope exit");
            }
        }
    }
}

/// Run `workload` inside a measurement session and return its result along
/// with the derived metrics.
pub fn measure<S, F, R>(
    source: S,
    options: SessionOptions,
    workload: F,
) -> Result<(R, DerivedMetrics), SessionError>
where
    S: SnapshotSource,
    F: FnOnce() -> R,
{
    let mut session = MeasurementSession::begin(source, options)?;
    let value = workload();
    let metrics = session.finalize()?.clone();
    Ok((value, metrics))
}
