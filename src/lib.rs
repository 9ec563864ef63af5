//! Persistent-memory DIMM counter probe.
//!
//! Captures counter dumps before and after a workload, differences them into
//! per-DIMM bandwidth and read/write amplification, and reports progress of
//! long-running workloads from a background thread.
pub mod config;
pub mod counters;
pub mod diff;
pub mod profiler;
pub mod progress;
pub mod report;
pub mod session;
pub mod source;

pub use counters::{parse_dump, Counter, CounterRecord, CounterValue, ParseError, Snapshot};
pub use diff::{diff, Amplification, DerivedMetrics, DiffError, ModuleMetrics, Totals};
pub use progress::{ProgressAggregator, ProgressSource};
pub use session::{measure, MeasurementSession, OutputBinding, SessionError, SessionOptions, Slot};
pub use source::{CaptureError, FileSource, IpmctlSource, SnapshotSource, StaticSource};
