//! Snapshot differencing: turns a start/end snapshot pair into per-module
//! bandwidth figures and read/write amplification.
//!
//! Counters tick in 64-byte transactions; `UNITS_PER_MB` converts a raw
//! delta to megabytes. The media-read counter also counts writes, so the
//! media-write figure is subtracted from it, in megabytes.
use crate::counters::{Counter, CounterRecord, Snapshot, COUNTERS_PER_MODULE};
use serde::Serialize;
use std::fmt;

/// Raw counter units per megabyte.
pub const UNITS_PER_MB: f64 = 16384.0;

/// Amplification ratios above this are reported as not applicable.
pub const AMPLIFICATION_SANITY_LIMIT: f64 = 5.0;

/// Read or write amplification, or a marker when no sane ratio exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Amplification {
    Ratio(f64),
    NotApplicable,
}

impl Serialize for Amplification {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Amplification::Ratio(r) => s.serialize_f64(*r),
            Amplification::NotApplicable => s.serialize_str("N/A"),
        }
    }
}

impl Amplification {
    /// `media_mb / controller_mb`, unless the denominator is (near) zero or
    /// the ratio is outside the sanity limit.
    pub fn from_volumes(media_mb: f64, controller_mb: f64) -> Self {
        if controller_mb.abs() <= f64::EPSILON {
            return Amplification::NotApplicable;
        }
        let ratio = media_mb / controller_mb;
        if !ratio.is_finite() || ratio > AMPLIFICATION_SANITY_LIMIT {
            return Amplification::NotApplicable;
        }
        Amplification::Ratio(ratio)
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Amplification::Ratio(r) => Some(*r),
            Amplification::NotApplicable => None,
        }
    }
}

impl fmt::Display for Amplification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amplification::Ratio(r) => write!(f, "{r:.2}"),
            Amplification::NotApplicable => f.write_str("N/A"),
        }
    }
}

/// Low-half deltas for every counter of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDelta {
    pub id: String,
    pub deltas: [u64; COUNTERS_PER_MODULE],
}

impl ModuleDelta {
    pub fn get(&self, counter: Counter) -> u64 {
        self.deltas[counter.index()]
    }
}

/// Derived figures for one module, in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleMetrics {
    pub id: String,
    pub controller_read_mb: f64,
    pub controller_write_mb: f64,
    pub media_read_mb: f64,
    pub media_write_mb: f64,
    pub read_amplification: Amplification,
    pub write_amplification: Amplification,
}

/// Session-wide sums. Amplification here is computed from the sums, not
/// averaged over modules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Totals {
    pub controller_read_mb: f64,
    pub controller_write_mb: f64,
    pub media_read_mb: f64,
    pub media_write_mb: f64,
    pub read_amplification: Amplification,
    pub write_amplification: Amplification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub modules: Vec<ModuleMetrics>,
    pub total: Totals,
}

/// Errors that make a snapshot pair impossible to difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    ModuleCountMismatch {
        start: usize,
        end: usize,
    },
    ModuleIdMismatch {
        index: usize,
        start: String,
        end: String,
    },
    /// The high half of a counter changed, so the counter was reset or the
    /// device replaced during the measurement.
    CounterGenerationMismatch {
        module: String,
        counter: Counter,
        start: u64,
        end: u64,
    },
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffError::ModuleCountMismatch { start, end } => write!(
                f,
                "start snapshot has {start} modules but end snapshot has {end}"
            ),
            DiffError::ModuleIdMismatch { index, start, end } => write!(
                f,
                "module {index} is {start} in the start snapshot but {end} in the end snapshot"
            ),
            DiffError::CounterGenerationMismatch {
                module,
                counter,
                start,
                end,
            } => write!(
                f,
                "counter generation changed for {module} {counter}: {start:#x} -> {end:#x}"
            ),
        }
    }
}

impl std::error::Error for DiffError {}

fn check_structure(start: &Snapshot, end: &Snapshot) -> Result<(), DiffError> {
    if start.len() != end.len() {
        return Err(DiffError::ModuleCountMismatch {
            start: start.len(),
            end: end.len(),
        });
    }
    for (index, (s, e)) in start.modules().iter().zip(end.modules()).enumerate() {
        if s.id != e.id {
            return Err(DiffError::ModuleIdMismatch {
                index,
                start: s.id.clone(),
                end: e.id.clone(),
            });
        }
    }
    Ok(())
}

fn module_delta(start: &CounterRecord, end: &CounterRecord) -> Result<ModuleDelta, DiffError> {
    let mut deltas = [0u64; COUNTERS_PER_MODULE];
    for counter in Counter::ALL {
        let s = start.get(counter);
        let e = end.get(counter);
        if s.high != e.high {
            return Err(DiffError::CounterGenerationMismatch {
                module: start.id.clone(),
                counter,
                start: s.high,
                end: e.high,
            });
        }
        // A wrap inside one generation is not detectable; wrapping_sub keeps
        // the arithmetic defined.
        deltas[counter.index()] = e.low.wrapping_sub(s.low);
    }
    Ok(ModuleDelta {
        id: start.id.clone(),
        deltas,
    })
}

/// Validate a snapshot pair and compute the low-half delta of every counter.
pub fn counter_deltas(start: &Snapshot, end: &Snapshot) -> Result<Vec<ModuleDelta>, DiffError> {
    check_structure(start, end)?;
    start
        .modules()
        .iter()
        .zip(end.modules())
        .map(|(s, e)| module_delta(s, e))
        .collect()
}

fn to_mb(units: u64) -> f64 {
    units as f64 / UNITS_PER_MB
}

fn module_metrics(delta: &ModuleDelta) -> ModuleMetrics {
    let controller_read_mb = to_mb(delta.get(Counter::TotalReadRequests));
    let controller_write_mb = to_mb(delta.get(Counter::TotalWriteRequests));
    let media_write_mb = to_mb(delta.get(Counter::TotalMediaWrites));
    // Negative when the module's counts are inconsistent; summed as-is.
    let media_read_mb = to_mb(delta.get(Counter::TotalMediaReads)) - media_write_mb;
    if media_read_mb < 0.0 {
        tracing::warn!(
            module = %delta.id,
            media_read_mb,
            media_write_mb,
            "media read delta smaller than media write delta"
        );
    }

    let read_amplification = Amplification::from_volumes(media_read_mb, controller_read_mb);
    let write_amplification = Amplification::from_volumes(media_write_mb, controller_write_mb);
    if read_amplification == Amplification::NotApplicable
        || write_amplification == Amplification::NotApplicable
    {
        tracing::debug!(
            module = %delta.id,
            media_read_mb,
            controller_read_mb,
            media_write_mb,
            controller_write_mb,
            "amplification not applicable"
        );
    }

    ModuleMetrics {
        id: delta.id.clone(),
        controller_read_mb,
        controller_write_mb,
        media_read_mb,
        media_write_mb,
        read_amplification,
        write_amplification,
    }
}

fn totals(modules: &[ModuleMetrics]) -> Totals {
    let controller_read_mb: f64 = modules.iter().map(|m| m.controller_read_mb).sum();
    let controller_write_mb: f64 = modules.iter().map(|m| m.controller_write_mb).sum();
    let media_read_mb: f64 = modules.iter().map(|m| m.media_read_mb).sum();
    let media_write_mb: f64 = modules.iter().map(|m| m.media_write_mb).sum();
    Totals {
        controller_read_mb,
        controller_write_mb,
        media_read_mb,
        media_write_mb,
        read_amplification: Amplification::from_volumes(media_read_mb, controller_read_mb),
        write_amplification: Amplification::from_volumes(media_write_mb, controller_write_mb),
    }
}

/// Compute [`DerivedMetrics`] from a start and end snapshot.
///
/// Pure: the same pair always yields the same result.
pub fn diff(start: &Snapshot, end: &Snapshot) -> Result<DerivedMetrics, DiffError> {
    let modules: Vec<ModuleMetrics> = counter_deltas(start, end)?
        .iter()
        .map(module_metrics)
        .collect();
    let total = totals(&modules);
    Ok(DerivedMetrics { modules, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterValue;

    /// Build a record from (high, low) pairs indexed by counter.
    fn record(id: &str, high: u64, lows: [u64; COUNTERS_PER_MODULE]) -> CounterRecord {
        let mut r = CounterRecord::new(id);
        for counter in Counter::ALL {
            r.set(counter, CounterValue::new(high, lows[counter.index()]));
        }
        r
    }

    /// Lows for the four counters the metrics use:
    /// (media reads, media writes, read requests, write requests).
    fn totals_lows(media_rd: u64, media_wr: u64, rd_req: u64, wr_req: u64) -> [u64; 8] {
        [0, 0, 0, 0, media_rd, media_wr, rd_req, wr_req]
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_delta_is_end_low_minus_start_low() {
        let start = Snapshot::new(vec![
            record("0x0001", 3, [1, 2, 3, 4, 5, 6, 7, 8]),
            record("0x0101", 3, [10, 20, 30, 40, 50, 60, 70, 80]),
        ]);
        let end = Snapshot::new(vec![
            record("0x0001", 3, [11, 22, 33, 44, 55, 66, 77, 88]),
            record("0x0101", 3, [10, 25, 30, 45, 50, 65, 70, 90]),
        ]);
        let deltas = counter_deltas(&start, &end).unwrap();
        assert_eq!(deltas[0].deltas, [10, 20, 30, 40, 50, 60, 70, 80]);
        assert_eq!(deltas[1].deltas, [0, 5, 0, 5, 0, 5, 0, 10]);
        assert_eq!(deltas[1].id, "0x0101");
    }

    #[test]
    fn test_megabyte_conversion_uses_fixed_divisor() {
        let start = Snapshot::new(vec![record("0x0001", 0, totals_lows(0, 0, 0, 0))]);
        let end = Snapshot::new(vec![record(
            "0x0001",
            0,
            totals_lows(0, 0, 16384 * 3, 8192),
        )]);
        let m = &diff(&start, &end).unwrap().modules[0];
        assert!(close(m.controller_read_mb, 3.0));
        assert!(close(m.controller_write_mb, 0.5));
    }

    #[test]
    fn test_generation_mismatch_is_fatal() {
        let start = Snapshot::new(vec![record("0x0001", 1, [0; 8])]);
        let mut changed = record("0x0001", 1, [5; 8]);
        changed.set(Counter::WriteRequests, CounterValue::new(2, 5));
        let end = Snapshot::new(vec![changed]);

        let err = diff(&start, &end).unwrap_err();
        assert_eq!(
            err,
            DiffError::CounterGenerationMismatch {
                module: "0x0001".to_string(),
                counter: Counter::WriteRequests,
                start: 1,
                end: 2,
            }
        );
        assert!(err.to_string().contains("WriteRequests"));
    }

    #[test]
    fn test_module_count_mismatch() {
        let start = Snapshot::new(vec![record("0x0001", 0, [0; 8])]);
        let end = Snapshot::new(vec![]);
        assert_eq!(
            diff(&start, &end).unwrap_err(),
            DiffError::ModuleCountMismatch { start: 1, end: 0 }
        );
    }

    #[test]
    fn test_module_order_mismatch() {
        let start = Snapshot::new(vec![
            record("0x0001", 0, [0; 8]),
            record("0x0011", 0, [0; 8]),
        ]);
        let end = Snapshot::new(vec![
            record("0x0011", 0, [0; 8]),
            record("0x0001", 0, [0; 8]),
        ]);
        assert!(matches!(
            diff(&start, &end),
            Err(DiffError::ModuleIdMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_media_read_subtracts_media_writes() {
        let start = Snapshot::new(vec![record("0x0001", 0, totals_lows(0, 0, 0, 0))]);
        let end = Snapshot::new(vec![record(
            "0x0001",
            0,
            totals_lows(32768, 16384, 16384, 16384),
        )]);
        let m = &diff(&start, &end).unwrap().modules[0];
        assert!(close(m.media_read_mb, 1.0));
        assert!(close(m.media_write_mb, 1.0));
        assert_eq!(m.read_amplification, Amplification::Ratio(1.0));
        assert_eq!(m.write_amplification, Amplification::Ratio(1.0));
    }

    #[test]
    fn test_negative_adjusted_media_read_is_kept_in_totals() {
        // Module A: raw media read 0, media write 1 MB -> adjusted -1 MB.
        // Module B: raw media read 3 MB, media write 0 -> adjusted 3 MB.
        let mb = 16384;
        let start = Snapshot::new(vec![
            record("0x0001", 0, [0; 8]),
            record("0x0002", 0, [0; 8]),
        ]);
        let end = Snapshot::new(vec![
            record("0x0001", 0, totals_lows(0, mb, mb, mb)),
            record("0x0002", 0, totals_lows(3 * mb, 0, mb, 0)),
        ]);
        let metrics = diff(&start, &end).unwrap();
        assert!(close(metrics.modules[0].media_read_mb, -1.0));
        assert!(close(metrics.modules[1].media_read_mb, 3.0));
        assert_eq!(
            metrics.modules[0].read_amplification,
            Amplification::Ratio(-1.0)
        );

        let sum: f64 = metrics.modules.iter().map(|m| m.media_read_mb).sum();
        assert!(close(metrics.total.media_read_mb, sum));
        assert!(close(metrics.total.media_read_mb, 2.0));
        assert_eq!(metrics.total.read_amplification, Amplification::Ratio(1.0));
    }

    #[test]
    fn test_amplification_not_applicable_on_zero_denominator() {
        let start = Snapshot::new(vec![record("0x0001", 0, [0; 8])]);
        let end = Snapshot::new(vec![record("0x0001", 0, totals_lows(16384, 0, 0, 0))]);
        let metrics = diff(&start, &end).unwrap();
        assert_eq!(
            metrics.modules[0].read_amplification,
            Amplification::NotApplicable
        );
        assert_eq!(
            metrics.modules[0].write_amplification,
            Amplification::NotApplicable
        );
        assert_eq!(metrics.total.read_amplification, Amplification::NotApplicable);
    }

    #[test]
    fn test_amplification_sanity_limit() {
        assert_eq!(Amplification::from_volumes(5.0, 1.0), Amplification::Ratio(5.0));
        assert_eq!(
            Amplification::from_volumes(5.01, 1.0),
            Amplification::NotApplicable
        );
        assert_eq!(Amplification::from_volumes(0.0, 0.0), Amplification::NotApplicable);
        assert_eq!(Amplification::from_volumes(0.0, 2.0), Amplification::Ratio(0.0));
        assert_eq!(Amplification::NotApplicable.to_string(), "N/A");
        assert_eq!(Amplification::Ratio(1.234).to_string(), "1.23");
    }

    #[test]
    fn test_aggregate_amplification_is_ratio_of_sums() {
        // Module A: media 4 MB / controller 1 MB = 4.0
        // Module B: media 1 MB / controller 4 MB = 0.25
        // Ratio of sums: 5 / 5 = 1.0, the per-module average would be 2.125.
        let mb = 16384;
        let start = Snapshot::new(vec![
            record("0x0001", 0, [0; 8]),
            record("0x0002", 0, [0; 8]),
        ]);
        let end = Snapshot::new(vec![
            record("0x0001", 0, totals_lows(0, 4 * mb, 0, mb)),
            record("0x0002", 0, totals_lows(0, mb, 0, 4 * mb)),
        ]);
        let metrics = diff(&start, &end).unwrap();
        assert_eq!(metrics.modules[0].write_amplification, Amplification::Ratio(4.0));
        assert_eq!(metrics.modules[1].write_amplification, Amplification::Ratio(0.25));
        assert!(close(metrics.total.media_write_mb, 5.0));
        assert!(close(metrics.total.controller_write_mb, 5.0));
        assert_eq!(metrics.total.write_amplification, Amplification::Ratio(1.0));
    }

    #[test]
    fn test_diff_is_idempotent() {
        let start = Snapshot::new(vec![record("0x0001", 9, [1; 8])]);
        let end = Snapshot::new(vec![record("0x0001", 9, [40000; 8])]);
        assert_eq!(diff(&start, &end).unwrap(), diff(&start, &end).unwrap());
    }

    #[test]
    fn test_serializes_not_applicable_as_string() {
        let json = serde_json::to_value(Amplification::NotApplicable).unwrap();
        assert_eq!(json, serde_json::json!("N/A"));
        let json = serde_json::to_value(Amplification::Ratio(2.0)).unwrap();
        assert_eq!(json, serde_json::json!(2.0));
    }
}
