//! Counter dump parsing.
//!
//! The dump tool prints one block per DIMM, introduced by a `DimmID=` key and
//! followed by `Key=0x<32 hex digits>` lines:
//!
//! ```text
//! ---DimmID=0x0001---
//!    MediaReads=0x000000000000000000000000000d5f45
//!    MediaWrites=0x0000000000000000000000000002aa01
//! ```
//!
//! Every value is a 128-bit counter. The high 64 bits act as a generation
//! guard, the low 64 bits hold the count.
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// Number of counters reported per module.
pub const COUNTERS_PER_MODULE: usize = 8;

/// Captures whatever follows `DimmID=` up to whitespace or the `---` fence.
static MODULE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DimmID=([^\s-]*)").unwrap());

static MODULE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0[xX][0-9A-Fa-f]+$").unwrap());

static VALUE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z]+)=(\S*)$").unwrap());

/// The eight per-module counters, in their fixed positional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Counter {
    MediaReads,
    MediaWrites,
    ReadRequests,
    WriteRequests,
    TotalMediaReads,
    TotalMediaWrites,
    TotalReadRequests,
    TotalWriteRequests,
}

impl Counter {
    pub const ALL: [Counter; COUNTERS_PER_MODULE] = [
        Counter::MediaReads,
        Counter::MediaWrites,
        Counter::ReadRequests,
        Counter::WriteRequests,
        Counter::TotalMediaReads,
        Counter::TotalMediaWrites,
        Counter::TotalReadRequests,
        Counter::TotalWriteRequests,
    ];

    /// Position of this counter inside a [`CounterRecord`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Key used for this counter in the dump.
    pub fn key(self) -> &'static str {
        match self {
            Counter::MediaReads => "MediaReads",
            Counter::MediaWrites => "MediaWrites",
            Counter::ReadRequests => "ReadRequests",
            Counter::WriteRequests => "WriteRequests",
            Counter::TotalMediaReads => "TotalMediaReads",
            Counter::TotalMediaWrites => "TotalMediaWrites",
            Counter::TotalReadRequests => "TotalReadRequests",
            Counter::TotalWriteRequests => "TotalWriteRequests",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Counter::ALL.into_iter().find(|c| c.key() == key)
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A 128-bit counter value split into its two 64-bit halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterValue {
    /// Generation guard; must not change across a measurement.
    pub high: u64,
    /// The count itself.
    pub low: u64,
}

impl CounterValue {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Decode `0x` followed by exactly 32 hex digits.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))?;
        if digits.len() != 32 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let high = u64::from_str_radix(&digits[..16], 16).ok()?;
        let low = u64::from_str_radix(&digits[16..], 16).ok()?;
        Some(Self { high, low })
    }
}

/// Counters for a single module (DIMM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterRecord {
    /// Module handle as printed by the dump tool, e.g. `0x0001`.
    pub id: String,
    pub values: [CounterValue; COUNTERS_PER_MODULE],
}

impl CounterRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: [CounterValue::default(); COUNTERS_PER_MODULE],
        }
    }

    pub fn get(&self, counter: Counter) -> CounterValue {
        self.values[counter.index()]
    }

    pub fn set(&mut self, counter: Counter, value: CounterValue) {
        self.values[counter.index()] = value;
    }
}

/// Point-in-time capture of every module's counters, in dump order.
///
/// Immutable once built; the diff engine only ever reads two of these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    modules: Vec<CounterRecord>,
}

impl Snapshot {
    pub fn new(modules: Vec<CounterRecord>) -> Self {
        Self { modules }
    }

    pub fn modules(&self) -> &[CounterRecord] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Errors raised while parsing a counter dump. Any of these invalidates the
/// whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A counter line whose value is not a 128-bit hex number.
    InvalidValue {
        line: usize,
        counter: Counter,
        value: String,
    },
    /// A counter line that appeared before any `DimmID=` line.
    ValueBeforeModule { line: usize, counter: Counter },
    /// A `DimmID=` line whose handle is not hex.
    InvalidModuleId { line: usize, value: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidValue {
                line,
                counter,
                value,
            } => write!(
                f,
                "line {line}: {counter} value {value:?} is not a 128-bit hex counter"
            ),
            ParseError::ValueBeforeModule { line, counter } => {
                write!(f, "line {line}: {counter} appears before any DimmID line")
            }
            ParseError::InvalidModuleId { line, value } => {
                write!(f, "line {line}: invalid DimmID {value:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a raw counter dump into a [`Snapshot`].
///
/// Lines that match neither a module header nor a known counter key are
/// skipped. Parsing stops at the first malformed counter line.
pub fn parse_dump(text: &str) -> Result<Snapshot, ParseError> {
    let mut modules: Vec<CounterRecord> = Vec::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();

        if let Some(caps) = MODULE_LINE.captures(line) {
            let id = &caps[1];
            if !MODULE_ID.is_match(id) {
                return Err(ParseError::InvalidModuleId {
                    line: line_no,
                    value: id.to_string(),
                });
            }
            modules.push(CounterRecord::new(id));
            continue;
        }

        let Some(caps) = VALUE_LINE.captures(line) else {
            continue;
        };
        let Some(counter) = Counter::from_key(&caps[1]) else {
            continue;
        };

        let Some(record) = modules.last_mut() else {
            return Err(ParseError::ValueBeforeModule {
                line: line_no,
                counter,
            });
        };
        let value = CounterValue::from_hex(&caps[2]).ok_or_else(|| ParseError::InvalidValue {
            line: line_no,
            counter,
            value: caps[2].to_string(),
        })?;
        record.set(counter, value);
    }

    tracing::debug!(modules = modules.len(), "parsed counter dump");
    Ok(Snapshot::new(modules))
}
