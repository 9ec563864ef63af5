/// Snapshot acquisition: the seam between the measurement session and
/// whatever produces counter dumps.
use crate::config::CaptureConfig;
use crate::counters::{parse_dump, ParseError, Snapshot};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Command;

/// Something that can capture a fresh [`Snapshot`] on demand.
pub trait SnapshotSource {
    fn capture(&mut self) -> Result<Snapshot, CaptureError>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for Box<S> {
    fn capture(&mut self) -> Result<Snapshot, CaptureError> {
        (**self).capture()
    }
}

/// Errors that can occur while capturing a snapshot.
#[derive(Debug)]
pub enum CaptureError {
    /// Failed to spawn the dump tool.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The dump tool exited unsuccessfully.
    ToolFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// Failed to read a saved dump.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The dump was read but could not be parsed.
    Parse(ParseError),
    /// A replay source ran out of snapshots.
    Exhausted,
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Spawn { command, source } => {
                write!(f, "failed to spawn {}: {}", command, source)
            }
            CaptureError::ToolFailed {
                command,
                exit_code,
                stderr,
            } => {
                write!(f, "{} exited with {:?}: {}", command, exit_code, stderr.trim())
            }
            CaptureError::Io { path, source } => {
                write!(f, "failed to read dump {}: {}", path.display(), source)
            }
            CaptureError::Parse(e) => write!(f, "malformed counter dump: {}", e),
            CaptureError::Exhausted => write!(f, "no snapshots left to replay"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Spawn { source, .. } => Some(source),
            CaptureError::Io { source, .. } => Some(source),
            CaptureError::Parse(e) => Some(e),
            CaptureError::ToolFailed { .. } | CaptureError::Exhausted => None,
        }
    }
}

impl From<ParseError> for CaptureError {
    fn from(e: ParseError) -> Self {
        CaptureError::Parse(e)
    }
}

/// Runs the counter dump tool and parses its stdout.
#[derive(Debug, Clone)]
pub struct IpmctlSource {
    command: String,
    args: Vec<String>,
}

impl IpmctlSource {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

impl SnapshotSource for IpmctlSource {
    fn capture(&mut self) -> Result<Snapshot, CaptureError> {
        tracing::info!(command = %self.command, args = ?self.args, "capturing counter snapshot");
        let output = Command::new(&self.command)
            .args(&self.args)
            .output()
            .map_err(|e| CaptureError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(CaptureError::ToolFailed {
                command: self.command.clone(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_dump(&text)?)
    }
}

/// Re-reads a saved dump file on every capture.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for FileSource {
    fn capture(&mut self) -> Result<Snapshot, CaptureError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| CaptureError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(parse_dump(&text)?)
    }
}

/// Hands out pre-built snapshots in order. Used for replaying saved dumps.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    queue: VecDeque<Snapshot>,
}

impl StaticSource {
    pub fn new(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        Self {
            queue: snapshots.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl SnapshotSource for StaticSource {
    fn capture(&mut self) -> Result<Snapshot, CaptureError> {
        self.queue.pop_front().ok_or(CaptureError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counter;
    use tempfile::tempdir;

    const DUMP: &str = "\
---DimmID=0x0001---
   MediaReads=0x00000000000000000000000000000400
";

    #[test]
    fn test_tool_output_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pmm_stat.txt");
        std::fs::write(&path, DUMP).unwrap();

        let mut source = IpmctlSource::new("cat", vec![path.display().to_string()]);
        let snapshot = source.capture().unwrap();
        assert_eq!(snapshot.modules()[0].id, "0x0001");
        assert_eq!(snapshot.modules()[0].get(Counter::MediaReads).low, 0x400);
    }

    #[test]
    fn test_tool_failure_is_reported() {
        let mut source = IpmctlSource::new(
            "sh",
            vec!["-c".to_string(), "echo no dimms >&2; exit 3".to_string()],
        );
        match source.capture().unwrap_err() {
            CaptureError::ToolFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("no dimms"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let mut source = IpmctlSource::new("nonexistent-binary-xyz", vec![]);
        let err = source.capture().unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn test_file_source_parse_error_propagates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "DimmID=0x0001\nMediaReads=0xZZZZ\n").unwrap();

        let err = FileSource::new(path.clone()).capture().unwrap_err();
        assert!(matches!(err, CaptureError::Parse(ParseError::InvalidValue { .. })));
    }

    #[test]
    fn test_file_source_missing_file() {
        let dir = tempdir().unwrap();
        let err = FileSource::new(dir.path().join("gone.txt"))
            .capture()
            .unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }

    #[test]
    fn test_static_source_replays_in_order() {
        let first = parse_dump(DUMP).unwrap();
        let mut source = StaticSource::new([first.clone(), Snapshot::default()]);
        assert_eq!(source.capture().unwrap(), first);
        assert_eq!(source.capture().unwrap(), Snapshot::default());
        assert_eq!(source.remaining(), 0);
        assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_boxed_source_delegates() {
        let mut source: Box<dyn SnapshotSource> = Box::new(StaticSource::new([Snapshot::default()]));
        assert!(source.capture().unwrap().is_empty());
    }
}
