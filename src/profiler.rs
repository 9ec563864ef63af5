/// Relay to a `perf record` parent process.
///
/// When the probe runs under `perf record --switch-output=signal`, the parent
/// can be told to rotate its output (SIGUSR2) right before the measured region
/// and to stop (SIGINT) after it. The relay is an explicit value handed to
/// whoever needs it; there is no process-wide state.
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};

/// Bytes of the parent's cmdline that are inspected.
const CMDLINE_LIMIT: usize = 1020;

/// Shortest cmdline that can hold `perf record`.
const MIN_CMDLINE: usize = 11;

/// Whether a NUL-separated `/proc/<pid>/cmdline` is a `perf record` invocation.
pub fn is_perf_record(cmdline: &[u8]) -> bool {
    let cmdline = &cmdline[..cmdline.len().min(CMDLINE_LIMIT)];
    if cmdline.len() < MIN_CMDLINE {
        return false;
    }
    let joined: Vec<u8> = cmdline
        .iter()
        .map(|&b| if b == 0 { b' ' } else { b })
        .collect();
    String::from_utf8_lossy(&joined).contains("perf record")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfRelay {
    perf_pid: Option<Pid>,
}

impl PerfRelay {
    /// Inspect the parent process and attach to it if it is `perf record`.
    pub fn detect() -> Self {
        let ppid = getppid();
        let path = format!("/proc/{}/cmdline", ppid);
        match std::fs::read(&path) {
            Ok(cmdline) if is_perf_record(&cmdline) => {
                tracing::info!(pid = ppid.as_raw(), "running under perf record, relaying signals");
                Self::attach(ppid)
            }
            Ok(_) => Self::disabled(),
            Err(e) => {
                tracing::debug!(error = %e, path = %path, "could not inspect parent process");
                Self::disabled()
            }
        }
    }

    /// A relay that never signals anything.
    pub fn disabled() -> Self {
        Self { perf_pid: None }
    }

    pub fn attach(pid: Pid) -> Self {
        Self {
            perf_pid: Some(pid),
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.perf_pid
    }

    pub fn is_active(&self) -> bool {
        self.perf_pid.is_some()
    }

    /// Ask perf to switch output files.
    pub fn switch(&self) -> nix::Result<()> {
        self.signal(Signal::SIGUSR2)
    }

    /// Ask perf to stop recording.
    pub fn stop(&self) -> nix::Result<()> {
        self.signal(Signal::SIGINT)
    }

    fn signal(&self, signal: Signal) -> nix::Result<()> {
        match self.perf_pid {
            Some(pid) => {
                tracing::debug!(pid = pid.as_raw(), ?signal, "signalling perf");
                kill(pid, signal)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_perf_record_cmdline() {
        assert!(is_perf_record(b"perf\0record\0-g\0--\0./pmem-probe\0"));
        assert!(is_perf_record(b"/usr/bin/perf\0record\0--switch-output=signal\0"));
    }

    #[test]
    fn test_rejects_other_parents() {
        assert!(!is_perf_record(b"/bin/bash\0-l\0"));
        assert!(!is_perf_record(b"perf\0stat\0-e\0cycles\0"));
        assert!(!is_perf_record(b"perf rec"));
        assert!(!is_perf_record(b""));
    }

    #[test]
    fn test_only_inspects_prefix() {
        let mut cmdline = vec![b'x'; CMDLINE_LIMIT];
        cmdline.extend_from_slice(b"\0perf\0record\0");
        assert!(!is_perf_record(&cmdline));
    }

    #[test]
    fn test_disabled_relay_is_a_no_op() {
        let relay = PerfRelay::disabled();
        assert!(!relay.is_active());
        assert_eq!(relay.pid(), None);
        relay.switch().unwrap();
        relay.stop().unwrap();
    }

    #[test]
    fn test_attach_records_pid() {
        let relay = PerfRelay::attach(Pid::from_raw(4242));
        assert!(relay.is_active());
        assert_eq!(relay.pid(), Some(Pid::from_raw(4242)));
    }
}
