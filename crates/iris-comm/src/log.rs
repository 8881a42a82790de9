//! ---
//! iris_section: "03-persistence-logging"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Per-protocol wire log sinks injected at link construction."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::fmt::Arguments;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::controller::ControllerInfo;

/// Severity of a protocol log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Raw frames.
    Trace,
    /// Exchange details.
    Debug,
    /// Notable link events.
    Info,
    /// Faults.
    Warn,
}

/// Protocol log sink shared by every comm task of one protocol.
pub trait CommLog: Send + Sync {
    /// Whether lines would be recorded; lets callers skip hex formatting.
    fn enabled(&self) -> bool;

    /// Record one line.
    fn log(&self, level: LogLevel, args: Arguments<'_>);

    /// Record a frame sent to or received from a controller.
    fn frame(&self, direction: &str, ctl: &ControllerInfo, bytes: &[u8]) {
        if self.enabled() {
            self.log(
                LogLevel::Trace,
                format_args!("{}:{} {} {}", ctl.name, ctl.drop, direction, hex::encode(bytes)),
            );
        }
    }
}

/// Shared protocol log handle.
pub type SharedCommLog = Arc<dyn CommLog>;

/// Sink forwarding to `tracing` under the `iris::protocol` target.
#[derive(Debug)]
pub struct TracingCommLog {
    protocol: String,
    enabled: AtomicBool,
}

impl TracingCommLog {
    /// Create an enabled sink for a protocol.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Toggle logging at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Protocol name.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl CommLog for TracingCommLog {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn log(&self, level: LogLevel, args: Arguments<'_>) {
        if !self.enabled() {
            return;
        }
        let protocol = self.protocol.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(target: "iris::protocol", protocol, "{}", args),
            LogLevel::Debug => tracing::debug!(target: "iris::protocol", protocol, "{}", args),
            LogLevel::Info => tracing::info!(target: "iris::protocol", protocol, "{}", args),
            LogLevel::Warn => tracing::warn!(target: "iris::protocol", protocol, "{}", args),
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommLog;

impl CommLog for NoopCommLog {
    fn enabled(&self) -> bool {
        false
    }

    fn log(&self, _level: LogLevel, _args: Arguments<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl CommLog for Capture {
        fn enabled(&self) -> bool {
            true
        }

        fn log(&self, _level: LogLevel, args: Arguments<'_>) {
            self.0.lock().push(args.to_string());
        }
    }

    #[test]
    fn frames_are_hex_encoded() {
        let capture = Capture::default();
        let ctl = ControllerInfo::new("relay-7", "line-1", 7);
        capture.frame("SEND", &ctl, b"ID?\r\n");
        assert_eq!(capture.0.lock()[0], "relay-7:7 SEND 49443f0d0a");
    }

    #[test]
    fn toggling_disables_tracing_sink() {
        let log = TracingCommLog::new("relay");
        assert!(log.enabled());
        log.set_enabled(false);
        assert!(!log.enabled());
        assert!(!NoopCommLog.enabled());
    }
}
