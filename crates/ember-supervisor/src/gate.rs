use std::time::Duration;

use ember_process::Version;
use tokio::sync::watch;

use crate::observer::Observer;

/// Substring the server prints once it accepts connections.
pub const READY_SENTINEL: &str = "waiting for connections";

/// Readiness message in the structured JSON log format servers write from 4.4 on.
pub const STRUCTURED_READY_SENTINEL: &str = r#""msg":"Waiting for connections""#;

const LEGACY_SENTINELS: &[&str] = &[READY_SENTINEL];
const ALL_SENTINELS: &[&str] = &[READY_SENTINEL, STRUCTURED_READY_SENTINEL];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StartupOutcome {
    Started,
    TimedOut,
    /// Streams closed or the process exited before the sentinel appeared.
    IoFailure,
}

/// One-shot readiness signal fed by the output readers of both streams.
pub struct StartupGate {
    tx: watch::Sender<bool>,
    sentinels: &'static [&'static str],
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupGate {
    /// A gate that accepts every known readiness line.
    pub fn new() -> Self {
        Self::with_sentinels(ALL_SENTINELS)
    }

    /// A gate that accepts the readiness lines the given server release prints.
    pub fn for_version(version: &Version) -> Self {
        if *version >= Version::new(4, 4, 0) {
            Self::with_sentinels(ALL_SENTINELS)
        } else {
            Self::with_sentinels(LEGACY_SENTINELS)
        }
    }

    fn with_sentinels(sentinels: &'static [&'static str]) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, sentinels }
    }

    fn is_ready_line(&self, line: &str) -> bool {
        self.sentinels.iter().any(|s| line.contains(s))
    }

    pub fn is_started(&self) -> bool {
        *self.tx.borrow()
    }

    /// Marks the gate satisfied. Returns true only for the call that flipped it.
    pub fn satisfy(&self) -> bool {
        self.tx.send_if_modified(|started| {
            if *started {
                false
            } else {
                *started = true;
                true
            }
        })
    }

    /// Waits up to `timeout` for readiness.
    pub async fn await_started(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|started| *started)).await,
            Ok(Ok(_))
        )
    }
}

impl Observer for StartupGate {
    fn on_line(&self, line: &str) {
        if !self.is_started() && self.is_ready_line(line) && self.satisfy() {
            tracing::debug!("startup sentinel seen");
        }
    }

    fn name(&self) -> &str {
        "startup-gate"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn sentinel_line_satisfies_gate() {
        let gate = Arc::new(StartupGate::new());
        let feeder = gate.clone();
        tokio::spawn(async move {
            feeder.on_line("[initandlisten] MongoDB starting");
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.on_line("[initandlisten] waiting for connections on port 27017");
        });
        assert!(gate.await_started(Duration::from_secs(5)).await);
        assert!(gate.is_started());
    }

    #[tokio::test]
    async fn non_matching_lines_never_satisfy() {
        let gate = StartupGate::new();
        for line in [
            "starting",
            "waiting for",
            "connections",
            "WAITING FOR CONNECTIONS",
            r#"{"msg":"Waiting for replication"}"#,
        ] {
            gate.on_line(line);
        }
        assert!(!gate.await_started(Duration::from_millis(50)).await);
        assert!(!gate.is_started());
    }

    const STRUCTURED_READY_LINE: &str = r#"{"t":{"$date":"2020-07-30T10:01:02.345+00:00"},"s":"I",  "c":"NETWORK",  "id":23016,   "ctx":"listener","msg":"Waiting for connections","attr":{"port":27017,"ssl":"off"}}"#;

    #[tokio::test]
    async fn structured_log_line_satisfies_a_4_4_gate() {
        let gate = StartupGate::for_version(&Version::new(4, 4, 0));
        gate.on_line(r#"{"t":{"$date":"2020-07-30T10:01:02.000+00:00"},"s":"I","c":"CONTROL","id":20698,"ctx":"main","msg":"***** SERVER RESTARTED *****"}"#);
        assert!(!gate.is_started());
        gate.on_line(STRUCTURED_READY_LINE);
        assert!(gate.await_started(Duration::from_millis(50)).await);
    }

    #[test]
    fn legacy_gate_ignores_structured_line_but_keeps_plain_sentinel() {
        let gate = StartupGate::for_version(&Version::new(4, 2, 8));
        gate.on_line(STRUCTURED_READY_LINE);
        assert!(!gate.is_started());
        gate.on_line("[initandlisten] waiting for connections on port 27017");
        assert!(gate.is_started());

        let gate = StartupGate::for_version(&Version::new(6, 0, 0));
        gate.on_line("[initandlisten] waiting for connections on port 27017");
        assert!(gate.is_started());
    }

    #[test]
    fn only_first_sentinel_flips_the_gate() {
        let gate = StartupGate::new();
        assert!(gate.satisfy());
        assert!(!gate.satisfy());
        gate.on_line("waiting for connections");
        assert!(gate.is_started());
    }

    #[tokio::test]
    async fn already_satisfied_gate_returns_immediately() {
        let gate = StartupGate::new();
        gate.on_line("... waiting for connections ...");
        assert!(gate.await_started(Duration::from_millis(1)).await);
    }
}
