use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use ember_process::Os;
use tokio::sync::Mutex;

use crate::{
    config::Encoding,
    fanout::{ObserverList, OutputReader},
    observer::{Capture, Observer},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_SCRIPT: &str = "grep NUMA=y /boot/config-$(uname -r)";

/// OS-level check for NUMA support.
#[async_trait::async_trait]
pub trait NumaProbe: Send + Sync {
    async fn probe(&self, os: Os) -> bool;
}

/// Greps the running kernel's build config for `NUMA=y` (Linux only).
#[derive(Debug, Default)]
pub struct KernelConfigProbe;

#[async_trait::async_trait]
impl NumaProbe for KernelConfigProbe {
    async fn probe(&self, os: Os) -> bool {
        if os != Os::Linux {
            return false;
        }

        let mut child = match tokio::process::Command::new("sh")
            .args(["-c", PROBE_SCRIPT])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "numa probe could not be started");
                return false;
            }
        };

        let Some(stdout) = child.stdout.take() else {
            return false;
        };
        let capture = Arc::new(Capture::default());
        let reader = OutputReader::spawn(
            "numa-probe",
            stdout,
            Arc::new(ObserverList::new([capture.clone() as Arc<dyn Observer>])),
            Encoding::Utf8,
            256,
        );

        let exited = tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await;
        match exited {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "numa probe failed");
                return false;
            }
            Err(_) => {
                tracing::warn!("numa probe timed out after {}ms", PROBE_TIMEOUT.as_millis());
                let _ = child.start_kill();
                reader.join(Duration::from_millis(100)).await;
                return false;
            }
        }

        reader.join(PROBE_TIMEOUT).await;
        !capture.contents().trim().is_empty()
    }
}

/// Fixed verdict; for hosts where probing is undesirable.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait::async_trait]
impl NumaProbe for StaticProbe {
    async fn probe(&self, _os: Os) -> bool {
        self.0
    }
}

/// Memoises the probe verdict per OS family.
pub struct NumaDetector {
    probe: Arc<dyn NumaProbe>,
    cache: Mutex<HashMap<Os, bool>>,
}

impl Default for NumaDetector {
    fn default() -> Self {
        Self::new(Arc::new(KernelConfigProbe))
    }
}

impl NumaDetector {
    pub fn new(probe: Arc<dyn NumaProbe>) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_numa(&self, os: Os) -> bool {
        let mut cache = self.cache.lock().await;
        if let Some(v) = cache.get(&os) {
            return *v;
        }

        let numa = self.probe.probe(os).await;
        if numa {
            tracing::warn!(?os, "NUMA support detected; interleaving is experimental");
        }
        cache.insert(os, numa);
        numa
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        calls: AtomicUsize,
        verdict: bool,
    }

    #[async_trait::async_trait]
    impl NumaProbe for Counting {
        async fn probe(&self, _os: Os) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.verdict
        }
    }

    #[tokio::test]
    async fn probe_runs_once_per_os() {
        let probe = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: true,
        });
        let detector = Arc::new(NumaDetector::new(probe.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let d = detector.clone();
            tasks.push(tokio::spawn(async move { d.is_numa(Os::Linux).await }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        detector.is_numa(Os::Windows).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn kernel_probe_skips_non_linux() {
        assert!(!KernelConfigProbe.probe(Os::MacOs).await);
        assert!(!KernelConfigProbe.probe(Os::Windows).await);
    }

    #[tokio::test]
    async fn static_probe_reports_fixed_value() {
        let detector = NumaDetector::new(Arc::new(StaticProbe(false)));
        assert!(!detector.is_numa(Os::Linux).await);
    }
}
