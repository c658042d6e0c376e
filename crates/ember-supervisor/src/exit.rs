use std::time::Duration;

use tokio::{
    process::Child,
    sync::{mpsc, watch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExitInfo {
    /// `None` when the process was ended by a signal or the wait itself failed.
    pub code: Option<i32>,
}

/// Owns the child process and publishes its termination.
///
/// The task reaps the child when it exits on its own, or group-kills it when asked to
/// (or when the watcher is dropped).
pub(crate) struct ExitWatcher {
    rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

impl ExitWatcher {
    pub(crate) fn spawn(mut child: Child) -> Self {
        let pid = child.id();
        let (tx, rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let exited = tokio::select! {
                res = child.wait() => Some(res),
                _ = kill_rx.recv() => None,
            };
            let res = match exited {
                Some(res) => res,
                None => {
                    force_kill(&mut child, pid);
                    child.wait().await
                }
            };

            let info = match res {
                Ok(status) => ExitInfo {
                    code: status.code(),
                },
                Err(e) => {
                    tracing::warn!(pid, error = %e, "wait for mongod failed");
                    ExitInfo { code: None }
                }
            };
            tracing::info!(pid, code = ?info.code, "mongod exited");
            let _ = tx.send(Some(info));
        });

        Self { rx, kill_tx }
    }

    pub(crate) fn exit_info(&self) -> Option<ExitInfo> {
        *self.rx.borrow()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Waits for termination, giving up after `timeout`.
    pub(crate) async fn wait(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait_forever())
            .await
            .ok()
            .flatten()
    }

    pub(crate) async fn wait_forever(&self) -> Option<ExitInfo> {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(Option::is_some).await;
        *rx.borrow()
    }

    /// Asks the watcher task to kill the process group. Non-blocking.
    pub(crate) fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child leads its own session, so its pid is the group id.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill after group kill");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;

    use super::*;

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn reports_natural_exit_code() {
        let watcher = ExitWatcher::spawn(sh("exit 3"));
        let info = watcher.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.code, Some(3));
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn kill_terminates_a_stuck_process() {
        let watcher = ExitWatcher::spawn(sh("sleep 30"));
        assert!(watcher.wait(Duration::from_millis(50)).await.is_none());
        assert!(watcher.is_running());

        watcher.kill();
        let info = watcher.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.code, None);
    }
}
