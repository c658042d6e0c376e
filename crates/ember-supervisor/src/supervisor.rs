use std::{io, process::Stdio, sync::Arc};

use ember_process::{Capability, LaunchId, LaunchState};
use tokio::{io::AsyncRead, process::Command};

use crate::{
    artifact::ArtifactProvider,
    capabilities::capabilities_for,
    command_line::{self, ArgumentVector},
    config::LaunchConfig,
    data_dir::DataDir,
    error::LaunchError,
    exit::ExitWatcher,
    fanout::{ObserverList, OutputReader},
    gate::{StartupGate, StartupOutcome},
    handle::{HandleParts, ProcessHandle},
    numa::NumaDetector,
    transport::{AdminCommandTransport, ShutdownTransport, WireProtocol},
};

type Stream = Box<dyn AsyncRead + Unpin + Send>;

struct Spawned {
    child: tokio::process::Child,
    stdout: Stream,
    stderr: Option<Stream>,
}

/// Launches `mongod` processes and hands back [`ProcessHandle`]s.
///
/// Holds no per-process state; one supervisor can run any number of independent servers.
pub struct Supervisor {
    artifacts: Arc<dyn ArtifactProvider>,
    transport: Arc<dyn ShutdownTransport>,
    numa: Arc<NumaDetector>,
}

impl Supervisor {
    pub fn new(artifacts: Arc<dyn ArtifactProvider>) -> Self {
        Self {
            artifacts,
            transport: Arc::new(AdminCommandTransport::default()),
            numa: Arc::new(NumaDetector::default()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ShutdownTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_numa_detector(mut self, numa: Arc<NumaDetector>) -> Self {
        self.numa = numa;
        self
    }

    /// Spawns the server and waits until it reports readiness.
    ///
    /// On timeout, or when the process dies first, the process is torn down before the
    /// error is returned; the teardown report travels with the error.
    ///
    /// On Linux the child gets a parent-death signal, and the kernel ties it to the thread
    /// that forked the child rather than to the whole supervisor. Calling `launch` from a
    /// short-lived thread (a `block_on` helper thread, a `spawn_blocking` worker the pool
    /// later retires, a current-thread runtime that gets dropped) means mongod receives
    /// SIGTERM when that thread exits. Launch from a task on a long-lived runtime.
    pub async fn launch(&self, config: Arc<LaunchConfig>) -> Result<ProcessHandle, LaunchError> {
        let id = LaunchId::new();
        let version = config.version();
        let platform = config.platform();

        let executable = self
            .artifacts
            .resolve_executable(&version, &platform)
            .await
            .map_err(|source| LaunchError::Artifact {
                version,
                platform,
                source,
            })?;

        let data_dir = DataDir::resolve(config.data_dir(), config.temp_root())?;
        let encoding = config.encoding();
        let capabilities = capabilities_for(&version, &platform);
        let numa = if capabilities.contains(Capability::NumaAware) {
            self.numa.is_numa(platform.os).await
        } else {
            false
        };
        let args = command_line::build(&executable, &config, data_dir.path(), &capabilities, numa);
        let wire = if capabilities.contains(Capability::OpMsgWire) {
            WireProtocol::OpMsg
        } else {
            WireProtocol::LegacyQuery
        };

        tracing::info!(id = %id, %version, port = config.port(), cmd = %args, "spawning mongod");

        let spawned = match spawn_process(&args, config.redirect_error_stream()) {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Err(err) = data_dir.remove().await {
                    tracing::warn!(error = %err, "could not remove data directory after failed spawn");
                }
                return Err(LaunchError::Spawn {
                    program: args.program().to_string(),
                    source: e,
                });
            }
        };
        let pid = spawned.child.id();

        let gate = Arc::new(StartupGate::for_version(&config.version()));
        let buffer_len = config.buffer_len();

        let stdout_list = Arc::new(ObserverList::new(config.stdout_observers().iter().cloned()));
        stdout_list.register(gate.clone());
        let stdout = OutputReader::spawn("stdout", spawned.stdout, stdout_list.clone(), encoding, buffer_len);

        let stderr = spawned.stderr.map(|stream| {
            let list = if config.redirect_error_stream() {
                // No OS-level merge on this platform; both readers share one list.
                stdout_list.clone()
            } else {
                let list = Arc::new(ObserverList::new(config.stderr_observers().iter().cloned()));
                list.register(gate.clone());
                list
            };
            OutputReader::spawn("stderr", stream, list, encoding, buffer_len)
        });

        let exit = ExitWatcher::spawn(spawned.child);

        let handle = ProcessHandle::new(HandleParts {
            id,
            config: config.clone(),
            args,
            pid,
            data_dir,
            wire,
            transport: self.transport.clone(),
            stdout,
            stderr,
            exit,
        });
        handle.set_state(LaunchState::AwaitingStartup);

        let start_timeout = config.start_timeout();
        let outcome = tokio::select! {
            started = gate.await_started(start_timeout) => {
                if started { StartupOutcome::Started } else { StartupOutcome::TimedOut }
            }
            _ = handle.exit_watcher().wait_forever() => {
                if gate.is_started() { StartupOutcome::Started } else { StartupOutcome::IoFailure }
            }
        };

        match outcome {
            StartupOutcome::Started if handle.is_running() => {
                handle.set_state(LaunchState::Running);
                tracing::info!(id = %handle.id(), pid, address = %handle.address(), "mongod ready");
                Ok(handle)
            }
            StartupOutcome::TimedOut => {
                handle.set_state(LaunchState::FailedStartup);
                tracing::warn!(
                    pid,
                    "mongod did not signal readiness within {}ms",
                    start_timeout.as_millis()
                );
                let teardown = handle.stop().await;
                Err(LaunchError::StartupTimeout {
                    timeout: start_timeout,
                    teardown,
                })
            }
            StartupOutcome::Started | StartupOutcome::IoFailure => {
                handle.set_state(LaunchState::FailedStartup);
                let exit_code = handle.exit_info().and_then(|i| i.code);
                tracing::warn!(pid, ?exit_code, "mongod exited before signalling readiness");
                let teardown = handle.stop().await;
                Err(LaunchError::ExitedBeforeReady {
                    exit_code,
                    teardown,
                })
            }
        }
    }
}

fn spawn_process(args: &ArgumentVector, merge: bool) -> io::Result<Spawned> {
    let mut cmd = Command::new(args.program());
    cmd.args(args.args()).stdin(Stdio::null()).kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    #[cfg(unix)]
    if merge {
        // Both descriptors point at one pipe so the interleaving is the server's own.
        let (reader, writer) = io::pipe()?;
        let writer_err = writer.try_clone()?;
        cmd.stdout(writer).stderr(writer_err);
        let child = cmd.spawn()?;
        // Close the parent's write ends, otherwise the reader never sees EOF.
        drop(cmd);
        let rx = tokio::net::unix::pipe::Receiver::from_owned_fd(std::os::fd::OwnedFd::from(reader))?;
        return Ok(Spawned {
            child,
            stdout: Box::new(rx),
            stderr: None,
        });
    }
    #[cfg(not(unix))]
    let _ = merge;

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr not captured"))?;

    Ok(Spawned {
        child,
        stdout: Box::new(stdout),
        stderr: Some(Box::new(stderr)),
    })
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // Take the server down with us if the supervisor dies. The kernel fires this when the
    // forking thread exits, not the process.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}
