//! Lifecycle supervision for disposable `mongod` servers.
//!
//! [`Supervisor::launch`] resolves the executable, builds a capability-aware command line,
//! spawns the server, fans its output out to observers and waits for the readiness line.
//! [`ProcessHandle::stop`] runs the tiered shutdown and cleans up.

pub mod artifact;
pub mod capabilities;
pub mod command_line;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod exit;
pub mod fanout;
pub mod gate;
pub mod handle;
pub mod harness;
pub mod net;
pub mod numa;
pub mod observer;
pub mod shutdown;
pub mod stop_hook;
pub mod supervisor;
pub mod transport;

pub use artifact::{ArtifactProvider, LocalExecutable};
pub use capabilities::capabilities_for;
pub use command_line::ArgumentVector;
pub use config::{CmdOptions, Encoding, LaunchConfig, LaunchConfigBuilder};
pub use data_dir::DataDir;
pub use error::{ArtifactError, ConfigError, LaunchError, ShutdownError};
pub use exit::ExitInfo;
pub use fanout::{ObserverList, OutputReader};
pub use gate::{READY_SENTINEL, STRUCTURED_READY_SENTINEL, StartupGate, StartupOutcome};
pub use handle::ProcessHandle;
pub use harness::{PRODUCTION_VERSION, TestMongod};
pub use numa::{KernelConfigProbe, NumaDetector, NumaProbe, StaticProbe};
pub use observer::{
    Capture, Channel, ConsoleLog, Discard, LineBuffer, Observer, Print, RotationPolicy, Severity, TracingSink,
};
pub use shutdown::{ShutdownCommandOutcome, StopReport};
pub use stop_hook::{CopyDbFiles, StopHook};
pub use supervisor::Supervisor;
pub use transport::{AdminCommandTransport, ShutdownTransport, WireProtocol};
