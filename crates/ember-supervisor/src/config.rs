use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use ember_process::{Platform, Version};

use crate::{
    error::ConfigError,
    net,
    observer::{self, Observer},
    stop_hook::StopHook,
};

pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_HOST: &str = "127.0.0.1";

const DEFAULT_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_BUFFER_BYTES: usize = 512;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub fn default_start_timeout() -> Duration {
    Duration::from_millis(
        env_u64("EMBER_START_TIMEOUT_MS")
            .map(|v| v.clamp(50, 600_000))
            .unwrap_or(DEFAULT_TIMEOUT_MS),
    )
}

pub fn default_shutdown_timeout() -> Duration {
    Duration::from_millis(
        env_u64("EMBER_SHUTDOWN_TIMEOUT_MS")
            .map(|v| v.clamp(50, 600_000))
            .unwrap_or(DEFAULT_TIMEOUT_MS),
    )
}

pub fn default_buffer_len() -> usize {
    env_usize("EMBER_OUTPUT_BUFFER_BYTES")
        .map(|v| v.clamp(64, 1024 * 1024))
        .unwrap_or(DEFAULT_BUFFER_BYTES)
}

/// Character encoding of the server's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8; invalid sequences are replaced.
    Utf8,
    /// ISO-8859-1, one byte per char.
    Latin1,
}

impl Encoding {
    /// Derives the encoding from `LC_ALL`, `LC_CTYPE` or `LANG`, in that order.
    pub fn from_locale() -> Self {
        let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|v| !v.trim().is_empty());
        match locale {
            Some(v) => Self::from_label(&v).unwrap_or(Encoding::Utf8),
            None => Encoding::Utf8,
        }
    }

    /// Parses a charset label such as `en_US.UTF-8` or `ISO-8859-1`.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.trim().to_ascii_lowercase();
        if lower.contains("utf-8") || lower.contains("utf8") {
            Some(Encoding::Utf8)
        } else if lower.contains("8859-1") || lower.contains("latin1") || lower.contains("latin-1")
        {
            Some(Encoding::Latin1)
        } else {
            None
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Optional server flags that depend on both the caller's wishes and the build's capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOptions {
    pub use_no_prealloc: bool,
    pub use_small_files: bool,
    pub use_no_journal: bool,
    pub sync_delay: Option<u32>,
    pub storage_engine: Option<String>,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            use_no_prealloc: true,
            use_small_files: true,
            use_no_journal: false,
            sync_delay: None,
            storage_engine: None,
        }
    }
}

/// Immutable description of one supervised server.
///
/// A few fields are resolved on first read and cached for the lifetime of the value:
/// the IPv6 preference (probed from the loopback name), the stream encoding (from the
/// locale) and the observer lists (an empty list becomes the default tracing observer).
pub struct LaunchConfig {
    version: Version,
    platform: Platform,
    host: String,
    port: u16,
    data_dir: Option<PathBuf>,
    temp_root: Option<PathBuf>,
    ipv6: OnceLock<bool>,
    redirect_error_stream: bool,
    encoding: OnceLock<Encoding>,
    buffer_len: usize,
    start_timeout: Duration,
    shutdown_timeout: Duration,
    cmd_options: CmdOptions,
    stdout_observers: Vec<Arc<dyn Observer>>,
    stderr_observers: Vec<Arc<dyn Observer>>,
    stop_hooks: Vec<Arc<dyn StopHook>>,
    resolved_stdout: OnceLock<Vec<Arc<dyn Observer>>>,
    resolved_stderr: OnceLock<Vec<Arc<dyn Observer>>>,
}

impl fmt::Debug for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchConfig")
            .field("version", &self.version)
            .field("platform", &self.platform)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("temp_root", &self.temp_root)
            .field("ipv6", &self.ipv6.get())
            .field("redirect_error_stream", &self.redirect_error_stream)
            .field("encoding", &self.encoding.get())
            .field("buffer_len", &self.buffer_len)
            .field("start_timeout", &self.start_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("cmd_options", &self.cmd_options)
            .field("stdout_observers", &self.stdout_observers.len())
            .field("stderr_observers", &self.stderr_observers.len())
            .field("stop_hooks", &self.stop_hooks.len())
            .finish()
    }
}

impl LaunchConfig {
    pub fn builder(version: Version) -> LaunchConfigBuilder {
        LaunchConfigBuilder::new(version)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Caller-supplied data directory; `None` means the supervisor allocates one per launch.
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Parent of per-launch data directories; `None` means the system temp dir.
    pub fn temp_root(&self) -> Option<&Path> {
        self.temp_root.as_deref()
    }

    pub fn ipv6(&self) -> bool {
        *self.ipv6.get_or_init(net::localhost_is_ipv6)
    }

    pub fn redirect_error_stream(&self) -> bool {
        self.redirect_error_stream
    }

    pub fn encoding(&self) -> Encoding {
        *self.encoding.get_or_init(Encoding::from_locale)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn cmd_options(&self) -> &CmdOptions {
        &self.cmd_options
    }

    pub fn stdout_observers(&self) -> &[Arc<dyn Observer>] {
        self.resolved_stdout.get_or_init(|| {
            if self.stdout_observers.is_empty() {
                vec![Arc::new(observer::default_stdout_observer()) as Arc<dyn Observer>]
            } else {
                self.stdout_observers.clone()
            }
        })
    }

    pub fn stderr_observers(&self) -> &[Arc<dyn Observer>] {
        self.resolved_stderr.get_or_init(|| {
            if self.stderr_observers.is_empty() {
                vec![Arc::new(observer::default_stderr_observer()) as Arc<dyn Observer>]
            } else {
                self.stderr_observers.clone()
            }
        })
    }

    /// Hooks run by every stop of a server launched with this config, in registration order.
    pub fn stop_hooks(&self) -> &[Arc<dyn StopHook>] {
        &self.stop_hooks
    }

    /// Address the administrative stop command goes to.
    ///
    /// Derived from the host the server is bound to, so the command reaches the same
    /// interface `--bind_ip` names. Wildcard and loopback-name hosts dial a raw loopback IP.
    pub fn shutdown_address(&self) -> SocketAddr {
        SocketAddr::new(net::dial_ip(&self.host, self.ipv6()), self.port)
    }
}

pub struct LaunchConfigBuilder {
    version: Version,
    platform: Platform,
    host: String,
    port: u16,
    data_dir: Option<PathBuf>,
    temp_root: Option<PathBuf>,
    ipv6: Option<bool>,
    redirect_error_stream: bool,
    encoding: Option<Encoding>,
    buffer_len: usize,
    start_timeout: Duration,
    shutdown_timeout: Duration,
    cmd_options: CmdOptions,
    stdout_observers: Vec<Arc<dyn Observer>>,
    stderr_observers: Vec<Arc<dyn Observer>>,
    stop_hooks: Vec<Arc<dyn StopHook>>,
}

impl LaunchConfigBuilder {
    fn new(version: Version) -> Self {
        Self {
            version,
            platform: Platform::current(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            data_dir: None,
            temp_root: None,
            ipv6: None,
            redirect_error_stream: false,
            encoding: None,
            buffer_len: default_buffer_len(),
            start_timeout: default_start_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            cmd_options: CmdOptions::default(),
            stdout_observers: Vec::new(),
            stderr_observers: Vec::new(),
            stop_hooks: Vec::new(),
        }
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port `0` asks the OS for a free port when the config is built.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use (and never delete) this directory instead of a fresh temporary one.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Allocate per-launch data directories under `dir`.
    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    pub fn ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }

    pub fn redirect_error_stream(mut self, redirect: bool) -> Self {
        self.redirect_error_stream = redirect;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len.max(1);
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn cmd_options(mut self, options: CmdOptions) -> Self {
        self.cmd_options = options;
        self
    }

    pub fn stdout_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.stdout_observers.push(observer);
        self
    }

    pub fn stderr_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.stderr_observers.push(observer);
        self
    }

    pub fn stop_hook(mut self, hook: Arc<dyn StopHook>) -> Self {
        self.stop_hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<LaunchConfig, ConfigError> {
        let port = net::allocate_tcp_port(self.port)?;

        let ipv6 = match self.ipv6 {
            Some(v) => OnceLock::from(v),
            None => OnceLock::new(),
        };
        let encoding = match self.encoding {
            Some(v) => OnceLock::from(v),
            None => OnceLock::new(),
        };

        Ok(LaunchConfig {
            version: self.version,
            platform: self.platform,
            host: self.host,
            port,
            data_dir: self.data_dir,
            temp_root: self.temp_root,
            ipv6,
            redirect_error_stream: self.redirect_error_stream,
            encoding,
            buffer_len: self.buffer_len,
            start_timeout: self.start_timeout,
            shutdown_timeout: self.shutdown_timeout,
            cmd_options: self.cmd_options,
            stdout_observers: self.stdout_observers,
            stderr_observers: self.stderr_observers,
            stop_hooks: self.stop_hooks,
            resolved_stdout: OnceLock::new(),
            resolved_stderr: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::observer::LineBuffer;

    fn config() -> LaunchConfigBuilder {
        LaunchConfig::builder(Version::new(4, 4, 0)).port(0)
    }

    #[test]
    fn port_zero_allocates_a_free_port() {
        let cfg = config().build().unwrap();
        assert_ne!(cfg.port(), 0);
    }

    #[test]
    fn explicit_ipv6_is_not_probed() {
        let cfg = config().ipv6(true).build().unwrap();
        assert!(cfg.ipv6());

        let cfg = config().ipv6(false).build().unwrap();
        assert!(!cfg.ipv6());
    }

    #[test]
    fn shutdown_address_targets_the_bound_host() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);

        let cfg = config().ipv6(true).build().unwrap();
        assert_eq!(cfg.host(), DEFAULT_HOST);
        assert_eq!(cfg.shutdown_address().ip(), v4);
        assert_eq!(cfg.shutdown_address().port(), cfg.port());

        let cfg = config().host("::1").ipv6(true).build().unwrap();
        assert_eq!(cfg.shutdown_address().ip(), v6);

        let cfg = config().host("0.0.0.0").ipv6(true).build().unwrap();
        assert_eq!(cfg.shutdown_address().ip(), v4);

        let cfg = config().host("localhost").ipv6(true).build().unwrap();
        assert_eq!(cfg.shutdown_address().ip(), v6);
    }

    #[test]
    fn empty_observer_lists_resolve_to_one_default_once() {
        let cfg = config().build().unwrap();
        let first = cfg.stdout_observers();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name(), "tracing");

        let again = cfg.stdout_observers();
        assert!(Arc::ptr_eq(&first[0], &again[0]));
        assert_eq!(cfg.stderr_observers().len(), 1);
    }

    #[test]
    fn registered_observers_are_kept() {
        let buf: Arc<dyn Observer> = Arc::new(LineBuffer::default());
        let cfg = config().stdout_observer(buf.clone()).build().unwrap();
        assert_eq!(cfg.stdout_observers().len(), 1);
        assert!(Arc::ptr_eq(&cfg.stdout_observers()[0], &buf));
    }

    #[test]
    fn encoding_labels() {
        assert_eq!(Encoding::from_label("en_US.UTF-8"), Some(Encoding::Utf8));
        assert_eq!(Encoding::from_label("ISO-8859-1"), Some(Encoding::Latin1));
        assert_eq!(Encoding::from_label("C"), None);
        assert_eq!(Encoding::Latin1.decode(&[0x63, 0xe9]), "c\u{e9}");
        assert_eq!(Encoding::Utf8.decode(&[0x63, 0xff]), "c\u{fffd}");
    }

    #[test]
    fn explicit_encoding_wins() {
        let cfg = config().encoding(Encoding::Latin1).build().unwrap();
        assert_eq!(cfg.encoding(), Encoding::Latin1);
    }
}
