use std::{fmt, path::Path};

use ember_process::{Capability, CapabilitySet, Os};

use crate::config::LaunchConfig;

const NUMA_WRAPPER: &[&str] = &["numactl", "--interleave=all"];

/// Ordered argv for the server; element 0 is the program to exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVector(Vec<String>);

impl ArgumentVector {
    pub fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &str> + ExactSizeIterator {
        self.0.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl fmt::Display for ArgumentVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Builds the server command line.
///
/// `numa_detected` is the OS-level verdict; it only matters when the build is `NumaAware`.
pub fn build(
    executable: &Path,
    config: &LaunchConfig,
    data_dir: &Path,
    capabilities: &CapabilitySet,
    numa_detected: bool,
) -> ArgumentVector {
    let opts = config.cmd_options();
    let mut argv = vec![
        executable.to_string_lossy().into_owned(),
        "-v".to_string(),
        "--port".to_string(),
        config.port().to_string(),
        "--dbpath".to_string(),
        data_dir.to_string_lossy().into_owned(),
    ];

    if opts.use_no_prealloc && !capabilities.contains(Capability::NoPreallocArg) {
        argv.push("--noprealloc".to_string());
    }
    if !capabilities.contains(Capability::NoHttpInterfaceArg) {
        argv.push("--nohttpinterface".to_string());
    }
    if opts.use_small_files && !capabilities.contains(Capability::NoSmallFilesArg) {
        argv.push("--smallfiles".to_string());
    }
    if let Some(delay) = opts.sync_delay.filter(|_| capabilities.contains(Capability::SyncDelay)) {
        argv.push("--syncdelay".to_string());
        argv.push(delay.to_string());
    }
    if let Some(engine) = opts
        .storage_engine
        .as_ref()
        .filter(|_| capabilities.contains(Capability::StorageEngine))
    {
        argv.push("--storageEngine".to_string());
        argv.push(engine.clone());
    }
    if opts.use_no_journal {
        argv.push("--nojournal".to_string());
    }
    if config.ipv6() {
        argv.push("--ipv6".to_string());
    }
    if capabilities.contains(Capability::NoBindIpToLocalhost) {
        argv.push("--bind_ip".to_string());
        argv.push(config.host().to_string());
    }

    if capabilities.contains(Capability::NumaAware) && numa_detected {
        match config.platform().os {
            Os::Linux => {
                let mut wrapped: Vec<String> =
                    NUMA_WRAPPER.iter().map(|s| s.to_string()).collect();
                wrapped.extend(argv);
                return ArgumentVector(wrapped);
            }
            os => {
                tracing::warn!(?os, "NUMA detected but interleaving is not supported here; launching unwrapped");
            }
        }
    }

    ArgumentVector(argv)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ember_process::{Arch, Platform, Version};

    use super::*;
    use crate::{capabilities::capabilities_for, config::CmdOptions};

    fn config(version: Version, os: Os) -> LaunchConfig {
        LaunchConfig::builder(version)
            .platform(Platform::new(os, Arch::X86_64))
            .port(0)
            .ipv6(false)
            .build()
            .unwrap()
    }

    fn argv_for(cfg: &LaunchConfig, numa: bool) -> ArgumentVector {
        let caps = capabilities_for(&cfg.version(), &cfg.platform());
        build(
            &PathBuf::from("/opt/mongo/bin/mongod"),
            cfg,
            &PathBuf::from("/tmp/ember-db-x"),
            &caps,
            numa,
        )
    }

    #[test]
    fn old_release_gets_legacy_flags_in_order() {
        let cfg = config(Version::new(3, 2, 0), Os::MacOs);
        let argv = argv_for(&cfg, false);
        let port = cfg.port().to_string();
        assert_eq!(
            argv.iter().collect::<Vec<_>>(),
            vec![
                "/opt/mongo/bin/mongod",
                "-v",
                "--port",
                port.as_str(),
                "--dbpath",
                "/tmp/ember-db-x",
                "--noprealloc",
                "--nohttpinterface",
                "--smallfiles",
            ]
        );
    }

    #[test]
    fn new_release_omits_legacy_flags_and_binds_host() {
        let cfg = config(Version::new(4, 4, 0), Os::MacOs);
        let argv = argv_for(&cfg, false);
        for flag in ["--noprealloc", "--nohttpinterface", "--smallfiles"] {
            assert!(!argv.iter().any(|a| a == flag), "{flag} present");
        }
        let tail: Vec<_> = argv.iter().rev().take(2).collect();
        assert_eq!(tail, vec!["127.0.0.1", "--bind_ip"]);
    }

    #[test]
    fn ipv6_shutdown_dials_the_bound_host() {
        for host in ["127.0.0.1", "::1", "localhost"] {
            let cfg = LaunchConfig::builder(Version::new(4, 4, 0))
                .platform(Platform::new(Os::Linux, Arch::X86_64))
                .host(host)
                .port(0)
                .ipv6(true)
                .build()
                .unwrap();
            let argv = argv_for(&cfg, false);
            let bound = argv
                .iter()
                .skip_while(|a| *a != "--bind_ip")
                .nth(1)
                .expect("--bind_ip present");
            let expected = crate::net::dial_ip(bound, true);
            assert_eq!(cfg.shutdown_address().ip(), expected, "host {host}");
            if let Ok(literal) = bound.parse::<std::net::IpAddr>() {
                assert_eq!(cfg.shutdown_address().ip(), literal, "host {host}");
            }
        }
    }

    #[test]
    fn mid_release_keeps_prealloc_and_smallfiles_only() {
        let cfg = config(Version::new(3, 6, 5), Os::MacOs);
        let argv = argv_for(&cfg, false);
        assert!(argv.iter().any(|a| a == "--noprealloc"));
        assert!(argv.iter().any(|a| a == "--smallfiles"));
        assert!(!argv.iter().any(|a| a == "--nohttpinterface"));
    }

    #[test]
    fn cmd_options_toggle_optional_flags() {
        let cfg = LaunchConfig::builder(Version::new(3, 4, 0))
            .platform(Platform::new(Os::MacOs, Arch::X86_64))
            .port(0)
            .ipv6(true)
            .cmd_options(CmdOptions {
                use_no_prealloc: false,
                use_small_files: false,
                use_no_journal: true,
                sync_delay: Some(0),
                storage_engine: Some("wiredTiger".to_string()),
            })
            .build()
            .unwrap();
        let argv = argv_for(&cfg, false);
        let joined = argv.to_string();
        assert!(!joined.contains("--noprealloc"));
        assert!(!joined.contains("--smallfiles"));
        assert!(joined.contains("--syncdelay 0 --storageEngine wiredTiger --nojournal --ipv6"));
    }

    #[test]
    fn numa_wraps_on_linux_only() {
        let linux = config(Version::new(4, 0, 0), Os::Linux);
        let argv = argv_for(&linux, true);
        assert_eq!(argv.program(), "numactl");
        assert_eq!(argv.args()[0], "--interleave=all");
        assert_eq!(argv.args()[1], "/opt/mongo/bin/mongod");

        let unwrapped = argv_for(&linux, false);
        assert_eq!(unwrapped.program(), "/opt/mongo/bin/mongod");

        let windows = config(Version::new(4, 0, 0), Os::Windows);
        assert_eq!(argv_for(&windows, true).program(), "/opt/mongo/bin/mongod");
    }

    #[test]
    fn output_is_deterministic() {
        let cfg = config(Version::new(3, 0, 0), Os::Linux);
        assert_eq!(argv_for(&cfg, false), argv_for(&cfg, false));
    }
}
