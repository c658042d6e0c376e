use std::{collections::BTreeSet, fmt, path::PathBuf, str::FromStr};

/// Release of the server binary, e.g. `3.6.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_newer_or_equal(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self >= Version::new(major, minor, patch)
    }

    /// The `major.minor` release line.
    pub fn line(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version: {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let trimmed = raw.strip_prefix('v').unwrap_or(raw);
        if trimmed.is_empty() {
            return Err(ParseVersionError(s.to_string()));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in trimmed.split('.') {
            if count == parts.len() {
                return Err(ParseVersionError(s.to_string()));
            }
            parts[count] = piece
                .parse::<u32>()
                .map_err(|_| ParseVersionError(s.to_string()))?;
            count += 1;
        }
        if count < 2 {
            return Err(ParseVersionError(s.to_string()));
        }

        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Solaris,
    FreeBsd,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    pub fn is_64bit(&self) -> bool {
        matches!(self, Arch::X86_64 | Arch::Aarch64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "linux" => Os::Linux,
            "macos" => Os::MacOs,
            "windows" => Os::Windows,
            "solaris" | "illumos" => Os::Solaris,
            "freebsd" => Os::FreeBsd,
            _ => Os::Other,
        };
        let arch = match std::env::consts::ARCH {
            "x86" => Arch::X86,
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            _ => Arch::Other,
        };
        Self { os, arch }
    }
}

/// Version/platform-derived trait of a server build that changes how it is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Capability {
    SyncDelay,
    TextSearch,
    StorageEngine,
    Only64Bit,
    NoChunkSizeArg,
    MongosConfigDbSetStyle,
    NoHttpInterfaceArg,
    NoPreallocArg,
    NoSmallFilesArg,
    RequiresSsl,
    OnlyWindows2008Server,
    NoSolarisSupport,
    NoBindIpToLocalhost,
    Aarch64Available,
    NumaAware,
    OpMsgWire,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LaunchId(pub String);

impl LaunchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LaunchState {
    Idle,
    Spawning,
    StreamsAttached,
    AwaitingStartup,
    Running,
    FailedStartup,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LaunchStatus {
    pub id: LaunchId,
    pub state: LaunchState,
    pub version: Version,
    pub pid: Option<u32>,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_id_is_non_empty() {
        let id = LaunchId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn parse_version_variants() {
        assert_eq!("3.6.5".parse::<Version>().unwrap(), Version::new(3, 6, 5));
        assert_eq!("v4.2".parse::<Version>().unwrap(), Version::new(4, 2, 0));
        assert_eq!(" 2.0.6 ".parse::<Version>().unwrap(), Version::new(2, 0, 6));
    }

    #[test]
    fn parse_version_rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("4".parse::<Version>().is_err());
        assert!("4.x".parse::<Version>().is_err());
        let err = "1.2.3.4".parse::<Version>().unwrap_err();
        assert_eq!(err.to_string(), "invalid version: \"1.2.3.4\"");
    }

    #[test]
    fn version_ordering_follows_components() {
        let v = Version::new(3, 6, 0);
        assert!(v.is_newer_or_equal(3, 4, 9));
        assert!(v.is_newer_or_equal(3, 6, 0));
        assert!(!v.is_newer_or_equal(4, 0, 0));
        assert_eq!(v.to_string(), "3.6.0");
    }

    #[test]
    fn capability_set_membership() {
        let set: CapabilitySet = [Capability::NumaAware, Capability::OpMsgWire]
            .into_iter()
            .collect();
        assert!(set.contains(Capability::NumaAware));
        assert!(!set.contains(Capability::RequiresSsl));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn launch_status_serializes_state_by_name() {
        let status = LaunchStatus {
            id: LaunchId("abc".to_string()),
            state: LaunchState::Running,
            version: Version::new(4, 4, 0),
            pid: Some(42),
            host: "127.0.0.1".to_string(),
            port: 27017,
            data_dir: PathBuf::from("/tmp/ember-db-abc"),
            args: vec!["mongod".to_string()],
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["state"], "Running");
        assert_eq!(v["pid"], 42);
    }
}
