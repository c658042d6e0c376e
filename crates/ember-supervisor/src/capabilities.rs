use ember_process::{Arch, Capability, CapabilitySet, Os, Platform, Version};

/// Release lines the matrix knows about.
const KNOWN_LINES: &[(u32, u32)] = &[
    (2, 0),
    (2, 2),
    (2, 4),
    (2, 6),
    (3, 0),
    (3, 2),
    (3, 4),
    (3, 6),
    (4, 0),
    (4, 2),
    (4, 4),
    (5, 0),
    (6, 0),
    (7, 0),
];

pub fn is_known_line(version: &Version) -> bool {
    KNOWN_LINES.contains(&version.line())
}

/// Capabilities of a server build. Unknown versions and platforms yield an empty set;
/// whether they can actually run is for the artifact provider to decide.
pub fn capabilities_for(version: &Version, platform: &Platform) -> CapabilitySet {
    let mut set = CapabilitySet::new();
    if !is_known_line(version) || platform.os == Os::Other {
        return set;
    }

    let at_least = |major, minor| version.is_newer_or_equal(major, minor, 0);

    if at_least(2, 2) {
        set.insert(Capability::SyncDelay);
    }
    if at_least(2, 4) {
        set.insert(Capability::TextSearch);
    }
    if at_least(3, 0) {
        set.insert(Capability::StorageEngine);
    }
    if at_least(3, 4) {
        set.insert(Capability::Only64Bit);
        set.insert(Capability::NoChunkSizeArg);
        set.insert(Capability::MongosConfigDbSetStyle);
    }
    if at_least(3, 6) {
        set.insert(Capability::NoHttpInterfaceArg);
        set.insert(Capability::NoBindIpToLocalhost);
        set.insert(Capability::OpMsgWire);
    }
    if at_least(4, 2) {
        set.insert(Capability::NoPreallocArg);
        set.insert(Capability::NoSmallFilesArg);
    }

    match platform.os {
        Os::MacOs if at_least(3, 6) && !at_least(4, 2) => {
            set.insert(Capability::RequiresSsl);
        }
        Os::Windows if at_least(3, 0) && !at_least(4, 2) => {
            set.insert(Capability::OnlyWindows2008Server);
        }
        Os::Solaris if at_least(3, 4) => {
            set.insert(Capability::NoSolarisSupport);
        }
        Os::Linux if platform.arch == Arch::Aarch64 && at_least(3, 4) => {
            set.insert(Capability::Aarch64Available);
        }
        _ => {}
    }

    if matches!(platform.os, Os::Linux | Os::Windows) {
        set.insert(Capability::NumaAware);
    }

    set
}
