use std::path::PathBuf;

use anyhow::Context;
use ember_process::Version;

const DEFAULT_VERSION: &str = "4.4.0";

/// Agent configuration, read from `EMBER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentSettings {
    pub(crate) mongod_bin: PathBuf,
    pub(crate) version: Version,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db_path: Option<PathBuf>,
    pub(crate) ipv6: Option<bool>,
    pub(crate) console_log: Option<PathBuf>,
}

impl AgentSettings {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mongod_bin = get("EMBER_MONGOD_BIN")
            .map(PathBuf::from)
            .context("EMBER_MONGOD_BIN must point at a mongod executable")?;
        let version = get("EMBER_VERSION")
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
            .parse::<Version>()
            .context("parse EMBER_VERSION")?;
        let port = match get("EMBER_PORT") {
            Some(v) => v
                .parse::<u16>()
                .with_context(|| format!("parse EMBER_PORT {v:?}"))?,
            None => 0,
        };
        let ipv6 = match get("EMBER_IPV6") {
            Some(v) => Some(parse_bool(&v).with_context(|| format!("parse EMBER_IPV6 {v:?}"))?),
            None => None,
        };

        Ok(Self {
            mongod_bin,
            version,
            host: get("EMBER_HOST").unwrap_or_else(|| ember_supervisor::config::DEFAULT_HOST.to_string()),
            port,
            db_path: get("EMBER_DB_PATH").map(PathBuf::from),
            ipv6,
            console_log: get("EMBER_CONSOLE_LOG").map(PathBuf::from),
        })
    }
}

pub(crate) fn log_dir() -> Option<PathBuf> {
    std::env::var("EMBER_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_bool(v: &str) -> anyhow::Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected a boolean"),
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut causes: Vec<String> = err
        .chain()
        .map(ToString::to_string)
        .filter(|c| !c.is_empty())
        .collect();
    // Wrappers that reuse their source's message would print it twice.
    causes.dedup();
    if causes.is_empty() {
        return "unknown error".to_string();
    }
    causes.join(": ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> anyhow::Result<AgentSettings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentSettings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_binary_is_set() {
        let s = settings(&[("EMBER_MONGOD_BIN", "/opt/mongo/bin/mongod")]).unwrap();
        assert_eq!(s.mongod_bin, PathBuf::from("/opt/mongo/bin/mongod"));
        assert_eq!(s.version, Version::new(4, 4, 0));
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 0);
        assert_eq!(s.db_path, None);
        assert_eq!(s.ipv6, None);
    }

    #[test]
    fn explicit_values_are_parsed() {
        let s = settings(&[
            ("EMBER_MONGOD_BIN", "mongod"),
            ("EMBER_VERSION", "3.6.5"),
            ("EMBER_PORT", "27018"),
            ("EMBER_IPV6", "yes"),
            ("EMBER_DB_PATH", "/data/db"),
        ])
        .unwrap();
        assert_eq!(s.version, Version::new(3, 6, 5));
        assert_eq!(s.port, 27018);
        assert_eq!(s.ipv6, Some(true));
        assert_eq!(s.db_path, Some(PathBuf::from("/data/db")));
    }

    #[test]
    fn missing_binary_and_bad_values_fail() {
        assert!(settings(&[]).is_err());
        let err = settings(&[("EMBER_MONGOD_BIN", "mongod"), ("EMBER_PORT", "huge")]).unwrap_err();
        assert!(format_error_chain(&err).starts_with("parse EMBER_PORT"));
        assert!(settings(&[("EMBER_MONGOD_BIN", "mongod"), ("EMBER_IPV6", "maybe")]).is_err());
    }

    #[test]
    fn error_chain_skips_repeated_causes() {
        let err = anyhow::anyhow!("inner").context("inner").context("outer");
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
