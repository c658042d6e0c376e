use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener, ToSocketAddrs},
};

use crate::error::ConfigError;

/// Checks a caller-chosen port is free, or asks the OS for an ephemeral one when `preferred` is 0.
pub fn allocate_tcp_port(preferred: u16) -> Result<u16, ConfigError> {
    if preferred != 0 {
        match TcpListener::bind(("0.0.0.0", preferred)) {
            Ok(l) => {
                l.set_nonblocking(true).ok();
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(ConfigError::PortInUse(preferred));
            }
            Err(e) => {
                return Err(ConfigError::Port {
                    port: preferred,
                    source: e,
                });
            }
        }
        return Ok(preferred);
    }

    let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(|e| ConfigError::Port {
        port: 0,
        source: e,
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ConfigError::Port { port: 0, source: e })?
        .port();
    Ok(port)
}

/// Whether the loopback name resolves to an IPv6 address first.
///
/// Resolution failures fall back to IPv4.
pub fn localhost_is_ipv6() -> bool {
    match ("localhost", 0).to_socket_addrs() {
        Ok(mut addrs) => matches!(addrs.next().map(|a| a.ip()), Some(IpAddr::V6(_))),
        Err(e) => {
            tracing::warn!(error = %e, "resolve localhost failed; assuming ipv4");
            false
        }
    }
}

/// IP a local client dials to reach a server bound to `host`.
///
/// Only the first entry of a comma-separated bind list is considered. Wildcard binds map to
/// the loopback of their own family and the loopback name to the loopback of the preferred
/// family. Other names are resolved, preferring the preferred family.
pub fn dial_ip(host: &str, prefer_ipv6: bool) -> IpAddr {
    let loopback = if prefer_ipv6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };

    let first = host.split(',').next().unwrap_or_default().trim();
    let first = first.trim_start_matches('[').trim_end_matches(']');
    if first.is_empty() || first.eq_ignore_ascii_case("localhost") {
        return loopback;
    }

    match first.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        Ok(ip) => ip,
        Err(_) => match (first, 0).to_socket_addrs() {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.iter()
                    .find(|ip| ip.is_ipv6() == prefer_ipv6)
                    .or_else(|| ips.first())
                    .copied()
                    .unwrap_or(loopback)
            }
            Err(e) => {
                tracing::warn!(host = first, error = %e, "resolve bind host failed; dialing loopback");
                loopback
            }
        },
    }
}
