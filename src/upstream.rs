use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};

use anyhow::{bail, Context};
use tracing::info;

pub const DNS_PORT: u16 = 53;

/// A configured nameserver endpoint. Identified by 1-based index in rules and
/// logs; the zone name is kept for display only, matching goes through the
/// socket address (scope id included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub zone: Option<String>,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.addr, &self.zone) {
            (SocketAddr::V6(v6), Some(zone)) => {
                write!(f, "[{}%{}]:{}", v6.ip(), zone, v6.port())
            }
            (addr, _) => write!(f, "{addr}"),
        }
    }
}

/// Resolves the `-d` entries in order, rejecting duplicates.
pub fn parse_upstreams(entries: &[String]) -> anyhow::Result<Vec<Upstream>> {
    let mut upstreams: Vec<Upstream> = Vec::with_capacity(entries.len());
    for entry in entries {
        let upstream =
            parse_upstream(entry).with_context(|| format!("invalid nameserver: {entry}"))?;
        if upstreams.iter().any(|u| u.addr == upstream.addr) {
            bail!("nameserver exists: {entry}");
        }
        info!(nameserver = %upstream, "using nameserver");
        upstreams.push(upstream);
    }
    Ok(upstreams)
}

pub fn parse_upstream(input: &str) -> anyhow::Result<Upstream> {
    let addr = parse_addr(input)?;
    let zone = match addr {
        SocketAddr::V6(v6) if v6.scope_id() != 0 => zone_name(v6.scope_id()),
        _ => None,
    };
    Ok(Upstream { addr, zone })
}

/// Accepts `host:port`, a bare host (port defaults to 53), and bare IPv6
/// addresses that would otherwise be ambiguous about their colons. Hostnames
/// go through the system resolver; `%zone` suffixes are validated against the
/// interface table.
pub fn parse_addr(input: &str) -> anyhow::Result<SocketAddr> {
    if let Some((host, port)) = split_host_port(input) {
        return resolve(&host, port);
    }
    if let Some((host, port)) = split_host_port(&format!("{input}:{DNS_PORT}")) {
        return resolve(&host, port);
    }
    if let Some((host, port)) = split_host_port(&format!("[{input}]:{DNS_PORT}")) {
        return resolve(&host, port);
    }
    bail!("cannot parse address: {input}")
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?.parse().ok()?;
        Some((host.to_string(), port))
    } else {
        if s.bytes().filter(|&b| b == b':').count() != 1 {
            return None;
        }
        let (host, port) = s.split_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Some((ip, zone)) = host.split_once('%') {
        let ip: Ipv6Addr = ip
            .parse()
            .with_context(|| format!("zone suffix on a non-IPv6 address: {host}"))?;
        let scope = zone_index(zone).with_context(|| format!("IPv6 zone invalid: {zone}"))?;
        return Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}"))?
        .next()
        .with_context(|| format!("no addresses for {host}"))
}

/// Maps a datagram sender back to its 1-based upstream index by address,
/// port, and zone equality. IPv4-mapped senders (seen on a dual-stack
/// outbound socket) compare as plain IPv4.
pub fn lookup(upstreams: &[Upstream], src: SocketAddr) -> Option<usize> {
    let src = canonical(src);
    upstreams.iter().position(|u| u.addr == src).map(|i| i + 1)
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => SocketAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(unix)]
fn zone_index(zone: &str) -> Option<u32> {
    if let Ok(index) = zone.parse::<u32>() {
        if index == 0 {
            return None;
        }
        // A numeric zone must name an existing interface.
        zone_name(index).map(|_| index)
    } else {
        let name = std::ffi::CString::new(zone).ok()?;
        match unsafe { libc::if_nametoindex(name.as_ptr()) } {
            0 => None,
            index => Some(index),
        }
    }
}

#[cfg(unix)]
fn zone_name(index: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr().cast()) };
    if ret.is_null() {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(str::to_owned)
}

#[cfg(not(unix))]
fn zone_index(zone: &str) -> Option<u32> {
    zone.parse().ok().filter(|&index| index != 0)
}

#[cfg(not(unix))]
fn zone_name(_index: u32) -> Option<String> {
    None
}
