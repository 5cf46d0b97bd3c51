use std::cmp::Ordering;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use ipnet::IpNet;

/// Immutable ordered set of network prefixes with binary-search membership.
#[derive(Debug)]
pub struct IpSet {
    prefixes: Vec<Prefix>,
}

#[derive(Debug, Clone, Copy)]
enum Prefix {
    V4 { net: [u8; 4], mask: [u8; 4] },
    V6 { net: [u8; 16], mask: [u8; 16] },
}

impl Prefix {
    fn net(&self) -> &[u8] {
        match self {
            Prefix::V4 { net, .. } => net,
            Prefix::V6 { net, .. } => net,
        }
    }

    fn mask(&self) -> &[u8] {
        match self {
            Prefix::V4 { mask, .. } => mask,
            Prefix::V6 { mask, .. } => mask,
        }
    }
}

impl From<IpNet> for Prefix {
    fn from(net: IpNet) -> Self {
        match net {
            IpNet::V4(v4) => Prefix::V4 {
                net: v4.network().octets(),
                mask: v4.netmask().octets(),
            },
            IpNet::V6(v6) => Prefix::V6 {
                net: v6.network().octets(),
                mask: v6.netmask().octets(),
            },
        }
    }
}

impl IpSet {
    pub fn load(path: &Path) -> anyhow::Result<IpSet> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read ipset file {}", path.display()))?;
        Self::parse(&text, &path.display().to_string())
    }

    /// One prefix per non-empty line, whitespace-trimmed. Bare addresses are
    /// normalized to /32 (IPv4) or /128 (IPv6).
    pub fn parse(text: &str, origin: &str) -> anyhow::Result<IpSet> {
        let mut prefixes = Vec::new();
        for line in text.lines() {
            let entry = line.trim();
            if entry.is_empty() {
                continue;
            }
            let full;
            let entry = if entry.contains('/') {
                entry
            } else {
                full = if entry.contains(':') {
                    format!("{entry}/128")
                } else {
                    format!("{entry}/32")
                };
                &full
            };
            let net: IpNet = entry
                .parse()
                .with_context(|| format!("invalid CIDR: {} in file {origin}", line.trim()))?;
            prefixes.push(Prefix::from(net.trunc()));
        }
        // IPv4 before IPv6, then raw network bytes ascending.
        prefixes.sort_by(|a, b| {
            a.net()
                .len()
                .cmp(&b.net().len())
                .then_with(|| a.net().cmp(b.net()))
        });
        Ok(IpSet { prefixes })
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        let v4;
        let v6;
        let octets: &[u8] = match ip {
            IpAddr::V4(a) => {
                v4 = a.octets();
                &v4
            }
            IpAddr::V6(a) => {
                v6 = a.octets();
                &v6
            }
        };
        self.prefixes
            .binary_search_by(|p| cmp_prefix(p, octets))
            .is_ok()
    }
}

/// Orders a stored prefix against an address: shorter byte length first, then
/// masked bytes position by position. Host bits of the stored prefix are
/// already cleared, so its own bytes stand in for the masked form.
fn cmp_prefix(prefix: &Prefix, ip: &[u8]) -> Ordering {
    let net = prefix.net();
    let mask = prefix.mask();
    match net.len().cmp(&ip.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    for i in 0..ip.len() {
        match net[i].cmp(&(ip[i] & mask[i])) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// IPv4-mapped IPv6 addresses take part as their 4-byte form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
