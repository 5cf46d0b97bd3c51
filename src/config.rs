use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use hickory_proto::rr::RecordType;
use ini::Ini;
use tracing::{info, warn};

/// What to do with one upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Accept,
    Delay(Duration),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Drop => f.write_str("DROP"),
            Verdict::Accept => f.write_str("ACCEPT"),
            Verdict::Delay(d) => write!(f, "DELAY {}", humantime::format_duration(*d)),
        }
    }
}

/// Absent fields match anything. `server` and `ipset` are 1-based indices
/// into the configured nameserver and ipset lists.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub server: Option<usize>,
    pub ipset: Option<usize>,
    pub rtype: Option<RecordType>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub section: String,
    pub predicate: Predicate,
    pub verdict: Verdict,
}

pub fn load_rules(path: &Path, servers: usize, ipsets: usize) -> anyhow::Result<Vec<Rule>> {
    let ini = Ini::load_from_file(path)
        .with_context(|| format!("load config file {}", path.display()))?;
    compile_rules(&ini, servers, ipsets)
}

/// Sections named `rule.*` become rules in declaration order. A missing or
/// unknown `target` is fatal; everything else degrades to a wildcard (or
/// ACCEPT, for a bad delay) with a warning.
pub fn compile_rules(ini: &Ini, servers: usize, ipsets: usize) -> anyhow::Result<Vec<Rule>> {
    let mut rules = Vec::new();

    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        if !section.starts_with("rule.") {
            continue;
        }

        let Some(target) = props.get("target") else {
            bail!("{section}: target must exist in a rule");
        };

        let mut predicate = Predicate::default();

        if let Some(raw) = props.get("server") {
            match raw.trim().parse::<usize>() {
                Ok(index) if index >= 1 && index <= servers => predicate.server = Some(index),
                _ => warn!(rule = section, value = raw, "invalid server index, matching any"),
            }
        }

        if let Some(raw) = props.get("ipset") {
            match raw.trim().parse::<usize>() {
                Ok(index) if index >= 1 && index <= ipsets => predicate.ipset = Some(index),
                _ => warn!(rule = section, value = raw, "invalid ipset index, matching any"),
            }
        }

        if let Some(raw) = props.get("type") {
            match parse_record_type(raw) {
                Some(rtype) => predicate.rtype = Some(rtype),
                None => warn!(rule = section, value = raw, "invalid type, matching any"),
            }
        }

        if let Some(raw) = props.get("name") {
            let name = raw.trim_matches(|c: char| c.is_whitespace() || c == '.');
            if name.is_empty() {
                warn!(rule = section, "empty domain name, matching any");
            } else {
                predicate.name = Some(name.to_string());
            }
        }

        let verdict = match target.trim() {
            t if t.eq_ignore_ascii_case("DROP") => Verdict::Drop,
            t if t.eq_ignore_ascii_case("ACCEPT") => Verdict::Accept,
            t if t.eq_ignore_ascii_case("DELAY") => match props.get("delay") {
                Some(raw) => match humantime::parse_duration(raw.trim()) {
                    Ok(d) if !d.is_zero() => Verdict::Delay(d),
                    Ok(_) => Verdict::Accept,
                    Err(err) => {
                        warn!(
                            rule = section,
                            value = raw,
                            error = %err,
                            "delay parse error, assuming ACCEPT"
                        );
                        Verdict::Accept
                    }
                },
                None => {
                    warn!(
                        rule = section,
                        "delay must be specified when target is delay, assuming ACCEPT"
                    );
                    Verdict::Accept
                }
            },
            other => bail!("{section}: unknown target {other:?}"),
        };

        info!(
            rule = section,
            server = ?predicate.server,
            ipset = ?predicate.ipset,
            rtype = ?predicate.rtype,
            name = ?predicate.name,
            verdict = %verdict,
            "rule compiled"
        );

        rules.push(Rule {
            section: section.to_string(),
            predicate,
            verdict,
        });
    }

    Ok(rules)
}

/// The record type names accepted in rule `type` keys. `ALL` is the ANY
/// query type; WKS and MINFO only exist as raw RR type codes.
fn parse_record_type(value: &str) -> Option<RecordType> {
    let upper = value.trim().to_ascii_uppercase();
    let rtype = match upper.as_str() {
        "A" => RecordType::A,
        "NS" => RecordType::NS,
        "CNAME" => RecordType::CNAME,
        "SOA" => RecordType::SOA,
        "PTR" => RecordType::PTR,
        "MX" => RecordType::MX,
        "TXT" => RecordType::TXT,
        "AAAA" => RecordType::AAAA,
        "SRV" => RecordType::SRV,
        "OPT" => RecordType::OPT,
        "WKS" => RecordType::from(11),
        "HINFO" => RecordType::HINFO,
        "MINFO" => RecordType::from(14),
        "AXFR" => RecordType::AXFR,
        "ALL" => RecordType::ANY,
        _ => return None,
    };
    Some(rtype)
}
