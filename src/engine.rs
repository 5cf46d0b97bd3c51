use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::BinDecodable;
use tracing::{info, warn};

use crate::config::{Predicate, Rule, Verdict};
use crate::ipset::IpSet;
use crate::upstream::Upstream;

/// Shared read-only state: the configured nameservers, the loaded ipsets, and
/// the compiled rule list. Never mutated after startup.
pub struct Engine {
    pub upstreams: Vec<Upstream>,
    pub ipsets: Vec<IpSet>,
    pub rules: Vec<Rule>,
    pub timeout: Duration,
    pub verbose: bool,
}

impl Engine {
    /// Decides the fate of one upstream response. `server_index` is 1-based.
    ///
    /// Rules are scanned in declaration order, answers in wire order within
    /// each rule; the first matching pair wins. An unparsable response and a
    /// response no rule matches both drop.
    pub fn decide(&self, server_index: usize, payload: &[u8]) -> Verdict {
        let msg = match Message::from_bytes(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "unparsable upstream response");
                return Verdict::Drop;
            }
        };
        let answers = msg.answers();

        let mut line = String::new();
        if self.verbose {
            let _ = write!(
                line,
                "{} {} answer len {}",
                msg.id(),
                self.upstreams[server_index - 1],
                payload.len()
            );
            for ans in answers {
                let _ = write!(line, " {} {} TTL {}", ans.name(), ans.record_type(), ans.ttl());
                if let Some(data) = ans.data() {
                    let _ = write!(line, " {data}");
                }
            }
        }

        for rule in &self.rules {
            if let Some(server) = rule.predicate.server {
                if server != server_index {
                    continue;
                }
            }
            for ans in answers {
                if !self.answer_matches(&rule.predicate, ans) {
                    continue;
                }
                if self.verbose {
                    info!("{line} [{}]", rule.verdict);
                }
                return rule.verdict;
            }
        }

        if self.verbose {
            info!("{line} [DROP]");
        }
        Verdict::Drop
    }

    fn answer_matches(&self, predicate: &Predicate, ans: &Record) -> bool {
        if let Some(suffix) = predicate.name.as_deref() {
            if !name_matches(&ans.name().to_string(), suffix) {
                return false;
            }
        }

        if let Some(rtype) = predicate.rtype {
            if rtype != ans.record_type() {
                return false;
            }
        }

        if let Some(ipset_index) = predicate.ipset {
            let ip = match ans.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                // Anything that carries no address cannot match an ipset rule.
                _ => return false,
            };
            if !self.ipsets[ipset_index - 1].contains(ip) {
                return false;
            }
        }

        true
    }
}

/// Case-insensitive domain suffix match: `owner` equals `suffix`, or ends
/// with `"." + suffix`. The owner name is compared without its surrounding
/// dots.
fn name_matches(owner: &str, suffix: &str) -> bool {
    let owner = owner.trim_matches('.').as_bytes();
    let suffix = suffix.as_bytes();
    if suffix.len() > owner.len() {
        return false;
    }
    if suffix.len() == owner.len() {
        return owner.eq_ignore_ascii_case(suffix);
    }
    let tail = &owner[owner.len() - suffix.len() - 1..];
    tail[0] == b'.' && tail[1..].eq_ignore_ascii_case(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    fn a_record(name: &str, ip: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), 300, RData::A(A(ip)))
    }

    fn aaaa_record(name: &str, ip: Ipv6Addr) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), 300, RData::AAAA(AAAA(ip)))
    }

    fn cname_record(name: &str, target: &str) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str(target).unwrap())),
        )
    }

    fn response(answers: Vec<Record>) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(4097);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        for ans in answers {
            msg.add_answer(ans);
        }
        msg.to_bytes().expect("encode response")
    }

    fn rule(predicate: Predicate, verdict: Verdict) -> Rule {
        Rule { section: "rule.test".to_string(), predicate, verdict }
    }

    fn accept_all() -> Rule {
        rule(Predicate::default(), Verdict::Accept)
    }

    fn engine(rules: Vec<Rule>, ipsets: Vec<IpSet>) -> Engine {
        Engine {
            upstreams: vec![
                Upstream { addr: "192.0.2.1:53".parse().unwrap(), zone: None },
                Upstream { addr: "192.0.2.2:53".parse().unwrap(), zone: None },
            ],
            ipsets,
            rules,
            timeout: Duration::from_secs(1),
            verbose: false,
        }
    }

    #[test]
    fn unparsable_response_drops() {
        let e = engine(vec![accept_all()], Vec::new());
        assert_eq!(e.decide(1, &[0x00, 0x01]), Verdict::Drop);
    }

    #[test]
    fn no_rules_means_drop() {
        let e = engine(Vec::new(), Vec::new());
        let payload = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(1, &payload), Verdict::Drop);
    }

    #[test]
    fn wildcard_rule_accepts_everything() {
        let e = engine(vec![accept_all()], Vec::new());
        let payload = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(1, &payload), Verdict::Accept);
    }

    #[test]
    fn wildcard_rule_needs_at_least_one_answer() {
        let e = engine(vec![accept_all()], Vec::new());
        assert_eq!(e.decide(1, &response(Vec::new())), Verdict::Drop);
    }

    #[test]
    fn server_filter_skips_other_upstreams() {
        let delay = Verdict::Delay(Duration::from_millis(500));
        let e = engine(
            vec![
                rule(Predicate { server: Some(1), ..Default::default() }, delay),
                accept_all(),
            ],
            Vec::new(),
        );
        let payload = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(1, &payload), delay);
        assert_eq!(e.decide(2, &payload), Verdict::Accept);
    }

    #[test]
    fn first_matching_rule_wins() {
        let e = engine(
            vec![
                rule(
                    Predicate { name: Some("ads.example.com".to_string()), ..Default::default() },
                    Verdict::Drop,
                ),
                accept_all(),
            ],
            Vec::new(),
        );
        let blocked = response(vec![a_record("foo.ads.example.com.", Ipv4Addr::new(1, 2, 3, 4))]);
        let exact = response(vec![a_record("ads.example.com.", Ipv4Addr::new(1, 2, 3, 4))]);
        let unrelated = response(vec![a_record("notads.example.com.", Ipv4Addr::new(1, 2, 3, 4))]);
        assert_eq!(e.decide(1, &blocked), Verdict::Drop);
        assert_eq!(e.decide(1, &exact), Verdict::Drop);
        assert_eq!(e.decide(1, &unrelated), Verdict::Accept);
    }

    #[test]
    fn type_filter_matches_exactly() {
        let e = engine(
            vec![
                rule(Predicate { rtype: Some(RecordType::AAAA), ..Default::default() }, Verdict::Drop),
                accept_all(),
            ],
            Vec::new(),
        );
        let v6 = response(vec![aaaa_record("example.com.", Ipv6Addr::LOCALHOST)]);
        let v4 = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(1, &v6), Verdict::Drop);
        assert_eq!(e.decide(1, &v4), Verdict::Accept);
    }

    #[test]
    fn ipset_filter_matches_answer_addresses() {
        let ipset = IpSet::parse("10.0.0.0/8", "inline").unwrap();
        let e = engine(
            vec![
                rule(Predicate { ipset: Some(1), ..Default::default() }, Verdict::Drop),
                accept_all(),
            ],
            vec![ipset],
        );
        let inside = response(vec![a_record("example.com.", Ipv4Addr::new(10, 1, 2, 3))]);
        let outside = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(1, &inside), Verdict::Drop);
        assert_eq!(e.decide(1, &outside), Verdict::Accept);
    }

    #[test]
    fn ipset_filter_ignores_answers_without_addresses() {
        let ipset = IpSet::parse("0.0.0.0/0", "inline").unwrap();
        let e = engine(
            vec![
                rule(Predicate { ipset: Some(1), ..Default::default() }, Verdict::Drop),
                accept_all(),
            ],
            vec![ipset],
        );
        let payload = response(vec![cname_record("example.com.", "cdn.example.net.")]);
        assert_eq!(e.decide(1, &payload), Verdict::Accept);
    }

    #[test]
    fn any_answer_in_wire_order_can_match() {
        let ipset = IpSet::parse("10.0.0.0/8", "inline").unwrap();
        let e = engine(
            vec![
                rule(Predicate { ipset: Some(1), ..Default::default() }, Verdict::Drop),
                accept_all(),
            ],
            vec![ipset],
        );
        let late_match = response(vec![
            a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5)),
            a_record("example.com.", Ipv4Addr::new(10, 1, 2, 3)),
        ]);
        assert_eq!(e.decide(1, &late_match), Verdict::Drop);
    }

    #[test]
    fn verbose_mode_reaches_the_same_verdicts() {
        let mut e = engine(vec![accept_all()], Vec::new());
        e.verbose = true;
        let payload = response(vec![a_record("example.com.", Ipv4Addr::new(203, 0, 113, 5))]);
        assert_eq!(e.decide(2, &payload), Verdict::Accept);
        assert_eq!(e.decide(1, &[0xff]), Verdict::Drop);
    }

    #[test]
    fn suffix_matching_semantics() {
        assert!(name_matches("example.com.", "example.com"));
        assert!(name_matches("EXAMPLE.COM.", "example.com"));
        assert!(name_matches("a.b.example.com.", "example.com"));
        assert!(!name_matches("notexample.com.", "example.com"));
        assert!(!name_matches("com.", "example.com"));
        assert!(!name_matches("example.org.", "example.com"));
    }
}
