// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The policy file: engine configuration, the interfaces the host
//! has, queues, and the rules of every anchor.
//!
//! ```toml
//! interfaces = ["em0", "em1"]
//!
//! [config]
//! inet6 = false
//!
//! [config.timeouts]
//! "tcp.established" = 3600
//!
//! [[rule]]
//! action = "pass"
//! direction = "in"
//! on = "em0"
//! proto = "tcp"
//! to = "192.0.2.0/24"
//! to_port = "80"
//! keep_state = true
//!
//! [[rule]]
//! action = "nat"
//! on = "em1"
//! from = "10.0.0.0/8"
//! pool = ["198.51.100.1"]
//! ```

use pf::api::AddrFamily;
use pf::api::AddrWrap;
use pf::api::AltqSpec;
use pf::api::Direction;
use pf::api::PfCfg;
use pf::api::PoolAddrSpec;
use pf::api::RouteKind;
use pf::api::RuleAction;
use pf::api::RuleAddr;
use pf::api::RuleSpec;
use pf::api::RulesetClass;
use pf::api::XactEntry;
use pf::api::XactKind;
use pf::api::parse_port_spec;
use pf::api::proto;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("rule {nr}: {msg}")]
    Rule { nr: usize, msg: String },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Policy {
    pub config: PfCfg,

    /// The interfaces present on the host. Any name is accepted when
    /// empty.
    pub interfaces: Vec<String>,

    #[serde(rename = "altq")]
    pub altqs: Vec<AltqSpec>,

    #[serde(rename = "rule")]
    pub rules: Vec<PolicyRule>,
}

/// One rule as written in the policy file.
///
/// Addresses take the forms accepted by [`AddrWrap`], optionally
/// negated with a leading `!`. Ports take the forms accepted by
/// [`parse_port_spec`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyRule {
    /// The anchor the rule is loaded into; empty for the main ruleset.
    pub anchor: String,
    pub action: String,
    pub direction: Option<String>,
    /// The interface to match, negated with a leading `!`.
    pub on: String,
    pub af: Option<String>,
    pub proto: Option<String>,
    pub from: Option<String>,
    pub from_port: Option<String>,
    pub to: Option<String>,
    pub to_port: Option<String>,
    pub quick: bool,
    pub keep_state: bool,
    pub label: String,
    pub tag: String,
    /// Match packets carrying this tag, negated with a leading `!`.
    pub tagged: String,
    pub queue: String,
    pub priority_queue: String,
    /// `route-to`, `reply-to`, `dup-to` or `fastroute`.
    pub route: Option<String>,
    /// The anchor this rule evaluates.
    pub call: String,
    /// Translation or routing targets, each an address optionally
    /// preceded by an interface name, e.g. `"em1 192.0.2.1"`.
    pub pool: Vec<String>,
}

/// A rule ready to be staged: its anchor, the spec, and the pool
/// entries to stage ahead of it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedRule {
    pub anchor: String,
    pub spec: RuleSpec,
    pub pool: Vec<(AddrFamily, PoolAddrSpec)>,
}

impl Policy {
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(text)?)
    }

    /// Translate every rule, reporting the first that is malformed by
    /// its position in the file.
    pub fn staged_rules(&self) -> Result<Vec<StagedRule>, PolicyError> {
        self.rules
            .iter()
            .enumerate()
            .map(|(nr, r)| {
                r.to_staged().map_err(|msg| PolicyError::Rule { nr, msg })
            })
            .collect()
    }

    /// The anchors the policy loads, main ruleset first.
    pub fn anchors(&self) -> Vec<String> {
        let mut anchors = BTreeSet::new();
        anchors.insert(String::new());
        for r in &self.rules {
            anchors.insert(r.anchor.clone());
        }
        anchors.into_iter().collect()
    }

    /// The entries of the grouped transaction that replaces everything
    /// this policy describes. Every class of every anchor is replaced,
    /// so classes the policy leaves empty are flushed.
    pub fn xact_entries(&self) -> Vec<XactEntry> {
        let mut entries = vec![];
        for anchor in self.anchors() {
            for class in RulesetClass::ALL {
                entries.push(XactEntry::new(XactKind::Rules(class), &anchor));
            }
            entries.push(XactEntry::new(XactKind::Table, &anchor));
        }

        if !self.altqs.is_empty() {
            entries.push(XactEntry::new(XactKind::Altq, ""));
        }

        entries
    }
}

impl PolicyRule {
    pub fn to_staged(&self) -> Result<StagedRule, String> {
        let action: RuleAction = self.action.parse()?;
        let direction = self
            .direction
            .as_deref()
            .map(str::parse::<Direction>)
            .transpose()?;
        let proto = match &self.proto {
            Some(p) => proto::parse(p)?,
            None => 0,
        };
        let src = rule_addr(self.from.as_deref(), self.from_port.as_deref())?;
        let dst = rule_addr(self.to.as_deref(), self.to_port.as_deref())?;
        let (ifnot, ifname) = negated(&self.on);
        let (match_tag_not, match_tagname) = negated(&self.tagged);

        let af = match &self.af {
            Some(af) => Some(af.parse::<AddrFamily>()?),
            None => literal_family(&src.addr).or(literal_family(&dst.addr)),
        };

        let pool = self
            .pool
            .iter()
            .map(|p| pool_entry(p, af))
            .collect::<Result<Vec<_>, String>>()?;

        // A rule without an explicit family takes the family of its
        // translation targets.
        let af = af.or(pool.first().map(|(af, _)| *af));

        let rt = match self.route.as_deref() {
            None => RouteKind::None,
            Some("route-to") => RouteKind::RouteTo,
            Some("reply-to") => RouteKind::ReplyTo,
            Some("dup-to") => RouteKind::DupTo,
            Some("fastroute") => RouteKind::FastRoute,
            Some(other) => return Err(format!("invalid route: {other}")),
        };

        let spec = RuleSpec {
            action,
            direction,
            af,
            proto,
            src,
            dst,
            ifname: ifname.to_string(),
            ifnot,
            label: self.label.clone(),
            tagname: self.tag.clone(),
            match_tagname: match_tagname.to_string(),
            match_tag_not,
            qname: self.queue.clone(),
            pqname: self.priority_queue.clone(),
            quick: self.quick,
            keep_state: u8::from(self.keep_state),
            rt,
            anchor_call: self.call.clone(),
            ..Default::default()
        };

        Ok(StagedRule { anchor: self.anchor.clone(), spec, pool })
    }
}

fn negated(s: &str) -> (bool, &str) {
    match s.trim().strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, s.trim()),
    }
}

fn rule_addr(
    addr: Option<&str>,
    port: Option<&str>,
) -> Result<RuleAddr, String> {
    let mut side = RuleAddr::default();
    if let Some(addr) = addr {
        let (neg, addr) = negated(addr);
        side.neg = neg;
        side.addr = addr.parse()?;
    }

    if let Some(port) = port {
        let (op, ports) = parse_port_spec(port)?;
        side.port_op = op;
        side.port = ports;
    }

    Ok(side)
}

/// The family of a literal network other than `any`.
fn literal_family(addr: &AddrWrap) -> Option<AddrFamily> {
    match addr {
        AddrWrap::AddrMask { addr, mask } if !mask.is_unspecified() => {
            Some(AddrFamily::of(addr))
        }
        _ => None,
    }
}

fn pool_entry(
    s: &str,
    af: Option<AddrFamily>,
) -> Result<(AddrFamily, PoolAddrSpec), String> {
    let (ifname, addr) = match s.trim().split_once(char::is_whitespace) {
        Some((ifname, addr)) => (ifname, addr),
        None => ("", s),
    };
    let addr: AddrWrap = addr.parse()?;

    let af = match (&addr, af) {
        (AddrWrap::AddrMask { addr: ip, .. }, Some(af)) => {
            if AddrFamily::of(ip) != af {
                return Err(format!("pool address {ip} is not {af}"));
            }
            af
        }
        (AddrWrap::AddrMask { addr: ip, .. }, None) => AddrFamily::of(ip),
        (_, Some(af)) => af,
        (_, None) => {
            return Err(format!("pool entry {s} needs an address family"));
        }
    };

    Ok((af, PoolAddrSpec { addr, ifname: ifname.to_string() }))
}

#[cfg(test)]
mod test {
    use super::*;
    use pf::api::PortOp;

    const POLICY: &str = r#"
        interfaces = ["em0", "em1"]

        [config]
        inet6 = false
        hostid = 0x1234

        [config.timeouts]
        "tcp.established" = 3600

        [[altq]]
        ifname = "em1"
        bandwidth = 1000000

        [[rule]]
        action = "block"

        [[rule]]
        action = "pass"
        direction = "in"
        on = "em0"
        proto = "tcp"
        from = "!10.0.0.0/8"
        to = "192.0.2.0/24"
        to_port = "1000:2000"
        keep_state = true
        quick = true
        tagged = "!web"

        [[rule]]
        anchor = "lab"
        action = "nat"
        on = "em1"
        from = "10.0.0.0/8"
        pool = ["198.51.100.1"]

        [[rule]]
        action = "pass"
        route = "route-to"
        pool = ["em1 192.0.2.254"]
    "#;

    #[test]
    fn parse_policy() {
        let policy = Policy::parse(POLICY).unwrap();
        assert!(!policy.config.inet6);
        assert_eq!(policy.config.hostid, Some(0x1234));
        assert_eq!(policy.config.timeouts["tcp.established"], 3600);
        assert_eq!(policy.interfaces, vec!["em0", "em1"]);
        assert_eq!(policy.altqs.len(), 1);
        assert_eq!(policy.altqs[0].bandwidth, 1_000_000);
        assert_eq!(policy.anchors(), vec!["", "lab"]);

        let staged = policy.staged_rules().unwrap();
        assert_eq!(staged.len(), 4);
        assert_eq!(staged[0].spec.action, RuleAction::Drop);
        assert_eq!(staged[0].spec.af, None);

        let pass = &staged[1].spec;
        assert_eq!(pass.direction, Some(Direction::In));
        assert_eq!(pass.ifname, "em0");
        assert_eq!(pass.proto, proto::TCP);
        assert_eq!(pass.af, Some(AddrFamily::Inet));
        assert!(pass.src.neg);
        assert!(!pass.dst.neg);
        assert_eq!(pass.dst.port_op, PortOp::Range);
        assert_eq!(pass.dst.port, [1000, 2000]);
        assert_eq!(pass.keep_state, 1);
        assert!(pass.quick);
        assert_eq!(pass.match_tagname, "web");
        assert!(pass.match_tag_not);

        let nat = &staged[2];
        assert_eq!(nat.anchor, "lab");
        assert_eq!(nat.pool.len(), 1);
        assert_eq!(nat.pool[0].0, AddrFamily::Inet);

        let rt = &staged[3];
        assert_eq!(rt.spec.rt, RouteKind::RouteTo);
        assert_eq!(rt.spec.af, Some(AddrFamily::Inet));
        assert_eq!(rt.pool[0].1.ifname, "em1");
    }

    #[test]
    fn xact_covers_every_class() {
        let policy = Policy::parse(POLICY).unwrap();
        let entries = policy.xact_entries();
        // Five rule classes and a table entry per anchor, plus ALTQ.
        assert_eq!(entries.len(), 2 * 6 + 1);
        assert_eq!(entries.last().unwrap().kind, XactKind::Altq);
        assert!(entries.iter().all(|e| e.ticket == 0));
    }

    #[test]
    fn bad_rules_name_their_position() {
        let text = r#"
            [[rule]]
            action = "pass"

            [[rule]]
            action = "allow"
        "#;
        let policy = Policy::parse(text).unwrap();
        match policy.staged_rules() {
            Err(PolicyError::Rule { nr: 1, msg }) => {
                assert!(msg.contains("allow"));
            }
            other => panic!("expected a rule error, got {other:?}"),
        }
    }

    #[test]
    fn pool_family_checked() {
        let rule = PolicyRule {
            action: "nat".into(),
            af: Some("inet6".into()),
            pool: vec!["198.51.100.1".into()],
            ..Default::default()
        };
        assert!(rule.to_staged().is_err());

        let rule = PolicyRule {
            action: "nat".into(),
            pool: vec!["<nat-pool>".into()],
            ..Default::default()
        };
        assert!(rule.to_staged().is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let text = r#"
            [[rule]]
            action = "pass"
            keep-state = true
        "#;
        assert!(matches!(Policy::parse(text), Err(PolicyError::Parse(_))));
    }
}
