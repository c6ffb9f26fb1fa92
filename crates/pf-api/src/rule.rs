// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::AddrFamily;
use super::CmdOk;
use super::Direction;
use super::PortOp;
use super::RuleAddr;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The action a rule takes when it matches.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum RuleAction {
    #[default]
    Pass = 0,
    Drop = 1,
    Scrub = 2,
    NoScrub = 3,
    Nat = 4,
    NoNat = 5,
    Binat = 6,
    NoBinat = 7,
    Rdr = 8,
    NoRdr = 9,
}

impl RuleAction {
    /// The ruleset class a rule with this action lives in.
    pub fn class(self) -> RulesetClass {
        match self {
            Self::Scrub | Self::NoScrub => RulesetClass::Scrub,
            Self::Pass | Self::Drop => RulesetClass::Filter,
            Self::Nat | Self::NoNat => RulesetClass::Nat,
            Self::Binat | Self::NoBinat => RulesetClass::Binat,
            Self::Rdr | Self::NoRdr => RulesetClass::Rdr,
        }
    }

    /// Does this action rewrite addresses (and so need a pool)?
    pub fn is_translation(self) -> bool {
        matches!(self, Self::Nat | Self::Rdr | Self::Binat)
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "block" | "drop" => Ok(Self::Drop),
            "scrub" => Ok(Self::Scrub),
            "no-scrub" => Ok(Self::NoScrub),
            "nat" => Ok(Self::Nat),
            "no-nat" => Ok(Self::NoNat),
            "binat" => Ok(Self::Binat),
            "no-binat" => Ok(Self::NoBinat),
            "rdr" => Ok(Self::Rdr),
            "no-rdr" => Ok(Self::NoRdr),
            _ => Err(format!("invalid rule action: {s}")),
        }
    }
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Drop => "block",
            Self::Scrub => "scrub",
            Self::NoScrub => "no scrub",
            Self::Nat => "nat",
            Self::NoNat => "no nat",
            Self::Binat => "binat",
            Self::NoBinat => "no binat",
            Self::Rdr => "rdr",
            Self::NoRdr => "no rdr",
        };
        write!(f, "{s}")
    }
}

/// The rule classes; each ruleset holds one active/inactive queue
/// pair per class.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum RulesetClass {
    Scrub = 0,
    Filter = 1,
    Nat = 2,
    Binat = 3,
    Rdr = 4,
}

impl RulesetClass {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] =
        [Self::Scrub, Self::Filter, Self::Nat, Self::Binat, Self::Rdr];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for RulesetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scrub" => Ok(Self::Scrub),
            "filter" => Ok(Self::Filter),
            "nat" => Ok(Self::Nat),
            "binat" => Ok(Self::Binat),
            "rdr" => Ok(Self::Rdr),
            _ => Err(format!("invalid ruleset class: {s}")),
        }
    }
}

impl Display for RulesetClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Scrub => "scrub",
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Binat => "binat",
            Self::Rdr => "rdr",
        };
        write!(f, "{s}")
    }
}

/// Policy routing applied by a rule.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub enum RouteKind {
    #[default]
    None = 0,
    FastRoute = 1,
    RouteTo = 2,
    DupTo = 3,
    ReplyTo = 4,
}

/// A uid/gid match: one or two ids and an operator.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct IdMatch {
    pub ids: [u32; 2],
    pub op: PortOp,
}

/// A rule as submitted by a management client.
///
/// Names (interface, tags, queues) are resolved by the engine when the
/// rule is staged.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RuleSpec {
    pub action: RuleAction,
    pub direction: Option<Direction>,
    pub af: Option<AddrFamily>,
    pub proto: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub src: RuleAddr,
    pub dst: RuleAddr,
    pub ifname: String,
    pub ifnot: bool,
    pub label: String,
    pub tagname: String,
    pub match_tagname: String,
    pub match_tag_not: bool,
    pub qname: String,
    pub pqname: String,
    pub quick: bool,
    pub keep_state: u8,
    pub natpass: bool,
    pub log: u8,
    pub flags: u8,
    pub flagset: u8,
    pub allow_opts: bool,
    pub rt: RouteKind,
    pub tos: u8,
    pub prob: u32,
    pub os_fingerprint: u32,
    pub uid: IdMatch,
    pub gid: IdMatch,
    pub rule_flag: u32,
    pub return_icmp: u16,
    /// The anchor this rule evaluates, relative to the rule's own
    /// ruleset unless it begins with `/`. A trailing `/*` evaluates
    /// every child of the anchor.
    pub anchor_call: String,
}

/// The number of skip-step fields kept per rule.
pub const SKIP_COUNT: usize = 8;

/// Names of the skip-step fields, in index order.
pub const SKIP_NAMES: [&str; SKIP_COUNT] =
    ["i", "d", "f", "p", "sa", "sp", "da", "dp"];

/// An active or inactive rule as reported back to a client.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuleDump {
    pub nr: u32,
    pub spec: RuleSpec,
    pub tag: u16,
    pub match_tag: u16,
    pub qid: u32,
    pub pqid: u32,
    pub evaluations: u64,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub states: u32,
    pub src_nodes: u32,
    pub pool_len: u32,
    /// For each field, the `nr` of the next rule that differs in it;
    /// `None` when no later rule differs.
    pub skip: [Option<u32>; SKIP_COUNT],
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BeginRulesReq {
    pub anchor: String,
    pub class: RulesetClass,
}

/// A freshly issued transaction ticket.
#[derive(Debug, Deserialize, Serialize)]
pub struct TicketResp {
    pub ticket: u64,
}

impl CmdOk for TicketResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddRuleReq {
    pub anchor: String,
    pub ticket: u64,
    /// When set, the currently staged pool addresses are moved into
    /// the rule. Must match the open pool ticket.
    pub pool_ticket: Option<u64>,
    pub rule: RuleSpec,
}

/// Commit or roll back a single `(anchor, class)` transaction.
#[derive(Debug, Deserialize, Serialize)]
pub struct RulesXactReq {
    pub anchor: String,
    pub class: RulesetClass,
    pub ticket: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesReq {
    pub anchor: String,
    pub class: RulesetClass,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesResp {
    /// The number of rules in the active queue.
    pub nr: u32,
    /// The active ticket, needed by [`GetRuleReq`] and
    /// [`ChangeRuleReq`].
    pub ticket: u64,
}

impl CmdOk for GetRulesResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRuleReq {
    pub anchor: String,
    pub class: RulesetClass,
    pub ticket: u64,
    pub nr: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRuleResp {
    pub rule: RuleDump,
}

impl CmdOk for GetRuleResp {}

/// In-place modification of an active queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RuleChange {
    AddHead,
    AddTail,
    AddBefore,
    AddAfter,
    Remove,
    GetTicket,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeRuleReq {
    pub action: RuleChange,
    pub anchor: String,
    pub class: RulesetClass,
    pub ticket: u64,
    pub pool_ticket: Option<u64>,
    /// The rule the change is positioned relative to (or removes).
    pub nr: u32,
    pub rule: Option<RuleSpec>,
}

/// The active ticket after a [`ChangeRuleReq`].
#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeRuleResp {
    pub ticket: u64,
}

impl CmdOk for ChangeRuleResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesetsReq {
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesetsResp {
    pub nr: u32,
}

impl CmdOk for GetRulesetsResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesetReq {
    pub path: String,
    pub nr: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRulesetResp {
    pub name: String,
}

impl CmdOk for GetRulesetResp {}
