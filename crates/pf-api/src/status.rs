// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::CmdOk;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The bounded pools, indexed by their discriminant.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Limit {
    States = 0,
    SrcNodes = 1,
    Frags = 2,
    Tables = 3,
    TableEntries = 4,
}

pub const LIMIT_COUNT: usize = 5;

impl Limit {
    pub const ALL: [Self; LIMIT_COUNT] = [
        Self::States,
        Self::SrcNodes,
        Self::Frags,
        Self::Tables,
        Self::TableEntries,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::States => "states",
            Self::SrcNodes => "src-nodes",
            Self::Frags => "frags",
            Self::Tables => "tables",
            Self::TableEntries => "table-entries",
        }
    }

    pub fn default_limit(self) -> u32 {
        match self {
            Self::States => 10000,
            Self::SrcNodes => 10000,
            Self::Frags => 5000,
            Self::Tables => 1000,
            Self::TableEntries => 200000,
        }
    }
}

impl FromStr for Limit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|l| l.name() == s)
            .copied()
            .ok_or_else(|| format!("invalid limit: {s}"))
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum DebugLevel {
    None = 0,
    #[default]
    Urgent = 1,
    Misc = 2,
    Noisy = 3,
}

impl FromStr for DebugLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "urgent" => Ok(Self::Urgent),
            "misc" => Ok(Self::Misc),
            "loud" | "noisy" => Ok(Self::Noisy),
            _ => Err(format!("invalid debug level: {s}")),
        }
    }
}

impl Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Urgent => "urgent",
            Self::Misc => "misc",
            Self::Noisy => "loud",
        };
        write!(f, "{s}")
    }
}

/// Counter slots for state-table activity.
pub const FCNT_STATE_SEARCH: usize = 0;
pub const FCNT_STATE_INSERT: usize = 1;
pub const FCNT_STATE_REMOVALS: usize = 2;
pub const FCNT_MAX: usize = 3;

/// Counter slots for source-node activity.
pub const SCNT_SRC_NODE_SEARCH: usize = 0;
pub const SCNT_SRC_NODE_INSERT: usize = 1;
pub const SCNT_SRC_NODE_REMOVALS: usize = 2;
pub const SCNT_MAX: usize = 3;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PfStatus {
    pub running: bool,
    /// Seconds since epoch at which the filter was last started or
    /// stopped.
    pub since: u64,
    pub debug: DebugLevel,
    pub hostid: u32,
    pub states: u32,
    pub src_nodes: u32,
    pub fcounters: [u64; FCNT_MAX],
    pub scounters: [u64; SCNT_MAX],
    /// The sync digest of the active main ruleset.
    pub checksum: [u8; 16],
    /// The interface statistics are gathered for; empty for none.
    pub ifname: String,
}

impl CmdOk for PfStatus {}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetStatusIfReq {
    pub ifname: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetTimeoutReq {
    pub timeout: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetTimeoutReq {
    pub timeout: u32,
    pub seconds: u32,
}

/// A timeout value; for a set, the previous value.
#[derive(Debug, Deserialize, Serialize)]
pub struct TimeoutResp {
    pub seconds: u32,
}

impl CmdOk for TimeoutResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetLimitReq {
    pub index: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetLimitReq {
    pub index: u32,
    pub limit: u32,
}

/// A limit value; for a set, the previous value.
#[derive(Debug, Deserialize, Serialize)]
pub struct LimitResp {
    pub limit: u32,
}

impl CmdOk for LimitResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetDebugReq {
    pub level: DebugLevel,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetHostIdReq {
    pub hostid: u32,
}
