// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::AddrFamily;
use super::AddrWrap;
use super::CmdOk;
use super::RuleAction;
use serde::Deserialize;
use serde::Serialize;

/// A candidate translation/routing address.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PoolAddrSpec {
    pub addr: AddrWrap,
    /// The interface used for route-to style rules; empty for none.
    pub ifname: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddAddrReq {
    pub ticket: u64,
    pub af: AddrFamily,
    pub addr: PoolAddrSpec,
}

/// Selects the pool of an active rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PoolSelector {
    pub anchor: String,
    /// The owning rule's action, which determines its class.
    pub action: RuleAction,
    pub nr: u32,
    /// Select the last rule of the queue and ignore `nr`.
    pub last: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAddrsReq {
    pub sel: PoolSelector,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAddrsResp {
    pub nr: u32,
    /// The active ticket of the rule's ruleset.
    pub ticket: u64,
}

impl CmdOk for GetAddrsResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAddrReq {
    pub sel: PoolSelector,
    pub ticket: u64,
    pub nr: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAddrResp {
    pub af: AddrFamily,
    pub addr: PoolAddrSpec,
}

impl CmdOk for GetAddrResp {}

/// In-place modification of a rule's pool.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PoolChange {
    AddHead,
    AddTail,
    AddBefore,
    AddAfter,
    Remove,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeAddrReq {
    pub action: PoolChange,
    pub sel: PoolSelector,
    /// The active ticket of the rule's ruleset.
    pub ticket: u64,
    /// The ordinal of the pool entry the change is positioned
    /// relative to (or removes).
    pub nr: u32,
    pub af: AddrFamily,
    pub addr: Option<PoolAddrSpec>,
}
