// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::CmdOk;
use super::RulesetClass;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// What a grouped transaction entry operates on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum XactKind {
    Rules(RulesetClass),
    Altq,
    Table,
}

impl Display for XactKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Rules(class) => write!(f, "{class}"),
            Self::Altq => write!(f, "altq"),
            Self::Table => write!(f, "table"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct XactEntry {
    pub kind: XactKind,
    pub anchor: String,
    /// Filled in by a begin; supplied by the caller for rollback and
    /// commit.
    pub ticket: u64,
}

impl XactEntry {
    pub fn new(kind: XactKind, anchor: &str) -> Self {
        Self { kind, anchor: anchor.to_string(), ticket: 0 }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct XactReq {
    pub entries: Vec<XactEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct XactResp {
    pub entries: Vec<XactEntry>,
}

impl CmdOk for XactResp {}
