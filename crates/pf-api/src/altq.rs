// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::CmdOk;
use serde::Deserialize;
use serde::Serialize;

/// A queueing discipline (empty `qname`) or a queue within one.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct AltqSpec {
    pub ifname: String,
    pub qname: String,
    pub parent: String,
    pub scheduler: u8,
    pub bandwidth: u32,
    pub tbrsize: u32,
    pub priority: u8,
    pub qlimit: u16,
    /// Assigned by the engine when the queue is staged.
    pub qid: u32,
}

impl AltqSpec {
    pub fn is_discipline(&self) -> bool {
        self.qname.is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddAltqReq {
    pub ticket: u64,
    pub altq: AltqSpec,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AltqXactReq {
    pub ticket: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAltqsResp {
    pub nr: u32,
    pub ticket: u64,
}

impl CmdOk for GetAltqsResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAltqReq {
    pub ticket: u64,
    pub nr: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetAltqResp {
    pub altq: AltqSpec,
}

impl CmdOk for GetAltqResp {}
