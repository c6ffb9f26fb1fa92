// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

pub use pf_api::*;

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Engine configuration, fixed at creation time.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PfCfg {
    /// Accept IPv4 rules, addresses and states.
    pub inet: bool,
    /// Accept IPv6 rules, addresses and states.
    pub inet6: bool,
    /// The host id stamped on locally created states. A random
    /// non-zero id is chosen when absent.
    pub hostid: Option<u32>,
    pub debug: DebugLevel,
    /// Timeout overrides by name, e.g. `"tcp.established" = 3600`.
    pub timeouts: BTreeMap<String, u32>,
    /// Limit overrides by name, e.g. `"states" = 50000`.
    pub limits: BTreeMap<String, u32>,
    /// The system securelevel commands are checked against.
    pub securelevel: i32,
}

impl Default for PfCfg {
    fn default() -> Self {
        Self {
            inet: true,
            inet6: true,
            hostid: None,
            debug: DebugLevel::Urgent,
            timeouts: BTreeMap::new(),
            limits: BTreeMap::new(),
            securelevel: 0,
        }
    }
}

impl PfCfg {
    pub fn supports(&self, af: AddrFamily) -> bool {
        match af {
            AddrFamily::Inet => self.inet,
            AddrFamily::Inet6 => self.inet6,
        }
    }
}
