// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Filter status, timeouts and pool limits.

use super::Pf;
use super::PfData;
use super::Result;
use crate::api::DebugLevel;
use crate::api::FCNT_MAX;
use crate::api::IFNAMSIZ;
use crate::api::LIMIT_COUNT;
use crate::api::Limit;
use crate::api::PfCfg;
use crate::api::PfError;
use crate::api::PfStatus;
use crate::api::SCNT_MAX;
use crate::api::TIMEOUT_COUNT;
use crate::api::TIMEOUT_PURGE;
use crate::api::TIMEOUT_UNTIL_PACKET;
use crate::api::Timeout;
use crate::provider::LogLevel;

#[derive(Debug)]
pub struct StatusData {
    pub running: bool,
    pub since: u64,
    pub debug: DebugLevel,
    pub hostid: u32,
    pub fcounters: [u64; FCNT_MAX],
    pub scounters: [u64; SCNT_MAX],
    pub checksum: [u8; 16],
    pub ifname: String,
}

fn random_hostid() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}

impl StatusData {
    pub fn new(cfg: &PfCfg, now: u64) -> Self {
        Self {
            running: false,
            since: now,
            debug: cfg.debug,
            hostid: cfg
                .hostid
                .filter(|id| *id != 0)
                .unwrap_or_else(random_hostid),
            fcounters: [0; FCNT_MAX],
            scounters: [0; SCNT_MAX],
            checksum: [0; 16],
            ifname: String::new(),
        }
    }
}

/// The runtime-adjustable timeouts and limits.
#[derive(Clone, Debug)]
pub struct Tunables {
    pub timeouts: [u32; TIMEOUT_COUNT],
    pub limits: [u32; LIMIT_COUNT],
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            timeouts: Timeout::ALL.map(Timeout::default_secs),
            limits: Limit::ALL.map(Limit::default_limit),
        }
    }
}

impl Tunables {
    /// The defaults with the overrides named in `cfg` applied.
    pub fn from_cfg(cfg: &PfCfg) -> Result<Self> {
        let mut t = Self::default();

        for (name, secs) in &cfg.timeouts {
            let timeout =
                name.parse::<Timeout>().map_err(PfError::InvalidArgument)?;
            t.timeouts[timeout.index()] = *secs;
        }

        for (name, limit) in &cfg.limits {
            let l = name.parse::<Limit>().map_err(PfError::InvalidArgument)?;
            t.limits[l.index()] = *limit;
        }

        Ok(t)
    }

    pub fn timeout(&self, t: Timeout) -> u32 {
        self.timeouts[t.index()]
    }

    pub fn limit(&self, l: Limit) -> u32 {
        self.limits[l.index()]
    }

    /// When a state last touched at `expire` with timeout class
    /// `class` expires, given `states` live states. `None` means
    /// never.
    ///
    /// Once the table holds more than `adaptive.start` states, the
    /// timeout is scaled down linearly, reaching zero at
    /// `adaptive.end`.
    pub fn deadline(
        &self,
        expire: u64,
        class: u8,
        states: u32,
        now: u64,
    ) -> Option<u64> {
        if class == TIMEOUT_UNTIL_PACKET {
            return None;
        }
        if class == TIMEOUT_PURGE {
            return Some(now);
        }

        let timeout = Timeout::from_index(usize::from(class))?;
        let secs = u64::from(self.timeout(timeout));
        let start = u64::from(self.timeout(Timeout::AdaptiveStart));
        let end = u64::from(self.timeout(Timeout::AdaptiveEnd));
        let states = u64::from(states);

        if end > 0 && start < end && states > start {
            if states >= end {
                return Some(now);
            }
            return Some(expire + secs * (end - states) / (end - start));
        }

        Some(expire + secs)
    }
}

impl PfData {
    fn limit_in_use(&self, l: Limit) -> u32 {
        match l {
            Limit::States => self.states.len() as u32,
            Limit::SrcNodes => self.src_nodes.len() as u32,
            Limit::Tables | Limit::TableEntries => self.ectx.tables.in_use(l),
            Limit::Frags => 0,
        }
    }

    pub(crate) fn status(&self) -> PfStatus {
        let s = &self.status;
        PfStatus {
            running: s.running,
            since: s.since,
            debug: s.debug,
            hostid: s.hostid,
            states: self.states.len() as u32,
            src_nodes: self.src_nodes.len() as u32,
            fcounters: s.fcounters,
            scounters: s.scounters,
            checksum: s.checksum,
            ifname: s.ifname.clone(),
        }
    }
}

impl Pf {
    pub fn start(&self) -> Result<()> {
        let mut data = self.lock();
        if data.status.running {
            return Err(PfError::Exists("already running".to_string()));
        }
        data.status.running = true;
        data.status.since = data.now();
        data.log(DebugLevel::Misc, LogLevel::Note, "pf: started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut data = self.lock();
        if !data.status.running {
            return Err(PfError::NotFound("not running".to_string()));
        }
        data.status.running = false;
        data.status.since = data.now();
        data.log(DebugLevel::Misc, LogLevel::Note, "pf: stopped");
        Ok(())
    }

    pub fn status(&self) -> PfStatus {
        self.lock().status()
    }

    /// Zero the status counters.
    pub fn clear_status(&self) {
        let mut data = self.lock();
        data.status.fcounters = [0; FCNT_MAX];
        data.status.scounters = [0; SCNT_MAX];
        data.status.since = data.now();
    }

    /// Name the interface statistics are kept for; empty for none.
    pub fn set_status_if(&self, ifname: &str) -> Result<()> {
        let mut data = self.lock();
        if !ifname.is_empty()
            && (ifname.len() >= IFNAMSIZ || !data.ectx.ifaces.exists(ifname))
        {
            return Err(PfError::InvalidArgument(format!(
                "no such interface: {ifname}"
            )));
        }
        data.status.ifname = ifname.to_string();
        Ok(())
    }

    pub fn get_timeout(&self, idx: u32) -> Result<u32> {
        let t = timeout_at(idx)?;
        Ok(self.lock().tunables.timeout(t))
    }

    /// Set a timeout, returning its old value. An interval of zero
    /// would stop purging, so it is raised to one.
    pub fn set_timeout(&self, idx: u32, mut secs: u32) -> Result<u32> {
        let t = timeout_at(idx)?;
        if t == Timeout::Interval && secs == 0 {
            secs = 1;
        }
        let mut data = self.lock();
        let old = data.tunables.timeouts[t.index()];
        data.tunables.timeouts[t.index()] = secs;
        Ok(old)
    }

    pub fn get_limit(&self, idx: u32) -> Result<u32> {
        let l = limit_at(idx)?;
        Ok(self.lock().tunables.limit(l))
    }

    /// Set a pool limit, returning its old value. A limit below the
    /// pool's current use is refused.
    pub fn set_limit(&self, idx: u32, limit: u32) -> Result<u32> {
        let l = limit_at(idx)?;
        let mut data = self.lock();
        let used = data.limit_in_use(l);
        if limit < used {
            return Err(PfError::Busy(format!(
                "{} limit {limit} is below current use {used}",
                l.name()
            )));
        }
        if matches!(l, Limit::Tables | Limit::TableEntries) {
            data.ectx.tables.set_limit(l, limit)?;
        }
        let old = data.tunables.limits[l.index()];
        data.tunables.limits[l.index()] = limit;
        Ok(old)
    }

    pub fn set_debug(&self, level: DebugLevel) {
        let mut data = self.lock();
        data.status.debug = level;
        data.log(
            DebugLevel::Urgent,
            LogLevel::Note,
            &format!("pf: debug level set to {level}"),
        );
    }

    pub fn set_hostid(&self, hostid: u32) -> Result<()> {
        if hostid == 0 {
            return Err(PfError::InvalidArgument("hostid 0".to_string()));
        }
        self.lock().status.hostid = hostid;
        Ok(())
    }
}

fn timeout_at(idx: u32) -> Result<Timeout> {
    Timeout::from_index(idx as usize).ok_or_else(|| {
        PfError::InvalidArgument(format!("bad timeout index {idx}"))
    })
}

fn limit_at(idx: u32) -> Result<Limit> {
    Limit::from_index(idx as usize).ok_or_else(|| {
        PfError::InvalidArgument(format!("bad limit index {idx}"))
    })
}
