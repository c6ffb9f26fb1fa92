// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The state table.
//!
//! Every state is indexed three ways: by its lan/ext key (how the
//! flow looks from the inside), by its ext/gwy key (how it looks from
//! the outside, after translation), and by `(id, creatorid)`. A key
//! may be shared by states on different interfaces but never by two
//! states on the same one.
//!
//! A state holds a reference on the rules that created it and on its
//! source nodes. Those references are always dropped before the state
//! itself goes away.

use super::Pf;
use super::PfData;
use super::Result;
use super::arena::Arena;
use super::arena::Handle;
use super::rule::RuleHandle;
use super::src_node::SrcNodeHandle;
use crate::api::AddrFamily;
use crate::api::DebugLevel;
use crate::api::Direction;
use crate::api::FCNT_STATE_INSERT;
use crate::api::FCNT_STATE_REMOVALS;
use crate::api::FCNT_STATE_SEARCH;
use crate::api::GetStatesResp;
use crate::api::KillStatesReq;
use crate::api::Limit;
use crate::api::NatLookReq;
use crate::api::NatLookResp;
use crate::api::PfError;
use crate::api::StateHost;
use crate::api::StatePeerRecord;
use crate::api::StateRecord;
use crate::api::SyncFlags;
use crate::api::TIMEOUT_COUNT;
use crate::api::TIMEOUT_UNTIL_PACKET;
use crate::api::Timeout;
use crate::provider::LogLevel;
use std::collections::BTreeMap;

pub type StateHandle = Handle<State>;

#[derive(Clone, Debug)]
pub struct State {
    pub id: u64,
    pub creatorid: u32,
    pub kif: String,
    pub lan: StateHost,
    pub gwy: StateHost,
    pub ext: StateHost,
    pub src: StatePeerRecord,
    pub dst: StatePeerRecord,
    pub rule: RuleHandle,
    pub nat_rule: Option<RuleHandle>,
    pub anchor: Option<RuleHandle>,
    pub src_node: Option<SrcNodeHandle>,
    pub nat_src_node: Option<SrcNodeHandle>,
    pub af: AddrFamily,
    pub proto: u8,
    pub direction: Direction,
    pub creation: u64,
    /// The time of the last activity; the timeout runs from here.
    pub expire: u64,
    pub timeout: u8,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub log: u8,
    pub allow_opts: bool,
}

impl State {
    fn rules(&self) -> impl Iterator<Item = RuleHandle> {
        core::iter::once(self.rule).chain(self.nat_rule).chain(self.anchor)
    }

    fn src_nodes(&self) -> impl Iterator<Item = SrcNodeHandle> + use<> {
        self.src_node.into_iter().chain(self.nat_src_node)
    }
}

/// A state as the packet path creates it.
#[derive(Clone, Debug)]
pub struct NewState {
    pub kif: String,
    pub af: AddrFamily,
    pub proto: u8,
    pub direction: Direction,
    pub lan: StateHost,
    pub gwy: StateHost,
    pub ext: StateHost,
    pub rule: RuleHandle,
    pub nat_rule: Option<RuleHandle>,
    pub anchor: Option<RuleHandle>,
    pub src_node: Option<SrcNodeHandle>,
    pub nat_src_node: Option<SrcNodeHandle>,
    pub timeout: Timeout,
}

/// One view of a flow: `a` and `b` are lan and ext, or ext and gwy.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct StateKey {
    pub af: AddrFamily,
    pub proto: u8,
    pub a: StateHost,
    pub b: StateHost,
}

impl StateKey {
    fn lan_ext(s: &State) -> Self {
        Self { af: s.af, proto: s.proto, a: s.lan, b: s.ext }
    }

    fn ext_gwy(s: &State) -> Self {
        Self { af: s.af, proto: s.proto, a: s.ext, b: s.gwy }
    }
}

type KeyIndex = BTreeMap<StateKey, Vec<StateHandle>>;

fn unindex(idx: &mut KeyIndex, key: &StateKey, h: StateHandle) {
    if let Some(hs) = idx.get_mut(key) {
        hs.retain(|x| *x != h);
        if hs.is_empty() {
            idx.remove(key);
        }
    }
}

#[derive(Debug)]
pub struct StateTable {
    states: Arena<State>,
    lan_ext: KeyIndex,
    ext_gwy: KeyIndex,
    by_id: BTreeMap<(u64, u32), StateHandle>,
    next_id: u64,
}

impl StateTable {
    /// State ids are seeded from the clock so that ids stay unique
    /// across restarts.
    pub fn new(now: u64) -> Self {
        Self {
            states: Arena::default(),
            lan_ext: BTreeMap::new(),
            ext_gwy: BTreeMap::new(),
            by_id: BTreeMap::new(),
            next_id: now << 32,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn get(&self, h: StateHandle) -> Option<&State> {
        self.states.get(h)
    }

    pub fn contains(&self, h: StateHandle) -> bool {
        self.states.contains(h)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// States in `(id, creatorid)` order.
    pub fn iter(&self) -> impl Iterator<Item = (StateHandle, &State)> {
        self.by_id
            .values()
            .filter_map(|h| self.states.get(*h).map(|s| (*h, s)))
    }

    pub fn find_by_id(&self, id: u64, creatorid: u32) -> Option<StateHandle> {
        self.by_id.get(&(id, creatorid)).copied()
    }

    /// Does a state on `kif` already hold `key`?
    fn clashes(&self, ext_gwy: bool, key: &StateKey, kif: &str) -> bool {
        self.lookup(ext_gwy, key)
            .iter()
            .any(|h| self.states.get(*h).is_some_and(|s| s.kif == kif))
    }

    fn insert(&mut self, st: State) -> Result<StateHandle> {
        let le = StateKey::lan_ext(&st);
        let eg = StateKey::ext_gwy(&st);

        if self.clashes(false, &le, &st.kif)
            || self.clashes(true, &eg, &st.kif)
        {
            return Err(PfError::Exists(format!(
                "state {} -> {} on {} exists",
                st.lan, st.ext, st.kif
            )));
        }
        if self.by_id.contains_key(&(st.id, st.creatorid)) {
            return Err(PfError::Exists(format!(
                "state id {:016x}/{:08x} exists",
                st.id, st.creatorid
            )));
        }

        let id = (st.id, st.creatorid);
        let h = self.states.insert(st);
        self.lan_ext.entry(le).or_default().push(h);
        self.ext_gwy.entry(eg).or_default().push(h);
        self.by_id.insert(id, h);
        Ok(h)
    }

    fn remove(&mut self, h: StateHandle) -> Option<State> {
        let st = self.states.remove(h)?;
        unindex(&mut self.lan_ext, &StateKey::lan_ext(&st), h);
        unindex(&mut self.ext_gwy, &StateKey::ext_gwy(&st), h);
        self.by_id.remove(&(st.id, st.creatorid));
        Some(st)
    }

    fn lookup(&self, ext_gwy: bool, key: &StateKey) -> &[StateHandle] {
        let idx = if ext_gwy { &self.ext_gwy } else { &self.lan_ext };
        idx.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Drop a state's link to any source node in `doomed`.
    pub(crate) fn unlink_src_nodes(
        &mut self,
        doomed: impl Fn(SrcNodeHandle) -> bool,
    ) {
        for (_, st) in self.states.iter_mut() {
            if st.src_node.is_some_and(&doomed) {
                st.src_node = None;
            }
            if st.nat_src_node.is_some_and(&doomed) {
                st.nat_src_node = None;
            }
        }
    }
}

fn secs(d: u64) -> u32 {
    u32::try_from(d).unwrap_or(u32::MAX)
}

impl PfData {
    /// Insert a fully built state, taking its interface, rule and
    /// source-node references.
    fn insert_state_entry(&mut self, st: State) -> Result<StateHandle> {
        let limit = self.tunables.limit(Limit::States) as usize;
        if self.states.len() >= limit {
            self.log(
                DebugLevel::Misc,
                LogLevel::Warn,
                &format!("state limit {limit} reached"),
            );
            return Err(PfError::ResourceExhausted(format!(
                "state limit {limit} reached"
            )));
        }

        if let Some(h) = st.rules().find(|h| !self.rules.contains(*h)) {
            return Err(PfError::NotFound(format!("rule {h:?}")));
        }
        let mut nodes = st.src_nodes();
        if let Some(h) = nodes.find(|h| !self.src_nodes.contains(*h)) {
            return Err(PfError::NotFound(format!("source node {h:?}")));
        }

        if !self.ectx.ifaces.exists(&st.kif) {
            return Err(PfError::NotFound(format!(
                "no such interface: {}",
                st.kif
            )));
        }
        self.ectx.ifaces.kif_ref(&st.kif)?;

        let rules: Vec<RuleHandle> = st.rules().collect();
        let nodes: Vec<SrcNodeHandle> = st.src_nodes().collect();
        let kif = st.kif.clone();
        let h = match self.states.insert(st) {
            Ok(h) => h,
            Err(e) => {
                self.ectx.ifaces.kif_unref(&kif);
                return Err(e);
            }
        };

        for r in rules {
            self.rule_ref(r)?;
        }
        for n in nodes {
            self.src_node_ref(n);
        }
        self.status.fcounters[FCNT_STATE_INSERT] += 1;
        Ok(h)
    }

    /// Remove a state, dropping its references first.
    pub(crate) fn unlink_state(&mut self, h: StateHandle, now: u64) -> bool {
        let Some(st) = self.states.remove(h) else {
            return false;
        };

        for n in st.src_nodes() {
            self.src_node_unref(n, now);
        }
        for r in st.rules() {
            self.rule_unref(r);
        }
        self.ectx.ifaces.kif_unref(&st.kif);
        self.status.fcounters[FCNT_STATE_REMOVALS] += 1;
        true
    }

    fn deadline(&self, st: &State, now: u64) -> Option<u64> {
        self.tunables.deadline(
            st.expire,
            st.timeout,
            self.states.len() as u32,
            now,
        )
    }

    pub(crate) fn purge_states(&mut self, now: u64) -> u32 {
        let doomed: Vec<StateHandle> = self
            .states
            .iter()
            .filter(|(_, st)| {
                self.deadline(st, now).is_some_and(|d| d <= now)
            })
            .map(|(h, _)| h)
            .collect();

        let mut n = 0;
        for h in doomed {
            if self.unlink_state(h, now) {
                n += 1;
            }
        }
        n
    }

    fn remove_states_where(&mut self, f: impl Fn(&State) -> bool) -> u32 {
        let now = self.now();
        let doomed: Vec<StateHandle> = self
            .states
            .iter()
            .filter(|(_, st)| f(st))
            .map(|(h, _)| h)
            .collect();

        let mut n = 0;
        for h in doomed {
            if self.unlink_state(h, now) {
                n += 1;
            }
        }
        n
    }

    /// Remove every state on `ifname`, or every state when it is
    /// empty.
    pub(crate) fn clear_states(&mut self, ifname: &str) -> u32 {
        self.remove_states_where(|st| ifname.is_empty() || st.kif == ifname)
    }

    pub(crate) fn kill_states(&mut self, req: &KillStatesReq) -> u32 {
        self.remove_states_where(|st| {
            req.af.is_none_or(|af| af == st.af)
                && (req.proto == 0 || req.proto == st.proto)
                && req.src.matches(&st.lan)
                && req.dst.matches(&st.ext)
                && (req.ifname.is_empty() || req.ifname == st.kif)
        })
    }

    fn rule_nr(&self, h: Option<RuleHandle>) -> Option<u32> {
        self.rules.get(h?)?.nr
    }

    pub(crate) fn export_state(&self, st: &State, now: u64) -> StateRecord {
        let expire = self
            .deadline(st, now)
            .map(|d| secs(d.saturating_sub(now)))
            .unwrap_or(0);

        let mut sync_flags = SyncFlags::empty();
        sync_flags.set(SyncFlags::SRCNODE, st.src_node.is_some());
        sync_flags.set(SyncFlags::NATSRCNODE, st.nat_src_node.is_some());

        StateRecord {
            id: st.id,
            creatorid: st.creatorid,
            ifname: st.kif.clone(),
            lan: st.lan,
            gwy: st.gwy,
            ext: st.ext,
            src: st.src,
            dst: st.dst,
            rule: self.rule_nr(Some(st.rule)),
            nat_rule: self.rule_nr(st.nat_rule),
            anchor: self.rule_nr(st.anchor),
            af: st.af,
            proto: st.proto,
            direction: st.direction,
            creation: secs(now.saturating_sub(st.creation)),
            expire,
            packets: st.packets,
            bytes: st.bytes,
            log: st.log,
            allow_opts: st.allow_opts,
            timeout: st.timeout,
            sync_flags,
        }
    }

    /// Import a synchronization record. The peer's rules are not
    /// ours, so the state is bound to the default rule.
    pub(crate) fn import_state(&mut self, rec: StateRecord) -> Result<()> {
        if usize::from(rec.timeout) >= TIMEOUT_COUNT
            && rec.timeout != TIMEOUT_UNTIL_PACKET
        {
            return Err(PfError::InvalidArgument(format!(
                "bad timeout class {}",
                rec.timeout
            )));
        }
        if !self.cfg.supports(rec.af) {
            return Err(PfError::Unsupported(rec.af));
        }

        let now = self.now();
        let (id, creatorid) = if rec.id == 0 && rec.creatorid == 0 {
            (self.states.next_id(), self.status.hostid)
        } else {
            (rec.id, rec.creatorid)
        };

        let expire = if rec.expire > 0 {
            let timeout = Timeout::from_index(usize::from(rec.timeout))
                .map(|t| u64::from(self.tunables.timeout(t)))
                .unwrap_or(0);
            (now + u64::from(rec.expire)).saturating_sub(timeout)
        } else {
            now
        };

        let st = State {
            id,
            creatorid,
            kif: rec.ifname,
            lan: rec.lan,
            gwy: rec.gwy,
            ext: rec.ext,
            src: rec.src,
            dst: rec.dst,
            rule: self.default_rule,
            nat_rule: None,
            anchor: None,
            src_node: None,
            nat_src_node: None,
            af: rec.af,
            proto: rec.proto,
            direction: rec.direction,
            creation: now.saturating_sub(u64::from(rec.creation)),
            expire,
            timeout: rec.timeout,
            packets: rec.packets,
            bytes: rec.bytes,
            log: rec.log,
            allow_opts: rec.allow_opts,
        };

        self.insert_state_entry(st).map(|_| ())
    }

    /// Find the state a proxied connection belongs to. The tuple is
    /// given as the reply would carry it: inbound lookups search the
    /// outside view, outbound ones the inside view.
    pub(crate) fn natlook(
        &mut self,
        req: &NatLookReq,
    ) -> Result<NatLookResp> {
        if req.proto == 0
            || req.saddr.is_unspecified()
            || req.daddr.is_unspecified()
            || req.sport == 0
            || req.dport == 0
        {
            return Err(PfError::InvalidArgument(
                "incomplete lookup tuple".to_string(),
            ));
        }

        self.status.fcounters[FCNT_STATE_SEARCH] += 1;
        let src = StateHost::new(req.saddr, req.sport);
        let dst = StateHost::new(req.daddr, req.dport);
        let key = StateKey { af: req.af, proto: req.proto, a: dst, b: src };
        let ext_gwy = req.direction == Direction::In;

        let found = self.states.lookup(ext_gwy, &key);
        let st = match found {
            [] => {
                return Err(PfError::NotFound("no matching state".to_string()));
            }
            [h] => self.states.get(*h).ok_or_else(|| {
                PfError::NotFound("no matching state".to_string())
            })?,
            many => return Err(PfError::Ambiguous(many.len() as u32)),
        };

        let (rs, rd) = match req.direction {
            Direction::In => (st.lan, dst),
            Direction::Out => (src, st.gwy),
        };

        Ok(NatLookResp {
            rsaddr: rs.addr,
            rsport: rs.port,
            rdaddr: rd.addr,
            rdport: rd.port,
        })
    }

    fn insert_new_state(&mut self, ns: NewState) -> Result<(u64, u32)> {
        if !self.cfg.supports(ns.af) {
            return Err(PfError::Unsupported(ns.af));
        }

        let now = self.now();
        let id = self.states.next_id();
        let creatorid = self.status.hostid;
        let st = State {
            id,
            creatorid,
            kif: ns.kif,
            lan: ns.lan,
            gwy: ns.gwy,
            ext: ns.ext,
            src: StatePeerRecord::default(),
            dst: StatePeerRecord::default(),
            rule: ns.rule,
            nat_rule: ns.nat_rule,
            anchor: ns.anchor,
            src_node: ns.src_node,
            nat_src_node: ns.nat_src_node,
            af: ns.af,
            proto: ns.proto,
            direction: ns.direction,
            creation: now,
            expire: now,
            timeout: ns.timeout as u8,
            packets: [0; 2],
            bytes: [0; 2],
            log: 0,
            allow_opts: false,
        };

        self.insert_state_entry(st)?;
        Ok((id, creatorid))
    }
}

impl Pf {
    /// Create a state for a new flow, returning its `(id, creatorid)`.
    pub fn insert_state(&self, ns: NewState) -> Result<(u64, u32)> {
        self.lock().insert_new_state(ns)
    }

    pub fn add_state(&self, rec: StateRecord) -> Result<()> {
        self.lock().import_state(rec)
    }

    /// Import a batch of records, stopping at the first failure.
    pub fn add_states(&self, recs: Vec<StateRecord>) -> Result<u32> {
        let mut data = self.lock();
        let mut added = 0;
        for rec in recs {
            data.import_state(rec)?;
            added += 1;
        }
        Ok(added)
    }

    /// Export the `nr`th state in id order.
    pub fn get_state(&self, nr: u32) -> Result<StateRecord> {
        let data = self.lock();
        let now = data.now();
        data.states
            .iter()
            .nth(nr as usize)
            .map(|(_, st)| data.export_state(st, now))
            .ok_or_else(|| PfError::NotFound(format!("no state {nr}")))
    }

    pub fn get_states(&self, max: Option<u32>) -> GetStatesResp {
        let data = self.lock();
        let now = data.now();
        let max = max.map(|m| m as usize).unwrap_or(usize::MAX);
        let states = data
            .states
            .iter()
            .take(max)
            .map(|(_, st)| data.export_state(st, now))
            .collect();
        GetStatesResp { total: data.states.len() as u32, states }
    }

    pub fn clear_states(&self, ifname: &str) -> u32 {
        self.lock().clear_states(ifname)
    }

    pub fn kill_states(&self, req: &KillStatesReq) -> u32 {
        self.lock().kill_states(req)
    }

    pub fn natlook(&self, req: &NatLookReq) -> Result<NatLookResp> {
        self.lock().natlook(req)
    }

    pub fn state_count(&self) -> usize {
        self.lock().states.len()
    }
}

cfg_if! {
    if #[cfg(any(feature = "test-help", test))] {
        impl Pf {
            /// Is the state `(id, creatorid)` still in the table?
            pub fn has_state(&self, id: u64, creatorid: u32) -> bool {
                self.lock().states.find_by_id(id, creatorid).is_some()
            }

            /// The absolute expiry deadline of a state.
            pub fn state_deadline(
                &self,
                id: u64,
                creatorid: u32,
            ) -> Option<u64> {
                let data = self.lock();
                let h = data.states.find_by_id(id, creatorid)?;
                let st = data.states.get(h)?;
                data.deadline(st, data.now())
            }
        }
    }
}
