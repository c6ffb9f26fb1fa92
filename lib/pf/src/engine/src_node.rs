// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Source tracking.
//!
//! A source node records the states created from one source address,
//! and for sticky translation the address it was mapped to. A node is
//! keyed by its address together with the rule that asked for
//! tracking, and holds a reference on that rule. It starts expiring
//! only once its last state is gone.

use super::Pf;
use super::PfData;
use super::Result;
use super::arena::Arena;
use super::arena::Handle;
use super::rule::RuleHandle;
use crate::api::AddrFamily;
use crate::api::DebugLevel;
use crate::api::KillSrcNodesReq;
use crate::api::Limit;
use crate::api::MatchNet;
use crate::api::PfError;
use crate::api::SCNT_SRC_NODE_INSERT;
use crate::api::SCNT_SRC_NODE_REMOVALS;
use crate::api::SCNT_SRC_NODE_SEARCH;
use crate::api::SrcNodeDump;
use crate::api::Timeout;
use crate::provider::LogLevel;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub type SrcNodeHandle = Handle<SrcNode>;

#[derive(Clone, Debug)]
pub struct SrcNode {
    pub addr: IpAddr,
    pub raddr: Option<IpAddr>,
    pub af: AddrFamily,
    pub rule: Option<RuleHandle>,
    pub states: u32,
    pub conn: u32,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub creation: u64,
    /// Zero while states are attached.
    pub expire: u64,
}

type NodeKey = (Option<RuleHandle>, IpAddr);

#[derive(Debug, Default)]
pub struct SourceNodeTable {
    nodes: Arena<SrcNode>,
    by_key: BTreeMap<NodeKey, SrcNodeHandle>,
}

impl SourceNodeTable {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, h: SrcNodeHandle) -> bool {
        self.nodes.contains(h)
    }

    pub fn get(&self, h: SrcNodeHandle) -> Option<&SrcNode> {
        self.nodes.get(h)
    }

    fn find(
        &self,
        rule: Option<RuleHandle>,
        addr: IpAddr,
    ) -> Option<SrcNodeHandle> {
        self.by_key.get(&(rule, addr)).copied()
    }

    fn insert(&mut self, node: SrcNode) -> SrcNodeHandle {
        let key = (node.rule, node.addr);
        let h = self.nodes.insert(node);
        self.by_key.insert(key, h);
        h
    }

    fn remove(&mut self, h: SrcNodeHandle) -> Option<SrcNode> {
        let node = self.nodes.remove(h)?;
        self.by_key.remove(&(node.rule, node.addr));
        Some(node)
    }
}

fn unspecified(af: AddrFamily) -> IpAddr {
    match af {
        AddrFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddrFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn net_matches(net: Option<&MatchNet>, addr: &IpAddr) -> bool {
    net.is_none_or(|n| n.matches(addr))
}

impl PfData {
    fn insert_src_node(
        &mut self,
        rule: Option<RuleHandle>,
        addr: IpAddr,
        raddr: Option<IpAddr>,
    ) -> Result<SrcNodeHandle> {
        if !self.cfg.supports(AddrFamily::of(&addr)) {
            return Err(PfError::Unsupported(AddrFamily::of(&addr)));
        }

        self.status.scounters[SCNT_SRC_NODE_SEARCH] += 1;
        if let Some(h) = self.src_nodes.find(rule, addr) {
            return Ok(h);
        }

        let limit = self.tunables.limit(Limit::SrcNodes) as usize;
        if self.src_nodes.len() >= limit {
            self.log(
                DebugLevel::Misc,
                LogLevel::Warn,
                &format!("source node limit {limit} reached"),
            );
            return Err(PfError::ResourceExhausted(format!(
                "source node limit {limit} reached"
            )));
        }

        if let Some(r) = rule {
            match self.rules.get_mut(r) {
                Some(e) => e.src_nodes += 1,
                None => {
                    return Err(PfError::NotFound(format!("rule {r:?}")));
                }
            }
        }

        let h = self.src_nodes.insert(SrcNode {
            addr,
            raddr,
            af: AddrFamily::of(&addr),
            rule,
            states: 0,
            conn: 0,
            packets: [0; 2],
            bytes: [0; 2],
            creation: self.now(),
            expire: 0,
        });
        self.status.scounters[SCNT_SRC_NODE_INSERT] += 1;
        Ok(h)
    }

    pub(crate) fn src_node_ref(&mut self, h: SrcNodeHandle) {
        if let Some(n) = self.src_nodes.nodes.get_mut(h) {
            n.states += 1;
            n.expire = 0;
        }
    }

    /// Drop a state's reference; the last one starts the node's
    /// expiry timer.
    pub(crate) fn src_node_unref(&mut self, h: SrcNodeHandle, now: u64) {
        let timeout = u64::from(self.tunables.timeout(Timeout::SrcNode));
        if let Some(n) = self.src_nodes.nodes.get_mut(h) {
            n.states = n.states.saturating_sub(1);
            if n.states == 0 {
                n.expire = now + timeout;
            }
        }
    }

    fn remove_src_node(&mut self, h: SrcNodeHandle) -> bool {
        let Some(node) = self.src_nodes.remove(h) else {
            return false;
        };
        if let Some(r) = node.rule {
            if let Some(e) = self.rules.get_mut(r) {
                e.src_nodes = e.src_nodes.saturating_sub(1);
            }
            self.maybe_free(r);
        }
        self.status.scounters[SCNT_SRC_NODE_REMOVALS] += 1;
        true
    }

    /// Remove the nodes no state uses whose timer has run out.
    pub(crate) fn purge_src_nodes(&mut self, now: u64) -> u32 {
        let doomed: Vec<SrcNodeHandle> = self
            .src_nodes
            .nodes
            .iter()
            .filter(|(_, n)| n.states == 0 && n.expire <= now)
            .map(|(h, _)| h)
            .collect();

        let mut removed = 0;
        for h in doomed {
            if self.remove_src_node(h) {
                removed += 1;
            }
        }
        removed
    }

    /// Detach the given nodes from their states and expire them,
    /// returning how many were given. The purge that follows may
    /// also sweep up unrelated idle nodes; those are not counted.
    fn expire_src_nodes(
        &mut self,
        doomed: &[SrcNodeHandle],
        now: u64,
    ) -> u32 {
        self.states.unlink_src_nodes(|h| doomed.contains(&h));
        let mut killed = 0;
        for h in doomed {
            if let Some(n) = self.src_nodes.nodes.get_mut(*h) {
                n.states = 0;
                n.expire = 1;
                killed += 1;
            }
        }
        self.purge_src_nodes(now);
        killed
    }

    pub(crate) fn clear_src_nodes(&mut self, now: u64) -> u32 {
        let all = self.src_nodes.nodes.handles();
        self.expire_src_nodes(&all, now)
    }

    pub(crate) fn kill_src_nodes(&mut self, req: &KillSrcNodesReq) -> u32 {
        let now = self.now();
        let doomed: Vec<SrcNodeHandle> = self
            .src_nodes
            .nodes
            .iter()
            .filter(|(_, n)| {
                let raddr = n.raddr.unwrap_or_else(|| unspecified(n.af));
                net_matches(req.src.as_ref(), &n.addr)
                    && net_matches(req.dst.as_ref(), &raddr)
            })
            .map(|(h, _)| h)
            .collect();

        self.expire_src_nodes(&doomed, now)
    }

    fn dump_src_node(&self, n: &SrcNode, now: u64) -> SrcNodeDump {
        let secs = |d: u64| u32::try_from(d).unwrap_or(u32::MAX);
        SrcNodeDump {
            addr: n.addr,
            raddr: n.raddr,
            af: n.af,
            rule: n.rule.and_then(|r| self.rules.get(r)).and_then(|e| e.nr),
            states: n.states,
            conn: n.conn,
            packets: n.packets,
            bytes: n.bytes,
            creation: secs(now.saturating_sub(n.creation)),
            expire: secs(n.expire.saturating_sub(now)),
        }
    }
}

impl Pf {
    /// Find or create the source node for `addr` under `rule`.
    pub fn insert_src_node(
        &self,
        rule: Option<RuleHandle>,
        addr: IpAddr,
        raddr: Option<IpAddr>,
    ) -> Result<SrcNodeHandle> {
        self.lock().insert_src_node(rule, addr, raddr)
    }

    pub fn get_src_nodes(&self) -> Vec<SrcNodeDump> {
        let data = self.lock();
        let now = data.now();
        data.src_nodes
            .nodes
            .iter()
            .map(|(_, n)| data.dump_src_node(n, now))
            .collect()
    }

    pub fn clear_src_nodes(&self) -> u32 {
        let mut data = self.lock();
        let now = data.now();
        data.clear_src_nodes(now)
    }

    pub fn kill_src_nodes(&self, req: &KillSrcNodesReq) -> u32 {
        self.lock().kill_src_nodes(req)
    }
}
