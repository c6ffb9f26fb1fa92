// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rules and the rule transaction.
//!
//! A rule is staged into a ruleset's inactive queue under the ticket
//! returned by `begin`, and becomes visible to the packet path only
//! when that ticket is committed. Staging resolves every name in the
//! rule (interface, tags, queues, tables, dynamic addresses, the
//! called anchor) into a reference; a rule that fails validation
//! gives back every reference it took before the error is returned.
//!
//! Rules live in an arena and are shared with the packet path by
//! `Arc`. The arena entry tracks whether the rule is still linked
//! into a queue and how many states and source nodes cite it; the
//! rule is freed only once it is unlinked and both counts are zero.

use super::ActiveRules;
use super::Pf;
use super::PfData;
use super::Result;
use super::arena::Handle;
use super::pool::AddrPool;
use super::pool::PoolAddr;
use super::pool::PoolEntry;
use super::ruleset::AnchorCall;
use super::ruleset::resolve_anchor_call;
use crate::api::AddRuleReq;
use crate::api::AddrFamily;
use crate::api::AddrWrap;
use crate::api::ChangeRuleReq;
use crate::api::DebugLevel;
use crate::api::Direction;
use crate::api::GetRulesResp;
use crate::api::ICMP_MAXTYPE;
use crate::api::IFNAMSIZ;
use crate::api::PfError;
use crate::api::PoolAddrSpec;
use crate::api::QNAME_SIZE;
use crate::api::RULE_LABEL_SIZE;
use crate::api::RouteKind;
use crate::api::RuleChange;
use crate::api::RuleDump;
use crate::api::RuleSpec;
use crate::api::RulesetClass;
use crate::api::SKIP_COUNT;
use crate::api::TAG_NAME_SIZE;
use crate::provider::LogLevel;
use core::fmt;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;

pub type RuleHandle = Handle<RuleEntry>;

/// The references a rule or pool address holds on resources outside
/// itself. Each is given back exactly once, by
/// [`PfData::release_refs`].
#[derive(Debug, Default)]
pub struct Refs {
    kifs: Vec<String>,
    tags: Vec<u16>,
    qids: Vec<u16>,
    dyn_ifs: Vec<String>,
    /// `(anchor path, table name)`
    tables: Vec<(String, String)>,
    /// Paths of called anchors.
    anchors: Vec<String>,
}

impl Refs {
    pub fn is_empty(&self) -> bool {
        self.kifs.is_empty()
            && self.tags.is_empty()
            && self.qids.is_empty()
            && self.dyn_ifs.is_empty()
            && self.tables.is_empty()
            && self.anchors.is_empty()
    }
}

/// A rule as the packet path sees it.
pub struct Rule {
    handle: RuleHandle,
    pub spec: RuleSpec,
    pub tag: u16,
    pub match_tag: u16,
    pub qid: u16,
    pub pqid: u16,
    pub anchor: Option<AnchorCall>,
    pool: AddrPool,
    pub evaluations: AtomicU64,
    pub packets: [AtomicU64; 2],
    pub bytes: [AtomicU64; 2],
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rule")
            .field("handle", &self.handle)
            .field("action", &self.spec.action)
            .field("tag", &self.tag)
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}

/// The names a staged rule resolved to.
#[derive(Default)]
struct Resolved {
    tag: u16,
    match_tag: u16,
    qid: u16,
    pqid: u16,
    anchor: Option<AnchorCall>,
}

impl Rule {
    pub(crate) fn bare(handle: RuleHandle, spec: RuleSpec) -> Self {
        Self::resolved(handle, spec, Resolved::default(), Vec::new())
    }

    fn resolved(
        handle: RuleHandle,
        spec: RuleSpec,
        res: Resolved,
        pool: Vec<PoolEntry>,
    ) -> Self {
        Self {
            handle,
            spec,
            tag: res.tag,
            match_tag: res.match_tag,
            qid: res.qid,
            pqid: res.pqid,
            anchor: res.anchor,
            pool: AddrPool::new(pool),
            evaluations: AtomicU64::new(0),
            packets: Default::default(),
            bytes: Default::default(),
        }
    }

    pub fn handle(&self) -> RuleHandle {
        self.handle
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn pool_addrs(&self) -> Vec<(AddrFamily, PoolAddrSpec)> {
        self.pool.entries().iter().map(|a| (a.af, a.spec.clone())).collect()
    }

    /// Pick a translation address, round-robin, without blocking.
    pub fn next_pool_addr(&self) -> Option<(AddrFamily, PoolAddrSpec)> {
        self.pool.next().map(|a| (a.af, a.spec))
    }

    pub(crate) fn pool(&self) -> &AddrPool {
        &self.pool
    }

    /// Account one packet matched in direction `dir`.
    pub fn count(&self, dir: Direction, bytes: u64) {
        let i = match dir {
            Direction::In => 0,
            Direction::Out => 1,
        };
        self.packets[i].fetch_add(1, Ordering::Relaxed);
        self.bytes[i].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn clear_counters(&self) {
        self.evaluations.store(0, Ordering::Relaxed);
        for c in self.packets.iter().chain(self.bytes.iter()) {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// The engine's bookkeeping for one rule.
pub struct RuleEntry {
    pub(crate) rule: Arc<Rule>,
    pub(crate) refs: Refs,
    /// The references of each pool address, in pool order.
    pub(crate) pool_refs: Vec<Refs>,
    /// In an active or inactive queue.
    pub(crate) linked: bool,
    pub(crate) states: u32,
    pub(crate) src_nodes: u32,
    /// The position in its queue; `None` for the default rule.
    pub(crate) nr: Option<u32>,
}

impl RuleEntry {
    pub(crate) fn new(rule: Rule, refs: Refs, nr: Option<u32>) -> Self {
        Self {
            rule: Arc::new(rule),
            refs,
            pool_refs: Vec::new(),
            linked: true,
            states: 0,
            src_nodes: 0,
            nr,
        }
    }
}

// ================================================================
// Skip steps
// ================================================================

pub const SKIP_IFP: usize = 0;
pub const SKIP_DIR: usize = 1;
pub const SKIP_AF: usize = 2;
pub const SKIP_PROTO: usize = 3;
pub const SKIP_SRC_ADDR: usize = 4;
pub const SKIP_SRC_PORT: usize = 5;
pub const SKIP_DST_ADDR: usize = 6;
pub const SKIP_DST_PORT: usize = 7;

/// For each skip field, the index of the next rule that differs from
/// this one in that field. The queue length means "no such rule".
pub type SkipSteps = [u32; SKIP_COUNT];

fn skip_eq(a: &RuleSpec, b: &RuleSpec, field: usize) -> bool {
    match field {
        SKIP_IFP => a.ifname == b.ifname && a.ifnot == b.ifnot,
        SKIP_DIR => a.direction == b.direction,
        SKIP_AF => a.af == b.af,
        SKIP_PROTO => a.proto == b.proto,
        SKIP_SRC_ADDR => a.src.neg == b.src.neg && a.src.addr == b.src.addr,
        SKIP_SRC_PORT => {
            a.src.port == b.src.port && a.src.port_op == b.src.port_op
        }
        SKIP_DST_ADDR => a.dst.neg == b.dst.neg && a.dst.addr == b.dst.addr,
        SKIP_DST_PORT => {
            a.dst.port == b.dst.port && a.dst.port_op == b.dst.port_op
        }
        _ => false,
    }
}

/// Compute the skip steps of a queue. A run of rules sharing a field
/// value all point past the end of the run.
pub fn calc_skip_steps(rules: &[Arc<Rule>]) -> Vec<SkipSteps> {
    let n = rules.len();
    let mut skip = vec![[n as u32; SKIP_COUNT]; n];

    for i in (0..n.saturating_sub(1)).rev() {
        for field in 0..SKIP_COUNT {
            skip[i][field] =
                if skip_eq(&rules[i].spec, &rules[i + 1].spec, field) {
                    skip[i + 1][field]
                } else {
                    (i + 1) as u32
                };
        }
    }

    skip
}

/// A published queue: its rules, their skip steps, and the ticket
/// that made it active.
#[derive(Debug, Default)]
pub struct ActiveQueue {
    pub ticket: u64,
    pub rules: Vec<Arc<Rule>>,
    pub skip: Vec<SkipSteps>,
}

impl ActiveQueue {
    pub fn new(ticket: u64, rules: Vec<Arc<Rule>>) -> Self {
        let skip = calc_skip_steps(&rules);
        Self { ticket, rules, skip }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn skip_of(&self, nr: usize) -> [Option<u32>; SKIP_COUNT] {
        let end = self.rules.len() as u32;
        let mut out = [None; SKIP_COUNT];
        if let Some(steps) = self.skip.get(nr) {
            for (o, s) in out.iter_mut().zip(steps.iter()) {
                *o = (*s != end).then_some(*s);
            }
        }
        out
    }
}

// ================================================================
// Staging and freeing
// ================================================================

fn check_len(what: &str, s: &str, size: usize) -> Result<()> {
    if s.len() >= size {
        return Err(PfError::InvalidArgument(format!("{what} too long: {s:?}")));
    }
    Ok(())
}

impl PfData {
    /// Give back every reference in `refs`.
    pub(crate) fn release_refs(&mut self, refs: Refs) {
        for ifname in &refs.kifs {
            self.ectx.ifaces.kif_unref(ifname);
        }
        for id in refs.tags {
            self.tags.release(id);
        }
        for id in refs.qids {
            self.qids.release(id);
        }
        for ifname in &refs.dyn_ifs {
            self.ectx.ifaces.dynaddr_remove(ifname);
        }
        for (anchor, name) in &refs.tables {
            self.ectx.tables.detach(anchor, name);
            if let Some(rs) = self.rulesets.find_mut(anchor) {
                rs.tables = rs.tables.saturating_sub(1);
            }
            self.rulesets.remove_if_empty(anchor);
        }
        for path in &refs.anchors {
            if let Some(rs) = self.rulesets.find_mut(path) {
                rs.anchor_refs = rs.anchor_refs.saturating_sub(1);
            }
            self.rulesets.remove_if_empty(path);
        }
    }

    /// Take the references an address needs: the interface behind a
    /// dynamic address, or a table attached to `anchor`.
    pub(crate) fn take_addr_refs(
        &mut self,
        anchor: &str,
        addr: &AddrWrap,
        af: Option<AddrFamily>,
        refs: &mut Refs,
    ) -> Result<()> {
        match addr {
            AddrWrap::DynIfTl { ifname, .. } => {
                check_len("interface name", ifname, IFNAMSIZ)?;
                self.ectx.ifaces.dynaddr_setup(ifname, af)?;
                refs.dyn_ifs.push(ifname.clone());
            }

            AddrWrap::Table { name } => {
                self.ectx.tables.attach(anchor, name)?;
                refs.tables.push((anchor.to_string(), name.clone()));
                if let Some(rs) = self.rulesets.find_mut(anchor) {
                    rs.tables += 1;
                }
            }

            AddrWrap::AddrMask { .. } | AddrWrap::NoRoute => {}
        }

        Ok(())
    }

    pub(crate) fn take_kif_ref(
        &mut self,
        ifname: &str,
        refs: &mut Refs,
    ) -> Result<()> {
        if ifname.is_empty() {
            return Ok(());
        }
        check_len("interface name", ifname, IFNAMSIZ)?;
        self.ectx.ifaces.kif_ref(ifname)?;
        refs.kifs.push(ifname.to_string());
        Ok(())
    }

    fn intern_qid(&mut self, qname: &str, refs: &mut Refs) -> Result<u16> {
        let id = self.qids.intern(qname);
        if id == 0 {
            return Err(PfError::ResourceExhausted(format!(
                "no queue id for {qname:?}"
            )));
        }
        refs.qids.push(id);
        Ok(id)
    }

    fn intern_tag(&mut self, name: &str, refs: &mut Refs) -> Result<u16> {
        let id = self.tags.intern(name);
        if id == 0 {
            return Err(PfError::ResourceExhausted(format!(
                "no tag id for {name:?}"
            )));
        }
        refs.tags.push(id);
        Ok(id)
    }

    fn resolve_rule(
        &mut self,
        anchor: &str,
        spec: &RuleSpec,
        refs: &mut Refs,
    ) -> Result<Resolved> {
        let mut res = Resolved::default();

        self.take_kif_ref(&spec.ifname, refs)?;

        if !spec.qname.is_empty() {
            res.qid = self.intern_qid(&spec.qname, refs)?;
            res.pqid = if spec.pqname.is_empty() {
                res.qid
            } else {
                self.intern_qid(&spec.pqname, refs)?
            };
        }

        if !spec.tagname.is_empty() {
            res.tag = self.intern_tag(&spec.tagname, refs)?;
        }
        if !spec.match_tagname.is_empty() {
            res.match_tag = self.intern_tag(&spec.match_tagname, refs)?;
        }

        if spec.rt != RouteKind::None && spec.direction.is_none() {
            return Err(PfError::InvalidArgument(
                "route option without a direction".to_string(),
            ));
        }

        self.take_addr_refs(anchor, &spec.src.addr, spec.af, refs)?;
        self.take_addr_refs(anchor, &spec.dst.addr, spec.af, refs)?;

        if !spec.anchor_call.is_empty() {
            let call = resolve_anchor_call(anchor, &spec.anchor_call)?;
            let rs = self.rulesets.find_or_create(&call.path)?;
            rs.anchor_refs += 1;
            refs.anchors.push(call.path.clone());
            res.anchor = Some(call);
        }

        Ok(res)
    }

    /// Validate `spec` and build it into a rule for the ruleset at
    /// `anchor`, taking the staged pool addresses when `pool_ticket`
    /// is given. On failure nothing is left referenced.
    pub(crate) fn stage_rule(
        &mut self,
        anchor: &str,
        spec: RuleSpec,
        pool_ticket: Option<u64>,
    ) -> Result<RuleHandle> {
        if let Some(ticket) = pool_ticket {
            self.pool_buf.check(ticket)?;
        }

        if spec.return_icmp >> 8 > ICMP_MAXTYPE {
            return Err(PfError::InvalidArgument(format!(
                "bad return-icmp type {}",
                spec.return_icmp >> 8
            )));
        }

        if let Some(af) = spec.af {
            if !self.cfg.supports(af) {
                return Err(PfError::Unsupported(af));
            }
        }

        check_len("label", &spec.label, RULE_LABEL_SIZE)?;
        check_len("tag", &spec.tagname, TAG_NAME_SIZE)?;
        check_len("tag", &spec.match_tagname, TAG_NAME_SIZE)?;
        check_len("queue", &spec.qname, QNAME_SIZE)?;
        check_len("queue", &spec.pqname, QNAME_SIZE)?;

        let mut refs = Refs::default();
        let res = match self.resolve_rule(anchor, &spec, &mut refs) {
            Ok(res) => res,
            Err(e) => {
                self.release_refs(refs);
                return Err(e);
            }
        };

        let pool = match pool_ticket {
            Some(ticket) => self.pool_buf.drain(ticket)?,
            None => Vec::new(),
        };

        let needs_pool = (spec.action.is_translation() && res.anchor.is_none())
            || spec.rt > RouteKind::FastRoute;
        if needs_pool && pool.is_empty() {
            self.release_refs(refs);
            return Err(PfError::InvalidArgument(format!(
                "{} rule requires a pool",
                spec.action
            )));
        }

        let (pool, pool_refs): (Vec<PoolEntry>, Vec<Refs>) =
            pool.into_iter().map(PoolAddr::split).unzip();
        Ok(self.rules.insert_with(|h| RuleEntry {
            pool_refs,
            ..RuleEntry::new(Rule::resolved(h, spec, res, pool), refs, None)
        }))
    }

    /// Free the rule if it is unlinked and nothing cites it.
    pub(crate) fn maybe_free(&mut self, h: RuleHandle) -> bool {
        if h == self.default_rule {
            return false;
        }

        match self.rules.get(h) {
            Some(e) if !e.linked && e.states == 0 && e.src_nodes == 0 => {}
            _ => return false,
        }

        let Some(entry) = self.rules.remove(h) else {
            return false;
        };
        entry.rule.pool().clear();
        self.release_refs(entry.refs);
        for refs in entry.pool_refs {
            self.release_refs(refs);
        }
        true
    }

    /// Take the rule out of its queue's accounting, freeing it unless
    /// states or source nodes still cite it.
    pub(crate) fn unlink_rule(&mut self, h: RuleHandle) {
        let Some(e) = self.rules.get_mut(h) else {
            return;
        };
        e.linked = false;
        let (states, src_nodes) = (e.states, e.src_nodes);

        if !self.maybe_free(h) && h != self.default_rule {
            self.log(
                DebugLevel::Misc,
                LogLevel::Note,
                &format!(
                    "rule {h:?} free deferred: {states} states, \
                     {src_nodes} source nodes"
                ),
            );
        }
    }

    pub(crate) fn rule_ref(&mut self, h: RuleHandle) -> Result<()> {
        match self.rules.get_mut(h) {
            Some(e) => {
                e.states += 1;
                Ok(())
            }
            None => Err(PfError::NotFound(format!("rule {h:?}"))),
        }
    }

    /// Drop one state reference on the rule, freeing it if that was
    /// the last thing holding it.
    pub(crate) fn rule_unref(&mut self, h: RuleHandle) {
        if let Some(e) = self.rules.get_mut(h) {
            e.states = e.states.saturating_sub(1);
        }
        self.maybe_free(h);
    }
}

// ================================================================
// Rule transactions
// ================================================================

impl PfData {
    pub(crate) fn begin_rules(
        &mut self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<u64> {
        let ticket = self.next_ticket();
        let rs = self.rulesets.find_or_create(anchor)?;
        let stale = rs.queue_mut(class).inactive.begin(ticket);
        for h in stale {
            self.unlink_rule(h);
        }
        Ok(ticket)
    }

    pub(crate) fn check_rules_ticket(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) -> Result<()> {
        match self.rulesets.find(anchor) {
            Some(rs) => rs.queue(class).inactive.check(ticket),
            None => Err(PfError::Busy(format!("no such anchor: {anchor:?}"))),
        }
    }

    pub(crate) fn add_rule(&mut self, req: AddRuleReq) -> Result<()> {
        let class = req.rule.action.class();
        let Some(rs) = self.rulesets.find(&req.anchor) else {
            return Err(PfError::InvalidArgument(format!(
                "no such anchor: {:?}",
                req.anchor
            )));
        };
        rs.queue(class).inactive.check(req.ticket)?;
        let path = rs.path.clone();

        let h = self.stage_rule(&path, req.rule, req.pool_ticket)?;
        let Some(rs) = self.rulesets.find_mut(&path) else {
            self.unlink_rule(h);
            return Err(PfError::Busy(format!("anchor {path:?} vanished")));
        };
        let inactive = &mut rs.queue_mut(class).inactive;
        let nr = inactive.len() as u32;
        inactive.push(h);
        if let Some(e) = self.rules.get_mut(h) {
            e.nr = Some(nr);
        }
        Ok(())
    }

    pub(crate) fn rollback_rules(
        &mut self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) {
        let Some(rs) = self.rulesets.find_mut(anchor) else {
            return;
        };
        let Some(staged) = rs.queue_mut(class).inactive.rollback(ticket) else {
            return;
        };
        let path = rs.path.clone();

        let n = staged.len();
        for h in staged {
            self.unlink_rule(h);
        }
        self.rulesets.remove_if_empty(&path);
        self.log(
            DebugLevel::Misc,
            LogLevel::Note,
            &format!("rolled back {class} {path:?}: {n} rules discarded"),
        );
    }

    /// Make the staged queue active. The caller publishes.
    pub(crate) fn commit_rules(
        &mut self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) -> Result<()> {
        let Some(rs) = self.rulesets.find_mut(anchor) else {
            return Err(PfError::Busy(format!("no such anchor: {anchor:?}")));
        };
        let staged = rs.queue_mut(class).inactive.take(ticket)?;
        let path = rs.path.clone();

        let mut rules = Vec::with_capacity(staged.len());
        for h in staged {
            if let Some(e) = self.rules.get_mut(h) {
                e.nr = Some(rules.len() as u32);
                rules.push(Arc::clone(&e.rule));
            }
        }
        let n = rules.len();

        let queue = Arc::new(ActiveQueue::new(ticket, rules));
        let old = match self.rulesets.find_mut(&path) {
            Some(rs) => {
                core::mem::replace(&mut rs.queue_mut(class).active, queue)
            }
            None => queue,
        };

        for rule in &old.rules {
            self.unlink_rule(rule.handle());
        }
        self.rulesets.remove_if_empty(&path);

        self.log(
            DebugLevel::Misc,
            LogLevel::Note,
            &format!("committed {class} {path:?}: {n} rules"),
        );
        Ok(())
    }

    fn active_queue(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<&Arc<ActiveQueue>> {
        match self.rulesets.find(anchor) {
            Some(rs) => Ok(&rs.queue(class).active),
            None => {
                Err(PfError::NotFound(format!("no such anchor: {anchor:?}")))
            }
        }
    }

    pub(crate) fn get_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<GetRulesResp> {
        let q = self.active_queue(anchor, class)?;
        Ok(GetRulesResp { nr: q.len() as u32, ticket: q.ticket })
    }

    pub(crate) fn dump_rule(
        &self,
        q: &ActiveQueue,
        nr: usize,
    ) -> Option<RuleDump> {
        let rule = q.rules.get(nr)?;
        let (states, src_nodes) = self
            .rules
            .get(rule.handle())
            .map(|e| (e.states, e.src_nodes))
            .unwrap_or_default();

        Some(RuleDump {
            nr: nr as u32,
            spec: rule.spec.clone(),
            tag: rule.tag,
            match_tag: rule.match_tag,
            qid: u32::from(rule.qid),
            pqid: u32::from(rule.pqid),
            evaluations: rule.evaluations.load(Ordering::Relaxed),
            packets: rule.packets.each_ref().map(|c| c.load(Ordering::Relaxed)),
            bytes: rule.bytes.each_ref().map(|c| c.load(Ordering::Relaxed)),
            states,
            src_nodes,
            pool_len: rule.pool_len() as u32,
            skip: q.skip_of(nr),
        })
    }

    pub(crate) fn get_rule(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
        nr: u32,
    ) -> Result<RuleDump> {
        let q = self.active_queue(anchor, class)?;
        if q.ticket != ticket {
            return Err(PfError::Busy(format!("stale ticket {ticket}")));
        }

        self.dump_rule(q, nr as usize)
            .ok_or_else(|| PfError::NotFound(format!("no rule {nr}")))
    }

    /// Modify an active queue in place, returning its new ticket. The
    /// caller publishes.
    pub(crate) fn change_rule(&mut self, req: ChangeRuleReq) -> Result<u64> {
        let Some(rs) = self.rulesets.find(&req.anchor) else {
            return Err(PfError::InvalidArgument(format!(
                "no such anchor: {:?}",
                req.anchor
            )));
        };
        let path = rs.path.clone();
        let cur = Arc::clone(&rs.queue(req.class).active);

        if req.action != RuleChange::GetTicket && cur.ticket != req.ticket {
            return Err(PfError::Busy(format!("stale ticket {}", req.ticket)));
        }

        let nr = req.nr as usize;
        let positioned = matches!(
            req.action,
            RuleChange::AddBefore | RuleChange::AddAfter | RuleChange::Remove
        );
        if positioned && nr >= cur.len() {
            return Err(PfError::NotFound(format!("no rule {nr}")));
        }

        let added = match req.action {
            RuleChange::AddHead
            | RuleChange::AddTail
            | RuleChange::AddBefore
            | RuleChange::AddAfter => {
                let Some(spec) = req.rule else {
                    return Err(PfError::InvalidArgument(
                        "add without a rule".to_string(),
                    ));
                };
                if spec.action.class() != req.class {
                    return Err(PfError::InvalidArgument(format!(
                        "{} rule in the {} queue",
                        spec.action, req.class
                    )));
                }
                // An add always consumes the pool buffer, even when
                // the rule takes no addresses.
                let Some(pool_ticket) = req.pool_ticket else {
                    return Err(PfError::Busy(
                        "add without a pool ticket".to_string(),
                    ));
                };
                let h = self.stage_rule(&path, spec, Some(pool_ticket))?;
                self.rules.get(h).map(|e| Arc::clone(&e.rule))
            }
            RuleChange::Remove | RuleChange::GetTicket => None,
        };

        let mut rules = cur.rules.clone();
        let mut removed = None;
        match (req.action, added) {
            (RuleChange::AddHead, Some(r)) => rules.insert(0, r),
            (RuleChange::AddTail, Some(r)) => rules.push(r),
            (RuleChange::AddBefore, Some(r)) => rules.insert(nr, r),
            (RuleChange::AddAfter, Some(r)) => rules.insert(nr + 1, r),
            (RuleChange::Remove, _) => removed = Some(rules.remove(nr)),
            _ => {}
        }

        for (i, r) in rules.iter().enumerate() {
            if let Some(e) = self.rules.get_mut(r.handle()) {
                e.nr = Some(i as u32);
            }
        }

        let ticket = self.next_ticket();
        if let Some(rs) = self.rulesets.find_mut(&path) {
            rs.queue_mut(req.class).active =
                Arc::new(ActiveQueue::new(ticket, rules));
        }

        if let Some(r) = removed {
            self.unlink_rule(r.handle());
        }
        self.rulesets.remove_if_empty(&path);
        Ok(ticket)
    }

    pub(crate) fn clear_rule_counters(&self) {
        if let Some(main) = self.rulesets.find("") {
            for rule in &main.queue(RulesetClass::Filter).active.rules {
                rule.clear_counters();
            }
        }
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.rulesets.find(path) {
            Some(rs) => Ok(rs.children.iter().cloned().collect()),
            None => Err(PfError::NotFound(format!("no such anchor: {path:?}"))),
        }
    }
}

impl Pf {
    /// Open a rule transaction on `(anchor, class)`, creating the
    /// anchor if needed. Rules staged under an earlier ticket are
    /// discarded.
    pub fn begin_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<u64> {
        self.lock().begin_rules(anchor, class)
    }

    pub fn add_rule(&self, req: AddRuleReq) -> Result<()> {
        self.lock().add_rule(req)
    }

    /// Discard the staged rules. A stale ticket is ignored.
    pub fn rollback_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) {
        self.lock().rollback_rules(anchor, class, ticket)
    }

    pub fn commit_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) -> Result<()> {
        let mut data = self.lock();
        data.commit_rules(anchor, class, ticket)?;
        self.publish(&mut data);
        Ok(())
    }

    pub fn get_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<GetRulesResp> {
        self.lock().get_rules(anchor, class)
    }

    pub fn get_rule(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
        nr: u32,
    ) -> Result<RuleDump> {
        self.lock().get_rule(anchor, class, ticket, nr)
    }

    pub fn change_rule(&self, req: ChangeRuleReq) -> Result<u64> {
        self.modify(|data| data.change_rule(req))
    }

    pub fn clear_rule_counters(&self) {
        self.lock().clear_rule_counters()
    }

    /// The number of anchors directly beneath `path`.
    pub fn get_rulesets(&self, path: &str) -> Result<u32> {
        Ok(self.lock().children(path)?.len() as u32)
    }

    /// The name of the `nr`th anchor beneath `path`, in sorted order.
    pub fn get_ruleset(&self, path: &str, nr: u32) -> Result<String> {
        self.lock()
            .children(path)?
            .into_iter()
            .nth(nr as usize)
            .ok_or_else(|| PfError::NotFound(format!("no anchor {nr}")))
    }
}

impl ActiveRules {
    /// Resolve a rule's anchor call against this snapshot: the called
    /// ruleset, or every child of it for a wildcard call.
    pub fn called_rulesets(&self, rule: &Rule) -> Vec<&str> {
        let Some(call) = &rule.anchor else {
            return Vec::new();
        };

        if !call.wildcard {
            return self
                .rulesets
                .get_key_value(&call.path)
                .map(|(k, _)| vec![k.as_str()])
                .unwrap_or_default();
        }

        let prefix = format!("{}/", call.path);
        self.rulesets
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/'))
            })
            .map(String::as_str)
            .collect()
    }
}
