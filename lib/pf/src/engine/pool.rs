// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Translation and routing address pools.
//!
//! Addresses are staged into the single global pool buffer under a
//! ticket and moved, not copied, into the pool of the next rule added
//! with that ticket. Once a rule is active its pool may still be
//! edited in place through [`Pf::change_addr`].

use super::Pf;
use super::PfData;
use super::Result;
use super::rule::ActiveQueue;
use super::rule::Refs;
use super::rule::Rule;
use crate::api::AddAddrReq;
use crate::api::AddrFamily;
use crate::api::AddrWrap;
use crate::api::ChangeAddrReq;
use crate::api::GetAddrsResp;
use crate::api::PfError;
use crate::api::PoolAddrSpec;
use crate::api::PoolChange;
use crate::api::PoolSelector;
use crate::snapshot::Resource;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use std::sync::Arc;

/// A staged address and the references it holds.
#[derive(Debug)]
pub struct PoolAddr {
    pub af: AddrFamily,
    pub spec: PoolAddrSpec,
    pub(crate) refs: Refs,
}

impl PoolAddr {
    /// Split into the published entry and the references, which stay
    /// with the rule's bookkeeping.
    pub(crate) fn split(self) -> (PoolEntry, Refs) {
        (PoolEntry { af: self.af, spec: self.spec }, self.refs)
    }
}

/// One candidate address of an active pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolEntry {
    pub af: AddrFamily,
    pub spec: PoolAddrSpec,
}

/// An ordered pool with a round-robin cursor.
///
/// Picking never takes a lock. Every edit publishes a new list and
/// moves the cursor back to the head; the cursor is taken modulo the
/// length of the list a reader loaded, so it never indexes past the
/// end.
#[derive(Debug)]
pub struct AddrPool {
    addrs: Resource<Vec<PoolEntry>>,
    cur: AtomicUsize,
}

impl Default for AddrPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl AddrPool {
    pub fn new(addrs: Vec<PoolEntry>) -> Self {
        Self { addrs: Resource::from(addrs), cur: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.addrs.peek().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.peek().is_empty()
    }

    /// The current list, unaffected by later edits.
    pub fn entries(&self) -> Arc<Vec<PoolEntry>> {
        self.addrs.load()
    }

    pub fn get(&self, nr: usize) -> Option<PoolEntry> {
        self.addrs.peek().get(nr).cloned()
    }

    /// The position the next pick uses.
    pub fn cur(&self) -> usize {
        match self.len() {
            0 => 0,
            len => self.cur.load(Ordering::Relaxed) % len,
        }
    }

    /// Return the entry under the cursor and advance it.
    pub fn next(&self) -> Option<PoolEntry> {
        let addrs = self.addrs.peek();
        if addrs.is_empty() {
            return None;
        }
        let i = self.cur.fetch_add(1, Ordering::Relaxed) % addrs.len();
        addrs.get(i).cloned()
    }

    fn publish(&self, addrs: Vec<PoolEntry>) {
        self.addrs.store(addrs);
        self.cur.store(0, Ordering::Relaxed);
    }

    /// Insert at `pos`, or at the tail when `pos` is past it. Returns
    /// the position used.
    pub fn insert(&self, pos: usize, entry: PoolEntry) -> usize {
        let mut addrs = self.addrs.peek().to_vec();
        let pos = pos.min(addrs.len());
        addrs.insert(pos, entry);
        self.publish(addrs);
        pos
    }

    pub fn remove(&self, pos: usize) -> Option<PoolEntry> {
        let mut addrs = self.addrs.peek().to_vec();
        if pos >= addrs.len() {
            return None;
        }
        let entry = addrs.remove(pos);
        self.publish(addrs);
        Some(entry)
    }

    pub fn clear(&self) {
        self.publish(Vec::new());
    }
}

impl PfData {
    /// Validate a pool address and take its references.
    fn stage_pool_addr(
        &mut self,
        af: AddrFamily,
        spec: PoolAddrSpec,
    ) -> Result<PoolAddr> {
        if !self.cfg.supports(af) {
            return Err(PfError::Unsupported(af));
        }

        match &spec.addr {
            AddrWrap::NoRoute => {
                return Err(PfError::InvalidArgument(
                    "no-route is not a pool address".to_string(),
                ));
            }
            a @ AddrWrap::AddrMask { .. } => {
                if a.family().is_some_and(|f| f != af) {
                    return Err(PfError::InvalidArgument(format!(
                        "{a} is not an {af} address"
                    )));
                }
            }
            AddrWrap::DynIfTl { .. } | AddrWrap::Table { .. } => {}
        }

        if !spec.ifname.is_empty() && !self.ectx.ifaces.exists(&spec.ifname) {
            return Err(PfError::InvalidArgument(format!(
                "no such interface: {}",
                spec.ifname
            )));
        }

        let mut refs = Refs::default();
        let mut res = self.take_kif_ref(&spec.ifname, &mut refs);
        if res.is_ok() {
            res = self.take_addr_refs("", &spec.addr, Some(af), &mut refs);
        }
        if let Err(e) = res {
            self.release_refs(refs);
            return Err(e);
        }

        Ok(PoolAddr { af, spec, refs })
    }

    pub(crate) fn begin_addrs(&mut self) -> u64 {
        let ticket = self.next_ticket();
        for addr in self.pool_buf.begin(ticket) {
            self.release_refs(addr.refs);
        }
        ticket
    }

    pub(crate) fn add_addr(&mut self, req: AddAddrReq) -> Result<()> {
        self.pool_buf.check(req.ticket)?;
        let addr = self.stage_pool_addr(req.af, req.addr)?;
        self.pool_buf.push(addr);
        Ok(())
    }

    /// The active queue and rule a selector names.
    fn pool_rule(
        &self,
        sel: &PoolSelector,
    ) -> Result<(Arc<ActiveQueue>, Arc<Rule>)> {
        let Some(rs) = self.rulesets.find(&sel.anchor) else {
            return Err(PfError::NotFound(format!(
                "no such anchor: {:?}",
                sel.anchor
            )));
        };
        let q = Arc::clone(&rs.queue(sel.action.class()).active);

        let nr = if sel.last {
            q.len().checked_sub(1)
        } else {
            Some(sel.nr as usize)
        };
        let rule = nr
            .and_then(|nr| q.rules.get(nr))
            .map(Arc::clone)
            .ok_or_else(|| PfError::NotFound(format!("no rule {}", sel.nr)))?;

        Ok((q, rule))
    }

    pub(crate) fn get_addrs(&self, sel: &PoolSelector) -> Result<GetAddrsResp> {
        let (q, rule) = self.pool_rule(sel)?;
        Ok(GetAddrsResp { nr: rule.pool_len() as u32, ticket: q.ticket })
    }

    pub(crate) fn get_addr(
        &self,
        sel: &PoolSelector,
        ticket: u64,
        nr: u32,
    ) -> Result<(AddrFamily, PoolAddrSpec)> {
        let (q, rule) = self.pool_rule(sel)?;
        if q.ticket != ticket {
            return Err(PfError::Busy(format!("stale ticket {ticket}")));
        }

        rule.pool()
            .get(nr as usize)
            .map(|a| (a.af, a.spec))
            .ok_or_else(|| PfError::NotFound(format!("no pool address {nr}")))
    }

    pub(crate) fn change_addr(&mut self, req: ChangeAddrReq) -> Result<()> {
        let (q, rule) = self.pool_rule(&req.sel)?;
        if q.ticket != req.ticket {
            return Err(PfError::Busy(format!("stale ticket {}", req.ticket)));
        }

        let nr = req.nr as usize;
        let len = rule.pool_len();
        let positioned = matches!(
            req.action,
            PoolChange::AddBefore | PoolChange::AddAfter | PoolChange::Remove
        );
        if positioned && nr >= len {
            return Err(PfError::InvalidArgument(format!(
                "no pool address {nr}"
            )));
        }

        if req.action == PoolChange::Remove {
            rule.pool().remove(nr);
            let refs = self
                .rules
                .get_mut(rule.handle())
                .filter(|e| nr < e.pool_refs.len())
                .map(|e| e.pool_refs.remove(nr));
            if let Some(refs) = refs {
                self.release_refs(refs);
            }
            return Ok(());
        }

        let Some(spec) = req.addr else {
            return Err(PfError::InvalidArgument(
                "add without an address".to_string(),
            ));
        };
        let addr = self.stage_pool_addr(req.af, spec)?;
        let pos = match req.action {
            PoolChange::AddHead => 0,
            PoolChange::AddTail => len,
            PoolChange::AddBefore => nr,
            PoolChange::AddAfter | PoolChange::Remove => nr + 1,
        };
        let (entry, refs) = addr.split();
        let pos = rule.pool().insert(pos, entry);
        match self.rules.get_mut(rule.handle()) {
            Some(e) => e.pool_refs.insert(pos.min(e.pool_refs.len()), refs),
            None => self.release_refs(refs),
        }
        Ok(())
    }
}

impl Pf {
    /// Open the pool buffer, discarding anything staged under an
    /// earlier ticket.
    pub fn begin_addrs(&self) -> u64 {
        self.lock().begin_addrs()
    }

    pub fn add_addr(&self, req: AddAddrReq) -> Result<()> {
        self.lock().add_addr(req)
    }

    pub fn get_addrs(&self, sel: &PoolSelector) -> Result<GetAddrsResp> {
        self.lock().get_addrs(sel)
    }

    pub fn get_addr(
        &self,
        sel: &PoolSelector,
        ticket: u64,
        nr: u32,
    ) -> Result<(AddrFamily, PoolAddrSpec)> {
        self.lock().get_addr(sel, ticket, nr)
    }

    pub fn change_addr(&self, req: ChangeAddrReq) -> Result<()> {
        self.lock().change_addr(req)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn entry(s: &str) -> PoolEntry {
        PoolEntry {
            af: AddrFamily::Inet,
            spec: PoolAddrSpec {
                addr: s.parse().unwrap(),
                ifname: String::new(),
            },
        }
    }

    fn next(p: &AddrPool) -> String {
        p.next().unwrap().spec.addr.to_string()
    }

    #[test]
    fn round_robin() {
        let p = AddrPool::new(vec![
            entry("10.0.0.1"),
            entry("10.0.0.2"),
            entry("10.0.0.3"),
        ]);
        assert_eq!(next(&p), "10.0.0.1/32");
        assert_eq!(next(&p), "10.0.0.2/32");
        assert_eq!(next(&p), "10.0.0.3/32");
        assert_eq!(next(&p), "10.0.0.1/32");
    }

    #[test]
    fn edits_reset_cursor() {
        let p = AddrPool::new(vec![entry("10.0.0.1"), entry("10.0.0.2")]);
        let _ = p.next();
        let _ = p.next();
        let _ = p.next();
        assert_eq!(p.cur(), 1);

        // Removing the entry under the cursor must not leave it
        // dangling.
        assert!(p.remove(1).is_some());
        assert_eq!(p.cur(), 0);
        assert_eq!(next(&p), "10.0.0.1/32");

        assert_eq!(p.insert(0, entry("10.0.0.9")), 0);
        assert_eq!(p.cur(), 0);
        assert_eq!(next(&p), "10.0.0.9/32");
        assert!(p.remove(5).is_none());
        assert_eq!(p.insert(7, entry("10.0.0.7")), 2);

        p.clear();
        assert!(p.next().is_none());
        assert_eq!(p.cur(), 0);
    }

    #[test]
    fn readers_keep_loaded_list() {
        let p = AddrPool::new(vec![entry("10.0.0.1"), entry("10.0.0.2")]);
        let before = p.entries();
        p.remove(0);
        p.insert(0, entry("10.0.0.9"));
        assert_eq!(*before, vec![entry("10.0.0.1"), entry("10.0.0.2")]);
        assert_eq!(*p.entries(), vec![entry("10.0.0.9"), entry("10.0.0.2")]);
    }

    // Picks made while the pool is edited always return an entry of
    // some published list.
    #[test]
    fn picks_during_edits() {
        let p = Arc::new(AddrPool::new(vec![
            entry("10.0.0.1"),
            entry("10.0.0.2"),
            entry("10.0.0.3"),
        ]));
        let known = [
            entry("10.0.0.1"),
            entry("10.0.0.2"),
            entry("10.0.0.3"),
            entry("10.0.0.4"),
        ];

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&p);
                let known = known.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let e = p.next().unwrap();
                        assert!(known.contains(&e));
                    }
                })
            })
            .collect();

        for i in 0..500 {
            p.insert(i % 4, entry("10.0.0.4"));
            p.remove(i % 3);
        }

        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(p.len(), 3);
    }
}
