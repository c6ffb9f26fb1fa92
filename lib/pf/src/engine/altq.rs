// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ALTQ queue lists.
//!
//! The engine only keeps the active and staged lists of queue
//! specifications and interns their names; the disciplines themselves
//! live behind the [`AltqProvider`](crate::provider::AltqProvider).

use super::Pf;
use super::PfData;
use super::Result;
use super::xact::Staged;
use crate::api::AltqSpec;
use crate::api::DebugLevel;
use crate::api::GetAltqsResp;
use crate::api::IFNAMSIZ;
use crate::api::PfError;
use crate::api::QNAME_SIZE;
use crate::provider::LogLevel;

#[derive(Debug, Default)]
pub struct AltqStore {
    pub(crate) active: Vec<AltqSpec>,
    pub(crate) active_ticket: u64,
    pub(crate) inactive: Staged<AltqSpec>,
    pub(crate) enabled: bool,
}

impl PfData {
    fn release_altqs(&mut self, altqs: Vec<AltqSpec>) {
        for a in altqs.iter().filter(|a| !a.is_discipline()) {
            self.qids.release(a.qid as u16);
        }
    }

    pub(crate) fn begin_altq(&mut self) -> u64 {
        let ticket = self.next_ticket();
        let stale = self.altq.inactive.begin(ticket);
        self.release_altqs(stale);
        ticket
    }

    pub(crate) fn add_altq(
        &mut self,
        ticket: u64,
        mut altq: AltqSpec,
    ) -> Result<()> {
        self.altq.inactive.check(ticket)?;

        if altq.ifname.is_empty()
            || altq.ifname.len() >= IFNAMSIZ
            || !self.ectx.ifaces.exists(&altq.ifname)
        {
            return Err(PfError::InvalidArgument(format!(
                "no such interface: {:?}",
                altq.ifname
            )));
        }
        if altq.qname.len() >= QNAME_SIZE || altq.parent.len() >= QNAME_SIZE {
            return Err(PfError::InvalidArgument(format!(
                "queue name too long: {:?}",
                altq.qname
            )));
        }

        if !altq.is_discipline() {
            let qid = self.qids.intern(&altq.qname);
            if qid == 0 {
                return Err(PfError::ResourceExhausted(format!(
                    "no queue id for {:?}",
                    altq.qname
                )));
            }
            altq.qid = u32::from(qid);
        }

        if let Err(e) = self.ectx.altq.add(&altq) {
            self.release_altqs(vec![altq]);
            return Err(e);
        }

        self.altq.inactive.push(altq);
        Ok(())
    }

    pub(crate) fn rollback_altq(&mut self, ticket: u64) {
        if let Some(staged) = self.altq.inactive.rollback(ticket) {
            self.release_altqs(staged);
        }
    }

    /// Swap in the staged list: the old disciplines are detached, the
    /// new ones attached, and queueing re-enabled if it was on. A
    /// discipline that fails to attach is logged and the first such
    /// failure returned once the swap is complete.
    pub(crate) fn commit_altq(&mut self, ticket: u64) -> Result<()> {
        let staged = self.altq.inactive.take(ticket)?;
        let old = core::mem::replace(&mut self.altq.active, staged);
        self.altq.active_ticket = ticket;

        let ectx = std::sync::Arc::clone(&self.ectx);
        let mut res = Ok(());
        let mut fail = |what: &str, a: &AltqSpec, e: PfError| {
            self.log(
                DebugLevel::Urgent,
                LogLevel::Error,
                &format!("altq: {what} {} failed: {e:?}", a.ifname),
            );
            if res.is_ok() {
                res = Err(e);
            }
        };

        for a in old.iter().filter(|a| a.is_discipline()) {
            if self.altq.enabled {
                if let Err(e) = ectx.altq.enable(&a.ifname, false) {
                    fail("disable", a, e);
                }
            }
            ectx.altq.detach(a);
        }

        for a in self.altq.active.iter().filter(|a| a.is_discipline()) {
            if let Err(e) = ectx.altq.attach(a) {
                fail("attach", a, e);
                continue;
            }
            if self.altq.enabled {
                if let Err(e) = ectx.altq.enable(&a.ifname, true) {
                    fail("enable", a, e);
                }
            }
        }

        self.release_altqs(old);
        res
    }

    pub(crate) fn get_altqs(&self) -> GetAltqsResp {
        GetAltqsResp {
            nr: self.altq.active.len() as u32,
            ticket: self.altq.active_ticket,
        }
    }

    pub(crate) fn get_altq(&self, ticket: u64, nr: u32) -> Result<AltqSpec> {
        if ticket != self.altq.active_ticket {
            return Err(PfError::Busy(format!("stale ticket {ticket}")));
        }
        self.altq
            .active
            .get(nr as usize)
            .cloned()
            .ok_or_else(|| PfError::NotFound(format!("no queue {nr}")))
    }

    fn enable_altq(&mut self, on: bool) -> Result<()> {
        for a in self.altq.active.iter().filter(|a| a.is_discipline()) {
            self.ectx.altq.enable(&a.ifname, on)?;
        }
        self.altq.enabled = on;
        Ok(())
    }
}

impl Pf {
    pub fn begin_altq(&self) -> u64 {
        self.lock().begin_altq()
    }

    pub fn add_altq(&self, ticket: u64, altq: AltqSpec) -> Result<()> {
        self.lock().add_altq(ticket, altq)
    }

    pub fn rollback_altq(&self, ticket: u64) {
        self.lock().rollback_altq(ticket)
    }

    pub fn commit_altq(&self, ticket: u64) -> Result<()> {
        self.lock().commit_altq(ticket)
    }

    pub fn get_altqs(&self) -> GetAltqsResp {
        self.lock().get_altqs()
    }

    pub fn get_altq(&self, ticket: u64, nr: u32) -> Result<AltqSpec> {
        self.lock().get_altq(ticket, nr)
    }

    pub fn change_altq(&self) -> Result<()> {
        Err(PfError::NoDevice("altq change is not supported".to_string()))
    }

    pub fn start_altq(&self) -> Result<()> {
        let mut data = self.lock();
        if data.altq.enabled {
            return Err(PfError::Exists("altq already enabled".to_string()));
        }
        data.enable_altq(true)?;
        data.log(DebugLevel::Misc, LogLevel::Note, "altq: started");
        Ok(())
    }

    pub fn stop_altq(&self) -> Result<()> {
        let mut data = self.lock();
        if !data.altq.enabled {
            return Err(PfError::NotFound("altq not enabled".to_string()));
        }
        data.enable_altq(false)?;
        data.log(DebugLevel::Misc, LogLevel::Note, "altq: stopped");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::PfCfg;
    use crate::provider::AltqProvider;
    use crate::provider::ExecCtx;
    use crate::provider::Providers;
    use crate::sync::KMutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecAltq {
        events: KMutex<Vec<String>>,
    }

    impl AltqProvider for RecAltq {
        fn add(&self, a: &AltqSpec) -> core::result::Result<(), PfError> {
            if a.bandwidth == 0 {
                return Err(PfError::InvalidArgument("no bandwidth".into()));
            }
            Ok(())
        }

        fn attach(&self, a: &AltqSpec) -> core::result::Result<(), PfError> {
            self.events.lock().push(format!("attach {}", a.ifname));
            Ok(())
        }

        fn detach(&self, a: &AltqSpec) {
            self.events.lock().push(format!("detach {}", a.ifname));
        }

        fn enable(
            &self,
            ifname: &str,
            on: bool,
        ) -> core::result::Result<(), PfError> {
            self.events.lock().push(format!("enable {ifname} {on}"));
            Ok(())
        }
    }

    fn pf() -> (Pf, Arc<RecAltq>) {
        let rec = Arc::new(RecAltq::default());
        let p = Providers {
            altq: Box::new(Arc::clone(&rec)),
            ..Default::default()
        };
        let ectx = Arc::new(ExecCtx::from(p));
        let pf = Pf::new(PfCfg::default(), ectx).unwrap();
        (pf, rec)
    }

    fn disc(ifname: &str) -> AltqSpec {
        AltqSpec {
            ifname: ifname.into(),
            bandwidth: 1000,
            ..Default::default()
        }
    }

    fn queue(ifname: &str, qname: &str) -> AltqSpec {
        AltqSpec { qname: qname.into(), ..disc(ifname) }
    }

    #[test]
    fn commit_swaps_disciplines() {
        let (pf, rec) = pf();

        let t1 = pf.begin_altq();
        pf.add_altq(t1, disc("em0")).unwrap();
        pf.add_altq(t1, queue("em0", "std")).unwrap();
        pf.commit_altq(t1).unwrap();
        assert_eq!(pf.get_altqs().nr, 2);
        assert_eq!(pf.get_altq(t1, 1).unwrap().qid, 1);
        assert!(matches!(pf.get_altq(t1 + 1, 0), Err(PfError::Busy(_))));
        assert!(matches!(pf.get_altq(t1, 2), Err(PfError::NotFound(_))));

        pf.start_altq().unwrap();
        assert!(matches!(pf.start_altq(), Err(PfError::Exists(_))));

        let t2 = pf.begin_altq();
        pf.add_altq(t2, disc("em1")).unwrap();
        pf.commit_altq(t2).unwrap();

        assert_eq!(
            *rec.events.lock(),
            vec![
                "attach em0",
                "enable em0 true",
                "enable em0 false",
                "detach em0",
                "attach em1",
                "enable em1 true",
            ]
        );

        // The old queue's id was released with it.
        assert_eq!(pf.lock().qids.len(), 0);
        pf.stop_altq().unwrap();
        assert!(matches!(pf.stop_altq(), Err(PfError::NotFound(_))));
    }

    #[test]
    fn rejected_queue_releases_qid() {
        let (pf, _) = pf();
        let t = pf.begin_altq();
        let bad = AltqSpec { bandwidth: 0, ..queue("em0", "std") };
        assert!(pf.add_altq(t, bad).is_err());
        assert_eq!(pf.lock().qids.len(), 0);

        pf.add_altq(t, queue("em0", "std")).unwrap();
        pf.rollback_altq(t);
        assert_eq!(pf.lock().qids.len(), 0);
        assert!(matches!(pf.commit_altq(t), Err(PfError::Busy(_))));
        assert!(matches!(pf.change_altq(), Err(PfError::NoDevice(_))));
    }
}
