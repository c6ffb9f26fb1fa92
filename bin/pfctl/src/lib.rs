// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet filter administration library

pub mod log;
pub mod policy;

use pf::api::PfError;
use pf::api::StateRecord;
use pf::api::XactEntry;
use pf::api::XactKind;
use pf::engine::Pf;
use pf::provider::ExecCtx;
use pf::provider::MemIfaces;
use pf::provider::MemTables;
use pf::provider::NullAltq;
use pf::provider::Providers;
use pf::provider::SystemClock;
use pf_ioctl::PfHdl;
use policy::Policy;
use policy::PolicyError;
use policy::StagedRule;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Policy(#[from] PolicyError),

    #[error("failed to create engine: {0:?}")]
    Engine(PfError),

    #[error(transparent)]
    Ioctl(#[from] pf_ioctl::Error),

    #[error("no open transaction for {kind} on anchor \"{anchor}\"")]
    NoTicket { kind: XactKind, anchor: String },

    #[error("failed to read states: {0}")]
    States(#[from] toml::de::Error),

    #[error("failed to write states: {0}")]
    StatesOut(#[from] toml::ser::Error),
}

/// The exported state table, as written to and read from disk.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StateFile {
    pub state: Vec<StateRecord>,
}

/// The handle used to send administration commands to an engine
/// built for a policy.
pub struct PfCtl(PfHdl);

impl Deref for PfCtl {
    type Target = PfHdl;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PfCtl {
    /// Create an engine configured by `policy`, logging to `log`. No
    /// rules are loaded.
    pub fn open(policy: &Policy, log: Logger) -> Result<Self, Error> {
        let ifaces = if policy.interfaces.is_empty() {
            MemIfaces::any()
        } else {
            MemIfaces::new(&policy.interfaces)
        };
        let providers = Providers {
            log: Box::new(log::SlogLog::new(log)),
            clock: Box::new(SystemClock),
            ifaces: Box::new(ifaces),
            tables: Box::new(MemTables::default()),
            altq: Box::new(NullAltq),
        };
        let ectx = Arc::new(ExecCtx::from(providers));
        let pf = Pf::new(policy.config.clone(), ectx).map_err(Error::Engine)?;
        Ok(Self(PfHdl::open(Arc::new(pf))))
    }

    /// Replace every ruleset and queue the policy names in a single
    /// grouped transaction. Nothing is committed unless every rule is
    /// staged. Returns the number of rules loaded.
    pub fn load(&self, policy: &Policy) -> Result<usize, Error> {
        let staged = policy.staged_rules()?;
        let entries = self.xbegin(policy.xact_entries())?;

        if let Err(e) = self.stage(&entries, policy, &staged) {
            // Fails harmlessly when a concurrent loader has already
            // replaced the transaction.
            let _ = self.xrollback(&entries);
            return Err(e);
        }

        self.xcommit(&entries)?;
        Ok(staged.len())
    }

    fn stage(
        &self,
        entries: &[XactEntry],
        policy: &Policy,
        staged: &[StagedRule],
    ) -> Result<(), Error> {
        if !policy.altqs.is_empty() {
            let ticket = ticket_of(entries, XactKind::Altq, "")?;
            for altq in &policy.altqs {
                self.add_altq(ticket, altq.clone())?;
            }
        }

        for rule in staged {
            let kind = XactKind::Rules(rule.spec.action.class());
            let ticket = ticket_of(entries, kind, &rule.anchor)?;
            let pool_ticket = if rule.pool.is_empty() {
                None
            } else {
                let pt = self.begin_addrs()?;
                for (af, addr) in &rule.pool {
                    self.add_addr(pt, *af, addr.clone())?;
                }
                Some(pt)
            };
            let spec = rule.spec.clone();
            self.add_rule(&rule.anchor, ticket, pool_ticket, spec)?;
        }

        Ok(())
    }

    /// Import a previously exported state table, returning how many
    /// states were added.
    pub fn import_states(&self, text: &str) -> Result<u32, Error> {
        let file: StateFile = toml::from_str(text)?;
        Ok(self.add_states(file.state)?)
    }

    /// Export the state table.
    pub fn export_states(&self) -> Result<String, Error> {
        let state = self.get_states(None)?.states;
        Ok(toml::to_string(&StateFile { state })?)
    }
}

fn ticket_of(
    entries: &[XactEntry],
    kind: XactKind,
    anchor: &str,
) -> Result<u64, Error> {
    entries
        .iter()
        .find(|e| e.kind == kind && e.anchor == anchor)
        .map(|e| e.ticket)
        .ok_or_else(|| Error::NoTicket { kind, anchor: anchor.to_string() })
}

#[cfg(test)]
mod test {
    use super::*;
    use pf::api::RulesetClass;
    use slog::o;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    const POLICY: &str = r#"
        interfaces = ["em0", "em1"]

        [config]
        hostid = 0x1234

        [[altq]]
        ifname = "em1"
        bandwidth = 1000000

        [[altq]]
        ifname = "em1"
        qname = "std"
        parent = ""
        bandwidth = 500000

        [[rule]]
        action = "block"

        [[rule]]
        action = "pass"
        direction = "in"
        on = "em0"
        proto = "tcp"
        to_port = "22"
        keep_state = true
        queue = "std"

        [[rule]]
        action = "pass"
        call = "lab"

        [[rule]]
        anchor = "lab"
        action = "pass"
        proto = "udp"
        to_port = "53"

        [[rule]]
        action = "nat"
        on = "em1"
        from = "10.0.0.0/8"
        pool = ["198.51.100.1"]
    "#;

    fn loaded() -> (PfCtl, Policy) {
        let policy = Policy::parse(POLICY).unwrap();
        let ctl = PfCtl::open(&policy, discard()).unwrap();
        assert_eq!(ctl.load(&policy).unwrap(), 5);
        (ctl, policy)
    }

    #[test]
    fn load_policy() {
        let (ctl, _) = loaded();

        let filter = ctl.dump_rules("", RulesetClass::Filter).unwrap();
        assert_eq!(filter.len(), 3);
        assert_eq!(filter[2].spec.anchor_call, "lab");

        let lab = ctl.dump_rules("lab", RulesetClass::Filter).unwrap();
        assert_eq!(lab.len(), 1);

        let nat = ctl.dump_rules("", RulesetClass::Nat).unwrap();
        assert_eq!(nat.len(), 1);
        assert_eq!(nat[0].pool_len, 1);

        assert_eq!(ctl.list_rulesets("").unwrap(), vec!["lab"]);
        assert_eq!(ctl.dump_altqs().unwrap().len(), 2);

        let status = ctl.status().unwrap();
        assert_eq!(status.hostid, 0x1234);
        assert_ne!(status.checksum, [0; 16]);
    }

    #[test]
    fn reload_replaces() {
        let (ctl, _) = loaded();
        let before = ctl.status().unwrap().checksum;

        let policy = Policy::parse(
            r#"
            [[rule]]
            action = "pass"
            "#,
        )
        .unwrap();
        assert_eq!(ctl.load(&policy).unwrap(), 1);

        let filter = ctl.dump_rules("", RulesetClass::Filter).unwrap();
        assert_eq!(filter.len(), 1);
        assert!(ctl.dump_rules("", RulesetClass::Nat).unwrap().is_empty());
        assert_ne!(ctl.status().unwrap().checksum, before);
    }

    #[test]
    fn failed_load_commits_nothing() {
        let (ctl, _) = loaded();
        let before = ctl.status().unwrap().checksum;

        // The second rule names an interface the host lacks.
        let mut policy = Policy::parse(POLICY).unwrap();
        policy.rules[1].on = "em9".to_string();
        assert!(matches!(ctl.load(&policy), Err(Error::Ioctl(_))));

        let filter = ctl.dump_rules("", RulesetClass::Filter).unwrap();
        assert_eq!(filter.len(), 3);
        assert_eq!(filter[1].spec.ifname, "em0");
        assert_eq!(ctl.status().unwrap().checksum, before);

        // Nothing is left open; the next load goes through.
        policy.rules[1].on = "em1".to_string();
        assert_eq!(ctl.load(&policy).unwrap(), 5);
    }

    #[test]
    fn states_survive_export() {
        let (ctl, policy) = loaded();
        let text = r#"
            [[state]]
            id = 0
            creatorid = 0
            ifname = "em0"
            lan = { addr = "10.0.0.5", port = 40000 }
            gwy = { addr = "198.51.100.1", port = 50000 }
            ext = { addr = "203.0.113.9", port = 22 }
            af = "Inet"
            proto = 6
            direction = "Out"
            creation = 10
            expire = 3600
            packets = [1, 1]
            bytes = [60, 60]
            log = 0
            allow_opts = false
            timeout = 2
            sync_flags = ""

            [state.src]
            seqlo = 1000
            seqhi = 66535
            seqdiff = 0
            max_win = 65535
            mss = 1460
            state = 4
            wscale = 7

            [state.dst]
            seqlo = 5000
            seqhi = 70535
            seqdiff = 0
            max_win = 65535
            mss = 1460
            state = 4
            wscale = 7
        "#;
        assert_eq!(ctl.import_states(text).unwrap(), 1);

        let exported = ctl.export_states().unwrap();

        // A second engine for the same policy picks the table up.
        let peer = PfCtl::open(&policy, discard()).unwrap();
        peer.load(&policy).unwrap();
        assert_eq!(peer.import_states(&exported).unwrap(), 1);

        let mine = ctl.get_states(None).unwrap().states;
        let theirs = peer.get_states(None).unwrap().states;
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].id, mine[0].id);
        assert_eq!(theirs[0].creatorid, 0x1234);
        assert_eq!(theirs[0].gwy, mine[0].gwy);
    }
}
