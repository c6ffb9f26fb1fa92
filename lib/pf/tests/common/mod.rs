// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than its worth here.
#![allow(dead_code)]

pub use pf::api::AddRuleReq;
pub use pf::api::AddrFamily;
pub use pf::api::AddrWrap;
pub use pf::api::Direction;
pub use pf::api::PfCfg;
pub use pf::api::PfError;
pub use pf::api::RuleAction;
pub use pf::api::RuleAddr;
pub use pf::api::RuleSpec;
pub use pf::api::RulesetClass;
pub use pf::api::StateHost;
pub use pf::api::Timeout;
pub use pf::api::proto;
pub use pf::engine::Pf;
pub use pf::engine::rule::Rule;
pub use pf::engine::rule::RuleHandle;
pub use pf::engine::state::NewState;
pub use pf::provider::ExecCtx;
pub use pf::provider::ManualClock;
pub use pf::provider::MemIfaces;
pub use pf::provider::MemLog;
pub use pf::provider::MemTables;
pub use pf::provider::NullAltq;
pub use pf::provider::Providers;
pub use std::net::IpAddr;
pub use std::sync::Arc;

/// The instant every test engine starts at.
pub const T0: u64 = 1_000_000;

/// An engine plus handles on the providers it was built with, so a
/// test can move the clock and inspect reference counts.
pub struct TestPf {
    pub pf: Pf,
    pub clock: Arc<ManualClock>,
    pub ifaces: Arc<MemIfaces>,
    pub tables: Arc<MemTables>,
    pub log: Arc<MemLog>,
}

impl core::ops::Deref for TestPf {
    type Target = Pf;

    fn deref(&self) -> &Pf {
        &self.pf
    }
}

pub fn test_pf() -> TestPf {
    test_pf_cfg(PfCfg { hostid: Some(0x1234), ..Default::default() })
}

pub fn test_pf_cfg(cfg: PfCfg) -> TestPf {
    let clock = Arc::new(ManualClock::new(T0));
    let ifaces = Arc::new(MemIfaces::new(["em0", "em1", "lo0"]));
    let tables = Arc::new(MemTables::default());
    let log = Arc::new(MemLog::default());
    let p = Providers {
        log: Box::new(Arc::clone(&log)),
        clock: Box::new(Arc::clone(&clock)),
        ifaces: Box::new(Arc::clone(&ifaces)),
        tables: Box::new(Arc::clone(&tables)),
        altq: Box::new(NullAltq),
    };
    let pf = Pf::new(cfg, Arc::new(ExecCtx::from(p))).unwrap();
    TestPf { pf, clock, ifaces, tables, log }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn host(s: &str, port: u16) -> StateHost {
    StateHost::new(ip(s), port)
}

/// `pass [dir] proto tcp ... to port <port>`
pub fn pass_tcp(port: u16) -> RuleSpec {
    RuleSpec {
        action: RuleAction::Pass,
        proto: proto::TCP,
        dst: RuleAddr {
            port: [port, 0],
            port_op: pf::api::PortOp::Eq,
            ..Default::default()
        },
        keep_state: 1,
        ..Default::default()
    }
}

/// `block all`
pub fn block_all() -> RuleSpec {
    RuleSpec { action: RuleAction::Drop, ..Default::default() }
}

/// Replace the `class` queue of `anchor` with `specs` in a single
/// transaction, returning the ticket that became active.
pub fn load(pf: &Pf, anchor: &str, specs: Vec<RuleSpec>) -> u64 {
    let class = specs
        .first()
        .map(|s| s.action.class())
        .unwrap_or(RulesetClass::Filter);
    let ticket = pf.begin_rules(anchor, class).unwrap();
    for rule in specs {
        assert_eq!(rule.action.class(), class);
        let req = AddRuleReq {
            anchor: anchor.to_string(),
            ticket,
            pool_ticket: None,
            rule,
        };
        pf.add_rule(req).unwrap();
    }
    pf.commit_rules(anchor, class, ticket).unwrap();
    ticket
}

/// Active rule `nr` of the main filter queue.
pub fn active_rule(pf: &Pf, nr: usize) -> Arc<Rule> {
    let snap = pf.snapshot();
    let q = snap.queue("", RulesetClass::Filter).unwrap();
    Arc::clone(&q.rules[nr])
}

pub fn filter_rule(pf: &Pf, nr: usize) -> RuleHandle {
    active_rule(pf, nr).handle()
}

/// An outbound TCP flow from `lan` to `ext`, with no translation.
pub fn flow(lan: StateHost, ext: StateHost, rule: RuleHandle) -> NewState {
    NewState {
        kif: "em0".to_string(),
        af: AddrFamily::of(&lan.addr),
        proto: proto::TCP,
        direction: Direction::Out,
        lan,
        gwy: lan,
        ext,
        rule,
        nat_rule: None,
        anchor: None,
        src_node: None,
        nat_src_node: None,
        timeout: Timeout::TcpEstablished,
    }
}

/// Assert that `$res` is an `Err` matching `$pat`.
macro_rules! assert_err {
    ($res:expr, $pat:pat) => {
        match $res {
            Err($pat) => {}
            other => panic!(
                "expected Err({}), got {:?}",
                stringify!($pat),
                other
            ),
        }
    };
}
