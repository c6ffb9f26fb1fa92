// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Drive the engine end to end through the typed handle.

use pf::api::AddrFamily;
use pf::api::AddrWrap;
use pf::api::AltqSpec;
use pf::api::Direction;
use pf::api::Limit;
use pf::api::NatLookReq;
use pf::api::PfCfg;
use pf::api::PfCmd;
use pf::api::PfError;
use pf::api::PoolAddrSpec;
use pf::api::PoolSelector;
use pf::api::RuleAction;
use pf::api::RuleSpec;
use pf::api::RulesetClass;
use pf::api::StateHost;
use pf::api::StateRecord;
use pf::api::SyncFlags;
use pf::api::Timeout;
use pf::api::XactEntry;
use pf::api::XactKind;
use pf::api::proto;
use pf::engine::Pf;
use pf::provider::ExecCtx;
use pf::provider::MemLog;
use pf::provider::Providers;
use pf_ioctl::Error;
use pf_ioctl::PfHdl;
use std::net::IpAddr;
use std::sync::Arc;

fn engine(cfg: PfCfg) -> Arc<Pf> {
    let p = Providers {
        log: Box::new(MemLog::default()),
        ..Default::default()
    };
    Arc::new(Pf::new(cfg, Arc::new(ExecCtx::from(p))).unwrap())
}

fn hdl() -> PfHdl {
    PfHdl::open(engine(PfCfg::default()))
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn cmd_err(res: Result<impl std::fmt::Debug, Error>) -> PfError {
    match res {
        Err(Error::CommandError(_, e)) => e,
        other => panic!("expected a command error, got {other:?}"),
    }
}

fn pass(port: u16) -> RuleSpec {
    let mut rule = RuleSpec {
        action: RuleAction::Pass,
        proto: proto::TCP,
        ..Default::default()
    };
    rule.dst.port = [port, 0];
    rule.dst.port_op = pf::api::PortOp::Eq;
    rule
}

// ================================================================
// Rules
// ================================================================

#[test]
fn load_and_dump_rules() {
    let hdl = hdl();
    let ticket = hdl.begin_rules("", RulesetClass::Filter).unwrap();
    for port in [22, 80, 443] {
        hdl.add_rule("", ticket, None, pass(port)).unwrap();
    }
    hdl.commit_rules("", RulesetClass::Filter, ticket).unwrap();

    let rules = hdl.dump_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(rules.len(), 3);
    assert_eq!(rules[2].nr, 2);
    assert_eq!(rules[2].spec.dst.port[0], 443);

    // Spent.
    let err = cmd_err(hdl.commit_rules("", RulesetClass::Filter, ticket));
    assert!(matches!(err, PfError::Busy(_)));
}

#[test]
fn stale_ticket_reports_busy() {
    let hdl = hdl();
    let a = hdl.begin_rules("", RulesetClass::Filter).unwrap();
    let _b = hdl.begin_rules("", RulesetClass::Filter).unwrap();
    let err = hdl.add_rule("", a, None, pass(22)).unwrap_err();
    assert!(err.is_busy());
    assert_eq!(err.cmd_err().map(PfError::to_errno), Some(libc::EBUSY));
}

#[test]
fn anchors_listed() {
    let hdl = hdl();
    for anchor in ["web", "mail", "web/v6"] {
        let ticket = hdl.begin_rules(anchor, RulesetClass::Filter).unwrap();
        hdl.add_rule(anchor, ticket, None, pass(25)).unwrap();
        hdl.commit_rules(anchor, RulesetClass::Filter, ticket).unwrap();
    }

    assert_eq!(hdl.list_rulesets("").unwrap(), vec!["mail", "web"]);
    assert_eq!(hdl.list_rulesets("web").unwrap(), vec!["v6"]);
    let err = cmd_err(hdl.list_rulesets("nope"));
    assert!(matches!(err, PfError::NotFound(_)));
}

#[test]
fn nat_rule_takes_staged_pool() {
    let hdl = hdl();
    let nat = RuleSpec {
        action: RuleAction::Nat,
        af: Some(AddrFamily::Inet),
        ..Default::default()
    };

    // Without a pool the rule is refused.
    let ticket = hdl.begin_rules("", RulesetClass::Nat).unwrap();
    let err = cmd_err(hdl.add_rule("", ticket, None, nat.clone()));
    assert!(matches!(err, PfError::InvalidArgument(_)));

    let pool = hdl.begin_addrs().unwrap();
    for a in ["192.0.2.1", "192.0.2.2"] {
        let spec = PoolAddrSpec {
            addr: AddrWrap::net(ip(a), 32),
            ifname: String::new(),
        };
        hdl.add_addr(pool, AddrFamily::Inet, spec).unwrap();
    }
    let v6 = PoolAddrSpec {
        addr: AddrWrap::net(ip("2001:db8::1"), 128),
        ifname: String::new(),
    };
    let err = cmd_err(hdl.add_addr(pool, AddrFamily::Inet, v6));
    assert!(matches!(err, PfError::InvalidArgument(_)));

    hdl.add_rule("", ticket, Some(pool), nat).unwrap();
    hdl.commit_rules("", RulesetClass::Nat, ticket).unwrap();

    let sel = PoolSelector {
        anchor: String::new(),
        action: RuleAction::Nat,
        nr: 0,
        last: false,
    };
    let resp = hdl.get_addrs(&sel).unwrap();
    assert_eq!(resp.nr, 2);
    let second = hdl.get_addr(&sel, resp.ticket, 1).unwrap();
    assert_eq!(second.addr.addr, AddrWrap::net(ip("192.0.2.2"), 32));
    let err = cmd_err(hdl.get_addr(&sel, resp.ticket + 1, 0));
    assert!(matches!(err, PfError::Busy(_)));
}

#[test]
fn grouped_load() {
    let hdl = hdl();
    let entries = hdl
        .xbegin(vec![
            XactEntry::new(XactKind::Rules(RulesetClass::Scrub), ""),
            XactEntry::new(XactKind::Rules(RulesetClass::Filter), ""),
            XactEntry::new(XactKind::Altq, ""),
        ])
        .unwrap();
    let scrub = RuleSpec { action: RuleAction::Scrub, ..Default::default() };
    hdl.add_rule("", entries[0].ticket, None, scrub).unwrap();
    hdl.add_rule("", entries[1].ticket, None, pass(22)).unwrap();
    let altq = AltqSpec {
        ifname: "em0".to_string(),
        bandwidth: 100_000_000,
        ..Default::default()
    };
    hdl.add_altq(entries[2].ticket, altq).unwrap();
    hdl.xcommit(&entries).unwrap();

    assert_eq!(hdl.dump_rules("", RulesetClass::Scrub).unwrap().len(), 1);
    assert_eq!(hdl.dump_rules("", RulesetClass::Filter).unwrap().len(), 1);
    assert_eq!(hdl.dump_altqs().unwrap().len(), 1);

    // Committing again finds every ticket spent.
    let err = cmd_err(hdl.xcommit(&entries));
    assert!(matches!(err, PfError::Busy(_)));
}

// ================================================================
// Access
// ================================================================

#[test]
fn read_only_handle() {
    let pf = engine(PfCfg::default());
    let admin = PfHdl::open(Arc::clone(&pf));
    let ro = PfHdl::open_read_only(pf);

    admin.start().unwrap();
    assert!(ro.status().unwrap().running);
    assert_eq!(ro.get_rules("", RulesetClass::Filter).unwrap().nr, 0);

    let err = cmd_err(ro.begin_rules("", RulesetClass::Filter));
    assert!(matches!(err, PfError::PermissionDenied(_)));
    let err = cmd_err(ro.clear_status());
    assert!(matches!(err, PfError::PermissionDenied(_)));
}

#[test]
fn raised_securelevel() {
    let cfg = PfCfg { securelevel: 2, ..Default::default() };
    let hdl = PfHdl::open(engine(cfg));

    let err = cmd_err(hdl.begin_rules("", RulesetClass::Filter));
    assert!(matches!(err, PfError::PermissionDenied(_)));
    let err = cmd_err(hdl.set_timeout(Timeout::Interval, 5));
    assert!(matches!(err, PfError::PermissionDenied(_)));

    // Reads, and a few housekeeping writes, are still allowed.
    hdl.status().unwrap();
    hdl.clear_status().unwrap();
    hdl.clear_rule_counters().unwrap();
    assert_eq!(hdl.clear_src_nodes().unwrap(), 0);
}

// ================================================================
// States
// ================================================================

fn record(lan: u16) -> StateRecord {
    StateRecord {
        id: 0,
        creatorid: 0,
        ifname: "em0".to_string(),
        lan: StateHost::new(ip("10.0.0.5"), lan),
        gwy: StateHost::new(ip("192.0.2.1"), 60000 + lan),
        ext: StateHost::new(ip("198.51.100.7"), 443),
        src: Default::default(),
        dst: Default::default(),
        rule: None,
        nat_rule: None,
        anchor: None,
        af: AddrFamily::Inet,
        proto: proto::TCP,
        direction: Direction::Out,
        creation: 10,
        expire: 3600,
        packets: [1, 1],
        bytes: [60, 60],
        log: 0,
        allow_opts: false,
        timeout: Timeout::TcpEstablished as u8,
        sync_flags: SyncFlags::empty(),
    }
}

#[test]
fn state_import_export() {
    let hdl = hdl();
    let added = hdl.add_states((1..=3).map(record).collect()).unwrap();
    assert_eq!(added, 3);
    hdl.add_state(record(4)).unwrap();

    let all = hdl.get_states(None).unwrap();
    assert_eq!(all.total, 4);
    assert_eq!(all.states.len(), 4);
    assert_eq!(hdl.status().unwrap().states, 4);

    let first = hdl.get_state(0).unwrap();
    assert_eq!(first.lan.port, 1);
    assert_eq!(first.ext, StateHost::new(ip("198.51.100.7"), 443));

    let req = NatLookReq {
        direction: Direction::In,
        af: AddrFamily::Inet,
        proto: proto::TCP,
        saddr: ip("192.0.2.1"),
        sport: 60002,
        daddr: ip("198.51.100.7"),
        dport: 443,
    };
    let r = hdl.natlook(&req).unwrap();
    assert_eq!((r.rsaddr, r.rsport), (ip("10.0.0.5"), 2));

    // A failing import stops the batch.
    let err = cmd_err(hdl.add_states(vec![record(5), record(1)]));
    assert!(matches!(err, PfError::Exists(_)));
    assert_eq!(hdl.get_states(Some(0)).unwrap().total, 5);

    assert_eq!(hdl.clear_states("em1").unwrap(), 0);
    assert_eq!(hdl.clear_states("").unwrap(), 5);
}

// ================================================================
// Tunables
// ================================================================

#[test]
fn timeouts_and_limits() {
    let hdl = hdl();
    let old = hdl.set_timeout(Timeout::TcpEstablished, 3600).unwrap();
    assert_eq!(old, Timeout::TcpEstablished.default_secs());
    assert_eq!(hdl.get_timeout(Timeout::TcpEstablished).unwrap(), 3600);

    // An interval of zero would never purge.
    hdl.set_timeout(Timeout::Interval, 0).unwrap();
    assert_eq!(hdl.get_timeout(Timeout::Interval).unwrap(), 1);

    let old = hdl.set_limit(Limit::States, 2).unwrap();
    assert_eq!(old, Limit::States.default_limit());
    hdl.add_states(vec![record(1), record(2)]).unwrap();
    let err = cmd_err(hdl.add_state(record(3)));
    assert!(matches!(err, PfError::ResourceExhausted(_)));
    let err = cmd_err(hdl.set_limit(Limit::States, 1));
    assert!(matches!(err, PfError::Busy(_)));

    let err = cmd_err(hdl.set_hostid(0));
    assert!(matches!(err, PfError::InvalidArgument(_)));
    hdl.set_hostid(0xfeed).unwrap();
    assert_eq!(hdl.status().unwrap().hostid, 0xfeed);
}

#[test]
fn refused_commands() {
    let hdl = hdl();
    let err = cmd_err(hdl.change_altq());
    assert!(matches!(err, PfError::NoDevice(_)));
    let err = cmd_err(hdl.stop_altq());
    assert!(matches!(err, PfError::NotFound(_)));

    let err = hdl.stop().unwrap_err();
    assert!(matches!(err, Error::CommandError(PfCmd::Stop, _)));
}
