// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rule transactions: tickets, commit and rollback, grouped
//! transactions, anchors, and what the packet path observes while
//! they run.

#[macro_use]
mod common;

use common::*;
use pf::api::AddAddrReq;
use pf::api::ChangeAddrReq;
use pf::api::ChangeRuleReq;
use pf::api::PoolAddrSpec;
use pf::api::PoolChange;
use pf::api::PoolSelector;
use pf::api::RuleChange;
use pf::api::XactEntry;
use pf::api::XactKind;
use pf::engine::sync_hash::ruleset_digest;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

// ================================================================
// Tickets
// ================================================================

// Every begin, of whatever kind, hands out a larger ticket than the
// one before it.
#[test]
fn tickets_increase_across_kinds() {
    let pf = test_pf();
    let t1 = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let t2 = pf.begin_addrs();
    let t3 = pf.begin_altq();
    let t4 = pf.begin_rules("", RulesetClass::Nat).unwrap();
    let entries = pf
        .xbegin(vec![
            XactEntry::new(XactKind::Rules(RulesetClass::Rdr), ""),
            XactEntry::new(XactKind::Table, ""),
        ])
        .unwrap();

    assert!(t1 > 0);
    assert!(t1 < t2 && t2 < t3 && t3 < t4);
    assert!(t4 < entries[0].ticket);
    assert!(entries[0].ticket < entries[1].ticket);
}

#[test]
fn stale_ticket_leaves_active_queue_alone() {
    let pf = test_pf();
    let active = load(&pf, "", vec![block_all()]);

    let stale = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let fresh = pf.begin_rules("", RulesetClass::Filter).unwrap();
    assert!(fresh > stale);

    let req = AddRuleReq {
        anchor: String::new(),
        ticket: stale,
        pool_ticket: None,
        rule: pass_tcp(22),
    };
    assert_err!(pf.add_rule(req), PfError::Busy(_));
    assert_err!(
        pf.commit_rules("", RulesetClass::Filter, stale),
        PfError::Busy(_)
    );

    // A rollback with a stale ticket is a no-op.
    pf.rollback_rules("", RulesetClass::Filter, stale);

    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 1);
    assert_eq!(resp.ticket, active);

    // The newer transaction is still open.
    pf.commit_rules("", RulesetClass::Filter, fresh).unwrap();
    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 0);
    assert_eq!(resp.ticket, fresh);
}

// Two clients race to load the filter queue; the one that began last
// wins and the other is told to retry.
#[test]
fn racing_loaders() {
    let pf = test_pf();
    let a = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let b = pf.begin_rules("", RulesetClass::Filter).unwrap();

    let req = AddRuleReq {
        anchor: String::new(),
        ticket: b,
        pool_ticket: None,
        rule: pass_tcp(443),
    };
    pf.add_rule(req).unwrap();
    pf.commit_rules("", RulesetClass::Filter, b).unwrap();
    assert_err!(
        pf.commit_rules("", RulesetClass::Filter, a),
        PfError::Busy(_)
    );

    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 1);
    let rule = pf.get_rule("", RulesetClass::Filter, b, 0).unwrap();
    assert_eq!(rule.spec.dst.port, [443, 0]);
}

// ================================================================
// Loading rules
// ================================================================

#[test]
fn load_single_pass_rule() {
    let pf = test_pf();
    let ticket = load(&pf, "", vec![pass_tcp(22)]);

    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 1);
    assert_eq!(resp.ticket, ticket);

    let dump = pf.get_rule("", RulesetClass::Filter, ticket, 0).unwrap();
    assert_eq!(dump.nr, 0);
    assert_eq!(dump.spec.proto, proto::TCP);
    assert_eq!(dump.states, 0);
    assert_eq!(dump.skip, [None; pf::api::SKIP_COUNT]);

    assert_err!(
        pf.get_rule("", RulesetClass::Filter, ticket, 1),
        PfError::NotFound(_)
    );
    assert_err!(
        pf.get_rule("", RulesetClass::Filter, ticket + 1, 0),
        PfError::Busy(_)
    );
}

#[test]
fn unsupported_family_rejected_at_add() {
    let pf = test_pf_cfg(PfCfg { inet6: false, ..Default::default() });
    let ticket = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let rule = RuleSpec {
        af: Some(AddrFamily::Inet6),
        ..pass_tcp(22)
    };
    let req = AddRuleReq {
        anchor: String::new(),
        ticket,
        pool_ticket: None,
        rule,
    };
    assert_err!(pf.add_rule(req), PfError::Unsupported(AddrFamily::Inet6));

    // Nothing was staged; the commit installs an empty queue.
    pf.commit_rules("", RulesetClass::Filter, ticket).unwrap();
    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 0);
    assert_eq!(pf.rule_count(), 1);
}

#[test]
fn replaced_rules_are_freed() {
    let pf = test_pf();
    let rules = vec![
        RuleSpec { ifname: "em0".into(), ..pass_tcp(22) },
        RuleSpec { ifname: "em1".into(), ..pass_tcp(80) },
    ];
    load(&pf, "", rules);
    assert_eq!(pf.rule_count(), 3);
    assert_eq!(pf.ifaces.refs("em0"), 1);
    assert_eq!(pf.ifaces.refs("em1"), 1);

    load(&pf, "", vec![block_all()]);
    assert_eq!(pf.rule_count(), 2);
    assert_eq!(pf.ifaces.total_refs(), 0);
}

#[test]
fn rollback_discards_staged_rules() {
    let pf = test_pf();
    let ticket = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let req = AddRuleReq {
        anchor: String::new(),
        ticket,
        pool_ticket: None,
        rule: RuleSpec { ifname: "em1".into(), ..pass_tcp(22) },
    };
    pf.add_rule(req).unwrap();
    assert_eq!(pf.rule_count(), 2);
    assert_eq!(pf.ifaces.refs("em1"), 1);

    pf.rollback_rules("", RulesetClass::Filter, ticket);
    assert_eq!(pf.rule_count(), 1);
    assert_eq!(pf.ifaces.total_refs(), 0);
    assert_err!(
        pf.commit_rules("", RulesetClass::Filter, ticket),
        PfError::Busy(_)
    );
}

#[test]
fn unknown_interface_rejected() {
    let pf = test_pf();
    let ticket = pf.begin_rules("", RulesetClass::Filter).unwrap();
    let req = AddRuleReq {
        anchor: String::new(),
        ticket,
        pool_ticket: None,
        rule: RuleSpec { ifname: "vioif9".into(), ..pass_tcp(22) },
    };
    assert!(pf.add_rule(req).is_err());
    assert_eq!(pf.rule_count(), 1);
}

// ================================================================
// Tags
// ================================================================

#[test]
fn tag_names_released_with_their_rules() {
    let pf = test_pf();
    assert_eq!(pf.tag_count(), 0);

    let rules = vec![
        RuleSpec { tagname: "web".into(), ..pass_tcp(80) },
        RuleSpec { tagname: "web".into(), ..pass_tcp(443) },
        RuleSpec {
            match_tagname: "ssh".into(),
            ..pass_tcp(22)
        },
    ];
    let ticket = load(&pf, "", rules);
    assert_eq!(pf.tag_count(), 2);

    let a = pf.get_rule("", RulesetClass::Filter, ticket, 0).unwrap();
    let b = pf.get_rule("", RulesetClass::Filter, ticket, 1).unwrap();
    let c = pf.get_rule("", RulesetClass::Filter, ticket, 2).unwrap();
    assert_ne!(a.tag, 0);
    assert_eq!(a.tag, b.tag);
    assert_ne!(c.match_tag, 0);
    assert_ne!(c.match_tag, a.tag);

    load(&pf, "", vec![block_all()]);
    assert_eq!(pf.tag_count(), 0);
}

// ================================================================
// In-place changes
// ================================================================

#[test]
fn change_rule_in_place() {
    let pf = test_pf();
    load(&pf, "", vec![pass_tcp(22), pass_tcp(80)]);

    let get_ticket = ChangeRuleReq {
        action: RuleChange::GetTicket,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket: 0,
        pool_ticket: None,
        nr: 0,
        rule: None,
    };
    let ticket = pf.change_rule(get_ticket).unwrap();

    let add = ChangeRuleReq {
        action: RuleChange::AddBefore,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket,
        pool_ticket: Some(pf.begin_addrs()),
        nr: 1,
        rule: Some(pass_tcp(53)),
    };
    let ticket = pf.change_rule(add).unwrap();
    let ports: Vec<u16> = (0..3)
        .map(|nr| {
            let d = pf.get_rule("", RulesetClass::Filter, ticket, nr);
            d.unwrap().spec.dst.port[0]
        })
        .collect();
    assert_eq!(ports, vec![22, 53, 80]);

    let remove = ChangeRuleReq {
        action: RuleChange::Remove,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket,
        pool_ticket: None,
        nr: 0,
        rule: None,
    };
    let ticket2 = pf.change_rule(remove).unwrap();
    assert!(ticket2 > ticket);
    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 2);
    assert_eq!(pf.rule_count(), 3);

    // The old ticket no longer matches the active queue.
    let stale = ChangeRuleReq {
        action: RuleChange::AddTail,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket,
        pool_ticket: Some(pf.begin_addrs()),
        nr: 0,
        rule: Some(block_all()),
    };
    assert_err!(pf.change_rule(stale), PfError::Busy(_));
}

fn change_ticket(pf: &Pf) -> u64 {
    let req = ChangeRuleReq {
        action: RuleChange::GetTicket,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket: 0,
        pool_ticket: None,
        nr: 0,
        rule: None,
    };
    pf.change_rule(req).unwrap()
}

fn add_tail(ticket: u64, pool_ticket: Option<u64>) -> ChangeRuleReq {
    ChangeRuleReq {
        action: RuleChange::AddTail,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket,
        pool_ticket,
        nr: 0,
        rule: Some(pass_tcp(53)),
    }
}

#[test]
fn change_rule_add_needs_pool_ticket() {
    let pf = test_pf();
    load(&pf, "", vec![pass_tcp(22)]);
    let ticket = change_ticket(&pf);

    assert_err!(pf.change_rule(add_tail(ticket, None)), PfError::Busy(_));

    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 1);
    assert_eq!(resp.ticket, ticket);
    assert_eq!(pf.rule_count(), 2);

    // A remove never touches the pool buffer.
    let remove = ChangeRuleReq {
        action: RuleChange::Remove,
        anchor: String::new(),
        class: RulesetClass::Filter,
        ticket,
        pool_ticket: None,
        nr: 0,
        rule: None,
    };
    pf.change_rule(remove).unwrap();
    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 0);
}

#[test]
fn change_rule_add_stale_pool_ticket() {
    let pf = test_pf();
    load(&pf, "", vec![pass_tcp(22)]);
    let ticket = change_ticket(&pf);

    let stale = pf.begin_addrs();
    let fresh = pf.begin_addrs();
    assert_err!(
        pf.change_rule(add_tail(ticket, Some(stale))),
        PfError::Busy(_)
    );
    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 1);

    let ticket = pf.change_rule(add_tail(ticket, Some(fresh))).unwrap();
    let resp = pf.get_rules("", RulesetClass::Filter).unwrap();
    assert_eq!(resp.nr, 2);
    assert_eq!(resp.ticket, ticket);
}

// ================================================================
// Anchors
// ================================================================

#[test]
fn anchors_live_while_used() {
    let pf = test_pf();
    load(&pf, "outer/inner", vec![pass_tcp(22)]);
    assert!(pf.anchor_exists("outer"));
    assert!(pf.anchor_exists("outer/inner"));
    assert_eq!(pf.get_rulesets("").unwrap(), 1);
    assert_eq!(pf.get_ruleset("", 0).unwrap(), "outer");
    assert_eq!(pf.get_ruleset("outer", 0).unwrap(), "inner");
    assert_err!(pf.get_ruleset("outer", 1), PfError::NotFound(_));
    assert_err!(pf.get_rulesets("nope"), PfError::NotFound(_));

    // A rule calling the anchor keeps it alive once emptied.
    let call = RuleSpec {
        anchor_call: "outer/inner".into(),
        ..Default::default()
    };
    load(&pf, "", vec![call]);
    load(&pf, "outer/inner", vec![]);
    assert!(pf.anchor_exists("outer/inner"));

    let snap = pf.snapshot();
    let q = snap.queue("", RulesetClass::Filter).unwrap();
    assert_eq!(snap.called_rulesets(&q.rules[0]), vec!["outer/inner"]);
    drop(snap);

    load(&pf, "", vec![]);
    assert!(!pf.anchor_exists("outer/inner"));
    assert!(!pf.anchor_exists("outer"));
    assert!(pf.anchor_exists(""));
}

// ================================================================
// Grouped transactions
// ================================================================

#[test]
fn grouped_commit_applies_every_entry() {
    let pf = test_pf();
    let entries = pf
        .xbegin(vec![
            XactEntry::new(XactKind::Rules(RulesetClass::Filter), ""),
            XactEntry::new(XactKind::Rules(RulesetClass::Filter), "lab"),
            XactEntry::new(XactKind::Table, ""),
        ])
        .unwrap();

    for (e, port) in entries[..2].iter().zip([22, 80]) {
        let req = AddRuleReq {
            anchor: e.anchor.clone(),
            ticket: e.ticket,
            pool_ticket: None,
            rule: pass_tcp(port),
        };
        pf.add_rule(req).unwrap();
    }

    let before = pf.snapshot().generation;
    pf.xcommit(&entries).unwrap();
    assert_eq!(pf.snapshot().generation, before + 1);
    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 1);
    assert_eq!(pf.get_rules("lab", RulesetClass::Filter).unwrap().nr, 1);
    assert_eq!(pf.tables.commits(""), 1);
}

#[test]
fn grouped_commit_checks_every_ticket_first() {
    let pf = test_pf();
    let entries = pf
        .xbegin(vec![
            XactEntry::new(XactKind::Table, ""),
            XactEntry::new(XactKind::Rules(RulesetClass::Filter), ""),
        ])
        .unwrap();

    // Someone else takes over the filter queue.
    let other = pf.begin_rules("", RulesetClass::Filter).unwrap();

    assert_err!(pf.xcommit(&entries), PfError::Busy(_));
    assert_eq!(pf.tables.commits(""), 0);

    pf.xrollback(&entries).unwrap();
    pf.commit_rules("", RulesetClass::Filter, other).unwrap();
}

#[test]
fn altq_entries_only_on_the_main_ruleset() {
    let pf = test_pf();
    let res = pf.xbegin(vec![
        XactEntry::new(XactKind::Rules(RulesetClass::Filter), ""),
        XactEntry::new(XactKind::Altq, "lab"),
    ]);
    assert_err!(res, PfError::InvalidArgument(_));
}

// ================================================================
// Snapshot visibility
// ================================================================

// While one thread replaces the filter queue over and over, a reader
// must only ever see a queue that was committed whole, with the skip
// steps and digest that go with it.
#[test]
fn readers_see_whole_commits() {
    let pf = test_pf();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200usize {
                let n = i % 5 + 1;
                let label = format!("batch{i}-{n}");
                let rules = (0..n)
                    .map(|j| RuleSpec {
                        label: label.clone(),
                        ..pass_tcp(1000 + j as u16)
                    })
                    .collect();
                load(&pf, "", rules);
            }
            done.store(true, Ordering::Release);
        });

        let mut last_gen = 0;
        let mut reads = 0;
        while !done.load(Ordering::Acquire) || reads == 0 {
            let snap = pf.snapshot();
            assert!(snap.generation >= last_gen);
            last_gen = snap.generation;

            let main = &snap.rulesets[""];
            let q = main.queue(RulesetClass::Filter);
            assert_eq!(q.skip.len(), q.rules.len());
            if let Some(first) = q.rules.first() {
                let label = &first.spec.label;
                let n: usize =
                    label.rsplit('-').next().unwrap().parse().unwrap();
                assert_eq!(q.rules.len(), n);
                assert!(q.rules.iter().all(|r| &r.spec.label == label));
            }

            let digest =
                ruleset_digest(main.queues.iter().map(|q| q.as_ref()));
            assert_eq!(snap.digest, digest);
            reads += 1;
        }
    });

    assert_eq!(pf.get_rules("", RulesetClass::Filter).unwrap().nr, 5);
    assert_eq!(pf.rule_count(), 6);
}

fn pool_spec(a: &str) -> PoolAddrSpec {
    PoolAddrSpec { addr: AddrWrap::net(ip(a), 32), ifname: "em1".to_string() }
}

// Round-robin picks on an active rule keep going while its pool is
// edited, and each edit gives back exactly the references it took.
#[test]
fn pool_picks_while_edited() {
    let pf = test_pf();
    let base = pf.ifaces.refs("em1");

    let pool = pf.begin_addrs();
    for a in ["198.51.100.1", "198.51.100.2"] {
        let req = AddAddrReq {
            ticket: pool,
            af: AddrFamily::Inet,
            addr: pool_spec(a),
        };
        pf.add_addr(req).unwrap();
    }
    let ticket = pf.begin_rules("", RulesetClass::Nat).unwrap();
    let nat = RuleSpec {
        action: RuleAction::Nat,
        af: Some(AddrFamily::Inet),
        ..Default::default()
    };
    let req = AddRuleReq {
        anchor: String::new(),
        ticket,
        pool_ticket: Some(pool),
        rule: nat,
    };
    pf.add_rule(req).unwrap();
    pf.commit_rules("", RulesetClass::Nat, ticket).unwrap();
    assert_eq!(pf.ifaces.refs("em1"), base + 2);

    let snap = pf.snapshot();
    let q = snap.queue("", RulesetClass::Nat).unwrap();
    let rule = Arc::clone(&q.rules[0]);
    let sel = PoolSelector {
        anchor: String::new(),
        action: RuleAction::Nat,
        nr: 0,
        last: false,
    };
    let known = ["198.51.100.1", "198.51.100.2", "198.51.100.3"]
        .map(|a| AddrWrap::net(ip(a), 32));
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                let add = ChangeAddrReq {
                    action: PoolChange::AddTail,
                    sel: sel.clone(),
                    ticket,
                    nr: 0,
                    af: AddrFamily::Inet,
                    addr: Some(pool_spec("198.51.100.3")),
                };
                pf.change_addr(add).unwrap();
                let remove = ChangeAddrReq {
                    action: PoolChange::Remove,
                    sel: sel.clone(),
                    ticket,
                    nr: 2,
                    af: AddrFamily::Inet,
                    addr: None,
                };
                pf.change_addr(remove).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        let mut picks = 0;
        while !done.load(Ordering::Acquire) || picks == 0 {
            let (af, spec) = rule.next_pool_addr().unwrap();
            assert_eq!(af, AddrFamily::Inet);
            assert!(known.contains(&spec.addr));
            picks += 1;
        }
    });

    assert_eq!(rule.pool_len(), 2);
    assert_eq!(pf.ifaces.refs("em1"), base + 2);

    // Freeing the rule gives back the pool's references.
    let ticket = pf.begin_rules("", RulesetClass::Nat).unwrap();
    pf.commit_rules("", RulesetClass::Nat, ticket).unwrap();
    assert_eq!(pf.ifaces.refs("em1"), base);
}

#[test]
fn digest_tracks_the_main_ruleset() {
    let pf = test_pf();
    let empty = pf.status().checksum;

    load(&pf, "", vec![pass_tcp(22)]);
    let one = pf.status().checksum;
    assert_ne!(one, empty);
    assert_eq!(pf.snapshot().digest, one);

    // Anchors and scrub rules do not contribute.
    load(&pf, "lab", vec![pass_tcp(80)]);
    let scrub = RuleSpec { action: RuleAction::Scrub, ..Default::default() };
    load(&pf, "", vec![scrub]);
    assert_eq!(pf.status().checksum, one);

    load(&pf, "", vec![pass_tcp(22)]);
    assert_eq!(pf.status().checksum, one);
}
