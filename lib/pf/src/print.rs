// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print command responses in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both pfctl and integration tests.

use crate::api::AltqSpec;
use crate::api::FCNT_STATE_INSERT;
use crate::api::FCNT_STATE_REMOVALS;
use crate::api::FCNT_STATE_SEARCH;
use crate::api::Limit;
use crate::api::PfStatus;
use crate::api::RuleAction;
use crate::api::RuleDump;
use crate::api::RuleSpec;
use crate::api::RulesetClass;
use crate::api::SCNT_SRC_NODE_INSERT;
use crate::api::SCNT_SRC_NODE_REMOVALS;
use crate::api::SCNT_SRC_NODE_SEARCH;
use crate::api::SKIP_NAMES;
use crate::api::SrcNodeDump;
use crate::api::StateRecord;
use crate::api::Timeout;
use crate::api::proto;
use itertools::Itertools;
use std::fmt::Write as _;
use std::io::Write;
use tabwriter::TabWriter;

/// Render a rule the way it would be written in a ruleset file.
pub fn rule_text(r: &RuleSpec) -> String {
    let mut s = r.action.to_string();

    if r.action == RuleAction::Drop && r.return_icmp != 0 {
        let _ = write!(s, " return-icmp {}", r.return_icmp >> 8);
    }
    if let Some(dir) = r.direction {
        let _ = write!(s, " {dir}");
    }
    if r.log != 0 {
        s.push_str(" log");
    }
    if r.quick {
        s.push_str(" quick");
    }
    if !r.ifname.is_empty() {
        let not = if r.ifnot { "! " } else { "" };
        let _ = write!(s, " on {not}{}", r.ifname);
    }
    if let Some(af) = r.af {
        let _ = write!(s, " {af}");
    }
    if r.proto != 0 {
        match proto::name(r.proto) {
            Some(name) => {
                let _ = write!(s, " proto {name}");
            }
            None => {
                let _ = write!(s, " proto {}", r.proto);
            }
        }
    }

    let _ = write!(s, " from {} to {}", r.src, r.dst);

    if r.flagset != 0 {
        let _ = write!(s, " flags {:#04x}/{:#04x}", r.flags, r.flagset);
    }
    if r.keep_state != 0 {
        s.push_str(" keep state");
    }
    if r.allow_opts {
        s.push_str(" allow-opts");
    }
    if !r.label.is_empty() {
        let _ = write!(s, " label \"{}\"", r.label);
    }
    if !r.qname.is_empty() {
        if r.pqname.is_empty() {
            let _ = write!(s, " queue {}", r.qname);
        } else {
            let _ = write!(s, " queue ({}, {})", r.qname, r.pqname);
        }
    }
    if !r.tagname.is_empty() {
        let _ = write!(s, " tag {}", r.tagname);
    }
    if !r.match_tagname.is_empty() {
        let not = if r.match_tag_not { "! " } else { "" };
        let _ = write!(s, " tagged {not}{}", r.match_tagname);
    }
    if !r.anchor_call.is_empty() {
        let _ = write!(s, " anchor \"{}\"", r.anchor_call);
    }

    s
}

/// Print the rules of one queue.
pub fn print_rules(
    class: RulesetClass,
    rules: &[RuleDump],
    verbose: bool,
) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), class, rules, verbose)
}

/// Print the rules of one queue into a given writer. Verbose output
/// adds the counters and skip steps of each rule.
pub fn print_rules_into(
    writer: &mut impl Write,
    class: RulesetClass,
    rules: &[RuleDump],
    verbose: bool,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    if !verbose {
        for rd in rules {
            writeln!(t, "{}", rule_text(&rd.spec))?;
        }
        return t.flush();
    }

    writeln!(t, "{class} rules")?;
    write_hr(&mut t)?;
    writeln!(t, "NR\tEVALS\tPKTS IN\tPKTS OUT\tBYTES\tSTATES\tRULE")?;
    for rd in rules {
        writeln!(
            t,
            "@{}\t{}\t{}\t{}\t{}\t{}\t{}",
            rd.nr,
            rd.evaluations,
            rd.packets[0],
            rd.packets[1],
            rd.bytes[0] + rd.bytes[1],
            rd.states,
            rule_text(&rd.spec),
        )?;
    }
    t.flush()?;

    writeln!(t)?;
    let names = SKIP_NAMES.iter().map(|n| n.to_uppercase()).join("\t");
    writeln!(t, "NR\t{names}")?;
    for rd in rules {
        let steps = rd
            .skip
            .iter()
            .map(|s| match s {
                Some(nr) => nr.to_string(),
                None => "end".to_string(),
            })
            .join("\t");
        writeln!(t, "@{}\t{steps}", rd.nr)?;
    }
    t.flush()
}

/// Print the header for the [`print_state()`] output.
pub fn print_state_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "IF\tPROTO\tDIR\tLAN\tGWY\tEXT\tAGE\tEXPIRES\tPKTS\tBYTES")
}

/// Print a [`StateRecord`].
pub fn print_state(
    t: &mut impl Write,
    st: &StateRecord,
) -> std::io::Result<()> {
    let proto = match proto::name(st.proto) {
        Some(name) => name.to_string(),
        None => st.proto.to_string(),
    };

    writeln!(
        t,
        "{}\t{proto}\t{}\t{}\t{}\t{}\t{}s\t{}s\t{}:{}\t{}:{}",
        st.ifname,
        st.direction,
        st.lan,
        st.gwy,
        st.ext,
        st.creation,
        st.expire,
        st.packets[0],
        st.packets[1],
        st.bytes[0],
        st.bytes[1],
    )
}

/// Print the state table.
pub fn print_states(states: &[StateRecord]) -> std::io::Result<()> {
    print_states_into(&mut std::io::stdout(), states)
}

/// Print the state table into a given writer.
pub fn print_states_into(
    writer: &mut impl Write,
    states: &[StateRecord],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    print_state_header(&mut t)?;
    for st in states {
        print_state(&mut t, st)?;
    }
    t.flush()
}

/// Print the source-tracking table into a given writer.
pub fn print_src_nodes_into(
    writer: &mut impl Write,
    nodes: &[SrcNodeDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ADDR\tROUTE\tRULE\tSTATES\tCONNS\tAGE\tEXPIRES")?;
    for n in nodes {
        let raddr = n.raddr.map(|a| a.to_string()).unwrap_or("-".into());
        let rule = n.rule.map(|nr| format!("@{nr}")).unwrap_or("-".into());
        writeln!(
            t,
            "{}\t{raddr}\t{rule}\t{}\t{}\t{}s\t{}s",
            n.addr, n.states, n.conn, n.creation, n.expire,
        )?;
    }
    t.flush()
}

/// Print a [`PfStatus`] into a given writer.
pub fn print_status_into(
    writer: &mut impl Write,
    status: &PfStatus,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let running = if status.running { "Enabled" } else { "Disabled" };

    writeln!(t, "Status: {running} since {}", status.since)?;
    writeln!(t, "Debug: {}", status.debug)?;
    writeln!(t, "Hostid: {:#010x}", status.hostid)?;
    writeln!(
        t,
        "Checksum: 0x{}",
        status.checksum.iter().map(|b| format!("{b:02x}")).join("")
    )?;
    if !status.ifname.is_empty() {
        writeln!(t, "Interface: {}", status.ifname)?;
    }
    writeln!(t)?;

    writeln!(t, "State Table\tTotal")?;
    writeln!(t, "  current entries\t{}", status.states)?;
    writeln!(t, "  searches\t{}", status.fcounters[FCNT_STATE_SEARCH])?;
    writeln!(t, "  inserts\t{}", status.fcounters[FCNT_STATE_INSERT])?;
    writeln!(t, "  removals\t{}", status.fcounters[FCNT_STATE_REMOVALS])?;
    writeln!(t, "Source Tracking Table\t")?;
    writeln!(t, "  current entries\t{}", status.src_nodes)?;
    writeln!(t, "  searches\t{}", status.scounters[SCNT_SRC_NODE_SEARCH])?;
    writeln!(t, "  inserts\t{}", status.scounters[SCNT_SRC_NODE_INSERT])?;
    writeln!(t, "  removals\t{}", status.scounters[SCNT_SRC_NODE_REMOVALS])?;
    t.flush()
}

/// Print timeout values into a given writer.
pub fn print_timeouts_into(
    writer: &mut impl Write,
    timeouts: &[(Timeout, u32)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    for (to, secs) in timeouts {
        match to {
            Timeout::AdaptiveStart | Timeout::AdaptiveEnd => {
                writeln!(t, "{}\t{secs} states", to.name())?
            }
            _ => writeln!(t, "{}\t{secs}s", to.name())?,
        }
    }
    t.flush()
}

/// Print pool limits into a given writer.
pub fn print_limits_into(
    writer: &mut impl Write,
    limits: &[(Limit, u32)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    for (l, limit) in limits {
        writeln!(t, "{}\thard limit\t{limit}", l.name())?;
    }
    t.flush()
}

/// Print the active ALTQ list into a given writer.
pub fn print_altqs_into(
    writer: &mut impl Write,
    altqs: &[AltqSpec],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "IFACE\tQUEUE\tPARENT\tQID\tBANDWIDTH\tPRI\tQLIMIT")?;
    for a in altqs {
        let qname = if a.is_discipline() { "-" } else { &a.qname };
        let parent = if a.parent.is_empty() { "-" } else { &a.parent };
        writeln!(
            t,
            "{}\t{qname}\t{parent}\t{}\t{}\t{}\t{}",
            a.ifname, a.qid, a.bandwidth, a.priority, a.qlimit,
        )?;
    }
    t.flush()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
