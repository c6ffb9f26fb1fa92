// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The ruleset sync digest.
//!
//! Peers compare this digest to decide whether they run the same
//! policy, so the fields fed to the hash and their order are fixed.
//! Multi-byte integers are hashed big-endian; names are hashed either
//! as their bytes or, where the kernel holds them in a fixed buffer,
//! NUL-padded to that buffer's size.

use super::rule::ActiveQueue;
use super::rule::Rule;
use crate::api::AddrFamily;
use crate::api::AddrWrap;
use crate::api::Direction;
use crate::api::IFNAMSIZ;
use crate::api::RuleAddr;
use crate::api::TABLE_NAME_SIZE;
use crate::api::addr_bytes;
use md5::Digest;
use md5::Md5;

fn hash_padded(ctx: &mut Md5, s: &str, size: usize) {
    let mut buf = vec![0u8; size];
    let n = s.len().min(size);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    ctx.update(&buf);
}

fn hash_rule_addr(ctx: &mut Md5, ra: &RuleAddr) {
    ctx.update([ra.addr.addr_type() as u8]);

    match &ra.addr {
        AddrWrap::DynIfTl { ifname, iflags } => {
            hash_padded(ctx, ifname, IFNAMSIZ);
            ctx.update([*iflags]);
        }
        AddrWrap::Table { name } => hash_padded(ctx, name, TABLE_NAME_SIZE),
        AddrWrap::AddrMask { addr, mask } => {
            ctx.update(addr_bytes(addr));
            ctx.update(addr_bytes(mask));
        }
        AddrWrap::NoRoute => {}
    }

    ctx.update(ra.port[0].to_be_bytes());
    ctx.update(ra.port[1].to_be_bytes());
    ctx.update([u8::from(ra.neg), ra.port_op as u8]);
}

fn hash_rule(ctx: &mut Md5, rule: &Rule) {
    let r = &rule.spec;
    hash_rule_addr(ctx, &r.src);
    hash_rule_addr(ctx, &r.dst);

    ctx.update(r.label.as_bytes());
    ctx.update(r.ifname.as_bytes());
    ctx.update(r.match_tagname.as_bytes());

    ctx.update(rule.match_tag.to_be_bytes());

    ctx.update(r.os_fingerprint.to_be_bytes());
    ctx.update(r.prob.to_be_bytes());
    ctx.update(r.uid.ids[0].to_be_bytes());
    ctx.update(r.uid.ids[1].to_be_bytes());
    ctx.update([r.uid.op as u8]);
    ctx.update(r.gid.ids[0].to_be_bytes());
    ctx.update(r.gid.ids[1].to_be_bytes());
    ctx.update([r.gid.op as u8]);
    ctx.update(r.rule_flag.to_be_bytes());

    ctx.update([
        r.action as u8,
        Direction::wire(r.direction),
        AddrFamily::wire(r.af),
        u8::from(r.quick),
        u8::from(r.ifnot),
        u8::from(r.match_tag_not),
        u8::from(r.natpass),
        r.keep_state,
        r.proto,
        r.icmp_type,
        r.icmp_code,
        r.flags,
        r.flagset,
        u8::from(r.allow_opts),
        r.rt as u8,
        r.tos,
    ]);
}

/// Digest a ruleset's queues, given in class order. The scrub queue
/// (the first) is not part of the digest.
pub fn ruleset_digest<'a>(
    queues: impl Iterator<Item = &'a ActiveQueue>,
) -> [u8; 16] {
    let mut ctx = Md5::new();
    for q in queues.skip(1) {
        for rule in &q.rules {
            hash_rule(&mut ctx, rule);
        }
    }
    ctx.finalize().into()
}
