// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Addresses, masks, and port operators as they appear in rules.

use super::AddrFamily;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// The kind of an [`AddrWrap`], with its wire value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrType {
    AddrMask = 0,
    NoRoute = 1,
    DynIfTl = 2,
    Table = 3,
}

/// An address specification: a literal address/mask, the addresses
/// of an interface, a named table, or the "no route" sentinel.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AddrWrap {
    AddrMask { addr: IpAddr, mask: IpAddr },
    NoRoute,
    DynIfTl { ifname: String, iflags: u8 },
    Table { name: String },
}

impl Default for AddrWrap {
    fn default() -> Self {
        Self::any()
    }
}

impl AddrWrap {
    /// Match any address of any family.
    pub fn any() -> Self {
        let zero = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self::AddrMask { addr: zero, mask: zero }
    }

    /// A literal network with the given prefix length.
    pub fn net(addr: IpAddr, prefix: u8) -> Self {
        Self::AddrMask { addr, mask: prefix_mask(&addr, prefix) }
    }

    pub fn addr_type(&self) -> AddrType {
        match self {
            Self::AddrMask { .. } => AddrType::AddrMask,
            Self::NoRoute => AddrType::NoRoute,
            Self::DynIfTl { .. } => AddrType::DynIfTl,
            Self::Table { .. } => AddrType::Table,
        }
    }

    /// The family implied by a literal address, if any.
    ///
    /// The all-zero "any" address is family-less.
    pub fn family(&self) -> Option<AddrFamily> {
        match self {
            Self::AddrMask { addr, mask } => {
                if addr.is_unspecified() && mask.is_unspecified() {
                    None
                } else {
                    Some(AddrFamily::of(addr))
                }
            }
            _ => None,
        }
    }
}

impl Display for AddrWrap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AddrMask { addr, mask } => {
                if addr.is_unspecified() && mask.is_unspecified() {
                    write!(f, "any")
                } else {
                    write!(f, "{addr}/{}", mask_prefix(mask))
                }
            }
            Self::NoRoute => write!(f, "no-route"),
            Self::DynIfTl { ifname, .. } => write!(f, "({ifname})"),
            Self::Table { name } => write!(f, "<{name}>"),
        }
    }
}

impl FromStr for AddrWrap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("any") {
            return Ok(Self::any());
        }

        if s.eq_ignore_ascii_case("no-route") {
            return Ok(Self::NoRoute);
        }

        if let Some(name) =
            s.strip_prefix('<').and_then(|r| r.strip_suffix('>'))
        {
            return Ok(Self::Table { name: name.to_string() });
        }

        if let Some(ifname) =
            s.strip_prefix('(').and_then(|r| r.strip_suffix(')'))
        {
            return Ok(Self::DynIfTl { ifname: ifname.to_string(), iflags: 0 });
        }

        let (ip_s, prefix_s) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr =
            ip_s.parse().map_err(|_| format!("invalid address: {s}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_s {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid prefix length: {s}"))?,
            None => max,
        };

        Ok(Self::net(addr, prefix))
    }
}

/// Build the mask for a prefix of the given length in the family of
/// `addr`.
pub fn prefix_mask(addr: &IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(_) => {
            let bits = match prefix {
                0 => 0,
                p => u32::MAX << (32 - u32::from(p.min(32))),
            };
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(_) => {
            let bits = match prefix {
                0 => 0,
                p => u128::MAX << (128 - u32::from(p.min(128))),
            };
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    }
}

/// The prefix length of a (contiguous) mask.
pub fn mask_prefix(mask: &IpAddr) -> u32 {
    match mask {
        IpAddr::V4(m) => u32::from(*m).leading_ones(),
        IpAddr::V6(m) => u128::from(*m).leading_ones(),
    }
}

/// The 16-byte in-kernel representation of an address: IPv4 occupies
/// the first four bytes and the remainder is zero.
pub fn addr_bytes(addr: &IpAddr) -> [u8; 16] {
    let mut out = [0u8; 16];
    match addr {
        IpAddr::V4(ip) => out[..4].copy_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.copy_from_slice(&ip.octets()),
    }
    out
}

/// Does `candidate` fall within `addr/mask`?
///
/// Addresses of differing families never match. The result is
/// inverted when `neg` is set.
pub fn addr_match(
    addr: &IpAddr,
    mask: &IpAddr,
    candidate: &IpAddr,
    neg: bool,
) -> bool {
    let hit = match (addr, mask, candidate) {
        (IpAddr::V4(a), IpAddr::V4(m), IpAddr::V4(c)) => {
            let m = u32::from(*m);
            u32::from(*a) & m == u32::from(*c) & m
        }
        (IpAddr::V6(a), IpAddr::V6(m), IpAddr::V6(c)) => {
            let m = u128::from(*m);
            u128::from(*a) & m == u128::from(*c) & m
        }
        _ => false,
    };

    hit != neg
}

/// A port comparison operator.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum PortOp {
    #[default]
    None = 0,
    /// Strictly between the two ports.
    InRange = 1,
    Eq = 2,
    Ne = 3,
    Lt = 4,
    Le = 5,
    Gt = 6,
    Ge = 7,
    /// Strictly outside the two ports.
    Except = 8,
    /// Between the two ports, inclusive.
    Range = 9,
}

impl PortOp {
    pub fn matches(self, a1: u16, a2: u16, p: u16) -> bool {
        match self {
            Self::None => true,
            Self::InRange => p > a1 && p < a2,
            Self::Except => p < a1 || p > a2,
            Self::Range => p >= a1 && p <= a2,
            Self::Eq => p == a1,
            Self::Ne => p != a1,
            Self::Lt => p < a1,
            Self::Le => p <= a1,
            Self::Gt => p > a1,
            Self::Ge => p >= a1,
        }
    }
}

/// Parse a port expression.
///
/// Accepted forms: `80`, `=80`, `!=80`, `<1024`, `<=1024`, `>1024`,
/// `>=1024`, `1000:2000` (inclusive), `1000><2000` (exclusive range)
/// and `1000<>2000` (outside range).
pub fn parse_port_spec(s: &str) -> Result<(PortOp, [u16; 2]), String> {
    let s = s.trim();
    let port = |p: &str| -> Result<u16, String> {
        p.trim().parse().map_err(|_| format!("invalid port: {p}"))
    };

    if let Some((a, b)) = s.split_once("><") {
        return Ok((PortOp::InRange, [port(a)?, port(b)?]));
    }

    if let Some((a, b)) = s.split_once("<>") {
        return Ok((PortOp::Except, [port(a)?, port(b)?]));
    }

    if let Some((a, b)) = s.split_once(':') {
        return Ok((PortOp::Range, [port(a)?, port(b)?]));
    }

    let unary = [
        ("!=", PortOp::Ne),
        ("<=", PortOp::Le),
        (">=", PortOp::Ge),
        ("<", PortOp::Lt),
        (">", PortOp::Gt),
        ("=", PortOp::Eq),
    ];

    for (prefix, op) in unary {
        if let Some(rest) = s.strip_prefix(prefix) {
            return Ok((op, [port(rest)?, 0]));
        }
    }

    Ok((PortOp::Eq, [port(s)?, 0]))
}

/// One side (source or destination) of a rule's match criteria.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct RuleAddr {
    pub addr: AddrWrap,
    pub port: [u16; 2],
    pub neg: bool,
    pub port_op: PortOp,
}

impl Display for RuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.neg {
            write!(f, "! ")?;
        }
        write!(f, "{}", self.addr)?;
        let [a1, a2] = self.port;
        match self.port_op {
            PortOp::None => Ok(()),
            PortOp::Eq => write!(f, " port {a1}"),
            PortOp::Ne => write!(f, " port != {a1}"),
            PortOp::Lt => write!(f, " port < {a1}"),
            PortOp::Le => write!(f, " port <= {a1}"),
            PortOp::Gt => write!(f, " port > {a1}"),
            PortOp::Ge => write!(f, " port >= {a1}"),
            PortOp::InRange => write!(f, " port {a1} >< {a2}"),
            PortOp::Except => write!(f, " port {a1} <> {a2}"),
            PortOp::Range => write!(f, " port {a1}:{a2}"),
        }
    }
}

/// An address/mask with negation, used by kill and clear filters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchNet {
    pub addr: IpAddr,
    pub mask: IpAddr,
    pub neg: bool,
}

impl MatchNet {
    pub fn matches(&self, candidate: &IpAddr) -> bool {
        addr_match(&self.addr, &self.mask, candidate, self.neg)
    }
}

impl FromStr for MatchNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (neg, rest) = match s.trim().strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        match rest.parse::<AddrWrap>()? {
            AddrWrap::AddrMask { addr, mask } => Ok(Self { addr, mask, neg }),
            _ => Err(format!("expected address/prefix: {s}")),
        }
    }
}
