// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod addr;
pub mod altq;
pub mod cmd;
pub mod pool;
pub mod rule;
pub mod state;
pub mod status;
pub mod xact;

pub use addr::*;
pub use altq::*;
pub use cmd::*;
pub use pool::*;
pub use rule::*;
pub use state::*;
pub use status::*;
pub use xact::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment. We attach no semantic
/// meaning to the number other than as a means to verify that the
/// client and engine are compiled for the same API.
pub const API_VERSION: u64 = 1;

/// The largest tag (or queue) id that may be handed out.
pub const TAGID_MAX: u16 = 50000;

/// Maximum length of a tag name, including the terminating NUL of the
/// fixed-size kernel buffer.
pub const TAG_NAME_SIZE: usize = 64;

/// Maximum length of an ALTQ queue name.
pub const QNAME_SIZE: usize = 64;

/// Size of the fixed interface-name buffer.
pub const IFNAMSIZ: usize = 16;

/// Size of the fixed table-name buffer.
pub const TABLE_NAME_SIZE: usize = 32;

/// Maximum length of a single anchor name component.
pub const ANCHOR_NAME_SIZE: usize = 64;

/// Maximum length of a full anchor path.
pub const MAXPATHLEN: usize = 1024;

/// Maximum length of a rule label.
pub const RULE_LABEL_SIZE: usize = 64;

/// The highest ICMP type a `return-icmp` rule may reference.
pub const ICMP_MAXTYPE: u16 = 18;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum Direction {
    In = 1,
    Out = 2,
}

impl Direction {
    /// The on-the-wire value, where `0` means "both directions".
    pub fn wire(dir: Option<Self>) -> u8 {
        dir.map(|d| d as u8).unwrap_or(0)
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {s}")),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "in",
            Direction::Out => "out",
        };

        write!(f, "{dirstr}")
    }
}

/// An address family.
///
/// The numeric values are the BSD `AF_INET`/`AF_INET6` constants, as
/// they appear in synchronization records and in the sync digest.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum AddrFamily {
    Inet = 2,
    Inet6 = 24,
}

impl AddrFamily {
    pub fn wire(af: Option<Self>) -> u8 {
        af.map(|af| af as u8).unwrap_or(0)
    }

    pub fn of(ip: &std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(_) => Self::Inet,
            std::net::IpAddr::V6(_) => Self::Inet6,
        }
    }
}

impl core::str::FromStr for AddrFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inet" | "ipv4" => Ok(Self::Inet),
            "inet6" | "ipv6" => Ok(Self::Inet6),
            _ => Err(format!("invalid address family: {s}")),
        }
    }
}

impl Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
        }
    }
}

/// Protocol number helpers used by the CLI and printers.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMP6: u8 = 58;

    pub fn name(proto: u8) -> Option<&'static str> {
        match proto {
            ICMP => Some("icmp"),
            TCP => Some("tcp"),
            UDP => Some("udp"),
            ICMP6 => Some("icmp6"),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<u8, String> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(ICMP),
            "tcp" => Ok(TCP),
            "udp" => Ok(UDP),
            "icmp6" | "ipv6-icmp" => Ok(ICMP6),
            other => {
                other.parse().map_err(|_| format!("invalid protocol: {s}"))
            }
        }
    }
}
