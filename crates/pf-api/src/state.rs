// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! State and source-node records.

use super::AddrFamily;
use super::CmdOk;
use super::Direction;
use super::MatchNet;
use super::PortOp;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;

/// The timeout classes.
///
/// The discriminant is the index into the engine's timeout table.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum Timeout {
    TcpFirstPacket = 0,
    TcpOpening = 1,
    TcpEstablished = 2,
    TcpClosing = 3,
    TcpFinWait = 4,
    TcpClosed = 5,
    UdpFirstPacket = 6,
    UdpSingle = 7,
    UdpMultiple = 8,
    IcmpFirstPacket = 9,
    IcmpErrorReply = 10,
    OtherFirstPacket = 11,
    OtherSingle = 12,
    OtherMultiple = 13,
    Frag = 14,
    Interval = 15,
    AdaptiveStart = 16,
    AdaptiveEnd = 17,
    SrcNode = 18,
    TsDiff = 19,
}

/// The number of real timeout classes.
pub const TIMEOUT_COUNT: usize = 20;

/// Wire value marking a state for removal at the next purge.
pub const TIMEOUT_PURGE: u8 = 21;

/// Wire value for a state that never expires by time.
pub const TIMEOUT_UNTIL_PACKET: u8 = 22;

impl Timeout {
    pub const ALL: [Self; TIMEOUT_COUNT] = [
        Self::TcpFirstPacket,
        Self::TcpOpening,
        Self::TcpEstablished,
        Self::TcpClosing,
        Self::TcpFinWait,
        Self::TcpClosed,
        Self::UdpFirstPacket,
        Self::UdpSingle,
        Self::UdpMultiple,
        Self::IcmpFirstPacket,
        Self::IcmpErrorReply,
        Self::OtherFirstPacket,
        Self::OtherSingle,
        Self::OtherMultiple,
        Self::Frag,
        Self::Interval,
        Self::AdaptiveStart,
        Self::AdaptiveEnd,
        Self::SrcNode,
        Self::TsDiff,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TcpFirstPacket => "tcp.first",
            Self::TcpOpening => "tcp.opening",
            Self::TcpEstablished => "tcp.established",
            Self::TcpClosing => "tcp.closing",
            Self::TcpFinWait => "tcp.finwait",
            Self::TcpClosed => "tcp.closed",
            Self::UdpFirstPacket => "udp.first",
            Self::UdpSingle => "udp.single",
            Self::UdpMultiple => "udp.multiple",
            Self::IcmpFirstPacket => "icmp.first",
            Self::IcmpErrorReply => "icmp.error",
            Self::OtherFirstPacket => "other.first",
            Self::OtherSingle => "other.single",
            Self::OtherMultiple => "other.multiple",
            Self::Frag => "frag",
            Self::Interval => "interval",
            Self::AdaptiveStart => "adaptive.start",
            Self::AdaptiveEnd => "adaptive.end",
            Self::SrcNode => "src.track",
            Self::TsDiff => "ts.diff",
        }
    }

    /// The default value in seconds.
    pub fn default_secs(self) -> u32 {
        match self {
            Self::TcpFirstPacket => 120,
            Self::TcpOpening => 30,
            Self::TcpEstablished => 24 * 60 * 60,
            Self::TcpClosing => 15 * 60,
            Self::TcpFinWait => 45,
            Self::TcpClosed => 90,
            Self::UdpFirstPacket => 60,
            Self::UdpSingle => 30,
            Self::UdpMultiple => 60,
            Self::IcmpFirstPacket => 20,
            Self::IcmpErrorReply => 10,
            Self::OtherFirstPacket => 60,
            Self::OtherSingle => 30,
            Self::OtherMultiple => 60,
            Self::Frag => 30,
            Self::Interval => 10,
            Self::AdaptiveStart => 0,
            Self::AdaptiveEnd => 0,
            Self::SrcNode => 0,
            Self::TsDiff => 30,
        }
    }
}

impl FromStr for Timeout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.name() == s)
            .copied()
            .ok_or_else(|| format!("invalid timeout: {s}"))
    }
}

impl Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An address/port pair as observed on one side of a state.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct StateHost {
    pub addr: IpAddr,
    pub port: u16,
}

impl StateHost {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl Display for StateHost {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

/// Sequence tracking for one endpoint of a state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatePeerRecord {
    pub seqlo: u32,
    pub seqhi: u32,
    pub seqdiff: u32,
    pub max_win: u16,
    pub mss: u16,
    pub state: u8,
    pub wscale: u8,
}

bitflags! {
    /// Which source-tracking links a state had when exported.
    #[derive(
        Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
    )]
    pub struct SyncFlags: u8 {
        const SRCNODE = 0x04;
        const NATSRCNODE = 0x08;
    }
}

/// The flat synchronization form of a state.
///
/// Rule references are carried as rule numbers only; times are
/// relative to the moment of export.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateRecord {
    pub id: u64,
    pub creatorid: u32,
    pub ifname: String,
    pub lan: StateHost,
    pub gwy: StateHost,
    pub ext: StateHost,
    pub src: StatePeerRecord,
    pub dst: StatePeerRecord,
    pub rule: Option<u32>,
    pub nat_rule: Option<u32>,
    pub anchor: Option<u32>,
    pub af: AddrFamily,
    pub proto: u8,
    pub direction: Direction,
    /// Seconds since the state was created.
    pub creation: u32,
    /// Seconds until the state expires; zero for never or already.
    pub expire: u32,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub log: u8,
    pub allow_opts: bool,
    /// A timeout class index, [`TIMEOUT_PURGE`] or
    /// [`TIMEOUT_UNTIL_PACKET`].
    pub timeout: u8,
    pub sync_flags: SyncFlags,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddStateReq {
    pub state: StateRecord,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddStatesReq {
    pub states: Vec<StateRecord>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddStatesResp {
    pub added: u32,
}

impl CmdOk for AddStatesResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetStateReq {
    pub nr: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetStateResp {
    pub state: StateRecord,
}

impl CmdOk for GetStateResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetStatesReq {
    /// Return at most this many records.
    pub max: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetStatesResp {
    /// The number of states in the table.
    pub total: u32,
    pub states: Vec<StateRecord>,
}

impl CmdOk for GetStatesResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClearStatesReq {
    /// Only clear states on this interface; empty for all.
    pub ifname: String,
}

/// The number of entries removed by a clear or kill.
#[derive(Debug, Deserialize, Serialize)]
pub struct KilledResp {
    pub killed: u32,
}

impl CmdOk for KilledResp {}

/// One side of a state kill filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KillSide {
    /// `None` matches any address.
    pub net: Option<MatchNet>,
    pub port_op: PortOp,
    pub port: [u16; 2],
}

impl KillSide {
    pub fn matches(&self, host: &StateHost) -> bool {
        let addr_ok = self.net.as_ref().is_none_or(|n| n.matches(&host.addr));
        addr_ok && self.port_op.matches(self.port[0], self.port[1], host.port)
    }
}

/// Kill states matching every given criterion. The source side is
/// compared with the state's lan host and the destination side with
/// its ext host.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KillStatesReq {
    pub af: Option<AddrFamily>,
    /// Zero matches any protocol.
    pub proto: u8,
    pub src: KillSide,
    pub dst: KillSide,
    /// Empty matches any interface.
    pub ifname: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NatLookReq {
    pub direction: Direction,
    pub af: AddrFamily,
    pub proto: u8,
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NatLookResp {
    pub rsaddr: IpAddr,
    pub rsport: u16,
    pub rdaddr: IpAddr,
    pub rdport: u16,
}

impl CmdOk for NatLookResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SrcNodeDump {
    pub addr: IpAddr,
    pub raddr: Option<IpAddr>,
    pub af: AddrFamily,
    pub rule: Option<u32>,
    pub states: u32,
    pub conn: u32,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    /// Seconds since creation.
    pub creation: u32,
    /// Seconds until expiry; zero when not expiring.
    pub expire: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetSrcNodesResp {
    pub nodes: Vec<SrcNodeDump>,
}

impl CmdOk for GetSrcNodesResp {}

/// Kill source nodes whose address matches `src` and whose route
/// address matches `dst`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KillSrcNodesReq {
    pub src: Option<MatchNet>,
    pub dst: Option<MatchNet>,
}
