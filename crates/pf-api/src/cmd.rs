// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::API_VERSION;
use super::AddrFamily;
use core::fmt::Debug;
use libc::c_int;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(C)]
pub enum PfCmd {
    Start = 1,          // enable the filter
    Stop = 2,           // disable the filter
    BeginRules = 10,    // open a rule transaction
    AddRule = 11,       // stage a rule
    GetRules = 12,      // count active rules
    GetRule = 13,       // fetch one active rule
    ChangeRule = 14,    // modify an active queue in place
    CommitRules = 15,   // publish staged rules
    RollbackRules = 16, // discard staged rules
    ClearRuleCtrs = 17, // zero rule counters
    BeginAddrs = 20,    // open the pool staging buffer
    AddAddr = 21,       // stage a pool address
    GetAddrs = 22,      // count a rule's pool
    GetAddr = 23,       // fetch one pool address
    ChangeAddr = 24,    // modify a rule's pool in place
    AddState = 30,      // import one state
    AddStates = 31,     // import a batch of states
    GetState = 32,      // export one state
    GetStates = 33,     // export all states
    ClearStates = 34,   // remove states by interface
    KillStates = 35,    // remove states by filter
    NatLook = 36,       // reverse a translation
    GetSrcNodes = 40,   // dump source nodes
    ClearSrcNodes = 41, // remove all source nodes
    KillSrcNodes = 42,  // remove source nodes by filter
    BeginAltqs = 50,    // open an ALTQ transaction
    AddAltq = 51,       // stage a queue
    GetAltqs = 52,      // count active queues
    GetAltq = 53,       // fetch one active queue
    ChangeAltq = 54,    // unsupported
    CommitAltqs = 55,   // publish staged queues
    RollbackAltqs = 56, // discard staged queues
    StartAltq = 57,     // enable queueing
    StopAltq = 58,      // disable queueing
    XBegin = 60,        // open a grouped transaction
    XRollback = 61,     // discard a grouped transaction
    XCommit = 62,       // publish a grouped transaction
    GetRulesets = 70,   // count child anchors
    GetRuleset = 71,    // name one child anchor
    GetStatus = 80,     // dump status
    ClearStatus = 81,   // zero status counters
    SetStatusIf = 82,   // set the status interface
    GetTimeout = 83,    // read a timeout
    SetTimeout = 84,    // write a timeout
    GetLimit = 85,      // read a limit
    SetLimit = 86,      // write a limit
    SetDebug = 87,      // set the debug level
    SetHostId = 88,     // set the host id
}

impl TryFrom<c_int> for PfCmd {
    type Error = ();

    fn try_from(num: c_int) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            10 => Ok(Self::BeginRules),
            11 => Ok(Self::AddRule),
            12 => Ok(Self::GetRules),
            13 => Ok(Self::GetRule),
            14 => Ok(Self::ChangeRule),
            15 => Ok(Self::CommitRules),
            16 => Ok(Self::RollbackRules),
            17 => Ok(Self::ClearRuleCtrs),
            20 => Ok(Self::BeginAddrs),
            21 => Ok(Self::AddAddr),
            22 => Ok(Self::GetAddrs),
            23 => Ok(Self::GetAddr),
            24 => Ok(Self::ChangeAddr),
            30 => Ok(Self::AddState),
            31 => Ok(Self::AddStates),
            32 => Ok(Self::GetState),
            33 => Ok(Self::GetStates),
            34 => Ok(Self::ClearStates),
            35 => Ok(Self::KillStates),
            36 => Ok(Self::NatLook),
            40 => Ok(Self::GetSrcNodes),
            41 => Ok(Self::ClearSrcNodes),
            42 => Ok(Self::KillSrcNodes),
            50 => Ok(Self::BeginAltqs),
            51 => Ok(Self::AddAltq),
            52 => Ok(Self::GetAltqs),
            53 => Ok(Self::GetAltq),
            54 => Ok(Self::ChangeAltq),
            55 => Ok(Self::CommitAltqs),
            56 => Ok(Self::RollbackAltqs),
            57 => Ok(Self::StartAltq),
            58 => Ok(Self::StopAltq),
            60 => Ok(Self::XBegin),
            61 => Ok(Self::XRollback),
            62 => Ok(Self::XCommit),
            70 => Ok(Self::GetRulesets),
            71 => Ok(Self::GetRuleset),
            80 => Ok(Self::GetStatus),
            81 => Ok(Self::ClearStatus),
            82 => Ok(Self::SetStatusIf),
            83 => Ok(Self::GetTimeout),
            84 => Ok(Self::SetTimeout),
            85 => Ok(Self::GetLimit),
            86 => Ok(Self::SetLimit),
            87 => Ok(Self::SetDebug),
            88 => Ok(Self::SetHostId),
            _ => Err(()),
        }
    }
}

impl PfCmd {
    /// May this command run when the system securelevel is raised
    /// above 1?
    pub fn allowed_at_securelevel(self) -> bool {
        matches!(
            self,
            Self::GetRules
                | Self::GetRule
                | Self::GetAddrs
                | Self::GetAddr
                | Self::GetState
                | Self::GetStates
                | Self::SetStatusIf
                | Self::GetStatus
                | Self::ClearStatus
                | Self::NatLook
                | Self::SetDebug
                | Self::GetTimeout
                | Self::ClearRuleCtrs
                | Self::GetLimit
                | Self::GetAltqs
                | Self::GetAltq
                | Self::GetRulesets
                | Self::GetRuleset
                | Self::GetSrcNodes
                | Self::ClearSrcNodes
        )
    }

    /// May this command run on a handle opened without write access?
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::GetRules
                | Self::GetRule
                | Self::GetAddrs
                | Self::GetAddr
                | Self::GetState
                | Self::GetStates
                | Self::GetStatus
                | Self::GetTimeout
                | Self::GetLimit
                | Self::GetAltqs
                | Self::GetAltq
                | Self::GetRulesets
                | Self::GetRuleset
                | Self::NatLook
                | Self::GetSrcNodes
        )
    }
}

/// The credentials a command runs with: the system securelevel and
/// whether the control handle was opened for writing.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Access {
    pub securelevel: i32,
    pub writable: bool,
}

impl Access {
    pub const ADMIN: Self = Self { securelevel: 0, writable: true };
    pub const READ_ONLY: Self = Self { securelevel: 0, writable: false };
}

/// Indicates that a command response has been written to
/// `resp_bytes`.
pub const PF_CMD_RESP_COPY_OUT: u64 = 0x1;

/// The argument passed when sending a [`PfCmd`].
///
/// The command's request and response bodies are serialized with
/// postcard into `req_bytes`/`resp_bytes`. When the command fails and
/// [`PF_CMD_RESP_COPY_OUT`] is set, `resp_bytes` holds a serialized
/// [`PfError`] instead.
#[derive(Debug)]
pub struct PfCmdIoctl {
    pub api_version: u64,
    pub cmd: PfCmd,
    pub flags: u64,
    pub req_bytes: Vec<u8>,
    pub resp_bytes: Vec<u8>,
}

impl PfCmdIoctl {
    pub fn new(cmd: PfCmd, req_bytes: Vec<u8>) -> Self {
        Self {
            api_version: API_VERSION,
            cmd,
            flags: 0,
            req_bytes,
            resp_bytes: Vec::new(),
        }
    }

    pub fn cmd_err_resp(&self) -> Option<PfError> {
        if self.has_cmd_resp() {
            match postcard::from_bytes(&self.resp_bytes) {
                Ok(cmd_err) => Some(cmd_err),
                Err(deser_err) => {
                    Some(PfError::DeserCmdErr(deser_err.to_string()))
                }
            }
        } else {
            None
        }
    }

    pub fn has_cmd_resp(&self) -> bool {
        (self.flags & PF_CMD_RESP_COPY_OUT) != 0
    }

    /// Is this the expected API version?
    pub fn check_version(&self) -> bool {
        self.api_version == API_VERSION
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PfError {
    /// A NAT lookup matched more than one state.
    Ambiguous(u32),
    BadApiVersion {
        user: u64,
        kernel: u64,
    },
    /// Ticket mismatch or transaction not open. Restart the
    /// transaction and retry.
    Busy(String),
    /// The second phase of a grouped commit failed. Some of the
    /// entries may already have been applied.
    CommitFailed(String),
    DeserCmdErr(String),
    DeserCmdReq(String),
    Exists(String),
    InvalidArgument(String),
    NoDevice(String),

    /// The command expects a request body but `req_bytes` is empty.
    NoRequestBody,

    NotFound(String),
    PermissionDenied(String),
    ResourceExhausted(String),
    SerCmdErr(String),
    SerCmdResp(String),
    /// The address family is not supported by this engine.
    Unsupported(AddrFamily),
}

impl PfError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> c_int {
        use libc::*;

        match self {
            Self::Ambiguous(_) => E2BIG,
            Self::BadApiVersion { .. } => EPROTO,
            Self::Busy(_) => EBUSY,
            Self::CommitFailed(_) => EIO,
            Self::DeserCmdErr(_) => ENOMSG,
            Self::DeserCmdReq(_) => ENOMSG,
            Self::Exists(_) => EEXIST,
            Self::InvalidArgument(_) => EINVAL,
            Self::NoDevice(_) => ENODEV,
            Self::NoRequestBody => EINVAL,
            Self::NotFound(_) => ENOENT,
            Self::PermissionDenied(_) => EPERM,
            Self::ResourceExhausted(_) => ENOMEM,
            Self::SerCmdErr(_) => ENOMSG,
            Self::SerCmdResp(_) => ENOMSG,
            Self::Unsupported(_) => EAFNOSUPPORT,
        }
    }
}

/// A marker trait indicating a success response type that is returned
/// from a command and may be passed across the command boundary.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// Indicates no meaningful response value on success.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NoResp {
    pub unused: u64,
}

impl CmdOk for NoResp {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cmd_numbers_round_trip() {
        for n in 0..100 {
            if let Ok(cmd) = PfCmd::try_from(n) {
                assert_eq!(cmd as c_int, n);
            }
        }
    }

    #[test]
    fn read_only_cmds_allowed_at_securelevel() {
        for n in 0..100 {
            if let Ok(cmd) = PfCmd::try_from(n) {
                if cmd.is_read_only() {
                    assert!(cmd.allowed_at_securelevel(), "{cmd:?}");
                }
            }
        }
        assert!(!PfCmd::AddRule.allowed_at_securelevel());
        assert!(!PfCmd::ClearStatus.is_read_only());
    }
}
