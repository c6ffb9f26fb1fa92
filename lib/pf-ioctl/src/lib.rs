// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A typed client for the packet-filter command interface.
//!
//! Every method encodes its request, runs it through
//! [`pf::engine::ioctl::pf_ioctl`] with the handle's access, and
//! decodes the response or the error the engine wrote back.

use pf::api::AddAddrReq;
use pf::api::AddAltqReq;
use pf::api::AddRuleReq;
use pf::api::AddStateReq;
use pf::api::AddStatesReq;
use pf::api::AddStatesResp;
use pf::api::AddrFamily;
use pf::api::AltqSpec;
use pf::api::AltqXactReq;
use pf::api::BeginRulesReq;
use pf::api::ChangeAddrReq;
use pf::api::ChangeRuleReq;
use pf::api::ChangeRuleResp;
use pf::api::ClearStatesReq;
use pf::api::CmdOk;
use pf::api::DebugLevel;
use pf::api::GetAddrReq;
use pf::api::GetAddrResp;
use pf::api::GetAddrsReq;
use pf::api::GetAddrsResp;
use pf::api::GetAltqReq;
use pf::api::GetAltqResp;
use pf::api::GetAltqsResp;
use pf::api::GetLimitReq;
use pf::api::GetRuleReq;
use pf::api::GetRuleResp;
use pf::api::GetRulesReq;
use pf::api::GetRulesResp;
use pf::api::GetRulesetReq;
use pf::api::GetRulesetResp;
use pf::api::GetRulesetsReq;
use pf::api::GetRulesetsResp;
use pf::api::GetSrcNodesResp;
use pf::api::GetStateReq;
use pf::api::GetStateResp;
use pf::api::GetStatesReq;
use pf::api::GetStatesResp;
use pf::api::GetTimeoutReq;
use pf::api::KillSrcNodesReq;
use pf::api::KillStatesReq;
use pf::api::KilledResp;
use pf::api::Limit;
use pf::api::LimitResp;
use pf::api::NatLookReq;
use pf::api::NatLookResp;
use pf::api::NoResp;
use pf::api::PfCmd;
use pf::api::PfCmdIoctl;
pub use pf::api::PfError;
use pf::api::PfStatus;
use pf::api::PoolAddrSpec;
use pf::api::PoolSelector;
use pf::api::RuleDump;
use pf::api::RuleSpec;
use pf::api::RulesXactReq;
use pf::api::RulesetClass;
use pf::api::SetDebugReq;
use pf::api::SetHostIdReq;
use pf::api::SetLimitReq;
use pf::api::SetStatusIfReq;
use pf::api::SetTimeoutReq;
use pf::api::StateRecord;
use pf::api::TicketResp;
use pf::api::Timeout;
use pf::api::TimeoutResp;
use pf::api::XactEntry;
use pf::api::XactReq;
use pf::api::XactResp;
use pf::engine::Pf;
use pf::engine::ioctl::pf_ioctl;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

/// Errors related to administering the packet filter.
#[derive(Debug, Error)]
pub enum Error {
    /// The command failed without saying why.
    #[error("ioctl {0:?} failed: {1}")]
    IoctlFailed(PfCmd, String),

    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("request serialization failed for command {0:?}: {1}")]
    ReqSer(PfCmd, postcard::Error),

    #[error("response deserialization failed for command {0:?}: {1}")]
    RespDeser(PfCmd, postcard::Error),

    #[error("command {0:?} failed: {1:?}")]
    CommandError(PfCmd, PfError),
}

impl Error {
    /// The engine's error, when the command got far enough to return
    /// one.
    pub fn cmd_err(&self) -> Option<&PfError> {
        match self {
            Self::CommandError(_, e) => Some(e),
            _ => None,
        }
    }

    /// Did the command fail because its ticket went stale?
    pub fn is_busy(&self) -> bool {
        matches!(self.cmd_err(), Some(PfError::Busy(_)))
    }
}

/// The handle used to send administration commands to the engine.
pub struct PfHdl {
    pf: Arc<Pf>,
    access: pf::api::Access,
}

impl PfHdl {
    /// Open a handle with write access.
    pub fn open(pf: Arc<Pf>) -> Self {
        let access = pf.access(true);
        Self { pf, access }
    }

    /// Open a handle that may only run read-only commands.
    pub fn open_read_only(pf: Arc<Pf>) -> Self {
        let access = pf.access(false);
        Self { pf, access }
    }

    pub fn engine(&self) -> &Arc<Pf> {
        &self.pf
    }

    fn run<T, R>(&self, cmd: PfCmd, req: Option<&R>) -> Result<T, Error>
    where
        T: CmdOk + DeserializeOwned,
        R: Serialize,
    {
        run_cmd_ioctl(&self.pf, self.access, cmd, req)
    }

    pub fn start(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::Start, None::<&()>)
    }

    pub fn stop(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::Stop, None::<&()>)
    }

    // ================================================================
    // Rules
    // ================================================================

    /// Open a rule transaction, returning its ticket.
    pub fn begin_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<u64, Error> {
        let req = BeginRulesReq { anchor: anchor.to_string(), class };
        let resp: TicketResp = self.run(PfCmd::BeginRules, Some(&req))?;
        Ok(resp.ticket)
    }

    pub fn add_rule(
        &self,
        anchor: &str,
        ticket: u64,
        pool_ticket: Option<u64>,
        rule: RuleSpec,
    ) -> Result<NoResp, Error> {
        let req = AddRuleReq {
            anchor: anchor.to_string(),
            ticket,
            pool_ticket,
            rule,
        };
        self.run(PfCmd::AddRule, Some(&req))
    }

    pub fn commit_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) -> Result<NoResp, Error> {
        let req = RulesXactReq { anchor: anchor.to_string(), class, ticket };
        self.run(PfCmd::CommitRules, Some(&req))
    }

    pub fn rollback_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
    ) -> Result<NoResp, Error> {
        let req = RulesXactReq { anchor: anchor.to_string(), class, ticket };
        self.run(PfCmd::RollbackRules, Some(&req))
    }

    /// The number of active rules and the ticket needed to read them.
    pub fn get_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<GetRulesResp, Error> {
        let req = GetRulesReq { anchor: anchor.to_string(), class };
        self.run(PfCmd::GetRules, Some(&req))
    }

    pub fn get_rule(
        &self,
        anchor: &str,
        class: RulesetClass,
        ticket: u64,
        nr: u32,
    ) -> Result<RuleDump, Error> {
        let req = GetRuleReq { anchor: anchor.to_string(), class, ticket, nr };
        let resp: GetRuleResp = self.run(PfCmd::GetRule, Some(&req))?;
        Ok(resp.rule)
    }

    /// Read a whole active queue. The read is retried if the queue
    /// changes underneath it.
    pub fn dump_rules(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Result<Vec<RuleDump>, Error> {
        const MAX_ATTEMPTS: u8 = 3;
        let mut last = None;

        for _ in 0..MAX_ATTEMPTS {
            let GetRulesResp { nr, ticket } = self.get_rules(anchor, class)?;
            let res: Result<Vec<_>, _> = (0..nr)
                .map(|i| self.get_rule(anchor, class, ticket, i))
                .collect();
            match res {
                Err(e) if e.is_busy() => last = Some(e),
                res => return res,
            }
        }

        Err(last.unwrap_or_else(|| {
            Error::IoctlFailed(PfCmd::GetRule, "queue kept changing".into())
        }))
    }

    pub fn change_rule(&self, req: &ChangeRuleReq) -> Result<u64, Error> {
        let resp: ChangeRuleResp = self.run(PfCmd::ChangeRule, Some(req))?;
        Ok(resp.ticket)
    }

    pub fn clear_rule_counters(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::ClearRuleCtrs, None::<&()>)
    }

    /// The names of the anchors directly beneath `path`.
    pub fn list_rulesets(&self, path: &str) -> Result<Vec<String>, Error> {
        let req = GetRulesetsReq { path: path.to_string() };
        let resp: GetRulesetsResp = self.run(PfCmd::GetRulesets, Some(&req))?;
        (0..resp.nr)
            .map(|nr| {
                let req = GetRulesetReq { path: path.to_string(), nr };
                let resp: GetRulesetResp =
                    self.run(PfCmd::GetRuleset, Some(&req))?;
                Ok(resp.name)
            })
            .collect()
    }

    // ================================================================
    // Pool addresses
    // ================================================================

    pub fn begin_addrs(&self) -> Result<u64, Error> {
        let resp: TicketResp = self.run(PfCmd::BeginAddrs, None::<&()>)?;
        Ok(resp.ticket)
    }

    pub fn add_addr(
        &self,
        ticket: u64,
        af: AddrFamily,
        addr: PoolAddrSpec,
    ) -> Result<NoResp, Error> {
        let req = AddAddrReq { ticket, af, addr };
        self.run(PfCmd::AddAddr, Some(&req))
    }

    pub fn get_addrs(
        &self,
        sel: &PoolSelector,
    ) -> Result<GetAddrsResp, Error> {
        let req = GetAddrsReq { sel: sel.clone() };
        self.run(PfCmd::GetAddrs, Some(&req))
    }

    pub fn get_addr(
        &self,
        sel: &PoolSelector,
        ticket: u64,
        nr: u32,
    ) -> Result<GetAddrResp, Error> {
        let req = GetAddrReq { sel: sel.clone(), ticket, nr };
        self.run(PfCmd::GetAddr, Some(&req))
    }

    pub fn change_addr(&self, req: &ChangeAddrReq) -> Result<NoResp, Error> {
        self.run(PfCmd::ChangeAddr, Some(req))
    }

    // ================================================================
    // States and source nodes
    // ================================================================

    pub fn add_state(&self, state: StateRecord) -> Result<NoResp, Error> {
        self.run(PfCmd::AddState, Some(&AddStateReq { state }))
    }

    /// Import a batch of states, returning how many were added.
    pub fn add_states(&self, states: Vec<StateRecord>) -> Result<u32, Error> {
        let req = AddStatesReq { states };
        let resp: AddStatesResp = self.run(PfCmd::AddStates, Some(&req))?;
        Ok(resp.added)
    }

    pub fn get_state(&self, nr: u32) -> Result<StateRecord, Error> {
        let req = GetStateReq { nr };
        let resp: GetStateResp = self.run(PfCmd::GetState, Some(&req))?;
        Ok(resp.state)
    }

    pub fn get_states(&self, max: Option<u32>) -> Result<GetStatesResp, Error> {
        self.run(PfCmd::GetStates, Some(&GetStatesReq { max }))
    }

    /// Remove every state on `ifname`, or every state when empty.
    pub fn clear_states(&self, ifname: &str) -> Result<u32, Error> {
        let req = ClearStatesReq { ifname: ifname.to_string() };
        let resp: KilledResp = self.run(PfCmd::ClearStates, Some(&req))?;
        Ok(resp.killed)
    }

    pub fn kill_states(&self, req: &KillStatesReq) -> Result<u32, Error> {
        let resp: KilledResp = self.run(PfCmd::KillStates, Some(req))?;
        Ok(resp.killed)
    }

    pub fn natlook(&self, req: &NatLookReq) -> Result<NatLookResp, Error> {
        self.run(PfCmd::NatLook, Some(req))
    }

    pub fn get_src_nodes(&self) -> Result<GetSrcNodesResp, Error> {
        self.run(PfCmd::GetSrcNodes, None::<&()>)
    }

    pub fn clear_src_nodes(&self) -> Result<u32, Error> {
        let resp: KilledResp = self.run(PfCmd::ClearSrcNodes, None::<&()>)?;
        Ok(resp.killed)
    }

    pub fn kill_src_nodes(&self, req: &KillSrcNodesReq) -> Result<u32, Error> {
        let resp: KilledResp = self.run(PfCmd::KillSrcNodes, Some(req))?;
        Ok(resp.killed)
    }

    // ================================================================
    // Queues
    // ================================================================

    pub fn begin_altqs(&self) -> Result<u64, Error> {
        let resp: TicketResp = self.run(PfCmd::BeginAltqs, None::<&()>)?;
        Ok(resp.ticket)
    }

    pub fn add_altq(
        &self,
        ticket: u64,
        altq: AltqSpec,
    ) -> Result<NoResp, Error> {
        self.run(PfCmd::AddAltq, Some(&AddAltqReq { ticket, altq }))
    }

    pub fn commit_altqs(&self, ticket: u64) -> Result<NoResp, Error> {
        self.run(PfCmd::CommitAltqs, Some(&AltqXactReq { ticket }))
    }

    pub fn rollback_altqs(&self, ticket: u64) -> Result<NoResp, Error> {
        self.run(PfCmd::RollbackAltqs, Some(&AltqXactReq { ticket }))
    }

    pub fn get_altqs(&self) -> Result<GetAltqsResp, Error> {
        self.run(PfCmd::GetAltqs, None::<&()>)
    }

    pub fn get_altq(&self, ticket: u64, nr: u32) -> Result<AltqSpec, Error> {
        let req = GetAltqReq { ticket, nr };
        let resp: GetAltqResp = self.run(PfCmd::GetAltq, Some(&req))?;
        Ok(resp.altq)
    }

    /// Read every active queue definition.
    pub fn dump_altqs(&self) -> Result<Vec<AltqSpec>, Error> {
        let GetAltqsResp { nr, ticket } = self.get_altqs()?;
        (0..nr).map(|i| self.get_altq(ticket, i)).collect()
    }

    pub fn change_altq(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::ChangeAltq, None::<&()>)
    }

    pub fn start_altq(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::StartAltq, None::<&()>)
    }

    pub fn stop_altq(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::StopAltq, None::<&()>)
    }

    // ================================================================
    // Grouped transactions
    // ================================================================

    /// Begin every entry, returning them with their tickets filled in.
    pub fn xbegin(
        &self,
        entries: Vec<XactEntry>,
    ) -> Result<Vec<XactEntry>, Error> {
        let req = XactReq { entries };
        let resp: XactResp = self.run(PfCmd::XBegin, Some(&req))?;
        Ok(resp.entries)
    }

    pub fn xcommit(&self, entries: &[XactEntry]) -> Result<NoResp, Error> {
        let req = XactReq { entries: entries.to_vec() };
        self.run(PfCmd::XCommit, Some(&req))
    }

    pub fn xrollback(&self, entries: &[XactEntry]) -> Result<NoResp, Error> {
        let req = XactReq { entries: entries.to_vec() };
        self.run(PfCmd::XRollback, Some(&req))
    }

    // ================================================================
    // Status and tunables
    // ================================================================

    pub fn status(&self) -> Result<PfStatus, Error> {
        self.run(PfCmd::GetStatus, None::<&()>)
    }

    pub fn clear_status(&self) -> Result<NoResp, Error> {
        self.run(PfCmd::ClearStatus, None::<&()>)
    }

    pub fn set_status_if(&self, ifname: &str) -> Result<NoResp, Error> {
        let req = SetStatusIfReq { ifname: ifname.to_string() };
        self.run(PfCmd::SetStatusIf, Some(&req))
    }

    pub fn get_timeout(&self, t: Timeout) -> Result<u32, Error> {
        let req = GetTimeoutReq { timeout: t as u32 };
        let resp: TimeoutResp = self.run(PfCmd::GetTimeout, Some(&req))?;
        Ok(resp.seconds)
    }

    /// Set a timeout, returning its previous value.
    pub fn set_timeout(&self, t: Timeout, seconds: u32) -> Result<u32, Error> {
        let req = SetTimeoutReq { timeout: t as u32, seconds };
        let resp: TimeoutResp = self.run(PfCmd::SetTimeout, Some(&req))?;
        Ok(resp.seconds)
    }

    pub fn get_limit(&self, l: Limit) -> Result<u32, Error> {
        let req = GetLimitReq { index: l as u32 };
        let resp: LimitResp = self.run(PfCmd::GetLimit, Some(&req))?;
        Ok(resp.limit)
    }

    /// Set a limit, returning its previous value.
    pub fn set_limit(&self, l: Limit, limit: u32) -> Result<u32, Error> {
        let req = SetLimitReq { index: l as u32, limit };
        let resp: LimitResp = self.run(PfCmd::SetLimit, Some(&req))?;
        Ok(resp.limit)
    }

    pub fn set_debug(&self, level: DebugLevel) -> Result<NoResp, Error> {
        self.run(PfCmd::SetDebug, Some(&SetDebugReq { level }))
    }

    pub fn set_hostid(&self, hostid: u32) -> Result<NoResp, Error> {
        self.run(PfCmd::SetHostId, Some(&SetHostIdReq { hostid }))
    }
}

/// Run one command against the engine.
///
/// A failed command that copied out an error body is reported as
/// [`Error::CommandError`]; otherwise the errno is approximated.
pub fn run_cmd_ioctl<T, R>(
    pf: &Pf,
    access: pf::api::Access,
    cmd: PfCmd,
    req: Option<&R>,
) -> Result<T, Error>
where
    T: CmdOk + DeserializeOwned,
    R: Serialize,
{
    let req_bytes = match req {
        Some(req) => {
            let bytes = postcard::to_allocvec(req)
                .map_err(|e| Error::ReqSer(cmd, e))?;
            // A zero-sized request would be indistinguishable from a
            // missing one.
            assert!(!bytes.is_empty(), "cannot use ZST for request type");
            bytes
        }

        None => Vec::new(),
    };

    let mut rioctl = PfCmdIoctl::new(cmd, req_bytes);
    let ret = pf_ioctl(pf, &mut rioctl, access);

    if ret != 0 {
        // Anytime a response is present it will have more context
        // for the error. Otherwise, we have to approximate the
        // error via errno.
        if let Some(cmd_err) = rioctl.cmd_err_resp() {
            return Err(Error::CommandError(cmd, cmd_err));
        }

        let msg = match ret {
            libc::EPROTO => "API version mismatch".to_string(),
            libc::ENOMSG => "failed to deser/ser req/resp".to_string(),
            libc::EPERM => "permission denied".to_string(),
            errno => format!("unexpected errno: {errno}"),
        };
        return Err(Error::IoctlFailed(cmd, msg));
    }

    postcard::from_bytes(&rioctl.resp_bytes)
        .map_err(|e| Error::RespDeser(cmd, e))
}
