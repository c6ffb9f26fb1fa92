// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The command interface.
//!
//! Every management command arrives as a [`PfCmdIoctl`]: a command
//! number plus a postcard-encoded request. [`pf_ioctl`] checks the
//! API version and the caller's access, decodes the request, runs the
//! handler, and encodes either the response or the error into the
//! ioctl's response buffer. The return value is the errno.

use super::Pf;
use crate::api::API_VERSION;
use crate::api::Access;
use crate::api::AddAddrReq;
use crate::api::AddAltqReq;
use crate::api::AddRuleReq;
use crate::api::AddStateReq;
use crate::api::AddStatesReq;
use crate::api::AddStatesResp;
use crate::api::AltqXactReq;
use crate::api::BeginRulesReq;
use crate::api::ChangeAddrReq;
use crate::api::ChangeRuleReq;
use crate::api::ChangeRuleResp;
use crate::api::ClearStatesReq;
use crate::api::CmdOk;
use crate::api::GetAddrReq;
use crate::api::GetAddrResp;
use crate::api::GetAddrsReq;
use crate::api::GetAddrsResp;
use crate::api::GetAltqReq;
use crate::api::GetAltqResp;
use crate::api::GetAltqsResp;
use crate::api::GetLimitReq;
use crate::api::GetRuleReq;
use crate::api::GetRuleResp;
use crate::api::GetRulesReq;
use crate::api::GetRulesResp;
use crate::api::GetRulesetReq;
use crate::api::GetRulesetResp;
use crate::api::GetRulesetsReq;
use crate::api::GetRulesetsResp;
use crate::api::GetSrcNodesResp;
use crate::api::GetStateReq;
use crate::api::GetStateResp;
use crate::api::GetStatesReq;
use crate::api::GetStatesResp;
use crate::api::GetTimeoutReq;
use crate::api::KillSrcNodesReq;
use crate::api::KillStatesReq;
use crate::api::KilledResp;
use crate::api::LimitResp;
use crate::api::NatLookReq;
use crate::api::NatLookResp;
use crate::api::NoResp;
use crate::api::PF_CMD_RESP_COPY_OUT;
use crate::api::PfCmd;
use crate::api::PfCmdIoctl;
use crate::api::PfError;
use crate::api::PfStatus;
use crate::api::RulesXactReq;
use crate::api::SetDebugReq;
use crate::api::SetHostIdReq;
use crate::api::SetLimitReq;
use crate::api::SetStatusIfReq;
use crate::api::SetTimeoutReq;
use crate::api::TicketResp;
use crate::api::TimeoutResp;
use crate::api::XactReq;
use crate::api::XactResp;
use core::result;
use libc::c_int;
use serde::de::DeserializeOwned;

/// A wrapper around the caller's [`PfCmdIoctl`] providing what is
/// needed to decode the request and encode the response.
#[derive(Debug)]
pub struct IoctlEnvelope<'a> {
    ioctl: &'a mut PfCmdIoctl,
}

impl<'a> IoctlEnvelope<'a> {
    pub fn ioctl_cmd(&self) -> PfCmd {
        self.ioctl.cmd
    }

    /// Wrap `ioctl`, refusing it if it was built against another API
    /// version. The refusal is copied out as a [`PfError`].
    pub fn wrap(ioctl: &'a mut PfCmdIoctl) -> result::Result<Self, c_int> {
        if !ioctl.check_version() {
            let badver = PfError::BadApiVersion {
                user: ioctl.api_version,
                kernel: API_VERSION,
            };

            return Err(Self::copy_out_resp_i::<()>(ioctl, &Err(badver)));
        }

        Ok(Self { ioctl })
    }

    /// Decode the request body.
    pub fn copy_in_req<T: DeserializeOwned>(
        &mut self,
    ) -> result::Result<T, PfError> {
        if self.ioctl.req_bytes.is_empty() {
            return Err(PfError::NoRequestBody);
        }

        postcard::from_bytes(&self.ioctl.req_bytes)
            .map_err(|e| PfError::DeserCmdReq(e.to_string()))
    }

    fn copy_out_resp_i<T: CmdOk>(
        ioctl: &mut PfCmdIoctl,
        resp: &result::Result<T, PfError>,
    ) -> c_int {
        let ser_result = match resp {
            Ok(v) => postcard::to_allocvec(v)
                .map_err(|e| PfError::SerCmdResp(e.to_string())),

            Err(e) => postcard::to_allocvec(e)
                .map_err(|e| PfError::SerCmdErr(e.to_string())),
        };

        let bytes = match ser_result {
            Ok(bytes) => bytes,
            Err(e) => return e.to_errno(),
        };

        ioctl.resp_bytes = bytes;
        ioctl.flags |= PF_CMD_RESP_COPY_OUT;
        match resp {
            Ok(_) => 0,
            Err(e) => e.to_errno(),
        }
    }

    /// Encode `val` into the response buffer, returning the errno the
    /// caller should see.
    pub fn copy_out_resp<T: CmdOk>(
        &mut self,
        val: &result::Result<T, PfError>,
    ) -> c_int {
        Self::copy_out_resp_i(self.ioctl, val)
    }
}

fn check_access(cmd: PfCmd, access: Access) -> result::Result<(), PfError> {
    if access.securelevel > 1 && !cmd.allowed_at_securelevel() {
        return Err(PfError::PermissionDenied(format!(
            "{cmd:?} not allowed at securelevel {}",
            access.securelevel
        )));
    }

    if !access.writable && !cmd.is_read_only() {
        return Err(PfError::PermissionDenied(format!(
            "{cmd:?} requires a writable handle"
        )));
    }

    Ok(())
}

fn hdlr_resp<T: CmdOk>(
    env: &mut IoctlEnvelope,
    resp: result::Result<T, PfError>,
) -> c_int {
    env.copy_out_resp(&resp)
}

/// The entry point for every command. It verifies the API version and
/// the caller's access, then multiplexes the command to its handler.
pub fn pf_ioctl(pf: &Pf, ioctl: &mut PfCmdIoctl, access: Access) -> c_int {
    let mut env = match IoctlEnvelope::wrap(ioctl) {
        Ok(v) => v,
        Err(errno) => return errno,
    };

    let cmd = env.ioctl_cmd();
    if let Err(e) = check_access(cmd, access) {
        return env.copy_out_resp::<()>(&Err(e));
    }

    match cmd {
        PfCmd::Start => {
            let resp = pf.start().map(|_| NoResp::default());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::Stop => {
            let resp = pf.stop().map(|_| NoResp::default());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::BeginRules => {
            let resp = begin_rules_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::AddRule => {
            let resp = add_rule_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetRules => {
            let resp = get_rules_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetRule => {
            let resp = get_rule_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ChangeRule => {
            let resp = change_rule_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::CommitRules => {
            let resp = commit_rules_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::RollbackRules => {
            let resp = rollback_rules_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ClearRuleCtrs => {
            pf.clear_rule_counters();
            hdlr_resp(&mut env, Ok(NoResp::default()))
        }

        PfCmd::BeginAddrs => {
            let ticket = pf.begin_addrs();
            hdlr_resp(&mut env, Ok(TicketResp { ticket }))
        }

        PfCmd::AddAddr => {
            let resp = add_addr_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetAddrs => {
            let resp = get_addrs_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetAddr => {
            let resp = get_addr_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ChangeAddr => {
            let resp = change_addr_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::AddState => {
            let resp = add_state_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::AddStates => {
            let resp = add_states_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetState => {
            let resp = get_state_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetStates => {
            let resp = get_states_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ClearStates => {
            let resp = clear_states_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::KillStates => {
            let resp = kill_states_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::NatLook => {
            let resp = natlook_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetSrcNodes => {
            let nodes = pf.get_src_nodes();
            hdlr_resp(&mut env, Ok(GetSrcNodesResp { nodes }))
        }

        PfCmd::ClearSrcNodes => {
            let killed = pf.clear_src_nodes();
            hdlr_resp(&mut env, Ok(KilledResp { killed }))
        }

        PfCmd::KillSrcNodes => {
            let resp = kill_src_nodes_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::BeginAltqs => {
            let ticket = pf.begin_altq();
            hdlr_resp(&mut env, Ok(TicketResp { ticket }))
        }

        PfCmd::AddAltq => {
            let resp = add_altq_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetAltqs => {
            let resp: result::Result<GetAltqsResp, _> = Ok(pf.get_altqs());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetAltq => {
            let resp = get_altq_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ChangeAltq => {
            let resp = pf.change_altq().map(|_| NoResp::default());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::CommitAltqs => {
            let resp = commit_altq_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::RollbackAltqs => {
            let resp = rollback_altq_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::StartAltq => {
            let resp = pf.start_altq().map(|_| NoResp::default());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::StopAltq => {
            let resp = pf.stop_altq().map(|_| NoResp::default());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::XBegin => {
            let resp = xbegin_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::XRollback => {
            let resp = xrollback_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::XCommit => {
            let resp = xcommit_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetRulesets => {
            let resp = get_rulesets_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetRuleset => {
            let resp = get_ruleset_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetStatus => {
            let resp: result::Result<PfStatus, _> = Ok(pf.status());
            hdlr_resp(&mut env, resp)
        }

        PfCmd::ClearStatus => {
            pf.clear_status();
            hdlr_resp(&mut env, Ok(NoResp::default()))
        }

        PfCmd::SetStatusIf => {
            let resp = set_status_if_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetTimeout => {
            let resp = get_timeout_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::SetTimeout => {
            let resp = set_timeout_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::GetLimit => {
            let resp = get_limit_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::SetLimit => {
            let resp = set_limit_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::SetDebug => {
            let resp = set_debug_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }

        PfCmd::SetHostId => {
            let resp = set_hostid_hdlr(&mut env, pf);
            hdlr_resp(&mut env, resp)
        }
    }
}

type HdlrResult<T> = result::Result<T, PfError>;

fn begin_rules_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<TicketResp> {
    let req: BeginRulesReq = env.copy_in_req()?;
    let ticket = pf.begin_rules(&req.anchor, req.class)?;
    Ok(TicketResp { ticket })
}

fn add_rule_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: AddRuleReq = env.copy_in_req()?;
    pf.add_rule(req)?;
    Ok(NoResp::default())
}

fn get_rules_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetRulesResp> {
    let req: GetRulesReq = env.copy_in_req()?;
    pf.get_rules(&req.anchor, req.class)
}

fn get_rule_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<GetRuleResp> {
    let req: GetRuleReq = env.copy_in_req()?;
    let rule = pf.get_rule(&req.anchor, req.class, req.ticket, req.nr)?;
    Ok(GetRuleResp { rule })
}

fn change_rule_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<ChangeRuleResp> {
    let req: ChangeRuleReq = env.copy_in_req()?;
    let ticket = pf.change_rule(req)?;
    Ok(ChangeRuleResp { ticket })
}

fn commit_rules_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: RulesXactReq = env.copy_in_req()?;
    pf.commit_rules(&req.anchor, req.class, req.ticket)?;
    Ok(NoResp::default())
}

fn rollback_rules_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<NoResp> {
    let req: RulesXactReq = env.copy_in_req()?;
    pf.rollback_rules(&req.anchor, req.class, req.ticket);
    Ok(NoResp::default())
}

fn add_addr_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: AddAddrReq = env.copy_in_req()?;
    pf.add_addr(req)?;
    Ok(NoResp::default())
}

fn get_addrs_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetAddrsResp> {
    let req: GetAddrsReq = env.copy_in_req()?;
    pf.get_addrs(&req.sel)
}

fn get_addr_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<GetAddrResp> {
    let req: GetAddrReq = env.copy_in_req()?;
    let (af, addr) = pf.get_addr(&req.sel, req.ticket, req.nr)?;
    Ok(GetAddrResp { af, addr })
}

fn change_addr_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: ChangeAddrReq = env.copy_in_req()?;
    pf.change_addr(req)?;
    Ok(NoResp::default())
}

fn add_state_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: AddStateReq = env.copy_in_req()?;
    pf.add_state(req.state)?;
    Ok(NoResp::default())
}

fn add_states_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<AddStatesResp> {
    let req: AddStatesReq = env.copy_in_req()?;
    let added = pf.add_states(req.states)?;
    Ok(AddStatesResp { added })
}

fn get_state_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetStateResp> {
    let req: GetStateReq = env.copy_in_req()?;
    let state = pf.get_state(req.nr)?;
    Ok(GetStateResp { state })
}

fn get_states_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetStatesResp> {
    let req: GetStatesReq = env.copy_in_req()?;
    Ok(pf.get_states(req.max))
}

fn clear_states_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<KilledResp> {
    let req: ClearStatesReq = env.copy_in_req()?;
    Ok(KilledResp { killed: pf.clear_states(&req.ifname) })
}

fn kill_states_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<KilledResp> {
    let req: KillStatesReq = env.copy_in_req()?;
    Ok(KilledResp { killed: pf.kill_states(&req) })
}

fn natlook_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NatLookResp> {
    let req: NatLookReq = env.copy_in_req()?;
    pf.natlook(&req)
}

fn kill_src_nodes_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<KilledResp> {
    let req: KillSrcNodesReq = env.copy_in_req()?;
    Ok(KilledResp { killed: pf.kill_src_nodes(&req) })
}

fn add_altq_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: AddAltqReq = env.copy_in_req()?;
    pf.add_altq(req.ticket, req.altq)?;
    Ok(NoResp::default())
}

fn get_altq_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<GetAltqResp> {
    let req: GetAltqReq = env.copy_in_req()?;
    let altq = pf.get_altq(req.ticket, req.nr)?;
    Ok(GetAltqResp { altq })
}

fn commit_altq_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: AltqXactReq = env.copy_in_req()?;
    pf.commit_altq(req.ticket)?;
    Ok(NoResp::default())
}

fn rollback_altq_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<NoResp> {
    let req: AltqXactReq = env.copy_in_req()?;
    pf.rollback_altq(req.ticket);
    Ok(NoResp::default())
}

fn xbegin_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<XactResp> {
    let req: XactReq = env.copy_in_req()?;
    let entries = pf.xbegin(req.entries)?;
    Ok(XactResp { entries })
}

fn xrollback_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: XactReq = env.copy_in_req()?;
    pf.xrollback(&req.entries)?;
    Ok(NoResp::default())
}

fn xcommit_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: XactReq = env.copy_in_req()?;
    pf.xcommit(&req.entries)?;
    Ok(NoResp::default())
}

fn get_rulesets_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetRulesetsResp> {
    let req: GetRulesetsReq = env.copy_in_req()?;
    let nr = pf.get_rulesets(&req.path)?;
    Ok(GetRulesetsResp { nr })
}

fn get_ruleset_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<GetRulesetResp> {
    let req: GetRulesetReq = env.copy_in_req()?;
    let name = pf.get_ruleset(&req.path, req.nr)?;
    Ok(GetRulesetResp { name })
}

fn set_status_if_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<NoResp> {
    let req: SetStatusIfReq = env.copy_in_req()?;
    pf.set_status_if(&req.ifname)?;
    Ok(NoResp::default())
}

fn get_timeout_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<TimeoutResp> {
    let req: GetTimeoutReq = env.copy_in_req()?;
    let seconds = pf.get_timeout(req.timeout)?;
    Ok(TimeoutResp { seconds })
}

fn set_timeout_hdlr(
    env: &mut IoctlEnvelope,
    pf: &Pf,
) -> HdlrResult<TimeoutResp> {
    let req: SetTimeoutReq = env.copy_in_req()?;
    let seconds = pf.set_timeout(req.timeout, req.seconds)?;
    Ok(TimeoutResp { seconds })
}

fn get_limit_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<LimitResp> {
    let req: GetLimitReq = env.copy_in_req()?;
    let limit = pf.get_limit(req.index)?;
    Ok(LimitResp { limit })
}

fn set_limit_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<LimitResp> {
    let req: SetLimitReq = env.copy_in_req()?;
    let limit = pf.set_limit(req.index, req.limit)?;
    Ok(LimitResp { limit })
}

fn set_debug_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: SetDebugReq = env.copy_in_req()?;
    pf.set_debug(req.level);
    Ok(NoResp::default())
}

fn set_hostid_hdlr(env: &mut IoctlEnvelope, pf: &Pf) -> HdlrResult<NoResp> {
    let req: SetHostIdReq = env.copy_in_req()?;
    pf.set_hostid(req.hostid)?;
    Ok(NoResp::default())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::PfCfg;
    use crate::api::RulesetClass;
    use crate::provider::ExecCtx;
    use crate::provider::Providers;
    use serde::Serialize;
    use std::sync::Arc;

    fn pf() -> Pf {
        let ectx = Arc::new(ExecCtx::from(Providers::default()));
        Pf::new(PfCfg::default(), ectx).unwrap()
    }

    fn cmd<R: Serialize>(cmd: PfCmd, req: Option<&R>) -> PfCmdIoctl {
        let bytes = req
            .map(|r| postcard::to_allocvec(r).unwrap())
            .unwrap_or_default();
        PfCmdIoctl::new(cmd, bytes)
    }

    #[test]
    fn version_mismatch() {
        let pf = pf();
        let mut ioc = cmd::<()>(PfCmd::Start, None);
        ioc.api_version = API_VERSION + 1;
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), libc::EPROTO);
        assert!(matches!(
            ioc.cmd_err_resp(),
            Some(PfError::BadApiVersion { .. })
        ));
        assert!(!pf.status().running);
    }

    #[test]
    fn access_checks() {
        let pf = pf();
        let mut ioc = cmd::<()>(PfCmd::Start, None);
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::READ_ONLY), libc::EPERM);
        assert!(matches!(
            ioc.cmd_err_resp(),
            Some(PfError::PermissionDenied(_))
        ));

        let locked = Access { securelevel: 2, writable: true };
        let req = BeginRulesReq {
            anchor: String::new(),
            class: RulesetClass::Filter,
        };
        let mut ioc = cmd(PfCmd::BeginRules, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, locked), libc::EPERM);

        let mut ioc = cmd::<()>(PfCmd::GetStatus, None);
        assert_eq!(pf_ioctl(&pf, &mut ioc, locked), 0);
        let status: PfStatus = postcard::from_bytes(&ioc.resp_bytes).unwrap();
        assert!(!status.running);
    }

    #[test]
    fn missing_body() {
        let pf = pf();
        let mut ioc = cmd::<()>(PfCmd::AddRule, None);
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), libc::EINVAL);
        assert_eq!(ioc.cmd_err_resp(), Some(PfError::NoRequestBody));
    }

    #[test]
    fn rule_round_trip() {
        let pf = pf();
        let req = BeginRulesReq {
            anchor: String::new(),
            class: RulesetClass::Filter,
        };
        let mut ioc = cmd(PfCmd::BeginRules, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), 0);
        let TicketResp { ticket } =
            postcard::from_bytes(&ioc.resp_bytes).unwrap();

        let req = AddRuleReq {
            anchor: String::new(),
            ticket,
            pool_ticket: None,
            rule: Default::default(),
        };
        let mut ioc = cmd(PfCmd::AddRule, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), 0);

        let req = RulesXactReq {
            anchor: String::new(),
            class: RulesetClass::Filter,
            ticket,
        };
        let mut ioc = cmd(PfCmd::CommitRules, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), 0);

        // The ticket was consumed by the commit.
        let mut ioc = cmd(PfCmd::CommitRules, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::ADMIN), libc::EBUSY);

        let req = GetRulesReq {
            anchor: String::new(),
            class: RulesetClass::Filter,
        };
        let mut ioc = cmd(PfCmd::GetRules, Some(&req));
        assert_eq!(pf_ioctl(&pf, &mut ioc, Access::READ_ONLY), 0);
        let resp: GetRulesResp = postcard::from_bytes(&ioc.resp_bytes).unwrap();
        assert_eq!(resp.nr, 1);
        assert_eq!(resp.ticket, ticket);
    }
}
