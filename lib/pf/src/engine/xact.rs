// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ticketed transactions.
//!
//! Every staged list (a ruleset's inactive rule queue, the pool
//! buffer, the inactive ALTQ list, a ruleset's inactive tables) is
//! either closed or open under exactly one ticket. A `begin` discards
//! whatever a previous, abandoned transaction staged and opens a new
//! one; its ticket is the only one accepted until a commit or
//! rollback closes it.

use super::Pf;
use super::PfData;
use super::Result;
use crate::api::DebugLevel;
use crate::api::PfError;
use crate::api::XactEntry;
use crate::api::XactKind;
use crate::provider::LogLevel;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum XactState {
    #[default]
    Closed,
    Open {
        ticket: u64,
    },
}

impl XactState {
    pub fn ticket(self) -> Option<u64> {
        match self {
            Self::Closed => None,
            Self::Open { ticket } => Some(ticket),
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Is `ticket` the ticket of the open transaction?
    pub fn check(self, ticket: u64) -> Result<()> {
        match self {
            Self::Open { ticket: open } if open == ticket => Ok(()),
            Self::Open { .. } => {
                Err(PfError::Busy(format!("stale ticket {ticket}")))
            }
            Self::Closed => {
                Err(PfError::Busy(format!("no open transaction ({ticket})")))
            }
        }
    }
}

/// A list of items staged under a transaction.
#[derive(Debug)]
pub struct Staged<T> {
    state: XactState,
    items: Vec<T>,
}

impl<T> Default for Staged<T> {
    fn default() -> Self {
        Self { state: XactState::Closed, items: Vec::new() }
    }
}

impl<T> Staged<T> {
    pub fn state(&self) -> XactState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Open a transaction under `ticket`, returning the items left by
    /// the previous one. The caller owns their release.
    #[must_use]
    pub fn begin(&mut self, ticket: u64) -> Vec<T> {
        self.state = XactState::Open { ticket };
        core::mem::take(&mut self.items)
    }

    pub fn check(&self, ticket: u64) -> Result<()> {
        self.state.check(ticket)
    }

    /// Stage `item`. The caller has already checked the ticket.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Take the staged items, leaving the transaction open.
    pub fn drain(&mut self, ticket: u64) -> Result<Vec<T>> {
        self.check(ticket)?;
        Ok(core::mem::take(&mut self.items))
    }

    /// Take the staged items and close the transaction.
    pub fn take(&mut self, ticket: u64) -> Result<Vec<T>> {
        self.check(ticket)?;
        self.state = XactState::Closed;
        Ok(core::mem::take(&mut self.items))
    }

    /// Close the transaction and hand back its items. A ticket that
    /// is not the open one changes nothing.
    #[must_use]
    pub fn rollback(&mut self, ticket: u64) -> Option<Vec<T>> {
        self.take(ticket).ok()
    }
}

// ================================================================
// Table transactions
// ================================================================

impl PfData {
    pub(crate) fn begin_tables(&mut self, anchor: &str) -> Result<u64> {
        let ticket = self.next_ticket();
        let rs = self.rulesets.find_or_create(anchor)?;
        let path = rs.path.clone();
        let stale = rs.table_xact.ticket();

        if let Some(stale) = stale {
            self.ectx.tables.ina_rollback(&path, stale);
        }

        if let Err(e) = self.ectx.tables.ina_begin(&path, ticket) {
            if let Some(rs) = self.rulesets.find_mut(&path) {
                rs.table_xact = XactState::Closed;
            }
            self.rulesets.remove_if_empty(&path);
            return Err(e);
        }

        if let Some(rs) = self.rulesets.find_mut(&path) {
            rs.table_xact = XactState::Open { ticket };
        }
        Ok(ticket)
    }

    pub(crate) fn check_tables_ticket(
        &self,
        anchor: &str,
        ticket: u64,
    ) -> Result<()> {
        match self.rulesets.find(anchor) {
            Some(rs) => rs.table_xact.check(ticket),
            None => Err(PfError::Busy(format!("no such anchor: {anchor:?}"))),
        }
    }

    pub(crate) fn rollback_tables(&mut self, anchor: &str, ticket: u64) {
        let Some(rs) = self.rulesets.find_mut(anchor) else {
            return;
        };
        if rs.table_xact.check(ticket).is_err() {
            return;
        }

        rs.table_xact = XactState::Closed;
        let path = rs.path.clone();
        self.ectx.tables.ina_rollback(&path, ticket);
        self.rulesets.remove_if_empty(&path);
    }

    pub(crate) fn commit_tables(
        &mut self,
        anchor: &str,
        ticket: u64,
    ) -> Result<()> {
        let Some(rs) = self.rulesets.find_mut(anchor) else {
            return Err(PfError::Busy(format!("no such anchor: {anchor:?}")));
        };
        rs.table_xact.check(ticket)?;

        rs.table_xact = XactState::Closed;
        let path = rs.path.clone();
        let res = self.ectx.tables.ina_commit(&path, ticket);
        self.rulesets.remove_if_empty(&path);
        res
    }
}

// ================================================================
// Grouped transactions
// ================================================================

impl PfData {
    fn xbegin_one(&mut self, e: &XactEntry) -> Result<u64> {
        match e.kind {
            XactKind::Rules(class) => self.begin_rules(&e.anchor, class),
            XactKind::Altq => Ok(self.begin_altq()),
            XactKind::Table => self.begin_tables(&e.anchor),
        }
    }

    fn xrollback_one(&mut self, e: &XactEntry) {
        match e.kind {
            XactKind::Rules(class) => {
                self.rollback_rules(&e.anchor, class, e.ticket)
            }
            XactKind::Altq => self.rollback_altq(e.ticket),
            XactKind::Table => self.rollback_tables(&e.anchor, e.ticket),
        }
    }

    fn xcheck_one(&self, e: &XactEntry) -> Result<()> {
        match e.kind {
            XactKind::Rules(class) => {
                self.check_rules_ticket(&e.anchor, class, e.ticket)
            }
            XactKind::Altq => self.altq.inactive.check(e.ticket),
            XactKind::Table => self.check_tables_ticket(&e.anchor, e.ticket),
        }
    }

    fn xcommit_one(&mut self, e: &XactEntry) -> Result<()> {
        match e.kind {
            XactKind::Rules(class) => {
                self.commit_rules(&e.anchor, class, e.ticket)
            }
            XactKind::Altq => self.commit_altq(e.ticket),
            XactKind::Table => self.commit_tables(&e.anchor, e.ticket),
        }
    }
}

fn check_altq_anchor(entries: &[XactEntry]) -> Result<()> {
    for e in entries {
        if e.kind == XactKind::Altq && !e.anchor.is_empty() {
            return Err(PfError::InvalidArgument(format!(
                "altq transaction on anchor {:?}",
                e.anchor
            )));
        }
    }
    Ok(())
}

impl Pf {
    /// Begin every entry, filling in its ticket. If any begin fails,
    /// those already begun are rolled back.
    pub fn xbegin(
        &self,
        mut entries: Vec<XactEntry>,
    ) -> Result<Vec<XactEntry>> {
        check_altq_anchor(&entries)?;
        let mut data = self.lock();

        for i in 0..entries.len() {
            match data.xbegin_one(&entries[i]) {
                Ok(ticket) => entries[i].ticket = ticket,
                Err(e) => {
                    for begun in &entries[..i] {
                        data.xrollback_one(begun);
                    }
                    return Err(e);
                }
            }
        }

        Ok(entries)
    }

    /// Roll back every entry whose ticket is still open.
    pub fn xrollback(&self, entries: &[XactEntry]) -> Result<()> {
        check_altq_anchor(entries)?;
        let mut data = self.lock();
        for e in entries {
            data.xrollback_one(e);
        }
        Ok(())
    }

    /// Commit every entry as a unit.
    ///
    /// All tickets are checked before anything is applied; a stale
    /// one fails the whole commit with nothing changed. The entries
    /// are then applied in order and the result published once.
    pub fn xcommit(&self, entries: &[XactEntry]) -> Result<()> {
        check_altq_anchor(entries)?;
        let mut data = self.lock();

        for e in entries {
            data.xcheck_one(e)?;
        }

        let mut failed = None;
        for e in entries {
            if let Err(err) = data.xcommit_one(e) {
                data.log(
                    DebugLevel::Urgent,
                    LogLevel::Error,
                    &format!(
                        "grouped commit: {} {:?} failed: {err:?}",
                        e.kind, e.anchor
                    ),
                );
                failed.get_or_insert_with(|| {
                    format!("{} {:?}: {err:?}", e.kind, e.anchor)
                });
            }
        }

        self.publish(&mut data);
        match failed {
            Some(msg) => Err(PfError::CommitFailed(msg)),
            None => Ok(()),
        }
    }
}
