// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet-filter engine.
//!
//! [`Pf`] owns every table. Management operations take the single
//! writer lock around [`PfData`], mutate it, and finish by publishing
//! a fresh [`ActiveRules`] snapshot. The packet path never takes the
//! writer lock to read rules: it loads the snapshot, which carries the
//! active queues, their skip steps, and the sync digest together.

pub mod altq;
pub mod arena;
pub mod ioctl;
pub mod pool;
pub mod rule;
pub mod ruleset;
pub mod src_node;
pub mod state;
pub mod status;
pub mod sync_hash;
pub mod tag;
pub mod xact;

use crate::api::Access;
use crate::api::DebugLevel;
use crate::api::Limit;
use crate::api::PfCfg;
use crate::api::PfError;
use crate::api::RuleAction;
use crate::api::RuleSpec;
use crate::api::RulesetClass;
use crate::provider::ExecCtx;
use crate::provider::LogLevel;
use crate::snapshot::Resource;
use crate::snapshot::ResourceGuard;
use crate::sync::KMutex;
use altq::AltqStore;
use arena::Arena;
use pool::PoolAddr;
use rule::ActiveQueue;
use rule::Rule;
use rule::RuleEntry;
use rule::RuleHandle;
use ruleset::RulesetStore;
use src_node::SourceNodeTable;
use state::StateTable;
use status::StatusData;
use status::Tunables;
use std::collections::BTreeMap;
use std::sync::Arc;
use xact::Staged;

pub type Result<T> = core::result::Result<T, PfError>;

/// The active rules of one ruleset, one queue per class.
#[derive(Clone, Debug)]
pub struct ActiveRuleset {
    pub queues: [Arc<ActiveQueue>; RulesetClass::COUNT],
}

impl ActiveRuleset {
    pub fn queue(&self, class: RulesetClass) -> &Arc<ActiveQueue> {
        &self.queues[class.index()]
    }
}

/// Everything the packet path reads, published as a unit.
#[derive(Debug)]
pub struct ActiveRules {
    /// Bumped on every publish.
    pub generation: u64,
    /// Keyed by anchor path; the main ruleset is `""`.
    pub rulesets: BTreeMap<String, ActiveRuleset>,
    /// The sync digest of the main ruleset's queues.
    pub digest: [u8; 16],
}

impl ActiveRules {
    fn empty() -> Self {
        Self { generation: 0, rulesets: BTreeMap::new(), digest: [0; 16] }
    }

    pub fn queue(
        &self,
        anchor: &str,
        class: RulesetClass,
    ) -> Option<&Arc<ActiveQueue>> {
        self.rulesets.get(anchor).map(|rs| rs.queue(class))
    }
}

/// The tables guarded by the writer lock.
pub struct PfData {
    pub(crate) ectx: Arc<ExecCtx>,
    pub(crate) cfg: PfCfg,
    pub(crate) tags: tag::TagTable,
    pub(crate) qids: tag::TagTable,
    pub(crate) rules: Arena<RuleEntry>,
    pub(crate) rulesets: RulesetStore,
    pub(crate) pool_buf: Staged<PoolAddr>,
    pub(crate) altq: AltqStore,
    pub(crate) states: StateTable,
    pub(crate) src_nodes: SourceNodeTable,
    pub(crate) status: StatusData,
    pub(crate) tunables: Tunables,
    pub(crate) default_rule: RuleHandle,
    ticket_seq: u64,
    generation: u64,
}

impl PfData {
    /// Issue a transaction ticket. Tickets are never zero and never
    /// reused, across every kind of transaction.
    pub(crate) fn next_ticket(&mut self) -> u64 {
        self.ticket_seq += 1;
        self.ticket_seq
    }

    pub(crate) fn now(&self) -> u64 {
        self.ectx.clock.now()
    }

    /// Log `msg` if the debug level is at least `at`.
    pub(crate) fn log(&self, at: DebugLevel, level: LogLevel, msg: &str) {
        if self.status.debug >= at {
            self.ectx.log.log(level, msg);
        }
    }

    fn snapshot(&mut self) -> ActiveRules {
        self.generation += 1;
        let rulesets = self
            .rulesets
            .iter()
            .map(|(path, rs)| {
                let queues = core::array::from_fn(|i| {
                    Arc::clone(&rs.queues[i].active)
                });
                (path.clone(), ActiveRuleset { queues })
            })
            .collect();

        let digest = match self.rulesets.find("") {
            Some(main) => sync_hash::ruleset_digest(
                main.queues.iter().map(|q| q.active.as_ref()),
            ),
            None => [0; 16],
        };
        self.status.checksum = digest;

        ActiveRules { generation: self.generation, rulesets, digest }
    }
}

/// The packet-filter engine.
pub struct Pf {
    ectx: Arc<ExecCtx>,
    active: Resource<ActiveRules>,
    data: KMutex<PfData>,
}

impl Pf {
    /// Create an engine with empty tables, an empty main ruleset, and
    /// the default rule installed.
    pub fn new(cfg: PfCfg, ectx: Arc<ExecCtx>) -> Result<Self> {
        let tunables = Tunables::from_cfg(&cfg)?;
        for l in [Limit::Tables, Limit::TableEntries] {
            ectx.tables.set_limit(l, tunables.limit(l))?;
        }
        let now = ectx.clock.now();
        let status = StatusData::new(&cfg, now);
        let states = StateTable::new(now);

        let mut rules = Arena::default();
        let spec = RuleSpec { action: RuleAction::Pass, ..Default::default() };
        let default_rule = rules.insert_with(|h| {
            RuleEntry::new(Rule::bare(h, spec), Default::default(), None)
        });

        let mut data = PfData {
            ectx: Arc::clone(&ectx),
            cfg,
            tags: Default::default(),
            qids: Default::default(),
            rules,
            rulesets: RulesetStore::new(),
            pool_buf: Staged::default(),
            altq: AltqStore::default(),
            states,
            src_nodes: SourceNodeTable::default(),
            status,
            tunables,
            default_rule,
            ticket_seq: 0,
            generation: 0,
        };

        let active = Resource::from(ActiveRules::empty());
        active.store(data.snapshot());

        Ok(Self { ectx, active, data: KMutex::new(data) })
    }

    pub fn ectx(&self) -> &ExecCtx {
        &self.ectx
    }

    /// The access a control handle runs with.
    pub fn access(&self, writable: bool) -> Access {
        Access { securelevel: self.lock().cfg.securelevel, writable }
    }

    /// Load the active rules for the duration of a short read.
    pub fn rules(&self) -> ResourceGuard<ActiveRules> {
        self.active.peek()
    }

    /// Load the active rules for an arbitrarily long read.
    pub fn snapshot(&self) -> Arc<ActiveRules> {
        self.active.load()
    }

    pub(crate) fn lock(&self) -> crate::sync::KMutexGuard<'_, PfData> {
        self.data.lock()
    }

    /// Publish the current active queues. Must be called with the
    /// writer lock held, after the last mutation of an operation.
    pub(crate) fn publish(&self, data: &mut PfData) {
        self.active.store(data.snapshot());
    }

    /// Run `f` under the writer lock and publish afterwards, whether
    /// or not `f` succeeded.
    pub(crate) fn modify<T>(
        &self,
        f: impl FnOnce(&mut PfData) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.lock();
        let res = f(&mut data);
        self.publish(&mut data);
        res
    }

    /// Remove expired states, then expired source nodes, freeing any
    /// rule whose references drained as a result.
    pub fn purge(&self, now: u64) {
        let mut data = self.lock();
        let states = data.purge_states(now);
        let nodes = data.purge_src_nodes(now);
        if states > 0 || nodes > 0 {
            data.log(
                DebugLevel::Misc,
                LogLevel::Note,
                &format!("purged {states} states, {nodes} source nodes"),
            );
        }
    }

    /// Empty every table: flush the main ruleset's queues and the
    /// ALTQ list, remove all states and source nodes, and stop.
    pub fn shutdown(&self) {
        let mut data = self.lock();
        let now = data.now();

        for class in RulesetClass::ALL {
            if let Ok(ticket) = data.begin_rules("", class) {
                if let Err(e) = data.commit_rules("", class, ticket) {
                    data.log(
                        DebugLevel::Urgent,
                        LogLevel::Warn,
                        &format!("shutdown: {class} flush failed: {e:?}"),
                    );
                }
            }
        }

        let ticket = data.begin_altq();
        if let Err(e) = data.commit_altq(ticket) {
            data.log(
                DebugLevel::Urgent,
                LogLevel::Warn,
                &format!("shutdown: altq flush failed: {e:?}"),
            );
        }

        data.clear_states("");
        data.clear_src_nodes(now);
        data.purge_states(now);
        data.purge_src_nodes(now);
        data.status.running = false;
        data.status.since = now;
        self.publish(&mut data);
    }
}

cfg_if! {
    if #[cfg(any(feature = "test-help", test))] {
        impl Pf {
            /// The live references on the active rule `nr` of
            /// `(anchor, class)`: `(states, src_nodes)`.
            pub fn rule_refs(
                &self,
                anchor: &str,
                class: RulesetClass,
                nr: u32,
            ) -> Option<(u32, u32)> {
                let snap = self.snapshot();
                let rule = snap.queue(anchor, class)?.rules.get(nr as usize)?;
                self.refs_of(rule)
            }

            /// The live references on `rule`, or `None` once it has
            /// been freed.
            pub fn refs_of(&self, rule: &Rule) -> Option<(u32, u32)> {
                let data = self.lock();
                data.rules.get(rule.handle()).map(|e| (e.states, e.src_nodes))
            }

            /// The number of rules allocated, the default rule
            /// included.
            pub fn rule_count(&self) -> usize {
                self.lock().rules.len()
            }

            pub fn tag_count(&self) -> usize {
                self.lock().tags.len()
            }

            pub fn anchor_exists(&self, path: &str) -> bool {
                self.lock().rulesets.find(path).is_some()
            }
        }
    }
}
