// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers let the engine run in different contexts by allowing
//! the services it consumes, but does not own, to be plugged in:
//! logging, the clock, the interface registry, the table subsystem,
//! and the queueing disciplines. Each has an implementation fit for a
//! host integration and one fit for unit testing.

use crate::api::AddrFamily;
use crate::api::AltqSpec;
use crate::api::Limit;
use crate::api::PfError;
use crate::sync::KMutex;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The set of all platform-specific providers required by the
/// engine.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub clock: Box<dyn ClockProvider>,
    pub ifaces: Box<dyn IfaceProvider>,
    pub tables: Box<dyn TableProvider>,
    pub altq: Box<dyn AltqProvider>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            log: Box::new(PrintlnLog),
            clock: Box::new(SystemClock),
            ifaces: Box::new(MemIfaces::any()),
            tables: Box::new(MemTables::default()),
            altq: Box::new(NullAltq),
        }
    }
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Collects log lines in memory.
#[derive(Default)]
pub struct MemLog {
    lines: KMutex<Vec<(LogLevel, String)>>,
}

impl MemLog {
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }
}

impl LogProvider for MemLog {
    fn log(&self, level: LogLevel, msg: &str) {
        self.lines.lock().push((level, msg.to_string()));
    }
}

/// The second-granularity wall clock used for state creation and
/// expiry.
pub trait ClockProvider: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Clone, Copy)]
pub struct SystemClock;

impl ClockProvider for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self { now: AtomicU64::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }
}

impl ClockProvider for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl<T: ClockProvider + ?Sized> ClockProvider for std::sync::Arc<T> {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// The network-interface registry.
///
/// Rules and pool addresses hold a reference on every interface they
/// name, and on the address list of every interface used as a dynamic
/// address.
pub trait IfaceProvider: Send + Sync {
    fn exists(&self, ifname: &str) -> bool;

    /// Take a reference on the named interface.
    fn kif_ref(&self, ifname: &str) -> Result<(), PfError>;

    fn kif_unref(&self, ifname: &str);

    /// Start tracking the addresses of `ifname` for use as a dynamic
    /// address.
    fn dynaddr_setup(
        &self,
        ifname: &str,
        af: Option<AddrFamily>,
    ) -> Result<(), PfError>;

    fn dynaddr_remove(&self, ifname: &str);
}

/// An interface registry kept in memory, counting references per
/// name.
pub struct MemIfaces {
    /// `None` accepts any interface name.
    known: Option<BTreeSet<String>>,
    refs: KMutex<BTreeMap<String, u64>>,
}

impl MemIfaces {
    /// A registry that knows every interface name.
    pub fn any() -> Self {
        Self { known: None, refs: KMutex::new(BTreeMap::new()) }
    }

    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: Some(names.into_iter().map(Into::into).collect()),
            refs: KMutex::new(BTreeMap::new()),
        }
    }

    /// The number of outstanding references on `ifname`, dynamic
    /// address trackers included.
    pub fn refs(&self, ifname: &str) -> u64 {
        self.refs.lock().get(ifname).copied().unwrap_or(0)
    }

    pub fn total_refs(&self) -> u64 {
        self.refs.lock().values().sum()
    }

    fn take(&self, ifname: &str) -> Result<(), PfError> {
        if !self.exists(ifname) {
            return Err(PfError::InvalidArgument(format!(
                "no such interface: {ifname}"
            )));
        }
        *self.refs.lock().entry(ifname.to_string()).or_default() += 1;
        Ok(())
    }

    fn give(&self, ifname: &str) {
        let mut refs = self.refs.lock();
        if let Some(cnt) = refs.get_mut(ifname) {
            *cnt -= 1;
            if *cnt == 0 {
                refs.remove(ifname);
            }
        }
    }
}

impl IfaceProvider for MemIfaces {
    fn exists(&self, ifname: &str) -> bool {
        match &self.known {
            Some(known) => known.contains(ifname),
            None => true,
        }
    }

    fn kif_ref(&self, ifname: &str) -> Result<(), PfError> {
        self.take(ifname)
    }

    fn kif_unref(&self, ifname: &str) {
        self.give(ifname)
    }

    fn dynaddr_setup(
        &self,
        ifname: &str,
        _af: Option<AddrFamily>,
    ) -> Result<(), PfError> {
        self.take(ifname)
    }

    fn dynaddr_remove(&self, ifname: &str) {
        self.give(ifname)
    }
}

impl<T: IfaceProvider + ?Sized> IfaceProvider for std::sync::Arc<T> {
    fn exists(&self, ifname: &str) -> bool {
        (**self).exists(ifname)
    }

    fn kif_ref(&self, ifname: &str) -> Result<(), PfError> {
        (**self).kif_ref(ifname)
    }

    fn kif_unref(&self, ifname: &str) {
        (**self).kif_unref(ifname)
    }

    fn dynaddr_setup(
        &self,
        ifname: &str,
        af: Option<AddrFamily>,
    ) -> Result<(), PfError> {
        (**self).dynaddr_setup(ifname, af)
    }

    fn dynaddr_remove(&self, ifname: &str) {
        (**self).dynaddr_remove(ifname)
    }
}

/// The address-table subsystem.
///
/// Tables are attached per ruleset (anchor path). Table contents are
/// replaced through their own begin/commit/rollback cycle, which the
/// engine drives as part of grouped transactions. The subsystem owns
/// the hard caps on tables and table entries; the engine only sets
/// them.
pub trait TableProvider: Send + Sync {
    fn attach(&self, anchor: &str, name: &str) -> Result<(), PfError>;

    fn detach(&self, anchor: &str, name: &str);

    fn ina_begin(&self, anchor: &str, ticket: u64) -> Result<(), PfError>;

    fn ina_rollback(&self, anchor: &str, ticket: u64);

    fn ina_commit(&self, anchor: &str, ticket: u64) -> Result<(), PfError>;

    /// Set the hard cap for [`Limit::Tables`] or
    /// [`Limit::TableEntries`]. Fails with `Busy` when more than `max`
    /// are already in use. Other limits are ignored.
    fn set_limit(&self, limit: Limit, max: u32) -> Result<(), PfError>;

    /// How many tables or table entries are in use.
    fn in_use(&self, limit: Limit) -> u32;
}

#[derive(Debug, Default)]
struct MemTable {
    refs: u64,
    entries: u32,
}

#[derive(Debug)]
struct TableLimits {
    tables: u32,
    entries: u32,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            tables: Limit::Tables.default_limit(),
            entries: Limit::TableEntries.default_limit(),
        }
    }
}

/// A table subsystem that counts attachments and entries, and tracks
/// open inactive sets. A table exists while a rule refers to it.
#[derive(Default)]
pub struct MemTables {
    tables: KMutex<BTreeMap<(String, String), MemTable>>,
    limits: KMutex<TableLimits>,
    open: KMutex<BTreeMap<String, u64>>,
    committed: KMutex<BTreeMap<String, u64>>,
}

fn table_key(anchor: &str, name: &str) -> (String, String) {
    (anchor.to_string(), name.to_string())
}

impl MemTables {
    pub fn refs(&self, anchor: &str, name: &str) -> u64 {
        self.tables
            .lock()
            .get(&table_key(anchor, name))
            .map(|t| t.refs)
            .unwrap_or(0)
    }

    pub fn total_refs(&self) -> u64 {
        self.tables.lock().values().map(|t| t.refs).sum()
    }

    /// The number of table commits applied to `anchor`.
    pub fn commits(&self, anchor: &str) -> u64 {
        self.committed.lock().get(anchor).copied().unwrap_or(0)
    }

    /// Add `count` entries to an attached table, up to the entry cap
    /// shared by every table.
    pub fn add_entries(
        &self,
        anchor: &str,
        name: &str,
        count: u32,
    ) -> Result<(), PfError> {
        let max = self.limits.lock().entries;
        let mut tables = self.tables.lock();
        let used: u32 = tables.values().map(|t| t.entries).sum();
        let Some(table) = tables.get_mut(&table_key(anchor, name)) else {
            return Err(PfError::NotFound(format!(
                "no such table: {anchor}/{name}"
            )));
        };

        if used.saturating_add(count) > max {
            return Err(PfError::ResourceExhausted(format!(
                "table entry limit {max} reached"
            )));
        }
        table.entries += count;
        Ok(())
    }
}

impl TableProvider for MemTables {
    fn attach(&self, anchor: &str, name: &str) -> Result<(), PfError> {
        if name.is_empty() || name.len() >= crate::api::TABLE_NAME_SIZE {
            return Err(PfError::InvalidArgument(format!(
                "bad table name: {name:?}"
            )));
        }

        let max = self.limits.lock().tables;
        let mut tables = self.tables.lock();
        let key = table_key(anchor, name);
        if !tables.contains_key(&key) && tables.len() >= max as usize {
            return Err(PfError::ResourceExhausted(format!(
                "table limit {max} reached"
            )));
        }
        tables.entry(key).or_default().refs += 1;
        Ok(())
    }

    fn detach(&self, anchor: &str, name: &str) {
        let mut tables = self.tables.lock();
        let key = table_key(anchor, name);
        if let Some(t) = tables.get_mut(&key) {
            t.refs -= 1;
            if t.refs == 0 {
                tables.remove(&key);
            }
        }
    }

    fn ina_begin(&self, anchor: &str, ticket: u64) -> Result<(), PfError> {
        self.open.lock().insert(anchor.to_string(), ticket);
        Ok(())
    }

    fn ina_rollback(&self, anchor: &str, ticket: u64) {
        let mut open = self.open.lock();
        if open.get(anchor) == Some(&ticket) {
            open.remove(anchor);
        }
    }

    fn ina_commit(&self, anchor: &str, ticket: u64) -> Result<(), PfError> {
        let mut open = self.open.lock();
        if open.get(anchor) != Some(&ticket) {
            return Err(PfError::Busy(format!(
                "no open table transaction on {anchor:?}"
            )));
        }
        open.remove(anchor);
        *self.committed.lock().entry(anchor.to_string()).or_default() += 1;
        Ok(())
    }

    fn set_limit(&self, limit: Limit, max: u32) -> Result<(), PfError> {
        let mut limits = self.limits.lock();
        let used = self.in_use(limit);
        if max < used {
            return Err(PfError::Busy(format!(
                "{} limit {max} is below current use {used}",
                limit.name()
            )));
        }
        match limit {
            Limit::Tables => limits.tables = max,
            Limit::TableEntries => limits.entries = max,
            Limit::States | Limit::SrcNodes | Limit::Frags => {}
        }
        Ok(())
    }

    fn in_use(&self, limit: Limit) -> u32 {
        let tables = self.tables.lock();
        match limit {
            Limit::Tables => tables.len() as u32,
            Limit::TableEntries => tables.values().map(|t| t.entries).sum(),
            Limit::States | Limit::SrcNodes | Limit::Frags => 0,
        }
    }
}

impl<T: TableProvider + ?Sized> TableProvider for std::sync::Arc<T> {
    fn attach(&self, anchor: &str, name: &str) -> Result<(), PfError> {
        (**self).attach(anchor, name)
    }

    fn detach(&self, anchor: &str, name: &str) {
        (**self).detach(anchor, name)
    }

    fn ina_begin(&self, anchor: &str, ticket: u64) -> Result<(), PfError> {
        (**self).ina_begin(anchor, ticket)
    }

    fn ina_rollback(&self, anchor: &str, ticket: u64) {
        (**self).ina_rollback(anchor, ticket)
    }

    fn ina_commit(&self, anchor: &str, ticket: u64) -> Result<(), PfError> {
        (**self).ina_commit(anchor, ticket)
    }

    fn set_limit(&self, limit: Limit, max: u32) -> Result<(), PfError> {
        (**self).set_limit(limit, max)
    }

    fn in_use(&self, limit: Limit) -> u32 {
        (**self).in_use(limit)
    }
}

/// The queueing-discipline subsystem.
pub trait AltqProvider: Send + Sync {
    /// Validate and prepare a staged discipline or queue.
    fn add(&self, altq: &AltqSpec) -> Result<(), PfError>;

    /// Attach a committed discipline to its interface.
    fn attach(&self, altq: &AltqSpec) -> Result<(), PfError>;

    fn detach(&self, altq: &AltqSpec);

    /// Turn queueing on or off for the discipline on `ifname`.
    fn enable(&self, ifname: &str, on: bool) -> Result<(), PfError>;
}

/// Accepts every queue and does nothing with it.
#[derive(Clone, Copy)]
pub struct NullAltq;

impl AltqProvider for NullAltq {
    fn add(&self, _altq: &AltqSpec) -> Result<(), PfError> {
        Ok(())
    }

    fn attach(&self, _altq: &AltqSpec) -> Result<(), PfError> {
        Ok(())
    }

    fn detach(&self, _altq: &AltqSpec) {}

    fn enable(&self, _ifname: &str, _on: bool) -> Result<(), PfError> {
        Ok(())
    }
}

impl<T: AltqProvider + ?Sized> AltqProvider for std::sync::Arc<T> {
    fn add(&self, altq: &AltqSpec) -> Result<(), PfError> {
        (**self).add(altq)
    }

    fn attach(&self, altq: &AltqSpec) -> Result<(), PfError> {
        (**self).attach(altq)
    }

    fn detach(&self, altq: &AltqSpec) {
        (**self).detach(altq)
    }

    fn enable(&self, ifname: &str, on: bool) -> Result<(), PfError> {
        (**self).enable(ifname, on)
    }
}

/// The execution context handed to the engine: the providers, boxed.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
    pub clock: Box<dyn ClockProvider>,
    pub ifaces: Box<dyn IfaceProvider>,
    pub tables: Box<dyn TableProvider>,
    pub altq: Box<dyn AltqProvider>,
}

impl From<Providers> for ExecCtx {
    fn from(p: Providers) -> Self {
        Self {
            log: p.log,
            clock: p.clock,
            ifaces: p.ifaces,
            tables: p.tables,
            altq: p.altq,
        }
    }
}

impl<T: LogProvider + ?Sized> LogProvider for std::sync::Arc<T> {
    fn log(&self, level: LogLevel, msg: &str) {
        (**self).log(level, msg)
    }
}
