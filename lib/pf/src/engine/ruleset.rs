// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rulesets and the anchor tree.
//!
//! Every ruleset is named by its anchor path: `"a/b"` is the anchor
//! `b` beneath the top-level anchor `a`, and the main ruleset is the
//! empty path. Anchors are created on demand and removed again as
//! soon as nothing holds them: no rules, no open transaction, no
//! tables, no children, and no rule calling into them.

use super::Result;
use super::rule::ActiveQueue;
use super::rule::RuleHandle;
use super::xact::Staged;
use super::xact::XactState;
use crate::api::ANCHOR_NAME_SIZE;
use crate::api::MAXPATHLEN;
use crate::api::PfError;
use crate::api::RulesetClass;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The active and inactive queue of one rule class.
#[derive(Debug, Default)]
pub struct RuleQueues {
    pub(crate) active: Arc<ActiveQueue>,
    pub(crate) inactive: Staged<RuleHandle>,
}

#[derive(Debug)]
pub struct Ruleset {
    pub(crate) path: String,
    /// Names of the child anchors, sorted.
    pub(crate) children: BTreeSet<String>,
    /// Rules calling into this anchor.
    pub(crate) anchor_refs: u32,
    /// Tables attached to this anchor.
    pub(crate) tables: u32,
    pub(crate) table_xact: XactState,
    pub(crate) queues: [RuleQueues; RulesetClass::COUNT],
}

impl Ruleset {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            children: BTreeSet::new(),
            anchor_refs: 0,
            tables: 0,
            table_xact: XactState::Closed,
            queues: Default::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The last component of the path.
    pub fn name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.path,
        }
    }

    /// The parent's path, or `None` for the main ruleset.
    pub fn parent(&self) -> Option<&str> {
        if self.path.is_empty() {
            return None;
        }

        match self.path.rsplit_once('/') {
            Some((parent, _)) => Some(parent),
            None => Some(""),
        }
    }

    pub fn queue(&self, class: RulesetClass) -> &RuleQueues {
        &self.queues[class.index()]
    }

    pub fn queue_mut(&mut self, class: RulesetClass) -> &mut RuleQueues {
        &mut self.queues[class.index()]
    }

    /// Can this ruleset be removed?
    pub fn is_empty(&self) -> bool {
        self.anchor_refs == 0
            && self.children.is_empty()
            && self.tables == 0
            && !self.table_xact.is_open()
            && self.queues.iter().all(|q| {
                q.active.rules.is_empty()
                    && q.inactive.len() == 0
                    && !q.inactive.is_open()
            })
    }
}

/// Normalize an anchor path: surrounding slashes are dropped and
/// every component must be a plain, non-empty name.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.len() >= MAXPATHLEN {
        return Err(PfError::InvalidArgument(format!(
            "anchor path too long: {} bytes",
            trimmed.len()
        )));
    }

    if trimmed.is_empty() {
        return Ok(String::new());
    }

    for comp in trimmed.split('/') {
        if comp.is_empty()
            || comp == "."
            || comp == ".."
            || comp.len() >= ANCHOR_NAME_SIZE
        {
            return Err(PfError::InvalidArgument(format!(
                "bad anchor path: {path:?}"
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// The target of a rule's anchor call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnchorCall {
    pub path: String,
    /// Evaluate every child of `path` rather than `path` itself.
    pub wildcard: bool,
}

/// Resolve an anchor call made from the ruleset at `from`.
///
/// A leading `/` makes the call absolute. Otherwise it is relative to
/// `from`, and each leading `../` moves up one level. A trailing `/*`
/// calls every child of the named anchor.
pub fn resolve_anchor_call(from: &str, call: &str) -> Result<AnchorCall> {
    let bad =
        || PfError::InvalidArgument(format!("bad anchor call: {call:?}"));

    let mut path = if let Some(abs) = call.strip_prefix('/') {
        abs.to_string()
    } else {
        let mut base: Vec<&str> =
            from.split('/').filter(|c| !c.is_empty()).collect();
        let mut rest = call;
        while let Some(r) = rest.strip_prefix("../") {
            base.pop().ok_or_else(bad)?;
            rest = r;
        }
        if rest.is_empty() {
            return Err(bad());
        }
        base.push(rest);
        base.join("/")
    };

    let wildcard = match path.strip_suffix("/*") {
        Some(p) => {
            path = p.to_string();
            true
        }
        None => false,
    };

    let path = normalize_path(&path)?;
    if path.is_empty() {
        return Err(bad());
    }

    Ok(AnchorCall { path, wildcard })
}

/// All rulesets, keyed by path.
#[derive(Debug)]
pub struct RulesetStore {
    sets: BTreeMap<String, Ruleset>,
}

impl RulesetStore {
    /// A store holding only the main ruleset.
    pub fn new() -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(String::new(), Ruleset::new(""));
        Self { sets }
    }

    pub fn find(&self, path: &str) -> Option<&Ruleset> {
        let path = normalize_path(path).ok()?;
        self.sets.get(&path)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Ruleset> {
        let path = normalize_path(path).ok()?;
        self.sets.get_mut(&path)
    }

    /// Find the ruleset at `path`, creating it and any missing
    /// ancestors.
    pub fn find_or_create(&mut self, path: &str) -> Result<&mut Ruleset> {
        let path = normalize_path(path)?;

        if !self.sets.contains_key(&path) {
            let mut parent = String::new();
            for comp in path.split('/') {
                let child = if parent.is_empty() {
                    comp.to_string()
                } else {
                    format!("{parent}/{comp}")
                };

                if !self.sets.contains_key(&child) {
                    if let Some(p) = self.sets.get_mut(&parent) {
                        p.children.insert(comp.to_string());
                    }
                    self.sets.insert(child.clone(), Ruleset::new(&child));
                }
                parent = child;
            }
        }

        self.sets
            .get_mut(&path)
            .ok_or_else(|| PfError::InvalidArgument(format!("{path:?}")))
    }

    /// Remove the ruleset at `path` if it is empty, then its parent if
    /// that is now empty, and so on up the tree. The main ruleset is
    /// never removed.
    pub fn remove_if_empty(&mut self, path: &str) {
        let Ok(mut path) = normalize_path(path) else {
            return;
        };

        while !path.is_empty() {
            let Some(rs) = self.sets.get(&path) else {
                return;
            };
            if !rs.is_empty() {
                return;
            }

            let name = rs.name().to_string();
            let parent = rs.parent().unwrap_or_default().to_string();
            self.sets.remove(&path);
            if let Some(p) = self.sets.get_mut(&parent) {
                p.children.remove(&name);
            }
            path = parent;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Ruleset)> {
        self.sets.iter()
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&String, &mut Ruleset)> {
        self.sets.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }
}

impl Default for RulesetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_and_remove() {
        let mut store = RulesetStore::new();
        store.find_or_create("/a/b/c/").unwrap();
        assert!(store.find("a").is_some());
        assert!(store.find("a/b").is_some());
        assert_eq!(store.find("a/b/c").unwrap().name(), "c");
        assert_eq!(store.find("a/b/c").unwrap().parent(), Some("a/b"));
        assert_eq!(store.find("a").unwrap().parent(), Some(""));
        assert_eq!(store.find("").unwrap().parent(), None);

        // A ruleset with a child is kept.
        store.remove_if_empty("a/b");
        assert!(store.find("a/b").is_some());

        // Removing the leaf cascades up to the main ruleset.
        store.remove_if_empty("a/b/c");
        assert_eq!(store.len(), 1);
        assert!(store.find("").unwrap().children.is_empty());

        store.remove_if_empty("");
        assert!(store.find("").is_some());
    }

    #[test]
    fn busy_ruleset_kept() {
        let mut store = RulesetStore::new();
        let rs = store.find_or_create("a").unwrap();
        let _ = rs.queue_mut(RulesetClass::Filter).inactive.begin(7);
        store.remove_if_empty("a");
        assert!(store.find("a").is_some());

        let rs = store.find_mut("a").unwrap();
        let _ = rs.queue_mut(RulesetClass::Filter).inactive.rollback(7);
        rs.anchor_refs = 1;
        store.remove_if_empty("a");
        assert!(store.find("a").is_some());

        store.find_mut("a").unwrap().anchor_refs = 0;
        store.remove_if_empty("a");
        assert!(store.find("a").is_none());
    }

    #[test]
    fn bad_paths() {
        let mut store = RulesetStore::new();
        assert!(store.find_or_create("a//b").is_err());
        assert!(store.find_or_create("a/../b").is_err());
        assert!(store.find_or_create(&"x".repeat(ANCHOR_NAME_SIZE)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn anchor_calls() {
        let call = |from, c| resolve_anchor_call(from, c).unwrap();
        assert_eq!(
            call("", "ftp"),
            AnchorCall { path: "ftp".into(), wildcard: false }
        );
        assert_eq!(
            call("a/b", "c"),
            AnchorCall { path: "a/b/c".into(), wildcard: false }
        );
        assert_eq!(
            call("a/b", "../c/*"),
            AnchorCall { path: "a/c".into(), wildcard: true }
        );
        assert_eq!(
            call("a/b", "/x/y"),
            AnchorCall { path: "x/y".into(), wildcard: false }
        );
        assert!(resolve_anchor_call("", "../c").is_err());
        assert!(resolve_anchor_call("a", "/").is_err());
    }
}
