// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Name interning for tags and ALTQ queue names.
//!
//! Rules carry the small numeric id rather than the name. Ids are
//! allocated first-fit: the lowest id not currently in use is handed
//! out, so churn in names does not grow the id space.

use crate::api::TAGID_MAX;
use std::collections::BTreeMap;

#[derive(Debug)]
struct TagEntry {
    name: String,
    refs: u32,
}

#[derive(Debug, Default)]
pub struct TagTable {
    by_id: BTreeMap<u16, TagEntry>,
    by_name: BTreeMap<String, u16>,
}

impl TagTable {
    /// Return the id for `name`, taking a reference on it.
    ///
    /// Returns `0` once every id up to [`TAGID_MAX`] is in use.
    pub fn intern(&mut self, name: &str) -> u16 {
        if let Some(id) = self.by_name.get(name) {
            if let Some(entry) = self.by_id.get_mut(id) {
                entry.refs += 1;
                return *id;
            }
        }

        // The ids are ordered; the first one that is not its expected
        // value marks a hole. A table whose highest id equals its
        // length has none.
        let dense = self.by_id.len();
        let new_id = match self.by_id.last_key_value() {
            None => 1,
            Some((last, _)) if usize::from(*last) == dense => {
                last.saturating_add(1)
            }
            Some(_) => {
                let mut new_id: u16 = 1;
                for id in self.by_id.keys() {
                    if *id != new_id {
                        break;
                    }
                    new_id += 1;
                }
                new_id
            }
        };

        if new_id > TAGID_MAX {
            return 0;
        }

        self.by_id.insert(new_id, TagEntry { name: name.to_string(), refs: 1 });
        self.by_name.insert(name.to_string(), new_id);
        new_id
    }

    /// Drop one reference on `id`, freeing the id when it was the
    /// last. Releasing `0` or an unknown id does nothing.
    pub fn release(&mut self, id: u16) {
        let Some(entry) = self.by_id.get_mut(&id) else {
            return;
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = self.by_id.remove(&id) {
                self.by_name.remove(&entry.name);
            }
        }
    }

    pub fn resolve(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(|e| e.name.as_str())
    }

    pub fn refs(&self, id: u16) -> u32 {
        self.by_id.get(&id).map(|e| e.refs).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
