// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The control-plane core of a stateful packet filter.
//!
//! The engine ([`engine::Pf`]) owns every table the filter needs:
//! rulesets and their anchors, the tag and queue-name interning
//! tables, the pool staging buffer, the state table, and the
//! source-tracking table. Management commands arrive through
//! [`engine::ioctl`] and are applied under a single writer lock. The
//! packet path reads the active rules through a lock-free snapshot
//! that is republished, whole, after every change.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate cfg_if;

pub mod api;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;
pub mod snapshot;
pub mod sync;
