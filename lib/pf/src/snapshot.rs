// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A published value that readers load without ever taking a lock.
//!
//! The writer builds a complete new value and swaps it in with one
//! atomic store. A reader holding a loaded value keeps seeing it,
//! unchanged, until it loads again.

use arc_swap::ArcSwap;
use arc_swap::Guard;
use core::fmt::Debug;
use core::ops::Deref;
use std::sync::Arc;

pub struct Resource<T>(ArcSwap<T>);

impl<T> From<T> for Resource<T> {
    fn from(value: T) -> Self {
        Self(ArcSwap::from_pointee(value))
    }
}

impl<T> Resource<T> {
    pub fn store(&self, value: T) {
        self.0.store(Arc::new(value));
    }

    /// Load the current value for the duration of a short read, such
    /// as the evaluation of one packet.
    pub fn peek(&self) -> ResourceGuard<T> {
        ResourceGuard(self.0.load())
    }

    /// Load the current value for an arbitrarily long read.
    pub fn load(&self) -> Arc<T> {
        self.0.load_full()
    }
}

pub struct ResourceGuard<T>(Guard<Arc<T>>);

impl<T> Deref for ResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Debug> Debug for Resource<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let current_val = self.load();
        write!(f, "{current_val:?}")
    }
}
