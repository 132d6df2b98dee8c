// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the dataplane to be stood up in different contexts
//! by plugging in implementations of services it does not own. The
//! engine never reaches for a process-wide registry: whoever builds
//! an [`IpSetManager`](crate::ipset::IpSetManager) hands it the sinks
//! it should report into. If it doesn't serve an obvious purpose with
//! at least two obvious implementations, then it probably doesn't need
//! to be a provider.

use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

/// The set of services required by the dataplane managers.
#[derive(Clone)]
pub struct Providers {
    pub log: Logger,
    pub metrics: Arc<dyn MetricsProvider>,
}

impl Providers {
    /// Providers that log nowhere and record nothing.
    pub fn discard() -> Self {
        Self {
            log: Logger::root(slog::Discard, slog::o!()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// A metrics provider receives IP set entry accounting.
///
/// An entry is either an IP in a hash set or a member set in a list.
/// The manager only reports real transitions: re-adding an existing
/// entry or deleting an absent one never reaches the provider.
pub trait MetricsProvider: Send + Sync {
    fn entry_added(&self, set_name: &str);
    fn entry_removed(&self, set_name: &str);
    /// The set is gone; drop any per-set state.
    fn set_removed(&self, set_name: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsProvider for NoopMetrics {
    fn entry_added(&self, _set_name: &str) {}
    fn entry_removed(&self, _set_name: &str) {}
    fn set_removed(&self, _set_name: &str) {}
}

/// A per-set entry inventory plus a global entry count.
///
/// Sets whose count drops to zero are removed from the inventory
/// rather than kept around with a zero value.
#[derive(Debug, Default)]
pub struct InventoryMetrics {
    inner: Mutex<Inventory>,
}

#[derive(Debug, Default)]
struct Inventory {
    total: u64,
    per_set: BTreeMap<String, u64>,
}

impl InventoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries across all sets.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// The number of entries in `set_name`, or 0 if it has none.
    pub fn entries(&self, set_name: &str) -> u64 {
        self.lock().per_set.get(set_name).copied().unwrap_or(0)
    }

    /// A copy of the per-set inventory.
    pub fn inventory(&self) -> BTreeMap<String, u64> {
        self.lock().per_set.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricsProvider for InventoryMetrics {
    fn entry_added(&self, set_name: &str) {
        let mut inv = self.lock();
        inv.total += 1;
        *inv.per_set.entry(set_name.to_string()).or_insert(0) += 1;
    }

    fn entry_removed(&self, set_name: &str) {
        let mut inv = self.lock();
        let Some(count) = inv.per_set.get_mut(set_name) else {
            return;
        };

        *count -= 1;
        if *count == 0 {
            inv.per_set.remove(set_name);
        }
        inv.total = inv.total.saturating_sub(1);
    }

    fn set_removed(&self, set_name: &str) {
        let mut inv = self.lock();
        if let Some(count) = inv.per_set.remove(set_name) {
            inv.total = inv.total.saturating_sub(count);
        }
    }
}
