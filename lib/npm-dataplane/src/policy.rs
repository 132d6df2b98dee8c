// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The ACL policy cache.

use npm_api::AclPolicy;
use slog::Logger;
use slog::debug;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// Policies keyed by name, all behind a single lock.
pub struct PolicyManager {
    policies: Mutex<BTreeMap<String, AclPolicy>>,
    log: Logger,
}

impl PolicyManager {
    pub fn new(log: Logger) -> Self {
        Self {
            policies: Mutex::new(BTreeMap::new()),
            log: log.new(slog::o!("component" => "policy")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, AclPolicy>> {
        self.policies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a copy of the policy called `name`, if there is one.
    pub fn get(&self, name: &str) -> Option<AclPolicy> {
        self.lock().get(name).cloned()
    }

    /// Store `policy`, replacing whole any previous policy of the same
    /// name.
    pub fn add(&self, policy: AclPolicy) {
        debug!(self.log, "add policy"; "name" => &policy.policy_name);
        self.lock().insert(policy.policy_name.clone(), policy);
    }

    /// Remove the policy called `name`. Removing an absent policy is
    /// not an error.
    pub fn remove(&self, name: &str) {
        if self.lock().remove(name).is_some() {
            debug!(self.log, "removed policy"; "name" => name);
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
