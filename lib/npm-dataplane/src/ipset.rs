// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IP set store.
//!
//! Hash sets and list sets live in two separate caches, each behind
//! its own lock. Any operation that needs both takes the list lock
//! first and the hash lock second; nothing ever takes them in the
//! other order.

use crate::backend::OsType;
use crate::backend::SetBackend;
use crate::exec::ExecError;
use crate::provider::MetricsProvider;
use crate::provider::Providers;
use npm_api::NpmCache;
use npm_api::SetKind;
use npm_api::SetType;
use npm_api::hashed_name;
use slog::Logger;
use slog::debug;
use slog::info;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpSetError {
    #[error("{0} is not an IPv4 address (IPv6 is not supported)")]
    NotIpv4(String),

    #[error("ipset {0} does not exist")]
    NotFound(String),

    #[error("ipset {name} is not a {expected} set")]
    WrongKind { name: String, expected: SetKind },

    #[error("list {0} cannot be added to itself")]
    SelfMembership(String),

    #[error(
        "member ipset {0} is a list set and nested ipsets are not supported"
    )]
    NestedNotSupported(String),

    #[error("ipset {name} is still referenced by {references} list(s)")]
    InUse { name: String, references: u32 },

    #[error("kernel update of ipset {name} failed: {source}")]
    Backend {
        name: String,
        #[source]
        source: ExecError,
    },
}

/// A single set, as held in the manager's caches.
#[derive(Clone, Debug)]
pub struct IpSet {
    name: String,
    hashed_name: String,
    set_type: SetType,
    // Hash sets: ip -> owning pod key.
    ips: BTreeMap<Ipv4Addr, String>,
    // List sets: member set names.
    members: BTreeSet<String>,
    reference_count: u32,
}

impl IpSet {
    pub fn new(name: &str, set_type: SetType) -> Self {
        Self {
            name: name.to_string(),
            hashed_name: hashed_name(name),
            set_type,
            ips: BTreeMap::new(),
            members: BTreeSet::new(),
            reference_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hashed_name(&self) -> &str {
        &self.hashed_name
    }

    pub fn set_type(&self) -> SetType {
        self.set_type
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    /// The IPs of a hash set with their owning pod keys.
    pub fn ips(&self) -> &BTreeMap<Ipv4Addr, String> {
        &self.ips
    }

    /// The member set names of a list set.
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// The number of lists currently holding this set.
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }
}

#[derive(Debug, Default)]
struct IpSetMap {
    cache: BTreeMap<String, IpSet>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct IpSetManager {
    list_map: Mutex<IpSetMap>,
    set_map: Mutex<IpSetMap>,
    os: OsType,
    backend: Arc<dyn SetBackend>,
    log: Logger,
    metrics: Arc<dyn MetricsProvider>,
}

impl IpSetManager {
    pub fn new(
        os: OsType,
        backend: Arc<dyn SetBackend>,
        providers: &Providers,
    ) -> Self {
        Self {
            list_map: Mutex::new(IpSetMap::default()),
            set_map: Mutex::new(IpSetMap::default()),
            os,
            backend,
            log: providers.log.new(slog::o!("component" => "ipset")),
            metrics: providers.metrics.clone(),
        }
    }

    fn cache_for(&self, kind: SetKind) -> &Mutex<IpSetMap> {
        match kind {
            SetKind::Hash => &self.set_map,
            SetKind::List => &self.list_map,
        }
    }

    fn backend_err(name: &str) -> impl FnOnce(ExecError) -> IpSetError + '_ {
        move |source| IpSetError::Backend { name: name.to_string(), source }
    }

    /// Create an empty set of the given type.
    ///
    /// If a set by this name already exists in the cache for the
    /// type's kind, this is a no-op: the existing set, including its
    /// type, is left untouched.
    pub fn create_set(
        &self,
        name: &str,
        set_type: SetType,
    ) -> Result<(), IpSetError> {
        let mut map = lock(self.cache_for(set_type.kind()));
        if map.cache.contains_key(name) {
            return Ok(());
        }

        let set = IpSet::new(name, set_type);
        self.backend
            .create_set(set.hashed_name(), set_type)
            .map_err(Self::backend_err(name))?;
        info!(self.log, "created ipset";
            "name" => name,
            "hashed" => set.hashed_name(),
            "type" => %set_type,
        );
        map.cache.insert(name.to_string(), set);
        Ok(())
    }

    /// Record `ip` as a member of the hash set `set_name`, owned by
    /// `pod_key`.
    ///
    /// The set is created if it doesn't exist. If the IP is already a
    /// member but owned by another pod, the owner is replaced: pod IPs
    /// get reused, and the add for the new pod may well arrive before
    /// the delete for the old one.
    pub fn add_to_set(
        &self,
        set_name: &str,
        ip: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        let addr: Ipv4Addr =
            ip.parse().map_err(|_| IpSetError::NotIpv4(ip.to_string()))?;

        let lists = lock(&self.list_map);
        let mut map = lock(&self.set_map);
        if lists.cache.contains_key(set_name) {
            return Err(IpSetError::WrongKind {
                name: set_name.to_string(),
                expected: SetKind::Hash,
            });
        }

        if !map.cache.contains_key(set_name) {
            let set = IpSet::new(set_name, SetType::Unknown);
            self.backend
                .create_set(set.hashed_name(), SetType::Unknown)
                .map_err(Self::backend_err(set_name))?;
            map.cache.insert(set_name.to_string(), set);
        }

        let set = map
            .cache
            .get_mut(set_name)
            .ok_or_else(|| IpSetError::NotFound(set_name.to_string()))?;

        if set.kind() != SetKind::Hash {
            return Err(IpSetError::WrongKind {
                name: set_name.to_string(),
                expected: SetKind::Hash,
            });
        }

        if let Some(owner) = set.ips.get_mut(&addr) {
            if owner != pod_key {
                info!(self.log, "pod owner changed, replacing owner";
                    "set" => set_name,
                    "ip" => %addr,
                    "old_pod" => owner.as_str(),
                    "new_pod" => pod_key,
                );
                *owner = pod_key.to_string();
            }
            return Ok(());
        }

        self.backend
            .add_member(&set.hashed_name, ip)
            .map_err(Self::backend_err(set_name))?;
        set.ips.insert(addr, pod_key.to_string());
        self.metrics.entry_added(set_name);
        Ok(())
    }

    /// Remove `ip` from the hash set `set_name`.
    ///
    /// If the IP is owned by a pod other than `pod_key` the delete is
    /// stale (the IP has since been handed to another pod) and is
    /// ignored.
    pub fn delete_from_set(
        &self,
        set_name: &str,
        ip: &str,
        pod_key: &str,
    ) -> Result<(), IpSetError> {
        let lists = lock(&self.list_map);
        let mut map = lock(&self.set_map);
        if lists.cache.contains_key(set_name) {
            return Err(IpSetError::WrongKind {
                name: set_name.to_string(),
                expected: SetKind::Hash,
            });
        }

        let set = map
            .cache
            .get_mut(set_name)
            .ok_or_else(|| IpSetError::NotFound(set_name.to_string()))?;

        let Some((addr, owner)) = ip
            .parse::<Ipv4Addr>()
            .ok()
            .and_then(|addr| set.ips.get(&addr).map(|o| (addr, o)))
        else {
            debug!(self.log, "delete of non-member ignored";
                "set" => set_name, "ip" => ip);
            return Ok(());
        };

        if owner != pod_key {
            info!(self.log, "pod owner changed, ignoring stale delete";
                "set" => set_name,
                "ip" => ip,
                "owner" => owner.as_str(),
                "pod" => pod_key,
            );
            return Ok(());
        }

        self.backend
            .remove_member(&set.hashed_name, ip)
            .map_err(Self::backend_err(set_name))?;
        set.ips.remove(&addr);
        self.metrics.entry_removed(set_name);
        Ok(())
    }

    /// Look up a prospective list member. Returns its kind and hashed
    /// name.
    fn member_of(
        &self,
        lists: &IpSetMap,
        sets: &IpSetMap,
        set_name: &str,
    ) -> Result<(SetKind, String), IpSetError> {
        if let Some(set) = sets.cache.get(set_name) {
            return Ok((set.kind(), set.hashed_name.clone()));
        }

        match lists.cache.get(set_name) {
            Some(_) if !self.os.supports_nested_lists() => {
                Err(IpSetError::NestedNotSupported(set_name.to_string()))
            }
            Some(list) => Ok((list.kind(), list.hashed_name.clone())),
            None => Err(IpSetError::NotFound(set_name.to_string())),
        }
    }

    fn check_list<'a>(
        lists: &'a mut IpSetMap,
        sets: &IpSetMap,
        list_name: &str,
    ) -> Result<&'a mut IpSet, IpSetError> {
        let Some(list) = lists.cache.get_mut(list_name) else {
            if sets.cache.contains_key(list_name) {
                return Err(IpSetError::WrongKind {
                    name: list_name.to_string(),
                    expected: SetKind::List,
                });
            }
            return Err(IpSetError::NotFound(list_name.to_string()));
        };

        if list.kind() != SetKind::List {
            return Err(IpSetError::WrongKind {
                name: list_name.to_string(),
                expected: SetKind::List,
            });
        }
        Ok(list)
    }

    /// Make `set_name` a member of the list `list_name`.
    ///
    /// Adding a set that is already a member is a no-op, and in
    /// particular does not bump the member's reference count again.
    pub fn add_to_list(
        &self,
        list_name: &str,
        set_name: &str,
    ) -> Result<(), IpSetError> {
        if list_name == set_name {
            return Err(IpSetError::SelfMembership(list_name.to_string()));
        }

        let mut lists = lock(&self.list_map);
        let mut sets = lock(&self.set_map);

        let (member_kind, member_hashed) =
            self.member_of(&lists, &sets, set_name)?;
        let list = Self::check_list(&mut lists, &sets, list_name)?;

        if list.members.contains(set_name) {
            return Ok(());
        }

        self.backend
            .add_member(&list.hashed_name, &member_hashed)
            .map_err(Self::backend_err(list_name))?;
        list.members.insert(set_name.to_string());

        let member = match member_kind {
            SetKind::Hash => sets.cache.get_mut(set_name),
            SetKind::List => lists.cache.get_mut(set_name),
        };
        if let Some(member) = member {
            member.reference_count += 1;
        }

        self.metrics.entry_added(list_name);
        Ok(())
    }

    /// Remove `set_name` from the list `list_name`.
    ///
    /// Removing a set that is not a member is a no-op.
    pub fn delete_from_list(
        &self,
        list_name: &str,
        set_name: &str,
    ) -> Result<(), IpSetError> {
        if list_name == set_name {
            return Err(IpSetError::SelfMembership(list_name.to_string()));
        }

        let mut lists = lock(&self.list_map);
        let mut sets = lock(&self.set_map);

        let (member_kind, member_hashed) =
            self.member_of(&lists, &sets, set_name)?;
        let list = Self::check_list(&mut lists, &sets, list_name)?;

        if !list.members.contains(set_name) {
            return Ok(());
        }

        self.backend
            .remove_member(&list.hashed_name, &member_hashed)
            .map_err(Self::backend_err(list_name))?;
        list.members.remove(set_name);

        let member = match member_kind {
            SetKind::Hash => sets.cache.get_mut(set_name),
            SetKind::List => lists.cache.get_mut(set_name),
        };
        if let Some(member) = member {
            member.reference_count = member.reference_count.saturating_sub(1);
        }

        self.metrics.entry_removed(list_name);
        Ok(())
    }

    /// Delete the hash set `name`.
    ///
    /// Deleting a set that doesn't exist is a no-op. A set that is
    /// still a member of some list cannot be deleted; remove it from
    /// its lists first.
    pub fn delete_set(&self, name: &str) -> Result<(), IpSetError> {
        let mut sets = lock(&self.set_map);
        let Some(set) = sets.cache.get(name) else {
            return Ok(());
        };

        if set.reference_count > 0 {
            return Err(IpSetError::InUse {
                name: name.to_string(),
                references: set.reference_count,
            });
        }

        self.backend
            .destroy_set(&set.hashed_name)
            .map_err(Self::backend_err(name))?;
        sets.cache.remove(name);
        self.metrics.set_removed(name);
        info!(self.log, "deleted ipset"; "name" => name);
        Ok(())
    }

    /// Delete the list set `name`, releasing the reference it holds
    /// on each of its members.
    ///
    /// Deleting a list that doesn't exist is a no-op. A list that is
    /// itself a member of another list cannot be deleted.
    pub fn delete_list(&self, name: &str) -> Result<(), IpSetError> {
        let mut lists = lock(&self.list_map);
        let mut sets = lock(&self.set_map);

        let Some(list) = lists.cache.get(name) else {
            return Ok(());
        };

        if list.reference_count > 0 {
            return Err(IpSetError::InUse {
                name: name.to_string(),
                references: list.reference_count,
            });
        }

        self.backend
            .destroy_set(&list.hashed_name)
            .map_err(Self::backend_err(name))?;

        let Some(list) = lists.cache.remove(name) else {
            return Ok(());
        };

        for member in &list.members {
            let set = match sets.cache.get_mut(member) {
                Some(set) => Some(set),
                None => lists.cache.get_mut(member),
            };
            if let Some(set) = set {
                set.reference_count = set.reference_count.saturating_sub(1);
            }
        }

        self.metrics.set_removed(name);
        info!(self.log, "deleted list"; "name" => name);
        Ok(())
    }

    /// Drop every cached set. The kernel is not touched.
    pub fn clear(&self) {
        let mut lists = lock(&self.list_map);
        let mut sets = lock(&self.set_map);

        for name in lists.cache.keys().chain(sets.cache.keys()) {
            self.metrics.set_removed(name);
        }
        lists.cache.clear();
        sets.cache.clear();
    }

    /// Return a copy of the set called `name`, looking in the hash
    /// cache first.
    pub fn get_set(&self, name: &str) -> Option<IpSet> {
        let lists = lock(&self.list_map);
        let sets = lock(&self.set_map);
        sets.cache.get(name).or_else(|| lists.cache.get(name)).cloned()
    }

    /// Return copies of every set: lists first, then hash sets.
    pub fn sets(&self) -> Vec<IpSet> {
        let lists = lock(&self.list_map);
        let sets = lock(&self.set_map);
        lists.cache.values().chain(sets.cache.values()).cloned().collect()
    }

    /// The name maps consumed by the rule converter.
    pub fn snapshot(&self, node_name: &str) -> NpmCache {
        let lists = lock(&self.list_map);
        let sets = lock(&self.set_map);
        NpmCache::from_set_names(
            node_name,
            lists.cache.keys().cloned(),
            sets.cache.keys().cloned(),
        )
    }
}
