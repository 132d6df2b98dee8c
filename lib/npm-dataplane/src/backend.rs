// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Platform capabilities for programming sets into the kernel.
//!
//! The platform is chosen once, at startup, by picking an [`OsType`]
//! and a [`SetBackend`]; the set manager never branches on the
//! platform beyond asking the [`OsType`] what it supports.

use crate::exec::CommandRunner;
use crate::exec::ExecError;
use npm_api::SetKind;
use npm_api::SetType;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    /// Whether a list set may hold other list sets.
    ///
    /// Only the Windows dataplane has nested set policies; Linux
    /// `list:set` sets may only hold hash sets.
    pub fn supports_nested_lists(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

/// Kernel operations on sets, addressed by hashed name.
pub trait SetBackend: Send + Sync {
    fn create_set(
        &self,
        hashed_name: &str,
        set_type: SetType,
    ) -> Result<(), ExecError>;

    fn destroy_set(&self, hashed_name: &str) -> Result<(), ExecError>;

    /// Add `member` (an IP for hash sets, a hashed set name for lists).
    fn add_member(&self, hashed_name: &str, member: &str)
    -> Result<(), ExecError>;

    fn remove_member(
        &self,
        hashed_name: &str,
        member: &str,
    ) -> Result<(), ExecError>;
}

/// A backend that programs nothing: the manager's caches are the
/// whole dataplane. Used where there is no kernel to talk to.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheOnly;

impl SetBackend for CacheOnly {
    fn create_set(&self, _: &str, _: SetType) -> Result<(), ExecError> {
        Ok(())
    }

    fn destroy_set(&self, _: &str) -> Result<(), ExecError> {
        Ok(())
    }

    fn add_member(&self, _: &str, _: &str) -> Result<(), ExecError> {
        Ok(())
    }

    fn remove_member(&self, _: &str, _: &str) -> Result<(), ExecError> {
        Ok(())
    }
}

pub const IPSET: &str = "ipset";

/// Linux `ipset(8)`.
///
/// Every call passes `-exist` so that replaying an operation the
/// kernel already reflects is not an error.
#[derive(Clone)]
pub struct Ipset {
    runner: Arc<dyn CommandRunner>,
}

impl Ipset {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ipset(&self, args: &[&str]) -> Result<(), ExecError> {
        let mut full = vec!["-exist"];
        full.extend_from_slice(args);
        self.runner.run(IPSET, &full).map(|_| ())
    }
}

fn ipset_type(set_type: SetType) -> &'static str {
    match (set_type, set_type.kind()) {
        (SetType::NamedPorts, _) => "hash:ip,port",
        (_, SetKind::Hash) => "nethash",
        (_, SetKind::List) => "setlist",
    }
}

impl SetBackend for Ipset {
    fn create_set(
        &self,
        hashed_name: &str,
        set_type: SetType,
    ) -> Result<(), ExecError> {
        self.ipset(&["create", hashed_name, ipset_type(set_type)])
    }

    fn destroy_set(&self, hashed_name: &str) -> Result<(), ExecError> {
        self.ipset(&["destroy", hashed_name])
    }

    fn add_member(
        &self,
        hashed_name: &str,
        member: &str,
    ) -> Result<(), ExecError> {
        self.ipset(&["add", hashed_name, member])
    }

    fn remove_member(
        &self,
        hashed_name: &str,
        member: &str,
    ) -> Result<(), ExecError> {
        self.ipset(&["del", hashed_name, member])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ipset_types() {
        assert_eq!(ipset_type(SetType::NameSpace), "nethash");
        assert_eq!(ipset_type(SetType::NamedPorts), "hash:ip,port");
        assert_eq!(ipset_type(SetType::KeyLabelOfNameSpace), "setlist");
    }

    #[test]
    fn nested_lists_windows_only() {
        assert!(OsType::Windows.supports_nested_lists());
        assert!(!OsType::Linux.supports_nested_lists());
    }
}
