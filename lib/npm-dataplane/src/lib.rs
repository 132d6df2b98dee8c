// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The NPM dataplane engine.
//!
//! * [`ipset::IpSetManager`]: the hash and list set store, programmed
//!   into the kernel through a [`backend::SetBackend`].
//! * [`policy::PolicyManager`]: the ACL policy cache.
//! * [`reconcile::NetworkMonitor`]: keeps the ebtables L2 rules in line
//!   with the host topology.
//! * [`iptables`] and [`convert`]: turn an `iptables-save` dump into
//!   per-rule diagnostic records.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod backend;
pub mod cache;
pub mod convert;
pub mod ebtables;
pub mod exec;
pub mod ipset;
pub mod iptables;
pub mod policy;
pub mod print;
pub mod provider;
pub mod reconcile;
pub mod topology;
