// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The NPM cache snapshot.
//!
//! A running NPM instance serves (and can persist) a JSON document
//! describing its view of the cluster. The diagnostic tooling only
//! consumes the keys of the two set maps: together they are the list
//! of every set name the instance believes exists, from which the
//! hashed kernel names can be recomputed.

use super::hashed_name;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NpmCache {
    #[serde(rename = "Nodename", alias = "NodeName", default)]
    pub node_name: String,
    #[serde(rename = "NsMap", default)]
    pub ns_map: BTreeMap<String, Value>,
    #[serde(rename = "PodMap", default)]
    pub pod_map: BTreeMap<String, Value>,
    /// List sets, keyed by human-readable name.
    #[serde(rename = "ListMap", default)]
    pub list_map: BTreeMap<String, Value>,
    /// Hash sets, keyed by human-readable name.
    #[serde(rename = "SetMap", default)]
    pub set_map: BTreeMap<String, Value>,
}

impl NpmCache {
    /// Build a snapshot carrying only set names.
    pub fn from_set_names<L, S>(node_name: &str, lists: L, sets: S) -> Self
    where
        L: IntoIterator<Item = String>,
        S: IntoIterator<Item = String>,
    {
        let entry = |name: String| {
            let hashed = hashed_name(&name);
            let v = serde_json::json!({ "Name": name, "HashedName": hashed });
            (name, v)
        };

        Self {
            node_name: node_name.to_string(),
            list_map: lists.into_iter().map(entry).collect(),
            set_map: sets.into_iter().map(entry).collect(),
            ..Default::default()
        }
    }

    /// Map each hashed List set name back to its human-readable name.
    pub fn hashed_list_names(&self) -> BTreeMap<String, String> {
        self.list_map.keys().map(|k| (hashed_name(k), k.clone())).collect()
    }

    /// Map each hashed Hash set name back to its human-readable name.
    pub fn hashed_set_names(&self) -> BTreeMap<String, String> {
        self.set_map.keys().map(|k| (hashed_name(k), k.clone())).collect()
    }
}
