// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The diagnostic rule record.
//!
//! This is the machine-readable contract with operators. Field names
//! on the wire are fixed; only additive changes are allowed.

use super::Direction;
use super::SetType;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// One IP set matched by a rule.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInfo {
    #[serde(rename = "type")]
    pub set_type: SetType,
    /// `false` for a negated (`! --match-set`) match.
    pub included: bool,
    /// The human-readable set name.
    pub name: String,
    /// The kernel-visible set name.
    pub hashed_set_name: String,
    /// Live members, only populated for CIDR block sets.
    pub contents: Vec<String>,
}

/// A single NPM policy decision rule, as found in the kernel.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub chain: String,
    pub src_list: Vec<SetInfo>,
    pub dst_list: Vec<SetInfo>,
    pub protocol: String,
    #[serde(rename = "dPort")]
    pub dst_port: Option<u32>,
    #[serde(rename = "sPort")]
    pub src_port: Option<u32>,
    pub allowed: bool,
    pub direction: Direction,
    /// The raw `--match-set` flags, keyed by hashed set name, for
    /// references whose flags carry ordering information (e.g.
    /// `dst,dst`).
    pub unsorted_ipset: BTreeMap<String, String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_field_names() {
        let rule = RuleResponse {
            chain: "AZURE-NPM-INGRESS-PORT".into(),
            protocol: "tcp".into(),
            dst_port: Some(80),
            allowed: true,
            direction: Direction::Ingress,
            dst_list: vec![SetInfo {
                set_type: SetType::NameSpace,
                included: true,
                name: "ns-default".into(),
                hashed_set_name: "azure-npm-1".into(),
                contents: vec![],
            }],
            ..Default::default()
        };

        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["chain"], "AZURE-NPM-INGRESS-PORT");
        assert_eq!(v["dPort"], 80);
        assert!(v["sPort"].is_null());
        assert_eq!(v["direction"], "INGRESS");
        assert_eq!(v["dstList"][0]["type"], "NAMESPACE");
        assert_eq!(v["dstList"][0]["hashedSetName"], "azure-npm-1");
        assert!(v["unsortedIpset"].as_object().unwrap().is_empty());
    }
}
