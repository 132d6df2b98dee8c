// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Convert parsed iptables rules into [`RuleResponse`] records.
//!
//! Only the NPM chains are considered, and within them only rules
//! whose target is a verdict. Set references are resolved from their
//! hashed kernel names back to the names NPM gave them, using an
//! [`NpmCache`] snapshot. A reference the snapshot doesn't know is a
//! hard error: the kernel and NPM disagree about what exists, and
//! any output would be misleading.

use crate::backend::IPSET;
use crate::exec::CommandRunner;
use crate::iptables::Module;
use crate::iptables::Rule;
use crate::iptables::Table;
use crate::iptables::Target;
use ipnetwork::Ipv4Network;
use npm_api::Direction;
use npm_api::LABEL_DELIMITER;
use npm_api::NAMED_PORT_PREFIX;
use npm_api::NAMESPACE_PREFIX;
use npm_api::NpmCache;
use npm_api::RuleResponse;
use npm_api::SetInfo;
use npm_api::SetType;
use slog::Logger;
use slog::debug;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// The chains NPM owns in the filter table.
pub const AZURE_NPM_CHAINS: &[&str] = &[
    "AZURE-NPM",
    "AZURE-NPM-ACCEPT",
    "AZURE-NPM-EGRESS",
    "AZURE-NPM-EGRESS-DROPS",
    "AZURE-NPM-EGRESS-PORT",
    "AZURE-NPM-EGRESS-TO",
    "AZURE-NPM-INGRESS",
    "AZURE-NPM-INGRESS-DROPS",
    "AZURE-NPM-INGRESS-FROM",
    "AZURE-NPM-INGRESS-PORT",
];

/// Set-match flags longer than this (e.g. `dst,dst`) are also recorded
/// verbatim in the rule's unsorted ipset map.
pub const MIN_UNSORTED_IPSET_LENGTH: usize = 3;

/// Marks the start of the member list in `ipset list` output.
const MEMBERS_MARKER: &str = "Members:";

const TARGET_ACCEPT: &str = "ACCEPT";
const TARGET_DROP: &str = "DROP";

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConvertError {
    #[error("set does not exist: {0}")]
    SetNotExist(String),

    #[error("chain {chain}: malformed {option} option: {values:?}")]
    MalformedMatchSet { chain: String, option: String, values: Vec<String> },
}

/// Which of the snapshot's two name maps a set was found in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Namespace {
    List,
    Hash,
}

/// Whether `name` contains something that looks like an IPv4 address
/// or CIDR block.
fn contains_cidr(name: &str) -> bool {
    name.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '/'))
        .any(|run| run.contains('.') && run.parse::<Ipv4Network>().is_ok())
}

fn classify(name: &str, ns: Namespace) -> SetType {
    match ns {
        Namespace::List => match name.matches(LABEL_DELIMITER).count() {
            0 => SetType::KeyLabelOfNameSpace,
            1 => SetType::KeyValueLabelOfNameSpace,
            _ => SetType::NestedLabelOfPod,
        },

        Namespace::Hash if name.starts_with(NAMESPACE_PREFIX) => {
            SetType::NameSpace
        }
        Namespace::Hash if name.starts_with(NAMED_PORT_PREFIX) => {
            SetType::NamedPorts
        }
        Namespace::Hash if name.contains(LABEL_DELIMITER) => {
            SetType::KeyValueLabelOfPod
        }
        Namespace::Hash if contains_cidr(name) => SetType::CidrBlocks,
        Namespace::Hash => SetType::KeyLabelOfPod,
    }
}

/// The verdict of a rule's target, if it has one.
///
/// `ACCEPT` and `DROP` are verdicts. So is any target carrying a
/// follow-on verdict in a `--<ext>-target` option, as the ebtables
/// NAT targets do.
fn verdict(target: &Target) -> Option<bool> {
    let from_name = |name: &str| match name {
        TARGET_ACCEPT => Some(true),
        TARGET_DROP => Some(false),
        _ => None,
    };

    from_name(&target.name).or_else(|| {
        target
            .options
            .iter()
            .filter(|o| !o.is_negated() && o.name.ends_with("-target"))
            .find_map(|o| o.value().and_then(from_name))
    })
}

/// Extract the member lines from `ipset list` output.
pub fn parse_ipset_members(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip_while(|line| !line.starts_with(MEMBERS_MARKER))
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Converter {
    /// Hashed name -> name, for list sets.
    list_map: BTreeMap<String, String>,
    /// Hashed name -> name, for hash sets.
    set_map: BTreeMap<String, String>,
    /// Used to fetch the contents of CIDR sets, which the snapshot
    /// doesn't carry. Without one, CIDR sets are left empty.
    runner: Option<Arc<dyn CommandRunner>>,
    log: Logger,
}

impl Converter {
    pub fn new(
        cache: &NpmCache,
        runner: Option<Arc<dyn CommandRunner>>,
        log: Logger,
    ) -> Self {
        Self {
            list_map: cache.hashed_list_names(),
            set_map: cache.hashed_set_names(),
            runner,
            log: log.new(slog::o!("component" => "convert")),
        }
    }

    /// Convert every verdict rule of every NPM chain in `table`, in
    /// table order.
    pub fn convert(
        &self,
        table: &Table,
    ) -> Result<Vec<RuleResponse>, ConvertError> {
        let mut out = vec![];

        for chain in &table.chains {
            if !AZURE_NPM_CHAINS.contains(&chain.name.as_str()) {
                continue;
            }

            for rule in &chain.rules {
                if let Some(res) = self.convert_rule(&chain.name, rule)? {
                    out.push(res);
                }
            }
        }

        Ok(out)
    }

    /// Convert a single rule of `chain`. Rules without a verdict yield
    /// `None`.
    pub fn convert_rule(
        &self,
        chain: &str,
        rule: &Rule,
    ) -> Result<Option<RuleResponse>, ConvertError> {
        let Some(allowed) = rule.target.as_ref().and_then(verdict) else {
            return Ok(None);
        };

        let mut res = RuleResponse {
            chain: chain.to_string(),
            protocol: rule.protocol.clone().unwrap_or_default(),
            allowed,
            direction: Direction::from_chain_name(chain),
            ..Default::default()
        };

        for module in &rule.modules {
            match module.verb.as_str() {
                "set" => self.set_module(chain, module, &mut res)?,
                "tcp" | "udp" => port_module(module, &mut res),
                _ => {}
            }
        }

        Ok(Some(res))
    }

    fn set_module(
        &self,
        chain: &str,
        module: &Module,
        res: &mut RuleResponse,
    ) -> Result<(), ConvertError> {
        for opt in &module.options {
            let included = match opt.name.as_str() {
                "match-set" => true,
                "not-match-set" => false,
                other => {
                    debug!(self.log, "set option not interpreted";
                        "chain" => chain, "option" => other);
                    continue;
                }
            };

            let [hashed, flags] = opt.values.as_slice() else {
                return Err(ConvertError::MalformedMatchSet {
                    chain: chain.to_string(),
                    option: opt.name.clone(),
                    values: opt.values.clone(),
                });
            };

            let mut info = self.resolve(hashed)?;
            info.included = included;

            if flags.len() > MIN_UNSORTED_IPSET_LENGTH {
                res.unsorted_ipset.insert(hashed.clone(), flags.clone());
            }

            if flags.contains("src") {
                res.src_list.push(info);
            } else {
                res.dst_list.push(info);
            }
        }

        Ok(())
    }

    /// Look a hashed set name up in the snapshot, list sets first.
    fn resolve(&self, hashed: &str) -> Result<SetInfo, ConvertError> {
        let (name, ns) = if let Some(name) = self.list_map.get(hashed) {
            (name, Namespace::List)
        } else if let Some(name) = self.set_map.get(hashed) {
            (name, Namespace::Hash)
        } else {
            return Err(ConvertError::SetNotExist(hashed.to_string()));
        };

        let set_type = classify(name, ns);
        let contents = match set_type {
            SetType::CidrBlocks => self.cidr_contents(hashed),
            _ => vec![],
        };

        Ok(SetInfo {
            set_type,
            included: true,
            name: name.clone(),
            hashed_set_name: hashed.to_string(),
            contents,
        })
    }

    fn cidr_contents(&self, hashed: &str) -> Vec<String> {
        let Some(runner) = &self.runner else {
            return vec![];
        };

        match runner.run(IPSET, &["list", hashed]) {
            Ok(out) => parse_ipset_members(&out),
            Err(e) => {
                warn!(self.log, "failed to list CIDR set members";
                    "set" => hashed, "err" => %e);
                vec![]
            }
        }
    }
}

fn parse_port(module: &Module, names: &[&str]) -> Option<u32> {
    module
        .options
        .iter()
        .find(|o| names.contains(&o.name.as_str()))
        .and_then(|o| o.value())
        .and_then(|v| v.parse::<u32>().ok())
}

fn port_module(module: &Module, res: &mut RuleResponse) {
    if let Some(port) = parse_port(module, &["dport", "destination-port"]) {
        res.dst_port = Some(port);
    }
    if let Some(port) = parse_port(module, &["sport", "source-port"]) {
        res.src_port = Some(port);
    }
}

/// Render records as pretty JSON, the operator-facing format.
pub fn to_json(rules: &[RuleResponse]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(rules)
}
