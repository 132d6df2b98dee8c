// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! L2 rules in the ebtables `nat` table.
//!
//! ebtables gives rules no identity beyond their text, so the exact
//! text printed by `ebtables -L --Lmac2` *is* the key used to compare
//! live and desired state. All rule text is produced by the
//! [`Display`] impl of [`L2Rule`]; nothing else in the crate formats
//! a rule.

use crate::exec::CommandRunner;
use crate::exec::ExecError;
use crate::topology::Topology;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use npm_api::MacAddr;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const EBTABLES: &str = "ebtables";
pub const NAT_TABLE: &str = "nat";

#[derive(Debug, Error)]
pub enum EbtablesError {
    #[error("refusing to {action} an empty rule in {chain}")]
    EmptyRule { action: Action, chain: Chain },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    PreRouting,
    PostRouting,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::PreRouting, Chain::PostRouting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreRouting => "PREROUTING",
            Self::PostRouting => "POSTROUTING",
        }
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PREROUTING" => Ok(Self::PreRouting),
            "POSTROUTING" => Ok(Self::PostRouting),
            _ => Err(format!("unknown ebtables chain: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Append,
    Delete,
}

impl Action {
    fn flag(&self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Append => "append",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// The four rule shapes the host needs for transparent L2 bridging.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum L2Rule {
    /// Broadcast ARP replies arriving on the external interface.
    ArpReplyDnat { ifname: String },
    /// Rewrite the source MAC of unicast frames leaving the external
    /// interface.
    UnicastSnat { ifname: String, mac: MacAddr },
    /// Answer ARP requests for an endpoint IP with its MAC.
    ArpReply { ip: Ipv4Addr, mac: MacAddr },
    /// Steer IPv4 traffic for an endpoint IP to its MAC.
    IpDnat { ifname: String, ip: Ipv4Addr, mac: MacAddr },
}

impl L2Rule {
    pub fn chain(&self) -> Chain {
        match self {
            Self::UnicastSnat { .. } => Chain::PostRouting,
            _ => Chain::PreRouting,
        }
    }
}

impl Display for L2Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ArpReplyDnat { ifname } => write!(
                f,
                "-p ARP -i {ifname} --arp-op Reply -j dnat --to-dst {} \
                 --dnat-target ACCEPT",
                MacAddr::BROADCAST,
            ),

            Self::UnicastSnat { ifname, mac } => write!(
                f,
                "-s Unicast -o {ifname} -j snat --to-src {mac} --snat-arp \
                 --snat-target ACCEPT",
            ),

            Self::ArpReply { ip, mac } => write!(
                f,
                "-p ARP --arp-op Request --arp-ip-dst {ip} -j arpreply \
                 --arpreply-mac {mac}",
            ),

            Self::IpDnat { ifname, ip, mac } => write!(
                f,
                "-p IPv4 -i {ifname} --ip-dst {ip} -j dnat --to-dst {mac} \
                 --dnat-target ACCEPT",
            ),
        }
    }
}

/// Rule text -> chain.
pub type RuleMap = BTreeMap<String, Chain>;

/// Every rule the topology calls for, in canonical text form.
pub fn desired_rules(topo: &Topology) -> Vec<L2Rule> {
    let mut rules = vec![];

    for ext in topo.external_interfaces.values() {
        rules.push(L2Rule::ArpReplyDnat { ifname: ext.name.clone() });
        rules.push(L2Rule::UnicastSnat {
            ifname: ext.name.clone(),
            mac: ext.mac_address,
        });

        for ep in ext.networks.values().flat_map(|nw| nw.endpoints.values())
        {
            for addr in &ep.ip_addresses {
                rules.push(L2Rule::ArpReply {
                    ip: addr.ip(),
                    mac: ep.mac_address,
                });
                rules.push(L2Rule::IpDnat {
                    ifname: ext.name.clone(),
                    ip: addr.ip(),
                    mac: ep.mac_address,
                });
            }
        }
    }

    rules
}

/// [`desired_rules`] keyed the same way as a live listing.
pub fn desired_rule_map(topo: &Topology) -> RuleMap {
    desired_rules(topo)
        .into_iter()
        .map(|rule| {
            let chain = rule.chain();
            (rule.to_string(), chain)
        })
        .collect()
}

/// Pull the rule lines out of an `ebtables -L` listing, dropping the
/// table/chain banner and blank lines.
pub fn parse_listing(listing: &str) -> impl Iterator<Item = &str> {
    listing.lines().map(str::trim).filter(|line| {
        !line.is_empty()
            && !line.contains("Bridge table")
            && !line.contains("Bridge chain")
    })
}

/// Talks to `ebtables(8)` through a [`CommandRunner`].
pub struct Ebtables<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Ebtables<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// The rules currently installed in `chain`.
    pub fn list(&self, chain: Chain) -> Result<Vec<String>, EbtablesError> {
        let out = self.runner.run(
            EBTABLES,
            &["-t", NAT_TABLE, "-L", chain.as_str(), "--Lmac2"],
        )?;
        Ok(parse_listing(&out).map(str::to_string).collect())
    }

    /// The rules currently installed in every chain we manage.
    pub fn live_rules(&self) -> Result<RuleMap, EbtablesError> {
        let mut live = RuleMap::new();
        for chain in Chain::ALL {
            for rule in self.list(chain)? {
                live.insert(rule, chain);
            }
        }
        Ok(live)
    }

    pub fn add(&self, chain: Chain, rule: &str) -> Result<(), EbtablesError> {
        self.apply(Action::Append, chain, rule)
    }

    pub fn delete(
        &self,
        chain: Chain,
        rule: &str,
    ) -> Result<(), EbtablesError> {
        self.apply(Action::Delete, chain, rule)
    }

    fn apply(
        &self,
        action: Action,
        chain: Chain,
        rule: &str,
    ) -> Result<(), EbtablesError> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(EbtablesError::EmptyRule { action, chain });
        }

        let mut args = vec!["-t", NAT_TABLE, action.flag(), chain.as_str()];
        args.extend(rule.split_whitespace());
        self.runner.run(EBTABLES, &args)?;
        Ok(())
    }
}
