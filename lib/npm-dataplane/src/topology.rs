// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The host's network topology as recorded by the network manager.
//!
//! External interface -> networks -> endpoints. The reconciler only
//! ever reads it.

use ipnetwork::IpNetwork;
use ipnetwork::Ipv4Network;
use npm_api::MacAddr;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// The key the network manager stores its state under.
pub const STORE_KEY: &str = "Network";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed topology: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    #[serde(default)]
    pub external_interfaces: BTreeMap<String, ExternalInterface>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalInterface {
    pub name: String,
    pub mac_address: MacAddr,
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// An endpoint. Only its IPv4 addresses take part in L2 rules; any
/// others are kept aside in `other_addresses`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "RawEndpoint", rename_all = "PascalCase")]
pub struct Endpoint {
    pub id: String,
    pub mac_address: MacAddr,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<Ipv4Network>,
    #[serde(skip)]
    pub other_addresses: Vec<IpNetwork>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEndpoint {
    id: String,
    mac_address: MacAddr,
    #[serde(rename = "IPAddresses", default)]
    ip_addresses: Vec<IpNetwork>,
}

impl From<RawEndpoint> for Endpoint {
    fn from(raw: RawEndpoint) -> Self {
        let mut ip_addresses = vec![];
        let mut other_addresses = vec![];
        for addr in raw.ip_addresses {
            match addr {
                IpNetwork::V4(v4) => ip_addresses.push(v4),
                other => other_addresses.push(other),
            }
        }

        Self {
            id: raw.id,
            mac_address: raw.mac_address,
            ip_addresses,
            other_addresses,
        }
    }
}

impl Topology {
    /// Decode a topology document. The document may either be the
    /// topology itself or a store file holding it under
    /// [`STORE_KEY`].
    pub fn from_json(raw: &str) -> Result<Self, TopologyError> {
        let mut doc: Value = serde_json::from_str(raw)?;
        let inner = match doc.get_mut(STORE_KEY) {
            Some(v) => v.take(),
            None => doc,
        };
        Ok(serde_json::from_value(inner)?)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.external_interfaces
            .values()
            .flat_map(|ext| ext.networks.values())
            .flat_map(|nw| nw.endpoints.values())
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints().count()
    }
}

/// Somewhere a fresh copy of the topology can be read from at the
/// start of every reconciliation cycle.
pub trait TopologySource: Send + Sync {
    fn topology(&self) -> Result<Topology, TopologyError>;
}

/// A topology re-read from a JSON file each time it is asked for.
#[derive(Clone, Debug)]
pub struct JsonFileTopology {
    path: PathBuf,
}

impl JsonFileTopology {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl TopologySource for JsonFileTopology {
    fn topology(&self) -> Result<Topology, TopologyError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| {
            TopologyError::Read { path: self.path.clone(), source }
        })?;
        Topology::from_json(&raw)
    }
}

/// A fixed topology.
impl TopologySource for Topology {
    fn topology(&self) -> Result<Topology, TopologyError> {
        Ok(self.clone())
    }
}
