// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Configuration of the L2 monitor loop.

use clap::Args;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Where the network manager keeps its state on Linux hosts.
pub const DEFAULT_TOPOLOGY_PATH: &str = "/var/run/azure-vnet.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Monitor settings, as read from a TOML file.
///
/// ```toml
/// interval_secs = 10
/// threshold = 1
/// command_timeout_secs = 10
/// topology_path = "/var/run/azure-vnet.json"
/// ```
///
/// A rule discrepancy is only acted on once it has been seen for
/// `threshold + 1` consecutive cycles, so a rule can go unrepaired
/// for up to `(threshold + 1) * interval_secs` seconds. See
/// [`MonitorConfig::worst_case_latency`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Seconds to sleep between cycles.
    pub interval_secs: u64,
    /// Cycles a discrepancy must persist before it is repaired.
    pub threshold: u32,
    /// Upper bound on any single ebtables invocation.
    pub command_timeout_secs: u64,
    pub topology_path: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            threshold: 1,
            command_timeout_secs: 10,
            topology_path: PathBuf::from(DEFAULT_TOPOLOGY_PATH),
        }
    }
}

/// Command line flags that take precedence over the config file.
#[derive(Args, Clone, Debug, Default)]
pub struct MonitorOverrides {
    /// Seconds between reconciliation cycles.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Cycles a discrepancy must persist before it is repaired.
    #[arg(long)]
    pub threshold: Option<u32>,

    /// Seconds before an ebtables invocation is killed.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// The network manager state file holding the topology.
    #[arg(long)]
    pub topology: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| {
            ConfigError::Read { path: path.to_path_buf(), source }
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, o: &MonitorOverrides) {
        if let Some(interval) = o.interval {
            self.interval_secs = interval;
        }
        if let Some(threshold) = o.threshold {
            self.threshold = threshold;
        }
        if let Some(timeout) = o.timeout {
            self.command_timeout_secs = timeout;
        }
        if let Some(topology) = &o.topology {
            self.topology_path = topology.clone();
        }
    }

    /// A zero threshold is allowed and means discrepancies are repaired
    /// on first sight.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Zero("interval_secs"));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Zero("command_timeout_secs"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The longest a discrepancy can persist before it is repaired,
    /// not counting the time taken by the cycles themselves.
    pub fn worst_case_latency(&self) -> Duration {
        self.interval() * (self.threshold + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(
            MonitorConfig::from_toml("").unwrap(),
            MonitorConfig::default()
        );
    }

    #[test]
    fn partial_file() {
        let cfg = MonitorConfig::from_toml(
            "threshold = 3\ntopology_path = \"/tmp/topo.json\"\n",
        )
        .unwrap();
        assert_eq!(cfg.threshold, 3);
        assert_eq!(cfg.topology_path, PathBuf::from("/tmp/topo.json"));
        assert_eq!(cfg.interval_secs, 10);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(MonitorConfig::from_toml("intreval_secs = 5").is_err());
    }

    #[test]
    fn flags_override_file() {
        let mut cfg = MonitorConfig::from_toml("interval_secs = 30").unwrap();
        cfg.apply(&MonitorOverrides {
            interval: Some(5),
            timeout: Some(2),
            ..Default::default()
        });
        assert_eq!(cfg.interval(), Duration::from_secs(5));
        assert_eq!(cfg.command_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.threshold, 1);
    }

    #[test]
    fn zero_interval_rejected() {
        let cfg = MonitorConfig { interval_secs: 0, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero("interval_secs"))
        ));

        let cfg = MonitorConfig { threshold: 0, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn latency_grows_with_threshold() {
        let cfg = MonitorConfig {
            interval_secs: 10,
            threshold: 2,
            ..Default::default()
        };
        assert_eq!(cfg.worst_case_latency(), Duration::from_secs(30));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            MonitorConfig::load("/nonexistent/npmadm.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
