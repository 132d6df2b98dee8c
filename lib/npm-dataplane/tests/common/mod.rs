// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than its worth here.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

pub use npm_api::MacAddr;
pub use npm_api::NpmCache;
pub use npm_dataplane::backend::IPSET;
pub use npm_dataplane::ebtables::Chain;
pub use npm_dataplane::ebtables::EBTABLES;
pub use npm_dataplane::ebtables::parse_listing;
pub use npm_dataplane::exec::CommandRunner;
pub use npm_dataplane::exec::ExecError;
pub use npm_dataplane::topology::Topology;
pub use slog::Logger;

/// The hashed name of the CIDR set in `npmcache.json`.
pub const CIDR_SET_HASH: &str = "azure-npm-968896821";

pub fn resource(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("resources")
        .join(name)
}

pub fn read_resource(name: &str) -> String {
    let path = resource(name);
    fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}

pub fn discard_log() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn fixture_topology() -> Topology {
    Topology::from_json(&read_resource("topology.json")).unwrap()
}

#[derive(Debug, Default)]
pub struct KernelState {
    pub rules: BTreeMap<Chain, Vec<String>>,
    /// Rules whose append or delete fails.
    pub failing: BTreeSet<String>,
    pub fail_listing: bool,
    /// `ipset list` output, by hashed set name.
    pub ipset_listings: BTreeMap<String, String>,
    /// Every command run, as `prog arg...`.
    pub calls: Vec<String>,
}

/// A stand-in for the kernel tools, holding ebtables `nat` rules in
/// memory and answering `ipset list` from canned output.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

fn failed(cmd: String, stderr: &str) -> ExecError {
    ExecError::Failed {
        cmd,
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel whose PREROUTING chain holds the rules of
    /// `ebtables-prerouting.txt`.
    pub fn from_fixture() -> Self {
        let kernel = Self::new();
        let listing = read_resource("ebtables-prerouting.txt");
        for rule in parse_listing(&listing) {
            kernel.install(Chain::PreRouting, rule);
        }
        kernel
    }

    pub fn state(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap()
    }

    /// Install a rule behind the monitor's back.
    pub fn install(&self, chain: Chain, rule: &str) {
        self.state().rules.entry(chain).or_default().push(rule.to_string());
    }

    /// Remove a rule behind the monitor's back.
    pub fn remove(&self, chain: Chain, rule: &str) {
        if let Some(rules) = self.state().rules.get_mut(&chain) {
            rules.retain(|r| r != rule);
        }
    }

    pub fn rules(&self, chain: Chain) -> Vec<String> {
        self.state().rules.get(&chain).cloned().unwrap_or_default()
    }

    pub fn fail_on(&self, rule: &str) {
        self.state().failing.insert(rule.to_string());
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    pub fn set_ipset_listing(&self, hashed: &str, listing: &str) {
        self.state()
            .ipset_listings
            .insert(hashed.to_string(), listing.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// The ebtables calls made with `flag` (`-A`, `-D` or `-L`).
    pub fn ebtables_calls(&self, flag: &str) -> Vec<String> {
        let prefix = format!("{EBTABLES} -t nat {flag} ");
        self.calls().into_iter().filter(|c| c.starts_with(&prefix)).collect()
    }

    fn ebtables(
        state: &mut KernelState,
        cmd: String,
        args: &[&str],
    ) -> Result<String, ExecError> {
        let [_, _, flag, chain, rule @ ..] = args else {
            return Err(failed(cmd, "bad arguments"));
        };
        let chain: Chain =
            chain.parse().map_err(|e: String| failed(cmd.clone(), &e))?;
        let rule = rule.join(" ");

        match *flag {
            "-L" => {
                if state.fail_listing {
                    return Err(failed(cmd, "can't initialize ebtables"));
                }
                let rules =
                    state.rules.get(&chain).cloned().unwrap_or_default();
                let mut out = format!(
                    "Bridge table: nat\n\nBridge chain: {chain}, entries: \
                     {}, policy: ACCEPT\n",
                    rules.len()
                );
                for r in rules {
                    // Real listings carry a trailing space.
                    out.push_str(&r);
                    out.push_str(" \n");
                }
                Ok(out)
            }

            "-A" => {
                if state.failing.contains(&rule) {
                    return Err(failed(cmd, "Unable to update the kernel"));
                }
                state.rules.entry(chain).or_default().push(rule);
                Ok(String::new())
            }

            "-D" => {
                if state.failing.contains(&rule) {
                    return Err(failed(cmd, "Unable to update the kernel"));
                }
                let rules = state.rules.entry(chain).or_default();
                match rules.iter().position(|r| *r == rule) {
                    Some(idx) => {
                        rules.remove(idx);
                        Ok(String::new())
                    }
                    None => Err(failed(cmd, "Sorry, rule does not exist.")),
                }
            }

            _ => Err(failed(cmd, "unsupported flag")),
        }
    }
}

impl CommandRunner for FakeKernel {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let cmd = format!("{program} {}", args.join(" "));
        let mut state = self.state();
        state.calls.push(cmd.clone());

        match (program, args) {
            (EBTABLES, _) => Self::ebtables(&mut state, cmd, args),

            (IPSET, ["list", hashed]) => {
                match state.ipset_listings.get(*hashed) {
                    Some(out) => Ok(out.clone()),
                    None => Err(failed(
                        cmd,
                        "The set with the given name does not exist",
                    )),
                }
            }

            (IPSET, _) => Ok(String::new()),

            _ => Err(failed(cmd, "command not found")),
        }
    }
}
