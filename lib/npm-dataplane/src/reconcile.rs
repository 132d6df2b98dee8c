// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The L2 reconciliation loop.
//!
//! Each cycle compares the rules installed in the ebtables `nat` table
//! with the rules the topology calls for. A rule that differs is not
//! acted on straight away: it becomes a candidate, and only once it has
//! been a candidate for `threshold` consecutive cycles is it added or
//! deleted. A candidate that stops differing, even for one cycle, drops
//! out of the pending maps and starts over.
//!
//! Listing rules and updating the topology are not atomic with respect
//! to each other, so a single cycle can easily observe a rule that is
//! only momentarily missing. The threshold keeps such rules from being
//! churned.

use crate::ebtables::Chain;
use crate::ebtables::Ebtables;
use crate::ebtables::RuleMap;
use crate::ebtables::desired_rule_map;
use crate::exec::CommandRunner;
use crate::topology::TopologySource;
use itertools::Itertools;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Rules waiting out the threshold: rule text -> cycles seen.
#[derive(Debug, Default)]
struct PendingChanges {
    add: BTreeMap<String, u32>,
    delete: BTreeMap<String, u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Operation {
    #[serde(rename = "EBTableAdd")]
    Add,
    #[serde(rename = "EBTableDelete")]
    Delete,
}

/// One applied (or attempted) rule change.
#[derive(Clone, Debug, Serialize)]
pub struct ReportEvent {
    pub operation: Operation,
    pub chain: Chain,
    pub rule: String,
    /// Cycles the rule spent as a candidate before being applied.
    pub cycles: u32,
    /// `None` on success.
    pub error: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Rule changes made by the monitor since the report was last taken.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub events: Vec<ReportEvent>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEvent> {
        self.events.iter().filter(|e| e.error.is_some())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// Another cycle is still running.
    InFlight,
    /// The topology could not be read.
    Topology,
    /// The topology has no external interfaces, so there is nothing
    /// to compare against.
    NoInterfaces,
    /// A chain could not be listed.
    Listing,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CycleStats {
    pub live: usize,
    pub desired: usize,
    pub added: usize,
    pub deleted: usize,
    pub failed: usize,
    pub pending_add: usize,
    pub pending_delete: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Completed(CycleStats),
}

pub struct NetworkMonitor {
    threshold: u32,
    runner: Arc<dyn CommandRunner>,
    topology: Arc<dyn TopologySource>,
    pending: Mutex<PendingChanges>,
    report: Mutex<ReconcileReport>,
    log: Logger,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Count one more sighting of `rule` as a candidate. Returns the
/// number of previous sightings once that reaches `threshold`, at
/// which point the rule leaves the pending map.
fn strike(
    pending: &mut BTreeMap<String, u32>,
    rule: &str,
    threshold: u32,
) -> Option<u32> {
    let seen = pending.get(rule).copied().unwrap_or(0);
    if seen >= threshold {
        pending.remove(rule);
        Some(seen)
    } else {
        pending.insert(rule.to_string(), seen + 1);
        None
    }
}

impl NetworkMonitor {
    pub fn new(
        threshold: u32,
        runner: Arc<dyn CommandRunner>,
        topology: Arc<dyn TopologySource>,
        log: Logger,
    ) -> Self {
        Self {
            threshold,
            runner,
            topology,
            pending: Mutex::new(PendingChanges::default()),
            report: Mutex::new(ReconcileReport::default()),
            log: log.new(slog::o!("component" => "reconcile")),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Rules currently waiting to be added, with their strike counts.
    pub fn pending_adds(&self) -> BTreeMap<String, u32> {
        lock(&self.pending).add.clone()
    }

    /// Rules currently waiting to be deleted, with their strike counts.
    pub fn pending_deletes(&self) -> BTreeMap<String, u32> {
        lock(&self.pending).delete.clone()
    }

    /// Take the accumulated report, leaving an empty one behind.
    pub fn take_report(&self) -> ReconcileReport {
        std::mem::take(&mut *lock(&self.report))
    }

    fn record(&self, event: ReportEvent) {
        lock(&self.report).events.push(event);
    }

    /// Run a single reconciliation cycle.
    pub fn run_cycle(&self) -> CycleOutcome {
        let mut pending = match self.pending.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(self.log, "cycle already in flight, skipping");
                return CycleOutcome::Skipped(SkipReason::InFlight);
            }
        };

        let topo = match self.topology.topology() {
            Ok(topo) => topo,
            Err(e) => {
                warn!(self.log, "failed to read topology"; "err" => %e);
                return CycleOutcome::Skipped(SkipReason::Topology);
            }
        };

        if topo.external_interfaces.is_empty() {
            debug!(self.log, "no external interfaces, nothing to reconcile");
            return CycleOutcome::Skipped(SkipReason::NoInterfaces);
        }

        let dual_stack =
            topo.endpoints().filter(|ep| !ep.other_addresses.is_empty());
        for ep in dual_stack {
            debug!(self.log, "ignoring non-IPv4 endpoint addresses";
                "endpoint" => ep.id.as_str(),
                "addresses" => ep.other_addresses.iter().join(","),
            );
        }

        let eb = Ebtables::new(&*self.runner);
        let live = match eb.live_rules() {
            Ok(live) => live,
            Err(e) => {
                warn!(self.log, "failed to list ebtables rules"; "err" => %e);
                return CycleOutcome::Skipped(SkipReason::Listing);
            }
        };
        let desired = desired_rule_map(&topo);

        let mut stats = CycleStats {
            live: live.len(),
            desired: desired.len(),
            ..Default::default()
        };

        // Both passes work from the same live/desired pair, so no rule
        // can be pending both ways.
        self.delete_pass(&eb, &mut pending.delete, &live, &desired, &mut stats);
        self.add_pass(&eb, &mut pending.add, &live, &desired, &mut stats);

        stats.pending_add = pending.add.len();
        stats.pending_delete = pending.delete.len();
        debug!(self.log, "cycle complete";
            "live" => stats.live,
            "desired" => stats.desired,
            "added" => stats.added,
            "deleted" => stats.deleted,
            "failed" => stats.failed,
        );
        CycleOutcome::Completed(stats)
    }

    fn delete_pass(
        &self,
        eb: &Ebtables<'_>,
        pending: &mut BTreeMap<String, u32>,
        live: &RuleMap,
        desired: &RuleMap,
        stats: &mut CycleStats,
    ) {
        // Candidates that went away by themselves, or became desired
        // again, start over.
        pending.retain(|rule, _| {
            live.contains_key(rule) && !desired.contains_key(rule)
        });

        for (rule, &chain) in live {
            if desired.contains_key(rule) {
                continue;
            }

            let Some(cycles) = strike(pending, rule, self.threshold) else {
                info!(self.log, "unmatched live rule, waiting";
                    "chain" => %chain,
                    "rule" => rule.as_str(),
                    "seen" => pending.get(rule).copied().unwrap_or(0),
                );
                continue;
            };

            let error = eb.delete(chain, rule).err().map(|e| e.to_string());
            match &error {
                None => {
                    info!(self.log, "deleted ebtables rule";
                        "chain" => %chain, "rule" => rule.as_str(),
                        "cycles" => cycles);
                    stats.deleted += 1;
                }
                Some(err) => {
                    warn!(self.log, "failed to delete ebtables rule";
                        "chain" => %chain, "rule" => rule.as_str(),
                        "err" => err.as_str());
                    stats.failed += 1;
                }
            }

            self.record(ReportEvent {
                operation: Operation::Delete,
                chain,
                rule: rule.clone(),
                cycles,
                error,
                timestamp: now(),
            });
        }
    }

    fn add_pass(
        &self,
        eb: &Ebtables<'_>,
        pending: &mut BTreeMap<String, u32>,
        live: &RuleMap,
        desired: &RuleMap,
        stats: &mut CycleStats,
    ) {
        pending.retain(|rule, _| {
            desired.contains_key(rule) && !live.contains_key(rule)
        });

        for (rule, &chain) in desired {
            if live.contains_key(rule) {
                continue;
            }

            let Some(cycles) = strike(pending, rule, self.threshold) else {
                info!(self.log, "missing desired rule, waiting";
                    "chain" => %chain,
                    "rule" => rule.as_str(),
                    "seen" => pending.get(rule).copied().unwrap_or(0),
                );
                continue;
            };

            let error = eb.add(chain, rule).err().map(|e| e.to_string());
            match &error {
                None => {
                    info!(self.log, "added ebtables rule";
                        "chain" => %chain, "rule" => rule.as_str(),
                        "cycles" => cycles);
                    stats.added += 1;
                }
                Some(err) => {
                    warn!(self.log, "failed to add ebtables rule";
                        "chain" => %chain, "rule" => rule.as_str(),
                        "err" => err.as_str());
                    stats.failed += 1;
                }
            }

            self.record(ReportEvent {
                operation: Operation::Add,
                chain,
                rule: rule.clone(),
                cycles,
                error,
                timestamp: now(),
            });
        }
    }

    /// Run cycles every `interval` until `shutdown` fires or its
    /// sender is dropped.
    ///
    /// Each rule needs `threshold + 1` cycles to be acted on, so the
    /// worst-case convergence time is roughly `threshold * interval`
    /// plus one interval.
    pub fn run(&self, interval: Duration, shutdown: &Receiver<()>) {
        info!(self.log, "starting network monitor";
            "interval" => ?interval, "threshold" => self.threshold);

        loop {
            self.run_cycle();

            let report = self.take_report();
            for event in report.failures() {
                warn!(self.log, "rule discrepancy not repaired";
                    "operation" => ?event.operation,
                    "rule" => event.rule.as_str(),
                    "err" => event.error.as_deref().unwrap_or(""));
            }

            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(self.log, "network monitor stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strike_counts_to_threshold() {
        let mut pending = BTreeMap::new();
        assert_eq!(strike(&mut pending, "r", 2), None);
        assert_eq!(strike(&mut pending, "r", 2), None);
        assert_eq!(pending["r"], 2);
        assert_eq!(strike(&mut pending, "r", 2), Some(2));
        assert!(pending.is_empty());
    }

    #[test]
    fn zero_threshold_applies_immediately() {
        let mut pending = BTreeMap::new();
        assert_eq!(strike(&mut pending, "r", 0), Some(0));
        assert!(pending.is_empty());
    }
}
