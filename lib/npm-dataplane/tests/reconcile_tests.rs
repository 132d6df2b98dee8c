// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Drive the L2 reconciliation loop against a fake kernel.
//!
//! The fixture topology calls for four rules. The fixture kernel
//! already holds two of them, lacks the other two, and holds one
//! rule for an endpoint that no longer exists.

mod common;

use common::*;
use npm_dataplane::ebtables::L2Rule;
use npm_dataplane::reconcile::CycleOutcome;
use npm_dataplane::reconcile::CycleStats;
use npm_dataplane::reconcile::NetworkMonitor;
use npm_dataplane::reconcile::Operation;
use npm_dataplane::reconcile::SkipReason;
use npm_dataplane::topology::JsonFileTopology;
use npm_dataplane::topology::TopologySource;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const ENDPOINT_MAC: MacAddr =
    MacAddr::from_const([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);
const HOST_MAC: MacAddr =
    MacAddr::from_const([0x00, 0x0d, 0x3a, 0x12, 0x34, 0x56]);

fn snat() -> String {
    L2Rule::UnicastSnat { ifname: "eth0".into(), mac: HOST_MAC }.to_string()
}

fn endpoint_dnat() -> String {
    L2Rule::IpDnat {
        ifname: "eth0".into(),
        ip: Ipv4Addr::new(10, 240, 0, 12),
        mac: ENDPOINT_MAC,
    }
    .to_string()
}

fn orphan_dnat() -> String {
    L2Rule::IpDnat {
        ifname: "eth0".into(),
        ip: Ipv4Addr::new(10, 240, 0, 99),
        mac: MacAddr::from_const([0x12, 0x34, 0x56, 0x78, 0x9a, 0xff]),
    }
    .to_string()
}

fn monitor(
    threshold: u32,
    kernel: &Arc<FakeKernel>,
    topology: Arc<dyn TopologySource>,
) -> NetworkMonitor {
    NetworkMonitor::new(threshold, kernel.clone(), topology, discard_log())
}

fn completed(outcome: CycleOutcome) -> CycleStats {
    match outcome {
        CycleOutcome::Completed(stats) => stats,
        CycleOutcome::Skipped(reason) => panic!("cycle skipped: {reason:?}"),
    }
}

#[test]
fn fixture_rule_text_matches_topology() {
    // The fixture listing was written by hand; make sure it really is
    // in the canonical form the monitor produces.
    let kernel = FakeKernel::from_fixture();
    let live: BTreeSet<_> =
        kernel.rules(Chain::PreRouting).into_iter().collect();
    assert!(live.contains(&orphan_dnat()));
    assert!(live.contains(
        &L2Rule::ArpReplyDnat { ifname: "eth0".into() }.to_string()
    ));
    assert!(!live.contains(&endpoint_dnat()));
}

#[test]
fn converges_after_threshold_plus_one_cycles() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let mon = monitor(2, &kernel, Arc::new(fixture_topology()));

    // Two cycles of strikes.
    for seen in 1..=2 {
        let stats = completed(mon.run_cycle());
        assert_eq!(stats.live, 3);
        assert_eq!(stats.desired, 4);
        assert_eq!(stats.added + stats.deleted, 0);
        assert_eq!(mon.pending_adds().get(&snat()), Some(&seen));
        assert_eq!(mon.pending_adds().get(&endpoint_dnat()), Some(&seen));
        assert_eq!(mon.pending_deletes().get(&orphan_dnat()), Some(&seen));
    }
    assert!(kernel.ebtables_calls("-A").is_empty());
    assert!(kernel.ebtables_calls("-D").is_empty());

    // The third cycle applies everything.
    let stats = completed(mon.run_cycle());
    assert_eq!(stats.added, 2);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending_add, 0);
    assert_eq!(stats.pending_delete, 0);

    assert_eq!(kernel.rules(Chain::PostRouting), vec![snat()]);
    let pre = kernel.rules(Chain::PreRouting);
    assert!(pre.contains(&endpoint_dnat()));
    assert!(!pre.contains(&orphan_dnat()));

    let report = mon.take_report();
    assert_eq!(report.events.len(), 3);
    assert!(report.failures().next().is_none());
    // Deletes are applied before adds.
    assert_eq!(report.events[0].operation, Operation::Delete);
    assert_eq!(report.events[0].rule, orphan_dnat());
    assert!(report.events.iter().all(|e| e.cycles == 2));

    // Nothing is left to do.
    let stats = completed(mon.run_cycle());
    assert_eq!((stats.live, stats.desired), (4, 4));
    assert_eq!(stats.added + stats.deleted, 0);
    assert!(mon.take_report().is_empty());
}

#[test]
fn flapping_rule_is_never_applied() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    // Leave only the unicast SNAT rule missing.
    kernel.install(Chain::PreRouting, &endpoint_dnat());
    kernel.remove(Chain::PreRouting, &orphan_dnat());
    let mon = monitor(2, &kernel, Arc::new(fixture_topology()));

    for i in 0..8 {
        // Someone else keeps adding and removing the rule.
        if i % 2 == 0 {
            kernel.remove(Chain::PostRouting, &snat());
        } else {
            kernel.install(Chain::PostRouting, &snat());
        }

        completed(mon.run_cycle());
        let expected = if i % 2 == 0 { Some(&1) } else { None };
        assert_eq!(mon.pending_adds().get(&snat()), expected);
    }

    assert!(kernel.ebtables_calls("-A").is_empty());
    assert!(mon.take_report().is_empty());
}

#[test]
fn failed_apply_is_reported_and_forgotten() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    kernel.fail_on(&snat());
    let mon = monitor(0, &kernel, Arc::new(fixture_topology()));

    let stats = completed(mon.run_cycle());
    assert_eq!(stats.added, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.failed, 1);
    assert!(mon.pending_adds().is_empty());

    let report = mon.take_report();
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].operation, Operation::Add);
    assert_eq!(failures[0].chain, Chain::PostRouting);
    assert_eq!(failures[0].rule, snat());
    assert!(
        failures[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Unable to update the kernel")
    );

    // The failure is not retried in the same cycle, but the next one
    // sees the rule missing again.
    let stats = completed(mon.run_cycle());
    assert_eq!(stats.failed, 1);
    assert_eq!(kernel.ebtables_calls("-A").len(), 3);
}

#[test]
fn listing_failure_skips_cycle() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let mon = monitor(3, &kernel, Arc::new(fixture_topology()));

    completed(mon.run_cycle());
    let adds = mon.pending_adds();
    let deletes = mon.pending_deletes();
    assert_eq!(adds.len(), 2);
    assert_eq!(deletes.len(), 1);

    kernel.set_fail_listing(true);
    assert_eq!(mon.run_cycle(), CycleOutcome::Skipped(SkipReason::Listing));
    assert_eq!(mon.pending_adds(), adds);
    assert_eq!(mon.pending_deletes(), deletes);

    kernel.set_fail_listing(false);
    completed(mon.run_cycle());
    assert!(mon.pending_adds().values().all(|&seen| seen == 2));
}

#[test]
fn empty_topology_skips_cycle() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let mon = monitor(0, &kernel, Arc::new(Topology::default()));

    assert_eq!(
        mon.run_cycle(),
        CycleOutcome::Skipped(SkipReason::NoInterfaces)
    );
    // The orphaned rule is left alone.
    assert!(kernel.calls().is_empty());
    assert_eq!(kernel.rules(Chain::PreRouting).len(), 3);
}

#[test]
fn unreadable_topology_skips_cycle() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let topo = JsonFileTopology::new("/nonexistent/npm-topology.json");
    let mon = monitor(0, &kernel, Arc::new(topo));

    assert_eq!(mon.run_cycle(), CycleOutcome::Skipped(SkipReason::Topology));
    assert!(kernel.calls().is_empty());
}

#[test]
fn empty_kernel_from_topology_file() {
    let kernel = Arc::new(FakeKernel::new());
    let topo = JsonFileTopology::new(resource("topology.json"));
    let mon = monitor(0, &kernel, Arc::new(topo));

    let stats = completed(mon.run_cycle());
    assert_eq!(stats.added, 4);
    assert_eq!(stats.live, 0);
}

#[test]
fn run_stops_on_shutdown() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let mon = monitor(0, &kernel, Arc::new(fixture_topology()));

    // A pending shutdown lets exactly one cycle run.
    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();
    mon.run(Duration::from_secs(60), &rx);
    assert_eq!(kernel.ebtables_calls("-A").len(), 2);
    assert_eq!(kernel.ebtables_calls("-D").len(), 1);

    // As does a dropped sender.
    let (tx, rx) = mpsc::channel::<()>();
    drop(tx);
    mon.run(Duration::from_secs(60), &rx);
    assert_eq!(kernel.ebtables_calls("-A").len(), 2);
    // The report is drained by the loop itself.
    assert!(mon.take_report().is_empty());
}

/// Holds the first command it is asked to run until released.
struct StalledKernel {
    kernel: Arc<FakeKernel>,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl CommandRunner for StalledKernel {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        self.kernel.run(program, args)
    }
}

#[test]
fn overlapping_cycle_is_skipped() {
    let kernel = Arc::new(FakeKernel::from_fixture());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let stalled = Arc::new(StalledKernel {
        kernel: kernel.clone(),
        gate: Mutex::new(Some((entered_tx, release_rx))),
    });
    let mon = Arc::new(NetworkMonitor::new(
        2,
        stalled,
        Arc::new(fixture_topology()),
        discard_log(),
    ));

    let first = {
        let mon = mon.clone();
        thread::spawn(move || mon.run_cycle())
    };
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert_eq!(mon.run_cycle(), CycleOutcome::Skipped(SkipReason::InFlight));

    release_tx.send(()).unwrap();
    completed(first.join().unwrap());

    // Only the first cycle counted against the pending rules.
    assert_eq!(mon.pending_adds().get(&snat()), Some(&1));
    assert_eq!(mon.pending_adds().get(&endpoint_dnat()), Some(&1));
    assert_eq!(mon.pending_deletes().get(&orphan_dnat()), Some(&1));
    assert!(kernel.ebtables_calls("-A").is_empty());
}

#[test]
fn ipv6_endpoint_address_is_ignored() {
    let raw = read_resource("topology.json").replace(
        r#"["10.240.0.12/16"]"#,
        r#"["fd00:240::12/64", "10.240.0.12/16"]"#,
    );
    let topo = Topology::from_json(&raw).unwrap();
    let kernel = Arc::new(FakeKernel::from_fixture());
    let mon = monitor(0, &kernel, Arc::new(topo));

    let stats = completed(mon.run_cycle());
    assert_eq!(stats.desired, 4);
    assert_eq!(stats.added, 2);
    assert!(kernel.rules(Chain::PreRouting).contains(&endpoint_dnat()));
}
