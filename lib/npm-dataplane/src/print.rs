// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print dataplane state in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both npmadm and integration tests.

use crate::ebtables::RuleMap;
use crate::iptables::Table;
use crate::ipset::IpSet;
use crate::reconcile::ReconcileReport;
use itertools::Itertools;
use npm_api::RuleResponse;
use npm_api::SetInfo;
use npm_api::SetKind;
use std::io::Write;
use tabwriter::TabWriter;

/// Output a horizontal rule in bold to the given writer.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

/// Print a parsed iptables [`Table`].
pub fn print_table(table: &Table) -> std::io::Result<()> {
    print_table_into(&mut std::io::stdout(), table)
}

/// Print a parsed iptables [`Table`] into a given writer.
pub fn print_table_into(
    writer: &mut impl Write,
    table: &Table,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Table {}", table.name)?;
    write_hrb(&mut t)?;

    for chain in &table.chains {
        writeln!(t, "\nChain {} (policy {})", chain.name, chain.policy)?;
        write_hr(&mut t)?;
        writeln!(t, "#\tPROTO\tMODULES\tTARGET")?;
        for (i, rule) in chain.rules.iter().enumerate() {
            let proto = rule.protocol.as_deref().unwrap_or("*");
            let modules = rule.modules.iter().map(|m| &m.verb).join(",");
            let target = match &rule.target {
                Some(t) if t.goto => format!("goto {}", t.name),
                Some(t) => t.name.clone(),
                None => "-".to_string(),
            };
            writeln!(t, "{i}\t{proto}\t{modules}\t{target}")?;
        }
        t.flush()?;
    }

    writeln!(t)?;
    t.flush()
}

fn set_list(sets: &[SetInfo]) -> String {
    if sets.is_empty() {
        return "-".to_string();
    }

    sets.iter()
        .map(|s| {
            let neg = if s.included { "" } else { "!" };
            format!("{neg}{}", s.name)
        })
        .join(",")
}

fn port(p: Option<u32>) -> String {
    p.map(|p| p.to_string()).unwrap_or_else(|| "*".to_string())
}

/// Print converted rule records.
pub fn print_rules(rules: &[RuleResponse]) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), rules)
}

/// Print converted rule records into a given writer.
pub fn print_rules_into(
    writer: &mut impl Write,
    rules: &[RuleResponse],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "NPM Rules")?;
    write_hrb(&mut t)?;
    writeln!(t, "CHAIN\tDIR\tALLOW\tPROTO\tSRC\tDST\tSPORT\tDPORT")?;
    for r in rules {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.chain,
            r.direction,
            r.allowed,
            if r.protocol.is_empty() { "*" } else { r.protocol.as_str() },
            set_list(&r.src_list),
            set_list(&r.dst_list),
            port(r.src_port),
            port(r.dst_port),
        )?;
    }
    t.flush()
}

/// Print the sets held by an [`IpSetManager`](crate::ipset::IpSetManager).
pub fn print_ipsets_into(
    writer: &mut impl Write,
    sets: &[IpSet],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "IP Sets")?;
    write_hrb(&mut t)?;
    writeln!(t, "NAME\tHASHED NAME\tTYPE\tREFS\tMEMBERS")?;
    for set in sets {
        let members = match set.kind() {
            SetKind::Hash => set.ips().keys().join(","),
            SetKind::List => set.members().iter().join(","),
        };
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            set.name(),
            set.hashed_name(),
            set.set_type(),
            set.reference_count(),
            members,
        )?;
    }
    t.flush()
}

/// Print the L2 rules the topology calls for, marking those that are
/// missing from `live`.
pub fn print_l2_rules_into(
    writer: &mut impl Write,
    desired: &RuleMap,
    live: Option<&RuleMap>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "L2 Rules")?;
    write_hrb(&mut t)?;
    writeln!(t, "CHAIN\tSTATE\tRULE")?;
    for (rule, chain) in desired {
        let state = match live {
            Some(live) if live.contains_key(rule) => "present",
            Some(_) => "missing",
            None => "-",
        };
        writeln!(t, "{chain}\t{state}\t{rule}")?;
    }

    if let Some(live) = live {
        for (rule, chain) in live {
            if !desired.contains_key(rule) {
                writeln!(t, "{chain}\tunexpected\t{rule}")?;
            }
        }
    }
    t.flush()
}

/// Print a [`ReconcileReport`] into a given writer.
pub fn print_report_into(
    writer: &mut impl Write,
    report: &ReconcileReport,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "OPERATION\tCHAIN\tCYCLES\tRESULT\tRULE")?;
    for e in &report.events {
        writeln!(
            t,
            "{:?}\t{}\t{}\t{}\t{}",
            e.operation,
            e.chain,
            e.cycles,
            e.error.as_deref().unwrap_or("ok"),
            e.rule,
        )?;
    }
    t.flush()
}
