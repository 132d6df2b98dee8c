// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use slog::Logger;
use slog::info;

use npm_api::NpmCache;
use npm_dataplane::cache;
use npm_dataplane::cache::DEFAULT_CACHE_URL;
use npm_dataplane::convert::Converter;
use npm_dataplane::convert::to_json;
use npm_dataplane::ebtables::Ebtables;
use npm_dataplane::ebtables::desired_rule_map;
use npm_dataplane::exec::CommandRunner;
use npm_dataplane::exec::ProcessRunner;
use npm_dataplane::iptables::DEFAULT_TABLE;
use npm_dataplane::iptables::Table;
use npm_dataplane::iptables::iptables_save;
use npm_dataplane::iptables::parse_table;
use npm_dataplane::print::print_l2_rules_into;
use npm_dataplane::print::print_rules;
use npm_dataplane::print::print_table;
use npm_dataplane::reconcile::NetworkMonitor;
use npm_dataplane::topology::JsonFileTopology;
use npm_dataplane::topology::TopologySource;
use npmadm::ShutdownSignals;
use npmadm::config::DEFAULT_TOPOLOGY_PATH;
use npmadm::config::MonitorConfig;
use npmadm::config::MonitorOverrides;

/// Inspect and maintain the NPM dataplane
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Parse an iptables-save dump and print it.
    ParseIptables {
        #[command(flatten)]
        dump: DumpSource,

        /// Print JSON rather than a table.
        #[arg(long)]
        json: bool,
    },

    /// Convert the NPM rules of an iptables-save dump into rule
    /// records.
    ConvertIptables {
        #[command(flatten)]
        dump: DumpSource,

        #[command(flatten)]
        cache: CacheSource,

        /// Don't ask ipset for the contents of CIDR sets.
        #[arg(long)]
        no_ipset: bool,

        /// Print a table rather than JSON.
        #[arg(long)]
        table: bool,
    },

    /// Show the ebtables rules the host topology calls for.
    L2Rules {
        /// The network manager state file holding the topology.
        #[arg(long, default_value = DEFAULT_TOPOLOGY_PATH)]
        topology: PathBuf,

        /// Compare with the rules currently installed.
        #[arg(long)]
        live: bool,
    },

    /// Keep the ebtables rules in line with the topology until
    /// interrupted.
    Monitor {
        /// A TOML config file. Flags override its values.
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: MonitorOverrides,
    },
}

#[derive(Args, Debug)]
struct DumpSource {
    /// Read the dump from a file instead of running iptables-save.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// The table to parse.
    #[arg(
        short = 't',
        long = "iptables-table",
        default_value = DEFAULT_TABLE
    )]
    iptables_table: String,
}

#[derive(Args, Debug)]
struct CacheSource {
    /// Read the NPM cache from a file.
    #[arg(short, long)]
    cache_file: Option<PathBuf>,

    /// Fetch the NPM cache from a running NPM [default:
    /// http://localhost:10091/npm/v1/debug/manager]
    #[arg(long, conflicts_with = "cache_file")]
    cache_url: Option<String>,
}

impl CacheSource {
    fn load(&self) -> anyhow::Result<NpmCache> {
        match &self.cache_file {
            Some(path) => cache::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => {
                let url =
                    self.cache_url.as_deref().unwrap_or(DEFAULT_CACHE_URL);
                cache::from_url(url)
                    .with_context(|| format!("fetching NPM cache from {url}"))
            }
        }
    }
}

fn runner(log: &Logger) -> Arc<dyn CommandRunner> {
    Arc::new(ProcessRunner::new(ProcessRunner::DEFAULT_TIMEOUT, log.clone()))
}

fn load_table(src: &DumpSource, log: &Logger) -> anyhow::Result<Table> {
    match &src.input {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse_table(&text, &src.iptables_table)
                .with_context(|| format!("parsing {}", path.display()))
        }

        None => iptables_save(&*runner(log), &src.iptables_table)
            .context("dumping iptables"),
    }
}

fn monitor(
    config: Option<&Path>,
    overrides: &MonitorOverrides,
    signals: ShutdownSignals,
    log: &Logger,
) -> anyhow::Result<()> {
    let mut cfg = match config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    cfg.apply(overrides);
    cfg.validate()?;

    info!(log, "monitor configuration";
        "interval" => ?cfg.interval(),
        "threshold" => cfg.threshold,
        "command_timeout" => ?cfg.command_timeout(),
        "worst_case_latency" => ?cfg.worst_case_latency(),
        "topology" => %cfg.topology_path.display(),
    );

    let runner =
        Arc::new(ProcessRunner::new(cfg.command_timeout(), log.clone()));
    let topology = Arc::new(JsonFileTopology::new(&cfg.topology_path));
    let mon = NetworkMonitor::new(cfg.threshold, runner, topology, log.clone());

    let shutdown = signals.into_channel(log);
    mon.run(cfg.interval(), &shutdown);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    // Must happen before the logger starts its drain thread.
    let signals = match cmd {
        Command::Monitor { .. } => {
            Some(ShutdownSignals::block().context("blocking signals")?)
        }
        _ => None,
    };
    let log = npmadm::logger();

    match cmd {
        Command::ParseIptables { dump, json } => {
            let table = load_table(&dump, &log)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                print_table(&table)?;
            }
        }

        Command::ConvertIptables { dump, cache, no_ipset, table } => {
            let npm_cache = cache.load()?;
            let parsed = load_table(&dump, &log)?;
            let ipset = if no_ipset { None } else { Some(runner(&log)) };
            let rules = Converter::new(&npm_cache, ipset, log.clone())
                .convert(&parsed)
                .context("converting rules")?;

            if table {
                print_rules(&rules)?;
            } else {
                println!("{}", to_json(&rules)?);
            }
        }

        Command::L2Rules { topology, live } => {
            let topo = JsonFileTopology::new(&topology)
                .topology()
                .with_context(|| format!("loading {}", topology.display()))?;
            let desired = desired_rule_map(&topo);

            let live = if live {
                let runner = runner(&log);
                let eb = Ebtables::new(&*runner);
                Some(eb.live_rules().context("listing ebtables rules")?)
            } else {
                None
            };

            print_l2_rules_into(&mut io::stdout(), &desired, live.as_ref())?;
        }

        Command::Monitor { config, overrides } => {
            let signals = signals.context("shutdown signals not blocked")?;
            monitor(config.as_deref(), &overrides, signals, &log)?;
        }
    }

    Ok(())
}
