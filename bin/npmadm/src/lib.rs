// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! NPM dataplane administration library

use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use slog::Drain;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::thread;

pub mod config;

/// Build the root logger: terminal output on stderr, filtered by
/// `RUST_LOG` (default `info`).
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();

    let mut builder = slog_envlogger::LogBuilder::new(drain)
        .filter(None, slog::FilterLevel::Info);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder = builder.parse(&spec);
    }

    let drain = slog_async::Async::new(builder.build()).build().fuse();
    Logger::root(drain, slog::o!("name" => "npmadm"))
}

/// SIGINT and SIGTERM, blocked so that they can be waited for
/// synchronously.
///
/// The signal mask is inherited by threads spawned afterwards, so this
/// must be set up before any other thread is started.
pub struct ShutdownSignals(SigSet);

impl ShutdownSignals {
    pub fn block() -> nix::Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        set.thread_block()?;
        Ok(Self(set))
    }

    /// Wait for a signal on a background thread. The returned receiver
    /// sees a message, or a disconnect, once one arrives.
    pub fn into_channel(self, log: &Logger) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let log = log.clone();
        let set = self.0;

        thread::spawn(move || match set.wait() {
            Ok(sig) => {
                info!(log, "shutting down"; "signal" => ?sig);
                let _ = tx.send(());
            }
            Err(e) => {
                warn!(log, "failed waiting for signals"; "err" => %e);
            }
        });

        rx
    }
}
