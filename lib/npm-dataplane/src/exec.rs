// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Running the external kernel tools.
//!
//! ebtables, ipset and iptables-save are the de-facto protocol with
//! the kernel. They report failure only as an exit status plus
//! whatever they wrote to stderr, so that is all [`ExecError`]
//! carries.

use slog::Logger;
use slog::debug;
use std::io::Read;
use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{cmd}`: {source}")]
    Spawn { cmd: String, source: std::io::Error },

    #[error("failed waiting on `{cmd}`: {source}")]
    Wait { cmd: String, source: std::io::Error },

    #[error("`{cmd}` did not finish within {after:?}")]
    Timeout { cmd: String, after: Duration },

    #[error("`{cmd}` failed ({status}): {stderr}")]
    Failed { cmd: String, status: String, stderr: String },

    #[error("`{cmd}` wrote output that is not UTF-8: {source}")]
    Output { cmd: String, source: std::string::FromUtf8Error },
}

/// Something that can run a program to completion and hand back its
/// standard output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError>;
}

/// Runs commands as child processes, killing any that outlive the
/// timeout.
#[derive(Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    log: Logger,
}

impl ProcessRunner {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(timeout: Duration, log: Logger) -> Self {
        Self { timeout, log }
    }
}

fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = vec![];
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn collect(
    cmd: &str,
    handle: JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ExecError> {
    match handle.join() {
        Ok(res) => res
            .map_err(|source| ExecError::Wait { cmd: cmd.to_string(), source }),
        Err(_) => Err(ExecError::Wait {
            cmd: cmd.to_string(),
            source: std::io::Error::other("output reader panicked"),
        }),
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let cmd = format!("{program} {}", args.join(" "));
        debug!(self.log, "exec"; "cmd" => &cmd);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn { cmd: cmd.clone(), source })?;

        // The pipes are drained concurrently: a child blocked on a
        // full pipe would otherwise look hung.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::Timeout { cmd, after: self.timeout });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => return Err(ExecError::Wait { cmd, source }),
            }
        };

        let out = collect(&cmd, stdout)?;
        let err = collect(&cmd, stderr)?;

        if !status.success() {
            return Err(ExecError::Failed {
                cmd,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            });
        }

        String::from_utf8(out)
            .map_err(|source| ExecError::Output { cmd, source })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn runner(timeout: Duration) -> ProcessRunner {
        ProcessRunner::new(timeout, Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn captures_stdout() {
        let out = runner(Duration::from_secs(5))
            .run("sh", &["-c", "echo hello"])
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn reports_failure_with_stderr() {
        let err = runner(Duration::from_secs(5))
            .run("sh", &["-c", "echo nope >&2; exit 3"])
            .unwrap_err();
        match err {
            ExecError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn kills_hung_command() {
        let err = runner(Duration::from_millis(50))
            .run("sleep", &["5"])
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[test]
    fn rejects_non_utf8_output() {
        let script = "printf 'Bridge table: nat\\n-p ARP \\377 x\\n'";
        let err = runner(Duration::from_secs(5))
            .run("sh", &["-c", script])
            .unwrap_err();
        assert!(matches!(err, ExecError::Output { .. }));
    }

    #[test]
    fn missing_program() {
        let err = runner(Duration::from_secs(1))
            .run("/nonexistent/ebtables", &[])
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
