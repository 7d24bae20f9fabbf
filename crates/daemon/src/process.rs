// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Subprocess execution behind a trait, so tests can script the compiler.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// One subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Run as this uid when present.
    pub uid: Option<u32>,
    /// Bytes fed on stdin; `None` leaves stdin closed.
    pub stdin: Option<Vec<u8>>,
    /// After this long the process is asked to exit with SIGTERM.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput>;
}

/// The real thing.
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(uid) = spec.uid {
            std::os::unix::process::CommandExt::uid(&mut command, uid);
        }

        let mut child = command.spawn()?;

        // Feed stdin from a separate thread; writing a large source while
        // the child fills its stdout pipe deadlocks otherwise.
        let writer = match (child.stdin.take(), &spec.stdin) {
            (Some(mut stdin), Some(bytes)) => {
                let bytes = bytes.clone();
                Some(std::thread::spawn(move || {
                    let _ = stdin.write_all(&bytes);
                }))
            }
            _ => None,
        };

        let watchdog = spec.timeout.map(|timeout| {
            let pid = child.id();
            let (cancel, canceled) = std::sync::mpsc::channel::<()>();
            let handle = std::thread::spawn(move || {
                if canceled.recv_timeout(timeout).is_err() {
                    terminate(pid);
                }
            });
            (cancel, handle)
        });

        let output = child.wait_with_output();

        if let Some((cancel, handle)) = watchdog {
            let _ = cancel.send(());
            let _ = handle.join();
        }
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        let output = output?;
        Ok(ProcessOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Ask a process to exit. It may ignore the signal and run to completion.
#[allow(unsafe_code)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
