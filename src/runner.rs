//! Child-process execution for recorded steps and inspections.
//!
//! Commands run without a shell: the argument vector is passed as separate
//! OS strings via `std::process::Command`, so shell injection is
//! structurally impossible. The runner owns child-process lifetime: on
//! timeout it kills and reaps the child, and capture streams are drained
//! on all exit paths.
//!
//! Timeouts are reported in the outcome rather than as errors -- whether a
//! timed-out step is fatal is the caller's policy (recording keeps the
//! link, inspections fail verification).

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Poll interval while waiting on a child with a timeout.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// What a finished (or killed) command looked like from the outside.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code; `None` when the process was killed by a signal
    /// (including our own timeout kill).
    pub return_value: Option<i64>,
    /// Captured standard output; empty when capture was disabled.
    pub stdout: String,
    /// Captured standard error; empty when capture was disabled.
    pub stderr: String,
    /// Whether the configured timeout elapsed before exit.
    pub timed_out: bool,
}

/// Executes argument vectors on behalf of the recording engine and the
/// verifier's inspections.
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` in `cwd`, optionally bounded by `timeout`, optionally
    /// capturing stdout/stderr.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if the process cannot be started
    /// (missing binary, empty argv). A non-zero exit or a timeout is a
    /// successful *run* and reported through [`CommandOutcome`].
    fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        capture: bool,
    ) -> Result<CommandOutcome>;
}

/// Default [`CommandRunner`] backed by `std::process`.
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        capture: bool,
    ) -> Result<CommandOutcome> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Runtime {
                context: "command runner".into(),
                reason: "empty argument vector".into(),
            });
        };

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        if capture {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = command.spawn().map_err(|e| Error::Runtime {
            context: format!("starting '{program}'"),
            reason: e.to_string(),
        })?;

        // Drain pipes on dedicated threads so a chatty child cannot
        // deadlock against a full pipe while we wait on it.
        let stdout_handle = child.stdout.take().map(spawn_reader);
        let stderr_handle = child.stderr.take().map(spawn_reader);

        let (status, timed_out) = match timeout {
            None => (
                child.wait().map_err(|e| Error::Runtime {
                    context: format!("waiting for '{program}'"),
                    reason: e.to_string(),
                })?,
                false,
            ),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break (status, false),
                        Ok(None) if Instant::now() >= deadline => {
                            warn!(command = %program, timeout_secs = limit.as_secs(),
                                  "command exceeded timeout, terminating");
                            // Kill, then reap: the child must not outlive
                            // the recording.
                            let _ = child.kill();
                            let status = child.wait().map_err(|e| Error::Runtime {
                                context: format!("reaping '{program}'"),
                                reason: e.to_string(),
                            })?;
                            break (status, true);
                        }
                        Ok(None) => std::thread::sleep(WAIT_POLL),
                        Err(e) => {
                            return Err(Error::Runtime {
                                context: format!("waiting for '{program}'"),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        };

        let stdout = stdout_handle.map(join_reader).unwrap_or_default();
        let stderr = stderr_handle.map(join_reader).unwrap_or_default();

        let return_value = status.code().map(i64::from);
        debug!(command = %program, ?return_value, timed_out, "command finished");

        Ok(CommandOutcome {
            return_value,
            stdout,
            stderr,
            timed_out,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
