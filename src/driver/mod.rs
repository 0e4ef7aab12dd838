//! Typed surface over the host's simulator command-line tools.
//!
//! Every external command is treated as fallible: the driver captures stdout,
//! stderr, the exit code, and the wall-clock duration, and enforces a deadline
//! after which the child is killed and reaped. Transient failures on
//! idempotent operations are retried with exponential backoff.
//!
//! The driver is stateless apart from the per-UDID mutex map that serializes
//! control operations to a single device; operations against distinct devices
//! proceed in parallel.

pub mod apps;
pub mod devices;
pub mod io;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};

/// Default deadline for quick device actions.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for device creation.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for acquiring the per-device mutex before failing with `busy`.
pub const DEVICE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    pub duration: Duration,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub struct HostDriver {
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    pub fn new() -> Self {
        Self {
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Verify the simulator tooling is present. Called once at startup;
    /// failure maps to exit code 4.
    pub async fn check_tooling(&self) -> Result<()> {
        let out = self
            .run_tool("xcrun", &["simctl", "help"], ACTION_TIMEOUT)
            .await?;
        if !out.success() {
            return Err(Error::HostDriver(format!(
                "xcrun simctl is not usable: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Acquire the per-device mutex, waiting at most [`DEVICE_LOCK_TIMEOUT`].
    ///
    /// Control operations hold this guard for the duration of the driver call
    /// so that messages to one device execute one at a time.
    pub async fn lock_device(&self, udid: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.device_locks.lock();
            Arc::clone(
                locks
                    .entry(udid.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        tokio::time::timeout(DEVICE_LOCK_TIMEOUT, lock.lock_owned())
            .await
            .map_err(|_| Error::Busy(format!("device {} is busy", udid)))
    }

    /// Forget the mutex for a deleted device.
    pub fn release_device_lock(&self, udid: &str) {
        self.device_locks.lock().remove(udid);
    }

    /// Run a host tool with a deadline. On deadline the child is killed and
    /// the call fails with `timeout`.
    pub(crate) async fn run_tool(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<CmdOutput> {
        let started = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{} {} exceeded {:.0?}",
                    program,
                    args.join(" "),
                    deadline
                ))
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::HostDriver(format!("{} not found on this host", program))
                } else {
                    Error::Io(e)
                }
            })?;

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
        })
    }

    /// Run a tool and retry timeouts up to [`MAX_RETRIES`] times with
    /// exponential backoff. Only for idempotent operations.
    pub(crate) async fn run_tool_retry(
        &self,
        program: &str,
        args: &[&str],
        deadline: Duration,
    ) -> Result<CmdOutput> {
        let mut attempt = 0u32;
        loop {
            match self.run_tool(program, args, deadline).await {
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    tracing::debug!(
                        program,
                        attempt,
                        ?delay,
                        "retrying host tool after timeout"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Run `xcrun simctl` with the given subcommand arguments.
    pub(crate) async fn simctl(&self, args: &[&str], deadline: Duration) -> Result<CmdOutput> {
        let mut full = vec!["simctl"];
        full.extend_from_slice(args);
        self.run_tool("xcrun", &full, deadline).await
    }

    /// Like [`Self::simctl`] but retries timeouts (idempotent reads).
    pub(crate) async fn simctl_retry(
        &self,
        args: &[&str],
        deadline: Duration,
    ) -> Result<CmdOutput> {
        let mut full = vec!["simctl"];
        full.extend_from_slice(args);
        self.run_tool_retry("xcrun", &full, deadline).await
    }

    /// Run `idb` with the given arguments.
    pub(crate) async fn idb(&self, args: &[&str], deadline: Duration) -> Result<CmdOutput> {
        self.run_tool("idb", args, deadline).await
    }
}

/// Convert a nonzero-exit command into a `host-driver` error carrying stderr.
pub(crate) fn checked(out: CmdOutput, context: &str) -> Result<CmdOutput> {
    if out.success() {
        Ok(out)
    } else {
        Err(Error::HostDriver(format!(
            "{} failed (exit {}): {}",
            context,
            out.status,
            out.stderr.trim()
        )))
    }
}
