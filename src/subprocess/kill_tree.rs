//! Process-tree termination.
//!
//! Detached children are started as process-group leaders, so signalling
//! the group reaches every helper they spawned. Non-detached children only
//! receive the signal directly. A polite signal is sent first; survivors
//! of the grace window get `SIGKILL`.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Interval between liveness probes while waiting out the grace window.
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Signal used for the first, polite termination attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum KillSignal {
    /// `SIGTERM`.
    #[default]
    #[serde(rename = "SIGTERM")]
    Term,
    /// `SIGINT`.
    #[serde(rename = "SIGINT")]
    Int,
    /// `SIGHUP`.
    #[serde(rename = "SIGHUP")]
    Hup,
    /// `SIGQUIT`.
    #[serde(rename = "SIGQUIT")]
    Quit,
    /// `SIGKILL`.
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl KillSignal {
    /// Parse `SIGTERM`, `TERM`, or `term` style names.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown signal names.
    pub fn parse(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" => Ok(Self::Term),
            "INT" => Ok(Self::Int),
            "HUP" => Ok(Self::Hup),
            "QUIT" => Ok(Self::Quit),
            "KILL" => Ok(Self::Kill),
            _ => Err(AppError::Config(format!("unsupported kill signal: {raw}"))),
        }
    }

    /// Canonical `SIG*` name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Hup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Term => Signal::SIGTERM,
            Self::Int => Signal::SIGINT,
            Self::Hup => Signal::SIGHUP,
            Self::Quit => Signal::SIGQUIT,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl Display for KillSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one termination is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOptions {
    /// Signal the whole process group when the child leads one.
    pub kill_tree: bool,
    /// Whether the child was started as a process-group leader.
    pub detached: bool,
    /// First signal.
    pub signal: KillSignal,
    /// Window before escalating to `SIGKILL`.
    pub grace_ms: u64,
}

impl KillOptions {
    /// Same target, zero grace.
    #[must_use]
    pub fn forced(self) -> Self {
        Self { grace_ms: 0, ..self }
    }
}

/// What a termination attempt achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    /// The target is no longer running.
    pub terminated: bool,
    /// `SIGKILL` escalation was needed.
    pub forced: bool,
}

/// Terminate `pid` (and its group when applicable), waiting out the grace
/// window before escalating.
///
/// A target that has already exited counts as terminated.
///
/// # Errors
///
/// Returns `AppError::Kill` when a signal cannot be delivered for a reason
/// other than the target being gone.
pub async fn kill_process_tree(pid: u32, options: KillOptions) -> Result<KillOutcome> {
    #[cfg(unix)]
    {
        let group = use_group(options);
        if !unix::deliver(pid, group, options.signal.to_nix())? {
            return Ok(KillOutcome {
                terminated: true,
                forced: false,
            });
        }
        if options.signal == KillSignal::Kill {
            return Ok(KillOutcome {
                terminated: true,
                forced: true,
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(options.grace_ms);
        while tokio::time::Instant::now() < deadline {
            if !unix::is_alive(pid, group) {
                return Ok(KillOutcome {
                    terminated: true,
                    forced: false,
                });
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(LIVENESS_POLL.min(remaining)).await;
        }

        if !unix::is_alive(pid, group) {
            return Ok(KillOutcome {
                terminated: true,
                forced: false,
            });
        }
        debug!(pid, group, "grace window elapsed, escalating to SIGKILL");
        unix::deliver(pid, group, nix::sys::signal::Signal::SIGKILL)?;
        Ok(KillOutcome {
            terminated: true,
            forced: true,
        })
    }

    #[cfg(windows)]
    {
        windows::taskkill(pid, options).await
    }
}

/// Synchronous termination: one signal, then `SIGKILL` for any survivor.
///
/// Used from panic hooks and drop guards where no runtime can be awaited.
///
/// # Errors
///
/// Returns `AppError::Kill` when a signal cannot be delivered.
pub fn kill_process_tree_blocking(pid: u32, options: KillOptions) -> Result<KillOutcome> {
    #[cfg(unix)]
    {
        let group = use_group(options);
        if !unix::deliver(pid, group, options.signal.to_nix())? {
            return Ok(KillOutcome {
                terminated: true,
                forced: false,
            });
        }
        if options.signal != KillSignal::Kill && unix::is_alive(pid, group) {
            unix::deliver(pid, group, nix::sys::signal::Signal::SIGKILL)?;
            return Ok(KillOutcome {
                terminated: true,
                forced: true,
            });
        }
        Ok(KillOutcome {
            terminated: true,
            forced: options.signal == KillSignal::Kill,
        })
    }

    #[cfg(windows)]
    {
        windows::taskkill_blocking(pid)
    }
}

/// Start a termination without waiting for it; failures are logged.
///
/// Must be called from within a tokio runtime.
pub fn spawn_kill_process_tree(pid: u32, options: KillOptions) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = kill_process_tree(pid, options).await {
            warn!(pid, %err, "background tree-kill failed");
        }
    })
}

#[cfg(unix)]
fn use_group(options: KillOptions) -> bool {
    options.kill_tree && options.detached
}

#[cfg(unix)]
mod unix {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    use crate::{AppError, Result};

    fn target(pid: u32) -> Result<Pid> {
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
            _ => Err(AppError::Kill(format!("refusing to signal pid {pid}"))),
        }
    }

    fn send(pid: Pid, group: bool, signal: Option<Signal>) -> std::result::Result<(), Errno> {
        if group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        }
    }

    /// Deliver `signal`; `Ok(false)` when the target no longer exists.
    pub(super) fn deliver(pid: u32, group: bool, signal: Signal) -> Result<bool> {
        let target = target(pid)?;
        let outcome = match send(target, group, Some(signal)) {
            // The group may be gone while the leader is still a zombie or was
            // never made a leader; fall back to the direct pid.
            Err(Errno::ESRCH) if group => send(target, false, Some(signal)),
            other => other,
        };
        match outcome {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(AppError::Kill(format!(
                "failed to send {signal} to pid {pid}: {errno}"
            ))),
        }
    }

    pub(super) fn is_alive(pid: u32, group: bool) -> bool {
        let Ok(target) = target(pid) else {
            return false;
        };
        matches!(send(target, group, None), Ok(()) | Err(Errno::EPERM))
    }
}

#[cfg(windows)]
mod windows {
    use std::process::Stdio;

    use super::{KillOptions, KillOutcome};
    use crate::{AppError, Result};

    pub(super) async fn taskkill(pid: u32, options: KillOptions) -> Result<KillOutcome> {
        let pid_arg = pid.to_string();
        let polite = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid_arg, "/T"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if polite.success() {
            return Ok(KillOutcome {
                terminated: true,
                forced: false,
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(options.grace_ms)).await;
        let forced = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid_arg, "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if forced.success() {
            Ok(KillOutcome {
                terminated: true,
                forced: true,
            })
        } else {
            Err(AppError::Kill(format!("taskkill /F failed for pid {pid}")))
        }
    }

    pub(super) fn taskkill_blocking(pid: u32) -> Result<KillOutcome> {
        let pid_arg = pid.to_string();
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid_arg, "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(KillOutcome {
                terminated: true,
                forced: true,
            })
        } else {
            Err(AppError::Kill(format!("taskkill /F failed for pid {pid}")))
        }
    }
}
