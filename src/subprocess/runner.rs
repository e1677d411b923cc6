//! Spawning tracked children.
//!
//! [`SubprocessRegistry::spawn`] races the child's exit against an optional
//! timeout and cancellation token. Whichever settles first decides the
//! outcome; a timeout or cancellation hands the child to a background task
//! that tree-kills it, reaps it, and drops its registry entry. Dropping the
//! future before it settles removes the entry and kills the tree at once.

use std::io::{Read, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::kill_tree::{kill_process_tree, kill_process_tree_blocking, KillOptions};
use super::options::{trim_output, OutputCallback, OutputCollector, SpawnOptions, StdioMode};
use super::registry::{Registration, SubprocessRegistry, Unregister};
use super::scope::{resolve_cancel, resolve_ownership_id};
use super::SubprocessResult;
use crate::{AppError, Result};

const READ_CHUNK_BYTES: usize = 8 * 1024;

const PENDING: u8 = 0;
const RESOLVED: u8 = 1;
const REJECTED: u8 = 2;

/// Tri-state settle guard: the first transition out of pending wins.
#[derive(Debug, Default)]
pub struct SettleOnce(AtomicU8);

/// Final state of a [`SettleOnce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Not settled yet.
    Pending,
    /// Settled successfully.
    Resolved,
    /// Settled with a failure.
    Rejected,
}

impl SettleOnce {
    /// New pending guard.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(PENDING))
    }

    /// Move to resolved; `false` if already settled.
    pub fn resolve(&self) -> bool {
        self.transition(RESOLVED)
    }

    /// Move to rejected; `false` if already settled.
    pub fn reject(&self) -> bool {
        self.transition(REJECTED)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> Settled {
        match self.0.load(Ordering::Acquire) {
            RESOLVED => Settled::Resolved,
            REJECTED => Settled::Rejected,
            _ => Settled::Pending,
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Race {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(u64),
    Cancelled,
}

type SharedCollector = Arc<Mutex<OutputCollector>>;

/// Owns a live child's registration until the spawn settles.
///
/// If the spawn future is dropped first, the entry is removed and the
/// child's tree is killed without a grace window; `kill_on_drop` alone only
/// reaches the direct child.
struct SpawnGuard {
    pid: u32,
    kill: KillOptions,
    unregister: Option<Unregister>,
    armed: bool,
}

impl SpawnGuard {
    /// Hand the registration back to a settled path.
    fn disarm(&mut self) -> Option<Unregister> {
        self.armed = false;
        self.unregister.take()
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(unregister) = self.unregister.take() {
            unregister.unregister();
        }
        debug!(pid = self.pid, "spawn dropped before settling, killing tree");
        if let Err(err) = kill_process_tree_blocking(self.pid, self.kill) {
            warn!(pid = self.pid, %err, "tree-kill of dropped spawn failed");
        }
    }
}

impl SubprocessRegistry {
    /// Spawn `command` with `args`, tracked in this registry unless the
    /// options opt out.
    ///
    /// # Errors
    ///
    /// - `AppError::ShellDisabled` when `options.shell` is set.
    /// - `AppError::Aborted` when the token is already cancelled or fires.
    /// - `AppError::Spawn` when the process cannot start or exits with an
    ///   unexpected code.
    /// - `AppError::Timeout` when `timeout_ms` elapses first.
    pub async fn spawn<I, S>(
        &self,
        command: &str,
        args: I,
        mut options: SpawnOptions,
    ) -> Result<SubprocessResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let started = Instant::now();
        if options.shell {
            return Err(AppError::ShellDisabled);
        }
        options.cancel = resolve_cancel(options.cancel.as_ref());
        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(AppError::Aborted {
                result: Box::new(SubprocessResult::not_started(elapsed_ms(started))),
            });
        }

        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let label = options.name.clone().unwrap_or_else(|| command.to_owned());
        #[cfg(unix)]
        let detached = options.resolved_detached();
        let mut cmd = Command::new(command);
        cmd.args(&args).kill_on_drop(true);
        configure_command(&mut cmd, &options);
        #[cfg(unix)]
        {
            if detached {
                cmd.process_group(0);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Err(AppError::Spawn {
                    message: format!("failed to spawn {label}: {err}"),
                    result: Box::new(SubprocessResult::not_started(elapsed_ms(started))),
                });
            }
        };
        let Some(pid) = child.id() else {
            return Err(AppError::Spawn {
                message: format!("{label} exited before it could be tracked"),
                result: Box::new(SubprocessResult::not_started(elapsed_ms(started))),
            });
        };

        let ownership_id = resolve_ownership_id(options.ownership_id.as_deref());
        let unregister = options.resolved_cleanup_on_parent_exit().then(|| {
            self.register(
                pid,
                Registration::from_options(command, &args, &options, ownership_id.clone()),
            )
        });
        let mut guard = SpawnGuard {
            pid,
            kill: kill_options(&options),
            unregister,
            armed: true,
        };
        debug!(pid, command, ownership_id = ?ownership_id, "spawned subprocess");
        if let Some(on_spawn) = &options.on_spawn {
            on_spawn(pid);
        }

        if let Some(mut stdin) = child.stdin.take() {
            let input = options.input.take().unwrap_or_default();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&input).await {
                    debug!(pid, %err, "failed to write subprocess input");
                }
                stdin.shutdown().await.ok();
            });
        }

        let max_bytes = options.resolved_max_output_bytes();
        let stdout: SharedCollector = Arc::new(Mutex::new(OutputCollector::new(
            options.captures_stdout(),
            max_bytes,
        )));
        let stderr: SharedCollector = Arc::new(Mutex::new(OutputCollector::new(
            options.captures_stderr(),
            max_bytes,
        )));
        let stdout_reader = child.stdout.take().map(|stream| {
            tokio::spawn(pump(stream, Arc::clone(&stdout), options.on_stdout.clone()))
        });
        let stderr_reader = child.stderr.take().map(|stream| {
            tokio::spawn(pump(stream, Arc::clone(&stderr), options.on_stderr.clone()))
        });

        let settle = SettleOnce::new();
        let race = {
            let exit = async {
                let status = child.wait().await;
                for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
                    reader.await.ok();
                }
                status
            };
            tokio::pin!(exit);
            tokio::select! {
                status = &mut exit => Race::Exited(status),
                () = sleep_or_forever(options.resolved_timeout_ms()) => {
                    Race::TimedOut(options.resolved_timeout_ms().unwrap_or_default())
                }
                () = cancelled_or_forever(options.cancel.clone()) => Race::Cancelled,
            }
        };

        let result = |exit_code: Option<i32>, signal: Option<String>| SubprocessResult {
            pid: Some(pid),
            exit_code,
            signal,
            duration_ms: elapsed_ms(started),
            stdout: snapshot(&stdout).to_output(options.output_mode),
            stderr: snapshot(&stderr).to_output(options.output_mode),
        };

        match race {
            Race::Exited(Ok(status)) if settle.resolve() => {
                if let Some(unregister) = guard.disarm() {
                    unregister.exited(Some(status));
                }
                let exit_code = status.code();
                let outcome = result(exit_code, exit_signal(status));
                if options.accepts_exit(exit_code) {
                    Ok(outcome)
                } else {
                    let message = match (&outcome.exit_code, &outcome.signal) {
                        (Some(code), _) => format!("{label} exited with code {code}"),
                        (None, Some(signal)) => format!("{label} was terminated by {signal}"),
                        (None, None) => format!("{label} exited abnormally"),
                    };
                    Err(AppError::Spawn {
                        message,
                        result: Box::new(outcome),
                    })
                }
            }
            Race::Exited(Err(err)) if settle.reject() => {
                if let Some(unregister) = guard.disarm() {
                    unregister.exited(None);
                }
                Err(AppError::Spawn {
                    message: format!("failed waiting on {label}: {err}"),
                    result: Box::new(result(None, None)),
                })
            }
            Race::TimedOut(timeout_ms) if settle.reject() => {
                warn!(pid, timeout_ms, command, "subprocess timed out, killing tree");
                escalate(child, pid, kill_options(&options), guard.disarm());
                Err(AppError::Timeout {
                    timeout_ms,
                    result: Box::new(result(None, None)),
                })
            }
            Race::Cancelled if settle.reject() => {
                debug!(pid, command, "subprocess cancelled, killing tree");
                escalate(child, pid, kill_options(&options), guard.disarm());
                Err(AppError::Aborted {
                    result: Box::new(result(None, None)),
                })
            }
            _ => Err(AppError::Spawn {
                message: format!("{label} settled twice"),
                result: Box::new(result(None, None)),
            }),
        }
    }
}

/// Spawn through the process-wide registry.
///
/// # Errors
///
/// See [`SubprocessRegistry::spawn`].
pub async fn spawn_subprocess<I, S>(
    command: &str,
    args: I,
    options: SpawnOptions,
) -> Result<SubprocessResult>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    SubprocessRegistry::global().spawn(command, args, options).await
}

/// Run `command` to completion on the current thread.
///
/// Not tracked by any registry and without timeout or cancellation; shell
/// rejection, capture trimming, and exit-code rules match the async path.
///
/// # Errors
///
/// - `AppError::ShellDisabled` when `options.shell` is set.
/// - `AppError::Spawn` when the process cannot start or exits with an
///   unexpected code.
pub fn spawn_blocking<I, S>(
    command: &str,
    args: I,
    options: &SpawnOptions,
) -> Result<SubprocessResult>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let started = Instant::now();
    if options.shell {
        return Err(AppError::ShellDisabled);
    }
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let label = options.name.clone().unwrap_or_else(|| command.to_owned());

    let mut cmd = std::process::Command::new(command);
    cmd.args(&args);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        cmd.env_clear().envs(env);
    }
    let (stdin, stdout, stderr) = stdio_for(options);
    cmd.stdin(stdin).stdout(stdout).stderr(stderr);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if options.resolved_detached() {
            cmd.process_group(0);
        }
    }

    let mut child = cmd.spawn().map_err(|err| AppError::Spawn {
        message: format!("failed to spawn {label}: {err}"),
        result: Box::new(SubprocessResult::not_started(elapsed_ms(started))),
    })?;
    let pid = child.id();
    if let Some(on_spawn) = &options.on_spawn {
        on_spawn(pid);
    }
    let writer = child.stdin.take().map(|mut stdin| {
        let input = options.input.clone().unwrap_or_default();
        std::thread::spawn(move || stdin.write_all(&input))
    });
    let stderr_reader = child.stderr.take().map(|mut stream| {
        std::thread::spawn(move || {
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).map(|_| raw)
        })
    });
    let mut raw_stdout = Vec::new();
    if let Some(mut stream) = child.stdout.take() {
        stream.read_to_end(&mut raw_stdout)?;
    }
    let raw_stderr = match stderr_reader.map(std::thread::JoinHandle::join) {
        Some(Ok(read)) => read?,
        Some(Err(_)) => {
            return Err(AppError::Io(format!("stderr reader for {label} panicked")));
        }
        None => Vec::new(),
    };
    if let Some(Ok(Err(err))) = writer.map(std::thread::JoinHandle::join) {
        debug!(pid, %err, "failed to write subprocess input");
    }
    let status = child.wait()?;

    if let Some(on_stdout) = &options.on_stdout {
        on_stdout(&String::from_utf8_lossy(&raw_stdout));
    }
    if let Some(on_stderr) = &options.on_stderr {
        on_stderr(&String::from_utf8_lossy(&raw_stderr));
    }
    let max_bytes = options.resolved_max_output_bytes();
    let exit_code = status.code();
    let result = SubprocessResult {
        pid: Some(pid),
        exit_code,
        signal: exit_signal(status),
        duration_ms: elapsed_ms(started),
        stdout: options
            .captures_stdout()
            .then(|| trim_output(&raw_stdout, max_bytes, options.output_mode)),
        stderr: options
            .captures_stderr()
            .then(|| trim_output(&raw_stderr, max_bytes, options.output_mode)),
    };
    if options.accepts_exit(exit_code) {
        Ok(result)
    } else {
        Err(AppError::Spawn {
            message: exit_code.map_or_else(
                || format!("{label} exited abnormally"),
                |code| format!("{label} exited with code {code}"),
            ),
            result: Box::new(result),
        })
    }
}

fn configure_command(cmd: &mut Command, options: &SpawnOptions) {
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        cmd.env_clear().envs(env);
    }
    let (stdin, stdout, stderr) = stdio_for(options);
    cmd.stdin(stdin).stdout(stdout).stderr(stderr);
}

fn stdio_for(options: &SpawnOptions) -> (Stdio, Stdio, Stdio) {
    match options.stdio {
        StdioMode::Pipe => (
            if options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            },
            Stdio::piped(),
            Stdio::piped(),
        ),
        StdioMode::Inherit => (Stdio::inherit(), Stdio::inherit(), Stdio::inherit()),
        StdioMode::Ignore => (Stdio::null(), Stdio::null(), Stdio::null()),
    }
}

fn kill_options(options: &SpawnOptions) -> KillOptions {
    KillOptions {
        kill_tree: options.kill_tree,
        detached: options.resolved_detached(),
        signal: options.kill_signal,
        grace_ms: options.resolved_kill_grace_ms(),
    }
}

/// Tree-kill in the background, then reap the child and drop its entry.
fn escalate(
    mut child: tokio::process::Child,
    pid: u32,
    options: KillOptions,
    unregister: Option<Unregister>,
) {
    tokio::spawn(async move {
        if let Err(err) = kill_process_tree(pid, options).await {
            warn!(pid, %err, "tree-kill after timeout or cancellation failed");
        }
        let status = child.wait().await.ok();
        if let Some(unregister) = unregister {
            unregister.exited(status);
        }
    });
}

async fn pump<R>(mut stream: R, collector: SharedCollector, callback: Option<OutputCallback>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
    loop {
        buf.reserve(READ_CHUNK_BYTES);
        match stream.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if let Some(callback) = &callback {
                    callback(&String::from_utf8_lossy(&chunk));
                }
                collector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(chunk);
            }
            Err(err) => {
                debug!(%err, "subprocess output stream closed with error");
                break;
            }
        }
    }
}

fn snapshot(collector: &SharedCollector) -> std::sync::MutexGuard<'_, OutputCollector> {
    collector.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn sleep_or_forever(timeout_ms: Option<u64>) {
    match timeout_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_or_forever(cancel: Option<CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|raw| {
        nix::sys::signal::Signal::try_from(raw)
            .map_or_else(|_| format!("signal {raw}"), |signal| signal.as_str().to_owned())
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<String> {
    None
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
