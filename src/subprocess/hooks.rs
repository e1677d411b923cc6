//! Process-wide shutdown cleanup.
//!
//! Installed once, lazily, the first time the global registry tracks a
//! child. On a termination signal, or when the [`ExitGuard`] held by `main`
//! drops, every tracked child is force-killed. A panic that escapes `main`
//! unwinds through that guard; panics caught by a task or `catch_unwind`
//! leave tracked children alone. Builds with `panic = "abort"` never unwind,
//! so there a panic hook runs the cleanup instead.
//!
//! Signals are received on a dedicated thread, independent of any async
//! runtime. After a signal the default disposition is re-raised unless some
//! other part of the program subscribed to shutdown signals and will handle
//! the exit itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::registry::{ScopeFilter, SubprocessRegistry, TerminateRequest, TerminationSummary};

static HOOKS: OnceLock<ShutdownHooks> = OnceLock::new();

/// Termination signals the hooks react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// `SIGINT` / Ctrl-C.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGHUP`.
    Hangup,
}

impl ShutdownSignal {
    /// Canonical `SIG*` name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        }
    }

    /// Conventional shell exit code for death by this signal.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
            Self::Hangup => 129,
        }
    }

    #[cfg(unix)]
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            signal_hook::consts::SIGINT => Some(Self::Interrupt),
            signal_hook::consts::SIGTERM => Some(Self::Terminate),
            signal_hook::consts::SIGHUP => Some(Self::Hangup),
            _ => None,
        }
    }

    #[cfg(unix)]
    fn raw(self) -> i32 {
        match self {
            Self::Interrupt => signal_hook::consts::SIGINT,
            Self::Terminate => signal_hook::consts::SIGTERM,
            Self::Hangup => signal_hook::consts::SIGHUP,
        }
    }
}

/// Once-only installer and runner of shutdown cleanup.
#[derive(Debug)]
pub struct ShutdownHooks {
    installed: AtomicBool,
    cleaned: AtomicBool,
    listeners: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownHooks {
    /// The process-wide instance.
    pub fn global() -> &'static Self {
        HOOKS.get_or_init(|| {
            let (listeners, _) = broadcast::channel(4);
            Self {
                installed: AtomicBool::new(false),
                cleaned: AtomicBool::new(false),
                listeners,
            }
        })
    }

    /// Install signal (and, under `panic = "abort"`, panic) hooks; `true`
    /// only for the installing call.
    pub fn install(&'static self) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        #[cfg(panic = "abort")]
        self.install_panic_hook();

        self.spawn_signal_listener();
        debug!("shutdown hooks installed");
        true
    }

    /// Whether [`install`](Self::install) has run.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Whether cleanup has already run.
    #[must_use]
    pub fn has_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Receive delivered shutdown signals.
    ///
    /// While at least one receiver is alive the hooks clean up but do not
    /// re-raise the signal; the subscriber owns the exit.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.listeners.subscribe()
    }

    /// Guard that force-kills all tracked children when dropped.
    #[must_use]
    pub fn exit_guard(&'static self) -> ExitGuard {
        ExitGuard { hooks: self }
    }

    /// Force-kill every tracked child of the global registry, at most once
    /// per process.
    pub fn cleanup(&self, reason: &str) -> Option<TerminationSummary> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return None;
        }
        let request = TerminateRequest::new(format!("shutdown:{reason}"), ScopeFilter::All).forced();
        let summary = SubprocessRegistry::global().terminate_all_blocking(&request);
        if summary.attempted > 0 {
            info!(
                reason,
                attempted = summary.attempted,
                failures = summary.failures,
                "terminated tracked subprocesses during shutdown"
            );
        }
        Some(summary)
    }

    fn on_signal(&self, signal: ShutdownSignal) {
        self.cleanup(signal.name());
        if self.listeners.receiver_count() > 0 {
            // Send only fails when every receiver has gone away meanwhile.
            if self.listeners.send(signal).is_ok() {
                return;
            }
        }
        reraise(signal);
    }

    #[cfg(panic = "abort")]
    fn install_panic_hook(&'static self) {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            self.cleanup("panic");
            previous(panic_info);
        }));
    }

    #[cfg(unix)]
    fn spawn_signal_listener(&'static self) {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
            Ok(signals) => signals,
            Err(err) => {
                warn!(%err, "failed to install signal hooks");
                return;
            }
        };
        let spawned = std::thread::Builder::new()
            .name("shutdown-signals".to_owned())
            .spawn(move || {
                for raw in signals.forever() {
                    if let Some(signal) = ShutdownSignal::from_raw(raw) {
                        self.on_signal(signal);
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to start signal listener thread");
        }
    }

    #[cfg(not(unix))]
    fn spawn_signal_listener(&'static self) {
        let spawned = std::thread::Builder::new()
            .name("shutdown-signals".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(%err, "failed to build signal listener runtime");
                        return;
                    }
                };
                runtime.block_on(async {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        self.on_signal(ShutdownSignal::Interrupt);
                    }
                });
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to start signal listener thread");
        }
    }
}

#[cfg(unix)]
fn reraise(signal: ShutdownSignal) {
    if let Err(err) = signal_hook::low_level::emulate_default_handler(signal.raw()) {
        warn!(%err, signal = signal.name(), "failed to re-raise signal");
        std::process::exit(signal.exit_code());
    }
}

#[cfg(not(unix))]
fn reraise(signal: ShutdownSignal) {
    std::process::exit(signal.exit_code());
}

/// Runs shutdown cleanup on drop.
#[derive(Debug)]
#[must_use = "cleanup runs when the guard is dropped"]
pub struct ExitGuard {
    hooks: &'static ShutdownHooks,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.hooks.cleanup("exit");
    }
}
