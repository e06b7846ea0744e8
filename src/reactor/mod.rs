//! Single-threaded, readiness-based event loop shared by every service
//! process (spec.md §4.B, §5).
//!
//! Grounded on the teacher's `events::network`/`events::internal` split
//! (`NetworkPart`/`InternalPart` feeding a shared event channel that
//! `NodeHandler` drains): this module generalizes that same shape — a
//! single cooperative scheduler, no work between callbacks, signal-driven
//! exit — from the teacher's fixed peer-network/consensus-timer pair to any
//! number of framed IPC sockets plus a plain timer queue, matching spec.md
//! §4.B exactly. Each service process runs exactly one [`Reactor`] on a
//! `current_thread` tokio runtime, via [`run_local`].

pub mod socket;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::LocalSet;

pub use socket::SocketContext;

/// Shared per-process exit flag. Any send/receive failure or fatal
/// invariant violation sets this; every callback checks it before
/// scheduling further work (spec.md §4.B "Cancellation").
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One reactor per process. Owns the shared exit flag and reacts to
/// `SIGHUP`/`SIGTERM`/`SIGQUIT` by setting it and returning from
/// [`Reactor::run`] once in-flight callbacks drain (spec.md §4.B "Signal
/// handling").
#[derive(Debug, Clone)]
pub struct Reactor {
    exit: ExitFlag,
    name: &'static str,
}

impl Reactor {
    pub fn new(name: &'static str) -> Self {
        Self {
            exit: ExitFlag::new(),
            name,
        }
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    /// Equivalent of `exit_event_loop`: trips the exit flag, to be observed
    /// by every registered callback on its next scheduling point.
    pub fn exit_event_loop(&self) {
        info!("{}: exit_event_loop requested", self.name);
        self.exit.set();
    }

    #[cfg(unix)]
    async fn watch_signals(exit: ExitFlag, name: &'static str) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
        let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");

        tokio::select! {
            _ = hup.recv() => debug!("{}: received SIGHUP", name),
            _ = term.recv() => debug!("{}: received SIGTERM", name),
            _ = quit.recv() => debug!("{}: received SIGQUIT", name),
        }
        exit.set();
    }

    /// Runs `body` to completion on a `LocalSet`, racing it against the
    /// process's signal watcher; whichever completes first trips the exit
    /// flag and ends the loop. `body` is expected to poll `exit_flag()`
    /// itself between units of work, per spec.md §4.B's cancellation rule.
    pub async fn run<F>(&self, body: F)
    where
        F: Future<Output = ()>,
    {
        info!("{}: reactor starting", self.name);
        #[cfg(unix)]
        {
            let signals = Self::watch_signals(self.exit.clone(), self.name);
            tokio::pin!(signals);
            tokio::pin!(body);
            tokio::select! {
                _ = &mut signals => {},
                _ = &mut body => {},
            }
        }
        #[cfg(not(unix))]
        {
            body.await;
        }
        info!("{}: reactor stopped", self.name);
    }
}

/// Runs an async `main` body on a single-threaded tokio runtime plus a
/// `LocalSet`, matching spec.md §5's "multi-process, each process
/// single-threaded cooperative" scheduling model (no worker-thread pool,
/// no cross-thread synchronization).
pub fn run_local<F>(main: F) -> F::Output
where
    F: Future + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current-thread tokio runtime");
    let local = LocalSet::new();
    local.block_on(&runtime, main)
}

/// A scheduled, one-shot wakeup — the reactor's analog of the teacher's
/// `TimeoutRequest` (spec.md §4.F's "timer-driven" canonization wakeups).
pub async fn sleep_ms(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_flag_starts_clear_and_latches() {
        let flag = ExitFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn reactor_run_completes_when_body_completes() {
        run_local(async {
            let reactor = Reactor::new("test");
            reactor.run(async {}).await;
        });
    }
}
