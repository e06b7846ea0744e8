//! Supervisor: process lifecycle and privilege separation (spec.md §4.H).
//!
//! One supervisor process per `agentd start` invocation. It reads
//! configuration, forks one child per service in dependency order, drops
//! privileges inside each child before `exec`ing the service's private
//! subcommand, and tears children down (reverse order, graceful-then-hard)
//! on shutdown.

pub mod privsep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{CoreError, CoreResult};

/// One service process, in the dependency order spec.md §4.H assigns
/// ("dependencies flow right-to-left": random → data-for-canonization →
/// data-for-protocol → listener → auth → protocol → canonization).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Random,
    DataForCanonization,
    DataForProtocol,
    Listener,
    Auth,
    Protocol,
    Canonization,
}

impl ServiceName {
    /// The `-P <subcommand>` value `exec_private` appends (spec.md §6's
    /// CLI contract).
    pub fn private_subcommand(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::DataForCanonization | Self::DataForProtocol => "dataservice",
            Self::Listener => "listenservice",
            Self::Auth => "unauthorized_protocol_service",
            Self::Protocol => "unauthorized_protocol_service",
            Self::Canonization => "canonization_service",
        }
    }
}

/// Startup order (spec.md §4.H).
pub const STARTUP_ORDER: [ServiceName; 7] = [
    ServiceName::Random,
    ServiceName::DataForCanonization,
    ServiceName::DataForProtocol,
    ServiceName::Listener,
    ServiceName::Auth,
    ServiceName::Protocol,
    ServiceName::Canonization,
];

/// Shutdown order: the reverse of startup (spec.md §4.H, "Shutdown is
/// reverse; higher-level services are asked to quiesce first").
pub fn shutdown_order() -> Vec<ServiceName> {
    STARTUP_ORDER.iter().rev().copied().collect()
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running child service, tracked by the supervisor until it's reaped.
#[derive(Debug)]
pub struct ChildHandle {
    pub name: ServiceName,
    pub pid: Pid,
}

/// Replaces the original's global `keep_running` flag (spec.md §9 design
/// note) with an explicit, `Arc`-shared atomic updated only from the
/// async-signal-safe path (a plain store, no allocation, no locking) and
/// read from the supervisor's main loop.
#[derive(Debug, Clone, Default)]
pub struct KeepRunningFlag(Arc<AtomicBool>);

impl KeepRunningFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// Orchestrates the full service tree. Holds no I/O state itself beyond
/// the list of forked children; the reactor each child runs lives in that
/// child's own process image post-`exec`.
pub struct Supervisor {
    children: Vec<ChildHandle>,
    keep_running: KeepRunningFlag,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            keep_running: KeepRunningFlag::new(),
        }
    }

    pub fn keep_running_flag(&self) -> KeepRunningFlag {
        self.keep_running.clone()
    }

    /// Installs `SIGHUP`/`SIGTERM`/`SIGCHLD` handlers (spec.md §4.H,
    /// "install SIGHUP, SIGTERM, SIGCHLD handlers"). `SIGTERM` clears
    /// `keep_running`; `SIGHUP`/`SIGCHLD` trigger a restart cycle by
    /// leaving it set, matching "On SIGCHLD or SIGHUP, the supervisor
    /// exits its wait, tears down all children, and (if keep_running)
    /// re-enters the start cycle."
    #[cfg(unix)]
    pub async fn watch_signals(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
        let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut chld = signal(SignalKind::child()).expect("failed to register SIGCHLD handler");

        tokio::select! {
            _ = hup.recv() => info!("supervisor: received SIGHUP, will restart service tree"),
            _ = term.recv() => {
                info!("supervisor: received SIGTERM, shutting down");
                self.keep_running.set(false);
            }
            _ = chld.recv() => info!("supervisor: received SIGCHLD"),
        }
    }

    /// Forks one child for `name`, running `in_child` (which must chroot,
    /// drop privileges, remap descriptors and `exec` — it never returns
    /// on success) in the new process. Returns the parent-side handle.
    ///
    /// # Safety
    /// `fork()` is async-signal-unsafe in a multi-threaded process; this
    /// must run before the tokio runtime spins up worker threads, matching
    /// spec.md §5's "single-threaded cooperative" process model (the
    /// supervisor itself never starts a runtime with more than its own
    /// thread until every child is forked).
    pub fn spawn_child(
        &mut self,
        name: ServiceName,
        in_child: impl FnOnce() -> CoreResult<()>,
    ) -> CoreResult<()> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child, .. }) => {
                info!("supervisor: forked {name:?} as pid {child}");
                self.children.push(ChildHandle { name, pid: child });
                Ok(())
            }
            Ok(ForkResult::Child) => {
                if let Err(err) = in_child() {
                    eprintln!("{name:?} child setup failed: {err}");
                    std::process::exit(1);
                }
                unreachable!("in_child must exec or exit, never return")
            }
            Err(e) => Err(CoreError::Fatal(anyhow::anyhow!("fork failed: {e}"))),
        }
    }

    /// Tears down every tracked child in reverse-startup order: ask
    /// nicely (nothing to ask here but the process already quiesces via
    /// its own reactor's signal watcher), wait out the grace period, then
    /// `SIGTERM`, then `SIGKILL` (spec.md §4.H).
    pub fn shutdown_all(&mut self) {
        for child in self.children.drain(..).rev() {
            self.shutdown_one(&child);
        }
    }

    fn shutdown_one(&self, child: &ChildHandle) {
        if signal::kill(child.pid, Signal::SIGTERM).is_err() {
            return;
        }
        let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            match waitpid(child.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if std::time::Instant::now() >= deadline {
                        warn!("{:?} (pid {}) did not exit in time, killing", child.name, child.pid);
                        let _ = signal::kill(child.pid, Signal::SIGKILL);
                        let _ = waitpid(child.pid, None);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => return,
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an `ErrorCode`/process-exit condition to the stable nonzero exit
/// code a child reports to its supervisor (spec.md §6, "each service maps
/// its failure to a stable nonzero code").
pub fn exit_code_for(err: &CoreError) -> i32 {
    match err {
        CoreError::Status(code) => {
            1 + (code.tag as i32) * 0x100 + i32::from(code.subcode & 0xFF)
        }
        CoreError::Fatal(_) => 255,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_and_shutdown_orders_are_reversed() {
        let shutdown = shutdown_order();
        let startup: Vec<ServiceName> = STARTUP_ORDER.to_vec();
        let mut reversed = startup.clone();
        reversed.reverse();
        assert_eq!(shutdown, reversed);
        assert_eq!(startup.first(), Some(&ServiceName::Random));
        assert_eq!(startup.last(), Some(&ServiceName::Canonization));
    }

    #[test]
    fn keep_running_defaults_true_and_latches_false() {
        let flag = KeepRunningFlag::new();
        assert!(flag.get());
        flag.set(false);
        assert!(!flag.get());
    }

    #[test]
    fn exit_code_is_nonzero_for_every_error_kind() {
        let status_err = CoreError::from(crate::error::NOT_FOUND);
        assert_ne!(exit_code_for(&status_err), 0);
        let fatal_err = CoreError::Fatal(anyhow::anyhow!("boom"));
        assert_eq!(exit_code_for(&fatal_err), 255);
    }
}
