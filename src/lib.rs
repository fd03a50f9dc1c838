//! `dyndbg` is an in-process, programmatic hardware-breakpoint and
//! watchpoint facility for a self-debugging x86-64 Linux process.
//!
//! A process that wants to watch its own memory calls [`start_monitor`]
//! once, early in `main`. That call forks: the parent becomes a monitor
//! task that never returns and is never touched again directly, and the
//! child — the original process's continuation — returns and keeps
//! running as the *inferior*. From then on, [`add`] programs a hardware
//! watchpoint by asking the monitor (over a pair of anonymous pipes) to
//! mutate the inferior's own debug registers via `ptrace`; when the CPU
//! raises the resulting `SIGTRAP`, this crate's handler asks the monitor
//! which slot fired and invokes the watchpoint's callback.
//!
//! ```no_run
//! use dyndbg::{WatchKind, WatchWidth};
//!
//! fn on_fire(id: dyndbg::WatchpointId, wp: &dyndbg::Watchpoint) {
//!     println!("{id} fired at {:#x}", wp.address());
//! }
//!
//! dyndbg::start_monitor().expect("failed to start watchpoint monitor");
//!
//! static TARGET: u64 = 0;
//! let id = dyndbg::add(
//!     &TARGET as *const u64 as usize,
//!     WatchKind::Write,
//!     WatchWidth::Eight,
//!     on_fire,
//!     0,
//!     true,
//! )
//! .expect("failed to register watchpoint");
//! dyndbg::remove(id).ok();
//! ```
//!
//! The crash-handler module ([`install_crash_handler`]) is a separate,
//! optional collaborator: it prints register/backtrace/stack diagnostics
//! on `SIGSEGV`/`SIGILL`/`SIGFPE`/`SIGBUS` and is gated behind the
//! `crash-handler` feature (on by default). It shares no state with the
//! watchpoint core.

#![warn(missing_docs)]

mod bootstrap;
mod client;
mod context;
#[cfg(feature = "crash-handler")]
mod crash;
mod error;
mod monitor;
mod protocol;
mod regs;
mod watchpoint;

pub use crate::error::{Error, Result};
pub use crate::watchpoint::{WatchKind, WatchWidth, Watchpoint, WatchpointCallback, WatchpointId};

#[cfg(feature = "crash-handler")]
pub use crate::crash::{CrashCallback, CrashContext};

/// Splits the calling process into an inferior (the caller's own
/// continuation) and a monitor (a forked sibling that services debug
/// register requests and never returns). Safe to call more than once:
/// every call after the first is a no-op that returns `Ok(())`.
///
/// Must be called before [`add`], [`enable`], [`disable`],
/// [`disable_all`], or [`find`] — each of those returns
/// [`Error::ContextNotFound`] if the monitor has not been started.
pub fn start_monitor() -> Result<()> {
    bootstrap::start_monitor()
}

/// Registers a new watchpoint and immediately enables it in hardware.
///
/// `hw` must be `true`; software watchpoints are out of scope for this
/// crate (see [`Error::SwNotImplemented`]). Fails with
/// [`Error::InvalidArgument`] if a live watchpoint already exists with
/// the same `(address, kind, width)` triple, or with
/// [`Error::AllHwSlotsBusy`] if all four hardware slots are already
/// occupied by other watchpoints.
pub fn add(
    address: usize,
    kind: WatchKind,
    width: WatchWidth,
    callback: WatchpointCallback,
    callback_arg: usize,
    hw: bool,
) -> Result<WatchpointId> {
    client::add(address, kind, width, callback, callback_arg, hw)
}

/// Looks up a live watchpoint by its `(address, kind, width)` triple.
/// `verbose` logs the whole table at debug level on a miss, which is
/// useful when diagnosing a watchpoint that appears to have vanished.
pub fn find(address: usize, kind: WatchKind, width: WatchWidth, verbose: bool) -> Option<WatchpointId> {
    client::find(address, kind, width, verbose)
}

/// Disables (best-effort) and unregisters a watchpoint. Fails with
/// [`Error::HwSlotNotFound`] if `id` does not name a live watchpoint —
/// including a second call to `remove` with the same `id`.
pub fn remove(id: WatchpointId) -> Result<()> {
    client::remove(id)
}

/// Enables a watchpoint that is currently disabled. A no-op returning
/// `Ok(())` if it is already enabled.
pub fn enable(id: WatchpointId) -> Result<()> {
    client::enable(id)
}

/// Disables a watchpoint without forgetting it — it can be re-enabled
/// later with [`enable`]. A no-op returning `Ok(())` if it is already
/// disabled.
pub fn disable(id: WatchpointId) -> Result<()> {
    client::disable(id)
}

/// Disables every watchpoint in a single monitor round-trip, without
/// forgetting any of them.
pub fn disable_all() -> Result<()> {
    client::disable_all()
}

/// Installs the crash-diagnostic signal handlers for `SIGSEGV`, `SIGILL`,
/// `SIGFPE`, and `SIGBUS`. Independent of the watchpoint core: it does
/// not require [`start_monitor`] to have been called, and does not touch
/// `SIGTRAP`/`SIGCHLD`.
///
/// If `cb` is `Some`, it is invoked after the fault is printed and the
/// handler then returns, allowing a repaired context (e.g. an advanced
/// instruction pointer) to resume; if `None`, the process exits with a
/// nonzero status after printing.
#[cfg(feature = "crash-handler")]
pub fn install_crash_handler(cb: Option<CrashCallback>) -> Result<()> {
    crash::install_crash_handler(cb)
}
