//! The process-wide singleton the inferior side of the crate operates
//! through (`SPEC_FULL.md` §3, "Process-wide singleton state").
//!
//! Created lazily on first use inside [`crate::bootstrap::start_monitor`]
//! and never torn down — `spec.md` §3: "never destroyed (the monitor
//! exits when the inferior exits)" and §5: "leaked at process exit
//! intentionally". `once_cell::sync::OnceCell` is the guard `spec.md` §9
//! asks for ("guard initialization with a once-primitive"); it is listed
//! directly in the teacher's own dependency table.

use std::os::fd::RawFd;
use std::sync::Mutex;

use nix::unistd::Pid;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::watchpoint::WatchpointTable;

static CONTEXT: OnceCell<Context> = OnceCell::new();

/// Everything the inferior side needs to talk to the monitor and track
/// its own watchpoints.
pub struct Context {
    pub(crate) monitor_pid: Pid,
    pub(crate) inferior_pid: Pid,
    pub(crate) process_name: String,
    pub(crate) request_write: RawFd,
    pub(crate) response_read: RawFd,
    pub(crate) table: Mutex<WatchpointTable>,
}

impl Context {
    pub(crate) fn install(
        monitor_pid: Pid,
        inferior_pid: Pid,
        process_name: String,
        request_write: RawFd,
        response_read: RawFd,
    ) -> Result<&'static Context> {
        CONTEXT
            .set(Context {
                monitor_pid,
                inferior_pid,
                process_name,
                request_write,
                response_read,
                table: Mutex::new(WatchpointTable::new()),
            })
            .map_err(|_| Error::ContextNotFound)?;
        Ok(CONTEXT.get().expect("just inserted"))
    }

    /// Looks up the singleton. Every public API entry point calls this
    /// first; absence means bootstrap was never called or failed
    /// (`spec.md` §3: "if absent, they return context-not-found").
    pub(crate) fn get() -> Result<&'static Context> {
        CONTEXT.get().ok_or(Error::ContextNotFound)
    }

    pub(crate) fn monitor_pid(&self) -> Pid {
        self.monitor_pid
    }

    pub(crate) fn inferior_pid(&self) -> Pid {
        self.inferior_pid
    }

    pub(crate) fn process_name(&self) -> &str {
        &self.process_name
    }
}

#[cfg(test)]
pub(crate) fn is_installed() -> bool {
    CONTEXT.get().is_some()
}

// `Context` sits behind a `static`, so it must be shareable across whichever
// thread the `SIGTRAP` handler happens to run on.
static_assertions::assert_impl_all!(Context: Sync);
