//! The self-debugging bootstrap (`SPEC_FULL.md` §4.D).
//!
//! `start_monitor()` is the one entry point: on the first call in a
//! process it forks, the parent becomes the monitor and never returns,
//! and the child becomes the inferior and returns a usable handle
//! (installed as the process-wide [`crate::context::Context`]).

use std::os::fd::{IntoRawFd, RawFd};

use nix::unistd::{fork, ForkResult};
use once_cell::sync::OnceCell;

use crate::client;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::monitor;

/// Guards `start_monitor` so the fork only happens once per inferior
/// process, even if called repeatedly — `spec.md` §4.D: "Subsequent calls
/// in the inferior return success without forking."
static STARTED: OnceCell<()> = OnceCell::new();

fn process_name() -> String {
    std::env::args()
        .next()
        .and_then(|arg0| {
            std::path::Path::new(&arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Splits the process into an inferior and a monitor.
///
/// On the first call, creates both pipes (so both sides inherit both
/// endpoints across `fork`, per `spec.md` §4.D), forks, and:
///
/// - in the **parent** (the original task id), becomes the monitor and
///   calls [`monitor::run`], which never returns — the process exits when
///   the monitor loop does.
/// - in the **child** (the new task id), closes the monitor's pipe ends,
///   installs the `SIGTRAP` handler, installs the process-wide
///   [`Context`], and returns `Ok(())`.
///
/// Subsequent calls in the inferior are a no-op that returns `Ok(())`
/// without forking again.
pub fn start_monitor() -> Result<()> {
    if STARTED.get().is_some() {
        return Ok(());
    }

    let (req_r, req_w) = make_pipe()?;
    let (resp_r, resp_w) = make_pipe()?;

    let parent_pid = nix::unistd::getpid();
    let name = process_name();

    // SAFETY: called once, before any additional threads are spawned by
    // this crate; the child performs only async-signal-safe setup
    // (closing fds, installing a sigaction) before returning.
    match unsafe { fork() }.map_err(|_| Error::ContextNotFound)? {
        ForkResult::Parent { child } => {
            close_fd(req_w);
            close_fd(resp_r);
            STARTED.set(()).ok();
            // Never returns: the monitor loop runs until the inferior
            // exits, then this process exits too (`spec.md` §4.D).
            monitor::run(req_r, resp_w, child, &name);
            std::process::exit(0);
        }
        ForkResult::Child => {
            close_fd(req_r);
            close_fd(resp_w);
            STARTED.set(()).ok();
            client::install_sigtrap_handler()?;
            Context::install(parent_pid, nix::unistd::getpid(), name, req_w, resp_r)?;
            Ok(())
        }
    }
}

fn make_pipe() -> Result<(RawFd, RawFd)> {
    let (r, w) = nix::unistd::pipe().map_err(Error::from)?;
    Ok((r.into_raw_fd(), w.into_raw_fd()))
}

fn close_fd(fd: RawFd) {
    let _ = nix::unistd::close(fd);
}
