//! The inferior-side client (`SPEC_FULL.md` §4.C) and the `SIGTRAP`
//! handler (§4.C.2).

use nix::sys::signal::{self, SigHandler, SigSet, Signal};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::protocol::{read_record, write_record, Request, Response, ResponseResult};
use crate::watchpoint::{WatchKind, WatchWidth, Watchpoint, WatchpointCallback, WatchpointId};

/// Registers the watchpoint, linking it into the table and immediately
/// enabling it (`spec.md` §4.C: "On success, ... immediately calls
/// `enable(bp)`").
pub fn add(
    address: usize,
    kind: WatchKind,
    width: WatchWidth,
    callback: WatchpointCallback,
    callback_arg: usize,
    hw: bool,
) -> Result<WatchpointId> {
    if !hw {
        return Err(Error::SwNotImplemented);
    }

    let ctx = Context::get()?;
    let id = {
        let mut table = ctx.table.lock().expect("watchpoint table poisoned");
        if table.find(address, kind, width).is_some() {
            return Err(Error::InvalidArgument(
                "a watchpoint with this (address, kind, width) already exists",
            ));
        }
        table.insert(Watchpoint {
            address,
            kind,
            width,
            hw,
            enabled: false,
            callback,
            callback_arg,
        })
    };

    enable(id)?;
    Ok(id)
}

/// Linear scan over the table for a matching live entry.
/// `verbose` dumps the table to the log on a miss, for diagnostics.
pub fn find(address: usize, kind: WatchKind, width: WatchWidth, verbose: bool) -> Option<WatchpointId> {
    let ctx = Context::get().ok()?;
    let table = ctx.table.lock().expect("watchpoint table poisoned");
    let found = table.find(address, kind, width);
    if found.is_none() && verbose {
        tracing::debug!("find: no watchpoint at {address:#x} ({kind:?}, {width:?}); table:");
        for (id, wp) in table.iter() {
            tracing::debug!(
                "  {id}: {:#x} {:?} {:?} enabled={}",
                wp.address(),
                wp.kind(),
                wp.width(),
                wp.enabled()
            );
        }
    }
    found
}

/// Disables (errors ignored) then unlinks the watchpoint. Matches by
/// `(address, kind, width)` rather than trusting the handle is still
/// live, to tolerate stale handles (`spec.md` §4.C).
pub fn remove(id: WatchpointId) -> Result<()> {
    let _ = disable(id);

    let ctx = Context::get()?;
    let mut table = ctx.table.lock().expect("watchpoint table poisoned");
    let key = table.get(id).map(|wp| (wp.address(), wp.kind(), wp.width()));
    let Some((address, kind, width)) = key else {
        return Err(Error::HwSlotNotFound);
    };
    match table.find(address, kind, width) {
        Some(found) => {
            table.remove(found);
            Ok(())
        }
        None => Err(Error::HwSlotNotFound),
    }
}

/// Short-circuits if already enabled; otherwise exchanges an `Enable`
/// request and updates `enabled` iff the monitor reported success.
pub fn enable(id: WatchpointId) -> Result<()> {
    let ctx = Context::get()?;
    let (address, kind, width, already) = {
        let table = ctx.table.lock().expect("watchpoint table poisoned");
        let wp = table.get(id).ok_or(Error::HwSlotNotFound)?;
        (wp.address(), wp.kind(), wp.width(), wp.enabled())
    };
    if already {
        return Ok(());
    }

    let request = Request::new(crate::protocol::Operation::Enable, address, kind, width, true);
    let response = exchange(&request)?;
    let result = response.result().into_result();

    if result.is_ok() {
        let mut table = ctx.table.lock().expect("watchpoint table poisoned");
        if let Some(wp) = table.get_mut(id) {
            wp.enabled = true;
        }
    }
    result
}

/// Short-circuits if already disabled; otherwise exchanges a `Disable`
/// request and clears `enabled` iff the monitor reported success.
pub fn disable(id: WatchpointId) -> Result<()> {
    let ctx = Context::get()?;
    let (address, kind, width, already) = {
        let table = ctx.table.lock().expect("watchpoint table poisoned");
        let wp = table.get(id).ok_or(Error::HwSlotNotFound)?;
        (wp.address(), wp.kind(), wp.width(), !wp.enabled())
    };
    if already {
        return Ok(());
    }

    let request = Request::new(crate::protocol::Operation::Disable, address, kind, width, true);
    let response = exchange(&request)?;
    let result = response.result().into_result();

    if result.is_ok() {
        let mut table = ctx.table.lock().expect("watchpoint table poisoned");
        if let Some(wp) = table.get_mut(id) {
            wp.enabled = false;
        }
    }
    result
}

/// Sends one `DisableAll` request; on success, clears every `enabled`
/// flag in the table.
pub fn disable_all() -> Result<()> {
    let ctx = Context::get()?;
    let response = exchange(&Request::disable_all())?;
    let result = response.result().into_result();
    if result.is_ok() {
        let mut table = ctx.table.lock().expect("watchpoint table poisoned");
        for (_, wp) in table.iter_mut() {
            wp.enabled = false;
        }
    }
    result
}

/// `spec.md` §4.C.1 — one blocking, strictly serial request/reply. May be
/// called from ordinary inferior code or from inside the `SIGTRAP`
/// handler. Ordinary callers go through [`exchange`], which masks
/// `SIGTRAP` for the duration (see module docs on the re-entrancy
/// hazard); the handler itself calls [`raw_exchange`] directly since it
/// is already running with `SIGTRAP` blocked by the kernel's default
/// signal-delivery semantics.
fn exchange(request: &Request) -> Result<Response> {
    let mut trap_set = SigSet::empty();
    trap_set.add(Signal::SIGTRAP);
    let mut old_set = SigSet::empty();
    signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&trap_set), Some(&mut old_set))
        .map_err(Error::from)?;

    let result = raw_exchange(request);

    let _ = signal::pthread_sigmask(signal::SigmaskHow::SIG_SETMASK, Some(&old_set), None);

    result
}

fn raw_exchange(request: &Request) -> Result<Response> {
    let ctx = Context::get()?;

    if write_record(ctx.request_write, request).is_err() {
        tracing::error!(
            monitor = %ctx.monitor_pid(),
            inferior = %ctx.inferior_pid(),
            process = ctx.process_name(),
            "failed to write request to monitor"
        );
        return Err(Error::MonitorCommFailure);
    }

    match read_record::<Response>(ctx.response_read) {
        Ok(Some(response)) => Ok(response),
        Ok(None) | Err(_) => {
            tracing::error!(
                monitor = %ctx.monitor_pid(),
                inferior = %ctx.inferior_pid(),
                "failed to read response from monitor"
            );
            Err(Error::MonitorCommFailure)
        }
    }
}

extern "C" fn on_sigtrap(_signum: libc::c_int) {
    let response = match raw_exchange(&Request::get_triggered()) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("SIGTRAP handler: GET-TRIGGERED exchange failed");
            return;
        }
    };

    if response.result() == ResponseResult::NoTrigger {
        tracing::debug!("SIGTRAP not caused by a watchpoint this subsystem programmed");
        return;
    }
    if response.result().into_result().is_err() {
        tracing::warn!("SIGTRAP handler: monitor reported {:?}", response.result());
        return;
    }

    let Ok(ctx) = Context::get() else {
        return;
    };
    let Ok(table) = ctx.table.try_lock() else {
        tracing::warn!("SIGTRAP handler: watchpoint table busy, dropping trigger");
        return;
    };

    match table.find(response.address(), response.kind(), response.width()) {
        Some(id) => {
            // Copy the record out before dropping the lock: the callback
            // must not re-enter the table while holding it, and must run
            // without the lock held since it may itself call back into
            // this module (e.g. `disable`).
            if let Some(wp) = table.get(id).copied() {
                drop(table);
                (wp.callback)(id, &wp);
            }
        }
        None => {
            tracing::warn!(
                "SIGTRAP handler: no watchpoint matches ({:#x}, {:?}, {:?})",
                response.address(),
                response.kind(),
                response.width()
            );
        }
    }
}

/// Installs the `SIGTRAP` handler. Called once, from the inferior side of
/// [`crate::bootstrap::start_monitor`].
pub(crate) fn install_sigtrap_handler() -> Result<()> {
    let handler = SigHandler::Handler(on_sigtrap);
    // SAFETY: `on_sigtrap` only performs the documented signal-safe
    // exchange and an optional user callback, per the contract in
    // `SPEC_FULL.md` §4.C.2.
    unsafe {
        signal::signal(Signal::SIGTRAP, handler).map_err(Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-wide Context is a singleton shared by every test in this
    // binary; only assert on its absence if no other test has installed it.
    #[test]
    fn operations_fail_before_context_is_installed() {
        if crate::context::is_installed() {
            return;
        }
        assert_eq!(find(0x1000, WatchKind::Write, WatchWidth::One, false), None);
        assert!(matches!(
            enable(WatchpointId(0)),
            Err(Error::ContextNotFound)
        ));
        assert!(matches!(
            disable_all(),
            Err(Error::ContextNotFound)
        ));
    }
}
