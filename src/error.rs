#![warn(missing_docs)]

/// The result type returned by every `dyndbg` operation.
pub type Result<T> = core::result::Result<T, Error>;

/// The error taxonomy for the watchpoint core (`SPEC_FULL.md` §7).
///
/// Kernel errors observed inside the monitor are folded into [`Error::Unknown`]
/// rather than discarded, so a caller can still inspect the originating
/// `errno` even though the monitor does not retry on them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The process-wide singleton context could not be created: the
    /// allocator, pipe creation, or `fork` failed during bootstrap.
    #[error("watchpoint context could not be created")]
    ContextNotFound,

    /// A null watchpoint handle was used, or `add` was called with a
    /// duplicate `(address, kind, width)` triple.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// All four hardware debug-address registers are already enabled.
    #[error("all four hardware breakpoint slots are busy")]
    AllHwSlotsBusy,

    /// Software breakpoints, or a watchpoint with no callback, were
    /// requested. Not implemented by this core (`spec.md` Non-goals).
    #[error("software breakpoints are not implemented")]
    SwNotImplemented,

    /// `remove`/`disable` was asked to operate on a watchpoint the monitor
    /// has no record of in any debug-register slot.
    #[error("no hardware slot matches this watchpoint")]
    HwSlotNotFound,

    /// A request/response exchange with the monitor failed: a short write
    /// of the request, a short read of the response, or the monitor's end
    /// of the pipe closed mid-exchange (`spec.md` §4.C.1, §7:
    /// `monitor-comm-failure`).
    #[error("communication with the monitor failed")]
    MonitorCommFailure,

    /// The monitor received a request tagged with an operation code it does
    /// not recognize.
    #[error("monitor received an unknown request")]
    MonitorRequestUnknown,

    /// A kernel call failed while installing a crash-handler `sigaction`.
    #[error("system call failed: {0}")]
    SystemError(#[from] nix::Error),

    /// A kernel error surfaced from the monitor whose errno did not map to
    /// a more specific variant above.
    #[error("unknown kernel error (errno {0})")]
    Unknown(i32),
}

impl Error {
    /// Maps a raw kernel errno, as observed inside the monitor, onto the
    /// result taxonomy. Used when converting a monitor-side [`nix::Error`]
    /// into the numeric code carried across the wire in a response record.
    ///
    /// `ESRCH` ("no such process") is deliberately *not* mapped to
    /// [`Error::HwSlotNotFound`] — that variant is reserved for `spec.md`
    /// §7's "remove/disable of an unknown watchpoint", an unrelated
    /// condition. A dying target surfaces as a plain [`Error::Unknown`]
    /// (or, around attach/detach, as no reply at all — see `monitor::handle`).
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Error::InvalidArgument("rejected by kernel"),
            other => Error::Unknown(other),
        }
    }
}
