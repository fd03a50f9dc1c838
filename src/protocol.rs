//! Wire records exchanged between the inferior and the monitor over the
//! two anonymous pipes (`SPEC_FULL.md` §6, "Wire formats").
//!
//! Both sides run the same binary in the same address space layout (one
//! is a `fork()` of the other), so there is no endianness or alignment
//! negotiation: the fixed `#[repr(C)]` struct size *is* the frame, exactly
//! as `spec.md` specifies.

use std::io;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::watchpoint::{WatchKind, WatchWidth};

/// The operation tag carried by a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    /// Program one free hardware slot with `(address, kind, width)`.
    Enable = 0,
    /// Clear the slot matching `(address, kind, width)`.
    Disable = 1,
    /// Clear every slot unconditionally.
    DisableAll = 2,
    /// Ask which slot fired on the most recent debug exception.
    GetTriggered = 3,
}

impl Operation {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Operation::Enable),
            1 => Some(Operation::Disable),
            2 => Some(Operation::DisableAll),
            3 => Some(Operation::GetTriggered),
            _ => None,
        }
    }
}

/// One request record, written by the inferior and read by the monitor.
///
/// `address`/`kind`/`width`/`hw` are only meaningful for `Enable` and
/// `Disable`; `DisableAll` and `GetTriggered` ignore them.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Request {
    op: u32,
    address: u64,
    kind: u8,
    width: u8,
    hw: u8,
    _pad: u8,
}

impl Request {
    pub fn new(op: Operation, address: usize, kind: WatchKind, width: WatchWidth, hw: bool) -> Self {
        Request {
            op: op as u32,
            address: address as u64,
            kind: kind.bits(),
            width: width.bits(),
            hw: hw as u8,
            _pad: 0,
        }
    }

    pub fn disable_all() -> Self {
        Request {
            op: Operation::DisableAll as u32,
            address: 0,
            kind: 0,
            width: 0,
            hw: 0,
            _pad: 0,
        }
    }

    pub fn get_triggered() -> Self {
        Request {
            op: Operation::GetTriggered as u32,
            address: 0,
            kind: 0,
            width: 0,
            hw: 0,
            _pad: 0,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u32(self.op)
    }

    pub fn address(&self) -> usize {
        self.address as usize
    }

    pub fn kind(&self) -> WatchKind {
        WatchKind::from_bits(self.kind)
    }

    pub fn width(&self) -> WatchWidth {
        WatchWidth::from_bits(self.width)
    }

    pub fn hw(&self) -> bool {
        self.hw != 0
    }
}

/// Numeric result code carried in a [`Response`]. Mirrors [`crate::Error`]
/// closely enough to round-trip the common cases across the pipe; anything
/// not listed collapses to `unknown(errno)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseResult {
    /// The operation completed.
    Success,
    /// No free hardware slot was available for `Enable`.
    AllHwSlotsBusy,
    /// `Disable` found no slot matching the requested triple.
    HwSlotNotFound,
    /// The monitor did not recognize the request's operation tag.
    RequestUnknown,
    /// `GetTriggered` ran, but no `Bi` bit was set in DR6 — the trap was
    /// not caused by a watchpoint this subsystem programmed.
    /// `spec.md` §9 flags the reference leaves this case's result
    /// uninitialized; this crate gives it an explicit "no trigger" kind
    /// rather than reusing `Success` or a zero value.
    NoTrigger,
    /// A kernel call inside the monitor failed; the wrapped value is the
    /// raw errno so the inferior can still report something specific.
    Unknown(i32),
}

impl ResponseResult {
    fn to_wire(self) -> (u32, i32) {
        match self {
            ResponseResult::Success => (0, 0),
            ResponseResult::AllHwSlotsBusy => (1, 0),
            ResponseResult::HwSlotNotFound => (2, 0),
            ResponseResult::RequestUnknown => (3, 0),
            ResponseResult::NoTrigger => (4, 0),
            ResponseResult::Unknown(errno) => (5, errno),
        }
    }

    fn from_wire(tag: u32, errno: i32) -> Self {
        match tag {
            0 => ResponseResult::Success,
            1 => ResponseResult::AllHwSlotsBusy,
            2 => ResponseResult::HwSlotNotFound,
            3 => ResponseResult::RequestUnknown,
            4 => ResponseResult::NoTrigger,
            _ => ResponseResult::Unknown(errno),
        }
    }

    /// Converts the wire result into the crate's [`Error`] taxonomy;
    /// `Success` and `NoTrigger` are not errors and map to `Ok`.
    pub fn into_result(self) -> Result<()> {
        match self {
            ResponseResult::Success | ResponseResult::NoTrigger => Ok(()),
            ResponseResult::AllHwSlotsBusy => Err(Error::AllHwSlotsBusy),
            ResponseResult::HwSlotNotFound => Err(Error::HwSlotNotFound),
            ResponseResult::RequestUnknown => Err(Error::MonitorRequestUnknown),
            ResponseResult::Unknown(errno) => Err(Error::from_errno(errno)),
        }
    }
}

/// One response record, written by the monitor and read by the inferior.
/// `address`/`kind`/`width`/`hw` are populated only for `GetTriggered`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Response {
    result_tag: u32,
    errno: i32,
    address: u64,
    kind: u8,
    width: u8,
    hw: u8,
    _pad: u8,
}

impl Response {
    pub fn simple(result: ResponseResult) -> Self {
        let (tag, errno) = result.to_wire();
        Response {
            result_tag: tag,
            errno,
            address: 0,
            kind: 0,
            width: 0,
            hw: 0,
            _pad: 0,
        }
    }

    pub fn triggered(address: usize, kind: WatchKind, width: WatchWidth) -> Self {
        Response {
            result_tag: 0,
            errno: 0,
            address: address as u64,
            kind: kind.bits(),
            width: width.bits(),
            hw: 1,
            _pad: 0,
        }
    }

    pub fn result(&self) -> ResponseResult {
        ResponseResult::from_wire(self.result_tag, self.errno)
    }

    pub fn address(&self) -> usize {
        self.address as usize
    }

    pub fn kind(&self) -> WatchKind {
        WatchKind::from_bits(self.kind)
    }

    pub fn width(&self) -> WatchWidth {
        WatchWidth::from_bits(self.width)
    }
}

/// Reads exactly `size_of::<T>()` bytes from `fd` into a `T`, or fails.
///
/// Returns `Ok(None)` on a clean end-of-file (zero bytes read) so callers
/// can distinguish "peer closed the pipe" from a short, corrupting read
/// of a partial record — `spec.md` §4.B: "A short read of nonzero length
/// is logged and skipped".
pub(crate) fn read_record<T: Copy>(fd: RawFd) -> io::Result<Option<T>> {
    let mut buf = vec![0u8; std::mem::size_of::<T>()];
    let mut read = 0;
    while read < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[read..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - read,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read of a fixed-size record",
            ));
        }
        read += n as usize;
    }
    // SAFETY: `T: Copy` and the buffer is exactly `size_of::<T>()` bytes,
    // freshly filled above; this mirrors the native-layout, no-framing
    // wire format `spec.md` §6 specifies for these local pipes.
    let value = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) };
    Ok(Some(value))
}

// The wire format *is* the struct layout (see module docs); pin both
// records' sizes so a future field addition cannot silently change the
// frame size one side expects without the other noticing at compile time.
static_assertions::assert_eq_size!(Request, [u8; 24]);
static_assertions::assert_eq_size!(Response, [u8; 24]);

/// Writes exactly `size_of::<T>()` bytes of `value` to `fd`.
pub(crate) fn write_record<T: Copy>(fd: RawFd, value: &T) -> io::Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    let mut written = 0;
    while written < bytes.len() {
        let n = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += n as usize;
    }
    Ok(())
}
