//! The crash-diagnostic facility (`SPEC_FULL.md` §4.E).
//!
//! A peer feature to the watchpoint core: it shares the same
//! `sigaction`-based signal-handling infrastructure but is not part of
//! the watchpoint core's own state. `install_crash_handler` only ever
//! touches `SIGSEGV`/`SIGILL`/`SIGFPE`/`SIGBUS`; it never installs or
//! removes the `SIGTRAP`/`SIGCHLD` handlers the core owns.
//!
//! Grounded on `examples/other_examples/cae70745_..._hardware_bp.rs.rs`'s
//! `sigsegv_handler`, which reads `ucontext_t.uc_mcontext.gregs[REG_RIP]`
//! the same way, extended here to the full register bank, a bounded
//! backtrace, a stack dump, and fault-class decoding (`print_fault`/
//! `print_error` in `examples/original_source/src/dyndbg_crash.c`).

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// A read/write view onto the interrupted register context, handed to a
/// crash callback so it can, for example, advance `RIP` past a bad
/// instruction before returning (`spec.md` §4.E).
pub struct CrashContext {
    ucontext: *mut libc::ucontext_t,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl CrashContext {
    /// Current value of `RIP` in the interrupted frame.
    pub fn instruction_pointer(&self) -> u64 {
        unsafe { (*self.ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as u64 }
    }

    /// Overwrites `RIP` in the interrupted frame. Takes effect when the
    /// signal handler returns and the kernel restores the context.
    pub fn set_instruction_pointer(&self, rip: u64) {
        unsafe {
            (*self.ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] = rip as i64;
        }
    }

    fn reg(&self, index: usize) -> i64 {
        unsafe { (*self.ucontext).uc_mcontext.gregs[index] }
    }
}

/// A user callback invoked after the fault is printed. If installed, the
/// handler returns after calling it, allowing the repaired context to
/// resume; if none is installed, the process exits with a nonzero code
/// (`spec.md` §4.E).
pub type CrashCallback = fn(signal: i32, ctx: &CrashContext);

static CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Installs a `sigaction` for `SIGSEGV`, `SIGILL`, `SIGFPE`, and `SIGBUS`
/// using the three-argument form so the signal context is available, and
/// records `cb` (if any) to be invoked after the fault is printed.
pub fn install_crash_handler(cb: Option<CrashCallback>) -> Result<()> {
    CALLBACK.store(cb.map_or(0, |f| f as usize), Ordering::SeqCst);

    for &signum in &[libc::SIGSEGV, libc::SIGILL, libc::SIGFPE, libc::SIGBUS] {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_fault as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::from(nix::errno::Errno::last()));
            }
        }
    }
    Ok(())
}

fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGBUS => "SIGBUS",
        _ => "UNKNOWN",
    }
}

/// x86 trap numbers as delivered in `gregs[REG_TRAPNO]`, matching the
/// original's `enum X86_TRAPNO` (`dyndbg_crash.c`).
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod trapno {
    pub const DIVIDE_BY_ZERO: i64 = 0x0;
    pub const ILLEGAL_INSTRUCTION: i64 = 0x6;
    pub const PAGE_FAULT: i64 = 0xe;
    pub const ALIGNMENT_CHECK: i64 = 0x11;
}

/// Page-fault error-code bits as delivered in `gregs[REG_ERR]`, matching
/// the original's `enum X86_ERROR_BITS`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod fault_error {
    pub const PAGE_PRESENT: i64 = 1 << 0;
    pub const WRITE: i64 = 1 << 1;
    pub const RESERVED_WRITE: i64 = 1 << 3;
    pub const INSTRUCTION_FETCH: i64 = 1 << 4;
}

/// Formats a page-fault error code as a comma-separated list of access
/// kinds, the way the original's `print_error` does.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn format_page_fault_error(error: i64) -> String {
    let mut parts = Vec::new();
    if error & fault_error::PAGE_PRESENT != 0 {
        parts.push("page violation");
    }
    if error & fault_error::WRITE != 0 {
        parts.push("write access");
    } else {
        parts.push("read access");
    }
    if error & fault_error::RESERVED_WRITE != 0 {
        parts.push("reserved write access");
    }
    if error & fault_error::INSTRUCTION_FETCH != 0 {
        parts.push("instruction fetch");
    }
    parts.join(", ")
}

/// Decodes and prints the fault class and addressing info from the
/// architectural trap number and error code (`spec.md` §4.E), matching
/// the original's `print_fault`/`print_error`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn print_fault(fault_addr: *mut c_void, ctx: &CrashContext) {
    let rip = ctx.reg(libc::REG_RIP as usize);
    match ctx.reg(libc::REG_TRAPNO as usize) {
        trapno::DIVIDE_BY_ZERO => {
            eprintln!("division by 0 caught at instruction {rip:#018x}");
        }
        trapno::ILLEGAL_INSTRUCTION => {
            eprintln!("illegal instruction caught at instruction {rip:#018x}");
        }
        trapno::PAGE_FAULT => {
            eprintln!(
                "page fault ({}) accessing {:?} caught at {:#018x}",
                format_page_fault_error(ctx.reg(libc::REG_ERR as usize)),
                fault_addr,
                rip
            );
        }
        trapno::ALIGNMENT_CHECK => {
            eprintln!("alignment check caught at instruction {rip:#018x}");
        }
        other => {
            eprintln!("trap {other:#x} caught at instruction {rip:#018x}");
        }
    }
}

/// Clears `EFLAGS.AC` (bit 18) in the interrupted frame so the handler's
/// own prints cannot re-fault on an unaligned access while `AC` is set;
/// the kernel's `sigreturn` restores the original flags from the saved
/// frame regardless of what this handler does, so no explicit restore is
/// needed (`spec.md` §4.E).
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn clear_alignment_check(ctx: &CrashContext) {
    const EFL_AC: i64 = 1 << 18;
    let eflags = ctx.reg(libc::REG_EFL as usize);
    unsafe {
        (*ctx.ucontext).uc_mcontext.gregs[libc::REG_EFL as usize] = eflags & !EFL_AC;
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn print_registers(ctx: &CrashContext) {
    eprintln!("register dump:");
    eprintln!("  rip={:#018x} rsp={:#018x} rbp={:#018x}",
        ctx.reg(libc::REG_RIP as usize),
        ctx.reg(libc::REG_RSP as usize),
        ctx.reg(libc::REG_RBP as usize));
    eprintln!("  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        ctx.reg(libc::REG_RAX as usize),
        ctx.reg(libc::REG_RBX as usize),
        ctx.reg(libc::REG_RCX as usize),
        ctx.reg(libc::REG_RDX as usize));
    eprintln!("  rsi={:#018x} rdi={:#018x} eflags={:#018x}",
        ctx.reg(libc::REG_RSI as usize),
        ctx.reg(libc::REG_RDI as usize),
        ctx.reg(libc::REG_EFL as usize));
}

/// Captures a backtrace and prints it, skipping the two innermost frames
/// (this crate's own signal-trampoline frames), per `spec.md` §4.E.
fn print_backtrace() {
    eprintln!("backtrace:");
    let bt = backtrace::Backtrace::new();
    for frame in bt.frames().iter().skip(2) {
        for symbol in frame.symbols() {
            let name = symbol
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            eprintln!("  {:#018x} {}", frame.ip() as usize, name);
        }
    }
}

/// Bounded stack dump from `RSP` to `RBP`, capped at 4 KiB so a corrupted
/// frame pointer cannot make this handler itself run away
/// (`spec.md` §4.E: "a partial stack dump ... bounded by a fixed byte
/// budget").
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn print_stack(ctx: &CrashContext) {
    const MAX_BYTES: usize = 4096;
    let rsp = ctx.reg(libc::REG_RSP as usize) as usize;
    let rbp = ctx.reg(libc::REG_RBP as usize) as usize;
    if rbp < rsp || rbp - rsp > MAX_BYTES {
        eprintln!("stack dump: skipped (rsp/rbp out of range)");
        return;
    }
    eprintln!("stack dump ({:#x}..{:#x}):", rsp, rbp);
    let len = rbp - rsp;
    let bytes = unsafe { std::slice::from_raw_parts(rsp as *const u8, len) };
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        eprintln!("  {}", hex.join(" "));
    }
}

extern "C" fn on_fault(signum: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let ctx = CrashContext {
        ucontext: ucontext as *mut libc::ucontext_t,
    };

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        if signum == libc::SIGBUS {
            clear_alignment_check(&ctx);
        }

        eprintln!("--- dyndbg crash handler: {} ---", signal_name(signum));
        // SAFETY: `info` is the non-null `siginfo_t*` the kernel passed to
        // this `SA_SIGINFO` handler; `si_addr` is valid to read for every
        // signal this handler is installed for.
        let fault_addr = unsafe { (*info).si_addr() };
        print_fault(fault_addr, &ctx);
        print_registers(&ctx);
        print_backtrace();
        print_stack(&ctx);
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    let _ = info;

    let ptr = CALLBACK.load(Ordering::SeqCst);
    if ptr != 0 {
        // SAFETY: `ptr` was stored from a real `CrashCallback` value in
        // `install_crash_handler` and never mutated except by another
        // call to that function with a value of the same type.
        let callback: CrashCallback = unsafe { std::mem::transmute::<usize, CrashCallback>(ptr) };
        callback(signum, &ctx);
        // Returning here lets the kernel resume at (possibly repaired) RIP.
    } else {
        unsafe { libc::_exit(1) };
    }
}
