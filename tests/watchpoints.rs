//! End-to-end watchpoint scenarios (`spec.md` §8).
//!
//! Each scenario forks a monitor via [`dyndbg::start_monitor`], which is
//! unsafe to do from inside the multi-threaded `cargo test` harness
//! process itself. Every `#[test]` below instead re-execs the test
//! binary filtered down to just itself, so the actual `fork()` only ever
//! happens in a freshly-started, single-threaded child process.

use std::env;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use dyndbg::{Error, WatchKind, WatchWidth, Watchpoint, WatchpointId};

const SUBPROCESS_ENV: &str = "DYNDBG_TEST_SUBPROCESS";

fn in_subprocess(name: &str) -> bool {
    env::var(SUBPROCESS_ENV).as_deref() == Ok(name)
}

/// Re-execs this test binary filtered to `name`, with `SUBPROCESS_ENV`
/// set so the child runs the scenario instead of recursing again.
fn run_as_subprocess(name: &str) {
    let exe = env::current_exe().expect("failed to resolve test binary path");
    let status = Command::new(exe)
        .args(["--exact", name, "--nocapture"])
        .env(SUBPROCESS_ENV, name)
        .status()
        .expect("failed to spawn subprocess for fork-based scenario");
    assert!(status.success(), "subprocess for {name} failed: {status}");
}

static HIT_COUNT: AtomicU32 = AtomicU32::new(0);

fn record_hit(_id: WatchpointId, _wp: &Watchpoint) {
    HIT_COUNT.fetch_add(1, Ordering::SeqCst);
}

fn reset_hits() {
    HIT_COUNT.store(0, Ordering::SeqCst);
}

fn hits() -> u32 {
    HIT_COUNT.load(Ordering::SeqCst)
}

#[test]
fn write_watchpoint_fires_exactly_on_store() {
    const NAME: &str = "write_watchpoint_fires_exactly_on_store";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    reset_hits();
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::Eight, record_hit, 0, true)
        .expect("failed to register write watchpoint");

    // A read must not trip a write-only watchpoint.
    let _ = unsafe { std::ptr::read_volatile(std::ptr::addr_of!(TARGET)) };
    assert_eq!(hits(), 0, "read triggered a write-only watchpoint");

    unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(TARGET), 42) };
    assert_eq!(hits(), 1, "store did not trigger the watchpoint exactly once");

    dyndbg::remove(id).expect("failed to remove watchpoint");
}

#[test]
fn readwrite_watchpoint_fires_on_read_and_write() {
    const NAME: &str = "readwrite_watchpoint_fires_on_read_and_write";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    reset_hits();
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::ReadWrite, WatchWidth::Eight, record_hit, 0, true)
        .expect("failed to register read/write watchpoint");

    let _ = unsafe { std::ptr::read_volatile(std::ptr::addr_of!(TARGET)) };
    assert_eq!(hits(), 1, "read did not trigger the watchpoint");

    unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(TARGET), 7) };
    assert_eq!(hits(), 2, "write did not trigger the watchpoint");

    dyndbg::remove(id).expect("failed to remove watchpoint");
}

#[test]
fn disable_suppresses_triggers_until_re_enabled() {
    const NAME: &str = "disable_suppresses_triggers_until_re_enabled";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    reset_hits();
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::Eight, record_hit, 0, true)
        .expect("failed to register watchpoint");

    dyndbg::disable(id).expect("failed to disable watchpoint");
    unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(TARGET), 1) };
    assert_eq!(hits(), 0, "a disabled watchpoint fired");

    dyndbg::enable(id).expect("failed to re-enable watchpoint");
    unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!(TARGET), 2) };
    assert_eq!(hits(), 1, "a re-enabled watchpoint did not fire");

    dyndbg::remove(id).expect("failed to remove watchpoint");
}

#[test]
fn remove_then_remove_again_fails() {
    const NAME: &str = "remove_then_remove_again_fails";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::One, record_hit, 0, true)
        .expect("failed to register watchpoint");

    dyndbg::remove(id).expect("first remove should succeed");

    let err = dyndbg::remove(id).expect_err("second remove of the same handle should fail");
    assert!(
        matches!(err, Error::HwSlotNotFound),
        "expected HwSlotNotFound, got {err:?}"
    );
}

#[test]
fn disabling_unknown_handle_fails() {
    const NAME: &str = "disabling_unknown_handle_fails";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::One, record_hit, 0, true)
        .expect("failed to register watchpoint");
    dyndbg::remove(id).expect("failed to remove watchpoint");

    let err = dyndbg::disable(id).expect_err("disabling a removed handle should fail");
    assert!(
        matches!(err, Error::HwSlotNotFound),
        "expected HwSlotNotFound, got {err:?}"
    );
}

#[test]
fn execute_watchpoint_fires_on_instruction_fetch() {
    const NAME: &str = "execute_watchpoint_fires_on_instruction_fetch";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    reset_hits();
    dyndbg::start_monitor().expect("failed to start monitor");

    // The execute watchpoint retriggers on every fetch of the same
    // instruction until it is cleared, so the callback disables it on
    // first fire to let the instruction actually retire afterwards.
    fn exec_hit(id: WatchpointId, _wp: &Watchpoint) {
        HIT_COUNT.fetch_add(1, Ordering::SeqCst);
        let _ = dyndbg::disable(id);
    }

    #[inline(never)]
    extern "C" fn watched_function() {
        std::hint::black_box(());
    }

    let addr = watched_function as usize;
    let id = dyndbg::add(addr, WatchKind::Execute, WatchWidth::One, exec_hit, 0, true)
        .expect("failed to register execute watchpoint");

    watched_function();
    assert_eq!(hits(), 1, "execute watchpoint did not fire exactly once");

    dyndbg::remove(id).expect("failed to remove watchpoint");
}

#[test]
fn add_rejects_duplicate_triple() {
    const NAME: &str = "add_rejects_duplicate_triple";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::Eight, record_hit, 0, true)
        .expect("failed to register watchpoint");

    let err = dyndbg::add(addr, WatchKind::Write, WatchWidth::Eight, record_hit, 0, true)
        .expect_err("duplicate (address, kind, width) should be rejected");
    assert!(matches!(err, Error::InvalidArgument(_)));

    dyndbg::remove(id).expect("failed to remove watchpoint");
}

#[test]
fn find_locates_a_live_watchpoint() {
    const NAME: &str = "find_locates_a_live_watchpoint";
    if !in_subprocess(NAME) {
        run_as_subprocess(NAME);
        return;
    }

    static mut TARGET: u64 = 0;
    dyndbg::start_monitor().expect("failed to start monitor");

    let addr = unsafe { std::ptr::addr_of!(TARGET) as usize };
    let id = dyndbg::add(addr, WatchKind::Write, WatchWidth::Eight, record_hit, 0, true)
        .expect("failed to register watchpoint");

    assert_eq!(
        dyndbg::find(addr, WatchKind::Write, WatchWidth::Eight, false),
        Some(id)
    );

    dyndbg::remove(id).expect("failed to remove watchpoint");
    assert_eq!(
        dyndbg::find(addr, WatchKind::Write, WatchWidth::Eight, false),
        None
    );
}
