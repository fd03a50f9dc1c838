//! The watchpoint data model (`SPEC_FULL.md` §3).
//!
//! The reference keeps watchpoints as nodes in a caller-owned intrusive
//! list. This crate instead keeps a flat table owned by the [`crate::Context`]
//! and hands callers a small `Copy` [`WatchpointId`] — the "safer strategy"
//! `spec.md` §9 calls out as preferable to caller-owned nodes.

use std::fmt;

/// What kind of access should trigger the watchpoint.
///
/// The discriminant values are a bit-exact contract: they are written
/// straight into the DR7 `R/Wi` field (`SPEC_FULL.md` / `spec.md` §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WatchKind {
    /// Trigger only when the CPU fetches an instruction at the address.
    Execute = 0b00,
    /// Trigger only on a data write to the address.
    Write = 0b01,
    /// Trigger on I/O port read/write (reserved by the CPU; accepted here
    /// for bit-layout completeness, not exercised by the public API).
    IoReadWrite = 0b10,
    /// Trigger on either a data read or a data write to the address.
    ReadWrite = 0b11,
}

impl WatchKind {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => WatchKind::Execute,
            0b01 => WatchKind::Write,
            0b10 => WatchKind::IoReadWrite,
            _ => WatchKind::ReadWrite,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        self as u8
    }
}

/// The width, in bytes, of the memory region being watched.
///
/// Per the Intel SDM's DR7 `LENi` table, `Eight` sorts between `Two` and
/// `Four` in the two-bit encoding — `spec.md` §3 flags this explicitly, so
/// the encoding below is not reordered to look tidier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WatchWidth {
    /// One byte.
    One = 0b00,
    /// Two bytes.
    Two = 0b01,
    /// Eight bytes.
    Eight = 0b10,
    /// Four bytes.
    Four = 0b11,
}

impl WatchWidth {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => WatchWidth::One,
            0b01 => WatchWidth::Two,
            0b10 => WatchWidth::Eight,
            _ => WatchWidth::Four,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        self as u8
    }

    /// The width in bytes, for callers that want to reason about memory
    /// ranges rather than the raw DR7 encoding.
    pub fn len_bytes(self) -> usize {
        match self {
            WatchWidth::One => 1,
            WatchWidth::Two => 2,
            WatchWidth::Eight => 8,
            WatchWidth::Four => 4,
        }
    }
}

/// A stable handle to a watchpoint registered with [`crate::add`].
///
/// This is the Rust-native replacement for the reference's caller-owned
/// `*mut Breakpoint`: an index into the process-wide watchpoint table,
/// `Copy` and safe to hold past the lifetime of any particular borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchpointId(pub(crate) usize);

impl fmt::Display for WatchpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watchpoint#{}", self.0)
    }
}

/// A function pointer invoked on the signaling thread when a watchpoint
/// fires. Must be signal-async-safe (`SPEC_FULL.md` §4.C.2): no
/// allocation, no locking beyond what the crate itself performs, no
/// blocking I/O other than the monitor exchange the trap handler itself
/// performs.
pub type WatchpointCallback = fn(WatchpointId, &Watchpoint);

/// One entry in the watchpoint table (`spec.md` §3).
#[derive(Clone, Copy)]
pub struct Watchpoint {
    pub(crate) address: usize,
    pub(crate) kind: WatchKind,
    pub(crate) width: WatchWidth,
    pub(crate) hw: bool,
    pub(crate) enabled: bool,
    pub(crate) callback: WatchpointCallback,
    pub(crate) callback_arg: usize,
}

impl Watchpoint {
    /// The address being watched, in the inferior's own address space.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The access kind that triggers the watchpoint.
    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// The width, in bytes, of the watched region.
    pub fn width(&self) -> WatchWidth {
        self.width
    }

    /// Whether this watchpoint currently occupies a hardware slot.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The opaque context value passed to `add`, returned verbatim.
    pub fn callback_arg(&self) -> usize {
        self.callback_arg
    }

    fn key(&self) -> (usize, WatchKind, WatchWidth) {
        (self.address, self.kind, self.width)
    }
}

/// The flat, context-owned table of watchpoints (`spec.md` §9's "safer
/// strategy"). Slots are reused: `remove` leaves a hole that the next
/// `add` may reclaim, keeping `WatchpointId` values stable for the
/// lifetime of the entries they name.
#[derive(Default)]
pub struct WatchpointTable {
    entries: Vec<Option<Watchpoint>>,
}

impl WatchpointTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Linear scan for a live entry with this `(address, kind, width)`
    /// triple — the uniqueness check the spec requires on `add`, and the
    /// lookup `find` and the `SIGTRAP` handler both rely on.
    pub(crate) fn find(
        &self,
        address: usize,
        kind: WatchKind,
        width: WatchWidth,
    ) -> Option<WatchpointId> {
        self.entries.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|wp| wp.key() == (address, kind, width))
                .map(|_| WatchpointId(i))
        })
    }

    pub(crate) fn insert(&mut self, wp: Watchpoint) -> WatchpointId {
        if let Some(hole) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[hole] = Some(wp);
            WatchpointId(hole)
        } else {
            self.entries.push(Some(wp));
            WatchpointId(self.entries.len() - 1)
        }
    }

    pub(crate) fn get(&self, id: WatchpointId) -> Option<&Watchpoint> {
        self.entries.get(id.0).and_then(|e| e.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: WatchpointId) -> Option<&mut Watchpoint> {
        self.entries.get_mut(id.0).and_then(|e| e.as_mut())
    }

    pub(crate) fn remove(&mut self, id: WatchpointId) -> Option<Watchpoint> {
        self.entries.get_mut(id.0).and_then(|e| e.take())
    }

    /// Number of live (not necessarily enabled) watchpoints. Used by tests
    /// asserting the uniqueness invariant.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Number of live, enabled watchpoints — should always equal the
    /// popcount of `L0..L3` in DR7 (`spec.md` §8, "Slot allocation").
    pub(crate) fn enabled_count(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref())
            .filter(|wp| wp.enabled)
            .count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (WatchpointId, &Watchpoint)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|wp| (WatchpointId(i), wp)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (WatchpointId, &mut Watchpoint)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|wp| (WatchpointId(i), wp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(_id: WatchpointId, _wp: &Watchpoint) {}

    fn wp(address: usize, kind: WatchKind, width: WatchWidth) -> Watchpoint {
        Watchpoint {
            address,
            kind,
            width,
            hw: true,
            enabled: false,
            callback: cb,
            callback_arg: 0,
        }
    }

    #[test]
    fn width_encoding_matches_dr7_len_table() {
        // Eight sorts between Two and Four per the Intel LENi table.
        assert_eq!(WatchWidth::One.bits(), 0b00);
        assert_eq!(WatchWidth::Two.bits(), 0b01);
        assert_eq!(WatchWidth::Eight.bits(), 0b10);
        assert_eq!(WatchWidth::Four.bits(), 0b11);
    }

    #[test]
    fn table_reuses_holes_left_by_remove() {
        let mut table = WatchpointTable::new();
        let a = table.insert(wp(0x1000, WatchKind::Write, WatchWidth::One));
        let b = table.insert(wp(0x2000, WatchKind::Write, WatchWidth::One));
        table.remove(a);
        let c = table.insert(wp(0x3000, WatchKind::Write, WatchWidth::One));
        assert_eq!(c, a);
        assert_eq!(table.len(), 2);
        assert!(table.get(b).is_some());
    }

    #[test]
    fn enabled_count_only_counts_enabled_entries() {
        // Mirrors `spec.md` §8's "slot allocation" property: the table's
        // enabled count must always equal the popcount of `L0..L3` in DR7.
        let mut table = WatchpointTable::new();
        let a = table.insert(wp(0x1000, WatchKind::Write, WatchWidth::One));
        let b = table.insert(wp(0x2000, WatchKind::Write, WatchWidth::One));
        assert_eq!(table.enabled_count(), 0);
        table.get_mut(a).unwrap().enabled = true;
        assert_eq!(table.enabled_count(), 1);
        table.get_mut(b).unwrap().enabled = true;
        assert_eq!(table.enabled_count(), 2);
    }

    #[test]
    fn find_only_matches_live_entries() {
        let mut table = WatchpointTable::new();
        let a = table.insert(wp(0x1000, WatchKind::Write, WatchWidth::One));
        assert_eq!(
            table.find(0x1000, WatchKind::Write, WatchWidth::One),
            Some(a)
        );
        table.remove(a);
        assert_eq!(table.find(0x1000, WatchKind::Write, WatchWidth::One), None);
    }
}
