//! Trace sinks: the entry points called from instrumented code.
//!
//! Instrumentation (a sancov-style pass, a hand-rolled harness, or manual
//! annotation) calls one of these once per basic block or comparison.  The
//! sinks must cost almost nothing while coverage is off and must be safe
//! to call from any task at any time, so they take no locks: the per-task
//! mode word is read with acquire ordering, buffer bounds are enforced
//! with plain arithmetic, and a record that does not fit is silently
//! dropped.
//!
//! Calls made in interrupt context (see [`InterruptScope`]) never record —
//! coverage is a function of the task's own work, and handler code that
//! preempts it must not pollute the buffer.
//!
//! Rust offers no portable way to read the caller's return address, so
//! every sink takes the instruction pointer (or any stable site
//! identifier) explicitly from the instrumentation layer.
//!
//! [`InterruptScope`]: crate::task::InterruptScope

use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "comparisons")]
use taskcov_protocol::{cmp_size, CMP_CONST, WORDS_PER_CMP};

use crate::area;
use crate::descriptor::Mode;
use crate::task::{self, TaskSlot};

/// Runtime relocation base subtracted from every recorded PC.
static RELOCATION_BASE: AtomicUsize = AtomicUsize::new(0);

/// Register the load base of the instrumented image.
///
/// With ASLR/PIE the raw addresses differ from run to run; subtracting the
/// base makes the recorded PCs stable, which a fuzzer's corpus depends on.
/// Defaults to 0 (identity).
pub fn set_relocation_base(base: usize) {
    RELOCATION_BASE.store(base, Ordering::Relaxed);
}

#[inline]
fn canonicalize_ip(ip: usize) -> usize {
    ip.wrapping_sub(RELOCATION_BASE.load(Ordering::Relaxed))
}

#[inline]
fn check_mode(slot: &TaskSlot, needed: Mode) -> bool {
    // Interrupt-context work is never attributed to the task's session.
    if !slot.in_task() {
        return false;
    }
    // Pairs with the release store in TaskSlot::start: observing the
    // enabled mode implies observing the matching buffer pointers.
    slot.mode.load(Ordering::Acquire) == needed as u32
}

/// Record one basic-block hit at `ip` into the calling task's PC buffer.
///
/// No-op unless the task is attached in PC mode; silently drops the
/// record when the buffer is full.
#[inline]
pub fn record_pc(ip: usize) {
    let _ = task::with_current(|slot| {
        if !check_mode(slot, Mode::TracePc) {
            return;
        }
        let base = slot.area.get();
        let words = slot.words.get();
        let ip = canonicalize_ip(ip);
        unsafe {
            // Word 0 is the number of PCs that follow.  Wrapping add keeps
            // a consumer-corrupted count from panicking a sink; the bound
            // check below keeps every store inside the buffer either way.
            let pos = area::load_word(base, 0, Ordering::Relaxed).wrapping_add(1);
            if pos < words {
                area::store_word(base, pos, ip, Ordering::Relaxed);
                area::store_word(base, 0, pos, Ordering::Release);
            }
        }
    });
}

/// Append one comparison record to the calling task's CMP buffer.
#[cfg(feature = "comparisons")]
fn write_cmp_data(ty: u64, arg1: u64, arg2: u64, ip: usize) {
    let _ = task::with_current(|slot| {
        if !check_mode(slot, Mode::TraceCmp) {
            return;
        }
        let base = slot.area.get();
        let max_bytes = (slot.words.get() * taskcov_protocol::WORD_BYTES) as u64;
        let ip = canonicalize_ip(ip) as u64;
        unsafe {
            let count = area::load_u64(base, 0, Ordering::Relaxed);
            // Coarse guard first: a consumer-corrupted count large enough
            // to overflow the byte arithmetic must not reach it.
            if count >= max_bytes / 8 {
                return;
            }
            let start = 1 + count * WORDS_PER_CMP as u64;
            let end_bytes = (start + WORDS_PER_CMP as u64) * 8;
            if end_bytes <= max_bytes {
                let start = start as usize;
                area::store_u64(base, start, ty, Ordering::Relaxed);
                area::store_u64(base, start + 1, arg1, Ordering::Relaxed);
                area::store_u64(base, start + 2, arg2, Ordering::Relaxed);
                area::store_u64(base, start + 3, ip, Ordering::Relaxed);
                area::store_u64(base, 0, count + 1, Ordering::Release);
            }
        }
    });
}

/// Record an 8-bit comparison.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_cmp1(arg1: u8, arg2: u8, ip: usize) {
    write_cmp_data(cmp_size(0), arg1 as u64, arg2 as u64, ip);
}

/// Record a 16-bit comparison.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_cmp2(arg1: u16, arg2: u16, ip: usize) {
    write_cmp_data(cmp_size(1), arg1 as u64, arg2 as u64, ip);
}

/// Record a 32-bit comparison.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_cmp4(arg1: u32, arg2: u32, ip: usize) {
    write_cmp_data(cmp_size(2), arg1 as u64, arg2 as u64, ip);
}

/// Record a 64-bit comparison.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_cmp8(arg1: u64, arg2: u64, ip: usize) {
    write_cmp_data(cmp_size(3), arg1, arg2, ip);
}

/// Record an 8-bit comparison against a compile-time constant.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_const_cmp1(arg1: u8, arg2: u8, ip: usize) {
    write_cmp_data(cmp_size(0) | CMP_CONST, arg1 as u64, arg2 as u64, ip);
}

/// Record a 16-bit comparison against a compile-time constant.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_const_cmp2(arg1: u16, arg2: u16, ip: usize) {
    write_cmp_data(cmp_size(1) | CMP_CONST, arg1 as u64, arg2 as u64, ip);
}

/// Record a 32-bit comparison against a compile-time constant.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_const_cmp4(arg1: u32, arg2: u32, ip: usize) {
    write_cmp_data(cmp_size(2) | CMP_CONST, arg1 as u64, arg2 as u64, ip);
}

/// Record a 64-bit comparison against a compile-time constant.
#[cfg(feature = "comparisons")]
#[inline]
pub fn record_const_cmp8(arg1: u64, arg2: u64, ip: usize) {
    write_cmp_data(cmp_size(3) | CMP_CONST, arg1, arg2, ip);
}

/// Record a switch: one constant-comparison record per case label, with
/// the label as the first operand and the match value as the second.
///
/// `label_bits` is the declared width of the labels; anything outside
/// {8, 16, 32, 64} is silently ignored.
#[cfg(feature = "comparisons")]
pub fn record_switch(val: u64, label_bits: u32, labels: &[u64], ip: usize) {
    let width_log2 = match label_bits {
        8 => 0,
        16 => 1,
        32 => 2,
        64 => 3,
        _ => return,
    };
    let ty = cmp_size(width_log2) | CMP_CONST;
    for &label in labels {
        write_cmp_data(ty, label, val, ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The relocation base is process-global, so its behavior is exercised
    // in the dedicated integration binary (tests/relocation.rs) instead of
    // here, where it would race with concurrently running tests.

    #[test]
    fn sinks_are_noops_when_detached() {
        // No session attached on this thread: nothing to observe, nothing
        // to crash into.
        record_pc(0xdead);
        #[cfg(feature = "comparisons")]
        {
            record_cmp8(1, 2, 0xdead);
            record_switch(3, 16, &[1, 2, 3], 0xdead);
            record_switch(3, 12, &[1, 2, 3], 0xdead);
        }
    }
}
