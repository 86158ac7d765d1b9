//! Coverage buffers and the consumer-side view.
//!
//! Three kinds of memory live here:
//!
//! - [`CoverArea`] — the session's shared buffer: a page-backed anonymous
//!   shared mapping, writable by the recording side and readable by any
//!   number of [`CoverView`]s without further calls into the facility.
//! - [`ScratchArea`] — a private heap buffer backing one remote collection
//!   window; its records are merged into a `CoverArea` when the window
//!   closes.
//! - [`CoverView`] — the consumer handle returned by `Session::map`.
//!
//! All access to words that can be observed concurrently goes through
//! atomic references formed over the raw base pointer.  Record words use
//! relaxed ordering; the count word at position 0 is published with release
//! stores and read with acquire loads, which is what makes records visible
//! to a consumer that observed the count.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use taskcov_protocol::{CmpRecord, WORDS_PER_CMP, WORD_BYTES};

use crate::descriptor::SessionShared;
use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════
//  Raw word access
// ═══════════════════════════════════════════════════════════════════════

/// Load the machine word at word index `idx`.
///
/// # Safety
///
/// `base` must point at least `(idx + 1) * WORD_BYTES` bytes of live,
/// word-aligned buffer memory.
#[inline]
pub(crate) unsafe fn load_word(base: *const u8, idx: usize, order: Ordering) -> usize {
    (*(base as *const AtomicUsize).add(idx)).load(order)
}

/// Store the machine word at word index `idx`.
///
/// # Safety
///
/// Same bounds and alignment requirements as [`load_word`].
#[inline]
pub(crate) unsafe fn store_word(base: *mut u8, idx: usize, val: usize, order: Ordering) {
    (*(base as *const AtomicUsize).add(idx)).store(val, order);
}

/// Load the 64-bit word at 64-bit index `idx`.
///
/// # Safety
///
/// `base` must point at least `(idx + 1) * 8` bytes of live, 8-byte-aligned
/// buffer memory.
#[inline]
pub(crate) unsafe fn load_u64(base: *const u8, idx: usize, order: Ordering) -> u64 {
    (*(base as *const AtomicU64).add(idx)).load(order)
}

/// Store the 64-bit word at 64-bit index `idx`.
///
/// # Safety
///
/// Same bounds and alignment requirements as [`load_u64`].
#[inline]
pub(crate) unsafe fn store_u64(base: *mut u8, idx: usize, val: u64, order: Ordering) {
    (*(base as *const AtomicU64).add(idx)).store(val, order);
}

/// Word-wise copy into a buffer that may be concurrently read through a
/// [`CoverView`].  Offsets and length are in bytes and must all be word
/// multiples (they are: every count and entry size is a word multiple).
///
/// # Safety
///
/// Both regions must be live for the given ranges; the destination must be
/// word-aligned at `dst_off` and the source readable with no concurrent
/// writer.
pub(crate) unsafe fn copy_words(
    dst: *mut u8,
    dst_off: usize,
    src: *const u8,
    src_off: usize,
    bytes: usize,
) {
    debug_assert_eq!(dst_off % WORD_BYTES, 0);
    debug_assert_eq!(src_off % WORD_BYTES, 0);
    debug_assert_eq!(bytes % WORD_BYTES, 0);
    let dst_idx = dst_off / WORD_BYTES;
    for i in 0..bytes / WORD_BYTES {
        let val = (src.add(src_off + i * WORD_BYTES) as *const usize).read();
        store_word(dst, dst_idx + i, val, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  CoverArea — the session's shared buffer
// ═══════════════════════════════════════════════════════════════════════

/// Page-backed buffer shared between the recording side and its consumers.
///
/// Owned by the session; freed when the session's last reference drops.
/// Anonymous `MAP_SHARED` memory so the kernel zeroes it and a forked
/// harness still observes the same pages.
pub(crate) struct CoverArea {
    base: NonNull<u8>,
    bytes: usize,
}

// The raw base is only dereferenced through the atomic accessors above.
unsafe impl Send for CoverArea {}
unsafe impl Sync for CoverArea {}

impl CoverArea {
    /// Allocate a zeroed shared mapping of exactly `bytes` bytes.
    pub(crate) fn alloc(bytes: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::NoMemory);
        }
        match NonNull::new(ptr as *mut u8) {
            Some(base) => Ok(Self { base, bytes }),
            None => Err(Error::NoMemory),
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for CoverArea {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.bytes);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ScratchArea — remote-window buffer
// ═══════════════════════════════════════════════════════════════════════

/// Private buffer backing one remote collection window.
///
/// Lives on the registry's sized free-list between windows; only the
/// executor that popped it writes to it, so plain loads are fine on the
/// source side of a merge.
pub(crate) struct ScratchArea {
    base: NonNull<u8>,
    words: usize,
}

unsafe impl Send for ScratchArea {}

impl ScratchArea {
    /// Allocate a zeroed scratch buffer of `words` machine words.  Plain
    /// non-blocking heap allocation; returns `None` on failure because the
    /// remote-start path reports nothing.
    pub(crate) fn alloc(words: usize) -> Option<Self> {
        let layout = Self::layout(words)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|base| Self { base, words })
    }

    // 8-byte alignment regardless of the word size: CMP counts and records
    // are 64-bit even on 32-bit targets.
    fn layout(words: usize) -> Option<Layout> {
        Layout::from_size_align(words.checked_mul(WORD_BYTES)?, 8).ok()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub(crate) fn words(&self) -> usize {
        self.words
    }

    /// Zero the count word for a fresh window.  Stale record bytes beyond
    /// the count are left in place; the count bounds what a merge reads.
    pub(crate) fn reset_count(&self) {
        unsafe {
            store_u64(self.base(), 0, 0, Ordering::Relaxed);
        }
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        // The layout succeeded in alloc(), so it succeeds here too.
        if let Some(layout) = Self::layout(self.words) {
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  CoverView — consumer handle
// ═══════════════════════════════════════════════════════════════════════

/// Read side of a session's shared buffer.
///
/// Returned by `Session::map`.  Holds a reference on the session, so the
/// buffer stays alive (and readable) even after the control handle is
/// dropped.  Reads need no further calls into the facility and may run
/// concurrently with recording; a reader can observe records written
/// slightly ahead of the published count and must tolerate that.
#[derive(Clone)]
pub struct CoverView {
    _session: Arc<SessionShared>,
    base: *const u8,
    words: usize,
}

// The view only reads through atomic accessors, and the Arc keeps the
// mapping alive for as long as any clone of the view exists.
unsafe impl Send for CoverView {}
unsafe impl Sync for CoverView {}

impl CoverView {
    pub(crate) fn new(session: Arc<SessionShared>, base: *const u8, words: usize) -> Self {
        Self {
            _session: session,
            base,
            words,
        }
    }

    /// Buffer capacity in machine words (including the count word).
    pub fn words(&self) -> usize {
        self.words
    }

    /// The record count at word 0, as a machine word (PC layout).
    pub fn count(&self) -> usize {
        unsafe { load_word(self.base, 0, Ordering::Acquire) }
    }

    /// Read the machine word at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn load_word(&self, idx: usize) -> usize {
        assert!(idx < self.words, "word index {idx} out of bounds");
        unsafe { load_word(self.base, idx, Ordering::Relaxed) }
    }

    /// Read the 64-bit word at `idx` (CMP layout).
    ///
    /// # Panics
    ///
    /// Panics if the word lies outside the buffer.
    pub fn load_u64(&self, idx: usize) -> u64 {
        assert!(
            (idx + 1) * 8 <= self.words * WORD_BYTES,
            "u64 index {idx} out of bounds"
        );
        unsafe { load_u64(self.base, idx, Ordering::Relaxed) }
    }

    /// Drain-style read of a PC buffer: the recorded PCs in order.
    pub fn read_pcs(&self) -> Vec<usize> {
        let count = self.count().min(self.words.saturating_sub(1));
        (1..=count).map(|i| self.load_word(i)).collect()
    }

    /// Drain-style read of a CMP buffer: the recorded comparison records
    /// in order.
    pub fn read_cmps(&self) -> Vec<CmpRecord> {
        let count = unsafe { load_u64(self.base, 0, Ordering::Acquire) } as usize;
        let capacity = (self.words * WORD_BYTES).saturating_sub(8) / (8 * WORDS_PER_CMP);
        (0..count.min(capacity))
            .map(|i| {
                let at = 1 + i * WORDS_PER_CMP;
                CmpRecord {
                    ty: self.load_u64(at),
                    arg1: self.load_u64(at + 1),
                    arg2: self.load_u64(at + 2),
                    ip: self.load_u64(at + 3),
                }
            })
            .collect()
    }

    /// Reset the count word to zero so the buffer can be reused for the
    /// next run.  Records beyond the count are left in place.
    pub fn reset(&self) {
        unsafe {
            store_u64(self.base as *mut u8, 0, 0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_area_allocates_zeroed() {
        let area = CoverArea::alloc(4 * WORD_BYTES).unwrap();
        for i in 0..4 {
            assert_eq!(unsafe { load_word(area.base(), i, Ordering::Relaxed) }, 0);
        }
    }

    #[test]
    fn scratch_allocates_zeroed_and_resets() {
        let scratch = ScratchArea::alloc(8).unwrap();
        assert_eq!(scratch.words(), 8);
        unsafe {
            store_u64(scratch.base(), 0, 42, Ordering::Relaxed);
        }
        scratch.reset_count();
        assert_eq!(unsafe { load_u64(scratch.base(), 0, Ordering::Relaxed) }, 0);
    }

    #[test]
    fn copy_words_moves_record_region() {
        let dst = CoverArea::alloc(8 * WORD_BYTES).unwrap();
        let src = ScratchArea::alloc(8).unwrap();
        unsafe {
            store_word(src.base(), 1, 0xAA, Ordering::Relaxed);
            store_word(src.base(), 2, 0xBB, Ordering::Relaxed);
            copy_words(dst.base(), WORD_BYTES, src.base(), WORD_BYTES, 2 * WORD_BYTES);
            assert_eq!(load_word(dst.base(), 1, Ordering::Relaxed), 0xAA);
            assert_eq!(load_word(dst.base(), 2, Ordering::Relaxed), 0xBB);
        }
    }
}
