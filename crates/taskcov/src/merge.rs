//! Moving remote-window records into a session's shared buffer.
//!
//! Called from `remote::stop` under the session lock, after the executor
//! has detached from the scratch buffer — so the source has no concurrent
//! writer, and the destination's only other writers (other closing
//! windows) are serialized by the same lock.  Consumers may read the
//! destination mid-merge and can observe record bytes before the count
//! update; they must tolerate that.

use std::sync::atomic::Ordering;

use taskcov_protocol::{WORDS_PER_CMP, WORD_BYTES};

use crate::area::{self, CoverArea, ScratchArea};
use crate::descriptor::Mode;
use crate::warn_once;

/// Append as many complete source records as fit into the destination's
/// remaining capacity; overflow is dropped.
///
/// Layout per mode: PC counts and records are one machine word each; CMP
/// counts are 64-bit and records are four 64-bit words.  All arithmetic is
/// in bytes, mirroring how the capacities were validated.
pub(crate) fn move_records(mode: Mode, dst: &CoverArea, dst_words: usize, src: &ScratchArea) {
    let word = WORD_BYTES as u64;
    let (dst_len, src_len, count_size, entry_size) = match mode {
        Mode::TracePc => unsafe {
            (
                area::load_word(dst.base(), 0, Ordering::Acquire) as u64,
                area::load_word(src.base(), 0, Ordering::Relaxed) as u64,
                word,
                word,
            )
        },
        Mode::TraceCmp => unsafe {
            (
                area::load_u64(dst.base(), 0, Ordering::Acquire),
                area::load_u64(src.base(), 0, Ordering::Relaxed),
                8,
                8 * WORDS_PER_CMP as u64,
            )
        },
        Mode::Disabled | Mode::Init => {
            warn_once!("record merge requested on a session in a non-trace mode");
            return;
        }
    };

    let dst_bytes = dst_words as u64 * word;
    if dst_len > (dst_bytes - count_size) / entry_size {
        // The count word is consumer-writable; a value beyond the buffer's
        // nominal capacity means the shared buffer was corrupted.
        warn_once!("shared buffer count exceeds its capacity; merge skipped");
        return;
    }

    let dst_occupied = count_size + dst_len * entry_size;
    let dst_free = dst_bytes - dst_occupied;
    let bytes_to_move = dst_free.min(src_len.saturating_mul(entry_size));
    unsafe {
        area::copy_words(
            dst.base(),
            dst_occupied as usize,
            src.base(),
            count_size as usize,
            bytes_to_move as usize,
        );
    }
    let entries_moved = bytes_to_move / entry_size;

    match mode {
        Mode::TracePc => unsafe {
            area::store_word(
                dst.base(),
                0,
                (dst_len + entries_moved) as usize,
                Ordering::Release,
            );
        },
        Mode::TraceCmp => unsafe {
            area::store_u64(dst.base(), 0, dst_len + entries_moved, Ordering::Release);
        },
        Mode::Disabled | Mode::Init => {}
    }
}
