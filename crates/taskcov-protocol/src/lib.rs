//! Record layout and control-surface constants for the taskcov facility.
//!
//! This crate pins down everything a consumer needs to interpret a coverage
//! buffer without linking the facility itself: the count-then-records buffer
//! layout, the comparison record shape and its type encoding, the wire
//! values of the control surface, and the facility's hard limits.  It is
//! `no_std`-compatible with zero dependencies.
//!
//! # Buffer layout
//!
//! Word 0 of every buffer is the number of records that follow.
//!
//! ```text
//! PC buffer   (machine words):  [count] [pc] [pc] ...
//! CMP buffer  (64-bit words):   [count] [type arg1 arg2 pc] [type arg1 arg2 pc] ...
//! ```
//!
//! A PC buffer of `n` words holds at most `n - 1` records.  A CMP buffer
//! holds at most `(n * WORD_BYTES - 8) / 32` records; capacity checks are
//! done in bytes so that the arithmetic cannot overflow.

#![cfg_attr(not(test), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Buffer geometry
// ═══════════════════════════════════════════════════════════════════════

/// Size of one machine word in bytes.  PC records and the PC count are one
/// machine word each; CMP records are always 64-bit regardless of target.
pub const WORD_BYTES: usize = core::mem::size_of::<usize>();

/// Number of 64-bit words written per comparison record.
pub const WORDS_PER_CMP: usize = 4;

/// Upper bound on a trace buffer in bytes.  Keeps `words * WORD_BYTES`
/// comfortably inside the range where the byte arithmetic used by the
/// sinks and the merge cannot overflow.
pub const MAX_TRACE_BYTES: usize = i32::MAX as usize;

// ═══════════════════════════════════════════════════════════════════════
//  Comparison type encoding
// ═══════════════════════════════════════════════════════════════════════

/// Bit 0 of a comparison record's type word: one operand was a
/// compile-time constant.
pub const CMP_CONST: u64 = 1;

/// Width component of a comparison record's type word (bits 1–2).
///
/// `width_log2` is `log2(operand_bytes)`: 0, 1, 2, 3 for 8-, 16-, 32- and
/// 64-bit operands respectively.
pub const fn cmp_size(width_log2: u64) -> u64 {
    width_log2 << 1
}

/// One comparison record as it appears in a CMP buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmpRecord {
    /// Type word: [`CMP_CONST`] in bit 0, [`cmp_size`] in bits 1–2.
    pub ty: u64,
    /// First operand.  For switch-derived records this is the case label.
    pub arg1: u64,
    /// Second operand.  For switch-derived records this is the match value.
    pub arg2: u64,
    /// Canonicalized instruction pointer of the comparison site.
    pub ip: u64,
}

// Compile-time layout check: exactly four 64-bit words.
const _: () = assert!(core::mem::size_of::<CmpRecord>() == 8 * WORDS_PER_CMP);

impl CmpRecord {
    /// Whether one operand was a compile-time constant.
    pub const fn is_const(&self) -> bool {
        self.ty & CMP_CONST != 0
    }

    /// Operand width in bits (8, 16, 32 or 64).
    pub const fn width_bits(&self) -> u32 {
        8 << ((self.ty >> 1) & 0x3)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Control surface
// ═══════════════════════════════════════════════════════════════════════

/// Set the buffer capacity (argument: size in machine words) and move the
/// session out of the disabled state.  Must happen before anything else.
pub const CMD_INIT_TRACE: u32 = 0x01;

/// Enable collection for the calling task (argument: a `MODE_*` value).
pub const CMD_ENABLE: u32 = 0x02;

/// Detach the calling task (argument must be 0).
pub const CMD_DISABLE: u32 = 0x03;

/// Enable remote collection (compound argument: trace mode, scratch size,
/// handle list).
pub const CMD_REMOTE_ENABLE: u32 = 0x04;

/// Publish the shared buffer (argument: length in bytes, which must equal
/// `words * WORD_BYTES` exactly).
pub const CMD_MAP: u32 = 0x05;

/// Wire value selecting PC tracing in `CMD_ENABLE` / `CMD_REMOTE_ENABLE`.
pub const MODE_TRACE_PC: u64 = 0;

/// Wire value selecting comparison tracing.
pub const MODE_TRACE_CMP: u64 = 1;

/// Maximum number of handles accepted by one `CMD_REMOTE_ENABLE`.
pub const MAX_REMOTE_HANDLES: usize = 0x100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_record_is_four_u64s() {
        assert_eq!(core::mem::size_of::<CmpRecord>(), 32);
        assert_eq!(core::mem::align_of::<CmpRecord>(), 8);
    }

    #[test]
    fn cmp_size_encoding() {
        assert_eq!(cmp_size(0), 0b000);
        assert_eq!(cmp_size(1), 0b010);
        assert_eq!(cmp_size(2), 0b100);
        assert_eq!(cmp_size(3), 0b110);
    }

    #[test]
    fn cmp_record_accessors() {
        let rec = CmpRecord {
            ty: cmp_size(2) | CMP_CONST,
            arg1: 7,
            arg2: 9,
            ip: 0x4000,
        };
        assert!(rec.is_const());
        assert_eq!(rec.width_bits(), 32);

        let rec = CmpRecord {
            ty: cmp_size(3),
            arg1: 0,
            arg2: 0,
            ip: 0,
        };
        assert!(!rec.is_const());
        assert_eq!(rec.width_bits(), 64);
    }

    #[test]
    fn width_bits_covers_all_sizes() {
        for (log2, bits) in [(0u64, 8u32), (1, 16), (2, 32), (3, 64)] {
            let rec = CmpRecord {
                ty: cmp_size(log2),
                arg1: 0,
                arg2: 0,
                ip: 0,
            };
            assert_eq!(rec.width_bits(), bits);
        }
    }

    #[test]
    fn command_codes_are_distinct() {
        let codes = [CMD_INIT_TRACE, CMD_ENABLE, CMD_DISABLE, CMD_REMOTE_ENABLE, CMD_MAP];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn const_flag_does_not_collide_with_width_bits() {
        for log2 in 0..4u64 {
            assert_eq!(cmp_size(log2) & CMP_CONST, 0);
        }
    }

    #[test]
    fn wire_modes_are_distinct() {
        assert_ne!(MODE_TRACE_PC, MODE_TRACE_CMP);
        assert!(MAX_REMOTE_HANDLES > 0);
    }
}
