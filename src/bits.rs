//! Branch-light bit primitives over machine words and word arrays.
//!
//! The word-level helpers are thin, named wrappers so call sites in the node
//! codec read like the layout documentation. The range operations treat a
//! `[u32]` or `[u64]` slice as one long bit string and operate on the
//! inclusive bit range `[from, to]`; they never read or write a word outside
//! the span covering that range.

use std::ops::{BitAnd, BitOr, BitXor, Not, Shl, Shr};

/// Word types usable as bit-array storage.
pub trait BitWord:
    Copy
    + Eq
    + Not<Output = Self>
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
    + Shl<u32, Output = Self>
    + Shr<u32, Output = Self>
{
    const BITS: u32;
    const ZERO: Self;
    const ONES: Self;
    fn count_ones(self) -> u32;
    fn trailing_zeros(self) -> u32;
    fn leading_zeros(self) -> u32;
}

macro_rules! bit_word {
    ($t:ty) => {
        impl BitWord for $t {
            const BITS: u32 = <$t>::BITS;
            const ZERO: Self = 0;
            const ONES: Self = !0;
            fn count_ones(self) -> u32 {
                self.count_ones()
            }
            fn trailing_zeros(self) -> u32 {
                self.trailing_zeros()
            }
            fn leading_zeros(self) -> u32 {
                self.leading_zeros()
            }
        }
    };
}

bit_word!(u32);
bit_word!(u64);

#[inline]
pub fn popcount32(x: u32) -> u32 {
    x.count_ones()
}

#[inline]
pub fn popcount64(x: u64) -> u32 {
    x.count_ones()
}

/// Index of the lowest set bit. Must not be called with 0.
#[inline]
pub fn find_first_set32(x: u32) -> u32 {
    debug_assert!(x != 0);
    x.trailing_zeros()
}

/// Index of the lowest set bit. Must not be called with 0.
#[inline]
pub fn find_first_set64(x: u64) -> u32 {
    debug_assert!(x != 0);
    x.trailing_zeros()
}

/// Index of the highest set bit. Must not be called with 0.
#[inline]
pub fn find_last_set32(x: u32) -> u32 {
    debug_assert!(x != 0);
    31 - x.leading_zeros()
}

/// Index of the highest set bit. Must not be called with 0.
#[inline]
pub fn find_last_set64(x: u64) -> u32 {
    debug_assert!(x != 0);
    63 - x.leading_zeros()
}

#[inline]
pub fn byte_reverse16(x: u16) -> u16 {
    x.swap_bytes()
}

#[inline]
pub fn byte_reverse32(x: u32) -> u32 {
    x.swap_bytes()
}

#[inline]
pub fn byte_reverse64(x: u64) -> u64 {
    x.swap_bytes()
}

#[inline]
pub fn bit_reverse32(x: u32) -> u32 {
    x.reverse_bits()
}

#[inline]
pub fn bit_reverse64(x: u64) -> u64 {
    x.reverse_bits()
}

/// Binary combining operators for [`combine_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Xnor,
}

#[inline]
fn low_mask<W: BitWord>(bit: u32) -> W {
    // All bits up to and including `bit`.
    W::ONES >> (W::BITS - 1 - bit)
}

#[inline]
fn high_mask<W: BitWord>(bit: u32) -> W {
    // All bits from `bit` upward.
    W::ONES << bit
}

/// Calls `f(word_index, mask)` for every word overlapping `[from, to]`,
/// with `mask` selecting exactly the in-range bits of that word.
#[inline]
fn masked_words<W: BitWord>(len: usize, from: usize, to: usize, mut f: impl FnMut(usize, W)) {
    debug_assert!(to < len * W::BITS as usize);
    let bits = W::BITS as usize;
    let first = from / bits;
    let last = to / bits;
    for wi in first..=last {
        let mut mask = W::ONES;
        if wi == first {
            mask = mask & high_mask((from % bits) as u32);
        }
        if wi == last {
            mask = mask & low_mask((to % bits) as u32);
        }
        f(wi, mask);
    }
}

/// Sets every bit in the inclusive range `[from, to]`. Empty on `to < from`.
pub fn set_range<W: BitWord>(words: &mut [W], from: usize, to: usize) {
    if to < from {
        return;
    }
    masked_words(words.len(), from, to, |wi, mask: W| {
        words[wi] = words[wi] | mask;
    });
}

/// Clears every bit in the inclusive range `[from, to]`.
pub fn clear_range<W: BitWord>(words: &mut [W], from: usize, to: usize) {
    if to < from {
        return;
    }
    masked_words(words.len(), from, to, |wi, mask: W| {
        words[wi] = words[wi] & !mask;
    });
}

/// Complements every bit in the inclusive range `[from, to]`.
pub fn flip_range<W: BitWord>(words: &mut [W], from: usize, to: usize) {
    if to < from {
        return;
    }
    masked_words(words.len(), from, to, |wi, mask: W| {
        words[wi] = words[wi] ^ mask;
    });
}

/// `dst = dst OP src` over the inclusive bit range; bits outside the range
/// are untouched.
pub fn combine_range<W: BitWord>(dst: &mut [W], src: &[W], op: BitOp, from: usize, to: usize) {
    if to < from {
        return;
    }
    debug_assert!(to < src.len() * W::BITS as usize);
    masked_words(dst.len(), from, to, |wi, mask: W| {
        let a = dst[wi];
        let b = src[wi];
        let combined = match op {
            BitOp::And => a & b,
            BitOp::Or => a | b,
            BitOp::Xor => a ^ b,
            BitOp::Nand => !(a & b),
            BitOp::Nor => !(a | b),
            BitOp::Xnor => !(a ^ b),
        };
        dst[wi] = (a & !mask) | (combined & mask);
    });
}

/// Number of set bits in the inclusive range `[from, to]`; 0 on `to < from`.
pub fn popcount_range<W: BitWord>(words: &[W], from: usize, to: usize) -> usize {
    if to < from {
        return 0;
    }
    let mut count = 0;
    masked_words(words.len(), from, to, |wi, mask: W| {
        count += (words[wi] & mask).count_ones() as usize;
    });
    count
}

/// Lowest set bit in `[from, to]`, or `None`.
pub fn scan_forward_set<W: BitWord>(words: &[W], from: usize, to: usize) -> Option<usize> {
    scan_forward(words, from, to, false)
}

/// Lowest clear bit in `[from, to]`, or `None`.
pub fn scan_forward_clear<W: BitWord>(words: &[W], from: usize, to: usize) -> Option<usize> {
    scan_forward(words, from, to, true)
}

/// Highest set bit in `[from, to]`, or `None`.
pub fn scan_reverse_set<W: BitWord>(words: &[W], from: usize, to: usize) -> Option<usize> {
    scan_reverse(words, from, to, false)
}

/// Highest clear bit in `[from, to]`, or `None`.
pub fn scan_reverse_clear<W: BitWord>(words: &[W], from: usize, to: usize) -> Option<usize> {
    scan_reverse(words, from, to, true)
}

fn scan_forward<W: BitWord>(words: &[W], from: usize, to: usize, invert: bool) -> Option<usize> {
    if to < from {
        return None;
    }
    let mut found = None;
    masked_words(words.len(), from, to, |wi, mask: W| {
        if found.is_some() {
            return;
        }
        let w = if invert { !words[wi] } else { words[wi] };
        let hit = w & mask;
        if hit != W::ZERO {
            found = Some(wi * W::BITS as usize + hit.trailing_zeros() as usize);
        }
    });
    found
}

fn scan_reverse<W: BitWord>(words: &[W], from: usize, to: usize, invert: bool) -> Option<usize> {
    if to < from {
        return None;
    }
    let mut found = None;
    masked_words(words.len(), from, to, |wi, mask: W| {
        let w = if invert { !words[wi] } else { words[wi] };
        let hit = w & mask;
        if hit != W::ZERO {
            found = Some(wi * W::BITS as usize + (W::BITS - 1 - hit.leading_zeros()) as usize);
        }
    });
    found
}
