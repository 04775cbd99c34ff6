/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fixed-width bit sets.
//!
//! Node sets and core sets are dense and indexed by stable numbers, so a
//! heap-backed array of `u64` words beats any hash-based set here.  The
//! same type backs per-node bitmaps (global node table domain), per-step
//! exit bitmaps (step-local domain), and the 3-D `(node, socket, core)`
//! core bitmaps addressed through [`crate::job::resources::JobResources`].
//!
//! The textual form produced by [`Bitmap::fmt_ranges`] ("0-2,5") is the
//! serialisation format used by state dump/load; [`Bitmap::parse_ranges`]
//! is its inverse.

use thiserror::Error;

const WORD_BITS: usize = 64;

/// Error raised when a textual range form cannot be parsed back into a
/// bitmap of the stated width.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitmapError {
    /// A range component was not `N` or `LO-HI`.
    #[error("malformed bit range component: '{0}'")]
    Malformed(String),

    /// A bit index in the text is outside the target width.
    #[error("bit {bit} out of range for bitmap of {len} bits")]
    OutOfRange { bit: usize, len: usize },

    /// A range had `lo > hi`.
    #[error("inverted bit range {lo}-{hi}")]
    Inverted { lo: usize, hi: usize },
}

/// A fixed-width set of bits.
///
/// The width is chosen at construction and never changes; all binary
/// operations require both operands to have the same width.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Width in bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when the width is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, bit: usize) {
        assert!(
            bit < self.len,
            "bit {bit} out of range for bitmap of {} bits",
            self.len
        );
    }

    /// Set one bit.
    pub fn set(&mut self, bit: usize) {
        self.check(bit);
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    /// Clear one bit.
    pub fn clear(&mut self, bit: usize) {
        self.check(bit);
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
    }

    /// Read one bit.
    pub fn test(&self, bit: usize) -> bool {
        self.check(bit);
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Population count.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `true` when at least one bit is set.
    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Index of the lowest set bit.
    pub fn first_set(&self) -> Option<usize> {
        for (i, &w) in self.words.iter().enumerate() {
            if w != 0 {
                return Some(i * WORD_BITS + w.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Index of the highest set bit.
    pub fn last_set(&self) -> Option<usize> {
        for (i, &w) in self.words.iter().enumerate().rev() {
            if w != 0 {
                return Some(i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize));
            }
        }
        None
    }

    /// Set every bit in the inclusive range `[lo, hi]`.
    ///
    /// Idempotent — re-applying an overlapping range is harmless, which
    /// is what lets out-of-order partial-completion reports coalesce.
    pub fn set_range(&mut self, lo: usize, hi: usize) {
        self.check(hi);
        for bit in lo..=hi {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    /// Clear every bit in the inclusive range `[lo, hi]`.
    pub fn clear_range(&mut self, lo: usize, hi: usize) {
        self.check(hi);
        for bit in lo..=hi {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Keep only the first `n` set bits, clearing the rest.
    pub fn pick_cnt(&mut self, n: usize) {
        let mut kept = 0usize;
        for bit in 0..self.len {
            if self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0 {
                if kept >= n {
                    self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
                } else {
                    kept += 1;
                }
            }
        }
    }

    /// In-place intersection.
    pub fn and(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len, "bitmap width mismatch");
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    /// In-place union.
    pub fn or(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len, "bitmap width mismatch");
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// In-place difference: clear every bit that is set in `other`.
    pub fn and_not(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len, "bitmap width mismatch");
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    /// `true` when every set bit of `self` is also set in `of`.
    pub fn is_subset(&self, of: &Bitmap) -> bool {
        assert_eq!(self.len, of.len, "bitmap width mismatch");
        self.words.iter().zip(&of.words).all(|(w, o)| w & !o == 0)
    }

    /// `true` when `self` and `other` share no set bit.
    pub fn is_disjoint(&self, other: &Bitmap) -> bool {
        assert_eq!(self.len, other.len, "bitmap width mismatch");
        self.words.iter().zip(&other.words).all(|(w, o)| w & o == 0)
    }

    /// Iterate the indices of all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&bit| {
            self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
        })
    }

    /// Textual run-length range form, e.g. `"0-2,5"`.  Empty set → `""`.
    pub fn fmt_ranges(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        for bit in self.iter_set() {
            match run {
                Some((lo, hi)) if bit == hi + 1 => run = Some((lo, bit)),
                Some((lo, hi)) => {
                    Self::push_range(&mut out, lo, hi);
                    run = Some((bit, bit));
                }
                None => run = Some((bit, bit)),
            }
        }
        if let Some((lo, hi)) = run {
            Self::push_range(&mut out, lo, hi);
        }
        out
    }

    fn push_range(out: &mut String, lo: usize, hi: usize) {
        use std::fmt::Write as _;
        if !out.is_empty() {
            out.push(',');
        }
        if lo == hi {
            let _ = write!(out, "{lo}");
        } else {
            let _ = write!(out, "{lo}-{hi}");
        }
    }

    /// Inverse of [`fmt_ranges`](Self::fmt_ranges) for a bitmap of width
    /// `len`.
    pub fn parse_ranges(text: &str, len: usize) -> Result<Self, BitmapError> {
        let mut map = Bitmap::new(len);
        if text.is_empty() {
            return Ok(map);
        }
        for part in text.split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => {
                    let lo = a
                        .parse::<usize>()
                        .map_err(|_| BitmapError::Malformed(part.to_string()))?;
                    let hi = b
                        .parse::<usize>()
                        .map_err(|_| BitmapError::Malformed(part.to_string()))?;
                    (lo, hi)
                }
                None => {
                    let v = part
                        .parse::<usize>()
                        .map_err(|_| BitmapError::Malformed(part.to_string()))?;
                    (v, v)
                }
            };
            if lo > hi {
                return Err(BitmapError::Inverted { lo, hi });
            }
            if hi >= len {
                return Err(BitmapError::OutOfRange { bit: hi, len });
            }
            map.set_range(lo, hi);
        }
        Ok(map)
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap[{}]{{{}}}", self.len, self.fmt_ranges())
    }
}

impl std::fmt::Display for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fmt_ranges())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
