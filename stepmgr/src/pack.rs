/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Pack/unpack byte buffers.
//!
//! Step-state dump/load and the step-info response share one tiny wire
//! discipline: big-endian fixed-width integers, `u32`-length-prefixed
//! strings with [`crate::NO_VAL`] marking an absent optional string, and
//! `i64` unix timestamps.  Two protocol versions are live at any time;
//! the version only changes *which* fields a caller writes, never how a
//! field is encoded, so the buffer itself is version-agnostic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::NO_VAL;

/// Wire protocol revisions understood by dump/load.
///
/// `V1` is the previous release's format: identical to `V2` except that
/// packed GRES state is omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    /// The buffer ended before a field was complete.
    #[error("truncated buffer: needed {need} more byte(s), {have} left")]
    Truncated { need: usize, have: usize },

    /// A string field held invalid UTF-8.
    #[error("string field is not valid UTF-8")]
    BadString,

    /// A length prefix exceeded the remaining buffer (corrupt, not
    /// merely truncated).
    #[error("string length {len} exceeds remaining buffer {have}")]
    BadLength { len: usize, have: usize },
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Unix timestamps travel as signed 64-bit seconds.
    pub fn pack_time(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn pack_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    /// Length-prefixed string.
    pub fn pack_str(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    /// Length-prefixed optional string; `None` packs as a [`NO_VAL`]
    /// length and unpacks back to `None`.
    pub fn pack_opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.pack_str(s),
            None => self.buf.put_u32(NO_VAL),
        }
    }

    /// Current write offset — for fields patched after the fact.
    pub fn mark(&self) -> usize {
        self.buf.len()
    }

    /// Overwrite a `u32` previously written at `mark`.
    pub fn patch_u32(&mut self, mark: usize, v: u32) {
        self.buf[mark..mark + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reader over a packed buffer.
#[derive(Debug)]
pub struct Unpacker {
    buf: Bytes,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), PackError> {
        if self.buf.remaining() < n {
            return Err(PackError::Truncated {
                need: n - self.buf.remaining(),
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn unpack_u8(&mut self) -> Result<u8, PackError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn unpack_u16(&mut self) -> Result<u16, PackError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn unpack_u32(&mut self) -> Result<u32, PackError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn unpack_u64(&mut self) -> Result<u64, PackError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn unpack_time(&mut self) -> Result<i64, PackError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn unpack_bool(&mut self) -> Result<bool, PackError> {
        Ok(self.unpack_u8()? != 0)
    }

    pub fn unpack_str(&mut self) -> Result<String, PackError> {
        let len = self.unpack_u32()? as usize;
        if len > self.buf.remaining() {
            return Err(PackError::BadLength {
                len,
                have: self.buf.remaining(),
            });
        }
        let raw = self.buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|_| PackError::BadString)
    }

    pub fn unpack_opt_str(&mut self) -> Result<Option<String>, PackError> {
        let len = self.unpack_u32()?;
        if len == NO_VAL {
            return Ok(None);
        }
        let len = len as usize;
        if len > self.buf.remaining() {
            return Err(PackError::BadLength {
                len,
                have: self.buf.remaining(),
            });
        }
        let raw = self.buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| PackError::BadString)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut p = Packer::new();
        p.pack_u8(7);
        p.pack_u16(0xBEEF);
        p.pack_u32(0xDEAD_BEEF);
        p.pack_u64(u64::MAX - 1);
        p.pack_time(-12345);
        p.pack_bool(true);

        let mut u = Unpacker::new(p.finish());
        assert_eq!(u.unpack_u8().unwrap(), 7);
        assert_eq!(u.unpack_u16().unwrap(), 0xBEEF);
        assert_eq!(u.unpack_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(u.unpack_u64().unwrap(), u64::MAX - 1);
        assert_eq!(u.unpack_time().unwrap(), -12345);
        assert!(u.unpack_bool().unwrap());
        assert_eq!(u.remaining(), 0);
    }

    #[test]
    fn strings_round_trip() {
        let mut p = Packer::new();
        p.pack_str("tux[0-3]");
        p.pack_str("");
        p.pack_opt_str(None);
        p.pack_opt_str(Some("eth0"));

        let mut u = Unpacker::new(p.finish());
        assert_eq!(u.unpack_str().unwrap(), "tux[0-3]");
        assert_eq!(u.unpack_str().unwrap(), "");
        assert_eq!(u.unpack_opt_str().unwrap(), None);
        assert_eq!(u.unpack_opt_str().unwrap(), Some("eth0".to_string()));
    }

    #[test]
    fn truncated_buffer_is_detected() {
        let mut p = Packer::new();
        p.pack_u16(1);
        let mut u = Unpacker::new(p.finish());
        assert!(matches!(
            u.unpack_u32(),
            Err(PackError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_string_length_is_corrupt_not_truncated() {
        let mut p = Packer::new();
        p.pack_u32(1000); // claims 1000 bytes follow
        p.pack_u8(b'x');
        let mut u = Unpacker::new(p.finish());
        assert!(matches!(u.unpack_str(), Err(PackError::BadLength { .. })));
    }

    #[test]
    fn patch_u32_rewrites_placeholder() {
        let mut p = Packer::new();
        p.pack_time(100);
        let mark = p.mark();
        p.pack_u32(0); // placeholder count
        p.pack_u32(42);
        p.patch_u32(mark, 3);

        let mut u = Unpacker::new(p.finish());
        assert_eq!(u.unpack_time().unwrap(), 100);
        assert_eq!(u.unpack_u32().unwrap(), 3);
        assert_eq!(u.unpack_u32().unwrap(), 42);
    }
}
