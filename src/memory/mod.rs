//! Typed access to the guest's flat address space.
//!
//! [`MemoryView`] backs the guest address space with a sparse map of mapped
//! regions and layers typed decoding on top: fixed-width little-endian
//! integers, pointers at the configured width, NUL-terminated narrow and
//! UTF-16 strings, and raw buffers.
//!
//! # String decoding
//!
//! String scans are bounded by a configurable window. A missing terminator
//! produces [`Error::Decode`] carrying the best-effort partial string; the
//! parameter resolver recovers with that partial value rather than aborting
//! the session.
//!
//! # Consistency
//!
//! The view gives no transactional guarantees. A hook reading memory across a
//! context switch boundary can observe torn values; that is a semantic
//! property of emulated concurrency, not a defect here.

use std::collections::BTreeMap;

use widestring::{U16CStr, U16Str};

use crate::{cpu::GuestAddress, Error, Result};

/// Default bound for NUL-terminator scans, in bytes (narrow) or code units (wide).
pub const DEFAULT_SCAN_WINDOW: usize = 4096;

/// Guest pointer width, fixed per session at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum PointerWidth {
    /// 32-bit guest: 4-byte pointers and stack slots.
    #[strum(serialize = "32-bit")]
    Bits32,
    /// 64-bit guest: 8-byte pointers and stack slots.
    #[strum(serialize = "64-bit")]
    Bits64,
}

impl PointerWidth {
    /// Size of a pointer or stack slot in bytes.
    #[must_use]
    pub const fn word_size(self) -> u64 {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    /// Masks `value` to the addressable range of this width.
    #[must_use]
    pub const fn truncate(self, value: u64) -> u64 {
        match self {
            PointerWidth::Bits32 => value & 0xFFFF_FFFF,
            PointerWidth::Bits64 => value,
        }
    }
}

/// Sparse, typed view over the guest's flat address space.
///
/// Regions are mapped at explicit bases and do not coalesce; every access
/// must fall inside a single mapped region. Unmapped accesses and failed
/// decodes report [`Error::Decode`] so callers can recover locally.
#[derive(Debug)]
pub struct MemoryView {
    regions: BTreeMap<u64, Vec<u8>>,
    width: PointerWidth,
    scan_window: usize,
}

impl MemoryView {
    /// Creates an empty view for the given pointer width.
    #[must_use]
    pub fn new(width: PointerWidth) -> Self {
        MemoryView {
            regions: BTreeMap::new(),
            width,
            scan_window: DEFAULT_SCAN_WINDOW,
        }
    }

    /// Returns the pointer width this view decodes pointers at.
    #[must_use]
    pub fn width(&self) -> PointerWidth {
        self.width
    }

    /// Sets the bounded scan window for string decoding.
    pub fn set_scan_window(&mut self, window: usize) {
        self.scan_window = window;
    }

    /// Maps a zeroed region of `size` bytes at `base`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if the range overlaps an existing region.
    pub fn map(&mut self, base: GuestAddress, size: u64) -> Result<()> {
        let start = base.value();
        let end = start
            .checked_add(size)
            .ok_or_else(|| decode_err(format!("region at {base} wraps the address space")))?;

        let overlaps = self
            .regions
            .range(..end)
            .next_back()
            .is_some_and(|(rbase, data)| rbase + data.len() as u64 > start);
        if overlaps {
            return Err(decode_err(format!("region at {base} overlaps a mapping")));
        }

        self.regions.insert(start, vec![0; size as usize]);
        Ok(())
    }

    /// Unmaps the region based exactly at `base`. Unknown bases are ignored.
    pub fn unmap(&mut self, base: GuestAddress) {
        self.regions.remove(&base.value());
    }

    /// Returns `true` if `addr` falls inside a mapped region.
    #[must_use]
    pub fn is_mapped(&self, addr: GuestAddress) -> bool {
        self.locate(addr.value(), 1).is_some()
    }

    /// Finds the region containing [addr, addr+len); returns (base, offset).
    fn locate(&self, addr: u64, len: u64) -> Option<(u64, usize)> {
        let (base, data) = self.regions.range(..=addr).next_back()?;
        let offset = addr - base;
        if offset + len <= data.len() as u64 {
            Some((*base, offset as usize))
        } else {
            None
        }
    }

    /// Reads `len` raw bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if the range is not fully mapped.
    pub fn read_bytes(&self, addr: GuestAddress, len: u64) -> Result<Vec<u8>> {
        let (base, offset) = self
            .locate(addr.value(), len)
            .ok_or_else(|| decode_err(format!("read of {len} bytes at unmapped {addr}")))?;
        Ok(self.regions[&base][offset..offset + len as usize].to_vec())
    }

    /// Writes raw bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if the range is not fully mapped.
    pub fn write_bytes(&mut self, addr: GuestAddress, bytes: &[u8]) -> Result<()> {
        let (base, offset) = self
            .locate(addr.value(), bytes.len() as u64)
            .ok_or_else(|| {
                decode_err(format!(
                    "write of {} bytes at unmapped {addr}",
                    bytes.len()
                ))
            })?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or_else(|| decode_err(format!("write at unmapped {addr}")))?;
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads an unsigned 8-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_u8(&self, addr: GuestAddress) -> Result<u8> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    /// Reads a little-endian unsigned 16-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_u16(&self, addr: GuestAddress) -> Result<u16> {
        let bytes = self.read_bytes(addr, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian unsigned 32-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_u32(&self, addr: GuestAddress) -> Result<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian unsigned 64-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_u64(&self, addr: GuestAddress) -> Result<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads one pointer-width word, zero-extended to 64 bits.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_word(&self, addr: GuestAddress) -> Result<u64> {
        match self.width {
            PointerWidth::Bits32 => Ok(u64::from(self.read_u32(addr)?)),
            PointerWidth::Bits64 => self.read_u64(addr),
        }
    }

    /// Reads a guest pointer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn read_pointer(&self, addr: GuestAddress) -> Result<GuestAddress> {
        Ok(GuestAddress::new(self.read_word(addr)?))
    }

    /// Writes a little-endian unsigned 32-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn write_u32(&mut self, addr: GuestAddress, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes a little-endian unsigned 64-bit integer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn write_u64(&mut self, addr: GuestAddress, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes one pointer-width word, truncating to the guest width.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] on unmapped memory.
    pub fn write_word(&mut self, addr: GuestAddress, value: u64) -> Result<()> {
        match self.width {
            PointerWidth::Bits32 => self.write_u32(addr, value as u32),
            PointerWidth::Bits64 => self.write_u64(addr, value),
        }
    }

    /// Reads a NUL-terminated narrow string starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if no terminator is found within the scan
    /// window or before the region ends; the error carries the best-effort
    /// partial string decoded so far.
    pub fn read_c_string(&self, addr: GuestAddress) -> Result<String> {
        let (base, offset) = self
            .locate(addr.value(), 1)
            .ok_or_else(|| decode_err(format!("string read at unmapped {addr}")))?;
        let data = &self.regions[&base][offset..];
        let window = data.len().min(self.scan_window);

        match data[..window].iter().position(|&b| b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&data[..nul]).into_owned()),
            None => Err(Error::Decode {
                message: format!("no NUL within {window} bytes at {addr}"),
                partial: Some(String::from_utf8_lossy(&data[..window]).into_owned()),
            }),
        }
    }

    /// Reads a NUL-terminated UTF-16 string starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if no terminator is found within the scan
    /// window (counted in code units); the error carries the best-effort
    /// partial string.
    pub fn read_wide_string(&self, addr: GuestAddress) -> Result<String> {
        let (base, offset) = self
            .locate(addr.value(), 2)
            .ok_or_else(|| decode_err(format!("wide string read at unmapped {addr}")))?;
        let data = &self.regions[&base][offset..];
        let window = (data.len() / 2).min(self.scan_window);

        let units: Vec<u16> = data[..window * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        match U16CStr::from_slice_truncate(&units) {
            Ok(wide) => Ok(wide.to_string_lossy()),
            Err(_) => Err(Error::Decode {
                message: format!("no NUL within {window} code units at {addr}"),
                partial: Some(U16Str::from_slice(&units).to_string_lossy()),
            }),
        }
    }
}

fn decode_err(message: String) -> Error {
    Error::Decode {
        message,
        partial: None,
    }
}
