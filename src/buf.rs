//! The positionable stream buffer all section decoding reads from.

use crate::endian::{Endianity, RunTimeEndian};
use crate::error::{Error, Result};
use crate::leb128;
use std::str;

/// The DWARF format of a unit: 32-bit or 64-bit word sizes for
/// section offsets and lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// 64-bit DWARF.
    Dwarf64,
    /// 32-bit DWARF.
    Dwarf32,
}

impl Format {
    /// The size in bytes of a section offset or length in this format.
    #[inline]
    pub fn word_size(self) -> u8 {
        match self {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 8,
        }
    }
}

/// A `&[u8]` window over a section, with endianity metadata.
///
/// All read operations advance the window unless noted otherwise. Reads are
/// zero-copy: sub-windows and byte strings borrow the original section
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndianBuf<'data, E = RunTimeEndian>
where
    E: Endianity,
{
    buf: &'data [u8],
    endian: E,
}

impl<'data, E> EndianBuf<'data, E>
where
    E: Endianity,
{
    /// Construct a new `EndianBuf` over the given bytes.
    #[inline]
    pub fn new(buf: &'data [u8], endian: E) -> EndianBuf<'data, E> {
        EndianBuf { buf, endian }
    }

    /// Return a reference to the remaining raw bytes.
    #[inline]
    pub fn bytes(&self) -> &'data [u8] {
        self.buf
    }

    /// The endianity this buffer reads with.
    #[inline]
    pub fn endian(&self) -> E {
        self.endian
    }

    /// Return the number of bytes remaining.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Return true if no bytes remain.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Set the number of bytes remaining to zero.
    #[inline]
    pub fn empty(&mut self) {
        self.buf = &[];
    }

    /// Return the offset of this window's start relative to the start of
    /// the given base window.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if this window is not contained within the
    /// base window.
    pub fn offset_from(&self, base: &EndianBuf<'data, E>) -> usize {
        let base_ptr = base.buf.as_ptr() as usize;
        let ptr = self.buf.as_ptr() as usize;
        debug_assert!(base_ptr <= ptr);
        debug_assert!(ptr + self.buf.len() <= base_ptr + base.buf.len());
        ptr - base_ptr
    }

    /// Return a new window over `len` bytes starting at `offset` of this
    /// window, without advancing this window.
    pub fn range(&self, offset: usize, len: usize) -> Result<EndianBuf<'data, E>> {
        let end = offset.checked_add(len).ok_or(Error::OffsetOutOfBounds)?;
        if end > self.buf.len() {
            return Err(Error::OffsetOutOfBounds);
        }
        Ok(EndianBuf::new(&self.buf[offset..end], self.endian))
    }

    /// Return a new window over everything from `offset` to the end of this
    /// window, without advancing this window.
    pub fn range_from(&self, offset: usize) -> Result<EndianBuf<'data, E>> {
        if offset > self.buf.len() {
            return Err(Error::OffsetOutOfBounds);
        }
        Ok(EndianBuf::new(&self.buf[offset..], self.endian))
    }

    /// Discard the next `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            Err(Error::UnexpectedEof)
        } else {
            self.buf = &self.buf[len..];
            Ok(())
        }
    }

    /// Split off a sub-window of the next `len` bytes and advance past it.
    pub fn split(&mut self, len: usize) -> Result<EndianBuf<'data, E>> {
        let slice = self.read_slice(len)?;
        Ok(EndianBuf::new(slice, self.endian))
    }

    /// Truncate this window to `len` bytes.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            Err(Error::UnexpectedEof)
        } else {
            self.buf = &self.buf[..len];
            Ok(())
        }
    }

    /// Find the index of the first occurrence of `byte` without advancing.
    #[inline]
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.buf.iter().position(|b| *b == byte)
    }

    #[inline]
    fn read_slice(&mut self, len: usize) -> Result<&'data [u8]> {
        if self.buf.len() < len {
            Err(Error::UnexpectedEof)
        } else {
            let val = &self.buf[..len];
            self.buf = &self.buf[len..];
            Ok(val)
        }
    }

    /// Read a u8.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let slice = self.read_slice(1)?;
        Ok(slice[0])
    }

    /// Read an i8.
    #[inline]
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a u16.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        let slice = self.read_slice(2)?;
        Ok(self.endian.read_u16(slice))
    }

    /// Read an i16.
    #[inline]
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Read a u32.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        let slice = self.read_slice(4)?;
        Ok(self.endian.read_u32(slice))
    }

    /// Read an i32.
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a u64.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        let slice = self.read_slice(8)?;
        Ok(self.endian.read_u64(slice))
    }

    /// Read an i64.
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read an address-sized integer and return it as a `u64`.
    pub fn read_address(&mut self, address_size: u8) -> Result<u64> {
        match address_size {
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            otherwise => Err(Error::UnsupportedAddressSize(otherwise)),
        }
    }

    /// Read an initial length field, determining the DWARF format.
    ///
    /// `0xffff_ffff` escapes to a 64-bit length; the remaining values of
    /// the reserved range `0xffff_fff0..` are rejected.
    pub fn read_initial_length(&mut self) -> Result<(u64, Format)> {
        match self.read_u32()? {
            0xffff_ffff => Ok((self.read_u64()?, Format::Dwarf64)),
            reserved if reserved >= 0xffff_fff0 => Err(Error::CorruptUnitLength),
            length => Ok((u64::from(length), Format::Dwarf32)),
        }
    }

    /// Read a word-sized integer according to the DWARF format and return
    /// it as a `u64`.
    pub fn read_word(&mut self, format: Format) -> Result<u64> {
        match format {
            Format::Dwarf32 => self.read_u32().map(u64::from),
            Format::Dwarf64 => self.read_u64(),
        }
    }

    /// Read a word-sized integer according to the DWARF format and return
    /// it as a `usize` offset.
    pub fn read_offset(&mut self, format: Format) -> Result<usize> {
        let word = self.read_word(format)?;
        usize::try_from(word).map_err(|_| Error::OffsetOutOfBounds)
    }

    /// Read a null-terminated byte string, excluding the null.
    pub fn read_null_terminated(&mut self) -> Result<&'data [u8]> {
        match self.find(0) {
            Some(idx) => {
                let val = self.read_slice(idx)?;
                self.skip(1)?;
                Ok(val)
            }
            None => Err(Error::UnexpectedEof),
        }
    }

    /// Read a null-terminated string and lossily convert it to UTF-8.
    pub fn read_string_lossy(&mut self) -> Result<String> {
        let bytes = self.read_null_terminated()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read an unsigned LEB128 encoded integer.
    #[inline]
    pub fn read_uleb128(&mut self) -> Result<u64> {
        leb128::read::unsigned(self)
    }

    /// Read a signed LEB128 encoded integer.
    #[inline]
    pub fn read_sleb128(&mut self) -> Result<i64> {
        leb128::read::signed(self)
    }
}

impl<'data, E> From<EndianBuf<'data, E>> for &'data [u8]
where
    E: Endianity,
{
    fn from(buf: EndianBuf<'data, E>) -> Self {
        buf.buf
    }
}
