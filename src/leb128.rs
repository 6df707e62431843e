//! Little-Endian Base 128 (LEB128) variable length integer encoding.
//!
//! Values are encoded seven bits at a time, least significant group first,
//! with the high bit of each byte acting as a continuation flag. Signed
//! values sign-extend from bit 6 of the final group.

const CONTINUATION_BIT: u8 = 1 << 7;
const SIGN_BIT: u8 = 1 << 6;

#[inline]
fn low_bits_of_byte(byte: u8) -> u8 {
    byte & !CONTINUATION_BIT
}

/// Read LEB128-encoded integers.
pub mod read {
    use super::{low_bits_of_byte, CONTINUATION_BIT, SIGN_BIT};
    use crate::buf::EndianBuf;
    use crate::endian::Endianity;
    use crate::error::{Error, Result};

    /// Read an unsigned LEB128 number from the given buffer, advancing it
    /// past the bytes that were read.
    pub fn unsigned<E: Endianity>(buf: &mut EndianBuf<'_, E>) -> Result<u64> {
        let mut result = 0;
        let mut shift = 0;

        loop {
            let byte = buf.read_u8()?;
            if shift == 63 && byte != 0x00 && byte != 0x01 {
                return Err(Error::BadUnsignedLeb128);
            }

            result |= u64::from(low_bits_of_byte(byte)) << shift;
            if byte & CONTINUATION_BIT == 0 {
                return Ok(result);
            }

            shift += 7;
            if shift >= 64 {
                return Err(Error::BadUnsignedLeb128);
            }
        }
    }

    /// Read a signed LEB128 number from the given buffer, advancing it past
    /// the bytes that were read.
    pub fn signed<E: Endianity>(buf: &mut EndianBuf<'_, E>) -> Result<i64> {
        let mut result = 0;
        let mut shift = 0;
        let mut byte;

        loop {
            byte = buf.read_u8()?;
            if shift == 63 && byte != 0x00 && byte != 0x7f {
                return Err(Error::BadSignedLeb128);
            }

            result |= i64::from(low_bits_of_byte(byte)) << shift;
            shift += 7;

            if byte & CONTINUATION_BIT == 0 {
                break;
            }
            if shift >= 64 {
                return Err(Error::BadSignedLeb128);
            }
        }

        if shift < 64 && byte & SIGN_BIT != 0 {
            // Sign extend from bit 6 of the last group.
            result |= -1i64 << shift;
        }

        Ok(result)
    }
}

/// Write LEB128-encoded integers.
///
/// Only tests need this half; the engine itself never produces DWARF.
pub mod write {
    use super::{CONTINUATION_BIT, SIGN_BIT};

    /// Write `val` to `buf` as an unsigned LEB128 number, returning the
    /// number of bytes written.
    pub fn unsigned(buf: &mut Vec<u8>, mut val: u64) -> usize {
        let mut written = 0;
        loop {
            let mut byte = (val & 0x7f) as u8;
            val >>= 7;
            if val != 0 {
                byte |= CONTINUATION_BIT;
            }
            buf.push(byte);
            written += 1;
            if val == 0 {
                return written;
            }
        }
    }

    /// Write `val` to `buf` as a signed LEB128 number, returning the number
    /// of bytes written.
    pub fn signed(buf: &mut Vec<u8>, mut val: i64) -> usize {
        let mut written = 0;
        loop {
            let mut byte = (val & 0x7f) as u8;
            val >>= 7;
            let done = (val == 0 && byte & SIGN_BIT == 0) || (val == -1 && byte & SIGN_BIT != 0);
            if !done {
                byte |= CONTINUATION_BIT;
            }
            buf.push(byte);
            written += 1;
            if done {
                return written;
            }
        }
    }
}
