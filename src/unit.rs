//! Compilation-unit headers in `.debug_info`.

use crate::abbrev::DebugAbbrevOffset;
use crate::buf::{EndianBuf, Format};
use crate::error::{Error, Result};
use fallible_iterator::FallibleIterator;
use tracing::warn;

/// An offset into the `.debug_info` section: the universal key identifying
/// compilation units, types, scopes and forward references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DebugInfoOffset(pub usize);

/// A parsed compilation-unit header. Immutable once read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    offset: DebugInfoOffset,
    unit_length: usize,
    format: Format,
    version: u16,
    abbrev_offset: DebugAbbrevOffset,
    address_size: u8,
}

impl UnitHeader {
    pub fn new(
        offset: DebugInfoOffset,
        unit_length: usize,
        format: Format,
        version: u16,
        abbrev_offset: DebugAbbrevOffset,
        address_size: u8,
    ) -> UnitHeader {
        UnitHeader {
            offset,
            unit_length,
            format,
            version,
            abbrev_offset,
            address_size,
        }
    }

    /// The offset of this header within `.debug_info`.
    #[inline]
    pub fn offset(&self) -> DebugInfoOffset {
        self.offset
    }

    /// The DWARF format version of this unit.
    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// 32-bit or 64-bit DWARF.
    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    /// The offset of this unit's abbreviation table in `.debug_abbrev`.
    #[inline]
    pub fn abbrev_offset(&self) -> DebugAbbrevOffset {
        self.abbrev_offset
    }

    /// The size in bytes of addresses in this unit.
    #[inline]
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// The size in bytes of the header itself.
    pub fn header_size(&self) -> usize {
        // initial length + version + abbrev offset + address size
        let initial = match self.format {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 12,
        };
        initial + 2 + self.format.word_size() as usize + 1
    }

    /// The `.debug_info` offset of this unit's first entry.
    pub fn first_entry_offset(&self) -> DebugInfoOffset {
        DebugInfoOffset(self.offset.0 + self.header_size())
    }

    /// The `.debug_info` offset one past the end of this unit.
    pub fn end_offset(&self) -> DebugInfoOffset {
        let initial = match self.format {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 12,
        };
        DebugInfoOffset(self.offset.0 + initial + self.unit_length)
    }

    /// True if the given `.debug_info` offset belongs to this unit.
    pub fn contains_offset(&self, offset: DebugInfoOffset) -> bool {
        self.offset <= offset && offset < self.end_offset()
    }

    /// A buffer over this unit's entry stream, starting at the first entry.
    pub fn entries<'data>(&self, debug_info: EndianBuf<'data>) -> Result<EndianBuf<'data>> {
        debug_info.range(
            self.first_entry_offset().0,
            self.end_offset().0 - self.first_entry_offset().0,
        )
    }

    /// A buffer over this unit's entry stream starting at `offset`, which
    /// must lie within the unit.
    pub fn entries_at<'data>(
        &self,
        debug_info: EndianBuf<'data>,
        offset: DebugInfoOffset,
    ) -> Result<EndianBuf<'data>> {
        if !self.contains_offset(offset) {
            return Err(Error::OffsetOutOfBounds);
        }
        debug_info.range(offset.0, self.end_offset().0 - offset.0)
    }

    /// Parse a header at `offset` of `.debug_info`.
    ///
    /// A declared length that runs past the end of the section is repaired
    /// by shrinking it four bytes, the signature of one historical
    /// toolchain that counted the length field itself; a header that does
    /// not fit even then is structural corruption.
    pub fn parse(debug_info: EndianBuf<'_>, offset: DebugInfoOffset) -> Result<UnitHeader> {
        let mut buf = debug_info.range_from(offset.0)?;

        let first_word = buf.read_u32()?;
        let (format, mut unit_length) = if first_word == 0xffff_ffff {
            let length = buf.read_u64()?;
            let length = usize::try_from(length).map_err(|_| Error::CorruptUnitLength)?;
            (Format::Dwarf64, length)
        } else if first_word >= 0xffff_fff0 {
            // Reserved initial-length values.
            return Err(Error::CorruptUnitLength);
        } else {
            (Format::Dwarf32, first_word as usize)
        };

        if unit_length > buf.len() {
            if unit_length >= 4 && unit_length - 4 <= buf.len() {
                warn!(
                    offset = offset.0,
                    declared = unit_length,
                    "unit length overruns .debug_info; assuming the length field was counted"
                );
                unit_length -= 4;
            } else {
                return Err(Error::CorruptUnitLength);
            }
        }

        let version = buf.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(Error::UnknownVersion(version));
        }

        let abbrev_offset = DebugAbbrevOffset(buf.read_offset(format)?);
        let address_size = buf.read_u8()?;
        match address_size {
            2 | 4 | 8 => {}
            otherwise => return Err(Error::UnsupportedAddressSize(otherwise)),
        }

        Ok(UnitHeader {
            offset,
            unit_length,
            format,
            version,
            abbrev_offset,
            address_size,
        })
    }
}

/// An iterator over the compilation-unit headers of `.debug_info`.
///
/// A header that fails to parse ends iteration with its error; the caller
/// decides whether the units collected so far are worth keeping (they are:
/// each one is self-consistent).
#[derive(Debug, Clone)]
pub struct UnitHeadersIter<'data> {
    debug_info: EndianBuf<'data>,
    offset: usize,
}

impl<'data> UnitHeadersIter<'data> {
    /// Iterate the unit headers of the given `.debug_info` buffer.
    pub fn new(debug_info: EndianBuf<'data>) -> UnitHeadersIter<'data> {
        UnitHeadersIter {
            debug_info,
            offset: 0,
        }
    }
}

impl FallibleIterator for UnitHeadersIter<'_> {
    type Item = UnitHeader;
    type Error = Error;

    fn next(&mut self) -> Result<Option<UnitHeader>> {
        if self.offset >= self.debug_info.len() {
            return Ok(None);
        }
        let header = UnitHeader::parse(self.debug_info, DebugInfoOffset(self.offset))?;
        self.offset = header.end_offset().0;
        Ok(Some(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::RunTimeEndian;
    use test_assembler::{Endian, Label, LabelMaker, Section};

    fn section_buf(section: Section) -> Vec<u8> {
        section.get_contents().unwrap()
    }

    #[test]
    fn test_parse_unit_header_32() {
        let length = Label::new();
        let start = Label::new();
        let end = Label::new();
        let section = Section::with_endian(Endian::Little)
            .D32(&length)
            .mark(&start)
            .D16(4) // version
            .D32(0x10) // abbrev offset
            .D8(4) // address size
            .append_repeated(0, 7) // entries
            .mark(&end);
        length.set_const((&end - &start) as u64);
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);

        let header = UnitHeader::parse(buf, DebugInfoOffset(0)).unwrap();
        assert_eq!(header.version(), 4);
        assert_eq!(header.format(), Format::Dwarf32);
        assert_eq!(header.abbrev_offset(), DebugAbbrevOffset(0x10));
        assert_eq!(header.address_size(), 4);
        assert_eq!(header.header_size(), 11);
        assert_eq!(header.first_entry_offset(), DebugInfoOffset(11));
        assert_eq!(header.end_offset(), DebugInfoOffset(bytes.len()));
        assert!(header.contains_offset(DebugInfoOffset(11)));
        assert!(!header.contains_offset(DebugInfoOffset(bytes.len())));
    }

    #[test]
    fn test_parse_unit_header_64() {
        let length = Label::new();
        let start = Label::new();
        let end = Label::new();
        let section = Section::with_endian(Endian::Little)
            .D32(0xffff_ffff)
            .D64(&length)
            .mark(&start)
            .D16(3)
            .D64(0x20)
            .D8(8)
            .append_repeated(0, 3)
            .mark(&end);
        length.set_const((&end - &start) as u64);
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);

        let header = UnitHeader::parse(buf, DebugInfoOffset(0)).unwrap();
        assert_eq!(header.format(), Format::Dwarf64);
        assert_eq!(header.version(), 3);
        assert_eq!(header.address_size(), 8);
        assert_eq!(header.end_offset(), DebugInfoOffset(bytes.len()));
    }

    #[test]
    fn test_parse_unit_header_off_by_four_repair() {
        // unit_length counts itself: 4 too large. The repaired unit must
        // end exactly at the end of the section.
        let section = Section::with_endian(Endian::Little)
            .D32(11) // should be 7
            .D16(2)
            .D32(0)
            .D8(4);
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);

        let header = UnitHeader::parse(buf, DebugInfoOffset(0)).unwrap();
        assert_eq!(header.end_offset(), DebugInfoOffset(bytes.len()));
    }

    #[test]
    fn test_parse_unit_header_hopeless_length() {
        let section = Section::with_endian(Endian::Little)
            .D32(600) // nowhere near the section's size
            .D16(2)
            .D32(0)
            .D8(4);
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);
        assert_eq!(
            UnitHeader::parse(buf, DebugInfoOffset(0)),
            Err(Error::CorruptUnitLength)
        );
    }

    #[test]
    fn test_parse_unit_header_bad_version() {
        let section = Section::with_endian(Endian::Little)
            .D32(7)
            .D16(99)
            .D32(0)
            .D8(4);
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);
        assert_eq!(
            UnitHeader::parse(buf, DebugInfoOffset(0)),
            Err(Error::UnknownVersion(99))
        );
    }

    #[test]
    fn test_unit_headers_iter() {
        let section = Section::with_endian(Endian::Little)
            // Unit one.
            .D32(7)
            .D16(2)
            .D32(0)
            .D8(4)
            // Unit two.
            .D32(8)
            .D16(4)
            .D32(0x40)
            .D8(4)
            .D8(0); // one entry byte
        let bytes = section_buf(section);
        let buf = EndianBuf::new(&bytes, RunTimeEndian::Little);

        let mut iter = UnitHeadersIter::new(buf);
        let one = iter.next().unwrap().unwrap();
        let two = iter.next().unwrap().unwrap();
        assert!(iter.next().unwrap().is_none());

        assert_eq!(one.offset(), DebugInfoOffset(0));
        assert_eq!(two.offset(), one.end_offset());
        assert_eq!(two.abbrev_offset(), DebugAbbrevOffset(0x40));
    }
}
