//! Helpers shared by the unit tests for building synthetic sections.

#![allow(missing_docs)]

use crate::abbrev::DebugAbbrevOffset;
use crate::buf::Format;
use crate::unit::{DebugInfoOffset, UnitHeader};
use test_assembler::{Label, Section};

/// Extra methods on `test_assembler::Section` for DWARF encodings.
pub trait SectionMethods {
    fn sleb(self, val: i64) -> Self;
    fn uleb(self, val: u64) -> Self;
    fn initial_length(self, format: Format, length: &Label, start: &Label) -> Self;
    fn word(self, format: Format, val: u64) -> Self;
}

impl SectionMethods for Section {
    fn sleb(mut self, mut val: i64) -> Self {
        while val & !0x3f != 0 && val | 0x3f != -1 {
            self = self.D8((val & 0x7f) as u8 | 0x80);
            val >>= 7;
        }
        self.D8((val & 0x7f) as u8)
    }

    fn uleb(mut self, mut val: u64) -> Self {
        while val & !0x7f != 0 {
            self = self.D8((val & 0x7f) as u8 | 0x80);
            val >>= 7;
        }
        self.D8(val as u8)
    }

    fn initial_length(self, format: Format, length: &Label, start: &Label) -> Self {
        match format {
            Format::Dwarf32 => self.D32(length).mark(start),
            Format::Dwarf64 => self.D32(0xffff_ffff).D64(length).mark(start),
        }
    }

    fn word(self, format: Format, val: u64) -> Self {
        match format {
            Format::Dwarf32 => self.D32(val as u32),
            Format::Dwarf64 => self.D64(val),
        }
    }
}

/// A DWARF32 unit header at section offset zero covering 0x1000 bytes,
/// for tests that need a header but not a real `.debug_info` stream.
pub fn test_unit_header(version: u16, address_size: u8) -> UnitHeader {
    UnitHeader::new(
        DebugInfoOffset(0),
        0x1000,
        Format::Dwarf32,
        version,
        DebugAbbrevOffset(0),
        address_size,
    )
}
