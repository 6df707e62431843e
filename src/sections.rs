//! The raw inputs handed over by the executable-container reader.
//!
//! The engine never parses ELF or PE itself: whoever loaded the binary
//! supplies each debug section as a byte buffer, plus the target's address
//! size and byte order and a link-address translator.

use crate::buf::EndianBuf;
use crate::endian::RunTimeEndian;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// An identifier for one of the DWARF sections the engine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionId {
    /// The `.debug_abbrev` section.
    DebugAbbrev,
    /// The `.debug_frame` section.
    DebugFrame,
    /// The `.eh_frame` section.
    EhFrame,
    /// The `.debug_info` section.
    DebugInfo,
    /// The `.debug_line` section.
    DebugLine,
    /// The `.debug_loc` section.
    DebugLoc,
    /// The `.debug_pubnames` section.
    DebugPubNames,
    /// The `.debug_ranges` section.
    DebugRanges,
    /// The `.debug_str` section.
    DebugStr,
}

impl SectionId {
    /// Returns the canonical ELF section name.
    pub fn name(self) -> &'static str {
        match self {
            SectionId::DebugAbbrev => ".debug_abbrev",
            SectionId::DebugFrame => ".debug_frame",
            SectionId::EhFrame => ".eh_frame",
            SectionId::DebugInfo => ".debug_info",
            SectionId::DebugLine => ".debug_line",
            SectionId::DebugLoc => ".debug_loc",
            SectionId::DebugPubNames => ".debug_pubnames",
            SectionId::DebugRanges => ".debug_ranges",
            SectionId::DebugStr => ".debug_str",
        }
    }
}

/// Translates between module-relative link addresses (what the DWARF
/// records) and the absolute addresses the debug-service layer works with.
pub trait AddressTranslator: Send + Sync {
    /// Convert a link address to an absolute runtime address.
    fn to_absolute(&self, link: u64) -> u64;

    /// Convert an absolute runtime address back to a link address.
    fn to_link(&self, absolute: u64) -> u64;
}

/// A translator for images loaded at their link address, or shifted by a
/// constant load bias.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiasTranslator {
    /// Amount added to every link address at load time.
    pub bias: i64,
}

impl AddressTranslator for BiasTranslator {
    #[inline]
    fn to_absolute(&self, link: u64) -> u64 {
        link.wrapping_add(self.bias as u64)
    }

    #[inline]
    fn to_link(&self, absolute: u64) -> u64 {
        absolute.wrapping_sub(self.bias as u64)
    }
}

/// One symbol file's raw debug data: its sections, target parameters, and
/// identity (path + modification time, used as a cache-validity key).
pub struct SymbolFile<'data> {
    path: PathBuf,
    mtime: Option<SystemTime>,
    address_size: u8,
    endian: RunTimeEndian,
    translator: Box<dyn AddressTranslator>,
    sections: HashMap<SectionId, &'data [u8]>,
}

impl<'data> SymbolFile<'data> {
    /// Begin describing a symbol file with the given target parameters.
    pub fn new(path: impl Into<PathBuf>, address_size: u8, endian: RunTimeEndian) -> Self {
        SymbolFile {
            path: path.into(),
            mtime: None,
            address_size,
            endian,
            translator: Box::new(BiasTranslator::default()),
            sections: HashMap::new(),
        }
    }

    /// Record the file's last modification time.
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Install a link-address translator. Defaults to the identity mapping.
    pub fn with_translator(mut self, translator: Box<dyn AddressTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Provide the raw bytes of one section.
    pub fn with_section(mut self, id: SectionId, data: &'data [u8]) -> Self {
        self.sections.insert(id, data);
        self
    }

    /// The symbol file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The symbol file's last modification time, if known.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    /// The target's address size in bytes.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// The target's byte order.
    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    /// The link-address translator.
    pub fn translator(&self) -> &dyn AddressTranslator {
        &*self.translator
    }

    /// Look up a section's bytes as a readable buffer. Absent sections read
    /// as empty rather than failing, matching the best-effort posture of
    /// debug data; callers that cannot proceed without a section use
    /// [`SymbolFile::require`].
    pub fn section(&self, id: SectionId) -> EndianBuf<'data> {
        let bytes = self.sections.get(&id).copied().unwrap_or(&[]);
        EndianBuf::new(bytes, self.endian)
    }

    /// Look up a section that the caller cannot do without.
    pub fn require(&self, id: SectionId) -> Result<EndianBuf<'data>> {
        if self.sections.contains_key(&id) {
            Ok(self.section(id))
        } else {
            Err(Error::MissingSection(id.name()))
        }
    }

    /// True if the given section was provided.
    pub fn has_section(&self, id: SectionId) -> bool {
        self.sections.contains_key(&id)
    }
}

impl std::fmt::Debug for SymbolFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolFile")
            .field("path", &self.path)
            .field("address_size", &self.address_size)
            .field("endian", &self.endian)
            .field("sections", &self.sections.keys().map(|id| id.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_section_reads_empty() {
        let file = SymbolFile::new("/tmp/foo.elf", 4, RunTimeEndian::Little);
        assert!(file.section(SectionId::DebugInfo).is_empty());
        assert_eq!(
            file.require(SectionId::DebugInfo),
            Err(Error::MissingSection(".debug_info"))
        );
    }

    #[test]
    fn test_bias_translator_round_trip() {
        let t = BiasTranslator { bias: 0x1000 };
        assert_eq!(t.to_absolute(0x400), 0x1400);
        assert_eq!(t.to_link(0x1400), 0x400);

        let neg = BiasTranslator { bias: -0x80 };
        assert_eq!(neg.to_absolute(0x100), 0x80);
        assert_eq!(neg.to_link(0x80), 0x100);
    }
}
