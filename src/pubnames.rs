//! The `.debug_pubnames` lookup table.
//!
//! When present, the table lets a name query parse only the compilation
//! units that actually define the name instead of sweeping every unit.
//! Producers disagree about how complete the table is, so callers treat a
//! miss as "not known", never as "absent".

use crate::buf::{EndianBuf, Format};
use crate::error::{Error, Result};
use crate::unit::DebugInfoOffset;
use fallible_iterator::FallibleIterator;
use std::collections::HashMap;

/// A single pubname: a global name and the unit that defines it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubNameEntry {
    name: String,
    unit_offset: DebugInfoOffset,
}

impl PubNameEntry {
    /// The name, as the producer spelled it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `.debug_info` offset of the defining unit's header.
    pub fn unit_offset(&self) -> DebugInfoOffset {
        self.unit_offset
    }
}

/// An iterator over every entry of every set in `.debug_pubnames`.
#[derive(Debug, Clone)]
pub struct PubNamesIter<'data> {
    buf: EndianBuf<'data>,
    current_set: Option<PubNamesSet<'data>>,
}

#[derive(Debug, Clone)]
struct PubNamesSet<'data> {
    entries: EndianBuf<'data>,
    format: Format,
    unit_offset: DebugInfoOffset,
}

impl<'data> PubNamesIter<'data> {
    pub fn new(debug_pubnames: EndianBuf<'data>) -> PubNamesIter<'data> {
        PubNamesIter {
            buf: debug_pubnames,
            current_set: None,
        }
    }

    fn parse_set_header(&mut self) -> Result<PubNamesSet<'data>> {
        let (initial, format) = self.buf.read_initial_length()?;
        let set_length = usize::try_from(initial).map_err(|_| Error::CorruptUnitLength)?;
        let mut set = self.buf.split(set_length)?;

        let version = set.read_u16()?;
        if version != 2 {
            return Err(Error::UnknownVersion(version));
        }
        let unit_offset = DebugInfoOffset(set.read_offset(format)?);
        // The length of the unit's contribution; name lookup keys on the
        // header offset alone.
        let _unit_length = set.read_word(format)?;

        Ok(PubNamesSet {
            entries: set,
            format,
            unit_offset,
        })
    }
}

impl<'data> FallibleIterator for PubNamesIter<'data> {
    type Item = PubNameEntry;
    type Error = Error;

    fn next(&mut self) -> Result<Option<PubNameEntry>> {
        loop {
            let set = match self.current_set {
                Some(ref mut set) => set,
                None => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let set = self.parse_set_header()?;
                    self.current_set.insert(set)
                }
            };

            // A zero entry offset terminates the set.
            let die_offset = set.entries.read_word(set.format)?;
            if die_offset == 0 {
                self.current_set = None;
                continue;
            }
            let name = set.entries.read_string_lossy()?;
            return Ok(Some(PubNameEntry {
                name,
                unit_offset: set.unit_offset,
            }));
        }
    }
}

/// Build a name-to-units index from the whole section.
///
/// A name may be defined by several units (inline functions in headers),
/// so each name maps to every contributing unit.
pub fn build_index(
    debug_pubnames: EndianBuf<'_>,
) -> Result<HashMap<String, Vec<DebugInfoOffset>>> {
    let mut index: HashMap<String, Vec<DebugInfoOffset>> = HashMap::new();
    let mut iter = PubNamesIter::new(debug_pubnames);
    while let Some(entry) = iter.next()? {
        let units = index.entry(entry.name).or_default();
        if !units.contains(&entry.unit_offset) {
            units.push(entry.unit_offset);
        }
    }
    Ok(index)
}
