//! Parsing and caching of `.debug_abbrev` abbreviation tables.

use crate::buf::EndianBuf;
use crate::constants;
use crate::error::{Error, Result};
use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::Arc;

/// An offset into the `.debug_abbrev` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugAbbrevOffset(pub usize);

/// The set of abbreviations declared at one `.debug_abbrev` offset.
///
/// Maps an abbreviation code to the shape of an entry: its tag, whether it
/// has children, and the ordered list of attribute name/form pairs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Abbreviations {
    abbrevs: HashMap<u64, Abbreviation>,
}

impl Abbreviations {
    fn empty() -> Abbreviations {
        Abbreviations {
            abbrevs: HashMap::new(),
        }
    }

    /// Insert an abbreviation into the set.
    ///
    /// Returns `Err` if the code is already declared.
    fn insert(&mut self, abbrev: Abbreviation) -> Result<()> {
        match self.abbrevs.entry(abbrev.code) {
            hash_map::Entry::Occupied(_) => Err(Error::DuplicateAbbreviationCode),
            hash_map::Entry::Vacant(entry) => {
                entry.insert(abbrev);
                Ok(())
            }
        }
    }

    /// Get the abbreviation with the given code.
    #[inline]
    pub fn get(&self, code: u64) -> Option<&Abbreviation> {
        self.abbrevs.get(&code)
    }

    /// Parse a series of abbreviations, terminated by a zero code.
    pub fn parse(buf: &mut EndianBuf<'_>) -> Result<Abbreviations> {
        let mut abbrevs = Abbreviations::empty();
        while let Some(abbrev) = Abbreviation::parse(buf)? {
            abbrevs.insert(abbrev)?;
        }
        Ok(abbrevs)
    }
}

/// An abbreviation describes the shape of one kind of debugging information
/// entry: its code, tag, whether it has children, and its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbreviation {
    code: u64,
    tag: constants::DwTag,
    has_children: constants::DwChildren,
    attributes: Vec<AttributeSpecification>,
}

impl Abbreviation {
    /// Construct a new `Abbreviation`.
    ///
    /// # Panics
    ///
    /// Panics if `code` is `0`.
    pub fn new(
        code: u64,
        tag: constants::DwTag,
        has_children: constants::DwChildren,
        attributes: Vec<AttributeSpecification>,
    ) -> Abbreviation {
        assert_ne!(code, 0);
        Abbreviation {
            code,
            tag,
            has_children,
            attributes,
        }
    }

    /// Get this abbreviation's code.
    #[inline]
    pub fn code(&self) -> u64 {
        self.code
    }

    /// Get this abbreviation's tag.
    #[inline]
    pub fn tag(&self) -> constants::DwTag {
        self.tag
    }

    /// Return true if entries with this abbreviation have children.
    #[inline]
    pub fn has_children(&self) -> bool {
        self.has_children == constants::DW_CHILDREN_yes
    }

    /// Get this abbreviation's attribute specifications.
    #[inline]
    pub fn attributes(&self) -> &[AttributeSpecification] {
        &self.attributes[..]
    }

    /// Parse one abbreviation. Returns `None` at the zero-code terminator.
    fn parse(buf: &mut EndianBuf<'_>) -> Result<Option<Abbreviation>> {
        let code = buf.read_uleb128()?;
        if code == 0 {
            return Ok(None);
        }

        let tag = buf.read_uleb128()?;
        if tag == 0 {
            return Err(Error::ExpectedZero);
        }

        let has_children = constants::DwChildren(buf.read_u8()?);
        if has_children != constants::DW_CHILDREN_yes && has_children != constants::DW_CHILDREN_no {
            return Err(Error::ExpectedZero);
        }

        let mut attributes = Vec::new();
        loop {
            let name = buf.read_uleb128()?;
            let form = buf.read_uleb128()?;
            match (name, form) {
                (0, 0) => break,
                (0, _) | (_, 0) => return Err(Error::ExpectedZero),
                (name, form) => attributes.push(AttributeSpecification::new(
                    constants::DwAt(name),
                    constants::DwForm(form),
                )),
            }
        }

        Ok(Some(Abbreviation {
            code,
            tag: constants::DwTag(tag),
            has_children,
            attributes,
        }))
    }
}

/// The description of one attribute in an abbreviation: name and form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpecification {
    name: constants::DwAt,
    form: constants::DwForm,
}

impl AttributeSpecification {
    /// Construct a new `AttributeSpecification`.
    pub fn new(name: constants::DwAt, form: constants::DwForm) -> AttributeSpecification {
        AttributeSpecification { name, form }
    }

    /// Get the attribute's name.
    #[inline]
    pub fn name(&self) -> constants::DwAt {
        self.name
    }

    /// Get the attribute's form.
    #[inline]
    pub fn form(&self) -> constants::DwForm {
        self.form
    }
}

/// A cache of parsed abbreviation tables, keyed by their offset into
/// `.debug_abbrev`.
///
/// Many compilation units in one file share an abbreviation table, so each
/// distinct offset is parsed exactly once for the life of the provider.
#[derive(Debug, Default)]
pub struct AbbrevCache {
    tables: HashMap<DebugAbbrevOffset, Arc<Abbreviations>>,
}

impl AbbrevCache {
    /// Construct an empty cache.
    pub fn new() -> AbbrevCache {
        AbbrevCache::default()
    }

    /// Get the abbreviations at `offset` of the given `.debug_abbrev`
    /// buffer, parsing and memoizing them on first use.
    pub fn get(
        &mut self,
        debug_abbrev: EndianBuf<'_>,
        offset: DebugAbbrevOffset,
    ) -> Result<Arc<Abbreviations>> {
        if let Some(table) = self.tables.get(&offset) {
            return Ok(table.clone());
        }

        let mut buf = debug_abbrev.range_from(offset.0)?;
        let table = Arc::new(Abbreviations::parse(&mut buf)?);
        self.tables.insert(offset, table.clone());
        Ok(table)
    }

    /// Drop every cached table.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
