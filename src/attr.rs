//! Decoded attribute lists for debugging information entries.
//!
//! An entry of interest has its attributes decoded eagerly into an
//! [`AttributeList`], keyed by attribute name. Entries that are merely being
//! walked past still have every attribute value skipped byte-for-byte by its
//! form: sibling pointers cannot be trusted from every producer, so the only
//! robust traversal is exhaustive forward walking, and a single misread
//! width desynchronizes the rest of the unit's entry stream.

use crate::abbrev::Abbreviation;
use crate::buf::EndianBuf;
use crate::constants;
use crate::error::{Error, Result};
use crate::unit::{DebugInfoOffset, UnitHeader};

/// A decoded attribute value.
///
/// String-section references stay unresolved until asked for, so entries
/// whose names are never queried never touch `.debug_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeValue<'data> {
    /// A target address.
    Address(u64),
    /// An unsigned constant.
    Udata(u64),
    /// A signed constant.
    Sdata(i64),
    /// A boolean flag.
    Flag(bool),
    /// A block of bytes, including location expressions.
    Block(EndianBuf<'data>),
    /// A string stored inline in `.debug_info`.
    String(&'data [u8]),
    /// An offset of a string in `.debug_str`.
    StringRef(usize),
    /// A reference to another entry, as a section-level offset.
    Reference(DebugInfoOffset),
    /// An offset into another section (`.debug_line`, `.debug_loc`,
    /// `.debug_ranges`).
    SecOffset(usize),
}

/// The attributes of one debugging information entry, keyed by name.
///
/// Attribute order is preserved from the byte stream, but lists are short
/// (rarely more than a dozen entries), so lookup is a linear scan.
#[derive(Debug, Clone, Default)]
pub struct AttributeList<'data> {
    attrs: Vec<(constants::DwAt, AttributeValue<'data>)>,
}

impl<'data> AttributeList<'data> {
    /// Decode the attributes of the entry whose abbreviation is `abbrev`,
    /// reading from `buf` positioned just after the abbreviation code.
    pub fn parse(
        buf: &mut EndianBuf<'data>,
        abbrev: &Abbreviation,
        unit: &UnitHeader,
    ) -> Result<AttributeList<'data>> {
        let mut attrs = Vec::with_capacity(abbrev.attributes().len());
        for spec in abbrev.attributes() {
            let value = parse_form(buf, spec.form(), unit)?;
            attrs.push((spec.name(), value));
        }
        Ok(AttributeList { attrs })
    }

    /// Get the raw value of an attribute.
    pub fn value(&self, name: constants::DwAt) -> Option<AttributeValue<'data>> {
        self.attrs
            .iter()
            .find(|(at, _)| *at == name)
            .map(|(_, value)| *value)
    }

    /// True if the entry carries this attribute at all.
    pub fn has(&self, name: constants::DwAt) -> bool {
        self.value(name).is_some()
    }

    /// Get an attribute as an unsigned integer.
    pub fn udata(&self, name: constants::DwAt) -> Option<u64> {
        match self.value(name)? {
            AttributeValue::Udata(value) => Some(value),
            AttributeValue::Sdata(value) => Some(value as u64),
            AttributeValue::Address(value) => Some(value),
            AttributeValue::SecOffset(value) => Some(value as u64),
            AttributeValue::Flag(value) => Some(u64::from(value)),
            _ => None,
        }
    }

    /// Get an attribute as a signed integer.
    pub fn sdata(&self, name: constants::DwAt) -> Option<i64> {
        match self.value(name)? {
            AttributeValue::Sdata(value) => Some(value),
            AttributeValue::Udata(value) => Some(value as i64),
            _ => None,
        }
    }

    /// Get an attribute as a boolean flag. Constants are accepted because
    /// older producers emit flags as `DW_FORM_data1`.
    pub fn flag(&self, name: constants::DwAt) -> Option<bool> {
        match self.value(name)? {
            AttributeValue::Flag(value) => Some(value),
            AttributeValue::Udata(value) => Some(value != 0),
            AttributeValue::Sdata(value) => Some(value != 0),
            _ => None,
        }
    }

    /// Get an attribute as a target address.
    pub fn address(&self, name: constants::DwAt) -> Option<u64> {
        match self.value(name)? {
            AttributeValue::Address(value) => Some(value),
            _ => None,
        }
    }

    /// Get an attribute as a byte block.
    pub fn block(&self, name: constants::DwAt) -> Option<EndianBuf<'data>> {
        match self.value(name)? {
            AttributeValue::Block(buf) => Some(buf),
            _ => None,
        }
    }

    /// Get an attribute as a section offset. Plain constants are accepted
    /// because DWARF 2 and 3 producers emitted `data4`/`data8` here.
    pub fn sec_offset(&self, name: constants::DwAt) -> Option<usize> {
        match self.value(name)? {
            AttributeValue::SecOffset(value) => Some(value),
            AttributeValue::Udata(value) => usize::try_from(value).ok(),
            _ => None,
        }
    }

    /// Get an attribute as a reference to another entry.
    pub fn reference(&self, name: constants::DwAt) -> Option<DebugInfoOffset> {
        match self.value(name)? {
            AttributeValue::Reference(offset) => Some(offset),
            _ => None,
        }
    }

    /// Get an attribute as text, resolving `.debug_str` indirection with
    /// the given string section.
    pub fn text(&self, name: constants::DwAt, debug_str: EndianBuf<'data>) -> Option<String> {
        match self.value(name)? {
            AttributeValue::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            AttributeValue::StringRef(offset) => {
                let mut buf = debug_str.range_from(offset).ok()?;
                buf.read_string_lossy().ok()
            }
            _ => None,
        }
    }
}

/// Decode a single attribute value of the given form.
pub fn parse_form<'data>(
    buf: &mut EndianBuf<'data>,
    form: constants::DwForm,
    unit: &UnitHeader,
) -> Result<AttributeValue<'data>> {
    // DW_FORM_indirect stores the real form as a leading LEB128.
    let mut form = form;
    while form == constants::DW_FORM_indirect {
        form = constants::DwForm(buf.read_uleb128()?);
    }

    let value = match form {
        constants::DW_FORM_addr => AttributeValue::Address(buf.read_address(unit.address_size())?),
        constants::DW_FORM_data1 => AttributeValue::Udata(u64::from(buf.read_u8()?)),
        constants::DW_FORM_data2 => AttributeValue::Udata(u64::from(buf.read_u16()?)),
        constants::DW_FORM_data4 => AttributeValue::Udata(u64::from(buf.read_u32()?)),
        constants::DW_FORM_data8 => AttributeValue::Udata(buf.read_u64()?),
        constants::DW_FORM_udata => AttributeValue::Udata(buf.read_uleb128()?),
        constants::DW_FORM_sdata => AttributeValue::Sdata(buf.read_sleb128()?),
        constants::DW_FORM_flag => AttributeValue::Flag(buf.read_u8()? != 0),
        constants::DW_FORM_flag_present => AttributeValue::Flag(true),
        constants::DW_FORM_string => AttributeValue::String(buf.read_null_terminated()?),
        constants::DW_FORM_strp => AttributeValue::StringRef(buf.read_offset(unit.format())?),
        constants::DW_FORM_block1 => {
            let len = buf.read_u8()? as usize;
            AttributeValue::Block(buf.split(len)?)
        }
        constants::DW_FORM_block2 => {
            let len = buf.read_u16()? as usize;
            AttributeValue::Block(buf.split(len)?)
        }
        constants::DW_FORM_block4 => {
            let len = buf.read_u32()? as usize;
            AttributeValue::Block(buf.split(len)?)
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            let len = buf.read_uleb128()?;
            let len = usize::try_from(len).map_err(|_| Error::OffsetOutOfBounds)?;
            AttributeValue::Block(buf.split(len)?)
        }
        constants::DW_FORM_ref1 => unit_ref(unit, u64::from(buf.read_u8()?))?,
        constants::DW_FORM_ref2 => unit_ref(unit, u64::from(buf.read_u16()?))?,
        constants::DW_FORM_ref4 => unit_ref(unit, u64::from(buf.read_u32()?))?,
        constants::DW_FORM_ref8 => unit_ref(unit, buf.read_u64()?)?,
        constants::DW_FORM_ref_udata => unit_ref(unit, buf.read_uleb128()?)?,
        constants::DW_FORM_ref_addr => {
            // Section-relative, not unit-relative. DWARF 2 encoded this
            // with the address size; later versions use the format's word.
            let offset = if unit.version() == 2 {
                buf.read_address(unit.address_size())?
            } else {
                buf.read_word(unit.format())?
            };
            let offset = usize::try_from(offset).map_err(|_| Error::OffsetOutOfBounds)?;
            AttributeValue::Reference(DebugInfoOffset(offset))
        }
        constants::DW_FORM_sec_offset => AttributeValue::SecOffset(buf.read_offset(unit.format())?),
        constants::DW_FORM_ref_sig8 => {
            // Type-unit signatures are not modeled; keep the stream
            // position exact and carry the raw value.
            AttributeValue::Udata(buf.read_u64()?)
        }
        otherwise => return Err(Error::UnknownForm(otherwise)),
    };
    Ok(value)
}

fn unit_ref<'data>(unit: &UnitHeader, offset: u64) -> Result<AttributeValue<'data>> {
    let offset = usize::try_from(offset).map_err(|_| Error::OffsetOutOfBounds)?;
    let section = unit
        .offset()
        .0
        .checked_add(offset)
        .ok_or(Error::OffsetOutOfBounds)?;
    if !unit.contains_offset(DebugInfoOffset(section)) {
        return Err(Error::OffsetOutOfBounds);
    }
    Ok(AttributeValue::Reference(DebugInfoOffset(section)))
}

/// Skip one attribute value without decoding it.
///
/// This must consume exactly as many bytes as [`parse_form`] would.
pub fn skip_form(buf: &mut EndianBuf<'_>, form: constants::DwForm, unit: &UnitHeader) -> Result<()> {
    let mut form = form;
    while form == constants::DW_FORM_indirect {
        form = constants::DwForm(buf.read_uleb128()?);
    }

    match form {
        constants::DW_FORM_addr => buf.skip(unit.address_size() as usize)?,
        constants::DW_FORM_flag_present => {}
        constants::DW_FORM_data1 | constants::DW_FORM_ref1 | constants::DW_FORM_flag => {
            buf.skip(1)?
        }
        constants::DW_FORM_data2 | constants::DW_FORM_ref2 => buf.skip(2)?,
        constants::DW_FORM_data4 | constants::DW_FORM_ref4 => buf.skip(4)?,
        constants::DW_FORM_data8 | constants::DW_FORM_ref8 | constants::DW_FORM_ref_sig8 => {
            buf.skip(8)?
        }
        constants::DW_FORM_udata | constants::DW_FORM_ref_udata => {
            buf.read_uleb128()?;
        }
        constants::DW_FORM_sdata => {
            buf.read_sleb128()?;
        }
        constants::DW_FORM_string => {
            buf.read_null_terminated()?;
        }
        constants::DW_FORM_strp | constants::DW_FORM_sec_offset => {
            buf.skip(unit.format().word_size() as usize)?
        }
        constants::DW_FORM_ref_addr => {
            if unit.version() == 2 {
                buf.skip(unit.address_size() as usize)?
            } else {
                buf.skip(unit.format().word_size() as usize)?
            }
        }
        constants::DW_FORM_block1 => {
            let len = buf.read_u8()? as usize;
            buf.skip(len)?
        }
        constants::DW_FORM_block2 => {
            let len = buf.read_u16()? as usize;
            buf.skip(len)?
        }
        constants::DW_FORM_block4 => {
            let len = buf.read_u32()? as usize;
            buf.skip(len)?
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            let len = buf.read_uleb128()?;
            let len = usize::try_from(len).map_err(|_| Error::OffsetOutOfBounds)?;
            buf.skip(len)?
        }
        otherwise => return Err(Error::UnknownForm(otherwise)),
    }
    Ok(())
}

/// Skip all of an entry's attribute values.
pub fn skip_attributes(
    buf: &mut EndianBuf<'_>,
    abbrev: &Abbreviation,
    unit: &UnitHeader,
) -> Result<()> {
    for spec in abbrev.attributes() {
        skip_form(buf, spec.form(), unit)?;
    }
    Ok(())
}
