//! The debug-info tree builder.
//!
//! Both passes walk a compilation unit's entry stream the same way: each
//! entry starts with a LEB128 abbreviation code, zero pops the explicit
//! nesting stack, and every attribute of every entry is either decoded or
//! skipped byte-exactly by its form. Sibling pointers are never followed;
//! some producers emit corrupt ones, and a single bad skip desynchronizes
//! the rest of the unit.
//!
//! The scope pass and the type pass are separate because the information
//! is interleaved in the stream but needed at different lazy levels, and
//! because the type pass needs its own nesting stack of
//! current-parent-type to attach members, enumerators, bounds and template
//! parameters to the right enclosing type.

use crate::abbrev::{AbbrevCache, Abbreviation, Abbreviations};
use crate::attr::{self, AttributeList, AttributeValue};
use crate::buf::EndianBuf;
use crate::constants;
use crate::error::{Error, Result};
use crate::line::LineProgram;
use crate::loc::LocationProvider;
use crate::scope::{self, Scope, ScopeArena, ScopeId, ScopeKind, ScopeRanges, Variable};
use crate::sections::{SectionId, SymbolFile};
use crate::types::{
    ArrayBound, CompositeKind, Enumerator, Field, Inheritance, TemplateParam, Type, TypeKind,
    TypeRef, TypeTable,
};
use crate::unit::{DebugInfoOffset, UnitHeader, UnitHeadersIter};
use fallible_iterator::FallibleIterator;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// How far name resolution may chase `DW_AT_specification` and
/// `DW_AT_abstract_origin` chains.
const MAX_ORIGIN_DEPTH: usize = 8;

/// Everything the provider tracks per compilation unit.
#[derive(Debug)]
pub struct UnitState {
    pub header: UnitHeader,
    pub abbrevs: Arc<Abbreviations>,
    /// The compile-unit scope, once the scope pass has run.
    pub root: Option<ScopeId>,
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    pub low_pc: Option<u64>,
    stmt_list: Option<usize>,
    line: Option<LineProgram>,
    line_parsed: bool,
    pub scopes_parsed: bool,
    pub variables_parsed: bool,
    pub types_parsed: bool,
}

impl UnitState {
    fn new(header: UnitHeader, abbrevs: Arc<Abbreviations>) -> UnitState {
        UnitState {
            header,
            abbrevs,
            root: None,
            name: None,
            comp_dir: None,
            low_pc: None,
            stmt_list: None,
            line: None,
            line_parsed: false,
            scopes_parsed: false,
            variables_parsed: false,
            types_parsed: false,
        }
    }
}

/// Borrowed view of the provider's mutable tables during a parse.
pub(crate) struct Builder<'a, 'data> {
    pub file: &'a SymbolFile<'data>,
    pub units: &'a mut Vec<UnitState>,
    pub abbrev_cache: &'a mut AbbrevCache,
    pub scopes: &'a mut ScopeArena,
    pub types: &'a mut TypeTable,
}

/// Per-unit read-only context threaded through the walkers.
struct UnitCtx<'data> {
    header: UnitHeader,
    abbrevs: Arc<Abbreviations>,
    debug_info: EndianBuf<'data>,
    debug_str: EndianBuf<'data>,
}

impl<'data> UnitCtx<'data> {
    fn address_size(&self) -> u8 {
        self.header.address_size()
    }
}

impl<'a, 'data> Builder<'a, 'data> {
    /// Parse every compilation-unit header plus the root entry's own
    /// attributes (unit name, compilation directory, base address, line
    /// program offset).
    ///
    /// A header that fails to parse ends the scan with a warning; the
    /// units already collected stay valid.
    pub fn parse_unit_headers(&mut self) -> Result<()> {
        let debug_info = self.file.require(SectionId::DebugInfo)?;
        let debug_abbrev = self.file.require(SectionId::DebugAbbrev)?;

        let mut iter = UnitHeadersIter::new(debug_info);
        loop {
            let header = match iter.next() {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "stopping unit enumeration at a corrupt header");
                    break;
                }
            };
            let abbrevs = self
                .abbrev_cache
                .get(debug_abbrev, header.abbrev_offset())?;
            let mut state = UnitState::new(header, abbrevs);
            if let Err(error) = self.read_unit_attributes(&mut state, debug_info) {
                warn!(
                    offset = header.offset().0,
                    %error,
                    "could not read the unit's root entry"
                );
            }
            self.units.push(state);
        }
        debug!(units = self.units.len(), "enumerated compilation units");
        Ok(())
    }

    fn read_unit_attributes(
        &mut self,
        state: &mut UnitState,
        debug_info: EndianBuf<'data>,
    ) -> Result<()> {
        let debug_str = self.file.section(SectionId::DebugStr);
        let mut buf = state.header.entries(debug_info)?;
        let code = buf.read_uleb128()?;
        if code == 0 {
            return Ok(());
        }
        let abbrev = state
            .abbrevs
            .get(code)
            .ok_or(Error::UnknownAbbreviation(code))?;
        let attrs = AttributeList::parse(&mut buf, abbrev, &state.header)?;

        state.name = attrs.text(constants::DW_AT_name, debug_str);
        state.comp_dir = attrs.text(constants::DW_AT_comp_dir, debug_str);
        state.low_pc = attrs.address(constants::DW_AT_low_pc);
        state.stmt_list = attrs.sec_offset(constants::DW_AT_stmt_list);
        Ok(())
    }

    fn unit_ctx(&self, index: usize) -> Result<UnitCtx<'data>> {
        Ok(UnitCtx {
            header: self.units[index].header,
            abbrevs: Arc::clone(&self.units[index].abbrevs),
            debug_info: self.file.require(SectionId::DebugInfo)?,
            debug_str: self.file.section(SectionId::DebugStr),
        })
    }

    /// Index of the unit whose byte range contains `offset`.
    pub fn unit_index_for(&self, offset: DebugInfoOffset) -> Option<usize> {
        self.units
            .iter()
            .position(|state| state.header.contains_offset(offset))
    }

    /// Parse the unit's line program once, on demand.
    fn ensure_line(&mut self, index: usize) {
        if self.units[index].line_parsed {
            return;
        }
        self.units[index].line_parsed = true;
        let Some(offset) = self.units[index].stmt_list else {
            return;
        };
        let debug_line = self.file.section(SectionId::DebugLine);
        let address_size = self.units[index].header.address_size();
        match LineProgram::parse(debug_line, offset, address_size) {
            Ok(line) => self.units[index].line = Some(line),
            Err(error) => {
                warn!(
                    unit = self.units[index].header.offset().0,
                    %error,
                    "skipping a corrupt line program"
                );
            }
        }
    }

    pub fn line_for(&mut self, index: usize) -> Option<&LineProgram> {
        self.ensure_line(index);
        self.units[index].line.as_ref()
    }

    // ------------------------------------------------------------------
    // Scope pass
    // ------------------------------------------------------------------

    /// Build the unit's scope tree: the function and lexical-block
    /// structure with address ranges, but no variables yet.
    pub fn ensure_scopes(&mut self, index: usize) -> Result<()> {
        if self.units[index].scopes_parsed {
            return Ok(());
        }
        // Committed first: a malformed unit degrades to whatever was
        // registered before the error, and is not retried per query.
        self.units[index].scopes_parsed = true;

        let ctx = self.unit_ctx(index)?;
        if let Err(error) = self.walk_scopes(index, &ctx) {
            warn!(
                unit = ctx.header.offset().0,
                %error,
                "abandoning the rest of this unit's scope pass"
            );
        }

        if let Some(root) = self.units[index].root {
            self.ensure_line(index);
            let line = self.units[index].line.take();
            self.scopes.repair_ranges(root, line.as_ref());
            self.units[index].line = line;
        }
        Ok(())
    }

    fn walk_scopes(&mut self, index: usize, ctx: &UnitCtx<'data>) -> Result<()> {
        let mut buf = ctx.header.entries(ctx.debug_info)?;
        let mut stack: Vec<Option<ScopeId>> = Vec::new();
        let mut current: Option<ScopeId> = None;

        while !buf.is_empty() {
            let entry_offset = DebugInfoOffset(buf.offset_from(&ctx.debug_info));
            let code = buf.read_uleb128()?;
            if code == 0 {
                match stack.pop() {
                    Some(previous) => current = previous,
                    None => break,
                }
                continue;
            }
            let abbrev = ctx
                .abbrevs
                .get(code)
                .ok_or(Error::UnknownAbbreviation(code))?;

            let made = match abbrev.tag() {
                constants::DW_TAG_compile_unit | constants::DW_TAG_partial_unit => {
                    let attrs = AttributeList::parse(&mut buf, abbrev, &ctx.header)?;
                    let mut scope = Scope::new(ScopeKind::CompileUnit, entry_offset);
                    scope.name = attrs.text(constants::DW_AT_name, ctx.debug_str);
                    scope.ranges = self.read_ranges(ctx, &attrs, index)?;
                    let id = self.scopes.alloc(scope, current);
                    self.units[index].root = Some(id);
                    Some(id)
                }
                constants::DW_TAG_module | constants::DW_TAG_namespace => {
                    let attrs = AttributeList::parse(&mut buf, abbrev, &ctx.header)?;
                    let mut scope = Scope::new(ScopeKind::Module, entry_offset);
                    scope.name = attrs.text(constants::DW_AT_name, ctx.debug_str);
                    Some(self.scopes.alloc(scope, current))
                }
                constants::DW_TAG_subprogram | constants::DW_TAG_inlined_subroutine => {
                    let attrs = AttributeList::parse(&mut buf, abbrev, &ctx.header)?;
                    let mut scope = Scope::new(ScopeKind::Function, entry_offset);
                    scope.name = self.entry_display_name(ctx, &attrs);
                    scope.ranges = self.read_ranges(ctx, &attrs, index)?;
                    scope.inlined = abbrev.tag() == constants::DW_TAG_inlined_subroutine;
                    scope.frame_base =
                        self.read_location(ctx, &attrs, constants::DW_AT_frame_base, index);
                    Some(self.scopes.alloc(scope, current))
                }
                constants::DW_TAG_lexical_block => {
                    let attrs = AttributeList::parse(&mut buf, abbrev, &ctx.header)?;
                    let mut scope = Scope::new(ScopeKind::LexicalBlock, entry_offset);
                    scope.ranges = self.read_ranges(ctx, &attrs, index)?;
                    Some(self.scopes.alloc(scope, current))
                }
                _ => {
                    attr::skip_attributes(&mut buf, abbrev, &ctx.header)?;
                    None
                }
            };

            if abbrev.has_children() {
                stack.push(current);
                if let Some(id) = made {
                    current = Some(id);
                }
            }
        }
        Ok(())
    }

    /// Decode an entry's address coverage from `DW_AT_low_pc` +
    /// `DW_AT_high_pc` (address or offset form) or `DW_AT_ranges`.
    fn read_ranges(
        &mut self,
        ctx: &UnitCtx<'data>,
        attrs: &AttributeList<'data>,
        index: usize,
    ) -> Result<ScopeRanges> {
        if let Some(offset) = attrs.sec_offset(constants::DW_AT_ranges) {
            let debug_ranges = self.file.section(SectionId::DebugRanges);
            let base = self.units[index].low_pc.unwrap_or(0);
            match scope::parse_range_list(debug_ranges, offset, base, ctx.address_size()) {
                Ok(ranges) if !ranges.is_empty() => return Ok(ScopeRanges::List(ranges)),
                Ok(_) => return Ok(ScopeRanges::Unknown),
                Err(error) => {
                    warn!(offset, %error, "skipping a corrupt range list");
                    return Ok(ScopeRanges::Unknown);
                }
            }
        }

        let Some(low) = attrs.address(constants::DW_AT_low_pc) else {
            return Ok(ScopeRanges::Unknown);
        };
        let high = match attrs.value(constants::DW_AT_high_pc) {
            Some(AttributeValue::Address(high)) => high,
            // DWARF 4 allows high_pc as an offset from low_pc.
            Some(AttributeValue::Udata(size)) => low.wrapping_add(size),
            _ => return Ok(ScopeRanges::Unknown),
        };
        Ok(ScopeRanges::contiguous(low, high))
    }

    /// Decode a location attribute into a provider: an expression block
    /// inline, or a `.debug_loc` offset.
    fn read_location(
        &mut self,
        ctx: &UnitCtx<'data>,
        attrs: &AttributeList<'data>,
        name: constants::DwAt,
        index: usize,
    ) -> Option<LocationProvider> {
        if let Some(block) = attrs.block(name) {
            return Some(LocationProvider::Expression(block.bytes().to_vec()));
        }
        // DWARF 2 and 3 encode the list offset with plain data forms.
        let offset = attrs.sec_offset(name)?;
        let debug_loc = self.file.section(SectionId::DebugLoc);
        let base = self.units[index].low_pc.unwrap_or(0);
        match LocationProvider::parse_list(debug_loc, offset, base, ctx.address_size()) {
            Ok(provider) => Some(provider),
            Err(error) => {
                warn!(offset, %error, "skipping a corrupt location list");
                None
            }
        }
    }

    /// An entry's display name: `DW_AT_name`, or the name of whatever
    /// `DW_AT_specification` / `DW_AT_abstract_origin` points at.
    fn entry_display_name(
        &mut self,
        ctx: &UnitCtx<'data>,
        attrs: &AttributeList<'data>,
    ) -> Option<String> {
        if let Some(name) = attrs.text(constants::DW_AT_name, ctx.debug_str) {
            return Some(name);
        }
        let origin = attrs
            .reference(constants::DW_AT_specification)
            .or_else(|| attrs.reference(constants::DW_AT_abstract_origin))?;
        self.entry_name_at(origin, MAX_ORIGIN_DEPTH)
    }

    /// Resolve the name of the entry at `offset`, chasing origin chains,
    /// including into units whose trees have not been built.
    pub fn entry_name_at(&mut self, offset: DebugInfoOffset, depth: usize) -> Option<String> {
        if depth == 0 {
            warn!(offset = offset.0, "origin chain too deep; giving up on the name");
            return None;
        }
        let index = self.unit_index_for(offset)?;
        let ctx = self.unit_ctx(index).ok()?;
        let attrs = self.entry_at(&ctx, offset).ok()?;
        if let Some(name) = attrs.text(constants::DW_AT_name, ctx.debug_str) {
            return Some(name);
        }
        let origin = attrs
            .reference(constants::DW_AT_specification)
            .or_else(|| attrs.reference(constants::DW_AT_abstract_origin))?;
        self.entry_name_at(origin, depth - 1)
    }

    /// Decode the single entry at `offset` into its attribute list.
    fn entry_at(
        &self,
        ctx: &UnitCtx<'data>,
        offset: DebugInfoOffset,
    ) -> Result<AttributeList<'data>> {
        let mut buf = ctx.header.entries_at(ctx.debug_info, offset)?;
        let code = buf.read_uleb128()?;
        if code == 0 {
            // A null entry here means the reference aimed at a sibling
            // terminator rather than a real entry.
            return Err(Error::AbbreviationCodeZero);
        }
        let abbrev = ctx
            .abbrevs
            .get(code)
            .ok_or(Error::UnknownAbbreviation(code))?;
        AttributeList::parse(&mut buf, abbrev, &ctx.header)
    }

    // ------------------------------------------------------------------
    // Variable pass
    // ------------------------------------------------------------------

    /// Attach variables and formal parameters to the unit's scopes.
    pub fn ensure_variables(&mut self, index: usize) -> Result<()> {
        self.ensure_scopes(index)?;
        if self.units[index].variables_parsed {
            return Ok(());
        }
        self.units[index].variables_parsed = true;

        let Some(root) = self.units[index].root else {
            return Ok(());
        };
        let mut scope_by_offset = HashMap::new();
        for id in self.scopes.descendants(root) {
            scope_by_offset.insert(self.scopes.get(id).offset, id);
        }

        let ctx = self.unit_ctx(index)?;
        if let Err(error) = self.walk_variables(index, &ctx, &scope_by_offset) {
            warn!(
                unit = ctx.header.offset().0,
                %error,
                "abandoning the rest of this unit's variable pass"
            );
        }
        Ok(())
    }

    fn walk_variables(
        &mut self,
        index: usize,
        ctx: &UnitCtx<'data>,
        scope_by_offset: &HashMap<DebugInfoOffset, ScopeId>,
    ) -> Result<()> {
        let mut buf = ctx.header.entries(ctx.debug_info)?;
        let mut stack: Vec<Option<ScopeId>> = Vec::new();
        let mut current: Option<ScopeId> = None;

        while !buf.is_empty() {
            let entry_offset = DebugInfoOffset(buf.offset_from(&ctx.debug_info));
            let code = buf.read_uleb128()?;
            if code == 0 {
                match stack.pop() {
                    Some(previous) => current = previous,
                    None => break,
                }
                continue;
            }
            let abbrev = ctx
                .abbrevs
                .get(code)
                .ok_or(Error::UnknownAbbreviation(code))?;

            let scope_here = scope_by_offset.get(&entry_offset).copied();
            match abbrev.tag() {
                constants::DW_TAG_variable | constants::DW_TAG_formal_parameter => {
                    let attrs = AttributeList::parse(&mut buf, abbrev, &ctx.header)?;
                    if let Some(owner) = current {
                        let variable = self.build_variable(index, ctx, &attrs);
                        self.scopes.get_mut(owner).variables.push(variable);
                    }
                }
                _ => {
                    attr::skip_attributes(&mut buf, abbrev, &ctx.header)?;
                }
            }

            if abbrev.has_children() {
                stack.push(current);
                if let Some(id) = scope_here {
                    current = Some(id);
                }
            }
        }
        Ok(())
    }

    fn build_variable(
        &mut self,
        index: usize,
        ctx: &UnitCtx<'data>,
        attrs: &AttributeList<'data>,
    ) -> Variable {
        let decl_file = attrs.udata(constants::DW_AT_decl_file).and_then(|file| {
            let comp_dir = self.units[index].comp_dir.clone();
            self.line_for(index)
                .and_then(|line| line.file_path(file, comp_dir.as_deref()))
        });
        Variable {
            name: self.entry_display_name(ctx, attrs),
            type_ref: attrs.reference(constants::DW_AT_type).map(TypeRef),
            location: self.read_location(ctx, attrs, constants::DW_AT_location, index),
            decl_file,
            decl_line: attrs.udata(constants::DW_AT_decl_line),
            decl_column: attrs.udata(constants::DW_AT_decl_column),
            artificial: attrs.flag(constants::DW_AT_artificial).unwrap_or(false),
            external: attrs.flag(constants::DW_AT_external).unwrap_or(false),
        }
    }

    // ------------------------------------------------------------------
    // Type pass
    // ------------------------------------------------------------------

    /// Register every type the unit defines.
    pub fn ensure_types(&mut self, index: usize) -> Result<()> {
        if self.units[index].types_parsed {
            return Ok(());
        }
        self.units[index].types_parsed = true;

        let ctx = self.unit_ctx(index)?;
        let mut buf = ctx.header.entries(ctx.debug_info)?;
        if let Err(error) = self.walk_type_stream(&ctx, &mut buf, false) {
            warn!(
                unit = ctx.header.offset().0,
                %error,
                "abandoning the rest of this unit's type pass"
            );
        }
        Ok(())
    }

    /// Resolve a type reference, decoding on demand.
    ///
    /// Memoized in the type table; a reference into a unit never walked
    /// triggers a minimal walk of just that entry's subtree. A cyclic
    /// reference hits the table's in-progress sentinel and yields the
    /// unhandled placeholder, as does any reference that cannot be
    /// decoded.
    pub fn resolve_type_ref(&mut self, type_ref: TypeRef) -> Result<Arc<Type>> {
        let offset = type_ref.offset();
        // The table is moved out for the duration of the decode so that a
        // scoped builder can borrow it alongside the other passes' state.
        let mut types = std::mem::take(self.types);
        let resolved = types.resolve_with(offset, |types| {
            Builder {
                file: self.file,
                units: &mut *self.units,
                abbrev_cache: &mut *self.abbrev_cache,
                scopes: &mut *self.scopes,
                types,
            }
            .parse_type_at(offset)
        });
        *self.types = types;
        resolved
    }

    fn parse_type_at(&mut self, offset: DebugInfoOffset) -> Result<()> {
        let index = self
            .unit_index_for(offset)
            .ok_or(Error::UnresolvedReference(offset.0))?;
        let ctx = self.unit_ctx(index)?;
        let mut buf = ctx.header.entries_at(ctx.debug_info, offset)?;
        self.walk_type_stream(&ctx, &mut buf, true)
    }

    fn walk_type_stream(
        &mut self,
        ctx: &UnitCtx<'data>,
        buf: &mut EndianBuf<'data>,
        single: bool,
    ) -> Result<()> {
        let mut stack: Vec<TypeFrame> = Vec::new();

        while !buf.is_empty() {
            let entry_offset = DebugInfoOffset(buf.offset_from(&ctx.debug_info));
            let code = buf.read_uleb128()?;
            if code == 0 {
                let Some(frame) = stack.pop() else {
                    break;
                };
                self.finish_frame(frame, stack.last_mut());
                if single && stack.is_empty() {
                    return Ok(());
                }
                continue;
            }
            let abbrev = ctx
                .abbrevs
                .get(code)
                .ok_or(Error::UnknownAbbreviation(code))?;

            let frame = self.enter_type_entry(ctx, buf, entry_offset, abbrev, stack.last_mut())?;
            if abbrev.has_children() {
                stack.push(frame);
            } else {
                self.finish_frame(frame, stack.last_mut());
                if single && stack.is_empty() {
                    return Ok(());
                }
            }
        }
        // A truncated stream leaves open frames; close what we have so
        // their types are still registered.
        while let Some(frame) = stack.pop() {
            self.finish_frame(frame, stack.last_mut());
        }
        Ok(())
    }

    /// Decode one entry of the type pass, producing the frame pushed for
    /// its children.
    fn enter_type_entry(
        &mut self,
        ctx: &UnitCtx<'data>,
        buf: &mut EndianBuf<'data>,
        offset: DebugInfoOffset,
        abbrev: &Abbreviation,
        parent: Option<&mut TypeFrame>,
    ) -> Result<TypeFrame> {
        let tag = abbrev.tag();
        match tag {
            constants::DW_TAG_base_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                let encoding = constants::DwAte(
                    attrs.udata(constants::DW_AT_encoding).unwrap_or(0) as u8,
                );
                self.register(Type::new(
                    offset,
                    attrs.text(constants::DW_AT_name, ctx.debug_str),
                    attrs.udata(constants::DW_AT_byte_size),
                    TypeKind::Base { encoding },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_pointer_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                let byte_size = attrs
                    .udata(constants::DW_AT_byte_size)
                    .or(Some(u64::from(ctx.address_size())));
                self.register(Type::new(
                    offset,
                    attrs.text(constants::DW_AT_name, ctx.debug_str),
                    byte_size,
                    TypeKind::Pointer {
                        target: type_attr(&attrs),
                    },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_reference_type | constants::DW_TAG_rvalue_reference_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                self.register(Type::new(
                    offset,
                    None,
                    Some(u64::from(ctx.address_size())),
                    TypeKind::Reference {
                        target: type_attr(&attrs),
                    },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_restrict_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                self.register(Type::new(
                    offset,
                    None,
                    None,
                    TypeKind::Qualifier {
                        tag,
                        target: type_attr(&attrs),
                    },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_typedef => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                self.register(Type::new(
                    offset,
                    attrs.text(constants::DW_AT_name, ctx.debug_str),
                    None,
                    TypeKind::Typedef {
                        target: type_attr(&attrs),
                    },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_array_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                Ok(TypeFrame::Array {
                    offset,
                    name: attrs.text(constants::DW_AT_name, ctx.debug_str),
                    byte_size: attrs.udata(constants::DW_AT_byte_size),
                    element: type_attr(&attrs),
                    bounds: Vec::new(),
                })
            }
            constants::DW_TAG_subrange_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                if let Some(TypeFrame::Array { bounds, .. }) = parent {
                    let lower = attrs.sdata(constants::DW_AT_lower_bound).unwrap_or(0);
                    let count = attrs.udata(constants::DW_AT_count).or_else(|| {
                        attrs
                            .sdata(constants::DW_AT_upper_bound)
                            .and_then(|upper| subrange_count(lower, upper))
                    });
                    bounds.push(ArrayBound { lower, count });
                }
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_structure_type
            | constants::DW_TAG_class_type
            | constants::DW_TAG_union_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                let kind = match tag {
                    constants::DW_TAG_class_type => CompositeKind::Class,
                    constants::DW_TAG_union_type => CompositeKind::Union,
                    _ => CompositeKind::Struct,
                };
                Ok(TypeFrame::Composite(PendingComposite {
                    offset,
                    name: attrs.text(constants::DW_AT_name, ctx.debug_str),
                    byte_size: attrs.udata(constants::DW_AT_byte_size),
                    kind,
                    declaration: attrs.flag(constants::DW_AT_declaration).unwrap_or(false),
                    fields: Vec::new(),
                    inherits: Vec::new(),
                    template_params: Vec::new(),
                    nested_unions: Vec::new(),
                }))
            }
            constants::DW_TAG_member => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                if let Some(TypeFrame::Composite(pending)) = parent {
                    pending.fields.push(Field {
                        name: attrs
                            .text(constants::DW_AT_name, ctx.debug_str)
                            .unwrap_or_default(),
                        type_ref: type_attr(&attrs),
                        byte_offset: member_offset(&attrs),
                        bit_size: attrs.udata(constants::DW_AT_bit_size),
                        bit_offset: attrs.udata(constants::DW_AT_bit_offset),
                    });
                }
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_inheritance => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                if let (Some(TypeFrame::Composite(pending)), Some(base)) =
                    (parent, type_attr(&attrs))
                {
                    pending.inherits.push(Inheritance {
                        base,
                        byte_offset: member_offset(&attrs),
                    });
                }
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_template_type_parameter
            | constants::DW_TAG_template_value_parameter => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                let actual = type_attr(&attrs);
                let name = attrs.text(constants::DW_AT_name, ctx.debug_str);
                if let Some(TypeFrame::Composite(pending)) = parent {
                    pending.template_params.push(TemplateParam {
                        name: name.clone().unwrap_or_default(),
                        actual,
                    });
                }
                self.register(Type::new(
                    offset,
                    name,
                    None,
                    TypeKind::TemplateParameter { actual },
                ));
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_enumeration_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                Ok(TypeFrame::Enumeration {
                    offset,
                    name: attrs.text(constants::DW_AT_name, ctx.debug_str),
                    byte_size: attrs.udata(constants::DW_AT_byte_size),
                    underlying: type_attr(&attrs),
                    enumerators: Vec::new(),
                })
            }
            constants::DW_TAG_enumerator => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                if let Some(TypeFrame::Enumeration { enumerators, .. }) = parent {
                    enumerators.push(Enumerator {
                        name: attrs
                            .text(constants::DW_AT_name, ctx.debug_str)
                            .unwrap_or_default(),
                        value: attrs.sdata(constants::DW_AT_const_value).unwrap_or(0),
                    });
                }
                Ok(TypeFrame::Other)
            }
            constants::DW_TAG_subroutine_type => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                Ok(TypeFrame::Subroutine {
                    offset,
                    name: attrs.text(constants::DW_AT_name, ctx.debug_str),
                    return_type: type_attr(&attrs),
                    parameters: Vec::new(),
                })
            }
            constants::DW_TAG_formal_parameter => {
                let attrs = AttributeList::parse(buf, abbrev, &ctx.header)?;
                if let Some(TypeFrame::Subroutine { parameters, .. }) = parent {
                    parameters.push(type_attr(&attrs));
                }
                Ok(TypeFrame::Other)
            }
            _ => {
                attr::skip_attributes(buf, abbrev, &ctx.header)?;
                Ok(TypeFrame::Other)
            }
        }
    }

    /// Close a frame popped by the zero terminator (or by a childless
    /// entry), registering the finished type.
    fn finish_frame(&mut self, frame: TypeFrame, parent: Option<&mut TypeFrame>) {
        match frame {
            TypeFrame::Other => {}
            TypeFrame::Array {
                offset,
                name,
                byte_size,
                element,
                bounds,
            } => {
                self.register(Type::new(
                    offset,
                    name,
                    byte_size,
                    TypeKind::Array { element, bounds },
                ));
            }
            TypeFrame::Enumeration {
                offset,
                name,
                byte_size,
                underlying,
                enumerators,
            } => {
                self.register(Type::new(
                    offset,
                    name,
                    byte_size,
                    TypeKind::Enumeration {
                        underlying,
                        enumerators,
                    },
                ));
            }
            TypeFrame::Subroutine {
                offset,
                name,
                return_type,
                parameters,
            } => {
                self.register(Type::new(
                    offset,
                    name,
                    None,
                    TypeKind::Subroutine {
                        return_type,
                        parameters,
                    },
                ));
            }
            TypeFrame::Composite(pending) => {
                // An RVCT anonymous union surfaces as a nested child named
                // `__C<digits>` with no member referencing it; the parent
                // composite patches in a synthetic field for it.
                let synthetic_union = if pending.kind == CompositeKind::Union {
                    pending
                        .name
                        .as_deref()
                        .and_then(unnamed_union_digits)
                        .map(|digits| (digits, TypeRef(pending.offset), pending.byte_size))
                } else {
                    None
                };
                let completed = self.finish_composite(pending);
                self.register(completed);
                if let (Some(found), Some(TypeFrame::Composite(owner))) = (synthetic_union, parent)
                {
                    owner.nested_unions.push(found);
                }
            }
        }
    }

    fn finish_composite(&mut self, mut pending: PendingComposite) -> Type {
        let nested = std::mem::take(&mut pending.nested_unions);
        for (digits, union_ref, union_size) in nested {
            if pending.fields.iter().any(|field| field.type_ref == Some(union_ref)) {
                continue;
            }
            let Some(union_size) = union_size.filter(|size| *size > 0) else {
                continue;
            };
            let Some(gap) = self.find_field_gap(&pending, union_size) else {
                warn!(
                    offset = pending.offset.0,
                    "no gap fits the anonymous union; leaving it out"
                );
                continue;
            };
            debug!(
                offset = pending.offset.0,
                gap, "patched an anonymous union into its owner"
            );
            let position = pending
                .fields
                .iter()
                .position(|field| field.byte_offset > gap)
                .unwrap_or(pending.fields.len());
            pending.fields.insert(
                position,
                Field {
                    name: format!("$unnamed${}", digits),
                    type_ref: Some(union_ref),
                    byte_offset: gap,
                    bit_size: None,
                    bit_offset: None,
                },
            );
        }

        Type::new(
            pending.offset,
            pending.name,
            pending.byte_size,
            TypeKind::Composite {
                kind: pending.kind,
                fields: pending.fields,
                inherits: pending.inherits,
                template_params: pending.template_params,
                declaration: pending.declaration,
            },
        )
    }

    /// First byte offset where a block of `size` bytes overlaps no
    /// existing member of `pending`.
    fn find_field_gap(&mut self, pending: &PendingComposite, size: u64) -> Option<u64> {
        let total = pending.byte_size?;
        if size > total {
            return None;
        }
        let mut occupied = Vec::with_capacity(pending.fields.len());
        for field in &pending.fields {
            let Some(type_ref) = field.type_ref else {
                continue;
            };
            // Uses the resolver, so a member type defined later in the
            // stream is still sized correctly.
            let field_size = match self.resolve_type_ref(type_ref) {
                Ok(ty) => ty.byte_size().unwrap_or(0),
                Err(_) => 0,
            };
            if field_size > 0 {
                occupied.push((field.byte_offset, field.byte_offset.saturating_add(field_size)));
            }
        }
        (0..=total - size).find(|&candidate| {
            occupied
                .iter()
                .all(|&(low, high)| candidate + size <= low || candidate >= high)
        })
    }

    fn register(&mut self, ty: Type) {
        // Keep a previously resolved identity so repeated resolution never
        // changes the table, but let a real decode replace the placeholder
        // a cyclic edge left behind.
        match self.types.get(ty.offset()) {
            Some(existing) if !existing.is_unhandled() => {}
            _ => {
                self.types.insert(ty);
            }
        }
    }
}

/// One level of the type pass's explicit nesting stack.
enum TypeFrame {
    /// An entry that contributes no type of its own.
    Other,
    Composite(PendingComposite),
    Array {
        offset: DebugInfoOffset,
        name: Option<String>,
        byte_size: Option<u64>,
        element: Option<TypeRef>,
        bounds: Vec<ArrayBound>,
    },
    Enumeration {
        offset: DebugInfoOffset,
        name: Option<String>,
        byte_size: Option<u64>,
        underlying: Option<TypeRef>,
        enumerators: Vec<Enumerator>,
    },
    Subroutine {
        offset: DebugInfoOffset,
        name: Option<String>,
        return_type: Option<TypeRef>,
        parameters: Vec<Option<TypeRef>>,
    },
}

/// A composite type collecting its children.
struct PendingComposite {
    offset: DebugInfoOffset,
    name: Option<String>,
    byte_size: Option<u64>,
    kind: CompositeKind,
    declaration: bool,
    fields: Vec<Field>,
    inherits: Vec<Inheritance>,
    template_params: Vec<TemplateParam>,
    /// Synthetic `__C<digits>` unions found nested inside, awaiting the
    /// field fix-up when this composite closes.
    nested_unions: Vec<(u32, TypeRef, Option<u64>)>,
}

fn type_attr(attrs: &AttributeList<'_>) -> Option<TypeRef> {
    attrs.reference(constants::DW_AT_type).map(TypeRef)
}

/// A member's byte offset: either a plain constant or a one-operation
/// `DW_OP_plus_uconst` block, the two encodings producers actually emit.
fn member_offset(attrs: &AttributeList<'_>) -> u64 {
    match attrs.value(constants::DW_AT_data_member_location) {
        Some(AttributeValue::Udata(offset)) => offset,
        // A negative offset is nonsense for a member; treat it as zero
        // rather than letting the cast produce a huge one.
        Some(AttributeValue::Sdata(offset)) => offset.max(0) as u64,
        Some(AttributeValue::Block(block)) => {
            let mut buf = block;
            match buf.read_u8() {
                Ok(opcode) if constants::DwOp(opcode) == constants::DW_OP_plus_uconst => {
                    buf.read_uleb128().unwrap_or(0)
                }
                _ => 0,
            }
        }
        _ => 0,
    }
}

/// Element count of an inclusive `[lower, upper]` subrange. The bounds come
/// straight from the entry stream, so a pair whose count does not fit in an
/// i64 leaves the bound open instead.
fn subrange_count(lower: i64, upper: i64) -> Option<u64> {
    let span = upper.checked_sub(lower)?.checked_add(1)?;
    Some(span.max(0) as u64)
}

/// The digits of an RVCT synthetic anonymous-union name, `__C<digits>`.
fn unnamed_union_digits(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("__C")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnamed_union_digits() {
        assert_eq!(unnamed_union_digits("__C1"), Some(1));
        assert_eq!(unnamed_union_digits("__C42"), Some(42));
        assert_eq!(unnamed_union_digits("__C"), None);
        assert_eq!(unnamed_union_digits("__Cx"), None);
        assert_eq!(unnamed_union_digits("Counter"), None);
    }

    #[test]
    fn test_member_offset_forms() {
        use crate::abbrev::AttributeSpecification;
        use crate::endian::RunTimeEndian;
        use crate::test_util::test_unit_header;

        let unit = test_unit_header(4, 4);
        let abbrev = crate::abbrev::Abbreviation::new(
            1,
            constants::DW_TAG_member,
            constants::DW_CHILDREN_no,
            vec![AttributeSpecification::new(
                constants::DW_AT_data_member_location,
                constants::DW_FORM_block1,
            )],
        );
        // DW_OP_plus_uconst 12
        let bytes = [0x02, 0x23, 0x0c];
        let mut buf = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let attrs = AttributeList::parse(&mut buf, &abbrev, &unit).unwrap();
        assert_eq!(member_offset(&attrs), 12);
    }

    #[test]
    fn test_reference_to_null_entry() {
        use crate::abbrev::Abbreviations;
        use crate::endian::RunTimeEndian;
        use crate::test_util::test_unit_header;

        let file = SymbolFile::new("test", 4, RunTimeEndian::Little);
        let mut units = Vec::new();
        let mut abbrev_cache = AbbrevCache::default();
        let mut scopes = ScopeArena::default();
        let mut types = TypeTable::default();
        let builder = Builder {
            file: &file,
            units: &mut units,
            abbrev_cache: &mut abbrev_cache,
            scopes: &mut scopes,
            types: &mut types,
        };

        // A stream that is nothing but sibling terminators; a reference
        // landing on one is not a real entry.
        let debug_info = vec![0u8; 0x1004];
        let ctx = UnitCtx {
            header: test_unit_header(4, 4),
            abbrevs: Arc::new(Abbreviations::default()),
            debug_info: EndianBuf::new(&debug_info, RunTimeEndian::Little),
            debug_str: EndianBuf::new(&[], RunTimeEndian::Little),
        };
        assert_eq!(
            builder.entry_at(&ctx, DebugInfoOffset(0x20)).err(),
            Some(Error::AbbreviationCodeZero)
        );
    }

    #[test]
    fn test_subrange_count_bounds() {
        assert_eq!(subrange_count(0, 9), Some(10));
        assert_eq!(subrange_count(1, 10), Some(10));
        assert_eq!(subrange_count(0, -10), Some(0));
        assert_eq!(subrange_count(0, i64::MAX), None);
        assert_eq!(subrange_count(i64::MIN, i64::MAX), None);
    }

    #[test]
    fn test_negative_member_offset_clamped() {
        use crate::abbrev::AttributeSpecification;
        use crate::endian::RunTimeEndian;
        use crate::test_util::test_unit_header;

        let unit = test_unit_header(4, 4);
        let abbrev = crate::abbrev::Abbreviation::new(
            1,
            constants::DW_TAG_member,
            constants::DW_CHILDREN_no,
            vec![AttributeSpecification::new(
                constants::DW_AT_data_member_location,
                constants::DW_FORM_sdata,
            )],
        );
        // sleb(-4); must not become a huge unsigned offset.
        let bytes = [0x7c];
        let mut buf = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let attrs = AttributeList::parse(&mut buf, &abbrev, &unit).unwrap();
        assert_eq!(member_offset(&attrs), 0);
    }
}
