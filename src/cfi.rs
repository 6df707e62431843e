//! Call-frame information: `.debug_frame` and `.eh_frame`.
//!
//! A CIE's initial instructions establish the register rules shared by
//! every FDE that references it; the FDE's own instructions then advance
//! a location cursor through the function, mutating the rule set. A row
//! is the rule set in force over one address interval. Unwinding a
//! register means finding the row covering the program counter and
//! recovering the register through its rule, relative to the canonical
//! frame address.

use crate::buf::{EndianBuf, Format};
use crate::constants;
use crate::error::{Error, Result};
use crate::op::{EvalContext, VariableLocation};
use arrayvec::ArrayVec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Register rules per row are expected to stay small; a CIE demanding
/// more than this is corrupt.
const MAX_RULES: usize = 128;

/// Nesting depth of `DW_CFA_remember_state`.
const MAX_RULE_STACK: usize = 8;

// The DW_EH_PE pointer encodings the parser accepts.
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_PCREL: u8 = 0x10;

/// How to recover one register of the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterRule {
    /// Not recoverable.
    #[default]
    Undefined,
    /// The register was not touched by this frame.
    SameValue,
    /// Saved in memory at CFA + offset.
    Offset(i64),
    /// The value is CFA + offset, not a memory location.
    ValOffset(i64),
    /// Saved in another register.
    Register(u16),
}

/// The canonical frame address: a register plus a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfaRule {
    pub register: u16,
    pub offset: i64,
}

/// The register rules in force at one location, keyed by register
/// number. Flat storage; rows rarely exceed a dozen rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRuleMap {
    rules: Vec<(u16, RegisterRule)>,
}

impl RegisterRuleMap {
    pub fn get(&self, register: u16) -> RegisterRule {
        self.rules
            .iter()
            .find(|(number, _)| *number == register)
            .map(|(_, rule)| *rule)
            .unwrap_or_default()
    }

    pub fn set(&mut self, register: u16, rule: RegisterRule) -> Result<()> {
        if rule == RegisterRule::Undefined {
            self.rules.retain(|(number, _)| *number != register);
            return Ok(());
        }
        if let Some(entry) = self
            .rules
            .iter_mut()
            .find(|(number, _)| *number == register)
        {
            entry.1 = rule;
            return Ok(());
        }
        if self.rules.len() >= MAX_RULES {
            return Err(Error::TooManyRegisterRules);
        }
        self.rules.push((register, rule));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u16, RegisterRule)> {
        self.rules.iter()
    }
}

/// The unwind state covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow {
    pub start: u64,
    pub end: u64,
    pub cfa: CfaRule,
    pub registers: RegisterRuleMap,
}

impl UnwindRow {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }
}

/// A parsed common information entry.
#[derive(Debug, Clone)]
pub struct Cie<'data> {
    offset: usize,
    version: u8,
    augmentation: String,
    address_size: u8,
    code_align: u64,
    data_align: i64,
    return_address_register: u16,
    /// DW_EH_PE encoding of FDE addresses, from a "zR" augmentation.
    fde_encoding: u8,
    /// Whether the augmentation carries a length-prefixed data blob that
    /// FDEs also carry.
    has_augmentation_data: bool,
    /// RVCT "armcc+" emits `DW_CFA_def_cfa` offsets already multiplied
    /// by the data alignment factor.
    offsets_factored: bool,
    /// Plain "armcc" flips the sign of the CFA offset.
    cfa_sign_reversed: bool,
    initial_instructions: EndianBuf<'data>,
}

impl<'data> Cie<'data> {
    /// This CIE's offset within its frame section.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn code_align(&self) -> u64 {
        self.code_align
    }

    pub fn data_align(&self) -> i64 {
        self.data_align
    }

    pub fn return_address_register(&self) -> u16 {
        self.return_address_register
    }

    pub fn augmentation(&self) -> &str {
        &self.augmentation
    }
}

/// A parsed frame description entry, bound to its CIE.
#[derive(Debug, Clone)]
pub struct Fde<'data> {
    cie: Arc<Cie<'data>>,
    initial_location: u64,
    address_range: u64,
    instructions: EndianBuf<'data>,
}

impl<'data> Fde<'data> {
    pub fn initial_location(&self) -> u64 {
        self.initial_location
    }

    pub fn end_location(&self) -> u64 {
        self.initial_location.wrapping_add(self.address_range)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.initial_location <= address && address < self.end_location()
    }
}

/// One frame section with its CIE cache.
///
/// FDEs are scanned linearly per query; CIEs are parsed once and shared
/// by every FDE that references them.
#[derive(Debug)]
pub struct CallFrameInfo<'data> {
    section: EndianBuf<'data>,
    eh_frame: bool,
    /// Address the section is loaded at, for pcrel pointer encodings.
    section_address: u64,
    address_size: u8,
    cies: HashMap<usize, Arc<Cie<'data>>>,
}

impl<'data> CallFrameInfo<'data> {
    /// Frame info over a `.debug_frame` section.
    pub fn debug_frame(section: EndianBuf<'data>, address_size: u8) -> CallFrameInfo<'data> {
        CallFrameInfo {
            section,
            eh_frame: false,
            section_address: 0,
            address_size,
            cies: HashMap::new(),
        }
    }

    /// Frame info over an `.eh_frame` section loaded at
    /// `section_address`.
    pub fn eh_frame(
        section: EndianBuf<'data>,
        address_size: u8,
        section_address: u64,
    ) -> CallFrameInfo<'data> {
        CallFrameInfo {
            section,
            eh_frame: true,
            section_address,
            address_size,
            cies: HashMap::new(),
        }
    }

    /// Find the FDE covering `address`.
    pub fn fde_for_address(&mut self, address: u64) -> Result<Fde<'data>> {
        let mut offset = 0;
        while offset < self.section.len() {
            let mut buf = self.section.range_from(offset)?;
            let (length, format) = buf.read_initial_length()?;
            if length == 0 {
                // .eh_frame terminator.
                break;
            }
            let content_offset = buf.offset_from(&self.section);
            let length = usize::try_from(length).map_err(|_| Error::CorruptUnitLength)?;
            let mut entry = buf.split(length)?;
            let next_offset = content_offset + length;

            let id_offset = entry.offset_from(&self.section);
            let id = entry.read_word(format)?;
            if self.is_cie_id(id, format) {
                // Parsed lazily when an FDE points at it.
            } else {
                let cie_offset = self.cie_offset_for(id, id_offset, format)?;
                let cie = self.cie_at(cie_offset)?;
                let fde = self.parse_fde(entry, &cie)?;
                if fde.contains(address) {
                    return Ok(fde);
                }
            }
            offset = next_offset;
        }
        Err(Error::NoUnwindInfoForAddress(address))
    }

    /// Compute the unwind row in force at `address`.
    pub fn unwind_row_for_address(&mut self, address: u64) -> Result<UnwindRow> {
        let fde = self.fde_for_address(address)?;
        self.evaluate_fde(&fde, address)
    }

    /// Recover the caller's value of `register` at `address` as a
    /// variable location, reading the current frame through `ctx`.
    pub fn recover_register(
        &mut self,
        address: u64,
        register: u16,
        ctx: &dyn EvalContext,
    ) -> Result<VariableLocation> {
        let row = self.unwind_row_for_address(address)?;
        match row.registers.get(register) {
            RegisterRule::Undefined => Err(Error::RegisterRuleUndefined(register)),
            RegisterRule::SameValue => Ok(VariableLocation::Register { register }),
            RegisterRule::Register(saved_in) => Ok(VariableLocation::Register {
                register: saved_in,
            }),
            RegisterRule::Offset(offset) => {
                let cfa = self.cfa_value(&row, ctx)?;
                Ok(VariableLocation::Memory {
                    address: cfa.wrapping_add_signed(offset),
                    is_static: false,
                })
            }
            RegisterRule::ValOffset(offset) => {
                let cfa = self.cfa_value(&row, ctx)?;
                Ok(VariableLocation::Value {
                    value: cfa.wrapping_add_signed(offset),
                })
            }
        }
    }

    /// The CFA at `address` as a register-relative location.
    pub fn cfa_for_address(&mut self, address: u64) -> Result<VariableLocation> {
        let row = self.unwind_row_for_address(address)?;
        Ok(VariableLocation::RegisterOffset {
            register: row.cfa.register,
            offset: row.cfa.offset,
        })
    }

    fn cfa_value(&self, row: &UnwindRow, ctx: &dyn EvalContext) -> Result<u64> {
        let base = ctx.register(row.cfa.register)?;
        Ok(base.wrapping_add_signed(row.cfa.offset))
    }

    fn is_cie_id(&self, id: u64, format: Format) -> bool {
        if self.eh_frame {
            id == 0
        } else {
            match format {
                Format::Dwarf32 => id == u64::from(u32::MAX),
                Format::Dwarf64 => id == u64::MAX,
            }
        }
    }

    /// `.debug_frame` stores a section offset; `.eh_frame` stores a
    /// distance back from the pointer field itself.
    fn cie_offset_for(&self, id: u64, id_offset: usize, format: Format) -> Result<usize> {
        if !self.eh_frame {
            return usize::try_from(id).map_err(|_| Error::OffsetOutOfBounds);
        }
        let _ = format;
        id_offset
            .checked_sub(usize::try_from(id).map_err(|_| Error::OffsetOutOfBounds)?)
            .ok_or(Error::OffsetOutOfBounds)
    }

    fn cie_at(&mut self, offset: usize) -> Result<Arc<Cie<'data>>> {
        if let Some(cie) = self.cies.get(&offset) {
            return Ok(Arc::clone(cie));
        }
        let cie = Arc::new(self.parse_cie(offset)?);
        debug!(offset, augmentation = %cie.augmentation, "parsed a CIE");
        self.cies.insert(offset, Arc::clone(&cie));
        Ok(cie)
    }

    fn parse_cie(&self, offset: usize) -> Result<Cie<'data>> {
        let mut buf = self.section.range_from(offset)?;
        let (length, format) = buf.read_initial_length()?;
        let length = usize::try_from(length).map_err(|_| Error::CorruptUnitLength)?;
        let mut entry = buf.split(length)?;

        let id = entry.read_word(format)?;
        if !self.is_cie_id(id, format) {
            return Err(Error::NotCieId);
        }

        let version = entry.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(Error::UnknownVersion(u16::from(version)));
        }
        let augmentation = entry.read_string_lossy()?;

        let mut address_size = self.address_size;
        if version == 4 {
            address_size = entry.read_u8()?;
            let segment_size = entry.read_u8()?;
            if segment_size != 0 {
                return Err(Error::UnimplementedCfi("segmented addressing"));
            }
        }

        // GCC 2's "eh" augmentation puts an exception-handler pointer
        // ahead of the alignment factors.
        if augmentation == "eh" {
            entry.skip(usize::from(address_size))?;
        }

        let code_align = entry.read_uleb128()?;
        let data_align = entry.read_sleb128()?;
        let return_address_register = if version == 1 {
            u16::from(entry.read_u8()?)
        } else {
            u16::try_from(entry.read_uleb128()?).map_err(|_| Error::TooManyRegisterRules)?
        };

        let offsets_factored = augmentation.starts_with("armcc+");
        let cfa_sign_reversed = augmentation == "armcc";

        let mut fde_encoding = DW_EH_PE_ABSPTR;
        let has_augmentation_data = augmentation.starts_with('z');
        if has_augmentation_data {
            let augmentation_length = entry.read_uleb128()?;
            let augmentation_length =
                usize::try_from(augmentation_length).map_err(|_| Error::CorruptUnitLength)?;
            let mut data = entry.split(augmentation_length)?;
            for letter in augmentation.chars().skip(1) {
                match letter {
                    'R' => fde_encoding = data.read_u8()?,
                    'L' => {
                        data.read_u8()?;
                    }
                    'P' => {
                        let encoding = data.read_u8()?;
                        let position = data.offset_from(&self.section);
                        self.read_encoded(&mut data, encoding, position)?;
                    }
                    'S' => {}
                    // The length prefix lets unknown letters go unread.
                    _ => break,
                }
            }
        } else if !augmentation.is_empty()
            && augmentation != "eh"
            && !augmentation.starts_with("armcc")
        {
            return Err(Error::UnimplementedCfi("augmentation"));
        }

        Ok(Cie {
            offset,
            version,
            augmentation,
            address_size,
            code_align,
            data_align,
            return_address_register,
            fde_encoding,
            has_augmentation_data,
            offsets_factored,
            cfa_sign_reversed,
            initial_instructions: entry,
        })
    }

    /// Parse the remainder of an FDE, after its CIE pointer.
    fn parse_fde(&self, mut entry: EndianBuf<'data>, cie: &Arc<Cie<'data>>) -> Result<Fde<'data>> {
        let position = entry.offset_from(&self.section);
        let initial_location = self.read_encoded(&mut entry, cie.fde_encoding, position)?;
        // The range is a plain size; relative application never applies.
        let address_range =
            self.read_encoded(&mut entry, cie.fde_encoding & 0x0f, position)?;

        if cie.has_augmentation_data {
            let augmentation_length = entry.read_uleb128()?;
            entry.skip(usize::try_from(augmentation_length).map_err(|_| Error::CorruptUnitLength)?)?;
        }

        Ok(Fde {
            cie: Arc::clone(cie),
            initial_location,
            address_range,
            instructions: entry,
        })
    }

    /// Decode a DW_EH_PE encoded pointer found at section offset
    /// `position`.
    fn read_encoded(
        &self,
        buf: &mut EndianBuf<'data>,
        encoding: u8,
        position: usize,
    ) -> Result<u64> {
        let value = match encoding & 0x0f {
            DW_EH_PE_ABSPTR => buf.read_address(self.address_size)?,
            DW_EH_PE_UDATA4 => u64::from(buf.read_u32()?),
            DW_EH_PE_SDATA4 => buf.read_i32()? as i64 as u64,
            _ => return Err(Error::UnimplementedCfi("pointer encoding")),
        };
        match encoding & 0x70 {
            0 => Ok(value),
            DW_EH_PE_PCREL => Ok(self
                .section_address
                .wrapping_add(position as u64)
                .wrapping_add(value)),
            _ => Err(Error::UnimplementedCfi("pointer application")),
        }
    }

    /// Run the CIE's initial instructions, then the FDE's, stopping at
    /// the row that covers `address`.
    fn evaluate_fde(&self, fde: &Fde<'data>, address: u64) -> Result<UnwindRow> {
        let cie = &fde.cie;
        let mut state = RowState {
            location: fde.initial_location,
            cfa: None,
            registers: RegisterRuleMap::default(),
        };

        let mut initial = InstructionContext {
            cie,
            initial_registers: None,
            stack: ArrayVec::new(),
        };
        let mut instructions = cie.initial_instructions;
        while !instructions.is_empty() {
            // Advances inside a CIE are meaningless; the location result
            // is ignored, only the rules matter.
            step(&mut instructions, &mut state, &mut initial)?;
        }
        state.location = fde.initial_location;
        let initial_registers = state.registers.clone();

        let mut ctx = InstructionContext {
            cie,
            initial_registers: Some(&initial_registers),
            stack: ArrayVec::new(),
        };
        let mut instructions = fde.instructions;
        let mut row_start = fde.initial_location;
        while !instructions.is_empty() {
            let before = state.clone();
            step(&mut instructions, &mut state, &mut ctx)?;
            if state.location > before.location {
                // The previous row ended where this advance lands.
                if before.location <= address && address < state.location {
                    return finish_row(before, row_start, state.location);
                }
                row_start = state.location;
            }
        }
        if state.location <= address && address < fde.end_location() {
            return finish_row(state, row_start, fde.end_location());
        }
        Err(Error::NoUnwindInfoForAddress(address))
    }
}

#[derive(Debug, Clone)]
struct RowState {
    location: u64,
    cfa: Option<CfaRule>,
    registers: RegisterRuleMap,
}

struct InstructionContext<'a, 'data> {
    cie: &'a Cie<'data>,
    /// Rules to restore for `DW_CFA_restore`; absent while running the
    /// CIE's own initial instructions, where restore is invalid.
    initial_registers: Option<&'a RegisterRuleMap>,
    stack: ArrayVec<(Option<CfaRule>, RegisterRuleMap), MAX_RULE_STACK>,
}

fn finish_row(state: RowState, start: u64, end: u64) -> Result<UnwindRow> {
    let cfa = state.cfa.ok_or(Error::UnimplementedCfi("no CFA rule"))?;
    Ok(UnwindRow {
        start,
        end,
        cfa,
        registers: state.registers,
    })
}

/// Execute one call-frame instruction.
fn step(
    buf: &mut EndianBuf<'_>,
    state: &mut RowState,
    ctx: &mut InstructionContext<'_, '_>,
) -> Result<()> {
    let cie = ctx.cie;
    let byte = buf.read_u8()?;
    let operand = byte & 0x3f;
    match constants::DwCfa(byte & 0xc0) {
        constants::DW_CFA_advance_loc => {
            advance_location(state, u64::from(operand), cie)?;
            return Ok(());
        }
        constants::DW_CFA_offset => {
            let factored = buf.read_uleb128()? as i64;
            return state
                .registers
                .set(u16::from(operand), RegisterRule::Offset(data_offset(factored, cie)?));
        }
        constants::DW_CFA_restore => {
            return restore_register(state, ctx, u16::from(operand));
        }
        _ => {}
    }

    match constants::DwCfa(byte) {
        constants::DW_CFA_nop => {}
        constants::DW_CFA_set_loc => {
            state.location = buf.read_address(cie.address_size)?;
        }
        constants::DW_CFA_advance_loc1 => {
            let delta = u64::from(buf.read_u8()?);
            advance_location(state, delta, cie)?;
        }
        constants::DW_CFA_advance_loc2 => {
            let delta = u64::from(buf.read_u16()?);
            advance_location(state, delta, cie)?;
        }
        constants::DW_CFA_advance_loc4 => {
            let delta = u64::from(buf.read_u32()?);
            advance_location(state, delta, cie)?;
        }
        constants::DW_CFA_offset_extended => {
            let register = read_register(buf)?;
            let factored = buf.read_uleb128()? as i64;
            state
                .registers
                .set(register, RegisterRule::Offset(data_offset(factored, cie)?))?;
        }
        constants::DW_CFA_offset_extended_sf => {
            let register = read_register(buf)?;
            let factored = buf.read_sleb128()?;
            state
                .registers
                .set(register, RegisterRule::Offset(data_offset(factored, cie)?))?;
        }
        constants::DW_CFA_val_offset => {
            let register = read_register(buf)?;
            let factored = buf.read_uleb128()? as i64;
            state
                .registers
                .set(register, RegisterRule::ValOffset(data_offset(factored, cie)?))?;
        }
        constants::DW_CFA_val_offset_sf => {
            let register = read_register(buf)?;
            let factored = buf.read_sleb128()?;
            state
                .registers
                .set(register, RegisterRule::ValOffset(data_offset(factored, cie)?))?;
        }
        constants::DW_CFA_restore_extended => {
            let register = read_register(buf)?;
            restore_register(state, ctx, register)?;
        }
        constants::DW_CFA_undefined => {
            let register = read_register(buf)?;
            state.registers.set(register, RegisterRule::Undefined)?;
        }
        constants::DW_CFA_same_value => {
            let register = read_register(buf)?;
            state.registers.set(register, RegisterRule::SameValue)?;
        }
        constants::DW_CFA_register => {
            let register = read_register(buf)?;
            let saved_in = read_register(buf)?;
            state
                .registers
                .set(register, RegisterRule::Register(saved_in))?;
        }
        constants::DW_CFA_remember_state => {
            ctx.stack
                .try_push((state.cfa, state.registers.clone()))
                .map_err(|_| Error::CfiStackFull)?;
        }
        constants::DW_CFA_restore_state => {
            let (cfa, registers) = ctx.stack.pop().ok_or(Error::PopWithEmptyStack)?;
            state.cfa = cfa;
            state.registers = registers;
        }
        constants::DW_CFA_def_cfa => {
            let register = read_register(buf)?;
            let offset = cfa_offset(buf.read_uleb128()? as i64, cie)?;
            state.cfa = Some(CfaRule { register, offset });
        }
        constants::DW_CFA_def_cfa_sf => {
            let register = read_register(buf)?;
            let offset = data_offset(buf.read_sleb128()?, cie)?;
            state.cfa = Some(CfaRule { register, offset });
        }
        constants::DW_CFA_def_cfa_register => {
            let register = read_register(buf)?;
            let cfa = state
                .cfa
                .as_mut()
                .ok_or(Error::CfiInstructionInInvalidContext)?;
            cfa.register = register;
        }
        constants::DW_CFA_def_cfa_offset => {
            let offset = cfa_offset(buf.read_uleb128()? as i64, cie)?;
            let cfa = state
                .cfa
                .as_mut()
                .ok_or(Error::CfiInstructionInInvalidContext)?;
            cfa.offset = offset;
        }
        constants::DW_CFA_def_cfa_offset_sf => {
            let offset = data_offset(buf.read_sleb128()?, cie)?;
            let cfa = state
                .cfa
                .as_mut()
                .ok_or(Error::CfiInstructionInInvalidContext)?;
            cfa.offset = offset;
        }
        constants::DW_CFA_def_cfa_expression
        | constants::DW_CFA_expression
        | constants::DW_CFA_val_expression => {
            return Err(Error::UnimplementedCfi("expression rule"));
        }
        other => {
            debug!(instruction = %other, "unimplemented call frame instruction");
            return Err(Error::UnimplementedCfi("instruction"));
        }
    }
    Ok(())
}

/// Advance the row cursor by `delta` code units.
fn advance_location(state: &mut RowState, delta: u64, cie: &Cie<'_>) -> Result<()> {
    let bytes = delta
        .checked_mul(cie.code_align)
        .ok_or(Error::BadCfiOperand)?;
    state.location = state.location.wrapping_add(bytes);
    Ok(())
}

/// Scale a factored operand by the CIE's data alignment. The operands come
/// straight from the section, so the product must be range checked.
fn data_offset(factored: i64, cie: &Cie<'_>) -> Result<i64> {
    factored
        .checked_mul(cie.data_align)
        .ok_or(Error::BadCfiOperand)
}

/// Apply the RVCT CFA-offset quirks.
fn cfa_offset(raw: i64, cie: &Cie<'_>) -> Result<i64> {
    let offset = if cie.offsets_factored {
        data_offset(raw, cie)?
    } else {
        raw
    };
    if cie.cfa_sign_reversed {
        offset.checked_neg().ok_or(Error::BadCfiOperand)
    } else {
        Ok(offset)
    }
}

fn restore_register(
    state: &mut RowState,
    ctx: &InstructionContext<'_, '_>,
    register: u16,
) -> Result<()> {
    let initial = ctx
        .initial_registers
        .ok_or(Error::CfiInstructionInInvalidContext)?;
    state.registers.set(register, initial.get(register))
}

fn read_register(buf: &mut EndianBuf<'_>) -> Result<u16> {
    u16::try_from(buf.read_uleb128()?).map_err(|_| Error::TooManyRegisterRules)
}
