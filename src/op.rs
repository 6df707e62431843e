//! The location-expression evaluator.
//!
//! A DWARF location expression is a small stack-machine byte-code. Real
//! expressions are shallow (push, maybe an offset, maybe one dereference),
//! so the operand stack is a bounded `ArrayVec`; hitting the bound is a
//! typed failure, never unbounded growth on attacker-shaped input.
//!
//! Evaluation is a pure query: it reads the child frame through an
//! [`EvalContext`] and produces a fresh [`VariableLocation`]. Opcodes that
//! describe composite or multi-register values are recognized and rejected
//! with a typed error rather than producing a wrong answer.

use crate::buf::EndianBuf;
use crate::constants;
use crate::error::{Error, Result};
use arrayvec::ArrayVec;

/// Operand stack bound. The deepest expression any surveyed producer emits
/// is under ten entries.
const MAX_STACK_DEPTH: usize = 64;

/// How the frame-base resolution in `DW_OP_fbreg` may recurse through
/// nested and inlined function scopes before giving up.
pub const MAX_FRAME_BASE_DEPTH: usize = 16;

/// Where a variable's value lives, as computed for one target address.
///
/// Always a fresh result; nothing here owns or caches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    /// The value is in target memory at this address.
    Memory {
        address: u64,
        /// True when the address came from `DW_OP_addr` alone: it names
        /// static storage, not an address computed from live registers,
        /// so readers must not treat it as referring to this frame.
        is_static: bool,
    },
    /// The value is live in a register.
    Register { register: u16 },
    /// The value is at a fixed offset from a register, left symbolic for
    /// the caller to compose (used by frame-relative rules).
    RegisterOffset { register: u16, offset: i64 },
    /// The value itself, with no storage behind it.
    Value { value: u64 },
}

/// Access to the live child frame during evaluation.
///
/// Supplied by the debug-service collaborator; the default implementations
/// make every capability optional.
pub trait EvalContext {
    /// Read a live register.
    fn register(&self, register: u16) -> Result<u64>;

    /// Read an address-sized word from target memory.
    fn read_memory(&self, address: u64) -> Result<u64> {
        Err(Error::MemoryUnavailable(address))
    }

    /// The enclosing function's frame base for the address being
    /// evaluated, resolved through nested scopes by the caller.
    fn frame_base(&self) -> Result<u64> {
        Err(Error::NoFrameBase)
    }
}

/// Evaluate one location expression against a child frame.
///
/// Exactly one value must remain on the stack; any other depth fails with
/// [`Error::BadStackSize`].
pub fn evaluate(
    expr: EndianBuf<'_>,
    address_size: u8,
    ctx: &dyn EvalContext,
) -> Result<VariableLocation> {
    let mut buf = expr;
    let mut stack: ArrayVec<u64, MAX_STACK_DEPTH> = ArrayVec::new();
    // Set by DW_OP_addr, cleared by anything frame-dependent.
    let mut is_static = false;

    while !buf.is_empty() {
        let opcode = constants::DwOp(buf.read_u8()?);
        match opcode {
            constants::DW_OP_addr => {
                push(&mut stack, buf.read_address(address_size)?)?;
                is_static = true;
            }
            constants::DW_OP_deref => {
                let address = pop(&mut stack)?;
                push(&mut stack, ctx.read_memory(address)?)?;
                is_static = false;
            }
            constants::DW_OP_const1u => push(&mut stack, u64::from(buf.read_u8()?))?,
            constants::DW_OP_const1s => push(&mut stack, buf.read_i8()? as u64)?,
            constants::DW_OP_const2u => push(&mut stack, u64::from(buf.read_u16()?))?,
            constants::DW_OP_const2s => push(&mut stack, buf.read_i16()? as u64)?,
            constants::DW_OP_const4u => push(&mut stack, u64::from(buf.read_u32()?))?,
            constants::DW_OP_const4s => push(&mut stack, buf.read_i32()? as u64)?,
            constants::DW_OP_const8u => push(&mut stack, buf.read_u64()?)?,
            constants::DW_OP_const8s => push(&mut stack, buf.read_i64()? as u64)?,
            constants::DW_OP_constu => push(&mut stack, buf.read_uleb128()?)?,
            constants::DW_OP_consts => push(&mut stack, buf.read_sleb128()? as u64)?,
            constants::DW_OP_plus_uconst => {
                let addend = buf.read_uleb128()?;
                let top = pop(&mut stack)?;
                push(&mut stack, top.wrapping_add(addend))?;
            }
            constants::DW_OP_fbreg => {
                let offset = buf.read_sleb128()?;
                let base = ctx.frame_base()?;
                push(&mut stack, base.wrapping_add(offset as u64))?;
                is_static = false;
            }
            constants::DW_OP_nop => {}
            constants::DW_OP_stack_value => {
                // Terminates the expression: the top of stack is the
                // value itself, not a storage address.
                if !buf.is_empty() {
                    return Err(Error::UnimplementedOpcode(opcode));
                }
                let value = pop(&mut stack)?;
                if !stack.is_empty() {
                    return Err(Error::BadStackSize(stack.len() + 1));
                }
                return Ok(VariableLocation::Value { value });
            }
            _ => {
                if let Some(literal) = literal_value(opcode) {
                    push(&mut stack, literal)?;
                } else if let Some(register) = register_number(opcode, &mut buf)? {
                    // Register location descriptions stand alone; a
                    // register opcode composed with anything else is a
                    // composite description we do not implement.
                    if !stack.is_empty() || !buf.is_empty() {
                        return Err(Error::UnimplementedOpcode(opcode));
                    }
                    return Ok(VariableLocation::Register { register });
                } else if let Some((register, offset)) = register_offset(opcode, &mut buf)? {
                    let base = ctx.register(register)?;
                    push(&mut stack, base.wrapping_add(offset as u64))?;
                    is_static = false;
                } else {
                    return Err(Error::UnimplementedOpcode(opcode));
                }
            }
        }
    }

    if stack.len() != 1 {
        return Err(Error::BadStackSize(stack.len()));
    }
    Ok(VariableLocation::Memory {
        address: stack[0],
        is_static,
    })
}

fn push(stack: &mut ArrayVec<u64, MAX_STACK_DEPTH>, value: u64) -> Result<()> {
    stack.try_push(value).map_err(|_| Error::StackFull)
}

fn pop(stack: &mut ArrayVec<u64, MAX_STACK_DEPTH>) -> Result<u64> {
    stack.pop().ok_or(Error::BadStackSize(0))
}

/// `DW_OP_lit0 ..= DW_OP_lit31` push their literal.
fn literal_value(opcode: constants::DwOp) -> Option<u64> {
    if (constants::DW_OP_lit0.0..=constants::DW_OP_lit31.0).contains(&opcode.0) {
        Some(u64::from(opcode.0 - constants::DW_OP_lit0.0))
    } else {
        None
    }
}

/// `DW_OP_reg0 ..= DW_OP_reg31` and `DW_OP_regx` name a register.
fn register_number(opcode: constants::DwOp, buf: &mut EndianBuf<'_>) -> Result<Option<u16>> {
    if (constants::DW_OP_reg0.0..=constants::DW_OP_reg31.0).contains(&opcode.0) {
        Ok(Some(u16::from(opcode.0 - constants::DW_OP_reg0.0)))
    } else if opcode == constants::DW_OP_regx {
        let register = buf.read_uleb128()?;
        u16::try_from(register)
            .map(Some)
            .map_err(|_| Error::UnimplementedOpcode(opcode))
    } else {
        Ok(None)
    }
}

/// `DW_OP_breg0 ..= DW_OP_breg31` and `DW_OP_bregx` push register+offset.
fn register_offset(
    opcode: constants::DwOp,
    buf: &mut EndianBuf<'_>,
) -> Result<Option<(u16, i64)>> {
    if (constants::DW_OP_breg0.0..=constants::DW_OP_breg31.0).contains(&opcode.0) {
        let register = u16::from(opcode.0 - constants::DW_OP_breg0.0);
        Ok(Some((register, buf.read_sleb128()?)))
    } else if opcode == constants::DW_OP_bregx {
        let register = buf.read_uleb128()?;
        let register =
            u16::try_from(register).map_err(|_| Error::UnimplementedOpcode(opcode))?;
        Ok(Some((register, buf.read_sleb128()?)))
    } else {
        Ok(None)
    }
}
