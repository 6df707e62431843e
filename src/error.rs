//! The error type for DWARF parsing and evaluation.

use crate::constants::{DwForm, DwOp};

/// An error that occurred while parsing or evaluating DWARF debug
/// information.
///
/// Parse-level errors are contained by the provider at the smallest scope
/// that can be skipped (one attribute, one entry, one compile unit).
/// Evaluation-level errors are returned to the immediate caller so that one
/// unavailable variable or register does not take down the rest of a view.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The input ended before a complete value could be read.
    #[error("Hit the end of input before it was expected")]
    UnexpectedEof,

    /// An unsigned LEB128 value did not fit in a `u64`.
    #[error("An unsigned LEB128 value was too large")]
    BadUnsignedLeb128,

    /// A signed LEB128 value did not fit in an `i64`.
    #[error("A signed LEB128 value was too large")]
    BadSignedLeb128,

    /// The declared address size is not one we can read.
    #[error("Unsupported address size: {0}")]
    UnsupportedAddressSize(u8),

    /// An entry used the reserved abbreviation code zero where a real
    /// entry was required.
    #[error("Entry uses the reserved abbreviation code zero")]
    AbbreviationCodeZero,

    /// An abbreviation table declared the same code twice.
    #[error("Found an abbreviation code that has already been used")]
    DuplicateAbbreviationCode,

    /// An entry used an abbreviation code its table does not define.
    #[error("Entry refers to abbreviation code {0}, which has no table entry")]
    UnknownAbbreviation(u64),

    /// Expected a zero terminator, found something else.
    #[error("Expected a zero terminator")]
    ExpectedZero,

    /// An attribute form we do not know how to read or skip.
    #[error("Unknown attribute form: {0}")]
    UnknownForm(DwForm),

    /// A unit header whose declared length does not land on the next
    /// header, even after the off-by-4 repair.
    #[error("Compilation unit length is corrupt")]
    CorruptUnitLength,

    /// The unit's format version is one we do not parse.
    #[error("Unknown DWARF version: {0}")]
    UnknownVersion(u16),

    /// A section the requested operation needs was not provided.
    #[error("Required section {0} is missing")]
    MissingSection(&'static str),

    /// An offset pointed outside of its section.
    #[error("An offset is out of bounds of its section")]
    OffsetOutOfBounds,

    /// A forward reference that could not be found even after parsing the
    /// unit that should own it.
    #[error("Unresolved debug-info reference to offset {0:#x}")]
    UnresolvedReference(usize),

    /// A recognized but unsupported location-expression opcode.
    #[error("Location opcode {0} is not implemented")]
    UnimplementedOpcode(DwOp),

    /// The expression terminated with a stack depth other than one.
    #[error("Location expression finished with a bad stack size: {0}")]
    BadStackSize(usize),

    /// The bounded expression stack overflowed.
    #[error("Location expression stack is full")]
    StackFull,

    /// The expression needs a frame base but none is available.
    #[error("No frame base location is available for this scope")]
    NoFrameBase,

    /// The evaluation context cannot supply the requested register.
    #[error("Register {0} is not available in this frame")]
    RegisterUnavailable(u16),

    /// The evaluation context cannot read the requested target memory.
    #[error("Target memory at {0:#x} is not available")]
    MemoryUnavailable(u64),

    /// A location list has no entry covering the requested address.
    #[error("No location list entry covers address {0:#x}")]
    NoLocationForAddress(u64),

    /// A call-frame instruction appeared where it is not meaningful, such
    /// as `restore` while the initial rules are still being built.
    #[error("Call-frame instruction in an invalid context")]
    CfiInstructionInInvalidContext,

    /// A `restore-state` with no matching `remember-state`.
    #[error("Call-frame state restore with no remembered state")]
    PopWithEmptyStack,

    /// The remember/restore snapshot stack is bounded and overflowed.
    #[error("Too many nested call-frame remember-state instructions")]
    CfiStackFull,

    /// The per-row register-rule storage is bounded and overflowed.
    #[error("Too many register rules in one call-frame row")]
    TooManyRegisterRules,

    /// An FDE referenced a CIE that does not parse as one.
    #[error("FDE references an offset that is not a CIE")]
    NotCieId,

    /// A recognized but unsupported call-frame construct, such as an
    /// expression-based CFA.
    #[error("Call-frame construct is not implemented: {0}")]
    UnimplementedCfi(&'static str),

    /// A call-frame operand that overflows when scaled by its CIE's
    /// alignment factor.
    #[error("Call-frame instruction operand is out of range")]
    BadCfiOperand,

    /// No FDE covers the requested address.
    #[error("No frame description entry covers address {0:#x}")]
    NoUnwindInfoForAddress(u64),

    /// The register's recovery rule is undefined at this address.
    #[error("Register {0} cannot be recovered at this address")]
    RegisterRuleUndefined(u16),

    /// The parse was cancelled through the progress monitor.
    #[error("Parse was cancelled")]
    Cancelled,

    /// The provider has been disposed.
    #[error("Debug-info provider has been disposed")]
    Disposed,
}

/// The result of a DWARF parse or evaluation.
pub type Result<T> = std::result::Result<T, Error>;
