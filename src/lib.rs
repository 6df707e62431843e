//! A lazy DWARF debug-information engine for debugger backends.
//!
//! `moria` reads the DWARF sections of one symbol file and answers the
//! queries a debugger needs at a breakpoint: which function and unit an
//! address falls in, which variables are visible, where a variable's
//! value lives given the machine state, what a type looks like, and how
//! to unwind a frame.
//!
//! * **Lazy:** a [`DebugInfoProvider`] parses nothing up front. Each
//!   query raises its parse level just far enough to answer, and levels
//!   only ever go up. See [`ParseLevel`].
//!
//! * **Zero-copy where it counts:** section data is borrowed for its
//!   whole lifetime through [`EndianBuf`]; only the derived tables
//!   (scopes, types, line rows) own their storage.
//!
//! * **Tolerant:** producers emit broken DWARF, so a malformed unit
//!   degrades that unit instead of failing the file, and known producer
//!   quirks (armcc call-frame encodings, anonymous unions dropped from
//!   member lists) are repaired during parsing.
//!
//! This library targets DWARF versions 2 through 4 and is not coupled
//! to any object file format: load the sections with whatever container
//! parser fits and hand the bytes to a [`SymbolFile`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use moria::{DebugInfoProvider, NoProgress, RunTimeEndian, SectionId, SymbolFile};
//!
//! # fn example() -> Result<(), moria::Error> {
//! # let debug_info: &[u8] = &[];
//! # let debug_abbrev: &[u8] = &[];
//! let file = SymbolFile::new("/lib/libexample.so", 8, RunTimeEndian::Little)
//!     .with_section(SectionId::DebugInfo, debug_info)
//!     .with_section(SectionId::DebugAbbrev, debug_abbrev);
//! let provider = DebugInfoProvider::new(file);
//!
//! if let Some(function) = provider.function_at(0x4010a0, &NoProgress)? {
//!     println!("stopped in {:?}", function.name);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]

mod abbrev;
pub use abbrev::{AbbrevCache, Abbreviation, Abbreviations, AttributeSpecification, DebugAbbrevOffset};

mod attr;
pub use attr::{AttributeList, AttributeValue};

mod buf;
pub use buf::{EndianBuf, Format};

mod builder;

mod cfi;
pub use cfi::{CallFrameInfo, CfaRule, Cie, Fde, RegisterRule, RegisterRuleMap, UnwindRow};

pub mod constants;
pub use constants::*;

mod endian;
pub use endian::{BigEndian, Endianity, LittleEndian, RunTimeEndian};

mod error;
pub use error::{Error, Result};

pub mod leb128;

mod line;
pub use line::{FileEntry, LineProgram, LineRow};

mod loc;
pub use loc::{LocListEntry, LocationProvider};

mod op;
pub use op::{evaluate, EvalContext, VariableLocation, MAX_FRAME_BASE_DEPTH};

mod provider;
pub use provider::{
    DebugInfoProvider, FunctionInfo, NoProgress, ParseLevel, ProgressMonitor, UnitInfo,
    VariableInfo,
};

mod pubnames;
pub use pubnames::{PubNameEntry, PubNamesIter};

mod scope;
pub use scope::{Scope, ScopeArena, ScopeId, ScopeKind, ScopeRanges, Variable};

mod sections;
pub use sections::{AddressTranslator, BiasTranslator, SectionId, SymbolFile};

#[cfg(test)]
mod test_util;

mod types;
pub use types::{
    ArrayBound, CompositeKind, Enumerator, Field, Inheritance, TemplateParam, Type, TypeKind,
    TypeRef, TypeTable,
};

mod unit;
pub use unit::{DebugInfoOffset, UnitHeader, UnitHeadersIter};
