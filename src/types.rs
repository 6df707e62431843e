//! The type model: an arena of decoded types keyed by `.debug_info` offset.
//!
//! Types reference each other through [`TypeRef`] handles carrying only an
//! offset. A referenced type may not have been decoded yet, or may live in a
//! compilation unit that has not been walked at all; the table resolves such
//! references on first access, memoizing the result. While a type is being
//! decoded its slot holds a sentinel, so a reference cycle (a malformed but
//! possible encoding) terminates with the unhandled placeholder instead of
//! recursing forever.

use crate::constants;
use crate::error::Result;
use crate::unit::DebugInfoOffset;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A non-owning handle to a type in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub DebugInfoOffset);

impl TypeRef {
    /// The `.debug_info` offset of the referenced type entry.
    pub fn offset(&self) -> DebugInfoOffset {
        self.0
    }
}

/// Which aggregate keyword introduced a composite type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Struct,
    Class,
    Union,
}

impl CompositeKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            CompositeKind::Struct => "struct",
            CompositeKind::Class => "class",
            CompositeKind::Union => "union",
        }
    }
}

/// A data member of a composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Member name. Synthetic for patched-in anonymous unions.
    pub name: String,
    /// The member's type, when the producer recorded one.
    pub type_ref: Option<TypeRef>,
    /// Byte offset within the composite.
    pub byte_offset: u64,
    /// Bit-field placement, when present.
    pub bit_size: Option<u64>,
    pub bit_offset: Option<u64>,
}

/// A base class of a composite type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inheritance {
    pub base: TypeRef,
    pub byte_offset: u64,
}

/// One named constant of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator {
    pub name: String,
    pub value: i64,
}

/// One dimension of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBound {
    pub lower: i64,
    /// Element count, absent for flexible/incomplete dimensions.
    pub count: Option<u64>,
}

/// A bound template parameter of a composite or function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParam {
    pub name: String,
    pub actual: Option<TypeRef>,
}

/// The variant-specific payload of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Base {
        encoding: constants::DwAte,
    },
    Pointer {
        target: Option<TypeRef>,
    },
    Reference {
        target: Option<TypeRef>,
    },
    /// `const`, `volatile` or `restrict` wrappers.
    Qualifier {
        tag: constants::DwTag,
        target: Option<TypeRef>,
    },
    Array {
        element: Option<TypeRef>,
        bounds: Vec<ArrayBound>,
    },
    Composite {
        kind: CompositeKind,
        fields: Vec<Field>,
        inherits: Vec<Inheritance>,
        template_params: Vec<TemplateParam>,
        /// True for a forward declaration with no members.
        declaration: bool,
    },
    Enumeration {
        underlying: Option<TypeRef>,
        enumerators: Vec<Enumerator>,
    },
    Typedef {
        target: Option<TypeRef>,
    },
    Subroutine {
        return_type: Option<TypeRef>,
        parameters: Vec<Option<TypeRef>>,
    },
    TemplateParameter {
        actual: Option<TypeRef>,
    },
    /// The documented placeholder for references that could not be
    /// resolved. Callers render it as an unknown type, never as absence.
    Unhandled,
}

/// A decoded type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    offset: DebugInfoOffset,
    name: Option<String>,
    byte_size: Option<u64>,
    kind: TypeKind,
}

impl Type {
    pub fn new(
        offset: DebugInfoOffset,
        name: Option<String>,
        byte_size: Option<u64>,
        kind: TypeKind,
    ) -> Type {
        Type {
            offset,
            name,
            byte_size,
            kind,
        }
    }

    pub fn offset(&self) -> DebugInfoOffset {
        self.offset
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn byte_size(&self) -> Option<u64> {
        self.byte_size
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// The type this one wraps or aliases, for the variants that have one.
    pub fn target(&self) -> Option<TypeRef> {
        match self.kind {
            TypeKind::Pointer { target }
            | TypeKind::Reference { target }
            | TypeKind::Qualifier { target, .. }
            | TypeKind::Typedef { target }
            | TypeKind::Array { element: target, .. }
            | TypeKind::Enumeration {
                underlying: target, ..
            }
            | TypeKind::TemplateParameter { actual: target } => target,
            _ => None,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self.kind, TypeKind::Unhandled)
    }
}

#[derive(Debug, Clone)]
enum TypeSlot {
    /// Decode in progress; seeing this on lookup means a reference cycle.
    Resolving,
    Resolved(Arc<Type>),
}

/// The provider's offset-keyed type arena plus its name indexes.
#[derive(Debug, Default)]
pub struct TypeTable {
    slots: HashMap<DebugInfoOffset, TypeSlot>,
    by_name: HashMap<String, Vec<DebugInfoOffset>>,
    by_base_name: HashMap<String, Vec<DebugInfoOffset>>,
}

impl TypeTable {
    pub fn new() -> TypeTable {
        TypeTable::default()
    }

    /// Register a fully decoded type, overwriting a sentinel if one was
    /// left by an in-progress resolution.
    pub fn insert(&mut self, ty: Type) -> Arc<Type> {
        let offset = ty.offset();
        if let Some(name) = ty.name() {
            let normalized = normalize_name(name);
            let base = strip_template_args(&normalized).to_string();
            push_unique(self.by_name.entry(normalized).or_default(), offset);
            push_unique(self.by_base_name.entry(base).or_default(), offset);
        }
        let ty = Arc::new(ty);
        self.slots.insert(offset, TypeSlot::Resolved(Arc::clone(&ty)));
        ty
    }

    /// Look up an already resolved type without triggering any decode.
    pub fn get(&self, offset: DebugInfoOffset) -> Option<Arc<Type>> {
        match self.slots.get(&offset) {
            Some(TypeSlot::Resolved(ty)) => Some(Arc::clone(ty)),
            _ => None,
        }
    }

    /// Resolve `offset`, decoding on demand via `decode`.
    ///
    /// Memoized: a resolved slot is returned as-is and never reparsed. A
    /// sentinel slot means the caller is inside the decode of this very
    /// type, so the cyclic edge gets the unhandled placeholder. `decode`
    /// must insert the type it parses; if it returns without doing so the
    /// slot is filled with the placeholder too, so a failed decode is not
    /// retried on every query.
    pub fn resolve_with<F>(&mut self, offset: DebugInfoOffset, decode: F) -> Result<Arc<Type>>
    where
        F: FnOnce(&mut TypeTable) -> Result<()>,
    {
        match self.slots.get(&offset) {
            Some(TypeSlot::Resolved(ty)) => return Ok(Arc::clone(ty)),
            Some(TypeSlot::Resolving) => {
                warn!(offset = offset.0, "type reference cycle; substituting placeholder");
                return Ok(self.insert_placeholder(offset));
            }
            None => {}
        }

        self.slots.insert(offset, TypeSlot::Resolving);
        let result = decode(self);

        match self.slots.get(&offset) {
            Some(TypeSlot::Resolved(ty)) => {
                let ty = Arc::clone(ty);
                result?;
                Ok(ty)
            }
            _ => {
                if let Err(error) = result {
                    warn!(offset = offset.0, %error, "type decode failed; substituting placeholder");
                } else {
                    warn!(offset = offset.0, "no type at referenced offset; substituting placeholder");
                }
                Ok(self.insert_placeholder(offset))
            }
        }
    }

    /// Fill `offset` with the unhandled placeholder, replacing any
    /// sentinel. Used for cyclic edges and failed decodes.
    fn insert_placeholder(&mut self, offset: DebugInfoOffset) -> Arc<Type> {
        let ty = Arc::new(Type::new(offset, None, None, TypeKind::Unhandled));
        self.slots.insert(offset, TypeSlot::Resolved(Arc::clone(&ty)));
        ty
    }

    /// All resolved types whose display name matches `query` after
    /// normalization. When the query carries no template argument list it
    /// also matches instantiations by their base name.
    pub fn lookup_by_name(&self, query: &str) -> Vec<Arc<Type>> {
        let normalized = normalize_name(query);
        let offsets = match self.by_name.get(&normalized) {
            Some(offsets) => offsets,
            None if !normalized.contains('<') => {
                match self.by_base_name.get(&normalized) {
                    Some(offsets) => offsets,
                    None => return Vec::new(),
                }
            }
            None => return Vec::new(),
        };
        offsets.iter().filter_map(|&offset| self.get(offset)).collect()
    }

    /// Number of resolved types, used by idempotence checks in tests.
    pub fn len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, TypeSlot::Resolved(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Used by provider disposal.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_name.clear();
        self.by_base_name.clear();
    }
}

fn push_unique(offsets: &mut Vec<DebugInfoOffset>, offset: DebugInfoOffset) {
    if !offsets.contains(&offset) {
        offsets.push(offset);
    }
}

/// Normalize a C++ display name for matching: strip a leading aggregate
/// keyword, collapse whitespace runs, and drop spaces around punctuation
/// so `"Foo<Bar, Baz>"` and `"Foo<Bar,Baz>"` compare equal while
/// `"unsigned int"` keeps its separating space.
pub fn normalize_name(name: &str) -> String {
    let name = name.trim();
    let name = ["class ", "struct ", "union "]
        .iter()
        .find_map(|keyword| name.strip_prefix(keyword))
        .unwrap_or(name)
        .trim_start();

    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for ch in name.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            let glued = matches!(ch, '<' | '>' | ',' | '*' | '&' | '(' | ')' | ':')
                || matches!(out.chars().last(), Some('<' | '>' | ',' | '*' | '&' | '(' | ')' | ':'));
            if !glued {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

/// The name with any trailing template argument list removed.
pub fn strip_template_args(name: &str) -> &str {
    match name.find('<') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn base(offset: usize, name: &str) -> Type {
        Type::new(
            DebugInfoOffset(offset),
            Some(name.to_string()),
            Some(4),
            TypeKind::Base {
                encoding: constants::DW_ATE_signed,
            },
        )
    }

    #[test]
    fn test_resolve_memoized() {
        let mut table = TypeTable::new();
        let offset = DebugInfoOffset(0x10);
        let first = table
            .resolve_with(offset, |table| {
                table.insert(base(0x10, "int"));
                Ok(())
            })
            .unwrap();

        // Second resolve must return the same identity without reparsing.
        let second = table
            .resolve_with(offset, |_| panic!("reparsed a resolved type"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cycle_yields_placeholder() {
        // a -> b -> a. The inner resolve of `a` hits the sentinel.
        let a = DebugInfoOffset(0x10);
        let b = DebugInfoOffset(0x20);
        let mut table = TypeTable::new();

        let resolved = table
            .resolve_with(a, |table| {
                table.resolve_with(b, |table| {
                    let back = table.resolve_with(a, |_| unreachable!())?;
                    assert!(back.is_unhandled());
                    table.insert(Type::new(
                        b,
                        Some("B".to_string()),
                        None,
                        TypeKind::Typedef {
                            target: Some(TypeRef(a)),
                        },
                    ));
                    Ok(())
                })?;
                table.insert(Type::new(
                    a,
                    Some("A".to_string()),
                    None,
                    TypeKind::Typedef {
                        target: Some(TypeRef(b)),
                    },
                ));
                Ok(())
            })
            .unwrap();

        // The outer decode completed, so `a` ends up as the real typedef.
        assert_eq!(resolved.name(), Some("A"));
        assert_eq!(table.get(b).unwrap().name(), Some("B"));
    }

    #[test]
    fn test_failed_decode_yields_placeholder() {
        let mut table = TypeTable::new();
        let offset = DebugInfoOffset(0x30);
        let resolved = table
            .resolve_with(offset, |_| Err(Error::UnexpectedEof))
            .unwrap();
        assert!(resolved.is_unhandled());

        // The failure is memoized too.
        let again = table
            .resolve_with(offset, |_| panic!("retried a failed decode"))
            .unwrap();
        assert!(Arc::ptr_eq(&resolved, &again));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("class Foo<Bar,Baz>"), "Foo<Bar,Baz>");
        assert_eq!(normalize_name("Foo<Bar, Baz>"), "Foo<Bar,Baz>");
        assert_eq!(normalize_name("struct  job_queue "), "job_queue");
        assert_eq!(normalize_name("unsigned   int"), "unsigned int");
        assert_eq!(normalize_name("union U"), "U");
        assert_eq!(normalize_name("Foo < Bar >"), "Foo<Bar>");
    }

    #[test]
    fn test_lookup_normalization() {
        let mut table = TypeTable::new();
        table.insert(Type::new(
            DebugInfoOffset(0x10),
            Some("Foo<Bar,Baz>".to_string()),
            Some(8),
            TypeKind::Composite {
                kind: CompositeKind::Class,
                fields: Vec::new(),
                inherits: Vec::new(),
                template_params: Vec::new(),
                declaration: false,
            },
        ));
        table.insert(Type::new(
            DebugInfoOffset(0x40),
            Some("Foo<Bar>".to_string()),
            Some(8),
            TypeKind::Composite {
                kind: CompositeKind::Class,
                fields: Vec::new(),
                inherits: Vec::new(),
                template_params: Vec::new(),
                declaration: false,
            },
        ));

        let hits = table.lookup_by_name("class Foo<Bar, Baz>");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset(), DebugInfoOffset(0x10));

        // A different argument list must not match.
        let hits = table.lookup_by_name("class Foo<Quux>");
        assert!(hits.is_empty());

        // A bare base name matches every instantiation.
        let hits = table.lookup_by_name("Foo");
        assert_eq!(hits.len(), 2);
    }
}
