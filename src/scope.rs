//! The scope tree: modules, compilation units, functions, lexical blocks.
//!
//! Scopes live in an index arena owned by the provider. Parent links are
//! plain indices, never owning references, so the tree can be mutated in
//! place during range repair without self-referential borrows. Within one
//! compilation unit, scopes are registered in byte-stream order.

use crate::buf::EndianBuf;
use crate::error::Result;
use crate::loc::LocationProvider;
use crate::types::TypeRef;
use crate::unit::DebugInfoOffset;
use tracing::debug;

/// Index of a scope in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    CompileUnit,
    Function,
    LexicalBlock,
}

/// A scope's address coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRanges {
    /// No address information was recorded, or it was invalid.
    Unknown,
    /// A single [low, high) range.
    Contiguous { low: u64, high: u64 },
    /// Non-contiguous [low, high) ranges from `.debug_ranges`.
    List(Vec<(u64, u64)>),
}

impl ScopeRanges {
    /// A contiguous range, rejecting empty and inverted encodings.
    pub fn contiguous(low: u64, high: u64) -> ScopeRanges {
        if low < high {
            ScopeRanges::Contiguous { low, high }
        } else {
            ScopeRanges::Unknown
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        match self {
            ScopeRanges::Unknown => false,
            ScopeRanges::Contiguous { low, high } => *low <= address && address < *high,
            ScopeRanges::List(ranges) => ranges
                .iter()
                .any(|(low, high)| *low <= address && address < *high),
        }
    }

    /// The overall [low, high) bounds, if any range is known.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match self {
            ScopeRanges::Unknown => None,
            ScopeRanges::Contiguous { low, high } => Some((*low, *high)),
            ScopeRanges::List(ranges) => {
                let low = ranges.iter().map(|(low, _)| *low).min()?;
                let high = ranges.iter().map(|(_, high)| *high).max()?;
                Some((low, high))
            }
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ScopeRanges::Unknown)
    }
}

/// A variable or formal parameter attached to a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: Option<String>,
    pub type_ref: Option<TypeRef>,
    pub location: Option<LocationProvider>,
    pub decl_file: Option<String>,
    pub decl_line: Option<u64>,
    pub decl_column: Option<u64>,
    /// Compiler-generated, not declared in source.
    pub artificial: bool,
    /// Visible outside its compilation unit.
    pub external: bool,
}

/// One node of the scope tree.
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: Option<String>,
    /// The entry that produced this scope.
    pub offset: DebugInfoOffset,
    pub ranges: ScopeRanges,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub variables: Vec<Variable>,
    /// Frame-base location, functions only.
    pub frame_base: Option<LocationProvider>,
    /// True for inlined instances of a function.
    pub inlined: bool,
}

impl Scope {
    pub fn new(kind: ScopeKind, offset: DebugInfoOffset) -> Scope {
        Scope {
            kind,
            name: None,
            offset,
            ranges: ScopeRanges::Unknown,
            parent: None,
            children: Vec::new(),
            variables: Vec::new(),
            frame_base: None,
            inlined: false,
        }
    }
}

/// The provider's scope arena.
#[derive(Debug, Default)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    pub fn new() -> ScopeArena {
        ScopeArena::default()
    }

    /// Add a scope, linking it under `parent` when given.
    pub fn alloc(&mut self, mut scope: Scope, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        scope.parent = parent;
        self.scopes.push(scope);
        if let Some(parent) = parent {
            self.scopes[parent.0].children.push(id);
        }
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
    }

    /// Walk up from `id` through its ancestors, starting with `id`.
    pub fn ancestors(&self, id: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(id), move |&current| self.scopes[current.0].parent)
    }

    /// The deepest scope under `root` whose ranges contain `address`.
    pub fn deepest_at(&self, root: ScopeId, address: u64) -> Option<ScopeId> {
        if !self.get(root).ranges.contains(address) {
            return None;
        }
        let mut current = root;
        'descend: loop {
            for &child in &self.get(current).children {
                if self.get(child).ranges.contains(address) {
                    current = child;
                    continue 'descend;
                }
            }
            return Some(current);
        }
    }

    /// The innermost function scope containing `address` under `root`.
    pub fn function_at(&self, root: ScopeId, address: u64) -> Option<ScopeId> {
        let deepest = self.deepest_at(root, address)?;
        self.ancestors(deepest)
            .find(|&id| self.get(id).kind == ScopeKind::Function)
    }

    /// The nearest enclosing frame-base provider for `id`, walking out
    /// through nested and inlined function scopes.
    pub fn frame_base_for(&self, id: ScopeId) -> Option<&LocationProvider> {
        self.ancestors(id)
            .find_map(|current| self.get(current).frame_base.as_ref())
    }

    /// Scope ids under `root` in depth-first order, root first.
    pub fn descendants(&self, root: ScopeId) -> Vec<ScopeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Reverse keeps declaration order in the output.
            stack.extend(self.get(id).children.iter().rev());
        }
        order
    }

    /// Repair missing and inconsistent address ranges under `root`.
    ///
    /// Two fixes, in order: an inlined function with no usable range is
    /// bounded by the line table's rows inside its parent's range, then
    /// every ancestor is widened until it covers its children.
    pub fn repair_ranges(&mut self, root: ScopeId, line: Option<&crate::line::LineProgram>) {
        let order = self.descendants(root);

        // Top-down: inline range recovery needs the parent's range, which
        // an earlier iteration may itself have repaired.
        for &id in &order {
            let scope = self.get(id);
            if !(scope.kind == ScopeKind::Function && scope.inlined) || scope.ranges.is_known() {
                continue;
            }
            let parent_bounds = scope
                .parent
                .and_then(|parent| self.get(parent).ranges.bounds());
            if let (Some((low, high)), Some(line)) = (parent_bounds, line) {
                if let Some((found_low, found_high)) = line.bounds_within(low, high) {
                    debug!(
                        offset = self.get(id).offset.0,
                        low = found_low,
                        high = found_high,
                        "bounded inlined function range from the line table"
                    );
                    self.get_mut(id).ranges = ScopeRanges::contiguous(found_low, found_high);
                }
            }
        }

        // Bottom-up: a parent must cover its children.
        for &id in order.iter().rev() {
            let child_bounds = self
                .get(id)
                .children
                .iter()
                .filter_map(|&child| self.get(child).ranges.bounds())
                .fold(None::<(u64, u64)>, |acc, (low, high)| match acc {
                    Some((alow, ahigh)) => Some((alow.min(low), ahigh.max(high))),
                    None => Some((low, high)),
                });
            let Some((clow, chigh)) = child_bounds else {
                continue;
            };
            let scope = self.get_mut(id);
            match scope.ranges.bounds() {
                None => {
                    scope.ranges = ScopeRanges::contiguous(clow, chigh);
                }
                Some((low, high)) if clow < low || chigh > high => {
                    scope.ranges = ScopeRanges::contiguous(low.min(clow), high.max(chigh));
                }
                Some(_) => {}
            }
        }
    }
}

/// Parse a `.debug_ranges` range list.
///
/// `base_address` is the owning unit's low address; base-address-selection
/// entries (begin == the all-ones tombstone) replace it mid-list.
pub fn parse_range_list(
    debug_ranges: EndianBuf<'_>,
    offset: usize,
    base_address: u64,
    address_size: u8,
) -> Result<Vec<(u64, u64)>> {
    let mut buf = debug_ranges.range_from(offset)?;
    let tombstone = match address_size {
        2 => u64::from(u16::MAX),
        4 => u64::from(u32::MAX),
        _ => u64::MAX,
    };
    let mut base = base_address;
    let mut ranges = Vec::new();

    loop {
        let begin = buf.read_address(address_size)?;
        let end = buf.read_address(address_size)?;
        if begin == 0 && end == 0 {
            break;
        }
        if begin == tombstone {
            base = end;
            continue;
        }
        if begin < end {
            ranges.push((base.wrapping_add(begin), base.wrapping_add(end)));
        }
    }
    Ok(ranges)
}
