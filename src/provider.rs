//! The debug-info provider: one symbol file behind one coarse lock.
//!
//! Parsing is lazy and monotonic. A freshly constructed provider has read
//! nothing; each query raises the parse state just far enough to answer.
//! The levels only ever go up, and reaching a level twice is free, so
//! queries can be issued in any order from any thread.
//!
//! The provider deliberately uses a single mutex around all mutable state
//! rather than finer locks: queries are bursty (a debugger stopping at a
//! breakpoint fires a handful at once) and the expensive part is the
//! initial parse, which must be serialized anyway.

use crate::abbrev::AbbrevCache;
use crate::builder::{Builder, UnitState};
use crate::cfi::CallFrameInfo;
use crate::error::{Error, Result};
use crate::loc::LocationProvider;
use crate::op::{EvalContext, VariableLocation, MAX_FRAME_BASE_DEPTH};
use crate::pubnames;
use crate::scope::{ScopeArena, ScopeId, ScopeKind, Variable};
use crate::sections::{SectionId, SymbolFile};
use crate::types::{Type, TypeRef, TypeTable};
use crate::unit::DebugInfoOffset;
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// How much of the symbol file has been decoded.
///
/// Strictly ordered; the provider only ever moves upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseLevel {
    /// Nothing read yet.
    Unparsed,
    /// Unit headers and the public-name index.
    Initial,
    /// Function and block trees with address ranges.
    Scopes,
    /// Variables attached to their scopes.
    Variables,
    /// The full type table.
    Types,
}

impl Default for ParseLevel {
    fn default() -> ParseLevel {
        ParseLevel::Unparsed
    }
}

/// Receives progress reports during long parses and can cancel them.
///
/// Cancellation is polled at compilation-unit and section boundaries;
/// a cancelled parse returns [`Error::Cancelled`] and leaves the provider
/// consistent at whatever level it had completed.
pub trait ProgressMonitor: Send + Sync {
    /// Called before each unit of work within a stage.
    fn report(&self, stage: &str, current: usize, total: usize);

    /// Polled between units; return true to abandon the parse.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A monitor that reports nowhere and never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {
    fn report(&self, _stage: &str, _current: usize, _total: usize) {}
}

/// A function found by a provider query. Addresses are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: Option<String>,
    /// Overall [low, high) bounds, when the entry carried any.
    pub bounds: Option<(u64, u64)>,
    pub inlined: bool,
    pub unit: DebugInfoOffset,
    pub scope: ScopeId,
}

/// A variable found by a provider query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub variable: Variable,
    /// The scope the variable is declared in.
    pub scope: ScopeId,
    pub unit: DebugInfoOffset,
}

/// A compilation unit found by a provider query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub offset: DebugInfoOffset,
    pub name: Option<String>,
    pub comp_dir: Option<String>,
}

#[derive(Default)]
struct ProviderState {
    level: ParseLevel,
    units: Vec<UnitState>,
    abbrev_cache: AbbrevCache,
    scopes: ScopeArena,
    types: TypeTable,
    /// Name to owning-unit index from `.debug_pubnames`, when present.
    pubnames: Option<HashMap<String, Vec<DebugInfoOffset>>>,
    disposed: bool,
}

/// Lazily parsed debug information for one symbol file.
pub struct DebugInfoProvider<'data> {
    file: SymbolFile<'data>,
    state: Mutex<ProviderState>,
}

impl<'data> DebugInfoProvider<'data> {
    pub fn new(file: SymbolFile<'data>) -> DebugInfoProvider<'data> {
        DebugInfoProvider {
            file,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// The symbol file this provider reads.
    pub fn file(&self) -> &SymbolFile<'data> {
        &self.file
    }

    /// The level everything has been parsed to. Individual units may be
    /// further along from targeted queries.
    pub fn parse_level(&self) -> ParseLevel {
        self.lock().level
    }

    /// Raise the parse state to at least `target`.
    pub fn ensure_parsed(&self, target: ParseLevel, monitor: &dyn ProgressMonitor) -> Result<()> {
        let mut state = self.guard()?;
        self.advance(&mut state, target, monitor)
    }

    /// Release every table. The provider answers only
    /// [`Error::Disposed`] afterwards.
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.units.clear();
        state.abbrev_cache.clear();
        state.scopes.clear();
        state.types.clear();
        state.pubnames = None;
        state.level = ParseLevel::Unparsed;
        state.disposed = true;
        debug!(path = %self.file.path().display(), "provider disposed");
    }

    /// Functions whose name matches `name`.
    ///
    /// A qualified candidate like `ns::frob` matches the full query; with
    /// `unqualified` set, the bare trailing component matches too.
    pub fn functions_by_name(
        &self,
        name: &str,
        unqualified: bool,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<FunctionInfo>> {
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        let candidates = self.candidate_units(&state, name, unqualified);
        let mut found = Vec::new();
        for index in candidates {
            check_cancelled(monitor)?;
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            builder.ensure_scopes(index)?;
            let Some(root) = state.units[index].root else {
                continue;
            };
            let unit = state.units[index].header.offset();
            for id in state.scopes.descendants(root) {
                let scope = state.scopes.get(id);
                if scope.kind != ScopeKind::Function {
                    continue;
                }
                let Some(candidate) = self.qualified_name(&state.scopes, id) else {
                    continue;
                };
                if !name_matches(&candidate, name, unqualified) {
                    continue;
                }
                found.push(FunctionInfo {
                    name: Some(candidate),
                    bounds: self.absolute_bounds(scope.ranges.bounds()),
                    inlined: scope.inlined,
                    unit,
                    scope: id,
                });
            }
        }
        Ok(found)
    }

    /// The function whose code contains the absolute `address`.
    pub fn function_at(
        &self,
        address: u64,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Option<FunctionInfo>> {
        let link = self.file.translator().to_link(address);
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        for index in 0..state.units.len() {
            check_cancelled(monitor)?;
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            builder.ensure_scopes(index)?;
            let Some(root) = state.units[index].root else {
                continue;
            };
            let Some(id) = state.scopes.function_at(root, link) else {
                continue;
            };
            let scope = state.scopes.get(id);
            return Ok(Some(FunctionInfo {
                name: self.qualified_name(&state.scopes, id),
                bounds: self.absolute_bounds(scope.ranges.bounds()),
                inlined: scope.inlined,
                unit: state.units[index].header.offset(),
                scope: id,
            }));
        }
        Ok(None)
    }

    /// Variables matching `name`. With `globals_only`, only variables
    /// declared at unit or module level or marked external are returned.
    pub fn variables_by_name(
        &self,
        name: &str,
        globals_only: bool,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<VariableInfo>> {
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        let candidates = self.candidate_units(&state, name, false);
        let mut found = Vec::new();
        for index in candidates {
            check_cancelled(monitor)?;
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            builder.ensure_variables(index)?;
            let Some(root) = state.units[index].root else {
                continue;
            };
            let unit = state.units[index].header.offset();
            for id in state.scopes.descendants(root) {
                let scope = state.scopes.get(id);
                let global_scope =
                    matches!(scope.kind, ScopeKind::CompileUnit | ScopeKind::Module);
                for variable in &scope.variables {
                    if variable.name.as_deref() != Some(name) {
                        continue;
                    }
                    if globals_only && !global_scope && !variable.external {
                        continue;
                    }
                    found.push(VariableInfo {
                        variable: variable.clone(),
                        scope: id,
                        unit,
                    });
                }
            }
        }
        Ok(found)
    }

    /// Variables visible at the absolute `address`: the deepest scope
    /// containing it and every enclosing scope, innermost first.
    pub fn variables_at(
        &self,
        address: u64,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<VariableInfo>> {
        let link = self.file.translator().to_link(address);
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        for index in 0..state.units.len() {
            check_cancelled(monitor)?;
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            builder.ensure_variables(index)?;
            let Some(root) = state.units[index].root else {
                continue;
            };
            let Some(deepest) = state.scopes.deepest_at(root, link) else {
                continue;
            };
            let unit = state.units[index].header.offset();
            let mut found = Vec::new();
            for id in state.scopes.ancestors(deepest) {
                for variable in &state.scopes.get(id).variables {
                    found.push(VariableInfo {
                        variable: variable.clone(),
                        scope: id,
                        unit,
                    });
                }
            }
            return Ok(found);
        }
        Ok(Vec::new())
    }

    /// Compute where a variable's value lives at the absolute `address`.
    ///
    /// Frame-base references inside the expression are resolved through
    /// the variable's enclosing function scopes; `ctx` supplies live
    /// registers and memory and must not call back into this provider.
    pub fn variable_location(
        &self,
        info: &VariableInfo,
        address: u64,
        ctx: &dyn EvalContext,
    ) -> Result<VariableLocation> {
        let link = self.file.translator().to_link(address);
        let state = self.guard()?;
        let provider = info
            .variable
            .location
            .as_ref()
            .ok_or(Error::NoLocationForAddress(address))?;

        let frame_ctx = FrameBaseContext {
            inner: ctx,
            scopes: &state.scopes,
            scope: info.scope,
            endian: self.file.endian(),
            address_size: self.file.address_size(),
            address: link,
            depth: Cell::new(0),
        };
        let location = provider.evaluate(
            link,
            self.file.endian(),
            self.file.address_size(),
            &frame_ctx,
        )?;
        // Static storage is recorded at link addresses.
        Ok(match location {
            VariableLocation::Memory {
                address,
                is_static: true,
            } => VariableLocation::Memory {
                address: self.file.translator().to_absolute(address),
                is_static: true,
            },
            other => other,
        })
    }

    /// The unit whose code covers the absolute `address`.
    pub fn unit_for_address(
        &self,
        address: u64,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Option<UnitInfo>> {
        let link = self.file.translator().to_link(address);
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        for index in 0..state.units.len() {
            check_cancelled(monitor)?;
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            builder.ensure_scopes(index)?;
            let Some(root) = state.units[index].root else {
                continue;
            };
            if state.scopes.get(root).ranges.contains(link) {
                return Ok(Some(unit_info(&state.units[index])));
            }
        }
        Ok(None)
    }

    /// The unit built from the given source path. Matches the unit's own
    /// name (bare or joined with its compilation directory) and then any
    /// file named by its line program.
    pub fn unit_for_source_path(
        &self,
        path: &str,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Option<UnitInfo>> {
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        for index in 0..state.units.len() {
            check_cancelled(monitor)?;
            if unit_matches_path(&state.units[index], path) {
                return Ok(Some(unit_info(&state.units[index])));
            }
            let state = &mut *state;
            let comp_dir = state.units[index].comp_dir.clone();
            let mut builder = builder(&self.file, state);
            if let Some(line) = builder.line_for(index) {
                let matched = (1..=line.files().len() as u64)
                    .filter_map(|file| line.file_path(file, comp_dir.as_deref()))
                    .any(|candidate| candidate == path);
                if matched {
                    return Ok(Some(unit_info(&state.units[index])));
                }
            }
        }
        Ok(None)
    }

    /// Resolve the type at a `.debug_info` offset.
    ///
    /// Repeated calls return the identical [`Arc`]; nothing is reparsed.
    pub fn type_by_offset(
        &self,
        offset: DebugInfoOffset,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Arc<Type>> {
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;
        let state = &mut *state;
        let mut builder = builder(&self.file, state);
        builder.resolve_type_ref(TypeRef(offset))
    }

    /// Types matching a display name, after normalization.
    pub fn types_by_name(
        &self,
        query: &str,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<Arc<Type>>> {
        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Types, monitor)?;
        Ok(state.types.lookup_by_name(query))
    }

    /// Every source path the symbol file references: each unit's own
    /// source plus every file in its line programs.
    ///
    /// When `cache_dir` is given the list is cached on disk, keyed by the
    /// symbol path and invalidated by its modification time, so a warm
    /// start skips the line-program scan.
    pub fn source_files(
        &self,
        cache_dir: Option<&Path>,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<String>> {
        let cache_path = cache_dir.map(|dir| self.cache_file_path(dir));
        if let Some(path) = &cache_path {
            if let Some(cached) = self.read_source_cache(path) {
                debug!(path = %path.display(), "source list served from cache");
                return Ok(cached);
            }
        }

        let mut state = self.guard()?;
        self.advance(&mut state, ParseLevel::Initial, monitor)?;

        let mut files = Vec::new();
        for index in 0..state.units.len() {
            check_cancelled(monitor)?;
            let comp_dir = state.units[index].comp_dir.clone();
            if let Some(unit_source) = unit_source_path(&state.units[index]) {
                files.push(unit_source);
            }
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            if let Some(line) = builder.line_for(index) {
                for file in 1..=line.files().len() as u64 {
                    if let Some(path) = line.file_path(file, comp_dir.as_deref()) {
                        files.push(path);
                    }
                }
            }
        }
        files.sort();
        files.dedup();

        if let Some(path) = &cache_path {
            if let Err(error) = self.write_source_cache(path, &files) {
                warn!(path = %path.display(), %error, "could not write the source list cache");
            }
        }
        Ok(files)
    }

    /// Frame-unwind info over the file's `.debug_frame`, falling back to
    /// `.eh_frame`. The returned value carries its own CIE cache; callers
    /// that unwind repeatedly should keep it.
    pub fn call_frame_info(&self) -> Result<CallFrameInfo<'data>> {
        if self.file.has_section(SectionId::DebugFrame) {
            Ok(CallFrameInfo::debug_frame(
                self.file.section(SectionId::DebugFrame),
                self.file.address_size(),
            ))
        } else if self.file.has_section(SectionId::EhFrame) {
            Ok(CallFrameInfo::eh_frame(
                self.file.section(SectionId::EhFrame),
                self.file.address_size(),
                0,
            ))
        } else {
            Err(Error::MissingSection(SectionId::DebugFrame.name()))
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self) -> Result<MutexGuard<'_, ProviderState>> {
        let state = self.lock();
        if state.disposed {
            return Err(Error::Disposed);
        }
        Ok(state)
    }

    fn advance(
        &self,
        state: &mut ProviderState,
        target: ParseLevel,
        monitor: &dyn ProgressMonitor,
    ) -> Result<()> {
        if state.level < ParseLevel::Initial && target >= ParseLevel::Initial {
            check_cancelled(monitor)?;
            monitor.report("units", 0, 1);
            {
                let state = &mut *state;
                let mut builder = builder(&self.file, state);
                builder.parse_unit_headers()?;
            }
            state.pubnames = self.build_pubnames_index();
            state.level = ParseLevel::Initial;
        }
        self.advance_units(state, target, ParseLevel::Scopes, "scopes", monitor)?;
        self.advance_units(state, target, ParseLevel::Variables, "variables", monitor)?;
        self.advance_units(state, target, ParseLevel::Types, "types", monitor)?;
        Ok(())
    }

    /// Run one per-unit stage across every unit, then commit the level.
    fn advance_units(
        &self,
        state: &mut ProviderState,
        target: ParseLevel,
        stage_level: ParseLevel,
        stage: &str,
        monitor: &dyn ProgressMonitor,
    ) -> Result<()> {
        if target < stage_level || state.level >= stage_level {
            return Ok(());
        }
        let total = state.units.len();
        for index in 0..total {
            check_cancelled(monitor)?;
            monitor.report(stage, index, total);
            let state = &mut *state;
            let mut builder = builder(&self.file, state);
            match stage_level {
                ParseLevel::Scopes => builder.ensure_scopes(index)?,
                ParseLevel::Variables => builder.ensure_variables(index)?,
                ParseLevel::Types => builder.ensure_types(index)?,
                _ => {}
            }
        }
        state.level = stage_level;
        Ok(())
    }

    fn build_pubnames_index(&self) -> Option<HashMap<String, Vec<DebugInfoOffset>>> {
        if !self.file.has_section(SectionId::DebugPubNames) {
            return None;
        }
        match pubnames::build_index(self.file.section(SectionId::DebugPubNames)) {
            Ok(index) => Some(index),
            Err(error) => {
                warn!(%error, "ignoring a corrupt .debug_pubnames section");
                None
            }
        }
    }

    /// Units worth searching for `name`. A pubnames hit narrows the
    /// sweep; a miss or an absent index searches everything, since the
    /// index only covers external names.
    fn candidate_units(
        &self,
        state: &ProviderState,
        name: &str,
        unqualified: bool,
    ) -> Vec<usize> {
        let all = || (0..state.units.len()).collect();
        if unqualified && name.contains("::") {
            return all();
        }
        let Some(index) = &state.pubnames else {
            return all();
        };
        let key = if unqualified {
            name
        } else {
            name.rsplit("::").next().unwrap_or(name)
        };
        match index.get(key) {
            Some(units) => units
                .iter()
                .filter_map(|offset| {
                    state
                        .units
                        .iter()
                        .position(|unit| unit.header.offset() == *offset)
                })
                .collect(),
            None => {
                debug!(name, "name not in .debug_pubnames; sweeping all units");
                all()
            }
        }
    }

    /// A scope's display name with enclosing module names prepended.
    fn qualified_name(&self, scopes: &ScopeArena, id: ScopeId) -> Option<String> {
        let own = scopes.get(id).name.clone()?;
        let mut modules: Vec<&str> = scopes
            .ancestors(id)
            .skip(1)
            .filter(|&ancestor| scopes.get(ancestor).kind == ScopeKind::Module)
            .filter_map(|ancestor| scopes.get(ancestor).name.as_deref())
            .collect();
        if modules.is_empty() {
            return Some(own);
        }
        modules.reverse();
        Some(format!("{}::{}", modules.join("::"), own))
    }

    fn absolute_bounds(&self, bounds: Option<(u64, u64)>) -> Option<(u64, u64)> {
        bounds.map(|(low, high)| {
            (
                self.file.translator().to_absolute(low),
                self.file.translator().to_absolute(high),
            )
        })
    }

    /// The cache file for this symbol file: a stable hash of its path.
    fn cache_file_path(&self, dir: &Path) -> PathBuf {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.file.path().hash(&mut hasher);
        dir.join(format!("{:016x}.src", hasher.finish()))
    }

    fn mtime_stamp(&self) -> u64 {
        self.file
            .mtime()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }

    /// A cached source list is a stamp line followed by one path per
    /// line; a stale stamp invalidates the whole file.
    fn read_source_cache(&self, path: &Path) -> Option<Vec<String>> {
        let contents = fs::read_to_string(path).ok()?;
        let mut lines = contents.lines();
        let stamp: u64 = lines.next()?.parse().ok()?;
        if stamp != self.mtime_stamp() {
            return None;
        }
        Some(lines.map(str::to_string).collect())
    }

    fn write_source_cache(&self, path: &Path, files: &[String]) -> std::io::Result<()> {
        let mut out = fs::File::create(path)?;
        writeln!(out, "{}", self.mtime_stamp())?;
        for file in files {
            writeln!(out, "{}", file)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DebugInfoProvider<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInfoProvider")
            .field("file", &self.file)
            .field("level", &self.parse_level())
            .finish()
    }
}

fn builder<'a, 'data>(
    file: &'a SymbolFile<'data>,
    state: &'a mut ProviderState,
) -> Builder<'a, 'data> {
    Builder {
        file,
        units: &mut state.units,
        abbrev_cache: &mut state.abbrev_cache,
        scopes: &mut state.scopes,
        types: &mut state.types,
    }
}

fn check_cancelled(monitor: &dyn ProgressMonitor) -> Result<()> {
    if monitor.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn name_matches(candidate: &str, query: &str, unqualified: bool) -> bool {
    if candidate == query {
        return true;
    }
    unqualified && candidate.rsplit("::").next() == Some(query)
}

fn unit_info(unit: &UnitState) -> UnitInfo {
    UnitInfo {
        offset: unit.header.offset(),
        name: unit.name.clone(),
        comp_dir: unit.comp_dir.clone(),
    }
}

fn unit_source_path(unit: &UnitState) -> Option<String> {
    let name = unit.name.as_deref()?;
    if name.starts_with('/') {
        return Some(name.to_string());
    }
    match unit.comp_dir.as_deref() {
        Some(dir) => Some(format!("{}/{}", dir.trim_end_matches('/'), name)),
        None => Some(name.to_string()),
    }
}

fn unit_matches_path(unit: &UnitState, path: &str) -> bool {
    if unit.name.as_deref() == Some(path) {
        return true;
    }
    unit_source_path(unit).as_deref() == Some(path)
}

/// Evaluation context that resolves frame-base references through the
/// scope tree while delegating machine state to the caller's context.
struct FrameBaseContext<'a> {
    inner: &'a dyn EvalContext,
    scopes: &'a ScopeArena,
    scope: ScopeId,
    endian: crate::endian::RunTimeEndian,
    address_size: u8,
    address: u64,
    depth: Cell<usize>,
}

impl FrameBaseContext<'_> {
    fn frame_base_provider(&self) -> Option<&LocationProvider> {
        self.scopes.frame_base_for(self.scope)
    }
}

impl EvalContext for FrameBaseContext<'_> {
    fn register(&self, register: u16) -> Result<u64> {
        self.inner.register(register)
    }

    fn read_memory(&self, address: u64) -> Result<u64> {
        self.inner.read_memory(address)
    }

    fn frame_base(&self) -> Result<u64> {
        if self.depth.get() >= MAX_FRAME_BASE_DEPTH {
            return Err(Error::NoFrameBase);
        }
        self.depth.set(self.depth.get() + 1);
        let provider = self.frame_base_provider().ok_or(Error::NoFrameBase)?;
        // Recursing through self lets a frame-base expression itself use
        // the frame base, bounded by the depth counter.
        let location = provider.evaluate(self.address, self.endian, self.address_size, self)?;
        self.depth.set(self.depth.get() - 1);
        location_value(location, self.inner)
    }
}

/// Collapse an evaluated location into the scalar it denotes, for use as
/// a frame base.
fn location_value(location: VariableLocation, ctx: &dyn EvalContext) -> Result<u64> {
    match location {
        VariableLocation::Memory { address, .. } => Ok(address),
        VariableLocation::Register { register } => ctx.register(register),
        VariableLocation::RegisterOffset { register, offset } => {
            Ok(ctx.register(register)?.wrapping_add_signed(offset))
        }
        VariableLocation::Value { value } => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::RunTimeEndian;
    use crate::test_util::SectionMethods;
    use crate::types::{CompositeKind, TypeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_assembler::{Endian, Label, LabelMaker, Section};

    // Form numbers used by the synthetic program.
    const FORM_ADDR: u64 = 0x01;
    const FORM_DATA4: u64 = 0x06;
    const FORM_STRING: u64 = 0x08;
    const FORM_BLOCK1: u64 = 0x0a;
    const FORM_DATA1: u64 = 0x0b;
    const FORM_FLAG: u64 = 0x0c;
    const FORM_REF4: u64 = 0x13;

    fn abbrev_section() -> Vec<u8> {
        Section::with_endian(Endian::Little)
            // 1: compile unit, has children
            .uleb(1).uleb(0x11).D8(1)
            .uleb(0x03).uleb(FORM_STRING) // name
            .uleb(0x1b).uleb(FORM_STRING) // comp_dir
            .uleb(0x11).uleb(FORM_ADDR) // low_pc
            .uleb(0x12).uleb(FORM_DATA4) // high_pc, offset form
            .uleb(0).uleb(0)
            // 2: subprogram, has children
            .uleb(2).uleb(0x2e).D8(1)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x11).uleb(FORM_ADDR)
            .uleb(0x12).uleb(FORM_DATA4)
            .uleb(0x40).uleb(FORM_BLOCK1) // frame_base
            .uleb(0x3f).uleb(FORM_FLAG) // external
            .uleb(0).uleb(0)
            // 3: variable, no children
            .uleb(3).uleb(0x34).D8(0)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x49).uleb(FORM_REF4) // type
            .uleb(0x02).uleb(FORM_BLOCK1) // location
            .uleb(0x3f).uleb(FORM_FLAG)
            .uleb(0).uleb(0)
            // 4: base type, no children
            .uleb(4).uleb(0x24).D8(0)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x0b).uleb(FORM_DATA1) // byte_size
            .uleb(0x3e).uleb(FORM_DATA1) // encoding
            .uleb(0).uleb(0)
            // 5: structure, has children
            .uleb(5).uleb(0x13).D8(1)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x0b).uleb(FORM_DATA1)
            .uleb(0).uleb(0)
            // 6: member, no children
            .uleb(6).uleb(0x0d).D8(0)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x49).uleb(FORM_REF4)
            .uleb(0x38).uleb(FORM_DATA1) // data_member_location
            .uleb(0).uleb(0)
            // 7: union, has children
            .uleb(7).uleb(0x17).D8(1)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x0b).uleb(FORM_DATA1)
            .uleb(0).uleb(0)
            // 8: formal parameter, no children
            .uleb(8).uleb(0x05).D8(0)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0x49).uleb(FORM_REF4)
            .uleb(0x02).uleb(FORM_BLOCK1)
            .uleb(0).uleb(0)
            // 9: namespace, has children
            .uleb(9).uleb(0x39).D8(1)
            .uleb(0x03).uleb(FORM_STRING)
            .uleb(0).uleb(0)
            // end of table
            .uleb(0)
            .get_contents()
            .unwrap()
    }

    struct TestProgram {
        debug_info: Vec<u8>,
        debug_abbrev: Vec<u8>,
        int_offset: usize,
        outer_offset: usize,
        loop_offset: usize,
    }

    /// One compile unit:
    ///
    /// ```text
    /// test.cpp [0x1000, 0x2000)  (comp dir /src)
    ///   int                       (base type)
    ///   struct Outer { a@0, b@8; union __C1 {x} }   size 12
    ///   struct Loop  { self_ref@0; union __C2 {y} } size 4
    ///   namespace ns
    ///     fn frob [0x1100, 0x1200) frame_base breg13+0
    ///       param arg: int at fbreg-8
    ///   var g_counter: int at addr 0x4000
    /// ```
    fn test_program() -> TestProgram {
        let length = Label::new();
        let start = Label::new();
        let end = Label::new();
        let int_ty = Label::new();
        let outer_ty = Label::new();
        let loop_ty = Label::new();
        let int_ref = Label::new();
        let int_ref2 = Label::new();
        let int_ref3 = Label::new();
        let int_ref4 = Label::new();
        let int_ref5 = Label::new();
        let loop_ref = Label::new();

        let section = Section::with_endian(Endian::Little);
        let origin = section.start();
        let section = section
            .D32(&length)
            .mark(&start)
            .D16(4) // version
            .D32(0) // abbrev offset
            .D8(4) // address size
            // root
            .uleb(1)
            .append_bytes(b"test.cpp\0")
            .append_bytes(b"/src\0")
            .D32(0x1000)
            .D32(0x1000) // high = low + 0x1000
            // int
            .mark(&int_ty)
            .uleb(4)
            .append_bytes(b"int\0")
            .D8(4)
            .D8(5)
            // struct Outer
            .mark(&outer_ty)
            .uleb(5)
            .append_bytes(b"Outer\0")
            .D8(12)
            .uleb(6)
            .append_bytes(b"a\0")
            .D32(&int_ref)
            .D8(0)
            .uleb(6)
            .append_bytes(b"b\0")
            .D32(&int_ref2)
            .D8(8)
            .uleb(7)
            .append_bytes(b"__C1\0")
            .D8(4)
            .uleb(6)
            .append_bytes(b"x\0")
            .D32(&int_ref3)
            .D8(0)
            .uleb(0) // end __C1
            .uleb(0) // end Outer
            // struct Loop
            .mark(&loop_ty)
            .uleb(5)
            .append_bytes(b"Loop\0")
            .D8(4)
            .uleb(6)
            .append_bytes(b"self_ref\0")
            .D32(&loop_ref)
            .D8(0)
            .uleb(7)
            .append_bytes(b"__C2\0")
            .D8(4)
            .uleb(6)
            .append_bytes(b"y\0")
            .D32(&int_ref4)
            .D8(0)
            .uleb(0) // end __C2
            .uleb(0) // end Loop
            // namespace ns
            .uleb(9)
            .append_bytes(b"ns\0")
            .uleb(2)
            .append_bytes(b"frob\0")
            .D32(0x1100)
            .D32(0x100)
            .D8(2) // frame_base block length
            .D8(0x7d) // DW_OP_breg13
            .D8(0x00) // sleb 0
            .D8(1) // external
            .uleb(8)
            .append_bytes(b"arg\0")
            .D32(&int_ref5)
            .D8(2) // location block length
            .D8(0x91) // DW_OP_fbreg
            .D8(0x78) // sleb -8
            .uleb(0) // end frob
            .uleb(0) // end ns
            // g_counter
            .uleb(3)
            .append_bytes(b"g_counter\0")
            .D32(&int_ref)
            .D8(5) // location block length
            .D8(0x03) // DW_OP_addr
            .D32(0x4000)
            .D8(1) // external
            .uleb(0) // end of unit children
            .mark(&end);
        origin.set_const(0);
        length.set_const((&end - &start) as u64);
        let int_value = (&int_ty - &origin) as u64;
        int_ref.set_const(int_value);
        int_ref2.set_const(int_value);
        int_ref3.set_const(int_value);
        int_ref4.set_const(int_value);
        int_ref5.set_const(int_value);
        loop_ref.set_const((&loop_ty - &origin) as u64);

        let int_offset = (&int_ty - &origin) as usize;
        let outer_offset = (&outer_ty - &origin) as usize;
        let loop_offset = (&loop_ty - &origin) as usize;
        TestProgram {
            debug_info: section.get_contents().unwrap(),
            debug_abbrev: abbrev_section(),
            int_offset,
            outer_offset,
            loop_offset,
        }
    }

    fn provider(program: &TestProgram) -> DebugInfoProvider<'_> {
        let file = SymbolFile::new("/tmp/test.elf", 4, RunTimeEndian::Little)
            .with_section(SectionId::DebugInfo, &program.debug_info)
            .with_section(SectionId::DebugAbbrev, &program.debug_abbrev);
        DebugInfoProvider::new(file)
    }

    struct TestFrame;

    impl EvalContext for TestFrame {
        fn register(&self, register: u16) -> Result<u64> {
            match register {
                13 => Ok(0x7000),
                _ => Err(Error::RegisterUnavailable(register)),
            }
        }
    }

    #[test]
    fn test_parse_levels_are_monotonic() {
        let program = test_program();
        let provider = provider(&program);
        assert_eq!(provider.parse_level(), ParseLevel::Unparsed);

        provider
            .ensure_parsed(ParseLevel::Scopes, &NoProgress)
            .unwrap();
        assert_eq!(provider.parse_level(), ParseLevel::Scopes);

        // Asking for less never lowers the level.
        provider
            .ensure_parsed(ParseLevel::Initial, &NoProgress)
            .unwrap();
        assert_eq!(provider.parse_level(), ParseLevel::Scopes);

        provider
            .ensure_parsed(ParseLevel::Types, &NoProgress)
            .unwrap();
        assert_eq!(provider.parse_level(), ParseLevel::Types);
    }

    #[test]
    fn test_functions_by_name() {
        let program = test_program();
        let provider = provider(&program);

        // The qualified name does not match the bare query without the
        // unqualified flag.
        let strict = provider
            .functions_by_name("frob", false, &NoProgress)
            .unwrap();
        assert!(strict.is_empty());

        let relaxed = provider
            .functions_by_name("frob", true, &NoProgress)
            .unwrap();
        assert_eq!(relaxed.len(), 1);
        assert_eq!(relaxed[0].name.as_deref(), Some("ns::frob"));
        assert_eq!(relaxed[0].bounds, Some((0x1100, 0x1200)));

        let qualified = provider
            .functions_by_name("ns::frob", false, &NoProgress)
            .unwrap();
        assert_eq!(qualified.len(), 1);
    }

    #[test]
    fn test_function_at_address() {
        let program = test_program();
        let provider = provider(&program);

        let hit = provider.function_at(0x1150, &NoProgress).unwrap().unwrap();
        assert_eq!(hit.name.as_deref(), Some("ns::frob"));
        assert!(!hit.inlined);

        assert_eq!(provider.function_at(0x5000, &NoProgress).unwrap(), None);
    }

    #[test]
    fn test_variables_by_name_globals_filter() {
        let program = test_program();
        let provider = provider(&program);

        let globals = provider
            .variables_by_name("g_counter", true, &NoProgress)
            .unwrap();
        assert_eq!(globals.len(), 1);
        assert!(globals[0].variable.external);

        assert!(provider
            .variables_by_name("arg", true, &NoProgress)
            .unwrap()
            .is_empty());
        assert_eq!(
            provider
                .variables_by_name("arg", false, &NoProgress)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_variable_location_through_frame_base() {
        let program = test_program();
        let provider = provider(&program);

        let args = provider
            .variables_by_name("arg", false, &NoProgress)
            .unwrap();
        let location = provider
            .variable_location(&args[0], 0x1150, &TestFrame)
            .unwrap();
        // frame base = r13 = 0x7000, then fbreg -8.
        assert_eq!(
            location,
            VariableLocation::Memory {
                address: 0x6ff8,
                is_static: false
            }
        );
    }

    #[test]
    fn test_static_variable_location() {
        let program = test_program();
        let provider = provider(&program);

        let globals = provider
            .variables_by_name("g_counter", true, &NoProgress)
            .unwrap();
        let location = provider
            .variable_location(&globals[0], 0x1150, &TestFrame)
            .unwrap();
        assert_eq!(
            location,
            VariableLocation::Memory {
                address: 0x4000,
                is_static: true
            }
        );
    }

    #[test]
    fn test_variables_at_address() {
        let program = test_program();
        let provider = provider(&program);

        let visible = provider.variables_at(0x1150, &NoProgress).unwrap();
        let names: Vec<_> = visible
            .iter()
            .filter_map(|info| info.variable.name.as_deref())
            .collect();
        // Innermost first: the parameter, then unit-level globals.
        assert_eq!(names, vec!["arg", "g_counter"]);
    }

    #[test]
    fn test_type_resolution_is_idempotent() {
        let program = test_program();
        let provider = provider(&program);
        let offset = DebugInfoOffset(program.outer_offset);

        let first = provider.type_by_offset(offset, &NoProgress).unwrap();
        let second = provider.type_by_offset(offset, &NoProgress).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), Some("Outer"));
    }

    #[test]
    fn test_anonymous_union_patched_into_gap() {
        let program = test_program();
        let provider = provider(&program);

        let outer = provider
            .type_by_offset(DebugInfoOffset(program.outer_offset), &NoProgress)
            .unwrap();
        let TypeKind::Composite { kind, fields, .. } = outer.kind() else {
            panic!("expected a composite, got {:?}", outer.kind());
        };
        assert_eq!(*kind, CompositeKind::Struct);
        // a@0 and b@8 are 4 bytes each in a 12-byte struct; the only
        // place the unreferenced 4-byte __C1 fits is offset 4.
        let placed: Vec<_> = fields
            .iter()
            .map(|field| (field.name.as_str(), field.byte_offset))
            .collect();
        assert_eq!(placed, vec![("a", 0), ("$unnamed$1", 4), ("b", 8)]);
    }

    #[test]
    fn test_self_referential_type_terminates() {
        let program = test_program();
        let provider = provider(&program);

        // Resolving Loop sizes its own field, which re-enters Loop; the
        // inner edge takes the placeholder and resolution completes.
        let looped = provider
            .type_by_offset(DebugInfoOffset(program.loop_offset), &NoProgress)
            .unwrap();
        assert!(!looped.is_unhandled());
        assert_eq!(looped.name(), Some("Loop"));
        let TypeKind::Composite { fields, .. } = looped.kind() else {
            panic!("expected a composite");
        };
        assert!(fields.iter().any(|field| field.name == "$unnamed$2"));
    }

    #[test]
    fn test_types_by_name() {
        let program = test_program();
        let provider = provider(&program);

        let types = provider.types_by_name("Outer", &NoProgress).unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].offset(), DebugInfoOffset(program.outer_offset));

        let ints = provider.types_by_name("int", &NoProgress).unwrap();
        assert_eq!(ints.len(), 1);
        assert_eq!(ints[0].byte_size(), Some(4));
    }

    #[test]
    fn test_unit_queries() {
        let program = test_program();
        let provider = provider(&program);

        let by_address = provider
            .unit_for_address(0x1234, &NoProgress)
            .unwrap()
            .unwrap();
        assert_eq!(by_address.name.as_deref(), Some("test.cpp"));
        assert_eq!(by_address.comp_dir.as_deref(), Some("/src"));

        let by_path = provider
            .unit_for_source_path("/src/test.cpp", &NoProgress)
            .unwrap();
        assert_eq!(by_path, Some(by_address));

        assert_eq!(
            provider
                .unit_for_source_path("/src/other.cpp", &NoProgress)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_source_files_cached_on_disk() {
        let program = test_program();
        let provider = provider(&program);
        let dir = std::env::temp_dir().join(format!(
            "moria-src-cache-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).unwrap();

        let cold = provider
            .source_files(Some(dir.as_path()), &NoProgress)
            .unwrap();
        assert_eq!(cold, vec!["/src/test.cpp".to_string()]);

        // A second provider over the same bytes must be served from the
        // cache file written by the first.
        let cache_file = provider.cache_file_path(dir.as_path());
        assert!(cache_file.exists());
        let fresh = self::provider(&program);
        let warm = fresh
            .source_files(Some(dir.as_path()), &NoProgress)
            .unwrap();
        assert_eq!(warm, cold);
        assert_eq!(fresh.parse_level(), ParseLevel::Unparsed);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_dispose_rejects_queries() {
        let program = test_program();
        let provider = provider(&program);
        provider
            .ensure_parsed(ParseLevel::Scopes, &NoProgress)
            .unwrap();

        provider.dispose();
        assert_eq!(
            provider.functions_by_name("frob", true, &NoProgress),
            Err(Error::Disposed)
        );
        assert_eq!(
            provider.ensure_parsed(ParseLevel::Initial, &NoProgress),
            Err(Error::Disposed)
        );
        // Disposing twice is harmless.
        provider.dispose();
    }

    struct CancelAfter {
        reports: AtomicUsize,
        limit: usize,
    }

    impl ProgressMonitor for CancelAfter {
        fn report(&self, _stage: &str, _current: usize, _total: usize) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.reports.load(Ordering::SeqCst) >= self.limit
        }
    }

    #[test]
    fn test_cancellation_between_stages() {
        let program = test_program();
        let provider = provider(&program);
        let monitor = CancelAfter {
            reports: AtomicUsize::new(0),
            limit: 1,
        };

        assert_eq!(
            provider.ensure_parsed(ParseLevel::Types, &monitor),
            Err(Error::Cancelled)
        );
        // The stages that completed before the cancel stay committed.
        assert_eq!(provider.parse_level(), ParseLevel::Initial);

        provider
            .ensure_parsed(ParseLevel::Types, &NoProgress)
            .unwrap();
        assert_eq!(provider.parse_level(), ParseLevel::Types);
    }

    #[test]
    fn test_name_matching() {
        assert!(name_matches("ns::frob", "ns::frob", false));
        assert!(!name_matches("ns::frob", "frob", false));
        assert!(name_matches("ns::frob", "frob", true));
        assert!(name_matches("frob", "frob", true));
        assert!(!name_matches("ns::frobnicate", "frob", true));
    }
}
