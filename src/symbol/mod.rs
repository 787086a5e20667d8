//! Symbol table: per-name resolved state, concrete symbol occurrences,
//! and the deterministic override rules applied on every insertion

use std::collections::HashMap;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::base::{InputId, LdSymbolId, SymbolId};
use crate::config::LinkerConfig;
use crate::diag::{DiagKind, DiagnosticEngine};
use crate::error::{Error, Result};
use crate::fragment::FragmentRef;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
/// Symbol binding
pub enum Binding {
    /// Visible to all inputs; participates in the global pool
    Global = 0,
    /// Loses to any strong definition
    Weak = 1,
    /// Never enters the global pool
    Local = 2,
    /// A value, not a location
    Absolute = 3,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
/// How far along a symbol is toward a definition
pub enum Desc {
    /// Referenced but not defined
    Undefined = 0,
    /// Defined at a location
    Define = 1,
    /// A common block; merged by size/alignment
    Common = 2,
    /// Present in a lazy archive member that was never pulled in
    Unused = 3,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[non_exhaustive]
/// What the symbol refers to
pub enum SymType {
    /// No type recorded
    NoType = 0,
    /// A data object
    Object = 1,
    /// A function
    Function = 2,
    /// A section symbol
    Section = 3,
    /// A source-file name
    File = 4,
    /// A common block
    CommonBlock = 5,
    /// Thread-local storage
    ThreadLocal = 6,
    /// An indirect (resolver) function
    IndirectFunc = 10,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive)]
/// ELF symbol visibility. The derived order is the ELF encoding, not the
/// restrictiveness lattice; use [`Visibility::restrictiveness`] to compare.
pub enum Visibility {
    /// Preemptible per the binding rules
    Default = 0,
    /// Not visible outside the module, not even indirectly
    Internal = 1,
    /// Not visible outside the module
    Hidden = 2,
    /// Visible but not preemptible
    Protected = 3,
}

impl Visibility {
    /// Rank in the tightening lattice Default < Protected < Hidden < Internal
    pub fn restrictiveness(self) -> u8 {
        match self {
            Visibility::Default => 0,
            Visibility::Protected => 1,
            Visibility::Hidden => 2,
            Visibility::Internal => 3,
        }
    }

    /// The more restrictive of the two
    pub fn tighten(self, other: Visibility) -> Visibility {
        if other.restrictiveness() > self.restrictiveness() {
            other
        } else {
            self
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Idempotence bitmap for scan-time resource reservation
    pub struct ReservedSlots: u32 {
        /// A dynamic relocation entry was reserved
        const REL = 1;
        /// A GOT slot was reserved
        const GOT = 2;
        /// A PLT entry (with its GOT slot and dyn reloc) was reserved
        const PLT = 4;
    }
}

// Bit layout of the packed attribute word. Binding splits across the
// global/weak bit and the local bit, absolute being both set.
const GLOBAL_OFFSET: u32 = 0;
const DYN_OFFSET: u32 = 1;
const DESC_OFFSET: u32 = 2;
const LOCAL_OFFSET: u32 = 4;
const VISIBILITY_OFFSET: u32 = 5;
const TYPE_OFFSET: u32 = 7;
const RESERVED_OFFSET: u32 = 12;
const EXPORT_DYN_OFFSET: u32 = 16;
const BITCODE_OFFSET: u32 = 17;
const PRESERVE_OFFSET: u32 = 18;
const PATCHABLE_OFFSET: u32 = 20;

const WEAK_MASK: u32 = 1 << GLOBAL_OFFSET;
const DYN_MASK: u32 = 1 << DYN_OFFSET;
const DESC_MASK: u32 = 0x3 << DESC_OFFSET;
const LOCAL_MASK: u32 = 1 << LOCAL_OFFSET;
const VISIBILITY_MASK: u32 = 0x3 << VISIBILITY_OFFSET;
const TYPE_MASK: u32 = 0xF << TYPE_OFFSET;
const RESERVED_MASK: u32 = 0x7 << RESERVED_OFFSET;
const EXPORT_DYN_MASK: u32 = 1 << EXPORT_DYN_OFFSET;
const BITCODE_MASK: u32 = 1 << BITCODE_OFFSET;
const PRESERVE_MASK: u32 = 1 << PRESERVE_OFFSET;
const PATCHABLE_MASK: u32 = 1 << PATCHABLE_OFFSET;

#[derive(Debug, Clone, PartialEq, Eq)]
/// The one-per-name record describing a symbol's current resolved state.
/// Created the first time a name is seen and mutated only through the
/// override operation; attributes live in one packed word.
pub struct ResolveInfo {
    name: String,
    size: u64,
    value: u64,
    bits: u32,
    alias: Option<SymbolId>,
    origin: Option<InputId>,
    out_symbol: Option<LdSymbolId>,
}

impl ResolveInfo {
    /// A fresh record with everything zeroed (an undef global NoType)
    pub fn new(name: impl Into<String>) -> Self {
        ResolveInfo {
            name: name.into(),
            size: 0,
            value: 0,
            bits: 0,
            alias: None,
            origin: None,
            out_symbol: None,
        }
    }

    /// Symbol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Symbol size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Set the symbol size
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Current value. For commons before finalization this is the
    /// strictest alignment seen so far.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Set the value. While a common is still being merged the largest
    /// value (alignment) wins; a final assignment always sticks.
    pub fn set_value(&mut self, value: u64, is_final: bool) {
        if !is_final && self.is_common() {
            if self.value < value {
                self.value = value;
            }
            return;
        }
        self.value = value;
    }

    /// Binding decoded from the packed word
    pub fn binding(&self) -> Binding {
        let local = self.bits & LOCAL_MASK != 0;
        let weak = self.bits & WEAK_MASK != 0;
        match (local, weak) {
            (true, true) => Binding::Absolute,
            (true, false) => Binding::Local,
            (false, true) => Binding::Weak,
            (false, false) => Binding::Global,
        }
    }

    /// Encode a binding into the packed word
    pub fn set_binding(&mut self, binding: Binding) {
        self.bits &= !(WEAK_MASK | LOCAL_MASK);
        match binding {
            Binding::Global => {}
            Binding::Weak => self.bits |= WEAK_MASK,
            Binding::Local => self.bits |= LOCAL_MASK,
            Binding::Absolute => self.bits |= WEAK_MASK | LOCAL_MASK,
        }
    }

    /// Definition state
    pub fn desc(&self) -> Desc {
        Desc::from_u32((self.bits & DESC_MASK) >> DESC_OFFSET).unwrap_or(Desc::Undefined)
    }

    /// Set the definition state
    pub fn set_desc(&mut self, desc: Desc) {
        self.bits = (self.bits & !DESC_MASK) | ((desc as u32) << DESC_OFFSET);
    }

    /// Symbol type
    pub fn sym_type(&self) -> SymType {
        SymType::from_u32((self.bits & TYPE_MASK) >> TYPE_OFFSET).unwrap_or(SymType::NoType)
    }

    /// Set the symbol type
    pub fn set_type(&mut self, ty: SymType) {
        self.bits = (self.bits & !TYPE_MASK) | ((ty as u32) << TYPE_OFFSET);
    }

    /// Visibility
    pub fn visibility(&self) -> Visibility {
        Visibility::from_u32((self.bits & VISIBILITY_MASK) >> VISIBILITY_OFFSET)
            .unwrap_or(Visibility::Default)
    }

    /// Set the visibility
    pub fn set_visibility(&mut self, vis: Visibility) {
        self.bits = (self.bits & !VISIBILITY_MASK) | ((vis as u32) << VISIBILITY_OFFSET);
    }

    /// Did this symbol come from a dynamic object?
    pub fn is_dyn(&self) -> bool {
        self.bits & DYN_MASK != 0
    }

    /// Record whether the source is a dynamic object
    pub fn set_dyn(&mut self, dyn_: bool) {
        if dyn_ {
            self.bits |= DYN_MASK;
        } else {
            self.bits &= !DYN_MASK;
        }
    }

    /// Came from a bitcode input (pre-LTO)
    pub fn is_bitcode(&self) -> bool {
        self.bits & BITCODE_MASK != 0
    }

    /// Record the bitcode flag
    pub fn set_bitcode(&mut self, bc: bool) {
        if bc {
            self.bits |= BITCODE_MASK;
        } else {
            self.bits &= !BITCODE_MASK;
        }
    }

    /// Must survive GC and LTO internalization
    pub fn should_preserve(&self) -> bool {
        self.bits & PRESERVE_MASK != 0
    }

    /// Set the preserve flag
    pub fn set_preserve(&mut self, preserve: bool) {
        if preserve {
            self.bits |= PRESERVE_MASK;
        } else {
            self.bits &= !PRESERVE_MASK;
        }
    }

    /// Marked patchable by the input
    pub fn is_patchable(&self) -> bool {
        self.bits & PATCHABLE_MASK != 0
    }

    /// Set the patchable flag
    pub fn set_patchable(&mut self) {
        self.bits |= PATCHABLE_MASK;
    }

    /// Must be exported into .dynsym
    pub fn export_to_dyn(&self) -> bool {
        self.bits & EXPORT_DYN_MASK != 0
    }

    /// Set or clear the export-to-dynsym flag
    pub fn set_export_to_dyn(&mut self, export: bool) {
        if export {
            self.bits |= EXPORT_DYN_MASK;
        } else {
            self.bits &= !EXPORT_DYN_MASK;
        }
    }

    /// Scan-time reservation bitmap
    pub fn reserved(&self) -> ReservedSlots {
        ReservedSlots::from_bits_truncate((self.bits & RESERVED_MASK) >> RESERVED_OFFSET)
    }

    /// Merge bits into the reservation bitmap
    pub fn reserve(&mut self, slots: ReservedSlots) {
        let merged = self.reserved() | slots;
        self.bits = (self.bits & !RESERVED_MASK) | (merged.bits() << RESERVED_OFFSET);
    }

    /// Alias record, if this symbol aliases another
    pub fn alias(&self) -> Option<SymbolId> {
        self.alias
    }

    /// Record an alias
    pub fn set_alias(&mut self, alias: SymbolId) {
        self.alias = Some(alias);
    }

    /// The input whose candidate currently wins
    pub fn resolved_origin(&self) -> Option<InputId> {
        self.origin
    }

    /// Record the winning input
    pub fn set_resolved_origin(&mut self, input: InputId) {
        self.origin = Some(input);
    }

    /// The concrete symbol that gets emitted for this name
    pub fn out_symbol(&self) -> Option<LdSymbolId> {
        self.out_symbol
    }

    /// Point at the winning concrete symbol
    pub fn set_out_symbol(&mut self, sym: LdSymbolId) {
        self.out_symbol = Some(sym);
    }

    /// Undefined (and not common)?
    pub fn is_undef(&self) -> bool {
        matches!(self.desc(), Desc::Undefined | Desc::Unused)
    }

    /// A definition?
    pub fn is_define(&self) -> bool {
        self.desc() == Desc::Define
    }

    /// A common block?
    pub fn is_common(&self) -> bool {
        self.desc() == Desc::Common
    }

    /// Weak binding?
    pub fn is_weak(&self) -> bool {
        self.binding() == Binding::Weak
    }

    /// Local binding?
    pub fn is_local(&self) -> bool {
        self.binding() == Binding::Local
    }

    /// Weak and undefined
    pub fn is_weak_undef(&self) -> bool {
        self.is_weak() && self.is_undef()
    }

    /// Thread-local?
    pub fn is_thread_local(&self) -> bool {
        self.sym_type() == SymType::ThreadLocal
    }

    /// Hidden or internal visibility
    pub fn is_hidden(&self) -> bool {
        matches!(self.visibility(), Visibility::Hidden | Visibility::Internal)
    }

    /// Function type?
    pub fn is_func(&self) -> bool {
        self.sym_type() == SymType::Function
    }

    /// Copy every attribute of `from` onto this record, the core of an
    /// override. Size, value and flags move; the name and the candidate
    /// sidecar stay.
    pub fn override_from(&mut self, from: &ResolveInfo, take_origin: bool) {
        self.size = from.size;
        self.value = from.value;
        let keep = self.bits & (RESERVED_MASK | EXPORT_DYN_MASK | PRESERVE_MASK);
        self.bits = (from.bits & !(RESERVED_MASK | EXPORT_DYN_MASK | PRESERVE_MASK)) | keep;
        if take_origin {
            self.origin = from.origin;
        }
        self.out_symbol = from.out_symbol;
    }

    /// Render the attributes the way symbol tracing prints them
    pub fn info_as_string(&self) -> String {
        format!(
            "[{:?} {:?} {:?} {:?}{}{}]",
            self.binding(),
            self.desc(),
            self.sym_type(),
            self.visibility(),
            if self.is_dyn() { " Dyn" } else { "" },
            if self.is_bitcode() { " Bitcode" } else { "" },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One concrete symbol occurrence. Many of these may share one
/// `ResolveInfo` after overrides; only the one the info points back at is
/// emitted.
pub struct LdSymbol {
    /// The per-name record this occurrence belongs to
    pub info: SymbolId,
    /// Location of the symbol inside a fragment, or a sentinel
    pub frag_ref: FragmentRef,
    /// Raw `st_shndx` from the input
    pub section_index: u16,
    /// Index of this symbol inside its input's symbol table
    pub symbol_index: usize,
    /// Value (`st_value`) as read, later finalized to an output address
    pub value: u64,
    /// Dropped by GC or COMDAT deduplication
    pub should_ignore: bool,
    /// Defined by a script assignment rather than an input
    pub script_defined: bool,
}

impl LdSymbol {
    /// A symbol occurrence with no location yet
    pub fn new(info: SymbolId, symbol_index: usize) -> Self {
        LdSymbol {
            info,
            frag_ref: FragmentRef::null(),
            section_index: 0,
            symbol_index,
            value: 0,
            should_ignore: false,
            script_defined: false,
        }
    }

    /// Does this occurrence point into a fragment?
    pub fn has_frag_ref(&self) -> bool {
        self.frag_ref.is_real()
    }
}

#[derive(Debug, Clone)]
/// The attributes of an incoming symbol before resolution, as read from
/// an input file
pub struct SymbolAttrs {
    /// Symbol name
    pub name: String,
    /// Binding of the candidate
    pub binding: Binding,
    /// Definition state of the candidate
    pub desc: Desc,
    /// Type of the candidate
    pub sym_type: SymType,
    /// Visibility of the candidate
    pub visibility: Visibility,
    /// Size in bytes
    pub size: u64,
    /// Value (alignment for commons)
    pub value: u64,
    /// From a dynamic object
    pub is_dyn: bool,
    /// From a bitcode input
    pub is_bitcode: bool,
    /// Carries the patchable annotation
    pub is_patchable: bool,
}

impl SymbolAttrs {
    fn build_info(&self, input: InputId) -> ResolveInfo {
        let mut info = ResolveInfo::new(self.name.clone());
        info.set_binding(self.binding);
        info.set_desc(self.desc);
        info.set_type(self.sym_type);
        info.set_visibility(self.visibility);
        info.set_size(self.size);
        info.set_dyn(self.is_dyn);
        info.set_bitcode(self.is_bitcode);
        if self.is_patchable {
            info.set_patchable();
        }
        info.set_resolved_origin(input);
        info.set_value(self.value, false);
        info
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What an insertion did to the pool
pub struct ResolveOutcome {
    /// The surviving per-name record
    pub id: SymbolId,
    /// A record for the name already existed
    pub existent: bool,
    /// The incoming candidate replaced the old state
    pub overridden: bool,
    /// The incoming dyn definition satisfied an undef; the shared object
    /// providing it must be marked needed
    pub marks_dyn_needed: bool,
}

/// Context the resolver needs beyond the pool itself
pub struct ResolveCtx<'a> {
    /// Active configuration (warn-common, tracing)
    pub config: &'a LinkerConfig,
    /// Engine receiving trace and error diagnostics
    pub diag: &'a DiagnosticEngine,
    /// Renders an input id as a user-facing path
    pub path_of: &'a dyn Fn(InputId) -> String,
    /// This insertion happens after the LTO compile step
    pub is_post_lto: bool,
    /// The old symbol's defining section was pruned by GC
    pub old_is_gc_ignored: bool,
}

#[derive(Debug, Default)]
/// The name pool: one `ResolveInfo` per global name, an ordered list of
/// locals, and a sidecar of every candidate seen per name for resolution
/// reports. Owns both symbol arenas.
pub struct NamePool {
    infos: Vec<ResolveInfo>,
    symbols: Vec<LdSymbol>,
    globals: HashMap<String, SymbolId>,
    locals: Vec<SymbolId>,
    candidates: HashMap<String, Vec<LdSymbolId>>,
}

impl NamePool {
    /// An empty pool
    pub fn new() -> Self {
        NamePool::default()
    }

    /// Access a per-name record
    pub fn info(&self, id: SymbolId) -> &ResolveInfo {
        &self.infos[id.index()]
    }

    /// Mutable access to a per-name record
    pub fn info_mut(&mut self, id: SymbolId) -> &mut ResolveInfo {
        &mut self.infos[id.index()]
    }

    /// Access a concrete symbol
    pub fn symbol(&self, id: LdSymbolId) -> &LdSymbol {
        &self.symbols[id.index()]
    }

    /// Mutable access to a concrete symbol
    pub fn symbol_mut(&mut self, id: LdSymbolId) -> &mut LdSymbol {
        &mut self.symbols[id.index()]
    }

    /// Number of per-name records
    pub fn info_count(&self) -> usize {
        self.infos.len()
    }

    /// The ordered local records, in definition order
    pub fn locals(&self) -> &[SymbolId] {
        &self.locals
    }

    /// Iterate the resolved global records
    pub fn globals(&self) -> impl Iterator<Item = (&String, SymbolId)> {
        self.globals.iter().map(|(name, id)| (name, *id))
    }

    /// Find the resolved record for `name`
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.globals.get(name).copied()
    }

    /// Find the winning concrete symbol for `name`
    pub fn find_symbol(&self, name: &str) -> Option<LdSymbolId> {
        self.find(name).and_then(|id| self.info(id).out_symbol())
    }

    /// All candidates recorded for `name`, for resolution reports
    pub fn candidates(&self, name: &str) -> &[LdSymbolId] {
        self.candidates.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Allocate a concrete symbol occurrence
    pub fn add_symbol(&mut self, sym: LdSymbol) -> LdSymbolId {
        let id = LdSymbolId::new(self.symbols.len());
        let name = self.info(sym.info).name().to_string();
        self.symbols.push(sym);
        self.candidates.entry(name).or_default().push(id);
        id
    }

    /// Append a local symbol: locals bypass resolution entirely and each
    /// gets a fresh record, in definition order
    pub fn insert_local(&mut self, attrs: &SymbolAttrs, input: InputId, ctx: &ResolveCtx) -> SymbolId {
        let mut info = attrs.build_info(input);
        info.set_binding(Binding::Local);
        let id = SymbolId::new(self.infos.len());
        if ctx.config.trace_symbol(&attrs.name) {
            ctx.diag.raise(
                DiagKind::AddNewSymbol,
                [
                    attrs.name.clone(),
                    (ctx.path_of)(input),
                    info.info_as_string(),
                ],
            );
        }
        self.infos.push(info);
        self.locals.push(id);
        id
    }

    /// Insert a non-local candidate and resolve it against the pool.
    ///
    /// All candidates with the same name share one `ResolveInfo`; when the
    /// incoming candidate wins, that record is rewritten to its attributes.
    /// The record's value is never finalized here.
    pub fn insert_symbol(
        &mut self,
        attrs: &SymbolAttrs,
        input: InputId,
        ctx: &ResolveCtx,
    ) -> Result<ResolveOutcome> {
        let incoming = attrs.build_info(input);
        let trace = ctx.config.trace_symbol(&attrs.name);
        if trace {
            ctx.diag.raise(
                DiagKind::AddNewSymbol,
                [
                    attrs.name.clone(),
                    (ctx.path_of)(input),
                    incoming.info_as_string(),
                ],
            );
        }

        let existing = self.globals.get(&attrs.name).copied();
        let Some(id) = existing else {
            let id = SymbolId::new(self.infos.len());
            self.infos.push(incoming);
            self.globals.insert(attrs.name.clone(), id);
            return Ok(ResolveOutcome {
                id,
                existent: false,
                overridden: true,
                marks_dyn_needed: false,
            });
        };

        let old = &self.infos[id.index()];
        check_tls_types(old, &incoming, ctx)?;

        // Post-LTO: a native symbol supersedes the bitcode one it was
        // compiled from, and supersedes a native symbol whose defining
        // section GC already pruned. Attributes transfer wholesale.
        let override_by_lto = ctx.is_post_lto
            && !incoming.is_bitcode()
            && (old.is_bitcode()
                || (!old.is_undef() && !old.is_dyn() && !old.is_common() && ctx.old_is_gc_ignored));
        let (overridden, marks_dyn_needed) = if override_by_lto {
            let old = &mut self.infos[id.index()];
            old.override_from(&incoming, true);
            old.set_binding(incoming.binding());
            old.set_bitcode(incoming.is_bitcode());
            (true, false)
        } else {
            resolve(&mut self.infos[id.index()], &incoming, ctx)?
        };

        // Visibility always tightens to the most restrictive of the two.
        let tightened = self.infos[id.index()]
            .visibility()
            .tighten(incoming.visibility());
        self.infos[id.index()].set_visibility(tightened);

        if trace {
            let resolved = &self.infos[id.index()];
            let origin = resolved
                .resolved_origin()
                .map(ctx.path_of)
                .unwrap_or_else(|| "(not applicable)".to_string());
            ctx.diag.raise(
                DiagKind::ResolveNewSymbol,
                [attrs.name.clone(), origin, resolved.info_as_string()],
            );
        }

        Ok(ResolveOutcome {
            id,
            existent: true,
            overridden,
            marks_dyn_needed,
        })
    }
}

/// TLS rule: a ThreadLocal symbol may only resolve against another
/// ThreadLocal one. Rendered like the source linker's message so both
/// sides' origins are visible.
fn check_tls_types(old: &ResolveInfo, new: &ResolveInfo, ctx: &ResolveCtx) -> Result<()> {
    if !old.is_thread_local() && !new.is_thread_local() {
        return Ok(());
    }
    if old.sym_type() == new.sym_type() {
        return Ok(());
    }
    let describe = |info: &ResolveInfo| {
        let tls = if info.is_thread_local() { "TLS" } else { "non-TLS" };
        let what = if info.is_define() || info.is_common() {
            "definition"
        } else {
            "reference"
        };
        let origin = info
            .resolved_origin()
            .map(ctx.path_of)
            .unwrap_or_else(|| "(internal)".to_string());
        format!("{tls} {what} in {origin}")
    };
    let message = format!(
        "{}: {} mismatches {}",
        new.name(),
        describe(new),
        describe(old)
    );
    ctx.diag
        .raise(DiagKind::TlsNonTlsSymbolMismatch, [message.clone()]);
    Err(Error::Resolution {
        symbol: new.name().to_string(),
        reason: message,
    })
}

/// The override lattice of the static resolver:
/// regular-define > common > weak-define > dyn-define > undef-weak > undef.
/// Returns (overridden, marks_dyn_needed).
fn resolve(old: &mut ResolveInfo, new: &ResolveInfo, ctx: &ResolveCtx) -> Result<(bool, bool)> {
    let old_defined = old.is_define() && !old.is_dyn();
    let new_defined = new.is_define() && !new.is_dyn();

    // Two regular strong definitions cannot coexist.
    if old_defined && new_defined && !old.is_weak() && !new.is_weak() {
        let first = old
            .resolved_origin()
            .map(ctx.path_of)
            .unwrap_or_else(|| "(internal)".to_string());
        let second = new
            .resolved_origin()
            .map(ctx.path_of)
            .unwrap_or_else(|| "(internal)".to_string());
        ctx.diag.raise(
            DiagKind::MultipleDefinition,
            [new.name().to_string(), first.clone(), second.clone()],
        );
        return Err(Error::Resolution {
            symbol: new.name().to_string(),
            reason: format!("multiply defined in {first} and {second}"),
        });
    }

    // Strong regular definitions beat everything else.
    if new_defined && !new.is_weak() {
        if old.is_common() && ctx.config.warn_common {
            let common_origin = old
                .resolved_origin()
                .map(ctx.path_of)
                .unwrap_or_else(|| "(internal)".to_string());
            ctx.diag.raise(
                DiagKind::CommonOverriddenByDefine,
                [
                    new.name().to_string(),
                    common_origin,
                    new.resolved_origin()
                        .map(ctx.path_of)
                        .unwrap_or_else(|| "(internal)".to_string()),
                ],
            );
        }
        old.override_from(new, true);
        old.set_binding(new.binding());
        old.set_dyn(false);
        return Ok((true, false));
    }
    if old_defined && !old.is_weak() {
        // Existing strong regular definition stands; an incoming dyn
        // definition only confirms the name is exported.
        return Ok((false, false));
    }

    // Commons: merge by keeping the larger size and the stricter
    // alignment (the value field of a common carries its alignment).
    if old.is_common() && new.is_common() {
        if new.size() > old.size() {
            old.set_size(new.size());
        }
        old.set_value(new.value(), false);
        return Ok((false, false));
    }
    if new.is_common() {
        if old_defined {
            // A define (weak included) beats a common.
            if ctx.config.warn_common {
                ctx.diag.raise(
                    DiagKind::CommonOverriddenByDefine,
                    [
                        new.name().to_string(),
                        new.resolved_origin()
                            .map(ctx.path_of)
                            .unwrap_or_else(|| "(internal)".to_string()),
                        old.resolved_origin()
                            .map(ctx.path_of)
                            .unwrap_or_else(|| "(internal)".to_string()),
                    ],
                );
            }
            return Ok((false, false));
        }
        // Common beats undef and dyn-define.
        old.override_from(new, true);
        old.set_binding(new.binding());
        old.set_dyn(false);
        return Ok((true, false));
    }
    if old.is_common() {
        if new_defined {
            // Weak define still beats common (strong handled above).
            old.override_from(new, true);
            old.set_binding(new.binding());
            old.set_dyn(false);
            return Ok((true, false));
        }
        return Ok((false, false));
    }

    // Weak definitions: first one wins against other weak definitions.
    if old_defined && old.is_weak() {
        if new.is_dyn() || new.is_undef() || (new_defined && new.is_weak()) {
            return Ok((false, false));
        }
    }
    if new_defined {
        // new is a weak define and old is undef or dyn.
        old.override_from(new, true);
        old.set_binding(new.binding());
        old.set_dyn(false);
        return Ok((true, false));
    }

    // Dynamic definitions satisfy undefs without taking the value; the
    // providing shared object becomes needed.
    if new.is_dyn() && new.is_define() {
        if old.is_undef() {
            let was_weak = old.is_weak();
            old.override_from(new, true);
            old.set_dyn(true);
            if was_weak && !new.is_weak() {
                old.set_binding(Binding::Weak);
            } else {
                old.set_binding(new.binding());
            }
            return Ok((true, true));
        }
        // First dyn definition wins over later ones.
        return Ok((false, false));
    }

    // A reference against an already-loaded dynamic definition still
    // makes the providing object needed.
    if old.is_dyn() && old.is_define() && new.is_undef() {
        return Ok((false, true));
    }

    // Both undefined: a strong reference upgrades a weak one.
    if old.is_weak_undef() && new.is_undef() && !new.is_weak() {
        old.set_binding(Binding::Global);
        if old.resolved_origin().is_none() {
            if let Some(origin) = new.resolved_origin() {
                old.set_resolved_origin(origin);
            }
        }
        return Ok((false, false));
    }

    Ok((false, false))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::base::ElfMachine;

    fn config() -> LinkerConfig {
        LinkerConfig::builder().machine(ElfMachine::AArch64).build()
    }

    fn attrs(name: &str, binding: Binding, desc: Desc) -> SymbolAttrs {
        SymbolAttrs {
            name: name.to_string(),
            binding,
            desc,
            sym_type: SymType::Object,
            visibility: Visibility::Default,
            size: 4,
            value: 0,
            is_dyn: false,
            is_bitcode: false,
            is_patchable: false,
        }
    }

    fn path_of(_: InputId) -> String {
        "test.o".to_string()
    }

    fn ctx<'a>(config: &'a LinkerConfig, diag: &'a DiagnosticEngine) -> ResolveCtx<'a> {
        ResolveCtx {
            config,
            diag,
            path_of: &path_of,
            is_post_lto: false,
            old_is_gc_ignored: false,
        }
    }

    #[test]
    fn two_strong_defines_is_multiple_definition() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let a = attrs("x", Binding::Global, Desc::Define);
        pool.insert_symbol(&a, InputId::new(0), &ctx).ok();
        let err = pool.insert_symbol(&a, InputId::new(1), &ctx);
        assert!(err.is_err());
        assert!(diag.contains(DiagKind::MultipleDefinition));
    }

    #[test]
    fn strong_define_beats_weak_in_either_order() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let weak = attrs("w", Binding::Weak, Desc::Define);
        let strong = attrs("w", Binding::Global, Desc::Define);

        let first = pool.insert_symbol(&weak, InputId::new(0), &ctx).ok();
        assert!(first.is_some());
        let out = pool.insert_symbol(&strong, InputId::new(1), &ctx).ok();
        let out = out.expect("resolves");
        assert!(out.overridden);
        assert_eq!(pool.info(out.id).binding(), Binding::Global);

        let mut pool2 = NamePool::new();
        pool2.insert_symbol(&strong, InputId::new(0), &ctx).ok();
        let out2 = pool2.insert_symbol(&weak, InputId::new(1), &ctx).ok();
        let out2 = out2.expect("resolves");
        assert!(!out2.overridden);
        assert_eq!(pool2.info(out2.id).binding(), Binding::Global);
    }

    #[test]
    fn first_weak_define_wins() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let mut w1 = attrs("w", Binding::Weak, Desc::Define);
        w1.size = 8;
        let mut w2 = attrs("w", Binding::Weak, Desc::Define);
        w2.size = 16;
        pool.insert_symbol(&w1, InputId::new(0), &ctx).ok();
        let out = pool.insert_symbol(&w2, InputId::new(1), &ctx).ok();
        let out = out.expect("resolves");
        assert!(!out.overridden);
        assert_eq!(pool.info(out.id).size(), 8);
    }

    #[test]
    fn commons_merge_size_and_alignment() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let mut c1 = attrs("c", Binding::Global, Desc::Common);
        c1.size = 4;
        c1.value = 4;
        let mut c2 = attrs("c", Binding::Global, Desc::Common);
        c2.size = 16;
        c2.value = 8;
        pool.insert_symbol(&c1, InputId::new(0), &ctx).ok();
        let out = pool.insert_symbol(&c2, InputId::new(1), &ctx).ok();
        let out = out.expect("resolves");
        let info = pool.info(out.id);
        assert_eq!(info.size(), 16);
        assert_eq!(info.value(), 8);
        assert!(info.is_common());
    }

    #[test]
    fn define_beats_common_and_warns_when_asked() {
        let mut config = config();
        config.warn_common = true;
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        pool.insert_symbol(&attrs("c", Binding::Global, Desc::Common), InputId::new(0), &ctx)
            .ok();
        let out = pool
            .insert_symbol(&attrs("c", Binding::Global, Desc::Define), InputId::new(1), &ctx)
            .ok();
        assert!(out.expect("resolves").overridden);
        assert!(diag.contains(DiagKind::CommonOverriddenByDefine));
    }

    #[test]
    fn dyn_define_satisfies_undef_and_marks_needed() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        pool.insert_symbol(
            &attrs("f", Binding::Global, Desc::Undefined),
            InputId::new(0),
            &ctx,
        )
        .ok();
        let mut dyn_def = attrs("f", Binding::Global, Desc::Define);
        dyn_def.is_dyn = true;
        let out = pool.insert_symbol(&dyn_def, InputId::new(1), &ctx).ok();
        let out = out.expect("resolves");
        assert!(out.overridden);
        assert!(out.marks_dyn_needed);
        assert!(pool.info(out.id).is_dyn());
    }

    #[test]
    fn regular_define_beats_dyn_define() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let mut dyn_def = attrs("f", Binding::Global, Desc::Define);
        dyn_def.is_dyn = true;
        pool.insert_symbol(&dyn_def, InputId::new(0), &ctx).ok();
        let out = pool
            .insert_symbol(&attrs("f", Binding::Global, Desc::Define), InputId::new(1), &ctx)
            .ok();
        let out = out.expect("resolves");
        assert!(out.overridden);
        assert!(!pool.info(out.id).is_dyn());
    }

    #[test]
    fn tls_mismatch_is_fatal() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let mut tls = attrs("t", Binding::Global, Desc::Define);
        tls.sym_type = SymType::ThreadLocal;
        pool.insert_symbol(&tls, InputId::new(0), &ctx).ok();
        let plain = attrs("t", Binding::Global, Desc::Undefined);
        assert!(pool.insert_symbol(&plain, InputId::new(1), &ctx).is_err());
        assert!(diag.contains(DiagKind::TlsNonTlsSymbolMismatch));
        assert!(diag.has_fatal());
    }

    #[test]
    fn visibility_always_tightens() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let mut hidden_ref = attrs("v", Binding::Global, Desc::Undefined);
        hidden_ref.visibility = Visibility::Hidden;
        pool.insert_symbol(&hidden_ref, InputId::new(0), &ctx).ok();
        let mut def = attrs("v", Binding::Global, Desc::Define);
        def.visibility = Visibility::Default;
        let out = pool.insert_symbol(&def, InputId::new(1), &ctx).ok();
        let out = out.expect("resolves");
        assert_eq!(pool.info(out.id).visibility(), Visibility::Hidden);
    }

    #[test]
    fn post_lto_native_supersedes_bitcode() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let mut bc = attrs("f", Binding::Global, Desc::Define);
        bc.is_bitcode = true;
        {
            let ctx = ctx(&config, &diag);
            pool.insert_symbol(&bc, InputId::new(0), &ctx).ok();
        }
        let post = ResolveCtx {
            config: &config,
            diag: &diag,
            path_of: &path_of,
            is_post_lto: true,
            old_is_gc_ignored: false,
        };
        let native = attrs("f", Binding::Global, Desc::Define);
        let out = pool.insert_symbol(&native, InputId::new(1), &post).ok();
        let out = out.expect("resolves");
        assert!(out.overridden);
        assert!(!pool.info(out.id).is_bitcode());
    }

    #[test]
    fn locals_bypass_the_global_pool() {
        let config = config();
        let diag = DiagnosticEngine::new(false);
        let mut pool = NamePool::new();
        let ctx = ctx(&config, &diag);
        let a = attrs("l", Binding::Local, Desc::Define);
        let one = pool.insert_local(&a, InputId::new(0), &ctx);
        let two = pool.insert_local(&a, InputId::new(0), &ctx);
        assert_ne!(one, two);
        assert_eq!(pool.locals().len(), 2);
        assert!(pool.find("l").is_none());
    }

    #[test]
    fn reserved_bits_are_sticky_and_idempotent() {
        let mut info = ResolveInfo::new("g");
        info.reserve(ReservedSlots::GOT);
        info.reserve(ReservedSlots::GOT);
        assert_eq!(info.reserved(), ReservedSlots::GOT);
        info.reserve(ReservedSlots::PLT);
        assert!(info.reserved().contains(ReservedSlots::GOT | ReservedSlots::PLT));
    }
}
