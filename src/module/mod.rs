//! The module: owner of every arena in the link, the builder facade that
//! parsers and plugins go through, and the driver pipeline

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{backend_for, TargetBackend};
use crate::base::{
    align_up, ElfMachine, FragId, InputId, LdSymbolId, RelocId, SectionFlags, SectionId, SymbolId,
    GRP_COMDAT, SHN_ABS, SHN_COMMON, SHN_UNDEF, SHT_NOBITS, SHT_PROGBITS, STB_GLOBAL,
    STB_GNU_UNIQUE, STB_LOCAL, STB_WEAK, STT_COMMON, STT_FILE, STT_GNU_IFUNC, STT_SECTION,
    STT_TLS,
};
use crate::config::{CodeGenType, LinkerConfig};
use crate::diag::{DiagKind, DiagnosticEngine};
use crate::ehframe::{parse_eh_frame, EhRecordKind};
use crate::error::{Error, Result};
use crate::fragment::{Fragment, FragmentKind, FragmentRef, GotSlotKind, MergeStringPool};
use crate::gotplt::{GotPltAllocator, GotValueKind};
use crate::input::{walk_archive, ArchiveIndex, FileKind, InputFile};
use crate::reader::{read_object, ObjectContents, RawReloc};
use crate::reloc::{
    DynReloc, DynRelocHome, DynTarget, FieldKind, RelocResult, Relocation, ScanAction, ScanOutcome,
    ScanRequest, ScanSymbol,
};
use crate::script::LinkerScript;
use crate::section::{Section, SectionKind, SectionMark};
use crate::segment::Segment;
use crate::stub::{select_prototype, BranchIslandFactory};
use crate::symbol::{
    Binding, Desc, LdSymbol, NamePool, ReservedSlots, ResolveCtx, SymType, SymbolAttrs, Visibility,
};

/// Callbacks a plugin may register. Hooks run at fixed pipeline
/// boundaries; a hook may add sections or symbols and may fail the link,
/// but must not move anything that is already laid out. Plugins are held
/// across the parallel phases, hence the marker bounds.
pub trait LinkerPlugin: Send + Sync {
    /// After all sections exist, before layout
    fn visit_sections(&mut self, module: &mut Module) -> Result<()> {
        let _ = module;
        Ok(())
    }
    /// After symbol resolution closes
    fn visit_symbols(&mut self, module: &mut Module) -> Result<()> {
        let _ = module;
        Ok(())
    }
    /// Immediately before the image is serialized
    fn act_before_writing(&mut self, module: &mut Module) -> Result<()> {
        let _ = module;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct DynamicPlan {
    /// Symbols exported into .dynsym, in emission order (after the null)
    pub dynsym_order: Vec<SymbolId>,
    /// r_sym index per symbol
    pub dynsym_index: HashMap<SymbolId, usize>,
    /// .dynstr content
    pub dynstr: Vec<u8>,
    /// name offset per symbol in .dynstr
    pub name_offset: HashMap<SymbolId, usize>,
    /// DT_NEEDED string offsets
    pub needed_offsets: Vec<usize>,
    /// soname offset if shared-object output
    pub soname_offset: Option<usize>,
    /// interpreter path, when an interpreter is configured
    pub interp: Option<String>,
}

impl DynamicPlan {
    fn intern(&mut self, name: &str) -> usize {
        if self.dynstr.is_empty() {
            self.dynstr.push(0);
        }
        let offset = self.dynstr.len();
        self.dynstr.extend_from_slice(name.as_bytes());
        self.dynstr.push(0);
        offset
    }
}

/// The root of the link. Owns every input file, the name pool, both
/// fragment-graph arenas, the output sections and segments, the backend
/// table, and the synthesized dynamic state. All cross references are
/// typed indices into these arenas.
pub struct Module {
    /// Active configuration
    pub config: LinkerConfig,
    /// Diagnostic engine shared by every phase
    pub diag: DiagnosticEngine,
    /// The target backend table
    pub backend: &'static TargetBackend,
    /// The structured linker script
    pub script: LinkerScript,
    pub(crate) inputs: Vec<InputFile>,
    pub(crate) archives: HashMap<InputId, ArchiveIndex>,
    pub(crate) sections: Vec<Section>,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) pool: NamePool,
    pub(crate) relocs: Vec<Relocation>,
    /// Rewritten effective locations after merge-string dedup
    pub(crate) modified_targets: HashMap<RelocId, FragmentRef>,
    pub(crate) merge_pool: MergeStringPool,
    pub(crate) out_sections: Vec<crate::section::OutputSection>,
    /// Named-output-section index
    pub(crate) out_index: HashMap<String, crate::base::OutSectId>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) gotplt: GotPltAllocator,
    pub(crate) islands: BranchIslandFactory,
    pub(crate) rela_dyn: Vec<DynReloc>,
    pub(crate) rela_plt: Vec<DynReloc>,
    pub(crate) copy_reloc_syms: Vec<SymbolId>,
    pub(crate) has_text_rel: bool,
    pub(crate) failure: AtomicBool,
    /// (input, section index in file) to arena id
    pub(crate) section_of_input: HashMap<(InputId, usize), SectionId>,
    /// symbol-table index to concrete symbol, per input
    pub(crate) symbols_of_input: HashMap<InputId, Vec<LdSymbolId>>,
    /// COMDAT group signatures already kept; later copies drop
    pub(crate) comdat: std::collections::HashSet<String>,
    pub(crate) dynamic: DynamicPlan,
    pub(crate) tls_base: u64,
    pub(crate) tls_size: u64,
    pub(crate) bss_section: SectionId,
    pub(crate) post_lto: bool,
    pub(crate) plugins: Vec<Box<dyn LinkerPlugin>>,
    /// (symbol, place) pairs already reported undefined
    pub(crate) undef_reported: std::sync::Mutex<std::collections::HashSet<(String, u64)>>,
}

impl Module {
    /// Create a module for `config`, wiring the backend and the standard
    /// synthetic sections
    pub fn new(config: LinkerConfig, script: LinkerScript) -> Result<Self> {
        let backend = backend_for(config.machine).ok_or_else(|| Error::Config {
            reason: format!("no backend for machine {:?}", config.machine),
        })?;
        let diag = DiagnosticEngine::new(config.warn_once);
        let word = backend.io.class.word_size() as u64;

        let mut sections = Vec::new();
        let mut push_internal = |s: Section| -> SectionId {
            let id = SectionId::new(sections.len());
            sections.push(s);
            id
        };
        let got = push_internal(Section::internal(
            ".got",
            SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            word,
        ));
        let gotplt = push_internal(Section::internal(
            ".got.plt",
            SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            word,
        ));
        let plt = push_internal(Section::internal(
            ".plt",
            SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            16,
        ));
        let bss = push_internal(Section::internal(
            ".bss",
            SHT_NOBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            word,
        ));

        // Slot 0 of the arenas backs the internal pseudo input.
        let internal_input = InputFile::new("<internal>", FileKind::Internal, Vec::new());

        Ok(Module {
            config,
            diag,
            backend,
            script,
            inputs: vec![internal_input],
            archives: HashMap::new(),
            sections,
            fragments: Vec::new(),
            pool: NamePool::new(),
            relocs: Vec::new(),
            modified_targets: HashMap::new(),
            merge_pool: MergeStringPool::default(),
            out_sections: Vec::new(),
            out_index: HashMap::new(),
            segments: Vec::new(),
            gotplt: GotPltAllocator::new(got, gotplt, plt, word),
            islands: BranchIslandFactory::new(false),
            rela_dyn: Vec::new(),
            rela_plt: Vec::new(),
            copy_reloc_syms: Vec::new(),
            has_text_rel: false,
            failure: AtomicBool::new(false),
            section_of_input: HashMap::new(),
            symbols_of_input: HashMap::new(),
            comdat: std::collections::HashSet::new(),
            dynamic: DynamicPlan::default(),
            tls_base: 0,
            tls_size: 0,
            bss_section: bss,
            post_lto: false,
            plugins: Vec::new(),
            undef_reported: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// The island factory follows the configuration once it is known
    pub fn init_island_factory(&mut self) {
        self.islands = BranchIslandFactory::new(self.config.island_use_addends);
    }

    /// Register a plugin
    pub fn add_plugin(&mut self, plugin: Box<dyn LinkerPlugin>) {
        self.plugins.push(plugin);
    }

    /// Mark the link failed; every phase checks this between work units
    pub fn set_failure(&self) {
        self.failure.store(true, Ordering::SeqCst);
    }

    /// Has any phase recorded a failure?
    pub fn failed(&self) -> bool {
        self.failure.load(Ordering::SeqCst) || self.diag.error_count() > 0
    }

    /// Access the name pool
    pub fn pool(&self) -> &NamePool {
        &self.pool
    }

    /// Access a section record
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    /// Access a fragment
    pub fn fragment(&self, id: FragId) -> &Fragment {
        &self.fragments[id.index()]
    }

    /// Access a relocation
    pub fn reloc(&self, id: RelocId) -> &Relocation {
        &self.relocs[id.index()]
    }

    /// Output sections in layout order
    pub fn output_sections(&self) -> &[crate::section::OutputSection] {
        &self.out_sections
    }

    /// Output segments
    pub fn output_segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Find an output section by name
    pub fn output_section_named(&self, name: &str) -> Option<&crate::section::OutputSection> {
        self.out_index.get(name).map(|id| &self.out_sections[id.index()])
    }

    /// Dynamic relocations headed for `.rela.dyn`
    pub fn rela_dyn(&self) -> &[DynReloc] {
        &self.rela_dyn
    }

    /// Dynamic relocations headed for `.rela.plt`
    pub fn rela_plt(&self) -> &[DynReloc] {
        &self.rela_plt
    }

    /// The builder facade parsers, plugins, and tests construct through
    pub fn builder(&mut self) -> IrBuilder<'_> {
        IrBuilder { module: self }
    }

    /// The branch-island factory state
    pub fn islands(&self) -> &BranchIslandFactory {
        &self.islands
    }

    /// The GOT/PLT allocator state
    pub fn gotplt(&self) -> &GotPltAllocator {
        &self.gotplt
    }

    /// Every section record, input and synthetic alike
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Every relocation record
    pub fn relocs(&self) -> &[Relocation] {
        &self.relocs
    }

    fn path_of(&self, input: InputId) -> String {
        self.inputs
            .get(input.index())
            .map(|f| f.path.clone())
            .unwrap_or_else(|| "<internal>".to_string())
    }

    /// Display path of an input
    pub fn input_path(&self, input: InputId) -> String {
        self.path_of(input)
    }

    pub(crate) fn push_fragment(&mut self, frag: Fragment) -> FragId {
        let owner = frag.owner;
        let id = FragId::new(self.fragments.len());
        self.fragments.push(frag);
        self.sections[owner.index()].fragments.push(id);
        id
    }

    /// A symbol is preemptible when another dynamic object may provide
    /// its definition at load time
    pub fn is_preemptible(&self, id: SymbolId) -> bool {
        let info = self.pool.info(id);
        if info.visibility() != Visibility::Default {
            return false;
        }
        if info.is_local() {
            return false;
        }
        match self.config.codegen {
            CodeGenType::DynObj => true,
            _ => info.is_dyn() || info.is_undef(),
        }
    }

    /// Output virtual address of a fragment location, once layout ran
    pub fn address_of(&self, frag_ref: FragmentRef) -> Option<u64> {
        if !frag_ref.is_real() {
            return None;
        }
        let frag = &self.fragments[frag_ref.frag.index()];
        let section = &self.sections[frag.owner.index()];
        let out = section.output?;
        let out_section = &self.out_sections[out.index()];
        Some(out_section.addr + frag.offset + frag_ref.offset)
    }

    /// Resolved output value of a symbol. TLS symbols yield their offset
    /// inside the TLS template, the form every TLS formula wants.
    pub fn symbol_value(&self, id: SymbolId) -> u64 {
        let info = self.pool.info(id);
        let Some(out) = info.out_symbol() else {
            return info.value();
        };
        let sym = self.pool.symbol(out);
        if sym.frag_ref.is_real() {
            let addr = self.address_of(sym.frag_ref).unwrap_or(0);
            if info.is_thread_local() {
                return addr.saturating_sub(self.tls_base);
            }
            return addr;
        }
        sym.value
    }

    /// Effective patched location of a relocation: the merge-string
    /// redirect when one was recorded, the original target otherwise
    pub fn effective_target(&self, id: RelocId) -> FragmentRef {
        self.modified_targets
            .get(&id)
            .copied()
            .unwrap_or(self.relocs[id.index()].target)
    }

    /// The address of `_GLOBAL_OFFSET_TABLE_`
    pub fn got_base(&self) -> u64 {
        let gotplt = &self.sections[self.gotplt.gotplt_section.index()];
        let section = if gotplt.fragments.is_empty() {
            &self.sections[self.gotplt.got_section.index()]
        } else {
            gotplt
        };
        section
            .output
            .map(|o| self.out_sections[o.index()].addr)
            .unwrap_or(0)
    }

}

/// The facade through which inputs, sections, fragments, symbols and
/// relocations enter the module
pub struct IrBuilder<'m> {
    module: &'m mut Module,
}

impl<'m> IrBuilder<'m> {
    /// The module under construction
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// Register an input file record and return its id
    pub fn add_input(&mut self, file: InputFile) -> InputId {
        let id = InputId::new(self.module.inputs.len());
        self.module.inputs.push(file);
        id
    }

    /// Classify and register bytes from disk; ELF objects and shared
    /// objects are read and integrated immediately, archives are indexed
    /// for lazy member loading.
    pub fn add_file(&mut self, path: &str, bytes: Vec<u8>, force_binary: bool) -> Result<InputId> {
        let file = InputFile::classify(path, bytes, force_binary);
        let kind = file.kind;
        let id = self.add_input(file);
        match kind {
            FileKind::ObjectElf | FileKind::SharedElf => {
                let bytes = self.module.inputs[id.index()].bytes.clone();
                let contents = read_object(path, &bytes, self.module.backend.io)?;
                self.integrate_object(id, &contents, kind == FileKind::SharedElf)?;
            }
            FileKind::ExecutableElf => {
                return Err(Error::input(path, "cannot link against an executable"));
            }
            FileKind::Archive => {
                let bytes = self.module.inputs[id.index()].bytes.clone();
                let index = walk_archive(path, &bytes)?;
                if self.module.config.whole_archive {
                    for m in 0..index.members.len() {
                        self.load_archive_member(id, &index, m)?;
                    }
                }
                self.module.archives.insert(id, index);
            }
            FileKind::SymDef => {
                let text = String::from_utf8_lossy(&self.module.inputs[id.index()].bytes).to_string();
                let entries = crate::input::parse_symdefs(path, &text)?;
                for entry in entries {
                    self.add_absolute_symbol(id, &entry.name, entry.address)?;
                }
            }
            FileKind::Binary => {
                self.integrate_binary(id)?;
            }
            FileKind::Bitcode | FileKind::Script | FileKind::Internal | FileKind::ArchiveMember => {}
        }
        Ok(id)
    }

    /// Wrap raw bytes as one read-only data section with start/end/size
    /// symbols, the `--binary` path
    fn integrate_binary(&mut self, id: InputId) -> Result<()> {
        let bytes = self.module.inputs[id.index()].bytes.clone();
        let path = self.module.path_of(id);
        let stem: String = path
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let section = Section::from_header(
            ".data".to_string(),
            SHT_PROGBITS,
            SectionFlags::ALLOC,
            0,
            1,
            0,
            0,
            bytes.len() as u64,
            0,
            id,
            0,
        );
        let sid = SectionId::new(self.module.sections.len());
        self.module.sections.push(section);
        self.module.section_of_input.insert((id, 0), sid);
        let frag = self.module.push_fragment(Fragment::new(
            sid,
            1,
            FragmentKind::Region { data: bytes.clone() },
        ));
        for (suffix, offset, size) in [
            ("start", 0u64, 0u64),
            ("end", bytes.len() as u64, 0),
            ("size", 0, bytes.len() as u64),
        ] {
            let name = format!("_binary_{stem}_{suffix}");
            let attrs = SymbolAttrs {
                name,
                binding: Binding::Global,
                desc: Desc::Define,
                sym_type: SymType::Object,
                visibility: Visibility::Default,
                size,
                value: offset,
                is_dyn: false,
                is_bitcode: false,
                is_patchable: false,
            };
            let outcome = self.insert_global(&attrs, id)?;
            let sym = LdSymbol {
                info: outcome.id,
                frag_ref: if suffix == "size" {
                    FragmentRef::null()
                } else {
                    FragmentRef::new(frag, offset)
                },
                section_index: 0,
                symbol_index: 0,
                value: if suffix == "size" { size } else { offset },
                should_ignore: false,
                script_defined: false,
            };
            let lid = self.module.pool.add_symbol(sym);
            self.module.pool.info_mut(outcome.id).set_out_symbol(lid);
        }
        Ok(())
    }

    /// Define an absolute symbol (symdef files, script assignments)
    pub fn add_absolute_symbol(&mut self, input: InputId, name: &str, value: u64) -> Result<SymbolId> {
        let attrs = SymbolAttrs {
            name: name.to_string(),
            binding: Binding::Absolute,
            desc: Desc::Define,
            sym_type: SymType::NoType,
            visibility: Visibility::Default,
            size: 0,
            value,
            is_dyn: false,
            is_bitcode: false,
            is_patchable: false,
        };
        let outcome = self.insert_global(&attrs, input)?;
        let mut sym = LdSymbol::new(outcome.id, 0);
        sym.value = value;
        sym.section_index = SHN_ABS;
        let lid = self.module.pool.add_symbol(sym);
        self.module.pool.info_mut(outcome.id).set_out_symbol(lid);
        self.module.pool.info_mut(outcome.id).set_value(value, true);
        Ok(outcome.id)
    }

    fn insert_global(
        &mut self,
        attrs: &SymbolAttrs,
        input: InputId,
    ) -> Result<crate::symbol::ResolveOutcome> {
        let old_ignored = self
            .module
            .pool
            .find(&attrs.name)
            .and_then(|id| self.module.pool.info(id).out_symbol())
            .map(|out| {
                let sym = self.module.pool.symbol(out);
                sym.frag_ref.is_real()
                    && self.module.sections
                        [self.module.fragments[sym.frag_ref.frag.index()].owner.index()]
                    .is_ignore()
            })
            .unwrap_or(false);
        let paths: Vec<String> = self.module.inputs.iter().map(|f| f.path.clone()).collect();
        let path_of = move |id: InputId| {
            paths
                .get(id.index())
                .cloned()
                .unwrap_or_else(|| "<internal>".to_string())
        };
        let ctx = ResolveCtx {
            config: &self.module.config,
            diag: &self.module.diag,
            path_of: &path_of,
            is_post_lto: self.module.post_lto,
            old_is_gc_ignored: old_ignored,
        };
        let outcome = self.module.pool.insert_symbol(attrs, input, &ctx)?;
        if outcome.marks_dyn_needed {
            if let Some(origin) = self.module.pool.info(outcome.id).resolved_origin() {
                if let Some(file) = self.module.inputs.get_mut(origin.index()) {
                    if !file.needed {
                        file.needed = true;
                        self.module.diag.raise(
                            DiagKind::SharedLibraryNeeded,
                            [attrs.name.clone(), file.path.clone()],
                        );
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Fold one parsed object (or shared object) into the arenas:
    /// sections become fragments, symbols resolve through the pool, and
    /// relocation targets bind once all the file's sections are indexed.
    pub fn integrate_object(
        &mut self,
        id: InputId,
        contents: &ObjectContents,
        is_dyn: bool,
    ) -> Result<()> {
        let path = self.module.path_of(id);
        if let Some(machine) = contents.machine {
            if machine != self.module.config.machine && machine != ElfMachine::None {
                return Err(Error::input(
                    &path,
                    format!("machine {machine:?} does not match the link target"),
                ));
            }
        }
        if is_dyn {
            if let Some(soname) = &contents.soname {
                self.module.inputs[id.index()].soname = Some(soname.clone());
            }
        }
        self.module.inputs[id.index()].used = true;

        // Pass 1: section records and fragments.
        let mut local_ids: Vec<SectionId> = Vec::with_capacity(contents.sections.len());
        for (index, raw) in contents.sections.iter().enumerate() {
            let mut section = Section::from_header(
                raw.name.clone(),
                raw.sh_type,
                raw.flags,
                raw.entsize,
                raw.align,
                raw.link,
                raw.info,
                raw.size,
                raw.addr,
                id,
                index,
            );
            let sid = SectionId::new(self.module.sections.len());
            if is_dyn {
                // Shared objects contribute symbols only.
                section.mark = SectionMark::Ignore;
                self.module.sections.push(section);
                local_ids.push(sid);
                self.module.section_of_input.insert((id, index), sid);
                continue;
            }
            self.module.sections.push(section);
            local_ids.push(sid);
            self.module.section_of_input.insert((id, index), sid);
            self.build_fragments(sid, raw.sh_type, &raw.data, raw.size, raw.align, &path)?;
        }

        // Group sections: record member indices and deduplicate COMDAT
        // groups by signature. Only the first group with a signature
        // keeps its members; later copies drop to Ignore.
        for (index, raw) in contents.sections.iter().enumerate() {
            if self.module.sections[local_ids[index].index()].kind != SectionKind::Group {
                continue;
            }
            let io = self.module.backend.io;
            let group_flags = if raw.data.len() >= 4 {
                io.read_word(&raw.data)?
            } else {
                0
            };
            let mut members = Vec::new();
            for chunk in raw.data.chunks_exact(4).skip(1) {
                members.push(io.read_word(chunk)?);
            }
            self.module.sections[local_ids[index].index()].group_members = members.clone();

            if group_flags & GRP_COMDAT == 0 {
                continue;
            }
            let signature = contents
                .symbols
                .get(raw.info as usize)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            if signature.is_empty() {
                continue;
            }
            if !self.module.comdat.insert(signature) {
                for member in members {
                    if let Some(&sid) = local_ids.get(member as usize) {
                        self.module.sections[sid.index()].mark = SectionMark::Ignore;
                    }
                }
            }
        }

        // Pass 2: symbols.
        let mut symbol_ids: Vec<LdSymbolId> = Vec::with_capacity(contents.symbols.len());
        for (symidx, raw) in contents.symbols.iter().enumerate() {
            let lid = self.integrate_symbol(id, symidx, raw, &local_ids, is_dyn)?;
            symbol_ids.push(lid);
        }
        self.module.symbols_of_input.insert(id, symbol_ids);

        // Pass 3: relocation sections bind their targets.
        if !is_dyn {
            for (target_index, entries, is_rela) in &contents.relocs {
                self.integrate_relocs(id, *target_index, entries, *is_rela, &local_ids)?;
            }
        }
        Ok(())
    }

    fn build_fragments(
        &mut self,
        sid: SectionId,
        sh_type: u32,
        data: &[u8],
        size: u64,
        align: u64,
        path: &str,
    ) -> Result<()> {
        let kind = self.module.sections[sid.index()].kind;
        match kind {
            SectionKind::NoBits => {
                let frag = Fragment::new(
                    sid,
                    align.max(1),
                    FragmentKind::Fill { size, pattern: 0 },
                );
                self.module.push_fragment(frag);
            }
            SectionKind::MergeStr => {
                // Split on NULs; every string keeps its terminator.
                let mut start = 0usize;
                for (pos, byte) in data.iter().enumerate() {
                    if *byte == 0 {
                        let bytes = data[start..=pos].to_vec();
                        let frag = Fragment::new(
                            sid,
                            align.max(1),
                            FragmentKind::MergeString {
                                bytes,
                                input_offset: start as u64,
                                live: true,
                            },
                        );
                        self.module.push_fragment(frag);
                        start = pos + 1;
                    }
                }
                if start < data.len() {
                    let frag = Fragment::new(
                        sid,
                        align.max(1),
                        FragmentKind::MergeString {
                            bytes: data[start..].to_vec(),
                            input_offset: start as u64,
                            live: true,
                        },
                    );
                    self.module.push_fragment(frag);
                }
            }
            SectionKind::EhFrame => {
                let io = self.module.backend.io;
                let records = parse_eh_frame(path, data, io)?;
                let mut cie_frag: HashMap<u64, FragId> = HashMap::new();
                for record in records {
                    let bytes = data[record.offset as usize..(record.offset + record.size) as usize]
                        .to_vec();
                    match record.kind {
                        EhRecordKind::Cie => {
                            let frag = self
                                .module
                                .push_fragment(Fragment::new(sid, align.max(1), FragmentKind::Cie { data: bytes }));
                            cie_frag.insert(record.offset, frag);
                        }
                        EhRecordKind::Fde { cie_offset } => {
                            let cie = cie_frag.get(&cie_offset).copied().unwrap_or(FragId::NULL);
                            self.module.push_fragment(Fragment::new(
                                sid,
                                align.max(1),
                                FragmentKind::Fde {
                                    data: bytes,
                                    cie,
                                    live: true,
                                },
                            ));
                        }
                        EhRecordKind::Terminator => {}
                    }
                }
            }
            SectionKind::Regular
            | SectionKind::Exidx
            | SectionKind::Note
            | SectionKind::GnuProperty
            | SectionKind::Debug => {
                if sh_type == SHT_NOBITS {
                    let frag = Fragment::new(sid, align.max(1), FragmentKind::Fill { size, pattern: 0 });
                    self.module.push_fragment(frag);
                } else if !data.is_empty() {
                    let frag = Fragment::new(
                        sid,
                        align.max(1),
                        FragmentKind::Region { data: data.to_vec() },
                    );
                    self.module.push_fragment(frag);
                }
            }
            // Relocation/symtab/strtab/group/dynamic carry no content
            // fragments of their own.
            _ => {}
        }
        Ok(())
    }

    fn frag_ref_at(&self, section: SectionId, offset: u64) -> FragmentRef {
        let record = &self.module.sections[section.index()];
        let mut base = 0u64;
        for frag_id in &record.fragments {
            let frag = &self.module.fragments[frag_id.index()];
            let size = match &frag.kind {
                FragmentKind::MergeString { bytes, .. } => bytes.len() as u64,
                FragmentKind::Fde { data, .. } | FragmentKind::Cie { data } => data.len() as u64,
                _ => frag.size(),
            };
            if offset < base + size || (offset == base && size == 0) {
                return FragmentRef::new(*frag_id, offset - base);
            }
            base += size;
        }
        if let Some(first) = record.fragments.first() {
            return FragmentRef::new(*first, offset);
        }
        FragmentRef::null()
    }

    fn integrate_symbol(
        &mut self,
        id: InputId,
        symidx: usize,
        raw: &crate::reader::RawSymbol,
        local_ids: &[SectionId],
        is_dyn: bool,
    ) -> Result<LdSymbolId> {
        let binding = match raw.bind {
            STB_LOCAL => Binding::Local,
            STB_WEAK => Binding::Weak,
            STB_GLOBAL | STB_GNU_UNIQUE => Binding::Global,
            _ => Binding::Global,
        };
        let desc = match raw.shndx {
            SHN_UNDEF => Desc::Undefined,
            SHN_COMMON => Desc::Common,
            _ => Desc::Define,
        };
        let sym_type = match raw.stype {
            STT_SECTION => SymType::Section,
            STT_FILE => SymType::File,
            STT_TLS => SymType::ThreadLocal,
            STT_GNU_IFUNC => SymType::IndirectFunc,
            STT_COMMON => SymType::CommonBlock,
            1 => SymType::Object,
            2 => SymType::Function,
            _ => SymType::NoType,
        };
        let visibility = match raw.vis {
            1 => Visibility::Internal,
            2 => Visibility::Hidden,
            3 => Visibility::Protected,
            _ => Visibility::Default,
        };
        let name = if sym_type == SymType::Section {
            local_ids
                .get(raw.shndx as usize)
                .map(|sid| self.module.sections[sid.index()].name.clone())
                .unwrap_or_default()
        } else {
            raw.name.clone()
        };
        let attrs = SymbolAttrs {
            name,
            binding: if raw.shndx == SHN_ABS && binding != Binding::Local {
                Binding::Absolute
            } else {
                binding
            },
            desc,
            sym_type,
            visibility,
            size: raw.size,
            value: raw.value,
            is_dyn,
            is_bitcode: false,
            is_patchable: false,
        };

        let mut frag_ref = if desc == Desc::Define
            && raw.shndx != SHN_ABS
            && !is_dyn
            && (raw.shndx as usize) < local_ids.len()
        {
            self.frag_ref_at(local_ids[raw.shndx as usize], raw.value)
        } else {
            FragmentRef::null()
        };

        // A definition in a dropped COMDAT copy degrades to a reference
        // against the kept copy instead of colliding with it.
        let mut attrs = attrs;
        let in_dropped_group = frag_ref.is_real()
            && self.module.sections
                [self.module.fragments[frag_ref.frag.index()].owner.index()]
            .is_dropped();
        if in_dropped_group {
            attrs.desc = Desc::Undefined;
            frag_ref = FragmentRef::discard();
        }

        let info_id = if binding == Binding::Local {
            let paths: Vec<String> = self.module.inputs.iter().map(|f| f.path.clone()).collect();
            let path_of = move |pid: InputId| {
                paths
                    .get(pid.index())
                    .cloned()
                    .unwrap_or_else(|| "<internal>".to_string())
            };
            let ctx = ResolveCtx {
                config: &self.module.config,
                diag: &self.module.diag,
                path_of: &path_of,
                is_post_lto: self.module.post_lto,
                old_is_gc_ignored: false,
            };
            self.module.pool.insert_local(&attrs, id, &ctx)
        } else {
            let outcome = self.insert_global(&attrs, id)?;
            outcome.id
        };

        let mut sym = LdSymbol::new(info_id, symidx);
        sym.frag_ref = frag_ref;
        sym.section_index = raw.shndx;
        sym.value = raw.value;
        sym.should_ignore = in_dropped_group;
        let lid = self.module.pool.add_symbol(sym);

        // The winner's concrete symbol follows the resolved record.
        let info = self.module.pool.info(info_id);
        let resolved_here = info.resolved_origin() == Some(id);
        let take = info.out_symbol().is_none()
            || (resolved_here && (info.is_define() || info.is_common()));
        if take {
            self.module.pool.info_mut(info_id).set_out_symbol(lid);
        }
        Ok(lid)
    }

    fn integrate_relocs(
        &mut self,
        id: InputId,
        target_index: usize,
        entries: &[RawReloc],
        is_rela: bool,
        local_ids: &[SectionId],
    ) -> Result<()> {
        let Some(&target_sid) = local_ids.get(target_index) else {
            return Ok(());
        };
        let symbols = self
            .module
            .symbols_of_input
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let owner = Section::internal(
            &format!(
                "{}{}",
                if is_rela { ".rela" } else { ".rel" },
                self.module.sections[target_sid.index()].name
            ),
            if is_rela { crate::base::SHT_RELA } else { crate::base::SHT_REL },
            SectionFlags::empty(),
            self.module.backend.io.class.word_size() as u64,
        );
        let owner_id = SectionId::new(self.module.sections.len());
        self.module.sections.push(owner);
        self.module.sections[owner_id.index()].patches = Some(target_sid);

        for raw in entries {
            let mut rtype = raw.rtype;
            // TARGET1/TARGET2 become concrete before anything scans them.
            if self.module.config.machine == ElfMachine::Arm {
                if rtype == crate::arch::arm32::R_ARM_TARGET1 {
                    rtype = crate::arch::arm32::R_ARM_ABS32;
                } else if rtype == crate::arch::arm32::R_ARM_TARGET2 {
                    rtype = crate::arch::arm32::resolve_target2(self.module.config.target2);
                }
            }
            let target = self.frag_ref_at(target_sid, raw.offset);
            let symbol = symbols
                .get(raw.symidx as usize)
                .map(|lid| self.module.pool.symbol(*lid).info);
            let mut addend = raw.addend;
            if !is_rela {
                addend = self.read_implicit_addend(rtype, target);
            }
            let mut reloc = Relocation::new(rtype, target, symbol, addend);
            reloc.owner = owner_id;
            let rid = RelocId::new(self.module.relocs.len());
            self.module.relocs.push(reloc);
            self.module.sections[owner_id.index()].relocs.push(rid);
        }
        Ok(())
    }

    /// REL-format inputs carry the addend in the patched field
    fn read_implicit_addend(&self, rtype: u32, target: FragmentRef) -> i64 {
        if !target.is_real() {
            return 0;
        }
        let Some(entry) = (self.module.backend.entry_of)(rtype) else {
            return 0;
        };
        let frag = &self.module.fragments[target.frag.index()];
        let Some(data) = frag.data() else { return 0 };
        let at = target.offset as usize;
        let io = self.module.backend.io;
        let word = match data.get(at..) {
            Some(tail) if tail.len() >= 4 => io.read_word(tail).unwrap_or(0),
            _ => return 0,
        };
        match entry.kind {
            // imm24 sign-extended and scaled back to bytes.
            FieldKind::ArmBranch24 => i64::from((word & 0x00ff_ffff) as i32) << 40 >> 38,
            FieldKind::Data => i64::from(word as i32),
            _ => 0,
        }
    }

    /// Load one archive member by index and integrate it
    pub fn load_archive_member(
        &mut self,
        archive: InputId,
        index: &ArchiveIndex,
        member_idx: usize,
    ) -> Result<InputId> {
        let member = &index.members[member_idx];
        let member_path = format!("{}({})", self.module.path_of(archive), member.name);
        let bytes = if let Some((start, end)) = member.range {
            self.module.inputs[archive.index()].bytes[start..end].to_vec()
        } else if let Some(thin) = &member.thin_path {
            std::fs::read(thin).map_err(|e| Error::io(thin.clone(), e))?
        } else {
            return Err(Error::input(&member_path, "member has neither bytes nor path"));
        };
        let mut file = InputFile::member(
            member_path.clone(),
            crate::input::classify_bytes(&bytes),
            archive,
            member.range.unwrap_or((0, 0)),
        );
        file.bytes = bytes;
        let kind = file.kind;
        let id = self.add_input(file);
        if kind == FileKind::ObjectElf {
            let bytes = self.module.inputs[id.index()].bytes.clone();
            let contents = read_object(&member_path, &bytes, self.module.backend.io)?;
            self.integrate_object(id, &contents, false)?;
        }
        self.module.inputs[archive.index()].used = true;
        Ok(id)
    }
}

impl Module {
    /// Lazy archive resolution: as long as some global stays undefined
    /// and some archive defines it, pull that member in. Deterministic
    /// because archives are consulted in command-line order.
    pub fn resolve_archives(&mut self) -> Result<()> {
        loop {
            let mut wanted: Option<(InputId, usize)> = None;
            'outer: for (archive_id, index) in {
                let mut ids: Vec<_> = self.archives.iter().map(|(k, v)| (*k, v.clone())).collect();
                ids.sort_by_key(|(k, _)| k.index());
                ids
            } {
                for (name, member) in &index.defines {
                    let Some(sym) = self.pool.find(name) else { continue };
                    if self.pool.info(sym).is_undef() && !self.pool.info(sym).is_dyn() {
                        // Already loaded members never re-enter.
                        let member_path =
                            format!("{}({})", self.path_of(archive_id), index.members[*member].name);
                        if self.inputs.iter().any(|f| f.path == member_path) {
                            continue;
                        }
                        wanted = Some((archive_id, *member));
                        break 'outer;
                    }
                }
            }
            let Some((archive_id, member_idx)) = wanted else {
                return Ok(());
            };
            let index = self.archives[&archive_id].clone();
            self.builder().load_archive_member(archive_id, &index, member_idx)?;
        }
    }

    /// Define the target's standard symbols before relocation scanning
    pub fn init_standard_symbols(&mut self) -> Result<()> {
        let internal = InputId::new(0);
        let entry_name = self
            .config
            .entry
            .clone()
            .unwrap_or_else(|| self.backend.entry_symbol.to_string());
        // The entry symbol is a GC root even if nothing references it;
        // an undef here just stays undef until inputs provide it.
        if self.pool.find(&entry_name).is_none() {
            let attrs = SymbolAttrs {
                name: entry_name,
                binding: Binding::Global,
                desc: Desc::Undefined,
                sym_type: SymType::NoType,
                visibility: Visibility::Default,
                size: 0,
                value: 0,
                is_dyn: false,
                is_bitcode: false,
                is_patchable: false,
            };
            self.builder().insert_global(&attrs, internal)?;
        }
        for forced in self.config.forced_undefined.clone() {
            if self.pool.find(&forced).is_none() {
                let attrs = SymbolAttrs {
                    name: forced,
                    binding: Binding::Global,
                    desc: Desc::Undefined,
                    sym_type: SymType::NoType,
                    visibility: Visibility::Default,
                    size: 0,
                    value: 0,
                    is_dyn: false,
                    is_bitcode: false,
                    is_patchable: false,
                };
                self.builder().insert_global(&attrs, internal)?;
            }
        }
        // _GLOBAL_OFFSET_TABLE_ and (for ARM) the exidx bounds get real
        // values once addresses are assigned.
        for name in ["_GLOBAL_OFFSET_TABLE_", "_DYNAMIC"] {
            if self.pool.find(name).is_none() {
                self.builder().add_absolute_symbol(internal, name, 0)?;
                if let Some(id) = self.pool.find(name) {
                    self.pool.info_mut(id).set_visibility(Visibility::Hidden);
                }
            }
        }
        if self.config.machine == ElfMachine::Arm {
            for name in ["__exidx_start", "__exidx_end"] {
                if self.pool.find(name).is_none() {
                    self.builder().add_absolute_symbol(internal, name, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Convert surviving commons into `.bss` fragments so layout can
    /// place them; the merged value field carried the alignment.
    pub fn allocate_commons(&mut self) {
        let commons: Vec<SymbolId> = self
            .pool
            .globals()
            .map(|(_, id)| id)
            .filter(|id| self.pool.info(*id).is_common())
            .collect();
        let mut ordered = commons;
        ordered.sort_by_key(|id| id.index());
        for id in ordered {
            let (size, align) = {
                let info = self.pool.info(id);
                (info.size().max(1), info.value().max(1))
            };
            let frag = self.push_fragment(Fragment::new(
                self.bss_section,
                align,
                FragmentKind::Fill { size, pattern: 0 },
            ));
            let lid = {
                let mut sym = LdSymbol::new(id, 0);
                sym.frag_ref = FragmentRef::new(frag, 0);
                self.pool.add_symbol(sym)
            };
            let info = self.pool.info_mut(id);
            info.set_desc(Desc::Define);
            info.set_out_symbol(lid);
        }
    }

    /// Allocate `.bss` homes for copy-relocated symbols and emit their
    /// COPY entries. The symbol's resolved value becomes the slot.
    pub fn allocate_copy_relocs(&mut self) {
        let syms = std::mem::take(&mut self.copy_reloc_syms);
        for id in syms {
            if self
                .rela_dyn
                .iter()
                .any(|r| r.rtype == self.backend.dyn_relocs.copy && r.symbol == Some(id))
            {
                continue;
            }
            let (size, align) = {
                let info = self.pool.info(id);
                (info.size().max(1), 8)
            };
            let frag = self.push_fragment(Fragment::new(
                self.bss_section,
                align,
                FragmentKind::Fill { size, pattern: 0 },
            ));
            let lid = {
                let mut sym = LdSymbol::new(id, 0);
                sym.frag_ref = FragmentRef::new(frag, 0);
                self.pool.add_symbol(sym)
            };
            {
                let info = self.pool.info_mut(id);
                info.set_desc(Desc::Define);
                info.set_dyn(false);
                info.set_out_symbol(lid);
                info.set_export_to_dyn(true);
            }
            self.rela_dyn.push(DynReloc {
                rtype: self.backend.dyn_relocs.copy,
                symbol: Some(id),
                at: DynTarget::InPlace(FragmentRef::new(frag, 0)),
                addend: 0,
            });
        }
    }

    fn scan_symbol_snapshot(&self, id: Option<SymbolId>) -> ScanSymbol {
        let Some(sym) = id else {
            return ScanSymbol {
                id: None,
                is_local: true,
                is_weak_undef: false,
                is_undef: false,
                is_dyn: false,
                is_hidden: false,
                is_func: false,
                is_ifunc: false,
                is_tls: false,
                preemptible: false,
                reserved: ReservedSlots::empty(),
            };
        };
        let info = self.pool.info(sym);
        ScanSymbol {
            id,
            is_local: info.is_local() || info.sym_type() == SymType::Section,
            is_weak_undef: info.is_weak_undef(),
            is_undef: info.is_undef(),
            is_dyn: info.is_dyn(),
            is_hidden: info.is_hidden(),
            is_func: info.is_func(),
            is_ifunc: info.sym_type() == SymType::IndirectFunc,
            is_tls: info.is_thread_local(),
            preemptible: self.is_preemptible(sym),
            reserved: info.reserved(),
        }
    }

    fn issue_undef_ref(&self, rid: RelocId) {
        let reloc = &self.relocs[rid.index()];
        let Some(sym) = reloc.symbol else { return };
        let info = self.pool.info(sym);
        if !info.is_undef() || info.is_dyn() || info.is_weak() {
            return;
        }
        let owner = &self.sections[reloc.owner.index()];
        let patched = owner
            .patches
            .map(|sid| self.sections[sid.index()].clone());
        let (section_name, input) = patched
            .as_ref()
            .map(|s| (s.name.clone(), s.input))
            .unwrap_or_else(|| ("?".to_string(), InputId::new(0)));
        let key = (info.name().to_string(), reloc.target.offset);
        {
            let Ok(mut seen) = self.undef_reported.lock() else {
                return;
            };
            if !seen.insert(key) {
                return;
            }
        }
        if info.visibility() != Visibility::Default {
            self.diag.raise(
                DiagKind::InvisibleReference,
                [
                    info.name().to_string(),
                    format!("{:?}", info.visibility()).to_lowercase(),
                    self.path_of(input),
                ],
            );
        }
        // When the reference sits inside a function, say which one: scan
        // the symbol table for a function covering the place.
        let mut candidates: Vec<SymbolId> = self.pool.locals().to_vec();
        candidates.extend(self.pool.globals().map(|(_, id)| id));
        let enclosing = patched.as_ref().and_then(|s| {
            let first = s.fragments.first()?;
            candidates.iter().find_map(|cand| {
                let info = self.pool.info(*cand);
                if !info.is_func() {
                    return None;
                }
                let out = info.out_symbol()?;
                let sym = self.pool.symbol(out);
                if sym.frag_ref.frag != *first {
                    return None;
                }
                let start = sym.frag_ref.offset;
                let end = start + info.size();
                if reloc.target.offset >= start && reloc.target.offset < end {
                    Some(info.name().to_string())
                } else {
                    None
                }
            })
        });
        match enclosing {
            Some(func) => self.diag.raise(
                DiagKind::UndefinedReferenceInFunction,
                [
                    info.name().to_string(),
                    self.path_of(input),
                    section_name,
                    func,
                ],
            ),
            None => self.diag.raise(
                DiagKind::UndefinedReference,
                [
                    info.name().to_string(),
                    self.path_of(input),
                    section_name,
                    format!("{:#x}", reloc.target.offset),
                ],
            ),
        }
    }

    /// Scan every relocation, in parallel across relocation sections,
    /// and execute the merged action streams. Partial links skip this
    /// entirely; their relocations are re-emitted, not resolved.
    pub fn scan_relocations(&mut self) -> Result<()> {
        if self.config.is_partial() {
            return Ok(());
        }
        let reloc_sections: Vec<SectionId> = (0..self.sections.len())
            .map(SectionId::new)
            .filter(|sid| {
                !self.sections[sid.index()].relocs.is_empty()
                    && self.sections[sid.index()].patches.is_some()
            })
            .collect();

        let outcomes: Vec<ScanOutcome> = par_map(&reloc_sections, |sid| {
            let mut out = ScanOutcome::default();
            if self.failure.load(Ordering::SeqCst) {
                return out;
            }
            let owner = &self.sections[sid.index()];
            let Some(patched_sid) = owner.patches else {
                return out;
            };
            let patched = &self.sections[patched_sid.index()];
            let input_path = self.path_of(patched.input);
            for rid in &owner.relocs {
                let reloc = &self.relocs[rid.index()];
                let sym_name = reloc
                    .symbol
                    .map(|s| self.pool.info(s).name().to_string())
                    .unwrap_or_default();
                if self.config.trace_reloc(&self.backend.reloc_name(reloc.rtype)) {
                    self.diag.raise(
                        DiagKind::TraceReloc,
                        [
                            self.backend.reloc_name(reloc.rtype),
                            sym_name.clone(),
                            input_path.clone(),
                        ],
                    );
                }
                self.issue_undef_ref(*rid);
                let origin_path = reloc
                    .symbol
                    .and_then(|s| self.pool.info(s).resolved_origin())
                    .map(|o| self.path_of(o))
                    .unwrap_or_default();
                let request = ScanRequest {
                    rtype: reloc.rtype,
                    addend: reloc.addend,
                    place: reloc.target,
                    sym: self.scan_symbol_snapshot(reloc.symbol),
                    sym_name: &sym_name,
                    input_path: &input_path,
                    origin_path: &origin_path,
                    config: &self.config,
                    section_alloc: patched.is_alloc(),
                    section_writable: patched.flags.contains(SectionFlags::WRITE),
                };
                (self.backend.scan)(&request, &mut out);
            }
            out
        });

        let mut merged = ScanOutcome::default();
        for outcome in outcomes {
            merged.merge(outcome);
        }
        self.execute_scan_actions(merged)
    }

    /// Execute an action stream under the reservation bitmap so replays
    /// are idempotent
    pub fn execute_scan_actions(&mut self, outcome: ScanOutcome) -> Result<()> {
        for action in outcome.actions {
            match action {
                ScanAction::ReserveGot {
                    symbol,
                    kind,
                    holds_symbol_value,
                } => {
                    let value = if holds_symbol_value {
                        match kind {
                            GotSlotKind::TlsIe => GotValueKind::TlsStaticOffset,
                            GotSlotKind::TlsGd | GotSlotKind::TlsLd => GotValueKind::TlsModuleId,
                            _ => GotValueKind::SymbolValue,
                        }
                    } else {
                        GotValueKind::Zero
                    };
                    let (_, _created) = self.gotplt.reserve_got(
                        &mut self.fragments,
                        &mut self.sections,
                        symbol,
                        kind,
                        value,
                    );
                    self.pool.info_mut(symbol).reserve(ReservedSlots::GOT);
                }
                ScanAction::ReservePlt { symbol, irelative } => {
                    if self.pool.info(symbol).reserved().contains(ReservedSlots::PLT) {
                        continue;
                    }
                    let templates = self.backend.plt.clone();
                    let (_, created) = self.gotplt.reserve_plt(
                        &mut self.fragments,
                        &mut self.sections,
                        symbol,
                        irelative,
                        &templates,
                    );
                    if created {
                        let rtype = if irelative {
                            self.backend.dyn_relocs.irelative
                        } else {
                            self.backend.dyn_relocs.jump_slot
                        };
                        self.rela_plt.push(DynReloc {
                            rtype,
                            symbol: if irelative { None } else { Some(symbol) },
                            at: DynTarget::GotSlot {
                                symbol,
                                kind: GotSlotKind::GotPltN,
                                word: 0,
                            },
                            addend: 0,
                        });
                    }
                    self.pool.info_mut(symbol).reserve(ReservedSlots::PLT);
                }
                ScanAction::EmitDynReloc {
                    home,
                    reloc,
                    reserve_rel_for,
                } => {
                    if let Some(sym) = reserve_rel_for {
                        let info = self.pool.info(sym);
                        if info.reserved().contains(ReservedSlots::REL)
                            && matches!(reloc.at, DynTarget::GotSlot { .. })
                        {
                            continue;
                        }
                    }
                    let list = match home {
                        DynRelocHome::Dyn => &mut self.rela_dyn,
                        DynRelocHome::Plt => &mut self.rela_plt,
                    };
                    if list.contains(&reloc) {
                        continue;
                    }
                    list.push(reloc);
                    if let Some(sym) = reserve_rel_for {
                        self.pool.info_mut(sym).reserve(ReservedSlots::REL);
                    }
                    if let Some(sym) = reloc.symbol {
                        self.pool.info_mut(sym).set_export_to_dyn(true);
                    }
                }
                ScanAction::CopyReloc { symbol } => {
                    if !self.copy_reloc_syms.contains(&symbol) {
                        self.copy_reloc_syms.push(symbol);
                    }
                }
                ScanAction::MarkTextRel => {
                    if !self.config.no_text_rel {
                        self.has_text_rel = true;
                    }
                }
                ScanAction::Report { kind, args } => {
                    self.diag.raise(kind, args);
                }
            }
            if self.diag.has_fatal() {
                self.set_failure();
                return Err(Error::Aborted {
                    errors: self.diag.error_count(),
                });
            }
        }
        Ok(())
    }

    /// Decide what goes into `.dynsym`/`.dynstr` and size the dynamic
    /// sections before layout fixes addresses
    pub fn prepare_dynamic(&mut self) {
        let needs_dynamic = self.config.codegen == CodeGenType::DynObj
            || self.inputs.iter().any(|f| f.needed)
            || !self.rela_plt.is_empty()
            || self
                .rela_dyn
                .iter()
                .any(|r| r.symbol.is_some());
        if !needs_dynamic || self.config.is_partial() {
            return;
        }
        let mut order: Vec<SymbolId> = Vec::new();
        let mut globals: Vec<(String, SymbolId)> = self
            .pool
            .globals()
            .map(|(n, id)| (n.clone(), id))
            .collect();
        globals.sort_by_key(|(_, id)| id.index());
        for (_, id) in globals {
            let info = self.pool.info(id);
            let wanted = info.export_to_dyn()
                || (info.is_dyn() && !info.is_undef())
                || (self.config.codegen == CodeGenType::DynObj
                    && info.is_define()
                    && !info.is_hidden());
            if wanted {
                order.push(id);
            }
        }
        for (position, id) in order.iter().enumerate() {
            let name = self.pool.info(*id).name().to_string();
            let offset = self.dynamic.intern(&name);
            self.dynamic.name_offset.insert(*id, offset);
            self.dynamic.dynsym_index.insert(*id, position + 1);
        }
        self.dynamic.dynsym_order = order;

        let needed: Vec<String> = self
            .inputs
            .iter()
            .filter(|f| f.needed)
            .map(|f| f.soname.clone().unwrap_or_else(|| f.path.clone()))
            .collect();
        for name in needed {
            let offset = self.dynamic.intern(&name);
            self.dynamic.needed_offsets.push(offset);
        }
        if let Some(soname) = self.config.soname.clone() {
            self.dynamic.soname_offset = Some(self.dynamic.intern(&soname));
        }
        if self.config.codegen == CodeGenType::Exec {
            self.dynamic.interp = Some(
                self.config
                    .dynamic_linker
                    .clone()
                    .unwrap_or_else(|| self.backend.dynamic_linker.to_string()),
            );
        }
    }

    /// Stamp final addresses into PLT entries and define
    /// `_GLOBAL_OFFSET_TABLE_`/`_DYNAMIC` now that layout fixed them
    pub fn finalize_synthetic_values(&mut self) {
        let got_base = self.got_base();
        if let Some(id) = self.pool.find("_GLOBAL_OFFSET_TABLE_") {
            if let Some(out) = self.pool.info(id).out_symbol() {
                self.pool.symbol_mut(out).value = got_base;
            }
            self.pool.info_mut(id).set_value(got_base, true);
        }
        if let Some(dynamic_out) = self.output_section_named(".dynamic").map(|o| o.addr) {
            if let Some(id) = self.pool.find("_DYNAMIC") {
                if let Some(out) = self.pool.info(id).out_symbol() {
                    self.pool.symbol_mut(out).value = dynamic_out;
                }
                self.pool.info_mut(id).set_value(dynamic_out, true);
            }
        }
        if self.config.machine == ElfMachine::Arm {
            let (start, end) = self
                .output_section_named(".ARM.exidx")
                .map(|o| (o.addr, o.addr + o.size))
                .unwrap_or((0, 0));
            for (name, value) in [("__exidx_start", start), ("__exidx_end", end)] {
                if let Some(id) = self.pool.find(name) {
                    if let Some(out) = self.pool.info(id).out_symbol() {
                        self.pool.symbol_mut(out).value = value;
                    }
                    self.pool.info_mut(id).set_value(value, true);
                }
            }
        }

        // TLS bounds for LE/IE math.
        let mut tls_start = u64::MAX;
        let mut tls_end = 0u64;
        for out in &self.out_sections {
            if out.flags.contains(SectionFlags::TLS) {
                tls_start = tls_start.min(out.addr);
                tls_end = tls_end.max(out.addr + out.size);
            }
        }
        if tls_start != u64::MAX {
            self.tls_base = tls_start;
            self.tls_size = align_up(tls_end - tls_start, self.backend.page_size.min(64));
        }

        // PLT entry bytes.
        let plt0_addr = self
            .gotplt
            .plt0()
            .and_then(|f| self.address_of(FragmentRef::new(f, 0)))
            .unwrap_or(0);
        let gotplt0_addr = self
            .sections[self.gotplt.gotplt_section.index()]
            .fragments
            .first()
            .and_then(|f| self.address_of(FragmentRef::new(*f, 0)))
            .unwrap_or(0);
        let io = self.backend.io;
        if let Some(plt0) = self.gotplt.plt0() {
            let addr = plt0_addr;
            if let Some(data) = self.fragments[plt0.index()].data_mut() {
                (self.backend.patch_plt0)(data, io, addr, gotplt0_addr);
            }
        }
        let entries: Vec<(SymbolId, FragId)> = self.gotplt.plt_entries().collect();
        for (symbol, frag) in entries {
            let entry_addr = self
                .address_of(FragmentRef::new(frag, 0))
                .unwrap_or(0);
            let slot_addr = self
                .gotplt
                .got_slot(symbol, GotSlotKind::GotPltN)
                .and_then(|s| self.address_of(FragmentRef::new(s, 0)))
                .unwrap_or(0);
            if let Some(data) = self.fragments[frag.index()].data_mut() {
                (self.backend.patch_pltn)(data, io, entry_addr, slot_addr, plt0_addr);
            }
        }
    }

    /// Define a core-synthesized local symbol at a fragment location
    pub(crate) fn define_internal_local(
        &mut self,
        name: &str,
        frag_ref: FragmentRef,
        size: u64,
    ) -> SymbolId {
        let attrs = SymbolAttrs {
            name: name.to_string(),
            binding: Binding::Local,
            desc: Desc::Define,
            sym_type: SymType::Function,
            visibility: Visibility::Default,
            size,
            value: 0,
            is_dyn: false,
            is_bitcode: false,
            is_patchable: false,
        };
        let paths: Vec<String> = self.inputs.iter().map(|f| f.path.clone()).collect();
        let path_of = move |pid: InputId| {
            paths
                .get(pid.index())
                .cloned()
                .unwrap_or_else(|| "<internal>".to_string())
        };
        let info = {
            let ctx = ResolveCtx {
                config: &self.config,
                diag: &self.diag,
                path_of: &path_of,
                is_post_lto: self.post_lto,
                old_is_gc_ignored: false,
            };
            self.pool.insert_local(&attrs, InputId::new(0), &ctx)
        };
        let lid = {
            let mut sym = LdSymbol::new(info, 0);
            sym.frag_ref = frag_ref;
            self.pool.add_symbol(sym)
        };
        self.pool.info_mut(info).set_out_symbol(lid);
        info
    }

    /// Insert the copy-and-branch-back islands for 843419 hits: the
    /// offending load/store moves into the island, the original word
    /// becomes a branch out, and references to the moved instruction
    /// are redirected to its copy.
    pub fn insert_erratum_islands(&mut self, hits: Vec<(FragId, u64)>) -> usize {
        let io = self.backend.io;
        let mut inserted = 0usize;
        for (frag_id, offset) in hits {
            let owner = self.fragments[frag_id.index()].owner;
            let Some(insn) = self.fragments[frag_id.index()]
                .data()
                .and_then(|d| d.get(offset as usize..))
                .and_then(|t| io.read_word(t).ok())
            else {
                continue;
            };

            // Redirect incoming references before the fix relocations
            // exist, so the fix itself is not rewritten.
            let redirects: Vec<RelocId> = (0..self.relocs.len())
                .map(RelocId::new)
                .filter(|rid| {
                    let t = self.effective_target(*rid);
                    t.frag == frag_id && t.offset == offset
                })
                .collect();

            let mut body = Vec::with_capacity(8);
            io.write_word(&mut body, insn);
            io.write_word(&mut body, 0x1400_0000); // b back, encoded at apply
            let stub = self.push_fragment(Fragment::new(
                owner,
                4,
                FragmentKind::Stub {
                    data: body,
                    prototype: 0,
                },
            ));

            let island_sym = self.define_internal_local(
                &format!("__erratum_843419_fix_{inserted}"),
                FragmentRef::new(stub, 0),
                8,
            );
            let return_sym = self.define_internal_local(
                &format!("__erratum_843419_ret_{inserted}"),
                FragmentRef::new(frag_id, offset + 4),
                0,
            );

            let fixup_owner = SectionId::new(self.sections.len());
            self.sections.push(Section::internal(
                ".rela.erratum",
                crate::base::SHT_RELA,
                SectionFlags::empty(),
                8,
            ));
            for (place, target) in [
                (FragmentRef::new(stub, 4), return_sym),
                (FragmentRef::new(frag_id, offset), island_sym),
            ] {
                let mut reloc = Relocation::new(
                    crate::arch::aarch64::R_AARCH64_JUMP26,
                    place,
                    Some(target),
                    0,
                );
                reloc.owner = fixup_owner;
                let rid = RelocId::new(self.relocs.len());
                self.relocs.push(reloc);
                self.sections[fixup_owner.index()].relocs.push(rid);
            }

            // The original site becomes a plain branch to the island.
            if let Some(data) = self.fragments[frag_id.index()].data_mut() {
                io.patch_word(data, offset as usize, 0x1400_0000);
            }
            for rid in redirects {
                self.modified_targets
                    .insert(rid, FragmentRef::new(stub, 0));
            }
            inserted += 1;
        }
        inserted
    }

    fn branch_target_value(&self, reloc: &Relocation) -> i64 {
        let Some(sym) = reloc.symbol else { return 0 };
        if self.pool.info(sym).reserved().contains(ReservedSlots::PLT) {
            if let Some(plt) = self.gotplt.plt_entry(sym) {
                return self
                    .address_of(FragmentRef::new(plt, 0))
                    .unwrap_or(0) as i64;
            }
        }
        self.symbol_value(sym) as i64
    }

    /// One relaxation pass: find branches whose targets are unreachable,
    /// interpose islands (reusing compatible ones), and retarget the
    /// relocations. Returns how many new stubs were cloned.
    pub fn relax_once(&mut self) -> Result<usize> {
        if self.config.no_trampolines || self.backend.stubs.is_empty() {
            return Ok(0);
        }
        let mut created = 0usize;
        let reloc_count = self.relocs.len();
        for idx in 0..reloc_count {
            let (rtype, target_ref, symbol, addend, owner) = {
                let r = &self.relocs[idx];
                (r.rtype, r.target, r.symbol, r.addend, r.owner)
            };
            let Some(symbol) = symbol else { continue };
            // Stub fixup relocations never trampoline themselves.
            if self.sections[owner.index()].patches.is_none() {
                continue;
            }
            let Some(place) = self.address_of(target_ref) else {
                continue;
            };
            let target_value = self.branch_target_value(&self.relocs[idx]);
            let stubs = self.backend.stubs;
            let Some(proto_idx) = select_prototype(stubs, rtype, target_value, place as i64)
            else {
                continue;
            };
            let proto = &stubs[proto_idx];

            let info = self.pool.info(symbol);
            let target_is_local = info.is_local() || info.sym_type() == SymType::Section;
            let target_origin = info.resolved_origin();
            let sym_name = info.name().to_string();

            // Reuse requires compatibility and reachability.
            if let Some(existing) =
                self.islands
                    .find_compatible(proto_idx, symbol, target_is_local, target_origin, addend)
            {
                let island_frag = self.islands.islands()[existing].frag;
                let island_addr = self
                    .address_of(FragmentRef::new(island_frag, 0))
                    .unwrap_or(0) as i64;
                if (proto.in_range)(rtype, island_addr, place as i64) {
                    let island_sym = self.islands.islands()[existing].symbol;
                    self.relocs[idx].symbol = Some(island_sym);
                    self.islands.island_mut(existing).reuse_count += 1;
                    self.diag.raise(DiagKind::ReuseStub, [sym_name]);
                    continue;
                }
            }

            // Clone the prototype at the end of the branch's output
            // section so nothing already placed moves.
            let patched_sid = self.sections[owner.index()].patches.unwrap_or(owner);
            let home_out = self.sections[patched_sid.index()].output;
            let home_section = home_out
                .and_then(|o| self.out_sections[o.index()].members.last().copied())
                .unwrap_or(patched_sid);
            let frag = self.push_fragment(Fragment::new(
                home_section,
                proto.align,
                FragmentKind::Stub {
                    data: proto.template.to_vec(),
                    prototype: proto_idx,
                },
            ));

            let tramp_name = {
                let from = &self.sections[patched_sid.index()].name;
                self.islands.symbol_name(&sym_name, from)
            };
            let tramp_info = self.define_internal_local(
                &tramp_name,
                FragmentRef::new(frag, 0),
                proto.template.len() as u64,
            );

            // The stub's fixups become relocations against the real target.
            let fixup_owner = SectionId::new(self.sections.len());
            self.sections.push(Section::internal(
                ".rela.trampoline",
                crate::base::SHT_RELA,
                SectionFlags::empty(),
                8,
            ));
            for fixup in proto.fixups {
                let mut reloc = Relocation::new(
                    fixup.rtype,
                    FragmentRef::new(frag, fixup.offset),
                    Some(symbol),
                    fixup.addend + addend,
                );
                reloc.owner = fixup_owner;
                let fixup_rid = RelocId::new(self.relocs.len());
                self.relocs.push(reloc);
                self.sections[fixup_owner.index()].relocs.push(fixup_rid);
            }

            self.islands.add(
                proto_idx,
                frag,
                tramp_info,
                symbol,
                target_is_local,
                target_origin,
                addend,
            );
            // The original branch now aims at the trampoline.
            self.relocs[idx].symbol = Some(tramp_info);
            self.diag
                .raise(DiagKind::TrampolineSymbol, [sym_name.clone()]);
            self.diag.raise(
                DiagKind::CreateStub,
                [self
                    .pool
                    .info(tramp_info)
                    .name()
                    .to_string()],
            );
            created += 1;
        }
        Ok(created)
    }

    /// Cortex-A53 erratum 843419 pass: scan executable fragments for the
    /// published sequence and log where fixes apply. Runs only under
    /// `--fix-cortex-a53-843419` on AArch64.
    pub fn scan_erratum_fixes(&mut self) -> Vec<(FragId, u64)> {
        if !self.config.fix_cortex_a53_843419 || self.config.machine != ElfMachine::AArch64 {
            return Vec::new();
        }
        let io = self.backend.io;
        let mut hits = Vec::new();
        for (idx, frag) in self.fragments.iter().enumerate() {
            let owner = &self.sections[frag.owner.index()];
            if !owner.flags.contains(SectionFlags::EXECINSTR) || owner.is_dropped() {
                continue;
            }
            let Some(base) = self.address_of(FragmentRef::new(FragId::new(idx), 0)) else {
                continue;
            };
            let Some(data) = frag.data() else { continue };
            for offset in crate::arch::aarch64::scan_erratum_843419(data, base, io) {
                hits.push((FragId::new(idx), offset));
            }
        }
        for (frag, offset) in &hits {
            let name = self.sections[self.fragments[frag.index()].owner.index()]
                .name
                .clone();
            self.diag.raise(
                DiagKind::ErratumFixApplied,
                [name, format!("{:x}", offset)],
            );
        }
        hits
    }

    /// Apply every relocation into its fragment bytes. Values are
    /// computed in parallel, then spliced serially in ascending offset
    /// order per fragment.
    pub fn apply_relocations(&mut self) -> Result<()> {
        if self.config.is_partial() {
            return Ok(());
        }
        let ids: Vec<RelocId> = (0..self.relocs.len()).map(RelocId::new).collect();

        struct Patch {
            rid: RelocId,
            frag: FragId,
            offset: u64,
            width: usize,
            word: u64,
            result: RelocResult,
        }

        let mut patches: Vec<Option<Patch>> = par_map(&ids, |rid| {
            let reloc = &self.relocs[rid.index()];
            // Only entries owned by relocation sections patch bytes.
            let owner = &self.sections[reloc.owner.index()];
            if owner.relocs.is_empty() {
                return None;
            }
            let target_ref = self.effective_target(*rid);
            if !target_ref.is_real() {
                return None;
            }
            let frag = &self.fragments[target_ref.frag.index()];
            let target_section = &self.sections[frag.owner.index()];
            if target_section.is_dropped() {
                return None;
            }
            // A reference into a discarded section is an undef by now.
            if let Some(sym) = reloc.symbol {
                let info = self.pool.info(sym);
                if let Some(out) = info.out_symbol() {
                    let s = self.pool.symbol(out);
                    if s.frag_ref.is_discard()
                        || (s.frag_ref.is_real()
                            && self.sections
                                [self.fragments[s.frag_ref.frag.index()].owner.index()]
                            .mark
                                == SectionMark::Discard)
                    {
                        self.diag.raise(
                            DiagKind::RelocAgainstDiscarded,
                            [
                                info.name().to_string(),
                                target_section.name.clone(),
                                self.path_of(target_section.input),
                            ],
                        );
                        return None;
                    }
                }
            }

            let entry = (self.backend.entry_of)(reloc.rtype)?;
            let width = match entry.kind {
                FieldKind::Data => ((entry.bits as usize) + 7) / 8,
                _ => 4,
            };
            if width == 0 {
                return None;
            }
            let io = self.backend.io;
            let word = frag.data().and_then(|data| {
                let at = target_ref.offset as usize;
                let tail = data.get(at..)?;
                Some(match width {
                    8 => io.read_xword(tail).ok()?,
                    4 => u64::from(io.read_word(tail).ok()?),
                    2 => u64::from(io.read_half(tail).ok()?),
                    1 => u64::from(*tail.first()?),
                    _ => return None,
                })
            })?;

            let place = self.address_of(target_ref).unwrap_or(0);
            let sym = reloc.symbol;
            let (s, got_slot, plt_entry, reserved, weak_undef, is_dyn, preemptible) = match sym {
                Some(id) => {
                    let info = self.pool.info(id);
                    let got = [
                        GotSlotKind::Regular,
                        GotSlotKind::TlsGd,
                        GotSlotKind::TlsLd,
                        GotSlotKind::TlsIe,
                        GotSlotKind::TlsDesc,
                    ]
                    .iter()
                    .find_map(|kind| self.gotplt.got_slot(id, *kind))
                    .and_then(|f| self.address_of(FragmentRef::new(f, 0)));
                    let plt = self
                        .gotplt
                        .plt_entry(id)
                        .and_then(|f| self.address_of(FragmentRef::new(f, 0)));
                    (
                        self.symbol_value(id),
                        got,
                        plt,
                        info.reserved(),
                        info.is_weak_undef() && !info.is_dyn(),
                        info.is_dyn(),
                        self.is_preemptible(id),
                    )
                }
                None => (0, None, None, ReservedSlots::empty(), false, false, false),
            };

            let input = crate::reloc::ApplyInput {
                rtype: reloc.rtype,
                s,
                a: reloc.addend,
                p: place,
                got_slot,
                plt_entry,
                got_base: self.got_base(),
                tls_base: self.tls_base,
                tls_size: self.tls_size,
                tcb_size: self.backend.tcb_size,
                target_alloc: target_section.is_alloc(),
                sym_weak_undef: weak_undef,
                sym_dyn: is_dyn,
                reserved,
                preemptible,
                is_exec: self.config.is_normal_exec(),
                word,
            };
            let (result, new_word) = (self.backend.apply)(&input);
            Some(Patch {
                rid: *rid,
                frag: target_ref.frag,
                offset: target_ref.offset,
                width,
                word: new_word,
                result,
            })
        })
        .into_iter()
        .collect();

        // Splice serially, ascending per fragment.
        patches.sort_by_key(|p| p.as_ref().map(|p| (p.frag, p.offset)));
        let io = self.backend.io;
        for patch in patches.into_iter().flatten() {
            match patch.result {
                RelocResult::Ok => {}
                RelocResult::Overflow => {
                    let reloc = &self.relocs[patch.rid.index()];
                    let name = self.backend.reloc_name(reloc.rtype);
                    let sym = reloc
                        .symbol
                        .map(|s| self.pool.info(s).name().to_string())
                        .unwrap_or_default();
                    self.diag.raise(
                        DiagKind::RelocOverflow,
                        [name, sym, format!("{:x}", patch.offset)],
                    );
                    continue;
                }
                RelocResult::BadReloc | RelocResult::Unsupported | RelocResult::Unknown => {
                    let reloc = &self.relocs[patch.rid.index()];
                    self.diag.raise(
                        DiagKind::UnsupportedReloc,
                        [
                            self.backend.reloc_name(reloc.rtype),
                            self.path_of(
                                self.sections[self.fragments[patch.frag.index()].owner.index()]
                                    .input,
                            ),
                        ],
                    );
                    continue;
                }
            }
            if let Some(data) = self.fragments[patch.frag.index()].data_mut() {
                let at = patch.offset as usize;
                let mut bytes = Vec::with_capacity(patch.width);
                match patch.width {
                    8 => io.write_xword(&mut bytes, patch.word),
                    4 => io.write_word(&mut bytes, patch.word as u32),
                    2 => io.write_half(&mut bytes, patch.word as u16),
                    _ => bytes.push(patch.word as u8),
                }
                if at + bytes.len() <= data.len() {
                    data[at..at + bytes.len()].copy_from_slice(&bytes);
                }
            }
        }

        if self.diag.error_count() > 0 {
            self.set_failure();
        }
        Ok(())
    }

    /// The whole pipeline in spec order, producing the image bytes.
    /// Aborts without writing when any error was reported.
    pub fn link(&mut self) -> Result<Vec<u8>> {
        self.init_island_factory();
        self.script.validate(&self.diag)?;
        self.resolve_archives()?;
        self.post_lto = true;
        self.config.linking_shared = self
            .inputs
            .iter()
            .any(|f| f.kind == FileKind::SharedElf);
        self.init_standard_symbols()?;

        let mut plugins = std::mem::take(&mut self.plugins);
        for plugin in &mut plugins {
            plugin.visit_symbols(self)?;
        }

        self.scan_relocations()?;
        self.allocate_commons();
        self.allocate_copy_relocs();
        self.prepare_dynamic();

        for plugin in &mut plugins {
            plugin.visit_sections(self)?;
        }

        self.garbage_collect();
        self.assign_output_sections()?;
        self.merge_dedup();
        self.layout_offsets();
        self.assign_addresses()?;

        // Relaxation fixed point: every pass may move fragments, so the
        // layout reruns until no stub is added (bounded).
        let mut passes = 0;
        loop {
            let created = self.relax_once()?;
            if created == 0 || passes >= 8 {
                break;
            }
            passes += 1;
            self.layout_offsets();
            self.assign_addresses()?;
        }
        let erratum_hits = self.scan_erratum_fixes();
        if !erratum_hits.is_empty() {
            self.insert_erratum_islands(erratum_hits);
            self.layout_offsets();
            self.assign_addresses()?;
        }

        self.finalize_synthetic_values();
        self.create_segments()?;
        self.apply_relocations()?;

        for plugin in &mut plugins {
            plugin.act_before_writing(self)?;
        }
        self.plugins = plugins;

        if self.failed() {
            return Err(Error::Aborted {
                errors: self.diag.error_count(),
            });
        }
        crate::reloc::sort_relocations(&mut self.rela_dyn, self.backend.dyn_relocs.relative);
        self.write_image()
    }
}

/// Map `f` over `items` on a small scoped thread pool, preserving input
/// order in the result. The closure sees shared state read-only; every
/// component with interior mutability carries its own lock.
pub(crate) fn par_map<T: Sync, R: Send>(
    items: &[T],
    f: impl Fn(&T) -> R + Sync,
) -> Vec<R> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(items.len().max(1))
        .min(8);
    if workers <= 1 || items.len() < 2 {
        return items.iter().map(f).collect();
    }
    let mut results: Vec<Option<R>> = Vec::with_capacity(items.len());
    results.resize_with(items.len(), || None);
    let next = std::sync::atomic::AtomicUsize::new(0);
    {
        let slots = std::sync::Mutex::new(&mut results);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= items.len() {
                        break;
                    }
                    let value = f(&items[idx]);
                    if let Ok(mut slots) = slots.lock() {
                        slots[idx] = Some(value);
                    }
                });
            }
        });
    }
    results.into_iter().flatten().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn par_map_preserves_order() {
        let items: Vec<u64> = (0..100).collect();
        let doubled = par_map(&items, |x| x * 2);
        assert_eq!(doubled.len(), 100);
        for (i, v) in doubled.iter().enumerate() {
            assert_eq!(*v, (i as u64) * 2);
        }
    }
}
