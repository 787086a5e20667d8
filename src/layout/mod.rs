//! The layout engine: garbage collection, script rule matching, merge
//! dedup, fragment offset assignment, and address assignment

use std::collections::{HashMap, HashSet, VecDeque};

use crate::base::{
    align_up, FragId, OutSectId, SectionFlags, SectionId, SymbolId, SHT_NOBITS, SHT_PROGBITS,
};
use crate::config::CodeGenType;
use crate::diag::DiagKind;
use crate::error::{Error, Result};
use crate::fragment::FragmentKind;
use crate::module::Module;
use crate::script::{EvalScope, SortKind};
use crate::section::{OutputSection, SectionKind, SectionMark};

/// Default image base for a fixed-address executable
const EXEC_BASE: u64 = 0x40_0000;

fn canonical_rank(name: &str, flags: SectionFlags, sh_type: u32) -> u32 {
    if name == ".interp" {
        return 0;
    }
    if !flags.contains(SectionFlags::ALLOC) {
        return 100;
    }
    if name == ".note.gnu.build-id" || sh_type == crate::base::SHT_NOTE {
        return 1;
    }
    if name == ".dynsym" {
        return 2;
    }
    if name == ".dynstr" {
        return 3;
    }
    if name == ".hash" || name == ".gnu.hash" {
        return 4;
    }
    if name.starts_with(".rela.plt") || name.starts_with(".rel.plt") {
        return 6;
    }
    if name.starts_with(".rela") || name.starts_with(".rel") {
        return 5;
    }
    if name == ".plt" {
        return 11;
    }
    if flags.contains(SectionFlags::EXECINSTR) {
        return 10;
    }
    if name == ".eh_frame_hdr" {
        return 20;
    }
    if name == ".eh_frame" {
        return 21;
    }
    if name.starts_with(".ARM.exidx") {
        return 22;
    }
    if !flags.contains(SectionFlags::WRITE) {
        return 23; // rodata
    }
    if flags.contains(SectionFlags::TLS) {
        return if sh_type == SHT_NOBITS { 31 } else { 30 };
    }
    // RELRO candidates precede plain data.
    if name == ".dynamic" {
        return 40;
    }
    if name == ".got" {
        return 41;
    }
    if name == ".got.plt" {
        return 42;
    }
    if sh_type == SHT_NOBITS {
        return 60;
    }
    50
}

impl Module {
    /// Step 1: garbage collection. Build the reached set from the entry
    /// symbol, KEEP rules, forced undefines and exported symbols, follow
    /// relocation and target glue edges, and mark everything else Ignore.
    pub fn garbage_collect(&mut self) {
        if !self.config.gc_sections {
            for section in &mut self.sections {
                if section.mark == SectionMark::None {
                    section.mark = SectionMark::Live;
                }
            }
            return;
        }

        // Adjacency: for each section, the sections its relocations reach.
        let mut edges: HashMap<SectionId, Vec<SectionId>> = HashMap::new();
        for section in &self.sections {
            let Some(patched) = section.patches else { continue };
            for rid in &section.relocs {
                let reloc = &self.relocs[rid.index()];
                let Some(sym) = reloc.symbol else { continue };
                let Some(out) = self.pool.info(sym).out_symbol() else {
                    continue;
                };
                let frag_ref = self.pool.symbol(out).frag_ref;
                if !frag_ref.is_real() {
                    continue;
                }
                let target = self.fragments[frag_ref.frag.index()].owner;
                edges.entry(patched).or_default().push(target);
            }
        }
        // Glue edges (e.g. a function's unwind index lives when it does).
        let glue: Vec<(SectionId, SectionId)> = self
            .sections
            .iter()
            .enumerate()
            .filter_map(|(idx, section)| {
                let companion = (self.backend.gc_glue)(&section.name)?;
                let sid = SectionId::new(idx);
                let target = self
                    .sections
                    .iter()
                    .position(|s| s.name == companion && s.input == section.input)?;
                Some((sid, SectionId::new(target)))
            })
            .collect();
        for (from, to) in glue {
            edges.entry(from).or_default().push(to);
        }

        let mut roots: Vec<SectionId> = Vec::new();
        let mut root_symbol = |pool: &crate::symbol::NamePool,
                              fragments: &[crate::fragment::Fragment],
                              roots: &mut Vec<SectionId>,
                              id: SymbolId| {
            let Some(out) = pool.info(id).out_symbol() else {
                return;
            };
            let frag_ref = pool.symbol(out).frag_ref;
            if frag_ref.is_real() {
                roots.push(fragments[frag_ref.frag.index()].owner);
            }
        };
        let entry_name = self
            .config
            .entry
            .clone()
            .unwrap_or_else(|| self.backend.entry_symbol.to_string());
        if let Some(id) = self.pool.find(&entry_name) {
            root_symbol(&self.pool, &self.fragments, &mut roots, id);
        }
        for name in &self.config.forced_undefined {
            if let Some(id) = self.pool.find(name) {
                root_symbol(&self.pool, &self.fragments, &mut roots, id);
            }
        }
        for (_, id) in self.pool.globals() {
            let info = self.pool.info(id);
            let exported = info.export_to_dyn()
                || (self.config.codegen == CodeGenType::DynObj
                    && info.is_define()
                    && !info.is_hidden());
            if exported || info.should_preserve() {
                root_symbol(&self.pool, &self.fragments, &mut roots, id);
            }
        }
        // KEEP'd sections and internal synthetics are roots too.
        for (idx, section) in self.sections.iter().enumerate() {
            let sid = SectionId::new(idx);
            if section.kind == SectionKind::Internal {
                roots.push(sid);
                continue;
            }
            let path = self.input_path(section.input);
            if let Some((rule_idx, spec_idx)) =
                self.script.match_section(&path, None, &section.name)
            {
                if self.script.rules[rule_idx].inputs[spec_idx].keep {
                    roots.push(sid);
                }
            }
        }

        let mut reached: HashSet<SectionId> = HashSet::new();
        let mut queue: VecDeque<SectionId> = roots.into_iter().collect();
        while let Some(sid) = queue.pop_front() {
            if !reached.insert(sid) {
                continue;
            }
            if let Some(next) = edges.get(&sid) {
                for n in next {
                    if !reached.contains(n) {
                        queue.push_back(*n);
                    }
                }
            }
        }

        let mut pruned = 0usize;
        for (idx, section) in self.sections.iter_mut().enumerate() {
            let sid = SectionId::new(idx);
            if section.mark != SectionMark::None {
                continue;
            }
            let collectable = section.is_alloc()
                && matches!(
                    section.kind,
                    SectionKind::Regular
                        | SectionKind::NoBits
                        | SectionKind::MergeStr
                        | SectionKind::Exidx
                );
            if collectable && !reached.contains(&sid) {
                section.mark = SectionMark::Ignore;
                pruned += 1;
            } else {
                section.mark = SectionMark::Live;
            }
        }
        log::debug!("gc-sections pruned {pruned} sections");

        // Symbols defined in pruned sections drop out of the symtab.
        for idx in 0..self.pool.info_count() {
            let id = SymbolId::new(idx);
            let Some(out) = self.pool.info(id).out_symbol() else {
                continue;
            };
            let frag_ref = self.pool.symbol(out).frag_ref;
            if !frag_ref.is_real() {
                continue;
            }
            let owner = self.fragments[frag_ref.frag.index()].owner;
            if self.sections[owner.index()].is_dropped() {
                self.pool.symbol_mut(out).should_ignore = true;
            }
        }
    }

    fn section_eligible(&self, section: &crate::section::Section) -> bool {
        if section.is_dropped() {
            return false;
        }
        // Group sections carry no fragments; they survive only into
        // relocatable output, where the writer re-emits their members.
        if section.kind == SectionKind::Group {
            return self.config.is_partial() && !section.group_members.is_empty();
        }
        matches!(
            section.kind,
            SectionKind::Regular
                | SectionKind::NoBits
                | SectionKind::MergeStr
                | SectionKind::EhFrame
                | SectionKind::Exidx
                | SectionKind::Note
                | SectionKind::GnuProperty
                | SectionKind::Debug
                | SectionKind::Internal
        ) && !section.fragments.is_empty()
    }

    /// Steps 2 and 4: assign every live input section to an output
    /// section by first-match rule scan, then stabilize member order
    /// (script order across rules, insertion order within, SORT applied).
    pub fn assign_output_sections(&mut self) -> Result<()> {
        self.out_sections.clear();
        self.out_index.clear();

        // /DISCARD/ first: matched sections drop with reference errors.
        let discard_rules: Vec<usize> = self
            .script
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_discard())
            .map(|(i, _)| i)
            .collect();
        if !discard_rules.is_empty() {
            for idx in 0..self.sections.len() {
                let (name, input, eligible) = {
                    let s = &self.sections[idx];
                    (s.name.clone(), s.input, self.section_eligible(s))
                };
                if !eligible {
                    continue;
                }
                let path = self.input_path(input);
                if let Some((rule_idx, _)) = self.script.match_section(&path, None, &name) {
                    if discard_rules.contains(&rule_idx) {
                        self.sections[idx].mark = SectionMark::Discard;
                    }
                }
            }
        }

        #[derive(Default)]
        struct Bucket {
            members: Vec<(SectionId, usize, SortKind)>, // (section, spec order key, sort)
        }
        // Rule-keyed and name-keyed buckets.
        let mut rule_buckets: HashMap<usize, Bucket> = HashMap::new();
        let mut name_buckets: Vec<(String, Bucket)> = Vec::new();

        let section_count = self.sections.len();
        for idx in 0..section_count {
            let (eligible, name, input, kind) = {
                let s = &self.sections[idx];
                (
                    self.section_eligible(s),
                    s.name.clone(),
                    s.input,
                    s.kind,
                )
            };
            if !eligible {
                continue;
            }
            let sid = SectionId::new(idx);
            // Each group keeps its own output section; one shared name
            // would merge member lists that must stay apart.
            if kind == SectionKind::Group {
                let mut out_name = name.clone();
                let mut n = 0usize;
                while name_buckets.iter().any(|(existing, _)| *existing == out_name) {
                    n += 1;
                    out_name = format!("{name}.{n}");
                }
                let mut bucket = Bucket::default();
                bucket.members.push((sid, 0, SortKind::None));
                name_buckets.push((out_name, bucket));
                continue;
            }
            let path = self.input_path(input);
            let archive = self.archive_of(input);
            let matched = self
                .script
                .match_section(&path, archive.as_deref(), &name);
            match matched {
                Some((rule_idx, spec_idx)) if !self.script.rules[rule_idx].is_discard() => {
                    self.sections[idx].matched_rule = Some(rule_idx);
                    let sort = self.script.rules[rule_idx].inputs[spec_idx].sort;
                    rule_buckets
                        .entry(rule_idx)
                        .or_default()
                        .members
                        .push((sid, spec_idx, sort));
                }
                Some(_) => {} // discarded above
                None => {
                    let out_name = if !self.script.rules.is_empty()
                        && self.sections[idx].is_alloc()
                        && kind != SectionKind::Internal
                    {
                        if self.config.warn_unrecognized {
                            self.diag
                                .raise(DiagKind::UnrecognizedSection, [name.clone(), path]);
                        }
                        ".unrecognized".to_string()
                    } else {
                        name.clone()
                    };
                    match name_buckets.iter_mut().find(|(n, _)| *n == out_name) {
                        Some((_, bucket)) => bucket.members.push((sid, 0, SortKind::None)),
                        None => {
                            let mut bucket = Bucket::default();
                            bucket.members.push((sid, 0, SortKind::None));
                            name_buckets.push((out_name, bucket));
                        }
                    }
                }
            }
        }

        let mut emit = |module: &mut Module, name: String, rule: Option<usize>, mut bucket: Bucket| {
            // Order within a rule: spec order, then insertion order, with
            // SORT modifiers rearranging inside one spec.
            bucket.members.sort_by(|a, b| a.1.cmp(&b.1));
            let mut ordered: Vec<SectionId> = Vec::new();
            let mut spec_group: Vec<(SectionId, usize, SortKind)> = Vec::new();
            let flush = |group: &mut Vec<(SectionId, usize, SortKind)>,
                         ordered: &mut Vec<SectionId>,
                         module: &Module| {
                if group.is_empty() {
                    return;
                }
                let sort = group[0].2;
                match sort {
                    SortKind::None => {}
                    SortKind::ByName => group.sort_by(|a, b| {
                        module.sections[a.0.index()]
                            .name
                            .cmp(&module.sections[b.0.index()].name)
                    }),
                    SortKind::ByAlignment => group.sort_by(|a, b| {
                        module.sections[b.0.index()]
                            .align
                            .cmp(&module.sections[a.0.index()].align)
                    }),
                    SortKind::ByNameThenAlignment => group.sort_by(|a, b| {
                        let an = &module.sections[a.0.index()];
                        let bn = &module.sections[b.0.index()];
                        an.name.cmp(&bn.name).then(bn.align.cmp(&an.align))
                    }),
                }
                ordered.extend(group.iter().map(|(sid, _, _)| *sid));
                group.clear();
            };
            for member in bucket.members {
                if let Some(last) = spec_group.last() {
                    if last.1 != member.1 {
                        flush(&mut spec_group, &mut ordered, module);
                    }
                }
                spec_group.push(member);
            }
            flush(&mut spec_group, &mut ordered, module);

            let first = ordered[0];
            let sh_type = if ordered
                .iter()
                .all(|sid| module.sections[sid.index()].sh_type == SHT_NOBITS)
            {
                SHT_NOBITS
            } else {
                let first_type = module.sections[first.index()].sh_type;
                if first_type == SHT_NOBITS {
                    SHT_PROGBITS
                } else {
                    first_type
                }
            };
            let mut flags = SectionFlags::empty();
            let mut align = 1u64;
            let mut entsize = 0u64;
            for sid in &ordered {
                let s = &module.sections[sid.index()];
                flags |= s.flags;
                align = align.max(s.align);
                if s.kind == SectionKind::MergeStr {
                    entsize = entsize.max(s.entsize);
                }
            }
            if sh_type == crate::base::SHT_GROUP {
                entsize = 4;
            }
            let out_id = OutSectId::new(module.out_sections.len());
            let mut out = OutputSection::new(name.clone(), sh_type, flags);
            out.align = align;
            out.entsize = entsize;
            out.rule = rule;
            out.members = ordered.clone();
            module.out_sections.push(out);
            module.out_index.insert(name, out_id);
            for sid in ordered {
                module.sections[sid.index()].output = Some(out_id);
            }
        };

        // Script rules first, in script order.
        for (rule_idx, rule) in self.script.rules.clone().iter().enumerate() {
            if rule.is_discard() {
                continue;
            }
            if let Some(bucket) = rule_buckets.remove(&rule_idx) {
                if !bucket.members.is_empty() {
                    emit(self, rule.name.clone(), Some(rule_idx), bucket);
                }
            }
        }
        // Leftovers in canonical order, stable within a rank.
        name_buckets.sort_by_key(|(name, bucket)| {
            let first = bucket.members[0].0;
            let s = &self.sections[first.index()];
            canonical_rank(name, s.flags, s.sh_type)
        });
        for (name, bucket) in name_buckets {
            emit(self, name, None, bucket);
        }

        self.create_dynamic_output_sections();
        Ok(())
    }

    fn archive_of(&self, input: crate::base::InputId) -> Option<String> {
        let file = &self.inputs[input.index()];
        file.parent.map(|p| self.input_path(p))
    }

    /// The synthesized non-fragment sections: interp, dynamic tables,
    /// output relocation sections, eh_frame_hdr, build id. Their sizes
    /// are computable now; contents are produced at write time.
    fn create_dynamic_output_sections(&mut self) {
        let word = self.backend.io.class.word_size() as u64;
        let sym_size = if word == 8 { 24 } else { 16 };
        let rela_size = if self.backend.is_rela {
            word * 3
        } else {
            word * 2
        };

        let mut synth: Vec<(String, u32, SectionFlags, u64, u64)> = Vec::new();
        if let Some(interp) = &self.dynamic.interp {
            synth.push((
                ".interp".into(),
                SHT_PROGBITS,
                SectionFlags::ALLOC,
                1,
                interp.len() as u64 + 1,
            ));
        }
        let dyn_count = self.dynamic.dynsym_order.len();
        if dyn_count > 0 || !self.dynamic.dynstr.is_empty() {
            synth.push((
                ".dynsym".into(),
                crate::base::SHT_DYNSYM,
                SectionFlags::ALLOC,
                word,
                (dyn_count as u64 + 1) * sym_size,
            ));
            synth.push((
                ".dynstr".into(),
                crate::base::SHT_STRTAB,
                SectionFlags::ALLOC,
                1,
                self.dynamic.dynstr.len().max(1) as u64,
            ));
            let buckets = (dyn_count as u64 + 1).max(1);
            synth.push((
                ".hash".into(),
                crate::base::SHT_HASH,
                SectionFlags::ALLOC,
                word,
                (2 + buckets + dyn_count as u64 + 1) * 4,
            ));
            // NEEDED entries plus the fixed tag table and the NULL.
            let tags = 16 + self.dynamic.needed_offsets.len() as u64;
            synth.push((
                ".dynamic".into(),
                crate::base::SHT_DYNAMIC,
                SectionFlags::ALLOC | SectionFlags::WRITE,
                word,
                tags * word * 2,
            ));
        }
        if !self.rela_dyn.is_empty() {
            synth.push((
                if self.backend.is_rela { ".rela.dyn" } else { ".rel.dyn" }.into(),
                if self.backend.is_rela {
                    crate::base::SHT_RELA
                } else {
                    crate::base::SHT_REL
                },
                SectionFlags::ALLOC,
                word,
                self.rela_dyn.len() as u64 * rela_size,
            ));
        }
        if !self.rela_plt.is_empty() {
            synth.push((
                if self.backend.is_rela { ".rela.plt" } else { ".rel.plt" }.into(),
                if self.backend.is_rela {
                    crate::base::SHT_RELA
                } else {
                    crate::base::SHT_REL
                },
                SectionFlags::ALLOC,
                word,
                self.rela_plt.len() as u64 * rela_size,
            ));
        }
        let fde_count = self
            .fragments
            .iter()
            .filter(|f| matches!(f.kind, FragmentKind::Fde { live: true, .. }))
            .count() as u64;
        if fde_count > 0 && self.out_index.contains_key(".eh_frame") {
            synth.push((
                ".eh_frame_hdr".into(),
                SHT_PROGBITS,
                SectionFlags::ALLOC,
                4,
                12 + fde_count * 8,
            ));
        }
        if let Some(build_id) = &self.config.build_id {
            synth.push((
                ".note.gnu.build-id".into(),
                crate::base::SHT_NOTE,
                SectionFlags::ALLOC,
                4,
                16 + align_up(build_id.len() as u64, 4),
            ));
        }

        for (name, sh_type, flags, align, size) in synth {
            if size == 0 || self.out_index.contains_key(&name) {
                continue;
            }
            let out_id = OutSectId::new(self.out_sections.len());
            let mut out = OutputSection::new(name.clone(), sh_type, flags);
            out.align = align;
            out.size = size;
            self.out_sections.push(out);
            self.out_index.insert(name, out_id);
        }

        // Canonical placement for the synthesized ones too.
        let mut order: Vec<usize> = (0..self.out_sections.len()).collect();
        order.sort_by_key(|idx| {
            let out = &self.out_sections[*idx];
            let rank = match out.rule {
                // Script-ruled sections keep script order ahead of synthetics.
                Some(rule) => (0u32, rule as u32),
                None => (1, canonical_rank(&out.name, out.flags, out.sh_type)),
            };
            rank
        });
        let relocated: Vec<OutputSection> = order
            .iter()
            .map(|idx| self.out_sections[*idx].clone())
            .collect();
        self.out_sections = relocated;
        self.out_index = self
            .out_sections
            .iter()
            .enumerate()
            .map(|(i, o)| (o.name.clone(), OutSectId::new(i)))
            .collect();
        for (idx, out) in self.out_sections.iter().enumerate() {
            for member in &out.members {
                self.sections[member.index()].output = Some(OutSectId::new(idx));
            }
        }
    }

    /// Step 3: merge-string deduplication. Within each output section
    /// duplicates collapse onto the first occurrence and every relocation
    /// into a dropped string is redirected to the survivor with a cleared
    /// addend.
    pub fn merge_dedup(&mut self) {
        let mut dead_map: HashMap<FragId, FragId> = HashMap::new();
        for out in &self.out_sections {
            for sid in &out.members {
                let section = &self.sections[sid.index()];
                if section.kind != SectionKind::MergeStr {
                    continue;
                }
                if !section.is_alloc() && !self.config.merge_non_alloc_strings {
                    continue;
                }
                for frag_id in &section.fragments {
                    let bytes = match &self.fragments[frag_id.index()].kind {
                        FragmentKind::MergeString { bytes, live: true, .. } => bytes.clone(),
                        _ => continue,
                    };
                    let survivor = self.merge_pool.intern(*frag_id, &bytes);
                    if survivor != *frag_id {
                        dead_map.insert(*frag_id, survivor);
                    }
                }
            }
        }
        for (dead, survivor) in &dead_map {
            if let FragmentKind::MergeString { live, .. } =
                &mut self.fragments[dead.index()].kind
            {
                *live = false;
            }
            self.merge_pool.redirect(*dead, 0, *survivor, 0);
        }
        // Rewrite relocations that land in a dropped duplicate.
        for idx in 0..self.relocs.len() {
            let rid = crate::base::RelocId::new(idx);
            let target = self.relocs[idx].target;
            if let Some(survivor) = dead_map.get(&target.frag) {
                self.modified_targets.insert(
                    rid,
                    crate::fragment::FragmentRef::new(*survivor, target.offset),
                );
                self.relocs[idx].addend = 0;
            }
        }
        if !dead_map.is_empty() {
            log::debug!("merge-string dedup dropped {} duplicates", dead_map.len());
        }

        // FDE liveness: an FDE whose pc-begin relocation resolves into a
        // dropped section describes nothing.
        let mut dead_fdes: Vec<FragId> = Vec::new();
        for section in &self.sections {
            if section.patches.is_none() {
                continue;
            }
            for rid in &section.relocs {
                let reloc = &self.relocs[rid.index()];
                let frag = reloc.target.frag;
                if !frag.is_real() {
                    continue;
                }
                let is_fde_begin = matches!(
                    self.fragments[frag.index()].kind,
                    FragmentKind::Fde { .. }
                ) && reloc.target.offset == 8;
                if !is_fde_begin {
                    continue;
                }
                let dead = reloc
                    .symbol
                    .map(|sym| {
                        let info = self.pool.info(sym);
                        match info.out_symbol() {
                            Some(out) => {
                                let s = self.pool.symbol(out);
                                s.should_ignore
                                    || (s.frag_ref.is_real()
                                        && self.sections[self.fragments
                                            [s.frag_ref.frag.index()]
                                        .owner
                                        .index()]
                                        .is_dropped())
                            }
                            None => false,
                        }
                    })
                    .unwrap_or(false);
                if dead {
                    dead_fdes.push(frag);
                }
            }
        }
        for frag in dead_fdes {
            if let FragmentKind::Fde { live, .. } = &mut self.fragments[frag.index()].kind {
                *live = false;
            }
        }
    }

    /// Step 5: walk each output section's fragments, round offsets up to
    /// their alignment, and accumulate sizes. Rerun after stub insertion.
    pub fn layout_offsets(&mut self) {
        for out_idx in 0..self.out_sections.len() {
            let members = self.out_sections[out_idx].members.clone();
            // A group's content is its flag word plus member indices,
            // produced at write time from the captured member list.
            if self.out_sections[out_idx].sh_type == crate::base::SHT_GROUP {
                let count = members
                    .first()
                    .map(|sid| self.sections[sid.index()].group_members.len())
                    .unwrap_or(0) as u64;
                self.out_sections[out_idx].size = 4 * (1 + count);
                continue;
            }
            let mut cursor = 0u64;
            let mut align = self.out_sections[out_idx].align.max(1);
            for sid in members {
                let frags = self.sections[sid.index()].fragments.clone();
                for frag_id in frags {
                    let frag = &mut self.fragments[frag_id.index()];
                    let size = frag.size();
                    if size == 0 && !matches!(frag.kind, FragmentKind::Fill { .. }) {
                        frag.offset = cursor;
                        continue;
                    }
                    cursor = align_up(cursor, frag.align.max(1));
                    align = align.max(frag.align.max(1));
                    frag.offset = cursor;
                    cursor += size;
                }
            }
            let out = &mut self.out_sections[out_idx];
            if !out.members.is_empty() {
                out.size = cursor;
            }
            out.align = align;
        }
    }

    /// Step 6: evaluate script addresses and flow everything else along
    /// the location counter with page-boundary alignment between
    /// differently-protected runs.
    pub fn assign_addresses(&mut self) -> Result<()> {
        struct Scope<'a> {
            module: &'a Module,
        }
        impl EvalScope for Scope<'_> {
            fn symbol_value(&self, name: &str) -> Option<u64> {
                let id = self.module.pool().find(name)?;
                Some(self.module.pool().info(id).value())
            }
            fn section_size(&self, name: &str) -> Option<u64> {
                self.module.output_section_named(name).map(|o| o.size)
            }
            fn section_addr(&self, name: &str) -> Option<u64> {
                self.module.output_section_named(name).map(|o| o.addr)
            }
        }

        // Relocatable output keeps every section at address zero;
        // symbol values stay section-relative.
        if self.config.is_partial() {
            for out in &mut self.out_sections {
                out.addr = 0;
            }
            return Ok(());
        }

        let page = self.backend.page_size;
        let mut dot = if self.config.is_code_indep() {
            0
        } else {
            EXEC_BASE
        };
        let mut region_cursor: HashMap<String, u64> = HashMap::new();
        let mut prev_flags: Option<SectionFlags> = None;

        for idx in 0..self.out_sections.len() {
            let (name, flags, size, align, rule) = {
                let o = &self.out_sections[idx];
                (o.name.clone(), o.flags, o.size, o.align, o.rule)
            };
            if !flags.contains(SectionFlags::ALLOC) {
                self.out_sections[idx].addr = 0;
                continue;
            }
            if name == ".text" {
                if let Some(text) = self.config.text_addr {
                    dot = text;
                }
            }
            if name == ".data" {
                if let Some(data) = self.config.data_addr {
                    dot = data;
                }
            }

            let rule = rule.and_then(|r| self.script.rules.get(r).cloned());
            let mut addr = None;
            if let Some(rule) = &rule {
                if let Some(expr) = &rule.address {
                    addr = Some(expr.eval(dot, &Scope { module: self }, &self.diag)?);
                }
                if let Some(expr) = &rule.at {
                    let load = expr.eval(dot, &Scope { module: self }, &self.diag)?;
                    self.out_sections[idx].load_addr = Some(load);
                }
                if let Some(expr) = &rule.align {
                    let a = expr.eval(dot, &Scope { module: self }, &self.diag)?;
                    dot = align_up(dot, a.max(1));
                }
                if let Some(region_name) = &rule.region {
                    let Some(region) = self.script.region(region_name).cloned() else {
                        return Err(Error::Layout {
                            reason: format!("unknown MEMORY region {region_name}"),
                        });
                    };
                    let cursor = region_cursor
                        .entry(region.name.clone())
                        .or_insert(region.origin);
                    let placed = align_up(*cursor, align.max(1));
                    if placed + size > region.end() {
                        self.diag.raise(
                            DiagKind::SectionDoesNotFitRegion,
                            [name.clone(), region.name.clone()],
                        );
                        return Err(Error::Layout {
                            reason: format!("section {name} does not fit region {}", region.name),
                        });
                    }
                    *cursor = placed + size;
                    self.out_sections[idx].addr = placed;
                    continue;
                }
            }

            // A protection change starts a new page so segments can
            // keep distinct permissions.
            if let Some(prev) = prev_flags {
                let prot = |f: SectionFlags| {
                    (f.contains(SectionFlags::WRITE), f.contains(SectionFlags::EXECINSTR))
                };
                if prot(prev) != prot(flags) {
                    dot = align_up(dot, page);
                }
            }
            prev_flags = Some(flags);

            let assigned = match addr {
                Some(a) => a,
                None => align_up(dot, align.max(1)),
            };
            self.out_sections[idx].addr = assigned;
            dot = assigned + size;
        }

        // Top-level script assignments see final addresses. Reruns of
        // this pass (relaxation moves things) update values in place.
        for assignment in self.script.assignments.clone() {
            let existing = self.pool.find(&assignment.symbol);
            if assignment.provide && existing.is_none() {
                continue;
            }
            let value = assignment
                .value
                .eval(dot, &Scope { module: self }, &self.diag)?;
            let id = match existing {
                Some(id) => {
                    if let Some(out) = self.pool.info(id).out_symbol() {
                        let sym = self.pool.symbol_mut(out);
                        sym.value = value;
                        sym.frag_ref = crate::fragment::FragmentRef::null();
                        sym.script_defined = true;
                    }
                    self.pool.info_mut(id).set_value(value, true);
                    self.pool.info_mut(id).set_desc(crate::symbol::Desc::Define);
                    id
                }
                None => self.builder().add_absolute_symbol(
                    crate::base::InputId::new(0),
                    &assignment.symbol,
                    value,
                )?,
            };
            if let Some(out) = self.pool.info(id).out_symbol() {
                self.pool.symbol_mut(out).script_defined = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_places_text_before_data_before_bss() {
        let text = canonical_rank(".text", SectionFlags::ALLOC | SectionFlags::EXECINSTR, 1);
        let rodata = canonical_rank(".rodata", SectionFlags::ALLOC, 1);
        let data = canonical_rank(".data", SectionFlags::ALLOC | SectionFlags::WRITE, 1);
        let bss = canonical_rank(".bss", SectionFlags::ALLOC | SectionFlags::WRITE, SHT_NOBITS);
        let debug = canonical_rank(".debug_info", SectionFlags::empty(), 1);
        assert!(text < rodata);
        assert!(rodata < data);
        assert!(data < bss);
        assert!(bss < debug);
    }

    #[test]
    fn interp_comes_first() {
        assert_eq!(canonical_rank(".interp", SectionFlags::ALLOC, 1), 0);
    }
}
