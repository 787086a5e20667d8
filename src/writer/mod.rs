//! Image serialization: ELF header, program headers, section contents in
//! file-offset order, string/symbol tables, then the section header table

use std::collections::HashMap;

use crate::base::{
    ElfClass, FragId, IoCtx, SectionFlags, SymbolId, DF_BIND_NOW, DF_TEXTREL, DT_FLAGS, DT_HASH,
    DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELAENT,
    DT_RELASZ, DT_REL as DT_REL_TAG, DT_RELENT, DT_RELSZ, DT_SONAME, DT_STRSZ, DT_STRTAB,
    DT_SYMENT, DT_SYMTAB, ET_DYN, ET_EXEC, ET_REL, SHN_ABS, SHN_UNDEF, SHT_NOBITS, SHT_NULL,
    SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STB_LOCAL, STB_WEAK,
};
use crate::config::CodeGenType;
use crate::error::{Error, Result};
use crate::fragment::{FragmentKind, FragmentRef, GotSlotKind};
use crate::gotplt::GotValueKind;
use crate::module::Module;
use crate::reloc::{DynReloc, DynTarget};
use crate::symbol::{Binding, SymType, Visibility};

#[derive(Debug, Default)]
/// A string table under construction; offset 0 is the empty string
pub struct StrTab {
    bytes: Vec<u8>,
    known: HashMap<String, usize>,
}

impl StrTab {
    /// An empty table (one NUL)
    pub fn new() -> Self {
        StrTab {
            bytes: vec![0],
            known: HashMap::new(),
        }
    }

    /// Intern `name`, returning its offset
    pub fn intern(&mut self, name: &str) -> usize {
        if name.is_empty() {
            return 0;
        }
        if let Some(offset) = self.known.get(name) {
            return *offset;
        }
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.known.insert(name.to_string(), offset);
        offset
    }

    /// The serialized table
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

struct OutSymbol {
    name: String,
    value: u64,
    size: u64,
    bind: u8,
    stype: u8,
    vis: u8,
    shndx: u16,
    id: Option<SymbolId>,
}

struct ShdrRecord {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
    content: Vec<u8>,
}

fn elf_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = hash.wrapping_shl(4).wrapping_add(u32::from(byte));
        let high = hash & 0xf000_0000;
        if high != 0 {
            hash ^= high >> 24;
        }
        hash &= !high;
    }
    hash
}

fn write_sym(
    io: IoCtx,
    out: &mut Vec<u8>,
    name_off: u32,
    value: u64,
    size: u64,
    bind: u8,
    stype: u8,
    vis: u8,
    shndx: u16,
) {
    match io.class {
        ElfClass::Elf64 => {
            io.write_word(out, name_off);
            out.push((bind << 4) | (stype & 0xf));
            out.push(vis);
            io.write_half(out, shndx);
            io.write_xword(out, value);
            io.write_xword(out, size);
        }
        _ => {
            io.write_word(out, name_off);
            io.write_word(out, value as u32);
            io.write_word(out, size as u32);
            out.push((bind << 4) | (stype & 0xf));
            out.push(vis);
            io.write_half(out, shndx);
        }
    }
}

impl Module {
    fn dyn_target_address(&self, at: DynTarget) -> u64 {
        match at {
            DynTarget::InPlace(frag_ref) => self.address_of(frag_ref).unwrap_or(0),
            DynTarget::GotSlot { symbol, kind, word } => self
                .gotplt
                .got_slot(symbol, kind)
                .and_then(|f| self.address_of(FragmentRef::new(f, 0)))
                .map(|a| a + word * self.backend.io.class.word_size() as u64)
                .unwrap_or(0),
        }
    }

    fn serialize_dyn_relocs(&self, relocs: &[DynReloc]) -> Vec<u8> {
        let io = self.backend.io;
        let mut out = Vec::new();
        for reloc in relocs {
            let r_offset = self.dyn_target_address(reloc.at);
            let sym_index = reloc
                .symbol
                .and_then(|s| self.dynamic.dynsym_index.get(&s).copied())
                .unwrap_or(0) as u64;
            io.write_addr(&mut out, r_offset);
            match io.class {
                // r_info packs the symbol above the type, shift by class.
                ElfClass::Elf64 => {
                    io.write_xword(&mut out, (sym_index << 32) | u64::from(reloc.rtype));
                    if self.backend.is_rela {
                        io.write_sxword(&mut out, reloc.addend);
                    }
                }
                _ => {
                    io.write_word(&mut out, ((sym_index as u32) << 8) | (reloc.rtype & 0xff));
                    if self.backend.is_rela {
                        io.write_sword(&mut out, reloc.addend as i32);
                    }
                }
            }
        }
        out
    }

    /// Group sections write their member indices: the flag word, then
    /// each member rewritten as an output section header index
    fn render_group(&self, out_idx: usize) -> Vec<u8> {
        let io = self.backend.io;
        let mut out = Vec::new();
        io.write_word(&mut out, crate::base::GRP_COMDAT);
        let Some(&sid) = self.out_sections[out_idx].members.first() else {
            return out;
        };
        let section = &self.sections[sid.index()];
        for member in &section.group_members {
            let mapped = self
                .section_of_input
                .get(&(section.input, *member as usize))
                .and_then(|msid| self.sections[msid.index()].output)
                .map(|o| (o.index() + 1) as u32)
                .unwrap_or(*member);
            io.write_word(&mut out, mapped);
        }
        out
    }

    /// Output symtab index of a group's signature symbol, for `sh_info`
    fn group_signature_index(
        &self,
        out_idx: usize,
        symtab_index: &HashMap<SymbolId, usize>,
    ) -> u32 {
        let Some(&sid) = self.out_sections[out_idx].members.first() else {
            return 0;
        };
        let section = &self.sections[sid.index()];
        self.symbols_of_input
            .get(&section.input)
            .and_then(|syms| syms.get(section.info as usize))
            .map(|lid| self.pool.symbol(*lid).info)
            .and_then(|sym| symtab_index.get(&sym).copied())
            .unwrap_or(0) as u32
    }

    fn got_slot_bytes(&self, frag_id: FragId, slot: GotSlotKind, symbol: Option<SymbolId>) -> Vec<u8> {
        let io = self.backend.io;
        let word = io.class.word_size() as u64;
        let kind = self.gotplt.value_kind(frag_id);
        let symbol_value = symbol.map(|s| self.symbol_value(s)).unwrap_or(0);
        let mut out = Vec::new();
        let le_offset = |s: u64| {
            // IE/LE slots hold the thread-pointer-relative offset; the
            // direction depends on the variant the target uses.
            if self.backend.tcb_size > 0 {
                self.backend.tcb_size.wrapping_add(s)
            } else {
                s.wrapping_sub(self.tls_size)
            }
        };
        match kind {
            GotValueKind::SymbolValue => io.write_addr(&mut out, symbol_value),
            GotValueKind::Zero => io.write_addr(&mut out, 0),
            GotValueKind::DynamicAddr => {
                let addr = self
                    .output_section_named(".dynamic")
                    .map(|o| o.addr)
                    .unwrap_or(0);
                io.write_addr(&mut out, addr);
            }
            GotValueKind::Plt0Addr => {
                let addr = self
                    .gotplt
                    .plt0()
                    .and_then(|f| self.address_of(FragmentRef::new(f, 0)))
                    .unwrap_or(0);
                io.write_addr(&mut out, addr);
            }
            GotValueKind::ResolverAddr => io.write_addr(&mut out, symbol_value),
            GotValueKind::TlsStaticOffset => io.write_addr(&mut out, le_offset(symbol_value)),
            GotValueKind::TlsModuleId => {
                io.write_addr(&mut out, 1);
                if slot.words() > 1 {
                    io.write_addr(&mut out, symbol_value);
                }
            }
            GotValueKind::TlsOffset => io.write_addr(&mut out, symbol_value),
        }
        while (out.len() as u64) < slot.words() * word {
            io.write_addr(&mut out, 0);
        }
        out
    }

    fn render_members(&self, out_idx: usize) -> Vec<u8> {
        let out = &self.out_sections[out_idx];
        let fill = out
            .rule
            .and_then(|r| self.script.rules.get(r))
            .and_then(|r| r.fill)
            .unwrap_or(0) as u8;
        let mut content = vec![fill; out.size as usize];
        for sid in &out.members {
            for frag_id in &self.sections[sid.index()].fragments {
                let frag = &self.fragments[frag_id.index()];
                let at = frag.offset as usize;
                match &frag.kind {
                    FragmentKind::Region { data }
                    | FragmentKind::Cie { data }
                    | FragmentKind::Target { data }
                    | FragmentKind::Stub { data, .. }
                    | FragmentKind::Plt { data, .. } => {
                        if at + data.len() <= content.len() {
                            content[at..at + data.len()].copy_from_slice(data);
                        }
                    }
                    FragmentKind::Fde { data, live, .. } => {
                        if *live && at + data.len() <= content.len() {
                            content[at..at + data.len()].copy_from_slice(data);
                        }
                    }
                    FragmentKind::String { bytes } => {
                        if at + bytes.len() <= content.len() {
                            content[at..at + bytes.len()].copy_from_slice(bytes);
                        }
                    }
                    FragmentKind::MergeString {
                        bytes, live: true, ..
                    } => {
                        if at + bytes.len() <= content.len() {
                            content[at..at + bytes.len()].copy_from_slice(bytes);
                        }
                    }
                    FragmentKind::Got { slot, symbol, .. } => {
                        let bytes = self.got_slot_bytes(*frag_id, *slot, *symbol);
                        if at + bytes.len() <= content.len() {
                            content[at..at + bytes.len()].copy_from_slice(&bytes);
                        }
                    }
                    FragmentKind::Fill { size, pattern } => {
                        let end = (at + *size as usize).min(content.len());
                        if *pattern != 0 {
                            for byte in &mut content[at..end] {
                                *byte = *pattern;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        content
    }

    fn render_eh_frame_hdr(&self) -> Vec<u8> {
        let io = self.backend.io;
        let hdr_addr = self
            .output_section_named(".eh_frame_hdr")
            .map(|o| o.addr)
            .unwrap_or(0);
        let frame_addr = self
            .output_section_named(".eh_frame")
            .map(|o| o.addr)
            .unwrap_or(0);
        let mut entries = Vec::new();
        // Every live FDE contributes (pc-begin, fde address); the
        // pc-begin relocation tells us the function it covers.
        for section in &self.sections {
            if section.patches.is_none() {
                continue;
            }
            for rid in &section.relocs {
                let reloc = &self.relocs[rid.index()];
                if !reloc.target.frag.is_real() {
                    continue;
                }
                let frag = &self.fragments[reloc.target.frag.index()];
                let live = matches!(frag.kind, FragmentKind::Fde { live: true, .. });
                if !live || reloc.target.offset != 8 {
                    continue;
                }
                let initial = reloc
                    .symbol
                    .map(|s| self.symbol_value(s))
                    .unwrap_or(0)
                    .wrapping_add(reloc.addend as u64);
                let fde_addr = self
                    .address_of(FragmentRef::new(reloc.target.frag, 0))
                    .unwrap_or(0);
                entries.push(crate::ehframe::FdeTableEntry {
                    initial_location: initial,
                    fde_address: fde_addr,
                });
            }
        }
        crate::ehframe::build_eh_frame_hdr(io, hdr_addr, frame_addr, &mut entries)
    }

    fn render_dynamic(&self, size: u64) -> Vec<u8> {
        let io = self.backend.io;
        let word = io.class.word_size() as u64;
        let mut out = Vec::new();
        let tag = |out: &mut Vec<u8>, t: u64, v: u64| {
            io.write_addr(out, t);
            io.write_addr(out, v);
        };
        let addr_of = |name: &str| self.output_section_named(name).map(|o| o.addr).unwrap_or(0);
        let size_of = |name: &str| self.output_section_named(name).map(|o| o.size).unwrap_or(0);

        for offset in &self.dynamic.needed_offsets {
            tag(&mut out, DT_NEEDED, *offset as u64);
        }
        if let Some(soname) = self.dynamic.soname_offset {
            tag(&mut out, DT_SONAME, soname as u64);
        }
        tag(&mut out, DT_HASH, addr_of(".hash"));
        tag(&mut out, DT_STRTAB, addr_of(".dynstr"));
        tag(&mut out, DT_SYMTAB, addr_of(".dynsym"));
        tag(&mut out, DT_STRSZ, size_of(".dynstr"));
        tag(&mut out, DT_SYMENT, if word == 8 { 24 } else { 16 });
        if !self.rela_dyn.is_empty() {
            if self.backend.is_rela {
                tag(&mut out, DT_RELA, addr_of(".rela.dyn"));
                tag(&mut out, DT_RELASZ, size_of(".rela.dyn"));
                tag(&mut out, DT_RELAENT, word * 3);
            } else {
                tag(&mut out, DT_REL_TAG, addr_of(".rel.dyn"));
                tag(&mut out, DT_RELSZ, size_of(".rel.dyn"));
                tag(&mut out, DT_RELENT, word * 2);
            }
        }
        if !self.rela_plt.is_empty() {
            let plt_name = if self.backend.is_rela {
                ".rela.plt"
            } else {
                ".rel.plt"
            };
            tag(&mut out, DT_JMPREL, addr_of(plt_name));
            tag(&mut out, DT_PLTRELSZ, size_of(plt_name));
            tag(&mut out, DT_PLTREL, if self.backend.is_rela { 7 } else { 17 });
            tag(&mut out, DT_PLTGOT, addr_of(".got.plt"));
        }
        let mut flags = 0u64;
        if self.config.bind_now {
            flags |= DF_BIND_NOW;
        }
        if self.has_text_rel {
            flags |= DF_TEXTREL;
        }
        if flags != 0 {
            tag(&mut out, DT_FLAGS, flags);
        }
        tag(&mut out, DT_NULL, 0);
        while (out.len() as u64) < size {
            tag(&mut out, DT_NULL, 0);
        }
        out.truncate(size as usize);
        out
    }

    fn render_hash(&self) -> Vec<u8> {
        let io = self.backend.io;
        let count = self.dynamic.dynsym_order.len() + 1;
        let nbucket = count;
        let mut buckets = vec![0u32; nbucket];
        let mut chains = vec![0u32; count];
        for (position, id) in self.dynamic.dynsym_order.iter().enumerate() {
            let sym_index = position + 1;
            let name = self.pool().info(*id).name().to_string();
            let bucket = (elf_hash(&name) as usize) % nbucket;
            chains[sym_index] = buckets[bucket];
            buckets[bucket] = sym_index as u32;
        }
        let mut out = Vec::new();
        io.write_word(&mut out, nbucket as u32);
        io.write_word(&mut out, count as u32);
        for b in buckets {
            io.write_word(&mut out, b);
        }
        for c in chains {
            io.write_word(&mut out, c);
        }
        out
    }

    fn render_dynsym(&self, shndx_of_addr: &dyn Fn(u64) -> u16) -> Vec<u8> {
        let io = self.backend.io;
        let mut out = Vec::new();
        write_sym(io, &mut out, 0, 0, 0, 0, 0, 0, SHN_UNDEF);
        for id in &self.dynamic.dynsym_order {
            let info = self.pool().info(*id);
            let name_off = self
                .dynamic
                .name_offset
                .get(id)
                .copied()
                .unwrap_or(0) as u32;
            let value = if info.is_undef() || info.is_dyn() {
                0
            } else {
                self.symbol_value(*id)
            };
            let bind = match info.binding() {
                Binding::Weak => STB_WEAK,
                _ => STB_GLOBAL,
            };
            let stype = sym_type_code(info.sym_type());
            let shndx = if info.is_undef() || info.is_dyn() {
                SHN_UNDEF
            } else {
                shndx_of_addr(value)
            };
            write_sym(
                io,
                &mut out,
                name_off,
                value,
                info.size(),
                bind,
                stype,
                vis_code(info.visibility()),
                shndx,
            );
        }
        out
    }

    fn render_build_id(&self, size: u64) -> Vec<u8> {
        let io = self.backend.io;
        let payload = self.config.build_id.clone().unwrap_or_default();
        let mut out = Vec::new();
        io.write_word(&mut out, 4); // namesz "GNU\0"
        io.write_word(&mut out, payload.len() as u32);
        io.write_word(&mut out, 3); // NT_GNU_BUILD_ID
        out.extend_from_slice(b"GNU\0");
        out.extend_from_slice(&payload);
        while (out.len() as u64) < size {
            out.push(0);
        }
        out
    }

    /// Serialize the final image. Content emission dispatches on section
    /// kind; relocation order is taken as given.
    pub fn write_image(&mut self) -> Result<Vec<u8>> {
        let io = self.backend.io;
        let word = io.class.word_size();
        let (ehsize, phentsize, shentsize) = if word == 8 {
            (64usize, 56usize, 64usize)
        } else {
            (52, 32, 40)
        };

        // Raw binary output: loadable bytes only, in address order.
        if self.config.codegen == CodeGenType::Binary {
            let mut pieces: Vec<(u64, Vec<u8>)> = Vec::new();
            for idx in 0..self.out_sections.len() {
                let out = &self.out_sections[idx];
                if !out.flags.contains(SectionFlags::ALLOC) || !out.has_file_bytes() {
                    continue;
                }
                pieces.push((out.addr, self.render_members(idx)));
            }
            pieces.sort_by_key(|(addr, _)| *addr);
            let base = pieces.first().map(|(a, _)| *a).unwrap_or(0);
            let mut image = Vec::new();
            for (addr, bytes) in pieces {
                let at = (addr - base) as usize;
                if image.len() < at {
                    image.resize(at, 0);
                }
                image.extend_from_slice(&bytes);
            }
            return Ok(image);
        }

        // Output symbol table: null, then surviving locals in definition
        // order, then globals.
        let mut symtab: Vec<OutSymbol> = vec![OutSymbol {
            name: String::new(),
            value: 0,
            size: 0,
            bind: STB_LOCAL,
            stype: 0,
            vis: 0,
            shndx: SHN_UNDEF,
            id: None,
        }];
        let mut symtab_index: HashMap<SymbolId, usize> = HashMap::new();
        let locals: Vec<SymbolId> = self.pool.locals().to_vec();
        for id in locals {
            let info = self.pool.info(id);
            let Some(out) = info.out_symbol() else { continue };
            let sym = self.pool.symbol(out);
            if sym.should_ignore || info.sym_type() == SymType::File {
                continue;
            }
            symtab_index.insert(id, symtab.len());
            symtab.push(OutSymbol {
                name: info.name().to_string(),
                value: self.symbol_value(id),
                size: info.size(),
                bind: STB_LOCAL,
                stype: sym_type_code(info.sym_type()),
                vis: vis_code(info.visibility()),
                shndx: 0,
                id: Some(id),
            });
        }
        let first_global = symtab.len();
        let mut globals: Vec<(String, SymbolId)> = self
            .pool
            .globals()
            .map(|(n, id)| (n.clone(), id))
            .collect();
        globals.sort_by_key(|(_, id)| id.index());
        for (_, id) in globals {
            let info = self.pool.info(id);
            if let Some(out) = info.out_symbol() {
                if self.pool.symbol(out).should_ignore {
                    continue;
                }
            }
            let bind = match info.binding() {
                Binding::Weak => STB_WEAK,
                _ => STB_GLOBAL,
            };
            let shndx = if info.is_undef() || (info.is_dyn() && !info.is_define()) {
                SHN_UNDEF
            } else if info.binding() == Binding::Absolute {
                SHN_ABS
            } else {
                0
            };
            symtab_index.insert(id, symtab.len());
            symtab.push(OutSymbol {
                name: info.name().to_string(),
                value: if info.is_undef() && !info.is_dyn() {
                    0
                } else {
                    self.symbol_value(id)
                },
                size: info.size(),
                bind,
                stype: sym_type_code(info.sym_type()),
                vis: vis_code(info.visibility()),
                shndx,
                id: Some(id),
            });
        }

        // Section header records: null first, then the output sections.
        let mut shstrtab = StrTab::new();
        let mut records: Vec<ShdrRecord> = vec![ShdrRecord {
            name: String::new(),
            sh_type: SHT_NULL,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
            content: Vec::new(),
        }];
        let mut shndx_by_name: HashMap<String, u16> = HashMap::new();
        for (idx, out) in self.out_sections.iter().enumerate() {
            shndx_by_name.insert(out.name.clone(), (idx + 1) as u16);
        }
        let shndx_of_addr = |addr: u64| -> u16 {
            for (idx, out) in self.out_sections.iter().enumerate() {
                if out.flags.contains(SectionFlags::ALLOC)
                    && addr >= out.addr
                    && addr < out.addr + out.size.max(1)
                {
                    return (idx + 1) as u16;
                }
            }
            SHN_ABS
        };

        for idx in 0..self.out_sections.len() {
            let (name, sh_type, flags, addr, offset, size, align, entsize) = {
                let o = &self.out_sections[idx];
                (
                    o.name.clone(),
                    o.sh_type,
                    o.flags.bits(),
                    o.addr,
                    o.offset,
                    o.size,
                    o.align,
                    o.entsize,
                )
            };
            let content = if sh_type == SHT_NOBITS {
                Vec::new()
            } else if sh_type == crate::base::SHT_GROUP {
                self.render_group(idx)
            } else {
                match name.as_str() {
                    ".interp" => {
                        let mut v = self
                            .dynamic
                            .interp
                            .clone()
                            .unwrap_or_default()
                            .into_bytes();
                        v.push(0);
                        v
                    }
                    ".dynsym" => self.render_dynsym(&shndx_of_addr),
                    ".dynstr" => {
                        if self.dynamic.dynstr.is_empty() {
                            vec![0]
                        } else {
                            self.dynamic.dynstr.clone()
                        }
                    }
                    ".hash" => self.render_hash(),
                    ".dynamic" => self.render_dynamic(size),
                    ".rela.dyn" | ".rel.dyn" => self.serialize_dyn_relocs(&self.rela_dyn),
                    ".rela.plt" | ".rel.plt" => self.serialize_dyn_relocs(&self.rela_plt),
                    ".eh_frame_hdr" => self.render_eh_frame_hdr(),
                    ".note.gnu.build-id" => self.render_build_id(size),
                    _ => self.render_members(idx),
                }
            };
            let (link, info) = if sh_type == crate::base::SHT_GROUP {
                // link is patched to .symtab once its index is known.
                (0, self.group_signature_index(idx, &symtab_index))
            } else {
                match name.as_str() {
                    ".dynsym" => (shndx_by_name.get(".dynstr").copied().unwrap_or(0) as u32, 1),
                    ".hash" | ".rela.dyn" | ".rel.dyn" => {
                        (shndx_by_name.get(".dynsym").copied().unwrap_or(0) as u32, 0)
                    }
                    ".rela.plt" | ".rel.plt" => (
                        shndx_by_name.get(".dynsym").copied().unwrap_or(0) as u32,
                        shndx_by_name.get(".got.plt").copied().unwrap_or(0) as u32,
                    ),
                    ".dynamic" => (shndx_by_name.get(".dynstr").copied().unwrap_or(0) as u32, 0),
                    _ => (0, 0),
                }
            };
            records.push(ShdrRecord {
                name,
                sh_type,
                flags,
                addr,
                offset,
                size,
                link,
                info,
                align,
                entsize: if entsize != 0 {
                    entsize
                } else {
                    match sh_type {
                        crate::base::SHT_DYNSYM => if word == 8 { 24 } else { 16 },
                        crate::base::SHT_RELA => (word * 3) as u64,
                        crate::base::SHT_REL => (word * 2) as u64,
                        _ => 0,
                    }
                },
                content,
            });
        }

        // Partial links and --emit-relocs carry the input relocations
        // through, rewritten against the output symbol table.
        let emit_reloc_sections = self.config.is_partial() || self.config.emit_relocs;
        let mut reloc_records: Vec<ShdrRecord> = Vec::new();
        if emit_reloc_sections {
            for section in &self.sections {
                let Some(patched) = section.patches else { continue };
                if section.relocs.is_empty() {
                    continue;
                }
                let target = &self.sections[patched.index()];
                if target.is_dropped() {
                    continue;
                }
                let Some(out_id) = target.output else { continue };
                let out_name = self.out_sections[out_id.index()].name.clone();
                let mut content = Vec::new();
                for rid in &section.relocs {
                    let reloc = &self.relocs[rid.index()];
                    let target_ref = self.effective_target(*rid);
                    if !target_ref.is_real() {
                        continue;
                    }
                    let frag = &self.fragments[target_ref.frag.index()];
                    let r_offset = frag.offset + target_ref.offset;
                    let sym_index = reloc
                        .symbol
                        .and_then(|s| symtab_index.get(&s).copied())
                        .unwrap_or(0) as u64;
                    io.write_addr(&mut content, r_offset);
                    match io.class {
                        ElfClass::Elf64 => {
                            io.write_xword(&mut content, (sym_index << 32) | u64::from(reloc.rtype));
                            if self.backend.is_rela {
                                io.write_sxword(&mut content, reloc.addend);
                            }
                        }
                        _ => {
                            io.write_word(
                                &mut content,
                                ((sym_index as u32) << 8) | (reloc.rtype & 0xff),
                            );
                            if self.backend.is_rela {
                                io.write_sword(&mut content, reloc.addend as i32);
                            }
                        }
                    }
                }
                if content.is_empty() {
                    continue;
                }
                let prefix = if self.backend.is_rela { ".rela" } else { ".rel" };
                reloc_records.push(ShdrRecord {
                    name: format!("{prefix}{out_name}"),
                    sh_type: if self.backend.is_rela {
                        crate::base::SHT_RELA
                    } else {
                        crate::base::SHT_REL
                    },
                    flags: 0,
                    addr: 0,
                    offset: 0,
                    size: content.len() as u64,
                    link: 0, // fixed up below to .symtab
                    info: u32::from(shndx_by_name.get(&out_name).copied().unwrap_or(0)),
                    align: word as u64,
                    entsize: if self.backend.is_rela {
                        (word * 3) as u64
                    } else {
                        (word * 2) as u64
                    },
                    content,
                });
            }
        }

        // .symtab needs section indices for defined symbols.
        let symtab_shndx = records.len() + reloc_records.len();
        let strtab_shndx = symtab_shndx + 1;
        let mut strtab = StrTab::new();
        let mut symtab_content = Vec::new();
        for sym in &mut symtab {
            if sym.shndx == 0 && sym.id.is_some() {
                let id = sym.id.unwrap_or(SymbolId::new(0));
                let info = self.pool.info(id);
                sym.shndx = if info.is_undef() && !info.is_define() {
                    SHN_UNDEF
                } else if info.binding() == Binding::Absolute {
                    SHN_ABS
                } else {
                    shndx_of_addr(sym.value)
                };
            }
            let name_off = strtab.intern(&sym.name) as u32;
            write_sym(
                io,
                &mut symtab_content,
                name_off,
                sym.value,
                sym.size,
                sym.bind,
                sym.stype,
                sym.vis,
                sym.shndx,
            );
        }

        for record in &mut records {
            if record.sh_type == crate::base::SHT_GROUP {
                record.link = symtab_shndx as u32;
            }
        }
        for mut record in reloc_records {
            record.link = symtab_shndx as u32;
            records.push(record);
        }
        records.push(ShdrRecord {
            name: ".symtab".into(),
            sh_type: SHT_SYMTAB,
            flags: 0,
            addr: 0,
            offset: 0,
            size: symtab_content.len() as u64,
            link: strtab_shndx as u32,
            info: first_global as u32,
            align: word as u64,
            entsize: if word == 8 { 24 } else { 16 },
            content: symtab_content,
        });
        records.push(ShdrRecord {
            name: ".strtab".into(),
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: 0,
            size: strtab.bytes().len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
            content: strtab.bytes().to_vec(),
        });
        // .shstrtab last; intern every name first.
        for record in &records {
            shstrtab.intern(&record.name);
        }
        shstrtab.intern(".shstrtab");
        records.push(ShdrRecord {
            name: ".shstrtab".into(),
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: 0,
            size: shstrtab.bytes().len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
            content: shstrtab.bytes().to_vec(),
        });
        let shstrndx = records.len() - 1;

        // Place the table sections after the laid-out content.
        let mut cursor = self.content_end().max((ehsize + self.segments.len() * phentsize) as u64);
        for record in &mut records {
            let placed = record.offset != 0 || record.name.is_empty();
            if placed && record.sh_type != SHT_NULL {
                continue;
            }
            if record.sh_type == SHT_NULL {
                continue;
            }
            cursor = crate::base::align_up(cursor, record.align.max(1));
            record.offset = cursor;
            if record.sh_type != SHT_NOBITS {
                record.size = record.content.len() as u64;
                cursor += record.size;
            }
        }
        let shoff = crate::base::align_up(cursor, 8);

        // Assemble: header, program headers, contents, headers table.
        let total = shoff as usize + records.len() * shentsize;
        let mut image = vec![0u8; total];

        let e_type = match self.config.codegen {
            CodeGenType::Object => ET_REL,
            CodeGenType::DynObj => ET_DYN,
            _ => {
                if self.config.pie {
                    ET_DYN
                } else {
                    ET_EXEC
                }
            }
        };
        let mut ehdr = Vec::with_capacity(ehsize);
        ehdr.extend_from_slice(b"\x7fELF");
        ehdr.push(io.class as u8);
        ehdr.push(io.encoding as u8);
        ehdr.push(1); // EV_CURRENT
        ehdr.push(0); // ELFOSABI_NONE
        ehdr.extend_from_slice(&[0u8; 8]);
        io.write_half(&mut ehdr, e_type);
        io.write_half(&mut ehdr, self.config.machine as u16);
        io.write_word(&mut ehdr, 1);
        io.write_addr(&mut ehdr, self.entry_address());
        io.write_addr(&mut ehdr, if self.segments.is_empty() { 0 } else { ehsize as u64 });
        io.write_addr(&mut ehdr, shoff);
        io.write_word(&mut ehdr, self.backend.e_flags);
        io.write_half(&mut ehdr, ehsize as u16);
        io.write_half(&mut ehdr, phentsize as u16);
        io.write_half(&mut ehdr, self.segments.len() as u16);
        io.write_half(&mut ehdr, shentsize as u16);
        io.write_half(&mut ehdr, records.len() as u16);
        io.write_half(&mut ehdr, shstrndx as u16);
        image[..ehdr.len()].copy_from_slice(&ehdr);

        let mut phdrs = Vec::new();
        for seg in &self.segments {
            match io.class {
                ElfClass::Elf64 => {
                    io.write_word(&mut phdrs, seg.p_type);
                    io.write_word(&mut phdrs, seg.flags.bits());
                    io.write_xword(&mut phdrs, seg.offset);
                    io.write_xword(&mut phdrs, seg.vaddr);
                    io.write_xword(&mut phdrs, seg.paddr);
                    io.write_xword(&mut phdrs, seg.filesz);
                    io.write_xword(&mut phdrs, seg.memsz);
                    io.write_xword(&mut phdrs, seg.align);
                }
                _ => {
                    io.write_word(&mut phdrs, seg.p_type);
                    io.write_word(&mut phdrs, seg.offset as u32);
                    io.write_word(&mut phdrs, seg.vaddr as u32);
                    io.write_word(&mut phdrs, seg.paddr as u32);
                    io.write_word(&mut phdrs, seg.filesz as u32);
                    io.write_word(&mut phdrs, seg.memsz as u32);
                    io.write_word(&mut phdrs, seg.flags.bits());
                    io.write_word(&mut phdrs, seg.align as u32);
                }
            }
        }
        if !phdrs.is_empty() {
            image[ehsize..ehsize + phdrs.len()].copy_from_slice(&phdrs);
        }

        // Contents in file-offset order; the vector was sized for them.
        for record in &records {
            if record.sh_type == SHT_NULL || record.sh_type == SHT_NOBITS {
                continue;
            }
            let at = record.offset as usize;
            if at + record.content.len() > image.len() {
                return Err(Error::Layout {
                    reason: format!("section {} overruns the image", record.name),
                });
            }
            image[at..at + record.content.len()].copy_from_slice(&record.content);
        }

        // The section header table.
        let mut shdrs = Vec::new();
        for record in &records {
            let name_off = shstrtab.intern(&record.name) as u32;
            match io.class {
                ElfClass::Elf64 => {
                    io.write_word(&mut shdrs, name_off);
                    io.write_word(&mut shdrs, record.sh_type);
                    io.write_xword(&mut shdrs, record.flags);
                    io.write_xword(&mut shdrs, record.addr);
                    io.write_xword(&mut shdrs, record.offset);
                    io.write_xword(&mut shdrs, record.size);
                    io.write_word(&mut shdrs, record.link);
                    io.write_word(&mut shdrs, record.info);
                    io.write_xword(&mut shdrs, record.align);
                    io.write_xword(&mut shdrs, record.entsize);
                }
                _ => {
                    io.write_word(&mut shdrs, name_off);
                    io.write_word(&mut shdrs, record.sh_type);
                    io.write_word(&mut shdrs, record.flags as u32);
                    io.write_word(&mut shdrs, record.addr as u32);
                    io.write_word(&mut shdrs, record.offset as u32);
                    io.write_word(&mut shdrs, record.size as u32);
                    io.write_word(&mut shdrs, record.link);
                    io.write_word(&mut shdrs, record.info);
                    io.write_word(&mut shdrs, record.align as u32);
                    io.write_word(&mut shdrs, record.entsize as u32);
                }
            }
        }
        image[shoff as usize..shoff as usize + shdrs.len()].copy_from_slice(&shdrs);

        Ok(image)
    }
}

fn sym_type_code(t: SymType) -> u8 {
    match t {
        SymType::NoType => 0,
        SymType::Object => 1,
        SymType::Function => 2,
        SymType::Section => 3,
        SymType::File => 4,
        SymType::CommonBlock => 5,
        SymType::ThreadLocal => 6,
        SymType::IndirectFunc => 10,
    }
}

fn vis_code(v: Visibility) -> u8 {
    match v {
        Visibility::Default => 0,
        Visibility::Internal => 1,
        Visibility::Hidden => 2,
        Visibility::Protected => 3,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn strtab_interns_once() {
        let mut tab = StrTab::new();
        let a = tab.intern("alpha");
        let b = tab.intern("beta");
        assert_eq!(tab.intern("alpha"), a);
        assert_ne!(a, b);
        assert_eq!(tab.intern(""), 0);
        assert_eq!(&tab.bytes()[a..a + 5], b"alpha");
    }

    #[test]
    fn elf_hash_matches_reference_values() {
        // Reference values from the System V ABI algorithm.
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("printf"), 0x077905a6);
        assert_eq!(elf_hash("exit"), 0x0006cf04);
    }
}
