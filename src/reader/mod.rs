//! ELF object reading: header translation, section tables, symbols and
//! relocation lists, producing a flat view the builder folds into the
//! module arenas

use crate::base::{
    ElfClass, ElfDataEncoding, ElfMachine, IoCtx, SectionFlags, DT_NEEDED, DT_SONAME, SHT_DYNAMIC,
    SHT_DYNSYM, SHT_NOBITS, SHT_REL, SHT_RELA, SHT_SYMTAB,
};
use crate::error::{Error, Result};
use crate::input::FileKind;
use num_traits::FromPrimitive;

#[derive(Debug, Clone)]
/// One section header translated out of an input file, with its bytes
pub struct RawSection {
    /// Name resolved through shstrtab
    pub name: String,
    /// `sh_type`
    pub sh_type: u32,
    /// `sh_flags`
    pub flags: SectionFlags,
    /// `sh_addr`
    pub addr: u64,
    /// `sh_size`
    pub size: u64,
    /// `sh_link`
    pub link: u32,
    /// `sh_info`
    pub info: u32,
    /// `sh_addralign`
    pub align: u64,
    /// `sh_entsize`
    pub entsize: u64,
    /// Content bytes (empty for SHT_NOBITS)
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
/// One symbol-table entry as read
pub struct RawSymbol {
    /// Name resolved through the linked string table
    pub name: String,
    /// `st_value`
    pub value: u64,
    /// `st_size`
    pub size: u64,
    /// `st_shndx`
    pub shndx: u16,
    /// Binding half of `st_info`
    pub bind: u8,
    /// Type half of `st_info`
    pub stype: u8,
    /// Visibility bits of `st_other`
    pub vis: u8,
}

#[derive(Debug, Clone, Copy)]
/// One relocation entry as read
pub struct RawReloc {
    /// `r_offset`
    pub offset: u64,
    /// Type extracted from `r_info`
    pub rtype: u32,
    /// Symbol index extracted from `r_info`
    pub symidx: u32,
    /// Explicit addend; REL entries leave this zero for the applier to
    /// fold from the field bytes
    pub addend: i64,
}

#[derive(Debug, Clone, Default)]
/// Everything read out of one ELF input
pub struct ObjectContents {
    /// Machine from the header
    pub machine: Option<ElfMachine>,
    /// `e_type`
    pub e_type: u16,
    /// Sections in header order (index 0 is the null section)
    pub sections: Vec<RawSection>,
    /// Symbols from SHT_SYMTAB (objects) or SHT_DYNSYM (shared objects)
    pub symbols: Vec<RawSymbol>,
    /// Number of local symbols (`sh_info` of the symbol table)
    pub first_global: usize,
    /// Per-section relocations: (patched section index, entries, is_rela)
    pub relocs: Vec<(usize, Vec<RawReloc>, bool)>,
    /// DT_SONAME of a shared object
    pub soname: Option<String>,
    /// DT_NEEDED entries of a shared object
    pub needed: Vec<String>,
}

fn strz(table: &[u8], offset: usize) -> String {
    let tail = table.get(offset..).unwrap_or(&[]);
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).to_string()
}

struct HeaderLayout {
    shoff_at: usize,
    shentsize_at: usize,
    shnum_at: usize,
    shstrndx_at: usize,
}

fn header_layout(class: ElfClass) -> HeaderLayout {
    match class {
        ElfClass::Elf64 => HeaderLayout {
            shoff_at: 40,
            shentsize_at: 58,
            shnum_at: 60,
            shstrndx_at: 62,
        },
        _ => HeaderLayout {
            shoff_at: 32,
            shentsize_at: 46,
            shnum_at: 48,
            shstrndx_at: 50,
        },
    }
}

/// Read an ELF relocatable object, shared object, or executable into a
/// flat [`ObjectContents`]. `expected` pins the machine/class/encoding of
/// the link; a mismatching input is an input error.
pub fn read_object(path: &str, bytes: &[u8], expected: IoCtx) -> Result<ObjectContents> {
    if bytes.len() < 52 || !bytes.starts_with(b"\x7fELF") {
        return Err(Error::input(path, "not an ELF file"));
    }
    let class = ElfClass::from_u8(bytes[4])
        .ok_or_else(|| Error::input(path, format!("bad EI_CLASS {}", bytes[4])))?;
    let encoding = ElfDataEncoding::from_u8(bytes[5])
        .ok_or_else(|| Error::input(path, format!("bad EI_DATA {}", bytes[5])))?;
    if class != expected.class || encoding != expected.encoding {
        return Err(Error::input(
            path,
            "file class or endianness does not match the link target",
        ));
    }
    let io = IoCtx { class, encoding };

    let e_type = io.read_half(&bytes[16..])?;
    let machine_raw = io.read_half(&bytes[18..])?;
    let machine = ElfMachine::from_u16(machine_raw);

    let layout = header_layout(class);
    let shoff = io.read_addr(&bytes[layout.shoff_at..])? as usize;
    let shentsize = io.read_half(&bytes[layout.shentsize_at..])? as usize;
    let shnum = io.read_half(&bytes[layout.shnum_at..])? as usize;
    let shstrndx = io.read_half(&bytes[layout.shstrndx_at..])? as usize;

    if shoff == 0 || shnum == 0 {
        return Ok(ObjectContents {
            machine,
            e_type,
            ..ObjectContents::default()
        });
    }
    if shoff + shnum * shentsize > bytes.len() {
        return Err(Error::input(path, "section header table overruns the file"));
    }

    struct Shdr {
        name_off: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        align: u64,
        entsize: u64,
    }

    let read_shdr = |at: usize| -> Result<Shdr> {
        let h = &bytes[at..];
        Ok(match class {
            ElfClass::Elf64 => Shdr {
                name_off: io.read_word(h)?,
                sh_type: io.read_word(&h[4..])?,
                flags: io.read_xword(&h[8..])?,
                addr: io.read_xword(&h[16..])?,
                offset: io.read_xword(&h[24..])?,
                size: io.read_xword(&h[32..])?,
                link: io.read_word(&h[40..])?,
                info: io.read_word(&h[44..])?,
                align: io.read_xword(&h[48..])?,
                entsize: io.read_xword(&h[56..])?,
            },
            _ => Shdr {
                name_off: io.read_word(h)?,
                sh_type: io.read_word(&h[4..])?,
                flags: u64::from(io.read_word(&h[8..])?),
                addr: u64::from(io.read_word(&h[12..])?),
                offset: u64::from(io.read_word(&h[16..])?),
                size: u64::from(io.read_word(&h[20..])?),
                link: io.read_word(&h[24..])?,
                info: io.read_word(&h[28..])?,
                align: u64::from(io.read_word(&h[32..])?),
                entsize: u64::from(io.read_word(&h[36..])?),
            },
        })
    };

    let headers: Vec<Shdr> = (0..shnum)
        .map(|i| read_shdr(shoff + i * shentsize))
        .collect::<Result<_>>()?;

    let shstrtab = headers
        .get(shstrndx)
        .map(|h| {
            let start = h.offset as usize;
            let end = start + h.size as usize;
            bytes.get(start..end).unwrap_or(&[]).to_vec()
        })
        .unwrap_or_default();

    let mut contents = ObjectContents {
        machine,
        e_type,
        ..ObjectContents::default()
    };

    for header in &headers {
        let data = if header.sh_type == SHT_NOBITS {
            Vec::new()
        } else {
            let start = header.offset as usize;
            let end = start + header.size as usize;
            if end > bytes.len() {
                return Err(Error::input(
                    path,
                    format!("section `{}` overruns the file", strz(&shstrtab, header.name_off as usize)),
                ));
            }
            bytes[start..end].to_vec()
        };
        contents.sections.push(RawSection {
            name: strz(&shstrtab, header.name_off as usize),
            sh_type: header.sh_type,
            flags: SectionFlags::from_bits_truncate(header.flags),
            addr: header.addr,
            size: header.size,
            link: header.link,
            info: header.info,
            align: header.align,
            entsize: header.entsize,
            data,
        });
    }

    // Pick the symbol table: the static one for relocatables, the dynamic
    // one for shared objects being linked against.
    let want_dynsym = FileKind::SharedElf == classify_kind(e_type);
    let symtab_type = if want_dynsym { SHT_DYNSYM } else { SHT_SYMTAB };
    if let Some((symtab_idx, symtab)) = contents
        .sections
        .iter()
        .enumerate()
        .find(|(_, s)| s.sh_type == symtab_type)
    {
        let strtab = contents
            .sections
            .get(symtab.link as usize)
            .map(|s| s.data.clone())
            .unwrap_or_default();
        contents.first_global = symtab.info as usize;
        let entsize = if class == ElfClass::Elf64 { 24 } else { 16 };
        let count = symtab.data.len() / entsize;
        let symtab_data = contents.sections[symtab_idx].data.clone();
        for i in 0..count {
            let e = &symtab_data[i * entsize..];
            let sym = match class {
                ElfClass::Elf64 => RawSymbol {
                    name: strz(&strtab, io.read_word(e)? as usize),
                    bind: e[4] >> 4,
                    stype: e[4] & 0xf,
                    vis: e[5] & 0x3,
                    shndx: io.read_half(&e[6..])?,
                    value: io.read_xword(&e[8..])?,
                    size: io.read_xword(&e[16..])?,
                },
                _ => RawSymbol {
                    name: strz(&strtab, io.read_word(e)? as usize),
                    value: u64::from(io.read_word(&e[4..])?),
                    size: u64::from(io.read_word(&e[8..])?),
                    bind: e[12] >> 4,
                    stype: e[12] & 0xf,
                    vis: e[13] & 0x3,
                    shndx: io.read_half(&e[14..])?,
                },
            };
            contents.symbols.push(sym);
        }
    }

    // Relocation sections: keep the raw vectors; targets are bound after
    // all sections are indexed.
    for section in &contents.sections {
        if section.sh_type != SHT_RELA && section.sh_type != SHT_REL {
            continue;
        }
        let is_rela = section.sh_type == SHT_RELA;
        let entsize = match (class, is_rela) {
            (ElfClass::Elf64, true) => 24,
            (ElfClass::Elf64, false) => 16,
            (_, true) => 12,
            (_, false) => 8,
        };
        let count = section.data.len() / entsize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let e = &section.data[i * entsize..];
            let entry = match class {
                ElfClass::Elf64 => {
                    let info = io.read_xword(&e[8..])?;
                    RawReloc {
                        offset: io.read_xword(e)?,
                        rtype: (info & 0xffff_ffff) as u32,
                        symidx: (info >> 32) as u32,
                        addend: if is_rela { io.read_sxword(&e[16..])? } else { 0 },
                    }
                }
                _ => {
                    let info = io.read_word(&e[4..])?;
                    RawReloc {
                        offset: u64::from(io.read_word(e)?),
                        rtype: info & 0xff,
                        symidx: info >> 8,
                        addend: if is_rela {
                            i64::from(io.read_sword(&e[8..])?)
                        } else {
                            0
                        },
                    }
                }
            };
            entries.push(entry);
        }
        contents.relocs.push((section.info as usize, entries, is_rela));
    }

    // Shared objects: SONAME and NEEDED from the dynamic section.
    if want_dynsym {
        if let Some(dynamic) = contents.sections.iter().find(|s| s.sh_type == SHT_DYNAMIC) {
            let strtab = contents
                .sections
                .get(dynamic.link as usize)
                .map(|s| s.data.clone())
                .unwrap_or_default();
            let entsize = class.word_size() * 2;
            for chunk in dynamic.data.chunks_exact(entsize) {
                let tag = io.read_addr(chunk)?;
                let val = io.read_addr(&chunk[class.word_size()..])?;
                if tag == DT_SONAME {
                    contents.soname = Some(strz(&strtab, val as usize));
                } else if tag == DT_NEEDED {
                    contents.needed.push(strz(&strtab, val as usize));
                }
            }
        }
    }

    Ok(contents)
}

fn classify_kind(e_type: u16) -> FileKind {
    match e_type {
        3 => FileKind::SharedElf,
        2 => FileKind::ExecutableElf,
        _ => FileKind::ObjectElf,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Hand-build a minimal ELF64 relocatable: null section, .text with
    // one RELA entry, .symtab, .strtab, .shstrtab.
    fn tiny_object() -> Vec<u8> {
        let io = IoCtx::elf64_le();
        let mut out = Vec::new();
        // e_ident
        out.extend_from_slice(b"\x7fELF\x02\x01\x01\x00");
        out.extend_from_slice(&[0u8; 8]);
        io.write_half(&mut out, 1); // ET_REL
        io.write_half(&mut out, 183); // AArch64
        io.write_word(&mut out, 1);
        io.write_xword(&mut out, 0); // entry
        io.write_xword(&mut out, 0); // phoff
        let shoff_at = out.len();
        io.write_xword(&mut out, 0); // shoff patched later
        io.write_word(&mut out, 0); // flags
        io.write_half(&mut out, 64); // ehsize
        io.write_half(&mut out, 0);
        io.write_half(&mut out, 0);
        io.write_half(&mut out, 64); // shentsize
        io.write_half(&mut out, 6); // shnum
        io.write_half(&mut out, 5); // shstrndx

        // Contents.
        let text_off = out.len();
        let text = [0u8; 8];
        out.extend_from_slice(&text);

        let rela_off = out.len();
        io.write_xword(&mut out, 0); // r_offset
        io.write_xword(&mut out, (1u64 << 32) | 283); // sym 1, CALL26
        io.write_sxword(&mut out, 0);

        let symtab_off = out.len();
        // Null symbol.
        out.extend_from_slice(&[0u8; 24]);
        // Global func `f` at .text+0.
        io.write_word(&mut out, 1); // name offset in .strtab
        out.push((1 << 4) | 2); // GLOBAL FUNC
        out.push(0);
        io.write_half(&mut out, 1); // shndx = .text
        io.write_xword(&mut out, 0);
        io.write_xword(&mut out, 4);

        let strtab_off = out.len();
        out.extend_from_slice(b"\0f\0");
        let strtab_len = 3u64;

        let shstr_off = out.len();
        let shstrtab = b"\0.text\0.rela.text\0.symtab\0.strtab\0.shstrtab\0";
        out.extend_from_slice(shstrtab);

        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;
        let mut patched = out.clone();
        let mut shoff_bytes = Vec::new();
        io.write_xword(&mut shoff_bytes, shoff);
        patched[shoff_at..shoff_at + 8].copy_from_slice(&shoff_bytes);
        out = patched;

        let mut shdr = |name: u32,
                        sh_type: u32,
                        flags: u64,
                        offset: u64,
                        size: u64,
                        link: u32,
                        info: u32,
                        align: u64,
                        entsize: u64,
                        out: &mut Vec<u8>| {
            io.write_word(out, name);
            io.write_word(out, sh_type);
            io.write_xword(out, flags);
            io.write_xword(out, 0); // addr
            io.write_xword(out, offset);
            io.write_xword(out, size);
            io.write_word(out, link);
            io.write_word(out, info);
            io.write_xword(out, align);
            io.write_xword(out, entsize);
        };

        shdr(0, 0, 0, 0, 0, 0, 0, 0, 0, &mut out);
        shdr(1, 1, 0x6, text_off as u64, 8, 0, 0, 4, 0, &mut out); // .text
        shdr(7, 4, 0, rela_off as u64, 24, 3, 1, 8, 24, &mut out); // .rela.text
        shdr(18, 2, 0, symtab_off as u64, 48, 4, 1, 8, 24, &mut out); // .symtab
        shdr(26, 3, 0, strtab_off as u64, strtab_len, 0, 0, 1, 0, &mut out); // .strtab
        shdr(34, 3, 0, shstr_off as u64, shstrtab.len() as u64, 0, 0, 1, 0, &mut out);
        out
    }

    #[test]
    fn reads_sections_symbols_and_relocs() {
        let bytes = tiny_object();
        let contents = read_object("tiny.o", &bytes, IoCtx::elf64_le()).unwrap();
        assert_eq!(contents.machine, Some(ElfMachine::AArch64));
        assert_eq!(contents.e_type, 1);
        assert_eq!(contents.sections.len(), 6);
        assert_eq!(contents.sections[1].name, ".text");
        assert!(contents.sections[1].flags.contains(SectionFlags::ALLOC));

        assert_eq!(contents.symbols.len(), 2);
        assert_eq!(contents.symbols[1].name, "f");
        assert_eq!(contents.symbols[1].bind, 1);
        assert_eq!(contents.symbols[1].stype, 2);
        assert_eq!(contents.first_global, 1);

        assert_eq!(contents.relocs.len(), 1);
        let (target, entries, is_rela) = &contents.relocs[0];
        assert_eq!(*target, 1);
        assert!(is_rela);
        assert_eq!(entries[0].rtype, 283);
        assert_eq!(entries[0].symidx, 1);
    }

    #[test]
    fn class_mismatch_is_rejected() {
        let bytes = tiny_object();
        assert!(read_object("tiny.o", &bytes, IoCtx::elf32_le()).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(read_object("x", b"not elf at all............................................", IoCtx::elf64_le()).is_err());
    }
}
