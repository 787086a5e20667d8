//! Input-file abstraction: classification by magic, archive member
//! demultiplexing, and the symdef text format

use crate::base::InputId;
use crate::error::{Error, Result};

/// `!<arch>\n`
const AR_MAGIC: &[u8] = b"!<arch>\n";
/// `!<thin>\n`, member paths instead of bytes
const THIN_AR_MAGIC: &[u8] = b"!<thin>\n";
/// LLVM bitcode wrapper magic
const BITCODE_MAGIC: &[u8] = b"BC\xc0\xde";
/// Leading token of a symdef file
const SYMDEF_SENTINEL: &[u8] = b"#<SYMDEFS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Classification of an input file by content
pub enum FileKind {
    /// ELF relocatable object
    ObjectElf,
    /// ELF shared object
    SharedElf,
    /// ELF executable (inspected, never linked in)
    ExecutableElf,
    /// `ar` archive, regular or thin
    Archive,
    /// One member carved out of an archive
    ArchiveMember,
    /// LLVM bitcode, handed to the LTO callback opaquely
    Bitcode,
    /// Linker script text
    Script,
    /// Symdef text declaring `address type name` triples
    SymDef,
    /// Raw bytes wrapped as a single read-only data section
    Binary,
    /// Synthesized by the core itself
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Where the path came from, for reproducer mapping and diagnostics
pub enum PathCategory {
    #[default]
    /// Named on the command line
    CommandLine,
    /// Found through a `-L` search
    SearchPath,
    /// Pulled out of an archive
    FromArchive,
    /// Fabricated by the core
    Internal,
}

#[derive(Debug, Clone)]
/// One input file. Owns its bytes; an archive member instead names a
/// range of its parent archive's bytes. Lives from command-line
/// processing until the image is written.
pub struct InputFile {
    /// Display path
    pub path: String,
    /// Content classification
    pub kind: FileKind,
    /// Owned content; empty for members, which use `parent` + `range`
    pub bytes: Vec<u8>,
    /// Parent archive for an [`FileKind::ArchiveMember`]
    pub parent: Option<InputId>,
    /// Byte range inside the parent archive
    pub range: Option<(usize, usize)>,
    /// Lazy-archive semantics: the member's symbols joined the link
    pub used: bool,
    /// A dynamic object became needed to satisfy an undef
    pub needed: bool,
    /// DT_SONAME of a shared object, once its dynamic section is read
    pub soname: Option<String>,
    /// Path provenance
    pub category: PathCategory,
}

impl InputFile {
    /// Wrap owned bytes that were already classified
    pub fn new(path: impl Into<String>, kind: FileKind, bytes: Vec<u8>) -> Self {
        InputFile {
            path: path.into(),
            kind,
            bytes,
            parent: None,
            range: None,
            used: false,
            needed: false,
            soname: None,
            category: PathCategory::default(),
        }
    }

    /// Classify `bytes` and wrap them. `force_binary` is the `--binary`
    /// override which wins over any magic.
    pub fn classify(path: impl Into<String>, bytes: Vec<u8>, force_binary: bool) -> Self {
        let kind = if force_binary {
            FileKind::Binary
        } else {
            classify_bytes(&bytes)
        };
        InputFile::new(path, kind, bytes)
    }

    /// Build a member record referencing `parent`'s bytes
    pub fn member(
        path: impl Into<String>,
        kind: FileKind,
        parent: InputId,
        range: (usize, usize),
    ) -> Self {
        let mut f = InputFile::new(path, kind, Vec::new());
        f.parent = Some(parent);
        f.range = Some(range);
        f.category = PathCategory::FromArchive;
        f
    }

    /// True for any of the three ELF kinds
    pub fn is_elf(&self) -> bool {
        matches!(
            self.kind,
            FileKind::ObjectElf | FileKind::SharedElf | FileKind::ExecutableElf
        )
    }

    /// True when symbols from this file contribute to resolution up front
    /// (archives contribute lazily, member by member)
    pub fn is_eager(&self) -> bool {
        !matches!(self.kind, FileKind::Archive)
    }
}

/// Inspect leading magic bytes. Anything unrecognized is assumed to be
/// linker-script text, matching the command-line contract.
pub fn classify_bytes(bytes: &[u8]) -> FileKind {
    if bytes.len() >= 20 && bytes.starts_with(b"\x7fELF") {
        // e_type sits at offset 16 and is always 16-bit; honoring the
        // encoding byte keeps big-endian objects classified correctly.
        let e_type = match bytes[5] {
            2 => u16::from_be_bytes([bytes[16], bytes[17]]),
            _ => u16::from_le_bytes([bytes[16], bytes[17]]),
        };
        return match e_type {
            1 => FileKind::ObjectElf,
            2 => FileKind::ExecutableElf,
            3 => FileKind::SharedElf,
            _ => FileKind::ObjectElf,
        };
    }
    if bytes.starts_with(AR_MAGIC) || bytes.starts_with(THIN_AR_MAGIC) {
        return FileKind::Archive;
    }
    if bytes.starts_with(BITCODE_MAGIC) {
        return FileKind::Bitcode;
    }
    if bytes.starts_with(SYMDEF_SENTINEL) {
        return FileKind::SymDef;
    }
    FileKind::Script
}

#[derive(Debug, Clone)]
/// One member of an archive as enumerated by the walker
pub struct ArchiveMember {
    /// Member name after long-name resolution
    pub name: String,
    /// Byte range of the member's content inside the archive; thin
    /// archives instead carry the member path
    pub range: Option<(usize, usize)>,
    /// Path to load for a thin-archive member
    pub thin_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
/// The parsed shape of an archive: ordered members plus the symbol index
/// mapping defined names to the member that defines them, for lazy loads
pub struct ArchiveIndex {
    /// Members in file order
    pub members: Vec<ArchiveMember>,
    /// (defined name, member index) pairs from the symbol table
    pub defines: Vec<(String, usize)>,
    /// The archive carries paths, not bytes
    pub thin: bool,
}

impl ArchiveIndex {
    /// Member that defines `name`, if the index knows one
    pub fn member_defining(&self, name: &str) -> Option<usize> {
        self.defines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, idx)| *idx)
    }
}

fn parse_decimal(field: &[u8]) -> usize {
    let text = String::from_utf8_lossy(field);
    text.trim().parse().unwrap_or(0)
}

/// Walk a Unix `ar` archive: the global symbol table member (`/`), the
/// long-name table (`//`), then the ordinary members. Offsets recorded in
/// the symbol table are resolved to member indices afterwards.
pub fn walk_archive(path: &str, bytes: &[u8]) -> Result<ArchiveIndex> {
    let thin = bytes.starts_with(THIN_AR_MAGIC);
    if !thin && !bytes.starts_with(AR_MAGIC) {
        return Err(Error::input(path, "not an archive"));
    }

    let mut index = ArchiveIndex {
        thin,
        ..ArchiveIndex::default()
    };
    let mut long_names: Vec<u8> = Vec::new();
    let mut symtab: Vec<u8> = Vec::new();
    let mut offset_of_member: Vec<(usize, usize)> = Vec::new();

    let mut pos = AR_MAGIC.len();
    while pos + 60 <= bytes.len() {
        let header = &bytes[pos..pos + 60];
        if &header[58..60] != b"`\n" {
            return Err(Error::input(path, "corrupt archive member header"));
        }
        let raw_name = &header[0..16];
        let size = parse_decimal(&header[48..58]);
        let content_start = pos + 60;
        let header_pos = pos;
        // Thin archive members store no content bytes in the file.
        let stores_bytes = !thin || raw_name.starts_with(b"/");
        let content_end = if stores_bytes {
            content_start + size
        } else {
            content_start
        };
        if stores_bytes && content_end > bytes.len() {
            return Err(Error::input(path, "truncated archive member"));
        }

        let name_text = String::from_utf8_lossy(raw_name).trim_end().to_string();
        if name_text == "/" {
            symtab = bytes[content_start..content_end].to_vec();
        } else if name_text == "//" {
            long_names = bytes[content_start..content_end].to_vec();
        } else {
            let resolved = if let Some(rest) = name_text.strip_prefix('/') {
                // "/<offset>" points into the long-name table.
                let start: usize = rest.trim().parse().unwrap_or(0);
                let tail = &long_names[start.min(long_names.len())..];
                let end = tail
                    .iter()
                    .position(|b| *b == b'\n' || *b == b'/')
                    .unwrap_or(tail.len());
                String::from_utf8_lossy(&tail[..end]).to_string()
            } else {
                name_text.trim_end_matches('/').to_string()
            };
            offset_of_member.push((header_pos, index.members.len()));
            index.members.push(ArchiveMember {
                name: resolved.clone(),
                range: if thin {
                    None
                } else {
                    Some((content_start, content_end))
                },
                thin_path: if thin { Some(resolved) } else { None },
            });
        }

        pos = content_end + (content_end & 1);
    }

    // System V symbol table: a count, that many 4-byte big-endian member
    // header offsets, then the NUL-separated names.
    if symtab.len() >= 4 {
        let count = u32::from_be_bytes([symtab[0], symtab[1], symtab[2], symtab[3]]) as usize;
        let offsets_end = 4 + count * 4;
        if symtab.len() >= offsets_end {
            let mut names = symtab[offsets_end..].split(|b| *b == 0);
            for i in 0..count {
                let at = 4 + i * 4;
                let member_off = u32::from_be_bytes([
                    symtab[at],
                    symtab[at + 1],
                    symtab[at + 2],
                    symtab[at + 3],
                ]) as usize;
                let Some(name) = names.next() else { break };
                if name.is_empty() {
                    continue;
                }
                if let Some((_, member_idx)) = offset_of_member
                    .iter()
                    .find(|(header_pos, _)| *header_pos == member_off)
                {
                    index
                        .defines
                        .push((String::from_utf8_lossy(name).to_string(), *member_idx));
                }
            }
        }
    }

    Ok(index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One `address type name` triple from a symdef file
pub struct SymDefEntry {
    /// The declared absolute address
    pub address: u64,
    /// The single-letter type code as written (T, D, B, ...)
    pub type_code: char,
    /// The symbol name
    pub name: String,
}

/// Parse a symdef file: triples live between the `#<SYMDEFS` sentinel
/// line and the end; `#` starts a comment anywhere.
pub fn parse_symdefs(path: &str, text: &str) -> Result<Vec<SymDefEntry>> {
    if !text.starts_with("#<SYMDEFS") {
        return Err(Error::input(path, "missing #<SYMDEFS sentinel"));
    }
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate().skip(1) {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(ty), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::input(
                path,
                format!("line {}: expected `address type name`", lineno + 1),
            ));
        };
        let address = if let Some(hex) = addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16)
        } else {
            addr.parse()
        }
        .map_err(|_| Error::input(path, format!("line {}: bad address `{addr}`", lineno + 1)))?;
        let type_code = ty.chars().next().unwrap_or('?');
        entries.push(SymDefEntry {
            address,
            type_code,
            name: name.to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_magic() {
        let mut elf_rel = b"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00".to_vec();
        elf_rel.extend_from_slice(&1u16.to_le_bytes());
        elf_rel.extend_from_slice(&[0u8; 2]);
        assert_eq!(classify_bytes(&elf_rel), FileKind::ObjectElf);
        elf_rel[16..18].copy_from_slice(&3u16.to_le_bytes());
        assert_eq!(classify_bytes(&elf_rel), FileKind::SharedElf);
        elf_rel[16..18].copy_from_slice(&2u16.to_le_bytes());
        assert_eq!(classify_bytes(&elf_rel), FileKind::ExecutableElf);

        assert_eq!(classify_bytes(b"!<arch>\nrest"), FileKind::Archive);
        assert_eq!(classify_bytes(b"!<thin>\nrest"), FileKind::Archive);
        assert_eq!(classify_bytes(b"BC\xc0\xde...."), FileKind::Bitcode);
        assert_eq!(classify_bytes(b"#<SYMDEFS>#\n"), FileKind::SymDef);
        assert_eq!(classify_bytes(b"SECTIONS { }"), FileKind::Script);
    }

    #[test]
    fn binary_flag_wins_over_magic() {
        let f = InputFile::classify("blob", b"\x7fELF".to_vec(), true);
        assert_eq!(f.kind, FileKind::Binary);
    }

    fn ar_member(name: &str, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{name:<16}").as_bytes());
        out.extend_from_slice(b"0           0     0     644     ");
        out.extend_from_slice(format!("{:<10}", content.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(content);
        if content.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn archive_walk_finds_members_and_symbol_index() {
        let member_a = ar_member("a.o/", b"AAAA");
        let member_b = ar_member("b.o/", b"BBBBBB");
        // Member header offsets: magic(8) + symtab entry.
        let mut symtab_content = Vec::new();
        let names = b"alpha\0beta\0";
        let first_off;
        let second_off;
        {
            // symtab member itself: count(4) + 2*4 offsets + names
            let sym_len = 4 + 8 + names.len();
            let sym_total = 60 + sym_len + (sym_len & 1);
            first_off = 8 + sym_total;
            second_off = first_off + member_a.len();
            symtab_content.extend_from_slice(&2u32.to_be_bytes());
            symtab_content.extend_from_slice(&(first_off as u32).to_be_bytes());
            symtab_content.extend_from_slice(&(second_off as u32).to_be_bytes());
            symtab_content.extend_from_slice(names);
        }
        let mut archive = Vec::new();
        archive.extend_from_slice(b"!<arch>\n");
        archive.extend_from_slice(&ar_member("/", &symtab_content));
        archive.extend_from_slice(&member_a);
        archive.extend_from_slice(&member_b);

        let index = walk_archive("lib.a", &archive).unwrap();
        assert_eq!(index.members.len(), 2);
        assert_eq!(index.members[0].name, "a.o");
        assert_eq!(index.members[1].name, "b.o");
        assert_eq!(index.member_defining("alpha"), Some(0));
        assert_eq!(index.member_defining("beta"), Some(1));
        assert_eq!(index.member_defining("gamma"), None);

        let (start, end) = index.members[0].range.unwrap();
        assert_eq!(&archive[start..end], b"AAAA");
    }

    #[test]
    fn symdef_triples_parse() {
        let text = "#<SYMDEFS># generated\n# comment\n0x1000 T _start\n4096 D data ; x\n";
        let entries = parse_symdefs("syms", text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address, 0x1000);
        assert_eq!(entries[0].type_code, 'T');
        assert_eq!(entries[0].name, "_start");
        assert_eq!(entries[1].address, 4096);
    }

    #[test]
    fn symdef_requires_sentinel() {
        assert!(parse_symdefs("syms", "0x0 T x\n").is_err());
    }
}
