//! Input and output section records and the section-kind classification
//! table applied while reading object files

use crate::base::{
    FragId, InputId, OutSectId, RelocId, SectionFlags, SectionId, SHT_ARM_EXIDX, SHT_DYNAMIC,
    SHT_DYNSYM, SHT_GROUP, SHT_NOBITS, SHT_NOTE, SHT_NULL, SHT_REL, SHT_RELA, SHT_STRTAB,
    SHT_SYMTAB,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
/// What the linker does with a section, derived from its name, type and
/// flags when the header is read
pub enum SectionKind {
    /// The reserved null section
    Null,
    /// Ordinary PROGBITS content
    Regular,
    /// Occupies memory but no file bytes
    NoBits,
    /// A note section
    Note,
    /// `.note.gnu.property`
    GnuProperty,
    /// `.note.GNU-stack` marker
    GnuStackNote,
    /// `.debug*` and `.line`: kept out of loadable layout
    Debug,
    /// `.eh_frame`: parsed into CIE/FDE fragments
    EhFrame,
    /// `.eh_frame_hdr`: synthesized search table
    EhFrameHdr,
    /// `.ARM.exidx*`: unwind index with target-specific glue
    Exidx,
    /// SHT_GROUP (COMDAT) signature section
    Group,
    /// SHF_MERGE|SHF_STRINGS content split into per-string fragments
    MergeStr,
    /// SHT_REL/SHT_RELA; owns a relocation list
    Relocation,
    /// SHT_SYMTAB
    Symtab,
    /// SHT_DYNSYM
    DynSymtab,
    /// SHT_STRTAB
    Strtab,
    /// SHT_DYNAMIC
    Dynamic,
    /// Sections the core fabricates (.got, .plt, interp, trampoline homes)
    Internal,
}

/// Classify a section from its header fields the way the object reader
/// does. The name wins over the type for the special-cased prefixes.
pub fn classify(name: &str, sh_type: u32, flags: SectionFlags) -> SectionKind {
    if name.starts_with(".debug") || name == ".line" || name.starts_with(".zdebug") {
        return SectionKind::Debug;
    }
    if name == ".note.gnu.property" {
        return SectionKind::GnuProperty;
    }
    if name == ".note.GNU-stack" {
        return SectionKind::GnuStackNote;
    }
    if name == ".eh_frame" {
        return SectionKind::EhFrame;
    }
    if name == ".eh_frame_hdr" {
        return SectionKind::EhFrameHdr;
    }
    if name.starts_with(".ARM.exidx") || sh_type == SHT_ARM_EXIDX {
        return SectionKind::Exidx;
    }
    match sh_type {
        SHT_NULL => SectionKind::Null,
        SHT_GROUP => SectionKind::Group,
        SHT_REL | SHT_RELA => SectionKind::Relocation,
        SHT_SYMTAB => SectionKind::Symtab,
        SHT_DYNSYM => SectionKind::DynSymtab,
        SHT_STRTAB => SectionKind::Strtab,
        SHT_DYNAMIC => SectionKind::Dynamic,
        SHT_NOBITS => SectionKind::NoBits,
        SHT_NOTE => SectionKind::Note,
        _ => {
            if flags.contains(SectionFlags::MERGE | SectionFlags::STRINGS) {
                SectionKind::MergeStr
            } else {
                SectionKind::Regular
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Liveness mark set by garbage collection and /DISCARD/ handling
pub enum SectionMark {
    #[default]
    /// Not yet decided
    None,
    /// Reached from a GC root, or GC is off
    Live,
    /// KEEP'd by the script regardless of reachability
    Keep,
    /// Unreached; dropped from layout but symbols stay resolvable
    Ignore,
    /// /DISCARD/'d; references into it are errors
    Discard,
}

impl SectionMark {
    /// True when the section contributes no output content
    pub fn is_dropped(self) -> bool {
        matches!(self, SectionMark::Ignore | SectionMark::Discard)
    }
}

#[derive(Debug, Clone)]
/// One input section (or core-synthesized section). A section belongs to
/// exactly one input file for its whole lifetime; its fragments are kept
/// in ascending offset order.
pub struct Section {
    /// Section name from shstrtab
    pub name: String,
    /// Classification applied at read time
    pub kind: SectionKind,
    /// Raw `sh_type`
    pub sh_type: u32,
    /// Raw `sh_flags`
    pub flags: SectionFlags,
    /// `sh_entsize`
    pub entsize: u64,
    /// `sh_addralign` (zero normalized to one)
    pub align: u64,
    /// Raw `sh_link` index; resolved against the owning file's section
    /// table after all headers are read
    pub link: u32,
    /// Raw `sh_info`
    pub info: u32,
    /// Input size in bytes (`sh_size`)
    pub size: u64,
    /// Input address (`sh_addr`), nonzero only for linked inputs
    pub addr: u64,
    /// The owning input file
    pub input: InputId,
    /// Index of this section inside its file's section table
    pub index_in_file: usize,
    /// Fragments carved out of this section, ascending offsets
    pub fragments: Vec<FragId>,
    /// For Relocation sections: the entries parsed from it
    pub relocs: Vec<RelocId>,
    /// For Relocation sections: the section whose bytes get patched
    pub patches: Option<SectionId>,
    /// For Group sections: the member section indices from the content
    pub group_members: Vec<u32>,
    /// GC / discard mark
    pub mark: SectionMark,
    /// Output section this was assigned to by rule matching
    pub output: Option<OutSectId>,
    /// Index of the script rule that matched, for placement decisions
    pub matched_rule: Option<usize>,
}

impl Section {
    /// Create a section record straight from translated header fields
    #[allow(clippy::too_many_arguments)]
    pub fn from_header(
        name: String,
        sh_type: u32,
        flags: SectionFlags,
        entsize: u64,
        align: u64,
        link: u32,
        info: u32,
        size: u64,
        addr: u64,
        input: InputId,
        index_in_file: usize,
    ) -> Self {
        let kind = classify(&name, sh_type, flags);
        Section {
            name,
            kind,
            sh_type,
            flags,
            entsize,
            align: align.max(1),
            link,
            info,
            size,
            addr,
            input,
            index_in_file,
            fragments: Vec::new(),
            relocs: Vec::new(),
            patches: None,
            group_members: Vec::new(),
            mark: SectionMark::None,
            output: None,
            matched_rule: None,
        }
    }

    /// Create a core-internal synthetic section
    pub fn internal(name: &str, sh_type: u32, flags: SectionFlags, align: u64) -> Self {
        let mut s = Section::from_header(
            name.to_string(),
            sh_type,
            flags,
            0,
            align,
            0,
            0,
            0,
            0,
            InputId::new(0),
            usize::MAX,
        );
        s.kind = SectionKind::Internal;
        s.mark = SectionMark::Live;
        s
    }

    /// SHF_ALLOC?
    pub fn is_alloc(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    /// SHF_TLS?
    pub fn is_tls(&self) -> bool {
        self.flags.contains(SectionFlags::TLS)
    }

    /// True when GC or a /DISCARD/ rule dropped this section
    pub fn is_dropped(&self) -> bool {
        self.mark.is_dropped()
    }

    /// True for the ignore mark specifically (GC-pruned, not /DISCARD/'d)
    pub fn is_ignore(&self) -> bool {
        self.mark == SectionMark::Ignore
    }
}

#[derive(Debug, Clone)]
/// An output section aggregate produced by the layout engine
pub struct OutputSection {
    /// Output section name, from the matched rule or the input name
    pub name: String,
    /// `sh_type` for the header
    pub sh_type: u32,
    /// Union of member flags
    pub flags: SectionFlags,
    /// Largest member alignment
    pub align: u64,
    /// Member input sections in final order
    pub members: Vec<SectionId>,
    /// Assigned virtual address
    pub addr: u64,
    /// Load address when the script's `AT()` diverges it from `addr`
    pub load_addr: Option<u64>,
    /// Assigned file offset
    pub offset: u64,
    /// Total size after fragment offset assignment
    pub size: u64,
    /// `sh_entsize` (merge sections, tables)
    pub entsize: u64,
    /// Resolved `sh_link` (by output-section position)
    pub link: u32,
    /// Resolved `sh_info`
    pub info: u32,
    /// Script rule that produced this output section, if any
    pub rule: Option<usize>,
    /// Index into the PHDRS the section was assigned to
    pub segment: Option<usize>,
}

impl OutputSection {
    /// An empty output section with layout fields zeroed
    pub fn new(name: impl Into<String>, sh_type: u32, flags: SectionFlags) -> Self {
        OutputSection {
            name: name.into(),
            sh_type,
            flags,
            align: 1,
            members: Vec::new(),
            addr: 0,
            load_addr: None,
            offset: 0,
            size: 0,
            entsize: 0,
            link: 0,
            info: 0,
            rule: None,
            segment: None,
        }
    }

    /// True when the section occupies file bytes
    pub fn has_file_bytes(&self) -> bool {
        self.sh_type != SHT_NOBITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SHT_PROGBITS;

    #[test]
    fn classification_table() {
        let none = SectionFlags::empty();
        assert_eq!(
            classify(".debug_info", SHT_PROGBITS, none),
            SectionKind::Debug
        );
        assert_eq!(
            classify(".note.gnu.property", SHT_NOTE, none),
            SectionKind::GnuProperty
        );
        assert_eq!(classify(".eh_frame", SHT_PROGBITS, none), SectionKind::EhFrame);
        assert_eq!(
            classify(".ARM.exidx.text.f", SHT_ARM_EXIDX, none),
            SectionKind::Exidx
        );
        assert_eq!(classify(".group", SHT_GROUP, none), SectionKind::Group);
        assert_eq!(
            classify(
                ".rodata.str1.1",
                SHT_PROGBITS,
                SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS
            ),
            SectionKind::MergeStr
        );
        assert_eq!(classify(".bss", SHT_NOBITS, none), SectionKind::NoBits);
        assert_eq!(classify(".text", SHT_PROGBITS, none), SectionKind::Regular);
    }

    #[test]
    fn alignment_is_normalized() {
        let s = Section::from_header(
            ".text".into(),
            SHT_PROGBITS,
            SectionFlags::ALLOC,
            0,
            0,
            0,
            0,
            0,
            0,
            InputId::new(0),
            1,
        );
        assert_eq!(s.align, 1);
    }

    #[test]
    fn marks() {
        let mut s = Section::internal(".got", SHT_PROGBITS, SectionFlags::ALLOC, 8);
        assert!(!s.is_dropped());
        s.mark = SectionMark::Ignore;
        assert!(s.is_dropped() && s.is_ignore());
        s.mark = SectionMark::Discard;
        assert!(s.is_dropped() && !s.is_ignore());
    }
}
