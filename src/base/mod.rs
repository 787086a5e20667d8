//! Base types shared by the whole pipeline: wire primitives, ELF constants,
//! and the typed arena indices that replace cross-component pointers

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_derive::FromPrimitive;

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
/// The file class from `e_ident[EI_CLASS]`
pub enum ElfClass {
    /// Invalid class
    None = 0,
    /// 32-bit objects
    Elf32 = 1,
    /// 64-bit objects
    Elf64 = 2,
}

impl ElfClass {
    /// Size in bytes of an address or offset in this class
    pub fn word_size(self) -> usize {
        match self {
            ElfClass::Elf64 => 8,
            _ => 4,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
/// The data encoding from `e_ident[EI_DATA]`
pub enum ElfDataEncoding {
    /// Invalid encoding
    None = 0,
    /// Two's complement little-endian
    LittleEndian = 1,
    /// Two's complement big-endian
    BigEndian = 2,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[non_exhaustive]
/// Machines this core links for (`e_machine`)
pub enum ElfMachine {
    /// No machine
    None = 0,
    /// ARM 32-bit (AArch32)
    Arm = 40,
    /// AMD x86-64
    X86_64 = 62,
    /// ARM 64-bit (AArch64)
    AArch64 = 183,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Runtime byte-order and class context threaded through every wire read
/// and write. The linker fixes both when the target is selected, so this
/// carries what the object parsers and the image writer need to agree on.
pub struct IoCtx {
    /// File class of every input and of the output image
    pub class: ElfClass,
    /// Byte order of every input and of the output image
    pub encoding: ElfDataEncoding,
}

macro_rules! read_prim {
    ($name:ident, $ty:ty, $le:ident, $be:ident, $width:expr) => {
        /// Decode one value from the front of `buf`
        pub fn $name(&self, buf: &[u8]) -> Result<$ty> {
            if buf.len() < $width {
                return Err(Error::Input {
                    path: String::new(),
                    reason: format!("truncated: need {} bytes, have {}", $width, buf.len()),
                });
            }
            Ok(match self.encoding {
                ElfDataEncoding::BigEndian => BigEndian::$be(buf),
                _ => LittleEndian::$le(buf),
            })
        }
    };
}

macro_rules! write_prim {
    ($name:ident, $ty:ty, $le:ident, $be:ident, $width:expr) => {
        /// Append one value to `out`
        pub fn $name(&self, out: &mut Vec<u8>, value: $ty) {
            let mut buf = [0u8; $width];
            match self.encoding {
                ElfDataEncoding::BigEndian => BigEndian::$be(&mut buf, value),
                _ => LittleEndian::$le(&mut buf, value),
            }
            out.extend_from_slice(&buf);
        }
    };
}

impl IoCtx {
    /// Context for a 64-bit little-endian target
    pub fn elf64_le() -> Self {
        IoCtx {
            class: ElfClass::Elf64,
            encoding: ElfDataEncoding::LittleEndian,
        }
    }

    /// Context for a 32-bit little-endian target
    pub fn elf32_le() -> Self {
        IoCtx {
            class: ElfClass::Elf32,
            encoding: ElfDataEncoding::LittleEndian,
        }
    }

    read_prim!(read_half, u16, read_u16, read_u16, 2);
    read_prim!(read_word, u32, read_u32, read_u32, 4);
    read_prim!(read_sword, i32, read_i32, read_i32, 4);
    read_prim!(read_xword, u64, read_u64, read_u64, 8);
    read_prim!(read_sxword, i64, read_i64, read_i64, 8);

    write_prim!(write_half, u16, write_u16, write_u16, 2);
    write_prim!(write_word, u32, write_u32, write_u32, 4);
    write_prim!(write_sword, i32, write_i32, write_i32, 4);
    write_prim!(write_xword, u64, write_u64, write_u64, 8);
    write_prim!(write_sxword, i64, write_i64, write_i64, 8);

    /// Decode an address/offset: 4 bytes for class 32, 8 for class 64,
    /// widened to `u64` either way
    pub fn read_addr(&self, buf: &[u8]) -> Result<u64> {
        match self.class {
            ElfClass::Elf64 => self.read_xword(buf),
            _ => self.read_word(buf).map(u64::from),
        }
    }

    /// Append an address/offset at the class-appropriate width
    pub fn write_addr(&self, out: &mut Vec<u8>, value: u64) {
        match self.class {
            ElfClass::Elf64 => self.write_xword(out, value),
            _ => self.write_word(out, value as u32),
        }
    }

    /// Patch an already-emitted field in place at `offset`
    pub fn patch_word(&self, image: &mut [u8], offset: usize, value: u32) {
        if offset + 4 > image.len() {
            return;
        }
        match self.encoding {
            ElfDataEncoding::BigEndian => BigEndian::write_u32(&mut image[offset..], value),
            _ => LittleEndian::write_u32(&mut image[offset..], value),
        }
    }
}

macro_rules! arena_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Wrap a raw arena slot
            pub fn new(raw: usize) -> Self {
                $name(raw as u32)
            }

            /// The arena slot this id names
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id! {
    /// Index of an input file in the module arena
    InputId
}
arena_id! {
    /// Index of an input section in the module arena
    SectionId
}
arena_id! {
    /// Index of a fragment in the module arena
    FragId
}
arena_id! {
    /// Index of a `ResolveInfo` in the module arena
    SymbolId
}
arena_id! {
    /// Index of an `LdSymbol` in the module arena
    LdSymbolId
}
arena_id! {
    /// Index of a relocation in the module arena
    RelocId
}
arena_id! {
    /// Index of an output section in the module arena
    OutSectId
}

impl FragId {
    /// Sentinel: no location
    pub const NULL: FragId = FragId(u32::MAX);
    /// Sentinel: location dropped by GC or /DISCARD/
    pub const DISCARD: FragId = FragId(u32::MAX - 1);

    /// True for a real fragment, false for either sentinel
    pub fn is_real(self) -> bool {
        self != FragId::NULL && self != FragId::DISCARD
    }
}

/// `e_type` ET_REL
pub const ET_REL: u16 = 1;
/// `e_type` ET_EXEC
pub const ET_EXEC: u16 = 2;
/// `e_type` ET_DYN
pub const ET_DYN: u16 = 3;

/// Section type SHT_NULL
pub const SHT_NULL: u32 = 0;
/// Section type SHT_PROGBITS
pub const SHT_PROGBITS: u32 = 1;
/// Section type SHT_SYMTAB
pub const SHT_SYMTAB: u32 = 2;
/// Section type SHT_STRTAB
pub const SHT_STRTAB: u32 = 3;
/// Section type SHT_RELA
pub const SHT_RELA: u32 = 4;
/// Section type SHT_HASH
pub const SHT_HASH: u32 = 5;
/// Section type SHT_DYNAMIC
pub const SHT_DYNAMIC: u32 = 6;
/// Section type SHT_NOTE
pub const SHT_NOTE: u32 = 7;
/// Section type SHT_NOBITS
pub const SHT_NOBITS: u32 = 8;
/// Section type SHT_REL
pub const SHT_REL: u32 = 9;
/// Section type SHT_DYNSYM
pub const SHT_DYNSYM: u32 = 11;
/// Section type SHT_INIT_ARRAY
pub const SHT_INIT_ARRAY: u32 = 14;
/// Section type SHT_FINI_ARRAY
pub const SHT_FINI_ARRAY: u32 = 15;
/// Section type SHT_GROUP
pub const SHT_GROUP: u32 = 17;
/// Section type SHT_GNU_HASH
pub const SHT_GNU_HASH: u32 = 0x6fff_fff6;
/// Section type SHT_ARM_EXIDX
pub const SHT_ARM_EXIDX: u32 = 0x7000_0001;

/// Group flag: COMDAT group
pub const GRP_COMDAT: u32 = 1;

/// Symbol binding STB_LOCAL
pub const STB_LOCAL: u8 = 0;
/// Symbol binding STB_GLOBAL
pub const STB_GLOBAL: u8 = 1;
/// Symbol binding STB_WEAK
pub const STB_WEAK: u8 = 2;
/// Symbol binding STB_GNU_UNIQUE
pub const STB_GNU_UNIQUE: u8 = 10;

/// Symbol type STT_NOTYPE
pub const STT_NOTYPE: u8 = 0;
/// Symbol type STT_OBJECT
pub const STT_OBJECT: u8 = 1;
/// Symbol type STT_FUNC
pub const STT_FUNC: u8 = 2;
/// Symbol type STT_SECTION
pub const STT_SECTION: u8 = 3;
/// Symbol type STT_FILE
pub const STT_FILE: u8 = 4;
/// Symbol type STT_COMMON
pub const STT_COMMON: u8 = 5;
/// Symbol type STT_TLS
pub const STT_TLS: u8 = 6;
/// Symbol type STT_GNU_IFUNC
pub const STT_GNU_IFUNC: u8 = 10;

/// Symbol visibility STV_DEFAULT
pub const STV_DEFAULT: u8 = 0;
/// Symbol visibility STV_INTERNAL
pub const STV_INTERNAL: u8 = 1;
/// Symbol visibility STV_HIDDEN
pub const STV_HIDDEN: u8 = 2;
/// Symbol visibility STV_PROTECTED
pub const STV_PROTECTED: u8 = 3;

/// Special section index SHN_UNDEF
pub const SHN_UNDEF: u16 = 0;
/// Special section index SHN_ABS
pub const SHN_ABS: u16 = 0xfff1;
/// Special section index SHN_COMMON
pub const SHN_COMMON: u16 = 0xfff2;

/// Program header type PT_NULL
pub const PT_NULL: u32 = 0;
/// Program header type PT_LOAD
pub const PT_LOAD: u32 = 1;
/// Program header type PT_DYNAMIC
pub const PT_DYNAMIC: u32 = 2;
/// Program header type PT_INTERP
pub const PT_INTERP: u32 = 3;
/// Program header type PT_NOTE
pub const PT_NOTE: u32 = 4;
/// Program header type PT_PHDR
pub const PT_PHDR: u32 = 6;
/// Program header type PT_TLS
pub const PT_TLS: u32 = 7;
/// Program header type PT_GNU_EH_FRAME
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
/// Program header type PT_GNU_STACK
pub const PT_GNU_STACK: u32 = 0x6474_e551;
/// Program header type PT_GNU_RELRO
pub const PT_GNU_RELRO: u32 = 0x6474_e552;
/// Program header type PT_ARM_EXIDX
pub const PT_ARM_EXIDX: u32 = 0x7000_0001;

/// Dynamic tag DT_NULL
pub const DT_NULL: u64 = 0;
/// Dynamic tag DT_NEEDED
pub const DT_NEEDED: u64 = 1;
/// Dynamic tag DT_PLTRELSZ
pub const DT_PLTRELSZ: u64 = 2;
/// Dynamic tag DT_PLTGOT
pub const DT_PLTGOT: u64 = 3;
/// Dynamic tag DT_HASH
pub const DT_HASH: u64 = 4;
/// Dynamic tag DT_STRTAB
pub const DT_STRTAB: u64 = 5;
/// Dynamic tag DT_SYMTAB
pub const DT_SYMTAB: u64 = 6;
/// Dynamic tag DT_RELA
pub const DT_RELA: u64 = 7;
/// Dynamic tag DT_RELASZ
pub const DT_RELASZ: u64 = 8;
/// Dynamic tag DT_RELAENT
pub const DT_RELAENT: u64 = 9;
/// Dynamic tag DT_STRSZ
pub const DT_STRSZ: u64 = 10;
/// Dynamic tag DT_SYMENT
pub const DT_SYMENT: u64 = 11;
/// Dynamic tag DT_INIT
pub const DT_INIT: u64 = 12;
/// Dynamic tag DT_FINI
pub const DT_FINI: u64 = 13;
/// Dynamic tag DT_SONAME
pub const DT_SONAME: u64 = 14;
/// Dynamic tag DT_REL
pub const DT_REL: u64 = 17;
/// Dynamic tag DT_RELSZ
pub const DT_RELSZ: u64 = 18;
/// Dynamic tag DT_RELENT
pub const DT_RELENT: u64 = 19;
/// Dynamic tag DT_PLTREL
pub const DT_PLTREL: u64 = 20;
/// Dynamic tag DT_JMPREL
pub const DT_JMPREL: u64 = 23;
/// Dynamic tag DT_BIND_NOW
pub const DT_BIND_NOW: u64 = 24;
/// Dynamic tag DT_FLAGS
pub const DT_FLAGS: u64 = 30;
/// DT_FLAGS bit: process relocations eagerly
pub const DF_BIND_NOW: u64 = 0x8;
/// DT_FLAGS bit: object contains text relocations
pub const DF_TEXTREL: u64 = 0x4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// `sh_flags` bits the layout engine cares about
    pub struct SectionFlags: u64 {
        /// SHF_WRITE
        const WRITE = 0x1;
        /// SHF_ALLOC
        const ALLOC = 0x2;
        /// SHF_EXECINSTR
        const EXECINSTR = 0x4;
        /// SHF_MERGE
        const MERGE = 0x10;
        /// SHF_STRINGS
        const STRINGS = 0x20;
        /// SHF_INFO_LINK
        const INFO_LINK = 0x40;
        /// SHF_LINK_ORDER
        const LINK_ORDER = 0x80;
        /// SHF_GROUP
        const GROUP = 0x200;
        /// SHF_TLS
        const TLS = 0x400;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// `p_flags` bits of a program header
    pub struct SegmentFlags: u32 {
        /// PF_X
        const X = 0x1;
        /// PF_W
        const W = 0x2;
        /// PF_R
        const R = 0x4;
    }
}

/// Round `value` up to the next multiple of `align` (powers of two only;
/// an `align` of zero is treated as one)
pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn machine_from_primitive() {
        assert_eq!(ElfMachine::from_u16(183), Some(ElfMachine::AArch64));
        assert_eq!(ElfMachine::from_u16(62), Some(ElfMachine::X86_64));
        assert_eq!(ElfMachine::from_u16(40), Some(ElfMachine::Arm));
        assert_eq!(ElfMachine::from_u16(9999), None);
    }

    #[test]
    fn addr_width_follows_class() {
        let mut out = Vec::new();
        IoCtx::elf64_le().write_addr(&mut out, 0x1122_3344_5566_7788);
        assert_eq!(out.len(), 8);
        out.clear();
        IoCtx::elf32_le().write_addr(&mut out, 0x1234_5678);
        assert_eq!(out, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn big_endian_round_trip() {
        let ctx = IoCtx {
            class: ElfClass::Elf32,
            encoding: ElfDataEncoding::BigEndian,
        };
        let mut out = Vec::new();
        ctx.write_word(&mut out, 0xdead_beef);
        assert_eq!(out, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(ctx.read_word(&out).ok(), Some(0xdead_beef));
    }

    #[test]
    fn truncated_read_is_an_error() {
        let ctx = IoCtx::elf64_le();
        assert!(ctx.read_xword(&[0u8; 4]).is_err());
    }

    #[test]
    fn align_up_rounds_and_passes_through() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn frag_sentinels_are_not_real() {
        assert!(!FragId::NULL.is_real());
        assert!(!FragId::DISCARD.is_real());
        assert!(FragId::new(0).is_real());
    }
}
