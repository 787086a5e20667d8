//! AArch64 backend: relocation table and formulas, scan semantics, PLT
//! shapes, the far-call stub, and the Cortex-A53 843419 erratum scanner

use crate::base::IoCtx;
use crate::diag::DiagKind;
use crate::fragment::GotSlotKind;
use crate::gotplt::PltTemplates;
use crate::reloc::{
    deposit, verify_field, ApplyInput, DynReloc, DynRelocHome, DynTarget, FieldKind, RelocEntry,
    RelocResult, ScanAction, ScanOutcome, ScanRequest,
};
use crate::stub::{StubFixup, StubPrototype};
use crate::symbol::ReservedSlots;

use super::{DynRelocTypes, TargetBackend};

/// R_AARCH64_NONE
pub const R_AARCH64_NONE: u32 = 0;
/// R_AARCH64_ABS64
pub const R_AARCH64_ABS64: u32 = 257;
/// R_AARCH64_ABS32
pub const R_AARCH64_ABS32: u32 = 258;
/// R_AARCH64_ABS16
pub const R_AARCH64_ABS16: u32 = 259;
/// R_AARCH64_PREL64
pub const R_AARCH64_PREL64: u32 = 260;
/// R_AARCH64_PREL32
pub const R_AARCH64_PREL32: u32 = 261;
/// R_AARCH64_PREL16
pub const R_AARCH64_PREL16: u32 = 262;
/// R_AARCH64_MOVW_UABS_G0
pub const R_AARCH64_MOVW_UABS_G0: u32 = 263;
/// R_AARCH64_MOVW_UABS_G0_NC
pub const R_AARCH64_MOVW_UABS_G0_NC: u32 = 264;
/// R_AARCH64_MOVW_UABS_G1
pub const R_AARCH64_MOVW_UABS_G1: u32 = 265;
/// R_AARCH64_LD_PREL_LO19
pub const R_AARCH64_LD_PREL_LO19: u32 = 273;
/// R_AARCH64_ADR_PREL_LO21
pub const R_AARCH64_ADR_PREL_LO21: u32 = 274;
/// R_AARCH64_ADR_PREL_PG_HI21
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
/// R_AARCH64_ADR_PREL_PG_HI21_NC
pub const R_AARCH64_ADR_PREL_PG_HI21_NC: u32 = 276;
/// R_AARCH64_ADD_ABS_LO12_NC
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
/// R_AARCH64_LDST8_ABS_LO12_NC
pub const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
/// R_AARCH64_TSTBR14
pub const R_AARCH64_TSTBR14: u32 = 279;
/// R_AARCH64_CONDBR19
pub const R_AARCH64_CONDBR19: u32 = 280;
/// R_AARCH64_JUMP26
pub const R_AARCH64_JUMP26: u32 = 282;
/// R_AARCH64_CALL26
pub const R_AARCH64_CALL26: u32 = 283;
/// R_AARCH64_LDST16_ABS_LO12_NC
pub const R_AARCH64_LDST16_ABS_LO12_NC: u32 = 284;
/// R_AARCH64_LDST32_ABS_LO12_NC
pub const R_AARCH64_LDST32_ABS_LO12_NC: u32 = 285;
/// R_AARCH64_LDST64_ABS_LO12_NC
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
/// R_AARCH64_LDST128_ABS_LO12_NC
pub const R_AARCH64_LDST128_ABS_LO12_NC: u32 = 299;
/// R_AARCH64_ADR_GOT_PAGE
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
/// R_AARCH64_LD64_GOT_LO12_NC
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;
/// R_AARCH64_TLSGD_ADR_PAGE21
pub const R_AARCH64_TLSGD_ADR_PAGE21: u32 = 513;
/// R_AARCH64_TLSGD_ADD_LO12_NC
pub const R_AARCH64_TLSGD_ADD_LO12_NC: u32 = 514;
/// R_AARCH64_TLSLD_ADR_PAGE21
pub const R_AARCH64_TLSLD_ADR_PAGE21: u32 = 518;
/// R_AARCH64_TLSLD_ADD_LO12_NC
pub const R_AARCH64_TLSLD_ADD_LO12_NC: u32 = 519;
/// R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21
pub const R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21: u32 = 541;
/// R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
pub const R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC: u32 = 542;
/// R_AARCH64_TLSLE_ADD_TPREL_HI12
pub const R_AARCH64_TLSLE_ADD_TPREL_HI12: u32 = 549;
/// R_AARCH64_TLSLE_ADD_TPREL_LO12
pub const R_AARCH64_TLSLE_ADD_TPREL_LO12: u32 = 550;
/// R_AARCH64_TLSLE_ADD_TPREL_LO12_NC
pub const R_AARCH64_TLSLE_ADD_TPREL_LO12_NC: u32 = 551;
/// R_AARCH64_TLSDESC_ADR_PAGE21
pub const R_AARCH64_TLSDESC_ADR_PAGE21: u32 = 560;
/// R_AARCH64_TLSDESC_LD64_LO12
pub const R_AARCH64_TLSDESC_LD64_LO12: u32 = 561;
/// R_AARCH64_TLSDESC_ADD_LO12
pub const R_AARCH64_TLSDESC_ADD_LO12: u32 = 562;
/// R_AARCH64_TLSDESC_CALL
pub const R_AARCH64_TLSDESC_CALL: u32 = 569;
/// R_AARCH64_COPY
pub const R_AARCH64_COPY: u32 = 1024;
/// R_AARCH64_GLOB_DAT
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
/// R_AARCH64_JUMP_SLOT
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
/// R_AARCH64_RELATIVE
pub const R_AARCH64_RELATIVE: u32 = 1027;
/// R_AARCH64_TLS_DTPMOD64
pub const R_AARCH64_TLS_DTPMOD64: u32 = 1028;
/// R_AARCH64_TLS_DTPREL64
pub const R_AARCH64_TLS_DTPREL64: u32 = 1029;
/// R_AARCH64_TLS_TPREL64
pub const R_AARCH64_TLS_TPREL64: u32 = 1030;
/// R_AARCH64_TLSDESC
pub const R_AARCH64_TLSDESC: u32 = 1031;
/// R_AARCH64_IRELATIVE
pub const R_AARCH64_IRELATIVE: u32 = 1032;

/// AArch64 NOP, what a call to a dropped weak undef becomes
pub const NOP: u32 = 0xd503_201f;

/// 4 KiB page of an address
pub fn page_address(addr: u64) -> u64 {
    addr & !0xfff
}

/// Offset within the 4 KiB page
pub fn page_offset(addr: u64) -> u64 {
    addr & 0xfff
}

/// Splice a 26-bit word offset into B/BL
pub fn reencode_branch26(insn: u64, imm: u64) -> u64 {
    (insn & 0xfc00_0000) | (imm & 0x03ff_ffff)
}

/// Splice a 19-bit word offset into B.cond/CBZ/CBNZ
pub fn reencode_condbr19(insn: u64, imm: u64) -> u64 {
    (insn & 0xff00_001f) | ((imm & 0x7_ffff) << 5)
}

/// Splice a 14-bit word offset into TBZ/TBNZ
pub fn reencode_tstbr14(insn: u64, imm: u64) -> u64 {
    (insn & 0xfff8_001f) | ((imm & 0x3fff) << 5)
}

/// Splice the split 21-bit immediate of ADR/ADRP
pub fn reencode_adr_imm(insn: u64, imm: u64) -> u64 {
    let immlo = imm & 0x3;
    let immhi = (imm >> 2) & 0x7_ffff;
    (insn & 0x9f00_001f) | (immlo << 29) | (immhi << 5)
}

/// Splice a 12-bit immediate into ADD/SUB (immediate)
pub fn reencode_add_imm(insn: u64, imm: u64) -> u64 {
    (insn & 0xffc0_03ff) | ((imm & 0xfff) << 10)
}

/// Splice a scaled 12-bit immediate into LDR/STR (unsigned offset)
pub fn reencode_ldst_imm(insn: u64, imm: u64) -> u64 {
    (insn & 0xffc0_03ff) | ((imm & 0xfff) << 10)
}

/// Splice a 16-bit immediate into MOVZ/MOVK
pub fn reencode_movw_imm(insn: u64, imm: u64) -> u64 {
    (insn & 0xffe0_001f) | ((imm & 0xffff) << 5)
}

/// Splice a 19-bit word offset into LDR (literal)
pub fn reencode_ld_literal19(insn: u64, imm: u64) -> u64 {
    (insn & 0xff00_001f) | ((imm & 0x7_ffff) << 5)
}

const T: &[(u32, RelocEntry)] = &[
    (R_AARCH64_NONE, RelocEntry::new("R_AARCH64_NONE", 0, false, FieldKind::Data)),
    (R_AARCH64_ABS64, RelocEntry::new("R_AARCH64_ABS64", 64, false, FieldKind::Data)),
    (R_AARCH64_ABS32, RelocEntry::new("R_AARCH64_ABS32", 32, false, FieldKind::Data)),
    (R_AARCH64_ABS16, RelocEntry::new("R_AARCH64_ABS16", 16, false, FieldKind::Data)),
    (R_AARCH64_PREL64, RelocEntry::new("R_AARCH64_PREL64", 64, true, FieldKind::Data)),
    (R_AARCH64_PREL32, RelocEntry::new("R_AARCH64_PREL32", 32, true, FieldKind::Data)),
    (R_AARCH64_PREL16, RelocEntry::new("R_AARCH64_PREL16", 16, true, FieldKind::Data)),
    (
        R_AARCH64_MOVW_UABS_G0,
        RelocEntry::new("R_AARCH64_MOVW_UABS_G0", 16, false, FieldKind::Aarch64MovwImm),
    ),
    (
        R_AARCH64_MOVW_UABS_G0_NC,
        RelocEntry::new("R_AARCH64_MOVW_UABS_G0_NC", 16, false, FieldKind::Aarch64MovwImm),
    ),
    (
        R_AARCH64_MOVW_UABS_G1,
        RelocEntry::new("R_AARCH64_MOVW_UABS_G1", 16, false, FieldKind::Aarch64MovwImm),
    ),
    (
        R_AARCH64_LD_PREL_LO19,
        RelocEntry::shifted("R_AARCH64_LD_PREL_LO19", 19, true, 4, 2, FieldKind::Aarch64LdLit19),
    ),
    (
        R_AARCH64_ADR_PREL_LO21,
        RelocEntry::new("R_AARCH64_ADR_PREL_LO21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_ADR_PREL_PG_HI21,
        RelocEntry::new("R_AARCH64_ADR_PREL_PG_HI21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_ADR_PREL_PG_HI21_NC,
        RelocEntry::new("R_AARCH64_ADR_PREL_PG_HI21_NC", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_ADD_ABS_LO12_NC,
        RelocEntry::new("R_AARCH64_ADD_ABS_LO12_NC", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_LDST8_ABS_LO12_NC,
        RelocEntry::new("R_AARCH64_LDST8_ABS_LO12_NC", 12, false, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_TSTBR14,
        RelocEntry::shifted("R_AARCH64_TSTBR14", 14, true, 4, 2, FieldKind::Aarch64Tstbr14),
    ),
    (
        R_AARCH64_CONDBR19,
        RelocEntry::shifted("R_AARCH64_CONDBR19", 19, true, 4, 2, FieldKind::Aarch64CondBr19),
    ),
    (
        R_AARCH64_JUMP26,
        RelocEntry::shifted("R_AARCH64_JUMP26", 26, true, 4, 2, FieldKind::Aarch64Branch26),
    ),
    (
        R_AARCH64_CALL26,
        RelocEntry::shifted("R_AARCH64_CALL26", 26, true, 4, 2, FieldKind::Aarch64Branch26),
    ),
    (
        R_AARCH64_LDST16_ABS_LO12_NC,
        RelocEntry::shifted("R_AARCH64_LDST16_ABS_LO12_NC", 12, false, 1, 1, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_LDST32_ABS_LO12_NC,
        RelocEntry::shifted("R_AARCH64_LDST32_ABS_LO12_NC", 12, false, 1, 2, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_LDST64_ABS_LO12_NC,
        RelocEntry::shifted("R_AARCH64_LDST64_ABS_LO12_NC", 12, false, 1, 3, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_LDST128_ABS_LO12_NC,
        RelocEntry::shifted("R_AARCH64_LDST128_ABS_LO12_NC", 12, false, 1, 4, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_ADR_GOT_PAGE,
        RelocEntry::new("R_AARCH64_ADR_GOT_PAGE", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_LD64_GOT_LO12_NC,
        RelocEntry::shifted("R_AARCH64_LD64_GOT_LO12_NC", 12, false, 1, 3, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_TLSGD_ADR_PAGE21,
        RelocEntry::new("R_AARCH64_TLSGD_ADR_PAGE21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_TLSGD_ADD_LO12_NC,
        RelocEntry::new("R_AARCH64_TLSGD_ADD_LO12_NC", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSLD_ADR_PAGE21,
        RelocEntry::new("R_AARCH64_TLSLD_ADR_PAGE21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_TLSLD_ADD_LO12_NC,
        RelocEntry::new("R_AARCH64_TLSLD_ADD_LO12_NC", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21,
        RelocEntry::new("R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC,
        RelocEntry::shifted(
            "R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC",
            12,
            false,
            1,
            3,
            FieldKind::Aarch64LdstImm,
        ),
    ),
    (
        R_AARCH64_TLSLE_ADD_TPREL_HI12,
        RelocEntry::shifted("R_AARCH64_TLSLE_ADD_TPREL_HI12", 24, false, 1, 12, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSLE_ADD_TPREL_LO12,
        RelocEntry::new("R_AARCH64_TLSLE_ADD_TPREL_LO12", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSLE_ADD_TPREL_LO12_NC,
        RelocEntry::new("R_AARCH64_TLSLE_ADD_TPREL_LO12_NC", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSDESC_ADR_PAGE21,
        RelocEntry::new("R_AARCH64_TLSDESC_ADR_PAGE21", 21, true, FieldKind::Aarch64AdrImm),
    ),
    (
        R_AARCH64_TLSDESC_LD64_LO12,
        RelocEntry::shifted("R_AARCH64_TLSDESC_LD64_LO12", 12, false, 1, 3, FieldKind::Aarch64LdstImm),
    ),
    (
        R_AARCH64_TLSDESC_ADD_LO12,
        RelocEntry::new("R_AARCH64_TLSDESC_ADD_LO12", 12, false, FieldKind::Aarch64AddImm),
    ),
    (
        R_AARCH64_TLSDESC_CALL,
        RelocEntry::new("R_AARCH64_TLSDESC_CALL", 0, false, FieldKind::Data),
    ),
    (R_AARCH64_COPY, RelocEntry::new("R_AARCH64_COPY", 0, false, FieldKind::Data)),
    (R_AARCH64_GLOB_DAT, RelocEntry::new("R_AARCH64_GLOB_DAT", 64, false, FieldKind::Data)),
    (R_AARCH64_JUMP_SLOT, RelocEntry::new("R_AARCH64_JUMP_SLOT", 64, false, FieldKind::Data)),
    (R_AARCH64_RELATIVE, RelocEntry::new("R_AARCH64_RELATIVE", 64, false, FieldKind::Data)),
    (
        R_AARCH64_TLS_DTPMOD64,
        RelocEntry::new("R_AARCH64_TLS_DTPMOD64", 64, false, FieldKind::Data),
    ),
    (
        R_AARCH64_TLS_DTPREL64,
        RelocEntry::new("R_AARCH64_TLS_DTPREL64", 64, false, FieldKind::Data),
    ),
    (
        R_AARCH64_TLS_TPREL64,
        RelocEntry::new("R_AARCH64_TLS_TPREL64", 64, false, FieldKind::Data),
    ),
    (R_AARCH64_TLSDESC, RelocEntry::new("R_AARCH64_TLSDESC", 64, false, FieldKind::Data)),
    (R_AARCH64_IRELATIVE, RelocEntry::new("R_AARCH64_IRELATIVE", 64, false, FieldKind::Data)),
];

/// Table lookup for this target
pub fn entry_of(rtype: u32) -> Option<&'static RelocEntry> {
    T.iter().find(|(t, _)| *t == rtype).map(|(_, e)| e)
}

fn branch_becomes_nop(input: &ApplyInput) -> bool {
    input.sym_weak_undef && !input.sym_dyn && !input.reserved.contains(ReservedSlots::PLT)
}

/// Apply one relocation: compute the per-type formula, range-check the
/// field through the shared verifier, and splice the bits. Returns the
/// patched word next to the result.
pub fn apply(input: &ApplyInput) -> (RelocResult, u64) {
    let Some(entry) = entry_of(input.rtype) else {
        return (RelocResult::Unknown, input.word);
    };
    let a = input.a;
    let p = input.p as i64;

    match input.rtype {
        R_AARCH64_NONE | R_AARCH64_TLSDESC_CALL => (RelocResult::Ok, input.word),

        R_AARCH64_ABS64 | R_AARCH64_ABS32 | R_AARCH64_ABS16 => {
            // Preemptible symbols with a reserved dynamic entry get their
            // real value at load time; leave the addend in place.
            if input.target_alloc && input.reserved.contains(ReservedSlots::REL) && input.preemptible
            {
                return (RelocResult::Ok, input.word);
            }
            let mut s = input.s_via_plt() as i64;
            if input.sym_weak_undef && input.is_exec {
                s = 0;
            }
            let x = s.wrapping_add(a);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, deposit(input.word, entry.bits, x as u64))
        }

        R_AARCH64_PREL64 | R_AARCH64_PREL32 | R_AARCH64_PREL16 => {
            let s = input.s_via_plt() as i64;
            let x = s.wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, deposit(input.word, entry.bits, x as u64))
        }

        R_AARCH64_MOVW_UABS_G0 | R_AARCH64_MOVW_UABS_G0_NC | R_AARCH64_MOVW_UABS_G1 => {
            let x = (input.s_via_plt() as i64).wrapping_add(a) as u64;
            match input.rtype {
                R_AARCH64_MOVW_UABS_G0 if x >= 0x1_0000 => (RelocResult::Overflow, input.word),
                R_AARCH64_MOVW_UABS_G1 if x >= 0x1_0000_0000 => (RelocResult::Overflow, input.word),
                R_AARCH64_MOVW_UABS_G1 => {
                    (RelocResult::Ok, reencode_movw_imm(input.word, (x >> 16) & 0xffff))
                }
                _ => (RelocResult::Ok, reencode_movw_imm(input.word, x & 0xffff)),
            }
        }

        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_PG_HI21_NC => {
            let s = input.s_via_plt();
            let x = (page_address(s.wrapping_add(a as u64)) as i64)
                .wrapping_sub(page_address(input.p) as i64);
            if input.rtype == R_AARCH64_ADR_PREL_PG_HI21 {
                let pages = x >> 12;
                if pages >= (1 << 20) || pages < -(1 << 20) {
                    return (RelocResult::Overflow, input.word);
                }
            }
            (RelocResult::Ok, reencode_adr_imm(input.word, (x >> 12) as u64))
        }

        R_AARCH64_ADR_PREL_LO21 => {
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_adr_imm(input.word, x as u64))
        }

        R_AARCH64_LD_PREL_LO19 => {
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_ld_literal19(input.word, (x >> 2) as u64))
        }

        R_AARCH64_ADD_ABS_LO12_NC => {
            let x = page_offset(input.s_via_plt().wrapping_add(a as u64));
            (RelocResult::Ok, reencode_add_imm(input.word, x))
        }

        R_AARCH64_LDST8_ABS_LO12_NC
        | R_AARCH64_LDST16_ABS_LO12_NC
        | R_AARCH64_LDST32_ABS_LO12_NC
        | R_AARCH64_LDST64_ABS_LO12_NC
        | R_AARCH64_LDST128_ABS_LO12_NC => {
            let x = page_offset(input.s_via_plt().wrapping_add(a as u64));
            (
                RelocResult::Ok,
                reencode_ldst_imm(input.word, x >> entry.rshift),
            )
        }

        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            // A branch to a dropped weak undef just falls through.
            if branch_becomes_nop(input) {
                return (RelocResult::Ok, u64::from(NOP));
            }
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_branch26(input.word, (x >> 2) as u64))
        }

        R_AARCH64_CONDBR19 => {
            if branch_becomes_nop(input) {
                return (RelocResult::Ok, u64::from(NOP));
            }
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_condbr19(input.word, (x >> 2) as u64))
        }

        R_AARCH64_TSTBR14 => {
            if branch_becomes_nop(input) {
                return (RelocResult::Ok, u64::from(NOP));
            }
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_tstbr14(input.word, (x >> 2) as u64))
        }

        R_AARCH64_ADR_GOT_PAGE
        | R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21
        | R_AARCH64_TLSGD_ADR_PAGE21
        | R_AARCH64_TLSLD_ADR_PAGE21
        | R_AARCH64_TLSDESC_ADR_PAGE21 => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            let x = (page_address(got.wrapping_add(a as u64)) as i64)
                .wrapping_sub(page_address(input.p) as i64);
            (RelocResult::Ok, reencode_adr_imm(input.word, (x >> 12) as u64))
        }

        R_AARCH64_LD64_GOT_LO12_NC
        | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
        | R_AARCH64_TLSDESC_LD64_LO12 => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            let x = page_offset(got.wrapping_add(a as u64));
            (RelocResult::Ok, reencode_ldst_imm(input.word, x >> 3))
        }

        R_AARCH64_TLSGD_ADD_LO12_NC | R_AARCH64_TLSLD_ADD_LO12_NC | R_AARCH64_TLSDESC_ADD_LO12 => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            let x = page_offset(got.wrapping_add(a as u64));
            (RelocResult::Ok, reencode_add_imm(input.word, x))
        }

        R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
            // For LE the symbol value is its offset inside the TLS
            // template; the thread pointer sits TCB bytes before it.
            let tprel = input.tcb_size.wrapping_add(input.s).wrapping_add(a as u64);
            if tprel >> 12 >= 1 << 12 {
                return (RelocResult::Overflow, input.word);
            }
            (RelocResult::Ok, reencode_add_imm(input.word, tprel >> 12))
        }

        R_AARCH64_TLSLE_ADD_TPREL_LO12 | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
            let tprel = input.tcb_size.wrapping_add(input.s).wrapping_add(a as u64);
            if input.rtype == R_AARCH64_TLSLE_ADD_TPREL_LO12 && tprel >> 12 != 0 {
                return (RelocResult::Overflow, input.word);
            }
            (RelocResult::Ok, reencode_add_imm(input.word, tprel & 0xfff))
        }

        _ => (RelocResult::Unsupported, input.word),
    }
}

fn report_pic_invalid(req: &ScanRequest, out: &mut ScanOutcome) {
    out.push(ScanAction::Report {
        kind: DiagKind::InvalidRelocForPic,
        args: vec![
            entry_of(req.rtype)
                .map(|e| e.name.to_string())
                .unwrap_or_else(|| format!("reloc#{}", req.rtype)),
            req.sym_name.to_string(),
            req.input_path.to_string(),
        ],
    });
}

fn needs_dyn_rel(req: &ScanRequest, has_plt: bool, is_abs_word: bool) -> bool {
    if req.config.is_code_indep() {
        if req.sym.is_hidden {
            return is_abs_word;
        }
        is_abs_word || req.sym.preemptible
    } else {
        req.sym.is_dyn && !has_plt
    }
}

fn copy_reloc_candidate(req: &ScanRequest) -> bool {
    !req.config.is_code_indep() && req.sym.is_dyn && !req.sym.is_func && !req.sym.is_local
}

fn push_copy_or_error(req: &ScanRequest, out: &mut ScanOutcome) {
    let Some(symbol) = req.sym.id else { return };
    if req.config.no_copy_reloc {
        out.push(ScanAction::Report {
            kind: DiagKind::CopyRelocProhibited,
            args: vec![
                req.sym_name.to_string(),
                req.input_path.to_string(),
                req.origin_path.to_string(),
            ],
        });
        return;
    }
    out.push(ScanAction::CopyReloc { symbol });
}

fn reserve_plt(req: &ScanRequest, out: &mut ScanOutcome, irelative: bool) {
    if let Some(symbol) = req.sym.id {
        if !req.sym.reserved.contains(ReservedSlots::PLT) {
            out.push(ScanAction::ReservePlt { symbol, irelative });
        }
    }
}

fn reserve_regular_got(req: &ScanRequest, out: &mut ScanOutcome) {
    let Some(symbol) = req.sym.id else { return };
    if req.sym.reserved.contains(ReservedSlots::GOT) {
        return;
    }
    let has_rel = if req.sym.is_local {
        req.config.is_code_indep()
    } else {
        !req.config.is_static()
    };
    if !has_rel {
        out.push(ScanAction::ReserveGot {
            symbol,
            kind: GotSlotKind::Regular,
            holds_symbol_value: true,
        });
        return;
    }
    // A RELATIVE entry serves when the symbol cannot be preempted and is
    // either hidden or we are not producing a plain executable; otherwise
    // the loader needs a GLOB_DAT against the name.
    let use_relative = req.sym.is_hidden
        || (!req.config.is_normal_exec() && !req.sym.preemptible)
        || req.sym.is_local;
    out.push(ScanAction::ReserveGot {
        symbol,
        kind: GotSlotKind::Regular,
        holds_symbol_value: use_relative,
    });
    out.push(ScanAction::EmitDynReloc {
        home: DynRelocHome::Dyn,
        reloc: DynReloc {
            rtype: if use_relative {
                R_AARCH64_RELATIVE
            } else {
                R_AARCH64_GLOB_DAT
            },
            symbol: if use_relative { None } else { Some(symbol) },
            at: DynTarget::GotSlot {
                symbol,
                kind: GotSlotKind::Regular,
                word: 0,
            },
            addend: 0,
        },
        reserve_rel_for: None,
    });
}

/// Scan one relocation into the action stream, classifying by type into
/// the absolute/branch/GOT/PLT/TLS/copy buckets. Reservation idempotence
/// comes from the bitmap snapshot in the request plus allocator dedup.
pub fn scan(req: &ScanRequest, out: &mut ScanOutcome) {
    if !req.section_alloc {
        return;
    }
    let is_tls_le = matches!(
        req.rtype,
        R_AARCH64_TLSLE_ADD_TPREL_HI12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC
    );
    if req.config.is_code_indep()
        && (matches!(req.rtype, R_AARCH64_ABS32 | R_AARCH64_ABS16) || is_tls_le)
    {
        report_pic_invalid(req, out);
        return;
    }

    match req.rtype {
        R_AARCH64_ABS64 => {
            if req.sym.is_local {
                if req.config.is_code_indep() {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype: R_AARCH64_RELATIVE,
                            symbol: None,
                            at: DynTarget::InPlace(req.place),
                            addend: req.addend,
                        },
                        reserve_rel_for: req.sym.id,
                    });
                    if !req.section_writable {
                        out.push(ScanAction::MarkTextRel);
                    }
                }
                return;
            }
            if req.sym.preemptible && req.sym.is_func {
                reserve_plt(req, out, false);
            }
            let has_plt = req.sym.reserved.contains(ReservedSlots::PLT)
                || out
                    .actions
                    .iter()
                    .any(|a| matches!(a, ScanAction::ReservePlt { .. }));
            if needs_dyn_rel(req, has_plt, true) {
                if copy_reloc_candidate(req) {
                    push_copy_or_error(req, out);
                } else {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype: if req.sym.preemptible {
                                R_AARCH64_ABS64
                            } else {
                                R_AARCH64_RELATIVE
                            },
                            symbol: if req.sym.preemptible { req.sym.id } else { None },
                            at: DynTarget::InPlace(req.place),
                            addend: req.addend,
                        },
                        reserve_rel_for: req.sym.id,
                    });
                    if !req.section_writable {
                        out.push(ScanAction::MarkTextRel);
                    }
                }
            }
        }

        R_AARCH64_ABS32 | R_AARCH64_ABS16 => {
            // Non-PIC only (the PIC case was rejected above): the word is
            // too narrow for a RELATIVE entry, but a shared-library datum
            // can still be reached through a copy relocation.
            if !req.sym.is_local && copy_reloc_candidate(req) {
                push_copy_or_error(req, out);
            }
        }

        R_AARCH64_PREL64 | R_AARCH64_PREL32 | R_AARCH64_PREL16 => {
            if req.sym.is_local {
                return;
            }
            if req.sym.preemptible
                && req.sym.is_func
                && req.config.codegen != crate::config::CodeGenType::DynObj
            {
                reserve_plt(req, out, false);
            }
            if needs_dyn_rel(req, req.sym.reserved.contains(ReservedSlots::PLT), false)
                && copy_reloc_candidate(req)
            {
                push_copy_or_error(req, out);
            }
        }

        R_AARCH64_CALL26 | R_AARCH64_JUMP26 | R_AARCH64_CONDBR19 | R_AARCH64_TSTBR14 => {
            if req.sym.is_local {
                return;
            }
            if req.sym.reserved.contains(ReservedSlots::PLT) {
                return;
            }
            if req.sym.is_ifunc && req.config.is_static() {
                reserve_plt(req, out, true);
                return;
            }
            if req.sym.preemptible {
                reserve_plt(req, out, false);
            }
        }

        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_PG_HI21_NC => {
            if req.sym.is_local {
                return;
            }
            if needs_dyn_rel(req, req.sym.reserved.contains(ReservedSlots::PLT), false)
                && copy_reloc_candidate(req)
            {
                push_copy_or_error(req, out);
            }
            if req.sym.preemptible && req.sym.is_func {
                reserve_plt(req, out, false);
            }
        }

        R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => {
            reserve_regular_got(req, out);
        }

        R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
            let Some(symbol) = req.sym.id else { return };
            if req.sym.reserved.contains(ReservedSlots::GOT) {
                return;
            }
            out.push(ScanAction::ReserveGot {
                symbol,
                kind: GotSlotKind::TlsIe,
                holds_symbol_value: req.config.is_static(),
            });
            if !req.config.is_static() {
                out.push(ScanAction::EmitDynReloc {
                    home: DynRelocHome::Dyn,
                    reloc: DynReloc {
                        rtype: R_AARCH64_TLS_TPREL64,
                        symbol: Some(symbol),
                        at: DynTarget::GotSlot {
                            symbol,
                            kind: GotSlotKind::TlsIe,
                            word: 0,
                        },
                        addend: 0,
                    },
                    reserve_rel_for: None,
                });
            }
        }

        R_AARCH64_TLSGD_ADR_PAGE21 | R_AARCH64_TLSGD_ADD_LO12_NC => {
            let Some(symbol) = req.sym.id else { return };
            if req.sym.reserved.contains(ReservedSlots::GOT) {
                return;
            }
            out.push(ScanAction::ReserveGot {
                symbol,
                kind: GotSlotKind::TlsGd,
                holds_symbol_value: req.config.is_static(),
            });
            if !req.config.is_static() {
                out.push(ScanAction::EmitDynReloc {
                    home: DynRelocHome::Dyn,
                    reloc: DynReloc {
                        rtype: R_AARCH64_TLS_DTPMOD64,
                        symbol: Some(symbol),
                        at: DynTarget::GotSlot {
                            symbol,
                            kind: GotSlotKind::TlsGd,
                            word: 0,
                        },
                        addend: 0,
                    },
                    reserve_rel_for: None,
                });
                out.push(ScanAction::EmitDynReloc {
                    home: DynRelocHome::Dyn,
                    reloc: DynReloc {
                        rtype: R_AARCH64_TLS_DTPREL64,
                        symbol: Some(symbol),
                        at: DynTarget::GotSlot {
                            symbol,
                            kind: GotSlotKind::TlsGd,
                            word: 1,
                        },
                        addend: 0,
                    },
                    reserve_rel_for: None,
                });
            }
        }

        R_AARCH64_TLSLD_ADR_PAGE21 | R_AARCH64_TLSLD_ADD_LO12_NC => {
            let Some(symbol) = req.sym.id else { return };
            out.push(ScanAction::ReserveGot {
                symbol,
                kind: GotSlotKind::TlsLd,
                holds_symbol_value: req.config.is_static(),
            });
            if !req.config.is_static() {
                out.push(ScanAction::EmitDynReloc {
                    home: DynRelocHome::Dyn,
                    reloc: DynReloc {
                        rtype: R_AARCH64_TLS_DTPMOD64,
                        symbol: None,
                        at: DynTarget::GotSlot {
                            symbol,
                            kind: GotSlotKind::TlsLd,
                            word: 0,
                        },
                        addend: 0,
                    },
                    reserve_rel_for: None,
                });
            }
        }

        R_AARCH64_TLSDESC_ADR_PAGE21 | R_AARCH64_TLSDESC_LD64_LO12 | R_AARCH64_TLSDESC_ADD_LO12 => {
            let Some(symbol) = req.sym.id else { return };
            if req.sym.reserved.contains(ReservedSlots::GOT) {
                return;
            }
            if req.config.is_static() {
                // No dynamic linker to run the descriptor; fall back to a
                // static IE-style slot.
                out.push(ScanAction::ReserveGot {
                    symbol,
                    kind: GotSlotKind::TlsIe,
                    holds_symbol_value: true,
                });
                return;
            }
            out.push(ScanAction::ReserveGot {
                symbol,
                kind: GotSlotKind::TlsDesc,
                holds_symbol_value: false,
            });
            out.push(ScanAction::EmitDynReloc {
                home: DynRelocHome::Plt,
                reloc: DynReloc {
                    rtype: R_AARCH64_TLSDESC,
                    symbol: Some(symbol),
                    at: DynTarget::GotSlot {
                        symbol,
                        kind: GotSlotKind::TlsDesc,
                        word: 0,
                    },
                    addend: 0,
                },
                reserve_rel_for: None,
            });
        }

        _ => {
            if entry_of(req.rtype).is_none() {
                out.push(ScanAction::Report {
                    kind: DiagKind::UnsupportedReloc,
                    args: vec![format!("reloc#{}", req.rtype), req.input_path.to_string()],
                });
            }
        }
    }
}

// ldr x16, #8 ; br x16 ; .quad target
const FARCALL_TEMPLATE: &[u8] = &[
    0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const FARCALL_FIXUPS: &[StubFixup] = &[StubFixup {
    offset: 8,
    rtype: R_AARCH64_ABS64,
    addend: 0,
}];

fn farcall_is_needed(rtype: u32) -> bool {
    matches!(rtype, R_AARCH64_CALL26 | R_AARCH64_JUMP26)
}

fn farcall_in_range(_rtype: u32, target: i64, place: i64) -> bool {
    let distance = target.wrapping_sub(place);
    (-(1 << 27)..(1 << 27)).contains(&distance)
}

/// The long-branch veneer consulted by the relaxation loop
pub const FARCALL_STUB: StubPrototype = StubPrototype {
    name: "farcall",
    template: FARCALL_TEMPLATE,
    align: 8,
    fixups: FARCALL_FIXUPS,
    is_needed: farcall_is_needed,
    in_range: farcall_in_range,
    supports_pic: false,
};

// stp x16,x30 / adrp x16 / ldr x17 / add x16 / br x17 / nop*3
const PLT0_TEMPLATE: &[u8] = &[
    0xf0, 0x7b, 0xbf, 0xa9, 0x10, 0x00, 0x00, 0x90, 0x11, 0x02, 0x40, 0xf9, 0x10, 0x02, 0x00,
    0x91, 0x20, 0x02, 0x1f, 0xd6, 0x1f, 0x20, 0x03, 0xd5, 0x1f, 0x20, 0x03, 0xd5, 0x1f, 0x20,
    0x03, 0xd5,
];

// adrp x16 / ldr x17 / add x16 / br x17
const PLTN_TEMPLATE: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, 0x11, 0x02, 0x40, 0xf9, 0x10, 0x02, 0x00, 0x91, 0x20, 0x02, 0x1f,
    0xd6,
];

fn patch_word(bytes: &mut [u8], io: IoCtx, at: usize, word: u64) {
    io.patch_word(bytes, at, word as u32);
}

fn read_insn(bytes: &[u8], io: IoCtx, at: usize) -> u64 {
    io.read_word(&bytes[at..]).map(u64::from).unwrap_or(0)
}

fn patch_plt0(bytes: &mut [u8], io: IoCtx, plt0_addr: u64, gotplt_addr: u64) {
    let adrp_p = plt0_addr + 4;
    let pages = (page_address(gotplt_addr) as i64 - page_address(adrp_p) as i64) >> 12;
    let off = page_offset(gotplt_addr);
    let adrp = reencode_adr_imm(read_insn(bytes, io, 4), pages as u64);
    patch_word(bytes, io, 4, adrp);
    let ldr = reencode_ldst_imm(read_insn(bytes, io, 8), off >> 3);
    patch_word(bytes, io, 8, ldr);
    let add = reencode_add_imm(read_insn(bytes, io, 12), off);
    patch_word(bytes, io, 12, add);
}

fn patch_pltn(bytes: &mut [u8], io: IoCtx, entry_addr: u64, slot_addr: u64, _plt0: u64) {
    let pages = (page_address(slot_addr) as i64 - page_address(entry_addr) as i64) >> 12;
    let off = page_offset(slot_addr);
    let adrp = reencode_adr_imm(read_insn(bytes, io, 0), pages as u64);
    patch_word(bytes, io, 0, adrp);
    let ldr = reencode_ldst_imm(read_insn(bytes, io, 4), off >> 3);
    patch_word(bytes, io, 4, ldr);
    let add = reencode_add_imm(read_insn(bytes, io, 8), off);
    patch_word(bytes, io, 8, add);
}

fn gc_glue(_name: &str) -> Option<String> {
    None
}

fn is_adrp(insn: u32) -> bool {
    insn & 0x9f00_0000 == 0x9000_0000
}

fn is_load_store(insn: u32) -> bool {
    // LDR/STR (immediate, unsigned offset) and register-pair classes.
    (insn & 0x3b00_0000) == 0x3900_0000 || (insn & 0x3a00_0000) == 0x2800_0000
}

fn load_store_base(insn: u32) -> u32 {
    (insn >> 5) & 0x1f
}

/// Scan one fragment's instruction words for the Cortex-A53 843419
/// sequence: an ADRP in the last two words of a 4 KiB page, a memory
/// access, then (with at most one intervening instruction) a load/store
/// whose base register is the ADRP destination. Returns the byte offsets
/// of the offending load/store instructions relative to `base_addr`'s
/// fragment start.
pub fn scan_erratum_843419(data: &[u8], base_addr: u64, io: IoCtx) -> Vec<u64> {
    let mut hits = Vec::new();
    let words = data.len() / 4;
    for i in 0..words {
        let addr = base_addr + (i as u64) * 4;
        if page_offset(addr) != 0xff8 && page_offset(addr) != 0xffc {
            continue;
        }
        let Some(adrp) = io.read_word(&data[i * 4..]).ok() else {
            continue;
        };
        if !is_adrp(adrp) {
            continue;
        }
        let rd = adrp & 0x1f;
        let Some(second) = io.read_word(data.get((i + 1) * 4..).unwrap_or(&[])).ok() else {
            continue;
        };
        if !is_load_store(second) {
            continue;
        }
        // The sequence completes at the second or third following word.
        for j in [2usize, 3] {
            let Some(cand) = io.read_word(data.get((i + j) * 4..).unwrap_or(&[])).ok() else {
                continue;
            };
            if is_load_store(cand) && load_store_base(cand) == rd {
                hits.push(((i + j) * 4) as u64);
                break;
            }
        }
    }
    hits
}

// adrp-result load redone out of line: the copied instruction, then a
// branch back to the word after the original site.
const ERRATUM_FIXUPS: &[StubFixup] = &[StubFixup {
    offset: 4,
    rtype: R_AARCH64_JUMP26,
    addend: 0,
}];

const ERRATUM_TEMPLATE: &[u8] = &[
    0x1f, 0x20, 0x03, 0xd5, // replaced with the copied instruction
    0x00, 0x00, 0x00, 0x14, // b back
];

fn erratum_is_needed(rtype: u32) -> bool {
    rtype == R_AARCH64_JUMP26
}

fn erratum_in_range(_rtype: u32, target: i64, place: i64) -> bool {
    farcall_in_range(R_AARCH64_JUMP26, target, place)
}

/// The copy-and-branch-back island body used by the 843419 fix
pub const ERRATUM_843419_STUB: StubPrototype = StubPrototype {
    name: "erratum_843419",
    template: ERRATUM_TEMPLATE,
    align: 4,
    fixups: ERRATUM_FIXUPS,
    is_needed: erratum_is_needed,
    in_range: erratum_in_range,
    supports_pic: true,
};

/// The AArch64 backend table
pub static BACKEND: TargetBackend = TargetBackend {
    machine: crate::base::ElfMachine::AArch64,
    io: IoCtx {
        class: crate::base::ElfClass::Elf64,
        encoding: crate::base::ElfDataEncoding::LittleEndian,
    },
    is_rela: true,
    page_size: 0x1000,
    entry_symbol: "_start",
    dynamic_linker: "/lib/ld-linux-aarch64.so.1",
    e_flags: 0,
    tcb_size: 16,
    dyn_relocs: DynRelocTypes {
        none: R_AARCH64_NONE,
        relative: R_AARCH64_RELATIVE,
        glob_dat: R_AARCH64_GLOB_DAT,
        jump_slot: R_AARCH64_JUMP_SLOT,
        irelative: R_AARCH64_IRELATIVE,
        copy: R_AARCH64_COPY,
        dtpmod: R_AARCH64_TLS_DTPMOD64,
        dtprel: R_AARCH64_TLS_DTPREL64,
        tprel: R_AARCH64_TLS_TPREL64,
        tlsdesc: R_AARCH64_TLSDESC,
        abs_word: R_AARCH64_ABS64,
    },
    entry_of,
    scan,
    apply,
    stubs: &[FARCALL_STUB],
    plt: PltTemplates {
        plt0: PLT0_TEMPLATE,
        pltn: PLTN_TEMPLATE,
        align: 16,
    },
    patch_plt0,
    patch_pltn,
    gc_glue,
    unwind_segment_over: None,
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::base::ElfMachine;
    use crate::config::LinkerConfig;
    use crate::fragment::FragmentRef;
    use crate::reloc::ScanSymbol;
    use crate::base::FragId;

    fn apply_input(rtype: u32, s: u64, a: i64, p: u64, word: u64) -> ApplyInput {
        ApplyInput {
            rtype,
            s,
            a,
            p,
            got_slot: None,
            plt_entry: None,
            got_base: 0,
            tls_base: 0,
            tls_size: 0,
            tcb_size: 16,
            target_alloc: true,
            sym_weak_undef: false,
            sym_dyn: false,
            reserved: ReservedSlots::empty(),
            preemptible: false,
            is_exec: true,
            word,
        }
    }

    #[test]
    fn call26_encodes_word_offset() {
        // bl #0 at 0x1000 branching to 0x2000: offset 0x1000, imm26 0x400.
        let input = apply_input(R_AARCH64_CALL26, 0x2000, 0, 0x1000, 0x9400_0000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word, 0x9400_0400);
    }

    #[test]
    fn call26_overflows_past_128_mib() {
        let input = apply_input(R_AARCH64_CALL26, 0x1000_0000 + (1 << 27), 0, 0x1000_0000, 0x9400_0000);
        let (result, _) = apply(&input);
        assert_eq!(result, RelocResult::Overflow);
    }

    #[test]
    fn call_to_dropped_weak_undef_becomes_nop() {
        let mut input = apply_input(R_AARCH64_CALL26, 0, 0, 0x1000, 0x9400_0000);
        input.sym_weak_undef = true;
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word, u64::from(NOP));
    }

    #[test]
    fn branch_prefers_plt_entry() {
        let mut input = apply_input(R_AARCH64_CALL26, 0x9999_0000, 0, 0x1000, 0x9400_0000);
        input.reserved = ReservedSlots::PLT;
        input.plt_entry = Some(0x2000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word, 0x9400_0400);
    }

    #[test]
    fn abs32_range_checks_both_signs() {
        let ok = apply_input(R_AARCH64_ABS32, 0xffff_ffff, 0, 0, 0);
        assert_eq!(apply(&ok).0, RelocResult::Ok);
        let over = apply_input(R_AARCH64_ABS32, 1 << 33, 0, 0, 0);
        assert_eq!(apply(&over).0, RelocResult::Overflow);
    }

    #[test]
    fn adrp_page_arithmetic() {
        // adrp x0 at 0x1000 toward 0x3456: one page forward.
        let input = apply_input(R_AARCH64_ADR_PREL_PG_HI21, 0x3456, 0, 0x1000, 0x9000_0000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        // imm = 2 pages: immlo = 2 & 3, immhi = 0.
        assert_eq!(word, reencode_adr_imm(0x9000_0000, 2));
    }

    #[test]
    fn add_lo12_takes_page_offset() {
        let input = apply_input(R_AARCH64_ADD_ABS_LO12_NC, 0x3456, 0, 0x1000, 0x9100_0000);
        let (_, word) = apply(&input);
        assert_eq!(word, reencode_add_imm(0x9100_0000, 0x456));
    }

    #[test]
    fn got_relocs_without_slot_are_bad() {
        let input = apply_input(R_AARCH64_ADR_GOT_PAGE, 0x2000, 0, 0x1000, 0x9000_0000);
        assert_eq!(apply(&input).0, RelocResult::BadReloc);
    }

    #[test]
    fn tprel_includes_tcb() {
        let mut input = apply_input(R_AARCH64_TLSLE_ADD_TPREL_LO12_NC, 0x10, 0, 0, 0x9100_0000);
        input.tcb_size = 16;
        let (_, word) = apply(&input);
        assert_eq!(word, reencode_add_imm(0x9100_0000, 0x20));
    }

    fn scan_req<'a>(
        rtype: u32,
        sym: ScanSymbol,
        config: &'a LinkerConfig,
    ) -> ScanRequest<'a> {
        ScanRequest {
            rtype,
            addend: 0,
            place: FragmentRef::new(FragId::new(0), 0),
            sym,
            sym_name: "f",
            input_path: "a.o",
            origin_path: "libx.so",
            config,
            section_alloc: true,
            section_writable: false,
        }
    }

    fn global_sym() -> ScanSymbol {
        ScanSymbol {
            id: Some(crate::base::SymbolId::new(1)),
            is_local: false,
            is_weak_undef: false,
            is_undef: false,
            is_dyn: false,
            is_hidden: false,
            is_func: false,
            is_ifunc: false,
            is_tls: false,
            preemptible: false,
            reserved: ReservedSlots::empty(),
        }
    }

    #[test]
    fn got_scan_emits_glob_dat_for_preemptible() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut sym = global_sym();
        sym.preemptible = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ADR_GOT_PAGE, sym, &config), &mut out);
        let has_glob_dat = out.actions.iter().any(|a| {
            matches!(a, ScanAction::EmitDynReloc { reloc, .. } if reloc.rtype == R_AARCH64_GLOB_DAT)
        });
        assert!(has_glob_dat);
    }

    #[test]
    fn got_scan_uses_relative_for_hidden() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut sym = global_sym();
        sym.is_hidden = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ADR_GOT_PAGE, sym, &config), &mut out);
        let has_relative = out.actions.iter().any(|a| {
            matches!(a, ScanAction::EmitDynReloc { reloc, .. }
                if reloc.rtype == R_AARCH64_RELATIVE && reloc.symbol.is_none())
        });
        assert!(has_relative);
    }

    #[test]
    fn static_got_scan_avoids_dynamics() {
        let config = LinkerConfig::builder().machine(ElfMachine::AArch64).build();
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ADR_GOT_PAGE, global_sym(), &config), &mut out);
        assert_eq!(out.actions.len(), 1);
        assert!(matches!(
            out.actions[0],
            ScanAction::ReserveGot {
                holds_symbol_value: true,
                ..
            }
        ));
    }

    #[test]
    fn abs32_against_shared_data_requests_copy_reloc() {
        let config = LinkerConfig::builder().machine(ElfMachine::AArch64).build();
        let mut sym = global_sym();
        sym.is_dyn = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ABS32, sym, &config), &mut out);
        assert!(matches!(out.actions[0], ScanAction::CopyReloc { .. }));
    }

    #[test]
    fn nocopyreloc_turns_copy_into_error() {
        let mut config = LinkerConfig::builder().machine(ElfMachine::AArch64).build();
        config.no_copy_reloc = true;
        let mut sym = global_sym();
        sym.is_dyn = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ABS32, sym, &config), &mut out);
        assert!(matches!(
            &out.actions[0],
            ScanAction::Report {
                kind: DiagKind::CopyRelocProhibited,
                ..
            }
        ));
    }

    #[test]
    fn abs32_in_pic_is_invalid() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_ABS32, global_sym(), &config), &mut out);
        assert!(matches!(
            &out.actions[0],
            ScanAction::Report {
                kind: DiagKind::InvalidRelocForPic,
                ..
            }
        ));
    }

    #[test]
    fn call_to_preemptible_reserves_plt() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut sym = global_sym();
        sym.preemptible = true;
        sym.is_func = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_CALL26, sym, &config), &mut out);
        assert!(matches!(
            out.actions[0],
            ScanAction::ReservePlt {
                irelative: false,
                ..
            }
        ));
    }

    #[test]
    fn static_ifunc_call_uses_irelative() {
        let config = LinkerConfig::builder().machine(ElfMachine::AArch64).build();
        let mut sym = global_sym();
        sym.is_ifunc = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_CALL26, sym, &config), &mut out);
        assert!(matches!(
            out.actions[0],
            ScanAction::ReservePlt {
                irelative: true,
                ..
            }
        ));
    }

    #[test]
    fn tls_gd_reserves_two_word_slot_with_module_and_offset_relocs() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .pic(true)
            .build();
        let mut sym = global_sym();
        sym.is_tls = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_TLSGD_ADR_PAGE21, sym, &config), &mut out);
        assert!(matches!(
            out.actions[0],
            ScanAction::ReserveGot {
                kind: GotSlotKind::TlsGd,
                ..
            }
        ));
        let dtpmod = out.actions.iter().any(|a| {
            matches!(a, ScanAction::EmitDynReloc { reloc, .. } if reloc.rtype == R_AARCH64_TLS_DTPMOD64)
        });
        let dtprel = out.actions.iter().any(|a| {
            matches!(a, ScanAction::EmitDynReloc { reloc, .. } if reloc.rtype == R_AARCH64_TLS_DTPREL64)
        });
        assert!(dtpmod && dtprel);
    }

    #[test]
    fn scan_is_idempotent_once_bits_are_reserved() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut sym = global_sym();
        sym.preemptible = true;
        sym.is_func = true;
        sym.reserved = ReservedSlots::PLT;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_AARCH64_CALL26, sym, &config), &mut out);
        assert!(out.actions.is_empty());
    }

    #[test]
    fn farcall_selection_matches_range() {
        assert!(farcall_is_needed(R_AARCH64_CALL26));
        assert!(!farcall_is_needed(R_AARCH64_ABS64));
        assert!(farcall_in_range(R_AARCH64_CALL26, 70 << 20, 0));
        assert!(!farcall_in_range(R_AARCH64_CALL26, 200 << 20, 0));
    }

    #[test]
    fn erratum_sequence_is_detected_at_page_end() {
        let io = IoCtx::elf64_le();
        // Fragment whose third word sits at page offset 0xff8.
        let base = 0x1_0000 - 8;
        let mut data = Vec::new();
        let adrp_x1 = 0x9000_0001u32; // adrp x1, ...
        let str_insn = 0x3900_0041u32; // strb w1, [x2]
        let ldr_with_base_x1 = 0x3940_0020u32 | (1 << 5); // ldrb w0, [x1]
        for insn in [adrp_x1, str_insn, ldr_with_base_x1, 0xd503_201f] {
            data.extend_from_slice(&insn.to_le_bytes());
        }
        let hits = scan_erratum_843419(&data, base, io);
        assert_eq!(hits, vec![8]);
    }

    #[test]
    fn erratum_requires_page_end_adrp() {
        let io = IoCtx::elf64_le();
        let mut data = Vec::new();
        for insn in [0x9000_0001u32, 0x3900_0041, 0x3940_0020 | (1 << 5)] {
            data.extend_from_slice(&insn.to_le_bytes());
        }
        // Same words but nowhere near a page boundary.
        assert!(scan_erratum_843419(&data, 0x100, io).is_empty());
    }

    #[test]
    fn plt_entry_patching_reaches_its_slot() {
        let io = IoCtx::elf64_le();
        let mut bytes = PLTN_TEMPLATE.to_vec();
        patch_pltn(&mut bytes, io, 0x10000, 0x20008, 0);
        let adrp = io.read_word(&bytes[0..]).unwrap();
        // 0x20000 - 0x10000 = 0x10 pages.
        assert_eq!(u64::from(adrp), reencode_adr_imm(0x9000_0010, 0x10));
        let ldr = io.read_word(&bytes[4..]).unwrap();
        assert_eq!(u64::from(ldr), reencode_ldst_imm(0xf940_0211, 0x8 >> 3));
    }
}
