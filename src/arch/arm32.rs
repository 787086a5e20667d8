//! ARM (AArch32) backend: REL-format relocations, `--target2` policy
//! mapping, the exidx unwind glue, and the ARM-to-ARM veneer

use crate::base::IoCtx;
use crate::config::Target2Policy;
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

/// R_ARM_NONE
pub const R_ARM_NONE: u32 = 0;
/// R_ARM_PC24 (legacy branch)
pub const R_ARM_PC24: u32 = 1;
/// R_ARM_ABS32
pub const R_ARM_ABS32: u32 = 2;
/// R_ARM_REL32
pub const R_ARM_REL32: u32 = 3;
/// R_ARM_ABS16
pub const R_ARM_ABS16: u32 = 5;
/// R_ARM_ABS8
pub const R_ARM_ABS8: u32 = 8;
/// R_ARM_TLS_DTPMOD32
pub const R_ARM_TLS_DTPMOD32: u32 = 17;
/// R_ARM_TLS_DTPOFF32
pub const R_ARM_TLS_DTPOFF32: u32 = 18;
/// R_ARM_TLS_TPOFF32
pub const R_ARM_TLS_TPOFF32: u32 = 19;
/// R_ARM_COPY
pub const R_ARM_COPY: u32 = 20;
/// R_ARM_GLOB_DAT
pub const R_ARM_GLOB_DAT: u32 = 21;
/// R_ARM_JUMP_SLOT
pub const R_ARM_JUMP_SLOT: u32 = 22;
/// R_ARM_RELATIVE
pub const R_ARM_RELATIVE: u32 = 23;
/// R_ARM_GOTOFF32
pub const R_ARM_GOTOFF32: u32 = 24;
/// R_ARM_BASE_PREL
pub const R_ARM_BASE_PREL: u32 = 25;
/// R_ARM_GOT_BREL
pub const R_ARM_GOT_BREL: u32 = 26;
/// R_ARM_PLT32
pub const R_ARM_PLT32: u32 = 27;
/// R_ARM_CALL
pub const R_ARM_CALL: u32 = 28;
/// R_ARM_JUMP24
pub const R_ARM_JUMP24: u32 = 29;
/// R_ARM_TARGET1
pub const R_ARM_TARGET1: u32 = 38;
/// R_ARM_V4BX
pub const R_ARM_V4BX: u32 = 40;
/// R_ARM_TARGET2
pub const R_ARM_TARGET2: u32 = 41;
/// R_ARM_PREL31
pub const R_ARM_PREL31: u32 = 42;
/// R_ARM_MOVW_ABS_NC
pub const R_ARM_MOVW_ABS_NC: u32 = 43;
/// R_ARM_MOVT_ABS
pub const R_ARM_MOVT_ABS: u32 = 44;
/// R_ARM_GOT_PREL
pub const R_ARM_GOT_PREL: u32 = 96;
/// R_ARM_TLS_GD32
pub const R_ARM_TLS_GD32: u32 = 104;
/// R_ARM_TLS_LDM32
pub const R_ARM_TLS_LDM32: u32 = 105;
/// R_ARM_TLS_LDO32
pub const R_ARM_TLS_LDO32: u32 = 106;
/// R_ARM_TLS_IE32
pub const R_ARM_TLS_IE32: u32 = 107;
/// R_ARM_TLS_LE32
pub const R_ARM_TLS_LE32: u32 = 108;
/// R_ARM_IRELATIVE
pub const R_ARM_IRELATIVE: u32 = 160;

/// `R_ARM_TARGET1` resolves to ABS32 on this platform; `R_ARM_TARGET2`
/// follows the `--target2=` policy. The reader rewrites both before any
/// scanning so the rest of the pipeline only sees concrete types.
pub fn resolve_target2(policy: Target2Policy) -> u32 {
    match policy {
        Target2Policy::GotRel => R_ARM_GOT_PREL,
        Target2Policy::Rel => R_ARM_REL32,
        Target2Policy::Abs => R_ARM_ABS32,
    }
}

/// Splice a 24-bit word offset into B/BL
pub fn reencode_branch24(insn: u64, imm: u64) -> u64 {
    (insn & 0xff00_0000) | (imm & 0x00ff_ffff)
}

/// Splice the split 16-bit immediate of MOVW/MOVT
pub fn reencode_movw(insn: u64, imm: u64) -> u64 {
    (insn & 0xfff0_f000) | ((imm & 0xf000) << 4) | (imm & 0xfff)
}

const T: &[(u32, RelocEntry)] = &[
    (R_ARM_NONE, RelocEntry::new("R_ARM_NONE", 0, false, FieldKind::Data)),
    (
        R_ARM_PC24,
        RelocEntry::shifted("R_ARM_PC24", 24, true, 4, 2, FieldKind::ArmBranch24),
    ),
    (R_ARM_ABS32, RelocEntry::new("R_ARM_ABS32", 32, false, FieldKind::Data)),
    (R_ARM_REL32, RelocEntry::new("R_ARM_REL32", 32, true, FieldKind::Data)),
    (R_ARM_ABS16, RelocEntry::new("R_ARM_ABS16", 16, false, FieldKind::Data)),
    (R_ARM_ABS8, RelocEntry::new("R_ARM_ABS8", 8, false, FieldKind::Data)),
    (R_ARM_TLS_DTPMOD32, RelocEntry::new("R_ARM_TLS_DTPMOD32", 32, false, FieldKind::Data)),
    (R_ARM_TLS_DTPOFF32, RelocEntry::new("R_ARM_TLS_DTPOFF32", 32, false, FieldKind::Data)),
    (R_ARM_TLS_TPOFF32, RelocEntry::new("R_ARM_TLS_TPOFF32", 32, false, FieldKind::Data)),
    (R_ARM_COPY, RelocEntry::new("R_ARM_COPY", 0, false, FieldKind::Data)),
    (R_ARM_GLOB_DAT, RelocEntry::new("R_ARM_GLOB_DAT", 32, false, FieldKind::Data)),
    (R_ARM_JUMP_SLOT, RelocEntry::new("R_ARM_JUMP_SLOT", 32, false, FieldKind::Data)),
    (R_ARM_RELATIVE, RelocEntry::new("R_ARM_RELATIVE", 32, false, FieldKind::Data)),
    (R_ARM_GOTOFF32, RelocEntry::new("R_ARM_GOTOFF32", 32, true, FieldKind::Data)),
    (R_ARM_BASE_PREL, RelocEntry::new("R_ARM_BASE_PREL", 32, true, FieldKind::Data)),
    (R_ARM_GOT_BREL, RelocEntry::new("R_ARM_GOT_BREL", 32, true, FieldKind::Data)),
    (
        R_ARM_PLT32,
        RelocEntry::shifted("R_ARM_PLT32", 24, true, 4, 2, FieldKind::ArmBranch24),
    ),
    (
        R_ARM_CALL,
        RelocEntry::shifted("R_ARM_CALL", 24, true, 4, 2, FieldKind::ArmBranch24),
    ),
    (
        R_ARM_JUMP24,
        RelocEntry::shifted("R_ARM_JUMP24", 24, true, 4, 2, FieldKind::ArmBranch24),
    ),
    (R_ARM_TARGET1, RelocEntry::new("R_ARM_TARGET1", 32, false, FieldKind::Data)),
    (R_ARM_V4BX, RelocEntry::new("R_ARM_V4BX", 0, false, FieldKind::Data)),
    (R_ARM_TARGET2, RelocEntry::new("R_ARM_TARGET2", 32, false, FieldKind::Data)),
    (R_ARM_PREL31, RelocEntry::new("R_ARM_PREL31", 31, true, FieldKind::ArmPrel31)),
    (R_ARM_MOVW_ABS_NC, RelocEntry::new("R_ARM_MOVW_ABS_NC", 16, false, FieldKind::Data)),
    (R_ARM_MOVT_ABS, RelocEntry::new("R_ARM_MOVT_ABS", 16, false, FieldKind::Data)),
    (R_ARM_GOT_PREL, RelocEntry::new("R_ARM_GOT_PREL", 32, true, FieldKind::Data)),
    (R_ARM_TLS_GD32, RelocEntry::new("R_ARM_TLS_GD32", 32, true, FieldKind::Data)),
    (R_ARM_TLS_LDM32, RelocEntry::new("R_ARM_TLS_LDM32", 32, true, FieldKind::Data)),
    (R_ARM_TLS_LDO32, RelocEntry::new("R_ARM_TLS_LDO32", 32, false, FieldKind::Data)),
    (R_ARM_TLS_IE32, RelocEntry::new("R_ARM_TLS_IE32", 32, true, FieldKind::Data)),
    (R_ARM_TLS_LE32, RelocEntry::new("R_ARM_TLS_LE32", 32, false, FieldKind::Data)),
    (R_ARM_IRELATIVE, RelocEntry::new("R_ARM_IRELATIVE", 32, false, FieldKind::Data)),
];

/// Table lookup for this target
pub fn entry_of(rtype: u32) -> Option<&'static RelocEntry> {
    T.iter().find(|(t, _)| *t == rtype).map(|(_, e)| e)
}

/// ARM NOP (mov r0, r0)
pub const NOP: u32 = 0xe1a0_0000;

/// Apply one relocation
pub fn apply(input: &ApplyInput) -> (RelocResult, u64) {
    let Some(entry) = entry_of(input.rtype) else {
        return (RelocResult::Unknown, input.word);
    };
    let a = input.a;
    let p = input.p as i64;

    match input.rtype {
        R_ARM_NONE | R_ARM_V4BX => (RelocResult::Ok, input.word),

        R_ARM_ABS32 | R_ARM_TARGET1 | R_ARM_ABS16 | R_ARM_ABS8 => {
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

        R_ARM_REL32 => {
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PC24 | R_ARM_PLT32 => {
            if input.sym_weak_undef && !input.sym_dyn && !input.reserved.contains(ReservedSlots::PLT)
            {
                return (RelocResult::Ok, u64::from(NOP));
            }
            let x = (input.s_via_plt() as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, reencode_branch24(input.word, (x >> 2) as u64))
        }

        R_ARM_PREL31 => {
            let x = (input.s as i64).wrapping_add(a).wrapping_sub(p);
            let check = verify_field(entry, x);
            if check != RelocResult::Ok {
                return (check, input.word);
            }
            (RelocResult::Ok, deposit(input.word, 31, x as u64))
        }

        R_ARM_MOVW_ABS_NC => {
            let x = (input.s_via_plt() as i64).wrapping_add(a) as u64;
            (RelocResult::Ok, reencode_movw(input.word, x & 0xffff))
        }
        R_ARM_MOVT_ABS => {
            let x = (input.s_via_plt() as i64).wrapping_add(a) as u64;
            (RelocResult::Ok, reencode_movw(input.word, (x >> 16) & 0xffff))
        }

        R_ARM_GOT_BREL => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            let x = (got as i64)
                .wrapping_add(a)
                .wrapping_sub(input.got_base as i64);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_GOT_PREL | R_ARM_TLS_GD32 | R_ARM_TLS_LDM32 | R_ARM_TLS_IE32 => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            let x = (got as i64).wrapping_add(a).wrapping_sub(p);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_BASE_PREL => {
            let x = (input.got_base as i64).wrapping_add(a).wrapping_sub(p);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_GOTOFF32 => {
            let x = (input.s as i64)
                .wrapping_add(a)
                .wrapping_sub(input.got_base as i64);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_TLS_LDO32 => {
            let x = (input.s as i64).wrapping_add(a);
            (RelocResult::Ok, deposit(input.word, 32, x as u64))
        }

        R_ARM_TLS_LE32 => {
            let tpoff = input.tcb_size.wrapping_add(input.s).wrapping_add(a as u64);
            (RelocResult::Ok, deposit(input.word, 32, tpoff))
        }

        _ => (RelocResult::Unsupported, input.word),
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

/// Scan one relocation into the action stream
pub fn scan(req: &ScanRequest, out: &mut ScanOutcome) {
    if !req.section_alloc {
        return;
    }
    if req.config.is_code_indep() && req.rtype == R_ARM_TLS_LE32 {
        out.push(ScanAction::Report {
            kind: DiagKind::InvalidRelocForPic,
            args: vec![
                "R_ARM_TLS_LE32".to_string(),
                req.sym_name.to_string(),
                req.input_path.to_string(),
            ],
        });
        return;
    }

    match req.rtype {
        R_ARM_ABS32 | R_ARM_TARGET1 => {
            if req.sym.is_local {
                if req.config.is_code_indep() {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype: R_ARM_RELATIVE,
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
            if req.sym.preemptible && req.sym.is_func && !req.sym.reserved.contains(ReservedSlots::PLT)
            {
                if let Some(symbol) = req.sym.id {
                    out.push(ScanAction::ReservePlt {
                        symbol,
                        irelative: false,
                    });
                }
            }
            let needs = if req.config.is_code_indep() {
                true
            } else {
                req.sym.is_dyn
            };
            if needs {
                if copy_reloc_candidate(req) {
                    push_copy_or_error(req, out);
                } else {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype: if req.sym.preemptible {
                                R_ARM_ABS32
                            } else {
                                R_ARM_RELATIVE
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

        R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PC24 | R_ARM_PLT32 => {
            if req.sym.is_local || req.sym.reserved.contains(ReservedSlots::PLT) {
                return;
            }
            if req.sym.is_ifunc && req.config.is_static() {
                if let Some(symbol) = req.sym.id {
                    out.push(ScanAction::ReservePlt {
                        symbol,
                        irelative: true,
                    });
                }
                return;
            }
            if req.sym.preemptible {
                if let Some(symbol) = req.sym.id {
                    out.push(ScanAction::ReservePlt {
                        symbol,
                        irelative: false,
                    });
                }
            }
        }

        R_ARM_GOT_BREL | R_ARM_GOT_PREL => {
            let Some(symbol) = req.sym.id else { return };
            if req.sym.reserved.contains(ReservedSlots::GOT) {
                return;
            }
            let has_rel = if req.sym.is_local {
                req.config.is_code_indep()
            } else {
                !req.config.is_static()
            };
            let use_relative = req.sym.is_hidden
                || (!req.config.is_normal_exec() && !req.sym.preemptible)
                || req.sym.is_local;
            out.push(ScanAction::ReserveGot {
                symbol,
                kind: GotSlotKind::Regular,
                holds_symbol_value: !has_rel || use_relative,
            });
            if has_rel {
                out.push(ScanAction::EmitDynReloc {
                    home: DynRelocHome::Dyn,
                    reloc: DynReloc {
                        rtype: if use_relative {
                            R_ARM_RELATIVE
                        } else {
                            R_ARM_GLOB_DAT
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
        }

        R_ARM_TLS_GD32 => {
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
                for (rtype, word, with_symbol) in [
                    (R_ARM_TLS_DTPMOD32, 0u64, true),
                    (R_ARM_TLS_DTPOFF32, 1, true),
                ] {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype,
                            symbol: if with_symbol { Some(symbol) } else { None },
                            at: DynTarget::GotSlot {
                                symbol,
                                kind: GotSlotKind::TlsGd,
                                word,
                            },
                            addend: 0,
                        },
                        reserve_rel_for: None,
                    });
                }
            }
        }

        R_ARM_TLS_LDM32 => {
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
                        rtype: R_ARM_TLS_DTPMOD32,
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

        R_ARM_TLS_IE32 => {
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
                        rtype: R_ARM_TLS_TPOFF32,
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

// ldr pc, [pc, #-4] ; .word target
const VENEER_TEMPLATE: &[u8] = &[0x04, 0xf0, 0x1f, 0xe5, 0x00, 0x00, 0x00, 0x00];

const VENEER_FIXUPS: &[StubFixup] = &[StubFixup {
    offset: 4,
    rtype: R_ARM_ABS32,
    addend: 0,
}];

fn veneer_is_needed(rtype: u32) -> bool {
    matches!(rtype, R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PC24 | R_ARM_PLT32)
}

fn veneer_in_range(_rtype: u32, target: i64, place: i64) -> bool {
    let distance = target.wrapping_sub(place);
    (-(1 << 25)..(1 << 25)).contains(&distance)
}

/// The ARM-to-ARM long-branch veneer
pub const ARM_TO_ARM_STUB: StubPrototype = StubPrototype {
    name: "arm_to_arm_veneer",
    template: VENEER_TEMPLATE,
    align: 4,
    fixups: VENEER_FIXUPS,
    is_needed: veneer_is_needed,
    in_range: veneer_in_range,
    supports_pic: false,
};

// ldr ip, [pc] ; ldr pc, [ip] ; .word slot
const PLT0_TEMPLATE: &[u8] = &[
    0x00, 0xc0, 0x9f, 0xe5, 0x00, 0xf0, 0x9c, 0xe5, 0x00, 0x00, 0x00, 0x00,
];
const PLTN_TEMPLATE: &[u8] = &[
    0x00, 0xc0, 0x9f, 0xe5, 0x00, 0xf0, 0x9c, 0xe5, 0x00, 0x00, 0x00, 0x00,
];

fn patch_plt0(bytes: &mut [u8], io: IoCtx, _plt0_addr: u64, gotplt_addr: u64) {
    io.patch_word(bytes, 8, gotplt_addr as u32);
}

fn patch_pltn(bytes: &mut [u8], io: IoCtx, _entry_addr: u64, slot_addr: u64, _plt0: u64) {
    io.patch_word(bytes, 8, slot_addr as u32);
}

fn gc_glue(name: &str) -> Option<String> {
    // Keeping a code section keeps its unwind index alive too.
    if name.starts_with(".ARM.exidx") || !name.starts_with('.') {
        return None;
    }
    Some(format!(".ARM.exidx{name}"))
}

/// The ARM backend table
pub static BACKEND: TargetBackend = TargetBackend {
    machine: crate::base::ElfMachine::Arm,
    io: IoCtx {
        class: crate::base::ElfClass::Elf32,
        encoding: crate::base::ElfDataEncoding::LittleEndian,
    },
    is_rela: false,
    page_size: 0x1000,
    entry_symbol: "_start",
    dynamic_linker: "/lib/ld-linux.so.3",
    e_flags: 0x0500_0000,
    tcb_size: 8,
    dyn_relocs: DynRelocTypes {
        none: R_ARM_NONE,
        relative: R_ARM_RELATIVE,
        glob_dat: R_ARM_GLOB_DAT,
        jump_slot: R_ARM_JUMP_SLOT,
        irelative: R_ARM_IRELATIVE,
        copy: R_ARM_COPY,
        dtpmod: R_ARM_TLS_DTPMOD32,
        dtprel: R_ARM_TLS_DTPOFF32,
        tprel: R_ARM_TLS_TPOFF32,
        tlsdesc: 90,
        abs_word: R_ARM_ABS32,
    },
    entry_of,
    scan,
    apply,
    stubs: &[ARM_TO_ARM_STUB],
    plt: PltTemplates {
        plt0: PLT0_TEMPLATE,
        pltn: PLTN_TEMPLATE,
        align: 4,
    },
    patch_plt0,
    patch_pltn,
    gc_glue,
    unwind_segment_over: Some(".ARM.exidx"),
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

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
            tcb_size: 8,
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
    fn bl_encodes_word_offset() {
        // bl at 0x8000 to 0x9000: offset 0x1000 bytes, imm24 = 0x400.
        // The assembler leaves -8 (pipeline bias) in the field, carried
        // through the addend on REL targets.
        let input = apply_input(R_ARM_CALL, 0x9000, -8, 0x8000, 0xeb00_0000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word, 0xeb00_03fe);
    }

    #[test]
    fn branch_overflow_past_32_mib() {
        let input = apply_input(R_ARM_JUMP24, 33 << 20, 0, 0, 0xea00_0000);
        assert_eq!(apply(&input).0, RelocResult::Overflow);
    }

    #[test]
    fn prel31_keeps_top_bit() {
        let input = apply_input(R_ARM_PREL31, 0x9000, 0, 0x8000, 0x8000_0000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word, 0x8000_1000);
    }

    #[test]
    fn movw_movt_split_the_value() {
        let (_, low) = apply(&apply_input(R_ARM_MOVW_ABS_NC, 0x1234_5678, 0, 0, 0xe300_0000));
        assert_eq!(low, reencode_movw(0xe300_0000, 0x5678));
        let (_, high) = apply(&apply_input(R_ARM_MOVT_ABS, 0x1234_5678, 0, 0, 0xe340_0000));
        assert_eq!(high, reencode_movw(0xe340_0000, 0x1234));
    }

    #[test]
    fn tls_le_adds_tcb() {
        let (_, word) = apply(&apply_input(R_ARM_TLS_LE32, 0x10, 0, 0, 0));
        assert_eq!(word, 0x18);
    }

    #[test]
    fn target2_policy_mapping() {
        assert_eq!(resolve_target2(Target2Policy::GotRel), R_ARM_GOT_PREL);
        assert_eq!(resolve_target2(Target2Policy::Rel), R_ARM_REL32);
        assert_eq!(resolve_target2(Target2Policy::Abs), R_ARM_ABS32);
    }

    #[test]
    fn exidx_glue_edges() {
        assert_eq!(
            gc_glue(".text.main"),
            Some(".ARM.exidx.text.main".to_string())
        );
        assert_eq!(gc_glue(".ARM.exidx.text.main"), None);
    }

    #[test]
    fn veneer_range() {
        assert!(veneer_in_range(R_ARM_CALL, 31 << 20, 0));
        assert!(!veneer_in_range(R_ARM_CALL, 33 << 20, 0));
    }
}
