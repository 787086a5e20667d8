//! x86-64 backend: relocation table and formulas, scan semantics, and the
//! lazy-binding PLT shape. No stub prototypes: every branch reach is
//! covered by the 32-bit displacement plus the PLT.

use crate::base::IoCtx;
use crate::diag::DiagKind;
use crate::fragment::GotSlotKind;
use crate::gotplt::PltTemplates;
use crate::reloc::{
    deposit, verify_field, ApplyInput, DynReloc, DynRelocHome, DynTarget, FieldKind, RelocEntry,
    RelocResult, ScanAction, ScanOutcome, ScanRequest,
};
use crate::symbol::ReservedSlots;

use super::{DynRelocTypes, TargetBackend};

/// R_X86_64_NONE
pub const R_X86_64_NONE: u32 = 0;
/// R_X86_64_64
pub const R_X86_64_64: u32 = 1;
/// R_X86_64_PC32
pub const R_X86_64_PC32: u32 = 2;
/// R_X86_64_GOT32
pub const R_X86_64_GOT32: u32 = 3;
/// R_X86_64_PLT32
pub const R_X86_64_PLT32: u32 = 4;
/// R_X86_64_COPY
pub const R_X86_64_COPY: u32 = 5;
/// R_X86_64_GLOB_DAT
pub const R_X86_64_GLOB_DAT: u32 = 6;
/// R_X86_64_JUMP_SLOT
pub const R_X86_64_JUMP_SLOT: u32 = 7;
/// R_X86_64_RELATIVE
pub const R_X86_64_RELATIVE: u32 = 8;
/// R_X86_64_GOTPCREL
pub const R_X86_64_GOTPCREL: u32 = 9;
/// R_X86_64_32
pub const R_X86_64_32: u32 = 10;
/// R_X86_64_32S
pub const R_X86_64_32S: u32 = 11;
/// R_X86_64_16
pub const R_X86_64_16: u32 = 12;
/// R_X86_64_PC16
pub const R_X86_64_PC16: u32 = 13;
/// R_X86_64_8
pub const R_X86_64_8: u32 = 14;
/// R_X86_64_PC8
pub const R_X86_64_PC8: u32 = 15;
/// R_X86_64_DTPMOD64
pub const R_X86_64_DTPMOD64: u32 = 16;
/// R_X86_64_DTPOFF64
pub const R_X86_64_DTPOFF64: u32 = 17;
/// R_X86_64_TPOFF64
pub const R_X86_64_TPOFF64: u32 = 18;
/// R_X86_64_TLSGD
pub const R_X86_64_TLSGD: u32 = 19;
/// R_X86_64_TLSLD
pub const R_X86_64_TLSLD: u32 = 20;
/// R_X86_64_DTPOFF32
pub const R_X86_64_DTPOFF32: u32 = 21;
/// R_X86_64_GOTTPOFF
pub const R_X86_64_GOTTPOFF: u32 = 22;
/// R_X86_64_TPOFF32
pub const R_X86_64_TPOFF32: u32 = 23;
/// R_X86_64_PC64
pub const R_X86_64_PC64: u32 = 24;
/// R_X86_64_GOTOFF64
pub const R_X86_64_GOTOFF64: u32 = 25;
/// R_X86_64_GOTPC32
pub const R_X86_64_GOTPC32: u32 = 26;
/// R_X86_64_IRELATIVE
pub const R_X86_64_IRELATIVE: u32 = 37;
/// R_X86_64_GOTPCRELX
pub const R_X86_64_GOTPCRELX: u32 = 41;
/// R_X86_64_REX_GOTPCRELX
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

const T: &[(u32, RelocEntry)] = &[
    (R_X86_64_NONE, RelocEntry::new("R_X86_64_NONE", 0, false, FieldKind::Data)),
    (R_X86_64_64, RelocEntry::new("R_X86_64_64", 64, false, FieldKind::Data)),
    (R_X86_64_PC32, RelocEntry::new("R_X86_64_PC32", 32, true, FieldKind::Data)),
    (R_X86_64_GOT32, RelocEntry::new("R_X86_64_GOT32", 32, true, FieldKind::Data)),
    (R_X86_64_PLT32, RelocEntry::new("R_X86_64_PLT32", 32, true, FieldKind::Data)),
    (R_X86_64_COPY, RelocEntry::new("R_X86_64_COPY", 0, false, FieldKind::Data)),
    (R_X86_64_GLOB_DAT, RelocEntry::new("R_X86_64_GLOB_DAT", 64, false, FieldKind::Data)),
    (R_X86_64_JUMP_SLOT, RelocEntry::new("R_X86_64_JUMP_SLOT", 64, false, FieldKind::Data)),
    (R_X86_64_RELATIVE, RelocEntry::new("R_X86_64_RELATIVE", 64, false, FieldKind::Data)),
    (R_X86_64_GOTPCREL, RelocEntry::new("R_X86_64_GOTPCREL", 32, true, FieldKind::Data)),
    (R_X86_64_32, RelocEntry::new("R_X86_64_32", 32, false, FieldKind::Data)),
    (R_X86_64_32S, RelocEntry::new("R_X86_64_32S", 32, true, FieldKind::Data)),
    (R_X86_64_16, RelocEntry::new("R_X86_64_16", 16, false, FieldKind::Data)),
    (R_X86_64_PC16, RelocEntry::new("R_X86_64_PC16", 16, true, FieldKind::Data)),
    (R_X86_64_8, RelocEntry::new("R_X86_64_8", 8, false, FieldKind::Data)),
    (R_X86_64_PC8, RelocEntry::new("R_X86_64_PC8", 8, true, FieldKind::Data)),
    (R_X86_64_DTPMOD64, RelocEntry::new("R_X86_64_DTPMOD64", 64, false, FieldKind::Data)),
    (R_X86_64_DTPOFF64, RelocEntry::new("R_X86_64_DTPOFF64", 64, false, FieldKind::Data)),
    (R_X86_64_TPOFF64, RelocEntry::new("R_X86_64_TPOFF64", 64, false, FieldKind::Data)),
    (R_X86_64_TLSGD, RelocEntry::new("R_X86_64_TLSGD", 32, true, FieldKind::Data)),
    (R_X86_64_TLSLD, RelocEntry::new("R_X86_64_TLSLD", 32, true, FieldKind::Data)),
    (R_X86_64_DTPOFF32, RelocEntry::new("R_X86_64_DTPOFF32", 32, true, FieldKind::Data)),
    (R_X86_64_GOTTPOFF, RelocEntry::new("R_X86_64_GOTTPOFF", 32, true, FieldKind::Data)),
    (R_X86_64_TPOFF32, RelocEntry::new("R_X86_64_TPOFF32", 32, true, FieldKind::Data)),
    (R_X86_64_PC64, RelocEntry::new("R_X86_64_PC64", 64, true, FieldKind::Data)),
    (R_X86_64_GOTOFF64, RelocEntry::new("R_X86_64_GOTOFF64", 64, true, FieldKind::Data)),
    (R_X86_64_GOTPC32, RelocEntry::new("R_X86_64_GOTPC32", 32, true, FieldKind::Data)),
    (R_X86_64_IRELATIVE, RelocEntry::new("R_X86_64_IRELATIVE", 64, false, FieldKind::Data)),
    (R_X86_64_GOTPCRELX, RelocEntry::new("R_X86_64_GOTPCRELX", 32, true, FieldKind::Data)),
    (
        R_X86_64_REX_GOTPCRELX,
        RelocEntry::new("R_X86_64_REX_GOTPCRELX", 32, true, FieldKind::Data),
    ),
];

/// Table lookup for this target
pub fn entry_of(rtype: u32) -> Option<&'static RelocEntry> {
    T.iter().find(|(t, _)| *t == rtype).map(|(_, e)| e)
}

/// Apply one relocation. Every x86-64 field is a plain data word, so the
/// splice path is uniform and only the value formula varies by type.
pub fn apply(input: &ApplyInput) -> (RelocResult, u64) {
    let Some(entry) = entry_of(input.rtype) else {
        return (RelocResult::Unknown, input.word);
    };
    let a = input.a;
    let p = input.p as i64;

    let value: i64 = match input.rtype {
        R_X86_64_NONE => return (RelocResult::Ok, input.word),
        R_X86_64_COPY | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_RELATIVE
        | R_X86_64_IRELATIVE | R_X86_64_DTPMOD64 | R_X86_64_DTPOFF64 | R_X86_64_TPOFF64 => {
            return (RelocResult::Unsupported, input.word)
        }

        R_X86_64_64 | R_X86_64_32 | R_X86_64_32S | R_X86_64_16 | R_X86_64_8 => {
            if input.target_alloc && input.reserved.contains(ReservedSlots::REL) && input.preemptible
            {
                return (RelocResult::Ok, input.word);
            }
            let mut s = input.s_via_plt() as i64;
            if input.sym_weak_undef && input.is_exec {
                s = 0;
            }
            s.wrapping_add(a)
        }

        R_X86_64_PC64 | R_X86_64_PC32 | R_X86_64_PC16 | R_X86_64_PC8 => {
            let mut s = input.s_via_plt() as i64;
            if input.sym_weak_undef && input.is_exec {
                s = p;
            }
            s.wrapping_add(a).wrapping_sub(p)
        }

        R_X86_64_PLT32 => {
            let l = input.s_via_plt() as i64;
            l.wrapping_add(a).wrapping_sub(p)
        }

        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_GOTTPOFF
        | R_X86_64_TLSGD | R_X86_64_TLSLD => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            (got as i64).wrapping_add(a).wrapping_sub(p)
        }

        R_X86_64_GOTPC32 => (input.got_base as i64).wrapping_add(a).wrapping_sub(p),
        R_X86_64_GOTOFF64 => (input.s as i64)
            .wrapping_add(a)
            .wrapping_sub(input.got_base as i64),
        R_X86_64_GOT32 => {
            let Some(got) = input.got_slot else {
                return (RelocResult::BadReloc, input.word);
            };
            (got as i64).wrapping_add(a).wrapping_sub(input.got_base as i64)
        }

        // The thread pointer sits at the end of the static TLS block, so
        // LE offsets come out negative.
        R_X86_64_TPOFF32 => (input.s as i64)
            .wrapping_add(a)
            .wrapping_sub(input.tls_size as i64),
        R_X86_64_DTPOFF32 => (input.s as i64).wrapping_add(a),

        _ => return (RelocResult::Unsupported, input.word),
    };

    let check = verify_field(entry, value);
    if check != RelocResult::Ok {
        return (check, input.word);
    }
    (RelocResult::Ok, deposit(input.word, entry.bits, value as u64))
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
                    R_X86_64_RELATIVE
                } else {
                    R_X86_64_GLOB_DAT
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

/// Scan one relocation into the action stream
pub fn scan(req: &ScanRequest, out: &mut ScanOutcome) {
    if !req.section_alloc {
        return;
    }
    if req.config.is_code_indep()
        && matches!(req.rtype, R_X86_64_32 | R_X86_64_32S | R_X86_64_TPOFF32)
    {
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
        return;
    }

    match req.rtype {
        R_X86_64_64 => {
            if req.sym.is_local {
                if req.config.is_code_indep() {
                    out.push(ScanAction::EmitDynReloc {
                        home: DynRelocHome::Dyn,
                        reloc: DynReloc {
                            rtype: R_X86_64_RELATIVE,
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
                                R_X86_64_64
                            } else {
                                R_X86_64_RELATIVE
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

        R_X86_64_32 | R_X86_64_32S | R_X86_64_16 | R_X86_64_8 => {
            if !req.sym.is_local && copy_reloc_candidate(req) {
                push_copy_or_error(req, out);
            }
        }

        R_X86_64_PC64 | R_X86_64_PC32 | R_X86_64_PC16 | R_X86_64_PC8 => {
            if req.sym.is_local {
                return;
            }
            if req.sym.preemptible
                && req.sym.is_func
                && req.config.codegen != crate::config::CodeGenType::DynObj
                && !req.sym.reserved.contains(ReservedSlots::PLT)
            {
                if let Some(symbol) = req.sym.id {
                    out.push(ScanAction::ReservePlt {
                        symbol,
                        irelative: false,
                    });
                }
            }
            if copy_reloc_candidate(req) {
                push_copy_or_error(req, out);
            }
        }

        R_X86_64_PLT32 => {
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

        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_GOT32
        | R_X86_64_GOTPC32 => {
            if req.rtype != R_X86_64_GOTPC32 {
                reserve_regular_got(req, out);
            }
        }

        R_X86_64_TLSGD => {
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
                        rtype: R_X86_64_DTPMOD64,
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
                        rtype: R_X86_64_DTPOFF64,
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

        R_X86_64_TLSLD => {
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
                        rtype: R_X86_64_DTPMOD64,
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

        R_X86_64_GOTTPOFF => {
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
                        rtype: R_X86_64_TPOFF64,
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

        R_X86_64_DTPOFF32 | R_X86_64_TPOFF32 | R_X86_64_GOTOFF64 => {}

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

// push GOT+8(%rip) / jmp *GOT+16(%rip) / 4 bytes of nop padding
const PLT0_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0x00, 0x00, 0x00, 0x00, 0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90,
    0x90,
];

// jmp *slot(%rip) / push $index / jmp PLT0
const PLTN_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0x68, 0x00, 0x00, 0x00, 0x00, 0xe9, 0x00, 0x00, 0x00,
    0x00,
];

fn patch_rel32(bytes: &mut [u8], io: IoCtx, at: usize, target: u64, next_insn: u64) {
    let rel = target.wrapping_sub(next_insn) as u32;
    io.patch_word(bytes, at, rel);
}

fn patch_plt0(bytes: &mut [u8], io: IoCtx, plt0_addr: u64, gotplt_addr: u64) {
    patch_rel32(bytes, io, 2, gotplt_addr + 8, plt0_addr + 6);
    patch_rel32(bytes, io, 8, gotplt_addr + 16, plt0_addr + 12);
}

fn patch_pltn(bytes: &mut [u8], io: IoCtx, entry_addr: u64, slot_addr: u64, plt0_addr: u64) {
    patch_rel32(bytes, io, 2, slot_addr, entry_addr + 6);
    patch_rel32(bytes, io, 12, plt0_addr, entry_addr + 16);
}

fn gc_glue(_name: &str) -> Option<String> {
    None
}

/// The x86-64 backend table
pub static BACKEND: TargetBackend = TargetBackend {
    machine: crate::base::ElfMachine::X86_64,
    io: IoCtx {
        class: crate::base::ElfClass::Elf64,
        encoding: crate::base::ElfDataEncoding::LittleEndian,
    },
    is_rela: true,
    page_size: 0x1000,
    entry_symbol: "_start",
    dynamic_linker: "/lib64/ld-linux-x86-64.so.2",
    e_flags: 0,
    tcb_size: 0,
    dyn_relocs: DynRelocTypes {
        none: R_X86_64_NONE,
        relative: R_X86_64_RELATIVE,
        glob_dat: R_X86_64_GLOB_DAT,
        jump_slot: R_X86_64_JUMP_SLOT,
        irelative: R_X86_64_IRELATIVE,
        copy: R_X86_64_COPY,
        dtpmod: R_X86_64_DTPMOD64,
        dtprel: R_X86_64_DTPOFF64,
        tprel: R_X86_64_TPOFF64,
        tlsdesc: 36,
        abs_word: R_X86_64_64,
    },
    entry_of,
    scan,
    apply,
    stubs: &[],
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
    use crate::base::{ElfMachine, FragId, SymbolId};
    use crate::config::LinkerConfig;
    use crate::fragment::FragmentRef;
    use crate::reloc::ScanSymbol;

    fn apply_input(rtype: u32, s: u64, a: i64, p: u64) -> ApplyInput {
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
            tcb_size: 0,
            target_alloc: true,
            sym_weak_undef: false,
            sym_dyn: false,
            reserved: ReservedSlots::empty(),
            preemptible: false,
            is_exec: true,
            word: 0,
        }
    }

    #[test]
    fn pc32_is_signed_and_range_checked() {
        let input = apply_input(R_X86_64_PC32, 0x1000, -4, 0x2000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word as u32, (-0x1004i32) as u32);
        let far = apply_input(R_X86_64_PC32, 1 << 40, 0, 0);
        assert_eq!(apply(&far).0, RelocResult::Overflow);
    }

    #[test]
    fn plt32_branches_through_the_plt() {
        let mut input = apply_input(R_X86_64_PLT32, 0x9000_0000, -4, 0x1000);
        input.reserved = ReservedSlots::PLT;
        input.plt_entry = Some(0x2000);
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word as u32, 0xffc);
    }

    #[test]
    fn r32_unsigned_and_r32s_signed() {
        let ok = apply_input(R_X86_64_32, 0xffff_ffff, 0, 0);
        assert_eq!(apply(&ok).0, RelocResult::Ok);
        let signed_over = apply_input(R_X86_64_32S, 0xffff_ffff, 0, 0);
        assert_eq!(apply(&signed_over).0, RelocResult::Overflow);
        let signed_ok = apply_input(R_X86_64_32S, 0x7fff_ffff, 0, 0);
        assert_eq!(apply(&signed_ok).0, RelocResult::Ok);
    }

    #[test]
    fn gotpcrel_needs_a_slot() {
        let without = apply_input(R_X86_64_GOTPCREL, 0x1000, 0, 0x2000);
        assert_eq!(apply(&without).0, RelocResult::BadReloc);
        let mut with = without;
        with.got_slot = Some(0x3000);
        with.a = -4;
        let (result, word) = apply(&with);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word as u32, 0xffc);
    }

    #[test]
    fn tpoff32_is_negative_from_block_end() {
        let mut input = apply_input(R_X86_64_TPOFF32, 0x10, 0, 0);
        input.tls_size = 0x100;
        let (result, word) = apply(&input);
        assert_eq!(result, RelocResult::Ok);
        assert_eq!(word as u32, (-0xf0i32) as u32);
    }

    fn scan_req<'a>(rtype: u32, sym: ScanSymbol, config: &'a LinkerConfig) -> ScanRequest<'a> {
        ScanRequest {
            rtype,
            addend: 0,
            place: FragmentRef::new(FragId::new(0), 0),
            sym,
            sym_name: "g",
            input_path: "main.o",
            origin_path: "libshared.so",
            config,
            section_alloc: true,
            section_writable: true,
        }
    }

    fn dyn_data_sym() -> ScanSymbol {
        ScanSymbol {
            id: Some(SymbolId::new(2)),
            is_local: false,
            is_weak_undef: false,
            is_undef: false,
            is_dyn: true,
            is_hidden: false,
            is_func: false,
            is_ifunc: false,
            is_tls: false,
            preemptible: true,
            reserved: ReservedSlots::empty(),
        }
    }

    #[test]
    fn abs32_to_shared_data_in_exec_is_a_copy_reloc() {
        let config = LinkerConfig::builder().machine(ElfMachine::X86_64).build();
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_X86_64_32, dyn_data_sym(), &config), &mut out);
        assert!(matches!(out.actions[0], ScanAction::CopyReloc { .. }));
    }

    #[test]
    fn plt32_to_preemptible_reserves_plt() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::X86_64)
            .codegen(crate::config::CodeGenType::DynObj)
            .build();
        let mut sym = dyn_data_sym();
        sym.is_dyn = false;
        sym.is_func = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_X86_64_PLT32, sym, &config), &mut out);
        assert!(matches!(out.actions[0], ScanAction::ReservePlt { .. }));
    }

    #[test]
    fn local_abs64_in_pic_becomes_relative() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::X86_64)
            .pic(true)
            .build();
        let sym = ScanSymbol {
            id: Some(SymbolId::new(1)),
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
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_X86_64_64, sym, &config), &mut out);
        assert!(matches!(
            &out.actions[0],
            ScanAction::EmitDynReloc { reloc, .. } if reloc.rtype == R_X86_64_RELATIVE
        ));
    }

    #[test]
    fn gottpoff_reserves_ie_slot_with_tpoff64() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::X86_64)
            .pic(true)
            .build();
        let mut sym = dyn_data_sym();
        sym.is_tls = true;
        let mut out = ScanOutcome::default();
        scan(&scan_req(R_X86_64_GOTTPOFF, sym, &config), &mut out);
        assert!(matches!(
            out.actions[0],
            ScanAction::ReserveGot {
                kind: GotSlotKind::TlsIe,
                ..
            }
        ));
        assert!(out.actions.iter().any(|a| matches!(
            a,
            ScanAction::EmitDynReloc { reloc, .. } if reloc.rtype == R_X86_64_TPOFF64
        )));
    }

    #[test]
    fn plt_patching_points_jump_at_the_slot() {
        let io = IoCtx::elf64_le();
        let mut bytes = PLTN_TEMPLATE.to_vec();
        patch_pltn(&mut bytes, io, 0x1000, 0x3000, 0x800);
        let rel = io.read_word(&bytes[2..]).unwrap();
        assert_eq!(rel, 0x3000 - (0x1000 + 6));
        let back = io.read_word(&bytes[12..]).unwrap();
        assert_eq!(back as i32, 0x800i32 - (0x1000 + 16));
    }
}
