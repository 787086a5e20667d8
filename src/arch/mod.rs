//! Per-architecture backends: dispatch tables of data and function
//! pointers that parameterize the relocator, the GOT/PLT shapes, and the
//! stub prototypes

pub mod aarch64;
pub mod arm32;
pub mod x86_64;

use crate::base::{ElfMachine, IoCtx};
use crate::gotplt::PltTemplates;
use crate::reloc::{ApplyInput, RelocEntry, RelocResult, ScanOutcome, ScanRequest};
use crate::stub::StubPrototype;

#[derive(Debug, Clone, Copy)]
/// The dynamic relocation types of one psABI
pub struct DynRelocTypes {
    /// R_*_NONE
    pub none: u32,
    /// The base-relative type (RELATIVE)
    pub relative: u32,
    /// GLOB_DAT
    pub glob_dat: u32,
    /// JUMP_SLOT
    pub jump_slot: u32,
    /// IRELATIVE
    pub irelative: u32,
    /// COPY
    pub copy: u32,
    /// TLS module id (DTPMOD)
    pub dtpmod: u32,
    /// TLS offset within module (DTPREL/DTPOFF)
    pub dtprel: u32,
    /// TLS offset from thread pointer (TPREL/TPOFF)
    pub tprel: u32,
    /// TLS descriptor
    pub tlsdesc: u32,
    /// The word-sized absolute type (for in-place dynamic data relocs)
    pub abs_word: u32,
}

#[derive(Clone, Copy)]
/// Everything target-specific the pipeline consults, as one table of data
/// and function pointers. One static instance exists per machine.
pub struct TargetBackend {
    /// Machine this backend links for
    pub machine: ElfMachine,
    /// Class and byte order of inputs and output
    pub io: IoCtx,
    /// The target uses RELA (explicit addends)
    pub is_rela: bool,
    /// ABI page size used for segment alignment
    pub page_size: u64,
    /// Default entry symbol
    pub entry_symbol: &'static str,
    /// Default dynamic interpreter path
    pub dynamic_linker: &'static str,
    /// `e_flags` for the output header
    pub e_flags: u32,
    /// Bytes the thread pointer reserves before TLS data (LE model)
    pub tcb_size: u64,
    /// Dynamic relocation type numbers
    pub dyn_relocs: DynRelocTypes,
    /// Table lookup: relocation type to its field description
    pub entry_of: fn(u32) -> Option<&'static RelocEntry>,
    /// Scan one relocation into an action stream
    pub scan: fn(&ScanRequest, &mut ScanOutcome),
    /// Apply one relocation: compute and splice, returning the new word
    pub apply: fn(&ApplyInput) -> (RelocResult, u64),
    /// Stub prototypes registered for the relaxation loop
    pub stubs: &'static [StubPrototype],
    /// PLT shapes
    pub plt: PltTemplates,
    /// Stamp final addresses into PLT0
    pub patch_plt0: fn(&mut [u8], IoCtx, u64, u64),
    /// Stamp final addresses into a PLT entry:
    /// (bytes, io, entry_addr, slot_addr, plt0_addr)
    pub patch_pltn: fn(&mut [u8], IoCtx, u64, u64, u64),
    /// GC glue edge: companion section that must live when `name` lives
    pub gc_glue: fn(&str) -> Option<String>,
    /// The target wants a PT_ARM_EXIDX-style unwind segment over this
    /// output section name
    pub unwind_segment_over: Option<&'static str>,
}

impl std::fmt::Debug for TargetBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetBackend")
            .field("machine", &self.machine)
            .field("is_rela", &self.is_rela)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl TargetBackend {
    /// Relocation name for tracing and diagnostics
    pub fn reloc_name(&self, rtype: u32) -> String {
        match (self.entry_of)(rtype) {
            Some(entry) => entry.name.to_string(),
            None => format!("reloc#{rtype}"),
        }
    }
}

/// Look up the backend for a machine
pub fn backend_for(machine: ElfMachine) -> Option<&'static TargetBackend> {
    match machine {
        ElfMachine::AArch64 => Some(&aarch64::BACKEND),
        ElfMachine::X86_64 => Some(&x86_64::BACKEND),
        ElfMachine::Arm => Some(&arm32::BACKEND),
        ElfMachine::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_machine_has_a_backend() {
        for machine in [ElfMachine::AArch64, ElfMachine::X86_64, ElfMachine::Arm] {
            let backend = backend_for(machine).map(|b| b.machine);
            assert_eq!(backend, Some(machine));
        }
        assert!(backend_for(ElfMachine::None).is_none());
    }

    #[test]
    fn reloc_names_fall_back_to_numbers() {
        let backend = backend_for(ElfMachine::AArch64).map(|b| b.reloc_name(0xffff));
        assert_eq!(backend.as_deref(), Some("reloc#65535"));
    }
}
