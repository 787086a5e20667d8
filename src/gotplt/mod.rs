//! GOT and PLT allocation: slot creation, per-symbol deduplication, and
//! the reservation plumbing that keeps scanning idempotent

use std::collections::HashMap;

use crate::base::{FragId, SectionId, SymbolId};
use crate::fragment::{Fragment, FragmentKind, GotSlotKind};
use crate::section::Section;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the writer deposits into a GOT slot when the image is emitted
pub enum GotValueKind {
    /// The resolved symbol value (non-preemptible, or RELATIVE-filled)
    SymbolValue,
    /// Zero; the dynamic linker fills it at load time
    Zero,
    /// The address of `_DYNAMIC` (the reserved `.got.plt` slot 0)
    DynamicAddr,
    /// The address of PLT0 (lazy-bound `.got.plt` slots)
    Plt0Addr,
    /// The resolved address, for IRELATIVE-bound slots
    ResolverAddr,
    /// Static TLS: offset of the symbol from the TLS block start
    TlsStaticOffset,
    /// TLS module id word of a GD/LD pair
    TlsModuleId,
    /// TLS offset word of a GD pair
    TlsOffset,
}

#[derive(Debug, Clone, Copy)]
/// The target's PLT shape: a one-off header entry plus a per-symbol
/// template. Templates are stamped with final addresses by the target's
/// patch hooks once layout has fixed them.
pub struct PltTemplates {
    /// PLT0 bytes (empty if the target has no header entry)
    pub plt0: &'static [u8],
    /// Per-entry bytes
    pub pltn: &'static [u8],
    /// Entry alignment
    pub align: u64,
}

#[derive(Debug)]
/// The allocator. GOT is a sequence of slot fragments in the synthetic
/// `.got`/`.got.plt` sections; PLT mirrors it in `.plt`. Allocation is
/// first-fit append with a per-(symbol, kind) dedup map, so asking twice
/// returns the existing slot.
pub struct GotPltAllocator {
    /// The synthetic `.got` section
    pub got_section: SectionId,
    /// The synthetic `.got.plt` section
    pub gotplt_section: SectionId,
    /// The synthetic `.plt` section
    pub plt_section: SectionId,
    word_size: u64,
    slots: HashMap<(SymbolId, GotSlotKind), FragId>,
    ld_slot: Option<FragId>,
    plt_entries: HashMap<SymbolId, FragId>,
    plt0: Option<FragId>,
    gotplt0: Option<FragId>,
    values: HashMap<FragId, GotValueKind>,
}

impl GotPltAllocator {
    /// Wire the allocator to the three synthetic sections
    pub fn new(
        got_section: SectionId,
        gotplt_section: SectionId,
        plt_section: SectionId,
        word_size: u64,
    ) -> Self {
        GotPltAllocator {
            got_section,
            gotplt_section,
            plt_section,
            word_size,
            slots: HashMap::new(),
            ld_slot: None,
            plt_entries: HashMap::new(),
            plt0: None,
            gotplt0: None,
            values: HashMap::new(),
        }
    }

    fn push_fragment(
        &self,
        fragments: &mut Vec<Fragment>,
        sections: &mut [Section],
        section: SectionId,
        frag: Fragment,
    ) -> FragId {
        let id = FragId::new(fragments.len());
        fragments.push(frag);
        sections[section.index()].fragments.push(id);
        id
    }

    /// The existing GOT slot for (`symbol`, `kind`), if any
    pub fn got_slot(&self, symbol: SymbolId, kind: GotSlotKind) -> Option<FragId> {
        if kind == GotSlotKind::TlsLd {
            return self.ld_slot;
        }
        self.slots.get(&(symbol, kind)).copied()
    }

    /// The existing PLT entry for `symbol`, if any
    pub fn plt_entry(&self, symbol: SymbolId) -> Option<FragId> {
        self.plt_entries.get(&symbol).copied()
    }

    /// What the writer should deposit into a GOT slot
    pub fn value_kind(&self, slot: FragId) -> GotValueKind {
        self.values.get(&slot).copied().unwrap_or(GotValueKind::Zero)
    }

    /// Override a slot's emit policy (e.g. RELATIVE-filled regular slots)
    pub fn set_value_kind(&mut self, slot: FragId, kind: GotValueKind) {
        self.values.insert(slot, kind);
    }

    /// Get or create the GOT slot of `kind` for `symbol`. Returns the
    /// fragment and whether it was created by this call. The TLS_LD slot
    /// is shared by the whole module, so the symbol is ignored for it.
    pub fn reserve_got(
        &mut self,
        fragments: &mut Vec<Fragment>,
        sections: &mut [Section],
        symbol: SymbolId,
        kind: GotSlotKind,
        value: GotValueKind,
    ) -> (FragId, bool) {
        if let Some(existing) = self.got_slot(symbol, kind) {
            return (existing, false);
        }
        let home = match kind {
            GotSlotKind::GotPlt0 | GotSlotKind::GotPltN => self.gotplt_section,
            _ => self.got_section,
        };
        let frag = Fragment::new(
            home,
            self.word_size,
            FragmentKind::Got {
                slot: kind,
                size: kind.words() * self.word_size,
                symbol: Some(symbol),
            },
        );
        let id = self.push_fragment(fragments, sections, home, frag);
        if kind == GotSlotKind::TlsLd {
            self.ld_slot = Some(id);
        } else {
            self.slots.insert((symbol, kind), id);
        }
        self.values.insert(id, value);
        (id, true)
    }

    /// The reserved `.got.plt` slot 0, created on first use
    pub fn ensure_gotplt0(
        &mut self,
        fragments: &mut Vec<Fragment>,
        sections: &mut [Section],
    ) -> FragId {
        if let Some(id) = self.gotplt0 {
            return id;
        }
        let frag = Fragment::new(
            self.gotplt_section,
            self.word_size,
            FragmentKind::Got {
                slot: GotSlotKind::GotPlt0,
                size: self.word_size,
                symbol: None,
            },
        );
        let id = self.push_fragment(fragments, sections, self.gotplt_section, frag);
        self.values.insert(id, GotValueKind::DynamicAddr);
        self.gotplt0 = Some(id);
        id
    }

    /// PLT0, created lazily on the first non-IRELATIVE allocation
    fn ensure_plt0(
        &mut self,
        fragments: &mut Vec<Fragment>,
        sections: &mut [Section],
        templates: &PltTemplates,
    ) -> Option<FragId> {
        if templates.plt0.is_empty() {
            return None;
        }
        if let Some(id) = self.plt0 {
            return Some(id);
        }
        self.ensure_gotplt0(fragments, sections);
        let frag = Fragment::new(
            self.plt_section,
            templates.align,
            FragmentKind::Plt {
                data: templates.plt0.to_vec(),
                symbol: None,
            },
        );
        let id = self.push_fragment(fragments, sections, self.plt_section, frag);
        self.plt0 = Some(id);
        Some(id)
    }

    /// The PLT0 fragment if it exists
    pub fn plt0(&self) -> Option<FragId> {
        self.plt0
    }

    /// Get or create a PLT entry for `symbol` along with its `.got.plt`
    /// slot. An `irelative` entry resolves through the ifunc resolver and
    /// needs no PLT0. Returns the entry and whether this call created it.
    pub fn reserve_plt(
        &mut self,
        fragments: &mut Vec<Fragment>,
        sections: &mut [Section],
        symbol: SymbolId,
        irelative: bool,
        templates: &PltTemplates,
    ) -> (FragId, bool) {
        if let Some(existing) = self.plt_entry(symbol) {
            return (existing, false);
        }
        if !irelative {
            self.ensure_plt0(fragments, sections, templates);
        }
        let (_, _) = self.reserve_got(
            fragments,
            sections,
            symbol,
            GotSlotKind::GotPltN,
            if irelative {
                GotValueKind::ResolverAddr
            } else {
                GotValueKind::Plt0Addr
            },
        );
        let frag = Fragment::new(
            self.plt_section,
            templates.align,
            FragmentKind::Plt {
                data: templates.pltn.to_vec(),
                symbol: Some(symbol),
            },
        );
        let id = self.push_fragment(fragments, sections, self.plt_section, frag);
        self.plt_entries.insert(symbol, id);
        (id, true)
    }

    /// Number of live GOT slots (both `.got` and `.got.plt`)
    pub fn got_count(&self) -> usize {
        self.slots.len()
            + usize::from(self.ld_slot.is_some())
            + usize::from(self.gotplt0.is_some())
    }

    /// Number of PLT entries excluding PLT0
    pub fn plt_count(&self) -> usize {
        self.plt_entries.len()
    }

    /// Iterate all PLT entries with their symbols
    pub fn plt_entries(&self) -> impl Iterator<Item = (SymbolId, FragId)> + '_ {
        self.plt_entries.iter().map(|(s, f)| (*s, *f))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::base::{SectionFlags, SHT_PROGBITS};

    const PLT0: &[u8] = &[0u8; 32];
    const PLTN: &[u8] = &[0u8; 16];

    fn harness() -> (Vec<Fragment>, Vec<Section>, GotPltAllocator) {
        let sections = vec![
            Section::internal(".got", SHT_PROGBITS, SectionFlags::ALLOC | SectionFlags::WRITE, 8),
            Section::internal(
                ".got.plt",
                SHT_PROGBITS,
                SectionFlags::ALLOC | SectionFlags::WRITE,
                8,
            ),
            Section::internal(
                ".plt",
                SHT_PROGBITS,
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                16,
            ),
        ];
        let alloc = GotPltAllocator::new(
            SectionId::new(0),
            SectionId::new(1),
            SectionId::new(2),
            8,
        );
        (Vec::new(), sections, alloc)
    }

    #[test]
    fn got_allocation_dedups_per_symbol_and_kind() {
        let (mut frags, mut sections, mut alloc) = harness();
        let sym = SymbolId::new(0);
        let (a, created_a) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            sym,
            GotSlotKind::Regular,
            GotValueKind::SymbolValue,
        );
        let (b, created_b) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            sym,
            GotSlotKind::Regular,
            GotValueKind::SymbolValue,
        );
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        // A different kind for the same symbol is a different slot.
        let (c, created_c) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            sym,
            GotSlotKind::TlsIe,
            GotValueKind::Zero,
        );
        assert!(created_c);
        assert_ne!(a, c);
    }

    #[test]
    fn tls_gd_slot_spans_two_words() {
        let (mut frags, mut sections, mut alloc) = harness();
        let (id, _) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            SymbolId::new(1),
            GotSlotKind::TlsGd,
            GotValueKind::Zero,
        );
        assert_eq!(frags[id.index()].size(), 16);
    }

    #[test]
    fn ld_slot_is_module_wide() {
        let (mut frags, mut sections, mut alloc) = harness();
        let (a, _) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            SymbolId::new(1),
            GotSlotKind::TlsLd,
            GotValueKind::TlsModuleId,
        );
        let (b, created) = alloc.reserve_got(
            &mut frags,
            &mut sections,
            SymbolId::new(2),
            GotSlotKind::TlsLd,
            GotValueKind::TlsModuleId,
        );
        assert_eq!(a, b);
        assert!(!created);
    }

    #[test]
    fn first_plt_reservation_creates_plt0_and_gotplt0() {
        let (mut frags, mut sections, mut alloc) = harness();
        let templates = PltTemplates {
            plt0: PLT0,
            pltn: PLTN,
            align: 16,
        };
        let sym = SymbolId::new(3);
        let (entry, created) =
            alloc.reserve_plt(&mut frags, &mut sections, sym, false, &templates);
        assert!(created);
        assert!(alloc.plt0().is_some());
        assert_eq!(alloc.plt_count(), 1);
        // .plt holds PLT0 + one entry; .got.plt holds slot0 + the entry slot.
        assert_eq!(sections[2].fragments.len(), 2);
        assert_eq!(sections[1].fragments.len(), 2);
        let (again, created_again) =
            alloc.reserve_plt(&mut frags, &mut sections, sym, false, &templates);
        assert_eq!(entry, again);
        assert!(!created_again);
    }

    #[test]
    fn irelative_plt_skips_plt0() {
        let (mut frags, mut sections, mut alloc) = harness();
        let templates = PltTemplates {
            plt0: PLT0,
            pltn: PLTN,
            align: 16,
        };
        let (_, created) = alloc.reserve_plt(
            &mut frags,
            &mut sections,
            SymbolId::new(4),
            true,
            &templates,
        );
        assert!(created);
        assert!(alloc.plt0().is_none());
        let slot = alloc
            .got_slot(SymbolId::new(4), GotSlotKind::GotPltN)
            .unwrap();
        assert_eq!(alloc.value_kind(slot), GotValueKind::ResolverAddr);
    }
}
