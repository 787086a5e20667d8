//! Branch islands: trampoline prototypes, the island factory with its
//! reuse predicate, and the selection rule the relaxation loop runs

use crate::base::{FragId, InputId, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A fixup baked into a stub template; cloning a stub materializes one
/// relocation per fixup against the branch target
pub struct StubFixup {
    /// Offset of the patched field inside the stub
    pub offset: u64,
    /// Relocation type of the materialized relocation
    pub rtype: u32,
    /// Addend of the materialized relocation
    pub addend: i64,
}

#[derive(Debug, Clone, Copy)]
/// A registered stub shape. Targets register these at startup; the
/// factory consults them in order when a branch cannot reach.
pub struct StubPrototype {
    /// Name used in the trampoline symbol and trace output
    pub name: &'static str,
    /// Encoded instruction bytes, cloned per island
    pub template: &'static [u8],
    /// Required alignment
    pub align: u64,
    /// Fixups to materialize per clone
    pub fixups: &'static [StubFixup],
    /// Does this prototype serve the given relocation type?
    pub is_needed: fn(rtype: u32) -> bool,
    /// Can the original branch reach `target` from `place` without help?
    pub in_range: fn(rtype: u32, target: i64, place: i64) -> bool,
    /// The stub body is position-independent
    pub supports_pic: bool,
}

/// The selection rule: the first prototype that serves the relocation
/// type and whose range test says the branch cannot reach. `None` means
/// no stub is required (or the target registered none that fits).
pub fn select_prototype(
    prototypes: &[StubPrototype],
    rtype: u32,
    target_addr: i64,
    place: i64,
) -> Option<usize> {
    prototypes
        .iter()
        .position(|p| (p.is_needed)(rtype) && !(p.in_range)(rtype, target_addr, place))
}

#[derive(Debug, Clone)]
/// One placed island: a cloned stub fragment plus the local trampoline
/// symbol defined at it
pub struct BranchIsland {
    /// Index of the prototype this island was cloned from
    pub prototype: usize,
    /// The stub fragment spliced into the output
    pub frag: FragId,
    /// The local trampoline symbol pointing at the stub
    pub symbol: SymbolId,
    /// The symbol the island ultimately branches to
    pub target: SymbolId,
    /// Origin file of the target, consulted for local targets
    pub target_origin: Option<InputId>,
    /// The target symbol is local or a section symbol
    pub target_is_local: bool,
    /// Addend recorded when the island was created
    pub addend: i64,
    /// How many branches were retargeted onto this island after creation
    pub reuse_count: usize,
}

#[derive(Debug, Default)]
/// Creates and deduplicates branch islands. Reuse requires the same stub
/// prototype and the same target symbol; local targets additionally match
/// on the origin input file, and addends participate only when
/// `use_addends` was configured.
pub struct BranchIslandFactory {
    use_addends: bool,
    islands: Vec<BranchIsland>,
    clones: usize,
}

impl BranchIslandFactory {
    /// A factory with the configured addend-matching mode
    pub fn new(use_addends: bool) -> Self {
        BranchIslandFactory {
            use_addends,
            islands: Vec::new(),
            clones: 0,
        }
    }

    /// All islands created so far
    pub fn islands(&self) -> &[BranchIsland] {
        &self.islands
    }

    /// Mutable access for reuse accounting
    pub fn island_mut(&mut self, idx: usize) -> &mut BranchIsland {
        &mut self.islands[idx]
    }

    /// Number of fresh clones (islands created, not reused)
    pub fn clone_count(&self) -> usize {
        self.clones
    }

    /// Find an island this (`prototype`, target) pair can reuse
    pub fn find_compatible(
        &self,
        prototype: usize,
        target: SymbolId,
        target_is_local: bool,
        target_origin: Option<InputId>,
        addend: i64,
    ) -> Option<usize> {
        self.islands.iter().position(|island| {
            if island.prototype != prototype || island.target != target {
                return false;
            }
            // Two locals with one name are still different symbols when
            // they come from different files.
            if target_is_local && island.target_origin != target_origin {
                return false;
            }
            if self.use_addends && island.addend != addend {
                return false;
            }
            true
        })
    }

    /// Record a freshly cloned island and return its index
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        prototype: usize,
        frag: FragId,
        symbol: SymbolId,
        target: SymbolId,
        target_is_local: bool,
        target_origin: Option<InputId>,
        addend: i64,
    ) -> usize {
        self.clones += 1;
        self.islands.push(BranchIsland {
            prototype,
            frag,
            symbol,
            target,
            target_origin,
            target_is_local,
            addend,
            reuse_count: 0,
        });
        self.islands.len() - 1
    }

    /// The trampoline symbol name for a new island
    pub fn symbol_name(&self, target_name: &str, from_section: &str) -> String {
        let section = from_section.trim_start_matches('.').replace('.', "_");
        format!(
            "trampoline_for_{target_name}_from_{section}_{}",
            self.clones
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TEMPLATE: &[u8] = &[0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6];
    const FIXUPS: &[StubFixup] = &[StubFixup {
        offset: 8,
        rtype: 257,
        addend: 0,
    }];

    fn always(_: u32) -> bool {
        true
    }
    fn branch_only(rtype: u32) -> bool {
        rtype == 283
    }
    fn never_reaches(_: u32, _: i64, _: i64) -> bool {
        false
    }
    fn within_128m(_: u32, target: i64, place: i64) -> bool {
        (target - place).abs() < (1 << 27)
    }

    fn proto(is_needed: fn(u32) -> bool, in_range: fn(u32, i64, i64) -> bool) -> StubPrototype {
        StubPrototype {
            name: "far_branch",
            template: TEMPLATE,
            align: 8,
            fixups: FIXUPS,
            is_needed,
            in_range,
            supports_pic: false,
        }
    }

    #[test]
    fn selection_requires_needed_and_out_of_range() {
        let protos = [proto(branch_only, within_128m)];
        // 70 MiB away: in range, no stub.
        assert_eq!(select_prototype(&protos, 283, 70 << 20, 0), None);
        // 200 MiB away: out of range.
        assert_eq!(select_prototype(&protos, 283, 200 << 20, 0), Some(0));
        // Wrong relocation type: no stub even out of range.
        assert_eq!(select_prototype(&protos, 257, 200 << 20, 0), None);
    }

    #[test]
    fn first_matching_prototype_wins() {
        let protos = [proto(branch_only, within_128m), proto(always, never_reaches)];
        assert_eq!(select_prototype(&protos, 283, 200 << 20, 0), Some(0));
        assert_eq!(select_prototype(&protos, 999, 0, 0), Some(1));
    }

    #[test]
    fn reuse_matches_prototype_target_and_origin() {
        let mut factory = BranchIslandFactory::new(false);
        let target = SymbolId::new(7);
        factory.add(
            0,
            FragId::new(1),
            SymbolId::new(20),
            target,
            false,
            None,
            0,
        );
        assert_eq!(factory.find_compatible(0, target, false, None, 4), Some(0));
        assert_eq!(factory.find_compatible(1, target, false, None, 0), None);
        assert_eq!(
            factory.find_compatible(0, SymbolId::new(8), false, None, 0),
            None
        );
    }

    #[test]
    fn local_targets_must_share_an_origin() {
        let mut factory = BranchIslandFactory::new(false);
        let target = SymbolId::new(7);
        let origin = Some(InputId::new(2));
        factory.add(0, FragId::new(1), SymbolId::new(20), target, true, origin, 0);
        assert_eq!(factory.find_compatible(0, target, true, origin, 0), Some(0));
        assert_eq!(
            factory.find_compatible(0, target, true, Some(InputId::new(3)), 0),
            None
        );
    }

    #[test]
    fn addends_participate_only_when_configured() {
        let mut with = BranchIslandFactory::new(true);
        let target = SymbolId::new(7);
        with.add(0, FragId::new(1), SymbolId::new(20), target, false, None, 8);
        assert_eq!(with.find_compatible(0, target, false, None, 8), Some(0));
        assert_eq!(with.find_compatible(0, target, false, None, 12), None);

        let mut without = BranchIslandFactory::new(false);
        without.add(0, FragId::new(1), SymbolId::new(20), target, false, None, 8);
        assert_eq!(without.find_compatible(0, target, false, None, 12), Some(0));
    }

    #[test]
    fn trampoline_names_carry_target_and_section() {
        let factory = BranchIslandFactory::new(false);
        assert_eq!(
            factory.symbol_name("f", ".text.hot"),
            "trampoline_for_f_from_text_hot_0"
        );
    }
}
