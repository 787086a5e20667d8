//! Linker configuration consumed by the core

use std::collections::HashSet;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

use crate::base::ElfMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What kind of image the link produces
pub enum CodeGenType {
    #[default]
    /// A normal executable
    Exec,
    /// A shared object
    DynObj,
    /// A relocatable object (`-r` partial link)
    Object,
    /// A raw binary image (headerless dump of the loadable contents)
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Interpretation of `R_ARM_TARGET2` (`--target2=`)
pub enum Target2Policy {
    #[default]
    /// Treat as GOT-relative (`got-rel`, the EABI default)
    GotRel,
    /// Treat as `R_ARM_REL32`
    Rel,
    /// Treat as `R_ARM_ABS32`
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `-z {exec,no}stack` state
pub enum StackPolicy {
    #[default]
    /// Emit PT_GNU_STACK from the union of input `.note.GNU-stack` flags
    FromInputs,
    /// Force an executable stack (`-z execstack`)
    Exec,
    /// Force a non-executable stack (`-z noexecstack`)
    NoExec,
    /// Emit no PT_GNU_STACK at all (`-z nostack`)
    None,
}

#[derive(Debug, Clone, TypedBuilder)]
/// Parsed configuration contract between the driver shell and the core.
/// Field defaults match an unadorned `ld` invocation for the target.
pub struct LinkerConfig {
    /// Target machine to link for
    pub machine: ElfMachine,
    #[builder(default)]
    /// Kind of output image
    pub codegen: CodeGenType,
    #[builder(default)]
    /// Position-independent code (shared objects always are)
    pub pic: bool,
    #[builder(default)]
    /// Position-independent executable
    pub pie: bool,
    #[builder(default, setter(into, strip_option))]
    /// Entry symbol override (`-e`); the target supplies a default
    pub entry: Option<String>,
    #[builder(default = PathBuf::from("a.out"), setter(into))]
    /// Output path
    pub output: PathBuf,
    #[builder(default, setter(into))]
    /// `-L` search paths, in order
    pub search_paths: Vec<PathBuf>,
    #[builder(default, setter(into))]
    /// `--trace-symbol=<name>` patterns
    pub trace_symbols: HashSet<String>,
    #[builder(default, setter(into))]
    /// `--trace-reloc=<name>` patterns
    pub trace_relocs: HashSet<String>,
    #[builder(default)]
    /// `-z now`: eager binding
    pub bind_now: bool,
    #[builder(default)]
    /// `-z nocopyreloc`: refuse copy relocations
    pub no_copy_reloc: bool,
    #[builder(default)]
    /// `-z notext`: permit dynamic relocations in read-only segments
    pub no_text_rel: bool,
    #[builder(default)]
    /// `-z {exec,no}stack`
    pub stack: StackPolicy,
    #[builder(default)]
    /// `--gc-sections`
    pub gc_sections: bool,
    #[builder(default)]
    /// `--whole-archive` state at the point each archive was named
    pub whole_archive: bool,
    #[builder(default, setter(into, strip_option))]
    /// `--build-id` payload, precomputed by the shell
    pub build_id: Option<Vec<u8>>,
    #[builder(default)]
    /// `--emit-relocs`: copy input relocation sections into the output
    pub emit_relocs: bool,
    #[builder(default, setter(strip_option))]
    /// `-Ttext=<addr>`
    pub text_addr: Option<u64>,
    #[builder(default, setter(strip_option))]
    /// `-Tdata=<addr>`
    pub data_addr: Option<u64>,
    #[builder(default, setter(into, strip_option))]
    /// `-T <script>` path, parsed by the shell into `LinkerScript`
    pub script_path: Option<PathBuf>,
    #[builder(default)]
    /// `--target2=` policy for ARM
    pub target2: Target2Policy,
    #[builder(default)]
    /// `--fix-cortex-a53-843419`
    pub fix_cortex_a53_843419: bool,
    #[builder(default)]
    /// `--no-trampolines`: disable branch-island insertion
    pub no_trampolines: bool,
    #[builder(default)]
    /// `--warn-common`
    pub warn_common: bool,
    #[builder(default)]
    /// `--warn-once`
    pub warn_once: bool,
    #[builder(default)]
    /// `--global-merge-non-alloc-strings`: dedup merge-string sections
    /// even when they are not SHF_ALLOC
    pub merge_non_alloc_strings: bool,
    #[builder(default)]
    /// Island factory considers addends when looking up a reusable stub
    pub island_use_addends: bool,
    #[builder(default, setter(into, strip_option))]
    /// Dynamic interpreter override (`--dynamic-linker`)
    pub dynamic_linker: Option<String>,
    #[builder(default, setter(into, strip_option))]
    /// DT_SONAME for shared-object output
    pub soname: Option<String>,
    #[builder(default, setter(into))]
    /// `-u <sym>` forced-undefined symbols (GC roots, archive pulls)
    pub forced_undefined: Vec<String>,
    #[builder(default = true)]
    /// Suppress the `.unrecognized` placement warning when false
    pub warn_unrecognized: bool,
    #[builder(default)]
    /// Set by the driver once any shared object joins the link; a plain
    /// executable stops being a static link at that point
    pub linking_shared: bool,
}

impl LinkerConfig {
    /// Shared objects and PIE executables need position-independent code
    pub fn is_code_indep(&self) -> bool {
        self.pic || self.pie || self.codegen == CodeGenType::DynObj
    }

    /// True when nothing dynamic can appear in the output (static exec)
    pub fn is_static(&self) -> bool {
        matches!(self.codegen, CodeGenType::Exec | CodeGenType::Binary)
            && !self.pic
            && !self.pie
            && !self.linking_shared
    }

    /// True for a `-r` partial link
    pub fn is_partial(&self) -> bool {
        self.codegen == CodeGenType::Object
    }

    /// True when a normal (non-PIE) executable is being produced
    pub fn is_normal_exec(&self) -> bool {
        self.codegen == CodeGenType::Exec && !self.pie
    }

    /// Should this symbol name be traced?
    pub fn trace_symbol(&self, name: &str) -> bool {
        self.trace_symbols.contains(name)
    }

    /// Should this relocation name be traced?
    pub fn trace_reloc(&self, name: &str) -> bool {
        self.trace_relocs.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_plain_exec_link() {
        let config = LinkerConfig::builder().machine(ElfMachine::AArch64).build();
        assert_eq!(config.codegen, CodeGenType::Exec);
        assert!(config.is_static());
        assert!(!config.is_code_indep());
        assert!(config.is_normal_exec());
        assert_eq!(config.output, PathBuf::from("a.out"));
    }

    #[test]
    fn dynobj_is_position_independent() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::X86_64)
            .codegen(CodeGenType::DynObj)
            .build();
        assert!(config.is_code_indep());
        assert!(!config.is_static());
        assert!(!config.is_normal_exec());
    }

    #[test]
    fn trace_lists_are_consulted_exactly() {
        let config = LinkerConfig::builder()
            .machine(ElfMachine::AArch64)
            .trace_symbols(HashSet::from(["main".to_string()]))
            .build();
        assert!(config.trace_symbol("main"));
        assert!(!config.trace_symbol("maine"));
    }
}
