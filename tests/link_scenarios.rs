//! End-to-end link scenarios driven through the builder facade

use elk::arch::aarch64::{
    R_AARCH64_ABS32, R_AARCH64_CALL26, R_AARCH64_COPY, R_AARCH64_TLSGD_ADD_LO12_NC,
    R_AARCH64_TLSGD_ADR_PAGE21, R_AARCH64_TLS_DTPMOD64, R_AARCH64_TLS_DTPREL64,
};
use elk::base::{ElfMachine, SectionFlags, SHT_NOBITS, SHT_PROGBITS};
use elk::config::LinkerConfig;
use elk::diag::DiagKind;
use elk::fragment::{FragmentKind, GotSlotKind};
use elk::input::{FileKind, InputFile};
use elk::module::Module;
use elk::reader::{ObjectContents, RawReloc, RawSection, RawSymbol};
use elk::reloc::DynTarget;
use elk::script::{Expr, InputSpec, LinkerScript, OutputSectionRule};
use elk::section::SectionMark;

fn null_section() -> RawSection {
    RawSection {
        name: String::new(),
        sh_type: 0,
        flags: SectionFlags::empty(),
        addr: 0,
        size: 0,
        link: 0,
        info: 0,
        align: 0,
        entsize: 0,
        data: Vec::new(),
    }
}

fn progbits(name: &str, flags: SectionFlags, data: Vec<u8>, align: u64) -> RawSection {
    RawSection {
        name: name.to_string(),
        sh_type: SHT_PROGBITS,
        flags,
        addr: 0,
        size: data.len() as u64,
        link: 0,
        info: 0,
        align,
        entsize: 0,
        data,
    }
}

fn null_symbol() -> RawSymbol {
    RawSymbol {
        name: String::new(),
        value: 0,
        size: 0,
        shndx: 0,
        bind: 0,
        stype: 0,
        vis: 0,
    }
}

fn symbol(name: &str, bind: u8, stype: u8, shndx: u16, value: u64, size: u64) -> RawSymbol {
    RawSymbol {
        name: name.to_string(),
        value,
        size,
        shndx,
        bind,
        stype,
        vis: 0,
    }
}

fn contents(
    sections: Vec<RawSection>,
    symbols: Vec<RawSymbol>,
    relocs: Vec<(usize, Vec<RawReloc>, bool)>,
) -> ObjectContents {
    ObjectContents {
        machine: Some(ElfMachine::AArch64),
        e_type: 1,
        sections,
        symbols,
        first_global: 1,
        relocs,
        soname: None,
        needed: Vec::new(),
    }
}

fn add_object(module: &mut Module, path: &str, contents: &ObjectContents) -> elk::Result<()> {
    let mut builder = module.builder();
    let id = builder.add_input(InputFile::new(path, FileKind::ObjectElf, Vec::new()));
    builder.integrate_object(id, contents, false)
}

fn add_shared(module: &mut Module, path: &str, contents: &ObjectContents) -> elk::Result<()> {
    let mut builder = module.builder();
    let id = builder.add_input(InputFile::new(path, FileKind::SharedElf, Vec::new()));
    builder.integrate_object(id, contents, true)
}

fn exec_config() -> LinkerConfig {
    LinkerConfig::builder().machine(ElfMachine::AArch64).build()
}

const BL_PLACEHOLDER: [u8; 4] = [0x00, 0x00, 0x00, 0x94];
const RET: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];

fn start_object(call_target: &str) -> ObjectContents {
    contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                BL_PLACEHOLDER.to_vec(),
                4,
            ),
        ],
        vec![
            null_symbol(),
            symbol("_start", 1, 2, 1, 0, 4),
            symbol(call_target, 1, 2, 0, 0, 0),
        ],
        vec![(
            1,
            vec![RawReloc {
                offset: 0,
                rtype: R_AARCH64_CALL26,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    )
}

#[test]
fn multiple_definition_fails_citing_both_files() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let def = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![1, 0, 0, 0], 4),
        ],
        vec![null_symbol(), symbol("x", 1, 1, 1, 0, 4)],
        vec![],
    );
    add_object(&mut module, "a.o", &def).unwrap();
    let err = add_object(&mut module, "b.o", &def);
    assert!(err.is_err());
    assert!(module.diag.contains(DiagKind::MultipleDefinition));
    let rendered: Vec<String> = module
        .diag
        .entries()
        .iter()
        .filter(|d| d.kind == DiagKind::MultipleDefinition)
        .map(|d| d.render())
        .collect();
    assert!(rendered[0].contains("a.o") && rendered[0].contains("b.o"));
}

#[test]
fn far_call_gets_a_trampoline() {
    let far_base = 0xC80_0000u64;
    let script = LinkerScript {
        rules: vec![
            OutputSectionRule::new(".text", vec![InputSpec::section(".text")]),
            {
                let mut rule =
                    OutputSectionRule::new(".far", vec![InputSpec::section(".text.far")]);
                rule.address = Some(Expr::Num(far_base));
                rule
            },
        ],
        ..LinkerScript::default()
    };
    let mut module = Module::new(exec_config(), script).unwrap();
    add_object(&mut module, "a.o", &start_object("f")).unwrap();
    let far = contents(
        vec![
            null_section(),
            progbits(
                ".text.far",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
        ],
        vec![null_symbol(), symbol("f", 1, 2, 1, 0, 4)],
        vec![],
    );
    add_object(&mut module, "b.o", &far).unwrap();
    module.link().unwrap();

    // One island, named for the callee and the calling section.
    let islands = module.islands().islands();
    assert_eq!(islands.len(), 1);
    let tramp = module.pool().info(islands[0].symbol);
    assert!(tramp.name().starts_with("trampoline_for_f_from_text_"));

    // The call site's encoded offset reaches the trampoline, and the
    // trampoline's literal carries f's final address.
    let stub_frag = module.fragment(islands[0].frag);
    let stub_data = stub_frag.data().unwrap();
    let literal = u64::from_le_bytes(stub_data[8..16].try_into().unwrap());
    let f = module.pool().find("f").unwrap();
    assert_eq!(literal, module.symbol_value(f));
    assert_eq!(module.symbol_value(f), far_base);

    let text = module.output_section_named(".text").unwrap();
    let tramp_addr = text.addr + stub_frag.offset;
    let call_section = module
        .sections()
        .iter()
        .find(|s| s.name == ".text" && module.input_path(s.input) == "a.o")
        .unwrap();
    let call_frag = module.fragment(call_section.fragments[0]);
    let insn = u32::from_le_bytes(call_frag.data().unwrap()[0..4].try_into().unwrap());
    let imm26 = (tramp_addr - text.addr) / 4;
    assert_eq!(insn, 0x9400_0000 | imm26 as u32);
}

#[test]
fn near_call_needs_no_trampoline() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    add_object(&mut module, "a.o", &start_object("f")).unwrap();
    let near = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
        ],
        vec![null_symbol(), symbol("f", 1, 2, 1, 0, 4)],
        vec![],
    );
    add_object(&mut module, "b.o", &near).unwrap();
    module.link().unwrap();
    assert!(module.islands().islands().is_empty());
}

#[test]
fn tls_gd_against_weak_shared_symbol() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let main = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                vec![0; 8],
                4,
            ),
        ],
        vec![
            null_symbol(),
            symbol("_start", 1, 2, 1, 0, 8),
            symbol("t", 1, 6, 0, 0, 0), // undef TLS
        ],
        vec![(
            1,
            vec![
                RawReloc {
                    offset: 0,
                    rtype: R_AARCH64_TLSGD_ADR_PAGE21,
                    symidx: 2,
                    addend: 0,
                },
                RawReloc {
                    offset: 4,
                    rtype: R_AARCH64_TLSGD_ADD_LO12_NC,
                    symidx: 2,
                    addend: 0,
                },
            ],
            true,
        )],
    );
    add_object(&mut module, "main.o", &main).unwrap();
    let libt = contents(
        vec![null_section(), progbits(".tdata", SectionFlags::ALLOC, vec![0; 4], 4)],
        vec![null_symbol(), symbol("t", 2, 6, 1, 0, 4)], // weak TLS define
        vec![],
    );
    add_shared(&mut module, "libt.so", &libt).unwrap();
    module.link().unwrap();

    let t = module.pool().find("t").unwrap();
    let dtpmod: Vec<_> = module
        .rela_dyn()
        .iter()
        .filter(|r| r.rtype == R_AARCH64_TLS_DTPMOD64 && r.symbol == Some(t))
        .collect();
    let dtprel: Vec<_> = module
        .rela_dyn()
        .iter()
        .filter(|r| r.rtype == R_AARCH64_TLS_DTPREL64 && r.symbol == Some(t))
        .collect();
    assert_eq!(dtpmod.len(), 1);
    assert_eq!(dtprel.len(), 1);

    let slot = module.gotplt().got_slot(t, GotSlotKind::TlsGd).unwrap();
    assert_eq!(module.fragment(slot).size(), 16);
    // The two dynamic entries land in consecutive words of that slot.
    for (reloc, word) in [(&dtpmod[0], 0u64), (&dtprel[0], 1u64)] {
        match reloc.at {
            DynTarget::GotSlot {
                kind: GotSlotKind::TlsGd,
                word: w,
                ..
            } => assert_eq!(w, word),
            other => panic!("unexpected target {other:?}"),
        }
    }
}

#[test]
fn script_rule_order_shapes_the_text_section() {
    let script = LinkerScript {
        rules: vec![OutputSectionRule::new(
            ".text",
            vec![
                InputSpec::section(".text.hot*"),
                InputSpec::section(".text.*"),
            ],
        )],
        ..LinkerScript::default()
    };
    let mut module = Module::new(exec_config(), script).unwrap();
    let object = contents(
        vec![
            null_section(),
            progbits(
                ".text.cold",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                vec![0; 8],
                4,
            ),
            progbits(
                ".text.hot.f1",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                vec![0; 4],
                4,
            ),
            progbits(
                ".text.hot.f2",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                vec![0; 4],
                4,
            ),
        ],
        vec![null_symbol(), symbol("_start", 1, 2, 2, 0, 4)],
        vec![],
    );
    add_object(&mut module, "a.o", &object).unwrap();
    module.garbage_collect();
    module.assign_output_sections().unwrap();
    module.layout_offsets();

    let text = module.output_section_named(".text").unwrap();
    let names: Vec<String> = text
        .members
        .iter()
        .map(|sid| module.sections()[sid.index()].name.clone())
        .collect();
    assert_eq!(names, [".text.hot.f1", ".text.hot.f2", ".text.cold"]);

    // Invariant: fragments are disjoint and aligned, in ascending order.
    let mut last_end = 0u64;
    for sid in &text.members {
        for frag_id in &module.sections()[sid.index()].fragments {
            let frag = module.fragment(*frag_id);
            assert!(frag.offset >= last_end);
            assert_eq!(frag.offset % frag.align.max(1), 0);
            last_end = frag.offset + frag.size();
        }
    }
    assert_eq!(text.size, 16);
}

#[test]
fn gc_prunes_unreached_sections_but_keeps_keeps() {
    let script = LinkerScript {
        rules: vec![
            OutputSectionRule::new(".text", vec![InputSpec::section(".text*")]),
            OutputSectionRule::new(".init", vec![InputSpec::keep_section(".init")]),
        ],
        ..LinkerScript::default()
    };
    let config = LinkerConfig::builder()
        .machine(ElfMachine::AArch64)
        .gc_sections(true)
        .build();
    let mut module = Module::new(config, script).unwrap();
    let object = contents(
        vec![
            null_section(),
            progbits(
                ".text._start",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                BL_PLACEHOLDER.to_vec(),
                4,
            ),
            progbits(
                ".text.a",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
            progbits(
                ".text.b",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
            progbits(".init", SectionFlags::ALLOC | SectionFlags::EXECINSTR, RET.to_vec(), 4),
        ],
        vec![
            null_symbol(),
            symbol("_start", 1, 2, 1, 0, 4),
            symbol("a", 1, 2, 2, 0, 4),
            symbol("b", 1, 2, 3, 0, 4),
        ],
        vec![(
            1,
            vec![RawReloc {
                offset: 0,
                rtype: R_AARCH64_CALL26,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    );
    add_object(&mut module, "a.o", &object).unwrap();
    module.garbage_collect();

    let mark_of = |name: &str| {
        module
            .sections()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.mark)
            .unwrap()
    };
    assert_eq!(mark_of(".text._start"), SectionMark::Live);
    assert_eq!(mark_of(".text.a"), SectionMark::Live);
    assert_eq!(mark_of(".text.b"), SectionMark::Ignore);
    assert_eq!(mark_of(".init"), SectionMark::Live);
}

#[test]
fn abs32_against_shared_data_becomes_a_copy_reloc() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let main = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![0; 8], 8),
        ],
        vec![
            null_symbol(),
            symbol("_start", 1, 2, 1, 0, 4),
            symbol("d", 1, 1, 0, 0, 0),
        ],
        vec![(
            2,
            vec![RawReloc {
                offset: 0,
                rtype: R_AARCH64_ABS32,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    );
    add_object(&mut module, "main.o", &main).unwrap();
    let libd = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![7, 0, 0, 0], 4),
        ],
        vec![null_symbol(), symbol("d", 1, 1, 1, 0, 4)],
        vec![],
    );
    add_shared(&mut module, "libd.so", &libd).unwrap();
    module.link().unwrap();

    let d = module.pool().find("d").unwrap();
    let copies: Vec<_> = module
        .rela_dyn()
        .iter()
        .filter(|r| r.rtype == R_AARCH64_COPY)
        .collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].symbol, Some(d));

    // The symbol now resolves to its .bss slot.
    let bss = module.output_section_named(".bss").unwrap();
    let value = module.symbol_value(d);
    assert!(value >= bss.addr && value < bss.addr + bss.size.max(1));
}

#[test]
fn nocopyreloc_refuses_the_copy() {
    let config = LinkerConfig::builder()
        .machine(ElfMachine::AArch64)
        .no_copy_reloc(true)
        .build();
    let mut module = Module::new(config, LinkerScript::empty()).unwrap();
    let main = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![0; 4], 4),
        ],
        vec![null_symbol(), symbol("_start", 1, 2, 1, 0, 0), symbol("d", 1, 1, 0, 0, 0)],
        vec![(
            1,
            vec![RawReloc {
                offset: 0,
                rtype: R_AARCH64_ABS32,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    );
    add_object(&mut module, "main.o", &main).unwrap();
    let libd = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![7, 0, 0, 0], 4),
        ],
        vec![null_symbol(), symbol("d", 1, 1, 1, 0, 4)],
        vec![],
    );
    add_shared(&mut module, "libd.so", &libd).unwrap();
    assert!(module.link().is_err());
    assert!(module.diag.contains(DiagKind::CopyRelocProhibited));
}

#[test]
fn scanning_twice_reserves_nothing_extra() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let object = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                vec![0; 8],
                4,
            ),
        ],
        vec![
            null_symbol(),
            symbol("_start", 1, 2, 1, 0, 8),
            symbol("g", 1, 1, 1, 4, 4),
        ],
        vec![(
            1,
            vec![RawReloc {
                offset: 0,
                rtype: elk::arch::aarch64::R_AARCH64_ADR_GOT_PAGE,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    );
    add_object(&mut module, "a.o", &object).unwrap();
    module.scan_relocations().unwrap();
    let got_before = module.gotplt().got_count();
    let plt_before = module.gotplt().plt_count();
    let dyn_before = module.rela_dyn().len();
    module.scan_relocations().unwrap();
    assert_eq!(module.gotplt().got_count(), got_before);
    assert_eq!(module.gotplt().plt_count(), plt_before);
    assert_eq!(module.rela_dyn().len(), dyn_before);
}

#[test]
fn undefined_reference_names_the_enclosing_function() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    add_object(&mut module, "a.o", &start_object("missing")).unwrap();
    assert!(module.link().is_err());
    let entries = module.diag.entries();
    let undef = entries
        .iter()
        .find(|d| d.kind == DiagKind::UndefinedReferenceInFunction)
        .unwrap();
    let text = undef.render();
    assert!(text.contains("missing"));
    assert!(text.contains("_start"));
}

#[test]
fn merge_strings_are_deduplicated_across_objects() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let strings = |bytes: &[u8]| {
        contents(
            vec![
                null_section(),
                RawSection {
                    name: ".rodata.str1.1".into(),
                    sh_type: SHT_PROGBITS,
                    flags: SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS,
                    addr: 0,
                    size: bytes.len() as u64,
                    link: 0,
                    info: 0,
                    align: 1,
                    entsize: 1,
                    data: bytes.to_vec(),
                },
            ],
            vec![null_symbol()],
            vec![],
        )
    };
    add_object(&mut module, "a.o", &strings(b"hello\0shared\0")).unwrap();
    add_object(&mut module, "b.o", &strings(b"shared\0world\0")).unwrap();
    module.garbage_collect();
    module.assign_output_sections().unwrap();
    module.merge_dedup();
    module.layout_offsets();

    let out = module.output_section_named(".rodata.str1.1").unwrap();
    // "hello\0" + "shared\0" + "world\0": the duplicate collapsed.
    assert_eq!(out.size, 6 + 7 + 6);

    let mut live = Vec::new();
    for sid in &out.members {
        for frag_id in &module.sections()[sid.index()].fragments {
            if let FragmentKind::MergeString { bytes, live: true, .. } =
                &module.fragment(*frag_id).kind
            {
                live.push(bytes.clone());
            }
        }
    }
    let mut unique = live.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(live.len(), unique.len());
}

#[test]
fn image_round_trips_through_the_reader() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    add_object(&mut module, "a.o", &start_object("f")).unwrap();
    let near = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
        ],
        vec![null_symbol(), symbol("f", 1, 2, 1, 0, 4)],
        vec![],
    );
    add_object(&mut module, "b.o", &near).unwrap();
    let image = module.link().unwrap();

    let parsed = elk::reader::read_object("a.out", &image, elk::base::IoCtx::elf64_le()).unwrap();
    assert_eq!(parsed.e_type, 2); // ET_EXEC
    assert_eq!(parsed.machine, Some(ElfMachine::AArch64));
    let names: Vec<&str> = parsed.sections.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&".text"));
    assert!(names.contains(&".symtab"));
    assert!(names.contains(&".shstrtab"));
    // The entry point lands inside .text.
    let text = parsed.sections.iter().find(|s| s.name == ".text").unwrap();
    let start = parsed.symbols.iter().find(|s| s.name == "_start").unwrap();
    assert!(start.value >= text.addr && start.value < text.addr + text.size);
}

fn comdat_object() -> ObjectContents {
    let mut group_data = Vec::new();
    group_data.extend_from_slice(&1u32.to_le_bytes()); // GRP_COMDAT
    group_data.extend_from_slice(&2u32.to_le_bytes()); // member: .text.f
    let group = RawSection {
        name: ".group".into(),
        sh_type: elk::base::SHT_GROUP,
        flags: SectionFlags::empty(),
        addr: 0,
        size: group_data.len() as u64,
        link: 0,
        info: 1, // signature symbol index
        align: 4,
        entsize: 4,
        data: group_data,
    };
    contents(
        vec![
            null_section(),
            group,
            progbits(
                ".text.f",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR | SectionFlags::GROUP,
                RET.to_vec(),
                4,
            ),
        ],
        vec![null_symbol(), symbol("f", 1, 2, 2, 0, 4)],
        vec![],
    )
}

#[test]
fn duplicate_comdat_groups_keep_the_first_copy() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    // Same group twice: the second integrates without a multiple
    // definition and its members drop out.
    add_object(&mut module, "a.o", &comdat_object()).unwrap();
    add_object(&mut module, "b.o", &comdat_object()).unwrap();
    assert!(!module.diag.contains(DiagKind::MultipleDefinition));

    let dropped: Vec<bool> = module
        .sections()
        .iter()
        .filter(|s| s.name == ".text.f")
        .map(|s| s.mark == SectionMark::Ignore)
        .collect();
    assert_eq!(dropped, [false, true]);
}

#[test]
fn partial_link_emits_group_member_indices() {
    let config = LinkerConfig::builder()
        .machine(ElfMachine::AArch64)
        .codegen(elk::config::CodeGenType::Object)
        .build();
    let mut module = Module::new(config, LinkerScript::empty()).unwrap();
    add_object(&mut module, "a.o", &comdat_object()).unwrap();
    let image = module.link().unwrap();

    let parsed = elk::reader::read_object("r.o", &image, elk::base::IoCtx::elf64_le()).unwrap();
    assert_eq!(parsed.e_type, 1); // ET_REL
    let group = parsed
        .sections
        .iter()
        .find(|s| s.sh_type == elk::base::SHT_GROUP)
        .unwrap();
    // Flag word, then the member rewritten against the output headers.
    let flags = u32::from_le_bytes(group.data[0..4].try_into().unwrap());
    assert_eq!(flags, 1); // GRP_COMDAT
    let member = u32::from_le_bytes(group.data[4..8].try_into().unwrap());
    let text_shndx = parsed
        .sections
        .iter()
        .position(|s| s.name == ".text.f")
        .unwrap();
    assert_eq!(member as usize, text_shndx);
    // sh_info names the signature symbol in the output symtab.
    let f_index = parsed
        .symbols
        .iter()
        .position(|s| s.name == "f")
        .unwrap();
    assert_eq!(group.info as usize, f_index);
}

#[test]
fn dynamic_exec_gets_a_phdr_segment() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let main = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![0; 4], 4),
        ],
        vec![null_symbol(), symbol("_start", 1, 2, 1, 0, 0), symbol("d", 1, 1, 0, 0, 0)],
        vec![(
            1,
            vec![RawReloc {
                offset: 0,
                rtype: R_AARCH64_ABS32,
                symidx: 2,
                addend: 0,
            }],
            true,
        )],
    );
    add_object(&mut module, "main.o", &main).unwrap();
    let libd = contents(
        vec![
            null_section(),
            progbits(".data", SectionFlags::ALLOC | SectionFlags::WRITE, vec![7, 0, 0, 0], 4),
        ],
        vec![null_symbol(), symbol("d", 1, 1, 1, 0, 4)],
        vec![],
    );
    add_shared(&mut module, "libd.so", &libd).unwrap();
    module.link().unwrap();

    let segments = module.output_segments();
    let phdr = segments
        .iter()
        .find(|s| s.p_type == elk::base::PT_PHDR)
        .unwrap();
    // The table sits right after the ELF header and covers phnum entries.
    assert_eq!(phdr.offset, 64);
    assert_eq!(phdr.filesz, segments.len() as u64 * 56);
    assert_eq!(phdr.memsz, phdr.filesz);
    // PT_PHDR precedes PT_INTERP the way the default segment set orders.
    let interp_pos = segments
        .iter()
        .position(|s| s.p_type == elk::base::PT_INTERP)
        .unwrap();
    let phdr_pos = segments
        .iter()
        .position(|s| s.p_type == elk::base::PT_PHDR)
        .unwrap();
    assert!(phdr_pos < interp_pos);
}

#[test]
fn nobits_consumes_no_file_space() {
    let mut module = Module::new(exec_config(), LinkerScript::empty()).unwrap();
    let object = contents(
        vec![
            null_section(),
            progbits(
                ".text",
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                RET.to_vec(),
                4,
            ),
            RawSection {
                name: ".bss.big".into(),
                sh_type: SHT_NOBITS,
                flags: SectionFlags::ALLOC | SectionFlags::WRITE,
                addr: 0,
                size: 0x10_0000,
                link: 0,
                info: 0,
                align: 8,
                entsize: 0,
                data: Vec::new(),
            },
        ],
        vec![null_symbol(), symbol("_start", 1, 2, 1, 0, 4)],
        vec![],
    );
    add_object(&mut module, "a.o", &object).unwrap();
    let image = module.link().unwrap();
    // A megabyte of zero-fill must not appear in the file.
    assert!(image.len() < 0x10_0000);
}
