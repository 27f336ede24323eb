//! End-to-end pipeline tests over a synthetic protected sample: scatter
//! jumps, junk windows, an opaque predicate, a dispatcher stub, and an
//! encrypted import, all the way to a loadable output image.

use unscatter::{
    dump_new_image_buffer_to_disk, recover_imports_merge, recover_instruction_dispatchers,
    recover_recursive_in_full, rebuild_output, run_full_recovery, Error, HeaderlessLayout,
    MutationRuleSet, ProtectedInput, ProtectionMode,
};

use unscatter::cfg::{FuncState, Terminator};
use unscatter::dispatch::ResolvedDispatch;
use unscatter::imports::ImportApi;

const IMP_CONST: u32 = 0x6817_FD83;

/// Inverse of the import-name cipher, for building fixtures.
fn encrypt_import_name(imp_decrypt_const: u32, seed: u32, name: &str) -> Vec<u8> {
    let mut out = seed.to_le_bytes().to_vec();
    let mut state = seed;
    let key_of = |state: u32| -> u8 {
        let calculated = state.wrapping_mul(17).wrapping_sub(imp_decrypt_const);
        calculated
            .to_le_bytes()
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    };
    for &pt in name.as_bytes() {
        out.push(pt ^ key_of(state));
        state = state.wrapping_mul(17).wrapping_sub(imp_decrypt_const);
    }
    out.push(key_of(state));
    out
}

/// A direct dispatcher stub: saves flags/scratch, overwrites the
/// caller's return slot with `target`, restores, returns.
fn emit_direct_dispatcher(code: &mut [u8], at: usize, target: u64) {
    let mut stub = vec![0x9C, 0x50, 0x51];
    stub.extend_from_slice(&[0x48, 0xB8]);
    stub.extend_from_slice(&target.to_le_bytes());
    stub.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0x18]);
    stub.extend_from_slice(&[0x59, 0x58, 0x9D, 0xC3]);
    code[at..at + stub.len()].copy_from_slice(&stub);
}

/// Build the protected sample: text at 0x1000..0x2000, data at
/// 0x2000..0x3000.
///
/// ```text
/// 0x1000  jmp 0x1005                 scatter link
/// 0x1005  call [rip] -> slot 0x2000  protected import (kernel32!ExitProcess)
/// 0x100b  nop                        junk
/// 0x100c  call 0x1080                dispatcher -> really continues at 0x1040
/// 0x1040  mov eax, 42
/// 0x1045  call 0x1060                real callee
/// 0x104a  ret
/// 0x1060  stc; jb 0x1065             opaque predicate
/// 0x1065  ret
/// 0x1080  <dispatcher stub>
/// ```
fn build_sample() -> Vec<u8> {
    let mut blob = vec![0xCCu8; 0x3000];

    blob[0x1000..0x1003].copy_from_slice(&[0xEB, 0x03, 0xCC]);
    blob[0x1005..0x100B].copy_from_slice(&[0xFF, 0x15, 0xF5, 0x0F, 0x00, 0x00]);
    blob[0x100B] = 0x90;
    blob[0x100C..0x1011].copy_from_slice(&[0xE8, 0x6F, 0x00, 0x00, 0x00]);
    blob[0x1040..0x1045].copy_from_slice(&[0xB8, 0x2A, 0x00, 0x00, 0x00]);
    blob[0x1045..0x104A].copy_from_slice(&[0xE8, 0x16, 0x00, 0x00, 0x00]);
    blob[0x104A] = 0xC3;
    blob[0x1060..0x1063].copy_from_slice(&[0xF9, 0x72, 0x02]);
    blob[0x1065] = 0xC3;
    emit_direct_dispatcher(&mut blob, 0x1080, 0x1040);

    // Import machinery in the data section.
    blob[0x2000..0x2004].copy_from_slice(&0x2010u32.to_le_bytes());
    blob[0x2004..0x2008].copy_from_slice(&0x2030u32.to_le_bytes());
    let dll = encrypt_import_name(IMP_CONST, 0x1111_2222, "KERNEL32.dll");
    let api = encrypt_import_name(IMP_CONST, 0x3333_4444, "ExitProcess");
    blob[0x2010..0x2010 + dll.len()].copy_from_slice(&dll);
    blob[0x2030..0x2030 + api.len()].copy_from_slice(&api);

    blob
}

fn sample_input() -> ProtectedInput {
    ProtectedInput::from_headerless_bytes(
        &build_sample(),
        Some(HeaderlessLayout {
            text_rva: 0x1000,
            data_rva: 0x2000,
            data_size: 0x1000,
        }),
        IMP_CONST,
        MutationRuleSet::RuleSet1,
    )
    .unwrap()
}

fn rd32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[test]
fn full_pipeline_recovers_the_sample() {
    let mut input = sample_input();

    recover_instruction_dispatchers(&mut input).unwrap();
    assert_eq!(input.dispatcher_locs.len(), 1);
    assert_eq!(
        input.dispatcher_locs.get(0x1080).unwrap().dispatch,
        ResolvedDispatch::Direct { target: 0x1040 }
    );
    assert!(input.dispatcher_locs.unresolved.is_empty());

    recover_imports_merge(&mut input).unwrap();
    assert_eq!(input.imports.len(), 1);
    let imp = &input.imports.by_site[&0x1005];
    assert_eq!(imp.dll, "kernel32.dll");
    assert_eq!(imp.api, ImportApi::Name("ExitProcess".to_string()));

    input.cfg = recover_recursive_in_full(&mut input, 0x1000).unwrap();
    assert_eq!(input.cfg.len(), 2);
    let root = &input.cfg[&0x1000];
    assert_eq!(root.state, FuncState::Complete);
    assert_eq!(root.name.as_deref(), Some("start"));
    assert_eq!(root.real_entry, 0x1005);
    // Scatter link, junk nop, and the dispatcher call all collapsed.
    assert_eq!(root.normalized.len(), 4);
    let callee = &input.cfg[&0x1060];
    assert_eq!(callee.normalized.len(), 1);
    assert_eq!(callee.blocks[&0x1065].terminator, Terminator::Return);

    rebuild_output(&mut input).unwrap();
    let buf = input.new_image_buffer.as_ref().unwrap();

    // Root laid out at 0x1000: import call, mov, call, ret.
    assert_eq!(&buf[0x1000..0x1002], &[0xFF, 0x15]);
    assert_eq!(&buf[0x1006..0x100B], &[0xB8, 0x2A, 0x00, 0x00, 0x00]);
    assert_eq!(buf[0x100B], 0xE8);
    assert_eq!(buf[0x1010], 0xC3);

    // The import call goes through its rebuilt IAT slot.
    let slot = input.import_to_rva_map
        [&("kernel32.dll".to_string(), ImportApi::Name("ExitProcess".to_string()))];
    let disp = rd32(buf, 0x1002) as u64;
    assert_eq!(0x1006 + disp, slot);

    // The relocated call lands on the relocated callee.
    let callee_reloc = input.cfg[&0x1060].reloc_rva;
    let rel = rd32(buf, 0x100C) as i32 as i64;
    assert_eq!((0x1010 + rel) as u64, callee_reloc);

    // The data section came through untouched.
    assert_eq!(rd32(buf, 0x2000), 0x2010);
}

#[test]
fn section8_invariants_hold() {
    let mut input = sample_input();
    run_full_recovery(&mut input, 0x1000).unwrap();

    // Dispatcher records: no identity dispatch, executable targets.
    for rec in input.dispatcher_locs.records.values() {
        for t in rec.targets() {
            assert_ne!(t, rec.site);
            assert!(input.image.is_executable(t));
        }
    }

    // Unique (DLL, API) pairs.
    let mut seen = std::collections::BTreeSet::new();
    for (dll, apis) in &input.imports.merged {
        assert_eq!(dll, &dll.to_ascii_lowercase());
        for api in apis {
            assert!(seen.insert((dll.clone(), api.clone())));
        }
    }

    // Block successors resolve within the function, to another
    // function's entry chain, or to an import thunk.
    for (entry, func) in &input.cfg {
        for block in func.blocks.values() {
            for succ in &block.succs {
                let in_func = func.blocks.contains_key(succ);
                let is_entry = input.cfg.values().any(|f| f.real_entry == *succ)
                    || input.cfg.contains_key(succ);
                assert!(
                    in_func || is_entry,
                    "function {:#x}: dangling successor {:#x}",
                    entry,
                    succ
                );
            }
        }
    }
}

#[test]
fn pipeline_is_deterministic_and_idempotent() {
    let mut a = sample_input();
    run_full_recovery(&mut a, 0x1000).unwrap();
    let mut b = sample_input();
    run_full_recovery(&mut b, 0x1000).unwrap();
    assert_eq!(a.new_image_buffer, b.new_image_buffer);

    // Re-running dispatcher recovery yields the same record set.
    let before = a.dispatcher_locs.clone();
    recover_instruction_dispatchers(&mut a).unwrap();
    assert_eq!(before, a.dispatcher_locs);
}

#[test]
fn rebuilt_import_directory_parses_as_standard_pe() {
    let mut input = sample_input();
    run_full_recovery(&mut input, 0x1000).unwrap();
    let buf = input.new_image_buffer.clone().unwrap();

    let pe = goblin::pe::PE::parse(&buf).expect("rebuilt image must parse");
    assert_eq!(pe.entry, 0x1000);
    assert!(pe.is_64);
    let names: Vec<&str> = pe.sections.iter().filter_map(|s| {
        std::str::from_utf8(&s.name).ok().map(|n| n.trim_end_matches('\0'))
    }).collect();
    assert!(names.contains(&".text") && names.contains(&".data") && names.contains(&".idata"));
    assert!(
        pe.imports
            .iter()
            .any(|imp| imp.name == "ExitProcess" && imp.dll.eq_ignore_ascii_case("kernel32.dll")),
        "imports: {:?}",
        pe.imports
    );
}

#[test]
fn rebuilt_entry_point_lifts_to_a_function() {
    let mut input = sample_input();
    run_full_recovery(&mut input, 0x1000).unwrap();
    let buf = input.new_image_buffer.clone().unwrap();

    // Lift the clean output again, as a full PE this time.
    let mut relift = ProtectedInput::from_bytes(
        &buf,
        ProtectionMode::Full,
        IMP_CONST,
        MutationRuleSet::RuleSet1,
    )
    .unwrap();
    let entry = relift.image.entry_point();
    recover_instruction_dispatchers(&mut relift).unwrap();
    recover_imports_merge(&mut relift).unwrap();
    let cfg = recover_recursive_in_full(&mut relift, entry).unwrap();
    assert!(cfg[&entry].block_count() >= 1);
}

#[test]
fn truncated_input_fails_before_recovery() {
    let junk = b"MZ\x90\x00not a complete image";
    match ProtectedInput::from_bytes(junk, ProtectionMode::Full, IMP_CONST, MutationRuleSet::RuleSet1)
    {
        Err(Error::Parse(_)) => {}
        other => panic!("expected a parse error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn corrupted_dispatcher_still_yields_an_output() {
    let mut blob = build_sample();
    // Wreck the dispatcher body right after its prologue.
    blob[0x1083] = 0x06;
    blob[0x1084] = 0x06;
    let mut input = ProtectedInput::from_headerless_bytes(
        &blob,
        Some(HeaderlessLayout {
            text_rva: 0x1000,
            data_rva: 0x2000,
            data_size: 0x1000,
        }),
        IMP_CONST,
        MutationRuleSet::RuleSet1,
    )
    .unwrap();

    recover_instruction_dispatchers(&mut input).unwrap();
    assert!(input.dispatcher_locs.is_empty());
    assert!(input.dispatcher_locs.is_unresolved(0x1080));

    recover_imports_merge(&mut input).unwrap();
    input.cfg = recover_recursive_in_full(&mut input, 0x1000).unwrap();
    let root = &input.cfg[&0x1000];
    assert_eq!(root.state, FuncState::Unresolved);
    assert!(root
        .blocks
        .values()
        .any(|b| b.flags.contains(unscatter::cfg::BlockFlags::UNRESOLVED)));

    // The pipeline still produces an output buffer.
    rebuild_output(&mut input).unwrap();
    assert!(input.new_image_buffer.is_some());
}

#[test]
fn output_can_be_written_to_disk() {
    let mut input = sample_input();
    run_full_recovery(&mut input, 0x1000).unwrap();

    let dir = std::env::temp_dir().join("unscatter-pipeline-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sample-recovered.bin");
    dump_new_image_buffer_to_disk(&input, &path).unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(Some(written), input.new_image_buffer);
    std::fs::remove_file(&path).ok();
}
