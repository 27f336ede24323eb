//! Recovery checkpoints for the known SHADOWPAD sample corpus.
//!
//! The samples are malware and do not ship with the repository; drop
//! them under `testdata/` (or point `UNSCATTER_TESTDATA` at a directory
//! holding them) to enable these tests. Without the files each test
//! logs a skip and passes vacuously.

use std::path::PathBuf;

use unscatter::{
    recover_imports_merge, recover_instruction_dispatchers, recover_recursive_in_full,
    rebuild_output, run_full_recovery, HeaderlessLayout, MutationRuleSet, ProtectedInput,
    ProtectionMode,
};

const IMP_CONST: u32 = 0x6817_FD83;

fn testdata(name: &str) -> Option<PathBuf> {
    let root = std::env::var("UNSCATTER_TESTDATA").unwrap_or_else(|_| "testdata".to_string());
    let path = PathBuf::from(root).join(name);
    if path.exists() {
        Some(path)
    } else {
        eprintln!("skipping corpus test: {} not present", path.display());
        None
    }
}

#[test]
fn headerless_backdoor_checkpoints() {
    let Some(path) = testdata("780EBC3F-backdoor-decrypted.bin") else {
        return;
    };
    let data = std::fs::read(path).unwrap();
    // The backdoor's data section starts at the last page-aligned third
    // of the blob; the exact split ships next to the sample.
    let layout = std::fs::read_to_string("testdata/780EBC3F-layout.txt")
        .ok()
        .and_then(|s| {
            let mut it = s.split_whitespace().map(|v| {
                u64::from_str_radix(v.trim_start_matches("0x"), 16).ok()
            });
            Some(HeaderlessLayout {
                text_rva: 0x1000,
                data_rva: it.next()??,
                data_size: it.next()??,
            })
        });

    let mut input =
        ProtectedInput::from_headerless_bytes(&data, layout, IMP_CONST, MutationRuleSet::RuleSet1)
            .unwrap();

    recover_instruction_dispatchers(&mut input).unwrap();
    assert_eq!(input.dispatcher_locs.len(), 0x4090);

    recover_imports_merge(&mut input).unwrap();
    assert_eq!(input.imports.len(), 0x46F);

    input.cfg = recover_recursive_in_full(&mut input, 0).unwrap();
    assert_eq!(input.cfg.len(), 495);

    rebuild_output(&mut input).unwrap();
    assert!(input.new_image_buffer.is_some());
}

fn plugin_checkpoints(name: &str, dispatchers: usize, imports: usize, functions: usize) {
    let Some(path) = testdata(name) else {
        return;
    };
    let mut input = ProtectedInput::from_path(
        path,
        ProtectionMode::Full,
        IMP_CONST,
        MutationRuleSet::RuleSet1,
    )
    .unwrap();
    let root = input.image.entry_point();

    recover_instruction_dispatchers(&mut input).unwrap();
    assert_eq!(input.dispatcher_locs.len(), dispatchers);

    recover_imports_merge(&mut input).unwrap();
    assert_eq!(input.imports.len(), imports);

    input.cfg = recover_recursive_in_full(&mut input, root).unwrap();
    assert_eq!(input.cfg.len(), functions);

    rebuild_output(&mut input).unwrap();
}

#[test]
fn plugin_2000cc24_checkpoints() {
    plugin_checkpoints("2000CC24.dll", 1332, 76, 35);
}

#[test]
fn plugin_2000fe24_checkpoints() {
    plugin_checkpoints("2000FE24.dll", 1883, 84, 60);
}

#[test]
fn plugin_rerun_is_byte_identical() {
    let Some(path) = testdata("2000CC24.dll") else {
        return;
    };
    let data = std::fs::read(path).unwrap();
    let run = |data: &[u8]| {
        let mut input = ProtectedInput::from_bytes(
            data,
            ProtectionMode::Full,
            IMP_CONST,
            MutationRuleSet::RuleSet1,
        )
        .unwrap();
        let root = input.image.entry_point();
        run_full_recovery(&mut input, root).unwrap();
        input.new_image_buffer.unwrap()
    };
    assert_eq!(run(&data), run(&data));
}
