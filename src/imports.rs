//! Protected import recovery.
//!
//! The obfuscator strips the import directory and replaces every import
//! reference with an indirect call/jmp through a private thunk slot. The
//! slot holds a descriptor of two RVAs pointing at the encrypted DLL and
//! API name blobs; a runtime stub decrypts the names, resolves the
//! address, and patches the slot. Recovery inverts this statically:
//! enumerate the rip-relative sites, read each descriptor, decrypt both
//! names with the sample's 32-bit constant, and merge duplicates so each
//! unique (DLL, API) pair receives exactly one slot in the rebuilt IAT.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::image::ProtectedImage;
use crate::x86;

/// Upper bound on a decrypted name, from the stub's own loop guard.
pub const IMPORT_NAME_MAX: usize = 0x400;

/// High bit of the API blob seed marks an ordinal import.
const ORDINAL_FLAG: u32 = 0x8000_0000;

/// An imported symbol: a name, or a bare ordinal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportApi {
    Name(String),
    Ordinal(u16),
}

impl std::fmt::Display for ImportApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportApi::Name(n) => f.write_str(n),
            ImportApi::Ordinal(o) => write!(f, "#{}", o),
        }
    }
}

/// One recovered protected import reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredImport {
    /// RVA of the `call`/`jmp qword ptr [rip+disp]` site.
    pub site: u64,
    /// RVA of the obfuscator thunk slot the site reads.
    pub slot: u64,
    /// Lowercased DLL name.
    pub dll: String,
    /// API name (case preserved) or ordinal.
    pub api: ImportApi,
    /// The site is a tail `jmp` rather than a call.
    pub tail_jmp: bool,
    /// IAT slot RVA in the rebuilt image; assigned by the assembler.
    pub new_rva: Option<u64>,
}

/// Flattened row for the CSV dump subcommand.
#[derive(Debug, Serialize)]
pub struct ImportCsvRow {
    pub site: String,
    pub dll: String,
    pub api: String,
}

impl From<&RecoveredImport> for ImportCsvRow {
    fn from(imp: &RecoveredImport) -> ImportCsvRow {
        ImportCsvRow {
            site: format!("{:#x}", imp.site),
            dll: imp.dll.clone(),
            api: imp.api.to_string(),
        }
    }
}

/// All import knowledge for one input.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveredImports {
    /// Every recovered site, keyed by its call/jmp RVA.
    pub by_site: BTreeMap<u64, RecoveredImport>,
    /// Deduplicated (DLL -> APIs) map feeding the import table builder.
    pub merged: BTreeMap<String, BTreeSet<ImportApi>>,
    /// Sites whose blobs decrypted to garbage; reported and skipped.
    pub failed: BTreeSet<u64>,
    /// Legitimate (unprotected) import sites routed through the original
    /// IAT, kept so selective-mode rebuilds can preserve them.
    pub preserved: BTreeMap<u64, u64>,
    /// Original IAT slot RVA -> (DLL, API), parsed from the input's own
    /// import directory when it has one.
    pub preserved_pairs: BTreeMap<u64, (String, ImportApi)>,
}

impl RecoveredImports {
    pub fn len(&self) -> usize {
        self.by_site.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_site.is_empty()
    }

    /// Site RVAs, for the CFG stepper's import classification.
    pub fn sites(&self) -> BTreeSet<u64> {
        self.by_site.keys().copied().collect()
    }

    /// Number of unique (DLL, API) pairs.
    pub fn unique_pairs(&self) -> usize {
        self.merged.values().map(|apis| apis.len()).sum()
    }
}

/// Decrypt one name blob: `[u32 seed][ciphertext...]`.
///
/// A running 32-bit state is seeded from the blob head. Each step
/// advances the state as `state * 17 - imp_decrypt_const`, takes the low
/// byte of the byte-sum of the new state as the keystream byte, and
/// xors it against the ciphertext byte. A ciphertext byte equal to the
/// keystream byte produces NUL and terminates the name.
pub fn decrypt_import_name(imp_decrypt_const: u32, blob: &[u8]) -> Result<String> {
    let fail = |reason: &str| Error::ImportDecrypt {
        site: 0,
        reason: reason.to_string(),
    };
    if blob.len() < 5 {
        return Err(fail("blob too short for a seed and a terminator"));
    }
    let mut state = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let mut out: Vec<u8> = Vec::new();
    let mut terminated = false;

    for index in 0..IMPORT_NAME_MAX {
        let calculated = state.wrapping_mul(17).wrapping_sub(imp_decrypt_const);
        let key_byte = calculated
            .to_le_bytes()
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        let Some(&cipher_byte) = blob.get(index + 4) else {
            break;
        };
        out.push(cipher_byte ^ key_byte);
        if cipher_byte == key_byte {
            terminated = true;
            break;
        }
        state = calculated;
    }

    if !terminated {
        return Err(fail("no terminator within the length bound"));
    }
    out.pop(); // the NUL
    if out.is_empty() {
        return Err(fail("decrypted to an empty name"));
    }
    if !out.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        return Err(fail("decrypted to non-printable bytes"));
    }
    Ok(String::from_utf8(out).expect("printable ascii is valid utf-8"))
}

/// Whether `rva` lies inside the original import machinery (IAT or
/// import directory) of a PE input.
fn in_original_import_range(image: &ProtectedImage, rva: u64) -> bool {
    let Some(pe) = image.pe() else { return false };
    for idx in [crate::pe::DIR_IAT, crate::pe::DIR_IMPORT] {
        if let Some(dir) = pe.optional.data_directories.get(idx) {
            let start = dir.virtual_address as u64;
            if dir.virtual_address != 0 && rva >= start && rva < start + dir.size as u64 {
                return true;
            }
        }
    }
    false
}

/// Parse the input's original import directory into an
/// IAT-slot -> (DLL, API) map. Absent or malformed directories yield an
/// empty map; the protected import machinery is the primary source.
pub fn parse_original_imports(image: &ProtectedImage) -> BTreeMap<u64, (String, ImportApi)> {
    let mut out = BTreeMap::new();
    let Some(dir) = image.import_directory() else {
        return out;
    };
    let read_cstr = |rva: u64| -> Option<String> {
        let mut s = Vec::new();
        for i in 0..256 {
            let b = image.bytes_at(rva + i, 1).ok()?[0];
            if b == 0 {
                break;
            }
            if !(0x20..0x7F).contains(&b) {
                return None;
            }
            s.push(b);
        }
        (!s.is_empty()).then(|| String::from_utf8(s).unwrap())
    };

    let mut desc = dir.virtual_address as u64;
    loop {
        let (Ok(oft), Ok(name_rva), Ok(ft)) = (
            image.read_u32(desc),
            image.read_u32(desc + 12),
            image.read_u32(desc + 16),
        ) else {
            break;
        };
        if oft == 0 && name_rva == 0 && ft == 0 {
            break;
        }
        let Some(dll) = read_cstr(name_rva as u64).map(|d| d.to_ascii_lowercase()) else {
            desc += 20;
            continue;
        };
        let lookup = if oft != 0 { oft as u64 } else { ft as u64 };
        for idx in 0..4096u64 {
            let Ok(thunk) = image.read_u64(lookup + idx * 8) else {
                break;
            };
            if thunk == 0 {
                break;
            }
            let api = if thunk & (1u64 << 63) != 0 {
                ImportApi::Ordinal((thunk & 0xFFFF) as u16)
            } else {
                match read_cstr((thunk & 0x7FFF_FFFF) + 2) {
                    Some(name) => ImportApi::Name(name),
                    None => break,
                }
            };
            out.insert(ft as u64 + idx * 8, (dll.clone(), api));
        }
        desc += 20;
    }
    out
}

fn recover_site(
    image: &ProtectedImage,
    imp_decrypt_const: u32,
    site: u64,
    slot: u64,
    tail_jmp: bool,
) -> Result<RecoveredImport> {
    let with_site = |mut e: Error| {
        if let Error::ImportDecrypt { site: s, .. } = &mut e {
            *s = site;
        }
        e
    };

    let dll_rva = image.read_u32(slot)? as u64;
    let api_rva = image.read_u32(slot + 4)? as u64;

    let dll_blob = image.bytes_at(dll_rva, remaining_window(image, dll_rva))?;
    let dll = decrypt_import_name(imp_decrypt_const, dll_blob)
        .map_err(with_site)?
        .to_ascii_lowercase();

    let api_seed = image.read_u32(api_rva)?;
    let api = if api_seed & ORDINAL_FLAG != 0 {
        ImportApi::Ordinal((api_seed & 0xFFFF) as u16)
    } else {
        let api_blob = image.bytes_at(api_rva, remaining_window(image, api_rva))?;
        ImportApi::Name(decrypt_import_name(imp_decrypt_const, api_blob).map_err(with_site)?)
    };

    Ok(RecoveredImport {
        site,
        slot,
        dll,
        api,
        tail_jmp,
        new_rva: None,
    })
}

/// Largest readable window at `rva`, capped at the maximum blob size.
fn remaining_window(image: &ProtectedImage, rva: u64) -> usize {
    let mut n = IMPORT_NAME_MAX + 4;
    while n > 0 && image.bytes_at(rva, n).is_err() {
        n /= 2;
    }
    n
}

/// Enumerate protected import sites and decrypt their names, merging
/// duplicates. A name pair that decrypts cleanly is retained even when
/// it matches no known DLL or API; a wrong name fails loudly at load
/// time, which beats silently dropping the import.
pub fn recover_imports(image: &ProtectedImage, imp_decrypt_const: u32) -> Result<RecoveredImports> {
    let mut imports = RecoveredImports::default();
    imports.preserved_pairs = parse_original_imports(image);

    for span in image.executable_spans() {
        let bytes = match image.bytes_at(span.rva, span.size as usize) {
            Ok(b) => b,
            Err(_) => continue,
        };
        for (i, w) in bytes.windows(2).enumerate() {
            let tail_jmp = match w {
                [0xFF, 0x15] => false,
                [0xFF, 0x25] => true,
                _ => continue,
            };
            let site = span.rva + i as u64;
            let Ok(instr) = x86::decode_at(image, site) else {
                continue;
            };
            if !(instr.is_rip_rel_call() || instr.is_rip_rel_jmp()) {
                continue;
            }
            let Some(slot) = instr.rip_mem_target() else {
                continue;
            };

            if imports.preserved_pairs.contains_key(&slot) || in_original_import_range(image, slot) {
                trace!("site {:#x} goes through the original IAT; preserved", site);
                imports.preserved.insert(site, slot);
                continue;
            }

            match recover_site(image, imp_decrypt_const, site, slot, tail_jmp) {
                Ok(imp) => {
                    trace!("import at {:#x}: {}!{}", site, imp.dll, imp.api);
                    imports
                        .merged
                        .entry(imp.dll.clone())
                        .or_default()
                        .insert(imp.api.clone());
                    imports.by_site.insert(site, imp);
                }
                Err(Error::ImportDecrypt { site, reason }) => {
                    warn!("failed import stub at {:#x}: {}", site, reason);
                    imports.failed.insert(site);
                }
                Err(_) => {
                    // The slot or blobs point outside the image: not an
                    // import stub at all, just byte-pattern noise.
                    trace!("site {:#x} is not an import stub", site);
                }
            }
        }
    }

    debug!(
        "recovered {} import sites, {} unique pairs, {} failed, {} preserved",
        imports.len(),
        imports.unique_pairs(),
        imports.failed.len(),
        imports.preserved.len()
    );
    Ok(imports)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_IMP_CONST: u32 = 0x6817_FD83;

    /// Inverse of [`decrypt_import_name`], used to build fixtures.
    pub(crate) fn encrypt_import_name(imp_decrypt_const: u32, seed: u32, name: &str) -> Vec<u8> {
        let mut out = seed.to_le_bytes().to_vec();
        let mut state = seed;
        for &pt in name.as_bytes() {
            let calculated = state.wrapping_mul(17).wrapping_sub(imp_decrypt_const);
            let key_byte = calculated
                .to_le_bytes()
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            out.push(pt ^ key_byte);
            state = calculated;
        }
        // Terminator: ciphertext equal to the keystream byte.
        let calculated = state.wrapping_mul(17).wrapping_sub(imp_decrypt_const);
        let key_byte = calculated
            .to_le_bytes()
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        out.push(key_byte);
        out
    }

    #[test]
    fn decrypts_a_known_vector() {
        // seed 0, constant 0x6817FD83: the first two keystream bytes are
        // 0xFE and 0xF4, worked out by hand from the mix definition.
        let blob = [0x00, 0x00, 0x00, 0x00, b'A' ^ 0xFE, 0xF4];
        let name = decrypt_import_name(TEST_IMP_CONST, &blob).unwrap();
        assert_eq!(name, "A");
    }

    #[test]
    fn roundtrips_through_the_inverse_transform() {
        for name in ["KERNEL32.dll", "GetProcAddress", "ws2_32.dll", "x"] {
            let blob = encrypt_import_name(TEST_IMP_CONST, 0xDEAD_BEEF, name);
            assert_eq!(
                decrypt_import_name(TEST_IMP_CONST, &blob).unwrap(),
                name,
                "name {} did not survive",
                name
            );
        }
        // A different constant must not decrypt the same blob.
        let blob = encrypt_import_name(TEST_IMP_CONST, 0x1234_5678, "KERNEL32.dll");
        assert_ne!(
            decrypt_import_name(0x1111_1111, &blob).ok(),
            Some("KERNEL32.dll".to_string())
        );
    }

    #[test]
    fn rejects_bad_blobs() {
        // Too short.
        assert!(decrypt_import_name(TEST_IMP_CONST, &[1, 2, 3]).is_err());
        // Non-printable plaintext.
        let blob = encrypt_import_name(TEST_IMP_CONST, 7, "\u{1}bad");
        assert!(decrypt_import_name(TEST_IMP_CONST, &blob).is_err());
        // No terminator.
        let mut blob = encrypt_import_name(TEST_IMP_CONST, 7, "name");
        blob.pop();
        assert!(decrypt_import_name(TEST_IMP_CONST, &blob).is_err());
    }

    /// Lay out a synthetic image with protected import sites.
    /// Returns (image bytes, expected site rvas).
    pub(crate) fn build_import_fixture(imp_const: u32) -> (Vec<u8>, Vec<u64>) {
        let mut code = vec![0x90u8; 0x200];
        // Thunk slots + blobs live past the code, still inside the blob.
        // slot0 at 0x100: kernel32!GetProcAddress
        // slot1 at 0x108: kernel32!GetProcAddress (duplicate site)
        // slot2 at 0x110: user32 ordinal 0x300... via flagged seed
        let dll_blob = encrypt_import_name(imp_const, 0x31, "KERNEL32.dll");
        let api_blob = encrypt_import_name(imp_const, 0x32, "GetProcAddress");
        let dll2_blob = encrypt_import_name(imp_const, 0x33, "USER32.dll");

        let dll_rva = 0x120u64;
        let api_rva = (0x120 + dll_blob.len()) as u64;
        let dll2_rva = api_rva + api_blob.len() as u64;
        let ord_rva = dll2_rva + dll2_blob.len() as u64;

        code[dll_rva as usize..dll_rva as usize + dll_blob.len()].copy_from_slice(&dll_blob);
        code[api_rva as usize..api_rva as usize + api_blob.len()].copy_from_slice(&api_blob);
        code[dll2_rva as usize..dll2_rva as usize + dll2_blob.len()].copy_from_slice(&dll2_blob);
        code[ord_rva as usize..ord_rva as usize + 4]
            .copy_from_slice(&(ORDINAL_FLAG | 0x300).to_le_bytes());

        let write_slot = |code: &mut [u8], slot: usize, dll: u64, api: u64| {
            code[slot..slot + 4].copy_from_slice(&(dll as u32).to_le_bytes());
            code[slot + 4..slot + 8].copy_from_slice(&(api as u32).to_le_bytes());
        };
        write_slot(&mut code, 0x100, dll_rva, api_rva);
        write_slot(&mut code, 0x108, dll_rva, api_rva);
        write_slot(&mut code, 0x110, dll2_rva, ord_rva);

        // Two call sites and one tail jmp.
        let emit_site = |code: &mut [u8], at: usize, opcode: u8, slot: u64| {
            code[at] = 0xFF;
            code[at + 1] = opcode;
            let disp = (slot as i64 - (at as i64 + 6)) as i32;
            code[at + 2..at + 6].copy_from_slice(&disp.to_le_bytes());
        };
        emit_site(&mut code, 0x00, 0x15, 0x100);
        emit_site(&mut code, 0x10, 0x15, 0x108);
        emit_site(&mut code, 0x20, 0x25, 0x110);
        (code, vec![0x00, 0x10, 0x20])
    }

    #[test]
    fn scans_decrypts_and_merges() {
        let (code, sites) = build_import_fixture(TEST_IMP_CONST);
        let img = ProtectedImage::from_headerless(&code, None).unwrap();
        let imports = recover_imports(&img, TEST_IMP_CONST).unwrap();

        assert_eq!(imports.len(), 3);
        for site in sites {
            assert!(imports.by_site.contains_key(&site), "missing site {:#x}", site);
        }
        let first = &imports.by_site[&0x00];
        assert_eq!(first.dll, "kernel32.dll");
        assert_eq!(first.api, ImportApi::Name("GetProcAddress".to_string()));
        assert!(!first.tail_jmp);
        assert!(imports.by_site[&0x20].tail_jmp);
        assert_eq!(
            imports.by_site[&0x20].api,
            ImportApi::Ordinal(0x300)
        );

        // (DLL, API) pairs are unique after the merge.
        assert_eq!(imports.unique_pairs(), 2);
        assert_eq!(imports.merged["kernel32.dll"].len(), 1);
        assert_eq!(imports.merged["user32.dll"].len(), 1);
    }

    #[test]
    fn corrupt_descriptor_is_reported_not_fatal() {
        let (mut code, _) = build_import_fixture(TEST_IMP_CONST);
        // Point slot0's dll blob at ciphertext that decrypts to
        // non-printable bytes.
        code[0x100..0x104].copy_from_slice(&0x40u32.to_le_bytes());
        let bad = encrypt_import_name(TEST_IMP_CONST, 0x99, "\u{1}\u{2}bad");
        code[0x40..0x40 + bad.len()].copy_from_slice(&bad);
        let img = ProtectedImage::from_headerless(&code, None).unwrap();
        let imports = recover_imports(&img, TEST_IMP_CONST).unwrap();
        assert!(imports.failed.contains(&0x00) || !imports.by_site.contains_key(&0x00));
        // The other sites still recover.
        assert!(imports.by_site.contains_key(&0x10));
        assert!(imports.by_site.contains_key(&0x20));
    }

    #[test]
    fn recovery_is_idempotent() {
        let (code, _) = build_import_fixture(TEST_IMP_CONST);
        let img = ProtectedImage::from_headerless(&code, None).unwrap();
        let a = recover_imports(&img, TEST_IMP_CONST).unwrap();
        let b = recover_imports(&img, TEST_IMP_CONST).unwrap();
        assert_eq!(a, b);
    }
}
