//! Output image assembly.
//!
//! Building the deobfuscated output is split into two stages:
//!   1. an output template per protection mode: the original memory
//!      image (FULL/SELECTIVE) or a synthesized header page
//!      (HEADERLESS), in both cases with a fresh `.idata` section holding
//!      the rebuilt import directory appended at the end;
//!   2. laying the normalized instruction streams into the code section
//!      and applying every fixup (import slots, control flow, and
//!      rip-relative data references) against the relocated addresses.
//!
//! All rewritten code is rip-relative, so the base-relocation directory
//! is emptied rather than rebuilt; the image stays relocatable without
//! fixup blocks.

use std::collections::BTreeMap;

use log::{debug, trace, warn};

use crate::cfg::InstrKind;
use crate::error::{Error, Result};
use crate::funcs::Cfg;
use crate::image::{ProtectedImage, ProtectionMode};
use crate::imports::{ImportApi, RecoveredImports};
use crate::pe::{
    self, align_up, page_align_pad, HeaderOffsets, SectionHeader, IMPORT_DESCRIPTOR_SIZE,
    PAGE_SIZE, SCN_DATA, SCN_IDATA, SCN_TEXT,
};
use crate::x86;

/// Rebuilt-IAT slot RVA for each unique (DLL, API) pair.
pub type ImportRvaMap = BTreeMap<(String, ImportApi), u64>;

/// Pads `int3`-terminated protected functions in selective mode.
const END_MARKER: [u8; 14] = [
    0xCC, 0xCC, 0xCC, 0xCC, 0x66, 0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const ORDINAL_FLAG64: u64 = 1u64 << 63;

#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildOptions {
    /// Route untouched (legitimate) import sites through the rebuilt
    /// table. Selective-mode inputs keep a real import table of their
    /// own next to the protected one.
    pub preserve_original_imports: bool,
    /// Start of the protected function for selective-mode inputs.
    pub selective_func_rva: Option<u64>,
}

/// Serialize a PE import directory for the merged import set.
///
/// Layout, in order: descriptors (null-terminated), DLL name table,
/// hint/name table, import lookup table, import address table. Returns
/// the (DLL, API) -> IAT slot map alongside the raw bytes.
pub fn build_import_table(
    merged: &BTreeMap<String, std::collections::BTreeSet<ImportApi>>,
    base_rva: u64,
) -> (ImportRvaMap, Vec<u8>) {
    let dll_count = merged.len();
    let desc_size = (dll_count + 1) * IMPORT_DESCRIPTOR_SIZE;
    let dll_names_size: usize = merged.keys().map(|d| d.len() + 1).sum();
    let api_names_size: usize = merged
        .values()
        .flatten()
        .map(|api| match api {
            ImportApi::Name(n) => n.len() + 3,
            ImportApi::Ordinal(_) => 0,
        })
        .sum();
    let num_apis: usize = merged.values().map(|apis| apis.len()).sum();
    let thunks_size = (num_apis + dll_count) * 8;

    let dll_names_base = desc_size;
    let api_names_base = dll_names_base + dll_names_size;
    let int_base = api_names_base + api_names_size;
    let iat_base = int_base + thunks_size;
    let total = iat_base + thunks_size;

    let mut table = vec![0u8; total];
    let mut rva_map = ImportRvaMap::new();

    let mut dll_offset = 0usize;
    let mut api_offset = 0usize;
    let mut thunk_offset = 0usize;

    for (i, (dll, apis)) in merged.iter().enumerate() {
        let desc = i * IMPORT_DESCRIPTOR_SIZE;
        pe::put_u32(
            &mut table,
            desc,
            (base_rva as usize + int_base + thunk_offset) as u32,
        );
        pe::put_u32(
            &mut table,
            desc + 12,
            (base_rva as usize + dll_names_base + dll_offset) as u32,
        );
        pe::put_u32(
            &mut table,
            desc + 16,
            (base_rva as usize + iat_base + thunk_offset) as u32,
        );

        let name_at = dll_names_base + dll_offset;
        table[name_at..name_at + dll.len()].copy_from_slice(dll.as_bytes());
        dll_offset += dll.len() + 1;

        for api in apis {
            let thunk = match api {
                ImportApi::Name(n) => {
                    let entry = api_names_base + api_offset;
                    // hint stays zero; name follows, NUL-terminated
                    table[entry + 2..entry + 2 + n.len()].copy_from_slice(n.as_bytes());
                    let thunk = base_rva + entry as u64;
                    api_offset += n.len() + 3;
                    thunk
                }
                ImportApi::Ordinal(o) => ORDINAL_FLAG64 | *o as u64,
            };
            pe::put_u64(&mut table, int_base + thunk_offset, thunk);
            pe::put_u64(&mut table, iat_base + thunk_offset, thunk);
            rva_map.insert(
                (dll.clone(), api.clone()),
                base_rva + (iat_base + thunk_offset) as u64,
            );
            thunk_offset += 8;
        }
        // Null thunk terminates both tables for this descriptor.
        thunk_offset += 8;
    }

    (rva_map, table)
}

/// Size of the descriptor array, for the import data directory entry.
fn descriptor_table_size(merged: &BTreeMap<String, std::collections::BTreeSet<ImportApi>>) -> u32 {
    ((merged.len() + 1) * IMPORT_DESCRIPTOR_SIZE) as u32
}

/// Append the serialized import table as a page-aligned `.idata`
/// section. Returns (section rva, section size, rva map).
fn append_idata(
    buf: &mut Vec<u8>,
    merged: &BTreeMap<String, std::collections::BTreeSet<ImportApi>>,
) -> (u64, usize, ImportRvaMap) {
    let idata_rva = buf.len() as u64;
    let (rva_map, table) = build_import_table(merged, idata_rva);
    let pad = page_align_pad(table.len());
    let size = table.len() + pad;
    buf.extend_from_slice(&table);
    buf.extend(std::iter::repeat(0u8).take(pad));
    (idata_rva, size, rva_map)
}

/// HEADERLESS template: synthesized header page, cleared text region,
/// data copied through at its original RVA, `.idata` appended.
fn build_headerless_template(
    image: &ProtectedImage,
    imports: &RecoveredImports,
) -> Result<(Vec<u8>, ImportRvaMap, u64)> {
    let (data_rva, data_size) = match image.data_span() {
        Some(s) => {
            if s.rva < PAGE_SIZE as u64 {
                return Err(Error::Layout(format!(
                    "headerless data section at {:#x} overlaps the header page",
                    s.rva
                )));
            }
            (s.rva as usize, s.size as usize)
        }
        None => (align_up(PAGE_SIZE + image.len(), PAGE_SIZE), 0),
    };

    let total = align_up(PAGE_SIZE + image.len(), PAGE_SIZE);
    let mut buf = vec![0u8; total.max(data_rva + data_size)];
    buf[..PAGE_SIZE].copy_from_slice(&pe::headerless_template());

    if data_size > 0 {
        let src = image.bytes_at(data_rva as u64, data_size)?;
        buf[data_rva..data_rva + data_size].copy_from_slice(src);
    }

    let (idata_rva, idata_size, rva_map) = append_idata(&mut buf, &imports.merged);

    let text_rva = PAGE_SIZE;
    let text_size = data_rva - text_rva;
    let sections = [
        SectionHeader::new(b".text", text_rva as u32, text_size as u32, SCN_TEXT),
        SectionHeader::new(b".data", data_rva as u32, data_size as u32, SCN_DATA),
        SectionHeader::new(b".idata", idata_rva as u32, idata_size as u32, SCN_IDATA),
    ];
    for (i, s) in sections.iter().enumerate() {
        let at = pe::TEMPLATE_SECTION_TABLE + i * pe::SECTION_HEADER_SIZE;
        buf[at..at + pe::SECTION_HEADER_SIZE].copy_from_slice(&s.pack());
    }

    let offs = HeaderOffsets::from_lfanew(pe::TEMPLATE_LFANEW);
    pe::put_u16(&mut buf, offs.number_of_sections, 3);
    pe::put_u32(&mut buf, offs.size_of_code, text_size as u32);
    pe::put_u32(&mut buf, offs.size_of_initialized_data, data_size as u32);
    pe::put_u32(&mut buf, offs.entry_point, PAGE_SIZE as u32);
    let len = buf.len() as u32;
    pe::put_u32(&mut buf, offs.size_of_image, len);
    pe::put_u32(&mut buf, offs.directory(pe::DIR_IMPORT), idata_rva as u32);
    pe::put_u32(
        &mut buf,
        offs.directory(pe::DIR_IMPORT) + 4,
        descriptor_table_size(&imports.merged),
    );

    Ok((buf, rva_map, data_rva as u64))
}

/// FULL/SELECTIVE template: the existing memory image with headers
/// normalized for a file-less layout, `.text` optionally cleared, and
/// `.idata` appended.
fn build_pe_template(
    image: &ProtectedImage,
    imports: &RecoveredImports,
    clear_text: bool,
) -> Result<(Vec<u8>, ImportRvaMap, u64)> {
    let pe_file = image
        .pe()
        .ok_or_else(|| Error::Layout("PE template requested for a headerless input".into()))?;
    let mut buf = image.as_bytes().to_vec();
    buf.resize(align_up(buf.len(), PAGE_SIZE), 0);

    let offs = pe_file.offsets();

    // The output is loaded as-mapped: one page of headers, raw offsets
    // equal to virtual addresses.
    if pe_file.optional.size_of_headers < PAGE_SIZE as u32 {
        let start = pe_file.optional.size_of_headers as usize;
        buf[start..PAGE_SIZE].iter_mut().for_each(|b| *b = 0);
        pe::put_u32(&mut buf, offs.size_of_headers, PAGE_SIZE as u32);
    }
    pe::put_u32(&mut buf, offs.file_alignment, pe_file.optional.section_alignment);

    let table = pe_file.section_table_offset();
    for (i, s) in pe_file.sections.iter().enumerate() {
        let at = table + i * pe::SECTION_HEADER_SIZE;
        buf[at..at + pe::SECTION_HEADER_SIZE].copy_from_slice(&s.pack());
        pe::put_u32(&mut buf, at + 16, s.virtual_size); // SizeOfRawData
        pe::put_u32(&mut buf, at + 20, s.virtual_address); // PointerToRawData
    }

    if clear_text {
        if let Some(text) = pe_file.sections.first() {
            let start = text.virtual_address as usize;
            let end = (start + text.virtual_size as usize).min(buf.len());
            buf[start..end].iter_mut().for_each(|b| *b = 0);
        }
    }

    let (idata_rva, idata_size, rva_map) = append_idata(&mut buf, &imports.merged);

    let new_index = pe_file.sections.len();
    let hdr_at = table + new_index * pe::SECTION_HEADER_SIZE;
    if hdr_at + pe::SECTION_HEADER_SIZE > PAGE_SIZE {
        return Err(Error::Layout(
            "no room in the header page for the import section".into(),
        ));
    }
    let idata =
        SectionHeader::new(b".idata", idata_rva as u32, idata_size as u32, SCN_IDATA);
    buf[hdr_at..hdr_at + pe::SECTION_HEADER_SIZE].copy_from_slice(&idata.pack());

    pe::put_u16(&mut buf, offs.number_of_sections, (new_index + 1) as u16);
    let len = buf.len() as u32;
    pe::put_u32(&mut buf, offs.size_of_image, len);
    if let Some(text) = pe_file.sections.first() {
        pe::put_u32(&mut buf, offs.size_of_code, text.virtual_size);
    }
    if let Some(data) = pe_file.sections.get(1) {
        pe::put_u32(&mut buf, offs.size_of_initialized_data, data.virtual_size);
    }
    pe::put_u32(&mut buf, offs.directory(pe::DIR_IMPORT), idata_rva as u32);
    pe::put_u32(
        &mut buf,
        offs.directory(pe::DIR_IMPORT) + 4,
        descriptor_table_size(&imports.merged),
    );
    // The rewritten code resolves its imports through the new table and
    // is rip-relative throughout.
    pe::put_u32(&mut buf, offs.directory(pe::DIR_IAT), 0);
    pe::put_u32(&mut buf, offs.directory(pe::DIR_IAT) + 4, 0);
    pe::put_u32(&mut buf, offs.directory(pe::DIR_BASERELOC), 0);
    pe::put_u32(&mut buf, offs.directory(pe::DIR_BASERELOC) + 4, 0);

    let text_end = pe_file
        .sections
        .first()
        .map(|s| s.virtual_address as u64 + s.virtual_size as u64)
        .unwrap_or(idata_rva);
    Ok((buf, rva_map, text_end))
}

/// Clear the protected function's in-place body (selective mode): from
/// its entry up to and including the alignment end marker.
fn clear_selective_region(buf: &mut [u8], func_rva: u64) -> Result<u64> {
    let start = func_rva as usize;
    let found = buf[start..]
        .windows(END_MARKER.len())
        .position(|w| w == END_MARKER)
        .ok_or_else(|| {
            Error::Layout(format!(
                "no end marker after the protected function at {:#x}",
                func_rva
            ))
        })?;
    let end = start + found + END_MARKER.len();
    buf[start..end].iter_mut().for_each(|b| *b = 0);
    Ok(end as u64)
}

/// Reloc lookup key: (owning function, original rva, synthetic?).
type RelocKey = (u64, u64, bool);

struct Layout {
    global_relocs: BTreeMap<RelocKey, u64>,
    code_end: u64,
}

/// Write every function's normalized stream into the code region and
/// record the relocated address of each instruction.
fn lay_out_functions(
    buf: &mut [u8],
    cfg: &mut Cfg,
    start_rva: u64,
    code_limit: u64,
) -> Result<Layout> {
    let mut global_relocs = BTreeMap::new();
    let mut curr = start_rva;

    for (&func_ea, rfn) in cfg.iter_mut() {
        rfn.reloc_rva = curr;
        global_relocs.insert((func_ea, func_ea, false), curr);
        for r in rfn.normalized.iter_mut() {
            let size = r.instr.bytes.len() as u64;
            if curr + size > code_limit {
                return Err(Error::Layout(format!(
                    "rewritten code exceeds the code region at {:#x} (limit {:#x})",
                    curr, code_limit
                )));
            }
            global_relocs.insert((func_ea, r.rva(), r.is_boundary_jmp), curr);
            r.reloc_rva = curr;
            buf[curr as usize..(curr + size) as usize].copy_from_slice(&r.instr.bytes);
            curr += size;
        }
        curr = (curr + 8 + 15) & !15;
    }

    Ok(Layout {
        global_relocs,
        code_end: curr,
    })
}

/// Re-encode an instruction at its relocated address and commit it.
fn commit(
    buf: &mut [u8],
    r: &mut crate::cfg::RecoveredInstr,
    inner: iced_x86::Instruction,
    tag: &str,
) -> Result<()> {
    let bytes = x86::encode_at(&inner, r.reloc_rva)?;
    if bytes.len() != r.instr.bytes.len() {
        return Err(Error::Layout(format!(
            "{} fixup changed the size of {:#x} ({} -> {})",
            tag,
            r.rva(),
            r.instr.bytes.len(),
            bytes.len()
        )));
    }
    let at = r.reloc_rva as usize;
    buf[at..at + bytes.len()].copy_from_slice(&bytes);
    r.updated = Some(bytes);
    Ok(())
}

fn apply_fixups(
    buf: &mut [u8],
    image: &ProtectedImage,
    cfg: &mut Cfg,
    imports: &mut RecoveredImports,
    rva_map: &ImportRvaMap,
    layout: &Layout,
) -> Result<()> {
    let is_data_dest = |dest: u64| {
        image
            .sections()
            .iter()
            .any(|s| !s.executable && s.contains(dest))
            || (image.pe().is_some() && dest < PAGE_SIZE as u64)
    };

    for (&func_ea, rfn) in cfg.iter_mut() {
        for r in rfn.normalized.iter_mut() {
            // Imports: retarget the slot read at the rebuilt IAT.
            if r.kind == InstrKind::ImportCall {
                let Some(imp) = imports.by_site.get_mut(&r.rva()) else {
                    warn!("no import entry for site {:#x}", r.rva());
                    continue;
                };
                let key = (imp.dll.clone(), imp.api.clone());
                let Some(&new_rva) = rva_map.get(&key) else {
                    warn!("no rebuilt IAT slot for {}!{}", imp.dll, imp.api);
                    continue;
                };
                imp.new_rva = Some(new_rva);
                let mut inner = r.instr.inner;
                inner.set_memory_displacement64(new_rva);
                commit(buf, r, inner, "import")?;
                trace!("relocated import {}!{} at {:#x}", imp.dll, imp.api, r.reloc_rva);
                continue;
            }

            // Control flow: calls resolve through function entries, jumps
            // within the owning function.
            if r.instr.is_jcc() || r.instr.is_jmp_imm() || r.instr.is_call_imm() {
                let dest = r.instr.inner.near_branch64();
                let key: RelocKey = if r.instr.is_call_imm() {
                    (dest, dest, false)
                } else {
                    (func_ea, dest, false)
                };
                let Some(&reloc_dest) = layout.global_relocs.get(&key) else {
                    warn!(
                        "branch at {:#x} in {:#x} targets unrecovered {:#x}",
                        r.rva(),
                        func_ea,
                        dest
                    );
                    continue;
                };
                let mut inner = r.instr.inner;
                inner.set_near_branch64(reloc_dest);
                commit(buf, r, inner, "ctrlflow")?;
                continue;
            }

            // Data flow: rip-relative references either stay (the data
            // section is not moved) or follow a relocated function.
            if r.instr.inner.is_ip_rel_memory_operand() {
                let dest = r.instr.inner.ip_rel_memory_address();
                let reloc_dest = if is_data_dest(dest) {
                    dest
                } else if let Some(&d) = layout.global_relocs.get(&(dest, dest, false)) {
                    d
                } else {
                    warn!(
                        "rip-relative reference at {:#x} targets unrecovered {:#x}",
                        r.rva(),
                        dest
                    );
                    continue;
                };
                let mut inner = r.instr.inner;
                inner.set_memory_displacement64(reloc_dest);
                commit(buf, r, inner, "dataflow")?;
            }
        }
    }
    Ok(())
}

/// Point untouched import sites at their pair's slot in the rebuilt
/// table. Only meaningful for selective inputs, where unprotected code
/// remains in place.
fn preserve_original_imports(
    buf: &mut [u8],
    imports: &RecoveredImports,
    rva_map: &ImportRvaMap,
    skip: Option<(u64, u64)>,
) {
    for (&site, &slot) in &imports.preserved {
        if let Some((lo, hi)) = skip {
            if site >= lo && site < hi {
                continue;
            }
        }
        let Some(pair) = imports.preserved_pairs.get(&slot) else {
            debug!("preserving import at {:#x}: original slot unparsed", site);
            continue;
        };
        let Some(&new_rva) = rva_map.get(pair) else {
            continue;
        };
        let fixup = (new_rva.wrapping_sub(site + 6)) as u32;
        let at = site as usize + 2;
        if at + 4 <= buf.len() {
            buf[at..at + 4].copy_from_slice(&fixup.to_le_bytes());
        }
    }
}

/// Assemble the final image. Consumes the recovery artifacts by
/// reference, assigning relocated addresses into the CFG and the new
/// IAT slots into the import set as it goes.
pub fn rebuild_output(
    image: &ProtectedImage,
    cfg: &mut Cfg,
    imports: &mut RecoveredImports,
    opts: &RebuildOptions,
) -> Result<(Vec<u8>, ImportRvaMap)> {
    if cfg.is_empty() {
        return Err(Error::Layout("no recovered functions to lay out".into()));
    }

    // Fold preserved (legitimate) pairs into the merged set so they get
    // slots in the rebuilt table too.
    if opts.preserve_original_imports {
        for (dll, api) in imports.preserved_pairs.values() {
            imports
                .merged
                .entry(dll.clone())
                .or_default()
                .insert(api.clone());
        }
    }

    let (mut buf, rva_map, start_rva, code_limit, mut cleared) = match image.mode {
        ProtectionMode::Headerless => {
            let (buf, map, text_end) = build_headerless_template(image, imports)?;
            (buf, map, PAGE_SIZE as u64, text_end, None)
        }
        ProtectionMode::Full => {
            let (buf, map, text_end) = build_pe_template(image, imports, true)?;
            (buf, map, PAGE_SIZE as u64, text_end, None)
        }
        ProtectionMode::Selective => {
            let func_rva = opts.selective_func_rva.ok_or_else(|| {
                Error::Layout("selective mode requires the protected function rva".into())
            })?;
            let (mut buf, map, _) = build_pe_template(image, imports, false)?;
            let end = clear_selective_region(&mut buf, func_rva)?;
            (buf, map, func_rva, end, Some((func_rva, end)))
        }
    };

    // Staged byte patches from earlier passes land exactly once, before
    // the recovered code is written over them.
    image.apply_patches(&mut buf);
    let layout = lay_out_functions(&mut buf, cfg, start_rva, code_limit)?;
    apply_fixups(&mut buf, image, cfg, imports, &rva_map, &layout)?;

    if opts.preserve_original_imports {
        preserve_original_imports(&mut buf, imports, &rva_map, cleared.take());
    }

    // Entry point: the relocated root when we own it, with a trampoline
    // at the original entry when that address survived outside the
    // rewritten span.
    if image.mode != ProtectionMode::Headerless {
        if let Some(pe_file) = image.pe() {
            let offs = pe_file.offsets();
            let oep = image.entry_point();
            match layout.global_relocs.get(&(oep, oep, false)) {
                Some(&reloc) => {
                    if oep >= layout.code_end && (oep as usize + 5) < buf.len() {
                        let tramp = x86::encode_at(&x86::synth_jmp(reloc)?, oep)?;
                        buf[oep as usize..oep as usize + 5].copy_from_slice(&tramp);
                        pe::put_u32(&mut buf, offs.entry_point, oep as u32);
                    } else {
                        pe::put_u32(&mut buf, offs.entry_point, reloc as u32);
                    }
                }
                None => {
                    pe::put_u32(&mut buf, offs.entry_point, start_rva as u32);
                }
            }
        }
    }

    debug!(
        "rebuilt image: {:#x} bytes, code {:#x}..{:#x}, {} IAT slots",
        buf.len(),
        start_rva,
        layout.code_end,
        rva_map.len()
    );
    Ok((buf, rva_map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn merged_fixture() -> BTreeMap<String, BTreeSet<ImportApi>> {
        let mut merged: BTreeMap<String, BTreeSet<ImportApi>> = BTreeMap::new();
        merged.entry("kernel32.dll".into()).or_default().extend([
            ImportApi::Name("GetProcAddress".into()),
            ImportApi::Name("LoadLibraryA".into()),
        ]);
        merged
            .entry("user32.dll".into())
            .or_default()
            .insert(ImportApi::Ordinal(5));
        merged
    }

    fn rd32(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    fn rd64(buf: &[u8], off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(b)
    }

    #[test]
    fn import_table_layout_matches_the_descriptor_format() {
        let merged = merged_fixture();
        let base = 0x5000u64;
        let (rva_map, table) = build_import_table(&merged, base);

        // Two DLLs -> three descriptors including the null terminator.
        let desc_size = 3 * IMPORT_DESCRIPTOR_SIZE;
        assert!(table[desc_size - IMPORT_DESCRIPTOR_SIZE..desc_size]
            .iter()
            .all(|&b| b == 0));

        // Descriptor 0: kernel32.dll.
        let name_rva = rd32(&table, 12) as u64;
        let name_off = (name_rva - base) as usize;
        assert_eq!(&table[name_off..name_off + 12], b"kernel32.dll");

        let oft = rd32(&table, 0) as u64;
        let ft = rd32(&table, 16) as u64;
        assert_ne!(oft, ft);

        // INT and IAT agree entry for entry.
        let int_off = (oft - base) as usize;
        let iat_off = (ft - base) as usize;
        for i in 0..3 {
            assert_eq!(rd64(&table, int_off + i * 8), rd64(&table, iat_off + i * 8));
        }
        // kernel32 thunks: two names then the null terminator.
        let first = rd64(&table, int_off);
        let hint_name = (first - base) as usize;
        assert_eq!(&table[hint_name..hint_name + 2], &[0, 0]);
        assert_eq!(
            &table[hint_name + 2..hint_name + 2 + 14],
            b"GetProcAddress"
        );
        assert_eq!(rd64(&table, int_off + 16), 0);

        // user32 descriptor carries the ordinal thunk.
        let oft2 = rd32(&table, IMPORT_DESCRIPTOR_SIZE) as u64;
        let thunk = rd64(&table, (oft2 - base) as usize);
        assert_eq!(thunk, ORDINAL_FLAG64 | 5);

        // Every unique pair got exactly one IAT slot, inside the table.
        assert_eq!(rva_map.len(), 3);
        for &slot in rva_map.values() {
            assert!(slot >= base && slot < base + table.len() as u64);
        }
        let gpa = rva_map[&("kernel32.dll".to_string(), ImportApi::Name("GetProcAddress".into()))];
        assert_eq!(rd64(&table, (gpa - base) as usize), first);
    }

    #[test]
    fn import_table_is_deterministic() {
        let merged = merged_fixture();
        let a = build_import_table(&merged, 0x3000);
        let b = build_import_table(&merged, 0x3000);
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn selective_clear_stops_at_the_end_marker() {
        let mut buf = vec![0x41u8; 0x100];
        buf[0x80..0x8E].copy_from_slice(&END_MARKER);
        let end = clear_selective_region(&mut buf, 0x20).unwrap();
        assert_eq!(end, 0x8E);
        assert!(buf[0x20..0x8E].iter().all(|&b| b == 0));
        assert_eq!(buf[0x1F], 0x41);
        assert_eq!(buf[0x8E], 0x41);

        let mut no_marker = vec![0x41u8; 0x40];
        assert!(clear_selective_region(&mut no_marker, 0).is_err());
    }
}
