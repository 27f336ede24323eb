//! Protected input model: a protection-mode-tagged, RVA-indexed view of
//! the obfuscated image.
//!
//! All recovery passes address the image by RVA. For PE inputs the raw
//! file is expanded into its memory layout up front (sections copied to
//! their virtual addresses) so that an RVA indexes the buffer directly,
//! the same way the obfuscated code itself addresses it.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Error, ParseError, Result};
use crate::pe::{self, PeFile};

/// How the input was protected. Immutable for the lifetime of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionMode {
    /// A complete PE whose whole `.text` was consumed by the obfuscator.
    Full,
    /// A raw blob with no PE header (shellcode-style payloads).
    Headerless,
    /// A PE where one selected function was protected in place.
    Selective,
}

impl std::str::FromStr for ProtectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(ProtectionMode::Full),
            "headerless" => Ok(ProtectionMode::Headerless),
            "selective" => Ok(ProtectionMode::Selective),
            other => Err(format!("unknown protection mode `{}`", other)),
        }
    }
}

impl std::fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProtectionMode::Full => "full",
            ProtectionMode::Headerless => "headerless",
            ProtectionMode::Selective => "selective",
        };
        f.write_str(s)
    }
}

/// Section layout for headerless inputs. All known headerless payloads
/// consist of exactly a text region followed by a data region.
#[derive(Debug, Clone, Copy)]
pub struct HeaderlessLayout {
    pub text_rva: u64,
    pub data_rva: u64,
    pub data_size: u64,
}

/// One mapped range of the image.
#[derive(Debug, Clone)]
pub struct SectionSpan {
    pub name: String,
    pub rva: u64,
    pub size: u64,
    /// Offset of the section's bytes in the original file.
    pub file_offset: u64,
    pub executable: bool,
}

impl SectionSpan {
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.rva && rva < self.rva + self.size
    }
}

/// A staged byte-level edit. Patches are collected during recovery and
/// applied exactly once when the output image is assembled.
#[derive(Debug, Clone)]
pub struct Patch {
    pub rva: u64,
    pub bytes: Vec<u8>,
}

pub struct ProtectedImage {
    pub mode: ProtectionMode,
    bytes: Vec<u8>,
    sections: Vec<SectionSpan>,
    entry_point: u64,
    image_base: u64,
    /// Parsed header of PE inputs; `None` for headerless blobs.
    pe: Option<PeFile>,
    patches: Vec<Patch>,
}

impl ProtectedImage {
    /// Expand a PE file into its memory layout.
    pub fn from_pe_bytes(data: &[u8], mode: ProtectionMode) -> Result<ProtectedImage> {
        let pe = PeFile::parse(data)?;

        let size_of_image = pe.optional.size_of_image as usize;
        let mut mapped = vec![0u8; size_of_image.max(pe.optional.size_of_headers as usize)];

        let headers = (pe.optional.size_of_headers as usize).min(data.len()).min(mapped.len());
        mapped[..headers].copy_from_slice(&data[..headers]);

        let mut sections = Vec::with_capacity(pe.sections.len());
        for s in &pe.sections {
            let src = s.pointer_to_raw_data as usize;
            let len = (s.size_of_raw_data as usize).min(data.len().saturating_sub(src));
            let dst = s.virtual_address as usize;
            if dst >= mapped.len() {
                return Err(ParseError::Truncated(dst).into());
            }
            let len = len.min(mapped.len() - dst);
            mapped[dst..dst + len].copy_from_slice(&data[src..src + len]);
            sections.push(SectionSpan {
                name: s.name_str().to_string(),
                rva: s.virtual_address as u64,
                size: s.virtual_size.max(s.size_of_raw_data) as u64,
                file_offset: s.pointer_to_raw_data as u64,
                executable: s.is_executable(),
            });
            debug!(
                "mapped section {} at rva {:#x} ({:#x} bytes, exec={})",
                s.name_str(),
                s.virtual_address,
                s.virtual_size,
                s.is_executable()
            );
        }

        Ok(ProtectedImage {
            mode,
            bytes: mapped,
            sections,
            entry_point: pe.optional.entry_point as u64,
            image_base: pe.optional.image_base,
            pe: Some(pe),
            patches: Vec::new(),
        })
    }

    /// Wrap a headerless blob. With no explicit layout the whole blob is
    /// treated as a single executable+writable region starting at RVA 0.
    pub fn from_headerless(blob: &[u8], layout: Option<HeaderlessLayout>) -> Result<ProtectedImage> {
        if blob.is_empty() {
            return Err(ParseError::Truncated(0).into());
        }
        let sections = match layout {
            Some(l) => {
                if l.data_rva + l.data_size != blob.len() as u64 {
                    return Err(ParseError::MissingLayout(
                        "data_rva + data_size must equal the blob length",
                    )
                    .into());
                }
                vec![
                    SectionSpan {
                        name: ".text".to_string(),
                        rva: l.text_rva,
                        size: l.data_rva - l.text_rva,
                        file_offset: l.text_rva,
                        executable: true,
                    },
                    SectionSpan {
                        name: ".data".to_string(),
                        rva: l.data_rva,
                        size: l.data_size,
                        file_offset: l.data_rva,
                        executable: false,
                    },
                ]
            }
            None => vec![SectionSpan {
                name: "(blob)".to_string(),
                rva: 0,
                size: blob.len() as u64,
                file_offset: 0,
                executable: true,
            }],
        };

        Ok(ProtectedImage {
            mode: ProtectionMode::Headerless,
            bytes: blob.to_vec(),
            sections,
            entry_point: 0,
            image_base: 0,
            pe: None,
            patches: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The full RVA-indexed view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn sections(&self) -> &[SectionSpan] {
        &self.sections
    }

    pub fn pe(&self) -> Option<&PeFile> {
        self.pe.as_ref()
    }

    fn span_for(&self, rva: u64) -> Option<&SectionSpan> {
        self.sections.iter().find(|s| s.contains(rva))
    }

    /// `n` bytes starting at `rva`. Fails with `OutOfRange` when the
    /// range leaves the mapped image.
    pub fn bytes_at(&self, rva: u64, n: usize) -> Result<&[u8]> {
        let end = rva
            .checked_add(n as u64)
            .filter(|&e| e <= self.bytes.len() as u64)
            .ok_or(Error::OutOfRange(rva))?;
        if self.span_for(rva).is_none() {
            return Err(Error::OutOfRange(rva));
        }
        Ok(&self.bytes[rva as usize..end as usize])
    }

    pub fn read_u32(&self, rva: u64) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes_at(rva, 4)?))
    }

    pub fn read_u64(&self, rva: u64) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes_at(rva, 8)?))
    }

    pub fn is_executable(&self, rva: u64) -> bool {
        self.span_for(rva).map_or(false, |s| s.executable)
    }

    /// RVA -> offset in the original file.
    pub fn rva_to_offset(&self, rva: u64) -> Result<u64> {
        let span = self.span_for(rva).ok_or(Error::OutOfRange(rva))?;
        Ok(span.file_offset + (rva - span.rva))
    }

    /// Original file offset -> RVA.
    pub fn offset_to_rva(&self, offset: u64) -> Result<u64> {
        self.sections
            .iter()
            .find(|s| offset >= s.file_offset && offset < s.file_offset + s.size)
            .map(|s| s.rva + (offset - s.file_offset))
            .ok_or(Error::OutOfRange(offset))
    }

    /// Stage a byte-level edit. The original buffer is untouched until
    /// the output assembler commits; overlapping an already staged patch
    /// is rejected.
    pub fn patch(&mut self, rva: u64, bytes: Vec<u8>) -> Result<()> {
        if rva + bytes.len() as u64 > self.bytes.len() as u64 {
            return Err(Error::OutOfRange(rva));
        }
        let end = rva + bytes.len() as u64;
        for p in &self.patches {
            let p_end = p.rva + p.bytes.len() as u64;
            if rva < p_end && p.rva < end {
                return Err(Error::Layout(format!(
                    "patch at {:#x} overlaps staged patch at {:#x}",
                    rva, p.rva
                )));
            }
        }
        self.patches.push(Patch { rva, bytes });
        Ok(())
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Apply every staged patch to a copy of a buffer. Used exactly once
    /// by the output assembler.
    pub fn apply_patches(&self, buffer: &mut [u8]) {
        for p in &self.patches {
            let start = p.rva as usize;
            if start + p.bytes.len() <= buffer.len() {
                buffer[start..start + p.bytes.len()].copy_from_slice(&p.bytes);
            }
        }
    }

    /// Executable spans, for signature scans.
    pub fn executable_spans(&self) -> impl Iterator<Item = &SectionSpan> {
        self.sections.iter().filter(|s| s.executable)
    }

    /// The data section span, when the layout names one.
    pub fn data_span(&self) -> Option<&SectionSpan> {
        self.sections
            .iter()
            .find(|s| !s.executable && s.name.starts_with(".data"))
    }

    /// Original import directory descriptor, if the input carries one.
    pub fn import_directory(&self) -> Option<pe::DataDirectory> {
        self.pe
            .as_ref()
            .and_then(|p| p.optional.data_directories.get(pe::DIR_IMPORT))
            .copied()
            .filter(|d| d.virtual_address != 0)
    }

    /// Original base relocation directory, if present.
    pub fn reloc_directory(&self) -> Option<pe::DataDirectory> {
        self.pe
            .as_ref()
            .and_then(|p| p.optional.data_directories.get(pe::DIR_BASERELOC))
            .copied()
            .filter(|d| d.virtual_address != 0)
    }
}
