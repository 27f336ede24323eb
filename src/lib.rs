//! Static deobfuscator for ScatterBrain-protected x86-64 PE images.
//!
//! Recovery is a linear pipeline over one [`ProtectedInput`]: resolve
//! the instruction dispatchers, recover the protected imports, lift the
//! functions reachable from a root, then rebuild a runnable PE.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

/// Control-flow recovery: the rule-driven stepper and block graphs.
pub mod cfg;
/// Dispatcher discovery and emulation-backed resolution.
pub mod dispatch;
/// CPU emulator wrapper.
pub mod emu;
/// Errors.
pub mod error;
/// Recursive-descent function recovery.
pub mod funcs;
/// The protected input model.
pub mod image;
/// Protected import recovery and name decryption.
pub mod imports;
/// Minimal PE parsing and header serialization.
pub mod pe;
/// Output image assembly.
pub mod rebuild;
/// x86-64 decode/encode helpers.
pub mod x86;

pub use cfg::MutationRuleSet;
pub use error::{Error, Result};
pub use image::{HeaderlessLayout, ProtectionMode};

/// One protected image and everything recovered from it.
pub struct ProtectedInput {
    pub image: image::ProtectedImage,
    /// Per-sample 32-bit constant of the import name cipher.
    pub imp_decrypt_const: u32,
    pub rule_set: MutationRuleSet,
    pub dispatcher_locs: dispatch::DispatcherTable,
    pub imports: imports::RecoveredImports,
    pub cfg: funcs::Cfg,
    pub new_image_buffer: Option<Vec<u8>>,
    pub import_to_rva_map: rebuild::ImportRvaMap,
    pub rebuild_opts: rebuild::RebuildOptions,
    cancel: Arc<AtomicBool>,
}

impl ProtectedInput {
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        mode: ProtectionMode,
        imp_decrypt_const: u32,
        rule_set: MutationRuleSet,
    ) -> Result<ProtectedInput> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, mode, imp_decrypt_const, rule_set)
    }

    /// Parse a protected input from memory.
    pub fn from_bytes(
        data: &[u8],
        mode: ProtectionMode,
        imp_decrypt_const: u32,
        rule_set: MutationRuleSet,
    ) -> Result<ProtectedInput> {
        let image = match mode {
            ProtectionMode::Headerless => image::ProtectedImage::from_headerless(data, None)?,
            _ => image::ProtectedImage::from_pe_bytes(data, mode)?,
        };
        Ok(Self::with_image(image, imp_decrypt_const, rule_set))
    }

    pub fn from_headerless_bytes(
        data: &[u8],
        layout: Option<HeaderlessLayout>,
        imp_decrypt_const: u32,
        rule_set: MutationRuleSet,
    ) -> Result<ProtectedInput> {
        let image = image::ProtectedImage::from_headerless(data, layout)?;
        Ok(Self::with_image(image, imp_decrypt_const, rule_set))
    }

    fn with_image(
        image: image::ProtectedImage,
        imp_decrypt_const: u32,
        rule_set: MutationRuleSet,
    ) -> ProtectedInput {
        ProtectedInput {
            image,
            imp_decrypt_const,
            rule_set,
            dispatcher_locs: dispatch::DispatcherTable::default(),
            imports: imports::RecoveredImports::default(),
            cfg: funcs::Cfg::new(),
            new_image_buffer: None,
            import_to_rva_map: rebuild::ImportRvaMap::new(),
            rebuild_opts: rebuild::RebuildOptions::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag for best-effort cancellation between passes.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Layout("recovery cancelled".into()))
        } else {
            Ok(())
        }
    }
}

/// Scan and resolve every dispatcher into `input.dispatcher_locs`.
pub fn recover_instruction_dispatchers(input: &mut ProtectedInput) -> Result<()> {
    input.check_cancelled()?;
    input.dispatcher_locs = dispatch::recover_dispatchers(&input.image, &input.cancel)?;
    info!(
        "dispatchers: {} resolved, {} unresolved",
        input.dispatcher_locs.len(),
        input.dispatcher_locs.unresolved.len()
    );
    Ok(())
}

/// Recover and merge the protected imports into `input.imports`.
pub fn recover_imports_merge(input: &mut ProtectedInput) -> Result<()> {
    input.check_cancelled()?;
    input.imports = imports::recover_imports(&input.image, input.imp_decrypt_const)?;
    info!(
        "imports: {} sites, {} unique pairs",
        input.imports.len(),
        input.imports.unique_pairs()
    );
    Ok(())
}

/// Recover every function reachable from `root_rva` and return the CFG.
pub fn recover_recursive_in_full(input: &mut ProtectedInput, root_rva: u64) -> Result<funcs::Cfg> {
    input.check_cancelled()?;
    let import_sites = input.imports.sites();
    let ctx = cfg::StepCtx::new(
        &input.image,
        &input.dispatcher_locs,
        &import_sites,
        input.rule_set,
    );
    let mut recovered = funcs::recover_recursive(&ctx, root_rva, &input.cancel)?;
    if let Some(root) = recovered.get_mut(&root_rva) {
        root.name = Some("start".to_string());
    }
    Ok(recovered)
}

/// Assemble the output image into `input.new_image_buffer`.
pub fn rebuild_output(input: &mut ProtectedInput) -> Result<()> {
    input.check_cancelled()?;
    let opts = input.rebuild_opts;
    let (buf, rva_map) =
        rebuild::rebuild_output(&input.image, &mut input.cfg, &mut input.imports, &opts)?;
    info!("rebuilt output image: {:#x} bytes", buf.len());
    input.new_image_buffer = Some(buf);
    input.import_to_rva_map = rva_map;
    Ok(())
}

/// Write the rebuilt image to disk.
pub fn dump_new_image_buffer_to_disk<P: AsRef<Path>>(
    input: &ProtectedInput,
    path: P,
) -> Result<()> {
    let buf = input
        .new_image_buffer
        .as_ref()
        .ok_or_else(|| Error::Layout("no output buffer; run rebuild_output first".into()))?;
    std::fs::write(&path, buf)?;
    info!(
        "wrote {:#x} bytes to {}",
        buf.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Convenience driver: the full pipeline in pass order.
pub fn run_full_recovery(input: &mut ProtectedInput, root_rva: u64) -> Result<()> {
    recover_instruction_dispatchers(input)?;
    recover_imports_merge(input)?;
    input.cfg = recover_recursive_in_full(input, root_rva)?;
    rebuild_output(input)
}
