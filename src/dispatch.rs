//! Instruction-dispatcher recovery.
//!
//! The obfuscator hides every rewritten control-flow edge behind a small
//! stub that computes its successor at runtime. Emulation is the oracle:
//! point the emulator at each prologue hit and run until control leaves
//! the stub. Probing with the carry flag clear and then set recovers
//! both edges of conditional variants.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::unbounded;
use log::{debug, trace, warn};
use rayon::prelude::*;

use crate::emu::{Emu, RunOutcome, RETURN_SENTINEL, RFLAGS_BASE, RFLAGS_CARRY};
use crate::error::Result;
use crate::image::ProtectedImage;

/// Every dispatcher body opens with `pushfq; push rax; push rcx`.
pub const DISPATCHER_PROLOGUE: [u8; 3] = [0x9C, 0x50, 0x51];

/// Heuristic upper bound on a dispatcher body.
pub const DISPATCHER_REGION_MAX: u64 = 0x100;

/// Hard cap on emulated steps per probe.
pub const DISPATCH_STEP_BUDGET: usize = 0x1000;

/// The recovered behavior of one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDispatch {
    Direct { target: u64 },
    /// `taken` when CF is set, `not_taken` otherwise.
    Conditional { taken: u64, not_taken: u64 },
    /// The stub returns through the caller's slot (a protected `ret`).
    ReturnShaped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherRecord {
    pub site: u64,
    pub dispatch: ResolvedDispatch,
}

impl DispatcherRecord {
    pub fn targets(&self) -> Vec<u64> {
        match self.dispatch {
            ResolvedDispatch::Direct { target } => vec![target],
            ResolvedDispatch::Conditional { taken, not_taken } => vec![taken, not_taken],
            ResolvedDispatch::ReturnShaped => vec![],
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherTable {
    pub records: BTreeMap<u64, DispatcherRecord>,
    pub unresolved: BTreeSet<u64>,
}

impl DispatcherTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, site: u64) -> Option<&DispatcherRecord> {
        self.records.get(&site)
    }

    pub fn is_unresolved(&self, site: u64) -> bool {
        self.unresolved.contains(&site)
    }

    pub fn sites(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }
}

pub fn scan_dispatcher_sites(image: &ProtectedImage) -> Vec<u64> {
    let mut sites = Vec::new();
    for span in image.executable_spans() {
        let bytes = match image.bytes_at(span.rva, span.size as usize) {
            Ok(b) => b,
            Err(_) => continue,
        };
        for (i, w) in bytes.windows(DISPATCHER_PROLOGUE.len()).enumerate() {
            if w == DISPATCHER_PROLOGUE {
                sites.push(span.rva + i as u64);
            }
        }
    }
    debug!("dispatcher scan found {} candidate sites", sites.len());
    sites
}

pub fn looks_like_dispatcher(image: &ProtectedImage, rva: u64) -> bool {
    image
        .bytes_at(rva, DISPATCHER_PROLOGUE.len())
        .map_or(false, |b| b == DISPATCHER_PROLOGUE)
}

enum Probe {
    Target(u64),
    Returned,
    Unresolved(&'static str),
}

fn probe_site(emu: &mut Emu, image: &ProtectedImage, site: u64, rflags: u64) -> Probe {
    if emu.reset(rflags).is_err() {
        return Probe::Unresolved("emulator reset failed");
    }
    let base = emu.image_base();
    let lo = base + site;
    let hi = lo + DISPATCHER_REGION_MAX;
    let outcome = emu.run_until(lo, |rip| !(lo..hi).contains(&rip), DISPATCH_STEP_BUDGET);
    match outcome {
        RunOutcome::Stop { rip, steps } => {
            trace!("site {:#x} left the region at {:#x} after {} steps", site, rip, steps);
            if rip == RETURN_SENTINEL {
                Probe::Returned
            } else if rip >= base && rip < base + image.len() as u64 {
                Probe::Target(rip - base)
            } else {
                Probe::Unresolved("control left the image")
            }
        }
        RunOutcome::Halted { .. } => Probe::Unresolved("halted inside the dispatcher"),
        RunOutcome::StepBudget { .. } => Probe::Unresolved("step budget exceeded"),
        RunOutcome::Fault { .. } => Probe::Unresolved("faulted during emulation"),
    }
}

fn resolve_site(
    emu: &mut Emu,
    image: &ProtectedImage,
    site: u64,
) -> std::result::Result<ResolvedDispatch, &'static str> {
    let clear = probe_site(emu, image, site, RFLAGS_BASE);
    let carry = probe_site(emu, image, site, RFLAGS_CARRY);

    let check = |target: u64| -> std::result::Result<u64, &'static str> {
        if target == site {
            Err("dispatcher resolved to itself")
        } else if !image.is_executable(target) {
            Err("target is not executable")
        } else {
            Ok(target)
        }
    };

    match (clear, carry) {
        (Probe::Returned, Probe::Returned) => Ok(ResolvedDispatch::ReturnShaped),
        (Probe::Target(a), Probe::Target(b)) if a == b => {
            Ok(ResolvedDispatch::Direct { target: check(a)? })
        }
        (Probe::Target(a), Probe::Target(b)) => Ok(ResolvedDispatch::Conditional {
            taken: check(b)?,
            not_taken: check(a)?,
        }),
        (Probe::Unresolved(why), _) | (_, Probe::Unresolved(why)) => Err(why),
        _ => Err("probes disagreed on dispatcher shape"),
    }
}

/// Recover every dispatcher in the image. Sites are independent and fan
/// out across workers, one emulator each; results fold into
/// address-keyed maps so the outcome does not depend on scheduling.
pub fn recover_dispatchers(image: &ProtectedImage, cancel: &AtomicBool) -> Result<DispatcherTable> {
    // Validate the emulator backend once up front.
    let mut preflight = Emu::new()?;
    preflight.map_image(image)?;
    drop(preflight);

    let sites = scan_dispatcher_sites(image);
    let (tx, rx) = unbounded();

    sites.par_iter().for_each_init(
        || {
            let mut emu = Emu::new().ok()?;
            emu.map_image(image).ok()?;
            Some(emu)
        },
        |emu, &site| {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            let res = match emu.as_mut() {
                Some(emu) => resolve_site(emu, image, site),
                None => Err("worker emulator unavailable"),
            };
            tx.send((site, res)).expect("dispatcher result channel closed");
        },
    );
    drop(tx);

    let mut table = DispatcherTable::default();
    for (site, res) in rx {
        match res {
            Ok(dispatch) => {
                table.records.insert(site, DispatcherRecord { site, dispatch });
            }
            Err(why) => {
                warn!("dispatcher at {:#x} unresolved: {}", site, why);
                table.unresolved.insert(site);
            }
        }
    }
    debug!(
        "resolved {} dispatchers ({} unresolved)",
        table.records.len(),
        table.unresolved.len()
    );
    Ok(table)
}
