//! Recursive-descent function discovery.
//!
//! Starting from a root entry (the original entry point, or any address
//! for headerless payloads), each function is lifted by the CFG stepper
//! and every direct call target that is not already a known entry is
//! queued. The worklist is a FIFO seeded from the root, so discovery
//! order (and everything derived from it) is deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::cfg::{recover_cfg_step, FuncState, RecoveredFunc, StepCtx};
use crate::error::Result;

/// The whole-program recovery result, keyed by function entry RVA.
/// Functions are never removed once added; each is frozen as
/// `Complete` or `Unresolved` when its walk finishes.
pub type Cfg = BTreeMap<u64, RecoveredFunc>;

/// Lift every function reachable from `root`.
pub fn recover_recursive(ctx: &StepCtx, root: u64, cancel: &AtomicBool) -> Result<Cfg> {
    let mut cfg = Cfg::new();
    let mut worklist: VecDeque<u64> = VecDeque::new();
    let mut queued: BTreeSet<u64> = BTreeSet::new();
    worklist.push_back(root);
    queued.insert(root);

    while let Some(entry) = worklist.pop_front() {
        if cancel.load(Ordering::Relaxed) {
            debug!("cancellation requested; stopping function discovery");
            break;
        }
        if cfg.contains_key(&entry) {
            continue;
        }
        let func = recover_cfg_step(ctx, entry)?;
        debug!(
            "function {:#x}: {} blocks, {} instrs, {:?}",
            entry,
            func.block_count(),
            func.normalized.len(),
            func.state
        );
        for &target in &func.call_targets {
            if !cfg.contains_key(&target) && queued.insert(target) {
                worklist.push_back(target);
            }
        }
        cfg.insert(entry, func);
    }

    let unresolved = cfg
        .values()
        .filter(|f| f.state == FuncState::Unresolved)
        .count();
    info!(
        "recovered {} functions from root {:#x} ({} unresolved)",
        cfg.len(),
        root,
        unresolved
    );
    Ok(cfg)
}
