//! Rule-driven CFG recovery.
//!
//! The stepper walks one instruction at a time from a function entry,
//! consuming obfuscator garbage through an ordered list of mutation
//! rules and emitting the surviving instructions. Consumed control flow
//! is remembered in a per-function *backbone* map (obfuscated address →
//! where it really leads) so that fall-throughs and branch targets can
//! later be walked to their final destinations.
//!
//! Recovery runs in three phases:
//!   1. raw stepping (DFS over the obfuscated bytes),
//!   2. normalization into a linear flow: backbone links collapsed,
//!      synthetic `jmp`s inserted where the linear order breaks
//!      fall-through, branch targets rewritten,
//!   3. partitioning the linear flow into basic blocks with a petgraph
//!      edge graph.

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use log::{trace, warn};
use petgraph::graph::{Graph, NodeIndex};

use crate::dispatch::{looks_like_dispatcher, DispatcherTable, ResolvedDispatch};
use crate::error::Result;
use crate::image::ProtectedImage;
use crate::x86::{self, Instr};

/// Per-function step cap; a safety net against pathological inputs.
pub const MAX_FUNC_STEPS: usize = 30_000;

/// Bound on backbone walks; a longer chain means a cycle slipped in.
const MAX_BACKBONE_WALK: usize = 0x10_000;

/// Synthetic instructions have no original address. They are keyed from
/// this range so they can never collide with an image RVA.
const SYNTHETIC_BASE: u64 = 0xFFFF_FFFF_0000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Recovery stopped inside this block (unresolved dispatcher,
        /// decode failure, or budget).
        const UNRESOLVED = 0b0000_0001;
        /// This block is the function entry.
        const ENTRY = 0b0000_0010;
    }
}

/// Edge weights in a function's block graph.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum EdgeWeight {
    /// Linear fall-through (including the not-taken side of a jcc).
    Flow,
    /// A taken branch.
    Jump,
}

impl std::fmt::Display for EdgeWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Classification assigned to each stepped instruction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    Normal,
    /// Obfuscator filler with no effect on machine state.
    Garbage,
    /// A call/jmp into a dispatcher stub.
    DispatcherCall,
    /// A flag-forcing sequence whose conditional branch is decidable.
    OpaquePredicate,
    /// An unconditional jump emitted raw (rollback path).
    JunkJump,
    /// A protected import call site.
    ImportCall,
}

/// One recovered instruction of the cleaned stream.
#[derive(Debug, Clone)]
pub struct RecoveredInstr {
    pub instr: Instr,
    pub kind: InstrKind,
    /// Inserted during normalization; has no original address.
    pub is_boundary_jmp: bool,
    /// Address assigned by the output assembler; zero until layout.
    pub reloc_rva: u64,
    /// Rewritten machine bytes, produced by the fixup passes.
    pub updated: Option<Vec<u8>>,
}

impl RecoveredInstr {
    fn new(instr: Instr, kind: InstrKind) -> RecoveredInstr {
        RecoveredInstr {
            instr,
            kind,
            is_boundary_jmp: false,
            reloc_rva: 0,
            updated: None,
        }
    }

    pub fn rva(&self) -> u64 {
        self.instr.rva()
    }
}

/// How a basic block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    FallThrough,
    Jump,
    CondJump,
    Return,
    Indirect,
}

/// A run of instructions with a single control-flow-affecting tail.
/// Instruction storage is an index range into the owning function's
/// normalized flow; blocks reference each other by RVA.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u64,
    pub range: (usize, usize),
    pub terminator: Terminator,
    pub succs: Vec<u64>,
    pub flags: BlockFlags,
}

/// Recovery lifecycle of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
    Pending,
    Walking,
    Complete,
    Unresolved,
}

/// A recovered function: the raw and normalized instruction streams plus
/// the derived block graph.
#[derive(Debug)]
pub struct RecoveredFunc {
    pub entry: u64,
    /// Optional display name (e.g. `start` for the root).
    pub name: Option<String>,
    /// Where the entry really starts once the leading backbone is walked.
    pub real_entry: u64,
    pub recovered: Vec<RecoveredInstr>,
    /// Linear flow the output assembler writes; includes boundary jmps.
    pub normalized: Vec<RecoveredInstr>,
    pub backbone: BTreeMap<u64, u64>,
    pub blocks: BTreeMap<u64, BasicBlock>,
    pub graph: Graph<u64, EdgeWeight>,
    pub node_of: BTreeMap<u64, NodeIndex>,
    pub state: FuncState,
    /// Direct call targets discovered while walking, in discovery order.
    pub call_targets: Vec<u64>,
    /// RVAs of protected import call sites within this function.
    pub import_sites: Vec<u64>,
    /// Consumed garbage windows, kept for diagnostics.
    pub garbage: Vec<(u64, InstrKind)>,
    /// Relocated start of the function; assigned by the assembler.
    pub reloc_rva: u64,
}

impl RecoveredFunc {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// A named, totally ordered mutation rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationRuleSet {
    /// The full SHADOWPAD garbage grammar.
    RuleSet1,
    /// Variant grammar without the flag-forcing predicate family.
    RuleSet2,
}

impl std::str::FromStr for MutationRuleSet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rule_set_1" | "ruleset1" | "1" => Ok(MutationRuleSet::RuleSet1),
            "rule_set_2" | "ruleset2" | "2" => Ok(MutationRuleSet::RuleSet2),
            other => Err(format!("unknown mutation rule set `{}`", other)),
        }
    }
}

/// One pattern+rewrite family. Evaluated in list order; the first match
/// fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationRule {
    /// A branch into a dispatcher stub; rewritten from the resolved
    /// record. Listed first: it is the only pattern whose
    /// misclassification loses control-flow information.
    DispatcherBranch,
    /// A protected import call site.
    ImportStub,
    /// An unconditional `jmp imm` (the obfuscator's scatter links).
    BackboneJmp,
    /// `stc`/`clc`/`xor r,r` followed by a conditional branch the forced
    /// flags decide.
    OpaquePredicate,
    /// State-preserving filler: nop family, `mov r,r`, `lea r,[r]`,
    /// `push r; pop r`.
    JunkWindow,
}

const RULE_SET_1: &[MutationRule] = &[
    MutationRule::DispatcherBranch,
    MutationRule::ImportStub,
    MutationRule::BackboneJmp,
    MutationRule::OpaquePredicate,
    MutationRule::JunkWindow,
];

const RULE_SET_2: &[MutationRule] = &[
    MutationRule::DispatcherBranch,
    MutationRule::ImportStub,
    MutationRule::BackboneJmp,
    MutationRule::JunkWindow,
];

pub fn rules_for(set: MutationRuleSet) -> &'static [MutationRule] {
    match set {
        MutationRuleSet::RuleSet1 => RULE_SET_1,
        MutationRuleSet::RuleSet2 => RULE_SET_2,
    }
}

/// Everything the stepper consults while walking one function.
pub struct StepCtx<'a> {
    pub image: &'a ProtectedImage,
    pub dispatchers: &'a DispatcherTable,
    /// Call sites of protected imports, discovered by import recovery.
    pub import_sites: &'a BTreeSet<u64>,
    pub rules: &'static [MutationRule],
    pub max_steps: usize,
}

impl<'a> StepCtx<'a> {
    pub fn new(
        image: &'a ProtectedImage,
        dispatchers: &'a DispatcherTable,
        import_sites: &'a BTreeSet<u64>,
        rule_set: MutationRuleSet,
    ) -> StepCtx<'a> {
        StepCtx {
            image,
            dispatchers,
            import_sites,
            rules: rules_for(rule_set),
            max_steps: MAX_FUNC_STEPS,
        }
    }
}

struct StepState {
    entry: u64,
    to_explore: Vec<u64>,
    visited: BTreeSet<u64>,
    recovered: Vec<RecoveredInstr>,
    backbone: BTreeMap<u64, u64>,
    garbage: Vec<(u64, InstrKind)>,
    import_sites: Vec<u64>,
    steps: usize,
    unresolved: bool,
    /// One-shot rule bypass for the rollback policy.
    rules_disabled_at: Option<u64>,
}

impl StepState {
    fn new(entry: u64) -> StepState {
        StepState {
            entry,
            to_explore: vec![entry],
            visited: BTreeSet::new(),
            recovered: Vec::new(),
            backbone: BTreeMap::new(),
            garbage: Vec::new(),
            import_sites: Vec::new(),
            steps: 0,
            unresolved: false,
            rules_disabled_at: None,
        }
    }

    fn emit(&mut self, instr: Instr, kind: InstrKind) {
        self.recovered.push(RecoveredInstr::new(instr, kind));
    }

    fn consume(&mut self, from: u64, to: u64, kind: InstrKind) {
        self.backbone.insert(from, to);
        self.garbage.push((from, kind));
        self.to_explore.push(to);
    }
}

enum RuleAction {
    /// A rule fired and fully handled the window.
    Consumed,
    /// A rule fired but its rewrite would loop; re-step this address
    /// once with rules disabled.
    Retry,
    /// The window referenced an unresolvable dispatcher.
    Unresolved,
    NoMatch,
}

/// Would linking `from -> to` close a backbone cycle?
fn would_cycle(backbone: &BTreeMap<u64, u64>, from: u64, to: u64) -> bool {
    if from == to {
        return true;
    }
    let mut cur = to;
    for _ in 0..MAX_BACKBONE_WALK {
        match backbone.get(&cur) {
            Some(&next) => {
                if next == from {
                    return true;
                }
                cur = next;
            }
            None => return false,
        }
    }
    true
}

/// Build the conditional branch that replaces a conditional dispatcher:
/// a `jb` to the taken edge occupying the call site.
fn dispatch_jb(site: u64, site_len: usize, taken: u64) -> Result<Instr> {
    let mut inner = x86::synth_jb(taken)?;
    inner.set_ip(site);
    inner.set_len(site_len);
    let bytes = x86::encode_at(&inner, 0)?;
    Ok(Instr { inner, bytes })
}

/// Build the `ret` that replaces a return-shaped dispatcher call.
fn dispatch_ret(site: u64, site_len: usize) -> Instr {
    let mut inner = x86::synth_ret();
    inner.set_ip(site);
    inner.set_len(site_len);
    Instr {
        inner,
        bytes: vec![0xC3],
    }
}

fn apply_rules(ctx: &StepCtx, s: &mut StepState, instr: &Instr) -> Result<RuleAction> {
    let cur = instr.rva();
    for rule in ctx.rules {
        match rule {
            MutationRule::DispatcherBranch => {
                if !(instr.is_call_imm() || instr.is_jmp_imm()) {
                    continue;
                }
                let site = instr.branch_target().unwrap();
                if let Some(rec) = ctx.dispatchers.get(site) {
                    match rec.dispatch {
                        ResolvedDispatch::Direct { target } => {
                            if would_cycle(&s.backbone, cur, target) {
                                return Ok(RuleAction::Retry);
                            }
                            trace!("dispatcher link {:#x} -> {:#x}", cur, target);
                            s.consume(cur, target, InstrKind::DispatcherCall);
                            return Ok(RuleAction::Consumed);
                        }
                        ResolvedDispatch::Conditional { taken, not_taken } => {
                            let jb = dispatch_jb(cur, instr.len(), taken)?;
                            // The bytes after the call site are dead; the
                            // not-taken edge is where fall-through leads.
                            s.backbone.insert(instr.next_rva(), not_taken);
                            s.emit(jb, InstrKind::DispatcherCall);
                            s.to_explore.push(taken);
                            s.to_explore.push(not_taken);
                            return Ok(RuleAction::Consumed);
                        }
                        ResolvedDispatch::ReturnShaped => {
                            s.emit(dispatch_ret(cur, instr.len()), InstrKind::DispatcherCall);
                            return Ok(RuleAction::Consumed);
                        }
                    }
                }
                if ctx.dispatchers.is_unresolved(site)
                    || (instr.is_call_imm() && looks_like_dispatcher(ctx.image, site))
                {
                    // Keep the raw call so the caller stays visible, but
                    // stop this path: its successor is unknown.
                    warn!("unresolved dispatcher call at {:#x} -> {:#x}", cur, site);
                    s.emit(instr.clone(), InstrKind::DispatcherCall);
                    return Ok(RuleAction::Unresolved);
                }
            }
            MutationRule::ImportStub => {
                if !ctx.import_sites.contains(&cur) {
                    continue;
                }
                s.import_sites.push(cur);
                s.emit(instr.clone(), InstrKind::ImportCall);
                if instr.is_rip_rel_call() {
                    s.to_explore.push(instr.next_rva());
                }
                // A tail-jmp import is a function boundary.
                return Ok(RuleAction::Consumed);
            }
            MutationRule::BackboneJmp => {
                if !instr.is_jmp_imm() {
                    continue;
                }
                let target = instr.branch_target().unwrap();
                if would_cycle(&s.backbone, cur, target) {
                    return Ok(RuleAction::Retry);
                }
                s.consume(cur, target, InstrKind::Garbage);
                return Ok(RuleAction::Consumed);
            }
            MutationRule::OpaquePredicate => {
                let forced = if instr.is_stc() {
                    Some((true, false)) // (cf, zf)
                } else if instr.is_clc() {
                    Some((false, false))
                } else if instr.is_xor_same_reg() {
                    Some((false, true))
                } else {
                    None
                };
                let Some((cf, zf)) = forced else { continue };
                let Ok(jcc) = x86::decode_at(ctx.image, instr.next_rva()) else {
                    continue;
                };
                if !jcc.is_jcc() {
                    continue;
                }
                use iced_x86::ConditionCode;
                let taken = match jcc.condition_code() {
                    ConditionCode::b => Some(cf),
                    ConditionCode::ae => Some(!cf),
                    ConditionCode::e => Some(zf),
                    ConditionCode::ne => Some(!zf),
                    _ => None,
                };
                let Some(taken) = taken else { continue };
                let Some(target) = jcc.branch_target() else {
                    continue;
                };
                let dest = if taken { target } else { jcc.next_rva() };
                if would_cycle(&s.backbone, cur, dest) {
                    return Ok(RuleAction::Retry);
                }
                trace!(
                    "opaque predicate at {:#x}: always {}",
                    cur,
                    if taken { "taken" } else { "not taken" }
                );
                s.visited.insert(jcc.rva());
                s.consume(cur, dest, InstrKind::OpaquePredicate);
                return Ok(RuleAction::Consumed);
            }
            MutationRule::JunkWindow => {
                if instr.is_nop() || instr.is_same_reg_move() || instr.is_identity_lea() {
                    s.consume(cur, instr.next_rva(), InstrKind::Garbage);
                    return Ok(RuleAction::Consumed);
                }
                if let Some(reg) = instr.is_push_reg() {
                    if let Ok(next) = x86::decode_at(ctx.image, instr.next_rva()) {
                        if next.is_pop_reg() == Some(reg) {
                            s.visited.insert(next.rva());
                            s.consume(cur, next.next_rva(), InstrKind::Garbage);
                            return Ok(RuleAction::Consumed);
                        }
                    }
                }
            }
        }
    }
    Ok(RuleAction::NoMatch)
}

/// One stepper iteration. Returns false when the worklist is exhausted
/// or the budget forces a stop.
fn step(ctx: &StepCtx, s: &mut StepState) -> Result<bool> {
    let Some(cur) = s.to_explore.pop() else {
        return Ok(false);
    };
    if s.visited.contains(&cur) {
        return Ok(true);
    }
    s.steps += 1;
    if s.steps > ctx.max_steps {
        warn!("function {:#x} exceeded the step budget", s.entry);
        s.unresolved = true;
        return Ok(false);
    }
    s.visited.insert(cur);

    let instr = match x86::decode_at(ctx.image, cur) {
        Ok(i) => i,
        Err(_) => {
            // A path that runs into undecodable bytes ends its block
            // with an indirect terminator and is reported, not raised.
            warn!("decode failed at {:#x} in function {:#x}", cur, s.entry);
            s.unresolved = true;
            return Ok(true);
        }
    };
    trace!("[step] {}", instr);

    if s.rules_disabled_at == Some(cur) {
        s.rules_disabled_at = None;
    } else {
        match apply_rules(ctx, s, &instr)? {
            RuleAction::Consumed => return Ok(true),
            RuleAction::Retry => {
                s.visited.remove(&cur);
                s.to_explore.push(cur);
                s.rules_disabled_at = Some(cur);
                return Ok(true);
            }
            RuleAction::Unresolved => {
                s.unresolved = true;
                return Ok(true);
            }
            RuleAction::NoMatch => {}
        }
    }

    if instr.is_jcc() {
        if let Some(target) = instr.branch_target() {
            s.to_explore.push(target);
        }
        let fall = instr.next_rva();
        s.emit(instr, InstrKind::Normal);
        s.to_explore.push(fall);
    } else if instr.is_ret() || instr.is_int3() {
        s.emit(instr, InstrKind::Normal);
    } else if instr.is_jmp() {
        // Only indirect jumps reach here (immediates are backbone), plus
        // the rollback path for cyclic links.
        let kind = if instr.is_jmp_imm() {
            if let Some(t) = instr.branch_target() {
                s.to_explore.push(t);
            }
            InstrKind::JunkJump
        } else {
            InstrKind::Normal
        };
        s.emit(instr, kind);
    } else {
        let fall = instr.next_rva();
        s.emit(instr, InstrKind::Normal);
        s.to_explore.push(fall);
    }
    Ok(true)
}

/// Walk `rva` through consumed control flow (backbone links and direct
/// dispatcher edges) to its final destination.
fn walk_backbone(
    backbone: &BTreeMap<u64, u64>,
    dispatchers: &DispatcherTable,
    rva: u64,
) -> Option<u64> {
    let mut cur = rva;
    for _ in 0..MAX_BACKBONE_WALK {
        if let Some(&next) = backbone.get(&cur) {
            cur = next;
            continue;
        }
        if let Some(rec) = dispatchers.get(cur) {
            if let ResolvedDispatch::Direct { target } = rec.dispatch {
                cur = target;
                continue;
            }
        }
        return Some(cur);
    }
    None
}

fn is_boundary(r: &RecoveredInstr) -> bool {
    r.instr.is_ret() || r.instr.is_jmp() || r.instr.is_int3()
}

/// Phase 2: linearize the raw recovery, collapsing the backbone and
/// inserting boundary jmps where the linear order breaks fall-through.
fn normalize(ctx: &StepCtx, s: &StepState) -> Result<(Vec<RecoveredInstr>, bool)> {
    let mut normalized: Vec<RecoveredInstr> = Vec::with_capacity(s.recovered.len());
    let mut linearized = BTreeSet::new();
    let mut unresolved = s.unresolved;

    let index_of: BTreeMap<u64, usize> = s
        .recovered
        .iter()
        .enumerate()
        .map(|(i, r)| (r.rva(), i))
        .collect();

    let mut synth_count = 0u64;
    let mut push_boundary_jmp = |normalized: &mut Vec<RecoveredInstr>, target: u64| -> Result<()> {
        let mut inner = x86::synth_jmp(target)?;
        inner.set_ip(SYNTHETIC_BASE + synth_count);
        synth_count += 1;
        let bytes = x86::encode_at(&inner, 0)?;
        let mut r = RecoveredInstr::new(Instr { inner, bytes }, InstrKind::Normal);
        r.is_boundary_jmp = true;
        normalized.push(r);
        Ok(())
    };

    for idx in 0..s.recovered.len() {
        let mut cur = idx;
        loop {
            let r = &s.recovered[cur];
            let rva = r.rva();
            if linearized.contains(&rva) {
                break;
            }
            linearized.insert(rva);
            normalized.push(r.clone());

            if is_boundary(r) {
                break;
            }
            let next = r.instr.next_rva();
            let Some(fall) = walk_backbone(&s.backbone, ctx.dispatchers, next) else {
                warn!("backbone cycle walking the fall-through of {:#x}", rva);
                unresolved = true;
                break;
            };
            match index_of.get(&fall) {
                Some(&next_idx) if !linearized.contains(&fall) => {
                    // Pull the fall-through up to keep the flow linear.
                    cur = next_idx;
                }
                Some(_) => {
                    // Already placed earlier; bridge with an explicit jmp.
                    push_boundary_jmp(&mut normalized, fall)?;
                    break;
                }
                None => {
                    // Fall-through into unrecovered bytes only happens on
                    // paths recovery already gave up on.
                    if !unresolved {
                        warn!(
                            "unexpected fall-through {:#x} from {:#x} in {:#x}",
                            fall,
                            rva,
                            s.entry
                        );
                    }
                    unresolved = true;
                    break;
                }
            }
        }
    }
    Ok((normalized, unresolved))
}

/// Phase 2b: rewrite branch and call targets through the backbone, and
/// collect the final call targets.
fn update_branch_targets(
    ctx: &StepCtx,
    backbone: &BTreeMap<u64, u64>,
    normalized: &mut [RecoveredInstr],
    call_targets: &mut Vec<u64>,
) -> Result<()> {
    for r in normalized.iter_mut() {
        if r.is_boundary_jmp {
            continue;
        }
        if r.instr.is_jcc() {
            let Some(target) = r.instr.branch_target() else {
                continue;
            };
            let walked =
                walk_backbone(backbone, ctx.dispatchers, target).unwrap_or(target);
            let inner = {
                let mut i = x86::widen_jcc(&r.instr, walked)?;
                i.set_ip(r.instr.rva());
                i.set_len(r.instr.len());
                i
            };
            let bytes = x86::encode_at(&inner, 0)?;
            r.instr = Instr { inner, bytes };
        } else if r.instr.is_jmp_imm() {
            let target = r.instr.branch_target().unwrap();
            let walked =
                walk_backbone(backbone, ctx.dispatchers, target).unwrap_or(target);
            let inner = {
                let mut i = x86::synth_jmp(walked)?;
                i.set_ip(r.instr.rva());
                i.set_len(r.instr.len());
                i
            };
            let bytes = x86::encode_at(&inner, 0)?;
            r.instr = Instr { inner, bytes };
        } else if r.instr.is_call_imm() && r.kind == InstrKind::Normal {
            let target = r.instr.branch_target().unwrap();
            let walked =
                walk_backbone(backbone, ctx.dispatchers, target).unwrap_or(target);
            let inner = {
                let mut i = x86::retarget_call(&r.instr, walked)?;
                i.set_ip(r.instr.rva());
                i.set_len(r.instr.len());
                i
            };
            let bytes = x86::encode_at(&inner, 0)?;
            r.instr = Instr { inner, bytes };
            if !call_targets.contains(&walked) {
                call_targets.push(walked);
            }
        }
    }
    Ok(())
}

/// Phase 3: partition the normalized flow into basic blocks and build
/// the edge graph.
fn build_blocks(
    normalized: &[RecoveredInstr],
    unresolved: bool,
    entry_block: u64,
) -> (BTreeMap<u64, BasicBlock>, Graph<u64, EdgeWeight>, BTreeMap<u64, NodeIndex>) {
    let mut blocks = BTreeMap::new();
    let mut graph = Graph::new();
    let mut node_of = BTreeMap::new();
    if normalized.is_empty() {
        return (blocks, graph, node_of);
    }

    let rvas: BTreeSet<u64> = normalized.iter().map(|r| r.rva()).collect();

    // Leaders: first instruction, every branch target we own, and every
    // instruction following a control-flow tail.
    let mut leaders = BTreeSet::new();
    leaders.insert(normalized[0].rva());
    for (i, r) in normalized.iter().enumerate() {
        let flow_break = r.instr.is_jcc() || r.instr.is_jmp() || r.instr.is_ret() || r.instr.is_int3();
        if flow_break {
            if let Some(next) = normalized.get(i + 1) {
                leaders.insert(next.rva());
            }
        }
        if r.instr.is_jcc() || r.instr.is_jmp_imm() {
            if let Some(t) = r.instr.branch_target() {
                if rvas.contains(&t) {
                    leaders.insert(t);
                }
            }
        }
    }

    let mut start_idx = 0usize;
    for i in 0..normalized.len() {
        let r = &normalized[i];
        let next_is_leader = normalized
            .get(i + 1)
            .map_or(true, |n| leaders.contains(&n.rva()));
        if !next_is_leader {
            continue;
        }

        let start = normalized[start_idx].rva();
        let mut succs = Vec::new();
        let terminator = if r.instr.is_jcc() {
            if let Some(t) = r.instr.branch_target() {
                succs.push(t);
            }
            if let Some(n) = normalized.get(i + 1) {
                succs.push(n.rva());
            }
            Terminator::CondJump
        } else if r.instr.is_jmp_imm() {
            if let Some(t) = r.instr.branch_target() {
                succs.push(t);
            }
            Terminator::Jump
        } else if r.instr.is_jmp() {
            Terminator::Indirect
        } else if r.instr.is_ret() || r.instr.is_int3() {
            Terminator::Return
        } else if i + 1 < normalized.len() {
            succs.push(normalized[i + 1].rva());
            Terminator::FallThrough
        } else {
            // The stream was cut short (unresolved path).
            Terminator::Indirect
        };

        let mut flags = BlockFlags::empty();
        if start == entry_block {
            flags |= BlockFlags::ENTRY;
        }
        if unresolved && i + 1 == normalized.len() && terminator == Terminator::Indirect {
            flags |= BlockFlags::UNRESOLVED;
        }
        blocks.insert(
            start,
            BasicBlock {
                start,
                range: (start_idx, i + 1),
                terminator,
                succs,
                flags,
            },
        );
        start_idx = i + 1;
    }

    for &start in blocks.keys() {
        let nx = graph.add_node(start);
        node_of.insert(start, nx);
    }
    let mut edges: Vec<(u64, u64, EdgeWeight)> = Vec::new();
    for b in blocks.values() {
        for (i, &t) in b.succs.iter().enumerate() {
            if node_of.contains_key(&t) {
                let weight = match b.terminator {
                    Terminator::CondJump if i == 0 => EdgeWeight::Jump,
                    Terminator::Jump => EdgeWeight::Jump,
                    _ => EdgeWeight::Flow,
                };
                edges.push((b.start, t, weight));
            }
        }
    }
    for (from, to, weight) in edges {
        graph.add_edge(node_of[&from], node_of[&to], weight);
    }

    (blocks, graph, node_of)
}

/// Recover one function's control flow by rule-driven stepping.
pub fn recover_cfg_step(ctx: &StepCtx, func_start: u64) -> Result<RecoveredFunc> {
    trace!("recovering function at {:#x}", func_start);
    let mut s = StepState::new(func_start);
    while step(ctx, &mut s)? {}

    let (mut normalized, unresolved) = normalize(ctx, &s)?;
    let mut call_targets = Vec::new();
    update_branch_targets(ctx, &s.backbone, &mut normalized, &mut call_targets)?;

    let real_entry =
        walk_backbone(&s.backbone, ctx.dispatchers, func_start).unwrap_or(func_start);
    let (blocks, graph, node_of) = build_blocks(&normalized, unresolved, real_entry);

    let state = if unresolved {
        FuncState::Unresolved
    } else {
        FuncState::Complete
    };

    Ok(RecoveredFunc {
        entry: func_start,
        name: None,
        real_entry,
        recovered: s.recovered,
        normalized,
        backbone: s.backbone,
        blocks,
        graph,
        node_of,
        state,
        call_targets,
        import_sites: s.import_sites,
        garbage: s.garbage,
        reloc_rva: 0,
    })
}
