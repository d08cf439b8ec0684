//! Per-ISA stub emission.
//!
//! The walk over a [`Plan`] is shared; each backend supplies the handful of
//! [`MacroAssembler`] primitives the walk needs. Every stub follows one calling
//! convention: `(instance, type descriptor, thread slots)` in the first three
//! argument registers, `1`/`0` returned in the first result register.

use tracing::debug;

use crate::asm::{CodeBuffer, Label};
use crate::config::SlowPathLinkage;
use crate::error::{StubError, StubResult};
use crate::hierarchy::{CidRange, ClassId};
use crate::linker::{DeferredCallLinker, Island, RelocKind, SymbolicTarget, UnresolvedCallSite};
use crate::plan::{Branch, Check, Outcome, Plan};

pub mod aarch64;
pub mod x86_64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    AArch64,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::AArch64
        } else {
            Arch::X86_64
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "x86_64" | "x86-64" | "x64" => Some(Arch::X86_64),
            "aarch64" | "arm64" => Some(Arch::AArch64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::X86_64 => f.write_str("x86_64"),
            Arch::AArch64 => f.write_str("aarch64"),
        }
    }
}

/// Primitives a backend provides to lower plans.
///
/// `depth` 0 is the instance in the first argument register; depth `n > 0` is
/// the descriptor of a type argument loaded by [`load_type_argument`].
///
/// [`load_type_argument`]: MacroAssembler::load_type_argument
pub trait MacroAssembler {
    fn buffer(&mut self) -> &mut CodeBuffer;

    /// Deepest type-argument subject kept in a register.
    fn max_subject_depth(&self) -> usize;

    /// Instance is null (depth 0) or descriptor is nullable (depth > 0).
    fn branch_if_null(&mut self, depth: usize, target: Label) -> StubResult<()>;

    fn branch_if_identical(&mut self, depth: usize, type_address: u64, target: Label)
    -> StubResult<()>;

    /// Loads the subject's class id into the class-id scratch register.
    fn load_class_id(&mut self, depth: usize) -> StubResult<()>;

    fn branch_on_class_id(&mut self, id: ClassId, when_equal: bool, target: Label)
    -> StubResult<()>;

    fn branch_on_class_range(
        &mut self,
        range: CidRange,
        when_inside: bool,
        target: Label,
    ) -> StubResult<()>;

    /// Makes type argument `index` of the subject at `depth` the subject at
    /// `depth + 1`.
    fn load_type_argument(&mut self, depth: usize, index: usize) -> StubResult<()>;

    fn jump(&mut self, target: Label);

    fn return_accept(&mut self);

    fn return_reject(&mut self);

    /// Tail jump through the slow-path slot of the thread block.
    fn tail_jump_thread_slot(&mut self) -> StubResult<()>;

    /// Pc-relative tail jump with an unpatched displacement.
    fn tail_jump_direct(&mut self) -> (usize, RelocKind);

    /// Appends an absolute-address jump island.
    fn emit_island(&mut self) -> Island;
}

/// Emitted bytes whose cross-stub sites are recorded with the linker.
#[derive(Debug)]
pub struct PendingStub {
    pub unit: usize,
    pub arch: Arch,
    pub code: Vec<u8>,
}

/// Lowers `plan` for `arch`, recording unresolved sites for `unit`.
pub fn emit_stub(
    arch: Arch,
    plan: &Plan,
    linkage: SlowPathLinkage,
    unit: usize,
    linker: &mut DeferredCallLinker,
) -> StubResult<PendingStub> {
    let code = match arch {
        Arch::X86_64 => {
            let mut masm = x86_64::X64Assembler::new(x86_64::CallConv::host());
            lower_plan(&mut masm, plan, linkage, unit, linker)?;
            masm.finish()?
        }
        Arch::AArch64 => {
            let mut masm = aarch64::A64Assembler::new();
            lower_plan(&mut masm, plan, linkage, unit, linker)?;
            masm.finish()?
        }
    };
    debug!(%arch, unit, bytes = code.len(), %linkage, "emitted stub");
    Ok(PendingStub { unit, arch, code })
}

#[derive(Copy, Clone)]
struct Targets {
    accept: Label,
    reject: Label,
    slow: Label,
}

impl Targets {
    fn of(&self, outcome: Outcome) -> Label {
        match outcome {
            Outcome::Accept => self.accept,
            Outcome::Reject => self.reject,
            Outcome::FallThroughToSlowPath => self.slow,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Flow {
    /// Control reaches the plan's terminal.
    Open,
    /// An unconditional transfer ended the sequence.
    Closed,
}

pub(crate) fn lower_plan<M: MacroAssembler>(
    masm: &mut M,
    plan: &Plan,
    linkage: SlowPathLinkage,
    unit: usize,
    linker: &mut DeferredCallLinker,
) -> StubResult<()> {
    let buf = masm.buffer();
    let targets = Targets {
        accept: buf.new_label(),
        reject: buf.new_label(),
        slow: buf.new_label(),
    };
    let flow = lower_checks(masm, plan, 0, targets)?;

    // The terminal exit goes first so the sequence falls into it.
    let mut order = vec![plan.terminal];
    for outcome in [
        Outcome::Accept,
        Outcome::Reject,
        Outcome::FallThroughToSlowPath,
    ] {
        if outcome != plan.terminal {
            order.push(outcome);
        }
    }

    let mut direct_site = None;
    for (position, outcome) in order.into_iter().enumerate() {
        let label = targets.of(outcome);
        let reached = position == 0 && flow == Flow::Open;
        if !reached && !masm.buffer().is_referenced(label) {
            continue;
        }
        masm.buffer().bind(label)?;
        match outcome {
            Outcome::Accept => masm.return_accept(),
            Outcome::Reject => masm.return_reject(),
            Outcome::FallThroughToSlowPath => match linkage {
                SlowPathLinkage::ThreadSlot => masm.tail_jump_thread_slot()?,
                SlowPathLinkage::PcRelative => direct_site = Some(masm.tail_jump_direct()),
            },
        }
    }

    if let Some((offset, kind)) = direct_site {
        let island = masm.emit_island();
        linker.record(UnresolvedCallSite {
            unit,
            offset,
            kind,
            island: Some(island),
            target: SymbolicTarget::SlowPath,
        });
    }
    Ok(())
}

fn lower_checks<M: MacroAssembler>(
    masm: &mut M,
    plan: &Plan,
    depth: usize,
    targets: Targets,
) -> StubResult<Flow> {
    let mut class_id_loaded = false;
    for check in &plan.checks {
        match check {
            Check::IsNull { on_null } => masm.branch_if_null(depth, targets.of(*on_null))?,
            Check::IdentityEquals { ty } => {
                masm.branch_if_identical(depth, ty.address(), targets.accept)?
            }
            Check::ClassIdEquals {
                id,
                on_match,
                on_miss,
            } => {
                if !class_id_loaded {
                    masm.load_class_id(depth)?;
                    class_id_loaded = true;
                }
                let (when_equal, target, otherwise) = class_branch(*on_match, *on_miss, targets)?;
                masm.branch_on_class_id(*id, when_equal, target)?;
                if let Some(otherwise) = otherwise {
                    masm.jump(otherwise);
                    return Ok(Flow::Closed);
                }
            }
            Check::ClassIdInRange {
                range,
                on_match,
                on_miss,
            } => {
                if !class_id_loaded {
                    masm.load_class_id(depth)?;
                    class_id_loaded = true;
                }
                let (when_inside, target, otherwise) = class_branch(*on_match, *on_miss, targets)?;
                masm.branch_on_class_range(*range, when_inside, target)?;
                if let Some(otherwise) = otherwise {
                    masm.jump(otherwise);
                    return Ok(Flow::Closed);
                }
            }
            Check::RecurseTypeArgument { index, plan: nested } => {
                if depth + 1 > masm.max_subject_depth() {
                    debug!(depth, "out of subject registers, nested check uses slow path");
                    masm.jump(targets.slow);
                    return Ok(Flow::Closed);
                }
                masm.load_type_argument(depth, *index)?;
                let next = masm.buffer().new_label();
                let nested_targets = Targets {
                    accept: next,
                    reject: targets.slow,
                    slow: targets.slow,
                };
                let flow = lower_checks(masm, nested, depth + 1, nested_targets)?;
                if flow == Flow::Open && nested.terminal != Outcome::Accept {
                    masm.jump(nested_targets.of(nested.terminal));
                }
                masm.buffer().bind(next)?;
                class_id_loaded = false;
            }
        }
    }
    Ok(Flow::Open)
}

/// Maps a two-way class test to one conditional branch plus an optional
/// unconditional jump for the other edge.
fn class_branch(
    on_match: Branch,
    on_miss: Branch,
    targets: Targets,
) -> StubResult<(bool, Label, Option<Label>)> {
    match (on_match, on_miss) {
        (Branch::Decide(hit), Branch::Continue) => Ok((true, targets.of(hit), None)),
        (Branch::Continue, Branch::Decide(miss)) => Ok((false, targets.of(miss), None)),
        (Branch::Decide(hit), Branch::Decide(miss)) => {
            Ok((true, targets.of(hit), Some(targets.of(miss))))
        }
        (Branch::Continue, Branch::Continue) => Err(StubError::InvalidPlan(
            "class id check continues on both edges".to_string(),
        )),
    }
}
