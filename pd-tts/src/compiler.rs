//! The stub pipeline: plan, emit, place, link, commit.
//!
//! Every stub of a batch is emitted before any of them has an address. Once
//! all regions are reserved the linker patches the recorded sites in one
//! pass, the code is committed executable and a full fence is issued before
//! any code object is handed out.

use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::backend::{Arch, PendingStub, emit_stub};
use crate::code::CodeObject;
use crate::config::{SlowPathLinkage, StubConfig, native_stubs_supported};
use crate::error::StubResult;
use crate::hierarchy::HierarchyOracle;
use crate::linker::{DeferredCallLinker, LinkUnit, SymbolicTarget};
use crate::memory::CodeRegion;
use crate::plan::{Outcome, Plan, Planner};
use crate::types::Type;

/// Base of the image that non-executable code is linked into.
pub const DETACHED_IMAGE_BASE: u64 = 0x1_0000;

const STUB_ALIGNMENT: u64 = 16;

pub struct StubCompiler {
    config: StubConfig,
    oracle: Arc<dyn HierarchyOracle>,
    planner: Planner,
    slow_path_stub: OnceLock<Arc<CodeObject>>,
    #[cfg(test)]
    link_fault: parking_lot::Mutex<Option<crate::error::StubError>>,
}

impl StubCompiler {
    pub fn new(config: StubConfig, oracle: Arc<dyn HierarchyOracle>) -> Self {
        let planner = Planner::new(oracle.clone(), config.max_type_arg_depth);
        Self {
            config,
            oracle,
            planner,
            slow_path_stub: OnceLock::new(),
            #[cfg(test)]
            link_fault: parking_lot::Mutex::new(None),
        }
    }

    /// Makes the next batch fail with `err` right before linking.
    #[cfg(test)]
    pub(crate) fn fail_next_link(&self, err: crate::error::StubError) {
        *self.link_fault.lock() = Some(err);
    }

    pub fn config(&self) -> &StubConfig {
        &self.config
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Whether compiled code lands in executable memory on this host.
    pub fn emits_executable_code(&self) -> bool {
        native_stubs_supported() && self.config.arch == Arch::host()
    }

    /// Plans `ty` and checks the plan before anything is emitted.
    pub fn plan(&self, ty: &Type) -> StubResult<Plan> {
        let info = ty.class().and_then(|class| self.oracle.class_info(class));
        let plan = self.planner.plan(ty, info.as_ref());
        plan.validate(self.config.max_type_arg_depth)?;
        Ok(plan)
    }

    /// The stub shared by every type that has no fast checks. It jumps
    /// straight to the general routine through the thread slot.
    pub fn slow_path_stub(&self) -> StubResult<Arc<CodeObject>> {
        if let Some(stub) = self.slow_path_stub.get() {
            return Ok(stub.clone());
        }
        let built = Arc::new(self.build_slow_path_stub()?);
        Ok(self.slow_path_stub.get_or_init(|| built).clone())
    }

    fn build_slow_path_stub(&self) -> StubResult<CodeObject> {
        let plan = Plan::slow_path();
        let mut linker = DeferredCallLinker::new();
        let PendingStub { code, .. } = emit_stub(
            self.config.arch,
            &plan,
            SlowPathLinkage::ThreadSlot,
            0,
            &mut linker,
        )?;
        let (memory, base) = if self.emits_executable_code() {
            let mut region = CodeRegion::reserve(code.len())?;
            region.commit(&code)?;
            fence(Ordering::SeqCst);
            let base = region.address();
            (Some(region), base)
        } else {
            (None, DETACHED_IMAGE_BASE)
        };
        debug!(arch = %self.config.arch, bytes = code.len(), "built shared slow-path stub");
        Ok(CodeObject::new(
            "tts:slow-path".to_string(),
            None,
            self.config.arch,
            code,
            memory,
            base,
            plan,
        ))
    }

    pub fn compile(&self, ty: &Type) -> StubResult<Arc<CodeObject>> {
        let mut compiled = self.compile_batch(std::slice::from_ref(ty))?;
        Ok(compiled.remove(0))
    }

    /// Compiles `types` as one link unit set; the result is in input order.
    ///
    /// Types whose plan has no fast checks share the slow-path stub. So does
    /// every type when native stubs are disabled.
    pub fn compile_batch(&self, types: &[Type]) -> StubResult<Vec<Arc<CodeObject>>> {
        let mut results: Vec<Option<Arc<CodeObject>>> = vec![None; types.len()];
        let mut batch = Vec::new();
        for (index, ty) in types.iter().enumerate() {
            let plan = self.plan(ty)?;
            if !self.config.enabled || is_slow_path_only(&plan) {
                debug!(ty = %ty, "using shared slow-path stub");
                results[index] = Some(self.slow_path_stub()?);
            } else {
                batch.push((index, ty, plan));
            }
        }
        if !batch.is_empty() {
            let linked = self.link_batch(batch.iter().map(|(_, ty, plan)| (*ty, plan)))?;
            for ((index, _, _), code) in batch.iter().zip(linked) {
                results[*index] = Some(code);
            }
        }
        Ok(results.into_iter().flatten().collect())
    }

    fn link_batch<'a>(
        &self,
        batch: impl Iterator<Item = (&'a Type, &'a Plan)>,
    ) -> StubResult<Vec<Arc<CodeObject>>> {
        let arch = self.config.arch;
        let linkage = self.config.slow_path_linkage;
        let executable = self.emits_executable_code();

        let mut linker = DeferredCallLinker::new();
        let mut emitted = Vec::new();
        for (unit, (ty, plan)) in batch.enumerate() {
            let stub = emit_stub(arch, plan, linkage, unit, &mut linker)?;
            emitted.push((ty, plan, stub));
        }

        let slow = self.slow_path_stub()?;
        let links_slow_path = !linker.pending().is_empty();
        if links_slow_path {
            linker.define(SymbolicTarget::SlowPath, slow.base());
        }

        let slow_end = DETACHED_IMAGE_BASE + slow.code().len() as u64;
        let mut next_base = align_up(slow_end, STUB_ALIGNMENT);
        let mut regions = Vec::with_capacity(emitted.len());
        let mut units = Vec::with_capacity(emitted.len());
        for (ty, _, stub) in &mut emitted {
            let (region, base) = if executable {
                let region = CodeRegion::reserve(stub.code.len())?;
                let base = region.address();
                (Some(region), base)
            } else {
                let base = next_base;
                next_base = align_up(base + stub.code.len() as u64, STUB_ALIGNMENT);
                (None, base)
            };
            linker.define(SymbolicTarget::Stub(ty.id()), base);
            regions.push(region);
            units.push(LinkUnit {
                base,
                code: std::mem::take(&mut stub.code),
            });
        }

        #[cfg(test)]
        if let Some(err) = self.link_fault.lock().take() {
            return Err(err);
        }
        let report = linker.resolve_all(&mut units)?;
        for (region, unit) in regions.iter_mut().zip(&units) {
            if let Some(region) = region {
                region.commit(&unit.code)?;
            }
        }
        fence(Ordering::SeqCst);
        debug!(
            stubs = units.len(),
            patched = report.patched,
            trampolines = report.trampolines,
            executable,
            "linked stub batch"
        );

        Ok(emitted
            .into_iter()
            .zip(regions)
            .zip(units)
            .map(|(((ty, plan, _), memory), unit)| {
                let code = CodeObject::new(
                    format!("tts:{ty}"),
                    Some(ty.clone()),
                    arch,
                    unit.code,
                    memory,
                    unit.base,
                    plan.clone(),
                );
                Arc::new(if links_slow_path && plan.reaches_slow_path() {
                    code.with_link(slow.clone())
                } else {
                    code
                })
            })
            .collect())
    }
}

fn is_slow_path_only(plan: &Plan) -> bool {
    plan.checks.is_empty() && plan.terminal == Outcome::FallThroughToSlowPath
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
