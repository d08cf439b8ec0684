//! Process-wide table from type identity to its installed stub.
//!
//! Entries are created on first request and never removed. Generation for one
//! type is serialized on that entry's lock; unrelated types never contend.
//! Publication is a single `ArcSwapOption` store after a full fence, and
//! replaced code objects wait on a retirement list until the runtime drains
//! it at a quiescent point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::code::CodeObject;
use crate::compiler::StubCompiler;
use crate::error::StubResult;
use crate::object::Instance;
use crate::plan::Outcome;
use crate::slow_path::{GeneralSubtypeTest, SlowPathScope, slow_type_test_entry, take_slow_path_error};
use crate::types::{Type, TypeId};

struct RegistryEntry {
    ty: Type,
    code: ArcSwapOption<CodeObject>,
    generation: Mutex<()>,
    /// Bumped by every invalidation.
    epoch: AtomicU64,
    /// Epoch the installed code was planned under.
    installed_epoch: AtomicU64,
    fallback: AtomicBool,
}

impl RegistryEntry {
    fn new(ty: Type) -> Self {
        Self {
            ty,
            code: ArcSwapOption::empty(),
            generation: Mutex::new(()),
            epoch: AtomicU64::new(0),
            installed_epoch: AtomicU64::new(0),
            fallback: AtomicBool::new(false),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Installed code, unless an invalidation happened after it was planned.
    fn current(&self) -> Option<Arc<CodeObject>> {
        if self.installed_epoch.load(Ordering::Acquire) != self.epoch() {
            return None;
        }
        self.code.load_full()
    }
}

pub struct StubRegistry {
    compiler: StubCompiler,
    tester: Arc<dyn GeneralSubtypeTest>,
    entries: DashMap<TypeId, Arc<RegistryEntry>>,
    retired: Mutex<Vec<Arc<CodeObject>>>,
    compilations: AtomicU64,
}

impl StubRegistry {
    pub fn new(compiler: StubCompiler, tester: Arc<dyn GeneralSubtypeTest>) -> Self {
        Self {
            compiler,
            tester,
            entries: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn compiler(&self) -> &StubCompiler {
        &self.compiler
    }

    pub fn tester(&self) -> &Arc<dyn GeneralSubtypeTest> {
        &self.tester
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stubs generated so far. Coalesced requests do not count.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    fn entry(&self, ty: &Type) -> Arc<RegistryEntry> {
        if let Some(entry) = self.entries.get(&ty.id()) {
            return entry.clone();
        }
        self.entries
            .entry(ty.id())
            .or_insert_with(|| Arc::new(RegistryEntry::new(ty.clone())))
            .clone()
    }

    /// Installed stub for `ty`, generating it when the entry is cold or was
    /// invalidated.
    pub fn lookup(&self, ty: &Type) -> StubResult<Arc<CodeObject>> {
        let entry = self.entry(ty);
        if let Some(code) = entry.current() {
            return Ok(code);
        }

        let _generation = entry.generation.lock();
        loop {
            if let Some(code) = entry.current() {
                return Ok(code);
            }
            let epoch = entry.epoch();
            let code = match self.compiler.compile(&entry.ty) {
                Ok(code) => {
                    entry.fallback.store(false, Ordering::Relaxed);
                    code
                }
                Err(err) if err.is_fatal() => {
                    error!(ty = %entry.ty, error = %err, "stub generation failed, using slow path");
                    entry.fallback.store(true, Ordering::Relaxed);
                    self.compiler.slow_path_stub()?
                }
                Err(err) => return Err(err),
            };
            self.compilations.fetch_add(1, Ordering::Relaxed);
            self.publish(&entry, code.clone(), epoch);
            if entry.epoch() == epoch {
                return Ok(code);
            }
            debug!(ty = %entry.ty, "invalidated during generation, regenerating");
        }
    }

    /// Entry address of the stub for `ty`, generating it if needed.
    ///
    /// Code that cannot execute on this host reports the general routine,
    /// which has the same calling convention.
    pub fn ensure_stub(&self, ty: &Type) -> StubResult<usize> {
        let code = self.lookup(ty)?;
        Ok(match code.entry() {
            0 => slow_type_test_entry(),
            entry => entry,
        })
    }

    /// Non-generating peek at the installed stub.
    pub fn installed(&self, ty: &Type) -> Option<Arc<CodeObject>> {
        self.entries
            .get(&ty.id())
            .and_then(|entry| entry.code.load_full())
    }

    pub fn install(&self, ty: &Type, code: Arc<CodeObject>) {
        let entry = self.entry(ty);
        let _generation = entry.generation.lock();
        entry.fallback.store(false, Ordering::Relaxed);
        let epoch = entry.epoch();
        self.publish(&entry, code, epoch);
    }

    /// Forces regeneration on next use. The current stub stays installed and
    /// callable until then. A generation already in progress for `ty` is
    /// discarded and redone.
    ///
    /// Call after the hierarchy change is visible in the oracle.
    pub fn invalidate(&self, ty: &Type) {
        if let Some(entry) = self.entries.get(&ty.id()) {
            entry.epoch.fetch_add(1, Ordering::AcqRel);
            info!(ty = %ty, "invalidated type test stub");
        }
    }

    /// True while `ty` is served by the slow-path stub after a failed
    /// generation.
    pub fn is_fallback(&self, ty: &Type) -> bool {
        self.entries
            .get(&ty.id())
            .is_some_and(|entry| entry.fallback.load(Ordering::Relaxed))
    }

    /// Replaced code objects no caller can reach any more through the
    /// registry. The runtime drops them once no thread can still run them.
    pub fn drain_retired(&self) -> Vec<Arc<CodeObject>> {
        std::mem::take(&mut *self.retired.lock())
    }

    fn publish(&self, entry: &RegistryEntry, code: Arc<CodeObject>, epoch: u64) {
        fence(Ordering::SeqCst);
        let previous = entry.code.swap(Some(code.clone()));
        entry.installed_epoch.store(epoch, Ordering::Release);
        match previous {
            Some(old) if Arc::ptr_eq(&old, &code) => {}
            Some(old) => {
                info!(ty = %entry.ty, code = %code, "regenerated type test stub");
                self.retired.lock().push(old);
            }
            None => info!(ty = %entry.ty, code = %code, "installed type test stub"),
        }
    }

    /// Tests `instance` against `ty` through its installed stub on the
    /// calling thread.
    ///
    /// Stubs that cannot execute on this host are interpreted from their
    /// plan instead.
    pub fn test(&self, instance: Option<&Instance>, ty: &Type) -> StubResult<bool> {
        let code = self.lookup(ty)?;
        let _scope = SlowPathScope::enter(self.tester.clone());
        if code.is_executable() {
            let verdict = code.call(instance, ty)?;
            take_slow_path_error()?;
            return Ok(verdict);
        }
        Ok(match code.plan().evaluate(instance) {
            Outcome::Accept => true,
            Outcome::Reject => false,
            Outcome::FallThroughToSlowPath => self
                .tester
                .is_instance_of(instance.map(Instance::runtime_type), ty),
        })
    }
}
