use std::sync::Arc;

use crate::backend::Arch;
use crate::error::{StubError, StubResult};
use crate::memory::CodeRegion;
use crate::object::{Instance, InstanceHeader, instance_ptr};
use crate::plan::Plan;
use crate::slow_path::ThreadSlots;
use crate::types::{RawType, Type};

pub type StubEntry =
    unsafe extern "C" fn(*const InstanceHeader, *const RawType, *const ThreadSlots) -> u32;

/// Finished machine code for one stub.
///
/// Host-architecture code objects own the executable region the code was
/// committed to. Code emitted for another architecture, or with native stubs
/// disabled, only carries its bytes.
#[derive(Debug)]
pub struct CodeObject {
    name: String,
    ty: Option<Type>,
    arch: Arch,
    code: Vec<u8>,
    memory: Option<CodeRegion>,
    base: u64,
    plan: Plan,
    /// Code this object jumps into directly; kept mapped while this is.
    links: Vec<Arc<CodeObject>>,
}

impl CodeObject {
    pub(crate) fn new(
        name: String,
        ty: Option<Type>,
        arch: Arch,
        code: Vec<u8>,
        memory: Option<CodeRegion>,
        base: u64,
        plan: Plan,
    ) -> Self {
        Self {
            name,
            ty,
            arch,
            code,
            memory,
            base,
            plan,
            links: Vec::new(),
        }
    }

    pub(crate) fn with_link(mut self, target: Arc<CodeObject>) -> Self {
        self.links.push(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target type; `None` for the shared slow-path stub.
    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Address the code was linked at.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn is_slow_path_stub(&self) -> bool {
        self.ty.is_none()
    }

    pub fn is_executable(&self) -> bool {
        self.memory.as_ref().is_some_and(CodeRegion::is_committed)
    }

    /// Entry address, or 0 when the code is not executable here.
    pub fn entry(&self) -> usize {
        match &self.memory {
            Some(region) if region.is_committed() => region.address() as usize,
            _ => 0,
        }
    }

    /// Runs the stub for `instance` against `ty` on the calling thread.
    ///
    /// The slow path, when reached, consults whatever
    /// [`SlowPathScope`](crate::slow_path::SlowPathScope) is active here.
    pub fn call(&self, instance: Option<&Instance>, ty: &Type) -> StubResult<bool> {
        let entry = self.entry_fn()?;
        let result = unsafe { entry(instance_ptr(instance), ty.raw_ptr(), ThreadSlots::current()) };
        Ok(result != 0)
    }

    fn entry_fn(&self) -> StubResult<StubEntry> {
        if self.arch != Arch::host() {
            return Err(StubError::UnsupportedArch(self.arch));
        }
        let address = self.entry();
        if address == 0 {
            return Err(StubError::ExecutableMemory(format!(
                "{} was not committed to executable memory",
                self.name
            )));
        }
        Ok(unsafe { std::mem::transmute::<usize, StubEntry>(address) })
    }
}

impl std::fmt::Display for CodeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {} bytes)", self.name, self.arch, self.code.len())
    }
}
