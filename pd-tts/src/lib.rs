pub mod asm;
pub mod backend;
pub mod code;
pub mod compiler;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod linker;
#[cfg(feature = "cli")]
pub mod logging;
pub mod memory;
pub mod object;
pub mod plan;
pub mod registry;
pub mod slow_path;
pub mod types;

pub use backend::{Arch, MacroAssembler, PendingStub, emit_stub};
pub use code::{CodeObject, StubEntry};
pub use compiler::{DETACHED_IMAGE_BASE, StubCompiler};
pub use config::{SlowPathLinkage, StubConfig, native_stubs_supported};
pub use error::{StubError, StubResult};
pub use hierarchy::{
    CidRange, CidRanges, ClassDecl, ClassId, ClassInfo, ClassTable, HierarchyOracle, SuperArg,
    SuperRef,
};
pub use linker::{
    DeferredCallLinker, Island, LinkReport, LinkUnit, RelocKind, SymbolicTarget,
    UnresolvedCallSite,
};
pub use object::{Instance, InstanceHeader, instance_ptr};
pub use plan::{Branch, Check, Outcome, Plan, Planner};
pub use registry::StubRegistry;
pub use slow_path::{
    GeneralSubtypeTest, SlowPathScope, SubtypeTester, ThreadSlots, slow_type_test,
    slow_type_test_entry, take_slow_path_error,
};
pub use types::{RawType, Type, TypeId, TypeKind, TypeTable};
