use crate::backend::Arch;
use crate::hierarchy::ClassId;
use crate::linker::SymbolicTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    UnresolvedTarget(SymbolicTarget),
    UnknownClass(ClassId),
    UnsupportedArch(Arch),
    InvalidPlan(String),
    Emit(String),
    Link(String),
    ExecutableMemory(String),
}

impl StubError {
    /// Faults that indicate a bootstrapping-order or planner defect rather than a
    /// transient resource problem.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StubError::UnresolvedTarget(_) | StubError::InvalidPlan(_)
        )
    }
}

impl std::fmt::Display for StubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StubError::UnresolvedTarget(target) => {
                write!(f, "unresolved call target {target} at link time")
            }
            StubError::UnknownClass(id) => write!(f, "unknown class id {}", id.0),
            StubError::UnsupportedArch(arch) => {
                write!(f, "cannot execute {arch} stubs on this host")
            }
            StubError::InvalidPlan(message) => write!(f, "invalid plan: {message}"),
            StubError::Emit(message) => write!(f, "stub emission error: {message}"),
            StubError::Link(message) => write!(f, "stub link error: {message}"),
            StubError::ExecutableMemory(message) => {
                write!(f, "executable memory error: {message}")
            }
        }
    }
}

impl std::error::Error for StubError {}

pub type StubResult<T> = Result<T, StubError>;
