//! Class hierarchy facts consumed by the planner.
//!
//! The planner only ever talks to [`HierarchyOracle`]. [`ClassTable`] is the
//! in-process implementation used by the runtime and the tests: classes are
//! numbered in load order, so a class loaded late gets a high id and may split
//! a previously contiguous subclass range.

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{StubError, StubResult};
use crate::types::Type;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const ILLEGAL: Self = Self(0);
    pub const DYNAMIC: Self = Self(1);
    pub const VOID: Self = Self(2);
    pub const NEVER: Self = Self(3);
    pub const NULL: Self = Self(4);
    pub const OBJECT: Self = Self(5);
    pub const CLOSURE: Self = Self(6);
    pub const FIRST_USER: Self = Self(8);

    pub const fn is_user_class(self) -> bool {
        self.0 >= Self::FIRST_USER.0
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cid#{}", self.0)
    }
}

/// Inclusive class-id range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CidRange {
    pub lo: ClassId,
    pub hi: ClassId,
}

impl CidRange {
    pub const fn single(id: ClassId) -> Self {
        Self { lo: id, hi: id }
    }

    pub const fn new(lo: ClassId, hi: ClassId) -> Self {
        Self { lo, hi }
    }

    pub const fn is_single(&self) -> bool {
        self.lo.0 == self.hi.0
    }

    pub const fn contains(&self, id: ClassId) -> bool {
        self.lo.0 <= id.0 && id.0 <= self.hi.0
    }

    pub const fn span(&self) -> u32 {
        self.hi.0 - self.lo.0
    }
}

impl std::fmt::Display for CidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_single() {
            write!(f, "[{}]", self.lo.0)
        } else {
            write!(f, "[{}..={}]", self.lo.0, self.hi.0)
        }
    }
}

pub type CidRanges = SmallVec<[CidRange; 2]>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub is_sealed: bool,
    pub is_abstract: bool,
    pub type_parameter_count: usize,
    /// Ordered, merged ranges covering every class an instance of this class
    /// (or of any subclass/implementer) can have.
    pub ranges: CidRanges,
}

impl ClassInfo {
    /// True when the only instances are exactly this class.
    pub fn is_leaf(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == CidRange::single(self.id)
    }
}

/// Read-only view of the precomputed hierarchy.
pub trait HierarchyOracle: Send + Sync {
    fn class_info(&self, class: ClassId) -> Option<ClassInfo>;

    fn class_id_ranges(&self, class: ClassId) -> CidRanges {
        self.class_info(class)
            .map(|info| info.ranges)
            .unwrap_or_default()
    }

    fn is_sealed(&self, class: ClassId) -> bool {
        self.class_info(class)
            .map(|info| info.is_sealed)
            .unwrap_or(false)
    }
}

/// How a class instantiates one of its direct supertypes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuperArg {
    /// The subclass's own type parameter at this index.
    Param(usize),
    /// A closed type.
    Fixed(Type),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperRef {
    pub class: ClassId,
    pub args: Vec<SuperArg>,
}

impl SuperRef {
    pub fn raw(class: ClassId) -> Self {
        Self {
            class,
            args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassDecl {
    name: String,
    superclass: Option<SuperRef>,
    interfaces: Vec<SuperRef>,
    type_parameter_count: usize,
    sealed: bool,
    is_abstract: bool,
}

impl ClassDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            type_parameter_count: 0,
            sealed: false,
            is_abstract: false,
        }
    }

    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn type_params(mut self, count: usize) -> Self {
        self.type_parameter_count = count;
        self
    }

    pub fn extends(mut self, class: ClassId) -> Self {
        self.superclass = Some(SuperRef::raw(class));
        self
    }

    pub fn extends_with(mut self, class: ClassId, args: Vec<SuperArg>) -> Self {
        self.superclass = Some(SuperRef { class, args });
        self
    }

    pub fn implements(mut self, class: ClassId) -> Self {
        self.interfaces.push(SuperRef::raw(class));
        self
    }

    pub fn implements_with(mut self, class: ClassId, args: Vec<SuperArg>) -> Self {
        self.interfaces.push(SuperRef { class, args });
        self
    }
}

#[derive(Clone, Debug)]
struct ClassEntry {
    name: String,
    supers: Vec<SuperRef>,
    /// Every transitive supertype, sorted.
    ancestors: Vec<ClassId>,
    type_parameter_count: usize,
    sealed: bool,
    is_abstract: bool,
    /// Placeholder slots for reserved ids that do not name a real class.
    placeholder: bool,
}

/// Concurrent class table. Classes loaded late widen their ancestors' ranges;
/// stubs planned against the old ranges must be invalidated by the loader.
pub struct ClassTable {
    classes: RwLock<Vec<ClassEntry>>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        let reserved = |name: &str, placeholder: bool, supers: Vec<SuperRef>| ClassEntry {
            name: name.to_string(),
            ancestors: supers.iter().map(|s| s.class).collect(),
            supers,
            type_parameter_count: 0,
            sealed: true,
            is_abstract: true,
            placeholder,
        };
        let mut classes = vec![
            reserved("<illegal>", true, Vec::new()),
            reserved("dynamic", true, Vec::new()),
            reserved("void", true, Vec::new()),
            reserved("Never", true, Vec::new()),
            reserved("Null", false, Vec::new()),
            reserved("Object", false, Vec::new()),
            reserved("_Closure", false, vec![SuperRef::raw(ClassId::OBJECT)]),
            reserved("<reserved>", true, Vec::new()),
        ];
        // Null is instantiated only as the null pointer; Object is open.
        classes[ClassId::OBJECT.0 as usize].sealed = false;
        classes[ClassId::OBJECT.0 as usize].is_abstract = false;
        classes[ClassId::CLOSURE.0 as usize].is_abstract = false;
        Self {
            classes: RwLock::new(classes),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= ClassId::FIRST_USER.0 as usize
    }

    /// Registers a class and returns its id. Used both for the initial program
    /// and for classes loaded later; the latter widens ranges of their
    /// ancestors and requires dependent stubs to be invalidated by the caller.
    pub fn load_class(&self, decl: ClassDecl) -> StubResult<ClassId> {
        let mut classes = self.classes.write();
        let superclass = decl
            .superclass
            .unwrap_or_else(|| SuperRef::raw(ClassId::OBJECT));
        let mut supers = vec![superclass];
        supers.extend(decl.interfaces);

        let mut ancestors = Vec::new();
        for sup in &supers {
            let Some(entry) = classes.get(sup.class.0 as usize) else {
                return Err(StubError::UnknownClass(sup.class));
            };
            if entry.placeholder {
                return Err(StubError::UnknownClass(sup.class));
            }
            ancestors.push(sup.class);
            ancestors.extend_from_slice(&entry.ancestors);
        }
        ancestors.sort_unstable();
        ancestors.dedup();

        let id = u32::try_from(classes.len())
            .map(ClassId)
            .map_err(|_| StubError::Emit("class table overflow".to_string()))?;
        debug!(class = %decl.name, id = id.0, "loading class");
        classes.push(ClassEntry {
            name: decl.name,
            supers,
            ancestors,
            type_parameter_count: decl.type_parameter_count,
            sealed: decl.sealed,
            is_abstract: decl.is_abstract,
            placeholder: false,
        });
        Ok(id)
    }

    pub fn name(&self, class: ClassId) -> Option<String> {
        self.classes
            .read()
            .get(class.0 as usize)
            .map(|entry| entry.name.clone())
    }

    pub fn type_parameter_count(&self, class: ClassId) -> usize {
        self.classes
            .read()
            .get(class.0 as usize)
            .map(|entry| entry.type_parameter_count)
            .unwrap_or(0)
    }

    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return true;
        }
        let classes = self.classes.read();
        classes
            .get(sub.0 as usize)
            .is_some_and(|entry| entry.ancestors.binary_search(&sup).is_ok())
    }

    /// Direct superclass and interfaces of `class`, in declaration order.
    pub fn direct_supertypes(&self, class: ClassId) -> Vec<SuperRef> {
        self.classes
            .read()
            .get(class.0 as usize)
            .map(|entry| entry.supers.clone())
            .unwrap_or_default()
    }

    fn compute_ranges(classes: &[ClassEntry], target: ClassId) -> CidRanges {
        // Abstract subclasses are folded into the ranges: no instance can carry
        // their id, so covering them only helps merging.
        let is_member = |index: usize| {
            let id = ClassId(index as u32);
            let entry = &classes[index];
            !entry.placeholder
                && (id == target || entry.ancestors.binary_search(&target).is_ok())
        };

        let mut ranges = CidRanges::new();
        let mut current: Option<(CidRange, bool)> = None;
        for index in 0..classes.len() {
            if !is_member(index) {
                if let Some((range, true)) = current.take() {
                    ranges.push(range);
                }
                continue;
            }
            let id = ClassId(index as u32);
            let concrete = !classes[index].is_abstract;
            current = Some(match current {
                Some((range, has_concrete)) => {
                    (CidRange::new(range.lo, id), has_concrete || concrete)
                }
                None => (CidRange::single(id), concrete),
            });
        }
        if let Some((range, true)) = current {
            ranges.push(range);
        }
        ranges
    }
}

impl HierarchyOracle for ClassTable {
    fn class_info(&self, class: ClassId) -> Option<ClassInfo> {
        let classes = self.classes.read();
        let entry = classes.get(class.0 as usize)?;
        if entry.placeholder {
            return None;
        }
        Some(ClassInfo {
            id: class,
            name: entry.name.clone(),
            is_sealed: entry.sealed,
            is_abstract: entry.is_abstract,
            type_parameter_count: entry.type_parameter_count,
            ranges: Self::compute_ranges(&classes, class),
        })
    }
}
