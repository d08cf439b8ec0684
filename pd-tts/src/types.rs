//! Canonical type descriptors.
//!
//! Every [`Type`] is created by a [`TypeTable`] and is therefore canonical:
//! structurally equal types share one allocation, and identity comparison is a
//! pointer comparison. The allocation starts with a `#[repr(C)]` [`RawType`]
//! header that generated stubs read directly.

use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use crate::error::{StubError, StubResult};
use crate::hierarchy::{ClassId, ClassTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawKind {
    Dynamic = 0,
    Void = 1,
    Never = 2,
    Null = 3,
    Class = 4,
    Function = 5,
    Parameter = 6,
}

/// Machine-visible header of a type descriptor.
#[repr(C)]
#[derive(Debug)]
pub struct RawType {
    pub class_id: u32,
    pub nullable: u8,
    pub kind: u8,
    _reserved: u16,
    pub arg_count: u32,
    pub type_id: u32,
    pub args: *const *const RawType,
}

impl RawType {
    pub const CLASS_ID_OFFSET: i32 = offset_of!(RawType, class_id) as i32;
    pub const NULLABLE_OFFSET: i32 = offset_of!(RawType, nullable) as i32;
    pub const ARG_COUNT_OFFSET: i32 = offset_of!(RawType, arg_count) as i32;
    pub const ARGS_OFFSET: i32 = offset_of!(RawType, args) as i32;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Dynamic,
    Void,
    Never,
    Null,
    Class { class: ClassId, args: Vec<Type> },
    Function { params: Vec<Type>, ret: Type },
    Parameter(u32),
}

#[repr(C)]
struct TypeInner {
    raw: RawType,
    kind: TypeKind,
    name: String,
    // Backing storage for `raw.args`.
    arg_ptrs: Box<[*const RawType]>,
}

// The descriptor is immutable after construction and the pointers only refer
// to other canonical types kept alive through `kind`.
unsafe impl Send for TypeInner {}
unsafe impl Sync for TypeInner {}

#[derive(Clone)]
pub struct Type(Arc<TypeInner>);

impl Type {
    pub fn id(&self) -> TypeId {
        TypeId(self.0.raw.type_id)
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_nullable(&self) -> bool {
        self.0.raw.nullable != 0
    }

    /// Class id as seen by generated code; `ClassId::ILLEGAL` for function types
    /// and type parameters.
    pub fn class_id(&self) -> ClassId {
        ClassId(self.0.raw.class_id)
    }

    pub fn class(&self) -> Option<ClassId> {
        match &self.0.kind {
            TypeKind::Class { class, .. } => Some(*class),
            _ => None,
        }
    }

    pub fn type_args(&self) -> &[Type] {
        match &self.0.kind {
            TypeKind::Class { args, .. } => args,
            _ => &[],
        }
    }

    /// Top types accept every value, including null.
    pub fn is_top(&self) -> bool {
        match &self.0.kind {
            TypeKind::Dynamic | TypeKind::Void => true,
            TypeKind::Class { class, .. } => *class == ClassId::OBJECT && self.is_nullable(),
            _ => false,
        }
    }

    pub fn is_object(&self) -> bool {
        self.class() == Some(ClassId::OBJECT)
    }

    pub fn raw_ptr(&self) -> *const RawType {
        Arc::as_ptr(&self.0) as *const RawType
    }

    /// Address of the descriptor, the value identity checks compare against.
    pub fn address(&self) -> u64 {
        self.raw_ptr() as usize as u64
    }

    /// Recovers the canonical type behind a descriptor pointer handed out by
    /// [`Type::raw_ptr`].
    ///
    /// # Safety
    /// `raw` must be null or come from `raw_ptr` of a type that is still alive.
    pub unsafe fn from_raw(raw: *const RawType) -> Option<Type> {
        if raw.is_null() {
            return None;
        }
        let inner = raw as *const TypeInner;
        unsafe {
            Arc::increment_strong_count(inner);
            Some(Type(Arc::from_raw(inner)))
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Type {}

impl std::hash::Hash for Type {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.raw.type_id)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum KeyKind {
    Dynamic,
    Void,
    Never,
    Null,
    Class(ClassId, Vec<TypeId>),
    Function(Vec<TypeId>, TypeId),
    Parameter(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TypeKey {
    kind: KeyKind,
    nullable: bool,
}

/// Interning table for canonical types.
pub struct TypeTable {
    classes: Arc<ClassTable>,
    interned: DashMap<TypeKey, Type>,
    next_id: AtomicU32,
}

impl TypeTable {
    pub fn new(classes: Arc<ClassTable>) -> Self {
        Self {
            classes,
            interned: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    pub fn dynamic(&self) -> Type {
        self.intern(TypeKind::Dynamic, true)
    }

    pub fn void(&self) -> Type {
        self.intern(TypeKind::Void, true)
    }

    pub fn never(&self) -> Type {
        self.intern(TypeKind::Never, false)
    }

    pub fn null(&self) -> Type {
        self.intern(TypeKind::Null, true)
    }

    pub fn object(&self) -> Type {
        self.intern(
            TypeKind::Class {
                class: ClassId::OBJECT,
                args: Vec::new(),
            },
            false,
        )
    }

    pub fn object_nullable(&self) -> Type {
        self.nullable(&self.object())
    }

    /// `class<args>`; an empty `args` on a generic class instantiates every
    /// parameter with `dynamic`.
    pub fn class(&self, class: ClassId, args: Vec<Type>) -> StubResult<Type> {
        let Some(name) = self.classes.name(class) else {
            return Err(StubError::UnknownClass(class));
        };
        if !class.is_user_class() && class != ClassId::OBJECT && class != ClassId::CLOSURE {
            return Err(StubError::UnknownClass(class));
        }
        let expected = self.classes.type_parameter_count(class);
        let args = if args.is_empty() && expected > 0 {
            vec![self.dynamic(); expected]
        } else {
            args
        };
        if args.len() != expected {
            return Err(StubError::Emit(format!(
                "class {name} expects {expected} type arguments, got {}",
                args.len()
            )));
        }
        Ok(self.intern(TypeKind::Class { class, args }, false))
    }

    pub fn function(&self, params: Vec<Type>, ret: Type) -> Type {
        self.intern(TypeKind::Function { params, ret }, false)
    }

    pub fn parameter(&self, index: u32) -> Type {
        self.intern(TypeKind::Parameter(index), false)
    }

    pub fn nullable(&self, ty: &Type) -> Type {
        match ty.kind() {
            TypeKind::Never => self.null(),
            _ if ty.is_nullable() => ty.clone(),
            kind => self.intern(kind.clone(), true),
        }
    }

    pub fn non_nullable(&self, ty: &Type) -> Type {
        match ty.kind() {
            TypeKind::Dynamic | TypeKind::Void => ty.clone(),
            TypeKind::Null => self.never(),
            _ if !ty.is_nullable() => ty.clone(),
            kind => self.intern(kind.clone(), false),
        }
    }

    fn intern(&self, kind: TypeKind, nullable: bool) -> Type {
        let nullable = match kind {
            TypeKind::Dynamic | TypeKind::Void | TypeKind::Null => true,
            _ => nullable,
        };
        let key = TypeKey {
            kind: key_kind(&kind),
            nullable,
        };
        if let Some(existing) = self.interned.get(&key) {
            return existing.clone();
        }
        self.interned
            .entry(key)
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.build(kind, nullable, id)
            })
            .clone()
    }

    fn build(&self, kind: TypeKind, nullable: bool, id: u32) -> Type {
        let (raw_kind, class_id) = match &kind {
            TypeKind::Dynamic => (RawKind::Dynamic, ClassId::DYNAMIC),
            TypeKind::Void => (RawKind::Void, ClassId::VOID),
            TypeKind::Never => (RawKind::Never, ClassId::NEVER),
            TypeKind::Null => (RawKind::Null, ClassId::NULL),
            TypeKind::Class { class, .. } => (RawKind::Class, *class),
            TypeKind::Function { .. } => (RawKind::Function, ClassId::ILLEGAL),
            TypeKind::Parameter(_) => (RawKind::Parameter, ClassId::ILLEGAL),
        };
        let arg_ptrs: Box<[*const RawType]> = match &kind {
            TypeKind::Class { args, .. } => args.iter().map(Type::raw_ptr).collect(),
            _ => Box::new([]),
        };
        let args_ptr = if arg_ptrs.is_empty() {
            std::ptr::null()
        } else {
            arg_ptrs.as_ptr()
        };
        let name = self.display_name(&kind, nullable);
        Type(Arc::new(TypeInner {
            raw: RawType {
                class_id: class_id.0,
                nullable: u8::from(nullable),
                kind: raw_kind as u8,
                _reserved: 0,
                arg_count: arg_ptrs.len() as u32,
                type_id: id,
                args: args_ptr,
            },
            kind,
            name,
            arg_ptrs,
        }))
    }

    fn display_name(&self, kind: &TypeKind, nullable: bool) -> String {
        let base = match kind {
            TypeKind::Dynamic => return "dynamic".to_string(),
            TypeKind::Void => return "void".to_string(),
            TypeKind::Null => return "Null".to_string(),
            TypeKind::Never => "Never".to_string(),
            TypeKind::Class { class, args } => {
                let name = self
                    .classes
                    .name(*class)
                    .unwrap_or_else(|| class.to_string());
                if args.is_empty() {
                    name
                } else {
                    let args: Vec<&str> = args.iter().map(Type::name).collect();
                    format!("{name}<{}>", args.join(", "))
                }
            }
            TypeKind::Function { params, ret } => {
                let params: Vec<&str> = params.iter().map(Type::name).collect();
                format!("({}) -> {}", params.join(", "), ret.name())
            }
            TypeKind::Parameter(index) => format!("T{index}"),
        };
        if nullable {
            if matches!(kind, TypeKind::Function { .. }) {
                format!("({base})?")
            } else {
                format!("{base}?")
            }
        } else {
            base
        }
    }
}

fn key_kind(kind: &TypeKind) -> KeyKind {
    match kind {
        TypeKind::Dynamic => KeyKind::Dynamic,
        TypeKind::Void => KeyKind::Void,
        TypeKind::Never => KeyKind::Never,
        TypeKind::Null => KeyKind::Null,
        TypeKind::Class { class, args } => {
            KeyKind::Class(*class, args.iter().map(Type::id).collect())
        }
        TypeKind::Function { params, ret } => {
            KeyKind::Function(params.iter().map(Type::id).collect(), ret.id())
        }
        TypeKind::Parameter(index) => KeyKind::Parameter(*index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassDecl;

    fn table_with_list() -> (TypeTable, ClassId, ClassId) {
        let classes = Arc::new(ClassTable::new());
        let list = classes
            .load_class(ClassDecl::new("List").sealed().type_params(1))
            .expect("load");
        let circle = classes
            .load_class(ClassDecl::new("Circle").sealed())
            .expect("load");
        (TypeTable::new(classes), list, circle)
    }

    #[test]
    fn structurally_equal_types_are_identical() {
        let (types, list, circle) = table_with_list();
        let circle_ty = types.class(circle, Vec::new()).expect("circle");
        let a = types.class(list, vec![circle_ty.clone()]).expect("list");
        let b = types.class(list, vec![circle_ty]).expect("list");
        assert_eq!(a, b);
        assert_eq!(a.raw_ptr(), b.raw_ptr());
        assert_eq!(a.name(), "List<Circle>");
    }

    #[test]
    fn raw_header_exposes_arguments() {
        let (types, list, circle) = table_with_list();
        let circle_ty = types.class(circle, Vec::new()).expect("circle");
        let list_ty = types.class(list, vec![circle_ty.clone()]).expect("list");
        let raw = unsafe { &*list_ty.raw_ptr() };
        assert_eq!(raw.class_id, list.0);
        assert_eq!(raw.arg_count, 1);
        let first = unsafe { *raw.args };
        assert_eq!(first, circle_ty.raw_ptr());
        let recovered = unsafe { Type::from_raw(first) }.expect("type");
        assert_eq!(recovered, circle_ty);
    }

    #[test]
    fn raw_generic_class_is_instantiated_with_dynamic() {
        let (types, list, _) = table_with_list();
        let raw_list = types.class(list, Vec::new()).expect("list");
        assert_eq!(raw_list.type_args(), &[types.dynamic()]);
    }

    #[test]
    fn nullability_normalizes() {
        let (types, _, circle) = table_with_list();
        let circle_ty = types.class(circle, Vec::new()).expect("circle");
        let nullable = types.nullable(&circle_ty);
        assert!(nullable.is_nullable());
        assert_eq!(types.nullable(&nullable), nullable);
        assert_eq!(types.non_nullable(&nullable), circle_ty);
        assert_eq!(types.nullable(&types.never()), types.null());
        assert!(types.object_nullable().is_top());
        assert!(!types.object().is_top());
        assert_eq!(nullable.name(), "Circle?");
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let (types, list, circle) = table_with_list();
        let circle_ty = types.class(circle, Vec::new()).expect("circle");
        assert!(
            types
                .class(list, vec![circle_ty.clone(), circle_ty])
                .is_err()
        );
    }
}
