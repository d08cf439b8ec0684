//! The general subtype test every stub falls back to.
//!
//! Generated code never calls Rust directly: it tail-jumps through the
//! slow-path slot of the [`ThreadSlots`] block it receives as its third
//! argument. The slot holds [`slow_type_test`], which forwards to the
//! [`GeneralSubtypeTest`] entered on the current thread.

use std::cell::{Cell, RefCell};
use std::mem::offset_of;
use std::sync::Arc;

use crate::error::{StubError, StubResult};
use crate::hierarchy::{ClassId, ClassTable, SuperArg};
use crate::object::InstanceHeader;
use crate::types::{RawType, Type, TypeKind, TypeTable};

/// Per-thread block passed to every stub.
#[repr(C)]
pub struct ThreadSlots {
    slow_type_test_entry: Cell<usize>,
    slow_path_calls: Cell<u64>,
}

impl ThreadSlots {
    pub const SLOW_TYPE_TEST_ENTRY_OFFSET: i32 =
        offset_of!(ThreadSlots, slow_type_test_entry) as i32;

    fn new() -> Self {
        Self {
            slow_type_test_entry: Cell::new(slow_type_test_entry()),
            slow_path_calls: Cell::new(0),
        }
    }

    /// The block of the calling thread. Valid for as long as the thread runs.
    pub fn current() -> *const ThreadSlots {
        THREAD_SLOTS.with(|slots| slots as *const ThreadSlots)
    }

    /// Number of slow-path entries taken on the calling thread.
    pub fn slow_path_calls() -> u64 {
        THREAD_SLOTS.with(|slots| slots.slow_path_calls.get())
    }

    pub fn entry(&self) -> usize {
        self.slow_type_test_entry.get()
    }
}

/// Address stubs jump to when no fast check decides.
pub fn slow_type_test_entry() -> usize {
    slow_type_test as extern "C" fn(_, _, _) -> u32 as usize
}

/// Full subtype algorithm, consulted only on the slow path.
pub trait GeneralSubtypeTest: Send + Sync {
    fn is_subtype(&self, sub: &Type, sup: &Type) -> bool;

    /// `runtime_type` is `None` for the null value.
    fn is_instance_of(&self, runtime_type: Option<&Type>, ty: &Type) -> bool;
}

thread_local! {
    static THREAD_SLOTS: ThreadSlots = ThreadSlots::new();
    static SLOW_PATH_TESTER: RefCell<Option<Arc<dyn GeneralSubtypeTest>>> = const { RefCell::new(None) };
    static SLOW_PATH_ERROR: RefCell<Option<StubError>> = const { RefCell::new(None) };
}

/// Installs `tester` for the current thread until the scope is dropped.
pub struct SlowPathScope {
    previous: Option<Arc<dyn GeneralSubtypeTest>>,
}

impl SlowPathScope {
    pub fn enter(tester: Arc<dyn GeneralSubtypeTest>) -> Self {
        let previous = SLOW_PATH_TESTER.with(|slot| slot.borrow_mut().replace(tester));
        clear_slow_path_error();
        Self { previous }
    }
}

impl Drop for SlowPathScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        SLOW_PATH_TESTER.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

fn clear_slow_path_error() {
    SLOW_PATH_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

fn set_slow_path_error(error: StubError) {
    SLOW_PATH_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(error);
    });
}

/// Error recorded by the last slow-path entry on this thread, if any.
pub fn take_slow_path_error() -> StubResult<()> {
    match SLOW_PATH_ERROR.with(|slot| slot.borrow_mut().take()) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

pub extern "C" fn slow_type_test(
    instance: *const InstanceHeader,
    ty: *const RawType,
    slots: *const ThreadSlots,
) -> u32 {
    if !slots.is_null() {
        let slots = unsafe { &*slots };
        slots.slow_path_calls.set(slots.slow_path_calls.get() + 1);
    }
    let Some(target) = (unsafe { Type::from_raw(ty) }) else {
        set_slow_path_error(StubError::Emit(
            "slow type test received a null type descriptor".to_string(),
        ));
        return 0;
    };
    let runtime_type = if instance.is_null() {
        None
    } else {
        let header = unsafe { &*instance };
        unsafe { Type::from_raw(header.runtime_type) }
    };

    let verdict = SLOW_PATH_TESTER.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|tester| tester.is_instance_of(runtime_type.as_ref(), &target))
    });
    match verdict {
        Some(true) => 1,
        Some(false) => 0,
        None => {
            set_slow_path_error(StubError::Link(format!(
                "slow type test for {target} reached without an active subtype tester"
            )));
            0
        }
    }
}

/// Reference subtype algorithm over a [`ClassTable`].
pub struct SubtypeTester {
    classes: Arc<ClassTable>,
    types: Arc<TypeTable>,
}

impl SubtypeTester {
    pub fn new(classes: Arc<ClassTable>, types: Arc<TypeTable>) -> Self {
        Self { classes, types }
    }

    /// Arguments of `target` when `class<args>` is viewed as an instance of
    /// it, following the superclass and interface chain.
    fn instantiate_as(&self, class: ClassId, args: &[Type], target: ClassId) -> Option<Vec<Type>> {
        if class == target {
            return Some(args.to_vec());
        }
        if !self.classes.is_subclass(class, target) {
            return None;
        }
        for sup in self.classes.direct_supertypes(class) {
            let arity = self.classes.type_parameter_count(sup.class);
            let sup_args: Vec<Type> = if sup.args.is_empty() {
                vec![self.types.dynamic(); arity]
            } else {
                sup.args
                    .iter()
                    .map(|arg| match arg {
                        SuperArg::Param(index) => args
                            .get(*index)
                            .cloned()
                            .unwrap_or_else(|| self.types.dynamic()),
                        SuperArg::Fixed(ty) => ty.clone(),
                    })
                    .collect()
            };
            if let Some(found) = self.instantiate_as(sup.class, &sup_args, target) {
                return Some(found);
            }
        }
        None
    }
}

impl GeneralSubtypeTest for SubtypeTester {
    fn is_subtype(&self, sub: &Type, sup: &Type) -> bool {
        if sub == sup || sup.is_top() {
            return true;
        }
        match sub.kind() {
            TypeKind::Never => return true,
            TypeKind::Dynamic | TypeKind::Void => return false,
            TypeKind::Null => return sup.is_nullable(),
            _ => {}
        }
        if sub.is_nullable() && !sup.is_nullable() {
            return false;
        }
        match (sub.kind(), sup.kind()) {
            (_, TypeKind::Never | TypeKind::Null) => false,
            (_, TypeKind::Class { class, .. }) if *class == ClassId::OBJECT => true,
            (TypeKind::Function { .. }, TypeKind::Class { class, .. }) => *class == ClassId::CLOSURE,
            (
                TypeKind::Class { class, args },
                TypeKind::Class {
                    class: sup_class,
                    args: sup_args,
                },
            ) => match self.instantiate_as(*class, args, *sup_class) {
                Some(found) => found
                    .iter()
                    .zip(sup_args)
                    .all(|(arg, sup_arg)| self.is_subtype(arg, sup_arg)),
                None => false,
            },
            (
                TypeKind::Function { params, ret },
                TypeKind::Function {
                    params: sup_params,
                    ret: sup_ret,
                },
            ) => {
                params.len() == sup_params.len()
                    && sup_params
                        .iter()
                        .zip(params)
                        .all(|(sup_param, param)| self.is_subtype(sup_param, param))
                    && self.is_subtype(ret, sup_ret)
            }
            (TypeKind::Parameter(a), TypeKind::Parameter(b)) => a == b,
            _ => false,
        }
    }

    fn is_instance_of(&self, runtime_type: Option<&Type>, ty: &Type) -> bool {
        match runtime_type {
            Some(runtime_type) => self.is_subtype(runtime_type, ty),
            None => self.is_subtype(&self.types.null(), ty),
        }
    }
}
