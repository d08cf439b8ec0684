use std::mem::offset_of;

use crate::hierarchy::ClassId;
use crate::types::{RawType, Type};

/// Header at offset 0 of every heap instance.
#[repr(C)]
#[derive(Debug)]
pub struct InstanceHeader {
    pub class_id: u32,
    _reserved: u32,
    pub runtime_type: *const RawType,
}

impl InstanceHeader {
    pub const CLASS_ID_OFFSET: i32 = offset_of!(InstanceHeader, class_id) as i32;
    pub const RUNTIME_TYPE_OFFSET: i32 = offset_of!(InstanceHeader, runtime_type) as i32;
}

/// A heap instance. The header holds a pointer into `ty`, which the instance
/// keeps alive.
#[repr(C)]
#[derive(Debug)]
pub struct Instance {
    header: InstanceHeader,
    ty: Type,
}

// The raw pointer in the header aliases `ty`, which is itself `Send + Sync`.
unsafe impl Send for Instance {}
unsafe impl Sync for Instance {}

impl Instance {
    /// Allocates an instance whose runtime type is `ty`. `ty` must be a
    /// non-nullable class type; its class id becomes the header class id.
    pub fn new(ty: &Type) -> Box<Self> {
        Self::with_class(ty.class_id(), ty)
    }

    /// A closure object whose runtime type is the function type `fn_type`.
    pub fn closure(fn_type: &Type) -> Box<Self> {
        Self::with_class(ClassId::CLOSURE, fn_type)
    }

    fn with_class(class: ClassId, ty: &Type) -> Box<Self> {
        Box::new(Self {
            header: InstanceHeader {
                class_id: class.0,
                _reserved: 0,
                runtime_type: ty.raw_ptr(),
            },
            ty: ty.clone(),
        })
    }

    pub fn class_id(&self) -> ClassId {
        ClassId(self.header.class_id)
    }

    pub fn runtime_type(&self) -> &Type {
        &self.ty
    }

    pub fn header_ptr(&self) -> *const InstanceHeader {
        &self.header
    }
}

/// Pointer handed to stubs; `None` is the null value.
pub fn instance_ptr(instance: Option<&Instance>) -> *const InstanceHeader {
    instance.map_or(std::ptr::null(), Instance::header_ptr)
}
