//! Typed data channels carried between nodes.

use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;

use crate::buffer::{ManagedBuffer, TypeDescriptor};
use crate::device::{DeviceAllocation, DevicePtr};
use crate::util::{CheckStatus, Error, Result, Vec3};

/// Per-point data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// Hit position, `Vec3`
    Xyz,
    /// Distance from the ray origin, `f32`
    Distance,
    /// Non-zero when the ray hit geometry, `i32`
    IsHit,
    /// Index of the ray that produced the point, `u32`
    RayIdx,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Xyz, Field::Distance, Field::IsHit, Field::RayIdx];

    pub const fn name(self) -> &'static str {
        match self {
            Field::Xyz => "XYZ_F32",
            Field::Distance => "DISTANCE_F32",
            Field::IsHit => "IS_HIT_I32",
            Field::RayIdx => "RAY_IDX_U32",
        }
    }

    /// Element type stored for this field.
    pub fn type_descriptor(self) -> TypeDescriptor {
        match self {
            Field::Xyz => TypeDescriptor::of::<Vec3>(),
            Field::Distance => TypeDescriptor::of::<f32>(),
            Field::IsHit => TypeDescriptor::of::<i32>(),
            Field::RayIdx => TypeDescriptor::of::<u32>(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile-time binding of a [`Field`] to its element type.
pub trait TypedField {
    const FIELD: Field;
    type Type: Pod;
}

macro_rules! typed_field {
    ($(#[$doc:meta])* $name:ident, $field:expr, $ty:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl TypedField for $name {
            const FIELD: Field = $field;
            type Type = $ty;
        }
    };
}

typed_field!(
    /// [`Field::Xyz`]
    XyzF32, Field::Xyz, Vec3);
typed_field!(
    /// [`Field::Distance`]
    DistanceF32, Field::Distance, f32);
typed_field!(
    /// [`Field::IsHit`]
    IsHitI32, Field::IsHit, i32);
typed_field!(
    /// [`Field::RayIdx`]
    RayIdxU32, Field::RayIdx, u32);

/// Read-only view of one field's device data.
///
/// Holds a reference to the producer's allocation, so the address stays
/// valid even if the producer reallocates on a later schedule.
#[derive(Clone)]
pub struct FieldView {
    field: Field,
    ty: TypeDescriptor,
    allocation: Option<Arc<DeviceAllocation>>,
    count: usize,
}

impl FieldView {
    pub(crate) fn new(field: Field, buffer: &ManagedBuffer) -> Self {
        Self {
            field,
            ty: buffer.type_descriptor(),
            allocation: buffer.allocation().cloned(),
            count: buffer.len(),
        }
    }

    #[inline]
    pub fn field(&self) -> Field {
        self.field
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.allocation
            .as_ref()
            .map_or(DevicePtr::NULL, |alloc| alloc.device_ptr())
    }

    /// Copy the elements to the host.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        if !self.ty.is::<T>() {
            return Err(Error::TypeMismatch {
                expected: self.ty.name,
                actual: std::any::type_name::<T>(),
            });
        }
        let mut out = vec![T::zeroed(); self.count];
        if let Some(alloc) = &self.allocation {
            let bytes = self.count * self.ty.size;
            // SAFETY: the allocation holds at least `count` elements.
            unsafe {
                alloc
                    .device()
                    .memcpy(DevicePtr::from_host(out.as_mut_ptr()), alloc.device_ptr(), bytes)
            }
            .checked("FieldView::to_vec")?;
        }
        Ok(out)
    }

    /// Copy the elements to the host as `F::Type`.
    pub fn read<F: TypedField>(&self) -> Result<Vec<F::Type>> {
        if F::FIELD != self.field {
            return Err(Error::invalid_argument(format!(
                "view holds {}, not {}",
                self.field,
                F::FIELD
            )));
        }
        self.to_vec::<F::Type>()
    }
}

impl fmt::Debug for FieldView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldView")
            .field("field", &self.field)
            .field("count", &self.count)
            .field("ptr", &self.device_ptr())
            .finish()
    }
}
