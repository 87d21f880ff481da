//! Primitive type tags.
//!
//! The tag set is closed: primitives plus opaque pointers. Tags travel on the
//! wire (as `u32`) and drive both sides of the dynamic call engine, so the
//! values are part of the wire format and must not be reordered.

use std::ptr::addr_of_mut;

use libffi::raw;

/// A primitive C type or opaque pointer, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    Void = 0,
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
    Pointer = 11,
}

impl TypeTag {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Void,
            1 => Self::U8,
            2 => Self::I8,
            3 => Self::U16,
            4 => Self::I16,
            5 => Self::U32,
            6 => Self::I32,
            7 => Self::U64,
            8 => Self::I64,
            9 => Self::F32,
            10 => Self::F64,
            11 => Self::Pointer,
            _ => return None,
        })
    }

    /// Marshalled size in bytes. `Void` occupies no storage.
    pub fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 | Self::Pointer => 8,
        }
    }

    /// The libffi ABI descriptor for this tag.
    pub fn ffi_type(self) -> *mut raw::ffi_type {
        // SAFETY: taking the address of libffi's static type descriptors;
        // libffi never mutates them after load.
        unsafe {
            match self {
                Self::Void => addr_of_mut!(raw::ffi_type_void),
                Self::U8 => addr_of_mut!(raw::ffi_type_uint8),
                Self::I8 => addr_of_mut!(raw::ffi_type_sint8),
                Self::U16 => addr_of_mut!(raw::ffi_type_uint16),
                Self::I16 => addr_of_mut!(raw::ffi_type_sint16),
                Self::U32 => addr_of_mut!(raw::ffi_type_uint32),
                Self::I32 => addr_of_mut!(raw::ffi_type_sint32),
                Self::U64 => addr_of_mut!(raw::ffi_type_uint64),
                Self::I64 => addr_of_mut!(raw::ffi_type_sint64),
                Self::F32 => addr_of_mut!(raw::ffi_type_float),
                Self::F64 => addr_of_mut!(raw::ffi_type_double),
                Self::Pointer => addr_of_mut!(raw::ffi_type_pointer),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(TypeTag::Void as u32, 0);
        assert_eq!(TypeTag::U8 as u32, 1);
        assert_eq!(TypeTag::I8 as u32, 2);
        assert_eq!(TypeTag::U16 as u32, 3);
        assert_eq!(TypeTag::I16 as u32, 4);
        assert_eq!(TypeTag::U32 as u32, 5);
        assert_eq!(TypeTag::I32 as u32, 6);
        assert_eq!(TypeTag::U64 as u32, 7);
        assert_eq!(TypeTag::I64 as u32, 8);
        assert_eq!(TypeTag::F32 as u32, 9);
        assert_eq!(TypeTag::F64 as u32, 10);
        assert_eq!(TypeTag::Pointer as u32, 11);
    }

    #[test]
    fn round_trip_from_raw() {
        for raw in 0..12 {
            assert_eq!(TypeTag::from_raw(raw).unwrap() as u32, raw);
        }
        assert_eq!(TypeTag::from_raw(12), None);
    }

    #[test]
    fn sizes_match_the_abi() {
        assert_eq!(TypeTag::Void.size(), 0);
        assert_eq!(TypeTag::U8.size(), 1);
        assert_eq!(TypeTag::I16.size(), 2);
        assert_eq!(TypeTag::F32.size(), 4);
        assert_eq!(TypeTag::I32.size(), 4);
        assert_eq!(TypeTag::U64.size(), 8);
        assert_eq!(TypeTag::F64.size(), 8);
        assert_eq!(TypeTag::Pointer.size(), std::mem::size_of::<*const ()>());
    }

    #[test]
    fn ffi_descriptors_agree_on_size() {
        for raw in 1..12 {
            let tag = TypeTag::from_raw(raw).unwrap();
            // SAFETY: reading a field of libffi's static descriptors.
            let ffi_size = unsafe { (*tag.ffi_type()).size };
            assert_eq!(ffi_size, tag.size(), "tag {tag:?}");
        }
    }
}
