//! The canonical object memory shape.
//!
//! Every heap object starts with one pointer to its vtable header. The
//! vtable header's first word is the owning type, followed by the array of
//! virtual function pointers. Arrays and strings keep a native-int length
//! right after the object header, with their payload after that.
//!
//! An interface-typed value is a fat pointer: the address of the
//! interface's slot run inside the implementer's vtable, then the object
//! pointer. It is never a single word.

pub const POINTER_SIZE: u32 = 8;

/// Offset 0 of every object: the vtable header pointer.
pub const OBJECT_HEADER_SIZE: u32 = POINTER_SIZE;

/// Offset of the owning-type pointer inside a vtable header.
pub const VTABLE_TYPE_OFFSET: u32 = 0;
/// Offset of the first virtual-function slot inside a vtable header.
pub const VTABLE_FUNCS_OFFSET: u32 = POINTER_SIZE;

/// Offset of the native-int length field of arrays and strings.
pub const ARRAY_LENGTH_OFFSET: u32 = OBJECT_HEADER_SIZE;
/// Offset of the first array element.
pub const ARRAY_ELEMENTS_OFFSET: u32 = OBJECT_HEADER_SIZE + POINTER_SIZE;

/// Offset of the first UTF-16 code unit of a string object.
pub const STRING_CHARS_OFFSET: u32 = OBJECT_HEADER_SIZE + POINTER_SIZE;

/// Reads the vtable header pointer of a live object.
///
/// # Safety
/// `object` must point at a live object allocated through the GC ABI.
pub unsafe fn object_vtable(object: usize) -> usize {
	std::ptr::read(object as *const usize)
}

/// Reads the owning type pointer out of a live object's vtable header.
///
/// # Safety
/// `object` must point at a live object allocated through the GC ABI.
pub unsafe fn object_type_ptr(object: usize) -> usize {
	let vtable = object_vtable(object);
	std::ptr::read((vtable + VTABLE_TYPE_OFFSET as usize) as *const usize)
}
