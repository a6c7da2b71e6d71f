use bumpalo::Bump;

use crate::metadata::LoadError;
use crate::metadata::types::{FillState, StackType, Type, TypeKind, TypeLayout, POINTER_SIZE};
use crate::utilities::align_up;

/// Header of every heap object: one pointer to the vtable header.
pub const OBJECT_HEADER_SIZE: u32 = POINTER_SIZE;

/// Class-layout directives for a type with an explicit layout record.
#[derive(Debug, Clone)]
pub(crate) struct ExplicitLayout<'a> {
	pub packing: u16,
	pub class_size: u32,
	/// Explicit byte offset per field row, aligned with the type's field list.
	pub offsets: &'a [Option<u32>],
}

/// Size, alignment and reference-ness of a field slot inside a layout.
fn field_slot(ty: &Type) -> Result<(u32, u32, bool), LoadError> {
	match ty.kind() {
		TypeKind::Class | TypeKind::Interface | TypeKind::Array => Ok((POINTER_SIZE, POINTER_SIZE, true)),
		TypeKind::Pointer => Ok((POINTER_SIZE, POINTER_SIZE, false)),
		TypeKind::ByRef => Err(LoadError::BadFormat("by-ref types cannot be field types")),
		TypeKind::GenericParameter => Err(LoadError::CheckFailed("open generic type in a closed layout")),
		TypeKind::ValueType => {
			if ty.fill_state.get() == FillState::Filling {
				return Err(LoadError::BadFormat("value type layout cycle"));
			}
			let layout = ty.layout()
				.ok_or(LoadError::CheckFailed("embedded value type has no layout"))?;
			Ok((layout.stack_size, layout.stack_align, false))
		},
	}
}

/// Computes and freezes the layout of `ty`. Value-type fields must already
/// be laid out; the fill driver guarantees the ordering.
pub(crate) fn compute_type_layout<'l>(
	bump: &'l Bump,
	ty: &'l Type<'l>,
	explicit: Option<ExplicitLayout>,
) -> Result<(), LoadError> {
	debug_assert!(ty.layout.get().is_none());

	match ty.kind() {
		TypeKind::Interface => {
			ty.layout.set(Some(TypeLayout {
				stack_size: POINTER_SIZE,
				stack_align: POINTER_SIZE,
				managed_size: OBJECT_HEADER_SIZE,
				managed_align: POINTER_SIZE,
				stack_type: StackType::Object,
			}));
			Ok(())
		},
		TypeKind::ValueType => compute_value_type_layout(bump, ty, explicit),
		TypeKind::Class => compute_class_layout(bump, ty),
		_ => Err(LoadError::CheckFailed("derived types are laid out at creation")),
	}
}

fn compute_value_type_layout<'l>(
	bump: &'l Bump,
	ty: &'l Type<'l>,
	explicit: Option<ExplicitLayout>,
) -> Result<(), LoadError> {
	let mut size = 0u32;
	let mut align = 1u32;
	let mut pointer_offsets = vec![];
	// (offset, size, holds_references) per placed field, for overlap checks.
	let mut placed: Vec<(u32, u32, bool)> = vec![];

	let packing = match &explicit {
		Some(layout) if layout.packing != 0 => layout.packing as u32,
		_ => POINTER_SIZE,
	};

	for (index, field) in ty.fields().iter().enumerate() {
		if field.is_static() {
			continue;
		}
		let field_ty = field.ty.get().ok_or(LoadError::CheckFailed("field type unresolved"))?;
		let (slot_size, natural_align, is_ref) = field_slot(field_ty)?;
		let slot_align = natural_align.min(packing);

		// Sequential class-layout records carry packing/size but no offsets.
		let offset = match &explicit {
			Some(layout) if !layout.offsets.is_empty() => {
				layout.offsets.get(index).copied().flatten()
					.ok_or(LoadError::BadFormat("explicit layout is missing a field offset"))?
			},
			_ => align_up(size, slot_align),
		};

		field.offset.set(offset);
		placed.push((offset, slot_size, is_ref || !field_ty.managed_pointer_offsets().is_empty()));

		if is_ref {
			pointer_offsets.push(offset);
		} else {
			for inner in field_ty.managed_pointer_offsets() {
				pointer_offsets.push(offset + inner);
			}
		}

		size = size.max(offset + slot_size);
		align = align.max(slot_align);
	}

	if explicit.as_ref().is_some_and(|layout| !layout.offsets.is_empty()) {
		validate_explicit_overlaps(&pointer_offsets, &placed)?;
	}

	if let Some(layout) = &explicit {
		size = size.max(layout.class_size);
	}
	size = align_up(size.max(1), align);

	pointer_offsets.sort_unstable();
	pointer_offsets.dedup();

	let (stack_type, stack_size, stack_align) = match ty.primitive() {
		Some(primitive) => (primitive.stack_type(), primitive.size().max(1), primitive.size().max(1)),
		None if ty.is_enum() => {
			let underlying = ty.underlying_type();
			match underlying.primitive() {
				Some(primitive) => (primitive.stack_type(), primitive.size().max(1), primitive.size().max(1)),
				None => return Err(LoadError::BadFormat("enum without a primitive underlying field")),
			}
		},
		None => (StackType::ValueType, size, align),
	};

	ty.layout.set(Some(TypeLayout {
		stack_size,
		stack_align,
		managed_size: size,
		managed_align: align,
		stack_type,
	}));
	ty.managed_pointer_offsets.set(bump.alloc_slice_copy(&pointer_offsets));
	Ok(())
}

fn compute_class_layout<'l>(bump: &'l Bump, ty: &'l Type<'l>) -> Result<(), LoadError> {
	let (mut size, mut align, mut pointer_offsets) = match ty.parent() {
		Some(parent) if parent.kind() == TypeKind::Class => {
			let layout = parent.layout()
				.ok_or(LoadError::CheckFailed("parent class has no layout"))?;
			(layout.managed_size, layout.managed_align, parent.managed_pointer_offsets().to_vec())
		},
		_ => (OBJECT_HEADER_SIZE, POINTER_SIZE, vec![]),
	};

	for field in ty.fields() {
		if field.is_static() {
			continue;
		}
		let field_ty = field.ty.get().ok_or(LoadError::CheckFailed("field type unresolved"))?;
		let (slot_size, slot_align, is_ref) = field_slot(field_ty)?;

		let offset = align_up(size, slot_align);
		field.offset.set(offset);

		if is_ref {
			pointer_offsets.push(offset);
		} else {
			for inner in field_ty.managed_pointer_offsets() {
				pointer_offsets.push(offset + inner);
			}
		}

		size = offset + slot_size;
		align = align.max(slot_align);
	}

	pointer_offsets.sort_unstable();
	pointer_offsets.dedup();

	ty.layout.set(Some(TypeLayout {
		stack_size: POINTER_SIZE,
		stack_align: POINTER_SIZE,
		managed_size: align_up(size, align),
		managed_align: align,
		stack_type: StackType::Object,
	}));
	ty.managed_pointer_offsets.set(bump.alloc_slice_copy(&pointer_offsets));
	Ok(())
}

/// No managed pointer may share bytes with a field that does not hold the
/// same managed pointer, or the collector would scan arbitrary bits.
fn validate_explicit_overlaps(
	pointer_offsets: &[u32],
	placed: &[(u32, u32, bool)],
) -> Result<(), LoadError> {
	for pointer in pointer_offsets {
		let (start, end) = (*pointer, *pointer + POINTER_SIZE);
		for (offset, size, holds_references) in placed {
			if *holds_references {
				continue;
			}
			if *offset < end && start < *offset + *size {
				return Err(LoadError::BadFormat("managed pointer overlaps a non-pointer field"));
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use bumpalo::Bump;

	use crate::metadata::types::{Field, Primitive, TypePool};
	use crate::raw::heaps::BlobIndex;
	use crate::raw::indices::metadata_token::FieldToken;
	use crate::raw::tables::FieldAttributes;
	use super::*;

	fn make_field<'l>(bump: &'l Bump, name: &str, ty: &'l Type<'l>) -> &'l Field<'l> {
		bump.alloc(Field {
			token: FieldToken(0).into(),
			name: bump.alloc_str(name),
			flags: FieldAttributes::PUBLIC,
			signature: BlobIndex(0),
			declaring_type: Cell::new(None),
			ty: Cell::new(Some(ty)),
			offset: Cell::new(0),
		})
	}

	fn primitive_type<'l>(bump: &'l Bump, pool: &TypePool<'l>, primitive: Primitive) -> &'l Type<'l> {
		let ty = bump.alloc(Type::new(primitive.name(), "System", TypeKind::ValueType));
		ty.layout.set(Some(TypeLayout {
			stack_size: primitive.size().max(1),
			stack_align: primitive.size().max(1),
			managed_size: primitive.size().max(1),
			managed_align: primitive.size().max(1),
			stack_type: primitive.stack_type(),
		}));
		ty.fill_state.set(FillState::Filled);
		pool.register_primitive(primitive, ty);
		ty
	}

	#[test]
	fn auto_layout_places_fields_at_aligned_offsets() {
		let bump = Bump::new();
		let pool = TypePool::new(&bump);
		let int8 = primitive_type(&bump, &pool, Primitive::Int8);
		let int32 = primitive_type(&bump, &pool, Primitive::Int32);
		let int64 = primitive_type(&bump, &pool, Primitive::Int64);

		let ty = &*bump.alloc(Type::new("Packet", "Net", TypeKind::ValueType));
		let fields: Vec<_> = [("a", int8), ("b", int32), ("c", int64), ("d", int8)]
			.into_iter()
			.map(|(name, field_ty)| make_field(&bump, name, field_ty))
			.collect();
		ty.fields.set(bump.alloc_slice_copy(&fields));

		compute_type_layout(&bump, ty, None).unwrap();

		assert_eq!(fields[0].offset(), 0);
		assert_eq!(fields[1].offset(), 4);
		assert_eq!(fields[2].offset(), 8);
		assert_eq!(fields[3].offset(), 16);

		let layout = ty.layout().unwrap();
		assert_eq!(layout.managed_size, 24);
		assert_eq!(layout.managed_align, 8);
		assert_eq!(layout.stack_type, StackType::ValueType);
	}

	#[test]
	fn class_layout_starts_after_the_header_and_tracks_references() {
		let bump = Bump::new();
		let pool = TypePool::new(&bump);
		let int32 = primitive_type(&bump, &pool, Primitive::Int32);

		let other = &*bump.alloc(Type::new("Node", "Demo", TypeKind::Class));

		let ty = &*bump.alloc(Type::new("Holder", "Demo", TypeKind::Class));
		let fields: Vec<_> = [("count", int32), ("next", other)]
			.into_iter()
			.map(|(name, field_ty)| make_field(&bump, name, field_ty))
			.collect();
		ty.fields.set(bump.alloc_slice_copy(&fields));

		compute_type_layout(&bump, ty, None).unwrap();

		assert_eq!(fields[0].offset(), OBJECT_HEADER_SIZE);
		assert_eq!(fields[1].offset(), 16);
		assert_eq!(ty.managed_pointer_offsets(), &[16]);
		assert_eq!(ty.layout().unwrap().stack_type, StackType::Object);
		assert_eq!(ty.layout().unwrap().stack_size, POINTER_SIZE);
	}

	#[test]
	fn embedded_value_types_propagate_pointer_offsets() {
		let bump = Bump::new();
		let pool = TypePool::new(&bump);
		let int64 = primitive_type(&bump, &pool, Primitive::Int64);
		let object = &*bump.alloc(Type::new("Object", "System", TypeKind::Class));

		let pair = &*bump.alloc(Type::new("Pair", "Demo", TypeKind::ValueType));
		let pair_fields: Vec<_> = [("id", int64), ("value", object)]
			.into_iter()
			.map(|(name, field_ty)| make_field(&bump, name, field_ty))
			.collect();
		pair.fields.set(bump.alloc_slice_copy(&pair_fields));
		compute_type_layout(&bump, pair, None).unwrap();
		pair.fill_state.set(FillState::Filled);
		assert_eq!(pair.managed_pointer_offsets(), &[8]);

		let wrapper = &*bump.alloc(Type::new("Wrapper", "Demo", TypeKind::ValueType));
		let wrapper_fields: Vec<_> = [("tag", int64), ("pair", pair)]
			.into_iter()
			.map(|(name, field_ty)| make_field(&bump, name, field_ty))
			.collect();
		wrapper.fields.set(bump.alloc_slice_copy(&wrapper_fields));
		compute_type_layout(&bump, wrapper, None).unwrap();

		assert_eq!(wrapper.managed_pointer_offsets(), &[16]);
	}

	#[test]
	fn explicit_layout_rejects_pointer_overlap() {
		let bump = Bump::new();
		let pool = TypePool::new(&bump);
		let int64 = primitive_type(&bump, &pool, Primitive::Int64);
		let object = &*bump.alloc(Type::new("Object", "System", TypeKind::Class));

		let ty = &*bump.alloc(Type::new("Evil", "Demo", TypeKind::ValueType));
		let fields: Vec<_> = [("raw", int64), ("obj", object)]
			.into_iter()
			.map(|(name, field_ty)| make_field(&bump, name, field_ty))
			.collect();
		ty.fields.set(bump.alloc_slice_copy(&fields));

		let offsets = [Some(0), Some(0)];
		let result = compute_type_layout(&bump, ty, Some(ExplicitLayout {
			packing: 0,
			class_size: 0,
			offsets: &offsets,
		}));
		assert!(matches!(result, Err(LoadError::BadFormat(_))));
	}
}
