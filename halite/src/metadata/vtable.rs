//! Virtual-method table construction.
//!
//! A vtable is a contiguous run of slots: the ancestors' virtual methods in
//! inheritance order (overrides replacing inherited slots), the type's own
//! new slots, then one run per implemented interface at a recorded offset.

use bumpalo::Bump;

use crate::metadata::LoadError;
use crate::metadata::types::{InterfaceImpl, Method, Type, TypeKind};
use crate::raw::tables::MethodAttributes;

pub(crate) fn build_vtable<'l>(
	bump: &'l Bump,
	ty: &'l Type<'l>,
	implemented: &[&'l Type<'l>],
) -> Result<(), LoadError> {
	if ty.kind() == TypeKind::Interface {
		let mut slots = Vec::with_capacity(ty.methods().len());
		for (index, method) in ty.methods().iter().enumerate() {
			method.vtable_offset.set(Some(index));
			slots.push(*method);
		}
		ty.virtual_methods.set(bump.alloc_slice_copy(&slots));
		return Ok(());
	}

	let mut slots: Vec<&'l Method<'l>> = match ty.parent() {
		Some(parent) => parent.virtual_methods().to_vec(),
		None => vec![],
	};

	for method in ty.methods() {
		if !method.is_virtual() {
			continue;
		}
		let inherited = match method.flags().contains(MethodAttributes::NEW_SLOT) {
			true => None,
			false => slots.iter().position(|slot| slot.signature_matches(method)),
		};
		match inherited {
			Some(index) => {
				slots[index] = method;
				method.vtable_offset.set(Some(index));
			},
			None => {
				method.vtable_offset.set(Some(slots.len()));
				slots.push(method);
			},
		}
	}

	let mut interface_impls = Vec::with_capacity(implemented.len());
	for interface in implemented {
		if !interface.is_interface() {
			return Err(LoadError::BadFormat("interface implementation names a non-interface"));
		}
		let offset = slots.len();
		for declared in interface.virtual_methods() {
			// Abstract types may leave a slot on the declaration itself.
			let implementation = find_implementation(ty, declared).unwrap_or(declared);
			slots.push(implementation);
		}
		interface_impls.push(InterfaceImpl { interface, vtable_offset: offset });
	}

	ty.virtual_methods.set(bump.alloc_slice_copy(&slots));
	ty.interfaces.set(bump.alloc_slice_copy(&interface_impls));
	Ok(())
}

/// The most-derived declaration wins: the search starts at the type and
/// walks outward.
fn find_implementation<'l>(ty: &'l Type<'l>, declared: &'l Method<'l>) -> Option<&'l Method<'l>> {
	let mut current = Some(ty);
	while let Some(t) = current {
		let found = t.methods().iter()
			.find(|m| m.is_virtual() && m.signature_matches(declared));
		if let Some(method) = found {
			return Some(method);
		}
		current = t.parent();
	}
	None
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use bumpalo::Bump;

	use crate::raw::heaps::BlobIndex;
	use crate::raw::indices::metadata_token::MethodDefToken;
	use crate::raw::tables::MethodImplAttributes;
	use super::*;

	fn make_method<'l>(bump: &'l Bump, name: &str, flags: MethodAttributes) -> &'l Method<'l> {
		bump.alloc(Method {
			token: MethodDefToken(0).into(),
			name: bump.alloc_str(name),
			flags,
			impl_flags: MethodImplAttributes::IL,
			signature: BlobIndex(0),
			declaring_type: Cell::new(None),
			return_type: Cell::new(None),
			params: Cell::new(&[]),
			body_bytes: Cell::new(None),
			vtable_offset: Cell::new(None),
			jit_function: Cell::new(None),
		})
	}

	#[test]
	fn overrides_replace_inherited_slots() {
		let bump = Bump::new();
		let virt = MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL;

		let base = &*bump.alloc(Type::new("Base", "Demo", TypeKind::Class));
		let base_m = make_method(&bump, "M", virt | MethodAttributes::NEW_SLOT);
		let base_n = make_method(&bump, "N", virt | MethodAttributes::NEW_SLOT);
		base.methods.set(bump.alloc_slice_copy(&[base_m, base_n]));
		build_vtable(&bump, base, &[]).unwrap();
		assert_eq!(base.virtual_methods().len(), 2);
		assert_eq!(base_m.vtable_offset(), Some(0));

		let derived = &*bump.alloc(Type::new("Derived", "Demo", TypeKind::Class));
		derived.parent.set(Some(base));
		let derived_m = make_method(&bump, "M", virt);
		let derived_o = make_method(&bump, "O", virt | MethodAttributes::NEW_SLOT);
		derived.methods.set(bump.alloc_slice_copy(&[derived_m, derived_o]));
		build_vtable(&bump, derived, &[]).unwrap();

		let slots = derived.virtual_methods();
		assert_eq!(slots.len(), 3);
		assert!(std::ptr::eq(slots[0], derived_m));
		assert!(std::ptr::eq(slots[1], base_n));
		assert!(std::ptr::eq(slots[2], derived_o));
		assert_eq!(derived_m.vtable_offset(), Some(0));
		assert_eq!(derived_o.vtable_offset(), Some(2));
	}

	#[test]
	fn interface_runs_are_appended_at_recorded_offsets() {
		let bump = Bump::new();
		let virt = MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL;

		let iface = &*bump.alloc(Type::new("IThing", "Demo", TypeKind::Interface));
		let decl = make_method(&bump, "Do", virt | MethodAttributes::ABSTRACT);
		iface.methods.set(bump.alloc_slice_copy(&[decl]));
		build_vtable(&bump, iface, &[]).unwrap();
		assert_eq!(decl.vtable_offset(), Some(0));

		let ty = &*bump.alloc(Type::new("Thing", "Demo", TypeKind::Class));
		let own = make_method(&bump, "Do", virt | MethodAttributes::NEW_SLOT);
		let other = make_method(&bump, "Other", virt | MethodAttributes::NEW_SLOT);
		ty.methods.set(bump.alloc_slice_copy(&[own, other]));
		build_vtable(&bump, ty, &[iface]).unwrap();

		let impls = ty.interfaces();
		assert_eq!(impls.len(), 1);
		assert_eq!(impls[0].vtable_offset, 2);
		assert!(std::ptr::eq(ty.virtual_methods()[2], own));
	}
}
