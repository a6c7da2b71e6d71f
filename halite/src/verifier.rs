//! Verifier primitives: the pure type-relation functions the JIT consults
//! (ECMA-335 III.1.8) and member accessibility.

use crate::metadata::{Primitive, Type, TypePool};
use crate::raw::tables::{FieldAttributes, MethodAttributes, TypeAttributes};

/// The type used for assignability: enums collapse onto their storage type.
pub fn underlying_type<'l>(ty: &'l Type<'l>) -> &'l Type<'l> {
	ty.underlying_type()
}

/// Underlying type, with unsigned integers collapsed onto the signed form
/// of the same width.
pub fn reduced_type<'l>(pool: &TypePool<'l>, ty: &'l Type<'l>) -> &'l Type<'l> {
	let ty = underlying_type(ty);
	match ty.primitive() {
		Some(Primitive::UInt8) => pool.get_primitive(Primitive::Int8),
		Some(Primitive::UInt16) => pool.get_primitive(Primitive::Int16),
		Some(Primitive::UInt32) => pool.get_primitive(Primitive::Int32),
		Some(Primitive::UInt64) => pool.get_primitive(Primitive::Int64),
		Some(Primitive::UIntPtr) => pool.get_primitive(Primitive::IntPtr),
		_ => ty,
	}
}

/// Reduced type with bool and char collapsed onto their integer forms;
/// distributes over by-refs.
pub fn verification_type<'l>(pool: &TypePool<'l>, ty: &'l Type<'l>) -> &'l Type<'l> {
	if ty.is_by_ref() {
		let Some(referent) = ty.element_type() else { return ty };
		let verified = verification_type(pool, referent);
		return pool.get_byref(verified).unwrap_or(ty);
	}

	let ty = reduced_type(pool, ty);
	match ty.primitive() {
		Some(Primitive::Boolean) => pool.get_primitive(Primitive::Int8),
		Some(Primitive::Char) => pool.get_primitive(Primitive::Int16),
		_ => ty,
	}
}

/// Verification type with small integers promoted to `Int32`, mirroring
/// what actually sits on the evaluation stack.
pub fn intermediate_type<'l>(pool: &TypePool<'l>, ty: &'l Type<'l>) -> &'l Type<'l> {
	let ty = verification_type(pool, ty);
	match ty.primitive() {
		Some(Primitive::Int8) | Some(Primitive::Int16) => pool.get_primitive(Primitive::Int32),
		_ => ty,
	}
}

pub fn array_element_compatible_with<'l>(
	pool: &TypePool<'l>,
	ty: &'l Type<'l>,
	other: &'l Type<'l>,
) -> bool {
	let (ty, other) = (underlying_type(ty), underlying_type(other));
	compatible_with(pool, ty, other)
		|| std::ptr::eq(verification_type(pool, ty), verification_type(pool, other))
}

pub fn pointer_element_compatible_with<'l>(
	pool: &TypePool<'l>,
	ty: &'l Type<'l>,
	other: &'l Type<'l>,
) -> bool {
	std::ptr::eq(verification_type(pool, ty), verification_type(pool, other))
}

pub fn compatible_with<'l>(pool: &TypePool<'l>, ty: &'l Type<'l>, other: &'l Type<'l>) -> bool {
	if std::ptr::eq(ty, other) {
		return true;
	}

	if ty.is_array() && other.is_array() {
		let (Some(a), Some(b)) = (ty.element_type(), other.element_type()) else { return false };
		return array_element_compatible_with(pool, a, b);
	}

	if ty.is_by_ref() && other.is_by_ref() {
		let (Some(a), Some(b)) = (ty.element_type(), other.element_type()) else { return false };
		return pointer_element_compatible_with(pool, a, b);
	}

	// Direct bases: Array for arrays, Object for classes and interfaces,
	// ValueType for value types.
	let direct_base = match ty.kind() {
		_ if ty.is_array() => {
			std::ptr::eq(other, pool.array_base()) || std::ptr::eq(other, pool.object_base())
		},
		_ if ty.is_value_type() => std::ptr::eq(other, pool.value_type_base()),
		_ if ty.is_object_ref() => std::ptr::eq(other, pool.object_base()),
		_ => false,
	};
	if direct_base {
		return true;
	}

	if other.is_interface() && ty.interface_impl(other).is_some() {
		return true;
	}

	let mut current = ty.parent();
	while let Some(parent) = current {
		if std::ptr::eq(parent, other) {
			return true;
		}
		current = parent.parent();
	}
	false
}

pub fn assignable_to<'l>(pool: &TypePool<'l>, ty: &'l Type<'l>, other: &'l Type<'l>) -> bool {
	if std::ptr::eq(ty, other) {
		return true;
	}
	if std::ptr::eq(ty, pool.null_type()) && other.is_object_ref() {
		return true;
	}
	if std::ptr::eq(intermediate_type(pool, ty), intermediate_type(pool, other)) {
		return true;
	}
	compatible_with(pool, ty, other)
}

pub fn verifier_assignable_to<'l>(
	pool: &TypePool<'l>,
	ty: &'l Type<'l>,
	other: &'l Type<'l>,
) -> bool {
	if std::ptr::eq(ty, pool.null_type()) && other.is_object_ref() {
		return true;
	}
	assignable_to(pool, verification_type(pool, ty), verification_type(pool, other))
}

/// The access level encoded in the low bits of field and method flags.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Accessibility {
	CompilerControlled,
	Private,
	FamilyAndAssembly,
	Assembly,
	Family,
	FamilyOrAssembly,
	Public,
}

impl Accessibility {
	pub fn of_field(flags: FieldAttributes) -> Accessibility {
		Self::from_bits((flags & FieldAttributes::FIELD_ACCESS_MASK).bits())
	}

	pub fn of_method(flags: MethodAttributes) -> Accessibility {
		Self::from_bits((flags & MethodAttributes::MEMBER_ACCESS_MASK).bits())
	}

	fn from_bits(bits: u16) -> Accessibility {
		match bits {
			0x1 => Accessibility::Private,
			0x2 => Accessibility::FamilyAndAssembly,
			0x3 => Accessibility::Assembly,
			0x4 => Accessibility::Family,
			0x5 => Accessibility::FamilyOrAssembly,
			0x6 => Accessibility::Public,
			_ => Accessibility::CompilerControlled,
		}
	}
}

fn same_assembly<'a>(a: &Type<'a>, b: &Type<'a>) -> bool {
	match (a.assembly(), b.assembly()) {
		(Some(a), Some(b)) => std::ptr::eq(a, b),
		_ => false,
	}
}

fn is_or_subclasses<'a>(ty: &Type<'a>, of: &Type<'a>) -> bool {
	let mut current = Some(ty);
	while let Some(t) = current {
		if std::ptr::eq(t, of) {
			return true;
		}
		current = t.parent();
	}
	false
}

/// Whether `target` is visible from code inside `from`.
pub fn is_type_visible<'a>(from: &Type<'a>, target: &Type<'a>) -> bool {
	let visibility = target.flags() & TypeAttributes::VISIBILITY_MASK;
	if visibility == TypeAttributes::PUBLIC {
		return true;
	}
	if visibility == TypeAttributes::NOT_PUBLIC {
		return same_assembly(from, target);
	}

	// Nested visibility mirrors the member rules against the declaring type.
	let Some(declaring) = target.declaring_type() else { return false };
	if !is_type_visible(from, declaring) {
		return false;
	}
	if visibility == TypeAttributes::NESTED_PUBLIC {
		true
	} else if visibility == TypeAttributes::NESTED_PRIVATE {
		std::ptr::eq(from, declaring)
	} else if visibility == TypeAttributes::NESTED_FAMILY {
		is_or_subclasses(from, declaring)
	} else if visibility == TypeAttributes::NESTED_ASSEMBLY {
		same_assembly(from, target)
	} else if visibility == TypeAttributes::NESTED_FAMILY_AND_ASSEMBLY {
		is_or_subclasses(from, declaring) && same_assembly(from, target)
	} else if visibility == TypeAttributes::NESTED_FAMILY_OR_ASSEMBLY {
		is_or_subclasses(from, declaring) || same_assembly(from, target)
	} else {
		false
	}
}

/// Whether a member declared in `declared_in` with `access` is reachable
/// from code inside `from`.
pub fn can_access_member<'a>(from: &Type<'a>, declared_in: &Type<'a>, access: Accessibility) -> bool {
	if !is_type_visible(from, declared_in) {
		return false;
	}
	match access {
		Accessibility::CompilerControlled => false,
		Accessibility::Private => std::ptr::eq(from, declared_in),
		Accessibility::Family => is_or_subclasses(from, declared_in),
		Accessibility::Assembly => same_assembly(from, declared_in),
		Accessibility::FamilyAndAssembly => {
			is_or_subclasses(from, declared_in) && same_assembly(from, declared_in)
		},
		Accessibility::FamilyOrAssembly => {
			is_or_subclasses(from, declared_in) || same_assembly(from, declared_in)
		},
		Accessibility::Public => true,
	}
}

#[cfg(test)]
mod tests {
	use crate::metadata::Context;
	use super::*;

	#[test]
	fn reduced_types_collapse_unsigned() {
		let ctx = Context::new();
		let pool = ctx.pool();
		for (from, to) in [
			(Primitive::UInt8, Primitive::Int8),
			(Primitive::UInt16, Primitive::Int16),
			(Primitive::UInt32, Primitive::Int32),
			(Primitive::UInt64, Primitive::Int64),
			(Primitive::UIntPtr, Primitive::IntPtr),
		] {
			let reduced = reduced_type(pool, pool.get_primitive(from));
			assert!(std::ptr::eq(reduced, pool.get_primitive(to)));
		}
	}

	#[test]
	fn verification_types_collapse_bool_and_char() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let boolean = pool.get_primitive(Primitive::Boolean);
		let char_ty = pool.get_primitive(Primitive::Char);
		assert!(std::ptr::eq(verification_type(pool, boolean), pool.get_primitive(Primitive::Int8)));
		assert!(std::ptr::eq(verification_type(pool, char_ty), pool.get_primitive(Primitive::Int16)));

		// Distributes over by-refs.
		let bool_ref = pool.get_byref(boolean).unwrap();
		let i8_ref = pool.get_byref(pool.get_primitive(Primitive::Int8)).unwrap();
		assert!(std::ptr::eq(verification_type(pool, bool_ref), i8_ref));
	}

	#[test]
	fn intermediate_types_promote_small_ints() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let int32 = pool.get_primitive(Primitive::Int32);
		for small in [Primitive::Boolean, Primitive::Char, Primitive::Int8, Primitive::UInt16] {
			assert!(std::ptr::eq(intermediate_type(pool, pool.get_primitive(small)), int32));
		}
	}

	#[test]
	fn verifier_assignability_is_reflexive_and_transitive() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let corlib = ctx.corlib();

		let int32 = pool.get_primitive(Primitive::Int32);
		let sample = [
			int32,
			pool.get_primitive(Primitive::UInt32),
			pool.get_primitive(Primitive::Boolean),
			pool.get_primitive(Primitive::Double),
			pool.object_base(),
			pool.string_base(),
			pool.get_array(int32),
			pool.get_array(pool.object_base()),
			pool.get_byref(int32).unwrap(),
			corlib.find_type("System", "Exception").unwrap(),
			corlib.find_type("System", "ArithmeticException").unwrap(),
			corlib.find_type("System", "DivideByZeroException").unwrap(),
		];

		for ty in sample {
			assert!(verifier_assignable_to(pool, ty, ty), "{ty} not assignable to itself");
		}
		for a in sample {
			for b in sample {
				for c in sample {
					if verifier_assignable_to(pool, a, b) && verifier_assignable_to(pool, b, c) {
						assert!(
							verifier_assignable_to(pool, a, c),
							"transitivity broken for {a} -> {b} -> {c}",
						);
					}
				}
			}
		}
	}

	#[test]
	fn subclass_chains_are_compatible() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let corlib = ctx.corlib();
		let divide = corlib.find_type("System", "DivideByZeroException").unwrap();
		let exception = corlib.find_type("System", "Exception").unwrap();

		assert!(compatible_with(pool, divide, exception));
		assert!(compatible_with(pool, divide, pool.object_base()));
		assert!(!compatible_with(pool, exception, divide));
	}

	#[test]
	fn null_is_assignable_to_object_references() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let null = pool.null_type();

		assert!(verifier_assignable_to(pool, null, pool.object_base()));
		assert!(verifier_assignable_to(pool, null, pool.string_base()));
		assert!(verifier_assignable_to(pool, null, pool.get_array(pool.object_base())));
		assert!(!verifier_assignable_to(pool, null, pool.get_primitive(Primitive::Int32)));
	}

	#[test]
	fn array_covariance_tracks_element_compatibility() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let corlib = ctx.corlib();
		let divide = corlib.find_type("System", "DivideByZeroException").unwrap();
		let exception = corlib.find_type("System", "Exception").unwrap();

		assert!(compatible_with(pool, pool.get_array(divide), pool.get_array(exception)));
		assert!(!compatible_with(pool, pool.get_array(exception), pool.get_array(divide)));

		// Same-width integers share a verification type.
		let i32_arr = pool.get_array(pool.get_primitive(Primitive::Int32));
		let u32_arr = pool.get_array(pool.get_primitive(Primitive::UInt32));
		assert!(compatible_with(pool, i32_arr, u32_arr));
	}
}
