//! The abstract evaluation stack the translator simulates.
//!
//! Every entry carries its stack-type classification, the full type for
//! the verifier, and the MIR register holding the value. Value-type
//! entries hold the address of a stack-allocated backing buffer; interface
//! entries are fat pointers and carry the object half in a second register.

use crate::metadata::{Primitive, StackType, Type, TypePool};
use crate::mir::{MirType, Reg};
use crate::jit::JitError;
use crate::verifier;

#[derive(Debug, Copy, Clone)]
pub(crate) struct StackEntry<'l> {
	pub ty: &'l Type<'l>,
	pub stack_type: StackType,
	/// Float sub-kind: doubles never implicitly narrow to singles.
	pub double: bool,
	pub reg: Reg,
	/// Object half of an interface fat pointer.
	pub obj_reg: Option<Reg>,
}

/// Stack-type promotion on entry into the stack: small integers widen to
/// `Int32`, floats keep their sub-kind.
pub(crate) fn classify<'l>(ty: &'l Type<'l>) -> (StackType, bool) {
	(ty.stack_type(), matches!(ty.primitive(), Some(Primitive::Double)))
}

pub(crate) fn mir_type_for(stack_type: StackType, double: bool) -> MirType {
	match stack_type {
		StackType::Int32 | StackType::Int64 | StackType::IntPtr => MirType::I64,
		StackType::Float => match double {
			true => MirType::D,
			false => MirType::F,
		},
		StackType::Object | StackType::ByRef | StackType::ValueType => MirType::P,
	}
}

#[derive(Debug, Default)]
pub(crate) struct EvalStack<'l> {
	entries: Vec<StackEntry<'l>>,
	limit: usize,
}

impl<'l> EvalStack<'l> {
	pub fn new(limit: usize) -> Self {
		Self { entries: vec![], limit }
	}

	pub fn push(&mut self, entry: StackEntry<'l>) -> Result<(), JitError> {
		if self.entries.len() >= self.limit {
			return Err(JitError::Verification("evaluation stack exceeds max-stack"));
		}
		self.entries.push(entry);
		Ok(())
	}

	pub fn pop(&mut self) -> Result<StackEntry<'l>, JitError> {
		self.entries.pop().ok_or(JitError::Verification("evaluation stack underflow"))
	}

	pub fn peek(&self) -> Result<&StackEntry<'l>, JitError> {
		self.entries.last().ok_or(JitError::Verification("evaluation stack underflow"))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn entries(&self) -> &[StackEntry<'l>] {
		&self.entries
	}

	pub fn replace(&mut self, entries: &[StackEntry<'l>]) {
		self.entries.clear();
		self.entries.extend_from_slice(entries);
	}
}

/// Merges the incoming stack into a recorded snapshot.
///
/// Forward targets may widen snapshot types to the common
/// verifier-assignable supertype; backward targets must match exactly
/// because emitted code already depends on the recorded types.
pub(crate) fn merge_into_snapshot<'l>(
	pool: &TypePool<'l>,
	snapshot: &mut [StackEntry<'l>],
	incoming: &[StackEntry<'l>],
	backward: bool,
) -> Result<(), JitError> {
	if snapshot.len() != incoming.len() {
		return Err(JitError::Verification("stack depth differs between control-flow edges"));
	}

	for (slot, input) in snapshot.iter_mut().zip(incoming) {
		if slot.stack_type != input.stack_type {
			return Err(JitError::Verification("stack type differs between control-flow edges"));
		}

		// Float widths never merge: a double cannot implicitly narrow and a
		// single widening here would retype an already-emitted register.
		if slot.double != input.double {
			return Err(JitError::Verification("float width differs between control-flow edges"));
		}
		if slot.stack_type == StackType::Float {
			continue;
		}

		if std::ptr::eq(slot.ty, input.ty) {
			continue;
		}
		if backward {
			return Err(JitError::Verification("stack entry type differs on a backward edge"));
		}

		if verifier::verifier_assignable_to(pool, input.ty, slot.ty) {
			// The recorded type already covers the incoming one.
		} else if verifier::verifier_assignable_to(pool, slot.ty, input.ty) {
			slot.ty = input.ty;
		} else {
			return Err(JitError::Verification("stack entry types have no common supertype"));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use crate::metadata::Context;
	use crate::mir::Reg;
	use super::*;

	fn entry<'l>(ty: &'l Type<'l>, reg: u32) -> StackEntry<'l> {
		let (stack_type, double) = classify(ty);
		StackEntry { ty, stack_type, double, reg: Reg(reg), obj_reg: None }
	}

	#[test]
	fn forward_merges_widen_to_the_common_supertype() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let corlib = ctx.corlib();
		let divide = corlib.find_type("System", "DivideByZeroException").unwrap();
		let overflow = corlib.find_type("System", "OverflowException").unwrap();
		let arithmetic = corlib.find_type("System", "ArithmeticException").unwrap();

		// Snapshot holds the more derived type; the incoming edge widens it.
		let mut snapshot = [entry(divide, 0)];
		merge_into_snapshot(pool, &mut snapshot, &[entry(arithmetic, 1)], false).unwrap();
		assert!(std::ptr::eq(snapshot[0].ty, arithmetic));

		// A sibling type with no common side fails.
		let mut snapshot = [entry(divide, 0)];
		assert!(merge_into_snapshot(pool, &mut snapshot, &[entry(overflow, 1)], false).is_err());
	}

	#[test]
	fn backward_edges_demand_exact_types() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let corlib = ctx.corlib();
		let divide = corlib.find_type("System", "DivideByZeroException").unwrap();
		let arithmetic = corlib.find_type("System", "ArithmeticException").unwrap();

		let mut snapshot = [entry(arithmetic, 0)];
		assert!(merge_into_snapshot(pool, &mut snapshot, &[entry(arithmetic, 1)], true).is_ok());
		assert!(merge_into_snapshot(pool, &mut snapshot, &[entry(divide, 1)], true).is_err());
	}

	#[test]
	fn depth_mismatches_fail() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let object = pool.object_base();

		let mut snapshot = [entry(object, 0)];
		assert!(merge_into_snapshot(pool, &mut snapshot, &[], false).is_err());
	}

	#[test]
	fn float_widths_never_merge() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let single = pool.get_primitive(Primitive::Float);
		let double = pool.get_primitive(Primitive::Double);

		let mut snapshot = [entry(single, 0)];
		assert!(merge_into_snapshot(pool, &mut snapshot, &[entry(single, 1)], false).is_ok());
		assert!(merge_into_snapshot(pool, &mut snapshot, &[entry(double, 1)], false).is_err());
	}
}
