//! The verifying single-pass CIL-to-MIR translator.
//!
//! One linear walk over the instruction stream simulates the evaluation
//! stack, records snapshots at branch targets and handler entries, resolves
//! the implicit conversion matrix, lowers the object model against the
//! runtime layout, and threads exception control flow through the two-slot
//! return convention. Verification failures abort the method; nothing of a
//! failed method is published.

use fxhash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::jit::eh;
use crate::jit::stack::{classify, merge_into_snapshot, mir_type_for, EvalStack, StackEntry};
use crate::jit::{method_symbol, JitError, ModuleState};
use crate::metadata::layout::OBJECT_HEADER_SIZE;
use crate::metadata::{
	Assembly, Field, Method, Primitive, StackType, Type, TypePool, POINTER_SIZE,
};
use crate::mir::{
	BinOp, CallTarget, ConvKind, FBinOp, FuncBuilder, Insn, Label, MemSize, MirType, Operand,
	Pred, Proto, Reg,
};
use crate::raw::il::{
	CompoundOpCode, ExceptionClause, ExceptionClauseKind, MethodBody, OpCode, OpCodeIterator,
};
use crate::raw::indices::metadata_token::MetadataToken;
use crate::runtime::object::{ARRAY_ELEMENTS_OFFSET, ARRAY_LENGTH_OFFSET, VTABLE_FUNCS_OFFSET};
use crate::verifier;

const RT_NEW_OBJECT: &str = "rt_new_object";
const RT_NEW_ARRAY: &str = "rt_new_array";
const RT_IS_INSTANCE: &str = "rt_is_instance";
const RT_CAST_TO_INTERFACE: &str = "rt_cast_to_interface";
const RT_GC_UPDATE: &str = "gc_update";
const RT_GC_UPDATE_REF: &str = "gc_update_ref";

/// Argument or local slot. Register-backed unless the slot needs an
/// address (value types, or anything `ldloca`/`ldarga` touches), in which
/// case `reg` holds the address of frame storage.
#[derive(Debug, Copy, Clone)]
struct Slot<'l> {
	ty: &'l Type<'l>,
	stack_type: StackType,
	double: bool,
	reg: Reg,
	memory: bool,
}

struct Snapshot<'l> {
	entries: Vec<StackEntry<'l>>,
	label: Label,
}

#[derive(Copy, Clone)]
enum LinkTarget {
	/// Normal leave destination.
	Leave(Label),
	/// Continue the handler search at an outer dispatch block.
	Unwind(Label),
}

/// Per-clause translation state: the catch type and its current-exception
/// register, or the finally link registers and recorded leave links.
struct ClauseState<'l> {
	catch_type: Option<&'l Type<'l>>,
	catch_exc: Option<Reg>,
	link_reg: Option<Reg>,
	saved_exc: Option<Reg>,
	links: Vec<(i64, LinkTarget)>,
	endfinally_label: Option<Label>,
}

pub(crate) fn translate_method<'a, 'l>(
	pool: &'l TypePool<'l>,
	corlib: &'l Assembly<'l>,
	assembly: &'l Assembly<'l>,
	method: &'l Method<'l>,
	body: &'a MethodBody<'l>,
	locals: &[&'l Type<'l>],
	state: &'a mut ModuleState<'l>,
) -> Result<(), JitError> {
	let mut translator = Translator {
		pool,
		corlib,
		assembly,
		method,
		clauses: &body.exception_clauses,
		f: FuncBuilder::new(method_symbol(method)),
		state,
		stack: EvalStack::new(body.max_stack_size.max(8) as usize),
		snapshots: FxHashMap::default(),
		args: vec![],
		locals: vec![],
		clause_states: vec![],
		dispatch_labels: FxHashMap::default(),
		dispatch_pending: vec![],
		propagate_label: None,
		exc_reg: Reg(0),
		ret_block: None,
		next_link_id: 1,
		offset: 0,
		reachable: true,
		constrained: None,
		last_receiver: None,
	};
	translator.run(body, locals)
}

struct Translator<'a, 'l> {
	pool: &'l TypePool<'l>,
	corlib: &'l Assembly<'l>,
	assembly: &'l Assembly<'l>,
	method: &'l Method<'l>,
	clauses: &'a [ExceptionClause],
	f: FuncBuilder,
	state: &'a mut ModuleState<'l>,
	stack: EvalStack<'l>,
	snapshots: FxHashMap<u32, Snapshot<'l>>,
	args: Vec<Slot<'l>>,
	locals: Vec<Slot<'l>>,
	clause_states: Vec<ClauseState<'l>>,
	/// One dispatch block per distinct enclosing-clause chain.
	dispatch_labels: FxHashMap<Vec<usize>, Label>,
	dispatch_pending: Vec<(Vec<usize>, Label)>,
	propagate_label: Option<Label>,
	/// Holds the in-flight exception; checked after every call.
	exc_reg: Reg,
	/// Caller-provided destination for large value-type returns.
	ret_block: Option<Reg>,
	next_link_id: i64,
	offset: u32,
	reachable: bool,
	constrained: Option<&'l Type<'l>>,
	/// The receiver entry of the call being assembled, for dispatch.
	last_receiver: Option<StackEntry<'l>>,
}

impl<'a, 'l> Translator<'a, 'l> {
	fn run(&mut self, body: &'a MethodBody<'l>, local_types: &[&'l Type<'l>]) -> Result<(), JitError> {
		if !body.init_locals && !local_types.is_empty() {
			return Err(JitError::Verification("method without InitLocals"));
		}
		for clause in self.clauses {
			if matches!(clause.kind, ExceptionClauseKind::Filter { .. }) {
				return Err(JitError::Unsupported("filter clauses"));
			}
		}

		let (targets, spilled_locals, spilled_args) = self.scan(body)?;
		self.prologue(local_types, &spilled_locals, &spilled_args)?;
		self.prepare_clauses()?;

		let mut prev_falls = true;
		let mut prev_offset = 0u32;
		for (start, end, op) in OpCodeIterator::new(body.code) {
			let op = op.map_err(|_| JitError::Verification("malformed CIL stream"))?;
			self.offset = start;

			if let Some(label) = self.snapshot_label(start) {
				if self.reachable {
					if prev_falls {
						eh::validate_edge(self.clauses, prev_offset, start)?;
					}
					self.transfer_to_snapshot(start, false)?;
				}
				self.f.bind(label);
				let entries = self.snapshots[&start].entries.clone();
				self.stack.replace(&entries);
				self.reachable = true;
			} else if targets.contains(&start) {
				// First arrival at a marked offset records the snapshot.
				if !self.reachable {
					self.stack.clear();
				}
				let label = self.record_snapshot(start)?;
				self.f.bind(label);
				self.reachable = true;
			} else if self.reachable && prev_falls && start != 0 {
				eh::validate_edge(self.clauses, prev_offset, start)?;
			}

			if !self.reachable {
				prev_falls = false;
				prev_offset = start;
				continue;
			}

			self.translate_op(&op, end)?;

			prev_offset = start;
			prev_falls = !matches!(
				op,
				OpCode::br(_) | OpCode::br_s(_) | OpCode::ret | OpCode::throw
					| OpCode::leave(_) | OpCode::leave_s(_) | OpCode::endfinally
					| OpCode::compound(CompoundOpCode::rethrow)
			);
		}

		if self.reachable {
			return Err(JitError::Verification("control falls off the end of the method"));
		}

		self.emit_dispatch_blocks()?;
		self.emit_endfinally_blocks()?;

		let function = std::mem::replace(&mut self.f, FuncBuilder::new(String::new())).finish(true);
		trace!(method = %self.method, insns = function.insns.len(), "method translated");
		self.state.module.add_function(function);
		Ok(())
	}

	// ---- setup -----------------------------------------------------------

	/// Pre-pass: branch targets, handler entries, and which slots need
	/// frame storage because their address is taken.
	fn scan(
		&self,
		body: &MethodBody<'l>,
	) -> Result<(FxHashSet<u32>, FxHashSet<u16>, FxHashSet<u16>), JitError> {
		let mut targets = FxHashSet::default();
		let mut locals = FxHashSet::default();
		let mut args = FxHashSet::default();

		for (_, end, op) in OpCodeIterator::new(body.code) {
			let op = op.map_err(|_| JitError::Verification("malformed CIL stream"))?;
			let mut mark = |rel: i64| {
				targets.insert((end as i64 + rel) as u32);
			};
			match op {
				OpCode::br_s(t) | OpCode::brfalse_s(t) | OpCode::brtrue_s(t)
				| OpCode::beq_s(t) | OpCode::bge_s(t) | OpCode::bgt_s(t)
				| OpCode::ble_s(t) | OpCode::blt_s(t) | OpCode::bne_un_s(t)
				| OpCode::bge_un_s(t) | OpCode::bgt_un_s(t) | OpCode::ble_un_s(t)
				| OpCode::blt_un_s(t) | OpCode::leave_s(t) => mark(t as i64),
				OpCode::br(t) | OpCode::brfalse(t) | OpCode::brtrue(t)
				| OpCode::beq(t) | OpCode::bge(t) | OpCode::bgt(t)
				| OpCode::ble(t) | OpCode::blt(t) | OpCode::bne_un(t)
				| OpCode::bge_un(t) | OpCode::bgt_un(t) | OpCode::ble_un(t)
				| OpCode::blt_un(t) | OpCode::leave(t) => mark(t as i64),
				OpCode::switch(table) => {
					for rel in table.variants() {
						mark(rel as i64);
					}
				},
				OpCode::ldloca_s(index) => {
					locals.insert(index as u16);
				},
				OpCode::ldarga_s(index) => {
					args.insert(index as u16);
				},
				OpCode::compound(CompoundOpCode::ldloca(index)) => {
					locals.insert(index);
				},
				OpCode::compound(CompoundOpCode::ldarga(index)) => {
					args.insert(index);
				},
				_ => {},
			}
		}

		for clause in self.clauses {
			targets.insert(clause.handler_offset);
		}
		Ok((targets, locals, args))
	}

	fn prologue(
		&mut self,
		local_types: &[&'l Type<'l>],
		spilled_locals: &FxHashSet<u16>,
		spilled_args: &FxHashSet<u16>,
	) -> Result<(), JitError> {
		let return_type = self.method.return_type()
			.ok_or(JitError::Verification("method signature unresolved"))?;
		if classify(return_type).0 == StackType::ValueType && !is_void(return_type) {
			self.ret_block = Some(self.f.param(MirType::P));
		}

		let mut arg_types: Vec<&'l Type<'l>> = vec![];
		if !self.method.is_static() {
			let declaring = self.method.declaring_type()
				.ok_or(JitError::Verification("method has no declaring type"))?;
			let this_ty = match declaring.is_value_type() {
				true => self.pool.get_byref(declaring)?,
				false => declaring,
			};
			arg_types.push(this_ty);
		}
		for param in self.method.params() {
			arg_types.push(param.param_type()
				.ok_or(JitError::Verification("parameter type unresolved"))?);
		}

		for (index, ty) in arg_types.iter().enumerate() {
			let (stack_type, double) = classify(ty);
			let incoming = self.f.param(mir_type_for(stack_type, double));
			let spilled = spilled_args.contains(&(index as u16));

			let slot = if stack_type == StackType::ValueType {
				// By-value semantics: copy the caller's buffer.
				let buffer = self.f.reg(MirType::P);
				self.f.emit(Insn::Alloca { dst: buffer, size: ty.stack_size().max(1) });
				self.f.emit(Insn::Memcpy {
					dst: buffer.into(),
					src: incoming.into(),
					len: ty.stack_size().max(1),
				});
				Slot { ty, stack_type, double, reg: buffer, memory: true }
			} else if spilled {
				let buffer = self.f.reg(MirType::P);
				self.f.emit(Insn::Alloca { dst: buffer, size: POINTER_SIZE });
				self.f.emit(Insn::Store {
					src: incoming.into(),
					base: buffer.into(),
					offset: 0,
					size: slot_mem_size(stack_type, double),
				});
				Slot { ty, stack_type, double, reg: buffer, memory: true }
			} else {
				Slot { ty, stack_type, double, reg: incoming, memory: false }
			};
			self.args.push(slot);
		}

		self.exc_reg = self.f.reg(MirType::P);
		self.f.emit(Insn::Mov { dst: self.exc_reg, src: Operand::Imm(0) });

		for (index, ty) in local_types.iter().enumerate() {
			let (stack_type, double) = classify(ty);
			let needs_memory = stack_type == StackType::ValueType
				|| spilled_locals.contains(&(index as u16));
			let slot = if needs_memory {
				let buffer = self.f.reg(MirType::P);
				// Alloca storage is zeroed, which is what InitLocals wants.
				self.f.emit(Insn::Alloca { dst: buffer, size: ty.stack_size().max(POINTER_SIZE) });
				Slot { ty, stack_type, double, reg: buffer, memory: true }
			} else {
				let reg = self.f.reg(mir_type_for(stack_type, double));
				self.f.emit(Insn::Mov { dst: reg, src: Operand::Imm(0) });
				Slot { ty, stack_type, double, reg, memory: false }
			};
			self.locals.push(slot);
		}
		Ok(())
	}

	/// Resolves catch types, allocates clause registers and records handler
	/// entry snapshots.
	fn prepare_clauses(&mut self) -> Result<(), JitError> {
		for clause in self.clauses {
			let mut clause_state = ClauseState {
				catch_type: None,
				catch_exc: None,
				link_reg: None,
				saved_exc: None,
				links: vec![],
				endfinally_label: None,
			};

			let label = self.f.label();
			match clause.kind {
				ExceptionClauseKind::Catch(token) => {
					let catch_type = self.assembly.resolve_type_token(token)?;
					let reg = self.f.reg(MirType::P);
					let entry = StackEntry {
						ty: catch_type,
						stack_type: StackType::Object,
						double: false,
						reg,
						obj_reg: None,
					};
					clause_state.catch_type = Some(catch_type);
					clause_state.catch_exc = Some(self.f.reg(MirType::P));
					self.snapshots.insert(clause.handler_offset, Snapshot {
						entries: vec![entry],
						label,
					});
				},
				ExceptionClauseKind::Finally | ExceptionClauseKind::Fault => {
					clause_state.link_reg = Some(self.f.reg(MirType::I64));
					clause_state.saved_exc = Some(self.f.reg(MirType::P));
					self.snapshots.insert(clause.handler_offset, Snapshot {
						entries: vec![],
						label,
					});
				},
				ExceptionClauseKind::Filter { .. } => {
					return Err(JitError::Unsupported("filter clauses"));
				},
			}
			self.clause_states.push(clause_state);
		}
		Ok(())
	}

	// ---- snapshots and edges --------------------------------------------

	fn snapshot_label(&self, offset: u32) -> Option<Label> {
		self.snapshots.get(&offset).map(|s| s.label)
	}

	/// Records the current stack as the snapshot at `offset`, with fresh
	/// registers, and emits the transfer moves.
	fn record_snapshot(&mut self, offset: u32) -> Result<Label, JitError> {
		debug_assert!(!self.snapshots.contains_key(&offset));
		let label = self.f.label();
		let mut entries = vec![];
		for entry in self.stack.entries() {
			let reg = self.f.reg(mir_type_for(entry.stack_type, entry.double));
			let obj_reg = entry.obj_reg.map(|_| self.f.reg(MirType::P));
			entries.push(StackEntry { reg, obj_reg, ..*entry });
		}
		for (slot, current) in entries.iter().zip(self.stack.entries()) {
			self.f.emit(Insn::Mov { dst: slot.reg, src: current.reg.into() });
			if let (Some(dst), Some(src)) = (slot.obj_reg, current.obj_reg) {
				self.f.emit(Insn::Mov { dst, src: src.into() });
			}
		}
		self.snapshots.insert(offset, Snapshot { entries, label });
		Ok(label)
	}

	/// Transfers the current stack into an existing snapshot: merge the
	/// types (forward edges may widen) and move the registers.
	fn transfer_to_snapshot(&mut self, offset: u32, backward: bool) -> Result<(), JitError> {
		let snapshot = self.snapshots.get_mut(&offset)
			.ok_or(JitError::Verification("branch into untracked code"))?;
		merge_into_snapshot(self.pool, &mut snapshot.entries, self.stack.entries(), backward)?;

		let pairs: Vec<(StackEntry, StackEntry)> = snapshot.entries.iter()
			.zip(self.stack.entries())
			.map(|(a, b)| (*a, *b))
			.collect();
		for (slot, current) in pairs {
			if slot.reg != current.reg {
				self.f.emit(Insn::Mov { dst: slot.reg, src: current.reg.into() });
			}
			if let (Some(dst), Some(src)) = (slot.obj_reg, current.obj_reg) {
				if dst != src {
					self.f.emit(Insn::Mov { dst, src: src.into() });
				}
			}
		}
		Ok(())
	}

	/// Resolves a branch to `target`: validates the edge, records or merges
	/// the snapshot, and returns the label to jump to.
	fn branch_target(&mut self, end: u32, rel: i64) -> Result<Label, JitError> {
		let target = (end as i64 + rel) as u32;
		eh::validate_edge(self.clauses, self.offset, target)?;
		let backward = target <= self.offset;
		match self.snapshots.contains_key(&target) {
			true => {
				self.transfer_to_snapshot(target, backward)?;
				Ok(self.snapshots[&target].label)
			},
			false if backward => Err(JitError::Verification("backward branch without a recorded stack")),
			false => self.record_snapshot(target),
		}
	}

	// ---- small emission helpers -----------------------------------------

	fn push_entry(&mut self, ty: &'l Type<'l>, reg: Reg) -> Result<(), JitError> {
		let (stack_type, double) = classify(ty);
		self.stack.push(StackEntry { ty, stack_type, double, reg, obj_reg: None })
	}

	fn push_with(&mut self, ty: &'l Type<'l>, stack_type: StackType, double: bool, reg: Reg) -> Result<(), JitError> {
		self.stack.push(StackEntry { ty, stack_type, double, reg, obj_reg: None })
	}

	fn primitive(&self, primitive: Primitive) -> &'l Type<'l> {
		self.pool.get_primitive(primitive)
	}

	fn exception_type(&self, name: &'static str) -> Result<&'l Type<'l>, JitError> {
		self.corlib.find_type("System", name)
			.ok_or(JitError::Verification("core exception type missing"))
	}

	fn check_field_access(&self, field: &'l Field<'l>) -> Result<(), JitError> {
		let (Some(from), Some(declared_in)) = (self.method.declaring_type(), field.declaring_type())
		else { return Ok(()) };
		let access = verifier::Accessibility::of_field(field.flags());
		match verifier::can_access_member(from, declared_in, access) {
			true => Ok(()),
			false => Err(JitError::Verification("field is not accessible from this method")),
		}
	}

	fn check_method_access(&self, callee: &'l Method<'l>) -> Result<(), JitError> {
		let (Some(from), Some(declared_in)) = (self.method.declaring_type(), callee.declaring_type())
		else { return Ok(()) };
		let access = verifier::Accessibility::of_method(callee.flags());
		match verifier::can_access_member(from, declared_in, access) {
			true => Ok(()),
			false => Err(JitError::Verification("method is not accessible from this method")),
		}
	}

	fn type_operand(&mut self, ty: &'l Type<'l>) -> Operand {
		let symbol = self.state.type_ref(ty);
		Operand::Sym(self.state.module.sym(&symbol))
	}

	/// Calls a runtime helper. Helpers never raise managed exceptions, so
	/// the exception slot goes to a scratch register.
	fn call_host(&mut self, name: &str, args: Vec<Operand>, want_ret: bool) -> Result<Option<Reg>, JitError> {
		let sym = self.state.module.import(name);
		let proto = self.state.module.proto(Proto {
			params: vec![MirType::I64; args.len()],
			ret: want_ret.then_some(MirType::I64),
		});
		let scratch = self.f.reg(MirType::P);
		let ret = want_ret.then(|| self.f.reg(MirType::I64));
		self.f.emit(Insn::Call { proto, target: CallTarget::Sym(sym), exc: scratch, ret, args });
		Ok(ret)
	}

	/// The unwind edge from the current offset: jump to the enclosing
	/// dispatch chain, or return with the exception register set.
	fn emit_unwind(&mut self) {
		let chain = eh::protecting_clauses(self.clauses, self.offset);
		match chain.is_empty() {
			true => {
				let label = self.propagate();
				self.f.emit(Insn::Jump { target: label });
			},
			false => {
				let label = self.dispatch_label(chain);
				self.f.emit(Insn::Jump { target: label });
			},
		}
	}

	fn propagate(&mut self) -> Label {
		match self.propagate_label {
			Some(label) => label,
			None => {
				let label = self.f.label();
				self.propagate_label = Some(label);
				label
			},
		}
	}

	fn dispatch_label(&mut self, chain: Vec<usize>) -> Label {
		if let Some(label) = self.dispatch_labels.get(&chain) {
			return *label;
		}
		let label = self.f.label();
		self.dispatch_labels.insert(chain.clone(), label);
		self.dispatch_pending.push((chain, label));
		label
	}

	/// Allocates an exception of a core type, sets the exception register
	/// and unwinds. Used for the runtime checks (null, bounds, zero
	/// divisor, bad casts, out of memory).
	fn emit_throw_new(&mut self, name: &'static str) -> Result<(), JitError> {
		let ty = self.exception_type(name)?;
		let ty_operand = self.type_operand(ty);
		let object = self.call_host(RT_NEW_OBJECT, vec![ty_operand], true)?
			.ok_or(JitError::Verification("helper without a result"))?;
		self.f.emit(Insn::Mov { dst: self.exc_reg, src: object.into() });
		self.emit_unwind();
		Ok(())
	}

	fn emit_null_check(&mut self, object: Reg) -> Result<(), JitError> {
		let ok = self.f.label();
		self.f.emit(Insn::Bnz { src: object.into(), target: ok });
		self.emit_throw_new("NullReferenceException")?;
		self.f.bind(ok);
		Ok(())
	}

	/// Every allocation is followed by an out-of-memory check, except when
	/// the allocated type is the out-of-memory exception itself.
	fn emit_oom_check(&mut self, object: Reg, allocated: &'l Type<'l>) -> Result<(), JitError> {
		if allocated.namespace() == "System" && allocated.name() == "OutOfMemoryException" {
			return Ok(());
		}
		let ok = self.f.label();
		self.f.emit(Insn::Bnz { src: object.into(), target: ok });
		self.emit_throw_new("OutOfMemoryException")?;
		self.f.bind(ok);
		Ok(())
	}

	/// The post-call exception test: branch toward the enclosing handler
	/// search, or return the exception to the caller.
	fn emit_exception_check(&mut self) -> Result<(), JitError> {
		let chain = eh::protecting_clauses(self.clauses, self.offset);
		match chain.is_empty() {
			true => {
				let label = self.propagate();
				self.f.emit(Insn::Bnz { src: self.exc_reg.into(), target: label });
			},
			false => {
				let label = self.dispatch_label(chain);
				self.f.emit(Insn::Bnz { src: self.exc_reg.into(), target: label });
			},
		}
		Ok(())
	}

	/// Canonical form of an Int32 result: sign-extended to the full
	/// register so later comparisons work at either width.
	fn canon_i32(&mut self, reg: Reg) {
		self.f.emit(Insn::Ext { dst: reg, src: reg.into(), bits: 32, signed: true });
	}

	// ---- values in memory ------------------------------------------------

	/// Loads a value of `ty` from `[base + offset]` and pushes it.
	fn emit_load_value(&mut self, base: Operand, offset: i32, ty: &'l Type<'l>) -> Result<(), JitError> {
		let (stack_type, double) = classify(ty);
		match stack_type {
			StackType::ValueType => {
				let size = ty.stack_size().max(1);
				let buffer = self.f.reg(MirType::P);
				self.f.emit(Insn::Alloca { dst: buffer, size });
				let src = self.address_into_reg(base, offset);
				self.f.emit(Insn::Memcpy { dst: buffer.into(), src: src.into(), len: size });
				self.push_with(ty, stack_type, double, buffer)
			},
			_ => {
				let reg = self.f.reg(mir_type_for(stack_type, double));
				self.f.emit(Insn::Load { dst: reg, base, offset, size: value_mem_size(ty) });
				if ty.is_interface() {
					// Memory holds the plain object pointer; the stack form
					// is a fat pointer, so materialize the slice half.
					let ty_operand = self.type_operand(ty);
					let slice = self.call_host(RT_CAST_TO_INTERFACE, vec![reg.into(), ty_operand], true)?
						.ok_or(JitError::Verification("helper without a result"))?;
					return self.stack.push(StackEntry {
						ty,
						stack_type: StackType::Object,
						double: false,
						reg: slice,
						obj_reg: Some(reg),
					});
				}
				self.push_with(ty, stack_type, double, reg)
			},
		}
	}

	/// Computes `base + offset` into a fresh pointer register.
	fn address_into_reg(&mut self, base: Operand, offset: i32) -> Reg {
		let reg = self.f.reg(MirType::P);
		match offset {
			0 => self.f.emit(Insn::Mov { dst: reg, src: base }),
			_ => self.f.emit(Insn::Bin { op: BinOp::Add, dst: reg, a: base, b: Operand::Imm(offset as i64) }),
		}
		reg
	}

	/// Checks that `entry` may be stored into a location of type `target`,
	/// and returns the operand to store (with float width adjusted).
	fn coerce_store(&mut self, entry: &StackEntry<'l>, target: &'l Type<'l>) -> Result<Operand, JitError> {
		if entry.stack_type == StackType::Float {
			let target_double = matches!(target.underlying_type().primitive(), Some(Primitive::Double));
			if classify(target).0 != StackType::Float {
				return Err(JitError::Verification("float stored into a non-float location"));
			}
			if entry.double == target_double {
				return Ok(entry.reg.into());
			}
			// Storage implicitly narrows or widens the float.
			let converted = self.f.reg(match target_double {
				true => MirType::D,
				false => MirType::F,
			});
			let kind = match target_double {
				true => ConvKind::FToD,
				false => ConvKind::DToF,
			};
			self.f.emit(Insn::Conv { kind, dst: converted, src: entry.reg.into() });
			return Ok(converted.into());
		}

		if !verifier::verifier_assignable_to(self.pool, entry.ty, target) {
			return Err(JitError::Verification("value is not assignable to its destination"));
		}
		match entry.ty.is_interface() {
			// The memory form of an interface value is the object pointer.
			true => Ok(entry.obj_reg.unwrap_or(entry.reg).into()),
			false => Ok(entry.reg.into()),
		}
	}

	/// How a store of `entry` into a heap-reachable location must interact
	/// with the collector.
	fn emit_store_value(
		&mut self,
		base: Operand,
		offset: i32,
		entry: &StackEntry<'l>,
		target_ty: &'l Type<'l>,
		barrier: Barrier,
	) -> Result<(), JitError> {
		let value = self.coerce_store(entry, target_ty)?;

		if target_ty.is_object_ref() || std::ptr::eq(entry.ty, self.pool.null_type()) {
			match barrier {
				Barrier::Object(object) => {
					// gc_update performs the store and the barrier.
					self.call_host(RT_GC_UPDATE, vec![object.into(), Operand::Imm(offset as i64), value], false)?;
				},
				Barrier::Ref => {
					let address = self.address_into_reg(base, offset);
					self.call_host(RT_GC_UPDATE_REF, vec![address.into(), value], false)?;
				},
				Barrier::None => {
					self.f.emit(Insn::Store { src: value, base, offset, size: MemSize::P });
				},
			}
			return Ok(());
		}

		if classify(target_ty).0 == StackType::ValueType {
			let size = target_ty.stack_size().max(1);
			let destination = self.address_into_reg(base, offset);
			self.f.emit(Insn::Memcpy { dst: destination.into(), src: value, len: size });

			// Managed pointers inside the payload re-issue their barriers.
			let offsets = target_ty.managed_pointer_offsets().to_vec();
			for pointer_offset in offsets {
				let slot = self.f.reg(MirType::P);
				self.f.emit(Insn::Load {
					dst: slot,
					base: value,
					offset: pointer_offset as i32,
					size: MemSize::P,
				});
				match barrier {
					Barrier::Object(object) => {
						self.call_host(RT_GC_UPDATE, vec![
							object.into(),
							Operand::Imm(offset as i64 + pointer_offset as i64),
							slot.into(),
						], false)?;
					},
					Barrier::Ref => {
						let address = self.address_into_reg(
							destination.into(),
							pointer_offset as i32,
						);
						self.call_host(RT_GC_UPDATE_REF, vec![address.into(), slot.into()], false)?;
					},
					Barrier::None => {},
				}
			}
			return Ok(());
		}

		self.f.emit(Insn::Store { src: value, base, offset, size: value_mem_size(target_ty) });
		Ok(())
	}

	// ---- the instruction dispatch ---------------------------------------

	fn translate_op(&mut self, op: &OpCode<'l>, end: u32) -> Result<(), JitError> {
		match *op {
			OpCode::nop | OpCode::dbg_break => {},

			// Constants.
			OpCode::ldnull => {
				let reg = self.f.reg(MirType::P);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::Imm(0) });
				self.push_with(self.pool.null_type(), StackType::Object, false, reg)?;
			},
			OpCode::ldc_i4_m1 => self.emit_ldc_i4(-1)?,
			OpCode::ldc_i4_0 => self.emit_ldc_i4(0)?,
			OpCode::ldc_i4_1 => self.emit_ldc_i4(1)?,
			OpCode::ldc_i4_2 => self.emit_ldc_i4(2)?,
			OpCode::ldc_i4_3 => self.emit_ldc_i4(3)?,
			OpCode::ldc_i4_4 => self.emit_ldc_i4(4)?,
			OpCode::ldc_i4_5 => self.emit_ldc_i4(5)?,
			OpCode::ldc_i4_6 => self.emit_ldc_i4(6)?,
			OpCode::ldc_i4_7 => self.emit_ldc_i4(7)?,
			OpCode::ldc_i4_8 => self.emit_ldc_i4(8)?,
			OpCode::ldc_i4_s(value) => self.emit_ldc_i4(value as i32)?,
			OpCode::ldc_i4(value) => self.emit_ldc_i4(value)?,
			OpCode::ldc_i8(value) => {
				let reg = self.f.reg(MirType::I64);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::Imm(value) });
				self.push_entry(self.primitive(Primitive::Int64), reg)?;
			},
			OpCode::ldc_r4(value) => {
				let reg = self.f.reg(MirType::F);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::ImmF(value) });
				self.push_entry(self.primitive(Primitive::Float), reg)?;
			},
			OpCode::ldc_r8(value) => {
				let reg = self.f.reg(MirType::D);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::ImmD(value) });
				self.push_entry(self.primitive(Primitive::Double), reg)?;
			},
			OpCode::ldstr(token) => {
				let literal = self.assembly.user_string(token)?;
				let symbol = self.state.string_slot(&literal);
				let sym = self.state.module.sym(&symbol);
				let reg = self.f.reg(MirType::P);
				self.f.emit(Insn::Load { dst: reg, base: Operand::Sym(sym), offset: 0, size: MemSize::P });
				self.push_entry(self.pool.string_base(), reg)?;
			},

			// Stack shuffling.
			OpCode::dup => {
				let entry = *self.stack.peek()?;
				match entry.stack_type {
					StackType::ValueType => {
						let size = entry.ty.stack_size().max(1);
						let buffer = self.f.reg(MirType::P);
						self.f.emit(Insn::Alloca { dst: buffer, size });
						self.f.emit(Insn::Memcpy { dst: buffer.into(), src: entry.reg.into(), len: size });
						self.stack.push(StackEntry { reg: buffer, ..entry })?;
					},
					_ => self.stack.push(entry)?,
				}
			},
			OpCode::pop => {
				self.stack.pop()?;
			},

			// Arguments and locals.
			OpCode::ldarg_0 => self.emit_ldarg(0)?,
			OpCode::ldarg_1 => self.emit_ldarg(1)?,
			OpCode::ldarg_2 => self.emit_ldarg(2)?,
			OpCode::ldarg_3 => self.emit_ldarg(3)?,
			OpCode::ldarg_s(index) => self.emit_ldarg(index as u16)?,
			OpCode::starg_s(index) => self.emit_starg(index as u16)?,
			OpCode::ldarga_s(index) => self.emit_ldarga(index as u16)?,
			OpCode::ldloc_0 => self.emit_ldloc(0)?,
			OpCode::ldloc_1 => self.emit_ldloc(1)?,
			OpCode::ldloc_2 => self.emit_ldloc(2)?,
			OpCode::ldloc_3 => self.emit_ldloc(3)?,
			OpCode::ldloc_s(index) => self.emit_ldloc(index as u16)?,
			OpCode::stloc_0 => self.emit_stloc(0)?,
			OpCode::stloc_1 => self.emit_stloc(1)?,
			OpCode::stloc_2 => self.emit_stloc(2)?,
			OpCode::stloc_3 => self.emit_stloc(3)?,
			OpCode::stloc_s(index) => self.emit_stloc(index as u16)?,
			OpCode::ldloca_s(index) => self.emit_ldloca(index as u16)?,

			// Arithmetic.
			OpCode::add => self.emit_binary(BinOp::Add, FBinOp::Add, false, false)?,
			OpCode::sub => self.emit_binary(BinOp::Sub, FBinOp::Sub, false, false)?,
			OpCode::mul => self.emit_binary(BinOp::Mul, FBinOp::Mul, false, false)?,
			OpCode::div => self.emit_binary(BinOp::Div, FBinOp::Div, false, true)?,
			OpCode::div_un => self.emit_binary(BinOp::DivU, FBinOp::Div, true, true)?,
			OpCode::rem => self.emit_binary(BinOp::Rem, FBinOp::Div, true, true)?,
			OpCode::rem_un => self.emit_binary(BinOp::RemU, FBinOp::Div, true, true)?,
			OpCode::and => self.emit_binary(BinOp::And, FBinOp::Add, true, false)?,
			OpCode::or => self.emit_binary(BinOp::Or, FBinOp::Add, true, false)?,
			OpCode::xor => self.emit_binary(BinOp::Xor, FBinOp::Add, true, false)?,
			OpCode::shl => self.emit_shift(BinOp::Shl)?,
			OpCode::shr => self.emit_shift(BinOp::Shr)?,
			OpCode::shr_un => self.emit_shift(BinOp::ShrU)?,
			OpCode::neg => {
				let entry = self.stack.pop()?;
				let reg = self.f.reg(mir_type_for(entry.stack_type, entry.double));
				match entry.stack_type {
					StackType::Float => {
						let ty = float_mir(entry.double);
						self.f.emit(Insn::FNeg { ty, dst: reg, src: entry.reg.into() });
					},
					StackType::Int32 | StackType::Int64 | StackType::IntPtr => {
						self.f.emit(Insn::Neg { dst: reg, src: entry.reg.into() });
						if entry.stack_type == StackType::Int32 {
							self.canon_i32(reg);
						}
					},
					_ => return Err(JitError::Verification("neg on a non-numeric value")),
				}
				self.stack.push(StackEntry { reg, ..entry })?;
			},
			OpCode::not => {
				let entry = self.stack.pop()?;
				if !matches!(entry.stack_type, StackType::Int32 | StackType::Int64 | StackType::IntPtr) {
					return Err(JitError::Verification("not on a non-integer value"));
				}
				let reg = self.f.reg(MirType::I64);
				self.f.emit(Insn::Not { dst: reg, src: entry.reg.into() });
				if entry.stack_type == StackType::Int32 {
					self.canon_i32(reg);
				}
				self.stack.push(StackEntry { reg, ..entry })?;
			},
			OpCode::ckfinite => {
				let entry = *self.stack.peek()?;
				if entry.stack_type != StackType::Float {
					return Err(JitError::Verification("ckfinite on a non-float value"));
				}
				// x - x is NaN exactly when x is NaN or infinite.
				let ty = float_mir(entry.double);
				let probe = self.f.reg(ty);
				self.f.emit(Insn::FBin { op: FBinOp::Sub, ty, dst: probe, a: entry.reg.into(), b: entry.reg.into() });
				let finite = self.f.reg(MirType::I64);
				self.f.emit(Insn::FCmp { pred: Pred::Eq, ty, dst: finite, a: probe.into(), b: probe.into() });
				let ok = self.f.label();
				self.f.emit(Insn::Bnz { src: finite.into(), target: ok });
				self.emit_throw_new("ArithmeticException")?;
				self.f.bind(ok);
			},

			// Overflow-checked arithmetic.
			OpCode::add_ovf => self.emit_binary_ovf(BinOp::Add, true)?,
			OpCode::add_ovf_un => self.emit_binary_ovf(BinOp::Add, false)?,
			OpCode::sub_ovf => self.emit_binary_ovf(BinOp::Sub, true)?,
			OpCode::sub_ovf_un => self.emit_binary_ovf(BinOp::Sub, false)?,
			OpCode::mul_ovf => self.emit_binary_ovf(BinOp::Mul, true)?,
			OpCode::mul_ovf_un => self.emit_binary_ovf(BinOp::Mul, false)?,

			// Comparisons.
			OpCode::compound(CompoundOpCode::ceq) => self.emit_compare(Pred::Eq)?,
			OpCode::compound(CompoundOpCode::cgt) => self.emit_compare(Pred::Gt)?,
			OpCode::compound(CompoundOpCode::cgt_un) => self.emit_compare(Pred::Ugt)?,
			OpCode::compound(CompoundOpCode::clt) => self.emit_compare(Pred::Lt)?,
			OpCode::compound(CompoundOpCode::clt_un) => self.emit_compare(Pred::Ult)?,

			// Conversions.
			OpCode::conv_i1 => self.emit_conv_int(8, true)?,
			OpCode::conv_u1 => self.emit_conv_int(8, false)?,
			OpCode::conv_i2 => self.emit_conv_int(16, true)?,
			OpCode::conv_u2 => self.emit_conv_int(16, false)?,
			OpCode::conv_i4 => self.emit_conv_int(32, true)?,
			OpCode::conv_u4 => self.emit_conv_int(32, true)?,
			OpCode::conv_i8 => self.emit_conv_long(Primitive::Int64)?,
			OpCode::conv_u8 => self.emit_conv_long(Primitive::UInt64)?,
			OpCode::conv_i => self.emit_conv_long(Primitive::IntPtr)?,
			OpCode::conv_u => {
				// Zero-extends an int32 source to the native width.
				let entry = *self.stack.peek()?;
				if entry.stack_type == StackType::Int32 {
					let entry = self.stack.pop()?;
					let reg = self.f.reg(MirType::I64);
					self.f.emit(Insn::Ext { dst: reg, src: entry.reg.into(), bits: 32, signed: false });
					self.push_entry(self.primitive(Primitive::UIntPtr), reg)?;
				} else {
					self.emit_conv_long(Primitive::UIntPtr)?;
				}
			},
			OpCode::conv_r4 => self.emit_conv_float(false)?,
			OpCode::conv_r8 => self.emit_conv_float(true)?,
			OpCode::conv_r_un => {
				let entry = self.stack.pop()?;
				let source = self.unsigned_source(&entry)?;
				let reg = self.f.reg(MirType::D);
				self.f.emit(Insn::Conv { kind: ConvKind::U64ToD, dst: reg, src: source.into() });
				self.push_entry(self.primitive(Primitive::Double), reg)?;
			},

			OpCode::conv_ovf_i1 => self.emit_conv_ovf(8, true, true)?,
			OpCode::conv_ovf_u1 => self.emit_conv_ovf(8, false, true)?,
			OpCode::conv_ovf_i2 => self.emit_conv_ovf(16, true, true)?,
			OpCode::conv_ovf_u2 => self.emit_conv_ovf(16, false, true)?,
			OpCode::conv_ovf_i4 => self.emit_conv_ovf(32, true, true)?,
			OpCode::conv_ovf_u4 => self.emit_conv_ovf(32, false, true)?,
			OpCode::conv_ovf_i8 | OpCode::conv_ovf_i => self.emit_conv_ovf(64, true, true)?,
			OpCode::conv_ovf_u8 | OpCode::conv_ovf_u => self.emit_conv_ovf(64, false, true)?,
			OpCode::conv_ovf_i1_un => self.emit_conv_ovf(8, true, false)?,
			OpCode::conv_ovf_u1_un => self.emit_conv_ovf(8, false, false)?,
			OpCode::conv_ovf_i2_un => self.emit_conv_ovf(16, true, false)?,
			OpCode::conv_ovf_u2_un => self.emit_conv_ovf(16, false, false)?,
			OpCode::conv_ovf_i4_un => self.emit_conv_ovf(32, true, false)?,
			OpCode::conv_ovf_u4_un => self.emit_conv_ovf(32, false, false)?,
			OpCode::conv_ovf_i8_un | OpCode::conv_ovf_i_un => self.emit_conv_ovf(64, true, false)?,
			OpCode::conv_ovf_u8_un | OpCode::conv_ovf_u_un => self.emit_conv_ovf(64, false, false)?,

			// Branches.
			OpCode::br_s(rel) => self.emit_br(end, rel as i64)?,
			OpCode::br(rel) => self.emit_br(end, rel as i64)?,
			OpCode::brfalse_s(rel) => self.emit_br_bool(end, rel as i64, false)?,
			OpCode::brfalse(rel) => self.emit_br_bool(end, rel as i64, false)?,
			OpCode::brtrue_s(rel) => self.emit_br_bool(end, rel as i64, true)?,
			OpCode::brtrue(rel) => self.emit_br_bool(end, rel as i64, true)?,
			OpCode::beq_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Eq)?,
			OpCode::beq(rel) => self.emit_br_cmp(end, rel as i64, Pred::Eq)?,
			OpCode::bge_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ge)?,
			OpCode::bge(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ge)?,
			OpCode::bgt_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Gt)?,
			OpCode::bgt(rel) => self.emit_br_cmp(end, rel as i64, Pred::Gt)?,
			OpCode::ble_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Le)?,
			OpCode::ble(rel) => self.emit_br_cmp(end, rel as i64, Pred::Le)?,
			OpCode::blt_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Lt)?,
			OpCode::blt(rel) => self.emit_br_cmp(end, rel as i64, Pred::Lt)?,
			OpCode::bne_un_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ne)?,
			OpCode::bne_un(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ne)?,
			OpCode::bge_un_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Uge)?,
			OpCode::bge_un(rel) => self.emit_br_cmp(end, rel as i64, Pred::Uge)?,
			OpCode::bgt_un_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ugt)?,
			OpCode::bgt_un(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ugt)?,
			OpCode::ble_un_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ule)?,
			OpCode::ble_un(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ule)?,
			OpCode::blt_un_s(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ult)?,
			OpCode::blt_un(rel) => self.emit_br_cmp(end, rel as i64, Pred::Ult)?,
			OpCode::switch(table) => {
				let entry = self.stack.pop()?;
				if !matches!(entry.stack_type, StackType::Int32 | StackType::IntPtr) {
					return Err(JitError::Verification("switch selector is not an integer"));
				}
				let mut labels = vec![];
				for rel in table.variants() {
					labels.push(self.branch_target(end, rel as i64)?);
				}
				self.f.emit(Insn::Switch { src: entry.reg.into(), targets: labels });
			},

			// Indirect loads and stores.
			OpCode::ldind_i1 => self.emit_ldind(Primitive::Int8)?,
			OpCode::ldind_u1 => self.emit_ldind(Primitive::UInt8)?,
			OpCode::ldind_i2 => self.emit_ldind(Primitive::Int16)?,
			OpCode::ldind_u2 => self.emit_ldind(Primitive::UInt16)?,
			OpCode::ldind_i4 => self.emit_ldind(Primitive::Int32)?,
			OpCode::ldind_u4 => self.emit_ldind(Primitive::UInt32)?,
			OpCode::ldind_i8 => self.emit_ldind(Primitive::Int64)?,
			OpCode::ldind_i => self.emit_ldind(Primitive::IntPtr)?,
			OpCode::ldind_r4 => self.emit_ldind(Primitive::Float)?,
			OpCode::ldind_r8 => self.emit_ldind(Primitive::Double)?,
			OpCode::ldind_ref => {
				let address = self.stack.pop()?;
				let referent = self.byref_referent(&address)?;
				self.emit_load_value(address.reg.into(), 0, referent)?;
			},
			OpCode::stind_i1 => self.emit_stind(Primitive::Int8)?,
			OpCode::stind_i2 => self.emit_stind(Primitive::Int16)?,
			OpCode::stind_i4 => self.emit_stind(Primitive::Int32)?,
			OpCode::stind_i8 => self.emit_stind(Primitive::Int64)?,
			OpCode::stind_i => self.emit_stind(Primitive::IntPtr)?,
			OpCode::stind_r4 => self.emit_stind(Primitive::Float)?,
			OpCode::stind_r8 => self.emit_stind(Primitive::Double)?,
			OpCode::stind_ref => {
				let value = self.stack.pop()?;
				let address = self.stack.pop()?;
				let referent = self.byref_referent(&address)?;
				self.emit_store_value(address.reg.into(), 0, &value, referent, Barrier::Ref)?;
			},
			OpCode::ldobj(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let address = self.stack.pop()?;
				self.byref_referent(&address)?;
				self.emit_load_value(address.reg.into(), 0, ty)?;
			},
			OpCode::stobj(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let value = self.stack.pop()?;
				let address = self.stack.pop()?;
				self.byref_referent(&address)?;
				self.emit_store_value(address.reg.into(), 0, &value, ty, Barrier::Ref)?;
			},
			OpCode::cpobj(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let source = self.stack.pop()?;
				let destination = self.stack.pop()?;
				self.byref_referent(&source)?;
				self.byref_referent(&destination)?;
				let loaded = StackEntry {
					ty,
					stack_type: classify(ty).0,
					double: classify(ty).1,
					reg: source.reg,
					obj_reg: None,
				};
				match classify(ty).0 {
					StackType::ValueType => {
						self.emit_store_value(destination.reg.into(), 0, &loaded, ty, Barrier::Ref)?;
					},
					_ => {
						self.emit_load_value(source.reg.into(), 0, ty)?;
						let value = self.stack.pop()?;
						self.emit_store_value(destination.reg.into(), 0, &value, ty, Barrier::Ref)?;
					},
				}
			},
			OpCode::compound(CompoundOpCode::initobj(token)) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let address = self.stack.pop()?;
				self.byref_referent(&address)?;
				match ty.is_value_type() {
					true => self.f.emit(Insn::Memset {
						dst: address.reg.into(),
						value: 0,
						len: ty.stack_size().max(1),
					}),
					false => self.f.emit(Insn::Store {
						src: Operand::Imm(0),
						base: address.reg.into(),
						offset: 0,
						size: MemSize::P,
					}),
				}
			},

			// Fields.
			OpCode::ldfld(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				let object = self.stack.pop()?;
				let (base, offset) = self.field_address(&object, field)?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				self.emit_load_value(base, offset, field_ty)?;
			},
			OpCode::ldflda(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				let object = self.stack.pop()?;
				let (base, offset) = self.field_address(&object, field)?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				let address = self.address_into_reg(base, offset);
				self.push_entry(self.pool.get_byref(field_ty)?, address)?;
			},
			OpCode::stfld(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				let value = self.stack.pop()?;
				let object = self.stack.pop()?;
				let (base, offset) = self.field_address(&object, field)?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				let barrier = match object.stack_type {
					StackType::Object => Barrier::Object(object.obj_reg.unwrap_or(object.reg)),
					_ => Barrier::Ref,
				};
				self.emit_store_value(base, offset, &value, field_ty, barrier)?;
			},
			OpCode::ldsfld(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				let base = self.static_base(field)?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				self.emit_load_value(base, 0, field_ty)?;
			},
			OpCode::ldsflda(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				let base = self.static_base(field)?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				let address = self.address_into_reg(base, 0);
				self.push_entry(self.pool.get_byref(field_ty)?, address)?;
			},
			OpCode::stsfld(token) => {
				let field = self.assembly.resolve_field_token(token)?;
				self.check_field_access(field)?;
				if field.is_init_only() && !self.method.is_rt_special_name() {
					return Err(JitError::Verification("init-only static written outside an initializer"));
				}
				let base = self.static_base(field)?;
				let value = self.stack.pop()?;
				let field_ty = field.field_type()
					.ok_or(JitError::Verification("field type unresolved"))?;
				// Statics live off-heap; roots were registered at link time.
				self.emit_store_value(base, 0, &value, field_ty, Barrier::None)?;
			},

			// Object model.
			OpCode::newobj(token) => self.emit_newobj(token)?,
			OpCode::box_val(token) => self.emit_box(token)?,
			OpCode::unbox_any(token) => self.emit_unbox_any(token)?,
			OpCode::unbox(token) => self.emit_unbox(token)?,
			OpCode::isinst(token) => self.emit_isinst(token)?,
			OpCode::castclass(token) => self.emit_castclass(token)?,
			OpCode::compound(CompoundOpCode::sizeof(token)) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let reg = self.f.reg(MirType::I64);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::Imm(ty.stack_size().max(1) as i64) });
				self.push_entry(self.primitive(Primitive::UInt32), reg)?;
			},
			OpCode::compound(CompoundOpCode::ldftn(token)) => {
				let callee = self.assembly.resolve_method_token(token)?;
				let symbol = method_symbol(callee);
				let sym = self.method_sym(callee, &symbol);
				let reg = self.f.reg(MirType::P);
				self.f.emit(Insn::Mov { dst: reg, src: Operand::Sym(sym) });
				self.push_entry(self.primitive(Primitive::IntPtr), reg)?;
			},
			OpCode::compound(CompoundOpCode::ldvirtftn(token)) => {
				let callee = self.assembly.resolve_method_token(token)?;
				let object = self.stack.pop()?;
				self.emit_null_check(object.reg)?;
				let slot = callee.vtable_offset()
					.ok_or(JitError::Verification("ldvirtftn of a non-virtual method"))?;
				let vtable = self.f.reg(MirType::P);
				self.f.emit(Insn::Load { dst: vtable, base: object.reg.into(), offset: 0, size: MemSize::P });
				let reg = self.f.reg(MirType::P);
				self.f.emit(Insn::Load {
					dst: reg,
					base: vtable.into(),
					offset: (VTABLE_FUNCS_OFFSET + slot as u32 * POINTER_SIZE) as i32,
					size: MemSize::P,
				});
				self.push_entry(self.primitive(Primitive::IntPtr), reg)?;
			},

			// Arrays.
			OpCode::newarr(token) => {
				let element = self.assembly.resolve_type_token(token)?;
				let array_ty = self.pool.get_array(element);
				let length = self.stack.pop()?;
				if !matches!(length.stack_type, StackType::Int32 | StackType::IntPtr) {
					return Err(JitError::Verification("newarr length is not an integer"));
				}
				let ty_operand = self.type_operand(array_ty);
				let object = self.call_host(RT_NEW_ARRAY, vec![ty_operand, length.reg.into()], true)?
					.ok_or(JitError::Verification("helper without a result"))?;
				self.emit_oom_check(object, array_ty)?;
				self.push_entry(array_ty, object)?;
			},
			OpCode::ldlen => {
				let array = self.stack.pop()?;
				self.require_array(&array)?;
				self.emit_null_check(array.reg)?;
				let reg = self.f.reg(MirType::I64);
				self.f.emit(Insn::Load {
					dst: reg,
					base: array.reg.into(),
					offset: ARRAY_LENGTH_OFFSET as i32,
					size: MemSize::I64,
				});
				self.push_entry(self.primitive(Primitive::UIntPtr), reg)?;
			},
			OpCode::ldelem_i1 => self.emit_ldelem_primitive(Primitive::Int8)?,
			OpCode::ldelem_u1 => self.emit_ldelem_primitive(Primitive::UInt8)?,
			OpCode::ldelem_i2 => self.emit_ldelem_primitive(Primitive::Int16)?,
			OpCode::ldelem_u2 => self.emit_ldelem_primitive(Primitive::UInt16)?,
			OpCode::ldelem_i4 => self.emit_ldelem_primitive(Primitive::Int32)?,
			OpCode::ldelem_u4 => self.emit_ldelem_primitive(Primitive::UInt32)?,
			OpCode::ldelem_i8 => self.emit_ldelem_primitive(Primitive::Int64)?,
			OpCode::ldelem_i => self.emit_ldelem_primitive(Primitive::IntPtr)?,
			OpCode::ldelem_r4 => self.emit_ldelem_primitive(Primitive::Float)?,
			OpCode::ldelem_r8 => self.emit_ldelem_primitive(Primitive::Double)?,
			OpCode::ldelem_ref => {
				let (array, address) = self.emit_element_address(None)?;
				let element = array.ty.element_type()
					.ok_or(JitError::Verification("array without element type"))?;
				self.emit_load_value(address.into(), 0, element)?;
			},
			OpCode::ldelem(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let (_, address) = self.emit_element_address(Some(ty))?;
				self.emit_load_value(address.into(), 0, ty)?;
			},
			OpCode::ldelema(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let (_, address) = self.emit_element_address(Some(ty))?;
				self.push_entry(self.pool.get_byref(ty)?, address)?;
			},
			OpCode::stelem_i1 => self.emit_stelem_primitive(Primitive::Int8)?,
			OpCode::stelem_i2 => self.emit_stelem_primitive(Primitive::Int16)?,
			OpCode::stelem_i4 => self.emit_stelem_primitive(Primitive::Int32)?,
			OpCode::stelem_i8 => self.emit_stelem_primitive(Primitive::Int64)?,
			OpCode::stelem_i => self.emit_stelem_primitive(Primitive::IntPtr)?,
			OpCode::stelem_r4 => self.emit_stelem_primitive(Primitive::Float)?,
			OpCode::stelem_r8 => self.emit_stelem_primitive(Primitive::Double)?,
			OpCode::stelem_ref => {
				let value = self.stack.pop()?;
				let (array, address) = self.emit_element_address(None)?;
				let element = array.ty.element_type()
					.ok_or(JitError::Verification("array without element type"))?;
				self.emit_store_value(address.into(), 0, &value, element, Barrier::Ref)?;
			},
			OpCode::stelem(token) => {
				let ty = self.assembly.resolve_type_token(token)?;
				let value = self.stack.pop()?;
				let (_, address) = self.emit_element_address(Some(ty))?;
				self.emit_store_value(address.into(), 0, &value, ty, Barrier::Ref)?;
			},

			// Calls.
			OpCode::call(token) => {
				let callee = self.assembly.resolve_method_token(token)?;
				// A call to a virtual method stays statically bound.
				self.emit_call(callee, false)?;
			},
			OpCode::callvirt(token) => {
				let callee = self.assembly.resolve_method_token(token)?;
				let constrained = self.constrained.take();
				match constrained {
					Some(ty) if ty.is_value_type() => {
						let target = ty.find_method(callee.name())
							.ok_or(JitError::Unsupported("constrained call outside the value type"))?;
						self.emit_call(target, false)?;
					},
					_ => self.emit_call(callee, callee.is_virtual())?,
				}
			},

			// Exceptions.
			OpCode::throw => {
				let entry = self.stack.pop()?;
				if entry.stack_type != StackType::Object {
					return Err(JitError::Verification("throw of a non-object value"));
				}
				self.emit_null_check(entry.reg)?;
				self.f.emit(Insn::Mov { dst: self.exc_reg, src: entry.reg.into() });
				self.emit_unwind();
				self.stack.clear();
				self.reachable = false;
			},
			OpCode::compound(CompoundOpCode::rethrow) => {
				let handlers = eh::handler_clauses(self.clauses, self.offset);
				let catch = handlers.iter()
					.find(|index| self.clause_states[**index].catch_exc.is_some())
					.copied()
					.ok_or(JitError::Verification("rethrow outside a catch handler"))?;
				let saved = self.clause_states[catch].catch_exc
					.ok_or(JitError::Verification("rethrow outside a catch handler"))?;
				self.f.emit(Insn::Mov { dst: self.exc_reg, src: saved.into() });
				self.emit_unwind();
				self.stack.clear();
				self.reachable = false;
			},
			OpCode::leave(rel) => self.emit_leave(end, rel as i64)?,
			OpCode::leave_s(rel) => self.emit_leave(end, rel as i64)?,
			OpCode::endfinally => {
				let handlers = eh::handler_clauses(self.clauses, self.offset);
				let clause = handlers.first().copied()
					.ok_or(JitError::Verification("endfinally outside a handler"))?;
				if self.clause_states[clause].link_reg.is_none() {
					return Err(JitError::Verification("endfinally inside a catch handler"));
				}
				let label = match self.clause_states[clause].endfinally_label {
					Some(label) => label,
					None => {
						let label = self.f.label();
						self.clause_states[clause].endfinally_label = Some(label);
						label
					},
				};
				self.f.emit(Insn::Jump { target: label });
				self.stack.clear();
				self.reachable = false;
			},

			// Return.
			OpCode::ret => {
				let return_type = self.method.return_type()
					.ok_or(JitError::Verification("method signature unresolved"))?;
				if is_void(return_type) {
					if !self.stack.is_empty() {
						return Err(JitError::Verification("stack not empty at return"));
					}
					self.f.emit(Insn::Ret { exc: Operand::Imm(0), value: None });
				} else {
					let entry = self.stack.pop()?;
					if !self.stack.is_empty() {
						return Err(JitError::Verification("stack not empty at return"));
					}
					match self.ret_block {
						Some(block) => {
							let value = self.coerce_store(&entry, return_type)?;
							self.f.emit(Insn::Memcpy {
								dst: block.into(),
								src: value,
								len: return_type.stack_size().max(1),
							});
							self.f.emit(Insn::Ret { exc: Operand::Imm(0), value: None });
						},
						None => {
							let value = self.coerce_store(&entry, return_type)?;
							self.f.emit(Insn::Ret { exc: Operand::Imm(0), value: Some(value) });
						},
					}
				}
				self.stack.clear();
				self.reachable = false;
			},

			// Prefixes.
			OpCode::compound(CompoundOpCode::volatile)
			| OpCode::compound(CompoundOpCode::unaligned(_))
			| OpCode::compound(CompoundOpCode::readonly)
			| OpCode::compound(CompoundOpCode::tail) => {},
			OpCode::compound(CompoundOpCode::constrained(token)) => {
				self.constrained = Some(self.assembly.resolve_type_token(token)?);
			},
			OpCode::compound(CompoundOpCode::no_chk(_)) => {},

			OpCode::compound(CompoundOpCode::ldarg(index)) => self.emit_ldarg(index)?,
			OpCode::compound(CompoundOpCode::ldarga(index)) => self.emit_ldarga(index)?,
			OpCode::compound(CompoundOpCode::starg(index)) => self.emit_starg(index)?,
			OpCode::compound(CompoundOpCode::ldloc(index)) => self.emit_ldloc(index)?,
			OpCode::compound(CompoundOpCode::ldloca(index)) => self.emit_ldloca(index)?,
			OpCode::compound(CompoundOpCode::stloc(index)) => self.emit_stloc(index)?,

			OpCode::ldtoken(_)
			| OpCode::jmp(_)
			| OpCode::calli(_)
			| OpCode::mkrefany(_)
			| OpCode::refanyval(_)
			| OpCode::compound(CompoundOpCode::arglist)
			| OpCode::compound(CompoundOpCode::localloc)
			| OpCode::compound(CompoundOpCode::endfilter)
			| OpCode::compound(CompoundOpCode::cpblk)
			| OpCode::compound(CompoundOpCode::initblk)
			| OpCode::compound(CompoundOpCode::refanytype) => {
				return Err(JitError::Unsupported("opcode outside the verified subset"));
			},
		}
		Ok(())
	}

	// ---- constants, locals, arguments -----------------------------------

	fn emit_ldc_i4(&mut self, value: i32) -> Result<(), JitError> {
		let reg = self.f.reg(MirType::I64);
		self.f.emit(Insn::Mov { dst: reg, src: Operand::Imm(value as i64) });
		self.push_entry(self.primitive(Primitive::Int32), reg)
	}

	fn slot(&self, slots: &[Slot<'l>], index: u16, what: &'static str) -> Result<Slot<'l>, JitError> {
		slots.get(index as usize).copied().ok_or(JitError::Verification(what))
	}

	fn emit_load_slot(&mut self, slot: Slot<'l>) -> Result<(), JitError> {
		match (slot.memory, slot.stack_type) {
			(true, StackType::ValueType) => self.emit_load_value(slot.reg.into(), 0, slot.ty),
			(true, _) => self.emit_load_value(slot.reg.into(), 0, slot.ty),
			(false, _) => {
				if slot.ty.is_interface() {
					let ty_operand = self.type_operand(slot.ty);
					let slice = self.call_host(RT_CAST_TO_INTERFACE, vec![slot.reg.into(), ty_operand], true)?
						.ok_or(JitError::Verification("helper without a result"))?;
					return self.stack.push(StackEntry {
						ty: slot.ty,
						stack_type: StackType::Object,
						double: false,
						reg: slice,
						obj_reg: Some(slot.reg),
					});
				}
				let reg = self.f.reg(mir_type_for(slot.stack_type, slot.double));
				self.f.emit(Insn::Mov { dst: reg, src: slot.reg.into() });
				self.push_with(slot.ty, slot.stack_type, slot.double, reg)
			},
		}
	}

	fn emit_store_slot(&mut self, slot: Slot<'l>) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		match slot.memory {
			true => self.emit_store_value(slot.reg.into(), 0, &entry, slot.ty, Barrier::None),
			false => {
				let value = self.coerce_store(&entry, slot.ty)?;
				self.f.emit(Insn::Mov { dst: slot.reg, src: value });
				if slot.stack_type == StackType::Int32 {
					self.canon_i32(slot.reg);
				}
				Ok(())
			},
		}
	}

	fn emit_ldarg(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.args, index, "argument index out of range")?;
		self.emit_load_slot(slot)
	}

	fn emit_starg(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.args, index, "argument index out of range")?;
		self.emit_store_slot(slot)
	}

	fn emit_ldarga(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.args, index, "argument index out of range")?;
		if !slot.memory {
			return Err(JitError::Verification("address of a register argument"));
		}
		let address = self.address_into_reg(slot.reg.into(), 0);
		self.push_entry(self.pool.get_byref(slot.ty)?, address)
	}

	fn emit_ldloc(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.locals, index, "local index out of range")?;
		self.emit_load_slot(slot)
	}

	fn emit_stloc(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.locals, index, "local index out of range")?;
		self.emit_store_slot(slot)
	}

	fn emit_ldloca(&mut self, index: u16) -> Result<(), JitError> {
		let slot = self.slot(&self.locals, index, "local index out of range")?;
		if !slot.memory {
			// The pre-pass spills every ldloca'd local, so this is a bug.
			return Err(JitError::Verification("address of a register local"));
		}
		let address = self.address_into_reg(slot.reg.into(), 0);
		self.push_entry(self.pool.get_byref(slot.ty)?, address)
	}

	// ---- arithmetic ------------------------------------------------------

	/// The implicit conversion matrix for binary numeric operations.
	fn arith_operands(
		&mut self,
		integer_only: bool,
	) -> Result<(StackEntry<'l>, StackEntry<'l>, StackType, bool), JitError> {
		let b = self.stack.pop()?;
		let a = self.stack.pop()?;
		use StackType::*;
		let result = match (a.stack_type, b.stack_type) {
			(Int32, Int32) => (Int32, false),
			(Int32, IntPtr) | (IntPtr, Int32) | (IntPtr, IntPtr) => (IntPtr, false),
			(Int64, Int64) => (Int64, false),
			(Float, Float) if !integer_only => (Float, a.double || b.double),
			_ => return Err(JitError::Verification("operand types are invalid for this operation")),
		};
		Ok((a, b, result.0, result.1))
	}

	/// Widens the narrower float operand when singles and doubles mix.
	fn float_operand(&mut self, entry: &StackEntry<'l>, double: bool) -> Operand {
		if entry.double == double {
			return entry.reg.into();
		}
		let reg = self.f.reg(MirType::D);
		self.f.emit(Insn::Conv { kind: ConvKind::FToD, dst: reg, src: entry.reg.into() });
		reg.into()
	}

	fn emit_binary(
		&mut self,
		int_op: BinOp,
		float_op: FBinOp,
		integer_only: bool,
		div_guard: bool,
	) -> Result<(), JitError> {
		let (a, b, stack_type, double) = self.arith_operands(integer_only)?;

		if stack_type == StackType::Float {
			let lhs = self.float_operand(&a, double);
			let rhs = self.float_operand(&b, double);
			let ty = float_mir(double);
			let reg = self.f.reg(ty);
			self.f.emit(Insn::FBin { op: float_op, ty, dst: reg, a: lhs, b: rhs });
			let result = match double {
				true => self.primitive(Primitive::Double),
				false => self.primitive(Primitive::Float),
			};
			return self.push_with(result, StackType::Float, double, reg);
		}

		// The divide-by-zero guard precedes every integer division.
		if div_guard && matches!(int_op, BinOp::Div | BinOp::DivU | BinOp::Rem | BinOp::RemU) {
			let ok = self.f.label();
			self.f.emit(Insn::Bnz { src: b.reg.into(), target: ok });
			self.emit_throw_new("DivideByZeroException")?;
			self.f.bind(ok);
		}

		let (lhs, rhs) = match (stack_type, int_op) {
			// Unsigned 32-bit forms need zero-extended operands.
			(StackType::Int32, BinOp::DivU | BinOp::RemU) => {
				let lhs = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: lhs, src: a.reg.into(), bits: 32, signed: false });
				let rhs = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: rhs, src: b.reg.into(), bits: 32, signed: false });
				(Operand::Reg(lhs), Operand::Reg(rhs))
			},
			_ => (Operand::Reg(a.reg), Operand::Reg(b.reg)),
		};

		let reg = self.f.reg(MirType::I64);
		self.f.emit(Insn::Bin { op: int_op, dst: reg, a: lhs, b: rhs });
		if stack_type == StackType::Int32 {
			self.canon_i32(reg);
		}

		let ty = match stack_type {
			StackType::Int32 => self.primitive(Primitive::Int32),
			StackType::Int64 => self.primitive(Primitive::Int64),
			_ => self.primitive(Primitive::IntPtr),
		};
		self.push_with(ty, stack_type, false, reg)
	}

	fn emit_shift(&mut self, op: BinOp) -> Result<(), JitError> {
		let count = self.stack.pop()?;
		let value = self.stack.pop()?;
		if !matches!(count.stack_type, StackType::Int32 | StackType::IntPtr)
			|| !matches!(value.stack_type, StackType::Int32 | StackType::Int64 | StackType::IntPtr)
		{
			return Err(JitError::Verification("shift operands are not integers"));
		}

		let source: Operand = match (op, value.stack_type) {
			(BinOp::ShrU, StackType::Int32) => {
				let zext = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: zext, src: value.reg.into(), bits: 32, signed: false });
				zext.into()
			},
			_ => value.reg.into(),
		};

		let mask = match value.stack_type {
			StackType::Int32 => 31,
			_ => 63,
		};
		let masked = self.f.reg(MirType::I64);
		self.f.emit(Insn::Bin { op: BinOp::And, dst: masked, a: count.reg.into(), b: Operand::Imm(mask) });

		let reg = self.f.reg(MirType::I64);
		self.f.emit(Insn::Bin { op, dst: reg, a: source, b: masked.into() });
		if value.stack_type == StackType::Int32 {
			self.canon_i32(reg);
		}
		self.push_with(value.ty, value.stack_type, false, reg)
	}

	/// Overflow-checked add/sub/mul. 32-bit operands compute at full width
	/// and verify the result still fits; the 64-bit forms stay out of this
	/// tier.
	fn emit_binary_ovf(&mut self, op: BinOp, signed: bool) -> Result<(), JitError> {
		let (a, b, stack_type, _) = self.arith_operands(true)?;
		if stack_type != StackType::Int32 {
			return Err(JitError::Unsupported("overflow arithmetic beyond 32-bit operands"));
		}

		let (lhs, rhs) = match signed {
			true => (Operand::Reg(a.reg), Operand::Reg(b.reg)),
			false => {
				let lhs = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: lhs, src: a.reg.into(), bits: 32, signed: false });
				let rhs = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: rhs, src: b.reg.into(), bits: 32, signed: false });
				(Operand::Reg(lhs), Operand::Reg(rhs))
			},
		};

		let wide = self.f.reg(MirType::I64);
		self.f.emit(Insn::Bin { op, dst: wide, a: lhs, b: rhs });

		// The result overflowed iff truncating and re-extending changes it.
		let narrowed = self.f.reg(MirType::I64);
		self.f.emit(Insn::Ext { dst: narrowed, src: wide.into(), bits: 32, signed });
		let ok = self.f.label();
		self.f.emit(Insn::Branch { pred: Pred::Eq, a: wide.into(), b: narrowed.into(), target: ok });
		self.emit_throw_new("OverflowException")?;
		self.f.bind(ok);

		let reg = self.f.reg(MirType::I64);
		self.f.emit(Insn::Ext { dst: reg, src: wide.into(), bits: 32, signed: true });
		self.push_entry(self.primitive(Primitive::Int32), reg)
	}

	fn emit_compare(&mut self, pred: Pred) -> Result<(), JitError> {
		let b = self.stack.pop()?;
		let a = self.stack.pop()?;
		let reg = self.f.reg(MirType::I64);

		match (a.stack_type, b.stack_type) {
			(StackType::Float, StackType::Float) => {
				let double = a.double || b.double;
				let lhs = self.float_operand(&a, double);
				let rhs = self.float_operand(&b, double);
				self.f.emit(Insn::FCmp { pred, ty: float_mir(double), dst: reg, a: lhs, b: rhs });
			},
			(StackType::Object, StackType::Object) | (StackType::ByRef, StackType::ByRef) => {
				if !matches!(pred, Pred::Eq | Pred::Ne | Pred::Ugt) {
					return Err(JitError::Verification("ordered comparison of references"));
				}
				let lhs = a.obj_reg.unwrap_or(a.reg);
				let rhs = b.obj_reg.unwrap_or(b.reg);
				self.f.emit(Insn::Cmp { pred, dst: reg, a: lhs.into(), b: rhs.into() });
			},
			(StackType::Int32, StackType::Int32)
			| (StackType::Int64, StackType::Int64)
			| (StackType::Int32, StackType::IntPtr)
			| (StackType::IntPtr, StackType::Int32)
			| (StackType::IntPtr, StackType::IntPtr) => {
				self.f.emit(Insn::Cmp { pred, dst: reg, a: a.reg.into(), b: b.reg.into() });
			},
			_ => return Err(JitError::Verification("operand types are invalid for comparison")),
		}
		self.push_entry(self.primitive(Primitive::Int32), reg)
	}

	// ---- conversions -----------------------------------------------------

	/// Narrowing integer conversions; float sources go through an integer
	/// first because the float-to-int instruction is native width.
	fn emit_conv_int(&mut self, bits: u8, signed: bool) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		let source: Operand = match entry.stack_type {
			StackType::Float => {
				let via = self.f.reg(MirType::I64);
				let kind = match entry.double {
					true => ConvKind::DToI64,
					false => ConvKind::FToI64,
				};
				self.f.emit(Insn::Conv { kind, dst: via, src: entry.reg.into() });
				via.into()
			},
			StackType::Int32 | StackType::Int64 | StackType::IntPtr => entry.reg.into(),
			_ => return Err(JitError::Verification("conversion of a non-numeric value")),
		};

		let reg = self.f.reg(MirType::I64);
		self.f.emit(Insn::Ext { dst: reg, src: source, bits, signed });
		if bits < 32 || !signed {
			// Small results re-canonicalize as signed 32-bit stack values.
			self.canon_i32(reg);
		}
		self.push_entry(self.primitive(Primitive::Int32), reg)
	}

	fn emit_conv_long(&mut self, target: Primitive) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		let reg = self.f.reg(MirType::I64);
		match entry.stack_type {
			StackType::Int32 | StackType::Int64 | StackType::IntPtr => {
				self.f.emit(Insn::Mov { dst: reg, src: entry.reg.into() });
			},
			StackType::Float => {
				let kind = match entry.double {
					true => ConvKind::DToI64,
					false => ConvKind::FToI64,
				};
				self.f.emit(Insn::Conv { kind, dst: reg, src: entry.reg.into() });
			},
			StackType::ByRef | StackType::Object if matches!(target, Primitive::IntPtr | Primitive::UIntPtr) => {
				self.f.emit(Insn::Mov { dst: reg, src: entry.reg.into() });
			},
			_ => return Err(JitError::Verification("conversion of a non-numeric value")),
		}
		self.push_entry(self.primitive(target), reg)
	}

	fn emit_conv_float(&mut self, double: bool) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		let ty = float_mir(double);
		let reg = self.f.reg(ty);
		match entry.stack_type {
			StackType::Int32 | StackType::Int64 | StackType::IntPtr => {
				let kind = match double {
					true => ConvKind::I64ToD,
					false => ConvKind::I64ToF,
				};
				self.f.emit(Insn::Conv { kind, dst: reg, src: entry.reg.into() });
			},
			StackType::Float if entry.double == double => {
				self.f.emit(Insn::Mov { dst: reg, src: entry.reg.into() });
			},
			StackType::Float => {
				let kind = match double {
					true => ConvKind::FToD,
					false => ConvKind::DToF,
				};
				self.f.emit(Insn::Conv { kind, dst: reg, src: entry.reg.into() });
			},
			_ => return Err(JitError::Verification("conversion of a non-numeric value")),
		}
		let result = match double {
			true => self.primitive(Primitive::Double),
			false => self.primitive(Primitive::Float),
		};
		self.push_with(result, StackType::Float, double, reg)
	}

	fn unsigned_source(&mut self, entry: &StackEntry<'l>) -> Result<Reg, JitError> {
		match entry.stack_type {
			StackType::Int32 => {
				let reg = self.f.reg(MirType::I64);
				self.f.emit(Insn::Ext { dst: reg, src: entry.reg.into(), bits: 32, signed: false });
				Ok(reg)
			},
			StackType::Int64 | StackType::IntPtr => Ok(entry.reg),
			_ => Err(JitError::Verification("conversion of a non-integer value")),
		}
	}

	/// Overflow-checked conversions: range-check the (possibly unsigned)
	/// source, then narrow.
	fn emit_conv_ovf(&mut self, bits: u8, signed: bool, source_signed: bool) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		if entry.stack_type == StackType::Float {
			return Err(JitError::Unsupported("overflow conversion from a float source"));
		}
		if !matches!(entry.stack_type, StackType::Int32 | StackType::Int64 | StackType::IntPtr) {
			return Err(JitError::Verification("conversion of a non-integer value"));
		}

		let source: Reg = match source_signed {
			true => entry.reg,
			false => {
				// The `.un` forms reinterpret the source as unsigned.
				match entry.stack_type {
					StackType::Int32 => {
						let reg = self.f.reg(MirType::I64);
						self.f.emit(Insn::Ext { dst: reg, src: entry.reg.into(), bits: 32, signed: false });
						reg
					},
					_ => entry.reg,
				}
			},
		};

		// Range checks against the target width. Unsigned sources compare
		// unsigned; 64-bit targets only need the sign-side check.
		let mut checks: Vec<(Pred, i64)> = vec![];
		match (bits, signed, source_signed) {
			(64, true, true) | (64, false, false) => {},
			(64, true, false) => checks.push((Pred::Ugt, i64::MAX)),
			(64, false, true) => checks.push((Pred::Lt, 0)),
			(_, _, true) => {
				let (min, max) = match (bits, signed) {
					(8, true) => (i8::MIN as i64, i8::MAX as i64),
					(8, false) => (0, u8::MAX as i64),
					(16, true) => (i16::MIN as i64, i16::MAX as i64),
					(16, false) => (0, u16::MAX as i64),
					(32, false) => (0, u32::MAX as i64),
					_ => (i32::MIN as i64, i32::MAX as i64),
				};
				checks.push((Pred::Lt, min));
				checks.push((Pred::Gt, max));
			},
			(_, _, false) => {
				let max = match (bits, signed) {
					(8, true) => i8::MAX as i64,
					(8, false) => u8::MAX as i64,
					(16, true) => i16::MAX as i64,
					(16, false) => u16::MAX as i64,
					(32, false) => u32::MAX as i64,
					_ => i32::MAX as i64,
				};
				checks.push((Pred::Ugt, max));
			},
		}
		for (pred, bound) in checks {
			let ok = self.f.label();
			self.f.emit(Insn::Branch { pred: invert(pred), a: source.into(), b: Operand::Imm(bound), target: ok });
			self.emit_throw_new("OverflowException")?;
			self.f.bind(ok);
		}

		let reg = self.f.reg(MirType::I64);
		match bits < 64 {
			true => {
				self.f.emit(Insn::Ext { dst: reg, src: source.into(), bits, signed });
				if bits <= 32 {
					self.canon_i32(reg);
				}
			},
			false => self.f.emit(Insn::Mov { dst: reg, src: source.into() }),
		}
		let target = match (bits, signed) {
			(64, true) => self.primitive(Primitive::Int64),
			(64, false) => self.primitive(Primitive::UInt64),
			_ => self.primitive(Primitive::Int32),
		};
		self.push_entry(target, reg)
	}

	// ---- branches --------------------------------------------------------

	fn emit_br(&mut self, end: u32, rel: i64) -> Result<(), JitError> {
		let label = self.branch_target(end, rel)?;
		self.f.emit(Insn::Jump { target: label });
		self.stack.clear();
		self.reachable = false;
		Ok(())
	}

	fn emit_br_bool(&mut self, end: u32, rel: i64, when_true: bool) -> Result<(), JitError> {
		let entry = self.stack.pop()?;
		if !matches!(
			entry.stack_type,
			StackType::Int32 | StackType::Int64 | StackType::IntPtr
				| StackType::Object | StackType::ByRef
		) {
			return Err(JitError::Verification("branch condition is not testable"));
		}
		let source = entry.obj_reg.filter(|_| entry.stack_type == StackType::Object)
			.unwrap_or(entry.reg);
		let label = self.branch_target(end, rel)?;
		match when_true {
			true => self.f.emit(Insn::Bnz { src: source.into(), target: label }),
			false => self.f.emit(Insn::Bz { src: source.into(), target: label }),
		}
		Ok(())
	}

	fn emit_br_cmp(&mut self, end: u32, rel: i64, pred: Pred) -> Result<(), JitError> {
		let b = self.stack.pop()?;
		let a = self.stack.pop()?;
		let label = self.branch_target(end, rel)?;

		match (a.stack_type, b.stack_type) {
			(StackType::Float, StackType::Float) => {
				let double = a.double || b.double;
				let lhs = self.float_operand(&a, double);
				let rhs = self.float_operand(&b, double);
				let flag = self.f.reg(MirType::I64);
				self.f.emit(Insn::FCmp { pred, ty: float_mir(double), dst: flag, a: lhs, b: rhs });
				self.f.emit(Insn::Bnz { src: flag.into(), target: label });
			},
			(StackType::Object, StackType::Object) => {
				if !matches!(pred, Pred::Eq | Pred::Ne) {
					return Err(JitError::Verification("ordered comparison of references"));
				}
				let lhs = a.obj_reg.unwrap_or(a.reg);
				let rhs = b.obj_reg.unwrap_or(b.reg);
				self.f.emit(Insn::Branch { pred, a: lhs.into(), b: rhs.into(), target: label });
			},
			(StackType::Int32, StackType::Int32)
			| (StackType::Int64, StackType::Int64)
			| (StackType::Int32, StackType::IntPtr)
			| (StackType::IntPtr, StackType::Int32)
			| (StackType::IntPtr, StackType::IntPtr)
			| (StackType::ByRef, StackType::ByRef) => {
				self.f.emit(Insn::Branch { pred, a: a.reg.into(), b: b.reg.into(), target: label });
			},
			_ => return Err(JitError::Verification("operand types are invalid for comparison")),
		}
		Ok(())
	}

	// ---- memory ----------------------------------------------------------

	fn byref_referent(&self, entry: &StackEntry<'l>) -> Result<&'l Type<'l>, JitError> {
		match entry.stack_type {
			StackType::ByRef => entry.ty.element_type()
				.ok_or(JitError::Verification("by-ref without a referent type")),
			StackType::IntPtr => Ok(self.pool.object_base()),
			_ => Err(JitError::Verification("indirect access through a non-pointer")),
		}
	}

	fn emit_ldind(&mut self, primitive: Primitive) -> Result<(), JitError> {
		let address = self.stack.pop()?;
		self.byref_referent(&address)?;
		self.emit_load_value(address.reg.into(), 0, self.primitive(primitive))
	}

	fn emit_stind(&mut self, primitive: Primitive) -> Result<(), JitError> {
		let value = self.stack.pop()?;
		let address = self.stack.pop()?;
		self.byref_referent(&address)?;
		let ty = self.primitive(primitive);
		self.emit_store_value(address.reg.into(), 0, &value, ty, Barrier::None)
	}

	/// Resolves the base and byte offset of an instance field access for an
	/// object, by-ref, pointer or value-type receiver.
	fn field_address(
		&mut self,
		object: &StackEntry<'l>,
		field: &'l Field<'l>,
	) -> Result<(Operand, i32), JitError> {
		if field.is_static() {
			return Err(JitError::Verification("instance access to a static field"));
		}
		match object.stack_type {
			StackType::Object => {
				let receiver = object.obj_reg.unwrap_or(object.reg);
				self.emit_null_check(receiver)?;
				Ok((receiver.into(), field.offset() as i32))
			},
			StackType::ByRef | StackType::IntPtr => Ok((object.reg.into(), field.offset() as i32)),
			StackType::ValueType => Ok((object.reg.into(), field.offset() as i32)),
			_ => Err(JitError::Verification("field access on a non-object value")),
		}
	}

	fn static_base(&mut self, field: &'l Field<'l>) -> Result<Operand, JitError> {
		if !field.is_static() {
			return Err(JitError::Verification("static access to an instance field"));
		}
		let symbol = self.state.static_slot(field)?;
		Ok(Operand::Sym(self.state.module.sym(&symbol)))
	}

	// ---- arrays ----------------------------------------------------------

	fn require_array(&self, entry: &StackEntry<'l>) -> Result<(), JitError> {
		match entry.ty.is_array() || std::ptr::eq(entry.ty, self.pool.null_type()) {
			true => Ok(()),
			false => Err(JitError::Verification("array operation on a non-array value")),
		}
	}

	/// Null check, bounds check, then `base + elements + i * size`. Int32
	/// indices are already canonical sign-extended native words.
	fn emit_element_address(
		&mut self,
		expected_element: Option<&'l Type<'l>>,
	) -> Result<(StackEntry<'l>, Reg), JitError> {
		let index = self.stack.pop()?;
		let array = self.stack.pop()?;
		self.require_array(&array)?;
		if !matches!(index.stack_type, StackType::Int32 | StackType::IntPtr) {
			return Err(JitError::Verification("array index is not an integer"));
		}

		let element = array.ty.element_type()
			.ok_or(JitError::Verification("array without element type"))?;
		if let Some(expected) = expected_element {
			if !verifier::array_element_compatible_with(self.pool, element, expected) {
				return Err(JitError::Verification("array element type mismatch"));
			}
		}

		self.emit_null_check(array.reg)?;

		let length = self.f.reg(MirType::I64);
		self.f.emit(Insn::Load {
			dst: length,
			base: array.reg.into(),
			offset: ARRAY_LENGTH_OFFSET as i32,
			size: MemSize::I64,
		});
		let ok = self.f.label();
		self.f.emit(Insn::Branch { pred: Pred::Ult, a: index.reg.into(), b: length.into(), target: ok });
		self.emit_throw_new("IndexOutOfRangeException")?;
		self.f.bind(ok);

		let element_size = element.stack_size().max(1);
		let scaled = self.f.reg(MirType::I64);
		self.f.emit(Insn::Bin {
			op: BinOp::Mul,
			dst: scaled,
			a: index.reg.into(),
			b: Operand::Imm(element_size as i64),
		});
		let address = self.f.reg(MirType::P);
		self.f.emit(Insn::Bin { op: BinOp::Add, dst: address, a: array.reg.into(), b: scaled.into() });
		self.f.emit(Insn::Bin {
			op: BinOp::Add,
			dst: address,
			a: address.into(),
			b: Operand::Imm(ARRAY_ELEMENTS_OFFSET as i64),
		});
		Ok((array, address))
	}

	fn emit_ldelem_primitive(&mut self, primitive: Primitive) -> Result<(), JitError> {
		let (_, address) = self.emit_element_address(Some(self.primitive(primitive)))?;
		self.emit_load_value(address.into(), 0, self.primitive(primitive))
	}

	fn emit_stelem_primitive(&mut self, primitive: Primitive) -> Result<(), JitError> {
		let value = self.stack.pop()?;
		let (_, address) = self.emit_element_address(Some(self.primitive(primitive)))?;
		let ty = self.primitive(primitive);
		self.emit_store_value(address.into(), 0, &value, ty, Barrier::None)
	}

	// ---- object model ----------------------------------------------------

	fn emit_newobj(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ctor = self.assembly.resolve_method_token(token)?;
		self.check_method_access(ctor)?;
		let declaring = ctor.declaring_type()
			.ok_or(JitError::Verification("constructor without a declaring type"))?;
		if declaring.is_array() {
			return Err(JitError::Verification("newobj of an array type"));
		}

		if declaring.is_value_type() {
			let size = declaring.stack_size().max(1);
			let buffer = self.f.reg(MirType::P);
			self.f.emit(Insn::Alloca { dst: buffer, size });
			self.emit_call_with_this(ctor, Some(buffer.into()))?;

			let (stack_type, double) = classify(declaring);
			match stack_type {
				StackType::ValueType => self.push_with(declaring, stack_type, double, buffer)?,
				_ => {
					// Primitive-classified values come back out of the slot.
					self.emit_load_value(buffer.into(), 0, declaring)?;
				},
			}
			return Ok(());
		}

		let ty_operand = self.type_operand(declaring);
		let object = self.call_host(RT_NEW_OBJECT, vec![ty_operand], true)?
			.ok_or(JitError::Verification("helper without a result"))?;
		self.emit_oom_check(object, declaring)?;
		self.emit_call_with_this(ctor, Some(object.into()))?;
		self.push_entry(declaring, object)
	}

	fn emit_box(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ty = self.assembly.resolve_type_token(token)?;
		if !ty.is_value_type() {
			// Boxing a reference type is the identity.
			return Ok(());
		}
		let value = self.stack.pop()?;

		let ty_operand = self.type_operand(ty);
		let object = self.call_host(RT_NEW_OBJECT, vec![ty_operand], true)?
			.ok_or(JitError::Verification("helper without a result"))?;
		self.emit_oom_check(object, ty)?;

		match value.stack_type {
			StackType::ValueType => {
				let size = ty.managed_size().max(1);
				let payload = self.address_into_reg(object.into(), OBJECT_HEADER_SIZE as i32);
				self.f.emit(Insn::Memcpy { dst: payload.into(), src: value.reg.into(), len: size });
				let offsets = ty.managed_pointer_offsets().to_vec();
				for pointer_offset in offsets {
					let slot = self.f.reg(MirType::P);
					self.f.emit(Insn::Load {
						dst: slot,
						base: value.reg.into(),
						offset: pointer_offset as i32,
						size: MemSize::P,
					});
					self.call_host(RT_GC_UPDATE, vec![
						object.into(),
						Operand::Imm(OBJECT_HEADER_SIZE as i64 + pointer_offset as i64),
						slot.into(),
					], false)?;
				}
			},
			_ => {
				let coerced = self.coerce_store(&value, ty)?;
				self.f.emit(Insn::Store {
					src: coerced,
					base: object.into(),
					offset: OBJECT_HEADER_SIZE as i32,
					size: value_mem_size(ty),
				});
			},
		}

		self.push_with(ty, StackType::Object, false, object)
	}

	/// `castclass` then payload extraction for value types; plain
	/// `castclass` for reference types.
	fn emit_unbox_any(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ty = self.assembly.resolve_type_token(token)?;
		if !ty.is_value_type() {
			return self.emit_castclass(token);
		}

		let object = self.stack.pop()?;
		self.emit_null_check(object.reg)?;
		self.emit_cast_check(object.reg, ty)?;
		self.emit_load_value(object.reg.into(), OBJECT_HEADER_SIZE as i32, ty)
	}

	/// `unbox`: a controlled-mutability pointer to the boxed payload.
	fn emit_unbox(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ty = self.assembly.resolve_type_token(token)?;
		if !ty.is_value_type() {
			return Err(JitError::Verification("unbox of a reference type"));
		}
		let object = self.stack.pop()?;
		self.emit_null_check(object.reg)?;
		self.emit_cast_check(object.reg, ty)?;
		let address = self.address_into_reg(object.reg.into(), OBJECT_HEADER_SIZE as i32);
		self.push_entry(self.pool.get_byref(ty)?, address)
	}

	fn emit_cast_check(&mut self, object: Reg, ty: &'l Type<'l>) -> Result<(), JitError> {
		let ty_operand = self.type_operand(ty);
		let result = self.call_host(RT_IS_INSTANCE, vec![object.into(), ty_operand], true)?
			.ok_or(JitError::Verification("helper without a result"))?;
		let ok = self.f.label();
		self.f.emit(Insn::Bnz { src: result.into(), target: ok });
		self.emit_throw_new("InvalidCastException")?;
		self.f.bind(ok);
		Ok(())
	}

	fn emit_isinst(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ty = self.assembly.resolve_type_token(token)?;
		let object = self.stack.pop()?;
		let source = object.obj_reg.unwrap_or(object.reg);

		if ty.is_interface() {
			let ty_operand = self.type_operand(ty);
			let slice = self.call_host(RT_CAST_TO_INTERFACE, vec![source.into(), ty_operand], true)?
				.ok_or(JitError::Verification("helper without a result"))?;
			let result = self.f.reg(MirType::P);
			self.f.emit(Insn::Mov { dst: result, src: source.into() });
			let ok = self.f.label();
			self.f.emit(Insn::Bnz { src: slice.into(), target: ok });
			self.f.emit(Insn::Mov { dst: result, src: Operand::Imm(0) });
			self.f.bind(ok);
			return self.stack.push(StackEntry {
				ty,
				stack_type: StackType::Object,
				double: false,
				reg: slice,
				obj_reg: Some(result),
			});
		}

		let ty_operand = self.type_operand(ty);
		let result = self.call_host(RT_IS_INSTANCE, vec![source.into(), ty_operand], true)?
			.ok_or(JitError::Verification("helper without a result"))?;
		self.push_with(ty, StackType::Object, false, result)
	}

	fn emit_castclass(&mut self, token: MetadataToken) -> Result<(), JitError> {
		let ty = self.assembly.resolve_type_token(token)?;
		let object = self.stack.pop()?;
		let source = object.obj_reg.unwrap_or(object.reg);

		// A null reference passes any cast.
		let done = self.f.label();
		if ty.is_interface() {
			let slice = self.f.reg(MirType::P);
			self.f.emit(Insn::Mov { dst: slice, src: Operand::Imm(0) });
			self.f.emit(Insn::Bz { src: source.into(), target: done });
			let ty_operand = self.type_operand(ty);
			let found = self.call_host(RT_CAST_TO_INTERFACE, vec![source.into(), ty_operand], true)?
				.ok_or(JitError::Verification("helper without a result"))?;
			self.f.emit(Insn::Mov { dst: slice, src: found.into() });
			let ok = self.f.label();
			self.f.emit(Insn::Bnz { src: slice.into(), target: ok });
			self.emit_throw_new("InvalidCastException")?;
			self.f.bind(ok);
			self.f.bind(done);
			return self.stack.push(StackEntry {
				ty,
				stack_type: StackType::Object,
				double: false,
				reg: slice,
				obj_reg: Some(source),
			});
		}

		self.f.emit(Insn::Bz { src: source.into(), target: done });
		self.emit_cast_check(source, ty)?;
		self.f.bind(done);
		self.push_with(ty, StackType::Object, false, source)
	}

	// ---- calls -----------------------------------------------------------

	fn method_sym(&mut self, callee: &'l Method<'l>, symbol: &str) -> crate::mir::SymId {
		let local = callee.declaring_type()
			.and_then(|t| t.assembly())
			.map(|a| std::ptr::eq(a, self.assembly))
			.unwrap_or(false);
		match local && callee.code_type() == crate::metadata::CodeType::Il {
			true => self.state.module.sym(symbol),
			false => self.state.module.import(symbol),
		}
	}

	fn emit_call(&mut self, callee: &'l Method<'l>, virtual_dispatch: bool) -> Result<(), JitError> {
		self.check_method_access(callee)?;
		match virtual_dispatch {
			false => self.emit_call_with_this(callee, None),
			true => self.emit_callvirt(callee),
		}
	}

	/// Pops arguments, coerces them against the signature, emits the call
	/// and the post-call exception branch, and pushes the result.
	fn emit_call_with_this(
		&mut self,
		callee: &'l Method<'l>,
		explicit_this: Option<Operand>,
	) -> Result<(), JitError> {
		let (args, this) = self.pop_call_arguments(callee, explicit_this.is_some())?;
		let this_operand = match explicit_this {
			Some(operand) => Some(operand),
			None => this,
		};

		let symbol = method_symbol(callee);
		let sym = self.method_sym(callee, &symbol);
		self.emit_call_common(callee, CallTarget::Sym(sym), this_operand, args)
	}

	fn emit_callvirt(&mut self, callee: &'l Method<'l>) -> Result<(), JitError> {
		let (args, this) = self.pop_call_arguments(callee, false)?;
		let receiver_entry = self.last_receiver
			.take()
			.ok_or(JitError::Verification("callvirt without a receiver"))?;
		let slot = callee.vtable_offset()
			.ok_or(JitError::Verification("callvirt of a method without a vtable slot"))?;
		let declared_on = callee.declaring_type()
			.ok_or(JitError::Verification("method without a declaring type"))?;

		let (fn_ptr, this_operand) = if declared_on.is_interface() {
			match receiver_entry.obj_reg {
				// Interface receiver: the slice half indexes directly.
				Some(object) => {
					let fn_ptr = self.f.reg(MirType::P);
					self.f.emit(Insn::Load {
						dst: fn_ptr,
						base: receiver_entry.reg.into(),
						offset: (slot as u32 * POINTER_SIZE) as i32,
						size: MemSize::P,
					});
					(fn_ptr, Operand::Reg(object))
				},
				// Object receiver: the interface offset comes from the
				// receiver type's interface-impl map.
				None => {
					let receiver = receiver_entry.reg;
					self.emit_null_check(receiver)?;
					let interface_impl = receiver_entry.ty.interface_impl(declared_on);
					let fn_ptr = self.f.reg(MirType::P);
					match interface_impl {
						Some(interface_impl) => {
							let vtable = self.f.reg(MirType::P);
							self.f.emit(Insn::Load { dst: vtable, base: receiver.into(), offset: 0, size: MemSize::P });
							self.f.emit(Insn::Load {
								dst: fn_ptr,
								base: vtable.into(),
								offset: (VTABLE_FUNCS_OFFSET
									+ (interface_impl.vtable_offset + slot) as u32 * POINTER_SIZE) as i32,
								size: MemSize::P,
							});
						},
						None => {
							// The static type does not reveal the layout;
							// resolve the slice against the runtime type.
							let ty_operand = self.type_operand(declared_on);
							let slice = self.call_host(
								RT_CAST_TO_INTERFACE,
								vec![receiver.into(), ty_operand],
								true,
							)?.ok_or(JitError::Verification("helper without a result"))?;
							self.f.emit(Insn::Load {
								dst: fn_ptr,
								base: slice.into(),
								offset: (slot as u32 * POINTER_SIZE) as i32,
								size: MemSize::P,
							});
						},
					}
					(fn_ptr, Operand::Reg(receiver))
				},
			}
		} else {
			let receiver = receiver_entry.obj_reg.unwrap_or(receiver_entry.reg);
			self.emit_null_check(receiver)?;
			let vtable = self.f.reg(MirType::P);
			self.f.emit(Insn::Load { dst: vtable, base: receiver.into(), offset: 0, size: MemSize::P });
			let fn_ptr = self.f.reg(MirType::P);
			self.f.emit(Insn::Load {
				dst: fn_ptr,
				base: vtable.into(),
				offset: (VTABLE_FUNCS_OFFSET + slot as u32 * POINTER_SIZE) as i32,
				size: MemSize::P,
			});
			(fn_ptr, Operand::Reg(receiver))
		};

		let _ = this;
		self.emit_call_common(callee, CallTarget::Indirect(fn_ptr.into()), Some(this_operand), args)
	}

	/// Pops and coerces the declared arguments (and the receiver for
	/// instance methods unless the caller supplies it).
	fn pop_call_arguments(
		&mut self,
		callee: &'l Method<'l>,
		this_supplied: bool,
	) -> Result<(Vec<Operand>, Option<Operand>), JitError> {
		let params = callee.params();
		let mut args = vec![Operand::Imm(0); params.len()];
		for position in (0..params.len()).rev() {
			let entry = self.stack.pop()?;
			let param_ty = params[position].param_type()
				.ok_or(JitError::Verification("parameter type unresolved"))?;
			args[position] = self.coerce_store(&entry, param_ty)?;
		}

		let this = match !callee.is_static() && !this_supplied {
			true => {
				let entry = self.stack.pop()?;
				self.last_receiver = Some(entry);
				match entry.stack_type {
					StackType::Object => Some(Operand::Reg(entry.obj_reg.unwrap_or(entry.reg))),
					StackType::ByRef | StackType::ValueType | StackType::IntPtr => {
						Some(Operand::Reg(entry.reg))
					},
					_ => return Err(JitError::Verification("receiver is not an object or pointer")),
				}
			},
			false => None,
		};
		Ok((args, this))
	}

	fn emit_call_common(
		&mut self,
		callee: &'l Method<'l>,
		target: CallTarget,
		this: Option<Operand>,
		args: Vec<Operand>,
	) -> Result<(), JitError> {
		let return_type = callee.return_type()
			.ok_or(JitError::Verification("callee signature unresolved"))?;
		let returns_void = is_void(return_type);
		let (ret_stack_type, ret_double) = classify(return_type);
		let large_return = !returns_void && ret_stack_type == StackType::ValueType;

		let mut operands = vec![];
		let mut ret_buffer = None;
		if large_return {
			let buffer = self.f.reg(MirType::P);
			self.f.emit(Insn::Alloca { dst: buffer, size: return_type.stack_size().max(1) });
			operands.push(Operand::Reg(buffer));
			ret_buffer = Some(buffer);
		}
		if let Some(this) = this {
			operands.push(this);
		}
		operands.extend(args);

		let proto = self.state.module.proto(Proto {
			params: vec![MirType::I64; operands.len()],
			ret: (!returns_void && !large_return).then(|| mir_type_for(ret_stack_type, ret_double)),
		});
		let ret = (!returns_void && !large_return)
			.then(|| self.f.reg(mir_type_for(ret_stack_type, ret_double)));

		self.f.emit(Insn::Call { proto, target, exc: self.exc_reg, ret, args: operands });
		self.emit_exception_check()?;

		if large_return {
			let buffer = ret_buffer.unwrap_or(self.exc_reg);
			self.push_with(return_type, StackType::ValueType, false, buffer)?;
		} else if !returns_void {
			let reg = ret.unwrap_or(self.exc_reg);
			if return_type.is_interface() {
				let ty_operand = self.type_operand(return_type);
				let slice = self.call_host(RT_CAST_TO_INTERFACE, vec![reg.into(), ty_operand], true)?
					.ok_or(JitError::Verification("helper without a result"))?;
				self.stack.push(StackEntry {
					ty: return_type,
					stack_type: StackType::Object,
					double: false,
					reg: slice,
					obj_reg: Some(reg),
				})?;
			} else {
				self.push_entry(return_type, reg)?;
			}
		}
		Ok(())
	}

	// ---- leave / endfinally ---------------------------------------------

	/// `leave` empties the stack, chains every exited finally innermost
	/// first, and lands on the target.
	fn emit_leave(&mut self, end: u32, rel: i64) -> Result<(), JitError> {
		let target = (end as i64 + rel) as u32;
		self.stack.clear();

		let target_label = match self.snapshots.contains_key(&target) {
			true => {
				self.transfer_to_snapshot(target, target <= self.offset)?;
				self.snapshots[&target].label
			},
			false => self.record_snapshot(target)?,
		};

		let chain = eh::finallies_on_leave(self.clauses, self.offset, target);
		if chain.is_empty() {
			self.f.emit(Insn::Jump { target: target_label });
		} else {
			// Each finally jumps to the next via its link register; the
			// last lands on the leave target.
			let mut destination = target_label;
			for clause in chain.iter().rev() {
				let link_reg = self.clause_states[*clause].link_reg
					.ok_or(JitError::Verification("leave through a non-finally clause"))?;
				let saved = self.clause_states[*clause].saved_exc
					.ok_or(JitError::Verification("leave through a non-finally clause"))?;
				let id = self.next_link_id;
				self.next_link_id += 1;
				self.clause_states[*clause].links.push((id, LinkTarget::Leave(destination)));

				self.f.emit(Insn::Mov { dst: saved, src: Operand::Imm(0) });
				self.f.emit(Insn::Mov { dst: link_reg, src: Operand::Imm(id) });
				destination = self.snapshots[&self.clauses[*clause].handler_offset].label;
			}
			self.f.emit(Insn::Jump { target: destination });
		}

		self.reachable = false;
		Ok(())
	}

	/// Emits the per-chain handler search blocks: catch type tests first,
	/// entering a finally suspends the search and resumes at the outer
	/// chain.
	fn emit_dispatch_blocks(&mut self) -> Result<(), JitError> {
		while let Some((chain, label)) = self.dispatch_pending.pop() {
			self.f.bind(label);
			let mut entered_finally = false;

			for (position, clause_index) in chain.iter().enumerate() {
				let clause = self.clauses[*clause_index];
				match clause.kind {
					ExceptionClauseKind::Catch(_) => {
						let catch_type = self.clause_states[*clause_index].catch_type
							.ok_or(JitError::Verification("catch clause without a type"))?;
						let handler_label = self.snapshots[&clause.handler_offset].label;
						let handler_reg = self.snapshots[&clause.handler_offset].entries[0].reg;
						let catch_exc = self.clause_states[*clause_index].catch_exc
							.ok_or(JitError::Verification("catch clause without a register"))?;

						let next = self.f.label();
						if !std::ptr::eq(catch_type, self.pool.object_base()) {
							let ty_operand = self.type_operand(catch_type);
							let matched = self.call_host(
								RT_IS_INSTANCE,
								vec![self.exc_reg.into(), ty_operand],
								true,
							)?.ok_or(JitError::Verification("helper without a result"))?;
							self.f.emit(Insn::Bz { src: matched.into(), target: next });
						}
						// Entering the handler clears the exception register.
						self.f.emit(Insn::Mov { dst: handler_reg, src: self.exc_reg.into() });
						self.f.emit(Insn::Mov { dst: catch_exc, src: self.exc_reg.into() });
						self.f.emit(Insn::Mov { dst: self.exc_reg, src: Operand::Imm(0) });
						self.f.emit(Insn::Jump { target: handler_label });
						self.f.bind(next);
					},
					ExceptionClauseKind::Finally | ExceptionClauseKind::Fault => {
						let link_reg = self.clause_states[*clause_index].link_reg
							.ok_or(JitError::Verification("finally clause without a register"))?;
						let saved = self.clause_states[*clause_index].saved_exc
							.ok_or(JitError::Verification("finally clause without a register"))?;
						let handler_label = self.snapshots[&clause.handler_offset].label;

						let continuation = self.dispatch_label(chain[position + 1..].to_vec());
						let id = self.next_link_id;
						self.next_link_id += 1;
						self.clause_states[*clause_index].links.push((id, LinkTarget::Unwind(continuation)));

						self.f.emit(Insn::Mov { dst: saved, src: self.exc_reg.into() });
						self.f.emit(Insn::Mov { dst: self.exc_reg, src: Operand::Imm(0) });
						self.f.emit(Insn::Mov { dst: link_reg, src: Operand::Imm(id) });
						self.f.emit(Insn::Jump { target: handler_label });
						entered_finally = true;
						break;
					},
					ExceptionClauseKind::Filter { .. } => {
						return Err(JitError::Unsupported("filter clauses"));
					},
				}
			}

			if !entered_finally {
				// Nothing matched: the exception leaves the function.
				let propagate = self.propagate();
				self.f.emit(Insn::Jump { target: propagate });
			}
		}

		if let Some(label) = self.propagate_label {
			self.f.bind(label);
			let returns_value = self.method.return_type()
				.map(|ty| !is_void(ty) && self.ret_block.is_none())
				.unwrap_or(false);
			self.f.emit(Insn::Ret {
				exc: self.exc_reg.into(),
				value: returns_value.then_some(Operand::Imm(0)),
			});
		}
		Ok(())
	}

	/// Emits each finally clause's `endfinally` dispatch: jump to the link
	/// destination, restoring and re-raising a saved exception on the
	/// unwind paths; with no link set, re-check and propagate.
	fn emit_endfinally_blocks(&mut self) -> Result<(), JitError> {
		let returns_value = self.method.return_type()
			.map(|ty| !is_void(ty) && self.ret_block.is_none())
			.unwrap_or(false);

		for index in 0..self.clause_states.len() {
			let Some(label) = self.clause_states[index].endfinally_label else { continue };
			let link_reg = self.clause_states[index].link_reg
				.ok_or(JitError::Verification("endfinally in a catch clause"))?;
			let saved = self.clause_states[index].saved_exc
				.ok_or(JitError::Verification("endfinally in a catch clause"))?;

			self.f.bind(label);
			let links = self.clause_states[index].links.clone();
			for (id, target) in links {
				match target {
					LinkTarget::Leave(destination) => {
						self.f.emit(Insn::Branch {
							pred: Pred::Eq,
							a: link_reg.into(),
							b: Operand::Imm(id),
							target: destination,
						});
					},
					LinkTarget::Unwind(continuation) => {
						let skip = self.f.label();
						self.f.emit(Insn::Branch {
							pred: Pred::Ne,
							a: link_reg.into(),
							b: Operand::Imm(id),
							target: skip,
						});
						self.f.emit(Insn::Mov { dst: self.exc_reg, src: saved.into() });
						self.f.emit(Insn::Jump { target: continuation });
						self.f.bind(skip);
					},
				}
			}

			// No link matched: re-check the saved exception and propagate,
			// covering synthetic leaves on exception unwind.
			self.f.emit(Insn::Mov { dst: self.exc_reg, src: saved.into() });
			self.f.emit(Insn::Ret {
				exc: self.exc_reg.into(),
				value: returns_value.then_some(Operand::Imm(0)),
			});
		}
		Ok(())
	}
}

/// Where a store lands relative to the heap, deciding the barrier.
#[derive(Copy, Clone)]
enum Barrier {
	/// Off-heap destination, no barrier.
	None,
	/// Store into a heap object at a known offset.
	Object(Reg),
	/// Store through a by-ref that may point into the heap.
	Ref,
}

fn is_void(ty: &Type<'_>) -> bool {
	matches!(ty.primitive(), Some(Primitive::Void))
}

fn float_mir(double: bool) -> MirType {
	match double {
		true => MirType::D,
		false => MirType::F,
	}
}

fn invert(pred: Pred) -> Pred {
	match pred {
		Pred::Eq => Pred::Ne,
		Pred::Ne => Pred::Eq,
		Pred::Lt => Pred::Ge,
		Pred::Le => Pred::Gt,
		Pred::Gt => Pred::Le,
		Pred::Ge => Pred::Lt,
		Pred::Ult => Pred::Uge,
		Pred::Ule => Pred::Ugt,
		Pred::Ugt => Pred::Ule,
		Pred::Uge => Pred::Ult,
	}
}

fn slot_mem_size(stack_type: StackType, double: bool) -> MemSize {
	match stack_type {
		StackType::Float => match double {
			true => MemSize::D,
			false => MemSize::F,
		},
		StackType::Int32 => MemSize::I32,
		_ => MemSize::P,
	}
}

/// Memory access width for a value of `ty`.
fn value_mem_size<'a>(ty: &'a Type<'a>) -> MemSize {
	let ty = ty.underlying_type();
	match ty.primitive() {
		Some(Primitive::Boolean) | Some(Primitive::UInt8) => MemSize::U8,
		Some(Primitive::Int8) => MemSize::I8,
		Some(Primitive::Char) | Some(Primitive::UInt16) => MemSize::U16,
		Some(Primitive::Int16) => MemSize::I16,
		Some(Primitive::Int32) => MemSize::I32,
		Some(Primitive::UInt32) => MemSize::U32,
		Some(Primitive::Int64) | Some(Primitive::UInt64) => MemSize::I64,
		Some(Primitive::Float) => MemSize::F,
		Some(Primitive::Double) => MemSize::D,
		_ => MemSize::P,
	}
}
