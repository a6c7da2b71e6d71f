//! Reference interpreter for linked MIR.
//!
//! This is the lazy-gen path of the linking interface: instead of lowering
//! to native code, functions execute directly over their instruction lists.
//! Values are 64-bit words; floats live in the low bits of their word.

use crate::mir::link::{Address, LinkedFunction, Linker};
use crate::mir::{BinOp, CallTarget, ConvKind, FBinOp, Insn, MemSize, MirType, Operand, Pred};

#[derive(Debug)]
pub enum ExecError {
	Unresolved(String),
	Trap(&'static str),
}

pub struct Machine<'a, 'l> {
	linker: &'a Linker<'l>,
	max_depth: usize,
}

impl<'a, 'l> Machine<'a, 'l> {
	pub fn new(linker: &'a Linker<'l>) -> Self {
		Self { linker, max_depth: 512 }
	}

	/// Runs an exported function; returns the two-slot (exception, value)
	/// pair.
	pub fn call_by_name(&self, name: &str, args: &[u64]) -> Result<(u64, u64), ExecError> {
		let address = self.linker.resolve(name)
			.map_err(|_| ExecError::Unresolved(name.to_string()))?;
		self.dispatch(address, args, 0)
	}

	pub fn call_address(&self, address: usize, args: &[u64]) -> Result<(u64, u64), ExecError> {
		self.dispatch(Address::decode(address), args, 0)
	}

	fn dispatch(&self, address: Address, args: &[u64], depth: usize) -> Result<(u64, u64), ExecError> {
		match address {
			Address::Func(index) => {
				let function = self.linker.function(index)
					.ok_or(ExecError::Trap("call to an unknown function index"))?;
				self.exec(function, args, depth)
			},
			Address::Host(index) => {
				let (_, host) = self.linker.host_fn(index)
					.ok_or(ExecError::Trap("call to an unknown host index"))?;
				Ok(host(args))
			},
			Address::Mem(_) => Err(ExecError::Trap("call to a data address")),
		}
	}

	fn exec(&self, linked: &LinkedFunction, args: &[u64], depth: usize) -> Result<(u64, u64), ExecError> {
		if depth >= self.max_depth {
			return Err(ExecError::Trap("call depth exceeded"));
		}

		let function = &linked.function;
		let mut regs = vec![0u64; function.reg_types.len()];
		for (param, value) in function.params.iter().zip(args) {
			regs[param.0 as usize] = *value;
		}

		// Keeps alloca storage alive until return.
		let mut frame: Vec<Box<[u8]>> = vec![];
		let mut pc = 0usize;

		macro_rules! eval {
			($operand: expr) => {
				self.eval($operand, &regs, linked)?
			};
		}

		while pc < function.insns.len() {
			match &function.insns[pc] {
				Insn::Bind(_) => {},
				Insn::Mov { dst, src } => regs[dst.0 as usize] = eval!(src),
				Insn::Ext { dst, src, bits, signed } => {
					let value = eval!(src);
					regs[dst.0 as usize] = extend(value, *bits, *signed);
				},
				Insn::Bin { op, dst, a, b } => {
					let (a, b) = (eval!(a), eval!(b));
					regs[dst.0 as usize] = bin_op(*op, a, b)?;
				},
				Insn::FBin { op, ty, dst, a, b } => {
					let (a, b) = (eval!(a), eval!(b));
					regs[dst.0 as usize] = match ty {
						MirType::F => {
							let (a, b) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
							let result = match op {
								FBinOp::Add => a + b,
								FBinOp::Sub => a - b,
								FBinOp::Mul => a * b,
								FBinOp::Div => a / b,
							};
							result.to_bits() as u64
						},
						_ => {
							let (a, b) = (f64::from_bits(a), f64::from_bits(b));
							let result = match op {
								FBinOp::Add => a + b,
								FBinOp::Sub => a - b,
								FBinOp::Mul => a * b,
								FBinOp::Div => a / b,
							};
							result.to_bits()
						},
					};
				},
				Insn::Neg { dst, src } => {
					regs[dst.0 as usize] = (eval!(src) as i64).wrapping_neg() as u64;
				},
				Insn::FNeg { ty, dst, src } => {
					let value = eval!(src);
					regs[dst.0 as usize] = match ty {
						MirType::F => (-f32::from_bits(value as u32)).to_bits() as u64,
						_ => (-f64::from_bits(value)).to_bits(),
					};
				},
				Insn::Not { dst, src } => regs[dst.0 as usize] = !eval!(src),
				Insn::Cmp { pred, dst, a, b } => {
					let (a, b) = (eval!(a), eval!(b));
					regs[dst.0 as usize] = int_pred(*pred, a, b) as u64;
				},
				Insn::FCmp { pred, ty, dst, a, b } => {
					let (a, b) = (eval!(a), eval!(b));
					let result = match ty {
						MirType::F => float_pred(*pred, f32::from_bits(a as u32) as f64, f32::from_bits(b as u32) as f64),
						_ => float_pred(*pred, f64::from_bits(a), f64::from_bits(b)),
					};
					regs[dst.0 as usize] = result as u64;
				},
				Insn::Conv { kind, dst, src } => {
					let value = eval!(src);
					regs[dst.0 as usize] = match kind {
						ConvKind::I64ToF => (value as i64 as f32).to_bits() as u64,
						ConvKind::I64ToD => (value as i64 as f64).to_bits(),
						ConvKind::U64ToF => (value as f32).to_bits() as u64,
						ConvKind::U64ToD => (value as f64).to_bits(),
						ConvKind::FToI64 => f32::from_bits(value as u32) as i64 as u64,
						ConvKind::DToI64 => f64::from_bits(value) as i64 as u64,
						ConvKind::FToD => (f32::from_bits(value as u32) as f64).to_bits(),
						ConvKind::DToF => (f64::from_bits(value) as f32).to_bits() as u64,
					};
				},
				Insn::Jump { target } => {
					pc = linked.label_offsets[target.0 as usize];
					continue;
				},
				Insn::Branch { pred, a, b, target } => {
					let (a, b) = (eval!(a), eval!(b));
					if int_pred(*pred, a, b) {
						pc = linked.label_offsets[target.0 as usize];
						continue;
					}
				},
				Insn::Bz { src, target } => {
					if eval!(src) == 0 {
						pc = linked.label_offsets[target.0 as usize];
						continue;
					}
				},
				Insn::Bnz { src, target } => {
					if eval!(src) != 0 {
						pc = linked.label_offsets[target.0 as usize];
						continue;
					}
				},
				Insn::Switch { src, targets } => {
					let index = eval!(src) as usize;
					if let Some(target) = targets.get(index) {
						pc = linked.label_offsets[target.0 as usize];
						continue;
					}
				},
				Insn::Load { dst, base, offset, size } => {
					let address = address_of(eval!(base), *offset)?;
					regs[dst.0 as usize] = read_mem(address, *size);
				},
				Insn::Store { src, base, offset, size } => {
					let value = eval!(src);
					let address = address_of(eval!(base), *offset)?;
					write_mem(address, *size, value);
				},
				Insn::Alloca { dst, size } => {
					let buffer = vec![0u8; (*size).max(1) as usize].into_boxed_slice();
					regs[dst.0 as usize] = buffer.as_ptr() as u64;
					frame.push(buffer);
				},
				Insn::Memcpy { dst, src, len } => {
					let dst = address_of(eval!(dst), 0)?;
					let src = address_of(eval!(src), 0)?;
					unsafe {
						std::ptr::copy(src as *const u8, dst as *mut u8, *len as usize);
					}
				},
				Insn::Memset { dst, value, len } => {
					let dst = address_of(eval!(dst), 0)?;
					unsafe {
						std::ptr::write_bytes(dst as *mut u8, *value, *len as usize);
					}
				},
				Insn::Call { target, exc, ret, args: call_args, .. } => {
					let address = match target {
						CallTarget::Sym(sym) => {
							let name = &linked.symbols[sym.0 as usize];
							self.linker.resolve(name)
								.map_err(|_| ExecError::Unresolved(name.clone()))?
						},
						CallTarget::Indirect(operand) => Address::decode(eval!(operand) as usize),
					};
					let mut values = Vec::with_capacity(call_args.len());
					for arg in call_args {
						values.push(eval!(arg));
					}
					let (exc_value, ret_value) = self.dispatch(address, &values, depth + 1)?;
					regs[exc.0 as usize] = exc_value;
					if let Some(ret) = ret {
						regs[ret.0 as usize] = ret_value;
					}
				},
				Insn::Ret { exc, value } => {
					let exc = eval!(exc);
					let value = match value {
						Some(value) => eval!(value),
						None => 0,
					};
					return Ok((exc, value));
				},
			}
			pc += 1;
		}

		// Falling off the end returns cleanly with no value.
		Ok((0, 0))
	}

	fn eval(&self, operand: &Operand, regs: &[u64], linked: &LinkedFunction) -> Result<u64, ExecError> {
		Ok(match operand {
			Operand::Reg(reg) => regs[reg.0 as usize],
			Operand::Imm(value) => *value as u64,
			Operand::ImmF(value) => value.to_bits() as u64,
			Operand::ImmD(value) => value.to_bits(),
			Operand::Sym(sym) => {
				let name = &linked.symbols[sym.0 as usize];
				self.linker.resolve(name)
					.map_err(|_| ExecError::Unresolved(name.clone()))?
					.encode() as u64
			},
		})
	}
}

fn extend(value: u64, bits: u8, signed: bool) -> u64 {
	match (bits, signed) {
		(8, true) => value as u8 as i8 as i64 as u64,
		(8, false) => value as u8 as u64,
		(16, true) => value as u16 as i16 as i64 as u64,
		(16, false) => value as u16 as u64,
		(32, true) => value as u32 as i32 as i64 as u64,
		(32, false) => value as u32 as u64,
		_ => value,
	}
}

fn bin_op(op: BinOp, a: u64, b: u64) -> Result<u64, ExecError> {
	Ok(match op {
		BinOp::Add => a.wrapping_add(b),
		BinOp::Sub => a.wrapping_sub(b),
		BinOp::Mul => a.wrapping_mul(b),
		BinOp::Div => {
			let (a, b) = (a as i64, b as i64);
			if b == 0 {
				return Err(ExecError::Trap("unguarded integer division"));
			}
			a.wrapping_div(b) as u64
		},
		BinOp::DivU => {
			if b == 0 {
				return Err(ExecError::Trap("unguarded integer division"));
			}
			a / b
		},
		BinOp::Rem => {
			let (a, b) = (a as i64, b as i64);
			if b == 0 {
				return Err(ExecError::Trap("unguarded integer remainder"));
			}
			a.wrapping_rem(b) as u64
		},
		BinOp::RemU => {
			if b == 0 {
				return Err(ExecError::Trap("unguarded integer remainder"));
			}
			a % b
		},
		BinOp::And => a & b,
		BinOp::Or => a | b,
		BinOp::Xor => a ^ b,
		BinOp::Shl => a.wrapping_shl(b as u32 & 63),
		BinOp::Shr => ((a as i64).wrapping_shr(b as u32 & 63)) as u64,
		BinOp::ShrU => a.wrapping_shr(b as u32 & 63),
	})
}

fn int_pred(pred: Pred, a: u64, b: u64) -> bool {
	let (sa, sb) = (a as i64, b as i64);
	match pred {
		Pred::Eq => a == b,
		Pred::Ne => a != b,
		Pred::Lt => sa < sb,
		Pred::Le => sa <= sb,
		Pred::Gt => sa > sb,
		Pred::Ge => sa >= sb,
		Pred::Ult => a < b,
		Pred::Ule => a <= b,
		Pred::Ugt => a > b,
		Pred::Uge => a >= b,
	}
}

/// Unsigned predicates double as the unordered float forms.
fn float_pred(pred: Pred, a: f64, b: f64) -> bool {
	match pred {
		Pred::Eq => a == b,
		Pred::Ne => a != b,
		Pred::Lt => a < b,
		Pred::Le => a <= b,
		Pred::Gt => a > b,
		Pred::Ge => a >= b,
		Pred::Ult => !(a >= b),
		Pred::Ule => !(a > b),
		Pred::Ugt => !(a <= b),
		Pred::Uge => !(a < b),
	}
}

fn address_of(base: u64, offset: i32) -> Result<usize, ExecError> {
	let address = (base as i64).wrapping_add(offset as i64) as usize;
	if address == 0 {
		return Err(ExecError::Trap("null memory access"));
	}
	Ok(address)
}

fn read_mem(address: usize, size: MemSize) -> u64 {
	unsafe {
		match size {
			MemSize::I8 => std::ptr::read_unaligned(address as *const i8) as i64 as u64,
			MemSize::U8 => std::ptr::read_unaligned(address as *const u8) as u64,
			MemSize::I16 => std::ptr::read_unaligned(address as *const i16) as i64 as u64,
			MemSize::U16 => std::ptr::read_unaligned(address as *const u16) as u64,
			MemSize::I32 => std::ptr::read_unaligned(address as *const i32) as i64 as u64,
			MemSize::U32 | MemSize::F => std::ptr::read_unaligned(address as *const u32) as u64,
			MemSize::I64 | MemSize::D | MemSize::P => std::ptr::read_unaligned(address as *const u64),
		}
	}
}

fn write_mem(address: usize, size: MemSize, value: u64) {
	unsafe {
		match size {
			MemSize::I8 | MemSize::U8 => std::ptr::write_unaligned(address as *mut u8, value as u8),
			MemSize::I16 | MemSize::U16 => std::ptr::write_unaligned(address as *mut u16, value as u16),
			MemSize::I32 | MemSize::U32 | MemSize::F => std::ptr::write_unaligned(address as *mut u32, value as u32),
			MemSize::I64 | MemSize::D | MemSize::P => std::ptr::write_unaligned(address as *mut u64, value),
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::mir::link::Linker;
	use crate::mir::{FuncBuilder, Insn, MirType, Module, Operand, Proto};
	use super::*;

	#[test]
	fn executes_arithmetic_and_returns_two_slots() {
		let mut module = Module::new("t");
		let mut f = FuncBuilder::new("f_add");
		let a = f.param(MirType::I64);
		let b = f.param(MirType::I64);
		let sum = f.reg(MirType::I64);
		f.emit(Insn::Bin { op: BinOp::Add, dst: sum, a: a.into(), b: b.into() });
		f.emit(Insn::Ret { exc: Operand::Imm(0), value: Some(sum.into()) });
		module.add_function(f.finish(true));

		let mut linker = Linker::new();
		linker.link_module(module).unwrap();
		let machine = Machine::new(&linker);
		assert!(matches!(machine.call_by_name("f_add", &[2, 3]), Ok((0, 5))));
	}

	#[test]
	fn branches_and_loops() {
		// Sums 0..n with a back edge.
		let mut module = Module::new("t");
		let mut f = FuncBuilder::new("f_sum");
		let n = f.param(MirType::I64);
		let i = f.reg(MirType::I64);
		let acc = f.reg(MirType::I64);
		let head = f.label();
		let done = f.label();
		f.emit(Insn::Mov { dst: i, src: Operand::Imm(0) });
		f.emit(Insn::Mov { dst: acc, src: Operand::Imm(0) });
		f.bind(head);
		f.emit(Insn::Branch { pred: Pred::Ge, a: i.into(), b: n.into(), target: done });
		f.emit(Insn::Bin { op: BinOp::Add, dst: acc, a: acc.into(), b: i.into() });
		f.emit(Insn::Bin { op: BinOp::Add, dst: i, a: i.into(), b: Operand::Imm(1) });
		f.emit(Insn::Jump { target: head });
		f.bind(done);
		f.emit(Insn::Ret { exc: Operand::Imm(0), value: Some(acc.into()) });
		module.add_function(f.finish(true));

		let mut linker = Linker::new();
		linker.link_module(module).unwrap();
		let machine = Machine::new(&linker);
		assert!(matches!(machine.call_by_name("f_sum", &[5]), Ok((0, 10))));
	}

	#[test]
	fn host_functions_receive_raw_words() {
		let mut linker = Linker::new();
		linker.add_host_fn("h_double", Box::new(|args: &[u64]| (0, args[0] * 2))).unwrap();

		let mut module = Module::new("t");
		let proto = module.proto(Proto { params: vec![MirType::I64], ret: Some(MirType::I64) });
		let callee = module.import("h_double");
		let mut f = FuncBuilder::new("f_call");
		let x = f.param(MirType::I64);
		let exc = f.reg(MirType::P);
		let ret = f.reg(MirType::I64);
		f.emit(Insn::Call {
			proto,
			target: crate::mir::CallTarget::Sym(callee),
			exc,
			ret: Some(ret),
			args: vec![x.into()],
		});
		f.emit(Insn::Ret { exc: exc.into(), value: Some(ret.into()) });
		module.add_function(f.finish(true));

		linker.link_module(module).unwrap();
		let machine = Machine::new(&linker);
		assert!(matches!(machine.call_by_name("f_call", &[21]), Ok((0, 42))));
	}

	#[test]
	fn alloca_is_zeroed_and_addressable() {
		let mut module = Module::new("t");
		let mut f = FuncBuilder::new("f_slot");
		let slot = f.reg(MirType::P);
		let value = f.reg(MirType::I64);
		f.emit(Insn::Alloca { dst: slot, size: 16 });
		f.emit(Insn::Load { dst: value, base: slot.into(), offset: 8, size: MemSize::I64 });
		f.emit(Insn::Store { src: Operand::Imm(7), base: slot.into(), offset: 0, size: MemSize::I32 });
		f.emit(Insn::Load { dst: value, base: slot.into(), offset: 0, size: MemSize::I32 });
		f.emit(Insn::Ret { exc: Operand::Imm(0), value: Some(value.into()) });
		module.add_function(f.finish(true));

		let mut linker = Linker::new();
		linker.link_module(module).unwrap();
		let machine = Machine::new(&linker);
		assert!(matches!(machine.call_by_name("f_slot", &[]), Ok((0, 7))));
	}
}
