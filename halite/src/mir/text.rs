//! Deterministic text form of MIR modules. Register and label numbers are
//! assigned in emission order and symbol names derive from method identity,
//! so equal inputs print equal text.

use std::fmt::{Display, Formatter, Result};

use crate::mir::{CallTarget, Function, Insn, Module, Operand};

fn fmt_operand(f: &mut Formatter<'_>, operand: &Operand, symbols: &[String]) -> Result {
	match operand {
		Operand::Reg(reg) => write!(f, "r{}", reg.0),
		Operand::Imm(value) => write!(f, "{value}"),
		Operand::ImmF(value) => write!(f, "{value:?}f"),
		Operand::ImmD(value) => write!(f, "{value:?}d"),
		Operand::Sym(sym) => write!(f, "@{}", symbols[sym.0 as usize]),
	}
}

macro_rules! operands {
    ($f: expr, $symbols: expr, $($operand: expr),*) => {{
		let mut first = true;
		$(
			if !first { write!($f, ", ")?; }
			first = false;
			fmt_operand($f, $operand, $symbols)?;
		)*
		let _ = first;
	}};
}

fn fmt_insn(f: &mut Formatter<'_>, insn: &Insn, symbols: &[String]) -> Result {
	match insn {
		Insn::Bind(label) => return write!(f, "l{}:", label.0),
		Insn::Mov { dst, src } => {
			write!(f, "\tmov r{}, ", dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Ext { dst, src, bits, signed } => {
			let kind = match signed {
				true => "sext",
				false => "zext",
			};
			write!(f, "\t{kind}{bits} r{}, ", dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Bin { op, dst, a, b } => {
			write!(f, "\t{} r{}, ", format!("{op:?}").to_lowercase(), dst.0)?;
			operands!(f, symbols, a, b);
		},
		Insn::FBin { op, ty, dst, a, b } => {
			write!(f, "\tf{}.{} r{}, ", format!("{op:?}").to_lowercase(), ty.tag(), dst.0)?;
			operands!(f, symbols, a, b);
		},
		Insn::Neg { dst, src } => {
			write!(f, "\tneg r{}, ", dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::FNeg { ty, dst, src } => {
			write!(f, "\tfneg.{} r{}, ", ty.tag(), dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Not { dst, src } => {
			write!(f, "\tnot r{}, ", dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Cmp { pred, dst, a, b } => {
			write!(f, "\tcmp.{} r{}, ", format!("{pred:?}").to_lowercase(), dst.0)?;
			operands!(f, symbols, a, b);
		},
		Insn::FCmp { pred, ty, dst, a, b } => {
			write!(f, "\tfcmp.{}.{} r{}, ", format!("{pred:?}").to_lowercase(), ty.tag(), dst.0)?;
			operands!(f, symbols, a, b);
		},
		Insn::Conv { kind, dst, src } => {
			write!(f, "\tconv.{} r{}, ", format!("{kind:?}").to_lowercase(), dst.0)?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Jump { target } => write!(f, "\tjmp l{}", target.0)?,
		Insn::Branch { pred, a, b, target } => {
			write!(f, "\tb.{} ", format!("{pred:?}").to_lowercase())?;
			operands!(f, symbols, a, b);
			write!(f, ", l{}", target.0)?;
		},
		Insn::Bz { src, target } => {
			write!(f, "\tbz ")?;
			fmt_operand(f, src, symbols)?;
			write!(f, ", l{}", target.0)?;
		},
		Insn::Bnz { src, target } => {
			write!(f, "\tbnz ")?;
			fmt_operand(f, src, symbols)?;
			write!(f, ", l{}", target.0)?;
		},
		Insn::Switch { src, targets } => {
			write!(f, "\tswitch ")?;
			fmt_operand(f, src, symbols)?;
			for target in targets {
				write!(f, ", l{}", target.0)?;
			}
		},
		Insn::Load { dst, base, offset, size } => {
			write!(f, "\tload.{} r{}, [", format!("{size:?}").to_lowercase(), dst.0)?;
			fmt_operand(f, base, symbols)?;
			write!(f, " + {offset}]")?;
		},
		Insn::Store { src, base, offset, size } => {
			write!(f, "\tstore.{} [", format!("{size:?}").to_lowercase())?;
			fmt_operand(f, base, symbols)?;
			write!(f, " + {offset}], ")?;
			fmt_operand(f, src, symbols)?;
		},
		Insn::Alloca { dst, size } => write!(f, "\talloca r{}, {size}", dst.0)?,
		Insn::Memcpy { dst, src, len } => {
			write!(f, "\tmemcpy ")?;
			operands!(f, symbols, dst, src);
			write!(f, ", {len}")?;
		},
		Insn::Memset { dst, value, len } => {
			write!(f, "\tmemset ")?;
			fmt_operand(f, dst, symbols)?;
			write!(f, ", {value}, {len}")?;
		},
		Insn::Call { proto, target, exc, ret, args } => {
			write!(f, "\tcall p{} ", proto.0)?;
			match target {
				CallTarget::Sym(sym) => write!(f, "@{}", symbols[sym.0 as usize])?,
				CallTarget::Indirect(operand) => {
					write!(f, "*")?;
					fmt_operand(f, operand, symbols)?;
				},
			}
			write!(f, ", exc r{}", exc.0)?;
			if let Some(ret) = ret {
				write!(f, ", ret r{}", ret.0)?;
			}
			write!(f, ", (")?;
			for (index, arg) in args.iter().enumerate() {
				if index != 0 {
					write!(f, ", ")?;
				}
				fmt_operand(f, arg, symbols)?;
			}
			write!(f, ")")?;
		},
		Insn::Ret { exc, value } => {
			write!(f, "\tret ")?;
			fmt_operand(f, exc, symbols)?;
			if let Some(value) = value {
				write!(f, ", ")?;
				fmt_operand(f, value, symbols)?;
			}
		},
	}
	Ok(())
}

fn fmt_function(f: &mut Formatter<'_>, function: &Function, symbols: &[String]) -> Result {
	write!(f, "func {}(", function.name)?;
	for (index, param) in function.params.iter().enumerate() {
		if index != 0 {
			write!(f, ", ")?;
		}
		write!(f, "r{}: {}", param.0, function.reg_types[param.0 as usize].tag())?;
	}
	writeln!(f, ") {{")?;

	for (index, ty) in function.reg_types.iter().enumerate() {
		if function.params.iter().any(|p| p.0 as usize == index) {
			continue;
		}
		writeln!(f, "\tlocal r{index}: {}", ty.tag())?;
	}

	for insn in &function.insns {
		fmt_insn(f, insn, symbols)?;
		writeln!(f)?;
	}
	writeln!(f, "}}")
}

impl Display for Module {
	fn fmt(&self, f: &mut Formatter<'_>) -> Result {
		writeln!(f, "module {}", self.name)?;
		for (index, proto) in self.protos.iter().enumerate() {
			write!(f, "proto p{index} (")?;
			for (position, ty) in proto.params.iter().enumerate() {
				if position != 0 {
					write!(f, ", ")?;
				}
				write!(f, "{}", ty.tag())?;
			}
			write!(f, ")")?;
			if let Some(ret) = &proto.ret {
				write!(f, " -> {}", ret.tag())?;
			}
			writeln!(f)?;
		}
		for sym in &self.imports {
			writeln!(f, "import {}", self.symbols[sym.0 as usize])?;
		}
		for (sym, size) in &self.bss {
			writeln!(f, "bss {} {size}", self.symbols[sym.0 as usize])?;
		}
		for (sym, bytes) in &self.data {
			writeln!(f, "data {} {}", self.symbols[sym.0 as usize], bytes.len())?;
		}
		for function in &self.functions {
			fmt_function(f, function, &self.symbols)?;
		}
		Ok(())
	}
}
