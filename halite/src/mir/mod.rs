//! The medium-level IR the JIT emits and the external code generator
//! lowers. This module owns the construction API: typed virtual registers,
//! instruction appending, prototypes, zero-initialized and initialized data
//! items, imports and exports, plus module [linking](link) with post-link
//! address resolution, a deterministic [text form](text) and a reference
//! [interpreter](interp).

pub mod interp;
pub mod link;
pub mod text;

use fxhash::FxHashMap;

/// Register classes: 64-bit integers, single floats, double floats and
/// pointers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MirType {
	I64,
	F,
	D,
	P,
}

impl MirType {
	pub(crate) fn tag(&self) -> &'static str {
		match self {
			MirType::I64 => "i64",
			MirType::F => "f",
			MirType::D => "d",
			MirType::P => "p",
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Reg(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Label(pub u32);

/// Index into a module's symbol table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SymId(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ProtoId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Operand {
	Reg(Reg),
	Imm(i64),
	ImmF(f32),
	ImmD(f64),
	/// Resolves to the symbol's address at link time.
	Sym(SymId),
}

impl From<Reg> for Operand {
	fn from(value: Reg) -> Self {
		Operand::Reg(value)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemSize {
	I8,
	U8,
	I16,
	U16,
	I32,
	U32,
	I64,
	F,
	D,
	P,
}

impl MemSize {
	pub fn bytes(&self) -> u32 {
		match self {
			MemSize::I8 | MemSize::U8 => 1,
			MemSize::I16 | MemSize::U16 => 2,
			MemSize::I32 | MemSize::U32 | MemSize::F => 4,
			MemSize::I64 | MemSize::D | MemSize::P => 8,
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinOp {
	Add,
	Sub,
	Mul,
	Div,
	DivU,
	Rem,
	RemU,
	And,
	Or,
	Xor,
	Shl,
	Shr,
	ShrU,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FBinOp {
	Add,
	Sub,
	Mul,
	Div,
}

/// Comparison predicates. The unsigned forms double as the unordered
/// forms for float comparisons.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Pred {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	Ult,
	Ule,
	Ugt,
	Uge,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConvKind {
	/// Signed integer to float/double.
	I64ToF,
	I64ToD,
	/// Unsigned integer to float/double.
	U64ToF,
	U64ToD,
	/// Float/double to integer, native width.
	FToI64,
	DToI64,
	FToD,
	DToF,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CallTarget {
	Sym(SymId),
	Indirect(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
	/// Binds a label at this position.
	Bind(Label),
	Mov { dst: Reg, src: Operand },
	/// Sign- or zero-extends the low `bits` of `src` to the full register.
	Ext { dst: Reg, src: Operand, bits: u8, signed: bool },
	Bin { op: BinOp, dst: Reg, a: Operand, b: Operand },
	FBin { op: FBinOp, ty: MirType, dst: Reg, a: Operand, b: Operand },
	Neg { dst: Reg, src: Operand },
	FNeg { ty: MirType, dst: Reg, src: Operand },
	Not { dst: Reg, src: Operand },
	Cmp { pred: Pred, dst: Reg, a: Operand, b: Operand },
	FCmp { pred: Pred, ty: MirType, dst: Reg, a: Operand, b: Operand },
	Conv { kind: ConvKind, dst: Reg, src: Operand },
	Jump { target: Label },
	Branch { pred: Pred, a: Operand, b: Operand, target: Label },
	Bz { src: Operand, target: Label },
	Bnz { src: Operand, target: Label },
	/// Jumps to `targets[src]`, falling through when out of range.
	Switch { src: Operand, targets: Vec<Label> },
	Load { dst: Reg, base: Operand, offset: i32, size: MemSize },
	Store { src: Operand, base: Operand, offset: i32, size: MemSize },
	/// Zero-initialized frame storage; freed on return.
	Alloca { dst: Reg, size: u32 },
	Memcpy { dst: Operand, src: Operand, len: u32 },
	Memset { dst: Operand, value: u8, len: u32 },
	Call {
		proto: ProtoId,
		target: CallTarget,
		/// Exception slot of the two-slot return convention.
		exc: Reg,
		ret: Option<Reg>,
		args: Vec<Operand>,
	},
	/// Two-slot return: the in-flight exception (null on normal return)
	/// and the value.
	Ret { exc: Operand, value: Option<Operand> },
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Proto {
	pub params: Vec<MirType>,
	pub ret: Option<MirType>,
}

#[derive(Debug, Clone)]
pub struct Function {
	pub name: String,
	pub params: Vec<Reg>,
	pub reg_types: Vec<MirType>,
	pub insns: Vec<Insn>,
	pub label_count: u32,
	pub export: bool,
}

/// Append-only function construction.
pub struct FuncBuilder {
	name: String,
	params: Vec<Reg>,
	reg_types: Vec<MirType>,
	insns: Vec<Insn>,
	label_count: u32,
}

impl FuncBuilder {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			params: vec![],
			reg_types: vec![],
			insns: vec![],
			label_count: 0,
		}
	}

	pub fn param(&mut self, ty: MirType) -> Reg {
		let reg = self.reg(ty);
		self.params.push(reg);
		reg
	}

	pub fn reg(&mut self, ty: MirType) -> Reg {
		let reg = Reg(self.reg_types.len() as u32);
		self.reg_types.push(ty);
		reg
	}

	pub fn reg_type(&self, reg: Reg) -> MirType {
		self.reg_types[reg.0 as usize]
	}

	pub fn label(&mut self) -> Label {
		let label = Label(self.label_count);
		self.label_count += 1;
		label
	}

	pub fn bind(&mut self, label: Label) {
		self.insns.push(Insn::Bind(label));
	}

	pub fn emit(&mut self, insn: Insn) {
		self.insns.push(insn);
	}

	pub fn finish(self, export: bool) -> Function {
		Function {
			name: self.name,
			params: self.params,
			reg_types: self.reg_types,
			insns: self.insns,
			label_count: self.label_count,
			export,
		}
	}
}

/// One translation unit: everything a single assembly JIT produces.
pub struct Module {
	pub name: String,
	pub symbols: Vec<String>,
	pub protos: Vec<Proto>,
	pub functions: Vec<Function>,
	pub imports: Vec<SymId>,
	pub bss: Vec<(SymId, u32)>,
	pub data: Vec<(SymId, Vec<u8>)>,
	symbol_lookup: FxHashMap<String, SymId>,
	proto_lookup: FxHashMap<Proto, ProtoId>,
}

impl Module {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			symbols: vec![],
			protos: vec![],
			functions: vec![],
			imports: vec![],
			bss: vec![],
			data: vec![],
			symbol_lookup: Default::default(),
			proto_lookup: Default::default(),
		}
	}

	pub fn sym(&mut self, name: &str) -> SymId {
		if let Some(id) = self.symbol_lookup.get(name) {
			return *id;
		}
		let id = SymId(self.symbols.len() as u32);
		self.symbols.push(name.to_string());
		self.symbol_lookup.insert(name.to_string(), id);
		id
	}

	pub fn sym_name(&self, id: SymId) -> &str {
		&self.symbols[id.0 as usize]
	}

	pub fn proto(&mut self, proto: Proto) -> ProtoId {
		if let Some(id) = self.proto_lookup.get(&proto) {
			return *id;
		}
		let id = ProtoId(self.protos.len() as u32);
		self.protos.push(proto.clone());
		self.proto_lookup.insert(proto, id);
		id
	}

	pub fn import(&mut self, name: &str) -> SymId {
		let id = self.sym(name);
		if !self.imports.contains(&id) {
			self.imports.push(id);
		}
		id
	}

	pub fn bss(&mut self, name: &str, size: u32) -> SymId {
		let id = self.sym(name);
		self.bss.push((id, size));
		id
	}

	pub fn data(&mut self, name: &str, bytes: Vec<u8>) -> SymId {
		let id = self.sym(name);
		self.data.push((id, bytes));
		id
	}

	pub fn add_function(&mut self, function: Function) -> SymId {
		let name = function.name.clone();
		self.functions.push(function);
		self.sym(&name)
	}
}
