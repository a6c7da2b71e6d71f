//! Module linking and post-link address resolution.
//!
//! Function addresses are tagged handles (the external generator hands out
//! real code pointers; the reference interpreter hands out table indices in
//! a reserved range), data and bss symbols resolve to real buffer memory.
//! The link step itself runs under a process-wide mutex because the shared
//! MIR context is not safe for concurrent module insertion.

use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use fxhash::FxHashMap;
use tracing::debug;

use crate::mir::{Function, Module, Proto};

/// Guards insertion into the shared link state across JIT phases.
pub static MIR_CONTEXT_LOCK: Mutex<()> = Mutex::new(());

const FUNC_ADDR_BASE: usize = 0x4655_0000_0000;
const HOST_ADDR_BASE: usize = 0x484F_0000_0000;
const ADDR_RANGE: usize = 0xFFFF_FFFF;

/// A host-provided runtime helper: takes raw argument words, returns the
/// two-slot (exception, value) pair.
pub type HostFn<'l> = Box<dyn Fn(&[u64]) -> (u64, u64) + 'l>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Address {
	Func(u32),
	Host(u32),
	Mem(usize),
}

impl Address {
	pub fn encode(&self) -> usize {
		match self {
			Address::Func(index) => FUNC_ADDR_BASE + *index as usize,
			Address::Host(index) => HOST_ADDR_BASE + *index as usize,
			Address::Mem(address) => *address,
		}
	}

	pub fn decode(value: usize) -> Address {
		if (FUNC_ADDR_BASE..FUNC_ADDR_BASE + ADDR_RANGE).contains(&value) {
			Address::Func((value - FUNC_ADDR_BASE) as u32)
		} else if (HOST_ADDR_BASE..HOST_ADDR_BASE + ADDR_RANGE).contains(&value) {
			Address::Host((value - HOST_ADDR_BASE) as u32)
		} else {
			Address::Mem(value)
		}
	}
}

#[derive(Debug)]
pub enum LinkError {
	DuplicateSymbol(String),
	Unresolved(String),
}

pub(crate) struct LinkedFunction {
	pub function: Function,
	/// Module-local symbol names, indexed by `SymId`.
	pub symbols: Vec<String>,
	pub protos: Vec<Proto>,
	/// Instruction index of each label.
	pub label_offsets: Vec<usize>,
}

/// The shared link state: every linked function, host helpers and the
/// buffers backing data/bss symbols.
pub struct Linker<'l> {
	functions: Vec<LinkedFunction>,
	host_fns: Vec<(String, HostFn<'l>)>,
	symbols: FxHashMap<String, Address>,
	// Leaked on purpose: emitted code holds raw addresses into these until
	// process exit, matching the lifetime of JIT artifacts.
	buffers: Vec<Box<[u8]>>,
}

impl Debug for Linker<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Linker")
			.field("functions", &self.functions.len())
			.field("host_fns", &self.host_fns.len())
			.field("symbols", &self.symbols.len())
			.finish()
	}
}

impl<'l> Linker<'l> {
	pub fn new() -> Self {
		Self {
			functions: vec![],
			host_fns: vec![],
			symbols: Default::default(),
			buffers: vec![],
		}
	}

	pub fn has_symbol(&self, name: &str) -> bool {
		self.symbols.contains_key(name)
	}

	/// Registers a runtime helper callable from emitted code.
	pub fn add_host_fn(&mut self, name: &str, f: HostFn<'l>) -> Result<(), LinkError> {
		if self.symbols.contains_key(name) {
			return Err(LinkError::DuplicateSymbol(name.to_string()));
		}
		let address = Address::Host(self.host_fns.len() as u32);
		self.host_fns.push((name.to_string(), f));
		self.symbols.insert(name.to_string(), address);
		Ok(())
	}

	/// Transfers a finished module into the shared state. Imports resolve
	/// lazily at call time, so mutually recursive modules link in any order.
	pub fn link_module(&mut self, module: Module) -> Result<(), LinkError> {
		let _guard = MIR_CONTEXT_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());

		for (sym, size) in &module.bss {
			let name = module.sym_name(*sym);
			if self.symbols.contains_key(name) {
				return Err(LinkError::DuplicateSymbol(name.to_string()));
			}
			let buffer = vec![0u8; (*size).max(1) as usize].into_boxed_slice();
			let address = Address::Mem(buffer.as_ptr() as usize);
			self.buffers.push(buffer);
			self.symbols.insert(name.to_string(), address);
		}

		for (sym, bytes) in &module.data {
			let name = module.sym_name(*sym);
			if self.symbols.contains_key(name) {
				return Err(LinkError::DuplicateSymbol(name.to_string()));
			}
			let buffer = bytes.clone().into_boxed_slice();
			let address = Address::Mem(buffer.as_ptr() as usize);
			self.buffers.push(buffer);
			self.symbols.insert(name.to_string(), address);
		}

		let symbols = module.symbols.clone();
		let protos = module.protos.clone();
		for function in module.functions {
			if self.symbols.contains_key(&function.name) {
				return Err(LinkError::DuplicateSymbol(function.name.clone()));
			}
			let address = Address::Func(self.functions.len() as u32);
			self.symbols.insert(function.name.clone(), address);

			let mut label_offsets = vec![0usize; function.label_count as usize];
			for (index, insn) in function.insns.iter().enumerate() {
				if let crate::mir::Insn::Bind(label) = insn {
					label_offsets[label.0 as usize] = index;
				}
			}

			self.functions.push(LinkedFunction {
				function,
				symbols: symbols.clone(),
				protos: protos.clone(),
				label_offsets,
			});
		}

		debug!(module = module.name, functions = self.functions.len(), "module linked");
		Ok(())
	}

	/// Binds a symbol to an arbitrary stable address (runtime type pointers
	/// and similar host data). Rebinding to the same address is a no-op.
	pub fn define_symbol(&mut self, name: &str, address: usize) -> Result<(), LinkError> {
		match self.symbols.get(name) {
			Some(existing) if *existing == Address::Mem(address) => Ok(()),
			Some(_) => Err(LinkError::DuplicateSymbol(name.to_string())),
			None => {
				self.symbols.insert(name.to_string(), Address::Mem(address));
				Ok(())
			},
		}
	}

	/// Publishes a raw buffer (runtime vtables, string slots) and returns
	/// its stable address.
	pub fn publish_buffer(&mut self, bytes: Vec<u8>) -> usize {
		let buffer = bytes.into_boxed_slice();
		let address = buffer.as_ptr() as usize;
		self.buffers.push(buffer);
		address
	}

	/// Post-link address of any symbol, encoded for storage in memory
	/// (vtable slots, function-pointer fields).
	pub fn address_of(&self, name: &str) -> Option<usize> {
		self.symbols.get(name).map(Address::encode)
	}

	pub fn resolve(&self, name: &str) -> Result<Address, LinkError> {
		self.symbols.get(name).copied()
			.ok_or_else(|| LinkError::Unresolved(name.to_string()))
	}

	pub(crate) fn function(&self, index: u32) -> Option<&LinkedFunction> {
		self.functions.get(index as usize)
	}

	pub(crate) fn host_fn(&self, index: u32) -> Option<&(String, HostFn<'l>)> {
		self.host_fns.get(index as usize)
	}
}

impl Default for Linker<'_> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use crate::mir::{FuncBuilder, Insn, Module, Operand};
	use super::*;

	#[test]
	fn addresses_round_trip_through_encoding() {
		for address in [Address::Func(0), Address::Func(41), Address::Host(7), Address::Mem(0x7FFF_1234)] {
			assert_eq!(Address::decode(address.encode()), address);
		}
	}

	#[test]
	fn linking_registers_functions_and_buffers() {
		let mut linker = Linker::new();
		let mut module = Module::new("demo");
		module.bss("statics", 16);

		let mut f = FuncBuilder::new("f_demo");
		f.emit(Insn::Ret { exc: Operand::Imm(0), value: Some(Operand::Imm(3)) });
		module.add_function(f.finish(true));

		linker.link_module(module).unwrap();
		assert!(linker.address_of("f_demo").is_some());
		assert!(matches!(linker.resolve("statics"), Ok(Address::Mem(_))));
		assert!(linker.resolve("missing").is_err());
	}

	#[test]
	fn duplicate_symbols_are_rejected() {
		let mut linker = Linker::new();
		let mut module = Module::new("a");
		module.bss("dup", 8);
		linker.link_module(module).unwrap();

		let mut module = Module::new("b");
		module.bss("dup", 8);
		assert!(matches!(linker.link_module(module), Err(LinkError::DuplicateSymbol(_))));
	}
}
