//! The assembly JIT driver.
//!
//! Per assembly, the driver pre-declares prototypes and forwards, reserves
//! bss for static fields and string-literal slots, drives the per-method
//! [translator], links the finished module under the shared context lock,
//! publishes runtime vtables, allocates string literals and registers GC
//! roots for managed statics.

pub(crate) mod eh;
pub(crate) mod stack;
mod translator;

use std::cell::RefCell;
use std::rc::Rc;

use fxhash::FxHashMap;
use tracing::{debug, error};

use crate::metadata::{
	Assembly, CodeType, Context, Field, LoadError, Method, Type, TypePool, POINTER_SIZE,
};
use crate::mir::interp::{ExecError, Machine};
use crate::mir::link::{Address, LinkError, Linker};
use crate::mir::Module;
use crate::runtime::heap::{DefaultHeap, Gc};
use crate::runtime::object::{
	ARRAY_ELEMENTS_OFFSET, ARRAY_LENGTH_OFFSET, STRING_CHARS_OFFSET, VTABLE_FUNCS_OFFSET,
};
use crate::verifier;

#[derive(Debug)]
pub enum JitError {
	Load(LoadError),
	Link(LinkError),
	Verification(&'static str),
	Unsupported(&'static str),
}

impl From<LoadError> for JitError {
	fn from(value: LoadError) -> Self {
		Self::Load(value)
	}
}

impl From<LinkError> for JitError {
	fn from(value: LinkError) -> Self {
		Self::Link(value)
	}
}

impl std::fmt::Display for JitError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			JitError::Load(e) => write!(f, "{e}"),
			JitError::Link(e) => write!(f, "link failed: {e:?}"),
			JitError::Verification(what) => write!(f, "verification failed: {what}"),
			JitError::Unsupported(what) => write!(f, "unsupported: {what}"),
		}
	}
}

fn sanitize(symbol: &mut String, piece: &str) {
	for c in piece.chars() {
		match c.is_ascii_alphanumeric() {
			true => symbol.push(c),
			false => symbol.push('_'),
		}
	}
}

/// Stable unique name for a method, seeded from its identity.
pub fn method_symbol(method: &Method<'_>) -> String {
	let mut symbol = String::from("m$");
	if let Some(ty) = method.declaring_type() {
		if let Some(assembly) = ty.assembly() {
			sanitize(&mut symbol, assembly.name().name);
			symbol.push('$');
		}
		sanitize(&mut symbol, &ty.to_string());
		symbol.push('$');
	}
	sanitize(&mut symbol, method.name());
	symbol.push_str(&format!("${:08x}", method.token().raw()));
	symbol
}

/// Stable name for a static field's storage.
pub fn static_symbol(field: &Field<'_>) -> String {
	let mut symbol = String::from("s$");
	if let Some(ty) = field.declaring_type() {
		if let Some(assembly) = ty.assembly() {
			sanitize(&mut symbol, assembly.name().name);
			symbol.push('$');
		}
		sanitize(&mut symbol, &ty.to_string());
		symbol.push('$');
	}
	sanitize(&mut symbol, field.name());
	symbol.push_str(&format!("${:08x}", field.token().raw()));
	symbol
}

/// Stable name binding a runtime type pointer into emitted code.
pub fn type_symbol(ty: &Type<'_>) -> String {
	let mut symbol = String::from("ty$");
	if let Some(assembly) = ty.assembly() {
		sanitize(&mut symbol, assembly.name().name);
		symbol.push('$');
	}
	sanitize(&mut symbol, &ty.to_string());
	symbol
}

/// Per-assembly translation state shared across method translations.
pub(crate) struct ModuleState<'l> {
	pub module: Module,
	/// (bss symbol, literal) per interned user string.
	pub strings: Vec<(String, String)>,
	string_lookup: FxHashMap<String, usize>,
	/// Static-field slots already declared.
	statics: FxHashMap<*const Field<'l>, String>,
	/// (symbol, managed-pointer offsets) for GC root registration.
	pub static_roots: Vec<(String, Vec<u32>)>,
	/// Type symbols to bind to runtime type pointers before linking.
	pub type_syms: FxHashMap<String, usize>,
}

impl<'l> ModuleState<'l> {
	fn new(name: &str) -> Self {
		Self {
			module: Module::new(name),
			strings: vec![],
			string_lookup: Default::default(),
			statics: Default::default(),
			static_roots: vec![],
			type_syms: Default::default(),
		}
	}

	/// Reserves a pointer-sized slot filled with the interned string object
	/// after linking.
	pub fn string_slot(&mut self, literal: &str) -> String {
		if let Some(index) = self.string_lookup.get(literal) {
			return self.strings[*index].0.clone();
		}
		let symbol = format!("str${}${}", self.module.name, self.strings.len());
		self.module.bss(&symbol, POINTER_SIZE);
		self.string_lookup.insert(literal.to_string(), self.strings.len());
		self.strings.push((symbol.clone(), literal.to_string()));
		symbol
	}

	/// Reserves zero-initialized storage for a static field.
	pub fn static_slot(&mut self, field: &'l Field<'l>) -> Result<String, JitError> {
		if let Some(symbol) = self.statics.get(&(field as *const _)) {
			return Ok(symbol.clone());
		}
		let field_ty = field.field_type()
			.ok_or(JitError::Verification("static field type unresolved"))?;
		let symbol = static_symbol(field);
		let size = match field_ty.is_object_ref() {
			true => POINTER_SIZE,
			false => field_ty.stack_size().max(1),
		};
		self.module.bss(&symbol, size);

		let root_offsets = match field_ty.is_object_ref() {
			true => vec![0],
			false => field_ty.managed_pointer_offsets().to_vec(),
		};
		if !root_offsets.is_empty() {
			self.static_roots.push((symbol.clone(), root_offsets));
		}

		self.statics.insert(field as *const _, symbol.clone());
		Ok(symbol)
	}

	/// Binds a type's runtime pointer to a deterministic symbol.
	pub fn type_ref(&mut self, ty: &'l Type<'l>) -> String {
		let symbol = type_symbol(ty);
		self.type_syms.entry(symbol.clone()).or_insert(ty as *const _ as usize);
		symbol
	}
}

#[derive(Debug, Default, Clone)]
pub struct JitOptions {
	/// Log the MIR text of every linked module.
	pub dump_mir: bool,
}

/// Owns the link state and the default heap, and drives per-assembly
/// compilation. Emitted code executes through the MIR reference
/// interpreter.
pub struct Engine<'l> {
	linker: Linker<'l>,
	heap: Rc<DefaultHeap>,
	vtables: Rc<RefCell<FxHashMap<usize, usize>>>,
	/// Backing storage for vtable headers minted at allocation time for
	/// derived types (arrays, boxed values) no assembly publishes.
	host_buffers: Rc<RefCell<Vec<Box<[u8]>>>>,
	options: JitOptions,
	runtime_installed: bool,
	module_texts: Vec<String>,
}

fn ensure_vtable(
	vtables: &RefCell<FxHashMap<usize, usize>>,
	buffers: &RefCell<Vec<Box<[u8]>>>,
	type_ptr: usize,
) -> usize {
	let mut map = vtables.borrow_mut();
	if let Some(address) = map.get(&type_ptr) {
		return *address;
	}
	// A header with the owning type and no virtual slots is enough for the
	// type tests these objects participate in.
	let buffer: Box<[u8]> = type_ptr.to_le_bytes().to_vec().into_boxed_slice();
	let address = buffer.as_ptr() as usize;
	buffers.borrow_mut().push(buffer);
	map.insert(type_ptr, address);
	address
}

impl<'l> Engine<'l> {
	pub fn new() -> Self {
		Self::with_options(JitOptions::default())
	}

	pub fn with_options(options: JitOptions) -> Self {
		Self {
			linker: Linker::new(),
			heap: Rc::new(DefaultHeap::new()),
			vtables: Rc::new(RefCell::new(FxHashMap::default())),
			options,
			host_buffers: Rc::new(RefCell::new(vec![])),
			runtime_installed: false,
			module_texts: vec![],
		}
	}

	pub fn heap(&self) -> &Rc<DefaultHeap> {
		&self.heap
	}

	pub fn linker(&self) -> &Linker<'l> {
		&self.linker
	}

	/// Text form of every module linked so far, in link order. Equal inputs
	/// produce equal text.
	pub fn module_texts(&self) -> &[String] {
		&self.module_texts
	}

	/// Runs a compiled method; returns the two-slot (exception, value) pair.
	pub fn run(&self, method: &Method<'l>, args: &[u64]) -> Result<(u64, u64), ExecError> {
		Machine::new(&self.linker).call_by_name(&method_symbol(method), args)
	}

	#[tracing::instrument(skip_all, fields(assembly = assembly.name().name))]
	pub fn compile_assembly(
		&mut self,
		ctx: &Context<'l>,
		assembly: &'l Assembly<'l>,
	) -> Result<(), JitError> {
		self.install_runtime(ctx)?;
		let corlib = ctx.corlib();

		let mut state = ModuleState::new(assembly.name().name);
		for method in assembly.methods() {
			if method.is_abstract() {
				continue;
			}
			match method.code_type() {
				CodeType::Il => {
					let Some(declaring) = method.declaring_type() else { continue };
					if declaring.is_generic_definition() {
						// Open generic bodies compile per instantiation,
						// which stays out of scope for this tier.
						continue;
					}
					if method.body_bytes().is_none() {
						continue;
					}
					let body = assembly.method_body(method)?;
					let locals = assembly.method_locals(&body)?;
					if let Err(e) = translator::translate_method(
						ctx.pool(), corlib, assembly, method, &body, &locals, &mut state,
					) {
						error!(method = %method, error = %e, "method JIT failed");
						return Err(e);
					}
				},
				CodeType::Runtime => {
					// Runtime-provided bodies resolve to host no-ops unless
					// the embedder bound something richer.
					let symbol = method_symbol(method);
					if !self.linker.has_symbol(&symbol) {
						self.linker.add_host_fn(&symbol, Box::new(|_| (0, 0)))?;
					}
				},
				CodeType::Native => {},
			}
		}

		for (symbol, address) in &state.type_syms {
			self.linker.define_symbol(symbol, *address)?;
		}

		let text = state.module.to_string();
		if self.options.dump_mir {
			debug!(mir = %text, "module text");
		}
		self.module_texts.push(text);

		let strings = std::mem::take(&mut state.strings);
		let static_roots = std::mem::take(&mut state.static_roots);
		self.linker.link_module(state.module)?;

		for method in assembly.methods() {
			let symbol = method_symbol(method);
			if let Some(address) = self.linker.address_of(&symbol) {
				if let Address::Func(index) = Address::decode(address) {
					method.jit_function.set(Some(index));
				}
			}
		}

		self.publish_vtables(corlib);
		self.publish_vtables(assembly);

		for (symbol, literal) in &strings {
			let slot = match self.linker.resolve(symbol) {
				Ok(Address::Mem(address)) => address,
				_ => return Err(JitError::Link(LinkError::Unresolved(symbol.clone()))),
			};
			let object = self.allocate_string(ctx, literal);
			unsafe {
				std::ptr::write(slot as *mut usize, object);
			}
			self.heap.gc_add_root(slot);
		}

		for (symbol, offsets) in &static_roots {
			let slot = match self.linker.resolve(symbol) {
				Ok(Address::Mem(address)) => address,
				_ => return Err(JitError::Link(LinkError::Unresolved(symbol.clone()))),
			};
			for offset in offsets {
				self.heap.gc_add_root(slot + *offset as usize);
			}
		}

		debug!(methods = assembly.methods().len(), "assembly compiled");
		Ok(())
	}

	/// Builds and publishes the runtime vtable buffer of every concrete
	/// type in `assembly`: the owning type pointer, then the virtual
	/// function addresses.
	fn publish_vtables(&mut self, assembly: &'l Assembly<'l>) {
		for ty in assembly.types() {
			self.publish_vtable(ty);
		}
	}

	fn publish_vtable(&mut self, ty: &'l Type<'l>) {
		if ty.runtime_vtable() != 0 || ty.is_interface() || ty.is_generic_definition() {
			return;
		}

		let virtuals = ty.virtual_methods();
		let mut buffer = Vec::with_capacity((1 + virtuals.len()) * POINTER_SIZE as usize);
		buffer.extend_from_slice(&(ty as *const Type as usize).to_le_bytes());
		for method in virtuals {
			let address = match method.is_abstract() {
				true => 0,
				false => self.linker.address_of(&method_symbol(method)).unwrap_or(0),
			};
			buffer.extend_from_slice(&address.to_le_bytes());
		}

		let address = self.linker.publish_buffer(buffer);
		self.vtables.borrow_mut().insert(ty as *const Type as usize, address);
		ty.runtime_vtable.set(address);
	}

	fn allocate_string(&self, ctx: &Context<'l>, literal: &str) -> usize {
		let string_ty = ctx.pool().string_base();
		let vtable = string_ty.runtime_vtable();
		let units: Vec<u16> = literal.encode_utf16().collect();
		let size = STRING_CHARS_OFFSET as usize + units.len() * 2;
		let object = self.heap.gc_new(vtable, size);
		if object == 0 {
			return 0;
		}
		unsafe {
			std::ptr::write((object + ARRAY_LENGTH_OFFSET as usize) as *mut usize, units.len());
			for (index, unit) in units.iter().enumerate() {
				std::ptr::write_unaligned(
					(object + STRING_CHARS_OFFSET as usize + index * 2) as *mut u16,
					*unit,
				);
			}
		}
		object
	}

	/// Registers the runtime helpers emitted code calls through the GC and
	/// object-model ABI, plus host bindings for the core library's
	/// runtime-implemented constructors.
	fn install_runtime(&mut self, ctx: &Context<'l>) -> Result<(), JitError> {
		if self.runtime_installed {
			return Ok(());
		}
		self.runtime_installed = true;

		let pool: &'l TypePool<'l> = ctx.pool();

		let heap = self.heap.clone();
		let vtables = self.vtables.clone();
		let buffers = self.host_buffers.clone();
		self.linker.add_host_fn("rt_new_object", Box::new(move |args: &[u64]| {
			let ty = unsafe { &*(args[0] as usize as *const Type) };
			let size = match ty.is_value_type() {
				// Boxed values carry the header in front of the payload.
				true => POINTER_SIZE + ty.managed_size(),
				false => ty.managed_size(),
			};
			let vtable = ensure_vtable(&vtables, &buffers, args[0] as usize);
			(0, heap.gc_new(vtable, size.max(POINTER_SIZE) as usize) as u64)
		}))?;

		let heap = self.heap.clone();
		let vtables = self.vtables.clone();
		let buffers = self.host_buffers.clone();
		self.linker.add_host_fn("rt_new_array", Box::new(move |args: &[u64]| {
			let array_ty = unsafe { &*(args[0] as usize as *const Type) };
			let length = args[1] as usize;
			let element_size = array_ty.element_type()
				.map(|e| e.stack_size().max(1))
				.unwrap_or(POINTER_SIZE) as usize;
			let size = ARRAY_ELEMENTS_OFFSET as usize + length * element_size;
			let vtable = ensure_vtable(&vtables, &buffers, args[0] as usize);
			let object = heap.gc_new(vtable, size);
			if object != 0 {
				unsafe {
					std::ptr::write((object + ARRAY_LENGTH_OFFSET as usize) as *mut usize, length);
				}
			}
			(0, object as u64)
		}))?;

		self.linker.add_host_fn("rt_is_instance", Box::new(move |args: &[u64]| {
			let object = args[0] as usize;
			if object == 0 {
				return (0, 0);
			}
			let target = unsafe { &*(args[1] as usize as *const Type) };
			let runtime_ty = unsafe { &*(crate::runtime::object::object_type_ptr(object) as *const Type) };
			match std::ptr::eq(runtime_ty, target) || verifier::compatible_with(pool, runtime_ty, target) {
				true => (0, object as u64),
				false => (0, 0),
			}
		}))?;

		self.linker.add_host_fn("rt_cast_to_interface", Box::new(move |args: &[u64]| {
			let object = args[0] as usize;
			if object == 0 {
				return (0, 0);
			}
			let target = unsafe { &*(args[1] as usize as *const Type) };
			let runtime_ty = unsafe { &*(crate::runtime::object::object_type_ptr(object) as *const Type) };
			match runtime_ty.interface_impl(target) {
				Some(interface_impl) => {
					let vtable = unsafe { crate::runtime::object::object_vtable(object) };
					let slice = vtable
						+ VTABLE_FUNCS_OFFSET as usize
						+ interface_impl.vtable_offset * POINTER_SIZE as usize;
					(0, slice as u64)
				},
				None => (0, 0),
			}
		}))?;

		let heap = self.heap.clone();
		self.linker.add_host_fn("gc_update", Box::new(move |args: &[u64]| {
			heap.gc_update(args[0] as usize, args[1] as usize, args[2] as usize);
			(0, 0)
		}))?;

		let heap = self.heap.clone();
		self.linker.add_host_fn("gc_update_ref", Box::new(move |args: &[u64]| {
			heap.gc_update_ref(args[0] as usize, args[1] as usize);
			(0, 0)
		}))?;

		for method in ctx.corlib().methods() {
			if method.code_type() == CodeType::Runtime {
				let symbol = method_symbol(method);
				if !self.linker.has_symbol(&symbol) {
					self.linker.add_host_fn(&symbol, Box::new(|_| (0, 0)))?;
				}
			}
		}

		Ok(())
	}
}

impl Default for Engine<'_> {
	fn default() -> Self {
		Self::new()
	}
}

// The object-model constants the translator bakes into emitted code must
// agree with the metadata layout rules.
const _: () = assert!(crate::runtime::object::OBJECT_HEADER_SIZE == POINTER_SIZE);
