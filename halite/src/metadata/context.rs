use std::cell::Cell;
use std::pin::Pin;

use bumpalo::Bump;
use derivative::Derivative;
use fxhash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

use crate::metadata::assembly::{Assembly, AssemblyName, Module};
use crate::metadata::types::{
	FillState, Method, Primitive, StackType, Type, TypeKind, TypeLayout, TypePool, POINTER_SIZE,
};
use crate::metadata::LoadError;
use crate::raw::heaps::BlobIndex;
use crate::raw::indices::metadata_token::{MethodDefToken, TypeDefToken};
use crate::raw::tables::{MetadataRecords, MethodAttributes, MethodImplAttributes, TypeAttributes};

/// Owns the arena every loaded entity lives in, the derivative-type pool
/// and the set of loaded assemblies. The built-in core library is
/// synthesized at construction, so primitive and well-known types exist
/// before the first assembly loads.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Context<'l> {
	#[derivative(Debug = "ignore")]
	bump: Pin<Box<Bump>>,
	#[derivative(Debug = "ignore")]
	pool: &'l TypePool<'l>,
	#[derivative(Debug = "ignore")]
	assemblies: FxHashMap<&'l str, &'l Assembly<'l>>,
	#[derivative(Debug = "ignore")]
	corlib: &'l Assembly<'l>,
}

pub const CORLIB_NAME: &str = "System.Private.CoreLib";

impl<'l> Context<'l> {
	pub fn new() -> Self {
		let bump = Pin::new(Box::new(Bump::new()));
		let bump_ref: &'l Bump = unsafe { std::mem::transmute(&*bump) };
		let pool = &*bump_ref.alloc(TypePool::new(bump_ref));
		let corlib = install_corlib(bump_ref, pool);

		let mut assemblies = FxHashMap::default();
		assemblies.insert(corlib.name().name, corlib);

		Context { bump, pool, assemblies, corlib }
	}

	#[inline]
	pub fn load_assembly(&mut self, records: MetadataRecords) -> Result<&'l Assembly<'l>, LoadError> {
		Assembly::load(self, records)
	}

	#[inline]
	pub fn loaded_assemblies(&self) -> &FxHashMap<&'l str, &'l Assembly<'l>> {
		&self.assemblies
	}

	#[inline]
	pub fn find_assembly(&self, name: &str) -> Option<&'l Assembly<'l>> {
		self.assemblies.get(name).copied()
	}

	#[inline]
	pub fn corlib(&self) -> &'l Assembly<'l> {
		self.corlib
	}

	#[inline]
	pub fn pool(&self) -> &'l TypePool<'l> {
		self.pool
	}

	#[inline]
	pub(crate) fn bump(&self) -> &'l Bump {
		unsafe { std::mem::transmute(&*self.bump) }
	}

	pub(crate) fn register_assembly(&mut self, assembly: &'l Assembly<'l>) {
		self.assemblies.insert(assembly.name().name, assembly);
	}
}

impl Default for Context<'_> {
	fn default() -> Self {
		Self::new()
	}
}

fn class<'l>(bump: &'l Bump, namespace: &'static str, name: &'static str) -> &'l Type<'l> {
	let ty = &*bump.alloc(Type::new(name, namespace, TypeKind::Class));
	ty.flags.set(TypeAttributes::PUBLIC);
	ty
}

fn object_layout() -> TypeLayout {
	TypeLayout {
		stack_size: POINTER_SIZE,
		stack_align: POINTER_SIZE,
		managed_size: POINTER_SIZE,
		managed_align: POINTER_SIZE,
		stack_type: StackType::Object,
	}
}

fn runtime_ctor<'l>(bump: &'l Bump, pool: &TypePool<'l>, ty: &'l Type<'l>) -> &'l Method<'l> {
	let method = &*bump.alloc(Method {
		token: MethodDefToken(0).into(),
		name: ".ctor",
		flags: MethodAttributes::PUBLIC
			| MethodAttributes::SPECIAL_NAME
			| MethodAttributes::RT_SPECIAL_NAME,
		impl_flags: MethodImplAttributes::RUNTIME,
		signature: BlobIndex(0),
		declaring_type: Cell::new(Some(ty)),
		return_type: Cell::new(Some(pool.get_primitive(Primitive::Void))),
		params: Cell::new(&[]),
		body_bytes: Cell::new(None),
		vtable_offset: Cell::new(None),
		jit_function: Cell::new(None),
	});
	ty.methods.set(bump.alloc_slice_copy(&[method]));
	method
}

/// The minimal core library: `System.Object` and friends, the primitives,
/// and the exception types the JIT throws. Their constructors are
/// runtime-implemented.
fn install_corlib<'l>(bump: &'l Bump, pool: &'l TypePool<'l>) -> &'l Assembly<'l> {
	let mut types: Vec<&'l Type<'l>> = vec![];
	let mut methods: Vec<&'l Method<'l>> = vec![];

	let object = class(bump, "System", "Object");
	object.layout.set(Some(object_layout()));
	types.push(object);

	let value_type = class(bump, "System", "ValueType");
	value_type.parent.set(Some(object));
	value_type.flags.set(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT);
	value_type.layout.set(Some(object_layout()));
	types.push(value_type);

	let enum_base = class(bump, "System", "Enum");
	enum_base.parent.set(Some(value_type));
	enum_base.flags.set(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT);
	enum_base.layout.set(Some(object_layout()));
	types.push(enum_base);

	// Strings and arrays carry a native-int length right after the header.
	let string = class(bump, "System", "String");
	string.parent.set(Some(object));
	string.flags.set(TypeAttributes::PUBLIC | TypeAttributes::SEALED);
	string.layout.set(Some(TypeLayout {
		managed_size: POINTER_SIZE * 2,
		..object_layout()
	}));
	types.push(string);

	let array = class(bump, "System", "Array");
	array.parent.set(Some(object));
	array.flags.set(TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT);
	array.layout.set(Some(TypeLayout {
		managed_size: POINTER_SIZE * 2,
		..object_layout()
	}));
	types.push(array);

	pool.register_well_known(object);
	pool.register_well_known(value_type);
	pool.register_well_known(string);
	pool.register_well_known(array);

	for primitive in Primitive::ALL {
		let ty = &*bump.alloc(Type::new(primitive.name(), "System", TypeKind::ValueType));
		ty.flags.set(TypeAttributes::PUBLIC | TypeAttributes::SEALED);
		ty.parent.set(Some(value_type));
		ty.layout.set(Some(match primitive {
			Primitive::Void => TypeLayout {
				stack_size: 0,
				stack_align: 1,
				managed_size: 0,
				managed_align: 1,
				stack_type: StackType::ValueType,
			},
			_ => TypeLayout {
				stack_size: primitive.size(),
				stack_align: primitive.size(),
				managed_size: primitive.size(),
				managed_align: primitive.size(),
				stack_type: primitive.stack_type(),
			},
		}));
		pool.register_primitive(primitive, ty);
		types.push(ty);
	}

	let exception = class(bump, "System", "Exception");
	exception.parent.set(Some(object));
	exception.layout.set(Some(object_layout()));
	types.push(exception);

	let arithmetic = class(bump, "System", "ArithmeticException");
	arithmetic.parent.set(Some(exception));
	arithmetic.layout.set(Some(object_layout()));
	types.push(arithmetic);

	for (name, parent) in [
		("DivideByZeroException", arithmetic),
		("OverflowException", arithmetic),
		("NullReferenceException", exception),
		("IndexOutOfRangeException", exception),
		("InvalidCastException", exception),
		("OutOfMemoryException", exception),
		("ExecutionEngineException", exception),
	] {
		let ty = class(bump, "System", name);
		ty.parent.set(Some(parent));
		ty.layout.set(Some(object_layout()));
		types.push(ty);
	}

	methods.push(runtime_ctor(bump, pool, object));
	for &ty in &types {
		let throwable = ty.namespace() == "System" && ty.name().ends_with("Exception");
		if throwable {
			methods.push(runtime_ctor(bump, pool, ty));
		}
	}

	for (index, ty) in types.iter().enumerate() {
		ty.token.set(TypeDefToken(index + 1).into());
		ty.fill_state.set(FillState::Filled);
	}

	let name = AssemblyName {
		major_version: 8,
		minor_version: 0,
		build_number: 0,
		revision_number: 0,
		flags: Default::default(),
		name: CORLIB_NAME,
		culture: "",
	};
	let module = Module { name: "System.Private.CoreLib.dll", mvid: Uuid::nil() };

	let assembly = Assembly::synthetic(bump, pool, name, module, &types, &methods);
	debug!(types = assembly.types().len(), "core library installed");
	assembly
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn corlib_installs_primitives_and_well_knowns() {
		let ctx = Context::new();
		let pool = ctx.pool();

		let int32 = pool.get_primitive(Primitive::Int32);
		assert_eq!(int32.name(), "Int32");
		assert_eq!(int32.namespace(), "System");
		assert!(int32.is_value_type());
		assert_eq!(int32.layout().unwrap().stack_size, 4);

		assert_eq!(pool.object_base().name(), "Object");
		assert_eq!(pool.string_base().name(), "String");
		assert!(ctx.corlib().find_type("System", "DivideByZeroException").is_some());
	}

	#[test]
	fn array_and_byref_derivatives_are_unique() {
		let ctx = Context::new();
		let pool = ctx.pool();
		let int32 = pool.get_primitive(Primitive::Int32);

		let a = pool.get_array(int32);
		let b = pool.get_array(int32);
		assert!(std::ptr::eq(a, b));
		assert_eq!(a.name(), "Int32[]");
		assert_eq!(a.stack_type(), StackType::Object);

		let r1 = pool.get_byref(int32).unwrap();
		let r2 = pool.get_byref(int32).unwrap();
		assert!(std::ptr::eq(r1, r2));
		assert_eq!(r1.stack_type(), StackType::ByRef);
		assert!(pool.get_byref(r1).is_err());
	}

	#[test]
	fn exception_hierarchy_roots_at_exception() {
		let ctx = Context::new();
		let corlib = ctx.corlib();
		let divide = corlib.find_type("System", "DivideByZeroException").unwrap();
		let arithmetic = divide.parent().unwrap();
		assert_eq!(arithmetic.name(), "ArithmeticException");
		assert_eq!(arithmetic.parent().unwrap().name(), "Exception");
	}
}
