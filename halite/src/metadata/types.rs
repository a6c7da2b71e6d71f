use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use bumpalo::Bump;
use derivative::Derivative;
use fxhash::FxHashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::metadata::assembly::Assembly;
use crate::metadata::LoadError;
use crate::raw::heaps::BlobIndex;
use crate::raw::indices::metadata_token::{MetadataToken, TypeDefToken};
use crate::raw::tables::{
	FieldAttributes, MethodAttributes, MethodImplAttributes, ParamAttributes, TypeAttributes,
};

pub const POINTER_SIZE: u32 = 8;

/// The primitive CLI types with fixed layouts.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Primitive {
	Void,
	Boolean,
	Char,
	Int8,
	UInt8,
	Int16,
	UInt16,
	Int32,
	UInt32,
	Int64,
	UInt64,
	Float,
	Double,
	IntPtr,
	UIntPtr,
}

impl Primitive {
	pub fn size(&self) -> u32 {
		match self {
			Primitive::Void => 0,
			Primitive::Boolean | Primitive::Int8 | Primitive::UInt8 => 1,
			Primitive::Char | Primitive::Int16 | Primitive::UInt16 => 2,
			Primitive::Int32 | Primitive::UInt32 | Primitive::Float => 4,
			Primitive::Int64 | Primitive::UInt64 | Primitive::Double => 8,
			Primitive::IntPtr | Primitive::UIntPtr => POINTER_SIZE,
		}
	}

	pub fn stack_type(&self) -> StackType {
		match self {
			Primitive::Void => StackType::ValueType,
			Primitive::Boolean | Primitive::Char
			| Primitive::Int8 | Primitive::UInt8
			| Primitive::Int16 | Primitive::UInt16
			| Primitive::Int32 | Primitive::UInt32 => StackType::Int32,
			Primitive::Int64 | Primitive::UInt64 => StackType::Int64,
			Primitive::Float | Primitive::Double => StackType::Float,
			Primitive::IntPtr | Primitive::UIntPtr => StackType::IntPtr,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Primitive::Void => "Void",
			Primitive::Boolean => "Boolean",
			Primitive::Char => "Char",
			Primitive::Int8 => "SByte",
			Primitive::UInt8 => "Byte",
			Primitive::Int16 => "Int16",
			Primitive::UInt16 => "UInt16",
			Primitive::Int32 => "Int32",
			Primitive::UInt32 => "UInt32",
			Primitive::Int64 => "Int64",
			Primitive::UInt64 => "UInt64",
			Primitive::Float => "Single",
			Primitive::Double => "Double",
			Primitive::IntPtr => "IntPtr",
			Primitive::UIntPtr => "UIntPtr",
		}
	}

	pub const ALL: [Primitive; 15] = [
		Primitive::Void, Primitive::Boolean, Primitive::Char,
		Primitive::Int8, Primitive::UInt8, Primitive::Int16, Primitive::UInt16,
		Primitive::Int32, Primitive::UInt32, Primitive::Int64, Primitive::UInt64,
		Primitive::Float, Primitive::Double, Primitive::IntPtr, Primitive::UIntPtr,
	];
}

/// Evaluation-stack classification of a value of some type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StackType {
	Int32,
	Int64,
	IntPtr,
	Float,
	Object,
	ByRef,
	ValueType,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeKind {
	Class,
	Interface,
	ValueType,
	Array,
	ByRef,
	Pointer,
	GenericParameter,
}

/// Frozen once a type reaches [FillState::Filled].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TypeLayout {
	pub stack_size: u32,
	pub stack_align: u32,
	pub managed_size: u32,
	pub managed_align: u32,
	pub stack_type: StackType,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FillState {
	Unfilled,
	Filling,
	Filled,
}

/// One implemented interface and the start of its slot run inside the
/// implementing type's vtable.
#[derive(Debug, Copy, Clone)]
pub struct InterfaceImpl<'l> {
	pub interface: &'l Type<'l>,
	pub vtable_offset: usize,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Type<'l> {
	pub(crate) token: Cell<MetadataToken>,
	pub(crate) kind: Cell<TypeKind>,
	pub(crate) name: &'l str,
	pub(crate) namespace: &'l str,
	pub(crate) primitive: Cell<Option<Primitive>>,
	pub(crate) flags: Cell<TypeAttributes>,
	#[derivative(Debug = "ignore")]
	pub(crate) assembly: Cell<Option<&'l Assembly<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) parent: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) declaring_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) element_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) generic_definition: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) generic_args: Cell<&'l [&'l Type<'l>]>,
	pub(crate) generic_param_count: Cell<u32>,
	pub(crate) generic_param_index: Cell<Option<u32>>,
	#[derivative(Debug = "ignore")]
	pub(crate) fields: Cell<&'l [&'l Field<'l>]>,
	#[derivative(Debug = "ignore")]
	pub(crate) methods: Cell<&'l [&'l Method<'l>]>,
	#[derivative(Debug = "ignore")]
	pub(crate) virtual_methods: Cell<&'l [&'l Method<'l>]>,
	#[derivative(Debug = "ignore")]
	pub(crate) interfaces: Cell<&'l [InterfaceImpl<'l>]>,
	pub(crate) layout: Cell<Option<TypeLayout>>,
	pub(crate) managed_pointer_offsets: Cell<&'l [u32]>,
	/// Address of the published runtime vtable buffer, zero until the JIT
	/// driver links the owning assembly.
	pub(crate) runtime_vtable: Cell<usize>,
	pub(crate) fill_state: Cell<FillState>,
}

impl<'l> Type<'l> {
	pub(crate) fn new(name: &'l str, namespace: &'l str, kind: TypeKind) -> Self {
		Type {
			token: Cell::new(TypeDefToken(0).into()),
			kind: Cell::new(kind),
			name,
			namespace,
			primitive: Cell::new(None),
			flags: Cell::new(TypeAttributes::default()),
			assembly: Cell::new(None),
			parent: Cell::new(None),
			declaring_type: Cell::new(None),
			element_type: Cell::new(None),
			generic_definition: Cell::new(None),
			generic_args: Cell::new(&[]),
			generic_param_count: Cell::new(0),
			generic_param_index: Cell::new(None),
			fields: Cell::new(&[]),
			methods: Cell::new(&[]),
			virtual_methods: Cell::new(&[]),
			interfaces: Cell::new(&[]),
			layout: Cell::new(None),
			managed_pointer_offsets: Cell::new(&[]),
			runtime_vtable: Cell::new(0),
			fill_state: Cell::new(FillState::Unfilled),
		}
	}

	#[inline]
	pub fn name(&self) -> &'l str {
		self.name
	}

	#[inline]
	pub fn namespace(&self) -> &'l str {
		self.namespace
	}

	#[inline]
	pub fn kind(&self) -> TypeKind {
		self.kind.get()
	}

	#[inline]
	pub fn token(&self) -> MetadataToken {
		self.token.get()
	}

	#[inline]
	pub fn primitive(&self) -> Option<Primitive> {
		self.primitive.get()
	}

	#[inline]
	pub fn flags(&self) -> TypeAttributes {
		self.flags.get()
	}

	#[inline]
	pub fn assembly(&self) -> Option<&'l Assembly<'l>> {
		self.assembly.get()
	}

	#[inline]
	pub fn parent(&self) -> Option<&'l Type<'l>> {
		self.parent.get()
	}

	#[inline]
	pub fn declaring_type(&self) -> Option<&'l Type<'l>> {
		self.declaring_type.get()
	}

	#[inline]
	pub fn element_type(&self) -> Option<&'l Type<'l>> {
		self.element_type.get()
	}

	#[inline]
	pub fn generic_args(&self) -> &'l [&'l Type<'l>] {
		self.generic_args.get()
	}

	#[inline]
	pub fn generic_definition(&self) -> Option<&'l Type<'l>> {
		self.generic_definition.get()
	}

	#[inline]
	pub fn fields(&self) -> &'l [&'l Field<'l>] {
		self.fields.get()
	}

	#[inline]
	pub fn methods(&self) -> &'l [&'l Method<'l>] {
		self.methods.get()
	}

	#[inline]
	pub fn virtual_methods(&self) -> &'l [&'l Method<'l>] {
		self.virtual_methods.get()
	}

	#[inline]
	pub fn interfaces(&self) -> &'l [InterfaceImpl<'l>] {
		self.interfaces.get()
	}

	#[inline]
	pub fn managed_pointer_offsets(&self) -> &'l [u32] {
		self.managed_pointer_offsets.get()
	}

	#[inline]
	pub fn is_filled(&self) -> bool {
		self.fill_state.get() == FillState::Filled
	}

	#[inline]
	pub fn is_interface(&self) -> bool {
		self.kind.get() == TypeKind::Interface
	}

	#[inline]
	pub fn is_array(&self) -> bool {
		self.kind.get() == TypeKind::Array
	}

	#[inline]
	pub fn is_by_ref(&self) -> bool {
		self.kind.get() == TypeKind::ByRef
	}

	#[inline]
	pub fn is_pointer(&self) -> bool {
		self.kind.get() == TypeKind::Pointer
	}

	#[inline]
	pub fn is_generic_parameter(&self) -> bool {
		self.kind.get() == TypeKind::GenericParameter
	}

	#[inline]
	pub fn generic_param_index(&self) -> Option<u32> {
		self.generic_param_index.get()
	}

	#[inline]
	pub fn is_generic_definition(&self) -> bool {
		self.generic_param_count.get() != 0 && self.generic_args.get().is_empty()
	}

	#[inline]
	pub fn is_value_type(&self) -> bool {
		matches!(self.kind.get(), TypeKind::ValueType | TypeKind::Pointer)
	}

	/// Object references: classes, interfaces and arrays.
	#[inline]
	pub fn is_object_ref(&self) -> bool {
		matches!(self.kind.get(), TypeKind::Class | TypeKind::Interface | TypeKind::Array)
	}

	pub fn is_enum(&self) -> bool {
		match self.parent.get() {
			Some(parent) => parent.namespace == "System" && parent.name == "Enum",
			None => false,
		}
	}

	/// For enums, the type of the `value__` field; the type itself otherwise.
	pub fn underlying_type(&'l self) -> &'l Type<'l> {
		if self.is_enum() {
			for field in self.fields.get() {
				if !field.is_static() {
					if let Some(ty) = field.ty.get() {
						return ty;
					}
				}
			}
		}
		self
	}

	pub fn layout(&self) -> Option<TypeLayout> {
		self.layout.get()
	}

	/// Evaluation-stack classification. Types without a computed layout
	/// (interfaces, generic parameters) classify as objects.
	pub fn stack_type(&self) -> StackType {
		match self.layout.get() {
			Some(layout) => layout.stack_type,
			None => StackType::Object,
		}
	}

	pub fn stack_size(&self) -> u32 {
		self.layout.get().map(|l| l.stack_size).unwrap_or(POINTER_SIZE)
	}

	pub fn stack_align(&self) -> u32 {
		self.layout.get().map(|l| l.stack_align).unwrap_or(POINTER_SIZE)
	}

	pub fn managed_size(&self) -> u32 {
		self.layout.get().map(|l| l.managed_size).unwrap_or(0)
	}

	pub fn runtime_vtable(&self) -> usize {
		self.runtime_vtable.get()
	}

	/// Walks `self` and its ancestors looking for `interface`.
	pub fn interface_impl(&'l self, interface: &'l Type<'l>) -> Option<InterfaceImpl<'l>> {
		let mut current = Some(self);
		while let Some(ty) = current {
			for impl_ in ty.interfaces.get() {
				if std::ptr::eq(impl_.interface, interface) {
					return Some(*impl_);
				}
			}
			current = ty.parent.get();
		}
		None
	}

	pub fn find_field(&self, name: &str) -> Option<&'l Field<'l>> {
		self.fields.get().iter().find(|f| f.name == name).copied()
	}

	pub fn find_method(&self, name: &str) -> Option<&'l Method<'l>> {
		self.methods.get().iter().find(|m| m.name == name).copied()
	}
}

impl Display for Type<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.namespace.is_empty() {
			true => write!(f, "{}", self.name)?,
			false => write!(f, "{}.{}", self.namespace, self.name)?,
		}
		let args = self.generic_args.get();
		if !args.is_empty() {
			write!(f, "<")?;
			for (i, arg) in args.iter().enumerate() {
				match i {
					0 => write!(f, "{arg}")?,
					_ => write!(f, ", {arg}")?,
				}
			}
			write!(f, ">")?;
		}
		Ok(())
	}
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Field<'l> {
	pub(crate) token: MetadataToken,
	pub(crate) name: &'l str,
	pub(crate) flags: FieldAttributes,
	pub(crate) signature: BlobIndex,
	#[derivative(Debug = "ignore")]
	pub(crate) declaring_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) ty: Cell<Option<&'l Type<'l>>>,
	pub(crate) offset: Cell<u32>,
}

impl<'l> Field<'l> {
	#[inline]
	pub fn name(&self) -> &'l str {
		self.name
	}

	#[inline]
	pub fn flags(&self) -> FieldAttributes {
		self.flags
	}

	#[inline]
	pub fn token(&self) -> MetadataToken {
		self.token
	}

	#[inline]
	pub fn is_static(&self) -> bool {
		self.flags.contains(FieldAttributes::STATIC)
	}

	#[inline]
	pub fn is_init_only(&self) -> bool {
		self.flags.contains(FieldAttributes::INIT_ONLY)
	}

	#[inline]
	pub fn declaring_type(&self) -> Option<&'l Type<'l>> {
		self.declaring_type.get()
	}

	/// The field's type. Unset only before the declaring type is filled.
	#[inline]
	pub fn field_type(&self) -> Option<&'l Type<'l>> {
		self.ty.get()
	}

	/// Byte offset inside the declaring type's layout (instance fields).
	#[inline]
	pub fn offset(&self) -> u32 {
		self.offset.get()
	}
}

#[derive(Debug)]
pub struct Param<'l> {
	pub(crate) name: &'l str,
	pub(crate) flags: ParamAttributes,
	pub(crate) sequence: u16,
	pub(crate) ty: Cell<Option<&'l Type<'l>>>,
}

impl<'l> Param<'l> {
	#[inline]
	pub fn name(&self) -> &'l str {
		self.name
	}

	#[inline]
	pub fn flags(&self) -> ParamAttributes {
		self.flags
	}

	#[inline]
	pub fn param_type(&self) -> Option<&'l Type<'l>> {
		self.ty.get()
	}
}

/// How a method body is provided.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CodeType {
	Il,
	Native,
	Runtime,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Method<'l> {
	pub(crate) token: MetadataToken,
	pub(crate) name: &'l str,
	pub(crate) flags: MethodAttributes,
	pub(crate) impl_flags: MethodImplAttributes,
	pub(crate) signature: BlobIndex,
	#[derivative(Debug = "ignore")]
	pub(crate) declaring_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) return_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) params: Cell<&'l [&'l Param<'l>]>,
	#[derivative(Debug = "ignore")]
	pub(crate) body_bytes: Cell<Option<&'l [u8]>>,
	pub(crate) vtable_offset: Cell<Option<usize>>,
	/// Linked MIR function id, set when the owning assembly is JITted.
	pub(crate) jit_function: Cell<Option<u32>>,
}

impl<'l> Method<'l> {
	#[inline]
	pub fn name(&self) -> &'l str {
		self.name
	}

	#[inline]
	pub fn token(&self) -> MetadataToken {
		self.token
	}

	#[inline]
	pub fn flags(&self) -> MethodAttributes {
		self.flags
	}

	#[inline]
	pub fn impl_flags(&self) -> MethodImplAttributes {
		self.impl_flags
	}

	#[inline]
	pub fn declaring_type(&self) -> Option<&'l Type<'l>> {
		self.declaring_type.get()
	}

	#[inline]
	pub fn return_type(&self) -> Option<&'l Type<'l>> {
		self.return_type.get()
	}

	#[inline]
	pub fn params(&self) -> &'l [&'l Param<'l>] {
		self.params.get()
	}

	#[inline]
	pub fn body_bytes(&self) -> Option<&'l [u8]> {
		self.body_bytes.get()
	}

	#[inline]
	pub fn vtable_offset(&self) -> Option<usize> {
		self.vtable_offset.get()
	}

	#[inline]
	pub fn jit_function(&self) -> Option<u32> {
		self.jit_function.get()
	}

	#[inline]
	pub fn is_static(&self) -> bool {
		self.flags.contains(MethodAttributes::STATIC)
	}

	#[inline]
	pub fn is_virtual(&self) -> bool {
		self.flags.contains(MethodAttributes::VIRTUAL)
	}

	#[inline]
	pub fn is_abstract(&self) -> bool {
		self.flags.contains(MethodAttributes::ABSTRACT)
	}

	#[inline]
	pub fn is_final(&self) -> bool {
		self.flags.contains(MethodAttributes::FINAL)
	}

	#[inline]
	pub fn is_rt_special_name(&self) -> bool {
		self.flags.contains(MethodAttributes::RT_SPECIAL_NAME)
	}

	#[inline]
	pub fn is_internal_call(&self) -> bool {
		self.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL)
	}

	pub fn code_type(&self) -> CodeType {
		let code = self.impl_flags & MethodImplAttributes::CODE_TYPE_MASK;
		if code == MethodImplAttributes::NATIVE {
			CodeType::Native
		} else if code == MethodImplAttributes::RUNTIME {
			CodeType::Runtime
		} else {
			CodeType::Il
		}
	}

	/// Name + signature identity used for override and interface matching.
	pub fn signature_matches(&self, other: &Method<'l>) -> bool {
		if self.name != other.name {
			return false;
		}
		let (a, b) = (self.params.get(), other.params.get());
		if a.len() != b.len() {
			return false;
		}
		if !opt_ptr_eq(self.return_type.get(), other.return_type.get()) {
			return false;
		}
		a.iter().zip(b).all(|(pa, pb)| opt_ptr_eq(pa.ty.get(), pb.ty.get()))
	}
}

#[inline]
fn opt_ptr_eq<'l>(a: Option<&'l Type<'l>>, b: Option<&'l Type<'l>>) -> bool {
	match (a, b) {
		(Some(a), Some(b)) => std::ptr::eq(a, b),
		(None, None) => true,
		_ => false,
	}
}

impl Display for Method<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.declaring_type.get() {
			Some(ty) => write!(f, "{}::{}", ty, self.name),
			None => write!(f, "{}", self.name),
		}
	}
}

macro_rules! impl_identity {
    ($($ty: ident),*) => {
		$(
			impl Eq for $ty<'_> {}

			impl PartialEq<Self> for $ty<'_> {
				#[inline]
				fn eq(&self, other: &Self) -> bool {
					std::ptr::eq(self, other)
				}
			}

			impl Hash for $ty<'_> {
				fn hash<H: Hasher>(&self, state: &mut H) {
					(self as *const Self).hash(state)
				}
			}
		)*
	};
}

impl_identity!(Type, Field, Method);

/// Arena-backed cache of derived and primitive types. Array, by-ref and
/// pointer derivatives are unique per element type; generic instantiations
/// are unique per (definition, argument list).
pub struct TypePool<'l> {
	bump: &'l Bump,
	primitives: RefCell<FxHashMap<Primitive, &'l Type<'l>>>,
	arrays: RefCell<HashMap<*const Type<'l>, &'l Type<'l>, BuildNoHashHasher<usize>>>,
	byrefs: RefCell<HashMap<*const Type<'l>, &'l Type<'l>, BuildNoHashHasher<usize>>>,
	pointers: RefCell<HashMap<*const Type<'l>, &'l Type<'l>, BuildNoHashHasher<usize>>>,
	generic_instances: RefCell<FxHashMap<(*const Type<'l>, Vec<*const Type<'l>>), &'l Type<'l>>>,
	generic_type_params: RefCell<FxHashMap<u32, &'l Type<'l>>>,
	generic_method_params: RefCell<FxHashMap<u32, &'l Type<'l>>>,
	array_base: Cell<Option<&'l Type<'l>>>,
	object_base: Cell<Option<&'l Type<'l>>>,
	value_type_base: Cell<Option<&'l Type<'l>>>,
	string_base: Cell<Option<&'l Type<'l>>>,
	null: &'l Type<'l>,
}

impl<'l> TypePool<'l> {
	pub(crate) fn new(bump: &'l Bump) -> Self {
		// The marker type `ldnull` pushes; assignable to any object reference.
		let null = &*bump.alloc(Type::new("<null>", "", TypeKind::Class));
		null.fill_state.set(FillState::Filled);

		Self {
			bump,
			primitives: Default::default(),
			arrays: Default::default(),
			byrefs: Default::default(),
			pointers: Default::default(),
			generic_instances: Default::default(),
			generic_type_params: Default::default(),
			generic_method_params: Default::default(),
			array_base: Cell::new(None),
			object_base: Cell::new(None),
			value_type_base: Cell::new(None),
			string_base: Cell::new(None),
			null,
		}
	}

	#[inline]
	pub(crate) fn bump(&self) -> &'l Bump {
		self.bump
	}

	pub(crate) fn register_primitive(&self, primitive: Primitive, ty: &'l Type<'l>) {
		ty.primitive.set(Some(primitive));
		self.primitives.borrow_mut().insert(primitive, ty);
	}

	pub(crate) fn register_well_known(&self, ty: &'l Type<'l>) {
		match (ty.namespace, ty.name) {
			("System", "Array") => self.array_base.set(Some(ty)),
			("System", "Object") => self.object_base.set(Some(ty)),
			("System", "ValueType") => self.value_type_base.set(Some(ty)),
			("System", "String") => self.string_base.set(Some(ty)),
			_ => {},
		}
	}

	pub fn get_primitive(&self, primitive: Primitive) -> &'l Type<'l> {
		self.primitives.borrow().get(&primitive).copied()
			.expect("primitive types are installed before any assembly loads")
	}

	pub fn object_base(&self) -> &'l Type<'l> {
		self.object_base.get().expect("System.Object is installed before any assembly loads")
	}

	pub fn array_base(&self) -> &'l Type<'l> {
		self.array_base.get().expect("System.Array is installed before any assembly loads")
	}

	pub fn value_type_base(&self) -> &'l Type<'l> {
		self.value_type_base.get().expect("System.ValueType is installed before any assembly loads")
	}

	pub fn string_base(&self) -> &'l Type<'l> {
		self.string_base.get().expect("System.String is installed before any assembly loads")
	}

	#[inline]
	pub fn null_type(&self) -> &'l Type<'l> {
		self.null
	}

	/// `T[]`, unique per element type.
	pub fn get_array(&self, element: &'l Type<'l>) -> &'l Type<'l> {
		if let Some(ty) = self.arrays.borrow().get(&(element as *const _)).copied() {
			return ty;
		}

		let base = self.array_base();
		let ty = &*self.bump.alloc(Type::new(
			self.bump.alloc_str(&format!("{}[]", element.name)),
			element.namespace,
			TypeKind::Array,
		));
		ty.assembly.set(element.assembly.get());
		ty.parent.set(Some(base));
		ty.element_type.set(Some(element));
		ty.layout.set(Some(TypeLayout {
			stack_size: POINTER_SIZE,
			stack_align: POINTER_SIZE,
			managed_size: base.managed_size(),
			managed_align: POINTER_SIZE,
			stack_type: StackType::Object,
		}));
		ty.fill_state.set(FillState::Filled);
		self.arrays.borrow_mut().insert(element as _, ty);
		ty
	}

	/// `T&`, unique per referent type. By-refs never nest.
	pub fn get_byref(&self, referent: &'l Type<'l>) -> Result<&'l Type<'l>, LoadError> {
		if referent.is_by_ref() {
			return Err(LoadError::BadFormat("by-ref types cannot nest"));
		}
		if let Some(ty) = self.byrefs.borrow().get(&(referent as *const _)).copied() {
			return Ok(ty);
		}

		let ty = &*self.bump.alloc(Type::new(
			self.bump.alloc_str(&format!("{}&", referent.name)),
			referent.namespace,
			TypeKind::ByRef,
		));
		ty.assembly.set(referent.assembly.get());
		ty.element_type.set(Some(referent));
		ty.layout.set(Some(TypeLayout {
			stack_size: POINTER_SIZE,
			stack_align: POINTER_SIZE,
			managed_size: POINTER_SIZE,
			managed_align: POINTER_SIZE,
			stack_type: StackType::ByRef,
		}));
		ty.fill_state.set(FillState::Filled);
		self.byrefs.borrow_mut().insert(referent as _, ty);
		Ok(ty)
	}

	/// `T*`, unique per pointee type.
	pub fn get_pointer(&self, pointee: &'l Type<'l>) -> &'l Type<'l> {
		if let Some(ty) = self.pointers.borrow().get(&(pointee as *const _)).copied() {
			return ty;
		}

		let ty = &*self.bump.alloc(Type::new(
			self.bump.alloc_str(&format!("{}*", pointee.name)),
			pointee.namespace,
			TypeKind::Pointer,
		));
		ty.assembly.set(pointee.assembly.get());
		ty.element_type.set(Some(pointee));
		ty.layout.set(Some(TypeLayout {
			stack_size: POINTER_SIZE,
			stack_align: POINTER_SIZE,
			managed_size: POINTER_SIZE,
			managed_align: POINTER_SIZE,
			stack_type: StackType::IntPtr,
		}));
		ty.fill_state.set(FillState::Filled);
		self.pointers.borrow_mut().insert(pointee as _, ty);
		ty
	}

	/// `VAR n` inside an open generic definition.
	pub(crate) fn get_generic_type_param(&self, index: u32) -> &'l Type<'l> {
		if let Some(ty) = self.generic_type_params.borrow().get(&index).copied() {
			return ty;
		}

		let ty = &*self.bump.alloc(Type::new(
			self.bump.alloc_str(&format!("!{index}")),
			"",
			TypeKind::GenericParameter,
		));
		ty.generic_param_index.set(Some(index));
		self.generic_type_params.borrow_mut().insert(index, ty);
		ty
	}

	/// `MVAR n` inside a generic method signature.
	pub(crate) fn get_generic_method_param(&self, index: u32) -> &'l Type<'l> {
		if let Some(ty) = self.generic_method_params.borrow().get(&index).copied() {
			return ty;
		}

		let ty = &*self.bump.alloc(Type::new(
			self.bump.alloc_str(&format!("!!{index}")),
			"",
			TypeKind::GenericParameter,
		));
		ty.generic_param_index.set(Some(index));
		self.generic_method_params.borrow_mut().insert(index, ty);
		ty
	}

	fn lookup_generic_instantiation(
		&self,
		definition: &'l Type<'l>,
		args: &[&'l Type<'l>],
	) -> Option<&'l Type<'l>> {
		let key = (definition as *const _, args.iter().map(|a| *a as *const _).collect());
		self.generic_instances.borrow().get(&key).copied()
	}

	/// Instantiates a generic definition with concrete arguments, unique per
	/// argument list. The shell registers before members substitute so
	/// recursive references (`Node<T>` containing `Node<T>`) resolve.
	pub fn get_generic_instantiation(
		&self,
		definition: &'l Type<'l>,
		args: &[&'l Type<'l>],
	) -> Result<&'l Type<'l>, LoadError> {
		if definition.generic_param_count.get() as usize != args.len() || args.is_empty() {
			return Err(LoadError::BadFormat("generic argument count mismatch"));
		}
		if let Some(instance) = self.lookup_generic_instantiation(definition, args) {
			return Ok(instance);
		}

		let bump = self.bump;
		let instance = &*bump.alloc(Type::new(definition.name, definition.namespace, definition.kind.get()));
		instance.token.set(definition.token.get());
		instance.flags.set(definition.flags.get());
		instance.assembly.set(definition.assembly.get());
		instance.declaring_type.set(definition.declaring_type.get());
		instance.generic_definition.set(Some(definition));
		instance.generic_args.set(bump.alloc_slice_copy(args));
		instance.generic_param_count.set(definition.generic_param_count.get());
		instance.fill_state.set(FillState::Filling);

		let key = (definition as *const _, args.iter().map(|a| *a as *const _).collect());
		self.generic_instances.borrow_mut().insert(key, instance);

		if let Some(parent) = definition.parent.get() {
			instance.parent.set(Some(self.substitute(parent, args)?));
		}

		let mut fields = Vec::with_capacity(definition.fields.get().len());
		for field in definition.fields.get() {
			let ty = match field.ty.get() {
				Some(ty) => Some(self.substitute(ty, args)?),
				None => None,
			};
			fields.push(&*bump.alloc(Field {
				token: field.token,
				name: field.name,
				flags: field.flags,
				signature: field.signature,
				declaring_type: Cell::new(Some(instance)),
				ty: Cell::new(ty),
				offset: Cell::new(0),
			}));
		}
		instance.fields.set(bump.alloc_slice_copy(&fields));

		let mut methods = Vec::with_capacity(definition.methods.get().len());
		let mut substituted: HashMap<*const Method<'l>, &'l Method<'l>, BuildNoHashHasher<usize>> =
			Default::default();
		for method in definition.methods.get() {
			let mut params = Vec::with_capacity(method.params.get().len());
			for param in method.params.get() {
				let ty = match param.ty.get() {
					Some(ty) => Some(self.substitute(ty, args)?),
					None => None,
				};
				params.push(&*bump.alloc(Param {
					name: param.name,
					flags: param.flags,
					sequence: param.sequence,
					ty: Cell::new(ty),
				}));
			}
			let return_type = match method.return_type.get() {
				Some(ty) => Some(self.substitute(ty, args)?),
				None => None,
			};
			let mapped = &*bump.alloc(Method {
				token: method.token,
				name: method.name,
				flags: method.flags,
				impl_flags: method.impl_flags,
				signature: method.signature,
				declaring_type: Cell::new(Some(instance)),
				return_type: Cell::new(return_type),
				params: Cell::new(bump.alloc_slice_copy(&params)),
				body_bytes: Cell::new(method.body_bytes.get()),
				vtable_offset: Cell::new(method.vtable_offset.get()),
				jit_function: Cell::new(None),
			});
			substituted.insert(*method as *const _, mapped);
			methods.push(mapped);
		}
		instance.methods.set(bump.alloc_slice_copy(&methods));

		// Inherited slots keep their indices, so unmapped entries resolve
		// through the substituted parent's vtable at the same position.
		let parent_virtuals = instance.parent.get()
			.map(|p| p.virtual_methods.get())
			.unwrap_or(&[]);
		let mut virtuals = Vec::with_capacity(definition.virtual_methods.get().len());
		for (index, method) in definition.virtual_methods.get().iter().enumerate() {
			let slot = match substituted.get(&(*method as *const _)) {
				Some(own) => *own,
				None => parent_virtuals.get(index).copied().unwrap_or(*method),
			};
			virtuals.push(slot);
		}
		instance.virtual_methods.set(bump.alloc_slice_copy(&virtuals));

		let mut interfaces = Vec::with_capacity(definition.interfaces.get().len());
		for interface_impl in definition.interfaces.get() {
			interfaces.push(InterfaceImpl {
				interface: self.substitute(interface_impl.interface, args)?,
				vtable_offset: interface_impl.vtable_offset,
			});
		}
		instance.interfaces.set(bump.alloc_slice_copy(&interfaces));

		crate::metadata::layout::compute_type_layout(bump, instance, None)?;
		instance.fill_state.set(FillState::Filled);
		Ok(instance)
	}

	/// Replaces generic parameters with `args` throughout a type shape.
	fn substitute(
		&self,
		ty: &'l Type<'l>,
		args: &[&'l Type<'l>],
	) -> Result<&'l Type<'l>, LoadError> {
		match ty.kind.get() {
			TypeKind::GenericParameter => match ty.generic_param_index.get() {
				Some(index) if (index as usize) < args.len() => Ok(args[index as usize]),
				_ => Ok(ty),
			},
			TypeKind::Array => {
				let element = ty.element_type.get()
					.ok_or(LoadError::CheckFailed("array without element type"))?;
				Ok(self.get_array(self.substitute(element, args)?))
			},
			TypeKind::ByRef => {
				let referent = ty.element_type.get()
					.ok_or(LoadError::CheckFailed("by-ref without referent"))?;
				self.get_byref(self.substitute(referent, args)?)
			},
			TypeKind::Pointer => {
				let pointee = ty.element_type.get()
					.ok_or(LoadError::CheckFailed("pointer without pointee"))?;
				Ok(self.get_pointer(self.substitute(pointee, args)?))
			},
			_ if !ty.generic_args.get().is_empty() => {
				let definition = ty.generic_definition.get()
					.ok_or(LoadError::CheckFailed("instantiation without a definition"))?;
				let mut new_args = Vec::with_capacity(ty.generic_args.get().len());
				for arg in ty.generic_args.get() {
					new_args.push(self.substitute(arg, args)?);
				}
				self.get_generic_instantiation(definition, &new_args)
			},
			_ => Ok(ty),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primitive_layout_constants() {
		assert_eq!(Primitive::Int32.size(), 4);
		assert_eq!(Primitive::Int64.size(), 8);
		assert_eq!(Primitive::IntPtr.size(), 8);
		assert_eq!(Primitive::Float.size(), 4);
		assert_eq!(Primitive::Double.size(), 8);
		assert_eq!(Primitive::Char.size(), 2);
		assert_eq!(Primitive::Boolean.size(), 1);
	}

	#[test]
	fn primitive_stack_types_promote_small_ints() {
		for primitive in [Primitive::Boolean, Primitive::Char, Primitive::Int8, Primitive::UInt16] {
			assert_eq!(primitive.stack_type(), StackType::Int32);
		}
		assert_eq!(Primitive::Int64.stack_type(), StackType::Int64);
		assert_eq!(Primitive::UIntPtr.stack_type(), StackType::IntPtr);
		assert_eq!(Primitive::Double.stack_type(), StackType::Float);
	}
}
