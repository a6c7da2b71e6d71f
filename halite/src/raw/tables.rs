//! The decoded-row contract with the external metadata reader.
//!
//! The PE/metadata byte parser lives outside this crate; it hands the loader
//! one [MetadataRecords] per module, with rows already widened to native
//! integers and heap indices. Table identifiers survive inside metadata
//! tokens (see [crate::raw::indices::metadata_token]).

use bitflags::bitflags;
use owning_ref::ArcRef;
use uuid::Uuid;

use crate::raw::heaps::{BlobHeap, BlobIndex, StringHeap, StringIndex, UserStringHeap};
use crate::raw::indices::coded_index::TypeDefOrRef;

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeAttributes: u32 {
		/// Use this mask to retrieve visibility information.
		const VISIBILITY_MASK = 0x00000007;
		const NOT_PUBLIC = 0x00000000;
		const PUBLIC = 0x00000001;
		const NESTED_PUBLIC = 0x00000002;
		const NESTED_PRIVATE = 0x00000003;
		const NESTED_FAMILY = 0x00000004;
		const NESTED_ASSEMBLY = 0x00000005;
		const NESTED_FAMILY_AND_ASSEMBLY = 0x00000006;
		const NESTED_FAMILY_OR_ASSEMBLY = 0x00000007;

		/// Use this mask to retrieve class layout information.
		const LAYOUT_MASK = 0x00000018;
		const AUTO_LAYOUT = 0x00000000;
		const SEQUENTIAL_LAYOUT = 0x00000008;
		const EXPLICIT_LAYOUT = 0x00000010;

		/// Use this mask to retrieve class semantics information.
		const CLASS_SEMANTICS_MASK = 0x00000020;
		const CLASS = 0x00000000;
		const INTERFACE = 0x00000020;

		const ABSTRACT = 0x00000080;
		const SEALED = 0x00000100;
		const SPECIAL_NAME = 0x00000400;
		const IMPORTED = 0x00001000;
		const SERIALIZABLE = 0x00002000;

		const BEFORE_FIELD_INIT = 0x00100000;
		const RT_SPECIAL_NAME = 0x00000800;
		const HAS_SECURITY = 0x00040000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldAttributes: u16 {
		/// Use this mask to retrieve access information.
		const FIELD_ACCESS_MASK = 0x0007;
		const COMPILER_CONTROLLED = 0x0000;
		const PRIVATE = 0x0001;
		const FAMILY_AND_ASSEMBLY = 0x0002;
		const ASSEMBLY = 0x0003;
		const FAMILY = 0x0004;
		const FAMILY_OR_ASSEMBLY = 0x0005;
		const PUBLIC = 0x0006;

		/// Defined on the type, else per instance.
		const STATIC = 0x0010;
		/// Field can only be written from an initializer.
		const INIT_ONLY = 0x0020;
		/// Value is a compile time constant.
		const LITERAL = 0x0040;
		const SPECIAL_NAME = 0x0200;
		const RT_SPECIAL_NAME = 0x0400;
		const PINVOKE_IMPL = 0x2000;
		const HAS_FIELD_MARSHAL = 0x1000;
		const HAS_DEFAULT = 0x8000;
		const HAS_FIELD_RVA = 0x0100;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodAttributes: u16 {
		/// Use this mask to retrieve access information.
		const MEMBER_ACCESS_MASK = 0x0007;
		const COMPILER_CONTROLLED = 0x0000;
		const PRIVATE = 0x0001;
		const FAMILY_AND_ASSEMBLY = 0x0002;
		const ASSEMBLY = 0x0003;
		const FAMILY = 0x0004;
		const FAMILY_OR_ASSEMBLY = 0x0005;
		const PUBLIC = 0x0006;

		const STATIC = 0x0010;
		const FINAL = 0x0020;
		const VIRTUAL = 0x0040;
		const HIDE_BY_SIG = 0x0080;

		/// Use this mask to retrieve vtable layout information.
		const VTABLE_LAYOUT_MASK = 0x0100;
		const REUSE_SLOT = 0x0000;
		const NEW_SLOT = 0x0100;

		const STRICT = 0x0200;
		const ABSTRACT = 0x0400;
		const SPECIAL_NAME = 0x0800;
		const RT_SPECIAL_NAME = 0x1000;
		const PINVOKE_IMPL = 0x2000;
		const HAS_SECURITY = 0x4000;
		const REQUIRE_SEC_OBJECT = 0x8000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodImplAttributes: u16 {
		/// Use this mask to retrieve the code type.
		const CODE_TYPE_MASK = 0x0003;
		const IL = 0x0000;
		const NATIVE = 0x0001;
		const OPTIL = 0x0002;
		const RUNTIME = 0x0003;

		const MANAGED_MASK = 0x0004;
		const UNMANAGED = 0x0004;
		const MANAGED = 0x0000;

		const NO_INLINING = 0x0008;
		const FORWARD_REF = 0x0010;
		const SYNCHRONIZED = 0x0020;
		const NO_OPTIMIZATION = 0x0040;
		const PRESERVE_SIG = 0x0080;
		const AGGRESSIVE_INLINING = 0x0100;
		const INTERNAL_CALL = 0x1000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ParamAttributes: u16 {
		const IN = 0x0001;
		const OUT = 0x0002;
		const OPTIONAL = 0x0010;
		const HAS_DEFAULT = 0x1000;
		const HAS_FIELD_MARSHAL = 0x2000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct AssemblyFlags: u32 {
		const PUBLIC_KEY = 0x0001;
		const RETARGETABLE = 0x0100;
		const DISABLE_JIT_COMPILE_OPTIMIZER = 0x4000;
		const ENABLE_JIT_COMPILE_TRACKING = 0x8000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct GenericParamAttributes: u16 {
		const VARIANCE_MASK = 0x0003;
		const COVARIANT = 0x0001;
		const CONTRAVARIANT = 0x0002;

		const SPECIAL_CONSTRAINT_MASK = 0x001C;
		const REFERENCE_TYPE_CONSTRAINT = 0x0004;
		const NOT_NULLABLE_VALUE_TYPE_CONSTRAINT = 0x0008;
		const DEFAULT_CONSTRUCTOR_CONSTRAINT = 0x0010;
	}
}

#[derive(Debug, Clone)]
pub struct ModuleRow {
	pub name: StringIndex,
	pub mvid: Uuid,
}

#[derive(Debug, Clone)]
pub struct AssemblyRow {
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub name: StringIndex,
	pub culture: StringIndex,
}

#[derive(Debug, Clone)]
pub struct AssemblyRefRow {
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub name: StringIndex,
	pub culture: StringIndex,
}

#[derive(Debug, Clone)]
pub struct TypeDefRow {
	pub flags: TypeAttributes,
	pub name: StringIndex,
	pub namespace: StringIndex,
	pub extends: Option<TypeDefOrRef>,
	/// One-based index of the first owned row in the field table.
	pub field_list: usize,
	/// One-based index of the first owned row in the method table.
	pub method_list: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionScope {
	CurrentModule,
	/// One-based row in the assembly-ref table.
	AssemblyRef(usize),
}

#[derive(Debug, Clone)]
pub struct TypeRefRow {
	pub resolution_scope: ResolutionScope,
	pub name: StringIndex,
	pub namespace: StringIndex,
}

#[derive(Debug, Clone)]
pub struct FieldRow {
	pub flags: FieldAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

#[derive(Clone)]
pub struct MethodDefRow {
	/// Method body bytes, already resolved from the RVA by the reader.
	pub body: Option<ArcRef<[u8]>>,
	pub impl_flags: MethodImplAttributes,
	pub flags: MethodAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
	/// One-based index of the first owned row in the param table.
	pub param_list: usize,
}

impl std::fmt::Debug for MethodDefRow {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MethodDefRow")
			.field("body", &self.body.as_ref().map(|b| b.len()))
			.field("impl_flags", &self.impl_flags)
			.field("flags", &self.flags)
			.field("name", &self.name)
			.field("signature", &self.signature)
			.field("param_list", &self.param_list)
			.finish()
	}
}

#[derive(Debug, Clone)]
pub struct ParamRow {
	pub flags: ParamAttributes,
	pub sequence: u16,
	pub name: StringIndex,
}

#[derive(Debug, Clone)]
pub struct InterfaceImplRow {
	/// One-based row in the type-def table.
	pub class: usize,
	pub interface: TypeDefOrRef,
}

#[derive(Debug, Clone)]
pub struct MemberRefRow {
	pub parent: TypeDefOrRef,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

#[derive(Debug, Clone)]
pub struct ClassLayoutRow {
	pub packing_size: u16,
	pub class_size: u32,
	/// One-based row in the type-def table.
	pub parent: usize,
}

#[derive(Debug, Clone)]
pub struct FieldLayoutRow {
	pub offset: u32,
	/// One-based row in the field table.
	pub field: usize,
}

#[derive(Debug, Clone)]
pub struct StandAloneSigRow {
	pub signature: BlobIndex,
}

#[derive(Debug, Clone)]
pub struct TypeSpecRow {
	pub signature: BlobIndex,
}

#[derive(Debug, Clone)]
pub struct GenericParamRow {
	pub number: u16,
	pub flags: GenericParamAttributes,
	/// One-based row in the type-def table. Method-owned generic parameters
	/// are not materialized.
	pub owner: usize,
	pub name: StringIndex,
}

#[derive(Debug, Clone)]
pub struct NestedClassRow {
	/// One-based row of the nested type.
	pub nested: usize,
	/// One-based row of the enclosing type.
	pub enclosing: usize,
}

/// Everything the loader consumes for one module, in table order.
#[derive(Debug, Clone)]
pub struct MetadataRecords {
	pub module: ModuleRow,
	pub assembly: AssemblyRow,
	pub assembly_refs: Vec<AssemblyRefRow>,
	pub type_defs: Vec<TypeDefRow>,
	pub type_refs: Vec<TypeRefRow>,
	pub fields: Vec<FieldRow>,
	pub methods: Vec<MethodDefRow>,
	pub params: Vec<ParamRow>,
	pub interface_impls: Vec<InterfaceImplRow>,
	pub member_refs: Vec<MemberRefRow>,
	pub class_layouts: Vec<ClassLayoutRow>,
	pub field_layouts: Vec<FieldLayoutRow>,
	pub stand_alone_sigs: Vec<StandAloneSigRow>,
	pub type_specs: Vec<TypeSpecRow>,
	pub generic_params: Vec<GenericParamRow>,
	pub nested_classes: Vec<NestedClassRow>,
	pub strings: StringHeap,
	pub blobs: BlobHeap,
	pub user_strings: UserStringHeap,
}
