//! Fixture builder: synthesizes the decoded records the external metadata
//! reader would hand the loader, heaps included.

#![allow(dead_code)]

use std::sync::Arc;

use owning_ref::ArcRef;
use uuid::Uuid;

use halite::raw::heaps::{BlobHeapBuilder, StringHeapBuilder, UserStringHeapBuilder};
use halite::raw::indices::coded_index::TypeDefOrRef;
use halite::raw::indices::metadata_token::MetadataToken;
use halite::raw::tables::*;

// Signature element bytes (ECMA-335 II.23.1.16).
pub const EL_VOID: u8 = 0x01;
pub const EL_BOOLEAN: u8 = 0x02;
pub const EL_CHAR: u8 = 0x03;
pub const EL_I1: u8 = 0x04;
pub const EL_U1: u8 = 0x05;
pub const EL_I2: u8 = 0x06;
pub const EL_U2: u8 = 0x07;
pub const EL_I4: u8 = 0x08;
pub const EL_U4: u8 = 0x09;
pub const EL_I8: u8 = 0x0A;
pub const EL_U8: u8 = 0x0B;
pub const EL_R4: u8 = 0x0C;
pub const EL_R8: u8 = 0x0D;
pub const EL_STRING: u8 = 0x0E;
pub const EL_BYREF: u8 = 0x10;
pub const EL_VALUETYPE: u8 = 0x11;
pub const EL_CLASS: u8 = 0x12;
pub const EL_I: u8 = 0x18;
pub const EL_OBJECT: u8 = 0x1C;
pub const EL_SZARRAY: u8 = 0x1D;

pub struct AssemblyBuilder {
	name: String,
	strings: StringHeapBuilder,
	blobs: BlobHeapBuilder,
	user_strings: UserStringHeapBuilder,
	type_defs: Vec<TypeDefRow>,
	type_refs: Vec<TypeRefRow>,
	fields: Vec<FieldRow>,
	methods: Vec<MethodDefRow>,
	interface_impls: Vec<InterfaceImplRow>,
	member_refs: Vec<MemberRefRow>,
	stand_alone_sigs: Vec<StandAloneSigRow>,
	nested_classes: Vec<NestedClassRow>,
	corlib_refs: Vec<(String, String, usize)>,
}

impl AssemblyBuilder {
	pub fn new(name: &str) -> Self {
		Self {
			name: name.to_string(),
			strings: StringHeapBuilder::new(),
			blobs: BlobHeapBuilder::new(),
			user_strings: UserStringHeapBuilder::new(),
			type_defs: vec![],
			type_refs: vec![],
			fields: vec![],
			methods: vec![],
			interface_impls: vec![],
			member_refs: vec![],
			stand_alone_sigs: vec![],
			nested_classes: vec![],
			corlib_refs: vec![],
		}
	}

	/// Declares a type. Fields and methods added afterwards belong to it
	/// until the next `add_type`.
	pub fn add_type(
		&mut self,
		namespace: &str,
		name: &str,
		flags: TypeAttributes,
		extends: Option<TypeDefOrRef>,
	) -> usize {
		let row = TypeDefRow {
			flags,
			name: self.strings.intern(name),
			namespace: self.strings.intern(namespace),
			extends,
			field_list: self.fields.len() + 1,
			method_list: self.methods.len() + 1,
		};
		self.type_defs.push(row);
		self.type_defs.len()
	}

	pub fn add_field(&mut self, name: &str, flags: FieldAttributes, signature: &[u8]) -> MetadataToken {
		self.fields.push(FieldRow {
			flags,
			name: self.strings.intern(name),
			signature: self.blobs.intern(signature),
		});
		MetadataToken::try_from(0x0400_0000 | self.fields.len() as u32).unwrap()
	}

	pub fn add_method(
		&mut self,
		name: &str,
		flags: MethodAttributes,
		signature: &[u8],
		body: Option<Vec<u8>>,
	) -> MetadataToken {
		self.methods.push(MethodDefRow {
			body: body.map(|bytes| ArcRef::new(Arc::from(bytes))),
			impl_flags: MethodImplAttributes::IL,
			flags,
			name: self.strings.intern(name),
			signature: self.blobs.intern(signature),
			param_list: 1,
		});
		MetadataToken::try_from(0x0600_0000 | self.methods.len() as u32).unwrap()
	}

	/// A `TypeRef` into the synthesized core library, deduplicated.
	pub fn corlib_type(&mut self, namespace: &str, name: &str) -> TypeDefOrRef {
		for (existing_ns, existing_name, row) in &self.corlib_refs {
			if existing_ns == namespace && existing_name == name {
				return TypeDefOrRef::TypeRef(*row);
			}
		}
		self.type_refs.push(TypeRefRow {
			resolution_scope: ResolutionScope::AssemblyRef(1),
			name: self.strings.intern(name),
			namespace: self.strings.intern(namespace),
		});
		let row = self.type_refs.len();
		self.corlib_refs.push((namespace.to_string(), name.to_string(), row));
		TypeDefOrRef::TypeRef(row)
	}

	/// A member-ref (method or field) on any `TypeDefOrRef` parent.
	pub fn member_ref(&mut self, parent: TypeDefOrRef, name: &str, signature: &[u8]) -> MetadataToken {
		self.member_refs.push(MemberRefRow {
			parent,
			name: self.strings.intern(name),
			signature: self.blobs.intern(signature),
		});
		MetadataToken::try_from(0x0A00_0000 | self.member_refs.len() as u32).unwrap()
	}

	/// A stand-alone local-variable signature; returns the token the fat
	/// body header carries.
	pub fn locals(&mut self, signature: &[u8]) -> u32 {
		self.stand_alone_sigs.push(StandAloneSigRow {
			signature: self.blobs.intern(signature),
		});
		0x1100_0000 | self.stand_alone_sigs.len() as u32
	}

	pub fn user_string(&mut self, literal: &str) -> MetadataToken {
		let offset = self.user_strings.intern(literal);
		MetadataToken::try_from(0x7000_0000 | offset as u32).unwrap()
	}

	pub fn add_interface_impl(&mut self, class: usize, interface: TypeDefOrRef) {
		self.interface_impls.push(InterfaceImplRow { class, interface });
	}

	pub fn build(self) -> MetadataRecords {
		let mut strings = self.strings;
		let module_name = strings.intern(&format!("{}.dll", self.name));
		let assembly_name = strings.intern(&self.name);
		let corlib_name = strings.intern("System.Private.CoreLib");

		MetadataRecords {
			module: ModuleRow { name: module_name, mvid: Uuid::nil() },
			assembly: AssemblyRow {
				major_version: 1,
				minor_version: 0,
				build_number: 0,
				revision_number: 0,
				flags: AssemblyFlags::default(),
				name: assembly_name,
				culture: Default::default(),
			},
			assembly_refs: vec![AssemblyRefRow {
				major_version: 8,
				minor_version: 0,
				build_number: 0,
				revision_number: 0,
				flags: AssemblyFlags::default(),
				name: corlib_name,
				culture: Default::default(),
			}],
			type_defs: self.type_defs,
			type_refs: self.type_refs,
			fields: self.fields,
			methods: self.methods,
			params: vec![],
			interface_impls: self.interface_impls,
			member_refs: self.member_refs,
			class_layouts: vec![],
			field_layouts: vec![],
			stand_alone_sigs: self.stand_alone_sigs,
			type_specs: vec![],
			generic_params: vec![],
			nested_classes: self.nested_classes,
			strings: strings.build(),
			blobs: self.blobs.build(),
			user_strings: self.user_strings.build(),
		}
	}
}

/// Static method signature blob: default convention, given return and
/// parameter elements.
pub fn static_sig(ret: &[u8], params: &[&[u8]]) -> Vec<u8> {
	let mut blob = vec![0x00, params.len() as u8];
	blob.extend_from_slice(ret);
	for param in params {
		blob.extend_from_slice(param);
	}
	blob
}

/// Instance method signature blob (`HASTHIS`).
pub fn instance_sig(ret: &[u8], params: &[&[u8]]) -> Vec<u8> {
	let mut blob = vec![0x20, params.len() as u8];
	blob.extend_from_slice(ret);
	for param in params {
		blob.extend_from_slice(param);
	}
	blob
}

pub fn field_sig(ty: &[u8]) -> Vec<u8> {
	let mut blob = vec![0x06];
	blob.extend_from_slice(ty);
	blob
}

/// Locals signature blob (`LOCAL_SIG`, count, then the types).
pub fn locals_sig(types: &[&[u8]]) -> Vec<u8> {
	let mut blob = vec![0x07, types.len() as u8];
	for ty in types {
		blob.extend_from_slice(ty);
	}
	blob
}

/// Tiny-format body: code under 64 bytes, max-stack 8, no locals.
pub fn tiny_body(code: &[u8]) -> Vec<u8> {
	assert!(code.len() < 64);
	let mut body = vec![((code.len() as u8) << 2) | 0x2];
	body.extend_from_slice(code);
	body
}

#[derive(Debug, Copy, Clone)]
pub struct EhClause {
	/// 0 = catch, 2 = finally, 4 = fault.
	pub flags: u32,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
	pub class_token: u32,
}

/// Fat-format body with `InitLocals`, an optional locals token and fat
/// exception-handling sections.
pub fn fat_body(max_stack: u16, locals_token: u32, code: &[u8], clauses: &[EhClause]) -> Vec<u8> {
	let mut flags: u16 = 0x3003 | 0x10;
	if !clauses.is_empty() {
		flags |= 0x8;
	}

	let mut body = vec![];
	body.extend_from_slice(&flags.to_le_bytes());
	body.extend_from_slice(&max_stack.to_le_bytes());
	body.extend_from_slice(&(code.len() as u32).to_le_bytes());
	body.extend_from_slice(&locals_token.to_le_bytes());
	body.extend_from_slice(code);

	if !clauses.is_empty() {
		while body.len() % 4 != 0 {
			body.push(0);
		}
		let data_size = (clauses.len() * 24 + 4) as u32;
		body.push(0x1 | 0x40);
		body.extend_from_slice(&data_size.to_le_bytes()[..3]);
		for clause in clauses {
			body.extend_from_slice(&clause.flags.to_le_bytes());
			body.extend_from_slice(&clause.try_offset.to_le_bytes());
			body.extend_from_slice(&clause.try_length.to_le_bytes());
			body.extend_from_slice(&clause.handler_offset.to_le_bytes());
			body.extend_from_slice(&clause.handler_length.to_le_bytes());
			body.extend_from_slice(&clause.class_token.to_le_bytes());
		}
	}
	body
}

/// A four-byte little-endian token operand.
pub fn tok(token: MetadataToken) -> [u8; 4] {
	token.raw().to_le_bytes()
}

/// `VALUETYPE <typedef-row>` signature element (rows under 32).
pub fn valuetype_el(row: usize) -> Vec<u8> {
	assert!(row < 32);
	vec![EL_VALUETYPE, (row << 2) as u8]
}

/// `CLASS <typedef-row>` signature element (rows under 32).
pub fn class_el(row: usize) -> Vec<u8> {
	assert!(row < 32);
	vec![EL_CLASS, (row << 2) as u8]
}

pub fn type_token(index: TypeDefOrRef) -> MetadataToken {
	index.token()
}
