use std::cell::Cell;
use std::io::Cursor;

use bumpalo::Bump;
use derivative::Derivative;
use fxhash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

use crate::metadata::context::Context;
use crate::metadata::layout::{self, ExplicitLayout};
use crate::metadata::signatures::{self, SigResolver};
use crate::metadata::types::{
	Field, FillState, Method, Param, Type, TypeKind, TypePool,
};
use crate::metadata::vtable;
use crate::metadata::LoadError;
use crate::raw::heaps::{BlobHeap, BlobIndex, StringIndex, UserStringHeap};
use crate::raw::il::MethodBody;
use crate::raw::indices::coded_index::TypeDefOrRef;
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::indices::metadata_token::{FieldToken, MethodDefToken, TypeDefToken};
use crate::raw::tables::{
	AssemblyFlags, MetadataRecords, ResolutionScope, StandAloneSigRow, TypeAttributes,
};

#[derive(Clone, Eq, PartialEq, Hash, Derivative)]
#[derivative(Debug)]
pub struct AssemblyName<'l> {
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub name: &'l str,
	pub culture: &'l str,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Module<'l> {
	pub name: &'l str,
	pub mvid: Uuid,
}

/// A resolved member-ref row: either an imported method or an imported field.
#[derive(Debug, Copy, Clone)]
pub enum ImportedMember<'l> {
	Method(&'l Method<'l>),
	Field(&'l Field<'l>),
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Assembly<'l> {
	#[derivative(Debug = "ignore")]
	pool: &'l TypePool<'l>,
	name: AssemblyName<'l>,
	module: Module<'l>,
	#[derivative(Debug = "ignore")]
	types: &'l [&'l Type<'l>],
	#[derivative(Debug = "ignore")]
	imported_types: &'l [&'l Type<'l>],
	#[derivative(Debug = "ignore")]
	methods: &'l [&'l Method<'l>],
	#[derivative(Debug = "ignore")]
	fields: &'l [&'l Field<'l>],
	#[derivative(Debug = "ignore")]
	imported_members: Cell<&'l [ImportedMember<'l>]>,
	#[derivative(Debug = "ignore")]
	type_specs: &'l [BlobIndex],
	#[derivative(Debug = "ignore")]
	stand_alone_sigs: &'l [StandAloneSigRow],
	#[derivative(Debug = "ignore")]
	type_lookup: FxHashMap<(&'l str, &'l str), &'l Type<'l>>,
	blobs: BlobHeap,
	user_strings: UserStringHeap,
}

impl<'l> Assembly<'l> {
	#[inline]
	pub fn name(&self) -> &AssemblyName<'l> {
		&self.name
	}

	#[inline]
	pub fn module(&self) -> &Module<'l> {
		&self.module
	}

	#[inline]
	pub fn types(&self) -> &'l [&'l Type<'l>] {
		self.types
	}

	#[inline]
	pub fn imported_types(&self) -> &'l [&'l Type<'l>] {
		self.imported_types
	}

	#[inline]
	pub fn methods(&self) -> &'l [&'l Method<'l>] {
		self.methods
	}

	#[inline]
	pub fn fields(&self) -> &'l [&'l Field<'l>] {
		self.fields
	}

	#[inline]
	pub fn imported_members(&self) -> &'l [ImportedMember<'l>] {
		self.imported_members.get()
	}

	#[inline]
	pub(crate) fn pool(&self) -> &'l TypePool<'l> {
		self.pool
	}

	#[inline]
	pub fn blobs(&self) -> &BlobHeap {
		&self.blobs
	}

	pub fn find_type(&self, namespace: &str, name: &str) -> Option<&'l Type<'l>> {
		self.type_lookup.get(&(namespace, name)).copied()
	}

	/// Resolves a `ldstr`-style token against the user-string heap.
	pub fn user_string(&self, token: MetadataToken) -> Result<String, LoadError> {
		if token.kind() != MetadataTokenKind::String {
			return Err(LoadError::BadFormat("token does not reference the user-string heap"));
		}
		self.user_strings.get(token.index())
			.ok_or(LoadError::NotFound("user string"))
	}

	pub(crate) fn resolve_type_def_or_ref(
		&self,
		index: TypeDefOrRef,
	) -> Result<&'l Type<'l>, LoadError> {
		match index {
			TypeDefOrRef::TypeDef(row) => self.types.get(row.wrapping_sub(1)).copied()
				.ok_or(LoadError::NotFound("type-def row")),
			TypeDefOrRef::TypeRef(row) => self.imported_types.get(row.wrapping_sub(1)).copied()
				.ok_or(LoadError::NotFound("type-ref row")),
			TypeDefOrRef::TypeSpec(row) => {
				let blob = self.type_specs.get(row.wrapping_sub(1)).copied()
					.ok_or(LoadError::NotFound("type-spec row"))?;
				let bytes = self.blobs.get(blob).ok_or(LoadError::NotFound("type-spec blob"))?;
				signatures::read_type(&mut Cursor::new(bytes), &SigResolver::new(self))
			},
		}
	}

	pub fn resolve_type_token(&self, token: MetadataToken) -> Result<&'l Type<'l>, LoadError> {
		match token.kind() {
			MetadataTokenKind::TypeDef => self.resolve_type_def_or_ref(TypeDefOrRef::TypeDef(token.index())),
			MetadataTokenKind::TypeRef => self.resolve_type_def_or_ref(TypeDefOrRef::TypeRef(token.index())),
			MetadataTokenKind::TypeSpec => self.resolve_type_def_or_ref(TypeDefOrRef::TypeSpec(token.index())),
			_ => Err(LoadError::BadFormat("token does not reference a type")),
		}
	}

	pub fn resolve_method_token(&self, token: MetadataToken) -> Result<&'l Method<'l>, LoadError> {
		match token.kind() {
			MetadataTokenKind::MethodDef => self.methods.get(token.index().wrapping_sub(1)).copied()
				.ok_or(LoadError::NotFound("method-def row")),
			MetadataTokenKind::MemberRef => {
				match self.imported_members.get().get(token.index().wrapping_sub(1)) {
					Some(ImportedMember::Method(method)) => Ok(method),
					Some(ImportedMember::Field(_)) => Err(LoadError::BadFormat("member ref resolves to a field")),
					None => Err(LoadError::NotFound("member-ref row")),
				}
			},
			_ => Err(LoadError::BadFormat("token does not reference a method")),
		}
	}

	pub fn resolve_field_token(&self, token: MetadataToken) -> Result<&'l Field<'l>, LoadError> {
		match token.kind() {
			MetadataTokenKind::Field => self.fields.get(token.index().wrapping_sub(1)).copied()
				.ok_or(LoadError::NotFound("field row")),
			MetadataTokenKind::MemberRef => {
				match self.imported_members.get().get(token.index().wrapping_sub(1)) {
					Some(ImportedMember::Field(field)) => Ok(field),
					Some(ImportedMember::Method(_)) => Err(LoadError::BadFormat("member ref resolves to a method")),
					None => Err(LoadError::NotFound("member-ref row")),
				}
			},
			_ => Err(LoadError::BadFormat("token does not reference a field")),
		}
	}

	/// Parses a method's body, including its exception-handling sections.
	pub fn method_body(&'l self, method: &Method<'l>) -> Result<MethodBody<'l>, LoadError> {
		let bytes = method.body_bytes()
			.ok_or(LoadError::NotFound("method has no body"))?;
		Ok(MethodBody::read(&mut Cursor::new(bytes), &self.blobs, self.stand_alone_sigs)?)
	}

	/// Decodes a method's local-variable types.
	pub fn method_locals(&self, body: &MethodBody<'_>) -> Result<Vec<&'l Type<'l>>, LoadError> {
		match body.locals_sig {
			Some(blob) => signatures::read_locals_signature(&mut Cursor::new(blob), &SigResolver::new(self)),
			None => Ok(vec![]),
		}
	}

	/// Builds an assembly that has no backing metadata records; used for the
	/// synthesized core library.
	pub(crate) fn synthetic(
		bump: &'l Bump,
		pool: &'l TypePool<'l>,
		name: AssemblyName<'l>,
		module: Module<'l>,
		types: &[&'l Type<'l>],
		methods: &[&'l Method<'l>],
	) -> &'l Assembly<'l> {
		let mut type_lookup = FxHashMap::default();
		for ty in types {
			type_lookup.insert((ty.namespace(), ty.name()), *ty);
		}

		let assembly = &*bump.alloc(Assembly {
			pool,
			name,
			module,
			types: bump.alloc_slice_copy(types),
			imported_types: &[],
			methods: bump.alloc_slice_copy(methods),
			fields: &[],
			imported_members: Cell::new(&[]),
			type_specs: &[],
			stand_alone_sigs: &[],
			type_lookup,
			blobs: crate::raw::heaps::BlobHeapBuilder::new().build(),
			user_strings: crate::raw::heaps::UserStringHeapBuilder::new().build(),
		});
		for ty in assembly.types {
			ty.assembly.set(Some(assembly));
		}
		assembly
	}

	#[tracing::instrument(skip_all)]
	pub(crate) fn load(
		ctx: &mut Context<'l>,
		records: MetadataRecords,
	) -> Result<&'l Assembly<'l>, LoadError> {
		let bump = ctx.bump();
		let pool = ctx.pool();

		let intern = |index: StringIndex| -> Result<&'l str, LoadError> {
			Ok(bump.alloc_str(heap_str(&records, index)?))
		};

		// Setup pass: create every entity with names and flags, defer types.
		let mut types = Vec::with_capacity(records.type_defs.len());
		for (index, row) in records.type_defs.iter().enumerate() {
			let kind = match row.flags.contains(TypeAttributes::INTERFACE) {
				true => TypeKind::Interface,
				false => TypeKind::Class,
			};
			let ty = &*bump.alloc(Type::new(intern(row.name)?, intern(row.namespace)?, kind));
			ty.token.set(TypeDefToken(index + 1).into());
			ty.flags.set(row.flags);
			types.push(ty);
		}

		let mut fields = Vec::with_capacity(records.fields.len());
		for (index, row) in records.fields.iter().enumerate() {
			fields.push(&*bump.alloc(Field {
				token: FieldToken(index + 1).into(),
				name: intern(row.name)?,
				flags: row.flags,
				signature: row.signature,
				declaring_type: Cell::new(None),
				ty: Cell::new(None),
				offset: Cell::new(0),
			}));
		}

		let mut methods = Vec::with_capacity(records.methods.len());
		for (index, row) in records.methods.iter().enumerate() {
			let body_bytes = match &row.body {
				Some(body) => Some(&*bump.alloc_slice_copy(body)),
				None => None,
			};
			methods.push(&*bump.alloc(Method {
				token: MethodDefToken(index + 1).into(),
				name: intern(row.name)?,
				flags: row.flags,
				impl_flags: row.impl_flags,
				signature: row.signature,
				declaring_type: Cell::new(None),
				return_type: Cell::new(None),
				params: Cell::new(&[]),
				body_bytes: Cell::new(body_bytes),
				vtable_offset: Cell::new(None),
				jit_function: Cell::new(None),
			}));
		}

		// Param rows are owned by ranges in method-row order.
		for (index, row) in records.methods.iter().enumerate() {
			let start = row.param_list.max(1) - 1;
			let end = match records.methods.get(index + 1) {
				Some(next) => next.param_list.max(1) - 1,
				None => records.params.len(),
			};
			let mut params = vec![];
			for param_row in records.params.get(start..end.min(records.params.len())).unwrap_or(&[]) {
				if param_row.sequence == 0 {
					continue;
				}
				params.push(&*bump.alloc(Param {
					name: intern(param_row.name)?,
					flags: param_row.flags,
					sequence: param_row.sequence,
					ty: Cell::new(None),
				}));
			}
			methods[index].params.set(bump.alloc_slice_copy(&params));
		}

		// Field and method lists are owned by ranges in type-row order.
		for (index, row) in records.type_defs.iter().enumerate() {
			let fields_start = row.field_list.max(1) - 1;
			let fields_end = match records.type_defs.get(index + 1) {
				Some(next) => next.field_list.max(1) - 1,
				None => fields.len(),
			};
			let owned = fields.get(fields_start..fields_end.min(fields.len()))
				.ok_or(LoadError::BadFormat("field list rows out of order"))?;
			for field in owned {
				field.declaring_type.set(Some(types[index]));
			}
			types[index].fields.set(bump.alloc_slice_copy(owned));

			let methods_start = row.method_list.max(1) - 1;
			let methods_end = match records.type_defs.get(index + 1) {
				Some(next) => next.method_list.max(1) - 1,
				None => methods.len(),
			};
			let owned = methods.get(methods_start..methods_end.min(methods.len()))
				.ok_or(LoadError::BadFormat("method list rows out of order"))?;
			for method in owned {
				method.declaring_type.set(Some(types[index]));
			}
			types[index].methods.set(bump.alloc_slice_copy(owned));
		}

		for row in &records.nested_classes {
			let nested = types.get(row.nested.wrapping_sub(1))
				.ok_or(LoadError::NotFound("nested type row"))?;
			let enclosing = types.get(row.enclosing.wrapping_sub(1))
				.ok_or(LoadError::NotFound("enclosing type row"))?;
			nested.declaring_type.set(Some(enclosing));
		}

		for row in &records.generic_params {
			let owner = types.get(row.owner.wrapping_sub(1))
				.ok_or(LoadError::NotFound("generic param owner"))?;
			owner.generic_param_count.set(owner.generic_param_count.get() + 1);
		}

		// Imported types resolve against already-loaded assemblies.
		let mut imported_types = Vec::with_capacity(records.type_refs.len());
		for row in &records.type_refs {
			let name = heap_str(&records, row.name)?;
			let namespace = heap_str(&records, row.namespace)?;
			let resolved = match row.resolution_scope {
				ResolutionScope::CurrentModule => types.iter()
					.find(|ty| ty.namespace() == namespace && ty.name() == name)
					.copied(),
				ResolutionScope::AssemblyRef(index) => {
					let assembly_ref = records.assembly_refs.get(index.wrapping_sub(1))
						.ok_or(LoadError::NotFound("assembly-ref row"))?;
					let assembly_name = heap_str(&records, assembly_ref.name)?;
					let assembly = ctx.find_assembly(assembly_name)
						.ok_or(LoadError::NotFound("referenced assembly"))?;
					assembly.find_type(namespace, name)
				},
			};
			imported_types.push(resolved.ok_or(LoadError::NotFound("referenced type"))?);
		}

		// Parent links; type-spec parents wait for signature decoding.
		let mut spec_parents = FxHashMap::default();
		for (index, row) in records.type_defs.iter().enumerate() {
			match row.extends {
				None => {},
				Some(TypeDefOrRef::TypeDef(row)) => {
					let parent = types.get(row.wrapping_sub(1))
						.ok_or(LoadError::NotFound("extends row"))?;
					types[index].parent.set(Some(parent));
				},
				Some(TypeDefOrRef::TypeRef(row)) => {
					let parent = imported_types.get(row.wrapping_sub(1)).copied()
						.ok_or(LoadError::NotFound("extends row"))?;
					types[index].parent.set(Some(parent));
				},
				Some(TypeDefOrRef::TypeSpec(row)) => {
					spec_parents.insert(index, row);
				},
			}
		}

		// A type is a value type when it derives from System.ValueType or
		// System.Enum, excluding those two themselves.
		for ty in &types {
			if ty.kind() != TypeKind::Class {
				continue;
			}
			let Some(parent) = ty.parent() else { continue };
			let derives_value = std::ptr::eq(parent, pool.value_type_base())
				&& !(ty.namespace() == "System" && ty.name() == "Enum");
			let derives_enum = parent.namespace() == "System" && parent.name() == "Enum";
			if derives_value || derives_enum {
				ty.kind.set(TypeKind::ValueType);
			}
		}

		let mut type_lookup = FxHashMap::default();
		for ty in &types {
			type_lookup.insert((ty.namespace(), ty.name()), *ty);
		}

		let type_specs: Vec<BlobIndex> = records.type_specs.iter().map(|r| r.signature).collect();

		let assembly = &*bump.alloc(Assembly {
			pool,
			name: AssemblyName {
				major_version: records.assembly.major_version,
				minor_version: records.assembly.minor_version,
				build_number: records.assembly.build_number,
				revision_number: records.assembly.revision_number,
				flags: records.assembly.flags,
				name: intern(records.assembly.name)?,
				culture: intern(records.assembly.culture)?,
			},
			module: Module {
				name: intern(records.module.name)?,
				mvid: records.module.mvid,
			},
			types: bump.alloc_slice_copy(&types),
			imported_types: bump.alloc_slice_copy(&imported_types),
			methods: bump.alloc_slice_copy(&methods),
			fields: bump.alloc_slice_copy(&fields),
			imported_members: Cell::new(&[]),
			type_specs: bump.alloc_slice_copy(&type_specs),
			stand_alone_sigs: bump.alloc_slice_clone(&records.stand_alone_sigs),
			type_lookup,
			blobs: records.blobs.clone(),
			user_strings: records.user_strings.clone(),
		});
		for ty in assembly.types {
			ty.assembly.set(Some(assembly));
		}
		ctx.register_assembly(assembly);
		debug!(name = assembly.name.name, types = assembly.types.len(), "assembly set up");

		// Fill pass.
		let mut filler = Filler {
			bump,
			assembly,
			records: &records,
			spec_parents,
			index_of: assembly.types.iter().enumerate()
				.map(|(index, ty)| (*ty as *const _, index))
				.collect(),
		};
		for index in 0..assembly.types.len() {
			filler.fill(index)?;
		}

		// Member refs resolve once every local type is filled.
		let mut imported_members = Vec::with_capacity(records.member_refs.len());
		for row in &records.member_refs {
			let parent = assembly.resolve_type_def_or_ref(row.parent)?;
			let name = heap_str(&records, row.name)?;
			let blob = assembly.blobs.get(row.signature)
				.ok_or(LoadError::NotFound("member-ref signature"))?;
			imported_members.push(resolve_member_ref(assembly, parent, name, blob)?);
		}
		assembly.imported_members.set(bump.alloc_slice_copy(&imported_members));

		debug!(name = assembly.name.name, "assembly filled");
		Ok(assembly)
	}
}

struct Filler<'a, 'l> {
	bump: &'l Bump,
	assembly: &'l Assembly<'l>,
	records: &'a MetadataRecords,
	spec_parents: FxHashMap<usize, usize>,
	index_of: FxHashMap<*const Type<'l>, usize>,
}

impl<'a, 'l> Filler<'a, 'l> {
	fn fill(&mut self, index: usize) -> Result<(), LoadError> {
		let ty = self.assembly.types[index];
		match ty.fill_state.get() {
			FillState::Filled => return Ok(()),
			// Cycles through reference edges are legal; value-type layout
			// cycles surface when the layout pass hits a Filling field type.
			FillState::Filling => return Ok(()),
			FillState::Unfilled => {},
		}
		ty.fill_state.set(FillState::Filling);

		if let Some(spec_row) = self.spec_parents.get(&index).copied() {
			let parent = self.assembly.resolve_type_def_or_ref(TypeDefOrRef::TypeSpec(spec_row))?;
			ty.parent.set(Some(parent));
		}

		if let Some(parent) = ty.parent() {
			self.fill_dependency(parent)?;
		}

		let resolver = SigResolver::new(self.assembly);

		for field in ty.fields() {
			let blob = self.assembly.blobs.get(field.signature)
				.ok_or(LoadError::NotFound("field signature"))?;
			let field_ty = signatures::read_field_signature(&mut Cursor::new(blob), &resolver)?;
			field.ty.set(Some(field_ty));
			if field_ty.kind() == TypeKind::ValueType && !field_ty.is_filled() {
				self.fill_dependency(field_ty)?;
			}
		}

		for method in ty.methods() {
			let blob = self.assembly.blobs.get(method.signature)
				.ok_or(LoadError::NotFound("method signature"))?;
			let sig = signatures::read_method_signature(&mut Cursor::new(blob), &resolver)?;
			method.return_type.set(Some(sig.return_type));

			// Param rows are optional; synthesize the missing ones.
			let named: FxHashMap<u16, &'l Param<'l>> = method.params.get().iter()
				.map(|p| (p.sequence, *p))
				.collect();
			let mut params = Vec::with_capacity(sig.param_types.len());
			for (position, param_ty) in sig.param_types.iter().enumerate() {
				let sequence = position as u16 + 1;
				let param = match named.get(&sequence) {
					Some(param) => *param,
					None => &*self.bump.alloc(Param {
						name: "",
						flags: Default::default(),
						sequence,
						ty: Cell::new(None),
					}),
				};
				param.ty.set(Some(param_ty));
				params.push(param);
			}
			method.params.set(self.bump.alloc_slice_copy(&params));
		}

		// Interfaces must be filled before their slot runs are copied.
		let mut implemented = vec![];
		for row in &self.records.interface_impls {
			if row.class != index + 1 {
				continue;
			}
			let interface = self.assembly.resolve_type_def_or_ref(row.interface)?;
			self.fill_dependency(interface)?;
			implemented.push(interface);
		}

		vtable::build_vtable(self.bump, ty, &implemented)?;

		if ty.is_generic_definition() {
			// Open generic definitions carry no layout; instantiations do.
			ty.fill_state.set(FillState::Filled);
			return Ok(());
		}

		let explicit = self.explicit_layout(index);
		layout::compute_type_layout(self.bump, ty, explicit.as_ref().map(|(packing, class_size, offsets)| {
			ExplicitLayout { packing: *packing, class_size: *class_size, offsets: offsets.as_slice() }
		}))?;

		ty.fill_state.set(FillState::Filled);
		Ok(())
	}

	/// Fills a dependency if it is defined in this assembly; imports were
	/// filled by their own assembly's load.
	fn fill_dependency(&mut self, ty: &'l Type<'l>) -> Result<(), LoadError> {
		match self.index_of.get(&(ty as *const _)).copied() {
			Some(index) => self.fill(index),
			None => Ok(()),
		}
	}

	fn explicit_layout(&self, index: usize) -> Option<(u16, u32, Vec<Option<u32>>)> {
		let row = self.records.class_layouts.iter().find(|row| row.parent == index + 1)?;
		let ty = self.assembly.types[index];

		let mut offsets = vec![];
		if ty.flags().contains(TypeAttributes::EXPLICIT_LAYOUT) {
			offsets = ty.fields().iter()
				.map(|field| {
					let field_row = field.token().index();
					self.records.field_layouts.iter()
						.find(|layout| layout.field == field_row)
						.map(|layout| layout.offset)
				})
				.collect();
		}

		Some((row.packing_size, row.class_size, offsets))
	}
}

/// Member refs are matched by name plus signature, methods against the
/// target type and its ancestors.
fn resolve_member_ref<'l>(
	assembly: &Assembly<'l>,
	parent: &'l Type<'l>,
	name: &str,
	blob: &[u8],
) -> Result<ImportedMember<'l>, LoadError> {
	let resolver = SigResolver::new(assembly);
	let mut stream = Cursor::new(blob);

	if blob.first() == Some(&0x06) {
		let field_ty = signatures::read_field_signature(&mut stream, &resolver)?;
		let mut current = Some(parent);
		while let Some(ty) = current {
			if let Some(field) = ty.fields().iter().find(|f| f.name() == name) {
				if field.field_type() == Some(field_ty) {
					return Ok(ImportedMember::Field(field));
				}
			}
			current = ty.parent();
		}
		return Err(LoadError::NotFound("imported field"));
	}

	let sig = signatures::read_method_signature(&mut stream, &resolver)?;
	let mut current = Some(parent);
	while let Some(ty) = current {
		let found = ty.methods().iter().find(|method| {
			method.name() == name
				&& method.return_type() == Some(sig.return_type)
				&& method.params().len() == sig.param_types.len()
				&& method.params().iter().zip(&sig.param_types)
					.all(|(param, expected)| param.param_type() == Some(*expected))
		});
		if let Some(method) = found {
			return Ok(ImportedMember::Method(method));
		}
		current = ty.parent();
	}
	Err(LoadError::NotFound("imported method"))
}

fn heap_str(records: &MetadataRecords, index: StringIndex) -> Result<&str, LoadError> {
	records.strings.get(index).ok_or(LoadError::NotFound("string heap entry"))
}
