//! Loader integration: two-phase materialization, layout, vtables,
//! interface dispatch and member-ref resolution over synthesized records.

mod common;

use halite::jit::Engine;
use halite::metadata::{Context, StackType, TypeKind};
use halite::raw::indices::coded_index::TypeDefOrRef;
use halite::raw::tables::{FieldAttributes, MethodAttributes, TypeAttributes};
use halite::verifier;

use common::*;

const STATIC_METHOD: MethodAttributes = MethodAttributes::PUBLIC
	.union(MethodAttributes::STATIC)
	.union(MethodAttributes::HIDE_BY_SIG);

#[test]
fn two_phase_load_materializes_layouts() {
	let mut builder = AssemblyBuilder::new("Layouts");
	let object = builder.corlib_type("System", "Object");
	let value_type = builder.corlib_type("System", "ValueType");

	let point_row = builder.add_type(
		"Demo",
		"Point",
		TypeAttributes::PUBLIC | TypeAttributes::SEALED,
		Some(value_type),
	);
	builder.add_field("x", FieldAttributes::PUBLIC, &field_sig(&[EL_I4]));
	builder.add_field("y", FieldAttributes::PUBLIC, &field_sig(&[EL_I4]));

	builder.add_type("Demo", "Holder", TypeAttributes::PUBLIC, Some(object));
	builder.add_field("p", FieldAttributes::PUBLIC, &field_sig(&valuetype_el(point_row)));
	builder.add_field("o", FieldAttributes::PUBLIC, &field_sig(&[EL_OBJECT]));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();

	let point = assembly.find_type("Demo", "Point").unwrap();
	assert!(point.is_filled());
	assert_eq!(point.kind(), TypeKind::ValueType);
	let layout = point.layout().unwrap();
	assert_eq!(layout.stack_type, StackType::ValueType);
	assert_eq!(layout.managed_size, 8);
	assert_eq!(layout.managed_align, 4);
	let fields = point.fields();
	assert_eq!(fields[0].offset(), 0);
	assert_eq!(fields[1].offset(), 4);

	let holder = assembly.find_type("Demo", "Holder").unwrap();
	assert_eq!(holder.kind(), TypeKind::Class);
	assert_eq!(holder.layout().unwrap().stack_type, StackType::Object);
	let fields = holder.fields();
	// Header, then the embedded struct, then the reference.
	assert_eq!(fields[0].offset(), 8);
	assert_eq!(fields[1].offset(), 16);
	assert_eq!(holder.managed_pointer_offsets(), &[16]);
	assert!(std::ptr::eq(fields[0].field_type().unwrap(), point));
}

#[test]
fn interface_runs_get_vtable_offsets_and_dispatch() {
	let mut builder = AssemblyBuilder::new("Ifaces");
	let object = builder.corlib_type("System", "Object");

	let iface_row = builder.add_type(
		"Demo",
		"IValue",
		TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
		None,
	);
	let iface_m = builder.add_method(
		"Get",
		MethodAttributes::PUBLIC
			| MethodAttributes::VIRTUAL
			| MethodAttributes::ABSTRACT
			| MethodAttributes::NEW_SLOT
			| MethodAttributes::HIDE_BY_SIG,
		&instance_sig(&[EL_I4], &[]),
		None,
	);

	let impl_row = builder.add_type("Demo", "Impl", TypeAttributes::PUBLIC, Some(object));
	builder.add_method(
		"Get",
		MethodAttributes::PUBLIC
			| MethodAttributes::VIRTUAL
			| MethodAttributes::NEW_SLOT
			| MethodAttributes::HIDE_BY_SIG,
		&instance_sig(&[EL_I4], &[]),
		Some(tiny_body(&[0x17, 0x2A])),
	);
	let ctor = builder.add_method(
		".ctor",
		MethodAttributes::PUBLIC
			| MethodAttributes::SPECIAL_NAME
			| MethodAttributes::RT_SPECIAL_NAME,
		&instance_sig(&[EL_VOID], &[]),
		Some(tiny_body(&[0x2A])),
	);
	builder.add_interface_impl(impl_row, TypeDefOrRef::TypeDef(iface_row));

	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));
	// newobj Impl::.ctor; callvirt IValue::Get; ret
	let mut code = vec![0x73];
	code.extend_from_slice(&tok(ctor));
	code.push(0x6F);
	code.extend_from_slice(&tok(iface_m));
	code.push(0x2A);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();

	let iface = assembly.find_type("Demo", "IValue").unwrap();
	assert!(iface.is_interface());
	assert_eq!(iface.virtual_methods().len(), 1);
	assert_eq!(iface.virtual_methods()[0].vtable_offset(), Some(0));

	let implementer = assembly.find_type("Demo", "Impl").unwrap();
	let impls = implementer.interfaces();
	assert_eq!(impls.len(), 1);
	assert!(std::ptr::eq(impls[0].interface, iface));

	// The slot run holds the implementing method at the recorded offset.
	let own_get = implementer.find_method("Get").unwrap();
	let slot = impls[0].vtable_offset + iface.virtual_methods()[0].vtable_offset().unwrap();
	assert!(std::ptr::eq(implementer.virtual_methods()[slot], own_get));

	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();
	let main = assembly.find_type("Demo", "Program").unwrap().find_method("Main").unwrap();
	assert_eq!(engine.run(main, &[]).unwrap(), (0, 1));
}

#[test]
fn member_refs_match_name_and_signature() {
	let mut builder = AssemblyBuilder::new("Refs");
	let object = builder.corlib_type("System", "Object");
	let exception = builder.corlib_type("System", "Exception");
	builder.member_ref(exception, ".ctor", &instance_sig(&[EL_VOID], &[]));
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	assert_eq!(assembly.imported_members().len(), 1);

	// A dangling name fails the load outright.
	let mut builder = AssemblyBuilder::new("BadRefs");
	let object = builder.corlib_type("System", "Object");
	let exception = builder.corlib_type("System", "Exception");
	builder.member_ref(exception, "NoSuchMethod", &instance_sig(&[EL_VOID], &[]));
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	let mut ctx = Context::new();
	assert!(ctx.load_assembly(builder.build()).is_err());
}

#[test]
fn loaded_hierarchies_participate_in_assignability() {
	let mut builder = AssemblyBuilder::new("Chains");
	let object = builder.corlib_type("System", "Object");
	let base_row = builder.add_type("Demo", "Base", TypeAttributes::PUBLIC, Some(object));
	builder.add_type("Demo", "Derived", TypeAttributes::PUBLIC, Some(TypeDefOrRef::TypeDef(base_row)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let pool = ctx.pool();

	let base = assembly.find_type("Demo", "Base").unwrap();
	let derived = assembly.find_type("Demo", "Derived").unwrap();

	assert!(verifier::verifier_assignable_to(pool, derived, base));
	assert!(verifier::verifier_assignable_to(pool, derived, pool.object_base()));
	assert!(!verifier::verifier_assignable_to(pool, base, derived));

	// Covariant arrays over the same chain.
	assert!(verifier::compatible_with(pool, pool.get_array(derived), pool.get_array(base)));
}
