//! End-to-end scenarios: synthesized assemblies run through the loader,
//! the JIT and the MIR reference interpreter.

mod common;

use halite::jit::Engine;
use halite::metadata::{Assembly, Context, Method};
use halite::raw::tables::{FieldAttributes, MethodAttributes, TypeAttributes};

use common::*;

fn find_main<'l>(assembly: &'l Assembly<'l>) -> &'l Method<'l> {
	assembly.types().iter()
		.find_map(|ty| ty.find_method("Main"))
		.expect("fixture has a Main method")
}

fn exception_name(exc: u64) -> String {
	assert_ne!(exc, 0, "expected an exception");
	let ty = unsafe {
		&*(halite::runtime::object::object_type_ptr(exc as usize) as *const halite::metadata::Type)
	};
	ty.name().to_string()
}

const STATIC_METHOD: MethodAttributes = MethodAttributes::PUBLIC
	.union(MethodAttributes::STATIC)
	.union(MethodAttributes::HIDE_BY_SIG);

#[test]
fn s1_add_two_constants() {
	let mut builder = AssemblyBuilder::new("S1");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));
	builder.add_method(
		"Main",
		STATIC_METHOD,
		&static_sig(&[EL_I4], &[]),
		// ldc.i4.2 ldc.i4.3 add ret
		Some(tiny_body(&[0x18, 0x19, 0x58, 0x2A])),
	);

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 5));
}

#[test]
fn s2_division_by_zero_raises() {
	let mut builder = AssemblyBuilder::new("S2");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));
	builder.add_method(
		"Main",
		STATIC_METHOD,
		&static_sig(&[EL_I4], &[]),
		// ldc.i4.1 ldc.i4.0 div ret
		Some(tiny_body(&[0x17, 0x16, 0x5B, 0x2A])),
	);

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let (exc, _) = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(exception_name(exc), "DivideByZeroException");
}

#[test]
fn s3_array_length_round_trips() {
	let mut builder = AssemblyBuilder::new("S3");
	let object = builder_object(&mut builder);
	let int32 = builder.corlib_type("System", "Int32");
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// ldc.i4.5 newarr Int32 ldlen ret
	let mut code = vec![0x1B, 0x8D];
	code.extend_from_slice(&tok(type_token(int32)));
	code.extend_from_slice(&[0x8E, 0x2A]);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 5));
}

#[test]
fn s4_field_load_through_null_raises() {
	let mut builder = AssemblyBuilder::new("S4");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Holder", TypeAttributes::PUBLIC, Some(object));
	let field = builder.add_field("f", FieldAttributes::PUBLIC, &field_sig(&[EL_I4]));
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// ldnull ldfld Holder::f ret
	let mut code = vec![0x14, 0x7B];
	code.extend_from_slice(&tok(field));
	code.push(0x2A);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let (exc, value) = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(exception_name(exc), "NullReferenceException");
	assert_eq!(value, 0);
}

#[test]
fn s5_unsigned_narrowing_of_minus_one() {
	let mut builder = AssemblyBuilder::new("S5");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));
	builder.add_method(
		"Main",
		STATIC_METHOD,
		&static_sig(&[EL_I4], &[]),
		// ldc.i4.m1 conv.u1 ret
		Some(tiny_body(&[0x15, 0xD2, 0x2A])),
	);

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 255));
}

#[test]
fn s6_catch_by_exact_type() {
	let mut builder = AssemblyBuilder::new("S6");
	let object = builder_object(&mut builder);
	let invalid_cast = builder.corlib_type("System", "InvalidCastException");
	let ctor = builder.member_ref(invalid_cast, ".ctor", &instance_sig(&[EL_VOID], &[]));
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// try { newobj InvalidCastException::.ctor; throw }
	// catch (InvalidCastException) { pop; ldc.i4.7; ret }
	let mut code = vec![0x73];
	code.extend_from_slice(&tok(ctor));
	code.push(0x7A);
	code.extend_from_slice(&[0x26, 0x1D, 0x2A]);

	let clause = EhClause {
		flags: 0,
		try_offset: 0,
		try_length: 6,
		handler_offset: 6,
		handler_length: 3,
		class_token: type_token(invalid_cast).raw(),
	};
	builder.add_method(
		"Main",
		STATIC_METHOD,
		&static_sig(&[EL_I4], &[]),
		Some(fat_body(8, 0, &code, &[clause])),
	);

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 7));
}

#[test]
fn loops_merge_stacks_across_backward_edges() {
	let mut builder = AssemblyBuilder::new("Loop");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// int i = 0, acc = 0; while (i < 5) { acc += i; i += 1; } return acc;
	let code = [
		0x16, 0x0A,             // ldc.i4.0; stloc.0
		0x16, 0x0B,             // ldc.i4.0; stloc.1
		0x2B, 0x08,             // br.s COND (14)
		0x07, 0x06, 0x58, 0x0B, // BODY: ldloc.1; ldloc.0; add; stloc.1
		0x06, 0x17, 0x58, 0x0A, // ldloc.0; ldc.i4.1; add; stloc.0
		0x06, 0x1B,             // COND: ldloc.0; ldc.i4.5
		0x32, 0xF4,             // blt.s BODY (6)
		0x07, 0x2A,             // ldloc.1; ret
	];
	let locals = builder.locals(&locals_sig(&[&[EL_I4], &[EL_I4]]));
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(fat_body(8, locals, &code, &[])));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 10));
}

#[test]
fn leave_runs_finally_before_its_target() {
	let mut builder = AssemblyBuilder::new("Finally");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	let code = [
		0x17, 0x0A,             // ldc.i4.1; stloc.0
		0x18, 0x0A,             // try: ldc.i4.2; stloc.0
		0xDE, 0x03,             // leave.s TARGET (9)
		0x1B, 0x0A,             // finally: ldc.i4.5; stloc.0
		0xDC,                   // endfinally
		0x06, 0x2A,             // TARGET: ldloc.0; ret
	];
	let clause = EhClause {
		flags: 2,
		try_offset: 2,
		try_length: 4,
		handler_offset: 6,
		handler_length: 3,
		class_token: 0,
	};
	let locals = builder.locals(&locals_sig(&[&[EL_I4]]));
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(fat_body(8, locals, &code, &[clause])));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 5));
}

#[test]
fn unwinding_runs_finally_before_the_catch() {
	let mut builder = AssemblyBuilder::new("Unwind");
	let object = builder_object(&mut builder);
	let invalid_cast = builder.corlib_type("System", "InvalidCastException");
	let ctor = builder.member_ref(invalid_cast, ".ctor", &instance_sig(&[EL_VOID], &[]));
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// try { try { throw new InvalidCastException(); } finally { local = 1; } }
	// catch (InvalidCastException) { return local; }
	let mut code = vec![0x73];
	code.extend_from_slice(&tok(ctor));       // 0: newobj
	code.push(0x7A);                          // 5: throw
	code.extend_from_slice(&[0x17, 0x0A]);    // 6: finally: ldc.i4.1; stloc.0
	code.push(0xDC);                          // 8: endfinally
	code.extend_from_slice(&[0x26, 0x06, 0x2A]); // 9: catch: pop; ldloc.0; ret

	let clauses = [
		EhClause { flags: 2, try_offset: 0, try_length: 6, handler_offset: 6, handler_length: 3, class_token: 0 },
		EhClause {
			flags: 0,
			try_offset: 0,
			try_length: 6,
			handler_offset: 9,
			handler_length: 3,
			class_token: type_token(invalid_cast).raw(),
		},
	];
	let locals = builder.locals(&locals_sig(&[&[EL_I4]]));
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(fat_body(8, locals, &code, &clauses)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 1));
}

#[test]
fn instance_fields_store_and_load() {
	let mut builder = AssemblyBuilder::new("Fields");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Holder", TypeAttributes::PUBLIC, Some(object));
	let field = builder.add_field("v", FieldAttributes::PUBLIC, &field_sig(&[EL_I4]));
	let ctor = builder.add_method(
		".ctor",
		MethodAttributes::PUBLIC
			| MethodAttributes::SPECIAL_NAME
			| MethodAttributes::RT_SPECIAL_NAME,
		&instance_sig(&[EL_VOID], &[]),
		Some(tiny_body(&[0x2A])),
	);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// newobj Holder::.ctor; dup; ldc.i4.s 42; stfld v; ldfld v; ret
	let mut code = vec![0x73];
	code.extend_from_slice(&tok(ctor));
	code.extend_from_slice(&[0x25, 0x1F, 42, 0x7D]);
	code.extend_from_slice(&tok(field));
	code.push(0x7B);
	code.extend_from_slice(&tok(field));
	code.push(0x2A);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 42));
}

#[test]
fn static_fields_live_in_linked_storage() {
	let mut builder = AssemblyBuilder::new("Statics");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Counters", TypeAttributes::PUBLIC, Some(object));
	let field = builder.add_field(
		"total",
		FieldAttributes::PUBLIC | FieldAttributes::STATIC,
		&field_sig(&[EL_I4]),
	);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// ldc.i4.5; stsfld total; ldsfld total; ret
	let mut code = vec![0x1B, 0x80];
	code.extend_from_slice(&tok(field));
	code.push(0x7E);
	code.extend_from_slice(&tok(field));
	code.push(0x2A);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 5));
}

#[test]
fn virtual_dispatch_uses_the_receivers_vtable() {
	let virt_new = MethodAttributes::PUBLIC
		| MethodAttributes::VIRTUAL
		| MethodAttributes::NEW_SLOT
		| MethodAttributes::HIDE_BY_SIG;
	let virt_override = MethodAttributes::PUBLIC
		| MethodAttributes::VIRTUAL
		| MethodAttributes::HIDE_BY_SIG;

	let mut builder = AssemblyBuilder::new("Virtual");
	let object = builder_object(&mut builder);
	let base = builder.add_type("Demo", "Base", TypeAttributes::PUBLIC, Some(object));
	let base_m = builder.add_method(
		"M",
		virt_new,
		&instance_sig(&[EL_I4], &[]),
		Some(tiny_body(&[0x17, 0x2A])),
	);
	builder.add_type(
		"Demo",
		"Derived",
		TypeAttributes::PUBLIC,
		Some(halite::raw::indices::coded_index::TypeDefOrRef::TypeDef(base)),
	);
	builder.add_method("M", virt_override, &instance_sig(&[EL_I4], &[]), Some(tiny_body(&[0x18, 0x2A])));
	let derived_ctor = builder.add_method(
		".ctor",
		MethodAttributes::PUBLIC
			| MethodAttributes::SPECIAL_NAME
			| MethodAttributes::RT_SPECIAL_NAME,
		&instance_sig(&[EL_VOID], &[]),
		Some(tiny_body(&[0x2A])),
	);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

	// newobj Derived::.ctor; callvirt Base::M; ret
	let mut code = vec![0x73];
	code.extend_from_slice(&tok(derived_ctor));
	code.push(0x6F);
	code.extend_from_slice(&tok(base_m));
	code.push(0x2A);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I4], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let result = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(result, (0, 2));
}

#[test]
fn string_literals_resolve_to_rooted_objects() {
	let mut builder = AssemblyBuilder::new("Strings");
	let object = builder_object(&mut builder);
	builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));
	let literal = builder.user_string("hello runtime");

	// ldstr "hello runtime"; conv.i; ret
	let mut code = vec![0x72];
	code.extend_from_slice(&tok(literal));
	code.extend_from_slice(&[0xD3, 0x2A]);
	builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I], &[]), Some(tiny_body(&code)));

	let mut ctx = Context::new();
	let assembly = ctx.load_assembly(builder.build()).unwrap();
	let mut engine = Engine::new();
	engine.compile_assembly(&ctx, assembly).unwrap();

	let (exc, pointer) = engine.run(find_main(assembly), &[]).unwrap();
	assert_eq!(exc, 0);
	assert_ne!(pointer, 0);
	// The slot holding the literal was registered as a GC root.
	assert!(!engine.heap().roots().is_empty());

	// The object is a System.String with the right length.
	let ty = unsafe {
		&*(halite::runtime::object::object_type_ptr(pointer as usize) as *const halite::metadata::Type)
	};
	assert_eq!(ty.name(), "String");
	let length = unsafe { std::ptr::read((pointer as usize + 8) as *const usize) };
	assert_eq!(length, "hello runtime".len());
}

#[test]
fn jit_output_is_deterministic() {
	fn build() -> halite::raw::tables::MetadataRecords {
		let mut builder = AssemblyBuilder::new("Deterministic");
		let object = builder_object(&mut builder);
		let int32 = builder.corlib_type("System", "Int32");
		builder.add_type("Demo", "Program", TypeAttributes::PUBLIC, Some(object));

		let mut code = vec![0x1B, 0x8D];
		code.extend_from_slice(&tok(type_token(int32)));
		code.extend_from_slice(&[0x8E, 0x2A]);
		builder.add_method("Main", STATIC_METHOD, &static_sig(&[EL_I], &[]), Some(tiny_body(&code)));
		builder.build()
	}

	let mut ctx_a = Context::new();
	let assembly_a = ctx_a.load_assembly(build()).unwrap();
	let mut engine_a = Engine::new();
	engine_a.compile_assembly(&ctx_a, assembly_a).unwrap();

	let mut ctx_b = Context::new();
	let assembly_b = ctx_b.load_assembly(build()).unwrap();
	let mut engine_b = Engine::new();
	engine_b.compile_assembly(&ctx_b, assembly_b).unwrap();

	assert_eq!(engine_a.module_texts(), engine_b.module_texts());
}

fn builder_object(builder: &mut AssemblyBuilder) -> halite::raw::indices::coded_index::TypeDefOrRef {
	builder.corlib_type("System", "Object")
}
