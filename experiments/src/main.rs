use std::sync::Arc;
use std::time::SystemTime;

use owning_ref::ArcRef;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use halite::jit::{Engine, JitOptions};
use halite::metadata::Context;
use halite::raw::heaps::{BlobHeapBuilder, StringHeapBuilder, UserStringHeapBuilder};
use halite::raw::tables::*;

/// Hand-rolled records for a tiny demo assembly:
/// `static int Main() { int acc = 0; for (int i = 0; i < 100; i++) acc += i; return acc; }`
fn demo_records() -> MetadataRecords {
	let mut strings = StringHeapBuilder::new();
	let mut blobs = BlobHeapBuilder::new();

	let code = [
		0x16, 0x0A,             // ldc.i4.0; stloc.0
		0x16, 0x0B,             // ldc.i4.0; stloc.1
		0x2B, 0x08,             // br.s COND
		0x06, 0x07, 0x58, 0x0A, // BODY: ldloc.0; ldloc.1; add; stloc.0
		0x07, 0x17, 0x58, 0x0B, // ldloc.1; ldc.i4.1; add; stloc.1
		0x07, 0x1F, 0x64,       // COND: ldloc.1; ldc.i4.s 100
		0x32, 0xF3,             // blt.s BODY
		0x06, 0x2A,             // ldloc.0; ret
	];

	// Fat body: fat format + init locals, max-stack 8, locals token 0x11000001.
	let mut body = vec![];
	body.extend_from_slice(&0x3013u16.to_le_bytes());
	body.extend_from_slice(&8u16.to_le_bytes());
	body.extend_from_slice(&(code.len() as u32).to_le_bytes());
	body.extend_from_slice(&0x1100_0001u32.to_le_bytes());
	body.extend_from_slice(&code);

	MetadataRecords {
		module: ModuleRow { name: strings.intern("demo.dll"), mvid: Uuid::nil() },
		assembly: AssemblyRow {
			major_version: 1,
			minor_version: 0,
			build_number: 0,
			revision_number: 0,
			flags: AssemblyFlags::default(),
			name: strings.intern("demo"),
			culture: Default::default(),
		},
		assembly_refs: vec![AssemblyRefRow {
			major_version: 8,
			minor_version: 0,
			build_number: 0,
			revision_number: 0,
			flags: AssemblyFlags::default(),
			name: strings.intern("System.Private.CoreLib"),
			culture: Default::default(),
		}],
		type_defs: vec![TypeDefRow {
			flags: TypeAttributes::PUBLIC,
			name: strings.intern("Program"),
			namespace: strings.intern("Demo"),
			extends: Some(halite::raw::indices::coded_index::TypeDefOrRef::TypeRef(1)),
			field_list: 1,
			method_list: 1,
		}],
		type_refs: vec![TypeRefRow {
			resolution_scope: ResolutionScope::AssemblyRef(1),
			name: strings.intern("Object"),
			namespace: strings.intern("System"),
		}],
		fields: vec![],
		methods: vec![MethodDefRow {
			body: Some(ArcRef::new(Arc::from(body))),
			impl_flags: MethodImplAttributes::IL,
			flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
			name: strings.intern("Main"),
			// default convention, no params, returns int32
			signature: blobs.intern(&[0x00, 0x00, 0x08]),
			param_list: 1,
		}],
		params: vec![],
		interface_impls: vec![],
		member_refs: vec![],
		class_layouts: vec![],
		field_layouts: vec![],
		// LOCAL_SIG, two int32 locals
		stand_alone_sigs: vec![StandAloneSigRow { signature: blobs.intern(&[0x07, 0x02, 0x08, 0x08]) }],
		type_specs: vec![],
		generic_params: vec![],
		nested_classes: vec![],
		strings: strings.build(),
		blobs: blobs.build(),
		user_strings: UserStringHeapBuilder::new().build(),
	}
}

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.init();

	let mut start = SystemTime::now();
	let mut ctx = Context::new();
	println!("Context creation time: {:?}", start.elapsed().unwrap());

	start = SystemTime::now();
	let assembly = ctx.load_assembly(demo_records()).unwrap();
	println! {
		"Load time: {:?}, types: {}, methods: {}",
		start.elapsed().unwrap(),
		assembly.types().len(),
		assembly.methods().len(),
	}

	start = SystemTime::now();
	let mut engine = Engine::with_options(JitOptions { dump_mir: true });
	engine.compile_assembly(&ctx, assembly).unwrap();
	println!("JIT time: {:?}", start.elapsed().unwrap());

	let main = assembly.types()[0].find_method("Main").unwrap();
	start = SystemTime::now();
	let (exception, value) = engine.run(main, &[]).unwrap();
	println! {
		"Run time: {:?}, result: ({exception}, {value})",
		start.elapsed().unwrap(),
	}
}
