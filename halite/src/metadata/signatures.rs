//! Signature blob decoding and encoding.
//!
//! The decoder consumes an immutable blob plus a resolution context (the
//! current assembly and the generic arguments in scope) and produces
//! materialized type references. It never mutates metadata.

use std::io::Cursor;

use bitflags::bitflags;

use crate::metadata::assembly::Assembly;
use crate::metadata::types::{Primitive, Type, TypeKind};
use crate::metadata::LoadError;
use crate::raw::indices::coded_index::TypeDefOrRef;
use crate::utilities::{read_compressed_u32, write_compressed_u32, FromByteStream};

// Signature element tags (ECMA-335 II.23.1.16).
const ELEMENT_VOID: u8 = 0x01;
const ELEMENT_BOOLEAN: u8 = 0x02;
const ELEMENT_CHAR: u8 = 0x03;
const ELEMENT_I1: u8 = 0x04;
const ELEMENT_U1: u8 = 0x05;
const ELEMENT_I2: u8 = 0x06;
const ELEMENT_U2: u8 = 0x07;
const ELEMENT_I4: u8 = 0x08;
const ELEMENT_U4: u8 = 0x09;
const ELEMENT_I8: u8 = 0x0A;
const ELEMENT_U8: u8 = 0x0B;
const ELEMENT_R4: u8 = 0x0C;
const ELEMENT_R8: u8 = 0x0D;
const ELEMENT_STRING: u8 = 0x0E;
const ELEMENT_PTR: u8 = 0x0F;
const ELEMENT_BYREF: u8 = 0x10;
const ELEMENT_VALUETYPE: u8 = 0x11;
const ELEMENT_CLASS: u8 = 0x12;
const ELEMENT_VAR: u8 = 0x13;
const ELEMENT_ARRAY: u8 = 0x14;
const ELEMENT_GENERICINST: u8 = 0x15;
const ELEMENT_TYPEDBYREF: u8 = 0x16;
const ELEMENT_I: u8 = 0x18;
const ELEMENT_U: u8 = 0x19;
const ELEMENT_FNPTR: u8 = 0x1B;
const ELEMENT_OBJECT: u8 = 0x1C;
const ELEMENT_SZARRAY: u8 = 0x1D;
const ELEMENT_MVAR: u8 = 0x1E;
const ELEMENT_CMOD_REQD: u8 = 0x1F;
const ELEMENT_CMOD_OPT: u8 = 0x20;
const ELEMENT_PINNED: u8 = 0x45;

const SIG_FIELD: u8 = 0x06;
const SIG_LOCALS: u8 = 0x07;

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct CallingConvention: u8 {
		const DEFAULT = 0x0;
		const C = 0x1;
		const STD_CALL = 0x2;
		const THIS_CALL = 0x3;
		const FAST_CALL = 0x4;
		const VAR_ARG = 0x5;
		const UNMANAGED = 0x9;
		const GENERIC = 0x10;
		const HAS_THIS = 0x20;
		const EXPLICIT_THIS = 0x40;
	}
}

/// Generic arguments in scope while decoding. Missing scopes resolve
/// `VAR`/`MVAR` to placeholder parameter types.
#[derive(Copy, Clone)]
pub(crate) struct SigResolver<'a, 'l> {
	pub assembly: &'a Assembly<'l>,
	pub type_args: &'a [&'l Type<'l>],
	pub method_args: &'a [&'l Type<'l>],
}

impl<'a, 'l> SigResolver<'a, 'l> {
	pub fn new(assembly: &'a Assembly<'l>) -> Self {
		Self { assembly, type_args: &[], method_args: &[] }
	}

	pub fn with_type_args(assembly: &'a Assembly<'l>, type_args: &'a [&'l Type<'l>]) -> Self {
		Self { assembly, type_args, method_args: &[] }
	}

	fn type_var(&self, index: u32) -> &'l Type<'l> {
		match self.type_args.get(index as usize) {
			Some(ty) => ty,
			None => self.assembly.pool().get_generic_type_param(index),
		}
	}

	fn method_var(&self, index: u32) -> &'l Type<'l> {
		match self.method_args.get(index as usize) {
			Some(ty) => ty,
			None => self.assembly.pool().get_generic_method_param(index),
		}
	}
}

#[derive(Debug)]
pub struct MethodSig<'l> {
	pub calling_convention: CallingConvention,
	pub generic_param_count: u32,
	pub return_type: &'l Type<'l>,
	pub param_types: Vec<&'l Type<'l>>,
}

impl MethodSig<'_> {
	#[inline]
	pub fn has_this(&self) -> bool {
		self.calling_convention.contains(CallingConvention::HAS_THIS)
	}
}

/// Decodes one type reference.
pub(crate) fn read_type<'l>(
	stream: &mut Cursor<&[u8]>,
	resolver: &SigResolver<'_, 'l>,
) -> Result<&'l Type<'l>, LoadError> {
	let pool = resolver.assembly.pool();
	let tag = u8::read(stream, &())?;
	match tag {
		ELEMENT_VOID => Ok(pool.get_primitive(Primitive::Void)),
		ELEMENT_BOOLEAN => Ok(pool.get_primitive(Primitive::Boolean)),
		ELEMENT_CHAR => Ok(pool.get_primitive(Primitive::Char)),
		ELEMENT_I1 => Ok(pool.get_primitive(Primitive::Int8)),
		ELEMENT_U1 => Ok(pool.get_primitive(Primitive::UInt8)),
		ELEMENT_I2 => Ok(pool.get_primitive(Primitive::Int16)),
		ELEMENT_U2 => Ok(pool.get_primitive(Primitive::UInt16)),
		ELEMENT_I4 => Ok(pool.get_primitive(Primitive::Int32)),
		ELEMENT_U4 => Ok(pool.get_primitive(Primitive::UInt32)),
		ELEMENT_I8 => Ok(pool.get_primitive(Primitive::Int64)),
		ELEMENT_U8 => Ok(pool.get_primitive(Primitive::UInt64)),
		ELEMENT_R4 => Ok(pool.get_primitive(Primitive::Float)),
		ELEMENT_R8 => Ok(pool.get_primitive(Primitive::Double)),
		ELEMENT_I => Ok(pool.get_primitive(Primitive::IntPtr)),
		ELEMENT_U => Ok(pool.get_primitive(Primitive::UIntPtr)),
		ELEMENT_STRING => Ok(pool.string_base()),
		ELEMENT_OBJECT => Ok(pool.object_base()),
		ELEMENT_PTR => {
			let pointee = read_type(stream, resolver)?;
			Ok(pool.get_pointer(pointee))
		},
		ELEMENT_BYREF => {
			let referent = read_type(stream, resolver)?;
			pool.get_byref(referent)
		},
		ELEMENT_VALUETYPE | ELEMENT_CLASS => {
			let index = TypeDefOrRef::read_compressed(stream)?;
			resolver.assembly.resolve_type_def_or_ref(index)
		},
		ELEMENT_VAR => Ok(resolver.type_var(read_compressed_u32(stream)?)),
		ELEMENT_MVAR => Ok(resolver.method_var(read_compressed_u32(stream)?)),
		ELEMENT_SZARRAY => {
			let element = read_type(stream, resolver)?;
			Ok(pool.get_array(element))
		},
		ELEMENT_ARRAY => {
			// Multi-dimensional shape: element, rank, sizes, lower bounds.
			// The shape is validated and collapsed onto the element array.
			let element = read_type(stream, resolver)?;
			let rank = read_compressed_u32(stream)?;
			if rank == 0 {
				return Err(LoadError::BadFormat("array shape with rank zero"));
			}
			let sizes = read_compressed_u32(stream)?;
			for _ in 0..sizes {
				let _ = read_compressed_u32(stream)?;
			}
			let lower_bounds = read_compressed_u32(stream)?;
			for _ in 0..lower_bounds {
				let _ = read_compressed_u32(stream)?;
			}
			Ok(pool.get_array(element))
		},
		ELEMENT_GENERICINST => {
			let kind = u8::read(stream, &())?;
			if kind != ELEMENT_CLASS && kind != ELEMENT_VALUETYPE {
				return Err(LoadError::BadFormat("generic instantiation of a non-class signature"));
			}
			let index = TypeDefOrRef::read_compressed(stream)?;
			let definition = resolver.assembly.resolve_type_def_or_ref(index)?;
			let count = read_compressed_u32(stream)? as usize;
			let mut args = Vec::with_capacity(count);
			for _ in 0..count {
				args.push(read_type(stream, resolver)?);
			}
			pool.get_generic_instantiation(definition, &args)
		},
		ELEMENT_FNPTR => {
			// Function pointers decay to native int on this runtime.
			let _ = read_method_signature(stream, resolver)?;
			Ok(pool.get_primitive(Primitive::IntPtr))
		},
		ELEMENT_CMOD_REQD | ELEMENT_CMOD_OPT => {
			let _ = TypeDefOrRef::read_compressed(stream)?;
			read_type(stream, resolver)
		},
		ELEMENT_PINNED => read_type(stream, resolver),
		ELEMENT_TYPEDBYREF => Err(LoadError::BadFormat("typed references are not supported")),
		_ => Err(LoadError::BadFormat("illegal signature element tag")),
	}
}

pub(crate) fn read_method_signature<'l>(
	stream: &mut Cursor<&[u8]>,
	resolver: &SigResolver<'_, 'l>,
) -> Result<MethodSig<'l>, LoadError> {
	let calling_convention = CallingConvention::from_bits_retain(u8::read(stream, &())?);

	let generic_param_count = match calling_convention.contains(CallingConvention::GENERIC) {
		true => read_compressed_u32(stream)?,
		false => 0,
	};

	let param_count = read_compressed_u32(stream)? as usize;
	let return_type = read_type(stream, resolver)?;

	let mut param_types = Vec::with_capacity(param_count);
	for _ in 0..param_count {
		param_types.push(read_type(stream, resolver)?);
	}

	Ok(MethodSig { calling_convention, generic_param_count, return_type, param_types })
}

pub(crate) fn read_field_signature<'l>(
	stream: &mut Cursor<&[u8]>,
	resolver: &SigResolver<'_, 'l>,
) -> Result<&'l Type<'l>, LoadError> {
	if u8::read(stream, &())? != SIG_FIELD {
		return Err(LoadError::BadFormat("blob is not a field signature"));
	}
	read_type(stream, resolver)
}

pub(crate) fn read_locals_signature<'l>(
	stream: &mut Cursor<&[u8]>,
	resolver: &SigResolver<'_, 'l>,
) -> Result<Vec<&'l Type<'l>>, LoadError> {
	if u8::read(stream, &())? != SIG_LOCALS {
		return Err(LoadError::BadFormat("blob is not a locals signature"));
	}
	let count = read_compressed_u32(stream)? as usize;
	let mut locals = Vec::with_capacity(count);
	for _ in 0..count {
		locals.push(read_type(stream, resolver)?);
	}
	Ok(locals)
}

/// Writes `ty` back to its signature blob form. Round-trips with
/// [read_type] for every shape the decoder accepts except pinned locals
/// and custom modifiers, which decode transparently.
pub(crate) fn write_type_blob(ty: &Type, buffer: &mut Vec<u8>) -> Result<(), LoadError> {
	if let Some(primitive) = ty.primitive() {
		buffer.push(match primitive {
			Primitive::Void => ELEMENT_VOID,
			Primitive::Boolean => ELEMENT_BOOLEAN,
			Primitive::Char => ELEMENT_CHAR,
			Primitive::Int8 => ELEMENT_I1,
			Primitive::UInt8 => ELEMENT_U1,
			Primitive::Int16 => ELEMENT_I2,
			Primitive::UInt16 => ELEMENT_U2,
			Primitive::Int32 => ELEMENT_I4,
			Primitive::UInt32 => ELEMENT_U4,
			Primitive::Int64 => ELEMENT_I8,
			Primitive::UInt64 => ELEMENT_U8,
			Primitive::Float => ELEMENT_R4,
			Primitive::Double => ELEMENT_R8,
			Primitive::IntPtr => ELEMENT_I,
			Primitive::UIntPtr => ELEMENT_U,
		});
		return Ok(());
	}

	match ty.kind() {
		TypeKind::Array => {
			buffer.push(ELEMENT_SZARRAY);
			let element = ty.element_type().ok_or(LoadError::CheckFailed("array without element type"))?;
			write_type_blob(element, buffer)
		},
		TypeKind::ByRef => {
			buffer.push(ELEMENT_BYREF);
			let referent = ty.element_type().ok_or(LoadError::CheckFailed("by-ref without referent"))?;
			write_type_blob(referent, buffer)
		},
		TypeKind::Pointer => {
			buffer.push(ELEMENT_PTR);
			let pointee = ty.element_type().ok_or(LoadError::CheckFailed("pointer without pointee"))?;
			write_type_blob(pointee, buffer)
		},
		TypeKind::GenericParameter => {
			let index = ty.generic_param_index()
				.ok_or(LoadError::CheckFailed("generic parameter without an index"))?;
			buffer.push(ELEMENT_VAR);
			write_compressed_u32(buffer, index);
			Ok(())
		},
		TypeKind::Class | TypeKind::Interface | TypeKind::ValueType => {
			if ty.namespace() == "System" && ty.name() == "String" {
				buffer.push(ELEMENT_STRING);
				return Ok(());
			}
			if ty.namespace() == "System" && ty.name() == "Object" {
				buffer.push(ELEMENT_OBJECT);
				return Ok(());
			}

			if let Some(definition) = ty.generic_definition() {
				buffer.push(ELEMENT_GENERICINST);
				buffer.push(match definition.is_value_type() {
					true => ELEMENT_VALUETYPE,
					false => ELEMENT_CLASS,
				});
				TypeDefOrRef::TypeDef(definition.token().index()).write_compressed(buffer);
				write_compressed_u32(buffer, ty.generic_args().len() as u32);
				for arg in ty.generic_args() {
					write_type_blob(arg, buffer)?;
				}
				return Ok(());
			}

			buffer.push(match ty.is_value_type() {
				true => ELEMENT_VALUETYPE,
				false => ELEMENT_CLASS,
			});
			TypeDefOrRef::TypeDef(ty.token().index()).write_compressed(buffer);
			Ok(())
		},
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use crate::metadata::Context;
	use super::*;

	#[test]
	fn decoding_then_encoding_round_trips() {
		let ctx = Context::new();
		let corlib = ctx.corlib();
		let exception_row = corlib.find_type("System", "Exception").unwrap().token().index();

		let mut class_blob = vec![ELEMENT_CLASS];
		TypeDefOrRef::TypeDef(exception_row).write_compressed(&mut class_blob);

		let blobs: Vec<Vec<u8>> = vec![
			vec![ELEMENT_I4],
			vec![ELEMENT_BOOLEAN],
			vec![ELEMENT_STRING],
			vec![ELEMENT_OBJECT],
			vec![ELEMENT_SZARRAY, ELEMENT_I4],
			vec![ELEMENT_SZARRAY, ELEMENT_SZARRAY, ELEMENT_OBJECT],
			vec![ELEMENT_BYREF, ELEMENT_R8],
			vec![ELEMENT_PTR, ELEMENT_I],
			class_blob,
		];
		for blob in blobs {
			let resolver = SigResolver::new(corlib);
			let ty = read_type(&mut Cursor::new(blob.as_slice()), &resolver).unwrap();
			let mut encoded = vec![];
			write_type_blob(ty, &mut encoded).unwrap();
			assert_eq!(encoded, blob, "{ty} did not round-trip");
		}
	}

	#[test]
	fn truncated_or_illegal_signatures_fail() {
		let ctx = Context::new();
		let corlib = ctx.corlib();
		let resolver = SigResolver::new(corlib);

		let truncated = [ELEMENT_SZARRAY];
		assert!(read_type(&mut Cursor::new(truncated.as_slice()), &resolver).is_err());
		let illegal = [0x17u8];
		assert!(read_type(&mut Cursor::new(illegal.as_slice()), &resolver).is_err());
	}

	#[test]
	fn method_signatures_carry_convention_and_params() {
		let ctx = Context::new();
		let corlib = ctx.corlib();
		let resolver = SigResolver::new(corlib);

		// hasthis, two params, void return, (int32, string)
		let blob = [0x20, 0x02, ELEMENT_VOID, ELEMENT_I4, ELEMENT_STRING];
		let sig = read_method_signature(&mut Cursor::new(blob.as_slice()), &resolver).unwrap();
		assert!(sig.has_this());
		assert_eq!(sig.param_types.len(), 2);
		assert_eq!(sig.return_type.name(), "Void");
		assert_eq!(sig.param_types[1].name(), "String");
	}

	#[test]
	fn locals_signatures_decode_in_order() {
		let ctx = Context::new();
		let corlib = ctx.corlib();
		let resolver = SigResolver::new(corlib);

		let blob = [0x07, 0x02, ELEMENT_I4, ELEMENT_SZARRAY, ELEMENT_I8];
		let locals = read_locals_signature(&mut Cursor::new(blob.as_slice()), &resolver).unwrap();
		assert_eq!(locals.len(), 2);
		assert_eq!(locals[0].name(), "Int32");
		assert!(locals[1].is_array());
	}
}
