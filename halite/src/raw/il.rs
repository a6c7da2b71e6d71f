use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind, Read};
use std::io::Result;

use bitflags::bitflags;

use crate::raw::heaps::BlobHeap;
use crate::raw::indices::metadata_token::{MetadataToken, StandAloneSigToken};
use crate::raw::tables::StandAloneSigRow;
use crate::utilities::{FromByteStream, read_bytes_slice_from_stream};

/// Control-flow class of an opcode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FlowKind {
	Next,
	Branch,
	CondBranch,
	Call,
	Return,
	Throw,
	Meta,
}

/// Operand-stack arity. `VARIABLE` marks signature-dependent counts.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StackBehavior {
	pub pops: u8,
	pub pushes: u8,
}

pub const VARIABLE: u8 = 0xFF;

macro_rules! debug_opcode {
	($name: ident, $f: expr, $self: expr, $ident: ident) => {
		if $name::$ident == *$self {
			return write!($f, "OpCode::{}", stringify!($ident));
		}
	};
	($name: ident, $f: expr, $self: expr, $ident: ident ($ty: ty)) => {
		if let $name::$ident(v) = $self {
			return write!($f, "OpCode::{}({:#X?})", stringify!($ident), v);
		}
	};
}

macro_rules! define_opcodes {
    (
		enum $name: ident  $(<$lifetime: lifetime>)? {
			$(
				$(#[$attr:meta])*
				$ident: ident $(($ty: ty))? [$flow: ident, $pops: expr, $pushes: expr] = $discriminant: literal
			),*
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, PartialEq)]
		pub enum $name $(<$lifetime>)? {
			$(
				$(#[$attr])*
				$ident $(($ty))? = $discriminant
			),*
		}

		impl$(<$lifetime>)? $name$(<$lifetime>)? {
			pub fn read(stream: &mut Cursor<& $($lifetime)? [u8]>, _: &()) -> Result<Self> {
				let mut discriminant = 0u8;
				stream.read_exact(std::slice::from_mut(&mut discriminant))?;

				match discriminant {
					$($discriminant => Ok($name::$ident $((<$ty>::read(stream, &())?))?),)*
					_ => Err(Error::new(ErrorKind::InvalidData, format!("Invalid OpCode {:#X?}", discriminant))),
				}
			}

			pub fn flow(&self) -> FlowKind {
				match self {
					$(Self::$ident { .. } => FlowKind::$flow,)*
				}
			}

			pub fn stack_behavior(&self) -> StackBehavior {
				match self {
					$(Self::$ident { .. } => StackBehavior { pops: $pops, pushes: $pushes },)*
				}
			}
		}

		impl $(<$lifetime>)? Debug for $name $(<$lifetime>)? {
			fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
				$(debug_opcode! { $name, f, self, $ident $(($ty))? })*
				Ok(())
			}
		}
	};
}

define_opcodes! {
	enum OpCode<'l> {
		/// Do nothing.
		nop [Next, 0, 0] = 0x00,
		/// Inform a debugger that a breakpoint has been reached.
		dbg_break [Meta, 0, 0] = 0x01,
		ldarg_0 [Next, 0, 1] = 0x02,
		ldarg_1 [Next, 0, 1] = 0x03,
		ldarg_2 [Next, 0, 1] = 0x04,
		ldarg_3 [Next, 0, 1] = 0x05,
		ldloc_0 [Next, 0, 1] = 0x06,
		ldloc_1 [Next, 0, 1] = 0x07,
		ldloc_2 [Next, 0, 1] = 0x08,
		ldloc_3 [Next, 0, 1] = 0x09,
		stloc_0 [Next, 1, 0] = 0x0A,
		stloc_1 [Next, 1, 0] = 0x0B,
		stloc_2 [Next, 1, 0] = 0x0C,
		stloc_3 [Next, 1, 0] = 0x0D,
		/// Load argument numbered num onto the stack, short form.
		ldarg_s(u8) [Next, 0, 1] = 0x0E,
		/// Fetch the address of argument argNum, short form.
		ldarga_s(u8) [Next, 0, 1] = 0x0F,
		/// Store value to the argument numbered num, short form.
		starg_s(u8) [Next, 1, 0] = 0x10,
		ldloc_s(u8) [Next, 0, 1] = 0x11,
		ldloca_s(u8) [Next, 0, 1] = 0x12,
		stloc_s(u8) [Next, 1, 0] = 0x13,
		/// Push a null reference on the stack.
		ldnull [Next, 0, 1] = 0x14,
		ldc_i4_m1 [Next, 0, 1] = 0x15,
		ldc_i4_0 [Next, 0, 1] = 0x16,
		ldc_i4_1 [Next, 0, 1] = 0x17,
		ldc_i4_2 [Next, 0, 1] = 0x18,
		ldc_i4_3 [Next, 0, 1] = 0x19,
		ldc_i4_4 [Next, 0, 1] = 0x1A,
		ldc_i4_5 [Next, 0, 1] = 0x1B,
		ldc_i4_6 [Next, 0, 1] = 0x1C,
		ldc_i4_7 [Next, 0, 1] = 0x1D,
		ldc_i4_8 [Next, 0, 1] = 0x1E,
		/// Push num onto the stack as int32, short form.
		ldc_i4_s(i8) [Next, 0, 1] = 0x1F,
		ldc_i4(i32) [Next, 0, 1] = 0x20,
		ldc_i8(i64) [Next, 0, 1] = 0x21,
		ldc_r4(f32) [Next, 0, 1] = 0x22,
		ldc_r8(f64) [Next, 0, 1] = 0x23,
		/// Duplicate the value on the top of the stack.
		dup [Next, 1, 2] = 0x25,
		/// Pop value from the stack.
		pop [Next, 1, 0] = 0x26,
		/// Exit current method and jump to the specified method.
		jmp(MetadataToken) [Meta, 0, 0] = 0x27,
		/// Call method described by method.
		call(MetadataToken) [Call, VARIABLE, VARIABLE] = 0x28,
		/// Call method indicated on the stack with arguments described by callsitedescr.
		calli(MetadataToken) [Call, VARIABLE, VARIABLE] = 0x29,
		/// Return from method, possibly with a value.
		ret [Return, VARIABLE, 0] = 0x2A,
		/// Branch to target, short form.
		br_s(i8) [Branch, 0, 0] = 0x2B,
		brfalse_s(i8) [CondBranch, 1, 0] = 0x2C,
		brtrue_s(i8) [CondBranch, 1, 0] = 0x2D,
		beq_s(i8) [CondBranch, 2, 0] = 0x2E,
		bge_s(i8) [CondBranch, 2, 0] = 0x2F,
		bgt_s(i8) [CondBranch, 2, 0] = 0x30,
		ble_s(i8) [CondBranch, 2, 0] = 0x31,
		blt_s(i8) [CondBranch, 2, 0] = 0x32,
		bne_un_s(i8) [CondBranch, 2, 0] = 0x33,
		bge_un_s(i8) [CondBranch, 2, 0] = 0x34,
		bgt_un_s(i8) [CondBranch, 2, 0] = 0x35,
		ble_un_s(i8) [CondBranch, 2, 0] = 0x36,
		blt_un_s(i8) [CondBranch, 2, 0] = 0x37,
		/// Branch to target.
		br(i32) [Branch, 0, 0] = 0x38,
		brfalse(i32) [CondBranch, 1, 0] = 0x39,
		brtrue(i32) [CondBranch, 1, 0] = 0x3A,
		beq(i32) [CondBranch, 2, 0] = 0x3B,
		bge(i32) [CondBranch, 2, 0] = 0x3C,
		bgt(i32) [CondBranch, 2, 0] = 0x3D,
		ble(i32) [CondBranch, 2, 0] = 0x3E,
		blt(i32) [CondBranch, 2, 0] = 0x3F,
		bne_un(i32) [CondBranch, 2, 0] = 0x40,
		bge_un(i32) [CondBranch, 2, 0] = 0x41,
		bgt_un(i32) [CondBranch, 2, 0] = 0x42,
		ble_un(i32) [CondBranch, 2, 0] = 0x43,
		blt_un(i32) [CondBranch, 2, 0] = 0x44,
		/// Jump to one of n values.
		switch(SwitchTable<'l>) [CondBranch, 1, 0] = 0x45,
		ldind_i1 [Next, 1, 1] = 0x46,
		ldind_u1 [Next, 1, 1] = 0x47,
		ldind_i2 [Next, 1, 1] = 0x48,
		ldind_u2 [Next, 1, 1] = 0x49,
		ldind_i4 [Next, 1, 1] = 0x4A,
		ldind_u4 [Next, 1, 1] = 0x4B,
		ldind_i8 [Next, 1, 1] = 0x4C,
		ldind_i [Next, 1, 1] = 0x4D,
		ldind_r4 [Next, 1, 1] = 0x4E,
		ldind_r8 [Next, 1, 1] = 0x4F,
		ldind_ref [Next, 1, 1] = 0x50,
		stind_ref [Next, 2, 0] = 0x51,
		stind_i1 [Next, 2, 0] = 0x52,
		stind_i2 [Next, 2, 0] = 0x53,
		stind_i4 [Next, 2, 0] = 0x54,
		stind_i8 [Next, 2, 0] = 0x55,
		stind_r4 [Next, 2, 0] = 0x56,
		stind_r8 [Next, 2, 0] = 0x57,
		add [Next, 2, 1] = 0x58,
		sub [Next, 2, 1] = 0x59,
		mul [Next, 2, 1] = 0x5A,
		div [Next, 2, 1] = 0x5B,
		div_un [Next, 2, 1] = 0x5C,
		rem [Next, 2, 1] = 0x5D,
		rem_un [Next, 2, 1] = 0x5E,
		and [Next, 2, 1] = 0x5F,
		or [Next, 2, 1] = 0x60,
		xor [Next, 2, 1] = 0x61,
		shl [Next, 2, 1] = 0x62,
		shr [Next, 2, 1] = 0x63,
		shr_un [Next, 2, 1] = 0x64,
		neg [Next, 1, 1] = 0x65,
		not [Next, 1, 1] = 0x66,
		conv_i1 [Next, 1, 1] = 0x67,
		conv_i2 [Next, 1, 1] = 0x68,
		conv_i4 [Next, 1, 1] = 0x69,
		conv_i8 [Next, 1, 1] = 0x6A,
		conv_r4 [Next, 1, 1] = 0x6B,
		conv_r8 [Next, 1, 1] = 0x6C,
		conv_u4 [Next, 1, 1] = 0x6D,
		conv_u8 [Next, 1, 1] = 0x6E,
		/// Call a method associated with an object.
		callvirt(MetadataToken) [Call, VARIABLE, VARIABLE] = 0x6F,
		/// Copy a value type from src to dest.
		cpobj(MetadataToken) [Next, 2, 0] = 0x70,
		/// Copy the value stored at address src to the stack.
		ldobj(MetadataToken) [Next, 1, 1] = 0x71,
		/// Push a string object for the literal string.
		ldstr(MetadataToken) [Next, 0, 1] = 0x72,
		/// Allocate an uninitialized object or value type and call ctor.
		newobj(MetadataToken) [Call, VARIABLE, 1] = 0x73,
		/// Cast obj to class.
		castclass(MetadataToken) [Next, 1, 1] = 0x74,
		/// Test if obj is an instance of class, returning null or an instance of that class or interface.
		isinst(MetadataToken) [Next, 1, 1] = 0x75,
		/// Convert unsigned integer to floating-point, pushing F on stack.
		conv_r_un [Next, 1, 1] = 0x76,
		/// Extract a value-type from obj, its boxed representation, and push a controlled-mutability managed pointer to it to the top of the stack.
		unbox(MetadataToken) [Next, 1, 1] = 0x79,
		/// Throw an exception.
		throw [Throw, 1, 0] = 0x7A,
		/// Push the value of field of object (or value type) obj, onto the stack.
		ldfld(MetadataToken) [Next, 1, 1] = 0x7B,
		/// Push the address of field of object obj on the stack.
		ldflda(MetadataToken) [Next, 1, 1] = 0x7C,
		/// Replace the value of field of the object obj with value.
		stfld(MetadataToken) [Next, 2, 0] = 0x7D,
		ldsfld(MetadataToken) [Next, 0, 1] = 0x7E,
		ldsflda(MetadataToken) [Next, 0, 1] = 0x7F,
		stsfld(MetadataToken) [Next, 1, 0] = 0x80,
		/// Store a value of type typeTok at an address.
		stobj(MetadataToken) [Next, 2, 0] = 0x81,
		conv_ovf_i1_un [Next, 1, 1] = 0x82,
		conv_ovf_i2_un [Next, 1, 1] = 0x83,
		conv_ovf_i4_un [Next, 1, 1] = 0x84,
		conv_ovf_i8_un [Next, 1, 1] = 0x85,
		conv_ovf_u1_un [Next, 1, 1] = 0x86,
		conv_ovf_u2_un [Next, 1, 1] = 0x87,
		conv_ovf_u4_un [Next, 1, 1] = 0x88,
		conv_ovf_u8_un [Next, 1, 1] = 0x89,
		conv_ovf_i_un [Next, 1, 1] = 0x8A,
		conv_ovf_u_un [Next, 1, 1] = 0x8B,
		/// Convert a boxable value to its boxed form.
		box_val(MetadataToken) [Next, 1, 1] = 0x8C,
		/// Create a new array with elements of type etype.
		newarr(MetadataToken) [Next, 1, 1] = 0x8D,
		/// Push the length (of type native unsigned int) of array on the stack.
		ldlen [Next, 1, 1] = 0x8E,
		/// Load the address of element at index onto the top of the stack.
		ldelema(MetadataToken) [Next, 2, 1] = 0x8F,
		ldelem_i1 [Next, 2, 1] = 0x90,
		ldelem_u1 [Next, 2, 1] = 0x91,
		ldelem_i2 [Next, 2, 1] = 0x92,
		ldelem_u2 [Next, 2, 1] = 0x93,
		ldelem_i4 [Next, 2, 1] = 0x94,
		ldelem_u4 [Next, 2, 1] = 0x95,
		ldelem_i8 [Next, 2, 1] = 0x96,
		ldelem_i [Next, 2, 1] = 0x97,
		ldelem_r4 [Next, 2, 1] = 0x98,
		ldelem_r8 [Next, 2, 1] = 0x99,
		ldelem_ref [Next, 2, 1] = 0x9A,
		stelem_i [Next, 3, 0] = 0x9B,
		stelem_i1 [Next, 3, 0] = 0x9C,
		stelem_i2 [Next, 3, 0] = 0x9D,
		stelem_i4 [Next, 3, 0] = 0x9E,
		stelem_i8 [Next, 3, 0] = 0x9F,
		stelem_r4 [Next, 3, 0] = 0xA0,
		stelem_r8 [Next, 3, 0] = 0xA1,
		stelem_ref [Next, 3, 0] = 0xA2,
		/// Load the element at index onto the top of the stack.
		ldelem(MetadataToken) [Next, 2, 1] = 0xA3,
		/// Replace array element at index with the value on the stack.
		stelem(MetadataToken) [Next, 3, 0] = 0xA4,
		/// Extract a value-type from obj, its boxed representation, and copy to the top of the stack.
		unbox_any(MetadataToken) [Next, 1, 1] = 0xA5,
		conv_ovf_i1 [Next, 1, 1] = 0xB3,
		conv_ovf_u1 [Next, 1, 1] = 0xB4,
		conv_ovf_i2 [Next, 1, 1] = 0xB5,
		conv_ovf_u2 [Next, 1, 1] = 0xB6,
		conv_ovf_i4 [Next, 1, 1] = 0xB7,
		conv_ovf_u4 [Next, 1, 1] = 0xB8,
		conv_ovf_i8 [Next, 1, 1] = 0xB9,
		conv_ovf_u8 [Next, 1, 1] = 0xBA,
		/// Push the address stored in a typed reference.
		refanyval(MetadataToken) [Next, 1, 1] = 0xC2,
		/// Throw ArithmeticException if value is not a finite number.
		ckfinite [Next, 1, 1] = 0xC3,
		/// Push a typed reference to ptr of type class onto the stack.
		mkrefany(MetadataToken) [Next, 1, 1] = 0xC6,
		/// Convert metadata token to its runtime representation.
		ldtoken(MetadataToken) [Next, 0, 1] = 0xD0,
		conv_u2 [Next, 1, 1] = 0xD1,
		conv_u1 [Next, 1, 1] = 0xD2,
		conv_i [Next, 1, 1] = 0xD3,
		conv_ovf_i [Next, 1, 1] = 0xD4,
		conv_ovf_u [Next, 1, 1] = 0xD5,
		add_ovf [Next, 2, 1] = 0xD6,
		add_ovf_un [Next, 2, 1] = 0xD7,
		mul_ovf [Next, 2, 1] = 0xD8,
		mul_ovf_un [Next, 2, 1] = 0xD9,
		sub_ovf [Next, 2, 1] = 0xDA,
		sub_ovf_un [Next, 2, 1] = 0xDB,
		/// End the finally or fault clause of an exception block.
		endfinally [Meta, 0, 0] = 0xDC,
		/// Exit a protected region of code.
		leave(i32) [Branch, 0, 0] = 0xDD,
		/// Exit a protected region of code, short form.
		leave_s(i8) [Branch, 0, 0] = 0xDE,
		/// Store value of type native int into memory at address.
		stind_i [Next, 2, 0] = 0xDF,
		conv_u [Next, 1, 1] = 0xE0,
		compound(CompoundOpCode) [Meta, VARIABLE, VARIABLE] = 0xFE
	}
}

define_opcodes! {
	enum CompoundOpCode {
		/// Return argument list handle for the current method.
		arglist [Next, 0, 1] = 0x00,
		ceq [Next, 2, 1] = 0x01,
		cgt [Next, 2, 1] = 0x02,
		cgt_un [Next, 2, 1] = 0x03,
		clt [Next, 2, 1] = 0x04,
		clt_un [Next, 2, 1] = 0x05,
		/// Push a pointer to a method referenced by method, on the stack.
		ldftn(MetadataToken) [Next, 0, 1] = 0x06,
		/// Push address of virtual method on the stack.
		ldvirtftn(MetadataToken) [Next, 1, 1] = 0x07,
		ldarg(u16) [Next, 0, 1] = 0x09,
		ldarga(u16) [Next, 0, 1] = 0x0A,
		starg(u16) [Next, 1, 0] = 0x0B,
		ldloc(u16) [Next, 0, 1] = 0x0C,
		ldloca(u16) [Next, 0, 1] = 0x0D,
		stloc(u16) [Next, 1, 0] = 0x0E,
		/// Allocate space from the local memory pool.
		localloc [Next, 1, 1] = 0x0F,
		/// End an exception handling filter clause.
		endfilter [Meta, 1, 0] = 0x11,
		/// Subsequent pointer instruction might be unaligned.
		unaligned(u8) [Meta, 0, 0] = 0x12,
		/// Subsequent pointer reference is volatile.
		volatile [Meta, 0, 0] = 0x13,
		/// Subsequent call terminates current method.
		tail [Meta, 0, 0] = 0x14,
		/// Initialize the value at address dest.
		initobj(MetadataToken) [Next, 1, 0] = 0x15,
		/// Call a virtual method on a type constrained to be type T.
		constrained(MetadataToken) [Meta, 0, 0] = 0x16,
		/// Copy data from memory to memory.
		cpblk [Next, 3, 0] = 0x17,
		/// Set all bytes in a block of memory to a given byte value.
		initblk [Next, 3, 0] = 0x18,
		/// The specified fault check(s) normally performed as part of the execution of the subsequent instruction can/shall be skipped.
		no_chk(SkipFaultCheckFlags) [Meta, 0, 0] = 0x19,
		/// Rethrow the current exception.
		rethrow [Throw, 0, 0] = 0x1A,
		/// Push the size, in bytes, of a type as an unsigned int32.
		sizeof(MetadataToken) [Next, 0, 1] = 0x1C,
		/// Push the type token stored in a typed reference.
		refanytype [Next, 1, 1] = 0x1D,
		/// The subsequent array address operation performs no type check at runtime and returns a controlled-mutability managed pointer.
		readonly [Meta, 0, 0] = 0x1E
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SkipFaultCheckFlags: u8 {
		const TYPE_CHECK = 0x1;
		const RANGE_CHECK = 0x2;
		const NULL_CHECK = 0x4;
	}
}

impl FromByteStream for SkipFaultCheckFlags {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> Result<Self> {
		Ok(Self::from_bits_retain(u8::read(stream, &())?))
	}
}

#[derive(Copy, Clone, PartialEq, Hash)]
pub struct SwitchTable<'l>(&'l [u8]);

impl Debug for SwitchTable<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for variant in self.variants() {
			dbg.entry(&variant);
		}
		dbg.finish()
	}
}

impl<'l> SwitchTable<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>, _: &()) -> Result<Self> {
		let len = u32::read(stream, &())?;
		let data = read_bytes_slice_from_stream(stream, len as usize * 4)?;
		Ok(Self(data))
	}

	pub fn len(&self) -> usize {
		self.0.len() / 4
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	pub fn variants(&self) -> impl Iterator<Item=i32> + '_ {
		(0..self.len()).map(move |i| {
			let slice = &self.0[i * 4..(i + 1) * 4];
			i32::from_le_bytes(slice.try_into().unwrap())
		})
	}
}

/// Walks a code buffer yielding `(start, end, opcode)`. Branch targets are
/// relative to `end` (the offset just past the operand bytes).
pub struct OpCodeIterator<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> OpCodeIterator<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}
}

impl<'l> Iterator for OpCodeIterator<'l> {
	type Item = (u32, u32, Result<OpCode<'l>>);
	fn next(&mut self) -> Option<Self::Item> {
		let start = self.cursor.position() as u32;
		match start as usize == self.cursor.get_ref().len() {
			true => None,
			false => {
				let opcode = OpCode::read(&mut self.cursor, &());
				Some((start, self.cursor.position() as u32, opcode))
			},
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExceptionClauseKind {
	Catch(MetadataToken),
	Filter { filter_offset: u32 },
	Finally,
	Fault,
}

impl ExceptionClauseKind {
	fn from_raw(flags: u32, class_token_or_filter: u32) -> Result<Self> {
		match flags {
			0x0 => {
				let token = MetadataToken::try_from(class_token_or_filter)
					.map_err(|_| Error::from(ErrorKind::InvalidData))?;
				Ok(ExceptionClauseKind::Catch(token))
			},
			0x1 => Ok(ExceptionClauseKind::Filter { filter_offset: class_token_or_filter }),
			0x2 => Ok(ExceptionClauseKind::Finally),
			0x4 => Ok(ExceptionClauseKind::Fault),
			_ => Err(Error::from(ErrorKind::InvalidData)),
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ExceptionClause {
	pub kind: ExceptionClauseKind,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
}

impl ExceptionClause {
	#[inline]
	pub fn try_end(&self) -> u32 {
		self.try_offset + self.try_length
	}

	#[inline]
	pub fn handler_end(&self) -> u32 {
		self.handler_offset + self.handler_length
	}
}

const FAT_FORMAT: u16 = 0x3;
const TINY_FORMAT: u16 = 0x2;
const FLAG_INIT_LOCALS: u16 = 0x10;
const FLAG_MORE_SECTS: u16 = 0x8;

const SECTION_EH_TABLE: u8 = 0x1;
const SECTION_FAT_FORMAT: u8 = 0x40;
const SECTION_MORE_SECTS: u8 = 0x80;

#[derive(Debug)]
pub struct MethodBody<'l> {
	pub max_stack_size: u16,
	pub init_locals: bool,
	/// Raw local-variable signature blob (leading `0x07`), if any.
	pub locals_sig: Option<&'l [u8]>,
	pub exception_clauses: Vec<ExceptionClause>,
	pub code: &'l [u8],
}

impl<'l> MethodBody<'l> {
	pub fn read(
		stream: &mut Cursor<&'l [u8]>,
		blob_heap: &'l BlobHeap,
		signatures: &[StandAloneSigRow],
	) -> Result<Self> {
		let header = u8::read(stream, &())?;
		match (header & 3) as u16 {
			TINY_FORMAT => {
				let code_size = (header >> 2) as usize;
				let code = read_bytes_slice_from_stream(stream, code_size)?;
				Ok(Self {
					code,
					max_stack_size: 8,
					init_locals: false,
					locals_sig: None,
					exception_clauses: vec![],
				})
			},
			FAT_FORMAT => {
				stream.set_position(stream.position() - 1);
				let flags = u16::read(stream, &())?;
				let max_stack_size = u16::read(stream, &())?;
				let code_size = u32::read(stream, &())?;
				let init_locals = flags & FLAG_INIT_LOCALS != 0;

				let mut locals_sig = None;
				let local_var_token = u32::read(stream, &())?;
				if local_var_token != 0 {
					let Ok(local_var_token) = MetadataToken::try_from(local_var_token) else {
						return Err(Error::new(ErrorKind::InvalidData, "Invalid metadata token"));
					};
					let Ok(StandAloneSigToken(index)) = local_var_token.try_into() else {
						return Err(Error::new(ErrorKind::InvalidData, "Invalid metadata token"));
					};
					let Some(row) = signatures.get(index.wrapping_sub(1)) else {
						return Err(Error::new(ErrorKind::NotFound, "Invalid signature table row"));
					};
					let Some(sig) = blob_heap.get(row.signature) else {
						return Err(Error::new(ErrorKind::InvalidData, "Invalid blob index"));
					};
					if sig.first() != Some(&0x07) {
						return Err(Error::new(ErrorKind::InvalidData, "Blob is not a local signature"));
					}
					locals_sig = Some(sig);
				}

				let code = read_bytes_slice_from_stream(stream, code_size as usize)?;

				let mut exception_clauses = vec![];
				if flags & FLAG_MORE_SECTS != 0 {
					let aligned = (stream.position() + 3) & !3;
					stream.set_position(aligned);
					read_eh_sections(stream, &mut exception_clauses)?;
				}

				Ok(Self { max_stack_size, init_locals, locals_sig, exception_clauses, code })
			},
			_ => Err(Error::new(ErrorKind::InvalidData, "Invalid method header")),
		}
	}
}

fn read_eh_sections(stream: &mut Cursor<&[u8]>, clauses: &mut Vec<ExceptionClause>) -> Result<()> {
	loop {
		let kind = u8::read(stream, &())?;
		if kind & SECTION_EH_TABLE == 0 {
			return Err(Error::new(ErrorKind::InvalidData, "Unknown method data section"));
		}

		match kind & SECTION_FAT_FORMAT != 0 {
			true => {
				let b = <[u8; 3]>::read(stream, &())?;
				let data_size = u32::from_le_bytes([b[0], b[1], b[2], 0]);
				let count = (data_size as usize - 4) / 24;
				clauses.reserve(count);
				for _ in 0..count {
					let flags = u32::read(stream, &())?;
					let try_offset = u32::read(stream, &())?;
					let try_length = u32::read(stream, &())?;
					let handler_offset = u32::read(stream, &())?;
					let handler_length = u32::read(stream, &())?;
					let class_token = u32::read(stream, &())?;
					clauses.push(ExceptionClause {
						kind: ExceptionClauseKind::from_raw(flags, class_token)?,
						try_offset, try_length,
						handler_offset, handler_length,
					});
				}
			},
			false => {
				let data_size = u8::read(stream, &())?;
				let _reserved = u16::read(stream, &())?;
				let count = (data_size as usize - 4) / 12;
				clauses.reserve(count);
				for _ in 0..count {
					let flags = u16::read(stream, &())? as u32;
					let try_offset = u16::read(stream, &())? as u32;
					let try_length = u8::read(stream, &())? as u32;
					let handler_offset = u16::read(stream, &())? as u32;
					let handler_length = u8::read(stream, &())? as u32;
					let class_token = u32::read(stream, &())?;
					clauses.push(ExceptionClause {
						kind: ExceptionClauseKind::from_raw(flags, class_token)?,
						try_offset, try_length,
						handler_offset, handler_length,
					});
				}
			},
		}

		if kind & SECTION_MORE_SECTS == 0 {
			return Ok(());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_simple_opcodes() {
		let code = [0x16, 0x17, 0x58, 0x2A];
		let decoded: Vec<_> = OpCodeIterator::new(&code)
			.map(|(_, _, op)| op.unwrap())
			.collect();
		assert!(matches!(decoded[0], OpCode::ldc_i4_0));
		assert!(matches!(decoded[1], OpCode::ldc_i4_1));
		assert!(matches!(decoded[2], OpCode::add));
		assert!(matches!(decoded[3], OpCode::ret));
	}

	#[test]
	fn folds_compound_prefix() {
		// ceq is 0xFE 0x01
		let code = [0xFE, 0x01];
		let (_, end, op) = OpCodeIterator::new(&code).next().unwrap();
		assert!(matches!(op.unwrap(), OpCode::compound(CompoundOpCode::ceq)));
		assert_eq!(end, 2);
	}

	#[test]
	fn branch_offsets_are_relative_to_the_next_instruction() {
		// br_s +0 then ret: the branch target is the ret at offset 2.
		let code = [0x2B, 0x00, 0x2A];
		let mut ops = OpCodeIterator::new(&code);
		let (start, end, op) = ops.next().unwrap();
		assert_eq!((start, end), (0, 2));
		let OpCode::br_s(rel) = op.unwrap() else { panic!() };
		assert_eq!(end as i64 + rel as i64, 2);
	}

	#[test]
	fn switch_reads_count_prefixed_targets() {
		let code = [0x45, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
		let (_, end, op) = OpCodeIterator::new(&code).next().unwrap();
		let OpCode::switch(table) = op.unwrap() else { panic!() };
		assert_eq!(end, 13);
		assert_eq!(table.variants().collect::<Vec<_>>(), vec![1, -1]);
	}

	#[test]
	fn flow_classes() {
		assert_eq!(OpCode::ret.flow(), FlowKind::Return);
		assert_eq!(OpCode::br(0).flow(), FlowKind::Branch);
		assert_eq!(OpCode::brtrue(0).flow(), FlowKind::CondBranch);
		assert_eq!(OpCode::throw.flow(), FlowKind::Throw);
		assert_eq!(OpCode::add.flow(), FlowKind::Next);
		assert_eq!(OpCode::add.stack_behavior(), StackBehavior { pops: 2, pushes: 1 });
	}

	#[test]
	fn reads_tiny_body() {
		// Tiny header: (size << 2) | 0x2
		let mut bytes = vec![(4 << 2) | 0x2];
		bytes.extend_from_slice(&[0x16, 0x17, 0x58, 0x2A]);

		let heap = crate::raw::heaps::BlobHeapBuilder::new().build();
		let mut stream = Cursor::new(bytes.as_slice());
		let parsed = MethodBody::read(&mut stream, &heap, &[]).unwrap();
		assert_eq!(parsed.code.len(), 4);
		assert_eq!(parsed.max_stack_size, 8);
		assert!(!parsed.init_locals);
	}
}
