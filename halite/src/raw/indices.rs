pub mod metadata_token {
	use std::fmt::{Debug, Formatter};
	use std::io::{Cursor, ErrorKind};
	use paste::paste;

	use crate::utilities::FromByteStream;

	macro_rules! define_metadata_token {
		($($id: ident = $discriminant: literal),*) => {
			#[repr(u32)]
			#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
			pub enum MetadataTokenKind {
				$($id = $discriminant),*
			}

			#[repr(transparent)]
			#[derive(Copy, Clone, Eq, PartialEq, Hash)]
			pub struct MetadataToken(u32);

			impl MetadataToken {
				pub fn kind(&self) -> MetadataTokenKind {
					let discriminant = (self.0 & 0xFF000000) >> 24;
					match discriminant {
						$($discriminant => MetadataTokenKind::$id,)*
						_ => unreachable!(),
					}
				}

				/// One-based row index (or byte offset for user-string tokens).
				#[inline]
				pub fn index(&self) -> usize {
					(self.0 & 0x00FFFFFF) as usize
				}

				#[inline]
				pub fn raw(&self) -> u32 {
					self.0
				}
			}

			impl TryFrom<u32> for MetadataToken {
				type Error = ();
				fn try_from(value: u32) -> Result<Self, Self::Error> {
					let discriminant = (value & 0xFF000000) >> 24;
					match discriminant {
						$($discriminant => Ok(Self(value)),)*
						_ => Err(())
					}
				}
			}

			paste! {
				$(
					#[repr(transparent)]
					#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
					pub struct [<$id Token>](pub usize);

					impl From<[<$id Token>]> for MetadataToken {
						fn from(value: [<$id Token>]) -> Self {
							MetadataToken(((MetadataTokenKind::$id as u32) << 24) | value.0 as u32)
						}
					}

					impl TryFrom<MetadataToken> for [<$id Token>] {
						type Error = ();
						fn try_from(value: MetadataToken) -> Result<Self, Self::Error> {
							match value.kind() {
								MetadataTokenKind::$id => Ok(Self(value.index())),
								_ => Err(()),
							}
						}
					}
				)*
			}
		};
	}

	define_metadata_token! {
		Module = 0x00,
		TypeRef = 0x01,
		TypeDef = 0x02,
		Field = 0x04,
		MethodDef = 0x06,
		Param = 0x08,
		InterfaceImpl = 0x09,
		MemberRef = 0x0a,
		StandAloneSig = 0x11,
		TypeSpec = 0x1b,
		Assembly = 0x20,
		AssemblyRef = 0x23,
		GenericParam = 0x2a,
		MethodSpec = 0x2b,

		String = 0x70
	}

	impl Debug for MetadataToken {
		fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
			write!(f, "MetadataToken::{:?}(", self.kind())?;
			self.index().fmt(f)?;
			write!(f, ")")
		}
	}

	impl FromByteStream for MetadataToken {
		type Deps = ();
		#[inline]
		fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
			let value = u32::read(stream, &())?;
			MetadataToken::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
		}
	}
}

pub mod coded_index {
	use std::io::{Cursor, Error, ErrorKind};

	use crate::raw::indices::metadata_token::{MetadataToken, TypeDefToken, TypeRefToken, TypeSpecToken};
	use crate::utilities::{read_compressed_u32, write_compressed_u32};

	/// The `TypeDefOrRef` coded index used throughout signature blobs.
	/// The tag lives in the two low bits, the one-based row index above them.
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub enum TypeDefOrRef {
		TypeDef(usize),
		TypeRef(usize),
		TypeSpec(usize),
	}

	impl TypeDefOrRef {
		pub fn read_compressed(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
			let value = read_compressed_u32(stream)?;
			let index = (value >> 2) as usize;
			match value & 3 {
				0 => Ok(TypeDefOrRef::TypeDef(index)),
				1 => Ok(TypeDefOrRef::TypeRef(index)),
				2 => Ok(TypeDefOrRef::TypeSpec(index)),
				_ => Err(Error::from(ErrorKind::InvalidData)),
			}
		}

		pub fn write_compressed(&self, buffer: &mut Vec<u8>) {
			let (tag, index) = match *self {
				TypeDefOrRef::TypeDef(index) => (0, index),
				TypeDefOrRef::TypeRef(index) => (1, index),
				TypeDefOrRef::TypeSpec(index) => (2, index),
			};
			write_compressed_u32(buffer, ((index as u32) << 2) | tag);
		}

		pub fn token(&self) -> MetadataToken {
			match *self {
				TypeDefOrRef::TypeDef(index) => TypeDefToken(index).into(),
				TypeDefOrRef::TypeRef(index) => TypeRefToken(index).into(),
				TypeDefOrRef::TypeSpec(index) => TypeSpecToken(index).into(),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::coded_index::TypeDefOrRef;
	use super::metadata_token::*;

	#[test]
	fn token_kind_lives_in_the_high_byte() {
		let token = MetadataToken::try_from(0x0600_0001).unwrap();
		assert_eq!(token.kind(), MetadataTokenKind::MethodDef);
		assert_eq!(token.index(), 1);

		let token = MetadataToken::try_from(0x7000_002A).unwrap();
		assert_eq!(token.kind(), MetadataTokenKind::String);
		assert_eq!(token.index(), 0x2A);

		assert!(MetadataToken::try_from(0xFF00_0001).is_err());
	}

	#[test]
	fn typed_tokens_convert_both_ways() {
		let token: MetadataToken = TypeDefToken(3).into();
		assert_eq!(token.raw(), 0x0200_0003);
		assert_eq!(TypeDefToken::try_from(token).unwrap(), TypeDefToken(3));
		assert!(FieldToken::try_from(token).is_err());
	}

	#[test]
	fn coded_index_round_trips() {
		for value in [TypeDefOrRef::TypeDef(12), TypeDefOrRef::TypeRef(1), TypeDefOrRef::TypeSpec(400)] {
			let mut buffer = vec![];
			value.write_compressed(&mut buffer);
			let mut stream = Cursor::new(buffer.as_slice());
			assert_eq!(TypeDefOrRef::read_compressed(&mut stream).unwrap(), value);
		}
	}
}
