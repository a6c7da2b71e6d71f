use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::sync::Arc;

use fxhash::FxHashMap;
use owning_ref::ArcRef;

use crate::utilities::{read_compressed_u32, write_compressed_u32};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StringIndex(pub usize);

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlobIndex(pub usize);

/// UTF-8, null-terminated strings indexed by byte offset.
#[derive(Clone)]
pub struct StringHeap(ArcRef<[u8]>);

impl StringHeap {
	pub fn new(data: ArcRef<[u8]>) -> Self {
		Self(data)
	}

	pub fn get(&self, index: StringIndex) -> Option<&str> {
		let bytes = self.0.get(index.0..)?;
		let end = bytes.iter().position(|b| *b == 0)?;
		std::str::from_utf8(&bytes[..end]).ok()
	}
}

impl Debug for StringHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "StringHeap({} bytes)", self.0.len())
	}
}

/// Length-prefixed binary blobs indexed by byte offset.
#[derive(Clone)]
pub struct BlobHeap(ArcRef<[u8]>);

impl BlobHeap {
	pub fn new(data: ArcRef<[u8]>) -> Self {
		Self(data)
	}

	pub fn get(&self, index: BlobIndex) -> Option<&[u8]> {
		let bytes = self.0.get(index.0..)?;
		let mut stream = Cursor::new(bytes);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		bytes.get(start..start + len)
	}
}

impl Debug for BlobHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "BlobHeap({} bytes)", self.0.len())
	}
}

/// UTF-16LE string literals indexed by the offset carried in `ldstr` tokens.
/// Each entry is a length prefix, the code units, and one terminal flag byte.
#[derive(Clone)]
pub struct UserStringHeap(ArcRef<[u8]>);

impl UserStringHeap {
	pub fn new(data: ArcRef<[u8]>) -> Self {
		Self(data)
	}

	pub fn get(&self, offset: usize) -> Option<String> {
		let bytes = self.0.get(offset..)?;
		let mut stream = Cursor::new(bytes);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		let data = bytes.get(start..start + len)?;
		if len == 0 {
			return Some(String::new());
		}

		let units: Vec<u16> = data[..len - 1]
			.chunks_exact(2)
			.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
			.collect();
		String::from_utf16(&units).ok()
	}
}

impl Debug for UserStringHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "UserStringHeap({} bytes)", self.0.len())
	}
}

/// Interning builder for [StringHeap]. Offset 0 is always the empty string.
#[derive(Default)]
pub struct StringHeapBuilder {
	data: Vec<u8>,
	interned: FxHashMap<String, StringIndex>,
}

impl StringHeapBuilder {
	pub fn new() -> Self {
		Self { data: vec![0], interned: Default::default() }
	}

	pub fn intern(&mut self, value: &str) -> StringIndex {
		if value.is_empty() {
			return StringIndex(0);
		}
		if let Some(index) = self.interned.get(value) {
			return *index;
		}

		let index = StringIndex(self.data.len());
		self.data.extend_from_slice(value.as_bytes());
		self.data.push(0);
		self.interned.insert(value.to_string(), index);
		index
	}

	pub fn build(self) -> StringHeap {
		StringHeap::new(ArcRef::new(Arc::from(self.data)))
	}
}

/// Interning builder for [BlobHeap]. Offset 0 is always the empty blob.
#[derive(Default)]
pub struct BlobHeapBuilder {
	data: Vec<u8>,
	interned: FxHashMap<Vec<u8>, BlobIndex>,
}

impl BlobHeapBuilder {
	pub fn new() -> Self {
		Self { data: vec![0], interned: Default::default() }
	}

	pub fn intern(&mut self, blob: &[u8]) -> BlobIndex {
		if blob.is_empty() {
			return BlobIndex(0);
		}
		if let Some(index) = self.interned.get(blob) {
			return *index;
		}

		let index = BlobIndex(self.data.len());
		write_compressed_u32(&mut self.data, blob.len() as u32);
		self.data.extend_from_slice(blob);
		self.interned.insert(blob.to_vec(), index);
		index
	}

	pub fn build(self) -> BlobHeap {
		BlobHeap::new(ArcRef::new(Arc::from(self.data)))
	}
}

#[derive(Default)]
pub struct UserStringHeapBuilder {
	data: Vec<u8>,
	interned: FxHashMap<String, usize>,
}

impl UserStringHeapBuilder {
	pub fn new() -> Self {
		Self { data: vec![0], interned: Default::default() }
	}

	pub fn intern(&mut self, value: &str) -> usize {
		if let Some(offset) = self.interned.get(value) {
			return *offset;
		}

		let offset = self.data.len();
		let units: Vec<u16> = value.encode_utf16().collect();
		let has_special = units.iter().any(|unit| *unit >= 0x80);
		write_compressed_u32(&mut self.data, (units.len() * 2 + 1) as u32);
		for unit in units {
			self.data.extend_from_slice(&unit.to_le_bytes());
		}
		self.data.push(has_special as u8);
		self.interned.insert(value.to_string(), offset);
		offset
	}

	pub fn build(self) -> UserStringHeap {
		UserStringHeap::new(ArcRef::new(Arc::from(self.data)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_heap_interns_and_resolves() {
		let mut builder = StringHeapBuilder::new();
		let a = builder.intern("System");
		let b = builder.intern("Int32");
		let a2 = builder.intern("System");
		assert_eq!(a, a2);
		assert_ne!(a, b);

		let heap = builder.build();
		assert_eq!(heap.get(a), Some("System"));
		assert_eq!(heap.get(b), Some("Int32"));
		assert_eq!(heap.get(StringIndex(0)), Some(""));
	}

	#[test]
	fn blob_heap_round_trips() {
		let mut builder = BlobHeapBuilder::new();
		let sig = builder.intern(&[0x06, 0x08]);
		let heap = builder.build();
		assert_eq!(heap.get(sig), Some([0x06u8, 0x08].as_slice()));
		assert_eq!(heap.get(BlobIndex(0)), Some([].as_slice()));
	}

	#[test]
	fn user_strings_decode_utf16() {
		let mut builder = UserStringHeapBuilder::new();
		let offset = builder.intern("héllo");
		let heap = builder.build();
		assert_eq!(heap.get(offset).as_deref(), Some("héllo"));
	}
}
