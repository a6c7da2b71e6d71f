//! Raw metadata: the decoded-record contract with the external reader,
//! heap views, metadata tokens and the CIL instruction stream.

pub mod heaps;
pub mod il;
pub mod indices;
pub mod tables;
