//! Runtime contracts: the object/vtable memory shape, the garbage-collector
//! ABI with an in-process default heap, and the safepoint-based thread
//! suspension protocol.

pub mod heap;
pub mod object;
pub mod threading;

pub use heap::{DefaultHeap, Gc};
pub use object::*;
pub use threading::{ThreadControl, ThreadState};
