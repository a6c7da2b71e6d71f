//! An experimental runtime core for CLI assemblies: the metadata reader's
//! decoded records are materialized into an arena-backed type universe, and
//! CIL method bodies are verified and translated into MIR for an external
//! code generator (with a reference interpreter standing in for it).

pub mod jit;
pub mod metadata;
pub mod mir;
pub mod raw;
pub mod runtime;
pub mod verifier;

pub(crate) mod utilities;
