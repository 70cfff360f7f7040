//! The compile-time half of the trec performance profiler.
//!
//! This crate rewrites an IR module so that, at run time, every user function
//! (and optionally every basic block of a cloned "fine" path) reports its
//! entry and exit to the measurement runtime. The probes carry opaque 64-bit
//! identifiers; the mapping from identifiers back to source locations lives
//! in an on-disk catalog shared by all concurrent instrumentation jobs.
//!
//! The pieces, bottom up:
//!
//!  * [ir]: the module/function/block/instruction data model the engine
//!    rewrites. Blocks and instructions live in per-function arenas and are
//!    addressed by stable indices, which is what makes cloning sound.
//!  * [catalog]: the SQLite-backed identifier catalog and the job-slot
//!    arbitration protocol between concurrent compiler processes.
//!  * [ids]: the bit layout of function and basic-block identifiers.
//!  * [instrument]: the engine that walks a module and inserts the probes.

pub mod catalog;
pub mod ids;
pub mod instrument;
pub mod ir;
mod log;

mod errors;

pub use catalog::Catalog;
pub use errors::CatalogError;
pub use instrument::{Engine, EngineConfig};
