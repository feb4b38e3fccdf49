//! A code cache for dynamic recompilers.
//!
//! The cache owns one fixed block of executable memory and hands out regions
//! of it to a recompiler: permanent allocations from both ends of the arena,
//! a transactional scratch region for the code currently being generated, and
//! a FIFO of deferred "out-of-band" patch callbacks that run when a codegen
//! transaction closes. Addresses handed out stay valid until
//! [`CodeCache::flush`], because generated machine code embeds absolute
//! pointers into the arena.

pub mod cache;
pub mod util;
pub mod virtual_memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Error {
    InvalidState,
    OutOfMemory,
    InvalidArgument,
}

pub use {
    cache::{CodeCache, CodeCacheOptions, OobCodegenFn},
    virtual_memory::{flush_instruction_cache, protect_jit_memory, ProtectJitAccess},
};
