//! The recompiler code cache: one fixed arena of executable memory carved
//! into three regions by movable cursors.
//!
//! - a "near" region at the base of the arena, bump-allocated upward, for
//!   permanent data that must be reachable through short-displacement
//!   addressing from generated code;
//! - a "far" region bump-allocated downward from the top of the arena, for
//!   permanent allocations of arbitrary size;
//! - a scratch region growing upward from the near/far boundary, holding the
//!   code currently being generated.
//!
//! Reclaimed permanent allocations go onto per-size-class free lists (one
//! table per region) instead of back into the bump cursors, so allocate and
//! free are both O(1). The free-list node is carved from the freed block
//! itself.
//!
//! Code generation is transactional: [`CodeCache::begin_codegen`] hands the
//! recompiler a live pointer to the scratch cursor, and
//! [`CodeCache::end_codegen`] drains any out-of-band patch callbacks queued
//! during the transaction before publishing the block's start address.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::null_mut;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};

use crate::util::{align_down, align_up};
use crate::virtual_memory::{
    self, flush_instruction_cache, protect_jit_memory, MemoryFlags, ProtectJitAccess,
};
use crate::Error;

/// Alignment granularity of every address the cache returns.
pub const CACHE_ALIGNMENT: usize = 8;

/// Size of the near region at the base of the arena.
pub const NEAR_REGION_SIZE: usize = 128 * 1024;

/// Largest permanent allocation that can be individually freed. Blocks at or
/// above this size are only reclaimed by a full [`CodeCache::flush`].
pub const MAX_PERMANENT_ALLOC: usize = 1024;

/// Hard ceiling on how far one codegen transaction, including all of its
/// out-of-band appends, may grow the scratch cursor.
pub const CODEGEN_MAX_BYTES: usize = 128 * 1024;

/// Default arena size.
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024 * 1024;

const NUM_FREE_LISTS: usize = MAX_PERMANENT_ALLOC / CACHE_ALIGNMENT + 1;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const DEFAULT_FILL_PATTERN: u32 = 0xCCCCCCCC; // int3
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
const DEFAULT_FILL_PATTERN: u32 = 0x0;

/// Deferred code-patch callback, invoked by [`CodeCache::end_codegen`] with a
/// live pointer to the scratch cursor. Code emitted through the cursor is
/// appended to the still-open transaction.
///
/// # Safety
/// The callback writes through raw pointers into the arena; it must only
/// advance the cursor past bytes it has actually written.
pub type OobCodegenFn =
    unsafe fn(codeptr: *mut *mut u8, param1: *mut c_void, param2: *mut c_void, param3: *mut c_void);

/// A queued out-of-band request. The record itself lives in the far region
/// and is returned to the far free list once the callback has run.
struct OobHandler {
    link: LinkedListLink,
    callback: OobCodegenFn,
    param1: *mut c_void,
    param2: *mut c_void,
    param3: *mut c_void,
}

intrusive_adapter!(OobQueueAdapter = UnsafeRef<OobHandler> : OobHandler { link: LinkedListLink });

/// Free-list node, reinterpreted in place from a freed block.
struct FreeLink {
    next: *mut FreeLink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeCacheOptions {
    /// Total arena size in bytes. Rounded up to the platform page size; must
    /// leave room for a far region beyond the fixed-size near region.
    pub size: usize,

    /// Fill the arena with a trap pattern at construction and refill the
    /// reclaimed regions on `flush()`, so jumps into stale code fault loudly.
    pub fill_unused_memory: bool,

    /// Fill pattern override. Defaults to `int3` bytes on x86 targets and
    /// zero elsewhere.
    pub custom_fill_pattern: Option<u32>,
}

impl Default for CodeCacheOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_CACHE_SIZE,
            fill_unused_memory: true,
            custom_fill_pattern: None,
        }
    }
}

/// A fixed-size executable-memory cache for one recompiler instance.
///
/// All returned pointers are raw addresses into the arena and stay valid
/// until the next [`flush`](Self::flush); the cache never moves or copies an
/// allocation. The cache is single-writer: it must only ever be driven by
/// the thread that owns the recompiled CPU, and the raw-pointer fields keep
/// it `!Send` and `!Sync` accordingly.
///
/// On hardened runtimes (Apple AArch64) the caller must bracket writes into
/// the arena with [`protect_jit_memory`] just as it would for any other JIT
/// mapping.
pub struct CodeCache {
    /// Fixed start of the arena and of the near region.
    near_base: *mut u8,
    /// Bump cursor for near allocations, grows toward `far_base`.
    near_top: *mut u8,
    /// Fixed boundary between the near region and the shared far/codegen
    /// space.
    far_base: *mut u8,
    /// Scratch cursor for generated code, grows upward from `far_base`.
    top: *mut u8,
    /// Bump-down cursor for permanent far allocations, shrinks from `limit`.
    end: *mut u8,
    /// Fixed end of the arena.
    limit: *mut u8,
    /// Start of the open codegen transaction, null while idle.
    codegen: *mut u8,
    size: usize,

    free: [*mut FreeLink; NUM_FREE_LISTS],
    nearfree: [*mut FreeLink; NUM_FREE_LISTS],

    oob_list: LinkedList<OobQueueAdapter>,

    options: CodeCacheOptions,
    fill_pattern: u32,
}

impl CodeCache {
    /// Acquires the arena from the platform and initializes all cursors.
    ///
    /// Returns a `Box` so the scratch cursor stays at a stable address for
    /// the live cursor handle handed out by [`begin_codegen`](Self::begin_codegen).
    pub fn new(options: CodeCacheOptions) -> Result<Box<Self>, Error> {
        let vm_info = virtual_memory::info();
        let size = align_up(options.size, vm_info.page_size as usize);

        if size <= NEAR_REGION_SIZE {
            return Err(Error::InvalidArgument);
        }

        let near_base = virtual_memory::alloc(
            size,
            MemoryFlags(MemoryFlags::ACCESS_RWX | MemoryFlags::MMAP_ENABLE_JIT),
        )?;

        let far_base = near_base.wrapping_add(NEAR_REGION_SIZE);
        let limit = near_base.wrapping_add(size);

        let fill_pattern = options.custom_fill_pattern.unwrap_or(DEFAULT_FILL_PATTERN);

        let cache = Box::new(Self {
            near_base,
            near_top: near_base,
            far_base,
            top: far_base,
            end: limit,
            limit,
            codegen: null_mut(),
            size,
            free: [null_mut(); NUM_FREE_LISTS],
            nearfree: [null_mut(); NUM_FREE_LISTS],
            oob_list: LinkedList::new(OobQueueAdapter::new()),
            options,
            fill_pattern,
        });

        if options.fill_unused_memory {
            unsafe {
                protect_jit_memory(ProtectJitAccess::ReadWrite);
                fill_with_pattern(near_base, fill_pattern, size);
                protect_jit_memory(ProtectJitAccess::ReadExecute);
                flush_instruction_cache(near_base, size);
            }
        }

        Ok(cache)
    }

    /// Base of the near region (and of the whole arena).
    pub fn near(&self) -> *mut u8 {
        self.near_base
    }

    /// Boundary between the near region and the far/codegen space.
    pub fn base(&self) -> *mut u8 {
        self.far_base
    }

    /// Current scratch cursor.
    pub fn top(&self) -> *mut u8 {
        self.top
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains_pointer(&self, ptr: *const u8) -> bool {
        ptr >= self.near_base as *const u8 && ptr < self.limit as *const u8
    }

    pub fn contains_near_pointer(&self, ptr: *const u8) -> bool {
        ptr >= self.near_base as *const u8 && ptr < self.far_base as *const u8
    }

    /// Invalidates the entire cache: resets all three cursors to their
    /// initial positions and clears both free-list tables. Every pointer the
    /// cache has ever returned becomes dangling; the recompiler must drop all
    /// references it holds before calling this.
    ///
    /// Panics if a codegen transaction is open, since that would invalidate
    /// the cursor the caller is actively writing through.
    pub fn flush(&mut self) {
        assert!(
            self.codegen.is_null(),
            "flush() while a codegen transaction is open"
        );
        assert!(self.oob_list.is_empty());

        self.near_top = self.near_base;
        self.top = self.far_base;
        self.end = self.limit;
        self.free = [null_mut(); NUM_FREE_LISTS];
        self.nearfree = [null_mut(); NUM_FREE_LISTS];

        if self.options.fill_unused_memory {
            unsafe {
                protect_jit_memory(ProtectJitAccess::ReadWrite);
                fill_with_pattern(self.near_base, self.fill_pattern, self.size);
                protect_jit_memory(ProtectJitAccess::ReadExecute);
                flush_instruction_cache(self.near_base, self.size);
            }
        }
    }

    /// Permanently allocates `bytes` from the far region.
    ///
    /// Small requests are served from the far free list when a block of the
    /// same size class is available; otherwise the bump-down cursor moves.
    /// Fails with `OutOfMemory` once the cursor would cross below the scratch
    /// region's current top — the cache is exhausted, not transiently busy.
    pub fn alloc(&mut self, bytes: usize) -> Result<*mut u8, Error> {
        assert!(bytes > 0);

        if bytes < MAX_PERMANENT_ALLOC {
            let index = (bytes + CACHE_ALIGNMENT - 1) / CACHE_ALIGNMENT;
            let head = self.free[index];

            if !head.is_null() {
                unsafe {
                    self.free[index] = (*head).next;
                }
                return Ok(head.cast());
            }
        }

        let Some(candidate) = (self.end as usize).checked_sub(bytes) else {
            return Err(Error::OutOfMemory);
        };
        let candidate = align_down(candidate, CACHE_ALIGNMENT) as *mut u8;

        // A candidate exactly at the scratch top is still usable.
        if candidate < self.top {
            return Err(Error::OutOfMemory);
        }

        self.end = candidate;
        Ok(candidate)
    }

    /// Permanently allocates `bytes` from the near region, for data that must
    /// be addressable via short displacements from generated code.
    pub fn alloc_near(&mut self, bytes: usize) -> Result<*mut u8, Error> {
        assert!(bytes > 0);

        if bytes < MAX_PERMANENT_ALLOC {
            let index = (bytes + CACHE_ALIGNMENT - 1) / CACHE_ALIGNMENT;
            let head = self.nearfree[index];

            if !head.is_null() {
                unsafe {
                    self.nearfree[index] = (*head).next;
                }
                return Ok(head.cast());
            }
        }

        let ptr = align_up(self.near_top as usize, CACHE_ALIGNMENT) as *mut u8;

        // Exactly filling the near region is fine; only overshoot fails.
        if bytes > self.far_base as usize - ptr as usize {
            return Err(Error::OutOfMemory);
        }

        self.near_top = (ptr as usize + bytes) as *mut u8;
        Ok(ptr)
    }

    /// Returns a permanent allocation to the free list of the region it
    /// physically resides in. The block's own bytes become the list node; no
    /// coalescing, nothing is returned to the OS.
    ///
    /// Panics if `bytes` is at or above [`MAX_PERMANENT_ALLOC`], or if `ptr`
    /// does not lie in either permanent region (scratch pointers in
    /// particular must never be passed here).
    pub fn dealloc(&mut self, ptr: *mut u8, bytes: usize) {
        assert!(bytes > 0);
        assert!(
            bytes < MAX_PERMANENT_ALLOC,
            "dealloc() of an oversized block"
        );

        let in_near = ptr >= self.near_base && ptr < self.far_base;
        let in_far = ptr >= self.end && ptr < self.limit;
        assert!(
            in_near || in_far,
            "dealloc() of a pointer outside the permanent regions"
        );

        let index = (bytes + CACHE_ALIGNMENT - 1) / CACHE_ALIGNMENT;
        let link = ptr as *mut FreeLink;
        let table = if in_near {
            &mut self.nearfree
        } else {
            &mut self.free
        };

        unsafe {
            (*link).next = table[index];
        }
        table[index] = link;
    }

    /// Allocates a short-lived working buffer from the scratch cursor. The
    /// buffer lives until the next codegen transaction or temporary
    /// allocation overwrites the region; it must never be referenced by
    /// generated code.
    ///
    /// Panics if a codegen transaction is open — interleaving the two would
    /// make the cursor's ownership ambiguous.
    pub fn alloc_temporary(&mut self, bytes: usize) -> Result<*mut u8, Error> {
        assert!(bytes > 0);
        assert!(
            self.codegen.is_null(),
            "alloc_temporary() during a codegen transaction"
        );

        let ptr = self.top;

        // One alignment slot at the far cursor stays reserved.
        if bytes >= self.end as usize - ptr as usize {
            return Err(Error::OutOfMemory);
        }

        self.top = align_up(ptr as usize + bytes, CACHE_ALIGNMENT) as *mut u8;
        Ok(ptr)
    }

    /// Opens a codegen transaction, reserving `reserve_bytes` of contiguous
    /// scratch space as the worst case for the block about to be generated.
    ///
    /// On success the cache is in the Generating state and the returned
    /// pointer aliases the scratch cursor itself — every byte the recompiler
    /// emits advances the authoritative cursor in real time. The block's
    /// start address is the cursor value at the moment of this call and is
    /// returned later by [`end_codegen`](Self::end_codegen).
    ///
    /// Fails with `OutOfMemory` when the reservation would reach the far
    /// region's cursor; the recompiler should flush and retry, or fall back
    /// to interpretation.
    ///
    /// Panics if a transaction is already open.
    pub fn begin_codegen(&mut self, reserve_bytes: usize) -> Result<*mut *mut u8, Error> {
        assert!(
            self.codegen.is_null(),
            "begin_codegen() while a transaction is already open"
        );
        assert!(self.oob_list.is_empty());

        let ptr = self.top;

        if reserve_bytes >= self.end as usize - ptr as usize {
            return Err(Error::OutOfMemory);
        }

        self.codegen = ptr;
        Ok(&mut self.top as *mut *mut u8)
    }

    /// Queues a deferred patch-or-append action to run at
    /// [`end_codegen`](Self::end_codegen), in registration order. Used for
    /// forward references and shared cold paths that cannot be resolved while
    /// the main instruction stream is being emitted linearly.
    ///
    /// The handler record is carved from the far region and freed back to its
    /// free list once consumed. Panics if no transaction is open.
    pub fn request_oob_codegen(
        &mut self,
        callback: OobCodegenFn,
        param1: *mut c_void,
        param2: *mut c_void,
        param3: *mut c_void,
    ) -> Result<(), Error> {
        assert!(
            !self.codegen.is_null(),
            "request_oob_codegen() outside a codegen transaction"
        );

        let record = self.alloc(size_of::<OobHandler>())? as *mut OobHandler;

        unsafe {
            record.write(OobHandler {
                link: LinkedListLink::new(),
                callback,
                param1,
                param2,
                param3,
            });
            self.oob_list.push_back(UnsafeRef::from_raw(record));
        }

        Ok(())
    }

    /// Closes the open transaction and returns the start address of the
    /// generated block, stable until the next [`flush`](Self::flush).
    ///
    /// Queued out-of-band callbacks run first, strictly in FIFO order, each
    /// receiving the live cursor so appended fixup code lands contiguously
    /// after the straight-line code. The scratch cursor is then rounded up to
    /// the alignment boundary.
    ///
    /// Panics if no transaction is open, or if the transaction grew past
    /// [`CODEGEN_MAX_BYTES`].
    pub fn end_codegen(&mut self) -> *mut u8 {
        assert!(
            !self.codegen.is_null(),
            "end_codegen() without begin_codegen()"
        );

        let result = self.codegen;

        while let Some(node) = self.oob_list.pop_front() {
            let record = UnsafeRef::into_raw(node);

            unsafe {
                let callback = (*record).callback;
                let param1 = (*record).param1;
                let param2 = (*record).param2;
                let param3 = (*record).param3;

                callback(&mut self.top, param1, param2, param3);
            }

            self.dealloc(record.cast(), size_of::<OobHandler>());
        }

        assert!(
            self.top as usize - result as usize <= CODEGEN_MAX_BYTES,
            "codegen transaction grew past CODEGEN_MAX_BYTES"
        );

        self.top = align_up(self.top as usize, CACHE_ALIGNMENT) as *mut u8;
        self.codegen = null_mut();

        result
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        // Queue nodes live inside the arena; the arena goes away wholesale.
        self.oob_list.fast_clear();
        let _ = virtual_memory::release(self.near_base, self.size);
    }
}

#[inline]
unsafe fn fill_with_pattern(mem: *mut u8, pattern: u32, size_in_bytes: usize) {
    let n = size_in_bytes / 4;

    let p = mem as *mut u32;

    for i in 0..n {
        p.add(i).write(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_FAR_SIZE: usize = 64 * 1024;

    fn test_cache(size: usize) -> Box<CodeCache> {
        CodeCache::new(CodeCacheOptions {
            size,
            ..Default::default()
        })
        .unwrap()
    }

    fn small_cache() -> Box<CodeCache> {
        test_cache(NEAR_REGION_SIZE + TEST_FAR_SIZE)
    }

    #[test]
    fn permanent_allocations_are_aligned() {
        let mut cache = test_cache(1024 * 1024);

        for bytes in [1, 3, 8, 13, 100, 1000, 4096] {
            let far = cache.alloc(bytes).unwrap();
            let near = cache.alloc_near(bytes).unwrap();

            assert_eq!(far as usize % CACHE_ALIGNMENT, 0);
            assert_eq!(near as usize % CACHE_ALIGNMENT, 0);
            assert!(cache.contains_pointer(far));
            assert!(cache.contains_near_pointer(near));
        }
    }

    #[test]
    fn free_list_reuse_returns_identical_address() {
        let mut cache = test_cache(1024 * 1024);

        let far = cache.alloc(64).unwrap();
        let end_before = cache.end;
        cache.dealloc(far, 64);
        assert_eq!(cache.alloc(64).unwrap(), far);
        // Served from the free list, not by moving the bump cursor.
        assert_eq!(cache.end, end_before);

        let near = cache.alloc_near(24).unwrap();
        let near_top_before = cache.near_top;
        cache.dealloc(near, 24);
        assert_eq!(cache.alloc_near(24).unwrap(), near);
        assert_eq!(cache.near_top, near_top_before);
    }

    #[test]
    fn empty_transaction_leaves_cursor_in_place() {
        let mut cache = small_cache();

        let before = cache.top;
        cache.begin_codegen(1024).unwrap();
        let start = cache.end_codegen();

        assert_eq!(start, before);
        assert_eq!(cache.top, before);
    }

    #[test]
    fn emission_through_live_cursor_advances_cache_state() {
        let mut cache = small_cache();

        let before = cache.top;
        let cursor = cache.begin_codegen(256).unwrap();

        unsafe {
            protect_jit_memory(ProtectJitAccess::ReadWrite);
            for byte in [0x90u8, 0x90, 0xC3] {
                (*cursor).write(byte);
                *cursor = (*cursor).add(1);
            }
            protect_jit_memory(ProtectJitAccess::ReadExecute);
        }

        let start = cache.end_codegen();

        assert_eq!(start, before);
        assert_eq!(cache.top as usize, align_up(before as usize + 3, CACHE_ALIGNMENT));
    }

    unsafe fn emit_marker(codeptr: *mut *mut u8, p1: *mut c_void, _p2: *mut c_void, _p3: *mut c_void) {
        let top = *codeptr;
        top.write(p1 as usize as u8);
        *codeptr = top.add(1);
    }

    #[test]
    fn oob_callbacks_run_in_fifo_order() {
        let mut cache = small_cache();

        cache.begin_codegen(256).unwrap();

        protect_jit_memory(ProtectJitAccess::ReadWrite);

        for marker in 1usize..=4 {
            cache
                .request_oob_codegen(emit_marker, marker as *mut c_void, null_mut(), null_mut())
                .unwrap();
        }

        let start = cache.end_codegen();
        protect_jit_memory(ProtectJitAccess::ReadExecute);

        unsafe {
            for (offset, expected) in (1u8..=4).enumerate() {
                assert_eq!(start.add(offset).read(), expected);
            }
        }
    }

    #[test]
    fn oob_records_return_to_the_far_free_list() {
        let mut cache = small_cache();

        cache.begin_codegen(64).unwrap();
        cache
            .request_oob_codegen(emit_marker, 1 as *mut c_void, null_mut(), null_mut())
            .unwrap();

        protect_jit_memory(ProtectJitAccess::ReadWrite);
        cache.end_codegen();
        protect_jit_memory(ProtectJitAccess::ReadExecute);

        let index = (size_of::<OobHandler>() + CACHE_ALIGNMENT - 1) / CACHE_ALIGNMENT;
        assert!(!cache.free[index].is_null());
    }

    #[test]
    fn far_alloc_may_meet_the_scratch_top_exactly() {
        let mut cache = small_cache();

        cache.alloc_temporary(TEST_FAR_SIZE / 2).unwrap();
        assert_eq!(cache.top, cache.far_base.wrapping_add(TEST_FAR_SIZE / 2));

        // The bump-down candidate lands exactly on the scratch cursor.
        let ptr = cache.alloc(TEST_FAR_SIZE / 2).unwrap();
        assert_eq!(ptr, cache.top);
    }

    #[test]
    fn far_alloc_fails_once_it_would_cross_the_scratch_top() {
        let mut cache = small_cache();

        cache.alloc_temporary(TEST_FAR_SIZE - 64).unwrap();

        assert_eq!(cache.alloc(2048), Err(Error::OutOfMemory));

        // Still room for something that fits above the cursor.
        assert!(cache.alloc(32).is_ok());
    }

    #[test]
    fn temporary_alloc_must_stay_below_far_end() {
        let mut cache = small_cache();

        // Reaching far_end exactly fails; one alignment slot short succeeds.
        assert_eq!(
            cache.alloc_temporary(TEST_FAR_SIZE),
            Err(Error::OutOfMemory)
        );
        assert!(cache.alloc_temporary(TEST_FAR_SIZE - CACHE_ALIGNMENT).is_ok());
    }

    #[test]
    fn address_space_sized_requests_fail_recoverably() {
        let mut cache = small_cache();

        // Requests near usize::MAX must exhaust, not wrap the bound check.
        assert_eq!(cache.alloc_near(usize::MAX - 7), Err(Error::OutOfMemory));
        assert_eq!(cache.alloc_temporary(usize::MAX - 7), Err(Error::OutOfMemory));
        assert_eq!(cache.begin_codegen(usize::MAX - 7), Err(Error::OutOfMemory));
        assert_eq!(cache.alloc(usize::MAX - 7), Err(Error::OutOfMemory));

        // Cursors are undisturbed: the next allocations land inside the arena.
        let near = cache.alloc_near(16).unwrap();
        assert_eq!(near, cache.near_base);
        assert!(cache.contains_near_pointer(near));

        assert_eq!(cache.top, cache.far_base);
        cache.begin_codegen(64).unwrap();
        cache.end_codegen();
    }

    #[test]
    fn near_region_can_be_filled_exactly() {
        let mut cache = small_cache();

        let ptr = cache.alloc_near(NEAR_REGION_SIZE).unwrap();
        assert_eq!(ptr, cache.near_base);

        assert_eq!(cache.alloc_near(1), Err(Error::OutOfMemory));
    }

    #[test]
    fn codegen_reservation_failure_is_recoverable() {
        let mut cache = small_cache();

        assert_eq!(cache.begin_codegen(TEST_FAR_SIZE), Err(Error::OutOfMemory));

        // The cache stayed idle, so a smaller reservation still works.
        cache.begin_codegen(64).unwrap();
        cache.end_codegen();
    }

    #[test]
    fn flush_restores_fresh_construction_behavior() {
        let mut cache = small_cache();

        let near_first = cache.alloc_near(100).unwrap();
        let far_first = cache.alloc(100).unwrap();
        cache.alloc_temporary(200).unwrap();
        cache.dealloc(far_first, 100);

        cache.flush();

        assert_eq!(cache.near_top, cache.near_base);
        assert_eq!(cache.top, cache.far_base);
        assert_eq!(cache.end, cache.limit);
        assert!(cache.free.iter().all(|p| p.is_null()));
        assert!(cache.nearfree.iter().all(|p| p.is_null()));

        assert_eq!(cache.alloc_near(100).unwrap(), near_first);
        assert_eq!(cache.alloc(100).unwrap(), far_first);
    }

    #[test]
    #[should_panic(expected = "oversized block")]
    fn dealloc_of_oversized_block_is_fatal() {
        let mut cache = small_cache();

        let ptr = cache.alloc(MAX_PERMANENT_ALLOC * 2).unwrap();
        cache.dealloc(ptr, MAX_PERMANENT_ALLOC);
    }

    #[test]
    #[should_panic(expected = "outside the permanent regions")]
    fn dealloc_of_scratch_pointer_is_fatal() {
        let mut cache = small_cache();

        let ptr = cache.alloc_temporary(64).unwrap();
        cache.dealloc(ptr, 64);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn nested_codegen_transaction_is_fatal() {
        let mut cache = small_cache();

        cache.begin_codegen(64).unwrap();
        let _ = cache.begin_codegen(64);
    }

    #[test]
    #[should_panic(expected = "while a codegen transaction is open")]
    fn flush_during_codegen_is_fatal() {
        let mut cache = small_cache();

        cache.begin_codegen(64).unwrap();
        cache.flush();
    }

    #[test]
    #[should_panic(expected = "CODEGEN_MAX_BYTES")]
    fn transaction_growth_past_the_ceiling_is_fatal() {
        let mut cache = test_cache(NEAR_REGION_SIZE + 2 * CODEGEN_MAX_BYTES);

        let cursor = cache.begin_codegen(64).unwrap();

        unsafe {
            *cursor = (*cursor).add(CODEGEN_MAX_BYTES + CACHE_ALIGNMENT);
        }

        cache.end_codegen();
    }

    #[test]
    #[should_panic(expected = "during a codegen transaction")]
    fn temporary_alloc_during_codegen_is_fatal() {
        let mut cache = small_cache();

        cache.begin_codegen(64).unwrap();
        let _ = cache.alloc_temporary(64);
    }
}
