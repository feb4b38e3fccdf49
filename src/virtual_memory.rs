//! Platform service for executable memory: allocate, protect and release
//! pages, plus the instruction-cache maintenance that non-x86 targets need
//! after code has been written.

#![allow(unused_imports)]
#[cfg(not(windows))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::Error;

/// Virtual memory information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    /// The size of a page of virtual memory.
    pub page_size: u32,
    /// The granularity of a page of virtual memory.
    pub page_granularity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemoryFlags(pub u32);

impl MemoryFlags {
    /// Memory is readable.
    pub const ACCESS_READ: u32 = 0x00000001;

    /// Memory is writable.
    pub const ACCESS_WRITE: u32 = 0x00000002;

    /// Memory is executable.
    pub const ACCESS_EXECUTE: u32 = 0x00000004;

    /// Memory is readable and writable.
    pub const ACCESS_RW: u32 = Self::ACCESS_READ | Self::ACCESS_WRITE;

    /// Memory is readable and executable.
    pub const ACCESS_RX: u32 = Self::ACCESS_READ | Self::ACCESS_EXECUTE;

    /// Memory is readable, writable and executable.
    pub const ACCESS_RWX: u32 =
        Self::ACCESS_READ | Self::ACCESS_WRITE | Self::ACCESS_EXECUTE;

    /// Use a `MAP_JIT` flag available on Apple platforms (introduced by Mojave), which allows JIT code to be
    /// executed in a MAC bundle.
    ///
    /// This flag may be turned on by the allocator if there is no other way of allocating executable memory.
    pub const MMAP_ENABLE_JIT: u32 = 0x00000010;
}

impl MemoryFlags {
    pub fn contains(self, other: u32) -> bool {
        (self.0 & other) != 0
    }
}

/// Values that can be used with the [`protect_jit_memory`] function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ProtectJitAccess {
    /// Protect JIT memory with Read+Write permissions.
    ReadWrite = 0,
    /// Protect JIT memory with Read+Execute permissions.
    ReadExecute = 1,
}

use errno::errno;
#[cfg(not(windows))]
use libc::*;

cfgenius::cond! {
    if cfg(not(windows)) {
        fn error_from_errno() -> Error {
            match errno().0 {
                EACCES
                | EAGAIN
                | ENODEV
                | EPERM => Error::InvalidState,
                EFBIG
                | ENOMEM
                | EOVERFLOW => Error::OutOfMemory,
                _ => Error::InvalidArgument
            }
        }

        fn get_vm_info() -> Info {
            extern "C" {
                fn getpagesize() -> c_int;
            }

            let page_size = unsafe { getpagesize() as usize };

            Info {
                page_size: page_size as _,
                page_granularity: 65536.max(page_size) as _,
            }
        }

        fn mm_prot_from_memory_flags(memory_flags: MemoryFlags) -> i32 {
            let mut prot = 0;

            let x = memory_flags;
            if x.contains(MemoryFlags::ACCESS_READ) { prot |= PROT_READ }
            if x.contains(MemoryFlags::ACCESS_WRITE) { prot |= PROT_WRITE }
            if x.contains(MemoryFlags::ACCESS_EXECUTE) { prot |= PROT_EXEC }

            prot
        }
    } else {
        fn get_vm_info() -> Info {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

            unsafe {
                let mut info: SYSTEM_INFO = core::mem::zeroed();
                GetSystemInfo(&mut info);

                Info {
                    page_size: info.dwPageSize,
                    page_granularity: info.dwAllocationGranularity,
                }
            }
        }

        fn win_protect_from_memory_flags(memory_flags: MemoryFlags) -> u32 {
            use winapi::um::winnt::*;

            let x = memory_flags;

            if x.contains(MemoryFlags::ACCESS_EXECUTE) {
                if x.contains(MemoryFlags::ACCESS_WRITE) {
                    PAGE_EXECUTE_READWRITE
                } else if x.contains(MemoryFlags::ACCESS_READ) {
                    PAGE_EXECUTE_READ
                } else {
                    PAGE_EXECUTE
                }
            } else if x.contains(MemoryFlags::ACCESS_WRITE) {
                PAGE_READWRITE
            } else if x.contains(MemoryFlags::ACCESS_READ) {
                PAGE_READONLY
            } else {
                PAGE_NOACCESS
            }
        }
    }
}

/// Detects whether the current process is hardened, which means that pages that have WRITE and EXECUTABLE flags
/// cannot be normally allocated. On OSX + AArch64 such allocation requires MAP_JIT flag, other platforms don't
/// support this combination.
#[cfg(not(windows))]
pub fn has_hardened_runtime() -> bool {
    cfgenius::cond! {
        if cfg(all(target_os="macos", target_arch="aarch64")) {
            true
        } else {
            static GLOBAL_HARDENED_FLAG: AtomicU32 = AtomicU32::new(0);

            let mut flag = GLOBAL_HARDENED_FLAG.load(Ordering::Acquire);

            if flag == 0 {
                let page_size = info().page_size;

                unsafe {
                    let ptr = libc::mmap(std::ptr::null_mut(), page_size as _, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0);

                    if ptr == libc::MAP_FAILED {
                        flag = 2;
                    } else {
                        flag = 1;
                        libc::munmap(ptr, page_size as _);
                    }
                }

                GLOBAL_HARDENED_FLAG.store(flag, Ordering::Release);
            }

            return flag == 2;
        }
    }
}

pub const fn has_map_jit_support() -> bool {
    cfgenius::cond! {
        if cfg(all(target_os="macos", target_arch="aarch64")) {
            true
        } else {
            false
        }
    }
}

#[cfg(not(windows))]
fn map_jit_from_memory_flags(memory_flags: MemoryFlags) -> i32 {
    cfgenius::cond! {
        if cfg(target_vendor="apple") {
            // Always use MAP_JIT flag if user asked for it (could be used for testing on non-hardened processes) and detect
            // whether it must be used when the process is actually hardened (in that case it doesn't make sense to rely on
            // user `memory_flags`).
            let use_map_jit = memory_flags.contains(MemoryFlags::MMAP_ENABLE_JIT) || has_hardened_runtime();

            if use_map_jit && has_map_jit_support() {
                return libc::MAP_JIT as i32;
            } else {
                return 0;
            }
        } else {
            let _ = memory_flags;
            return 0;
        }
    }
}

/// Allocates `size` bytes of virtual memory with the requested access flags.
pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
    if size == 0 {
        return Err(Error::InvalidArgument);
    }

    cfgenius::cond! {
        if cfg(not(windows)) {
            let protection = mm_prot_from_memory_flags(memory_flags);
            let mm_flags = map_jit_from_memory_flags(memory_flags)
                | libc::MAP_PRIVATE
                | libc::MAP_ANONYMOUS;

            unsafe {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    size as _,
                    protection,
                    mm_flags,
                    -1,
                    0,
                );

                if ptr == libc::MAP_FAILED {
                    return Err(error_from_errno());
                }

                Ok(ptr.cast())
            }
        } else {
            use winapi::um::memoryapi::VirtualAlloc;
            use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE};

            unsafe {
                let ptr = VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    win_protect_from_memory_flags(memory_flags),
                );

                if ptr.is_null() {
                    return Err(Error::OutOfMemory);
                }

                Ok(ptr.cast())
            }
        }
    }
}

/// Releases virtual memory previously allocated by [`alloc`].
pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
    if size == 0 {
        return Err(Error::InvalidArgument);
    }

    cfgenius::cond! {
        if cfg(not(windows)) {
            unsafe {
                if libc::munmap(ptr.cast(), size as _) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        } else {
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;

            unsafe {
                let _ = size;
                if VirtualFree(ptr.cast(), 0, MEM_RELEASE) != 0 {
                    Ok(())
                } else {
                    Err(Error::InvalidArgument)
                }
            }
        }
    }
}

/// Changes the access flags of memory previously allocated by [`alloc`].
pub fn protect(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
    cfgenius::cond! {
        if cfg(not(windows)) {
            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                if libc::mprotect(p.cast(), size as _, protection) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        } else {
            use winapi::um::memoryapi::VirtualProtect;

            unsafe {
                let mut old = 0;
                if VirtualProtect(p.cast(), size, win_protect_from_memory_flags(memory_flags), &mut old) != 0 {
                    Ok(())
                } else {
                    Err(Error::InvalidArgument)
                }
            }
        }
    }
}

/// Flushes instruction cache in the given region.
///
/// Only useful on non-x86 architectures, however, it's a good practice to call it on any platform to make your
/// code more portable.
pub fn flush_instruction_cache(p: *const u8, size: usize) {
    cfgenius::cond! {
        if cfg(any(target_arch="x86", target_arch="x86_64")) {
            let _ = p;
            let _ = size;
        } else if cfg(target_vendor="apple") {
            extern "C" {
                fn sys_icache_invalidate(p: *const u8, size: usize);
            }

            unsafe {
                sys_icache_invalidate(p, size);
            }
        } else if cfg(windows) {
            extern "C" {
                fn GetCurrentProcess() -> *mut libc::c_void;
                fn FlushInstructionCache(
                    proc: *mut libc::c_void,
                    lp: *const u8,
                    dw_size: usize,
                ) -> i32;
            }

            unsafe {
                FlushInstructionCache(GetCurrentProcess(), p, size);
            }
        } else if cfg(target_arch="aarch64")
            {
                let code = p as usize;
                let end = code + size;

                use core::arch::asm;

                const ICACHE_LINE_SIZE: usize = 4;
                const DCACHE_LINE_SIZE: usize = 4;

                let mut addr = code & (DCACHE_LINE_SIZE - 1);

                while addr < end {
                    unsafe {
                        asm!("dc civac {}", in(reg) addr);
                    }
                    addr += ICACHE_LINE_SIZE;
                }

                unsafe {
                    asm!("dsb ish");
                }

                addr = code & (ICACHE_LINE_SIZE - 1);

                while addr < end {
                    unsafe {
                        asm!("ic ivau {}", in(reg) addr);
                    }
                    addr += ICACHE_LINE_SIZE;
                }

                unsafe {
                    asm!(
                        "dsb ish"
                    );
                    asm!(
                        "isb"
                    );
                }

            } else if cfg(target_arch="riscv64") {
                unsafe {
                    let _ = wasmtime_jit_icache_coherence::clear_cache(p.cast(), size);
                    let _ = wasmtime_jit_icache_coherence::pipeline_flush_mt();
                }
            } else {
                let _ = p;
                let _ = size;
            }
    }
}

pub fn info() -> Info {
    static INFO: once_cell::sync::Lazy<Info> = once_cell::sync::Lazy::new(|| {
        get_vm_info()
    });

    *INFO
}

/// Protects access of memory mapped with MAP_JIT flag for the current thread.
///
/// # Note
/// This feature is only available on Apple hardware (AArch64) at the moment and uses a non-portable
/// `pthread_jit_write_protect_np()` call when available.
///
/// This function must be called before and after a memory mapped with MAP_JIT flag is modified. Example:
///
/// ```ignore
/// let code_ptr = ...;
/// let code_size = ...;
///
/// protect_jit_memory(ProtectJitAccess::ReadWrite);
/// copy_nonoverlapping(source, code_ptr, code_size);
/// protect_jit_memory(ProtectJitAccess::ReadExecute);
/// flush_instruction_cache(code_ptr, code_size);
///
/// ```
pub fn protect_jit_memory(access: ProtectJitAccess) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        unsafe {
            let x = match access {
                ProtectJitAccess::ReadWrite => 0,
                _ => 1,
            };

            libc::pthread_jit_write_protect_np(x);
        }
    }
    let _ = access;
}
