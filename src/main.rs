use core::ffi::c_void;
use core::ptr::null_mut;

use drc_cache::{protect_jit_memory, CodeCache, CodeCacheOptions, ProtectJitAccess};

unsafe fn emit_cold_path(codeptr: *mut *mut u8, param1: *mut c_void, _: *mut c_void, _: *mut c_void) {
    let mut top = *codeptr;

    for _ in 0..param1 as usize {
        top.write(0x90); // nop
        top = top.add(1);
    }

    *codeptr = top;
}

fn main() {
    let mut cache = CodeCache::new(CodeCacheOptions::default()).unwrap();

    let near = cache.alloc_near(64).unwrap();
    let state = cache.alloc(256).unwrap();

    println!("near data at {:p}, state block at {:p}", near, state);

    let cursor = cache.begin_codegen(4096).unwrap();

    protect_jit_memory(ProtectJitAccess::ReadWrite);

    unsafe {
        // Straight-line code first; the cold path is appended out-of-band.
        for _ in 0..16 {
            (*cursor).write(0x90);
            *cursor = (*cursor).add(1);
        }
    }

    cache
        .request_oob_codegen(emit_cold_path, 8 as *mut c_void, null_mut(), null_mut())
        .unwrap();

    let block = cache.end_codegen();

    protect_jit_memory(ProtectJitAccess::ReadExecute);

    println!(
        "generated block at {:p}, scratch cursor now at {:p}",
        block,
        cache.top()
    );

    cache.dealloc(state, 256);
    let reused = cache.alloc(256).unwrap();
    println!("freed and reused state block at {:p}", reused);

    cache.flush();
    println!("flushed; scratch cursor back at {:p}", cache.top());
}
