//! Граница ядра на сырых указателях / Raw-pointer kernel interface
//!
//! Null означает «нет памяти»; null на входе `kfree*` ничего не делает.
//! Null means "no memory"; a null argument to `kfree*` is a no-op.
//!
//! A free the allocators reject is a kernel bug: debug builds panic, release
//! builds log it and carry on with state untouched.

use core::ptr::{self, NonNull};

use log::warn;

use super::KernelMemory;
use crate::error::AllocError;

fn invalid_free(err: AllocError) {
    if cfg!(debug_assertions) {
        panic!("invalid free: {}", err);
    }
    warn!("ignoring invalid free: {}", err);
}

/// Выделить страницу / Allocate one page, or null
pub fn kalloc_page(memory: &KernelMemory) -> *mut u8 {
    match memory.pages().allocate_page() {
        Some(frame) => frame.as_ptr(),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `page` must be null or a page from `kalloc_page` on `memory` that is not
/// used again.
pub unsafe fn kfree_page(memory: &KernelMemory, page: *mut u8) {
    let Some(page) = NonNull::new(page) else { return };
    // SAFETY: forwarded caller contract.
    if let Err(e) = unsafe { memory.free_page(page) } {
        invalid_free(e);
    }
}

/// Выделить объект / Allocate `size` bytes from the slabs, or null
pub fn kalloc(memory: &KernelMemory, size: usize) -> *mut u8 {
    match memory.slabs().allocate(memory.pages(), size) {
        Ok(obj) => obj.as_ptr(),
        Err(AllocError::Oversize { size, max }) => {
            warn!("kalloc: {} bytes is above the {}-byte slab limit", size, max);
            ptr::null_mut()
        }
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
/// `obj` must be null or an object from `kalloc` on `memory` that is not
/// used again.
pub unsafe fn kfree(memory: &KernelMemory, obj: *mut u8) {
    let Some(obj) = NonNull::new(obj) else { return };
    // SAFETY: forwarded caller contract.
    if let Err(e) = unsafe { memory.free(obj) } {
        invalid_free(e);
    }
}
