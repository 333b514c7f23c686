//! Kernel Heap: `GlobalAlloc` поверх slab'ов и страниц
//!
//! Маленькие выравненные на 8 объекты идут в slab'ы, остальное целыми
//! страницами. Small objects aligned to at most 8 go to the slabs; anything
//! else is served as consecutive whole pages.
//!
//! ```ignore
//! static MEMORY: KernelMemory = KernelMemory::new();
//!
//! #[global_allocator]
//! static HEAP: KernelHeap<'static> = KernelHeap::new(&MEMORY);
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use log::error;

use super::KernelMemory;
use crate::config::{MAX_SLAB_SIZE, PAGE_SIZE, SLOT_GRANULARITY};

/// Where a layout is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Slab,
    Pages(usize),
    Unsupported,
}

impl Route {
    fn of(layout: Layout) -> Self {
        if layout.size() <= MAX_SLAB_SIZE && layout.align() <= SLOT_GRANULARITY {
            Route::Slab
        } else if layout.align() <= PAGE_SIZE {
            Route::Pages(layout.size().div_ceil(PAGE_SIZE).max(1))
        } else {
            Route::Unsupported
        }
    }
}

pub struct KernelHeap<'a> {
    memory: &'a KernelMemory,
}

impl<'a> KernelHeap<'a> {
    pub const fn new(memory: &'a KernelMemory) -> Self {
        Self { memory }
    }
}

unsafe impl GlobalAlloc for KernelHeap<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let memory = self.memory;
        let block = match Route::of(layout) {
            Route::Slab => memory.slabs().allocate(memory.pages(), layout.size()),
            Route::Pages(count) => memory.pages().allocate_pages(count),
            Route::Unsupported => return ptr::null_mut(),
        };
        block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(block) = NonNull::new(ptr) else { return };
        let memory = self.memory;
        // SAFETY: GlobalAlloc contract: `ptr` came from `alloc` with `layout`.
        let freed = unsafe {
            match Route::of(layout) {
                Route::Slab => memory.slabs().free(memory.pages(), block),
                Route::Pages(count) => memory.pages().free_pages_run(block, count),
                Route::Unsupported => return,
            }
        };
        if let Err(e) = freed {
            error!("heap: dealloc size={} align={}: {}", layout.size(), layout.align(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{booted, Arena};

    #[test]
    fn routing() {
        let layout = |size, align| Layout::from_size_align(size, align).unwrap();
        assert_eq!(Route::of(layout(24, 8)), Route::Slab);
        assert_eq!(Route::of(layout(MAX_SLAB_SIZE, 4)), Route::Slab);
        assert_eq!(Route::of(layout(32, 16)), Route::Pages(1));
        assert_eq!(Route::of(layout(MAX_SLAB_SIZE + 1, 8)), Route::Pages(1));
        assert_eq!(Route::of(layout(3 * PAGE_SIZE + 1, 8)), Route::Pages(4));
        assert_eq!(Route::of(layout(64, 2 * PAGE_SIZE)), Route::Unsupported);
    }

    #[test]
    fn alloc_and_dealloc_both_routes() {
        let arena = Arena::new(8);
        let memory = booted(&arena);
        let heap = KernelHeap::new(&memory);

        let small = Layout::from_size_align(48, 8).unwrap();
        let big = Layout::from_size_align(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            let a = heap.alloc(small);
            let b = heap.alloc(big);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(b as usize % PAGE_SIZE, 0);
            assert_eq!(memory.pages().allocated_pages(), 3);

            heap.dealloc(a, small);
            heap.dealloc(b, big);
        }
        assert_eq!(memory.pages().allocated_pages(), 0);
    }

    #[test]
    fn zeroed_alloc() {
        let arena = Arena::new(2);
        let memory = booted(&arena);
        let heap = KernelHeap::new(&memory);
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let p = heap.alloc_zeroed(layout);
            assert!(core::slice::from_raw_parts(p, 64).iter().all(|&b| b == 0));
            heap.dealloc(p, layout);
        }
    }

    #[test]
    fn huge_alignment_is_refused() {
        let arena = Arena::new(2);
        let memory = booted(&arena);
        let heap = KernelHeap::new(&memory);
        let layout = Layout::from_size_align(64, 2 * PAGE_SIZE).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(memory.pages().allocated_pages(), 0);
    }
}
