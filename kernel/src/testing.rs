//! Тестовая «физическая память» / Host-side stand-in for physical memory

extern crate std;

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::{config::PAGE_SIZE, KernelMemory};

/// Page-aligned block of host memory, freed on drop.
pub(crate) struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    pub(crate) fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("arena allocation");
        Self { base, layout }
    }

    pub(crate) fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn end(&self) -> usize {
        self.start() + self.layout.size()
    }

    pub(crate) fn frame(&self, i: usize) -> usize {
        self.start() + i * PAGE_SIZE
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A `KernelMemory` initialised over the whole arena.
pub(crate) fn booted(arena: &Arena) -> KernelMemory {
    let memory = KernelMemory::new();
    unsafe { memory.init(arena.start(), arena.end()) }.unwrap();
    memory
}
