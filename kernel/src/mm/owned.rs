//! Владеющие обёртки / Owning handles for allocated memory
//!
//! Дроп возвращает память аллокатору, поэтому двойное освобождение через
//! эти типы невозможно. Dropping a handle frees its memory.
//!
//! `into_raw` hands ownership over to code speaking raw pointers; `from_raw`
//! takes it back.

use core::{fmt, mem, ptr::NonNull, slice};

use log::error;

use super::{pmm::PageAllocator, KernelMemory};
use crate::config::PAGE_SIZE;

/// Одна страница / One allocated frame
pub struct Page<'a> {
    frame: NonNull<u8>,
    pages: &'a PageAllocator,
}

// The frame is exclusively ours; the allocator is `Sync`.
unsafe impl Send for Page<'_> {}

impl<'a> Page<'a> {
    /// # Safety
    /// `frame` must be a frame of `pages` owned by the caller.
    pub unsafe fn from_raw(pages: &'a PageAllocator, frame: NonNull<u8>) -> Self {
        Self { frame, pages }
    }

    /// Give up ownership without freeing.
    pub fn into_raw(self) -> NonNull<u8> {
        let frame = self.frame;
        mem::forget(self);
        frame
    }

    pub fn addr(&self) -> usize {
        self.frame.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.frame.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: we own PAGE_SIZE bytes at `frame`.
        unsafe { slice::from_raw_parts(self.frame.as_ptr(), PAGE_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { slice::from_raw_parts_mut(self.frame.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for Page<'_> {
    fn drop(&mut self) {
        // SAFETY: we own the frame and nobody can reach it after this.
        if let Err(e) = unsafe { self.pages.free_page(self.frame) } {
            error!("pmm: dropping page {:#x}: {}", self.addr(), e);
        }
    }
}

impl fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.addr())
    }
}

/// Серия соседних страниц / A run of consecutive frames
pub struct PageRun<'a> {
    base: NonNull<u8>,
    count: usize,
    pages: &'a PageAllocator,
}

unsafe impl Send for PageRun<'_> {}

impl<'a> PageRun<'a> {
    /// # Safety
    /// `base..base + count * PAGE_SIZE` must be frames of `pages` owned by the caller.
    pub unsafe fn from_raw(pages: &'a PageAllocator, base: NonNull<u8>, count: usize) -> Self {
        Self { base, count, pages }
    }

    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.base, self.count);
        mem::forget(self);
        raw
    }

    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.count * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the run is ours and contiguous.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, exclusive through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len()) }
    }
}

impl Drop for PageRun<'_> {
    fn drop(&mut self) {
        // SAFETY: we own the run.
        if let Err(e) = unsafe { self.pages.free_pages_run(self.base, self.count) } {
            error!("pmm: dropping run {:#x} x{}: {}", self.addr(), self.count, e);
        }
    }
}

impl fmt::Debug for PageRun<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageRun({:#x} x{})", self.addr(), self.count)
    }
}

/// Объект из slab'а / One slab-allocated object
pub struct Object<'a> {
    ptr: NonNull<u8>,
    size: usize,
    memory: &'a KernelMemory,
}

unsafe impl Send for Object<'_> {}

impl<'a> Object<'a> {
    /// # Safety
    /// `ptr` must be a live object of `memory` of at least `size` bytes,
    /// owned by the caller.
    pub unsafe fn from_raw(memory: &'a KernelMemory, ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size, memory }
    }

    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Requested size, which may be less than the slot.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the slot holds at least `size` bytes.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, exclusive through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for Object<'_> {
    fn drop(&mut self) {
        // SAFETY: we own the object.
        if let Err(e) = unsafe { self.memory.free(self.ptr) } {
            error!("slab: dropping object {:#x}: {}", self.addr(), e);
        }
    }
}

impl fmt::Debug for Object<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:#x}, {} bytes)", self.addr(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{booted, Arena};

    #[test]
    fn page_drop_frees() {
        let arena = Arena::new(2);
        let memory = booted(&arena);
        {
            let mut page = memory.allocate_page().unwrap();
            page.as_mut_slice().fill(0x11);
            assert_eq!(memory.pages().allocated_pages(), 1);
        }
        assert_eq!(memory.pages().allocated_pages(), 0);
    }

    #[test]
    fn into_raw_and_back() {
        let arena = Arena::new(2);
        let memory = booted(&arena);

        let raw = memory.allocate(40).unwrap().into_raw();
        assert_eq!(memory.slab_stats().live_objects, 1);
        let obj = unsafe { super::Object::from_raw(&memory, raw, 40) };
        assert_eq!(obj.addr(), raw.as_ptr() as usize);
        drop(obj);
        assert_eq!(memory.slab_stats().live_objects, 0);
        assert_eq!(memory.pages().allocated_pages(), 0);
    }

    #[test]
    fn run_drop_frees_every_frame() {
        let arena = Arena::new(4);
        let memory = booted(&arena);
        {
            let mut run = memory.allocate_pages(3).unwrap();
            assert_eq!(run.count(), 3);
            run.as_mut_slice().fill(0x22);
            assert_eq!(memory.pages().allocated_pages(), 3);
        }
        assert_eq!(memory.pages().allocated_pages(), 0);
        assert_eq!(memory.pages().free_pages(), 4);
    }

    #[test]
    fn object_slice_is_requested_size() {
        let arena = Arena::new(1);
        let memory = booted(&arena);
        let mut obj = memory.allocate(13).unwrap();
        obj.as_mut_slice().copy_from_slice(b"hello, kernel");
        assert_eq!(obj.as_slice(), b"hello, kernel");
        assert_eq!(obj.size(), 13);
    }
}
