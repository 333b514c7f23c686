//! Memory Management subsystem
//!
//! Два уровня / Two layers:
//!   pmm   Physical Page Allocator (LIFO список страниц / LIFO frame list)
//!   slab  Slab Object Allocator (размерные классы / size classes on pmm frames)
//!
//! Порядок блокировок / Lock order: slab → pmm. The page allocator never calls
//! back into the slab allocator, and neither lock is reentrant.

pub mod heap;
mod link;
pub mod owned;
pub mod pmm;
#[cfg(feature = "poison")]
pub mod poison;
pub mod raw;
pub mod slab;

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::error::Result;
use owned::{Object, Page, PageRun};
use pmm::{PageAllocator, PageStats};
use slab::{SlabAllocator, SlabStats};

bitflags! {
    /// Флаги выделения / Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Заполнить нулями / Zero-fill the returned memory
        const ZERO = 1 << 0;
    }
}

/// Источник страниц для slab-уровня / Where slabs get their frames from
pub trait FrameSource {
    fn allocate_frame(&self) -> Option<NonNull<u8>>;

    /// # Safety
    /// `frame` must have come from `allocate_frame` on this source and must
    /// not be used again.
    unsafe fn free_frame(&self, frame: NonNull<u8>) -> Result<()>;

    /// Whether `addr` lies inside memory this source hands out.
    fn contains(&self, addr: usize) -> bool;
}

/// Round `addr` up to `align` (a power of two); `None` on overflow.
pub const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Ядро памяти: PPA + SOA / The memory core: one page and one slab allocator
///
/// Boot code keeps one in a `static`; tests build as many as they like.
///
/// ```ignore
/// static MEMORY: KernelMemory = KernelMemory::new();
///
/// unsafe { MEMORY.init(heap_start, heap_end)? };
/// let page = MEMORY.allocate_page().ok_or(AllocError::OutOfMemory)?;
/// ```
pub struct KernelMemory {
    pages: PageAllocator,
    slabs: SlabAllocator,
}

impl KernelMemory {
    pub const fn new() -> Self {
        Self {
            pages: PageAllocator::new(),
            slabs: SlabAllocator::new(),
        }
    }

    /// Передать диапазон кучи / Hand the heap range to the page allocator
    ///
    /// # Safety
    /// See [`PageAllocator::init`].
    pub unsafe fn init(&self, heap_start: usize, heap_end: usize) -> Result<usize> {
        // SAFETY: forwarded caller contract.
        unsafe { self.pages.init(heap_start, heap_end) }
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn slabs(&self) -> &SlabAllocator {
        &self.slabs
    }

    pub fn allocate_page(&self) -> Option<Page<'_>> {
        self.allocate_page_with(AllocFlags::empty())
    }

    pub fn allocate_page_with(&self, flags: AllocFlags) -> Option<Page<'_>> {
        let frame = self.pages.allocate_page_with(flags)?;
        // SAFETY: freshly allocated from `self.pages`.
        Some(unsafe { Page::from_raw(&self.pages, frame) })
    }

    /// # Safety
    /// See [`PageAllocator::free_page`].
    pub unsafe fn free_page(&self, frame: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.pages.free_page(frame) }
    }

    pub fn allocate_pages(&self, count: usize) -> Result<PageRun<'_>> {
        self.allocate_pages_with(count, AllocFlags::empty())
    }

    pub fn allocate_pages_with(&self, count: usize, flags: AllocFlags) -> Result<PageRun<'_>> {
        let base = self.pages.allocate_pages_with(count, flags)?;
        // SAFETY: freshly allocated run of `count` frames.
        Ok(unsafe { PageRun::from_raw(&self.pages, base, count) })
    }

    /// Объект из размерного класса / An object of at least `size` bytes
    pub fn allocate(&self, size: usize) -> Result<Object<'_>> {
        self.allocate_with(size, AllocFlags::empty())
    }

    pub fn allocate_with(&self, size: usize, flags: AllocFlags) -> Result<Object<'_>> {
        let ptr = self.slabs.allocate_with(&self.pages, size, flags)?;
        // SAFETY: freshly allocated slot of at least `size` bytes.
        Ok(unsafe { Object::from_raw(self, ptr, size) })
    }

    /// Allocation too big for a slab: whole consecutive pages.
    pub fn allocate_large(&self, size: usize) -> Result<PageRun<'_>> {
        self.allocate_pages(size.div_ceil(PAGE_SIZE).max(1))
    }

    /// # Safety
    /// See [`SlabAllocator::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.slabs.free(&self.pages, ptr) }
    }

    pub fn page_stats(&self) -> PageStats {
        self.pages.stats()
    }

    pub fn slab_stats(&self) -> SlabStats {
        self.slabs.stats()
    }
}

impl Default for KernelMemory {
    fn default() -> Self {
        Self::new()
    }
}
