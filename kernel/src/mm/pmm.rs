//! Physical Page Allocator: LIFO список свободных страниц
//!
//! `init` нарезает диапазон кучи на страницы по 4 KiB и кладёт их в
//! интрусивный список; выделение и освобождение за O(1) с вершины.
//! `init` carves the heap range into 4 KiB frames and threads them onto an
//! intrusive list; single-page allocate and free are O(1) at the top.
//!
//! Runs of consecutive frames (`allocate_pages`) are the slow path: the free
//! list is sorted by address and searched for a gap-free run.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, error, info, trace, warn};
use spin::Mutex;

use super::{align_down, align_up, link::IntrusiveList, AllocFlags, FrameSource};
use crate::config::PAGE_SIZE;
use crate::error::{AllocError, Result};

/// Снимок счётчиков / Page accounting snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub total: usize,
    pub allocated: usize,
    pub free: usize,
}

struct FrameState {
    free: IntrusiveList,
    allocated: usize,
    total: usize,
    initialised: bool,
}

pub struct PageAllocator {
    state: Mutex<FrameState>,
    // Fixed once `init` succeeds; read without the lock.
    start: AtomicUsize,
    end: AtomicUsize,
}

impl PageAllocator {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(FrameState {
                free: IntrusiveList::new(),
                allocated: 0,
                total: 0,
                initialised: false,
            }),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    /// Нарезать `[heap_start, heap_end)` на страницы.
    /// Carve `[heap_start, heap_end)` into frames; returns the frame count.
    ///
    /// The start is rounded up and the end down to a page boundary; a partial
    /// trailing page is discarded. Frames are pushed in ascending order, so the
    /// first allocation returns the highest frame.
    ///
    /// # Safety
    /// The range must be readable and writable, owned exclusively by this
    /// allocator from now on, and never handed out by anything else.
    pub unsafe fn init(&self, heap_start: usize, heap_end: usize) -> Result<usize> {
        let mut state = self.state.lock();
        if state.initialised {
            return Err(AllocError::AlreadyInitialised);
        }

        let invalid = AllocError::InvalidRange { start: heap_start, end: heap_end };
        let start = align_up(heap_start, PAGE_SIZE).ok_or(invalid)?;
        let end = align_down(heap_end, PAGE_SIZE);
        if start == 0 || start >= end {
            return Err(invalid);
        }

        for frame in (start..end).step_by(PAGE_SIZE) {
            // SAFETY: the caller grants us the whole range; `frame` is
            // page-aligned, non-null and not yet on the list.
            unsafe { state.free.push(NonNull::new_unchecked(frame as *mut u8)) };
        }
        state.total = (end - start) / PAGE_SIZE;
        state.initialised = true;
        self.start.store(start, Ordering::Release);
        self.end.store(end, Ordering::Release);

        info!(
            "pmm: {} frames in {:#x}..{:#x} ({} KiB)",
            state.total,
            start,
            end,
            (end - start) / 1024
        );
        Ok(state.total)
    }

    pub fn is_initialised(&self) -> bool {
        self.end.load(Ordering::Acquire) != 0
    }

    /// Выделить одну страницу / Allocate one frame
    ///
    /// Returns the most recently freed frame, or `None` when exhausted.
    /// Contents are unspecified.
    #[must_use]
    pub fn allocate_page(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        let frame = state.free.pop()?;
        state.allocated += 1;
        debug_assert_eq!(frame.as_ptr() as usize % PAGE_SIZE, 0);
        Some(frame)
    }

    #[must_use]
    pub fn allocate_page_with(&self, flags: AllocFlags) -> Option<NonNull<u8>> {
        let frame = self.allocate_page()?;
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the frame is ours and PAGE_SIZE bytes long.
            unsafe { ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
        }
        Some(frame)
    }

    /// Страница, заполненная нулями / A zero-filled frame
    #[must_use]
    pub fn allocate_page_zeroed(&self) -> Option<NonNull<u8>> {
        self.allocate_page_with(AllocFlags::ZERO)
    }

    /// Вернуть страницу / Free one frame
    ///
    /// Rejected frees leave the free list untouched. Debug builds also scan
    /// the free list for the frame to catch a double free.
    ///
    /// # Safety
    /// `frame` must have come from this allocator and must not be used again.
    pub unsafe fn free_page(&self, frame: NonNull<u8>) -> Result<()> {
        let addr = frame.as_ptr() as usize;
        self.check_range(addr, 1)?;

        let mut state = self.state.lock();
        if state.allocated == 0 {
            return Err(AllocError::InvalidFree { addr });
        }
        if cfg!(debug_assertions) && state.free.iter().any(|free| free == frame) {
            error!("pmm: double free of {:#x}", addr);
            return Err(AllocError::InvalidFree { addr });
        }
        // SAFETY: aligned, in range, and handed back by the caller.
        unsafe { state.free.push(frame) };
        state.allocated -= 1;
        Ok(())
    }

    /// Выделить `count` подряд идущих страниц / Allocate consecutive frames
    ///
    /// Returns the lowest frame of the run. Sorts the free list, so a later
    /// single-page allocation returns the highest free frame.
    pub fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 {
            return Err(AllocError::ZeroCount);
        }
        if count == 1 {
            return self.allocate_page().ok_or(AllocError::OutOfMemory);
        }

        let mut state = self.state.lock();
        if state.free.len() < count {
            warn!("pmm: {} pages requested, {} free", count, state.free.len());
            return Err(AllocError::OutOfMemory);
        }

        state.free.sort_descending();
        match state.free.take_run(count, PAGE_SIZE) {
            Some(base) => {
                state.allocated += count;
                debug!("pmm: run of {} pages at {:#x}", count, base.as_ptr() as usize);
                Ok(base)
            }
            None => {
                warn!(
                    "pmm: no run of {} consecutive pages among {} free",
                    count,
                    state.free.len()
                );
                Err(AllocError::OutOfMemory)
            }
        }
    }

    pub fn allocate_pages_with(&self, count: usize, flags: AllocFlags) -> Result<NonNull<u8>> {
        let base = self.allocate_pages(count)?;
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the whole run is ours.
            unsafe { ptr::write_bytes(base.as_ptr(), 0, count * PAGE_SIZE) };
        }
        Ok(base)
    }

    /// Вернуть серию страниц / Free a run of consecutive frames
    ///
    /// # Safety
    /// `base` and `count` must describe a run from `allocate_pages` (or
    /// `count` single frames owned by the caller) that is no longer used.
    pub unsafe fn free_pages_run(&self, base: NonNull<u8>, count: usize) -> Result<()> {
        if count == 0 {
            return Err(AllocError::ZeroCount);
        }
        let addr = base.as_ptr() as usize;
        self.check_range(addr, count)?;

        let mut state = self.state.lock();
        if state.allocated < count {
            return Err(AllocError::InvalidFree { addr });
        }
        for i in 0..count {
            // SAFETY: every frame of the run is aligned, in range and returned.
            let frame = unsafe { NonNull::new_unchecked((addr + i * PAGE_SIZE) as *mut u8) };
            unsafe { state.free.push(frame) };
        }
        state.allocated -= count;
        Ok(())
    }

    /// Alignment and range check for a run of `count` frames at `addr`.
    fn check_range(&self, addr: usize, count: usize) -> Result<()> {
        if !self.is_initialised() {
            return Err(AllocError::NotInitialised);
        }
        if addr % PAGE_SIZE != 0 {
            return Err(AllocError::Misaligned { addr });
        }
        let run_end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| addr.checked_add(len))
            .ok_or(AllocError::InvalidFree { addr })?;
        if !self.contains(addr) || run_end > self.end.load(Ordering::Acquire) {
            return Err(AllocError::InvalidFree { addr });
        }
        Ok(())
    }

    /// Лежит ли адрес в управляемом диапазоне / Is `addr` inside the heap range
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        start <= addr && addr < end
    }

    /// Счётчик выделенных страниц / Frames currently handed out
    pub fn allocated_pages(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn free_pages(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn total_pages(&self) -> usize {
        self.state.lock().total
    }

    pub fn stats(&self) -> PageStats {
        let state = self.state.lock();
        PageStats {
            total: state.total,
            allocated: state.allocated,
            free: state.free.len(),
        }
    }

    /// Trace the first `limit` free frames, top of the list first.
    /// Returns how many were logged.
    pub fn log_free_frames(&self, limit: usize) -> usize {
        let state = self.state.lock();
        trace!("pmm: free list ({} frames)", state.free.len());
        let mut logged = 0;
        for (i, frame) in state.free.iter().take(limit).enumerate() {
            trace!("pmm:   [{}] {:#x}", i, frame.as_ptr() as usize);
            logged += 1;
        }
        logged
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for PageAllocator {
    fn allocate_frame(&self) -> Option<NonNull<u8>> {
        self.allocate_page()
    }

    unsafe fn free_frame(&self, frame: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.free_page(frame) }
    }

    fn contains(&self, addr: usize) -> bool {
        PageAllocator::contains(self, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    fn booted(arena: &Arena) -> PageAllocator {
        let pages = PageAllocator::new();
        unsafe { pages.init(arena.start(), arena.end()) }.unwrap();
        pages
    }

    #[test]
    fn init_counts_whole_frames() {
        let arena = Arena::new(4);
        let pages = PageAllocator::new();
        assert_eq!(unsafe { pages.init(arena.start(), arena.end()) }, Ok(4));
        assert_eq!(
            pages.stats(),
            PageStats { total: 4, allocated: 0, free: 4 }
        );
    }

    #[test]
    fn init_discards_partial_pages() {
        let arena = Arena::new(4);
        let pages = PageAllocator::new();
        // Unaligned start loses the first frame, short end loses the last.
        let carved = unsafe { pages.init(arena.start() + 1, arena.end() - 1) };
        assert_eq!(carved, Ok(2));
        assert!(!pages.contains(arena.frame(0)));
        assert!(pages.contains(arena.frame(1)));
        assert!(!pages.contains(arena.frame(3)));
    }

    #[test]
    fn init_twice_is_rejected() {
        let arena = Arena::new(2);
        let pages = booted(&arena);
        assert_eq!(
            unsafe { pages.init(arena.start(), arena.end()) },
            Err(AllocError::AlreadyInitialised)
        );
        assert_eq!(pages.total_pages(), 2);
    }

    #[test]
    fn init_empty_range() {
        let arena = Arena::new(1);
        let pages = PageAllocator::new();
        let start = arena.start() + 8;
        assert_eq!(
            unsafe { pages.init(start, arena.end()) },
            Err(AllocError::InvalidRange { start, end: arena.end() })
        );
        assert!(pages.allocate_page().is_none());
    }

    #[test]
    fn first_allocation_is_highest_frame() {
        let arena = Arena::new(3);
        let pages = booted(&arena);
        let top = pages.allocate_page().unwrap();
        assert_eq!(top.as_ptr() as usize, arena.frame(2));
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = Arena::new(2);
        let pages = booted(&arena);
        let _a = pages.allocate_page().unwrap();
        let _b = pages.allocate_page().unwrap();
        assert!(pages.allocate_page().is_none());
        assert_eq!(pages.allocated_pages(), 2);
    }

    #[test]
    fn rejected_frees_leave_state_alone() {
        let arena = Arena::new(2);
        let pages = booted(&arena);
        let frame = pages.allocate_page().unwrap();
        let before = pages.stats();

        let inside = NonNull::new((frame.as_ptr() as usize + 8) as *mut u8).unwrap();
        assert_eq!(
            unsafe { pages.free_page(inside) },
            Err(AllocError::Misaligned { addr: inside.as_ptr() as usize })
        );
        let outside = NonNull::new(arena.end() as *mut u8).unwrap();
        assert!(matches!(
            unsafe { pages.free_page(outside) },
            Err(AllocError::InvalidFree { .. })
        ));
        assert_eq!(pages.stats(), before);
    }

    #[test]
    fn free_before_init() {
        let pages = PageAllocator::new();
        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert_eq!(unsafe { pages.free_page(bogus) }, Err(AllocError::NotInitialised));
    }

    #[test]
    fn zeroed_page() {
        let arena = Arena::new(1);
        let pages = booted(&arena);
        let frame = pages.allocate_page().unwrap();
        unsafe {
            ptr::write_bytes(frame.as_ptr(), 0x5A, PAGE_SIZE);
            pages.free_page(frame).unwrap();
        }
        let frame = pages.allocate_page_with(AllocFlags::ZERO).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zeroed_page_shortcut() {
        let arena = Arena::new(2);
        let pages = booted(&arena);
        let dirty = pages.allocate_page().unwrap();
        unsafe {
            ptr::write_bytes(dirty.as_ptr(), 0xC3, PAGE_SIZE);
            pages.free_page(dirty).unwrap();
        }
        let frame = pages.allocate_page_zeroed().unwrap();
        assert_eq!(frame, dirty);
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(pages.allocated_pages(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn double_free_is_detected() {
        let arena = Arena::new(3);
        let pages = booted(&arena);
        let _held = pages.allocate_page().unwrap();
        let frame = pages.allocate_page().unwrap();
        unsafe { pages.free_page(frame) }.unwrap();

        let before = pages.stats();
        assert_eq!(
            unsafe { pages.free_page(frame) },
            Err(AllocError::InvalidFree { addr: frame.as_ptr() as usize })
        );
        assert_eq!(pages.stats(), before);

        // The list stays acyclic: two allocations give two distinct frames.
        let a = pages.allocate_page().unwrap();
        let b = pages.allocate_page().unwrap();
        assert_ne!(a, b);
        assert!(pages.allocate_page().is_none());
    }

    #[test]
    fn run_is_consecutive_and_returns() {
        let arena = Arena::new(8);
        let pages = booted(&arena);

        // Keep frame 6 so the run must come from below it.
        let singles: [_; 3] = core::array::from_fn(|_| pages.allocate_page().unwrap());
        unsafe {
            pages.free_page(singles[0]).unwrap();
            pages.free_page(singles[2]).unwrap();
        }
        assert_eq!(singles[1].as_ptr() as usize, arena.frame(6));

        let base = pages.allocate_pages(4).unwrap();
        let base_addr = base.as_ptr() as usize;
        assert_eq!(base_addr % PAGE_SIZE, 0);
        assert!(base_addr + 4 * PAGE_SIZE <= arena.frame(6));
        assert_eq!(pages.allocated_pages(), 5);

        unsafe {
            pages.free_pages_run(base, 4).unwrap();
            pages.free_page(singles[1]).unwrap();
        }
        assert_eq!(pages.stats(), PageStats { total: 8, allocated: 0, free: 8 });
    }

    #[test]
    fn run_without_fit() {
        let arena = Arena::new(4);
        let pages = booted(&arena);
        let held = pages.allocate_page().unwrap();
        let second = pages.allocate_page().unwrap();
        unsafe { pages.free_page(held).unwrap() };
        // Free: frames 0, 1 and 3; frame 2 is held.
        assert_eq!(second.as_ptr() as usize, arena.frame(2));
        assert_eq!(pages.allocate_pages(3), Err(AllocError::OutOfMemory));
        assert_eq!(pages.allocate_pages(0), Err(AllocError::ZeroCount));
        assert_eq!(pages.free_pages(), 3);
        assert_eq!(pages.allocated_pages(), 1);
    }

    #[test]
    fn log_free_frames_respects_limit() {
        let arena = Arena::new(4);
        let pages = booted(&arena);
        assert_eq!(pages.log_free_frames(2), 2);
        assert_eq!(pages.log_free_frames(10), 4);
    }
}
