//! Slab Object Allocator: размерные классы поверх страниц
//!
//! Каждый класс (8, 16, ..., 2048 байт) держит список slab'ов. Slab это одна
//! страница: заголовок в начале, дальше слоты одного размера.
//! Every class (8, 16, ..., 2048 bytes) keeps a list of slabs. A slab is one
//! frame: a header at the start, then equal-sized slots.
//!
//! ```text
//! page ┌────────────┬────────┬────────┬─────┬────────┬──────┐
//!      │ SlabHeader │ slot 0 │ slot 1 │ ... │ slot N │ tail │
//!      └────────────┴────────┴────────┴─────┴────────┴──────┘
//! ```
//!
//! The header of any slot is found by rounding the slot address down to the
//! page boundary. A slab goes back to the page allocator as soon as its last
//! object is freed.

use core::{
    mem::size_of,
    ptr::{self, NonNull},
};

use log::{debug, error};
use spin::Mutex;

use super::{
    align_down,
    link::{IntrusiveList, Link},
    AllocFlags, FrameSource,
};
use crate::config::{MAX_SLAB_SIZE, PAGE_SIZE, SIZE_CLASS_COUNT, SLAB_MAGIC, SLOT_GRANULARITY};
use crate::error::{AllocError, Result};

#[cfg(feature = "poison")]
use super::poison;

/// Заголовок slab'а / Slab header, first bytes of the slab page
#[repr(C)]
struct SlabHeader {
    // Class-list link; owned by the class `IntrusiveList`.
    _link: Link,
    magic: usize,
    class: u16,
    capacity: u16,
    slots: IntrusiveList,
}

/// Bytes reserved at the start of every slab page.
pub const SLAB_HEADER_SIZE: usize =
    (size_of::<SlabHeader>() + SLOT_GRANULARITY - 1) & !(SLOT_GRANULARITY - 1);

const _: () = assert!(slab_capacity(MAX_SLAB_SIZE) >= 1);
const _: () = assert!(slab_capacity(SLOT_GRANULARITY) <= u16::MAX as usize);

/// Размерный класс для запроса / Size class index for a request
///
/// Size 0 is served from the smallest class.
pub fn size_class(size: usize) -> Result<usize> {
    let oversize = AllocError::Oversize { size, max: MAX_SLAB_SIZE };
    let rounded = super::align_up(size.max(1), SLOT_GRANULARITY).ok_or(oversize)?;
    let class = rounded / SLOT_GRANULARITY - 1;
    if class >= SIZE_CLASS_COUNT {
        return Err(oversize);
    }
    Ok(class)
}

pub const fn class_size(class: usize) -> usize {
    (class + 1) * SLOT_GRANULARITY
}

/// Слотов в одном slab'е / Slots per slab of the given object size
pub const fn slab_capacity(object_size: usize) -> usize {
    (PAGE_SIZE - SLAB_HEADER_SIZE) / object_size
}

fn header_of(page: NonNull<u8>) -> *mut SlabHeader {
    page.cast::<SlabHeader>().as_ptr()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    pub live_objects: usize,
    pub live_slabs: usize,
    pub slabs_created: usize,
    pub slabs_destroyed: usize,
}

/// Состояние одного класса / One size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub object_size: usize,
    pub slabs: usize,
    /// Slots per slab
    pub capacity: usize,
    pub free_slots: usize,
}

/// Outcome of looking for a free slot in a class.
enum Step {
    Slot(NonNull<u8>),
    Grow,
}

struct SizeClassTable {
    classes: [IntrusiveList; SIZE_CLASS_COUNT],
    stats: SlabStats,
}

impl SizeClassTable {
    const fn new() -> Self {
        const EMPTY: IntrusiveList = IntrusiveList::new();
        Self {
            classes: [EMPTY; SIZE_CLASS_COUNT],
            stats: SlabStats {
                live_objects: 0,
                live_slabs: 0,
                slabs_created: 0,
                slabs_destroyed: 0,
            },
        }
    }

    /// First slab of the class with a free slot gives up its top slot.
    fn take_slot(&mut self, class: usize) -> Step {
        // SAFETY: every page on a class list carries an initialised header.
        let slab = self.classes[class]
            .iter()
            .find(|&page| unsafe { !(*header_of(page)).slots.is_empty() });
        let Some(page) = slab else { return Step::Grow };

        match unsafe { (*header_of(page)).slots.pop() } {
            Some(slot) => {
                self.stats.live_objects += 1;
                Step::Slot(slot)
            }
            None => Step::Grow,
        }
    }

    /// Разметить страницу как slab / Turn a fresh frame into a slab
    ///
    /// # Safety
    /// `page` must be a page-aligned frame owned by the caller.
    unsafe fn install(&mut self, class: usize, page: NonNull<u8>) {
        let size = class_size(class);
        let capacity = slab_capacity(size);
        let base = page.as_ptr() as usize;
        let header = header_of(page);

        // SAFETY: the frame is ours; header and slots lie inside it.
        unsafe {
            header.write(SlabHeader {
                _link: Link::detached(),
                magic: SLAB_MAGIC ^ base,
                class: class as u16,
                capacity: capacity as u16,
                slots: IntrusiveList::new(),
            });
            // Pushed high to low: the lowest slot is handed out first.
            for i in (0..capacity).rev() {
                let slot = NonNull::new_unchecked((base + SLAB_HEADER_SIZE + i * size) as *mut u8);
                #[cfg(feature = "poison")]
                poison::on_free(slot, size);
                (*header).slots.push(slot);
            }
            self.classes[class].push(page);
        }

        self.stats.slabs_created += 1;
        self.stats.live_slabs += 1;
        debug!("slab: new {}-byte slab at {:#x} ({} slots)", size, base, capacity);
    }

    /// Unlink an all-free slab; the caller returns the frame.
    fn release(&mut self, class: usize, page: NonNull<u8>) {
        let unlinked = self.classes[class].remove(page);
        debug_assert!(unlinked, "slab {:p} missing from class {}", page, class);
        // SAFETY: header is intact until the frame is handed back.
        unsafe { (*header_of(page)).magic = 0 };

        self.stats.slabs_destroyed += 1;
        self.stats.live_slabs -= 1;
        debug!("slab: released {}-byte slab at {:p}", class_size(class), page);
    }
}

/// Аллокатор объектов / Slab object allocator
///
/// One lock guards the whole class table. Frames come from a [`FrameSource`],
/// whose lock is always taken after this one.
pub struct SlabAllocator {
    table: Mutex<SizeClassTable>,
}

impl SlabAllocator {
    pub const fn new() -> Self {
        Self { table: Mutex::new(SizeClassTable::new()) }
    }

    /// Выделить объект / Allocate an object of at least `size` bytes
    ///
    /// Returned pointers are aligned to [`SLOT_GRANULARITY`]. Requests above
    /// [`MAX_SLAB_SIZE`] fail with [`AllocError::Oversize`].
    pub fn allocate<F: FrameSource + ?Sized>(
        &self,
        frames: &F,
        size: usize,
    ) -> Result<NonNull<u8>> {
        self.allocate_with(frames, size, AllocFlags::empty())
    }

    pub fn allocate_with<F: FrameSource + ?Sized>(
        &self,
        frames: &F,
        size: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>> {
        let class = size_class(size)?;

        let slot = {
            let mut table = self.table.lock();
            match table.take_slot(class) {
                Step::Slot(slot) => slot,
                Step::Grow => {
                    let page = frames.allocate_frame().ok_or(AllocError::OutOfMemory)?;
                    // SAFETY: the frame source just handed this frame to us.
                    unsafe { table.install(class, page) };
                    match table.take_slot(class) {
                        Step::Slot(slot) => slot,
                        Step::Grow => return Err(AllocError::OutOfMemory),
                    }
                }
            }
        };

        let size = class_size(class);
        // SAFETY: the slot is ours and `size` bytes long.
        #[cfg(feature = "poison")]
        unsafe {
            poison::on_allocate(slot, size);
        }
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: as above.
            unsafe { ptr::write_bytes(slot.as_ptr(), 0, size) };
        }
        Ok(slot)
    }

    /// Освободить объект / Free an object
    ///
    /// Pointers outside the frame source, off a slot boundary, inside a slab
    /// header or in a page without a valid slab header are rejected with
    /// [`AllocError::InvalidFree`] and nothing is written.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on this allocator with the same
    /// frame source, and must not be used again.
    pub unsafe fn free<F: FrameSource + ?Sized>(&self, frames: &F, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let invalid = AllocError::InvalidFree { addr };
        if !frames.contains(addr)
            || addr % SLOT_GRANULARITY != 0
            || addr % PAGE_SIZE < SLAB_HEADER_SIZE
        {
            return Err(invalid);
        }

        let page_addr = align_down(addr, PAGE_SIZE);
        // SAFETY: `addr` is past the header, so the page address is non-null.
        let page = unsafe { NonNull::new_unchecked(page_addr as *mut u8) };
        let header = header_of(page);

        let mut table = self.table.lock();

        // SAFETY: the page lies inside the frame source and is readable; the
        // magic word tells a slab header from anything else.
        let (class, capacity) = unsafe {
            if (*header).magic != SLAB_MAGIC ^ page_addr {
                error!("slab: free of {:#x}: page {:#x} is not a slab", addr, page_addr);
                return Err(invalid);
            }
            ((*header).class as usize, (*header).capacity as usize)
        };

        let size = class_size(class);
        let offset = addr - page_addr - SLAB_HEADER_SIZE;
        if offset % size != 0 || offset / size >= capacity {
            return Err(invalid);
        }

        // SAFETY: the header was validated above.
        let slots = unsafe { &mut (*header).slots };
        if cfg!(debug_assertions) && slots.iter().any(|slot| slot == ptr) {
            error!("slab: double free of {:#x}", addr);
            return Err(invalid);
        }

        // SAFETY: the slot is being handed back and is `size` bytes long.
        #[cfg(feature = "poison")]
        unsafe {
            poison::on_free(ptr, size);
        }
        // SAFETY: validated slot of this slab, returned by the caller.
        unsafe { slots.push(ptr) };
        let all_free = slots.len() == capacity;
        table.stats.live_objects -= 1;

        if all_free {
            table.release(class, page);
            drop(table);
            // SAFETY: the slab is unlinked, so nothing references the frame.
            unsafe { frames.free_frame(page) }?;
        }
        Ok(())
    }

    pub fn stats(&self) -> SlabStats {
        self.table.lock().stats
    }

    /// Состояние класса `class` / Snapshot of one size class
    pub fn class_stats(&self, class: usize) -> Option<ClassStats> {
        let table = self.table.lock();
        let list = table.classes.get(class)?;
        let object_size = class_size(class);
        let free_slots = list
            .iter()
            // SAFETY: pages on a class list carry initialised headers.
            .map(|page| unsafe { (*header_of(page)).slots.len() })
            .sum();
        Some(ClassStats {
            object_size,
            slabs: list.len(),
            capacity: slab_capacity(object_size),
            free_slots,
        })
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}
