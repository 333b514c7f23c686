//! Канарейки освобождённых слотов / Poisoning of freed slots
//!
//! Freed slots are filled with [`FREE_POISON`] past their link word. On the
//! next allocation the fill is checked, so a write through a dangling pointer
//! shows up in the log, and the slot is handed out filled with
//! [`ALLOC_POISON`].

use core::{
    mem::size_of,
    ptr::{self, NonNull},
    slice,
};

use log::error;

pub const FREE_POISON: u8 = 0xDD;
pub const ALLOC_POISON: u8 = 0xAA;

// The first word of a free slot belongs to the free list.
const LINK_BYTES: usize = size_of::<usize>();

/// # Safety
/// `slot` must be valid for writes of `size` bytes.
pub(crate) unsafe fn on_free(slot: NonNull<u8>, size: usize) {
    if size > LINK_BYTES {
        // SAFETY: stays within the slot.
        unsafe { ptr::write_bytes(slot.as_ptr().add(LINK_BYTES), FREE_POISON, size - LINK_BYTES) };
    }
}

/// Check the free fill, then refill with [`ALLOC_POISON`].
/// Returns `false` if the slot was written while free.
///
/// # Safety
/// `slot` must be valid for reads and writes of `size` bytes.
pub(crate) unsafe fn on_allocate(slot: NonNull<u8>, size: usize) -> bool {
    if size <= LINK_BYTES {
        return true;
    }
    // SAFETY: stays within the slot.
    let body =
        unsafe { slice::from_raw_parts_mut(slot.as_ptr().add(LINK_BYTES), size - LINK_BYTES) };
    let intact = body.iter().all(|&b| b == FREE_POISON);
    if !intact {
        error!("slab: slot {:p} was written after free", slot);
    }
    body.fill(ALLOC_POISON);
    intact
}
