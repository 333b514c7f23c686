//! kmem: ядро управления памятью / memory-management core
//!
//! Два уровня поверх диапазона физической памяти:
//! Two layers over one physical memory range:
//!   - [`PageAllocator`]: страницы по 4 KiB / 4 KiB frames
//!   - [`SlabAllocator`]: объекты до 2 KiB / objects up to 2 KiB
//!
//! [`KernelMemory`] ties them together; `mm::raw` speaks null pointers and
//! `mm::heap::KernelHeap` plugs the whole thing into `#[global_allocator]`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod mm;

#[cfg(test)]
mod testing;

pub use error::{AllocError, Result};
pub use mm::{
    heap::KernelHeap,
    owned::{Object, Page, PageRun},
    pmm::{PageAllocator, PageStats},
    slab::{ClassStats, SlabAllocator, SlabStats},
    AllocFlags, FrameSource, KernelMemory,
};
