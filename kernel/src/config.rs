//! Параметры времени компиляции / Compile-time configuration
//!
//! Единственная runtime-настройка: диапазон `init(heap_start, heap_end)`.
//! The only runtime knob is the `init(heap_start, heap_end)` range.

use core::mem::size_of;

/// Размер физической страницы / Physical page (frame) size
pub const PAGE_SIZE: usize = 4096;

/// Шаг размерных классов / Size-class granularity
pub const SLOT_GRANULARITY: usize = 8;

/// Самый большой объект, обслуживаемый slab'ами / Largest slab-served size
pub const MAX_SLAB_SIZE: usize = 2048;

/// Число размерных классов: 8, 16, ..., 2048
pub const SIZE_CLASS_COUNT: usize = MAX_SLAB_SIZE / SLOT_GRANULARITY;

/// Mixed with the page address and stored in every slab header.
pub const SLAB_MAGIC: usize = 0x51AB_C0DE_5EED_F00D_u64 as usize;

// A free slot must hold one link word.
const _: () = assert!(SLOT_GRANULARITY >= size_of::<usize>());
const _: () = assert!(SLOT_GRANULARITY.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_SLAB_SIZE % SLOT_GRANULARITY == 0);
const _: () = assert!(MAX_SLAB_SIZE < PAGE_SIZE);
