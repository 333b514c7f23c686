//! Ошибки аллокаторов / Allocator errors

use core::fmt;

/// Ошибки PPA и SOA / Errors reported by the page and slab allocators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame left
    OutOfMemory,
    /// Request exceeds the largest size class
    Oversize { size: usize, max: usize },
    /// Pointer was not produced by this allocator (or is already free)
    InvalidFree { addr: usize },
    /// Page pointer is not page-aligned
    Misaligned { addr: usize },
    /// Heap range holds no whole frame
    InvalidRange { start: usize, end: usize },
    AlreadyInitialised,
    NotInitialised,
    /// Zero pages requested
    ZeroCount,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Oversize { size, max } => {
                write!(f, "request of {} bytes exceeds slab limit of {} bytes", size, max)
            }
            Self::InvalidFree { addr } => write!(f, "invalid free of {:#x}", addr),
            Self::Misaligned { addr } => write!(f, "page pointer {:#x} is not page-aligned", addr),
            Self::InvalidRange { start, end } => {
                write!(f, "heap range {:#x}..{:#x} holds no whole page", start, end)
            }
            Self::AlreadyInitialised => write!(f, "allocator already initialised"),
            Self::NotInitialised => write!(f, "allocator not initialised"),
            Self::ZeroCount => write!(f, "zero pages requested"),
        }
    }
}

pub type Result<T> = core::result::Result<T, AllocError>;
