//! Интрусивные односвязные списки / Intrusive singly linked lists
//!
//! Свободный блок (страница или слот) хранит адрес следующего
//! свободного блока в своём первом машинном слове.
//! A free block (frame or slot) stores the address of the next free block
//! in its first machine word.
//!
//! Every reinterpretation of free memory as a list node happens in this file.

use core::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use crate::config::SLOT_GRANULARITY;

/// Слово связи внутри блока / The link word at the start of a block
#[repr(C)]
pub(crate) struct Link {
    next: Option<NonNull<Link>>,
}

const _: () = assert!(size_of::<Link>() == size_of::<usize>());
const _: () = assert!(SLOT_GRANULARITY >= size_of::<Link>());

impl Link {
    pub(crate) const fn detached() -> Self {
        Self { next: None }
    }
}

/// LIFO-список блоков / LIFO stack threaded through blocks
///
/// `push` is the only entry point that adopts memory; every other operation
/// relies on the nodes having come through it.
pub(crate) struct IntrusiveList {
    head: Option<NonNull<Link>>,
    len: usize,
}

// NonNull не Send по умолчанию; блоки принадлежат списку
// NonNull is not Send by default; the blocks are owned by the list
unsafe impl Send for IntrusiveList {}

impl IntrusiveList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Положить блок на вершину / Push a block on top
    ///
    /// # Safety
    /// `block` must be aligned for a `usize`, valid for writes of one word,
    /// not already on any list, and owned by the list until popped or removed.
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        debug_assert_eq!(block.as_ptr() as usize % align_of::<Link>(), 0);
        let link = block.cast::<Link>();
        // SAFETY: caller hands over a writable, aligned, unused word.
        unsafe { link.as_ptr().write(Link { next: self.head }) };
        self.head = Some(link);
        self.len += 1;
    }

    /// Снять верхний блок / Pop the most recently pushed block
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let link = self.head?;
        // SAFETY: every node was written by `push` and is still owned by us.
        self.head = unsafe { (*link.as_ptr()).next };
        self.len -= 1;
        Some(link.cast())
    }

    /// Unlinks `block`, scanning for its predecessor. Returns `false` if absent.
    pub(crate) fn remove(&mut self, block: NonNull<u8>) -> bool {
        let target = block.cast::<Link>();
        let mut cursor: *mut Option<NonNull<Link>> = &mut self.head;
        // SAFETY: `cursor` points either at `self.head` or at the link word
        // of a node that came through `push`.
        unsafe {
            while let Some(node) = *cursor {
                if node == target {
                    *cursor = (*node.as_ptr()).next;
                    self.len -= 1;
                    return true;
                }
                cursor = ptr::addr_of_mut!((*node.as_ptr()).next);
            }
        }
        false
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter { next: self.head, _list: PhantomData }
    }

    /// Отсортировать по убыванию адреса / Sort by address, highest first
    ///
    /// Bottom-up merge sort relinking nodes in place: no extra memory.
    pub(crate) fn sort_descending(&mut self) {
        let mut width = 1;
        loop {
            let mut rest = self.head.take();
            let mut sorted_head = None;
            let mut sorted_last: Option<NonNull<Link>> = None;
            let mut runs = 0usize;

            while rest.is_some() {
                // SAFETY: all nodes reachable from `rest` are list nodes.
                let (left, after_left) = unsafe { split(rest, width) };
                let (right, after_right) = unsafe { split(after_left, width) };
                rest = after_right;

                let (head, last) = unsafe { merge(left, right) };
                match sorted_last {
                    Some(prev) => unsafe { (*prev.as_ptr()).next = head },
                    None => sorted_head = head,
                }
                sorted_last = last;
                runs += 1;
            }

            self.head = sorted_head;
            if runs <= 1 {
                return;
            }
            width *= 2;
        }
    }

    /// Найти и отцепить `count` соседних блоков с шагом `stride`.
    /// Unlink `count` blocks lying exactly `stride` bytes apart.
    ///
    /// The list must be sorted with [`sort_descending`](Self::sort_descending).
    /// Returns the lowest address of the run.
    pub(crate) fn take_run(&mut self, count: usize, stride: usize) -> Option<NonNull<u8>> {
        if count == 0 || count > self.len {
            return None;
        }

        // Node linking to the first (highest) block of the current run.
        let mut before: Option<NonNull<Link>> = None;
        let mut cur = self.head?;
        let mut run_len = 1;

        loop {
            if run_len == count {
                // SAFETY: `cur` and `before` are list nodes.
                unsafe {
                    let after = (*cur.as_ptr()).next;
                    match before {
                        Some(b) => (*b.as_ptr()).next = after,
                        None => self.head = after,
                    }
                }
                self.len -= count;
                return Some(cur.cast());
            }

            // SAFETY: `cur` is a list node.
            let next = unsafe { (*cur.as_ptr()).next }?;
            if addr(cur).checked_sub(stride) == Some(addr(next)) {
                run_len += 1;
            } else {
                before = Some(cur);
                run_len = 1;
            }
            cur = next;
        }
    }
}

fn addr(link: NonNull<Link>) -> usize {
    link.as_ptr() as usize
}

/// Detach the first `n` nodes; returns (those nodes, remainder).
unsafe fn split(
    list: Option<NonNull<Link>>,
    n: usize,
) -> (Option<NonNull<Link>>, Option<NonNull<Link>>) {
    let Some(head) = list else { return (None, None) };
    let mut cur = head;
    for _ in 1..n {
        match unsafe { (*cur.as_ptr()).next } {
            Some(next) => cur = next,
            None => return (Some(head), None),
        }
    }
    let rest = unsafe { (*cur.as_ptr()).next.take() };
    (Some(head), rest)
}

/// Merge two descending chains; returns (head, last node).
unsafe fn merge(
    mut left: Option<NonNull<Link>>,
    mut right: Option<NonNull<Link>>,
) -> (Option<NonNull<Link>>, Option<NonNull<Link>>) {
    let mut head = None;
    let mut last: Option<NonNull<Link>> = None;

    loop {
        let node = match (left, right) {
            (None, None) => break,
            (Some(l), Some(r)) if addr(l) < addr(r) => {
                right = unsafe { (*r.as_ptr()).next };
                r
            }
            (Some(l), _) => {
                left = unsafe { (*l.as_ptr()).next };
                l
            }
            (None, Some(r)) => {
                right = unsafe { (*r.as_ptr()).next };
                r
            }
        };
        match last {
            Some(prev) => unsafe { (*prev.as_ptr()).next = Some(node) },
            None => head = Some(node),
        }
        last = Some(node);
    }

    if let Some(tail) = last {
        unsafe { (*tail.as_ptr()).next = None };
    }
    (head, last)
}

/// Обход адресов / Walks block addresses from the top of the list
pub(crate) struct Iter<'a> {
    next: Option<NonNull<Link>>,
    _list: PhantomData<&'a IntrusiveList>,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next?;
        // SAFETY: the borrowed list keeps its nodes alive and unmodified.
        self.next = unsafe { (*link.as_ptr()).next };
        Some(link.cast())
    }
}
