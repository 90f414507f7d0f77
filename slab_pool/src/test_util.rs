//! Helpers shared by the unit tests

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Fallback allocator that counts what reaches it
#[derive(Debug, Default)]
pub struct CountingAlloc {
    pub allocs: AtomicUsize,
    pub deallocs: AtomicUsize,
    /// Refuse every request (returns null)
    pub exhausted: bool,
}

impl CountingAlloc {
    pub fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Default::default()
        }
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn deallocs(&self) -> usize {
        self.deallocs.load(Ordering::SeqCst)
    }
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        if self.exhausted {
            return std::ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.deallocs.fetch_add(1, Ordering::SeqCst);
        System.dealloc(ptr, layout)
    }
}
