//! Typed construct/destroy on top of a [PoolRouter]
//!
//! [construct](PoolRouter::construct) moves a value into pool storage sized
//! for its type and [destroy](PoolRouter::destroy) drops it in place before
//! handing the storage back to the same size class. [PoolBox] pairs the two
//! so that safe code never has to.
//!
//! Types that need more alignment than a slot guarantees go to the fallback
//! allocator with their exact [Layout]. Zero-sized types need no storage.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    fmt::{self, Debug},
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    config::SLOT_ALIGN,
    error::AllocError,
    router::{global, PoolRouter},
    util::UsizePtr,
};

impl<A: GlobalAlloc> PoolRouter<A> {
    /// Move `value` into freshly allocated storage
    ///
    /// On failure `value` is dropped and nothing is constructed.
    pub fn construct<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let storage = self.allocate_for::<T>()?;
        unsafe {
            // safety: storage is big enough and aligned enough for a T
            storage.as_ptr().write(value);
        }
        tracing::event!(
            Level::TRACE,
            "type" = std::any::type_name::<T>(),
            ptr = ?UsizePtr::from(storage.as_ptr()),
            "construct"
        );
        Ok(storage)
    }

    /// Drop the `T` at `ptr` and give its storage back
    ///
    /// A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [construct](Self::construct) on this same
    /// router with the same `T`, must not already be destroyed, and no other
    /// references to it may exist. Mixing with the raw
    /// [allocate](Self::allocate)/[deallocate](Self::deallocate) pair is not allowed.
    pub unsafe fn destroy<T>(&self, ptr: *mut T) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        tracing::event!(
            Level::TRACE,
            "type" = std::any::type_name::<T>(),
            ptr = ?UsizePtr::from(ptr.as_ptr()),
            "destroy"
        );
        ptr::drop_in_place(ptr.as_ptr());
        self.deallocate_for(ptr);
    }

    /// Uninitialized storage for one `T`
    fn allocate_for<T>(&self) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            Ok(NonNull::dangling())
        } else if layout.align() > SLOT_ALIGN {
            self.fallback_allocate(layout).map(NonNull::cast)
        } else {
            self.allocate(layout.size()).map(NonNull::cast)
        }
    }

    /// # Safety
    ///
    /// `ptr` must have come from [allocate_for](Self::allocate_for) with the same `T`,
    /// and whatever was in it must already be dropped or moved out
    unsafe fn deallocate_for<T>(&self, ptr: NonNull<T>) {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            // nothing was allocated
        } else if layout.align() > SLOT_ALIGN {
            self.fallback_deallocate(ptr.cast(), layout);
        } else {
            self.deallocate(ptr.as_ptr().cast(), layout.size());
        }
    }
}

/// [PoolRouter::construct] on the [global] router
pub fn construct<T>(value: T) -> Result<NonNull<T>, AllocError> {
    global().construct(value)
}

/// [PoolRouter::destroy] on the [global] router
///
/// # Safety
///
/// Same as [PoolRouter::destroy], with `ptr` having come from [construct]
pub unsafe fn destroy<T>(ptr: *mut T) {
    global().destroy(ptr)
}

/// Owning handle to a `T` living in pool storage
///
/// Dropping it destroys the value and recycles the slot,
/// like a `Box` backed by a [PoolRouter].
pub struct PoolBox<'r, T, A: GlobalAlloc = System> {
    ptr: NonNull<T>,
    router: &'r PoolRouter<A>,
    /// we own a T
    _p: PhantomData<T>,
}

// safety: a PoolBox owns its T exclusively, and the router is only used
// through &self methods which are fine to call from any thread
unsafe impl<'r, T: Send, A: GlobalAlloc + Sync> Send for PoolBox<'r, T, A> {}
// safety: &PoolBox only hands out &T
unsafe impl<'r, T: Sync, A: GlobalAlloc + Sync> Sync for PoolBox<'r, T, A> {}

impl<T> PoolBox<'static, T> {
    /// Put `value` into storage from the [global] router
    pub fn new(value: T) -> Result<Self, AllocError> {
        Self::new_in(value, global())
    }
}

impl<'r, T, A: GlobalAlloc> PoolBox<'r, T, A> {
    pub fn new_in(value: T, router: &'r PoolRouter<A>) -> Result<Self, AllocError> {
        Ok(Self {
            ptr: router.construct(value)?,
            router,
            _p: PhantomData,
        })
    }

    #[inline]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// Move the value back out, recycling the storage without dropping it
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        unsafe {
            // safety: ptr holds an initialized T that we own, and since
            // `this` is never dropped it is read exactly once
            let value = this.ptr.as_ptr().read();
            this.router.deallocate_for(this.ptr);
            value
        }
    }
}

impl<'r, T, A: GlobalAlloc> Deref for PoolBox<'r, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<'r, T, A: GlobalAlloc> DerefMut for PoolBox<'r, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<'r, T, A: GlobalAlloc> Drop for PoolBox<'r, T, A> {
    fn drop(&mut self) {
        unsafe { self.router.destroy(self.ptr.as_ptr()) }
    }
}

impl<'r, T: Debug, A: GlobalAlloc> Debug for PoolBox<'r, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}
