//! Maps request sizes onto size classes
//!
//! A [PoolRouter] owns one [SizeClassPool] per size class, where pool `i`
//! serves slots of `(i + 1) * base_unit` bytes. Requests are always rounded
//! *up* to the next class. Anything larger than the biggest class is passed
//! straight through to a fallback [GlobalAlloc] (the system allocator unless
//! a different one is supplied).

use std::{
    alloc::{GlobalAlloc, Layout, System},
    fmt::Debug,
    ptr::NonNull,
    sync::OnceLock,
};

use tracing::Level;

use crate::{
    config::{PoolConfig, SLOT_ALIGN},
    error::AllocError,
    size_class::SizeClassPool,
    util::{divroundup, UsizePtr},
};

/// Table of size class pools plus the fallback for oversized requests
pub struct PoolRouter<A: GlobalAlloc = System> {
    config: PoolConfig,
    /// Pool `i` has slot size `config.slot_size_of(i)`
    pools: Box<[SizeClassPool]>,
    fallback: A,
}

impl<A: GlobalAlloc> Debug for PoolRouter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRouter")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .field("fallback", &std::any::type_name::<A>())
            .finish_non_exhaustive()
    }
}

impl PoolRouter<System> {
    /// Router with the default size classes, falling back to the system allocator
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, AllocError> {
        Self::with_fallback(config, System)
    }
}

impl<A: GlobalAlloc> PoolRouter<A> {
    /// Build every pool of the table, smallest class first
    ///
    /// No blocks are acquired yet.
    pub fn with_fallback(config: PoolConfig, fallback: A) -> Result<Self, AllocError> {
        config.validate()?;
        let pools = (0..config.num_size_classes)
            .map(|i| SizeClassPool::new(config.slot_size_of(i), config.block_size))
            .collect::<Result<Box<[_]>, _>>()?;

        tracing::event!(
            Level::DEBUG,
            base_unit = config.base_unit,
            num_size_classes = config.num_size_classes,
            block_size = config.block_size,
            "built size class table"
        );

        Ok(Self {
            config,
            pools,
            fallback,
        })
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Largest request served by a pool
    #[inline]
    pub fn max_slot_size(&self) -> usize {
        self.config.max_slot_size()
    }

    #[inline]
    pub fn num_pools(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn pool(&self, index: usize) -> &SizeClassPool {
        &self.pools[index]
    }

    #[inline]
    pub fn fallback(&self) -> &A {
        &self.fallback
    }

    /// Index of the pool serving `size` bytes,
    /// or `None` if no pool does (zero bytes, or above the ceiling)
    #[inline]
    pub fn index_for(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_slot_size() {
            None
        } else {
            Some(divroundup(size, self.config.base_unit) - 1)
        }
    }

    /// `ceil(size / base_unit) - 1`, clamped into the table
    #[inline]
    pub fn class_index(&self, size: usize) -> usize {
        divroundup(size, self.config.base_unit)
            .saturating_sub(1)
            .min(self.pools.len() - 1)
    }

    /// Get at least `size` bytes, aligned to [SLOT_ALIGN]
    ///
    /// Does *NOT* initialize any of the resulting memory.
    /// Zero-byte requests are refused with [AllocError::InvalidSize].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize { size });
        }
        match self.index_for(size) {
            Some(i) => self.pools[i].allocate(),
            None => self.fallback_allocate(fallback_layout(size)?),
        }
    }

    /// Give back storage obtained from [allocate](Self::allocate)
    ///
    /// A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this same router with the same
    /// `size`, must not already be freed, and must not be used afterwards.
    /// None of this is checked.
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        match self.index_for(size) {
            Some(i) => self.pools[i].deallocate(ptr),
            None => {
                // a layout error here means allocate could never have succeeded
                if let Ok(layout) = fallback_layout(size) {
                    self.fallback_deallocate(ptr, layout);
                }
            }
        }
    }

    /// Send a request straight to the fallback allocator
    pub(crate) fn fallback_allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() != 0);
        let ptr = unsafe { self.fallback.alloc(layout) };
        tracing::event!(
            Level::TRACE,
            layout = ?layout,
            ptr = ?UsizePtr::from(ptr),
            "fallback allocate"
        );
        NonNull::new(ptr).ok_or_else(|| {
            tracing::event!(
                Level::WARN,
                layout = ?layout,
                "fallback allocator could not satisfy request"
            );
            AllocError::ResourceExhaustion { layout }
        })
    }

    /// # Safety
    ///
    /// `ptr` must have come from [fallback_allocate](Self::fallback_allocate)
    /// with the same `layout`
    pub(crate) unsafe fn fallback_deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        tracing::event!(
            Level::TRACE,
            layout = ?layout,
            ptr = ?UsizePtr::from(ptr.as_ptr()),
            "fallback deallocate"
        );
        self.fallback.dealloc(ptr.as_ptr(), layout);
    }
}

/// Layout used for requests above the largest size class
#[inline]
fn fallback_layout(size: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(size, SLOT_ALIGN).map_err(|_| AllocError::InvalidSize { size })
}

static GLOBAL_ROUTER: OnceLock<PoolRouter> = OnceLock::new();

/// The process-wide router, built with the default configuration
/// the first time anything asks for it
pub fn global() -> &'static PoolRouter {
    GLOBAL_ROUTER.get_or_init(|| {
        PoolRouter::new()
            .unwrap_or_else(|e| panic!("default pool configuration rejected: {e}"))
    })
}

/// Build the process-wide router now rather than on first use
pub fn init_global() {
    global();
}

/// [PoolRouter::allocate] on the [global] router
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    global().allocate(size)
}

/// [PoolRouter::deallocate] on the [global] router
///
/// # Safety
///
/// Same as [PoolRouter::deallocate], with `ptr` having come from [allocate]
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    global().deallocate(ptr, size)
}
