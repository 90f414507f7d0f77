//! Fixed size class slab pool
//!
//! Small allocations are rounded up to a multiple of [BASE_UNIT](config::BASE_UNIT)
//! and served from one [SizeClassPool] per size class. Each pool carves big
//! blocks into slots and recycles freed slots through a lock-free free list.
//! Requests above [MAX_SLOT_SIZE](config::MAX_SLOT_SIZE) go to the system allocator.
//!
//! Pools only ever grow. Blocks are given back when a pool is dropped,
//! which for the [global] router means never.

pub mod config;
pub mod error;
mod loom_testing;
pub mod router;
pub mod size_class;
pub mod typed;
mod util;

#[cfg(test)]
mod test_util;

pub use config::PoolConfig;
pub use error::AllocError;
pub use router::{allocate, deallocate, global, init_global, PoolRouter};
pub use size_class::SizeClassPool;
pub use typed::{construct, destroy, PoolBox};
