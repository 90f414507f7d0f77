//! Size class configuration
//!
//! All of these are fixed once a [PoolRouter](crate::PoolRouter) is built.

use std::mem::{align_of, size_of};

use crate::{error::AllocError, size_class::Slot, util::roundto};

/// Granularity (in bytes) by which size classes increase
pub const BASE_UNIT: usize = 8;
/// Number of size classes in the default router
pub const NUM_SIZE_CLASSES: usize = 64;
/// Largest request served by a pool, anything bigger goes to the fallback allocator
pub const MAX_SLOT_SIZE: usize = BASE_UNIT * NUM_SIZE_CLASSES;
/// Size in bytes of each block a pool requests from the system allocator
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Every slot starts on an address divisible by this
pub const SLOT_ALIGN: usize = align_of::<Slot>();

/// Bytes at the start of each block reserved for the block chain link,
/// rounded so that the first slot is aligned
pub const BLOCK_HDR_SZ: usize = roundto(size_of::<*mut u8>(), SLOT_ALIGN);

/// Parameters of a [PoolRouter](crate::PoolRouter)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Slot size of the smallest class, and the step between classes
    pub base_unit: usize,
    /// Number of pools, pool `i` has slot size `(i + 1) * base_unit`
    pub num_size_classes: usize,
    /// Size of each block requested by a pool
    pub block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_unit: BASE_UNIT,
            num_size_classes: NUM_SIZE_CLASSES,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn with_base_unit(mut self, base_unit: usize) -> Self {
        self.base_unit = base_unit;
        self
    }

    pub fn with_num_size_classes(mut self, num_size_classes: usize) -> Self {
        self.num_size_classes = num_size_classes;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Slot size of the largest class (the fallback ceiling)
    ///
    /// Only meaningful on a validated config
    #[inline]
    pub fn max_slot_size(&self) -> usize {
        self.base_unit * self.num_size_classes
    }

    /// Slot size of class `i`
    #[inline]
    pub fn slot_size_of(&self, i: usize) -> usize {
        (i + 1) * self.base_unit
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if self.base_unit == 0 {
            return Err(AllocError::InvalidConfig("base unit must be nonzero"));
        }
        if self.base_unit % SLOT_ALIGN != 0 {
            return Err(AllocError::InvalidConfig(
                "base unit must be a multiple of the slot alignment",
            ));
        }
        if self.base_unit < size_of::<Slot>() {
            return Err(AllocError::InvalidConfig(
                "base unit must be able to hold a free list link",
            ));
        }
        if self.num_size_classes == 0 {
            return Err(AllocError::InvalidConfig("need at least one size class"));
        }
        let Some(max_slot_size) = self.base_unit.checked_mul(self.num_size_classes) else {
            return Err(AllocError::InvalidConfig("largest size class overflows"));
        };
        let Some(min_block_size) = max_slot_size.checked_add(BLOCK_HDR_SZ) else {
            return Err(AllocError::InvalidConfig("largest size class overflows"));
        };
        if self.block_size < min_block_size {
            return Err(AllocError::InvalidConfig(
                "block size cannot hold a slot of the largest size class",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn default_matches_constants() {
        let config = PoolConfig::default();
        assert_eq!(config.max_slot_size(), MAX_SLOT_SIZE);
        assert_eq!(config.slot_size_of(0), BASE_UNIT);
        assert_eq!(config.slot_size_of(NUM_SIZE_CLASSES - 1), MAX_SLOT_SIZE);
        config.validate().unwrap();
    }

    #[cfg(not(loom))]
    #[test]
    fn default_sizes() {
        assert_eq!(MAX_SLOT_SIZE, 512);
        assert_eq!(SLOT_ALIGN, 8);
        assert_eq!(BLOCK_HDR_SZ, 8);
    }

    #[cfg(not(loom))]
    #[test]
    fn rejects_bad_configs() {
        let base = PoolConfig::default();
        assert!(matches!(
            base.with_base_unit(0).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            base.with_base_unit(SLOT_ALIGN + 1).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            base.with_num_size_classes(0).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            base.with_num_size_classes(usize::MAX).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        // the largest class itself fits, but not with the block header
        assert!(matches!(
            base.with_num_size_classes(usize::MAX / BASE_UNIT).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            base.with_block_size(MAX_SLOT_SIZE).validate(),
            Err(AllocError::InvalidConfig(_))
        ));
        base.with_block_size(BLOCK_HDR_SZ + MAX_SLOT_SIZE)
            .validate()
            .unwrap();
    }
}
