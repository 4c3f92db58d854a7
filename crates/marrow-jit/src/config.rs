//! Code cache configuration.

use crate::error::CacheError;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Largest supported region mapping. Header offsets into the data half are
/// stored as 32-bit values, so the whole reservation must stay well under 4 GiB.
pub const MAX_REGION_CAPACITY: usize = 1024 * MB;

/// Configuration for the code cache memory region.
pub struct CacheConfig {
    /// Capacity the cache starts with (code + data), in bytes (default: 64 KiB)
    pub initial_capacity: usize,
    /// Hard ceiling the cache may grow to (default: 64 MiB)
    pub max_capacity: usize,
    /// Permit the single-mapping RWX fallback when dual views are unavailable
    pub allow_rwx_fallback: bool,
    /// Zygote variant: capacity pinned at max, backing file sealed read-only
    pub zygote: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            initial_capacity: 64 * KB,
            max_capacity: 64 * MB,
            allow_rwx_fallback: true,
            zygote: false,
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<(), CacheError> {
        if self.initial_capacity == 0
            || self.initial_capacity > self.max_capacity
            || self.max_capacity > MAX_REGION_CAPACITY
        {
            return Err(CacheError::InvalidCapacity {
                initial: self.initial_capacity,
                max: self.max_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_initial_capacity_rejected() {
        let config = CacheConfig {
            initial_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_above_max_rejected() {
        let config = CacheConfig {
            initial_capacity: 2 * MB,
            max_capacity: MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_above_region_ceiling_rejected() {
        let config = CacheConfig {
            max_capacity: MAX_REGION_CAPACITY + MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
