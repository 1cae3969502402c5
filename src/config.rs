//! Code cache configuration parameters.
//!
//! All sizes are resolved once at startup; the cache reads from the struct
//! without any per-operation cost. Option-name constants tie diagnostics to
//! the runtime flags that control each value.

use crate::layout::WORD_SIZE;

/// Option name governing the baseline (semi-space) region capacity.
pub const RESERVED_BASELINE_CODE_CACHE_SIZE: &str = "ReservedBaselineCodeCacheSize";

/// Option name governing the opt (append-only) region capacity.
pub const RESERVED_OPT_CODE_CACHE_SIZE: &str = "ReservedOptCodeCacheSize";

/// Option name of the contention-test knob.
pub const CODE_CACHE_CONTENTION_FREQUENCY: &str = "CodeCacheContentionFrequency";

/// Option name governing the boot-region (boot-image) budget.
pub const BOOT_CODE_REGION_SIZE: &str = "BootCodeRegionSize";

/// Configuration for the code cache.
///
/// # Example
///
/// ```ignore
/// use codecache::CacheConfig;
///
/// // Small cache for an embedding that compiles little baseline code
/// let config = CacheConfig {
///     baseline_size: 16 * 1024 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total bytes reserved for the semi-space baseline region.
    ///
    /// Each semi-space half is half this value. A vast amount of baseline
    /// code is generated in practice, so the default is large.
    ///
    /// Default: 128 MiB
    pub baseline_size: usize,

    /// Bytes reserved for the append-only opt region.
    ///
    /// Very little long-lived code is generated in practice, so this region
    /// is small. Filling it indicates misconfiguration.
    ///
    /// Default: 16 MiB
    pub opt_size: usize,

    /// Bytes reserved for the immortal boot region.
    ///
    /// Sized for the boot image; bundles planted here are never evicted.
    ///
    /// Default: 8 MiB
    pub boot_size: usize,

    /// Force baseline code cache contention every N method allocations.
    ///
    /// When positive, every N-th baseline allocation fails its first
    /// attempt, exercising the eviction path deterministically. Survivor
    /// statistics of the forced evictions are logged when
    /// `trace_eviction` is set.
    ///
    /// Default: 0 (off)
    pub contention_frequency: u32,

    /// Emit a trace line for every bundle allocation.
    ///
    /// Default: false
    pub trace_allocation: bool,

    /// Emit trace lines for eviction phases and root-table growth.
    ///
    /// Default: false
    pub trace_eviction: bool,

    /// Assert reference-map consistency at runtime entry points.
    ///
    /// Consumed by the surrounding runtime, not the cache; carried here so
    /// the whole code subsystem resolves its flags from one place.
    ///
    /// Default: false
    pub verify_ref_maps: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            baseline_size: 128 * 1024 * 1024,
            opt_size: 16 * 1024 * 1024,
            boot_size: 8 * 1024 * 1024,
            contention_frequency: 0,
            trace_allocation: false,
            trace_eviction: false,
            verify_ref_maps: false,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with minimal region sizes, for tests and
    /// embeddings that compile almost nothing.
    pub fn minimal() -> Self {
        Self {
            baseline_size: 256 * 1024,
            opt_size: 64 * 1024,
            boot_size: 64 * 1024,
            ..Default::default()
        }
    }

    /// Total window size the cache reserves for all regions.
    #[inline]
    pub fn window_size(&self) -> usize {
        self.boot_size + self.baseline_size + self.opt_size
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baseline_size == 0 || self.opt_size == 0 || self.boot_size == 0 {
            return Err(ConfigError::ZeroRegionSize);
        }
        if self.baseline_size % (2 * WORD_SIZE) != 0 {
            return Err(ConfigError::UnalignedBaselineSize);
        }
        if self.opt_size % WORD_SIZE != 0 || self.boot_size % WORD_SIZE != 0 {
            return Err(ConfigError::UnalignedRegionSize);
        }
        if self.window_size() > i32::MAX as usize {
            return Err(ConfigError::WindowExceedsDisplacementSpan);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Every region must have a non-zero capacity.
    ZeroRegionSize,
    /// The baseline size must split into two word-aligned halves.
    UnalignedBaselineSize,
    /// Region sizes must be word-aligned.
    UnalignedRegionSize,
    /// The combined window must stay within a 32-bit displacement span.
    WindowExceedsDisplacementSpan,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroRegionSize => write!(f, "region sizes must be non-zero"),
            ConfigError::UnalignedBaselineSize => write!(
                f,
                "{} must split into two word-aligned halves",
                RESERVED_BASELINE_CODE_CACHE_SIZE
            ),
            ConfigError::UnalignedRegionSize => write!(f, "region sizes must be word-aligned"),
            ConfigError::WindowExceedsDisplacementSpan => write!(
                f,
                "combined region sizes exceed the 32-bit PC-relative displacement span"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert!(CacheConfig::minimal().validate().is_ok());
    }

    #[test]
    fn test_default_sizes() {
        let config = CacheConfig::default();
        assert_eq!(config.baseline_size, 128 * 1024 * 1024);
        assert_eq!(config.opt_size, 16 * 1024 * 1024);
        assert_eq!(config.contention_frequency, 0);
    }

    #[test]
    fn test_zero_region_rejected() {
        let config = CacheConfig {
            opt_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroRegionSize));
    }

    #[test]
    fn test_odd_baseline_rejected() {
        let config = CacheConfig {
            baseline_size: 2 * WORD_SIZE + WORD_SIZE,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::UnalignedBaselineSize));
    }

    #[test]
    fn test_oversized_window_rejected() {
        let config = CacheConfig {
            baseline_size: 2 * 1024 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::WindowExceedsDisplacementSpan)
        );
    }
}
