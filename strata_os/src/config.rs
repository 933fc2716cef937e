//! Configuration for the OS layer.
//!
//! All values are resolved once, before [`os_init`](crate::os_init), and
//! are immutable afterwards. Environment overrides use the `STRATA_*`
//! variables listed on [`OsConfig::from_env`].

use crate::page::PageSize;

/// Largest registry capacity accepted by [`OsConfig::validate`].
pub const MAX_REGION_CAPACITY: usize = 1024;

/// Configuration for the OS layer.
///
/// # Example
///
/// ```ignore
/// use strata_os::OsConfig;
///
/// let config = OsConfig {
///     max_regions: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsConfig {
    // =========================================================================
    // Write Barrier
    // =========================================================================
    /// Install protection-fault handlers for the write barrier.
    ///
    /// When disabled the collector must scan every page instead of relying
    /// on dirty-page tracking.
    ///
    /// Default: true
    pub page_protection: bool,

    /// Forward faults this layer does not own to the handler that was
    /// installed before ours.
    ///
    /// When false (or no such handler exists) unowned faults are re-raised
    /// with the default disposition.
    ///
    /// Default: true
    pub chain_previous_handler: bool,

    // =========================================================================
    // Regions
    // =========================================================================
    /// Maximum number of simultaneously registered regions.
    ///
    /// Default: 64
    pub max_regions: usize,

    /// Low tag bits stripped from tagged references before classification.
    ///
    /// Must be of the form `2^k - 1`.
    ///
    /// Default: 0xf on 64-bit targets, 0x7 on 32-bit targets
    pub lowtag_mask: usize,

    // =========================================================================
    // Zeroing
    // =========================================================================
    /// Ranges at least this large are zeroed by remapping fresh pages
    /// instead of filling bytes.
    ///
    /// Default: 1MB
    pub zero_remap_threshold: usize,

    // =========================================================================
    // Thread Pause
    // =========================================================================
    /// Initial count of the process-wide pause semaphore.
    ///
    /// Default: 0
    pub pause_initial: u32,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            page_protection: true,
            chain_previous_handler: true,
            max_regions: 64,
            lowtag_mask: default_lowtag_mask(),
            zero_remap_threshold: 1024 * 1024, // 1MB
            pause_initial: 0,
        }
    }
}

impl OsConfig {
    /// Configuration without a write-barrier handler.
    pub fn without_page_protection() -> Self {
        Self {
            page_protection: false,
            ..Default::default()
        }
    }

    /// Resolve configuration from the process environment.
    ///
    /// | Variable                      | Field                    |
    /// |-------------------------------|--------------------------|
    /// | `STRATA_PAGE_PROTECTION`      | `page_protection`        |
    /// | `STRATA_CHAIN_HANDLER`        | `chain_previous_handler` |
    /// | `STRATA_MAX_REGIONS`          | `max_regions`            |
    /// | `STRATA_ZERO_REMAP_THRESHOLD` | `zero_remap_threshold`   |
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(enabled) = lookup("STRATA_PAGE_PROTECTION").map(|v| env_bool(&v)) {
            config.page_protection = enabled;
        }
        if let Some(enabled) = lookup("STRATA_CHAIN_HANDLER").map(|v| env_bool(&v)) {
            config.chain_previous_handler = enabled;
        }
        if let Some(n) = lookup("STRATA_MAX_REGIONS").and_then(|v| v.parse().ok()) {
            config.max_regions = n;
        }
        if let Some(n) = lookup("STRATA_ZERO_REMAP_THRESHOLD").and_then(|v| parse_size(&v)) {
            config.zero_remap_threshold = n;
        }

        config
    }

    /// Validate configuration values against this host's page size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_for(PageSize::query())
    }

    /// Validate configuration values for hosts with pages of `page` bytes.
    pub fn validate_for(&self, page: PageSize) -> Result<(), ConfigError> {
        if self.max_regions == 0 {
            return Err(ConfigError::NoRegions);
        }
        if self.max_regions > MAX_REGION_CAPACITY {
            return Err(ConfigError::TooManyRegions);
        }
        if !(self.lowtag_mask.wrapping_add(1)).is_power_of_two() {
            return Err(ConfigError::InvalidLowtagMask);
        }
        if self.zero_remap_threshold < page.get() {
            return Err(ConfigError::ZeroThresholdTooSmall);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_regions` is zero.
    NoRegions,
    /// `max_regions` exceeds [`MAX_REGION_CAPACITY`].
    TooManyRegions,
    /// `lowtag_mask` is not of the form `2^k - 1`.
    InvalidLowtagMask,
    /// `zero_remap_threshold` is below one page.
    ZeroThresholdTooSmall,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoRegions => write!(f, "max_regions must be at least 1"),
            ConfigError::TooManyRegions => {
                write!(f, "max_regions must be at most {}", MAX_REGION_CAPACITY)
            }
            ConfigError::InvalidLowtagMask => write!(f, "lowtag mask must be 2^k - 1"),
            ConfigError::ZeroThresholdTooSmall => {
                write!(f, "zero remap threshold must be at least one page")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[inline]
const fn default_lowtag_mask() -> usize {
    if cfg!(target_pointer_width = "64") {
        0xf
    } else {
        0x7
    }
}

/// Truthy unless empty or `"0"`.
#[inline]
fn env_bool(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

/// Parse a byte count with an optional `K`/`M`/`G` suffix.
fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 10),
        'm' | 'M' => (&value[..value.len() - 1], 20),
        'g' | 'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    digits.parse::<usize>().ok()?.checked_mul(1usize << shift)
}
