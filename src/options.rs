//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{CellarError, Result};

/// Tunables shared by the buffer pool, cache entries and log segments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellarOptions {
    /// Size of every page buffer in bytes.
    pub page_size: usize,
    /// Number of buffers allocated up front by the pool.
    pub pool_preallocate: usize,
    /// Unchanged bytes tolerated between two changed runs before a page delta
    /// starts a new span.
    pub delta_merge_gap: usize,
    /// Whether log segment readers verify frame checksums.
    pub verify_log_checksums: bool,
}

impl Default for CellarOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_preallocate: 0,
            delta_merge_gap: 8,
            verify_log_checksums: true,
        }
    }
}

impl CellarOptions {
    /// Options with a specific page size and defaults elsewhere.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    /// Parses options from TOML; missing keys fall back to defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: Self = toml::from_str(src).map_err(|e| CellarError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| CellarError::Config(e.to_string()))
    }

    /// Checks that the options describe a usable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(CellarError::Config(format!(
                "page_size {} below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(CellarError::Config(format!(
                "page_size {} exceeds maximum {}",
                self.page_size, MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }
}
