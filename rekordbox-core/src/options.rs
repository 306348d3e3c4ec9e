//! Tunable thresholds for the database reader

use serde::{Deserialize, Serialize};

/// Smallest page size accepted by default. Big enough for the page header
/// and one row group with room left for a heap.
pub const DEFAULT_MIN_PAGE_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Reject files whose header declares a smaller page size
    pub min_page_size: u32,
    /// Upper bound on pages visited per table chain; 0 means the number of
    /// pages in the file
    pub max_chain_steps: usize,
    /// Treat a page whose header index differs from its position as corrupt
    pub strict_page_index: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            min_page_size: DEFAULT_MIN_PAGE_SIZE,
            max_chain_steps: 0,
            strict_page_index: true,
        }
    }
}
