//! Error types for Stratum.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using StratumError.
pub type Result<T> = std::result::Result<T, StratumError>;

/// Errors that can occur in Stratum operations.
///
/// Logical outcomes (duplicate key on insert, missing key on remove or
/// lookup) are not errors; they surface as `false` returns or empty result
/// sets. Out-of-range slot access and structural invariant violations are
/// programmer errors and panic instead of returning a variant.
#[derive(Debug, Error)]
pub enum StratumError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("buffer pool exhausted, no free or evictable frame")]
    PoolExhausted,

    #[error("replacer capacity exceeded ({capacity} frames)")]
    ReplacerOverflow { capacity: usize },

    #[error("frame {frame_id} is not evictable")]
    FrameNotEvictable { frame_id: u32 },

    #[error("page not resident in buffer pool: {page_id}")]
    PageNotResident { page_id: PageId },

    #[error("invalid page id")]
    InvalidPageId,

    // Storage errors
    #[error("page corrupted: {0}")]
    Corrupted(String),
}
