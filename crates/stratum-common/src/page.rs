//! Page identifiers and on-disk page constants.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Unique identifier for a page within the index file.
///
/// Page 0 is reserved for the index header page. `PageId::INVALID` is the
/// sentinel meaning "no page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel value meaning "no page".
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Page id of the index header page.
    pub const HEADER: PageId = PageId(0);

    /// Returns true if this is a valid page id.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the raw u32 representation.
    #[inline]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:none")
        }
    }
}

/// Page type tag stored in the first four bytes of every index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PageType {
    /// Unallocated or zeroed page.
    Invalid = 0,
    /// Index header page (holds the root page id).
    Header = 1,
    /// B+ tree leaf page.
    Leaf = 2,
    /// B+ tree internal page.
    Internal = 3,
}

impl PageType {
    /// Decodes a tag value; unknown tags decode as `Invalid`.
    pub fn from_u32(tag: u32) -> Self {
        match tag {
            1 => PageType::Header,
            2 => PageType::Leaf,
            3 => PageType::Internal,
            _ => PageType::Invalid,
        }
    }
}
