//! Key, value, and comparator types for the index.
//!
//! Keys are fixed-size byte packages compared through comparator objects,
//! so the same key type can carry several orders (full compare for unique
//! lookups, prefix compare for compound-key scans). Values are fixed-size
//! `Copy` records; leaves store user values, internal pages store child
//! page ids.

use crate::page::PageId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A fixed-size key that can be packed into a page slot.
pub trait IndexKey:
    Copy + Default + std::fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// Number of bytes this key occupies in a slot.
    const ENCODED_LEN: usize;

    /// Writes the key into `buf` (exactly `ENCODED_LEN` bytes).
    fn write_to(&self, buf: &mut [u8]);

    /// Reads a key back from `buf` (exactly `ENCODED_LEN` bytes).
    fn read_from(buf: &[u8]) -> Self;
}

/// A fixed-size value that can be packed into a page slot.
pub trait SlotValue:
    Copy + std::fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// Number of bytes this value occupies in a slot.
    const ENCODED_LEN: usize;

    /// Writes the value into `buf` (exactly `ENCODED_LEN` bytes).
    fn write_to(&self, buf: &mut [u8]);

    /// Reads a value back from `buf` (exactly `ENCODED_LEN` bytes).
    fn read_from(buf: &[u8]) -> Self;
}

/// A total order over keys of type `K`.
///
/// Comparators are small cloneable objects so a tree can hold a default
/// order while individual lookups supply another (e.g. a prefix order over
/// the same compound key type).
pub trait KeyComparator<K>: Clone + Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Fixed-width compound key of `N` bytes (4, 8, 16, 32, or 64 in practice).
///
/// Integer components are stored big-endian so that the lexicographic byte
/// order used by [`DefaultComparator`] matches numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompoundKey<const N: usize>(pub [u8; N]);

impl<const N: usize> Default for CompoundKey<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> CompoundKey<N> {
    /// Creates a key from raw bytes.
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Creates a key whose leading bytes encode `v` big-endian.
    ///
    /// For N >= 8 the value fills the first eight bytes and the rest stay
    /// zero; for smaller N the low-order bytes of `v` are kept.
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; N];
        let be = v.to_be_bytes();
        if N >= 8 {
            bytes[..8].copy_from_slice(&be);
        } else {
            bytes.copy_from_slice(&be[8 - N..]);
        }
        Self(bytes)
    }

    /// Decodes the leading bytes as a big-endian integer (inverse of
    /// [`CompoundKey::from_u64`]).
    pub fn as_u64(&self) -> u64 {
        let mut be = [0u8; 8];
        if N >= 8 {
            be.copy_from_slice(&self.0[..8]);
        } else {
            be[8 - N..].copy_from_slice(&self.0);
        }
        u64::from_be_bytes(be)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> std::fmt::Display for CompoundKey<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

impl<const N: usize> IndexKey for CompoundKey<N> {
    const ENCODED_LEN: usize = N;

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.0);
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&buf[..N]);
        Self(bytes)
    }
}

/// Lexicographic order over the full key bytes. The default tree order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl<const N: usize> KeyComparator<CompoundKey<N>> for DefaultComparator {
    #[inline]
    fn compare(&self, a: &CompoundKey<N>, b: &CompoundKey<N>) -> Ordering {
        a.0.cmp(&b.0)
    }
}

/// Order over the first `prefix_len` bytes of a compound key.
///
/// Two keys that agree on the prefix compare equal, which makes prefix
/// lookups over compound keys return every matching entry.
#[derive(Debug, Clone, Copy)]
pub struct PrefixComparator {
    pub prefix_len: usize,
}

impl PrefixComparator {
    pub fn new(prefix_len: usize) -> Self {
        Self { prefix_len }
    }
}

impl<const N: usize> KeyComparator<CompoundKey<N>> for PrefixComparator {
    #[inline]
    fn compare(&self, a: &CompoundKey<N>, b: &CompoundKey<N>) -> Ordering {
        let len = self.prefix_len.min(N);
        a.0[..len].cmp(&b.0[..len])
    }
}

/// Identifier of a record in an external table: a page plus a slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

impl SlotValue for RecordId {
    const ENCODED_LEN: usize = 8;

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        Self {
            page_id: PageId(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            slot: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl SlotValue for PageId {
    const ENCODED_LEN: usize = 4;

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.0.to_le_bytes());
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        PageId(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

impl SlotValue for u64 {
    const ENCODED_LEN: usize = 8;

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

impl SlotValue for u32 {
    const ENCODED_LEN: usize = 4;

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_key_from_u64_order() {
        let a = CompoundKey::<8>::from_u64(1);
        let b = CompoundKey::<8>::from_u64(2);
        let c = CompoundKey::<8>::from_u64(300);

        let cmp = DefaultComparator;
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.compare(&b, &c), Ordering::Less);
        assert_eq!(cmp.compare(&c, &a), Ordering::Greater);
        assert_eq!(cmp.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_compound_key_u64_roundtrip() {
        for v in [0u64, 1, 255, 256, u32::MAX as u64, u64::MAX] {
            assert_eq!(CompoundKey::<8>::from_u64(v).as_u64(), v);
            assert_eq!(CompoundKey::<16>::from_u64(v).as_u64(), v);
        }
        // Narrow keys keep the low-order bytes.
        assert_eq!(CompoundKey::<4>::from_u64(7).as_u64(), 7);
        assert_eq!(CompoundKey::<4>::from_u64(u32::MAX as u64).as_u64(), u32::MAX as u64);
    }

    #[test]
    fn test_compound_key_encode_roundtrip() {
        let key = CompoundKey::<16>::from_u64(0xDEAD_BEEF);
        let mut buf = [0u8; 16];
        key.write_to(&mut buf);
        let back = CompoundKey::<16>::read_from(&buf);
        assert_eq!(key, back);
    }

    #[test]
    fn test_compound_key_display() {
        assert_eq!(CompoundKey::<8>::from_u64(42).to_string(), "42");
    }

    #[test]
    fn test_prefix_comparator() {
        // Compound key: 8-byte primary + 8-byte tiebreaker.
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        a[..8].copy_from_slice(&10u64.to_be_bytes());
        a[8..].copy_from_slice(&1u64.to_be_bytes());
        b[..8].copy_from_slice(&10u64.to_be_bytes());
        b[8..].copy_from_slice(&2u64.to_be_bytes());

        let a = CompoundKey::<16>::new(a);
        let b = CompoundKey::<16>::new(b);

        let full = DefaultComparator;
        let prefix = PrefixComparator::new(8);

        assert_eq!(full.compare(&a, &b), Ordering::Less);
        assert_eq!(prefix.compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn test_prefix_comparator_clamps_to_key_len() {
        let a = CompoundKey::<4>::from_u64(1);
        let b = CompoundKey::<4>::from_u64(2);
        let prefix = PrefixComparator::new(64);
        assert_eq!(prefix.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_record_id_roundtrip() {
        let rid = RecordId::new(PageId(7), 21);
        let mut buf = [0u8; 8];
        rid.write_to(&mut buf);
        assert_eq!(RecordId::read_from(&buf), rid);
    }

    #[test]
    fn test_record_id_display() {
        let rid = RecordId::new(PageId(3), 9);
        assert_eq!(rid.to_string(), "page:3:9");
    }

    #[test]
    fn test_page_id_slot_value_roundtrip() {
        let mut buf = [0u8; 4];
        PageId(99).write_to(&mut buf);
        assert_eq!(<PageId as SlotValue>::read_from(&buf), PageId(99));
    }

    #[test]
    fn test_primitive_slot_values() {
        let mut buf8 = [0u8; 8];
        0xABCD_EF01_2345u64.write_to(&mut buf8);
        assert_eq!(<u64 as SlotValue>::read_from(&buf8), 0xABCD_EF01_2345u64);

        let mut buf4 = [0u8; 4];
        0xBEEFu32.write_to(&mut buf4);
        assert_eq!(<u32 as SlotValue>::read_from(&buf4), 0xBEEFu32);
    }

    #[test]
    fn test_encoded_len_constants() {
        assert_eq!(<CompoundKey<8> as IndexKey>::ENCODED_LEN, 8);
        assert_eq!(<CompoundKey<64> as IndexKey>::ENCODED_LEN, 64);
        assert_eq!(<RecordId as SlotValue>::ENCODED_LEN, 8);
        assert_eq!(<PageId as SlotValue>::ENCODED_LEN, 4);
    }
}
