//! Log sequence number (LSN) value type.
//!
//! SQL Server identifies a commit position with a 10-byte binary LSN
//! consisting of:
//! - VLF sequence number (4 bytes)
//! - Log block offset (4 bytes)
//! - Slot number (2 bytes)
//!
//! The engine treats the token as opaque: the only operations it needs are
//! total ordering (unsigned lexicographic byte order), a zero sentinel for
//! "never ingested", and hex rendering for logs. Drivers occasionally hand
//! back fewer than 10 bytes for small values, so every boundary normalizes
//! through [`Lsn::from_bytes`], which left-pads with zeros. Comparing raw
//! byte slices without normalizing is a bug.

use std::borrow::Cow;
use std::fmt;

use tiberius::{ColumnData, ToSql};

/// Width of a SQL Server LSN in bytes.
pub const LSN_LEN: usize = 10;

/// A 10-byte log sequence number with unsigned lexicographic ordering.
///
/// The derived `Ord` on the inner byte array is exactly the order SQL Server
/// assigns to commit positions, so `Lsn` values can be compared, sorted and
/// `MIN()`-ed freely once normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn([u8; LSN_LEN]);

impl Lsn {
    /// The zero LSN, meaning "never ingested".
    pub const ZERO: Lsn = Lsn([0u8; LSN_LEN]);

    /// Normalize an arbitrary byte slice into a 10-byte LSN.
    ///
    /// Shorter inputs are left-padded with zeros; longer inputs keep their
    /// low 10 bytes. An empty slice yields [`Lsn::ZERO`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut padded = [0u8; LSN_LEN];
        if bytes.len() >= LSN_LEN {
            padded.copy_from_slice(&bytes[bytes.len() - LSN_LEN..]);
        } else {
            padded[LSN_LEN - bytes.len()..].copy_from_slice(bytes);
        }
        Lsn(padded)
    }

    /// Whether this is the zero LSN.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// The normalized 10-byte representation.
    pub fn as_bytes(&self) -> &[u8; LSN_LEN] {
        &self.0
    }

    /// Render as a `0x`-prefixed lowercase hex string.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl ToSql for Lsn {
    fn to_sql(&self) -> ColumnData<'_> {
        ColumnData::Binary(Some(Cow::Borrowed(&self.0[..])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_short_input() {
        let lsn = Lsn::from_bytes(&[0x02]);
        assert_eq!(
            lsn.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02],
            "short inputs are left-padded"
        );
    }

    #[test]
    fn test_pad_long_input_keeps_low_bytes() {
        let long = [0xAA, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let lsn = Lsn::from_bytes(&long);
        assert_eq!(lsn.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_pad_is_idempotent() {
        let once = Lsn::from_bytes(&[0x01, 0x02]);
        let twice = Lsn::from_bytes(once.as_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_zero() {
        assert!(Lsn::ZERO.is_zero());
        assert!(Lsn::from_bytes(&[]).is_zero());
        assert!(Lsn::from_bytes(&[0, 0, 0]).is_zero());
        assert!(!Lsn::from_bytes(&[1]).is_zero());
    }

    #[test]
    fn test_ordering_matches_padded_comparison() {
        let a = Lsn::from_bytes(&[0x01]);
        let b = Lsn::from_bytes(&[0x01, 0x00]);
        let c = Lsn::from_bytes(&[0x02]);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_hex_rendering() {
        let lsn = Lsn::from_bytes(&[0xAB, 0xCD]);
        assert_eq!(lsn.to_hex(), "0x0000000000000000abcd");
        assert_eq!(format!("{}", lsn), "0x0000000000000000abcd");
    }
}
