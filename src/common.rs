use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;

/// A byte address in the external memory image.
pub type Addr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    #[value(name = "i8")]
    Sint8,
    #[value(name = "i16")]
    Sint16,
    #[value(name = "i32")]
    Sint32,
    #[value(name = "i64")]
    Sint64,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Sint8 => 1,
            Dtype::Sint16 => 2,
            Dtype::Sint32 => 4,
            Dtype::Sint64 => 8,
        }
    }

    pub fn bits(&self) -> u32 {
        u32::from(self.size()) * 8
    }

    /// Truncates `value` to this Dtype's width and sign-extends it back.
    ///
    /// This is the two's-complement value a register of this width would hold.
    ///
    /// # Examples
    /// ```
    /// # use blockmm::common::Dtype;
    /// assert_eq!(Dtype::Sint8.wrap(127), 127);
    /// assert_eq!(Dtype::Sint8.wrap(128), -128);
    /// assert_eq!(Dtype::Sint16.wrap(-1), -1);
    /// assert_eq!(Dtype::Sint64.wrap(i64::MIN), i64::MIN);
    /// ```
    pub fn wrap(&self, value: i64) -> i64 {
        let shift = 64 - self.bits();
        (value << shift) >> shift
    }

    /// Decodes a little-endian element. `bytes` must be exactly [Dtype::size] long.
    pub fn decode(&self, bytes: &[u8]) -> i64 {
        debug_assert_eq!(bytes.len(), usize::from(self.size()));
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        self.wrap(i64::from_le_bytes(buf))
    }

    /// Encodes the wrapped `value` into `out` as little-endian.
    pub fn encode(&self, value: i64, out: &mut [u8]) {
        debug_assert_eq!(out.len(), usize::from(self.size()));
        let len = out.len();
        out.copy_from_slice(&value.to_le_bytes()[..len]);
    }
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::Sint32
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Sint64 => write!(f, "i64"),
        }
    }
}

/// The byte address of row `row` of an `n`-by-`n` row-major matrix at `base`.
pub fn row_address(base: Addr, row: u32, n: DimSize, dtype: Dtype) -> Addr {
    base + u64::from(row) * row_stride(n, dtype)
}

/// The number of bytes between consecutive rows of an `n`-by-`n` row-major matrix.
pub fn row_stride(n: DimSize, dtype: Dtype) -> u64 {
    u64::from(n.get()) * u64::from(dtype.size())
}

/// The number of bytes occupied by an `n`-by-`n` matrix.
pub fn matrix_bytes(n: DimSize, dtype: Dtype) -> u64 {
    u64::from(n.get()) * row_stride(n, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    #[test]
    fn test_row_address_matches_stride() {
        let n = nz!(16u32);
        assert_eq!(row_address(4096, 0, n, Dtype::Sint32), 4096);
        assert_eq!(row_address(4096, 3, n, Dtype::Sint32), 4096 + 3 * 64);
        assert_eq!(matrix_bytes(n, Dtype::Sint32), 1024);
    }

    proptest! {
        #[test]
        fn test_encode_then_decode_is_wrap(dtype in any::<Dtype>(), value in any::<i64>()) {
            let mut buf = vec![0u8; usize::from(dtype.size())];
            dtype.encode(value, &mut buf);
            prop_assert_eq!(dtype.decode(&buf), dtype.wrap(value));
        }

        #[test]
        fn test_wrap_is_idempotent(dtype in any::<Dtype>(), value in any::<i64>()) {
            let once = dtype.wrap(value);
            prop_assert_eq!(dtype.wrap(once), once);
        }
    }
}
