//! Checking output rows against an expected result.
//!
//! What a correct output looks like depends on the operands placed in memory, not on the
//! multiply, so the rule is an [Expectation] supplied by whoever built the operands.

use crate::common::{DimSize, Dtype};
use crate::scratch::ScratchBuffer;

use ndarray::Array2;

pub trait Expectation {
    fn expected(&self, row: u32, col: u32) -> i64;
}

/// `(row + 1) * scale` on the diagonal and zero elsewhere.
///
/// This is the product of `A = diag(1, 2, ..., n)` and `B = diag(scale)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledDiagonal {
    pub scale: i64,
}

/// The row-dot-row product `A · Bᵗ` computed directly from the operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceProduct {
    expected: Array2<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub row: u32,
    pub col: u32,
    pub expected: i64,
    pub observed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationRecord {
    pub mismatches: Vec<Mismatch>,
    pub cells_checked: u64,
}

impl Expectation for ScaledDiagonal {
    fn expected(&self, row: u32, col: u32) -> i64 {
        if row == col {
            (i64::from(row) + 1).wrapping_mul(self.scale)
        } else {
            0
        }
    }
}

impl Default for ScaledDiagonal {
    fn default() -> Self {
        ScaledDiagonal { scale: 2 }
    }
}

impl ReferenceProduct {
    /// Both operands are wrapped to `dtype` first, as they would be when stored to memory,
    /// and every product and sum wraps the same way the kernel's accumulator does.
    pub fn new(a: &Array2<i64>, b: &Array2<i64>, dtype: Dtype) -> Self {
        assert_eq!(a.dim(), b.dim(), "operands must have the same shape");
        let a = a.mapv(|x| dtype.wrap(x));
        let b = b.mapv(|x| dtype.wrap(x));
        let expected = Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
            let dot = a
                .row(i)
                .iter()
                .zip(b.row(j))
                .fold(0i64, |acc, (x, y)| acc.wrapping_add(x.wrapping_mul(*y)));
            dtype.wrap(dot)
        });
        ReferenceProduct { expected }
    }

    pub fn matrix(&self) -> &Array2<i64> {
        &self.expected
    }
}

impl Expectation for ReferenceProduct {
    fn expected(&self, row: u32, col: u32) -> i64 {
        self.expected[[row as usize, col as usize]]
    }
}

impl<F> Expectation for F
where
    F: Fn(u32, u32) -> i64,
{
    fn expected(&self, row: u32, col: u32) -> i64 {
        self(row, col)
    }
}

/// Yields a [Mismatch] for each of the first `n` cells of `buffer`, holding output row
/// `row`, which differs from `rule`.
///
/// Never stops early: every cell is compared.
pub fn verify_row<'a, E>(
    row: u32,
    n: DimSize,
    rule: &'a E,
    buffer: &'a ScratchBuffer,
) -> impl Iterator<Item = Mismatch> + 'a
where
    E: Expectation + ?Sized,
{
    (0..n.get()).filter_map(move |col| {
        let observed = buffer.read(col);
        let expected = buffer.dtype().wrap(rule.expected(row, col));
        (observed != expected).then_some(Mismatch {
            row,
            col,
            expected,
            observed,
        })
    })
}

impl VerificationRecord {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}
