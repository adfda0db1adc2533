//! Operand construction and memory-image setup for running the kernel.

use crate::common::{DimSize, Dtype};
use crate::config::ValidatedConfig;
use crate::memory::{MemoryError, MemoryImage};
use crate::verify::ReferenceProduct;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The `A` and `B` matrices of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operands {
    pub a: Array2<i64>,
    pub b: Array2<i64>,
}

impl Operands {
    /// `A = diag(1, 2, ..., n)` and `B = diag(2)`, whose product matches
    /// [crate::verify::ScaledDiagonal::default].
    pub fn diagonal(n: DimSize) -> Self {
        let n = n.get() as usize;
        let a = Array2::from_shape_fn((n, n), |(y, x)| if x == y { y as i64 + 1 } else { 0 });
        let b = Array2::from_shape_fn((n, n), |(y, x)| if x == y { 2 } else { 0 });
        Operands { a, b }
    }

    /// Uniformly random elements in `-magnitude..=magnitude`.
    pub fn random(n: DimSize, seed: u64, magnitude: u32) -> Self {
        let n = n.get() as usize;
        let magnitude = i64::from(magnitude);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = || {
            Array2::from_shape_simple_fn((n, n), || rng.gen_range(-magnitude..=magnitude))
        };
        let a = sample();
        let b = sample();
        Operands { a, b }
    }

    pub fn reference(&self, dtype: Dtype) -> ReferenceProduct {
        ReferenceProduct::new(&self.a, &self.b, dtype)
    }

    /// A zeroed memory image holding `A` and `B` at the configured offsets.
    pub fn image(&self, config: &ValidatedConfig) -> Result<MemoryImage, MemoryError> {
        let n = config.size.get() as usize;
        assert_eq!(self.a.dim(), (n, n), "A does not match the configured size");
        assert_eq!(self.b.dim(), (n, n), "B does not match the configured size");
        let mut image = MemoryImage::new(config.memory_bytes);
        image.place_matrix(config.a_offset, config.dtype, &self.a)?;
        image.place_matrix(config.b_offset, config.dtype, &self.b)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::verify::{Expectation, ScaledDiagonal};
    use ndarray::array;
    use nonzero::nonzero as nz;

    #[test]
    fn test_diagonal_operands() {
        let ops = Operands::diagonal(nz!(3u32));
        assert_eq!(ops.a, array![[1i64, 0, 0], [0, 2, 0], [0, 0, 3]]);
        assert_eq!(ops.b, array![[2i64, 0, 0], [0, 2, 0], [0, 0, 2]]);
    }

    #[test]
    fn test_diagonal_reference_agrees_with_scaled_diagonal() {
        let n = nz!(5u32);
        let reference = Operands::diagonal(n).reference(Dtype::Sint32);
        let rule = ScaledDiagonal::default();
        for i in 0..n.get() {
            for j in 0..n.get() {
                assert_eq!(reference.expected(i, j), rule.expected(i, j));
            }
        }
    }

    #[test]
    fn test_random_operands_are_seeded() {
        let n = nz!(4u32);
        assert_eq!(Operands::random(n, 7, 3), Operands::random(n, 7, 3));
        assert!(Operands::random(n, 7, 3).a.iter().all(|x| x.abs() <= 3));
    }

    #[test]
    fn test_random_magnitude_extremes() {
        let n = nz!(3u32);
        let zero = Operands::random(n, 1, 0);
        assert!(zero.a.iter().chain(zero.b.iter()).all(|&x| x == 0));
        let widest = Operands::random(n, 1, u32::MAX);
        let limit = i64::from(u32::MAX);
        assert!(widest.a.iter().all(|x| x.abs() <= limit));
    }

    #[test]
    fn test_image_places_operands_and_leaves_c_zeroed() {
        let config = KernelConfig::with_size(nz!(4u32)).validate().unwrap();
        let ops = Operands::diagonal(config.size);
        let image = ops.image(&config).unwrap();
        assert_eq!(
            image.read_matrix(config.a_offset, config.dtype, config.size).unwrap(),
            ops.a
        );
        assert_eq!(
            image.read_matrix(config.b_offset, config.dtype, config.size).unwrap(),
            ops.b
        );
        assert!(image
            .read_matrix(config.c_offset, config.dtype, config.size)
            .unwrap()
            .iter()
            .all(|&x| x == 0));
    }
}
