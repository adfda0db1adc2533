use crate::common::{row_address, Addr, DimSize, Dtype};

use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::ops::Range;
use std::path::Path;

/// A flat, byte-addressed store holding the matrices the kernel reads and writes.
///
/// Elements are little-endian. All accesses are bounds-checked against the image size.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryImage {
    bytes: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {len} bytes at {address:#x} exceeds the {limit}-byte memory image")]
    OutOfRange { address: Addr, len: u64, limit: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum ImageFileError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("malformed memory image: {0}")]
    Encoding(#[from] bincode::Error),
}

impl MemoryImage {
    /// A zero-filled image of `len` bytes.
    pub fn new(len: u64) -> Self {
        let len = usize::try_from(len).expect("memory image must fit in the address space");
        MemoryImage {
            bytes: vec![0; len],
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the `len` bytes at `address`.
    pub fn slice(&self, address: Addr, len: u64) -> Result<&[u8], MemoryError> {
        let range = self.checked_range(address, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, address: Addr, len: u64) -> Result<&mut [u8], MemoryError> {
        let range = self.checked_range(address, len)?;
        Ok(&mut self.bytes[range])
    }

    pub fn load(&self, address: Addr, dtype: Dtype) -> Result<i64, MemoryError> {
        Ok(dtype.decode(self.slice(address, dtype.size().into())?))
    }

    pub fn store(&mut self, address: Addr, dtype: Dtype, value: i64) -> Result<(), MemoryError> {
        dtype.encode(value, self.slice_mut(address, dtype.size().into())?);
        Ok(())
    }

    /// Write a square matrix, row-major, starting at `offset`.
    pub fn place_matrix(
        &mut self,
        offset: Addr,
        dtype: Dtype,
        matrix: &Array2<i64>,
    ) -> Result<(), MemoryError> {
        debug_assert!(matrix.is_square());
        let elem = u64::from(dtype.size());
        for ((row, col), value) in matrix.indexed_iter() {
            self.store(offset + (row * matrix.ncols() + col) as u64 * elem, dtype, *value)?;
        }
        Ok(())
    }

    /// Read an `n`-by-`n` row-major matrix starting at `offset`.
    pub fn read_matrix(
        &self,
        offset: Addr,
        dtype: Dtype,
        n: DimSize,
    ) -> Result<Array2<i64>, MemoryError> {
        let n_usize = n.get() as usize;
        let mut matrix = Array2::zeros((n_usize, n_usize));
        for row in 0..n.get() {
            let base = row_address(offset, row, n, dtype);
            for col in 0..n.get() {
                let address = base + u64::from(col) * u64::from(dtype.size());
                matrix[[row as usize, col as usize]] = self.load(address, dtype)?;
            }
        }
        Ok(matrix)
    }

    /// Persist the image so that it can be reloaded with [MemoryImage::load_file].
    pub fn save_file(&self, path: &Path) -> Result<(), ImageFileError> {
        debug!("Saving {}-byte memory image to {}", self.len(), path.display());
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load_file(path: &Path) -> Result<Self, ImageFileError> {
        let reader = BufReader::new(File::open(path)?);
        let image: MemoryImage = bincode::deserialize_from(reader)?;
        debug!("Loaded {}-byte memory image from {}", image.len(), path.display());
        Ok(image)
    }

    fn checked_range(&self, address: Addr, len: u64) -> Result<Range<usize>, MemoryError> {
        let limit = self.len();
        match address.checked_add(len) {
            Some(end) if end <= limit => Ok(address as usize..end as usize),
            _ => Err(MemoryError::OutOfRange {
                address,
                len,
                limit,
            }),
        }
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
