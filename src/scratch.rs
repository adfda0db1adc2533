use crate::common::Dtype;

use std::fmt;

/// Which of the kernel's local buffers a [ScratchBuffer] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tile {
    A,
    B,
    C,
}

/// Fixed-capacity local storage of [Dtype]-width words, like a small on-chip RAM.
///
/// Buffers are never cleared: a cell keeps its last-written value until it is overwritten.
/// Indexing outside `0..capacity` is a caller bug and panics.
#[derive(Clone, PartialEq, Eq)]
pub struct ScratchBuffer {
    tile: Tile,
    dtype: Dtype,
    words: Box<[i64]>,
}

impl ScratchBuffer {
    pub fn new(tile: Tile, dtype: Dtype, capacity: u32) -> Self {
        ScratchBuffer {
            tile,
            dtype,
            words: vec![0; capacity as usize].into_boxed_slice(),
        }
    }

    pub fn tile(&self) -> Tile {
        self.tile
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn capacity(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn read(&self, index: u32) -> i64 {
        assert!(
            index < self.capacity(),
            "read of {:?} tile at {index} beyond capacity {}",
            self.tile,
            self.capacity()
        );
        self.words[index as usize]
    }

    /// Stores `value`, wrapped to the buffer's [Dtype].
    pub fn write(&mut self, index: u32, value: i64) {
        assert!(
            index < self.capacity(),
            "write of {:?} tile at {index} beyond capacity {}",
            self.tile,
            self.capacity()
        );
        self.words[index as usize] = self.dtype.wrap(value);
    }

    /// The `count` words starting at `offset`, or `None` if that range exceeds the capacity.
    pub(crate) fn words(&self, offset: u32, count: u32) -> Option<&[i64]> {
        let start = offset as usize;
        self.words.get(start..start.checked_add(count as usize)?)
    }

    pub(crate) fn words_mut(&mut self, offset: u32, count: u32) -> Option<&mut [i64]> {
        let start = offset as usize;
        self.words.get_mut(start..start.checked_add(count as usize)?)
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("tile", &self.tile)
            .field("dtype", &self.dtype)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tile::A => write!(f, "ram_a"),
            Tile::B => write!(f, "ram_b"),
            Tile::C => write!(f, "ram_c"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_retains_contents_until_overwritten() {
        let mut buf = ScratchBuffer::new(Tile::C, Dtype::Sint32, 4);
        buf.write(1, 7);
        buf.write(2, 9);
        buf.write(1, 3);
        assert_eq!(buf.read(1), 3);
        assert_eq!(buf.read(2), 9);
        assert_eq!(buf.read(0), 0);
    }

    #[test]
    fn test_write_wraps_to_dtype() {
        let mut buf = ScratchBuffer::new(Tile::A, Dtype::Sint8, 1);
        buf.write(0, 200);
        assert_eq!(buf.read(0), -56);
    }

    #[test]
    #[should_panic(expected = "beyond capacity")]
    fn test_read_out_of_bounds_panics() {
        let buf = ScratchBuffer::new(Tile::B, Dtype::Sint32, 4);
        buf.read(4);
    }

    #[test]
    fn test_words_range_is_checked() {
        let buf = ScratchBuffer::new(Tile::B, Dtype::Sint32, 4);
        assert_eq!(buf.words(1, 3).map(<[i64]>::len), Some(3));
        assert!(buf.words(2, 3).is_none());
        assert!(buf.words(u32::MAX, u32::MAX).is_none());
    }
}
