//! Block transfers between the external [MemoryImage] and [ScratchBuffer]s.
//!
//! The kernel only sees the [BlockTransfer] trait. Each call returns once the copy is
//! complete, so a caller can never have more than one transfer outstanding.

use crate::common::{Addr, Dtype};
use crate::config::{CostModel, ValidatedConfig};
use crate::memory::{MemoryError, MemoryImage};
use crate::scratch::{ScratchBuffer, Tile};

use auto_impl::auto_impl;
use log::trace;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// External memory to scratch buffer.
    In,
    /// Scratch buffer to external memory.
    Out,
}

/// One block transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDescriptor {
    pub direction: Direction,
    pub tile: Tile,
    pub buffer_offset: u32,
    pub external_address: Addr,
    pub count: u32,
}

/// Returned by a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub descriptor: BlockDescriptor,
    /// Ticks the caller was suspended for.
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub reads: u64,
    pub writes: u64,
    pub words_in: u64,
    pub words_out: u64,
    pub ticks: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("{descriptor}: {source}")]
    External {
        descriptor: BlockDescriptor,
        #[source]
        source: MemoryError,
    },
    #[error("{descriptor}: exceeds buffer capacity {capacity}")]
    BufferOverflow {
        descriptor: BlockDescriptor,
        capacity: u32,
    },
    #[error("{descriptor}: address not aligned to {dtype} elements")]
    Misaligned {
        descriptor: BlockDescriptor,
        dtype: Dtype,
    },
}

#[auto_impl(&mut, Box)]
pub trait BlockTransfer {
    /// Copy `count` words at `external_address` into `buffer` starting at `buffer_offset`.
    fn transfer_in(
        &mut self,
        buffer: &mut ScratchBuffer,
        buffer_offset: u32,
        external_address: Addr,
        count: u32,
    ) -> Result<TransferReceipt, TransferError>;

    /// Copy `count` words of `buffer` starting at `buffer_offset` to `external_address`.
    fn transfer_out(
        &mut self,
        buffer: &ScratchBuffer,
        buffer_offset: u32,
        external_address: Addr,
        count: u32,
    ) -> Result<TransferReceipt, TransferError>;
}

/// A simulated DMA engine which owns the external memory image.
///
/// Transfers are charged [CostModel::transfer_ticks] for the bus width.
#[derive(Debug)]
pub struct DmaEngine {
    memory: MemoryImage,
    dtype: Dtype,
    bus_bytes: u32,
    cost: CostModel,
    stats: TransferStats,
    trace: Option<Vec<BlockDescriptor>>,
}

impl DmaEngine {
    pub fn new(memory: MemoryImage, config: &ValidatedConfig) -> Self {
        DmaEngine {
            memory,
            dtype: config.dtype,
            bus_bytes: config.bus_bytes,
            cost: config.cost,
            stats: TransferStats::default(),
            trace: None,
        }
    }

    /// Record every completed transfer's descriptor, in issue order.
    pub fn with_trace(mut self) -> Self {
        self.trace = Some(Vec::new());
        self
    }

    pub fn memory(&self) -> &MemoryImage {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryImage {
        &mut self.memory
    }

    pub fn into_memory(self) -> MemoryImage {
        self.memory
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn trace(&self) -> Option<&[BlockDescriptor]> {
        self.trace.as_deref()
    }

    fn check(&self, descriptor: BlockDescriptor) -> Result<u64, TransferError> {
        let elem = u64::from(self.dtype.size());
        if descriptor.external_address % elem != 0 {
            return Err(TransferError::Misaligned {
                descriptor,
                dtype: self.dtype,
            });
        }
        Ok(u64::from(descriptor.count) * elem)
    }

    fn complete(&mut self, descriptor: BlockDescriptor, bytes: u64) -> TransferReceipt {
        let ticks = self.cost.transfer_ticks(bytes, self.bus_bytes);
        match descriptor.direction {
            Direction::In => {
                self.stats.reads += 1;
                self.stats.words_in += u64::from(descriptor.count);
            }
            Direction::Out => {
                self.stats.writes += 1;
                self.stats.words_out += u64::from(descriptor.count);
            }
        }
        self.stats.ticks += ticks;
        if let Some(trace) = &mut self.trace {
            trace.push(descriptor);
        }
        trace!("{descriptor} took {ticks} ticks");
        TransferReceipt { descriptor, ticks }
    }
}

impl BlockTransfer for DmaEngine {
    fn transfer_in(
        &mut self,
        buffer: &mut ScratchBuffer,
        buffer_offset: u32,
        external_address: Addr,
        count: u32,
    ) -> Result<TransferReceipt, TransferError> {
        debug_assert_eq!(buffer.dtype(), self.dtype);
        let descriptor = BlockDescriptor {
            direction: Direction::In,
            tile: buffer.tile(),
            buffer_offset,
            external_address,
            count,
        };
        let bytes = self.check(descriptor)?;
        let capacity = buffer.capacity();
        let dest = buffer
            .words_mut(buffer_offset, count)
            .ok_or(TransferError::BufferOverflow {
                descriptor,
                capacity,
            })?;
        let src = self
            .memory
            .slice(external_address, bytes)
            .map_err(|source| TransferError::External { descriptor, source })?;
        let dtype = self.dtype;
        for (word, raw) in dest.iter_mut().zip(src.chunks_exact(dtype.size().into())) {
            *word = dtype.decode(raw);
        }
        Ok(self.complete(descriptor, bytes))
    }

    fn transfer_out(
        &mut self,
        buffer: &ScratchBuffer,
        buffer_offset: u32,
        external_address: Addr,
        count: u32,
    ) -> Result<TransferReceipt, TransferError> {
        debug_assert_eq!(buffer.dtype(), self.dtype);
        let descriptor = BlockDescriptor {
            direction: Direction::Out,
            tile: buffer.tile(),
            buffer_offset,
            external_address,
            count,
        };
        let bytes = self.check(descriptor)?;
        let src = buffer
            .words(buffer_offset, count)
            .ok_or(TransferError::BufferOverflow {
                descriptor,
                capacity: buffer.capacity(),
            })?;
        let dtype = self.dtype;
        let dest = self
            .memory
            .slice_mut(external_address, bytes)
            .map_err(|source| TransferError::External { descriptor, source })?;
        for (word, raw) in src.iter().zip(dest.chunks_exact_mut(dtype.size().into())) {
            dtype.encode(*word, raw);
        }
        Ok(self.complete(descriptor, bytes))
    }
}

impl Display for BlockDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let end = u64::from(self.buffer_offset) + u64::from(self.count);
        match self.direction {
            Direction::In => write!(
                f,
                "dma_read {}[{}..{}] <- {:#x}",
                self.tile, self.buffer_offset, end, self.external_address
            ),
            Direction::Out => write!(
                f,
                "dma_write {}[{}..{}] -> {:#x}",
                self.tile, self.buffer_offset, end, self.external_address
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn engine() -> DmaEngine {
        let config = KernelConfig::default().validate().unwrap();
        let mut memory = MemoryImage::new(config.memory_bytes);
        for i in 0..8 {
            memory.store(4096 + i * 4, Dtype::Sint32, i as i64 + 1).unwrap();
        }
        DmaEngine::new(memory, &config).with_trace()
    }

    #[test]
    fn test_transfer_in_copies_words_at_offset() {
        let mut dma = engine();
        let mut buf = ScratchBuffer::new(Tile::B, Dtype::Sint32, 16);
        let receipt = dma.transfer_in(&mut buf, 2, 4096 + 4, 3).unwrap();
        assert_eq!((buf.read(1), buf.read(2), buf.read(4), buf.read(5)), (0, 2, 4, 0));
        // 12 bytes is two 8-byte beats.
        assert_eq!(receipt.ticks, 4 + 2);
    }

    #[test]
    fn test_transfer_out_writes_memory() {
        let mut dma = engine();
        let mut buf = ScratchBuffer::new(Tile::C, Dtype::Sint32, 4);
        buf.write(0, -1);
        buf.write(1, 42);
        dma.transfer_out(&buf, 0, 8192, 2).unwrap();
        assert_eq!(dma.memory().load(8192, Dtype::Sint32).unwrap(), -1);
        assert_eq!(dma.memory().load(8196, Dtype::Sint32).unwrap(), 42);
        assert_eq!(
            dma.stats(),
            &TransferStats {
                reads: 0,
                writes: 1,
                words_in: 0,
                words_out: 2,
                ticks: 5,
            }
        );
    }

    #[test]
    fn test_transfer_past_memory_end_fails() {
        let mut dma = engine();
        let mut buf = ScratchBuffer::new(Tile::A, Dtype::Sint32, 16);
        let limit = dma.memory().len();
        let err = dma.transfer_in(&mut buf, 0, limit - 8, 4).unwrap_err();
        assert!(matches!(err, TransferError::External { .. }));
        assert_eq!(dma.trace(), Some(&[][..]));
    }

    #[test]
    fn test_transfer_beyond_capacity_fails() {
        let mut dma = engine();
        let buf = ScratchBuffer::new(Tile::C, Dtype::Sint32, 4);
        let err = dma.transfer_out(&buf, 2, 8192, 3).unwrap_err();
        assert!(matches!(
            err,
            TransferError::BufferOverflow { capacity: 4, .. }
        ));
    }

    #[test]
    fn test_misaligned_transfer_fails() {
        let mut dma = engine();
        let mut buf = ScratchBuffer::new(Tile::A, Dtype::Sint32, 4);
        let err = dma.transfer_in(&mut buf, 0, 2, 1).unwrap_err();
        assert!(matches!(err, TransferError::Misaligned { .. }));
    }

    #[test]
    fn test_trace_records_issue_order() {
        let mut dma = engine();
        let mut a = ScratchBuffer::new(Tile::A, Dtype::Sint32, 4);
        let c = ScratchBuffer::new(Tile::C, Dtype::Sint32, 4);
        dma.transfer_in(&mut a, 0, 0, 4).unwrap();
        dma.transfer_out(&c, 0, 8192, 4).unwrap();
        let directions = dma
            .trace()
            .unwrap()
            .iter()
            .map(|d| (d.direction, d.tile))
            .collect::<Vec<_>>();
        assert_eq!(
            directions,
            vec![(Direction::In, Tile::A), (Direction::Out, Tile::C)]
        );
        assert_eq!(
            dma.trace().unwrap()[0].to_string(),
            "dma_read ram_a[0..4] <- 0x0"
        );
    }
}
