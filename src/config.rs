//! Build-time kernel parameters and their validation.
//!
//! A [KernelConfig] is plain data. The kernel only accepts a [ValidatedConfig], which can
//! only be produced by [KernelConfig::validate].

use crate::common::{matrix_bytes, Addr, DimSize, Dtype};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;

pub const DEFAULT_SIZE: DimSize = nonzero::nonzero!(16u32);
pub const DEFAULT_A_OFFSET: Addr = 0;
pub const DEFAULT_B_OFFSET: Addr = 4096;
pub const DEFAULT_C_OFFSET: Addr = 4096 * 2;
/// Scratch buffers are addressed with 10 bits.
pub const DEFAULT_BUFFER_CAPACITY: u32 = 1 << 10;
pub const DEFAULT_MEMORY_BYTES: u64 = 1024 * 1024;
/// Width of one bus beat. A 64-bit bus carries two 32-bit elements per beat.
pub const DEFAULT_BUS_BYTES: u32 = 8;
pub const DEFAULT_TIMER_BITS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KernelConfig {
    pub size: DimSize,
    pub dtype: Dtype,
    pub a_offset: Addr,
    pub b_offset: Addr,
    pub c_offset: Addr,
    pub buffer_capacity: u32,
    pub memory_bytes: u64,
    pub bus_bytes: u32,
    pub timer_bits: u32,
    pub cost: CostModel,
}

/// Ticks charged for each kind of work the kernel does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CostModel {
    /// Fixed cost of issuing a transfer and waiting for its response.
    pub transfer_setup: u64,
    pub ticks_per_beat: u64,
    /// Two scratch reads and one multiply-accumulate.
    pub ticks_per_mac: u64,
    pub ticks_per_store: u64,
    pub ticks_per_compare: u64,
}

/// A [KernelConfig] which passed [KernelConfig::validate].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig(KernelConfig);

/// One of the three matrices the kernel touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    A,
    B,
    C,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("matrix size {size} exceeds scratch buffer capacity {capacity}")]
    CapacityExceeded { size: u32, capacity: u32 },
    #[error("matrix {first} [{first_start:#x}, {first_end:#x}) overlaps matrix {second} [{second_start:#x}, {second_end:#x})")]
    Overlap {
        first: Operand,
        first_start: Addr,
        first_end: Addr,
        second: Operand,
        second_start: Addr,
        second_end: Addr,
    },
    #[error("matrix {operand} ends at {end:#x}, beyond the {memory_bytes}-byte memory image")]
    OutOfMemory {
        operand: Operand,
        end: Addr,
        memory_bytes: u64,
    },
    #[error("offset {offset:#x} of matrix {operand} is not aligned to {dtype} elements")]
    Misaligned {
        operand: Operand,
        offset: Addr,
        dtype: Dtype,
    },
    #[error("matrix {operand} at {offset:#x} extends past the end of the address space")]
    AddressOverflow { operand: Operand, offset: Addr },
    #[error("bus width of {0} bytes must be a non-zero power of two")]
    BadBusWidth(u32),
    #[error("timer width of {0} bits must be in 1..=64")]
    BadTimerWidth(u32),
}

impl KernelConfig {
    pub fn with_size(size: DimSize) -> Self {
        KernelConfig {
            size,
            ..Default::default()
        }
    }

    /// The half-open byte range reserved for `operand`.
    ///
    /// The end saturates at `u64::MAX`; [KernelConfig::validate] rejects such ranges.
    pub fn range(&self, operand: Operand) -> (Addr, Addr) {
        let start = self.offset(operand);
        (start, start.saturating_add(matrix_bytes(self.size, self.dtype)))
    }

    pub fn offset(&self, operand: Operand) -> Addr {
        match operand {
            Operand::A => self.a_offset,
            Operand::B => self.b_offset,
            Operand::C => self.c_offset,
        }
    }

    /// Check that the kernel can be built from this configuration.
    ///
    /// Rejects a matrix size larger than the scratch buffers, matrices which overlap each
    /// other or fall outside the memory image, and offsets not aligned to the element size.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.size.get() > self.buffer_capacity {
            return Err(ConfigError::CapacityExceeded {
                size: self.size.get(),
                capacity: self.buffer_capacity,
            });
        }
        if self.bus_bytes == 0 || !self.bus_bytes.is_power_of_two() {
            return Err(ConfigError::BadBusWidth(self.bus_bytes));
        }
        if self.timer_bits == 0 || self.timer_bits > 64 {
            return Err(ConfigError::BadTimerWidth(self.timer_bits));
        }
        for operand in Operand::ALL {
            let start = self.offset(operand);
            let end = start
                .checked_add(matrix_bytes(self.size, self.dtype))
                .ok_or(ConfigError::AddressOverflow {
                    operand,
                    offset: start,
                })?;
            if start % u64::from(self.dtype.size()) != 0 {
                return Err(ConfigError::Misaligned {
                    operand,
                    offset: start,
                    dtype: self.dtype,
                });
            }
            if end > self.memory_bytes {
                return Err(ConfigError::OutOfMemory {
                    operand,
                    end,
                    memory_bytes: self.memory_bytes,
                });
            }
        }
        for (first, second) in Operand::ALL.into_iter().tuple_combinations() {
            let (first_start, first_end) = self.range(first);
            let (second_start, second_end) = self.range(second);
            if first_start < second_end && second_start < first_end {
                return Err(ConfigError::Overlap {
                    first,
                    first_start,
                    first_end,
                    second,
                    second_start,
                    second_end,
                });
            }
        }
        Ok(ValidatedConfig(self))
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            size: DEFAULT_SIZE,
            dtype: Dtype::default(),
            a_offset: DEFAULT_A_OFFSET,
            b_offset: DEFAULT_B_OFFSET,
            c_offset: DEFAULT_C_OFFSET,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            bus_bytes: DEFAULT_BUS_BYTES,
            timer_bits: DEFAULT_TIMER_BITS,
            cost: CostModel::default(),
        }
    }
}

impl CostModel {
    /// Ticks to move `bytes` bytes over a `bus_bytes`-wide bus, including setup.
    pub fn transfer_ticks(&self, bytes: u64, bus_bytes: u32) -> u64 {
        let beats = divrem::DivCeil::div_ceil(bytes, u64::from(bus_bytes));
        self.transfer_setup + self.ticks_per_beat * beats
    }
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel {
            transfer_setup: 4,
            ticks_per_beat: 1,
            ticks_per_mac: 1,
            ticks_per_store: 1,
            ticks_per_compare: 1,
        }
    }
}

impl Deref for ValidatedConfig {
    type Target = KernelConfig;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ValidatedConfig {
    pub fn into_inner(self) -> KernelConfig {
        self.0
    }
}

impl Operand {
    pub const ALL: [Operand; 3] = [Operand::A, Operand::B, Operand::C];
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::A => write!(f, "A"),
            Operand::B => write!(f, "B"),
            Operand::C => write!(f, "C"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KernelConfig::default().validate().unwrap();
        assert_eq!(config.size.get(), 16);
        assert_eq!(config.range(Operand::B), (4096, 4096 + 16 * 16 * 4));
    }

    #[test]
    fn test_size_beyond_capacity_is_rejected() {
        let config = KernelConfig {
            buffer_capacity: 8,
            ..KernelConfig::with_size(nz!(9u32))
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::CapacityExceeded {
                size: 9,
                capacity: 8
            })
        );
    }

    #[test]
    fn test_largest_size_at_default_offsets() {
        // 32 * 32 * 4 bytes exactly fills each 4096-byte region.
        assert!(KernelConfig::with_size(nz!(32u32)).validate().is_ok());
        assert!(matches!(
            KernelConfig::with_size(nz!(33u32)).validate(),
            Err(ConfigError::Overlap {
                first: Operand::A,
                second: Operand::B,
                ..
            })
        ));
    }

    #[test]
    fn test_matrix_past_end_of_memory_is_rejected() {
        let config = KernelConfig {
            memory_bytes: 8192,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfMemory {
                operand: Operand::C,
                ..
            })
        ));
    }

    #[test]
    fn test_misaligned_offset_is_rejected() {
        let config = KernelConfig {
            b_offset: 4098,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Misaligned {
                operand: Operand::B,
                ..
            })
        ));
    }

    #[test]
    fn test_offset_near_end_of_address_space_is_rejected() {
        let config = KernelConfig {
            a_offset: u64::MAX - 3,
            ..KernelConfig::default()
        };
        assert_eq!(config.range(Operand::A), (u64::MAX - 3, u64::MAX));
        assert_eq!(
            config.validate(),
            Err(ConfigError::AddressOverflow {
                operand: Operand::A,
                offset: u64::MAX - 3
            })
        );
        // A matrix ending exactly at the top of the address space does not overflow.
        let config = KernelConfig {
            c_offset: u64::MAX - 1023,
            memory_bytes: u64::MAX,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_bus_and_timer_widths_are_rejected() {
        let config = KernelConfig {
            bus_bytes: 6,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BadBusWidth(6)));
        let config = KernelConfig {
            timer_bits: 65,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BadTimerWidth(65)));
    }

    #[test]
    fn test_transfer_ticks_rounds_up_to_whole_beats() {
        let cost = CostModel::default();
        assert_eq!(cost.transfer_ticks(64, 8), 4 + 8);
        assert_eq!(cost.transfer_ticks(4, 8), 4 + 1);
    }

    proptest! {
        #[test]
        fn test_valid_configs_have_disjoint_ranges(
            size in 1..=64u32,
            dtype in any::<Dtype>(),
            a_offset in (0..64u64).prop_map(|x| x * 1024),
            b_offset in (0..64u64).prop_map(|x| x * 1024),
            c_offset in (0..64u64).prop_map(|x| x * 1024),
        ) {
            let config = KernelConfig {
                size: DimSize::new(size).unwrap(),
                dtype,
                a_offset,
                b_offset,
                c_offset,
                ..KernelConfig::default()
            };
            let ranges = Operand::ALL.map(|o| config.range(o));
            let disjoint = ranges
                .iter()
                .tuple_combinations()
                .all(|(x, y)| x.1 <= y.0 || y.1 <= x.0);
            match config.validate() {
                Ok(_) => prop_assert!(disjoint),
                Err(ConfigError::Overlap { .. }) => prop_assert!(!disjoint),
                Err(_) => {}
            }
        }
    }
}
