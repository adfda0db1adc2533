//! The blocked matrix-multiply control program.
//!
//! [MatmulKernel] is a single sequential thread of control written as an explicit state
//! machine. Each call to [MatmulKernel::step] makes one transition. The only transitions that
//! wait on anything are block transfers, and those complete before `step` returns, so no two
//! transfers or compute steps ever overlap.
//!
//! A run has three phases:
//!
//!  1. *Compute.* For each row `i` of `A`, load it into the A tile, then for each row `j` of
//!     `B` load it into the B tile and store their dot product to `C_tile[j]`. Once all of
//!     row `i` is computed, write the C tile back to row `i` of `C`.
//!  2. *Time.* The timer is sampled just before and just after compute and the difference is
//!     reported.
//!  3. *Verify.* Each row of `C` is loaded back and compared to an [Expectation].

use crate::common::row_address;
use crate::config::ValidatedConfig;
use crate::dma::{BlockTransfer, DmaEngine, TransferError};
use crate::memory::MemoryImage;
use crate::report::DiagnosticLine;
use crate::scratch::{ScratchBuffer, Tile};
use crate::timer::{CycleTimer, TimerSample};
use crate::verify::{verify_row, Expectation, VerificationRecord};

use log::{debug, info};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelState {
    Idle,
    LoadA { i: u32 },
    LoadB { i: u32, j: u32 },
    Dot { i: u32, j: u32 },
    StoreC { i: u32 },
    Timed,
    CheckLoad { i: u32 },
    CheckRow { i: u32 },
    Verdict,
    Finished,
}

/// What the host observes after a [MatmulKernel::step].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    Running,
    /// The verdict has been emitted. The kernel will make no further transitions.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOutcome {
    pub cycles: u64,
    pub record: VerificationRecord,
}

#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("block transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("failed to write diagnostic output")]
    Output(#[from] fmt::Error),
    #[error("the compute phase has already run")]
    AlreadyComputed,
    #[error("the compute phase has not run")]
    NotComputed,
    #[error("cannot verify in state {0:?}")]
    Busy(KernelState),
    #[error("the kernel has finished")]
    Finished,
}

pub struct MatmulKernel<D, E> {
    config: ValidatedConfig,
    dma: D,
    timer: CycleTimer,
    expectation: E,
    a_tile: ScratchBuffer,
    b_tile: ScratchBuffer,
    c_tile: ScratchBuffer,
    state: KernelState,
    start: TimerSample,
    cycles: u64,
    record: VerificationRecord,
}

impl<D, E> MatmulKernel<D, E>
where
    D: BlockTransfer,
    E: Expectation,
{
    /// Allocates the three scratch buffers. They are reused for the whole run.
    pub fn new(config: ValidatedConfig, dma: D, timer: CycleTimer, expectation: E) -> Self {
        let capacity = config.buffer_capacity;
        let dtype = config.dtype;
        let start = timer.sample();
        MatmulKernel {
            a_tile: ScratchBuffer::new(Tile::A, dtype, capacity),
            b_tile: ScratchBuffer::new(Tile::B, dtype, capacity),
            c_tile: ScratchBuffer::new(Tile::C, dtype, capacity),
            config,
            dma,
            timer,
            expectation,
            state: KernelState::Idle,
            start,
            cycles: 0,
            record: VerificationRecord::default(),
        }
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn timer(&self) -> &CycleTimer {
        &self.timer
    }

    pub fn dma(&self) -> &D {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }

    pub fn into_dma(self) -> D {
        self.dma
    }

    /// The result of the most recent verification pass.
    pub fn record(&self) -> &VerificationRecord {
        &self.record
    }

    /// Make one state transition, writing any diagnostic lines it produces to `out`.
    pub fn step<W: fmt::Write>(&mut self, out: &mut W) -> Result<KernelEvent, KernelError> {
        let n = self.config.size;
        let last = n.get() - 1;
        let dtype = self.config.dtype;
        let cost = self.config.cost;

        let next = match self.state {
            KernelState::Idle => {
                info!("Starting {n}x{n} {dtype} matmul");
                self.start = self.timer.sample();
                KernelState::LoadA { i: 0 }
            }
            KernelState::LoadA { i } => {
                self.transfer_in(Tile::A, row_address(self.config.a_offset, i, n, dtype))?;
                KernelState::LoadB { i, j: 0 }
            }
            KernelState::LoadB { i, j } => {
                self.transfer_in(Tile::B, row_address(self.config.b_offset, j, n, dtype))?;
                KernelState::Dot { i, j }
            }
            KernelState::Dot { i, j } => {
                let mut acc = 0i64;
                for k in 0..n.get() {
                    let x = self.a_tile.read(k);
                    let y = self.b_tile.read(k);
                    acc = acc.wrapping_add(x.wrapping_mul(y));
                }
                self.c_tile.write(j, acc);
                self.timer
                    .advance(cost.ticks_per_mac * u64::from(n.get()) + cost.ticks_per_store);
                if j < last {
                    KernelState::LoadB { i, j: j + 1 }
                } else {
                    KernelState::StoreC { i }
                }
            }
            KernelState::StoreC { i } => {
                let address = row_address(self.config.c_offset, i, n, dtype);
                let receipt = self.dma.transfer_out(&self.c_tile, 0, address, n.get())?;
                self.timer.advance(receipt.ticks);
                debug!("Stored row {i} of C to {address:#x}");
                if i < last {
                    KernelState::LoadA { i: i + 1 }
                } else {
                    KernelState::Timed
                }
            }
            KernelState::Timed => {
                let end = self.timer.sample();
                self.cycles = self.timer.elapsed(self.start, end);
                info!("Compute took {} cycles", self.cycles);
                DiagnosticLine::Time(self.cycles).write_to(out)?;
                KernelState::CheckLoad { i: 0 }
            }
            KernelState::CheckLoad { i } => {
                if i == 0 {
                    self.record = VerificationRecord::default();
                }
                self.transfer_in(Tile::C, row_address(self.config.c_offset, i, n, dtype))?;
                KernelState::CheckRow { i }
            }
            KernelState::CheckRow { i } => {
                for mismatch in verify_row(i, n, &self.expectation, &self.c_tile) {
                    debug!(
                        "Mismatch at [{i},{}]: expected {}",
                        mismatch.col, mismatch.expected
                    );
                    DiagnosticLine::from(&mismatch).write_to(out)?;
                    self.record.mismatches.push(mismatch);
                }
                self.record.cells_checked += u64::from(n.get());
                self.timer.advance(cost.ticks_per_compare * u64::from(n.get()));
                if i < last {
                    KernelState::CheckLoad { i: i + 1 }
                } else {
                    KernelState::Verdict
                }
            }
            KernelState::Verdict => {
                let passed = self.record.passed();
                if passed {
                    info!("Verification passed");
                } else {
                    info!(
                        "Verification failed with {} mismatched cells",
                        self.record.mismatches.len()
                    );
                }
                DiagnosticLine::Verdict(passed).write_to(out)?;
                self.state = KernelState::Finished;
                return Ok(KernelEvent::Finished);
            }
            KernelState::Finished => return Err(KernelError::Finished),
        };
        self.state = next;
        Ok(KernelEvent::Running)
    }

    /// Run every remaining phase until the kernel finishes.
    pub fn run<W: fmt::Write>(&mut self, out: &mut W) -> Result<KernelOutcome, KernelError> {
        while self.step(out)? == KernelEvent::Running {}
        Ok(KernelOutcome {
            cycles: self.cycles,
            record: self.record.clone(),
        })
    }

    /// Run only the compute phase and report its duration in ticks.
    ///
    /// Compute runs at most once per kernel.
    pub fn compute<W: fmt::Write>(&mut self, out: &mut W) -> Result<u64, KernelError> {
        if self.state != KernelState::Idle {
            return Err(KernelError::AlreadyComputed);
        }
        while self.state != (KernelState::CheckLoad { i: 0 }) {
            self.step(out)?;
        }
        Ok(self.cycles)
    }

    /// Run the verify phase against the current contents of `C`.
    ///
    /// May be repeated once compute has completed. Each pass checks every cell.
    pub fn verify<W: fmt::Write>(
        &mut self,
        out: &mut W,
    ) -> Result<&VerificationRecord, KernelError> {
        match self.state {
            KernelState::CheckLoad { i: 0 } | KernelState::Finished => {}
            KernelState::Idle => return Err(KernelError::NotComputed),
            state => return Err(KernelError::Busy(state)),
        }
        self.state = KernelState::CheckLoad { i: 0 };
        while self.step(out)? == KernelEvent::Running {}
        Ok(&self.record)
    }

    fn transfer_in(&mut self, tile: Tile, address: u64) -> Result<(), TransferError> {
        let buffer = match tile {
            Tile::A => &mut self.a_tile,
            Tile::B => &mut self.b_tile,
            Tile::C => &mut self.c_tile,
        };
        let receipt = self
            .dma
            .transfer_in(buffer, 0, address, self.config.size.get())?;
        self.timer.advance(receipt.ticks);
        Ok(())
    }
}

/// Start a kernel on `image` and run it to completion, as a host would.
///
/// Returns the outcome and the engine, which still holds the final memory image.
pub fn execute<E, W>(
    config: ValidatedConfig,
    image: MemoryImage,
    expectation: E,
    out: &mut W,
) -> Result<(KernelOutcome, DmaEngine), KernelError>
where
    E: Expectation,
    W: fmt::Write,
{
    let dma = DmaEngine::new(image, &config);
    let timer = CycleTimer::new(config.timer_bits);
    let mut kernel = MatmulKernel::new(config, dma, timer, expectation);
    let outcome = kernel.run(out)?;
    Ok((outcome, kernel.into_dma()))
}
