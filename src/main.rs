#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use std::io;
use std::path;
use std::str::FromStr;

use blockmm::common::{row_address, Addr, DimSize, Dtype};
use blockmm::config::{self, CostModel, KernelConfig, Operand, ValidatedConfig};
use blockmm::dma::DmaEngine;
use blockmm::kernel::{KernelOutcome, MatmulKernel};
use blockmm::memory::MemoryImage;
use blockmm::report::stats_table;
use blockmm::timer::CycleTimer;
use blockmm::utils::ToWriteFmt;
use blockmm::vectors::Operands;
use blockmm::verify::{Expectation, ReferenceProduct, ScaledDiagonal};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Run the kernel and print its diagnostic output
    Run(RunCmd),

    /// Write the initial memory image without running the kernel
    Image(ImageCmd),
}

#[derive(Parser)]
struct KernelArgs {
    /// Matrix dimension
    #[arg(long, short, default_value_t = config::DEFAULT_SIZE)]
    size: DimSize,

    /// Element type
    #[arg(long, value_enum, default_value_t = Dtype::default())]
    dtype: Dtype,

    #[arg(long, default_value_t = config::DEFAULT_A_OFFSET)]
    a_offset: Addr,

    #[arg(long, default_value_t = config::DEFAULT_B_OFFSET)]
    b_offset: Addr,

    #[arg(long, default_value_t = config::DEFAULT_C_OFFSET)]
    c_offset: Addr,

    /// Words in each scratch buffer
    #[arg(long, default_value_t = config::DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: u32,

    /// Size of the external memory image in bytes
    #[arg(long, default_value_t = config::DEFAULT_MEMORY_BYTES)]
    memory_bytes: u64,

    /// Bytes moved per bus beat
    #[arg(long, default_value_t = config::DEFAULT_BUS_BYTES)]
    bus_bytes: u32,

    #[arg(long, default_value_t = config::DEFAULT_TIMER_BITS)]
    timer_bits: u32,

    /// Ticks charged to set up each block transfer
    #[arg(long)]
    transfer_setup: Option<u64>,

    /// Operands to place in memory
    #[arg(long, value_enum, default_value_t = Vectors::Diagonal)]
    vectors: Vectors,

    /// Seed for random operands
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Largest magnitude of a random operand element
    #[arg(long, default_value_t = 16)]
    magnitude: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum Vectors {
    /// A = diag(1..=n), B = diag(2)
    Diagonal,
    Random,
}

#[derive(Parser)]
struct RunCmd {
    #[command(flatten)]
    kernel: KernelArgs,

    /// Read the initial memory image from a file instead of generating operands
    #[arg(long)]
    load_image: Option<path::PathBuf>,

    /// Overwrite one cell of C between compute and verify, as `ROW,COL=VALUE`
    #[arg(long)]
    corrupt: Option<CellValue>,

    /// Write the final memory image to a file
    #[arg(long)]
    memimg: Option<path::PathBuf>,

    /// Print transfer statistics to stderr
    #[arg(long, default_value_t = false)]
    stats: bool,

    /// Print every block transfer to stderr
    #[arg(long, default_value_t = false)]
    trace: bool,
}

#[derive(Parser)]
struct ImageCmd {
    #[command(flatten)]
    kernel: KernelArgs,

    /// Destination file
    out: path::PathBuf,
}

#[derive(Clone, Copy, Debug)]
struct CellValue {
    row: u32,
    col: u32,
    value: i64,
}

impl KernelArgs {
    fn config(&self) -> Result<ValidatedConfig> {
        let mut cost = CostModel::default();
        if let Some(transfer_setup) = self.transfer_setup {
            cost.transfer_setup = transfer_setup;
        }
        let config = KernelConfig {
            size: self.size,
            dtype: self.dtype,
            a_offset: self.a_offset,
            b_offset: self.b_offset,
            c_offset: self.c_offset,
            buffer_capacity: self.buffer_capacity,
            memory_bytes: self.memory_bytes,
            bus_bytes: self.bus_bytes,
            timer_bits: self.timer_bits,
            cost,
        };
        Ok(config.validate()?)
    }

    fn operands(&self) -> Operands {
        match self.vectors {
            Vectors::Diagonal => Operands::diagonal(self.size),
            Vectors::Random => Operands::random(self.size, self.seed, self.magnitude),
        }
    }
}

impl FromStr for CellValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cell, value) = s.split_once('=').context("expected ROW,COL=VALUE")?;
        let (row, col) = cell.split_once(',').context("expected ROW,COL=VALUE")?;
        Ok(CellValue {
            row: row.trim().parse()?,
            col: col.trim().parse()?,
            value: value.trim().parse()?,
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.subcmd {
        Subcommand::Run(run_cmd) => main_run(run_cmd),
        Subcommand::Image(image_cmd) => {
            let config = image_cmd.kernel.config()?;
            let image = image_cmd.kernel.operands().image(&config)?;
            image.save_file(&image_cmd.out)?;
            info!("Wrote memory image to {}", image_cmd.out.display());
            Ok(())
        }
    }
}

fn main_run(run_cmd: &RunCmd) -> Result<()> {
    let config = run_cmd.kernel.config()?;
    if let Some(cell) = run_cmd.corrupt {
        if cell.row >= config.size.get() || cell.col >= config.size.get() {
            bail!("cell [{},{}] is outside C", cell.row, cell.col);
        }
    }

    // Generated diagonal operands are checked against the closed form. Anything else is
    // checked against a reference product.
    if let Some(path) = &run_cmd.load_image {
        let image = MemoryImage::load_file(path)?;
        let a = image.read_matrix(config.offset(Operand::A), config.dtype, config.size)?;
        let b = image.read_matrix(config.offset(Operand::B), config.dtype, config.size)?;
        let reference = ReferenceProduct::new(&a, &b, config.dtype);
        return run_kernel(run_cmd, config, image, reference);
    }
    let operands = run_cmd.kernel.operands();
    let image = operands.image(&config)?;
    match run_cmd.kernel.vectors {
        Vectors::Diagonal => run_kernel(run_cmd, config, image, ScaledDiagonal::default()),
        Vectors::Random => {
            let reference = operands.reference(config.dtype);
            run_kernel(run_cmd, config, image, reference)
        }
    }
}

fn run_kernel<E: Expectation>(
    run_cmd: &RunCmd,
    config: ValidatedConfig,
    image: MemoryImage,
    expectation: E,
) -> Result<()> {
    let mut dma = DmaEngine::new(image, &config);
    if run_cmd.trace {
        dma = dma.with_trace();
    }
    let timer = CycleTimer::new(config.timer_bits);
    let dtype = config.dtype;
    let (c_offset, n) = (config.c_offset, config.size);
    let mut kernel = MatmulKernel::new(config, dma, timer, expectation);

    let mut out = ToWriteFmt(io::stdout());
    let start_time = std::time::Instant::now();
    let outcome = match run_cmd.corrupt {
        Some(cell) => {
            let cycles = kernel.compute(&mut out)?;
            let address = row_address(c_offset, cell.row, n, dtype)
                + u64::from(cell.col) * u64::from(dtype.size());
            kernel
                .dma_mut()
                .memory_mut()
                .store(address, dtype, cell.value)?;
            info!("Overwrote C[{},{}] with {}", cell.row, cell.col, cell.value);
            let record = kernel.verify(&mut out)?.clone();
            KernelOutcome { cycles, record }
        }
        None => kernel.run(&mut out)?,
    };
    info!("Simulation took {:?}", start_time.elapsed());

    if run_cmd.trace {
        for descriptor in kernel.dma().trace().unwrap_or_default() {
            eprintln!("{descriptor}");
        }
    }
    if run_cmd.stats {
        stats_table(kernel.dma().stats(), outcome.cycles).print(&mut io::stderr())?;
    }
    if let Some(path) = &run_cmd.memimg {
        kernel.into_dma().into_memory().save_file(path)?;
        info!("Wrote final memory image to {}", path.display());
    }

    if !outcome.record.passed() {
        bail!(
            "verification failed with {} mismatched cells",
            outcome.record.mismatches.len()
        );
    }
    Ok(())
}
