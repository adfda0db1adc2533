pub mod common;
pub mod config;
pub mod dma;
pub mod kernel;
pub mod memory;
pub mod report;
pub mod scratch;
pub mod timer;
pub mod utils;
pub mod vectors;
pub mod verify;
