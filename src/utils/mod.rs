// file: src/utils/mod.rs
// version: 2.0.0
// guid: v2w3x4y5-z6a7-8901-2345-678901vwxyza

//! Utility modules for disk, subprocess and digest operations

pub mod crypto;
pub mod progress;
pub mod qemu;
pub mod retry;
pub mod sparse;
pub mod system;

pub use qemu::{ConvertedImage, ImageConverter, ImageFormat};
pub use retry::{retry_transient, RetryPolicy};
pub use sparse::{Chunk, SparseChunks, CHUNK_SIZE};
pub use system::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
