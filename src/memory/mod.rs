//! Memory backends for tensor payloads and store objects.
//!
//! - [`MemorySegment`]: trait over a contiguous region (host heap, memfd, device)
//! - [`HeapSegment`]: aligned, process-private host memory
//! - [`SharedMemorySegment`]: memfd-backed memory another process can map

mod heap;
mod segment;
mod shared;

pub use heap::{DEFAULT_ALIGNMENT, HeapSegment};
pub use segment::{IpcHandle, MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
