//! Buffer management.
//!
//! - [`BufferPool`] caches fixed-capacity blocks keyed by capacity so that
//!   connections churning through read buffers do not hit the allocator.
//! - `ReadBuffer` is the per-connection framing buffer built on top of a
//!   pooled block.

mod pool;
mod read;

pub use pool::{BufferPool, DEFAULT_CEILING, DEFAULT_SLACK, PoolStats, PooledBuffer};

pub(crate) use read::ReadBuffer;
