//! Internal building blocks shared by the selector backends.
//!
//! - `SlotTable`: indexed storage with O(1) slot reuse, used
//!   to map small integer tokens back to connections and in-flight
//!   operations.
//! - `Countdown`: resettable latch used to wait for a dispatch batch.
//! - `WorkerPool`: fixed pool of dispatch threads.

mod countdown;
mod slab;
mod workers;

pub(crate) use countdown::Countdown;
pub(crate) use slab::SlotTable;
pub(crate) use workers::WorkerPool;
