//! On-disk state of a run: identifier indexes, the output array, the
//! progress marker, and the memory guard deciding when to spill.

pub mod indexing;
pub mod memory_guard;
pub mod progress;
pub mod train_set;
