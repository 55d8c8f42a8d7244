pub mod memory;

pub use memory::{MemoryStore, MemoryUsageLedger};
