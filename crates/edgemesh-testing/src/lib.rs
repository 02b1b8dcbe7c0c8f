//! Fast, in-process doubles for exercising the EdgeMesh coordinator without a
//! database: [`MemoryStore`] implements the same `edgemesh_core::Store` seam
//! as `edgemesh-store-sqlite`, and [`NodeBuilder`]/[`JobBuilder`] build the
//! fixtures most scheduler and lifecycle tests need.

mod builders;
mod memory_store;

pub use builders::{JobBuilder, NodeBuilder};
pub use memory_store::MemoryStore;
