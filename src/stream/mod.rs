//! Stream combinators used by the engine's worker tasks.

mod batch;

pub use batch::{BatchExt, Batched};
