//! Working-graph assembly

pub mod assembler;

pub use assembler::{GraphAssembler, HopDelta, MergeOutcome};
