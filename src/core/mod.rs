//! Product selection, band algebra and pipeline orchestration

pub mod selection;
pub mod indices;
pub mod pipeline;

// Re-export main types
pub use selection::{
    most_recent, IdentifierPattern, IdentifierToken, MostRecent, ProductSelector,
    SelectionPolicy, SelectionStrategy,
};
pub use indices::{index_grids, write_indices, BandAlgebraEngine, BandStack, IndexStack, EPSILON};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport};
