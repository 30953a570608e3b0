pub mod vbert;
pub mod vbert_ft;
pub mod with_tracing;
