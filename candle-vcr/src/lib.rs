//! Visual commonsense reasoning on top of a BERT encoder whose tokens can be grounded to
//! object detections.
//!
//! The entry point is [`models::vbert_ft::VBertFt`]: it truncates the detections of a batch,
//! grounds tagged caption tokens to detection features, encodes every candidate choice with a
//! shared encoder and scores the choices against each other.
pub mod checkpoint;
pub mod detections;
pub mod inputs;
pub mod loss;
pub mod models;
pub mod params;
pub mod sequence;
