//! Word-level recurrent language model with gender bias regularization.
//!
//! Training optionally penalizes the projection of gender-neutral word
//! embeddings onto a gender subspace estimated from paired gender words.
//! Generation samples text and scores its gender co-occurrence bias.

pub mod checkpoint;
pub mod config;
pub mod cooccurrence;
pub mod data;
pub mod error;
pub mod graph;
pub mod linalg;
pub mod model;
pub mod ops;
pub mod regularizer;
pub mod sampler;
pub mod subspace;
pub mod trainer;

pub use config::{Device, GenerateConfig, TrainConfig};
pub use cooccurrence::{BiasScores, Cooccurrences};
pub use data::{Corpus, Vocabulary};
pub use error::{Error, Result};
pub use model::{ModelConfig, ModelKind, RnnModel};
pub use sampler::{generate, Generation, SampleOptions};
pub use trainer::{TrainOutcome, TrainStatus, Trainer};
