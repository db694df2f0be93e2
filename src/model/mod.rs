pub mod attention;
pub mod bag;
pub mod classifier;
pub mod instance;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use attention::{normalize, AttentionNet, GatedAttention, NonGatedAttention};
pub use bag::{aggregate, argmax, classify, BagClassifier, SlidePrediction};
pub use classifier::{Activation, ClassArena, Classifier, Dense};
pub use instance::{top_k_count, top_k_indices, InstanceBatch, InstanceEval, InstanceSelector, Rank};
pub use pipeline::{ClamModel, ClamPipeline, SlideOutcome, SlideResult};
pub use store::{build_model, init_model, load_model, save_model};
