pub mod scoring;
pub mod synchronizer;

pub use scoring::{score, TARGET_TOTAL_ML};
pub use synchronizer::StateSynchronizer;
