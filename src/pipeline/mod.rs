pub mod batcher;
pub mod driver;
pub mod enricher;
pub mod normalizer;
pub mod reconciler;
pub mod reporter;
pub mod scorer;
