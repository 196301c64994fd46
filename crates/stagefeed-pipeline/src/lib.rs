pub mod config;
pub mod pipeline;
pub mod scheduler;

pub use config::PipelineConfig;
pub use pipeline::{Outputs, Pipeline, SourceId};
pub use scheduler::DevicePairs;
