//! External-source ingestion and cross-device staging.
//!
//! A source binding drives one user-supplied producer per pipeline
//! iteration: the producer's arrays become buffer descriptors, the layout
//! validator classifies them as one contiguous block or independent
//! samples, the stager makes them resident on the target device, and the
//! assembler packages the result as a [`Batch`].

pub mod array;
pub mod assembler;
pub mod binding;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod layout;
pub mod producer;
pub mod stager;

pub use array::ExternalArray;
pub use assembler::{assemble, Batch, HostBatch, HostSample};
pub use binding::{BindingState, SourceBinding};
pub use config::SourceConfig;
pub use descriptor::{BufferDescriptor, OwnerHandle};
pub use driver::{Invocation, InvocationDriver, RawBatch};
pub use layout::{classify, BatchOrigin, ModeTracker};
pub use producer::{BatchOutput, Produced, Producer, SampleInfo, SourceSignal};
pub use stager::{StagedBatch, StagedStorage, Stager, StagingOptions};
