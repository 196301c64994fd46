pub mod error;
pub mod traits;
pub mod types;

pub use error::{BoxError, Result, StageError};
pub use traits::{DeviceAllocator, ExecutionStream};
pub use types::*;
