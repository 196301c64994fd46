use serde::{Deserialize, Serialize};

use stagefeed_core::SourceDevice;

/// Registration options of one external source.
///
/// Batch mode and calling convention are not listed here: they are fixed by
/// the [`Producer`](crate::Producer) constructor used to register the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Device the consuming operators expect batches on.
    pub device: SourceDevice,
    /// Reference producer memory directly when it already sits on the
    /// target device in one contiguous block.
    pub no_copy: bool,
    /// Gather noncontiguous samples into one block on the target device.
    /// When off, each sample gets its own staging buffer.
    pub gather: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: SourceDevice::Cpu,
            no_copy: false,
            gather: true,
        }
    }
}

impl SourceConfig {
    /// Deliver batches to the pipeline's GPU.
    pub fn gpu() -> Self {
        Self {
            device: SourceDevice::Gpu,
            ..Self::default()
        }
    }

    /// Deliver batches to host memory.
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn with_no_copy(mut self, no_copy: bool) -> Self {
        self.no_copy = no_copy;
        self
    }

    pub fn with_gather(mut self, gather: bool) -> Self {
        self.gather = gather;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SourceConfig = serde_json::from_str(r#"{"device": "gpu"}"#).unwrap();
        assert_eq!(config.device, SourceDevice::Gpu);
        assert!(!config.no_copy);
        assert!(config.gather);
    }
}
