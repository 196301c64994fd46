use serde::{Deserialize, Serialize};

use stagefeed_core::{Result, StageError};
use stagefeed_gpu::DeviceSetConfig;

/// Runtime configuration for a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of samples per iteration.
    pub batch_size: usize,
    /// GPU that GPU-targeted sources deliver to. `None` for a host-only pipeline.
    pub device_ordinal: Option<usize>,
    /// Expected iterations per epoch, for reporting only.
    pub epoch_size: Option<u64>,
    /// Devices to create when the pipeline owns its device set.
    pub devices: DeviceSetConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            device_ordinal: Some(0),
            epoch_size: None,
            devices: DeviceSetConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Host-only pipeline.
    pub fn cpu_only(batch_size: usize) -> Self {
        Self {
            batch_size,
            device_ordinal: None,
            epoch_size: None,
            devices: DeviceSetConfig::cpu_only(),
        }
    }

    /// Pipeline whose GPU sources deliver to `ordinal`, with `gpu_count`
    /// small test-sized devices.
    pub fn gpu(batch_size: usize, ordinal: usize, gpu_count: usize) -> Self {
        Self {
            batch_size,
            device_ordinal: Some(ordinal),
            epoch_size: None,
            devices: DeviceSetConfig::small(gpu_count),
        }
    }

    /// Check the configuration against the number of GPUs actually present.
    pub fn validate(&self, gpu_count: usize) -> Result<()> {
        if self.batch_size == 0 {
            return Err(StageError::Config("batch_size must be at least 1".to_string()));
        }
        if let Some(ordinal) = self.device_ordinal {
            if ordinal >= gpu_count {
                return Err(StageError::Config(format!(
                    "device_ordinal {ordinal} out of range, {gpu_count} GPUs available"
                )));
            }
        }
        Ok(())
    }
}
