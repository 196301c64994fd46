use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stagefeed_core::{DeviceAllocator, DeviceId, Result, StageError};

use crate::buffer::DeviceBuffer;
use crate::context::{DeviceContext, DeviceContextConfig};

/// Configuration for the set of devices visible to a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSetConfig {
    /// Number of GPUs, numbered `0..gpu_count`.
    pub gpu_count: usize,
    /// Context settings applied to the host and to every GPU.
    pub context: DeviceContextConfig,
}

impl Default for DeviceSetConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            context: DeviceContextConfig::default(),
        }
    }
}

impl DeviceSetConfig {
    /// Host only, no GPUs.
    pub fn cpu_only() -> Self {
        Self {
            gpu_count: 0,
            ..Self::default()
        }
    }

    /// `count` GPUs with small pools, suitable for tests and demos.
    pub fn small(count: usize) -> Self {
        Self {
            gpu_count: count,
            context: DeviceContextConfig {
                pool_size: 1024 * 1024,
                max_pool_bytes: None,
                stream_count: 2,
            },
        }
    }
}

/// All device contexts of the process: the host plus each GPU.
///
/// Created once and shared (behind an `Arc`) by every pipeline and binding.
/// Contexts share no mutable state with each other.
pub struct DeviceSet {
    host: DeviceContext,
    gpus: Vec<DeviceContext>,
}

impl DeviceSet {
    pub fn new(config: DeviceSetConfig) -> Result<Arc<Self>> {
        tracing::info!(gpus = config.gpu_count, "initializing device set");

        let host = DeviceContext::new(DeviceId::Cpu, &config.context)?;
        let gpus = (0..config.gpu_count)
            .map(|ordinal| DeviceContext::new(DeviceId::Gpu(ordinal), &config.context))
            .collect::<Result<Vec<_>>>()?;

        Ok(Arc::new(Self { host, gpus }))
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    /// Context of `device`, or `InvalidDevice` if it does not exist.
    pub fn context(&self, device: DeviceId) -> Result<&DeviceContext> {
        match device {
            DeviceId::Cpu => Ok(&self.host),
            DeviceId::Gpu(ordinal) => self
                .gpus
                .get(ordinal)
                .ok_or(StageError::InvalidDevice(device)),
        }
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.context(device).is_ok()
    }

    /// The host followed by every GPU.
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        std::iter::once(DeviceId::Cpu).chain(self.gpus.iter().map(|ctx| ctx.device()))
    }

    /// Wait for all work on every device.
    pub fn synchronize(&self) -> Result<()> {
        self.host.synchronize()?;
        for gpu in &self.gpus {
            gpu.synchronize()?;
        }
        Ok(())
    }
}

impl DeviceAllocator for DeviceSet {
    type Buffer = DeviceBuffer;

    fn allocate(&self, device: DeviceId, size: usize) -> Result<DeviceBuffer> {
        self.context(device)?.memory_pool.alloc(size)
    }

    fn release(&self, buffer: DeviceBuffer) {
        match self.context(buffer.device()) {
            Ok(ctx) => ctx.memory_pool.free(buffer),
            Err(_) => drop(buffer),
        }
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("gpus", &self.gpus.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_host_and_gpus() {
        let set = DeviceSet::new(DeviceSetConfig::small(2)).unwrap();
        let devices: Vec<_> = set.devices().collect();
        assert_eq!(devices, vec![DeviceId::Cpu, DeviceId::Gpu(0), DeviceId::Gpu(1)]);
        assert!(set.contains(DeviceId::Gpu(1)));
        assert!(!set.contains(DeviceId::Gpu(2)));
    }

    #[test]
    fn allocates_on_the_requested_device() {
        let set = DeviceSet::new(DeviceSetConfig::small(1)).unwrap();
        let buf = set.allocate(DeviceId::Gpu(0), 64).unwrap();
        assert_eq!(buf.device(), DeviceId::Gpu(0));
        set.release(buf);

        match set.allocate(DeviceId::Gpu(3), 64) {
            Err(StageError::InvalidDevice(DeviceId::Gpu(3))) => {}
            other => panic!("expected invalid device, got {other:?}"),
        }
    }
}
