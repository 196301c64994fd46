use serde::{Deserialize, Serialize};

use stagefeed_core::{DeviceId, Placement, Result};

use crate::memory::MemoryPool;
use crate::stream::StreamPool;

/// Default staging pool slab size: 64 MB.
const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024;

/// Default number of streams per device.
const DEFAULT_STREAM_COUNT: usize = 4;

/// Per-device context holding the staging memory pool and stream pool.
pub struct DeviceContext {
    device: DeviceId,
    pub memory_pool: MemoryPool,
    pub stream_pool: StreamPool,
}

/// Configuration for one device context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceContextConfig {
    /// Slab size of the staging memory pool in bytes.
    pub pool_size: usize,
    /// Hard cap on pool memory in bytes. `None` lets the pool grow.
    pub max_pool_bytes: Option<usize>,
    /// Number of dedicated streams to create.
    pub stream_count: usize,
}

impl Default for DeviceContextConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_pool_bytes: None,
            stream_count: DEFAULT_STREAM_COUNT,
        }
    }
}

impl DeviceContext {
    /// Initialize a context for `device` with the given configuration.
    pub fn new(device: DeviceId, config: &DeviceContextConfig) -> Result<Self> {
        tracing::info!(
            device = %device,
            pool_mb = config.pool_size / (1024 * 1024),
            streams = config.stream_count,
            "initializing device context"
        );

        let memory_pool = MemoryPool::new(
            Placement::native(device),
            config.pool_size,
            config.max_pool_bytes,
        )?;
        let stream_pool = StreamPool::new(device, config.stream_count)?;

        Ok(Self {
            device,
            memory_pool,
            stream_pool,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Wait for all work on this device to complete.
    pub fn synchronize(&self) -> Result<()> {
        self.stream_pool.sync_all()
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("pool_id", &self.memory_pool.id())
            .field("streams", &self.stream_pool.pool_size())
            .finish()
    }
}
