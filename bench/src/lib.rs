//! Fixtures shared by the staging benchmarks.

use stagefeed_core::{DeviceId, Result};
use stagefeed_gpu::DeviceSetConfig;
use stagefeed_pipeline::{Pipeline, PipelineConfig};
use stagefeed_source::{ExternalArray, Producer, SourceConfig};

/// How the benchmark producer hands over each iteration.
#[derive(Debug, Clone, Copy)]
pub enum Feed {
    /// One batch array allocated up front and returned every iteration.
    Block,
    /// One array per sample, allocated up front.
    Samples,
}

/// A built pipeline with one never-ending GPU source of `batch_size`
/// samples of `sample_len` floats produced on `from`.
pub fn staging_pipeline(
    from: DeviceId,
    feed: Feed,
    batch_size: usize,
    sample_len: usize,
    source: SourceConfig,
) -> Result<Pipeline> {
    let mut config = PipelineConfig::gpu(batch_size, 0, 2);
    config.devices = DeviceSetConfig {
        gpu_count: 2,
        ..DeviceSetConfig::default()
    };

    let data = vec![1.0f32; batch_size * sample_len];
    let producer = match feed {
        Feed::Block => {
            let block = ExternalArray::from_slice(from, [batch_size, sample_len], &data)?;
            Producer::batch_fn(move || Ok(block.clone()))
        }
        Feed::Samples => {
            let samples = (0..batch_size)
                .map(|j| {
                    ExternalArray::from_slice(
                        from,
                        [sample_len],
                        &data[j * sample_len..(j + 1) * sample_len],
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            Producer::batch_fn(move || Ok(samples.clone()))
        }
    };

    let mut pipeline = Pipeline::with_devices(config)?;
    pipeline.add_source("bench", producer, source)?;
    pipeline.build()?;
    Ok(pipeline)
}
