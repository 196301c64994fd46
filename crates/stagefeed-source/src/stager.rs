use std::sync::Arc;

use stagefeed_core::{
    ContiguityMode, DeviceAllocator, ElementType, ExecutionStream, Placement, Result, Shape,
    StageError,
};
use stagefeed_gpu::{DeviceBuffer, DeviceSet, DeviceStream, Event, Region};

use crate::descriptor::BufferDescriptor;
use crate::driver::RawBatch;

/// Per-source staging switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagingOptions {
    pub no_copy: bool,
    pub gather: bool,
}

/// Where the staged bytes live.
pub enum StagedStorage {
    /// Zero-copy: the producer's own contiguous block.
    Aliased(Region),
    /// One staging buffer holding every sample back to back.
    Block(DeviceBuffer),
    /// One staging buffer per sample.
    PerSample(Vec<DeviceBuffer>),
}

impl std::fmt::Debug for StagedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagedStorage::Aliased(region) => f.debug_tuple("Aliased").field(region).finish(),
            StagedStorage::Block(buf) => f.debug_tuple("Block").field(buf).finish(),
            StagedStorage::PerSample(bufs) => f.debug_tuple("PerSample").field(&bufs.len()).finish(),
        }
    }
}

/// One iteration's data, resident on the target device.
#[derive(Debug)]
pub struct StagedBatch {
    pub source: Placement,
    pub target: Placement,
    pub mode: ContiguityMode,
    pub element_type: ElementType,
    pub shapes: Vec<Shape>,
    pub storage: StagedStorage,
    /// False only on the zero-copy path.
    pub copy_performed: bool,
    /// Consumers wait on this before reading.
    pub ready: Option<Event>,
    /// Completes once staging no longer reads producer memory.
    pub source_release: Option<Event>,
}

/// Makes producer data resident on a target device.
pub struct Stager {
    devices: Arc<DeviceSet>,
}

impl Stager {
    pub fn new(devices: Arc<DeviceSet>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    /// Stage one validated iteration onto `target`, enqueueing copies on `stream`.
    ///
    /// Producer memory is referenced directly only when it already sits at
    /// the target placement as one contiguous block and `no_copy` is on.
    /// Every other case copies into pool memory, preserving sample order.
    pub fn stage(
        &self,
        raw: &RawBatch,
        mode: ContiguityMode,
        target: Placement,
        options: StagingOptions,
        stream: &DeviceStream,
    ) -> Result<StagedBatch> {
        let descriptors = &raw.descriptors;
        let Some(first) = descriptors.first() else {
            return Err(StageError::Pipeline("cannot stage an empty batch".to_string()));
        };
        let source = first.placement();
        let transfer = |e: StageError| e.into_transfer(source.device, target.device);

        self.devices.context(source.device).map_err(transfer)?;
        self.devices.context(target.device).map_err(transfer)?;
        if stream.device() != target.device {
            return Err(transfer(StageError::Stream(format!(
                "staging stream belongs to {}",
                stream.device()
            ))));
        }

        let shapes: Vec<Shape> = descriptors.iter().map(|d| d.shape.clone()).collect();
        let total: usize = descriptors.iter().map(BufferDescriptor::size_bytes).sum();
        let producer_events = distinct_events(descriptors);

        if options.no_copy && source == target && mode == ContiguityMode::Contiguous {
            let span = Region::new(
                first.owner_handle.region().allocation().clone(),
                first.owner_handle.offset(),
                total,
            )
            .map_err(transfer)?;

            let ready = match producer_events.len() {
                0 => None,
                1 => producer_events.into_iter().next(),
                _ => {
                    for event in &producer_events {
                        event.wait().map_err(transfer)?;
                    }
                    None
                }
            };

            tracing::debug!(
                iteration = raw.iteration,
                target = %target,
                bytes = total,
                "staged batch without copy"
            );

            return Ok(StagedBatch {
                source,
                target,
                mode,
                element_type: first.element_type,
                shapes,
                storage: StagedStorage::Aliased(span),
                copy_performed: false,
                ready,
                source_release: None,
            });
        }

        // Order the copies after the producer's own work.
        for event in &producer_events {
            if event.device() == Some(target.device) {
                stream.wait_event(event);
            } else {
                event.wait().map_err(transfer)?;
            }
        }

        // Every buffer allocated here is fenced by `done`, also on failure.
        let per_sample = mode == ContiguityMode::Noncontiguous && !options.gather;
        let mut staging = Vec::new();
        let enqueued = self.enqueue_copies(descriptors, mode, per_sample, target, stream, &mut staging);
        let done = stream.record_event();
        for buf in &staging {
            buf.mark_in_use(done.clone());
        }
        enqueued.map_err(transfer)?;

        let storage = if per_sample {
            StagedStorage::PerSample(staging)
        } else {
            match staging.pop() {
                Some(buf) => StagedStorage::Block(buf),
                None => {
                    return Err(transfer(StageError::Pipeline(
                        "no staging buffer was allocated".to_string(),
                    )))
                }
            }
        };

        tracing::debug!(
            iteration = raw.iteration,
            source = %source,
            target = %target,
            mode = %mode,
            bytes = total,
            "staged batch with copy"
        );

        Ok(StagedBatch {
            source,
            target,
            mode,
            element_type: first.element_type,
            shapes,
            storage,
            copy_performed: true,
            ready: Some(done.clone()),
            source_release: Some(done),
        })
    }

    /// Allocate staging buffers on `target` and enqueue the copies into them.
    fn enqueue_copies(
        &self,
        descriptors: &[BufferDescriptor],
        mode: ContiguityMode,
        per_sample: bool,
        target: Placement,
        stream: &DeviceStream,
        staging: &mut Vec<DeviceBuffer>,
    ) -> Result<()> {
        if per_sample {
            for d in descriptors {
                staging.push(self.devices.allocate(target.device, d.size_bytes())?);
                if let Some(buf) = staging.last() {
                    stream.copy_async(d.owner_handle.region(), buf.region())?;
                }
            }
            return Ok(());
        }

        let total = descriptors.iter().map(BufferDescriptor::size_bytes).sum();
        staging.push(self.devices.allocate(target.device, total)?);
        let Some(buf) = staging.last() else {
            return Ok(());
        };
        if mode == ContiguityMode::Contiguous {
            let first = &descriptors[0].owner_handle;
            let span = Region::new(first.region().allocation().clone(), first.offset(), total)?;
            stream.copy_async(&span, buf.region())?;
        } else {
            let mut offset = 0;
            for d in descriptors {
                let dst = buf.region().slice(offset, d.size_bytes())?;
                stream.copy_async(d.owner_handle.region(), &dst)?;
                offset += d.size_bytes();
            }
        }
        Ok(())
    }
}

fn distinct_events(descriptors: &[BufferDescriptor]) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::new();
    for event in descriptors.iter().filter_map(|d| d.ready.as_ref()) {
        if !events.iter().any(|e| e.same_as(event)) {
            events.push(event.clone());
        }
    }
    events
}
