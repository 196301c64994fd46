use stagefeed_core::{
    ContiguityMode, DeviceId, Element, ElementType, Placement, Result, Shape, StageError,
};
use stagefeed_gpu::{Event, Region};

use crate::array::{bytes_to_vec, check_type};
use crate::stager::{StagedBatch, StagedStorage};

/// The batch one source delivers to downstream operators for one iteration.
///
/// Holds the staging buffers (or, on the zero-copy path, the producer's
/// block) for as long as it lives. Reads wait on the staging event first.
pub struct Batch {
    source: Placement,
    target: Placement,
    mode: ContiguityMode,
    element_type: ElementType,
    shapes: Vec<Shape>,
    samples: Vec<Region>,
    offsets: Option<Vec<usize>>,
    copy_performed: bool,
    ready: Option<Event>,
    _storage: StagedStorage,
}

/// Package a staged iteration as a [`Batch`]. Allocates no device memory.
pub fn assemble(staged: StagedBatch) -> Result<Batch> {
    let StagedBatch {
        source,
        target,
        mode,
        element_type,
        shapes,
        storage,
        copy_performed,
        ready,
        source_release: _,
    } = staged;

    let sizes: Vec<usize> = shapes
        .iter()
        .map(|s| s.num_elements() * element_type.size_bytes())
        .collect();

    let (samples, offsets) = match &storage {
        StagedStorage::Aliased(block) => split_block(block, &sizes)?,
        StagedStorage::Block(buf) => split_block(buf.region(), &sizes)?,
        StagedStorage::PerSample(bufs) => {
            if bufs.len() != shapes.len() {
                return Err(StageError::Pipeline(format!(
                    "{} staging buffers for {} samples",
                    bufs.len(),
                    shapes.len()
                )));
            }
            (bufs.iter().map(|b| b.region().clone()).collect(), None)
        }
    };

    Ok(Batch {
        source,
        target,
        mode,
        element_type,
        shapes,
        samples,
        offsets,
        copy_performed,
        ready,
        _storage: storage,
    })
}

fn split_block(block: &Region, sizes: &[usize]) -> Result<(Vec<Region>, Option<Vec<usize>>)> {
    let mut samples = Vec::with_capacity(sizes.len());
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for &size in sizes {
        samples.push(block.slice(offset, size)?);
        offsets.push(offset);
        offset += size;
    }
    Ok((samples, Some(offsets)))
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Device the batch resides on.
    pub fn device(&self) -> DeviceId {
        self.target.device
    }

    pub fn placement(&self) -> Placement {
        self.target
    }

    /// Device the producer delivered the data on.
    pub fn source_device(&self) -> DeviceId {
        self.source.device
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Contiguity mode of the producer's input.
    pub fn input_mode(&self) -> ContiguityMode {
        self.mode
    }

    /// Whether all samples sit back to back in one block.
    pub fn is_contiguous(&self) -> bool {
        self.offsets.is_some()
    }

    /// False when the batch references producer memory directly.
    pub fn copy_performed(&self) -> bool {
        self.copy_performed
    }

    pub fn shape(&self, index: usize) -> Option<&Shape> {
        self.shapes.get(index)
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Byte offset of each sample within the batch block, when contiguous.
    pub fn offsets(&self) -> Option<&[usize]> {
        self.offsets.as_deref()
    }

    pub fn sample_region(&self, index: usize) -> Option<&Region> {
        self.samples.get(index)
    }

    pub fn ready(&self) -> Option<&Event> {
        self.ready.as_ref()
    }

    /// Block until the batch contents are readable.
    pub fn synchronize(&self) -> Result<()> {
        match &self.ready {
            Some(ready) => ready
                .wait()
                .map_err(|e| e.into_transfer(self.source.device, self.target.device)),
            None => Ok(()),
        }
    }

    /// Read sample `index` as a flat vector of `T`.
    pub fn sample_to_vec<T: Element>(&self, index: usize) -> Result<Vec<T>> {
        check_type::<T>(self.element_type)?;
        let region = self.samples.get(index).ok_or_else(|| {
            StageError::InvalidRegion(format!(
                "sample {index} out of range for batch of {}",
                self.samples.len()
            ))
        })?;
        self.synchronize()?;
        Ok(region.read(bytes_to_vec::<T>))
    }

    /// Copy every sample to host memory.
    pub fn to_host(&self) -> Result<HostBatch> {
        self.synchronize()?;
        let samples = self
            .samples
            .iter()
            .zip(&self.shapes)
            .map(|(region, shape)| HostSample {
                shape: shape.clone(),
                element_type: self.element_type,
                bytes: region.to_vec(),
            })
            .collect();
        Ok(HostBatch {
            device: self.target.device,
            samples,
        })
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("placement", &self.target)
            .field("mode", &self.mode)
            .field("element_type", &self.element_type)
            .field("samples", &self.samples.len())
            .field("copy_performed", &self.copy_performed)
            .finish()
    }
}

/// Host copy of a batch, detached from device memory.
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// Device the batch was read from.
    pub device: DeviceId,
    pub samples: Vec<HostSample>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HostSample> {
        self.samples.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostSample> {
        self.samples.iter()
    }
}

#[derive(Debug, Clone)]
pub struct HostSample {
    pub shape: Shape,
    pub element_type: ElementType,
    pub bytes: Vec<u8>,
}

impl HostSample {
    pub fn as_vec<T: Element>(&self) -> Result<Vec<T>> {
        check_type::<T>(self.element_type)?;
        Ok(bytes_to_vec::<T>(&self.bytes))
    }
}
