use bytemuck::Zeroable;

use stagefeed_core::{
    DeviceId, Element, ElementType, MemoryKind, Placement, Result, Shape, StageError,
};
use stagefeed_gpu::{Allocation, AllocationId, Event, Region};

/// An array handed to the pipeline by a producer.
///
/// The array references producer-owned memory. Its device, memory kind and
/// allocation identity travel with it explicitly; nothing is inferred from
/// ambient state. Arrays that are views of the same allocation (see
/// [`ExternalArray::samples`]) share an [`AllocationId`].
#[derive(Clone)]
pub struct ExternalArray {
    region: Region,
    shape: Shape,
    element_type: ElementType,
    ready: Option<Event>,
}

impl ExternalArray {
    /// Copy `data` into a new allocation in the native memory of `device`.
    pub fn from_slice<T: Element>(
        device: DeviceId,
        shape: impl Into<Shape>,
        data: &[T],
    ) -> Result<Self> {
        Self::from_slice_in(Placement::native(device), shape, data)
    }

    /// Copy `data` into a new allocation at an explicit placement.
    pub fn from_slice_in<T: Element>(
        placement: Placement,
        shape: impl Into<Shape>,
        data: &[T],
    ) -> Result<Self> {
        let shape = shape.into();
        if !placement.is_valid() {
            return Err(StageError::InvalidRegion(format!(
                "cannot place device memory on {}",
                placement.device
            )));
        }
        if shape.num_elements() != data.len() {
            return Err(StageError::InvalidRegion(format!(
                "shape {shape} holds {} elements, got {}",
                shape.num_elements(),
                data.len()
            )));
        }
        let allocation = Allocation::from_bytes(placement, bytemuck::cast_slice(data).to_vec());
        Ok(Self {
            region: Region::whole(allocation),
            shape,
            element_type: T::TYPE,
            ready: None,
        })
    }

    /// A zero-filled array at `placement`.
    pub fn zeroed(placement: Placement, shape: impl Into<Shape>, element_type: ElementType) -> Self {
        let shape = shape.into();
        let size = shape.num_elements() * element_type.size_bytes();
        Self {
            region: Region::whole(Allocation::zeroed(placement, size)),
            shape,
            element_type,
            ready: None,
        }
    }

    /// View an existing region as an array.
    pub fn from_region(region: Region, shape: impl Into<Shape>, element_type: ElementType) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.num_elements() * element_type.size_bytes();
        if region.len() != expected {
            return Err(StageError::InvalidRegion(format!(
                "shape {shape} of {element_type} needs {expected} bytes, region has {}",
                region.len()
            )));
        }
        Ok(Self {
            region,
            shape,
            element_type,
            ready: None,
        })
    }

    /// Attach the completion event of the producer-side work that fills this array.
    pub fn with_ready(mut self, event: Event) -> Self {
        self.ready = Some(event);
        self
    }

    /// Split along dimension 0 into per-sample views of the same allocation.
    pub fn samples(&self) -> Result<Vec<ExternalArray>> {
        let Some(sample_shape) = self.shape.without_leading() else {
            return Err(StageError::InvalidRegion(
                "a scalar has no batch dimension to split".to_string(),
            ));
        };
        let count = self.shape.dims()[0];
        let sample_bytes = sample_shape.num_elements() * self.element_type.size_bytes();

        (0..count)
            .map(|i| {
                Ok(ExternalArray {
                    region: self.region.slice(i * sample_bytes, sample_bytes)?,
                    shape: sample_shape.clone(),
                    element_type: self.element_type,
                    ready: self.ready.clone(),
                })
            })
            .collect()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.region.allocation_id()
    }

    pub fn placement(&self) -> Placement {
        self.region.placement()
    }

    pub fn device(&self) -> DeviceId {
        self.region.placement().device
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.region.placement().memory
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn ready(&self) -> Option<&Event> {
        self.ready.as_ref()
    }

    pub fn size_bytes(&self) -> usize {
        self.region.len()
    }

    /// Read the contents, waiting for pending producer work first.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        check_type::<T>(self.element_type)?;
        if let Some(ready) = &self.ready {
            ready.wait()?;
        }
        Ok(self.region.read(bytes_to_vec::<T>))
    }

    /// Overwrite the contents synchronously.
    pub fn write<T: Element>(&self, data: &[T]) -> Result<()> {
        check_type::<T>(self.element_type)?;
        if data.len() != self.shape.num_elements() {
            return Err(StageError::InvalidRegion(format!(
                "array holds {} elements, got {}",
                self.shape.num_elements(),
                data.len()
            )));
        }
        self.region
            .write(|out| out.copy_from_slice(bytemuck::cast_slice(data)));
        Ok(())
    }
}

impl std::fmt::Debug for ExternalArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalArray")
            .field("placement", &self.placement())
            .field("allocation", &self.allocation_id())
            .field("offset", &self.region.offset())
            .field("shape", &self.shape)
            .field("element_type", &self.element_type)
            .finish()
    }
}

pub(crate) fn check_type<T: Element>(actual: ElementType) -> Result<()> {
    if T::TYPE != actual {
        return Err(StageError::TypeMismatch {
            expected: T::TYPE,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn bytes_to_vec<T: Element>(bytes: &[u8]) -> Vec<T> {
    let mut out = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    out
}
