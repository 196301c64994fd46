use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    Cpu,
    Gpu(usize),
}

impl DeviceId {
    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceId::Gpu(_))
    }

    /// The memory kind a device natively allocates.
    pub fn native_memory(&self) -> MemoryKind {
        match self {
            DeviceId::Cpu => MemoryKind::Host,
            DeviceId::Gpu(_) => MemoryKind::Device,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Cpu => write!(f, "cpu"),
            DeviceId::Gpu(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

/// Parses `cpu`, `gpu` (ordinal 0) and `gpu:N`.
impl std::str::FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceId::Cpu),
            "gpu" => Ok(DeviceId::Gpu(0)),
            other => other
                .strip_prefix("gpu:")
                .and_then(|n| n.parse().ok())
                .map(DeviceId::Gpu)
                .ok_or_else(|| format!("invalid device '{s}', expected cpu, gpu or gpu:N")),
        }
    }
}

/// Where the bytes of an allocation physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Host,
    Device,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::Device => write!(f, "device"),
        }
    }
}

/// A device together with the kind of memory used on it.
///
/// `Gpu(n)` with `Host` memory is pinned host memory associated with GPU n.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub device: DeviceId,
    pub memory: MemoryKind,
}

impl Placement {
    pub fn new(device: DeviceId, memory: MemoryKind) -> Self {
        Self { device, memory }
    }

    /// Native placement of a device: host memory for the CPU, device memory for a GPU.
    pub fn native(device: DeviceId) -> Self {
        Self {
            device,
            memory: device.native_memory(),
        }
    }

    /// CPU placements may only hold host memory.
    pub fn is_valid(&self) -> bool {
        !(self.device == DeviceId::Cpu && self.memory == MemoryKind::Device)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device, self.memory)
    }
}

/// Numeric element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "uint8",
            ElementType::I8 => "int8",
            ElementType::U16 => "uint16",
            ElementType::I16 => "int16",
            ElementType::U32 => "uint32",
            ElementType::I32 => "int32",
            ElementType::U64 => "uint64",
            ElementType::I64 => "int64",
            ElementType::F32 => "float32",
            ElementType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// A plain-old-data Rust type with a fixed element tag.
pub trait Element: bytemuck::Pod + Send + Sync {
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(impl Element for $ty {
            const TYPE: ElementType = ElementType::$tag;
        })*
    };
}

impl_element!(
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

/// Ordered dimension sizes of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// Shape with the leading (batch) dimension removed.
    pub fn without_leading(&self) -> Option<Shape> {
        self.0.split_first().map(|(_, rest)| Shape(rest.to_vec()))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

/// How the samples of one iteration are laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContiguityMode {
    /// All samples in one base allocation, densely packed in order.
    Contiguous,
    /// Every sample in its own allocation.
    Noncontiguous,
}

impl fmt::Display for ContiguityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContiguityMode::Contiguous => write!(f, "contiguous"),
            ContiguityMode::Noncontiguous => write!(f, "noncontiguous"),
        }
    }
}

/// Whether a producer yields whole batches or individual samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One call per iteration returning a batch array or a list of samples.
    #[default]
    Batch,
    /// One call per sample, `batch_size` calls per iteration.
    Sample,
}

/// Whether a producer receives the iteration (or sample) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    #[default]
    IterationIndex,
    NoArgument,
}

/// Device a source delivers its batches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDevice {
    #[default]
    Cpu,
    Gpu,
}
