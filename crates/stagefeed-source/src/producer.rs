use std::fmt;

use stagefeed_core::{BatchMode, BoxError, CallingConvention};

use crate::array::ExternalArray;

/// Why a producer did not return data.
#[derive(Debug)]
pub enum SourceSignal {
    /// End of data. Ends the iteration cleanly.
    Stop,
    /// Any other failure. Fatal for the current run.
    Error(BoxError),
}

impl SourceSignal {
    /// A producer failure carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        SourceSignal::Error(message.to_string().into())
    }
}

impl<E> From<E> for SourceSignal
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        SourceSignal::Error(Box::new(err))
    }
}

/// What a producer returns for one call.
pub type Produced<T> = std::result::Result<T, SourceSignal>;

/// One iteration's worth of data from a batch producer.
#[derive(Debug, Clone)]
pub enum BatchOutput {
    /// A single array whose dimension 0 is the batch axis.
    Array(ExternalArray),
    /// One array per sample.
    Samples(Vec<ExternalArray>),
}

impl From<ExternalArray> for BatchOutput {
    fn from(array: ExternalArray) -> Self {
        BatchOutput::Array(array)
    }
}

impl From<Vec<ExternalArray>> for BatchOutput {
    fn from(samples: Vec<ExternalArray>) -> Self {
        BatchOutput::Samples(samples)
    }
}

/// Position of one per-sample call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// Iteration the sample belongs to.
    pub iteration: u64,
    /// Index of the sample within its batch.
    pub idx_in_batch: usize,
    /// Index of the sample since the start of the epoch.
    pub idx_in_epoch: u64,
}

type BatchFn = Box<dyn FnMut(u64) -> Produced<BatchOutput> + Send>;
type SampleFn = Box<dyn FnMut(SampleInfo) -> Produced<ExternalArray> + Send>;

/// A user-supplied data producer.
///
/// The calling convention is fixed by the constructor used to register the
/// producer: the `*_fn` constructors take closures without arguments.
pub struct Producer {
    kind: ProducerKind,
    convention: CallingConvention,
}

enum ProducerKind {
    Batch(BatchFn),
    Sample(SampleFn),
}

impl Producer {
    /// A batch producer receiving the iteration index.
    pub fn batch<F, O>(mut f: F) -> Self
    where
        F: FnMut(u64) -> Produced<O> + Send + 'static,
        O: Into<BatchOutput>,
    {
        Self {
            kind: ProducerKind::Batch(Box::new(move |i| f(i).map(Into::into))),
            convention: CallingConvention::IterationIndex,
        }
    }

    /// A batch producer called without arguments.
    pub fn batch_fn<F, O>(mut f: F) -> Self
    where
        F: FnMut() -> Produced<O> + Send + 'static,
        O: Into<BatchOutput>,
    {
        Self {
            kind: ProducerKind::Batch(Box::new(move |_| f().map(Into::into))),
            convention: CallingConvention::NoArgument,
        }
    }

    /// A per-sample producer receiving the sample position.
    pub fn sample<F>(f: F) -> Self
    where
        F: FnMut(SampleInfo) -> Produced<ExternalArray> + Send + 'static,
    {
        Self {
            kind: ProducerKind::Sample(Box::new(f)),
            convention: CallingConvention::IterationIndex,
        }
    }

    /// A per-sample producer called without arguments.
    pub fn sample_fn<F>(mut f: F) -> Self
    where
        F: FnMut() -> Produced<ExternalArray> + Send + 'static,
    {
        Self {
            kind: ProducerKind::Sample(Box::new(move |_| f())),
            convention: CallingConvention::NoArgument,
        }
    }

    pub fn batch_mode(&self) -> BatchMode {
        match self.kind {
            ProducerKind::Batch(_) => BatchMode::Batch,
            ProducerKind::Sample(_) => BatchMode::Sample,
        }
    }

    pub fn calling_convention(&self) -> CallingConvention {
        self.convention
    }

    pub(crate) fn call_batch(&mut self, iteration: u64) -> Option<Produced<BatchOutput>> {
        match &mut self.kind {
            ProducerKind::Batch(f) => Some(f(iteration)),
            ProducerKind::Sample(_) => None,
        }
    }

    pub(crate) fn call_sample(&mut self, info: SampleInfo) -> Option<Produced<ExternalArray>> {
        match &mut self.kind {
            ProducerKind::Sample(f) => Some(f(info)),
            ProducerKind::Batch(_) => None,
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("batch_mode", &self.batch_mode())
            .field("convention", &self.convention)
            .finish()
    }
}
