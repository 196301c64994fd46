use stagefeed_core::{ElementType, Result, StageError};

use crate::array::ExternalArray;
use crate::descriptor::BufferDescriptor;
use crate::layout::BatchOrigin;
use crate::producer::{BatchOutput, Producer, SampleInfo, SourceSignal};

/// One iteration's producer output, as descriptors.
#[derive(Debug)]
pub struct RawBatch {
    pub iteration: u64,
    pub origin: BatchOrigin,
    pub descriptors: Vec<BufferDescriptor>,
}

/// Result of invoking a producer for one iteration.
#[derive(Debug)]
pub enum Invocation {
    Data(RawBatch),
    /// The producer signalled end of data.
    Stop,
}

/// Calls a producer once per iteration and normalizes what it returns.
///
/// The driver also owns the per-source schema: element type and per-sample
/// rank are fixed by the first successful iteration.
#[derive(Debug)]
pub struct InvocationDriver {
    batch_size: usize,
    schema: Option<(ElementType, usize)>,
}

impl InvocationDriver {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            schema: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Element type and per-sample rank established so far.
    pub fn schema(&self) -> Option<(ElementType, usize)> {
        self.schema
    }

    pub fn reset(&mut self) {
        self.schema = None;
    }

    /// Invoke `producer` for `iteration`.
    ///
    /// A batch producer is called exactly once; a per-sample producer exactly
    /// `batch_size` times. Nothing is retried.
    pub fn invoke(
        &mut self,
        source_name: &str,
        producer: &mut Producer,
        iteration: u64,
    ) -> Result<Invocation> {
        let (arrays, origin) = match self.call(source_name, producer, iteration)? {
            Some(result) => result,
            None => {
                tracing::debug!(source = source_name, iteration, "producer signalled end of data");
                return Ok(Invocation::Stop);
            }
        };

        if arrays.is_empty() || arrays.len() > self.batch_size {
            return Err(StageError::Schema {
                source_name: source_name.to_string(),
                detail: format!(
                    "iteration {iteration} produced {} samples, expected 1..={}",
                    arrays.len(),
                    self.batch_size
                ),
            });
        }

        let descriptors: Vec<BufferDescriptor> = arrays.iter().map(BufferDescriptor::from).collect();
        self.check_schema(source_name, iteration, &descriptors)?;

        tracing::trace!(
            source = source_name,
            iteration,
            samples = descriptors.len(),
            "producer returned data"
        );

        Ok(Invocation::Data(RawBatch {
            iteration,
            origin,
            descriptors,
        }))
    }

    fn call(
        &self,
        source_name: &str,
        producer: &mut Producer,
        iteration: u64,
    ) -> Result<Option<(Vec<ExternalArray>, BatchOrigin)>> {
        let failed = |cause| StageError::Producer {
            source_name: source_name.to_string(),
            cause,
        };

        if let Some(result) = producer.call_batch(iteration) {
            return match result {
                Ok(BatchOutput::Array(array)) => {
                    if array.shape().rank() == 0 {
                        return Err(StageError::Schema {
                            source_name: source_name.to_string(),
                            detail: "a batch array needs a leading batch dimension".to_string(),
                        });
                    }
                    Ok(Some((array.samples()?, BatchOrigin::Array)))
                }
                Ok(BatchOutput::Samples(samples)) => Ok(Some((samples, BatchOrigin::List))),
                Err(SourceSignal::Stop) => Ok(None),
                Err(SourceSignal::Error(cause)) => Err(failed(cause)),
            };
        }

        let mut samples = Vec::with_capacity(self.batch_size);
        for idx_in_batch in 0..self.batch_size {
            let info = SampleInfo {
                iteration,
                idx_in_batch,
                idx_in_epoch: iteration * self.batch_size as u64 + idx_in_batch as u64,
            };
            match producer.call_sample(info) {
                Some(Ok(array)) => samples.push(array),
                Some(Err(SourceSignal::Stop)) => return Ok(None),
                Some(Err(SourceSignal::Error(cause))) => return Err(failed(cause)),
                None => {
                    return Err(StageError::Pipeline(format!(
                        "producer of source '{source_name}' is neither batch nor per-sample"
                    )))
                }
            }
        }
        Ok(Some((samples, BatchOrigin::Samples)))
    }

    fn check_schema(
        &mut self,
        source_name: &str,
        iteration: u64,
        descriptors: &[BufferDescriptor],
    ) -> Result<()> {
        let schema_error = |detail: String| StageError::Schema {
            source_name: source_name.to_string(),
            detail,
        };

        let first = &descriptors[0];
        let observed = (first.element_type, first.shape.rank());

        for (i, d) in descriptors.iter().enumerate().skip(1) {
            if (d.element_type, d.shape.rank()) != observed {
                return Err(schema_error(format!(
                    "iteration {iteration}: sample {i} is {} of rank {}, sample 0 is {} of rank {}",
                    d.element_type,
                    d.shape.rank(),
                    observed.0,
                    observed.1
                )));
            }
        }

        match self.schema {
            None => {
                self.schema = Some(observed);
                Ok(())
            }
            Some(expected) if expected == observed => Ok(()),
            Some((dtype, rank)) => Err(schema_error(format!(
                "iteration {iteration}: expected {dtype} samples of rank {rank}, got {} of rank {}",
                observed.0, observed.1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use stagefeed_core::{DeviceId, Shape};

    use super::*;

    fn unwrap_data(invocation: Invocation) -> RawBatch {
        match invocation {
            Invocation::Data(raw) => raw,
            Invocation::Stop => panic!("unexpected stop"),
        }
    }

    #[test]
    fn batch_array_is_split_into_samples() {
        let mut producer = Producer::batch(|i| {
            let v = i as f32;
            Ok(ExternalArray::from_slice(DeviceId::Cpu, [2, 2], &[v, v, v, v])?)
        });
        let mut driver = InvocationDriver::new(2);
        let raw = unwrap_data(driver.invoke("s", &mut producer, 3).unwrap());
        assert_eq!(raw.iteration, 3);
        assert_eq!(raw.origin, BatchOrigin::Array);
        assert_eq!(raw.descriptors.len(), 2);
        assert_eq!(raw.descriptors[1].shape, Shape::from([2]));
        assert_eq!(driver.schema(), Some((ElementType::F32, 1)));
    }

    #[test]
    fn sample_producer_is_called_batch_size_times() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut producer = Producer::sample(move |info| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(info.idx_in_epoch, info.iteration * 3 + info.idx_in_batch as u64);
            Ok(ExternalArray::from_slice(DeviceId::Cpu, [1], &[info.idx_in_batch as i32])?)
        });
        let mut driver = InvocationDriver::new(3);
        let raw = unwrap_data(driver.invoke("s", &mut producer, 1).unwrap());
        assert_eq!(raw.origin, BatchOrigin::Samples);
        assert_eq!(raw.descriptors.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_and_errors_are_distinct() {
        let mut driver = InvocationDriver::new(1);

        let mut stopping = Producer::batch_fn(|| -> crate::Produced<ExternalArray> { Err(SourceSignal::Stop) });
        assert!(matches!(driver.invoke("s", &mut stopping, 0).unwrap(), Invocation::Stop));

        let mut failing =
            Producer::batch_fn(|| -> crate::Produced<ExternalArray> { Err(SourceSignal::msg("disk on fire")) });
        match driver.invoke("s", &mut failing, 0) {
            Err(StageError::Producer { source_name, cause }) => {
                assert_eq!(source_name, "s");
                assert_eq!(cause.to_string(), "disk on fire");
            }
            other => panic!("expected producer error, got {other:?}"),
        }
    }

    #[test]
    fn schema_drift_is_fatal() {
        let mut producer = Producer::batch(|i| {
            if i == 0 {
                Ok(ExternalArray::from_slice(DeviceId::Cpu, [1, 1], &[1.0f32])?)
            } else {
                Ok(ExternalArray::from_slice(DeviceId::Cpu, [1, 1], &[1.0f64])?)
            }
        });
        let mut driver = InvocationDriver::new(1);
        driver.invoke("s", &mut producer, 0).unwrap();
        assert!(matches!(
            driver.invoke("s", &mut producer, 1),
            Err(StageError::Schema { .. })
        ));
    }

    #[test]
    fn rank_drift_is_fatal() {
        let mut producer = Producer::batch(|i| {
            let shape = if i == 0 { vec![2] } else { vec![1, 2] };
            Ok(vec![ExternalArray::from_slice(DeviceId::Cpu, shape, &[1u8, 2])?])
        });
        let mut driver = InvocationDriver::new(1);
        driver.invoke("s", &mut producer, 0).unwrap();
        assert!(matches!(
            driver.invoke("s", &mut producer, 1),
            Err(StageError::Schema { .. })
        ));
        driver.reset();
        assert!(driver.invoke("s", &mut producer, 1).is_ok());
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let mut producer =
            Producer::batch_fn(|| Ok(ExternalArray::from_slice(DeviceId::Cpu, [3, 1], &[1u8, 2, 3])?));
        let mut driver = InvocationDriver::new(2);
        assert!(matches!(
            driver.invoke("s", &mut producer, 0),
            Err(StageError::Schema { .. })
        ));
    }
}
