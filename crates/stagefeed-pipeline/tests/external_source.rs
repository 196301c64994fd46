//! End-to-end behaviour of external sources driven through a pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagefeed_core::{
    ContiguityMode, DeviceId, ElementType, ExecutionStream, Placement, StageError,
};
use stagefeed_gpu::{AllocationId, DeviceSet, DeviceSetConfig};
use stagefeed_pipeline::{DevicePairs, Pipeline, PipelineConfig};
use stagefeed_source::{ExternalArray, Producer, SourceConfig, SourceSignal};

fn config_for(target: DeviceId, batch_size: usize) -> (PipelineConfig, SourceConfig) {
    match target {
        DeviceId::Cpu => (PipelineConfig::cpu_only(batch_size), SourceConfig::cpu()),
        DeviceId::Gpu(n) => (PipelineConfig::gpu(batch_size, n, 2), SourceConfig::gpu()),
    }
}

/// Per-sample producer on `src` whose writes complete asynchronously on a
/// stream of that device.
fn async_sample_producer(devices: Arc<DeviceSet>, src: DeviceId) -> Producer {
    Producer::sample(move |info| {
        let stream = devices.context(src)?.stream_pool.default_stream().clone();
        let base = if info.idx_in_batch == 0 { 1 } else { 5 };
        let values: Vec<i32> = (0..4).map(|k| base + k + info.iteration as i32).collect();

        let array = ExternalArray::zeroed(Placement::native(src), [4], ElementType::I32);
        stream.launch(|| std::thread::sleep(Duration::from_millis(2)));
        stream.write_async(array.region(), i32_bytes(&values))?;
        Ok(array.with_ready(stream.record_event()))
    })
}

/// Batch producer on `src` returning one `[2, 4]` array of
/// `[[1, 2, 3, 4], [5, 6, 7, 8]] + iteration`, written asynchronously.
fn async_batch_producer(devices: Arc<DeviceSet>, src: DeviceId) -> Producer {
    Producer::batch(move |i| {
        let stream = devices.context(src)?.stream_pool.default_stream().clone();
        let values: Vec<i32> = (1..=8).map(|v| v + i as i32).collect();

        let array = ExternalArray::zeroed(Placement::native(src), [2, 4], ElementType::I32);
        stream.launch(|| std::thread::sleep(Duration::from_millis(2)));
        stream.write_async(array.region(), i32_bytes(&values))?;
        Ok(array.with_ready(stream.record_event()))
    })
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

#[test]
fn cross_device_staging_for_every_pair() {
    let devices = DeviceSet::new(DeviceSetConfig::small(2)).unwrap();

    for (src, dst) in DevicePairs::all(&devices).iter() {
        let (config, source) = config_for(dst, 2);
        let mut pipeline = Pipeline::new(config, devices.clone()).unwrap();
        pipeline
            .add_source("data", async_sample_producer(devices.clone(), src), source)
            .unwrap();
        pipeline.build().unwrap();

        for i in 0..10 {
            let outputs = pipeline.run().unwrap().unwrap();
            let batch = outputs.by_name("data").unwrap();
            assert_eq!(batch.device(), dst, "{src} -> {dst}");
            assert_eq!(batch.input_mode(), ContiguityMode::Noncontiguous);
            assert!(batch.copy_performed());

            let host = batch.to_host().unwrap();
            assert_eq!(host.get(0).unwrap().as_vec::<i32>().unwrap(), vec![1 + i, 2 + i, 3 + i, 4 + i]);
            assert_eq!(host.get(1).unwrap().as_vec::<i32>().unwrap(), vec![5 + i, 6 + i, 7 + i, 8 + i]);
        }
    }
}

#[test]
fn contiguous_staging_for_every_pair() {
    let devices = DeviceSet::new(DeviceSetConfig::small(2)).unwrap();

    for (src, dst) in DevicePairs::all(&devices).iter() {
        let (config, source) = config_for(dst, 2);
        let mut pipeline = Pipeline::new(config, devices.clone()).unwrap();
        pipeline
            .add_source("data", async_batch_producer(devices.clone(), src), source)
            .unwrap();
        pipeline.build().unwrap();

        for i in 0..10 {
            let outputs = pipeline.run().unwrap().unwrap();
            let batch = outputs.by_name("data").unwrap();
            assert_eq!(batch.device(), dst, "{src} -> {dst}");
            assert_eq!(batch.input_mode(), ContiguityMode::Contiguous);
            assert!(batch.is_contiguous());
            assert!(batch.copy_performed());
            assert_eq!(batch.offsets(), Some(&[0, 16][..]));

            let host = batch.to_host().unwrap();
            assert_eq!(host.get(0).unwrap().as_vec::<i32>().unwrap(), vec![1 + i, 2 + i, 3 + i, 4 + i]);
            assert_eq!(host.get(1).unwrap().as_vec::<i32>().unwrap(), vec![5 + i, 6 + i, 7 + i, 8 + i]);
        }
    }
}

#[test]
fn zero_copy_across_rebuilds() {
    let devices = DeviceSet::new(DeviceSetConfig::small(1)).unwrap();
    let attempt = Arc::new(AtomicU64::new(0));
    let produced: Arc<Mutex<Vec<AllocationId>>> = Arc::new(Mutex::new(Vec::new()));

    let producer = {
        let attempt = attempt.clone();
        let produced = produced.clone();
        Producer::batch(move |i| {
            if i >= 10 {
                return Err(SourceSignal::Stop);
            }
            let value = (attempt.load(Ordering::SeqCst) * 100 + i * 10) as f32 + 1.5;
            let array = ExternalArray::from_slice(DeviceId::Gpu(0), [1, 1], &[value])?;
            produced.lock().unwrap().push(array.allocation_id());
            Ok(array)
        })
    };

    let mut pipeline = Pipeline::new(PipelineConfig::gpu(1, 0, 1), devices).unwrap();
    pipeline
        .add_source("x", producer, SourceConfig::gpu().with_no_copy(true))
        .unwrap();

    for a in 0..10u64 {
        attempt.store(a, Ordering::SeqCst);
        pipeline.build().unwrap();
        for i in 0..10u64 {
            let outputs = pipeline.run().unwrap().unwrap();
            let batch = outputs.by_name("x").unwrap();
            assert!(!batch.copy_performed());
            assert_eq!(
                batch.sample_region(0).unwrap().allocation_id(),
                *produced.lock().unwrap().last().unwrap()
            );
            let expected = (a * 100 + i * 10) as f32 + 1.5;
            assert_eq!(batch.sample_to_vec::<f32>(0).unwrap(), vec![expected]);
        }
        assert!(pipeline.run().unwrap().is_none());
    }
}

#[test]
fn copy_is_performed_without_opt_in() {
    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(1, 0, 1)).unwrap();
    pipeline
        .add_source(
            "x",
            Producer::batch(|_| Ok(ExternalArray::from_slice(DeviceId::Gpu(0), [1, 1], &[2.5f32])?)),
            SourceConfig::gpu(),
        )
        .unwrap();
    pipeline.build().unwrap();
    let outputs = pipeline.run().unwrap().unwrap();
    assert!(outputs.by_name("x").unwrap().copy_performed());
}

#[test]
fn mixing_contiguous_and_noncontiguous_fails() {
    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(2, 0, 1)).unwrap();
    let producer = Producer::batch(|i| {
        let batch: stagefeed_source::BatchOutput = if i % 2 == 0 {
            vec![
                ExternalArray::from_slice(DeviceId::Gpu(0), [1], &[i as f32])?,
                ExternalArray::from_slice(DeviceId::Gpu(0), [1], &[i as f32])?,
            ]
            .into()
        } else {
            ExternalArray::from_slice(DeviceId::Gpu(0), [2, 1], &[i as f32, i as f32])?.into()
        };
        Ok(batch)
    });
    pipeline
        .add_source("mixed", producer, SourceConfig::gpu().with_no_copy(true))
        .unwrap();
    pipeline.build().unwrap();

    assert!(pipeline.run().unwrap().is_some());
    let err = pipeline.run().err().unwrap();
    match &err {
        StageError::Layout {
            source_name,
            expected,
            observed,
            ..
        } => {
            assert_eq!(source_name, "mixed");
            assert_eq!(*expected, Some(ContiguityMode::Noncontiguous));
            assert_eq!(*observed, Some(ContiguityMode::Contiguous));
        }
        other => panic!("expected layout error, got {other:?}"),
    }
    assert!(err
        .to_string()
        .contains("must not mix contiguous and noncontiguous inputs"));
    assert!(pipeline.has_failed());
    assert!(matches!(
        pipeline.run(),
        Err(StageError::BindingFailed { .. })
    ));
}

#[test]
fn rebuild_recovers_after_failure() {
    let fail_once = Arc::new(AtomicBool::new(true));
    let producer = {
        let fail_once = fail_once.clone();
        Producer::batch(move |i| {
            if i == 2 && fail_once.swap(false, Ordering::SeqCst) {
                return Err(SourceSignal::msg("transient read error"));
            }
            Ok(ExternalArray::from_slice(DeviceId::Cpu, [1], &[i as u64])?)
        })
    };

    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(1, 0, 1)).unwrap();
    pipeline.add_source("x", producer, SourceConfig::gpu()).unwrap();

    pipeline.build().unwrap();
    assert!(pipeline.run().unwrap().is_some());
    assert!(pipeline.run().unwrap().is_some());
    assert!(matches!(pipeline.run(), Err(StageError::Producer { .. })));
    assert!(matches!(pipeline.run(), Err(StageError::BindingFailed { .. })));

    pipeline.build().unwrap();
    pipeline.build().unwrap();
    for i in 0..5u64 {
        let outputs = pipeline.run().unwrap().unwrap();
        assert_eq!(outputs.by_name("x").unwrap().sample_to_vec::<u64>(0).unwrap(), vec![i]);
    }
    assert!(!pipeline.has_failed());
}

#[test]
fn rebuild_after_layout_error_establishes_a_new_mode() {
    let calls = Arc::new(AtomicU64::new(0));
    let producer = {
        let calls = calls.clone();
        Producer::batch(move |i| {
            let v = i as f32;
            let batch: stagefeed_source::BatchOutput = if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ExternalArray::from_slice(DeviceId::Gpu(0), [2, 1], &[v, v + 0.5])?.into()
            } else {
                vec![
                    ExternalArray::from_slice(DeviceId::Gpu(0), [1], &[v])?,
                    ExternalArray::from_slice(DeviceId::Gpu(0), [1], &[v + 0.5])?,
                ]
                .into()
            };
            Ok(batch)
        })
    };

    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(2, 0, 1)).unwrap();
    let id = pipeline
        .add_source("switch", producer, SourceConfig::gpu().with_no_copy(true))
        .unwrap();
    pipeline.build().unwrap();

    assert!(pipeline.run().unwrap().is_some());
    assert_eq!(
        pipeline.source(id).unwrap().observed_mode(),
        Some(ContiguityMode::Contiguous)
    );
    assert!(matches!(pipeline.run(), Err(StageError::Layout { .. })));
    assert!(pipeline.has_failed());

    pipeline.build().unwrap();
    let binding = pipeline.source(id).unwrap();
    assert_eq!(binding.observed_mode(), None);
    assert_eq!(binding.schema(), None);
    assert_eq!(binding.iteration(), 0);

    for i in 0..3 {
        let outputs = pipeline.run().unwrap().unwrap();
        let batch = &outputs[id];
        assert_eq!(batch.input_mode(), ContiguityMode::Noncontiguous);
        assert_eq!(batch.sample_to_vec::<f32>(1).unwrap(), vec![i as f32 + 0.5]);
    }
    assert_eq!(
        pipeline.source(id).unwrap().observed_mode(),
        Some(ContiguityMode::Noncontiguous)
    );
    assert!(!pipeline.has_failed());
}

#[test]
fn per_sample_stop_ends_the_run() {
    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(3, 0, 1)).unwrap();
    let producer = Producer::sample(|info| {
        if info.idx_in_epoch >= 4 * 3 + 1 {
            return Err(SourceSignal::Stop);
        }
        Ok(ExternalArray::from_slice(DeviceId::Cpu, [2], &[info.idx_in_epoch as u16, 0])?)
    });
    pipeline.add_source("x", producer, SourceConfig::gpu()).unwrap();
    pipeline.build().unwrap();

    let mut seen = 0;
    while let Some(outputs) = pipeline.run().unwrap() {
        assert_eq!(outputs.by_name("x").unwrap().len(), 3);
        seen += 1;
    }
    assert_eq!(seen, 4);
    assert_eq!(pipeline.iterations_run(), 4);
    assert!(pipeline.run().unwrap().is_none());
}

#[test]
fn any_source_stopping_stops_the_iteration() {
    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(1, 0, 1)).unwrap();
    let limited = |limit: u64| {
        Producer::batch(move |i| {
            if i >= limit {
                return Err(SourceSignal::Stop);
            }
            Ok(ExternalArray::from_slice(DeviceId::Cpu, [1, 1], &[i as i8])?)
        })
    };
    pipeline.add_source("long", limited(10), SourceConfig::cpu()).unwrap();
    pipeline.add_source("short", limited(2), SourceConfig::gpu()).unwrap();
    pipeline.build().unwrap();

    assert!(pipeline.run().unwrap().is_some());
    assert!(pipeline.run().unwrap().is_some());
    assert!(pipeline.run().unwrap().is_none());
    assert_eq!(pipeline.epoch_size(), Some(2));
}

#[test]
fn producer_may_reuse_memory_after_release() {
    let devices = DeviceSet::new(DeviceSetConfig::small(2)).unwrap();
    let scratch = ExternalArray::zeroed(Placement::native(DeviceId::Gpu(1)), [1, 64], ElementType::U32);
    let producer = {
        let scratch = scratch.clone();
        Producer::batch(move |i| {
            if i >= 20 {
                return Err(SourceSignal::Stop);
            }
            scratch.write(&vec![i as u32; 64])?;
            Ok(scratch.clone())
        })
    };

    let mut pipeline = Pipeline::new(PipelineConfig::gpu(1, 0, 2), devices).unwrap();
    pipeline.add_source("x", producer, SourceConfig::gpu()).unwrap();
    pipeline.build().unwrap();

    let mut kept = Vec::new();
    while let Some(outputs) = pipeline.run().unwrap() {
        kept.push(outputs.by_name("x").unwrap().to_host().unwrap());
    }
    for (i, host) in kept.iter().enumerate() {
        assert_eq!(host.get(0).unwrap().as_vec::<u32>().unwrap(), vec![i as u32; 64]);
    }
}

#[test]
fn unknown_producer_device_is_a_transfer_error() {
    let mut pipeline = Pipeline::with_devices(PipelineConfig::gpu(1, 0, 1)).unwrap();
    pipeline
        .add_source(
            "x",
            Producer::batch_fn(|| {
                Ok(ExternalArray::from_slice(DeviceId::Gpu(7), [1, 1], &[1u8])?)
            }),
            SourceConfig::gpu(),
        )
        .unwrap();
    pipeline.build().unwrap();
    match pipeline.run() {
        Err(StageError::Transfer { from, to, .. }) => {
            assert_eq!(from, DeviceId::Gpu(7));
            assert_eq!(to, DeviceId::Gpu(0));
        }
        other => panic!("expected transfer error, got {:?}", other.err()),
    }
}

#[test]
fn exhausted_pool_is_a_transfer_error() {
    let mut config = PipelineConfig::gpu(1, 0, 1);
    config.devices.context.pool_size = 1024;
    config.devices.context.max_pool_bytes = Some(1024);
    let mut pipeline = Pipeline::with_devices(config).unwrap();
    pipeline
        .add_source(
            "x",
            Producer::batch_fn(|| {
                let big = vec![0f64; 4096];
                Ok(ExternalArray::from_slice(DeviceId::Cpu, [1, 4096], &big)?)
            }),
            SourceConfig::gpu(),
        )
        .unwrap();
    pipeline.build().unwrap();
    assert!(matches!(
        pipeline.run(),
        Err(StageError::Transfer { from: DeviceId::Cpu, to: DeviceId::Gpu(0), .. })
    ));
}

#[test]
fn distinct_pipelines_share_devices_across_threads() {
    let devices = DeviceSet::new(DeviceSetConfig::small(2)).unwrap();
    let groups = DevicePairs::gpus(2).schedule(2);

    std::thread::scope(|scope| {
        for group in &groups {
            let devices = devices.clone();
            scope.spawn(move || {
                for &(src, dst) in group {
                    let (config, source) = config_for(dst, 2);
                    let mut pipeline = Pipeline::new(config, devices.clone()).unwrap();
                    pipeline
                        .add_source("d", async_sample_producer(devices.clone(), src), source)
                        .unwrap();
                    pipeline.build().unwrap();
                    for i in 0..3 {
                        let outputs = pipeline.run().unwrap().unwrap();
                        let host = outputs.by_name("d").unwrap().to_host().unwrap();
                        assert_eq!(host.get(1).unwrap().as_vec::<i32>().unwrap()[0], 5 + i);
                    }
                }
            });
        }
    });

    let gpu0 = devices.context(DeviceId::Gpu(0)).unwrap();
    assert_eq!(gpu0.stream_pool.available(), gpu0.stream_pool.pool_size());
}
