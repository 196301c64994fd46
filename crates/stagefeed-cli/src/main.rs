use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stagefeed_core::DeviceId;
use stagefeed_gpu::DeviceSet;
use stagefeed_pipeline::{DevicePairs, Pipeline, PipelineConfig, SourceId};
use stagefeed_source::SourceConfig;

mod cli;

use cli::{Cli, Command, Layout};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("stagefeed v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if let Some(config_path) = &cli.config {
        let data = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&data)?
    } else {
        PipelineConfig::default()
    };

    if let Some(gpus) = cli.gpus {
        config.devices.gpu_count = gpus;
    }
    if let Some(device) = cli.device {
        config.device_ordinal = Some(device);
    }
    if config.devices.gpu_count == 0 {
        config.device_ordinal = None;
    }

    match cli.command {
        Command::Run {
            iterations,
            batch_size,
            sample_len,
            from,
            to_gpu,
            layout,
            no_copy,
            no_gather,
            format,
        } => {
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            let batch_size = config.batch_size;
            let mut pipeline = Pipeline::with_devices(config)?;
            pipeline.add_source(
                "synthetic",
                cli::synthetic_producer(from, layout, batch_size, sample_len, iterations),
                cli::source_config(to_gpu, no_copy, no_gather),
            )?;
            pipeline.build()?;

            let start = Instant::now();
            let done = cli::drive(&mut pipeline, &format)?;
            tracing::info!(
                iterations = done,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "run complete"
            );
        }
        Command::CrossDevice {
            iterations,
            workers,
        } => {
            let devices = DeviceSet::new(config.devices.clone())?;
            cross_device(&devices, &config, iterations, workers)?;
        }
        Command::Mixed { iterations } => {
            let mut pipeline = Pipeline::with_devices(config)?;
            let from = pipeline
                .config()
                .device_ordinal
                .map_or(DeviceId::Cpu, DeviceId::Gpu);
            let source = if from.is_gpu() {
                SourceConfig::gpu().with_no_copy(true)
            } else {
                SourceConfig::cpu().with_no_copy(true)
            };
            let batch_size = pipeline.batch_size().max(2);
            pipeline.add_source("mixed", cli::alternating_producer(from, batch_size), source)?;
            pipeline.build()?;

            for i in 0..iterations {
                match pipeline.run() {
                    Ok(Some(outputs)) => {
                        let batch = &outputs[SourceId(0)];
                        println!(
                            "iteration {i}: {} samples, contiguous={}",
                            batch.len(),
                            batch.is_contiguous()
                        );
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(iteration = i, error = %e, "iteration failed");
                        println!("iteration {i}: {e}");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Stage between every device pair, spreading pairs over worker threads.
fn cross_device(
    devices: &Arc<DeviceSet>,
    config: &PipelineConfig,
    iterations: u64,
    workers: usize,
) -> anyhow::Result<()> {
    let groups = DevicePairs::all(devices).schedule(workers);
    let batch_size = config.batch_size;

    let failures: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .iter()
            .map(|group| {
                scope.spawn(move || {
                    let mut failures = Vec::new();
                    for &(src, dst) in group {
                        if let Err(e) = run_pair(devices, batch_size, src, dst, iterations) {
                            tracing::error!(from = %src, to = %dst, error = %e, "pair failed");
                            failures.push(format!("{src} -> {dst}: {e}"));
                        } else {
                            println!("{src} -> {dst}: ok");
                        }
                    }
                    failures
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|_| vec!["worker panicked".to_string()]))
            .collect()
    });

    if !failures.is_empty() {
        anyhow::bail!("{} device pairs failed:\n{}", failures.len(), failures.join("\n"));
    }
    Ok(())
}

fn run_pair(
    devices: &Arc<DeviceSet>,
    batch_size: usize,
    src: DeviceId,
    dst: DeviceId,
    iterations: u64,
) -> anyhow::Result<()> {
    let (config, source) = match dst {
        DeviceId::Cpu => (PipelineConfig::cpu_only(batch_size), SourceConfig::cpu()),
        DeviceId::Gpu(n) => (
            PipelineConfig {
                batch_size,
                device_ordinal: Some(n),
                ..PipelineConfig::default()
            },
            SourceConfig::gpu(),
        ),
    };
    let mut pipeline = Pipeline::new(config, devices.clone())?;
    pipeline.add_source(
        "pair",
        cli::synthetic_producer(src, Layout::PerSample, batch_size, 4, iterations),
        source,
    )?;
    pipeline.build()?;

    let mut seen = 0;
    while let Some(outputs) = pipeline.run()? {
        let host = outputs[SourceId(0)].to_host()?;
        for (j, sample) in host.iter().enumerate() {
            let expected: Vec<f32> = (0..4)
                .map(|k| cli::synthetic_value(outputs.iteration(), j, k))
                .collect();
            anyhow::ensure!(
                sample.as_vec::<f32>()? == expected,
                "iteration {} sample {j} differs",
                outputs.iteration()
            );
        }
        seen += 1;
    }
    anyhow::ensure!(seen == iterations, "expected {iterations} iterations, saw {seen}");
    tracing::debug!(from = %src, to = %dst, iterations = seen, "pair verified");
    Ok(())
}
