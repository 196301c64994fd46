use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use stagefeed_core::{DeviceId, Placement, Result};
use stagefeed_pipeline::Pipeline;
use stagefeed_source::{BatchOutput, ExternalArray, Producer, SourceConfig, SourceSignal};

#[derive(Parser)]
#[command(name = "stagefeed", about = "External-source staging across devices")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// GPU that GPU sources deliver to.
    #[arg(long, global = true)]
    pub device: Option<usize>,

    /// Number of GPUs to create.
    #[arg(long, global = true)]
    pub gpus: Option<usize>,

    /// Path to pipeline config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Feed synthetic batches through one source and report each iteration.
    Run {
        /// Iterations before the producer signals end of data.
        #[arg(long, default_value = "10")]
        iterations: u64,
        /// Samples per iteration (overrides the config).
        #[arg(long)]
        batch_size: Option<usize>,
        /// Elements per sample.
        #[arg(long, default_value = "4")]
        sample_len: usize,
        /// Device the producer allocates on: cpu, gpu or gpu:N.
        #[arg(long, default_value = "cpu")]
        from: DeviceId,
        /// Deliver to the GPU instead of host memory.
        #[arg(long)]
        to_gpu: bool,
        /// How the producer lays out each iteration.
        #[arg(long, default_value = "contiguous")]
        layout: Layout,
        /// Reference producer memory directly when possible.
        #[arg(long)]
        no_copy: bool,
        /// Give every noncontiguous sample its own staging buffer.
        #[arg(long)]
        no_gather: bool,
        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Stage between every pair of devices and check the results.
    CrossDevice {
        /// Iterations per device pair.
        #[arg(long, default_value = "10")]
        iterations: u64,
        /// Number of worker threads.
        #[arg(long, default_value = "2")]
        workers: usize,
    },
    /// Alternate contiguous and noncontiguous batches until the source fails.
    Mixed {
        /// Iterations to attempt.
        #[arg(long, default_value = "4")]
        iterations: u64,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum Layout {
    /// One batch array per iteration.
    Contiguous,
    /// One array per sample, returned as a list.
    Noncontiguous,
    /// One array per sample, one producer call each.
    PerSample,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Summary of one delivered batch.
#[derive(Debug, Serialize)]
pub struct IterationReport {
    pub iteration: u64,
    pub source: String,
    pub device: String,
    pub samples: usize,
    pub contiguous: bool,
    pub copy_performed: bool,
    pub first_sample: Vec<f32>,
}

/// Value of element `k` of sample `j` in iteration `i`.
pub fn synthetic_value(i: u64, j: usize, k: usize) -> f32 {
    (i * 100 + j as u64 * 10 + k as u64) as f32 + 0.5
}

fn synthetic_sample(placement: Placement, i: u64, j: usize, len: usize) -> Result<ExternalArray> {
    let data: Vec<f32> = (0..len).map(|k| synthetic_value(i, j, k)).collect();
    ExternalArray::from_slice_in(placement, [len], &data)
}

/// Producer emitting `iterations` batches of synthetic data on `from`.
pub fn synthetic_producer(
    from: DeviceId,
    layout: Layout,
    batch_size: usize,
    sample_len: usize,
    iterations: u64,
) -> Producer {
    let placement = Placement::native(from);
    match layout {
        Layout::Contiguous => Producer::batch(move |i| {
            if i >= iterations {
                return Err(SourceSignal::Stop);
            }
            let data: Vec<f32> = (0..batch_size)
                .flat_map(|j| (0..sample_len).map(move |k| synthetic_value(i, j, k)))
                .collect();
            Ok(ExternalArray::from_slice_in(placement, [batch_size, sample_len], &data)?)
        }),
        Layout::Noncontiguous => Producer::batch(move |i| {
            if i >= iterations {
                return Err(SourceSignal::Stop);
            }
            let samples = (0..batch_size)
                .map(|j| synthetic_sample(placement, i, j, sample_len))
                .collect::<Result<Vec<_>>>()?;
            Ok(samples)
        }),
        Layout::PerSample => Producer::sample(move |info| {
            if info.iteration >= iterations {
                return Err(SourceSignal::Stop);
            }
            Ok(synthetic_sample(placement, info.iteration, info.idx_in_batch, sample_len)?)
        }),
    }
}

/// Producer that alternates between a list of arrays and one batch array.
pub fn alternating_producer(from: DeviceId, batch_size: usize) -> Producer {
    let placement = Placement::native(from);
    Producer::batch(move |i| {
        let output: BatchOutput = if i % 2 == 0 {
            (0..batch_size)
                .map(|j| synthetic_sample(placement, i, j, 1))
                .collect::<Result<Vec<_>>>()?
                .into()
        } else {
            let data: Vec<f32> = (0..batch_size).map(|j| synthetic_value(i, j, 0)).collect();
            ExternalArray::from_slice_in(placement, [batch_size, 1], &data)?.into()
        };
        Ok(output)
    })
}

/// Run `pipeline` until end of data, reporting every batch.
pub fn drive(pipeline: &mut Pipeline, format: &OutputFormat) -> Result<u64> {
    let mut iterations = 0;
    while let Some(outputs) = pipeline.run()? {
        for (name, batch) in outputs.iter() {
            let report = IterationReport {
                iteration: outputs.iteration(),
                source: name.to_string(),
                device: batch.device().to_string(),
                samples: batch.len(),
                contiguous: batch.is_contiguous(),
                copy_performed: batch.copy_performed(),
                first_sample: batch.sample_to_vec::<f32>(0)?,
            };
            print_report(&report, format);
        }
        iterations += 1;
    }
    Ok(iterations)
}

fn print_report(report: &IterationReport, format: &OutputFormat) {
    match format {
        OutputFormat::Text => {
            println!(
                "[{}] {} on {}: {} samples, contiguous={}, copied={}, first={:?}",
                report.iteration,
                report.source,
                report.device,
                report.samples,
                report.contiguous,
                report.copy_performed,
                report.first_sample
            );
        }
        OutputFormat::Json => match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize report"),
        },
    }
}

/// Source options for delivering to `target`.
pub fn source_config(to_gpu: bool, no_copy: bool, no_gather: bool) -> SourceConfig {
    let config = if to_gpu {
        SourceConfig::gpu()
    } else {
        SourceConfig::cpu()
    };
    config.with_no_copy(no_copy).with_gather(!no_gather)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stagefeed_gpu::{DeviceSet, DeviceSetConfig};
    use stagefeed_pipeline::PipelineConfig;

    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "stagefeed", "--gpus", "2", "run", "--from", "gpu:1", "--to-gpu", "--layout",
            "per-sample", "--no-copy",
        ]);
        assert_eq!(cli.gpus, Some(2));
        match cli.command {
            Command::Run { from, to_gpu, layout, no_copy, .. } => {
                assert_eq!(from, DeviceId::Gpu(1));
                assert!(to_gpu);
                assert!(matches!(layout, Layout::PerSample));
                assert!(no_copy);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn every_layout_drives_to_completion() {
        let devices: Arc<DeviceSet> = DeviceSet::new(DeviceSetConfig::small(1)).unwrap();
        for layout in [Layout::Contiguous, Layout::Noncontiguous, Layout::PerSample] {
            let mut pipeline =
                Pipeline::new(PipelineConfig::gpu(3, 0, 1), devices.clone()).unwrap();
            pipeline
                .add_source(
                    "synthetic",
                    synthetic_producer(DeviceId::Cpu, layout, 3, 2, 5),
                    source_config(true, false, false),
                )
                .unwrap();
            pipeline.build().unwrap();
            assert_eq!(drive(&mut pipeline, &OutputFormat::Json).unwrap(), 5);
        }
    }

    #[test]
    fn alternating_producer_fails_on_second_iteration() {
        let mut pipeline = Pipeline::with_devices(PipelineConfig::cpu_only(2)).unwrap();
        pipeline
            .add_source("mixed", alternating_producer(DeviceId::Cpu, 2), SourceConfig::cpu())
            .unwrap();
        pipeline.build().unwrap();
        assert!(drive(&mut pipeline, &OutputFormat::Text).is_err());
    }
}
