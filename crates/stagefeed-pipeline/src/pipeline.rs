use std::ops::Index;
use std::sync::Arc;

use stagefeed_core::{DeviceId, Placement, Result, SourceDevice, StageError};
use stagefeed_gpu::DeviceSet;
use stagefeed_source::{Batch, BindingState, Producer, SourceBinding, SourceConfig, Stager};

use crate::config::PipelineConfig;

/// Index of a source in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

/// A pipeline of external sources.
///
/// Each call to [`run`](Pipeline::run) performs one iteration: every source
/// is invoked in registration order, its data validated and staged onto the
/// source's target device.
pub struct Pipeline {
    config: PipelineConfig,
    devices: Arc<DeviceSet>,
    stager: Stager,
    bindings: Vec<SourceBinding>,
    built: bool,
    exhausted: bool,
    iterations_run: u64,
    last_epoch: Option<u64>,
}

impl Pipeline {
    /// Create a pipeline on an existing device set.
    pub fn new(config: PipelineConfig, devices: Arc<DeviceSet>) -> Result<Self> {
        config.validate(devices.gpu_count())?;
        tracing::info!(
            batch_size = config.batch_size,
            device = ?config.device_ordinal,
            gpus = devices.gpu_count(),
            "creating pipeline"
        );
        Ok(Self {
            stager: Stager::new(devices.clone()),
            config,
            devices,
            bindings: Vec::new(),
            built: false,
            exhausted: false,
            iterations_run: 0,
            last_epoch: None,
        })
    }

    /// Create a pipeline together with its own device set from `config.devices`.
    pub fn with_devices(config: PipelineConfig) -> Result<Self> {
        let devices = DeviceSet::new(config.devices.clone())?;
        Self::new(config, devices)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Register a source. The pipeline must be (re)built before it runs.
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        producer: Producer,
        config: SourceConfig,
    ) -> Result<SourceId> {
        let name = name.into();
        if self.bindings.iter().any(|b| b.name() == name) {
            return Err(StageError::Config(format!("duplicate source name '{name}'")));
        }
        self.target_for(&config)?;

        tracing::debug!(source = %name, mode = ?producer.batch_mode(), "source registered");
        self.bindings.push(SourceBinding::new(
            name,
            producer,
            config,
            self.config.batch_size,
        ));
        self.built = false;
        Ok(SourceId(self.bindings.len() - 1))
    }

    pub fn num_sources(&self) -> usize {
        self.bindings.len()
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceBinding> {
        self.bindings.get(id.0)
    }

    pub fn source_id(&self, name: &str) -> Option<SourceId> {
        self.bindings
            .iter()
            .position(|b| b.name() == name)
            .map(SourceId)
    }

    /// Bind every source and clear all state from earlier runs.
    ///
    /// Safe to call repeatedly, including after a failure.
    pub fn build(&mut self) -> Result<()> {
        if self.bindings.is_empty() {
            return Err(StageError::Pipeline("pipeline has no sources".to_string()));
        }
        self.built = false;
        for i in 0..self.bindings.len() {
            let target = self.target_for(self.bindings[i].config())?;
            self.bindings[i].bind(&self.devices, target)?;
        }
        self.built = true;
        self.exhausted = false;
        self.iterations_run = 0;
        tracing::info!(sources = self.bindings.len(), "pipeline built");
        Ok(())
    }

    /// Run one iteration.
    ///
    /// Returns `Ok(None)` once any source has signalled end of data, and
    /// keeps doing so until [`reset`](Pipeline::reset) or a rebuild. An
    /// error fails the whole iteration: no outputs are returned for it.
    pub fn run(&mut self) -> Result<Option<Outputs<'_>>> {
        if !self.built {
            return Err(StageError::Pipeline(
                "pipeline must be built before it runs".to_string(),
            ));
        }
        if self.exhausted {
            return Ok(None);
        }
        // A failed source fails every iteration; no producer runs until a rebuild.
        for binding in &self.bindings {
            if let BindingState::Failed(cause) = binding.state() {
                return Err(StageError::BindingFailed {
                    source_name: binding.name().to_string(),
                    cause: cause.clone(),
                });
            }
        }

        let mut batches = Vec::with_capacity(self.bindings.len());
        for binding in &mut self.bindings {
            match binding.run_iteration(&self.stager)? {
                Some(batch) => batches.push(batch),
                None => {
                    tracing::info!(
                        source = binding.name(),
                        iterations = self.iterations_run,
                        "end of data"
                    );
                    self.exhausted = true;
                    self.last_epoch = Some(self.iterations_run);
                    return Ok(None);
                }
            }
        }

        let iteration = self.iterations_run;
        self.iterations_run += 1;
        tracing::debug!(iteration, sources = batches.len(), "iteration complete");

        Ok(Some(Outputs {
            pipeline: self,
            iteration,
            batches,
        }))
    }

    /// Start a new epoch: restart exhausted sources at iteration 0.
    ///
    /// Observed contiguity modes and schemas are kept. Failed sources stay
    /// failed until the pipeline is rebuilt.
    pub fn reset(&mut self) {
        for binding in &mut self.bindings {
            binding.reset();
        }
        self.exhausted = false;
        self.iterations_run = 0;
        tracing::debug!("pipeline reset");
    }

    /// Iterations completed since the last build or reset.
    pub fn iterations_run(&self) -> u64 {
        self.iterations_run
    }

    /// Configured epoch size, or the length of the last completed epoch.
    pub fn epoch_size(&self) -> Option<u64> {
        self.config.epoch_size.or(self.last_epoch)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether any source is in the failed state.
    pub fn has_failed(&self) -> bool {
        self.bindings
            .iter()
            .any(|b| matches!(b.state(), BindingState::Failed(_)))
    }

    fn target_for(&self, config: &SourceConfig) -> Result<Placement> {
        match config.device {
            SourceDevice::Cpu => Ok(Placement::native(DeviceId::Cpu)),
            SourceDevice::Gpu => match self.config.device_ordinal {
                Some(ordinal) => Ok(Placement::native(DeviceId::Gpu(ordinal))),
                None => Err(StageError::Config(
                    "GPU source in a pipeline without a device".to_string(),
                )),
            },
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for binding in &mut self.bindings {
            binding.unbind(&self.devices);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("sources", &self.bindings)
            .field("built", &self.built)
            .field("iterations_run", &self.iterations_run)
            .finish()
    }
}

/// The batches of one iteration, one per source in registration order.
///
/// Borrows the pipeline: batches cannot be kept past the next call to
/// [`Pipeline::run`]. Use [`Batch::to_host`] to keep data longer.
pub struct Outputs<'a> {
    pipeline: &'a Pipeline,
    iteration: u64,
    batches: Vec<Batch>,
}

impl<'a> Outputs<'a> {
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&Batch> {
        self.batches.get(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<&Batch> {
        self.pipeline.source_id(name).and_then(|id| self.get(id))
    }

    /// `(source name, batch)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Batch)> + '_ {
        self.pipeline
            .bindings
            .iter()
            .map(SourceBinding::name)
            .zip(self.batches.iter())
    }
}

impl Index<SourceId> for Outputs<'_> {
    type Output = Batch;

    fn index(&self, id: SourceId) -> &Batch {
        &self.batches[id.0]
    }
}
