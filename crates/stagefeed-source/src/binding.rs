use std::fmt;

use stagefeed_core::{
    BatchMode, ContiguityMode, DeviceId, ElementType, ExecutionStream, Placement, Result,
    StageError,
};
use stagefeed_gpu::{DeviceSet, DeviceStream, Event, StreamHandle};

use crate::assembler::{assemble, Batch};
use crate::config::SourceConfig;
use crate::driver::{Invocation, InvocationDriver};
use crate::layout::{self, ModeTracker};
use crate::producer::Producer;
use crate::stager::{Stager, StagingOptions};

/// Lifecycle of a source binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound,
    Active,
    Exhausted,
    /// A fatal error occurred; only a rebuild recovers.
    Failed(String),
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::Unbound => write!(f, "unbound"),
            BindingState::Bound => write!(f, "bound"),
            BindingState::Active => write!(f, "active"),
            BindingState::Exhausted => write!(f, "exhausted"),
            BindingState::Failed(cause) => write!(f, "failed ({cause})"),
        }
    }
}

enum BoundStream {
    Dedicated(StreamHandle),
    /// The device's default stream, shared with other bindings.
    Shared(DeviceStream),
}

impl BoundStream {
    fn stream(&self) -> &DeviceStream {
        match self {
            BoundStream::Dedicated(handle) => handle.stream(),
            BoundStream::Shared(stream) => stream,
        }
    }
}

/// Copy that still reads producer memory of the previous iteration.
struct PendingRelease {
    event: Event,
    from: DeviceId,
    to: DeviceId,
}

/// Per-source state: the producer plus everything established about it
/// since the last build.
pub struct SourceBinding {
    name: String,
    producer: Producer,
    config: SourceConfig,
    state: BindingState,
    counter: u64,
    driver: InvocationDriver,
    modes: ModeTracker,
    target: Option<Placement>,
    stream: Option<BoundStream>,
    release: Option<PendingRelease>,
}

impl SourceBinding {
    pub fn new(
        name: impl Into<String>,
        producer: Producer,
        config: SourceConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            producer,
            config,
            state: BindingState::Unbound,
            counter: 0,
            driver: InvocationDriver::new(batch_size),
            modes: ModeTracker::default(),
            target: None,
            stream: None,
            release: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn state(&self) -> &BindingState {
        &self.state
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.producer.batch_mode()
    }

    /// Successful invocations since the last build or reset.
    pub fn iteration(&self) -> u64 {
        self.counter
    }

    pub fn observed_mode(&self) -> Option<ContiguityMode> {
        self.modes.observed()
    }

    pub fn schema(&self) -> Option<(ElementType, usize)> {
        self.driver.schema()
    }

    pub fn target(&self) -> Option<Placement> {
        self.target
    }

    pub fn stream(&self) -> Option<&DeviceStream> {
        self.stream.as_ref().map(BoundStream::stream)
    }

    /// Whether the binding got a stream of its own rather than the default one.
    pub fn has_dedicated_stream(&self) -> bool {
        matches!(self.stream, Some(BoundStream::Dedicated(_)))
    }

    /// Bind to `target`, clearing everything established by earlier runs.
    ///
    /// Rebinding an already bound (or failed) source is allowed and yields
    /// the same state as a fresh bind.
    pub fn bind(&mut self, devices: &DeviceSet, target: Placement) -> Result<()> {
        self.unbind(devices);

        if !target.is_valid() {
            return Err(StageError::Config(format!(
                "source '{}' cannot deliver to {target}",
                self.name
            )));
        }
        let ctx = devices.context(target.device)?;
        let stream = match ctx.stream_pool.try_acquire() {
            Some(handle) => BoundStream::Dedicated(handle),
            None => {
                tracing::warn!(
                    source = %self.name,
                    device = %target.device,
                    "no free stream, falling back to the default stream"
                );
                BoundStream::Shared(ctx.stream_pool.default_stream().clone())
            }
        };

        self.stream = Some(stream);
        self.target = Some(target);
        self.counter = 0;
        self.driver.reset();
        self.modes.reset();
        self.state = BindingState::Bound;

        tracing::info!(
            source = %self.name,
            target = %target,
            batch_mode = ?self.producer.batch_mode(),
            no_copy = self.config.no_copy,
            "source bound"
        );
        Ok(())
    }

    /// Release the binding's stream, waiting for in-flight copies first.
    pub fn unbind(&mut self, devices: &DeviceSet) {
        if let Some(pending) = self.release.take() {
            if let Err(e) = pending.event.wait() {
                tracing::warn!(source = %self.name, error = %e, "staging copy failed during unbind");
            }
        }
        if let Some(BoundStream::Dedicated(handle)) = self.stream.take() {
            match devices.context(handle.stream().device()) {
                Ok(ctx) => ctx.stream_pool.release(handle),
                Err(e) => tracing::warn!(source = %self.name, error = %e, "could not return stream"),
            }
        }
        self.target = None;
        self.state = BindingState::Unbound;
    }

    /// Restart an exhausted source at iteration 0.
    ///
    /// The observed contiguity mode and schema are kept. A failed binding
    /// stays failed.
    pub fn reset(&mut self) {
        match self.state {
            BindingState::Active | BindingState::Exhausted | BindingState::Bound => {
                self.counter = 0;
                self.state = BindingState::Bound;
            }
            BindingState::Unbound | BindingState::Failed(_) => {}
        }
    }

    /// Run one iteration: invoke the producer, validate, stage and assemble.
    ///
    /// `Ok(None)` means the producer signalled end of data. Any error moves
    /// the binding to [`BindingState::Failed`].
    pub fn run_iteration(&mut self, stager: &Stager) -> Result<Option<Batch>> {
        match &self.state {
            BindingState::Unbound => {
                return Err(StageError::Pipeline(format!(
                    "source '{}' is not bound",
                    self.name
                )))
            }
            BindingState::Failed(cause) => {
                return Err(StageError::BindingFailed {
                    source_name: self.name.clone(),
                    cause: cause.clone(),
                })
            }
            BindingState::Exhausted => return Ok(None),
            BindingState::Bound | BindingState::Active => {}
        }

        match self.step(stager) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                tracing::error!(source = %self.name, iteration = self.counter, error = %e, "source failed");
                self.state = BindingState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn step(&mut self, stager: &Stager) -> Result<Option<Batch>> {
        let (Some(target), Some(stream)) = (self.target, self.stream.as_ref()) else {
            return Err(StageError::Pipeline(format!("source '{}' has no stream", self.name)));
        };

        // The producer may reuse its memory once the previous copy is done.
        if let Some(pending) = self.release.take() {
            pending
                .event
                .wait()
                .map_err(|e| e.into_transfer(pending.from, pending.to))?;
        }

        let mut raw = match self.driver.invoke(&self.name, &mut self.producer, self.counter)? {
            Invocation::Data(raw) => raw,
            Invocation::Stop => {
                tracing::info!(source = %self.name, iterations = self.counter, "source exhausted");
                self.state = BindingState::Exhausted;
                return Ok(None);
            }
        };
        self.counter += 1;

        let mode = layout::classify(&self.name, &raw.descriptors, raw.origin)?;
        self.modes.check(&self.name, mode)?;
        layout::mark(&mut raw.descriptors, mode);

        let options = StagingOptions {
            no_copy: self.config.no_copy,
            gather: self.config.gather,
        };
        let staged = stager.stage(&raw, mode, target, options, stream.stream())?;
        if let Some(event) = &staged.source_release {
            self.release = Some(PendingRelease {
                event: event.clone(),
                from: staged.source.device,
                to: target.device,
            });
        }

        let batch = assemble(staged)?;
        self.state = BindingState::Active;
        Ok(Some(batch))
    }
}

impl fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBinding")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("iteration", &self.counter)
            .field("producer", &self.producer)
            .field("observed_mode", &self.modes.observed())
            .finish()
    }
}
