use std::collections::HashSet;

use stagefeed_core::{ContiguityMode, Result, StageError};

use crate::descriptor::BufferDescriptor;

/// How an iteration's samples were delivered by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    /// One batch array split along dimension 0.
    Array,
    /// A list of arrays returned by one batch call.
    List,
    /// One array per per-sample call.
    Samples,
}

/// Classify one iteration's descriptors as contiguous or noncontiguous.
///
/// Classification is by allocation identity, never by shape: samples that
/// share one allocation must be densely packed in order, and samples that
/// do not share must each have their own allocation. A single sample is
/// contiguous only when it came from a batch array.
pub fn classify(
    source_name: &str,
    descriptors: &[BufferDescriptor],
    origin: BatchOrigin,
) -> Result<ContiguityMode> {
    let Some(first) = descriptors.first() else {
        return Err(StageError::mixed_layout(source_name, "iteration produced no samples"));
    };

    let placement = first.placement();
    if let Some(other) = descriptors.iter().find(|d| d.placement() != placement) {
        return Err(StageError::mixed_layout(
            source_name,
            format!(
                "samples reside in more than one place: {placement} and {}",
                other.placement()
            ),
        ));
    }

    if descriptors.len() == 1 {
        return Ok(match origin {
            BatchOrigin::Array => ContiguityMode::Contiguous,
            BatchOrigin::List | BatchOrigin::Samples => ContiguityMode::Noncontiguous,
        });
    }

    let distinct: HashSet<_> = descriptors
        .iter()
        .map(|d| d.owner_handle.allocation_id())
        .collect();

    if distinct.len() == descriptors.len() {
        return Ok(ContiguityMode::Noncontiguous);
    }

    if distinct.len() > 1 {
        return Err(StageError::mixed_layout(
            source_name,
            format!(
                "source must not mix contiguous and noncontiguous inputs: \
                 {} samples span {} allocations, some shared and some not",
                descriptors.len(),
                distinct.len()
            ),
        ));
    }

    let packed = descriptors.windows(2).all(|pair| {
        let prev = &pair[0].owner_handle;
        prev.offset() + prev.len() == pair[1].owner_handle.offset()
    });
    if !packed {
        return Err(StageError::mixed_layout(
            source_name,
            format!(
                "samples share allocation {} but are not densely packed in order",
                first.owner_handle.allocation_id()
            ),
        ));
    }

    Ok(ContiguityMode::Contiguous)
}

/// Record the classification on every descriptor.
pub fn mark(descriptors: &mut [BufferDescriptor], mode: ContiguityMode) {
    let contiguous = mode == ContiguityMode::Contiguous;
    for d in descriptors {
        d.contiguous = contiguous;
    }
}

/// Remembers the contiguity mode a source established on its first iteration.
#[derive(Debug, Default)]
pub struct ModeTracker {
    observed: Option<ContiguityMode>,
}

impl ModeTracker {
    pub fn observed(&self) -> Option<ContiguityMode> {
        self.observed
    }

    /// Record `mode` on the first call; afterwards reject any other mode.
    pub fn check(&mut self, source_name: &str, mode: ContiguityMode) -> Result<()> {
        match self.observed {
            None => {
                tracing::debug!(source = source_name, mode = %mode, "contiguity mode established");
                self.observed = Some(mode);
                Ok(())
            }
            Some(expected) if expected == mode => Ok(()),
            Some(expected) => Err(StageError::mode_changed(source_name, expected, mode)),
        }
    }

    pub fn reset(&mut self) {
        self.observed = None;
    }
}
