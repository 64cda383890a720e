//! Gradient reducer interface
//!
//! The reducer owns bucket layout and overlapped all-reduce during backward.
//! The step orchestrator only tells it *when* to get ready; everything else
//! stays behind this trait.

use numr::tensor::TensorId;

use crate::error::Result;

/// Gradient synchronization engine driven by the step orchestrator.
pub trait Reducer: Send {
    /// Rebuild gradient buckets if the set of participating parameters
    /// changed since the last rebuild. Returns `true` when a rebuild happened.
    fn rebuild_buckets(&mut self) -> bool;

    /// Should buffers be pushed from the authority replica before compute?
    fn should_sync_buffers_pre_forward(&self) -> bool;

    /// Should buffers be pushed from the authority replica after compute?
    fn should_sync_buffers_post_forward(&self) -> bool;

    /// Arm the reducer for the upcoming backward pass.
    ///
    /// `outputs` are the tensors reachable from the step result. Parameters
    /// not reachable from them are treated as unused and excluded from
    /// bucketed reduction. An empty slice means every parameter participates.
    fn prepare_for_backward(&mut self, outputs: &[TensorId]) -> Result<()>;
}

/// Reducer for single-process runs with nothing to reduce.
///
/// Never rebuilds, asks for a buffer push before every step (so local
/// replicas stay in step with the authority) and ignores backward prep.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpReducer;

impl Reducer for NoOpReducer {
    fn rebuild_buckets(&mut self) -> bool {
        false
    }

    fn should_sync_buffers_pre_forward(&self) -> bool {
        true
    }

    fn should_sync_buffers_post_forward(&self) -> bool {
        false
    }

    fn prepare_for_backward(&mut self, _outputs: &[TensorId]) -> Result<()> {
        Ok(())
    }
}
