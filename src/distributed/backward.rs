//! Backward-readiness controller
//!
//! After a step has produced its merged result, either arm the reducer for
//! the coming backward pass or, when no backward will happen, drop the
//! forward sync request so the next step does not push stale buffers.

use numr::runtime::Runtime;

use crate::distributed::capability::CapabilityLevel;
use crate::distributed::payload::StepResult;
use crate::distributed::reducer::Reducer;
use crate::error::Result;

/// Synchronization flags owned by the orchestrator.
///
/// Both start `true`. They are only touched between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags {
    /// Push authority buffers before the next step (flag-driven levels).
    pub require_forward_param_sync: bool,
    /// Gradients produced by the next step are reduced across replicas.
    pub require_backward_grad_sync: bool,
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self {
            require_forward_param_sync: true,
            require_backward_grad_sync: true,
        }
    }
}

/// What [`prepare_backward`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardPrep {
    /// Reducer armed with this many output tensors (0 = all parameters participate).
    Primed { outputs: usize },
    /// No backward expected; reducer left alone.
    Skipped,
}

/// Prime the reducer for backward, or clear the forward sync flag.
///
/// With gradient tracking on and backward sync requested, the reducer is
/// handed either every tensor reachable from `result`
/// (`find_unused_parameters`) or an empty list; the flags are left alone.
/// Otherwise the reducer is not touched and, at levels that define the flag,
/// `require_forward_param_sync` is cleared. Nothing here sets it again.
pub fn prepare_backward<R: Runtime>(
    result: &StepResult<R>,
    flags: &mut SyncFlags,
    level: CapabilityLevel,
    grad_enabled: bool,
    find_unused_parameters: bool,
    reducer: &mut dyn Reducer,
) -> Result<BackwardPrep> {
    if grad_enabled && flags.require_backward_grad_sync {
        let outputs = if find_unused_parameters {
            result.find_tensors()
        } else {
            Vec::new()
        };
        reducer.prepare_for_backward(&outputs)?;
        tracing::debug!(outputs = outputs.len(), "reducer prepared for backward");
        return Ok(BackwardPrep::Primed {
            outputs: outputs.len(),
        });
    }

    if level.protocol().clears_forward_sync {
        flags.require_forward_param_sync = false;
    }
    Ok(BackwardPrep::Skipped)
}
