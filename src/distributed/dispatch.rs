//! Step dispatcher
//!
//! Runs a named step (training, evaluation or plain forward) on the wrapped
//! module. With several local devices the payload is scattered, each shard
//! runs on its own replica in parallel, and the per-device results are
//! gathered onto the output device.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use numr::dtype::DType;
use numr::ops::{ShapeOps, TensorOps};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use rayon::prelude::*;

use crate::distributed::grad_mode::{GradModeGuard, is_grad_enabled};
use crate::distributed::payload::{StepPayload, StepResult};
use crate::distributed::placement::{DeviceId, DevicePlacement, ReplicaGroup};
use crate::distributed::scatter_gather::{LiteralMergePolicy, merge, shard};
use crate::error::{Error, Result};

/// Which entry point of the wrapped module a call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// `train_step`: forward plus loss, followed by backward.
    Train,
    /// `val_step`: evaluation, usually under no-grad.
    Val,
    /// Plain `forward`, placed on the first device only.
    Forward,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train_step",
            Self::Val => "val_step",
            Self::Forward => "forward",
        };
        f.write_str(name)
    }
}

/// A module (or one device replica of it) that the orchestrator can step.
///
/// Each replica lives on one local device. Buffers are non-gradient state
/// (running statistics and the like) kept identical across replicas by the
/// buffer sync controller.
pub trait StepModule<R: Runtime>: Send {
    /// Does this module implement the entry point for `kind`?
    fn supports(&self, kind: StepKind) -> bool;

    fn train_step(&mut self, _payload: StepPayload<R>) -> Result<StepResult<R>> {
        Err(Error::StepNotSupported {
            kind: StepKind::Train,
        })
    }

    fn val_step(&mut self, _payload: StepPayload<R>) -> Result<StepResult<R>> {
        Err(Error::StepNotSupported {
            kind: StepKind::Val,
        })
    }

    fn forward(&mut self, _payload: StepPayload<R>) -> Result<StepResult<R>> {
        Err(Error::StepNotSupported {
            kind: StepKind::Forward,
        })
    }

    /// Named buffers, in a stable order.
    fn named_buffers(&self) -> Vec<(String, Tensor<R>)> {
        Vec::new()
    }

    /// Overwrite buffers with values pushed from the authority replica.
    fn load_buffers(&mut self, _buffers: Vec<(String, Tensor<R>)>) -> Result<()> {
        Ok(())
    }

    /// Run the entry point selected by `kind`.
    fn invoke(&mut self, kind: StepKind, payload: StepPayload<R>) -> Result<StepResult<R>> {
        match kind {
            StepKind::Train => self.train_step(payload),
            StepKind::Val => self.val_step(payload),
            StepKind::Forward => self.forward(payload),
        }
    }
}

/// How per-device payloads are split and results gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatherOptions {
    /// Dimension batched tensors are split and concatenated along.
    pub dim: usize,
    pub literal_policy: LiteralMergePolicy,
}

/// Check that every replica that will run `kind` on `group` implements it.
///
/// `Forward` only ever runs on replica 0.
pub(crate) fn ensure_supported<R: Runtime, M: StepModule<R>>(
    kind: StepKind,
    group: &ReplicaGroup,
    replicas: &[M],
) -> Result<()> {
    let width = match kind {
        StepKind::Forward => 1,
        StepKind::Train | StepKind::Val => group.len().max(1),
    };
    let participants = replicas.get(..width).unwrap_or(replicas);
    if participants.iter().all(|replica| replica.supports(kind)) {
        Ok(())
    } else {
        Err(Error::StepNotSupported { kind })
    }
}

/// Run `kind` over `payload` on the replica group.
///
/// - empty group: invoke replica 0 directly on the untouched payload;
/// - one device: relocate the payload and invoke replica 0, no gather;
/// - several devices: scatter, run replicas in parallel, gather onto the
///   group's output device.
///
/// # Errors
///
/// `StepNotSupported` before any work if a participating replica lacks the
/// entry point, `Sharding` if the payload does not split evenly, and
/// `ReplicaFailure` once all replicas have finished if any of them failed.
pub fn run<R, M, P>(
    kind: StepKind,
    payload: StepPayload<R>,
    group: &ReplicaGroup,
    replicas: &mut [M],
    options: GatherOptions,
    placement: &P,
) -> Result<StepResult<R>>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
    M: StepModule<R>,
    P: DevicePlacement<R> + ?Sized,
    StepPayload<R>: Send,
    StepResult<R>: Send,
{
    let width = group.len().max(1);
    if replicas.len() < width {
        return Err(Error::InvalidConfig {
            arg: "replicas",
            reason: format!("{} replicas for {width} devices", replicas.len()),
        });
    }
    let replicas = &mut replicas[..width];
    ensure_supported::<R, M>(kind, group, replicas)?;

    if group.is_empty() {
        tracing::debug!(%kind, "running step without device placement");
        return replicas[0].invoke(kind, payload);
    }

    let mut shards = shard(payload, group.devices(), options.dim, placement)?;

    if shards.len() == 1 {
        let only = shards.pop().ok_or_else(|| Error::Sharding {
            reason: "sharding produced no payload".to_string(),
        })?;
        return replicas[0].invoke(kind, only);
    }

    let output_device = group.output_device().unwrap_or(group.devices()[0]);
    tracing::debug!(%kind, devices = shards.len(), "running step on replicas");
    let results = parallel_apply(kind, replicas, shards, group.devices())?;
    merge(results, output_device, options.dim, options.literal_policy, placement)
}

/// Run `kind` on the first device only, without scattering.
///
/// The payload is relocated to the group's first device and handed to
/// replica 0. With an empty group the payload is used as is.
pub fn run_on_first_device<R, M, P>(
    kind: StepKind,
    payload: StepPayload<R>,
    group: &ReplicaGroup,
    replicas: &mut [M],
    options: GatherOptions,
    placement: &P,
) -> Result<StepResult<R>>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
    M: StepModule<R>,
    P: DevicePlacement<R> + ?Sized,
{
    ensure_supported::<R, M>(kind, group, replicas)?;
    let Some(authority) = replicas.first_mut() else {
        return Err(Error::InvalidConfig {
            arg: "replicas",
            reason: "no replicas to run on".to_string(),
        });
    };

    match group.devices().first() {
        None => authority.invoke(kind, payload),
        Some(&device) => {
            let mut shards = shard(payload, &[device], options.dim, placement)?;
            let only = shards.pop().ok_or_else(|| Error::Sharding {
                reason: "sharding produced no payload".to_string(),
            })?;
            authority.invoke(kind, only)
        }
    }
}

/// Run one shard per replica in parallel and wait for all of them.
///
/// Every task is joined before any error is reported; the first failure in
/// device order wins and all other results are dropped. Tasks run with the
/// caller's gradient tracking mode.
fn parallel_apply<R, M>(
    kind: StepKind,
    replicas: &mut [M],
    shards: Vec<StepPayload<R>>,
    devices: &[DeviceId],
) -> Result<Vec<StepResult<R>>>
where
    R: Runtime<DType = DType>,
    M: StepModule<R>,
    StepPayload<R>: Send,
    StepResult<R>: Send,
{
    let grad_enabled = is_grad_enabled();
    let outcomes: Vec<Result<StepResult<R>>> = replicas
        .par_iter_mut()
        .zip(shards.into_par_iter())
        .zip(devices.par_iter())
        .map(|((replica, payload), &device)| {
            let _mode = GradModeGuard::new(grad_enabled);
            panic::catch_unwind(AssertUnwindSafe(|| replica.invoke(kind, payload)))
                .unwrap_or_else(|panic| {
                    Err(Error::ReplicaFailure {
                        device,
                        reason: format!("panicked: {}", panic_message(panic.as_ref())),
                    })
                })
                .map_err(|e| match e {
                    Error::ReplicaFailure { .. } => e,
                    other => Error::ReplicaFailure {
                        device,
                        reason: other.to_string(),
                    },
                })
        })
        .collect();

    outcomes.into_iter().collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
