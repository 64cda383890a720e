//! Data-parallel step orchestrator
//!
//! Wraps a model replicated over local devices and drives one training,
//! evaluation or forward step at a time through the full protocol:
//! bucket rebuild, buffer sync, scatter, per-device compute, gather, and
//! backward readiness.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use numr::dtype::DType;
use numr::ops::{ShapeOps, TensorOps};
use numr::runtime::{Communicator, Runtime};

use crate::distributed::backward::{SyncFlags, prepare_backward};
use crate::distributed::buffer_sync::BufferSyncer;
use crate::distributed::capability::CapabilityLevel;
use crate::distributed::config::DdpConfig;
use crate::distributed::dispatch::{
    StepKind, StepModule, ensure_supported, run, run_on_first_device,
};
use crate::distributed::grad_mode::is_grad_enabled;
use crate::distributed::payload::{StepPayload, StepResult};
use crate::distributed::placement::{DevicePlacement, ReplicaGroup};
use crate::distributed::reducer::Reducer;
use crate::error::{Error, Result};

/// Data-parallel wrapper around a module with `train_step` / `val_step`.
///
/// Holds one replica per local device (replica 0 is the authority whose
/// buffers win), the gradient reducer, the cross-process communicator and
/// the placement engine used to move payloads between devices.
///
/// # Usage
///
/// ```ignore
/// let config = DdpConfig::default().with_device_ids([0, 1]);
/// let mut ddp = DistributedDataParallel::new(replicas, reducer, comm, placement, config)?;
///
/// let out = ddp.train_step(StepPayload::new().with_kwarg("img", batch))?;
/// let loss = out.get("loss");
///
/// // Accumulate gradients locally without cross-replica reduction.
/// ddp.no_sync(|ddp| ddp.train_step(next_payload))?;
/// ```
pub struct DistributedDataParallel<R, M, P> {
    replicas: Vec<M>,
    reducer: Box<dyn Reducer>,
    comm: Arc<dyn Communicator>,
    placement: P,
    group: ReplicaGroup,
    level: CapabilityLevel,
    flags: SyncFlags,
    config: DdpConfig,
    _runtime: PhantomData<fn() -> R>,
}

impl<R, M, P> DistributedDataParallel<R, M, P>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
    M: StepModule<R>,
    P: DevicePlacement<R>,
    StepPayload<R>: Send,
    StepResult<R>: Send,
{
    /// Wrap `replicas`, one per configured device (one if no devices are configured).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the config is invalid or there are fewer
    /// replicas than devices.
    pub fn new(
        replicas: Vec<M>,
        reducer: Box<dyn Reducer>,
        comm: Arc<dyn Communicator>,
        placement: P,
        config: DdpConfig,
    ) -> Result<Self> {
        config.validate()?;
        let group = config.replica_group()?;
        let needed = group.len().max(1);
        if replicas.len() < needed {
            return Err(Error::InvalidConfig {
                arg: "replicas",
                reason: format!("{} replicas for {needed} devices", replicas.len()),
            });
        }
        let level = config.capability_level();
        tracing::debug!(
            devices = group.len(),
            ?level,
            world_size = comm.world_size(),
            "data-parallel wrapper ready"
        );

        Ok(Self {
            replicas,
            reducer,
            comm,
            placement,
            group,
            level,
            flags: SyncFlags::default(),
            config,
            _runtime: PhantomData,
        })
    }

    /// Run the wrapped module's `train_step` on the payload.
    pub fn train_step(&mut self, payload: StepPayload<R>) -> Result<StepResult<R>> {
        self.step(StepKind::Train, payload)
    }

    /// Run the wrapped module's `val_step` on the payload.
    pub fn val_step(&mut self, payload: StepPayload<R>) -> Result<StepResult<R>> {
        self.step(StepKind::Val, payload)
    }

    /// Run the wrapped module's `forward` on the first device only.
    pub fn forward(&mut self, payload: StepPayload<R>) -> Result<StepResult<R>> {
        self.step(StepKind::Forward, payload)
    }

    fn step(&mut self, kind: StepKind, payload: StepPayload<R>) -> Result<StepResult<R>> {
        ensure_supported::<R, M>(kind, &self.group, &self.replicas)?;

        let protocol = self.level.protocol();
        if protocol.rebuild_buckets && self.reducer.rebuild_buckets() {
            tracing::info!("Reducer buckets have been rebuilt in this iteration.");
        }

        let syncer = BufferSyncer::new(
            self.comm.as_ref(),
            &self.group,
            &self.placement,
            self.config.broadcast_buffers,
        );
        syncer.pre_sync::<R, M>(
            self.level,
            &self.flags,
            self.reducer.as_ref(),
            &mut self.replicas,
        )?;

        let options = self.config.gather_options();
        let output = match kind {
            StepKind::Forward => run_on_first_device(
                kind,
                payload,
                &self.group,
                &mut self.replicas,
                options,
                &self.placement,
            )?,
            StepKind::Train | StepKind::Val => run(
                kind,
                payload,
                &self.group,
                &mut self.replicas,
                options,
                &self.placement,
            )?,
        };

        syncer.post_sync::<R, M>(self.level, self.reducer.as_ref(), &mut self.replicas)?;

        prepare_backward(
            &output,
            &mut self.flags,
            self.level,
            is_grad_enabled(),
            self.config.find_unused_parameters,
            self.reducer.as_mut(),
        )?;
        Ok(output)
    }

    /// Run `f` with backward gradient sync disabled, then restore the previous setting.
    ///
    /// Steps inside `f` do not prime the reducer, so their gradients
    /// accumulate locally until a step outside `no_sync` runs. The setting
    /// is restored even if `f` panics.
    pub fn no_sync<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.flags.require_backward_grad_sync;
        self.flags.require_backward_grad_sync = false;
        let out = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        self.flags.require_backward_grad_sync = previous;
        match out {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// The authority replica.
    pub fn module(&self) -> &M {
        &self.replicas[0]
    }

    /// Mutable access to the authority replica.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.replicas[0]
    }

    /// All replicas, in device order.
    pub fn replicas(&self) -> &[M] {
        &self.replicas
    }

    /// Protocol variant resolved from the engine capabilities.
    pub fn capability(&self) -> CapabilityLevel {
        self.level
    }

    /// Current synchronization flags.
    pub fn sync_flags(&self) -> SyncFlags {
        self.flags
    }

    /// Reference to the gradient reducer.
    pub fn reducer(&self) -> &dyn Reducer {
        self.reducer.as_ref()
    }

    /// Local devices the replicas live on.
    pub fn replica_group(&self) -> &ReplicaGroup {
        &self.group
    }

    /// Configuration the wrapper was built with.
    pub fn config(&self) -> &DdpConfig {
        &self.config
    }

    /// Reference to the underlying communicator.
    pub fn communicator(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    /// Unwrap into the authority replica, dropping the others.
    pub fn into_inner(self) -> M {
        let mut replicas = self.replicas;
        replicas.swap_remove(0)
    }
}
