//! Buffer synchronization controller
//!
//! Non-gradient state (running statistics and the like) lives on every
//! replica. Replica 0 is the authority: when a push is due its buffers are
//! broadcast from rank 0 to every process and copied onto the other local
//! replicas. Whether a push is due depends on the capability level: newer
//! engines are asked before and after compute, older ones push before
//! compute whenever `require_forward_param_sync` is set.

use numr::dtype::DType;
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

use crate::distributed::backward::SyncFlags;
use crate::distributed::capability::{BufferSyncMode, CapabilityLevel};
use crate::distributed::dispatch::StepModule;
use crate::distributed::placement::{DevicePlacement, ReplicaGroup};
use crate::distributed::reducer::Reducer;
use crate::error::{Error, Result};

/// Rank whose buffers win.
const AUTHORITY_RANK: usize = 0;

/// Broadcast buffers in place from `root` to every rank, then sync once.
///
/// No-op for single-process runs. Every buffer must be contiguous.
pub fn broadcast_buffers<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    buffers: &[(String, Tensor<R>)],
    root: usize,
) -> Result<()> {
    if comm.world_size() <= 1 {
        return Ok(());
    }

    for (name, tensor) in buffers {
        if !tensor.is_contiguous() {
            return Err(Error::BufferSync {
                reason: format!("buffer '{name}' is not contiguous"),
            });
        }
        // Safety: contiguous, so `numel` elements of `dtype` start at the data pointer
        unsafe { comm.broadcast(tensor.ptr(), tensor.numel(), tensor.dtype(), root) }
            .map_err(|e| Error::BufferSync {
                reason: format!("buffer '{name}' from rank {root}: {e}"),
            })?;
    }

    comm.sync().map_err(|e| Error::BufferSync {
        reason: format!("sync after buffer broadcast: {e}"),
    })
}

/// Pushes authority buffers to every replica when the protocol asks for it.
pub struct BufferSyncer<'a, P: ?Sized> {
    comm: &'a dyn Communicator,
    group: &'a ReplicaGroup,
    placement: &'a P,
    enabled: bool,
}

impl<'a, P: ?Sized> BufferSyncer<'a, P> {
    /// `enabled = false` turns every push into a no-op.
    pub fn new(
        comm: &'a dyn Communicator,
        group: &'a ReplicaGroup,
        placement: &'a P,
        enabled: bool,
    ) -> Self {
        Self {
            comm,
            group,
            placement,
            enabled,
        }
    }

    /// Push before compute if due. Returns whether a push happened.
    pub fn pre_sync<R, M>(
        &self,
        level: CapabilityLevel,
        flags: &SyncFlags,
        reducer: &dyn Reducer,
        replicas: &mut [M],
    ) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        M: StepModule<R>,
        P: DevicePlacement<R>,
    {
        let due = match level.protocol().buffer_sync {
            BufferSyncMode::EngineDriven => reducer.should_sync_buffers_pre_forward(),
            BufferSyncMode::FlagDriven => flags.require_forward_param_sync,
        };
        self.push_if::<R, M>(due, "pre-forward", replicas)
    }

    /// Push after compute if due. Only engine-driven levels ever push here.
    pub fn post_sync<R, M>(
        &self,
        level: CapabilityLevel,
        reducer: &dyn Reducer,
        replicas: &mut [M],
    ) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        M: StepModule<R>,
        P: DevicePlacement<R>,
    {
        let due = match level.protocol().buffer_sync {
            BufferSyncMode::EngineDriven => reducer.should_sync_buffers_post_forward(),
            BufferSyncMode::FlagDriven => false,
        };
        self.push_if::<R, M>(due, "post-forward", replicas)
    }

    fn push_if<R, M>(&self, due: bool, phase: &'static str, replicas: &mut [M]) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        M: StepModule<R>,
        P: DevicePlacement<R>,
    {
        if !due || !self.enabled {
            return Ok(false);
        }
        tracing::debug!(phase, "syncing buffers from authority replica");
        self.sync_buffers::<R, M>(replicas)?;
        Ok(true)
    }

    /// Copy replica 0's buffers to every process and every local replica.
    ///
    /// # Errors
    ///
    /// Returns `BufferSync` if a broadcast, relocation or load fails.
    pub fn sync_buffers<R, M>(&self, replicas: &mut [M]) -> Result<()>
    where
        R: Runtime<DType = DType>,
        M: StepModule<R>,
        P: DevicePlacement<R>,
    {
        let Some((authority, others)) = replicas.split_first_mut() else {
            return Ok(());
        };

        let buffers: Vec<(String, Tensor<R>)> = authority
            .named_buffers()
            .into_iter()
            .map(|(name, t)| Ok((name, t.contiguous()?)))
            .collect::<Result<Vec<_>>>()
            .map_err(into_buffer_sync)?;
        if buffers.is_empty() {
            return Ok(());
        }

        if self.comm.world_size() > 1 {
            broadcast_buffers(self.comm, &buffers, AUTHORITY_RANK)?;
            authority.load_buffers(buffers.clone()).map_err(into_buffer_sync)?;
        }

        for (replica, &device) in others.iter_mut().zip(self.group.devices().iter().skip(1)) {
            let moved = buffers
                .iter()
                .map(|(name, t)| Ok((name.clone(), self.placement.to_device(t, device)?)))
                .collect::<Result<Vec<_>>>()
                .map_err(into_buffer_sync)?;
            replica.load_buffers(moved).map_err(into_buffer_sync)?;
        }
        Ok(())
    }
}

fn into_buffer_sync(e: Error) -> Error {
    match e {
        Error::BufferSync { .. } => e,
        other => Error::BufferSync {
            reason: other.to_string(),
        },
    }
}
