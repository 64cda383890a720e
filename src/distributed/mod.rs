pub mod backward;
pub mod buffer_sync;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod grad_mode;
pub mod payload;
pub mod placement;
pub mod reducer;
pub mod scatter_gather;
pub mod wrapper;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use backward::{BackwardPrep, SyncFlags, prepare_backward};
pub use buffer_sync::{BufferSyncer, broadcast_buffers};
pub use capability::{BufferSyncMode, CapabilityLevel, EngineCapabilities, Protocol};
pub use config::DdpConfig;
pub use dispatch::{GatherOptions, StepKind, StepModule, run, run_on_first_device};
pub use grad_mode::{GradModeGuard, NoGradGuard, is_grad_enabled, set_grad_enabled};
pub use payload::{Literal, StepPayload, StepResult, Value, ValueVisitor};
pub use placement::{DeviceId, DevicePlacement, HostPlacement, ReplicaGroup};
pub use reducer::{NoOpReducer, Reducer};
pub use scatter_gather::{LiteralMergePolicy, merge, scatter, shard};
pub use wrapper::DistributedDataParallel;
