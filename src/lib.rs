//! # ddp-step
//!
//! **Per-step data-parallel orchestration built on numr.**
//!
//! ddp-step wraps a model replicated over local devices and drives its
//! `train_step` / `val_step` / `forward` through the data-parallel step
//! protocol. Gradient reduction and collectives stay in numr's
//! `Communicator` and a pluggable [`Reducer`]; this crate decides *when* they
//! fire and *how* inputs and outputs are shaped around them.
//!
//! ## Step lifecycle
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌─────────┐   ┌───────────────────┐
//! │ bucket       │──►│ buffer sync │──►│ scatter │──►│ replicas (rayon)  │
//! │ rebuild      │   │ (pre)       │   └─────────┘   └─────────┬─────────┘
//! └──────────────┘   └─────────────┘                           │
//!                    ┌─────────────┐   ┌─────────────┐   ┌─────▼─────┐
//!   result ◄─────────│ backward    │◄──│ buffer sync │◄──│ gather    │
//!                    │ readiness   │   │ (post)      │   └───────────┘
//!                    └─────────────┘   └─────────────┘
//! ```
//!
//! ## Design
//!
//! - **Capability gate**: the engine's capabilities resolve once to a static
//!   protocol row (bucket rebuild, buffer sync timing, flag clearing)
//! - **Value**: one sum type for payloads and results, walked by a typed visitor
//! - **DevicePlacement**: relocation and concatenation behind a trait, so the
//!   same scatter/gather runs on any numr runtime

pub mod distributed;
pub mod error;

pub use distributed::{
    DdpConfig, DistributedDataParallel, Reducer, StepKind, StepModule, StepPayload, StepResult,
    Value,
};
pub use error::{Error, Result};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Communicator, Runtime, RuntimeClient};
pub use numr::tensor::{Tensor, TensorId};
