//! Device identifiers, replica groups and tensor placement
//!
//! The orchestrator never moves memory itself. Relocation and concatenation
//! go through a [`DevicePlacement`] supplied by the caller, so the same
//! scatter/gather logic works for any numr runtime.

use std::fmt;

use numr::autograd::{Var, var_cat};
use numr::dtype::DType;
use numr::ops::{ShapeOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Local device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Ordered local devices plus the device results are gathered onto.
///
/// An empty group means the module runs where it already lives
/// (single process, typically CPU) with no scatter or gather.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaGroup {
    devices: Vec<DeviceId>,
    output_device: Option<DeviceId>,
}

impl ReplicaGroup {
    /// Build a group. The output device defaults to the first device.
    pub fn new(devices: Vec<DeviceId>, output_device: Option<DeviceId>) -> Result<Self> {
        for (i, d) in devices.iter().enumerate() {
            if devices[..i].contains(d) {
                return Err(Error::InvalidConfig {
                    arg: "device_ids",
                    reason: format!("{d} listed more than once"),
                });
            }
        }
        if devices.is_empty() && output_device.is_some() {
            return Err(Error::InvalidConfig {
                arg: "output_device",
                reason: "output device requires a non-empty device list".to_string(),
            });
        }
        let output_device = output_device.or_else(|| devices.first().copied());
        Ok(Self {
            devices,
            output_device,
        })
    }

    /// Group with no explicit devices.
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            output_device: None,
        }
    }

    /// Group over device ordinals `0..n`, gathering onto device 0.
    pub fn range(n: usize) -> Self {
        let devices: Vec<DeviceId> = (0..n).map(DeviceId).collect();
        Self {
            output_device: devices.first().copied(),
            devices,
        }
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn output_device(&self) -> Option<DeviceId> {
        self.output_device
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Moves tensors between local devices and concatenates them.
///
/// Implementations must return tensors resident on `device`. Relocating a
/// tensor that already lives on `device` should hand back the same storage.
pub trait DevicePlacement<R: Runtime>: Send + Sync {
    fn to_device(&self, tensor: &Tensor<R>, device: DeviceId) -> Result<Tensor<R>>;

    fn var_to_device(&self, var: &Var<R>, device: DeviceId) -> Result<Var<R>>;

    /// Concatenate `parts` along `dim` on `device`.
    fn concat(&self, parts: &[&Tensor<R>], dim: usize, device: DeviceId) -> Result<Tensor<R>>;

    /// Concatenate variables along `dim` on `device`, keeping the autograd graph.
    fn concat_vars(&self, parts: &[&Var<R>], dim: usize, device: DeviceId) -> Result<Var<R>>;
}

/// Placement for runtimes with a single addressable device (e.g. CPU).
///
/// Every device ordinal maps to the client's device, so relocation is a
/// cheap handle clone and concatenation runs on the client.
pub struct HostPlacement<C> {
    client: C,
}

impl<C> HostPlacement<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<R, C> DevicePlacement<R> for HostPlacement<C>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ShapeOps<R> + Send + Sync,
    R::Client: TensorOps<R> + ShapeOps<R>,
{
    fn to_device(&self, tensor: &Tensor<R>, _device: DeviceId) -> Result<Tensor<R>> {
        Ok(tensor.clone())
    }

    fn var_to_device(&self, var: &Var<R>, _device: DeviceId) -> Result<Var<R>> {
        Ok(var.clone())
    }

    fn concat(&self, parts: &[&Tensor<R>], dim: usize, _device: DeviceId) -> Result<Tensor<R>> {
        self.client
            .cat(parts, dim as isize)
            .map_err(Error::Numr)
    }

    fn concat_vars(&self, parts: &[&Var<R>], dim: usize, _device: DeviceId) -> Result<Var<R>> {
        var_cat(parts, dim as isize, &self.client).map_err(Error::Numr)
    }
}
