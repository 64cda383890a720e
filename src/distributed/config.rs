//! Wrapper configuration
//!
//! Mirrors the construction arguments of a data-parallel wrapper: which local
//! devices hold replicas, where results are gathered, how inputs split, and
//! what the gradient engine can do. Loadable from YAML or JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distributed::capability::{CapabilityLevel, EngineCapabilities};
use crate::distributed::dispatch::GatherOptions;
use crate::distributed::placement::{DeviceId, ReplicaGroup};
use crate::distributed::scatter_gather::LiteralMergePolicy;
use crate::error::{Error, Result};

/// Configuration for [`DistributedDataParallel`](crate::distributed::DistributedDataParallel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdpConfig {
    /// Local devices holding one replica each. Empty = run in place.
    #[serde(default)]
    pub device_ids: Vec<DeviceId>,
    /// Device results are gathered onto. Defaults to the first device.
    #[serde(default)]
    pub output_device: Option<DeviceId>,
    /// Dimension inputs are split and outputs concatenated along.
    #[serde(default)]
    pub dim: usize,
    /// Walk step results for reachable tensors before backward.
    #[serde(default)]
    pub find_unused_parameters: bool,
    /// Push authority buffers to the other replicas when due.
    #[serde(default = "default_broadcast_buffers")]
    pub broadcast_buffers: bool,
    #[serde(default)]
    pub merge_policy: LiteralMergePolicy,
    #[serde(default = "EngineCapabilities::modern")]
    pub capabilities: EngineCapabilities,
}

fn default_broadcast_buffers() -> bool {
    true
}

impl Default for DdpConfig {
    fn default() -> Self {
        Self {
            device_ids: Vec::new(),
            output_device: None,
            dim: 0,
            find_unused_parameters: false,
            broadcast_buffers: true,
            merge_policy: LiteralMergePolicy::default(),
            capabilities: EngineCapabilities::modern(),
        }
    }
}

impl DdpConfig {
    pub fn validate(&self) -> Result<()> {
        self.replica_group()?;
        if let Some(out) = self.output_device {
            if !self.device_ids.contains(&out) {
                return Err(Error::InvalidConfig {
                    arg: "output_device",
                    reason: format!("{out} is not one of the replica devices"),
                });
            }
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::InvalidConfig {
            arg: "path",
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::InvalidConfig {
            arg: "path",
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_device_ids(mut self, devices: impl IntoIterator<Item = usize>) -> Self {
        self.device_ids = devices.into_iter().map(DeviceId).collect();
        self
    }

    pub fn with_output_device(mut self, device: usize) -> Self {
        self.output_device = Some(DeviceId(device));
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_find_unused_parameters(mut self, enabled: bool) -> Self {
        self.find_unused_parameters = enabled;
        self
    }

    pub fn with_broadcast_buffers(mut self, enabled: bool) -> Self {
        self.broadcast_buffers = enabled;
        self
    }

    pub fn with_merge_policy(mut self, policy: LiteralMergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Build the replica group described by `device_ids` / `output_device`.
    pub fn replica_group(&self) -> Result<ReplicaGroup> {
        ReplicaGroup::new(self.device_ids.clone(), self.output_device)
    }

    pub fn capability_level(&self) -> CapabilityLevel {
        self.capabilities.level()
    }

    pub fn gather_options(&self) -> GatherOptions {
        GatherOptions {
            dim: self.dim,
            literal_policy: self.merge_policy,
        }
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
        arg: "path",
        reason: format!("IO error reading {}: {e}", path.display()),
    })
}
