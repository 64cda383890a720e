//! Capability gate
//!
//! Maps what the gradient-synchronization engine can do to one of three
//! protocol variants. Older engines rebuilt buckets at the end of backward
//! and synced buffers off a flag; newer ones rebuild at the start of the step
//! and decide buffer sync timing themselves.

use serde::{Deserialize, Serialize};

/// Capabilities advertised by the gradient-synchronization engine.
///
/// Supplied once at construction. Each field corresponds to one behavior
/// the engine gained over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Bucket rebuild runs at the start of the step instead of the end of backward.
    #[serde(default)]
    pub forward_bucket_rebuild: bool,
    /// Engine decides whether buffers sync before and/or after compute.
    #[serde(default)]
    pub engine_buffer_sync: bool,
    /// Engine defines a forward param sync flag that may be cleared after no-grad steps.
    #[serde(default)]
    pub forward_param_sync_flag: bool,
}

impl EngineCapabilities {
    /// Capabilities of a current engine (every behavior available).
    pub fn modern() -> Self {
        Self {
            forward_bucket_rebuild: true,
            engine_buffer_sync: true,
            forward_param_sync_flag: true,
        }
    }

    /// Resolve the protocol level these capabilities select.
    pub fn level(&self) -> CapabilityLevel {
        if self.forward_bucket_rebuild && self.engine_buffer_sync {
            CapabilityLevel::PostBucketRebuild
        } else if self.forward_param_sync_flag {
            CapabilityLevel::PreBucketRebuild
        } else {
            CapabilityLevel::Legacy
        }
    }
}

/// Protocol variant of the collaborator engine. Resolved once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityLevel {
    Legacy,
    PreBucketRebuild,
    PostBucketRebuild,
}

/// When buffer synchronization is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSyncMode {
    /// Push before compute whenever `require_forward_param_sync` is set.
    FlagDriven,
    /// Ask the engine before compute and again after compute.
    EngineDriven,
}

/// Behaviors active for one capability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    /// Ask the reducer to rebuild stale buckets before the step runs.
    pub rebuild_buckets: bool,
    pub buffer_sync: BufferSyncMode,
    /// Clear `require_forward_param_sync` after a step that produced no gradients.
    pub clears_forward_sync: bool,
}

const LEGACY: Protocol = Protocol {
    rebuild_buckets: false,
    buffer_sync: BufferSyncMode::FlagDriven,
    clears_forward_sync: false,
};

const PRE_BUCKET_REBUILD: Protocol = Protocol {
    rebuild_buckets: false,
    buffer_sync: BufferSyncMode::FlagDriven,
    clears_forward_sync: true,
};

const POST_BUCKET_REBUILD: Protocol = Protocol {
    rebuild_buckets: true,
    buffer_sync: BufferSyncMode::EngineDriven,
    clears_forward_sync: true,
};

impl CapabilityLevel {
    /// Look up the protocol row for this level.
    pub const fn protocol(self) -> Protocol {
        match self {
            Self::Legacy => LEGACY,
            Self::PreBucketRebuild => PRE_BUCKET_REBUILD,
            Self::PostBucketRebuild => POST_BUCKET_REBUILD,
        }
    }
}

impl From<EngineCapabilities> for CapabilityLevel {
    fn from(caps: EngineCapabilities) -> Self {
        caps.level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities_are_legacy() {
        assert_eq!(EngineCapabilities::default().level(), CapabilityLevel::Legacy);
    }

    #[test]
    fn test_modern_capabilities() {
        assert_eq!(
            EngineCapabilities::modern().level(),
            CapabilityLevel::PostBucketRebuild
        );
    }

    #[test]
    fn test_forward_flag_only_is_pre_bucket_rebuild() {
        let caps = EngineCapabilities {
            forward_param_sync_flag: true,
            ..Default::default()
        };
        assert_eq!(caps.level(), CapabilityLevel::PreBucketRebuild);
    }

    #[test]
    fn test_bucket_rebuild_without_engine_sync_falls_back() {
        // Rebuild alone does not move buffer sync timing to the engine.
        let caps = EngineCapabilities {
            forward_bucket_rebuild: true,
            engine_buffer_sync: false,
            forward_param_sync_flag: true,
        };
        assert_eq!(caps.level(), CapabilityLevel::PreBucketRebuild);
    }

    #[test]
    fn test_protocol_table() {
        let legacy = CapabilityLevel::Legacy.protocol();
        assert!(!legacy.rebuild_buckets);
        assert!(!legacy.clears_forward_sync);
        assert_eq!(legacy.buffer_sync, BufferSyncMode::FlagDriven);

        let pre = CapabilityLevel::PreBucketRebuild.protocol();
        assert!(!pre.rebuild_buckets);
        assert!(pre.clears_forward_sync);
        assert_eq!(pre.buffer_sync, BufferSyncMode::FlagDriven);

        let post = CapabilityLevel::PostBucketRebuild.protocol();
        assert!(post.rebuild_buckets);
        assert!(post.clears_forward_sync);
        assert_eq!(post.buffer_sync, BufferSyncMode::EngineDriven);
    }

    #[test]
    fn test_capabilities_deserialize_with_defaults() {
        let caps: EngineCapabilities =
            serde_json::from_str(r#"{"forward_param_sync_flag": true}"#).unwrap();
        assert_eq!(caps.level(), CapabilityLevel::PreBucketRebuild);
    }
}
