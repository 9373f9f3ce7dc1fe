//! Error taxonomy for the frame execution core
//!
//! One public error enum covers every component; recoverable and fatal
//! conditions are distinguished so callers can decide between retrying,
//! surfacing, and tearing the device down.

use ash::vk;
use thiserror::Error;

/// Errors produced by the renderer core
#[derive(Error, Debug)]
pub enum RenderError {
    /// No memory type or pool region can satisfy the allocation
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Usage flags conflict with the requested memory property
    #[error("invalid usage: {reason}")]
    InvalidUsage {
        /// Description of the conflict
        reason: String,
    },

    /// The resource is not host-visible and cannot be mapped
    #[error("resource is not mappable")]
    NotMappable,

    /// A draw list referenced a resource or pipeline unknown to the frame
    #[error("invalid draw list: {reason}")]
    InvalidDrawList {
        /// Description of the offending operation
        reason: String,
    },

    /// A bounded fence wait expired; the device is considered hung
    #[error("timed out waiting for the device")]
    DeviceTimeout,

    /// The presentation surface no longer matches the swapchain
    #[error("presentation surface is stale")]
    SurfaceStale,

    /// The logical device was lost; only full re-initialization recovers
    #[error("device lost")]
    DeviceLost,

    /// Backend setup failed before any frame could run
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Unclassified Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),
}

impl RenderError {
    /// Whether this error requires full re-initialization of the device
    /// context. `SurfaceStale` is the only condition retried automatically;
    /// everything fatal lands here.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceTimeout | Self::DeviceLost)
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(RenderError::DeviceLost.is_fatal());
        assert!(RenderError::DeviceTimeout.is_fatal());
        assert!(!RenderError::SurfaceStale.is_fatal());
        assert!(!RenderError::OutOfMemory { requested: 16 }.is_fatal());
    }
}
