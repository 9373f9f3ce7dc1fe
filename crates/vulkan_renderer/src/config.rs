//! Renderer configuration
//!
//! Strongly typed configuration with serde support and sensible defaults,
//! loadable from TOML for applications that keep renderer tuning in files.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the frame execution core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frames the CPU may run ahead of the GPU (clamped to 2..=3)
    pub frames_in_flight: usize,
    /// Bound on any single fence wait before the device is declared hung
    pub fence_timeout_ns: u64,
    /// Growth quantum for allocator memory pools, in bytes
    pub block_size: u64,
    /// Evict cached pipelines unused for this many completed frames
    /// (`None` disables eviction)
    pub pipeline_evict_after_frames: Option<u64>,
    /// How many times a stale surface is rebuilt and retried per frame
    pub max_surface_retries: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: 1_000_000_000,
            block_size: 64 * 1024 * 1024,
            pipeline_evict_after_frames: None,
            max_surface_retries: 3,
        }
    }
}

impl RendererConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Frames in flight clamped to the supported pipelining depth
    pub fn clamped_frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(2, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.fence_timeout_ns > 0);
        assert!(config.block_size >= 1024);
        assert!(config.pipeline_evict_after_frames.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let config = RendererConfig::from_toml_str(
            "frames_in_flight = 3\nblock_size = 1048576\n",
        )
        .expect("valid toml");
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.block_size, 1024 * 1024);
        // untouched fields keep their defaults
        assert_eq!(config.max_surface_retries, 3);
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut config = RendererConfig::default();
        config.frames_in_flight = 7;
        assert_eq!(config.clamped_frames_in_flight(), 3);
        config.frames_in_flight = 0;
        assert_eq!(config.clamped_frames_in_flight(), 2);
    }
}
