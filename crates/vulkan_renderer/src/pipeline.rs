//! Pipeline state cache
//!
//! Pipeline construction may compile and link shader stages, so compiled
//! pipelines are deduplicated by a value-equality content key. Lookups are a
//! hash and an equality check; identical keys always yield the identical
//! shared object. Cached pipelines are immutable and safe to reference from
//! any number of in-flight frames.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{DeviceContext, ImageFormat, PipelineId};
use crate::error::RenderResult;

/// A compiled shader identified by its content
///
/// Two descriptors built from equal SPIR-V words compare equal even when the
/// word arrays are distinct temporaries, so re-loaded shader modules never
/// duplicate a pipeline.
#[derive(Debug, Clone)]
pub struct ShaderDesc {
    words: Arc<[u32]>,
    digest: u64,
}

impl ShaderDesc {
    /// Build a descriptor from compiled SPIR-V words
    pub fn from_spirv(words: &[u32]) -> Self {
        Self {
            words: Arc::from(words),
            digest: fnv1a(words),
        }
    }

    /// The compiled words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Content digest of the compiled words
    pub fn digest(&self) -> u64 {
        self.digest
    }
}

impl PartialEq for ShaderDesc {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.words == other.words
    }
}

impl Eq for ShaderDesc {}

impl std::hash::Hash for ShaderDesc {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
        self.words.len().hash(state);
    }
}

/// FNV-1a over the word stream
fn fnv1a(words: &[u32]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for word in words {
        for byte in word.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// The shader stages of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShaderSet {
    /// Vertex + fragment stages
    Graphics {
        /// Vertex stage
        vertex: ShaderDesc,
        /// Fragment stage
        fragment: ShaderDesc,
    },
    /// A single compute stage
    Compute {
        /// Compute stage
        compute: ShaderDesc,
    },
}

/// Format of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    /// One 32-bit float
    F32,
    /// Two 32-bit floats
    F32x2,
    /// Three 32-bit floats
    F32x3,
    /// Four 32-bit floats
    F32x4,
}

impl AttributeFormat {
    /// Size of the attribute in bytes
    pub fn size(self) -> u32 {
        match self {
            Self::F32 => 4,
            Self::F32x2 => 8,
            Self::F32x3 => 12,
            Self::F32x4 => 16,
        }
    }
}

/// One attribute of the vertex layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    /// Byte offset within the vertex
    pub offset: u32,
    /// Attribute format
    pub format: AttributeFormat,
}

/// Vertex buffer layout at binding zero
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// Bytes per vertex
    pub stride: u32,
    /// Attributes in location order
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Layout with no attributes (vertex data generated in the shader)
    pub fn empty() -> Self {
        Self {
            stride: 0,
            attributes: Vec::new(),
        }
    }
}

/// Color blend configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendState {
    /// No blending
    Opaque,
    /// Standard source-alpha blending
    AlphaBlend,
}

/// Depth test configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    /// Enable the depth test
    pub test: bool,
    /// Write depth on pass
    pub write: bool,
}

impl DepthState {
    /// Depth testing fully disabled
    pub fn disabled() -> Self {
        Self {
            test: false,
            write: false,
        }
    }
}

/// Value key identifying a pipeline by content
///
/// Identical keys map to the identical cached pipeline object; equality is
/// by value, including shader content, never by module identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Shader stages
    pub shaders: ShaderSet,
    /// Vertex layout (ignored for compute)
    pub vertex_layout: VertexLayout,
    /// Blend state (ignored for compute)
    pub blend: BlendState,
    /// Depth state (ignored for compute)
    pub depth: DepthState,
    /// Render target format (ignored for compute)
    pub target_format: ImageFormat,
}

impl PipelineKey {
    /// Graphics key with the given stages and vertex layout
    pub fn graphics(
        vertex: ShaderDesc,
        fragment: ShaderDesc,
        vertex_layout: VertexLayout,
        blend: BlendState,
        depth: DepthState,
        target_format: ImageFormat,
    ) -> Self {
        Self {
            shaders: ShaderSet::Graphics { vertex, fragment },
            vertex_layout,
            blend,
            depth,
            target_format,
        }
    }

    /// Compute key for a single compute stage
    pub fn compute(compute: ShaderDesc) -> Self {
        Self {
            shaders: ShaderSet::Compute { compute },
            vertex_layout: VertexLayout::empty(),
            blend: BlendState::Opaque,
            depth: DepthState::disabled(),
            target_format: ImageFormat::Bgra8Unorm,
        }
    }

    /// Whether this key describes a compute pipeline
    pub fn is_compute(&self) -> bool {
        matches!(self.shaders, ShaderSet::Compute { .. })
    }
}

/// An immutable compiled pipeline, shared read-only across frames
#[derive(Debug)]
pub struct PipelineState {
    id: PipelineId,
    key: PipelineKey,
}

impl PipelineState {
    /// Device handle of the compiled object
    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// The content key this pipeline was built from
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }
}

struct CacheEntry {
    pipeline: Arc<PipelineState>,
    last_used: u64,
}

/// Content-addressed cache of compiled pipelines
pub struct PipelineCache {
    ctx: DeviceContext,
    entries: HashMap<PipelineKey, CacheEntry>,
    evict_after: Option<u64>,
}

impl PipelineCache {
    /// Create an empty cache
    pub fn new(ctx: &DeviceContext, evict_after_frames: Option<u64>) -> Self {
        Self {
            ctx: ctx.clone(),
            entries: HashMap::new(),
            evict_after: evict_after_frames,
        }
    }

    /// Look up or construct the pipeline for `key`.
    ///
    /// A hit returns the identical shared object; a miss constructs through
    /// the device (expensive), inserts, and returns it. `generation` stamps
    /// the entry for eviction bookkeeping.
    pub fn get_or_create(
        &mut self,
        key: &PipelineKey,
        generation: u64,
    ) -> RenderResult<Arc<PipelineState>> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = entry.last_used.max(generation);
            return Ok(Arc::clone(&entry.pipeline));
        }

        log::debug!(
            "compiling {} pipeline",
            if key.is_compute() { "compute" } else { "graphics" }
        );
        let id = self.ctx.device().create_pipeline(key)?;
        let pipeline = Arc::new(PipelineState {
            id,
            key: key.clone(),
        });
        self.entries.insert(
            key.clone(),
            CacheEntry {
                pipeline: Arc::clone(&pipeline),
                last_used: generation,
            },
        );
        Ok(pipeline)
    }

    /// Evict entries unused for the configured number of frames.
    ///
    /// An entry is only eligible once the frame that last used it has been
    /// confirmed complete (`last_used <= completed_generation`), so nothing
    /// referenced by a not-yet-retired submission is ever destroyed.
    pub fn maintain(&mut self, current_generation: u64, completed_generation: u64) {
        let Some(evict_after) = self.evict_after else {
            return;
        };
        let device = Arc::clone(self.ctx.device());
        self.entries.retain(|_, entry| {
            let stale = entry.last_used.saturating_add(evict_after) < current_generation;
            let retired = entry.last_used <= completed_generation;
            if stale && retired {
                log::debug!("evicting pipeline unused since frame {}", entry.last_used);
                device.destroy_pipeline(entry.pipeline.id());
                false
            } else {
                true
            }
        });
    }

    /// Number of cached pipelines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            self.ctx.device().destroy_pipeline(entry.pipeline.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;

    fn test_ctx() -> DeviceContext {
        DeviceContext::new(Arc::new(HeadlessDevice::new()))
    }

    fn graphics_key(words: &[u32]) -> PipelineKey {
        PipelineKey::graphics(
            ShaderDesc::from_spirv(words),
            ShaderDesc::from_spirv(&[0x0723_0203, 9, 9]),
            VertexLayout {
                stride: 12,
                attributes: vec![VertexAttribute {
                    location: 0,
                    offset: 0,
                    format: AttributeFormat::F32x3,
                }],
            },
            BlendState::Opaque,
            DepthState::disabled(),
            ImageFormat::Bgra8Unorm,
        )
    }

    #[test]
    fn same_key_returns_identical_object() {
        let ctx = test_ctx();
        let mut cache = PipelineCache::new(&ctx, None);

        let a = cache.get_or_create(&graphics_key(&[1, 2, 3]), 1).unwrap();
        let b = cache.get_or_create(&graphics_key(&[1, 2, 3]), 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_never_share() {
        let ctx = test_ctx();
        let mut cache = PipelineCache::new(&ctx, None);

        let a = cache.get_or_create(&graphics_key(&[1, 2, 3]), 1).unwrap();
        let b = cache.get_or_create(&graphics_key(&[4, 5, 6]), 1).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.id(), b.id());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn equal_shader_content_from_distinct_modules_dedupes() {
        let ctx = test_ctx();
        let mut cache = PipelineCache::new(&ctx, None);

        // two separately allocated word arrays with equal content
        let first: Vec<u32> = vec![7, 8, 9, 10];
        let second: Vec<u32> = vec![7, 8, 9, 10];
        let a = cache.get_or_create(&graphics_key(&first), 1).unwrap();
        let b = cache.get_or_create(&graphics_key(&second), 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_skips_in_flight_entries() {
        let ctx = test_ctx();
        let mut cache = PipelineCache::new(&ctx, Some(2));

        cache.get_or_create(&graphics_key(&[1]), 1).unwrap();
        cache.get_or_create(&graphics_key(&[2]), 6).unwrap();

        // entry from frame 1 is stale and retired; entry from frame 6 is
        // stale by age rules only when current advances past 8, and frame 6
        // has not completed yet
        cache.maintain(9, 5);
        assert_eq!(cache.len(), 1);

        cache.maintain(9, 6);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn disabled_eviction_keeps_everything() {
        let ctx = test_ctx();
        let mut cache = PipelineCache::new(&ctx, None);
        cache.get_or_create(&graphics_key(&[1]), 1).unwrap();
        cache.maintain(1_000, 1_000);
        assert_eq!(cache.len(), 1);
    }
}
