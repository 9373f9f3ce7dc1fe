//! Device abstraction
//!
//! Everything the frame execution core needs from a GPU is expressed as the
//! [`GpuDevice`] trait: raw memory blocks, buffer/image objects, sync
//! primitives, command encoding, queue submission, and presentation. The
//! production implementation wraps `ash` ([`vulkan::VulkanDevice`]); the
//! [`headless::HeadlessDevice`] implementation runs the same engine logic
//! against host memory so the whole core is testable without a GPU.
//!
//! No component touches process-wide state: the [`DeviceContext`] bundle is
//! created once by the embedder and borrowed (as a cloned `Arc`) by every
//! component constructor, so multiple independent renderer instances can
//! coexist in one process.

pub mod headless;
pub mod vulkan;

use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::draw::GpuCommand;
use crate::error::RenderResult;
use crate::pipeline::PipelineKey;

/// Raw handle to a device memory block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

/// Raw handle to a device buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBufferId(pub u64);

/// Raw handle to a device image object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawImageId(pub u64);

/// Raw handle to a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

/// Raw handle to a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub u64);

/// Raw handle to a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId(pub u64);

/// Raw handle to a compiled pipeline object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

bitflags! {
    /// Properties of a device memory type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Fastest memory for GPU access, not necessarily CPU-reachable
        const DEVICE_LOCAL = 1 << 0;
        /// CPU-mappable memory
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible without explicit flushes
        const HOST_COHERENT = 1 << 2;
    }
}

bitflags! {
    /// Declared uses of a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Bound as a vertex buffer
        const VERTEX = 1 << 0;
        /// Bound as an index buffer
        const INDEX = 1 << 1;
        /// Bound as a uniform buffer
        const UNIFORM = 1 << 2;
        /// Bound as a shader storage buffer
        const STORAGE = 1 << 3;
        /// Source of transfer commands
        const TRANSFER_SRC = 1 << 4;
        /// Destination of transfer commands
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Declared uses of an image
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Sampled from shaders
        const SAMPLED = 1 << 0;
        /// Written as a storage image
        const STORAGE = 1 << 1;
        /// Rendered to as a color attachment
        const COLOR_ATTACHMENT = 1 << 2;
        /// Source of transfer commands
        const TRANSFER_SRC = 1 << 3;
        /// Destination of transfer commands
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    /// Pipeline stages, used for barrier scopes and semaphore waits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StageMask: u32 {
        /// Start of the pipeline
        const TOP = 1 << 0;
        /// Vertex/index fetch
        const VERTEX_INPUT = 1 << 1;
        /// Vertex shader execution
        const VERTEX_SHADER = 1 << 2;
        /// Fragment shader execution
        const FRAGMENT_SHADER = 1 << 3;
        /// Color attachment writes
        const COLOR_OUTPUT = 1 << 4;
        /// Compute shader execution
        const COMPUTE = 1 << 5;
        /// Transfer operations
        const TRANSFER = 1 << 6;
        /// End of the pipeline
        const BOTTOM = 1 << 7;
    }
}

bitflags! {
    /// Memory access kinds, used for barrier hazard scopes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        /// Vertex attribute reads
        const VERTEX_READ = 1 << 0;
        /// Index buffer reads
        const INDEX_READ = 1 << 1;
        /// Uniform buffer reads
        const UNIFORM_READ = 1 << 2;
        /// Generic shader reads (sampled images, storage reads)
        const SHADER_READ = 1 << 3;
        /// Shader storage writes
        const SHADER_WRITE = 1 << 4;
        /// Color attachment writes
        const COLOR_WRITE = 1 << 5;
        /// Transfer reads
        const TRANSFER_READ = 1 << 6;
        /// Transfer writes
        const TRANSFER_WRITE = 1 << 7;
        /// Host writes through a mapped pointer
        const HOST_WRITE = 1 << 8;
    }
}

impl AccessMask {
    /// Whether any write access is present; writes are what create hazards
    pub fn has_writes(self) -> bool {
        self.intersects(
            Self::SHADER_WRITE | Self::COLOR_WRITE | Self::TRANSFER_WRITE | Self::HOST_WRITE,
        )
    }
}

/// Where an allocation should live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory; cannot be mapped
    DeviceLocal,
    /// CPU-mappable, coherent memory
    HostVisible,
}

impl MemoryLocation {
    /// Property flags a memory type must carry for this location
    pub fn required_flags(self) -> MemoryFlags {
        match self {
            Self::DeviceLocal => MemoryFlags::DEVICE_LOCAL,
            Self::HostVisible => MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT,
        }
    }
}

/// One memory type reported by the device
#[derive(Debug, Clone)]
pub struct MemoryType {
    /// Property flags of this type
    pub flags: MemoryFlags,
}

/// The device's memory type table
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    /// Memory types, indexed by the `memory_type` arguments of the trait
    pub types: Vec<MemoryType>,
}

impl MemoryProperties {
    /// Whether any memory type carries all of the given flags
    pub fn supports(&self, flags: MemoryFlags) -> bool {
        self.types.iter().any(|t| t.flags.contains(flags))
    }
}

/// Size/alignment/type constraints for binding a resource to memory
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    /// Required allocation size in bytes
    pub size: u64,
    /// Required offset alignment in bytes
    pub alignment: u64,
    /// Bitmask of acceptable memory type indices
    pub memory_type_bits: u32,
}

/// Texel format of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, unsigned normalized
    Rgba8Unorm,
    /// 8-bit BGRA, unsigned normalized (common swapchain format)
    Bgra8Unorm,
    /// 32-bit float depth
    D32Float,
}

impl ImageFormat {
    /// Bytes per texel
    pub fn texel_size(self) -> u64 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::D32Float => 4,
        }
    }
}

/// Layout an image's memory is organized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents undefined; the initial layout of every image
    Undefined,
    /// Usable for any access, unoptimized
    General,
    /// Optimal for color attachment writes
    ColorAttachment,
    /// Optimal for shader sampling
    ShaderReadOnly,
    /// Optimal for transfer reads
    TransferSrc,
    /// Optimal for transfer writes
    TransferDst,
}

/// Creation parameters for an image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: ImageFormat,
    /// Declared uses
    pub usage: ImageUsage,
}

/// Outcome of a bounded fence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence signaled within the timeout
    Signaled,
    /// The timeout expired first
    TimedOut,
}

/// One queue submission: the unit the synchronization manager hands to the
/// device. The fence is checked and reset before the owning frame slot is
/// reused.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    /// Recorded commands to execute
    pub command_buffer: CommandBufferId,
    /// Semaphores to wait on, with the stage each wait gates
    pub waits: Vec<(SemaphoreId, StageMask)>,
    /// Semaphores signaled when execution completes
    pub signals: Vec<SemaphoreId>,
    /// Fence signaled when execution completes
    pub fence: FenceId,
}

/// Raw operations the engine needs from a GPU
///
/// Implementations are internally synchronized; the engine calls through a
/// shared reference. All objects created through the trait are owned by the
/// device and destroyed either explicitly or when the device drops.
pub trait GpuDevice: Send + Sync {
    /// The device's memory type table
    fn memory_properties(&self) -> MemoryProperties;
    /// Number of presentable images in the swapchain
    fn swapchain_image_count(&self) -> u32;
    /// Current surface extent in pixels
    fn surface_extent(&self) -> (u32, u32);

    /// Allocate a raw memory block from the given memory type
    fn allocate_block(&self, memory_type: u32, size: u64) -> RenderResult<BlockId>;
    /// Release a memory block
    fn free_block(&self, block: BlockId);
    /// Persistent mapping of a host-visible block, if it has one
    fn block_mapped_ptr(&self, block: BlockId) -> Option<NonNull<u8>>;

    /// Create an unbound buffer object
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<RawBufferId>;
    /// Memory constraints for binding the buffer
    fn buffer_requirements(&self, buffer: RawBufferId) -> MemoryRequirements;
    /// Bind the buffer to block memory at the given offset
    fn bind_buffer(&self, buffer: RawBufferId, block: BlockId, offset: u64) -> RenderResult<()>;
    /// Destroy a buffer object
    fn destroy_buffer(&self, buffer: RawBufferId);

    /// Create an unbound image object
    fn create_image(&self, desc: &ImageDesc) -> RenderResult<RawImageId>;
    /// Memory constraints for binding the image
    fn image_requirements(&self, image: RawImageId) -> MemoryRequirements;
    /// Bind the image to block memory at the given offset
    fn bind_image(&self, image: RawImageId, block: BlockId, offset: u64) -> RenderResult<()>;
    /// Destroy an image object
    fn destroy_image(&self, image: RawImageId);

    /// Create a fence, optionally pre-signaled
    fn create_fence(&self, signaled: bool) -> RenderResult<FenceId>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: FenceId);
    /// Wait on a fence with a bounded timeout
    fn wait_fence(&self, fence: FenceId, timeout_ns: u64) -> RenderResult<FenceStatus>;
    /// Reset a signaled fence to unsignaled
    fn reset_fence(&self, fence: FenceId) -> RenderResult<()>;
    /// Create a binary semaphore
    fn create_semaphore(&self) -> RenderResult<SemaphoreId>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    /// Create a command buffer for repeated re-recording
    fn create_command_buffer(&self) -> RenderResult<CommandBufferId>;
    /// Destroy a command buffer
    fn destroy_command_buffer(&self, commands: CommandBufferId);
    /// Replace the command buffer's contents with the lowered stream
    fn encode(&self, commands: CommandBufferId, stream: &[GpuCommand]) -> RenderResult<()>;
    /// Enqueue a submission on the graphics queue; returns immediately
    fn submit(&self, submission: &SubmissionRecord) -> RenderResult<()>;

    /// Acquire the next presentable image, signaling the semaphore when the
    /// image is ready. Fails with `SurfaceStale` when the surface changed.
    fn acquire_image(&self, signal: SemaphoreId) -> RenderResult<u32>;
    /// Queue presentation of a rendered image, gated on the semaphore
    fn present(&self, image_index: u32, wait: SemaphoreId) -> RenderResult<()>;
    /// Rebuild presentation-dependent resources after `SurfaceStale`
    fn rebuild_surface(&self) -> RenderResult<()>;
    /// Block until the device is idle
    fn wait_idle(&self) -> RenderResult<()>;

    /// Compile a pipeline for the given content key (expensive)
    fn create_pipeline(&self, key: &PipelineKey) -> RenderResult<PipelineId>;
    /// Destroy a compiled pipeline
    fn destroy_pipeline(&self, pipeline: PipelineId);
}

/// Process-wide handle bundle: the shared device plus cached properties.
///
/// Created once at startup and borrowed by every component constructor;
/// destroying it (after [`crate::frame::FrameScheduler::drain`]) tears down
/// all GPU state.
#[derive(Clone)]
pub struct DeviceContext {
    device: Arc<dyn GpuDevice>,
    memory: MemoryProperties,
}

impl DeviceContext {
    /// Wrap a device implementation
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        let memory = device.memory_properties();
        Self { device, memory }
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Cached memory type table
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.memory
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("memory_types", &self.memory.types.len())
            .finish()
    }
}
