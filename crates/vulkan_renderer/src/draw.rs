//! Draw list data model
//!
//! Scene and render-graph logic describes a frame as an ordered list of
//! [`DrawOp`] values, a closed set of tagged variants with explicit fields,
//! so the hot recording path never inspects dynamic types. The command
//! recorder lowers a [`DrawList`] into the linear [`GpuCommand`] stream the
//! device encodes.

use nalgebra::Matrix4;

use crate::alloc::{BufferHandle, ImageHandle};
use crate::device::{
    AccessMask, ImageLayout, PipelineId, RawBufferId, RawImageId, StageMask,
};
use crate::pipeline::PipelineKey;

/// Per-draw push constant payload: a transform and a tint color.
///
/// Layout matches the 80-byte push constant range every pipeline declares.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPush {
    /// Model transform, column-major
    pub transform: [[f32; 4]; 4],
    /// RGBA multiplier applied in the fragment stage
    pub tint: [f32; 4],
}

unsafe impl bytemuck::Pod for DrawPush {}
unsafe impl bytemuck::Zeroable for DrawPush {}

/// Size of the push constant range declared by every pipeline layout
pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<DrawPush>() as u32;

impl DrawPush {
    /// Build a payload from a transform matrix and tint
    pub fn new(transform: Matrix4<f32>, tint: [f32; 4]) -> Self {
        Self {
            transform: transform.into(),
            tint,
        }
    }

    /// Identity transform, white tint
    pub fn identity() -> Self {
        Self::new(Matrix4::identity(), [1.0; 4])
    }
}

impl Default for DrawPush {
    fn default() -> Self {
        Self::identity()
    }
}

/// A resource referenced by a compute operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    /// A buffer handle from the allocator
    Buffer(BufferHandle),
    /// An image handle from the allocator
    Image(ImageHandle),
}

/// One operation of a frame's draw list
#[derive(Debug, Clone)]
pub enum DrawOp {
    /// Indexed draw through a graphics pipeline
    DrawIndexed {
        /// Pipeline content key
        pipeline: PipelineKey,
        /// Vertex data
        vertex_buffer: BufferHandle,
        /// Index data (u32 indices)
        index_buffer: BufferHandle,
        /// Number of indices to draw
        index_count: u32,
        /// First index within the index buffer
        first_index: u32,
        /// Value added to each index before vertex lookup
        vertex_offset: i32,
        /// Images sampled by the fragment stage
        textures: Vec<ImageHandle>,
        /// Per-draw push constants
        push: DrawPush,
    },
    /// Instanced indexed draw through a graphics pipeline
    DrawInstanced {
        /// Pipeline content key
        pipeline: PipelineKey,
        /// Vertex data
        vertex_buffer: BufferHandle,
        /// Index data (u32 indices)
        index_buffer: BufferHandle,
        /// Number of indices per instance
        index_count: u32,
        /// Number of instances
        instance_count: u32,
        /// Images sampled by the fragment stage
        textures: Vec<ImageHandle>,
        /// Per-draw push constants
        push: DrawPush,
    },
    /// Compute dispatch
    DispatchCompute {
        /// Pipeline content key (must be a compute key)
        pipeline: PipelineKey,
        /// Resources the shader reads
        reads: Vec<ResourceRef>,
        /// Resources the shader writes
        writes: Vec<ResourceRef>,
        /// Workgroup counts
        groups: [u32; 3],
    },
}

/// Ordered draw/compute operations for one frame
#[derive(Debug, Clone)]
pub struct DrawList {
    /// Clear color for the frame's render target
    pub clear_color: [f32; 4],
    /// Operations in submission order
    pub ops: Vec<DrawOp>,
}

impl DrawList {
    /// Empty list with the given clear color
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self {
            clear_color,
            ops: Vec::new(),
        }
    }

    /// Append an operation
    pub fn push(&mut self, op: DrawOp) {
        self.ops.push(op);
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the list has no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Default for DrawList {
    fn default() -> Self {
        Self::new([0.0, 0.0, 0.0, 1.0])
    }
}

/// A device-level resource named in a lowered command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawResource {
    /// A buffer object
    Buffer(RawBufferId),
    /// An image object
    Image(RawImageId),
}

/// An explicit resource-state transition between conflicting accesses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarrierDesc {
    /// Resource being transitioned
    pub resource: RawResource,
    /// Stages whose prior accesses must complete
    pub src_stage: StageMask,
    /// Prior accesses made available
    pub src_access: AccessMask,
    /// Stages blocked until the transition completes
    pub dst_stage: StageMask,
    /// Subsequent accesses made visible
    pub dst_access: AccessMask,
    /// Layout the image leaves (`Undefined` for buffers)
    pub old_layout: ImageLayout,
    /// Layout the image enters (`Undefined` for buffers)
    pub new_layout: ImageLayout,
}

/// One command of the lowered, linear stream handed to the device
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Begin rendering to a swapchain image; `clear` of `None` preserves
    /// existing contents (used when a pass resumes after a compute dispatch)
    BeginPass {
        /// Swapchain image index being rendered
        image_index: u32,
        /// Clear color, or `None` to load prior contents
        clear: Option<[f32; 4]>,
    },
    /// End the current rendering pass
    EndPass,
    /// Bind a compiled pipeline
    BindPipeline(PipelineId),
    /// Bind sampled textures for the fragment stage
    BindTextures(Vec<RawImageId>),
    /// Bind storage resources for the compute stage
    BindStorage(Vec<RawResource>),
    /// Bind the vertex buffer at binding zero
    BindVertexBuffer(RawBufferId),
    /// Bind the index buffer (u32 indices)
    BindIndexBuffer(RawBufferId),
    /// Update push constants
    PushConstants(DrawPush),
    /// Resource-state transition
    Barrier(BarrierDesc),
    /// Indexed draw
    DrawIndexed {
        /// Number of indices
        index_count: u32,
        /// Number of instances
        instance_count: u32,
        /// First index
        first_index: u32,
        /// Added to each index before vertex lookup
        vertex_offset: i32,
        /// First instance id
        first_instance: u32,
    },
    /// Compute dispatch
    Dispatch {
        /// Workgroup counts
        groups: [u32; 3],
    },
}

impl GpuCommand {
    /// Whether this command is a barrier (test and diagnostics helper)
    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::Barrier(_))
    }
}
