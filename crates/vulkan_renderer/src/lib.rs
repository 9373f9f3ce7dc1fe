//! # Vulkan Renderer Core
//!
//! Frame execution and GPU resource lifecycle for a Vulkan renderer. This
//! is the part every renderer must get right: explicit synchronization,
//! manual resource lifetime, and multi-frame pipelining.
//!
//! ## Components
//!
//! - **Resource Allocator**: pooled sub-allocation with generational
//!   handles and deferred, fence-gated frees
//! - **Pipeline Cache**: content-addressed deduplication of compiled
//!   pipeline state objects
//! - **Synchronization Manager**: fences and semaphores behind
//!   `begin_frame`/`submit`
//! - **Command Recorder**: declarative draw lists lowered to linear command
//!   streams with automatic hazard barriers
//! - **Frame Scheduler**: N frames in flight with backpressure by
//!   construction
//!
//! Windowing, shader compilation, asset import, and scene logic are
//! external collaborators; the engine consumes their outputs (a
//! pre-established device, compiled SPIR-V, vertex/index data, transforms).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vulkan_renderer::prelude::*;
//!
//! # fn shader_words() -> Vec<u32> { vec![] }
//! fn main() -> RenderResult<()> {
//!     // any GpuDevice works; production code wraps VulkanDevice::new(..)
//!     let device = Arc::new(vulkan_renderer::device::headless::HeadlessDevice::new());
//!     let ctx = DeviceContext::new(device);
//!     let config = RendererConfig::default();
//!
//!     let mut allocator = ResourceAllocator::new(&ctx, &config);
//!     let mut pipelines = PipelineCache::new(&ctx, config.pipeline_evict_after_frames);
//!     let mut scheduler = FrameScheduler::new(&ctx, &config)?;
//!
//!     let vertices = allocator.allocate_buffer(&BufferDesc {
//!         size: 1024,
//!         usage: BufferUsage::VERTEX,
//!         location: MemoryLocation::HostVisible,
//!     })?;
//!     let indices = allocator.allocate_buffer(&BufferDesc {
//!         size: 256,
//!         usage: BufferUsage::INDEX,
//!         location: MemoryLocation::HostVisible,
//!     })?;
//!
//!     let key = PipelineKey::graphics(
//!         ShaderDesc::from_spirv(&shader_words()),
//!         ShaderDesc::from_spirv(&shader_words()),
//!         VertexLayout::empty(),
//!         BlendState::Opaque,
//!         DepthState::disabled(),
//!         ImageFormat::Bgra8Unorm,
//!     );
//!
//!     let mut list = DrawList::new([0.1, 0.1, 0.1, 1.0]);
//!     list.push(DrawOp::DrawIndexed {
//!         pipeline: key,
//!         vertex_buffer: vertices,
//!         index_buffer: indices,
//!         index_count: 36,
//!         first_index: 0,
//!         vertex_offset: 0,
//!         textures: Vec::new(),
//!         push: DrawPush::identity(),
//!     });
//!
//!     scheduler.render_frame(&mut allocator, &mut pipelines, &list)?;
//!     scheduler.drain(&mut allocator)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::too_many_arguments)]

pub mod alloc;
pub mod config;
pub mod device;
pub mod draw;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod recorder;
pub mod sync;

#[cfg(test)]
mod scheduler_tests;

pub use alloc::{AllocatorStats, BufferDesc, BufferHandle, ImageHandle, MappedView, ResourceAllocator};
pub use config::RendererConfig;
pub use device::{
    BufferUsage, DeviceContext, GpuDevice, ImageDesc, ImageFormat, ImageUsage, MemoryLocation,
};
pub use draw::{DrawList, DrawOp, DrawPush, ResourceRef};
pub use error::{RenderError, RenderResult};
pub use frame::{FrameReport, FrameScheduler, SchedulerState};
pub use pipeline::{
    BlendState, DepthState, PipelineCache, PipelineKey, ShaderDesc, VertexAttribute, VertexLayout,
};
pub use recorder::CommandRecorder;
pub use sync::SyncManager;

/// Common imports for embedders
pub mod prelude {
    pub use crate::alloc::{BufferDesc, BufferHandle, ImageHandle, ResourceAllocator};
    pub use crate::config::RendererConfig;
    pub use crate::device::{
        BufferUsage, DeviceContext, GpuDevice, ImageDesc, ImageFormat, ImageUsage, MemoryLocation,
    };
    pub use crate::draw::{DrawList, DrawOp, DrawPush, ResourceRef};
    pub use crate::error::{RenderError, RenderResult};
    pub use crate::frame::{FrameReport, FrameScheduler, SchedulerState};
    pub use crate::pipeline::{
        BlendState, DepthState, PipelineCache, PipelineKey, ShaderDesc, VertexLayout,
    };
}
