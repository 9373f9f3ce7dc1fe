//! Headless software device
//!
//! A deterministic [`GpuDevice`] that backs memory blocks with host byte
//! arrays and models fences as flags the caller signals explicitly. It
//! exists so the allocator, cache, recorder, and scheduler can be exercised
//! end-to-end (backpressure, deferred frees, stale-surface recovery)
//! on machines with no GPU at all.
//!
//! Nothing here executes commands; encoded streams are retained verbatim
//! for inspection by tests.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use crate::draw::GpuCommand;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::PipelineKey;

use super::{
    BlockId, BufferUsage, CommandBufferId, FenceId, FenceStatus, GpuDevice, ImageDesc,
    MemoryFlags, MemoryProperties, MemoryRequirements, MemoryType, PipelineId, RawBufferId,
    RawImageId, SemaphoreId, SubmissionRecord,
};

const HOST_MEMORY_TYPE: u32 = 1;
const ALIGNMENT: u64 = 64;

struct HeadlessBlock {
    bytes: Box<[u8]>,
    host_visible: bool,
}

struct HeadlessBuffer {
    size: u64,
}

struct HeadlessImage {
    desc: ImageDesc,
}

struct Inner {
    next_id: u64,
    heap_remaining: u64,
    blocks: HashMap<u64, HeadlessBlock>,
    buffers: HashMap<u64, HeadlessBuffer>,
    images: HashMap<u64, HeadlessImage>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, ()>,
    command_buffers: HashMap<u64, Vec<GpuCommand>>,
    last_encoded: Vec<GpuCommand>,
    pipelines: HashMap<u64, PipelineKey>,
    submissions: VecDeque<u64>,
    next_image: u32,
    surface_stale: bool,
    stale_is_sticky: bool,
    device_lost: bool,
}

/// Software device for tests and CI
pub struct HeadlessDevice {
    inner: Mutex<Inner>,
    image_count: u32,
    extent: (u32, u32),
}

impl HeadlessDevice {
    /// Device with an effectively unbounded memory budget
    pub fn new() -> Self {
        Self::with_heap_budget(u64::MAX)
    }

    /// Device that fails block allocation once `budget` bytes are reserved
    pub fn with_heap_budget(budget: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                heap_remaining: budget,
                blocks: HashMap::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                last_encoded: Vec::new(),
                pipelines: HashMap::new(),
                submissions: VecDeque::new(),
                next_image: 0,
                surface_stale: false,
                stale_is_sticky: false,
                device_lost: false,
            }),
            image_count: 3,
            extent: (1280, 720),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("headless device state poisoned")
    }

    fn ensure_alive(inner: &Inner) -> RenderResult<()> {
        if inner.device_lost {
            Err(RenderError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Signal the fence of the oldest still-pending submission
    pub fn complete_next_submission(&self) {
        let mut inner = self.lock();
        if let Some(fence) = inner.submissions.pop_front() {
            inner.fences.insert(fence, true);
        }
    }

    /// Signal every pending submission's fence
    pub fn complete_all(&self) {
        let mut inner = self.lock();
        while let Some(fence) = inner.submissions.pop_front() {
            inner.fences.insert(fence, true);
        }
    }

    /// Make acquires and presents report a stale surface until the next
    /// `rebuild_surface`
    pub fn mark_surface_stale(&self) {
        self.lock().surface_stale = true;
    }

    /// Make the surface stale even across rebuilds (models a surface that
    /// keeps resizing faster than it can be recreated)
    pub fn mark_surface_stale_sticky(&self) {
        let mut inner = self.lock();
        inner.surface_stale = true;
        inner.stale_is_sticky = true;
    }

    /// Put the device into the lost state; every operation fails from here
    pub fn trigger_device_lost(&self) {
        self.lock().device_lost = true;
    }

    /// Number of live (not yet destroyed) buffer objects
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Number of live image objects
    pub fn live_images(&self) -> usize {
        self.lock().images.len()
    }

    /// Number of live memory blocks
    pub fn live_blocks(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Number of submissions whose fences have not been signaled
    pub fn pending_submissions(&self) -> usize {
        self.lock().submissions.len()
    }

    /// The stream most recently encoded into a command buffer
    pub fn encoded_commands(&self, commands: CommandBufferId) -> Vec<GpuCommand> {
        self.lock()
            .command_buffers
            .get(&commands.0)
            .cloned()
            .unwrap_or_default()
    }

    /// The stream of the most recent `encode` call, whichever command
    /// buffer it targeted
    pub fn last_encoded_stream(&self) -> Vec<GpuCommand> {
        self.lock().last_encoded.clone()
    }

    fn fresh_id(inner: &mut Inner) -> u64 {
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn memory_properties(&self) -> MemoryProperties {
        MemoryProperties {
            types: vec![
                MemoryType {
                    flags: MemoryFlags::DEVICE_LOCAL,
                },
                MemoryType {
                    flags: MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT,
                },
            ],
        }
    }

    fn swapchain_image_count(&self) -> u32 {
        self.image_count
    }

    fn surface_extent(&self) -> (u32, u32) {
        self.extent
    }

    fn allocate_block(&self, memory_type: u32, size: u64) -> RenderResult<BlockId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        if inner.heap_remaining < size {
            return Err(RenderError::OutOfMemory { requested: size });
        }
        inner.heap_remaining -= size;
        let id = Self::fresh_id(&mut inner);
        inner.blocks.insert(
            id,
            HeadlessBlock {
                bytes: vec![0u8; size as usize].into_boxed_slice(),
                host_visible: memory_type == HOST_MEMORY_TYPE,
            },
        );
        Ok(BlockId(id))
    }

    fn free_block(&self, block: BlockId) {
        let mut inner = self.lock();
        if let Some(freed) = inner.blocks.remove(&block.0) {
            inner.heap_remaining = inner.heap_remaining.saturating_add(freed.bytes.len() as u64);
        }
    }

    fn block_mapped_ptr(&self, block: BlockId) -> Option<NonNull<u8>> {
        let mut inner = self.lock();
        let block = inner.blocks.get_mut(&block.0)?;
        if !block.host_visible {
            return None;
        }
        NonNull::new(block.bytes.as_mut_ptr())
    }

    fn create_buffer(&self, size: u64, _usage: BufferUsage) -> RenderResult<RawBufferId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.buffers.insert(id, HeadlessBuffer { size });
        Ok(RawBufferId(id))
    }

    fn buffer_requirements(&self, buffer: RawBufferId) -> MemoryRequirements {
        let inner = self.lock();
        let size = inner.buffers.get(&buffer.0).map_or(0, |b| b.size);
        MemoryRequirements {
            size,
            alignment: ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    fn bind_buffer(&self, buffer: RawBufferId, block: BlockId, offset: u64) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let block_len = inner
            .blocks
            .get(&block.0)
            .map(|b| b.bytes.len() as u64)
            .ok_or(RenderError::InvalidUsage {
                reason: "binding to an unknown block".to_string(),
            })?;
        let entry = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or(RenderError::InvalidUsage {
                reason: "binding an unknown buffer".to_string(),
            })?;
        debug_assert!(offset + entry.size <= block_len, "bind range overflows block");
        Ok(())
    }

    fn destroy_buffer(&self, buffer: RawBufferId) {
        self.lock().buffers.remove(&buffer.0);
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<RawImageId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.images.insert(
            id,
            HeadlessImage { desc: desc.clone() },
        );
        Ok(RawImageId(id))
    }

    fn image_requirements(&self, image: RawImageId) -> MemoryRequirements {
        let inner = self.lock();
        let size = inner.images.get(&image.0).map_or(0, |i| {
            u64::from(i.desc.width) * u64::from(i.desc.height) * i.desc.format.texel_size()
        });
        MemoryRequirements {
            size,
            alignment: ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    fn bind_image(&self, image: RawImageId, _block: BlockId, _offset: u64) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        if !inner.images.contains_key(&image.0) {
            return Err(RenderError::InvalidUsage {
                reason: "binding an unknown image".to_string(),
            });
        }
        Ok(())
    }

    fn destroy_image(&self, image: RawImageId) {
        self.lock().images.remove(&image.0);
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<FenceId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.fences.insert(id, signaled);
        Ok(FenceId(id))
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.lock().fences.remove(&fence.0);
    }

    fn wait_fence(&self, fence: FenceId, _timeout_ns: u64) -> RenderResult<FenceStatus> {
        let inner = self.lock();
        Self::ensure_alive(&inner)?;
        // fences only advance through explicit test signals, so an
        // unsignaled fence reports timeout immediately
        match inner.fences.get(&fence.0) {
            Some(true) => Ok(FenceStatus::Signaled),
            Some(false) => Ok(FenceStatus::TimedOut),
            None => Err(RenderError::InvalidUsage {
                reason: "waiting on an unknown fence".to_string(),
            }),
        }
    }

    fn reset_fence(&self, fence: FenceId) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        inner.fences.insert(fence.0, false);
        Ok(())
    }

    fn create_semaphore(&self) -> RenderResult<SemaphoreId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.semaphores.insert(id, ());
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.lock().semaphores.remove(&semaphore.0);
    }

    fn create_command_buffer(&self) -> RenderResult<CommandBufferId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.command_buffers.insert(id, Vec::new());
        Ok(CommandBufferId(id))
    }

    fn destroy_command_buffer(&self, commands: CommandBufferId) {
        self.lock().command_buffers.remove(&commands.0);
    }

    fn encode(&self, commands: CommandBufferId, stream: &[GpuCommand]) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let Some(slot) = inner.command_buffers.get_mut(&commands.0) else {
            return Err(RenderError::InvalidUsage {
                reason: "encoding into an unknown command buffer".to_string(),
            });
        };
        *slot = stream.to_vec();
        inner.last_encoded = stream.to_vec();
        Ok(())
    }

    fn submit(&self, submission: &SubmissionRecord) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        debug_assert!(
            inner.command_buffers.contains_key(&submission.command_buffer.0),
            "submitting an unknown command buffer"
        );
        inner.submissions.push_back(submission.fence.0);
        Ok(())
    }

    fn acquire_image(&self, _signal: SemaphoreId) -> RenderResult<u32> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        if inner.surface_stale {
            return Err(RenderError::SurfaceStale);
        }
        let index = inner.next_image;
        inner.next_image = (inner.next_image + 1) % self.image_count;
        Ok(index)
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreId) -> RenderResult<()> {
        let inner = self.lock();
        Self::ensure_alive(&inner)?;
        if inner.surface_stale {
            return Err(RenderError::SurfaceStale);
        }
        Ok(())
    }

    fn rebuild_surface(&self) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        if !inner.stale_is_sticky {
            inner.surface_stale = false;
        }
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        while let Some(fence) = inner.submissions.pop_front() {
            inner.fences.insert(fence, true);
        }
        Ok(())
    }

    fn create_pipeline(&self, key: &PipelineKey) -> RenderResult<PipelineId> {
        let mut inner = self.lock();
        Self::ensure_alive(&inner)?;
        let id = Self::fresh_id(&mut inner);
        inner.pipelines.insert(id, key.clone());
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.lock().pipelines.remove(&pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryLocation;

    #[test]
    fn host_blocks_are_mapped_device_blocks_are_not() {
        let device = HeadlessDevice::new();
        let host = device.allocate_block(HOST_MEMORY_TYPE, 128).unwrap();
        let local = device.allocate_block(0, 128).unwrap();
        assert!(device.block_mapped_ptr(host).is_some());
        assert!(device.block_mapped_ptr(local).is_none());
    }

    #[test]
    fn heap_budget_is_enforced_and_returned() {
        let device = HeadlessDevice::with_heap_budget(256);
        let block = device.allocate_block(0, 200).unwrap();
        assert!(matches!(
            device.allocate_block(0, 100),
            Err(RenderError::OutOfMemory { .. })
        ));
        device.free_block(block);
        assert!(device.allocate_block(0, 100).is_ok());
    }

    #[test]
    fn memory_types_cover_both_locations() {
        let device = HeadlessDevice::new();
        let properties = device.memory_properties();
        assert!(properties.supports(MemoryLocation::DeviceLocal.required_flags()));
        assert!(properties.supports(MemoryLocation::HostVisible.required_flags()));
    }

    #[test]
    fn device_loss_poisons_operations() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        device.trigger_device_lost();
        assert!(matches!(
            device.wait_fence(fence, 1),
            Err(RenderError::DeviceLost)
        ));
        assert!(matches!(
            device.create_semaphore(),
            Err(RenderError::DeviceLost)
        ));
    }
}
