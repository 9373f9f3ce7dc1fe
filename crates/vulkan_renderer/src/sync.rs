//! Synchronization management
//!
//! Hides fences and semaphores behind two operations: `begin_frame`, the
//! single intended blocking point of the steady-state loop, and `submit`,
//! which enqueues work and returns immediately. Exactly one fence guards
//! exactly one frame slot; a slot is never re-recorded while its fence is
//! unsignaled. Cross-queue ordering (render vs. present) is expressed only
//! through semaphores, never assumed from call order.

use crate::device::{
    CommandBufferId, DeviceContext, FenceId, FenceStatus, SemaphoreId, StageMask,
    SubmissionRecord,
};
use crate::error::{RenderError, RenderResult};

/// Synchronization objects dedicated to one frame slot
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled by image acquisition, waited on by the submission
    pub image_available: SemaphoreId,
    /// Signaled when the slot's submission completes on the GPU
    pub in_flight: FenceId,
}

/// Issues and tracks the primitives that guarantee safe reuse of per-frame
/// resources
pub struct SyncManager {
    ctx: DeviceContext,
    frame_syncs: Vec<FrameSync>,
    render_finished: Vec<SemaphoreId>,
    submitted: Vec<Option<u64>>,
    fence_timeout_ns: u64,
    completed_generation: u64,
    frames_submitted: u64,
}

impl SyncManager {
    /// Create sync objects for `slots` frame slots plus one render-finished
    /// semaphore per swapchain image
    pub fn new(ctx: &DeviceContext, slots: usize, fence_timeout_ns: u64) -> RenderResult<Self> {
        log::debug!("creating SyncManager for {} slots", slots);
        let device = ctx.device();

        let mut manager = Self {
            ctx: ctx.clone(),
            frame_syncs: Vec::with_capacity(slots),
            render_finished: Vec::new(),
            submitted: vec![None; slots],
            fence_timeout_ns,
            completed_generation: 0,
            frames_submitted: 0,
        };

        for _ in 0..slots {
            let image_available = device.create_semaphore()?;
            let in_flight = match device.create_fence(false) {
                Ok(fence) => fence,
                Err(err) => {
                    device.destroy_semaphore(image_available);
                    return Err(err);
                }
            };
            manager.frame_syncs.push(FrameSync {
                image_available,
                in_flight,
            });
        }
        for _ in 0..device.swapchain_image_count() {
            manager.render_finished.push(device.create_semaphore()?);
        }
        Ok(manager)
    }

    /// Acquire the next presentable image, signaling the slot's
    /// image-available semaphore
    pub fn acquire(&self, slot: usize) -> RenderResult<u32> {
        self.ctx
            .device()
            .acquire_image(self.frame_syncs[slot].image_available)
    }

    /// Block until the slot's previous submission has fully completed.
    ///
    /// Returns the retired generation, or `None` if the slot had nothing in
    /// flight. A wait exceeding the configured timeout is a `DeviceTimeout`
    /// and is fatal, since it implies a lost or hung device.
    pub fn begin_frame(&mut self, slot: usize) -> RenderResult<Option<u64>> {
        let Some(generation) = self.submitted[slot] else {
            return Ok(None);
        };

        let fence = self.frame_syncs[slot].in_flight;
        match self
            .ctx
            .device()
            .wait_fence(fence, self.fence_timeout_ns)?
        {
            FenceStatus::Signaled => {}
            FenceStatus::TimedOut => {
                log::error!(
                    "fence wait for slot {} exceeded {}ns",
                    slot,
                    self.fence_timeout_ns
                );
                return Err(RenderError::DeviceTimeout);
            }
        }
        self.ctx.device().reset_fence(fence)?;
        self.submitted[slot] = None;
        self.completed_generation = self.completed_generation.max(generation);
        log::trace!("slot {} retired generation {}", slot, generation);
        Ok(Some(generation))
    }

    /// Enqueue the slot's recorded commands on the graphics queue.
    ///
    /// Waits on the slot's image-available semaphore at color output,
    /// signals the image's render-finished semaphore and the slot's fence.
    /// Returns immediately; only the next reuse of the same slot blocks.
    pub fn submit(
        &mut self,
        slot: usize,
        image_index: u32,
        command_buffer: CommandBufferId,
        generation: u64,
    ) -> RenderResult<()> {
        debug_assert!(
            self.submitted[slot].is_none(),
            "slot resubmitted while in flight"
        );
        let sync = self.frame_syncs[slot];
        let record = SubmissionRecord {
            command_buffer,
            waits: vec![(sync.image_available, StageMask::COLOR_OUTPUT)],
            signals: vec![self.render_finished[image_index as usize]],
            fence: sync.in_flight,
        };
        self.ctx.device().submit(&record)?;
        self.submitted[slot] = Some(generation);
        self.frames_submitted += 1;
        log::trace!(
            "submitted generation {} on slot {} (image {})",
            generation,
            slot,
            image_index
        );
        Ok(())
    }

    /// Queue presentation of a rendered image, gated on its render-finished
    /// semaphore
    pub fn present(&self, image_index: u32) -> RenderResult<()> {
        self.ctx
            .device()
            .present(image_index, self.render_finished[image_index as usize])
    }

    /// Wait for every in-flight slot, in generation order, and retire them.
    ///
    /// Used by coordinated shutdown; returns the retired generations.
    pub fn drain(&mut self) -> RenderResult<Vec<u64>> {
        let mut in_flight: Vec<usize> = (0..self.submitted.len())
            .filter(|&slot| self.submitted[slot].is_some())
            .collect();
        in_flight.sort_by_key(|&slot| self.submitted[slot]);

        let mut retired = Vec::with_capacity(in_flight.len());
        for slot in in_flight {
            if let Some(generation) = self.begin_frame(slot)? {
                retired.push(generation);
            }
        }
        Ok(retired)
    }

    /// Last generation confirmed complete on the GPU
    pub fn completed_generation(&self) -> u64 {
        self.completed_generation
    }

    /// Total submissions since creation
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Whether the slot has a submission in flight
    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.submitted[slot].is_some()
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.ctx.device().wait_idle()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        let device = self.ctx.device();
        for sync in &self.frame_syncs {
            device.destroy_semaphore(sync.image_available);
            device.destroy_fence(sync.in_flight);
        }
        for semaphore in &self.render_finished {
            device.destroy_semaphore(*semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::GpuDevice;
    use std::sync::Arc;

    fn setup() -> (Arc<HeadlessDevice>, SyncManager, CommandBufferId) {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = DeviceContext::new(device.clone());
        let sync = SyncManager::new(&ctx, 2, 1_000).unwrap();
        let commands = device.create_command_buffer().unwrap();
        (device, sync, commands)
    }

    #[test]
    fn fresh_slot_does_not_wait() {
        let (_, mut sync, _) = setup();
        assert_eq!(sync.begin_frame(0).unwrap(), None);
        assert_eq!(sync.begin_frame(1).unwrap(), None);
    }

    #[test]
    fn retire_advances_the_watermark() {
        let (device, mut sync, commands) = setup();
        sync.submit(0, 0, commands, 1).unwrap();
        assert!(sync.is_in_flight(0));

        device.complete_next_submission();
        assert_eq!(sync.begin_frame(0).unwrap(), Some(1));
        assert!(!sync.is_in_flight(0));
        assert_eq!(sync.completed_generation(), 1);
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let (_, mut sync, commands) = setup();
        sync.submit(0, 0, commands, 1).unwrap();
        assert!(matches!(
            sync.begin_frame(0),
            Err(RenderError::DeviceTimeout)
        ));
    }

    #[test]
    fn drain_retires_in_generation_order() {
        let (device, mut sync, commands) = setup();
        sync.submit(0, 0, commands, 1).unwrap();
        sync.submit(1, 1, commands, 2).unwrap();

        device.complete_all();
        assert_eq!(sync.drain().unwrap(), vec![1, 2]);
        assert_eq!(sync.completed_generation(), 2);
        assert_eq!(sync.frames_submitted(), 2);
    }
}
