//! Frame scheduling
//!
//! Drives one logical frame through `Idle → Acquiring → Recording →
//! Submitted → Presenting → Idle`, selecting frame slots round-robin. The
//! wait in `begin_frame` on the reused slot's fence is the only intended
//! blocking point of the steady-state loop, which bounds the CPU to at most
//! N-1 frames ahead of the GPU by construction.
//!
//! A stale surface enters a bounded `Recreating` retry; device loss or a
//! fence timeout is fatal, moves the scheduler to a terminal `Lost` state,
//! and fires the device-lost notification; the caller's only valid
//! response is full re-initialization of the device context.

use crate::alloc::ResourceAllocator;
use crate::config::RendererConfig;
use crate::device::{CommandBufferId, DeviceContext};
use crate::draw::DrawList;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::PipelineCache;
use crate::recorder::CommandRecorder;
use crate::sync::SyncManager;

/// One of the N pipelined frame contexts.
///
/// Allocated at startup, reused every N-th frame, never individually
/// destroyed until shutdown. The generation records the last frame
/// submitted through this slot.
struct FrameSlot {
    command_buffer: CommandBufferId,
    generation: u64,
}

/// Scheduler position within the per-frame state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Between frames
    Idle,
    /// Waiting for a presentable image
    Acquiring,
    /// Rebuilding presentation-dependent resources after a stale surface
    Recreating,
    /// Recording the frame's commands (may block on the slot fence)
    Recording,
    /// Commands handed to the graphics queue
    Submitted,
    /// Presentation requested
    Presenting,
    /// Fatal condition observed; every further call fails
    Lost,
}

/// Per-frame outcome returned to the embedder
#[derive(Debug, Clone, Copy)]
pub struct FrameReport {
    /// Generation assigned to this frame's submission
    pub generation: u64,
    /// Swapchain image the frame rendered to
    pub image_index: u32,
    /// Generation retired while beginning this frame, if any
    pub retired: Option<u64>,
    /// Whether the surface was rebuilt during this frame
    pub surface_rebuilt: bool,
}

type FrameCompleteFn = Box<dyn FnMut(u64) + Send>;
type DeviceLostFn = Box<dyn FnMut() + Send>;

/// Orchestrates slots, synchronization, recording, submission, and
/// presentation for every logical frame
pub struct FrameScheduler {
    ctx: DeviceContext,
    sync: SyncManager,
    recorder: CommandRecorder,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    state: SchedulerState,
    next_generation: u64,
    total_frames: u64,
    max_surface_retries: u32,
    on_frame_complete: Option<FrameCompleteFn>,
    on_device_lost: Option<DeviceLostFn>,
}

impl FrameScheduler {
    /// Create a scheduler with `config.frames_in_flight` slots
    pub fn new(ctx: &DeviceContext, config: &RendererConfig) -> RenderResult<Self> {
        let frames_in_flight = config.clamped_frames_in_flight();
        if frames_in_flight != config.frames_in_flight {
            log::warn!(
                "frames_in_flight {} clamped to {}",
                config.frames_in_flight,
                frames_in_flight
            );
        }
        log::debug!("creating FrameScheduler with {} slots", frames_in_flight);

        let sync = SyncManager::new(ctx, frames_in_flight, config.fence_timeout_ns)?;
        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match ctx.device().create_command_buffer() {
                Ok(command_buffer) => slots.push(FrameSlot {
                    command_buffer,
                    generation: 0,
                }),
                Err(err) => {
                    for slot in &slots {
                        ctx.device().destroy_command_buffer(slot.command_buffer);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            ctx: ctx.clone(),
            sync,
            recorder: CommandRecorder::new(),
            slots,
            current_slot: 0,
            state: SchedulerState::Idle,
            next_generation: 1,
            total_frames: 0,
            max_surface_retries: config.max_surface_retries,
            on_frame_complete: None,
            on_device_lost: None,
        })
    }

    /// Execute one logical frame: acquire a target image, wait for the
    /// reused slot's prior submission, record the draw list, submit, and
    /// present.
    ///
    /// Surface staleness is retried internally through the `Recreating`
    /// path; allocation and recording errors are returned without
    /// corrupting scheduler state; fatal conditions poison the scheduler.
    pub fn render_frame(
        &mut self,
        allocator: &mut ResourceAllocator,
        pipelines: &mut PipelineCache,
        list: &DrawList,
    ) -> RenderResult<FrameReport> {
        if self.state == SchedulerState::Lost {
            return Err(RenderError::DeviceLost);
        }

        let generation = self.next_generation;
        let slot = self.current_slot;
        allocator.set_generation(generation);

        self.state = SchedulerState::Acquiring;
        let mut surface_rebuilt = false;
        let mut attempts = 0;
        let image_index = loop {
            match self.sync.acquire(slot) {
                Ok(index) => break index,
                Err(RenderError::SurfaceStale) => {
                    self.state = SchedulerState::Recreating;
                    if attempts >= self.max_surface_retries {
                        return Err(self.fail(RenderError::SurfaceStale));
                    }
                    attempts += 1;
                    log::warn!("stale surface during acquire, rebuilding (attempt {attempts})");
                    if let Err(err) = self.ctx.device().rebuild_surface() {
                        return Err(self.fail(err));
                    }
                    surface_rebuilt = true;
                    self.state = SchedulerState::Acquiring;
                }
                Err(err) => return Err(self.fail(err)),
            }
        };

        self.state = SchedulerState::Recording;
        let retired = match self.sync.begin_frame(slot) {
            Ok(retired) => retired,
            Err(err) => return Err(self.fail(err)),
        };
        if let Some(retired_generation) = retired {
            allocator.collect(retired_generation);
            pipelines.maintain(generation, self.sync.completed_generation());
            if let Some(callback) = &mut self.on_frame_complete {
                callback(retired_generation);
            }
        }

        let commands =
            match self
                .recorder
                .record(allocator, pipelines, generation, image_index, list)
            {
                Ok(commands) => commands,
                Err(err) => return Err(self.fail(err)),
            };
        let command_buffer = self.slots[slot].command_buffer;
        if let Err(err) = self.ctx.device().encode(command_buffer, &commands) {
            return Err(self.fail(err));
        }

        self.state = SchedulerState::Submitted;
        self.slots[slot].generation = generation;
        if let Err(err) = self.sync.submit(slot, image_index, command_buffer, generation) {
            return Err(self.fail(err));
        }

        self.state = SchedulerState::Presenting;
        match self.sync.present(image_index) {
            Ok(()) => {}
            Err(RenderError::SurfaceStale) => {
                // the frame rendered; rebuild so the next acquire succeeds
                log::warn!("stale surface during present, rebuilding");
                if let Err(err) = self.ctx.device().rebuild_surface() {
                    return Err(self.fail(err));
                }
                surface_rebuilt = true;
            }
            Err(err) => return Err(self.fail(err)),
        }

        self.current_slot = (slot + 1) % self.slots.len();
        self.next_generation += 1;
        self.total_frames += 1;
        self.state = SchedulerState::Idle;
        log::trace!("frame {} complete (image {})", generation, image_index);
        Ok(FrameReport {
            generation,
            image_index,
            retired,
            surface_rebuilt,
        })
    }

    /// Coordinated shutdown: wait for every in-flight slot's fence, retire
    /// their generations, and release every deferred free
    pub fn drain(&mut self, allocator: &mut ResourceAllocator) -> RenderResult<()> {
        if self.state == SchedulerState::Lost {
            return Err(RenderError::DeviceLost);
        }
        log::debug!("draining {} in-flight frames", self.slots.len());
        let retired = match self.sync.drain() {
            Ok(retired) => retired,
            Err(err) => return Err(self.fail(err)),
        };
        allocator.collect(self.sync.completed_generation());
        for generation in retired {
            if let Some(callback) = &mut self.on_frame_complete {
                callback(generation);
            }
        }
        self.state = SchedulerState::Idle;
        Ok(())
    }

    /// Register the frame-completion notification (receives the retired
    /// generation; used for CPU-side bookkeeping)
    pub fn set_on_frame_complete(&mut self, callback: FrameCompleteFn) {
        self.on_frame_complete = Some(callback);
    }

    /// Register the fatal-device-loss notification
    pub fn set_on_device_lost(&mut self, callback: DeviceLostFn) {
        self.on_device_lost = Some(callback);
    }

    /// Current state-machine position
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Frames successfully completed since creation
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Last generation confirmed complete on the GPU
    pub fn completed_generation(&self) -> u64 {
        self.sync.completed_generation()
    }

    /// Route an error: fatal conditions poison the scheduler and fire the
    /// device-lost notification, everything else returns it to `Idle`
    fn fail(&mut self, err: RenderError) -> RenderError {
        if err.is_fatal() {
            log::error!("fatal device condition: {err}");
            self.state = SchedulerState::Lost;
            if let Some(callback) = &mut self.on_device_lost {
                callback();
            }
        } else {
            self.state = SchedulerState::Idle;
        }
        err
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        for slot in &self.slots {
            self.ctx.device().destroy_command_buffer(slot.command_buffer);
        }
    }
}
