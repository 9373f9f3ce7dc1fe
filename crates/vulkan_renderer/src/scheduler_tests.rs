//! End-to-end tests for the frame loop
//!
//! Drives allocator, pipeline cache, recorder, and scheduler together over
//! the headless device, validating the engine-level properties that no
//! single component test can: backpressure, deferred frees across real
//! frames, surface recovery, and fatal-condition handling.

use std::sync::{Arc, Mutex};

use crate::alloc::{BufferDesc, ResourceAllocator};
use crate::config::RendererConfig;
use crate::device::headless::HeadlessDevice;
use crate::device::{BufferUsage, DeviceContext, ImageFormat, MemoryLocation};
use crate::draw::{DrawList, DrawOp, DrawPush, GpuCommand};
use crate::error::RenderError;
use crate::frame::{FrameScheduler, SchedulerState};
use crate::pipeline::{BlendState, DepthState, PipelineCache, PipelineKey, ShaderDesc, VertexLayout};

struct Harness {
    device: Arc<HeadlessDevice>,
    allocator: ResourceAllocator,
    pipelines: PipelineCache,
    scheduler: FrameScheduler,
}

fn harness_with(config: RendererConfig) -> Harness {
    crate::logging::init_for_tests();
    let device = Arc::new(HeadlessDevice::new());
    let ctx = DeviceContext::new(device.clone());
    Harness {
        device,
        allocator: ResourceAllocator::new(&ctx, &config),
        pipelines: PipelineCache::new(&ctx, config.pipeline_evict_after_frames),
        scheduler: FrameScheduler::new(&ctx, &config).expect("scheduler construction"),
    }
}

fn harness() -> Harness {
    harness_with(RendererConfig::default())
}

impl Harness {
    fn render(&mut self, list: &DrawList) -> crate::error::RenderResult<crate::frame::FrameReport> {
        self.scheduler
            .render_frame(&mut self.allocator, &mut self.pipelines, list)
    }
}

fn simple_draw_list(harness: &mut Harness) -> DrawList {
    let vertices = harness
        .allocator
        .allocate_buffer(&BufferDesc {
            size: 1024,
            usage: BufferUsage::VERTEX,
            location: MemoryLocation::DeviceLocal,
        })
        .unwrap();
    let indices = harness
        .allocator
        .allocate_buffer(&BufferDesc {
            size: 256,
            usage: BufferUsage::INDEX,
            location: MemoryLocation::DeviceLocal,
        })
        .unwrap();
    let key = PipelineKey::graphics(
        ShaderDesc::from_spirv(&[11, 12, 13]),
        ShaderDesc::from_spirv(&[21, 22, 23]),
        VertexLayout::empty(),
        BlendState::Opaque,
        DepthState::disabled(),
        ImageFormat::Bgra8Unorm,
    );
    let mut list = DrawList::new([0.2, 0.3, 0.8, 1.0]);
    list.push(DrawOp::DrawIndexed {
        pipeline: key,
        vertex_buffer: vertices,
        index_buffer: indices,
        index_count: 36,
        first_index: 0,
        vertex_offset: 0,
        textures: Vec::new(),
        push: DrawPush::identity(),
    });
    list
}

#[test]
fn backpressure_blocks_at_the_third_frame() {
    let mut config = RendererConfig::default();
    config.frames_in_flight = 2;
    let mut harness = harness_with(config);

    let lost = Arc::new(Mutex::new(0u32));
    let lost_count = Arc::clone(&lost);
    harness
        .scheduler
        .set_on_device_lost(Box::new(move || *lost_count.lock().unwrap() += 1));

    let list = DrawList::default();
    // no fence ever signals: both slots fill without blocking
    assert!(harness.render(&list).is_ok());
    assert!(harness.render(&list).is_ok());

    // the third frame reuses slot 0 and must block on its fence, which
    // never signals; the bounded wait reports a hung device
    assert!(matches!(
        harness.render(&list),
        Err(RenderError::DeviceTimeout)
    ));
    assert_eq!(harness.scheduler.state(), SchedulerState::Lost);
    assert_eq!(*lost.lock().unwrap(), 1);

    // poisoned: everything afterwards reports device loss
    assert!(matches!(harness.render(&list), Err(RenderError::DeviceLost)));
    assert_eq!(*lost.lock().unwrap(), 1);
}

#[test]
fn steady_state_pipelines_frames_and_notifies() {
    let mut harness = harness();

    let retired = Arc::new(Mutex::new(Vec::new()));
    let retired_sink = Arc::clone(&retired);
    harness
        .scheduler
        .set_on_frame_complete(Box::new(move |generation| {
            retired_sink.lock().unwrap().push(generation)
        }));

    let list = simple_draw_list(&mut harness);
    for expected_generation in 1..=4u64 {
        let report = harness.render(&list).unwrap();
        assert_eq!(report.generation, expected_generation);
        harness.device.complete_all();
    }

    assert_eq!(harness.scheduler.total_frames(), 4);
    // with two slots, generations 1 and 2 retired when frames 3 and 4
    // reused their slots
    assert_eq!(*retired.lock().unwrap(), vec![1, 2]);
    assert_eq!(harness.scheduler.completed_generation(), 2);
}

#[test]
fn recorded_frame_reaches_the_device() {
    let mut harness = harness();
    let list = simple_draw_list(&mut harness);
    harness.render(&list).unwrap();

    let stream = harness.device.last_encoded_stream();
    assert!(matches!(
        stream.first(),
        Some(GpuCommand::BeginPass { clear: Some(_), .. })
    ));
    assert!(matches!(stream.last(), Some(GpuCommand::EndPass)));
    assert!(stream
        .iter()
        .any(|command| matches!(command, GpuCommand::DrawIndexed { index_count: 36, .. })));
    assert_eq!(harness.device.pending_submissions(), 1);
}

#[test]
fn frees_wait_for_the_frames_that_used_them() {
    let mut harness = harness();

    let buffer = harness
        .allocator
        .allocate_buffer(&BufferDesc {
            size: 256,
            usage: BufferUsage::UNIFORM,
            location: MemoryLocation::HostVisible,
        })
        .unwrap();
    let pattern = [0x5Au8; 256];
    harness
        .allocator
        .map(buffer)
        .unwrap()
        .copy_from_slice(&pattern);
    harness.allocator.free_buffer(buffer).unwrap();

    // the buffer existed during generation 1, which has not completed
    assert_eq!(harness.device.live_buffers(), 1);

    let list = DrawList::default();
    harness.render(&list).unwrap(); // generation 1
    harness.device.complete_all();
    harness.render(&list).unwrap(); // generation 2, fresh slot, nothing retired
    assert_eq!(harness.device.live_buffers(), 1);

    harness.device.complete_all();
    harness.render(&list).unwrap(); // generation 3 retires generation 1
    assert_eq!(harness.device.live_buffers(), 0);
    assert_eq!(harness.allocator.stats().pending_releases, 0);
}

#[test]
fn stale_surface_is_rebuilt_and_retried() {
    let mut harness = harness();
    harness.device.mark_surface_stale();

    let report = harness.render(&DrawList::default()).unwrap();
    assert!(report.surface_rebuilt);
    assert_eq!(harness.scheduler.state(), SchedulerState::Idle);

    // recovered: the next frame proceeds without rebuilding
    harness.device.complete_all();
    let report = harness.render(&DrawList::default()).unwrap();
    assert!(!report.surface_rebuilt);
}

#[test]
fn persistently_stale_surface_gives_up_after_bounded_retries() {
    let mut harness = harness();
    harness.device.mark_surface_stale_sticky();

    assert!(matches!(
        harness.render(&DrawList::default()),
        Err(RenderError::SurfaceStale)
    ));
    // recoverable by the embedder; the scheduler is not poisoned
    assert_eq!(harness.scheduler.state(), SchedulerState::Idle);
}

#[test]
fn device_loss_poisons_the_scheduler() {
    let mut harness = harness();
    let lost = Arc::new(Mutex::new(false));
    let lost_flag = Arc::clone(&lost);
    harness
        .scheduler
        .set_on_device_lost(Box::new(move || *lost_flag.lock().unwrap() = true));

    harness.device.trigger_device_lost();
    assert!(matches!(
        harness.render(&DrawList::default()),
        Err(RenderError::DeviceLost)
    ));
    assert_eq!(harness.scheduler.state(), SchedulerState::Lost);
    assert!(*lost.lock().unwrap());

    assert!(matches!(
        harness.scheduler.drain(&mut harness.allocator),
        Err(RenderError::DeviceLost)
    ));
}

#[test]
fn drain_retires_everything_in_flight() {
    let mut harness = harness();
    let retired = Arc::new(Mutex::new(Vec::new()));
    let retired_sink = Arc::clone(&retired);
    harness
        .scheduler
        .set_on_frame_complete(Box::new(move |generation| {
            retired_sink.lock().unwrap().push(generation)
        }));

    let list = DrawList::default();
    harness.render(&list).unwrap();
    harness.render(&list).unwrap();

    let buffer = harness
        .allocator
        .allocate_buffer(&BufferDesc {
            size: 64,
            usage: BufferUsage::UNIFORM,
            location: MemoryLocation::HostVisible,
        })
        .unwrap();
    harness.allocator.free_buffer(buffer).unwrap();

    harness.device.complete_all();
    harness.scheduler.drain(&mut harness.allocator).unwrap();

    assert_eq!(*retired.lock().unwrap(), vec![1, 2]);
    assert_eq!(harness.allocator.stats().pending_releases, 0);
}

#[test]
fn frames_in_flight_is_clamped_to_supported_depth() {
    let mut config = RendererConfig::default();
    config.frames_in_flight = 8;
    let harness = harness_with(config);
    assert_eq!(harness.scheduler.frames_in_flight(), 3);
}

#[test]
fn image_indices_rotate_through_the_swapchain() {
    let mut harness = harness();
    let list = DrawList::default();
    let mut indices = Vec::new();
    for _ in 0..4 {
        indices.push(harness.render(&list).unwrap().image_index);
        harness.device.complete_all();
    }
    // headless swapchain has three images
    assert_eq!(indices, vec![0, 1, 2, 0]);
}
