//! Command recording
//!
//! Lowers a declarative [`DrawList`](crate::draw::DrawList) into one linear
//! [`GpuCommand`] stream. Barrier placement is the correctness-critical
//! algorithm here: for every resource touched, the recorder tracks its last
//! known (stage, access, layout) within the recording pass and, on a
//! conflicting next access, emits a transition from last-known to required
//! state before the operation. Compatible read-after-read accesses merge
//! their scopes without a barrier.

use std::collections::HashMap;

use crate::alloc::{BufferHandle, ImageHandle, ResourceAllocator};
use crate::device::{
    AccessMask, BufferUsage, ImageLayout, ImageUsage, PipelineId, StageMask,
};
use crate::draw::{
    BarrierDesc, DrawList, DrawOp, DrawPush, GpuCommand, RawResource, ResourceRef,
};
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{PipelineCache, PipelineKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TrackKey {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

#[derive(Debug, Clone, Copy)]
struct ResourceState {
    stage: StageMask,
    access: AccessMask,
    layout: ImageLayout,
}

/// Builds ordered GPU command sequences from a frame's draw list
pub struct CommandRecorder {
    states: HashMap<TrackKey, ResourceState>,
}

impl CommandRecorder {
    /// Create a recorder; the tracking table is reused across frames
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Lower `list` into a linear command stream targeting the given
    /// swapchain image.
    ///
    /// Every referenced resource is stamped with `generation` so the
    /// allocator can defer physical frees past this frame's completion.
    /// Fails with `InvalidDrawList` when an operation references a stale
    /// handle, a mismatched pipeline bind point, or a resource whose
    /// declared usage does not cover the access; a failed recording leaves
    /// no state behind.
    pub fn record(
        &mut self,
        allocator: &mut ResourceAllocator,
        pipelines: &mut PipelineCache,
        generation: u64,
        image_index: u32,
        list: &DrawList,
    ) -> RenderResult<Vec<GpuCommand>> {
        self.states.clear();
        let mut out = Vec::with_capacity(list.len() * 6 + 2);
        let mut in_pass = false;
        let mut pass_opened = false;
        let mut bound: Option<PipelineId> = None;

        for op in &list.ops {
            match op {
                DrawOp::DrawIndexed {
                    pipeline,
                    vertex_buffer,
                    index_buffer,
                    index_count,
                    first_index,
                    vertex_offset,
                    textures,
                    push,
                } => {
                    self.lower_draw(
                        allocator,
                        pipelines,
                        generation,
                        image_index,
                        list.clear_color,
                        &mut out,
                        &mut in_pass,
                        &mut pass_opened,
                        &mut bound,
                        pipeline,
                        *vertex_buffer,
                        *index_buffer,
                        textures,
                        push,
                        GpuCommand::DrawIndexed {
                            index_count: *index_count,
                            instance_count: 1,
                            first_index: *first_index,
                            vertex_offset: *vertex_offset,
                            first_instance: 0,
                        },
                    )?;
                }
                DrawOp::DrawInstanced {
                    pipeline,
                    vertex_buffer,
                    index_buffer,
                    index_count,
                    instance_count,
                    textures,
                    push,
                } => {
                    self.lower_draw(
                        allocator,
                        pipelines,
                        generation,
                        image_index,
                        list.clear_color,
                        &mut out,
                        &mut in_pass,
                        &mut pass_opened,
                        &mut bound,
                        pipeline,
                        *vertex_buffer,
                        *index_buffer,
                        textures,
                        push,
                        GpuCommand::DrawIndexed {
                            index_count: *index_count,
                            instance_count: *instance_count,
                            first_index: 0,
                            vertex_offset: 0,
                            first_instance: 0,
                        },
                    )?;
                }
                DrawOp::DispatchCompute {
                    pipeline,
                    reads,
                    writes,
                    groups,
                } => {
                    if !pipeline.is_compute() {
                        return Err(invalid("graphics pipeline used for a compute dispatch"));
                    }
                    let pso = pipelines.get_or_create(pipeline, generation)?;

                    let mut barriers = Vec::new();
                    let mut storage = Vec::with_capacity(reads.len() + writes.len());
                    for reference in reads {
                        let raw = self.touch_compute(
                            allocator,
                            generation,
                            &mut barriers,
                            *reference,
                            AccessMask::SHADER_READ,
                        )?;
                        storage.push(raw);
                    }
                    for reference in writes {
                        let raw = self.touch_compute(
                            allocator,
                            generation,
                            &mut barriers,
                            *reference,
                            AccessMask::SHADER_WRITE,
                        )?;
                        storage.push(raw);
                    }

                    // dispatches execute outside the rendering pass
                    if in_pass {
                        out.push(GpuCommand::EndPass);
                        in_pass = false;
                    }
                    out.extend(barriers.into_iter().map(GpuCommand::Barrier));
                    if bound != Some(pso.id()) {
                        out.push(GpuCommand::BindPipeline(pso.id()));
                        bound = Some(pso.id());
                    }
                    if !storage.is_empty() {
                        out.push(GpuCommand::BindStorage(storage));
                    }
                    out.push(GpuCommand::Dispatch { groups: *groups });
                }
            }
        }

        // a frame with no draw work still clears its target
        if !pass_opened {
            out.push(GpuCommand::BeginPass {
                image_index,
                clear: Some(list.clear_color),
            });
            in_pass = true;
        }
        if in_pass {
            out.push(GpuCommand::EndPass);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_draw(
        &mut self,
        allocator: &mut ResourceAllocator,
        pipelines: &mut PipelineCache,
        generation: u64,
        image_index: u32,
        clear_color: [f32; 4],
        out: &mut Vec<GpuCommand>,
        in_pass: &mut bool,
        pass_opened: &mut bool,
        bound: &mut Option<PipelineId>,
        pipeline: &PipelineKey,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        textures: &[ImageHandle],
        push: &DrawPush,
        draw: GpuCommand,
    ) -> RenderResult<()> {
        if pipeline.is_compute() {
            return Err(invalid("compute pipeline used for a draw"));
        }
        let pso = pipelines.get_or_create(pipeline, generation)?;

        let (vertex_raw, vertex_usage) = allocator
            .resolve_buffer(vertex_buffer, generation)
            .ok_or_else(|| invalid("unknown vertex buffer handle"))?;
        if !vertex_usage.contains(BufferUsage::VERTEX) {
            return Err(invalid("vertex buffer lacks VERTEX usage"));
        }
        let (index_raw, index_usage) = allocator
            .resolve_buffer(index_buffer, generation)
            .ok_or_else(|| invalid("unknown index buffer handle"))?;
        if !index_usage.contains(BufferUsage::INDEX) {
            return Err(invalid("index buffer lacks INDEX usage"));
        }

        let mut barriers = Vec::new();
        self.touch(
            &mut barriers,
            TrackKey::Buffer(vertex_buffer),
            RawResource::Buffer(vertex_raw),
            StageMask::VERTEX_INPUT,
            AccessMask::VERTEX_READ,
            ImageLayout::Undefined,
            None,
        );
        self.touch(
            &mut barriers,
            TrackKey::Buffer(index_buffer),
            RawResource::Buffer(index_raw),
            StageMask::VERTEX_INPUT,
            AccessMask::INDEX_READ,
            ImageLayout::Undefined,
            None,
        );
        let mut texture_raws = Vec::with_capacity(textures.len());
        for &texture in textures {
            let (raw, layout, usage) = allocator
                .resolve_image(texture, generation)
                .ok_or_else(|| invalid("unknown texture handle"))?;
            if !usage.contains(ImageUsage::SAMPLED) {
                return Err(invalid("texture lacks SAMPLED usage"));
            }
            self.touch(
                &mut barriers,
                TrackKey::Image(texture),
                RawResource::Image(raw),
                StageMask::FRAGMENT_SHADER,
                AccessMask::SHADER_READ,
                ImageLayout::ShaderReadOnly,
                Some((&mut *allocator, texture, layout)),
            );
            texture_raws.push(raw);
        }

        // transitions are recorded outside the rendering pass
        if !barriers.is_empty() && *in_pass {
            out.push(GpuCommand::EndPass);
            *in_pass = false;
        }
        out.extend(barriers.into_iter().map(GpuCommand::Barrier));
        if !*in_pass {
            out.push(GpuCommand::BeginPass {
                image_index,
                clear: if *pass_opened {
                    None
                } else {
                    Some(clear_color)
                },
            });
            *in_pass = true;
            *pass_opened = true;
        }

        if *bound != Some(pso.id()) {
            out.push(GpuCommand::BindPipeline(pso.id()));
            *bound = Some(pso.id());
        }
        if !texture_raws.is_empty() {
            out.push(GpuCommand::BindTextures(texture_raws));
        }
        out.push(GpuCommand::BindVertexBuffer(vertex_raw));
        out.push(GpuCommand::BindIndexBuffer(index_raw));
        out.push(GpuCommand::PushConstants(*push));
        out.push(draw);
        Ok(())
    }

    /// Resolve a compute-referenced resource and record its access
    fn touch_compute(
        &mut self,
        allocator: &mut ResourceAllocator,
        generation: u64,
        barriers: &mut Vec<BarrierDesc>,
        reference: ResourceRef,
        access: AccessMask,
    ) -> RenderResult<RawResource> {
        match reference {
            ResourceRef::Buffer(handle) => {
                let (raw, usage) = allocator
                    .resolve_buffer(handle, generation)
                    .ok_or_else(|| invalid("unknown buffer handle in dispatch"))?;
                if access.has_writes() && !usage.contains(BufferUsage::STORAGE) {
                    return Err(invalid("dispatch writes a buffer lacking STORAGE usage"));
                }
                let raw = RawResource::Buffer(raw);
                self.touch(
                    barriers,
                    TrackKey::Buffer(handle),
                    raw,
                    StageMask::COMPUTE,
                    access,
                    ImageLayout::Undefined,
                    None,
                );
                Ok(raw)
            }
            ResourceRef::Image(handle) => {
                let (raw, layout, usage) = allocator
                    .resolve_image(handle, generation)
                    .ok_or_else(|| invalid("unknown image handle in dispatch"))?;
                if !usage.contains(ImageUsage::STORAGE) {
                    return Err(invalid("dispatch references an image lacking STORAGE usage"));
                }
                let raw = RawResource::Image(raw);
                self.touch(
                    barriers,
                    TrackKey::Image(handle),
                    raw,
                    StageMask::COMPUTE,
                    access,
                    ImageLayout::General,
                    Some((&mut *allocator, handle, layout)),
                );
                Ok(raw)
            }
        }
    }

    /// Record one access, emitting a barrier when it conflicts with the
    /// resource's last known state
    fn touch(
        &mut self,
        barriers: &mut Vec<BarrierDesc>,
        key: TrackKey,
        resource: RawResource,
        dst_stage: StageMask,
        dst_access: AccessMask,
        dst_layout: ImageLayout,
        image: Option<(&mut ResourceAllocator, ImageHandle, ImageLayout)>,
    ) {
        let previous = match self.states.get(&key) {
            Some(state) => *state,
            None => match image {
                // an image's first touch this frame starts from its
                // persisted layout, which may force a transition
                Some((_, _, persisted_layout)) => ResourceState {
                    stage: StageMask::TOP,
                    access: AccessMask::empty(),
                    layout: persisted_layout,
                },
                // a buffer's first touch carries no intra-frame hazard;
                // cross-frame ordering comes from submission order
                None => {
                    self.states.insert(
                        key,
                        ResourceState {
                            stage: dst_stage,
                            access: dst_access,
                            layout: dst_layout,
                        },
                    );
                    return;
                }
            },
        };

        let hazard = previous.access.has_writes()
            || dst_access.has_writes()
            || previous.layout != dst_layout;
        if hazard {
            barriers.push(BarrierDesc {
                resource,
                src_stage: previous.stage,
                src_access: previous.access,
                dst_stage,
                dst_access,
                old_layout: previous.layout,
                new_layout: dst_layout,
            });
            self.states.insert(
                key,
                ResourceState {
                    stage: dst_stage,
                    access: dst_access,
                    layout: dst_layout,
                },
            );
            if let Some((allocator, handle, _)) = image {
                allocator.set_image_layout(handle, dst_layout);
            }
        } else {
            // compatible reads widen the tracked scopes
            self.states.insert(
                key,
                ResourceState {
                    stage: previous.stage | dst_stage,
                    access: previous.access | dst_access,
                    layout: previous.layout,
                },
            );
        }
    }
}

impl Default for CommandRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(reason: &str) -> RenderError {
    RenderError::InvalidDrawList {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BufferDesc;
    use crate::config::RendererConfig;
    use crate::device::headless::HeadlessDevice;
    use crate::device::{DeviceContext, ImageDesc, ImageFormat, MemoryLocation};
    use crate::pipeline::{BlendState, DepthState, ShaderDesc, VertexLayout};
    use std::sync::Arc;

    struct Fixture {
        allocator: ResourceAllocator,
        pipelines: PipelineCache,
        recorder: CommandRecorder,
    }

    fn fixture() -> Fixture {
        let ctx = DeviceContext::new(Arc::new(HeadlessDevice::new()));
        Fixture {
            allocator: ResourceAllocator::new(&ctx, &RendererConfig::default()),
            pipelines: PipelineCache::new(&ctx, None),
            recorder: CommandRecorder::new(),
        }
    }

    fn graphics_key() -> PipelineKey {
        PipelineKey::graphics(
            ShaderDesc::from_spirv(&[1, 2]),
            ShaderDesc::from_spirv(&[3, 4]),
            VertexLayout::empty(),
            BlendState::Opaque,
            DepthState::disabled(),
            ImageFormat::Bgra8Unorm,
        )
    }

    fn compute_key() -> PipelineKey {
        PipelineKey::compute(ShaderDesc::from_spirv(&[5, 6]))
    }

    fn storage_buffer(fx: &mut Fixture) -> BufferHandle {
        fx.allocator
            .allocate_buffer(&BufferDesc {
                size: 256,
                usage: BufferUsage::STORAGE,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap()
    }

    fn mesh_buffers(fx: &mut Fixture) -> (BufferHandle, BufferHandle) {
        let vertices = fx
            .allocator
            .allocate_buffer(&BufferDesc {
                size: 1024,
                usage: BufferUsage::VERTEX | BufferUsage::STORAGE,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();
        let indices = fx
            .allocator
            .allocate_buffer(&BufferDesc {
                size: 256,
                usage: BufferUsage::INDEX,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();
        (vertices, indices)
    }

    fn draw_op(vertices: BufferHandle, indices: BufferHandle) -> DrawOp {
        DrawOp::DrawIndexed {
            pipeline: graphics_key(),
            vertex_buffer: vertices,
            index_buffer: indices,
            index_count: 36,
            first_index: 0,
            vertex_offset: 0,
            textures: Vec::new(),
            push: DrawPush::identity(),
        }
    }

    fn record(fx: &mut Fixture, list: &DrawList) -> RenderResult<Vec<GpuCommand>> {
        fx.recorder
            .record(&mut fx.allocator, &mut fx.pipelines, 1, 0, list)
    }

    #[test]
    fn write_then_read_emits_exactly_one_barrier() {
        let mut fx = fixture();
        let buffer = storage_buffer(&mut fx);

        let mut list = DrawList::default();
        list.push(DrawOp::DispatchCompute {
            pipeline: compute_key(),
            reads: Vec::new(),
            writes: vec![ResourceRef::Buffer(buffer)],
            groups: [8, 8, 1],
        });
        list.push(DrawOp::DispatchCompute {
            pipeline: compute_key(),
            reads: vec![ResourceRef::Buffer(buffer)],
            writes: Vec::new(),
            groups: [8, 8, 1],
        });

        let commands = record(&mut fx, &list).unwrap();
        let barriers: Vec<_> = commands.iter().filter(|c| c.is_barrier()).collect();
        assert_eq!(barriers.len(), 1);

        // the barrier sits between the two dispatches and transitions
        // write access to read access
        let first_dispatch = commands
            .iter()
            .position(|c| matches!(c, GpuCommand::Dispatch { .. }))
            .unwrap();
        let barrier_at = commands.iter().position(|c| c.is_barrier()).unwrap();
        let second_dispatch = commands
            .iter()
            .rposition(|c| matches!(c, GpuCommand::Dispatch { .. }))
            .unwrap();
        assert!(first_dispatch < barrier_at && barrier_at < second_dispatch);

        let GpuCommand::Barrier(barrier) = &commands[barrier_at] else {
            unreachable!()
        };
        assert!(barrier.src_access.has_writes());
        assert_eq!(barrier.dst_access, AccessMask::SHADER_READ);
    }

    #[test]
    fn reads_in_the_same_state_need_no_barrier() {
        let mut fx = fixture();
        let buffer = storage_buffer(&mut fx);

        let mut list = DrawList::default();
        for _ in 0..2 {
            list.push(DrawOp::DispatchCompute {
                pipeline: compute_key(),
                reads: vec![ResourceRef::Buffer(buffer)],
                writes: Vec::new(),
                groups: [1, 1, 1],
            });
        }

        let commands = record(&mut fx, &list).unwrap();
        assert!(commands.iter().all(|c| !c.is_barrier()));
    }

    #[test]
    fn sampled_image_transitions_once() {
        let mut fx = fixture();
        let (vertices, indices) = mesh_buffers(&mut fx);
        let texture = fx
            .allocator
            .allocate_image(&ImageDesc {
                width: 16,
                height: 16,
                format: ImageFormat::Rgba8Unorm,
                usage: crate::device::ImageUsage::SAMPLED,
            })
            .unwrap();

        let mut list = DrawList::default();
        for _ in 0..2 {
            list.push(DrawOp::DrawIndexed {
                pipeline: graphics_key(),
                vertex_buffer: vertices,
                index_buffer: indices,
                index_count: 6,
                first_index: 0,
                vertex_offset: 0,
                textures: vec![texture],
                push: DrawPush::identity(),
            });
        }

        let commands = record(&mut fx, &list).unwrap();
        let barriers: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Barrier(b) => Some(b),
                _ => None,
            })
            .collect();
        // one Undefined -> ShaderReadOnly transition; the second sample of
        // the already-transitioned image needs nothing
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].old_layout, ImageLayout::Undefined);
        assert_eq!(barriers[0].new_layout, ImageLayout::ShaderReadOnly);

        // the layout persists on the image for the next frame
        let (_, layout, _) = fx.allocator.resolve_image(texture, 2).unwrap();
        assert_eq!(layout, ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn compute_suspends_and_resumes_the_pass() {
        let mut fx = fixture();
        let (vertices, indices) = mesh_buffers(&mut fx);
        let buffer = storage_buffer(&mut fx);

        let mut list = DrawList::default();
        list.push(draw_op(vertices, indices));
        list.push(DrawOp::DispatchCompute {
            pipeline: compute_key(),
            reads: Vec::new(),
            writes: vec![ResourceRef::Buffer(buffer)],
            groups: [4, 4, 1],
        });
        list.push(draw_op(vertices, indices));

        let commands = record(&mut fx, &list).unwrap();

        // pass, suspend for the dispatch, resume without clearing
        let begins: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::BeginPass { clear, .. } => Some(*clear),
                _ => None,
            })
            .collect();
        assert_eq!(begins.len(), 2);
        assert!(begins[0].is_some());
        assert!(begins[1].is_none());
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, GpuCommand::EndPass))
                .count(),
            2
        );

        let dispatch_at = commands
            .iter()
            .position(|c| matches!(c, GpuCommand::Dispatch { .. }))
            .unwrap();
        let first_end = commands
            .iter()
            .position(|c| matches!(c, GpuCommand::EndPass))
            .unwrap();
        assert!(first_end < dispatch_at);
    }

    #[test]
    fn empty_list_still_clears_the_target() {
        let mut fx = fixture();
        let commands = record(&mut fx, &DrawList::default()).unwrap();
        assert_eq!(
            commands,
            vec![
                GpuCommand::BeginPass {
                    image_index: 0,
                    clear: Some([0.0, 0.0, 0.0, 1.0]),
                },
                GpuCommand::EndPass,
            ]
        );
    }

    #[test]
    fn stale_handle_is_an_invalid_draw_list() {
        let mut fx = fixture();
        let (vertices, indices) = mesh_buffers(&mut fx);
        fx.allocator.free_buffer(vertices).unwrap();

        let mut list = DrawList::default();
        list.push(draw_op(vertices, indices));
        assert!(matches!(
            record(&mut fx, &list),
            Err(RenderError::InvalidDrawList { .. })
        ));
    }

    #[test]
    fn bind_point_mismatch_is_rejected() {
        let mut fx = fixture();
        let (vertices, indices) = mesh_buffers(&mut fx);
        let buffer = storage_buffer(&mut fx);

        let mut list = DrawList::default();
        list.push(DrawOp::DrawIndexed {
            pipeline: compute_key(),
            vertex_buffer: vertices,
            index_buffer: indices,
            index_count: 3,
            first_index: 0,
            vertex_offset: 0,
            textures: Vec::new(),
            push: DrawPush::identity(),
        });
        assert!(matches!(
            record(&mut fx, &list),
            Err(RenderError::InvalidDrawList { .. })
        ));

        let mut list = DrawList::default();
        list.push(DrawOp::DispatchCompute {
            pipeline: graphics_key(),
            reads: vec![ResourceRef::Buffer(buffer)],
            writes: Vec::new(),
            groups: [1, 1, 1],
        });
        assert!(matches!(
            record(&mut fx, &list),
            Err(RenderError::InvalidDrawList { .. })
        ));
    }

    #[test]
    fn usage_mismatch_is_rejected() {
        let mut fx = fixture();
        let uniform = fx
            .allocator
            .allocate_buffer(&BufferDesc {
                size: 64,
                usage: BufferUsage::UNIFORM,
                location: MemoryLocation::HostVisible,
            })
            .unwrap();
        let (_, indices) = mesh_buffers(&mut fx);

        let mut list = DrawList::default();
        list.push(draw_op(uniform, indices));
        assert!(matches!(
            record(&mut fx, &list),
            Err(RenderError::InvalidDrawList { .. })
        ));
    }
}
