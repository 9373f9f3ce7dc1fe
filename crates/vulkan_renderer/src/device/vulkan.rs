//! Vulkan device backend
//!
//! [`VulkanDevice`] implements the [`GpuDevice`] seam over `ash`. The
//! instance, logical device, queues, and presentation surface are accepted
//! pre-established from the embedder (windowing and device selection are
//! external collaborators); this backend owns the swapchain, render passes,
//! framebuffers, depth buffer, descriptor machinery, and the translation of
//! the lowered command stream into `vkCmd*` calls.
//!
//! The embedder remains the owner of the instance and logical device and
//! destroys them after this backend drops.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::vk;

use crate::draw::{BarrierDesc, GpuCommand, RawResource};
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{BlendState, PipelineKey, ShaderSet, VertexLayout};

use super::{
    AccessMask, BlockId, BufferUsage, CommandBufferId, FenceId, FenceStatus, GpuDevice,
    ImageDesc, ImageFormat, ImageLayout, ImageUsage, MemoryFlags, MemoryProperties,
    MemoryRequirements, MemoryType, PipelineId, RawBufferId, RawImageId, SemaphoreId,
    SubmissionRecord,
};

/// Sampled textures a draw may bind
pub const MAX_BOUND_TEXTURES: usize = 4;
/// Storage buffers a dispatch may bind
pub const MAX_STORAGE_BUFFERS: usize = 2;
/// Storage images a dispatch may bind
pub const MAX_STORAGE_IMAGES: usize = 2;

const DESCRIPTOR_POOL_CAPACITY: u32 = 256;

/// Pre-established handles the embedder supplies
pub struct VulkanDeviceCreateInfo {
    /// Vulkan instance (owned by the embedder)
    pub instance: ash::Instance,
    /// Logical device (owned by the embedder)
    pub device: ash::Device,
    /// Physical device the logical device was created from
    pub physical_device: vk::PhysicalDevice,
    /// Queue family used for graphics submissions
    pub graphics_queue_family: u32,
    /// Graphics queue
    pub graphics_queue: vk::Queue,
    /// Presentation queue (may equal the graphics queue)
    pub present_queue: vk::Queue,
    /// Surface extension loader
    pub surface_loader: SurfaceLoader,
    /// Presentation surface (owned by windowing code)
    pub surface: vk::SurfaceKHR,
}

struct BlockRecord {
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
}

struct BufferRecord {
    buffer: vk::Buffer,
}

struct ImageRecord {
    image: vk::Image,
    format: ImageFormat,
    view: Option<vk::ImageView>,
    sampled_set: Option<vk::DescriptorSet>,
    storage_set: Option<vk::DescriptorSet>,
}

struct PipelineRecord {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

struct StorageBufferSets {
    set: vk::DescriptorSet,
}

struct Presentation {
    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    depth_image: vk::Image,
    depth_memory: vk::DeviceMemory,
    depth_view: vk::ImageView,
}

struct Tables {
    next_id: u64,
    blocks: HashMap<u64, BlockRecord>,
    block_properties: HashMap<u64, vk::MemoryPropertyFlags>,
    buffers: HashMap<u64, BufferRecord>,
    buffer_storage_sets: HashMap<u64, StorageBufferSets>,
    images: HashMap<u64, ImageRecord>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    pipelines: HashMap<u64, PipelineRecord>,
    presentation: Presentation,
}

/// `ash`-backed implementation of the device seam
pub struct VulkanDevice {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    surface_loader: SurfaceLoader,
    surface: vk::SurfaceKHR,
    swapchain_loader: SwapchainLoader,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    sampler_set_layout: vk::DescriptorSetLayout,
    storage_buffer_set_layout: vk::DescriptorSetLayout,
    storage_image_set_layout: vk::DescriptorSetLayout,
    graphics_pipeline_layout: vk::PipelineLayout,
    compute_pipeline_layout: vk::PipelineLayout,
    render_pass_clear: vk::RenderPass,
    render_pass_load: vk::RenderPass,
    tables: Mutex<Tables>,
}

// raw Vulkan handles are plain ids; the tables mutex guards all mutation
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl VulkanDevice {
    /// Build the backend over pre-established device handles.
    ///
    /// Creates the swapchain, depth buffer, render passes, framebuffers,
    /// command pool, and descriptor machinery.
    pub fn new(info: VulkanDeviceCreateInfo) -> RenderResult<Self> {
        log::debug!("creating VulkanDevice backend");
        let swapchain_loader = SwapchainLoader::new(&info.instance, &info.device);

        let surface_format = choose_surface_format(
            &info.surface_loader,
            info.physical_device,
            info.surface,
        )?;
        let render_pass_clear =
            create_render_pass(&info.device, surface_format.format, vk::AttachmentLoadOp::CLEAR)?;
        let render_pass_load =
            create_render_pass(&info.device, surface_format.format, vk::AttachmentLoadOp::LOAD)?;

        let command_pool = {
            let create_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(info.graphics_queue_family);
            unsafe {
                info.device
                    .create_command_pool(&create_info, None)
                    .map_err(RenderError::Api)?
            }
        };

        let descriptor_pool = {
            let sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY,
                },
            ];
            let create_info = vk::DescriptorPoolCreateInfo::builder()
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                .max_sets(DESCRIPTOR_POOL_CAPACITY * 3)
                .pool_sizes(&sizes);
            unsafe {
                info.device
                    .create_descriptor_pool(&create_info, None)
                    .map_err(RenderError::Api)?
            }
        };

        let sampler = {
            let create_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT);
            unsafe {
                info.device
                    .create_sampler(&create_info, None)
                    .map_err(RenderError::Api)?
            }
        };

        let sampler_set_layout = create_set_layout(
            &info.device,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        )?;
        let storage_buffer_set_layout = create_set_layout(
            &info.device,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let storage_image_set_layout = create_set_layout(
            &info.device,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::COMPUTE,
        )?;

        let graphics_pipeline_layout = {
            let set_layouts = [sampler_set_layout; MAX_BOUND_TEXTURES];
            let push_range = vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: crate::draw::PUSH_CONSTANT_SIZE,
            };
            let push_ranges = [push_range];
            let create_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_ranges);
            unsafe {
                info.device
                    .create_pipeline_layout(&create_info, None)
                    .map_err(RenderError::Api)?
            }
        };
        let compute_pipeline_layout = {
            let mut set_layouts = [storage_buffer_set_layout; MAX_STORAGE_BUFFERS + MAX_STORAGE_IMAGES];
            for layout in set_layouts.iter_mut().skip(MAX_STORAGE_BUFFERS) {
                *layout = storage_image_set_layout;
            }
            let create_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
            unsafe {
                info.device
                    .create_pipeline_layout(&create_info, None)
                    .map_err(RenderError::Api)?
            }
        };

        let presentation = create_presentation(
            &info.instance,
            &info.device,
            info.physical_device,
            &info.surface_loader,
            info.surface,
            &swapchain_loader,
            surface_format,
            render_pass_clear,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Self {
            instance: info.instance,
            device: info.device,
            physical_device: info.physical_device,
            graphics_queue_family: info.graphics_queue_family,
            graphics_queue: info.graphics_queue,
            present_queue: info.present_queue,
            surface_loader: info.surface_loader,
            surface: info.surface,
            swapchain_loader,
            command_pool,
            descriptor_pool,
            sampler,
            sampler_set_layout,
            storage_buffer_set_layout,
            storage_image_set_layout,
            graphics_pipeline_layout,
            compute_pipeline_layout,
            render_pass_clear,
            render_pass_load,
            tables: Mutex::new(Tables {
                next_id: 1,
                blocks: HashMap::new(),
                block_properties: HashMap::new(),
                buffers: HashMap::new(),
                buffer_storage_sets: HashMap::new(),
                images: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                pipelines: HashMap::new(),
                presentation,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("vulkan device tables poisoned")
    }

    fn fresh_id(tables: &mut Tables) -> u64 {
        let id = tables.next_id;
        tables.next_id += 1;
        id
    }

    /// Sampled-image descriptor set for an image, created on first use
    fn sampled_set(&self, tables: &mut Tables, image: u64) -> RenderResult<vk::DescriptorSet> {
        let record = tables.images.get_mut(&image).ok_or_else(unknown_image)?;
        if let Some(set) = record.sampled_set {
            return Ok(set);
        }
        let view = self.image_view(record)?;
        let set = self.allocate_set(self.sampler_set_layout)?;
        let image_info = vk::DescriptorImageInfo::builder()
            .sampler(self.sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build();
        let image_infos = [image_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        record.sampled_set = Some(set);
        Ok(set)
    }

    /// Storage-image descriptor set for an image, created on first use
    fn storage_image_set(
        &self,
        tables: &mut Tables,
        image: u64,
    ) -> RenderResult<vk::DescriptorSet> {
        let record = tables.images.get_mut(&image).ok_or_else(unknown_image)?;
        if let Some(set) = record.storage_set {
            return Ok(set);
        }
        let view = self.image_view(record)?;
        let set = self.allocate_set(self.storage_image_set_layout)?;
        let image_info = vk::DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL)
            .build();
        let image_infos = [image_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        record.storage_set = Some(set);
        Ok(set)
    }

    /// Storage-buffer descriptor set for a buffer, created on first use
    fn storage_buffer_set(
        &self,
        tables: &mut Tables,
        buffer: u64,
    ) -> RenderResult<vk::DescriptorSet> {
        if let Some(sets) = tables.buffer_storage_sets.get(&buffer) {
            return Ok(sets.set);
        }
        let record = tables.buffers.get(&buffer).ok_or_else(unknown_buffer)?;
        let set = self.allocate_set(self.storage_buffer_set_layout)?;
        let buffer_info = vk::DescriptorBufferInfo::builder()
            .buffer(record.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build();
        let buffer_infos = [buffer_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        tables
            .buffer_storage_sets
            .insert(buffer, StorageBufferSets { set });
        Ok(set)
    }

    fn image_view(&self, record: &mut ImageRecord) -> RenderResult<vk::ImageView> {
        if let Some(view) = record.view {
            return Ok(view);
        }
        let view = create_image_view(
            &self.device,
            record.image,
            to_vk_format(record.format),
            vk::ImageAspectFlags::COLOR,
        )?;
        record.view = Some(view);
        Ok(view)
    }

    fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> RenderResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&allocate_info)
                .map_err(RenderError::Api)?
        };
        Ok(sets[0])
    }

    fn encode_stream(
        &self,
        tables: &mut Tables,
        command_buffer: vk::CommandBuffer,
        stream: &[GpuCommand],
    ) -> RenderResult<()> {
        let device = &self.device;
        let extent = tables.presentation.extent;
        let mut graphics_bound = false;

        for command in stream {
            match command {
                GpuCommand::BeginPass { image_index, clear } => {
                    let (render_pass, clear_values) = match clear {
                        Some(color) => (
                            self.render_pass_clear,
                            [
                                vk::ClearValue {
                                    color: vk::ClearColorValue { float32: *color },
                                },
                                vk::ClearValue {
                                    depth_stencil: vk::ClearDepthStencilValue {
                                        depth: 1.0,
                                        stencil: 0,
                                    },
                                },
                            ],
                        ),
                        None => (
                            self.render_pass_load,
                            [vk::ClearValue {
                                color: vk::ClearColorValue { float32: [0.0; 4] },
                            }; 2],
                        ),
                    };
                    let begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass)
                        .framebuffer(
                            tables.presentation.framebuffers[*image_index as usize],
                        )
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent,
                        })
                        .clear_values(&clear_values);
                    unsafe {
                        device.cmd_begin_render_pass(
                            command_buffer,
                            &begin_info,
                            vk::SubpassContents::INLINE,
                        );
                        let viewport = vk::Viewport {
                            x: 0.0,
                            y: 0.0,
                            width: extent.width as f32,
                            height: extent.height as f32,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        };
                        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
                        let scissor = vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent,
                        };
                        device.cmd_set_scissor(command_buffer, 0, &[scissor]);
                    }
                }
                GpuCommand::EndPass => unsafe {
                    device.cmd_end_render_pass(command_buffer);
                },
                GpuCommand::BindPipeline(pipeline) => {
                    let record = tables
                        .pipelines
                        .get(&pipeline.0)
                        .ok_or_else(|| RenderError::InvalidDrawList {
                            reason: "stream references an unknown pipeline".to_string(),
                        })?;
                    graphics_bound = record.bind_point == vk::PipelineBindPoint::GRAPHICS;
                    unsafe {
                        device.cmd_bind_pipeline(
                            command_buffer,
                            record.bind_point,
                            record.pipeline,
                        );
                    }
                }
                GpuCommand::BindTextures(images) => {
                    if images.len() > MAX_BOUND_TEXTURES {
                        return Err(RenderError::InvalidDrawList {
                            reason: format!(
                                "draw binds {} textures, limit is {MAX_BOUND_TEXTURES}",
                                images.len()
                            ),
                        });
                    }
                    for (slot, image) in images.iter().enumerate() {
                        let set = self.sampled_set(tables, image.0)?;
                        unsafe {
                            device.cmd_bind_descriptor_sets(
                                command_buffer,
                                vk::PipelineBindPoint::GRAPHICS,
                                self.graphics_pipeline_layout,
                                slot as u32,
                                &[set],
                                &[],
                            );
                        }
                    }
                }
                GpuCommand::BindStorage(resources) => {
                    let mut buffer_slot = 0;
                    let mut image_slot = 0;
                    for resource in resources {
                        let (set, slot) = match resource {
                            RawResource::Buffer(buffer) => {
                                if buffer_slot >= MAX_STORAGE_BUFFERS {
                                    return Err(RenderError::InvalidDrawList {
                                        reason: format!(
                                            "dispatch binds more than {MAX_STORAGE_BUFFERS} storage buffers"
                                        ),
                                    });
                                }
                                let set = self.storage_buffer_set(tables, buffer.0)?;
                                buffer_slot += 1;
                                (set, buffer_slot - 1)
                            }
                            RawResource::Image(image) => {
                                if image_slot >= MAX_STORAGE_IMAGES {
                                    return Err(RenderError::InvalidDrawList {
                                        reason: format!(
                                            "dispatch binds more than {MAX_STORAGE_IMAGES} storage images"
                                        ),
                                    });
                                }
                                let set = self.storage_image_set(tables, image.0)?;
                                image_slot += 1;
                                (set, MAX_STORAGE_BUFFERS + image_slot - 1)
                            }
                        };
                        unsafe {
                            device.cmd_bind_descriptor_sets(
                                command_buffer,
                                vk::PipelineBindPoint::COMPUTE,
                                self.compute_pipeline_layout,
                                slot as u32,
                                &[set],
                                &[],
                            );
                        }
                    }
                }
                GpuCommand::BindVertexBuffer(buffer) => {
                    let record = tables.buffers.get(&buffer.0).ok_or_else(unknown_buffer)?;
                    unsafe {
                        device.cmd_bind_vertex_buffers(command_buffer, 0, &[record.buffer], &[0]);
                    }
                }
                GpuCommand::BindIndexBuffer(buffer) => {
                    let record = tables.buffers.get(&buffer.0).ok_or_else(unknown_buffer)?;
                    unsafe {
                        device.cmd_bind_index_buffer(
                            command_buffer,
                            record.buffer,
                            0,
                            vk::IndexType::UINT32,
                        );
                    }
                }
                GpuCommand::PushConstants(push) => {
                    debug_assert!(graphics_bound, "push constants outside a graphics pipeline");
                    unsafe {
                        device.cmd_push_constants(
                            command_buffer,
                            self.graphics_pipeline_layout,
                            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                            0,
                            bytemuck::bytes_of(push),
                        );
                    }
                }
                GpuCommand::Barrier(barrier) => {
                    self.encode_barrier(tables, command_buffer, barrier)?;
                }
                GpuCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => unsafe {
                    device.cmd_draw_indexed(
                        command_buffer,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    );
                },
                GpuCommand::Dispatch { groups } => unsafe {
                    device.cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]);
                },
            }
        }
        Ok(())
    }

    fn encode_barrier(
        &self,
        tables: &Tables,
        command_buffer: vk::CommandBuffer,
        barrier: &BarrierDesc,
    ) -> RenderResult<()> {
        let src_stage = to_vk_stage(barrier.src_stage);
        let dst_stage = to_vk_stage(barrier.dst_stage);
        match barrier.resource {
            RawResource::Buffer(buffer) => {
                let record = tables.buffers.get(&buffer.0).ok_or_else(unknown_buffer)?;
                let buffer_barrier = vk::BufferMemoryBarrier::builder()
                    .src_access_mask(to_vk_access(barrier.src_access))
                    .dst_access_mask(to_vk_access(barrier.dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(record.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                unsafe {
                    self.device.cmd_pipeline_barrier(
                        command_buffer,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[buffer_barrier],
                        &[],
                    );
                }
            }
            RawResource::Image(image) => {
                let record = tables.images.get(&image.0).ok_or_else(unknown_image)?;
                let aspect = match record.format {
                    ImageFormat::D32Float => vk::ImageAspectFlags::DEPTH,
                    _ => vk::ImageAspectFlags::COLOR,
                };
                let image_barrier = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(to_vk_access(barrier.src_access))
                    .dst_access_mask(to_vk_access(barrier.dst_access))
                    .old_layout(to_vk_layout(barrier.old_layout))
                    .new_layout(to_vk_layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(record.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build();
                unsafe {
                    self.device.cmd_pipeline_barrier(
                        command_buffer,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[image_barrier],
                    );
                }
            }
        }
        Ok(())
    }

    fn build_pipeline(&self, key: &PipelineKey) -> RenderResult<PipelineRecord> {
        match &key.shaders {
            ShaderSet::Compute { compute } => {
                let module = create_shader_module(&self.device, compute.words())?;
                let entry = std::ffi::CStr::from_bytes_with_nul(b"main\0")
                    .expect("static entry point name");
                let stage = vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module)
                    .name(entry)
                    .build();
                let create_info = vk::ComputePipelineCreateInfo::builder()
                    .stage(stage)
                    .layout(self.compute_pipeline_layout)
                    .build();
                let result = unsafe {
                    self.device.create_compute_pipelines(
                        vk::PipelineCache::null(),
                        &[create_info],
                        None,
                    )
                };
                unsafe { self.device.destroy_shader_module(module, None) };
                let pipelines = result.map_err(|(_, err)| RenderError::Api(err))?;
                Ok(PipelineRecord {
                    pipeline: pipelines[0],
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                })
            }
            ShaderSet::Graphics { vertex, fragment } => {
                let vertex_module = create_shader_module(&self.device, vertex.words())?;
                let fragment_module = match create_shader_module(&self.device, fragment.words()) {
                    Ok(module) => module,
                    Err(err) => {
                        unsafe { self.device.destroy_shader_module(vertex_module, None) };
                        return Err(err);
                    }
                };
                let result = self.build_graphics_pipeline(key, vertex_module, fragment_module);
                unsafe {
                    self.device.destroy_shader_module(vertex_module, None);
                    self.device.destroy_shader_module(fragment_module, None);
                }
                result
            }
        }
    }

    fn build_graphics_pipeline(
        &self,
        key: &PipelineKey,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
    ) -> RenderResult<PipelineRecord> {
        let entry =
            std::ffi::CStr::from_bytes_with_nul(b"main\0").expect("static entry point name");
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(entry)
                .build(),
        ];

        let (binding_descriptions, attribute_descriptions) =
            vertex_input_state(&key.vertex_layout);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(key.depth.test)
            .depth_write_enable(key.depth.write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = match key.blend {
            BlendState::AlphaBlend => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
            BlendState::Opaque => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build(),
        };
        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.graphics_pipeline_layout)
            .render_pass(self.render_pass_clear)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
                .map_err(|(_, err)| RenderError::Api(err))?
        };
        Ok(PipelineRecord {
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }
}

impl GpuDevice for VulkanDevice {
    fn memory_properties(&self) -> MemoryProperties {
        let properties = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };
        let types = properties.memory_types[..properties.memory_type_count as usize]
            .iter()
            .map(|memory_type| MemoryType {
                flags: from_vk_memory_flags(memory_type.property_flags),
            })
            .collect();
        MemoryProperties { types }
    }

    fn swapchain_image_count(&self) -> u32 {
        self.lock().presentation.images.len() as u32
    }

    fn surface_extent(&self) -> (u32, u32) {
        let extent = self.lock().presentation.extent;
        (extent.width, extent.height)
    }

    fn allocate_block(&self, memory_type: u32, size: u64) -> RenderResult<BlockId> {
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe {
            self.device
                .allocate_memory(&allocate_info, None)
                .map_err(|err| match err {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        RenderError::OutOfMemory { requested: size }
                    }
                    other => RenderError::Api(other),
                })?
        };

        let properties = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };
        let flags = properties.memory_types[memory_type as usize].property_flags;
        // host-visible blocks stay persistently mapped for their lifetime
        let mapped = if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let pointer = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(RenderError::Api)?
            };
            NonNull::new(pointer.cast::<u8>())
        } else {
            None
        };

        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.blocks.insert(id, BlockRecord { memory, mapped });
        tables.block_properties.insert(id, flags);
        Ok(BlockId(id))
    }

    fn free_block(&self, block: BlockId) {
        let mut tables = self.lock();
        tables.block_properties.remove(&block.0);
        if let Some(record) = tables.blocks.remove(&block.0) {
            unsafe { self.device.free_memory(record.memory, None) };
        }
    }

    fn block_mapped_ptr(&self, block: BlockId) -> Option<NonNull<u8>> {
        self.lock().blocks.get(&block.0).and_then(|b| b.mapped)
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<RawBufferId> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(to_vk_buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&create_info, None)
                .map_err(RenderError::Api)?
        };
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.buffers.insert(id, BufferRecord { buffer });
        Ok(RawBufferId(id))
    }

    fn buffer_requirements(&self, buffer: RawBufferId) -> MemoryRequirements {
        let tables = self.lock();
        let Some(record) = tables.buffers.get(&buffer.0) else {
            return MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: 0,
            };
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(record.buffer) };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_buffer(&self, buffer: RawBufferId, block: BlockId, offset: u64) -> RenderResult<()> {
        let tables = self.lock();
        let record = tables.buffers.get(&buffer.0).ok_or_else(unknown_buffer)?;
        let memory = tables
            .blocks
            .get(&block.0)
            .map(|b| b.memory)
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "binding to an unknown memory block".to_string(),
            })?;
        unsafe {
            self.device
                .bind_buffer_memory(record.buffer, memory, offset)
                .map_err(RenderError::Api)
        }
    }

    fn destroy_buffer(&self, buffer: RawBufferId) {
        let mut tables = self.lock();
        if let Some(sets) = tables.buffer_storage_sets.remove(&buffer.0) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[sets.set]);
            }
        }
        if let Some(record) = tables.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(record.buffer, None) };
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<RawImageId> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(to_vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(to_vk_image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            self.device
                .create_image(&create_info, None)
                .map_err(RenderError::Api)?
        };
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.images.insert(
            id,
            ImageRecord {
                image,
                format: desc.format,
                view: None,
                sampled_set: None,
                storage_set: None,
            },
        );
        Ok(RawImageId(id))
    }

    fn image_requirements(&self, image: RawImageId) -> MemoryRequirements {
        let tables = self.lock();
        let Some(record) = tables.images.get(&image.0) else {
            return MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: 0,
            };
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(record.image) };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_image(&self, image: RawImageId, block: BlockId, offset: u64) -> RenderResult<()> {
        let tables = self.lock();
        let record = tables.images.get(&image.0).ok_or_else(unknown_image)?;
        let memory = tables
            .blocks
            .get(&block.0)
            .map(|b| b.memory)
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "binding to an unknown memory block".to_string(),
            })?;
        unsafe {
            self.device
                .bind_image_memory(record.image, memory, offset)
                .map_err(RenderError::Api)
        }
    }

    fn destroy_image(&self, image: RawImageId) {
        let mut tables = self.lock();
        if let Some(record) = tables.images.remove(&image.0) {
            unsafe {
                let mut sets = Vec::new();
                if let Some(set) = record.sampled_set {
                    sets.push(set);
                }
                if let Some(set) = record.storage_set {
                    sets.push(set);
                }
                if !sets.is_empty() {
                    let _ = self.device.free_descriptor_sets(self.descriptor_pool, &sets);
                }
                if let Some(view) = record.view {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image(record.image, None);
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<FenceId> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe {
            self.device
                .create_fence(&create_info, None)
                .map_err(RenderError::Api)?
        };
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.fences.insert(id, fence);
        Ok(FenceId(id))
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(fence) = self.lock().fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn wait_fence(&self, fence: FenceId, timeout_ns: u64) -> RenderResult<FenceStatus> {
        let fence = self
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "waiting on an unknown fence".to_string(),
            })?;
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::DeviceLost),
            Err(err) => Err(RenderError::Api(err)),
        }
    }

    fn reset_fence(&self, fence: FenceId) -> RenderResult<()> {
        let fence = self
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "resetting an unknown fence".to_string(),
            })?;
        unsafe { self.device.reset_fences(&[fence]).map_err(RenderError::Api) }
    }

    fn create_semaphore(&self) -> RenderResult<SemaphoreId> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe {
            self.device
                .create_semaphore(&create_info, None)
                .map_err(RenderError::Api)?
        };
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.semaphores.insert(id, semaphore);
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        if let Some(semaphore) = self.lock().semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_command_buffer(&self) -> RenderResult<CommandBufferId> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&allocate_info)
                .map_err(RenderError::Api)?
        };
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.command_buffers.insert(id, buffers[0]);
        Ok(CommandBufferId(id))
    }

    fn destroy_command_buffer(&self, commands: CommandBufferId) {
        if let Some(command_buffer) = self.lock().command_buffers.remove(&commands.0) {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &[command_buffer]);
            }
        }
    }

    fn encode(&self, commands: CommandBufferId, stream: &[GpuCommand]) -> RenderResult<()> {
        let mut tables = self.lock();
        let command_buffer = tables
            .command_buffers
            .get(&commands.0)
            .copied()
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "encoding into an unknown command buffer".to_string(),
            })?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(RenderError::Api)?;
        }
        self.encode_stream(&mut tables, command_buffer, stream)?;
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(RenderError::Api)
        }
    }

    fn submit(&self, submission: &SubmissionRecord) -> RenderResult<()> {
        let tables = self.lock();
        let command_buffer = tables
            .command_buffers
            .get(&submission.command_buffer.0)
            .copied()
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "submitting an unknown command buffer".to_string(),
            })?;
        let fence = tables
            .fences
            .get(&submission.fence.0)
            .copied()
            .ok_or_else(|| RenderError::InvalidUsage {
                reason: "submitting with an unknown fence".to_string(),
            })?;

        let mut wait_semaphores = Vec::with_capacity(submission.waits.len());
        let mut wait_stages = Vec::with_capacity(submission.waits.len());
        for (semaphore, stage) in &submission.waits {
            let semaphore = tables
                .semaphores
                .get(&semaphore.0)
                .copied()
                .ok_or_else(unknown_semaphore)?;
            wait_semaphores.push(semaphore);
            wait_stages.push(to_vk_stage(*stage));
        }
        let mut signal_semaphores = Vec::with_capacity(submission.signals.len());
        for semaphore in &submission.signals {
            signal_semaphores.push(
                tables
                    .semaphores
                    .get(&semaphore.0)
                    .copied()
                    .ok_or_else(unknown_semaphore)?,
            );
        }

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        match unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], fence)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::DeviceLost),
            Err(err) => Err(RenderError::Api(err)),
        }
    }

    fn acquire_image(&self, signal: SemaphoreId) -> RenderResult<u32> {
        let tables = self.lock();
        let semaphore = tables
            .semaphores
            .get(&signal.0)
            .copied()
            .ok_or_else(unknown_semaphore)?;
        let swapchain = tables.presentation.swapchain;
        drop(tables);

        match unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        } {
            Ok((index, _suboptimal)) => Ok(index),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SurfaceStale),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::DeviceLost),
            Err(err) => Err(RenderError::Api(err)),
        }
    }

    fn present(&self, image_index: u32, wait: SemaphoreId) -> RenderResult<()> {
        let tables = self.lock();
        let semaphore = tables
            .semaphores
            .get(&wait.0)
            .copied()
            .ok_or_else(unknown_semaphore)?;
        let swapchain = tables.presentation.swapchain;
        drop(tables);

        let wait_semaphores = [semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        } {
            Ok(_suboptimal) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SurfaceStale),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::DeviceLost),
            Err(err) => Err(RenderError::Api(err)),
        }
    }

    fn rebuild_surface(&self) -> RenderResult<()> {
        log::debug!("rebuilding presentation resources");
        self.wait_idle()?;
        let format =
            choose_surface_format(&self.surface_loader, self.physical_device, self.surface)?;
        let mut tables = self.lock();
        let old_swapchain = tables.presentation.swapchain;
        let rebuilt = create_presentation(
            &self.instance,
            &self.device,
            self.physical_device,
            &self.surface_loader,
            self.surface,
            &self.swapchain_loader,
            format,
            self.render_pass_clear,
            old_swapchain,
        )?;
        let old = std::mem::replace(&mut tables.presentation, rebuilt);
        destroy_presentation(&self.device, &self.swapchain_loader, old);
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        match unsafe { self.device.device_wait_idle() } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::DeviceLost),
            Err(err) => Err(RenderError::Api(err)),
        }
    }

    fn create_pipeline(&self, key: &PipelineKey) -> RenderResult<PipelineId> {
        let record = self.build_pipeline(key)?;
        let mut tables = self.lock();
        let id = Self::fresh_id(&mut tables);
        tables.pipelines.insert(id, record);
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        if let Some(record) = self.lock().pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(record.pipeline, None) };
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // the embedder owns the instance and logical device; everything this
        // backend created is torn down here
        let _ = unsafe { self.device.device_wait_idle() };
        let tables = std::mem::replace(
            self.tables.get_mut().expect("vulkan device tables poisoned"),
            Tables {
                next_id: 0,
                blocks: HashMap::new(),
                block_properties: HashMap::new(),
                buffers: HashMap::new(),
                buffer_storage_sets: HashMap::new(),
                images: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                pipelines: HashMap::new(),
                presentation: Presentation {
                    swapchain: vk::SwapchainKHR::null(),
                    extent: vk::Extent2D::default(),
                    images: Vec::new(),
                    views: Vec::new(),
                    framebuffers: Vec::new(),
                    depth_image: vk::Image::null(),
                    depth_memory: vk::DeviceMemory::null(),
                    depth_view: vk::ImageView::null(),
                },
            },
        );

        unsafe {
            for record in tables.pipelines.values() {
                self.device.destroy_pipeline(record.pipeline, None);
            }
            for record in tables.images.values() {
                if let Some(view) = record.view {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image(record.image, None);
            }
            for record in tables.buffers.values() {
                self.device.destroy_buffer(record.buffer, None);
            }
            for fence in tables.fences.values() {
                self.device.destroy_fence(*fence, None);
            }
            for semaphore in tables.semaphores.values() {
                self.device.destroy_semaphore(*semaphore, None);
            }
            for record in tables.blocks.values() {
                self.device.free_memory(record.memory, None);
            }
        }
        destroy_presentation(&self.device, &self.swapchain_loader, tables.presentation);
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device
                .destroy_descriptor_set_layout(self.sampler_set_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.storage_buffer_set_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.storage_image_set_layout, None);
            self.device
                .destroy_pipeline_layout(self.graphics_pipeline_layout, None);
            self.device
                .destroy_pipeline_layout(self.compute_pipeline_layout, None);
            self.device.destroy_render_pass(self.render_pass_clear, None);
            self.device.destroy_render_pass(self.render_pass_load, None);
        }
    }
}

fn unknown_buffer() -> RenderError {
    RenderError::InvalidUsage {
        reason: "unknown buffer object".to_string(),
    }
}

fn unknown_image() -> RenderError {
    RenderError::InvalidUsage {
        reason: "unknown image object".to_string(),
    }
}

fn unknown_semaphore() -> RenderError {
    RenderError::InvalidUsage {
        reason: "unknown semaphore".to_string(),
    }
}

fn choose_surface_format(
    surface_loader: &SurfaceLoader,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> RenderResult<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_err(RenderError::Api)?
    };
    if formats.is_empty() {
        return Err(RenderError::InitializationFailed(
            "surface reports no formats".to_string(),
        ));
    }
    Ok(formats
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_UNORM
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0]))
}

fn create_set_layout(
    device: &ash::Device,
    descriptor_type: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> RenderResult<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(descriptor_type)
        .descriptor_count(1)
        .stage_flags(stages)
        .build();
    let bindings = [binding];
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    unsafe {
        device
            .create_descriptor_set_layout(&create_info, None)
            .map_err(RenderError::Api)
    }
}

fn create_shader_module(device: &ash::Device, words: &[u32]) -> RenderResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(RenderError::Api)
    }
}

fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> RenderResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe {
        device
            .create_image_view(&create_info, None)
            .map_err(RenderError::Api)
    }
}

/// Forward pass with color + depth; `load_op` distinguishes the clearing
/// pass from the resuming pass, which loads prior contents
fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    load_op: vk::AttachmentLoadOp,
) -> RenderResult<vk::RenderPass> {
    let initial_layout = if load_op == vk::AttachmentLoadOp::CLEAR {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };
    let depth_initial = if load_op == vk::AttachmentLoadOp::CLEAR {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    };

    let attachments = [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(initial_layout)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build(),
        vk::AttachmentDescription::builder()
            .format(vk::Format::D32_SFLOAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(depth_initial)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpasses = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build()];

    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    }];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe {
        device
            .create_render_pass(&create_info, None)
            .map_err(RenderError::Api)
    }
}

#[allow(clippy::too_many_arguments)]
fn create_presentation(
    instance: &ash::Instance,
    device: &ash::Device,
    physical_device: vk::PhysicalDevice,
    surface_loader: &SurfaceLoader,
    surface: vk::SurfaceKHR,
    swapchain_loader: &SwapchainLoader,
    format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,
    old_swapchain: vk::SwapchainKHR,
) -> RenderResult<Presentation> {
    let capabilities = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(physical_device, surface)
            .map_err(RenderError::Api)?
    };
    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: 1280,
            height: 720,
        }
    };

    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(vk::PresentModeKHR::FIFO)
        .clipped(true)
        .old_swapchain(old_swapchain);
    let swapchain = unsafe {
        swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(RenderError::Api)?
    };

    let images = unsafe {
        swapchain_loader
            .get_swapchain_images(swapchain)
            .map_err(RenderError::Api)?
    };
    let mut views = Vec::with_capacity(images.len());
    for image in &images {
        views.push(create_image_view(
            device,
            *image,
            format.format,
            vk::ImageAspectFlags::COLOR,
        )?);
    }

    // one shared depth attachment, recreated with the surface
    let depth_create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::D32_SFLOAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let depth_image = unsafe {
        device
            .create_image(&depth_create_info, None)
            .map_err(RenderError::Api)?
    };
    let depth_requirements = unsafe { device.get_image_memory_requirements(depth_image) };
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let depth_memory_type = (0..memory_properties.memory_type_count)
        .find(|&index| {
            depth_requirements.memory_type_bits & (1 << index) != 0
                && memory_properties.memory_types[index as usize]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        })
        .ok_or_else(|| {
            RenderError::InitializationFailed("no memory type for the depth buffer".to_string())
        })?;
    let depth_allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(depth_requirements.size)
        .memory_type_index(depth_memory_type);
    let depth_memory = unsafe {
        device
            .allocate_memory(&depth_allocate_info, None)
            .map_err(RenderError::Api)?
    };
    unsafe {
        device
            .bind_image_memory(depth_image, depth_memory, 0)
            .map_err(RenderError::Api)?;
    }
    let depth_view = create_image_view(
        device,
        depth_image,
        vk::Format::D32_SFLOAT,
        vk::ImageAspectFlags::DEPTH,
    )?;

    let mut framebuffers = Vec::with_capacity(views.len());
    for view in &views {
        let attachments = [*view, depth_view];
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        framebuffers.push(unsafe {
            device
                .create_framebuffer(&create_info, None)
                .map_err(RenderError::Api)?
        });
    }

    log::debug!(
        "presentation ready: {} images at {}x{}",
        images.len(),
        extent.width,
        extent.height
    );
    Ok(Presentation {
        swapchain,
        extent,
        images,
        views,
        framebuffers,
        depth_image,
        depth_memory,
        depth_view,
    })
}

fn destroy_presentation(
    device: &ash::Device,
    swapchain_loader: &SwapchainLoader,
    presentation: Presentation,
) {
    unsafe {
        for framebuffer in presentation.framebuffers {
            device.destroy_framebuffer(framebuffer, None);
        }
        for view in presentation.views {
            device.destroy_image_view(view, None);
        }
        if presentation.depth_view != vk::ImageView::null() {
            device.destroy_image_view(presentation.depth_view, None);
        }
        if presentation.depth_image != vk::Image::null() {
            device.destroy_image(presentation.depth_image, None);
        }
        if presentation.depth_memory != vk::DeviceMemory::null() {
            device.free_memory(presentation.depth_memory, None);
        }
        if presentation.swapchain != vk::SwapchainKHR::null() {
            swapchain_loader.destroy_swapchain(presentation.swapchain, None);
        }
    }
}

fn vertex_input_state(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    if layout.attributes.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: layout.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = layout
        .attributes
        .iter()
        .map(|attribute| vk::VertexInputAttributeDescription {
            location: attribute.location,
            binding: 0,
            format: match attribute.format {
                crate::pipeline::AttributeFormat::F32 => vk::Format::R32_SFLOAT,
                crate::pipeline::AttributeFormat::F32x2 => vk::Format::R32G32_SFLOAT,
                crate::pipeline::AttributeFormat::F32x3 => vk::Format::R32G32B32_SFLOAT,
                crate::pipeline::AttributeFormat::F32x4 => vk::Format::R32G32B32A32_SFLOAT,
            },
            offset: attribute.offset,
        })
        .collect();
    (vec![binding], attributes)
}

fn to_vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

fn to_vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

fn to_vk_image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

fn to_vk_stage(stage: super::StageMask) -> vk::PipelineStageFlags {
    use super::StageMask;
    let mut flags = vk::PipelineStageFlags::empty();
    if stage.contains(StageMask::TOP) {
        flags |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stage.contains(StageMask::VERTEX_INPUT) {
        flags |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if stage.contains(StageMask::VERTEX_SHADER) {
        flags |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stage.contains(StageMask::FRAGMENT_SHADER) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stage.contains(StageMask::COLOR_OUTPUT) {
        flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if stage.contains(StageMask::COMPUTE) {
        flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if stage.contains(StageMask::TRANSFER) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if stage.contains(StageMask::BOTTOM) {
        flags |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    flags
}

fn to_vk_access(access: AccessMask) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    if access.contains(AccessMask::VERTEX_READ) {
        flags |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if access.contains(AccessMask::INDEX_READ) {
        flags |= vk::AccessFlags::INDEX_READ;
    }
    if access.contains(AccessMask::UNIFORM_READ) {
        flags |= vk::AccessFlags::UNIFORM_READ;
    }
    if access.contains(AccessMask::SHADER_READ) {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(AccessMask::SHADER_WRITE) {
        flags |= vk::AccessFlags::SHADER_WRITE;
    }
    if access.contains(AccessMask::COLOR_WRITE) {
        flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if access.contains(AccessMask::TRANSFER_READ) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if access.contains(AccessMask::TRANSFER_WRITE) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if access.contains(AccessMask::HOST_WRITE) {
        flags |= vk::AccessFlags::HOST_WRITE;
    }
    flags
}

fn to_vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    }
}

fn from_vk_memory_flags(flags: vk::MemoryPropertyFlags) -> MemoryFlags {
    let mut out = MemoryFlags::empty();
    if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        out |= MemoryFlags::DEVICE_LOCAL;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        out |= MemoryFlags::HOST_VISIBLE;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        out |= MemoryFlags::HOST_COHERENT;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StageMask;

    #[test]
    fn stage_mapping_covers_all_bits() {
        let all = StageMask::all();
        let mapped = to_vk_stage(all);
        assert!(mapped.contains(vk::PipelineStageFlags::VERTEX_INPUT));
        assert!(mapped.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
        assert!(mapped.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
    }

    #[test]
    fn access_mapping_preserves_write_bits() {
        let access = AccessMask::SHADER_WRITE | AccessMask::TRANSFER_WRITE;
        let mapped = to_vk_access(access);
        assert!(mapped.contains(vk::AccessFlags::SHADER_WRITE));
        assert!(mapped.contains(vk::AccessFlags::TRANSFER_WRITE));
    }

    #[test]
    fn buffer_usage_mapping_is_faithful() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        let mapped = to_vk_buffer_usage(usage);
        assert!(mapped.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(mapped.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!mapped.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
