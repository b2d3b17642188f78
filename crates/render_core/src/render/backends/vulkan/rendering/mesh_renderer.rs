//! Lit mesh rendering with a depth buffer
//!
//! One graphics pipeline using dynamic rendering. Per frame slot there is a
//! host-visible camera uniform buffer and a descriptor set pointing at it;
//! the model matrix of each draw goes through push constants.

use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector3};

use super::barriers::{full_range, BarrierBatch, ImageScope};
use super::renderer::{acquired_image, color_attachment_info, render_area, transition_to_present, Renderer};
use super::shader::ShaderModule;
use crate::assets::Vertex;
use crate::render::backends::vulkan::resources::{
    GpuBuffer, MemoryResidency, MeshHandle, MeshManager, RenderTarget,
};
use crate::render::backends::vulkan::state::RecordingFrame;
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Directory holding the compiled `mesh.vert.spv` / `mesh.frag.spv`, when the
/// build found a shader compiler
pub const SHADER_DIR: Option<&str> = option_env!("RENDER_CORE_SHADER_DIR");

/// Camera block shared by both shader stages
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    /// Projection × view, column-major
    pub view_proj: [[f32; 4]; 4],
    /// Direction towards the light, `w` unused
    pub light_direction: [f32; 4],
    /// Surface color
    pub base_color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ModelPush {
    model: [[f32; 4]; 4],
}

/// Perspective projection for Vulkan clip space (y down, depth 0..1)
pub fn vulkan_projection(aspect: f32, fov_y: f32, near: f32, far: f32) -> Matrix4<f32> {
    #[rustfmt::skip]
    let clip = Matrix4::new(
        1.0,  0.0, 0.0, 0.0,
        0.0, -1.0, 0.0, 0.0,
        0.0,  0.0, 0.5, 0.5,
        0.0,  0.0, 0.0, 1.0,
    );
    clip * Matrix4::new_perspective(aspect, fov_y, near, far)
}

/// Look-at camera with a vertical field of view
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Eye position
    pub eye: Point3<f32>,
    /// Point looked at
    pub target: Point3<f32>,
    /// Up direction
    pub up: Vector3<f32>,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Point3::new(0.0, 0.0, 3.0),
            target: Point3::origin(),
            up: Vector3::y(),
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    /// Projection × view for a viewport of `extent`
    pub fn view_projection(&self, extent: vk::Extent2D) -> Matrix4<f32> {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let view = Matrix4::look_at_rh(&self.eye, &self.target, &self.up);
        vulkan_projection(aspect, self.fov_y, self.near, self.far) * view
    }
}

struct DrawItem {
    mesh: MeshHandle,
    model: Matrix4<f32>,
}

/// Buffers and push constants for one recorded draw
#[derive(Debug, Clone, Copy)]
struct ResolvedDraw {
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
    push: ModelPush,
}

/// Look up every queued draw, skipping handles that no longer name a mesh
fn resolve_draws<H, I, F>(draws: I, mut lookup: F) -> Vec<ResolvedDraw>
where
    H: Copy + std::fmt::Debug,
    I: IntoIterator<Item = (H, Matrix4<f32>)>,
    F: FnMut(H) -> VulkanResult<(vk::Buffer, vk::Buffer, u32)>,
{
    draws
        .into_iter()
        .filter_map(|(handle, model)| match lookup(handle) {
            Ok((vertex_buffer, index_buffer, index_count)) => Some(ResolvedDraw {
                vertex_buffer,
                index_buffer,
                index_count,
                push: ModelPush { model: model.into() },
            }),
            Err(e) => {
                log::warn!("Skipping draw of {:?}: {}", handle, e);
                None
            }
        })
        .collect()
}

/// Draws queued meshes with simple directional lighting
pub struct MeshRenderer {
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    uniforms: Vec<GpuBuffer>,
    depth: Option<RenderTarget>,
    camera: Camera,
    light_direction: Vector3<f32>,
    base_color: [f32; 4],
    clear_color: [f32; 4],
    draws: Vec<DrawItem>,
}

impl MeshRenderer {
    /// Build the pipeline for `color_format` targets and per-slot uniforms
    ///
    /// Fails with `InvalidShader` if either SPIR-V blob is malformed.
    pub fn new(
        ctx: &DeviceContext,
        color_format: vk::Format,
        extent: vk::Extent2D,
        frames_in_flight: usize,
        vertex_spv: &[u8],
        fragment_spv: &[u8],
    ) -> VulkanResult<Self> {
        let vertex_shader = ShaderModule::from_bytes(ctx.device(), vertex_spv)?;
        let fragment_shader = ShaderModule::from_bytes(ctx.device(), fragment_spv)?;
        let depth = RenderTarget::depth(ctx, extent)?;
        let depth_format = depth.format();

        let mut renderer = Self {
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            uniforms: Vec::new(),
            depth: Some(depth),
            camera: Camera::default(),
            light_direction: Vector3::new(0.4, 1.0, 0.6).normalize(),
            base_color: [0.8, 0.8, 0.8, 1.0],
            clear_color: [0.02, 0.02, 0.05, 1.0],
            draws: Vec::new(),
        };

        let built = renderer
            .create_descriptors(ctx, frames_in_flight.max(1))
            .and_then(|()| renderer.create_pipeline(ctx, color_format, depth_format, &vertex_shader, &fragment_shader));
        if let Err(e) = built {
            renderer.destroy(ctx);
            return Err(e);
        }

        log::info!(
            "Mesh renderer ready ({:?} color, {:?} depth, {} uniform slots)",
            color_format,
            depth_format,
            renderer.uniforms.len()
        );
        Ok(renderer)
    }

    /// Load `mesh.vert.spv` and `mesh.frag.spv` from `dir`
    pub fn from_shader_dir<P: AsRef<Path>>(
        ctx: &DeviceContext,
        color_format: vk::Format,
        extent: vk::Extent2D,
        frames_in_flight: usize,
        dir: P,
    ) -> VulkanResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read(&path)
                .map_err(|e| VulkanError::InvalidShader(format!("failed to read {}: {}", path.display(), e)))
        };
        let vertex_spv = read("mesh.vert.spv")?;
        let fragment_spv = read("mesh.frag.spv")?;
        Self::new(ctx, color_format, extent, frames_in_flight, &vertex_spv, &fragment_spv)
    }

    fn create_descriptors(&mut self, ctx: &DeviceContext, frames: usize) -> VulkanResult<()> {
        let device = ctx.device();

        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        self.descriptor_set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: frames as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(frames as u32);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

        let layouts = vec![self.descriptor_set_layout; frames];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };

        let uniform_size = std::mem::size_of::<CameraUniform>() as vk::DeviceSize;
        for &set in &self.descriptor_sets {
            let buffer = GpuBuffer::new(
                ctx,
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryResidency::HostRandomAccess,
            )?;

            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.handle(),
                offset: 0,
                range: uniform_size,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build();
            unsafe { device.update_descriptor_sets(&[write], &[]) };

            self.uniforms.push(buffer);
        }
        Ok(())
    }

    fn create_pipeline(
        &mut self,
        ctx: &DeviceContext,
        color_format: vk::Format,
        depth_format: vk::Format,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
    ) -> VulkanResult<()> {
        let device = ctx.device();

        let push_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<ModelPush>() as u32,
        }];
        let set_layouts = [self.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        self.pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        let entry = c"main";
        let stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX, entry),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT, entry),
        ];

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

        let multisampling =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .push_next(&mut rendering_info)
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .render_pass(vk::RenderPass::null())
            .build();

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)?
        };
        self.pipeline = pipelines
            .first()
            .copied()
            .ok_or_else(|| VulkanError::InitializationFailed("driver returned no pipeline".to_string()))?;
        Ok(())
    }

    /// Queue `mesh` for the next frame with transform `model`
    pub fn queue_draw(&mut self, mesh: MeshHandle, model: Matrix4<f32>) {
        self.draws.push(DrawItem { mesh, model });
    }

    /// Number of draws queued for the next frame
    pub fn queued_draws(&self) -> usize {
        self.draws.len()
    }

    /// Camera
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Camera, mutable
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Direction towards the light
    pub fn set_light_direction(&mut self, direction: Vector3<f32>) {
        self.light_direction = direction.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::y);
    }

    /// Surface color for every mesh
    pub fn set_base_color(&mut self, color: [f32; 4]) {
        self.base_color = color;
    }

    /// Background color
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    fn camera_uniform(&self, extent: vk::Extent2D) -> CameraUniform {
        let d = self.light_direction;
        CameraUniform {
            view_proj: self.camera.view_projection(extent).into(),
            light_direction: [d.x, d.y, d.z, 0.0],
            base_color: self.base_color,
        }
    }
}

impl Renderer for MeshRenderer {
    fn draw(&mut self, frame: &RecordingFrame<'_>, meshes: &MeshManager) -> VulkanResult<()> {
        let ctx = frame.context();
        let device = ctx.device();
        let cmd = frame.command_buffer();
        let extent = frame.extent();
        let slot = frame.slot();

        let depth = self
            .depth
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("mesh renderer used after destroy"))?;
        let set = *self
            .descriptor_sets
            .get(slot)
            .ok_or_else(|| VulkanError::invalid(format!("no descriptor set for frame slot {}", slot)))?;

        // Resolve every handle before recording anything
        let resolved = resolve_draws(self.draws.drain(..).map(|item| (item.mesh, item.model)), |handle| {
            meshes
                .get(handle)
                .map(|mesh| (mesh.vertex_buffer(), mesh.index_buffer(), mesh.index_count()))
        });

        let uniform = self.camera_uniform(extent);
        self.uniforms[slot].write_mapped(ctx, bytemuck::bytes_of(&uniform), 0)?;

        // Depth is shared by all slots; order against the previous frame's tests
        let depth_previous = ImageScope {
            layout: vk::ImageLayout::UNDEFINED,
            ..ImageScope::depth_attachment_write()
        };
        let mut to_attachment = BarrierBatch::new(ctx.scratch(), 0, 0, 2)?;
        to_attachment.set_image(
            0,
            frame.image(),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            acquired_image(),
            ImageScope::color_attachment_write(),
        )?;
        to_attachment.set_image(
            1,
            depth.image(),
            depth.subresource_range(),
            depth_previous,
            ImageScope::depth_attachment_write(),
        )?;
        to_attachment.build_and_run(device, cmd)?;

        let color = [color_attachment_info(frame.image_view(), self.clear_color)];
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(depth.view())
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area(extent))
            .layer_count(1)
            .color_attachments(&color)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area(extent)]);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );

            for draw in &resolved {
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&draw.push),
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_rendering(cmd);
        }

        transition_to_present(ctx, frame)
    }

    fn resize(&mut self, ctx: &DeviceContext, extent: vk::Extent2D) -> VulkanResult<()> {
        match self.depth.as_mut() {
            Some(depth) => depth.resize(ctx, extent),
            None => Err(VulkanError::invalid("mesh renderer used after destroy")),
        }
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            // Destroying the pool frees its sets
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.descriptor_pool = vk::DescriptorPool::null();
        self.descriptor_set_layout = vk::DescriptorSetLayout::null();
        self.descriptor_sets.clear();

        for buffer in self.uniforms.drain(..) {
            buffer.destroy(ctx);
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(ctx);
        }
        self.draws.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    fn to_ndc(m: &Matrix4<f32>, p: Vector4<f32>) -> Vector4<f32> {
        let clip = m * p;
        clip / clip.w
    }

    #[test]
    fn test_projection_maps_depth_to_zero_one() {
        let proj = vulkan_projection(1.0, std::f32::consts::FRAC_PI_2, 0.1, 100.0);
        let near = to_ndc(&proj, Vector4::new(0.0, 0.0, -0.1, 1.0));
        let far = to_ndc(&proj, Vector4::new(0.0, 0.0, -100.0, 1.0));
        assert_relative_eq!(near.z, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_projection_points_y_down() {
        let proj = vulkan_projection(1.0, std::f32::consts::FRAC_PI_2, 0.1, 100.0);
        let above = to_ndc(&proj, Vector4::new(0.0, 1.0, -2.0, 1.0));
        assert!(above.y < 0.0);
    }

    #[test]
    fn test_default_camera_sees_origin_at_center() {
        let camera = Camera::default();
        let vp = camera.view_projection(vk::Extent2D { width: 800, height: 600 });
        let origin = to_ndc(&vp, Vector4::new(0.0, 0.0, 0.0, 1.0));
        assert_relative_eq!(origin.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(origin.y, 0.0, epsilon = 1e-5);
        assert!(origin.z > 0.0 && origin.z < 1.0);
    }

    #[test]
    fn test_stale_draw_is_skipped_and_the_rest_recorded() {
        use ash::vk::Handle as _;

        let live = |raw: u64| -> VulkanResult<(vk::Buffer, vk::Buffer, u32)> {
            Ok((vk::Buffer::from_raw(raw), vk::Buffer::from_raw(raw + 100), 6))
        };
        let draws = vec![
            (1u64, Matrix4::identity()),
            (2, Matrix4::new_translation(&Vector3::new(1.0, 0.0, 0.0))),
            (3, Matrix4::new_scaling(2.0)),
        ];

        let resolved = resolve_draws(draws, |id| {
            if id == 2 {
                Err(VulkanError::Pool(crate::foundation::PoolError::StaleHandle { index: 2 }))
            } else {
                live(id)
            }
        });

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].vertex_buffer, vk::Buffer::from_raw(1));
        assert_eq!(resolved[1].index_buffer, vk::Buffer::from_raw(103));
        assert_relative_eq!(resolved[1].push.model[0][0], 2.0);
    }

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 96);
        assert_eq!(std::mem::size_of::<ModelPush>(), 64);
    }
}
