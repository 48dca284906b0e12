//! Translation of recorded command lists into Vulkan command buffers.

use std::sync::Arc;

use ash::vk;

use crate::command::{CommandList, IndexFormat, RecordedCommand};
use crate::error::GpuError;
use crate::state::{Barrier, RawResource, ResourceRef, ALL_SUBRESOURCES};

use super::conversion::access_info;
use super::raytracing::{accel_type, build_flags, translate_geometry};
use crate::backend::{GpuAccelStruct, GpuBuffer, GpuPipeline, GpuTexture};

fn vk_buffer(buffer: &GpuBuffer) -> vk::Buffer {
    match buffer {
        GpuBuffer::Vulkan { buffer, .. } => *buffer,
        GpuBuffer::Dummy { .. } => panic!("dummy buffer handle submitted to the Vulkan backend"),
    }
}

fn vk_accel(accel: &GpuAccelStruct) -> vk::AccelerationStructureKHR {
    match accel {
        GpuAccelStruct::Vulkan { accel, .. } => *accel,
        GpuAccelStruct::Dummy { .. } => {
            panic!("dummy acceleration structure submitted to the Vulkan backend")
        }
    }
}

/// A query pool created while translating; must outlive the submission.
pub struct TransientQueryPool {
    pub pool: vk::QueryPool,
}

/// Translates one command list into an open command buffer.
pub struct CommandTranslator<'a> {
    device: &'a ash::Device,
    accel_fns: Option<&'a ash::khr::acceleration_structure::Device>,
    rt_fns: Option<&'a ash::khr::ray_tracing_pipeline::Device>,
    cmd: vk::CommandBuffer,
    /// Query pools created for compacted-size writes.
    pub transient_pools: Vec<TransientQueryPool>,
}

impl<'a> CommandTranslator<'a> {
    pub fn new(
        device: &'a ash::Device,
        accel_fns: Option<&'a ash::khr::acceleration_structure::Device>,
        rt_fns: Option<&'a ash::khr::ray_tracing_pipeline::Device>,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            accel_fns,
            rt_fns,
            cmd,
            transient_pools: Vec::new(),
        }
    }

    /// Record every command of `list` into the command buffer.
    pub fn translate(&mut self, list: &CommandList) -> Result<(), GpuError> {
        for command in &list.commands {
            self.translate_command(command)?;
        }
        Ok(())
    }

    fn translate_command(&mut self, command: &RecordedCommand) -> Result<(), GpuError> {
        match command {
            RecordedCommand::Barriers(barriers) => self.emit_barriers(barriers),
            RecordedCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe {
                    self.device.cmd_copy_buffer(
                        self.cmd,
                        vk_buffer(src),
                        vk_buffer(dst),
                        std::slice::from_ref(&region),
                    );
                }
            }
            RecordedCommand::CopyBufferToTexture {
                src,
                src_offset,
                bytes_per_row: _,
                dst,
                subresource,
            } => self.copy_buffer_to_texture(src, *src_offset, dst, *subresource),
            RecordedCommand::SetPipeline(pipeline) => match pipeline.raw() {
                GpuPipeline::Vulkan {
                    pipeline,
                    bind_point,
                    ..
                } => unsafe {
                    self.device.cmd_bind_pipeline(self.cmd, *bind_point, *pipeline);
                },
                GpuPipeline::Dummy { .. } => {
                    panic!("dummy pipeline submitted to the Vulkan backend")
                }
            },
            RecordedCommand::BeginRendering {
                color_targets,
                depth_target,
            } => self.begin_rendering(color_targets, depth_target.as_deref()),
            RecordedCommand::EndRendering => unsafe {
                self.device.cmd_end_rendering(self.cmd);
            },
            RecordedCommand::BindVertexBuffer { buffer, offset } => unsafe {
                self.device.cmd_bind_vertex_buffers(
                    self.cmd,
                    0,
                    &[vk_buffer(buffer)],
                    &[*offset],
                );
            },
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                format,
            } => unsafe {
                let index_type = match format {
                    IndexFormat::Uint16 => vk::IndexType::UINT16,
                    IndexFormat::Uint32 => vk::IndexType::UINT32,
                };
                self.device
                    .cmd_bind_index_buffer(self.cmd, vk_buffer(buffer), *offset, index_type);
            },
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                self.device.cmd_draw(
                    self.cmd,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                );
            },
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            } => unsafe {
                self.device.cmd_draw_indexed(
                    self.cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *base_vertex,
                    *first_instance,
                );
            },
            RecordedCommand::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => unsafe {
                self.device.cmd_draw_indirect(
                    self.cmd,
                    vk_buffer(buffer),
                    *offset,
                    *draw_count,
                    *stride,
                );
            },
            RecordedCommand::Dispatch { x, y, z } => unsafe {
                self.device.cmd_dispatch(self.cmd, *x, *y, *z);
            },
            RecordedCommand::DispatchRays {
                table,
                width,
                height,
                depth,
            } => {
                let rt_fns = self.rt_fns.ok_or_else(|| {
                    GpuError::FeatureNotSupported("ray tracing pipelines".to_string())
                })?;
                let base = table.buffer.gpu_address();
                let raygen = vk::StridedDeviceAddressRegionKHR {
                    device_address: base + table.raygen_offset,
                    stride: table.raygen_size,
                    size: table.raygen_size,
                };
                let miss = vk::StridedDeviceAddressRegionKHR {
                    device_address: base + table.miss_offset,
                    stride: table.miss_stride,
                    size: table.miss_size,
                };
                let hit = vk::StridedDeviceAddressRegionKHR {
                    device_address: base + table.hit_offset,
                    stride: table.hit_stride,
                    size: table.hit_size,
                };
                let callable = vk::StridedDeviceAddressRegionKHR::default();
                unsafe {
                    rt_fns.cmd_trace_rays(
                        self.cmd,
                        &raygen,
                        &miss,
                        &hit,
                        &callable,
                        *width,
                        *height,
                        *depth,
                    );
                }
            }
            RecordedCommand::BuildAccelStruct {
                inputs,
                dst,
                scratch_address,
            } => {
                let accel_fns = self.accel_fns.ok_or_else(|| {
                    GpuError::FeatureNotSupported("acceleration structures".to_string())
                })?;
                let bundle = translate_geometry(inputs);
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(accel_type(inputs.kind()))
                    .flags(build_flags())
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(vk_accel(dst))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: *scratch_address,
                    })
                    .geometries(&bundle.geometries);
                unsafe {
                    accel_fns.cmd_build_acceleration_structures(
                        self.cmd,
                        std::slice::from_ref(&build_info),
                        &[&bundle.ranges],
                    );
                }
            }
            RecordedCommand::CopyAccelStructCompact { src, dst } => {
                let accel_fns = self.accel_fns.ok_or_else(|| {
                    GpuError::FeatureNotSupported("acceleration structures".to_string())
                })?;
                let info = vk::CopyAccelerationStructureInfoKHR::default()
                    .src(vk_accel(src))
                    .dst(vk_accel(dst))
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                unsafe { accel_fns.cmd_copy_acceleration_structure(self.cmd, &info) };
            }
            RecordedCommand::WriteCompactedSize {
                accel,
                dst,
                dst_offset,
            } => self.write_compacted_size(accel, dst, *dst_offset)?,
        }
        Ok(())
    }

    fn emit_barriers(&mut self, barriers: &[Barrier]) {
        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        let mut memory_barriers = Vec::new();

        for barrier in barriers {
            match barrier {
                Barrier::Transition {
                    resource,
                    subresource,
                    before,
                    after,
                } => {
                    let (src_stage, src_access, old_layout) = access_info(*before);
                    let (dst_stage, dst_access, new_layout) = access_info(*after);
                    match &resource.raw {
                        RawResource::Texture(texture) => {
                            image_barriers.push(
                                vk::ImageMemoryBarrier2::default()
                                    .src_stage_mask(src_stage)
                                    .src_access_mask(src_access)
                                    .dst_stage_mask(dst_stage)
                                    .dst_access_mask(dst_access)
                                    .old_layout(old_layout)
                                    .new_layout(new_layout)
                                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                    .image(texture_image(texture))
                                    .subresource_range(subresource_range(
                                        texture,
                                        resource,
                                        *subresource,
                                    )),
                            );
                        }
                        RawResource::Buffer(buffer) => {
                            buffer_barriers.push(
                                vk::BufferMemoryBarrier2::default()
                                    .src_stage_mask(src_stage)
                                    .src_access_mask(src_access)
                                    .dst_stage_mask(dst_stage)
                                    .dst_access_mask(dst_access)
                                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                    .buffer(vk_buffer(buffer))
                                    .offset(0)
                                    .size(vk::WHOLE_SIZE),
                            );
                        }
                    }
                }
                Barrier::Uav { .. } => {
                    memory_barriers.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(
                                vk::PipelineStageFlags2::COMPUTE_SHADER
                                    | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                            )
                            .src_access_mask(
                                vk::AccessFlags2::SHADER_WRITE
                                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                            )
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(
                                vk::AccessFlags2::SHADER_READ
                                    | vk::AccessFlags2::TRANSFER_READ
                                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                            ),
                    );
                }
                Barrier::Aliasing { .. } => {
                    memory_barriers.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(
                                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                            ),
                    );
                }
            }
        }

        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &GpuBuffer,
        src_offset: u64,
        dst: &GpuTexture,
        subresource: u32,
    ) {
        let GpuTexture::Vulkan {
            image,
            extent,
            aspect,
            mip_levels,
            ..
        } = dst
        else {
            panic!("dummy texture handle submitted to the Vulkan backend");
        };
        let mip = subresource % mip_levels;
        let layer = subresource / mip_levels;
        let region = vk::BufferImageCopy {
            buffer_offset: src_offset,
            // Staged data is tightly packed.
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: *aspect,
                mip_level: mip,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: (extent.width >> mip).max(1),
                height: (extent.height >> mip).max(1),
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.cmd,
                vk_buffer(src),
                *image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }
    }

    fn begin_rendering(&mut self, color_targets: &[Arc<GpuTexture>], depth: Option<&GpuTexture>) {
        let mut render_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        let color_attachments: Vec<vk::RenderingAttachmentInfo> = color_targets
            .iter()
            .map(|target| {
                let GpuTexture::Vulkan { view, extent, .. } = target.as_ref() else {
                    panic!("dummy texture handle submitted to the Vulkan backend");
                };
                render_extent = vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                };
                vk::RenderingAttachmentInfo::default()
                    .image_view(*view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
            })
            .collect();

        let depth_attachment = depth.map(|target| {
            let GpuTexture::Vulkan { view, extent, .. } = target else {
                panic!("dummy texture handle submitted to the Vulkan backend");
            };
            render_extent = vk::Extent2D {
                width: extent.width,
                height: extent.height,
            };
            vk::RenderingAttachmentInfo::default()
                .image_view(*view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: render_extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        unsafe { self.device.cmd_begin_rendering(self.cmd, &rendering_info) };
    }

    fn write_compacted_size(
        &mut self,
        accel: &GpuAccelStruct,
        dst: &GpuBuffer,
        dst_offset: u64,
    ) -> Result<(), GpuError> {
        let accel_fns = self.accel_fns.ok_or_else(|| {
            GpuError::FeatureNotSupported("acceleration structures".to_string())
        })?;
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);
        let pool = unsafe { self.device.create_query_pool(&pool_info, None) }
            .map_err(GpuError::from)?;
        self.transient_pools.push(TransientQueryPool { pool });

        unsafe {
            self.device.cmd_reset_query_pool(self.cmd, pool, 0, 1);
            accel_fns.cmd_write_acceleration_structures_properties(
                self.cmd,
                std::slice::from_ref(&vk_accel(accel)),
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                0,
            );
            self.device.cmd_copy_query_pool_results(
                self.cmd,
                pool,
                0,
                1,
                vk_buffer(dst),
                dst_offset,
                std::mem::size_of::<u64>() as u64,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
        Ok(())
    }
}

fn texture_image(texture: &GpuTexture) -> vk::Image {
    match texture {
        GpuTexture::Vulkan { image, .. } => *image,
        GpuTexture::Dummy => panic!("dummy texture handle submitted to the Vulkan backend"),
    }
}

fn subresource_range(
    texture: &GpuTexture,
    resource: &ResourceRef,
    subresource: u32,
) -> vk::ImageSubresourceRange {
    let GpuTexture::Vulkan {
        aspect, mip_levels, ..
    } = texture
    else {
        panic!("dummy texture handle submitted to the Vulkan backend");
    };
    if subresource == ALL_SUBRESOURCES {
        vk::ImageSubresourceRange {
            aspect_mask: *aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    } else {
        debug_assert!(subresource < resource.subresource_count);
        vk::ImageSubresourceRange {
            aspect_mask: *aspect,
            base_mip_level: subresource % mip_levels,
            level_count: 1,
            base_array_layer: subresource / mip_levels,
            layer_count: 1,
        }
    }
}
