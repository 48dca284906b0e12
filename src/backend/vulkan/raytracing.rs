//! Acceleration structure geometry translation and size queries.
//!
//! Builds are always sized with compaction allowed and fast-trace preferred;
//! the conservative sizes this produces are exactly what the compaction pass
//! later reclaims.

use ash::vk;

use crate::raytracing::{AccelBuildInputs, AccelKind, AccelSizes};

/// Vulkan-side geometry description for one build.
pub struct GeometryBundle {
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    pub primitive_counts: Vec<u32>,
}

/// Translate build inputs into Vulkan geometry descriptions.
pub fn translate_geometry(inputs: &AccelBuildInputs) -> GeometryBundle {
    match inputs {
        AccelBuildInputs::BottomLevel { geometries } => {
            let mut vk_geometries = Vec::with_capacity(geometries.len());
            let mut ranges = Vec::with_capacity(geometries.len());
            let mut primitive_counts = Vec::with_capacity(geometries.len());
            for geometry in geometries {
                let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: geometry.vertex_address,
                    })
                    .vertex_stride(geometry.vertex_stride)
                    .max_vertex(geometry.vertex_count.saturating_sub(1));
                if let Some(index_address) = geometry.index_address {
                    triangles = triangles
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: index_address,
                        });
                } else {
                    triangles = triangles.index_type(vk::IndexType::NONE_KHR);
                }

                let flags = if geometry.opaque {
                    vk::GeometryFlagsKHR::OPAQUE
                } else {
                    vk::GeometryFlagsKHR::empty()
                };
                vk_geometries.push(
                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                        .flags(flags),
                );
                ranges.push(
                    vk::AccelerationStructureBuildRangeInfoKHR::default()
                        .primitive_count(geometry.triangle_count),
                );
                primitive_counts.push(geometry.triangle_count);
            }
            GeometryBundle {
                geometries: vk_geometries,
                ranges,
                primitive_counts,
            }
        }
        AccelBuildInputs::TopLevel {
            instance_address,
            instance_count,
        } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: *instance_address,
                });
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances });
            GeometryBundle {
                geometries: vec![geometry],
                ranges: vec![vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(*instance_count)],
                primitive_counts: vec![*instance_count],
            }
        }
    }
}

/// Map the structure level.
pub fn accel_type(kind: AccelKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

/// Build flags used for every structure.
pub fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
        | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
}

/// Query driver-reported build sizes.
pub fn query_build_sizes(
    accel_fns: &ash::khr::acceleration_structure::Device,
    inputs: &AccelBuildInputs,
) -> AccelSizes {
    let bundle = translate_geometry(inputs);
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(accel_type(inputs.kind()))
        .flags(build_flags())
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&bundle.geometries);

    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        accel_fns.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &bundle.primitive_counts,
            &mut size_info,
        );
    }

    AccelSizes {
        result_size: size_info.acceleration_structure_size,
        scratch_size: size_info.build_scratch_size,
        update_scratch_size: size_info.update_scratch_size,
    }
}
