//! Ray-tracing shader binding table assembly.
//!
//! A shader table is GPU memory laid out as fixed-stride records: a shader
//! group identifier followed by optional local root arguments. The builder
//! collects the ray generation, miss and hit-group records, computes the
//! per-region strides from the largest record, and writes the table through
//! the linear upload allocator.

use std::sync::Arc;

use static_assertions::const_assert_eq;

use crate::backend::{GpuBuffer, SHADER_IDENTIFIER_SIZE};
use crate::error::GpuError;
use crate::types::align_up;
use crate::upload::LinearAllocator;

use super::CompiledPipeline;

/// Alignment of each shader record within a table.
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;

/// Alignment of each table region start.
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;

// Identifiers must tile cleanly into records.
const_assert_eq!(SHADER_IDENTIFIER_SIZE as u64 % SHADER_RECORD_ALIGNMENT, 0);

/// GPU locations of the three table regions, consumed by ray dispatches.
#[derive(Debug, Clone)]
pub struct ShaderTableRegions {
    /// Buffer holding the whole table.
    pub buffer: Arc<GpuBuffer>,
    /// Ray generation record offset within the buffer.
    pub raygen_offset: u64,
    /// Ray generation record size.
    pub raygen_size: u64,
    /// Miss region offset within the buffer.
    pub miss_offset: u64,
    /// Miss region total size.
    pub miss_size: u64,
    /// Stride between miss records.
    pub miss_stride: u64,
    /// Hit-group region offset within the buffer.
    pub hit_offset: u64,
    /// Hit-group region total size.
    pub hit_size: u64,
    /// Stride between hit-group records.
    pub hit_stride: u64,
}

/// A built shader binding table.
///
/// Lives in linear-allocator memory: valid until the sync point of the frame
/// that built it completes, which is exactly as long as the dispatch that
/// consumes it.
#[derive(Debug, Clone)]
pub struct ShaderTable {
    regions: ShaderTableRegions,
}

impl ShaderTable {
    /// Region locations for a ray dispatch.
    pub fn regions(&self) -> &ShaderTableRegions {
        &self.regions
    }
}

#[derive(Debug, Clone)]
struct ShaderRecord {
    export: String,
    local_args: Vec<u8>,
}

impl ShaderRecord {
    fn stride(&self) -> u64 {
        align_up(
            SHADER_IDENTIFIER_SIZE as u64 + self.local_args.len() as u64,
            SHADER_RECORD_ALIGNMENT,
        )
    }
}

/// Builder assembling a shader binding table.
#[derive(Debug, Default)]
pub struct ShaderTableBuilder {
    raygen: Option<ShaderRecord>,
    miss: Vec<ShaderRecord>,
    hit_groups: Vec<ShaderRecord>,
}

impl ShaderTableBuilder {
    /// Start an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ray generation record.
    pub fn raygen(mut self, export: impl Into<String>, local_args: &[u8]) -> Self {
        self.raygen = Some(ShaderRecord {
            export: export.into(),
            local_args: local_args.to_vec(),
        });
        self
    }

    /// Append a miss record.
    pub fn add_miss(mut self, export: impl Into<String>, local_args: &[u8]) -> Self {
        self.miss.push(ShaderRecord {
            export: export.into(),
            local_args: local_args.to_vec(),
        });
        self
    }

    /// Append a hit-group record.
    pub fn add_hit_group(mut self, name: impl Into<String>, local_args: &[u8]) -> Self {
        self.hit_groups.push(ShaderRecord {
            export: name.into(),
            local_args: local_args.to_vec(),
        });
        self
    }

    /// Lay out the table and upload it.
    ///
    /// # Panics
    ///
    /// Panics when no ray generation record was set, or when a record names
    /// an export the pipeline does not contain — both are engine bugs caught
    /// at table-build time rather than as GPU faults.
    pub fn build(
        &self,
        pipeline: &CompiledPipeline,
        allocator: &LinearAllocator,
    ) -> Result<ShaderTable, GpuError> {
        let raygen = self
            .raygen
            .as_ref()
            .expect("shader table without a ray generation record");

        let raygen_size = raygen.stride();
        let miss_stride = self.miss.iter().map(ShaderRecord::stride).max().unwrap_or(0);
        let hit_stride = self
            .hit_groups
            .iter()
            .map(ShaderRecord::stride)
            .max()
            .unwrap_or(0);

        let raygen_offset = 0u64;
        let miss_offset = align_up(raygen_offset + raygen_size, SHADER_TABLE_ALIGNMENT);
        let miss_size = miss_stride * self.miss.len() as u64;
        let hit_offset = align_up(miss_offset + miss_size, SHADER_TABLE_ALIGNMENT);
        let hit_size = hit_stride * self.hit_groups.len() as u64;
        let total_size = hit_offset + hit_size;

        let mut bytes = vec![0u8; total_size as usize];
        write_record(&mut bytes, raygen_offset, raygen, pipeline);
        for (index, record) in self.miss.iter().enumerate() {
            write_record(
                &mut bytes,
                miss_offset + miss_stride * index as u64,
                record,
                pipeline,
            );
        }
        for (index, record) in self.hit_groups.iter().enumerate() {
            write_record(
                &mut bytes,
                hit_offset + hit_stride * index as u64,
                record,
                pipeline,
            );
        }

        let allocation = allocator.allocate_aligned(total_size, SHADER_TABLE_ALIGNMENT)?;
        allocation.write(&bytes);

        log::trace!(
            "shader table built: {} bytes ({} miss, {} hit groups)",
            total_size,
            self.miss.len(),
            self.hit_groups.len()
        );

        Ok(ShaderTable {
            regions: ShaderTableRegions {
                buffer: allocation.buffer.clone(),
                raygen_offset: allocation.offset + raygen_offset,
                raygen_size,
                miss_offset: allocation.offset + miss_offset,
                miss_size,
                miss_stride,
                hit_offset: allocation.offset + hit_offset,
                hit_size,
                hit_stride,
            },
        })
    }
}

fn write_record(bytes: &mut [u8], offset: u64, record: &ShaderRecord, pipeline: &CompiledPipeline) {
    let identifier = pipeline
        .shader_identifier(&record.export)
        .unwrap_or_else(|| {
            panic!(
                "shader table references unknown export '{}'",
                record.export
            )
        });
    let offset = offset as usize;
    bytes[offset..offset + SHADER_IDENTIFIER_SIZE].copy_from_slice(&identifier);
    let args_start = offset + SHADER_IDENTIFIER_SIZE;
    bytes[args_start..args_start + record.local_args.len()].copy_from_slice(&record.local_args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::GpuBackend;
    use crate::pipeline::{
        BindingLayout, HitGroup, PipelineDesc, RaytracingPipelineDesc, RaytracingShader,
    };
    use crate::shader::{Shader, ShaderStage};

    fn test_pipeline(backend: &DummyBackend) -> CompiledPipeline {
        let desc = PipelineDesc::Raytracing(RaytracingPipelineDesc {
            layout: BindingLayout::builder().constants(0, 0, 1).build(),
            shaders: vec![
                RaytracingShader {
                    shader: Arc::new(Shader::new(ShaderStage::RayGeneration, vec![1], "rg")),
                    export: "raygen_main".to_string(),
                },
                RaytracingShader {
                    shader: Arc::new(Shader::new(ShaderStage::Miss, vec![2], "ms")),
                    export: "miss_main".to_string(),
                },
            ],
            hit_groups: vec![HitGroup {
                name: "opaque_hit".to_string(),
                closest_hit: Some("chs".to_string()),
                any_hit: None,
                intersection: None,
            }],
            max_recursion_depth: 1,
            max_payload_size: 16,
        });
        let raw = backend.compile_pipeline(&desc).unwrap();
        CompiledPipeline { desc, raw }
    }

    fn test_allocator(backend: Arc<DummyBackend>) -> LinearAllocator {
        let allocator = LinearAllocator::new(backend as Arc<dyn GpuBackend>, 64 * 1024);
        allocator.begin(0);
        allocator
    }

    #[test]
    fn test_table_layout_alignment() {
        let backend = Arc::new(DummyBackend::new());
        let pipeline = test_pipeline(&backend);
        let allocator = test_allocator(backend.clone());

        let table = ShaderTableBuilder::new()
            .raygen("raygen_main", &[0u8; 8])
            .add_miss("miss_main", &[])
            .add_hit_group("opaque_hit", &[1, 2, 3, 4])
            .build(&pipeline, &allocator)
            .unwrap();

        let regions = table.regions();
        assert_eq!(regions.raygen_size, 64); // 32 id + 8 args, aligned up
        assert_eq!(regions.miss_offset % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(regions.hit_offset % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(regions.miss_stride, 32);
        assert_eq!(regions.hit_stride, 64); // 32 id + 4 args, aligned up
    }

    #[test]
    fn test_table_contains_identifiers() {
        let backend = Arc::new(DummyBackend::new());
        let pipeline = test_pipeline(&backend);
        let allocator = test_allocator(backend.clone());

        let table = ShaderTableBuilder::new()
            .raygen("raygen_main", &[])
            .add_miss("miss_main", &[])
            .build(&pipeline, &allocator)
            .unwrap();

        let regions = table.regions();
        let raygen_bytes = backend.read_buffer(
            &regions.buffer,
            regions.raygen_offset,
            SHADER_IDENTIFIER_SIZE as u64,
        );
        assert_eq!(
            raygen_bytes.as_slice(),
            pipeline.shader_identifier("raygen_main").unwrap()
        );
        // Distinct exports produce distinct identifiers.
        let miss_bytes = backend.read_buffer(
            &regions.buffer,
            regions.miss_offset,
            SHADER_IDENTIFIER_SIZE as u64,
        );
        assert_ne!(raygen_bytes, miss_bytes);
    }

    #[test]
    #[should_panic(expected = "unknown export")]
    fn test_unknown_export_panics() {
        let backend = Arc::new(DummyBackend::new());
        let pipeline = test_pipeline(&backend);
        let allocator = test_allocator(backend.clone());

        let _ = ShaderTableBuilder::new()
            .raygen("not_an_export", &[])
            .build(&pipeline, &allocator);
    }

    #[test]
    #[should_panic(expected = "without a ray generation record")]
    fn test_missing_raygen_panics() {
        let backend = Arc::new(DummyBackend::new());
        let pipeline = test_pipeline(&backend);
        let allocator = test_allocator(backend.clone());

        let _ = ShaderTableBuilder::new()
            .add_miss("miss_main", &[])
            .build(&pipeline, &allocator);
    }
}
