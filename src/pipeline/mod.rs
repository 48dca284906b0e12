//! Pipeline construction and asynchronous compilation.
//!
//! Pipeline descriptions are assembled as a *stream* of tagged subobjects
//! ([`PipelineSubobject`]) and folded by a single visitor
//! ([`resolve_stream`]) into one of the concrete description kinds —
//! graphics, mesh-shading, compute or ray-tracing. The tagged-union shape
//! keeps the hot compilation path free of virtual dispatch and makes
//! invalid stage mixes a checkable error rather than a driver crash.
//!
//! Compilation runs off the critical path: [`PipelineCompiler`] hands the
//! description to a worker pool and returns a [`PipelineHandle`]
//! immediately. The first access to the compiled pipeline joins on the
//! result — "compile early, block on first use".

mod layout;
mod shader_table;

pub use layout::{
    BindingKind, BindingLayout, BindingLayoutBuilder, BindingParameter, BindingRange,
    BindingVisibility,
};
pub use shader_table::{ShaderTable, ShaderTableBuilder, ShaderTableRegions};

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::backend::{GpuBackend, GpuPipeline};
use crate::error::GpuError;
use crate::shader::{Shader, ShaderStage};
use crate::types::TextureFormat;

/// Depth/stencil state subset the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    /// Enable depth testing.
    pub depth_test: bool,
    /// Enable depth writes.
    pub depth_write: bool,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
        }
    }
}

/// Rasterizer state subset the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RasterizerState {
    /// Cull back faces.
    pub cull_back: bool,
    /// Rasterize wireframe.
    pub wireframe: bool,
}

/// Blend state subset the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlendState {
    /// Standard alpha blending on the first render target.
    pub alpha_blend: bool,
}

/// Primitive topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    /// Triangle list.
    #[default]
    TriangleList,
    /// Triangle strip.
    TriangleStrip,
    /// Line list.
    LineList,
    /// Point list.
    PointList,
}

/// One subobject of a pipeline stream.
#[derive(Debug, Clone)]
pub enum PipelineSubobject {
    /// Binding layout.
    Layout(Arc<BindingLayout>),
    /// Vertex shader.
    VertexShader(Arc<Shader>),
    /// Pixel shader.
    PixelShader(Arc<Shader>),
    /// Compute shader.
    ComputeShader(Arc<Shader>),
    /// Mesh shader.
    MeshShader(Arc<Shader>),
    /// Amplification/task shader.
    AmplificationShader(Arc<Shader>),
    /// Depth/stencil state.
    DepthStencil(DepthStencilState),
    /// Rasterizer state.
    Rasterizer(RasterizerState),
    /// Blend state.
    Blend(BlendState),
    /// Attachment formats.
    RenderTargets {
        /// Color attachment formats.
        color_formats: Vec<TextureFormat>,
        /// Depth attachment format.
        depth_format: Option<TextureFormat>,
    },
    /// Primitive topology.
    Topology(PrimitiveTopology),
}

/// Ordered collection of pipeline subobjects.
#[derive(Debug, Clone, Default)]
pub struct PipelineStream {
    subobjects: Vec<PipelineSubobject>,
}

impl PipelineStream {
    /// Start an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subobject.
    pub fn push(mut self, subobject: PipelineSubobject) -> Self {
        self.subobjects.push(subobject);
        self
    }

    /// The subobjects in declaration order.
    pub fn subobjects(&self) -> &[PipelineSubobject] {
        &self.subobjects
    }
}

/// Resolved graphics pipeline description.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub layout: Arc<BindingLayout>,
    pub vertex: Arc<Shader>,
    pub pixel: Option<Arc<Shader>>,
    pub depth_stencil: DepthStencilState,
    pub rasterizer: RasterizerState,
    pub blend: BlendState,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub topology: PrimitiveTopology,
}

/// Resolved mesh-shading pipeline description.
#[derive(Debug, Clone)]
pub struct MeshPipelineDesc {
    pub layout: Arc<BindingLayout>,
    pub mesh: Arc<Shader>,
    pub amplification: Option<Arc<Shader>>,
    pub pixel: Option<Arc<Shader>>,
    pub depth_stencil: DepthStencilState,
    pub rasterizer: RasterizerState,
    pub blend: BlendState,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

/// Resolved compute pipeline description.
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub layout: Arc<BindingLayout>,
    pub shader: Arc<Shader>,
}

/// A shader exported into a ray-tracing pipeline.
#[derive(Debug, Clone)]
pub struct RaytracingShader {
    /// The shader blob.
    pub shader: Arc<Shader>,
    /// Export name referenced by shader tables.
    pub export: String,
}

/// A ray-tracing hit group.
#[derive(Debug, Clone)]
pub struct HitGroup {
    /// Group name referenced by shader tables.
    pub name: String,
    /// Closest-hit shader export.
    pub closest_hit: Option<String>,
    /// Any-hit shader export.
    pub any_hit: Option<String>,
    /// Intersection shader export.
    pub intersection: Option<String>,
}

/// Resolved ray-tracing pipeline description.
#[derive(Debug, Clone)]
pub struct RaytracingPipelineDesc {
    pub layout: Arc<BindingLayout>,
    pub shaders: Vec<RaytracingShader>,
    pub hit_groups: Vec<HitGroup>,
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
}

/// A fully resolved pipeline description, one variant per pipeline kind.
#[derive(Debug, Clone)]
pub enum PipelineDesc {
    /// Vertex/pixel pipeline.
    Graphics(GraphicsPipelineDesc),
    /// Mesh-shading pipeline.
    Mesh(MeshPipelineDesc),
    /// Compute pipeline.
    Compute(ComputePipelineDesc),
    /// Ray-tracing pipeline.
    Raytracing(RaytracingPipelineDesc),
}

impl PipelineDesc {
    /// Human-readable kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Graphics(_) => "graphics",
            Self::Mesh(_) => "mesh",
            Self::Compute(_) => "compute",
            Self::Raytracing(_) => "raytracing",
        }
    }

    /// Every export name shader tables may reference: ray generation and
    /// miss exports plus hit group names. Empty for non-ray-tracing kinds.
    pub fn export_names(&self) -> Vec<String> {
        match self {
            Self::Raytracing(desc) => {
                let mut names: Vec<String> = desc
                    .shaders
                    .iter()
                    .filter(|s| {
                        matches!(
                            s.shader.stage(),
                            ShaderStage::RayGeneration | ShaderStage::Miss
                        )
                    })
                    .map(|s| s.export.clone())
                    .collect();
                names.extend(desc.hit_groups.iter().map(|g| g.name.clone()));
                names
            }
            _ => Vec::new(),
        }
    }

    /// Shaders referenced by this description, for registration.
    pub fn shaders(&self) -> Vec<Arc<Shader>> {
        match self {
            Self::Graphics(desc) => {
                let mut shaders = vec![desc.vertex.clone()];
                shaders.extend(desc.pixel.clone());
                shaders
            }
            Self::Mesh(desc) => {
                let mut shaders = vec![desc.mesh.clone()];
                shaders.extend(desc.amplification.clone());
                shaders.extend(desc.pixel.clone());
                shaders
            }
            Self::Compute(desc) => vec![desc.shader.clone()],
            Self::Raytracing(desc) => desc.shaders.iter().map(|s| s.shader.clone()).collect(),
        }
    }
}

/// Fold a pipeline stream into a concrete description.
///
/// The single match below is the only place subobject kinds are
/// interpreted; adding a subobject means extending this visitor, nothing
/// else.
pub fn resolve_stream(stream: PipelineStream) -> Result<PipelineDesc, GpuError> {
    let mut layout = None;
    let mut vertex = None;
    let mut pixel = None;
    let mut compute = None;
    let mut mesh = None;
    let mut amplification = None;
    let mut depth_stencil = DepthStencilState::default();
    let mut rasterizer = RasterizerState::default();
    let mut blend = BlendState::default();
    let mut color_formats = Vec::new();
    let mut depth_format = None;
    let mut topology = PrimitiveTopology::default();

    for subobject in stream.subobjects {
        match subobject {
            PipelineSubobject::Layout(l) => layout = Some(l),
            PipelineSubobject::VertexShader(s) => vertex = Some(s),
            PipelineSubobject::PixelShader(s) => pixel = Some(s),
            PipelineSubobject::ComputeShader(s) => compute = Some(s),
            PipelineSubobject::MeshShader(s) => mesh = Some(s),
            PipelineSubobject::AmplificationShader(s) => amplification = Some(s),
            PipelineSubobject::DepthStencil(state) => depth_stencil = state,
            PipelineSubobject::Rasterizer(state) => rasterizer = state,
            PipelineSubobject::Blend(state) => blend = state,
            PipelineSubobject::RenderTargets {
                color_formats: colors,
                depth_format: depth,
            } => {
                color_formats = colors;
                depth_format = depth;
            }
            PipelineSubobject::Topology(t) => topology = t,
        }
    }

    let layout = layout.ok_or_else(|| {
        GpuError::InvalidParameter("pipeline stream has no binding layout".to_string())
    })?;

    match (compute, mesh, vertex) {
        (Some(shader), None, None) => {
            if pixel.is_some() || amplification.is_some() {
                return Err(GpuError::InvalidParameter(
                    "compute pipeline mixed with graphics stages".to_string(),
                ));
            }
            Ok(PipelineDesc::Compute(ComputePipelineDesc { layout, shader }))
        }
        (None, Some(mesh), None) => Ok(PipelineDesc::Mesh(MeshPipelineDesc {
            layout,
            mesh,
            amplification,
            pixel,
            depth_stencil,
            rasterizer,
            blend,
            color_formats,
            depth_format,
        })),
        (None, None, Some(vertex)) => {
            if amplification.is_some() {
                return Err(GpuError::InvalidParameter(
                    "vertex pipeline mixed with amplification stage".to_string(),
                ));
            }
            Ok(PipelineDesc::Graphics(GraphicsPipelineDesc {
                layout,
                vertex,
                pixel,
                depth_stencil,
                rasterizer,
                blend,
                color_formats,
                depth_format,
                topology,
            }))
        }
        (None, None, None) => Err(GpuError::InvalidParameter(
            "pipeline stream has no entry-stage shader".to_string(),
        )),
        _ => Err(GpuError::InvalidParameter(
            "pipeline stream mixes mutually exclusive entry stages".to_string(),
        )),
    }
}

/// A compiled pipeline: the resolved description plus the backend object.
#[derive(Debug)]
pub struct CompiledPipeline {
    desc: PipelineDesc,
    raw: GpuPipeline,
}

impl CompiledPipeline {
    /// The resolved description.
    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    /// The backend pipeline handle.
    pub fn raw(&self) -> &GpuPipeline {
        &self.raw
    }

    /// Shader group identifier for a ray-tracing export.
    pub fn shader_identifier(
        &self,
        name: &str,
    ) -> Option<[u8; crate::backend::SHADER_IDENTIFIER_SIZE]> {
        self.raw.shader_identifier(name)
    }
}

struct HandleState {
    slot: Mutex<Option<Result<Arc<CompiledPipeline>, GpuError>>>,
    ready: Condvar,
}

/// Handle to an in-flight pipeline compilation.
///
/// Cheap to clone. [`wait`](Self::wait) is the lazy synchronization point:
/// the caller that first needs the pipeline pays the join, everyone after
/// gets it for free.
#[derive(Clone)]
pub struct PipelineHandle {
    state: Arc<HandleState>,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("ready", &self.state.slot.lock().is_some())
            .finish()
    }
}

impl PipelineHandle {
    /// The compiled pipeline if compilation already finished.
    pub fn try_get(&self) -> Option<Result<Arc<CompiledPipeline>, GpuError>> {
        self.state.slot.lock().clone()
    }

    /// Block until compilation finishes and return the result.
    pub fn wait(&self) -> Result<Arc<CompiledPipeline>, GpuError> {
        let mut slot = self.state.slot.lock();
        while slot.is_none() {
            self.state.ready.wait(&mut slot);
        }
        slot.as_ref().unwrap().clone()
    }
}

struct CompileJob {
    desc: PipelineDesc,
    state: Arc<HandleState>,
}

/// Worker pool compiling pipelines off the critical path.
pub struct PipelineCompiler {
    sender: Option<mpsc::Sender<CompileJob>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for PipelineCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCompiler")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl PipelineCompiler {
    /// Spawn `worker_count` compilation threads.
    pub fn new(backend: Arc<dyn GpuBackend>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<CompileJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|index| {
                let receiver = receiver.clone();
                let backend = backend.clone();
                thread::Builder::new()
                    .name(format!("pipeline-compiler-{index}"))
                    .spawn(move || loop {
                        let job = {
                            let receiver = receiver.lock();
                            receiver.recv()
                        };
                        let Ok(job) = job else { break };
                        let result = backend
                            .compile_pipeline(&job.desc)
                            .map(|raw| Arc::new(CompiledPipeline {
                                desc: job.desc,
                                raw,
                            }));
                        if let Err(e) = &result {
                            log::error!("pipeline compilation failed: {e}");
                        }
                        *job.state.slot.lock() = Some(result);
                        job.state.ready.notify_all();
                    })
                    .expect("failed to spawn pipeline compiler thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a description for compilation and return its handle.
    pub fn compile(&self, desc: PipelineDesc) -> PipelineHandle {
        let state = Arc::new(HandleState {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        let handle = PipelineHandle {
            state: state.clone(),
        };
        self.sender
            .as_ref()
            .expect("pipeline compiler already shut down")
            .send(CompileJob { desc, state })
            .expect("pipeline compiler workers are gone");
        handle
    }
}

impl Drop for PipelineCompiler {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn test_layout() -> Arc<BindingLayout> {
        BindingLayout::builder().constants(0, 0, 4).build()
    }

    fn test_shader(stage: ShaderStage) -> Arc<Shader> {
        Arc::new(Shader::new(stage, vec![1, 2, 3], "main"))
    }

    #[test]
    fn test_resolve_graphics_stream() {
        let stream = PipelineStream::new()
            .push(PipelineSubobject::Layout(test_layout()))
            .push(PipelineSubobject::VertexShader(test_shader(
                ShaderStage::Vertex,
            )))
            .push(PipelineSubobject::PixelShader(test_shader(
                ShaderStage::Pixel,
            )))
            .push(PipelineSubobject::RenderTargets {
                color_formats: vec![TextureFormat::Rgba16Float],
                depth_format: Some(TextureFormat::Depth32Float),
            });

        match resolve_stream(stream).unwrap() {
            PipelineDesc::Graphics(desc) => {
                assert_eq!(desc.color_formats.len(), 1);
                assert!(desc.pixel.is_some());
            }
            other => panic!("resolved to {}", other.kind_name()),
        }
    }

    #[test]
    fn test_resolve_compute_stream() {
        let stream = PipelineStream::new()
            .push(PipelineSubobject::Layout(test_layout()))
            .push(PipelineSubobject::ComputeShader(test_shader(
                ShaderStage::Compute,
            )));
        assert!(matches!(
            resolve_stream(stream).unwrap(),
            PipelineDesc::Compute(_)
        ));
    }

    #[test]
    fn test_resolve_rejects_stage_mix() {
        let stream = PipelineStream::new()
            .push(PipelineSubobject::Layout(test_layout()))
            .push(PipelineSubobject::ComputeShader(test_shader(
                ShaderStage::Compute,
            )))
            .push(PipelineSubobject::VertexShader(test_shader(
                ShaderStage::Vertex,
            )));
        assert!(resolve_stream(stream).is_err());
    }

    #[test]
    fn test_resolve_requires_layout() {
        let stream = PipelineStream::new().push(PipelineSubobject::ComputeShader(test_shader(
            ShaderStage::Compute,
        )));
        assert!(resolve_stream(stream).is_err());
    }

    #[test]
    fn test_async_compile_blocks_on_first_use() {
        let backend = Arc::new(DummyBackend::new());
        let compiler = PipelineCompiler::new(backend as Arc<dyn GpuBackend>, 2);

        let stream = PipelineStream::new()
            .push(PipelineSubobject::Layout(test_layout()))
            .push(PipelineSubobject::ComputeShader(test_shader(
                ShaderStage::Compute,
            )));
        let handle = compiler.compile(resolve_stream(stream).unwrap());

        let pipeline = handle.wait().unwrap();
        assert_eq!(pipeline.desc().kind_name(), "compute");
        // Subsequent waits return the cached result.
        assert!(handle.try_get().is_some());
        let again = handle.wait().unwrap();
        assert!(Arc::ptr_eq(&pipeline, &again));
    }

    #[test]
    fn test_raytracing_export_names() {
        let desc = PipelineDesc::Raytracing(RaytracingPipelineDesc {
            layout: test_layout(),
            shaders: vec![
                RaytracingShader {
                    shader: test_shader(ShaderStage::RayGeneration),
                    export: "raygen_main".to_string(),
                },
                RaytracingShader {
                    shader: test_shader(ShaderStage::Miss),
                    export: "miss_main".to_string(),
                },
                RaytracingShader {
                    shader: test_shader(ShaderStage::ClosestHit),
                    export: "closest_hit_main".to_string(),
                },
            ],
            hit_groups: vec![HitGroup {
                name: "opaque_hit".to_string(),
                closest_hit: Some("closest_hit_main".to_string()),
                any_hit: None,
                intersection: None,
            }],
            max_recursion_depth: 1,
            max_payload_size: 32,
        });

        let names = desc.export_names();
        assert_eq!(names, vec!["raygen_main", "miss_main", "opaque_hit"]);
    }
}
