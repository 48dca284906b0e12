//! Compiled shader blobs and the crash-handler lookup boundary.
//!
//! Shader *source* compilation happens outside this crate; what arrives here
//! is opaque bytecode plus an optional debug-symbol blob. Each blob gets a
//! stable hash so external crash tooling can ask "which binary produced this
//! shader hash?" long after the fact.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

/// Pipeline stage a shader blob targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader.
    Vertex,
    /// Pixel/fragment shader.
    Pixel,
    /// Compute shader.
    Compute,
    /// Mesh shader.
    Mesh,
    /// Amplification/task shader.
    Amplification,
    /// Ray generation shader.
    RayGeneration,
    /// Ray miss shader.
    Miss,
    /// Ray closest-hit shader.
    ClosestHit,
    /// Ray any-hit shader.
    AnyHit,
    /// Ray intersection shader.
    Intersection,
}

/// An opaque compiled shader: bytecode, entry point and optional debug blob.
#[derive(Debug, Clone)]
pub struct Shader {
    bytecode: Vec<u8>,
    entry_point: String,
    stage: ShaderStage,
    debug_info: Option<Vec<u8>>,
    hash: u64,
}

impl Shader {
    /// Wrap compiled bytecode.
    ///
    /// The hash is computed over the bytecode only, so recompiling identical
    /// source yields the same hash regardless of debug-info presence.
    pub fn new(stage: ShaderStage, bytecode: Vec<u8>, entry_point: impl Into<String>) -> Self {
        let hash = hash_bytecode(&bytecode);
        Self {
            bytecode,
            entry_point: entry_point.into(),
            stage,
            debug_info: None,
            hash,
        }
    }

    /// Attach a debug-symbol blob.
    pub fn with_debug_info(mut self, debug_info: Vec<u8>) -> Self {
        self.debug_info = Some(debug_info);
        self
    }

    /// The compiled bytecode.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// The entry point name.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// The stage this shader targets.
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// The debug-symbol blob, if the compiler produced one.
    pub fn debug_info(&self) -> Option<&[u8]> {
        self.debug_info.as_deref()
    }

    /// Stable hash of the bytecode.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

fn hash_bytecode(bytecode: &[u8]) -> u64 {
    // DefaultHasher with fixed keys; stable within a build, which is all the
    // crash tooling needs (it matches hashes from the same session's dumps).
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytecode.hash(&mut hasher);
    hasher.finish()
}

/// Registry of every shader the device has seen, keyed by bytecode hash.
///
/// The device registers shaders as pipelines are created; the crash handler
/// queries it when a GPU fault report names a shader hash.
#[derive(Debug, Default)]
pub struct ShaderDatabase {
    shaders: RwLock<HashMap<u64, Arc<Shader>>>,
}

impl ShaderDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shader. Re-registering the same hash is a no-op.
    pub fn register(&self, shader: &Arc<Shader>) {
        self.shaders
            .write()
            .entry(shader.hash())
            .or_insert_with(|| Arc::clone(shader));
    }

    /// Look up a shader's bytecode by hash.
    pub fn lookup_binary(&self, hash: u64) -> Option<Arc<Shader>> {
        self.shaders.read().get(&hash).cloned()
    }

    /// Look up a shader's debug-symbol blob by hash.
    pub fn lookup_debug_info(&self, hash: u64) -> Option<Vec<u8>> {
        self.shaders
            .read()
            .get(&hash)
            .and_then(|s| s.debug_info().map(<[u8]>::to_vec))
    }

    /// Number of registered shaders.
    pub fn len(&self) -> usize {
        self.shaders.read().len()
    }

    /// Whether the database is empty.
    pub fn is_empty(&self) -> bool {
        self.shaders.read().is_empty()
    }
}

/// External GPU crash/telemetry tooling boundary.
///
/// Registered once at device creation. The device hands over the shader
/// database so the handler can resolve shader hashes from fault reports; the
/// core never calls back into the handler on any hot path.
pub trait CrashHandler: Send + Sync {
    /// Called once when the device finishes construction.
    fn on_device_created(&self, shaders: &Arc<ShaderDatabase>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_hash_stable() {
        let a = Shader::new(ShaderStage::Compute, vec![1, 2, 3, 4], "main");
        let b = Shader::new(ShaderStage::Compute, vec![1, 2, 3, 4], "other_entry");
        let c = Shader::new(ShaderStage::Compute, vec![1, 2, 3, 5], "main");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_database_lookup() {
        let db = ShaderDatabase::new();
        let shader = Arc::new(
            Shader::new(ShaderStage::Pixel, vec![0xde, 0xad], "ps_main")
                .with_debug_info(vec![1, 2, 3]),
        );
        db.register(&shader);

        let found = db.lookup_binary(shader.hash()).unwrap();
        assert_eq!(found.bytecode(), &[0xde, 0xad]);
        assert_eq!(db.lookup_debug_info(shader.hash()), Some(vec![1, 2, 3]));
        assert!(db.lookup_binary(0).is_none());
    }
}
