//! Instrumentation of shaders with bounds checks.
//!
//! Shaders are represented in the register-based [`ir`]. When a shader module is created, the
//! [`InstrumentationEngine`] runs the [`instrument`] pass over it and caches the result, keyed by
//! the program's content hash and the active [`InstrumentationConfig`]. Each distinct
//! instrumented shader gets a module id, which is what violation records refer to.

pub use self::instrument::{instrument, InstrumentError, Instrumented, UnsupportedConstruct};
use self::ir::{Program, ShaderStage};
use crate::cache::OnceCache;
use foldhash::HashMap;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

pub mod instrument;
pub mod ir;

/// The parts of the validation configuration that affect instrumented code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrumentationConfig {
    /// Whether loads and stores through buffer references are checked.
    pub validate_buffer_device_address: bool,
}

impl Default for InstrumentationConfig {
    #[inline]
    fn default() -> Self {
        InstrumentationConfig {
            validate_buffer_device_address: true,
        }
    }
}

/// A shader program with bounds checks inserted.
#[derive(Debug)]
pub struct InstrumentedShader {
    module_id: u32,
    name: Arc<str>,
    stage: ShaderStage,
    source_hash: u64,
    program: Program,
    checked_accesses: u32,
    unsupported: Vec<UnsupportedConstruct>,
}

impl InstrumentedShader {
    /// Returns the id that violation records produced by this shader carry.
    #[inline]
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Returns the content hash of the program this was instrumented from.
    #[inline]
    pub fn source_hash(&self) -> u64 {
        self.source_hash
    }

    /// Returns the instrumented program.
    #[inline]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Returns the number of accesses that are guarded by a bounds check.
    ///
    /// If this is zero, the shader never writes to the diagnostic buffer.
    #[inline]
    pub fn checked_accesses(&self) -> u32 {
        self.checked_accesses
    }

    /// Returns the accesses that are executed without a bounds check.
    #[inline]
    pub fn unsupported(&self) -> &[UnsupportedConstruct] {
        &self.unsupported
    }
}

/// Produces and caches instrumented shaders.
#[derive(Debug)]
pub struct InstrumentationEngine {
    cache: OnceCache<(u64, InstrumentationConfig), Arc<InstrumentedShader>>,
    next_module_id: AtomicU32,
    names: RwLock<HashMap<u32, Arc<str>>>,
}

impl Default for InstrumentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentationEngine {
    pub fn new() -> Self {
        InstrumentationEngine {
            cache: OnceCache::new(),
            next_module_id: AtomicU32::new(1),
            names: RwLock::new(HashMap::default()),
        }
    }

    /// Returns the instrumented version of `program` for `config`, instrumenting it if this is
    /// the first time the combination is seen.
    ///
    /// The returned flag is `true` if the shader came from the cache.
    pub fn instrument(
        &self,
        program: &Program,
        config: InstrumentationConfig,
    ) -> Result<(Arc<InstrumentedShader>, bool), InstrumentError> {
        let source_hash = program.content_hash();

        self.cache.get_or_try_insert(&(source_hash, config), || {
            let Instrumented {
                program: instrumented,
                checked_accesses,
                unsupported,
            } = instrument(program)?;

            let module_id = self.next_module_id.fetch_add(1, Ordering::Relaxed);
            let name: Arc<str> = Arc::from(program.name.as_str());
            self.names.write().insert(module_id, name.clone());

            tracing::debug!(
                module_id,
                name = %program.name,
                checked_accesses,
                unsupported = unsupported.len(),
                "instrumented shader",
            );

            let shader = Arc::new(InstrumentedShader {
                module_id,
                name,
                stage: program.stage,
                source_hash,
                program: instrumented,
                checked_accesses,
                unsupported,
            });

            Ok(((source_hash, config), shader))
        })
    }

    /// Returns the name of the shader with the given module id.
    pub fn module_name(&self, module_id: u32) -> Option<Arc<str>> {
        self.names.read().get(&module_id).cloned()
    }

    /// Returns the number of cached instrumented shaders.
    pub fn cached_shaders(&self) -> usize {
        self.cache.len()
    }
}
