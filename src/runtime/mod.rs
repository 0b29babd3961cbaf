//! External collaborator boundary: model backends and script engines.
//!
//! Numeric model execution and script-language semantics live behind these
//! traits; the pipeline core only depends on the narrow contracts here.
//! Concrete integrations (ONNX runtimes, Python interpreters) register
//! factories in a [`RuntimeRegistry`] keyed by kind string.

pub mod passthrough;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServingError};
use crate::record::NdArray;

/// Script-side variable type tags, as declared in step configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScriptType {
    Int,
    Float,
    Str,
    Dict,
    List,
    NdArray,
    Bool,
}

impl ScriptType {
    /// Parses a configured tag string. Unknown tags are fatal at build
    /// time; there is no recovery path for an unrecognized variable type.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "INT" => Ok(ScriptType::Int),
            "FLOAT" => Ok(ScriptType::Float),
            "STR" => Ok(ScriptType::Str),
            "DICT" => Ok(ScriptType::Dict),
            "LIST" => Ok(ScriptType::List),
            "NDARRAY" => Ok(ScriptType::NdArray),
            "BOOL" => Ok(ScriptType::Bool),
            other => Err(ServingError::UnsupportedType(other.to_string())),
        }
    }
}

/// A value crossing the script-engine boundary, tagged with its
/// script-side type.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Int(i64),
    Float(f64),
    Str(String),
    Dict(serde_json::Value),
    List(serde_json::Value),
    NdArray(NdArray),
    Bool(bool),
}

/// Variable bindings passed into and out of a script execution.
pub type Bindings = HashMap<String, ScriptValue>;

/// One interpreter session. Sessions are stateful: globals mutated by one
/// `execute` call are visible to later calls on the same session unless the
/// engine isolates state internally.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Execute `source` with the given input bindings and return the output
    /// bindings. When `setup_and_run` is true the engine runs the script's
    /// setup/run split instead of executing the body directly.
    async fn execute(
        &self,
        source: &str,
        bindings: Bindings,
        setup_and_run: bool,
    ) -> Result<Bindings>;
}

/// Opens interpreter sessions for one engine kind.
pub trait ScriptEngineFactory: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn ScriptEngine>>;
}

/// A loaded model. `infer` is deterministic given fixed weights and input.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn infer(&self, inputs: HashMap<String, NdArray>) -> Result<HashMap<String, NdArray>>;
}

/// Loads models for one backend kind (e.g. "onnx").
pub trait ModelBackendFactory: Send + Sync {
    fn load(&self, model_path: &str) -> Result<Arc<dyn ModelBackend>>;
}

/// String-keyed factory registry connecting step configuration (`backend` /
/// `engine` kind fields) to runtime integrations.
pub struct RuntimeRegistry {
    backends: HashMap<String, Arc<dyn ModelBackendFactory>>,
    engines: HashMap<String, Arc<dyn ScriptEngineFactory>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        RuntimeRegistry {
            backends: HashMap::new(),
            engines: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in smoke-test collaborators:
    /// the `passthrough` model backend and the `identity` script engine.
    pub fn with_builtins() -> Self {
        let mut registry = RuntimeRegistry::new();
        registry.register_backend("passthrough", Arc::new(passthrough::PassthroughFactory));
        registry.register_engine("identity", Arc::new(passthrough::IdentityEngineFactory));
        registry
    }

    pub fn register_backend(&mut self, kind: &str, factory: Arc<dyn ModelBackendFactory>) {
        self.backends.insert(kind.to_string(), factory);
    }

    pub fn register_engine(&mut self, kind: &str, factory: Arc<dyn ScriptEngineFactory>) {
        self.engines.insert(kind.to_string(), factory);
    }

    pub fn backend_factory(&self, kind: &str) -> Result<Arc<dyn ModelBackendFactory>> {
        self.backends.get(kind).cloned().ok_or_else(|| {
            ServingError::Configuration(format!("no model backend registered for kind '{kind}'"))
        })
    }

    pub fn engine_factory(&self, kind: &str) -> Result<Arc<dyn ScriptEngineFactory>> {
        self.engines.get(kind).cloned().ok_or_else(|| {
            ServingError::Configuration(format!("no script engine registered for kind '{kind}'"))
        })
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        RuntimeRegistry::with_builtins()
    }
}
