//! Built-in smoke-test collaborators: a model backend that echoes its
//! inputs and a script engine that returns its bindings unchanged. Used by
//! deployment smoke tests and the integration suite; real integrations
//! (ONNX, Python) register their own factories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::NdArray;
use crate::runtime::{
    Bindings, ModelBackend, ModelBackendFactory, ScriptEngine, ScriptEngineFactory,
};

pub struct PassthroughFactory;

impl ModelBackendFactory for PassthroughFactory {
    fn load(&self, _model_path: &str) -> Result<Arc<dyn ModelBackend>> {
        Ok(Arc::new(PassthroughBackend))
    }
}

/// Echoes every input array back under its input name.
pub struct PassthroughBackend;

#[async_trait]
impl ModelBackend for PassthroughBackend {
    async fn infer(&self, inputs: HashMap<String, NdArray>) -> Result<HashMap<String, NdArray>> {
        Ok(inputs)
    }
}

pub struct IdentityEngineFactory;

impl ScriptEngineFactory for IdentityEngineFactory {
    fn open_session(&self) -> Result<Box<dyn ScriptEngine>> {
        Ok(Box::new(IdentityEngine))
    }
}

/// Returns input bindings unchanged, ignoring the source entirely.
pub struct IdentityEngine;

#[async_trait]
impl ScriptEngine for IdentityEngine {
    async fn execute(
        &self,
        _source: &str,
        bindings: Bindings,
        _setup_and_run: bool,
    ) -> Result<Bindings> {
        Ok(bindings)
    }
}
