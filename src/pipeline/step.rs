use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServingError};
use crate::schema::{ColumnType, Schema};

/// Input name used when a step declares a single unnamed input.
pub const DEFAULT_INPUT_NAME: &str = "default";

/// One named schema registration, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSchema {
    pub name: String,
    pub schema: Schema,
}

/// Ordered input/output contracts shared by every step kind.
///
/// Registration order is significant: `input_name_at` gives runners the
/// name aligned to each batch position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepIo {
    #[serde(default)]
    inputs: Vec<NamedSchema>,
    #[serde(default)]
    outputs: Vec<NamedSchema>,
}

impl StepIo {
    pub fn new() -> Self {
        StepIo::default()
    }

    /// Registers an input schema under `name`. Re-registering an identical
    /// schema is a no-op; a conflicting schema is a configuration error.
    pub fn with_input(mut self, name: &str, schema: Schema) -> Result<Self> {
        register(&mut self.inputs, "input", name, schema)?;
        Ok(self)
    }

    pub fn with_input_columns(
        self,
        name: &str,
        columns: &[&str],
        types: &[ColumnType],
    ) -> Result<Self> {
        self.with_input(name, Schema::from_columns(columns, types)?)
    }

    /// Registers a schema under the `"default"` input name.
    pub fn with_default_input(self, schema: Schema) -> Result<Self> {
        self.with_input(DEFAULT_INPUT_NAME, schema)
    }

    pub fn with_output(mut self, name: &str, schema: Schema) -> Result<Self> {
        register(&mut self.outputs, "output", name, schema)?;
        Ok(self)
    }

    pub fn with_output_columns(
        self,
        name: &str,
        columns: &[&str],
        types: &[ColumnType],
    ) -> Result<Self> {
        self.with_output(name, Schema::from_columns(columns, types)?)
    }

    pub fn with_default_output(self, schema: Schema) -> Result<Self> {
        self.with_output(DEFAULT_INPUT_NAME, schema)
    }

    pub fn has_input_name(&self, name: &str) -> bool {
        self.inputs.iter().any(|e| e.name == name)
    }

    pub fn has_output_name(&self, name: &str) -> bool {
        self.outputs.iter().any(|e| e.name == name)
    }

    /// The input name registered at `index`, in `with_input` call order.
    pub fn input_name_at(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).map(|e| e.name.as_str())
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|e| e.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|e| e.name.clone()).collect()
    }

    pub fn input_schema(&self, name: &str) -> Option<&Schema> {
        self.inputs
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.schema)
    }

    pub fn output_schema(&self, name: &str) -> Option<&Schema> {
        self.outputs
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.schema)
    }
}

fn register(entries: &mut Vec<NamedSchema>, side: &str, name: &str, schema: Schema) -> Result<()> {
    if let Some(existing) = entries.iter().find(|e| e.name == name) {
        if existing.schema == schema {
            return Ok(());
        }
        return Err(ServingError::Configuration(format!(
            "{side} '{name}' already registered with a different schema"
        )));
    }
    entries.push(NamedSchema {
        name: name.to_string(),
        schema,
    });
    Ok(())
}

/// Worker-pool sizing for model steps: at most `workers` concurrent
/// in-flight backend calls; a queued call waits at most `max_queue_wait_ms`
/// before failing with an inference timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelInferenceConfig {
    pub workers: usize,
    pub max_queue_wait_ms: u64,
}

impl Default for ParallelInferenceConfig {
    fn default() -> Self {
        ParallelInferenceConfig {
            workers: 2,
            max_queue_wait_ms: 5_000,
        }
    }
}

/// Configuration for one model step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStepConfig {
    #[serde(flatten)]
    pub io: StepIo,
    pub model_path: String,
    /// Backend kind, resolved through the runtime registry (e.g. "onnx",
    /// "passthrough").
    pub backend: String,
    #[serde(default)]
    pub input_names: Vec<String>,
    /// Declared output order; drives archive entry order at the boundary.
    pub output_names: Vec<String>,
    #[serde(default)]
    pub parallel_inference: ParallelInferenceConfig,
}

impl ModelStepConfig {
    /// The io contract with schemas synthesized for any declared name that
    /// has no explicit registration: model inputs and outputs default to a
    /// single unresolved-NDARRAY column named after the input/output.
    pub fn effective_io(&self) -> Result<StepIo> {
        let mut io = self.io.clone();
        for name in &self.input_names {
            if !io.has_input_name(name) {
                io = io.with_input(
                    name,
                    Schema::builder()
                        .column(name, ColumnType::ndarray_unresolved())
                        .build()?,
                )?;
            }
        }
        for name in &self.output_names {
            if !io.has_output_name(name) {
                io = io.with_output(
                    name,
                    Schema::builder()
                        .column(name, ColumnType::ndarray_unresolved())
                        .build()?,
                )?;
            }
        }
        Ok(io)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_names.is_empty() {
            return Err(ServingError::Configuration(
                "model step declares no output names".to_string(),
            ));
        }
        if self.parallel_inference.workers == 0 {
            return Err(ServingError::Configuration(
                "model step worker count must be positive".to_string(),
            ));
        }
        // Explicit registrations must cover any name they share with the
        // declared lists; effective_io() surfaces schema conflicts.
        let io = self.effective_io()?;
        for name in &self.input_names {
            if !io.has_input_name(name) {
                return Err(ServingError::Configuration(format!(
                    "model step references undeclared input '{name}'"
                )));
            }
        }
        for name in &self.output_names {
            if !io.has_output_name(name) {
                return Err(ServingError::Configuration(format!(
                    "model step references undeclared output '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Per-input script transform configuration for a script step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Inline source; takes precedence over `code_path`.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_path: Option<PathBuf>,
    /// Declared input variables: name -> script-side type tag (e.g.
    /// "NDARRAY"). Tags are resolved at compile time; an unknown tag is a
    /// fatal unsupported-type error.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Declared output variables; when empty the input variable schema is
    /// reused (the transform is assumed to echo its input shape).
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub return_all_inputs: bool,
    #[serde(default)]
    pub setup_and_run: bool,
    /// Interpreter search path override; process-wide, first writer wins.
    #[serde(default)]
    pub search_path: Option<String>,
    /// When true, a fresh interpreter session is opened per transform call
    /// instead of sharing one session across calls.
    #[serde(default)]
    pub session_per_call: bool,
}

/// Configuration for one script step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStepConfig {
    #[serde(flatten)]
    pub io: StepIo,
    /// Engine kind, resolved through the runtime registry.
    pub engine: String,
    /// Per-input transforms, keyed by declared input name.
    pub scripts: BTreeMap<String, ScriptConfig>,
}

impl ScriptStepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.io.input_count() == 0 {
            return Err(ServingError::Configuration(
                "script step declares no inputs".to_string(),
            ));
        }
        for key in self.scripts.keys() {
            if !self.io.has_input_name(key) {
                return Err(ServingError::Configuration(format!(
                    "invalid input name specified for transform '{key}'"
                )));
            }
        }
        Ok(())
    }
}

/// Closed set of step kinds. Dispatch on the tag selects the matching
/// runner constructor; adding a kind is a source-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    Model(ModelStepConfig),
    Script(ScriptStepConfig),
}

impl StepConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Model(_) => "model",
            StepConfig::Script(_) => "script",
        }
    }

    /// Validates kind-specific references against the step's schema maps.
    /// Build-time only; runners assume a validated configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            StepConfig::Model(c) => c.validate(),
            StepConfig::Script(c) => c.validate(),
        }
    }

    /// The io contract runners and the executor align batches against.
    pub fn effective_io(&self) -> Result<StepIo> {
        match self {
            StepConfig::Model(c) => c.effective_io(),
            StepConfig::Script(c) => Ok(c.io.clone()),
        }
    }
}
