//! Script step runner: one optional compiled transform per declared input.
//!
//! A script step allows one script per input name. An "input" is usually
//! just `"default"`, but multi-input models may bind one script per named
//! model input. Transforms are compiled at construction from a validated
//! configuration; positions with no bound transform pass their record
//! through unchanged.
//!
//! Sessions are stateful unless `session_per_call` is set: globals mutated
//! by one execution are visible to the next execution on the same runner,
//! so repeated calls are not idempotent for side-effecting scripts. That is
//! the documented contract, not a defect.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, ServingError};
use crate::pipeline::runner::StepRunner;
use crate::pipeline::step::{ScriptConfig, ScriptStepConfig, StepIo};
use crate::pipeline::Batch;
use crate::record::{Record, Value};
use crate::runtime::{
    Bindings, RuntimeRegistry, ScriptEngine, ScriptEngineFactory, ScriptType, ScriptValue,
};
use crate::schema::{ColumnType, Schema};

/// Process-wide interpreter search path. First writer wins; later differing
/// writes are logged and ignored. Deliberately one piece of shared state,
/// not per-runner and not per-request.
static INTERPRETER_SEARCH_PATH: OnceCell<String> = OnceCell::new();

/// The search path applied at startup, if any step configured one.
pub fn interpreter_search_path() -> Option<&'static str> {
    INTERPRETER_SEARCH_PATH.get().map(|s| s.as_str())
}

fn apply_search_path(path: &str) {
    match INTERPRETER_SEARCH_PATH.set(path.to_string()) {
        Ok(()) => info!(path, "overriding interpreter search path"),
        Err(_) => {
            let current = INTERPRETER_SEARCH_PATH.get().map(|s| s.as_str()).unwrap_or("");
            if current != path {
                warn!(
                    ignored = path,
                    current, "interpreter search path already set; ignoring later value"
                );
            }
        }
    }
}

/// A compiled script binding for one input name: resolved source plus the
/// schemas the transform consumes and produces.
///
/// When the configuration declares no output variables, `output_schema` is
/// built from the *input* variable schema. That reuse intentionally mirrors
/// the source system: outputs are then typed identically to inputs even if
/// the script changes shape or type.
#[derive(Debug, Clone)]
pub struct TransformUnit {
    pub source: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub return_all_inputs: bool,
    pub setup_and_run: bool,
    pub session_per_call: bool,
}

/// Builds a [`Schema`] from a `variable name -> tag` map using the fixed
/// script-tag table. NDARRAY columns get the unresolved `[1, 1]` sentinel
/// shape; a concrete shape is only known once a value is observed.
pub fn schema_for_variables(variables: &BTreeMap<String, String>) -> Result<Schema> {
    let mut builder = Schema::builder();
    for (name, tag) in variables {
        builder = match ScriptType::from_tag(tag)? {
            ScriptType::Int => builder.long(name),
            ScriptType::Float => builder.double(name),
            ScriptType::Str | ScriptType::Dict | ScriptType::List => builder.string(name),
            ScriptType::NdArray => builder.column(name, ColumnType::ndarray_unresolved()),
            ScriptType::Bool => builder.boolean(name),
        };
    }
    builder.build()
}

fn resolve_source(input_name: &str, config: &ScriptConfig) -> Result<String> {
    if let Some(code) = &config.code {
        if !code.is_empty() {
            return Ok(code.clone());
        }
    }
    if let Some(path) = &config.code_path {
        info!(input = input_name, path = %path.display(), "resolving script source from file");
        let code = fs::read_to_string(path).map_err(|e| {
            ServingError::SourceUnavailable(format!(
                "unable to read script for input '{input_name}' from {}: {e}",
                path.display()
            ))
        })?;
        if code.is_empty() {
            return Err(ServingError::SourceUnavailable(format!(
                "script for input '{input_name}' at {} resolved to an empty string",
                path.display()
            )));
        }
        return Ok(code);
    }
    Err(ServingError::SourceUnavailable(format!(
        "no script source configured for input '{input_name}'"
    )))
}

fn compile_unit(input_name: &str, config: &ScriptConfig) -> Result<TransformUnit> {
    let source = resolve_source(input_name, config)?;
    let input_schema = schema_for_variables(&config.inputs)?;
    // Explicit non-empty output declaration wins; otherwise fall back to
    // reusing the input variable schema.
    let mut output_schema = if config.outputs.is_empty() {
        input_schema.clone()
    } else {
        schema_for_variables(&config.outputs)?
    };
    if config.return_all_inputs {
        // Outputs first, then any input column not already declared.
        let mut builder = Schema::builder();
        for (name, ty) in output_schema.columns() {
            builder = builder.column(name, ty.clone());
        }
        for (name, ty) in input_schema.columns() {
            if output_schema.column_type(name).is_none() {
                builder = builder.column(name, ty.clone());
            }
        }
        output_schema = builder.build()?;
    }
    Ok(TransformUnit {
        source,
        input_schema,
        output_schema,
        return_all_inputs: config.return_all_inputs,
        setup_and_run: config.setup_and_run,
        session_per_call: config.session_per_call,
    })
}

fn value_to_binding(value: &Value) -> ScriptValue {
    match value {
        Value::Long(v) => ScriptValue::Int(*v),
        Value::Double(v) => ScriptValue::Float(*v),
        Value::String(v) => ScriptValue::Str(v.clone()),
        Value::Boolean(v) => ScriptValue::Bool(*v),
        Value::NdArray(v) => ScriptValue::NdArray(v.clone()),
    }
}

fn binding_to_value(name: &str, binding: &ScriptValue, declared: &ColumnType) -> Result<Value> {
    let value = match binding {
        ScriptValue::Int(v) => Value::Long(*v),
        ScriptValue::Float(v) => Value::Double(*v),
        ScriptValue::Str(v) => Value::String(v.clone()),
        ScriptValue::Bool(v) => Value::Boolean(*v),
        ScriptValue::NdArray(v) => Value::NdArray(v.clone()),
        // DICT and LIST coerce to STRING columns
        ScriptValue::Dict(v) | ScriptValue::List(v) => Value::String(v.to_string()),
    };
    if !declared.accepts(&value.column_type()) {
        return Err(ServingError::Backend(format!(
            "script output variable '{name}' has type {:?}, schema declares {declared:?}",
            value.column_type()
        )));
    }
    Ok(value)
}

pub struct ScriptStepRunner {
    io: StepIo,
    transforms: HashMap<String, TransformUnit>,
    factory: Arc<dyn ScriptEngineFactory>,
    /// Session shared by every call that does not request per-call
    /// isolation. Lazily opened on first use.
    shared_session: Mutex<Option<Box<dyn ScriptEngine>>>,
    closed: AtomicBool,
}

impl ScriptStepRunner {
    pub fn new(config: &ScriptStepConfig, registry: &RuntimeRegistry) -> Result<Self> {
        let mut transforms = HashMap::new();
        for (input_name, script_config) in &config.scripts {
            if !config.io.has_input_name(input_name) {
                return Err(ServingError::Configuration(format!(
                    "invalid input name specified for transform '{input_name}'"
                )));
            }
            if let Some(path) = &script_config.search_path {
                apply_search_path(path);
            }
            let unit = compile_unit(input_name, script_config)?;
            transforms.insert(input_name.clone(), unit);
        }
        let factory = registry.engine_factory(&config.engine)?;
        Ok(ScriptStepRunner {
            io: config.io.clone(),
            transforms,
            factory,
            shared_session: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Compiled transform for an input name, if one is bound. Exposed for
    /// construction-time assertions in tests.
    pub fn transform_unit(&self, input_name: &str) -> Option<&TransformUnit> {
        self.transforms.get(input_name)
    }

    async fn run_unit(&self, input_name: &str, unit: &TransformUnit, record: &Record) -> Result<Record> {
        if record.is_empty() {
            return Err(ServingError::EmptyRecord(input_name.to_string()));
        }

        let mut bindings: Bindings = HashMap::new();
        for (column, _) in unit.input_schema.columns() {
            if let Some(value) = record.get(column) {
                bindings.insert(column.clone(), value_to_binding(value));
            }
        }

        // With return_all_inputs, input bindings back-fill any output
        // column the script itself did not set.
        let inputs_copy = unit.return_all_inputs.then(|| bindings.clone());

        let mut outputs = if unit.session_per_call {
            let session = self.factory.open_session()?;
            session
                .execute(&unit.source, bindings, unit.setup_and_run)
                .await?
        } else {
            let mut guard = self.shared_session.lock().await;
            if guard.is_none() {
                *guard = Some(self.factory.open_session()?);
            }
            let session = guard.as_ref().unwrap();
            session
                .execute(&unit.source, bindings, unit.setup_and_run)
                .await?
        };
        if let Some(inputs) = inputs_copy {
            for (name, value) in inputs {
                outputs.entry(name).or_insert(value);
            }
        }

        let mut values = HashMap::new();
        for (column, declared) in unit.output_schema.columns() {
            let binding = outputs.get(column).ok_or_else(|| {
                ServingError::Backend(format!(
                    "script for input '{input_name}' did not produce output variable '{column}'"
                ))
            })?;
            values.insert(column.clone(), binding_to_value(column, binding, declared)?);
        }
        Record::new(unit.output_schema.clone(), values)
    }
}

#[async_trait]
impl StepRunner for ScriptStepRunner {
    fn io(&self) -> &StepIo {
        &self.io
    }

    async fn transform(&self, batch: Batch) -> Result<Batch> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServingError::RunnerClosed(
                "script step runner has been closed".to_string(),
            ));
        }

        let (names, records) = batch.into_parts();
        let mut out = Vec::with_capacity(records.len());
        for (position, record) in records.into_iter().enumerate() {
            // Position-to-name alignment comes from the declared input
            // order; positions beyond the declared inputs pass through.
            let bound = self
                .io
                .input_name_at(position)
                .and_then(|name| self.transforms.get(name).map(|unit| (name, unit)));
            match bound {
                Some((name, unit)) => out.push(self.run_unit(name, unit, &record).await?),
                None => out.push(record),
            }
        }
        debug!("post script transform execution");
        Batch::new(names, out)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.shared_session.lock().await.take();
        Ok(())
    }
}
