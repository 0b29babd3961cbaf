use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use inference_serving::pipeline::runner::StepRunner;
use inference_serving::pipeline::script::ScriptStepRunner;
use inference_serving::pipeline::step::{ScriptConfig, ScriptStepConfig, StepIo};
use inference_serving::pipeline::Batch;
use inference_serving::record::{NdArray, Record, Value};
use inference_serving::runtime::{
    Bindings, RuntimeRegistry, ScriptEngine, ScriptEngineFactory, ScriptValue,
};
use inference_serving::schema::{ColumnType, Schema};

/// Engine whose sessions count executions: each call sets `x` to the
/// session-local call number. Lets tests observe shared-session state.
struct CountingEngine {
    calls: AtomicI64,
}

#[async_trait]
impl ScriptEngine for CountingEngine {
    async fn execute(
        &self,
        _source: &str,
        _bindings: Bindings,
        _setup_and_run: bool,
    ) -> inference_serving::error::Result<Bindings> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut out = HashMap::new();
        out.insert("x".to_string(), ScriptValue::Int(n));
        Ok(out)
    }
}

struct CountingFactory;

impl ScriptEngineFactory for CountingFactory {
    fn open_session(&self) -> inference_serving::error::Result<Box<dyn ScriptEngine>> {
        Ok(Box::new(CountingEngine {
            calls: AtomicI64::new(0),
        }))
    }
}

fn registry_with_counting() -> RuntimeRegistry {
    let mut registry = RuntimeRegistry::with_builtins();
    registry.register_engine("counting", Arc::new(CountingFactory));
    registry
}

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn long_schema(name: &str) -> Schema {
    Schema::builder().long(name).build().unwrap()
}

fn long_record(column: &str, value: i64) -> Record {
    let mut values = HashMap::new();
    values.insert(column.to_string(), Value::Long(value));
    Record::new(long_schema(column), values).unwrap()
}

/// Script step with two inputs: a counting transform bound to "first",
/// nothing bound to "second".
fn two_input_step(engine: &str, session_per_call: bool) -> ScriptStepConfig {
    ScriptStepConfig {
        io: StepIo::new()
            .with_input("first", long_schema("x"))
            .unwrap()
            .with_input("second", long_schema("y"))
            .unwrap(),
        engine: engine.to_string(),
        scripts: BTreeMap::from([(
            "first".to_string(),
            ScriptConfig {
                code: Some("x = x + 1".to_string()),
                inputs: tags(&[("x", "INT")]),
                session_per_call,
                ..ScriptConfig::default()
            },
        )]),
    }
}

fn two_record_batch() -> Batch {
    Batch::new(
        vec!["first".to_string(), "second".to_string()],
        vec![long_record("x", 41), long_record("y", 7)],
    )
    .unwrap()
}

#[tokio::test]
async fn unbound_input_passes_through_unchanged() -> Result<()> {
    let runner = ScriptStepRunner::new(&two_input_step("counting", false), &registry_with_counting())?;
    let out = runner.transform(two_record_batch()).await?;
    assert_eq!(out.len(), 2);
    // position 1 has no bound transform: the record comes back as-is
    assert_eq!(out.records()[1], long_record("y", 7));
    // position 0 was transformed
    assert_eq!(out.records()[0].get("x"), Some(&Value::Long(1)));
    Ok(())
}

#[tokio::test]
async fn shared_session_state_makes_repeat_calls_non_idempotent() -> Result<()> {
    // With setup_and_run=false and a shared session, interpreter state
    // mutated by one call is visible to the next. Two identical calls
    // yielding different results is the documented contract for
    // side-effecting scripts, not a bug.
    let runner = ScriptStepRunner::new(&two_input_step("counting", false), &registry_with_counting())?;
    let first = runner.transform(two_record_batch()).await?;
    let second = runner.transform(two_record_batch()).await?;
    assert_eq!(first.records()[0].get("x"), Some(&Value::Long(1)));
    assert_eq!(second.records()[0].get("x"), Some(&Value::Long(2)));
    assert_ne!(first.records()[0], second.records()[0]);
    Ok(())
}

#[tokio::test]
async fn per_call_sessions_isolate_state() -> Result<()> {
    let runner = ScriptStepRunner::new(&two_input_step("counting", true), &registry_with_counting())?;
    let first = runner.transform(two_record_batch()).await?;
    let second = runner.transform(two_record_batch()).await?;
    assert_eq!(first.records()[0].get("x"), Some(&Value::Long(1)));
    assert_eq!(second.records()[0].get("x"), Some(&Value::Long(1)));
    Ok(())
}

#[tokio::test]
async fn empty_record_fails_without_poisoning_the_runner() -> Result<()> {
    let runner = ScriptStepRunner::new(&two_input_step("counting", false), &registry_with_counting())?;

    let empty = Batch::new(
        vec!["first".to_string(), "second".to_string()],
        vec![Record::empty(long_schema("x")), long_record("y", 7)],
    )?;
    let err = runner.transform(empty).await.unwrap_err();
    assert_eq!(err.kind(), "EmptyRecordError");

    // The same runner keeps serving valid requests afterward.
    let out = runner.transform(two_record_batch()).await?;
    assert_eq!(out.records()[0].get("x"), Some(&Value::Long(1)));
    Ok(())
}

#[tokio::test]
async fn oversized_batch_processes_every_declared_position() -> Result<()> {
    // Batch length differing from the declared input count is an executor
    // invariant; the runner itself must still handle every declared
    // position without indexing out of range.
    let runner = ScriptStepRunner::new(&two_input_step("counting", false), &registry_with_counting())?;
    let batch = Batch::new(
        vec![
            "first".to_string(),
            "second".to_string(),
            "extra".to_string(),
        ],
        vec![
            long_record("x", 1),
            long_record("y", 2),
            long_record("z", 3),
        ],
    )?;
    let out = runner.transform(batch).await?;
    assert_eq!(out.len(), 3);
    assert_eq!(out.records()[0].get("x"), Some(&Value::Long(1)));
    assert_eq!(out.records()[2], long_record("z", 3));
    Ok(())
}

#[tokio::test]
async fn closed_runner_rejects_transform_calls() -> Result<()> {
    let runner = ScriptStepRunner::new(&two_input_step("counting", false), &registry_with_counting())?;
    runner.close().await?;
    let err = runner.transform(two_record_batch()).await.unwrap_err();
    assert_eq!(err.kind(), "RunnerClosedError");
    Ok(())
}

#[test]
fn compiled_output_schema_follows_fallback_law() {
    // No declared outputs: output schema equals the input variable schema.
    let config = two_input_step("identity", false);
    let runner = ScriptStepRunner::new(&config, &RuntimeRegistry::with_builtins()).unwrap();
    let unit = runner.transform_unit("first").unwrap();
    assert_eq!(unit.output_schema, unit.input_schema);

    // Explicit non-empty outputs win regardless of the input schema.
    let mut config = two_input_step("identity", false);
    let script = config.scripts.get_mut("first").unwrap();
    script.outputs = tags(&[("probability", "FLOAT")]);
    let runner = ScriptStepRunner::new(&config, &RuntimeRegistry::with_builtins()).unwrap();
    let unit = runner.transform_unit("first").unwrap();
    assert_eq!(
        unit.output_schema.column_type("probability"),
        Some(&ColumnType::Double)
    );
    assert!(unit.output_schema.column_type("x").is_none());
}

#[tokio::test]
async fn ndarray_values_survive_a_script_round_trip() -> Result<()> {
    let array = NdArray::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
    let schema = Schema::builder().ndarray("x", vec![2, 2]).build()?;
    let mut values = HashMap::new();
    values.insert("x".to_string(), Value::NdArray(array.clone()));
    let record = Record::new(schema.clone(), values)?;

    let config = ScriptStepConfig {
        io: StepIo::new().with_default_input(schema).unwrap(),
        engine: "identity".to_string(),
        scripts: BTreeMap::from([(
            "default".to_string(),
            ScriptConfig {
                code: Some("pass".to_string()),
                inputs: tags(&[("x", "NDARRAY")]),
                ..ScriptConfig::default()
            },
        )]),
    };
    let runner = ScriptStepRunner::new(&config, &RuntimeRegistry::with_builtins())?;
    let out = runner
        .transform(Batch::new(vec!["default".to_string()], vec![record])?)
        .await?;
    assert_eq!(out.records()[0].get("x"), Some(&Value::NdArray(array)));
    Ok(())
}
