//! Sequences compiled runners and routes record batches between them.

use tracing::{debug, info};

use crate::error::{Result, ServingError};
use crate::pipeline::runner::{build_runner, StepRunner};
use crate::pipeline::step::StepConfig;
use crate::pipeline::Batch;
use crate::runtime::RuntimeRegistry;

/// Owns the ordered list of compiled step runners for one pipeline.
///
/// Built once at startup; a build-time error in any step aborts
/// construction, so a partial pipeline never serves traffic. Within one
/// `execute` call steps run strictly sequentially; concurrency exists only
/// across requests and inside a model runner's worker pool.
pub struct PipelineExecutor {
    runners: Vec<Box<dyn StepRunner>>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("step_count", &self.runners.len())
            .finish()
    }
}

impl PipelineExecutor {
    pub fn build(steps: &[StepConfig], registry: &RuntimeRegistry) -> Result<Self> {
        if steps.is_empty() {
            return Err(ServingError::Configuration(
                "pipeline declares no steps".to_string(),
            ));
        }
        let mut runners = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let runner = build_runner(step, registry)?;
            info!(index, kind = step.kind(), "compiled pipeline step");
            runners.push(runner);
        }
        Ok(PipelineExecutor { runners })
    }

    pub fn step_count(&self) -> usize {
        self.runners.len()
    }

    /// Input names the first step expects, in declared order.
    pub fn input_names(&self) -> Vec<String> {
        self.runners
            .first()
            .map(|r| r.io().input_names())
            .unwrap_or_default()
    }

    /// Output names of the final step, in declared order. Drives archive
    /// entry ordering at the serving boundary.
    pub fn output_names(&self) -> Vec<String> {
        self.runners
            .last()
            .map(|r| {
                let declared = r.io().output_names();
                if declared.is_empty() {
                    r.io().input_names()
                } else {
                    declared
                }
            })
            .unwrap_or_default()
    }

    /// Routes `batch` through every runner in declaration order. Alignment
    /// between batch positions and declared names is validated at each step
    /// boundary; a runner whose output disagrees with its declared contract
    /// fails the request with `CardinalityMismatchError`.
    pub async fn execute(&self, batch: Batch) -> Result<Batch> {
        let mut current = batch;
        for (index, runner) in self.runners.iter().enumerate() {
            let io = runner.io();
            if current.len() != io.input_count() {
                return Err(ServingError::CardinalityMismatch(format!(
                    "step {index} expects {} input records, batch has {}",
                    io.input_count(),
                    current.len()
                )));
            }
            for (position, name) in current.names().iter().enumerate() {
                match io.input_name_at(position) {
                    Some(declared) if declared == name => {}
                    Some(declared) => {
                        return Err(ServingError::CardinalityMismatch(format!(
                            "step {index} position {position}: batch is aligned to \
                             '{name}', step declares '{declared}'"
                        )))
                    }
                    None => {
                        return Err(ServingError::CardinalityMismatch(format!(
                            "step {index} declares no input at position {position}"
                        )))
                    }
                }
            }

            let produced = runner.transform(current).await?;

            let declared_outputs = io.output_names();
            if !declared_outputs.is_empty() && produced.names() != declared_outputs.as_slice() {
                return Err(ServingError::CardinalityMismatch(format!(
                    "step {index} produced outputs {:?}, declared {declared_outputs:?}",
                    produced.names()
                )));
            }
            debug!(step = index, records = produced.len(), "step complete");
            current = produced;
        }
        Ok(current)
    }

    /// Closes every runner in reverse build order.
    pub async fn close(&self) -> Result<()> {
        for runner in self.runners.iter().rev() {
            runner.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;
    use crate::pipeline::step::{
        ModelStepConfig, ParallelInferenceConfig, ScriptConfig, ScriptStepConfig, StepIo,
    };
    use crate::record::{NdArray, Record, Value};
    use crate::schema::Schema;

    fn model_step(input: &str, outputs: &[&str]) -> StepConfig {
        StepConfig::Model(ModelStepConfig {
            io: StepIo::new(),
            model_path: "unused".to_string(),
            backend: "passthrough".to_string(),
            input_names: vec![input.to_string()],
            output_names: outputs.iter().map(|s| s.to_string()).collect(),
            parallel_inference: ParallelInferenceConfig::default(),
        })
    }

    fn array_batch(name: &str) -> Batch {
        let array = NdArray::from_f32(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let schema = Schema::builder().ndarray(name, vec![1, 2]).build().unwrap();
        let mut values = HashMap::new();
        values.insert(name.to_string(), Value::NdArray(array));
        let record = Record::new(schema, values).unwrap();
        Batch::new(vec![name.to_string()], vec![record]).unwrap()
    }

    #[tokio::test]
    async fn executor_rejects_wrong_batch_arity() {
        let registry = RuntimeRegistry::with_builtins();
        let executor =
            PipelineExecutor::build(&[model_step("input", &["input"])], &registry).unwrap();
        let empty = Batch::new(vec![], vec![]).unwrap();
        let err = executor.execute(empty).await.unwrap_err();
        assert_eq!(err.kind(), "CardinalityMismatchError");
    }

    #[tokio::test]
    async fn executor_rejects_misaligned_names() {
        let registry = RuntimeRegistry::with_builtins();
        let executor =
            PipelineExecutor::build(&[model_step("input", &["input"])], &registry).unwrap();
        let err = executor.execute(array_batch("other")).await.unwrap_err();
        assert_eq!(err.kind(), "CardinalityMismatchError");
    }

    #[tokio::test]
    async fn backend_missing_declared_output_is_a_cardinality_error() {
        let registry = RuntimeRegistry::with_builtins();
        // passthrough echoes input names, so "boxes" never appears
        let executor =
            PipelineExecutor::build(&[model_step("input", &["input", "boxes"])], &registry)
                .unwrap();
        let err = executor.execute(array_batch("input")).await.unwrap_err();
        assert_eq!(err.kind(), "CardinalityMismatchError");
    }

    #[tokio::test]
    async fn script_then_model_pipeline_runs_end_to_end() {
        let registry = RuntimeRegistry::with_builtins();
        let script = StepConfig::Script(ScriptStepConfig {
            io: StepIo::new()
                .with_input(
                    "input",
                    Schema::builder().ndarray("input", vec![1, 2]).build().unwrap(),
                )
                .unwrap(),
            engine: "identity".to_string(),
            scripts: BTreeMap::from([(
                "input".to_string(),
                ScriptConfig {
                    code: Some("pass".to_string()),
                    inputs: BTreeMap::from([("input".to_string(), "NDARRAY".to_string())]),
                    ..ScriptConfig::default()
                },
            )]),
        });
        let executor = PipelineExecutor::build(
            &[script, model_step("input", &["input"])],
            &registry,
        )
        .unwrap();
        assert_eq!(executor.step_count(), 2);
        assert_eq!(executor.input_names(), vec!["input"]);
        assert_eq!(executor.output_names(), vec!["input"]);

        let out = executor.execute(array_batch("input")).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.names(), &["input".to_string()]);
        executor.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_pipeline_is_a_configuration_error() {
        let registry = RuntimeRegistry::with_builtins();
        let err = PipelineExecutor::build(&[], &registry).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
