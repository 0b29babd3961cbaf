//! Model step runner: maps named input arrays to named output arrays
//! through a [`ModelBackend`], behind a bounded worker pool.
//!
//! The pool admits at most `workers` concurrent in-flight backend calls;
//! additional calls queue in arrival order. A queued call that waits longer
//! than the configured budget fails with `InferenceTimeoutError` and leaves
//! the pool usable for everyone else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Result, ServingError};
use crate::pipeline::runner::StepRunner;
use crate::pipeline::step::{ModelStepConfig, StepIo};
use crate::pipeline::Batch;
use crate::record::{NdArray, Record, Value};
use crate::runtime::{ModelBackend, RuntimeRegistry};
use crate::schema::Schema;

pub struct ModelStepRunner {
    io: StepIo,
    backend: Arc<dyn ModelBackend>,
    output_names: Vec<String>,
    pool: Semaphore,
    max_queue_wait: Duration,
}

impl ModelStepRunner {
    pub fn new(config: &ModelStepConfig, registry: &RuntimeRegistry) -> Result<Self> {
        let factory = registry.backend_factory(&config.backend)?;
        let backend = factory.load(&config.model_path)?;
        Ok(ModelStepRunner {
            io: config.effective_io()?,
            backend,
            output_names: config.output_names.clone(),
            // tokio's semaphore is fair, so queued calls acquire FIFO
            pool: Semaphore::new(config.parallel_inference.workers),
            max_queue_wait: Duration::from_millis(config.parallel_inference.max_queue_wait_ms),
        })
    }

    /// Pulls the input array for `name` out of its aligned record: the
    /// column named after the input, or the record's sole ndarray value.
    fn input_array(name: &str, record: &Record) -> Result<NdArray> {
        if let Some(Value::NdArray(array)) = record.get(name) {
            return Ok(array.clone());
        }
        let mut arrays = record.values().values().filter_map(|v| match v {
            Value::NdArray(a) => Some(a),
            _ => None,
        });
        match (arrays.next(), arrays.next()) {
            (Some(array), None) => Ok(array.clone()),
            _ => Err(ServingError::Configuration(format!(
                "record aligned to model input '{name}' carries no unambiguous ndarray value"
            ))),
        }
    }

    fn output_record(name: &str, array: NdArray) -> Result<Record> {
        let schema = Schema::builder()
            .ndarray(name, array.shape.clone())
            .build()?;
        let mut values = HashMap::new();
        values.insert(name.to_string(), Value::NdArray(array));
        Record::new(schema, values)
    }
}

#[async_trait]
impl StepRunner for ModelStepRunner {
    fn io(&self) -> &StepIo {
        &self.io
    }

    async fn transform(&self, batch: Batch) -> Result<Batch> {
        let mut inputs = HashMap::new();
        for (position, record) in batch.records().iter().enumerate() {
            if let Some(name) = self.io.input_name_at(position) {
                inputs.insert(name.to_string(), Self::input_array(name, record)?);
            }
        }

        let permit = tokio::time::timeout(self.max_queue_wait, self.pool.acquire())
            .await
            .map_err(|_| ServingError::InferenceTimeout {
                waited_ms: self.max_queue_wait.as_millis() as u64,
            })?
            .map_err(|_| {
                ServingError::RunnerClosed("model step runner has been closed".to_string())
            })?;
        let result = self.backend.infer(inputs).await;
        drop(permit);
        let mut outputs = result?;
        debug!(outputs = outputs.len(), "model inference complete");

        // Emit records in declared output order; a backend that fails to
        // produce a declared output breaks the step contract.
        let mut names = Vec::with_capacity(self.output_names.len());
        let mut records = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let array = outputs.remove(name).ok_or_else(|| {
                ServingError::CardinalityMismatch(format!(
                    "backend produced no output for declared name '{name}'"
                ))
            })?;
            names.push(name.clone());
            records.push(Self::output_record(name, array)?);
        }
        Batch::new(names, records)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::step::ParallelInferenceConfig;
    use crate::runtime::ModelBackendFactory;

    fn runner_with(
        backend: Arc<dyn ModelBackend>,
        workers: usize,
        wait_ms: u64,
    ) -> ModelStepRunner {
        struct FixedFactory(Arc<dyn ModelBackend>);
        impl ModelBackendFactory for FixedFactory {
            fn load(&self, _path: &str) -> Result<Arc<dyn ModelBackend>> {
                Ok(self.0.clone())
            }
        }
        let mut registry = RuntimeRegistry::new();
        registry.register_backend("fixed", Arc::new(FixedFactory(backend)));
        let config = ModelStepConfig {
            io: StepIo::new(),
            model_path: "unused".to_string(),
            backend: "fixed".to_string(),
            input_names: vec!["input".to_string()],
            output_names: vec!["scores".to_string(), "boxes".to_string()],
            parallel_inference: ParallelInferenceConfig {
                workers,
                max_queue_wait_ms: wait_ms,
            },
        };
        ModelStepRunner::new(&config, &registry).unwrap()
    }

    struct SplitBackend;

    #[async_trait]
    impl ModelBackend for SplitBackend {
        async fn infer(
            &self,
            inputs: HashMap<String, NdArray>,
        ) -> Result<HashMap<String, NdArray>> {
            let input = inputs.get("input").expect("missing input");
            let mut out = HashMap::new();
            out.insert("scores".to_string(), input.clone());
            out.insert(
                "boxes".to_string(),
                NdArray::from_f32(vec![1, 2], vec![0.0, 1.0])?,
            );
            Ok(out)
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl ModelBackend for SlowBackend {
        async fn infer(
            &self,
            inputs: HashMap<String, NdArray>,
        ) -> Result<HashMap<String, NdArray>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let input = inputs.into_values().next().unwrap();
            let mut out = HashMap::new();
            out.insert("scores".to_string(), input.clone());
            out.insert("boxes".to_string(), input);
            Ok(out)
        }
    }

    fn input_batch() -> Batch {
        let array = NdArray::from_f32(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let schema = Schema::builder().ndarray("input", vec![1, 4]).build().unwrap();
        let mut values = HashMap::new();
        values.insert("input".to_string(), Value::NdArray(array));
        let record = Record::new(schema, values).unwrap();
        Batch::new(vec!["input".to_string()], vec![record]).unwrap()
    }

    #[tokio::test]
    async fn outputs_follow_declared_order() {
        let runner = runner_with(Arc::new(SplitBackend), 2, 1_000);
        let out = runner.transform(input_batch()).await.unwrap();
        assert_eq!(out.names(), &["scores".to_string(), "boxes".to_string()]);
        assert_eq!(out.len(), 2);
        let scores = out.record_for("scores").unwrap();
        assert!(matches!(scores.get("scores"), Some(Value::NdArray(_))));
    }

    #[tokio::test]
    async fn queued_call_times_out_but_pool_survives() {
        let runner = Arc::new(runner_with(Arc::new(SlowBackend), 1, 50));

        // Saturate the single worker slot, then race a second call with a
        // 50ms wait budget against a 200ms-long in-flight call.
        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.transform(input_batch()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = runner.transform(input_batch()).await.unwrap_err();
        assert_eq!(err.kind(), "InferenceTimeoutError");

        // The in-flight call completes and the pool stays usable.
        first.await.unwrap().unwrap();
        runner.transform(input_batch()).await.unwrap();
    }

    #[tokio::test]
    async fn closed_runner_rejects_calls() {
        let runner = runner_with(Arc::new(SplitBackend), 1, 100);
        runner.close().await.unwrap();
        let err = runner.transform(input_batch()).await.unwrap_err();
        assert_eq!(err.kind(), "RunnerClosedError");
    }
}
