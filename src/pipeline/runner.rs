use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::model::ModelStepRunner;
use crate::pipeline::script::ScriptStepRunner;
use crate::pipeline::step::{StepConfig, StepIo};
use crate::pipeline::Batch;
use crate::runtime::RuntimeRegistry;

/// The live, executable counterpart of one configured step.
///
/// A runner owns its backend resources (model handle, interpreter session)
/// for the step's lifetime and is shared by every request that invokes the
/// step; it is never request-scoped.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// The validated io contract this runner was compiled from.
    fn io(&self) -> &StepIo;

    /// Transforms an input batch positionally aligned with the step's
    /// declared input names into a batch aligned with its output names.
    async fn transform(&self, batch: Batch) -> Result<Batch>;

    /// Releases owned resources. Calls after close fail with
    /// `RunnerClosedError`.
    async fn close(&self) -> Result<()>;
}

/// Compiles a validated step configuration into its runner, dispatching on
/// the step kind tag.
pub fn build_runner(
    config: &StepConfig,
    registry: &RuntimeRegistry,
) -> Result<Box<dyn StepRunner>> {
    config.validate()?;
    match config {
        StepConfig::Model(model) => Ok(Box::new(ModelStepRunner::new(model, registry)?)),
        StepConfig::Script(script) => Ok(Box::new(ScriptStepRunner::new(script, registry)?)),
    }
}
