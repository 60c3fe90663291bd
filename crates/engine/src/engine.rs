use crate::outcome::{AttemptOutcome, EngineError};
use crate::request::{EngineRequest, ExecuteRequest, RefineRequest};

/// A transformation engine client.
///
/// Calls are blocking and may take minutes. An instance is owned by exactly one
/// worker at a time, hence `&mut self` and no `Sync` bound.
pub trait TransformationEngine: Send {
    /// Produce (or improve) a script for a training job and evaluate it.
    fn refine(&mut self, request: &RefineRequest) -> Result<AttemptOutcome, EngineError>;

    /// Run an already trained script once.
    fn execute(&mut self, request: &ExecuteRequest) -> Result<AttemptOutcome, EngineError>;

    fn handle(&mut self, request: &EngineRequest) -> Result<AttemptOutcome, EngineError> {
        match request {
            EngineRequest::Refine(r) => self.refine(r),
            EngineRequest::Execute(r) => self.execute(r),
        }
    }
}

/// Builds fresh engine instances, one per worker (and again after an instance
/// was abandoned by a timed-out call).
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn TransformationEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn TransformationEngine>, EngineError> + Send + Sync + 'static,
{
    fn create(&self) -> Result<Box<dyn TransformationEngine>, EngineError> {
        self()
    }
}
