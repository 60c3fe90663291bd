//! `csvforge-engine`
//!
//! **Responsibility:** boundary to the transformation engine and the artifact store.
//!
//! The scheduler treats both as black boxes:
//! - The engine turns an input descriptor, an optional expected-output descriptor,
//!   instructions and prior feedback into a script plus a verdict.
//! - The artifact store is only asked to drop artifacts of deleted jobs.
//!
//! Nothing here knows about queues, workers or persistence.

pub mod artifacts;
pub mod engine;
pub mod outcome;
pub mod request;

#[cfg(feature = "test-util")]
pub mod scripted;

pub use artifacts::{ArtifactError, ArtifactStore, DirArtifactStore, NoopArtifactStore};
pub use engine::{EngineFactory, TransformationEngine};
pub use outcome::{AttemptFeedback, AttemptOutcome, EngineError, FailureKind, FeedbackRecord};
pub use request::{EngineRequest, ExecuteRequest, Instructions, RefineRequest};

#[cfg(feature = "test-util")]
pub use scripted::{EngineCall, ScriptedEngine, ScriptedPlan, Step};
