//! Job lifecycle: input validation, stage sequencing, delivery and cleanup

pub mod delivery;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod state;
pub mod worker;

pub use delivery::{
    artifact_key, ArtifactStore, HttpArtifactStore, HttpWebhookNotifier, LocalArtifactStore, Notifier,
};
pub use model::{GranuleLocations, JobInput, JobOutput, JobResults, JobStatus};
pub use orchestrator::JobOrchestrator;
pub use pipeline::{FilteredPhase, InsarPipeline, InsarStages, StagedInputs, UnwrappedPhase};
pub use state::{Job, JobFailure, JobState, StageOutputs};
pub use worker::JobWorker;
