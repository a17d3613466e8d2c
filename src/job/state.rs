//! Job lifecycle state machine

use crate::job::model::JobInput;
use crate::types::{InsarError, InsarResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a job.
///
/// Processing states follow each other strictly in declaration order;
/// `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Received,
    Validating,
    Staging,
    Coregistering,
    Interferogram,
    Filtering,
    Unwrapping,
    Geocoding,
    Extracting,
    Delivering,
    Completed,
    Failed,
}

impl JobState {
    /// The single successor on the success path
    pub fn next(&self) -> Option<JobState> {
        use JobState::*;
        match self {
            Received => Some(Validating),
            Validating => Some(Staging),
            Staging => Some(Coregistering),
            Coregistering => Some(Interferogram),
            Interferogram => Some(Filtering),
            Filtering => Some(Unwrapping),
            Unwrapping => Some(Geocoding),
            Geocoding => Some(Extracting),
            Extracting => Some(Delivering),
            Delivering => Some(Completed),
            Completed | Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == JobState::Failed || self.next() == Some(target)
    }

    /// Stage name used in error reports
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validating => "validation",
            Self::Staging => "staging",
            Self::Coregistering => "coregistration",
            Self::Interferogram => "interferogram",
            Self::Filtering => "filtering",
            Self::Unwrapping => "unwrapping",
            Self::Geocoding => "geocoding",
            Self::Extracting => "extraction",
            Self::Delivering => "delivery",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Files produced by the stages of one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutputs {
    pub reference_product: Option<PathBuf>,
    pub secondary_product: Option<PathBuf>,
    pub dem: Option<PathBuf>,
    pub interferogram: Option<PathBuf>,
    pub coherence: Option<PathBuf>,
    pub filtered: Option<PathBuf>,
    pub unwrapped: Option<PathBuf>,
    pub displacement: Option<PathBuf>,
    pub geocoded_coherence: Option<PathBuf>,
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub stage: JobState,
    pub message: String,
    pub trace: String,
}

/// A job moving through the pipeline
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub input: JobInput,
    pub work_dir: PathBuf,
    state: JobState,
    history: Vec<JobState>,
    pub outputs: StageOutputs,
    pub failure: Option<JobFailure>,
}

impl Job {
    pub fn new(input: JobInput, work_dir: PathBuf) -> Self {
        Self {
            job_id: input.job_id.clone(),
            input,
            work_dir,
            state: JobState::Received,
            history: vec![JobState::Received],
            outputs: StageOutputs::default(),
            failure: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `target`, rejecting anything but the successor or `Failed`
    pub fn advance(&mut self, target: JobState) -> InsarResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(InsarError::Processing(format!(
                "Invalid job transition {} -> {}",
                self.state, target
            )));
        }
        log::debug!("Job {}: {} -> {}", self.job_id, self.state, target);
        self.state = target;
        self.history.push(target);
        Ok(())
    }

    /// Move to `Failed`, recording the failing stage and the error chain
    pub fn fail(&mut self, error: &InsarError) -> InsarResult<()> {
        let stage = self.state;
        self.advance(JobState::Failed)?;
        let path = self
            .history
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        self.failure = Some(JobFailure {
            stage,
            message: error.to_string(),
            trace: format!("states: {}\n{}", path, error.chain()),
        });
        Ok(())
    }
}
