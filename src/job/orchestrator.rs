//! Drives one job through its states and handles both terminal paths

use crate::config::{ProcessingConfig, StagingConfig};
use crate::core::{statistics, PointSample, Statistics};
use crate::io::source::is_plain_name;
use crate::io::GranuleName;
use crate::job::delivery::{artifact_store_from_config, ArtifactStore, HttpWebhookNotifier, Notifier};
use crate::job::model::{JobInput, JobOutput, JobResults};
use crate::job::pipeline::{InsarPipeline, InsarStages};
use crate::job::state::{Job, JobState};
use crate::types::{InsarError, InsarResult};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

const TOTAL_STEPS: usize = 7;

/// Runs jobs end-to-end on the calling thread
pub struct JobOrchestrator<S: InsarStages = InsarPipeline> {
    staging: StagingConfig,
    stages: S,
    store: Option<Box<dyn ArtifactStore>>,
    notifier: Option<Box<dyn Notifier>>,
}

impl JobOrchestrator<InsarPipeline> {
    /// Orchestrator with the full pipeline and collaborators implied by `config`
    pub fn new(config: ProcessingConfig) -> InsarResult<Self> {
        let store = artifact_store_from_config(&config.delivery)?;
        let notifier = HttpWebhookNotifier::new(config.delivery.webhook_timeout_secs)?;
        let mut orchestrator = Self::with_stages(&config, InsarPipeline::new(config.clone()));
        orchestrator.store = store;
        orchestrator.notifier = Some(Box::new(notifier));
        Ok(orchestrator)
    }
}

impl<S: InsarStages> JobOrchestrator<S> {
    /// Orchestrator over custom stages with no delivery collaborators
    pub fn with_stages(config: &ProcessingConfig, stages: S) -> Self {
        Self {
            staging: config.staging.clone(),
            stages,
            store: None,
            notifier: None,
        }
    }

    pub fn with_artifact_store(mut self, store: Box<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn stages(&self) -> &S {
        &self.stages
    }

    /// Process a job and return its response
    pub fn run(&self, input: JobInput) -> JobOutput {
        self.process(input).1
    }

    /// Process a job, returning the finished job record with its response
    pub fn process(&self, input: JobInput) -> (Job, JobOutput) {
        let start = Instant::now();
        let job_id = input.job_id.clone();
        let work_dir = self.staging.job_dir(&job_id);
        let mut job = Job::new(input, work_dir);

        log::info!("{}", "=".repeat(80));
        log::info!("Starting InSAR job: {}", job_id);
        log::info!("{}", "=".repeat(80));

        let output = match self.execute(&mut job) {
            Ok(results) => match job.advance(JobState::Completed) {
                Ok(()) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    log::info!("Job {} completed successfully in {:.1}s", job_id, elapsed);
                    JobOutput::success(&job_id, results, elapsed)
                }
                Err(e) => self.failed(&mut job, e, start),
            },
            Err(e) => self.failed(&mut job, e, start),
        };

        if let Some(url) = job.input.webhook_url.as_deref() {
            self.notify(url, &output);
        }
        self.cleanup(&job);
        (job, output)
    }

    fn failed(&self, job: &mut Job, error: InsarError, start: Instant) -> JobOutput {
        log::error!("Job {} failed in {}: {}", job.job_id, job.state(), error);
        if let Err(e) = job.fail(&error) {
            log::error!("Could not record failure of job {}: {}", job.job_id, e);
        }
        let (message, trace) = match &job.failure {
            Some(failure) => (failure.message.clone(), failure.trace.clone()),
            None => (error.to_string(), error.chain()),
        };
        log::error!("{}", trace);
        JobOutput::failure(&job.job_id, message, trace, start.elapsed().as_secs_f64())
    }

    fn execute(&self, job: &mut Job) -> InsarResult<JobResults> {
        job.advance(JobState::Validating)?;
        let locations = job.input.validate()?;
        let input = job.input.clone();
        let work_dir = job.work_dir.clone();

        let staged = run_stage(job, JobState::Staging, 1, "Staging granules and DEM", || {
            fs::create_dir_all(&work_dir)?;
            self.stages.stage(&input, &locations, &work_dir)
        })?;
        job.outputs.reference_product = Some(staged.reference.product_dir.clone());
        job.outputs.secondary_product = Some(staged.secondary.product_dir.clone());
        job.outputs.dem = Some(staged.dem.path.clone());

        let pair = run_stage(job, JobState::Coregistering, 2, "Co-registering", || {
            self.stages.coregister(&staged, &work_dir)
        })?;

        let interferogram = run_stage(job, JobState::Interferogram, 3, "Forming interferogram", || {
            self.stages.form_interferogram(&pair, &work_dir)
        })?;
        drop(pair);
        job.outputs.interferogram = Some(interferogram.phase_path.clone());
        job.outputs.coherence = Some(interferogram.coherence_path.clone());

        let filtered = run_stage(job, JobState::Filtering, 4, "Filtering phase", || {
            self.stages.filter(&interferogram, &work_dir)
        })?;
        job.outputs.filtered = Some(filtered.path.clone());

        let unwrapped = run_stage(job, JobState::Unwrapping, 5, "Unwrapping phase", || {
            self.stages.unwrap(&filtered, &interferogram, &work_dir)
        })?;
        job.outputs.unwrapped = Some(unwrapped.path.clone());

        let geocoded = run_stage(job, JobState::Geocoding, 6, "Geocoding", || {
            self.stages
                .geocode(&unwrapped, &interferogram, &staged, &input.bbox, &work_dir)
        })?;
        job.outputs.displacement = Some(geocoded.displacement_path.clone());
        job.outputs.geocoded_coherence = Some(geocoded.coherence_path.clone());

        let points = run_stage(job, JobState::Extracting, 7, "Extracting displacement at points", || {
            self.stages.extract(&geocoded, &input.points)
        })?;
        let statistics = Statistics::compute(&geocoded.displacement, &geocoded.coherence, &points)
            .with_velocity(velocity(&input, &points));

        job.advance(JobState::Delivering)?;
        log::info!("Delivering results");
        let mut results = JobResults {
            displacement_points: points,
            statistics,
            ..JobResults::default()
        };
        results.displacement_url = self.upload(&job.job_id, "displacement", &geocoded.displacement_path);
        results.coherence_url = self.upload(&job.job_id, "coherence", &geocoded.coherence_path);
        results.interferogram_url = self.upload(&job.job_id, "interferogram", &interferogram.phase_path);
        results.unwrapped_url = self.upload(&job.job_id, "unwrapped", &unwrapped.path);
        Ok(results)
    }

    /// Best-effort upload; failures are logged and yield no URL
    fn upload(&self, job_id: &str, artifact: &str, path: &Path) -> Option<String> {
        let store = self.store.as_ref()?;
        if !path.exists() {
            log::warn!("Artifact {} missing at {}", artifact, path.display());
            return None;
        }
        match store.upload(job_id, artifact, path) {
            Ok(url) => Some(url),
            Err(e) => {
                log::error!("Upload of {} failed: {}", artifact, e);
                None
            }
        }
    }

    fn notify(&self, url: &str, output: &JobOutput) {
        let Some(notifier) = self.notifier.as_ref() else {
            log::debug!("No notifier configured, skipping webhook {}", url);
            return;
        };
        if let Err(e) = notifier.notify(url, output) {
            log::error!("Webhook notification failed: {}", e);
        }
    }

    /// Remove the working directory of a job whose run was abandoned
    pub(crate) fn discard_work_dir(&self, job_id: &str) {
        if !is_plain_name(job_id) {
            return;
        }
        let work_dir = self.staging.job_dir(job_id);
        if work_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&work_dir) {
                log::warn!("Failed to discard {}: {}", work_dir.display(), e);
            }
        }
    }

    /// Remove the job working directory. Jobs rejected at validation never
    /// created one.
    fn cleanup(&self, job: &Job) {
        if !job.history().contains(&JobState::Staging) || !job.work_dir.exists() {
            return;
        }
        match fs::remove_dir_all(&job.work_dir) {
            Ok(()) => log::info!("Cleaned up job directory: {}", job.work_dir.display()),
            Err(e) => log::warn!("Failed to clean up job {}: {}", job.job_id, e),
        }
    }
}

/// Enter `state`, announce it and run its work, tagging errors with the stage
fn run_stage<T>(
    job: &mut Job,
    state: JobState,
    step: usize,
    label: &str,
    work: impl FnOnce() -> InsarResult<T>,
) -> InsarResult<T> {
    job.advance(state)?;
    log::info!("Step {}/{}: {}...", step, TOTAL_STEPS, label);
    let started = Instant::now();
    // A panicking stage fails the job like any other stage error
    let output = panic::catch_unwind(AssertUnwindSafe(work))
        .unwrap_or_else(|payload| {
            Err(InsarError::Processing(format!("panicked: {}", panic_message(payload.as_ref()))))
        })
        .map_err(|e| e.in_stage(state.stage_name()))?;
    log::debug!("{} finished in {:.2}s", state, started.elapsed().as_secs_f64());
    Ok(output)
}

/// Text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Velocity over the time between the two acquisitions named in the job
fn velocity(input: &JobInput, points: &[PointSample]) -> Option<statistics::VelocityStats> {
    let reference = GranuleName::parse(&input.reference_granule)?;
    let secondary = GranuleName::parse(&input.secondary_granule)?;
    let seconds = (secondary.start_time - reference.start_time).num_seconds().abs();
    statistics::velocity(points, seconds as f64 / 86_400.0)
}
