//! Fixed pool of threads draining a job queue

use crate::job::model::{JobInput, JobOutput};
use crate::job::orchestrator::{panic_message, JobOrchestrator};
use crate::job::pipeline::InsarStages;
use crate::types::{InsarError, InsarResult};
use std::sync::mpsc::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Runs each queued job end-to-end on one of `workers` threads.
///
/// Outputs arrive on the results channel in completion order.
pub struct JobWorker {
    queue: Option<Sender<JobInput>>,
    results: Receiver<JobOutput>,
    handles: Vec<JoinHandle<()>>,
}

impl JobWorker {
    pub fn spawn<S: InsarStages + 'static>(orchestrator: Arc<JobOrchestrator<S>>, workers: usize) -> InsarResult<Self> {
        let (queue_tx, queue_rx) = mpsc::channel::<JobInput>();
        let (results_tx, results_rx) = mpsc::channel::<JobOutput>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let queue = Arc::clone(&queue_rx);
            let results = results_tx.clone();
            let orchestrator = Arc::clone(&orchestrator);
            let handle = thread::Builder::new()
                .name(format!("insar-worker-{}", index))
                .spawn(move || worker_loop(index, &queue, &results, &orchestrator))?;
            handles.push(handle);
        }
        log::info!("Started {} job workers", handles.len());

        Ok(Self {
            queue: Some(queue_tx),
            results: results_rx,
            handles,
        })
    }

    pub fn submit(&self, input: JobInput) -> InsarResult<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| InsarError::Processing("job queue is closed".to_string()))?;
        queue
            .send(input)
            .map_err(|e| InsarError::Processing(format!("job queue is closed: {}", e.0.job_id)))
    }

    /// Block until the next job finishes; `None` once every worker has exited
    pub fn recv(&self) -> Option<JobOutput> {
        self.results.recv().ok()
    }

    /// Close the queue, let workers finish queued jobs and collect the
    /// outputs not yet received
    pub fn shutdown(mut self) -> Vec<JobOutput> {
        self.queue.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Job worker panicked");
            }
        }
        self.results.try_iter().collect()
    }
}

fn worker_loop<S: InsarStages>(
    index: usize,
    queue: &Mutex<Receiver<JobInput>>,
    results: &Sender<JobOutput>,
    orchestrator: &JobOrchestrator<S>,
) {
    loop {
        // The lock is released before the job runs
        let next = match queue.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        let input = match next {
            Ok(input) => input,
            Err(_) => break,
        };
        log::debug!("Worker {} picked up job {}", index, input.job_id);
        let job_id = input.job_id.clone();
        let started = Instant::now();
        // The worker outlives a job that panics outside its stages
        let output = panic::catch_unwind(AssertUnwindSafe(|| orchestrator.run(input))).unwrap_or_else(|payload| {
            let message = format!("Job panicked: {}", panic_message(payload.as_ref()));
            log::error!("Worker {}: {}", index, message);
            orchestrator.discard_work_dir(&job_id);
            JobOutput::failure(&job_id, message.clone(), message, started.elapsed().as_secs_f64())
        });
        if results.send(output).is_err() {
            break;
        }
    }
    log::debug!("Worker {} exiting", index);
}
