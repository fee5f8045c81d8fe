use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::JobError;
use crate::logbook::{Level, Logbook};
use crate::models::{Job, JobOutcome, JobReport};
use crate::runtime::Shutdown;

/// Runs one job to a terminal outcome.
pub trait JobRunner: Send + Sync {
    fn execute(&self, job: Job) -> JobOutcome;
}

/// Jobs waiting for a worker; order carries no meaning.
#[derive(Debug, Default)]
pub struct WorkQueue {
    jobs: Mutex<VecDeque<(usize, Job)>>,
}

impl WorkQueue {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().enumerate().collect()),
        }
    }

    pub fn pop(&self) -> Option<(usize, Job)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Drains `jobs` with at most `workers` concurrent runners.
///
/// Returns one report per job in input order. Jobs left in the queue after a
/// shutdown request are reported as `NotStarted`.
pub fn run_pool(
    jobs: Vec<Job>,
    workers: usize,
    runner: Arc<dyn JobRunner>,
    shutdown: &Shutdown,
    log: &Logbook,
) -> Vec<JobReport> {
    if jobs.is_empty() {
        return vec![];
    }

    let total = jobs.len();
    let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
    let queue = Arc::new(WorkQueue::new(jobs));
    let results: Arc<Mutex<Vec<Option<JobReport>>>> =
        Arc::new(Mutex::new((0..total).map(|_| None).collect()));

    let worker_count = workers.clamp(1, total);
    log.info(format!(
        "Dispatching {total} jobs across {worker_count} workers"
    ));

    let mut handles = vec![];
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let results = Arc::clone(&results);
        let runner = Arc::clone(&runner);
        let shutdown = shutdown.clone();
        let log = log.clone();
        handles.push(thread::spawn(move || {
            loop {
                if shutdown.requested() {
                    break;
                }
                let Some((idx, job)) = queue.pop() else {
                    break;
                };

                let job_id = job.id.clone();
                let started = Instant::now();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| runner.execute(job)))
                {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        log.job(
                            Level::Error,
                            &job_id,
                            format!("job aborted by unexpected panic: {message}"),
                        );
                        JobOutcome::Failed(JobError::Unexpected(message))
                    }
                };

                let report = JobReport {
                    job_id,
                    outcome,
                    elapsed: started.elapsed(),
                };
                let mut guard = results.lock().unwrap_or_else(PoisonError::into_inner);
                guard[idx] = Some(report);
            }
        }));
    }

    for handle in handles {
        if handle.join().is_err() {
            log.error("worker thread terminated abnormally");
        }
    }

    let not_started = queue.len();
    let mut guard = results.lock().unwrap_or_else(PoisonError::into_inner);
    let mut ordered = Vec::with_capacity(total);
    for (slot, job_id) in guard.iter_mut().zip(ids) {
        let report = slot.take().unwrap_or(JobReport {
            job_id,
            outcome: JobOutcome::NotStarted,
            elapsed: Duration::ZERO,
        });
        ordered.push(report);
    }
    if not_started > 0 {
        log.warn(format!(
            "Shutdown requested: {not_started} queued jobs were not started"
        ));
    }
    ordered
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
