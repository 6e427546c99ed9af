//! Core-budgeted runner for external simulation jobs.
//!
//! Jobs declare how many cores they occupy. A job starts only once that many
//! cores are free; finishing a job returns its cores and wakes every waiter,
//! since several smaller jobs may fit at once. Jobs are submitted on named
//! channels; each channel has its own outcome stream, which ends once the
//! channel's sender is dropped and every job submitted to it has finished.

use std::{
    fmt, io,
    num::NonZeroUsize,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::telemetry::{self, RansuqTelemetry};

/// Result of a job's work.
pub type JobResult = Result<(), JobFailure>;

type Work = Box<dyn FnOnce() -> JobResult + Send + 'static>;

/// A unit of work with a declared core cost.
pub struct Job {
    id: String,
    required_cores: usize,
    work: Work,
}

impl Job {
    /// Creates a job occupying `required_cores` while `work` runs.
    pub fn new(
        id: impl Into<String>,
        required_cores: usize,
        work: impl FnOnce() -> JobResult + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            required_cores,
            work: Box::new(work),
        }
    }

    /// Job identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cores held while running.
    #[must_use]
    pub const fn required_cores(&self) -> usize {
        self.required_cores
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("required_cores", &self.required_cores)
            .finish_non_exhaustive()
    }
}

/// Why a job's work failed.
#[derive(Debug, Error)]
pub enum JobFailure {
    /// The external program could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The external program exited unsuccessfully.
    #[error("{program} exited with {status}")]
    Exit {
        /// Program name.
        program: String,
        /// Rendered exit status.
        status: String,
    },
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Completion record for one job.
#[derive(Debug)]
pub struct JobOutcome {
    /// Job identifier.
    pub job_id: String,
    /// Channel the job was submitted on.
    pub channel: String,
    /// Cores the job held.
    pub required_cores: usize,
    /// Time spent running (excludes queueing).
    pub wall_time: Duration,
    /// Work result.
    pub result: JobResult,
}

/// Scheduling errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job can never fit in the core budget.
    #[error("job {job} requires {required} cores but the budget is {budget}")]
    OverBudget {
        /// Job identifier.
        job: String,
        /// Cores requested.
        required: usize,
        /// Total budget.
        budget: usize,
    },
    /// The job declared no cores.
    #[error("job {job} declares zero cores")]
    ZeroCores {
        /// Job identifier.
        job: String,
    },
    /// The channel's dispatcher has gone away.
    #[error("channel {channel} is closed")]
    ChannelClosed {
        /// Channel name.
        channel: String,
    },
    /// A scheduler thread could not be started.
    #[error("failed to start scheduler thread: {0}")]
    Spawn(#[source] io::Error),
    /// The job ended without producing an outcome.
    #[error("job {job} ended without reporting an outcome")]
    Lost {
        /// Job identifier.
        job: String,
    },
}

#[derive(Debug)]
struct CoreBudget {
    total: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl CoreBudget {
    fn acquire(self: &Arc<Self>, cores: usize) -> CoreLease {
        assert!(
            cores <= self.total,
            "job requesting {cores} cores exceeds budget {}",
            self.total
        );
        let mut available = self.available.lock();
        while *available < cores {
            self.freed.wait(&mut available);
        }
        *available -= cores;
        CoreLease {
            budget: Arc::clone(self),
            cores,
        }
    }
}

/// Cores held by a running job; returned on drop, including on panic.
struct CoreLease {
    budget: Arc<CoreBudget>,
    cores: usize,
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        let mut available = self.budget.available.lock();
        *available += self.cores;
        debug_assert!(*available <= self.budget.total);
        drop(available);
        self.budget.freed.notify_all();
    }
}

/// Shared core budget; clones refer to the same budget.
#[derive(Debug, Clone)]
pub struct Scheduler {
    budget: Arc<CoreBudget>,
    telemetry: Option<RansuqTelemetry>,
}

impl Scheduler {
    /// Creates a scheduler with `total_cores` cores.
    ///
    /// # Panics
    /// Panics when `total_cores` is zero.
    #[must_use]
    pub fn new(total_cores: usize) -> Self {
        assert!(total_cores > 0, "scheduler needs at least one core");
        Self {
            budget: Arc::new(CoreBudget {
                total: total_cores,
                available: Mutex::new(total_cores),
                freed: Condvar::new(),
            }),
            telemetry: None,
        }
    }

    /// Creates a scheduler sized to the host's available parallelism.
    #[must_use]
    pub fn detect() -> Self {
        Self::new(thread::available_parallelism().map_or(1, NonZeroUsize::get))
    }

    /// Attaches telemetry for job start/finish records.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RansuqTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Cores currently free.
    #[must_use]
    pub fn available_cores(&self) -> usize {
        *self.budget.available.lock()
    }

    /// Opens a named channel.
    ///
    /// Jobs sent on the returned sender start in submission order as cores
    /// free up. The receiver yields outcomes in completion order and ends once
    /// the sender is dropped and every submitted job has finished.
    pub fn channel(
        &self,
        name: impl Into<String>,
    ) -> Result<(JobSender, JobReceiver), SchedulerError> {
        let name = name.into();
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<JobOutcome>();
        let budget = Arc::clone(&self.budget);
        let telemetry = self.telemetry.clone();
        let channel = name.clone();
        thread::Builder::new()
            .name(format!("sched-{name}"))
            .spawn(move || dispatch(&channel, &budget, telemetry.as_ref(), job_rx, &outcome_tx))
            .map_err(SchedulerError::Spawn)?;
        Ok((
            JobSender {
                channel: name,
                budget: self.budget.total,
                jobs: job_tx,
            },
            JobReceiver {
                outcomes: outcome_rx,
            },
        ))
    }

    /// Runs a single job to completion on a private channel.
    pub fn run(&self, job: Job) -> Result<JobOutcome, SchedulerError> {
        let job_id = job.id.clone();
        let (sender, receiver) = self.channel(format!("run-{job_id}"))?;
        sender.submit(job)?;
        drop(sender);
        receiver
            .into_iter()
            .next()
            .ok_or(SchedulerError::Lost { job: job_id })
    }
}

fn dispatch(
    channel: &str,
    budget: &Arc<CoreBudget>,
    telemetry: Option<&RansuqTelemetry>,
    jobs: mpsc::Receiver<Job>,
    outcomes: &mpsc::Sender<JobOutcome>,
) {
    for Job {
        id,
        required_cores,
        work,
    } in jobs
    {
        let lease = budget.acquire(required_cores);
        telemetry::log(
            telemetry,
            LogLevel::Debug,
            "scheduler.job.started",
            json!({ "job": id, "channel": channel, "cores": required_cores }),
        );
        let outcomes_tx = outcomes.clone();
        let worker_telemetry = telemetry.cloned();
        let worker_channel = channel.to_string();
        let worker_id = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || {
                let started = Instant::now();
                let result = work();
                drop(lease);
                let outcome = JobOutcome {
                    job_id: worker_id,
                    channel: worker_channel,
                    required_cores,
                    wall_time: started.elapsed(),
                    result,
                };
                telemetry::log(
                    worker_telemetry.as_ref(),
                    if outcome.result.is_ok() {
                        LogLevel::Info
                    } else {
                        LogLevel::Error
                    },
                    "scheduler.job.finished",
                    json!({
                        "job": outcome.job_id,
                        "channel": outcome.channel,
                        "wall_time_ms": outcome.wall_time.as_millis(),
                        "error": outcome.result.as_ref().err().map(ToString::to_string),
                    }),
                );
                telemetry::event(
                    worker_telemetry.as_ref(),
                    "scheduler.job.finished",
                    json!({ "job": outcome.job_id, "ok": outcome.result.is_ok() }),
                );
                let _ = outcomes_tx.send(outcome);
            });
        // A failed spawn drops the closure, and with it the lease.
        if let Err(err) = spawned {
            let _ = outcomes.send(JobOutcome {
                job_id: id,
                channel: channel.to_string(),
                required_cores,
                wall_time: Duration::ZERO,
                result: Err(JobFailure::Other(format!(
                    "failed to start worker thread: {err}"
                ))),
            });
        }
    }
}

/// Submission side of a channel. Dropping it closes the channel's input.
#[derive(Debug)]
pub struct JobSender {
    channel: String,
    budget: usize,
    jobs: mpsc::Sender<Job>,
}

impl JobSender {
    /// Queues a job.
    ///
    /// Jobs that can never fit the budget are rejected here, before anything runs.
    pub fn submit(&self, job: Job) -> Result<(), SchedulerError> {
        if job.required_cores == 0 {
            return Err(SchedulerError::ZeroCores { job: job.id });
        }
        if job.required_cores > self.budget {
            return Err(SchedulerError::OverBudget {
                job: job.id,
                required: job.required_cores,
                budget: self.budget,
            });
        }
        self.jobs
            .send(job)
            .map_err(|_| SchedulerError::ChannelClosed {
                channel: self.channel.clone(),
            })
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Outcome side of a channel.
#[derive(Debug)]
pub struct JobReceiver {
    outcomes: mpsc::Receiver<JobOutcome>,
}

impl JobReceiver {
    /// Blocks until every submitted job has finished and the sender is dropped.
    #[must_use]
    pub fn wait_all(self) -> Vec<JobOutcome> {
        self.outcomes.into_iter().collect()
    }
}

impl Iterator for JobReceiver {
    type Item = JobOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        self.outcomes.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn tracked_job(
        id: &str,
        cores: usize,
        in_use: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
        millis: u64,
    ) -> Job {
        let in_use = Arc::clone(in_use);
        let peak = Arc::clone(peak);
        Job::new(id, cores, move || {
            let now = in_use.fetch_add(cores, Ordering::SeqCst) + cores;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(millis));
            in_use.fetch_sub(cores, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn over_budget_job_is_rejected_without_running() {
        let scheduler = Scheduler::new(4);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let err = scheduler
            .run(Job::new("huge", 5, move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::OverBudget {
                required: 5,
                budget: 4,
                ..
            }
        ));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.available_cores(), 4);
    }

    #[test]
    fn zero_core_job_is_rejected() {
        let (sender, _receiver) = Scheduler::new(2).channel("c").unwrap();
        assert!(matches!(
            sender.submit(Job::new("free", 0, || Ok(()))),
            Err(SchedulerError::ZeroCores { .. })
        ));
    }

    #[test]
    fn running_cores_never_exceed_budget() {
        let scheduler = Scheduler::new(4);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (train_tx, train_rx) = scheduler.channel("training").unwrap();
        let (test_tx, test_rx) = scheduler.channel("testing").unwrap();
        for (idx, cores) in [1, 4, 2, 3, 1, 2, 4, 1].into_iter().enumerate() {
            let sender = if idx % 2 == 0 { &train_tx } else { &test_tx };
            sender
                .submit(tracked_job(&format!("j{idx}"), cores, &in_use, &peak, 10))
                .unwrap();
        }
        drop(train_tx);
        drop(test_tx);
        let outcomes: Vec<_> = train_rx.wait_all().into_iter().chain(test_rx.wait_all()).collect();
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(scheduler.available_cores(), 4);
    }

    #[test]
    fn jobs_wait_for_enough_free_cores() {
        let scheduler = Scheduler::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = scheduler.channel("sequence").unwrap();
        for (id, cores) in [("job1", 3), ("job2", 3), ("job3", 2)] {
            let order = Arc::clone(&order);
            sender
                .submit(Job::new(id, cores, move || {
                    order.lock().push(format!("start:{id}"));
                    thread::sleep(Duration::from_millis(15));
                    order.lock().push(format!("end:{id}"));
                    Ok(())
                }))
                .unwrap();
        }
        drop(sender);
        assert_eq!(receiver.wait_all().len(), 3);
        assert_eq!(
            *order.lock(),
            vec![
                "start:job1",
                "end:job1",
                "start:job2",
                "end:job2",
                "start:job3",
                "end:job3"
            ]
        );
    }

    #[test]
    fn small_jobs_share_the_budget() {
        let scheduler = Scheduler::new(4);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = scheduler.channel("pairs").unwrap();
        for idx in 0..2 {
            sender
                .submit(tracked_job(&format!("half{idx}"), 2, &in_use, &peak, 40))
                .unwrap();
        }
        drop(sender);
        assert_eq!(receiver.wait_all().len(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failed_job_reports_and_releases_cores() {
        let scheduler = Scheduler::new(2);
        let outcome = scheduler
            .run(Job::new("broken", 2, || Err(JobFailure::Other("solver diverged".into()))))
            .unwrap();
        assert_eq!(outcome.job_id, "broken");
        assert!(outcome.result.unwrap_err().to_string().contains("diverged"));
        assert_eq!(scheduler.available_cores(), 2);
    }
}
