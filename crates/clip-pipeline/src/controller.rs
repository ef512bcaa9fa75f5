//! Job lifecycle controller
//!
//! Owns the live [`Job`], drives the poll loop and publishes a
//! [`StatusSnapshot`] after every transition:
//!
//! `Idle -> Submitting -> Polling -> Completed | Failed`
//!
//! At most one poll is in flight at a time. The next one is only scheduled
//! after the previous response has been applied, and leaving `Polling` aborts
//! the pending timer. A generation counter discards any response belonging to
//! a submission that was reset in the meantime.

use crate::backends::{BackendConfig, ProcessingBackend};
use crate::job::{processing_steps, Job, JobId, JobStatus, ProcessingStep};
use crate::submission::{validate, SubmissionRequest, ValidationError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const UNEXPECTED_ERROR: &str = "An unexpected error occurred";

/// Snapshots retained by the event log; the oldest is dropped when full
pub const EVENT_LOG_CAPACITY: usize = 256;

/// Longest delay between polls when backoff has no explicit cap
const BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Submitting,
    Polling,
    Completed,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ControllerState,
    pub stage: String,
    pub progress_percent: f32,
    pub is_terminal: bool,
    pub detailed_status: Option<String>,
    pub job_id: Option<JobId>,
    pub result_uri: Option<String>,
    pub error_message: Option<String>,
}

impl StatusSnapshot {
    fn idle() -> Self {
        Self {
            state: ControllerState::Idle,
            stage: "Ready".to_string(),
            progress_percent: 0.0,
            is_terminal: false,
            detailed_status: None,
            job_id: None,
            result_uri: None,
            error_message: None,
        }
    }

    /// Checklist derived from the current progress
    pub fn steps(&self) -> Vec<(ProcessingStep, bool)> {
        processing_steps(self.progress_percent)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("a job is already {0}; reset before submitting another")]
    Busy(ControllerState),
}

/// Poll scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Delay before the first status check
    pub interval: Duration,

    /// Delay multiplier applied after each check; 1.0 keeps it fixed
    pub backoff_factor: f64,

    /// Cap for the delay once it grows
    pub max_interval: Option<Duration>,

    /// Fail the job after this many non-terminal checks
    pub max_attempts: Option<u32>,
}

impl PollSettings {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff_factor: 1.0,
            max_interval: None,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_interval = Some(max_interval);
        self
    }

    /// Delay to wait after a poll that waited `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        if !(self.backoff_factor > 1.0) {
            return current;
        }
        let cap = self.max_interval.unwrap_or(BACKOFF_CEILING);
        let next = current.as_secs_f64() * self.backoff_factor;
        Duration::from_secs_f64(next.min(cap.as_secs_f64()))
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(2000))
    }
}

impl From<&BackendConfig> for PollSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            backoff_factor: config.backoff_factor,
            max_interval: config.max_poll_interval_ms.map(Duration::from_millis),
            max_attempts: config.max_poll_attempts,
        }
    }
}

/// Mutable controller state, always accessed under the lock
struct Shared {
    state: ControllerState,
    job: Option<Job>,
    error_message: Option<String>,
    submitting_detail: Option<String>,
    generation: u64,
    poll_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn fail(&mut self, message: impl Into<String>) {
        self.state = ControllerState::Failed;
        self.error_message = Some(message.into());
        self.poll_task = None;
    }

    fn complete(&mut self, job: Job) {
        self.state = ControllerState::Completed;
        self.job = Some(job);
        self.poll_task = None;
    }

    /// Apply a status report; returns whether polling should continue
    fn apply_poll(&mut self, mut job: Job) -> bool {
        match job.status {
            JobStatus::Completed => {
                self.complete(job);
                false
            }
            JobStatus::Failed => {
                let message = job
                    .error_message
                    .unwrap_or_else(|| "Processing failed".to_string());
                self.fail(message);
                false
            }
            JobStatus::Pending | JobStatus::Processing => {
                if job.stage_message.is_empty() {
                    if let Some(previous) = &self.job {
                        job.stage_message = previous.stage_message.clone();
                    }
                }
                let floor = self.job.as_ref().map(|j| j.progress).unwrap_or(0.0);
                if job.progress < floor {
                    debug!(
                        "Ignoring progress regression {:.1}% -> {:.1}%",
                        floor, job.progress
                    );
                    job.progress = floor;
                }
                self.job = Some(job);
                true
            }
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let job = self.job.as_ref();
        let state = self.state;

        let stage = match state {
            ControllerState::Idle => "Ready".to_string(),
            ControllerState::Submitting => "Submitting video".to_string(),
            ControllerState::Polling => job
                .map(|j| j.stage_message.clone())
                .filter(|stage| !stage.is_empty())
                .unwrap_or_else(|| "Processing".to_string()),
            ControllerState::Completed => "Processing complete".to_string(),
            ControllerState::Failed => "Processing failed".to_string(),
        };
        let progress_percent = match state {
            ControllerState::Idle | ControllerState::Submitting => 0.0,
            ControllerState::Completed => 100.0,
            ControllerState::Polling | ControllerState::Failed => {
                job.map(|j| j.progress).unwrap_or(0.0)
            }
        };
        let detailed_status = match state {
            ControllerState::Submitting => self.submitting_detail.clone(),
            ControllerState::Polling => job.and_then(|j| j.detail.clone()),
            _ => None,
        };

        StatusSnapshot {
            state,
            stage,
            progress_percent,
            is_terminal: state.is_terminal(),
            detailed_status,
            job_id: job.and_then(|j| j.id.clone()),
            result_uri: match state {
                ControllerState::Completed => job.and_then(|j| j.result_uri.clone()),
                _ => None,
            },
            error_message: match state {
                ControllerState::Failed => self.error_message.clone(),
                _ => None,
            },
        }
    }
}

struct Inner {
    backend: Arc<dyn ProcessingBackend>,
    settings: PollSettings,
    shared: Mutex<Shared>,
    tx_events: Sender<StatusSnapshot>,
    rx_events: Receiver<StatusSnapshot>,
    tx_watch: watch::Sender<StatusSnapshot>,
}

impl Inner {
    fn publish(&self, shared: &Shared) {
        let snapshot = shared.snapshot();
        debug!(
            "Controller {} at {:.1}%: {}",
            snapshot.state, snapshot.progress_percent, snapshot.stage
        );
        self.log_event(snapshot.clone());
        self.tx_watch.send_replace(snapshot);
    }

    /// Append to the event log, evicting the oldest entry when nobody drains it
    fn log_event(&self, snapshot: StatusSnapshot) {
        if let Err(TrySendError::Full(snapshot)) = self.tx_events.try_send(snapshot) {
            let _ = self.rx_events.try_recv();
            let _ = self.tx_events.try_send(snapshot);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.generation == generation && shared.state == ControllerState::Polling
    }

    /// Enter `Submitting`; returns the generation owning this submission
    fn begin_submit(&self, req: &SubmissionRequest) -> Result<u64, ControllerError> {
        let mut shared = self.shared.lock();
        if shared.state != ControllerState::Idle {
            return Err(ControllerError::Busy(shared.state));
        }
        validate(req)?;

        shared.generation += 1;
        shared.state = ControllerState::Submitting;
        shared.job = None;
        shared.error_message = None;
        shared.submitting_detail = Some(req.describe());
        self.publish(&shared);
        Ok(shared.generation)
    }

    fn finish_submit(
        self: &Arc<Self>,
        generation: u64,
        outcome: std::thread::Result<Result<Job, crate::backends::GatewayError>>,
    ) -> ControllerState {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            debug!("Discarding start response for a submission that was reset");
            return shared.state;
        }
        shared.submitting_detail = None;

        match outcome {
            Err(_) => {
                warn!("Backend panicked while starting a job");
                shared.fail(UNEXPECTED_ERROR);
            }
            Ok(Err(err)) => {
                warn!("Failed to start job: {}", err);
                shared.fail(err.to_string());
            }
            Ok(Ok(job)) => match job.status {
                JobStatus::Completed => {
                    info!("Job completed synchronously");
                    shared.complete(job);
                }
                JobStatus::Failed => {
                    let message = job
                        .error_message
                        .unwrap_or_else(|| "Processing failed".to_string());
                    shared.fail(message);
                }
                JobStatus::Pending | JobStatus::Processing => match job.id.clone() {
                    Some(id) => {
                        info!("Job {} accepted, polling for status", id);
                        shared.state = ControllerState::Polling;
                        shared.job = Some(job);
                        let task = tokio::spawn(poll_loop(Arc::clone(self), id, generation));
                        shared.poll_task = Some(task);
                    }
                    None => shared.fail("Backend accepted the job without an id"),
                },
            },
        }

        self.publish(&shared);
        shared.state
    }

    /// Apply one poll result; returns whether another poll should follow
    fn finish_poll(
        &self,
        generation: u64,
        id: &JobId,
        attempts: u32,
        outcome: std::thread::Result<Result<Job, crate::backends::GatewayError>>,
    ) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state != ControllerState::Polling {
            return false;
        }

        let mut keep_polling = match outcome {
            Err(_) => {
                warn!("Backend panicked while polling job {}", id);
                shared.fail(UNEXPECTED_ERROR);
                false
            }
            Ok(Err(err)) => {
                warn!("Polling job {} failed: {}", id, err);
                shared.fail(err.to_string());
                false
            }
            Ok(Ok(job)) => shared.apply_poll(job),
        };

        if keep_polling {
            if let Some(max) = self.settings.max_attempts {
                if attempts >= max {
                    warn!("Job {} still running after {} status checks", id, attempts);
                    shared.fail(format!(
                        "Gave up waiting for job {id} after {attempts} status checks"
                    ));
                    keep_polling = false;
                }
            }
        }

        self.publish(&shared);
        keep_polling
    }
}

async fn poll_loop(inner: Arc<Inner>, id: JobId, generation: u64) {
    let mut delay = inner.settings.interval;
    let mut attempts: u32 = 0;

    loop {
        tokio::time::sleep(delay).await;
        if !inner.is_current(generation) {
            return;
        }

        attempts += 1;
        debug!("Polling job {} (attempt {})", id, attempts);
        let outcome = AssertUnwindSafe(inner.backend.poll_job(&id))
            .catch_unwind()
            .await;

        if !inner.finish_poll(generation, &id, attempts, outcome) {
            return;
        }
        delay = inner.settings.next_delay(delay);
    }
}

/// Drives one job at a time from submission to a terminal state
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    pub fn new(backend: Arc<dyn ProcessingBackend>, settings: PollSettings) -> Self {
        let (tx_events, rx_events) = bounded(EVENT_LOG_CAPACITY);
        let (tx_watch, _) = watch::channel(StatusSnapshot::idle());
        let shared = Shared {
            state: ControllerState::Idle,
            job: None,
            error_message: None,
            submitting_detail: None,
            generation: 0,
            poll_task: None,
        };

        Self {
            inner: Arc::new(Inner {
                backend,
                settings,
                shared: Mutex::new(shared),
                tx_events,
                rx_events,
                tx_watch,
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn ProcessingBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn state(&self) -> ControllerState {
        self.inner.shared.lock().state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.shared.lock().snapshot()
    }

    /// Latest snapshot, updated on every transition
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.tx_watch.subscribe()
    }

    /// Published snapshots, in order. Only the latest
    /// [`EVENT_LOG_CAPACITY`] are kept until someone reads them.
    pub fn events(&self) -> Receiver<StatusSnapshot> {
        self.inner.rx_events.clone()
    }

    /// Submit a request. Only valid while idle.
    ///
    /// Validation failures are returned without touching state or the backend.
    /// Backend failures are not errors here: they move the controller to
    /// `Failed` and are reported through the snapshot.
    pub async fn submit(&self, req: SubmissionRequest) -> Result<ControllerState, ControllerError> {
        let generation = self.inner.begin_submit(&req)?;
        info!("{}", req.describe());

        let outcome = AssertUnwindSafe(self.inner.backend.start_job(&req))
            .catch_unwind()
            .await;

        Ok(self.inner.finish_submit(generation, outcome))
    }

    /// Drop the current job and return to `Idle`, cancelling any pending poll
    pub fn reset(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.state == ControllerState::Idle {
            return;
        }
        if let Some(task) = shared.poll_task.take() {
            task.abort();
        }

        shared.generation += 1;
        shared.state = ControllerState::Idle;
        shared.job = None;
        shared.error_message = None;
        shared.submitting_detail = None;
        self.inner.publish(&shared);
    }

    /// Wait until the current job reaches `Completed` or `Failed`
    pub async fn wait_for_terminal(&self) -> StatusSnapshot {
        let mut rx = self.subscribe();
        let terminal = rx
            .wait_for(|snapshot| snapshot.is_terminal)
            .await
            .map(|snapshot| (*snapshot).clone());

        match terminal {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        if let Some(task) = self.inner.shared.lock().poll_task.take() {
            task.abort();
        }
    }
}
