//! Scripted backend shared by the integration tests
#![allow(dead_code)]

use clip_pipeline::{
    resolve_artifact_uri, BackendType, GatewayError, Job, JobId, JobStatus, ProcessingBackend,
    SubmissionRequest,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const BASE_URL: &str = "http://api";

/// One scripted answer to a poll
pub enum Reply {
    Job(Job),
    Error(GatewayError),
    Panic,
}

/// Backend that answers from a fixed script and counts calls.
/// Once the poll script runs out it keeps reporting the job as processing.
pub struct ScriptedBackend {
    start: Result<Job, GatewayError>,
    start_delay: Option<Duration>,
    polls: Mutex<VecDeque<Reply>>,
    start_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(start: Result<Job, GatewayError>) -> Self {
        Self {
            start,
            start_delay: None,
            polls: Mutex::new(VecDeque::new()),
            start_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    /// Backend whose start call hands out a pending job `id`
    pub fn accepting(id: &str) -> Self {
        Self::new(Ok(Job::pending(JobId::new(id))))
    }

    /// Make the start call take `delay`, like a slow upload
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn then(self, reply: Reply) -> Self {
        self.polls.lock().push_back(reply);
        self
    }

    pub fn then_progress(self, id: &str, progress: f32) -> Self {
        self.then(Reply::Job(processing(id, progress)))
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProcessingBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Demo
    }

    async fn start_job(&self, _req: &SubmissionRequest) -> Result<Job, GatewayError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.start.clone()
    }

    async fn poll_job(&self, id: &JobId) -> Result<Job, GatewayError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.polls.lock().pop_front();
        match next {
            Some(Reply::Job(job)) => Ok(job),
            Some(Reply::Error(err)) => Err(err),
            Some(Reply::Panic) => panic!("scripted backend blew up"),
            None => Ok(processing(id.as_str(), 10.0)),
        }
    }
}

pub fn processing(id: &str, progress: f32) -> Job {
    let mut job = Job::pending(JobId::new(id));
    job.update(JobStatus::Processing, progress, Some("Generating clips".to_string()));
    job
}

/// Completed job whose artifact path was resolved against [`BASE_URL`]
pub fn completed(id: &str, path: &str) -> Job {
    Job::completed(Some(JobId::new(id)), resolve_artifact_uri(BASE_URL, path))
}

pub fn url_request() -> SubmissionRequest {
    SubmissionRequest::from_url("https://example.com/talk.mp4").with_instruction("funny moments")
}
