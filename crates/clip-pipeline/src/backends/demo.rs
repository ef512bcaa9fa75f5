//! Offline demo backend
//!
//! Simulates a processing run without any network traffic: every poll moves
//! the job forward by a random amount and walks through the usual stages.

use super::{BackendType, GatewayError, ProcessingBackend};
use crate::job::{Job, JobId, JobStatus};
use crate::submission::SubmissionRequest;
use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Stages with the detail lines shown while each one runs
pub const DEMO_STAGES: [(&str, &[&str]); 6] = [
    ("Initializing", &["Loading video processor", "Setting up environment"]),
    (
        "Analyzing video content",
        &["Scanning video frames", "Detecting scene changes", "Analyzing audio track"],
    ),
    (
        "Identifying key moments",
        &["Detecting important segments", "Scoring content relevance", "Finding peak moments"],
    ),
    (
        "Generating clips",
        &["Cutting video segments", "Applying transitions", "Optimizing for selected aspect ratio"],
    ),
    (
        "Creating captions",
        &["Transcribing audio", "Generating timed subtitles", "Formatting captions"],
    ),
    (
        "Finalizing output",
        &["Rendering final video", "Optimizing file size", "Preparing download"],
    ),
];

/// Jobs nobody polled for this long are forgotten
const DEMO_JOB_TTL: Duration = Duration::from_secs(10 * 60);

/// Upper bound on simulated jobs kept at once
const MAX_DEMO_JOBS: usize = 64;

const SAMPLE_VIDEO_URL: &str =
    "https://storage.googleapis.com/gtv-videos-bucket/sample/BigBuckBunny.mp4";

#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Progress added per poll, drawn uniformly from `[min, max)`
    pub step_range: (f32, f32),

    /// Artifact every demo job finishes with
    pub artifact_uri: String,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            step_range: (4.0, 12.0),
            artifact_uri: SAMPLE_VIDEO_URL.to_string(),
            seed: None,
        }
    }
}

#[derive(Debug)]
struct DemoJob {
    progress: f32,
    polls: usize,
    touched: Instant,
}

impl DemoJob {
    fn new() -> Self {
        Self {
            progress: 0.0,
            polls: 0,
            touched: Instant::now(),
        }
    }
}

pub struct DemoBackend {
    config: DemoConfig,
    jobs: Mutex<HashMap<JobId, DemoJob>>,
    rng: Mutex<StdRng>,
}

impl DemoBackend {
    pub fn new(config: DemoConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    fn next_step(&self) -> f32 {
        let (min, max) = self.config.step_range;
        if max <= min {
            return min.max(0.0);
        }
        self.rng.lock().gen_range(min..max)
    }

    /// Drop abandoned jobs and make room for one more
    fn evict(jobs: &mut HashMap<JobId, DemoJob>) {
        jobs.retain(|_, job| job.touched.elapsed() < DEMO_JOB_TTL);

        while jobs.len() >= MAX_DEMO_JOBS {
            let oldest = jobs
                .iter()
                .min_by_key(|(_, job)| job.touched)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!("Evicting demo job {}", id);
                    jobs.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Stage index for a progress value, six equal bands
fn stage_index(progress: f32) -> usize {
    let band = 100.0 / DEMO_STAGES.len() as f32;
    ((progress / band) as usize).min(DEMO_STAGES.len() - 1)
}

#[async_trait::async_trait]
impl ProcessingBackend for DemoBackend {
    fn name(&self) -> &str {
        "Demo"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Demo
    }

    async fn start_job(&self, req: &SubmissionRequest) -> Result<Job, GatewayError> {
        let id = JobId(Uuid::new_v4().to_string());
        debug!("Demo job {} started: {}", id, req.describe());
        {
            let mut jobs = self.jobs.lock();
            Self::evict(&mut jobs);
            jobs.insert(id.clone(), DemoJob::new());
        }

        let (stage, details) = DEMO_STAGES[0];
        Ok(Job::pending(id).with_stage(stage).with_detail(details[0]))
    }

    async fn poll_job(&self, id: &JobId) -> Result<Job, GatewayError> {
        let step = self.next_step();
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| GatewayError::server(404, format!("Unknown job {id}")))?;

        job.progress += step;
        job.polls += 1;
        job.touched = Instant::now();

        if job.progress >= 100.0 {
            jobs.remove(id);
            return Ok(Job::completed(Some(id.clone()), self.config.artifact_uri.clone()));
        }

        let (stage, details) = DEMO_STAGES[stage_index(job.progress)];
        let detail = details[job.polls % details.len()];

        let mut snapshot = Job::pending(id.clone()).with_detail(detail);
        snapshot.update(JobStatus::Processing, job.progress, Some(stage.to_string()));
        Ok(snapshot)
    }
}
