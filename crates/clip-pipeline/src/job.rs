//! Backend-tracked processing job
//!
//! A `Job` is the unified view of one unit of remote work, whichever response
//! shape the backend used to describe it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque backend-assigned job identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not started
    Pending,
    /// Running on the backend
    Processing,
    /// Artifact available
    Completed,
    /// Gave up
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot of one job as last reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Absent when the backend answered synchronously
    pub id: Option<JobId>,

    pub status: JobStatus,

    /// Percentage in [0, 100]
    pub progress: f32,

    /// Current stage, e.g. "Generating clips". Empty when the backend's
    /// report did not name one.
    pub stage_message: String,

    /// Finer-grained status line within the stage
    pub detail: Option<String>,

    /// Absolute artifact URI, only set when completed
    pub result_uri: Option<String>,

    /// Only set when failed
    pub error_message: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn pending(id: JobId) -> Self {
        Self {
            id: Some(id),
            status: JobStatus::Pending,
            progress: 0.0,
            stage_message: "Initializing".to_string(),
            detail: None,
            result_uri: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn completed(id: Option<JobId>, result_uri: impl Into<String>) -> Self {
        Self {
            id,
            status: JobStatus::Completed,
            progress: 100.0,
            stage_message: "Processing complete".to_string(),
            detail: None,
            result_uri: Some(result_uri.into()),
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(id: Option<JobId>, error_message: impl Into<String>) -> Self {
        Self {
            id,
            status: JobStatus::Failed,
            progress: 0.0,
            stage_message: "Processing failed".to_string(),
            detail: None,
            result_uri: None,
            error_message: Some(error_message.into()),
            updated_at: Utc::now(),
        }
    }

    /// Record an in-flight progress report
    pub fn update(&mut self, status: JobStatus, progress: f32, stage_message: Option<String>) {
        self.status = status;
        self.progress = clamp_progress(progress);
        if let Some(stage) = stage_message {
            self.stage_message = stage;
        }
        self.updated_at = Utc::now();
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = clamp_progress(progress);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage_message = stage.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Clamp a reported percentage into [0, 100]; NaN counts as no progress
pub fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// Checklist entry shown under the progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStep {
    AnalyzingVideo,
    IdentifyingKeyMoments,
    GeneratingClips,
    CreatingCaptions,
    FinalizingOutput,
}

impl ProcessingStep {
    pub const ALL: [ProcessingStep; 5] = [
        Self::AnalyzingVideo,
        Self::IdentifyingKeyMoments,
        Self::GeneratingClips,
        Self::CreatingCaptions,
        Self::FinalizingOutput,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::AnalyzingVideo => "Analyzing video",
            Self::IdentifyingKeyMoments => "Identifying key moments",
            Self::GeneratingClips => "Generating clips",
            Self::CreatingCaptions => "Creating captions",
            Self::FinalizingOutput => "Finalizing output",
        }
    }

    /// Progress at which the step counts as done
    pub fn threshold(&self) -> f32 {
        match self {
            Self::AnalyzingVideo => 20.0,
            Self::IdentifyingKeyMoments => 40.0,
            Self::GeneratingClips => 60.0,
            Self::CreatingCaptions => 80.0,
            Self::FinalizingOutput => 95.0,
        }
    }
}

/// Every step paired with whether `progress` has passed it
pub fn processing_steps(progress: f32) -> Vec<(ProcessingStep, bool)> {
    ProcessingStep::ALL
        .iter()
        .map(|step| (*step, progress >= step.threshold()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped() {
        let job = Job::pending(JobId::new("a")).with_progress(140.0);
        assert_eq!(job.progress, 100.0);

        let mut job = Job::pending(JobId::new("a"));
        job.update(JobStatus::Processing, -3.0, None);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.stage_message, "Initializing");

        assert_eq!(clamp_progress(f32::NAN), 0.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());

        let done = Job::completed(None, "http://cdn/x.mp4");
        assert!(done.is_finished());
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.result_uri.as_deref(), Some("http://cdn/x.mp4"));
    }

    #[test]
    fn test_processing_steps() {
        let steps = processing_steps(45.0);
        let done: Vec<bool> = steps.iter().map(|(_, d)| *d).collect();
        assert_eq!(done, vec![true, true, false, false, false]);

        assert!(processing_steps(100.0).iter().all(|(_, d)| *d));
        assert!(processing_steps(0.0).iter().all(|(_, d)| !*d));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}
