//! Clip pipeline client
//!
//! Submits a video (by URL or upload) to a clip-generation backend, follows
//! the resulting job until it finishes and hands back the produced artifact.

pub mod artifact;
pub mod backends;
pub mod controller;
pub mod job;
pub mod submission;

pub use artifact::download_artifact;
pub use backends::{
    resolve_artifact_uri, BackendConfig, BackendFactory, BackendType, DemoBackend, DemoConfig,
    GatewayError, GatewayErrorKind, HttpBackend, ProcessingBackend, UploadObserver,
};
pub use controller::{
    ControllerError, ControllerState, JobController, PollSettings, StatusSnapshot,
    EVENT_LOG_CAPACITY,
};
pub use job::{processing_steps, Job, JobId, JobStatus, ProcessingStep};
pub use submission::{
    validate, AspectRatio, FileSource, SourceKind, SubmissionRequest, ValidationError, VideoSource,
};
