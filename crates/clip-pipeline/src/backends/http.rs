//! HTTP job service backend
//!
//! Starts jobs with a multipart `POST {base}/process-video` and polls
//! `GET {base}/status/{id}`. The start call may also be answered synchronously
//! with `{success, videoUrl}`, in which case the job is complete immediately.

use super::{BackendConfig, BackendType, GatewayError, ProcessingBackend};
use crate::job::{Job, JobId, JobStatus};
use crate::submission::{FileSource, SubmissionRequest, VideoSource};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

/// Called with `(bytes_sent, total_bytes)` while a file is uploaded
pub type UploadObserver = Arc<dyn Fn(u64, u64) + Send + Sync>;

const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// HTTP job service backend
pub struct HttpBackend {
    api_url: String,
    client: reqwest::Client,
    upload_observer: Option<UploadObserver>,
}

impl HttpBackend {
    /// Create new HTTP backend
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let api_url = config
            .api_url
            .clone()
            .context("HTTP backend requires api_url")?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
            upload_observer: None,
        })
    }

    /// Report upload progress for file submissions
    pub fn with_upload_observer(mut self, observer: UploadObserver) -> Self {
        self.upload_observer = Some(observer);
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    /// Multipart body for the job service
    fn build_form(&self, req: &SubmissionRequest) -> Result<Form, GatewayError> {
        let form = Form::new()
            .text("query", req.instruction.clone())
            .text("aspect_ratio", req.aspect_ratio.as_service_name())
            .text("add_captions", req.captions_enabled.to_string());

        let form = match &req.source {
            VideoSource::Url(url) => form.text("video_url", url.trim().to_string()),
            VideoSource::File(file) => form.part("video_file", self.file_part(file)?),
        };
        Ok(form)
    }

    /// Stream the payload in chunks so upload progress can be observed
    fn file_part(&self, file: &FileSource) -> Result<Part, GatewayError> {
        let total = file.size_bytes();
        let observer = self.upload_observer.clone();
        let chunks: Vec<Vec<u8>> = file
            .data
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(|c| c.to_vec())
            .collect();

        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            debug!("Upload progress: {}%", sent * 100 / total.max(1));
            if let Some(observer) = &observer {
                observer(sent, total);
            }
            Ok::<_, std::io::Error>(chunk)
        }));

        Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(file.file_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| GatewayError::parse(format!("invalid MIME type '{}': {e}", file.mime_type)))
    }

    /// Body text of a successful response, or the server's complaint
    async fn read_body(response: reqwest::Response) -> Result<String, GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = error_message_from_body(&body)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_else(|| "Failed to process video".to_string());
            return Err(GatewayError::server(status.as_u16(), message));
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ProcessingBackend for HttpBackend {
    fn name(&self) -> &str {
        "Job service"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Http
    }

    async fn start_job(&self, req: &SubmissionRequest) -> Result<Job, GatewayError> {
        let form = self.build_form(req)?;
        info!(
            "Sending {} submission to {} (aspect ratio {}, captions {})",
            req.source_kind(),
            self.api_url,
            req.aspect_ratio,
            req.captions_enabled
        );

        let response = self
            .client
            .post(self.endpoint("process-video"))
            .multipart(form)
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        parse_start_response(&self.api_url, &body)
    }

    async fn poll_job(&self, id: &JobId) -> Result<Job, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&format!("status/{}", id)))
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        let status: JobResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::parse(format!("bad status response: {e}")))?;
        job_from_response(&self.api_url, status)
    }
}

/// Make a backend-relative artifact path absolute
pub fn resolve_artifact_uri(base_url: &str, path: &str) -> String {
    if path.starts_with("http") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn parse_start_response(base_url: &str, body: &str) -> Result<Job, GatewayError> {
    let parsed: StartResponse = serde_json::from_str(body)
        .map_err(|e| GatewayError::parse(format!("bad start response: {e}")))?;

    match parsed {
        StartResponse::Job(job) => job_from_response(base_url, job),
        StartResponse::OneShot(one_shot) => {
            if !one_shot.success {
                return Err(GatewayError::server(
                    200,
                    one_shot
                        .error
                        .unwrap_or_else(|| "Failed to process video".to_string()),
                ));
            }
            let url = one_shot
                .video_url
                .ok_or_else(|| GatewayError::parse("successful response without videoUrl"))?;
            Ok(Job::completed(None, resolve_artifact_uri(base_url, &url)))
        }
    }
}

fn job_from_response(base_url: &str, resp: JobResponse) -> Result<Job, GatewayError> {
    let id = JobId(resp.id);
    let status = map_status(&resp.status)?;

    let job = match status {
        JobStatus::Completed => {
            let output = resp.output_video.ok_or_else(|| {
                GatewayError::parse(format!("job {id} completed without output_video"))
            })?;
            let mut job = Job::completed(Some(id), resolve_artifact_uri(base_url, &output));
            if let Some(message) = resp.message {
                job.stage_message = message;
            }
            job
        }
        JobStatus::Failed => {
            let message = resp
                .error
                .or(resp.message)
                .unwrap_or_else(|| "Processing failed".to_string());
            warn!("Job {} failed: {}", id, message);
            Job::failed(Some(id), message)
        }
        JobStatus::Pending | JobStatus::Processing => {
            // no message means "stage unchanged", not "Initializing"
            let mut job = Job::pending(id).with_stage("");
            job.update(status, resp.progress.unwrap_or(0.0), resp.message);
            job
        }
    };
    Ok(job)
}

fn map_status(status: &str) -> Result<JobStatus, GatewayError> {
    match status.trim().to_ascii_lowercase().as_str() {
        "pending" | "queued" => Ok(JobStatus::Pending),
        "processing" | "running" | "started" => Ok(JobStatus::Processing),
        "completed" | "complete" | "succeeded" | "done" => Ok(JobStatus::Completed),
        "failed" | "error" | "cancelled" | "canceled" => Ok(JobStatus::Failed),
        other => Err(GatewayError::parse(format!("unknown job status '{other}'"))),
    }
}

/// `message` or `error` from a JSON error body, else the trimmed body itself
fn error_message_from_body(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                return Some(msg.to_string());
            }
        }
    }
    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Start response, either shape
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StartResponse {
    Job(JobResponse),
    OneShot(OneShotResponse),
}

/// Asynchronous job contract, also returned by the status endpoint
#[derive(Debug, Deserialize)]
struct JobResponse {
    #[serde(deserialize_with = "id_as_string")]
    id: String,
    status: String,
    #[serde(default)]
    progress: Option<f32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    output_video: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Synchronous contract
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OneShotResponse {
    success: bool,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported job id {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::GatewayErrorKind;

    #[test]
    fn test_backend_requires_api_url() {
        let config = BackendConfig::new(BackendType::Http);
        assert!(HttpBackend::new(&config).is_err());

        let backend =
            HttpBackend::new(&config.with_api_url("http://localhost:8000/api/")).unwrap();
        assert_eq!(backend.api_url(), "http://localhost:8000/api");
        assert_eq!(
            backend.endpoint("status/abc"),
            "http://localhost:8000/api/status/abc"
        );
        assert_eq!(backend.name(), "Job service");
    }

    #[test]
    fn test_resolve_artifact_uri() {
        assert_eq!(
            resolve_artifact_uri("http://api", "http://cdn/x.mp4"),
            "http://cdn/x.mp4"
        );
        assert_eq!(
            resolve_artifact_uri("http://api", "https://cdn/x.mp4"),
            "https://cdn/x.mp4"
        );
        assert_eq!(
            resolve_artifact_uri("http://api", "/files/x.mp4"),
            "http://api/files/x.mp4"
        );
        assert_eq!(
            resolve_artifact_uri("http://api/", "files/x.mp4"),
            "http://api/files/x.mp4"
        );
    }

    #[test]
    fn test_async_start_response_is_pending() {
        let job = parse_start_response(
            "http://api",
            r#"{"id":"job-1","status":"pending","progress":0,"message":"Queued"}"#,
        )
        .unwrap();

        assert_eq!(job.id, Some(JobId::new("job-1")));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage_message, "Queued");
    }

    #[test]
    fn test_numeric_job_id() {
        let job = parse_start_response("http://api", r#"{"id":42,"status":"processing"}"#).unwrap();
        assert_eq!(job.id, Some(JobId::new("42")));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.stage_message, "");
    }

    #[test]
    fn test_status_without_message_leaves_stage_unnamed() {
        let resp: JobResponse =
            serde_json::from_str(r#"{"id":"a","status":"processing","progress":70}"#).unwrap();
        let job = job_from_response("http://api", resp).unwrap();

        assert_eq!(job.progress, 70.0);
        assert!(job.stage_message.is_empty());
    }

    #[test]
    fn test_sync_start_response_is_completed() {
        let job = parse_start_response(
            "http://api",
            r#"{"success":true,"videoUrl":"/out/clip.mp4"}"#,
        )
        .unwrap();

        assert!(job.id.is_none());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_uri.as_deref(), Some("http://api/out/clip.mp4"));
    }

    #[test]
    fn test_sync_failure_is_server_error() {
        let err = parse_start_response("http://api", r#"{"success":false,"error":"quota"}"#)
            .unwrap_err();
        assert_eq!(err, GatewayError::server(200, "quota"));

        let err = parse_start_response("http://api", r#"{"success":false}"#).unwrap_err();
        assert_eq!(err, GatewayError::server(200, "Failed to process video"));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse_start_response("http://api", "<html>oops</html>").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Parse);

        let err = parse_start_response("http://api", r#"{"id":"a","status":"exploded"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Parse);
    }

    #[test]
    fn test_completed_status_resolves_artifact() {
        let resp: JobResponse = serde_json::from_str(
            r#"{"id":"a","status":"completed","progress":100,"output_video":"/out/a.mp4"}"#,
        )
        .unwrap();
        let job = job_from_response("http://api", resp).unwrap();
        assert_eq!(job.result_uri.as_deref(), Some("http://api/out/a.mp4"));

        let resp: JobResponse =
            serde_json::from_str(r#"{"id":"a","status":"completed"}"#).unwrap();
        assert_eq!(
            job_from_response("http://api", resp).unwrap_err().kind(),
            GatewayErrorKind::Parse
        );
    }

    #[test]
    fn test_failed_status_carries_error() {
        let resp: JobResponse = serde_json::from_str(
            r#"{"id":"a","status":"failed","message":"Stage 3","error":"decoder crashed"}"#,
        )
        .unwrap();
        let job = job_from_response("http://api", resp).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("decoder crashed"));
    }

    #[test]
    fn test_error_message_from_body() {
        assert_eq!(
            error_message_from_body(r#"{"message":"bad aspect ratio"}"#).as_deref(),
            Some("bad aspect ratio")
        );
        assert_eq!(
            error_message_from_body(r#"{"error":"nope"}"#).as_deref(),
            Some("nope")
        );
        assert_eq!(
            error_message_from_body("  upstream timeout \n").as_deref(),
            Some("upstream timeout")
        );
        assert_eq!(error_message_from_body("   "), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("Queued").unwrap(), JobStatus::Pending);
        assert_eq!(map_status("running").unwrap(), JobStatus::Processing);
        assert_eq!(map_status("succeeded").unwrap(), JobStatus::Completed);
        assert_eq!(map_status("cancelled").unwrap(), JobStatus::Failed);
        assert!(map_status("").is_err());
    }
}
