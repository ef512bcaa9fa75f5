//! Submission model for a single clip-generation request
//!
//! Describes where the source video comes from and how the output should be
//! shaped. Validation is local and synchronous; nothing here touches the network.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Where the source video comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    File,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => write!(f, "url"),
            Self::File => write!(f, "file"),
        }
    }
}

/// Output aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1:1
    Square,
    /// 16:9
    Landscape,
    /// 9:16
    Portrait,
}

impl AspectRatio {
    /// Ratio spelling shown to users ("16:9")
    pub fn as_ratio(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
        }
    }

    /// Name the job service expects in the `aspect_ratio` field
    pub fn as_service_name(&self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Landscape => "youtube",
            Self::Portrait => "reel",
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Landscape
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ratio())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1:1" | "square" => Ok(Self::Square),
            "16:9" | "landscape" | "youtube" => Ok(Self::Landscape),
            "9:16" | "portrait" | "reel" => Ok(Self::Portrait),
            other => Err(format!(
                "unknown aspect ratio '{other}' (expected 1:1, 16:9 or 9:16)"
            )),
        }
    }
}

/// Uploaded video payload
#[derive(Clone, PartialEq, Eq)]
pub struct FileSource {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl FileSource {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read a file from disk, guessing the MIME type from its extension
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        Ok(Self {
            mime_type: mime_for_path(path).to_string(),
            file_name,
            data,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Size in megabytes, as shown next to the selected file
    pub fn size_mb(&self) -> f64 {
        self.size_bytes() as f64 / (1024.0 * 1024.0)
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}

// Payload bytes are noise in logs.
impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// MIME type for a video file name; anything unrecognised is not a video
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mpg" | "mpeg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

/// Source payload, one variant per [`SourceKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    Url(String),
    File(FileSource),
}

impl VideoSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Url(_) => SourceKind::Url,
            Self::File(_) => SourceKind::File,
        }
    }
}

/// One processing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub source: VideoSource,

    /// Free-text instruction for the clip generator, may be empty
    pub instruction: String,

    pub aspect_ratio: AspectRatio,

    pub captions_enabled: bool,
}

impl SubmissionRequest {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(VideoSource::Url(url.into()))
    }

    pub fn from_file(file: FileSource) -> Self {
        Self::new(VideoSource::File(file))
    }

    fn new(source: VideoSource) -> Self {
        Self {
            source,
            instruction: String::new(),
            aspect_ratio: AspectRatio::default(),
            captions_enabled: false,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_captions(mut self, enabled: bool) -> Self {
        self.captions_enabled = enabled;
        self
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// One-line summary announced when processing starts
    pub fn describe(&self) -> String {
        format!(
            "Starting video processing with {} aspect ratio{}",
            self.aspect_ratio,
            if self.captions_enabled { " and captions" } else { "" }
        )
    }
}

/// Reasons a submission is rejected before any network call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please enter a valid video URL")]
    EmptyUrl,

    #[error("Please select a video file")]
    NoFile,

    #[error("Please select a valid video file (got {0})")]
    WrongMime(String),
}

/// Check a submission locally
pub fn validate(req: &SubmissionRequest) -> Result<(), ValidationError> {
    match &req.source {
        VideoSource::Url(url) => {
            if url.trim().is_empty() {
                return Err(ValidationError::EmptyUrl);
            }
        }
        VideoSource::File(file) => {
            if file.data.is_empty() || file.file_name.trim().is_empty() {
                return Err(ValidationError::NoFile);
            }
            if !file.is_video() {
                return Err(ValidationError::WrongMime(file.mime_type.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(mime: &str) -> FileSource {
        FileSource::new("clip.mp4", mime, vec![0u8; 16])
    }

    #[test]
    fn test_blank_urls_are_rejected() {
        for url in ["", "   ", "\t\n", " \r "] {
            let req = SubmissionRequest::from_url(url);
            assert_eq!(validate(&req), Err(ValidationError::EmptyUrl), "url {url:?}");
        }
    }

    #[test]
    fn test_url_with_padding_is_accepted() {
        let req = SubmissionRequest::from_url("  https://example.com/video.mp4 ");
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn test_non_video_mime_is_rejected() {
        for mime in ["image/png", "audio/mpeg", "application/octet-stream", "text/video"] {
            let req = SubmissionRequest::from_file(clip(mime));
            assert_eq!(
                validate(&req),
                Err(ValidationError::WrongMime(mime.to_string()))
            );
        }
    }

    #[test]
    fn test_empty_file_is_no_file() {
        let req = SubmissionRequest::from_file(FileSource::new("clip.mp4", "video/mp4", vec![]));
        assert_eq!(validate(&req), Err(ValidationError::NoFile));
    }

    #[test]
    fn test_video_file_is_accepted() {
        let req = SubmissionRequest::from_file(clip("video/webm"));
        assert!(validate(&req).is_ok());
        assert_eq!(req.source_kind(), SourceKind::File);
    }

    #[test]
    fn test_aspect_ratio_spellings() {
        assert_eq!("1:1".parse::<AspectRatio>().unwrap(), AspectRatio::Square);
        assert_eq!("reel".parse::<AspectRatio>().unwrap(), AspectRatio::Portrait);
        assert_eq!("Landscape".parse::<AspectRatio>().unwrap(), AspectRatio::Landscape);
        assert!("4:3".parse::<AspectRatio>().is_err());

        assert_eq!(AspectRatio::Square.as_service_name(), "square");
        assert_eq!(AspectRatio::Landscape.as_service_name(), "youtube");
        assert_eq!(AspectRatio::Portrait.as_service_name(), "reel");
        assert_eq!(AspectRatio::default().as_ratio(), "16:9");
    }

    #[test]
    fn test_describe() {
        let req = SubmissionRequest::from_url("https://example.com/a.mp4")
            .with_aspect_ratio(AspectRatio::Portrait)
            .with_captions(true);
        assert_eq!(
            req.describe(),
            "Starting video processing with 9:16 aspect ratio and captions"
        );

        let req = SubmissionRequest::from_url("https://example.com/a.mp4");
        assert_eq!(req.describe(), "Starting video processing with 16:9 aspect ratio");
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("a/b/Clip.MOV")), "video/quicktime");
        assert_eq!(mime_for_path(Path::new("clip.mkv")), "video/x-matroska");
        assert_eq!(mime_for_path(Path::new("notes.txt")), "application/octet-stream");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_size_mb() {
        let file = FileSource::new("clip.mp4", "video/mp4", vec![0u8; 3 * 1024 * 1024 / 2]);
        assert!((file.size_mb() - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holiday.webm");
        std::fs::write(&path, b"not really webm").unwrap();

        let file = FileSource::from_path(&path).await.unwrap();
        assert_eq!(file.file_name, "holiday.webm");
        assert_eq!(file.mime_type, "video/webm");
        assert_eq!(file.size_bytes(), 15);
    }
}
