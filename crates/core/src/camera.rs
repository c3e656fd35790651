use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};

/// An encoded still image from the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl Frame {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: "image/jpeg".to_string(),
        }
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Periodic camera capture.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Returns `Ok(None)` when the camera is not ready yet; the caller treats
    /// that as a skipped tick.
    async fn capture(&self) -> Result<Option<Frame>, CaptureError>;
}
