//! Frame sources for running without a live camera.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use guided_fix_core::camera::{CaptureError, Frame, FrameSource};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Cycles through the image files of a directory, one per capture.
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    next: AtomicUsize,
}

impl DirectoryFrameSource {
    pub fn new(dir_path: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir_path)
            .with_context(|| format!("Failed to read frames directory: {}", dir_path.display()))?
        {
            let path = entry?.path();
            if path.is_file() && mime_type(&path).is_some() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("No image files found in {}", dir_path.display()));
        }
        files.sort();
        tracing::info!("Replaying {} frame(s) from {}", files.len(), dir_path.display());

        Ok(Self {
            files,
            next: AtomicUsize::new(0),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn capture(&self) -> Result<Option<Frame>, CaptureError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.files.len();
        let path = &self.files[index];
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(CaptureError::PermissionDenied);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read frame {}", path.display()))
                    .into());
            }
        };
        tracing::trace!("Captured {}", path.display());

        let mime_type = mime_type(path).unwrap_or("image/jpeg");
        Ok(Some(Frame {
            bytes,
            mime_type: mime_type.to_string(),
        }))
    }
}

fn mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Placeholder frames for demo mode. The first `warmup` captures report a
/// camera that is not ready yet.
pub struct SyntheticFrameSource {
    warmup: AtomicU32,
}

// SOI + EOI markers: the smallest byte string that still reads as a JPEG.
const BLANK_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

impl SyntheticFrameSource {
    pub fn new(warmup: u32) -> Self {
        Self {
            warmup: AtomicU32::new(warmup),
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn capture(&self) -> Result<Option<Frame>, CaptureError> {
        let warming_up = self
            .warmup
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if warming_up {
            return Ok(None);
        }
        Ok(Some(Frame::jpeg(BLANK_JPEG.to_vec())))
    }
}
