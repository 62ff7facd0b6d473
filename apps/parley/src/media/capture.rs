//! Acquire-once local media.
//!
//! The local stream is captured once, eagerly, at process start and then
//! shared read-only by every call attempt for the lifetime of the
//! process. Call attempts borrow it; only the capture subsystem ever
//! replaces or releases it.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{LocalStream, LocalTrack, MediaError, TrackKind};

/// Produces the local stream. Real device capture lives behind this seam;
/// permission and device errors come back as [`MediaError::Capture`].
pub trait CaptureBackend: Send + Sync {
    fn open(&self) -> Result<LocalStream, MediaError>;
}

/// Default backend: one audio and one video track descriptor, no device
/// access. Stands in for camera/microphone capture, which is outside the
/// negotiation core.
#[derive(Debug, Default)]
pub struct SyntheticCapture;

impl CaptureBackend for SyntheticCapture {
    fn open(&self) -> Result<LocalStream, MediaError> {
        Ok(LocalStream {
            id: "local-stream".to_string(),
            tracks: vec![
                LocalTrack {
                    kind: TrackKind::Audio,
                    id: "audio0".to_string(),
                },
                LocalTrack {
                    kind: TrackKind::Video,
                    id: "video0".to_string(),
                },
            ],
        })
    }
}

/// Process-scoped handle to the local stream.
///
/// `acquire` may be attempted once. A failed acquisition is final: the
/// failure is reported to the caller that attempted it, and every later
/// call attempt simply negotiates without local media.
#[derive(Debug, Default)]
pub struct LocalMedia {
    attempted: AtomicBool,
    slot: OnceCell<Arc<LocalStream>>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, backend: &dyn CaptureBackend) -> Result<Arc<LocalStream>, MediaError> {
        if self.attempted.swap(true, Ordering::SeqCst) {
            return Err(MediaError::AlreadyAcquired);
        }
        let stream = Arc::new(backend.open()?);
        self.slot
            .set(Arc::clone(&stream))
            .map_err(|_| MediaError::AlreadyAcquired)?;
        Ok(stream)
    }

    /// Borrow the local stream, if capture succeeded.
    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.slot.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingCapture;

    impl CaptureBackend for FailingCapture {
        fn open(&self) -> Result<LocalStream, MediaError> {
            Err(MediaError::Capture("permission denied".into()))
        }
    }

    #[test]
    fn acquire_once_then_share() {
        let media = LocalMedia::new();
        let stream = media.acquire(&SyntheticCapture).expect("first acquire");
        assert_eq!(stream.tracks.len(), 2);
        assert!(matches!(
            media.acquire(&SyntheticCapture),
            Err(MediaError::AlreadyAcquired)
        ));
        assert!(media.stream().is_some());
    }

    #[test]
    fn failed_acquisition_is_final() {
        let media = LocalMedia::new();
        assert!(matches!(
            media.acquire(&FailingCapture),
            Err(MediaError::Capture(_))
        ));
        assert!(media.stream().is_none());
        // No second chance, even with a working backend.
        assert!(matches!(
            media.acquire(&SyntheticCapture),
            Err(MediaError::AlreadyAcquired)
        ));
    }
}
