//! Media seam
//!
//! The controller acquires one local capture lazily on the first search,
//! reuses it across skips and stops it on exit. Each connected partner's
//! incoming video is attached separately and dropped with the session; that
//! remote feed is what frame moderation samples.

use async_trait::async_trait;
use thiserror::Error;

use crate::core_rendezvous::PeerMetadata;
use crate::core_safety::FrameSampler;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media device unavailable: {0}")]
    Unavailable(String),
}

/// Opens capture devices
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn MediaCapture>, MediaError>;

    /// Incoming video of a newly connected partner, if any is flowing
    fn remote_feed(&self, _peer: &PeerMetadata) -> Option<Box<dyn FrameSampler>> {
        None
    }
}

/// A live local audio/video capture
pub trait MediaCapture: Send + Sync {
    fn set_audio_enabled(&mut self, enabled: bool);
    fn set_video_enabled(&mut self, enabled: bool);
    fn stop(&mut self);
}

/// Audio-only placeholder used when no camera is wired up
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMediaSource;

#[async_trait]
impl MediaSource for NullMediaSource {
    async fn acquire(&self) -> Result<Box<dyn MediaCapture>, MediaError> {
        Ok(Box::new(NullCapture))
    }
}

struct NullCapture;

impl MediaCapture for NullCapture {
    fn set_audio_enabled(&mut self, _enabled: bool) {}
    fn set_video_enabled(&mut self, _enabled: bool) {}
    fn stop(&mut self) {}
}
