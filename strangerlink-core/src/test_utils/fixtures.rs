//! Test fixtures: participants, configuration and fake collaborators

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::core_rendezvous::PeerMetadata;
use crate::core_safety::{
    ClassifierError, FrameSampler, FrameVerdict, SafetyClassifier, TextVerdict,
};
use crate::core_session::{MediaCapture, MediaError, MediaSource, Participant};

/// Seed for reproducible slot ordering
pub const TEST_SEED: u64 = 42;

/// Participant with a readable id
pub fn participant(id: &str, interests: &[&str]) -> Participant {
    Participant::new(
        id,
        format!("Anon-{}", id),
        interests.iter().map(|s| s.to_string()).collect(),
    )
}

/// Small pools and short timeouts, hosting without patience
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.matching.scheme_prefix = "test".to_string();
    config.matching.interest_slot_count = 3;
    config.matching.global_slot_count = 3;
    config.matching.scan_timeout = Duration::from_millis(200);
    config.matching.collision_backoff = Duration::from_millis(50);
    config.matching.host_patience = None;
    config.safety.classifier_timeout = Duration::from_secs(1);
    config
}

/// Media source that always refuses permission
#[derive(Debug, Default, Clone, Copy)]
pub struct DeniedMediaSource;

#[async_trait]
impl MediaSource for DeniedMediaSource {
    async fn acquire(&self) -> Result<Box<dyn MediaCapture>, MediaError> {
        Err(MediaError::PermissionDenied("camera".to_string()))
    }
}

/// Observable state of captures handed out by [`FakeMediaSource`]
#[derive(Debug, Default)]
pub struct FakeMediaState {
    pub acquired: AtomicUsize,
    pub stopped: AtomicUsize,
    pub frames_sampled: AtomicUsize,
    pub feeds_attached: Mutex<Vec<String>>,
    pub feeds_released: AtomicUsize,
    pub audio_enabled: Mutex<Option<bool>>,
    pub video_enabled: Mutex<Option<bool>>,
}

/// Media source that records every call; partner feeds yield a fixed frame
#[derive(Debug, Default, Clone)]
pub struct FakeMediaSource {
    pub state: Arc<FakeMediaState>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn frames_sampled(&self) -> usize {
        self.state.frames_sampled.load(Ordering::SeqCst)
    }

    /// Peer ids whose feeds were attached, in order
    pub fn feeds_attached(&self) -> Vec<String> {
        self.state
            .feeds_attached
            .lock()
            .map(|feeds| feeds.clone())
            .unwrap_or_default()
    }

    pub fn feeds_released(&self) -> usize {
        self.state.feeds_released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<Box<dyn MediaCapture>, MediaError> {
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            state: self.state.clone(),
        }))
    }

    fn remote_feed(&self, peer: &PeerMetadata) -> Option<Box<dyn FrameSampler>> {
        if let Ok(mut feeds) = self.state.feeds_attached.lock() {
            feeds.push(peer.peer_id.clone());
        }
        Some(Box::new(FakeRemoteFeed {
            state: self.state.clone(),
        }))
    }
}

struct FakeCapture {
    state: Arc<FakeMediaState>,
}

struct FakeRemoteFeed {
    state: Arc<FakeMediaState>,
}

impl FrameSampler for FakeRemoteFeed {
    fn sample_frame(&mut self) -> Option<Vec<u8>> {
        self.state.frames_sampled.fetch_add(1, Ordering::SeqCst);
        Some(vec![0xff, 0xd8, 0xff])
    }
}

impl Drop for FakeRemoteFeed {
    fn drop(&mut self) {
        self.state.feeds_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl MediaCapture for FakeCapture {
    fn set_audio_enabled(&mut self, enabled: bool) {
        if let Ok(mut audio) = self.state.audio_enabled.lock() {
            *audio = Some(enabled);
        }
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        if let Ok(mut video) = self.state.video_enabled.lock() {
            *video = Some(enabled);
        }
    }

    fn stop(&mut self) {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Classifier whose every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingClassifier;

#[async_trait]
impl SafetyClassifier for FailingClassifier {
    async fn scan_text(&self, _text: &str) -> Result<TextVerdict, ClassifierError> {
        Err(ClassifierError::Unavailable("offline".to_string()))
    }

    async fn scan_frame(&self, _image: &[u8]) -> Result<FrameVerdict, ClassifierError> {
        Err(ClassifierError::Unavailable("offline".to_string()))
    }

    async fn suggest_ice_breakers(
        &self,
        _interests: &[String],
    ) -> Result<Vec<String>, ClassifierError> {
        Err(ClassifierError::InvalidResponse("not a list".to_string()))
    }
}

/// Classifier that never answers
#[derive(Debug, Default, Clone, Copy)]
pub struct StallingClassifier;

#[async_trait]
impl SafetyClassifier for StallingClassifier {
    async fn scan_text(&self, _text: &str) -> Result<TextVerdict, ClassifierError> {
        std::future::pending().await
    }

    async fn scan_frame(&self, _image: &[u8]) -> Result<FrameVerdict, ClassifierError> {
        std::future::pending().await
    }

    async fn suggest_ice_breakers(
        &self,
        _interests: &[String],
    ) -> Result<Vec<String>, ClassifierError> {
        std::future::pending().await
    }
}

/// Classifier that blurs every frame and records the topics it was asked about
#[derive(Debug, Default)]
pub struct BlurringClassifier {
    pub topics: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl SafetyClassifier for BlurringClassifier {
    async fn scan_text(&self, _text: &str) -> Result<TextVerdict, ClassifierError> {
        Ok(TextVerdict::safe())
    }

    async fn scan_frame(&self, _image: &[u8]) -> Result<FrameVerdict, ClassifierError> {
        Ok(FrameVerdict::unsafe_blur())
    }

    async fn suggest_ice_breakers(
        &self,
        interests: &[String],
    ) -> Result<Vec<String>, ClassifierError> {
        if let Ok(mut topics) = self.topics.lock() {
            topics.push(interests.to_vec());
        }
        Ok(interests.iter().map(|i| format!("Favorite {}?", i)).collect())
    }
}
