//! Content classifier seam
//!
//! Moderation and ice-breaker generation live behind [`SafetyClassifier`].
//! Verdicts are advisory: callers never let a classifier failure change
//! session state.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextVerdict {
    pub is_safe: bool,
    pub reason: Option<String>,
}

impl TextVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reason: None,
        }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: Some(reason.into()),
        }
    }
}

impl Default for TextVerdict {
    fn default() -> Self {
        Self::safe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameVerdict {
    pub is_safe: bool,
    pub blur_required: bool,
}

impl FrameVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            blur_required: false,
        }
    }

    pub fn unsafe_blur() -> Self {
        Self {
            is_safe: false,
            blur_required: true,
        }
    }
}

impl Default for FrameVerdict {
    fn default() -> Self {
        Self::safe()
    }
}

#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn scan_text(&self, text: &str) -> Result<TextVerdict, ClassifierError>;

    /// `image` is one encoded video frame
    async fn scan_frame(&self, image: &[u8]) -> Result<FrameVerdict, ClassifierError>;

    async fn suggest_ice_breakers(
        &self,
        interests: &[String],
    ) -> Result<Vec<String>, ClassifierError>;
}

/// Accepts everything, suggests nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveClassifier;

#[async_trait]
impl SafetyClassifier for PermissiveClassifier {
    async fn scan_text(&self, _text: &str) -> Result<TextVerdict, ClassifierError> {
        Ok(TextVerdict::safe())
    }

    async fn scan_frame(&self, _image: &[u8]) -> Result<FrameVerdict, ClassifierError> {
        Ok(FrameVerdict::safe())
    }

    async fn suggest_ice_breakers(
        &self,
        _interests: &[String],
    ) -> Result<Vec<String>, ClassifierError> {
        Ok(Vec::new())
    }
}

const GENERIC_ICE_BREAKERS: [&str; 3] = [
    "What's your favorite thing about your hobby?",
    "How did you get started with your interests?",
    "If you could do anything right now, what would it be?",
];

/// Local word-list moderation with template ice-breakers
#[derive(Debug, Clone, Default)]
pub struct BlocklistClassifier {
    blocked: Vec<String>,
}

impl BlocklistClassifier {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocked = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { blocked }
    }

    fn first_blocked(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        self.blocked
            .iter()
            .find(|blocked| words.contains(&blocked.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl SafetyClassifier for BlocklistClassifier {
    async fn scan_text(&self, text: &str) -> Result<TextVerdict, ClassifierError> {
        Ok(match self.first_blocked(text) {
            Some(word) => TextVerdict::flagged(format!("contains blocked term \"{}\"", word)),
            None => TextVerdict::safe(),
        })
    }

    async fn scan_frame(&self, _image: &[u8]) -> Result<FrameVerdict, ClassifierError> {
        Ok(FrameVerdict::safe())
    }

    async fn suggest_ice_breakers(
        &self,
        interests: &[String],
    ) -> Result<Vec<String>, ClassifierError> {
        let mut suggestions: Vec<String> = interests
            .iter()
            .take(3)
            .map(|interest| format!("What got you into {}?", interest))
            .collect();
        suggestions.extend(
            GENERIC_ICE_BREAKERS
                .iter()
                .take(3 - suggestions.len())
                .map(|s| s.to_string()),
        );
        Ok(suggestions)
    }
}
