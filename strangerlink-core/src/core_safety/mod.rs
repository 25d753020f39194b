//! Content safety: classifier seam and the scheduler that keeps it off the
//! chat's critical path.

pub mod classifier;
pub mod scheduler;

pub use classifier::{
    BlocklistClassifier, ClassifierError, FrameVerdict, PermissiveClassifier, SafetyClassifier,
    TextVerdict,
};
pub use scheduler::{FrameSampler, SafetyOutcome, SafetyScheduler};
