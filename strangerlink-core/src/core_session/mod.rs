//! Session lifecycle: one client's view of searching, chatting and skipping

pub mod controller;
pub mod errors;
pub mod media;
pub mod types;

pub use controller::{SessionDeps, SessionHandle};
pub use errors::{SessionError, SessionResult};
pub use media::{MediaCapture, MediaError, MediaSource, NullMediaSource};
pub use types::{
    Message, MessageKind, Participant, SessionEvent, SessionSnapshot, SessionStatus, WireFrame,
    SYSTEM_SENDER,
};
