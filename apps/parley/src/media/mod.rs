//! Local media and the peer-connection capability surface.
//!
//! The negotiation logic never touches the `webrtc` crate directly; it
//! speaks to a [`PeerLink`] created by a [`LinkFactory`]. One link exists
//! per call attempt and is exclusively owned by it. The production
//! binding lives in [`rtc`]; [`mock`] is a scripted link for tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{CandidateInit, SessionDescription};

pub mod capture;
pub mod mock;
pub mod rtc;

pub use capture::{CaptureBackend, LocalMedia, SyntheticCapture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured local track. Descriptor only: sample delivery is the
/// capture backend's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub id: String,
}

/// The process-wide local stream, acquired once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

/// A remote track surfaced by the peer connection once media flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    pub stream_id: String,
}

/// Connectivity state of one link, as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a link, delivered on the receiver
/// returned by [`LinkFactory::open_link`].
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally discovered connectivity candidate, ready to relay.
    LocalCandidate(CandidateInit),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("local media was already acquired")]
    AlreadyAcquired,
    #[error("negotiation engine error: {0}")]
    Engine(String),
}

/// Capability surface of one peer connection. Descriptions are plain wire
/// types; the binding converts to whatever its engine needs.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn attach_tracks(&self, stream: &LocalStream) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    /// Applies a remote candidate. Calling this before the remote
    /// description has been applied is a hard error; callers must buffer.
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Opens a fresh link for one call attempt, together with its event
    /// stream. The link is exclusively owned by the attempt.
    async fn open_link(
        &self,
    ) -> Result<(std::sync::Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError>;
}
