//! Scripted peer link for tests: deterministic SDP, recorded applies,
//! optional forced failures. Lets the negotiation logic run end to end
//! without touching a real peer-connection engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::protocol::{CandidateInit, SdpKind, SessionDescription};

use super::{LinkEvent, LinkFactory, LinkState, LocalStream, LocalTrack, MediaError, PeerLink, RemoteTrack};

#[derive(Debug, Default)]
struct LinkRecord {
    attached: Vec<LocalTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<CandidateInit>,
}

pub struct MockPeerLink {
    label: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    fail_descriptions: Arc<AtomicBool>,
    closed: AtomicBool,
    record: Mutex<LinkRecord>,
}

impl MockPeerLink {
    /// Pushes a locally "discovered" candidate into the link's event
    /// stream, as the engine would.
    pub fn discover_candidate(&self, candidate: CandidateInit) {
        let _ = self.events.send(LinkEvent::LocalCandidate(candidate));
    }

    pub fn report_state(&self, state: LinkState) {
        let _ = self.events.send(LinkEvent::StateChanged(state));
    }

    pub fn surface_remote_track(&self, track: RemoteTrack) {
        let _ = self.events.send(LinkEvent::RemoteTrack(track));
    }

    pub fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.record.lock().attached.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.record.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.record.lock().remote_description.clone()
    }

    pub fn applied_candidates(&self) -> Vec<CandidateInit> {
        self.record.lock().applied_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn attach_tracks(&self, stream: &LocalStream) -> Result<(), MediaError> {
        self.record.lock().attached.extend(stream.tracks.iter().cloned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        if self.fail_descriptions.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("scripted offer failure".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 mock-offer from {}", self.label),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if self.fail_descriptions.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("scripted answer failure".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 mock-answer from {}", self.label),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.record.lock().local_description = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.record.lock().remote_description = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        let mut record = self.record.lock();
        if record.remote_description.is_none() {
            return Err(MediaError::Engine(
                "candidate applied before remote description".into(),
            ));
        }
        record.applied_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`MockPeerLink`]s and keeps a handle to every link it ever
/// opened so tests can inspect them afterwards.
#[derive(Default)]
pub struct MockLinkFactory {
    label: String,
    counter: AtomicU64,
    fail_descriptions: Arc<AtomicBool>,
    links: Mutex<Vec<Arc<MockPeerLink>>>,
}

impl MockLinkFactory {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    /// When set, every later `create_offer`/`create_answer` fails.
    pub fn fail_descriptions(&self, fail: bool) {
        self.fail_descriptions.store(fail, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<Arc<MockPeerLink>> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Option<Arc<MockPeerLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), MediaError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(MockPeerLink {
            label: format!("{}#{n}", self.label),
            events,
            fail_descriptions: Arc::clone(&self.fail_descriptions),
            closed: AtomicBool::new(false),
            record: Mutex::new(LinkRecord::default()),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok((link, events_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn candidate_before_remote_description_is_refused() {
        let factory = MockLinkFactory::new("test");
        let (link, _events) = factory.open_link().await.expect("open");
        let candidate = CandidateInit {
            sdp_mline_index: 0,
            candidate: "candidate:x".into(),
        };
        assert!(link.add_remote_candidate(candidate.clone()).await.is_err());

        link.set_remote_description(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        })
        .await
        .expect("remote description");
        link.add_remote_candidate(candidate).await.expect("applies now");
        assert_eq!(factory.last_link().expect("link").applied_candidates().len(), 1);
    }
}
