//! Per-call-attempt state, transitioned by a single dispatcher.
//!
//! The role assignment is the deployed protocol's own and is preserved
//! exactly: the peer that RECEIVES the call invitation builds and sends
//! the SDP offer, and the peer that ORIGINATED the invitation applies it
//! and answers. Both sides agree, so it is internally consistent; do not
//! "fix" it to the conventional direction or existing peers stop
//! understanding us.
//!
//! All mutation goes through [`CallSession::start_call`],
//! [`CallSession::hang_up`], [`CallSession::handle_message`] and
//! [`CallSession::handle_link_event`], which the owning dispatch task
//! calls one at a time.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use relay_bus::Relay;

use crate::media::{LinkEvent, LinkFactory, LinkState, LocalMedia, PeerLink};
use crate::protocol::{CandidateInit, SessionDescription, SignalingMessage};
use crate::signaling::{PeerEvent, SignalError};

pub mod pending;

use pending::PendingCandidateSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Registered,
    CallSent,
    InvitationReceived,
    OfferExchanged,
    AnswerExchanged,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Registered => "registered",
            CallState::CallSent => "call-sent",
            CallState::InvitationReceived => "invitation-received",
            CallState::OfferExchanged => "offer-exchanged",
            CallState::AnswerExchanged => "answer-exchanged",
            CallState::Connected => "connected",
            CallState::Failed => "failed",
            CallState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct CallSession {
    local_id: String,
    relay: Arc<dyn Relay>,
    links: Arc<dyn LinkFactory>,
    media: Arc<LocalMedia>,
    events: mpsc::UnboundedSender<PeerEvent>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    state: CallState,
    partner: Option<String>,
    link: Option<Arc<dyn PeerLink>>,
    remote_description_applied: bool,
    pending: PendingCandidateSet,
}

impl CallSession {
    pub fn new(
        local_id: &str,
        relay: Arc<dyn Relay>,
        links: Arc<dyn LinkFactory>,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            relay,
            links,
            media,
            events,
            link_events,
            state: CallState::Registered,
            partner: None,
            link: None,
            remote_description_applied: false,
            pending: PendingCandidateSet::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        debug!(
            target = "parley::call",
            from = %self.state,
            to = %next,
            "call state"
        );
        self.state = next;
        let _ = self.events.send(PeerEvent::StateChanged(next));
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, message: &SignalingMessage) -> Result<(), SignalError> {
        let payload: Bytes = message.encode()?;
        trace!(
            target = "parley::call",
            kind = %message.kind(),
            to = message.to_user(),
            "publish"
        );
        self.relay.publish(&message.channel(), payload)?;
        Ok(())
    }

    /// Resets per-attempt state for a new negotiation partner. A stale
    /// remote-description flag from a previous attempt would let a
    /// candidate bypass the buffer and hit a fresh link too early, so it
    /// is cleared here, before any message of the new attempt is handled.
    fn begin_attempt(&mut self, partner: &str) {
        self.partner = Some(partner.to_string());
        self.remote_description_applied = false;
        self.pending.retain_only(partner);
    }

    /// Publishes the call invitation. Fire-and-forget: there is no
    /// acknowledgement and no timeout. If nobody is registered under
    /// `remote`, the call silently never proceeds.
    pub async fn start_call(&mut self, remote: &str) -> Result<(), SignalError> {
        self.begin_attempt(remote);
        self.publish(&SignalingMessage::Call {
            to_user: remote.to_string(),
            from_user: self.local_id.clone(),
        })?;
        self.set_state(CallState::CallSent);
        Ok(())
    }

    /// Hang-up extension: tells the partner the call is over, then closes
    /// the local attempt. A legacy peer never receives this and is simply
    /// left hanging, exactly as the deployed protocol leaves it.
    pub async fn hang_up(&mut self) {
        let Some(partner) = self.partner.clone() else {
            return;
        };
        if let Err(err) = self.publish(&SignalingMessage::End {
            to_user: partner.clone(),
            from_user: self.local_id.clone(),
        }) {
            warn!(target = "parley::call", error = %err, "failed to publish hang-up");
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.pending.clear();
        self.remote_description_applied = false;
        self.set_state(CallState::Closed);
    }

    pub async fn handle_message(&mut self, message: SignalingMessage) {
        if message.to_user() != self.local_id {
            warn!(
                target = "parley::call",
                to = message.to_user(),
                kind = %message.kind(),
                "dropping message addressed to another identity"
            );
            return;
        }
        let result = match message {
            SignalingMessage::Call { from_user, .. } => self.on_call(from_user).await,
            SignalingMessage::Offer { from_user, sdp, .. } => self.on_offer(from_user, sdp).await,
            SignalingMessage::Answer { from_user, sdp, .. } => {
                self.on_answer(from_user, sdp).await
            }
            SignalingMessage::Candidate {
                from_user,
                candidate,
                ..
            } => self.on_candidate(from_user, candidate).await,
            SignalingMessage::End { from_user, .. } => {
                self.on_end(from_user).await;
                Ok(())
            }
        };
        // Negotiation failures are logged and the attempt is left in its
        // current state. No retry, no teardown message.
        if let Err(err) = result {
            warn!(target = "parley::call", error = %err, "negotiation step failed");
        }
    }

    /// Callee role. Despite being the invited side, this peer builds and
    /// sends the OFFER.
    async fn on_call(&mut self, from: String) -> Result<(), SignalError> {
        self.begin_attempt(&from);
        self.set_state(CallState::InvitationReceived);
        self.emit(PeerEvent::IncomingCall { from: from.clone() });

        let link = self.open_link().await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.publish(&SignalingMessage::Offer {
            to_user: from,
            from_user: self.local_id.clone(),
            sdp: offer,
        })?;
        self.set_state(CallState::OfferExchanged);
        Ok(())
    }

    /// Caller role, acting as answerer.
    async fn on_offer(
        &mut self,
        from: String,
        sdp: SessionDescription,
    ) -> Result<(), SignalError> {
        // Safe for the in-flight attempt too: the flag is false until the
        // description applies, and the partner's buffered candidates are
        // retained.
        self.begin_attempt(&from);
        let link = self.open_link().await?;
        link.set_remote_description(sdp).await?;
        self.remote_description_applied = true;
        self.set_state(CallState::OfferExchanged);
        self.flush_pending_candidates().await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.publish(&SignalingMessage::Answer {
            to_user: from,
            from_user: self.local_id.clone(),
            sdp: answer,
        })?;
        self.set_state(CallState::AnswerExchanged);
        Ok(())
    }

    /// Callee role: the answer completes SDP negotiation.
    async fn on_answer(
        &mut self,
        from: String,
        sdp: SessionDescription,
    ) -> Result<(), SignalError> {
        let Some(link) = self.link.clone() else {
            warn!(
                target = "parley::call",
                from = %from,
                "answer received without an active attempt"
            );
            return Ok(());
        };
        link.set_remote_description(sdp).await?;
        self.remote_description_applied = true;
        self.set_state(CallState::AnswerExchanged);
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        from: String,
        candidate: CandidateInit,
    ) -> Result<(), SignalError> {
        if !self.pending.first_delivery(&from, &candidate) {
            trace!(target = "parley::call", from = %from, "duplicate candidate delivery");
            return Ok(());
        }
        let ready = self.remote_description_applied
            && self.partner.as_deref() == Some(from.as_str());
        if let (true, Some(link)) = (ready, self.link.clone()) {
            link.add_remote_candidate(candidate).await?;
        } else {
            trace!(
                target = "parley::call",
                from = %from,
                "buffering candidate until remote description applies"
            );
            self.pending.queue(&from, candidate);
        }
        Ok(())
    }

    /// Applies everything buffered for the current partner, in arrival
    /// order. Runs right after the remote description is set.
    async fn flush_pending_candidates(&mut self) {
        let Some(partner) = self.partner.clone() else {
            return;
        };
        let queued = self.pending.drain(&partner);
        if queued.is_empty() {
            return;
        }
        let Some(link) = self.link.clone() else {
            return;
        };
        debug!(
            target = "parley::call",
            count = queued.len(),
            "flushing buffered candidates"
        );
        for candidate in queued {
            if let Err(err) = link.add_remote_candidate(candidate).await {
                warn!(target = "parley::call", error = %err, "buffered candidate rejected");
            }
        }
    }

    async fn on_end(&mut self, from: String) {
        if self.partner.as_deref() != Some(from.as_str()) {
            trace!(target = "parley::call", from = %from, "hang-up from a non-partner");
            return;
        }
        self.teardown().await;
        self.emit(PeerEvent::CallEnded { by: from });
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let Some(partner) = self.partner.clone() else {
                    trace!(
                        target = "parley::call",
                        "discovered candidate with no negotiation partner"
                    );
                    return;
                };
                // Relayed immediately, one message per discovery.
                if let Err(err) = self.publish(&SignalingMessage::Candidate {
                    to_user: partner,
                    from_user: self.local_id.clone(),
                    candidate,
                }) {
                    warn!(target = "parley::call", error = %err, "candidate publish failed");
                }
            }
            LinkEvent::RemoteTrack(track) => {
                self.emit(PeerEvent::RemoteTrack(track));
            }
            LinkEvent::StateChanged(state) => self.on_link_state(state),
        }
    }

    fn on_link_state(&mut self, state: LinkState) {
        match state {
            LinkState::Connected => {
                if matches!(
                    self.state,
                    CallState::OfferExchanged | CallState::AnswerExchanged
                ) {
                    self.set_state(CallState::Connected);
                }
            }
            LinkState::Failed => {
                if !matches!(self.state, CallState::Closed) {
                    self.set_state(CallState::Failed);
                }
            }
            // Reached after our own close(); nothing left to do.
            LinkState::Closed | LinkState::New => {}
        }
    }

    async fn open_link(&mut self) -> Result<Arc<dyn PeerLink>, SignalError> {
        if let Some(previous) = self.link.take() {
            previous.close().await;
        }
        let (link, mut link_rx) = self.links.open_link().await?;
        let forward = self.link_events.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                if forward.send(event).is_err() {
                    break;
                }
            }
        });

        // The local stream is attached to every link; it is acquired once
        // for the whole process. With no stream the attempt still
        // negotiates, just without local media.
        match self.media.stream() {
            Some(stream) => link.attach_tracks(&stream).await?,
            None => debug!(
                target = "parley::call",
                "no local media; negotiating without tracks"
            ),
        }
        self.link = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockLinkFactory;
    use crate::protocol::{self, ChannelKind, SdpKind};
    use relay_bus::LocalRelay;

    struct Fixture {
        session: CallSession,
        relay: Arc<LocalRelay>,
        links: Arc<MockLinkFactory>,
        _events_rx: mpsc::UnboundedReceiver<PeerEvent>,
        _link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn fixture(local_id: &str) -> Fixture {
        let relay = Arc::new(LocalRelay::new());
        let links = Arc::new(MockLinkFactory::new(local_id));
        let media = Arc::new(LocalMedia::new());
        media.acquire(&crate::media::SyntheticCapture).expect("media");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let session = CallSession::new(
            local_id,
            Arc::clone(&relay) as Arc<dyn Relay>,
            Arc::clone(&links) as Arc<dyn LinkFactory>,
            media,
            events_tx,
            link_tx,
        );
        Fixture {
            session,
            relay,
            links,
            _events_rx: events_rx,
            _link_rx: link_rx,
        }
    }

    #[tokio::test]
    async fn invited_peer_sends_the_offer() {
        let mut fx = fixture("bob");
        let mut offers = fx
            .relay
            .subscribe(&protocol::channel("alice", ChannelKind::Offer));

        fx.session
            .handle_message(SignalingMessage::Call {
                to_user: "bob".into(),
                from_user: "alice".into(),
            })
            .await;

        assert_eq!(fx.session.state(), CallState::OfferExchanged);
        let wire = offers.recv().await.expect("offer published");
        let msg = SignalingMessage::decode(ChannelKind::Offer, &wire.payload).expect("decode");
        assert_eq!(msg.to_user(), "alice");
        assert_eq!(msg.from_user(), "bob");

        let link = fx.links.last_link().expect("link opened");
        let local = link.local_description().expect("local description set");
        assert_eq!(local.kind, SdpKind::Offer);
        assert_eq!(link.attached_tracks().len(), 2);
    }

    #[tokio::test]
    async fn caller_answers_the_offer() {
        let mut fx = fixture("alice");
        fx.session.start_call("bob").await.expect("start call");
        assert_eq!(fx.session.state(), CallState::CallSent);

        let mut answers = fx
            .relay
            .subscribe(&protocol::channel("bob", ChannelKind::Answer));
        fx.session
            .handle_message(SignalingMessage::Offer {
                to_user: "alice".into(),
                from_user: "bob".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0 from bob".into(),
                },
            })
            .await;

        assert_eq!(fx.session.state(), CallState::AnswerExchanged);
        let wire = answers.recv().await.expect("answer published");
        let msg = SignalingMessage::decode(ChannelKind::Answer, &wire.payload).expect("decode");
        assert_eq!(msg.from_user(), "alice");

        let link = fx.links.last_link().expect("link");
        assert_eq!(
            link.remote_description().expect("remote applied").sdp,
            "v=0 from bob"
        );
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_then_flushed_in_order() {
        let mut fx = fixture("alice");
        fx.session.start_call("bob").await.expect("start call");

        for name in ["c1", "c2", "c3"] {
            fx.session
                .handle_message(SignalingMessage::Candidate {
                    to_user: "alice".into(),
                    from_user: "bob".into(),
                    candidate: CandidateInit {
                        sdp_mline_index: 0,
                        candidate: name.into(),
                    },
                })
                .await;
        }
        // No link exists yet; nothing can have been applied.
        assert!(fx.links.last_link().is_none());

        fx.session
            .handle_message(SignalingMessage::Offer {
                to_user: "alice".into(),
                from_user: "bob".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
            })
            .await;

        let link = fx.links.last_link().expect("link");
        let applied: Vec<String> = link
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["c1", "c2", "c3"]);

        // Re-delivery after the flush must not apply twice.
        fx.session
            .handle_message(SignalingMessage::Candidate {
                to_user: "alice".into(),
                from_user: "bob".into(),
                candidate: CandidateInit {
                    sdp_mline_index: 0,
                    candidate: "c2".into(),
                },
            })
            .await;
        assert_eq!(link.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn second_attempt_buffers_candidates_that_outrun_the_answer() {
        let mut fx = fixture("bob");

        // First call with alice runs to a fully applied answer.
        fx.session
            .handle_message(SignalingMessage::Call {
                to_user: "bob".into(),
                from_user: "alice".into(),
            })
            .await;
        fx.session
            .handle_message(SignalingMessage::Answer {
                to_user: "bob".into(),
                from_user: "alice".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0 from alice".into(),
                },
            })
            .await;
        assert_eq!(fx.session.state(), CallState::AnswerExchanged);

        // Carol calls next; her candidate outruns her answer. It must be
        // buffered on the fresh attempt, not applied to a link whose
        // remote description is still unset, and never lost.
        fx.session
            .handle_message(SignalingMessage::Call {
                to_user: "bob".into(),
                from_user: "carol".into(),
            })
            .await;
        fx.session
            .handle_message(SignalingMessage::Candidate {
                to_user: "bob".into(),
                from_user: "carol".into(),
                candidate: CandidateInit {
                    sdp_mline_index: 0,
                    candidate: "c-early".into(),
                },
            })
            .await;
        let carol_link = fx.links.last_link().expect("carol link");
        assert!(carol_link.applied_candidates().is_empty());

        fx.session
            .handle_message(SignalingMessage::Answer {
                to_user: "bob".into(),
                from_user: "carol".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0 from carol".into(),
                },
            })
            .await;
        let applied: Vec<String> = carol_link
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["c-early"]);
    }

    #[tokio::test]
    async fn replaced_attempt_drops_the_previous_partners_buffer() {
        let mut fx = fixture("alice");
        fx.session.start_call("bob").await.expect("start call");
        fx.session
            .handle_message(SignalingMessage::Candidate {
                to_user: "alice".into(),
                from_user: "bob".into(),
                candidate: CandidateInit {
                    sdp_mline_index: 0,
                    candidate: "bob-c1".into(),
                },
            })
            .await;

        // Alice abandons bob and calls carol instead; bob's buffered
        // candidate must not survive into the new attempt.
        fx.session.start_call("carol").await.expect("start call");
        fx.session
            .handle_message(SignalingMessage::Offer {
                to_user: "alice".into(),
                from_user: "carol".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0 from carol".into(),
                },
            })
            .await;
        let link = fx.links.last_link().expect("link");
        assert!(link.applied_candidates().is_empty());
        // Bob's candidate re-delivered now is a fresh delivery for a
        // non-partner: queued, never applied to carol's link.
        fx.session
            .handle_message(SignalingMessage::Candidate {
                to_user: "alice".into(),
                from_user: "bob".into(),
                candidate: CandidateInit {
                    sdp_mline_index: 0,
                    candidate: "bob-c1".into(),
                },
            })
            .await;
        assert!(link.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn end_closes_the_attempt() {
        let mut fx = fixture("bob");
        fx.session
            .handle_message(SignalingMessage::Call {
                to_user: "bob".into(),
                from_user: "alice".into(),
            })
            .await;
        let link = fx.links.last_link().expect("link");

        fx.session
            .handle_message(SignalingMessage::End {
                to_user: "bob".into(),
                from_user: "alice".into(),
            })
            .await;
        assert_eq!(fx.session.state(), CallState::Closed);
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn messages_for_other_identities_are_dropped() {
        let mut fx = fixture("bob");
        fx.session
            .handle_message(SignalingMessage::Call {
                to_user: "someone-else".into(),
                from_user: "alice".into(),
            })
            .await;
        assert_eq!(fx.session.state(), CallState::Registered);
        assert!(fx.links.last_link().is_none());
    }
}
