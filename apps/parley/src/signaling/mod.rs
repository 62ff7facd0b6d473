//! Peer registration and the single dispatch task.
//!
//! A [`Peer`] registers one identity on the relay, subscribes to the
//! per-kind channels addressed to it, announces itself, and then drives
//! one [`CallSession`](crate::call::CallSession) from a single task. All
//! inbound signaling messages, link callbacks and local commands are
//! funneled through that task, so the session is mutated from exactly one
//! place and never concurrently.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tracing::{debug, warn};

use relay_bus::{Relay, RelayError, RelayMessage};

use crate::call::{CallSession, CallState};
use crate::media::{LinkEvent, LinkFactory, LocalMedia, MediaError, RemoteTrack};
use crate::protocol::{ChannelKind, ProtocolError, REGISTRY_CHANNEL, SignalingMessage, channel};

pub mod ws;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("event stream already taken")]
    EventsTaken,
    #[error("peer dispatcher stopped")]
    DispatcherGone,
}

/// Notifications surfaced to whoever drives this peer (CLI, UI, tests).
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IncomingCall { from: String },
    StateChanged(CallState),
    RemoteTrack(RemoteTrack),
    /// The partner hung up (the `End` extension, never sent by legacy
    /// peers).
    CallEnded { by: String },
}

enum Command {
    StartCall { to: String },
    HangUp,
}

pub struct Peer {
    identity: String,
    commands: mpsc::UnboundedSender<Command>,
    events: AsyncMutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl Peer {
    /// One-time setup for this peer's session: subscribes the per-kind
    /// channels scoped to `identity`, publishes the registration
    /// announcement, and spawns the dispatch task. The relay connection
    /// itself must already be open; a transport failure there surfaces
    /// from the relay's constructor and is not retried.
    ///
    /// Identity uniqueness is by convention only. The protocol has no
    /// enforcement: two peers registering the same identity will steal
    /// each other's messages.
    pub async fn register(
        identity: &str,
        relay: Arc<dyn Relay>,
        links: Arc<dyn LinkFactory>,
        media: Arc<LocalMedia>,
    ) -> Result<Arc<Peer>, SignalError> {
        let subs = Subscriptions {
            call: relay.subscribe(&channel(identity, ChannelKind::Call)),
            offer: relay.subscribe(&channel(identity, ChannelKind::Offer)),
            answer: relay.subscribe(&channel(identity, ChannelKind::Answer)),
            candidate: relay.subscribe(&channel(identity, ChannelKind::Candidate)),
            end: relay.subscribe(&channel(identity, ChannelKind::End)),
        };
        // Bare identity string, no envelope: the relay only needs to know
        // the address exists.
        relay.publish(REGISTRY_CHANNEL, Bytes::from(identity.to_string()))?;
        debug!(target = "parley::signaling", identity, "registered");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let session = CallSession::new(identity, relay, links, media, events_tx, link_tx);
        tokio::spawn(dispatch_loop(session, commands_rx, link_rx, subs));

        Ok(Arc::new(Peer {
            identity: identity.to_string(),
            commands: commands_tx,
            events: AsyncMutex::new(Some(events_rx)),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Takes the event stream. Can only be taken once.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, SignalError> {
        let mut guard = self.events.lock().await;
        guard.take().ok_or(SignalError::EventsTaken)
    }

    /// Invites `remote` to a call. Fire-and-forget: no acknowledgement,
    /// no timeout, and no error if the identity is unknown.
    pub fn start_call(&self, remote: &str) -> Result<(), SignalError> {
        self.commands
            .send(Command::StartCall {
                to: remote.to_string(),
            })
            .map_err(|_| SignalError::DispatcherGone)
    }

    pub fn hang_up(&self) -> Result<(), SignalError> {
        self.commands
            .send(Command::HangUp)
            .map_err(|_| SignalError::DispatcherGone)
    }
}

struct Subscriptions {
    call: broadcast::Receiver<RelayMessage>,
    offer: broadcast::Receiver<RelayMessage>,
    answer: broadcast::Receiver<RelayMessage>,
    candidate: broadcast::Receiver<RelayMessage>,
    end: broadcast::Receiver<RelayMessage>,
}

async fn dispatch_loop(
    mut session: CallSession,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    mut subs: Subscriptions,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::StartCall { to }) => {
                        if let Err(err) = session.start_call(&to).await {
                            warn!(target = "parley::signaling", error = %err, "start call failed");
                        }
                    }
                    Some(Command::HangUp) => session.hang_up().await,
                    // Every handle is gone; the peer is done.
                    None => break,
                }
            }
            event = link_events.recv() => {
                if let Some(event) = event {
                    session.handle_link_event(event).await;
                }
            }
            delivery = subs.call.recv() => {
                if !deliver(&mut session, ChannelKind::Call, delivery).await { break; }
            }
            delivery = subs.offer.recv() => {
                if !deliver(&mut session, ChannelKind::Offer, delivery).await { break; }
            }
            delivery = subs.answer.recv() => {
                if !deliver(&mut session, ChannelKind::Answer, delivery).await { break; }
            }
            delivery = subs.candidate.recv() => {
                if !deliver(&mut session, ChannelKind::Candidate, delivery).await { break; }
            }
            delivery = subs.end.recv() => {
                if !deliver(&mut session, ChannelKind::End, delivery).await { break; }
            }
        }
    }
    debug!(target = "parley::signaling", "dispatch loop stopped");
}

/// Decodes and dispatches one delivery. Returns `false` when the
/// subscription is gone and the loop should stop.
async fn deliver(
    session: &mut CallSession,
    kind: ChannelKind,
    delivery: Result<RelayMessage, broadcast::error::RecvError>,
) -> bool {
    match delivery {
        Ok(wire) => {
            match SignalingMessage::decode(kind, &wire.payload) {
                Ok(message) => session.handle_message(message).await,
                Err(err) => {
                    warn!(
                        target = "parley::signaling",
                        channel = %wire.channel,
                        error = %err,
                        "rejecting malformed payload"
                    );
                }
            }
            true
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(
                target = "parley::signaling",
                kind = %kind,
                skipped,
                "subscription lagged; messages lost"
            );
            true
        }
        Err(broadcast::error::RecvError::Closed) => {
            debug!(target = "parley::signaling", kind = %kind, "subscription closed");
            false
        }
    }
}
