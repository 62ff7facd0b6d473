//! Wire shapes for call negotiation.
//!
//! Messages are routed by channel address, not by an embedded type tag: a
//! peer subscribes to `user/{identity}/{kind}` for each message kind and
//! the relay delivers whatever was published there. The JSON field names
//! (`toUser`, `fromUser`, `offer`, `answer`, `candidate`, and the
//! candidate's `lable`/`id` pair) are fixed by the deployed browser
//! client; renaming any of them breaks interop with existing peers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Well-known channel a peer announces its identity on after connecting.
/// The payload is the bare identity string, no JSON envelope.
pub const REGISTRY_CHANNEL: &str = "registry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Call,
    Offer,
    Answer,
    Candidate,
    /// Hang-up extension. Not part of the legacy protocol: a legacy peer
    /// never publishes it and never subscribes to it, so it is invisible
    /// to old clients.
    End,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Call,
        ChannelKind::Offer,
        ChannelKind::Answer,
        ChannelKind::Candidate,
        ChannelKind::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Call => "call",
            ChannelKind::Offer => "offer",
            ChannelKind::Answer => "answer",
            ChannelKind::Candidate => "candidate",
            ChannelKind::End => "end",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(identity, messageKind)` channel address.
pub fn channel(identity: &str, kind: ChannelKind) -> String {
    format!("user/{identity}/{kind}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged on the wire. Mirrors the browser's
/// `RTCSessionDescription` JSON: `{ "type": "offer"|"answer", "sdp": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One discovered connectivity candidate. The wire names are the deployed
/// client's own: `lable` is the media line index (sic), `id` is the
/// candidate string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    #[serde(rename = "lable")]
    pub sdp_mline_index: u16,
    #[serde(rename = "id")]
    pub candidate: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallEnvelope {
    to_user: String,
    from_user: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferEnvelope {
    to_user: String,
    from_user: String,
    offer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerEnvelope {
    to_user: String,
    from_user: String,
    answer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateEnvelope {
    to_user: String,
    from_user: String,
    candidate: CandidateInit,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEnvelope {
    to_user: String,
    from_user: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: ChannelKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: ChannelKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A decoded signaling message. Every variant carries both identities so
/// the receiver can address its reply without a side channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Call {
        to_user: String,
        from_user: String,
    },
    Offer {
        to_user: String,
        from_user: String,
        sdp: SessionDescription,
    },
    Answer {
        to_user: String,
        from_user: String,
        sdp: SessionDescription,
    },
    Candidate {
        to_user: String,
        from_user: String,
        candidate: CandidateInit,
    },
    End {
        to_user: String,
        from_user: String,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> ChannelKind {
        match self {
            SignalingMessage::Call { .. } => ChannelKind::Call,
            SignalingMessage::Offer { .. } => ChannelKind::Offer,
            SignalingMessage::Answer { .. } => ChannelKind::Answer,
            SignalingMessage::Candidate { .. } => ChannelKind::Candidate,
            SignalingMessage::End { .. } => ChannelKind::End,
        }
    }

    pub fn to_user(&self) -> &str {
        match self {
            SignalingMessage::Call { to_user, .. }
            | SignalingMessage::Offer { to_user, .. }
            | SignalingMessage::Answer { to_user, .. }
            | SignalingMessage::Candidate { to_user, .. }
            | SignalingMessage::End { to_user, .. } => to_user,
        }
    }

    pub fn from_user(&self) -> &str {
        match self {
            SignalingMessage::Call { from_user, .. }
            | SignalingMessage::Offer { from_user, .. }
            | SignalingMessage::Answer { from_user, .. }
            | SignalingMessage::Candidate { from_user, .. }
            | SignalingMessage::End { from_user, .. } => from_user,
        }
    }

    /// The channel this message is delivered on: the recipient's address
    /// for this message kind.
    pub fn channel(&self) -> String {
        channel(self.to_user(), self.kind())
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let encode = |res: serde_json::Result<Vec<u8>>| {
            res.map(Bytes::from).map_err(|source| ProtocolError::Encode {
                kind: self.kind(),
                source,
            })
        };
        match self {
            SignalingMessage::Call { to_user, from_user } => {
                encode(serde_json::to_vec(&CallEnvelope {
                    to_user: to_user.clone(),
                    from_user: from_user.clone(),
                }))
            }
            SignalingMessage::Offer {
                to_user,
                from_user,
                sdp,
            } => encode(serde_json::to_vec(&OfferEnvelope {
                to_user: to_user.clone(),
                from_user: from_user.clone(),
                offer: sdp.clone(),
            })),
            SignalingMessage::Answer {
                to_user,
                from_user,
                sdp,
            } => encode(serde_json::to_vec(&AnswerEnvelope {
                to_user: to_user.clone(),
                from_user: from_user.clone(),
                answer: sdp.clone(),
            })),
            SignalingMessage::Candidate {
                to_user,
                from_user,
                candidate,
            } => encode(serde_json::to_vec(&CandidateEnvelope {
                to_user: to_user.clone(),
                from_user: from_user.clone(),
                candidate: candidate.clone(),
            })),
            SignalingMessage::End { to_user, from_user } => {
                encode(serde_json::to_vec(&EndEnvelope {
                    to_user: to_user.clone(),
                    from_user: from_user.clone(),
                }))
            }
        }
    }

    /// Decodes a payload delivered on a channel of the given kind. The
    /// kind comes from the subscription, not from the payload; malformed
    /// payloads are rejected rather than trusted.
    pub fn decode(kind: ChannelKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = |source| ProtocolError::Malformed { kind, source };
        match kind {
            ChannelKind::Call => {
                let env: CallEnvelope = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(SignalingMessage::Call {
                    to_user: env.to_user,
                    from_user: env.from_user,
                })
            }
            ChannelKind::Offer => {
                let env: OfferEnvelope = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(SignalingMessage::Offer {
                    to_user: env.to_user,
                    from_user: env.from_user,
                    sdp: env.offer,
                })
            }
            ChannelKind::Answer => {
                let env: AnswerEnvelope = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(SignalingMessage::Answer {
                    to_user: env.to_user,
                    from_user: env.from_user,
                    sdp: env.answer,
                })
            }
            ChannelKind::Candidate => {
                let env: CandidateEnvelope =
                    serde_json::from_slice(payload).map_err(malformed)?;
                Ok(SignalingMessage::Candidate {
                    to_user: env.to_user,
                    from_user: env.from_user,
                    candidate: env.candidate,
                })
            }
            ChannelKind::End => {
                let env: EndEnvelope = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(SignalingMessage::End {
                    to_user: env.to_user,
                    from_user: env.from_user,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string(),
        }
    }

    #[test]
    fn channel_addresses() {
        assert_eq!(channel("alice", ChannelKind::Call), "user/alice/call");
        assert_eq!(
            channel("bob", ChannelKind::Candidate),
            "user/bob/candidate"
        );
    }

    #[test]
    fn round_trip_every_kind() {
        let messages = vec![
            SignalingMessage::Call {
                to_user: "bob".into(),
                from_user: "alice".into(),
            },
            SignalingMessage::Offer {
                to_user: "alice".into(),
                from_user: "bob".into(),
                sdp: offer(),
            },
            SignalingMessage::Answer {
                to_user: "bob".into(),
                from_user: "alice".into(),
                sdp: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0\r\n".into(),
                },
            },
            SignalingMessage::Candidate {
                to_user: "alice".into(),
                from_user: "bob".into(),
                candidate: CandidateInit {
                    sdp_mline_index: 0,
                    candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                },
            },
            SignalingMessage::End {
                to_user: "bob".into(),
                from_user: "alice".into(),
            },
        ];
        for msg in messages {
            let bytes = msg.encode().expect("encode");
            let back = SignalingMessage::decode(msg.kind(), &bytes).expect("decode");
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn wire_shape_matches_deployed_client() {
        let msg = SignalingMessage::Candidate {
            to_user: "alice".into(),
            from_user: "bob".into(),
            candidate: CandidateInit {
                sdp_mline_index: 1,
                candidate: "candidate:foo".into(),
            },
        };
        let value: Value =
            serde_json::from_slice(&msg.encode().expect("encode")).expect("json");
        assert_eq!(value["toUser"], "alice");
        assert_eq!(value["fromUser"], "bob");
        assert_eq!(value["candidate"]["lable"], 1);
        assert_eq!(value["candidate"]["id"], "candidate:foo");

        let msg = SignalingMessage::Offer {
            to_user: "alice".into(),
            from_user: "bob".into(),
            sdp: offer(),
        };
        let value: Value =
            serde_json::from_slice(&msg.encode().expect("encode")).expect("json");
        assert_eq!(value["offer"]["type"], "offer");
        assert!(value["offer"]["sdp"].is_string());
    }

    #[test]
    fn decode_tolerates_extra_fields() {
        // The browser client sends `type: "candidate"` inside the
        // candidate object; it must be ignored, not rejected.
        let payload = br#"{
            "toUser": "alice",
            "fromUser": "bob",
            "candidate": {"type": "candidate", "lable": 0, "id": "candidate:x"}
        }"#;
        let msg = SignalingMessage::decode(ChannelKind::Candidate, payload).expect("decode");
        assert_eq!(msg.from_user(), "bob");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let err = SignalingMessage::decode(ChannelKind::Offer, b"not json");
        assert!(matches!(
            err,
            Err(ProtocolError::Malformed {
                kind: ChannelKind::Offer,
                ..
            })
        ));
        // Missing fromUser.
        let err = SignalingMessage::decode(ChannelKind::Call, br#"{"toUser": "bob"}"#);
        assert!(err.is_err());
        // Offer payload delivered on the answer channel.
        let offer_bytes = SignalingMessage::Offer {
            to_user: "a".into(),
            from_user: "b".into(),
            sdp: offer(),
        }
        .encode()
        .expect("encode");
        assert!(SignalingMessage::decode(ChannelKind::Answer, &offer_bytes).is_err());
    }
}
