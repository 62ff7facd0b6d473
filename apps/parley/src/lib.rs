//! Peer-to-peer call negotiation over an address-based message relay.
//!
//! Two registered peers establish a direct audio/video path by relaying
//! session descriptions and connectivity candidates through per-identity
//! channels. The wire protocol reproduces the deployed browser client
//! exactly, quirks included; see `call` for the (deliberately preserved)
//! reversed offer/answer roles and `protocol` for the field names.

pub mod call;
pub mod config;
pub mod media;
pub mod protocol;
pub mod signaling;

pub use config::Config;
pub use signaling::{Peer, PeerEvent, SignalError};
