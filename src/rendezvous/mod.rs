//! Rendezvous and session lifecycle over public Nostr relays
//!
//! Participants announce themselves on a per-document presence topic
//! (kind 30078, `["d", documentId]`), negotiate WebRTC transports through
//! NIP-04 encrypted envelopes (kind 4), and exchange document updates on a
//! direct data channel once connected. Tie-breaking: for any pair, the
//! lexicographically smaller pubkey sends the offer.

mod channel;
mod manager;
mod peer;
mod relay;
mod signaling;
mod types;


pub use channel::{decode, encode_update, Frame, MSG_DOC_UPDATE};
pub use manager::{PeerEntry, SessionManager, SessionState};
pub use peer::{Peer, PeerEvent, DATA_CHANNEL_LABEL};
pub use types::{
    generate_session_id, now_ms, short_key, PeerState, PresenceMessage, SessionConfig,
    SignalingMessage, CONNECTION_TIMEOUT_MS, MAX_PRESENCE_AGE_MS, PRESENCE_INTERVAL_MS,
    SUBSCRIPTION_LOOKBACK_SECS,
};
