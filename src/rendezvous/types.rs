//! Wire types and constants for the rendezvous protocol

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag prefix for the presence topic of a document
pub const PRESENCE_TOPIC_PREFIX: &str = "doc-";

/// Heartbeat interval between presence announcements
pub const PRESENCE_INTERVAL_MS: u64 = 20_000;

/// Presence events older than this are discarded
pub const MAX_PRESENCE_AGE_MS: u64 = 30_000;

/// Negotiation must reach Connected within this window
pub const CONNECTION_TIMEOUT_MS: u64 = 15_000;

/// Relay subscriptions look back this far on creation
pub const SUBSCRIPTION_LOOKBACK_SECS: u64 = 120;

/// Current time as epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate an ephemeral session identifier (distinguishes tabs/instances
/// of the same identity)
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..30)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap())
        .collect()
}

/// First 8 chars of a pubkey, for log lines
pub fn short_key(pubkey: &str) -> &str {
    &pubkey[..8.min(pubkey.len())]
}

/// Presence announcement published on the document topic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PresenceMessage {
    Join {
        #[serde(rename = "documentId")]
        document_id: String,
        pubkey: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: u64,
    },
    Leave {
        #[serde(rename = "documentId")]
        document_id: String,
        pubkey: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: u64,
    },
}

impl PresenceMessage {
    pub fn join(document_id: &str, pubkey: &str, session_id: &str) -> Self {
        PresenceMessage::Join {
            document_id: document_id.to_string(),
            pubkey: pubkey.to_string(),
            session_id: session_id.to_string(),
            timestamp: now_ms(),
        }
    }

    pub fn leave(document_id: &str, pubkey: &str, session_id: &str) -> Self {
        PresenceMessage::Leave {
            document_id: document_id.to_string(),
            pubkey: pubkey.to_string(),
            session_id: session_id.to_string(),
            timestamp: now_ms(),
        }
    }

    pub fn msg_type(&self) -> &str {
        match self {
            PresenceMessage::Join { .. } => "join",
            PresenceMessage::Leave { .. } => "leave",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            PresenceMessage::Join { document_id, .. } => document_id,
            PresenceMessage::Leave { document_id, .. } => document_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            PresenceMessage::Join { timestamp, .. } => *timestamp,
            PresenceMessage::Leave { timestamp, .. } => *timestamp,
        }
    }
}

/// Encrypted point-to-point signaling payload (after NIP-04 decryption)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer {
        #[serde(rename = "documentId")]
        document_id: String,
        payload: serde_json::Value,
    },
    Answer {
        #[serde(rename = "documentId")]
        document_id: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        #[serde(rename = "documentId")]
        document_id: String,
        payload: serde_json::Value,
    },
}

impl SignalingMessage {
    pub fn msg_type(&self) -> &str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            SignalingMessage::Offer { document_id, .. } => document_id,
            SignalingMessage::Answer { document_id, .. } => document_id,
            SignalingMessage::IceCandidate { document_id, .. } => document_id,
        }
    }
}

/// Negotiation state of one peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Offering,
    AwaitingOffer,
    Negotiating,
    Connected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Discovered => write!(f, "discovered"),
            PeerState::Offering => write!(f, "offering"),
            PeerState::AwaitingOffer => write!(f, "awaiting-offer"),
            PeerState::Negotiating => write!(f, "negotiating"),
            PeerState::Connected => write!(f, "connected"),
        }
    }
}

/// Configuration for a document session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Nostr relays used for presence and signaling
    pub relays: Vec<String>,
    /// STUN servers for NAT traversal
    pub stun_servers: Vec<String>,
    /// Presence heartbeat interval in milliseconds
    pub presence_interval_ms: u64,
    /// Presence messages older than this are discarded
    pub max_presence_age_ms: u64,
    /// Negotiation timeout in milliseconds
    pub connection_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            presence_interval_ms: PRESENCE_INTERVAL_MS,
            max_presence_age_ms: MAX_PRESENCE_AGE_MS,
            connection_timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }
}
