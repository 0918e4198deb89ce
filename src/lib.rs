pub mod config;
pub mod doc;
pub mod rendezvous;
pub mod ui;

pub use config::Config;
pub use doc::{DocUpdate, DocumentModel, UpdateLog, UpdateOrigin};
pub use rendezvous::{
    PeerEntry, PeerState, PresenceMessage, SessionConfig, SessionManager, SessionState,
    SignalingMessage,
};
pub use ui::{LogStatus, StatusSink};
