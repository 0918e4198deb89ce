//! Seam to the UI collaborator
//!
//! The session layer only reports status changes; rendering is someone
//! else's problem.

use tracing::info;

/// Receives connection status updates and transient notifications
pub trait StatusSink: Send + Sync + 'static {
    /// A negotiation started; an indicator may show "connecting"
    fn connecting(&self);

    /// The number of connected peers changed
    fn connection_count(&self, connected_peers: usize);

    /// Transient, toast-style notification
    fn toast(&self, message: &str);
}

/// Default sink that reports over `tracing`
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn connecting(&self) {
        info!("Connecting to a peer...");
    }

    fn connection_count(&self, connected_peers: usize) {
        // Participant count includes the local session
        info!("Participants: {}", connected_peers + 1);
    }

    fn toast(&self, message: &str) {
        info!("{}", message);
    }
}
