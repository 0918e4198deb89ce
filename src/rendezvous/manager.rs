//! Session manager: discovery, per-peer negotiation, document relay, teardown
//!
//! One event loop owns all peer-record mutation; per-peer endpoint setup runs
//! on spawned tasks that report back over the internal event channel, so a
//! slow negotiation with one peer never stalls the others.

use anyhow::Result;
use nostr::{Keys, Kind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::channel::{self, Frame};
use super::peer::{Peer, PeerEvent};
use super::relay;
use super::signaling;
use super::types::{
    now_ms, short_key, PeerState, PresenceMessage, SessionConfig, SignalingMessage,
};
use crate::doc::{DocUpdate, DocumentModel, UpdateOrigin};
use crate::ui::StatusSink;

/// Glare avoidance: for any pair of identities, only the one whose pubkey is
/// lexicographically smaller initiates the connection
pub(crate) fn initiates(mine: &str, theirs: &str) -> bool {
    mine < theirs
}

/// One record per remote identity currently known
pub struct PeerEntry {
    pub pubkey: String,
    pub state: PeerState,
    pub connected: bool,
    /// Full-state handoff already sent on this peer's channel
    pub synced: bool,
    pub created_at: Instant,
    pub peer: Option<Peer>,
    pub timeout: Option<JoinHandle<()>>,
}

/// Shared session state, readable from outside the event loop
pub struct SessionState {
    pub peers: Mutex<HashMap<String, PeerEntry>>,
    pub connected_count: AtomicUsize,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            connected_count: AtomicUsize::new(0),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one document session: presence heartbeat, peer discovery,
/// encrypted signaling, transport negotiation, and the document relay
/// protocol on open channels
pub struct SessionManager {
    config: SessionConfig,
    keys: Keys,
    my_pubkey: String,
    document_id: String,
    session_id: String,
    doc: Arc<dyn DocumentModel>,
    status: Arc<dyn StatusSink>,
    state: Arc<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Signed events fanned out to every relay task
    relay_tx: broadcast::Sender<nostr::Event>,
    /// Relay tasks close on this, flipped only after the leave announcement
    /// so the sockets are still up when the leave event is written
    relay_shutdown: watch::Sender<bool>,
    peer_events: mpsc::Sender<PeerEvent>,
    peer_events_rx: Option<mpsc::Receiver<PeerEvent>>,
    doc_updates: Option<mpsc::Receiver<DocUpdate>>,
}

impl SessionManager {
    /// Create a session for one document; `doc_updates` carries the document
    /// model's change notifications
    pub fn new(
        keys: Keys,
        document_id: String,
        config: SessionConfig,
        doc: Arc<dyn DocumentModel>,
        status: Arc<dyn StatusSink>,
        doc_updates: mpsc::Receiver<DocUpdate>,
    ) -> Self {
        let my_pubkey = keys.public_key().to_hex();
        let session_id = super::types::generate_session_id();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (relay_shutdown, _) = watch::channel(false);
        let (relay_tx, _) = broadcast::channel(64);
        let (peer_events, peer_events_rx) = mpsc::channel(256);

        Self {
            config,
            keys,
            my_pubkey,
            document_id,
            session_id,
            doc,
            status,
            state: Arc::new(SessionState::new()),
            shutdown: Arc::new(shutdown),
            shutdown_rx,
            relay_tx,
            relay_shutdown,
            peer_events,
            peer_events_rx: Some(peer_events_rx),
            doc_updates: Some(doc_updates),
        }
    }

    pub fn my_pubkey(&self) -> &str {
        &self.my_pubkey
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Shared state for external observation
    pub fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Handle usable after the manager moves into its task
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub(crate) fn relay_events(&self) -> broadcast::Receiver<nostr::Event> {
        self.relay_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn relay_shutdown_watch(&self) -> watch::Receiver<bool> {
        self.relay_shutdown.subscribe()
    }

    /// Run the session until shutdown is signalled
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting session for document {} as {} (session {})",
            self.document_id,
            short_key(&self.my_pubkey),
            short_key(&self.session_id),
        );

        let (event_tx, mut event_rx) = mpsc::channel::<(String, nostr::Event)>(256);

        let mut peer_rx = self
            .peer_events_rx
            .take()
            .expect("peer event receiver already taken");
        let mut doc_rx = self
            .doc_updates
            .take()
            .expect("document update receiver already taken");

        for relay_url in &self.config.relays {
            let url = relay_url.clone();
            let document_id = self.document_id.clone();
            let my_pubkey = self.my_pubkey.clone();
            let event_tx = event_tx.clone();
            let shutdown_rx = self.relay_shutdown.subscribe();
            let write_rx = self.relay_tx.subscribe();

            tokio::spawn(async move {
                if let Err(e) = relay::relay_task(
                    url.clone(),
                    document_id,
                    my_pubkey,
                    event_tx,
                    shutdown_rx,
                    write_rx,
                )
                .await
                {
                    error!("Relay {} error: {}", url, e);
                }
            });
        }

        // First tick fires immediately, announcing presence at startup
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.presence_interval_ms));

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Session shutting down");
                        // Leave goes out while the relay sockets are still
                        // open; only then are the relay tasks told to close
                        self.announce_leave().await;
                        let _ = self.relay_shutdown.send(true);
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.announce_presence().await;
                }
                Some((relay, event)) = event_rx.recv() => {
                    self.handle_relay_event(&relay, event).await;
                }
                Some(peer_event) = peer_rx.recv() => {
                    self.handle_peer_event(peer_event).await;
                }
                Some(update) = doc_rx.recv() => {
                    self.handle_doc_update(update).await;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Publish a `join` heartbeat; failures are logged, the next cycle
    /// retries naturally
    pub(crate) async fn announce_presence(&self) {
        let msg = PresenceMessage::join(&self.document_id, &self.my_pubkey, &self.session_id);
        match signaling::presence_event(&self.keys, &self.document_id, &msg).await {
            Ok(event) => {
                if self.relay_tx.send(event).is_err() {
                    warn!("No relay connections, presence not announced");
                } else {
                    debug!("Presence announced");
                }
            }
            Err(e) => warn!("Failed to build presence event: {}", e),
        }
    }

    /// Best-effort `leave` on the way out; fire-and-forget
    async fn announce_leave(&self) {
        let msg = PresenceMessage::leave(&self.document_id, &self.my_pubkey, &self.session_id);
        if let Ok(event) = signaling::presence_event(&self.keys, &self.document_id, &msg).await {
            let _ = self.relay_tx.send(event);
            // Give the relay writers a moment to flush before they are told
            // to close their sockets
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn handle_relay_event(&self, relay: &str, event: nostr::Event) {
        // Self-echo: relays reflect our own presence right back
        if event.pubkey.to_hex() == self.my_pubkey {
            return;
        }

        match event.kind {
            Kind::ApplicationSpecificData => self.handle_presence_event(&event).await,
            Kind::EncryptedDirectMessage => self.handle_signaling_event(relay, &event).await,
            _ => {}
        }
    }

    async fn handle_presence_event(&self, event: &nostr::Event) {
        let sender = event.pubkey.to_hex();
        let msg: PresenceMessage = match serde_json::from_str(&event.content) {
            Ok(msg) => msg,
            Err(_) => {
                warn!("Invalid presence event from {}", short_key(&sender));
                return;
            }
        };
        self.handle_presence(&sender, msg).await;
    }

    pub(crate) async fn handle_presence(&self, sender: &str, msg: PresenceMessage) {
        if sender == self.my_pubkey || msg.document_id() != self.document_id {
            return;
        }

        let age_ms = now_ms().saturating_sub(msg.timestamp());
        if age_ms > self.config.max_presence_age_ms {
            debug!(
                "Ignoring stale {} presence from {} ({}s old)",
                msg.msg_type(),
                short_key(sender),
                age_ms / 1000
            );
            return;
        }

        match msg {
            PresenceMessage::Join { .. } => self.discover(sender).await,
            PresenceMessage::Leave { .. } => {
                // Advisory only; a forged leave must not tear down a working
                // transport, so removal is left to connectivity detection
                debug!("Peer {} announced leave", short_key(sender));
            }
        }
    }

    /// Create a peer record unless one exists; the lexicographically smaller
    /// pubkey initiates, the other waits for the offer
    pub(crate) async fn discover(&self, their: &str) {
        let initiator = initiates(&self.my_pubkey, their);

        {
            let mut peers = self.state.peers.lock().await;
            if peers.contains_key(their) {
                return;
            }
            peers.insert(
                their.to_string(),
                PeerEntry {
                    pubkey: their.to_string(),
                    // Initiator stays Discovered until its offer actually
                    // goes out; the other side waits for that offer
                    state: if initiator {
                        PeerState::Discovered
                    } else {
                        PeerState::AwaitingOffer
                    },
                    connected: false,
                    synced: false,
                    created_at: Instant::now(),
                    peer: None,
                    timeout: Some(self.arm_timeout(their.to_string())),
                },
            );
        }

        info!(
            "Discovered peer {} (initiate: {})",
            short_key(their),
            initiator
        );
        self.status.connecting();

        if initiator {
            self.spawn_outbound(their.to_string());
        }
    }

    /// Negotiation deadline; fires into the event loop so removal happens on
    /// the single owner of the peer map
    fn arm_timeout(&self, pubkey: String) -> JoinHandle<()> {
        let events = self.peer_events.clone();
        let timeout = Duration::from_millis(self.config.connection_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(PeerEvent::NegotiationTimedOut { pubkey })
                .await;
        })
    }

    /// Build the outbound endpoint and offer off the event loop
    fn spawn_outbound(&self, their: String) {
        let events = self.peer_events.clone();
        let stun_servers = self.config.stun_servers.clone();
        tokio::spawn(async move {
            let result: Result<(Peer, serde_json::Value)> = async {
                let peer = Peer::new(their.clone(), &stun_servers, events.clone()).await?;
                peer.open_channel().await?;
                let offer = peer.create_offer().await?;
                Ok((peer, offer))
            }
            .await;

            let event = match result {
                Ok((peer, offer)) => PeerEvent::OfferReady {
                    pubkey: their,
                    peer,
                    offer,
                },
                Err(e) => PeerEvent::SetupFailed {
                    pubkey: their,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    /// Build the inbound endpoint from a remote offer off the event loop
    fn spawn_inbound(&self, their: String, offer: serde_json::Value) {
        let events = self.peer_events.clone();
        let stun_servers = self.config.stun_servers.clone();
        tokio::spawn(async move {
            let result: Result<(Peer, serde_json::Value)> = async {
                let peer = Peer::new(their.clone(), &stun_servers, events.clone()).await?;
                let answer = peer.apply_offer(offer).await?;
                Ok((peer, answer))
            }
            .await;

            let event = match result {
                Ok((peer, answer)) => PeerEvent::AnswerReady {
                    pubkey: their,
                    peer,
                    answer,
                },
                Err(e) => PeerEvent::SetupFailed {
                    pubkey: their,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    async fn handle_signaling_event(&self, relay: &str, event: &nostr::Event) {
        let sender = event.pubkey.to_hex();
        let msg = match signaling::open(&self.keys, event) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Dropping signaling event from {} via {}: {}",
                    short_key(&sender),
                    relay,
                    e
                );
                return;
            }
        };
        self.handle_signaling(&sender, msg).await;
    }

    pub(crate) async fn handle_signaling(&self, sender: &str, msg: SignalingMessage) {
        if msg.document_id() != self.document_id {
            return;
        }

        debug!("Received {} from {}", msg.msg_type(), short_key(sender));

        match msg {
            SignalingMessage::Offer { payload, .. } => self.handle_offer(sender, payload).await,
            SignalingMessage::Answer { payload, .. } => self.handle_answer(sender, payload).await,
            SignalingMessage::IceCandidate { payload, .. } => {
                self.handle_candidate(sender, payload).await
            }
        }
    }

    async fn handle_offer(&self, sender: &str, payload: serde_json::Value) {
        {
            let mut peers = self.state.peers.lock().await;
            match peers.get_mut(sender) {
                Some(entry) => {
                    if entry.peer.is_some() || entry.state != PeerState::AwaitingOffer {
                        debug!(
                            "Ignoring offer from {} in state {}",
                            short_key(sender),
                            entry.state
                        );
                        return;
                    }
                    entry.state = PeerState::Negotiating;
                }
                None => {
                    // The offer can outrun its presence event; record on demand
                    peers.insert(
                        sender.to_string(),
                        PeerEntry {
                            pubkey: sender.to_string(),
                            state: PeerState::Negotiating,
                            connected: false,
                            synced: false,
                            created_at: Instant::now(),
                            peer: None,
                            timeout: Some(self.arm_timeout(sender.to_string())),
                        },
                    );
                }
            }
        }

        info!("Received offer from {}", short_key(sender));
        self.status.connecting();
        self.spawn_inbound(sender.to_string(), payload);
    }

    async fn handle_answer(&self, sender: &str, payload: serde_json::Value) {
        let peer = {
            let mut peers = self.state.peers.lock().await;
            match peers.get_mut(sender) {
                Some(entry) if entry.state == PeerState::Offering && entry.peer.is_some() => {
                    entry.state = PeerState::Negotiating;
                    entry.peer.clone()
                }
                _ => {
                    debug!("Ignoring unexpected answer from {}", short_key(sender));
                    return;
                }
            }
        };

        if let Some(peer) = peer {
            if let Err(e) = peer.apply_answer(payload).await {
                warn!("Failed to apply answer from {}: {}", short_key(sender), e);
            } else {
                info!("Applied answer from {}", short_key(sender));
            }
        }
    }

    async fn handle_candidate(&self, sender: &str, payload: serde_json::Value) {
        let peer = {
            let peers = self.state.peers.lock().await;
            peers.get(sender).and_then(|entry| entry.peer.clone())
        };

        match peer {
            Some(peer) => {
                if let Err(e) = peer.add_candidate(payload).await {
                    debug!("Failed to add candidate from {}: {}", short_key(sender), e);
                }
            }
            // Tolerated: ICE keeps retransmitting while the endpoint is built
            None => debug!(
                "Candidate from {} before endpoint exists, dropped",
                short_key(sender)
            ),
        }
    }

    pub(crate) async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::OfferReady {
                pubkey,
                peer,
                offer,
            } => {
                if !self
                    .install_endpoint(&pubkey, peer.clone(), PeerState::Offering)
                    .await
                {
                    peer.close().await;
                    return;
                }
                self.send_signal(
                    &pubkey,
                    SignalingMessage::Offer {
                        document_id: self.document_id.clone(),
                        payload: offer,
                    },
                )
                .await;
                info!("Sent offer to {}", short_key(&pubkey));
            }
            PeerEvent::AnswerReady {
                pubkey,
                peer,
                answer,
            } => {
                if !self
                    .install_endpoint(&pubkey, peer.clone(), PeerState::Negotiating)
                    .await
                {
                    peer.close().await;
                    return;
                }
                self.send_signal(
                    &pubkey,
                    SignalingMessage::Answer {
                        document_id: self.document_id.clone(),
                        payload: answer,
                    },
                )
                .await;
                info!("Sent answer to {}", short_key(&pubkey));
            }
            PeerEvent::SetupFailed { pubkey, reason } => {
                warn!("Negotiation with {} failed: {}", short_key(&pubkey), reason);
                self.remove_peer(&pubkey).await;
            }
            PeerEvent::LocalCandidate { pubkey, candidate } => {
                self.send_signal(
                    &pubkey,
                    SignalingMessage::IceCandidate {
                        document_id: self.document_id.clone(),
                        payload: candidate,
                    },
                )
                .await;
            }
            PeerEvent::TransportState { pubkey, state } => match state {
                RTCPeerConnectionState::Connected => self.mark_connected(&pubkey).await,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    info!("Transport with {} reported {}", short_key(&pubkey), state);
                    self.remove_peer(&pubkey).await;
                }
                // Disconnected is often transient; ICE may still recover
                _ => {}
            },
            PeerEvent::ChannelOpen { pubkey } => self.sync_full_state(&pubkey).await,
            PeerEvent::Frame { pubkey, data } => self.handle_frame(&pubkey, &data).await,
            PeerEvent::NegotiationTimedOut { pubkey } => {
                let pending = {
                    let peers = self.state.peers.lock().await;
                    matches!(peers.get(&pubkey), Some(entry) if !entry.connected)
                };
                if pending {
                    info!(
                        "Connection timeout for {} - peer likely unreachable",
                        short_key(&pubkey)
                    );
                    self.remove_peer(&pubkey).await;
                }
            }
        }
    }

    /// Install a freshly built endpoint into its record and advance the
    /// state; false when the record vanished while the endpoint was built
    async fn install_endpoint(&self, pubkey: &str, peer: Peer, state: PeerState) -> bool {
        let mut peers = self.state.peers.lock().await;
        match peers.get_mut(pubkey) {
            Some(entry) if entry.peer.is_none() => {
                entry.peer = Some(peer);
                entry.state = state;
                true
            }
            _ => {
                debug!("Peer {} record gone during setup", short_key(pubkey));
                false
            }
        }
    }

    async fn mark_connected(&self, pubkey: &str) {
        {
            let mut peers = self.state.peers.lock().await;
            let Some(entry) = peers.get_mut(pubkey) else {
                return;
            };
            if entry.connected {
                return;
            }
            entry.connected = true;
            entry.state = PeerState::Connected;
            // Abort the deadline before anything else can close the record
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
        }

        let count = self.state.connected_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Peer {} connected", short_key(pubkey));
        self.status.connection_count(count);
        self.status.toast("Connected to a collaborator");
    }

    /// Full-state handoff: the entire document, exactly once per peer,
    /// before any incremental update reaches that channel
    async fn sync_full_state(&self, pubkey: &str) {
        let peer = {
            let mut peers = self.state.peers.lock().await;
            let Some(entry) = peers.get_mut(pubkey) else {
                return;
            };
            let Some(peer) = entry.peer.clone() else {
                return;
            };
            if entry.synced {
                return;
            }
            entry.synced = true;
            peer
        };

        match self.doc.encode_full_state() {
            Ok(state) => {
                let frame = channel::encode_update(&state);
                if let Err(e) = peer.send_frame(&frame).await {
                    warn!("Full-state handoff to {} failed: {}", short_key(pubkey), e);
                } else {
                    info!("Synced full state to {}", short_key(pubkey));
                }
            }
            Err(e) => warn!("Failed to encode full document state: {}", e),
        }
    }

    async fn handle_frame(&self, pubkey: &str, data: &[u8]) {
        match channel::decode(data) {
            Some(Frame::DocUpdate(payload)) => {
                if let Err(e) = self
                    .doc
                    .apply_update(&payload, UpdateOrigin::Peer(pubkey.to_string()))
                {
                    warn!("Failed to apply update from {}: {}", short_key(pubkey), e);
                }
            }
            None => debug!("Unknown frame from {}, dropped", short_key(pubkey)),
        }
    }

    /// Relay local updates to every synced peer; remote-origin updates are
    /// never re-broadcast (loop suppression for the full mesh)
    pub(crate) async fn handle_doc_update(&self, update: DocUpdate) {
        if !update.origin.is_local() {
            return;
        }

        let targets: Vec<Peer> = {
            let peers = self.state.peers.lock().await;
            peers
                .values()
                .filter(|entry| entry.synced)
                .filter_map(|entry| entry.peer.clone())
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let frame = channel::encode_update(&update.update);
        for peer in targets {
            if let Err(e) = peer.send_frame(&frame).await {
                debug!("Broadcast to {} failed: {}", short_key(peer.pubkey()), e);
            }
        }
    }

    /// Seal and publish one signaling message; delivery is best-effort
    async fn send_signal(&self, recipient: &str, msg: SignalingMessage) {
        match signaling::seal(&self.keys, recipient, &msg).await {
            Ok(event) => {
                if self.relay_tx.send(event).is_err() {
                    warn!("No relay connections, {} not sent", msg.msg_type());
                }
            }
            Err(e) => warn!(
                "Failed to seal {} for {}: {}",
                msg.msg_type(),
                short_key(recipient),
                e
            ),
        }
    }

    /// Tear down one peer record; removing an absent record is a no-op
    pub(crate) async fn remove_peer(&self, pubkey: &str) {
        let entry = { self.state.peers.lock().await.remove(pubkey) };
        let Some(mut entry) = entry else {
            return;
        };

        if let Some(handle) = entry.timeout.take() {
            handle.abort();
        }
        if entry.connected {
            self.state.connected_count.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(peer) = entry.peer.take() {
            peer.close().await;
        }

        self.status
            .connection_count(self.state.connected_count.load(Ordering::Relaxed));
        debug!("Removed peer {}", short_key(pubkey));
    }

    /// Release every session resource; each step is independent best-effort
    async fn teardown(&self) {
        let entries: Vec<PeerEntry> = {
            let mut peers = self.state.peers.lock().await;
            peers.drain().map(|(_, entry)| entry).collect()
        };

        for mut entry in entries {
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
            if let Some(peer) = entry.peer.take() {
                peer.close().await;
            }
        }

        self.state.connected_count.store(0, Ordering::Relaxed);
        self.status.connection_count(0);
        info!("Session for document {} closed", self.document_id);
    }
}
