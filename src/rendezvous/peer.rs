//! WebRTC transport endpoint for one remote peer
//!
//! Wraps an `RTCPeerConnection` plus its data channel and reports everything
//! the session manager needs to drive the per-peer state machine: local ICE
//! candidates, transport state changes, channel open, inbound frames.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::types::short_key;

/// Label of the single data channel carrying document frames
pub const DATA_CHANNEL_LABEL: &str = "doc";

/// Events reported back to the session manager's event loop
#[derive(Debug)]
pub enum PeerEvent {
    /// Outbound endpoint built, offer ready to send
    OfferReady {
        pubkey: String,
        peer: Peer,
        offer: serde_json::Value,
    },
    /// Inbound endpoint built from an offer, answer ready to send
    AnswerReady {
        pubkey: String,
        peer: Peer,
        answer: serde_json::Value,
    },
    /// Endpoint construction or description exchange failed
    SetupFailed { pubkey: String, reason: String },
    /// Trickled local ICE candidate to relay to the peer
    LocalCandidate {
        pubkey: String,
        candidate: serde_json::Value,
    },
    /// Underlying transport connectivity changed
    TransportState {
        pubkey: String,
        state: RTCPeerConnectionState,
    },
    /// Data channel with the peer is open
    ChannelOpen { pubkey: String },
    /// Inbound data channel frame
    Frame { pubkey: String, data: Vec<u8> },
    /// Negotiation timer fired before Connected was reached
    NegotiationTimedOut { pubkey: String },
}

/// Transport handle for one remote peer; cheap to clone, all state shared
#[derive(Clone)]
pub struct Peer {
    pubkey: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::Sender<PeerEvent>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("pubkey", &self.pubkey).finish()
    }
}

impl Peer {
    /// Create the transport endpoint and register its event handlers
    pub async fn new(
        pubkey: String,
        stun_servers: &[String],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let peer = Self {
            pubkey,
            pc,
            channel: Arc::new(Mutex::new(None)),
            events,
        };
        peer.wire_handlers();

        Ok(peer)
    }

    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Register connection-level handlers: trickled ICE candidates, transport
    /// state changes, and inbound data channels (answerer side)
    fn wire_handlers(&self) {
        let events = self.events.clone();
        let pubkey = self.pubkey.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let pubkey = pubkey.clone();
                Box::pin(async move {
                    if let Some(c) = candidate {
                        if let Ok(init) = c.to_json() {
                            let candidate = serde_json::to_value(&init).unwrap_or_default();
                            let _ = events
                                .send(PeerEvent::LocalCandidate { pubkey, candidate })
                                .await;
                        }
                    }
                })
            }));

        let events = self.events.clone();
        let pubkey = self.pubkey.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let pubkey = pubkey.clone();
                Box::pin(async move {
                    debug!("Peer {} transport state: {:?}", short_key(&pubkey), state);
                    let _ = events
                        .send(PeerEvent::TransportState { pubkey, state })
                        .await;
                })
            }));

        let events = self.events.clone();
        let pubkey = self.pubkey.clone();
        let slot = self.channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let pubkey = pubkey.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    info!(
                        "Peer {} opened data channel: {}",
                        short_key(&pubkey),
                        dc.label()
                    );
                    Self::attach_channel(dc, pubkey, slot, events);
                })
            }));
    }

    /// Create the outgoing data channel (initiator side)
    pub async fn open_channel(&self) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await?;
        Self::attach_channel(
            dc,
            self.pubkey.clone(),
            self.channel.clone(),
            self.events.clone(),
        );
        Ok(())
    }

    /// Register channel handlers and store the handle for later sends
    fn attach_channel(
        dc: Arc<RTCDataChannel>,
        pubkey: String,
        slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
        events: mpsc::Sender<PeerEvent>,
    ) {
        let events_open = events.clone();
        let pubkey_open = pubkey.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = events_open
                    .send(PeerEvent::ChannelOpen {
                        pubkey: pubkey_open,
                    })
                    .await;
            })
        }));

        let events_msg = events.clone();
        let pubkey_msg = pubkey.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events_msg.clone();
            let pubkey = pubkey_msg.clone();
            Box::pin(async move {
                let _ = events
                    .send(PeerEvent::Frame {
                        pubkey,
                        data: msg.data.to_vec(),
                    })
                    .await;
            })
        }));

        let pubkey_close = pubkey;
        dc.on_close(Box::new(move || {
            let pubkey = pubkey_close.clone();
            Box::pin(async move {
                debug!("Peer {} data channel closed", short_key(&pubkey));
            })
        }));

        *slot.lock().expect("channel slot poisoned") = Some(dc);
    }

    /// Produce the local offer (initiator side)
    pub async fn create_offer(&self) -> Result<serde_json::Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        Ok(serde_json::json!({
            "type": offer.sdp_type.to_string().to_lowercase(),
            "sdp": offer.sdp,
        }))
    }

    /// Apply a remote offer and produce the answer (responder side)
    pub async fn apply_offer(&self, offer: serde_json::Value) -> Result<serde_json::Value> {
        let sdp = offer
            .get("sdp")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow!("missing SDP in offer"))?;

        let offer_desc = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(offer_desc).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        Ok(serde_json::json!({
            "type": answer.sdp_type.to_string().to_lowercase(),
            "sdp": answer.sdp,
        }))
    }

    /// Apply a remote answer (initiator side)
    pub async fn apply_answer(&self, answer: serde_json::Value) -> Result<()> {
        let sdp = answer
            .get("sdp")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow!("missing SDP in answer"))?;

        let answer_desc = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer_desc).await?;

        Ok(())
    }

    /// Apply a trickled remote ICE candidate
    pub async fn add_candidate(&self, candidate: serde_json::Value) -> Result<()> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");

        if candidate_str.is_empty() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };
        self.pc.add_ice_candidate(init).await?;

        Ok(())
    }

    /// Send a frame; attempts on a missing or closed channel are silently
    /// ignored
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let dc = self.channel.lock().expect("channel slot poisoned").clone();
        let Some(dc) = dc else {
            trace!("Peer {} has no data channel, frame dropped", short_key(&self.pubkey));
            return Ok(());
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            trace!("Peer {} channel not open, frame dropped", short_key(&self.pubkey));
            return Ok(());
        }
        dc.send(&Bytes::from(frame.to_vec())).await?;
        Ok(())
    }

    /// Close channel and transport, each best-effort
    pub async fn close(&self) {
        let dc = self.channel.lock().expect("channel slot poisoned").take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("Peer {} channel close: {}", short_key(&self.pubkey), e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer {} transport close: {}", short_key(&self.pubkey), e);
        }
    }
}
