//! Per-relay websocket task
//!
//! Each configured relay gets one task: connect, subscribe to the document's
//! presence topic and to envelopes addressed to the local identity, forward
//! inbound events to the session manager, and write whatever signed events
//! the manager broadcasts. A relay failure ends its task; the remaining
//! relays keep the session alive.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use nostr::{Alphabet, ClientMessage, Filter, JsonUtil, Kind, RelayMessage, SingleLetterTag};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::SUBSCRIPTION_LOOKBACK_SECS;

/// Connect to a single relay and pump events until shutdown or socket close
pub async fn relay_task(
    url: String,
    document_id: String,
    my_pubkey: String,
    event_tx: mpsc::Sender<(String, nostr::Event)>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut write_rx: broadcast::Receiver<nostr::Event>,
) -> Result<()> {
    info!("Connecting to relay: {}", url);

    let (ws_stream, _) = connect_async(&url).await?;
    let (mut write, mut read) = ws_stream.split();

    let lookback = Duration::from_secs(SUBSCRIPTION_LOOKBACK_SECS);

    // Presence events scoped to this document
    let presence_filter = Filter::new()
        .kind(Kind::ApplicationSpecificData)
        .custom_tag(
            SingleLetterTag::lowercase(Alphabet::D),
            vec![document_id.clone()],
        )
        .since(nostr::Timestamp::now() - lookback);

    // Encrypted signaling envelopes addressed to us
    let signaling_filter = Filter::new()
        .kind(Kind::EncryptedDirectMessage)
        .custom_tag(
            SingleLetterTag::lowercase(Alphabet::P),
            vec![my_pubkey.clone()],
        )
        .since(nostr::Timestamp::now() - lookback);

    for filter in [presence_filter, signaling_filter] {
        let sub_id = nostr::SubscriptionId::generate();
        let sub_msg = ClientMessage::req(sub_id, vec![filter]);
        write.send(Message::Text(sub_msg.as_json().into())).await?;
    }

    info!("Subscribed to {} for presence and signaling", url);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            outbound = write_rx.recv() => {
                match outbound {
                    Ok(event) => {
                        let msg = ClientMessage::event(event);
                        if let Err(e) = write.send(Message::Text(msg.as_json().into())).await {
                            warn!("Failed to publish to {}: {}", url, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Relay {} writer lagged, {} events dropped", url, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(relay_msg) = RelayMessage::from_json(&text) {
                            if let RelayMessage::Event { event, .. } = relay_msg {
                                let _ = event_tx.send((url.clone(), *event)).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", url, e);
                        break;
                    }
                    None => {
                        warn!("WebSocket closed: {}", url);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!("Relay task for {} finished", url);
    Ok(())
}
