//! Nostr event construction for presence and encrypted signaling
//!
//! Presence: kind 30078 events tagged with the document id, readable by
//! anyone on the topic. Signaling: kind 4 envelopes, NIP-04 encrypted to a
//! single recipient pubkey.

use anyhow::{Context, Result};
use nostr::nips::nip04;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Tag};

use super::types::{PresenceMessage, SignalingMessage, PRESENCE_TOPIC_PREFIX};

/// Build a signed presence event for the document topic
pub async fn presence_event(
    keys: &Keys,
    document_id: &str,
    msg: &PresenceMessage,
) -> Result<Event> {
    let content = serde_json::to_string(msg)?;
    let topic = format!("{PRESENCE_TOPIC_PREFIX}{document_id}");

    let event = EventBuilder::new(Kind::ApplicationSpecificData, content)
        .tags(vec![
            Tag::parse(["d", document_id])?,
            Tag::parse(["t", &topic])?,
        ])
        .sign(keys)
        .await?;

    Ok(event)
}

/// Encrypt a signaling message to the recipient and wrap it in a signed
/// kind-4 envelope addressed to them
pub async fn seal(keys: &Keys, recipient: &str, msg: &SignalingMessage) -> Result<Event> {
    let recipient_pk = PublicKey::from_hex(recipient).context("invalid recipient pubkey")?;
    let plaintext = serde_json::to_string(msg)?;
    let ciphertext = nip04::encrypt(keys.secret_key(), &recipient_pk, plaintext)
        .context("nip04 encryption failed")?;

    let event = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
        .tags(vec![Tag::public_key(recipient_pk)])
        .sign(keys)
        .await?;

    Ok(event)
}

/// Decrypt an inbound signaling envelope with the local secret key and parse
/// the plaintext
pub fn open(keys: &Keys, event: &Event) -> Result<SignalingMessage> {
    let plaintext = nip04::decrypt(keys.secret_key(), &event.pubkey, &event.content)
        .context("nip04 decryption failed")?;
    let msg: SignalingMessage =
        serde_json::from_str(&plaintext).context("malformed signaling payload")?;
    Ok(msg)
}
