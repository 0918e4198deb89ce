//! Data channel frame codec
//!
//! Messages on an open channel are a single type byte followed by an opaque
//! payload. Type `0` carries a document update for the merge engine.

/// Frame type for document updates
pub const MSG_DOC_UPDATE: u8 = 0;

/// Decoded data channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    DocUpdate(Vec<u8>),
}

/// Frame a document update payload for the wire
pub fn encode_update(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(MSG_DOC_UPDATE);
    frame.extend_from_slice(payload);
    frame
}

/// Decode a frame; `None` for empty input or an unknown type byte
pub fn decode(data: &[u8]) -> Option<Frame> {
    let (&tag, payload) = data.split_first()?;
    match tag {
        MSG_DOC_UPDATE => Some(Frame::DocUpdate(payload.to_vec())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_frame_roundtrip() {
        let frame = encode_update(b"hello");
        assert_eq!(frame[0], MSG_DOC_UPDATE);
        assert_eq!(decode(&frame), Some(Frame::DocUpdate(b"hello".to_vec())));
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let frame = encode_update(b"");
        assert_eq!(decode(&frame), Some(Frame::DocUpdate(Vec::new())));
    }

    #[test]
    fn test_unknown_type_dropped() {
        assert_eq!(decode(&[42, 1, 2, 3]), None);
    }

    #[test]
    fn test_empty_frame_dropped() {
        assert_eq!(decode(&[]), None);
    }
}
