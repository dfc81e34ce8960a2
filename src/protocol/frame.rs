//! Peer-to-peer frames exchanged over mesh connections
//!
//! Wire format:  [4-byte big-endian length][JSON payload]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound for a single frame (parameter sets can be large)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// All messages sent directly between two peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerFrame {
    /// First frame on an outbound connection
    Hello { peer_id: String },

    /// Reply to `Hello` on an inbound connection
    HelloAck { peer_id: String },

    /// Topic publication; `payload` is base64 of the opaque bytes
    Publish { topic: String, payload: String },
}

impl PeerFrame {
    pub fn publish(topic: &str, data: &[u8]) -> Self {
        PeerFrame::Publish {
            topic: topic.to_string(),
            payload: BASE64.encode(data),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "HELLO",
            PeerFrame::HelloAck { .. } => "HELLO_ACK",
            PeerFrame::Publish { .. } => "PUBLISH",
        }
    }
}

/// Decode the base64 body of a `Publish` frame
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| Error::malformed(format!("invalid base64 payload: {}", e)))
}

/// Read a length-prefixed JSON frame from a stream
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<PeerFrame> {
    let body = read_frame_body(reader).await?;
    decode_frame(&body)
}

/// Read one frame body without decoding it
///
/// Errors here leave the stream unusable; decode errors on the body do not.
pub async fn read_frame_body<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(Error::ConnectionLost {
            message: format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub fn decode_frame(body: &[u8]) -> Result<PeerFrame> {
    Ok(serde_json::from_slice(body)?)
}

/// Write a length-prefixed JSON frame to a stream
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &PeerFrame) -> Result<()> {
    let json = serde_json::to_vec(frame)
        .map_err(|e| Error::Internal(format!("Failed to encode frame: {}", e)))?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| Error::Internal(format!("frame of {} bytes exceeds limit", json.len())))?;

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = PeerFrame::Hello {
            peer_id: "node-1".to_string(),
        };
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_publish_payload_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let data = vec![0u8, 159, 146, 150, 255];

        write_frame(&mut client, &PeerFrame::publish("federation", &data))
            .await
            .unwrap();

        match read_frame(&mut server).await.unwrap() {
            PeerFrame::Publish { topic, payload } => {
                assert_eq!(topic, "federation");
                assert_eq!(decode_payload(&payload).unwrap(), data);
            }
            other => panic!("Expected Publish, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_frame_tag_names() {
        let json = serde_json::to_string(&PeerFrame::HelloAck {
            peer_id: "node-3".into(),
        })
        .unwrap();
        assert!(json.contains("HELLO_ACK"));
        assert!(json.contains("node-3"));
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        assert!(decode_payload("***").is_err());
    }
}
