//! Message payloads, the transport frame layout, and the framed codec.
//!
//! Every frame body is laid out little-endian as:
//!
//! ```text
//! id: u32 | in_response_to: u32 | waiting_for_response: u8 | payload bytes…
//! ```
//!
//! preceded on the stream by a `u32` length prefix of the body. An
//! `in_response_to` of zero marks an unsolicited message; message ids are
//! allocated from a process-wide counter that never yields zero.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::chunk::{ChunkDefinition, ChunkMarker};
use crate::config::CompatibilitySettings;
use crate::node::{NodeDefinition, NodeType};

/// Body bytes past which a frame is rejected as corrupt.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Fixed body header: id + in_response_to + waiting flag.
const BODY_HEADER_BYTES: usize = 9;

/// `JoinSuccess` document key carrying the primary's chunk split threshold.
pub const DOC_MAX_CHUNK_ITEM_COUNT: &str = "maxChunkItemCount";

static MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next process-wide message id. Zero is reserved for
/// "no response", so the counter skips it when it wraps.
pub fn next_message_id() -> u32 {
    loop {
        let id = MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Admission request; the first message every peer sends on a new link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAttempt {
    pub node_type: NodeType,
    /// Canonical hostname the peer is reachable under.
    pub name: String,
    /// Canonical listen port; with `name` this replaces the ephemeral
    /// transport address in the peer registry.
    pub port: u16,
    pub settings: PeerSettings,
    /// Set by a controller that believes it is the current primary.
    pub is_primary_claim: bool,
}

impl JoinAttempt {
    pub fn canonical(&self) -> NodeDefinition {
        NodeDefinition::new(self.name.clone(), self.port)
    }
}

/// Compatibility data inside a `JoinAttempt`; its shape differs by peer type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerSettings {
    /// Full settings document (controller, query, and storage peers).
    Document(CompatibilitySettings),
    /// Bare connection string (api peers).
    Raw(String),
    /// No compatibility data (console peers).
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSuccess {
    /// Whether the responding controller is the current primary.
    pub primary_controller: bool,
    /// Extensible key/value extras; absent keys read as unset.
    #[serde(default)]
    pub document: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinFailure {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingResponse {
    pub answer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPrimaryMessageIdResponse {
    pub last_primary_message_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkListUpdate {
    pub chunks: Vec<ChunkDefinition>,
}

/// A storage node reporting that one of its chunks became two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSplit {
    pub start1: ChunkMarker,
    pub end1: ChunkMarker,
    pub start2: ChunkMarker,
    pub end2: ChunkMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMerge {
    pub start: ChunkMarker,
    pub end: ChunkMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataOperation {
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOutcome {
    Success,
    FailedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataOperationResult {
    pub outcome: DataOutcome,
    pub message: String,
}

/// Addresses of every connected peer of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeList {
    pub node_type: NodeType,
    pub nodes: Vec<NodeDefinition>,
}

/// Every message body the controller plane exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    JoinAttempt(JoinAttempt),
    JoinSuccess(JoinSuccess),
    JoinFailure(JoinFailure),
    Acknowledgement,
    VotingRequest,
    VotingResponse(VotingResponse),
    LastPrimaryMessageIdRequest,
    LastPrimaryMessageIdResponse(LastPrimaryMessageIdResponse),
    PrimaryAnnouncement,
    ChunkListUpdate(ChunkListUpdate),
    ChunkSplit(ChunkSplit),
    ChunkMerge(ChunkMerge),
    DataOperation(DataOperation),
    DataOperationResult(DataOperationResult),
    NodeList(NodeList),
    DatabaseCreate,
}

impl Payload {
    /// Short tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::JoinAttempt(_) => "join_attempt",
            Payload::JoinSuccess(_) => "join_success",
            Payload::JoinFailure(_) => "join_failure",
            Payload::Acknowledgement => "acknowledgement",
            Payload::VotingRequest => "voting_request",
            Payload::VotingResponse(_) => "voting_response",
            Payload::LastPrimaryMessageIdRequest => "last_primary_message_id_request",
            Payload::LastPrimaryMessageIdResponse(_) => "last_primary_message_id_response",
            Payload::PrimaryAnnouncement => "primary_announcement",
            Payload::ChunkListUpdate(_) => "chunk_list_update",
            Payload::ChunkSplit(_) => "chunk_split",
            Payload::ChunkMerge(_) => "chunk_merge",
            Payload::DataOperation(_) => "data_operation",
            Payload::DataOperationResult(_) => "data_operation_result",
            Payload::NodeList(_) => "node_list",
            Payload::DatabaseCreate => "database_create",
        }
    }
}

/// One framed transport message, payload still encoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u32,
    pub in_response_to: u32,
    pub waiting_for_response: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Build an unsolicited frame with a freshly allocated id.
    pub fn request(payload: &Payload, waiting_for_response: bool) -> anyhow::Result<Frame> {
        Ok(Frame {
            id: next_message_id(),
            in_response_to: 0,
            waiting_for_response,
            payload: encode_payload(payload)?,
        })
    }

    /// Build a frame answering the message with id `in_response_to`.
    pub fn reply(
        in_response_to: u32,
        payload: &Payload,
        waiting_for_response: bool,
    ) -> anyhow::Result<Frame> {
        Ok(Frame {
            id: next_message_id(),
            in_response_to,
            waiting_for_response,
            payload: encode_payload(payload)?,
        })
    }

    pub fn decode_payload(&self) -> anyhow::Result<Payload> {
        serde_json::from_slice(&self.payload).context("decode message payload")
    }
}

fn encode_payload(payload: &Payload) -> anyhow::Result<Bytes> {
    let bytes = serde_json::to_vec(payload).context("encode message payload")?;
    Ok(Bytes::from(bytes))
}

/// Codec producing and consuming the framed layout above.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let body_len = BODY_HEADER_BYTES + frame.payload.len();
        if body_len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body of {body_len} bytes exceeds limit"),
            ));
        }
        dst.reserve(4 + body_len);
        dst.put_u32_le(body_len as u32);
        dst.put_u32_le(frame.id);
        dst.put_u32_le(frame.in_response_to);
        dst.put_u8(u8::from(frame.waiting_for_response));
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if !(BODY_HEADER_BYTES..=MAX_FRAME_BYTES).contains(&body_len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body length {body_len} out of bounds"),
            ));
        }
        if src.len() < 4 + body_len {
            src.reserve(4 + body_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(body_len);
        let id = body.get_u32_le();
        let in_response_to = body.get_u32_le();
        let waiting_for_response = body.get_u8() != 0;
        Ok(Some(Frame {
            id,
            in_response_to,
            waiting_for_response,
            payload: body.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_never_zero() {
        let mut last = 0;
        for _ in 0..64 {
            let id = next_message_id();
            assert_ne!(id, 0);
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn frame_round_trips_through_codec() {
        let payload = Payload::JoinFailure(JoinFailure {
            reason: "settings mismatch".to_string(),
        });
        let frame = Frame::request(&payload, true).expect("build frame");
        let sent_id = frame.id;

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");

        let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded.id, sent_id);
        assert_eq!(decoded.in_response_to, 0);
        assert!(decoded.waiting_for_response);
        assert!(matches!(
            decoded.decode_payload().expect("payload"),
            Payload::JoinFailure(f) if f.reason == "settings mismatch"
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_a_complete_frame() {
        let frame = Frame::reply(7, &Payload::Acknowledgement, false).expect("build frame");
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).expect("encode");

        // Feed the bytes one at a time; only the last byte completes a frame.
        let mut partial = BytesMut::new();
        let last = full.len() - 1;
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let decoded = codec.decode(&mut partial).expect("decode");
            if i < last {
                assert!(decoded.is_none());
            } else {
                let frame = decoded.expect("complete");
                assert_eq!(frame.in_response_to, 7);
                assert!(!frame.waiting_for_response);
            }
        }
    }

    #[test]
    fn body_layout_is_little_endian() {
        let frame = Frame {
            id: 0x0102_0304,
            in_response_to: 0x0506_0708,
            waiting_for_response: true,
            payload: Bytes::from_static(b"x"),
        };
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).expect("encode");

        assert_eq!(&buf[..4], &[10, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..12], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(buf[12], 1);
        assert_eq!(&buf[13..], b"x");
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_BYTES as u32) + 1);
        buf.put_slice(&[0u8; 16]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }
}
