//! Data channel transfer protocol
//!
//! Control messages travel as JSON text frames:
//!
//! ```text
//! {"type":"file_transfer_info","transferId":..,"sourceId":..,"kvPairsLength":..,"maxChunkSize":..}
//! {"type":"file_transfer_info_ack","transferId":..}
//! {"type":"text","content":..}
//! ```
//!
//! Chunk records travel as binary frames: the UTF-8 JSON of a [`KvRecord`]
//! sliced into pieces of at most `maxChunkSize` bytes, sent back to back.

use dbase_core::KvRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::transport::ProtocolError;

/// Reference upper bound for one binary frame (16 KiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Give up on a record that grows past this without parsing
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "file_transfer_info", rename_all = "camelCase")]
    FileTransferInfo {
        transfer_id: String,
        source_id: String,
        kv_pairs_length: usize,
        max_chunk_size: usize,
    },
    #[serde(rename = "file_transfer_info_ack", rename_all = "camelCase")]
    FileTransferInfoAck { transfer_id: String },
    #[serde(rename = "text")]
    Text { content: String },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Unknown `type` values are reported separately from broken JSON
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing type".to_string()))?
            .to_string();

        match msg_type.as_str() {
            "file_transfer_info" | "file_transfer_info_ack" | "text" => {
                serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
            _ => Err(ProtocolError::UnknownType(msg_type)),
        }
    }
}

/// Serialize a record and slice it into frames of at most `max_frame_size` bytes
pub fn frame_record(record: &KvRecord, max_frame_size: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    if max_frame_size == 0 {
        return Err(ProtocolError::Malformed("frame size must be positive".to_string()));
    }
    let bytes = serde_json::to_vec(record).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(bytes.chunks(max_frame_size).map(|c| c.to_vec()).collect())
}

fn parse_record(bytes: &[u8]) -> Option<KvRecord> {
    // JSON documents of a record always end in '}'; skip the parse otherwise
    if bytes.last() != Some(&b'}') {
        return None;
    }
    serde_json::from_slice(bytes).ok()
}

/// Per-channel record reassembly.
///
/// Frames of one record arrive contiguously, so a single buffer per channel
/// suffices. The buffer is committed as soon as its concatenation parses.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    frames: usize,
    max_record_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_RECORD_SIZE)
    }
}

impl Reassembler {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            frames: 0,
            max_record_size,
        }
    }

    /// Bytes held for an incomplete record
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one binary frame; returns a record once one is complete.
    ///
    /// A frame that is a complete record on its own while another record is
    /// pending starts over: the stale buffer is discarded and reported.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<KvRecord>, ProtocolError> {
        if !self.buffer.is_empty() {
            if let Some(record) = parse_record(frame) {
                let stale = ProtocolError::Malformed(format!(
                    "unfinished record of {} bytes in {} frames interrupted by {}",
                    self.buffer.len(),
                    self.frames,
                    record.key
                ));
                warn!("Discarding reassembly buffer: {}", stale);
                self.reset();
                return Ok(Some(record));
            }
        }

        self.buffer.extend_from_slice(frame);
        self.frames += 1;

        if let Some(record) = parse_record(&self.buffer) {
            self.reset();
            return Ok(Some(record));
        }

        if self.buffer.len() > self.max_record_size {
            self.reset();
            return Err(ProtocolError::RecordTooLarge {
                limit: self.max_record_size,
            });
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbase_core::{ChunkMeta, EncryptedChunk, EncryptionMethod};

    fn record(cid: &str, data_len: usize) -> KvRecord {
        KvRecord::new(ChunkMeta {
            owner: "node-a".to_string(),
            file_name: "report.pdf".to_string(),
            chunk_cid: cid.to_string(),
            chunk_index: 0,
            encrypted_chunk: EncryptedChunk::sealed(vec![3; 12], vec![100; data_len]),
            encryption_method: EncryptionMethod::AesGcm,
        })
    }

    #[test]
    fn test_control_message_wire_shape() {
        let info = ControlMessage::FileTransferInfo {
            transfer_id: "t-1".to_string(),
            source_id: "peer-a".to_string(),
            kv_pairs_length: 3,
            max_chunk_size: MAX_FRAME_SIZE,
        };
        let json: Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "file_transfer_info");
        assert_eq!(json["transferId"], "t-1");
        assert_eq!(json["sourceId"], "peer-a");
        assert_eq!(json["kvPairsLength"], 3);
        assert_eq!(json["maxChunkSize"], 16384);

        let ack = ControlMessage::parse(r#"{"type":"file_transfer_info_ack","transferId":"t-1"}"#).unwrap();
        assert_eq!(ack, ControlMessage::FileTransferInfoAck { transfer_id: "t-1".to_string() });
    }

    #[test]
    fn test_control_message_errors() {
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"bogus"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "bogus"
        ));
        assert!(matches!(ControlMessage::parse("{"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"text"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_small_record_single_frame() {
        // ~5 KB of JSON
        let rec = record("bafkreismall", 1200);
        let frames = frame_record(&rec, MAX_FRAME_SIZE).unwrap();
        assert_eq!(frames.len(), 1);

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.push(&frames[0]).unwrap(), Some(rec));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_40kb_record_three_frames() {
        // 10,000 entries of "100," is 40,000 bytes of JSON
        let rec = record("bafkreilarge", 10_000);
        let original = serde_json::to_vec(&rec).unwrap();
        assert!(original.len() > 2 * MAX_FRAME_SIZE && original.len() <= 3 * MAX_FRAME_SIZE);

        let frames = frame_record(&rec, MAX_FRAME_SIZE).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_SIZE));

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.push(&frames[0]).unwrap(), None);
        assert_eq!(reassembler.push(&frames[1]).unwrap(), None);
        let rebuilt = reassembler.push(&frames[2]).unwrap().unwrap();
        assert_eq!(serde_json::to_vec(&rebuilt).unwrap(), original);
        assert_eq!(rebuilt, rec);
    }

    #[test]
    fn test_consecutive_records() {
        let a = record("bafkreia", 6000);
        let b = record("bafkreib", 10);
        let mut reassembler = Reassembler::default();
        let mut out = Vec::new();
        for frame in frame_record(&a, 4096).unwrap().iter().chain(frame_record(&b, 4096).unwrap().iter()) {
            if let Some(rec) = reassembler.push(frame).unwrap() {
                out.push(rec.key);
            }
        }
        assert_eq!(out, vec!["bafkreia", "bafkreib"]);
    }

    #[test]
    fn test_standalone_frame_replaces_stale_buffer() {
        let big = record("bafkreibig", 6000);
        let small = record("bafkreismall", 10);
        let big_frames = frame_record(&big, 4096).unwrap();
        let small_frames = frame_record(&small, 4096).unwrap();

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.push(&big_frames[0]).unwrap(), None);
        assert!(reassembler.pending() > 0);
        assert_eq!(reassembler.push(&small_frames[0]).unwrap(), Some(small));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_record_too_large() {
        let mut reassembler = Reassembler::new(10);
        assert_eq!(reassembler.push(b"{\"key\":").unwrap(), None);
        assert_eq!(
            reassembler.push(b"\"abcdefgh"),
            Err(ProtocolError::RecordTooLarge { limit: 10 })
        );
        assert_eq!(reassembler.pending(), 0);
    }
}
