//! Wire protocol: packet model, newline framing, and chunking rules
//! shared by the relay and the client.
//!
//! Every packet is one JSON object terminated by a single `\n`. Reads may
//! deliver any number of complete records plus a fragment; the
//! [`LineAssembler`] splits on the delimiter and carries the fragment into
//! the next read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Packet discriminator. `KeyExchangeResponse` and `Heartbeat` are
/// reserved: they parse and serialize but nothing in the control flow
/// emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Text,
    File,
    Photo,
    KeyExchange,
    KeyExchangeResponse,
    FileDownloadRequest,
    FileDownloadResponse,
    Heartbeat,
}

/// One wire record.
///
/// Binary data (cipher output, RSA blobs) travels base64-encoded in the
/// string fields. `total_packets`, `file_name`, `file_size` and
/// `message_id` are repeated identically on every chunk of one transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: PacketType,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub encrypted_session_key: String,

    #[serde(default = "default_packet_count")]
    pub total_packets: u32,

    #[serde(default = "default_packet_count")]
    pub packet_number: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default = "new_message_id")]
    pub message_id: String,
}

fn default_packet_count() -> u32 {
    1
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Packet {
    /// A packet of the given type with a fresh message id, current
    /// timestamp, and every other field at its default.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            content: String::new(),
            encrypted_session_key: String::new(),
            total_packets: 1,
            packet_number: 1,
            file_name: None,
            file_size: None,
            sender_id: None,
            recipient_id: None,
            timestamp: Utc::now(),
            message_id: new_message_id(),
        }
    }

    /// Serialize to the single-line form that goes on the wire (without
    /// the trailing delimiter).
    pub fn to_line(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Accumulates raw reads and yields complete newline-terminated records.
///
/// A single read may contain zero, one, several, or a fragment of a
/// record; whatever trails the last delimiter stays buffered for the next
/// call. Whitespace-only records are dropped, matching the tolerant
/// behavior of the rest of the protocol.
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed freshly read bytes and collect every complete record.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);

        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];

            match std::str::from_utf8(line) {
                Ok(text) if !text.trim().is_empty() => records.push(text.to_string()),
                Ok(_) => {}
                Err(_) => {
                    log::warn!("dropping non-UTF-8 record ({} bytes)", line.len());
                }
            }
        }
        records
    }

    /// Bytes currently waiting for their delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Slice an encrypted blob into transfer chunks. The last chunk may be
/// short; an empty blob yields no chunks.
pub fn chunk_data(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Rebuild an encrypted blob from buffered chunks, tolerating any arrival
/// order. Chunks are sorted by packet number before concatenation.
pub fn reassemble_chunks(mut chunks: Vec<Packet>) -> Result<Vec<u8>, ChatError> {
    chunks.sort_by_key(|p| p.packet_number);

    let mut blob = Vec::new();
    for chunk in &chunks {
        let mut data = base64::decode(&chunk.content).map_err(|e| {
            ChatError::Protocol(format!("chunk {}: {}", chunk.packet_number, e))
        })?;
        blob.append(&mut data);
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_json_field_names() {
        let mut packet = Packet::new(PacketType::Text);
        packet.content = "Zm9v".to_string();
        packet.encrypted_session_key = "a2V5".to_string();
        packet.sender_id = Some("alice".to_string());

        let json = packet.to_line().expect("packet should serialize");
        assert!(json.contains("\"type\":\"Text\""));
        assert!(json.contains("\"encryptedSessionKey\":\"a2V5\""));
        assert!(json.contains("\"totalPackets\":1"));
        assert!(json.contains("\"packetNumber\":1"));
        assert!(json.contains("\"senderId\":\"alice\""));
        assert!(json.contains("\"messageId\""));
        // Unset optionals stay off the wire entirely.
        assert!(!json.contains("fileName"));
        assert!(!json.contains("recipientId"));
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut packet = Packet::new(PacketType::File);
        packet.content = "AAECAw==".to_string();
        packet.total_packets = 3;
        packet.packet_number = 2;
        packet.file_name = Some("report.pdf".to_string());
        packet.file_size = Some(10_000);

        let line = packet.to_line().unwrap();
        let parsed: Packet = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed.packet_type, PacketType::File);
        assert_eq!(parsed.total_packets, 3);
        assert_eq!(parsed.packet_number, 2);
        assert_eq!(parsed.file_name.as_deref(), Some("report.pdf"));
        assert_eq!(parsed.file_size, Some(10_000));
        assert_eq!(parsed.message_id, packet.message_id);
    }

    #[test]
    fn test_sparse_packet_uses_defaults() {
        let parsed: Packet =
            serde_json::from_str(r#"{"type":"Heartbeat"}"#).expect("sparse packet parses");

        assert_eq!(parsed.packet_type, PacketType::Heartbeat);
        assert_eq!(parsed.total_packets, 1);
        assert_eq!(parsed.packet_number, 1);
        assert!(parsed.content.is_empty());
        assert!(parsed.sender_id.is_none());
        assert!(!parsed.message_id.is_empty());
    }

    #[test]
    fn test_all_enumerants_roundtrip() {
        for t in [
            PacketType::Text,
            PacketType::File,
            PacketType::Photo,
            PacketType::KeyExchange,
            PacketType::KeyExchangeResponse,
            PacketType::FileDownloadRequest,
            PacketType::FileDownloadResponse,
            PacketType::Heartbeat,
        ] {
            let line = Packet::new(t).to_line().unwrap();
            let parsed: Packet = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed.packet_type, t);
        }
    }

    #[test]
    fn test_assembler_single_record() {
        let mut assembler = LineAssembler::new();
        let records = assembler.push(b"{\"a\":1}\n");
        assert_eq!(records, vec!["{\"a\":1}"]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_fragmented_record() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"{\"a\"").is_empty());
        assert!(assembler.push(b":1").is_empty());
        let records = assembler.push(b"}\n{\"b\":2}\n{\"c\"");
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(assembler.pending(), 4);

        let records = assembler.push(b":3}\n");
        assert_eq!(records, vec!["{\"c\":3}"]);
    }

    #[test]
    fn test_assembler_skips_blank_records() {
        let mut assembler = LineAssembler::new();
        let records = assembler.push(b"\n  \n{\"a\":1}\n\n");
        assert_eq!(records, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_assembler_split_utf8_sequence() {
        let mut assembler = LineAssembler::new();
        let text = "{\"msg\":\"héllo\"}\n".as_bytes();
        // Split in the middle of the two-byte é sequence.
        let cut = text.iter().position(|&b| b == 0xc3).unwrap() + 1;

        assert!(assembler.push(&text[..cut]).is_empty());
        let records = assembler.push(&text[cut..]);
        assert_eq!(records, vec!["{\"msg\":\"héllo\"}"]);
    }

    #[test]
    fn test_chunk_data_boundaries() {
        let data = vec![7u8; 10_000];
        let chunks = chunk_data(&data, 4096);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 4096);
        assert_eq!(chunks[2].len(), 1808);

        assert!(chunk_data(&[], 4096).is_empty());
        assert_eq!(chunk_data(&[1, 2, 3], 4096).len(), 1);
    }

    #[test]
    fn test_reassembly_is_order_tolerant() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let pieces = chunk_data(&payload, 100);

        let make_chunks = |order: &[usize]| -> Vec<Packet> {
            order
                .iter()
                .map(|&i| {
                    let mut p = Packet::new(PacketType::File);
                    p.content = base64::encode(&pieces[i]);
                    p.total_packets = pieces.len() as u32;
                    p.packet_number = i as u32 + 1;
                    p.message_id = "transfer-1".to_string();
                    p
                })
                .collect()
        };

        let in_order = reassemble_chunks(make_chunks(&[0, 1, 2])).unwrap();
        assert_eq!(in_order, payload);

        for order in [[2, 1, 0], [1, 2, 0], [2, 0, 1], [0, 2, 1], [1, 0, 2]] {
            assert_eq!(reassemble_chunks(make_chunks(&order)).unwrap(), payload);
        }
    }

    #[test]
    fn test_reassembly_rejects_bad_encoding() {
        let mut p = Packet::new(PacketType::File);
        p.content = "*** definitely not base64 ***".to_string();
        assert!(matches!(
            reassemble_chunks(vec![p]),
            Err(ChatError::Protocol(_))
        ));
    }
}
