//! Blob payload serialization
//!
//! A blob travels as gzip-compressed line-delimited JSON: the first line is
//! the blob header (identity, sequencing, device attributes), followed by one
//! JSON object per claimed event. Close events carry the session's screen
//! flow and total length so the collector can finalize the session from the
//! payload alone.

use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::{Account, Event, EventKind, Session, UploadBlob};

/// First line of every upload payload.
#[derive(Debug, Clone, Serialize)]
pub struct BlobHeader {
    /// Blob UUID
    pub blob_id: String,
    /// Per-account monotonically increasing sequence number
    pub seq: i64,
    /// API key the payload belongs to
    pub api_key: String,
    /// Install-scoped UUID
    pub install_id: String,
    /// Checksum binding the install id to the API key (32-char hex)
    pub install_checksum: String,
    /// When the blob was cut
    pub created_at: DateTime<Utc>,
    /// Device/runtime attributes
    pub device: serde_json::Value,
}

impl BlobHeader {
    /// Build the header for one blob
    pub fn new(account: &Account, blob: &UploadBlob) -> Self {
        BlobHeader {
            blob_id: blob.id.clone(),
            seq: blob.seq,
            api_key: account.api_key.clone(),
            install_id: account.install_id.clone(),
            install_checksum: install_checksum(&account.api_key, &account.install_id),
            created_at: blob.created_at,
            device: crate::types::device_snapshot(),
        }
    }
}

/// Checksum binding an install id to its API key
///
/// Returns a 32-character hex digest of SHA-256(api_key + install_id)
pub fn install_checksum(api_key: &str, install_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", api_key, install_id).as_bytes());
    let result = hasher.finalize();

    // Take first 16 bytes (32 hex chars)
    hex::encode(&result[..16])
}

/// Render one event as its payload line.
///
/// `session` is the owning session (None for opt transitions) and `flow` is
/// the ordered screen list consumed by the blob, non-empty only for close
/// events.
pub fn render_event(event: &Event, session: Option<&Session>, flow: &[String]) -> serde_json::Value {
    let mut line = serde_json::json!({
        "kind": event.kind.as_str(),
        "wall_time": event.wall_time.to_rfc3339(),
        "elapsed_ms": event.elapsed_ms,
    });

    if let Some(session_id) = &event.session_id {
        line["session_id"] = serde_json::Value::String(session_id.clone());
    }
    if let Some(name) = &event.name {
        line["name"] = serde_json::Value::String(name.clone());
    }
    if !event.attributes.is_empty() {
        let attrs: serde_json::Map<String, serde_json::Value> = event
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        line["attributes"] = serde_json::Value::Object(attrs);
    }

    if event.kind == EventKind::Close {
        line["session_length_ms"] = serde_json::json!(event.elapsed_ms);
        if !flow.is_empty() {
            line["flow"] = serde_json::json!(flow);
        }
        if let Some(session) = session {
            line["session_started_at"] =
                serde_json::Value::String(session.started_at.to_rfc3339());
        }
    }

    line
}

/// Serialize the header and event lines to gzip-compressed LDJSON
pub fn build_payload(header: &BlobHeader, lines: &[serde_json::Value]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    serde_json::to_writer(&mut encoder, header)?;
    encoder.write_all(b"\n")?;
    for line in lines {
        serde_json::to_writer(&mut encoder, line)?;
        encoder.write_all(b"\n")?;
    }

    encoder.finish().map_err(crate::error::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn make_account() -> Account {
        Account {
            id: 1,
            api_key: "em_test_key".to_string(),
            install_id: "11111111-2222-3333-4444-555555555555".to_string(),
            opted_out: false,
            created_at: Utc::now(),
        }
    }

    fn make_blob() -> UploadBlob {
        UploadBlob {
            id: "blob-1".to_string(),
            account_id: 1,
            seq: 7,
            created_at: Utc::now(),
        }
    }

    fn decode_lines(payload: &[u8]) -> Vec<serde_json::Value> {
        let mut decoder = flate2::read::GzDecoder::new(payload);
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        text.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_install_checksum_deterministic() {
        let a = install_checksum("key", "install");
        let b = install_checksum("key", "install");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, install_checksum("key", "other-install"));
        assert_ne!(a, install_checksum("other-key", "install"));
    }

    #[test]
    fn test_header_line_fields() {
        let header = BlobHeader::new(&make_account(), &make_blob());
        let payload = build_payload(&header, &[]).unwrap();
        let lines = decode_lines(&payload);

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["blob_id"], "blob-1");
        assert_eq!(lines[0]["seq"], 7);
        assert_eq!(lines[0]["api_key"], "em_test_key");
        assert_eq!(
            lines[0]["install_checksum"],
            serde_json::Value::String(install_checksum(
                "em_test_key",
                "11111111-2222-3333-4444-555555555555"
            ))
        );
        assert!(lines[0]["device"]["os"].is_string());
    }

    #[test]
    fn test_render_custom_event_with_attributes() {
        let event = Event {
            id: 1,
            account_id: 1,
            session_id: Some("s1".to_string()),
            kind: EventKind::Custom,
            name: Some("checkout".to_string()),
            wall_time: Utc::now(),
            elapsed_ms: 1200,
            attributes: vec![("sku".to_string(), "42".to_string())],
        };

        let line = render_event(&event, None, &[]);
        assert_eq!(line["kind"], "custom");
        assert_eq!(line["session_id"], "s1");
        assert_eq!(line["name"], "checkout");
        assert_eq!(line["attributes"]["sku"], "42");
        assert!(line.get("flow").is_none());
    }

    #[test]
    fn test_render_close_event_carries_flow() {
        let started = Utc::now();
        let session = Session {
            id: "s1".to_string(),
            account_id: 1,
            started_at: started,
            metadata: serde_json::json!({}),
        };
        let event = Event {
            id: 2,
            account_id: 1,
            session_id: Some("s1".to_string()),
            kind: EventKind::Close,
            name: None,
            wall_time: Utc::now(),
            elapsed_ms: 4500,
            attributes: vec![],
        };

        let flow = vec!["home".to_string(), "cart".to_string()];
        let line = render_event(&event, Some(&session), &flow);

        assert_eq!(line["kind"], "close");
        assert_eq!(line["session_length_ms"], 4500);
        assert_eq!(line["flow"], serde_json::json!(["home", "cart"]));
        assert_eq!(line["session_started_at"], started.to_rfc3339());
    }

    #[test]
    fn test_payload_is_one_line_per_event() {
        let header = BlobHeader::new(&make_account(), &make_blob());
        let events: Vec<serde_json::Value> = (0..3)
            .map(|i| serde_json::json!({"kind": "custom", "name": format!("e{}", i)}))
            .collect();

        let payload = build_payload(&header, &events).unwrap();
        let lines = decode_lines(&payload);

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3]["name"], "e2");
    }
}
