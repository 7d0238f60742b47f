//! Wire formats for wyvern's introspection and registry-service protocols.
//!
//! Two host-side protocols share this crate:
//!
//! 1. **Introspection messages** (this module): the log dump server and the
//!    state snapshot server each write exactly one message per TCP
//!    connection, then close it.  Connections are request-less — any
//!    connection triggers a response, no bytes need to be sent first.
//! 2. **Registry service frames** ([`rpc`]): tagged request/response frames
//!    used by child worker processes to proxy registry operations to the
//!    parent over loopback TCP.
//!
//! # Message layout
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0       4     magic "WYRE"
//! 4       2     format version, u16 LE (currently 1)
//! 6       1     message tag (TAG_LOG_BATCH or TAG_STATE_DUMP)
//! 7       4     record count, u32 LE
//! 11      ..    `count` records back to back
//! ```
//!
//! A log record is `[u32 LE length][UTF-8 text]`.  A state record is:
//!
//! ```text
//! [u64 LE state id]
//! [u8  state kind]
//! [u64 LE execs]
//! [u64 LE wait_ms]
//! [u32 LE reason length][reason, UTF-8]
//! ```
//!
//! All integers are little-endian.  Decoders reject truncated input, bad
//! magic, unknown versions, and unknown tags.

pub mod rpc;

use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Ports and limits
// ═══════════════════════════════════════════════════════════════════════

/// Default TCP port of the log dump server (loopback only).
pub const DEFAULT_LOG_PORT: u16 = 3214;

/// Default TCP port of the state snapshot server, always log port + 1.
pub const DEFAULT_SNAPSHOT_PORT: u16 = DEFAULT_LOG_PORT + 1;

/// Upper bound on records in a single log dump message.
pub const MAX_LOG_RECORDS_PER_DUMP: usize = 50;

// ═══════════════════════════════════════════════════════════════════════
//  Header
// ═══════════════════════════════════════════════════════════════════════

/// Magic prefix of every introspection message.
pub const MAGIC: [u8; 4] = *b"WYRE";

/// Current wire format version.
pub const WIRE_VERSION: u16 = 1;

/// Message tag: a batch of log records.
pub const TAG_LOG_BATCH: u8 = 0x01;

/// Message tag: a dump of state records.
pub const TAG_STATE_DUMP: u8 = 0x02;

/// Bytes before the first record: magic + version + tag + count.
pub const HEADER_LEN: usize = 4 + 2 + 1 + 4;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,

    #[error("bad magic prefix")]
    BadMagic,

    #[error("unsupported wire version {0}")]
    BadVersion(u16),

    #[error("unexpected message tag {0:#04x}")]
    BadTag(u8),

    #[error("unknown state kind {0}")]
    BadKind(u8),

    #[error("record text is not valid UTF-8")]
    BadText,
}

// ═══════════════════════════════════════════════════════════════════════
//  State records
// ═══════════════════════════════════════════════════════════════════════

/// List membership of a state as reported by the snapshot server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StateKind {
    Ready = 0,
    Busy = 1,
    Terminated = 2,
    Killed = 3,
}

impl StateKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<StateKind> {
        match raw {
            0 => Some(StateKind::Ready),
            1 => Some(StateKind::Busy),
            2 => Some(StateKind::Terminated),
            3 => Some(StateKind::Killed),
            _ => None,
        }
    }
}

/// One state's schedulable status at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// Registry-assigned state id.
    pub id: u64,
    /// Which list the state was in when the snapshot was taken.
    pub kind: StateKind,
    /// How many times a worker has taken ownership of the state.
    pub execs: u64,
    /// Milliseconds since the state last changed lists.
    pub wait_ms: u64,
    /// Termination reason; empty unless terminated or killed.
    pub reason: String,
}

// ═══════════════════════════════════════════════════════════════════════
//  Encoding
// ═══════════════════════════════════════════════════════════════════════

fn put_header(buf: &mut Vec<u8>, tag: u8, count: u32) {
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&WIRE_VERSION.to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(&count.to_le_bytes());
}

fn put_text(buf: &mut Vec<u8>, text: &str) {
    buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
    buf.extend_from_slice(text.as_bytes());
}

/// Encode a log dump message from already-formatted log lines.
pub fn encode_log_batch(records: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + records.iter().map(|r| 4 + r.len()).sum::<usize>());
    put_header(&mut buf, TAG_LOG_BATCH, records.len() as u32);
    for record in records {
        put_text(&mut buf, record);
    }
    buf
}

/// Encode a state snapshot message.
pub fn encode_state_dump(records: &[StateRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_header(&mut buf, TAG_STATE_DUMP, records.len() as u32);
    for record in records {
        buf.extend_from_slice(&record.id.to_le_bytes());
        buf.push(record.kind.to_u8());
        buf.extend_from_slice(&record.execs.to_le_bytes());
        buf.extend_from_slice(&record.wait_ms.to_le_bytes());
        put_text(&mut buf, &record.reason);
    }
    buf
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoding
// ═══════════════════════════════════════════════════════════════════════

/// Bounds-checked reader over a received message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    fn text(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadText)
    }
}

/// Validate the header and return the record count.
fn check_header(r: &mut Reader, want_tag: u8) -> Result<u32, WireError> {
    if r.take(4)? != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = r.u16()?;
    if version != WIRE_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let tag = r.u8()?;
    if tag != want_tag {
        return Err(WireError::BadTag(tag));
    }
    r.u32()
}

/// Decode a log dump message into its log lines.
pub fn decode_log_batch(raw: &[u8]) -> Result<Vec<String>, WireError> {
    let mut r = Reader::new(raw);
    let count = check_header(&mut r, TAG_LOG_BATCH)?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(r.text()?);
    }
    Ok(records)
}

/// Decode a state snapshot message into its records.
pub fn decode_state_dump(raw: &[u8]) -> Result<Vec<StateRecord>, WireError> {
    let mut r = Reader::new(raw);
    let count = check_header(&mut r, TAG_STATE_DUMP)?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.u64()?;
        let kind_raw = r.u8()?;
        let kind = StateKind::from_u8(kind_raw).ok_or(WireError::BadKind(kind_raw))?;
        let execs = r.u64()?;
        let wait_ms = r.u64()?;
        let reason = r.text()?;
        records.push(StateRecord {
            id,
            kind,
            execs,
            wait_ms,
            reason,
        });
    }
    Ok(records)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_states() -> Vec<StateRecord> {
        vec![
            StateRecord {
                id: 0,
                kind: StateKind::Ready,
                execs: 0,
                wait_ms: 12,
                reason: String::new(),
            },
            StateRecord {
                id: 3,
                kind: StateKind::Terminated,
                execs: 2,
                wait_ms: 900,
                reason: "path exhausted".to_string(),
            },
            StateRecord {
                id: 7,
                kind: StateKind::Killed,
                execs: 1,
                wait_ms: 4,
                reason: "divide by zero".to_string(),
            },
        ]
    }

    #[test]
    fn log_batch_roundtrip() {
        let records = vec![
            "INFO [engine] pool starting".to_string(),
            "WARN [worker] unit 2 retired".to_string(),
            "λ unicode survives".to_string(),
        ];
        let encoded = encode_log_batch(&records);
        let decoded = decode_log_batch(&encoded).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn empty_log_batch_roundtrip() {
        let encoded = encode_log_batch(&[]);
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(decode_log_batch(&encoded).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn state_dump_roundtrip() {
        let records = sample_states();
        let encoded = encode_state_dump(&records);
        let decoded = decode_state_dump(&encoded).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn truncated_message_rejected() {
        let encoded = encode_state_dump(&sample_states());
        for cut in [0, 3, HEADER_LEN, encoded.len() - 1] {
            assert_eq!(
                decode_state_dump(&encoded[..cut]),
                Err(WireError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut encoded = encode_log_batch(&["x".to_string()]);
        encoded[0] = b'?';
        assert_eq!(decode_log_batch(&encoded), Err(WireError::BadMagic));
    }

    #[test]
    fn bad_version_rejected() {
        let mut encoded = encode_log_batch(&[]);
        encoded[4] = 0xff;
        encoded[5] = 0xff;
        assert_eq!(decode_log_batch(&encoded), Err(WireError::BadVersion(0xffff)));
    }

    #[test]
    fn wrong_tag_rejected() {
        let encoded = encode_log_batch(&[]);
        assert_eq!(
            decode_state_dump(&encoded),
            Err(WireError::BadTag(TAG_LOG_BATCH))
        );
    }

    #[test]
    fn unknown_state_kind_rejected() {
        let mut encoded = encode_state_dump(&sample_states());
        // Kind byte of the first record sits right after the header + id.
        encoded[HEADER_LEN + 8] = 9;
        assert_eq!(decode_state_dump(&encoded), Err(WireError::BadKind(9)));
    }

    #[test]
    fn snapshot_port_is_adjacent() {
        assert_eq!(DEFAULT_SNAPSHOT_PORT, DEFAULT_LOG_PORT + 1);
    }
}
