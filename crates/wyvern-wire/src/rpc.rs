//! Registry service framing.
//!
//! Child worker processes proxy every registry operation to the parent
//! engine over one persistent loopback TCP connection.  Frames are:
//!
//! ```text
//! Request:  [u8 op]    [u32 LE payload length][payload]
//! Response: [u8 status][u32 LE payload length][payload]
//! ```
//!
//! Payloads are JSON documents owned by the engine crate; this module only
//! moves tagged byte frames and defines the op/status bytes.

use std::io::{self, Read, Write};

// ═══════════════════════════════════════════════════════════════════════
//  Operations
// ═══════════════════════════════════════════════════════════════════════

/// Move one ready state to busy and return it (blocking while work remains).
pub const OP_GET_STATE: u8 = 0x01;

/// Insert a new state into the ready list, returning its fresh id.
pub const OP_PUT_READY: u8 = 0x02;

/// Insert a new state directly into the busy list (fork keep-going path).
pub const OP_PUT_BUSY: u8 = 0x03;

/// Overwrite the stored payload of an id without changing its list.
pub const OP_SAVE: u8 = 0x04;

/// Move an id from busy back to ready (cooperative-stop checkpoint).
pub const OP_REVIVE: u8 = 0x05;

/// Move an id from busy to terminated with a reason.
pub const OP_TERMINATE: u8 = 0x06;

/// Move an id from busy to killed with a reason.
pub const OP_KILL: u8 = 0x07;

/// Drop a consumed fork parent (busy to destroyed).
pub const OP_DISCARD: u8 = 0x08;

/// Ask whether the pool-wide kill flag is set.
pub const OP_POLL_CANCEL: u8 = 0x09;

/// Publish a lifecycle event through the parent's event sink.
pub const OP_EVENT: u8 = 0x0a;

// ═══════════════════════════════════════════════════════════════════════
//  Statuses
// ═══════════════════════════════════════════════════════════════════════

/// Operation succeeded; payload is the JSON result (possibly empty).
pub const STATUS_OK: u8 = 0x00;

/// `get_state` found no work: exploration exhausted or kill flag set.
pub const STATUS_NONE: u8 = 0x01;

/// Operation failed; payload is UTF-8 error text.
pub const STATUS_ERR: u8 = 0x02;

// ═══════════════════════════════════════════════════════════════════════
//  Frames
// ═══════════════════════════════════════════════════════════════════════

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one tagged frame.
pub fn write_frame<W: Write>(w: &mut W, tag: u8, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload exceeds MAX_FRAME_LEN",
        ));
    }
    w.write_all(&[tag])?;
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one tagged frame.
///
/// Returns `Ok(None)` on clean EOF (the peer closed between frames); EOF in
/// the middle of a frame is an `UnexpectedEof` error.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    loop {
        match r.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let mut len_raw = [0u8; 4];
    r.read_exact(&mut len_raw)?;
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload exceeds MAX_FRAME_LEN",
        ));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some((tag[0], payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_SAVE, br#"{"id":4}"#).unwrap();
        write_frame(&mut buf, STATUS_OK, b"").unwrap();

        let mut cursor = Cursor::new(buf);
        let (tag, payload) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(tag, OP_SAVE);
        assert_eq!(payload, br#"{"id":4}"#);

        let (tag, payload) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(tag, STATUS_OK);
        assert!(payload.is_empty());

        // Clean EOF after the last frame.
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_GET_STATE, b"{\"wait\":true}").unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_rejected() {
        // Hand-build a header claiming a payload far past MAX_FRAME_LEN.
        let mut buf = vec![OP_EVENT];
        buf.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
