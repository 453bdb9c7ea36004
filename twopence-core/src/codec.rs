//! Wire packet codec.
//!
//! A packet is a fixed seven-byte header followed by a payload:
//! `{type: u8, tid: u16, cid: u16, length: u16}`, all multi-byte fields
//! in network (big-endian) byte order. The header never leaves this
//! module as raw bytes; everything above `parse_header`/`build` deals
//! in [`Header`] and owned payload `Bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::SegmentedBuffer;
use crate::error::{Error, Result};

/// Size of the fixed packet header, in bytes.
pub const HEADER_LEN: usize = 7;

/// Channel id reserved for file-transfer transactions (INJECT/EXTRACT).
pub const CID_FILE: u16 = 0;
/// Channel id for a command's stdin sink.
pub const CID_STDIN: u16 = 1;
/// Channel id for a command's stdout source.
pub const CID_STDOUT: u16 = 2;
/// Channel id for a command's stderr source.
pub const CID_STDERR: u16 = 3;

/// Upper bound on a single packet's payload. Anything bigger is
/// rejected before the dissector allocates a buffer for it.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Logical packet types the core produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Hello,
    Quit,
    Inject,
    Extract,
    Command,
    Data,
    Eof,
    Intr,
    Major,
    Minor,
    Timeout,
}

impl PacketType {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Hello => b'H',
            Self::Quit => b'Q',
            Self::Inject => b'I',
            Self::Extract => b'X',
            Self::Command => b'C',
            Self::Data => b'D',
            Self::Eof => b'E',
            Self::Intr => b'i',
            Self::Major => b'M',
            Self::Minor => b'm',
            Self::Timeout => b'T',
        }
    }

    const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'H' => Self::Hello,
            b'Q' => Self::Quit,
            b'I' => Self::Inject,
            b'X' => Self::Extract,
            b'C' => Self::Command,
            b'D' => Self::Data,
            b'E' => Self::Eof,
            b'i' => Self::Intr,
            b'M' => Self::Major,
            b'm' => Self::Minor,
            b'T' => Self::Timeout,
            _ => return None,
        })
    }
}

/// A decoded packet header, payload length not yet consumed.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub kind: PacketType,
    pub tid: u16,
    pub cid: u16,
    pub length: u16,
}

/// Outcome of trying to parse a header off the front of a buffer.
pub enum ParseOutcome {
    /// Not enough bytes yet; try again once more has arrived.
    Short,
    /// A well-formed header, with the header bytes already consumed.
    Header(Header),
}

/// Parse one packet header from the front of `buf`, consuming the
/// header bytes only once the full frame (header and payload both) is
/// buffered. Returns [`ParseOutcome::Short`] if fewer than
/// [`HEADER_LEN`] bytes are buffered yet, or if the header is complete
/// but its declared payload hasn't fully arrived — in both cases `buf`
/// is left untouched, so the next call re-reads the same header bytes
/// once more data has come in. Returns an error if the declared length
/// exceeds [`MAX_PAYLOAD_LEN`] or the type byte is unknown.
pub fn parse_header(buf: &mut SegmentedBuffer) -> Result<ParseOutcome> {
    if buf.len() < HEADER_LEN {
        return Ok(ParseOutcome::Short);
    }

    let mut raw = [0u8; HEADER_LEN];
    if !buf.copy_prefix(HEADER_LEN, &mut raw) {
        return Ok(ParseOutcome::Short);
    }

    let kind = PacketType::from_byte(raw[0]).ok_or_else(|| Error::MalformedPacket {
        reason: format!("unknown packet type byte 0x{:02x}", raw[0]),
    })?;

    let mut rest = &raw[1..];
    let tid = rest.get_u16();
    let cid = rest.get_u16();
    let length = rest.get_u16();

    if length as usize > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedPacket {
            reason: format!("payload length {length} exceeds maximum"),
        });
    }

    if buf.len() < HEADER_LEN + length as usize {
        // Full frame hasn't arrived yet; leave the header bytes in
        // place (only `copy_prefix`'d above, never `advance`d) so a
        // later call re-parses the same header once the rest of the
        // payload has been read off the socket.
        return Ok(ParseOutcome::Short);
    }

    buf.advance(HEADER_LEN);
    Ok(ParseOutcome::Header(Header { kind, tid, cid, length }))
}

/// Build a complete on-wire packet (header + payload).
///
/// # Errors
///
/// Returns [`Error::OversizePayload`] if `payload.len()` does not fit
/// in the 16-bit length field. This is always an internal bug: every
/// caller in this crate builds payloads far below the limit.
pub fn build(kind: PacketType, tid: u16, cid: u16, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::OversizePayload {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(kind.to_byte());
    out.put_u16(tid);
    out.put_u16(cid);
    out.put_u16(payload.len() as u16);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// A file-transfer request (INJECT or EXTRACT payload).
#[derive(Debug, Clone)]
pub struct FileXferRequest {
    pub user: String,
    pub path: String,
    pub mode: u32,
}

/// A command-start request (COMMAND payload).
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub user: String,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u32,
    pub request_tty: bool,
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    if buf.len() < 2 {
        return Err(Error::MalformedPacket {
            reason: "truncated string length".into(),
        });
    }
    let len = buf.get_u16() as usize;
    if buf.len() < len {
        return Err(Error::MalformedPacket {
            reason: "truncated string body".into(),
        });
    }
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| Error::MalformedPacket {
            reason: "string is not valid UTF-8".into(),
        })?
        .to_owned();
    *buf = tail;
    Ok(s)
}

fn write_string(out: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > MAX_PAYLOAD_LEN {
        return Err(Error::OversizePayload {
            len: s.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    out.put_u16(s.len() as u16);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Dissect an INJECT or EXTRACT payload: user name, path, mode.
pub fn dissect_file_xfer(mut payload: &[u8]) -> Result<FileXferRequest> {
    let user = read_string(&mut payload)?;
    let path = read_string(&mut payload)?;
    if payload.len() < 4 {
        return Err(Error::MalformedPacket {
            reason: "truncated file mode".into(),
        });
    }
    let mode = payload.get_u32();
    Ok(FileXferRequest { user, path, mode })
}

/// Build an INJECT or EXTRACT payload.
pub fn build_file_xfer(req: &FileXferRequest) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    write_string(&mut out, &req.user)?;
    write_string(&mut out, &req.path)?;
    out.put_u32(req.mode);
    Ok(out)
}

/// Dissect a COMMAND payload: user, command line, timeout, tty flag,
/// then an env map encoded as a `u16` count followed by that many
/// `(key, value)` string pairs.
pub fn dissect_command(mut payload: &[u8]) -> Result<CommandRequest> {
    let user = read_string(&mut payload)?;
    let command = read_string(&mut payload)?;
    if payload.len() < 5 {
        return Err(Error::MalformedPacket {
            reason: "truncated command trailer".into(),
        });
    }
    let timeout_secs = payload.get_u32();
    let request_tty = payload.get_u8() != 0;

    if payload.len() < 2 {
        return Err(Error::MalformedPacket {
            reason: "truncated env count".into(),
        });
    }
    let env_count = payload.get_u16();
    let mut env = Vec::with_capacity(env_count as usize);
    for _ in 0..env_count {
        let key = read_string(&mut payload)?;
        let value = read_string(&mut payload)?;
        env.push((key, value));
    }

    Ok(CommandRequest {
        user,
        command,
        env,
        timeout_secs,
        request_tty,
    })
}

/// Build a COMMAND payload.
pub fn build_command(req: &CommandRequest) -> Result<BytesMut> {
    if req.env.len() > u16::MAX as usize {
        return Err(Error::OversizePayload {
            len: req.env.len(),
            max: u16::MAX as usize,
        });
    }

    let mut out = BytesMut::new();
    write_string(&mut out, &req.user)?;
    write_string(&mut out, &req.command)?;
    out.put_u32(req.timeout_secs);
    out.put_u8(u8::from(req.request_tty));
    out.put_u16(req.env.len() as u16);
    for (k, v) in &req.env {
        write_string(&mut out, k)?;
        write_string(&mut out, v)?;
    }
    Ok(out)
}
