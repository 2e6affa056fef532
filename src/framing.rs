use std::fmt;
use std::io;

use log::warn;

/// First two bytes of every frame header.
pub const FRAME_MAGIC: [u8; 2] = *b"DB";
/// Protocol revision carried in the third header byte.
pub const PROTO_VERSION: u8 = 1;
/// Magic(2) + version(1) + port(1) + payload length(2, little endian).
pub const HEADER_LEN: usize = 6;
/// Framing limit of the raw protocol. Larger payloads are rejected on both
/// directions.
pub const MAX_PAYLOAD: usize = 2048;

/// Logical destination of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Video,
    Proxy,
    Status,
    Comm,
    /// Host to device only. Unblocks the accessory-side reader; carries a
    /// single sentinel byte and is never delivered to an application port.
    TimeoutWake,
}

impl Port {
    pub const fn byte(self) -> u8 {
        match self {
            Port::Video => 0x01,
            Port::Proxy => 0x02,
            Port::Status => 0x03,
            Port::Comm => 0x04,
            Port::TimeoutWake => 0x05,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Port::Video),
            0x02 => Some(Port::Proxy),
            0x03 => Some(Port::Status),
            0x04 => Some(Port::Comm),
            0x05 => Some(Port::TimeoutWake),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Port::Video => "video",
            Port::Proxy => "proxy",
            Port::Status => "status",
            Port::Comm => "communication",
            Port::TimeoutWake => "timeout wake",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    PayloadTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds the {MAX_PAYLOAD} byte frame limit")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// The complete `TIMEOUT_WAKE` frame: header plus one sentinel byte.
pub fn wake_frame() -> [u8; HEADER_LEN + 1] {
    [
        FRAME_MAGIC[0],
        FRAME_MAGIC[1],
        PROTO_VERSION,
        Port::TimeoutWake.byte(),
        1,
        0,
        0,
    ]
}

/// Outbound frame buffer with a pre-stamped header prefix.
///
/// Local sockets read straight into [`payload_mut`](Self::payload_mut);
/// [`framed`](Self::framed) then finalizes the port and length fields and
/// hands back the wire bytes without copying.
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let mut frame = Self {
            buf: vec![0u8; HEADER_LEN + MAX_PAYLOAD],
        };
        frame.reset_header();
        frame
    }

    /// Re-stamps magic and version, e.g. after a device reconnect.
    pub fn reset_header(&mut self) {
        self.buf[0] = FRAME_MAGIC[0];
        self.buf[1] = FRAME_MAGIC[1];
        self.buf[2] = PROTO_VERSION;
    }

    /// The payload region following the reserved header prefix.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_LEN..]
    }

    /// Finalizes the header for `len` payload bytes on `port` and returns the
    /// full frame.
    pub fn framed(&mut self, port: Port, len: usize) -> Result<&[u8], FrameError> {
        if len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        self.buf[3] = port.byte();
        self.buf[4] = (len & 0xff) as u8;
        self.buf[5] = (len >> 8) as u8;
        Ok(&self.buf[..HEADER_LEN + len])
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles `(port, payload)` events from the inbound USB byte stream.
///
/// A frame header must arrive at the front of a chunk; payload bytes may be
/// spread over any number of subsequent chunks. The reassembly buffer exists
/// exactly while a payload is incomplete.
pub struct Deframer {
    port: u8,
    expected: usize,
    buf: Option<Vec<u8>>,
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            port: 0,
            expected: 0,
            buf: None,
        }
    }

    /// Discards any partial payload and waits for the next header.
    pub fn reset(&mut self) {
        self.buf = None;
    }

    /// Consumes one received chunk, invoking `emit` for each completed frame.
    ///
    /// The unfragmented fast path emits a borrow of `chunk` directly. A chunk
    /// carrying bytes past the current payload is malformed: the partial
    /// payload and the excess bytes are dropped and header search resumes at
    /// the next chunk boundary.
    pub fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(u8, &[u8])) {
        if let Some(mut buf) = self.buf.take() {
            let remaining = self.expected - buf.len();
            if chunk.len() < remaining {
                buf.extend_from_slice(chunk);
                self.buf = Some(buf);
            } else if chunk.len() == remaining {
                buf.extend_from_slice(chunk);
                emit(self.port, &buf);
            } else {
                warn!(
                    "chunk carries {} byte(s) past the current payload, dropping frame",
                    chunk.len() - remaining
                );
            }
            return;
        }

        if chunk.len() < HEADER_LEN {
            return;
        }
        if chunk[..2] != FRAME_MAGIC || chunk[2] != PROTO_VERSION {
            return;
        }
        let port = chunk[3];
        let declared = u16::from_le_bytes([chunk[4], chunk[5]]) as usize;
        if declared > MAX_PAYLOAD {
            warn!("declared payload too big for raw protocol ({declared} > {MAX_PAYLOAD}), ignoring");
            return;
        }
        let tail = &chunk[HEADER_LEN..];
        if tail.len() == declared {
            emit(port, tail);
        } else if tail.len() < declared {
            let mut buf = Vec::with_capacity(declared);
            buf.extend_from_slice(tail);
            self.port = port;
            self.expected = declared;
            self.buf = Some(buf);
        } else {
            warn!(
                "chunk carries {} byte(s) past the declared payload, dropping frame",
                tail.len() - declared
            );
        }
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(port: Port, payload: &[u8]) -> Vec<u8> {
        let mut frame = FrameBuffer::new();
        frame.payload_mut()[..payload.len()].copy_from_slice(payload);
        frame.framed(port, payload.len()).unwrap().to_vec()
    }

    fn collect(deframer: &mut Deframer, chunk: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut events = Vec::new();
        deframer.feed(chunk, |port, payload| events.push((port, payload.to_vec())));
        events
    }

    #[test]
    fn header_layout() {
        let bytes = encode(Port::Proxy, b"hello");
        assert_eq!(&bytes[..HEADER_LEN], &[b'D', b'B', 1, 2, 5, 0]);
        assert_eq!(&bytes[HEADER_LEN..], b"hello");
    }

    #[test]
    fn length_field_is_little_endian() {
        let bytes = encode(Port::Video, &[0xaa; 0x0123]);
        assert_eq!(bytes[4], 0x23);
        assert_eq!(bytes[5], 0x01);
    }

    #[test]
    fn round_trip_single_chunk() {
        let bytes = encode(Port::Proxy, b"hello");
        let mut deframer = Deframer::new();
        let events = collect(&mut deframer, &bytes);
        assert_eq!(events, vec![(Port::Proxy.byte(), b"hello".to_vec())]);
        assert!(deframer.buf.is_none());
    }

    #[test]
    fn round_trip_split_payload() {
        let bytes = encode(Port::Proxy, b"hello");
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, &bytes[..HEADER_LEN + 2]).is_empty());
        let events = collect(&mut deframer, &bytes[HEADER_LEN + 2..]);
        assert_eq!(events, vec![(Port::Proxy.byte(), b"hello".to_vec())]);
    }

    #[test]
    fn payload_delivered_byte_by_byte() {
        let bytes = encode(Port::Comm, b"abcd");
        let mut deframer = Deframer::new();
        let mut events = collect(&mut deframer, &bytes[..HEADER_LEN]);
        for b in &bytes[HEADER_LEN..] {
            events.extend(collect(&mut deframer, std::slice::from_ref(b)));
        }
        assert_eq!(events, vec![(Port::Comm.byte(), b"abcd".to_vec())]);
    }

    #[test]
    fn header_only_frame() {
        let bytes = encode(Port::Status, b"");
        let mut deframer = Deframer::new();
        let events = collect(&mut deframer, &bytes);
        assert_eq!(events, vec![(Port::Status.byte(), Vec::new())]);
    }

    #[test]
    fn max_payload_accepted() {
        let payload = vec![0x5a; MAX_PAYLOAD];
        let bytes = encode(Port::Video, &payload);
        let mut deframer = Deframer::new();
        let events = collect(&mut deframer, &bytes);
        assert_eq!(events, vec![(Port::Video.byte(), payload)]);
    }

    #[test]
    fn oversize_declaration_rejected_without_allocation() {
        let declared = (MAX_PAYLOAD + 1) as u16;
        let header = [
            b'D',
            b'B',
            PROTO_VERSION,
            Port::Proxy.byte(),
            (declared & 0xff) as u8,
            (declared >> 8) as u8,
        ];
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, &header).is_empty());
        assert!(deframer.buf.is_none());

        // The stream recovers at the next chunk.
        let events = collect(&mut deframer, &encode(Port::Proxy, b"ok"));
        assert_eq!(events, vec![(Port::Proxy.byte(), b"ok".to_vec())]);
    }

    #[test]
    fn excess_bytes_drop_partial_frame() {
        let bytes = encode(Port::Proxy, b"hello");
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, &bytes[..HEADER_LEN + 2]).is_empty());
        // Four bytes arrive where only three are outstanding.
        assert!(collect(&mut deframer, b"llox").is_empty());
        assert!(deframer.buf.is_none());
        let events = collect(&mut deframer, &encode(Port::Proxy, b"next"));
        assert_eq!(events, vec![(Port::Proxy.byte(), b"next".to_vec())]);
    }

    #[test]
    fn first_chunk_longer_than_frame_is_dropped() {
        let mut bytes = encode(Port::Proxy, b"ab");
        bytes.extend_from_slice(b"xyz");
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, &bytes).is_empty());
        assert!(deframer.buf.is_none());
    }

    #[test]
    fn junk_chunks_ignored_while_searching() {
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, b"garbage bytes").is_empty());
        assert!(collect(&mut deframer, b"DB").is_empty());
        let wrong_version = [b'D', b'B', PROTO_VERSION + 1, 0x02, 1, 0, 0];
        assert!(collect(&mut deframer, &wrong_version).is_empty());
        assert!(deframer.buf.is_none());
    }

    #[test]
    fn reset_discards_partial_payload() {
        let bytes = encode(Port::Proxy, b"hello");
        let mut deframer = Deframer::new();
        assert!(collect(&mut deframer, &bytes[..HEADER_LEN + 2]).is_empty());
        deframer.reset();
        assert!(deframer.buf.is_none());
        let events = collect(&mut deframer, &encode(Port::Comm, b"pq"));
        assert_eq!(events, vec![(Port::Comm.byte(), b"pq".to_vec())]);
    }

    #[test]
    fn framed_rejects_oversize_payload() {
        let mut frame = FrameBuffer::new();
        assert_eq!(
            frame.framed(Port::Video, MAX_PAYLOAD + 1),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn wake_frame_bytes() {
        assert_eq!(wake_frame(), [b'D', b'B', 1, 5, 1, 0, 0]);
    }

    #[test]
    fn port_bytes_round_trip() {
        for port in [Port::Video, Port::Proxy, Port::Status, Port::Comm, Port::TimeoutWake] {
            assert_eq!(Port::from_byte(port.byte()), Some(port));
        }
        assert_eq!(Port::from_byte(0x00), None);
        assert_eq!(Port::from_byte(0x2a), None);
    }
}
