// Wire format for framing kvmux batches on the network.
//
// A stream carries a sequence of frames. The first frame on every stream is a
// `StreamHello` naming the forwarding target (if any); after that the client
// writes `BatchRequest` frames and the server answers with `BatchResponse`
// frames, correlated by request id.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: u32 = 0x4B564D58; // "KVMX"
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown frame kind {0}")]
    UnknownKind(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("malformed {0} frame")]
    Malformed(&'static str),
}

/// Frame kind discriminator carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    Hello = 1,
    Request = 2,
    Response = 3,
}

impl FrameKind {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Hello),
            2 => Ok(FrameKind::Request),
            3 => Ok(FrameKind::Response),
            other => Err(Error::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: FrameKind,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(kind: FrameKind, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.put_u32(self.magic);
        buf.put_u16(self.version);
        buf.put_u16(self.kind as u16);
        buf.put_u32(self.length);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = FrameKind::from_u16(buf.get_u16())?;
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            kind,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use kvmux_wire::{Frame, FrameKind};
///
/// let frame = Frame::new(FrameKind::Request, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(kind, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// First message on every stream. Names the peer that should ultimately
/// handle requests sent on this stream; `None` means the direct endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamHello {
    pub forwarded_host: Option<String>,
}

impl StreamHello {
    pub fn encode_frame(&self) -> Bytes {
        let host = self.forwarded_host.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(1 + 2 + host.len());
        match self.forwarded_host {
            Some(_) => buf.put_u8(1),
            None => buf.put_u8(0),
        }
        buf.put_u16(host.len() as u16);
        buf.extend_from_slice(host.as_bytes());
        frame_bytes(FrameKind::Hello, buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.header.kind != FrameKind::Hello {
            return Err(Error::Malformed("hello"));
        }
        let mut buf = frame.payload.clone();
        if buf.remaining() < 3 {
            return Err(Error::Malformed("hello"));
        }
        let forwarded = buf.get_u8() == 1;
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Error::Malformed("hello"));
        }
        if !forwarded {
            return Ok(Self {
                forwarded_host: None,
            });
        }
        let host = std::str::from_utf8(&buf.chunk()[..len])
            .map_err(|_| Error::Malformed("hello"))?
            .to_string();
        Ok(Self {
            forwarded_host: Some(host),
        })
    }
}

/// A batch of requests multiplexed onto one stream write.
///
/// `requests` and `request_ids` are parallel vectors; the id at index `i`
/// correlates the response for the payload at index `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub requests: Vec<Bytes>,
    pub request_ids: Vec<u64>,
}

impl BatchRequest {
    pub fn len(&self) -> usize {
        self.request_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }

    pub fn encode_frame(&self) -> Bytes {
        let mut size = 4;
        for payload in &self.requests {
            size += 8 + 4 + payload.len();
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(self.request_ids.len() as u32);
        for (id, payload) in self.request_ids.iter().zip(&self.requests) {
            buf.put_u64(*id);
            buf.put_u32(payload.len() as u32);
            buf.extend_from_slice(payload);
        }
        frame_bytes(FrameKind::Request, buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.header.kind != FrameKind::Request {
            return Err(Error::Malformed("request"));
        }
        let mut buf = frame.payload.clone();
        if buf.remaining() < 4 {
            return Err(Error::Malformed("request"));
        }
        let count = buf.get_u32() as usize;
        let mut batch = BatchRequest {
            requests: Vec::with_capacity(count.min(MAX_PREALLOC)),
            request_ids: Vec::with_capacity(count.min(MAX_PREALLOC)),
        };
        for _ in 0..count {
            if buf.remaining() < 12 {
                return Err(Error::Malformed("request"));
            }
            let id = buf.get_u64();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed("request"));
            }
            batch.request_ids.push(id);
            batch.requests.push(buf.copy_to_bytes(len));
        }
        Ok(batch)
    }
}

/// Server answer carrying zero or more correlated responses plus optional
/// load and health side-channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub request_ids: Vec<u64>,
    pub responses: Vec<Bytes>,
    pub transport_layer_load: u64,
    pub health_feedback: Option<Bytes>,
}

impl BatchResponse {
    pub fn encode_frame(&self) -> Bytes {
        let mut size = 4 + 8 + 1;
        for payload in &self.responses {
            size += 8 + 4 + payload.len();
        }
        if let Some(feedback) = &self.health_feedback {
            size += 4 + feedback.len();
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(self.request_ids.len() as u32);
        for (id, payload) in self.request_ids.iter().zip(&self.responses) {
            buf.put_u64(*id);
            buf.put_u32(payload.len() as u32);
            buf.extend_from_slice(payload);
        }
        buf.put_u64(self.transport_layer_load);
        match &self.health_feedback {
            Some(feedback) => {
                buf.put_u8(1);
                buf.put_u32(feedback.len() as u32);
                buf.extend_from_slice(feedback);
            }
            None => buf.put_u8(0),
        }
        frame_bytes(FrameKind::Response, buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.header.kind != FrameKind::Response {
            return Err(Error::Malformed("response"));
        }
        let mut buf = frame.payload.clone();
        if buf.remaining() < 4 {
            return Err(Error::Malformed("response"));
        }
        let count = buf.get_u32() as usize;
        let mut resp = BatchResponse {
            request_ids: Vec::with_capacity(count.min(MAX_PREALLOC)),
            responses: Vec::with_capacity(count.min(MAX_PREALLOC)),
            ..Default::default()
        };
        for _ in 0..count {
            if buf.remaining() < 12 {
                return Err(Error::Malformed("response"));
            }
            let id = buf.get_u64();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed("response"));
            }
            resp.request_ids.push(id);
            resp.responses.push(buf.copy_to_bytes(len));
        }
        if buf.remaining() < 9 {
            return Err(Error::Malformed("response"));
        }
        resp.transport_layer_load = buf.get_u64();
        if buf.get_u8() == 1 {
            if buf.remaining() < 4 {
                return Err(Error::Malformed("response"));
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed("response"));
            }
            resp.health_feedback = Some(buf.copy_to_bytes(len));
        }
        Ok(resp)
    }
}

// Cap speculative Vec::with_capacity so a lying `count` can't pre-allocate
// unbounded memory; pushes beyond the cap grow normally.
const MAX_PREALLOC: usize = 4096;

fn frame_bytes(kind: FrameKind, payload: Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(FrameHeader::LEN + payload.len());
    FrameHeader::new(kind, payload.len() as u32).encode(&mut buf);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(FrameKind::Request, Bytes::from_static(b"hello")).expect("frame");
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
        assert_eq!(decoded.header.kind, FrameKind::Request);
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEADBEEF);
        buf.put_u16(VERSION);
        buf.put_u16(FrameKind::Request as u16);
        buf.put_u32(0);
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(0xFFFF);
        buf.put_u16(FrameKind::Request as u16);
        buf.put_u32(0);
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(9);
        buf.put_u32(0);
        let err = FrameHeader::decode(buf.freeze()).expect_err("unknown kind");
        assert!(matches!(err, Error::UnknownKind(9)));
    }

    #[test]
    fn hello_direct_and_forwarded() {
        let direct = StreamHello {
            forwarded_host: None,
        };
        let frame = Frame::decode(direct.encode_frame()).expect("decode frame");
        assert_eq!(StreamHello::decode(&frame).expect("decode"), direct);

        let forwarded = StreamHello {
            forwarded_host: Some("peer-2:20160".to_string()),
        };
        let frame = Frame::decode(forwarded.encode_frame()).expect("decode frame");
        assert_eq!(StreamHello::decode(&frame).expect("decode"), forwarded);
    }

    #[test]
    fn batch_request_round_trip() {
        let batch = BatchRequest {
            requests: vec![Bytes::from_static(b"get k1"), Bytes::from_static(b"put k2")],
            request_ids: vec![0, 1],
        };
        let frame = Frame::decode(batch.encode_frame()).expect("decode frame");
        let decoded = BatchRequest::decode(&frame).expect("decode");
        assert_eq!(decoded, batch);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn batch_response_with_side_channels() {
        let resp = BatchResponse {
            request_ids: vec![3, 7],
            responses: vec![Bytes::from_static(b"v1"), Bytes::new()],
            transport_layer_load: 42,
            health_feedback: Some(Bytes::from_static(b"slow-score:12")),
        };
        let frame = Frame::decode(resp.encode_frame()).expect("decode frame");
        let decoded = BatchResponse::decode(&frame).expect("decode");
        assert_eq!(decoded, resp);
    }

    #[test]
    fn batch_request_decode_rejects_truncated_payload() {
        let batch = BatchRequest {
            requests: vec![Bytes::from_static(b"payload")],
            request_ids: vec![1],
        };
        let encoded = batch.encode_frame();
        // Truncate mid-payload but keep the header intact so the length lies.
        let mut broken = BytesMut::from(&encoded[..encoded.len() - 3]);
        let payload_len = (broken.len() - FrameHeader::LEN) as u32;
        broken[8..12].copy_from_slice(&payload_len.to_be_bytes());
        let frame = Frame::decode(broken.freeze()).expect("frame");
        let err = BatchRequest::decode(&frame).expect_err("truncated");
        assert!(matches!(err, Error::Malformed("request")));
    }

    #[test]
    fn batch_response_decode_rejects_wrong_kind() {
        let batch = BatchRequest {
            requests: vec![],
            request_ids: vec![],
        };
        let frame = Frame::decode(batch.encode_frame()).expect("frame");
        let err = BatchResponse::decode(&frame).expect_err("wrong kind");
        assert!(matches!(err, Error::Malformed("response")));
    }
}
