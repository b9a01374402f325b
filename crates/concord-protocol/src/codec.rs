//! Binary codec for envelope framing
//!
//! Frames are `[4-byte big-endian length][payload]`; the first payload byte
//! is the envelope kind tag. All variable fields are length-prefixed,
//! integers are big-endian. Decoding is total: malformed input becomes
//! [`ProtocolError::MalformedFrame`], never a panic.

use bytes::{Buf, BufMut, BytesMut};
use concord_crypto::{Fingerprint, SealedKey, SealedPayload};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Body, Content, Envelope, PeerId, Target};
use crate::error::ProtocolError;
use crate::Result;

/// Maximum payload size per frame (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_RESPONSE_ERROR: u8 = 3;
const KIND_NOTIFICATION: u8 = 4;
const KIND_BROADCAST: u8 = 5;
const KIND_ERROR: u8 = 6;

const TARGET_SERVER: u8 = 0;
const TARGET_PEER: u8 = 1;
const TARGET_ALL: u8 = 2;

const BODY_CLEAR: u8 = 0;
const BODY_SEALED: u8 = 1;

/// Envelope codec over a length-delimited byte stream
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let payload = encode_envelope(&envelope)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len);
        decode_envelope(&frame).map(Some)
    }
}

/// Serialize one envelope payload (without the outer length prefix)
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    match envelope {
        Envelope::Request {
            id,
            origin,
            target,
            body,
        } => {
            buf.put_u8(KIND_REQUEST);
            buf.put_u64(*id);
            put_origin(&mut buf, origin)?;
            put_target(&mut buf, target)?;
            put_body(&mut buf, body)?;
        }
        Envelope::Response {
            id,
            origin,
            target,
            body,
        } => {
            buf.put_u8(KIND_RESPONSE);
            buf.put_u64(*id);
            put_origin(&mut buf, origin)?;
            put_target(&mut buf, target)?;
            put_body(&mut buf, body)?;
        }
        Envelope::ResponseError {
            id,
            origin,
            target,
            body,
        } => {
            buf.put_u8(KIND_RESPONSE_ERROR);
            buf.put_u64(*id);
            put_origin(&mut buf, origin)?;
            put_target(&mut buf, target)?;
            put_body(&mut buf, body)?;
        }
        Envelope::Notification {
            origin,
            target,
            body,
        } => {
            buf.put_u8(KIND_NOTIFICATION);
            put_origin(&mut buf, origin)?;
            put_target(&mut buf, target)?;
            put_body(&mut buf, body)?;
        }
        Envelope::Broadcast { origin, body } => {
            buf.put_u8(KIND_BROADCAST);
            put_origin(&mut buf, origin)?;
            put_body(&mut buf, body)?;
        }
        Envelope::Error { origin, body } => {
            buf.put_u8(KIND_ERROR);
            put_origin(&mut buf, origin)?;
            put_body(&mut buf, body)?;
        }
    }
    Ok(buf.to_vec())
}

/// Parse one envelope payload (without the outer length prefix)
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope> {
    let mut r = FrameReader::new(frame);
    let kind = r.get_u8()?;
    let envelope = match kind {
        KIND_REQUEST => {
            let id = r.get_u64()?;
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let body = r.get_body()?;
            Envelope::Request {
                id,
                origin,
                target,
                body,
            }
        }
        KIND_RESPONSE => {
            let id = r.get_u64()?;
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let body = r.get_body()?;
            Envelope::Response {
                id,
                origin,
                target,
                body,
            }
        }
        KIND_RESPONSE_ERROR => {
            let id = r.get_u64()?;
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let body = r.get_body()?;
            Envelope::ResponseError {
                id,
                origin,
                target,
                body,
            }
        }
        KIND_NOTIFICATION => {
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let body = r.get_body()?;
            Envelope::Notification {
                origin,
                target,
                body,
            }
        }
        KIND_BROADCAST => {
            let origin = r.get_origin()?;
            let body = r.get_body()?;
            Envelope::Broadcast { origin, body }
        }
        KIND_ERROR => {
            let origin = r.get_origin()?;
            let body = r.get_body()?;
            Envelope::Error { origin, body }
        }
        other => {
            return Err(ProtocolError::MalformedFrame(format!(
                "unknown envelope kind {other}"
            )))
        }
    };
    r.finish()?;
    Ok(envelope)
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::Encode(format!(
            "string field too long ({} bytes)",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) -> Result<()> {
    if b.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Encode(format!(
            "byte field too long ({} bytes)",
            b.len()
        )));
    }
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
    Ok(())
}

fn put_origin(buf: &mut BytesMut, origin: &Option<PeerId>) -> Result<()> {
    put_str(buf, origin.as_ref().map(PeerId::as_str).unwrap_or(""))
}

fn put_target(buf: &mut BytesMut, target: &Target) -> Result<()> {
    match target {
        Target::Server => buf.put_u8(TARGET_SERVER),
        Target::Peer(id) => {
            buf.put_u8(TARGET_PEER);
            put_str(buf, id.as_str())?;
        }
        Target::All => buf.put_u8(TARGET_ALL),
    }
    Ok(())
}

fn put_body(buf: &mut BytesMut, body: &Body) -> Result<()> {
    match body {
        Body::Clear(content) => {
            buf.put_u8(BODY_CLEAR);
            put_str(buf, &content.method)?;
            put_bytes(buf, &content.payload)?;
        }
        Body::Sealed(payload) => {
            buf.put_u8(BODY_SEALED);
            if payload.keys.len() > u16::MAX as usize {
                return Err(ProtocolError::Encode(format!(
                    "too many sealed keys ({})",
                    payload.keys.len()
                )));
            }
            buf.put_u16(payload.keys.len() as u16);
            for key in &payload.keys {
                buf.put_slice(&key.fingerprint.0);
                buf.put_slice(&key.ephemeral);
                buf.put_slice(&key.nonce);
                put_bytes(buf, &key.wrapped)?;
            }
            buf.put_slice(&payload.nonce);
            buf.put_slice(&payload.signature);
            put_bytes(buf, &payload.ciphertext)?;
        }
    }
    Ok(())
}

/// Cursor over one frame's bytes with checked reads
struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ProtocolError::MalformedFrame(format!(
                "frame truncated: wanted {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(b);
        Ok(raw)
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::MalformedFrame("string field is not UTF-8".into()))
    }

    fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn get_origin(&mut self) -> Result<Option<PeerId>> {
        let s = self.get_str()?;
        Ok(if s.is_empty() { None } else { Some(PeerId(s)) })
    }

    fn get_target(&mut self) -> Result<Target> {
        match self.get_u8()? {
            TARGET_SERVER => Ok(Target::Server),
            TARGET_PEER => {
                let id = self.get_str()?;
                if id.is_empty() {
                    return Err(ProtocolError::MalformedFrame("empty target peer id".into()));
                }
                Ok(Target::Peer(PeerId(id)))
            }
            TARGET_ALL => Ok(Target::All),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown target tag {other}"
            ))),
        }
    }

    fn get_body(&mut self) -> Result<Body> {
        match self.get_u8()? {
            BODY_CLEAR => {
                let method = self.get_str()?;
                let payload = self.get_bytes()?;
                Ok(Body::Clear(Content { method, payload }))
            }
            BODY_SEALED => {
                let key_count = self.get_u16()? as usize;
                let mut keys = Vec::with_capacity(key_count.min(64));
                for _ in 0..key_count {
                    let fingerprint = Fingerprint(self.get_array::<32>()?);
                    let ephemeral = self.get_array::<32>()?;
                    let nonce = self.get_array::<12>()?;
                    let wrapped = self.get_bytes()?;
                    keys.push(SealedKey {
                        fingerprint,
                        ephemeral,
                        nonce,
                        wrapped,
                    });
                }
                let nonce = self.get_array::<12>()?;
                let signature = self.get_array::<64>()?;
                let ciphertext = self.get_bytes()?;
                Ok(Body::Sealed(SealedPayload {
                    keys,
                    nonce,
                    signature,
                    ciphertext,
                }))
            }
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown body tag {other}"
            ))),
        }
    }

    fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MalformedFrame(format!(
                "{} trailing bytes after envelope",
                self.buf.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear(method: &str) -> Body {
        Body::Clear(Content {
            method: method.to_string(),
            payload: vec![1, 2, 3],
        })
    }

    fn sealed() -> Body {
        Body::Sealed(SealedPayload {
            keys: vec![
                SealedKey {
                    fingerprint: Fingerprint([0xAA; 32]),
                    ephemeral: [0xBB; 32],
                    nonce: [0xCC; 12],
                    wrapped: vec![9; 48],
                },
                SealedKey {
                    fingerprint: Fingerprint([0xAD; 32]),
                    ephemeral: [0xBE; 32],
                    nonce: [0xCF; 12],
                    wrapped: vec![7; 48],
                },
            ],
            nonce: [0x11; 12],
            signature: [0x22; 64],
            ciphertext: vec![0xEE; 100],
        })
    }

    fn samples() -> Vec<Envelope> {
        vec![
            Envelope::Request {
                id: 1,
                origin: None,
                target: Target::Server,
                body: clear("peer.init"),
            },
            Envelope::Request {
                id: u64::MAX,
                origin: Some(PeerId::from("alice")),
                target: Target::Peer(PeerId::from("bob")),
                body: sealed(),
            },
            Envelope::Response {
                id: 42,
                origin: Some(PeerId::from("bob")),
                target: Target::Peer(PeerId::from("alice")),
                body: sealed(),
            },
            Envelope::ResponseError {
                id: 43,
                origin: Some(PeerId::from("bob")),
                target: Target::Peer(PeerId::from("alice")),
                body: sealed(),
            },
            Envelope::Notification {
                origin: Some(PeerId::from("srv")),
                target: Target::All,
                body: sealed(),
            },
            Envelope::Broadcast {
                origin: Some(PeerId::from("host")),
                body: sealed(),
            },
            Envelope::Error {
                origin: None,
                body: clear("oops"),
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let mut codec = EnvelopeCodec::new();
        for envelope in samples() {
            let mut buf = BytesMut::new();
            codec.encode(envelope.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, envelope);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let samples = samples();
        codec.encode(samples[0].clone(), &mut buf).unwrap();
        codec.encode(samples[1].clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), samples[0]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), samples[1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_feed_waits() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec.encode(samples()[1].clone(), &mut full).unwrap();

        let mut buf = BytesMut::new();
        let chunks: Vec<_> = full.chunks(7).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            buf.extend_from_slice(chunk);
            if i + 1 < chunks.len() {
                // Nothing decodes until the final chunk lands
                assert!(codec.decode(&mut buf).unwrap().is_none());
            }
        }
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), samples()[1]);
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let payload = encode_envelope(&samples()[0]).unwrap();
        let mut with_junk = payload.clone();
        with_junk.push(0xFF);

        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(with_junk.len() as u32);
        buf.extend_from_slice(&with_junk);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let payload = encode_envelope(&samples()[1]).unwrap();
        let cut = &payload[..payload.len() - 3];

        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(cut.len() as u32);
        buf.extend_from_slice(cut);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE as u32) + 1);
        buf.put_u8(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_target_peer_id_rejected() {
        // Target::Peer with a zero-length id cannot be produced by the
        // encoder; a hand-built frame carrying one must be malformed.
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_NOTIFICATION);
        put_origin(&mut buf, &None).unwrap();
        buf.put_u8(TARGET_PEER);
        buf.put_u16(0);
        put_body(&mut buf, &clear("m")).unwrap();

        assert!(matches!(
            decode_envelope(&buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_non_utf8_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_BROADCAST);
        buf.put_u16(2);
        buf.put_slice(&[0xFF, 0xFE]);
        put_body(&mut buf, &clear("m")).unwrap();

        assert!(matches!(
            decode_envelope(&buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }
}
