//! Newline-delimited JSON codec for the peer channel.
//!
//! One UTF-8 JSON object per line. Works over any AsyncRead/AsyncWrite via
//! `FramedRead`/`FramedWrite`.
//!
//! Decoding never fails the stream on bad input: a line that does not parse is
//! logged and skipped, and a line longer than the configured limit is discarded
//! up to its terminating newline. The channel stays usable in both cases.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Codec that frames messages by `\n` and serializes them with JSON.
pub struct JsonLinesCodec<T> {
    max_line_bytes: usize,
    /// Bytes of `src` already scanned for a newline, so partial reads are not
    /// rescanned from the start on every chunk.
    next_index: usize,
    /// Set while skipping the remainder of an oversize line.
    discarding: bool,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
            _phantom: PhantomData,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(pos) = newline else {
                if self.discarding {
                    src.advance(src.len());
                    self.next_index = 0;
                } else if src.len() > self.max_line_bytes {
                    tracing::warn!(
                        buffered_bytes = src.len(),
                        max_line_bytes = self.max_line_bytes,
                        "Line exceeds maximum length, discarding until next newline"
                    );
                    src.advance(src.len());
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let frame = src.split_to(pos + 1);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let mut line = &frame[..pos];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > self.max_line_bytes {
                tracing::warn!(
                    line_bytes = line.len(),
                    max_line_bytes = self.max_line_bytes,
                    "Line exceeds maximum length, dropping"
                );
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice(line) {
                Ok(item) => {
                    tracing::trace!(line_bytes = line.len(), "Decoded frame");
                    return Ok(Some(item));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        line = %String::from_utf8_lossy(line),
                        "Dropping malformed line"
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        if !buf.is_empty() {
            tracing::debug!(
                trailing_bytes = buf.len(),
                "Stream closed mid-line, discarding incomplete fragment"
            );
            buf.clear();
        }
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_line_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "encoded message is {} bytes, limit is {}",
                    json.len(),
                    self.max_line_bytes
                ),
            ));
        }
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{EventName, PeerMessage};
    use serde_json::json;

    fn walk_message() -> PeerMessage {
        PeerMessage::new(
            EventName::namespaced(0, "walkPhase"),
            json!({"x": 1, "y": 2, "z": 3}),
        )
    }

    fn encoded(msg: &PeerMessage) -> BytesMut {
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_writes_one_line() {
        let buf = encoded(&walk_message());
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn line_split_across_two_chunks_yields_one_message() {
        let wire = encoded(&walk_message());
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..20]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[20..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, walk_message());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn several_lines_in_one_chunk_decode_in_order() {
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"eventName\":\"a\",\"eventParams\":1}\n");
        buf.extend_from_slice(b"{\"eventName\":\"b\",\"eventParams\":2}\n{\"eventNa");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.event_name.to_string(), "a");
        assert_eq!(second.event_name.to_string(), "b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"eventNa");
    }

    #[test]
    fn malformed_line_is_dropped_and_stream_continues() {
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{not json}\n");
        buf.extend_from_slice(&encoded(&walk_message()));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, walk_message());
    }

    #[test]
    fn blank_and_crlf_lines_are_tolerated() {
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n  \r\n{\"eventName\":\"ping\",\"eventParams\":null}\r\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.event_name.to_string(), "ping");
    }

    #[test]
    fn oversize_line_is_discarded_up_to_newline() {
        let mut codec = JsonLinesCodec::<PeerMessage>::with_max_line_bytes(64);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 100]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"yyyy\n{\"eventName\":\"ok\",\"eventParams\":0}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.event_name.to_string(), "ok");
    }

    #[test]
    fn encode_rejects_oversize_message() {
        let mut codec = JsonLinesCodec::<PeerMessage>::with_max_line_bytes(16);
        let mut buf = BytesMut::new();
        let err = codec.encode(walk_message(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_discards_incomplete_fragment() {
        let mut codec = JsonLinesCodec::<PeerMessage>::new();
        let mut buf = BytesMut::from(&b"{\"eventName\":\"half"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
