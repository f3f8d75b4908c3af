//! Newline-delimited framing for agent sockets.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Splits a byte stream on `\n` and encodes values as one JSON line each.
///
/// Decoding yields trimmed, non-empty lines. Partial lines stay buffered
/// until the rest arrives, so chunk boundaries never change the output.
/// The buffer is unbounded.
#[derive(Debug, Clone, Default)]
pub struct LineCodec {
    /// Bytes already scanned without finding a delimiter.
    next_index: usize,
}

impl LineCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { next_index: 0 }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = buf.len();
                return Ok(None);
            };

            let frame = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let text = String::from_utf8_lossy(&frame[..frame.len() - 1]);
            let line = text.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_owned()));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if !buf.is_empty() {
            tracing::debug!(bytes = buf.len(), "Discarding partial frame at end of stream");
            buf.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::protocol::ServerMessage;

    const STREAM: &[u8] =
        b"{\"type\":\"pong\"}\n\n  {\"a\":\"h\xc3\xa9\"}\r\n{\"b\":\"x\\ny\"}\n  \n{\"c\":3}\npartial";

    fn expected() -> Vec<String> {
        vec![
            r#"{"type":"pong"}"#.to_owned(),
            "{\"a\":\"h\u{e9}\"}".to_owned(),
            r#"{"b":"x\ny"}"#.to_owned(),
            r#"{"c":3}"#.to_owned(),
        ]
    }

    fn decode_chunks(chunks: &[&[u8]]) -> (Vec<String>, usize) {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        (lines, buf.len())
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let (whole, rest) = decode_chunks(&[STREAM]);
        assert_eq!(whole, expected());
        assert_eq!(rest, b"partial".len());

        for i in 0..=STREAM.len() {
            for j in i..=STREAM.len() {
                let (lines, rest) = decode_chunks(&[&STREAM[..i], &STREAM[i..j], &STREAM[j..]]);
                assert_eq!(lines, expected(), "split at {i}/{j}");
                assert_eq!(rest, b"partial".len());
            }
        }
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (lines, _) = decode_chunks(&[b"{\"x\":\"\xff\"}\n"]);
        assert_eq!(lines, vec!["{\"x\":\"\u{fffd}\"}".to_owned()]);
    }

    #[tokio::test]
    async fn test_framed_read_over_split_socket_reads() {
        let io = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"client_info\",\"hostname\":\"bo")
            .read(b"x1\"}\n{\"type\":\"pong\"}\n{\"type\":")
            .read(b"\"shell_output\",\"data\":\"YW5hCg==\"}\n{\"trailing")
            .build();

        let lines: Vec<String> = FramedRead::new(io, LineCodec::new())
            .map(|res| res.unwrap())
            .collect()
            .await;

        assert_eq!(
            lines,
            vec![
                r#"{"type":"client_info","hostname":"box1"}"#.to_owned(),
                r#"{"type":"pong"}"#.to_owned(),
                r#"{"type":"shell_output","data":"YW5hCg=="}"#.to_owned(),
            ]
        );
    }

    #[test]
    fn test_encode_appends_delimiter() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                ServerMessage::Command {
                    data: "echo a\nb".into(),
                    timestamp: 1,
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }
}
