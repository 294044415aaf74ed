//! `Content-Length` framing for JSON-RPC over byte streams.
//!
//! Wire format: `Content-Length: <N>\r\n\r\n<N bytes of UTF-8 JSON>`
//!
//! Reading and writing are independent: [`FrameReader`] owns the read half
//! of a stream, while [`encode_frame`] / [`write_frame`] serialize onto any
//! writer.

use crate::error::{CodecError, CoreResult};
use crate::message::Message;
use crate::size_guard::{SizeCheck, SizeGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Header name, compared case-insensitively on read.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Longest header line accepted, including the line terminator.
pub const MAX_HEADER_LINE: usize = 1024;

/// Encode a message into a complete frame.
pub fn encode_frame(message: &Message) -> CoreResult<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> CoreResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Streaming frame decoder over an async byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    guard: SizeGuard,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, guard: SizeGuard) -> Self {
        Self {
            reader: BufReader::new(reader),
            guard,
        }
    }

    /// Decode the next message.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. Errors other than
    /// [`CodecError::Io`] leave the stream positioned at the next frame, so
    /// the caller may report the error and keep reading. An oversized body is
    /// drained through the [`SizeGuard`] before `TooLarge` is returned.
    pub async fn decode_next(&mut self) -> CoreResult<Option<Message>> {
        let len = match self.read_header().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if let SizeCheck::TooLarge { declared, limit } = self.guard.check(len) {
            warn!(declared, limit, "rejecting oversized message");
            self.guard.drain(&mut self.reader, declared).await?;
            return Err(CodecError::TooLarge { declared, limit });
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;

        let value: serde_json::Value = serde_json::from_slice(&body)?;
        Message::from_value(value)
            .map(Some)
            .map_err(|(id, reason)| CodecError::InvalidMessage { id, reason })
    }

    /// Read header lines up to and including the blank separator.
    ///
    /// Stray blank lines before the header are skipped. Lines after the
    /// `Content-Length` line other than the separator are ignored.
    async fn read_header(&mut self) -> CoreResult<Option<usize>> {
        let first = loop {
            match self.read_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };

        let len = parse_content_length(&first)?;

        loop {
            match self.read_line().await? {
                None => {
                    return Err(CodecError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended inside frame header",
                    )))
                }
                Some(line) if line.is_empty() => break,
                Some(line) => debug!(header = %line, "ignoring extra header line"),
            }
        }

        Ok(Some(len))
    }

    /// Read one `\n`-terminated line without its terminator.
    ///
    /// Returns `None` on EOF before any byte. A line longer than
    /// [`MAX_HEADER_LINE`] is consumed to its end and reported as malformed.
    async fn read_line(&mut self) -> CoreResult<Option<String>> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            if n < MAX_HEADER_LINE {
                return Err(CodecError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside frame header",
                )));
            }
            self.skip_rest_of_line().await?;
            return Err(CodecError::MalformedHeader(format!(
                "header line exceeds {MAX_HEADER_LINE} bytes"
            )));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| CodecError::MalformedHeader("header is not valid UTF-8".into()))
    }

    async fn skip_rest_of_line(&mut self) -> CoreResult<()> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

fn parse_content_length(line: &str) -> CoreResult<usize> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| CodecError::MalformedHeader(format!("expected {CONTENT_LENGTH} header")))?;
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Err(CodecError::MalformedHeader(format!(
            "expected {CONTENT_LENGTH} header"
        )));
    }
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| CodecError::MalformedHeader("invalid Content-Length value".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use serde_json::json;

    fn reader(bytes: &[u8]) -> FrameReader<std::io::Cursor<Vec<u8>>> {
        FrameReader::new(std::io::Cursor::new(bytes.to_vec()), SizeGuard::new(1024, 16))
    }

    fn raw_frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn encode_writes_header_then_body() {
        let msg = Message::request(Some(1.into()), "ping", None);
        let frame = encode_frame(&msg).unwrap();
        let text = String::from_utf8(frame).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
    }

    #[tokio::test]
    async fn decodes_consecutive_frames_and_eof() {
        let mut bytes = raw_frame(r#"{"jsonrpc":"2.0","id":1,"method":"a"}"#);
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":"x","method":"b"}"#));
        let mut r = reader(&bytes);
        let a = r.decode_next().await.unwrap().unwrap();
        let b = r.decode_next().await.unwrap().unwrap();
        assert_eq!(a.method(), "a");
        assert_eq!(b.id, Some(MessageId::String("x".into())));
        assert!(r.decode_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_stray_blank_lines_before_header() {
        let mut bytes = b"\r\n\r\n\n".to_vec();
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":1,"method":"a"}"#));
        let mut r = reader(&bytes);
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "a");
    }

    #[tokio::test]
    async fn ignores_content_type_header() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"a"}"#;
        let bytes = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let mut r = reader(bytes.as_bytes());
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "a");
    }

    #[tokio::test]
    async fn rejects_non_content_length_header_then_resyncs() {
        let mut bytes = b"X-Bogus: 12\r\n\r\n".to_vec();
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":2,"method":"ok"}"#));
        let mut r = reader(&bytes);
        let err = r.decode_next().await.unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader(_)));
        assert!(err.is_recoverable());
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "ok");
    }

    #[tokio::test]
    async fn invalid_json_keeps_stream_in_sync() {
        let mut bytes = raw_frame(r#"{"jsonrpc":"2.0","id":1,"#);
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":3,"method":"next"}"#));
        let mut r = reader(&bytes);
        assert!(matches!(
            r.decode_next().await.unwrap_err(),
            CodecError::InvalidJson(_)
        ));
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "next");
    }

    #[tokio::test]
    async fn oversized_body_is_drained() {
        let big = "x".repeat(5000);
        let mut bytes = raw_frame(&big);
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":4,"method":"after"}"#));
        let mut r = reader(&bytes);
        match r.decode_next().await.unwrap_err() {
            CodecError::TooLarge { declared, limit } => {
                assert_eq!(declared, 5000);
                assert_eq!(limit, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "after");
    }

    #[tokio::test]
    async fn batch_body_is_invalid_message() {
        let bytes = raw_frame(r#"[{"jsonrpc":"2.0","id":1,"method":"a"}]"#);
        let mut r = reader(&bytes);
        assert!(matches!(
            r.decode_next().await.unwrap_err(),
            CodecError::InvalidMessage { id: None, .. }
        ));
    }

    #[tokio::test]
    async fn overlong_header_line_is_malformed() {
        let mut bytes = vec![b'A'; MAX_HEADER_LINE * 3];
        bytes.extend_from_slice(b"\r\n");
        bytes.extend(raw_frame(r#"{"jsonrpc":"2.0","id":5,"method":"later"}"#));
        let mut r = reader(&bytes);
        assert!(matches!(
            r.decode_next().await.unwrap_err(),
            CodecError::MalformedHeader(_)
        ));
        assert_eq!(r.decode_next().await.unwrap().unwrap().method(), "later");
    }

    #[tokio::test]
    async fn truncated_body_is_io_error() {
        let bytes = b"Content-Length: 50\r\n\r\n{\"a\":1}".to_vec();
        let mut r = reader(&bytes);
        let err = r.decode_next().await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn write_frame_round_trips_through_reader() {
        let msg = Message::error_response(Some(MessageId::Number(8)), crate::ErrorCode::Blocked);
        let mut out = Vec::new();
        write_frame(&mut out, &msg).await.unwrap();
        let mut r = reader(&out);
        assert_eq!(r.decode_next().await.unwrap().unwrap(), msg);
    }
}
