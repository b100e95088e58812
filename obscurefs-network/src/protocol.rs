//! ObscureFS shard protocol
//!
//! One request and one response per stream. A request is a command line of at
//! most [`MAX_COMMAND_LEN`] bytes, optionally followed by one JSON line:
//!
//! ```text
//! list_files\n
//! send_file\n{"key":"<shard-id>","value":"<base64>"}\n
//! <shard-id>\n
//! ```
//!
//! Every response is framed as a header line `<STATUS> <len>\n` followed by
//! exactly `len` body bytes, where STATUS is `OK`, `NOT_FOUND` or `ERR`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::prelude::*;
use libp2p::StreamProtocol;
use obscurefs_core::error::{ObscureFsError, Result};
use obscurefs_core::ContentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Protocol name for shard transfers
pub const PROTOCOL_NAME: &str = "/obscurefs/shard/1.0.0";

/// Stream protocol for shard transfers
pub const SHARD_PROTOCOL: StreamProtocol = StreamProtocol::new(PROTOCOL_NAME);

/// Longest accepted command line, newline excluded
pub const MAX_COMMAND_LEN: usize = 256;

/// Largest accepted request (base64 inflates a shard by a third)
pub const MAX_REQUEST_SIZE: usize = 96 * 1024 * 1024;

/// Largest accepted response
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Largest shard a node stores, so every stored shard can be served back
pub const MAX_SHARD_SIZE: usize = MAX_RESPONSE_SIZE;

const CMD_LIST_FILES: &str = "list_files";
const CMD_SEND_FILE: &str = "send_file";
const MAX_HEADER_LEN: usize = 32;

/// A request on the shard protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    /// List the shards held by the remote node
    ListFiles,
    /// Push a shard to the remote node
    SendFile { key: ContentId, value: Bytes },
    /// Fetch a shard by id
    GetShard(ContentId),
}

#[derive(Serialize, Deserialize)]
struct SendFilePayload {
    key: String,
    value: String,
}

impl WireRequest {
    /// Short name for logs
    pub fn command(&self) -> &'static str {
        match self {
            WireRequest::ListFiles => CMD_LIST_FILES,
            WireRequest::SendFile { .. } => CMD_SEND_FILE,
            WireRequest::GetShard(_) => "get_shard",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            WireRequest::ListFiles => Ok(format!("{}\n", CMD_LIST_FILES).into_bytes()),
            WireRequest::GetShard(id) => Ok(format!("{}\n", id).into_bytes()),
            WireRequest::SendFile { key, value } => {
                let payload = SendFilePayload {
                    key: key.to_string(),
                    value: BASE64.encode(value),
                };
                let mut buf = format!("{}\n", CMD_SEND_FILE).into_bytes();
                serde_json::to_writer(&mut buf, &payload)?;
                buf.push(b'\n');
                Ok(buf)
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (line, rest) = split_line(buf, MAX_COMMAND_LEN)
            .ok_or_else(|| ObscureFsError::Protocol("command line too long".to_string()))?;
        let command = std::str::from_utf8(line)
            .map_err(|_| ObscureFsError::Protocol("command is not UTF-8".to_string()))?
            .trim();

        match command {
            CMD_LIST_FILES => Ok(WireRequest::ListFiles),
            CMD_SEND_FILE => {
                let json = trim_ascii(rest);
                if json.is_empty() {
                    return Err(ObscureFsError::Protocol(
                        "send_file without payload".to_string(),
                    ));
                }
                let payload: SendFilePayload = serde_json::from_slice(json)
                    .map_err(|e| ObscureFsError::Protocol(format!("bad send_file payload: {e}")))?;
                let key = ContentId::from_base58(&payload.key)?;
                let value = BASE64
                    .decode(payload.value.as_bytes())
                    .map_err(|e| ObscureFsError::Protocol(format!("bad base64 value: {e}")))?;
                Ok(WireRequest::SendFile {
                    key,
                    value: Bytes::from(value),
                })
            }
            other => Ok(WireRequest::GetShard(ContentId::from_base58(other)?)),
        }
    }
}

/// Outcome carried in a response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    NotFound,
    Error,
}

impl ResponseStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "OK",
            ResponseStatus::NotFound => "NOT_FOUND",
            ResponseStatus::Error => "ERR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ResponseStatus::Ok),
            "NOT_FOUND" => Some(ResponseStatus::NotFound),
            "ERR" => Some(ResponseStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A framed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub status: ResponseStatus,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: ResponseStatus::NotFound,
            body: Bytes::new(),
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self {
            status: ResponseStatus::Error,
            body: Bytes::from(message.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Body of an `OK` frame, or the matching error for the other statuses
    pub fn into_body(self) -> Result<Bytes> {
        match self.status {
            ResponseStatus::Ok => Ok(self.body),
            ResponseStatus::NotFound => Err(ObscureFsError::ShardNotFound(
                "remote reported not found".to_string(),
            )),
            ResponseStatus::Error => Err(ObscureFsError::Protocol(format!(
                "remote error: {}",
                String::from_utf8_lossy(&self.body)
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = format!("{} {}\n", self.status, self.body.len());
        let mut buf = Vec::with_capacity(header.len() + self.body.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (line, body) = split_line(buf, MAX_HEADER_LEN)
            .ok_or_else(|| ObscureFsError::Protocol("missing response header".to_string()))?;
        if line.len() == buf.len() {
            return Err(ObscureFsError::Protocol(
                "response header not terminated".to_string(),
            ));
        }

        let header = std::str::from_utf8(line)
            .map_err(|_| ObscureFsError::Protocol("header is not UTF-8".to_string()))?;
        let (status, len) = header
            .split_once(' ')
            .ok_or_else(|| ObscureFsError::Protocol(format!("malformed header: {header}")))?;
        let status = ResponseStatus::parse(status)
            .ok_or_else(|| ObscureFsError::Protocol(format!("unknown status: {status}")))?;
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| ObscureFsError::Protocol(format!("bad length: {len}")))?;

        if body.len() != len {
            return Err(ObscureFsError::Protocol(format!(
                "body length {} does not match header {}",
                body.len(),
                len
            )));
        }

        Ok(Self {
            status,
            body: Bytes::copy_from_slice(body),
        })
    }
}

/// Split off the first line. Returns `None` when no newline appears within
/// `max_line` bytes of a buffer longer than that.
fn split_line(buf: &[u8], max_line: usize) -> Option<(&[u8], &[u8])> {
    match buf.iter().take(max_line + 1).position(|b| *b == b'\n') {
        Some(pos) => Some((&buf[..pos], &buf[pos + 1..])),
        None if buf.len() <= max_line => Some((buf, &[])),
        None => None,
    }
}

fn trim_ascii(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &buf[start..end]
}

fn invalid_data(err: ObscureFsError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

async fn read_capped<T>(io: &mut T, limit: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let mut limited = io.take(limit as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds {} bytes", limit),
        ));
    }
    Ok(buf)
}

/// Read a whole request from a stream the requester has half-closed
pub async fn read_request<T>(io: &mut T) -> io::Result<WireRequest>
where
    T: AsyncRead + Unpin + Send,
{
    let buf = read_capped(io, MAX_REQUEST_SIZE).await?;
    WireRequest::decode(&buf).map_err(invalid_data)
}

/// Write a request and half-close the stream
pub async fn write_request<T>(io: &mut T, request: &WireRequest) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let buf = request.encode().map_err(invalid_data)?;
    io.write_all(&buf).await?;
    io.close().await
}

pub async fn read_response<T>(io: &mut T) -> io::Result<ResponseFrame>
where
    T: AsyncRead + Unpin + Send,
{
    let buf = read_capped(io, MAX_RESPONSE_SIZE + MAX_HEADER_LEN + 1).await?;
    ResponseFrame::decode(&buf).map_err(invalid_data)
}

pub async fn write_response<T>(io: &mut T, response: &ResponseFrame) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    if response.body.len() > MAX_RESPONSE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("response body exceeds {} bytes", MAX_RESPONSE_SIZE),
        ));
    }
    io.write_all(&response.encode()).await?;
    io.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn test_request_wire_format() {
        assert_eq!(WireRequest::ListFiles.encode().unwrap(), b"list_files\n");

        let id = ContentId::from_data(b"shard");
        assert_eq!(
            WireRequest::GetShard(id).encode().unwrap(),
            format!("{id}\n").into_bytes()
        );

        let send = WireRequest::SendFile {
            key: id,
            value: Bytes::from_static(b"shard"),
        }
        .encode()
        .unwrap();
        let text = String::from_utf8(send).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("send_file"));
        let json: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(json["key"], id.to_string());
        assert_eq!(json["value"], BASE64.encode(b"shard"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_request_decode() {
        assert_eq!(
            WireRequest::decode(b"list_files").unwrap(),
            WireRequest::ListFiles
        );
        assert_eq!(
            WireRequest::decode(b"list_files\n").unwrap(),
            WireRequest::ListFiles
        );

        let id = ContentId::from_data(b"x");
        let raw = format!(
            "send_file\n{{\"key\":\"{}\",\"value\":\"{}\"}}\n",
            id,
            BASE64.encode(b"x")
        );
        assert_eq!(
            WireRequest::decode(raw.as_bytes()).unwrap(),
            WireRequest::SendFile {
                key: id,
                value: Bytes::from_static(b"x")
            }
        );
    }

    #[test]
    fn test_request_decode_errors() {
        assert!(WireRequest::decode(b"send_file\n").is_err());
        assert!(WireRequest::decode(b"send_file\n{\"key\":\"abc\"}\n").is_err());
        assert!(matches!(
            WireRequest::decode(b"not-an-id\n"),
            Err(ObscureFsError::InvalidContentId(_))
        ));

        let long = vec![b'a'; MAX_COMMAND_LEN + 10];
        assert!(matches!(
            WireRequest::decode(&long),
            Err(ObscureFsError::Protocol(_))
        ));
    }

    #[test]
    fn test_response_framing() {
        let frame = ResponseFrame::ok(Bytes::from_static(b"payload"));
        assert_eq!(frame.encode(), b"OK 7\npayload");
        assert_eq!(ResponseFrame::decode(&frame.encode()).unwrap(), frame);

        assert_eq!(ResponseFrame::not_found().encode(), b"NOT_FOUND 0\n");
        let err = ResponseFrame::error("disk full");
        assert_eq!(ResponseFrame::decode(&err.encode()).unwrap(), err);
    }

    #[test]
    fn test_empty_shard_distinct_from_not_found() {
        let empty = ResponseFrame::decode(b"OK 0\n").unwrap();
        let missing = ResponseFrame::decode(b"NOT_FOUND 0\n").unwrap();
        assert!(empty.is_ok());
        assert!(empty.clone().into_body().unwrap().is_empty());
        assert!(!missing.is_ok());
        assert!(missing.into_body().unwrap_err().is_not_found());
    }

    #[test]
    fn test_response_decode_errors() {
        assert!(ResponseFrame::decode(b"OK 10\nshort").is_err());
        assert!(ResponseFrame::decode(b"OK 1\ntoo long").is_err());
        assert!(ResponseFrame::decode(b"MAYBE 0\n").is_err());
        assert!(ResponseFrame::decode(b"OK 0").is_err());
        assert!(ResponseFrame::decode(b"").is_err());
    }

    #[test]
    fn test_largest_shard_fits_both_directions() {
        assert!(MAX_SHARD_SIZE <= MAX_RESPONSE_SIZE);
        // base64 body plus the command line and JSON envelope
        let send_file = MAX_SHARD_SIZE.div_ceil(3) * 4 + MAX_COMMAND_LEN + 128;
        assert!(send_file <= MAX_REQUEST_SIZE);
    }

    #[tokio::test]
    async fn test_stream_helpers() {
        let id = ContentId::from_data(b"stream");
        let request = WireRequest::GetShard(id);

        let mut out = Cursor::new(Vec::new());
        write_request(&mut out, &request).await.unwrap();
        let mut input = Cursor::new(out.into_inner());
        assert_eq!(read_request(&mut input).await.unwrap(), request);

        let response = ResponseFrame::ok(Bytes::from_static(b"bytes"));
        let mut out = Cursor::new(Vec::new());
        write_response(&mut out, &response).await.unwrap();
        let mut input = Cursor::new(out.into_inner());
        assert_eq!(read_response(&mut input).await.unwrap(), response);
    }
}
