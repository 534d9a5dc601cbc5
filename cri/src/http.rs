//! Minimal HTTP/1.1 framing shared by the engine client and the streaming
//! server.
//!
//! Both sides only need request/response heads, `Content-Length` or chunked
//! bodies and connection hijacking, so the framing is done directly on the
//! socket.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use privrt_core::error::{AdapterError, Result};

/// Maximum size of a request or response head.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A parsed HTTP message head.
#[derive(Debug, Clone)]
pub struct Head {
    /// First line (`GET /path HTTP/1.1` or `HTTP/1.1 200 OK`).
    pub start_line: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

impl Head {
    /// Status code of a response head.
    pub fn status(&self) -> Option<u16> {
        self.start_line.split_whitespace().nth(1)?.parse().ok()
    }

    /// Method and path of a request head.
    pub fn request_target(&self) -> Option<(&str, &str)> {
        let mut parts = self.start_line.split_whitespace();
        let method = parts.next()?;
        let path = parts.next()?;
        Some((method, path))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }
}

/// Read a message head, returning it together with any bytes read past it.
pub async fn read_head<R>(reader: &mut R) -> Result<(Head, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(AdapterError::SerializationError(
                "HTTP head too large".to_string(),
            ));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(AdapterError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before HTTP head was complete",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = parse_head(&String::from_utf8_lossy(&buf[..end]))?;
    let rest = buf[end + 4..].to_vec();
    Ok((head, rest))
}

/// Parse the text of a message head (without the terminating blank line).
pub fn parse_head(text: &str) -> Result<Head> {
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| AdapterError::SerializationError("empty HTTP head".to_string()))?
        .to_string();

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    Ok(Head {
        start_line,
        headers,
    })
}

/// Read a complete body following `head`, starting with already-buffered bytes.
pub async fn read_body<R>(reader: &mut R, head: &Head, mut buffered: Vec<u8>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if let Some(len) = head.content_length() {
        if buffered.len() < len {
            let mut rest = vec![0u8; len - buffered.len()];
            reader.read_exact(&mut rest).await?;
            buffered.extend_from_slice(&rest);
        }
        buffered.truncate(len);
        return Ok(buffered);
    }

    reader.read_to_end(&mut buffered).await?;
    if head.is_chunked() {
        decode_chunked(&buffered)
    } else {
        Ok(buffered)
    }
}

/// Decode a `Transfer-Encoding: chunked` body.
pub fn decode_chunked(data: &[u8]) -> Result<Vec<u8>> {
    let malformed = || AdapterError::SerializationError("malformed chunked body".to_string());

    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    loop {
        let line_end = find_subslice(&data[pos..], b"\r\n").ok_or_else(malformed)? + pos;
        let size_line = std::str::from_utf8(&data[pos..line_end]).map_err(|_| malformed())?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| malformed())?;
        pos = line_end + 2;
        if size == 0 {
            return Ok(out);
        }
        let chunk_end = pos
            .checked_add(size)
            .and_then(|end| end.checked_add(2))
            .ok_or_else(malformed)?;
        if chunk_end > data.len() {
            return Err(malformed());
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

/// Reason phrase for the status codes this crate emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

/// Send a simple plain-text response and leave the connection to be closed.
pub async fn send_response<W>(writer: &mut W, status: u16, body: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body,
    );
    writer.write_all(response.as_bytes()).await
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
