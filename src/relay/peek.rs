//! Server name peeking.
//!
//! Recovers the name of the server a client wants to reach by inspecting
//! the first bytes of the connection: the SNI extension of a TLS
//! ClientHello, or the `Host` header of a plain HTTP/1.x request. All
//! inspected bytes are captured and replayed to the remote end, so the
//! stream the destination sees is byte-identical to what the client sent.
//!
//! The parser is bounded: it reads exactly one TLS record (or one request
//! head) and never executes any part of the TLS handshake.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on the ClientHello record length. A legal ClientHello fits
/// comfortably; anything larger is treated as not-TLS to bound buffering.
const MAX_RECORD_LEN: usize = 16 * 1024;

/// Upper bound on a plain HTTP request head.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// TLS record type for handshake messages.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension number of `server_name` (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// `host_name` entry type inside the server_name extension.
const SNI_NAME_TYPE_HOST: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum PeekError {
    #[error("not a TLS handshake")]
    NotTls,
    #[error("no server name in ClientHello")]
    NoServerName,
    #[error("malformed HTTP request: {0}")]
    MalformedRequest(&'static str),
    #[error("no Host header in HTTP request")]
    NoHost,
    #[error("I/O error while peeking: {0}")]
    Io(#[from] io::Error),
}

/// A stream that first replays a captured prefix, then continues reading
/// from the underlying stream. Writes go straight through.
#[derive(Debug)]
pub struct PeekedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// Bytes captured during peeking, in arrival order.
    #[cfg(test)]
    pub fn peeked(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Peeks the server name from the first bytes of `stream`.
///
/// Returns the name together with a stream that yields exactly the bytes
/// the client sent, starting from offset 0. The caller is responsible for
/// bounding the peek with a timeout.
pub async fn peek_server_name<S>(
    stream: S,
    plain_http: bool,
) -> Result<(String, PeekedStream<S>), PeekError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = PeekedStream::new(Vec::with_capacity(1024), stream);

    let server_name = if plain_http {
        peek_http_host(&mut stream).await?
    } else {
        peek_sni(&mut stream).await?
    };

    if server_name.is_empty() {
        return Err(if plain_http {
            PeekError::NoHost
        } else {
            PeekError::NoServerName
        });
    }

    Ok((server_name, stream))
}

/// Reads exactly `target` buffered bytes into the capture buffer, without
/// ever requesting more than needed. Returns false on EOF.
async fn fill_to<S: AsyncRead + Unpin>(
    stream: &mut PeekedStream<S>,
    target: usize,
) -> io::Result<bool> {
    let mut chunk = [0u8; 1024];

    while stream.prefix.len() < target {
        let want = (target - stream.prefix.len()).min(chunk.len());
        let n = stream.inner.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(false);
        }
        stream.prefix.extend_from_slice(&chunk[..n]);
    }

    Ok(true)
}

/// Buffers one TLS record and extracts the SNI host name from it.
async fn peek_sni<S: AsyncRead + Unpin>(stream: &mut PeekedStream<S>) -> Result<String, PeekError> {
    // Record header: type (1), version (2), length (2).
    if !fill_to(stream, 5).await? {
        return Err(PeekError::NotTls);
    }

    if stream.prefix[0] != RECORD_TYPE_HANDSHAKE {
        return Err(PeekError::NotTls);
    }

    let record_len = u16::from_be_bytes([stream.prefix[3], stream.prefix[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(PeekError::NotTls);
    }

    // The ClientHello may arrive in many small segments; keep reading
    // until the full declared record is buffered.
    if !fill_to(stream, 5 + record_len).await? {
        return Err(PeekError::NotTls);
    }

    parse_client_hello(&stream.prefix[..5 + record_len])
}

/// Parses a complete handshake record and returns the first `host_name`
/// entry of the server_name extension.
///
/// The walk is tolerant of unknown extensions, cipher suites and
/// compression methods; it only validates the lengths it needs to skip.
fn parse_client_hello(record: &[u8]) -> Result<String, PeekError> {
    let handshake = &record[5..];

    // Handshake header: type (1), length (3).
    if handshake.len() < 4 || handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(PeekError::NotTls);
    }

    let body = &handshake[4..];

    // Fixed part: client version (2) + random (32).
    if body.len() < 35 {
        return Err(PeekError::NotTls);
    }
    let mut pos = 34;

    // Session ID.
    let session_id_len = body[pos] as usize;
    pos += 1 + session_id_len;
    if pos + 2 > body.len() {
        return Err(PeekError::NotTls);
    }

    // Cipher suites.
    let cipher_suites_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;
    if pos + 1 > body.len() {
        return Err(PeekError::NotTls);
    }

    // Compression methods.
    let compression_len = body[pos] as usize;
    pos += 1 + compression_len;

    // A ClientHello without extensions is legal; it just has no SNI.
    if pos + 2 > body.len() {
        return Err(PeekError::NoServerName);
    }
    let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;

    let extensions_end = (pos + extensions_len).min(body.len());
    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return Err(PeekError::NotTls);
        }

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(&body[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    Err(PeekError::NoServerName)
}

/// Parses the server_name extension payload: a list of typed entries, of
/// which we want the first `host_name`.
fn parse_server_name_extension(data: &[u8]) -> Result<String, PeekError> {
    if data.len() < 2 {
        return Err(PeekError::NotTls);
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let list_end = (2 + list_len).min(data.len());

    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > list_end {
            return Err(PeekError::NotTls);
        }

        if name_type == SNI_NAME_TYPE_HOST {
            let name = std::str::from_utf8(&data[pos..pos + name_len])
                .map_err(|_| PeekError::NotTls)?;
            if name.is_empty() {
                return Err(PeekError::NoServerName);
            }
            return Ok(name.to_string());
        }

        pos += name_len;
    }

    Err(PeekError::NoServerName)
}

/// Buffers an HTTP/1.x request head and extracts the `Host` header.
async fn peek_http_host<S: AsyncRead + Unpin>(
    stream: &mut PeekedStream<S>,
) -> Result<String, PeekError> {
    let mut chunk = [0u8; 1024];

    let head_len = loop {
        if let Some(end) = find_head_end(&stream.prefix) {
            break end;
        }
        if stream.prefix.len() >= MAX_REQUEST_HEAD {
            return Err(PeekError::MalformedRequest("request head too large"));
        }

        let n = stream.inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(PeekError::MalformedRequest("truncated request head"));
        }
        stream.prefix.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&stream.prefix[..head_len])
        .map_err(|_| PeekError::MalformedRequest("request head is not valid UTF-8"))?;

    parse_host_header(head)
}

/// Returns the offset of the end of the request head (exclusive of the
/// blank line) if the buffer contains one.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Validates the request line and returns the Host header value verbatim.
fn parse_host_header(head: &str) -> Result<String, PeekError> {
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or(PeekError::MalformedRequest("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = (parts.next(), parts.next(), parts.next());
    match (method, uri, version) {
        (Some(m), Some(_), Some(v)) if !m.is_empty() && v.starts_with("HTTP/1.") => {}
        _ => return Err(PeekError::MalformedRequest("bad request line")),
    }

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let value = value.trim();
            if value.is_empty() {
                return Err(PeekError::NoHost);
            }
            return Ok(value.to_string());
        }
    }

    Err(PeekError::NoHost)
}
