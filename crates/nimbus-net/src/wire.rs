//! HTTP/1.1 framing: request head encoding and response parsing.

use std::io::Write;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use url::Url;

use crate::HttpError;

/// Longest status, header, chunk-size or trailer line accepted.
pub(crate) const MAX_LINE_BYTES: u64 = 8 * 1024;

/// Largest response body accepted, whatever the framing.
pub(crate) const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Response before redirect handling.
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Serialize the request line and headers.
pub(crate) fn encode_head(
    method: &Method,
    url: &Url,
    host: &str,
    user_agent: &str,
    headers: &HeaderMap,
    body_len: Option<usize>,
) -> Result<Vec<u8>, HttpError> {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let host_header = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut head = Vec::new();
    write!(head, "{} {} HTTP/1.1\r\n", method, target)?;
    write!(head, "Host: {}\r\n", host_header)?;
    write!(head, "User-Agent: {}\r\n", user_agent)?;
    if !headers.contains_key(http::header::ACCEPT) {
        write!(head, "Accept: */*\r\n")?;
    }
    write!(head, "Connection: close\r\n")?;

    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            write!(head, "{}: {}\r\n", name, v)?;
        }
    }

    if let Some(len) = body_len {
        write!(head, "Content-Length: {}\r\n", len)?;
    }

    write!(head, "\r\n")?;
    Ok(head)
}

/// Write the request and read a complete response.
pub(crate) async fn round_trip<S>(
    stream: S,
    head: &[u8],
    body: Option<&Bytes>,
    method: &Method,
) -> Result<RawResponse, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    writer.write_all(head).await?;
    if let Some(b) = body {
        writer.write_all(b).await?;
    }
    writer.flush().await?;

    let status_line = read_line_limited(&mut reader).await?;
    let (version, status) = parse_status_line(&status_line)?;

    let headers = read_headers(&mut reader).await?;

    let body = if has_body(method, status) {
        read_body(&mut reader, &headers).await?
    } else {
        Bytes::new()
    };

    Ok(RawResponse {
        status,
        version,
        headers,
        body,
    })
}

/// HEAD, 1xx, 204 and 304 responses never carry a body.
fn has_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Parse HTTP status line.
pub(crate) fn parse_status_line(line: &str) -> Result<(Version, StatusCode), HttpError> {
    let mut parts = line.split_whitespace();
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(HttpError::InvalidResponse("Invalid status line".to_string()));
    };

    let version = match version {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
        _ => Version::HTTP_11,
    };

    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| HttpError::InvalidResponse(format!("Invalid status code: {}", code)))?;

    Ok((version, status))
}

/// Parse one `Name: value` header line.
pub(crate) fn parse_header_line(line: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = line.split_once(':')?;
    let name = HeaderName::try_from(name.trim()).ok()?;
    let value = HeaderValue::try_from(value.trim()).ok()?;
    Some((name, value))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line_limited(reader).await?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        // Repeated headers (Set-Cookie, Vary) are kept, not overwritten.
        if let Some((name, value)) = parse_header_line(line) {
            headers.append(name, value);
        }
    }
    Ok(headers)
}

/// Read response body based on headers.
async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &HeaderMap,
) -> Result<Bytes, HttpError> {
    let chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        return read_chunked_body(reader).await;
    }

    if let Some(len) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<usize>().ok())
    {
        if len as u64 > MAX_BODY_BYTES {
            return Err(HttpError::InvalidResponse(format!(
                "Content-Length {} exceeds limit",
                len
            )));
        }
        let mut buf = Vec::new();
        read_exactly(reader, len as u64, &mut buf).await?;
        return Ok(Bytes::from(buf));
    }

    let mut buf = Vec::new();
    (&mut *reader).take(MAX_BODY_BYTES + 1).read_to_end(&mut buf).await?;
    if buf.len() as u64 > MAX_BODY_BYTES {
        return Err(HttpError::InvalidResponse("Body exceeds limit".to_string()));
    }
    Ok(Bytes::from(buf))
}

/// One line, newline included. An empty string means EOF.
async fn read_line_limited<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, HttpError> {
    let mut line = String::new();
    let read = (&mut *reader).take(MAX_LINE_BYTES + 1).read_line(&mut line).await?;
    if read as u64 > MAX_LINE_BYTES {
        return Err(HttpError::InvalidResponse("Line exceeds limit".to_string()));
    }
    Ok(line)
}

/// Append exactly `len` bytes to `buf`, growing it as data arrives.
async fn read_exactly<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
    buf: &mut Vec<u8>,
) -> Result<(), HttpError> {
    let read = (&mut *reader).take(len).read_to_end(buf).await?;
    if (read as u64) < len {
        return Err(HttpError::InvalidResponse("Body ended early".to_string()));
    }
    Ok(())
}

/// Read chunked transfer encoding body.
async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Bytes, HttpError> {
    let mut body = Vec::new();

    loop {
        let size_line = read_line_limited(reader).await?;

        // Chunk extensions (`1a;name=value`) are ignored.
        let size_field = size_line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_field.trim(), 16)
            .map_err(|_| HttpError::InvalidResponse("Invalid chunk size".to_string()))?;

        if size == 0 {
            // Trailers, up to the blank line.
            loop {
                let trailer = read_line_limited(reader).await?;
                if trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        if (body.len() as u64).saturating_add(size as u64) > MAX_BODY_BYTES {
            return Err(HttpError::InvalidResponse("Chunked body exceeds limit".to_string()));
        }
        read_exactly(reader, size as u64, &mut body).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }

    Ok(Bytes::from(body))
}
