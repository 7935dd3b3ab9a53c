use std::fmt::Write as _;

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, USER_AGENT};
use http::{Method, StatusCode, Uri, Version};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("head not terminated by blank line")]
    Truncated,
    #[error("malformed status line")]
    StatusLine,
    #[error("malformed header line")]
    HeaderLine,
}

/// An outgoing HTTP/1.0 request.
///
/// Only the fields the wire format needs. Chunked encoding is never used,
/// the response end is signalled by connection close.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    /// Plain GET with a `Connection: close` marker so an HTTP/1.0 server
    /// terminates the body with connection close.
    pub fn get(uri: &Uri, user_agent: &str) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("webarc")),
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        Request {
            method: Method::GET,
            uri: uri.clone(),
            headers,
            body: Vec::new(),
        }
    }

    /// Base content type (parameters stripped, lowercased), if any.
    pub fn content_type_base(&self) -> Option<String> {
        let value = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let base = value.split(';').next().unwrap_or("").trim();
        if base.is_empty() {
            None
        } else {
            Some(base.to_ascii_lowercase())
        }
    }

    /// Request line plus headers plus blank line.
    pub fn serialize_head(&self) -> Vec<u8> {
        let mut out = String::new();
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let _ = write!(out, "{} {} HTTP/1.0\r\n", self.method, target);

        // Host first, then the caller headers as the map yields them; the
        // digest is computed over these same serialized bytes
        if let Some(host) = self.uri.host() {
            match self.uri.port_u16() {
                Some(port) if port != 80 => {
                    let _ = write!(out, "Host: {}:{}\r\n", host, port);
                }
                _ => {
                    let _ = write!(out, "Host: {}\r\n", host);
                }
            }
        }
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        }
        if !self.body.is_empty() && !self.headers.contains_key(http::header::CONTENT_LENGTH) {
            let _ = write!(out, "Content-Length: {}\r\n", self.body.len());
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Full wire form: head then body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.serialize_head();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Parsed status line and headers of a response, plus how many bytes of the
/// raw stream the head occupied.
#[derive(Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub head_len: usize,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<ResponseHead, HttpError> {
        let end = find_head_end(buf).ok_or(HttpError::Truncated)?;
        let head = std::str::from_utf8(&buf[..end]).map_err(|_| HttpError::HeaderLine)?;

        let mut lines = head.split("\r\n");
        let status_line = lines.next().ok_or(HttpError::StatusLine)?;
        let (version, status) = parse_status_line(status_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(HttpError::HeaderLine)?;
            let name =
                HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| HttpError::HeaderLine)?;
            let value =
                HeaderValue::from_str(value.trim()).map_err(|_| HttpError::HeaderLine)?;
            headers.append(name, value);
        }

        Ok(ResponseHead {
            version,
            status,
            headers,
            head_len: end + 4,
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<(Version, StatusCode), HttpError> {
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.0") => Version::HTTP_10,
        Some("HTTP/1.1") => Version::HTTP_11,
        _ => return Err(HttpError::StatusLine),
    };
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(HttpError::StatusLine)?;
    Ok((version, status))
}

#[cfg(test)]
mod test_request {
    use super::*;

    #[test]
    fn get_serialization() {
        let uri: Uri = "http://example.org/a/b?q=1".parse().unwrap();
        let request = Request::get(&uri, "test-agent/1.0");

        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.starts_with("GET /a/b?q=1 HTTP/1.0\r\nHost: example.org\r\n"));
        assert!(head.contains("user-agent: test-agent/1.0\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn non_default_port_lands_in_host() {
        let uri: Uri = "http://example.org:8080/".parse().unwrap();
        let request = Request::get(&uri, "a");

        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.contains("Host: example.org:8080\r\n"));
    }

    #[test]
    fn body_implies_content_length() {
        let uri: Uri = "http://example.org/submit".parse().unwrap();
        let mut request = Request::get(&uri, "a");
        request.method = Method::POST;
        request.body = b"a=1".to_vec();

        let wire = String::from_utf8(request.serialize()).unwrap();
        assert!(wire.starts_with("POST /submit HTTP/1.0\r\n"));
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\na=1"));
    }

    #[test]
    fn content_type_base_strips_parameters() {
        let uri: Uri = "http://example.org/".parse().unwrap();
        let mut request = Request::get(&uri, "a");
        request.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Application/JSON; charset=utf-8"),
        );
        assert_eq!(request.content_type_base().unwrap(), "application/json");
    }
}
