use std::fmt;
use std::fs::File;
use std::io::{Cursor, Error, Read};
use std::net::IpAddr;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::hash::Digest;

/// Every record body is followed by exactly two CRLF pairs, compressed or not.
pub const TRAILER: &[u8] = b"\r\n\r\n";

pub const VERSION_LINE: &str = "WARC/1.1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Request,
    Response,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Request => write!(f, "request"),
            RecordKind::Response => write!(f, "response"),
        }
    }
}

/// Why a response body stopped before natural stream end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationReason {
    /// Byte budget tripped.
    Length,
    /// Wall-clock budget tripped.
    Time,
    /// Interrupted by writer close.
    Unspecified,
}

impl fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncationReason::Length => write!(f, "length"),
            TruncationReason::Time => write!(f, "time"),
            TruncationReason::Unspecified => write!(f, "unspecified"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> RecordId {
        RecordId(Uuid::new_v4())
    }

    pub(crate) fn from_uuid(uuid: Uuid) -> RecordId {
        RecordId(uuid)
    }
}

impl Default for RecordId {
    fn default() -> RecordId {
        RecordId::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<urn:uuid:{}>", self.0)
    }
}

enum BodySource {
    Bytes(Cursor<Vec<u8>>),
    Spool(File),
}

/// Record body with a length known up front, so the header's Content-Length
/// can be emitted before the body bytes are streamed.
pub struct Body {
    len: u64,
    source: BodySource,
}

impl Body {
    pub fn bytes(data: Vec<u8>) -> Body {
        Body {
            len: data.len() as u64,
            source: BodySource::Bytes(Cursor::new(data)),
        }
    }

    /// Spool-backed body. The file must be positioned at the start of the
    /// body and `len` must match the bytes readable from there.
    pub fn spool(file: File, len: u64) -> Body {
        Body {
            len,
            source: BodySource::Spool(file),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.source {
            BodySource::Bytes(cursor) => cursor.read(buf),
            BodySource::Spool(file) => file.read(buf),
        }
    }
}

/// One self-describing archive record: header metadata plus a body.
pub struct Record {
    kind: RecordKind,
    id: RecordId,
    date: OffsetDateTime,
    target_uri: String,
    content_type: String,
    block_digest: Option<Digest>,
    payload_digest: Option<Digest>,
    truncated: Option<TruncationReason>,
    ip_address: Option<IpAddr>,
    concurrent_to: Option<RecordId>,
    body: Body,
}

impl Record {
    pub fn request(target_uri: &str) -> RecordBuilder {
        RecordBuilder::new(RecordKind::Request, target_uri)
    }

    pub fn response(target_uri: &str) -> RecordBuilder {
        RecordBuilder::new(RecordKind::Response, target_uri)
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn date(&self) -> OffsetDateTime {
        self.date
    }

    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn block_digest(&self) -> Option<&Digest> {
        self.block_digest.as_ref()
    }

    pub fn payload_digest(&self) -> Option<&Digest> {
        self.payload_digest.as_ref()
    }

    pub fn truncated(&self) -> Option<TruncationReason> {
        self.truncated
    }

    pub fn ip_address(&self) -> Option<IpAddr> {
        self.ip_address
    }

    pub fn concurrent_to(&self) -> Option<&RecordId> {
        self.concurrent_to.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Serializes the header block in a fixed, deterministic field order.
    /// Optional fields are omitted entirely when absent.
    pub fn serialize_header(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(VERSION_LINE);
        out.push_str("\r\n");
        field(&mut out, "WARC-Type", &self.kind);
        field(&mut out, "WARC-Record-ID", &self.id);
        // Dates can carry sub-second precision, Rfc3339 formatting of a UTC
        // timestamp cannot fail
        let date = self
            .date
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
        field(&mut out, "WARC-Date", &date);
        field(&mut out, "WARC-Target-URI", &self.target_uri);
        if let Some(ip) = &self.ip_address {
            field(&mut out, "WARC-IP-Address", ip);
        }
        if let Some(concurrent_to) = &self.concurrent_to {
            field(&mut out, "WARC-Concurrent-To", concurrent_to);
        }
        if let Some(digest) = &self.block_digest {
            field(&mut out, "WARC-Block-Digest", digest);
        }
        if let Some(digest) = &self.payload_digest {
            field(&mut out, "WARC-Payload-Digest", digest);
        }
        if let Some(reason) = &self.truncated {
            field(&mut out, "WARC-Truncated", reason);
        }
        field(&mut out, "Content-Type", &self.content_type);
        field(&mut out, "Content-Length", &self.body.len());
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn field(out: &mut String, name: &str, value: &dyn fmt::Display) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value.to_string());
    out.push_str("\r\n");
}

pub struct RecordBuilder {
    kind: RecordKind,
    id: RecordId,
    date: OffsetDateTime,
    target_uri: String,
    block_digest: Option<Digest>,
    payload_digest: Option<Digest>,
    truncated: Option<TruncationReason>,
    ip_address: Option<IpAddr>,
    concurrent_to: Option<RecordId>,
}

impl RecordBuilder {
    fn new(kind: RecordKind, target_uri: &str) -> RecordBuilder {
        RecordBuilder {
            kind,
            id: RecordId::new(),
            date: OffsetDateTime::now_utc(),
            target_uri: target_uri.to_string(),
            block_digest: None,
            payload_digest: None,
            truncated: None,
            ip_address: None,
            concurrent_to: None,
        }
    }

    pub fn id(mut self, id: RecordId) -> RecordBuilder {
        self.id = id;
        self
    }

    pub fn date(mut self, date: OffsetDateTime) -> RecordBuilder {
        self.date = date;
        self
    }

    pub fn block_digest(mut self, digest: Digest) -> RecordBuilder {
        self.block_digest = Some(digest);
        self
    }

    pub fn payload_digest(mut self, digest: Digest) -> RecordBuilder {
        self.payload_digest = Some(digest);
        self
    }

    pub fn truncated(mut self, reason: TruncationReason) -> RecordBuilder {
        self.truncated = Some(reason);
        self
    }

    pub fn ip_address(mut self, ip: IpAddr) -> RecordBuilder {
        self.ip_address = Some(ip);
        self
    }

    pub fn concurrent_to(mut self, id: RecordId) -> RecordBuilder {
        self.concurrent_to = Some(id);
        self
    }

    pub fn body(self, content_type: &str, body: Body) -> Record {
        Record {
            kind: self.kind,
            id: self.id,
            date: self.date,
            target_uri: self.target_uri,
            content_type: content_type.to_string(),
            block_digest: self.block_digest,
            payload_digest: self.payload_digest,
            truncated: self.truncated,
            ip_address: self.ip_address,
            concurrent_to: self.concurrent_to,
            body,
        }
    }
}
