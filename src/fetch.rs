use std::cmp;
use std::fs::File;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, TcpStream};
use std::time::{Duration, Instant};

use http::Uri;
use log::{debug, warn};
use thiserror::Error as ThisError;
use time::OffsetDateTime;

use crate::hash::{Digest, Hasher};
use crate::message::{Request, ResponseHead};
use crate::record::{Body, Record, TruncationReason};
use crate::writer::{Writer, CHUNK_SIZE};

const REQUEST_CONTENT_TYPE: &str = "application/http;msgtype=request";
const RESPONSE_CONTENT_TYPE: &str = "application/http;msgtype=response";

// How far into the spool the response head may reach before the payload
// digest gives up
const HEAD_WINDOW: u64 = 64 * 1024;

#[derive(ThisError, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Io(#[from] Error),
    #[error("writer is closing")]
    Closing,
    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),
    #[error("uri has no host: {0}")]
    MissingHost(String),
}

/// Knobs for a single fetch.
pub struct FetchOptions {
    user_agent: String,
    read_timeout: Duration,
    max_length: u64,
    max_time: Duration,
    copy_to: Option<Box<dyn Write + Send>>,
}

impl FetchOptions {
    pub fn new() -> FetchOptions {
        FetchOptions {
            user_agent: format!("webarc/{}", env!("CARGO_PKG_VERSION")),
            read_timeout: Duration::from_secs(60),
            max_length: 0,
            max_time: Duration::ZERO,
            copy_to: None,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> FetchOptions {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Bounds a single socket read, not the whole fetch.
    pub fn read_timeout(mut self, timeout: Duration) -> FetchOptions {
        self.read_timeout = timeout;
        self
    }

    /// Byte budget over the raw response bytes. 0 means unbounded.
    pub fn max_length(mut self, max_length: u64) -> FetchOptions {
        self.max_length = max_length;
        self
    }

    /// Wall-clock budget for the whole fetch. Zero means unbounded. Checked
    /// once per chunk, so a fetch can overshoot by up to one chunk.
    pub fn max_time(mut self, max_time: Duration) -> FetchOptions {
        self.max_time = max_time;
        self
    }

    /// Receives a copy of the raw response bytes. Tee failures never abort
    /// the fetch.
    pub fn copy_to(mut self, sink: Box<dyn Write + Send>) -> FetchOptions {
        self.copy_to = Some(sink);
        self
    }
}

impl Default for FetchOptions {
    fn default() -> FetchOptions {
        FetchOptions::new()
    }
}

/// Outcome of a fetch. Both records have already been written to the
/// archive, their bodies are consumed; the header metadata stays readable.
pub struct FetchResult {
    request: Record,
    response: Record,
    http: Option<ResponseHead>,
    error: Option<Error>,
}

impl FetchResult {
    pub fn request(&self) -> &Record {
        &self.request
    }

    pub fn response(&self) -> &Record {
        &self.response
    }

    /// Parsed response head, forced before the body was handed off. Absent
    /// when the raw bytes did not parse.
    pub fn http(&self) -> Option<&ResponseHead> {
        self.http.as_ref()
    }

    /// Present only when a shutdown-induced interruption was downgraded to
    /// a graceful truncation.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

pub(crate) fn fetch<W: Write>(
    writer: &Writer<W>,
    uri: &Uri,
    request: Request,
    mut options: FetchOptions,
) -> Result<FetchResult, FetchError> {
    if writer.is_closing() {
        return Err(FetchError::Closing);
    }

    // Shared hold brackets everything from connect to the record writes,
    // close() cannot finish until it drops
    let _hold = writer.close_hold();

    let (host, port) = host_port(uri)?;
    let mut spool = tempfile::tempfile()?;

    let request_bytes = request.serialize();
    let mut request_digest = Hasher::new();
    request_digest.update(&request_bytes);

    let mut response_digest = Hasher::new();
    let date = OffsetDateTime::now_utc();
    let start = Instant::now();
    let mut ip = None;
    let mut total = 0u64;
    let mut truncated = None;
    let mut error = None;

    debug!("fetch {} connecting to {}:{}", uri, host, port);
    let socket = TcpStream::connect((host, port))?;
    let token = writer.registry().register(&socket)?;
    let streamed = stream_to_spool(
        writer,
        &socket,
        &request_bytes,
        &mut spool,
        &mut response_digest,
        &mut options,
        start,
        &mut ip,
        &mut total,
        &mut truncated,
    );
    writer.registry().unregister(token);
    drop(socket);

    if let Err(e) = streamed {
        if writer.is_closing() && total > 0 {
            // Interrupted by close with progress worth keeping, record what
            // we have and surface the interruption in the result
            debug!("fetch {} interrupted by close after {} bytes", uri, total);
            truncated = Some(TruncationReason::Unspecified);
            error = Some(e);
        } else {
            return Err(e.into());
        }
    }

    // Best-effort: digest the decoded entity body only. Forces the head
    // parse before the body is handed off to the record writer.
    spool.seek(SeekFrom::Start(0))?;
    let (http, payload_digest) = parse_payload(&mut spool, total);
    spool.seek(SeekFrom::Start(0))?;

    let mut builder = Record::response(&uri.to_string())
        .date(date)
        .block_digest(response_digest.finalize());
    if let Some(ip) = ip {
        builder = builder.ip_address(ip);
    }
    if let Some(digest) = payload_digest {
        builder = builder.payload_digest(digest);
    }
    if let Some(reason) = truncated {
        builder = builder.truncated(reason);
    }
    let mut response = builder.body(RESPONSE_CONTENT_TYPE, Body::spool(spool, total));
    writer.write(&mut response)?;

    let mut request_record = Record::request(&uri.to_string())
        .date(date)
        .block_digest(request_digest.finalize())
        .concurrent_to(response.id().clone())
        .body(REQUEST_CONTENT_TYPE, Body::bytes(request_bytes));
    writer.write(&mut request_record)?;

    Ok(FetchResult {
        request: request_record,
        response,
        http,
        error,
    })
}

#[allow(clippy::too_many_arguments)]
fn stream_to_spool<W: Write>(
    writer: &Writer<W>,
    socket: &TcpStream,
    request_bytes: &[u8],
    spool: &mut File,
    digest: &mut Hasher,
    options: &mut FetchOptions,
    start: Instant,
    ip: &mut Option<IpAddr>,
    total: &mut u64,
    truncated: &mut Option<TruncationReason>,
) -> Result<(), Error> {
    // Close may have raced the connect, bail before sending anything
    if writer.is_closing() {
        return Err(Error::new(ErrorKind::ConnectionAborted, "writer closed"));
    }
    socket.set_nodelay(true)?;
    if !options.read_timeout.is_zero() {
        socket.set_read_timeout(Some(options.read_timeout))?;
    }
    *ip = Some(socket.peer_addr()?.ip());

    let mut output = socket;
    output.write_all(request_bytes)?;

    let mut input = socket;
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        // Never read past the byte budget so a length-truncated body is cut
        // at exactly max_length
        let want = if options.max_length > 0 {
            cmp::min(buf.len() as u64, options.max_length - *total) as usize
        } else {
            buf.len()
        };
        let n = input.read(&mut buf[..want])?;
        if n == 0 {
            if writer.is_closing() {
                // A force-closed socket surfaces as end of stream here, not
                // as an error; map it onto the interruption path
                return Err(Error::new(
                    ErrorKind::ConnectionAborted,
                    "socket shut down by writer close",
                ));
            }
            break;
        }
        *total += n as u64;
        spool.write_all(&buf[..n])?;
        digest.update(&buf[..n]);
        if let Some(tee) = options.copy_to.as_mut() {
            if let Err(e) = tee.write_all(&buf[..n]) {
                warn!("tee sink failed, continuing fetch: {}", e);
            }
        }
        if options.max_length > 0 && *total >= options.max_length {
            *truncated = Some(TruncationReason::Length);
            break;
        }
        if !options.max_time.is_zero() && start.elapsed() >= options.max_time {
            *truncated = Some(TruncationReason::Time);
            break;
        }
    }
    Ok(())
}

fn host_port(uri: &Uri) -> Result<(&str, u16), FetchError> {
    match uri.scheme_str() {
        Some("http") => (),
        Some(other) => return Err(FetchError::UnsupportedScheme(other.to_string())),
        None => return Err(FetchError::UnsupportedScheme(String::from("none"))),
    }
    let host = uri
        .host()
        .ok_or_else(|| FetchError::MissingHost(uri.to_string()))?;
    Ok((host, uri.port_u16().unwrap_or(80)))
}

// Parse the spooled bytes as an HTTP response strictly to digest the entity
// body, skipping transport framing. Any failure just yields no digest.
fn parse_payload(spool: &mut File, total: u64) -> (Option<ResponseHead>, Option<Digest>) {
    let mut window = Vec::new();
    if spool
        .take(cmp::min(total, HEAD_WINDOW))
        .read_to_end(&mut window)
        .is_err()
    {
        return (None, None);
    }
    let head = match ResponseHead::parse(&window) {
        Ok(head) => head,
        Err(e) => {
            debug!("response head did not parse, no payload digest: {}", e);
            return (None, None);
        }
    };

    let mut remaining = total - head.head_len as u64;
    if let Some(length) = head.content_length() {
        remaining = cmp::min(remaining, length);
    }

    if spool.seek(SeekFrom::Start(head.head_len as u64)).is_err() {
        return (Some(head), None);
    }
    let mut hasher = Hasher::new();
    let mut payload_len = 0u64;
    let mut reader = spool.take(remaining);
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
                payload_len += n as u64;
            }
            Err(_) => return (Some(head), None),
        }
    }
    if payload_len == 0 {
        (Some(head), None)
    } else {
        (Some(head), Some(hasher.finalize()))
    }
}
