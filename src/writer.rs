use std::io::{Error, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use http::Uri;
use log::debug;

use crate::fetch::{self, FetchError, FetchOptions, FetchResult};
use crate::message::Request;
use crate::record::{Record, TRAILER};
use crate::registry::FetchRegistry;
use crate::sink::{Compression, RecordSink};

pub(crate) const CHUNK_SIZE: usize = 8 * 1024;

/// Appends records to an archive while allowing concurrent fetches.
///
/// All record writes are serialized through one exclusive sink path, so two
/// records can never interleave their bytes. Close interrupts in-flight
/// fetches and waits for their record writes to finish.
pub struct Writer<W: Write> {
    sink: Mutex<RecordSink<W>>,
    position: AtomicU64,
    registry: FetchRegistry,
    // Fetches hold the shared side from before connect until their records
    // are written, close takes the exclusive side once
    close_lock: RwLock<()>,
    closing: AtomicBool,
}

impl<W: Write> Writer<W> {
    pub fn new(writer: W, compression: Compression) -> Writer<W> {
        Writer {
            sink: Mutex::new(RecordSink::new(writer, compression)),
            position: AtomicU64::new(0),
            registry: FetchRegistry::new(),
            close_lock: RwLock::new(()),
            closing: AtomicBool::new(false),
        }
    }

    /// Byte position the next record will be written to. For a compressed
    /// archive this counts compressed output bytes.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    /// Serializes one record to the archive: header, body in fixed-size
    /// chunks, trailer. Holds the sink for the whole record. Write failures
    /// are fatal here, retrying is the caller's call at whole-fetch
    /// granularity.
    pub fn write(&self, record: &mut Record) -> Result<(), Error> {
        let mut sink = self.sink.lock().unwrap();

        let header = record.serialize_header();
        sink.write_all(&header)?;
        let mut written = header.len() as u64;

        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = record.body_mut().read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            written += n as u64;
        }

        sink.write_all(TRAILER)?;
        written += TRAILER.len() as u64;

        match sink.finish()? {
            // Compressed: reconcile to actual compressed bytes emitted
            Some(committed) => self.position.store(committed, Ordering::SeqCst),
            None => {
                self.position.fetch_add(written, Ordering::SeqCst);
            }
        }
        debug!(
            "wrote {} record ({} raw bytes), position now {}",
            record.kind(),
            written,
            self.position()
        );
        Ok(())
    }

    /// Downloads `uri` with a plain GET, recording the request and response
    /// as a linked record pair.
    pub fn fetch(&self, uri: &Uri, options: FetchOptions) -> Result<FetchResult, FetchError> {
        let request = Request::get(uri, options.user_agent());
        fetch::fetch(self, uri, request, options)
    }

    /// Same as [`fetch`](Writer::fetch) but with a caller-built request.
    pub fn fetch_with(
        &self,
        uri: &Uri,
        request: Request,
        options: FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        fetch::fetch(self, uri, request, options)
    }

    /// Closes the archive. Active fetches are interrupted and their progress
    /// so far is written out before the sink is flushed. Idempotent.
    ///
    /// A response that reaches natural end of stream at the same moment the
    /// close lands is indistinguishable from an interrupted one, so a record
    /// written during close may carry an `unspecified` truncation marker even
    /// though its body is complete.
    pub fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::SeqCst);
        self.registry.close_all();

        // Granted only once no fetch still holds the shared side, i.e. all
        // in-flight record writes have finished
        let _exclusive = self.close_lock.write().unwrap();
        let mut sink = self.sink.lock().unwrap();
        sink.close()
    }

    pub fn into_inner(self) -> Result<W, Error> {
        match self.sink.into_inner() {
            Ok(sink) => sink.into_inner(),
            Err(poisoned) => poisoned.into_inner().into_inner(),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> &FetchRegistry {
        &self.registry
    }

    pub(crate) fn close_hold(&self) -> RwLockReadGuard<'_, ()> {
        self.close_lock.read().unwrap()
    }
}
