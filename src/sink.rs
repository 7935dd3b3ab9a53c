use std::io::{Error, ErrorKind, Write};

use log::debug;
use zstd::stream::write::Encoder;

/// Compression applied to the archive output.
///
/// Compressed archives frame every record as its own zstd frame so a reader
/// can seek to a record's start offset and decompress it without touching
/// its neighbours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

// Tracks compressed bytes as they leave the frame encoder, this is the
// committed output position reported by finish()
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()
    }
}

// One frame per record. A frame is opened lazily on the first write after
// the previous finish so an idle sink holds no encoder state.
enum Frame<W: Write> {
    Idle(CountingWriter<W>),
    Open(Box<Encoder<'static, CountingWriter<W>>>),
    // A write or finish failed mid-frame, the output can no longer be trusted
    Poisoned,
}

enum Inner<W: Write> {
    Raw(W),
    Zstd(Frame<W>),
}

/// Append-only byte destination, optionally framing each record as an
/// independent compressed unit.
pub struct RecordSink<W: Write> {
    inner: Inner<W>,
}

impl<W: Write> RecordSink<W> {
    pub fn new(writer: W, compression: Compression) -> RecordSink<W> {
        let inner = match compression {
            Compression::None => Inner::Raw(writer),
            Compression::Zstd => Inner::Zstd(Frame::Idle(CountingWriter {
                inner: writer,
                count: 0,
            })),
        };
        RecordSink { inner }
    }

    /// Closes the current compression frame, if any.
    ///
    /// Returns the committed output position (total compressed bytes emitted
    /// so far) when compressing, `None` for a raw sink.
    pub fn finish(&mut self) -> Result<Option<u64>, Error> {
        match &mut self.inner {
            Inner::Raw(_) => Ok(None),
            Inner::Zstd(frame) => match std::mem::replace(frame, Frame::Poisoned) {
                Frame::Idle(counting) => {
                    let count = counting.count;
                    *frame = Frame::Idle(counting);
                    Ok(Some(count))
                }
                Frame::Open(encoder) => {
                    let counting = encoder.finish()?;
                    let count = counting.count;
                    debug!("frame closed, committed output position {}", count);
                    *frame = Frame::Idle(counting);
                    Ok(Some(count))
                }
                Frame::Poisoned => Err(poisoned()),
            },
        }
    }

    /// Final flush of the underlying destination. Closes a dangling frame
    /// first so no compressed data is left buffered.
    pub fn close(&mut self) -> Result<(), Error> {
        self.finish()?;
        match &mut self.inner {
            Inner::Raw(writer) => writer.flush(),
            Inner::Zstd(Frame::Idle(counting)) => counting.flush(),
            Inner::Zstd(_) => Err(poisoned()),
        }
    }

    pub fn into_inner(self) -> Result<W, Error> {
        match self.inner {
            Inner::Raw(writer) => Ok(writer),
            Inner::Zstd(Frame::Idle(counting)) => Ok(counting.inner),
            Inner::Zstd(Frame::Open(encoder)) => Ok(encoder.finish()?.inner),
            Inner::Zstd(Frame::Poisoned) => Err(poisoned()),
        }
    }
}

impl<W: Write> Write for RecordSink<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match &mut self.inner {
            Inner::Raw(writer) => writer.write(buf),
            Inner::Zstd(frame) => {
                if let Frame::Idle(_) = frame {
                    match std::mem::replace(frame, Frame::Poisoned) {
                        Frame::Idle(counting) => {
                            let encoder =
                                Encoder::new(counting, zstd::DEFAULT_COMPRESSION_LEVEL)?;
                            *frame = Frame::Open(Box::new(encoder));
                        }
                        _ => unreachable!(),
                    }
                }
                match frame {
                    Frame::Open(encoder) => encoder.write(buf),
                    _ => Err(poisoned()),
                }
            }
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match &mut self.inner {
            Inner::Raw(writer) => writer.flush(),
            Inner::Zstd(Frame::Open(encoder)) => encoder.flush(),
            Inner::Zstd(Frame::Idle(counting)) => counting.flush(),
            Inner::Zstd(Frame::Poisoned) => Err(poisoned()),
        }
    }
}

fn poisoned() -> Error {
    Error::new(ErrorKind::Other, "compressed sink poisoned by earlier error")
}
