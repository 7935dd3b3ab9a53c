//! Web archive writer: appends paired request/response records to a growing
//! archive file while performing the network fetches that produce them.
//!
//! The [`Writer`] owns the output and serializes all record writes through
//! one exclusive path. [`Writer::fetch`] downloads a resource over HTTP/1.0,
//! spooling the raw response while digesting it and enforcing byte and
//! wall-clock truncation budgets, then writes the response and request as a
//! linked record pair. [`Writer::close`] interrupts in-flight fetches and
//! drains them before the output is flushed, so a partial record is never
//! emitted.

pub mod cdx;
mod fetch;
pub mod hash;
pub mod message;
pub mod record;
mod registry;
mod sink;
mod writer;

pub use fetch::{FetchError, FetchOptions, FetchResult};
pub use record::{Body, Record, RecordBuilder, RecordId, RecordKind, TruncationReason};
pub use sink::Compression;
pub use writer::Writer;
