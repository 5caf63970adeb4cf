use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWrite;

use crate::error::Result;

/// One frame of the unit's combined output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Writer connected to the unit's standard input. `shutdown` half-closes the
/// connection so the process observes EOF.
pub type InputStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Combined stdout/stderr channel. Ends when the unit closes both streams.
pub type OutputStream = BoxStream<'static, Result<OutputChunk>>;

/// Live connection to a started unit.
///
/// Dropping `output` tears down the attached connection; a reader blocked on
/// it is released immediately.
pub struct Attachment {
    pub input: InputStream,
    pub output: OutputStream,
}
