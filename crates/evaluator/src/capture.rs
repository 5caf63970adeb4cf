/// Default per-stream capture limit (1 MiB).
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

/// Bytes captured from one output stream, cut at an optional limit.
///
/// Bytes past the limit are counted and discarded. The drain keeps reading so
/// the unit is never blocked on a full pipe because of the limit.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    data: Vec<u8>,
    limit: Option<usize>,
    dropped: usize,
}

impl Capture {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.data.len()),
            None => chunk.len(),
        };
        let (kept, rest) = chunk.split_at(room.min(chunk.len()));
        self.data.extend_from_slice(kept);
        self.dropped += rest.len();
    }

    pub(crate) fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Best-effort UTF-8: invalid sequences, including a code point split at
    /// the limit, become U+FFFD.
    pub(crate) fn into_text(self) -> String {
        match String::from_utf8(self.data) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}
