//! Drops the leading bytes of a chunked stream that the peer already holds.

/// Forwards only the bytes whose cumulative index is at or past the resume offset.
#[derive(Debug, Clone)]
pub struct ByteOffsetSkipper {
    offset: u64,
    remaining: u64,
}

impl ByteOffsetSkipper {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            remaining: offset,
        }
    }

    /// Return the tail of `chunk` that lies past the skip point.
    ///
    /// The returned slice is empty while the stream is still inside the skipped prefix.
    pub fn skip<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        if self.remaining == 0 {
            return chunk;
        }
        let len = chunk.len() as u64;
        if len <= self.remaining {
            self.remaining -= len;
            return &[];
        }
        let start = self.remaining as usize;
        self.remaining = 0;
        &chunk[start..]
    }

    /// Bytes discarded so far.
    pub fn skipped(&self) -> u64 {
        self.offset - self.remaining
    }

    /// Whether the skip point has been passed.
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}
