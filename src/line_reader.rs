use std::io;

use bytes::{Buf, Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest command line accepted, including its CRLF.
pub const MAX_LINE_LEN: usize = 224;

/// Splits a byte stream into CRLF-terminated command lines and the
/// fixed-length data blocks that follow `put`.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Bytes read from `reader` but not yet handed out.
    buf: BytesMut,
    /// Offset in `buf` before which no CRLF exists.
    maybe_crlf_from: usize,
    reader: T,
    /// A read error held back until the lines already buffered are consumed.
    pending_error: Option<io::Error>,
    max_line: usize,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Returns the next line without its CRLF, or None once the stream ends.
    /// A partial line left at end of stream is dropped.
    ///
    /// Cancel-safe: the only await is a `read_buf` into the internal buffer,
    /// so a cancelled call loses nothing.
    ///
    /// A read error surfaces only after every complete line buffered before
    /// it. A line longer than the configured maximum is an `InvalidData`
    /// error, after which the stream cannot be resynchronised.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan only what's new, starting one byte early in case a CR
            // ended the previous read. Lines that arrived together are served
            // from the buffer before reading again.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let len = self.maybe_crlf_from + eoc + 2;
                if len > self.max_line {
                    return Err(too_long());
                }
                let line = self.buf.split_to(len).freeze();
                self.maybe_crlf_from = 0;

                return Ok(Some(line.slice(..len - 2)));
            }

            if self.buf.len() >= self.max_line {
                return Err(too_long());
            }

            let n = match self.reader.read_buf(&mut self.buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.pending_error = Some(e);
                    0
                },
            };

            // Resume scanning at the byte before this read's first byte.
            self.maybe_crlf_from = self.buf.len().saturating_sub(n + 1);

            if n == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads exactly `n` bytes following the last line. Returns None if the
    /// stream ends first. Cancel-safe in the same way as `read_line`.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
        self.maybe_crlf_from = 0;
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    /// Skips `n` bytes without buffering more than one read's worth of them.
    /// Returns false if the stream ends first.
    pub async fn discard(&mut self, mut n: usize) -> io::Result<bool> {
        loop {
            let take = n.min(self.buf.len());
            self.buf.advance(take);
            n -= take;
            if n == 0 {
                self.maybe_crlf_from = 0;
                return Ok(true);
            }
            if self.fill().await? == 0 {
                return Ok(false);
            }
        }
    }

    /// Reads whatever is available into the internal buffer, returning how
    /// many bytes arrived; zero means the stream has ended.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        self.reader.read_buf(&mut self.buf).await
    }

    #[cfg(test)]
    pub(crate) fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }
}

fn too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "command line too long")
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
            max_line: MAX_LINE_LEN,
        }
    }
}
