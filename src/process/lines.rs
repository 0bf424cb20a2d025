//! Newline splitting for subprocess pipes.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Longest line handed out in one piece. Longer lines are split at this boundary.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reads `\n`-terminated lines from a pipe, bounding the size of each line.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced, so every line is
/// displayable. A line that grows past the limit is handed out in chunks rather
/// than aborting the read, which keeps the pipe drained.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_LINE_BYTES)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_len: max_len.max(1),
            eof: false,
        }
    }

    /// Next line, or `None` once the pipe is closed and everything was handed out.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                self.eof = true;
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let room = self.max_len - self.buf.len();
            let window = &available[..available.len().min(room)];
            if let Some(pos) = window.iter().position(|&b| b == b'\n') {
                self.buf.extend_from_slice(&window[..pos]);
                self.inner.consume(pos + 1);
                return Ok(Some(self.take_line()));
            }

            let taken = window.len();
            self.buf.extend_from_slice(window);
            self.inner.consume(taken);
            if self.buf.len() >= self.max_len {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
