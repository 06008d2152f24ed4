//! Growable write buffer
//!
//! The buffer starts small, doubles (up to a maximum) when a record does
//! not fit, and is halved back (down to a minimum) by periodic shrink
//! checks when it stays at most half full for two consecutive checks.

use std::fs::File;
use std::io::{self, Write};

/// Fill percentage at or below which the buffer may shrink
pub const SHRINK_THRESHOLD: usize = 50;

#[derive(Debug)]
pub struct BufferedWriter {
    buf: Vec<u8>,
    /// Current capacity
    buf_size: usize,
    /// Floor for shrinking; may be above `max_size`
    min_shrink_size: usize,
    max_size: usize,
    shrink_req: bool,
}

impl BufferedWriter {
    pub fn new(min_shrink_size: usize, max_size: usize) -> Self {
        let buf_size = min_shrink_size.min(max_size);
        Self {
            buf: Vec::with_capacity(buf_size),
            buf_size,
            min_shrink_size,
            max_size,
            shrink_req: false,
        }
    }

    /// Bytes waiting to be written
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Room left before the buffer must be flushed
    pub fn available(&self) -> usize {
        self.buf_size.saturating_sub(self.buf.len())
    }

    /// Current capacity
    pub fn size(&self) -> usize {
        self.buf_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn shrink_requested(&self) -> bool {
        self.shrink_req
    }

    /// Buffer `data`, writing to `file` when it does not fit.
    pub fn write(&mut self, file: &mut File, data: &[u8]) -> io::Result<()> {
        if data.len() > self.available() {
            self.flush(file)?;
            if data.len() >= self.buf_size {
                return file.write_all(data);
            }
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Write buffered bytes to `file`.
    pub fn flush(&mut self, file: &mut File) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Drop buffered bytes without writing them.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Grow so that at least `required` bytes fit, flushing first.
    pub fn expand(&mut self, file: &mut File, required: usize) -> io::Result<()> {
        self.shrink_req = false;
        self.flush(file)?;
        self.buf_size = (self.buf_size * 2).max(required).min(self.max_size);
        self.reallocate();
        Ok(())
    }

    /// Periodic shrink check.
    ///
    /// The first check that finds the buffer at most half full only
    /// records a request; the next one halves the buffer.
    pub fn try_shrink(&mut self, file: &mut File) -> io::Result<()> {
        if self.buf_size == self.min_shrink_size {
            return Ok(());
        }
        if !self.shrink_req {
            if self.fill_percent() <= SHRINK_THRESHOLD {
                self.shrink_req = true;
            }
            return Ok(());
        }
        self.flush(file)?;
        self.buf_size = (self.buf_size / 2).max(self.min_shrink_size);
        self.reallocate();
        // Keep the request pending until the floor is reached.
        if self.buf_size == self.min_shrink_size {
            self.shrink_req = true;
        }
        Ok(())
    }

    /// Cancel a pending shrink request if the buffer filled up again.
    pub fn check_shrink_request(&mut self) {
        if self.fill_percent() > SHRINK_THRESHOLD {
            self.shrink_req = false;
        }
    }

    fn fill_percent(&self) -> usize {
        if self.buf_size == 0 {
            return 0;
        }
        self.buf.len() * 100 / self.buf_size
    }

    fn reallocate(&mut self) {
        self.buf = Vec::with_capacity(self.buf_size);
    }
}
