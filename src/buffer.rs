//! Growable byte buffer with independent read and write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (unread)     |                  |
//! +-------------------+------------------+------------------+
//! 0      <=       read_pos    <=     write_pos    <=    capacity
//! ```
//!
//! A buffer is owned by exactly one connection and travels with it into a
//! worker task and back, so the cursors are plain integers.

use std::io::{self, IoSliceMut, Read, Write};

/// Initial size of a connection buffer.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack area used to absorb reads larger than the spare capacity.
const EXTRA_READ_SIZE: usize = 65_536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new(init_size: usize) -> Self {
        Self {
            buf: vec![0; init_size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes that can be written without growing or compacting.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Bytes appended but not yet retrieved.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes already retrieved, reclaimable by compaction.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Makes sure at least `len` bytes can be written at the tail.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Consumes `len` unread bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({len}) past readable bytes ({})",
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Consumes everything before `end`, an offset into `peek()`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Resets both cursors, dropping any unread bytes.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Reads from `reader` with a single vectored call.
    ///
    /// The call scatters into the writable tail and a stack-local overflow
    /// area, so one read can take more than the current spare capacity. The
    /// overflow is appended afterwards. `WouldBlock` is returned untouched for
    /// the caller to classify.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_pos);
            let mut bufs = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut bufs)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the unread region with a single call and consumes what was
    /// actually written.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_SIZE)
    }
}
