//! # Limited Writer
//!
//! An `io::Write` sink that refuses to grow past a byte budget.

use std::io;

/// Buffers output and fails once `limit` bytes would be exceeded
#[derive(Debug)]
pub struct LimitedWriter {
    buffer: Vec<u8>,
    limit: usize,
    exceeded: bool,
}

impl LimitedWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            exceeded: false,
        }
    }

    /// True once a write was rejected
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl io::Write for LimitedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len().saturating_add(buf.len()) > self.limit {
            self.exceeded = true;
            return Err(io::Error::other(format!(
                "output exceeds the limit of {} bytes",
                self.limit
            )));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_writes_within_limit() {
        let mut writer = LimitedWriter::new(8);
        writer.write_all(b"abcd").unwrap();
        writer.write_all(b"efgh").unwrap();
        assert!(!writer.exceeded());
        assert_eq!(writer.into_inner(), b"abcdefgh");
    }

    #[test]
    fn test_rejects_write_past_limit() {
        let mut writer = LimitedWriter::new(4);
        writer.write_all(b"abc").unwrap();
        assert!(writer.write_all(b"de").is_err());
        assert!(writer.exceeded());
        assert_eq!(writer.into_inner(), b"abc");
    }
}
