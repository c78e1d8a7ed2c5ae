use std::io::{self, Read};

/// Minimum lookahead a [`PutbackReader`] guarantees, comfortably more than
/// any sniffer needs (a group prologue is at most two varints and a 25-byte
/// tag).
pub const PUTBACK_CAPACITY: usize = 1024;

/// Peeking at the head of a stream without consuming it. Implemented by
/// [`PutbackReader`]; magic sniffers take `&mut dyn Peek` so they can be
/// stored in the registry.
pub trait Peek: Read {
    /// Return up to `n` bytes from the current position without consuming
    /// them. Shorter than `n` only when the stream ends first.
    fn peek(&mut self, n: usize) -> io::Result<&[u8]>;
}

/// Buffered reader whose buffered head can be examined repeatedly, giving
/// non-seekable inputs (pipes, standard input) the lookahead that format
/// sniffing needs. Reads pass through once the buffered bytes are drained.
pub struct PutbackReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> PutbackReader<R> {
    pub fn new(inner: R) -> Self {
        PutbackReader {
            inner,
            buf: Vec::with_capacity(PUTBACK_CAPACITY),
            pos: 0,
            eof: false,
        }
    }

    /// Bytes buffered and not yet consumed.
    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn fill_to(&mut self, n: usize) -> io::Result<()> {
        while self.available() < n && !self.eof {
            let start = self.buf.len();
            self.buf.resize(self.pos + n, 0);
            match self.inner.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    self.eof = true;
                }
                Ok(got) => self.buf.truncate(start + got),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.buf.truncate(start);
                }
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// See [`Peek::peek`].
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill_to(n)?;
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for PutbackReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.available() > 0 {
            let n = self.available().min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.buf.len() {
                self.buf.clear();
                self.pos = 0;
            }
            return Ok(n);
        }
        self.inner.read(out)
    }
}

impl<R: Read> Peek for PutbackReader<R> {
    fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        PutbackReader::peek(self, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn peek_does_not_consume() {
        let mut reader = PutbackReader::new(Cursor::new(b"abcdefgh".to_vec()));
        assert_eq!(reader.peek(4).unwrap(), b"abcd");
        assert_eq!(reader.peek(6).unwrap(), b"abcdef");
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abcdefgh");
    }

    #[test]
    fn peek_past_end_is_short() {
        let mut reader = PutbackReader::new(Cursor::new(b"xy".to_vec()));
        assert_eq!(reader.peek(10).unwrap(), b"xy");
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"xy");
    }

    #[test]
    fn interleaved_peek_and_read() {
        let mut reader = PutbackReader::new(Cursor::new(b"0123456789".to_vec()));
        assert_eq!(reader.peek(3).unwrap(), b"012");
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"01");
        assert_eq!(reader.peek(3).unwrap(), b"234");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"23456789");
    }
}
