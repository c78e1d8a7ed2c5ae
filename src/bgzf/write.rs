use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use libdeflater::{CompressionLvl, Compressor};

use crate::bgzf::{virtual_offset, VirtualOffset, EOF_MARKER, GZIP_MAGIC, MAX_BLOCK_PAYLOAD};
use crate::error::{Error, Result};

/// Writer producing blocked-gzip output.
///
/// Payload accumulates in a block buffer and is deflated into an independent
/// gzip member once [`MAX_BLOCK_PAYLOAD`][crate::bgzf] bytes are pending, so
/// every block stays independently decodable and addressable by virtual
/// offset. Blocks are written eagerly; nothing is held back beyond the
/// current partial block.
///
/// The EOF marker block is only appended by [`finish`][BgzfWriter::finish]
/// (or drop) when enabled through [`end_file`][BgzfWriter::end_file], because
/// files are routinely extended by appending more blocks.
pub struct BgzfWriter<W: Write> {
    out: Option<W>,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    compressor: Compressor,
    /// Compressed bytes emitted since construction.
    compressed_pos: u64,
    /// Compressed offset of the first block, when known.
    base: Option<u64>,
    write_eof_marker: bool,
    byte_count: u64,
}

impl<W: Write> BgzfWriter<W> {
    /// Wrap an output stream whose position is unknown (a pipe, say).
    /// [`tell`][BgzfWriter::tell] reports `None` until
    /// [`mark_file_start`][BgzfWriter::mark_file_start] declares the output
    /// to begin at offset zero.
    pub fn new(out: W) -> Self {
        Self::build(out, None)
    }

    /// Wrap an output stream positioned at compressed offset `base`, making
    /// virtual offsets valid immediately.
    pub fn with_offset(out: W, base: u64) -> Self {
        Self::build(out, Some(base))
    }

    fn build(out: W, base: Option<u64>) -> Self {
        BgzfWriter {
            out: Some(out),
            buf: Vec::with_capacity(MAX_BLOCK_PAYLOAD),
            scratch: Vec::new(),
            compressor: Compressor::new(CompressionLvl::default()),
            compressed_pos: 0,
            base,
            write_eof_marker: false,
            byte_count: 0,
        }
    }

    /// Declare that this writer is at the start of its file, establishing
    /// virtual offset zero. Must be called before anything is written.
    pub fn mark_file_start(&mut self) {
        assert!(
            self.compressed_pos == 0 && self.buf.is_empty(),
            "mark_file_start after data was written"
        );
        self.base = Some(0);
    }

    /// Whether to append the conventional empty EOF marker block on
    /// [`finish`][BgzfWriter::finish].
    pub fn end_file(&mut self, enable: bool) {
        self.write_eof_marker = enable;
    }

    /// Virtual offset at which the next written byte will land, or `None`
    /// when the output position is unknown.
    pub fn tell(&self) -> Option<VirtualOffset> {
        self.base
            .map(|base| virtual_offset(base + self.compressed_pos, self.buf.len() as u16))
    }

    /// Total payload bytes accepted so far.
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Hand out a writable region of the current block. Bytes placed in it
    /// count as payload once the unused tail is returned with
    /// [`back_up`][BgzfWriter::back_up].
    pub fn next_region(&mut self) -> Result<&mut [u8]> {
        if self.buf.len() >= MAX_BLOCK_PAYLOAD {
            self.flush_block()?;
        }
        let start = self.buf.len();
        self.buf.resize(MAX_BLOCK_PAYLOAD, 0);
        self.byte_count += (MAX_BLOCK_PAYLOAD - start) as u64;
        Ok(&mut self.buf[start..])
    }

    /// Return the trailing `count` bytes of the last region as never
    /// written.
    pub fn back_up(&mut self, count: usize) {
        assert!(count <= self.buf.len(), "cannot back up past block start");
        self.buf.truncate(self.buf.len() - count);
        self.byte_count -= count as u64;
    }

    /// Compress and write out the current partial block, then flush the
    /// backing stream.
    pub fn flush_all(&mut self) -> Result<()> {
        self.flush_block()?;
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    /// Flush everything, append the EOF marker if enabled, and hand the
    /// backing stream back.
    pub fn finish(mut self) -> Result<W> {
        self.finish_inner()?;
        Ok(self.out.take().expect("finish ran once"))
    }

    fn finish_inner(&mut self) -> Result<()> {
        self.flush_block()?;
        let out = self.out.as_mut().expect("stream still owned");
        if self.write_eof_marker {
            out.write_all(&EOF_MARKER)?;
            self.compressed_pos += EOF_MARKER.len() as u64;
        }
        out.flush()?;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let bound = self.compressor.deflate_compress_bound(self.buf.len());
        self.scratch.resize(bound, 0);
        let n = self
            .compressor
            .deflate_compress(&self.buf, &mut self.scratch)
            .map_err(|e| Error::Deflate(e.to_string()))?;
        let total = n + 26;
        debug_assert!(total <= 0x10000, "block overflows its size field");
        let mut crc = flate2::Crc::new();
        crc.update(&self.buf);
        let out = self.out.as_mut().expect("stream still owned");
        out.write_all(&GZIP_MAGIC)?;
        out.write_all(&[8, 4, 0, 0, 0, 0, 0, 0xff])?;
        out.write_u16::<LittleEndian>(6)?;
        out.write_all(&[b'B', b'C', 2, 0])?;
        out.write_u16::<LittleEndian>((total - 1) as u16)?;
        out.write_all(&self.scratch[..n])?;
        out.write_u32::<LittleEndian>(crc.sum())?;
        out.write_u32::<LittleEndian>(self.buf.len() as u32)?;
        self.compressed_pos += total as u64;
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.buf.len() >= MAX_BLOCK_PAYLOAD {
                self.flush_block().map_err(io::Error::from)?;
            }
            let room = MAX_BLOCK_PAYLOAD - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        self.byte_count += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all().map_err(io::Error::from)
    }
}

impl<W: Write> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        if self.out.is_some() {
            let _ = self.finish_inner();
        }
    }
}
