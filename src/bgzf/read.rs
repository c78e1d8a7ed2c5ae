use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::thread::JoinHandle;

use byteorder::{LittleEndian, ReadBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::read::MultiGzDecoder;
use libdeflater::Decompressor;

use crate::bgzf::{
    split_virtual_offset, virtual_offset, VirtualOffset, EOF_MARKER, GZIP_MAGIC, MAX_BLOCK_ISIZE,
};
use crate::error::{Error, Result};

/// Read granularity for inputs that are not blocked (plain gzip or raw bytes).
const STREAM_CHUNK: usize = 64 * 1024;

/// How the input turned out to be stored, decided by sniffing its first bytes.
enum Source<R: Read> {
    /// Proper BGZF: members carrying a `BC` size subfield.
    Blocked(R),
    /// Ordinary (possibly multi-member) gzip. No virtual offsets.
    Gzip(MultiGzDecoder<io::Chain<Cursor<Vec<u8>>, R>>),
    /// Not compressed at all; payload passes straight through.
    Plain(io::Chain<Cursor<Vec<u8>>, R>),
}

/// A compressed block pulled off the input, not yet inflated.
struct RawBlock {
    /// Compressed offset of the member's first header byte.
    address: u64,
    /// Compressed offset just past the member.
    next_address: u64,
    cdata: Vec<u8>,
    crc: u32,
    isize_: u32,
}

struct WorkItem {
    seq: u64,
    raw: RawBlock,
}

struct DoneItem {
    seq: u64,
    address: u64,
    next_address: u64,
    payload: Result<Vec<u8>>,
}

/// Inflate workers for multi-threaded decode. The reader thread parses member
/// headers (cheap) and ships compressed payloads out; completed blocks are
/// reassembled in sequence order.
struct DecodePool {
    work_tx: Option<Sender<WorkItem>>,
    result_rx: Receiver<DoneItem>,
    workers: Vec<JoinHandle<()>>,
    depth: usize,
    in_flight: usize,
    next_seq: u64,
    emit_seq: u64,
    ready: BTreeMap<u64, (u64, u64, Result<Vec<u8>>)>,
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.work_tx.take();
        // Let blocked workers finish sending before joining them.
        while self.result_rx.recv().is_ok() {}
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Reader over a BGZF, gzip, or uncompressed byte stream.
///
/// Payload is handed out as borrowed chunks via [`next_chunk`], one
/// decompressed block at a time for blocked input. Successive chunks
/// concatenate to the original byte stream; [`back_up`] returns the tail of
/// the last chunk for re-delivery. [`Read`] is also implemented on top of the
/// chunk interface for callers that just want bytes.
///
/// Virtual offsets ([`tell`], [`seek`]) are available only when the input is
/// blocked *and* was opened from a seekable stream with [`open`].
///
/// [`next_chunk`]: BgzfReader::next_chunk
/// [`back_up`]: BgzfReader::back_up
/// [`tell`]: BgzfReader::tell
/// [`seek`]: BgzfReader::seek
/// [`open`]: BgzfReader::open
pub struct BgzfReader<R: Read> {
    source: Source<R>,
    /// Compressed offset at which the next member header will be read.
    /// Absolute when `know_offset`, else relative to construction.
    compressed_pos: u64,
    know_offset: bool,
    /// Compressed start of the block currently held in `block`.
    block_address: u64,
    /// Compressed offset just past that block.
    next_address: u64,
    block: Vec<u8>,
    block_offset: usize,
    byte_count: u64,
    missing_eof: bool,
    /// Header already consumed by sniffing, awaiting its payload.
    first_block: Option<PendingHeader>,
    /// In-block offset the next fresh block must start emitting from
    /// (set by `seek`).
    pending_intra: Option<u16>,
    raw_eof: bool,
    pool: Option<DecodePool>,
    inflater: Decompressor,
}

struct PendingHeader {
    address: u64,
    cdata_len: usize,
}

enum Sniffed {
    Blocked { header_len: usize, cdata_len: usize },
    Gzip(Vec<u8>),
    Plain(Vec<u8>),
}

impl<R: Read> BgzfReader<R> {
    /// Wrap a non-seekable input. The stream kind (blocked, gzip, plain) is
    /// sniffed from the first bytes. `tell` reports `None` and the EOF marker
    /// cannot be checked.
    pub fn new(mut input: R) -> Result<Self> {
        let sniffed = sniff(&mut input)?;
        Ok(Self::from_sniffed(input, sniffed, None, false))
    }

    fn from_sniffed(input: R, sniffed: Sniffed, base: Option<u64>, missing_eof: bool) -> Self {
        let start = base.unwrap_or(0);
        let (source, compressed_pos, first_block) = match sniffed {
            Sniffed::Blocked {
                header_len,
                cdata_len,
            } => (
                Source::Blocked(input),
                start + header_len as u64,
                Some(PendingHeader {
                    address: start,
                    cdata_len,
                }),
            ),
            Sniffed::Gzip(pending) => (
                Source::Gzip(MultiGzDecoder::new(Cursor::new(pending).chain(input))),
                start,
                None,
            ),
            Sniffed::Plain(pending) => (
                Source::Plain(Cursor::new(pending).chain(input)),
                start,
                None,
            ),
        };
        BgzfReader {
            source,
            compressed_pos,
            know_offset: base.is_some(),
            block_address: start,
            next_address: start,
            block: Vec::new(),
            block_offset: 0,
            byte_count: 0,
            missing_eof,
            first_block,
            pending_intra: None,
            raw_eof: false,
            pool: None,
            inflater: Decompressor::new(),
        }
    }

    /// Spread block decompression over `threads` worker threads. A no-op for
    /// non-blocked input or `threads <= 1`.
    pub fn with_decode_threads(mut self, threads: usize) -> Self {
        if threads <= 1 || !self.is_bgzf() || self.pool.is_some() {
            return self;
        }
        let depth = threads * 2;
        let (work_tx, work_rx) = bounded::<WorkItem>(depth);
        let (result_tx, result_rx) = bounded::<DoneItem>(depth);
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            workers.push(std::thread::spawn(move || {
                let mut inflater = Decompressor::new();
                while let Ok(item) = work_rx.recv() {
                    let payload = inflate_raw(&mut inflater, &item.raw);
                    let done = DoneItem {
                        seq: item.seq,
                        address: item.raw.address,
                        next_address: item.raw.next_address,
                        payload,
                    };
                    if result_tx.send(done).is_err() {
                        break;
                    }
                }
            }));
        }
        self.pool = Some(DecodePool {
            work_tx: Some(work_tx),
            result_rx,
            workers,
            depth,
            in_flight: 0,
            next_seq: 0,
            emit_seq: 0,
            ready: BTreeMap::new(),
        });
        self
    }

    /// Yield the next run of decompressed payload, or `None` at end of
    /// stream. The returned slice stays valid until the next call that
    /// mutates the reader.
    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        if self.block_offset >= self.block.len() && self.fresh_block()?.is_none() {
            return Ok(None);
        }
        let start = self.block_offset;
        self.block_offset = self.block.len();
        self.byte_count += (self.block.len() - start) as u64;
        Ok(Some(&self.block[start..]))
    }

    /// Mark the trailing `count` bytes of the last chunk as unread; the next
    /// call to [`next_chunk`][BgzfReader::next_chunk] re-delivers them.
    ///
    /// Panics when `count` exceeds what the last chunk delivered.
    pub fn back_up(&mut self, count: usize) {
        assert!(
            count <= self.block_offset,
            "cannot back up {} bytes ({} available)",
            count,
            self.block_offset
        );
        self.block_offset -= count;
        self.byte_count -= count as u64;
    }

    /// Advance `count` bytes without looking at them. Returns false when the
    /// stream ends first.
    pub fn skip(&mut self, mut count: u64) -> Result<bool> {
        while count > 0 {
            let len = match self.next_chunk()? {
                None => return Ok(false),
                Some(chunk) => chunk.len() as u64,
            };
            if len > count {
                self.back_up((len - count) as usize);
                count = 0;
            } else {
                count -= len;
            }
        }
        Ok(true)
    }

    /// Total payload bytes delivered so far, net of `back_up`.
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Virtual offset of the next byte to be delivered. `None` when the
    /// input is not blocked or was not opened from a seekable stream.
    pub fn tell(&self) -> Option<VirtualOffset> {
        if !self.know_offset || !self.is_bgzf() {
            return None;
        }
        if self.block_offset == self.block.len() {
            // At a block boundary (or just after a seek, when the pending
            // in-block offset is not yet consumed).
            Some(virtual_offset(
                self.next_address,
                self.pending_intra.unwrap_or(0),
            ))
        } else {
            Some(virtual_offset(self.block_address, self.block_offset as u16))
        }
    }

    /// True when the input is in blocked format (as opposed to plain gzip or
    /// uncompressed bytes).
    pub fn is_bgzf(&self) -> bool {
        matches!(self.source, Source::Blocked(_))
    }

    /// True when the input is blocked, seekable, and its trailing EOF marker
    /// block is absent. Only meaningful after `open_unchecked`; `open`
    /// already failed in that case.
    pub fn missing_eof(&self) -> bool {
        self.missing_eof
    }

    fn fresh_block(&mut self) -> Result<Option<usize>> {
        if self.is_bgzf() {
            loop {
                match self.next_decoded_block()? {
                    None => {
                        // All data blocks (and any trailing EOF markers) are
                        // consumed, so compressed_pos is the stream length.
                        self.next_address = self.compressed_pos;
                        self.block.clear();
                        self.block_offset = 0;
                        return Ok(None);
                    }
                    Some((address, next_address, data)) => {
                        let start = match self.pending_intra.take() {
                            Some(intra) => {
                                let intra = intra as usize;
                                if intra > data.len() {
                                    return Err(Error::BadSeekTarget(virtual_offset(
                                        address,
                                        intra as u16,
                                    )));
                                }
                                intra
                            }
                            None => 0,
                        };
                        self.block = data;
                        self.block_address = address;
                        self.next_address = next_address;
                        if start >= self.block.len() {
                            // Seek addressed the end of this block; the byte
                            // we want starts the next one.
                            self.block_offset = self.block.len();
                            continue;
                        }
                        self.block_offset = start;
                        return Ok(Some(start));
                    }
                }
            }
        } else {
            self.block.resize(STREAM_CHUNK, 0);
            let n = match &mut self.source {
                Source::Gzip(r) => r.read(&mut self.block)?,
                Source::Plain(r) => r.read(&mut self.block)?,
                Source::Blocked(_) => unreachable!(),
            };
            self.block.truncate(n);
            self.block_offset = 0;
            if n == 0 {
                Ok(None)
            } else {
                Ok(Some(0))
            }
        }
    }

    /// Next inflated block in stream order, from the pool when enabled.
    fn next_decoded_block(&mut self) -> Result<Option<(u64, u64, Vec<u8>)>> {
        if self.pool.is_none() {
            return match self.read_raw_block()? {
                None => Ok(None),
                Some(raw) => {
                    let data = inflate_raw(&mut self.inflater, &raw)?;
                    Ok(Some((raw.address, raw.next_address, data)))
                }
            };
        }
        // Keep the pipeline full.
        loop {
            let (depth, in_flight) = {
                let pool = self.pool.as_ref().unwrap();
                (pool.depth, pool.in_flight)
            };
            if in_flight >= depth || self.raw_eof {
                break;
            }
            match self.read_raw_block()? {
                Some(raw) => {
                    let pool = self.pool.as_mut().unwrap();
                    let seq = pool.next_seq;
                    pool.next_seq += 1;
                    let sent = pool
                        .work_tx
                        .as_ref()
                        .unwrap()
                        .send(WorkItem { seq, raw })
                        .is_ok();
                    if !sent {
                        return Err(Error::HelperPanicked("bgzf decode"));
                    }
                    pool.in_flight += 1;
                }
                None => self.raw_eof = true,
            }
        }
        let pool = self.pool.as_mut().unwrap();
        if pool.in_flight == 0 {
            return Ok(None);
        }
        loop {
            if let Some((address, next_address, payload)) = pool.ready.remove(&pool.emit_seq) {
                pool.emit_seq += 1;
                pool.in_flight -= 1;
                return payload.map(|data| Some((address, next_address, data)));
            }
            match pool.result_rx.recv() {
                Ok(done) => {
                    pool.ready
                        .insert(done.seq, (done.address, done.next_address, done.payload));
                }
                Err(_) => return Err(Error::HelperPanicked("bgzf decode")),
            }
        }
    }

    /// Pull the next non-empty compressed block off the input. Empty blocks
    /// (interior EOF markers) are consumed and skipped. `None` only at a
    /// clean end of input.
    fn read_raw_block(&mut self) -> Result<Option<RawBlock>> {
        loop {
            let (address, cdata_len) = match self.first_block.take() {
                Some(pending) => (pending.address, pending.cdata_len),
                None => {
                    let address = self.compressed_pos;
                    let input = blocked_input(&mut self.source);
                    let mut fixed = [0u8; 12];
                    let got = read_up_to(input, &mut fixed)?;
                    if got == 0 {
                        return Ok(None);
                    }
                    if got < fixed.len() {
                        return Err(Error::TruncatedBlock { offset: address });
                    }
                    if fixed[0..2] != GZIP_MAGIC || fixed[2] != 8 || fixed[3] != 4 {
                        return Err(Error::BadBlockHeader { offset: address });
                    }
                    let xlen = u16::from_le_bytes([fixed[10], fixed[11]]) as usize;
                    let mut extra = vec![0u8; xlen];
                    input
                        .read_exact(&mut extra)
                        .map_err(|e| truncated(e, address))?;
                    let bsize = match find_bc_subfield(&extra) {
                        Some(bsize) => bsize,
                        None => return Err(Error::BadBlockHeader { offset: address }),
                    };
                    let header_len = fixed.len() + xlen;
                    let total = u64::from(bsize) + 1;
                    if total < header_len as u64 + 8 {
                        return Err(Error::BadBlockHeader { offset: address });
                    }
                    self.compressed_pos = address + header_len as u64;
                    (address, (total - header_len as u64 - 8) as usize)
                }
            };
            let input = blocked_input(&mut self.source);
            let mut cdata = vec![0u8; cdata_len];
            input
                .read_exact(&mut cdata)
                .map_err(|e| truncated(e, address))?;
            let crc = input
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated(e, address))?;
            let isize_ = input
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated(e, address))?;
            self.compressed_pos += cdata_len as u64 + 8;
            if isize_ > MAX_BLOCK_ISIZE {
                return Err(Error::BadBlockHeader { offset: address });
            }
            if isize_ == 0 {
                continue;
            }
            return Ok(Some(RawBlock {
                address,
                next_address: self.compressed_pos,
                cdata,
                crc,
                isize_,
            }));
        }
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    /// Wrap a seekable input, enabling virtual offsets for blocked streams.
    /// Fails with [`Error::MissingEofMarker`] when a blocked stream lacks its
    /// trailing EOF marker (a sign of truncation); use
    /// [`open_unchecked`][BgzfReader::open_unchecked] to proceed anyway.
    pub fn open(input: R) -> Result<Self> {
        let reader = Self::open_unchecked(input)?;
        if reader.missing_eof {
            return Err(Error::MissingEofMarker);
        }
        Ok(reader)
    }

    /// Like [`open`][BgzfReader::open] but tolerates a missing EOF marker,
    /// leaving [`missing_eof`][BgzfReader::missing_eof] queryable.
    pub fn open_unchecked(mut input: R) -> Result<Self> {
        let base = input.stream_position()?;
        let sniffed = sniff(&mut input)?;
        let missing_eof = match sniffed {
            Sniffed::Blocked { .. } => {
                let resume = input.stream_position()?;
                let end = input.seek(SeekFrom::End(0))?;
                let missing = if end < base + EOF_MARKER.len() as u64 {
                    true
                } else {
                    input.seek(SeekFrom::Start(end - EOF_MARKER.len() as u64))?;
                    let mut tail = [0u8; EOF_MARKER.len()];
                    input.read_exact(&mut tail)?;
                    tail != EOF_MARKER
                };
                input.seek(SeekFrom::Start(resume))?;
                missing
            }
            _ => false,
        };
        Ok(Self::from_sniffed(input, sniffed, Some(base), missing_eof))
    }

    /// Reposition so the next delivered byte is the one the virtual offset
    /// addresses. Returns false when the stream is not blocked (virtual
    /// offsets do not apply). Any outstanding chunk must be considered
    /// invalid after a successful seek.
    pub fn seek(&mut self, offset: VirtualOffset) -> Result<bool> {
        if !self.know_offset || !self.is_bgzf() {
            return Ok(false);
        }
        let (address, intra) = split_virtual_offset(offset);
        if let Some(pool) = &mut self.pool {
            // Discard everything in flight; it belongs to the old position.
            pool.in_flight -= pool.ready.len();
            pool.ready.clear();
            while pool.in_flight > 0 {
                if pool.result_rx.recv().is_err() {
                    return Err(Error::HelperPanicked("bgzf decode"));
                }
                pool.in_flight -= 1;
            }
            pool.emit_seq = pool.next_seq;
        }
        let input = blocked_input(&mut self.source);
        input.seek(SeekFrom::Start(address))?;
        self.compressed_pos = address;
        self.first_block = None;
        self.raw_eof = false;
        self.block.clear();
        self.block_offset = 0;
        self.block_address = address;
        self.next_address = address;
        self.pending_intra = if intra > 0 { Some(intra) } else { None };
        Ok(true)
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (n, unused) = match self.next_chunk() {
            Ok(None) => return Ok(0),
            Ok(Some(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                (n, chunk.len() - n)
            }
            Err(e) => return Err(e.into()),
        };
        if unused > 0 {
            self.back_up(unused);
        }
        Ok(n)
    }
}

fn blocked_input<R: Read>(source: &mut Source<R>) -> &mut R {
    match source {
        Source::Blocked(input) => input,
        _ => unreachable!("only called in blocked mode"),
    }
}

fn inflate_raw(inflater: &mut Decompressor, raw: &RawBlock) -> Result<Vec<u8>> {
    let mut out = vec![0u8; raw.isize_ as usize];
    let n = inflater
        .deflate_decompress(&raw.cdata, &mut out)
        .map_err(|e| Error::Inflate {
            offset: raw.address,
            message: e.to_string(),
        })?;
    if n != out.len() {
        return Err(Error::Inflate {
            offset: raw.address,
            message: format!("expected {} bytes, got {}", out.len(), n),
        });
    }
    let mut crc = flate2::Crc::new();
    crc.update(&out);
    if crc.sum() != raw.crc {
        return Err(Error::BlockCrc {
            offset: raw.address,
        });
    }
    Ok(out)
}

fn truncated(e: io::Error, offset: u64) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::TruncatedBlock { offset }
    } else {
        Error::Io(e)
    }
}

/// Fill `buf` from `input`, stopping early only at end of input. Returns the
/// number of bytes read.
fn read_up_to<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn find_bc_subfield(extra: &[u8]) -> Option<u16> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let (si1, si2) = (rest[0], rest[1]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return None;
        }
        if si1 == b'B' && si2 == b'C' && len == 2 {
            return Some(u16::from_le_bytes([rest[4], rest[5]]));
        }
        rest = &rest[4 + len..];
    }
    None
}

/// Decide how the input is stored from its first bytes. Bytes consumed while
/// deciding are either accounted to the first block header (blocked) or
/// replayed ahead of the input (gzip, plain).
fn sniff<R: Read>(input: &mut R) -> io::Result<Sniffed> {
    let mut consumed = Vec::with_capacity(2);
    read_more(input, 2, &mut consumed)?;
    if consumed.len() < 2 || consumed[0..2] != GZIP_MAGIC {
        return Ok(Sniffed::Plain(consumed));
    }
    read_more(input, 8, &mut consumed)?;
    if consumed.len() < 10 || consumed[2] != 8 || consumed[3] != 4 {
        return Ok(Sniffed::Gzip(consumed));
    }
    read_more(input, 2, &mut consumed)?;
    if consumed.len() < 12 {
        return Ok(Sniffed::Gzip(consumed));
    }
    let xlen = u16::from_le_bytes([consumed[10], consumed[11]]) as usize;
    read_more(input, xlen, &mut consumed)?;
    if consumed.len() < 12 + xlen {
        return Ok(Sniffed::Gzip(consumed));
    }
    if let Some(bsize) = find_bc_subfield(&consumed[12..12 + xlen]) {
        let header_len = 12 + xlen;
        let total = u64::from(bsize) + 1;
        if total >= header_len as u64 + 8 {
            return Ok(Sniffed::Blocked {
                header_len,
                cdata_len: (total - header_len as u64 - 8) as usize,
            });
        }
    }
    Ok(Sniffed::Gzip(consumed))
}

fn read_more<R: Read>(input: &mut R, n: usize, consumed: &mut Vec<u8>) -> io::Result<()> {
    let start = consumed.len();
    consumed.resize(start + n, 0);
    let got = read_up_to(input, &mut consumed[start..])?;
    consumed.truncate(start + got);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf::{BgzfWriter, MAX_BLOCK_PAYLOAD};
    use std::io::Cursor;
    use std::io::Write;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn write_blocked(payload: &[u8], eof_marker: bool) -> Vec<u8> {
        let mut writer = BgzfWriter::with_offset(Vec::new(), 0);
        writer.end_file(eof_marker);
        writer.write_all(payload).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn roundtrip_blocked() {
        let payload = pattern(200_000);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        assert!(reader.is_bgzf());
        assert!(!reader.missing_eof());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(reader.byte_count(), payload.len() as u64);
    }

    #[test]
    fn payload_spans_multiple_blocks() {
        let payload = pattern(3 * MAX_BLOCK_PAYLOAD + 17);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        let mut addresses = Vec::new();
        let mut total = 0;
        while let Some(chunk) = reader.next_chunk().unwrap() {
            total += chunk.len();
            addresses.push(reader.tell().unwrap());
        }
        assert_eq!(total, payload.len());
        assert!(addresses.len() >= 4);
        let mut sorted = addresses.clone();
        sorted.sort_unstable();
        assert_eq!(addresses, sorted, "tell is monotonic");
    }

    #[test]
    fn tell_then_seek_is_a_noop() {
        let payload = pattern(150_000);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        let mut head = vec![0u8; 70_000];
        reader.read_exact(&mut head).unwrap();
        let mark = reader.tell().unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(reader.seek(mark).unwrap());
        let mut again = Vec::new();
        reader.read_to_end(&mut again).unwrap();
        assert_eq!(rest, again);
    }

    #[test]
    fn writer_tell_addresses_the_written_byte() {
        let payload = pattern(180_000);
        let mut writer = BgzfWriter::with_offset(Vec::new(), 0);
        writer.end_file(true);
        let mut marks = Vec::new();
        for piece in payload.chunks(50_000) {
            marks.push(writer.tell().unwrap());
            writer.write_all(piece).unwrap();
        }
        let file = writer.finish().unwrap();

        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        for (mark, piece) in marks.iter().zip(payload.chunks(50_000)) {
            assert!(reader.seek(*mark).unwrap());
            let mut got = vec![0u8; piece.len()];
            reader.read_exact(&mut got).unwrap();
            assert_eq!(got, piece);
        }
    }

    #[test]
    fn missing_eof_marker_detected() {
        let file = write_blocked(&pattern(1000), false);
        match BgzfReader::open(Cursor::new(file.clone())) {
            Err(Error::MissingEofMarker) => {}
            other => panic!("expected MissingEofMarker, got {:?}", other.map(|_| ())),
        }
        let mut reader = BgzfReader::open_unchecked(Cursor::new(file)).unwrap();
        assert!(reader.missing_eof());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, pattern(1000));
    }

    #[test]
    fn empty_file_is_clean_eof() {
        let file = write_blocked(&[], true);
        assert_eq!(file.len(), EOF_MARKER.len());
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
        assert_eq!(reader.tell(), Some(virtual_offset(28, 0)));
    }

    #[test]
    fn plain_gzip_input() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let payload = pattern(100_000);
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).unwrap();
        let file = enc.finish().unwrap();

        let mut reader = BgzfReader::new(Cursor::new(file)).unwrap();
        assert!(!reader.is_bgzf());
        assert_eq!(reader.tell(), None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn uncompressed_input_passes_through() {
        let payload = pattern(5000);
        let mut reader = BgzfReader::new(Cursor::new(payload.clone())).unwrap();
        assert!(!reader.is_bgzf());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn back_up_redelivers() {
        let payload = pattern(10_000);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        let first_len = reader.next_chunk().unwrap().unwrap().len();
        reader.back_up(first_len);
        assert_eq!(reader.byte_count(), 0);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn skip_lands_exactly() {
        let payload = pattern(2 * MAX_BLOCK_PAYLOAD);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        assert!(reader.skip(100_000).unwrap());
        let mut got = vec![0u8; 64];
        reader.read_exact(&mut got).unwrap();
        assert_eq!(&got[..], &payload[100_000..100_064]);
        assert!(!reader.skip(u64::MAX).unwrap());
    }

    #[test]
    fn threaded_decode_matches() {
        let payload = pattern(6 * MAX_BLOCK_PAYLOAD + 123);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file))
            .unwrap()
            .with_decode_threads(3);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn threaded_decode_survives_seek() {
        let payload = pattern(6 * MAX_BLOCK_PAYLOAD);
        let file = write_blocked(&payload, true);
        let mut reader = BgzfReader::open(Cursor::new(file))
            .unwrap()
            .with_decode_threads(2);
        let mut head = vec![0u8; 1000];
        reader.read_exact(&mut head).unwrap();
        let mark = reader.tell().unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(reader.seek(mark).unwrap());
        let mut again = Vec::new();
        reader.read_to_end(&mut again).unwrap();
        assert_eq!(rest, again);
    }

    #[test]
    fn interior_eof_markers_are_skipped() {
        let mut file = write_blocked(&pattern(1000), true);
        let mut second = write_blocked(&pattern(500), true);
        file.append(&mut second);
        let mut reader = BgzfReader::open(Cursor::new(file)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let mut expected = pattern(1000);
        expected.extend_from_slice(&pattern(500));
        assert_eq!(out, expected);
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut file = write_blocked(&pattern(50_000), false);
        file.truncate(file.len() - 10);
        let mut reader = BgzfReader::new(Cursor::new(file)).unwrap();
        let mut out = Vec::new();
        match reader.read_to_end(&mut out) {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            Ok(_) => panic!("truncated block went unnoticed"),
        }
    }
}
