//! Merging the output of several producer threads into one stream.
//!
//! Each producer owns a [`ProducerWriter`] and writes into a private buffer.
//! At points where the output format could tolerate a cut, the producer
//! declares a breakpoint; once enough bytes have accumulated the buffer is
//! queued on the producer's ring and a background consumer thread splices
//! queued buffers into the backing stream, round-robin across producers.
//! Bytes written between two breakpoints of one producer are never
//! interleaved with another producer's bytes.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_utils::atomic::AtomicCell;

/// Slots per producer ring. One slot is always left empty to tell a full
/// ring from an empty one.
pub const RING_BUFFER_SIZE: usize = 10;

/// Buffers smaller than this are not worth queueing; a breakpoint on a
/// smaller buffer just remembers the cut position.
pub const MIN_QUEUE_ITEM_BYTES: usize = 640 * 1024;

struct Ring {
    slots: Vec<Option<Vec<u8>>>,
    head: usize,
    tail: usize,
    queued_bytes: usize,
    /// Emptied buffers handed back for reuse.
    spares: Vec<Vec<u8>>,
    producer_done: bool,
}

impl Ring {
    fn new() -> Self {
        Ring {
            slots: (0..RING_BUFFER_SIZE).map(|_| None).collect(),
            head: 0,
            tail: 0,
            queued_bytes: 0,
            spares: Vec::new(),
            producer_done: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % RING_BUFFER_SIZE == self.head
    }

    fn push(&mut self, buf: Vec<u8>) {
        debug_assert!(!self.is_full());
        self.queued_bytes += buf.len();
        self.slots[self.tail] = Some(buf);
        self.tail = (self.tail + 1) % RING_BUFFER_SIZE;
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let buf = self.slots[self.head].take().expect("occupied slot");
        self.head = (self.head + 1) % RING_BUFFER_SIZE;
        self.queued_bytes -= buf.len();
        buf.into()
    }
}

struct Shared {
    rings: Vec<(Mutex<Ring>, Condvar)>,
    stop: AtomicBool,
    error: AtomicCell<Option<io::Error>>,
}

/// Serializer for the output of `n` producer threads.
///
/// Hand each producer thread one [`ProducerWriter`] from
/// [`take_handles`][StreamMultiplexer::take_handles]. After every producer
/// handle has been dropped, [`finish`][StreamMultiplexer::finish] drains the
/// rings, flushes the backing stream, and surfaces any deferred write error.
pub struct StreamMultiplexer<W: Write + Send + 'static> {
    shared: Arc<Shared>,
    consumer: Option<JoinHandle<io::Result<W>>>,
    handles_taken: bool,
    producers: usize,
}

impl<W: Write + Send + 'static> StreamMultiplexer<W> {
    /// Start the consumer thread over `backing`, ready for `producers`
    /// producer threads.
    pub fn new(backing: W, producers: usize) -> Self {
        assert!(producers > 0, "need at least one producer");
        let shared = Arc::new(Shared {
            rings: (0..producers)
                .map(|_| (Mutex::new(Ring::new()), Condvar::new()))
                .collect(),
            stop: AtomicBool::new(false),
            error: AtomicCell::new(None),
        });
        let consumer = {
            let shared = shared.clone();
            std::thread::spawn(move || consume(shared, backing))
        };
        StreamMultiplexer {
            shared,
            consumer: Some(consumer),
            handles_taken: false,
            producers,
        }
    }

    /// The producer writers, one per producer thread, in producer order.
    /// May only be taken once.
    pub fn take_handles(&mut self) -> Vec<ProducerWriter> {
        assert!(!self.handles_taken, "handles were already taken");
        self.handles_taken = true;
        (0..self.producers)
            .map(|index| ProducerWriter {
                shared: self.shared.clone(),
                index,
                buf: Vec::new(),
                breakpoint: 0,
            })
            .collect()
    }

    /// Stop the consumer once every producer is done, drain everything, and
    /// return the backing stream. Call after all producer writers have been
    /// dropped; blocks until they are.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.handles_taken {
            self.mark_all_done();
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        let backing = self
            .consumer
            .take()
            .expect("finish runs once")
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "consumer thread panicked"))??;
        match self.shared.error.take() {
            Some(e) => Err(e),
            None => Ok(backing),
        }
    }
}

impl<W: Write + Send + 'static> StreamMultiplexer<W> {
    fn mark_all_done(&self) {
        for (ring, cond) in &self.shared.rings {
            if let Ok(mut guard) = ring.lock() {
                guard.producer_done = true;
            }
            cond.notify_all();
        }
    }
}

impl<W: Write + Send + 'static> Drop for StreamMultiplexer<W> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(consumer) = self.consumer.take() {
            if !self.handles_taken {
                self.mark_all_done();
            }
            let all_done = self
                .shared
                .rings
                .iter()
                .all(|(ring, _)| ring.lock().map(|r| r.producer_done).unwrap_or(true));
            if all_done {
                let _ = consumer.join();
            }
            // Otherwise leave the consumer detached; it exits once the
            // remaining producer writers are dropped.
        }
    }
}

/// One producer thread's private writer into a [`StreamMultiplexer`].
///
/// Writing never touches the backing stream directly; bytes reach it only
/// after [`register_breakpoint`][ProducerWriter::register_breakpoint] (or
/// [`register_barrier`][ProducerWriter::register_barrier]) queues the buffer
/// for the consumer. Dropping the writer queues whatever is left.
pub struct ProducerWriter {
    shared: Arc<Shared>,
    index: usize,
    buf: Vec<u8>,
    breakpoint: usize,
}

impl ProducerWriter {
    /// True when enough bytes are pending that the next breakpoint will
    /// actually ship them.
    pub fn want_breakpoint(&self) -> bool {
        self.buf.len() >= MIN_QUEUE_ITEM_BYTES
    }

    /// Declare that the output format could be cut here. Ships the pending
    /// buffer when it is large enough (blocking while this producer's ring
    /// is full); otherwise just remembers the position for
    /// [`discard_to_breakpoint`][ProducerWriter::discard_to_breakpoint].
    pub fn register_breakpoint(&mut self) {
        if self.buf.len() >= MIN_QUEUE_ITEM_BYTES {
            self.push_pending();
        } else {
            self.breakpoint = self.buf.len();
        }
    }

    /// Ship the pending buffer unconditionally and wait until the consumer
    /// has drained this producer's ring. On return, everything this
    /// producer ever wrote is ahead of any future write by any producer.
    pub fn register_barrier(&mut self) {
        self.push_pending();
        let (ring, cond) = &self.shared.rings[self.index];
        let mut guard = ring.lock().unwrap();
        while !guard.is_empty() {
            guard = cond.wait(guard).unwrap();
        }
    }

    /// Drop everything written since the last breakpoint.
    pub fn discard_to_breakpoint(&mut self) {
        self.buf.truncate(self.breakpoint);
    }

    /// Rewind by up to `count` bytes, but never past the last breakpoint.
    pub fn discard_bytes(&mut self, count: usize) {
        let target = self.buf.len().saturating_sub(count).max(self.breakpoint);
        self.buf.truncate(target);
    }

    fn push_pending(&mut self) {
        let (ring, cond) = &self.shared.rings[self.index];
        let mut guard = ring.lock().unwrap();
        while guard.is_full() {
            guard = cond.wait(guard).unwrap();
        }
        let spare = guard.spares.pop().unwrap_or_default();
        let full = std::mem::replace(&mut self.buf, spare);
        self.buf.clear();
        guard.push(full);
        drop(guard);
        cond.notify_all();
        self.breakpoint = 0;
    }
}

impl Write for ProducerWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ProducerWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.push_pending();
        }
        let (ring, cond) = &self.shared.rings[self.index];
        if let Ok(mut guard) = ring.lock() {
            guard.producer_done = true;
        }
        cond.notify_all();
    }
}

fn consume<W: Write + Send + 'static>(shared: Arc<Shared>, mut backing: W) -> io::Result<W> {
    let mut failed = false;
    loop {
        let mut found_data = false;
        let mut all_done = true;
        for (ring, cond) in &shared.rings {
            let popped = {
                let mut guard = ring.lock().unwrap();
                if !guard.producer_done || !guard.is_empty() {
                    all_done = false;
                }
                guard.pop()
            };
            if let Some(buf) = popped {
                found_data = true;
                if !failed {
                    if let Err(e) = backing.write_all(&buf) {
                        // Remember the first error; keep draining so no
                        // producer stays blocked on a full ring.
                        shared.error.store(Some(e));
                        failed = true;
                    }
                }
                let mut guard = ring.lock().unwrap();
                let mut spare = buf;
                spare.clear();
                guard.spares.push(spare);
                drop(guard);
                cond.notify_all();
            }
        }
        if shared.stop.load(Ordering::SeqCst) && all_done && !found_data {
            break;
        }
        if !found_data {
            std::thread::yield_now();
        }
    }
    if !failed {
        if let Err(e) = backing.flush() {
            shared.error.store(Some(e));
        }
    }
    Ok(backing)
}
