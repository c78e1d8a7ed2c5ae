//! High-level drivers over group streams: typed serial iteration, buffered
//! writing, and a parallel batch pipeline that fans message decoding out to
//! worker tasks.
//!
//! The parallel drivers take a caller-provided [`Runtime`] to run decode
//! batches on, and apply back-pressure by running a batch inline on the main
//! thread whenever too many are outstanding. The outstanding cap adapts: it
//! doubles (up to a limit) every time an inline batch finishes while the
//! buffer was mostly drained, a sign the pipeline was starved rather than
//! saturated.

use std::any::type_name;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::runtime::Runtime;

use crate::bgzf::EOF_MARKER;
use crate::error::{parse_error, Error, Result};
use crate::group::{EmitOptions, GroupEmitter, GroupIterator};
use crate::message::Message;
use crate::registry;

/// Default number of message bodies per decode batch.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Hard ceiling for the adaptive outstanding-batch cap.
const MAX_BATCHES_OUTSTANDING: usize = 8192;

/// Typed pull iterator over the messages of one payload kind.
///
/// The first message's tag must match `T`'s registration (or be the legacy
/// empty tag); later groups with foreign tags are skipped in place.
pub struct MessageStream<T: Message, R: Read> {
    groups: GroupIterator<R>,
    first_message: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message, R: Read> MessageStream<T, R> {
    pub fn new(groups: GroupIterator<R>) -> Self {
        MessageStream {
            groups,
            first_message: true,
            _marker: PhantomData,
        }
    }

    /// Sniff and wrap `input`, then iterate its messages.
    pub fn from_reader(input: R) -> Result<Self> {
        Ok(Self::new(GroupIterator::new(input)?))
    }

    /// Virtual offset of the current group, when the input can tell.
    pub fn tell_group(&self) -> Option<u64> {
        self.groups.tell_group()
    }

    pub fn next_message(&mut self) -> Result<Option<T>> {
        loop {
            let item = match (&mut self.groups).take()? {
                None => return Ok(None),
                Some(item) => item,
            };
            if !registry::check_tag::<T>(&item.tag) {
                if self.first_message {
                    return Err(Error::TagMismatch {
                        kind: type_name::<T>(),
                        found: String::from_utf8_lossy(&item.tag).into_owned(),
                    });
                }
                continue;
            }
            self.first_message = false;
            let body = match item.body {
                None => continue,
                Some(body) => body,
            };
            return decode_message::<T>(&body).map(Some);
        }
    }
}

impl<T: Message, R: Read> Iterator for MessageStream<T, R> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

fn decode_message<T: Message>(buf: &[u8]) -> Result<T> {
    T::decode(buf).map_err(|e| parse_error(type_name::<T>(), e))
}

/// Run `f` over every message of kind `T` in `input`, in file order.
pub fn for_each<T, R, F>(input: R, mut f: F) -> Result<()>
where
    T: Message,
    R: Read,
    F: FnMut(T) -> Result<()>,
{
    let mut stream = MessageStream::<T, R>::from_reader(input)?;
    while let Some(message) = stream.next_message()? {
        f(message)?;
    }
    Ok(())
}

/// Like [`for_each`], additionally passing each message's group start
/// virtual offset (`None` on untellable input).
pub fn for_each_tagged<T, R, F>(mut groups: GroupIterator<R>, mut f: F) -> Result<()>
where
    T: Message,
    R: Read,
    F: FnMut(Option<u64>, T) -> Result<()>,
{
    let mut first_message = true;
    loop {
        let group_vo = groups.tell_group();
        let item = match (&mut groups).take()? {
            None => return Ok(()),
            Some(item) => item,
        };
        if !registry::check_tag::<T>(&item.tag) {
            if first_message {
                return Err(Error::TagMismatch {
                    kind: type_name::<T>(),
                    found: String::from_utf8_lossy(&item.tag).into_owned(),
                });
            }
            continue;
        }
        first_message = false;
        if let Some(body) = item.body {
            f(group_vo, decode_message::<T>(&body)?)?;
        }
    }
}

/// Write `items` as one run of tagged groups and return the output stream.
/// The tag comes from `T`'s [`registry`] registration. No EOF marker is
/// appended; see [`finish`].
pub fn write_all<T, W>(out: W, compress: bool, items: &[T]) -> Result<W>
where
    T: Message,
    W: Write,
{
    let tag = registry::tag_for::<T>().ok_or(Error::NoSaver {
        kind: type_name::<T>(),
    })?;
    let mut emitter = GroupEmitter::with_options(
        out,
        EmitOptions {
            compress,
            end_file: false,
            ..EmitOptions::default()
        },
    );
    let mut buf = Vec::new();
    for item in items {
        buf.clear();
        item.encode(&mut buf);
        emitter.write(&tag, &buf)?;
    }
    emitter.finish()
}

/// Start, continue, or end a buffered write session. Flushes `buffer` as a
/// run of groups once it holds `limit` items. A `limit` of zero ends the
/// session: the buffer is flushed and the EOF marker appended. Returns
/// whether anything was written.
pub fn write_buffered<T, W>(
    out: &mut W,
    buffer: &mut Vec<T>,
    limit: usize,
    compress: bool,
) -> Result<bool>
where
    T: Message,
    W: Write,
{
    let mut wrote = false;
    if buffer.len() >= limit && !buffer.is_empty() {
        write_all(&mut *out, compress, buffer)?;
        buffer.clear();
        wrote = true;
    }
    if limit == 0 {
        finish(&mut *out, compress)?;
    }
    Ok(wrote)
}

/// Write a single message to a file, uncompressed.
pub fn write_to_file<T: Message>(item: &T, path: &str) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_all(file, false, std::slice::from_ref(item))?;
    Ok(())
}

/// Append the EOF marker so readers will not flag the file as truncated.
/// A no-op for uncompressed output, which has no marker.
pub fn finish<W: Write>(mut out: W, compressed: bool) -> Result<W> {
    if compressed {
        out.write_all(&EOF_MARKER)?;
        out.flush()?;
    }
    Ok(out)
}

/// Knobs for the parallel drivers.
pub struct BatchOptions<'a> {
    /// Message bodies per batch; must be even so interleaved pairs never
    /// straddle a batch.
    pub batch_size: usize,
    /// Compressed input length, for progress reporting.
    pub stream_length: Option<u64>,
    /// Invoked periodically with (compressed position, stream length) when
    /// both are known.
    pub progress: Option<&'a mut dyn FnMut(u64, u64)>,
}

impl<'a> Default for BatchOptions<'a> {
    fn default() -> Self {
        BatchOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            stream_length: None,
            progress: None,
        }
    }
}

type PairFn<T> = Arc<dyn Fn(T, T) -> Result<()> + Send + Sync>;
type SoloFn<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

/// Run `f` over every message of kind `T`, decoding batches on `runtime`
/// workers. Calls may run concurrently; ordering between batches is not
/// preserved.
pub fn for_each_parallel<T, R, F>(
    groups: GroupIterator<R>,
    runtime: &Runtime,
    options: BatchOptions<'_>,
    f: F,
) -> Result<()>
where
    T: Message,
    R: Read,
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let pair: PairFn<T> = {
        let f = f.clone();
        Arc::new(move |a, b| {
            f(a)?;
            f(b)
        })
    };
    let odd: SoloFn<T> = Arc::new(move |a| f(a));
    for_each_parallel_impl(groups, runtime, options, pair, odd, || true)
}

/// Run `f` over consecutive interleaved pairs of messages. Pairs may be
/// processed concurrently, but the two elements of a pair are always passed
/// together, in order. An odd trailing message is an error.
pub fn for_each_interleaved_pair_parallel<T, R, F>(
    groups: GroupIterator<R>,
    runtime: &Runtime,
    options: BatchOptions<'_>,
    f: F,
) -> Result<()>
where
    T: Message,
    R: Read,
    F: Fn(T, T) -> Result<()> + Send + Sync + 'static,
{
    for_each_parallel_impl(
        groups,
        runtime,
        options,
        Arc::new(f),
        Arc::new(|_| Err(Error::OddMessageCount)),
        || true,
    )
}

/// Like [`for_each_interleaved_pair_parallel`], but batches stay on the
/// main thread until `parallel_allowed` first returns true. Useful when the
/// callback needs a single-threaded warm-up phase.
pub fn for_each_interleaved_pair_parallel_after_wait<T, R, F, P>(
    groups: GroupIterator<R>,
    runtime: &Runtime,
    options: BatchOptions<'_>,
    f: F,
    parallel_allowed: P,
) -> Result<()>
where
    T: Message,
    R: Read,
    F: Fn(T, T) -> Result<()> + Send + Sync + 'static,
    P: Fn() -> bool,
{
    for_each_parallel_impl(
        groups,
        runtime,
        options,
        Arc::new(f),
        Arc::new(|_| Err(Error::OddMessageCount)),
        parallel_allowed,
    )
}

fn for_each_parallel_impl<T, R, P>(
    mut groups: GroupIterator<R>,
    runtime: &Runtime,
    mut options: BatchOptions<'_>,
    pair: PairFn<T>,
    odd: SoloFn<T>,
    parallel_allowed: P,
) -> Result<()>
where
    T: Message,
    R: Read,
    P: Fn() -> bool,
{
    let batch_size = options.batch_size;
    assert!(
        batch_size > 0 && batch_size % 2 == 0,
        "batch size must be even"
    );
    let outstanding = Arc::new(AtomicUsize::new(0));
    let mut max_outstanding = batch_size.min(MAX_BATCHES_OUTSTANDING);
    let mut handles: Vec<tokio::task::JoinHandle<Result<()>>> = Vec::new();
    let mut batch: Vec<Vec<u8>> = Vec::with_capacity(batch_size);
    let mut first_message = true;
    let mut failure: Option<Error> = None;

    loop {
        let item = match (&mut groups).take() {
            Ok(None) => break,
            Ok(Some(item)) => item,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        if !registry::check_tag::<T>(&item.tag) {
            if first_message {
                failure = Some(Error::TagMismatch {
                    kind: type_name::<T>(),
                    found: String::from_utf8_lossy(&item.tag).into_owned(),
                });
                break;
            }
            continue;
        }
        first_message = false;
        let body = match item.body {
            None => continue,
            Some(body) => body,
        };
        batch.push(body);

        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            let now_outstanding = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            let allowed = parallel_allowed();
            if now_outstanding >= max_outstanding || !allowed {
                // Back-pressure: run this batch right here.
                let result = process_pairs::<T>(&full, &pair);
                let after = outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
                if let Err(e) = result {
                    failure = Some(e);
                    break;
                }
                if allowed && max_outstanding < MAX_BATCHES_OUTSTANDING
                    && after * 4 < max_outstanding * 3
                {
                    // The buffer drained while we were busy; it was too
                    // small to keep the workers fed.
                    max_outstanding *= 2;
                }
            } else {
                let pair = pair.clone();
                let outstanding = outstanding.clone();
                handles.push(runtime.spawn(async move {
                    let result = process_pairs::<T>(&full, &pair);
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    result
                }));
            }
        }

        if let (Some(progress), Some(length)) = (options.progress.as_mut(), options.stream_length)
        {
            if let Some(vo) = groups.tell_group() {
                progress(vo >> 16, length);
            }
        }
    }

    for joined in runtime.block_on(join_all(handles)) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                if failure.is_none() {
                    failure = Some(Error::HelperPanicked("batch worker"));
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    // Trailing partial batch, on the main thread.
    let count = batch.len();
    let mut bodies = batch.into_iter();
    for _ in 0..count / 2 {
        let a = decode_message::<T>(&bodies.next().expect("counted"))?;
        let b = decode_message::<T>(&bodies.next().expect("counted"))?;
        pair(a, b)?;
    }
    if count % 2 == 1 {
        let last = decode_message::<T>(&bodies.next().expect("counted"))?;
        odd(last)?;
    }
    Ok(())
}

fn process_pairs<T: Message>(batch: &[Vec<u8>], pair: &PairFn<T>) -> Result<()> {
    // Full batches have even length; pairs never straddle batches.
    let mut i = 0;
    while i + 1 < batch.len() {
        let a = decode_message::<T>(&batch[i])?;
        let b = decode_message::<T>(&batch[i + 1])?;
        pair(a, b)?;
        i += 2;
    }
    Ok(())
}
