//! Process-wide registry mapping group tags to payload kinds and to the
//! adapters that load and save them.
//!
//! Registration is append-only and must complete before any reader or
//! dispatcher runs; the usual place is program start-up. Payload kinds are
//! identified by [`TypeId`], and loaded values travel as `Box<dyn Any>` until
//! the typed API boundary downcasts them.
//!
//! Three families of registration exist:
//!
//! - [`register_message`]: associate a tag with a message payload type, for
//!   streams consumed message by message (see [`crate::stream`]).
//! - [`register_loader_saver`]: adapters speaking the message-source /
//!   message-consumer protocol, for whole objects stored as a run of tagged
//!   messages.
//! - the `register_bare_loader_saver*` functions: adapters that read or
//!   write a raw byte stream (legacy file families). They are wrapped with
//!   [`wrap_bare_loader`] / [`wrap_bare_saver`] so the same object can also
//!   live inside a tagged stream, and may carry a [`Sniff`] rule so bare
//!   files are recognized by magic bytes or a header check.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::utils::putback::Peek;

/// Longest permitted tag. With tags this short, the first two bytes of a
/// valid uncompressed group can never equal the gzip magic, which is what
/// makes format sniffing reliable.
pub const MAX_TAG_LENGTH: usize = 25;

/// A loaded payload of some registered kind.
pub type AnyPayload = Box<dyn Any + Send>;

/// Callback fed one message body at a time.
pub type MessageConsumer<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

/// Callback that drives a [`MessageConsumer`] over a run of messages.
pub type MessageSource<'a> = dyn FnMut(&mut MessageConsumer<'_>) -> Result<()> + 'a;

/// Loads an object by pulling messages from a source.
pub type LoadFn = Arc<dyn Fn(&mut MessageSource<'_>) -> Result<AnyPayload> + Send + Sync>;

/// Saves an object by pushing messages into a consumer.
pub type SaveFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &mut MessageConsumer<'_>) -> Result<()> + Send + Sync>;

/// Loads an object from a raw byte stream. The second argument is the source
/// file name when known, or empty.
pub type BareLoadFn = Arc<dyn Fn(&mut dyn Read, &str) -> Result<AnyPayload> + Send + Sync>;

/// Saves an object to a raw byte stream.
pub type BareSaveFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &mut dyn Write) -> Result<()> + Send + Sync>;

/// Header predicate for bare loaders; must only peek, never consume.
pub type SniffFn = Arc<dyn Fn(&mut dyn Peek) -> io::Result<bool> + Send + Sync>;

/// When a bare loader may be auto-selected for an unidentified file.
#[derive(Clone)]
pub enum Sniff {
    /// When the file starts with these bytes.
    Magic(Vec<u8>),
    /// When this predicate accepts the file head.
    Check(SniffFn),
    /// Never automatically; only reachable through a tagged stream or an
    /// explicit caller choice.
    Manual,
}

/// Registers a loader under an additional payload kind, typically a boxed
/// trait object the concrete type can be converted into. Lets a caller ask
/// for the abstract kind and receive whichever concrete implementation the
/// file holds.
#[derive(Clone)]
pub struct Upcast {
    kind: TypeId,
    convert: Arc<dyn Fn(AnyPayload) -> AnyPayload + Send + Sync>,
}

impl Upcast {
    pub fn to<T: Any + Send, B: Any + Send>(convert: fn(T) -> B) -> Upcast {
        Upcast {
            kind: TypeId::of::<B>(),
            convert: Arc::new(move |payload| {
                let value = payload
                    .downcast::<T>()
                    .expect("payload kind matches its registration");
                Box::new(convert(*value))
            }),
        }
    }
}

#[derive(Default)]
struct Tables {
    tag_to_kind: HashMap<Vec<u8>, TypeId>,
    kind_to_tag: HashMap<TypeId, Vec<u8>>,
    tag_to_loader: HashMap<Vec<u8>, HashMap<TypeId, LoadFn>>,
    kind_to_saver: HashMap<TypeId, (Vec<u8>, SaveFn)>,
    kind_to_bare: HashMap<TypeId, Vec<(BareLoadFn, Sniff)>>,
}

fn tables() -> &'static RwLock<Tables> {
    static TABLES: OnceLock<RwLock<Tables>> = OnceLock::new();
    TABLES.get_or_init(Default::default)
}

fn assert_tag(tag: &[u8]) {
    assert!(!tag.is_empty(), "tag must not be empty");
    assert!(
        tag.len() <= MAX_TAG_LENGTH,
        "tag of {} bytes is over the {} byte limit",
        tag.len(),
        MAX_TAG_LENGTH
    );
}

/// Associate `tag` with message payload type `T`.
pub fn register_message<T: Any>(tag: &[u8]) {
    assert_tag(tag);
    let mut tables = tables().write().unwrap();
    tables.tag_to_kind.insert(tag.to_vec(), TypeId::of::<T>());
    tables.kind_to_tag.insert(TypeId::of::<T>(), tag.to_vec());
}

/// Whether `tag` has been registered in any role. Unregistered first strings
/// are read as legacy untagged message data.
pub fn is_valid_tag(tag: &[u8]) -> bool {
    if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
        return false;
    }
    let tables = tables().read().unwrap();
    tables.tag_to_kind.contains_key(tag) || tables.tag_to_loader.contains_key(tag)
}

/// The tag to write when serializing messages of type `T`.
pub fn tag_for<T: Any>() -> Option<Vec<u8>> {
    let tables = tables().read().unwrap();
    tables.kind_to_tag.get(&TypeId::of::<T>()).cloned()
}

/// Whether a group with `tag` may hold messages of type `T`. The empty tag
/// (legacy untagged data) is accepted for any type.
pub fn check_tag<T: Any>(tag: &[u8]) -> bool {
    if tag.is_empty() {
        return true;
    }
    if tag.len() > MAX_TAG_LENGTH {
        return false;
    }
    let tables = tables().read().unwrap();
    tables.tag_to_kind.get(tag) == Some(&TypeId::of::<T>())
}

/// Register a loader for type `T` under each of `tags`. An empty tag in the
/// list lets the loader run on untagged legacy groups. `bases` registers the
/// same loader under further payload kinds.
pub fn register_loader<T, L>(tags: &[&[u8]], bases: &[Upcast], loader: L)
where
    T: Any + Send,
    L: Fn(&mut MessageSource<'_>) -> Result<T> + Send + Sync + 'static,
{
    assert!(!tags.is_empty(), "at least one tag is required");
    for tag in tags {
        assert!(
            tag.len() <= MAX_TAG_LENGTH,
            "tag of {} bytes is over the {} byte limit",
            tag.len(),
            MAX_TAG_LENGTH
        );
    }
    let load: LoadFn = Arc::new(move |source| loader(source).map(|v| Box::new(v) as AnyPayload));
    register_loader_fns(tags, TypeId::of::<T>(), bases, load);
}

fn register_loader_fns(tags: &[&[u8]], kind: TypeId, bases: &[Upcast], load: LoadFn) {
    let mut tables = tables().write().unwrap();
    for tag in tags {
        let by_kind = tables.tag_to_loader.entry(tag.to_vec()).or_default();
        by_kind.insert(kind, load.clone());
        for base in bases {
            let convert = base.convert.clone();
            let inner = load.clone();
            by_kind.insert(
                base.kind,
                Arc::new(move |source| inner(source).map(|p| convert(p))),
            );
        }
    }
}

fn register_saver_fn(tag: &[u8], kind: TypeId, save: SaveFn) {
    assert_tag(tag);
    let mut tables = tables().write().unwrap();
    tables.kind_to_saver.insert(kind, (tag.to_vec(), save));
}

/// Register a loader and saver for `T`. The first tag is used for saving;
/// every tag loads.
pub fn register_loader_saver<T, L, S>(tags: &[&[u8]], bases: &[Upcast], loader: L, saver: S)
where
    T: Any + Send,
    L: Fn(&mut MessageSource<'_>) -> Result<T> + Send + Sync + 'static,
    S: Fn(&T, &mut MessageConsumer<'_>) -> Result<()> + Send + Sync + 'static,
{
    assert!(!tags.is_empty(), "at least one tag is required");
    assert_tag(tags[0]);
    register_loader::<T, L>(tags, bases, loader);
    let save: SaveFn = Arc::new(move |value, consumer| {
        let value = value
            .downcast_ref::<T>()
            .expect("saver registered for this kind");
        saver(value, consumer)
    });
    register_saver_fn(tags[0], TypeId::of::<T>(), save);
}

/// Register bare stream adapters for `T` with no auto-sniffing; the bare
/// loader is only reachable through a tagged stream or an explicit caller
/// choice.
pub fn register_bare_loader_saver<T, L, S>(tag: &[u8], bases: &[Upcast], loader: L, saver: S)
where
    T: Any + Send + Sync,
    L: Fn(&mut dyn Read, &str) -> Result<T> + Send + Sync + 'static,
    S: Fn(&T, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
{
    register_bare(tag, bases, vec![Sniff::Manual], loader, saver);
}

/// Register bare stream adapters for `T`, auto-selected for files starting
/// with any of `magics`.
pub fn register_bare_loader_saver_with_magics<T, L, S>(
    tag: &[u8],
    magics: &[&[u8]],
    bases: &[Upcast],
    loader: L,
    saver: S,
) where
    T: Any + Send + Sync,
    L: Fn(&mut dyn Read, &str) -> Result<T> + Send + Sync + 'static,
    S: Fn(&T, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
{
    assert!(!magics.is_empty(), "at least one magic is required");
    let sniffs = magics
        .iter()
        .map(|m| {
            assert!(!m.is_empty(), "magic bytes must not be empty");
            Sniff::Magic(m.to_vec())
        })
        .collect();
    register_bare(tag, bases, sniffs, loader, saver);
}

/// Register bare stream adapters for `T`, auto-selected when `check`
/// accepts the file head. The predicate must only peek.
pub fn register_bare_loader_saver_with_header_check<T, C, L, S>(
    tag: &[u8],
    check: C,
    bases: &[Upcast],
    loader: L,
    saver: S,
) where
    T: Any + Send + Sync,
    C: Fn(&mut dyn Peek) -> io::Result<bool> + Send + Sync + 'static,
    L: Fn(&mut dyn Read, &str) -> Result<T> + Send + Sync + 'static,
    S: Fn(&T, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
{
    register_bare(
        tag,
        bases,
        vec![Sniff::Check(Arc::new(check))],
        loader,
        saver,
    );
}

fn register_bare<T, L, S>(tag: &[u8], bases: &[Upcast], sniffs: Vec<Sniff>, loader: L, saver: S)
where
    T: Any + Send + Sync,
    L: Fn(&mut dyn Read, &str) -> Result<T> + Send + Sync + 'static,
    S: Fn(&T, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
{
    assert_tag(tag);
    let bare_load: BareLoadFn = Arc::new(move |stream, filename| {
        loader(stream, filename).map(|v| Box::new(v) as AnyPayload)
    });
    let bare_save: BareSaveFn = Arc::new(move |value, stream| {
        let value = value
            .downcast_ref::<T>()
            .expect("saver registered for this kind");
        saver(value, stream)
    });

    // The same adapters, reframed to live inside a tagged stream.
    register_loader_fns(
        &[tag],
        TypeId::of::<T>(),
        bases,
        wrap_bare_loader(bare_load.clone()),
    );
    register_saver_fn(tag, TypeId::of::<T>(), wrap_bare_saver(bare_save));

    let mut tables = tables().write().unwrap();
    for sniff in sniffs {
        tables
            .kind_to_bare
            .entry(TypeId::of::<T>())
            .or_default()
            .push((bare_load.clone(), sniff.clone()));
        for base in bases {
            let convert = base.convert.clone();
            let inner = bare_load.clone();
            let converted: BareLoadFn =
                Arc::new(move |stream, filename| inner(stream, filename).map(|p| convert(p)));
            tables
                .kind_to_bare
                .entry(base.kind)
                .or_default()
                .push((converted, sniff.clone()));
        }
    }
}

/// The loader able to produce a `T` from groups tagged `tag`, if any.
pub fn find_loader<T: Any>(tag: &[u8]) -> Option<LoadFn> {
    if tag.len() > MAX_TAG_LENGTH {
        return None;
    }
    let tables = tables().read().unwrap();
    tables
        .tag_to_loader
        .get(tag)
        .and_then(|by_kind| by_kind.get(&TypeId::of::<T>()))
        .cloned()
}

/// All bare loaders able to produce a `T`, with their sniff rules, in
/// registration order.
pub fn find_bare_loaders<T: Any>() -> Vec<(BareLoadFn, Sniff)> {
    let tables = tables().read().unwrap();
    tables
        .kind_to_bare
        .get(&TypeId::of::<T>())
        .cloned()
        .unwrap_or_default()
}

/// The tag and saver to serialize a `T` with, if registered.
pub fn find_saver<T: Any>() -> Option<(Vec<u8>, SaveFn)> {
    let tables = tables().read().unwrap();
    tables.kind_to_saver.get(&TypeId::of::<T>()).cloned()
}

/// Adapt a bare stream loader to the message-source protocol. The bare
/// loader runs in a helper thread against a byte stream whose content is the
/// concatenation of the source's messages, handed over one message at a time
/// through a rendezvous channel.
pub fn wrap_bare_loader(bare: BareLoadFn) -> LoadFn {
    Arc::new(move |source: &mut MessageSource<'_>| -> Result<AnyPayload> {
        let bare = bare.clone();
        let (tx, rx) = bounded::<Vec<u8>>(0);
        std::thread::scope(|scope| {
            let loader = scope.spawn(move || {
                let mut input = ChannelReader::new(rx);
                bare(&mut input, "")
            });
            let mut consumer = |message: &[u8]| -> Result<()> {
                // The loader may stop reading before the messages run out;
                // the rest just has nowhere to go.
                let _ = tx.send(message.to_vec());
                Ok(())
            };
            let fed = source(&mut consumer);
            drop(tx);
            let loaded = loader
                .join()
                .map_err(|_| Error::HelperPanicked("bare loader"))?;
            fed?;
            loaded
        })
    })
}

/// Adapt a bare stream saver to the message-consumer protocol, the dual of
/// [`wrap_bare_loader`]: the bare saver runs in a helper thread writing to a
/// stream whose chunks come back to the calling thread as messages.
pub fn wrap_bare_saver(bare: BareSaveFn) -> SaveFn {
    Arc::new(
        move |value: &(dyn Any + Send + Sync), consumer: &mut MessageConsumer<'_>| -> Result<()> {
            let bare = bare.clone();
            let (tx, rx) = bounded::<Vec<u8>>(0);
            std::thread::scope(|scope| {
                let saver = scope.spawn(move || -> Result<()> {
                    let mut output = ChannelWriter::new(tx);
                    bare(value, &mut output)?;
                    output.finish()
                });
                let mut first_err: Option<Error> = None;
                for chunk in rx.iter() {
                    if first_err.is_none() {
                        if let Err(e) = consumer(&chunk) {
                            // Keep draining so the helper can finish.
                            first_err = Some(e);
                        }
                    }
                }
                let saved = saver
                    .join()
                    .map_err(|_| Error::HelperPanicked("bare saver"))?;
                match first_err {
                    Some(e) => Err(e),
                    None => saved,
                }
            })
        },
    )
}

/// Run `use_stream` with a writer whose output is chopped into chunks and
/// fed to `consumer` on the calling thread. The stream-using callback runs
/// in a helper thread.
pub fn with_function_calling_stream<F>(consumer: &mut MessageConsumer<'_>, use_stream: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()> + Send,
{
    let (tx, rx) = bounded::<Vec<u8>>(0);
    std::thread::scope(|scope| {
        let helper = scope.spawn(move || -> Result<()> {
            let mut output = ChannelWriter::new(tx);
            use_stream(&mut output)?;
            output.finish()
        });
        let mut first_err: Option<Error> = None;
        for chunk in rx.iter() {
            if first_err.is_none() {
                if let Err(e) = consumer(&chunk) {
                    first_err = Some(e);
                }
            }
        }
        let ran = helper
            .join()
            .map_err(|_| Error::HelperPanicked("stream callback"))?;
        match first_err {
            Some(e) => Err(e),
            None => ran,
        }
    })
}

/// Read side of the rendezvous: consumes messages as one contiguous stream.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(message) => {
                    self.current = message;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// How much a [`ChannelWriter`] accumulates before handing a chunk over.
const CHANNEL_CHUNK: usize = 64 * 1024;

/// Write side of the rendezvous: buffers writes and ships them as chunks.
struct ChannelWriter {
    tx: Sender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: Sender<Vec<u8>>) -> Self {
        ChannelWriter {
            tx,
            buf: Vec::new(),
        }
    }

    fn send_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buf);
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk consumer is gone"))
    }

    fn finish(mut self) -> Result<()> {
        self.send_buf()?;
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHANNEL_CHUNK {
            self.send_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(Vec<u8>);

    trait Named {
        fn name(&self) -> &'static str;
    }

    #[derive(Debug)]
    struct Concrete(usize);

    impl Named for Concrete {
        fn name(&self) -> &'static str {
            "concrete"
        }
    }

    #[test]
    fn message_registration() {
        struct M1;
        struct M2;
        register_message::<M1>(b"RM1");
        assert!(is_valid_tag(b"RM1"));
        assert!(!is_valid_tag(b"RM1-not"));
        assert_eq!(tag_for::<M1>(), Some(b"RM1".to_vec()));
        assert_eq!(tag_for::<M2>(), None);
        assert!(check_tag::<M1>(b"RM1"));
        assert!(check_tag::<M1>(b""));
        assert!(!check_tag::<M2>(b"RM1"));
    }

    #[test]
    fn loader_saver_roundtrip() {
        register_loader_saver::<Blob, _, _>(
            &[b"RLS"],
            &[],
            |source: &mut MessageSource<'_>| {
                let mut all = Vec::new();
                source(&mut |message: &[u8]| {
                    all.extend_from_slice(message);
                    Ok(())
                })?;
                Ok(Blob(all))
            },
            |blob: &Blob, consumer: &mut MessageConsumer<'_>| consumer(&blob.0),
        );

        let (tag, saver) = find_saver::<Blob>().expect("saver registered");
        assert_eq!(tag, b"RLS");
        let value = Blob(b"hello world".to_vec());
        let mut messages: Vec<Vec<u8>> = Vec::new();
        saver(&value, &mut |message: &[u8]| {
            messages.push(message.to_vec());
            Ok(())
        })
        .unwrap();

        let loader = find_loader::<Blob>(b"RLS").expect("loader registered");
        let mut feed = messages.into_iter();
        let loaded = loader(&mut |consumer: &mut MessageConsumer<'_>| {
            for message in feed.by_ref() {
                consumer(&message)?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(*loaded.downcast::<Blob>().unwrap(), value);
    }

    #[test]
    fn loader_registered_for_base_kind() {
        register_loader_saver::<Concrete, _, _>(
            &[b"UPC"],
            &[Upcast::to::<Concrete, Box<dyn Named + Send>>(|c| {
                Box::new(c)
            })],
            |source: &mut MessageSource<'_>| {
                let mut count = 0usize;
                source(&mut |_message: &[u8]| {
                    count += 1;
                    Ok(())
                })?;
                Ok(Concrete(count))
            },
            |_value: &Concrete, _consumer: &mut MessageConsumer<'_>| Ok(()),
        );

        let loader = find_loader::<Box<dyn Named + Send>>(b"UPC").expect("base loader");
        let loaded = loader(&mut |consumer: &mut MessageConsumer<'_>| {
            consumer(b"one")?;
            consumer(b"two")
        })
        .unwrap();
        let named = loaded.downcast::<Box<dyn Named + Send>>().unwrap();
        assert_eq!(named.name(), "concrete");
    }

    #[test]
    fn bare_wrappers_cross_threads() {
        let bare_load: BareLoadFn = Arc::new(|stream, _filename| {
            let mut all = Vec::new();
            stream.read_to_end(&mut all)?;
            Ok(Box::new(Blob(all)) as AnyPayload)
        });
        let wrapped = wrap_bare_loader(bare_load);
        let loaded = wrapped(&mut |consumer: &mut MessageConsumer<'_>| {
            consumer(b"part one|")?;
            consumer(b"")?;
            consumer(b"part two")
        })
        .unwrap();
        assert_eq!(
            *loaded.downcast::<Blob>().unwrap(),
            Blob(b"part one|part two".to_vec())
        );

        let bare_save: BareSaveFn = Arc::new(|value, stream| {
            let blob = value.downcast_ref::<Blob>().expect("blob");
            stream.write_all(&blob.0)?;
            Ok(())
        });
        let wrapped = wrap_bare_saver(bare_save);
        let value = Blob(b"saved bytes".to_vec());
        let mut seen = Vec::new();
        wrapped(&value, &mut |message: &[u8]| {
            seen.extend_from_slice(message);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, b"saved bytes");
    }

    #[test]
    fn function_calling_stream_chunks() {
        let mut collected = Vec::new();
        {
            let mut consumer = |chunk: &[u8]| {
                collected.extend_from_slice(chunk);
                Ok(())
            };
            with_function_calling_stream(&mut consumer, |out: &mut dyn Write| {
                for i in 0..1000u32 {
                    out.write_all(&i.to_le_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(collected.len(), 4000);
        assert_eq!(&collected[0..4], &0u32.to_le_bytes());
        assert_eq!(&collected[3996..], &999u32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "over the")]
    fn overlong_tag_rejected() {
        struct TooLong;
        register_message::<TooLong>(b"this tag is way too long to use");
    }
}
