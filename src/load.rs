//! High-level load and save dispatch.
//!
//! `try_load_one::<T>` figures out what a stream holds and how to read it,
//! in this order:
//!
//! 1. bare loaders registered for `T` whose sniff rule (magic bytes or
//!    header check) accepts the stream head;
//! 2. gzip detection; an uncompressed stream instead has its first group
//!    prologue sniffed and the tag checked against the registry;
//! 3. a [`GroupIterator`] over the stream, loading the first tag run a
//!    registered loader handles and skipping foreign tag runs in place.
//!
//! Inputs are wrapped in a [`PutbackReader`] so the sniffing steps work on
//! pipes and standard input too. The filename `"-"` means standard input
//! (or output, for saving).

use std::any::{type_name, Any};
use std::fs::File;
use std::io::{self, Read, Write};

use crate::bgzf::GZIP_MAGIC;
use crate::error::{Error, Result};
use crate::group::{sniff_tag, GroupEmitter, GroupIterator};
use crate::registry::{self, AnyPayload, BareLoadFn, LoadFn, MessageConsumer, Sniff};
use crate::utils::putback::PutbackReader;

/// Everything the dispatcher needs to know about one requested payload
/// kind, with the type erased.
struct Slot {
    find_loader: fn(&[u8]) -> Option<LoadFn>,
    bare_loaders: fn() -> Vec<(BareLoadFn, Sniff)>,
}

fn slot_for<T: Any + Send>() -> Slot {
    Slot {
        find_loader: registry::find_loader::<T>,
        bare_loaders: registry::find_bare_loaders::<T>,
    }
}

fn try_load_first_any<R: Read>(
    slots: &[Slot],
    input: R,
    filename: &str,
) -> Result<Option<(usize, AnyPayload)>> {
    let mut input = PutbackReader::new(input);

    // Bare formats recognized by their own header win over everything.
    for (index, slot) in slots.iter().enumerate() {
        for (loader, sniff) in (slot.bare_loaders)() {
            let matched = match &sniff {
                Sniff::Magic(magic) => input.peek(magic.len())? == magic.as_slice(),
                Sniff::Check(check) => check(&mut input)?,
                Sniff::Manual => false,
            };
            if matched {
                return loader(&mut input, filename).map(|payload| Some((index, payload)));
            }
        }
    }

    if input.peek(2)? != &GZIP_MAGIC[..] {
        // Uncompressed: only proceed if this starts with a registered tag
        // some requested kind can load. Leaves the stream untouched
        // otherwise.
        let tag = sniff_tag(&mut input)?;
        if tag.is_empty() {
            return Ok(None);
        }
        if !slots.iter().any(|slot| (slot.find_loader)(&tag).is_some()) {
            return Ok(None);
        }
    }

    let mut groups = GroupIterator::new(input)?;
    loop {
        let tag = match groups.current() {
            None => return Ok(None),
            Some(current) => current.tag.clone(),
        };
        let hit = slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| (slot.find_loader)(&tag).map(|loader| (index, loader)));
        match hit {
            Some((index, loader)) => {
                let payload = run_loader(loader, &mut groups, &tag)?;
                return Ok(Some((index, payload)));
            }
            None => {
                // Nobody wants this tag; step over its whole run.
                while groups.current().map_or(false, |c| c.tag == tag) {
                    groups.advance()?;
                }
            }
        }
    }
}

/// Feed the current tag run's messages to `loader`.
fn run_loader<R: Read>(
    loader: LoadFn,
    groups: &mut GroupIterator<R>,
    tag: &[u8],
) -> Result<AnyPayload> {
    let mut source = |consumer: &mut MessageConsumer<'_>| -> Result<()> {
        while groups.current().map_or(false, |c| c.tag == tag) {
            let item = groups.take()?.expect("current was checked");
            if let Some(body) = item.body {
                consumer(&body)?;
            }
        }
        Ok(())
    };
    loader(&mut source)
}

/// Load a `T` from the stream if a registered loader recognizes it.
/// `filename` is passed through to bare loaders that want it; use `""` when
/// there is none.
pub fn try_load_one<T: Any + Send, R: Read>(input: R, filename: &str) -> Result<Option<Box<T>>> {
    match try_load_first_any(&[slot_for::<T>()], input, filename)? {
        None => Ok(None),
        Some((_, payload)) => Ok(Some(
            payload.downcast::<T>().expect("slot index matches type"),
        )),
    }
}

/// Load a `T` from the stream, failing when nothing recognizable is found.
pub fn load_one<T: Any + Send, R: Read>(input: R, filename: &str) -> Result<Box<T>> {
    try_load_one::<T, R>(input, filename)?.ok_or(Error::NotFound {
        kind: type_name::<T>(),
    })
}

/// Load a `T` from a file, with `"-"` meaning standard input.
pub fn try_load_one_file<T: Any + Send>(filename: &str) -> Result<Option<Box<T>>> {
    if filename == "-" {
        try_load_one::<T, _>(io::stdin().lock(), "")
    } else {
        let file = File::open(filename)?;
        try_load_one::<T, _>(io::BufReader::new(file), filename)
    }
}

/// Like [`try_load_one_file`], failing when nothing recognizable is found.
pub fn load_one_file<T: Any + Send>(filename: &str) -> Result<Box<T>> {
    try_load_one_file::<T>(filename)?.ok_or(Error::NotFound {
        kind: type_name::<T>(),
    })
}

/// A tuple of payload kinds to try in order; see [`try_load_first`].
pub trait LoadSet {
    type Output;
    fn try_load_first<R: Read>(input: R, filename: &str) -> Result<Self::Output>;
}

/// Try to load each kind in the tuple in order, returning a tuple of
/// options of which at most one is filled:
///
/// ```ignore
/// let (graph, alignments) = load::try_load_first::<(Graph, Alignments), _>(input, "")?;
/// ```
pub fn try_load_first<S: LoadSet, R: Read>(input: R, filename: &str) -> Result<S::Output> {
    S::try_load_first(input, filename)
}

/// [`try_load_first`] from a file, with `"-"` meaning standard input.
pub fn try_load_first_file<S: LoadSet>(filename: &str) -> Result<S::Output> {
    if filename == "-" {
        S::try_load_first(io::stdin().lock(), "")
    } else {
        let file = File::open(filename)?;
        S::try_load_first(io::BufReader::new(file), filename)
    }
}

macro_rules! impl_load_set {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Any + Send),+> LoadSet for ($($name,)+) {
            type Output = ($(Option<Box<$name>>,)+);

            fn try_load_first<R: Read>(input: R, filename: &str) -> Result<Self::Output> {
                let slots = [$(slot_for::<$name>()),+];
                let mut out: Self::Output = Default::default();
                if let Some((index, payload)) = try_load_first_any(&slots, input, filename)? {
                    match index {
                        $($idx => {
                            out.$idx =
                                Some(payload.downcast::<$name>().expect("slot index matches type"));
                        })+
                        _ => unreachable!(),
                    }
                }
                Ok(out)
            }
        }
    };
}

impl_load_set!(A: 0);
impl_load_set!(A: 0, B: 1);
impl_load_set!(A: 0, B: 1, C: 2);
impl_load_set!(A: 0, B: 1, C: 2, D: 3);

/// Save `value` with its registered saver. The output always starts with a
/// tag-only group, so even an empty save is recognizable by tag.
pub fn save<T: Any + Send + Sync, W: Write>(value: &T, out: W) -> Result<W> {
    let (tag, saver) = registry::find_saver::<T>().ok_or(Error::NoSaver {
        kind: type_name::<T>(),
    })?;
    let mut emitter = GroupEmitter::new(out);
    emitter.write_tag(&tag)?;
    {
        let mut consumer = |message: &[u8]| emitter.write(&tag, message);
        saver(value, &mut consumer)?;
    }
    emitter.finish()
}

/// Save `value` to a file, with `"-"` meaning standard output.
pub fn save_file<T: Any + Send + Sync>(value: &T, filename: &str) -> Result<()> {
    if filename == "-" {
        save(value, io::stdout().lock())?;
    } else {
        save(value, File::create(filename)?)?;
    }
    Ok(())
}

/// Run `use_stream` with a writer whose output lands in `out` as messages
/// tagged `tag`. For callers that produce a byte stream but want it stored
/// inside a tagged file.
pub fn with_save_stream<W, F>(out: W, tag: &[u8], use_stream: F) -> Result<W>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<()> + Send,
{
    let mut emitter = GroupEmitter::new(out);
    emitter.write_tag(tag)?;
    {
        let mut consumer = |chunk: &[u8]| emitter.write(tag, chunk);
        registry::with_function_calling_stream(&mut consumer, use_stream)?;
    }
    emitter.finish()
}
