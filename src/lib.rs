/*!
Packio provides a performant API for reading and writing type-tagged, grouped
binary message streams, optionally wrapped in the blocked-gzip (BGZF) container
for random access by virtual offset.

A file is a concatenation of *groups*. Each group carries a short string *tag*
naming the payload kind, followed by zero or more length-prefixed messages of
that kind. Because every group is self-delimiting, one file can hold several
independent payload kinds back to back, and a reader can dispatch each group to
the right deserializer by tag alone.

## Reading

The entrypoint for iterating raw groups is [`GroupIterator`], constructed with
[`GroupIterator::new`] over any [`Read`][std::io::Read], or with
[`GroupIterator::open`] over a seekable input to enable
[`tell_group`][GroupIterator::tell_group] and
[`seek_group`][GroupIterator::seek_group]. Typed iteration over the messages of
one payload kind goes through [`MessageStream`], or the [`for_each`] and
[`for_each_parallel`] drivers in [`stream`].

High-level loading is available through [`load::try_load_one`] and friends,
which sniff the input (registered magic bytes, then gzip, then an uncompressed
group prologue) and dispatch to whatever loader the [`registry`] holds for the
requested type.

## Writing

[`GroupEmitter`] buffers messages into groups, coalescing consecutive writes
with the same tag, and emits them through a [`BgzfWriter`] (or a plain stream
when compression is disabled). Multiple producer threads can funnel their
output into one file through a [`StreamMultiplexer`], which splices per-thread
buffers into the backing stream only at producer-declared breakpoints.

## BGZF

The [`bgzf`] module implements the blocked-gzip container itself: independently
deflated members of at most 64 KiB of payload, addressed by *virtual offsets*
(`compressed_block_start << 16 | offset_within_block`). [`BgzfReader`] also
transparently handles plain gzip and uncompressed input, so the layers above it
never care how the bytes were stored.
*/

pub mod bgzf;
pub mod error;
pub mod group;
pub mod load;
pub mod message;
pub mod multiplex;
pub mod registry;
pub mod stream;
pub mod utils;
mod varint;

pub use bgzf::{BgzfReader, BgzfWriter, VirtualOffset};
pub use error::{Error, Result};
pub use group::{sniff_tag, EmitOptions, GroupEmitter, GroupIterator, TaggedMessage};
pub use group::{DEFAULT_MAX_GROUP_SIZE, MAX_MESSAGE_SIZE};
pub use message::Message;
pub use multiplex::{ProducerWriter, StreamMultiplexer};
pub use registry::MAX_TAG_LENGTH;
pub use stream::{for_each, for_each_parallel, MessageStream, DEFAULT_BATCH_SIZE};
pub use utils::putback::PutbackReader;
