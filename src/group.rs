//! The group wire format: a varint count of strings (at least one, the tag),
//! the length-prefixed tag, then length-prefixed message bodies. Groups are
//! self-delimiting, so a file is simply groups back to back.
//!
//! Layered over [`BgzfReader`][crate::BgzfReader] and
//! [`BgzfWriter`][crate::BgzfWriter], which also accept plain byte streams,
//! so the framing itself never cares whether the file was compressed.

pub(crate) mod read;
pub(crate) mod write;

pub use read::{sniff_tag, GroupIterator};
pub use write::{EmitOptions, GroupEmitter};

/// Upper bound on any length prefix on the wire (tag or message body).
pub const MAX_MESSAGE_SIZE: u64 = 1_000_000_000;

/// Messages buffered per group before the emitter cuts it off.
pub const DEFAULT_MAX_GROUP_SIZE: usize = 1000;

/// One item pulled off a tagged stream: the group's tag, and the message
/// body, or `None` for a tag-only group (a group that names a payload kind
/// without carrying any instances).
///
/// Legacy untagged files surface here with an empty `tag`; the first string
/// of each of their groups is really a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedMessage {
    pub tag: Vec<u8>,
    pub body: Option<Vec<u8>>,
}
