use std::io::{Read, Seek};

use crate::bgzf::{BgzfReader, VirtualOffset};
use crate::error::{Error, Result};
use crate::group::{TaggedMessage, MAX_MESSAGE_SIZE};
use crate::registry::{self, MAX_TAG_LENGTH};
use crate::utils::putback::PutbackReader;
use crate::varint;

/// Iterator over the tagged messages of a group stream.
///
/// Decoding runs group by group: the first string of each group is taken as
/// its tag when it matches the previous group's tag or is registered in the
/// [`registry`]; otherwise the whole group is treated as untagged legacy data
/// and its strings are delivered as messages with an empty tag.
///
/// On seekable blocked input, [`tell_group`][GroupIterator::tell_group]
/// reports the virtual offset of the current group's start and
/// [`seek_group`][GroupIterator::seek_group] jumps back to one.
pub struct GroupIterator<R: Read> {
    input: BgzfReader<R>,
    current: Option<TaggedMessage>,
    previous_tag: Vec<u8>,
    group_count: u64,
    group_idx: u64,
    /// Virtual offset of the current group, when the input can tell.
    group_vo: Option<VirtualOffset>,
    /// Locator for error messages: the group's virtual offset, or its
    /// ordinal on untellable input.
    group_loc: u64,
    groups_started: u64,
    items_started: u64,
}

impl<R: Read> GroupIterator<R> {
    /// Read groups from any byte stream (blocked, gzip, or plain; the kind
    /// is sniffed). Virtual offsets are unavailable.
    pub fn new(input: R) -> Result<Self> {
        Self::from_bgzf(BgzfReader::new(input)?)
    }

    /// Wrap an already-constructed block reader, e.g. one configured with
    /// decode threads.
    pub fn from_bgzf(input: BgzfReader<R>) -> Result<Self> {
        let mut it = GroupIterator {
            input,
            current: None,
            previous_tag: Vec::new(),
            group_count: 0,
            group_idx: 0,
            group_vo: None,
            group_loc: 0,
            groups_started: 0,
            items_started: 0,
        };
        it.advance()?;
        Ok(it)
    }

    /// Whether a message (or tag-only marker) is loaded.
    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// The loaded item, if any.
    pub fn current(&self) -> Option<&TaggedMessage> {
        self.current.as_ref()
    }

    /// Move the loaded item out and advance past it.
    pub fn take(&mut self) -> Result<Option<TaggedMessage>> {
        match self.current.take() {
            None => Ok(None),
            Some(value) => {
                self.advance()?;
                Ok(Some(value))
            }
        }
    }

    /// Virtual offset of the start of the current group, or the past-end
    /// offset once the stream is exhausted. `None` when the input cannot
    /// tell.
    pub fn tell_group(&self) -> Option<VirtualOffset> {
        self.input.tell()?;
        if self.current.is_none() {
            self.input.tell()
        } else {
            self.group_vo
        }
    }

    /// Load the next message, or clear `current` at end of stream.
    pub fn advance(&mut self) -> Result<()> {
        while self.group_idx == self.group_count {
            // Start a new group.
            self.group_vo = self.input.tell();
            self.group_loc = match self.group_vo {
                Some(vo) => vo,
                None => self.groups_started,
            };
            self.groups_started += 1;
            self.group_idx = 0;

            let count = match self.read_varint64()? {
                None => {
                    // End of stream.
                    self.current = None;
                    return Ok(());
                }
                Some(count) => count,
            };
            if count == 0 {
                return Err(Error::EmptyGroup {
                    group: self.group_loc,
                });
            }
            self.group_count = count;

            // The first string is the tag, unless it turns out not to be.
            let item_loc = self.next_item_loc();
            let tag_len = u64::from(self.read_varint32(item_loc)?);
            if tag_len > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge {
                    size: tag_len,
                    group: self.group_loc,
                });
            }
            let first = self.read_bytes(tag_len as usize, item_loc)?;
            self.group_idx += 1;

            let is_tag = (!self.previous_tag.is_empty() && self.previous_tag == first)
                || registry::is_valid_tag(&first);
            if !is_tag {
                // Untagged legacy data: the string we read is a message.
                self.previous_tag.clear();
                self.current = Some(TaggedMessage {
                    tag: Vec::new(),
                    body: Some(first),
                });
                return Ok(());
            }

            self.previous_tag = first.clone();
            if self.group_count == 1 {
                // Tag-only group.
                self.current = Some(TaggedMessage {
                    tag: first,
                    body: None,
                });
                return Ok(());
            }
        }

        // Next message of the current group.
        let item_loc = self.next_item_loc();
        let msg_len = u64::from(self.read_varint32(item_loc)?);
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: msg_len,
                group: self.group_loc,
            });
        }
        let body = self.read_bytes(msg_len as usize, item_loc)?;
        self.group_idx += 1;
        self.current = Some(TaggedMessage {
            tag: self.previous_tag.clone(),
            body: Some(body),
        });
        Ok(())
    }

    fn next_item_loc(&mut self) -> u64 {
        let loc = match self.input.tell() {
            Some(vo) => vo,
            None => self.items_started,
        };
        self.items_started += 1;
        loc
    }

    /// Varint at a group boundary; `None` on a clean end of stream.
    fn read_varint64(&mut self) -> Result<Option<u64>> {
        let first = match self.next_byte()? {
            None => return Ok(None),
            Some(byte) => byte,
        };
        let mut value = u64::from(first & 0x7f);
        if first & 0x80 == 0 {
            return Ok(Some(value));
        }
        let mut shift = 7u32;
        loop {
            let byte = match self.next_byte()? {
                None => {
                    return Err(Error::InvalidVarint {
                        group: self.group_loc,
                    })
                }
                Some(byte) => byte,
            };
            if shift == 63 && byte > 1 {
                return Err(Error::InvalidVarint {
                    group: self.group_loc,
                });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::InvalidVarint {
                    group: self.group_loc,
                });
            }
        }
    }

    /// Varint that must be present; running out of input here means the
    /// group was cut short.
    fn read_varint32(&mut self, item_loc: u64) -> Result<u32> {
        match self.read_varint64()? {
            None => Err(Error::TruncatedMessage {
                group: self.group_loc,
                message: item_loc,
            }),
            Some(value) => u32::try_from(value).map_err(|_| Error::InvalidVarint {
                group: self.group_loc,
            }),
        }
    }

    fn read_bytes(&mut self, len: usize, item_loc: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let need = len - out.len();
            let unused = match self.input.next_chunk()? {
                None => {
                    return Err(Error::TruncatedMessage {
                        group: self.group_loc,
                        message: item_loc,
                    })
                }
                Some(chunk) => {
                    let take = chunk.len().min(need);
                    out.extend_from_slice(&chunk[..take]);
                    chunk.len() - take
                }
            };
            if unused > 0 {
                self.input.back_up(unused);
            }
        }
        Ok(out)
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let got = match self.input.next_chunk()? {
            None => None,
            Some(chunk) => Some((chunk[0], chunk.len() - 1)),
        };
        Ok(got.map(|(byte, unused)| {
            if unused > 0 {
                self.input.back_up(unused);
            }
            byte
        }))
    }
}

impl<R: Read + Seek> GroupIterator<R> {
    /// Read groups from a seekable stream, enabling `tell_group` and
    /// `seek_group` when the input is blocked. Fails when a blocked stream
    /// is missing its EOF marker.
    pub fn open(input: R) -> Result<Self> {
        Self::from_bgzf(BgzfReader::open(input)?)
    }

    /// Like [`open`][GroupIterator::open] but tolerates a missing EOF
    /// marker.
    pub fn open_unchecked(input: R) -> Result<Self> {
        Self::from_bgzf(BgzfReader::open_unchecked(input)?)
    }

    /// Jump to a group start previously reported by
    /// [`tell_group`][GroupIterator::tell_group]. Returns false when the
    /// input does not support seeking by virtual offset. The cached previous
    /// tag is dropped, so the first string at the target is judged purely by
    /// the registry.
    pub fn seek_group(&mut self, offset: VirtualOffset) -> Result<bool> {
        if !self.input.seek(offset)? {
            return Ok(false);
        }
        self.previous_tag.clear();
        self.group_count = 0;
        self.group_idx = 0;
        self.current = None;
        self.advance()?;
        Ok(true)
    }
}

impl<R: Read> Iterator for GroupIterator<R> {
    type Item = Result<TaggedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.take().transpose()
    }
}

/// Read the first group's tag out of an uncompressed tagged stream without
/// consuming anything. Returns an empty vector when the stream does not
/// start with a well-formed group prologue whose tag is registered.
pub fn sniff_tag<R: Read>(input: &mut PutbackReader<R>) -> Result<Vec<u8>> {
    let want = varint::MAX_VARINT64_LEN + varint::MAX_VARINT32_LEN + MAX_TAG_LENGTH;
    let buf = input.peek(want)?;
    let mut cursor = buf;
    match varint::get_u64(&mut cursor) {
        Some(count) if count >= 1 => {}
        _ => return Ok(Vec::new()),
    }
    let tag_len = match varint::get_u32(&mut cursor) {
        Some(len) if len >= 1 && len as usize <= MAX_TAG_LENGTH => len as usize,
        _ => return Ok(Vec::new()),
    };
    if cursor.len() < tag_len {
        return Ok(Vec::new());
    }
    let tag = cursor[..tag_len].to_vec();
    if !registry::is_valid_tag(&tag) {
        return Ok(Vec::new());
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{EmitOptions, GroupEmitter};
    use crate::varint;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    struct GR1;
    struct GR2;
    struct GR3;
    struct GR4;
    struct GR5;

    fn emit(
        compress: bool,
        groups: &[(&[u8], &[&[u8]])],
    ) -> (Vec<u8>, Vec<(Vec<u8>, u64, u64)>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = GroupEmitter::with_options(
            Vec::new(),
            EmitOptions {
                compress,
                ..EmitOptions::default()
            },
        );
        let listener_seen = seen.clone();
        emitter.on_group(move |tag, start, end| {
            listener_seen.lock().unwrap().push((tag.to_vec(), start, end));
        });
        for (tag, messages) in groups {
            if messages.is_empty() {
                emitter.write_tag(tag).unwrap();
                emitter.flush().unwrap();
            } else {
                for message in *messages {
                    emitter.write(tag, message).unwrap();
                }
                emitter.flush().unwrap();
            }
        }
        let bytes = emitter.finish().unwrap();
        let offsets = seen.lock().unwrap().clone();
        (bytes, offsets)
    }

    fn collect<R: std::io::Read>(mut it: GroupIterator<R>) -> Vec<TaggedMessage> {
        let mut out = Vec::new();
        while let Some(item) = (&mut it).take().unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn roundtrip_compressed_and_plain() {
        registry::register_message::<GR1>(b"RT1");
        for compress in [true, false] {
            let (bytes, _) = emit(
                compress,
                &[
                    (b"RT1", &[b"alpha".as_slice(), b"beta".as_slice()]),
                    (b"RT1", &[b"gamma".as_slice()]),
                ],
            );
            let items = collect(GroupIterator::new(Cursor::new(bytes)).unwrap());
            assert_eq!(items.len(), 3);
            assert!(items.iter().all(|i| i.tag == b"RT1"));
            assert_eq!(items[0].body.as_deref(), Some(b"alpha".as_slice()));
            assert_eq!(items[2].body.as_deref(), Some(b"gamma".as_slice()));
        }
    }

    #[test]
    fn tag_only_group() {
        registry::register_message::<GR2>(b"TO1");
        let (bytes, _) = emit(true, &[(b"TO1", &[])]);
        let items = collect(GroupIterator::open(Cursor::new(bytes)).unwrap());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, b"TO1");
        assert_eq!(items[0].body, None);
    }

    #[test]
    fn empty_message_is_preserved() {
        registry::register_message::<GR3>(b"EM1");
        let (bytes, _) = emit(true, &[(b"EM1", &[b"".as_slice(), b"x".as_slice()])]);
        let items = collect(GroupIterator::new(Cursor::new(bytes)).unwrap());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].body.as_deref(), Some(b"".as_slice()));
    }

    #[test]
    fn untagged_legacy_groups() {
        // A pre-tags file: each group is just count then messages.
        let mut bytes = Vec::new();
        varint::put_u64(&mut bytes, 2);
        varint::put_u32(&mut bytes, 5);
        bytes.extend_from_slice(b"first");
        varint::put_u32(&mut bytes, 6);
        bytes.extend_from_slice(b"second");
        let items = collect(GroupIterator::new(Cursor::new(bytes)).unwrap());
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.tag.is_empty()));
        assert_eq!(items[0].body.as_deref(), Some(b"first".as_slice()));
        assert_eq!(items[1].body.as_deref(), Some(b"second".as_slice()));
    }

    #[test]
    fn group_offsets_support_seeking() {
        registry::register_message::<GR4>(b"SK1");
        let groups: Vec<Vec<u8>> = (0..20)
            .map(|i| format!("payload-{:04}", i).into_bytes())
            .collect();
        let per_group: Vec<(&[u8], Vec<&[u8]>)> = groups
            .chunks(2)
            .map(|pair| (b"SK1".as_slice(), pair.iter().map(|m| m.as_slice()).collect()))
            .collect();
        let shaped: Vec<(&[u8], &[&[u8]])> = per_group
            .iter()
            .map(|(tag, msgs)| (*tag, msgs.as_slice()))
            .collect();
        let (bytes, offsets) = emit(true, &shaped);
        assert_eq!(offsets.len(), 10);
        let mut starts: Vec<u64> = offsets.iter().map(|(_, s, _)| *s).collect();
        let sorted = starts.clone();
        starts.sort_unstable();
        assert_eq!(starts, sorted);

        let mut it = GroupIterator::open(Cursor::new(bytes)).unwrap();
        for (index, (_, start, _)) in offsets.iter().enumerate().rev() {
            assert!(it.seek_group(*start).unwrap());
            assert_eq!(it.tell_group(), Some(*start));
            let first = (&mut it).take().unwrap().unwrap();
            assert_eq!(first.body.as_deref(), Some(groups[index * 2].as_slice()));
        }
    }

    #[test]
    fn groups_split_at_max_group_size() {
        struct GR6;
        registry::register_message::<GR6>(b"MX1");
        let mut emitter = GroupEmitter::with_options(
            Vec::new(),
            EmitOptions {
                max_group_size: 3,
                ..EmitOptions::default()
            },
        );
        let groups_seen = Arc::new(Mutex::new(0usize));
        let counter = groups_seen.clone();
        emitter.on_group(move |_, _, _| *counter.lock().unwrap() += 1);
        for i in 0..7 {
            emitter
                .write(b"MX1", format!("message-{}", i).as_bytes())
                .unwrap();
        }
        let bytes = emitter.finish().unwrap();
        assert_eq!(*groups_seen.lock().unwrap(), 3);

        let items = collect(GroupIterator::new(Cursor::new(bytes)).unwrap());
        assert_eq!(items.len(), 7);
    }

    #[test]
    fn sniff_tag_leaves_stream_untouched() {
        registry::register_message::<GR5>(b"SN1");
        let (bytes, _) = emit(false, &[(b"SN1", &[b"content".as_slice()])]);
        let mut reader = PutbackReader::new(Cursor::new(bytes.clone()));
        assert_eq!(sniff_tag(&mut reader).unwrap(), b"SN1");
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut rest).unwrap();
        assert_eq!(rest, bytes);
    }

    #[test]
    fn sniff_rejects_unregistered_and_compressed() {
        let (compressed, _) = emit(true, &[(b"SN1", &[b"content".as_slice()])]);
        let mut reader = PutbackReader::new(Cursor::new(compressed));
        assert_eq!(sniff_tag(&mut reader).unwrap(), b"");

        let mut unregistered = Vec::new();
        varint::put_u64(&mut unregistered, 2);
        varint::put_u32(&mut unregistered, 3);
        unregistered.extend_from_slice(b"zzz");
        let mut reader = PutbackReader::new(Cursor::new(unregistered));
        assert_eq!(sniff_tag(&mut reader).unwrap(), b"");
    }

    #[test]
    fn uncompressed_framing_never_fakes_gzip_magic() {
        struct GR7;
        registry::register_message::<GR7>(b"GZ1");
        let mut emitter = GroupEmitter::with_options(
            Vec::new(),
            EmitOptions {
                compress: false,
                ..EmitOptions::default()
            },
        );
        // Thirty messages plus the tag: the count varint is 31, the first
        // gzip magic byte. The tag length that follows can never be the
        // second one, because tags are capped far below 139 bytes.
        for _ in 0..30 {
            emitter.write(b"GZ1", b"m").unwrap();
        }
        let bytes = emitter.finish().unwrap();
        assert_eq!(bytes[0], 0x1f);
        assert_ne!(bytes[1], 0x8b);
    }

    #[test]
    fn oversized_length_is_fatal() {
        // "QQQ" is never registered, so the first string decodes as an
        // untagged message and construction succeeds.
        let mut bytes = Vec::new();
        varint::put_u64(&mut bytes, 2);
        varint::put_u32(&mut bytes, 3);
        bytes.extend_from_slice(b"QQQ");
        varint::put_u64(&mut bytes, MAX_MESSAGE_SIZE + 1);
        let mut it = GroupIterator::new(Cursor::new(bytes)).unwrap();
        match (&mut it).take() {
            Err(Error::MessageTooLarge { .. }) => {}
            other => panic!("expected MessageTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn zero_count_group_is_fatal() {
        let mut bytes = Vec::new();
        varint::put_u64(&mut bytes, 0);
        match GroupIterator::new(Cursor::new(bytes)) {
            Err(Error::EmptyGroup { group: 0 }) => {}
            other => panic!("expected EmptyGroup, got {:?}", other.err()),
        }
    }

    #[test]
    fn truncated_message_is_fatal() {
        let mut bytes = Vec::new();
        varint::put_u64(&mut bytes, 2);
        varint::put_u32(&mut bytes, 3);
        bytes.extend_from_slice(b"QQQ");
        varint::put_u32(&mut bytes, 100);
        bytes.extend_from_slice(b"short");
        let mut it = GroupIterator::new(Cursor::new(bytes)).unwrap();
        match (&mut it).take() {
            Err(Error::TruncatedMessage { .. }) => {}
            other => panic!("expected TruncatedMessage, got {:?}", other),
        }
    }
}
