use std::io::Write;

use crate::bgzf::BgzfWriter;
use crate::error::{Error, Result};
use crate::group::{DEFAULT_MAX_GROUP_SIZE, MAX_MESSAGE_SIZE};
use crate::registry::MAX_TAG_LENGTH;
use crate::varint;

/// Options controlling a [`GroupEmitter`].
#[derive(Clone)]
pub struct EmitOptions {
    /// Wrap the output in blocked gzip. Off, groups are written as plain
    /// bytes and listener offsets are byte counts instead of virtual
    /// offsets.
    pub compress: bool,
    /// Cut the buffered group off once it holds this many messages.
    pub max_group_size: usize,
    /// Append the EOF marker block when finishing compressed output.
    pub end_file: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            compress: true,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            end_file: true,
        }
    }
}

enum EmitSink<W: Write> {
    Bgzf(BgzfWriter<W>),
    Plain { out: W, written: u64 },
}

impl<W: Write> EmitSink<W> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            EmitSink::Bgzf(out) => out.write_all(data)?,
            EmitSink::Plain { out, written } => {
                out.write_all(data)?;
                *written += data.len() as u64;
            }
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        match self {
            EmitSink::Bgzf(out) => out.tell().expect("file start was marked"),
            EmitSink::Plain { written, .. } => *written,
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            EmitSink::Bgzf(out) => out.flush_all(),
            EmitSink::Plain { out, .. } => Ok(out.flush()?),
        }
    }
}

type GroupListener = Box<dyn FnMut(&[u8], u64, u64) + Send>;

/// Writer for group streams.
///
/// Messages written with the same tag coalesce into one group, emitted when
/// the tag changes, the group reaches `max_group_size` messages, the emitter
/// is flushed, or it is finished. Registered group listeners observe each
/// emitted group as `(tag, start offset, end offset)`; for compressed output
/// those are virtual offsets suitable for
/// [`seek_group`][crate::GroupIterator::seek_group].
pub struct GroupEmitter<W: Write> {
    sink: Option<EmitSink<W>>,
    tag: Vec<u8>,
    group: Vec<Vec<u8>>,
    max_group_size: usize,
    listeners: Vec<GroupListener>,
}

impl<W: Write> GroupEmitter<W> {
    /// Emit compressed groups with default options.
    pub fn new(out: W) -> Self {
        Self::with_options(out, EmitOptions::default())
    }

    pub fn with_options(out: W, options: EmitOptions) -> Self {
        let sink = if options.compress {
            let mut bgzf = BgzfWriter::new(out);
            bgzf.mark_file_start();
            bgzf.end_file(options.end_file);
            EmitSink::Bgzf(bgzf)
        } else {
            EmitSink::Plain { out, written: 0 }
        };
        GroupEmitter {
            sink: Some(sink),
            tag: Vec::new(),
            group: Vec::new(),
            max_group_size: options.max_group_size,
            listeners: Vec::new(),
        }
    }

    /// Observe every emitted group. Listeners run after the group's bytes
    /// have been handed to the sink.
    pub fn on_group(&mut self, listener: impl FnMut(&[u8], u64, u64) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Make `tag` the buffered group's tag, emitting the previous group if
    /// its tag differs or it is full. Useful on its own to record that a
    /// payload kind is present even when no instances follow.
    ///
    /// Panics on an empty or over-long tag.
    pub fn write_tag(&mut self, tag: &[u8]) -> Result<()> {
        assert!(!tag.is_empty(), "group tag must not be empty");
        assert!(
            tag.len() <= MAX_TAG_LENGTH,
            "group tag of {} bytes is over the {} byte limit",
            tag.len(),
            MAX_TAG_LENGTH
        );
        if self.group.len() >= self.max_group_size || tag != self.tag.as_slice() {
            self.emit_group()?;
        }
        if tag != self.tag.as_slice() {
            self.tag = tag.to_vec();
        }
        Ok(())
    }

    /// Append one message to the group for `tag`.
    pub fn write(&mut self, tag: &[u8], message: &[u8]) -> Result<()> {
        self.write_owned(tag, message.to_vec())
    }

    /// Like [`write`][GroupEmitter::write], taking ownership of the body.
    pub fn write_owned(&mut self, tag: &[u8], message: Vec<u8>) -> Result<()> {
        self.write_tag(tag)?;
        if message.len() as u64 > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: message.len() as u64,
                group: self.sink.as_ref().map(|s| s.position()).unwrap_or(0),
            });
        }
        self.group.push(message);
        Ok(())
    }

    /// Emit the buffered group (even a tag-only one) and flush the sink all
    /// the way down.
    pub fn flush(&mut self) -> Result<()> {
        self.emit_group()?;
        self.sink.as_mut().expect("sink still owned").flush()
    }

    /// Emit anything buffered and hand back the output stream. Compressed
    /// sinks append the EOF marker here when enabled.
    pub fn finish(mut self) -> Result<W> {
        self.emit_group()?;
        match self.sink.take().expect("finish runs once") {
            EmitSink::Bgzf(out) => out.finish(),
            EmitSink::Plain { mut out, .. } => {
                out.flush()?;
                Ok(out)
            }
        }
    }

    fn emit_group(&mut self) -> Result<()> {
        if self.tag.is_empty() {
            // Nothing buffered, not even a bare tag.
            return Ok(());
        }
        let sink = self.sink.as_mut().expect("sink still owned");
        let start = sink.position();

        let mut head = Vec::with_capacity(16);
        varint::put_u64(&mut head, self.group.len() as u64 + 1);
        varint::put_u32(&mut head, self.tag.len() as u32);
        sink.write_all(&head)?;
        sink.write_all(&self.tag)?;
        for message in &self.group {
            head.clear();
            varint::put_u32(&mut head, message.len() as u32);
            sink.write_all(&head)?;
            sink.write_all(message)?;
        }

        let end = sink.position();
        for listener in &mut self.listeners {
            listener(&self.tag, start, end);
        }
        self.group.clear();
        self.tag.clear();
        Ok(())
    }
}

impl<W: Write> Drop for GroupEmitter<W> {
    fn drop(&mut self) {
        if self.sink.is_some() {
            let _ = self.emit_group();
            if let Some(EmitSink::Plain { out, .. }) = self.sink.as_mut() {
                let _ = out.flush();
            }
            // A bgzf sink finishes itself (EOF marker included) on drop.
        }
    }
}
