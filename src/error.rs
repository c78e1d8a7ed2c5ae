use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors encountered while reading or writing tagged message streams.
///
/// Format errors report the virtual offset of the enclosing group (and, where
/// known, of the offending message). When the input is not seekable those
/// fields hold a zero-based ordinal instead, so the failure can still be
/// located by counting groups from the start of the stream.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {}", .0)]
    Io(#[from] io::Error),

    #[error("invalid gzip member header at compressed offset {}", .offset)]
    BadBlockHeader { offset: u64 },

    #[error("compressed block truncated at compressed offset {}", .offset)]
    TruncatedBlock { offset: u64 },

    #[error("could not inflate block at compressed offset {}: {}", .offset, .message)]
    Inflate { offset: u64, message: String },

    #[error("could not deflate block payload: {}", .0)]
    Deflate(String),

    #[error("CRC32 mismatch in block at compressed offset {}", .offset)]
    BlockCrc { offset: u64 },

    #[error("blocked-gzip input has been truncated (missing its EOF marker block)")]
    MissingEofMarker,

    #[error("virtual offset {:#x} does not address a byte of its block", .0)]
    BadSeekTarget(u64),

    #[error("invalid or truncated varint in group {}", .group)]
    InvalidVarint { group: u64 },

    #[error("group {} declares zero items", .group)]
    EmptyGroup { group: u64 },

    #[error("message of {} bytes in group {} is over the size limit", .size, .group)]
    MessageTooLarge { size: u64, group: u64 },

    #[error("truncated message at {} in group {}", .message, .group)]
    TruncatedMessage { group: u64, message: u64 },

    #[error("expected a stream of {} but found first message with tag {:?}", .kind, .found)]
    TagMismatch { kind: &'static str, found: String },

    #[error("could not parse message as {}: {}", .kind, .source)]
    Parse {
        kind: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("expected a stream of interleaved pairs but the message count is odd")]
    OddMessageCount,

    #[error("correct input type not found while loading {}", .kind)]
    NotFound { kind: &'static str },

    #[error("no saver registered for {}", .kind)]
    NoSaver { kind: &'static str },

    #[error("helper thread for {} panicked", .0)]
    HelperPanicked(&'static str),
}

impl Error {
    /// True for the EOF-marker diagnostic, which callers commonly downgrade
    /// to a warning when working with files that are still being appended to.
    pub fn is_missing_eof(&self) -> bool {
        matches!(self, Error::MissingEofMarker)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub(crate) fn parse_error<E>(kind: &'static str, source: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::Parse {
        kind,
        source: Box::new(source),
    }
}
