//! The blocked-gzip (BGZF) container: a concatenation of independent gzip
//! members, each holding at most 64 KiB of payload and carrying its own
//! compressed size in a `BC` extra subfield. Because every block can be
//! decoded on its own, a byte of payload is addressable by *virtual offset*,
//! the compressed offset of its block shifted left 16 bits, or'd with the
//! byte's offset inside the decompressed block.

pub(crate) mod read;
pub(crate) mod write;

pub use read::BgzfReader;
pub use write::BgzfWriter;

/// A 64-bit position in a BGZF stream: `compressed_block_start << 16 |
/// uncompressed_offset_within_block`. Ordering virtual offsets orders the
/// payload bytes they address. Only meaningful within a single file.
pub type VirtualOffset = u64;

pub(crate) const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Most payload we pack into one block. Chosen so that even an incompressible
/// block stays under the 65535-byte limit of the `BC` size field.
pub(crate) const MAX_BLOCK_PAYLOAD: usize = 0xff00;

/// Decompressed blocks may not exceed 64 KiB.
pub(crate) const MAX_BLOCK_ISIZE: u32 = 0x10000;

/// The conventional empty block appended to mark end of file. Interior copies
/// are permitted (multi-part files are concatenated wholesale) and skipped on
/// read.
pub(crate) const EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Build a virtual offset from a block's compressed start and an offset into
/// its decompressed payload.
pub fn virtual_offset(block_start: u64, within_block: u16) -> VirtualOffset {
    (block_start << 16) | u64::from(within_block)
}

/// Split a virtual offset back into (compressed block start, offset within
/// the decompressed block).
pub fn split_virtual_offset(offset: VirtualOffset) -> (u64, u16) {
    (offset >> 16, (offset & 0xffff) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_offset_roundtrip() {
        let vo = virtual_offset(123_456, 789);
        assert_eq!(split_virtual_offset(vo), (123_456, 789));
    }

    #[test]
    fn virtual_offsets_order_like_positions() {
        assert!(virtual_offset(0, 10) < virtual_offset(0, 11));
        assert!(virtual_offset(0, 0xffff) < virtual_offset(1, 0));
    }

    #[test]
    fn eof_marker_is_a_gzip_member() {
        assert_eq!(&EOF_MARKER[0..2], &GZIP_MAGIC);
        // BSIZE field says 28 bytes total.
        let bsize = u16::from_le_bytes([EOF_MARKER[16], EOF_MARKER[17]]);
        assert_eq!(bsize as usize + 1, EOF_MARKER.len());
    }
}
