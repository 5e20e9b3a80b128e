// # File Header Block
//
// The first ten blocks of an archive hold redundant copies of the header.
// Copies A and B (slots 0 and 1) are rewritten on every commit; one of the
// remaining eight slots rotates per commit, selected by the snapshot
// sequence number. Recovery accepts the valid copy with the highest
// sequence, so a torn write of any single slot never loses the archive.

use crate::error::{ArchiveError, Result};

/// Number of redundant header copies at the start of the file
pub const HEADER_COPIES: u64 = 10;

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: u32 = 512;

const MAGIC: &[u8; 8] = b"CHRONARC";
const FORMAT_VERSION: u32 = 1;

// Field offsets within a header block
const P_MAGIC: usize = 0; // 0..8
const P_VERSION: usize = 8; // 8..12
const P_BLOCK_SIZE: usize = 12; // 12..16
const P_LAST_BLOCK: usize = 16; // 16..24
const P_SEQUENCE: usize = 24; // 24..32
const P_METADATA: usize = 32; // 32..blockSize-4
const FOOTER_SIZE: usize = 4; // trailing crc32

/// Decoded archive header.
///
/// `metadata` is an opaque region owned by upper layers (tree roots, point
/// schemas); the file layer round-trips it untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeaderBlock {
    pub block_size: u32,
    pub last_allocated_block: u64,
    pub snapshot_sequence_number: u64,
    pub metadata: Vec<u8>,
}

impl FileHeaderBlock {
    /// Fresh header for a newly created archive. The header blocks
    /// themselves count as allocated, so the data region starts empty.
    pub fn new(block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            block_size,
            last_allocated_block: HEADER_COPIES - 1,
            snapshot_sequence_number: 0,
            metadata: vec![0; metadata_len(block_size)],
        })
    }

    /// First byte past the header region.
    #[inline]
    pub fn end_of_header(&self) -> u64 {
        HEADER_COPIES * self.block_size as u64
    }

    /// First byte past the committed region.
    #[inline]
    pub fn end_of_committed(&self) -> u64 {
        (self.last_allocated_block + 1) * self.block_size as u64
    }

    /// Slot index (0-based) of the rotating copy for this sequence number.
    #[inline]
    pub fn rotating_slot(&self) -> u64 {
        (self.snapshot_sequence_number % 8) + 2
    }

    /// Serialize into a block-sized buffer, stamping the crc footer.
    pub fn encode(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), self.block_size as usize);
        let len = block.len();
        block[P_MAGIC..P_MAGIC + 8].copy_from_slice(MAGIC);
        block[P_VERSION..P_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        block[P_BLOCK_SIZE..P_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_le_bytes());
        block[P_LAST_BLOCK..P_LAST_BLOCK + 8]
            .copy_from_slice(&self.last_allocated_block.to_le_bytes());
        block[P_SEQUENCE..P_SEQUENCE + 8]
            .copy_from_slice(&self.snapshot_sequence_number.to_le_bytes());
        block[P_METADATA..len - FOOTER_SIZE].copy_from_slice(&self.metadata);
        let crc = crc32fast::hash(&block[..len - FOOTER_SIZE]);
        block[len - FOOTER_SIZE..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Parse and validate a block-sized buffer.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < MIN_BLOCK_SIZE as usize {
            return Err(ArchiveError::Corruption("header block too small".to_string()));
        }
        if &block[P_MAGIC..P_MAGIC + 8] != MAGIC {
            return Err(ArchiveError::Corruption("bad header magic".to_string()));
        }
        let version = u32::from_le_bytes(block[P_VERSION..P_VERSION + 4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(ArchiveError::Corruption(format!(
                "unsupported header version {}",
                version
            )));
        }
        let block_size =
            u32::from_le_bytes(block[P_BLOCK_SIZE..P_BLOCK_SIZE + 4].try_into().unwrap());
        validate_block_size(block_size)
            .map_err(|_| ArchiveError::Corruption("invalid block size in header".to_string()))?;
        if block_size as usize != block.len() {
            return Err(ArchiveError::Corruption(
                "header block size disagrees with slot size".to_string(),
            ));
        }
        let len = block.len();
        let stored = u32::from_le_bytes(block[len - FOOTER_SIZE..].try_into().unwrap());
        let computed = crc32fast::hash(&block[..len - FOOTER_SIZE]);
        if stored != computed {
            return Err(ArchiveError::Corruption("header checksum mismatch".to_string()));
        }
        let last_allocated_block =
            u64::from_le_bytes(block[P_LAST_BLOCK..P_LAST_BLOCK + 8].try_into().unwrap());
        if last_allocated_block < HEADER_COPIES - 1 {
            return Err(ArchiveError::Corruption(
                "committed region ends inside the header".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            last_allocated_block,
            snapshot_sequence_number: u64::from_le_bytes(
                block[P_SEQUENCE..P_SEQUENCE + 8].try_into().unwrap(),
            ),
            metadata: block[P_METADATA..len - FOOTER_SIZE].to_vec(),
        })
    }

    /// Byte length of the opaque metadata region for a given block size.
    pub fn metadata_capacity(block_size: u32) -> usize {
        metadata_len(block_size)
    }

    /// Extract the block size from a preamble without checksum validation.
    /// Used at open to locate the remaining slots before a full decode.
    pub fn block_size_hint(preamble: &[u8]) -> Option<u32> {
        if preamble.len() < P_BLOCK_SIZE + 4 || &preamble[P_MAGIC..P_MAGIC + 8] != MAGIC {
            return None;
        }
        let block_size =
            u32::from_le_bytes(preamble[P_BLOCK_SIZE..P_BLOCK_SIZE + 4].try_into().unwrap());
        validate_block_size(block_size).ok().map(|_| block_size)
    }
}

fn metadata_len(block_size: u32) -> usize {
    block_size as usize - P_METADATA - FOOTER_SIZE
}

fn validate_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
        return Err(ArchiveError::InvalidInput(format!(
            "block size must be a power of two >= {}, got {}",
            MIN_BLOCK_SIZE, block_size
        )));
    }
    Ok(())
}
