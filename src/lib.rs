// Chronostore - time-series archive storage core
// Core library module

pub mod codec;
pub mod error;
pub mod file;
pub mod ingest;
pub mod io;
pub mod memory;
pub mod record;

pub use codec::{BlockReader, HistorianCodec};
pub use error::{ArchiveError, Result};
pub use file::{Block, BufferedFile, FileHeaderBlock, FileStats, IoSession};
pub use ingest::{BufferMode, SortedPointBuffer};
pub use memory::{default_pool, CollectionMode, MemoryPool, MemoryPoolConfig};
pub use record::{FixedRecord, HistorianKey, HistorianValue, SortableKey, TreeStream};

/// Archive configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Logical block size of the archive file (power of two, >= 512). Must
    /// divide the memory pool's page size.
    pub block_size: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}
