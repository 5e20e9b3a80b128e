// # Buffered File - Paged Archive Substrate
//
// Presents a single logical byte-addressable archive to upper layers.
// Committed reads are served zero-copy out of the page cache; reads and
// writes past the committed watermark go to a pool-backed write buffer;
// header commits are atomic and redundant.
//
// ## Region map
//
// ```text
// 0 ............. endOfHeader ............ endOfCommitted ............
// | header copies |   committed, immutable  |  write buffer (memory)  |
// ```
//
// Two mutexes: `state` serializes the cache map, page locks, write-buffer
// table and the commit boundary repair; `flush_lock` serializes commits.
// Disk reads on a cache miss and pool page allocation happen outside the
// state mutex; the insert phase re-acquires it and resolves races by
// releasing the loser's page back to the pool.

use crate::error::{ArchiveError, Result};
use crate::file::header::{FileHeaderBlock, HEADER_COPIES};
use crate::file::replacement::{CacheStats, PageLock, PageReplacement};
use crate::file::write_buffer::WriteBuffer;
use crate::io::IoQueue;
use crate::memory::{CollectionCallback, CollectionMode, MemoryPool};
use crate::ArchiveConfig;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Combined file statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct FileStats {
    pub cache: CacheStats,
    pub tail_pages: usize,
    pub commits: u64,
    pub end_of_committed: u64,
}

struct FileState {
    cache: PageReplacement,
    tail: WriteBuffer,
    end_of_committed: u64,
    header: FileHeaderBlock,
    commits: u64,
    disposed: bool,
}

struct FileShared {
    state: Mutex<FileState>,
    flush_lock: Mutex<()>,
    io: IoQueue,
    pool: Arc<MemoryPool>,
    end_of_header: u64,
    block_size: u32,
    page_size: usize,
    page_mask: u64,
    // Kept alive for the pool's weak registry; taken and unregistered on close
    callback: Mutex<Option<(u64, Arc<CollectionCallback>)>>,
}

impl FileShared {
    fn handle_collection(&self, mode: CollectionMode) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        let evicted = state.cache.do_collection(mode, &self.pool);
        if evicted > 0 {
            debug!(?mode, evicted, "cache collection pass");
        }
    }
}

/// A zero-copy view of one contiguous range of the archive.
///
/// The borrow is bound to the issuing session: the next `get_block` on the
/// same session invalidates the previous view, so a slice can never outlive
/// its pin.
pub struct Block<'a> {
    ptr: NonNull<u8>,
    first_position: u64,
    length: usize,
    writable: bool,
    _session: PhantomData<&'a mut IoSession>,
}

impl<'a> Block<'a> {
    /// Archive position of the first byte of the view.
    #[inline]
    pub fn first_position(&self) -> u64 {
        self.first_position
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True iff the view covers uncommitted space.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Offset of an archive position within this view.
    #[inline]
    pub fn offset_of(&self, position: u64) -> usize {
        debug_assert!(
            position >= self.first_position
                && position < self.first_position + self.length as u64
        );
        (position - self.first_position) as usize
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    /// Mutable view of uncommitted bytes. The archive has one logical
    /// writer; committed views are never writable.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.writable, "block covers committed space");
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.length) }
    }
}

/// Per-reader handle issuing zero-copy block views.
pub struct IoSession {
    shared: Arc<FileShared>,
    lock: PageLock,
}

impl IoSession {
    /// Resolve `position` to a contiguous memory range covering it.
    ///
    /// - Below `end_of_header`: `InvalidPosition` (the header is mutated
    ///   only by the commit path).
    /// - At or past `end_of_committed`: served from the write buffer,
    ///   writable, clipped from below so the view never covers committed
    ///   bytes.
    /// - Otherwise: served from the cache, read-only, clipped from above at
    ///   `end_of_committed`; `is_writing` fails with `WriteToCommittedSpace`.
    pub fn get_block(&mut self, position: u64, is_writing: bool) -> Result<Block<'_>> {
        let shared = self.shared.clone();
        loop {
            let mut state = shared.state.lock();
            if state.disposed {
                return Err(ArchiveError::Disposed);
            }
            if position < shared.end_of_header {
                return Err(ArchiveError::InvalidPosition(position));
            }
            let rel = position - shared.end_of_header;
            let page_pos = rel & !shared.page_mask;
            let end_rel = state.end_of_committed - shared.end_of_header;

            if position >= state.end_of_committed {
                if is_writing && !shared.io.can_write() {
                    return Err(ArchiveError::ModeViolation(
                        "archive opened read only".to_string(),
                    ));
                }
                state.cache.clear_lock(&self.lock);
                if let Some(ptr) = state.tail.get(page_pos) {
                    let first_rel = page_pos.max(end_rel);
                    let length = (page_pos + shared.page_size as u64 - first_rel) as usize;
                    let ptr = unsafe {
                        NonNull::new_unchecked(ptr.as_ptr().add((first_rel - page_pos) as usize))
                    };
                    return Ok(Block {
                        ptr,
                        first_position: shared.end_of_header + first_rel,
                        length,
                        writable: shared.io.can_write(),
                        _session: PhantomData,
                    });
                }
                drop(state);

                // Fault in a fresh tail page. Allocation may fire a
                // collection callback that takes the state mutex, so it must
                // happen while we do not hold it.
                let (pool_index, ptr) = shared.pool.allocate_page()?;
                let mut state = shared.state.lock();
                if state.disposed {
                    shared.pool.release_page(pool_index);
                    return Err(ArchiveError::Disposed);
                }
                if position < state.end_of_committed {
                    // A commit advanced past us while allocating
                    shared.pool.release_page(pool_index);
                    continue;
                }
                let (_, added) = state.tail.add_or_get(page_pos, pool_index, ptr);
                if !added {
                    shared.pool.release_page(pool_index);
                }
                continue;
            }

            // Committed region
            if is_writing {
                return Err(ArchiveError::WriteToCommittedSpace(position));
            }
            state.cache.clear_lock(&self.lock);
            if let Some(ptr) = state.cache.try_get_page(&self.lock, page_pos) {
                let first_position = shared.end_of_header + page_pos;
                let length =
                    (shared.page_size as u64).min(state.end_of_committed - first_position) as usize;
                return Ok(Block {
                    ptr,
                    first_position,
                    length,
                    writable: false,
                    _session: PhantomData,
                });
            }
            drop(state);

            // Miss: read the page outside the state mutex, then insert. A
            // concurrent miss may have won; the loser releases its page.
            let (pool_index, ptr) = shared.pool.allocate_page()?;
            let page =
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), shared.page_size) };
            if let Err(e) = shared.io.read_at(shared.end_of_header + page_pos, page) {
                shared.pool.release_page(pool_index);
                return Err(e);
            }
            let mut state = shared.state.lock();
            if state.disposed {
                shared.pool.release_page(pool_index);
                return Err(ArchiveError::Disposed);
            }
            let (ptr, added) = state.cache.add_or_get(&self.lock, page_pos, pool_index, ptr);
            if !added {
                shared.pool.release_page(pool_index);
            }
            let first_position = shared.end_of_header + page_pos;
            let length =
                (shared.page_size as u64).min(state.end_of_committed - first_position) as usize;
            return Ok(Block {
                ptr,
                first_position,
                length,
                writable: false,
                _session: PhantomData,
            });
        }
    }

    /// Release the session's current pin without issuing a new view.
    pub fn clear(&mut self) {
        let mut state = self.shared.state.lock();
        state.cache.clear_lock(&self.lock);
    }
}

impl Drop for IoSession {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.cache.destroy_lock(&self.lock);
    }
}

/// Buffered paging archive file.
pub struct BufferedFile {
    shared: Arc<FileShared>,
}

impl BufferedFile {
    /// Create a fresh archive, writing all ten header copies.
    pub fn create(path: &Path, pool: Arc<MemoryPool>, config: &ArchiveConfig) -> Result<Self> {
        let header = FileHeaderBlock::new(config.block_size)?;
        check_geometry(&pool, config.block_size)?;
        let io = IoQueue::create(path)?;

        let block_size = config.block_size as usize;
        let mut block = vec![0u8; block_size];
        header.encode(&mut block);
        let mut region = vec![0u8; block_size * HEADER_COPIES as usize];
        for slot in 0..HEADER_COPIES as usize {
            region[slot * block_size..(slot + 1) * block_size].copy_from_slice(&block);
        }
        io.write_at(0, &region)?;
        io.flush()?;
        debug!(path = %path.display(), block_size = config.block_size, "created archive");
        Ok(Self::assemble(io, pool, header))
    }

    /// Open an existing archive for reading and appending.
    pub fn open(path: &Path, pool: Arc<MemoryPool>, config: &ArchiveConfig) -> Result<Self> {
        Self::open_inner(path, pool, config, true)
    }

    /// Open an existing archive for reading only.
    pub fn open_read_only(
        path: &Path,
        pool: Arc<MemoryPool>,
        config: &ArchiveConfig,
    ) -> Result<Self> {
        Self::open_inner(path, pool, config, false)
    }

    fn open_inner(
        path: &Path,
        pool: Arc<MemoryPool>,
        config: &ArchiveConfig,
        writable: bool,
    ) -> Result<Self> {
        let io = IoQueue::open(path, writable)?;

        // The header carries the block size; bootstrap it from the primary
        // copy's preamble, falling back to the configured size when copy A
        // is torn.
        let mut preamble = [0u8; 64];
        io.read_at(0, &mut preamble)?;
        let block_size =
            FileHeaderBlock::block_size_hint(&preamble).unwrap_or(config.block_size);

        // Accept the redundant copy with the highest snapshot sequence that
        // validates.
        let mut block = vec![0u8; block_size as usize];
        let mut best: Option<FileHeaderBlock> = None;
        let mut primary_valid = false;
        for slot in 0..HEADER_COPIES {
            io.read_at(slot * block_size as u64, &mut block)?;
            match FileHeaderBlock::decode(&block) {
                Ok(header) => {
                    if slot == 0 {
                        primary_valid = true;
                    }
                    if best.as_ref().map_or(true, |b| {
                        header.snapshot_sequence_number > b.snapshot_sequence_number
                    }) {
                        best = Some(header);
                    }
                }
                Err(e) => debug!(slot, error = %e, "header slot rejected"),
            }
        }
        let header = best.ok_or_else(|| {
            ArchiveError::Corruption("no valid header copy found".to_string())
        })?;
        if !primary_valid {
            warn!(path = %path.display(), "primary header copy invalid; recovered from a redundant slot");
        }
        check_geometry(&pool, header.block_size)?;
        debug!(
            path = %path.display(),
            sequence = header.snapshot_sequence_number,
            end_of_committed = header.end_of_committed(),
            "opened archive"
        );
        Ok(Self::assemble(io, pool, header))
    }

    fn assemble(io: IoQueue, pool: Arc<MemoryPool>, header: FileHeaderBlock) -> Self {
        let page_size = pool.page_size();
        let end_of_header = header.end_of_header();
        let block_size = header.block_size;
        let shared = Arc::new(FileShared {
            state: Mutex::new(FileState {
                cache: PageReplacement::new(page_size),
                tail: WriteBuffer::new(page_size),
                end_of_committed: header.end_of_committed(),
                header,
                commits: 0,
                disposed: false,
            }),
            flush_lock: Mutex::new(()),
            io,
            pool,
            end_of_header,
            block_size,
            page_size,
            page_mask: (page_size - 1) as u64,
            callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let callback: Arc<CollectionCallback> = Arc::new(move |mode| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_collection(mode);
            }
        });
        let id = shared.pool.register_collection(&callback);
        *shared.callback.lock() = Some((id, callback));
        BufferedFile { shared }
    }

    /// Open an I/O session bound to a private page lock.
    pub fn new_io_session(&self) -> Result<IoSession> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(ArchiveError::Disposed);
        }
        let lock = state.cache.create_lock();
        Ok(IoSession {
            shared: self.shared.clone(),
            lock,
        })
    }

    /// Commit everything up to the new header's high-water mark.
    ///
    /// 1. Stream `[end_of_committed, new_end)` from the write buffer to disk.
    /// 2. Write the header (sequence advanced) to slots A, B and the
    ///    rotating slot.
    /// 3. Flush OS buffers.
    /// 4. Advance the watermark, repair the resident boundary page, and
    ///    release fully committed tail pages.
    pub fn flush_with_header(&self, new_header: &FileHeaderBlock) -> Result<()> {
        let shared = &self.shared;
        if !shared.io.can_write() {
            return Err(ArchiveError::ModeViolation(
                "archive opened read only".to_string(),
            ));
        }
        let _flush = shared.flush_lock.lock();

        let (old_end, sequence) = {
            let state = shared.state.lock();
            if state.disposed {
                return Err(ArchiveError::Disposed);
            }
            (state.end_of_committed, state.header.snapshot_sequence_number)
        };

        if new_header.block_size != shared.block_size {
            return Err(ArchiveError::InvalidInput(format!(
                "header block size {} does not match archive block size {}",
                new_header.block_size, shared.block_size
            )));
        }
        let mut committed = new_header.clone();
        committed.snapshot_sequence_number = sequence + 1;
        if committed.metadata.len() != FileHeaderBlock::metadata_capacity(shared.block_size) {
            return Err(ArchiveError::InvalidInput(
                "header metadata region has the wrong length".to_string(),
            ));
        }
        let new_end = committed.end_of_committed();
        if new_end < old_end {
            return Err(ArchiveError::InvalidInput(
                "committed region cannot shrink".to_string(),
            ));
        }

        // 1. Sequential stream of the newly committed range. Copied out
        // page-at-a-time under the state mutex; written without it.
        let old_end_rel = old_end - shared.end_of_header;
        let new_end_rel = new_end - shared.end_of_header;
        let mut staging = vec![0u8; shared.page_size];
        let mut cursor = old_end_rel;
        while cursor < new_end_rel {
            let length = ((new_end_rel - cursor) as usize).min(shared.page_size);
            {
                let state = shared.state.lock();
                state
                    .tail
                    .copy_range(cursor, cursor + length as u64, &mut staging[..length]);
            }
            shared.io.write_at(shared.end_of_header + cursor, &staging[..length])?;
            cursor += length as u64;
        }

        // 2. Redundant header copies
        let mut block = vec![0u8; shared.block_size as usize];
        committed.encode(&mut block);
        let bs = shared.block_size as u64;
        shared.io.write_at(0, &block)?;
        shared.io.write_at(bs, &block)?;
        shared.io.write_at(bs * committed.rotating_slot(), &block)?;

        // 3. Durability point
        shared.io.flush()?;

        // 4. Publish the new watermark
        let mut state = shared.state.lock();
        state.end_of_committed = new_end;
        state.header = committed;
        state.commits += 1;

        // The page straddling the old boundary exists in both the cache
        // (stale suffix) and the write buffer (authoritative bytes). Copy
        // the committed span over the resident copy so cached readers see
        // the post-commit bytes.
        let boundary = old_end_rel & !shared.page_mask;
        if old_end_rel != boundary {
            if let Some(dst) = state.cache.try_get_page_no_lock(boundary) {
                let seg_end = (boundary + shared.page_size as u64).min(new_end_rel);
                if seg_end > old_end_rel {
                    let length = (seg_end - old_end_rel) as usize;
                    let offset = (old_end_rel - boundary) as usize;
                    let repair = unsafe {
                        std::slice::from_raw_parts_mut(dst.as_ptr().add(offset), length)
                    };
                    state.tail.copy_range(old_end_rel, seg_end, repair);
                }
            }
        }
        state.tail.release_committed(new_end_rel, &shared.pool);
        debug!(
            old_end,
            new_end,
            sequence = state.header.snapshot_sequence_number,
            "committed archive snapshot"
        );
        Ok(())
    }

    /// Current committed header.
    pub fn header(&self) -> Result<FileHeaderBlock> {
        let state = self.shared.state.lock();
        if state.disposed {
            return Err(ArchiveError::Disposed);
        }
        Ok(state.header.clone())
    }

    /// Committed length of the archive.
    pub fn length(&self) -> Result<u64> {
        let state = self.shared.state.lock();
        if state.disposed {
            return Err(ArchiveError::Disposed);
        }
        Ok(state.end_of_committed)
    }

    /// First byte past the header region.
    #[inline]
    pub fn end_of_header(&self) -> u64 {
        self.shared.end_of_header
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        !self.shared.io.can_write()
    }

    pub fn stats(&self) -> FileStats {
        let state = self.shared.state.lock();
        FileStats {
            cache: state.cache.stats(),
            tail_pages: state.tail.page_count(),
            commits: state.commits,
            end_of_committed: state.end_of_committed,
        }
    }

    /// Tear down: unregister from the pool, release every resident and tail
    /// page, and mark the file disposed. Uncommitted bytes are discarded.
    /// Calling close twice is a no-op; concurrent operations on other
    /// sessions observe `Disposed`.
    pub fn close(&self) {
        let _flush = self.shared.flush_lock.lock();
        let registration = self.shared.callback.lock().take();
        if let Some((id, _)) = registration {
            self.shared.pool.unregister_collection(id);
        }
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        let FileState { cache, tail, .. } = &mut *state;
        cache.release_all(&self.shared.pool);
        tail.release_all(&self.shared.pool);
        debug!("archive closed");
    }
}

impl Drop for BufferedFile {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_geometry(pool: &MemoryPool, block_size: u32) -> Result<()> {
    let page_size = pool.page_size();
    if page_size < block_size as usize || page_size % block_size as usize != 0 {
        return Err(ArchiveError::InvalidInput(format!(
            "pool page size {} must be a multiple of block size {}",
            page_size, block_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPoolConfig;
    use tempfile::TempDir;

    fn pool(capacity: usize) -> Arc<MemoryPool> {
        Arc::new(
            MemoryPool::new(MemoryPoolConfig {
                page_size: 4096,
                capacity,
            })
            .unwrap(),
        )
    }

    fn config() -> ArchiveConfig {
        ArchiveConfig { block_size: 4096 }
    }

    #[test]
    fn test_header_region_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let file =
            BufferedFile::create(&dir.path().join("a.arc"), pool(16), &config()).unwrap();
        let mut session = file.new_io_session().unwrap();

        for position in [0u64, 1024, 40959] {
            for is_writing in [false, true] {
                assert!(matches!(
                    session.get_block(position, is_writing),
                    Err(ArchiveError::InvalidPosition(_))
                ));
            }
        }
    }

    #[test]
    fn test_writability_partition() {
        let dir = TempDir::new().unwrap();
        let file =
            BufferedFile::create(&dir.path().join("a.arc"), pool(16), &config()).unwrap();
        let mut session = file.new_io_session().unwrap();

        // Tail block is writable and normalized to the committed boundary
        let block = session.get_block(40960, true).unwrap();
        assert!(block.writable());
        assert_eq!(block.first_position(), 40960);
        assert_eq!(block.len(), 4096);
        drop(block);

        // Commit one block, then the same position is read-only
        let mut header = file.header().unwrap();
        header.last_allocated_block = 10;
        file.flush_with_header(&header).unwrap();

        let block = session.get_block(40960, false).unwrap();
        assert!(!block.writable());
        assert_eq!(block.len(), 4096);
        drop(block);
        assert!(matches!(
            session.get_block(40960, true),
            Err(ArchiveError::WriteToCommittedSpace(_))
        ));
    }

    #[test]
    fn test_dispose_semantics() {
        let dir = TempDir::new().unwrap();
        let pool = pool(16);
        let file =
            BufferedFile::create(&dir.path().join("a.arc"), pool.clone(), &config()).unwrap();
        let mut session = file.new_io_session().unwrap();
        session.get_block(40960, true).unwrap();
        assert!(pool.stats().in_use > 0);

        file.close();
        file.close(); // double close is a no-op
        assert_eq!(pool.stats().in_use, 0);
        assert!(matches!(
            session.get_block(40960, false),
            Err(ArchiveError::Disposed)
        ));
        assert!(file.new_io_session().is_err());
        assert!(file.length().is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.arc");
        {
            let file = BufferedFile::create(&path, pool(16), &config()).unwrap();
            let mut header = file.header().unwrap();
            header.last_allocated_block = 10;
            file.flush_with_header(&header).unwrap();
        }

        let file = BufferedFile::open_read_only(&path, pool(16), &config()).unwrap();
        assert!(file.is_read_only());
        let mut session = file.new_io_session().unwrap();
        assert!(session.get_block(40960, false).is_ok());
        assert!(file.flush_with_header(&file.header().unwrap()).is_err());
        assert!(matches!(
            session.get_block(50000, true),
            Err(ArchiveError::ModeViolation(_))
        ));
    }

    #[test]
    fn test_geometry_validation() {
        let dir = TempDir::new().unwrap();
        // Pool pages smaller than the block size are rejected
        let small = Arc::new(
            MemoryPool::new(MemoryPoolConfig {
                page_size: 2048,
                capacity: 8,
            })
            .unwrap(),
        );
        assert!(BufferedFile::create(&dir.path().join("a.arc"), small, &config()).is_err());
    }
}
