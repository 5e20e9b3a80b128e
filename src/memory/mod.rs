pub mod pool;

pub use pool::{
    default_pool, CollectionCallback, CollectionMode, MemoryPool, MemoryPoolConfig, PoolStats,
    DEFAULT_PAGE_SIZE, DEFAULT_POOL_CAPACITY,
};
