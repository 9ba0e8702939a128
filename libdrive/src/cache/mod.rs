pub mod pool;
pub mod range_lock;

pub use pool::{CacheFilePool, CacheFileReader, DEFAULT_BLOCK_SIZE, RangeReader, RangeReaderFn};
pub use range_lock::RangeLock;
