pub mod file;
pub mod memory;

use {async_trait::async_trait, bytes::Bytes};

/// Storage behind the optional recording sink. Keys are
/// `<app>/<stream>/<resource>`; backends may flatten them.
///
/// Delivery never depends on this: segments are served from the in-memory
/// ring, recording is a side channel. A crash mid-write may truncate the
/// final fragment but never corrupts earlier ones, since every write is
/// one complete fragment.
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    async fn write(&self, key: &str, data: Bytes) -> std::io::Result<()>;
    async fn read(&self, key: &str) -> std::io::Result<Bytes>;
    async fn delete(&self, key: &str) -> std::io::Result<()>;
    async fn list(&self, prefix: &str) -> std::io::Result<Vec<String>>;
}

pub use file::FileStorage;
pub use memory::MemoryStorage;
