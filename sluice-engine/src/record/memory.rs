use {
    super::SegmentStorage,
    async_trait::async_trait,
    bytes::Bytes,
    parking_lot::RwLock,
    std::collections::BTreeMap,
};

/// In-memory recording backend, for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SegmentStorage for MemoryStorage {
    async fn write(&self, key: &str, data: Bytes) -> std::io::Result<()> {
        self.entries.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn read(&self, key: &str) -> std::io::Result<Bytes> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, key.to_string()))
    }

    async fn delete(&self, key: &str) -> std::io::Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> std::io::Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .write("a/b/c", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(storage.read("a/b/c").await.unwrap().as_ref(), b"data");
        assert_eq!(storage.list("a/").await.unwrap().len(), 1);
        storage.delete("a/b/c").await.unwrap();
        assert!(storage.read("a/b/c").await.is_err());
    }
}
