use {
    super::SegmentStorage,
    async_trait::async_trait,
    bytes::Bytes,
    std::path::{Component, Path, PathBuf},
};

/// Local-disk recording backend.
///
/// Keys map to paths under the root; path traversal in keys is rejected.
/// Writes go through a temp file and rename, so a crash leaves either the
/// previous content or the complete new fragment, never a torn one.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> std::io::Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid storage key: {key}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SegmentStorage for FileStorage {
    async fn write(&self, key: &str, data: Bytes) -> std::io::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> std::io::Result<Bytes> {
        let path = self.resolve(key)?;
        Ok(Bytes::from(tokio::fs::read(&path).await?))
    }

    async fn delete(&self, key: &str) -> std::io::Result<()> {
        let path = self.resolve(key)?;
        tokio::fs::remove_file(&path).await
    }

    async fn list(&self, prefix: &str) -> std::io::Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err),
        };
        while let Some(entry) = reader.next_entry().await? {
            if entry.file_type().await?.is_file() {
                entries.push(format!(
                    "{}/{}",
                    prefix.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let data = Bytes::from_static(b"fragment");
        storage.write("app/s1/seg_0.m4s", data.clone()).await.unwrap();
        assert_eq!(storage.read("app/s1/seg_0.m4s").await.unwrap(), data);

        let listed = storage.list("app/s1").await.unwrap();
        assert_eq!(listed, vec!["app/s1/seg_0.m4s".to_string()]);

        storage.delete("app/s1/seg_0.m4s").await.unwrap();
        assert!(storage.read("app/s1/seg_0.m4s").await.is_err());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage
            .write("../escape", Bytes::from_static(b"x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.list("nothing/here").await.unwrap().is_empty());
    }
}
