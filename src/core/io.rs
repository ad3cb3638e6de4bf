use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use url::Url;

/// Key/value object store. Keys are `/`-separated relative paths; `write` is
/// an upsert.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Stable URL under which the stored object is served.
    fn public_url(&self, path: &str) -> Result<String>;
}

/// Filesystem-backed storage rooted at a folder.
pub struct NativeStorage {
    root: PathBuf,
    public_base: Option<Url>,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<&str>) -> Result<Self> {
        let public_base = match public_base_url {
            Some(base) => {
                // Url::join drops the last segment unless the base ends in '/'.
                let base = if base.ends_with('/') {
                    base.to_string()
                } else {
                    format!("{}/", base)
                };
                Some(Url::parse(&base).with_context(|| format!("Invalid public_base_url: {}", base))?)
            }
            None => None,
        };
        Ok(Self { root: root.into(), public_base })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("Invalid storage key: {}", key));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write then rename so readers never see a half-written object.
        let tmp = PathBuf::from(format!("{}.partial", full.to_string_lossy()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if tokio::fs::try_exists(&full).await? {
            if full.is_dir() {
                tokio::fs::remove_dir_all(&full).await?;
            } else {
                tokio::fs::remove_file(&full).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(full).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut entries = Vec::new();

        if dir.is_dir() {
            let mut rd = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let key = format!("{}/{}", prefix.trim_end_matches('/'), name);
                entries.push(key.trim_start_matches('/').to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn public_url(&self, path: &str) -> Result<String> {
        let key = path.trim_start_matches('/');
        match &self.public_base {
            Some(base) => Ok(base.join(key)?.to_string()),
            None => {
                let full = self.resolve(key)?;
                let abs = if full.is_absolute() {
                    full
                } else {
                    std::env::current_dir()?.join(full)
                };
                Url::from_file_path(&abs)
                    .map(|u| u.to_string())
                    .map_err(|_| anyhow!("Cannot build file URL for {}", abs.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path(), None)?;

        storage.write("books/a.json", b"{}").await?;
        storage.write("books/a.json", b"{\"v\":2}").await?;
        assert_eq!(storage.read("books/a.json").await?, b"{\"v\":2}");
        assert!(storage.exists("books/a.json").await?);
        assert_eq!(storage.list("books").await?, vec!["books/a.json".to_string()]);

        storage.delete("books/a.json").await?;
        assert!(!storage.exists("books/a.json").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path(), None)?;
        assert!(storage.write("../evil", b"x").await.is_err());
        Ok(())
    }

    #[test]
    fn test_public_url() -> Result<()> {
        let storage = NativeStorage::new("/srv/storage", Some("https://cdn.example.com/books"))?;
        assert_eq!(
            storage.public_url("images/b/cover.png")?,
            "https://cdn.example.com/books/images/b/cover.png"
        );

        let local = NativeStorage::new("/srv/storage", None)?;
        assert!(local.public_url("images/x.png")?.starts_with("file:///srv/storage/images/x.png"));
        Ok(())
    }
}
