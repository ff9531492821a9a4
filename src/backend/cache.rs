use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::{FetchError, Result};
use super::mangadex::build_client;
use super::source::{PageRequest, PageStore, SaveOutcome};

/// Downloaded pages on disk, one file per url, under a byte budget.
///
/// Prefetch saves that would exceed the budget are refused with
/// [`SaveOutcome::CacheFull`]; saves for pages the reader is looking at evict
/// the oldest files instead.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<RwLock<DiskCacheInner>>,
    client: reqwest::Client,
}

struct DiskCacheInner {
    cache_dir: PathBuf,
    max_bytes: u64,
    used_bytes: u64,
}

impl DiskCache {
    pub fn new(cache_dir: PathBuf, max_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        let used_bytes = scan_entries(&cache_dir).iter().map(|(_, size, _)| size).sum();

        Ok(Self {
            inner: Arc::new(RwLock::new(DiskCacheInner {
                cache_dir,
                max_bytes,
                used_bytes,
            })),
            client: build_client()?,
        })
    }

    #[cfg(test)]
    async fn path_for(&self, url: &str) -> PathBuf {
        self.inner.read().await.url_to_filename(url)
    }

    #[cfg(test)]
    async fn has_page(&self, url: &str) -> bool {
        self.path_for(url).await.exists()
    }

    pub async fn used_bytes(&self) -> u64 {
        self.inner.read().await.used_bytes
    }

    async fn download(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::with_status(
                status.as_u16(),
                format!("page download returned {}", status),
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PageStore for DiskCache {
    async fn save(&self, request: &PageRequest) -> std::result::Result<SaveOutcome, FetchError> {
        let path = {
            let inner = self.inner.read().await;
            let path = inner.url_to_filename(&request.url);
            if path.exists() {
                return Ok(SaveOutcome::Saved(path));
            }
            if request.is_prefetch && inner.used_bytes >= inner.max_bytes {
                return Ok(SaveOutcome::CacheFull);
            }
            path
        };

        let bytes = self.download(&request.url).await?;
        self.store_bytes(request, path, bytes).await
    }
}

impl DiskCache {
    /// Write downloaded bytes under the budget. The space is reserved before
    /// the write so the lock is not held across file IO.
    async fn store_bytes(
        &self,
        request: &PageRequest,
        path: PathBuf,
        bytes: Vec<u8>,
    ) -> std::result::Result<SaveOutcome, FetchError> {
        let size = bytes.len() as u64;

        let eviction = {
            let mut inner = self.inner.write().await;
            let over_budget = inner.used_bytes + size > inner.max_bytes;
            if over_budget && request.is_prefetch {
                log::debug!("Cache budget reached, refusing {}", request.url);
                return Ok(SaveOutcome::CacheFull);
            }
            inner.used_bytes += size;
            over_budget.then(|| (inner.cache_dir.clone(), inner.max_bytes * 80 / 100))
        };

        if let Some((cache_dir, target)) = eviction {
            match tokio::task::spawn_blocking(move || evict_oldest(&cache_dir, target)).await {
                Ok(remaining) => self.inner.write().await.used_bytes = remaining + size,
                Err(e) => log::warn!("Cache eviction failed: {}", e),
            }
        }

        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            let mut inner = self.inner.write().await;
            inner.used_bytes = inner.used_bytes.saturating_sub(size);
            return Err(FetchError::new(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }
        Ok(SaveOutcome::Saved(path))
    }
}

impl DiskCacheInner {
    fn url_to_filename(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!("{:016x}", cache_key(url)))
    }
}

/// Delete oldest files until the directory holds at most `target` bytes.
/// Returns the bytes left. Blocking.
fn evict_oldest(cache_dir: &Path, target: u64) -> u64 {
    let mut entries = scan_entries(cache_dir);
    let mut current_size: u64 = entries.iter().map(|(_, size, _)| size).sum();

    entries.sort_by_key(|(_, _, modified)| *modified);

    for (path, size, _) in entries {
        if current_size <= target {
            break;
        }
        if fs::remove_file(&path).is_ok() {
            current_size -= size;
        }
    }
    current_size
}

fn scan_entries(dir: &Path) -> Vec<(PathBuf, u64, std::time::SystemTime)> {
    fs::read_dir(dir)
        .ok()
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| {
                    let meta = e.metadata().ok()?;
                    let modified = meta.modified().ok()?;
                    Some((e.path(), meta.len(), modified))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 64-bit FNV-1a. Stable across builds, so cached files survive upgrades.
fn cache_key(url: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in url.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tachiyomi-prefetch-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn request(url: &str, is_prefetch: bool) -> PageRequest {
        PageRequest {
            url: url.to_string(),
            source_id: "src".to_string(),
            manga_id: "manga".to_string(),
            chapter_id: "ch".to_string(),
            is_prefetch,
        }
    }

    #[test]
    fn cache_keys_are_stable_and_distinct() {
        assert_eq!(cache_key(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(cache_key("https://a/1.jpg"), cache_key("https://a/1.jpg"));
        assert_ne!(cache_key("https://a/1.jpg"), cache_key("https://a/2.jpg"));
    }

    #[tokio::test]
    async fn existing_file_is_returned_without_download() {
        let dir = temp_cache_dir("existing");
        let cache = DiskCache::new(dir.clone(), 1024).unwrap();
        let url = "http://127.0.0.1:9/never-fetched.jpg";
        let path = cache.path_for(url).await;
        fs::write(&path, b"jpeg").unwrap();

        let outcome = cache.save(&request(url, true)).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(path));
        assert!(cache.has_page(url).await);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn prefetch_refused_when_budget_spent() {
        let dir = temp_cache_dir("full");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("old"), vec![0u8; 64]).unwrap();

        let cache = DiskCache::new(dir.clone(), 64).unwrap();
        assert_eq!(cache.used_bytes().await, 64);

        let outcome = cache
            .save(&request("http://127.0.0.1:9/new.jpg", true))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::CacheFull);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn eviction_removes_oldest_files_first() {
        let dir = temp_cache_dir("evict");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..10 {
            fs::write(dir.join(format!("f{}", i)), vec![0u8; 10]).unwrap();
        }
        assert_eq!(evict_oldest(&dir, 80), 80);
        assert_eq!(scan_entries(&dir).len(), 8);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn reader_save_over_budget_evicts_instead_of_refusing() {
        let dir = temp_cache_dir("reader");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..10 {
            fs::write(dir.join(format!("old{}", i)), vec![0u8; 10]).unwrap();
        }
        let cache = DiskCache::new(dir.clone(), 100).unwrap();
        let url = "http://127.0.0.1:9/page.jpg";
        let path = cache.path_for(url).await;

        let refused = cache
            .store_bytes(&request(url, true), path.clone(), vec![1u8; 10])
            .await
            .unwrap();
        assert_eq!(refused, SaveOutcome::CacheFull);

        let saved = cache
            .store_bytes(&request(url, false), path.clone(), vec![1u8; 10])
            .await
            .unwrap();
        assert_eq!(saved, SaveOutcome::Saved(path.clone()));
        assert!(path.exists());
        // Ten old files evicted down to 80 bytes, plus the new page.
        assert_eq!(cache.used_bytes().await, 90);
        assert_eq!(scan_entries(&dir).len(), 9);
        let _ = fs::remove_dir_all(&dir);
    }
}
