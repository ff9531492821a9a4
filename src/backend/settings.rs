//! Prefetch settings persisted as JSON in the config directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "tachiyomi-tui";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchSettings {
    /// Size the look-ahead window from reading velocity instead of `prefetch_chapters`
    pub adaptive_prefetch: bool,
    pub prefetch_chapters: usize,
    pub max_concurrent_downloads: usize,
    pub max_page_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_cap: u32,
    pub page_timeout_secs: u64,
    pub page_list_timeout_secs: u64,
    pub min_chapter_stagger_ms: u64,
    /// Wait for a retry/skip/cancel answer when a chapter's page list fails
    pub pause_on_chapter_error: bool,
    pub max_disk_cache_mb: u64,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            adaptive_prefetch: true,
            prefetch_chapters: 2,
            max_concurrent_downloads: 8,
            max_page_attempts: 25,
            retry_base_delay_ms: 500,
            retry_backoff_cap: 5,
            page_timeout_secs: 15,
            page_list_timeout_secs: 300,
            min_chapter_stagger_ms: 1000,
            pause_on_chapter_error: false,
            max_disk_cache_mb: 500,
        }
    }
}

fn get_settings_path() -> PathBuf {
    let config_dir = config_dir();
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("prefetch.json")
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn page_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("pages")
}

impl PrefetchSettings {
    pub fn load() -> Self {
        let path = get_settings_path();

        if !path.exists() {
            let settings = PrefetchSettings::default();
            settings.save();
            return settings;
        }

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("Ignoring malformed {}: {}", path.display(), e),
            },
            Err(e) => log::warn!("Failed to read {}: {}", path.display(), e),
        }

        PrefetchSettings::default()
    }

    pub fn save(&self) {
        let path = get_settings_path();
        if let Ok(content) = serde_json::to_string_pretty(self) {
            if let Err(e) = fs::write(&path, content) {
                log::warn!("Failed to write {}: {}", path.display(), e);
            }
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn page_list_timeout(&self) -> Duration {
        Duration::from_secs(self.page_list_timeout_secs)
    }

    pub fn disk_cache_budget_bytes(&self) -> u64 {
        self.max_disk_cache_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: PrefetchSettings =
            serde_json::from_str(r#"{"adaptive_prefetch": false, "prefetch_chapters": 4}"#)
                .unwrap();
        assert!(!settings.adaptive_prefetch);
        assert_eq!(settings.prefetch_chapters, 4);
        assert_eq!(settings.max_concurrent_downloads, 8);
        assert_eq!(settings.max_page_attempts, 25);
    }
}
