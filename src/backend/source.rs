//! Contracts for the collaborators the prefetch engine drives: the content
//! source plugin that lists a chapter's pages, and the page store that
//! downloads and caches them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::FetchError;
use super::source_behavior::RateHints;

/// One increment of a streamed page list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageListBatch {
    pub pages: Vec<String>,
    /// Terminal marker, whether or not `error` is set
    pub done: bool,
    pub total: Option<usize>,
    pub error: Option<FetchError>,
}

impl PageListBatch {
    pub fn pages(pages: Vec<String>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn complete(pages: Vec<String>) -> Self {
        let total = Some(pages.len());
        Self {
            pages,
            done: true,
            total,
            error: None,
        }
    }

    pub fn failed(error: FetchError) -> Self {
        Self {
            done: true,
            error: Some(error),
            ..Self::default()
        }
    }
}

pub type PageListStream = BoxStream<'static, PageListBatch>;

pub trait ContentSource: Send + Sync {
    fn id(&self) -> &str;

    fn rate_hints(&self) -> RateHints {
        RateHints::default()
    }

    /// Stream a chapter's page urls. Each call starts a fresh listing.
    fn fetch_page_list(&self, chapter_id: &str) -> PageListStream;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub id: String,
    pub label: String,
}

impl ChapterRef {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub source_id: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub is_prefetch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(PathBuf),
    /// The cache budget is exhausted; not a fetch failure.
    CacheFull,
}

#[async_trait]
pub trait PageStore: Send + Sync {
    async fn save(&self, request: &PageRequest) -> Result<SaveOutcome, FetchError>;
}
