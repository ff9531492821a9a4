//! Bulk prefetch job state, its stored history row and the events reported to
//! the UI while it runs.

use serde::{Deserialize, Serialize};

use super::source::ChapterRef;
use super::storage::now_ms;

/// Failed pages carried in a summary.
pub const SUMMARY_FAILED_PAGES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    /// `None` when the chapter's page list itself could not be fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub chapter: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub manga_id: String,
    pub extension_id: String,
    /// In processing order
    pub chapters: Vec<ChapterRef>,
}

#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub id: String,
    pub manga_id: String,
    pub extension_id: String,
    pub chapters: Vec<ChapterRef>,
    pub started_at: u64,
    pub total_pages: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub failed_pages: Vec<FailedPage>,
    pub cancelled: bool,
}

impl PrefetchJob {
    pub fn new(request: PrefetchRequest) -> Self {
        let started_at = now_ms();
        Self {
            id: format!("{}-{}-{}", request.extension_id, request.manga_id, started_at),
            manga_id: request.manga_id,
            extension_id: request.extension_id,
            chapters: request.chapters,
            started_at,
            total_pages: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            failed_pages: Vec::new(),
            cancelled: false,
        }
    }

    pub fn record_failure(&mut self, url: Option<String>, chapter: &str, error: String) {
        self.failed_count += 1;
        self.failed_pages.push(FailedPage {
            url,
            chapter: chapter.to_string(),
            error,
        });
    }

    /// `failed` only when nothing succeeded and something failed.
    pub fn terminal_status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else if self.success_count == 0 && self.failed_count > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    pub fn history(&self, status: JobStatus) -> PrefetchHistory {
        PrefetchHistory {
            id: self.id.clone(),
            manga_id: self.manga_id.clone(),
            extension_id: self.extension_id.clone(),
            chapter_count: self.chapters.len(),
            total_pages: self.total_pages,
            success_count: self.success_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            status,
            started_at: self.started_at,
            finished_at: (status != JobStatus::Running).then(now_ms),
            failed_pages: self.failed_pages.clone(),
        }
    }

    pub fn summary(&self, status: JobStatus) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            status,
            total_pages: self.total_pages,
            success_count: self.success_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            failed_pages: self
                .failed_pages
                .iter()
                .take(SUMMARY_FAILED_PAGES)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchHistory {
    pub id: String,
    pub manga_id: String,
    pub extension_id: String,
    pub chapter_count: usize,
    pub total_pages: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub status: JobStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub failed_pages: Vec<FailedPage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub total_pages: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub failed_pages: Vec<FailedPage>,
}

/// How the UI answers a paused chapter-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterDecision {
    Retry,
    Skip,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrefetchEvent {
    Progress {
        current: usize,
        total: usize,
        chapter_label: String,
    },
    /// A chapter's page list could not be fetched. When pausing is enabled the
    /// job waits for a [`ChapterDecision`].
    ChapterError {
        chapter_label: String,
        error: String,
        paused: bool,
    },
    Summary(JobSummary),
}
