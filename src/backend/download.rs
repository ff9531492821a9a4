//! Bounded, retrying page downloads.
//!
//! Every page save goes through [`InflightPages`], so the passive and bulk
//! prefetch paths never download the same url twice at once. A
//! [`ChapterDownloads`] queue spawns one task per page; tasks wait on the
//! context's semaphore before touching the network.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::error::FetchError;
use super::settings::PrefetchSettings;
use super::source::{PageRequest, PageStore, SaveOutcome};
use super::source_behavior::SourceBehaviorTracker;

pub type SaveResult = Result<SaveOutcome, FetchError>;
type SharedSave = Shared<BoxFuture<'static, SaveResult>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deduplicates concurrent saves of the same url.
#[derive(Clone)]
pub struct InflightPages {
    store: Arc<dyn PageStore>,
    inflight: Arc<Mutex<HashMap<String, SharedSave>>>,
}

/// Removes the entry when the caller that started a save stops waiting on it.
struct InflightEntry {
    inflight: Arc<Mutex<HashMap<String, SharedSave>>>,
    url: String,
    save: SharedSave,
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        let mut inflight = lock(&self.inflight);
        if inflight
            .get(&self.url)
            .is_some_and(|current| current.ptr_eq(&self.save))
        {
            inflight.remove(&self.url);
        }
    }
}

impl InflightPages {
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn save(&self, request: PageRequest) -> SaveResult {
        let (save, _entry) = {
            let mut inflight = lock(&self.inflight);
            let existing = inflight.get(&request.url).cloned();
            match existing {
                Some(existing) => (existing, None),
                None => {
                    let store = self.store.clone();
                    let url = request.url.clone();
                    let save = async move { store.save(&request).await }.boxed().shared();
                    inflight.insert(url.clone(), save.clone());
                    let entry = InflightEntry {
                        inflight: self.inflight.clone(),
                        url,
                        save: save.clone(),
                    };
                    (save, Some(entry))
                }
            }
        };
        save.await
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_cap: u32,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.min(self.backoff_cap).max(1)
    }
}

impl From<&PrefetchSettings> for RetryPolicy {
    fn from(settings: &PrefetchSettings) -> Self {
        Self {
            max_attempts: settings.max_page_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            backoff_cap: settings.retry_backoff_cap,
            attempt_timeout: settings.page_timeout(),
        }
    }
}

/// Shared by every chapter of one prefetch run.
pub struct DownloadContext {
    pages: InflightPages,
    tracker: SourceBehaviorTracker,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl DownloadContext {
    pub fn new(
        pages: InflightPages,
        tracker: SourceBehaviorTracker,
        retry: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages,
            tracker,
            retry,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    Saved,
    Failed(String),
    CacheFull,
    /// Never attempted, or retries stopped by cancellation or a full cache
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub url: String,
    pub status: PageStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterResult {
    pub saved: usize,
    pub failed: Vec<(String, String)>,
    pub abandoned: usize,
    pub cache_full: bool,
}

impl ChapterResult {
    fn absorb(&mut self, outcome: PageOutcome) {
        match outcome.status {
            PageStatus::Saved => self.saved += 1,
            PageStatus::Failed(error) => self.failed.push((outcome.url, error)),
            PageStatus::CacheFull => {
                self.cache_full = true;
                self.abandoned += 1;
            }
            PageStatus::Abandoned => self.abandoned += 1,
        }
    }
}

/// Download queue for one chapter's pages.
pub struct ChapterDownloads {
    ctx: Arc<DownloadContext>,
    /// Cancelled with the job, or on its own when the cache fills up
    stop: CancellationToken,
    source_id: String,
    manga_id: String,
    chapter_id: String,
    tasks: JoinSet<PageOutcome>,
}

impl ChapterDownloads {
    pub fn new(ctx: Arc<DownloadContext>, source_id: &str, manga_id: &str, chapter_id: &str) -> Self {
        let stop = ctx.cancel.child_token();
        Self {
            ctx,
            stop,
            source_id: source_id.to_string(),
            manga_id: manga_id.to_string(),
            chapter_id: chapter_id.to_string(),
            tasks: JoinSet::new(),
        }
    }

    /// Queue a page. Returns `false` once the chapter has been stopped.
    pub fn push(&mut self, url: String) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }

        let request = PageRequest {
            url,
            source_id: self.source_id.clone(),
            manga_id: self.manga_id.clone(),
            chapter_id: self.chapter_id.clone(),
            is_prefetch: true,
        };
        self.tasks
            .spawn(download_page(self.ctx.clone(), self.stop.clone(), request));
        true
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait for every queued page. Attempts already running finish normally.
    pub async fn finish(mut self) -> ChapterResult {
        let mut result = ChapterResult::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => result.absorb(outcome),
                Err(e) => log::warn!("Page task for chapter {} failed: {}", self.chapter_id, e),
            }
        }
        if result.cache_full {
            log::info!(
                "Cache full, abandoned {} remaining pages of chapter {}",
                result.abandoned,
                self.chapter_id
            );
        }
        result
    }
}

async fn download_page(
    ctx: Arc<DownloadContext>,
    stop: CancellationToken,
    request: PageRequest,
) -> PageOutcome {
    let url = request.url.clone();
    let outcome = |status| PageOutcome {
        url: url.clone(),
        status,
    };

    let Ok(_permit) = ctx.permits.clone().acquire_owned().await else {
        return outcome(PageStatus::Abandoned);
    };

    let mut last_error = String::new();
    for attempt in 1..=ctx.retry.max_attempts {
        if stop.is_cancelled() {
            return outcome(PageStatus::Abandoned);
        }

        if ctx.tracker.should_throttle(&request.source_id).await {
            let cooldown = ctx.tracker.get_request_delay(&request.source_id).await;
            log::debug!("{} cooling down for {:?}", request.source_id, cooldown);
            tokio::select! {
                _ = stop.cancelled() => return outcome(PageStatus::Abandoned),
                _ = tokio::time::sleep(cooldown) => {}
            }
        }

        let started = Instant::now();
        let attempt_result =
            tokio::time::timeout(ctx.retry.attempt_timeout, ctx.pages.save(request.clone())).await;

        let error = match attempt_result {
            Ok(Ok(SaveOutcome::Saved(_))) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                ctx.tracker.record_success(&request.source_id, elapsed_ms).await;
                return outcome(PageStatus::Saved);
            }
            Ok(Ok(SaveOutcome::CacheFull)) => {
                stop.cancel();
                return outcome(PageStatus::CacheFull);
            }
            Ok(Err(e)) => e,
            Err(_) => FetchError::timeout("page download"),
        };

        ctx.tracker
            .record_failure(&request.source_id, error.status_code())
            .await;
        log::debug!(
            "Attempt {}/{} for {} failed: {}",
            attempt,
            ctx.retry.max_attempts,
            url,
            error
        );
        last_error = error.message;

        if attempt < ctx.retry.max_attempts {
            tokio::select! {
                _ = stop.cancelled() => return outcome(PageStatus::Abandoned),
                _ = tokio::time::sleep(ctx.retry.delay(attempt)) => {}
            }
        }
    }

    outcome(PageStatus::Failed(last_error))
}
