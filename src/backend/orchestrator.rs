//! Prefetch orchestration: passive look-ahead on chapter navigation and
//! explicit bulk jobs over many chapters.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::download::{lock, ChapterDownloads, DownloadContext, InflightPages, RetryPolicy};
use super::error::FetchError;
use super::job::{ChapterDecision, JobStatus, JobSummary, PrefetchEvent, PrefetchJob, PrefetchRequest};
use super::settings::PrefetchSettings;
use super::source::{ChapterRef, ContentSource, PageStore};
use super::source_behavior::SourceBehaviorTracker;
use super::storage::{chapter_pages_key, prefetch_history_key, PersistQueue, Storage};
use super::velocity::{NavigationDirection, ReadingSessionRecord, ReadingVelocityTracker};

/// Passive prefetch saves one page at a time, one attempt each.
const PASSIVE_DOWNLOADS: usize = 1;
const PASSIVE_PAGE_ATTEMPTS: u32 = 1;

/// Where the reader is, for passive prefetch.
#[derive(Debug, Clone)]
pub struct NavigationContext {
    pub source_id: String,
    pub manga_id: String,
    /// Reading order, oldest first
    pub chapters: Vec<ChapterRef>,
    pub current_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassivePlan {
    pub buffer_size: usize,
    pub direction: NavigationDirection,
    /// Nearest first
    pub ahead: Vec<ChapterRef>,
    /// Nearest first
    pub behind: Vec<ChapterRef>,
}

impl PassivePlan {
    pub fn targets(&self) -> impl Iterator<Item = &ChapterRef> {
        self.ahead.iter().chain(self.behind.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.ahead.is_empty() && self.behind.is_empty()
    }
}

pub fn plan_passive_prefetch(
    buffer_size: usize,
    direction: NavigationDirection,
    chapters: &[ChapterRef],
    current_index: usize,
) -> PassivePlan {
    let (ahead_count, behind_count) = direction.split(buffer_size);
    let current_index = current_index.min(chapters.len().saturating_sub(1));

    let ahead = chapters
        .iter()
        .skip(current_index + 1)
        .take(ahead_count)
        .cloned()
        .collect();
    let behind = chapters[..current_index]
        .iter()
        .rev()
        .take(behind_count)
        .cloned()
        .collect();

    PassivePlan {
        buffer_size,
        direction,
        ahead,
        behind,
    }
}

/// Page urls gathered for one chapter, in discovery order.
#[derive(Debug, Default)]
struct ChapterPages {
    seen: HashSet<String>,
    urls: Vec<String>,
}

impl ChapterPages {
    fn insert(&mut self, url: String) -> bool {
        if self.seen.insert(url.clone()) {
            self.urls.push(url);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
struct StreamEnd {
    error: Option<FetchError>,
    cancelled: bool,
}

/// Clears the system-wide job slot when a bulk job ends, however it ends.
struct ActiveJobGuard<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

pub struct PrefetchOrchestrator {
    settings: PrefetchSettings,
    sources: HashMap<String, Arc<dyn ContentSource>>,
    pages: InflightPages,
    storage: Arc<dyn Storage>,
    persist: PersistQueue,
    tracker: SourceBehaviorTracker,
    velocity: tokio::sync::Mutex<ReadingVelocityTracker>,
    events: mpsc::UnboundedSender<PrefetchEvent>,
    active_job: Mutex<Option<CancellationToken>>,
    pending_decision: Mutex<Option<oneshot::Sender<ChapterDecision>>>,
    passive: Mutex<Option<CancellationToken>>,
}

impl PrefetchOrchestrator {
    /// Restores source behaviour from `storage` and starts the write queue.
    pub async fn new(
        settings: PrefetchSettings,
        storage: Arc<dyn Storage>,
        store: Arc<dyn PageStore>,
        events: mpsc::UnboundedSender<PrefetchEvent>,
    ) -> Self {
        let (persist, _writer) = PersistQueue::spawn(storage.clone());
        let tracker = SourceBehaviorTracker::load(storage.as_ref(), Some(persist.clone())).await;

        Self {
            settings,
            sources: HashMap::new(),
            pages: InflightPages::new(store),
            storage,
            velocity: tokio::sync::Mutex::new(ReadingVelocityTracker::new(Some(persist.clone()))),
            persist,
            tracker,
            events,
            active_job: Mutex::new(None),
            pending_decision: Mutex::new(None),
            passive: Mutex::new(None),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.sources.insert(source.id().to_string(), source);
        self
    }

    pub fn tracker(&self) -> &SourceBehaviorTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &PrefetchSettings {
        &self.settings
    }

    pub async fn should_throttle(&self, source_id: &str) -> bool {
        self.tracker.should_throttle(source_id).await
    }

    pub async fn get_request_delay(&self, source_id: &str) -> Duration {
        self.tracker.get_request_delay(source_id).await
    }

    pub async fn calculate_adaptive_buffer(&self) -> usize {
        self.velocity.lock().await.calculate_adaptive_buffer()
    }

    pub async fn navigation_direction(&self) -> NavigationDirection {
        self.velocity.lock().await.get_navigation_direction()
    }

    pub async fn start_reading_session(&self, source_id: &str, manga_id: &str, chapter_id: &str) {
        self.velocity
            .lock()
            .await
            .start_session(source_id, manga_id, chapter_id);
    }

    pub async fn record_page_view(&self, page_index: i64) {
        self.velocity.lock().await.record_page_view(page_index);
    }

    pub async fn end_reading_session(&self, completed: bool) -> Option<ReadingSessionRecord> {
        self.velocity.lock().await.end_session(completed)
    }

    /// Wait until every queued persistence write has been attempted.
    pub async fn flush(&self) {
        self.persist.flush().await;
    }

    /// Looks up a registered source, seeding its behaviour row from the
    /// source's declared rate bounds on first use.
    async fn source(&self, source_id: &str) -> Option<Arc<dyn ContentSource>> {
        let source = self.sources.get(source_id)?.clone();
        self.tracker
            .get_or_create(source_id, Some(source.rate_hints()))
            .await;
        Some(source)
    }

    fn emit(&self, event: PrefetchEvent) {
        let _ = self.events.send(event);
    }

    async fn cache_page_list(&self, chapter_id: &str, urls: &[String]) {
        let record = serde_json::json!(urls);
        if let Err(e) = self.storage.put(&chapter_pages_key(chapter_id), record).await {
            log::warn!("Failed to cache page list for {}: {}", chapter_id, e);
        }
    }

    async fn cached_page_list(&self, chapter_id: &str) -> Option<Vec<String>> {
        match self.storage.get(&chapter_pages_key(chapter_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to read cached page list for {}: {}", chapter_id, e);
                None
            }
        }
    }

    /// Drain a chapter's page-list stream into `pages`, handing each new url
    /// to `on_new` as it arrives. Reports the outcome to the behaviour model.
    async fn stream_page_list<F>(
        &self,
        source: &Arc<dyn ContentSource>,
        chapter_id: &str,
        cancel: &CancellationToken,
        pages: &mut ChapterPages,
        mut on_new: F,
    ) -> StreamEnd
    where
        F: FnMut(&str),
    {
        let started = Instant::now();
        let mut end = StreamEnd::default();
        let mut stream = source.fetch_page_list(chapter_id);

        let consume = async {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => {
                        end.cancelled = true;
                        break;
                    }
                    next = stream.next() => match next {
                        Some(batch) => batch,
                        None => break,
                    },
                };

                for url in batch.pages {
                    if pages.insert(url.clone()) {
                        on_new(&url);
                    }
                }
                if let Some(error) = batch.error {
                    end.error = Some(error);
                }
                if batch.done {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(self.settings.page_list_timeout(), consume)
            .await
            .is_err();
        if timed_out {
            end.error = Some(FetchError::timeout("page list"));
        }

        match &end.error {
            Some(error) => {
                self.tracker
                    .record_failure(source.id(), error.status_code())
                    .await;
            }
            None if !end.cancelled => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.tracker.record_success(source.id(), elapsed_ms).await;
            }
            None => {}
        }
        end
    }

    // ---------------------------------------------------------------------
    // Passive prefetch
    // ---------------------------------------------------------------------

    /// React to the reader opening a chapter: pick the chapters around it and
    /// prefetch them in the background. Returns `None` when the source is
    /// unknown or cooling down.
    pub async fn on_chapter_navigation(self: &Arc<Self>, nav: NavigationContext) -> Option<PassivePlan> {
        let Some(source) = self.source(&nav.source_id).await else {
            log::warn!("Passive prefetch for unknown source {}", nav.source_id);
            return None;
        };
        if self.tracker.should_throttle(&nav.source_id).await {
            log::info!("{} is cooling down, skipping passive prefetch", nav.source_id);
            return None;
        }

        let (buffer_size, direction) = {
            let velocity = self.velocity.lock().await;
            let buffer = if self.settings.adaptive_prefetch {
                velocity.calculate_adaptive_buffer()
            } else {
                self.settings.prefetch_chapters
            };
            (buffer, velocity.get_navigation_direction())
        };

        let plan = plan_passive_prefetch(buffer_size, direction, &nav.chapters, nav.current_index);
        log::debug!(
            "Passive prefetch: buffer={} direction={:?} ahead={} behind={}",
            plan.buffer_size,
            plan.direction,
            plan.ahead.len(),
            plan.behind.len()
        );
        if plan.is_empty() {
            return Some(plan);
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.passive).replace(cancel.clone()) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let targets: Vec<ChapterRef> = plan.targets().cloned().collect();
        tokio::spawn(async move {
            this.run_passive(source, nav.manga_id, targets, cancel).await;
        });

        Some(plan)
    }

    async fn run_passive(
        &self,
        source: Arc<dyn ContentSource>,
        manga_id: String,
        targets: Vec<ChapterRef>,
        cancel: CancellationToken,
    ) {
        let retry = RetryPolicy {
            max_attempts: PASSIVE_PAGE_ATTEMPTS,
            ..RetryPolicy::from(&self.settings)
        };
        let ctx = DownloadContext::new(
            self.pages.clone(),
            self.tracker.clone(),
            retry,
            PASSIVE_DOWNLOADS,
            cancel.clone(),
        );
        let min_stagger = Duration::from_millis(self.settings.min_chapter_stagger_ms);

        for (index, chapter) in targets.iter().enumerate() {
            if index > 0 {
                let delay = self.tracker.get_request_delay(source.id()).await.max(min_stagger);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            if self.tracker.should_throttle(source.id()).await {
                log::info!("{} is cooling down, skipping {}", source.id(), chapter.label);
                continue;
            }

            let urls = match self.cached_page_list(&chapter.id).await {
                Some(urls) if !urls.is_empty() => urls,
                _ => {
                    let mut pages = ChapterPages::default();
                    let end = self
                        .stream_page_list(&source, &chapter.id, &cancel, &mut pages, |_| {})
                        .await;
                    if !pages.urls.is_empty() {
                        self.cache_page_list(&chapter.id, &pages.urls).await;
                    }
                    if let Some(error) = end.error {
                        log::warn!("Passive page list for {} failed: {}", chapter.label, error);
                    }
                    pages.urls
                }
            };
            if urls.is_empty() {
                continue;
            }

            let mut downloads = ChapterDownloads::new(ctx.clone(), source.id(), &manga_id, &chapter.id);
            for url in urls {
                if !downloads.push(url) {
                    break;
                }
            }
            let label = chapter.label.clone();
            tokio::spawn(async move {
                let result = downloads.finish().await;
                log::debug!(
                    "Passive prefetch of {}: {} saved, {} failed",
                    label,
                    result.saved,
                    result.failed.len()
                );
            });
        }
    }

    // ---------------------------------------------------------------------
    // Bulk jobs
    // ---------------------------------------------------------------------

    pub fn is_bulk_job_running(&self) -> bool {
        lock(&self.active_job).is_some()
    }

    /// Ask the running job to stop. It finishes in-flight page downloads and
    /// starts nothing new.
    pub fn cancel_bulk_job(&self) -> bool {
        match lock(&self.active_job).as_ref() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Answer a paused chapter-level error. Returns `false` when nothing is waiting.
    pub fn resolve_chapter_error(&self, decision: ChapterDecision) -> bool {
        lock(&self.pending_decision)
            .take()
            .is_some_and(|tx| tx.send(decision).is_ok())
    }

    /// Run a bulk prefetch to completion. Returns `None` without doing
    /// anything when another bulk job is already running.
    pub async fn run_bulk_job(&self, request: PrefetchRequest) -> Option<JobSummary> {
        let cancel = {
            let mut active = lock(&self.active_job);
            if active.is_some() {
                log::info!("A prefetch job is already running, ignoring request");
                return None;
            }
            let cancel = CancellationToken::new();
            *active = Some(cancel.clone());
            cancel
        };
        let _active = ActiveJobGuard {
            slot: &self.active_job,
        };

        let mut job = PrefetchJob::new(request);
        log::info!(
            "Prefetch job {} started: {} chapters",
            job.id,
            job.chapters.len()
        );
        self.persist_history(&job, JobStatus::Running);

        let source = self.source(&job.extension_id).await;
        match source {
            Some(source) => self.run_chapters(&mut job, &source, &cancel).await,
            None => {
                let error = format!("unknown source {}", job.extension_id);
                job.record_failure(None, "", error);
            }
        }

        job.cancelled = cancel.is_cancelled();
        let status = job.terminal_status();
        self.persist_history(&job, status);

        let summary = job.summary(status);
        log::info!(
            "Prefetch job {} {:?}: {} saved, {} failed, {} skipped",
            job.id,
            status,
            summary.success_count,
            summary.failed_count,
            summary.skipped_count
        );
        self.emit(PrefetchEvent::Summary(summary.clone()));
        Some(summary)
    }

    fn persist_history(&self, job: &PrefetchJob, status: JobStatus) {
        self.persist
            .put_serialized(prefetch_history_key(&job.id), &job.history(status));
    }

    async fn run_chapters(
        &self,
        job: &mut PrefetchJob,
        source: &Arc<dyn ContentSource>,
        cancel: &CancellationToken,
    ) {
        let ctx = DownloadContext::new(
            self.pages.clone(),
            self.tracker.clone(),
            RetryPolicy::from(&self.settings),
            self.settings.max_concurrent_downloads,
            cancel.clone(),
        );
        let chapters = job.chapters.clone();
        let total = chapters.len();

        for (index, chapter) in chapters.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            self.emit(PrefetchEvent::Progress {
                current: index + 1,
                total,
                chapter_label: chapter.label.clone(),
            });

            self.run_chapter(job, source, chapter, &ctx, cancel).await;
            self.persist_history(job, JobStatus::Running);
        }
    }

    async fn run_chapter(
        &self,
        job: &mut PrefetchJob,
        source: &Arc<dyn ContentSource>,
        chapter: &ChapterRef,
        ctx: &Arc<DownloadContext>,
        cancel: &CancellationToken,
    ) {
        let mut pages = ChapterPages::default();

        loop {
            if !self.wait_out_cooldown(source.id(), cancel).await {
                return;
            }
            let mut downloads = ChapterDownloads::new(ctx.clone(), source.id(), &job.manga_id, &chapter.id);
            let known_before = pages.urls.len();

            let end = self
                .stream_page_list(source, &chapter.id, cancel, &mut pages, |url| {
                    downloads.push(url.to_string());
                })
                .await;

            // Cache before waiting on downloads so a cancelled or crashed job
            // still leaves the urls resolvable.
            if !pages.urls.is_empty() {
                self.cache_page_list(&chapter.id, &pages.urls).await;
            }
            job.total_pages += pages.urls.len() - known_before;

            let result = downloads.finish().await;
            job.success_count += result.saved;
            for (url, error) in result.failed {
                job.record_failure(Some(url), &chapter.label, error);
            }

            let Some(error) = end.error else {
                if pages.urls.is_empty() && !end.cancelled {
                    log::info!("{} has no pages, skipping", chapter.label);
                    job.skipped_count += 1;
                }
                return;
            };
            if end.cancelled || cancel.is_cancelled() {
                return;
            }

            log::warn!("Page list for {} failed: {}", chapter.label, error);
            match self.chapter_error_decision(chapter, &error, cancel).await {
                ChapterDecision::Retry => {
                    log::info!("Retrying page list for {}", chapter.label);
                }
                ChapterDecision::Skip => {
                    if pages.urls.is_empty() {
                        job.record_failure(None, &chapter.label, error.message);
                    }
                    return;
                }
                ChapterDecision::Cancel => {
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    /// Sleep through an active cooldown. Returns `false` when cancelled first.
    async fn wait_out_cooldown(&self, source_id: &str, cancel: &CancellationToken) -> bool {
        if !self.tracker.should_throttle(source_id).await {
            return true;
        }
        let cooldown = self.tracker.get_request_delay(source_id).await;
        log::info!("{} cooling down for {:?} before the next page list", source_id, cooldown);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(cooldown) => true,
        }
    }

    async fn chapter_error_decision(
        &self,
        chapter: &ChapterRef,
        error: &FetchError,
        cancel: &CancellationToken,
    ) -> ChapterDecision {
        let paused = self.settings.pause_on_chapter_error;
        let answer = paused.then(|| {
            let (tx, rx) = oneshot::channel();
            *lock(&self.pending_decision) = Some(tx);
            rx
        });
        self.emit(PrefetchEvent::ChapterError {
            chapter_label: chapter.label.clone(),
            error: error.message.clone(),
            paused,
        });

        let Some(answer) = answer else {
            return ChapterDecision::Skip;
        };
        let decision = tokio::select! {
            _ = cancel.cancelled() => ChapterDecision::Cancel,
            decision = answer => decision.unwrap_or(ChapterDecision::Skip),
        };
        lock(&self.pending_decision).take();
        decision
    }
}
