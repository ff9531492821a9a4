use std::{env, error::Error, sync::Arc};
use tokio::sync::mpsc;

use tachiyomi_prefetch::backend::{
    cache::DiskCache,
    job::{ChapterDecision, PrefetchEvent, PrefetchRequest},
    mangadex::MangaDexSource,
    orchestrator::PrefetchOrchestrator,
    settings::{self, PrefetchSettings},
    source::{ChapterRef, ContentSource},
    storage::SqliteStorage,
};

const USAGE: &str = "usage: tachiyomi-prefetch <manga-id> [max-chapters]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let Some(manga_id) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let max_chapters = match args.next() {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("invalid chapter count: {raw}"))?,
        None => usize::MAX,
    };

    let settings = PrefetchSettings::load();
    let storage = Arc::new(SqliteStorage::open(&settings::data_dir().join("prefetch.db")).await?);
    let cache = Arc::new(DiskCache::new(
        settings::page_cache_dir(),
        settings.disk_cache_budget_bytes(),
    )?);
    let source = Arc::new(MangaDexSource::new()?);

    let listed = source.get_manga_chapters(&manga_id).await?;
    let selected = &listed[..listed.len().min(max_chapters)];
    if selected.is_empty() {
        log::warn!("No readable chapters for {}", manga_id);
        return Ok(());
    }
    log::info!(
        "Prefetching {} chapters, {} pages",
        selected.len(),
        selected.iter().map(|c| c.pages).sum::<usize>()
    );
    let chapters: Vec<ChapterRef> = selected.iter().map(ChapterRef::from).collect();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(
        PrefetchOrchestrator::new(settings, storage, cache.clone(), event_tx)
            .await
            .with_source(source.clone()),
    );

    let request = PrefetchRequest {
        manga_id,
        extension_id: source.id().to_string(),
        chapters,
    };
    let mut job = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_bulk_job(request).await })
    };

    let summary = loop {
        tokio::select! {
            Some(event) = event_rx.recv() => handle_event(&orchestrator, event),
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() && orchestrator.cancel_bulk_job() {
                    log::info!("Cancelling, waiting for in-flight pages");
                }
            }
            joined = &mut job => break joined?,
        }
    };
    while let Ok(event) = event_rx.try_recv() {
        handle_event(&orchestrator, event);
    }

    if let Some(summary) = summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    orchestrator.flush().await;
    log::info!("Page cache holds {} bytes", cache.used_bytes().await);
    Ok(())
}

fn handle_event(orchestrator: &PrefetchOrchestrator, event: PrefetchEvent) {
    match event {
        PrefetchEvent::Progress {
            current,
            total,
            chapter_label,
        } => log::info!("[{}/{}] {}", current, total, chapter_label),
        PrefetchEvent::ChapterError {
            chapter_label,
            error,
            paused,
        } => {
            log::warn!("{}: {}", chapter_label, error);
            // Nobody to ask on the command line.
            if paused {
                orchestrator.resolve_chapter_error(ChapterDecision::Skip);
            }
        }
        PrefetchEvent::Summary(summary) => log::info!(
            "Job {} finished as {:?}",
            summary.job_id,
            summary.status
        ),
    }
}
