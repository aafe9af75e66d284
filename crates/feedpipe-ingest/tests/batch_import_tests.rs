//! Interactive imports driven one request at a time

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{jsonl, notes_type, Harness, PagedFetcher};
use feedpipe_ingest::processor::ProcessorSettings;
use feedpipe_ingest::strategy::BatchProgress;
use feedpipe_ingest::{BatchStrategy, FeedLock, ImportContext, ImportError, QueueBackend};
use std::sync::Arc;

fn three_items() -> String {
    jsonl(&[("a", "first"), ("b", "second"), ("c", "third")])
}

#[tokio::test]
async fn test_steps_advance_until_finished() {
    let fetcher = Arc::new(PagedFetcher::single(three_items()));
    let h = Harness::new(vec![notes_type("notes", fetcher, ProcessorSettings::default())]);
    let feed = h.feed("notes").await;
    let ctx = ImportContext::system();
    let batch = h.batch(2);

    let mut seen: Vec<BatchProgress> = vec![batch.start_batch_import(&ctx, feed.id).await.unwrap()];
    assert_eq!(seen[0].remaining, 1);
    assert!(!seen[0].finished);

    // FETCH and PARSE, then two items per request
    let step = batch.step(&ctx, feed.id).await.unwrap();
    assert_eq!(step.remaining, 4);
    seen.push(step);
    let step = batch.step(&ctx, feed.id).await.unwrap();
    assert_eq!(step.remaining, 2);
    seen.push(step);
    let step = batch.step(&ctx, feed.id).await.unwrap();
    assert!(step.finished);
    assert_eq!(step.progress, 1.0);
    seen.push(step);

    for pair in seen.windows(2) {
        assert!(pair[0].progress <= pair[1].progress);
    }
    for partial in &seen[..seen.len() - 1] {
        assert!(partial.progress < 1.0);
        assert!(!partial.finished);
    }

    let done = h.reload(&feed).await;
    assert!(done.lock.is_none());
    assert_eq!(done.item_count, 3);
    assert_eq!(h.events.count("finished"), 1);
}

#[tokio::test]
async fn test_status_does_not_run_operations() {
    let fetcher = Arc::new(PagedFetcher::single(three_items()));
    let h = Harness::new(vec![notes_type("notes", fetcher.clone(), ProcessorSettings::default())]);
    let feed = h.feed("notes").await;
    let ctx = ImportContext::system();
    let batch = h.batch(2);

    batch.start_batch_import(&ctx, feed.id).await.unwrap();
    let first = batch.progress(feed.id).await.unwrap();
    let second = batch.progress(feed.id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_step_without_running_import_reports_finished() {
    let fetcher = Arc::new(PagedFetcher::single(three_items()));
    let h = Harness::new(vec![notes_type("notes", fetcher, ProcessorSettings::default())]);
    let feed = h.feed("notes").await;

    let progress = h.batch(2).step(&ImportContext::system(), feed.id).await.unwrap();

    assert!(progress.finished);
    assert_eq!(progress.remaining, 0);
    assert_eq!(h.events.count("started"), 0);
}

#[tokio::test]
async fn test_failed_step_aborts_and_clears_queue() {
    let fetcher = Arc::new(PagedFetcher::single(three_items()));
    fetcher.fail_times(1);
    let h = Harness::new(vec![notes_type("notes", fetcher, ProcessorSettings::default())]);
    let feed = h.feed("notes").await;
    let ctx = ImportContext::system();
    let batch = h.batch(2);

    batch.start_batch_import(&ctx, feed.id).await.unwrap();
    let result = batch.step(&ctx, feed.id).await;

    assert!(matches!(result, Err(ImportError::Recoverable(_))));
    assert_eq!(h.queue.len(&BatchStrategy::queue_name(feed.id)).await.unwrap(), 0);
    assert!(!h.locks.is_locked(feed.id).await.unwrap());
    assert_eq!(h.events.count("aborted"), 1);

    // Next attempt starts over
    batch.start_batch_import(&ctx, feed.id).await.unwrap();
    while !batch.step(&ctx, feed.id).await.unwrap().finished {}
    assert_eq!(h.reload(&feed).await.item_count, 3);
}

#[tokio::test]
async fn test_concurrent_batch_import_is_refused() {
    let fetcher = Arc::new(PagedFetcher::single(three_items()));
    let h = Harness::new(vec![notes_type("notes", fetcher, ProcessorSettings::default())]);
    let feed = h.feed("notes").await;
    let ctx = ImportContext::system();
    let batch = h.batch(2);

    batch.start_batch_import(&ctx, feed.id).await.unwrap();
    let second = batch.start_batch_import(&ctx, feed.id).await;

    assert!(matches!(second, Err(ImportError::LockUnavailable(_))));
    assert_eq!(h.queue.len(&BatchStrategy::queue_name(feed.id)).await.unwrap(), 1);
}
