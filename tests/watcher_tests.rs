//! End-to-end test of the file watcher driving reloads

mod common;

use common::{test_pipeline, EchoModel};
use pdfqa::models::PipelineState;
use pdfqa::watcher::spawn_watcher;
use pdfqa::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Poll until the installed chain answers with `expected`
async fn wait_for_answer(pipeline: &Pipeline, expected: &str) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if let Some(chain) = pipeline.current() {
            if let Ok(output) = chain.invoke("What was loaded?").await {
                if output.answer == expected {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_changes_trigger_reload() {
    let t = test_pipeline(Arc::new(EchoModel));
    let cancel = CancellationToken::new();
    let watcher = spawn_watcher(
        Arc::clone(&t.pipeline),
        Duration::from_millis(100),
        cancel.clone(),
    )
    .unwrap();

    // Give the OS watch a moment to register
    tokio::time::sleep(Duration::from_millis(200)).await;

    t.write_document("The watcher loaded this first.");
    assert!(
        wait_for_answer(&t.pipeline, "The watcher loaded this first.").await,
        "first load timed out"
    );
    let first = t.pipeline.status().generation;
    assert!(first >= 1);

    t.write_document("The watcher loaded this second.");
    assert!(
        wait_for_answer(&t.pipeline, "The watcher loaded this second.").await,
        "second load timed out"
    );
    assert!(t.pipeline.status().generation > first);

    watcher.shutdown().await;
    assert!(cancel.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrelated_files_ignored() {
    let t = test_pipeline(Arc::new(EchoModel));
    let watcher = spawn_watcher(
        Arc::clone(&t.pipeline),
        Duration::ZERO,
        CancellationToken::new(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::write(t.dir.path().join("other.pdf"), "not watched").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = t.pipeline.status();
    assert_eq!(status.state, PipelineState::Uninitialized);
    assert!(t.pipeline.current().is_none());

    watcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_neighbour_file_does_not_delay_reload() {
    let t = test_pipeline(Arc::new(EchoModel));
    let watcher = spawn_watcher(
        Arc::clone(&t.pipeline),
        Duration::from_millis(300),
        CancellationToken::new(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A log file in the same directory, written faster than the window
    let log_path = t.dir.path().join("server.log");
    let noise = CancellationToken::new();
    let writer = tokio::spawn({
        let noise = noise.clone();
        async move {
            let mut line = 0u64;
            while !noise.is_cancelled() {
                line += 1;
                std::fs::write(&log_path, format!("log line {}", line)).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });

    t.write_document("Loaded despite the noisy neighbour.");
    let loaded = wait_for_answer(&t.pipeline, "Loaded despite the noisy neighbour.").await;

    noise.cancel();
    writer.await.unwrap();
    watcher.shutdown().await;

    assert!(loaded, "reload was held back by unrelated writes");
}
