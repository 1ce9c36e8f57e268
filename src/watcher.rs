use crate::pipeline::Pipeline;
use notify_debouncer_full::notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shortest quiet period handed to the debouncer
const MIN_DEBOUNCE: Duration = Duration::from_millis(50);

/// Running watcher: the OS-level watch plus the task that reloads on events.
pub struct WatcherHandle {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop watching, then wait for the reload task to finish.
    /// A reload already in progress is allowed to complete.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.debouncer);
        if let Err(e) = self.task.await {
            log::error!("File watcher task failed: {}", e);
        }
    }
}

/// Directory to watch for a file path; bare file names live in "."
fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Does this event touch the watched file in a way that warrants a reload?
pub fn is_reload_event(event: &Event, file_name: &OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Watch the pipeline's document and reload on every change.
///
/// Events are debounced per path, so writes to other files in the same
/// directory never hold back a reload of the document. The debouncer thread
/// only signals; reloading happens on a tokio task, one reload at a time.
pub fn spawn_watcher(
    pipeline: Arc<Pipeline>,
    debounce: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<WatcherHandle> {
    let pdf_path = pipeline.pdf_path().to_path_buf();
    let file_name: OsString = pdf_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Watched path has no file name: {:?}", pdf_path))?
        .to_os_string();
    let dir = watch_dir(&pdf_path);

    let (tx, rx) = mpsc::unbounded_channel::<()>();

    let watched_name = file_name.clone();
    let mut debouncer = new_debouncer(
        debounce.max(MIN_DEBOUNCE),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                if events
                    .iter()
                    .any(|e| is_reload_event(&e.event, &watched_name))
                {
                    // Receiver gone means we are shutting down
                    let _ = tx.send(());
                }
            }
            Err(errors) => {
                for e in errors {
                    log::error!("watch error: {:?}", e);
                }
            }
        },
    )?;
    debouncer.watch(&dir, RecursiveMode::NonRecursive)?;

    log::info!("Watching {:?} for changes to {:?}", dir, file_name);

    let task = tokio::spawn(run_reload_loop(pipeline, rx, cancel.clone()));

    Ok(WatcherHandle {
        debouncer,
        cancel,
        task,
    })
}

async fn run_reload_loop(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = rx.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }

        // Changes that piled up during the previous reload need only one more
        while rx.try_recv().is_ok() {}

        log::info!(
            "Detected change in {:?}. Reloading pipeline...",
            pipeline.pdf_path()
        );

        if let Err(e) = pipeline.reload().await {
            log::error!("Reload after file change failed: {}", e);
        }
    }

    log::info!("File watcher stopped");
}
