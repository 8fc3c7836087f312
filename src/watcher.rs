//! Manifest file watching with debounce.
//!
//! Watches the directory containing the manifest (so editors that replace
//! the file are caught) and invokes the reload callback once writes settle.
//! The watcher lives on its own thread; dropping the returned handle stops
//! it.

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};

/// Quiet period after the last write before a reload fires.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the file watcher alive; dropping it stops watching.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
}

/// Watches `path` for changes and calls `on_change` after each settled burst
/// of writes.
pub fn watch<F>(path: &Path, on_change: F) -> Result<WatcherHandle>
where
    F: Fn() + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = result {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(());
                }
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|e| ProxyError::config_validation(format!("failed to create file watcher: {e}")))?;

    // Watch the parent directory to catch file replacements.
    let watch_path = path.parent().filter(|p| !p.as_os_str().is_empty());
    let watch_path = watch_path.unwrap_or(path);
    watcher
        .watch(watch_path, RecursiveMode::NonRecursive)
        .map_err(|e| ProxyError::config_validation(format!("failed to watch {path:?}: {e}")))?;

    let display_path = path.display().to_string();
    std::thread::spawn(move || {
        loop {
            match rx.recv() {
                Ok(()) => {
                    // Debounce: absorb further events until writes settle.
                    loop {
                        match rx.recv_timeout(DEBOUNCE) {
                            Ok(()) => continue,
                            Err(mpsc::RecvTimeoutError::Timeout) => break,
                            Err(mpsc::RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    info!(path = %display_path, "Manifest changed, reloading");
                    on_change();
                }
                Err(_) => {
                    warn!("Manifest watcher channel closed");
                    return;
                }
            }
        }
    });

    Ok(WatcherHandle { _watcher: watcher })
}
