//! Plugin directory watcher.
//!
//! ```text
//! filesystem events (notify)
//!   → keep content changes to plugin artifacts
//!   → debounce
//!   → PluginHost::rescan
//!
//! retire interval tick
//!   → PluginHost::collect_retired
//! ```
//!
//! Rescans are idempotent, so spurious or duplicated events cost one scan.

use std::sync::Arc;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::registry::PluginHost;
use crate::scanner::classify;

/// Background task that keeps a [`PluginHost`] in sync with its plugin
/// directory. Stops when dropped.
pub struct PluginWatcher {
    task: JoinHandle<()>,
}

impl PluginWatcher {
    /// Start watching `host`'s plugin directory (non-recursively).
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(host: Arc<PluginHost>) -> Result<Self, HostError> {
        let config = host.config().clone();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&config.plugin_dir, RecursiveMode::NonRecursive)?;
        info!(path = %config.plugin_dir.display(), "watching plugin directory");

        let task = tokio::spawn(run(
            host,
            watcher,
            raw_rx,
            config.watch_debounce(),
            config.retire_interval(),
        ));
        Ok(Self { task })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Event loop. `_watcher` is held so filesystem monitoring lasts as long as
/// the task.
async fn run(
    host: Arc<PluginHost>,
    _watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    debounce: Duration,
    retire_interval: Duration,
) {
    let mut pending: Option<Instant> = None;
    let mut retire_tick = tokio::time::interval(retire_interval);
    retire_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = async {
                match pending {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                pending = None;
                if let Err(e) = host.rescan().await {
                    warn!("rescan after directory change failed: {e}");
                }
            }

            event = raw_rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if is_relevant(&event) {
                            debug!(kind = ?event.kind, paths = ?event.paths, "plugin directory changed");
                            pending = Some(Instant::now() + debounce);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "filesystem watcher error"),
                    None => {
                        debug!("filesystem watcher channel closed, stopping");
                        break;
                    }
                }
            }

            _ = retire_tick.tick() => {
                let finished = host.collect_retired().await;
                if !finished.is_empty() {
                    debug!(count = finished.len(), "retired generations collected");
                }
            }
        }
    }
}

/// Content changes to files that look like plugin artifacts.
///
/// Reads and metadata updates are ignored: the scan itself reads every
/// artifact and would otherwise trigger the next rescan.
fn is_relevant(event: &Event) -> bool {
    let content_change = match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        _ => false,
    };
    content_change
        && event.paths.iter().any(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(classify)
                .is_some()
        })
}
